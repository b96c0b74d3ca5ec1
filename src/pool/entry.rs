//! Per-proxy state: liveness, allocation and exit address usage

use crate::ledger::{AddressLedger, BucketKey};
use crate::proxy::checker::HealthChecker;
use crate::proxy::geo::{resolve_country, GeoResolver, UNKNOWN_COUNTRY};
use crate::proxy::models::{ProbeOutcome, ProxyDescriptor};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Things that happen to an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Allocated,
    Freed,
    AddressChanged,
    WentAlive,
    WentDead,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Allocated => write!(f, "allocated"),
            EventKind::Freed => write!(f, "freed"),
            EventKind::AddressChanged => write!(f, "address-changed"),
            EventKind::WentAlive => write!(f, "alive"),
            EventKind::WentDead => write!(f, "dead"),
        }
    }
}

/// External services an entry talks to while probing and recording
#[derive(Clone)]
pub struct Collaborators {
    pub checker: Arc<dyn HealthChecker>,
    pub geo: Arc<dyn GeoResolver>,
    pub ledger: Arc<dyn AddressLedger>,
}

impl Collaborators {
    pub fn new(
        checker: Arc<dyn HealthChecker>,
        geo: Arc<dyn GeoResolver>,
        ledger: Arc<dyn AddressLedger>,
    ) -> Self {
        Self {
            checker,
            geo,
            ledger,
        }
    }
}

#[derive(Debug)]
struct EntryState {
    address: Option<IpAddr>,
    alive: bool,
    free: bool,
    usage_recorded: bool,
    poisoned: bool,
    country: String,
    last_checked_at: Option<DateTime<Utc>>,
}

impl Default for EntryState {
    fn default() -> Self {
        Self {
            address: None,
            alive: false,
            free: true,
            usage_recorded: false,
            poisoned: false,
            country: UNKNOWN_COUNTRY.to_string(),
            last_checked_at: None,
        }
    }
}

/// Point-in-time copy of an entry's state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntrySnapshot {
    pub url: String,
    pub address: Option<IpAddr>,
    pub alive: bool,
    pub free: bool,
    pub usage_recorded: bool,
    pub poisoned: bool,
    pub country: String,
    pub last_checked_at: Option<DateTime<Utc>>,
}

type Listener = Box<dyn Fn(EventKind) + Send + Sync>;

/// One tracked proxy.
///
/// Identity (`descriptor`, `url`) is fixed at construction. Everything else
/// lives behind a lock and changes through [`allocate`](Self::allocate),
/// [`release`](Self::release), [`poison`](Self::poison),
/// [`record_usage_if_needed`](Self::record_usage_if_needed) and the pool's
/// probes. Listeners run after the lock is released.
pub struct ProxyEntry {
    descriptor: ProxyDescriptor,
    url: String,
    collaborators: Arc<Collaborators>,
    probe_timeout: Duration,
    state: Mutex<EntryState>,
    listeners: RwLock<Vec<Listener>>,
}

impl ProxyEntry {
    pub(crate) fn new(
        descriptor: ProxyDescriptor,
        collaborators: Arc<Collaborators>,
        probe_timeout: Duration,
    ) -> Self {
        let url = descriptor.url();
        Self {
            descriptor,
            url,
            collaborators,
            probe_timeout,
            state: Mutex::new(EntryState::default()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn descriptor(&self) -> &ProxyDescriptor {
        &self.descriptor
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn host(&self) -> &str {
        &self.descriptor.host
    }

    pub fn port(&self) -> u16 {
        self.descriptor.port
    }

    pub fn username(&self) -> Option<&str> {
        self.descriptor.auth.as_ref().map(|auth| auth.username.as_str())
    }

    pub fn password(&self) -> Option<&str> {
        self.descriptor.auth.as_ref().map(|auth| auth.password.as_str())
    }

    /// Last exit address seen by a successful probe
    pub fn address(&self) -> Option<IpAddr> {
        self.state.lock().address
    }

    pub fn is_alive(&self) -> bool {
        self.state.lock().alive
    }

    pub fn is_free(&self) -> bool {
        self.state.lock().free
    }

    /// Whether the current address is already in the ledger
    pub fn is_usage_recorded(&self) -> bool {
        self.state.lock().usage_recorded
    }

    pub fn is_poisoned(&self) -> bool {
        self.state.lock().poisoned
    }

    pub fn country(&self) -> String {
        self.state.lock().country.clone()
    }

    pub fn last_checked_at(&self) -> Option<DateTime<Utc>> {
        self.state.lock().last_checked_at
    }

    pub fn snapshot(&self) -> EntrySnapshot {
        let state = self.state.lock();
        EntrySnapshot {
            url: self.url.clone(),
            address: state.address,
            alive: state.alive,
            free: state.free,
            usage_recorded: state.usage_recorded,
            poisoned: state.poisoned,
            country: state.country.clone(),
            last_checked_at: state.last_checked_at,
        }
    }

    /// Register a listener for this entry's events.
    ///
    /// Listeners must not call `subscribe` themselves.
    pub fn subscribe<F>(&self, listener: F)
    where
        F: Fn(EventKind) + Send + Sync + 'static,
    {
        self.listeners.write().push(Box::new(listener));
    }

    fn emit(&self, kind: EventKind) {
        for listener in self.listeners.read().iter() {
            listener(kind);
        }
    }

    /// Mark the entry as handed out. Allocating twice is not an error.
    pub async fn allocate(&self) {
        self.state.lock().free = false;
        self.finish_allocation().await;
    }

    /// Flip `free` only if it is still set; used by the pool's scan.
    pub(crate) fn try_claim(&self) -> bool {
        let mut state = self.state.lock();
        if state.free {
            state.free = false;
            true
        } else {
            false
        }
    }

    pub(crate) async fn finish_allocation(&self) {
        self.record_usage_if_needed().await;
        debug!(proxy = %self.descriptor, "allocated");
        self.emit(EventKind::Allocated);
    }

    pub fn release(&self) {
        self.state.lock().free = true;
        debug!(proxy = %self.descriptor, "freed");
        self.emit(EventKind::Freed);
    }

    /// Flag the current exit address as untrustworthy.
    ///
    /// The flag belongs to one exit address, not to the proxy: it stays set
    /// for as long as probes keep observing that address and is cleared once
    /// a probe observes a different one. It never affects allocation or
    /// usage recording.
    pub fn poison(&self) {
        self.state.lock().poisoned = true;
        info!(proxy = %self.descriptor, address = ?self.address(), "exit address poisoned");
    }

    /// Append the current address to the ledger unless it is already there.
    ///
    /// Returns `true` when this call wrote the record. The flag is claimed
    /// before the write, so concurrent callers append at most once; a failed
    /// write gives the claim back for a later retry.
    pub async fn record_usage_if_needed(&self) -> bool {
        let address = {
            let mut state = self.state.lock();
            let current = state.address;
            match current {
                Some(address) if !state.usage_recorded => {
                    state.usage_recorded = true;
                    address
                }
                _ => return false,
            }
        };

        let bucket = BucketKey::for_address(address);
        match self.collaborators.ledger.append(&bucket, address).await {
            Ok(()) => {
                debug!(proxy = %self.descriptor, %address, %bucket, "address usage recorded");
                true
            }
            Err(e) => {
                warn!(proxy = %self.descriptor, %address, error = %e, "failed to record address usage");
                let mut state = self.state.lock();
                if state.address == Some(address) {
                    state.usage_recorded = false;
                }
                false
            }
        }
    }

    async fn seen_before(&self, address: IpAddr) -> bool {
        let bucket = BucketKey::for_address(address);
        match self.collaborators.ledger.has(&bucket, address).await {
            Ok(seen) => seen,
            Err(e) => {
                warn!(proxy = %self.descriptor, %address, error = %e, "address ledger lookup failed");
                false
            }
        }
    }

    /// Run one liveness check and fold the result into the entry.
    ///
    /// Only the scheduler calls this, and never twice at once for the same
    /// entry. A failed probe updates liveness and the check time but keeps
    /// the last known address.
    pub(crate) async fn probe(&self) -> ProbeOutcome {
        let outcome = self
            .collaborators
            .checker
            .check(&self.descriptor, self.probe_timeout)
            .await;
        let alive_now = outcome.is_alive();

        let current = self.state.lock().address;
        let fresh = outcome.address().filter(|observed| Some(*observed) != current);

        // Everything about a new address is looked up before it is published.
        let resolved = match fresh {
            Some(address) => {
                let country = resolve_country(self.collaborators.geo.as_ref(), address);
                let seen = self.seen_before(address).await;
                Some((address, country, seen))
            }
            None => None,
        };

        let (was_alive, allocated) = {
            let mut state = self.state.lock();
            let was_alive = state.alive;
            state.alive = alive_now;
            state.last_checked_at = Some(Utc::now());
            if let Some((address, country, seen)) = &resolved {
                state.address = Some(*address);
                state.country = country.clone();
                state.usage_recorded = *seen;
                state.poisoned = false;
            }
            (was_alive, !state.free)
        };

        debug!(proxy = %self.descriptor, %outcome, "probe finished");

        if let Some((address, country, seen)) = resolved {
            info!(proxy = %self.descriptor, %address, %country, seen, "exit address changed");
            if allocated {
                self.record_usage_if_needed().await;
            }
            self.emit(EventKind::AddressChanged);
        }

        if alive_now != was_alive {
            if alive_now {
                info!(proxy = %self.descriptor, "proxy went alive");
                self.emit(EventKind::WentAlive);
            } else {
                info!(proxy = %self.descriptor, "proxy went dead");
                self.emit(EventKind::WentDead);
            }
        }

        outcome
    }
}

impl fmt::Debug for ProxyEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyEntry")
            .field("proxy", &self.descriptor.to_string())
            .field("state", &*self.state.lock())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::LedgerError;
    use crate::ledger::MemoryLedger;
    use crate::proxy::models::ProxyType;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Replays canned outcomes, then keeps failing
    #[derive(Default)]
    pub(crate) struct ScriptedChecker {
        outcomes: Mutex<VecDeque<ProbeOutcome>>,
    }

    impl ScriptedChecker {
        pub(crate) fn push(&self, outcome: ProbeOutcome) {
            self.outcomes.lock().push_back(outcome);
        }
    }

    #[async_trait]
    impl HealthChecker for ScriptedChecker {
        async fn check(&self, _proxy: &ProxyDescriptor, _timeout: Duration) -> ProbeOutcome {
            self.outcomes
                .lock()
                .pop_front()
                .unwrap_or_else(|| ProbeOutcome::failed("connection refused"))
        }
    }

    pub(crate) struct FixedGeo(pub &'static str);

    impl GeoResolver for FixedGeo {
        fn lookup(&self, _address: IpAddr) -> Option<String> {
            Some(self.0.to_string())
        }
    }

    /// Ledger that errors while `broken` is set
    #[derive(Default)]
    struct FlakyLedger {
        broken: AtomicBool,
        inner: MemoryLedger,
    }

    #[async_trait]
    impl AddressLedger for FlakyLedger {
        async fn has(&self, bucket: &BucketKey, address: IpAddr) -> Result<bool, LedgerError> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(LedgerError::InvalidRecord("disk on fire".to_string()));
            }
            self.inner.has(bucket, address).await
        }

        async fn append(&self, bucket: &BucketKey, address: IpAddr) -> Result<(), LedgerError> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(LedgerError::InvalidRecord("disk on fire".to_string()));
            }
            self.inner.append(bucket, address).await
        }
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn observed(s: &str) -> ProbeOutcome {
        ProbeOutcome::observed(ip(s), 42)
    }

    struct Harness {
        entry: ProxyEntry,
        checker: Arc<ScriptedChecker>,
        events: Arc<Mutex<Vec<EventKind>>>,
    }

    impl Harness {
        fn new(ledger: Arc<dyn AddressLedger>) -> Self {
            let checker = Arc::new(ScriptedChecker::default());
            let collaborators = Arc::new(Collaborators::new(
                checker.clone(),
                Arc::new(FixedGeo("de")),
                ledger,
            ));
            let entry = ProxyEntry::new(
                ProxyDescriptor::new("10.0.0.1", 3128, ProxyType::Http),
                collaborators,
                Duration::from_secs(10),
            );
            let events = Arc::new(Mutex::new(Vec::new()));
            let sink = events.clone();
            entry.subscribe(move |kind| sink.lock().push(kind));
            Self {
                entry,
                checker,
                events,
            }
        }

        fn drain_events(&self) -> Vec<EventKind> {
            std::mem::take(&mut *self.events.lock())
        }
    }

    #[test]
    fn test_new_entry_state() {
        let h = Harness::new(Arc::new(MemoryLedger::new()));
        let entry = &h.entry;
        assert_eq!(entry.url(), "http://10.0.0.1:3128");
        assert_eq!(entry.host(), "10.0.0.1");
        assert_eq!(entry.port(), 3128);
        assert_eq!(entry.username(), None);
        assert_eq!(entry.address(), None);
        assert!(!entry.is_alive());
        assert!(entry.is_free());
        assert!(!entry.is_usage_recorded());
        assert_eq!(entry.country(), UNKNOWN_COUNTRY);
        assert!(entry.last_checked_at().is_none());
    }

    #[tokio::test]
    async fn test_successful_probe_sets_address() {
        let h = Harness::new(Arc::new(MemoryLedger::new()));
        h.checker.push(observed("203.0.113.7"));

        let outcome = h.entry.probe().await;

        assert!(outcome.is_alive());
        assert_eq!(h.entry.address(), Some(ip("203.0.113.7")));
        assert!(h.entry.is_alive());
        assert!(!h.entry.is_usage_recorded());
        assert_eq!(h.entry.country(), "de");
        assert!(h.entry.last_checked_at().is_some());
        assert_eq!(
            h.drain_events(),
            vec![EventKind::AddressChanged, EventKind::WentAlive]
        );
    }

    #[tokio::test]
    async fn test_failed_probe_keeps_address_and_usage() {
        let ledger = Arc::new(MemoryLedger::new());
        let h = Harness::new(ledger.clone());
        h.checker.push(observed("203.0.113.7"));
        h.entry.probe().await;
        assert!(h.entry.record_usage_if_needed().await);
        let checked_first = h.entry.last_checked_at().unwrap();
        h.drain_events();

        h.checker.push(ProbeOutcome::Timeout);
        let outcome = h.entry.probe().await;

        assert!(!outcome.is_alive());
        assert!(!h.entry.is_alive());
        assert_eq!(h.entry.address(), Some(ip("203.0.113.7")));
        assert!(h.entry.is_usage_recorded());
        assert!(h.entry.last_checked_at().unwrap() >= checked_first);
        assert_eq!(h.drain_events(), vec![EventKind::WentDead]);
    }

    #[tokio::test]
    async fn test_unchanged_address_emits_nothing() {
        let h = Harness::new(Arc::new(MemoryLedger::new()));
        h.checker.push(observed("203.0.113.7"));
        h.checker.push(observed("203.0.113.7"));
        h.entry.probe().await;
        h.drain_events();

        h.entry.probe().await;
        assert!(h.drain_events().is_empty());
    }

    #[tokio::test]
    async fn test_new_address_resets_usage() {
        let ledger = Arc::new(MemoryLedger::new());
        let h = Harness::new(ledger.clone());
        h.checker.push(observed("203.0.113.7"));
        h.entry.probe().await;
        h.entry.record_usage_if_needed().await;
        assert!(h.entry.is_usage_recorded());

        h.checker.push(observed("198.51.100.9"));
        h.entry.probe().await;

        assert_eq!(h.entry.address(), Some(ip("198.51.100.9")));
        assert!(!h.entry.is_usage_recorded());
        assert!(h.entry.record_usage_if_needed().await);
        assert!(h.entry.is_usage_recorded());
        assert_eq!(ledger.len(), 2);
    }

    #[tokio::test]
    async fn test_address_known_to_ledger_counts_as_recorded() {
        let ledger = Arc::new(MemoryLedger::with_addresses([ip("203.0.113.7")]));
        let h = Harness::new(ledger.clone());
        h.checker.push(observed("203.0.113.7"));

        h.entry.probe().await;

        assert!(h.entry.is_usage_recorded());
        assert!(!h.entry.record_usage_if_needed().await);
        assert_eq!(ledger.len(), 1);
    }

    #[tokio::test]
    async fn test_allocated_entry_records_new_address_immediately() {
        let ledger = Arc::new(MemoryLedger::new());
        let h = Harness::new(ledger.clone());
        h.entry.allocate().await;
        assert!(ledger.is_empty());

        h.checker.push(observed("203.0.113.7"));
        h.entry.probe().await;

        assert!(h.entry.is_usage_recorded());
        assert_eq!(
            ledger.records(&BucketKey::for_address(ip("203.0.113.7"))),
            vec![ip("203.0.113.7")]
        );
    }

    #[tokio::test]
    async fn test_recording_twice_appends_once() {
        let ledger = Arc::new(MemoryLedger::new());
        let h = Harness::new(ledger.clone());
        h.checker.push(observed("203.0.113.7"));
        h.entry.probe().await;

        assert!(h.entry.record_usage_if_needed().await);
        assert!(!h.entry.record_usage_if_needed().await);
        h.entry.allocate().await;
        assert_eq!(ledger.len(), 1);
    }

    #[tokio::test]
    async fn test_recording_without_address_is_noop() {
        let ledger = Arc::new(MemoryLedger::new());
        let h = Harness::new(ledger.clone());

        assert!(!h.entry.record_usage_if_needed().await);
        assert!(!h.entry.is_usage_recorded());
        assert!(ledger.is_empty());
    }

    #[tokio::test]
    async fn test_allocate_and_release() {
        let h = Harness::new(Arc::new(MemoryLedger::new()));

        h.entry.allocate().await;
        assert!(!h.entry.is_free());
        h.entry.allocate().await;
        assert!(!h.entry.is_free());
        h.entry.release();
        assert!(h.entry.is_free());

        assert_eq!(
            h.drain_events(),
            vec![EventKind::Allocated, EventKind::Allocated, EventKind::Freed]
        );
    }

    #[tokio::test]
    async fn test_try_claim_only_once() {
        let h = Harness::new(Arc::new(MemoryLedger::new()));
        assert!(h.entry.try_claim());
        assert!(!h.entry.try_claim());
        assert!(!h.entry.is_free());
    }

    #[tokio::test]
    async fn test_poison_is_per_address() {
        let h = Harness::new(Arc::new(MemoryLedger::new()));
        h.checker.push(observed("203.0.113.7"));
        h.checker.push(observed("203.0.113.7"));
        h.checker.push(observed("198.51.100.9"));
        h.entry.probe().await;

        h.entry.poison();
        assert!(h.entry.is_poisoned());
        assert!(h.entry.is_free());
        assert!(h.entry.is_alive());

        // Same exit address: still poisoned.
        h.entry.probe().await;
        assert!(h.entry.is_poisoned());

        h.entry.probe().await;
        assert!(!h.entry.is_poisoned());
    }

    #[tokio::test]
    async fn test_ledger_failures_are_not_fatal() {
        let ledger = Arc::new(FlakyLedger::default());
        ledger.broken.store(true, Ordering::SeqCst);
        let h = Harness::new(ledger.clone());
        h.entry.allocate().await;

        h.checker.push(observed("203.0.113.7"));
        let outcome = h.entry.probe().await;
        assert!(outcome.is_alive());
        assert_eq!(h.entry.address(), Some(ip("203.0.113.7")));
        assert!(!h.entry.is_usage_recorded());

        ledger.broken.store(false, Ordering::SeqCst);
        assert!(h.entry.record_usage_if_needed().await);
        assert!(h.entry.is_usage_recorded());
        assert_eq!(ledger.inner.len(), 1);
    }

    #[tokio::test]
    async fn test_snapshot() {
        let h = Harness::new(Arc::new(MemoryLedger::new()));
        h.checker.push(observed("203.0.113.7"));
        h.entry.probe().await;

        let snapshot = h.entry.snapshot();
        assert_eq!(snapshot.url, "http://10.0.0.1:3128");
        assert_eq!(snapshot.address, Some(ip("203.0.113.7")));
        assert!(snapshot.alive);
        assert!(snapshot.free);
        assert_eq!(snapshot.country, "de");
    }
}
