//! Proxy pool: deduplicated entries, perpetual health probes, allocation
//!
//! Entries are loaded once and probed for the life of the pool by an internal
//! scheduler that owns every probe, so an entry never has two in flight.
//! Each entry's events are re-broadcast at pool scope as [`PoolEvent`]s
//! carrying the entry itself.
//!
//! The scheduler is not part of the public API:
//!
//! ```compile_fail
//! use proxy_pool::pool::scheduler::ProbeScheduler;
//! ```

pub mod entry;
mod scheduler;

pub use entry::{Collaborators, EntrySnapshot, EventKind, ProxyEntry};

use scheduler::ProbeScheduler;

use crate::config::PoolConfig;
use crate::error::{ParseError, PoolError};
use crate::ledger::FileLedger;
use crate::proxy::checker::{CheckerConfig, HttpHealthChecker};
use crate::proxy::geo::{GeoLocator, GeoResolver, NoGeo};
use crate::proxy::models::ProxyDescriptor;
use crate::proxy::parser::ProxyParser;
use crate::Result;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// An entry event, re-emitted by the pool
#[derive(Debug, Clone)]
pub struct PoolEvent {
    pub kind: EventKind,
    pub entry: Arc<ProxyEntry>,
}

/// Outcome of loading a batch of proxies
#[derive(Debug, Default)]
pub struct LoadReport {
    /// Entries added to the pool
    pub added: usize,
    /// Descriptors skipped because their URL was already loaded
    pub duplicates: usize,
    /// Lines of a proxy list that could not be parsed
    pub errors: Vec<ParseError>,
}

#[derive(Debug, Default)]
struct Entries {
    list: Vec<Arc<ProxyEntry>>,
    urls: HashSet<String>,
}

/// Pool of self-checking proxies
pub struct ProxyPool {
    config: PoolConfig,
    collaborators: Arc<Collaborators>,
    entries: RwLock<Entries>,
    scheduler: Arc<ProbeScheduler>,
    events: broadcast::Sender<PoolEvent>,
}

impl ProxyPool {
    /// Create a pool around the given collaborators
    pub fn new(config: PoolConfig, collaborators: Collaborators) -> Self {
        let scheduler = ProbeScheduler::new(config.probe_limit(), config.cooldown);
        let (events, _) = broadcast::channel(config.event_capacity.max(1));

        Self {
            config,
            collaborators: Arc::new(collaborators),
            entries: RwLock::new(Entries::default()),
            scheduler,
            events,
        }
    }

    /// Create a pool using the HTTP health checker, the flat-file ledger in
    /// `config.ledger_dir` and, if configured, a MaxMind country database
    pub async fn open(config: PoolConfig) -> Result<Self> {
        let checker = HttpHealthChecker::new(
            CheckerConfig::new().with_check_url(config.check_url.clone()),
        );
        let ledger = FileLedger::open(&config.ledger_dir).await?;
        let geo: Arc<dyn GeoResolver> = match &config.mmdb_path {
            Some(path) => Arc::new(GeoLocator::from_path(path)?),
            None => Arc::new(NoGeo),
        };

        info!(
            concurrency = config.concurrency,
            ledger = %config.ledger_dir.display(),
            check_url = %config.check_url,
            "proxy pool opened"
        );

        Ok(Self::new(
            config,
            Collaborators::new(Arc::new(checker), geo, Arc::new(ledger)),
        ))
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Add proxies to the pool and schedule their first probe.
    ///
    /// Descriptors whose URL is already present are skipped. Probes run on
    /// the current tokio runtime; without one nothing is loaded and
    /// [`PoolError::NoRuntime`] is returned.
    pub fn load<I>(&self, descriptors: I) -> std::result::Result<LoadReport, PoolError>
    where
        I: IntoIterator<Item = ProxyDescriptor>,
    {
        tokio::runtime::Handle::try_current().map_err(|_| PoolError::NoRuntime)?;
        let mut report = LoadReport::default();

        for descriptor in descriptors {
            let entry = Arc::new(ProxyEntry::new(
                descriptor,
                Arc::clone(&self.collaborators),
                self.config.probe_timeout,
            ));

            {
                let mut entries = self.entries.write();
                if !entries.urls.insert(entry.url().to_string()) {
                    debug!(proxy = %entry.descriptor(), "duplicate proxy skipped");
                    report.duplicates += 1;
                    continue;
                }
                entries.list.push(Arc::clone(&entry));
            }

            self.forward_events(&entry);
            self.scheduler.submit(entry);
            report.added += 1;
        }

        info!(
            added = report.added,
            duplicates = report.duplicates,
            total = self.len(),
            "proxies loaded"
        );
        Ok(report)
    }

    /// Parse a proxy list file and load every valid line.
    ///
    /// Malformed lines are logged and returned in the report.
    pub fn load_file<P: AsRef<Path>>(&self, path: P) -> std::result::Result<LoadReport, PoolError> {
        let parsed = ProxyParser::parse_file(path.as_ref(), self.config.proxy_type)?;
        for error in &parsed.errors {
            warn!(file = %path.as_ref().display(), %error, "skipping malformed proxy line");
        }

        let mut report = self.load(parsed.descriptors)?;
        report.errors = parsed.errors;
        Ok(report)
    }

    fn forward_events(&self, entry: &Arc<ProxyEntry>) {
        let origin: Weak<ProxyEntry> = Arc::downgrade(entry);
        let events = self.events.clone();
        entry.subscribe(move |kind| {
            if let Some(entry) = origin.upgrade() {
                // No subscribers is fine.
                let _ = events.send(PoolEvent { kind, entry });
            }
        });
    }

    /// Receive every entry event from now on
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    /// Allocate the first free entry in load order
    pub async fn allocate_any(&self) -> std::result::Result<Arc<ProxyEntry>, PoolError> {
        let claimed = self
            .entries
            .read()
            .list
            .iter()
            .find(|entry| entry.try_claim())
            .cloned();

        match claimed {
            Some(entry) => {
                entry.finish_allocation().await;
                Ok(entry)
            }
            None => Err(PoolError::NoFreeProxy),
        }
    }

    /// First free entry in load order, without allocating it
    pub fn find_free(&self) -> Option<Arc<ProxyEntry>> {
        self.entries
            .read()
            .list
            .iter()
            .find(|entry| entry.is_free())
            .cloned()
    }

    pub fn get(&self, url: &str) -> Option<Arc<ProxyEntry>> {
        self.entries
            .read()
            .list
            .iter()
            .find(|entry| entry.url() == url)
            .cloned()
    }

    /// All entries in load order
    pub fn entries(&self) -> Vec<Arc<ProxyEntry>> {
        self.entries.read().list.clone()
    }

    pub fn snapshot(&self) -> Vec<EntrySnapshot> {
        self.entries
            .read()
            .list
            .iter()
            .map(|entry| entry.snapshot())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Probes currently in flight
    pub fn active_probes(&self) -> usize {
        self.scheduler.active()
    }

    /// Entries waiting for a probe slot
    pub fn queued_probes(&self) -> usize {
        self.scheduler.queued()
    }
}
