//! Pool configuration

use crate::proxy::checker::{DEFAULT_CHECK_URL, DEFAULT_TIMEOUT_SECS};
use crate::proxy::models::ProxyType;
use std::path::PathBuf;
use std::time::Duration;

/// Default number of simultaneous probes
const DEFAULT_CONCURRENCY: usize = 10;

/// Default delay before a probed entry is queued again
const DEFAULT_COOLDOWN_SECS: u64 = 2;

/// Default directory of the address ledger
const DEFAULT_LEDGER_DIR: &str = "db";

const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Configuration for a proxy pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum probes in flight; `0` lifts the limit
    pub concurrency: usize,
    /// Delay between the end of a probe and the entry's next submission
    pub cooldown: Duration,
    /// Timeout handed to the health checker
    pub probe_timeout: Duration,
    /// Endpoint answering with the caller's address
    pub check_url: String,
    /// Directory holding the address ledger files
    pub ledger_dir: PathBuf,
    /// MaxMind database for country lookups
    pub mmdb_path: Option<PathBuf>,
    /// Scheme assumed for proxy list lines without one
    pub proxy_type: ProxyType,
    /// Capacity of the pool event channel
    pub event_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            cooldown: Duration::from_secs(DEFAULT_COOLDOWN_SECS),
            probe_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            check_url: DEFAULT_CHECK_URL.to_string(),
            ledger_dir: PathBuf::from(DEFAULT_LEDGER_DIR),
            mmdb_path: None,
            proxy_type: ProxyType::Http,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn with_check_url(mut self, url: impl Into<String>) -> Self {
        self.check_url = url.into();
        self
    }

    pub fn with_ledger_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.ledger_dir = dir.into();
        self
    }

    pub fn with_mmdb_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.mmdb_path = Some(path.into());
        self
    }

    pub fn with_proxy_type(mut self, proxy_type: ProxyType) -> Self {
        self.proxy_type = proxy_type;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    /// Slot cap enforced by the scheduler, `None` when unlimited
    pub fn probe_limit(&self) -> Option<usize> {
        (self.concurrency > 0).then_some(self.concurrency)
    }
}
