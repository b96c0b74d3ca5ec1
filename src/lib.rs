//! Proxy Pool - self-checking pool of HTTP forward proxies
//!
//! Every loaded proxy is probed for liveness and its exit address forever,
//! with a cap on simultaneous probes. Consumers allocate free proxies and
//! observe pool events, and exit addresses consumed in earlier sessions are
//! recognized through an address ledger.
//!
//! ```no_run
//! use proxy_pool::{PoolConfig, ProxyPool};
//!
//! # async fn run() -> proxy_pool::Result<()> {
//! proxy_pool::init_logger();
//! let pool = ProxyPool::open(PoolConfig::new().with_concurrency(4)).await?;
//! pool.load_file("proxies.txt")?;
//! let mut events = pool.subscribe();
//! while let Ok(event) = events.recv().await {
//!     println!("{} {}", event.kind, event.entry.descriptor());
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod ledger;
pub mod pool;
pub mod proxy;

pub use config::PoolConfig;
pub use error::{LedgerError, ParseError, ParseErrorKind, PoolError};
pub use ledger::{AddressLedger, BucketKey, FileLedger, MemoryLedger};
pub use pool::{
    Collaborators, EntrySnapshot, EventKind, LoadReport, PoolEvent, ProxyEntry, ProxyPool,
};
pub use proxy::*;

/// Application result type
pub type Result<T> = anyhow::Result<T>;

/// Install a `tracing` subscriber honoring `RUST_LOG`
pub fn init_logger() {
    use tracing_subscriber::{fmt, EnvFilter};

    // A second call keeps the subscriber already installed.
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(true)
        .try_init();
}
