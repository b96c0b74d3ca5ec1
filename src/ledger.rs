//! Record of exit addresses already consumed in earlier sessions
//!
//! Addresses are grouped into buckets by their first two components so a
//! membership query only reads a small slice of the history. The file
//! backend keeps one `<a>-<b>.txt` file per bucket, one address per line.

use crate::error::LedgerError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::io::ErrorKind;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

/// Coarse grouping key for an address: its first two components
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BucketKey(String);

impl BucketKey {
    pub fn for_address(address: IpAddr) -> Self {
        match address {
            IpAddr::V4(v4) => {
                let octets = v4.octets();
                BucketKey(format!("{}-{}", octets[0], octets[1]))
            }
            IpAddr::V6(v6) => {
                let segments = v6.segments();
                BucketKey(format!("{:x}-{:x}", segments[0], segments[1]))
            }
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Append-only set of consumed addresses, queried per bucket.
///
/// `append` must tolerate concurrent callers.
#[async_trait]
pub trait AddressLedger: Send + Sync {
    async fn has(&self, bucket: &BucketKey, address: IpAddr) -> Result<bool, LedgerError>;

    async fn append(&self, bucket: &BucketKey, address: IpAddr) -> Result<(), LedgerError>;
}

/// Flat-file ledger, one text file per bucket
#[derive(Debug)]
pub struct FileLedger {
    dir: PathBuf,
    // Serializes appends from this process.
    write_lock: tokio::sync::Mutex<()>,
}

impl FileLedger {
    /// Open a ledger rooted at `dir`, creating the directory if needed
    pub async fn open<P: AsRef<Path>>(dir: P) -> Result<Self, LedgerError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .await
            .map_err(|source| LedgerError::Io {
                bucket: dir.display().to_string(),
                source,
            })?;

        Ok(Self {
            dir,
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn bucket_path(&self, bucket: &BucketKey) -> PathBuf {
        self.dir.join(format!("{}.txt", bucket))
    }
}

#[async_trait]
impl AddressLedger for FileLedger {
    async fn has(&self, bucket: &BucketKey, address: IpAddr) -> Result<bool, LedgerError> {
        let content = match fs::read_to_string(self.bucket_path(bucket)).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(source) => {
                return Err(LedgerError::Io {
                    bucket: bucket.to_string(),
                    source,
                })
            }
        };

        let needle = address.to_string();
        Ok(content.lines().any(|line| line.trim() == needle))
    }

    async fn append(&self, bucket: &BucketKey, address: IpAddr) -> Result<(), LedgerError> {
        let io_err = |source: std::io::Error| LedgerError::Io {
            bucket: bucket.to_string(),
            source,
        };

        let _guard = self.write_lock.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.bucket_path(bucket))
            .await
            .map_err(io_err)?;

        file.write_all(format!("{}\n", address).as_bytes())
            .await
            .map_err(io_err)?;
        file.sync_data().await.map_err(io_err)?;

        Ok(())
    }
}

/// In-process ledger, for pools that need no history across restarts
#[derive(Debug, Default)]
pub struct MemoryLedger {
    buckets: Mutex<HashMap<BucketKey, Vec<IpAddr>>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate with addresses consumed earlier
    pub fn with_addresses<I: IntoIterator<Item = IpAddr>>(addresses: I) -> Self {
        let ledger = Self::new();
        {
            let mut buckets = ledger.buckets.lock();
            for address in addresses {
                buckets
                    .entry(BucketKey::for_address(address))
                    .or_default()
                    .push(address);
            }
        }
        ledger
    }

    /// Every record in `bucket`, duplicates included, in append order
    pub fn records(&self, bucket: &BucketKey) -> Vec<IpAddr> {
        self.buckets.lock().get(bucket).cloned().unwrap_or_default()
    }

    /// Total number of records across all buckets
    pub fn len(&self) -> usize {
        self.buckets.lock().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl AddressLedger for MemoryLedger {
    async fn has(&self, bucket: &BucketKey, address: IpAddr) -> Result<bool, LedgerError> {
        Ok(self
            .buckets
            .lock()
            .get(bucket)
            .is_some_and(|records| records.contains(&address)))
    }

    async fn append(&self, bucket: &BucketKey, address: IpAddr) -> Result<(), LedgerError> {
        if &BucketKey::for_address(address) != bucket {
            return Err(LedgerError::InvalidRecord(format!(
                "{} does not belong to bucket {}",
                address, bucket
            )));
        }
        self.buckets
            .lock()
            .entry(bucket.clone())
            .or_default()
            .push(address);
        Ok(())
    }
}
