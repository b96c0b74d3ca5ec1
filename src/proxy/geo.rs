//! Country lookup for exit addresses using MMDB

use crate::Result;
use maxminddb::{geoip2, Reader};
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

/// Country code recorded when an address cannot be resolved
pub const UNKNOWN_COUNTRY: &str = "uu";

/// Maps an exit address to a lowercase ISO 3166-1 alpha-2 country code
pub trait GeoResolver: Send + Sync {
    /// `None` when the address is not in the database
    fn lookup(&self, address: IpAddr) -> Option<String>;
}

/// Resolver used when no database is configured
#[derive(Debug, Clone, Copy, Default)]
pub struct NoGeo;

impl GeoResolver for NoGeo {
    fn lookup(&self, _address: IpAddr) -> Option<String> {
        None
    }
}

/// GeoLocator for looking up IP addresses in MMDB databases
pub struct GeoLocator {
    reader: Arc<Reader<Vec<u8>>>,
}

impl GeoLocator {
    /// Create a new GeoLocator from an MMDB file path
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = Reader::open_readfile(path)?;
        Ok(Self {
            reader: Arc::new(reader),
        })
    }

    /// Look up the ISO country code for an IpAddr
    pub fn country_code(&self, ip: IpAddr) -> Result<Option<String>> {
        let lookup_result = self.reader.lookup(ip)?;

        let city: Option<geoip2::City> = lookup_result.decode()?;

        Ok(city.and_then(|city| city.country.iso_code.map(|code| code.to_lowercase())))
    }
}

impl GeoResolver for GeoLocator {
    fn lookup(&self, address: IpAddr) -> Option<String> {
        match self.country_code(address) {
            Ok(code) => code,
            Err(e) => {
                tracing::debug!(%address, error = %e, "geo lookup failed");
                None
            }
        }
    }
}

impl Clone for GeoLocator {
    fn clone(&self) -> Self {
        Self {
            reader: Arc::clone(&self.reader),
        }
    }
}

/// Resolve a country code, falling back to [`UNKNOWN_COUNTRY`]
pub fn resolve_country(resolver: &dyn GeoResolver, address: IpAddr) -> String {
    resolver
        .lookup(address)
        .filter(|code| !code.is_empty())
        .unwrap_or_else(|| UNKNOWN_COUNTRY.to_string())
}
