use std::net::IpAddr;

use maxminddb::Reader;
use tracing::{info, warn};

pub struct GeoFenceManager {
    reader: Option<Reader<Vec<u8>>>,
}

impl Default for GeoFenceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl GeoFenceManager {
    pub fn new() -> Self {
        // In a production environment, the MaxMind GeoLite2-Country.mmdb 
        // would be downloaded during the CI/CD build or provided via a volume mount.
        let db_path = "GeoLite2-Country.mmdb";
        
        let reader = match Reader::open_readfile(db_path) {
            Ok(r) => {
                info!("Successfully loaded MaxMind Geofencing database from {}", db_path);
                Some(r)
            },
            Err(e) => {
                warn!("MaxMind Geofencing database not found at {}: {}. Mapping will fallback to Global.", db_path, e);
                None
            }
        };

        Self { reader }
    }

    /// Returns the ISO country code (e.g., "US", "DE", "IN") for a given IP address.
    /// Falls back to "XX" (Unknown/Global) if the database is missing or the IP is not found.
    pub fn get_country_code(&self, ip: IpAddr) -> String {
        let reader = match &self.reader {
            Some(r) => r,
            None => return "XX".to_string(), // Global fallback
        };

        match reader.lookup::<maxminddb::geoip2::Country>(ip) {
            Ok(country) => {
                country.country
                    .and_then(|c| c.iso_code)
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "XX".to_string())
            },
            Err(_) => "XX".to_string(),
        }
    }

}
