//! IP geolocation.

use std::collections::HashMap;
use std::net::IpAddr;

use crate::error::LocateError;
use crate::routing::Location;

/// Resolves a client IP to a location
pub trait IpLocator: Send + Sync {
    /// Locate `ip`.
    ///
    /// # Errors
    ///
    /// Returns [`LocateError`] when the address is unknown or the backend fails.
    fn locate(&self, ip: IpAddr) -> Result<Location, LocateError>;
}

/// Locator answering from a fixed table with an optional fallback
#[derive(Debug, Clone, Default)]
pub struct StaticIpLocator {
    entries: HashMap<IpAddr, Location>,
    fallback: Option<Location>,
}

impl StaticIpLocator {
    /// Empty table; every lookup fails
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every unknown address with `location`
    #[must_use]
    pub fn with_fallback(location: Location) -> Self {
        Self {
            entries: HashMap::new(),
            fallback: Some(location),
        }
    }

    /// Add or replace an entry
    pub fn insert(&mut self, ip: IpAddr, location: Location) {
        self.entries.insert(ip, location);
    }
}

impl IpLocator for StaticIpLocator {
    fn locate(&self, ip: IpAddr) -> Result<Location, LocateError> {
        self.entries
            .get(&ip)
            .or(self.fallback.as_ref())
            .cloned()
            .ok_or(LocateError::NotFound(ip))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_locator() {
        let ip: IpAddr = "203.0.113.9".parse().unwrap();
        let mut locator = StaticIpLocator::new();
        assert_eq!(locator.locate(ip), Err(LocateError::NotFound(ip)));

        let home = Location {
            latitude: 51.5,
            longitude: -0.1,
            isp: "BT".into(),
            asn: 2856,
        };
        locator.insert(ip, home.clone());
        assert_eq!(locator.locate(ip).unwrap(), home);

        let anywhere = StaticIpLocator::with_fallback(home.clone());
        assert_eq!(anywhere.locate("10.1.1.1".parse().unwrap()).unwrap(), home);
    }
}
