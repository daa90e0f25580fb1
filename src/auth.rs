//! License verdict consulted before every request

use crate::error::AuthError;
use anyhow::Context;
use chrono::{NaiveDate, Utc};
use serde::Deserialize;
use std::net::IpAddr;
use std::path::Path;

/// Decides whether this host may serve traffic at all
pub trait Authorizer: Send + Sync {
    /// `addresses` are the public addresses of the serving host
    fn authorize(&self, addresses: &[IpAddr]) -> Result<(), AuthError>;
}

/// Used when no license is configured
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn authorize(&self, _addresses: &[IpAddr]) -> Result<(), AuthError> {
        Ok(())
    }
}

/// Decrypted license payload
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct License {
    pub ip_list: Vec<String>,
    /// Last valid day, `YYYY-MM-DD`
    pub date: String,
}

/// Allows traffic while one host address is licensed and the license date
/// has not passed.
#[derive(Debug, Clone)]
pub struct LicenseAuthorizer {
    license: License,
}

impl LicenseAuthorizer {
    pub fn new(license: License) -> Self {
        Self { license }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read license file {}", path.display()))?;
        let license: License = serde_json::from_str(&data)
            .with_context(|| format!("Failed to parse license file {}", path.display()))?;
        Ok(Self::new(license))
    }

    pub fn license(&self) -> &License {
        &self.license
    }

    /// Verdict as of a given day
    pub fn authorize_on(&self, addresses: &[IpAddr], today: NaiveDate) -> Result<(), AuthError> {
        let licensed = addresses
            .iter()
            .any(|addr| self.license.ip_list.iter().any(|ip| *ip == addr.to_string()));
        if !licensed {
            return Err(AuthError::AddressNotLicensed);
        }

        let expires = NaiveDate::parse_from_str(&self.license.date, "%Y-%m-%d")
            .map_err(|_| AuthError::MalformedDate(self.license.date.clone()))?;
        if today > expires {
            return Err(AuthError::Expired(self.license.date.clone()));
        }
        Ok(())
    }
}

impl Authorizer for LicenseAuthorizer {
    fn authorize(&self, addresses: &[IpAddr]) -> Result<(), AuthError> {
        self.authorize_on(addresses, Utc::now().date_naive())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn authorizer(date: &str) -> LicenseAuthorizer {
        LicenseAuthorizer::new(License {
            ip_list: vec!["203.0.113.7".to_string(), "198.51.100.1".to_string()],
            date: date.to_string(),
        })
    }

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn test_allow_all() {
        assert!(AllowAll.authorize(&[]).is_ok());
    }

    #[test]
    fn test_licensed_address_within_date() {
        let addrs = vec!["10.0.0.1".parse().unwrap(), "198.51.100.1".parse().unwrap()];
        assert!(authorizer("2030-01-31").authorize_on(&addrs, day("2030-01-31")).is_ok());
    }

    #[test]
    fn test_unlicensed_address() {
        let addrs = vec!["192.0.2.1".parse().unwrap()];
        assert_eq!(
            authorizer("2030-01-31").authorize_on(&addrs, day("2025-01-01")),
            Err(AuthError::AddressNotLicensed)
        );
        assert_eq!(
            authorizer("2030-01-31").authorize_on(&[], day("2025-01-01")),
            Err(AuthError::AddressNotLicensed)
        );
    }

    #[test]
    fn test_expired_license() {
        let addrs = vec!["203.0.113.7".parse().unwrap()];
        assert_eq!(
            authorizer("2030-01-31").authorize_on(&addrs, day("2030-02-01")),
            Err(AuthError::Expired("2030-01-31".to_string()))
        );
    }

    #[test]
    fn test_malformed_date() {
        let addrs = vec!["203.0.113.7".parse().unwrap()];
        assert_eq!(
            authorizer("31/01/2030").authorize_on(&addrs, day("2025-01-01")),
            Err(AuthError::MalformedDate("31/01/2030".to_string()))
        );
    }

    #[test]
    fn test_load_license_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("license.json");
        std::fs::write(&path, r#"{"ip_list": ["203.0.113.7"], "date": "2030-01-31"}"#).unwrap();

        let auth = LicenseAuthorizer::load(&path).unwrap();
        assert_eq!(auth.license().ip_list, vec!["203.0.113.7"]);
        assert!(LicenseAuthorizer::load(dir.path().join("missing.json")).is_err());
    }
}
