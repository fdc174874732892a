//! GeoIP service: resolves client IPs to region codes, hot-reloadable
//! without a restart.

use std::fs;
use std::net::IpAddr;
use std::sync::RwLock;

use serde::Deserialize;

use crate::error::{AppError, Result};

/// Region reported when no database entry matches.
pub const UNKNOWN_REGION: &str = "None";

#[derive(Debug, Deserialize)]
struct GeoIpRecord {
    network: String,
    region: String,
}

// IPv4 networks are held v4-mapped so one u128 comparison covers both
// families.
struct CidrEntry {
    base: u128,
    prefix_len: u8,
    region: String,
}

impl CidrEntry {
    fn parse(record: GeoIpRecord) -> Result<Self> {
        let invalid =
            || AppError::Config(format!("invalid GeoIP network {:?}", record.network));

        let (address, prefix) = record.network.split_once('/').ok_or_else(invalid)?;
        let address: IpAddr = address.parse().map_err(|_| invalid())?;
        let prefix: u8 = prefix.parse().map_err(|_| invalid())?;

        let (base, prefix_len) = match address {
            IpAddr::V4(_) => {
                if prefix > 32 {
                    return Err(invalid());
                }
                (ip_to_u128(address), prefix + 96)
            }
            IpAddr::V6(_) => {
                if prefix > 128 {
                    return Err(invalid());
                }
                (ip_to_u128(address), prefix)
            }
        };

        let mask = prefix_mask(prefix_len);
        Ok(CidrEntry {
            base: base & mask,
            prefix_len,
            region: record.region,
        })
    }

    fn matches(&self, key: u128) -> bool {
        key & prefix_mask(self.prefix_len) == self.base
    }
}

fn prefix_mask(prefix_len: u8) -> u128 {
    if prefix_len == 0 {
        0
    } else {
        u128::MAX << (128 - prefix_len as u32)
    }
}

fn ip_to_u128(ip: IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => (0xffff_u128 << 32) | u128::from(u32::from(v4)),
        IpAddr::V6(v6) => u128::from(v6),
    }
}

#[derive(Default)]
struct GeoIpDb {
    entries: Vec<CidrEntry>,
}

pub struct GeoIpService {
    state: RwLock<GeoIpDb>,
}

impl GeoIpService {
    /// Load the database file, or start empty when no file is configured.
    pub fn new(filename: Option<&str>) -> Result<Self> {
        let state = match filename {
            Some(filename) => load_database(filename)?,
            None => GeoIpDb::default(),
        };
        Ok(GeoIpService {
            state: RwLock::new(state),
        })
    }

    /// Replace the database from the file. On failure the previous state
    /// stays in force.
    pub fn reload(&self, filename: &str) -> Result<()> {
        let fresh = load_database(filename)?;
        *self.state.write().expect("geoip lock poisoned") = fresh;
        Ok(())
    }

    /// Longest-prefix match over the loaded networks.
    pub fn lookup(&self, ip: IpAddr) -> String {
        let key = ip_to_u128(ip);
        let state = self.state.read().expect("geoip lock poisoned");
        let mut best: Option<&CidrEntry> = None;
        for entry in &state.entries {
            if entry.matches(key) && best.map_or(true, |b| entry.prefix_len > b.prefix_len) {
                best = Some(entry);
            }
        }
        best.map(|entry| entry.region.clone())
            .unwrap_or_else(|| UNKNOWN_REGION.to_string())
    }
}

fn load_database(filename: &str) -> Result<GeoIpDb> {
    let json = fs::read(filename)?;
    let records: Vec<GeoIpRecord> = serde_json::from_slice(&json)?;
    let entries = records
        .into_iter()
        .map(CidrEntry::parse)
        .collect::<Result<Vec<_>>>()?;
    Ok(GeoIpDb { entries })
}
