//! Per-client traffic policy: throughput caps and inactivity limits keyed
//! by client region, hot-reloadable without a restart.

use std::collections::HashMap;
use std::fs;
use std::sync::RwLock;
use std::time::Duration;

use serde::Deserialize;

use crate::error::Result;
use crate::net::throttle::RateLimits;

/// One rule set; absent fields fall back to the default rules.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct TrafficRules {
    #[serde(default)]
    pub inactivity_timeout_seconds: Option<u64>,
    #[serde(default)]
    pub unmetered_read_bytes: Option<i64>,
    #[serde(default)]
    pub read_bytes_per_second: Option<u64>,
    #[serde(default)]
    pub unmetered_write_bytes: Option<i64>,
    #[serde(default)]
    pub write_bytes_per_second: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct TrafficRulesFile {
    #[serde(default)]
    default_rules: TrafficRules,
    #[serde(default)]
    region_rules: HashMap<String, TrafficRules>,
}

/// Resolved policy for one client.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResolvedRules {
    pub inactivity_timeout: Option<Duration>,
    pub rate_limits: RateLimits,
}

/// The loaded rule set. Queries may run concurrently with a reload; a
/// reload swaps the whole snapshot under the write lock, so readers see
/// the old rules or the new ones, never a mix.
pub struct TrafficRulesSet {
    state: RwLock<TrafficRulesFile>,
}

impl TrafficRulesSet {
    /// Load the rules file, or start with empty defaults when no file is
    /// configured.
    pub fn new(filename: Option<&str>) -> Result<Self> {
        let state = match filename {
            Some(filename) => load_rules(filename)?,
            None => TrafficRulesFile::default(),
        };
        Ok(TrafficRulesSet {
            state: RwLock::new(state),
        })
    }

    /// Replace the rule set from the file. On failure the previous rules
    /// stay in force.
    pub fn reload(&self, filename: &str) -> Result<()> {
        let fresh = load_rules(filename)?;
        *self.state.write().expect("traffic rules lock poisoned") = fresh;
        Ok(())
    }

    /// Resolve the policy for a client region: region overrides layered on
    /// the defaults.
    pub fn get_rules(&self, region: &str) -> ResolvedRules {
        let state = self.state.read().expect("traffic rules lock poisoned");
        let defaults = &state.default_rules;
        let regional = state.region_rules.get(region);

        ResolvedRules {
            inactivity_timeout: regional
                .and_then(|r| r.inactivity_timeout_seconds)
                .or(defaults.inactivity_timeout_seconds)
                .map(Duration::from_secs),
            rate_limits: RateLimits {
                unmetered_read_bytes: regional
                    .and_then(|r| r.unmetered_read_bytes)
                    .or(defaults.unmetered_read_bytes)
                    .unwrap_or(0),
                read_bytes_per_second: regional
                    .and_then(|r| r.read_bytes_per_second)
                    .or(defaults.read_bytes_per_second)
                    .unwrap_or(0),
                unmetered_write_bytes: regional
                    .and_then(|r| r.unmetered_write_bytes)
                    .or(defaults.unmetered_write_bytes)
                    .unwrap_or(0),
                write_bytes_per_second: regional
                    .and_then(|r| r.write_bytes_per_second)
                    .or(defaults.write_bytes_per_second)
                    .unwrap_or(0),
            },
        }
    }
}

fn load_rules(filename: &str) -> Result<TrafficRulesFile> {
    let json = fs::read(filename)?;
    Ok(serde_json::from_slice(&json)?)
}
