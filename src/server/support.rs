//! Shared support services: the config snapshot plus the hot-reloadable
//! data components every server component consults.

use std::sync::Arc;

use slog_scope::{error, info};

use crate::error::Result;

use super::config::ServerConfig;
use super::geoip::GeoIpService;
use super::sponsor::SponsorDatabase;
use super::traffic_rules::TrafficRulesSet;

/// Immutable record of the data components. Hot reload swaps each
/// component's internal state; the record itself never changes after
/// construction.
pub struct SupportServices {
    pub config: Arc<ServerConfig>,
    pub traffic_rules: TrafficRulesSet,
    pub sponsor_db: SponsorDatabase,
    pub geoip: GeoIpService,
}

impl SupportServices {
    pub fn new(config: Arc<ServerConfig>) -> Result<Self> {
        let traffic_rules = TrafficRulesSet::new(config.traffic_rules_filename.as_deref())?;
        let sponsor_db = SponsorDatabase::new(config.sponsor_database_filename.as_deref())?;
        let geoip = GeoIpService::new(config.geoip_database_filename.as_deref())?;
        Ok(SupportServices {
            config,
            traffic_rules,
            sponsor_db,
            geoip,
        })
    }

    /// Reload every data component from its configured file. A component
    /// that fails to reload keeps serving its previous state.
    pub fn reload(&self) {
        if let Some(filename) = self.config.traffic_rules_filename.as_deref() {
            match self.traffic_rules.reload(filename) {
                Ok(()) => info!("reloaded_traffic_rules"),
                Err(e) => error!("reload_traffic_rules_failed"; "error" => e.to_string()),
            }
        }

        if let Some(filename) = self.config.sponsor_database_filename.as_deref() {
            match self.sponsor_db.reload(filename) {
                Ok(()) => info!("reloaded_sponsor_database"),
                Err(e) => error!("reload_sponsor_database_failed"; "error" => e.to_string()),
            }
        }

        if let Some(filename) = self.config.geoip_database_filename.as_deref() {
            match self.geoip.reload(filename) {
                Ok(()) => info!("reloaded_geoip_database"),
                Err(e) => error!("reload_geoip_database_failed"; "error" => e.to_string()),
            }
        }
    }
}
