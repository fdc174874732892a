//! Sponsor database: per-deployment partner metadata consulted during the
//! client handshake, hot-reloadable without a restart.

use std::collections::HashMap;
use std::fs;
use std::sync::RwLock;

use serde::Deserialize;

use crate::error::Result;

#[derive(Debug, Deserialize, Clone)]
pub struct Sponsor {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub home_pages: Vec<String>,
}

#[derive(Debug, Deserialize, Default)]
struct SponsorFile {
    #[serde(default)]
    sponsors: Vec<Sponsor>,
}

pub struct SponsorDatabase {
    state: RwLock<HashMap<String, Sponsor>>,
}

impl SponsorDatabase {
    /// Load the database file, or start empty when no file is configured.
    pub fn new(filename: Option<&str>) -> Result<Self> {
        let state = match filename {
            Some(filename) => load_sponsors(filename)?,
            None => HashMap::new(),
        };
        Ok(SponsorDatabase {
            state: RwLock::new(state),
        })
    }

    /// Replace the database from the file. On failure the previous state
    /// stays in force.
    pub fn reload(&self, filename: &str) -> Result<()> {
        let fresh = load_sponsors(filename)?;
        *self.state.write().expect("sponsor database lock poisoned") = fresh;
        Ok(())
    }

    pub fn get_sponsor(&self, sponsor_id: &str) -> Option<Sponsor> {
        self.state
            .read()
            .expect("sponsor database lock poisoned")
            .get(sponsor_id)
            .cloned()
    }

    /// Home pages shown to clients of the given sponsor; empty when the
    /// sponsor is unknown.
    pub fn home_pages(&self, sponsor_id: &str) -> Vec<String> {
        self.get_sponsor(sponsor_id)
            .map(|s| s.home_pages)
            .unwrap_or_default()
    }

    pub fn sponsor_count(&self) -> usize {
        self.state
            .read()
            .expect("sponsor database lock poisoned")
            .len()
    }
}

fn load_sponsors(filename: &str) -> Result<HashMap<String, Sponsor>> {
    let json = fs::read(filename)?;
    let file: SponsorFile = serde_json::from_slice(&json)?;
    Ok(file
        .sponsors
        .into_iter()
        .map(|sponsor| (sponsor.id.clone(), sponsor))
        .collect())
}
