//! Tunnel server components: the service supervisor, support services with
//! hot reload, the tunnel and web API servers, and the HTTPS listener
//! helper.

pub mod config;
pub mod geoip;
pub mod listener;
pub mod services;
pub mod sponsor;
pub mod support;
pub mod traffic_rules;
pub mod tunnel;
pub mod web;

pub use services::run_services;
