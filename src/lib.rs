// veiltun library crate
//
// Exports the connection substrate and server components for the veiltun
// binary and any embedding consumers.

// Cross-cutting infrastructure
pub mod cli;
pub mod error;
pub mod logging;

// Connection-lifecycle and resource-management substrate shared by all
// tunnel protocols
pub mod net;

// Resumable HTTP download engine
pub mod download;

// Tunnel server: supervisor, support services, listeners
pub mod server;
