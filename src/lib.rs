//! assetgate - A dev asset gateway for backend web applications
//!
//! This library fronts a frontend build tool's dev server for a backend app:
//! - Spawns the dev server, captures its output and records its address in a hotfile
//! - Recovers a running dev server from the hotfile after a backend restart
//! - Reverse-proxies build-tool HTTP paths and hot-reload WebSockets through one port
//! - Resolves production asset URLs through the build manifest

pub mod config;
pub mod error;
pub mod gateway;
pub mod hotfile;
pub mod manifest;
pub mod router;
pub mod server;
pub mod supervisor;
pub mod tunnel;
pub mod websocket;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
