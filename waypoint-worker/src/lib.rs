//! Waypoint worker library
//!
//! Configuration, the admin HTTP surface and the HTTP stage executor used by
//! the `waypoint-worker` binary, which runs the stage consumers of the
//! pipeline next to the admin API.

pub mod config;
pub mod handler;
pub mod http_executor;
pub mod types;
