//! # appctl
//!
//! Kubernetes operator for `AppDeployment` resources, with a status API
//! backed by a watch-fed cache and a CLI client.
//!
//! The operator keeps one Deployment per AppDeployment in line with its spec
//! and reports the observed replica state back into the record's status.

pub mod api;
pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod http_server;
pub mod logging;
pub mod operator;
pub mod watch_cache;

pub use error::{Error, Result};
pub use watch_cache::{CacheState, WatchCache};
