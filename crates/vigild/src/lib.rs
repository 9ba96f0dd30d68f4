//! vigild - Vigil alert evaluation daemon
//!
//! Loads a daemon configuration and a rule file, then evaluates every rule on
//! its own schedule and delivers notifications until it receives SIGINT or
//! SIGTERM. SIGHUP re-reads the rule file.

#![forbid(unsafe_code)]

pub mod config;
pub mod daemon;
pub mod error;

pub use config::{DaemonConfig, SourceConfig};
pub use daemon::{Engine, build_manager, load_rules, log_health};
pub use error::{DaemonError, Result};
