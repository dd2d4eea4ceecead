//! Core building blocks for the Freehold environment manager.
//!
//! The environment is rebuilt from ground truth (directory listings, sysfs,
//! `losetup --associated`) at the start of every command; nothing here caches
//! kernel state across calls. All kernel side effects go through the
//! [`invoke::ToolInvoker`] seam so the orchestration stays testable against
//! fake binaries.

pub mod config;
pub mod env;
pub mod error;
pub mod headers;
pub mod invoke;
pub mod keys;
pub mod logging;
pub mod mapper;
pub mod md;
pub mod pages;
pub mod probe;
pub mod safezone;

pub use config::FreeholdConfig;
pub use env::{Environment, EnvironmentState};
pub use error::{FreeholdError, FreeholdResult};
pub use invoke::{SystemInvoker, ToolInvoker, ToolOutput};
