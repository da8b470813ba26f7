//! Service layer module.
//!
//! This module provides the automation system façade and its builder.

pub mod system;

pub use system::{AutomationSystem, SystemBuilder};
