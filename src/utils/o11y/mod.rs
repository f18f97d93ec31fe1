//! Common observability utilities.
//!
//! This module provides the tools for tracing and logging used throughout
//! the calibration and matching stages.
//!
pub mod logging;
