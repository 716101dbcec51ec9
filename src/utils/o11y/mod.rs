//! Common observability utilities.
//!
//! This module provides the tracing and logging helpers used throughout the
//! scanner.
//!
pub mod logging;
