//! Key ranges and key rendering helpers used by the scan engine.
pub mod debug;
pub mod range;
