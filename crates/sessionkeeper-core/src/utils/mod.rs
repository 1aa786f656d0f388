//! Utility functions for string formatting and manipulation.

pub mod format;

pub use format::{token_preview, truncate_body};
