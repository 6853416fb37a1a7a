//! estat-load common library
//!
//! Shared error handling and logging bootstrap for the estat-load workspace.

pub mod error;
pub mod logging;

// Re-export commonly used types
pub use error::{EstatError, Result};
