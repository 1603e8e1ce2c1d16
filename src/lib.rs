//! Studio Jobs: background job orchestration and message routing.

pub mod config;
pub mod error;
pub mod router;
pub mod worker;

pub use error::{Error, Result};
