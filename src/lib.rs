pub mod config;
pub mod db;
pub mod dispatch;
mod error;
pub mod events;
pub mod filename;
pub mod history;
pub mod paths;
pub mod reconcile;
pub mod retry;
pub mod scan;
pub mod store;
pub mod variants;
pub mod walker;

pub use error::{EngineError, Result};
