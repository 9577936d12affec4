// Library crate for Filegate: the binary and the integration tests share
// the same modules.

pub mod config;
pub mod error;
pub mod gate;
pub mod index;
pub mod ops;
pub mod owner;
pub mod server;
pub mod upload;

pub use crate::config::Config;
pub use crate::error::ApiError;
pub use crate::gate::{BasePath, PathGate, Resolved, ValidateOptions};
pub use crate::index::{IndexStore, Scanner, ScanSummary};
pub use crate::owner::Ownership;
pub use crate::server::AppState;
pub use crate::upload::UploadEngine;
