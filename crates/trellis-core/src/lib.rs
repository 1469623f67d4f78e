pub mod config;
pub mod error;
pub mod event;
pub mod traits;
pub mod types;

pub use config::Manifest;
pub use error::{ErrorDescriptor, Result, TrellisError};
pub use event::EventBus;
pub use types::*;
