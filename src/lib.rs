pub mod backup;
pub mod cache;
pub mod config;
pub mod crypto;
pub mod error;
pub mod gateway;
pub mod monitoring;
pub mod persistence;
pub mod security;
pub mod utils;
pub mod validation;

pub use config::GatewayConfig;
pub use error::GatewayError;
pub use gateway::{Operation, OperationOutput, SecurityContext, SecurityGateway};

// Crate version exposed for runtime queries
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
