//! Quiz progression core: level-gated quiz selection, attempt scoring and
//! offline-tolerant session persistence for a learning portal client.

pub mod config;
pub mod error;
pub mod metrics;
pub mod models;
pub mod services;
pub mod utils;

pub use config::Config;
pub use error::{GatewayError, GatewayResult};
pub use services::CoreState;
