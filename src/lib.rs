pub mod api;
pub mod config;
pub mod core;
pub mod error;
pub mod observability;
pub mod price_infra;
pub mod types;
pub mod utils;

pub use crate::config::AppConfig;
pub use crate::core::PriceRelay;
pub use crate::error::{Error, Result};
