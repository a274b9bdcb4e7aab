pub mod bus;
pub mod cache;
pub mod config;
pub mod database;
pub mod error;
pub mod events;
pub mod models;
pub mod repository;

pub use config::{
    BusConfig, CacheConfig, Config, DatabaseConfig, EngineConfig, PolicyConfig, QuotaConfig,
    WorkerClientConfig,
};
pub use error::{AppError, Result};
pub use models::*;
