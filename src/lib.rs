pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod service;

pub use config::AppConfig;
pub use db::{create_pool, init_schema, MemoryStore, PgStore, ReconcileStore};
pub use error::{ReconcileError, Result};
pub use service::ReconciliationService;
