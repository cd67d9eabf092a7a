pub mod memory;
pub mod pool;
pub mod queries;
pub mod schema;
pub mod store;

pub use memory::MemoryStore;
pub use pool::{create_pool, init_schema};
pub use queries::PgStore;
pub use store::ReconcileStore;
