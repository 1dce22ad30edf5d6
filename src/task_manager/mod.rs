pub mod contracts;
pub mod cron;
pub mod models;
pub mod security;
pub mod storage;

pub use contracts::*;
pub use models::*;
pub use storage::EngineStore;
