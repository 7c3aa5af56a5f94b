pub mod audit;
pub mod compactor;
pub mod config;
pub mod cost;
pub mod engine;
pub mod gateway;
pub mod lifecycle;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod pool;
pub mod sql;
pub mod wal;
pub mod wire;
