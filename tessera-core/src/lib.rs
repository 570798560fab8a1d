pub mod config;
pub mod core_entity;
pub mod core_identity;
pub mod core_oplog;
pub mod core_router;
pub mod core_store;
pub mod logging;
pub mod metrics;
pub mod node;
pub mod shutdown;

#[cfg(test)]
pub(crate) mod test_utils;

pub use config::Config;
pub use logging::{init_logging, LogLevel};
pub use node::{Node, NodeError};
