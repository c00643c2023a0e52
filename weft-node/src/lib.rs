pub mod bootstrap;
pub mod cli;
pub mod config;
pub mod echo;
pub mod error;
pub mod metrics;
pub mod node;
pub mod options;

pub use config::NodeConfig;
pub use error::NodeError;
pub use metrics::NodeMetrics;
pub use node::{Node, NodeEvent};
pub use options::NodeOptions;
