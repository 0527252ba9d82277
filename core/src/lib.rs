pub mod config;
pub mod endpoint;
pub mod error;
pub mod manager;
pub mod metrics;
pub mod registry;
pub mod sink;
pub mod spu;

pub use config::{BrokerConfig, FilterMode, UnitScale};
pub use manager::SpuManager;

pub use sepa_proto as proto;
