pub use app_error::{AppError, AppResult};
pub use config::{
    GeneralConfig, NetworkConfig, PceeConfig, SessionConfig, SessionWorkerPool,
};
pub use engine::SessionEngine;
pub use node::Node;
pub use shutdown::Shutdown;
pub use tracing_config::{setup_local_tracing, setup_tracing, OtelGuard};

mod app_error;
mod config;
mod engine;
mod node;
mod shutdown;
mod tracing_config;
