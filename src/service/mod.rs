pub use app_error::{AppError, AppResult};
pub use config::{AcceptorConfig, BufferPoolConfig, BufferType, NetworkConfig, SuspectConfig};

mod app_error;
mod config;
