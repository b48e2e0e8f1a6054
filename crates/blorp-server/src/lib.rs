pub mod app;
pub mod config;
pub mod control;
pub mod error;
pub mod instance;

pub use app::{App, Backend};
pub use config::AppConfig;
pub use control::{ControlActor, ShutdownReport};
pub use error::ServerError;
pub use instance::InstanceRegistry;
