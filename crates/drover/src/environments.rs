pub mod environment;
pub mod local;

pub use environment::{Environment, EnvironmentError, ExecutionOutput};
pub use local::{LocalEnvironment, LocalEnvironmentConfig};
