pub mod hooks;
pub mod instance;
pub mod process;

pub use hooks::{ExecutionHooks, PassthroughHooks};
pub use instance::{Instance, TokenMove};
pub use process::{DeployedProcess, InstanceSeed, StartPosition};
