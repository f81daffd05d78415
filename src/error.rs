use thiserror::Error;

/// Errors surfaced across the management API boundary. Internal plumbing uses
/// `anyhow`; these are the cases callers are expected to branch on.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("process version {version} of {definition_id} is not deployable: {reason}")]
    InvalidProcessVersion {
        definition_id: String,
        version: u64,
        reason: String,
    },
    #[error("unknown process version {version} of {definition_id}")]
    UnknownProcessVersion { definition_id: String, version: u64 },
    #[error("no engine executes instance {0}")]
    UnknownInstance(String),
    #[error("instance {0} has no open user task {1}")]
    UnknownUserTask(String, String),
    #[error("instance {0} has no token at flow node {1}")]
    NoTokenAtFlowNode(String, String),
}
