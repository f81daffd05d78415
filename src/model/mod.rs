//! Serializable domain model: process descriptions, machines, and the full
//! instance state that gets archived and shipped between engines.

pub mod instance;
pub mod machine;
pub mod process;

pub use instance::{
    derive_instance_state, forked_token_id, join_process_id, merged_token_id, now_millis,
    split_process_id, subprocess_container_id, subprocess_token_id, AdaptationEntry,
    ArchivedInstance, ArchivedUserTask, ExecutionState, InstanceRef, InstanceSnapshot,
    InstanceState, LogEntry, Progress, Token, TokenState, UserTaskRecord, UserTaskState,
    VariableChange, VariableEntry,
};
pub use machine::{parse_machine_address, Machine, MachineProbe, MachineSummary, NextMachine};
pub use process::{
    Constraint, ConstraintSet, ConstraintValue, DeploymentMethod, FlowNode, FlowNodeKind,
    Milestone, ProcessImport, ProcessModel, SequenceFlow,
};
