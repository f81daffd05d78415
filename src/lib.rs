//! Distributed BPMN process execution. Deployed process versions run
//! instances as tokens moving through flow nodes; constraint routing may
//! hand single tokens or whole instances over to other machines mid-run.

pub mod activation;
pub mod config;
pub mod context;
pub mod decider;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod integrations;
pub mod management;
pub mod model;
pub mod network;
pub mod recovery;
pub mod routing;
pub mod runtime;
pub mod storage;
