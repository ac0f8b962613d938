#![deny(missing_docs)]
//! # maestro-engine — the workflow engine
//!
//! Executes a registered [`WorkflowDefinition`] stage by stage: strict
//! declaration order for sequential stages, fan-out with a barrier for
//! parallel groups, a hard budget cap checked before every dispatch,
//! strictly-upward tier escalation, and cooperative cancellation at
//! every suspension point.
//!
//! Stage-level failures never cross the API boundary as errors; they
//! are encoded in the structured [`WorkflowReport`]. The only errors
//! `execute` returns are caller mistakes (unknown workflow, invalid
//! input) and pre-start cancellation.

pub mod context;
pub mod definition;
pub mod engine;
pub mod pattern;
pub mod template;

pub use context::{
    CacheUsage, ExecOptions, StageFailure, StageResult, StageStatus, WorkflowOutcome,
    WorkflowReport,
};
pub use definition::{
    builtin_workflows, EscalationPolicy, EscalationTrigger, StageSpec, WorkflowDefinition,
};
pub use engine::WorkflowEngine;
pub use pattern::MemoryPatternSink;
