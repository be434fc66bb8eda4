pub mod config;
pub mod memory;
pub mod queue;
pub mod redis;
pub mod types;

pub use queue::{Broker, Delivery, JobConsumer, JobPublisher, QueueError, ResultConsumer, ResultPublisher};
pub use types::{
    Diagnostic, DiagnosticSeverity, ExecutionResult, Job, JobStatus, Language, Output, Recipe,
    RiskNotice, RiskSeverity, TestResult,
};
