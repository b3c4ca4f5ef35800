pub mod pipeline;
pub mod scheduler;

#[cfg(test)]
pub(crate) mod testing;

pub use pipeline::{Pipeline, PipelineSettings, ProcessResult, ResumePoint};
pub use scheduler::{BatchSummary, CleanupReport, JobOutcome, Scheduler, SchedulerSettings};
