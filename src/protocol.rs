//! messages exchanged between the supervisor and a worker runtime.
//!
//! the supervisor dispatches one `JobDescriptor`. the worker answers with json text
//! messages tagged by `kind`: zero or more `resourceChange` events, then exactly one
//! terminal `run` or `error` message.
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::JobError;
use crate::worker::JsonString;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunJob {
    pub script_id: String,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub options: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum JobDescriptor {
    Run(RunJob),
}

impl JobDescriptor {
    pub fn run(script_id: &str, files: Vec<String>, options: Value) -> JobDescriptor {
        JobDescriptor::Run(RunJob {
            script_id: script_id.to_string(),
            files,
            options,
        })
    }

    pub fn script_id(&self) -> &str {
        match self {
            JobDescriptor::Run(job) => &job.script_id,
        }
    }
}

/// a tracked resource changed while the job ran
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceChangeEvent {
    pub reference: String,
    pub content: Value,
}

impl ResourceChangeEvent {
    pub fn new(reference: &str, content: Value) -> ResourceChangeEvent {
        ResourceChangeEvent {
            reference: reference.to_string(),
            content,
        }
    }
}

/// worker to supervisor wire messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum WorkerMessage {
    ResourceChange(ResourceChangeEvent),
    Run { result: Value },
    Error { error: String },
    #[serde(other)]
    Unknown,
}

impl WorkerMessage {
    pub fn to_json(&self) -> Result<JsonString, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn parse(msg: &str) -> Result<WorkerMessage, serde_json::Error> {
        serde_json::from_str(msg)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkerMessage::Run { .. } | WorkerMessage::Error { .. })
    }
}

/// the single terminal outcome of a job
#[derive(Debug, Clone, PartialEq)]
pub enum RunResult {
    Completed(Value),
    Failed(String),
    Terminated,
}

impl RunResult {
    pub fn is_success(&self) -> bool {
        matches!(self, RunResult::Completed(_))
    }

    pub fn into_result(self) -> Result<Value, JobError> {
        match self {
            RunResult::Completed(value) => Ok(value),
            RunResult::Failed(msg) => Err(JobError::Failed(msg)),
            RunResult::Terminated => Err(JobError::Terminated),
        }
    }
}
