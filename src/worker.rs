/// worker support structs
///
use serde::{Deserialize, Serialize};

pub type JsonString = String;

/// lifecycle of one execution context; each context runs exactly one job.
///
/// `Idle -> Starting -> Running -> Streaming* -> Completed | Failed | Terminated`
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerState {
    #[default]
    Idle,
    Starting,
    Running,
    Streaming,
    Completed,
    Failed,
    Terminated,
}

impl WorkerState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkerState::Completed | WorkerState::Failed | WorkerState::Terminated
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    pub job_id: String,
    pub state: WorkerState,
    pub elapsed_ms: u64,
    pub events: u64,
    pub protocol_errors: u16,
}

impl JobStatus {
    pub fn new(
        job_id: String,
        state: WorkerState,
        elapsed_ms: u64,
        events: u64,
        protocol_errors: u16,
    ) -> JobStatus {
        JobStatus {
            job_id,
            state,
            elapsed_ms,
            events,
            protocol_errors,
        }
    }

    pub fn to_json(&self) -> JsonString {
        match serde_json::to_string(self) {
            Ok(js) => js,
            Err(e) => format!(r#"{}"status":"json parse error: {:?}"{}"#, "{", e, "}"),
        }
    }
}

/// a short random id for jobs
pub fn create_job_id() -> String {
    std::iter::repeat_with(fastrand::alphanumeric)
        .take(16)
        .collect()
}
