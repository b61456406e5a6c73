//! spawns one fresh execution context per job and consumes its protocol.
//!
//! every context writes json messages to its own channel. a pump task per job parses
//! them in order, forwards events, and on the terminal message closes the event
//! stream before publishing the result, so no event can follow the result.
//!
//! the outcome is settled exactly once, by whichever comes first: the pump accepting a
//! terminal message, or a hard terminate. a terminate settles `RunResult::Terminated`
//! on the spot, then cancels the context's task; it does not wait for the job body
//! to reach a suspension point.
use anyhow::Result;
use async_channel::{bounded, unbounded, Receiver, Sender};
use async_std::sync::Mutex;
use async_std::task::JoinHandle;
use futures::future::{self, Either};
use hashbrown::HashMap;
use log::*;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use crate::cancel::CancellationToken;
use crate::error::JobError;
use crate::protocol::{JobDescriptor, ResourceChangeEvent, RunResult, WorkerMessage};
use crate::runtime::{self, Command, JobRunner};
use crate::worker::{create_job_id, JobStatus, JsonString, WorkerState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Terminate,
}

#[derive(Debug)]
struct Tracker {
    state: WorkerState,
    started: Instant,
    events: u64,
    protocol_errors: u16,
}

type SharedTracker = Arc<Mutex<Tracker>>;
type Verdict = Arc<OnceLock<RunResult>>;
type InFlight = Arc<Mutex<HashMap<String, Terminator>>>;

// the hard-stop side of a job, shared by its handle and the in-flight map
#[derive(Debug, Clone)]
struct Terminator {
    verdict: Verdict,
    killed: CancellationToken,
    control: Sender<Control>,
}

impl Terminator {
    /// settle the job as terminated; false when it already settled another way
    fn fire(&self) -> bool {
        if *self.verdict.get_or_init(|| RunResult::Terminated) != RunResult::Terminated {
            return false;
        }

        self.killed.cancel();
        // a full control channel means a terminate is already on its way
        let _ = self.control.try_send(Control::Terminate);
        true
    }
}

/// the supervisor side of one submitted job
#[derive(Debug)]
pub struct JobHandle {
    id: String,
    events: Receiver<ResourceChangeEvent>,
    result_rx: Receiver<RunResult>,
    result: Mutex<Option<RunResult>>,
    terminator: Terminator,
    cancel: CancellationToken,
    tracker: SharedTracker,
}

impl JobHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// the ordered event stream; it closes once the terminal result is known
    pub fn events(&self) -> Receiver<ResourceChangeEvent> {
        self.events.clone()
    }

    pub async fn next_event(&self) -> Option<ResourceChangeEvent> {
        self.events.recv().await.ok()
    }

    /// wait for the single terminal result; later calls return the same value
    pub async fn result(&self) -> RunResult {
        let mut result = self.result.lock().await;
        if let Some(r) = result.as_ref() {
            return r.clone();
        }

        let published = Box::pin(self.result_rx.recv());
        let killed = Box::pin(self.terminator.killed.cancelled());
        let r = match future::select(published, killed).await {
            Either::Left((Ok(r), _)) => r,
            Either::Left((Err(_), _)) => RunResult::Failed("supervisor dropped the job".to_string()),
            Either::Right(_) => {
                // the pump may still be waiting on the context; nothing it forwards counts now
                self.events.close();
                self.tracker.lock().await.state = WorkerState::Terminated;
                RunResult::Terminated
            }
        };
        *result = Some(r.clone());
        r
    }

    pub async fn wait(&self) -> Result<serde_json::Value, JobError> {
        self.result().await.into_result()
    }

    /// ask the job body to stop; operations holding the token fail fast
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// forcibly end the context; the job resolves as `Terminated` unless it already finished
    pub fn terminate(&self) {
        if self.terminator.fire() {
            warn!("terminate requested for job id: {}", self.id);
        } else {
            debug!("job {} already finished, terminate ignored", self.id);
        }
    }

    pub async fn state(&self) -> WorkerState {
        self.tracker.lock().await.state
    }

    pub async fn status(&self) -> JobStatus {
        let tracker = self.tracker.lock().await;
        JobStatus::new(
            self.id.clone(),
            tracker.state,
            tracker.started.elapsed().as_millis() as u64,
            tracker.events,
            tracker.protocol_errors,
        )
    }
}

pub struct Supervisor {
    runner: Arc<dyn JobRunner>,
    jobs: InFlight,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor").finish_non_exhaustive()
    }
}

impl Supervisor {
    pub fn new(runner: impl JobRunner) -> Supervisor {
        Supervisor {
            runner: Arc::new(runner),
            jobs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// spawn a fresh context for `job`; contexts are never reused
    pub async fn submit(&self, job: JobDescriptor) -> Result<JobHandle> {
        let id = create_job_id();
        info!("submitting job id: {}, script: {}", id, job.script_id());

        let tracker = Arc::new(Mutex::new(Tracker {
            state: WorkerState::Starting,
            started: Instant::now(),
            events: 0,
            protocol_errors: 0,
        }));

        let (cmd_tx, cmd_rx) = bounded(1);
        let (msg_tx, msg_rx) = unbounded();
        let (event_tx, event_rx) = unbounded();
        let (result_tx, result_rx) = bounded(1);
        let (control_tx, control_rx) = bounded(1);
        let cancel = CancellationToken::new();
        let terminator = Terminator {
            verdict: Arc::new(OnceLock::new()),
            killed: CancellationToken::new(),
            control: control_tx,
        };

        let wid = id.clone();
        let runner = self.runner.clone();
        let token = cancel.clone();
        let task = async_std::task::spawn(async move {
            match runtime::handler(wid.clone(), cmd_rx, msg_tx, runner, token).await {
                Ok(()) => info!("worker handler exit for job id: {}", wid),
                Err(e) => error!("worker exit with error for job id: {}: {:?}", wid, e),
            }
        });

        if cmd_tx.send(Command::Run(job)).await.is_err() {
            task.cancel().await;
            return Err(JobError::Dispatch(format!("context for job {} is gone", id)).into());
        }
        tracker.lock().await.state = WorkerState::Running;

        self.jobs.lock().await.insert(id.clone(), terminator.clone());

        let pump = Pump {
            id: id.clone(),
            messages: msg_rx,
            control: control_rx,
            verdict: terminator.verdict.clone(),
            events: event_tx,
            result: result_tx,
            tracker: tracker.clone(),
            jobs: self.jobs.clone(),
        };
        async_std::task::spawn(pump.run(task));

        Ok(JobHandle {
            id,
            events: event_rx,
            result_rx,
            result: Mutex::new(None),
            terminator,
            cancel,
            tracker,
        })
    }

    pub async fn in_flight(&self) -> usize {
        self.jobs.lock().await.len()
    }

    /// terminate every in-flight job
    pub async fn shutdown(&self) -> Result<()> {
        let jobs = self.jobs.lock().await;
        info!("shutting down {} in-flight jobs", jobs.len());
        for (id, terminator) in jobs.iter() {
            if !terminator.fire() {
                debug!("job {} already finishing", id);
            }
        }

        Ok(())
    }
}

// owns the supervisor side of one context
struct Pump {
    id: String,
    messages: Receiver<JsonString>,
    control: Receiver<Control>,
    verdict: Verdict,
    events: Sender<ResourceChangeEvent>,
    result: Sender<RunResult>,
    tracker: SharedTracker,
    jobs: InFlight,
}

impl Pump {
    async fn run(self, task: JoinHandle<()>) {
        let outcome = self.consume(task).await;
        // a terminate that got here first keeps its verdict
        let outcome = self.verdict.get_or_init(|| outcome).clone();

        let state = match &outcome {
            RunResult::Completed(_) => WorkerState::Completed,
            RunResult::Failed(_) => WorkerState::Failed,
            RunResult::Terminated => WorkerState::Terminated,
        };
        info!("job id: {} finished: {:?}", self.id, state);

        // the event stream ends before the result is visible
        self.events.close();
        self.tracker.lock().await.state = state;
        self.jobs.lock().await.remove(&self.id);

        if self.result.send(outcome).await.is_err() {
            debug!("job id: {} result dropped, handle is gone", self.id);
        }
    }

    async fn consume(&self, task: JoinHandle<()>) -> RunResult {
        let mut control_open = true;

        loop {
            let next = if control_open {
                let msg = Box::pin(self.messages.recv());
                let ctl = Box::pin(self.control.recv());
                match future::select(msg, ctl).await {
                    Either::Left((msg, _)) => msg,
                    Either::Right((Ok(Control::Terminate), _)) => {
                        warn!("terminating job id: {}", self.id);
                        task.cancel().await;
                        return RunResult::Terminated;
                    }
                    Either::Right((Err(_), _)) => {
                        control_open = false;
                        continue;
                    }
                }
            } else {
                self.messages.recv().await
            };

            let Ok(raw) = next else {
                error!("job id: {} context exited without a result", self.id);
                return RunResult::Failed("execution context exited without a result".to_string());
            };

            match WorkerMessage::parse(&raw) {
                Ok(WorkerMessage::ResourceChange(_)) if self.verdict.get().is_some() => {
                    debug!("job id: {} settled, dropping late event", self.id);
                }
                Ok(WorkerMessage::ResourceChange(event)) => {
                    {
                        let mut tracker = self.tracker.lock().await;
                        tracker.state = WorkerState::Streaming;
                        tracker.events += 1;
                    }
                    if self.events.send(event).await.is_err() {
                        debug!("job id: {} event dropped, no listener", self.id);
                    }
                }
                Ok(WorkerMessage::Run { result }) => return RunResult::Completed(result),
                Ok(WorkerMessage::Error { error }) => return RunResult::Failed(error),
                Ok(WorkerMessage::Unknown) => {
                    warn!("job id: {} ignoring unknown message: {}", self.id, raw);
                    self.count_protocol_error().await;
                }
                Err(e) => {
                    warn!("job id: {} ignoring unparseable message: {}", self.id, e);
                    self.count_protocol_error().await;
                }
            }
        }
    }

    async fn count_protocol_error(&self) {
        let mut tracker = self.tracker.lock().await;
        tracker.protocol_errors = tracker.protocol_errors.saturating_add(1);
    }
}
