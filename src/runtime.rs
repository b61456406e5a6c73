//! the isolated execution context that runs one job.
//!
//! before the job body runs, the context gives the body a `Console` buffer of its own
//! for text output and computes a host-fixed environment for subprocesses. the
//! protocol channel only ever carries json messages. when the body finishes, the
//! buffer is drained and only then is the terminal message sent.
//!
//! the buffer is opt-in: a body that writes with `println!` goes to process stdout,
//! which is not the protocol channel, and bypasses the flush barrier.
use anyhow::Result;
use async_channel::{Receiver, Sender};
use async_std::sync::Mutex;
use futures::future::BoxFuture;
use log::*;
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use crate::cancel::CancellationToken;
use crate::protocol::{JobDescriptor, ResourceChangeEvent, WorkerMessage};
use crate::worker::JsonString;

pub const OUTPUT_TARGET: &str = "memo_worker::job_output";

#[derive(Debug, Clone)]
pub enum Command {
    Run(JobDescriptor),
    Shutdown,
}

/// the host code that executes a job body
pub trait JobRunner: Send + Sync + 'static {
    fn run(&self, job: JobDescriptor, ctx: JobContext) -> BoxFuture<'static, Result<Value>>;
}

impl<F, Fut> JobRunner for F
where
    F: Fn(JobDescriptor, JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    fn run(&self, job: JobDescriptor, ctx: JobContext) -> BoxFuture<'static, Result<Value>> {
        Box::pin(self(job, ctx))
    }
}

/// buffered text output of a job body
#[derive(Debug, Clone, Default)]
pub struct Console {
    lines: Arc<Mutex<Vec<String>>>,
}

impl Console {
    pub async fn log(&self, line: impl Into<String>) {
        self.lines.lock().await.push(line.into());
    }

    pub async fn pending(&self) -> usize {
        self.lines.lock().await.len()
    }

    /// drain the buffer to the log, returning the number of lines written
    pub async fn flush(&self, job_id: &str) -> usize {
        let lines: Vec<String> = self.lines.lock().await.drain(..).collect();
        for line in lines.iter() {
            info!(target: OUTPUT_TARGET, "[{}] {}", job_id, line);
        }

        lines.len()
    }
}

/// everything a job body can reach while it runs
#[derive(Debug, Clone)]
pub struct JobContext {
    job_id: String,
    tx: Sender<JsonString>,
    console: Console,
    env: Arc<BTreeMap<String, String>>,
    cancel: CancellationToken,
}

impl JobContext {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// send a resource change to the supervisor right away
    pub async fn emit(&self, event: ResourceChangeEvent) -> Result<()> {
        let msg = WorkerMessage::ResourceChange(event).to_json()?;
        self.tx.send(msg).await?;
        Ok(())
    }

    pub fn console(&self) -> &Console {
        &self.console
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// an async subprocess command that runs with the host-fixed environment.
    ///
    /// the child is killed when its future is dropped, so terminating the job also
    /// ends any subprocess it is waiting on.
    pub fn command(&self, program: &str) -> async_std::process::Command {
        let mut cmd = async_std::process::Command::new(program);
        cmd.env_clear().envs(self.env.iter()).kill_on_drop(true);
        cmd
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// the process environment with the host specific fixups applied
pub fn host_environment() -> BTreeMap<String, String> {
    fixup_environment(std::env::vars(), cfg!(windows))
}

fn fixup_environment(
    vars: impl IntoIterator<Item = (String, String)>,
    windows: bool,
) -> BTreeMap<String, String> {
    let mut env: BTreeMap<String, String> = BTreeMap::new();
    let sep = if windows { ";" } else { ":" };

    for (key, value) in vars {
        // windows keys are case insensitive; fold every spelling of PATH into one key
        if windows && key != "PATH" && key.eq_ignore_ascii_case("PATH") {
            let merged = match env.remove("PATH") {
                Some(existing) if !existing.is_empty() => format!("{}{}{}", existing, sep, value),
                _ => value,
            };
            env.insert("PATH".to_string(), merged);
            continue;
        }

        if key == "PATH" {
            if let Some(existing) = env.remove("PATH") {
                env.insert(key, format!("{}{}{}", value, sep, existing));
                continue;
            }
        }

        env.insert(key, value);
    }

    if !env.contains_key("PATH") {
        let default = if windows {
            r"C:\Windows\system32;C:\Windows"
        } else {
            "/usr/local/bin:/usr/bin:/bin"
        };
        env.insert("PATH".to_string(), default.to_string());
    }

    env
}

// the handler loop; a context accepts exactly one job
pub async fn handler(
    id: String,
    rx: Receiver<Command>,
    tx: Sender<JsonString>,
    runner: Arc<dyn JobRunner>,
    cancel: CancellationToken,
) -> Result<()> {
    while let Ok(cmd) = rx.recv().await {
        match cmd {
            Command::Run(job) => {
                info!("worker id: {} running script: {}", id, job.script_id());

                let ctx = JobContext {
                    job_id: id.clone(),
                    tx: tx.clone(),
                    console: Console::default(),
                    env: Arc::new(host_environment()),
                    cancel: cancel.clone(),
                };

                let outcome = runner.run(job, ctx.clone()).await;

                // barrier: drain buffered output before the terminal message
                let flushed = ctx.console.flush(&id).await;
                debug!("worker id: {} flushed {} output lines", id, flushed);

                let msg = match outcome {
                    Ok(result) => WorkerMessage::Run { result },
                    Err(e) => {
                        error!("worker id: {} job failed: {:?}", id, e);
                        WorkerMessage::Error {
                            error: format!("{:#}", e),
                        }
                    }
                };

                tx.send(msg.to_json()?).await?;
                break;
            }
            Command::Shutdown => {
                info!("worker id: {} shutdown before run", id);
                break;
            }
        }
    }

    while let Ok(cmd) = rx.try_recv() {
        warn!("worker id: {} already used, rejecting: {:?}", id, cmd);
    }

    // closing here makes any late emit from a leftover clone of the context fail
    rx.close();
    tx.close();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(list: &[(&str, &str)]) -> Vec<(String, String)> {
        list.iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn unix_path_default() {
        let env = fixup_environment(vars(&[("HOME", "/home/me")]), false);
        assert_eq!(env["PATH"], "/usr/local/bin:/usr/bin:/bin");
        assert_eq!(env["HOME"], "/home/me");

        let env = fixup_environment(vars(&[("PATH", "/opt/bin")]), false);
        assert_eq!(env["PATH"], "/opt/bin");
    }

    #[test]
    fn windows_path_is_folded() {
        let env = fixup_environment(
            vars(&[("Path", r"C:\tools"), ("PATH", r"C:\bin"), ("TEMP", r"C:\tmp")]),
            true,
        );
        assert_eq!(env.len(), 2);
        assert_eq!(env["PATH"], r"C:\bin;C:\tools");
        assert!(!env.contains_key("Path"));
    }

    #[test]
    fn console_flush_drains() {
        async_std::task::block_on(async move {
            let console = Console::default();
            console.log("one").await;
            console.log(String::from("two")).await;
            assert_eq!(console.pending().await, 2);
            assert_eq!(console.flush("job").await, 2);
            assert_eq!(console.pending().await, 0);
        });
    }

    #[test]
    fn handler_runs_one_job() {
        async_std::task::block_on(async move {
            let (cmd_tx, cmd_rx) = async_channel::bounded(4);
            let (msg_tx, msg_rx) = async_channel::unbounded();

            let runner = |job: JobDescriptor, ctx: JobContext| async move {
                ctx.emit(ResourceChangeEvent::new("out.txt", json!("a"))).await?;
                ctx.console().log("printed, not a protocol message").await;
                Ok::<_, anyhow::Error>(json!({ "script": job.script_id() }))
            };

            let first = JobDescriptor::run("first", vec![], Value::Null);
            let second = JobDescriptor::run("second", vec![], Value::Null);
            cmd_tx.send(Command::Run(first)).await.unwrap();
            cmd_tx.send(Command::Run(second)).await.unwrap();

            handler(
                "job".to_string(),
                cmd_rx,
                msg_tx,
                Arc::new(runner),
                CancellationToken::new(),
            )
            .await
            .unwrap();

            let mut messages = vec![];
            while let Ok(msg) = msg_rx.recv().await {
                messages.push(WorkerMessage::parse(&msg).unwrap());
            }

            assert_eq!(messages.len(), 2);
            assert!(matches!(messages[0], WorkerMessage::ResourceChange(_)));
            assert_eq!(
                messages[1],
                WorkerMessage::Run {
                    result: json!({ "script": "first" })
                }
            );
            assert!(cmd_tx.is_closed());
        });
    }

    #[test]
    fn handler_reports_failure() {
        async_std::task::block_on(async move {
            let (cmd_tx, cmd_rx) = async_channel::bounded(1);
            let (msg_tx, msg_rx) = async_channel::unbounded();

            let runner = |_job: JobDescriptor, _ctx: JobContext| async move {
                Err::<Value, _>(anyhow::anyhow!("script exploded"))
            };

            cmd_tx
                .send(Command::Run(JobDescriptor::run("bad", vec![], Value::Null)))
                .await
                .unwrap();
            handler(
                "job".to_string(),
                cmd_rx,
                msg_tx,
                Arc::new(runner),
                CancellationToken::new(),
            )
            .await
            .unwrap();

            let msg = WorkerMessage::parse(&msg_rx.recv().await.unwrap()).unwrap();
            assert_eq!(
                msg,
                WorkerMessage::Error {
                    error: "script exploded".to_string()
                }
            );
        });
    }
}
