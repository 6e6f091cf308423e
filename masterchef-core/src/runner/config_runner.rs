use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::plan::{ResourceSpec, ResourceType, build_plan, load_document};
use super::{ResourceResult, RunRecord, RunStatus, Runner};
use crate::clock::{Clock, IdGenerator};
use crate::events::{EventDraft, EventStore};
use crate::queue::Job;

enum StepError {
    Failed(String),
    Canceled,
}

enum Outcome {
    Applied { changed: bool, message: String },
    Skipped(String),
}

/// Runner that applies `file`, `directory`, `command` and `noop` resources
/// relative to a working directory.
#[derive(Debug)]
pub struct ConfigRunner {
    workdir: PathBuf,
    clock: Arc<dyn Clock>,
    ids: Arc<IdGenerator>,
    events: Arc<EventStore>,
}

impl ConfigRunner {
    pub fn new(
        workdir: impl Into<PathBuf>,
        clock: Arc<dyn Clock>,
        ids: Arc<IdGenerator>,
        events: Arc<EventStore>,
    ) -> Self {
        Self {
            workdir: workdir.into(),
            clock,
            ids,
            events,
        }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workdir.join(path)
        }
    }

    async fn shell(&self, command: &str, ctx: &CancellationToken) -> Result<std::process::Output, StepError> {
        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();
        tokio::select! {
            _ = ctx.cancelled() => Err(StepError::Canceled),
            output = child => output.map_err(|err| StepError::Failed(format!("failed to spawn `{command}`: {err}"))),
        }
    }

    async fn apply(
        &self,
        resource: &ResourceSpec,
        notified: bool,
        ctx: &CancellationToken,
    ) -> Result<Outcome, StepError> {
        if resource.refresh_only && !notified {
            return Ok(Outcome::Skipped("refresh_only resource was not notified".into()));
        }
        if let Some(condition) = resource.only_if.as_deref() {
            let output = self.shell(condition, ctx).await?;
            if !output.status.success() {
                return Ok(Outcome::Skipped(format!("only_if `{condition}` was not met")));
            }
        }

        match resource.resource_type {
            ResourceType::File => {
                let path = resource
                    .path
                    .as_deref()
                    .ok_or_else(|| StepError::Failed("file resource requires path".into()))?;
                let target = self.resolve(path);
                let content = resource.content.clone().unwrap_or_default();
                if let Ok(existing) = tokio::fs::read_to_string(&target).await
                    && existing == content
                {
                    return Ok(Outcome::Applied {
                        changed: false,
                        message: format!("{path} already up to date"),
                    });
                }
                if let Some(parent) = target.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(|err| StepError::Failed(format!("create {}: {err}", parent.display())))?;
                }
                tokio::fs::write(&target, content.as_bytes())
                    .await
                    .map_err(|err| StepError::Failed(format!("write {path}: {err}")))?;
                Ok(Outcome::Applied {
                    changed: true,
                    message: format!("wrote {path}"),
                })
            }
            ResourceType::Directory => {
                let path = resource
                    .path
                    .as_deref()
                    .ok_or_else(|| StepError::Failed("directory resource requires path".into()))?;
                let target = self.resolve(path);
                if tokio::fs::metadata(&target).await.is_ok_and(|m| m.is_dir()) {
                    return Ok(Outcome::Applied {
                        changed: false,
                        message: format!("{path} already exists"),
                    });
                }
                tokio::fs::create_dir_all(&target)
                    .await
                    .map_err(|err| StepError::Failed(format!("create {path}: {err}")))?;
                Ok(Outcome::Applied {
                    changed: true,
                    message: format!("created {path}"),
                })
            }
            ResourceType::Command => {
                let command = resource
                    .command
                    .as_deref()
                    .ok_or_else(|| StepError::Failed("command resource requires command".into()))?;
                let output = self.shell(command, ctx).await?;
                if output.status.success() {
                    Ok(Outcome::Applied {
                        changed: true,
                        message: format!("`{command}` exited 0"),
                    })
                } else {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    Err(StepError::Failed(format!(
                        "`{command}` exited with {}: {}",
                        output.status,
                        stderr.trim()
                    )))
                }
            }
            ResourceType::Noop => Ok(Outcome::Applied {
                changed: notified,
                message: if notified { "refreshed".into() } else { "nothing to do".into() },
            }),
        }
    }

    fn emit(&self, run_id: &str, job: &Job, result: &ResourceResult, kind: &str) {
        self.events.record(
            EventDraft::new(
                format!("resource.{kind}"),
                format!("{} {}: {}", result.resource_type, result.resource_id, result.message),
            )
            .field("run_id", run_id)
            .field("job_id", job.id.clone())
            .field("resource_id", result.resource_id.clone())
            .field("type", result.resource_type.clone())
            .field("host", result.host.clone())
            .field("changed", result.changed),
        );
    }
}

fn result_for(resource: &ResourceSpec, changed: bool, skipped: bool, message: String) -> ResourceResult {
    ResourceResult {
        resource_id: resource.id.clone(),
        resource_type: resource.resource_type.as_str().to_string(),
        host: resource.host.clone(),
        changed,
        skipped,
        message,
    }
}

#[async_trait]
impl Runner for ConfigRunner {
    #[instrument(skip(self, ctx, job), fields(job_id = %job.id, config_path = %job.config_path))]
    async fn run(&self, ctx: CancellationToken, job: &Job) -> RunRecord {
        let run_id = self.ids.next_id("run");
        let started_at = self.clock.now();
        let mut results = Vec::new();
        let mut status = RunStatus::Succeeded;
        let mut error = None;

        match load_document(&self.resolve(&job.config_path)).and_then(build_plan) {
            Err(err) => {
                warn!(error = %err, "config could not be planned");
                status = RunStatus::Failed;
                error = Some(err.to_string());
            }
            Ok(plan) => {
                let mut changed: HashSet<String> = HashSet::new();
                for resource in &plan.steps {
                    if status != RunStatus::Succeeded {
                        results.push(result_for(resource, false, true, "not applied after earlier failure".into()));
                        continue;
                    }
                    if ctx.is_cancelled() {
                        status = RunStatus::Canceled;
                        error = Some("run canceled".into());
                        results.push(result_for(resource, false, true, "run canceled".into()));
                        continue;
                    }
                    let notified = resource.subscribe.iter().any(|s| changed.contains(s));
                    match self.apply(resource, notified, &ctx).await {
                        Ok(Outcome::Applied { changed: did_change, message }) => {
                            if did_change {
                                changed.insert(resource.id.clone());
                            }
                            let result = result_for(resource, did_change, false, message);
                            debug!(resource_id = %resource.id, changed = did_change, "resource applied");
                            self.emit(&run_id, job, &result, "applied");
                            results.push(result);
                        }
                        Ok(Outcome::Skipped(message)) => {
                            let result = result_for(resource, false, true, message);
                            self.emit(&run_id, job, &result, "skipped");
                            results.push(result);
                        }
                        Err(StepError::Canceled) => {
                            status = RunStatus::Canceled;
                            error = Some("run canceled".into());
                            results.push(result_for(resource, false, true, "run canceled".into()));
                        }
                        Err(StepError::Failed(message)) => {
                            warn!(resource_id = %resource.id, %message, "resource failed");
                            let result = result_for(resource, false, false, message.clone());
                            self.emit(&run_id, job, &result, "failed");
                            results.push(result);
                            status = RunStatus::Failed;
                            error = Some(format!("resource {} failed: {message}", resource.id));
                        }
                    }
                }
            }
        }

        info!(run_id = %run_id, status = ?status, resources = results.len(), "run finished");
        RunRecord {
            id: run_id,
            job_id: Some(job.id.clone()),
            config_path: job.config_path.clone(),
            started_at,
            ended_at: self.clock.now(),
            status,
            results,
            error,
        }
    }
}
