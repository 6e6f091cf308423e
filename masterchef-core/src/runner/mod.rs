//! Executes a job's configuration and reports a [`RunRecord`].

mod config_runner;
pub mod plan;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

pub use config_runner::ConfigRunner;

use crate::queue::Job;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Succeeded,
    Failed,
    Canceled,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResourceResult {
    pub resource_id: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    pub host: String,
    pub changed: bool,
    pub skipped: bool,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    pub config_path: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub status: RunStatus,
    pub results: Vec<ResourceResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Applies a job. Implementations must return promptly once `ctx` is
/// cancelled, reporting [`RunStatus::Canceled`].
#[async_trait]
pub trait Runner: Send + Sync + fmt::Debug {
    async fn run(&self, ctx: CancellationToken, job: &Job) -> RunRecord;
}
