//! Converge triggers: external signals that may induce an apply.
//!
//! Every trigger is checked against the freeze and maintenance gates before
//! anything else, so a frozen control plane reports `blocked` even for
//! triggers that would only have been recorded.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::admission::{AdmissionSet, MaintenanceTarget};
use crate::clock::{Clock, IdGenerator};
use crate::error::{ControlError, Result};
use crate::events::{EventDraft, EventStore};
use crate::queue::{EnqueueRequest, JobPriority, JobQueue};
use crate::store::KeyedStore;

/// Gates consulted before a trigger is recorded or enqueued.
const TRIGGER_GATES: [&str; 2] = ["freeze", "maintenance"];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerStatus {
    Queued,
    Recorded,
    Blocked,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TriggerRecord {
    pub id: String,
    pub source: String,
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_path: Option<String>,
    pub status: TriggerStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub received_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct TriggerRequest {
    pub source: String,
    pub event_type: String,
    #[serde(default)]
    pub event_id: Option<String>,
    #[serde(default)]
    pub config_path: Option<String>,
    /// Defaults to `true` when a `config_path` is given.
    #[serde(default)]
    pub auto_enqueue: Option<bool>,
    #[serde(default)]
    pub priority: JobPriority,
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub target: Option<MaintenanceTarget>,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

#[derive(Clone, Debug, Serialize)]
pub struct TriggerPage {
    pub items: Vec<TriggerRecord>,
    pub total: usize,
    pub offset: usize,
    pub limit: usize,
}

#[derive(Debug)]
pub struct TriggerIngress {
    clock: Arc<dyn Clock>,
    ids: Arc<IdGenerator>,
    events: Arc<EventStore>,
    admission: Arc<AdmissionSet>,
    queue: Arc<JobQueue>,
    records: Arc<KeyedStore<TriggerRecord>>,
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
}

impl TriggerIngress {
    pub fn new(
        clock: Arc<dyn Clock>,
        ids: Arc<IdGenerator>,
        events: Arc<EventStore>,
        admission: Arc<AdmissionSet>,
        queue: Arc<JobQueue>,
        records: Arc<KeyedStore<TriggerRecord>>,
    ) -> Self {
        Self {
            clock,
            ids,
            events,
            admission,
            queue,
            records,
        }
    }

    pub fn store(&self) -> Arc<KeyedStore<TriggerRecord>> {
        Arc::clone(&self.records)
    }

    pub fn get(&self, id: &str) -> Result<TriggerRecord> {
        self.records
            .get(id)
            .ok_or_else(|| ControlError::NotFound(format!("trigger {id}")))
    }

    /// Records in arrival order.
    pub fn list(&self, offset: usize, limit: usize) -> TriggerPage {
        let all = self.records.values();
        let limit = limit.clamp(1, 1_000);
        TriggerPage {
            total: all.len(),
            items: all.into_iter().skip(offset).take(limit).collect(),
            offset,
            limit,
        }
    }

    pub fn ingest(&self, request: TriggerRequest) -> Result<TriggerRecord> {
        let source = request.source.trim().to_ascii_lowercase();
        let event_type = request.event_type.trim().to_string();
        if source.is_empty() || event_type.is_empty() {
            return Err(ControlError::InvalidRequest("source and event_type are required".into()));
        }
        let config_path = non_empty(&request.config_path);
        let auto_enqueue = request.auto_enqueue.unwrap_or(config_path.is_some());
        if auto_enqueue && config_path.is_none() {
            return Err(ControlError::InvalidRequest("auto_enqueue requires config_path".into()));
        }
        let event_id = non_empty(&request.event_id);
        // A blocked delivery is re-evaluated in place under the same record id.
        let mut retry_of = None;
        if let Some(event_id) = &event_id
            && let Some(existing) = self
                .records
                .find(|r| r.source == source && r.event_id.as_ref() == Some(event_id))
        {
            if existing.status != TriggerStatus::Blocked {
                return Ok(existing);
            }
            retry_of = Some(existing.id);
        }

        let enqueue = EnqueueRequest {
            config_path: config_path.clone().unwrap_or_default(),
            priority: request.priority,
            idempotency_key: event_id.as_ref().map(|e| format!("trigger:{source}:{e}")),
            force: request.force,
            target: request.target.clone(),
            source: format!("trigger:{source}"),
            ..Default::default()
        };

        let mut record = TriggerRecord {
            id: retry_of.unwrap_or_else(|| self.ids.next_id("trg")),
            source: source.clone(),
            event_type: event_type.clone(),
            event_id,
            config_path,
            status: TriggerStatus::Recorded,
            job_id: None,
            gate: None,
            reason: None,
            received_at: self.clock.now(),
        };

        let gate_check = self.admission.evaluate_only(
            &TRIGGER_GATES,
            &enqueue.admission_request(),
            &self.queue.admission_context(),
        );
        if !gate_check.allowed {
            record.status = TriggerStatus::Blocked;
            record.gate = gate_check.gate;
            record.reason = gate_check.reason;
        } else if auto_enqueue {
            match self.queue.enqueue(enqueue) {
                Ok(job) => {
                    record.status = TriggerStatus::Queued;
                    record.job_id = Some(job.id);
                }
                Err(ControlError::Conflict { message, gate, reason }) => {
                    record.status = TriggerStatus::Blocked;
                    record.gate = gate;
                    record.reason = reason.or(Some(message));
                }
                Err(err @ ControlError::Exhausted(_)) => {
                    record.status = TriggerStatus::Blocked;
                    record.reason = Some(err.to_string());
                }
                Err(err) => return Err(err),
            }
        }

        self.records.insert(record.id.clone(), record.clone())?;
        match record.status {
            TriggerStatus::Blocked => warn!(
                trigger_id = %record.id,
                %source,
                reason = record.reason.as_deref().unwrap_or(""),
                "converge trigger blocked"
            ),
            _ => info!(trigger_id = %record.id, %source, status = ?record.status, "converge trigger accepted"),
        }
        self.events.record(
            EventDraft::new(
                format!("trigger.{source}"),
                format!("{event_type} trigger {}", status_str(record.status)),
            )
            .field("trigger_id", record.id.clone())
            .field("event_type", event_type)
            .field("status", status_str(record.status))
            .field_opt("job_id", record.job_id.clone())
            .field_opt("gate", record.gate.clone())
            .field_opt("reason", record.reason.clone())
            .field("payload", Value::Object(request.fields)),
        );
        Ok(record)
    }
}

fn status_str(status: TriggerStatus) -> &'static str {
    match status {
        TriggerStatus::Queued => "queued",
        TriggerStatus::Recorded => "recorded",
        TriggerStatus::Blocked => "blocked",
    }
}
