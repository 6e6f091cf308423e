use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::model::{CreateRule, EMITTED_BY_RULE, Rule, RuleAction};
use crate::clock::{Clock, IdGenerator};
use crate::config::RuleEngineConfig;
use crate::error::{ControlError, Result};
use crate::events::{Event, EventDraft, EventStore};
use crate::queue::{EnqueueRequest, JobQueue};
use crate::store::KeyedStore;

/// Evaluates rules against the event stream, one event at a time.
pub struct RuleEngine {
    config: RuleEngineConfig,
    clock: Arc<dyn Clock>,
    ids: Arc<IdGenerator>,
    events: Arc<EventStore>,
    queue: Arc<JobQueue>,
    rules: Arc<KeyedStore<Rule>>,
    flags: RwLock<BTreeMap<String, Value>>,
    shutdown: CancellationToken,
}

impl fmt::Debug for RuleEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuleEngine")
            .field("rules", &self.rules.len())
            .field("shutdown_cancelled", &self.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl RuleEngine {
    pub fn new(
        config: RuleEngineConfig,
        clock: Arc<dyn Clock>,
        ids: Arc<IdGenerator>,
        events: Arc<EventStore>,
        queue: Arc<JobQueue>,
        rules: Arc<KeyedStore<Rule>>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            clock,
            ids,
            events,
            queue,
            rules,
            flags: RwLock::new(BTreeMap::new()),
            shutdown,
        }
    }

    pub fn store(&self) -> Arc<KeyedStore<Rule>> {
        Arc::clone(&self.rules)
    }

    pub fn list(&self) -> Vec<Rule> {
        self.rules.values()
    }

    pub fn get(&self, id: &str) -> Result<Rule> {
        self.rules
            .get(id)
            .ok_or_else(|| ControlError::NotFound(format!("rule {id}")))
    }

    pub fn flags(&self) -> BTreeMap<String, Value> {
        self.flags.read().clone()
    }

    fn validate_action(&self, action: &RuleAction) -> Result<()> {
        match action {
            RuleAction::EnqueueApply { config_path, .. } => {
                self.queue.resolve_config_path(config_path).map(|_| ())
            }
            RuleAction::EmitEvent { event_type, .. } if event_type.trim().is_empty() => Err(
                ControlError::InvalidRequest("emit_event requires a type".into()),
            ),
            RuleAction::SetFlag { name, .. } if name.trim().is_empty() => Err(
                ControlError::InvalidRequest("set_flag requires a name".into()),
            ),
            _ => Ok(()),
        }
    }

    pub fn create(&self, request: CreateRule) -> Result<Rule> {
        let source_prefix = request.source_prefix.trim().to_string();
        if source_prefix.is_empty() {
            return Err(ControlError::InvalidRequest("source_prefix is required".into()));
        }
        if request.actions.is_empty() {
            return Err(ControlError::InvalidRequest("a rule needs at least one action".into()));
        }
        if request.conditions.iter().any(|c| c.field.trim().is_empty()) {
            return Err(ControlError::InvalidRequest("rule condition has an empty field".into()));
        }
        request
            .actions
            .iter()
            .try_for_each(|action| self.validate_action(action))?;

        let id = match request.id.as_deref().map(str::trim).filter(|id| !id.is_empty()) {
            Some(id) if self.rules.contains(id) => {
                return Err(ControlError::conflict(format!("rule {id} already exists")));
            }
            Some(id) => id.to_string(),
            None => self.ids.next_id("rule"),
        };
        let rule = Rule {
            name: request
                .name
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| id.clone()),
            id,
            source_prefix,
            match_mode: request.match_mode,
            conditions: request.conditions,
            actions: request.actions,
            cooldown_seconds: request.cooldown_seconds,
            enabled: request.enabled,
            created_at: self.clock.now(),
            last_fired_at: None,
            fire_count: 0,
        };
        self.rules.insert(rule.id.clone(), rule.clone())?;
        info!(rule_id = %rule.id, prefix = %rule.source_prefix, "rule created");
        self.events.record(
            EventDraft::new("rule.created", format!("rule {} created", rule.id))
                .field("rule_id", rule.id.clone())
                .field("source_prefix", rule.source_prefix.clone()),
        );
        Ok(rule)
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<Rule> {
        let rule = self
            .rules
            .update(id, |r| {
                r.enabled = enabled;
                r.clone()
            })?
            .ok_or_else(|| ControlError::NotFound(format!("rule {id}")))?;
        let state = if enabled { "enabled" } else { "disabled" };
        self.events.record(
            EventDraft::new(format!("rule.{state}"), format!("rule {id} {state}"))
                .field("rule_id", id),
        );
        Ok(rule)
    }

    /// Runs every matching rule against `event`; returns the ids that fired.
    pub fn process(&self, event: &Event) -> Vec<String> {
        let now = self.clock.now();
        let mut fired = Vec::new();
        for rule in self.rules.values() {
            if !rule.enabled || !rule.matches(event) {
                continue;
            }
            if rule.in_cooldown(now) {
                debug!(rule_id = %rule.id, event_seq = event.seq, "rule in cooldown");
                continue;
            }
            if let Err(err) = self.rules.update(&rule.id, |r| {
                r.last_fired_at = Some(now);
                r.fire_count += 1;
            }) {
                warn!(rule_id = %rule.id, error = %err, "failed to persist rule fire");
            }

            let mut failures = 0usize;
            for (index, action) in rule.actions.iter().enumerate() {
                if let Err(err) = self.apply(&rule, action, event) {
                    failures += 1;
                    warn!(rule_id = %rule.id, action = action.kind(), error = %err, "rule action failed");
                    self.events.record(
                        EventDraft::new("rule.action.failed", format!("rule {} action {} failed", rule.id, action.kind()))
                            .field(EMITTED_BY_RULE, rule.id.clone())
                            .field("rule_id", rule.id.clone())
                            .field("action", action.kind())
                            .field("action_index", index as u64)
                            .field("event_id", event.id.clone())
                            .field("error", err.to_string()),
                    );
                }
            }
            self.events.record(
                EventDraft::new("rule.fired", format!("rule {} fired on {}", rule.id, event.event_type))
                    .field(EMITTED_BY_RULE, rule.id.clone())
                    .field("rule_id", rule.id.clone())
                    .field("event_id", event.id.clone())
                    .field("event_seq", event.seq)
                    .field("actions", rule.actions.len() as u64)
                    .field("failed_actions", failures as u64),
            );
            fired.push(rule.id.clone());
        }
        fired
    }

    fn apply(&self, rule: &Rule, action: &RuleAction, event: &Event) -> Result<()> {
        match action {
            RuleAction::EnqueueApply {
                config_path,
                priority,
            } => {
                let job = self.queue.enqueue(
                    EnqueueRequest::new(config_path.clone())
                        .with_priority(*priority)
                        .with_source(format!("rule:{}", rule.id))
                        .with_idempotency_key(format!("rule:{}:{}", rule.id, event.id)),
                )?;
                debug!(rule_id = %rule.id, job_id = %job.id, "rule enqueued job");
                Ok(())
            }
            RuleAction::EmitEvent { event_type, fields } => {
                let mut fields: Map<String, Value> = fields.clone();
                fields.insert(EMITTED_BY_RULE.into(), Value::String(rule.id.clone()));
                fields.insert("trigger_event_id".into(), Value::String(event.id.clone()));
                self.events
                    .append(EventDraft::new(event_type.clone(), format!("emitted by rule {}", rule.id)).with_fields(fields))
                    .map(|_| ())
            }
            RuleAction::SetFlag { name, value } => {
                self.flags.write().insert(name.clone(), value.clone());
                debug!(rule_id = %rule.id, flag = %name, "rule set flag");
                Ok(())
            }
        }
    }

    /// Processes retained events after `seen` and returns the last sequence
    /// handled. A gap at the front of the ring means events were truncated
    /// before they could be evaluated; it is logged and recorded.
    fn catch_up(&self, seen: u64) -> u64 {
        let missed = self.events.since_seq(seen);
        let Some(first) = missed.first() else {
            return seen;
        };
        let lost = first.seq.saturating_sub(seen + 1);
        if lost > 0 {
            warn!(lost, after_seq = seen, "rule engine fell behind the event log; events lost");
            self.events.record(
                EventDraft::new("rule.events_skipped", format!("{lost} events were never evaluated by rules"))
                    .field("skipped", lost)
                    .field("after_seq", seen)
                    .field("resumed_at_seq", first.seq),
            );
        }
        if missed.len() > 1 {
            debug!(count = missed.len(), after_seq = seen, "rule engine replaying missed events");
        }
        let mut last = seen;
        for event in &missed {
            self.process(event);
            last = event.seq;
        }
        last
    }

    /// Consumes the event stream until shutdown. When the subscription is
    /// dropped for lagging it resubscribes and replays what it missed from
    /// the retained log.
    pub async fn run(self: Arc<Self>) {
        info!("Rule engine started");
        let mut last_seq = self.events.last_seq();
        'outer: loop {
            let mut subscription = self.events.subscribe(Some(self.config.subscriber_buffer));
            last_seq = self.catch_up(last_seq);
            loop {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break 'outer,
                    next = subscription.recv() => match next {
                        Some(event) if event.seq <= last_seq => {}
                        Some(event) if event.seq > last_seq + 1 => {
                            debug!(last_seq, received = event.seq, "gap in rule engine feed");
                            last_seq = self.catch_up(last_seq);
                        }
                        Some(event) => {
                            last_seq = event.seq;
                            self.process(&event);
                        }
                        None if self.events.is_closed() => break 'outer,
                        None => {
                            warn!(last_seq, "rule engine subscription dropped; resubscribing");
                            continue 'outer;
                        }
                    }
                }
            }
        }
        info!("Rule engine stopped");
    }
}
