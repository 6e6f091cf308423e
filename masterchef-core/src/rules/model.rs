use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::events::Event;
use crate::query::predicate::{Condition, lookup};
use crate::queue::JobPriority;

/// Field stamped on events produced by a rule so the rule ignores them.
pub const EMITTED_BY_RULE: &str = "emitted_by_rule";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    #[default]
    All,
    Any,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    EnqueueApply {
        config_path: String,
        #[serde(default)]
        priority: JobPriority,
    },
    EmitEvent {
        #[serde(rename = "type")]
        event_type: String,
        #[serde(default)]
        fields: Map<String, Value>,
    },
    SetFlag {
        name: String,
        #[serde(default)]
        value: Value,
    },
}

impl RuleAction {
    pub fn kind(&self) -> &'static str {
        match self {
            RuleAction::EnqueueApply { .. } => "enqueue_apply",
            RuleAction::EmitEvent { .. } => "emit_event",
            RuleAction::SetFlag { .. } => "set_flag",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub name: String,
    pub source_prefix: String,
    #[serde(default)]
    pub match_mode: MatchMode,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    pub actions: Vec<RuleAction>,
    #[serde(default)]
    pub cooldown_seconds: u64,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_fired_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub fire_count: u64,
}

impl Rule {
    /// Type prefix and conditions; enablement and cooldown are checked by the engine.
    ///
    /// Condition fields resolve against the event record first (`type`,
    /// `message`, `fields.sev`) and then against `fields` (`sev`).
    pub fn matches(&self, event: &Event) -> bool {
        if !event.event_type.starts_with(&self.source_prefix) {
            return false;
        }
        if event
            .fields
            .get(EMITTED_BY_RULE)
            .and_then(Value::as_str)
            .is_some_and(|id| id == self.id)
        {
            return false;
        }
        if self.conditions.is_empty() {
            return true;
        }
        let record = event.to_record();
        let holds = |condition: &Condition| {
            let actual = lookup(&record, &condition.field).or_else(|| lookup(&event.fields, &condition.field));
            condition.comparator.evaluate(actual, &condition.value)
        };
        match self.match_mode {
            MatchMode::All => self.conditions.iter().all(holds),
            MatchMode::Any => self.conditions.iter().any(holds),
        }
    }

    pub fn in_cooldown(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_seconds > 0
            && self.last_fired_at.is_some_and(|last| {
                now.signed_duration_since(last) < chrono::Duration::seconds(self.cooldown_seconds as i64)
            })
    }
}

fn default_enabled() -> bool {
    true
}

#[derive(Clone, Debug, Deserialize)]
pub struct CreateRule {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    pub source_prefix: String,
    #[serde(default)]
    pub match_mode: MatchMode,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    pub actions: Vec<RuleAction>,
    #[serde(default)]
    pub cooldown_seconds: u64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Comparator;
    use serde_json::json;

    fn event(event_type: &str, fields: Value) -> Event {
        Event {
            id: "evt-1".into(),
            seq: 1,
            time: Utc::now(),
            event_type: event_type.into(),
            message: "disk alert".into(),
            fields: fields.as_object().cloned().unwrap_or_default(),
            prev_hash: String::new(),
            hash: String::new(),
        }
    }

    fn rule(mode: MatchMode, conditions: Vec<Condition>) -> Rule {
        Rule {
            id: "rule-1".into(),
            name: "alerts".into(),
            source_prefix: "external.alert".into(),
            match_mode: mode,
            conditions,
            actions: Vec::new(),
            cooldown_seconds: 0,
            enabled: true,
            created_at: Utc::now(),
            last_fired_at: None,
            fire_count: 0,
        }
    }

    #[test]
    fn conditions_resolve_against_record_and_fields() {
        let ev = event("external.alert.disk", json!({"sev": "critical", "host": "db"}));
        let all = rule(
            MatchMode::All,
            vec![
                Condition::new("fields.sev", Comparator::Eq, "critical"),
                Condition::new("host", Comparator::Eq, "db"),
                Condition::new("message", Comparator::Contains, "disk"),
            ],
        );
        assert!(all.matches(&ev));

        let any = rule(
            MatchMode::Any,
            vec![
                Condition::new("sev", Comparator::Eq, "low"),
                Condition::new("host", Comparator::Prefix, "d"),
            ],
        );
        assert!(any.matches(&ev));
        assert!(!rule(MatchMode::All, vec![Condition::new("sev", Comparator::Eq, "low")]).matches(&ev));
    }

    #[test]
    fn prefix_mismatch_and_own_emissions_are_ignored() {
        let r = rule(MatchMode::All, Vec::new());
        assert!(!r.matches(&event("internal.alert", json!({}))));
        assert!(!r.matches(&event("external.alert", json!({ "emitted_by_rule": "rule-1" }))));
        assert!(r.matches(&event("external.alert", json!({ "emitted_by_rule": "rule-2" }))));
    }

    #[test]
    fn cooldown_is_measured_from_last_fire() {
        let now = Utc::now();
        let mut r = rule(MatchMode::All, Vec::new());
        r.cooldown_seconds = 60;
        assert!(!r.in_cooldown(now));
        r.last_fired_at = Some(now - chrono::Duration::seconds(30));
        assert!(r.in_cooldown(now));
        r.last_fired_at = Some(now - chrono::Duration::seconds(61));
        assert!(!r.in_cooldown(now));
    }

    #[test]
    fn actions_use_externally_tagged_json() {
        let actions: Vec<RuleAction> = serde_json::from_value(json!([
            {"enqueue_apply": {"config_path": "c.yaml", "priority": "high"}},
            {"emit_event": {"type": "ops.page", "fields": {"team": "infra"}}},
            {"set_flag": {"name": "degraded", "value": true}}
        ]))
        .unwrap();
        assert_eq!(
            actions[0],
            RuleAction::EnqueueApply {
                config_path: "c.yaml".into(),
                priority: JobPriority::High
            }
        );
        assert_eq!(actions[1].kind(), "emit_event");
        assert_eq!(actions[2].kind(), "set_flag");
    }
}
