use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// `prev_hash` of the first event ever appended.
pub const GENESIS_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// A sealed entry in the event log.
///
/// `hash` commits to `prev_hash` and the canonical JSON of every other field,
/// so editing any event breaks the chain at that position.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub id: String,
    pub seq: u64,
    pub time: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: String,
    pub message: String,
    #[serde(default)]
    pub fields: Map<String, Value>,
    pub prev_hash: String,
    pub hash: String,
}

impl Event {
    /// Canonical encoding of the event without its `hash`.
    pub fn canonical(&self) -> String {
        let mut body = Map::new();
        body.insert("id".into(), Value::String(self.id.clone()));
        body.insert("seq".into(), Value::from(self.seq));
        body.insert(
            "time".into(),
            Value::String(self.time.to_rfc3339_opts(SecondsFormat::Nanos, true)),
        );
        body.insert("type".into(), Value::String(self.event_type.clone()));
        body.insert("message".into(), Value::String(self.message.clone()));
        body.insert("fields".into(), Value::Object(self.fields.clone()));
        body.insert("prev_hash".into(), Value::String(self.prev_hash.clone()));
        canonical_json(&Value::Object(body))
    }

    pub fn compute_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.prev_hash.as_bytes());
        hasher.update(self.canonical().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Event as a JSON mapping, for predicate evaluation.
    pub fn to_record(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }

    pub fn matches(&self, query: &EventQuery) -> bool {
        if let Some(since) = query.since
            && self.time < since
        {
            return false;
        }
        if let Some(until) = query.until
            && self.time > until
        {
            return false;
        }
        if let Some(prefix) = query.type_prefix.as_deref()
            && !prefix.is_empty()
            && !self
                .event_type
                .to_ascii_lowercase()
                .starts_with(&prefix.to_ascii_lowercase())
        {
            return false;
        }
        if let Some(needle) = query.contains.as_deref()
            && !needle.is_empty()
        {
            let needle = needle.to_lowercase();
            if !self.event_type.to_lowercase().contains(&needle)
                && !self.message.to_lowercase().contains(&needle)
            {
                return false;
            }
        }
        true
    }
}

/// Unsealed event handed to [`super::EventStore::append`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EventDraft {
    pub event_type: String,
    pub message: String,
    pub fields: Map<String, Value>,
}

impl EventDraft {
    pub fn new(event_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            message: message.into(),
            fields: Map::new(),
        }
    }

    pub fn field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Adds the field only when a value is present.
    pub fn field_opt<V: Into<Value>>(
        self,
        key: impl Into<String>,
        value: Option<V>,
    ) -> Self {
        match value {
            Some(value) => self.field(key, value),
            None => self,
        }
    }

    pub fn with_fields(mut self, fields: Map<String, Value>) -> Self {
        self.fields.extend(fields);
        self
    }
}

/// Filters accepted by [`super::EventStore::query`].
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EventQuery {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub type_prefix: Option<String>,
    pub contains: Option<String>,
    /// Keeps the most recent `limit` matches.
    pub limit: Option<usize>,
    /// Newest first; only affects output order.
    #[serde(default)]
    pub desc: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub valid: bool,
    pub checked: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub break_at: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Compact JSON with object keys sorted at every depth.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (idx, key) in keys.into_iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
