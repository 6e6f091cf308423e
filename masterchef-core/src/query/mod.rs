//! Entity-agnostic predicate queries over registered record sources.

mod parser;
pub mod predicate;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

pub use parser::parse_human;
pub use predicate::{Comparator, Condition};

use crate::error::{ControlError, Result};
use crate::store::RecordSource;

pub const DEFAULT_LIMIT: usize = 100;
pub const MAX_LIMIT: usize = 1_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogicalOp {
    And,
    Or,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryAst {
    Group {
        op: LogicalOp,
        conditions: Vec<QueryAst>,
    },
    Condition(Condition),
}

impl QueryAst {
    pub fn and(conditions: Vec<QueryAst>) -> Self {
        QueryAst::Group {
            op: LogicalOp::And,
            conditions,
        }
    }

    pub fn or(conditions: Vec<QueryAst>) -> Self {
        QueryAst::Group {
            op: LogicalOp::Or,
            conditions,
        }
    }

    /// An empty `and` matches everything; an empty `or` matches nothing.
    pub fn matches(&self, record: &Map<String, Value>) -> bool {
        match self {
            QueryAst::Condition(condition) => condition.matches(record),
            QueryAst::Group {
                op: LogicalOp::And,
                conditions,
            } => conditions.iter().all(|c| c.matches(record)),
            QueryAst::Group {
                op: LogicalOp::Or,
                conditions,
            } => conditions.iter().any(|c| c.matches(record)),
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            QueryAst::Condition(condition) if condition.field.trim().is_empty() => {
                Err(ControlError::InvalidRequest("query condition has an empty field".into()))
            }
            QueryAst::Condition(_) => Ok(()),
            QueryAst::Group { conditions, .. } => conditions.iter().try_for_each(QueryAst::validate),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryMode {
    #[default]
    Human,
    Ast,
}

#[derive(Clone, Debug, Deserialize)]
pub struct QueryRequest {
    pub entity: String,
    #[serde(default)]
    pub mode: QueryMode,
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub ast: Option<QueryAst>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Clone, Debug, Serialize)]
pub struct QueryResponse {
    pub entity: String,
    pub matched_count: usize,
    pub items: Vec<Map<String, Value>>,
    pub ast: QueryAst,
}

/// Registry of named record sources.
#[derive(Default)]
pub struct QueryFacade {
    sources: RwLock<BTreeMap<String, Arc<dyn RecordSource>>>,
}

impl fmt::Debug for QueryFacade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryFacade")
            .field("entities", &self.entities())
            .finish()
    }
}

impl QueryFacade {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, entity: impl Into<String>, source: Arc<dyn RecordSource>) {
        self.sources.write().insert(entity.into(), source);
    }

    pub fn entities(&self) -> Vec<String> {
        self.sources.read().keys().cloned().collect()
    }

    pub fn compile(request: &QueryRequest) -> Result<QueryAst> {
        let ast = match request.mode {
            QueryMode::Human => parse_human(request.query.as_deref().unwrap_or_default())?,
            QueryMode::Ast => request
                .ast
                .clone()
                .ok_or_else(|| ControlError::InvalidRequest("ast mode requires an `ast`".into()))?,
        };
        ast.validate()?;
        Ok(ast)
    }

    pub fn query(&self, request: &QueryRequest) -> Result<QueryResponse> {
        let entity = request.entity.trim().to_ascii_lowercase();
        let source = self
            .sources
            .read()
            .get(&entity)
            .cloned()
            .ok_or_else(|| ControlError::InvalidRequest(format!("unknown entity {:?}", request.entity)))?;
        let ast = Self::compile(request)?;
        let limit = request.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);

        let matched: Vec<Map<String, Value>> = source
            .list_records()
            .into_iter()
            .filter(|record| ast.matches(record))
            .collect();
        let matched_count = matched.len();
        debug!(%entity, matched_count, "query evaluated");
        Ok(QueryResponse {
            entity,
            matched_count,
            items: matched.into_iter().take(limit).collect(),
            ast,
        })
    }
}
