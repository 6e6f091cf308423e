//! Pattern → action rules evaluated over the event stream.

mod engine;
mod model;

pub use engine::RuleEngine;
pub use model::{CreateRule, EMITTED_BY_RULE, MatchMode, Rule, RuleAction};
