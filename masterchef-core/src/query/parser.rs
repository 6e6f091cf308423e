//! Human query syntax: `field<op>value` terms, ANDed, with `or` between groups.
//!
//! ```text
//! status=queued priority!=low or config_path~"web servers"
//! ```

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use super::QueryAst;
use super::predicate::{Comparator, Condition};
use crate::error::{ControlError, Result};

static TERM: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([A-Za-z0-9_][A-Za-z0-9_.\-]*)\s*(!=|~=|>=|<=|=|~|>|<)\s*(.*)$")
        .unwrap_or_else(|err| panic!("invalid term pattern: {err}"))
});

/// Splits on whitespace outside of double or single quotes.
fn tokenize(input: &str) -> Result<Vec<String>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    for ch in input.chars() {
        match quote {
            Some(q) => {
                current.push(ch);
                if ch == q {
                    quote = None;
                }
            }
            None if ch == '"' || ch == '\'' => {
                quote = Some(ch);
                current.push(ch);
            }
            None if ch.is_whitespace() => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            None => current.push(ch),
        }
    }
    if quote.is_some() {
        return Err(ControlError::InvalidRequest("unterminated quote in query".into()));
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    Ok(tokens)
}

fn unquote(raw: &str) -> &str {
    let trimmed = raw.trim();
    for q in ['"', '\''] {
        if trimmed.len() >= 2 && trimmed.starts_with(q) && trimmed.ends_with(q) {
            return &trimmed[1..trimmed.len() - 1];
        }
    }
    trimmed
}

/// Returns the condition once `buffer` holds a complete term.
fn complete_term(buffer: &str) -> Option<Condition> {
    let caps = TERM.captures(buffer)?;
    let value = caps.get(3)?.as_str();
    if value.trim().is_empty() {
        return None;
    }
    let comparator = Comparator::from_operator(caps.get(2)?.as_str())?;
    Some(Condition::new(
        caps.get(1)?.as_str(),
        comparator,
        Value::String(unquote(value).to_string()),
    ))
}

pub fn parse_human(input: &str) -> Result<QueryAst> {
    let mut groups: Vec<Vec<QueryAst>> = vec![Vec::new()];
    let mut buffer = String::new();

    for token in tokenize(input)? {
        let keyword = token.to_ascii_lowercase();
        if buffer.is_empty() && matches!(keyword.as_str(), "and" | "&&") {
            continue;
        }
        if buffer.is_empty() && matches!(keyword.as_str(), "or" | "||") {
            if groups.last().is_some_and(Vec::is_empty) {
                return Err(ControlError::InvalidRequest("`or` without a preceding term".into()));
            }
            groups.push(Vec::new());
            continue;
        }
        if !buffer.is_empty() {
            buffer.push(' ');
        }
        buffer.push_str(&token);
        if let Some(condition) = complete_term(&buffer) {
            if let Some(group) = groups.last_mut() {
                group.push(QueryAst::Condition(condition));
            }
            buffer.clear();
        }
    }

    if !buffer.is_empty() {
        return Err(ControlError::InvalidRequest(format!("malformed query term {buffer:?}")));
    }
    if groups.len() > 1 && groups.iter().any(Vec::is_empty) {
        return Err(ControlError::InvalidRequest("empty `or` branch in query".into()));
    }

    let mut branches: Vec<QueryAst> = groups.into_iter().map(QueryAst::and).collect();
    Ok(if branches.len() == 1 {
        branches.remove(0)
    } else {
        QueryAst::or(branches)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::LogicalOp;

    fn condition(field: &str, comparator: Comparator, value: &str) -> QueryAst {
        QueryAst::Condition(Condition::new(field, comparator, value))
    }

    #[test]
    fn terms_are_anded_and_or_splits_groups() {
        let ast = parse_human("status=queued priority != low or config_path~\"web servers\"").unwrap();
        assert_eq!(
            ast,
            QueryAst::or(vec![
                QueryAst::and(vec![
                    condition("status", Comparator::Eq, "queued"),
                    condition("priority", Comparator::Ne, "low"),
                ]),
                QueryAst::and(vec![condition("config_path", Comparator::Contains, "web servers")]),
            ])
        );
    }

    #[test]
    fn explicit_and_and_symbolic_operators() {
        let ast = parse_human("attempt>=2 && fields.sev ~= crit || attempt<1").unwrap();
        let QueryAst::Group { op, conditions } = ast else {
            panic!("expected group");
        };
        assert_eq!(op, LogicalOp::Or);
        assert_eq!(conditions.len(), 2);
    }

    #[test]
    fn empty_query_matches_everything() {
        assert_eq!(parse_human("   ").unwrap(), QueryAst::and(Vec::new()));
    }

    #[test]
    fn malformed_queries_are_rejected() {
        assert!(parse_human("status").is_err());
        assert!(parse_human("or status=queued").is_err());
        assert!(parse_human("status=\"open").is_err());
        assert!(parse_human("status=queued or").is_err());
    }
}
