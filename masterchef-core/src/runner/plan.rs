//! Config documents and the dependency-ordered plan built from them.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ControlError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    File,
    Directory,
    Command,
    Noop,
}

impl ResourceType {
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceType::File => "file",
            ResourceType::Directory => "directory",
            ResourceType::Command => "command",
            ResourceType::Noop => "noop",
        }
    }
}

fn default_host() -> String {
    "localhost".to_string()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub id: String,
    #[serde(rename = "type")]
    pub resource_type: ResourceType,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Shell command; a non-zero exit skips the resource.
    #[serde(default)]
    pub only_if: Option<String>,
    /// Resources whose change re-runs this one.
    #[serde(default)]
    pub subscribe: Vec<String>,
    /// Run only when a subscribed resource changed.
    #[serde(default)]
    pub refresh_only: bool,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub command: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigDocument {
    #[serde(default)]
    pub resources: Vec<ResourceSpec>,
}

/// Resources in an order where every dependency precedes its dependents.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Plan {
    pub steps: Vec<ResourceSpec>,
}

/// Parses a YAML (or JSON) config document.
pub fn parse_document(raw: &str) -> Result<ConfigDocument> {
    if raw.trim().is_empty() {
        return Ok(ConfigDocument::default());
    }
    serde_yaml::from_str(raw)
        .map_err(|err| ControlError::InvalidRequest(format!("invalid config document: {err}")))
}

pub fn load_document(path: &Path) -> Result<ConfigDocument> {
    let raw = std::fs::read_to_string(path).map_err(|err| {
        ControlError::InvalidRequest(format!("cannot read config {}: {err}", path.display()))
    })?;
    parse_document(&raw)
}

/// Orders resources by `depends_on` and `subscribe` edges.
///
/// Ties keep declaration order. Unknown references, duplicate ids and cycles
/// are rejected.
pub fn build_plan(document: ConfigDocument) -> Result<Plan> {
    let resources = document.resources;
    let mut index: HashMap<&str, usize> = HashMap::new();
    for (idx, resource) in resources.iter().enumerate() {
        if resource.id.trim().is_empty() {
            return Err(ControlError::InvalidRequest(format!("resource #{idx} has no id")));
        }
        if index.insert(resource.id.as_str(), idx).is_some() {
            return Err(ControlError::InvalidRequest(format!(
                "duplicate resource id {}",
                resource.id
            )));
        }
    }

    let mut indegree = vec![0usize; resources.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); resources.len()];
    for (idx, resource) in resources.iter().enumerate() {
        let upstream: HashSet<&str> = resource
            .depends_on
            .iter()
            .chain(resource.subscribe.iter())
            .map(String::as_str)
            .collect();
        for dep in upstream {
            let Some(&dep_idx) = index.get(dep) else {
                return Err(ControlError::InvalidRequest(format!(
                    "resource {} references unknown resource {dep}",
                    resource.id
                )));
            };
            if dep_idx == idx {
                return Err(ControlError::InvalidRequest(format!(
                    "resource {} depends on itself",
                    resource.id
                )));
            }
            indegree[idx] += 1;
            dependents[dep_idx].push(idx);
        }
    }

    let mut order = Vec::with_capacity(resources.len());
    let mut placed = vec![false; resources.len()];
    while order.len() < resources.len() {
        let Some(next) = (0..resources.len()).find(|&i| !placed[i] && indegree[i] == 0) else {
            let stuck: Vec<&str> = resources
                .iter()
                .enumerate()
                .filter(|(i, _)| !placed[*i])
                .map(|(_, r)| r.id.as_str())
                .collect();
            return Err(ControlError::InvalidRequest(format!(
                "dependency cycle among resources: {}",
                stuck.join(", ")
            )));
        };
        placed[next] = true;
        order.push(next);
        for &dependent in &dependents[next] {
            indegree[dependent] -= 1;
        }
    }

    let mut slots: Vec<Option<ResourceSpec>> = resources.into_iter().map(Some).collect();
    let steps = order
        .into_iter()
        .filter_map(|idx| slots[idx].take())
        .collect();
    Ok(Plan { steps })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(plan: &Plan) -> Vec<&str> {
        plan.steps.iter().map(|s| s.id.as_str()).collect()
    }

    #[test]
    fn dependencies_run_first_and_ties_keep_declaration_order() {
        let doc = parse_document(
            r#"
resources:
  - id: service
    type: command
    command: "true"
    depends_on: [config]
  - id: motd
    type: file
    path: motd
    content: hello
  - id: config
    type: file
    path: app.conf
    content: x=1
  - id: reload
    type: noop
    subscribe: [config]
    refresh_only: true
"#,
        )
        .unwrap();
        let plan = build_plan(doc).unwrap();
        assert_eq!(ids(&plan), ["motd", "config", "service", "reload"]);
        assert_eq!(plan.steps[0].host, "localhost");
    }

    #[test]
    fn cycles_are_rejected() {
        let doc = parse_document(
            r#"
resources:
  - { id: a, type: noop, depends_on: [b] }
  - { id: b, type: noop, depends_on: [a] }
"#,
        )
        .unwrap();
        let err = build_plan(doc).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let doc = parse_document("resources:\n  - { id: a, type: noop, depends_on: [ghost] }\n").unwrap();
        assert!(build_plan(doc).unwrap_err().to_string().contains("ghost"));
    }

    #[test]
    fn empty_document_is_an_empty_plan() {
        assert!(build_plan(parse_document("").unwrap()).unwrap().steps.is_empty());
    }
}
