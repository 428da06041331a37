use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;

use crate::state::WorkUnit;

/// Decomposes a request into story-level work units.
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, request: &str) -> Result<Vec<WorkUnit>>;
}

/// Reads a plan from a JSON file: either an array of units or `{"units": [...]}`.
pub struct FilePlanner {
    path: PathBuf,
}

impl FilePlanner {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PlanDocument {
    Units(Vec<WorkUnit>),
    Wrapped { units: Vec<WorkUnit> },
}

/// Parse a plan document.
pub fn parse_plan(content: &str) -> Result<Vec<WorkUnit>> {
    let doc: PlanDocument = serde_json::from_str(content).context("Failed to parse plan")?;
    Ok(match doc {
        PlanDocument::Units(units) | PlanDocument::Wrapped { units } => units,
    })
}

#[async_trait]
impl Planner for FilePlanner {
    async fn plan(&self, _request: &str) -> Result<Vec<WorkUnit>> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read plan file: {}", self.path.display()))?;
        parse_plan(&content).with_context(|| format!("Invalid plan file: {}", self.path.display()))
    }
}

/// A fixed list of units.
pub struct StaticPlanner {
    units: Vec<WorkUnit>,
}

impl StaticPlanner {
    pub fn new(units: Vec<WorkUnit>) -> Self {
        Self { units }
    }
}

#[async_trait]
impl Planner for StaticPlanner {
    async fn plan(&self, _request: &str) -> Result<Vec<WorkUnit>> {
        Ok(self.units.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parse_plan_shapes() {
        let units = parse_plan(r#"[{"id":"S1"},{"id":"S2","dependencies":["S1"]}]"#).unwrap();
        assert_eq!(units.len(), 2);
        assert!(units[1].dependencies.contains("S1"));

        let units = parse_plan(r#"{"units":[{"id":"S1","title":"Form"}]}"#).unwrap();
        assert_eq!(units[0].title, "Form");

        assert!(parse_plan(r#"{"stories":[]}"#).is_err());
    }

    #[tokio::test]
    async fn test_file_planner() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("plan.json");
        std::fs::write(&path, r#"[{"id":"S1","children":[{"id":"S1.T1"}]}]"#).unwrap();

        let units = FilePlanner::new(&path).plan("add login").await.unwrap();
        assert_eq!(units[0].children[0].id, "S1.T1");

        let missing = FilePlanner::new(dir.path().join("nope.json"))
            .plan("add login")
            .await;
        assert!(missing.is_err());
    }
}
