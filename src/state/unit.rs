//! Work units: the Story → Task → Subtask hierarchy produced during planning.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Status of a single work unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    Blocked,
}

impl UnitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitStatus::Pending => "pending",
            UnitStatus::InProgress => "in_progress",
            UnitStatus::Completed => "completed",
            UnitStatus::Failed => "failed",
            UnitStatus::Blocked => "blocked",
        }
    }

    /// Whether moving to this status requires the unit's dependencies to be completed.
    pub fn requires_dependencies(&self) -> bool {
        matches!(self, UnitStatus::InProgress | UnitStatus::Completed)
    }
}

impl std::fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for UnitStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(UnitStatus::Pending),
            "in_progress" | "in-progress" | "inprogress" => Ok(UnitStatus::InProgress),
            "completed" => Ok(UnitStatus::Completed),
            "failed" => Ok(UnitStatus::Failed),
            "blocked" => Ok(UnitStatus::Blocked),
            _ => anyhow::bail!(
                "Invalid unit status '{}'. Valid values: pending, in_progress, completed, failed, blocked",
                s
            ),
        }
    }
}

/// Depth of a unit in the hierarchy, derived from its dotted id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitLevel {
    Story,
    Task,
    Subtask,
}

/// A node of the work hierarchy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkUnit {
    /// Hierarchical id, e.g. `S1`, `S1.T2`, `S1.T2.3`
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub status: UnitStatus,
    /// Story-level only: ids of stories that must complete first
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub dependencies: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<WorkUnit>,
    /// Story-level only
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub acceptance_criteria: Vec<String>,
}

impl WorkUnit {
    pub fn new(id: &str, title: &str) -> Self {
        Self {
            id: id.to_string(),
            title: title.to_string(),
            status: UnitStatus::Pending,
            dependencies: BTreeSet::new(),
            children: Vec::new(),
            acceptance_criteria: Vec::new(),
        }
    }

    /// Create a story with the given dependencies.
    pub fn story(id: &str, title: &str, dependencies: &[&str]) -> Self {
        let mut unit = Self::new(id, title);
        unit.dependencies = dependencies.iter().map(|d| d.to_string()).collect();
        unit
    }

    pub fn with_child(mut self, child: WorkUnit) -> Self {
        self.children.push(child);
        self
    }

    pub fn level(&self) -> UnitLevel {
        match self.id.split('.').count() {
            1 => UnitLevel::Story,
            2 => UnitLevel::Task,
            _ => UnitLevel::Subtask,
        }
    }

    /// Find a unit by id in this subtree (including self).
    pub fn find(&self, id: &str) -> Option<&WorkUnit> {
        if self.id == id {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(id))
    }

    pub fn find_mut(&mut self, id: &str) -> Option<&mut WorkUnit> {
        if self.id == id {
            return Some(self);
        }
        self.children.iter_mut().find_map(|c| c.find_mut(id))
    }

    /// Ids of every unit in this subtree, depth first.
    pub fn ids(&self) -> Vec<String> {
        let mut out = vec![self.id.clone()];
        for child in &self.children {
            out.extend(child.ids());
        }
        out
    }

    /// Set the status of this unit and every descendant.
    pub fn set_subtree_status(&mut self, status: UnitStatus) {
        self.status = status;
        for child in &mut self.children {
            child.set_subtree_status(status);
        }
    }

    /// Status of the unit as seen through its descendants.
    ///
    /// A parent is never reported more advanced than its least advanced
    /// descendant: it is `completed` only when it and every child are
    /// `completed`. Any failed descendant makes the parent `failed`, any
    /// blocked one makes it `blocked`.
    pub fn effective_status(&self) -> UnitStatus {
        if self.children.is_empty() {
            return self.status;
        }
        let child_statuses: Vec<UnitStatus> =
            self.children.iter().map(|c| c.effective_status()).collect();

        if self.status == UnitStatus::Failed || child_statuses.contains(&UnitStatus::Failed) {
            return UnitStatus::Failed;
        }
        if self.status == UnitStatus::Blocked || child_statuses.contains(&UnitStatus::Blocked) {
            return UnitStatus::Blocked;
        }
        let all_done = self.status == UnitStatus::Completed
            && child_statuses.iter().all(|s| *s == UnitStatus::Completed);
        if all_done {
            return UnitStatus::Completed;
        }
        let started = self.status != UnitStatus::Pending
            || child_statuses.iter().any(|s| *s != UnitStatus::Pending);
        if started {
            UnitStatus::InProgress
        } else {
            UnitStatus::Pending
        }
    }
}
