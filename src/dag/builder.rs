//! Builder for the story dependency graph.
//!
//! Only story-level units take part in scheduling; tasks and subtasks run
//! inside their story's worker.

use crate::errors::SchedulingError;
use crate::state::WorkUnit;
use std::collections::{HashMap, HashSet};

/// Index into the story list.
pub type StoryIndex = usize;

/// A directed graph of stories. Edges point from a dependency to its dependents.
#[derive(Debug, Clone)]
pub struct StoryGraph {
    /// Story ids indexed by position
    ids: Vec<String>,
    index_map: HashMap<String, StoryIndex>,
    /// index -> stories that depend on it
    forward_edges: Vec<Vec<StoryIndex>>,
    /// index -> stories it depends on
    reverse_edges: Vec<Vec<StoryIndex>>,
}

impl StoryGraph {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn id(&self, index: StoryIndex) -> Option<&str> {
        self.ids.get(index).map(String::as_str)
    }

    pub fn get_index(&self, id: &str) -> Option<StoryIndex> {
        self.index_map.get(id).copied()
    }

    /// Stories that depend on the given story.
    pub fn dependents(&self, index: StoryIndex) -> &[StoryIndex] {
        self.forward_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    /// Stories the given story depends on.
    pub fn dependencies(&self, index: StoryIndex) -> &[StoryIndex] {
        self.reverse_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    /// Stories with no dependencies.
    pub fn root_stories(&self) -> Vec<StoryIndex> {
        self.reverse_edges
            .iter()
            .enumerate()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(i, _)| i)
            .collect()
    }

    pub fn dependencies_satisfied(&self, index: StoryIndex, done: &HashSet<StoryIndex>) -> bool {
        self.dependencies(index).iter().all(|dep| done.contains(dep))
    }
}

/// Builder for story graphs.
pub struct DagBuilder<'a> {
    stories: &'a [WorkUnit],
}

impl<'a> DagBuilder<'a> {
    pub fn new(stories: &'a [WorkUnit]) -> Self {
        Self { stories }
    }

    /// Build the graph, validating that ids are unique and every dependency
    /// names a known story. Cycles are left to the scheduler, which reports
    /// them with the stories that could not be placed.
    pub fn build(self) -> Result<StoryGraph, SchedulingError> {
        let mut index_map = HashMap::new();
        let mut ids = Vec::with_capacity(self.stories.len());
        for (i, story) in self.stories.iter().enumerate() {
            if index_map.insert(story.id.clone(), i).is_some() {
                return Err(SchedulingError::DuplicateUnit {
                    id: story.id.clone(),
                });
            }
            ids.push(story.id.clone());
        }

        let mut forward_edges: Vec<Vec<StoryIndex>> = vec![Vec::new(); ids.len()];
        let mut reverse_edges: Vec<Vec<StoryIndex>> = vec![Vec::new(); ids.len()];

        for (to_idx, story) in self.stories.iter().enumerate() {
            for dep in &story.dependencies {
                let from_idx = *index_map.get(dep).ok_or_else(|| {
                    SchedulingError::UnknownDependency {
                        unit: story.id.clone(),
                        dependency: dep.clone(),
                    }
                })?;
                forward_edges[from_idx].push(to_idx);
                reverse_edges[to_idx].push(from_idx);
            }
        }

        Ok(StoryGraph {
            ids,
            index_map,
            forward_edges,
            reverse_edges,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn story(id: &str, deps: &[&str]) -> WorkUnit {
        WorkUnit::story(id, &format!("Story {id}"), deps)
    }

    #[test]
    fn test_build_simple_graph() {
        let stories = vec![
            story("S1", &[]),
            story("S2", &["S1"]),
            story("S3", &["S1"]),
            story("S4", &["S2", "S3"]),
        ];
        let graph = DagBuilder::new(&stories).build().unwrap();

        assert_eq!(graph.len(), 4);
        assert_eq!(graph.root_stories(), vec![0]);
        assert_eq!(graph.dependents(0), &[1, 2]);
        assert_eq!(graph.dependencies(3), &[1, 2]);
        assert_eq!(graph.get_index("S3"), Some(2));
        assert_eq!(graph.id(3), Some("S4"));
    }

    #[test]
    fn test_dependencies_satisfied() {
        let stories = vec![story("S1", &[]), story("S2", &["S1"])];
        let graph = DagBuilder::new(&stories).build().unwrap();

        let mut done = HashSet::new();
        assert!(graph.dependencies_satisfied(0, &done));
        assert!(!graph.dependencies_satisfied(1, &done));
        done.insert(0);
        assert!(graph.dependencies_satisfied(1, &done));
    }

    #[test]
    fn test_duplicate_story() {
        let stories = vec![story("S1", &[]), story("S1", &[])];
        let err = DagBuilder::new(&stories).build().unwrap_err();
        assert_eq!(err, SchedulingError::DuplicateUnit { id: "S1".into() });
    }

    #[test]
    fn test_unknown_dependency() {
        let stories = vec![story("S1", &["S0"])];
        let err = DagBuilder::new(&stories).build().unwrap_err();
        assert_eq!(
            err,
            SchedulingError::UnknownDependency {
                unit: "S1".into(),
                dependency: "S0".into()
            }
        );
    }

    #[test]
    fn test_empty_graph() {
        let graph = DagBuilder::new(&[]).build().unwrap();
        assert!(graph.is_empty());
        assert!(graph.root_stories().is_empty());
    }
}
