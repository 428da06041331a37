//! Batch computation over the story graph.
//!
//! A batch is a set of stories whose dependencies are all satisfied by
//! earlier batches, so its members can run concurrently.

use crate::dag::builder::{DagBuilder, StoryGraph, StoryIndex};
use crate::errors::SchedulingError;
use crate::state::WorkUnit;
use std::collections::HashSet;

/// Dependency-aware batch scheduler.
#[derive(Debug, Clone)]
pub struct DagScheduler {
    graph: StoryGraph,
}

impl DagScheduler {
    /// Build a scheduler over story-level units.
    ///
    /// Fails on duplicate ids, unknown dependencies and cycles.
    pub fn from_units(stories: &[WorkUnit]) -> Result<Self, SchedulingError> {
        let graph = DagBuilder::new(stories).build()?;
        let scheduler = Self { graph };
        scheduler.compute_batches()?;
        Ok(scheduler)
    }

    pub fn unit_count(&self) -> usize {
        self.graph.len()
    }

    pub fn graph(&self) -> &StoryGraph {
        &self.graph
    }

    /// Partition every story into batches.
    pub fn compute_batches(&self) -> Result<Vec<Vec<String>>, SchedulingError> {
        self.batches_after(HashSet::new())
    }

    /// Batches for the stories not yet in `completed`, treating completed
    /// stories as satisfied dependencies. Ids unknown to the graph are ignored.
    pub fn remaining_batches(
        &self,
        completed: &HashSet<String>,
    ) -> Result<Vec<Vec<String>>, SchedulingError> {
        let done = completed
            .iter()
            .filter_map(|id| self.graph.get_index(id))
            .collect();
        self.batches_after(done)
    }

    /// Stories that can be dispatched now.
    pub fn ready_units(&self, completed: &HashSet<String>) -> Vec<String> {
        let done: HashSet<StoryIndex> = completed
            .iter()
            .filter_map(|id| self.graph.get_index(id))
            .collect();
        let mut ready: Vec<String> = (0..self.graph.len())
            .filter(|i| !done.contains(i) && self.graph.dependencies_satisfied(*i, &done))
            .filter_map(|i| self.graph.id(i).map(str::to_string))
            .collect();
        ready.sort();
        ready
    }

    /// Repeatedly extract the stories whose dependencies are all scheduled.
    /// A pass that extracts nothing while stories remain means a cycle.
    fn batches_after(
        &self,
        mut scheduled: HashSet<StoryIndex>,
    ) -> Result<Vec<Vec<String>>, SchedulingError> {
        let mut batches = Vec::new();

        while scheduled.len() < self.graph.len() {
            let ready: Vec<StoryIndex> = (0..self.graph.len())
                .filter(|i| !scheduled.contains(i))
                .filter(|i| self.graph.dependencies_satisfied(*i, &scheduled))
                .collect();

            if ready.is_empty() {
                let mut units: Vec<String> = (0..self.graph.len())
                    .filter(|i| !scheduled.contains(i))
                    .filter_map(|i| self.graph.id(i).map(str::to_string))
                    .collect();
                units.sort();
                return Err(SchedulingError::CyclicDependency { units });
            }

            scheduled.extend(ready.iter().copied());
            let mut batch: Vec<String> = ready
                .into_iter()
                .filter_map(|i| self.graph.id(i).map(str::to_string))
                .collect();
            batch.sort();
            batches.push(batch);
        }

        Ok(batches)
    }
}

/// Refuse to dispatch a unit of `story` while any of the story's
/// dependencies is not completed.
pub fn check_dispatch(story: &WorkUnit, completed: &HashSet<String>) -> Result<(), SchedulingError> {
    let pending: Vec<String> = story
        .dependencies
        .iter()
        .filter(|dep| !completed.contains(*dep))
        .cloned()
        .collect();
    if pending.is_empty() {
        Ok(())
    } else {
        Err(SchedulingError::DependenciesUnmet {
            unit: story.id.clone(),
            pending,
        })
    }
}
