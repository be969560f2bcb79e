//! Task graphs
//!
//! A task graph is the coordinator-supplied program the compute engine runs
//! for every stripe of a request: an ordered list of linear-combination
//! steps over GF(2^8) symbols. Symbol `p·w + s` is sub-slice `s` of packet
//! (fragment) `p`; ids at or beyond `n·w` name scratch symbols.
//!
//! Results compose in list order, so a target of one task may be a child
//! of a later task. This is what lets one evaluator serve plain encoding,
//! degraded-read decoding and regenerating-code style partial repair.

use std::collections::{BTreeSet, HashSet};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Global symbol id.
pub type SymbolId = u32;

/// One output row of a task: `target = Σ coefficients[i] · children[i]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRow {
    pub target: SymbolId,
    pub coefficients: Vec<u8>,
}

/// One linear-combination step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Input symbols, in coefficient-column order
    pub children: Vec<SymbolId>,
    /// Output rows
    pub rows: Vec<TaskRow>,
}

impl Task {
    pub fn new(children: Vec<SymbolId>) -> Self {
        Self {
            children,
            rows: Vec::new(),
        }
    }

    /// Builder-style row append.
    pub fn with_row(mut self, target: SymbolId, coefficients: Vec<u8>) -> Self {
        self.rows.push(TaskRow {
            target,
            coefficients,
        });
        self
    }

    pub fn targets(&self) -> impl Iterator<Item = SymbolId> + '_ {
        self.rows.iter().map(|r| r.target)
    }

    /// A task without rows or without children does nothing.
    pub fn is_noop(&self) -> bool {
        self.children.is_empty() || self.rows.is_empty()
    }

    /// Parse a task from its JSON message form.
    pub fn decode(raw: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(raw)?)
    }

    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Shape check: every row is as wide as the child list and no target
    /// repeats.
    pub fn check_shape(&self, index: usize) -> Result<()> {
        let mut seen = HashSet::with_capacity(self.rows.len());
        for row in &self.rows {
            if row.coefficients.len() != self.children.len() {
                return Err(Error::InvalidTaskGraph(format!(
                    "task {}: row for target {} has {} coefficients, expected {}",
                    index,
                    row.target,
                    row.coefficients.len(),
                    self.children.len()
                )));
            }
            if !seen.insert(row.target) {
                return Err(Error::InvalidTaskGraph(format!(
                    "task {}: target {} appears twice",
                    index, row.target
                )));
            }
        }
        Ok(())
    }
}

/// Ordered list of tasks, immutable for the lifetime of a request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskGraph {
    tasks: Vec<Task>,
}

impl TaskGraph {
    pub fn new(tasks: Vec<Task>) -> Self {
        Self { tasks }
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Every symbol written by some task.
    pub fn outputs(&self) -> BTreeSet<SymbolId> {
        self.tasks
            .iter()
            .filter(|t| !t.is_noop())
            .flat_map(Task::targets)
            .collect()
    }

    /// Validate the graph at the trust boundary.
    ///
    /// Checks task shapes and walks the list in order, making sure every
    /// child is either in `available` or produced by an earlier task.
    pub fn validate(&self, available: impl IntoIterator<Item = SymbolId>) -> Result<()> {
        let mut known: HashSet<SymbolId> = available.into_iter().collect();
        for (index, task) in self.tasks.iter().enumerate() {
            task.check_shape(index)?;
            if task.is_noop() {
                continue;
            }
            if let Some(missing) = task.children.iter().find(|c| !known.contains(*c)) {
                return Err(Error::InvalidTaskGraph(format!(
                    "task {}: child symbol {} is neither loaded nor produced earlier",
                    index, missing
                )));
            }
            known.extend(task.targets());
        }
        Ok(())
    }
}

impl From<Vec<Task>> for TaskGraph {
    fn from(tasks: Vec<Task>) -> Self {
        Self::new(tasks)
    }
}
