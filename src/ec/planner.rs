//! Task-graph builders for systematic Reed-Solomon codes
//!
//! The worker never decides how a stripe is coded; it runs whatever graph
//! the coordinator hands it. These builders produce the graphs a
//! coordinator would send for a systematic Cauchy Reed-Solomon code, and are
//! what the loopback coordinator in the test-suite uses.
//!
//! With sub-packetization `w` every sub-slice index is coded independently:
//! one task per sub-slice, children `c·w + s` for the `k` source fragments.

use super::gf::Matrix;
use super::task::{SymbolId, Task, TaskGraph};
use crate::error::{Error, Result};

/// Loads and tasks for rebuilding fragments from survivors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodePlan {
    /// Fragment indices to read, ascending
    pub load: Vec<usize>,
    /// Graph producing the requested fragments from `load`
    pub graph: TaskGraph,
}

fn symbol(fragment: usize, sub: usize, w: usize) -> SymbolId {
    (fragment * w + sub) as SymbolId
}

/// Graph computing the `n - k` parity fragments from the `k` data fragments.
pub fn encode_graph(n: usize, k: usize, w: usize) -> Result<TaskGraph> {
    if w == 0 {
        return Err(Error::InvalidEcConfig("w must be >= 1".into()));
    }
    let generator = Matrix::systematic_cauchy(n, k)?;
    if n == k {
        return Ok(TaskGraph::default());
    }

    let tasks = (0..w)
        .map(|sub| {
            let children = (0..k).map(|c| symbol(c, sub, w)).collect();
            (k..n).fold(Task::new(children), |task, p| {
                task.with_row(symbol(p, sub, w), generator.row(p).to_vec())
            })
        })
        .collect();
    Ok(TaskGraph::new(tasks))
}

/// Plan rebuilding `targets` from the fragments in `available`.
///
/// Reads the `k` lowest-indexed survivors, which keeps healthy data
/// fragments in the load set whenever possible.
pub fn decode_plan(
    n: usize,
    k: usize,
    w: usize,
    available: &[usize],
    targets: &[usize],
) -> Result<DecodePlan> {
    if w == 0 {
        return Err(Error::InvalidEcConfig("w must be >= 1".into()));
    }
    if let Some(&bad) = available.iter().chain(targets).find(|&&i| i >= n) {
        return Err(Error::InvalidEcConfig(format!(
            "fragment index {} out of range for n={}",
            bad, n
        )));
    }

    let mut load: Vec<usize> = available.to_vec();
    load.sort_unstable();
    load.dedup();
    if load.len() < k {
        return Err(Error::InsufficientShards {
            available: load.len(),
            required: k,
        });
    }
    load.truncate(k);

    let generator = Matrix::systematic_cauchy(n, k)?;
    let decode = generator.select_rows(&load).invert()?;
    // fragment_t = G_t · data = G_t · (G_load)^-1 · loaded
    let coefficients = generator.select_rows(targets).mul(&decode)?;

    let tasks = (0..w)
        .map(|sub| {
            let children = load.iter().map(|&l| symbol(l, sub, w)).collect();
            targets
                .iter()
                .enumerate()
                .fold(Task::new(children), |task, (row, &t)| {
                    task.with_row(symbol(t, sub, w), coefficients.row(row).to_vec())
                })
        })
        .collect();

    Ok(DecodePlan {
        load,
        graph: TaskGraph::new(tasks),
    })
}
