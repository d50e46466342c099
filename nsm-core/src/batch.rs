//! Parallel runs of independent simulations.
//!
//! Each run owns its topology, integrators and problems; nothing is shared
//! between runs, so they are advanced on the rayon thread pool and collected
//! in index order.

use crate::error::Result;
use crate::simulation::{RunReport, Simulation};
use rayon::prelude::*;
use tracing::info;

/// One finished run of a batch.
#[derive(Debug)]
pub struct BatchRun<S> {
    pub index: usize,
    pub simulation: S,
    pub report: RunReport,
}

/// Build `count` simulations with `factory(index)` and run each to its final time.
///
/// Results are in index order whatever the scheduling; a failed build or run
/// only affects its own entry.
pub fn run_batch<S, F>(count: usize, factory: F) -> Vec<Result<BatchRun<S>>>
where
    S: Simulation + Send,
    F: Fn(usize) -> Result<S> + Sync,
{
    let runs: Vec<Result<BatchRun<S>>> = (0..count)
        .into_par_iter()
        .map(|index| {
            let mut simulation = factory(index)?;
            let report = simulation.run()?;
            Ok(BatchRun {
                index,
                simulation,
                report,
            })
        })
        .collect();
    let failed = runs.iter().filter(|run| run.is_err()).count();
    info!(count, failed, "batch finished");
    runs
}
