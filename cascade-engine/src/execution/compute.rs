// Module Computation
// The seam between the engine and the work a module performs

use crate::execution::tasks::ProgressHandle;
use crate::workflow::models::{ModelGroup, Module, Output};

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

/// Outputs of upstream units, keyed by unit id
pub type ComputeInputs = BTreeMap<String, Vec<Output>>;

/// Everything a module needs to compute
#[derive(Debug, Clone)]
pub struct ModuleRequest {
    pub group_id: String,
    pub module: Module,
    /// Outputs of the group's upstream groups and the module's dependencies
    pub inputs: ComputeInputs,
}

/// Failure reported by a computation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ComputeError {
    pub message: String,
}

impl ComputeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Computation backing modules and groups
///
/// Implementations call [`ProgressHandle::checkpoint`] between steps so a
/// pause suspends them without losing progress.
#[async_trait]
pub trait Compute: Send + Sync {
    /// Run one module and return its outputs
    async fn compute_module(
        &self,
        request: ModuleRequest,
        progress: &ProgressHandle,
    ) -> Result<Vec<Output>, ComputeError>;

    /// Derive group outputs once every module has completed
    ///
    /// Defaults to the concatenation of module outputs in declaration order.
    async fn collect_group(
        &self,
        _group: &ModelGroup,
        module_outputs: &[(String, Vec<Output>)],
    ) -> Result<Vec<Output>, ComputeError> {
        Ok(module_outputs
            .iter()
            .flat_map(|(_, outputs)| outputs.iter().cloned())
            .collect())
    }
}

const MAX_TICKS: u32 = 100;

/// Compute driven by each module's `work` description
///
/// Sleeps through `ticks` equal slices of `durationMs` (at most 100),
/// reporting progress after each, then returns the configured outputs or
/// fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimulatedCompute;

impl SimulatedCompute {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Compute for SimulatedCompute {
    async fn compute_module(
        &self,
        request: ModuleRequest,
        progress: &ProgressHandle,
    ) -> Result<Vec<Output>, ComputeError> {
        let work = &request.module.work;
        // Progress has whole-percent resolution
        let ticks = u64::from(work.ticks.clamp(1, MAX_TICKS));
        let slice = Duration::from_millis(work.duration_ms / ticks);

        // Resume from the recorded tick rather than from zero
        let mut tick = u64::from(progress.current()) * ticks / 100;
        while tick < ticks {
            progress.checkpoint().await;
            if !slice.is_zero() {
                tokio::time::sleep(slice).await;
            }
            tick += 1;
            progress.report(u8::try_from(tick * 100 / ticks).unwrap_or(100));
        }

        if work.fail {
            return Err(ComputeError::new(format!(
                "module '{}' reported failure",
                request.module.id
            )));
        }

        Ok(work.outputs.clone())
    }
}
