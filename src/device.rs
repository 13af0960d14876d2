//! The physical burner, seen as an opaque driver.
//!
//! The executor only needs three operations: stage the files, burn one slice,
//! verify the result. [`SimulatedDevice`] stands in for real hardware in the
//! demo and in tests, and can be scripted to fail.

use std::time::Duration;

use tokio::time::sleep;
use tracing::debug;

use crate::error::{RelayError, Result};
use crate::manifest::Manifest;

#[allow(async_fn_in_trait)]
pub trait BurnDevice {
    /// Fetch the job's files to local staging (the `downloading` phase).
    async fn stage(&mut self, manifest: &Manifest) -> Result<()>;

    /// Write slice `step` of `total` (1-based).
    async fn burn_step(&mut self, manifest: &Manifest, step: u32, total: u32) -> Result<()>;

    async fn verify(&mut self, manifest: &Manifest) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevicePhase {
    Stage,
    Burn,
    Verify,
}

/// Fake burner that completes every phase after an optional delay.
#[derive(Debug, Default)]
pub struct SimulatedDevice {
    step_delay: Duration,
    /// Remaining scripted failures and the phase where they hit.
    failures: Option<(u32, DevicePhase)>,
    completed_burns: u32,
}

impl SimulatedDevice {
    /// Fail the next `times` attempts at `phase`, then behave.
    pub fn failing(times: u32, phase: DevicePhase) -> Self {
        Self {
            failures: Some((times, phase)),
            ..Default::default()
        }
    }

    /// Sleep this long after staging and after every burn slice.
    pub fn with_step_delay(mut self, step_delay: Duration) -> Self {
        self.step_delay = step_delay;
        self
    }

    #[cfg(test)]
    pub fn completed_burns(&self) -> u32 {
        self.completed_burns
    }

    fn maybe_fail(&mut self, phase: DevicePhase, manifest: &Manifest) -> Result<()> {
        if let Some((left, at)) = self.failures.as_mut()
            && *at == phase
            && *left > 0
        {
            *left -= 1;
            return Err(RelayError::Device(format!(
                "simulated {phase:?} failure for job {}",
                manifest.id
            )));
        }
        Ok(())
    }

    async fn pause(&self) {
        if !self.step_delay.is_zero() {
            sleep(self.step_delay).await;
        }
    }
}

impl BurnDevice for SimulatedDevice {
    async fn stage(&mut self, manifest: &Manifest) -> Result<()> {
        self.maybe_fail(DevicePhase::Stage, manifest)?;
        debug!(job_id = %manifest.id, files = manifest.files.len(), "staged files");
        self.pause().await;
        Ok(())
    }

    async fn burn_step(&mut self, manifest: &Manifest, step: u32, total: u32) -> Result<()> {
        if step == 1 {
            self.maybe_fail(DevicePhase::Burn, manifest)?;
        }
        debug!(job_id = %manifest.id, step, total, "burned slice");
        self.pause().await;
        Ok(())
    }

    async fn verify(&mut self, manifest: &Manifest) -> Result<()> {
        self.maybe_fail(DevicePhase::Verify, manifest)?;
        self.completed_burns += 1;
        debug!(job_id = %manifest.id, burns = self.completed_burns, "verified disc");
        Ok(())
    }
}
