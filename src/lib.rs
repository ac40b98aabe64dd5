//! Host side of the cross-workgroup reduction: builds input, runs each
//! coordination mode on a backend and checks the result against a host sum.

pub mod config;
pub mod error;
pub mod host_reference;
pub mod launcher;
pub mod validate;

use std::fmt;

use gpu_native::emulator::EmulatedDevice;
use log::info;
use rand::rngs::StdRng;

pub use kernels::ReduceMode;

use config::{BackendKind, HarnessConfig};
use error::HarnessError;
use host_reference::{host_workgroup_reduce, input_rng, rand_vector};
use launcher::{EmulatorBackend, JobOutput, ReduceBackend, ReduceJob};
use validate::{Validation, valid_vector};

pub struct Harness {
    config: HarnessConfig,
    backend: Box<dyn ReduceBackend>,
    rng: StdRng,
}

impl Harness {
    pub fn new(config: HarnessConfig) -> Result<Self, HarnessError> {
        config.validate()?;
        let backend: Box<dyn ReduceBackend> = match config.backend {
            BackendKind::Emulator => {
                let mut device = EmulatedDevice::new();
                if let Some(units) = config.compute_units {
                    device = device.with_compute_units(units);
                }
                if let Some(timeout) = config.watchdog {
                    device = device.with_watchdog(timeout);
                }
                Box::new(EmulatorBackend::new(device))
            }
            #[cfg(feature = "cuda")]
            BackendKind::Cuda => Box::new(launcher::CudaBackend::new()?),
            #[cfg(not(feature = "cuda"))]
            BackendKind::Cuda => {
                return Err(HarnessError::Config(
                    "the cuda backend needs a build with the `cuda` feature".into(),
                ));
            }
        };
        Ok(Self::with_backend(config, backend))
    }

    /// Skips config validation; the caller owns the backend's setup.
    pub fn with_backend(config: HarnessConfig, backend: Box<dyn ReduceBackend>) -> Self {
        let rng = input_rng(config.seed);
        Self {
            config,
            backend,
            rng,
        }
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Reduces fresh random input with `mode` and validates the result.
    pub fn run_mode(&mut self, mode: ReduceMode) -> Result<ModeOutcome, HarnessError> {
        let groups = self.config.groups;
        let block_size = self.config.block_size;
        let input = rand_vector(&mut self.rng, groups as usize * block_size as usize);
        let reference = host_workgroup_reduce(&input, groups as usize, block_size as usize);

        let job = ReduceJob::new(mode, groups, block_size, input)?;
        let result = self.backend.run(&job)?;
        let validation = valid_vector(&reference, &result.output, self.config.tolerance);
        info!(
            "{mode} on {}: {groups} x {block_size}, counter {}, nrms {:.3e}, {} mismatches",
            self.backend.name(),
            result.counter,
            validation.nrms,
            validation.mismatches
        );
        Ok(ModeOutcome {
            mode,
            result,
            validation,
        })
    }
}

#[derive(Clone, Debug)]
pub struct ModeOutcome {
    pub mode: ReduceMode,
    pub result: JobOutput,
    pub validation: Validation,
}

impl ModeOutcome {
    pub fn is_valid(&self) -> bool {
        self.validation.valid
    }
}

impl fmt::Display for ModeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flag = if self.is_valid() { 'y' } else { 'n' };
        write!(f, "{}, valid:{flag}", self.mode)
    }
}
