use std::time::Duration;

use clap::{ArgAction, Parser, ValueEnum};
use gpu_native::thread_layout::BlockDim1D;
use log::{LevelFilter, warn};

use crate::error::HarnessError;

/// Workgroups reduced when no count is given.
pub const DEFAULT_GROUPS: u32 = 3000;
/// Threads per workgroup, and the length of the output row.
pub const DEFAULT_BLOCK_SIZE: u32 = 256;
/// Wavefront width of the target; not detected at runtime.
pub const WAVE_SIZE: u32 = 64;
pub const DEFAULT_TOLERANCE: f64 = 1e-3;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum BackendKind {
    /// Host threads with workgroup semantics
    #[default]
    Emulator,
    /// A CUDA device through the driver API (needs the `cuda` feature)
    Cuda,
}

#[derive(Clone, Debug, PartialEq)]
pub struct HarnessConfig {
    pub groups: u32,
    pub block_size: u32,
    /// Fixed seed for the input generator; entropy when `None`.
    pub seed: Option<u64>,
    /// Emulator compute units; the emulator picks when `None`.
    pub compute_units: Option<usize>,
    /// Emulator watchdog; a hung launch never returns when `None`.
    pub watchdog: Option<Duration>,
    pub backend: BackendKind,
    pub tolerance: f64,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            groups: DEFAULT_GROUPS,
            block_size: DEFAULT_BLOCK_SIZE,
            seed: None,
            compute_units: None,
            watchdog: None,
            backend: BackendKind::default(),
            tolerance: DEFAULT_TOLERANCE,
        }
    }
}

impl HarnessConfig {
    pub fn validate(&self) -> Result<(), HarnessError> {
        if self.block_size == 0 || self.block_size > BlockDim1D::MAX as u32 {
            return Err(HarnessError::Config(format!(
                "block size {} is outside 1..={}",
                self.block_size,
                BlockDim1D::MAX
            )));
        }
        if self.groups > i32::MAX as u32 {
            return Err(HarnessError::Config(format!(
                "{} workgroups exceed the grid limit",
                self.groups
            )));
        }
        if (self.groups as u64) * (self.block_size as u64) > u32::MAX as u64 {
            return Err(HarnessError::Config(format!(
                "{} x {} input elements do not fit 32-bit indexing",
                self.groups, self.block_size
            )));
        }
        if self.compute_units == Some(0) {
            return Err(HarnessError::Config("at least one compute unit is required".into()));
        }
        if !(self.tolerance > 0.0) {
            return Err(HarnessError::Config(format!(
                "tolerance {} must be positive",
                self.tolerance
            )));
        }
        if self.block_size % WAVE_SIZE != 0 {
            warn!(
                "block size {} is not a multiple of the wave size {WAVE_SIZE}",
                self.block_size
            );
        }
        Ok(())
    }
}

/// Reduces N rows of random floats on the device, once per coordination
/// protocol, and checks each result against a host sum.
#[derive(Debug, Parser)]
#[command(name = "cross-wg-sync")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Number of workgroups (input rows)
    #[arg(default_value_t = DEFAULT_GROUPS)]
    pub groups: u32,

    /// Threads per workgroup (output length)
    #[arg(long, default_value_t = DEFAULT_BLOCK_SIZE)]
    pub block_size: u32,

    /// Seed for reproducible input
    #[arg(long)]
    pub seed: Option<u64>,

    /// Emulator compute units (workgroups resident at once)
    #[arg(long)]
    pub compute_units: Option<usize>,

    /// Reset the emulated device if a launch takes longer than this
    #[arg(long, value_name = "MS")]
    pub watchdog_ms: Option<u64>,

    #[arg(long, value_enum, default_value_t = BackendKind::Emulator)]
    pub backend: BackendKind,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    pub fn log_level(&self) -> LevelFilter {
        match self.verbose {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Info,
            2 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    }

    pub fn into_config(self) -> HarnessConfig {
        HarnessConfig {
            groups: self.groups,
            block_size: self.block_size,
            seed: self.seed,
            compute_units: self.compute_units,
            watchdog: self.watchdog_ms.map(Duration::from_millis),
            backend: self.backend,
            ..HarnessConfig::default()
        }
    }
}
