use gpu_native::{
    emulator::{EmulatedDevice, LaunchReport},
    slices::{DeviceSlice, DeviceSliceMut},
    thread_layout::{BlockDim1D, GridDim1D},
};
use kernels::ReduceMode;
use log::{debug, trace};

use crate::error::HarnessError;

/// One kernel launch: device buffers are (re)initialised from these fields
/// before every run, so a job can be run repeatedly.
#[derive(Clone, Debug, PartialEq)]
pub struct ReduceJob {
    pub mode: ReduceMode,
    pub groups: u32,
    pub block_size: u32,
    /// `groups * block_size` values, row-major by workgroup.
    pub input: Vec<f32>,
    /// `block_size` values the kernel adds onto.
    pub initial_output: Vec<f32>,
    pub initial_counter: u32,
}

impl ReduceJob {
    /// Job with a zeroed counter and output.
    pub fn new(
        mode: ReduceMode,
        groups: u32,
        block_size: u32,
        input: Vec<f32>,
    ) -> Result<Self, HarnessError> {
        let expected = groups as usize * block_size as usize;
        if input.len() != expected {
            return Err(HarnessError::Config(format!(
                "input holds {} values, {groups} x {block_size} launch needs {expected}",
                input.len()
            )));
        }
        Ok(Self {
            mode,
            groups,
            block_size,
            input,
            initial_output: vec![0.0; block_size as usize],
            initial_counter: 0,
        })
    }

    pub fn with_output(mut self, output: Vec<f32>) -> Result<Self, HarnessError> {
        if output.len() != self.block_size as usize {
            return Err(HarnessError::Config(format!(
                "output holds {} values, block size is {}",
                output.len(),
                self.block_size
            )));
        }
        self.initial_output = output;
        Ok(self)
    }

    /// A non-zero counter breaks the kernel's entry contract; only useful
    /// for exercising the watchdog.
    pub fn with_counter(mut self, counter: u32) -> Self {
        self.initial_counter = counter;
        self
    }

    fn geometry(&self) -> (GridDim1D, BlockDim1D) {
        (
            GridDim1D::new(self.groups as i32),
            BlockDim1D::new(self.block_size as i32),
        )
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct JobOutput {
    pub output: Vec<f32>,
    /// Counter slot read back after the launch.
    pub counter: u32,
    /// Emulator launch statistics; `None` when nothing was launched or the
    /// backend does not report them.
    pub report: Option<LaunchReport>,
}

/// Somewhere a [`ReduceJob`] can run.
pub trait ReduceBackend {
    fn name(&self) -> &'static str;
    fn run(&self, job: &ReduceJob) -> Result<JobOutput, HarnessError>;
}

pub struct EmulatorBackend {
    device: EmulatedDevice,
}

impl EmulatorBackend {
    pub fn new(device: EmulatedDevice) -> Self {
        Self { device }
    }

    pub fn device(&self) -> &EmulatedDevice {
        &self.device
    }
}

impl ReduceBackend for EmulatorBackend {
    fn name(&self) -> &'static str {
        "emulator"
    }

    fn run(&self, job: &ReduceJob) -> Result<JobOutput, HarnessError> {
        let mut counter = [job.initial_counter];
        let mut output = job.initial_output.clone();
        if job.groups == 0 {
            debug!("{}: no workgroups, skipping launch", job.mode);
            return Ok(JobOutput {
                output,
                counter: counter[0],
                report: None,
            });
        }

        let (grid_dim, block_dim) = job.geometry();
        let report = job.mode.emulate(
            &self.device,
            grid_dim,
            block_dim,
            DeviceSliceMut::from(counter.as_mut_slice()),
            DeviceSlice::from(job.input.as_slice()),
            DeviceSliceMut::from(output.as_mut_slice()),
        )?;
        trace!("{}: {report:?}", job.mode);
        Ok(JobOutput {
            output,
            counter: counter[0],
            report: Some(report),
        })
    }
}

#[cfg(feature = "cuda")]
pub use cuda_backend::CudaBackend;

#[cfg(feature = "cuda")]
mod cuda_backend {
    use gpu_native::cuda::driver_wrapper::{CUDAStream, DeviceBuffer};
    use log::debug;

    use super::{JobOutput, ReduceBackend, ReduceJob};
    use crate::error::HarnessError;

    /// Runs jobs on device 0 through the driver API.
    pub struct CudaBackend {
        stream: CUDAStream,
    }

    impl CudaBackend {
        pub fn new() -> Result<Self, HarnessError> {
            let stream = CUDAStream::new().map_err(HarnessError::device("cuStreamCreate"))?;
            Ok(Self { stream })
        }
    }

    impl ReduceBackend for CudaBackend {
        fn name(&self) -> &'static str {
            "cuda"
        }

        fn run(&self, job: &ReduceJob) -> Result<JobOutput, HarnessError> {
            let mut counter = DeviceBuffer::<u32>::zeroed(1)
                .map_err(HarnessError::device("cuMemAlloc"))?;
            let mut input = DeviceBuffer::<f32>::zeroed(job.input.len())
                .map_err(HarnessError::device("cuMemAlloc"))?;
            let mut output = DeviceBuffer::<f32>::zeroed(job.initial_output.len())
                .map_err(HarnessError::device("cuMemAlloc"))?;

            counter
                .copy_from_host(&[job.initial_counter])
                .map_err(HarnessError::device("cuMemcpyHtoD"))?;
            input
                .copy_from_host(&job.input)
                .map_err(HarnessError::device("cuMemcpyHtoD"))?;
            output
                .copy_from_host(&job.initial_output)
                .map_err(HarnessError::device("cuMemcpyHtoD"))?;

            if job.groups > 0 {
                let (grid_dim, block_dim) = job.geometry();
                debug!(
                    "{}: launching {} x {} on device",
                    job.mode, job.groups, job.block_size
                );
                job.mode
                    .launch(
                        grid_dim,
                        block_dim,
                        &self.stream,
                        counter.as_slice_mut(),
                        input.as_slice(),
                        output.as_slice_mut(),
                    )
                    .map_err(HarnessError::device("cuLaunchKernel"))?;
                self.stream
                    .synchronize()
                    .map_err(HarnessError::device("cuStreamSynchronize"))?;
            }

            let mut host_output = vec![0.0f32; output.len()];
            output
                .copy_to_host(&mut host_output)
                .map_err(HarnessError::device("cuMemcpyDtoH"))?;
            let mut host_counter = [0u32];
            counter
                .copy_to_host(&mut host_counter)
                .map_err(HarnessError::device("cuMemcpyDtoH"))?;

            Ok(JobOutput {
                output: host_output,
                counter: host_counter[0],
                report: None,
            })
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use gpu_native::emulator::LaunchError;

    use super::*;
    use crate::host_reference::{host_workgroup_reduce, input_rng, rand_vector};
    use crate::validate::valid_vector;

    fn backend(units: usize) -> EmulatorBackend {
        EmulatorBackend::new(
            EmulatedDevice::new()
                .with_compute_units(units)
                .with_watchdog(Duration::from_secs(60)),
        )
    }

    #[test]
    fn test_job_rejects_mismatched_lengths() {
        assert!(matches!(
            ReduceJob::new(ReduceMode::Serialized, 3, 4, vec![0.0; 11]),
            Err(HarnessError::Config(_))
        ));
        let job = ReduceJob::new(ReduceMode::Serialized, 1, 4, vec![0.0; 4]).unwrap();
        assert!(job.with_output(vec![0.0; 3]).is_err());
    }

    #[test]
    fn test_integer_rows_sum_exactly() {
        let input: Vec<f32> = [1.0, 2.0, 3.0].iter().flat_map(|v| [*v; 4]).collect();
        for mode in ReduceMode::ALL {
            let job = ReduceJob::new(mode, 3, 4, input.clone()).unwrap();
            let out = backend(3).run(&job).unwrap();
            assert_eq!(out.output, vec![6.0; 4], "{mode}");
        }
    }

    #[test]
    fn test_single_workgroup_copies_its_row() {
        let input: Vec<f32> = (1..=8).map(|i| i as f32 / 10.0).collect();
        for mode in ReduceMode::ALL {
            let job = ReduceJob::new(mode, 1, 8, input.clone()).unwrap();
            let out = backend(2).run(&job).unwrap();
            assert_eq!(out.output, input, "{mode}");
            assert_eq!(out.counter, mode.final_counter(1), "{mode}");
        }
    }

    fn random_input_agrees_with_host(emulator: &EmulatorBackend, groups: u32, block_size: u32) {
        let input = rand_vector(&mut input_rng(Some(0x5eed)), (groups * block_size) as usize);
        let reference = host_workgroup_reduce(&input, groups as usize, block_size as usize);

        let serialized = ReduceJob::new(ReduceMode::Serialized, groups, block_size, input.clone())
            .unwrap();
        let first = emulator.run(&serialized).unwrap();
        let second = emulator.run(&serialized).unwrap();
        let first_bits: Vec<u32> = first.output.iter().map(|v| v.to_bits()).collect();
        let second_bits: Vec<u32> = second.output.iter().map(|v| v.to_bits()).collect();
        assert_eq!(first_bits, second_bits);
        assert_eq!(first.output, reference);
        assert_eq!(first.counter, groups);
        let report = first.report.expect("launch report");
        assert_eq!(
            report.compute_units,
            emulator.device().compute_units().min(groups as usize)
        );

        let out_of_order = ReduceJob::new(ReduceMode::OutOfOrder, groups, block_size, input)
            .unwrap();
        let result = emulator.run(&out_of_order).unwrap();
        let validation = valid_vector(&reference, &result.output, 1e-3);
        assert!(validation.valid, "{validation:?}");
        assert_eq!(result.counter, 0);
    }

    #[test]
    fn test_random_input_agrees_with_host() {
        random_input_agrees_with_host(&backend(8), 300, 64);
    }

    #[test]
    fn test_random_input_full_size() {
        // One compute unit per host core keeps spinning workgroups off the
        // cores doing real work.
        let emulator = EmulatorBackend::new(
            EmulatedDevice::new().with_watchdog(Duration::from_secs(300)),
        );
        random_input_agrees_with_host(&emulator, 3000, 256);
    }

    #[test]
    fn test_prefilled_output_is_added_onto() {
        for mode in ReduceMode::ALL {
            let job = ReduceJob::new(mode, 2, 2, vec![1.0, 2.0, 3.0, 4.0])
                .unwrap()
                .with_output(vec![10.0, 20.0])
                .unwrap();
            let out = backend(2).run(&job).unwrap();
            assert_eq!(out.output, vec![14.0, 26.0], "{mode}");
        }
    }

    #[test]
    fn test_zero_input_leaves_output_and_sets_counter() {
        for mode in ReduceMode::ALL {
            let job = ReduceJob::new(mode, 64, 64, vec![0.0; 64 * 64]).unwrap();
            let out = backend(4).run(&job).unwrap();
            assert_eq!(out.output, vec![0.0; 64], "{mode}");
            let expected = match mode {
                ReduceMode::Serialized => 64,
                ReduceMode::OutOfOrder => 0,
            };
            assert_eq!(out.counter, expected, "{mode}");
        }
    }

    #[test]
    fn test_serialized_with_nonzero_counter_deadlocks() {
        let emulator = EmulatorBackend::new(
            EmulatedDevice::new()
                .with_compute_units(2)
                .with_watchdog(Duration::from_millis(300)),
        );
        let job = ReduceJob::new(ReduceMode::Serialized, 2, 4, vec![1.0; 8])
            .unwrap()
            .with_counter(1);
        let result = emulator.run(&job);
        assert!(
            matches!(
                result,
                Err(HarnessError::Launch(LaunchError::Watchdog { .. }))
            ),
            "expected a watchdog reset, got {result:?}"
        );
    }

    #[test]
    fn test_each_run_starts_from_job_state() {
        let input: Vec<f32> = (0..10 * 16).map(|i| (i % 13) as f32 * 0.25).collect();
        let emulator = backend(4);
        for mode in ReduceMode::ALL {
            let job = ReduceJob::new(mode, 10, 16, input.clone()).unwrap();
            let first = emulator.run(&job).unwrap();
            let second = emulator.run(&job).unwrap();
            assert_eq!(first.counter, mode.final_counter(10), "{mode}");
            assert_eq!(second.counter, mode.final_counter(10), "{mode}");
            // Quarter multiples below 2^24 sum exactly in any order.
            assert_eq!(first.output, second.output, "{mode}");
        }
    }

    #[test]
    fn test_empty_grid_skips_launch() {
        let job = ReduceJob::new(ReduceMode::Serialized, 0, 4, Vec::new()).unwrap();
        let out = backend(1).run(&job).unwrap();
        assert_eq!(out.output, vec![0.0; 4]);
        assert_eq!(out.counter, 0);
        assert!(out.report.is_none());
    }
}
