#![cfg_attr(target_arch = "nvptx64", no_std)]
#![cfg_attr(target_arch = "nvptx64", feature(abi_ptx))]

//! Cross-workgroup reduction: every workgroup adds its tile of `input` into
//! the shared `output` row, coordinated through a counter slot.

use gpu_macro::{gpu_kernel, host};

use gpu_native::{
    assert_universal,
    barrier::{WorkgroupBarrier, sync_threads},
    slices::{DeviceSlice, DeviceSliceMut},
    thread_layout::{FlatLayout1D, Thread1D, ThreadLayout},
};

#[host]
use gpu_native::{
    emulator::{EmulatedDevice, LaunchError, LaunchReport},
    thread_layout::{BlockDim1D, GridDim1D},
};

/// Prologue and epilogue around the data-plane update of one workgroup.
pub trait CoordinationPolicy {
    fn enter(barrier: &WorkgroupBarrier, block: u32);
    fn exit(barrier: &WorkgroupBarrier);
}

/// Updates land in ascending block order: block `b` waits for the counter to
/// reach `b` and bumps it when done. The counter ends at the grid size.
pub struct Serialized;

impl CoordinationPolicy for Serialized {
    #[inline(always)]
    fn enter(barrier: &WorkgroupBarrier, block: u32) {
        barrier.wait_eq(block, 0);
    }

    #[inline(always)]
    fn exit(barrier: &WorkgroupBarrier) {
        barrier.inc(0);
    }
}

/// Updates land in arrival order under a lock. The counter ends at zero.
pub struct OutOfOrder;

impl CoordinationPolicy for OutOfOrder {
    #[inline(always)]
    fn enter(barrier: &WorkgroupBarrier, _block: u32) {
        barrier.acquire(0);
    }

    #[inline(always)]
    fn exit(barrier: &WorkgroupBarrier) {
        // Every thread's store must be issued before the lock is handed on.
        sync_threads();
        barrier.release(0);
    }
}

/// Shared body of both reduction kernels. Thread `i` of block `b` adds
/// `input[b * block_dim + i]` onto `output[i]`.
#[inline(always)]
pub fn workgroup_reduce<P: CoordinationPolicy>(
    counter: DeviceSliceMut<u32>,
    input: DeviceSlice<f32>,
    output: DeviceSliceMut<f32>,
) {
    let barrier = WorkgroupBarrier::new(counter);
    let tid = Thread1D::thread_idx().x as u32;
    let idx = FlatLayout1D.uid();
    assert_universal!(idx < input.len(), "Input is smaller than grid x block!");

    P::enter(&barrier, Thread1D::block_idx().x as u32);

    let o_data = output.atomic_load(tid);
    let i_data = input[idx];
    output.atomic_store(tid, i_data + o_data);

    P::exit(&barrier);
}

#[gpu_kernel(Kernel1D, CUDA | DeviceSliceMut(2); DeviceSlice(2))]
pub fn serialized_reduce(
    counter: DeviceSliceMut<u32>,
    input: DeviceSlice<f32>,
    output: DeviceSliceMut<f32>,
) {
    workgroup_reduce::<Serialized>(counter, input, output);
}

#[gpu_kernel(Kernel1D, CUDA | DeviceSliceMut(2); DeviceSlice(2))]
pub fn outoforder_reduce(
    counter: DeviceSliceMut<u32>,
    input: DeviceSlice<f32>,
    output: DeviceSliceMut<f32>,
) {
    workgroup_reduce::<OutOfOrder>(counter, input, output);
}

/// Which coordination protocol a launch uses.
#[host]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReduceMode {
    Serialized,
    OutOfOrder,
}

#[host]
impl ReduceMode {
    /// Both modes, in the order the harness runs them.
    pub const ALL: [ReduceMode; 2] = [ReduceMode::Serialized, ReduceMode::OutOfOrder];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Serialized => "serialized_reduce",
            Self::OutOfOrder => "outoforder_reduce",
        }
    }

    /// Counter value after a successful launch of `groups` workgroups.
    pub fn final_counter(&self, groups: u32) -> u32 {
        match self {
            Self::Serialized => groups,
            Self::OutOfOrder => 0,
        }
    }

    pub fn emulate(
        &self,
        device: &EmulatedDevice,
        grid_dim: GridDim1D,
        block_dim: BlockDim1D,
        counter: DeviceSliceMut<u32>,
        input: DeviceSlice<f32>,
        output: DeviceSliceMut<f32>,
    ) -> Result<LaunchReport, LaunchError> {
        match self {
            Self::Serialized => {
                serialized_reduce::emulate(device, grid_dim, block_dim, counter, input, output)
            }
            Self::OutOfOrder => {
                outoforder_reduce::emulate(device, grid_dim, block_dim, counter, input, output)
            }
        }
    }

    #[cfg(feature = "cuda")]
    pub fn launch(
        &self,
        grid_dim: GridDim1D,
        block_dim: BlockDim1D,
        stream: &gpu_native::cuda::driver_wrapper::CUDAStream,
        counter: DeviceSliceMut<u32>,
        input: DeviceSlice<f32>,
        output: DeviceSliceMut<f32>,
    ) -> Result<(), gpu_native::cudarc::driver::DriverError> {
        match self {
            Self::Serialized => {
                serialized_reduce::launch(grid_dim, block_dim, stream, counter, input, output)
            }
            Self::OutOfOrder => {
                outoforder_reduce::launch(grid_dim, block_dim, stream, counter, input, output)
            }
        }
    }
}

#[host]
impl core::fmt::Display for ReduceMode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod test {
    use std::sync::Mutex;
    use std::time::Duration;

    use proptest::prelude::*;

    use super::*;

    struct Run {
        counter: u32,
        output: Vec<f32>,
    }

    fn run(mode: ReduceMode, units: usize, input: &[f32], mut output: Vec<f32>) -> Run {
        let groups = (input.len() / output.len()) as i32;
        let block = output.len() as i32;
        let mut counter = [0u32];
        mode.emulate(
            &EmulatedDevice::new().with_compute_units(units),
            GridDim1D::new(groups),
            BlockDim1D::new(block),
            DeviceSliceMut::from(counter.as_mut_slice()),
            DeviceSlice::from(input),
            DeviceSliceMut::from(output.as_mut_slice()),
        )
        .expect("launch failed");
        Run {
            counter: counter[0],
            output,
        }
    }

    #[test]
    fn test_mode_names() {
        assert_eq!(ReduceMode::Serialized.to_string(), "serialized_reduce");
        assert_eq!(ReduceMode::OutOfOrder.to_string(), "outoforder_reduce");
        assert_eq!(ReduceMode::ALL[0], ReduceMode::Serialized);
    }

    #[test]
    fn test_integer_rows_sum_exactly() {
        let input: Vec<f32> = [1.0, 2.0, 3.0].iter().flat_map(|v| [*v; 4]).collect();
        for mode in ReduceMode::ALL {
            let run = run(mode, 3, &input, vec![0.0; 4]);
            assert_eq!(run.output, vec![6.0; 4], "{mode}");
            assert_eq!(run.counter, mode.final_counter(3), "{mode}");
        }
    }

    #[test]
    fn test_existing_output_is_accumulated_onto() {
        for mode in ReduceMode::ALL {
            let run = run(mode, 2, &[1.0, 2.0, 3.0, 4.0], vec![10.0, 20.0]);
            assert_eq!(run.output, vec![14.0, 26.0], "{mode}");
        }
    }

    #[test]
    fn test_single_unit_still_makes_progress() {
        let input: Vec<f32> = (0..16 * 8).map(|i| (i % 7) as f32).collect();
        for mode in ReduceMode::ALL {
            let run = run(mode, 1, &input, vec![0.0; 8]);
            let expected: Vec<f32> = (0..8)
                .map(|l| (0..16).map(|g| input[g * 8 + l]).sum())
                .collect();
            assert_eq!(run.output, expected, "{mode}");
        }
    }

    #[test]
    fn test_serialized_rejects_nonzero_counter() {
        let input = [1.0f32; 4];
        let mut output = [0.0f32; 2];
        let mut counter = [1u32];
        let result = serialized_reduce::emulate(
            &EmulatedDevice::new()
                .with_compute_units(2)
                .with_watchdog(Duration::from_millis(200)),
            GridDim1D::new(2),
            BlockDim1D::new(2),
            DeviceSliceMut::from(counter.as_mut_slice()),
            DeviceSlice::from(input.as_slice()),
            DeviceSliceMut::from(output.as_mut_slice()),
        );
        assert!(matches!(result, Err(LaunchError::Watchdog { .. })));
    }

    #[derive(Debug, PartialEq, Eq)]
    enum Event {
        Enter(u32),
        Exit(u32),
    }

    static TRACE: Mutex<Vec<Event>> = Mutex::new(Vec::new());

    struct TracedOutOfOrder;

    impl CoordinationPolicy for TracedOutOfOrder {
        fn enter(barrier: &WorkgroupBarrier, block: u32) {
            OutOfOrder::enter(barrier, block);
            if Thread1D::thread_idx().x == 0 {
                TRACE.lock().unwrap().push(Event::Enter(block));
            }
        }

        fn exit(barrier: &WorkgroupBarrier) {
            if Thread1D::thread_idx().x == 0 {
                let block = Thread1D::block_idx().x as u32;
                TRACE.lock().unwrap().push(Event::Exit(block));
            }
            OutOfOrder::exit(barrier);
        }
    }

    #[test]
    fn test_out_of_order_critical_sections_never_overlap() {
        let groups = 24;
        let block = 16;
        let input = vec![0.5f32; groups * block];
        let mut output = vec![0.0f32; block];
        let mut counter = [0u32];
        let counter_slice = DeviceSliceMut::from(counter.as_mut_slice());
        let input_slice = DeviceSlice::from(input.as_slice());
        let output_slice = DeviceSliceMut::from(output.as_mut_slice());
        EmulatedDevice::new()
            .with_compute_units(6)
            .launch_1d(GridDim1D::new(groups as i32), BlockDim1D::new(block as i32), || {
                workgroup_reduce::<TracedOutOfOrder>(counter_slice, input_slice, output_slice)
            })
            .expect("launch failed");

        let trace = TRACE.lock().unwrap();
        assert_eq!(trace.len(), 2 * groups);
        let mut seen = vec![false; groups];
        for pair in trace.chunks(2) {
            let [Event::Enter(entered), Event::Exit(exited)] = pair else {
                panic!("unbalanced trace: {pair:?}");
            };
            assert_eq!(entered, exited);
            assert!(!seen[*entered as usize]);
            seen[*entered as usize] = true;
        }
        assert!(seen.iter().all(|s| *s));
        assert_eq!(counter[0], 0);
        assert_eq!(output, vec![12.0; block]);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn prop_serialized_matches_in_order_host_sum(
            groups in 1usize..24,
            block in 1usize..33,
            seed in any::<u64>(),
        ) {
            let input: Vec<f32> = (0..groups * block)
                .map(|i| ((seed.wrapping_add(i as u64 * 2654435761) % 100) as f32) / 100.0)
                .collect();
            let expected: Vec<f32> = (0..block)
                .map(|l| (0..groups).fold(0.0f32, |acc, g| acc + input[g * block + l]))
                .collect();
            let run = run(ReduceMode::Serialized, 4, &input, vec![0.0; block]);
            prop_assert_eq!(run.output, expected);
            prop_assert_eq!(run.counter, groups as u32);
        }
    }
}
