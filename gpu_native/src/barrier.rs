//! Workgroup-level synchronisation. [`sync_threads`] orders the threads of
//! one workgroup; [`WorkgroupBarrier`] coordinates whole workgroups through
//! counters in global memory.
//!
//! Every wait is performed by thread 0 alone while the rest of the workgroup
//! parks in the following `sync_threads`. A wait whose condition never holds
//! hangs the kernel: the launch must make sure somebody eventually satisfies
//! it.

use core::marker::PhantomData;

use crate::{
    assert_universal,
    atomic::{atomic_add_u32, atomic_compare_and_swap_u32, atomic_load_u32},
    slices::DeviceSliceMut,
    thread_layout::Thread1D,
};

/// Intra-workgroup barrier: no thread passes until every thread of its
/// workgroup has arrived.
#[inline(always)]
pub fn sync_threads() {
    #[cfg(target_arch = "nvptx64")]
    unsafe {
        crate::cuda::intrinsics::__syncthreads()
    };
    #[cfg(not(target_arch = "nvptx64"))]
    crate::emulator::sync_threads();
}

/// Body of every spin-wait loop.
#[inline(always)]
pub fn spin_loop() {
    #[cfg(target_arch = "nvptx64")]
    core::hint::spin_loop();
    #[cfg(not(target_arch = "nvptx64"))]
    crate::emulator::spin_wait();
}

/// Handle to a run of 32-bit counter slots shared by all workgroups of a
/// launch. Cheap to copy; each thread builds its own.
///
/// `acquire`/`release` and counters driven by `inc` expect their slot to be
/// zero at launch.
#[derive(Clone, Copy)]
pub struct WorkgroupBarrier<'a> {
    base: *mut u32,
    slots: u32,
    _marker: PhantomData<&'a [u32]>,
}

unsafe impl Send for WorkgroupBarrier<'_> {}
unsafe impl Sync for WorkgroupBarrier<'_> {}

impl<'a> WorkgroupBarrier<'a> {
    #[inline(always)]
    pub fn new(mut slots: DeviceSliceMut<'a, u32>) -> Self {
        let len = slots.len();
        assert_universal!(len <= u32::MAX as usize, "Too many workgroup barrier slots!");
        Self {
            base: slots.as_mut_ptr(),
            slots: len as u32,
            _marker: PhantomData,
        }
    }

    /// # Safety
    ///
    /// `ptr` must point to `slots` aligned words of global memory that live
    /// for `'a` and are only ever accessed atomically.
    #[inline(always)]
    pub unsafe fn from_ptr(ptr: *mut u32, slots: u32) -> Self {
        Self {
            base: ptr,
            slots,
            _marker: PhantomData,
        }
    }

    #[inline(always)]
    pub fn slots(&self) -> u32 {
        self.slots
    }

    #[inline(always)]
    fn slot(&self, offset: u32) -> *mut u32 {
        assert_universal!(offset < self.slots, "Out of bounds for workgroup barrier slot!");
        unsafe { self.base.add(offset as usize) }
    }

    /// Current value of slot `offset`.
    #[inline(always)]
    pub fn ld(&self, offset: u32) -> u32 {
        unsafe { atomic_load_u32(self.slot(offset)) }
    }

    #[inline(always)]
    fn wait_until(&self, offset: u32, done: impl Fn(u32) -> bool) {
        if Thread1D::thread_idx().x == 0 {
            while !done(self.ld(offset)) {
                spin_loop();
            }
        }
        sync_threads();
    }

    /// Blocks the workgroup until slot `offset` holds `value`.
    #[inline(always)]
    pub fn wait_eq(&self, value: u32, offset: u32) {
        self.wait_until(offset, |v| v == value);
    }

    /// Blocks the workgroup until slot `offset` holds less than `value`.
    #[inline(always)]
    pub fn wait_lt(&self, value: u32, offset: u32) {
        self.wait_until(offset, |v| v < value);
    }

    /// Blocks the workgroup until slot `offset` holds at least `value`.
    #[inline(always)]
    pub fn wait_ge(&self, value: u32, offset: u32) {
        self.wait_until(offset, |v| v >= value);
    }

    /// Blocks the workgroup until thread 0 swapped slot `offset` from
    /// `compare` to `value`.
    #[inline(always)]
    pub fn wait_set(&self, compare: u32, value: u32, offset: u32) {
        let slot = self.slot(offset);
        if Thread1D::thread_idx().x == 0 {
            while unsafe { atomic_compare_and_swap_u32(slot, compare, value) } != compare {
                spin_loop();
            }
        }
        sync_threads();
    }

    /// Enters the critical section guarded by slot `offset`.
    #[inline(always)]
    pub fn acquire(&self, offset: u32) {
        self.wait_set(0, 1, offset);
    }

    /// Leaves the critical section guarded by slot `offset`. Thread 0 swaps
    /// right away, so the workgroup has to `sync_threads()` first if other
    /// threads still write inside the section.
    #[inline(always)]
    pub fn release(&self, offset: u32) {
        self.wait_set(1, 0, offset);
    }

    /// Publishes that this workgroup is done: waits for the whole workgroup,
    /// then bumps slot `offset` once. Threads may leave before the increment
    /// lands.
    #[inline(always)]
    pub fn inc(&self, offset: u32) {
        let slot = self.slot(offset);
        sync_threads();
        if Thread1D::thread_idx().x == 0 {
            unsafe { atomic_add_u32(slot, 1) };
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use proptest::prelude::*;

    use super::*;
    use crate::emulator::{EmulatedDevice, LaunchError};
    use crate::thread_layout::{BlockDim1D, GridDim1D};

    #[test]
    fn test_ld_reads_each_slot() {
        let mut slots = [3u32, 9];
        let barrier = WorkgroupBarrier::new(DeviceSliceMut::from(slots.as_mut_slice()));
        assert_eq!(barrier.slots(), 2);
        assert_eq!(barrier.ld(0), 3);
        assert_eq!(barrier.ld(1), 9);
    }

    #[test]
    fn test_from_ptr_addresses_raw_slots() {
        let mut words = [0u32, 5, 7];
        let barrier = unsafe { WorkgroupBarrier::from_ptr(words.as_mut_ptr().add(1), 2) };
        assert_eq!(barrier.slots(), 2);
        assert_eq!(barrier.ld(0), 5);
        assert_eq!(barrier.ld(1), 7);
    }

    #[test]
    #[should_panic(expected = "Out of bounds for workgroup barrier slot!")]
    fn test_offset_out_of_bounds_panics() {
        let mut slots = [0u32];
        WorkgroupBarrier::new(DeviceSliceMut::from(slots.as_mut_slice())).ld(1);
    }

    #[test]
    fn test_wait_eq_and_inc_serialise_in_block_order() {
        let mut counter = [0u32];
        let barrier = WorkgroupBarrier::new(DeviceSliceMut::from(counter.as_mut_slice()));
        let order = Mutex::new(Vec::new());
        EmulatedDevice::new()
            .with_compute_units(3)
            .launch_1d(GridDim1D::new(12), BlockDim1D::new(8), || {
                let block = Thread1D::block_idx().x as u32;
                barrier.wait_eq(block, 0);
                if Thread1D::thread_idx().x == 0 {
                    order.lock().unwrap().push(block);
                }
                barrier.inc(0);
            })
            .expect("launch failed");
        assert_eq!(*order.lock().unwrap(), (0..12).collect::<Vec<_>>());
        assert_eq!(counter[0], 12);
    }

    #[test]
    fn test_acquire_release_excludes_other_workgroups() {
        let mut lock = [0u32];
        let barrier = WorkgroupBarrier::new(DeviceSliceMut::from(lock.as_mut_slice()));
        let inside = AtomicU32::new(0);
        let max_inside = AtomicU32::new(0);
        let entries = AtomicU32::new(0);
        EmulatedDevice::new()
            .with_compute_units(4)
            .launch_1d(GridDim1D::new(16), BlockDim1D::new(4), || {
                barrier.acquire(0);
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_inside.fetch_max(now, Ordering::SeqCst);
                if Thread1D::thread_idx().x == 0 {
                    entries.fetch_add(1, Ordering::SeqCst);
                }
                std::thread::yield_now();
                inside.fetch_sub(1, Ordering::SeqCst);
                sync_threads();
                barrier.release(0);
            })
            .expect("launch failed");
        // All four threads of one workgroup may be inside together, never more.
        assert!(max_inside.load(Ordering::SeqCst) <= 4);
        assert_eq!(entries.load(Ordering::SeqCst), 16);
        assert_eq!(lock[0], 0);
    }

    #[test]
    fn test_wait_lt_blocks_until_value_drops() {
        let mut slots = [3u32];
        let barrier = WorkgroupBarrier::new(DeviceSliceMut::from(slots.as_mut_slice()));
        let seen = AtomicU32::new(u32::MAX);
        EmulatedDevice::new()
            .with_compute_units(2)
            .launch_1d(GridDim1D::new(2), BlockDim1D::new(2), || {
                if Thread1D::block_idx().x == 0 {
                    std::thread::sleep(Duration::from_millis(20));
                    barrier.wait_set(3, 2, 0);
                } else {
                    barrier.wait_lt(3, 0);
                    seen.store(barrier.ld(0), Ordering::SeqCst);
                }
            })
            .expect("launch failed");
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert_eq!(slots[0], 2);
    }

    #[test]
    fn test_wait_ge_waits_for_enough_increments() {
        let mut slots = [0u32, 0];
        let barrier = WorkgroupBarrier::new(DeviceSliceMut::from(slots.as_mut_slice()));
        let seen = AtomicU32::new(0);
        EmulatedDevice::new()
            .with_compute_units(3)
            .launch_1d(GridDim1D::new(3), BlockDim1D::new(4), || {
                if Thread1D::block_idx().x == 0 {
                    barrier.wait_ge(2, 1);
                    seen.store(barrier.ld(1), Ordering::SeqCst);
                } else {
                    barrier.inc(1);
                }
            })
            .expect("launch failed");
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert_eq!(slots, [0, 2]);
    }

    #[test]
    fn test_unsatisfiable_wait_trips_watchdog() {
        let mut counter = [1u32];
        let barrier = WorkgroupBarrier::new(DeviceSliceMut::from(counter.as_mut_slice()));
        let result = EmulatedDevice::new()
            .with_compute_units(1)
            .with_watchdog(Duration::from_millis(100))
            .launch_1d(GridDim1D::new(1), BlockDim1D::new(4), || {
                barrier.wait_eq(0, 0);
            });
        assert!(matches!(result, Err(LaunchError::Watchdog { .. })));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(12))]

        #[test]
        fn prop_inc_admits_blocks_in_order_on_any_slot(
            grid in 1i32..20,
            block in 1i32..9,
            units in 1usize..5,
            slot in 0u32..3,
        ) {
            let mut words = [0u32; 3];
            // Slots other than the one in use must stay untouched.
            let barrier = unsafe { WorkgroupBarrier::from_ptr(words.as_mut_ptr(), 3) };
            let order = Mutex::new(Vec::new());
            EmulatedDevice::new()
                .with_compute_units(units)
                .with_watchdog(Duration::from_secs(30))
                .launch_1d(GridDim1D::new(grid), BlockDim1D::new(block), || {
                    let b = Thread1D::block_idx().x as u32;
                    barrier.wait_eq(b, slot);
                    if Thread1D::thread_idx().x == 0 {
                        order.lock().unwrap().push(b);
                    }
                    barrier.inc(slot);
                })
                .expect("launch failed");
            prop_assert_eq!(order.into_inner().unwrap(), (0..grid as u32).collect::<Vec<_>>());
            let mut expected = [0u32; 3];
            expected[slot as usize] = grid as u32;
            prop_assert_eq!(words, expected);
        }
    }
}
