//! Host execution of 1D kernels with the guarantees device code relies on:
//!
//! * a workgroup is `block_dim` OS threads that share one barrier
//!   ([`sync_threads`]);
//! * a fixed number of compute units run workgroups concurrently, and blocks
//!   are handed out in ascending index order, so block `b - 1` is always
//!   resident or retired by the time block `b` starts;
//! * nothing else is ordered between workgroups.
//!
//! There is no way to interrupt a kernel from inside; a launch may instead
//! carry a watchdog, which resets the emulated device when it expires. Every
//! spin-wait and barrier observes the reset and unwinds its thread.

use std::cell::{Cell, RefCell};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, Weak, mpsc};
use std::time::{Duration, Instant};

use log::{debug, error, trace, warn};
use thiserror::Error;

use crate::thread_layout::{BlockDim1D, GridDim1D};

const EMULATED_STACK_SIZE: usize = 256 * 1024;
const MAX_DEFAULT_COMPUTE_UNITS: usize = 8;

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("invalid launch geometry: grid {grid} x block {block}")]
    InvalidGeometry { grid: i32, block: i32 },
    #[error("watchdog expired after {elapsed:?}, device was reset")]
    Watchdog { elapsed: Duration },
    #[error("kernel fault in block {block_idx}, thread {thread_idx}: {message}")]
    KernelFault {
        block_idx: i32,
        thread_idx: i32,
        message: String,
    },
    #[error("unable to spawn an emulated thread: {0}")]
    Spawn(#[from] std::io::Error),
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LaunchReport {
    pub grid_dim: GridDim1D,
    pub block_dim: BlockDim1D,
    pub compute_units: usize,
    pub elapsed: Duration,
}

/// Indices of the calling emulated thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Indices {
    pub thread_idx: i32,
    pub block_idx: i32,
    pub block_dim: i32,
    pub grid_dim: i32,
}

/// Unwind payload of a thread aborted by a device reset.
struct DeviceReset;

struct WorkgroupSync {
    parties: usize,
    state: Mutex<SyncState>,
    cvar: Condvar,
}

struct SyncState {
    arrived: usize,
    generation: u64,
}

impl WorkgroupSync {
    fn new(parties: usize) -> Self {
        Self {
            parties,
            state: Mutex::new(SyncState {
                arrived: 0,
                generation: 0,
            }),
            cvar: Condvar::new(),
        }
    }

    fn wait(&self, reset: &ResetLine) -> Result<(), DeviceReset> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let generation = state.generation;
        state.arrived += 1;
        if state.arrived == self.parties {
            state.arrived = 0;
            state.generation = generation.wrapping_add(1);
            self.cvar.notify_all();
            return Ok(());
        }
        while state.generation == generation {
            if reset.is_tripped() {
                return Err(DeviceReset);
            }
            state = self.cvar.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
        Ok(())
    }

    /// Wakes every parked thread so it re-checks the reset line.
    fn interrupt(&self) {
        let _state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.cvar.notify_all();
    }
}

/// Device-wide reset signal. Tripping it wakes every thread parked in a
/// workgroup barrier; spinning threads notice on their next poll.
#[derive(Default)]
struct ResetLine {
    tripped: AtomicBool,
    units: Mutex<Vec<Weak<ComputeUnit>>>,
}

impl ResetLine {
    fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::Acquire)
    }

    fn attach(&self, unit: &Arc<ComputeUnit>) {
        self.units
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::downgrade(unit));
    }

    fn trip(&self) {
        self.tripped.store(true, Ordering::Release);
        let units = self.units.lock().unwrap_or_else(PoisonError::into_inner);
        for unit in units.iter().filter_map(Weak::upgrade) {
            unit.sync.interrupt();
        }
    }
}

struct ComputeUnit {
    sync: WorkgroupSync,
    block: AtomicU32,
    reset: Arc<ResetLine>,
}

impl ComputeUnit {
    fn sync_or_unwind(&self) {
        if self.sync.wait(&self.reset).is_err() {
            panic::resume_unwind(Box::new(DeviceReset));
        }
    }
}

thread_local! {
    static INDICES: Cell<Option<Indices>> = const { Cell::new(None) };
    static UNIT: RefCell<Option<Arc<ComputeUnit>>> = const { RefCell::new(None) };
}

/// Indices of the calling thread. Panics outside of an emulated launch.
#[inline]
pub fn current_indices() -> Indices {
    INDICES.with(|i| i.get()).unwrap_or_else(|| {
        panic!("Attempting to read thread indices from host code outside of a kernel launch!")
    })
}

/// Intra-workgroup barrier of the calling emulated thread.
pub fn sync_threads() {
    let outcome = UNIT.with(|u| {
        let u = u.borrow();
        let unit = u.as_ref().unwrap_or_else(|| {
            panic!("Attempting to call sync_threads() from host code outside of a kernel launch!")
        });
        unit.sync.wait(&unit.reset)
    });
    if outcome.is_err() {
        panic::resume_unwind(Box::new(DeviceReset));
    }
}

/// Called once per iteration of a device spin-wait.
pub fn spin_wait() {
    let reset = UNIT.with(|u| {
        u.borrow()
            .as_ref()
            .is_some_and(|unit| unit.reset.is_tripped())
    });
    if reset {
        panic::resume_unwind(Box::new(DeviceReset));
    }
    std::thread::yield_now();
}

#[derive(Clone, Debug)]
pub struct EmulatedDevice {
    compute_units: usize,
    watchdog: Option<Duration>,
}

impl Default for EmulatedDevice {
    fn default() -> Self {
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            compute_units: parallelism.min(MAX_DEFAULT_COMPUTE_UNITS),
            watchdog: None,
        }
    }
}

impl EmulatedDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_compute_units(mut self, compute_units: usize) -> Self {
        self.compute_units = compute_units.max(1);
        self
    }

    pub fn with_watchdog(mut self, timeout: Duration) -> Self {
        self.watchdog = Some(timeout);
        self
    }

    pub fn compute_units(&self) -> usize {
        self.compute_units
    }

    pub fn watchdog(&self) -> Option<Duration> {
        self.watchdog
    }

    /// Runs `kernel` once per thread of a `grid_dim` x `block_dim` launch and
    /// blocks until every workgroup retired (or the device was reset).
    pub fn launch_1d<K>(
        &self,
        grid_dim: GridDim1D,
        block_dim: BlockDim1D,
        kernel: K,
    ) -> Result<LaunchReport, LaunchError>
    where
        K: Fn() + Sync,
    {
        if grid_dim.x < 1 || block_dim.x < 1 || block_dim.x > BlockDim1D::MAX {
            return Err(LaunchError::InvalidGeometry {
                grid: grid_dim.x,
                block: block_dim.x,
            });
        }
        let compute_units = self.compute_units.min(grid_dim.x as usize);
        debug!(
            "launching grid {} x block {} on {} emulated compute units",
            grid_dim.x, block_dim.x, compute_units
        );

        let start = Instant::now();
        let reset = Arc::new(ResetLine::default());
        let next_block = AtomicU32::new(0);
        let fault: Mutex<Option<LaunchError>> = Mutex::new(None);
        let mut spawn_error = None;
        let mut expired = None;

        let (retired_tx, retired_rx) = mpsc::channel::<()>();
        let kernel = &kernel;
        let next_block = &next_block;
        let fault = &fault;

        std::thread::scope(|scope| {
            'spawn: for unit_idx in 0..compute_units {
                let unit = Arc::new(ComputeUnit {
                    sync: WorkgroupSync::new(block_dim.x as usize),
                    block: AtomicU32::new(0),
                    reset: Arc::clone(&reset),
                });
                reset.attach(&unit);
                for thread_idx in 0..block_dim.x {
                    let unit = Arc::clone(&unit);
                    // Dropped when the thread exits; the receiver sees a
                    // disconnect once every thread is gone.
                    let retired = retired_tx.clone();
                    let spawned = std::thread::Builder::new()
                        .name(format!("cu{unit_idx}-t{thread_idx}"))
                        .stack_size(EMULATED_STACK_SIZE)
                        .spawn_scoped(scope, move || {
                            let _retired = retired;
                            run_thread(&unit, thread_idx, grid_dim, block_dim, next_block, kernel, fault);
                        });
                    if let Err(e) = spawned {
                        reset.trip();
                        spawn_error = Some(e);
                        break 'spawn;
                    }
                }
            }
            drop(retired_tx);

            let deadline = self.watchdog.map(|timeout| start + timeout);
            loop {
                let waited = match deadline {
                    Some(deadline) if expired.is_none() => retired_rx
                        .recv_timeout(deadline.saturating_duration_since(Instant::now())),
                    _ => retired_rx
                        .recv()
                        .map_err(|_| mpsc::RecvTimeoutError::Disconnected),
                };
                match waited {
                    Ok(()) => continue,
                    Err(mpsc::RecvTimeoutError::Disconnected) => break,
                    Err(mpsc::RecvTimeoutError::Timeout) => {
                        let elapsed = start.elapsed();
                        warn!("watchdog expired after {elapsed:?}, resetting emulated device");
                        reset.trip();
                        expired = Some(elapsed);
                    }
                }
            }
        });

        if let Some(e) = spawn_error {
            return Err(LaunchError::Spawn(e));
        }
        if let Some(e) = fault.lock().unwrap_or_else(PoisonError::into_inner).take() {
            return Err(e);
        }
        if let Some(elapsed) = expired {
            return Err(LaunchError::Watchdog { elapsed });
        }

        Ok(LaunchReport {
            grid_dim,
            block_dim,
            compute_units,
            elapsed: start.elapsed(),
        })
    }
}

fn run_thread<K: Fn() + Sync>(
    unit: &Arc<ComputeUnit>,
    thread_idx: i32,
    grid_dim: GridDim1D,
    block_dim: BlockDim1D,
    next_block: &AtomicU32,
    kernel: &K,
    fault: &Mutex<Option<LaunchError>>,
) {
    UNIT.with(|u| *u.borrow_mut() = Some(Arc::clone(unit)));

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        loop {
            if thread_idx == 0 {
                let block = next_block.fetch_add(1, Ordering::Relaxed);
                unit.block.store(block, Ordering::Relaxed);
            }
            // Dispatch: the whole team sees the same block.
            unit.sync_or_unwind();
            let block = unit.block.load(Ordering::Relaxed);
            if block >= grid_dim.x as u32 {
                break;
            }
            if thread_idx == 0 {
                trace!("block {block} dispatched");
            }
            INDICES.with(|i| {
                i.set(Some(Indices {
                    thread_idx,
                    block_idx: block as i32,
                    block_dim: block_dim.x,
                    grid_dim: grid_dim.x,
                }))
            });
            kernel();
            // Retire: nobody may still read `unit.block` when it is reassigned.
            unit.sync_or_unwind();
        }
    }));

    let last_indices = INDICES.with(|i| i.take());
    UNIT.with(|u| u.borrow_mut().take());

    let Err(payload) = outcome else {
        return;
    };
    if payload.is::<DeviceReset>() {
        return;
    }
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "[no msg]".to_string());
    let block_idx = last_indices.map(|i| i.block_idx).unwrap_or(-1);
    error!("kernel fault in block {block_idx}, thread {thread_idx}: {message}");

    let mut slot = fault.lock().unwrap_or_else(PoisonError::into_inner);
    if slot.is_none() {
        *slot = Some(LaunchError::KernelFault {
            block_idx,
            thread_idx,
            message,
        });
    }
    // A trap takes the whole device down.
    unit.reset.trip();
}
