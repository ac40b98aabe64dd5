pub use crate::gpu_safety::ThreadLayout;

use crate::gpu_safety::UniqueId;

/// `blockIdx.x * blockDim.x + threadIdx.x`, the row-major element owned by
/// each thread of a 1D launch.
pub struct FlatLayout1D;

unsafe impl ThreadLayout for FlatLayout1D {
    #[inline(always)] // Cross-crate inlining keeps this a handful of special-register reads.
    fn uid(&self) -> UniqueId {
        let uid = (Thread1D::thread_idx().x as usize)
            + (Thread1D::block_idx().x as usize) * (Thread1D::block_dim().x as usize);
        unsafe { UniqueId::new(uid) }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThreadIdx1D {
    pub x: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockIdx1D {
    pub x: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockDim1D {
    pub x: i32,
}

impl BlockDim1D {
    /// Largest block the hardware (and the emulator) accepts.
    pub const MAX: i32 = 1024;

    pub fn new(x: i32) -> Self {
        Self { x }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GridDim1D {
    pub x: i32,
}

impl GridDim1D {
    pub fn new(x: i32) -> Self {
        Self { x }
    }
}

// Driver launch geometry is always (x, y, z).
impl From<BlockDim1D> for (u32, u32, u32) {
    fn from(value: BlockDim1D) -> Self {
        (value.x as u32, 1, 1)
    }
}

impl From<GridDim1D> for (u32, u32, u32) {
    fn from(value: GridDim1D) -> Self {
        (value.x as u32, 1, 1)
    }
}

#[cfg(target_arch = "nvptx64")]
mod registers {
    use crate::cuda::intrinsics as sreg;

    #[inline(always)]
    pub fn thread_x() -> i32 {
        unsafe { sreg::__thread_idx_x() }
    }
    #[inline(always)]
    pub fn block_x() -> i32 {
        unsafe { sreg::__block_idx_x() }
    }
    #[inline(always)]
    pub fn block_dim_x() -> i32 {
        unsafe { sreg::__block_dim_x() }
    }
    #[inline(always)]
    pub fn grid_dim_x() -> i32 {
        unsafe { sreg::__grid_dim_x() }
    }
}

// On the host these are only meaningful from inside an emulated launch.
#[cfg(not(target_arch = "nvptx64"))]
mod registers {
    use crate::emulator::current_indices;

    pub fn thread_x() -> i32 {
        current_indices().thread_idx
    }
    pub fn block_x() -> i32 {
        current_indices().block_idx
    }
    pub fn block_dim_x() -> i32 {
        current_indices().block_dim
    }
    pub fn grid_dim_x() -> i32 {
        current_indices().grid_dim
    }
}

/// Index accessors for a launch of dimension `DIM`.
pub struct ThreadIdx<const DIM: usize>;

pub type Thread1D = ThreadIdx<1>;

impl Thread1D {
    #[inline(always)]
    pub fn thread_idx() -> ThreadIdx1D {
        ThreadIdx1D {
            x: registers::thread_x(),
        }
    }
    #[inline(always)]
    pub fn block_idx() -> BlockIdx1D {
        BlockIdx1D {
            x: registers::block_x(),
        }
    }
    #[inline(always)]
    pub fn block_dim() -> BlockDim1D {
        BlockDim1D {
            x: registers::block_dim_x(),
        }
    }
    #[inline(always)]
    pub fn grid_dim() -> GridDim1D {
        GridDim1D {
            x: registers::grid_dim_x(),
        }
    }
}
