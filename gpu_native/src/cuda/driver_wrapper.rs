use core::ffi::{CStr, c_void};
use core::marker::PhantomData;
use core::mem::MaybeUninit;
use std::sync::LazyLock;

use cudarc::driver::DriverError;
use cudarc::driver::result as cuda;
use cudarc::driver::sys as cuda_sys;
use log::{debug, warn};

use crate::slices::{DeviceSlice, DeviceSliceMut};
use crate::thread_layout::{BlockDim1D, GridDim1D};

pub struct CUDAContext(cuda_sys::CUcontext);
unsafe impl Send for CUDAContext {}
unsafe impl Sync for CUDAContext {}

impl CUDAContext {
    /// Makes this context current on the calling thread.
    pub fn bind(&self) -> Result<(), DriverError> {
        unsafe { cuda::ctx::set_current(self.0) }
    }

    pub fn synchronize(&self) -> Result<(), DriverError> {
        self.bind()?;
        cuda::ctx::synchronize()
    }
}

static DEFAULT_CTX: LazyLock<Result<CUDAContext, DriverError>> = LazyLock::new(|| {
    cuda::init()?;
    let device_count = cuda::device::get_count()?;
    if device_count < 1 {
        return Err(DriverError(cuda_sys::cudaError_enum::CUDA_ERROR_NO_DEVICE));
    }
    let device = cuda::device::get(0)?;
    let ctx = unsafe { cuda::primary_ctx::retain(device) }?;
    debug!("retained primary context of device 0 ({device_count} visible)");
    Ok(CUDAContext(ctx))
});

/// Primary context of device 0, bound to the calling thread.
pub fn default_context() -> Result<&'static CUDAContext, DriverError> {
    let ctx = DEFAULT_CTX.as_ref().map_err(|e| *e)?;
    ctx.bind()?;
    Ok(ctx)
}

pub struct CUDAModule(cuda_sys::CUmodule);
unsafe impl Send for CUDAModule {}
unsafe impl Sync for CUDAModule {}

impl CUDAModule {
    /// # Safety
    ///
    /// `fatbin` must be a fatbinary image as produced by `fatbinary`.
    pub unsafe fn from_fatbin(fatbin: &'static [u8]) -> Result<Self, DriverError> {
        default_context()?;
        let module = unsafe { cuda::module::load_data(fatbin.as_ptr() as *const c_void) }?;
        Ok(Self(module))
    }

    pub fn get_function(&self, fn_name: &CStr) -> Result<CUDAKernel, DriverError> {
        let mut func = MaybeUninit::uninit();
        unsafe { cuda_sys::lib().cuModuleGetFunction(func.as_mut_ptr(), self.0, fn_name.as_ptr()) }
            .result()?;
        Ok(CUDAKernel(unsafe { func.assume_init() }))
    }
}

pub struct CUDAKernel(cuda_sys::CUfunction);
unsafe impl Send for CUDAKernel {}
unsafe impl Sync for CUDAKernel {}

impl CUDAKernel {
    /// # Safety
    ///
    /// `kernel_params` must match the kernel's parameter list, element by
    /// element.
    pub unsafe fn launch_1d(
        &self,
        grid_dim: GridDim1D,
        block_dim: BlockDim1D,
        shared_mem_bytes: u32,
        stream: &CUDAStream,
        kernel_params: &mut [*mut c_void],
    ) -> Result<(), DriverError> {
        default_context()?;
        unsafe {
            cuda::launch_kernel(
                self.0,
                grid_dim.into(),
                block_dim.into(),
                shared_mem_bytes,
                stream.0,
                kernel_params,
            )
        }
    }
}

pub struct CUDAStream(cuda_sys::CUstream);
unsafe impl Send for CUDAStream {}
unsafe impl Sync for CUDAStream {}

impl CUDAStream {
    pub fn new() -> Result<Self, DriverError> {
        default_context()?;
        Ok(Self(cuda::stream::create(cuda::stream::StreamKind::NonBlocking)?))
    }

    pub fn synchronize(&self) -> Result<(), DriverError> {
        unsafe { cuda::stream::synchronize(self.0) }
    }
}

impl Drop for CUDAStream {
    fn drop(&mut self) {
        if let Err(e) = unsafe { cuda::stream::destroy(self.0) } {
            warn!("failed to destroy stream: {e:?}");
        }
    }
}

/// Owned device allocation of `len` elements of `T`.
pub struct DeviceBuffer<T> {
    ptr: cuda_sys::CUdeviceptr,
    len: usize,
    _marker: PhantomData<T>,
}

impl<T: Copy> DeviceBuffer<T> {
    pub fn zeroed(len: usize) -> Result<Self, DriverError> {
        default_context()?;
        let bytes = (len * size_of::<T>()).max(1);
        let ptr = unsafe { cuda::malloc_sync(bytes) }?;
        let buffer = Self {
            ptr,
            len,
            _marker: PhantomData,
        };
        unsafe { cuda::memset_d8_sync(ptr, 0, bytes) }?;
        Ok(buffer)
    }

    pub fn copy_from_host(&mut self, data: &[T]) -> Result<(), DriverError> {
        assert_eq!(data.len(), self.len, "Host and device lengths differ!");
        if self.len > 0 {
            default_context()?;
            unsafe { cuda::memcpy_htod_sync(self.ptr, data) }?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn copy_to_host(&self, out: &mut [T]) -> Result<(), DriverError> {
        assert_eq!(out.len(), self.len, "Host and device lengths differ!");
        if self.len > 0 {
            default_context()?;
            unsafe { cuda::memcpy_dtoh_sync(out, self.ptr) }?;
        }
        Ok(())
    }

    pub fn as_slice(&self) -> DeviceSlice<'_, T> {
        unsafe { DeviceSlice::from_raw_parts(self.ptr as *const T, self.len) }
    }

    pub fn as_slice_mut(&mut self) -> DeviceSliceMut<'_, T> {
        unsafe { DeviceSliceMut::from_raw_parts(self.ptr as *mut T, self.len) }
    }
}

impl<T> Drop for DeviceBuffer<T> {
    fn drop(&mut self) {
        if let Err(e) = unsafe { cuda::free_sync(self.ptr) } {
            warn!("failed to free device buffer: {e:?}");
        }
    }
}
