/// PTX intrinsics + syscalls, only meaningful on the device.
#[cfg(target_arch = "nvptx64")]
pub mod intrinsics;

/// Reasonably thin safe wrapper around a subset of the
/// CUDA driver API.
#[cfg(all(not(target_arch = "nvptx64"), feature = "cuda"))]
pub mod driver_wrapper;
