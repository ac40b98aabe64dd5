#![cfg_attr(target_arch = "nvptx64", no_std)]
// Necessary because PTX + kernels are not really stable
#![cfg_attr(target_arch = "nvptx64", feature(abi_ptx))]
#![cfg_attr(target_arch = "nvptx64", feature(asm_experimental_arch))]
// LLVM intrinsics are used for e.g. getting blockDim.x from a special register.
#![cfg_attr(target_arch = "nvptx64", allow(internal_features))]
#![cfg_attr(target_arch = "nvptx64", feature(link_llvm_intrinsics))]

/// Cross-workgroup atomic memory primitives: loads and stores of 32-bit
/// words that stay visible across workgroups.
pub mod atomic;
/// The workgroup barrier, plus the intra-workgroup `sync_threads`.
pub mod barrier;
/// Wrappers around PTX intrinsics as well as the CUDA driver API
pub mod cuda;
/// Core primitive types and traits for safety in the GPU compute regime.
pub mod gpu_safety;
/// Declarative macros, especially `assert_universal!`
pub mod macros;
/// Opaque slice types to ensure that kernel parameter passing is safe.
pub mod slices;
/// Thread layout primitives like `ThreadIdx1D` and pre-baked known-safe
/// access patterns like FlatLayout1D
pub mod thread_layout;

/// Runs 1D kernels on host threads with workgroup semantics.
#[cfg(not(target_arch = "nvptx64"))]
pub mod emulator;

/// Build-script helper which compiles kernels to a fatbinary and links it in.
#[cfg(not(target_arch = "nvptx64"))]
pub mod build;

#[cfg(all(not(target_arch = "nvptx64"), feature = "cuda"))]
pub use cudarc;

#[cfg(target_arch = "nvptx64")]
#[panic_handler]
fn panic_handler(_info: &core::panic::PanicInfo) -> ! {
    unsafe { cuda::intrinsics::__trap() }
}
