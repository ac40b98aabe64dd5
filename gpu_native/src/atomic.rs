//! Every word shared between workgroups goes through these routines. Plain
//! loads and stores may be served from a per-SM (L1) cache and never observe
//! a peer's write, so each one is an atomic with at least device scope.
//!
//! The device store has to be picked per GPU generation; an architecture
//! without an implementation below refuses to compile.

#[cfg(all(
    target_arch = "nvptx64",
    not(any(
        target_feature = "sm_60",
        target_feature = "sm_61",
        target_feature = "sm_62",
        target_feature = "sm_70",
        target_feature = "sm_72",
        target_feature = "sm_75",
        target_feature = "sm_80",
        target_feature = "sm_86",
        target_feature = "sm_87",
        target_feature = "sm_89",
        target_feature = "sm_90",
    ))
))]
compile_error!("No cross-workgroup atomic store is implemented for this GPU architecture.");

#[allow(unused_macros)]
macro_rules! impl_scoped_atom {
    ($name:ident, $instr:literal) => {
        #[inline(always)]
        pub unsafe fn $name(ptr: *mut u32, val: u32) -> u32 {
            let old_val: u32;
            unsafe {
                core::arch::asm!(
                    concat!($instr, " {0}, [{1}], {2};"),
                    out(reg32) old_val,
                    in(reg64) ptr,
                    in(reg32) val,
                )
            };
            old_val
        }
    };
}

// Volta and newer have the scoped PTX memory model.
#[cfg(all(
    target_arch = "nvptx64",
    any(
        target_feature = "sm_70",
        target_feature = "sm_72",
        target_feature = "sm_75",
        target_feature = "sm_80",
        target_feature = "sm_86",
        target_feature = "sm_87",
        target_feature = "sm_89",
        target_feature = "sm_90",
    )
))]
mod arch {
    #[inline(always)]
    pub unsafe fn load_u32(ptr: *const u32) -> u32 {
        let val: u32;
        unsafe {
            core::arch::asm!(
                "ld.acquire.gpu.global.u32 {0}, [{1}];",
                out(reg32) val,
                in(reg64) ptr,
            )
        };
        val
    }

    #[inline(always)]
    pub unsafe fn store_u32(ptr: *mut u32, val: u32) {
        unsafe {
            core::arch::asm!(
                "st.release.gpu.global.b32 [{0}], {1};",
                "fence.acq_rel.gpu;",
                in(reg64) ptr,
                in(reg32) val,
            )
        };
    }

    #[inline(always)]
    pub unsafe fn cas_u32(ptr: *mut u32, expected: u32, desired: u32) -> u32 {
        let old_val: u32;
        unsafe {
            core::arch::asm!(
                "atom.acq_rel.sys.global.cas.b32 {0}, [{1}], {2}, {3};",
                out(reg32) old_val,
                in(reg64) ptr,
                in(reg32) expected,
                in(reg32) desired,
            )
        };
        old_val
    }

    impl_scoped_atom!(add_u32, "atom.release.sys.global.add.u32");
}

// Pascal: no scopes, so bypass L1 and bracket with fences instead.
#[cfg(all(
    target_arch = "nvptx64",
    any(
        target_feature = "sm_60",
        target_feature = "sm_61",
        target_feature = "sm_62",
    ),
    not(any(
        target_feature = "sm_70",
        target_feature = "sm_72",
        target_feature = "sm_75",
        target_feature = "sm_80",
        target_feature = "sm_86",
        target_feature = "sm_87",
        target_feature = "sm_89",
        target_feature = "sm_90",
    ))
))]
mod arch {
    use crate::cuda::intrinsics::{__membar_gl, __membar_sys};

    #[inline(always)]
    pub unsafe fn load_u32(ptr: *const u32) -> u32 {
        let val: u32;
        unsafe {
            core::arch::asm!(
                "ld.volatile.global.u32 {0}, [{1}];",
                out(reg32) val,
                in(reg64) ptr,
            );
            __membar_gl();
        }
        val
    }

    #[inline(always)]
    pub unsafe fn store_u32(ptr: *mut u32, val: u32) {
        unsafe {
            __membar_gl();
            core::arch::asm!(
                "st.global.cg.b32 [{0}], {1};",
                in(reg64) ptr,
                in(reg32) val,
            );
            __membar_gl();
        }
    }

    #[inline(always)]
    pub unsafe fn cas_u32(ptr: *mut u32, expected: u32, desired: u32) -> u32 {
        let old_val: u32;
        unsafe {
            __membar_sys();
            core::arch::asm!(
                "atom.global.cas.b32 {0}, [{1}], {2}, {3};",
                out(reg32) old_val,
                in(reg64) ptr,
                in(reg32) expected,
                in(reg32) desired,
            );
            __membar_sys();
        }
        old_val
    }

    impl_scoped_atom!(add_u32_unfenced, "atom.global.add.u32");

    #[inline(always)]
    pub unsafe fn add_u32(ptr: *mut u32, val: u32) -> u32 {
        unsafe {
            __membar_sys();
            add_u32_unfenced(ptr, val)
        }
    }
}

// Host emulation: workgroups are OS threads, so the Rust memory model applies.
#[cfg(not(target_arch = "nvptx64"))]
mod arch {
    use core::sync::atomic::{AtomicU32, Ordering, fence};

    #[inline(always)]
    pub unsafe fn load_u32(ptr: *const u32) -> u32 {
        unsafe { AtomicU32::from_ptr(ptr as *mut u32) }.load(Ordering::Acquire)
    }

    #[inline(always)]
    pub unsafe fn store_u32(ptr: *mut u32, val: u32) {
        unsafe { AtomicU32::from_ptr(ptr) }.store(val, Ordering::Release);
        fence(Ordering::SeqCst);
    }

    #[inline(always)]
    pub unsafe fn cas_u32(ptr: *mut u32, expected: u32, desired: u32) -> u32 {
        match unsafe { AtomicU32::from_ptr(ptr) }.compare_exchange(
            expected,
            desired,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(v) | Err(v) => v,
        }
    }

    #[inline(always)]
    pub unsafe fn add_u32(ptr: *mut u32, val: u32) -> u32 {
        unsafe { AtomicU32::from_ptr(ptr) }.fetch_add(val, Ordering::Release)
    }
}

/// Reads the word at `addr`; never torn.
///
/// # Safety
///
/// * `addr` must be aligned to 4 bytes and point into device-global memory
///   (host memory when emulating) that outlives the call.
/// * Every other access to the word during the kernel must also be atomic.
#[inline(always)]
pub unsafe fn atomic_load_u32(addr: *const u32) -> u32 {
    unsafe { arch::load_u32(addr) }
}

/// `atomic_load_u32` reinterpreted as a float. `offset` is the per-thread
/// element offset from `addr`.
///
/// # Safety
///
/// Same requirements as [`atomic_load_u32`] for `addr + offset`.
#[inline(always)]
pub unsafe fn atomic_load_f32(addr: *const f32, offset: u32) -> f32 {
    f32::from_bits(unsafe { atomic_load_u32(addr.add(offset as usize).cast()) })
}

/// Writes `value` to `addr + offset` so that any later atomic load by another
/// workgroup sees it (or something newer). Returns only after the store has
/// drained.
///
/// # Safety
///
/// Same requirements as [`atomic_load_u32`] for `addr + offset`.
#[inline(always)]
pub unsafe fn atomic_store_f32(addr: *mut f32, value: f32, offset: u32) {
    unsafe { arch::store_u32(addr.add(offset as usize).cast(), value.to_bits()) }
}

/// System-scope compare-and-swap. Returns the value held before the call;
/// the swap happened iff that equals `expected`.
///
/// # Safety
///
/// Same requirements as [`atomic_load_u32`].
#[inline(always)]
pub unsafe fn atomic_compare_and_swap_u32(addr: *mut u32, expected: u32, desired: u32) -> u32 {
    unsafe { arch::cas_u32(addr, expected, desired) }
}

/// System-scope fetch-and-add, returning the previous value.
///
/// # Safety
///
/// Same requirements as [`atomic_load_u32`].
#[inline(always)]
pub unsafe fn atomic_add_u32(addr: *mut u32, delta: u32) -> u32 {
    unsafe { arch::add_u32(addr, delta) }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_float_round_trip_through_offset() {
        let mut words = [0.0f32; 4];
        let ptr = words.as_mut_ptr();
        unsafe {
            atomic_store_f32(ptr, 2.5, 3);
            assert_eq!(atomic_load_f32(ptr, 3), 2.5);
            assert_eq!(atomic_load_f32(ptr, 0), 0.0);
        }
        assert_eq!(words, [0.0, 0.0, 0.0, 2.5]);
    }

    #[test]
    fn test_cas_only_swaps_on_match() {
        let mut slot = 0u32;
        let ptr = &mut slot as *mut u32;
        unsafe {
            assert_eq!(atomic_compare_and_swap_u32(ptr, 1, 0), 0);
            assert_eq!(atomic_load_u32(ptr), 0);
            assert_eq!(atomic_compare_and_swap_u32(ptr, 0, 1), 0);
            assert_eq!(atomic_load_u32(ptr), 1);
            assert_eq!(atomic_compare_and_swap_u32(ptr, 0, 1), 1);
        }
    }

    #[test]
    fn test_add_returns_previous() {
        let mut slot = 41u32;
        let ptr = &mut slot as *mut u32;
        unsafe {
            assert_eq!(atomic_add_u32(ptr, 1), 41);
            assert_eq!(atomic_add_u32(ptr, 0), 42);
            assert_eq!(atomic_load_u32(ptr), 42);
        }
    }

    #[test]
    fn test_store_is_visible_to_spinning_peer() {
        let mut payload = 0.0f32;
        let mut flag = 0u32;
        let payload_addr = &mut payload as *mut f32 as usize;
        let flag_addr = &mut flag as *mut u32 as usize;

        std::thread::scope(|s| {
            s.spawn(move || unsafe {
                atomic_store_f32(payload_addr as *mut f32, 7.25, 0);
                atomic_add_u32(flag_addr as *mut u32, 1);
            });
            s.spawn(move || unsafe {
                while atomic_load_u32(flag_addr as *const u32) == 0 {
                    std::thread::yield_now();
                }
                assert_eq!(atomic_load_f32(payload_addr as *const f32, 0), 7.25);
            });
        });
    }

    #[test]
    fn test_concurrent_adds_are_not_lost() {
        let mut counter = 0u32;
        let addr = &mut counter as *mut u32 as usize;
        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(move || {
                    for _ in 0..1000 {
                        unsafe { atomic_add_u32(addr as *mut u32, 1) };
                    }
                });
            }
        });
        assert_eq!(counter, 8000);
    }
}
