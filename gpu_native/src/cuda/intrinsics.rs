#[allow(improper_ctypes)]
#[allow(dead_code)]
unsafe extern "C" {
    #[link_name = "llvm.nvvm.barrier0"]
    pub fn __syncthreads() -> ();
    #[link_name = "llvm.nvvm.read.ptx.sreg.ntid.x"]
    pub fn __block_dim_x() -> i32;
    #[link_name = "llvm.nvvm.read.ptx.sreg.ctaid.x"]
    pub fn __block_idx_x() -> i32;
    #[link_name = "llvm.nvvm.read.ptx.sreg.nctaid.x"]
    pub fn __grid_dim_x() -> i32;
    #[link_name = "llvm.nvvm.read.ptx.sreg.tid.x"]
    pub fn __thread_idx_x() -> i32;

    fn __assertfail(
        message: *const u8,
        file: *const u8,
        line: u32,
        function: *const u8,
        char_size: usize,
    );

    pub fn vprintf(format: *const u8, valist: *const core::ffi::c_void) -> i32;
}

#[inline]
pub unsafe fn __assert_fail(message: *const u8, file: *const u8, line: u32, function: *const u8) {
    unsafe { __assertfail(message, file, line, function, 1) };
}

pub unsafe fn __trap() -> ! {
    unsafe { core::arch::asm!("trap;") }
    loop {}
}

/// Orders all prior memory accesses of this thread against later ones, as
/// observed by every thread on the device.
#[inline(always)]
pub unsafe fn __membar_gl() {
    unsafe { core::arch::asm!("membar.gl;") }
}

/// Same as `__membar_gl` but also for the host and peer devices.
#[inline(always)]
pub unsafe fn __membar_sys() {
    unsafe { core::arch::asm!("membar.sys;") }
}
