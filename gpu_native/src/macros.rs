#[inline]
#[cold]
pub fn __cold() {}

/// Asserts on both sides: a trapping `__assertfail` on the device, a regular
/// `assert!` on the host (which the emulator reports as a kernel fault).
/// Afterwards the condition is handed to the optimizer as a hint.
///
/// Device messages are emitted as C strings, so only literals are accepted.
#[macro_export]
macro_rules! assert_universal {
    ($expr: expr) => {
        #[cfg(target_arch = "nvptx64")]
        $crate::cu_assert!($expr);
        #[cfg(not(target_arch = "nvptx64"))]
        assert!($expr);

        unsafe { core::hint::assert_unchecked($expr) };
    };
    ($expr: expr, $msg: literal) => {
        #[cfg(target_arch = "nvptx64")]
        $crate::cu_assert!($expr, $msg);
        #[cfg(not(target_arch = "nvptx64"))]
        assert!($expr, $msg);

        unsafe { core::hint::assert_unchecked($expr) };
    };
}

#[macro_export]
macro_rules! cu_assert {
    ($expr: expr) => {
        $crate::cu_assert!($expr, stringify!($expr));
    };
    ($expr: expr, $($msg: tt)+) => {
        #[cfg(target_arch = "nvptx64")]
        if !($expr) {
            $crate::macros::__cold();
            unsafe {
                $crate::cuda::intrinsics::__assert_fail(
                    concat!($($msg)+, "\0").as_ptr(),
                    concat!(file!(), "\0").as_ptr(),
                    line!(),
                    "[fn cannot be captured]\0".as_ptr(),
                )
            };
        }
        #[cfg(not(target_arch = "nvptx64"))]
        compile_error!("Cannot call cu_assert outside PTX!");
    };
}

#[cfg(test)]
mod test {
    #[test]
    fn test_host_assert_passes_through() {
        let len = 4usize;
        assert_universal!(3 < len);
        assert_universal!(0 < len, "Empty!");
    }

    #[test]
    #[should_panic(expected = "Too short!")]
    fn test_host_assert_panics_with_message() {
        let len = 2usize;
        assert_universal!(len > 3, "Too short!");
    }
}
