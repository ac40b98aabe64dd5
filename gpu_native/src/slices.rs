use core::marker::PhantomData;
use core::ops::Index;

use crate::{
    assert_universal,
    atomic::{atomic_load_f32, atomic_store_f32},
    gpu_safety::UniqueId,
};

/// Read-only view of device memory which every thread of a launch receives a
/// copy of.
#[repr(C)]
pub struct DeviceSlice<'a, T> {
    ptr: *const T,
    len: usize,
    _marker: PhantomData<&'a [T]>,
}

/// Shared, writable view of device memory. Every thread of a launch holds a
/// copy, so writes must go through atomics (or a [`UniqueId`]) and never
/// through plain references.
#[repr(C)]
pub struct DeviceSliceMut<'a, T> {
    ptr: *mut T,
    len: usize,
    _marker: PhantomData<&'a mut [T]>,
}

impl<T> Clone for DeviceSlice<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for DeviceSlice<'_, T> {}

impl<T> Clone for DeviceSliceMut<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for DeviceSliceMut<'_, T> {}

// Sharing between emulated threads is the whole point; the access discipline
// is the atomic one documented above.
unsafe impl<T: Sync> Send for DeviceSlice<'_, T> {}
unsafe impl<T: Sync> Sync for DeviceSlice<'_, T> {}
unsafe impl<T: Send + Sync> Send for DeviceSliceMut<'_, T> {}
unsafe impl<T: Send + Sync> Sync for DeviceSliceMut<'_, T> {}

impl<'a, T> DeviceSlice<'a, T> {
    /// # Safety
    ///
    /// `ptr` must be valid for reads of `len` elements for `'a`, and nothing may
    /// write to that memory while the slice is in use.
    #[inline(always)]
    pub unsafe fn from_raw_parts(ptr: *const T, len: usize) -> Self {
        Self {
            ptr,
            len,
            _marker: PhantomData,
        }
    }
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }
    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
    #[inline(always)]
    pub fn as_ptr(&self) -> *const T {
        self.ptr
    }
}

impl<'a, T> DeviceSliceMut<'a, T> {
    /// # Safety
    ///
    /// `ptr` must be valid for reads and writes of `len` elements for `'a`,
    /// and all concurrent accesses must be atomic.
    #[inline(always)]
    pub unsafe fn from_raw_parts(ptr: *mut T, len: usize) -> Self {
        Self {
            ptr,
            len,
            _marker: PhantomData,
        }
    }
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }
    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
    #[inline(always)]
    pub fn as_ptr(&self) -> *const T {
        self.ptr
    }
    #[inline(always)]
    pub fn as_mut_ptr(&mut self) -> *mut T {
        self.ptr
    }
}

impl<'a> DeviceSliceMut<'a, f32> {
    /// Cross-workgroup visible read of element `idx`.
    #[inline(always)]
    pub fn atomic_load(&self, idx: u32) -> f32 {
        assert_universal!((idx as usize) < self.len, "Out of bounds for atomic load!");
        unsafe { atomic_load_f32(self.ptr, idx) }
    }

    /// Cross-workgroup visible write of element `idx`.
    #[inline(always)]
    pub fn atomic_store(&self, idx: u32, value: f32) {
        assert_universal!((idx as usize) < self.len, "Out of bounds for atomic store!");
        unsafe { atomic_store_f32(self.ptr, value, idx) }
    }
}

impl<'a, T> From<&'a [T]> for DeviceSlice<'a, T> {
    #[inline(always)]
    fn from(value: &'a [T]) -> Self {
        unsafe { Self::from_raw_parts(value.as_ptr(), value.len()) }
    }
}

impl<'a, T> From<&'a mut [T]> for DeviceSlice<'a, T> {
    #[inline(always)]
    fn from(value: &'a mut [T]) -> Self {
        unsafe { Self::from_raw_parts(value.as_ptr(), value.len()) }
    }
}

impl<'a, T> From<&'a mut [T]> for DeviceSliceMut<'a, T> {
    #[inline(always)]
    fn from(value: &'a mut [T]) -> Self {
        unsafe { Self::from_raw_parts(value.as_mut_ptr(), value.len()) }
    }
}

impl<'a, T> Index<usize> for DeviceSlice<'a, T> {
    type Output = T;
    #[inline(always)]
    fn index(&self, index: usize) -> &Self::Output {
        assert_universal!(index < self.len);
        unsafe { &*self.ptr.add(index) }
    }
}

impl<'a, T> Index<UniqueId> for DeviceSlice<'a, T> {
    type Output = T;
    #[inline(always)]
    fn index(&self, index: UniqueId) -> &Self::Output {
        &self[index.idx()]
    }
}

unsafe impl<T> crate::gpu_safety::GPUPassable for DeviceSlice<'_, T> {
    type FFIRep = (*const T, u64);

    fn to_ffi(&mut self) -> Self::FFIRep {
        (self.as_ptr(), self.len() as u64)
    }

    unsafe fn from_ffi(other: Self::FFIRep) -> Self {
        unsafe { Self::from_raw_parts(other.0, other.1 as usize) }
    }
}

unsafe impl<T> crate::gpu_safety::GPUPassable for DeviceSliceMut<'_, T> {
    type FFIRep = (*mut T, u64);

    fn to_ffi(&mut self) -> Self::FFIRep {
        (self.as_mut_ptr(), self.len() as u64)
    }

    unsafe fn from_ffi(other: Self::FFIRep) -> Self {
        unsafe { Self::from_raw_parts(other.0, other.1 as usize) }
    }
}
