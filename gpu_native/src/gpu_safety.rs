/// Typed wrapper which is used to signify that no other thread
/// in the grid has the same ID.
#[derive(Clone, Copy, Debug)]
pub struct UniqueId(usize);

impl UniqueId {
    /// # Safety
    ///
    /// No other thread of the running grid may hold a `UniqueId` with the same `idx`.
    #[inline(always)]
    pub unsafe fn new(idx: usize) -> Self {
        Self(idx)
    }
    #[inline(always)]
    pub fn idx(&self) -> usize {
        self.0
    }
}

impl From<UniqueId> for usize {
    fn from(value: UniqueId) -> Self {
        value.idx()
    }
}

impl PartialEq<usize> for UniqueId {
    #[inline(always)]
    fn eq(&self, other: &usize) -> bool {
        self.0 == *other
    }
}

impl PartialOrd<usize> for UniqueId {
    #[inline(always)]
    fn partial_cmp(&self, other: &usize) -> Option<core::cmp::Ordering> {
        Some(self.0.cmp(other))
    }
}

/// This trait allows users to promise that their type is able
/// to produce unique by-thread values (i.e. no two threads will
/// produce the same value). Keep in mind that this property must hold
/// for _all_ values of the type.
pub unsafe trait ThreadLayout {
    fn uid(&self) -> UniqueId;
}

/// **FFIRep should be a tuple type, or gpu kernel macros will fail**
///
/// This trait allows users to promise that their type is able (potentially
/// after decomposing it into its component pieces) to be passed to a kernel.
///
/// We decompose e.g. a slice into a pointer and a length rather than passing a
/// struct because the struct is treated as serialized data on the device and
/// loses pointer provenance (LD.E instead of LDG.E in the generated SASS).
pub unsafe trait GPUPassable {
    type FFIRep;
    fn to_ffi(&mut self) -> Self::FFIRep;
    unsafe fn from_ffi(other: Self::FFIRep) -> Self;
}

unsafe impl GPUPassable for u32 {
    type FFIRep = (u32,);

    fn to_ffi(&mut self) -> Self::FFIRep {
        (*self,)
    }

    unsafe fn from_ffi(other: Self::FFIRep) -> Self {
        other.0
    }
}

/// Lets the kernel macro name the type of the `INDEX`-th FFI component
/// without knowing the concrete tuple.
pub trait TupleIndex<const TUPLE_SIZE: u8, const INDEX: u8> {
    type Ty;
}

macro_rules! tuple_trait_decl {
    ($assoc_ty: ident, $tuple_size: literal, $valid_index: literal, $($generics: ident),+) => {
        impl<$($generics,)*> TupleIndex<$tuple_size, $valid_index> for ($($generics,)*) {
            type Ty = $assoc_ty;
        }
    };
}

// Kernel arguments decompose into at most three scalars.
tuple_trait_decl!(A, 1, 0, A);

tuple_trait_decl!(A, 2, 0, A, B);
tuple_trait_decl!(B, 2, 1, A, B);

tuple_trait_decl!(A, 3, 0, A, B, C);
tuple_trait_decl!(B, 3, 1, A, B, C);
tuple_trait_decl!(C, 3, 2, A, B, C);
