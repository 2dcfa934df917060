// ── Foreign buffer ownership ──
//
// Out-parameters of variable length are allocated by the server with the task
// allocator and handed to us. Each one is wrapped in a guard the moment the
// call returns; the guard's `Drop` releases it exactly once, whether decoding
// succeeded, failed half way, or unwound.

use std::ffi::c_void;

use crate::error::DecodeError;
use crate::variant::{RawVariant, Variant, decode_variant};
use crate::wide::read_wide;

/// The far side's deallocation entry points.
///
/// On Windows this is the COM task allocator ([`TaskAllocator`]); tests use
/// the counting allocator of the in-process fake server.
pub trait ForeignAllocator: Send + Sync {
    /// Release a block returned by the server. Null is a no-op.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live block from this allocator, not yet freed.
    unsafe fn free(&self, ptr: *mut c_void);

    /// Release everything a VARIANT owns and reset it to `VT_EMPTY`.
    ///
    /// # Safety
    ///
    /// `variant` must point to an initialized VARIANT whose payload was
    /// allocated by this allocator.
    unsafe fn clear_variant(&self, variant: *mut RawVariant);
}

#[cfg(windows)]
pub use task::TaskAllocator;

#[cfg(windows)]
mod task {
    use std::ffi::c_void;

    use tracing::warn;

    use super::ForeignAllocator;
    use crate::hresult::Hresult;
    use crate::variant::RawVariant;

    #[link(name = "ole32")]
    unsafe extern "system" {
        fn CoTaskMemFree(pv: *mut c_void);
    }

    #[link(name = "oleaut32")]
    unsafe extern "system" {
        fn VariantClear(pvarg: *mut RawVariant) -> Hresult;
    }

    /// `CoTaskMemFree` / `VariantClear`.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct TaskAllocator;

    impl ForeignAllocator for TaskAllocator {
        unsafe fn free(&self, ptr: *mut c_void) {
            if !ptr.is_null() {
                // SAFETY: caller contract; CoTaskMemFree owns task memory.
                unsafe { CoTaskMemFree(ptr) };
            }
        }

        unsafe fn clear_variant(&self, variant: *mut RawVariant) {
            // SAFETY: caller contract.
            let hr = unsafe { VariantClear(variant) };
            if hr.is_failure() {
                warn!(hresult = %hr, "VariantClear failed");
            }
        }
    }
}

// ── Bounded slice view ──────────────────────────────────────────────

/// View `count` elements of foreign memory as a slice.
///
/// A zero count yields an empty slice whatever the pointer is; a null
/// pointer with a non-zero count is a decode error.
///
/// # Safety
///
/// When `ptr` is non-null it must be valid for reads of `count` elements for
/// the lifetime `'a`.
pub unsafe fn foreign_slice<'a, T>(
    ptr: *const T,
    count: usize,
    field: &'static str,
) -> Result<&'a [T], DecodeError> {
    if count == 0 {
        return Ok(&[]);
    }
    if ptr.is_null() {
        return Err(DecodeError::NullArray { field, count });
    }
    if !ptr.is_aligned() {
        return Err(DecodeError::Misaligned { field });
    }
    // SAFETY: non-null, aligned, and readable for `count` elements per the
    // caller contract.
    Ok(unsafe { std::slice::from_raw_parts(ptr, count) })
}

// ── Guards ──────────────────────────────────────────────────────────

/// One server-allocated block (a struct or a flat array of plain values).
pub struct ForeignBlock<'a, T> {
    alloc: &'a dyn ForeignAllocator,
    ptr: *mut T,
    count: usize,
}

impl<'a, T> ForeignBlock<'a, T> {
    /// Take ownership of a single-element block.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live block from `alloc` that nobody else frees.
    pub unsafe fn new(alloc: &'a dyn ForeignAllocator, ptr: *mut T) -> Self {
        Self {
            alloc,
            ptr,
            count: usize::from(!ptr.is_null()),
        }
    }

    /// Take ownership of a block of `count` elements.
    ///
    /// # Safety
    ///
    /// As [`new`](Self::new), and the block holds `count` initialized elements.
    pub unsafe fn array(alloc: &'a dyn ForeignAllocator, ptr: *mut T, count: usize) -> Self {
        Self { alloc, ptr, count }
    }

    pub fn as_ptr(&self) -> *mut T {
        self.ptr
    }

    /// Borrow the single element, if any.
    pub fn get(&self) -> Option<&T> {
        if self.ptr.is_null() || !self.ptr.is_aligned() {
            return None;
        }
        // SAFETY: non-null, aligned, and owned by this guard.
        Some(unsafe { &*self.ptr })
    }

    pub fn as_slice(&self, field: &'static str) -> Result<&[T], DecodeError> {
        // SAFETY: construction contract.
        unsafe { foreign_slice(self.ptr, self.count, field) }
    }
}

impl<T: Copy> ForeignBlock<'_, T> {
    pub fn to_vec(&self, field: &'static str) -> Result<Vec<T>, DecodeError> {
        self.as_slice(field).map(<[T]>::to_vec)
    }
}

impl<T> Drop for ForeignBlock<'_, T> {
    fn drop(&mut self) {
        // SAFETY: the guard owns the block and frees it exactly once.
        unsafe { self.alloc.free(self.ptr.cast()) };
    }
}

/// A server-allocated array of server-allocated wide strings.
pub struct ForeignStrings<'a> {
    alloc: &'a dyn ForeignAllocator,
    ptr: *mut *mut u16,
    count: usize,
}

impl<'a> ForeignStrings<'a> {
    /// # Safety
    ///
    /// `ptr` must be null or a live array of `count` string pointers from
    /// `alloc`, each null or itself a live block from `alloc`.
    pub unsafe fn new(alloc: &'a dyn ForeignAllocator, ptr: *mut *mut u16, count: usize) -> Self {
        Self { alloc, ptr, count }
    }

    /// Copy every string out.
    pub fn read(&self, field: &'static str) -> Result<Vec<String>, DecodeError> {
        // SAFETY: construction contract.
        let items = unsafe { foreign_slice(self.ptr, self.count, field) }?;
        items
            .iter()
            // SAFETY: each element is null or a NUL-terminated string.
            .map(|&s| unsafe { read_wide(s, field) })
            .collect()
    }
}

impl Drop for ForeignStrings<'_> {
    fn drop(&mut self) {
        if self.ptr.is_null() {
            return;
        }
        for i in 0..self.count {
            // SAFETY: i < count; unaligned read tolerates any base alignment.
            let s = unsafe { self.ptr.add(i).read_unaligned() };
            // SAFETY: each element is owned by this guard.
            unsafe { self.alloc.free(s.cast()) };
        }
        // SAFETY: the array itself is owned by this guard.
        unsafe { self.alloc.free(self.ptr.cast()) };
    }
}

/// A server-allocated array of VARIANTs, each of which may own payload.
pub struct ForeignVariants<'a> {
    alloc: &'a dyn ForeignAllocator,
    ptr: *mut RawVariant,
    count: usize,
}

impl<'a> ForeignVariants<'a> {
    /// # Safety
    ///
    /// `ptr` must be null or a live array of `count` initialized VARIANTs
    /// whose payloads were allocated by `alloc`.
    pub unsafe fn new(alloc: &'a dyn ForeignAllocator, ptr: *mut RawVariant, count: usize) -> Self {
        Self { alloc, ptr, count }
    }

    pub(crate) fn as_slice(&self, field: &'static str) -> Result<&[RawVariant], DecodeError> {
        // SAFETY: construction contract.
        unsafe { foreign_slice(self.ptr, self.count, field) }
    }

    pub fn read(&self, field: &'static str) -> Result<Vec<Variant>, DecodeError> {
        // SAFETY: construction contract.
        let items = unsafe { foreign_slice(self.ptr, self.count, field) }?;
        decode_variants(items)
    }
}

impl Drop for ForeignVariants<'_> {
    fn drop(&mut self) {
        if self.ptr.is_null() {
            return;
        }
        for i in 0..self.count {
            // SAFETY: i < count; each VARIANT is owned by this guard.
            unsafe { self.alloc.clear_variant(self.ptr.add(i)) };
        }
        // SAFETY: the array itself is owned by this guard.
        unsafe { self.alloc.free(self.ptr.cast()) };
    }
}

/// Decode a borrowed run of VARIANTs, tagging failures with their index.
pub(crate) fn decode_variants(items: &[RawVariant]) -> Result<Vec<Variant>, DecodeError> {
    items
        .iter()
        .enumerate()
        .map(|(index, raw)| {
            // SAFETY: `items` came from a checked slice whose payload
            // pointers are valid while the owning guard lives.
            unsafe { decode_variant(raw) }.map_err(|source| DecodeError::Attribute {
                index,
                source: Box::new(source),
            })
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::fake::CountingAllocator;

    #[test]
    fn zero_count_ignores_pointer() {
        // SAFETY: count is zero, nothing is read.
        let s: &[u32] = unsafe { foreign_slice(std::ptr::null(), 0, "x") }.unwrap();
        assert!(s.is_empty());
    }

    #[test]
    fn null_with_count_is_an_error() {
        // SAFETY: null is checked before any read.
        let err = unsafe { foreign_slice::<u32>(std::ptr::null(), 3, "pdwIDs") }.unwrap_err();
        assert_eq!(
            err,
            DecodeError::NullArray {
                field: "pdwIDs",
                count: 3
            }
        );
    }

    #[test]
    fn strings_are_freed_individually_then_the_array() {
        let alloc = CountingAllocator::new();
        let ptr = alloc.alloc_wstr_array(&["HI", "HIHI", "LO"]);
        assert_eq!(alloc.outstanding(), 4);
        {
            // SAFETY: freshly allocated by `alloc`.
            let guard = unsafe { ForeignStrings::new(&alloc, ptr, 3) };
            assert_eq!(guard.read("names").unwrap(), vec!["HI", "HIHI", "LO"]);
        }
        assert_eq!(alloc.outstanding(), 0);
        assert_eq!(alloc.invalid_frees(), 0);
    }

    #[test]
    fn variants_are_cleared_even_when_decoding_fails() {
        let alloc = CountingAllocator::new();
        let mut items = vec![
            alloc.alloc_variant(&Variant::String("pump 4".into())),
            RawVariant::empty(),
        ];
        items[1].vt = 0x0024;
        let ptr = alloc.alloc_array(&items);
        {
            // SAFETY: freshly allocated by `alloc`.
            let guard = unsafe { ForeignVariants::new(&alloc, ptr, 2) };
            let err = guard.read("attrs").unwrap_err();
            assert!(matches!(err, DecodeError::Attribute { index: 1, .. }));
        }
        assert_eq!(alloc.outstanding(), 0);
        assert_eq!(alloc.invalid_frees(), 0);
    }

    #[test]
    fn block_frees_once() {
        let alloc = CountingAllocator::new();
        let ptr = alloc.alloc_array(&[1u32, 2, 3]);
        {
            // SAFETY: freshly allocated by `alloc`.
            let block = unsafe { ForeignBlock::array(&alloc, ptr, 3) };
            assert_eq!(block.to_vec("ids").unwrap(), vec![1, 2, 3]);
        }
        assert_eq!(alloc.outstanding(), 0);
        assert_eq!(alloc.frees(), 1);
    }
}
