// ── Allocation-counting task allocator ──

use std::alloc::{Layout, alloc_zeroed, dealloc, handle_alloc_error};
use std::collections::HashMap;
use std::ffi::c_void;
use std::mem::size_of;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use tracing::warn;

use crate::memory::ForeignAllocator;
use crate::time::utc_to_ole_date;
use crate::variant::{RawVariant, SafeArray, SafeArrayBound, VarType, Variant, VariantData};

/// Stands in for the COM task allocator. Every block handed out is tracked
/// until freed, so tests can assert that nothing leaked and nothing was freed
/// twice.
#[derive(Debug, Default)]
pub struct CountingAllocator {
    live: Mutex<HashMap<usize, Layout>>,
    allocations: AtomicUsize,
    frees: AtomicUsize,
    invalid_frees: AtomicUsize,
}

impl CountingAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks handed out and not yet freed.
    pub fn outstanding(&self) -> usize {
        self.live.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn allocations(&self) -> usize {
        self.allocations.load(Ordering::SeqCst)
    }

    pub fn frees(&self) -> usize {
        self.frees.load(Ordering::SeqCst)
    }

    /// Frees of pointers this allocator never handed out (or already took back).
    pub fn invalid_frees(&self) -> usize {
        self.invalid_frees.load(Ordering::SeqCst)
    }

    fn raw_alloc(&self, layout: Layout) -> *mut u8 {
        let layout = if layout.size() == 0 {
            Layout::from_size_align(1, layout.align()).unwrap_or(layout)
        } else {
            layout
        };
        // SAFETY: the layout has a non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            handle_alloc_error(layout);
        }
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(ptr as usize, layout);
        self.allocations.fetch_add(1, Ordering::SeqCst);
        ptr
    }

    pub fn alloc_value<T>(&self, value: T) -> *mut T {
        let ptr = self.raw_alloc(Layout::new::<T>()).cast::<T>();
        // SAFETY: freshly allocated for one `T`.
        unsafe { ptr.write(value) };
        ptr
    }

    /// Copy `items` into a new block; an empty slice yields null.
    pub fn alloc_array<T: Copy>(&self, items: &[T]) -> *mut T {
        if items.is_empty() {
            return std::ptr::null_mut();
        }
        let Ok(layout) = Layout::array::<T>(items.len()) else {
            return std::ptr::null_mut();
        };
        let ptr = self.raw_alloc(layout).cast::<T>();
        // SAFETY: the block holds `items.len()` elements and does not overlap.
        unsafe { std::ptr::copy_nonoverlapping(items.as_ptr(), ptr, items.len()) };
        ptr
    }

    pub fn alloc_wstr(&self, s: &str) -> *mut u16 {
        let mut units: Vec<u16> = s.encode_utf16().collect();
        units.push(0);
        self.alloc_array(&units)
    }

    /// An array of separately allocated strings; empty yields null.
    pub fn alloc_wstr_array<S: AsRef<str>>(&self, items: &[S]) -> *mut *mut u16 {
        let ptrs: Vec<*mut u16> = items.iter().map(|s| self.alloc_wstr(s.as_ref())).collect();
        self.alloc_array(&ptrs)
    }

    /// Encode a value the way a server fills an out-VARIANT.
    pub fn alloc_variant(&self, value: &Variant) -> RawVariant {
        let (vt, data) = match value {
            Variant::Empty => (VarType::EMPTY, VariantData { pad: [0; 2] }),
            Variant::Null => (VarType::NULL, VariantData { pad: [0; 2] }),
            Variant::Bool(b) => (VarType::BOOL, VariantData { bool_val: if *b { -1 } else { 0 } }),
            Variant::I8(v) => (VarType::I1, VariantData { i8_val: *v }),
            Variant::I16(v) => (VarType::I2, VariantData { i16_val: *v }),
            Variant::I32(v) => (VarType::I4, VariantData { i32_val: *v }),
            Variant::I64(v) => (VarType::I8, VariantData { i64_val: *v }),
            Variant::U8(v) => (VarType::UI1, VariantData { u8_val: *v }),
            Variant::U16(v) => (VarType::UI2, VariantData { u16_val: *v }),
            Variant::U32(v) => (VarType::UI4, VariantData { u32_val: *v }),
            Variant::U64(v) => (VarType::UI8, VariantData { u64_val: *v }),
            Variant::F32(v) => (VarType::R4, VariantData { f32_val: *v }),
            Variant::F64(v) => (VarType::R8, VariantData { f64_val: *v }),
            Variant::String(s) => (VarType::BSTR, VariantData { bstr: self.alloc_wstr(s) }),
            Variant::Date(t) => (VarType::DATE, VariantData { date: utc_to_ole_date(*t) }),
            Variant::Error(hr) => (VarType::ERROR, VariantData { scode: hr.0 }),
            Variant::Bytes(bytes) => (
                VarType::UI1.array_of(),
                VariantData {
                    parray: self.alloc_safe_array(bytes, 1),
                },
            ),
            Variant::Array(items) => {
                let elements: Vec<RawVariant> = items.iter().map(|v| self.alloc_variant(v)).collect();
                (
                    VarType::VARIANT.array_of(),
                    VariantData {
                        parray: self.alloc_safe_array(&elements, size_of::<RawVariant>()),
                    },
                )
            }
        };
        RawVariant {
            vt: vt.0,
            data,
            ..RawVariant::empty()
        }
    }

    pub fn alloc_variant_array(&self, items: &[Variant]) -> *mut RawVariant {
        let raw: Vec<RawVariant> = items.iter().map(|v| self.alloc_variant(v)).collect();
        self.alloc_array(&raw)
    }

    fn alloc_safe_array<T: Copy>(&self, items: &[T], element_size: usize) -> *mut SafeArray {
        self.alloc_value(SafeArray {
            dims: 1,
            features: 0,
            element_size: u32::try_from(element_size).unwrap_or(u32::MAX),
            locks: 0,
            data: self.alloc_array(items).cast(),
            bounds: [SafeArrayBound {
                elements: u32::try_from(items.len()).unwrap_or(u32::MAX),
                lower_bound: 0,
            }],
        })
    }
}

impl ForeignAllocator for CountingAllocator {
    unsafe fn free(&self, ptr: *mut c_void) {
        if ptr.is_null() {
            return;
        }
        let layout = self
            .live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(ptr as usize));
        match layout {
            Some(layout) => {
                // SAFETY: `ptr` was allocated here with exactly this layout
                // and has just been removed from the live set.
                unsafe { dealloc(ptr.cast(), layout) };
                self.frees.fetch_add(1, Ordering::SeqCst);
            }
            None => {
                warn!(?ptr, "free of unknown or already freed block");
                self.invalid_frees.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    unsafe fn clear_variant(&self, variant: *mut RawVariant) {
        // SAFETY: caller contract: an initialized VARIANT.
        let raw = unsafe { variant.read_unaligned() };
        let vt = raw.var_type();
        if vt == VarType::BSTR {
            // SAFETY: the tag says `bstr` is live and ours.
            unsafe { self.free(raw.data.bstr.cast()) };
        } else if vt.is_array() && !vt.is_byref() {
            // SAFETY: the tag says `parray` is live and ours.
            unsafe { self.free_safe_array(vt.base(), raw.data.parray) };
        }
        // SAFETY: caller contract: writable.
        unsafe { variant.write_unaligned(RawVariant::empty()) };
    }
}

impl CountingAllocator {
    unsafe fn free_safe_array(&self, element: VarType, parray: *mut SafeArray) {
        if parray.is_null() {
            return;
        }
        // SAFETY: allocated by `alloc_safe_array`.
        let descriptor = unsafe { parray.read() };
        let count = usize::try_from(descriptor.bounds[0].elements).unwrap_or(0);
        if !descriptor.data.is_null() {
            for i in 0..count {
                if element == VarType::BSTR {
                    // SAFETY: i < count, the body holds string pointers.
                    let s = unsafe { descriptor.data.cast::<*mut u16>().add(i).read() };
                    // SAFETY: each string is a block of ours.
                    unsafe { self.free(s.cast()) };
                } else if element == VarType::VARIANT {
                    // SAFETY: i < count, the body holds VARIANTs.
                    unsafe { self.clear_variant(descriptor.data.cast::<RawVariant>().add(i)) };
                }
            }
        }
        // SAFETY: body and descriptor are blocks of ours.
        unsafe {
            self.free(descriptor.data);
            self.free(parray.cast());
        }
    }
}

impl Drop for CountingAllocator {
    fn drop(&mut self) {
        let live = self.live.get_mut().unwrap_or_else(PoisonError::into_inner);
        for (addr, layout) in live.drain() {
            // SAFETY: still-live blocks of ours; nothing can use them once the
            // allocator is gone.
            unsafe { dealloc(addr as *mut u8, layout) };
        }
    }
}
