// ── Interface pointers ──
//
// A COM object is a pointer to a pointer to a table of `extern "system"`
// function pointers whose first three slots are IUnknown. `ComPtr` holds one
// counted reference and gives it back on drop.

use std::ffi::c_void;
use std::fmt;
use std::marker::PhantomData;
use std::ptr::NonNull;

use crate::error::{Error, check};
use crate::guid::{Guid, IID_IUNKNOWN};
use crate::hresult::Hresult;

#[repr(C)]
pub struct IUnknownVtbl {
    pub query_interface:
        unsafe extern "system" fn(this: *mut c_void, riid: *const Guid, ppv: *mut *mut c_void) -> Hresult,
    pub add_ref: unsafe extern "system" fn(this: *mut c_void) -> u32,
    pub release: unsafe extern "system" fn(this: *mut c_void) -> u32,
}

/// A COM interface: its identifier and the layout of its vtable.
///
/// # Safety
///
/// `Vtable` must be `#[repr(C)]` and begin with an [`IUnknownVtbl`], and
/// `IID` must be the identifier of an interface with exactly that layout.
pub unsafe trait Interface {
    const IID: Guid;
    type Vtable;
}

/// Marker for the base interface.
pub enum IUnknown {}

// SAFETY: IUnknownVtbl is the base layout itself.
unsafe impl Interface for IUnknown {
    const IID: Guid = IID_IUNKNOWN;
    type Vtable = IUnknownVtbl;
}

/// One counted reference to a COM object through interface `I`.
pub struct ComPtr<I: Interface> {
    ptr: NonNull<*const I::Vtable>,
    _marker: PhantomData<I>,
}

// SAFETY: the objects we hold live in the multithreaded apartment (or are the
// in-process fake), whose interface pointers may be used from any thread.
unsafe impl<I: Interface> Send for ComPtr<I> {}
// SAFETY: as above; every method takes `&self` and the object synchronizes.
unsafe impl<I: Interface> Sync for ComPtr<I> {}

impl<I: Interface> ComPtr<I> {
    /// Adopt a reference the caller already owns. Null yields `None`.
    ///
    /// # Safety
    ///
    /// `raw` must be null or a live interface pointer of type `I` carrying one
    /// reference that is transferred to the returned value.
    pub unsafe fn from_raw(raw: *mut c_void) -> Option<Self> {
        NonNull::new(raw.cast()).map(|ptr| Self {
            ptr,
            _marker: PhantomData,
        })
    }

    pub fn as_raw(&self) -> *mut c_void {
        self.ptr.as_ptr().cast()
    }

    /// Give up the reference without releasing it.
    pub fn into_raw(self) -> *mut c_void {
        let raw = self.as_raw();
        std::mem::forget(self);
        raw
    }

    /// The interface's vtable.
    pub fn vtable(&self) -> &I::Vtable {
        // SAFETY: a live COM object's first field points at its vtable, which
        // lives at least as long as the object.
        unsafe { &**self.ptr.as_ptr() }
    }

    fn unknown(&self) -> &IUnknownVtbl {
        // SAFETY: `Interface` guarantees the vtable starts with IUnknownVtbl.
        unsafe { &*std::ptr::from_ref(self.vtable()).cast::<IUnknownVtbl>() }
    }

    /// Ask the same object for another interface.
    pub fn query_interface<U: Interface>(&self) -> Result<ComPtr<U>, Error> {
        let mut out: *mut c_void = std::ptr::null_mut();
        // SAFETY: `self` is live; `out` is a valid out-pointer.
        let hr = unsafe { (self.unknown().query_interface)(self.as_raw(), &U::IID, &raw mut out) };
        if hr == Hresult::E_NOINTERFACE {
            return Err(Error::NoInterface { iid: U::IID });
        }
        check("QueryInterface", hr)?;
        // SAFETY: on success `out` holds one reference of interface `U`.
        unsafe { ComPtr::from_raw(out) }.ok_or(Error::NoInterface { iid: U::IID })
    }

    /// Reinterpret as the base interface, taking a new reference.
    pub fn to_unknown(&self) -> ComPtr<IUnknown> {
        // SAFETY: every interface is-an IUnknown; AddRef pairs with the Drop.
        unsafe {
            (self.unknown().add_ref)(self.as_raw());
            ComPtr {
                ptr: self.ptr.cast(),
                _marker: PhantomData,
            }
        }
    }
}

impl<I: Interface> Clone for ComPtr<I> {
    fn clone(&self) -> Self {
        // SAFETY: `self` is live; the new reference is owned by the clone.
        unsafe { (self.unknown().add_ref)(self.as_raw()) };
        Self {
            ptr: self.ptr,
            _marker: PhantomData,
        }
    }
}

impl<I: Interface> Drop for ComPtr<I> {
    fn drop(&mut self) {
        // SAFETY: we own exactly one reference.
        unsafe { (self.unknown().release)(self.as_raw()) };
    }
}

impl<I: Interface> fmt::Debug for ComPtr<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ComPtr")
            .field(&I::IID)
            .field(&self.ptr)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::fake::FakeEventServer;
    use crate::guid::IID_IOPC_EVENT_SINK;
    use crate::event_server::IOPCEventServer;
    use crate::sink::IOPCEventSink;

    #[test]
    fn clone_and_drop_balance_references() {
        let server = FakeEventServer::new();
        let ptr = server.server_ptr();
        let base = server.ref_count();
        {
            let a = ptr.clone();
            let _b = a.to_unknown();
            assert_eq!(server.ref_count(), base + 2);
        }
        assert_eq!(server.ref_count(), base);
    }

    #[test]
    fn unsupported_interface_is_typed() {
        let server = FakeEventServer::new();
        let ptr: ComPtr<IOPCEventServer> = server.server_ptr();
        let err = ptr.query_interface::<IOPCEventSink>().unwrap_err();
        assert!(matches!(err, Error::NoInterface { iid } if iid == IID_IOPC_EVENT_SINK));
    }
}
