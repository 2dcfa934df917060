// ── Connection points ──

use std::ffi::c_void;

use tracing::debug;

use crate::com::{ComPtr, IUnknownVtbl, Interface};
use crate::error::{Error, check};
use crate::guid::{Guid, IID_ICONNECTION_POINT, IID_ICONNECTION_POINT_CONTAINER};
use crate::hresult::Hresult;
use crate::sink::SinkRef;

type Unused = unsafe extern "system" fn(this: *mut c_void) -> Hresult;

#[repr(C)]
pub struct IConnectionPointContainerVtbl {
    pub base: IUnknownVtbl,
    pub enum_connection_points: Unused,
    pub find_connection_point: unsafe extern "system" fn(
        this: *mut c_void,
        riid: *const Guid,
        ppcp: *mut *mut c_void,
    ) -> Hresult,
}

#[repr(C)]
pub struct IConnectionPointVtbl {
    pub base: IUnknownVtbl,
    pub get_connection_interface: Unused,
    pub get_connection_point_container: Unused,
    pub advise: unsafe extern "system" fn(
        this: *mut c_void,
        sink: *mut c_void,
        cookie: *mut u32,
    ) -> Hresult,
    pub unadvise: unsafe extern "system" fn(this: *mut c_void, cookie: u32) -> Hresult,
    pub enum_connections: Unused,
}

pub enum IConnectionPointContainer {}
pub enum IConnectionPoint {}

// SAFETY: vtable starts with IUnknownVtbl and matches the published layout.
unsafe impl Interface for IConnectionPointContainer {
    const IID: Guid = IID_ICONNECTION_POINT_CONTAINER;
    type Vtable = IConnectionPointContainerVtbl;
}

// SAFETY: vtable starts with IUnknownVtbl and matches the published layout.
unsafe impl Interface for IConnectionPoint {
    const IID: Guid = IID_ICONNECTION_POINT;
    type Vtable = IConnectionPointVtbl;
}

impl ComPtr<IConnectionPointContainer> {
    pub fn find_connection_point(&self, iid: &Guid) -> Result<ComPtr<IConnectionPoint>, Error> {
        let mut out: *mut c_void = std::ptr::null_mut();
        // SAFETY: live object; `iid` and `out` are valid for the call.
        let hr = unsafe { (self.vtable().find_connection_point)(self.as_raw(), iid, &raw mut out) };
        check("FindConnectionPoint", hr)?;
        // SAFETY: on success `out` carries one connection point reference.
        unsafe { ComPtr::from_raw(out) }.ok_or(Error::Protocol {
            operation: "FindConnectionPoint",
            hresult: Hresult::E_POINTER,
        })
    }
}

impl ComPtr<IConnectionPoint> {
    /// Register `sink`; the server takes its own reference to it.
    pub fn advise(&self, sink: &SinkRef) -> Result<u32, Error> {
        let mut cookie = 0u32;
        // SAFETY: live object; the sink pointer is live for the call and the
        // server AddRefs it if it keeps it.
        let hr = unsafe { (self.vtable().advise)(self.as_raw(), sink.as_raw(), &raw mut cookie) };
        check("Advise", hr)?;
        debug!(cookie, "sink advised");
        Ok(cookie)
    }

    /// Detach the sink registered under `cookie`. After this returns the
    /// server has dropped its reference and will not call the sink again.
    pub fn unadvise(&self, cookie: u32) -> Result<(), Error> {
        // SAFETY: live object.
        let hr = unsafe { (self.vtable().unadvise)(self.as_raw(), cookie) };
        check("Unadvise", hr)?;
        debug!(cookie, "sink unadvised");
        Ok(())
    }
}
