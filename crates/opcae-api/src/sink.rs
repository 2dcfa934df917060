// ── IOPCEventSink: the object the server calls back into ──
//
// The server owns the calling thread. `OnEvent` decodes the record array while
// the server still owns it (the records are `[in]`, so nothing is freed here),
// hands the owned batch to a `BatchHandler`, and always answers S_OK. Panics
// are caught at the boundary; unwinding into the caller's frames is undefined.

use std::ffi::c_void;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering, fence};

use tracing::{error, trace};

use crate::com::{ComPtr, IUnknownVtbl, Interface};
use crate::error::{DecodeError, Error, check};
use crate::event::{EventBatch, RawOnEventStruct};
use crate::guid::{Guid, IID_IOPC_EVENT_SINK, IID_IUNKNOWN};
use crate::hresult::Hresult;

#[repr(C)]
pub struct IOPCEventSinkVtbl {
    pub base: IUnknownVtbl,
    pub on_event: unsafe extern "system" fn(
        this: *mut c_void,
        client_subscription: u32,
        refresh: i32,
        last_refresh: i32,
        count: u32,
        events: *const RawOnEventStruct,
    ) -> Hresult,
}

pub enum IOPCEventSink {}

// SAFETY: vtable starts with IUnknownVtbl and matches the published layout.
unsafe impl Interface for IOPCEventSink {
    const IID: Guid = IID_IOPC_EVENT_SINK;
    type Vtable = IOPCEventSinkVtbl;
}

/// Receives decoded notifications on the server's thread. Must not block
/// without bound.
pub trait BatchHandler: Send + Sync {
    fn deliver(&self, batch: EventBatch);

    /// A callback's records could not be decoded; the batch is lost.
    fn decode_failed(&self, client_handle: u32, error: DecodeError);
}

/// Heap object whose first field is the vtable pointer, so a `*mut EventSink`
/// is a valid interface pointer.
#[repr(C)]
pub struct EventSink {
    vtbl: *const IOPCEventSinkVtbl,
    refs: AtomicU32,
    handler: Arc<dyn BatchHandler>,
}

static SINK_VTBL: IOPCEventSinkVtbl = IOPCEventSinkVtbl {
    base: IUnknownVtbl {
        query_interface: sink_query_interface,
        add_ref: sink_add_ref,
        release: sink_release,
    },
    on_event: sink_on_event,
};

impl EventSink {
    /// Allocate a sink with one reference, owned by the returned handle.
    pub fn create(handler: Arc<dyn BatchHandler>) -> SinkRef {
        let sink = Box::new(Self {
            vtbl: &raw const SINK_VTBL,
            refs: AtomicU32::new(1),
            handler,
        });
        SinkRef {
            ptr: NonNull::from(Box::leak(sink)),
        }
    }
}

/// The client's counted reference to an [`EventSink`]. The server holds its
/// own references through the vtable; the object is freed by whichever
/// `Release` comes last.
pub struct SinkRef {
    ptr: NonNull<EventSink>,
}

// SAFETY: the sink's only mutable state is the atomic count; the handler is
// `Send + Sync`.
unsafe impl Send for SinkRef {}
// SAFETY: as above.
unsafe impl Sync for SinkRef {}

impl SinkRef {
    pub fn as_raw(&self) -> *mut c_void {
        self.ptr.as_ptr().cast()
    }

    /// Current reference count (server and client references together).
    pub fn ref_count(&self) -> u32 {
        // SAFETY: we hold a reference, so the object is live.
        unsafe { self.ptr.as_ref() }.refs.load(Ordering::Acquire)
    }
}

impl Clone for SinkRef {
    fn clone(&self) -> Self {
        // SAFETY: live object; the new reference belongs to the clone.
        unsafe { sink_add_ref(self.as_raw()) };
        Self { ptr: self.ptr }
    }
}

impl Drop for SinkRef {
    fn drop(&mut self) {
        // SAFETY: we own exactly one reference.
        unsafe { sink_release(self.as_raw()) };
    }
}

impl std::fmt::Debug for SinkRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkRef")
            .field("ptr", &self.ptr)
            .field("refs", &self.ref_count())
            .finish()
    }
}

// ── Vtable entries ──────────────────────────────────────────────────

unsafe extern "system" fn sink_query_interface(
    this: *mut c_void,
    riid: *const Guid,
    ppv: *mut *mut c_void,
) -> Hresult {
    if ppv.is_null() {
        return Hresult::E_POINTER;
    }
    if riid.is_null() {
        // SAFETY: `ppv` is non-null and writable per the calling contract.
        unsafe { ppv.write(std::ptr::null_mut()) };
        return Hresult::E_INVALIDARG;
    }
    // SAFETY: non-null IID supplied by the caller.
    let iid = unsafe { riid.read_unaligned() };
    if iid == IID_IUNKNOWN || iid == IID_IOPC_EVENT_SINK {
        // SAFETY: `this` is a live sink; the new reference goes to the caller.
        unsafe {
            sink_add_ref(this);
            ppv.write(this);
        }
        Hresult::S_OK
    } else {
        // SAFETY: `ppv` is non-null and writable.
        unsafe { ppv.write(std::ptr::null_mut()) };
        Hresult::E_NOINTERFACE
    }
}

unsafe extern "system" fn sink_add_ref(this: *mut c_void) -> u32 {
    // SAFETY: `this` is a live sink per the calling contract.
    let sink = unsafe { &*this.cast::<EventSink>() };
    sink.refs.fetch_add(1, Ordering::Relaxed) + 1
}

unsafe extern "system" fn sink_release(this: *mut c_void) -> u32 {
    let sink = this.cast::<EventSink>();
    // SAFETY: `this` is a live sink; the caller gives up one reference.
    let previous = unsafe { &*sink }.refs.fetch_sub(1, Ordering::Release);
    if previous == 1 {
        fence(Ordering::Acquire);
        trace!("last sink reference released");
        // SAFETY: count reached zero, nobody else can reach the object; it
        // was allocated by `Box` in `EventSink::create`.
        drop(unsafe { Box::from_raw(sink) });
    }
    previous - 1
}

unsafe extern "system" fn sink_on_event(
    this: *mut c_void,
    client_subscription: u32,
    refresh: i32,
    last_refresh: i32,
    count: u32,
    events: *const RawOnEventStruct,
) -> Hresult {
    // SAFETY: the server holds a reference to `this` for the duration of the
    // call.
    let sink = unsafe { &*this.cast::<EventSink>() };
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        // SAFETY: `events` holds `count` records, valid until we return.
        let decoded = unsafe {
            EventBatch::decode(client_subscription, refresh != 0, last_refresh != 0, count, events)
        };
        match decoded {
            Ok(batch) => {
                trace!(
                    handle = client_subscription,
                    count,
                    refresh = batch.is_refresh(),
                    last_refresh = batch.is_last_refresh(),
                    "batch delivered"
                );
                sink.handler.deliver(batch);
            }
            Err(err) => {
                error!(handle = client_subscription, count, error = %err, "undecodable notification batch");
                sink.handler.decode_failed(client_subscription, err);
            }
        }
    }));
    if outcome.is_err() {
        error!(handle = client_subscription, "panic in notification handler");
    }
    Hresult::S_OK
}

impl ComPtr<IOPCEventSink> {
    /// Invoke the notification entry point, as a server would.
    pub fn on_event(
        &self,
        client_handle: u32,
        refresh: bool,
        last_refresh: bool,
        events: &[RawOnEventStruct],
    ) -> Result<(), Error> {
        let count = u32::try_from(events.len()).map_err(|_| Error::InvalidArgument {
            message: format!("{} records exceed a DWORD count", events.len()),
        })?;
        let ptr = if events.is_empty() {
            std::ptr::null()
        } else {
            events.as_ptr()
        };
        // SAFETY: live object; `events` outlives the call.
        let hr = unsafe {
            (self.vtable().on_event)(
                self.as_raw(),
                client_handle,
                i32::from(refresh),
                i32::from(last_refresh),
                count,
                ptr,
            )
        };
        check("OnEvent", hr)?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Mutex;

    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::fake::{CountingAllocator, FakeEvent};
    use crate::guid::IID_IOPC_EVENT_SERVER;

    #[derive(Default)]
    struct Recorder {
        batches: Mutex<Vec<EventBatch>>,
        failures: Mutex<Vec<(u32, DecodeError)>>,
        panic_on_deliver: bool,
    }

    impl BatchHandler for Recorder {
        fn deliver(&self, batch: EventBatch) {
            assert!(!self.panic_on_deliver, "handler blew up");
            self.batches.lock().unwrap().push(batch);
        }

        fn decode_failed(&self, client_handle: u32, error: DecodeError) {
            self.failures.lock().unwrap().push((client_handle, error));
        }
    }

    fn sink_ptr(sink: &SinkRef) -> ComPtr<IOPCEventSink> {
        // SAFETY: AddRef pairs with the ComPtr's Release.
        unsafe {
            sink_add_ref(sink.as_raw());
            ComPtr::from_raw(sink.as_raw()).unwrap()
        }
    }

    #[test]
    fn query_interface_answers_only_its_identities() {
        let sink = EventSink::create(Arc::new(Recorder::default()));
        let ptr = sink_ptr(&sink);
        assert!(ptr.query_interface::<crate::com::IUnknown>().is_ok());
        assert!(ptr.query_interface::<IOPCEventSink>().is_ok());

        let mut out: *mut c_void = std::ptr::dangling_mut();
        // SAFETY: live sink, valid out-pointer.
        let hr = unsafe { sink_query_interface(sink.as_raw(), &IID_IOPC_EVENT_SERVER, &raw mut out) };
        assert_eq!(hr, Hresult::E_NOINTERFACE);
        assert!(out.is_null());

        // SAFETY: null out-pointer is rejected before any write.
        let hr = unsafe { sink_query_interface(sink.as_raw(), &IID_IUNKNOWN, std::ptr::null_mut()) };
        assert_eq!(hr, Hresult::E_POINTER);
    }

    #[test]
    fn last_release_frees_the_handler() {
        let recorder = Arc::new(Recorder::default());
        let sink = EventSink::create(recorder.clone());
        let server_side = sink_ptr(&sink);
        assert_eq!(sink.ref_count(), 2);
        assert_eq!(Arc::strong_count(&recorder), 2);

        drop(sink);
        assert_eq!(Arc::strong_count(&recorder), 2, "server still holds the sink");
        drop(server_side);
        assert_eq!(Arc::strong_count(&recorder), 1);
    }

    #[test]
    fn on_event_delivers_decoded_batch() {
        let alloc = CountingAllocator::new();
        let recorder = Arc::new(Recorder::default());
        let sink = EventSink::create(recorder.clone());
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let raws = [
            FakeEvent::simple("a", t).encode(&alloc).unwrap(),
            FakeEvent::simple("b", t).encode(&alloc).unwrap(),
        ];

        sink_ptr(&sink).on_event(42, true, true, &raws).unwrap();

        let batches = recorder.batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].client_handle(), 42);
        assert!(batches[0].is_last_refresh());
        assert_eq!(batches[0].len(), 2);
        drop(batches);

        for raw in raws {
            FakeEvent::release(&alloc, raw);
        }
        assert_eq!(alloc.outstanding(), 0);
    }

    #[test]
    fn decode_failure_is_reported_and_still_succeeds() {
        let alloc = CountingAllocator::new();
        let recorder = Arc::new(Recorder::default());
        let sink = EventSink::create(recorder.clone());
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let raw = FakeEvent::simple("a", t).corrupt_attribute().encode(&alloc).unwrap();

        sink_ptr(&sink).on_event(9, false, false, &[raw]).unwrap();

        assert!(recorder.batches.lock().unwrap().is_empty());
        let failures = recorder.failures.lock().unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, 9);
        drop(failures);
        FakeEvent::release(&alloc, raw);
    }

    #[test]
    fn handler_panic_does_not_cross_the_boundary() {
        let recorder = Arc::new(Recorder {
            panic_on_deliver: true,
            ..Recorder::default()
        });
        let sink = EventSink::create(recorder);
        assert!(sink_ptr(&sink).on_event(1, false, false, &[]).is_ok());
    }
}
