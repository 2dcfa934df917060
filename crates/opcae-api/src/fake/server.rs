// ── In-process event server ──
//
// A real object graph behind the published vtables: the event server, the
// subscription objects it creates (IOPCEventSubscriptionMgt and
// IConnectionPointContainer on one identity) and their connection points.
// Callbacks reach the client's sink through its vtable, from the emitting
// thread or from a refresh worker, exactly as a server would make them.

use std::collections::{BTreeMap, HashMap};
use std::ffi::c_void;
use std::fmt;
use std::mem::offset_of;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering, fence};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};

use crate::com::{ComPtr, IUnknownVtbl};
use crate::condition::RawConditionState;
use crate::connection_point::{IConnectionPointContainerVtbl, IConnectionPointVtbl};
use crate::event_server::{IOPCEventServer, IOPCEventServerVtbl};
use crate::guid::{
    Guid, IID_ICONNECTION_POINT, IID_ICONNECTION_POINT_CONTAINER, IID_IOPC_EVENT_SERVER,
    IID_IOPC_EVENT_SINK, IID_IOPC_EVENT_SUBSCRIPTION_MGT, IID_IUNKNOWN,
};
use crate::hresult::Hresult;
use crate::memory::foreign_slice;
use crate::sink::IOPCEventSink;
use crate::subscription_mgt::IOPCEventSubscriptionMgtVtbl;
use crate::time::FileTime;
use crate::types::{
    ConditionFlags, EventType, EventTypeMask, FilterMask, MAX_SEVERITY, MIN_SEVERITY, SubscriptionFilter,
    SubscriptionState,
};
use crate::variant::VarType;
use crate::wide::read_wide;

use super::alloc::CountingAllocator;
use super::records::{FakeCondition, FakeEvent};

/// Shortest non-zero buffer time the fake grants, in milliseconds.
pub const MIN_BUFFER_TIME_MS: u32 = 100;
/// Largest batch the fake sends in one callback.
pub const MAX_BATCH_SIZE: u32 = 10_000;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn dword(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}

fn dword_len(count: u32) -> usize {
    usize::try_from(count).unwrap_or(usize::MAX)
}

// ── Public handle ───────────────────────────────────────────────────

/// The test-side view of a fake server: set up its address space, push
/// events, inject failures and look at what the client did.
pub struct FakeEventServer {
    shared: Arc<ServerShared>,
    object: ComPtr<IOPCEventServer>,
}

impl FakeEventServer {
    pub fn new() -> Self {
        let shared = Arc::new(ServerShared::default());
        let raw = new_object(ServerObject {
            vtbl: &raw const SERVER_VTBL,
            refs: AtomicU32::new(1),
            shared: Arc::clone(&shared),
        });
        // SAFETY: a fresh object carrying the one reference we adopt.
        let Some(object) = (unsafe { ComPtr::from_raw(raw) }) else {
            unreachable!("boxed objects are never null");
        };
        Self { shared, object }
    }

    /// A new counted reference to the server object.
    pub fn server_ptr(&self) -> ComPtr<IOPCEventServer> {
        self.object.clone()
    }

    /// References currently held on the server object, ours included.
    pub fn ref_count(&self) -> u32 {
        // SAFETY: `self.object` keeps the server object alive.
        unsafe { object::<ServerObject>(self.object.as_raw()) }
            .refs
            .load(Ordering::Acquire)
    }

    pub fn allocator(&self) -> &CountingAllocator {
        &self.shared.alloc
    }

    pub fn allocator_handle(&self) -> Arc<CountingAllocator> {
        Arc::clone(&self.shared.alloc)
    }

    // ── Address space ──

    pub fn add_category(&self, event_type: EventType, id: u32, description: &str) {
        lock(&self.shared.catalog)
            .categories
            .push((event_type, id, description.to_owned()));
    }

    pub fn add_attribute(&self, category: u32, id: u32, description: &str, var_type: VarType) {
        lock(&self.shared.catalog)
            .attributes
            .push((category, id, description.to_owned(), var_type));
    }

    /// Add a condition, replacing any with the same source and name.
    pub fn add_condition(&self, condition: FakeCondition) {
        let mut catalog = lock(&self.shared.catalog);
        catalog
            .conditions
            .retain(|c| !(c.source == condition.source && c.condition == condition.condition));
        catalog.conditions.push(condition);
    }

    pub fn condition(&self, source: &str, condition: &str) -> Option<FakeCondition> {
        lock(&self.shared.catalog)
            .conditions
            .iter()
            .find(|c| c.source == source && c.condition == condition)
            .cloned()
    }

    pub fn set_available_filters(&self, mask: FilterMask) {
        lock(&self.shared.catalog).available_filters = mask;
    }

    pub fn disabled_areas(&self) -> Vec<String> {
        lock(&self.shared.catalog).disabled_areas.clone()
    }

    pub fn disabled_sources(&self) -> Vec<String> {
        lock(&self.shared.catalog).disabled_sources.clone()
    }

    // ── Failure injection ──

    /// Make the next call to `operation` (its interface method name, e.g.
    /// `"Advise"`) fail with `hr`.
    pub fn fail_next(&self, operation: &'static str, hr: Hresult) {
        lock(&self.shared.failures).insert(operation, hr);
    }

    /// The next `AckCondition` fails with `hr` while still handing back a
    /// per-item array.
    pub fn fail_next_ack(&self, hr: Hresult) {
        self.fail_next("AckCondition", hr);
    }

    /// Pause before every refresh batch so a test can cancel mid-way.
    pub fn set_refresh_delay(&self, delay: Duration) {
        *lock(&self.shared.refresh_delay) = delay;
    }

    // ── Notifications ──

    /// Deliver `events` to every active subscription whose filter selects
    /// them, split by each subscription's max size. Returns the number of
    /// sink callbacks made.
    pub fn emit(&self, events: &[FakeEvent]) -> usize {
        let disabled = self.disabled_sources();
        let mut calls = 0;
        for sub in self.shared.live_subscriptions() {
            let (active, filter, max_size) = {
                let state = lock(&sub.state);
                (state.active, state.filter.clone(), state.max_size)
            };
            if !active {
                continue;
            }
            let selected: Vec<FakeEvent> = events
                .iter()
                .filter(|e| selects(&filter, e))
                .filter(|e| !(e.event_type == EventType::Condition && disabled.contains(&e.source)))
                .cloned()
                .collect();
            if selected.is_empty() {
                continue;
            }
            for chunk in selected.chunks(batch_size(max_size, selected.len())) {
                calls += sub.send(None, false, false, chunk);
            }
        }
        calls
    }

    /// Deliver one callback to the subscription with `client_handle`,
    /// bypassing its filter and active flag.
    pub fn emit_to(&self, client_handle: u32, refresh: bool, last_refresh: bool, events: &[FakeEvent]) -> usize {
        self.shared
            .live_subscriptions()
            .into_iter()
            .filter(|sub| lock(&sub.state).client_handle == client_handle)
            .map(|sub| sub.send(None, refresh, last_refresh, events))
            .sum()
    }

    /// Block until every refresh started so far has finished.
    pub fn wait_for_refreshes(&self) {
        loop {
            let workers = std::mem::take(&mut *lock(&self.shared.workers));
            if workers.is_empty() {
                break;
            }
            for worker in workers {
                if worker.join().is_err() {
                    warn!("refresh worker panicked");
                }
            }
        }
    }

    // ── Observation ──

    pub fn live_subscriptions(&self) -> usize {
        self.shared.live_subscriptions().len()
    }

    /// Sinks currently advised across all subscriptions.
    pub fn advised_sinks(&self) -> usize {
        self.shared
            .live_subscriptions()
            .iter()
            .map(|sub| lock(&sub.sinks).len())
            .sum()
    }

    pub fn subscription_state(&self, client_handle: u32) -> Option<SubscriptionState> {
        self.shared
            .live_subscriptions()
            .iter()
            .map(|sub| lock(&sub.state).snapshot())
            .find(|state| state.client_handle == client_handle)
    }

    pub fn subscription_filter(&self, client_handle: u32) -> Option<SubscriptionFilter> {
        self.shared.live_subscriptions().iter().find_map(|sub| {
            let state = lock(&sub.state);
            (state.client_handle == client_handle).then(|| state.filter.clone())
        })
    }

    /// Lifecycle calls in the order the server saw them.
    pub fn call_log(&self) -> Vec<String> {
        lock(&self.shared.log).clone()
    }
}

impl Default for FakeEventServer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for FakeEventServer {
    fn drop(&mut self) {
        self.wait_for_refreshes();
    }
}

impl fmt::Debug for FakeEventServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FakeEventServer")
            .field("refs", &self.ref_count())
            .field("subscriptions", &self.live_subscriptions())
            .finish_non_exhaustive()
    }
}

fn selects(filter: &SubscriptionFilter, event: &FakeEvent) -> bool {
    filter.event_types.contains(event.event_type)
        && (filter.categories.is_empty() || filter.categories.contains(&event.category))
        && (filter.low_severity..=filter.high_severity).contains(&event.severity)
        && (filter.sources.is_empty() || filter.sources.iter().any(|s| *s == event.source))
}

fn batch_size(max_size: u32, len: usize) -> usize {
    if max_size == 0 {
        len.max(1)
    } else {
        usize::try_from(max_size).unwrap_or(len).max(1)
    }
}

/// Clamp requested parameters to what the fake supports, with the success
/// code a server uses to report the revision.
fn revise(buffer_time_ms: u32, max_size: u32) -> (u32, u32, Hresult) {
    let granted_buffer = if buffer_time_ms != 0 && buffer_time_ms < MIN_BUFFER_TIME_MS {
        MIN_BUFFER_TIME_MS
    } else {
        buffer_time_ms
    };
    let granted_max = max_size.min(MAX_BATCH_SIZE);
    let hr = if granted_buffer != buffer_time_ms {
        Hresult::OPC_S_INVALIDBUFFERTIME
    } else if granted_max != max_size {
        Hresult::OPC_S_INVALIDMAXSIZE
    } else {
        Hresult::S_OK
    };
    (granted_buffer, granted_max, hr)
}

// ── Shared state ────────────────────────────────────────────────────

struct Catalog {
    categories: Vec<(EventType, u32, String)>,
    attributes: Vec<(u32, u32, String, VarType)>,
    conditions: Vec<FakeCondition>,
    disabled_areas: Vec<String>,
    disabled_sources: Vec<String>,
    available_filters: FilterMask,
}

impl Default for Catalog {
    fn default() -> Self {
        Self {
            categories: Vec::new(),
            attributes: Vec::new(),
            conditions: Vec::new(),
            disabled_areas: Vec::new(),
            disabled_sources: Vec::new(),
            available_filters: FilterMask(0x1F),
        }
    }
}

#[derive(Default)]
struct ServerShared {
    alloc: Arc<CountingAllocator>,
    catalog: Mutex<Catalog>,
    subscriptions: Mutex<Vec<Weak<Subscription>>>,
    failures: Mutex<HashMap<&'static str, Hresult>>,
    log: Mutex<Vec<String>>,
    refresh_delay: Mutex<Duration>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ServerShared {
    fn live_subscriptions(&self) -> Vec<Arc<Subscription>> {
        let mut subs = lock(&self.subscriptions);
        subs.retain(|weak| weak.strong_count() > 0);
        subs.iter().filter_map(Weak::upgrade).collect()
    }

    fn take_failure(&self, operation: &str) -> Option<Hresult> {
        let hr = lock(&self.failures).remove(operation);
        if let Some(hr) = hr {
            debug!(operation, hresult = %hr, "injected failure");
        }
        hr
    }

    fn record(&self, entry: String) {
        lock(&self.log).push(entry);
    }
}

struct SubState {
    active: bool,
    buffer_time_ms: u32,
    max_size: u32,
    client_handle: u32,
    filter: SubscriptionFilter,
    returned: BTreeMap<u32, Vec<u32>>,
}

impl SubState {
    fn snapshot(&self) -> SubscriptionState {
        SubscriptionState {
            active: self.active,
            buffer_time_ms: self.buffer_time_ms,
            max_size: self.max_size,
            client_handle: self.client_handle,
        }
    }
}

struct Subscription {
    server: Arc<ServerShared>,
    state: Mutex<SubState>,
    /// Held for the whole of each callback, so `Unadvise` returns only once
    /// no call into the removed sink is in flight.
    sinks: Mutex<BTreeMap<u32, ComPtr<IOPCEventSink>>>,
    next_cookie: AtomicU32,
    refreshing: AtomicBool,
    cancel: AtomicBool,
}

impl Subscription {
    /// One `OnEvent` per advised sink (or only the sink under `only`).
    fn send(&self, only: Option<u32>, refresh: bool, last_refresh: bool, events: &[FakeEvent]) -> usize {
        let client_handle = lock(&self.state).client_handle;
        let alloc = &self.server.alloc;
        let mut raws = Vec::with_capacity(events.len());
        for event in events {
            match event.encode(alloc) {
                Ok(raw) => raws.push(raw),
                Err(err) => warn!(%err, source = event.source(), "event not encodable; skipped"),
            }
        }

        let mut calls = 0;
        {
            let sinks = lock(&self.sinks);
            for (cookie, sink) in sinks.iter() {
                if only.is_some_and(|c| c != *cookie) {
                    continue;
                }
                if let Err(err) = sink.on_event(client_handle, refresh, last_refresh, &raws) {
                    warn!(%err, cookie, "sink rejected callback");
                }
                calls += 1;
            }
        }

        for raw in raws {
            FakeEvent::release(alloc, raw);
        }
        calls
    }

    fn start_refresh(self: &Arc<Self>, connection: u32) -> Hresult {
        if !lock(&self.sinks).contains_key(&connection) {
            return Hresult::E_INVALIDARG;
        }
        if self.refreshing.swap(true, Ordering::AcqRel) {
            return Hresult::OPC_E_BUSY;
        }
        self.cancel.store(false, Ordering::Release);

        let sub = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name("fake-ae-refresh".into())
            .spawn(move || sub.run_refresh(connection));
        match spawned {
            Ok(handle) => {
                lock(&self.server.workers).push(handle);
                Hresult::S_OK
            }
            Err(err) => {
                warn!(%err, "could not start refresh worker");
                self.refreshing.store(false, Ordering::Release);
                Hresult::E_OUTOFMEMORY
            }
        }
    }

    /// Replay every enabled condition that is active or awaiting
    /// acknowledgement, the final batch flagged as last. An empty replay is
    /// one empty last batch.
    fn run_refresh(&self, connection: u32) {
        let delay = *lock(&self.server.refresh_delay);
        let (filter, max_size) = {
            let state = lock(&self.state);
            (state.filter.clone(), state.max_size)
        };
        let now = Utc::now();
        let events: Vec<FakeEvent> = lock(&self.server.catalog)
            .conditions
            .iter()
            .filter(|c| {
                let flags = ConditionFlags(c.flags);
                flags.is_enabled() && (flags.is_active() || !flags.is_acked())
            })
            .map(|c| c.to_event(now))
            .filter(|e| selects(&filter, e))
            .collect();

        let chunks: Vec<&[FakeEvent]> = if events.is_empty() {
            vec![&events[..]]
        } else {
            events.chunks(batch_size(max_size, events.len())).collect()
        };
        let last = chunks.len().saturating_sub(1);
        for (i, chunk) in chunks.into_iter().enumerate() {
            if !delay.is_zero() {
                thread::sleep(delay);
            }
            if self.cancel.load(Ordering::Acquire) {
                debug!(connection, sent = i, "refresh cancelled");
                break;
            }
            if self.send(Some(connection), true, i == last, chunk) == 0 {
                debug!(connection, "refresh target unadvised");
                break;
            }
        }
        self.refreshing.store(false, Ordering::Release);
    }
}

// ── Object plumbing ─────────────────────────────────────────────────

trait Counted {
    fn refs(&self) -> &AtomicU32;
    fn final_release(&self) {}
}

#[repr(C)]
struct ServerObject {
    vtbl: *const IOPCEventServerVtbl,
    refs: AtomicU32,
    shared: Arc<ServerShared>,
}

/// One identity, two interfaces: the management vtable sits at offset zero,
/// the container vtable one pointer further on.
#[repr(C)]
struct SubscriptionObject {
    mgt: *const IOPCEventSubscriptionMgtVtbl,
    cpc: *const IConnectionPointContainerVtbl,
    refs: AtomicU32,
    sub: Arc<Subscription>,
}

#[repr(C)]
struct ConnectionPointObject {
    vtbl: *const IConnectionPointVtbl,
    refs: AtomicU32,
    sub: Arc<Subscription>,
}

impl Counted for ServerObject {
    fn refs(&self) -> &AtomicU32 {
        &self.refs
    }
}

impl Counted for SubscriptionObject {
    fn refs(&self) -> &AtomicU32 {
        &self.refs
    }

    fn final_release(&self) {
        let handle = lock(&self.sub.state).client_handle;
        self.sub.server.record(format!("Release subscription {handle}"));
    }
}

impl Counted for ConnectionPointObject {
    fn refs(&self) -> &AtomicU32 {
        &self.refs
    }

    fn final_release(&self) {
        self.sub.server.record("Release connection point".to_owned());
    }
}

fn new_object<T>(object: T) -> *mut c_void {
    Box::into_raw(Box::new(object)).cast()
}

/// # Safety
///
/// `this` must point to a live `T`.
unsafe fn object<'a, T>(this: *mut c_void) -> &'a T {
    // SAFETY: caller contract.
    unsafe { &*this.cast::<T>() }
}

unsafe fn subscription<'a>(this: *mut c_void) -> &'a Arc<Subscription> {
    // SAFETY: caller passes the management-side pointer of a live object.
    &unsafe { object::<SubscriptionObject>(this) }.sub
}

fn container_to_object(this: *mut c_void) -> *mut c_void {
    this.wrapping_byte_sub(offset_of!(SubscriptionObject, cpc))
}

unsafe extern "system" fn add_ref<T: Counted>(this: *mut c_void) -> u32 {
    // SAFETY: `this` is a live `T`.
    let obj = unsafe { object::<T>(this) };
    obj.refs().fetch_add(1, Ordering::Relaxed) + 1
}

unsafe extern "system" fn release<T: Counted>(this: *mut c_void) -> u32 {
    // SAFETY: `this` is a live `T`.
    let obj = unsafe { object::<T>(this) };
    let prev = obj.refs().fetch_sub(1, Ordering::Release);
    if prev == 1 {
        fence(Ordering::Acquire);
        obj.final_release();
        // SAFETY: that was the last reference; the object came from `new_object`.
        drop(unsafe { Box::from_raw(this.cast::<T>()) });
    }
    prev.saturating_sub(1)
}

/// Null the out-pointer and read the requested IID.
unsafe fn qi_prelude(riid: *const Guid, ppv: *mut *mut c_void) -> Result<Guid, Hresult> {
    if ppv.is_null() {
        return Err(Hresult::E_POINTER);
    }
    // SAFETY: non-null out-pointer from the caller.
    unsafe { ppv.write(std::ptr::null_mut()) };
    if riid.is_null() {
        return Err(Hresult::E_INVALIDARG);
    }
    // SAFETY: non-null IID from the caller.
    Ok(unsafe { riid.read() })
}

/// Write `value` if the caller passed somewhere to put it.
unsafe fn put<T>(out: *mut T, value: T) {
    if !out.is_null() {
        // SAFETY: non-null out-pointers are valid for writes.
        unsafe { out.write(value) };
    }
}

unsafe fn read_name(ptr: *const u16) -> Result<String, Hresult> {
    // SAFETY: caller passes null or a NUL-terminated string.
    unsafe { read_wide(ptr, "name") }.map_err(|_| Hresult::E_INVALIDARG)
}

unsafe fn read_names(count: u32, names: *const *const u16) -> Result<Vec<String>, Hresult> {
    // SAFETY: caller passes `count` string pointers.
    let ptrs = unsafe { foreign_slice(names, dword_len(count), "names") }.map_err(|_| Hresult::E_INVALIDARG)?;
    ptrs.iter()
        .map(|&p| {
            // SAFETY: each entry is a NUL-terminated string.
            unsafe { read_name(p) }
        })
        .collect()
}

unsafe fn out_strings<S: AsRef<str>>(
    alloc: &CountingAllocator,
    items: &[S],
    count: *mut u32,
    names: *mut *mut *mut u16,
) -> Hresult {
    if count.is_null() || names.is_null() {
        return Hresult::E_POINTER;
    }
    // SAFETY: both out-pointers checked above.
    unsafe {
        count.write(dword(items.len()));
        names.write(alloc.alloc_wstr_array(items));
    }
    Hresult::S_OK
}

unsafe extern "system" fn not_implemented(_this: *mut c_void) -> Hresult {
    Hresult::E_NOTIMPL
}

// ── IOPCEventServer ─────────────────────────────────────────────────

static SERVER_VTBL: IOPCEventServerVtbl = IOPCEventServerVtbl {
    base: IUnknownVtbl {
        query_interface: server_query_interface,
        add_ref: add_ref::<ServerObject>,
        release: release::<ServerObject>,
    },
    get_status: server_get_status,
    create_event_subscription: server_create_event_subscription,
    query_available_filters: server_query_available_filters,
    query_event_categories: server_query_event_categories,
    query_condition_names: server_query_condition_names,
    query_sub_condition_names: server_query_sub_condition_names,
    query_source_conditions: server_query_source_conditions,
    query_event_attributes: server_query_event_attributes,
    translate_to_item_ids: server_translate_to_item_ids,
    get_condition_state: server_get_condition_state,
    enable_condition_by_area: server_enable_by_area,
    enable_condition_by_source: server_enable_by_source,
    disable_condition_by_area: server_disable_by_area,
    disable_condition_by_source: server_disable_by_source,
    ack_condition: server_ack_condition,
    create_area_browser: server_create_area_browser,
};

unsafe fn shared<'a>(this: *mut c_void) -> &'a Arc<ServerShared> {
    // SAFETY: caller passes a live server object.
    &unsafe { object::<ServerObject>(this) }.shared
}

unsafe extern "system" fn server_query_interface(
    this: *mut c_void,
    riid: *const Guid,
    ppv: *mut *mut c_void,
) -> Hresult {
    // SAFETY: IUnknown contract on both pointers.
    let iid = match unsafe { qi_prelude(riid, ppv) } {
        Ok(iid) => iid,
        Err(hr) => return hr,
    };
    if iid == IID_IUNKNOWN || iid == IID_IOPC_EVENT_SERVER {
        // SAFETY: live object; `ppv` checked by the prelude.
        unsafe {
            add_ref::<ServerObject>(this);
            ppv.write(this);
        }
        Hresult::S_OK
    } else {
        Hresult::E_NOINTERFACE
    }
}

unsafe extern "system" fn server_get_status(_this: *mut c_void, _status: *mut *mut c_void) -> Hresult {
    Hresult::E_NOTIMPL
}

#[allow(clippy::too_many_arguments)]
unsafe extern "system" fn server_create_event_subscription(
    this: *mut c_void,
    active: i32,
    buffer_time: u32,
    max_size: u32,
    client_subscription: u32,
    riid: *const Guid,
    unk: *mut *mut c_void,
    revised_buffer_time: *mut u32,
    revised_max_size: *mut u32,
) -> Hresult {
    // SAFETY: live server object.
    let shared = unsafe { shared(this) };
    if unk.is_null() || riid.is_null() {
        return Hresult::E_POINTER;
    }
    // SAFETY: non-null out-pointer.
    unsafe { unk.write(std::ptr::null_mut()) };
    if let Some(hr) = shared.take_failure("CreateEventSubscription") {
        return hr;
    }

    let (buffer_time_ms, max_size, hr) = revise(buffer_time, max_size);
    let sub = Arc::new(Subscription {
        server: Arc::clone(shared),
        state: Mutex::new(SubState {
            active: active != 0,
            buffer_time_ms,
            max_size,
            client_handle: client_subscription,
            filter: SubscriptionFilter::default(),
            returned: BTreeMap::new(),
        }),
        sinks: Mutex::new(BTreeMap::new()),
        next_cookie: AtomicU32::new(1),
        refreshing: AtomicBool::new(false),
        cancel: AtomicBool::new(false),
    });
    lock(&shared.subscriptions).push(Arc::downgrade(&sub));

    let obj = new_object(SubscriptionObject {
        mgt: &raw const MGT_VTBL,
        cpc: &raw const CPC_VTBL,
        refs: AtomicU32::new(1),
        sub,
    });
    // SAFETY: `obj` is live with our one reference; `riid`/`unk` checked above.
    let qi = unsafe { subscription_query_interface(obj, riid, unk) };
    // SAFETY: drops the reference taken at creation.
    unsafe { release::<SubscriptionObject>(obj) };
    if qi.is_failure() {
        return qi;
    }

    // SAFETY: out-pointers are null or valid.
    unsafe {
        put(revised_buffer_time, buffer_time_ms);
        put(revised_max_size, max_size);
    }
    shared.record(format!("CreateEventSubscription {client_subscription}"));
    hr
}

unsafe extern "system" fn server_query_available_filters(this: *mut c_void, filter_mask: *mut u32) -> Hresult {
    if filter_mask.is_null() {
        return Hresult::E_POINTER;
    }
    // SAFETY: live server object.
    let mask = lock(&unsafe { shared(this) }.catalog).available_filters;
    // SAFETY: checked above.
    unsafe { filter_mask.write(mask.0) };
    Hresult::S_OK
}

unsafe extern "system" fn server_query_event_categories(
    this: *mut c_void,
    event_type: u32,
    count: *mut u32,
    categories: *mut *mut u32,
    descriptions: *mut *mut *mut u16,
) -> Hresult {
    if count.is_null() || categories.is_null() || descriptions.is_null() {
        return Hresult::E_POINTER;
    }
    let Ok(mask) = EventTypeMask::from_bits(event_type, "dwEventType") else {
        return Hresult::E_INVALIDARG;
    };
    if mask.is_empty() {
        return Hresult::E_INVALIDARG;
    }
    // SAFETY: live server object.
    let shared = unsafe { shared(this) };
    let catalog = lock(&shared.catalog);
    let (ids, descs): (Vec<u32>, Vec<&str>) = catalog
        .categories
        .iter()
        .filter(|(ty, _, _)| mask.contains(*ty))
        .map(|(_, id, desc)| (*id, desc.as_str()))
        .unzip();
    // SAFETY: all three out-pointers checked above.
    unsafe {
        count.write(dword(ids.len()));
        categories.write(shared.alloc.alloc_array(&ids));
        descriptions.write(shared.alloc.alloc_wstr_array(&descs));
    }
    Hresult::S_OK
}

unsafe extern "system" fn server_query_condition_names(
    this: *mut c_void,
    event_category: u32,
    count: *mut u32,
    names: *mut *mut *mut u16,
) -> Hresult {
    // SAFETY: live server object.
    let shared = unsafe { shared(this) };
    let catalog = lock(&shared.catalog);
    let mut found: Vec<&str> = Vec::new();
    for c in catalog.conditions.iter().filter(|c| c.category == event_category) {
        if !found.contains(&c.condition.as_str()) {
            found.push(&c.condition);
        }
    }
    // SAFETY: out-pointers from the caller.
    unsafe { out_strings(&shared.alloc, &found, count, names) }
}

unsafe extern "system" fn server_query_sub_condition_names(
    this: *mut c_void,
    condition_name: *const u16,
    count: *mut u32,
    names: *mut *mut *mut u16,
) -> Hresult {
    // SAFETY: live server object.
    let shared = unsafe { shared(this) };
    // SAFETY: caller passes a NUL-terminated name.
    let Ok(condition) = (unsafe { read_name(condition_name) }) else {
        return Hresult::E_INVALIDARG;
    };
    let catalog = lock(&shared.catalog);
    let Some(found) = catalog.conditions.iter().find(|c| c.condition == condition) else {
        return Hresult::E_INVALIDARG;
    };
    let subconditions: Vec<&str> = found.subcondition_names().collect();
    // SAFETY: out-pointers from the caller.
    unsafe { out_strings(&shared.alloc, &subconditions, count, names) }
}

unsafe extern "system" fn server_query_source_conditions(
    this: *mut c_void,
    source: *const u16,
    count: *mut u32,
    names: *mut *mut *mut u16,
) -> Hresult {
    // SAFETY: live server object.
    let shared = unsafe { shared(this) };
    // SAFETY: caller passes a NUL-terminated name.
    let Ok(source) = (unsafe { read_name(source) }) else {
        return Hresult::E_INVALIDARG;
    };
    let catalog = lock(&shared.catalog);
    let conditions: Vec<&str> = catalog
        .conditions
        .iter()
        .filter(|c| c.source == source)
        .map(|c| c.condition.as_str())
        .collect();
    // SAFETY: out-pointers from the caller.
    unsafe { out_strings(&shared.alloc, &conditions, count, names) }
}

unsafe extern "system" fn server_query_event_attributes(
    this: *mut c_void,
    event_category: u32,
    count: *mut u32,
    attr_ids: *mut *mut u32,
    attr_descs: *mut *mut *mut u16,
    attr_types: *mut *mut u16,
) -> Hresult {
    if count.is_null() || attr_ids.is_null() || attr_descs.is_null() || attr_types.is_null() {
        return Hresult::E_POINTER;
    }
    // SAFETY: live server object.
    let shared = unsafe { shared(this) };
    let catalog = lock(&shared.catalog);
    let selected: Vec<_> = catalog
        .attributes
        .iter()
        .filter(|(category, ..)| *category == event_category)
        .collect();
    let ids: Vec<u32> = selected.iter().map(|(_, id, ..)| *id).collect();
    let descs: Vec<&str> = selected.iter().map(|(_, _, desc, _)| desc.as_str()).collect();
    let types: Vec<u16> = selected.iter().map(|(.., vt)| vt.0).collect();
    // SAFETY: all four out-pointers checked above.
    unsafe {
        count.write(dword(ids.len()));
        attr_ids.write(shared.alloc.alloc_array(&ids));
        attr_descs.write(shared.alloc.alloc_wstr_array(&descs));
        attr_types.write(shared.alloc.alloc_array(&types));
    }
    Hresult::S_OK
}

#[allow(clippy::too_many_arguments)]
unsafe extern "system" fn server_translate_to_item_ids(
    _this: *mut c_void,
    _source: *const u16,
    _event_category: u32,
    _condition_name: *const u16,
    _subcondition_name: *const u16,
    _count: u32,
    _assoc_attr_ids: *const u32,
    _attr_item_ids: *mut *mut *mut u16,
    _node_names: *mut *mut *mut u16,
    _clsids: *mut *mut Guid,
) -> Hresult {
    Hresult::E_NOTIMPL
}

unsafe extern "system" fn server_get_condition_state(
    this: *mut c_void,
    source: *const u16,
    condition_name: *const u16,
    num_event_attrs: u32,
    attribute_ids: *const u32,
    condition_state: *mut *mut RawConditionState,
) -> Hresult {
    if condition_state.is_null() {
        return Hresult::E_POINTER;
    }
    // SAFETY: non-null out-pointer.
    unsafe { condition_state.write(std::ptr::null_mut()) };
    // SAFETY: live server object.
    let shared = unsafe { shared(this) };
    // SAFETY: caller passes NUL-terminated names and `num_event_attrs` ids.
    let inputs = unsafe {
        (
            read_name(source),
            read_name(condition_name),
            foreign_slice(attribute_ids, dword_len(num_event_attrs), "pdwAttributeIDs"),
        )
    };
    let (Ok(source), Ok(condition), Ok(ids)) = inputs else {
        return Hresult::E_INVALIDARG;
    };

    let catalog = lock(&shared.catalog);
    let Some(found) = catalog
        .conditions
        .iter()
        .find(|c| c.source == source && c.condition == condition)
    else {
        return Hresult::OPC_E_INVALIDITEMID;
    };
    match found.encode_state(&shared.alloc, ids) {
        Ok(state) => {
            // SAFETY: checked above.
            unsafe { condition_state.write(state) };
            Hresult::S_OK
        }
        Err(err) => {
            warn!(%err, "condition state not encodable");
            Hresult::E_FAIL
        }
    }
}

#[derive(Clone, Copy)]
enum Scope {
    Area,
    Source,
}

fn update_list(list: &mut Vec<String>, names: &[String], enable: bool) {
    if enable {
        list.retain(|n| !names.contains(n));
    } else {
        for name in names {
            if !list.contains(name) {
                list.push(name.clone());
            }
        }
    }
}

unsafe fn toggle_conditions(this: *mut c_void, count: u32, names: *const *const u16, scope: Scope, enable: bool) -> Hresult {
    // SAFETY: live server object.
    let shared = unsafe { shared(this) };
    // SAFETY: caller passes `count` NUL-terminated names.
    let Ok(names) = (unsafe { read_names(count, names) }) else {
        return Hresult::E_INVALIDARG;
    };
    let mut catalog = lock(&shared.catalog);
    match scope {
        Scope::Area => update_list(&mut catalog.disabled_areas, &names, enable),
        Scope::Source => {
            for c in catalog.conditions.iter_mut().filter(|c| names.contains(&c.source)) {
                if enable {
                    c.flags |= ConditionFlags::ENABLED;
                } else {
                    c.flags &= !ConditionFlags::ENABLED;
                }
            }
            update_list(&mut catalog.disabled_sources, &names, enable);
        }
    }
    Hresult::S_OK
}

unsafe extern "system" fn server_enable_by_area(this: *mut c_void, count: u32, names: *const *const u16) -> Hresult {
    // SAFETY: forwarded caller contract.
    unsafe { toggle_conditions(this, count, names, Scope::Area, true) }
}

unsafe extern "system" fn server_enable_by_source(this: *mut c_void, count: u32, names: *const *const u16) -> Hresult {
    // SAFETY: forwarded caller contract.
    unsafe { toggle_conditions(this, count, names, Scope::Source, true) }
}

unsafe extern "system" fn server_disable_by_area(this: *mut c_void, count: u32, names: *const *const u16) -> Hresult {
    // SAFETY: forwarded caller contract.
    unsafe { toggle_conditions(this, count, names, Scope::Area, false) }
}

unsafe extern "system" fn server_disable_by_source(this: *mut c_void, count: u32, names: *const *const u16) -> Hresult {
    // SAFETY: forwarded caller contract.
    unsafe { toggle_conditions(this, count, names, Scope::Source, false) }
}

#[allow(clippy::too_many_arguments)]
unsafe extern "system" fn server_ack_condition(
    this: *mut c_void,
    count: u32,
    acknowledger_id: *const u16,
    comment: *const u16,
    sources: *const *const u16,
    condition_names: *const *const u16,
    active_times: *const FileTime,
    cookies: *const u32,
    errors: *mut *mut Hresult,
) -> Hresult {
    if errors.is_null() {
        return Hresult::E_POINTER;
    }
    // SAFETY: non-null out-pointer.
    unsafe { errors.write(std::ptr::null_mut()) };
    // SAFETY: live server object.
    let shared = unsafe { shared(this) };
    let n = dword_len(count);
    if let Some(hr) = shared.take_failure("AckCondition") {
        // Some servers fill the result array even when the call fails.
        let partial = vec![hr; n];
        // SAFETY: checked above.
        unsafe { errors.write(shared.alloc.alloc_array(&partial)) };
        return hr;
    }
    if n == 0 {
        return Hresult::E_INVALIDARG;
    }

    // SAFETY: caller passes two NUL-terminated strings and `count` entries in
    // each array.
    let inputs = unsafe {
        (
            read_name(acknowledger_id),
            read_name(comment),
            read_names(count, sources),
            read_names(count, condition_names),
            foreign_slice(active_times, n, "pftActiveTime"),
            foreign_slice(cookies, n, "pdwCookie"),
        )
    };
    let (Ok(acknowledger), Ok(comment), Ok(sources), Ok(conditions), Ok(_), Ok(cookies)) = inputs else {
        return Hresult::E_INVALIDARG;
    };

    let now = Utc::now();
    let results: Vec<Hresult> = {
        let mut catalog = lock(&shared.catalog);
        sources
            .iter()
            .zip(&conditions)
            .zip(cookies)
            .map(|((source, condition), &cookie)| {
                match catalog
                    .conditions
                    .iter_mut()
                    .find(|c| c.source == *source && c.condition == *condition)
                {
                    None => Hresult::OPC_E_INVALIDITEMID,
                    Some(c) if c.cookie != cookie => Hresult::E_INVALIDARG,
                    Some(c) if c.is_acked() => Hresult::OPC_S_ALREADYACKED,
                    Some(c) => {
                        c.acknowledge(&acknowledger, &comment, now);
                        Hresult::S_OK
                    }
                }
            })
            .collect()
    };
    // SAFETY: checked above.
    unsafe { errors.write(shared.alloc.alloc_array(&results)) };
    shared.record(format!("AckCondition {n}"));
    if results.iter().all(|hr| hr.is_success()) {
        Hresult::S_OK
    } else {
        Hresult::S_FALSE
    }
}

unsafe extern "system" fn server_create_area_browser(
    _this: *mut c_void,
    _riid: *const Guid,
    _unk: *mut *mut c_void,
) -> Hresult {
    Hresult::E_NOTIMPL
}

// ── IOPCEventSubscriptionMgt ────────────────────────────────────────

static MGT_VTBL: IOPCEventSubscriptionMgtVtbl = IOPCEventSubscriptionMgtVtbl {
    base: IUnknownVtbl {
        query_interface: subscription_query_interface,
        add_ref: add_ref::<SubscriptionObject>,
        release: release::<SubscriptionObject>,
    },
    set_filter: sub_set_filter,
    get_filter: sub_get_filter,
    select_returned_attributes: sub_select_returned_attributes,
    get_returned_attributes: sub_get_returned_attributes,
    refresh: sub_refresh,
    cancel_refresh: sub_cancel_refresh,
    get_state: sub_get_state,
    set_state: sub_set_state,
};

unsafe extern "system" fn subscription_query_interface(
    this: *mut c_void,
    riid: *const Guid,
    ppv: *mut *mut c_void,
) -> Hresult {
    // SAFETY: IUnknown contract on both pointers.
    let iid = match unsafe { qi_prelude(riid, ppv) } {
        Ok(iid) => iid,
        Err(hr) => return hr,
    };
    let target = if iid == IID_IUNKNOWN || iid == IID_IOPC_EVENT_SUBSCRIPTION_MGT {
        this
    } else if iid == IID_ICONNECTION_POINT_CONTAINER {
        this.wrapping_byte_add(offset_of!(SubscriptionObject, cpc))
    } else {
        return Hresult::E_NOINTERFACE;
    };
    // SAFETY: live object; `ppv` checked by the prelude.
    unsafe {
        add_ref::<SubscriptionObject>(this);
        ppv.write(target);
    }
    Hresult::S_OK
}

#[allow(clippy::too_many_arguments)]
unsafe extern "system" fn sub_set_filter(
    this: *mut c_void,
    event_type: u32,
    num_categories: u32,
    event_categories: *const u32,
    low_severity: u32,
    high_severity: u32,
    num_areas: u32,
    area_list: *const *const u16,
    num_sources: u32,
    source_list: *const *const u16,
) -> Hresult {
    // SAFETY: live subscription object.
    let sub = unsafe { subscription(this) };
    if let Some(hr) = sub.server.take_failure("SetFilter") {
        return hr;
    }
    let Ok(event_types) = EventTypeMask::from_bits(event_type, "dwEventType") else {
        return Hresult::E_INVALIDARG;
    };
    if low_severity > high_severity {
        return Hresult::E_INVALIDARG;
    }
    // SAFETY: caller passes each array with its stated count.
    let inputs = unsafe {
        (
            foreign_slice(event_categories, dword_len(num_categories), "pdwEventCategory"),
            read_names(num_areas, area_list),
            read_names(num_sources, source_list),
        )
    };
    let (Ok(categories), Ok(areas), Ok(sources)) = inputs else {
        return Hresult::E_INVALIDARG;
    };

    lock(&sub.state).filter = SubscriptionFilter {
        event_types,
        categories: categories.to_vec(),
        low_severity: low_severity.clamp(MIN_SEVERITY, MAX_SEVERITY),
        high_severity: high_severity.clamp(MIN_SEVERITY, MAX_SEVERITY),
        areas,
        sources,
    };
    Hresult::S_OK
}

#[allow(clippy::too_many_arguments)]
unsafe extern "system" fn sub_get_filter(
    this: *mut c_void,
    event_type: *mut u32,
    num_categories: *mut u32,
    event_categories: *mut *mut u32,
    low_severity: *mut u32,
    high_severity: *mut u32,
    num_areas: *mut u32,
    area_list: *mut *mut *mut u16,
    num_sources: *mut u32,
    source_list: *mut *mut *mut u16,
) -> Hresult {
    if [event_type, num_categories, low_severity, high_severity, num_areas, num_sources]
        .iter()
        .any(|p| p.is_null())
        || event_categories.is_null()
        || area_list.is_null()
        || source_list.is_null()
    {
        return Hresult::E_POINTER;
    }
    // SAFETY: live subscription object.
    let sub = unsafe { subscription(this) };
    let filter = lock(&sub.state).filter.clone();
    let alloc = &sub.server.alloc;
    // SAFETY: every out-pointer checked above.
    unsafe {
        event_type.write(filter.event_types.bits());
        num_categories.write(dword(filter.categories.len()));
        event_categories.write(alloc.alloc_array(&filter.categories));
        low_severity.write(filter.low_severity);
        high_severity.write(filter.high_severity);
        num_areas.write(dword(filter.areas.len()));
        area_list.write(alloc.alloc_wstr_array(&filter.areas));
        num_sources.write(dword(filter.sources.len()));
        source_list.write(alloc.alloc_wstr_array(&filter.sources));
    }
    Hresult::S_OK
}

unsafe extern "system" fn sub_select_returned_attributes(
    this: *mut c_void,
    event_category: u32,
    count: u32,
    attribute_ids: *const u32,
) -> Hresult {
    // SAFETY: live subscription object.
    let sub = unsafe { subscription(this) };
    // SAFETY: caller passes `count` ids.
    let Ok(ids) = (unsafe { foreign_slice(attribute_ids, dword_len(count), "dwAttributeIDs") }) else {
        return Hresult::E_INVALIDARG;
    };
    lock(&sub.state).returned.insert(event_category, ids.to_vec());
    Hresult::S_OK
}

unsafe extern "system" fn sub_get_returned_attributes(
    this: *mut c_void,
    event_category: u32,
    count: *mut u32,
    attribute_ids: *mut *mut u32,
) -> Hresult {
    if count.is_null() || attribute_ids.is_null() {
        return Hresult::E_POINTER;
    }
    // SAFETY: live subscription object.
    let sub = unsafe { subscription(this) };
    let ids = lock(&sub.state).returned.get(&event_category).cloned().unwrap_or_default();
    // SAFETY: checked above.
    unsafe {
        count.write(dword(ids.len()));
        attribute_ids.write(sub.server.alloc.alloc_array(&ids));
    }
    Hresult::S_OK
}

unsafe extern "system" fn sub_refresh(this: *mut c_void, connection: u32) -> Hresult {
    // SAFETY: live subscription object.
    let sub = unsafe { subscription(this) };
    if let Some(hr) = sub.server.take_failure("Refresh") {
        return hr;
    }
    sub.start_refresh(connection)
}

unsafe extern "system" fn sub_cancel_refresh(this: *mut c_void, connection: u32) -> Hresult {
    // SAFETY: live subscription object.
    let sub = unsafe { subscription(this) };
    if !sub.refreshing.load(Ordering::Acquire) {
        return Hresult::E_FAIL;
    }
    sub.cancel.store(true, Ordering::Release);
    debug!(connection, "refresh cancel requested");
    Hresult::S_OK
}

unsafe extern "system" fn sub_get_state(
    this: *mut c_void,
    active: *mut i32,
    buffer_time: *mut u32,
    max_size: *mut u32,
    client_subscription: *mut u32,
) -> Hresult {
    // SAFETY: live subscription object.
    let state = lock(&unsafe { subscription(this) }.state).snapshot();
    // SAFETY: out-pointers are null or valid.
    unsafe {
        put(active, i32::from(state.active));
        put(buffer_time, state.buffer_time_ms);
        put(max_size, state.max_size);
        put(client_subscription, state.client_handle);
    }
    Hresult::S_OK
}

unsafe extern "system" fn sub_set_state(
    this: *mut c_void,
    active: *const i32,
    buffer_time: *const u32,
    max_size: *const u32,
    client_subscription: u32,
    revised_buffer_time: *mut u32,
    revised_max_size: *mut u32,
) -> Hresult {
    // SAFETY: live subscription object.
    let sub = unsafe { subscription(this) };
    if let Some(hr) = sub.server.take_failure("SetState") {
        return hr;
    }
    let mut state = lock(&sub.state);
    // SAFETY: each input is null ("unchanged") or valid for reads.
    let (active, buffer_time, max_size) = unsafe {
        (
            active.as_ref().copied(),
            buffer_time.as_ref().copied(),
            max_size.as_ref().copied(),
        )
    };
    if let Some(active) = active {
        state.active = active != 0;
    }
    let (granted_buffer, granted_max, hr) = revise(
        buffer_time.unwrap_or(state.buffer_time_ms),
        max_size.unwrap_or(state.max_size),
    );
    state.buffer_time_ms = granted_buffer;
    state.max_size = granted_max;
    state.client_handle = client_subscription;
    drop(state);
    // SAFETY: out-pointers are null or valid.
    unsafe {
        put(revised_buffer_time, granted_buffer);
        put(revised_max_size, granted_max);
    }
    hr
}

// ── IConnectionPointContainer ───────────────────────────────────────

static CPC_VTBL: IConnectionPointContainerVtbl = IConnectionPointContainerVtbl {
    base: IUnknownVtbl {
        query_interface: container_query_interface,
        add_ref: container_add_ref,
        release: container_release,
    },
    enum_connection_points: not_implemented,
    find_connection_point: container_find_connection_point,
};

unsafe extern "system" fn container_query_interface(
    this: *mut c_void,
    riid: *const Guid,
    ppv: *mut *mut c_void,
) -> Hresult {
    // SAFETY: `this` is the container face of a live subscription object.
    unsafe { subscription_query_interface(container_to_object(this), riid, ppv) }
}

unsafe extern "system" fn container_add_ref(this: *mut c_void) -> u32 {
    // SAFETY: as above.
    unsafe { add_ref::<SubscriptionObject>(container_to_object(this)) }
}

unsafe extern "system" fn container_release(this: *mut c_void) -> u32 {
    // SAFETY: as above.
    unsafe { release::<SubscriptionObject>(container_to_object(this)) }
}

unsafe extern "system" fn container_find_connection_point(
    this: *mut c_void,
    riid: *const Guid,
    ppcp: *mut *mut c_void,
) -> Hresult {
    // SAFETY: `this` is the container face of a live subscription object.
    let sub = unsafe { subscription(container_to_object(this)) };
    // SAFETY: IUnknown-style contract on both pointers.
    let iid = match unsafe { qi_prelude(riid, ppcp) } {
        Ok(iid) => iid,
        Err(hr) => return hr,
    };
    if let Some(hr) = sub.server.take_failure("FindConnectionPoint") {
        return hr;
    }
    if iid != IID_IOPC_EVENT_SINK {
        return Hresult::CONNECT_E_NOCONNECTION;
    }
    let point = new_object(ConnectionPointObject {
        vtbl: &raw const CP_VTBL,
        refs: AtomicU32::new(1),
        sub: Arc::clone(sub),
    });
    // SAFETY: checked by the prelude.
    unsafe { ppcp.write(point) };
    Hresult::S_OK
}

// ── IConnectionPoint ────────────────────────────────────────────────

static CP_VTBL: IConnectionPointVtbl = IConnectionPointVtbl {
    base: IUnknownVtbl {
        query_interface: point_query_interface,
        add_ref: add_ref::<ConnectionPointObject>,
        release: release::<ConnectionPointObject>,
    },
    get_connection_interface: not_implemented,
    get_connection_point_container: not_implemented,
    advise: point_advise,
    unadvise: point_unadvise,
    enum_connections: not_implemented,
};

unsafe fn point_subscription<'a>(this: *mut c_void) -> &'a Arc<Subscription> {
    // SAFETY: caller passes a live connection point.
    &unsafe { object::<ConnectionPointObject>(this) }.sub
}

unsafe extern "system" fn point_query_interface(
    this: *mut c_void,
    riid: *const Guid,
    ppv: *mut *mut c_void,
) -> Hresult {
    // SAFETY: IUnknown contract on both pointers.
    let iid = match unsafe { qi_prelude(riid, ppv) } {
        Ok(iid) => iid,
        Err(hr) => return hr,
    };
    if iid == IID_IUNKNOWN || iid == IID_ICONNECTION_POINT {
        // SAFETY: live object; `ppv` checked by the prelude.
        unsafe {
            add_ref::<ConnectionPointObject>(this);
            ppv.write(this);
        }
        Hresult::S_OK
    } else {
        Hresult::E_NOINTERFACE
    }
}

/// Take our own reference to the client's sink through its `QueryInterface`.
unsafe fn query_sink(unk: *mut c_void) -> Option<ComPtr<IOPCEventSink>> {
    // SAFETY: `unk` is a live COM object, so it starts with a vtable pointer
    // whose first slots are IUnknown.
    let vtbl = unsafe { &**unk.cast::<*const IUnknownVtbl>() };
    let mut out: *mut c_void = std::ptr::null_mut();
    // SAFETY: live object; `out` is a valid out-pointer.
    let hr = unsafe { (vtbl.query_interface)(unk, &IID_IOPC_EVENT_SINK, &raw mut out) };
    if hr.is_failure() {
        return None;
    }
    // SAFETY: a successful QueryInterface hands over one reference.
    unsafe { ComPtr::from_raw(out) }
}

unsafe extern "system" fn point_advise(this: *mut c_void, sink: *mut c_void, cookie: *mut u32) -> Hresult {
    if cookie.is_null() || sink.is_null() {
        return Hresult::E_POINTER;
    }
    // SAFETY: non-null out-pointer.
    unsafe { cookie.write(0) };
    // SAFETY: live connection point.
    let sub = unsafe { point_subscription(this) };
    if let Some(hr) = sub.server.take_failure("Advise") {
        return hr;
    }
    // SAFETY: the caller hands us a live COM object.
    let Some(sink) = (unsafe { query_sink(sink) }) else {
        return Hresult::CONNECT_E_CANNOTCONNECT;
    };
    let assigned = sub.next_cookie.fetch_add(1, Ordering::Relaxed);
    lock(&sub.sinks).insert(assigned, sink);
    sub.server.record(format!("Advise {assigned}"));
    // SAFETY: checked above.
    unsafe { cookie.write(assigned) };
    Hresult::S_OK
}

unsafe extern "system" fn point_unadvise(this: *mut c_void, cookie: u32) -> Hresult {
    // SAFETY: live connection point.
    let sub = unsafe { point_subscription(this) };
    if let Some(hr) = sub.server.take_failure("Unadvise") {
        return hr;
    }
    let removed = lock(&sub.sinks).remove(&cookie);
    match removed {
        Some(sink) => {
            drop(sink);
            sub.server.record(format!("Unadvise {cookie}"));
            Hresult::S_OK
        }
        None => Hresult::CONNECT_E_NOCONNECTION,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::connection_point::IConnectionPointContainer;
    use crate::error::DecodeError;
    use crate::event::EventBatch;
    use crate::sink::{BatchHandler, EventSink};
    use crate::subscription_mgt::IOPCEventSubscriptionMgt;

    #[derive(Default)]
    struct Collect {
        batches: Mutex<Vec<EventBatch>>,
    }

    impl BatchHandler for Collect {
        fn deliver(&self, batch: EventBatch) {
            self.batches.lock().unwrap().push(batch);
        }

        fn decode_failed(&self, _client_handle: u32, _error: DecodeError) {}
    }

    fn t() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn requested_parameters_are_revised() {
        assert_eq!(revise(50, 10), (MIN_BUFFER_TIME_MS, 10, Hresult::OPC_S_INVALIDBUFFERTIME));
        assert_eq!(revise(0, 0), (0, 0, Hresult::S_OK));
        assert_eq!(revise(500, 50_000), (500, MAX_BATCH_SIZE, Hresult::OPC_S_INVALIDMAXSIZE));
    }

    #[test]
    fn subscription_exposes_both_interfaces_on_one_identity() {
        let server = FakeEventServer::new();
        let (unk, _) = server.server_ptr().create_event_subscription(true, 0, 0, 9).unwrap();
        let mgt = unk.query_interface::<IOPCEventSubscriptionMgt>().unwrap();
        let cpc = unk.query_interface::<IConnectionPointContainer>().unwrap();
        assert_eq!(mgt.get_state().unwrap().client_handle, 9);
        assert_eq!(
            cpc.query_interface::<crate::com::IUnknown>().unwrap().as_raw(),
            mgt.query_interface::<crate::com::IUnknown>().unwrap().as_raw(),
            "QueryInterface(IUnknown) must give one identity"
        );
        drop((unk, mgt, cpc));
        assert_eq!(server.live_subscriptions(), 0);
        assert_eq!(server.call_log().last().unwrap(), "Release subscription 9");
    }

    #[test]
    fn emit_honours_filter_and_active_flag() {
        let server = FakeEventServer::new();
        let (unk, _) = server.server_ptr().create_event_subscription(true, 0, 0, 1).unwrap();
        let mgt = unk.query_interface::<IOPCEventSubscriptionMgt>().unwrap();
        let cp = unk
            .query_interface::<IConnectionPointContainer>()
            .unwrap()
            .find_connection_point(&IID_IOPC_EVENT_SINK)
            .unwrap();
        let collect = Arc::new(Collect::default());
        let sink = EventSink::create(collect.clone());
        let cookie = cp.advise(&sink).unwrap();

        mgt.set_filter(&SubscriptionFilter::default().with_severity(500, 1000)).unwrap();
        let calls = server.emit(&[
            FakeEvent::simple("low", t()).severity(100),
            FakeEvent::simple("high", t()).severity(900),
        ]);
        assert_eq!(calls, 1);
        {
            let batches = collect.batches.lock().unwrap();
            assert_eq!(batches[0].len(), 1);
            assert_eq!(batches[0].records()[0].source, "high");
        }

        mgt.set_state(
            crate::subscription_mgt::StateUpdate {
                active: Some(false),
                ..Default::default()
            },
            1,
        )
        .unwrap();
        assert_eq!(server.emit(&[FakeEvent::simple("high", t()).severity(900)]), 0);

        cp.unadvise(cookie).unwrap();
        assert_eq!(server.advised_sinks(), 0);
        assert_eq!(server.allocator().outstanding(), 0);
    }
}
