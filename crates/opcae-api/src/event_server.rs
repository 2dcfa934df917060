// ── IOPCEventServer ──
//
// Server-level calls. Every variable-length out-parameter is put under a
// guard straight after the call returns, so it is released on every path
// including a failed HRESULT that still carried allocations.

use std::ffi::c_void;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::com::{ComPtr, IUnknown, IUnknownVtbl, Interface};
use crate::condition::{ConditionState, RawConditionState, take_condition_state};
use crate::error::{Error, check};
use crate::guid::{Guid, IID_IOPC_EVENT_SERVER, IID_IUNKNOWN};
use crate::hresult::Hresult;
use crate::memory::{ForeignAllocator, ForeignBlock, ForeignStrings};
use crate::subscription_mgt::RevisedState;
use crate::time::FileTime;
use crate::types::{EventTypeMask, FilterMask};
use crate::variant::VarType;
use crate::wide::{WideString, WideStringList};

type StringArrayOut = *mut *mut *mut u16;
type NameListCall = unsafe extern "system" fn(this: *mut c_void, count: u32, names: *const *const u16) -> Hresult;

#[repr(C)]
pub struct IOPCEventServerVtbl {
    pub base: IUnknownVtbl,
    pub get_status: unsafe extern "system" fn(this: *mut c_void, status: *mut *mut c_void) -> Hresult,
    pub create_event_subscription: unsafe extern "system" fn(
        this: *mut c_void,
        active: i32,
        buffer_time: u32,
        max_size: u32,
        client_subscription: u32,
        riid: *const Guid,
        unk: *mut *mut c_void,
        revised_buffer_time: *mut u32,
        revised_max_size: *mut u32,
    ) -> Hresult,
    pub query_available_filters: unsafe extern "system" fn(this: *mut c_void, filter_mask: *mut u32) -> Hresult,
    pub query_event_categories: unsafe extern "system" fn(
        this: *mut c_void,
        event_type: u32,
        count: *mut u32,
        categories: *mut *mut u32,
        descriptions: StringArrayOut,
    ) -> Hresult,
    pub query_condition_names: unsafe extern "system" fn(
        this: *mut c_void,
        event_category: u32,
        count: *mut u32,
        names: StringArrayOut,
    ) -> Hresult,
    pub query_sub_condition_names: unsafe extern "system" fn(
        this: *mut c_void,
        condition_name: *const u16,
        count: *mut u32,
        names: StringArrayOut,
    ) -> Hresult,
    pub query_source_conditions: unsafe extern "system" fn(
        this: *mut c_void,
        source: *const u16,
        count: *mut u32,
        names: StringArrayOut,
    ) -> Hresult,
    pub query_event_attributes: unsafe extern "system" fn(
        this: *mut c_void,
        event_category: u32,
        count: *mut u32,
        attr_ids: *mut *mut u32,
        attr_descs: StringArrayOut,
        attr_types: *mut *mut u16,
    ) -> Hresult,
    pub translate_to_item_ids: unsafe extern "system" fn(
        this: *mut c_void,
        source: *const u16,
        event_category: u32,
        condition_name: *const u16,
        subcondition_name: *const u16,
        count: u32,
        assoc_attr_ids: *const u32,
        attr_item_ids: StringArrayOut,
        node_names: StringArrayOut,
        clsids: *mut *mut Guid,
    ) -> Hresult,
    pub get_condition_state: unsafe extern "system" fn(
        this: *mut c_void,
        source: *const u16,
        condition_name: *const u16,
        num_event_attrs: u32,
        attribute_ids: *const u32,
        condition_state: *mut *mut RawConditionState,
    ) -> Hresult,
    pub enable_condition_by_area: NameListCall,
    pub enable_condition_by_source: NameListCall,
    pub disable_condition_by_area: NameListCall,
    pub disable_condition_by_source: NameListCall,
    pub ack_condition: unsafe extern "system" fn(
        this: *mut c_void,
        count: u32,
        acknowledger_id: *const u16,
        comment: *const u16,
        sources: *const *const u16,
        condition_names: *const *const u16,
        active_times: *const FileTime,
        cookies: *const u32,
        errors: *mut *mut Hresult,
    ) -> Hresult,
    pub create_area_browser:
        unsafe extern "system" fn(this: *mut c_void, riid: *const Guid, unk: *mut *mut c_void) -> Hresult,
}

pub enum IOPCEventServer {}

// SAFETY: vtable starts with IUnknownVtbl and follows the published slot order.
unsafe impl Interface for IOPCEventServer {
    const IID: Guid = IID_IOPC_EVENT_SERVER;
    type Vtable = IOPCEventServerVtbl;
}

// ── Result types ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventCategory {
    pub id: u32,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventAttribute {
    pub id: u32,
    pub description: String,
    pub var_type: VarType,
}

/// One condition occurrence to acknowledge, as identified by the event that
/// reported it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckTarget {
    pub source: String,
    pub condition: String,
    /// Activation time from the event; `None` is sent as a zero FILETIME.
    pub active_time: Option<DateTime<Utc>>,
    pub cookie: u32,
}

/// Per-item outcome of an acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AckOutcome {
    Acknowledged,
    AlreadyAcknowledged,
    Failed(Hresult),
}

impl From<Hresult> for AckOutcome {
    fn from(hr: Hresult) -> Self {
        if hr == Hresult::OPC_S_ALREADYACKED {
            Self::AlreadyAcknowledged
        } else if hr.is_success() {
            Self::Acknowledged
        } else {
            Self::Failed(hr)
        }
    }
}

fn out_count(count: u32) -> usize {
    usize::try_from(count).unwrap_or(usize::MAX)
}

// ── Calls ───────────────────────────────────────────────────────────

impl ComPtr<IOPCEventServer> {
    /// Create a subscription object. Returns its IUnknown plus the buffer time
    /// and max size the server actually granted.
    pub fn create_event_subscription(
        &self,
        active: bool,
        buffer_time_ms: u32,
        max_size: u32,
        client_handle: u32,
    ) -> Result<(ComPtr<IUnknown>, RevisedState), Error> {
        let mut unk: *mut c_void = std::ptr::null_mut();
        let mut revised = RevisedState::default();
        // SAFETY: live object; every out-pointer is valid for the call.
        let hr = unsafe {
            (self.vtable().create_event_subscription)(
                self.as_raw(),
                i32::from(active),
                buffer_time_ms,
                max_size,
                client_handle,
                &IID_IUNKNOWN,
                &raw mut unk,
                &raw mut revised.buffer_time_ms,
                &raw mut revised.max_size,
            )
        };
        // SAFETY: a non-null `unk` carries one reference whatever `hr` says.
        let subscription = unsafe { ComPtr::<IUnknown>::from_raw(unk) };
        let hr = check("CreateEventSubscription", hr)?;
        if hr != Hresult::S_OK {
            debug!(client_handle, hresult = %hr, "subscription parameters revised");
        }
        let subscription = subscription.ok_or(Error::Protocol {
            operation: "CreateEventSubscription",
            hresult: Hresult::E_POINTER,
        })?;
        Ok((subscription, revised))
    }

    pub fn query_available_filters(&self) -> Result<FilterMask, Error> {
        let mut mask = 0u32;
        // SAFETY: live object; `mask` is a valid out-pointer.
        let hr = unsafe { (self.vtable().query_available_filters)(self.as_raw(), &raw mut mask) };
        check("QueryAvailableFilters", hr)?;
        Ok(FilterMask(mask))
    }

    pub fn query_event_categories(
        &self,
        alloc: &dyn ForeignAllocator,
        event_types: EventTypeMask,
    ) -> Result<Vec<EventCategory>, Error> {
        let mut count = 0u32;
        let mut ids: *mut u32 = std::ptr::null_mut();
        let mut descs: *mut *mut u16 = std::ptr::null_mut();
        // SAFETY: live object; out-pointers valid for the call.
        let hr = unsafe {
            (self.vtable().query_event_categories)(
                self.as_raw(),
                event_types.bits(),
                &raw mut count,
                &raw mut ids,
                &raw mut descs,
            )
        };
        let n = out_count(count);
        // SAFETY: both arrays were allocated by the server with `count` entries.
        let (ids, descs) = unsafe {
            (
                ForeignBlock::array(alloc, ids, n),
                ForeignStrings::new(alloc, descs, n),
            )
        };
        check("QueryEventCategories", hr)?;

        let ids = ids.to_vec("ppdwEventCategories")?;
        let descs = descs.read("ppszEventCategoryDescs")?;
        Ok(ids
            .into_iter()
            .zip(descs)
            .map(|(id, description)| EventCategory { id, description })
            .collect())
    }

    pub fn query_condition_names(
        &self,
        alloc: &dyn ForeignAllocator,
        event_category: u32,
    ) -> Result<Vec<String>, Error> {
        let mut count = 0u32;
        let mut names: *mut *mut u16 = std::ptr::null_mut();
        // SAFETY: live object; out-pointers valid for the call.
        let hr = unsafe {
            (self.vtable().query_condition_names)(
                self.as_raw(),
                event_category,
                &raw mut count,
                &raw mut names,
            )
        };
        // SAFETY: server-allocated array of `count` strings.
        let names = unsafe { ForeignStrings::new(alloc, names, out_count(count)) };
        check("QueryConditionNames", hr)?;
        Ok(names.read("ppszConditionNames")?)
    }

    pub fn query_sub_condition_names(
        &self,
        alloc: &dyn ForeignAllocator,
        condition: &str,
    ) -> Result<Vec<String>, Error> {
        let condition = WideString::new(condition)?;
        let mut count = 0u32;
        let mut names: *mut *mut u16 = std::ptr::null_mut();
        // SAFETY: live object; `condition` outlives the call.
        let hr = unsafe {
            (self.vtable().query_sub_condition_names)(
                self.as_raw(),
                condition.as_ptr(),
                &raw mut count,
                &raw mut names,
            )
        };
        // SAFETY: server-allocated array of `count` strings.
        let names = unsafe { ForeignStrings::new(alloc, names, out_count(count)) };
        check("QuerySubConditionNames", hr)?;
        Ok(names.read("ppszSubConditionNames")?)
    }

    pub fn query_source_conditions(
        &self,
        alloc: &dyn ForeignAllocator,
        source: &str,
    ) -> Result<Vec<String>, Error> {
        let source = WideString::new(source)?;
        let mut count = 0u32;
        let mut names: *mut *mut u16 = std::ptr::null_mut();
        // SAFETY: live object; `source` outlives the call.
        let hr = unsafe {
            (self.vtable().query_source_conditions)(
                self.as_raw(),
                source.as_ptr(),
                &raw mut count,
                &raw mut names,
            )
        };
        // SAFETY: server-allocated array of `count` strings.
        let names = unsafe { ForeignStrings::new(alloc, names, out_count(count)) };
        check("QuerySourceConditions", hr)?;
        Ok(names.read("ppszConditionNames")?)
    }

    pub fn query_event_attributes(
        &self,
        alloc: &dyn ForeignAllocator,
        event_category: u32,
    ) -> Result<Vec<EventAttribute>, Error> {
        let mut count = 0u32;
        let mut ids: *mut u32 = std::ptr::null_mut();
        let mut descs: *mut *mut u16 = std::ptr::null_mut();
        let mut types: *mut u16 = std::ptr::null_mut();
        // SAFETY: live object; out-pointers valid for the call.
        let hr = unsafe {
            (self.vtable().query_event_attributes)(
                self.as_raw(),
                event_category,
                &raw mut count,
                &raw mut ids,
                &raw mut descs,
                &raw mut types,
            )
        };
        let n = out_count(count);
        // SAFETY: three server-allocated arrays of `count` entries each.
        let (ids, descs, types) = unsafe {
            (
                ForeignBlock::array(alloc, ids, n),
                ForeignStrings::new(alloc, descs, n),
                ForeignBlock::array(alloc, types, n),
            )
        };
        check("QueryEventAttributes", hr)?;

        let ids = ids.to_vec("ppdwAttrIDs")?;
        let descs = descs.read("ppszAttrDescs")?;
        let types = types.to_vec("ppvtAttrTypes")?;
        Ok(ids
            .into_iter()
            .zip(descs)
            .zip(types)
            .map(|((id, description), vt)| EventAttribute {
                id,
                description,
                var_type: VarType(vt),
            })
            .collect())
    }

    pub fn get_condition_state(
        &self,
        alloc: &dyn ForeignAllocator,
        source: &str,
        condition: &str,
        attribute_ids: &[u32],
    ) -> Result<ConditionState, Error> {
        let source = WideString::new(source)?;
        let condition = WideString::new(condition)?;
        let count = u32::try_from(attribute_ids.len()).map_err(|_| Error::InvalidArgument {
            message: format!("{} attribute ids exceed a DWORD count", attribute_ids.len()),
        })?;
        let ids = if attribute_ids.is_empty() {
            std::ptr::null()
        } else {
            attribute_ids.as_ptr()
        };
        let mut state: *mut RawConditionState = std::ptr::null_mut();
        // SAFETY: live object; inputs outlive the call, `state` is a valid
        // out-pointer.
        let hr = unsafe {
            (self.vtable().get_condition_state)(
                self.as_raw(),
                source.as_ptr(),
                condition.as_ptr(),
                count,
                ids,
                &raw mut state,
            )
        };
        if let Err(err) = check("GetConditionState", hr) {
            if !state.is_null() {
                // SAFETY: the server handed over a structure anyway; release it.
                drop(unsafe { take_condition_state(alloc, state) });
            }
            return Err(err);
        }
        // SAFETY: on success `state` is a server-allocated OPCCONDITIONSTATE.
        Ok(unsafe { take_condition_state(alloc, state) }?)
    }

    pub fn enable_conditions_by_area<S: AsRef<str>>(&self, areas: &[S]) -> Result<(), Error> {
        self.name_list_call("EnableConditionByArea", self.vtable().enable_condition_by_area, areas)
    }

    pub fn enable_conditions_by_source<S: AsRef<str>>(&self, sources: &[S]) -> Result<(), Error> {
        self.name_list_call(
            "EnableConditionBySource",
            self.vtable().enable_condition_by_source,
            sources,
        )
    }

    pub fn disable_conditions_by_area<S: AsRef<str>>(&self, areas: &[S]) -> Result<(), Error> {
        self.name_list_call("DisableConditionByArea", self.vtable().disable_condition_by_area, areas)
    }

    pub fn disable_conditions_by_source<S: AsRef<str>>(&self, sources: &[S]) -> Result<(), Error> {
        self.name_list_call(
            "DisableConditionBySource",
            self.vtable().disable_condition_by_source,
            sources,
        )
    }

    fn name_list_call<S: AsRef<str>>(
        &self,
        operation: &'static str,
        call: NameListCall,
        names: &[S],
    ) -> Result<(), Error> {
        let names = WideStringList::new(names)?;
        // SAFETY: live object; the pointer array outlives the call.
        let hr = unsafe { call(self.as_raw(), names.count()?, names.as_ptr()) };
        check(operation, hr)?;
        Ok(())
    }

    /// Acknowledge condition occurrences. A failed call yields no per-item
    /// results at all; otherwise there is one outcome per target, in order.
    pub fn ack_condition(
        &self,
        alloc: &dyn ForeignAllocator,
        acknowledger: &str,
        comment: &str,
        targets: &[AckTarget],
    ) -> Result<Vec<AckOutcome>, Error> {
        if targets.is_empty() {
            return Ok(Vec::new());
        }
        let acknowledger = WideString::new(acknowledger)?;
        let comment = WideString::new(comment)?;
        let sources = WideStringList::new(&targets.iter().map(|t| t.source.as_str()).collect::<Vec<_>>())?;
        let conditions =
            WideStringList::new(&targets.iter().map(|t| t.condition.as_str()).collect::<Vec<_>>())?;
        let active_times = targets
            .iter()
            .map(|t| t.active_time.map_or(Ok(FileTime::default()), FileTime::from_utc))
            .collect::<Result<Vec<_>, _>>()?;
        let cookies: Vec<u32> = targets.iter().map(|t| t.cookie).collect();
        let count = sources.count()?;

        let mut errors: *mut Hresult = std::ptr::null_mut();
        // SAFETY: live object; all four input arrays hold `count` entries and
        // outlive the call.
        let hr = unsafe {
            (self.vtable().ack_condition)(
                self.as_raw(),
                count,
                acknowledger.as_ptr(),
                comment.as_ptr(),
                sources.as_ptr(),
                conditions.as_ptr(),
                active_times.as_ptr(),
                cookies.as_ptr(),
                &raw mut errors,
            )
        };
        // SAFETY: server-allocated array of `count` result codes.
        let errors = unsafe { ForeignBlock::array(alloc, errors, targets.len()) };
        if let Err(err) = check("AckCondition", hr) {
            if !errors.as_ptr().is_null() {
                warn!(hresult = %hr, "AckCondition failed; discarding per-item results");
            }
            return Err(err);
        }
        let outcomes: Vec<AckOutcome> = errors
            .to_vec("ppErrors")?
            .into_iter()
            .map(AckOutcome::from)
            .collect();
        debug!(count, "conditions acknowledged");
        Ok(outcomes)
    }
}
