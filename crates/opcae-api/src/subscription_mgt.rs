// ── IOPCEventSubscriptionMgt ──

use std::ffi::c_void;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::com::{ComPtr, IUnknownVtbl, Interface};
use crate::error::{Error, check};
use crate::guid::{Guid, IID_IOPC_EVENT_SUBSCRIPTION_MGT};
use crate::hresult::Hresult;
use crate::memory::{ForeignAllocator, ForeignBlock, ForeignStrings};
use crate::types::{EventTypeMask, SubscriptionFilter, SubscriptionState};
use crate::wide::WideStringList;

type StringArrayOut = *mut *mut *mut u16;

#[repr(C)]
pub struct IOPCEventSubscriptionMgtVtbl {
    pub base: IUnknownVtbl,
    pub set_filter: unsafe extern "system" fn(
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
    ) -> Hresult,
    pub get_filter: unsafe extern "system" fn(
        this: *mut c_void,
        event_type: *mut u32,
        num_categories: *mut u32,
        event_categories: *mut *mut u32,
        low_severity: *mut u32,
        high_severity: *mut u32,
        num_areas: *mut u32,
        area_list: StringArrayOut,
        num_sources: *mut u32,
        source_list: StringArrayOut,
    ) -> Hresult,
    pub select_returned_attributes: unsafe extern "system" fn(
        this: *mut c_void,
        event_category: u32,
        count: u32,
        attribute_ids: *const u32,
    ) -> Hresult,
    pub get_returned_attributes: unsafe extern "system" fn(
        this: *mut c_void,
        event_category: u32,
        count: *mut u32,
        attribute_ids: *mut *mut u32,
    ) -> Hresult,
    pub refresh: unsafe extern "system" fn(this: *mut c_void, connection: u32) -> Hresult,
    pub cancel_refresh: unsafe extern "system" fn(this: *mut c_void, connection: u32) -> Hresult,
    pub get_state: unsafe extern "system" fn(
        this: *mut c_void,
        active: *mut i32,
        buffer_time: *mut u32,
        max_size: *mut u32,
        client_subscription: *mut u32,
    ) -> Hresult,
    pub set_state: unsafe extern "system" fn(
        this: *mut c_void,
        active: *const i32,
        buffer_time: *const u32,
        max_size: *const u32,
        client_subscription: u32,
        revised_buffer_time: *mut u32,
        revised_max_size: *mut u32,
    ) -> Hresult,
}

pub enum IOPCEventSubscriptionMgt {}

// SAFETY: vtable starts with IUnknownVtbl and follows the published slot order.
unsafe impl Interface for IOPCEventSubscriptionMgt {
    const IID: Guid = IID_IOPC_EVENT_SUBSCRIPTION_MGT;
    type Vtable = IOPCEventSubscriptionMgtVtbl;
}

/// Fields of a `SetState` call; `None` leaves the server's value unchanged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateUpdate {
    pub active: Option<bool>,
    pub buffer_time_ms: Option<u32>,
    pub max_size: Option<u32>,
}

/// Buffer time and max size as granted by the server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisedState {
    pub buffer_time_ms: u32,
    pub max_size: u32,
}

fn dword_count(len: usize, what: &str) -> Result<u32, Error> {
    u32::try_from(len).map_err(|_| Error::InvalidArgument {
        message: format!("{len} {what} exceed a DWORD count"),
    })
}

fn ptr_or_null<T>(items: &[T]) -> *const T {
    if items.is_empty() {
        std::ptr::null()
    } else {
        items.as_ptr()
    }
}

impl ComPtr<IOPCEventSubscriptionMgt> {
    pub fn set_filter(&self, filter: &SubscriptionFilter) -> Result<(), Error> {
        let categories = &filter.categories;
        let areas = WideStringList::new(&filter.areas)?;
        let sources = WideStringList::new(&filter.sources)?;
        // SAFETY: live object; every array outlives the call and its count
        // matches its length.
        let hr = unsafe {
            (self.vtable().set_filter)(
                self.as_raw(),
                filter.event_types.bits(),
                dword_count(categories.len(), "categories")?,
                ptr_or_null(categories),
                filter.low_severity,
                filter.high_severity,
                areas.count()?,
                areas.as_ptr(),
                sources.count()?,
                sources.as_ptr(),
            )
        };
        check("SetFilter", hr)?;
        debug!(
            event_types = filter.event_types.bits(),
            categories = categories.len(),
            low = filter.low_severity,
            high = filter.high_severity,
            "filter set"
        );
        Ok(())
    }

    /// The filter as the server holds it, which may be narrower than what was
    /// last requested.
    pub fn get_filter(&self, alloc: &dyn ForeignAllocator) -> Result<SubscriptionFilter, Error> {
        let mut event_type = 0u32;
        let mut num_categories = 0u32;
        let mut categories: *mut u32 = std::ptr::null_mut();
        let mut low = 0u32;
        let mut high = 0u32;
        let mut num_areas = 0u32;
        let mut areas: *mut *mut u16 = std::ptr::null_mut();
        let mut num_sources = 0u32;
        let mut sources: *mut *mut u16 = std::ptr::null_mut();
        // SAFETY: live object; out-pointers valid for the call.
        let hr = unsafe {
            (self.vtable().get_filter)(
                self.as_raw(),
                &raw mut event_type,
                &raw mut num_categories,
                &raw mut categories,
                &raw mut low,
                &raw mut high,
                &raw mut num_areas,
                &raw mut areas,
                &raw mut num_sources,
                &raw mut sources,
            )
        };
        let count = |n: u32| usize::try_from(n).unwrap_or(usize::MAX);
        // SAFETY: three server-allocated arrays with their sibling counts.
        let (categories, areas, sources) = unsafe {
            (
                ForeignBlock::array(alloc, categories, count(num_categories)),
                ForeignStrings::new(alloc, areas, count(num_areas)),
                ForeignStrings::new(alloc, sources, count(num_sources)),
            )
        };
        check("GetFilter", hr)?;

        Ok(SubscriptionFilter {
            event_types: EventTypeMask::from_bits(event_type, "pdwEventType")?,
            categories: categories.to_vec("ppdwEventCategories")?,
            low_severity: low,
            high_severity: high,
            areas: areas.read("ppszAreaList")?,
            sources: sources.read("ppszSourceList")?,
        })
    }

    pub fn select_returned_attributes(&self, category: u32, attribute_ids: &[u32]) -> Result<(), Error> {
        // SAFETY: live object; `attribute_ids` outlives the call.
        let hr = unsafe {
            (self.vtable().select_returned_attributes)(
                self.as_raw(),
                category,
                dword_count(attribute_ids.len(), "attribute ids")?,
                ptr_or_null(attribute_ids),
            )
        };
        check("SelectReturnedAttributes", hr)?;
        Ok(())
    }

    pub fn get_returned_attributes(
        &self,
        alloc: &dyn ForeignAllocator,
        category: u32,
    ) -> Result<Vec<u32>, Error> {
        let mut count = 0u32;
        let mut ids: *mut u32 = std::ptr::null_mut();
        // SAFETY: live object; out-pointers valid for the call.
        let hr = unsafe {
            (self.vtable().get_returned_attributes)(self.as_raw(), category, &raw mut count, &raw mut ids)
        };
        // SAFETY: server-allocated array of `count` ids.
        let ids = unsafe { ForeignBlock::array(alloc, ids, usize::try_from(count).unwrap_or(usize::MAX)) };
        check("GetReturnedAttributes", hr)?;
        Ok(ids.to_vec("ppdwAttributeIDs")?)
    }

    /// Ask for a replay of current condition state to the sink advised under
    /// `connection`.
    pub fn refresh(&self, connection: u32) -> Result<(), Error> {
        // SAFETY: live object.
        let hr = unsafe { (self.vtable().refresh)(self.as_raw(), connection) };
        check("Refresh", hr)?;
        Ok(())
    }

    pub fn cancel_refresh(&self, connection: u32) -> Result<(), Error> {
        // SAFETY: live object.
        let hr = unsafe { (self.vtable().cancel_refresh)(self.as_raw(), connection) };
        check("CancelRefresh", hr)?;
        Ok(())
    }

    pub fn get_state(&self) -> Result<SubscriptionState, Error> {
        let mut active = 0i32;
        let mut buffer_time_ms = 0u32;
        let mut max_size = 0u32;
        let mut client_handle = 0u32;
        // SAFETY: live object; out-pointers valid for the call.
        let hr = unsafe {
            (self.vtable().get_state)(
                self.as_raw(),
                &raw mut active,
                &raw mut buffer_time_ms,
                &raw mut max_size,
                &raw mut client_handle,
            )
        };
        check("GetState", hr)?;
        Ok(SubscriptionState {
            active: active != 0,
            buffer_time_ms,
            max_size,
            client_handle,
        })
    }

    pub fn set_state(&self, update: StateUpdate, client_handle: u32) -> Result<RevisedState, Error> {
        let active = update.active.map(i32::from);
        let mut revised = RevisedState::default();
        // SAFETY: live object; each optional input is null or points at a
        // local that outlives the call.
        let hr = unsafe {
            (self.vtable().set_state)(
                self.as_raw(),
                active.as_ref().map_or(std::ptr::null(), std::ptr::from_ref),
                update.buffer_time_ms.as_ref().map_or(std::ptr::null(), std::ptr::from_ref),
                update.max_size.as_ref().map_or(std::ptr::null(), std::ptr::from_ref),
                client_handle,
                &raw mut revised.buffer_time_ms,
                &raw mut revised.max_size,
            )
        };
        let hr = check("SetState", hr)?;
        if hr != Hresult::S_OK {
            debug!(client_handle, hresult = %hr, ?revised, "state revised by server");
        }
        Ok(revised)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::fake::{FakeEventServer, MIN_BUFFER_TIME_MS};
    use crate::types::EventType;

    fn subscription(server: &FakeEventServer) -> ComPtr<IOPCEventSubscriptionMgt> {
        let (unk, _) = server
            .server_ptr()
            .create_event_subscription(true, 1000, 0, 42)
            .unwrap();
        unk.query_interface().unwrap()
    }

    #[test]
    fn filter_reads_back_as_the_server_holds_it() {
        let server = FakeEventServer::new();
        let mgt = subscription(&server);
        let requested = SubscriptionFilter::default()
            .with_event_types(EventType::Condition)
            .with_categories([0x100, 0x101])
            .with_severity(0, 5000)
            .with_areas(["Plant/North"])
            .with_sources(["Tank1", "Tank2"]);
        mgt.set_filter(&requested).unwrap();

        let held = mgt.get_filter(server.allocator()).unwrap();
        assert_eq!(held.low_severity, 1);
        assert_eq!(held.high_severity, 1000);
        assert_eq!(held.categories, vec![0x100, 0x101]);
        assert_eq!(held.sources, vec!["Tank1".to_string(), "Tank2".to_string()]);
        assert_eq!(held.event_types.types(), vec![EventType::Condition]);
        assert_eq!(server.allocator().outstanding(), 0);
    }

    #[test]
    fn inverted_severity_range_is_rejected() {
        let server = FakeEventServer::new();
        let mgt = subscription(&server);
        let err = mgt
            .set_filter(&SubscriptionFilter::default().with_severity(800, 200))
            .unwrap_err();
        assert_eq!(err.hresult(), Some(Hresult::E_INVALIDARG));
    }

    #[test]
    fn set_state_leaves_unspecified_fields_alone() {
        let server = FakeEventServer::new();
        let mgt = subscription(&server);
        let revised = mgt
            .set_state(
                StateUpdate {
                    buffer_time_ms: Some(10),
                    ..StateUpdate::default()
                },
                42,
            )
            .unwrap();
        assert_eq!(revised.buffer_time_ms, MIN_BUFFER_TIME_MS);

        let state = mgt.get_state().unwrap();
        assert!(state.active);
        assert_eq!(state.buffer_time_ms, MIN_BUFFER_TIME_MS);
        assert_eq!(state.client_handle, 42);
    }

    #[test]
    fn returned_attributes_are_per_category() {
        let server = FakeEventServer::new();
        let mgt = subscription(&server);
        mgt.select_returned_attributes(0x100, &[1, 2, 3]).unwrap();
        assert_eq!(
            mgt.get_returned_attributes(server.allocator(), 0x100).unwrap(),
            vec![1, 2, 3]
        );
        assert!(mgt
            .get_returned_attributes(server.allocator(), 0x200)
            .unwrap()
            .is_empty());
        assert_eq!(server.allocator().outstanding(), 0);
    }

    #[test]
    fn refresh_needs_an_advised_connection() {
        let server = FakeEventServer::new();
        let mgt = subscription(&server);
        assert_eq!(mgt.refresh(7).unwrap_err().hresult(), Some(Hresult::E_INVALIDARG));
        assert!(mgt.cancel_refresh(7).is_err());
    }
}
