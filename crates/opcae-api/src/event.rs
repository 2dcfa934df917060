// ── Notification records (ONEVENTSTRUCT) ──

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::DecodeError;
use crate::memory::{decode_variants, foreign_slice};
use crate::time::FileTime;
use crate::types::{ChangeMask, ConditionFlags, EventType};
use crate::variant::{RawVariant, Variant};
use crate::wide::read_wide;

/// One notification record as the server lays it out.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawOnEventStruct {
    pub change_mask: u16,
    pub new_state: u16,
    pub source: *mut u16,
    pub time: FileTime,
    pub message: *mut u16,
    pub event_type: u32,
    pub event_category: u32,
    pub severity: u32,
    pub condition_name: *mut u16,
    pub subcondition_name: *mut u16,
    pub quality: u16,
    pub reserved: u16,
    pub ack_required: i32,
    pub active_time: FileTime,
    pub cookie: u32,
    pub num_event_attrs: u32,
    pub event_attributes: *mut RawVariant,
    pub actor_id: *mut u16,
}

impl Default for RawOnEventStruct {
    fn default() -> Self {
        Self {
            change_mask: 0,
            new_state: 0,
            source: std::ptr::null_mut(),
            time: FileTime::default(),
            message: std::ptr::null_mut(),
            event_type: 0,
            event_category: 0,
            severity: 0,
            condition_name: std::ptr::null_mut(),
            subcondition_name: std::ptr::null_mut(),
            quality: 0,
            reserved: 0,
            ack_required: 0,
            active_time: FileTime::default(),
            cookie: 0,
            num_event_attrs: 0,
            event_attributes: std::ptr::null_mut(),
            actor_id: std::ptr::null_mut(),
        }
    }
}

/// One notified occurrence, fully owned.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventRecord {
    pub change_mask: ChangeMask,
    pub new_state: ConditionFlags,
    pub source: String,
    pub time: DateTime<Utc>,
    pub message: String,
    pub event_type: EventType,
    pub category: u32,
    /// 1..=1000.
    pub severity: u32,
    pub condition: String,
    pub subcondition: String,
    pub quality: u16,
    pub ack_required: bool,
    /// `None` when the server sent a zero FILETIME.
    pub active_time: Option<DateTime<Utc>>,
    /// Correlation token for acknowledging this transition.
    pub cookie: u32,
    pub attributes: Vec<Variant>,
    pub actor_id: String,
}

impl EventRecord {
    /// Copy one raw record into owned form.
    ///
    /// # Safety
    ///
    /// Every pointer in `raw` must be null or valid for reads (strings
    /// NUL-terminated, the attribute array holding `num_event_attrs`
    /// initialized VARIANTs) for the duration of the call.
    pub unsafe fn decode(raw: &RawOnEventStruct) -> Result<Self, DecodeError> {
        let count = usize::try_from(raw.num_event_attrs).unwrap_or(usize::MAX);
        // SAFETY: caller contract on the attribute array.
        let attributes = unsafe { foreign_slice(raw.event_attributes, count, "pEventAttributes") }?;

        // SAFETY: caller contract on each string pointer.
        let (source, message, condition, subcondition, actor_id) = unsafe {
            (
                read_wide(raw.source, "szSource")?,
                read_wide(raw.message, "szMessage")?,
                read_wide(raw.condition_name, "szConditionName")?,
                read_wide(raw.subcondition_name, "szSubconditionName")?,
                read_wide(raw.actor_id, "szActorID")?,
            )
        };

        Ok(Self {
            change_mask: ChangeMask(raw.change_mask),
            new_state: ConditionFlags(raw.new_state),
            source,
            time: raw.time.to_utc("ftTime")?,
            message,
            event_type: EventType::from_bits(raw.event_type, "dwEventType")?,
            category: raw.event_category,
            severity: raw.severity,
            condition,
            subcondition,
            quality: raw.quality,
            ack_required: raw.ack_required != 0,
            active_time: raw.active_time.to_utc_opt("ftActiveTime")?,
            cookie: raw.cookie,
            attributes: decode_variants(attributes)?,
            actor_id,
        })
    }
}

/// The unit handed to consumers: every record from one `OnEvent` call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventBatch {
    client_handle: u32,
    refresh: bool,
    last_refresh: bool,
    records: Vec<EventRecord>,
}

impl EventBatch {
    /// A batch marked `last_refresh` is always a refresh batch as well.
    pub fn new(
        client_handle: u32,
        refresh: bool,
        last_refresh: bool,
        records: Vec<EventRecord>,
    ) -> Self {
        Self {
            client_handle,
            refresh: refresh || last_refresh,
            last_refresh,
            records,
        }
    }

    /// Decode the raw record array of one callback. Any failing record
    /// rejects the whole batch.
    ///
    /// # Safety
    ///
    /// `events` must be null or point to `count` records satisfying the
    /// contract of [`EventRecord::decode`].
    pub unsafe fn decode(
        client_handle: u32,
        refresh: bool,
        last_refresh: bool,
        count: u32,
        events: *const RawOnEventStruct,
    ) -> Result<Self, DecodeError> {
        let count = usize::try_from(count).unwrap_or(usize::MAX);
        // SAFETY: caller contract.
        let raw = unsafe { foreign_slice(events, count, "pEvents") }?;
        let records = raw
            .iter()
            .enumerate()
            .map(|(index, r)| {
                // SAFETY: caller contract, per record.
                unsafe { EventRecord::decode(r) }.map_err(|source| DecodeError::Record {
                    index,
                    source: Box::new(source),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(client_handle, refresh, last_refresh, records))
    }

    pub fn client_handle(&self) -> u32 {
        self.client_handle
    }

    pub fn is_refresh(&self) -> bool {
        self.refresh
    }

    pub fn is_last_refresh(&self) -> bool {
        self.last_refresh
    }

    pub fn records(&self) -> &[EventRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn into_records(self) -> Vec<EventRecord> {
        self.records
    }
}
