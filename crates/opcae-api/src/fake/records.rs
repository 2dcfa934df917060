// ── Record builders ──
//
// Build notification records and condition snapshots the way a server would
// lay them out, with every nested block taken from a `CountingAllocator`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::condition::{RawConditionState, SubCondition};
use crate::error::Error;
use crate::event::RawOnEventStruct;
use crate::hresult::Hresult;
use crate::memory::ForeignAllocator;
use crate::time::FileTime;
use crate::types::{ChangeKind, ChangeMask, ConditionFlags, EventType};
use crate::variant::{RawVariant, VarType, Variant};

use super::alloc::CountingAllocator;

/// A tag no decoder accepts; stands in for a server sending garbage.
const CORRUPT_TAG: u16 = VarType::RECORD.0;

fn corrupt_variant() -> RawVariant {
    RawVariant {
        vt: CORRUPT_TAG,
        ..RawVariant::empty()
    }
}

fn file_time(time: Option<DateTime<Utc>>) -> Result<FileTime, Error> {
    time.map_or(Ok(FileTime::default()), FileTime::from_utc)
}

// ── Events ──────────────────────────────────────────────────────────

/// Builder for one `ONEVENTSTRUCT`.
#[derive(Debug, Clone)]
pub struct FakeEvent {
    pub(crate) event_type: EventType,
    pub(crate) source: String,
    pub(crate) condition: String,
    pub(crate) subcondition: String,
    pub(crate) time: DateTime<Utc>,
    pub(crate) message: String,
    pub(crate) category: u32,
    pub(crate) severity: u32,
    change_mask: ChangeMask,
    new_state: u16,
    quality: u16,
    ack_required: bool,
    active_time: Option<DateTime<Utc>>,
    cookie: u32,
    actor: String,
    attributes: Vec<Variant>,
    corrupt: bool,
}

impl FakeEvent {
    fn base(event_type: EventType, source: String, time: DateTime<Utc>) -> Self {
        Self {
            event_type,
            source,
            condition: String::new(),
            subcondition: String::new(),
            time,
            message: String::new(),
            category: 1,
            severity: 500,
            change_mask: ChangeMask(0),
            new_state: 0,
            quality: 0xC0,
            ack_required: false,
            active_time: None,
            cookie: 0,
            actor: String::new(),
            attributes: Vec::new(),
            corrupt: false,
        }
    }

    pub fn simple(source: impl Into<String>, time: DateTime<Utc>) -> Self {
        Self::base(EventType::Simple, source.into(), time)
    }

    pub fn tracking(source: impl Into<String>, actor: impl Into<String>, time: DateTime<Utc>) -> Self {
        Self::base(EventType::Tracking, source.into(), time).actor(actor)
    }

    /// A condition transition: active and unacknowledged unless changed.
    pub fn condition(source: impl Into<String>, condition: impl Into<String>, time: DateTime<Utc>) -> Self {
        let mut event = Self::base(EventType::Condition, source.into(), time);
        event.condition = condition.into();
        event.new_state = ConditionFlags::ENABLED | ConditionFlags::ACTIVE;
        event.ack_required = true;
        event
    }

    #[must_use]
    pub fn subcondition(mut self, name: impl Into<String>) -> Self {
        self.subcondition = name.into();
        self
    }

    #[must_use]
    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    #[must_use]
    pub fn severity(mut self, severity: u32) -> Self {
        self.severity = severity;
        self
    }

    #[must_use]
    pub fn category(mut self, category: u32) -> Self {
        self.category = category;
        self
    }

    #[must_use]
    pub fn cookie(mut self, cookie: u32) -> Self {
        self.cookie = cookie;
        self
    }

    #[must_use]
    pub fn actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }

    #[must_use]
    pub fn active_time(mut self, time: DateTime<Utc>) -> Self {
        self.active_time = Some(time);
        self
    }

    #[must_use]
    pub fn state(mut self, flags: u16) -> Self {
        self.new_state = flags;
        self
    }

    #[must_use]
    pub fn ack_required(mut self, required: bool) -> Self {
        self.ack_required = required;
        self
    }

    #[must_use]
    pub fn changes(mut self, kinds: &[ChangeKind]) -> Self {
        self.change_mask = kinds.iter().copied().collect();
        self
    }

    #[must_use]
    pub fn attribute(mut self, value: Variant) -> Self {
        self.attributes.push(value);
        self
    }

    /// Append an attribute whose VARIANT tag no decoder accepts.
    #[must_use]
    pub fn corrupt_attribute(mut self) -> Self {
        self.corrupt = true;
        self
    }

    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Lay the record out with every string and the attribute array taken
    /// from `alloc`. Pair with [`FakeEvent::release`].
    pub fn encode(&self, alloc: &CountingAllocator) -> Result<RawOnEventStruct, Error> {
        let time = FileTime::from_utc(self.time)?;
        let active_time = file_time(self.active_time)?;

        let mut attributes: Vec<RawVariant> = self.attributes.iter().map(|v| alloc.alloc_variant(v)).collect();
        if self.corrupt {
            attributes.push(corrupt_variant());
        }
        let num_event_attrs = u32::try_from(attributes.len()).map_err(|_| Error::InvalidArgument {
            message: "too many attributes".into(),
        })?;

        Ok(RawOnEventStruct {
            change_mask: self.change_mask.0,
            new_state: self.new_state,
            source: alloc.alloc_wstr(&self.source),
            time,
            message: alloc.alloc_wstr(&self.message),
            event_type: self.event_type.bit(),
            event_category: self.category,
            severity: self.severity,
            condition_name: alloc.alloc_wstr(&self.condition),
            subcondition_name: alloc.alloc_wstr(&self.subcondition),
            quality: self.quality,
            reserved: 0,
            ack_required: i32::from(self.ack_required),
            active_time,
            cookie: self.cookie,
            num_event_attrs,
            event_attributes: alloc.alloc_array(&attributes),
            actor_id: alloc.alloc_wstr(&self.actor),
        })
    }

    /// Free everything [`encode`](Self::encode) allocated for `raw`.
    pub fn release(alloc: &CountingAllocator, raw: RawOnEventStruct) {
        let count = usize::try_from(raw.num_event_attrs).unwrap_or(0);
        // SAFETY: every pointer in `raw` came from `alloc` via `encode`, and
        // the attribute array holds `count` initialized VARIANTs.
        unsafe {
            for s in [
                raw.source,
                raw.message,
                raw.condition_name,
                raw.subcondition_name,
                raw.actor_id,
            ] {
                alloc.free(s.cast());
            }
            if !raw.event_attributes.is_null() {
                for i in 0..count {
                    alloc.clear_variant(raw.event_attributes.add(i));
                }
            }
            alloc.free(raw.event_attributes.cast());
        }
    }
}

// ── Conditions ──────────────────────────────────────────────────────

/// A condition as the fake server tracks it, plus the `OPCCONDITIONSTATE`
/// encoder for `GetConditionState`.
#[derive(Debug, Clone)]
pub struct FakeCondition {
    pub(crate) source: String,
    pub(crate) condition: String,
    pub(crate) flags: u16,
    pub(crate) cookie: u32,
    pub(crate) category: u32,
    subconditions: Vec<SubCondition>,
    active: String,
    quality: u16,
    acknowledger: String,
    comment: String,
    last_ack: Option<DateTime<Utc>>,
    last_active: Option<DateTime<Utc>>,
    last_inactive: Option<DateTime<Utc>>,
    attributes: BTreeMap<u32, Variant>,
    corrupt: Vec<u32>,
}

impl FakeCondition {
    /// Enabled, active and unacknowledged, with no sub-conditions.
    pub fn new(source: impl Into<String>, condition: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            condition: condition.into(),
            flags: ConditionFlags::ENABLED | ConditionFlags::ACTIVE,
            cookie: 0,
            category: 1,
            subconditions: Vec::new(),
            active: String::new(),
            quality: 0xC0,
            acknowledger: String::new(),
            comment: String::new(),
            last_ack: None,
            last_active: None,
            last_inactive: None,
            attributes: BTreeMap::new(),
            corrupt: Vec::new(),
        }
    }

    #[must_use]
    pub fn flags(mut self, flags: u16) -> Self {
        self.flags = flags;
        self
    }

    #[must_use]
    pub fn subcondition(
        mut self,
        name: impl Into<String>,
        definition: impl Into<String>,
        severity: u32,
        description: impl Into<String>,
    ) -> Self {
        self.subconditions.push(SubCondition {
            name: name.into(),
            definition: definition.into(),
            severity,
            description: description.into(),
        });
        self
    }

    #[must_use]
    pub fn active(mut self, name: impl Into<String>) -> Self {
        self.active = name.into();
        self
    }

    /// Mark acknowledged, recording who did it. The ack time stays unset.
    #[must_use]
    pub fn acked_by(mut self, acknowledger: impl Into<String>, comment: impl Into<String>) -> Self {
        self.flags |= ConditionFlags::ACKED;
        self.acknowledger = acknowledger.into();
        self.comment = comment.into();
        self
    }

    #[must_use]
    pub fn acked(mut self) -> Self {
        self.flags |= ConditionFlags::ACKED;
        self
    }

    #[must_use]
    pub fn last_active(mut self, time: DateTime<Utc>) -> Self {
        self.last_active = Some(time);
        self
    }

    #[must_use]
    pub fn last_inactive(mut self, time: DateTime<Utc>) -> Self {
        self.last_inactive = Some(time);
        self
    }

    #[must_use]
    pub fn attribute(mut self, id: u32, value: Variant) -> Self {
        self.attributes.insert(id, value);
        self
    }

    /// Report attribute `id` as a success carrying an undecodable VARIANT.
    #[must_use]
    pub fn corrupt_attribute(mut self, id: u32) -> Self {
        self.corrupt.push(id);
        self
    }

    #[must_use]
    pub fn cookie(mut self, cookie: u32) -> Self {
        self.cookie = cookie;
        self
    }

    #[must_use]
    pub fn category(mut self, category: u32) -> Self {
        self.category = category;
        self
    }

    pub fn is_acked(&self) -> bool {
        ConditionFlags(self.flags).is_acked()
    }

    pub(crate) fn acknowledge(&mut self, acknowledger: &str, comment: &str, at: DateTime<Utc>) {
        self.flags |= ConditionFlags::ACKED;
        self.acknowledger = acknowledger.to_owned();
        self.comment = comment.to_owned();
        self.last_ack = Some(at);
    }

    pub(crate) fn subcondition_names(&self) -> impl Iterator<Item = &str> {
        self.subconditions.iter().map(|sc| sc.name.as_str())
    }

    fn active_subcondition(&self) -> SubCondition {
        self.subconditions
            .iter()
            .find(|sc| sc.name == self.active)
            .cloned()
            .unwrap_or_else(|| SubCondition {
                name: self.active.clone(),
                definition: String::new(),
                severity: 500,
                description: String::new(),
            })
    }

    /// The notification a server sends for this condition during a refresh.
    pub fn to_event(&self, time: DateTime<Utc>) -> FakeEvent {
        let active = self.active_subcondition();
        let mut event = FakeEvent::condition(self.source.clone(), self.condition.clone(), time)
            .subcondition(active.name)
            .severity(active.severity)
            .category(self.category)
            .cookie(self.cookie)
            .state(self.flags)
            .ack_required(!self.is_acked())
            .message(active.description);
        if let Some(t) = self.last_active {
            event = event.active_time(t);
        }
        event
    }

    /// Lay out an `OPCCONDITIONSTATE` answering for `attribute_ids`. Ids the
    /// condition does not carry get `OPC_E_INVALIDITEMID` and an empty value.
    pub fn encode_state(
        &self,
        alloc: &CountingAllocator,
        attribute_ids: &[u32],
    ) -> Result<*mut RawConditionState, Error> {
        let active = self.active_subcondition();
        let num_scs = u32::try_from(self.subconditions.len()).map_err(|_| Error::InvalidArgument {
            message: "too many sub-conditions".into(),
        })?;
        let num_event_attrs = u32::try_from(attribute_ids.len()).map_err(|_| Error::InvalidArgument {
            message: "too many attribute ids".into(),
        })?;

        let mut values = Vec::with_capacity(attribute_ids.len());
        let mut errors = Vec::with_capacity(attribute_ids.len());
        for id in attribute_ids {
            if self.corrupt.contains(id) {
                values.push(corrupt_variant());
                errors.push(Hresult::S_OK);
            } else if let Some(value) = self.attributes.get(id) {
                values.push(alloc.alloc_variant(value));
                errors.push(Hresult::S_OK);
            } else {
                values.push(RawVariant::empty());
                errors.push(Hresult::OPC_E_INVALIDITEMID);
            }
        }

        let names: Vec<&str> = self.subconditions.iter().map(|sc| sc.name.as_str()).collect();
        let definitions: Vec<&str> = self.subconditions.iter().map(|sc| sc.definition.as_str()).collect();
        let descriptions: Vec<&str> = self.subconditions.iter().map(|sc| sc.description.as_str()).collect();
        let severities: Vec<u32> = self.subconditions.iter().map(|sc| sc.severity).collect();

        let raw = RawConditionState {
            state: self.flags,
            reserved1: 0,
            active_subcondition: alloc.alloc_wstr(&active.name),
            asc_definition: alloc.alloc_wstr(&active.definition),
            asc_severity: active.severity,
            asc_description: alloc.alloc_wstr(&active.description),
            quality: self.quality,
            reserved2: 0,
            last_ack_time: file_time(self.last_ack)?,
            subcond_last_active: file_time(self.last_active)?,
            cond_last_active: file_time(self.last_active)?,
            cond_last_inactive: file_time(self.last_inactive)?,
            acknowledger_id: alloc.alloc_wstr(&self.acknowledger),
            comment: alloc.alloc_wstr(&self.comment),
            num_scs,
            sc_names: alloc.alloc_wstr_array(&names),
            sc_definitions: alloc.alloc_wstr_array(&definitions),
            sc_severities: alloc.alloc_array(&severities),
            sc_descriptions: alloc.alloc_wstr_array(&descriptions),
            num_event_attrs,
            event_attributes: alloc.alloc_array(&values),
            errors: alloc.alloc_array(&errors),
        };
        Ok(alloc.alloc_value(raw))
    }
}
