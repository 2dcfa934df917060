// ── Condition snapshots (OPCCONDITIONSTATE) ──

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::DecodeError;
use crate::hresult::Hresult;
use crate::memory::{ForeignAllocator, ForeignBlock, ForeignStrings, ForeignVariants};
use crate::time::FileTime;
use crate::types::ConditionFlags;
use crate::variant::{RawVariant, Variant, decode_variant};
use crate::wide::read_wide;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawConditionState {
    pub state: u16,
    pub reserved1: u16,
    pub active_subcondition: *mut u16,
    pub asc_definition: *mut u16,
    pub asc_severity: u32,
    pub asc_description: *mut u16,
    pub quality: u16,
    pub reserved2: u16,
    pub last_ack_time: FileTime,
    pub subcond_last_active: FileTime,
    pub cond_last_active: FileTime,
    pub cond_last_inactive: FileTime,
    pub acknowledger_id: *mut u16,
    pub comment: *mut u16,
    pub num_scs: u32,
    pub sc_names: *mut *mut u16,
    pub sc_definitions: *mut *mut u16,
    pub sc_severities: *mut u32,
    pub sc_descriptions: *mut *mut u16,
    pub num_event_attrs: u32,
    pub event_attributes: *mut RawVariant,
    pub errors: *mut Hresult,
}

/// One severity tier of a condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubCondition {
    pub name: String,
    pub definition: String,
    pub severity: u32,
    pub description: String,
}

/// A requested attribute: its own result code, and the value when that
/// code is a success.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttributeValue {
    pub value: Option<Variant>,
    pub error: Hresult,
}

impl AttributeValue {
    pub fn ok(&self) -> Result<&Variant, Hresult> {
        self.value.as_ref().ok_or(self.error)
    }
}

/// Point-in-time snapshot of one alarm condition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConditionState {
    pub state: ConditionFlags,
    pub active_subcondition: SubCondition,
    pub quality: u16,
    pub last_ack_time: Option<DateTime<Utc>>,
    pub subcondition_last_active: Option<DateTime<Utc>>,
    pub condition_last_active: Option<DateTime<Utc>>,
    pub condition_last_inactive: Option<DateTime<Utc>>,
    pub acknowledger_id: String,
    pub comment: String,
    pub subconditions: Vec<SubCondition>,
    pub attributes: Vec<AttributeValue>,
}

/// Take ownership of a `GetConditionState` out-parameter, copy it out and
/// release every nested allocation followed by the structure itself.
///
/// # Safety
///
/// `ptr` must be null or a live `OPCCONDITIONSTATE` from `alloc` whose
/// nested pointers are each null or live blocks from `alloc`, with array
/// lengths given by the sibling count fields.
pub unsafe fn take_condition_state(
    alloc: &dyn ForeignAllocator,
    ptr: *mut RawConditionState,
) -> Result<ConditionState, DecodeError> {
    // Declared first so the structure is freed after everything it points to.
    // SAFETY: caller contract.
    let block = unsafe { ForeignBlock::new(alloc, ptr) };
    let Some(raw) = block.get().copied() else {
        return Err(if ptr.is_null() {
            DecodeError::NullArray {
                field: "ppConditionState",
                count: 1,
            }
        } else {
            DecodeError::Misaligned {
                field: "ppConditionState",
            }
        });
    };

    let num_scs = usize::try_from(raw.num_scs).unwrap_or(usize::MAX);
    let num_attrs = usize::try_from(raw.num_event_attrs).unwrap_or(usize::MAX);

    // SAFETY: every pointer below is owned by the structure per the caller
    // contract and handed to exactly one guard.
    let (strings, names, definitions, descriptions, severities, values, errors) = unsafe {
        (
            [
                ForeignBlock::new(alloc, raw.active_subcondition),
                ForeignBlock::new(alloc, raw.asc_definition),
                ForeignBlock::new(alloc, raw.asc_description),
                ForeignBlock::new(alloc, raw.acknowledger_id),
                ForeignBlock::new(alloc, raw.comment),
            ],
            ForeignStrings::new(alloc, raw.sc_names, num_scs),
            ForeignStrings::new(alloc, raw.sc_definitions, num_scs),
            ForeignStrings::new(alloc, raw.sc_descriptions, num_scs),
            ForeignBlock::array(alloc, raw.sc_severities, num_scs),
            ForeignVariants::new(alloc, raw.event_attributes, num_attrs),
            ForeignBlock::array(alloc, raw.errors, num_attrs),
        )
    };

    let [asc_name, asc_definition, asc_description, acknowledger_id, comment] =
        strings.each_ref().map(|s| {
            // SAFETY: each is null or a NUL-terminated string owned by its guard.
            unsafe { read_wide(s.as_ptr(), "OPCCONDITIONSTATE") }
        });

    let names = names.read("pszSCNames")?;
    let definitions = definitions.read("pszSCDefinitions")?;
    let descriptions = descriptions.read("pszSCDescriptions")?;
    let severities = severities.to_vec("pdwSCSeverities")?;
    let subconditions = names
        .into_iter()
        .zip(definitions)
        .zip(severities)
        .zip(descriptions)
        .map(|(((name, definition), severity), description)| SubCondition {
            name,
            definition,
            severity,
            description,
        })
        .collect();

    let errors = errors.to_vec("pErrors")?;
    let attributes = values
        .as_slice("pEventAttributes")?
        .iter()
        .zip(errors)
        .enumerate()
        .map(|(index, (raw_value, error))| {
            let value = if error.is_success() {
                // SAFETY: the VARIANT is owned by `values` and still live.
                let decoded = unsafe { decode_variant(raw_value) }.map_err(|source| {
                    DecodeError::Attribute {
                        index,
                        source: Box::new(source),
                    }
                })?;
                Some(decoded)
            } else {
                None
            };
            Ok(AttributeValue { value, error })
        })
        .collect::<Result<Vec<_>, DecodeError>>()?;

    Ok(ConditionState {
        state: ConditionFlags(raw.state),
        active_subcondition: SubCondition {
            name: asc_name?,
            definition: asc_definition?,
            severity: raw.asc_severity,
            description: asc_description?,
        },
        quality: raw.quality,
        last_ack_time: raw.last_ack_time.to_utc_opt("ftLastAckTime")?,
        subcondition_last_active: raw.subcond_last_active.to_utc_opt("ftSubCondLastActive")?,
        condition_last_active: raw.cond_last_active.to_utc_opt("ftCondLastActive")?,
        condition_last_inactive: raw.cond_last_inactive.to_utc_opt("ftCondLastInactive")?,
        acknowledger_id: acknowledger_id?,
        comment: comment?,
        subconditions,
        attributes,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::fake::{CountingAllocator, FakeCondition};

    fn sample() -> FakeCondition {
        FakeCondition::new("Area1.Boiler", "TempAlarm")
            .flags(ConditionFlags::ENABLED | ConditionFlags::ACTIVE)
            .subcondition("HI", "Temp > 90", 500, "High")
            .subcondition("HIHI", "Temp > 110", 900, "High high")
            .active("HIHI")
            .acked_by("shift-lead", "checked burner")
            .last_active(Utc.with_ymd_and_hms(2024, 2, 1, 3, 4, 5).unwrap())
            .attribute(17, Variant::F32(112.5))
    }

    #[test]
    fn snapshot_copies_everything_and_frees_everything() {
        let alloc = CountingAllocator::new();
        let ptr = sample().encode_state(&alloc, &[17, 99]).unwrap();
        assert!(alloc.outstanding() > 1);

        // SAFETY: built by the counting allocator above.
        let state = unsafe { take_condition_state(&alloc, ptr) }.unwrap();
        assert!(state.state.is_active());
        assert_eq!(state.active_subcondition.name, "HIHI");
        assert_eq!(state.active_subcondition.severity, 900);
        assert_eq!(state.acknowledger_id, "shift-lead");
        assert_eq!(state.comment, "checked burner");
        assert_eq!(state.subconditions.len(), 2);
        assert_eq!(state.subconditions[0].definition, "Temp > 90");
        assert_eq!(
            state.condition_last_active,
            Some(Utc.with_ymd_and_hms(2024, 2, 1, 3, 4, 5).unwrap())
        );
        assert_eq!(state.last_ack_time, None);

        assert_eq!(state.attributes[0].ok(), Ok(&Variant::F32(112.5)));
        assert_eq!(state.attributes[1].value, None);
        assert_eq!(state.attributes[1].error, Hresult::OPC_E_INVALIDITEMID);

        assert_eq!(alloc.outstanding(), 0);
        assert_eq!(alloc.invalid_frees(), 0);
    }

    #[test]
    fn corrupt_attribute_still_releases_the_snapshot() {
        let alloc = CountingAllocator::new();
        let ptr = sample()
            .corrupt_attribute(18)
            .encode_state(&alloc, &[17, 18])
            .unwrap();

        // SAFETY: built by the counting allocator above.
        let err = unsafe { take_condition_state(&alloc, ptr) }.unwrap_err();
        assert!(matches!(err, DecodeError::Attribute { index: 1, .. }));
        assert_eq!(alloc.outstanding(), 0);
    }

    #[test]
    fn null_snapshot_is_a_decode_error() {
        let alloc = CountingAllocator::new();
        // SAFETY: null is checked before any read.
        let err = unsafe { take_condition_state(&alloc, std::ptr::null_mut()) }.unwrap_err();
        assert!(matches!(err, DecodeError::NullArray { .. }));
    }
}
