// ── Flag sets, filters and subscription state ──

use std::fmt;

use serde::{Deserialize, Serialize, Serializer};
use strum::{Display, EnumIter, IntoEnumIterator};

use crate::error::DecodeError;

// ── Change mask ─────────────────────────────────────────────────────

/// One bit of an event record's change mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumIter)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ChangeKind {
    ActiveState,
    AckState,
    EnableState,
    Quality,
    Severity,
    Subcondition,
    Message,
    Attribute,
}

impl ChangeKind {
    pub const fn bit(self) -> u16 {
        match self {
            Self::ActiveState => 0x0001,
            Self::AckState => 0x0002,
            Self::EnableState => 0x0004,
            Self::Quality => 0x0008,
            Self::Severity => 0x0010,
            Self::Subcondition => 0x0020,
            Self::Message => 0x0040,
            Self::Attribute => 0x0080,
        }
    }
}

/// `wChangeMask`: which aspects of a condition changed. Bits are independent.
///
/// Bits above `0x80` are kept in the raw value but have no [`ChangeKind`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(transparent)]
pub struct ChangeMask(pub u16);

impl ChangeMask {
    pub fn contains(self, kind: ChangeKind) -> bool {
        self.0 & kind.bit() != 0
    }

    pub fn kinds(self) -> Vec<ChangeKind> {
        ChangeKind::iter().filter(|k| self.contains(*k)).collect()
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl FromIterator<ChangeKind> for ChangeMask {
    fn from_iter<T: IntoIterator<Item = ChangeKind>>(iter: T) -> Self {
        Self(iter.into_iter().fold(0, |acc, k| acc | k.bit()))
    }
}

impl fmt::Debug for ChangeMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.kinds()).finish()
    }
}

impl Serialize for ChangeMask {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.kinds())
    }
}

// ── Condition state flags ───────────────────────────────────────────

/// `wNewState`: the condition's current enabled / active / acknowledged bits.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ConditionFlags(pub u16);

impl ConditionFlags {
    pub const ENABLED: u16 = 0x0001;
    pub const ACTIVE: u16 = 0x0002;
    pub const ACKED: u16 = 0x0004;

    pub fn is_enabled(self) -> bool {
        self.0 & Self::ENABLED != 0
    }

    pub fn is_active(self) -> bool {
        self.0 & Self::ACTIVE != 0
    }

    pub fn is_acked(self) -> bool {
        self.0 & Self::ACKED != 0
    }
}

impl fmt::Debug for ConditionFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConditionFlags")
            .field("enabled", &self.is_enabled())
            .field("active", &self.is_active())
            .field("acked", &self.is_acked())
            .finish()
    }
}

// ── Event types ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumIter)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EventType {
    Simple,
    Tracking,
    Condition,
}

impl EventType {
    pub const fn bit(self) -> u32 {
        match self {
            Self::Simple => 0x0001,
            Self::Tracking => 0x0002,
            Self::Condition => 0x0004,
        }
    }

    /// Decode a single-type `dwEventType` field.
    pub fn from_bits(bits: u32, field: &'static str) -> Result<Self, DecodeError> {
        Self::iter()
            .find(|t| t.bit() == bits)
            .ok_or(DecodeError::UnknownBits { field, bits })
    }
}

/// A set of event types, as used by filters and category queries.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventTypeMask(u32);

impl EventTypeMask {
    pub const ALL: Self = Self(0x0007);
    pub const NONE: Self = Self(0);

    /// Decode a mask received from the server. `ALL` (0x7) is simply the
    /// union of the three types; any other bit is rejected.
    pub fn from_bits(bits: u32, field: &'static str) -> Result<Self, DecodeError> {
        let unknown = bits & !Self::ALL.0;
        if unknown != 0 {
            return Err(DecodeError::UnknownBits {
                field,
                bits: unknown,
            });
        }
        Ok(Self(bits))
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, ty: EventType) -> bool {
        self.0 & ty.bit() != 0
    }

    pub fn types(self) -> Vec<EventType> {
        EventType::iter().filter(|t| self.contains(*t)).collect()
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl Default for EventTypeMask {
    fn default() -> Self {
        Self::ALL
    }
}

impl From<EventType> for EventTypeMask {
    fn from(ty: EventType) -> Self {
        Self(ty.bit())
    }
}

impl FromIterator<EventType> for EventTypeMask {
    fn from_iter<T: IntoIterator<Item = EventType>>(iter: T) -> Self {
        Self(iter.into_iter().fold(0, |acc, t| acc | t.bit()))
    }
}

impl fmt::Debug for EventTypeMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.types()).finish()
    }
}

// ── Available filters ───────────────────────────────────────────────

/// One criterion a server may support in `SetFilter`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumIter)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FilterKind {
    Event,
    Category,
    Severity,
    Area,
    Source,
}

impl FilterKind {
    pub const fn bit(self) -> u32 {
        match self {
            Self::Event => 0x0001,
            Self::Category => 0x0002,
            Self::Severity => 0x0004,
            Self::Area => 0x0008,
            Self::Source => 0x0010,
        }
    }
}

/// Result of `QueryAvailableFilters`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FilterMask(pub u32);

impl FilterMask {
    pub fn supports(self, kind: FilterKind) -> bool {
        self.0 & kind.bit() != 0
    }

    pub fn kinds(self) -> Vec<FilterKind> {
        FilterKind::iter().filter(|k| self.supports(*k)).collect()
    }
}

impl fmt::Debug for FilterMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.kinds()).finish()
    }
}

// ── Filter and state ────────────────────────────────────────────────

pub const MIN_SEVERITY: u32 = 1;
pub const MAX_SEVERITY: u32 = 1000;

/// Event selection criteria of one subscription. Empty lists mean "all".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionFilter {
    pub event_types: EventTypeMask,
    pub categories: Vec<u32>,
    pub low_severity: u32,
    pub high_severity: u32,
    pub areas: Vec<String>,
    pub sources: Vec<String>,
}

impl Default for SubscriptionFilter {
    fn default() -> Self {
        Self {
            event_types: EventTypeMask::ALL,
            categories: Vec::new(),
            low_severity: MIN_SEVERITY,
            high_severity: MAX_SEVERITY,
            areas: Vec::new(),
            sources: Vec::new(),
        }
    }
}

impl SubscriptionFilter {
    pub fn with_event_types(mut self, types: impl Into<EventTypeMask>) -> Self {
        self.event_types = types.into();
        self
    }

    pub fn with_categories(mut self, categories: impl IntoIterator<Item = u32>) -> Self {
        self.categories = categories.into_iter().collect();
        self
    }

    pub fn with_severity(mut self, low: u32, high: u32) -> Self {
        self.low_severity = low;
        self.high_severity = high;
        self
    }

    pub fn with_areas<S: Into<String>>(mut self, areas: impl IntoIterator<Item = S>) -> Self {
        self.areas = areas.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_sources<S: Into<String>>(mut self, sources: impl IntoIterator<Item = S>) -> Self {
        self.sources = sources.into_iter().map(Into::into).collect();
        self
    }
}

/// Server-side subscription parameters, as reported by `GetState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionState {
    pub active: bool,
    /// Milliseconds; 0 lets the server decide.
    pub buffer_time_ms: u32,
    /// Events per callback; 0 means unbounded.
    pub max_size: u32,
    pub client_handle: u32,
}
