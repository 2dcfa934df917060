// opcae-api: binary call contract of the OPC Alarms & Events event-subscription interfaces
//
// Everything that touches foreign memory lives in this crate: interface
// vtables, out-parameter ownership, VARIANT and ONEVENTSTRUCT decoding, and
// the callback sink the server invokes on its own threads. The consumer-facing
// crate (`opcae-core`) sees only owned, decoded values.
#![allow(unsafe_code)]

pub mod com;
pub mod condition;
pub mod connection_point;
pub mod error;
pub mod event;
pub mod event_server;
pub mod guid;
pub mod hresult;
pub mod memory;
pub mod sink;
pub mod subscription_mgt;
pub mod time;
pub mod types;
pub mod variant;
pub mod wide;

#[cfg(any(test, feature = "fake-server"))]
pub mod fake;

pub use com::{ComPtr, IUnknown, Interface};
pub use condition::{AttributeValue, ConditionState, SubCondition};
pub use connection_point::{IConnectionPoint, IConnectionPointContainer};
pub use error::{DecodeError, Error};
pub use event::{EventBatch, EventRecord};
pub use event_server::{AckOutcome, AckTarget, EventAttribute, EventCategory, IOPCEventServer};
pub use guid::Guid;
pub use hresult::Hresult;
pub use memory::ForeignAllocator;
pub use sink::{BatchHandler, EventSink, IOPCEventSink, SinkRef};
pub use subscription_mgt::{IOPCEventSubscriptionMgt, RevisedState, StateUpdate};
pub use types::{
    ChangeKind, ChangeMask, ConditionFlags, EventType, EventTypeMask, FilterKind, FilterMask,
    SubscriptionFilter, SubscriptionState,
};
pub use variant::{VarType, Variant};
