// opcae-core: event subscriptions and condition management on top of opcae-api.
//
// Consumers see owned, decoded values only. Notifications arrive on the
// server's threads and are handed over through a bounded queue per
// subscription; everything else is a plain blocking call into the server.

pub mod activation;
pub mod config;
pub mod error;
pub mod queue;
pub mod server;
pub mod subscription;

// ── Primary re-exports ──────────────────────────────────────────────
pub use activation::Activator;
pub use config::{Backpressure, ServerId, ServerTarget, SubscriptionConfig};
pub use error::CoreError;
pub use queue::{EventReceiver, NotificationQueue, QueueStats, RecvError};
pub use server::EventServer;
pub use subscription::{Subscription, SubscriptionPhase};

// Re-export the value types consumers handle so they need not depend on
// opcae-api directly.
pub use opcae_api::{
    AckOutcome, AckTarget, AttributeValue, ChangeKind, ChangeMask, ConditionFlags, ConditionState,
    DecodeError, EventAttribute, EventBatch, EventCategory, EventRecord, EventType, EventTypeMask,
    FilterKind, FilterMask, Guid, Hresult, RevisedState, StateUpdate, SubCondition, SubscriptionFilter,
    SubscriptionState, VarType, Variant,
};
