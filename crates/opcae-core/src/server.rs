// ── Event server handle ──
//
// Wraps the server's IOPCEventServer interface together with the allocator
// its out-parameters are released with. Creates subscriptions (assigning
// client handles), answers the browse-free server queries and manages
// conditions. `disconnect` tears down every subscription it created before
// letting go of the server.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use opcae_api::{
    AckOutcome, AckTarget, ComPtr, ConditionState, EventAttribute, EventCategory, EventTypeMask,
    FilterMask, ForeignAllocator, IOPCEventServer, RevisedState,
};
use tracing::{debug, info, warn};

use crate::activation::{Activator, activate_event_server};
use crate::config::{ServerTarget, SubscriptionConfig};
use crate::error::CoreError;
use crate::queue::NotificationQueue;
use crate::subscription::{Subscription, SubscriptionShared};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Connection to one OPC Alarms & Events server.
///
/// Cheaply cloneable via `Arc<ServerInner>`; clones share the handle counter
/// and the set of subscriptions `disconnect` tears down.
#[derive(Clone)]
pub struct EventServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    server: Mutex<Option<ComPtr<IOPCEventServer>>>,
    alloc: Arc<dyn ForeignAllocator>,
    next_handle: AtomicU32,
    subscriptions: Mutex<Vec<Weak<SubscriptionShared>>>,
}

impl EventServer {
    /// Wrap an already obtained server interface. `alloc` must be the
    /// allocator the server hands out-parameters from (the COM task
    /// allocator for a real server).
    pub fn new(server: ComPtr<IOPCEventServer>, alloc: Arc<dyn ForeignAllocator>) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                server: Mutex::new(Some(server)),
                alloc,
                next_handle: AtomicU32::new(1),
                subscriptions: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Activate `target` through `activator` and wrap the result.
    pub fn connect(
        activator: &dyn Activator,
        target: &ServerTarget,
        alloc: Arc<dyn ForeignAllocator>,
    ) -> Result<Self, CoreError> {
        let server = activate_event_server(activator, target)?;
        info!(%target, "connected to event server");
        Ok(Self::new(server, alloc))
    }

    fn server(&self) -> Result<ComPtr<IOPCEventServer>, CoreError> {
        lock(&self.inner.server).clone().ok_or(CoreError::Disconnected)
    }

    fn alloc(&self) -> &dyn ForeignAllocator {
        self.inner.alloc.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.inner.server).is_some()
    }

    // ── Subscriptions ────────────────────────────────────────────────

    /// Create a subscription, advise a sink to it and return it together
    /// with the buffer time and max size the server granted.
    pub fn create_subscription(
        &self,
        config: &SubscriptionConfig,
    ) -> Result<(Subscription, RevisedState), CoreError> {
        let server = self.server()?;
        let handle = self.inner.next_handle.fetch_add(1, Ordering::Relaxed);
        let (object, revised) =
            server.create_event_subscription(config.active, config.buffer_time_ms, config.max_size, handle)?;

        let queue = Arc::new(NotificationQueue::new(
            handle,
            config.queue_capacity,
            config.backpressure,
        ));
        let subscription = Subscription::created(handle, &object, queue, Arc::clone(&self.inner.alloc))?;
        drop(object);
        subscription.register()?;

        {
            let mut subs = lock(&self.inner.subscriptions);
            subs.retain(|weak| weak.strong_count() > 0);
            subs.push(Arc::downgrade(subscription.shared()));
        }
        debug!(
            handle,
            active = config.active,
            buffer_time_ms = revised.buffer_time_ms,
            max_size = revised.max_size,
            queue_capacity = config.queue_capacity,
            backpressure = %config.backpressure,
            "subscription created"
        );
        Ok((subscription, revised))
    }

    /// Subscriptions created here that have not been dropped yet.
    pub fn subscription_count(&self) -> usize {
        lock(&self.inner.subscriptions)
            .iter()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    // ── Server queries ───────────────────────────────────────────────

    pub fn query_available_filters(&self) -> Result<FilterMask, CoreError> {
        Ok(self.server()?.query_available_filters()?)
    }

    pub fn query_event_categories(&self, event_types: EventTypeMask) -> Result<Vec<EventCategory>, CoreError> {
        Ok(self.server()?.query_event_categories(self.alloc(), event_types)?)
    }

    pub fn query_condition_names(&self, category: u32) -> Result<Vec<String>, CoreError> {
        Ok(self.server()?.query_condition_names(self.alloc(), category)?)
    }

    pub fn query_sub_condition_names(&self, condition: &str) -> Result<Vec<String>, CoreError> {
        Ok(self.server()?.query_sub_condition_names(self.alloc(), condition)?)
    }

    pub fn query_source_conditions(&self, source: &str) -> Result<Vec<String>, CoreError> {
        Ok(self.server()?.query_source_conditions(self.alloc(), source)?)
    }

    pub fn query_event_attributes(&self, category: u32) -> Result<Vec<EventAttribute>, CoreError> {
        Ok(self.server()?.query_event_attributes(self.alloc(), category)?)
    }

    // ── Conditions ───────────────────────────────────────────────────

    /// Snapshot of one condition, with the listed vendor attributes.
    pub fn condition_state(
        &self,
        source: &str,
        condition: &str,
        attribute_ids: &[u32],
    ) -> Result<ConditionState, CoreError> {
        Ok(self
            .server()?
            .get_condition_state(self.alloc(), source, condition, attribute_ids)?)
    }

    /// Acknowledge condition occurrences. One outcome per target, in order;
    /// a failed call returns an error and no outcomes at all.
    pub fn ack_condition(
        &self,
        acknowledger: &str,
        comment: &str,
        targets: &[AckTarget],
    ) -> Result<Vec<AckOutcome>, CoreError> {
        let outcomes = self
            .server()?
            .ack_condition(self.alloc(), acknowledger, comment, targets)?;
        let failed = outcomes
            .iter()
            .filter(|o| matches!(o, AckOutcome::Failed(_)))
            .count();
        if failed > 0 {
            warn!(count = targets.len(), failed, "some acknowledgements were refused");
        } else {
            debug!(count = targets.len(), "conditions acknowledged");
        }
        Ok(outcomes)
    }

    pub fn enable_conditions_by_area<S: AsRef<str>>(&self, areas: &[S]) -> Result<(), CoreError> {
        Ok(self.server()?.enable_conditions_by_area(areas)?)
    }

    pub fn enable_conditions_by_source<S: AsRef<str>>(&self, sources: &[S]) -> Result<(), CoreError> {
        Ok(self.server()?.enable_conditions_by_source(sources)?)
    }

    pub fn disable_conditions_by_area<S: AsRef<str>>(&self, areas: &[S]) -> Result<(), CoreError> {
        Ok(self.server()?.disable_conditions_by_area(areas)?)
    }

    pub fn disable_conditions_by_source<S: AsRef<str>>(&self, sources: &[S]) -> Result<(), CoreError> {
        Ok(self.server()?.disable_conditions_by_source(sources)?)
    }

    // ── Teardown ─────────────────────────────────────────────────────

    /// Release every live subscription created from this server (each is
    /// unadvised first), then the server reference itself. Later calls on
    /// any clone fail with [`CoreError::Disconnected`].
    pub fn disconnect(&self) {
        let subs: Vec<Arc<SubscriptionShared>> = lock(&self.inner.subscriptions)
            .drain(..)
            .filter_map(|weak| weak.upgrade())
            .collect();
        for sub in &subs {
            if let Err(err) = sub.release() {
                warn!(handle = sub.handle(), error = %err, "subscription release failed during disconnect");
            }
        }
        if lock(&self.inner.server).take().is_some() {
            info!(released = subs.len(), "disconnected from event server");
        }
    }
}

impl std::fmt::Debug for EventServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventServer")
            .field("connected", &self.is_connected())
            .field("subscriptions", &self.subscription_count())
            .finish_non_exhaustive()
    }
}
