// ── Event subscription ──
//
// One server-side subscription object plus the client sink advised to it.
// Lifecycle: Created (interfaces obtained, nothing advised) -> Registered
// (sink advised; the server may call it at any time) -> Released (terminal).
// Calls into the server are made on a cloned interface pointer with the
// lifecycle lock released, so a slow call never holds up `release`.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use opcae_api::guid::IID_IOPC_EVENT_SINK;
use opcae_api::{
    BatchHandler, ComPtr, EventSink, ForeignAllocator, IConnectionPoint, IConnectionPointContainer,
    IOPCEventSubscriptionMgt, IUnknown, RevisedState, SinkRef, StateUpdate, SubscriptionFilter,
    SubscriptionState,
};
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::CoreError;
use crate::queue::{EventReceiver, NotificationQueue};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Where a subscription is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SubscriptionPhase {
    Created,
    Registered,
    Released,
}

enum Lifecycle {
    Created {
        mgt: ComPtr<IOPCEventSubscriptionMgt>,
        container: ComPtr<IConnectionPointContainer>,
    },
    Registered {
        mgt: ComPtr<IOPCEventSubscriptionMgt>,
        point: ComPtr<IConnectionPoint>,
        cookie: u32,
        sink: SinkRef,
    },
    Released,
}

impl Lifecycle {
    fn phase(&self) -> SubscriptionPhase {
        match self {
            Self::Created { .. } => SubscriptionPhase::Created,
            Self::Registered { .. } => SubscriptionPhase::Registered,
            Self::Released => SubscriptionPhase::Released,
        }
    }
}

pub(crate) struct SubscriptionShared {
    handle: u32,
    lifecycle: Mutex<Lifecycle>,
    queue: Arc<NotificationQueue>,
    alloc: Arc<dyn ForeignAllocator>,
}

impl SubscriptionShared {
    pub(crate) fn handle(&self) -> u32 {
        self.handle
    }

    fn mgt(&self) -> Result<ComPtr<IOPCEventSubscriptionMgt>, CoreError> {
        match &*lock(&self.lifecycle) {
            Lifecycle::Created { mgt, .. } | Lifecycle::Registered { mgt, .. } => Ok(mgt.clone()),
            Lifecycle::Released => Err(CoreError::Released { handle: self.handle }),
        }
    }

    /// The management interface and the advise cookie, which refresh calls
    /// name the connection by.
    fn connection(&self) -> Result<(ComPtr<IOPCEventSubscriptionMgt>, u32), CoreError> {
        match &*lock(&self.lifecycle) {
            Lifecycle::Registered { mgt, cookie, .. } => Ok((mgt.clone(), *cookie)),
            Lifecycle::Created { .. } => Err(CoreError::InvalidArgument {
                message: format!("subscription {} has no advised sink", self.handle),
            }),
            Lifecycle::Released => Err(CoreError::Released { handle: self.handle }),
        }
    }

    /// Unadvise, then drop the connection point, then the subscription
    /// object. Later calls are no-ops.
    pub(crate) fn release(&self) -> Result<(), CoreError> {
        let previous = std::mem::replace(&mut *lock(&self.lifecycle), Lifecycle::Released);
        // Closing first wakes a sink blocked on a full queue, so the server's
        // delivery thread returns and the unadvise below cannot stall on it.
        self.queue.close();
        match previous {
            Lifecycle::Released => Ok(()),
            Lifecycle::Created { mgt, container } => {
                drop(container);
                drop(mgt);
                debug!(handle = self.handle, "subscription released before registration");
                Ok(())
            }
            Lifecycle::Registered {
                mgt,
                point,
                cookie,
                sink,
            } => {
                let result = point.unadvise(cookie);
                if let Err(err) = &result {
                    warn!(handle = self.handle, cookie, error = %err, "unadvise failed; releasing anyway");
                }
                drop(point);
                drop(mgt);
                drop(sink);
                debug!(handle = self.handle, cookie, "subscription released");
                result.map_err(CoreError::from)
            }
        }
    }
}

/// A live event subscription.
///
/// Per-subscription calls block on the server and should be serialized by
/// the caller. Notifications are read through [`receiver`](Self::receiver).
/// Dropping the subscription releases it.
pub struct Subscription {
    shared: Arc<SubscriptionShared>,
}

impl Subscription {
    /// Obtain the management and container interfaces of a freshly created
    /// subscription object.
    pub(crate) fn created(
        handle: u32,
        object: &ComPtr<IUnknown>,
        queue: Arc<NotificationQueue>,
        alloc: Arc<dyn ForeignAllocator>,
    ) -> Result<Self, CoreError> {
        let mgt = object.query_interface::<IOPCEventSubscriptionMgt>()?;
        let container = object.query_interface::<IConnectionPointContainer>()?;
        Ok(Self {
            shared: Arc::new(SubscriptionShared {
                handle,
                lifecycle: Mutex::new(Lifecycle::Created { mgt, container }),
                queue,
                alloc,
            }),
        })
    }

    /// Advise a new sink feeding this subscription's queue.
    pub(crate) fn register(&self) -> Result<(), CoreError> {
        let mut lifecycle = lock(&self.shared.lifecycle);
        let (mgt, container) = match &*lifecycle {
            Lifecycle::Created { mgt, container } => (mgt.clone(), container.clone()),
            Lifecycle::Registered { .. } => return Ok(()),
            Lifecycle::Released => {
                return Err(CoreError::Released {
                    handle: self.shared.handle,
                });
            }
        };
        let point = container.find_connection_point(&IID_IOPC_EVENT_SINK)?;
        let sink = EventSink::create(Arc::clone(&self.shared.queue) as Arc<dyn BatchHandler>);
        let cookie = point.advise(&sink)?;
        debug!(handle = self.shared.handle, cookie, "sink advised");
        *lifecycle = Lifecycle::Registered {
            mgt,
            point,
            cookie,
            sink,
        };
        Ok(())
    }

    pub(crate) fn shared(&self) -> &Arc<SubscriptionShared> {
        &self.shared
    }

    /// Client handle the server tags this subscription's notifications with.
    pub fn handle(&self) -> u32 {
        self.shared.handle
    }

    pub fn phase(&self) -> SubscriptionPhase {
        lock(&self.shared.lifecycle).phase()
    }

    /// A reader for this subscription's notification queue.
    pub fn receiver(&self) -> EventReceiver {
        EventReceiver::new(Arc::clone(&self.shared.queue))
    }

    // ── Filter ───────────────────────────────────────────────────────

    /// Replace the server-side filter. The server may narrow what it keeps;
    /// read it back with [`filter`](Self::filter).
    pub fn set_filter(&self, filter: &SubscriptionFilter) -> Result<(), CoreError> {
        self.shared.mgt()?.set_filter(filter)?;
        Ok(())
    }

    /// The filter as the server holds it.
    pub fn filter(&self) -> Result<SubscriptionFilter, CoreError> {
        Ok(self.shared.mgt()?.get_filter(self.shared.alloc.as_ref())?)
    }

    // ── State ────────────────────────────────────────────────────────

    /// Change any of active flag, buffer time and max size; fields left
    /// `None` keep their server-side value. Returns what the server granted.
    pub fn set_state(&self, update: StateUpdate) -> Result<RevisedState, CoreError> {
        let revised = self.shared.mgt()?.set_state(update, self.shared.handle)?;
        debug!(handle = self.shared.handle, ?update, ?revised, "subscription state set");
        Ok(revised)
    }

    pub fn set_active(&self, active: bool) -> Result<(), CoreError> {
        self.set_state(StateUpdate {
            active: Some(active),
            ..StateUpdate::default()
        })?;
        Ok(())
    }

    /// Returns the buffer time the server granted.
    pub fn set_buffer_time(&self, buffer_time_ms: u32) -> Result<u32, CoreError> {
        let revised = self.set_state(StateUpdate {
            buffer_time_ms: Some(buffer_time_ms),
            ..StateUpdate::default()
        })?;
        Ok(revised.buffer_time_ms)
    }

    /// Returns the max size the server granted.
    pub fn set_max_size(&self, max_size: u32) -> Result<u32, CoreError> {
        let revised = self.set_state(StateUpdate {
            max_size: Some(max_size),
            ..StateUpdate::default()
        })?;
        Ok(revised.max_size)
    }

    pub fn state(&self) -> Result<SubscriptionState, CoreError> {
        Ok(self.shared.mgt()?.get_state()?)
    }

    // ── Returned attributes ──────────────────────────────────────────

    /// Choose the vendor attributes sent with events of `category`.
    pub fn select_returned_attributes(&self, category: u32, attribute_ids: &[u32]) -> Result<(), CoreError> {
        self.shared.mgt()?.select_returned_attributes(category, attribute_ids)?;
        Ok(())
    }

    pub fn returned_attributes(&self, category: u32) -> Result<Vec<u32>, CoreError> {
        Ok(self
            .shared
            .mgt()?
            .get_returned_attributes(self.shared.alloc.as_ref(), category)?)
    }

    // ── Refresh ──────────────────────────────────────────────────────

    /// Ask the server to replay current condition state. The replay arrives
    /// through the receiver as refresh batches, the final one flagged
    /// `last_refresh`.
    pub fn refresh(&self) -> Result<(), CoreError> {
        let (mgt, cookie) = self.shared.connection()?;
        mgt.refresh(cookie)?;
        debug!(handle = self.shared.handle, cookie, "refresh requested");
        Ok(())
    }

    /// Best effort: refresh batches may still arrive afterwards.
    pub fn cancel_refresh(&self) -> Result<(), CoreError> {
        let (mgt, cookie) = self.shared.connection()?;
        mgt.cancel_refresh(cookie)?;
        debug!(handle = self.shared.handle, cookie, "refresh cancel requested");
        Ok(())
    }

    // ── Teardown ─────────────────────────────────────────────────────

    /// Stop notifications and release the server objects. Safe to call more
    /// than once; batches already queued remain readable.
    pub fn release(&self) -> Result<(), CoreError> {
        self.shared.release()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Err(err) = self.shared.release() {
            warn!(handle = self.shared.handle, error = %err, "release on drop failed");
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("handle", &self.shared.handle)
            .field("phase", &self.phase())
            .field("queued", &self.shared.queue.len())
            .finish_non_exhaustive()
    }
}
