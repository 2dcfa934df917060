// ── Core error types ──
//
// Consumer-facing errors from opcae-core. Raw vtable calls, pointer layouts
// and out-parameter guards stay behind `opcae_api`; the `From` impl below
// sorts its failures into the four kinds a caller can act on, plus the
// lifecycle and setup errors this crate adds on top.

use opcae_api::{DecodeError, Hresult};
use thiserror::Error;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Call failures ────────────────────────────────────────────────
    /// The RPC/DCOM layer failed before the server method ran. Not retried.
    #[error("Transport failure during {operation}: {hresult}")]
    Transport {
        operation: &'static str,
        hresult: Hresult,
    },

    /// The server answered with a failure code. Not retried.
    #[error("Server rejected {operation}: {hresult}")]
    Protocol {
        operation: &'static str,
        hresult: Hresult,
    },

    /// An out-parameter or notification did not have the expected layout.
    /// The foreign buffers involved were released regardless.
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Notification batches were dropped by the queue's backpressure policy.
    #[error("Subscription {handle} dropped {dropped} batch(es) under backpressure")]
    Capacity { handle: u32, dropped: u64 },

    // ── Lifecycle errors ─────────────────────────────────────────────
    #[error("Subscription {handle} has been released")]
    Released { handle: u32 },

    #[error("Event server disconnected")]
    Disconnected,

    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    // ── Setup errors ─────────────────────────────────────────────────
    #[error("Cannot activate server {target}: {reason}")]
    Activation { target: String, reason: String },

    #[error("Server object does not implement {interface}")]
    NoInterface { interface: String },

    #[error("Configuration error: {message}")]
    Config { message: String },
}

impl CoreError {
    /// The server result code, when the failure came from a server call.
    pub fn hresult(&self) -> Option<Hresult> {
        match self {
            Self::Transport { hresult, .. } | Self::Protocol { hresult, .. } => Some(*hresult),
            Self::NoInterface { .. } => Some(Hresult::E_NOINTERFACE),
            _ => None,
        }
    }

    /// Whether the link to the server itself is gone, as opposed to one call
    /// being refused.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }
}

// ── Conversion from call-contract errors ─────────────────────────────

impl From<opcae_api::Error> for CoreError {
    fn from(err: opcae_api::Error) -> Self {
        match err {
            opcae_api::Error::Transport { operation, hresult } => {
                CoreError::Transport { operation, hresult }
            }
            opcae_api::Error::Protocol { operation, hresult } => {
                CoreError::Protocol { operation, hresult }
            }
            opcae_api::Error::NoInterface { iid } => CoreError::NoInterface {
                interface: iid.to_string(),
            },
            opcae_api::Error::Decode(e) => CoreError::Decode(e),
            opcae_api::Error::InvalidArgument { message } => CoreError::InvalidArgument { message },
        }
    }
}
