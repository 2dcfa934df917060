use thiserror::Error;

use crate::guid::Guid;
use crate::hresult::Hresult;

/// Top-level error type for the `opcae-api` crate.
///
/// Mirrors the failure taxonomy of the call contract: the call mechanism
/// failed, the server answered with a failure code, or an out-parameter did
/// not have the layout we expected. `opcae-core` maps these into
/// consumer-facing diagnostics.
#[derive(Debug, Error)]
pub enum Error {
    // ── Call mechanism ──────────────────────────────────────────────
    /// The RPC/DCOM layer failed before the server method ran.
    #[error("transport failure during {operation}: {hresult}")]
    Transport {
        operation: &'static str,
        hresult: Hresult,
    },

    // ── Server ──────────────────────────────────────────────────────
    /// The server returned a negative result code.
    #[error("{operation} failed: {hresult}")]
    Protocol {
        operation: &'static str,
        hresult: Hresult,
    },

    /// The object does not implement the requested interface.
    #[error("interface {iid:?} not supported")]
    NoInterface { iid: Guid },

    // ── Data ────────────────────────────────────────────────────────
    /// An out-parameter or notification record could not be decoded.
    /// Any foreign buffers involved were still released.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    // ── Client-side marshaling ──────────────────────────────────────
    /// An argument cannot be expressed in the wire contract.
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },
}

impl Error {
    /// Classify a failed result code returned by `operation`.
    pub fn from_hresult(operation: &'static str, hresult: Hresult) -> Self {
        if hresult.is_transport() {
            Self::Transport { operation, hresult }
        } else {
            Self::Protocol { operation, hresult }
        }
    }

    /// The server result code, for transport and protocol failures.
    pub fn hresult(&self) -> Option<Hresult> {
        match self {
            Self::Transport { hresult, .. } | Self::Protocol { hresult, .. } => Some(*hresult),
            Self::NoInterface { .. } => Some(Hresult::E_NOINTERFACE),
            Self::Decode(_) | Self::InvalidArgument { .. } => None,
        }
    }
}

/// Check a result code, mapping failures into [`Error`].
pub(crate) fn check(operation: &'static str, hresult: Hresult) -> Result<Hresult, Error> {
    hresult
        .ok()
        .map_err(|code| Error::from_hresult(operation, code))
}

/// A binary layout assumption was violated while decoding foreign memory.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// A VARIANT carried a type tag this decoder does not understand.
    #[error("unsupported VARIANT type 0x{0:04X}")]
    UnsupportedVariantType(u16),

    /// A SAFEARRAY had more than one dimension.
    #[error("unsupported SAFEARRAY rank {0}")]
    UnsupportedArrayRank(u16),

    /// A SAFEARRAY element size did not match its element type.
    #[error("SAFEARRAY element size {actual} does not match {expected} for VARIANT type 0x{vt:04X}")]
    ElementSize { vt: u16, expected: usize, actual: usize },

    /// Arrays of variants nested deeper than the decoder follows.
    #[error("VARIANT arrays nested deeper than {0} levels")]
    NestingTooDeep(usize),

    /// A non-zero element count came with a null base pointer.
    #[error("{field}: {count} elements behind a null pointer")]
    NullArray { field: &'static str, count: usize },

    /// A foreign pointer was not aligned for its element type.
    #[error("{field}: misaligned pointer")]
    Misaligned { field: &'static str },

    /// A wide string exceeded the maximum length without a terminator.
    #[error("unterminated wide string in {field}")]
    UnterminatedString { field: &'static str },

    /// A FILETIME or DATE value was outside the representable range.
    #[error("timestamp out of range in {field}")]
    InvalidTimestamp { field: &'static str },

    /// A flag field carried bits outside the published set.
    #[error("{field}: unknown bits 0x{bits:X}")]
    UnknownBits { field: &'static str, bits: u32 },

    /// One record in a notification batch failed; the batch is rejected.
    #[error("record {index}: {source}")]
    Record {
        index: usize,
        #[source]
        source: Box<DecodeError>,
    },

    /// One attribute of a record failed to decode.
    #[error("attribute {index}: {source}")]
    Attribute {
        index: usize,
        #[source]
        source: Box<DecodeError>,
    },
}
