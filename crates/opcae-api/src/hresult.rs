// ── HRESULT result codes ──
//
// Every call across the interface contract returns a signed 32-bit result.
// Negative values are failures; the magnitude is looked up in the published
// code table below for diagnostics.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A signed 32-bit COM result code.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Hresult(pub i32);

// `0x8000_0000`-range literals do not fit in an `i32` literal, so the table
// spells them as `u32` and reinterprets.
#[allow(clippy::cast_possible_wrap, clippy::as_conversions)]
const fn code(raw: u32) -> Hresult {
    Hresult(raw as i32)
}

impl Hresult {
    // ── Generic COM codes ───────────────────────────────────────────
    pub const S_OK: Self = code(0x0000_0000);
    pub const S_FALSE: Self = code(0x0000_0001);
    pub const E_NOTIMPL: Self = code(0x8000_4001);
    pub const E_NOINTERFACE: Self = code(0x8000_4002);
    pub const E_POINTER: Self = code(0x8000_4003);
    pub const E_FAIL: Self = code(0x8000_4005);
    pub const E_UNEXPECTED: Self = code(0x8000_FFFF);
    pub const E_OUTOFMEMORY: Self = code(0x8007_000E);
    pub const E_INVALIDARG: Self = code(0x8007_0057);

    // ── Connection points ───────────────────────────────────────────
    pub const CONNECT_E_NOCONNECTION: Self = code(0x8004_0200);
    pub const CONNECT_E_ADVISELIMIT: Self = code(0x8004_0201);
    pub const CONNECT_E_CANNOTCONNECT: Self = code(0x8004_0202);

    // ── Transport (RPC / DCOM) ──────────────────────────────────────
    pub const RPC_E_DISCONNECTED: Self = code(0x8001_0108);
    pub const RPC_E_SERVERFAULT: Self = code(0x8001_0105);
    pub const RPC_E_CALL_REJECTED: Self = code(0x8001_0001);
    pub const RPC_S_SERVER_UNAVAILABLE: Self = code(0x8007_06BA);
    pub const RPC_S_CALL_FAILED: Self = code(0x8007_06BE);
    pub const CO_E_OBJNOTCONNECTED: Self = code(0x8004_01FD);
    pub const CO_E_SERVER_EXEC_FAILURE: Self = code(0x8008_0005);

    // ── OPC common / Alarms & Events ────────────────────────────────
    pub const OPC_E_INVALIDHANDLE: Self = code(0xC004_0001);
    pub const OPC_E_BADTYPE: Self = code(0xC004_0004);
    pub const OPC_E_PUBLIC: Self = code(0xC004_0005);
    pub const OPC_E_BADRIGHTS: Self = code(0xC004_0006);
    pub const OPC_E_UNKNOWNITEMID: Self = code(0xC004_0007);
    pub const OPC_E_INVALIDITEMID: Self = code(0xC004_0008);
    pub const OPC_E_INVALIDFILTER: Self = code(0xC004_0009);
    pub const OPC_E_UNKNOWNPATH: Self = code(0xC004_000A);
    pub const OPC_E_RANGE: Self = code(0xC004_000B);
    pub const OPC_E_DUPLICATENAME: Self = code(0xC004_000C);
    pub const OPC_E_INVALIDBRANCHNAME: Self = code(0xC004_0203);
    pub const OPC_E_INVALIDTIME: Self = code(0xC004_0204);
    pub const OPC_E_BUSY: Self = code(0xC004_0205);
    pub const OPC_E_NOINFO: Self = code(0xC004_0206);
    pub const OPC_S_ALREADYACKED: Self = code(0x0004_0200);
    pub const OPC_S_INVALIDBUFFERTIME: Self = code(0x0004_0201);
    pub const OPC_S_INVALIDMAXSIZE: Self = code(0x0004_0202);
    pub const OPC_S_INVALIDKEEPALIVETIME: Self = code(0x0004_0203);

    const FACILITY_RPC: u32 = 0x0001;

    pub fn is_success(self) -> bool {
        self.0 >= 0
    }

    pub fn is_failure(self) -> bool {
        self.0 < 0
    }

    /// The code as the unsigned value printed by Windows tooling.
    #[allow(clippy::cast_sign_loss, clippy::as_conversions)]
    pub fn as_u32(self) -> u32 {
        self.0 as u32
    }

    pub fn facility(self) -> u32 {
        (self.as_u32() >> 16) & 0x1FFF
    }

    /// `true` when the failure came from the call mechanism itself rather
    /// than from the server's implementation of the method.
    pub fn is_transport(self) -> bool {
        if self.is_success() {
            return false;
        }
        self.facility() == Self::FACILITY_RPC
            || matches!(
                self,
                Self::RPC_S_SERVER_UNAVAILABLE
                    | Self::RPC_S_CALL_FAILED
                    | Self::CO_E_OBJNOTCONNECTED
                    | Self::CO_E_SERVER_EXEC_FAILURE
            )
    }

    /// Symbolic name from the code table, if the code is a published one.
    pub fn name(self) -> Option<&'static str> {
        let name = match self {
            Self::S_OK => "S_OK",
            Self::S_FALSE => "S_FALSE",
            Self::E_NOTIMPL => "E_NOTIMPL",
            Self::E_NOINTERFACE => "E_NOINTERFACE",
            Self::E_POINTER => "E_POINTER",
            Self::E_FAIL => "E_FAIL",
            Self::E_UNEXPECTED => "E_UNEXPECTED",
            Self::E_OUTOFMEMORY => "E_OUTOFMEMORY",
            Self::E_INVALIDARG => "E_INVALIDARG",
            Self::CONNECT_E_NOCONNECTION => "CONNECT_E_NOCONNECTION",
            Self::CONNECT_E_ADVISELIMIT => "CONNECT_E_ADVISELIMIT",
            Self::CONNECT_E_CANNOTCONNECT => "CONNECT_E_CANNOTCONNECT",
            Self::RPC_E_DISCONNECTED => "RPC_E_DISCONNECTED",
            Self::RPC_E_SERVERFAULT => "RPC_E_SERVERFAULT",
            Self::RPC_E_CALL_REJECTED => "RPC_E_CALL_REJECTED",
            Self::RPC_S_SERVER_UNAVAILABLE => "RPC_S_SERVER_UNAVAILABLE",
            Self::RPC_S_CALL_FAILED => "RPC_S_CALL_FAILED",
            Self::CO_E_OBJNOTCONNECTED => "CO_E_OBJNOTCONNECTED",
            Self::CO_E_SERVER_EXEC_FAILURE => "CO_E_SERVER_EXEC_FAILURE",
            Self::OPC_E_INVALIDHANDLE => "OPC_E_INVALIDHANDLE",
            Self::OPC_E_BADTYPE => "OPC_E_BADTYPE",
            Self::OPC_E_PUBLIC => "OPC_E_PUBLIC",
            Self::OPC_E_BADRIGHTS => "OPC_E_BADRIGHTS",
            Self::OPC_E_UNKNOWNITEMID => "OPC_E_UNKNOWNITEMID",
            Self::OPC_E_INVALIDITEMID => "OPC_E_INVALIDITEMID",
            Self::OPC_E_INVALIDFILTER => "OPC_E_INVALIDFILTER",
            Self::OPC_E_UNKNOWNPATH => "OPC_E_UNKNOWNPATH",
            Self::OPC_E_RANGE => "OPC_E_RANGE",
            Self::OPC_E_DUPLICATENAME => "OPC_E_DUPLICATENAME",
            Self::OPC_E_INVALIDBRANCHNAME => "OPC_E_INVALIDBRANCHNAME",
            Self::OPC_E_INVALIDTIME => "OPC_E_INVALIDTIME",
            Self::OPC_E_BUSY => "OPC_E_BUSY",
            Self::OPC_E_NOINFO => "OPC_E_NOINFO",
            Self::OPC_S_ALREADYACKED => "OPC_S_ALREADYACKED",
            Self::OPC_S_INVALIDBUFFERTIME => "OPC_S_INVALIDBUFFERTIME",
            Self::OPC_S_INVALIDMAXSIZE => "OPC_S_INVALIDMAXSIZE",
            Self::OPC_S_INVALIDKEEPALIVETIME => "OPC_S_INVALIDKEEPALIVETIME",
            _ => return None,
        };
        Some(name)
    }

    /// Convert into a `Result`, keeping success codes (including `S_FALSE`
    /// and the `OPC_S_*` family) on the `Ok` side.
    pub fn ok(self) -> Result<Self, Self> {
        if self.is_success() { Ok(self) } else { Err(self) }
    }
}

impl fmt::Display for Hresult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name} (0x{:08X})", self.as_u32()),
            None => write!(f, "0x{:08X}", self.as_u32()),
        }
    }
}

impl fmt::Debug for Hresult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hresult({self})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_bit_decides_success() {
        assert!(Hresult::S_OK.is_success());
        assert!(Hresult::S_FALSE.is_success());
        assert!(Hresult::OPC_S_ALREADYACKED.is_success());
        assert!(Hresult::E_FAIL.is_failure());
        assert!(Hresult::OPC_E_BUSY.is_failure());
    }

    #[test]
    fn rpc_facility_is_transport() {
        assert!(Hresult::RPC_E_DISCONNECTED.is_transport());
        assert!(Hresult::RPC_S_SERVER_UNAVAILABLE.is_transport());
        assert!(Hresult::CO_E_OBJNOTCONNECTED.is_transport());
        assert!(!Hresult::E_INVALIDARG.is_transport());
        assert!(!Hresult::OPC_E_INVALIDFILTER.is_transport());
    }

    #[test]
    fn display_uses_code_table() {
        assert_eq!(Hresult::OPC_E_NOINFO.to_string(), "OPC_E_NOINFO (0xC0040206)");
        assert_eq!(Hresult(0x1234).to_string(), "0x00001234");
    }

    #[test]
    fn ok_keeps_informational_successes() {
        assert_eq!(Hresult::OPC_S_INVALIDMAXSIZE.ok(), Ok(Hresult::OPC_S_INVALIDMAXSIZE));
        assert_eq!(Hresult::E_POINTER.ok(), Err(Hresult::E_POINTER));
    }
}
