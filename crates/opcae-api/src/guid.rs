// ── Interface / class identifiers ──

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::Error;

/// A 128-bit interface or class identifier in its binary layout.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Guid {
    pub data1: u32,
    pub data2: u16,
    pub data3: u16,
    pub data4: [u8; 8],
}

impl Guid {
    pub const fn new(data1: u32, data2: u16, data3: u16, data4: [u8; 8]) -> Self {
        Self {
            data1,
            data2,
            data3,
            data4,
        }
    }

    pub const fn zeroed() -> Self {
        Self::new(0, 0, 0, [0; 8])
    }
}

// ── Well-known identifiers ──────────────────────────────────────────

pub const IID_IUNKNOWN: Guid = Guid::new(
    0x0000_0000,
    0x0000,
    0x0000,
    [0xC0, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x46],
);

pub const IID_ICONNECTION_POINT_CONTAINER: Guid = Guid::new(
    0xB196_B284,
    0xBAB4,
    0x101A,
    [0xB6, 0x9C, 0x00, 0xAA, 0x00, 0x34, 0x1D, 0x07],
);

pub const IID_ICONNECTION_POINT: Guid = Guid::new(
    0xB196_B286,
    0xBAB4,
    0x101A,
    [0xB6, 0x9C, 0x00, 0xAA, 0x00, 0x34, 0x1D, 0x07],
);

/// All OPC AE interfaces share this `Data4` tail.
const OPC_AE_TAIL: [u8; 8] = [0x84, 0xA0, 0x00, 0x60, 0x8C, 0xB8, 0xA7, 0xE9];

pub const IID_IOPC_EVENT_SERVER: Guid = Guid::new(0x6516_8851, 0x5783, 0x11D1, OPC_AE_TAIL);
pub const IID_IOPC_EVENT_SUBSCRIPTION_MGT: Guid =
    Guid::new(0x6516_8855, 0x5783, 0x11D1, OPC_AE_TAIL);
pub const IID_IOPC_EVENT_SINK: Guid = Guid::new(0x6516_885F, 0x5783, 0x11D1, OPC_AE_TAIL);

// ── Formatting / parsing ────────────────────────────────────────────

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let d = &self.data4;
        write!(
            f,
            "{:08X}-{:04X}-{:04X}-{:02X}{:02X}-{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}",
            self.data1, self.data2, self.data3, d[0], d[1], d[2], d[3], d[4], d[5], d[6], d[7]
        )
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{self}}}")
    }
}

impl FromStr for Guid {
    type Err = Error;

    /// Accepts `XXXXXXXX-XXXX-XXXX-XXXX-XXXXXXXXXXXX`, optionally in braces.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::InvalidArgument {
            message: format!("invalid GUID '{s}'"),
        };

        let trimmed = s.trim();
        let body = trimmed
            .strip_prefix('{')
            .and_then(|rest| rest.strip_suffix('}'))
            .unwrap_or(trimmed);

        let groups: Vec<&str> = body.split('-').collect();
        let [g1, g2, g3, g4, g5] = groups.as_slice() else {
            return Err(invalid());
        };
        if g1.len() != 8 || g2.len() != 4 || g3.len() != 4 || g4.len() != 4 || g5.len() != 12 {
            return Err(invalid());
        }

        let data1 = u32::from_str_radix(g1, 16).map_err(|_| invalid())?;
        let data2 = u16::from_str_radix(g2, 16).map_err(|_| invalid())?;
        let data3 = u16::from_str_radix(g3, 16).map_err(|_| invalid())?;

        let tail = format!("{g4}{g5}");
        let mut data4 = [0u8; 8];
        for (i, byte) in data4.iter_mut().enumerate() {
            let pair = tail.get(i * 2..i * 2 + 2).ok_or_else(invalid)?;
            *byte = u8::from_str_radix(pair, 16).map_err(|_| invalid())?;
        }

        Ok(Self::new(data1, data2, data3, data4))
    }
}

impl Serialize for Guid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Guid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
