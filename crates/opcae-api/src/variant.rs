// ── Tagged attribute values (VARIANT) ──
//
// The raw layout is a 16-bit type tag, three reserved words and a payload
// union two pointers wide. Decoding never takes ownership: strings and arrays
// are copied out and the foreign buffer is left to whoever owns it.

use std::fmt;
use std::mem::size_of;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DecodeError;
use crate::hresult::Hresult;
use crate::time::ole_date_to_utc;
use crate::wide::read_wide;

/// Deepest `VT_ARRAY | VT_VARIANT` nesting the decoder will follow.
pub const MAX_NESTING: usize = 8;

// ── VarType ──────────────────────────────────────────────────────────

/// The VARIANT discriminant.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VarType(pub u16);

impl VarType {
    pub const EMPTY: Self = Self(0);
    pub const NULL: Self = Self(1);
    pub const I2: Self = Self(2);
    pub const I4: Self = Self(3);
    pub const R4: Self = Self(4);
    pub const R8: Self = Self(5);
    pub const CY: Self = Self(6);
    pub const DATE: Self = Self(7);
    pub const BSTR: Self = Self(8);
    pub const DISPATCH: Self = Self(9);
    pub const ERROR: Self = Self(10);
    pub const BOOL: Self = Self(11);
    pub const VARIANT: Self = Self(12);
    pub const UNKNOWN: Self = Self(13);
    pub const DECIMAL: Self = Self(14);
    pub const I1: Self = Self(16);
    pub const UI1: Self = Self(17);
    pub const UI2: Self = Self(18);
    pub const UI4: Self = Self(19);
    pub const I8: Self = Self(20);
    pub const UI8: Self = Self(21);
    pub const INT: Self = Self(22);
    pub const UINT: Self = Self(23);
    pub const RECORD: Self = Self(36);

    pub const ARRAY: u16 = 0x2000;
    pub const BYREF: u16 = 0x4000;
    const TYPE_MASK: u16 = 0x0FFF;

    pub fn is_array(self) -> bool {
        self.0 & Self::ARRAY != 0
    }

    pub fn is_byref(self) -> bool {
        self.0 & Self::BYREF != 0
    }

    /// The element type with modifier bits stripped.
    pub fn base(self) -> Self {
        Self(self.0 & Self::TYPE_MASK)
    }

    pub fn array_of(self) -> Self {
        Self(self.0 | Self::ARRAY)
    }

    /// Byte width of one element of this type inside a SAFEARRAY.
    fn element_size(self) -> Option<usize> {
        let size = match self {
            Self::I1 | Self::UI1 => 1,
            Self::I2 | Self::UI2 | Self::BOOL => 2,
            Self::I4 | Self::UI4 | Self::INT | Self::UINT | Self::R4 | Self::ERROR => 4,
            Self::I8 | Self::UI8 | Self::R8 | Self::DATE => 8,
            Self::BSTR => size_of::<*mut u16>(),
            Self::VARIANT => size_of::<RawVariant>(),
            _ => return None,
        };
        Some(size)
    }
}

impl fmt::Debug for VarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VarType(0x{:04X})", self.0)
    }
}

// ── Raw layout ───────────────────────────────────────────────────────

/// Payload union of a VARIANT.
#[repr(C)]
#[derive(Clone, Copy)]
pub union VariantData {
    pub i8_val: i8,
    pub u8_val: u8,
    pub i16_val: i16,
    pub u16_val: u16,
    pub i32_val: i32,
    pub u32_val: u32,
    pub i64_val: i64,
    pub u64_val: u64,
    pub f32_val: f32,
    pub f64_val: f64,
    /// `VARIANT_BOOL`: `-1` is true, `0` is false.
    pub bool_val: i16,
    pub scode: i32,
    pub date: f64,
    pub bstr: *mut u16,
    pub parray: *mut SafeArray,
    /// Sizes the union like the widest member (`BRECORD`: two pointers).
    pub pad: [usize; 2],
}

/// VARIANT as laid out in foreign memory.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct RawVariant {
    pub vt: u16,
    pub reserved1: u16,
    pub reserved2: u16,
    pub reserved3: u16,
    pub data: VariantData,
}

impl RawVariant {
    pub const fn empty() -> Self {
        Self {
            vt: 0,
            reserved1: 0,
            reserved2: 0,
            reserved3: 0,
            data: VariantData { pad: [0; 2] },
        }
    }

    pub fn var_type(&self) -> VarType {
        VarType(self.vt)
    }
}

impl Default for RawVariant {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for RawVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawVariant")
            .field("vt", &self.var_type())
            .finish_non_exhaustive()
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SafeArrayBound {
    pub elements: u32,
    pub lower_bound: i32,
}

/// One-dimensional SAFEARRAY descriptor. Higher ranks append further bounds
/// after `bounds`; the decoder rejects them before reading past the first.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SafeArray {
    pub dims: u16,
    pub features: u16,
    pub element_size: u32,
    pub locks: u32,
    pub data: *mut std::ffi::c_void,
    pub bounds: [SafeArrayBound; 1],
}

// ── Owned value ──────────────────────────────────────────────────────

/// A decoded, fully owned attribute value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Variant {
    Empty,
    Null,
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    String(String),
    Date(DateTime<Utc>),
    Error(Hresult),
    Bytes(Vec<u8>),
    Array(Vec<Variant>),
}

impl Variant {
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Widen any numeric variant to `f64`.
    #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
    pub fn as_f64(&self) -> Option<f64> {
        let value = match *self {
            Self::I8(v) => f64::from(v),
            Self::I16(v) => f64::from(v),
            Self::I32(v) => f64::from(v),
            Self::I64(v) => v as f64,
            Self::U8(v) => f64::from(v),
            Self::U16(v) => f64::from(v),
            Self::U32(v) => f64::from(v),
            Self::U64(v) => v as f64,
            Self::F32(v) => f64::from(v),
            Self::F64(v) => v,
            _ => return None,
        };
        Some(value)
    }

    /// The tag this value is encoded with.
    pub fn var_type(&self) -> VarType {
        match self {
            Self::Empty => VarType::EMPTY,
            Self::Null => VarType::NULL,
            Self::Bool(_) => VarType::BOOL,
            Self::I8(_) => VarType::I1,
            Self::I16(_) => VarType::I2,
            Self::I32(_) => VarType::I4,
            Self::I64(_) => VarType::I8,
            Self::U8(_) => VarType::UI1,
            Self::U16(_) => VarType::UI2,
            Self::U32(_) => VarType::UI4,
            Self::U64(_) => VarType::UI8,
            Self::F32(_) => VarType::R4,
            Self::F64(_) => VarType::R8,
            Self::String(_) => VarType::BSTR,
            Self::Date(_) => VarType::DATE,
            Self::Error(_) => VarType::ERROR,
            Self::Bytes(_) => VarType::UI1.array_of(),
            Self::Array(_) => VarType::VARIANT.array_of(),
        }
    }
}

// ── Decoding ─────────────────────────────────────────────────────────

/// Decode a VARIANT without taking ownership of anything it points to.
///
/// # Safety
///
/// Any string or SAFEARRAY pointers inside `raw` must be valid for reads for
/// the duration of the call.
pub unsafe fn decode_variant(raw: &RawVariant) -> Result<Variant, DecodeError> {
    // SAFETY: forwarded caller contract.
    unsafe { decode_at_depth(raw, 0) }
}

unsafe fn decode_at_depth(raw: &RawVariant, depth: usize) -> Result<Variant, DecodeError> {
    let vt = raw.var_type();
    if vt.is_byref() {
        return Err(DecodeError::UnsupportedVariantType(vt.0));
    }
    if vt.is_array() {
        // SAFETY: the tag says `parray` is the live union member.
        let parray = unsafe { raw.data.parray };
        // SAFETY: forwarded caller contract on the array pointer.
        return unsafe { decode_safe_array(vt.base(), parray, depth) };
    }

    // SAFETY: the tag selects which union member the server wrote; each arm
    // reads exactly that member.
    let value = unsafe {
        match vt {
            VarType::EMPTY => Variant::Empty,
            VarType::NULL => Variant::Null,
            VarType::BOOL => Variant::Bool(raw.data.bool_val != 0),
            VarType::I1 => Variant::I8(raw.data.i8_val),
            VarType::I2 => Variant::I16(raw.data.i16_val),
            VarType::I4 | VarType::INT => Variant::I32(raw.data.i32_val),
            VarType::I8 => Variant::I64(raw.data.i64_val),
            VarType::UI1 => Variant::U8(raw.data.u8_val),
            VarType::UI2 => Variant::U16(raw.data.u16_val),
            VarType::UI4 | VarType::UINT => Variant::U32(raw.data.u32_val),
            VarType::UI8 => Variant::U64(raw.data.u64_val),
            VarType::R4 => Variant::F32(raw.data.f32_val),
            VarType::R8 => Variant::F64(raw.data.f64_val),
            VarType::ERROR => Variant::Error(Hresult(raw.data.scode)),
            VarType::DATE => Variant::Date(ole_date_to_utc(raw.data.date, "VT_DATE")?),
            VarType::BSTR => Variant::String(read_wide(raw.data.bstr, "VT_BSTR")?),
            other => return Err(DecodeError::UnsupportedVariantType(other.0)),
        }
    };
    Ok(value)
}

unsafe fn decode_safe_array(
    element: VarType,
    parray: *const SafeArray,
    depth: usize,
) -> Result<Variant, DecodeError> {
    let array_vt = element.array_of();
    let expected = element
        .element_size()
        .ok_or(DecodeError::UnsupportedVariantType(array_vt.0))?;

    if parray.is_null() {
        return Ok(if element == VarType::UI1 {
            Variant::Bytes(Vec::new())
        } else {
            Variant::Array(Vec::new())
        });
    }
    if !parray.is_aligned() {
        return Err(DecodeError::Misaligned { field: "SAFEARRAY" });
    }
    // SAFETY: non-null and aligned; caller guarantees it is readable.
    let descriptor = unsafe { &*parray };
    if descriptor.dims != 1 {
        return Err(DecodeError::UnsupportedArrayRank(descriptor.dims));
    }
    let actual = usize::try_from(descriptor.element_size).unwrap_or(usize::MAX);
    if actual != expected {
        return Err(DecodeError::ElementSize {
            vt: array_vt.0,
            expected,
            actual,
        });
    }
    let count = usize::try_from(descriptor.bounds[0].elements).unwrap_or(usize::MAX);
    if count == 0 {
        return Ok(if element == VarType::UI1 {
            Variant::Bytes(Vec::new())
        } else {
            Variant::Array(Vec::new())
        });
    }
    let base = descriptor.data.cast::<u8>().cast_const();
    if base.is_null() {
        return Err(DecodeError::NullArray {
            field: "SAFEARRAY",
            count,
        });
    }

    if element == VarType::UI1 {
        // SAFETY: `count` bytes at `base` per the descriptor.
        let bytes = unsafe { std::slice::from_raw_parts(base, count) };
        return Ok(Variant::Bytes(bytes.to_vec()));
    }

    if element == VarType::VARIANT && depth + 1 >= MAX_NESTING {
        return Err(DecodeError::NestingTooDeep(MAX_NESTING));
    }

    let mut items = Vec::with_capacity(count);
    for index in 0..count {
        // SAFETY: index < count and the stride was checked against the
        // descriptor, so the element lies inside the array body.
        let at = unsafe { base.add(index * expected) };
        // SAFETY: `at` points at one element of type `element`.
        let item = unsafe { decode_element(element, at, depth) }.map_err(|source| {
            DecodeError::Attribute {
                index,
                source: Box::new(source),
            }
        })?;
        items.push(item);
    }
    Ok(Variant::Array(items))
}

/// Read one SAFEARRAY element. Elements are packed at their natural size,
/// so reads go through `read_unaligned`.
unsafe fn decode_element(
    element: VarType,
    at: *const u8,
    depth: usize,
) -> Result<Variant, DecodeError> {
    // SAFETY: `at` addresses one element of `element`'s width inside the
    // array body.
    let value = unsafe {
        match element {
            VarType::I1 => Variant::I8(at.cast::<i8>().read_unaligned()),
            VarType::I2 => Variant::I16(at.cast::<i16>().read_unaligned()),
            VarType::UI2 => Variant::U16(at.cast::<u16>().read_unaligned()),
            VarType::BOOL => Variant::Bool(at.cast::<i16>().read_unaligned() != 0),
            VarType::I4 | VarType::INT => Variant::I32(at.cast::<i32>().read_unaligned()),
            VarType::UI4 | VarType::UINT => Variant::U32(at.cast::<u32>().read_unaligned()),
            VarType::ERROR => Variant::Error(Hresult(at.cast::<i32>().read_unaligned())),
            VarType::R4 => Variant::F32(at.cast::<f32>().read_unaligned()),
            VarType::I8 => Variant::I64(at.cast::<i64>().read_unaligned()),
            VarType::UI8 => Variant::U64(at.cast::<u64>().read_unaligned()),
            VarType::R8 => Variant::F64(at.cast::<f64>().read_unaligned()),
            VarType::DATE => Variant::Date(ole_date_to_utc(
                at.cast::<f64>().read_unaligned(),
                "VT_ARRAY|VT_DATE",
            )?),
            VarType::BSTR => Variant::String(read_wide(
                at.cast::<*const u16>().read_unaligned(),
                "VT_ARRAY|VT_BSTR",
            )?),
            VarType::VARIANT => {
                let raw = at.cast::<RawVariant>().read_unaligned();
                decode_at_depth(&raw, depth + 1)?
            }
            other => return Err(DecodeError::UnsupportedVariantType(other.array_of().0)),
        }
    };
    Ok(value)
}
