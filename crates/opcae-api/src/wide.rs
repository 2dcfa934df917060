// ── Wide (UTF-16) strings across the boundary ──

use crate::error::{DecodeError, Error};

/// Upper bound on a single incoming string, in code units. Anything longer is
/// treated as a missing terminator rather than read indefinitely.
pub const MAX_WIDE_LEN: usize = 1 << 20;

/// A NUL-terminated UTF-16 buffer owned by the client, passed as `[in]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WideString(Vec<u16>);

impl WideString {
    /// Encode `s`; interior NULs cannot cross the contract and are refused.
    pub fn new(s: &str) -> Result<Self, Error> {
        if s.contains('\0') {
            return Err(Error::InvalidArgument {
                message: format!("string contains an interior NUL: {s:?}"),
            });
        }
        let mut units: Vec<u16> = s.encode_utf16().collect();
        units.push(0);
        Ok(Self(units))
    }

    pub fn as_ptr(&self) -> *const u16 {
        self.0.as_ptr()
    }

    /// Units including the terminator.
    pub fn as_slice(&self) -> &[u16] {
        &self.0
    }
}

/// A list of wide strings plus the pointer array the contract expects.
///
/// The pointer array borrows from `strings`, which is never mutated after
/// construction, so the pointers stay valid for the life of the value.
#[derive(Debug)]
pub struct WideStringList {
    strings: Vec<WideString>,
    pointers: Vec<*const u16>,
}

impl WideStringList {
    pub fn new<S: AsRef<str>>(items: &[S]) -> Result<Self, Error> {
        let strings = items
            .iter()
            .map(|s| WideString::new(s.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        let pointers = strings.iter().map(WideString::as_ptr).collect();
        Ok(Self { strings, pointers })
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }

    pub fn count(&self) -> Result<u32, Error> {
        u32::try_from(self.len()).map_err(|_| Error::InvalidArgument {
            message: format!("{} strings exceed the contract's DWORD count", self.len()),
        })
    }

    /// Base of the pointer array, or null when the list is empty.
    pub fn as_ptr(&self) -> *const *const u16 {
        if self.pointers.is_empty() {
            std::ptr::null()
        } else {
            self.pointers.as_ptr()
        }
    }
}

/// Read a NUL-terminated UTF-16 string from foreign memory.
///
/// A null pointer reads as the empty string. Unpaired surrogates are replaced
/// with U+FFFD rather than failing the whole record.
///
/// # Safety
///
/// `ptr` must be null or point to readable memory holding a NUL-terminated
/// UTF-16 sequence (or at least `MAX_WIDE_LEN` readable units).
pub unsafe fn read_wide(ptr: *const u16, field: &'static str) -> Result<String, DecodeError> {
    if ptr.is_null() {
        return Ok(String::new());
    }
    let mut len = 0usize;
    loop {
        if len >= MAX_WIDE_LEN {
            return Err(DecodeError::UnterminatedString { field });
        }
        // SAFETY: caller guarantees units up to and including the terminator
        // are readable; we stop at the first NUL.
        if unsafe { ptr.add(len).read_unaligned() } == 0 {
            break;
        }
        len += 1;
    }
    // Foreign strings are 2-byte aligned in practice; `from_raw_parts`
    // requires it, so fall back to a copying read when they are not.
    let units: Vec<u16> = if ptr.is_aligned() {
        // SAFETY: the `len` units before the terminator were just read above.
        unsafe { std::slice::from_raw_parts(ptr, len) }.to_vec()
    } else {
        (0..len)
            // SAFETY: same range as above, read unit by unit.
            .map(|i| unsafe { ptr.add(i).read_unaligned() })
            .collect()
    };
    Ok(String::from_utf16_lossy(&units))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn encode_appends_terminator() {
        let w = WideString::new("Tank1").unwrap();
        assert_eq!(w.as_slice().last(), Some(&0));
        assert_eq!(w.as_slice().len(), 6);
    }

    #[test]
    fn interior_nul_is_refused() {
        assert!(matches!(
            WideString::new("a\0b"),
            Err(Error::InvalidArgument { .. })
        ));
    }

    #[test]
    fn read_round_trips_non_ascii() {
        let w = WideString::new("Kessel Ü-7 \u{1F525}").unwrap();
        // SAFETY: `w` is a NUL-terminated buffer we own.
        let back = unsafe { read_wide(w.as_ptr(), "s") }.unwrap();
        assert_eq!(back, "Kessel Ü-7 \u{1F525}");
    }

    #[test]
    fn null_reads_as_empty() {
        // SAFETY: null is explicitly allowed.
        assert_eq!(unsafe { read_wide(std::ptr::null(), "s") }.unwrap(), "");
    }

    #[test]
    fn empty_list_passes_null() {
        let list = WideStringList::new::<&str>(&[]).unwrap();
        assert!(list.as_ptr().is_null());
        assert_eq!(list.count().unwrap(), 0);
    }
}
