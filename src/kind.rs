//! Wire type codes and signature strings.

use std::{borrow::Borrow, ffi::CString, fmt, ops::Deref};

use num_enum::TryFromPrimitive;

use crate::error::{Error, Result};

/// One argument kind of the wire type system. The discriminants are the
/// single-byte codes used inside signatures.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, TryFromPrimitive)]
#[repr(i8)]
pub enum ArgKind {
    Invalid = 0,
    // basic types
    Byte = b'y' as i8,
    Bool = b'b' as i8,
    I16 = b'n' as i8,
    U16 = b'q' as i8,
    I32 = b'i' as i8,
    U32 = b'u' as i8,
    I64 = b'x' as i8,
    U64 = b't' as i8,
    Double = b'd' as i8,
    String = b's' as i8,
    ObjPath = b'o' as i8,
    Signature = b'g' as i8,
    UnixFd = b'h' as i8,
    // container types
    Array = b'a' as i8,
    Variant = b'v' as i8,
    Struct = b'r' as i8,
    DictEntry = b'e' as i8,
}

impl ArgKind {
    /// Fixed-shape scalars and the string-like types.
    pub fn is_basic(self) -> bool {
        matches!(
            self,
            Self::Byte
                | Self::Bool
                | Self::I16
                | Self::U16
                | Self::I32
                | Self::U32
                | Self::I64
                | Self::U64
                | Self::Double
                | Self::String
                | Self::ObjPath
                | Self::Signature
                | Self::UnixFd
        )
    }

    pub fn is_container(self) -> bool {
        matches!(self, Self::Array | Self::Variant | Self::Struct | Self::DictEntry)
    }

    /// The signature character. Struct and dict-entry have no single-char
    /// code inside signatures, they use their delimiters instead.
    pub fn code(self) -> char {
        self as i8 as u8 as char
    }

    pub(crate) fn from_raw(raw: std::ffi::c_int) -> Self {
        i8::try_from(raw).ok().and_then(|v| Self::try_from(v).ok()).unwrap_or(Self::Invalid)
    }
}

impl fmt::Display for ArgKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

// Signature alphabet delimiters.
const STRUCT_BEGIN: char = '(';
const STRUCT_END: char = ')';
const DICT_BEGIN: char = '{';
const DICT_END: char = '}';

/// Containers may nest at most this deep, matching the wire format limit.
const MAX_DEPTH: usize = 32;

/// A validated signature string: a sequence of complete types.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Signature {
    inner: String,
}

impl Signature {
    /// The empty signature, valid for a message without body arguments.
    pub fn empty() -> Self {
        Self { inner: String::new() }
    }

    /// Validate `text` as a sequence of complete types.
    pub fn new(text: impl Into<String>) -> Result<Self> {
        let text = text.into();
        validate(&text)?;
        Ok(Self { inner: text })
    }

    /// The single-character signature of a basic kind or variant.
    pub fn single(kind: ArgKind) -> Self {
        debug_assert!(kind.is_basic() || kind == ArgKind::Variant);
        Self { inner: kind.code().to_string() }
    }

    pub fn array_of(element: &Signature) -> Self {
        Self { inner: format!("a{}", element.inner) }
    }

    pub fn struct_of<'a>(fields: impl IntoIterator<Item = &'a Signature>) -> Self {
        let mut inner = String::from(STRUCT_BEGIN);
        for field in fields {
            inner.push_str(&field.inner);
        }
        inner.push(STRUCT_END);
        Self { inner }
    }

    pub fn dict_entry(key: &Signature, value: &Signature) -> Self {
        Self { inner: format!("{{{}{}}}", key.inner, value.inner) }
    }

    pub fn as_str(&self) -> &str {
        &self.inner
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// True when the whole signature is one complete type.
    pub fn is_single(&self) -> bool {
        self.complete_types().count() == 1
    }

    /// Split into the component complete types.
    pub fn complete_types(&self) -> impl Iterator<Item = &str> + '_ {
        let mut rest = self.inner.as_str();
        std::iter::from_fn(move || {
            if rest.is_empty() {
                return None;
            }
            let len = complete_type_len(rest)
                .expect("validated signature always splits into complete types");
            let (head, tail) = rest.split_at(len);
            rest = tail;
            Some(head)
        })
    }

    /// The leading type code. `Struct`/`DictEntry` for delimited containers.
    pub fn first_kind(&self) -> ArgKind {
        match self.inner.chars().next() {
            None => ArgKind::Invalid,
            Some(STRUCT_BEGIN) => ArgKind::Struct,
            Some(DICT_BEGIN) => ArgKind::DictEntry,
            Some(c) => ArgKind::from_raw(c as std::ffi::c_int),
        }
    }

    pub(crate) fn to_cstring(&self) -> CString {
        // signatures never contain interior nuls
        CString::new(self.inner.as_bytes()).expect("signature contains no nul byte")
    }
}

impl Deref for Signature {
    type Target = str;
    fn deref(&self) -> &str {
        &self.inner
    }
}

impl Borrow<str> for Signature {
    fn borrow(&self) -> &str {
        &self.inner
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner)
    }
}

fn invalid(text: &str) -> Error {
    Error::InvalidSignature(text.to_string())
}

fn validate(text: &str) -> Result<()> {
    if !text.is_ascii() {
        return Err(invalid(text));
    }
    let mut rest = text;
    while !rest.is_empty() {
        let len = complete_type_len(rest).ok_or_else(|| invalid(text))?;
        rest = &rest[len..];
    }
    Ok(())
}

/// Length in bytes of the first complete type of `text`, or None when the
/// head of `text` is not a complete type.
fn complete_type_len(text: &str) -> Option<usize> {
    fn single(bytes: &[u8], pos: usize, depth: usize) -> Option<usize> {
        if depth > MAX_DEPTH {
            return None;
        }
        let head = *bytes.get(pos)? as char;
        match head {
            'y' | 'b' | 'n' | 'q' | 'i' | 'u' | 'x' | 't' | 'd' | 's' | 'o' | 'g' | 'h' | 'v' => {
                Some(pos + 1)
            }
            'a' => single(bytes, pos + 1, depth + 1),
            STRUCT_BEGIN => {
                let mut at = pos + 1;
                // empty structs are not a thing on the wire
                if *bytes.get(at)? as char == STRUCT_END {
                    return None;
                }
                while *bytes.get(at)? as char != STRUCT_END {
                    at = single(bytes, at, depth + 1)?;
                }
                Some(at + 1)
            }
            DICT_BEGIN => {
                let key = *bytes.get(pos + 1)? as char;
                let key_kind = ArgKind::from_raw(key as std::ffi::c_int);
                if !key_kind.is_basic() {
                    return None;
                }
                let after_value = single(bytes, pos + 2, depth + 1)?;
                if *bytes.get(after_value)? as char != DICT_END {
                    return None;
                }
                Some(after_value + 1)
            }
            _ => None,
        }
    }
    single(text.as_bytes(), 0, 0)
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn basic_predicates() {
        assert!(ArgKind::Byte.is_basic());
        assert!(ArgKind::ObjPath.is_basic());
        assert!(ArgKind::UnixFd.is_basic());
        assert!(!ArgKind::Array.is_basic());
        assert!(ArgKind::Array.is_container());
        assert!(ArgKind::Variant.is_container());
        assert!(ArgKind::Struct.is_container());
        assert!(ArgKind::DictEntry.is_container());
        assert!(!ArgKind::Bool.is_container());
    }

    #[test]
    fn well_formed() {
        for ok in ["", "y", "ai", "a{sv}", "aa{si}", "(ybnqiuxtdsogh)", "a(ii)", "av", "a{s(iu)}"] {
            assert!(Signature::new(ok).is_ok(), "{ok:?} should validate");
        }
    }

    #[test]
    fn malformed() {
        for bad in ["a", "(", "()", "{si}x{", "a{vs}", "{si", "z", "a{(i)u}", "(i"] {
            assert!(Signature::new(bad).is_err(), "{bad:?} should not validate");
        }
    }

    #[test]
    fn nesting_limit() {
        let deep = "a".repeat(40) + "i";
        assert!(Signature::new(deep).is_err());
        let fine = "a".repeat(20) + "i";
        assert!(Signature::new(fine).is_ok());
    }

    #[test]
    fn composition() {
        let inner = Signature::single(ArgKind::I32);
        assert_eq!(Signature::array_of(&inner).as_str(), "ai");
        let entry = Signature::dict_entry(&Signature::single(ArgKind::String), &inner);
        assert_eq!(Signature::array_of(&entry).as_str(), "a{si}");
        let st = Signature::struct_of([&Signature::single(ArgKind::Byte), &inner]);
        assert_eq!(st.as_str(), "(yi)");
    }

    #[test]
    fn complete_type_split() {
        let sig = Signature::new("ia{sv}(yy)t").unwrap();
        let parts: Vec<&str> = sig.complete_types().collect();
        assert_eq!(parts, vec!["i", "a{sv}", "(yy)", "t"]);
        assert!(!sig.is_single());
        assert!(Signature::new("a{sv}").unwrap().is_single());
    }

    #[test]
    fn first_kind() {
        assert_eq!(Signature::new("a{sv}").unwrap().first_kind(), ArgKind::Array);
        assert_eq!(Signature::new("(ii)").unwrap().first_kind(), ArgKind::Struct);
        assert_eq!(Signature::new("s").unwrap().first_kind(), ArgKind::String);
        assert_eq!(Signature::empty().first_kind(), ArgKind::Invalid);
    }
}
