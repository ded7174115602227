//! Typed marshaling between host values and the wire type system.
//!
//! Everything that crosses the message boundary implements [`Arg`]. The
//! statically shaped types answer [`Arg::kind`]/[`Arg::signature`] at the
//! type level, the dynamic [`Value`] sum type only knows its shape per
//! instance and panics when asked for a static one.

use std::{
    collections::HashMap,
    hash::Hash,
    os::fd::{AsRawFd, OwnedFd},
};

use crate::{
    error::{Error, Result},
    kind::{ArgKind, Signature},
    message::{Appender, Message, MessageKind, Reader},
};

/// A value that can be written to and read from a message body.
pub trait Arg: Sized {
    /// The compile-time type code. Panics for dynamic shapes.
    fn kind() -> ArgKind;

    /// The compile-time signature. Panics for dynamic shapes.
    fn signature() -> Signature;

    /// The compile-time signature, None for dynamic shapes.
    fn static_signature() -> Option<Signature> {
        Some(Self::signature())
    }

    fn runtime_kind(&self) -> ArgKind {
        Self::kind()
    }

    fn runtime_signature(&self) -> Signature {
        Self::signature()
    }

    /// Consume one value from the cursor.
    fn read(reader: &mut Reader<'_>) -> Result<Self>;

    /// Append one value through the cursor.
    fn write(&self, appender: &mut Appender<'_>) -> Result<()>;
}

/// Re-encode a value as another argument type by writing it into a scratch
/// message and reading it back through the target reader.
pub fn cast<T: Arg, U: Arg>(value: &T) -> Result<U> {
    let mut scratch = Message::new(MessageKind::MethodCall)?;
    value.write(&mut scratch.appender())?;
    U::read(&mut scratch.reader())
}

fn end_of_body() -> Error {
    Error::InvalidArgs("expected another argument, message body ended".into())
}

// #### basic kinds ####

macro_rules! impl_fixed_arg {
    ($(($kind:ident: $t:ty)),*,) => {
        $(
            impl Arg for $t {
                fn kind() -> ArgKind { ArgKind::$kind }
                fn signature() -> Signature { Signature::single(ArgKind::$kind) }
                fn read(reader: &mut Reader<'_>) -> Result<Self> {
                    reader.take_fixed(ArgKind::$kind)
                }
                fn write(&self, appender: &mut Appender<'_>) -> Result<()> {
                    appender.put_fixed(ArgKind::$kind, *self)
                }
            }
        )*
    };
}

impl_fixed_arg!(
    (Byte: u8),
    (I16: i16),
    (U16: u16),
    (I32: i32),
    (U32: u32),
    (I64: i64),
    (U64: u64),
    (Double: f64),
);

impl Arg for bool {
    fn kind() -> ArgKind {
        ArgKind::Bool
    }
    fn signature() -> Signature {
        Signature::single(ArgKind::Bool)
    }
    fn read(reader: &mut Reader<'_>) -> Result<Self> {
        // booleans are a full dword on the wire
        let raw: u32 = reader.take_fixed(ArgKind::Bool)?;
        Ok(raw != 0)
    }
    fn write(&self, appender: &mut Appender<'_>) -> Result<()> {
        appender.put_fixed(ArgKind::Bool, *self as u32)
    }
}

impl Arg for String {
    fn kind() -> ArgKind {
        ArgKind::String
    }
    fn signature() -> Signature {
        Signature::single(ArgKind::String)
    }
    fn read(reader: &mut Reader<'_>) -> Result<Self> {
        reader.take_str(ArgKind::String)
    }
    fn write(&self, appender: &mut Appender<'_>) -> Result<()> {
        appender.put_str(ArgKind::String, self)
    }
}

/// Borrowed strings are write-only: reading produces an owned [`String`].
impl Arg for &str {
    fn kind() -> ArgKind {
        ArgKind::String
    }
    fn signature() -> Signature {
        Signature::single(ArgKind::String)
    }
    fn read(_reader: &mut Reader<'_>) -> Result<Self> {
        unreachable!("borrowed strings cannot be read out of a message, read String")
    }
    fn write(&self, appender: &mut Appender<'_>) -> Result<()> {
        appender.put_str(ArgKind::String, self)
    }
}

/// A slash-delimited object path, same wire shape as a string.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObjectPath(pub String);

impl ObjectPath {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ObjectPath {
    fn from(path: &str) -> Self {
        Self(path.into())
    }
}

impl Arg for ObjectPath {
    fn kind() -> ArgKind {
        ArgKind::ObjPath
    }
    fn signature() -> Signature {
        Signature::single(ArgKind::ObjPath)
    }
    fn read(reader: &mut Reader<'_>) -> Result<Self> {
        reader.take_str(ArgKind::ObjPath).map(Self)
    }
    fn write(&self, appender: &mut Appender<'_>) -> Result<()> {
        appender.put_str(ArgKind::ObjPath, &self.0)
    }
}

impl Arg for Signature {
    fn kind() -> ArgKind {
        ArgKind::Signature
    }
    fn signature() -> Signature {
        Signature::single(ArgKind::Signature)
    }
    fn read(reader: &mut Reader<'_>) -> Result<Self> {
        let text = reader.take_str(ArgKind::Signature)?;
        Signature::new(text)
    }
    fn write(&self, appender: &mut Appender<'_>) -> Result<()> {
        appender.put_str(ArgKind::Signature, self.as_str())
    }
}

/// File descriptors are attached out-of-band; the transport duplicates on
/// both append and read, so both sides end up with their own descriptor.
impl Arg for OwnedFd {
    fn kind() -> ArgKind {
        ArgKind::UnixFd
    }
    fn signature() -> Signature {
        Signature::single(ArgKind::UnixFd)
    }
    fn read(reader: &mut Reader<'_>) -> Result<Self> {
        reader.take_fd()
    }
    fn write(&self, appender: &mut Appender<'_>) -> Result<()> {
        appender.put_fd(self.as_raw_fd())
    }
}

// #### containers ####

/// A value boxed together with its own signature on the wire.
#[derive(Clone, Debug, PartialEq)]
pub struct Variant<T>(pub T);

impl<T> Variant<T> {
    pub fn new(inner: T) -> Self {
        Self(inner)
    }
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T: Arg> Arg for Variant<T> {
    fn kind() -> ArgKind {
        ArgKind::Variant
    }
    fn signature() -> Signature {
        Signature::single(ArgKind::Variant)
    }
    fn read(reader: &mut Reader<'_>) -> Result<Self> {
        reader.expect(ArgKind::Variant)?;
        let mut sub = reader.recurse();
        let inner = T::read(&mut sub)?;
        drop(sub);
        reader.advance();
        Ok(Self(inner))
    }
    fn write(&self, appender: &mut Appender<'_>) -> Result<()> {
        let contents = self.0.runtime_signature();
        appender.put_container(ArgKind::Variant, Some(&contents), |sub| self.0.write(sub))
    }
}

/// Element signature used when writing out an array: the static one for an
/// empty array, the first element's runtime one otherwise. Both must agree
/// when both exist, and dynamic elements must be homogeneous.
fn array_element_signature<T: Arg>(items: &[T]) -> Result<Signature> {
    match items.first() {
        Some(first) => {
            let runtime = first.runtime_signature();
            if let Some(stat) = T::static_signature() {
                if stat != runtime {
                    return Err(Error::InvalidSignature(format!(
                        "array element signature {runtime} does not match declared {stat}"
                    )));
                }
            } else {
                for item in &items[1..] {
                    let other = item.runtime_signature();
                    if other != runtime {
                        return Err(Error::InvalidSignature(format!(
                            "array mixes element signatures {runtime} and {other}"
                        )));
                    }
                }
            }
            Ok(runtime)
        }
        None => T::static_signature().ok_or_else(|| {
            Error::InvalidSignature("empty array of dynamic values has no element signature".into())
        }),
    }
}

impl<T: Arg> Arg for Vec<T> {
    fn kind() -> ArgKind {
        ArgKind::Array
    }
    fn signature() -> Signature {
        Signature::array_of(&T::signature())
    }
    fn static_signature() -> Option<Signature> {
        T::static_signature().map(|s| Signature::array_of(&s))
    }
    fn runtime_signature(&self) -> Signature {
        match self.first() {
            Some(first) => Signature::array_of(&first.runtime_signature()),
            None => Self::signature(),
        }
    }
    fn read(reader: &mut Reader<'_>) -> Result<Self> {
        reader.expect(ArgKind::Array)?;
        let mut out = Vec::new();
        let mut sub = reader.recurse();
        while sub.arg_kind() != ArgKind::Invalid {
            out.push(T::read(&mut sub)?);
        }
        drop(sub);
        reader.advance();
        Ok(out)
    }
    fn write(&self, appender: &mut Appender<'_>) -> Result<()> {
        let element = array_element_signature(self)?;
        appender.put_container(ArgKind::Array, Some(&element), |sub| {
            for item in self {
                item.write(sub)?;
            }
            Ok(())
        })
    }
}

/// One dictionary entry. Only meaningful inside an array, but exposed so
/// entry-shaped values can be built and inspected on their own.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DictEntry<K, V>(pub K, pub V);

impl<K: Arg, V: Arg> Arg for DictEntry<K, V> {
    fn kind() -> ArgKind {
        ArgKind::DictEntry
    }
    fn signature() -> Signature {
        Signature::dict_entry(&K::signature(), &V::signature())
    }
    fn static_signature() -> Option<Signature> {
        Some(Signature::dict_entry(&K::static_signature()?, &V::static_signature()?))
    }
    fn runtime_signature(&self) -> Signature {
        Signature::dict_entry(&self.0.runtime_signature(), &self.1.runtime_signature())
    }
    fn read(reader: &mut Reader<'_>) -> Result<Self> {
        reader.expect(ArgKind::DictEntry)?;
        let mut sub = reader.recurse();
        let key = K::read(&mut sub)?;
        let value = V::read(&mut sub)?;
        drop(sub);
        reader.advance();
        Ok(Self(key, value))
    }
    fn write(&self, appender: &mut Appender<'_>) -> Result<()> {
        if !self.0.runtime_kind().is_basic() {
            return Err(Error::InvalidSignature("dictionary keys must be basic".into()));
        }
        appender.put_container(ArgKind::DictEntry, None, |sub| {
            self.0.write(sub)?;
            self.1.write(sub)
        })
    }
}

impl<K: Arg + Eq + Hash, V: Arg> Arg for HashMap<K, V> {
    fn kind() -> ArgKind {
        ArgKind::Array
    }
    fn signature() -> Signature {
        Signature::array_of(&Signature::dict_entry(&K::signature(), &V::signature()))
    }
    fn static_signature() -> Option<Signature> {
        let entry = Signature::dict_entry(&K::static_signature()?, &V::static_signature()?);
        Some(Signature::array_of(&entry))
    }
    fn runtime_signature(&self) -> Signature {
        match self.iter().next() {
            Some((key, value)) => Signature::array_of(&Signature::dict_entry(
                &key.runtime_signature(),
                &value.runtime_signature(),
            )),
            None => Self::signature(),
        }
    }
    fn read(reader: &mut Reader<'_>) -> Result<Self> {
        reader.expect(ArgKind::Array)?;
        let mut out = HashMap::new();
        let mut entries = reader.recurse();
        while entries.arg_kind() != ArgKind::Invalid {
            entries.expect(ArgKind::DictEntry)?;
            let mut pair = entries.recurse();
            let key = K::read(&mut pair)?;
            let value = V::read(&mut pair)?;
            drop(pair);
            entries.advance();
            out.insert(key, value);
        }
        drop(entries);
        reader.advance();
        Ok(out)
    }
    fn write(&self, appender: &mut Appender<'_>) -> Result<()> {
        let (key_sig, value_sig) = match self.iter().next() {
            Some((key, value)) => (key.runtime_signature(), value.runtime_signature()),
            None => (
                K::static_signature().ok_or_else(|| {
                    Error::InvalidSignature("empty map of dynamic keys has no signature".into())
                })?,
                V::static_signature().ok_or_else(|| {
                    Error::InvalidSignature("empty map of dynamic values has no signature".into())
                })?,
            ),
        };
        if key_sig.first_kind().is_container() {
            return Err(Error::InvalidSignature("dictionary keys must be basic".into()));
        }
        if V::static_signature().is_none() {
            for value in self.values() {
                let other = value.runtime_signature();
                if other != value_sig {
                    return Err(Error::InvalidSignature(format!(
                        "map mixes value signatures {value_sig} and {other}"
                    )));
                }
            }
        }
        let entry = Signature::dict_entry(&key_sig, &value_sig);
        appender.put_container(ArgKind::Array, Some(&entry), |entries| {
            for (key, value) in self {
                entries.put_container(ArgKind::DictEntry, None, |pair| {
                    key.write(pair)?;
                    value.write(pair)
                })?;
            }
            Ok(())
        })
    }
}

/// Tuples map to wire structs, field order is declaration order.
macro_rules! impl_tuple_arg {
    ($([$(($idx:tt, $big:ident)),+])*) => {
        $(
            impl<$($big: Arg,)+> Arg for ($($big,)+) {
                fn kind() -> ArgKind { ArgKind::Struct }
                fn signature() -> Signature {
                    Signature::struct_of([$(&$big::signature(),)+])
                }
                fn static_signature() -> Option<Signature> {
                    Some(Signature::struct_of([$(&$big::static_signature()?,)+]))
                }
                fn runtime_signature(&self) -> Signature {
                    Signature::struct_of([$(&self.$idx.runtime_signature(),)+])
                }
                fn read(reader: &mut Reader<'_>) -> Result<Self> {
                    reader.expect(ArgKind::Struct)?;
                    let mut sub = reader.recurse();
                    let out = ($($big::read(&mut sub)?,)+);
                    drop(sub);
                    reader.advance();
                    Ok(out)
                }
                fn write(&self, appender: &mut Appender<'_>) -> Result<()> {
                    appender.put_container(ArgKind::Struct, None, |sub| {
                        $(self.$idx.write(sub)?;)+
                        Ok(())
                    })
                }
            }
        )*
    };
}

impl_tuple_arg!(
    [(0, T0)]
    [(0, T0), (1, T1)]
    [(0, T0), (1, T1), (2, T2)]
    [(0, T0), (1, T1), (2, T2), (3, T3)]
    [(0, T0), (1, T1), (2, T2), (3, T3), (4, T4)]
    [(0, T0), (1, T1), (2, T2), (3, T3), (4, T4), (5, T5)]
    [(0, T0), (1, T1), (2, T2), (3, T3), (4, T4), (5, T5), (6, T6)]
    [(0, T0), (1, T1), (2, T2), (3, T3), (4, T4), (5, T5), (6, T6), (7, T7)]
    [(0, T0), (1, T1), (2, T2), (3, T3), (4, T4), (5, T5), (6, T6), (7, T7), (8, T8)]
    [(0, T0), (1, T1), (2, T2), (3, T3), (4, T4), (5, T5), (6, T6), (7, T7), (8, T8), (9, T9)]
    [(0, T0), (1, T1), (2, T2), (3, T3), (4, T4), (5, T5), (6, T6), (7, T7), (8, T8), (9, T9), (10, T10)]
    [(0, T0), (1, T1), (2, T2), (3, T3), (4, T4), (5, T5), (6, T6), (7, T7), (8, T8), (9, T9), (10, T10), (11, T11)]
);

// #### argument lists ####

/// A set of values appended to a message body as separate arguments.
/// Tuples spread into one argument each, every other type is one argument.
pub trait AppendAll {
    fn append_all(&self, appender: &mut Appender<'_>) -> Result<()>;
}

/// A set of values read out of a message body. Tuples read one argument per
/// element, every other type reads a single argument directly.
pub trait ReadAll: Sized {
    fn read_all(reader: &mut Reader<'_>) -> Result<Self>;
}

impl AppendAll for () {
    fn append_all(&self, _appender: &mut Appender<'_>) -> Result<()> {
        Ok(())
    }
}

impl ReadAll for () {
    fn read_all(_reader: &mut Reader<'_>) -> Result<Self> {
        Ok(())
    }
}

macro_rules! impl_arg_list_tuple {
    ($([$(($idx:tt, $big:ident)),+])*) => {
        $(
            impl<$($big: Arg,)+> AppendAll for ($($big,)+) {
                fn append_all(&self, appender: &mut Appender<'_>) -> Result<()> {
                    $(self.$idx.write(appender)?;)+
                    Ok(())
                }
            }
            impl<$($big: Arg,)+> ReadAll for ($($big,)+) {
                fn read_all(reader: &mut Reader<'_>) -> Result<Self> {
                    Ok(($($big::read(reader)?,)+))
                }
            }
        )*
    };
}

impl_arg_list_tuple!(
    [(0, T0)]
    [(0, T0), (1, T1)]
    [(0, T0), (1, T1), (2, T2)]
    [(0, T0), (1, T1), (2, T2), (3, T3)]
    [(0, T0), (1, T1), (2, T2), (3, T3), (4, T4)]
    [(0, T0), (1, T1), (2, T2), (3, T3), (4, T4), (5, T5)]
    [(0, T0), (1, T1), (2, T2), (3, T3), (4, T4), (5, T5), (6, T6)]
    [(0, T0), (1, T1), (2, T2), (3, T3), (4, T4), (5, T5), (6, T6), (7, T7)]
    [(0, T0), (1, T1), (2, T2), (3, T3), (4, T4), (5, T5), (6, T6), (7, T7), (8, T8)]
    [(0, T0), (1, T1), (2, T2), (3, T3), (4, T4), (5, T5), (6, T6), (7, T7), (8, T8), (9, T9)]
    [(0, T0), (1, T1), (2, T2), (3, T3), (4, T4), (5, T5), (6, T6), (7, T7), (8, T8), (9, T9), (10, T10)]
    [(0, T0), (1, T1), (2, T2), (3, T3), (4, T4), (5, T5), (6, T6), (7, T7), (8, T8), (9, T9), (10, T10), (11, T11)]
);

/// Non-tuple results and arguments pass through directly.
macro_rules! impl_arg_list_single {
    ($($t:ty),*,) => {
        $(
            impl AppendAll for $t {
                fn append_all(&self, appender: &mut Appender<'_>) -> Result<()> {
                    self.write(appender)
                }
            }
            impl ReadAll for $t {
                fn read_all(reader: &mut Reader<'_>) -> Result<Self> {
                    <$t as Arg>::read(reader)
                }
            }
        )*
    };
}

impl_arg_list_single!(
    u8, bool, i16, u16, i32, u32, i64, u64, f64,
    String, ObjectPath, Signature, OwnedFd, Value,
);

impl AppendAll for &str {
    fn append_all(&self, appender: &mut Appender<'_>) -> Result<()> {
        self.write(appender)
    }
}

impl<T: Arg> AppendAll for Vec<T> {
    fn append_all(&self, appender: &mut Appender<'_>) -> Result<()> {
        self.write(appender)
    }
}

impl<T: Arg> ReadAll for Vec<T> {
    fn read_all(reader: &mut Reader<'_>) -> Result<Self> {
        Self::read(reader)
    }
}

impl<K: Arg + Eq + Hash, V: Arg> AppendAll for HashMap<K, V> {
    fn append_all(&self, appender: &mut Appender<'_>) -> Result<()> {
        self.write(appender)
    }
}

impl<K: Arg + Eq + Hash, V: Arg> ReadAll for HashMap<K, V> {
    fn read_all(reader: &mut Reader<'_>) -> Result<Self> {
        Self::read(reader)
    }
}

impl<T: Arg> AppendAll for Variant<T> {
    fn append_all(&self, appender: &mut Appender<'_>) -> Result<()> {
        self.write(appender)
    }
}

impl<T: Arg> ReadAll for Variant<T> {
    fn read_all(reader: &mut Reader<'_>) -> Result<Self> {
        Self::read(reader)
    }
}

/// Decode a message body without consuming the message.
pub(crate) fn decode_body<R: ReadAll>(message: &Message) -> Result<R> {
    let mut copy = message.copy()?;
    R::read_all(&mut copy.reader())
}

// #### the dynamic value ####

/// A value whose shape is only known at runtime. Reading dispatches on the
/// cursor's current type code, writing forwards to the matching typed
/// writer. Asking a `Value` for a compile-time code or signature is a
/// programming error and panics.
#[derive(Debug)]
pub enum Value {
    Byte(u8),
    Bool(bool),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    Double(f64),
    Str(String),
    ObjPath(ObjectPath),
    Sig(Signature),
    Fd(OwnedFd),
    /// Items plus their shared element signature, kept so empty arrays stay
    /// writable.
    Array(Signature, Vec<Value>),
    Variant(Box<Value>),
    Struct(Vec<Value>),
    DictEntry(Box<Value>, Box<Value>),
}

impl Clone for Value {
    fn clone(&self) -> Self {
        match self {
            Self::Byte(v) => Self::Byte(*v),
            Self::Bool(v) => Self::Bool(*v),
            Self::I16(v) => Self::I16(*v),
            Self::U16(v) => Self::U16(*v),
            Self::I32(v) => Self::I32(*v),
            Self::U32(v) => Self::U32(*v),
            Self::I64(v) => Self::I64(*v),
            Self::U64(v) => Self::U64(*v),
            Self::Double(v) => Self::Double(*v),
            Self::Str(v) => Self::Str(v.clone()),
            Self::ObjPath(v) => Self::ObjPath(v.clone()),
            Self::Sig(v) => Self::Sig(v.clone()),
            Self::Fd(v) => {
                Self::Fd(v.try_clone().expect("failed to duplicate fd while cloning a Value"))
            }
            Self::Array(sig, items) => Self::Array(sig.clone(), items.clone()),
            Self::Variant(inner) => Self::Variant(inner.clone()),
            Self::Struct(fields) => Self::Struct(fields.clone()),
            Self::DictEntry(k, v) => Self::DictEntry(k.clone(), v.clone()),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        use Value::*;
        match (self, other) {
            (Byte(a), Byte(b)) => a == b,
            (Bool(a), Bool(b)) => a == b,
            (I16(a), I16(b)) => a == b,
            (U16(a), U16(b)) => a == b,
            (I32(a), I32(b)) => a == b,
            (U32(a), U32(b)) => a == b,
            (I64(a), I64(b)) => a == b,
            (U64(a), U64(b)) => a == b,
            (Double(a), Double(b)) => a == b,
            (Str(a), Str(b)) => a == b,
            (ObjPath(a), ObjPath(b)) => a == b,
            (Sig(a), Sig(b)) => a == b,
            (Fd(a), Fd(b)) => a.as_raw_fd() == b.as_raw_fd(),
            (Array(sa, a), Array(sb, b)) => sa == sb && a == b,
            (Variant(a), Variant(b)) => a == b,
            (Struct(a), Struct(b)) => a == b,
            (DictEntry(ka, va), DictEntry(kb, vb)) => ka == kb && va == vb,
            _ => false,
        }
    }
}

impl Value {
    /// Build an array value, taking the element signature from the items.
    pub fn array(items: Vec<Value>) -> Result<Self> {
        let first = items
            .first()
            .ok_or_else(|| {
                Error::InvalidSignature("cannot infer the element signature of an empty array".into())
            })?
            .runtime_signature();
        for item in &items[1..] {
            let other = item.runtime_signature();
            if other != first {
                return Err(Error::InvalidSignature(format!(
                    "array mixes element signatures {first} and {other}"
                )));
            }
        }
        Ok(Self::Array(first, items))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(v) => Some(v),
            Self::ObjPath(v) => Some(v.as_str()),
            Self::Sig(v) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::Byte(v) => Some(*v as u64),
            Self::U16(v) => Some(*v as u64),
            Self::U32(v) => Some(*v as u64),
            Self::U64(v) => Some(*v),
            _ => None,
        }
    }
}

impl Arg for Value {
    fn kind() -> ArgKind {
        panic!("the type code of a dynamic value is only known at runtime")
    }

    fn signature() -> Signature {
        panic!("the signature of a dynamic value is only known at runtime")
    }

    fn static_signature() -> Option<Signature> {
        None
    }

    fn runtime_kind(&self) -> ArgKind {
        match self {
            Self::Byte(..) => ArgKind::Byte,
            Self::Bool(..) => ArgKind::Bool,
            Self::I16(..) => ArgKind::I16,
            Self::U16(..) => ArgKind::U16,
            Self::I32(..) => ArgKind::I32,
            Self::U32(..) => ArgKind::U32,
            Self::I64(..) => ArgKind::I64,
            Self::U64(..) => ArgKind::U64,
            Self::Double(..) => ArgKind::Double,
            Self::Str(..) => ArgKind::String,
            Self::ObjPath(..) => ArgKind::ObjPath,
            Self::Sig(..) => ArgKind::Signature,
            Self::Fd(..) => ArgKind::UnixFd,
            Self::Array(..) => ArgKind::Array,
            Self::Variant(..) => ArgKind::Variant,
            Self::Struct(..) => ArgKind::Struct,
            Self::DictEntry(..) => ArgKind::DictEntry,
        }
    }

    fn runtime_signature(&self) -> Signature {
        match self {
            Self::Array(element, ..) => Signature::array_of(element),
            Self::Variant(..) => Signature::single(ArgKind::Variant),
            Self::Struct(fields) => {
                let sigs: Vec<Signature> =
                    fields.iter().map(|field| field.runtime_signature()).collect();
                Signature::struct_of(sigs.iter())
            }
            Self::DictEntry(key, value) => {
                Signature::dict_entry(&key.runtime_signature(), &value.runtime_signature())
            }
            other => Signature::single(other.runtime_kind()),
        }
    }

    fn read(reader: &mut Reader<'_>) -> Result<Self> {
        match reader.arg_kind() {
            ArgKind::Invalid => Err(end_of_body()),
            ArgKind::Byte => reader.take_fixed(ArgKind::Byte).map(Self::Byte),
            ArgKind::Bool => bool::read(reader).map(Self::Bool),
            ArgKind::I16 => reader.take_fixed(ArgKind::I16).map(Self::I16),
            ArgKind::U16 => reader.take_fixed(ArgKind::U16).map(Self::U16),
            ArgKind::I32 => reader.take_fixed(ArgKind::I32).map(Self::I32),
            ArgKind::U32 => reader.take_fixed(ArgKind::U32).map(Self::U32),
            ArgKind::I64 => reader.take_fixed(ArgKind::I64).map(Self::I64),
            ArgKind::U64 => reader.take_fixed(ArgKind::U64).map(Self::U64),
            ArgKind::Double => reader.take_fixed(ArgKind::Double).map(Self::Double),
            ArgKind::String => reader.take_str(ArgKind::String).map(Self::Str),
            ArgKind::ObjPath => {
                reader.take_str(ArgKind::ObjPath).map(|p| Self::ObjPath(ObjectPath(p)))
            }
            ArgKind::Signature => Signature::read(reader).map(Self::Sig),
            ArgKind::UnixFd => reader.take_fd().map(Self::Fd),
            ArgKind::Array => {
                let full = reader.arg_signature();
                let element = Signature::new(&full.as_str()[1..])?;
                let mut items = Vec::new();
                let mut sub = reader.recurse();
                while sub.arg_kind() != ArgKind::Invalid {
                    items.push(Value::read(&mut sub)?);
                }
                drop(sub);
                reader.advance();
                Ok(Self::Array(element, items))
            }
            ArgKind::Variant => {
                let mut sub = reader.recurse();
                let inner = Value::read(&mut sub)?;
                drop(sub);
                reader.advance();
                Ok(Self::Variant(Box::new(inner)))
            }
            ArgKind::Struct => {
                let mut fields = Vec::new();
                let mut sub = reader.recurse();
                while sub.arg_kind() != ArgKind::Invalid {
                    fields.push(Value::read(&mut sub)?);
                }
                drop(sub);
                reader.advance();
                Ok(Self::Struct(fields))
            }
            ArgKind::DictEntry => {
                let mut sub = reader.recurse();
                let key = Value::read(&mut sub)?;
                let value = Value::read(&mut sub)?;
                drop(sub);
                reader.advance();
                Ok(Self::DictEntry(Box::new(key), Box::new(value)))
            }
        }
    }

    fn write(&self, appender: &mut Appender<'_>) -> Result<()> {
        match self {
            Self::Byte(v) => v.write(appender),
            Self::Bool(v) => v.write(appender),
            Self::I16(v) => v.write(appender),
            Self::U16(v) => v.write(appender),
            Self::I32(v) => v.write(appender),
            Self::U32(v) => v.write(appender),
            Self::I64(v) => v.write(appender),
            Self::U64(v) => v.write(appender),
            Self::Double(v) => v.write(appender),
            Self::Str(v) => v.write(appender),
            Self::ObjPath(v) => v.write(appender),
            Self::Sig(v) => v.write(appender),
            Self::Fd(v) => v.write(appender),
            Self::Array(element, items) => {
                for item in items {
                    let other = item.runtime_signature();
                    if &other != element {
                        return Err(Error::InvalidSignature(format!(
                            "array declared {element} but holds an element of {other}"
                        )));
                    }
                }
                appender.put_container(ArgKind::Array, Some(element), |sub| {
                    for item in items {
                        item.write(sub)?;
                    }
                    Ok(())
                })
            }
            Self::Variant(inner) => {
                let contents = inner.runtime_signature();
                appender.put_container(ArgKind::Variant, Some(&contents), |sub| inner.write(sub))
            }
            Self::Struct(fields) => appender.put_container(ArgKind::Struct, None, |sub| {
                for field in fields {
                    field.write(sub)?;
                }
                Ok(())
            }),
            Self::DictEntry(key, value) => {
                if !key.runtime_kind().is_basic() {
                    return Err(Error::InvalidSignature("dictionary keys must be basic".into()));
                }
                appender.put_container(ArgKind::DictEntry, None, |sub| {
                    key.write(sub)?;
                    value.write(sub)
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use std::os::fd::AsFd;

    fn scratch() -> Message {
        Message::new(MessageKind::MethodCall).unwrap()
    }

    fn round_trip<T: Arg + PartialEq + std::fmt::Debug>(value: T) {
        let mut msg = scratch();
        value.write(&mut msg.appender()).unwrap();
        let back = T::read(&mut msg.reader()).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn scalars_round_trip() {
        round_trip(0x5au8);
        round_trip(true);
        round_trip(false);
        round_trip(-5i16);
        round_trip(5u16);
        round_trip(-70000i32);
        round_trip(70000u32);
        round_trip(-5_000_000_000i64);
        round_trip(5_000_000_000u64);
        round_trip(1.25f64);
        round_trip(String::from("hello wörld"));
        round_trip(ObjectPath::new("/org/freedesktop/DBus"));
        round_trip(Signature::new("a{sv}").unwrap());
    }

    #[test]
    fn containers_round_trip() {
        round_trip(vec![1u32, 2, 3]);
        round_trip(Vec::<String>::new());
        round_trip(vec![vec![1u8], vec![], vec![2, 3]]);
        round_trip(Variant(42i32));
        round_trip((1u8, "x".to_string(), vec![true, false]));

        let mut map = HashMap::new();
        map.insert("a".to_string(), 1i32);
        map.insert("b".to_string(), 2i32);
        round_trip(map);

        let mut keyed: HashMap<u32, String> = HashMap::new();
        keyed.insert(1, "one".into());
        keyed.insert(2, "two".into());
        round_trip(keyed);

        let mut nested: HashMap<String, Vec<u64>> = HashMap::new();
        nested.insert("xs".into(), vec![1, 2, 3]);
        round_trip(nested);

        round_trip(vec![DictEntry("k".to_string(), 9i32)]);
    }

    #[test]
    fn nested_struct_signature_matches_wire() {
        // all thirteen basic kinds in one struct; above the tuple ladder's
        // arity this is the dynamic struct's job
        let fd = std::io::stdin().as_fd().try_clone_to_owned().unwrap();
        let value = Value::Struct(vec![
            Value::Byte(0),
            Value::Bool(false),
            Value::I16(0),
            Value::U16(0),
            Value::I32(0),
            Value::U32(0),
            Value::I64(0),
            Value::U64(0),
            Value::Double(0.0),
            Value::Str(String::new()),
            Value::ObjPath(ObjectPath::new("/org/freedesktop/DBus")),
            Value::Sig(Signature::empty()),
            Value::Fd(fd),
        ]);
        assert_eq!(value.runtime_signature().as_str(), "(ybnqiuxtdsogh)");

        let mut msg = scratch();
        value.write(&mut msg.appender()).unwrap();
        assert_eq!(msg.signature().as_str(), "(ybnqiuxtdsogh)");

        let back = Value::read(&mut msg.reader()).unwrap();
        let (Value::Struct(sent), Value::Struct(got)) = (&value, &back) else { unreachable!() };
        // descriptors are duplicated in flight, compare everything before it
        assert_eq!(&sent[..12], &got[..12]);
        let Value::Fd(fd) = &got[12] else { panic!("expected a descriptor") };
        assert!(fd.as_raw_fd() >= 0);
    }

    #[test]
    fn dict_signatures() {
        assert_eq!(HashMap::<String, Variant<Value>>::signature().as_str(), "a{sv}");
        assert_eq!(Vec::<Vec<HashMap<String, i32>>>::signature().as_str(), "aaa{si}");
        assert_eq!(Vec::<HashMap<String, i32>>::signature().as_str(), "aa{si}");
    }

    #[test]
    fn signature_law_for_arrays() {
        let empty: Vec<i32> = vec![];
        assert_eq!(empty.runtime_signature().as_str(), "ai");
        let full = vec![(1u8, 2u16)];
        assert_eq!(full.runtime_signature().as_str(), "a(yq)");
    }

    #[test]
    fn dynamic_value_round_trip() {
        let value = Value::Struct(vec![
            Value::U32(7),
            Value::Variant(Box::new(Value::Str("x".into()))),
            Value::array(vec![Value::I64(1), Value::I64(2)]).unwrap(),
        ]);
        assert_eq!(value.runtime_signature().as_str(), "(uvax)");

        let mut msg = scratch();
        value.write(&mut msg.appender()).unwrap();
        let back = Value::read(&mut msg.reader()).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn heterogeneous_dynamic_array_is_rejected() {
        let err = Value::array(vec![Value::U32(1), Value::Str("no".into())]).unwrap_err();
        assert!(matches!(err, Error::InvalidSignature(..)));

        let mixed = Value::Array(
            Signature::new("u").unwrap(),
            vec![Value::U32(1), Value::Str("no".into())],
        );
        let mut msg = scratch();
        let err = mixed.write(&mut msg.appender()).unwrap_err();
        assert!(matches!(err, Error::InvalidSignature(..)));
    }

    #[test]
    fn empty_dynamic_array_is_rejected() {
        let empty: Vec<Value> = vec![];
        let mut msg = scratch();
        let err = empty.write(&mut msg.appender()).unwrap_err();
        assert!(matches!(err, Error::InvalidSignature(..)));
    }

    #[test]
    fn failed_container_leaves_message_unchanged() {
        let mut msg = scratch();
        1u32.write(&mut msg.appender()).unwrap();

        // element checks run before the container opens, the failure must
        // leave the message exactly as it was
        let broken = Value::Array(
            Signature::new("s").unwrap(),
            vec![Value::Str("one".into()), Value::U32(2)],
        );
        assert!(broken.write(&mut msg.appender()).is_err());

        // the reader only observes the argument written before the abort
        assert_eq!(msg.signature().as_str(), "u");
        let got: u32 = u32::read(&mut msg.reader()).unwrap();
        assert_eq!(got, 1);
    }

    #[test]
    fn failure_inside_an_open_container_propagates() {
        // the struct opens and takes its first field before the broken
        // array aborts it, the open container is abandoned rather than
        // closed and the error reaches the caller
        let broken = Value::Struct(vec![
            Value::Str("one".into()),
            Value::Array(Signature::new("s").unwrap(), vec![Value::U32(2)]),
        ]);
        let mut msg = scratch();
        let err = broken.write(&mut msg.appender()).unwrap_err();
        assert!(matches!(err, Error::InvalidSignature(..)));
    }

    #[test]
    fn type_mismatch_reports_both_sides() {
        let mut msg = scratch();
        "text".write(&mut msg.appender()).unwrap();
        let err = u32::read(&mut msg.reader()).unwrap_err();
        assert_eq!(
            err,
            Error::TypeMismatch { expected: ArgKind::U32, found: ArgKind::String }
        );
    }

    #[test]
    fn casting_between_argument_types() {
        let as_value: Value = cast(&7u32).unwrap();
        assert_eq!(as_value, Value::U32(7));

        let back: u32 = cast(&as_value).unwrap();
        assert_eq!(back, 7);

        let err: Result<String> = cast(&7u32);
        assert!(matches!(err, Err(Error::TypeMismatch { .. })));
    }

    #[test]
    fn variant_carries_inner_runtime_signature() {
        let var = Variant(Value::Struct(vec![Value::Bool(true), Value::Byte(3)]));
        let mut msg = scratch();
        var.write(&mut msg.appender()).unwrap();
        assert_eq!(msg.signature().as_str(), "v");
        let back: Variant<Value> = Variant::read(&mut msg.reader()).unwrap();
        assert_eq!(back.0, var.0);
    }
}
