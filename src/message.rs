//! The message container and its body cursors.
//!
//! A [`Message`] owns one transport message. It is mutable until it is
//! handed to [`Connection::send`](crate::Connection::send), which takes it
//! by value, afterwards no mutation is representable. Exactly one body
//! cursor can exist at a time: [`Message::reader`] and [`Message::appender`]
//! both borrow the message mutably, so opening a second cursor is rejected
//! at compile time.

use std::{
    ffi::{self, CStr, CString},
    marker::PhantomData,
    os::fd::{FromRawFd, OwnedFd, RawFd},
    ptr,
};

use num_enum::TryFromPrimitive;

use crate::{
    error::{Error, Result},
    kind::{ArgKind, Signature},
    sys,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive)]
#[repr(i32)]
pub enum MessageKind {
    Invalid = sys::MESSAGE_TYPE_INVALID,
    MethodCall = sys::MESSAGE_TYPE_METHOD_CALL,
    MethodReturn = sys::MESSAGE_TYPE_METHOD_RETURN,
    Error = sys::MESSAGE_TYPE_ERROR,
    Signal = sys::MESSAGE_TYPE_SIGNAL,
}

pub struct Message {
    raw: *mut sys::RawMessage,
}

// The transport refcounts messages; an owned handle can move between
// threads but must not be poked from two at once.
unsafe impl Send for Message {}

impl Drop for Message {
    fn drop(&mut self) {
        unsafe { sys::dbus_message_unref(self.raw) };
    }
}

fn to_cstring(text: &str) -> CString {
    CString::new(text).expect("D-Bus name strings contain no nul byte")
}

fn opt_str(raw: *const ffi::c_char) -> Option<String> {
    if raw.is_null() {
        None
    } else {
        Some(unsafe { CStr::from_ptr(raw) }.to_string_lossy().into_owned())
    }
}

fn nonnull(raw: *mut sys::RawMessage) -> Result<Message> {
    if raw.is_null() {
        Err(Error::OutOfMemory)
    } else {
        Ok(Message { raw })
    }
}

impl Message {
    /// Take ownership of a transport message. `add_ref` is false when the
    /// transport already handed over its reference.
    pub(crate) unsafe fn from_raw(raw: *mut sys::RawMessage, add_ref: bool) -> Self {
        debug_assert!(!raw.is_null());
        if add_ref {
            sys::dbus_message_ref(raw);
        }
        Self { raw }
    }

    pub(crate) fn as_raw(&self) -> *mut sys::RawMessage {
        self.raw
    }

    pub fn new(kind: MessageKind) -> Result<Self> {
        nonnull(unsafe { sys::dbus_message_new(kind as ffi::c_int) })
    }

    pub fn method_call(destination: &str, path: &str, iface: &str, member: &str) -> Result<Self> {
        let (d, p, i, m) =
            (to_cstring(destination), to_cstring(path), to_cstring(iface), to_cstring(member));
        nonnull(unsafe {
            sys::dbus_message_new_method_call(d.as_ptr(), p.as_ptr(), i.as_ptr(), m.as_ptr())
        })
    }

    pub fn method_return(request: &Message) -> Result<Self> {
        nonnull(unsafe { sys::dbus_message_new_method_return(request.raw) })
    }

    pub fn error_reply(request: &Message, name: &str, text: &str) -> Result<Self> {
        let (n, t) = (to_cstring(name), to_cstring(text));
        nonnull(unsafe { sys::dbus_message_new_error(request.raw, n.as_ptr(), t.as_ptr()) })
    }

    pub fn signal(path: &str, iface: &str, member: &str) -> Result<Self> {
        let (p, i, m) = (to_cstring(path), to_cstring(iface), to_cstring(member));
        nonnull(unsafe { sys::dbus_message_new_signal(p.as_ptr(), i.as_ptr(), m.as_ptr()) })
    }

    pub fn copy(&self) -> Result<Self> {
        nonnull(unsafe { sys::dbus_message_copy(self.raw) })
    }

    pub fn kind(&self) -> MessageKind {
        MessageKind::try_from(unsafe { sys::dbus_message_get_type(self.raw) })
            .unwrap_or(MessageKind::Invalid)
    }

    pub fn serial(&self) -> u32 {
        unsafe { sys::dbus_message_get_serial(self.raw) }
    }

    pub fn reply_serial(&self) -> u32 {
        unsafe { sys::dbus_message_get_reply_serial(self.raw) }
    }

    pub fn set_reply_serial(&mut self, serial: u32) -> Result<()> {
        ok_or_oom(unsafe { sys::dbus_message_set_reply_serial(self.raw, serial) })
    }

    pub fn path(&self) -> Option<String> {
        opt_str(unsafe { sys::dbus_message_get_path(self.raw) })
    }

    pub fn interface(&self) -> Option<String> {
        opt_str(unsafe { sys::dbus_message_get_interface(self.raw) })
    }

    pub fn member(&self) -> Option<String> {
        opt_str(unsafe { sys::dbus_message_get_member(self.raw) })
    }

    pub fn destination(&self) -> Option<String> {
        opt_str(unsafe { sys::dbus_message_get_destination(self.raw) })
    }

    pub fn sender(&self) -> Option<String> {
        opt_str(unsafe { sys::dbus_message_get_sender(self.raw) })
    }

    pub fn error_name(&self) -> Option<String> {
        opt_str(unsafe { sys::dbus_message_get_error_name(self.raw) })
    }

    pub fn set_destination(&mut self, destination: &str) -> Result<()> {
        let d = to_cstring(destination);
        ok_or_oom(unsafe { sys::dbus_message_set_destination(self.raw, d.as_ptr()) })
    }

    pub fn set_path(&mut self, path: &str) -> Result<()> {
        let p = to_cstring(path);
        ok_or_oom(unsafe { sys::dbus_message_set_path(self.raw, p.as_ptr()) })
    }

    pub fn set_interface(&mut self, iface: &str) -> Result<()> {
        let i = to_cstring(iface);
        ok_or_oom(unsafe { sys::dbus_message_set_interface(self.raw, i.as_ptr()) })
    }

    pub fn set_member(&mut self, member: &str) -> Result<()> {
        let m = to_cstring(member);
        ok_or_oom(unsafe { sys::dbus_message_set_member(self.raw, m.as_ptr()) })
    }

    pub fn set_error_name(&mut self, name: &str) -> Result<()> {
        let n = to_cstring(name);
        ok_or_oom(unsafe { sys::dbus_message_set_error_name(self.raw, n.as_ptr()) })
    }

    pub fn no_reply(&self) -> bool {
        unsafe { sys::dbus_message_get_no_reply(self.raw) != sys::FALSE }
    }

    pub fn set_no_reply(&mut self, no_reply: bool) {
        unsafe { sys::dbus_message_set_no_reply(self.raw, no_reply as sys::RawBool) };
    }

    pub fn auto_start(&self) -> bool {
        unsafe { sys::dbus_message_get_auto_start(self.raw) != sys::FALSE }
    }

    pub fn set_auto_start(&mut self, auto_start: bool) {
        unsafe { sys::dbus_message_set_auto_start(self.raw, auto_start as sys::RawBool) };
    }

    /// The signature of the body, empty for an argument-less message.
    pub fn signature(&self) -> Signature {
        let raw = unsafe { sys::dbus_message_get_signature(self.raw) };
        match opt_str(raw) {
            Some(text) => Signature::new(text).expect("transport validates message signatures"),
            None => Signature::empty(),
        }
    }

    /// Extract `(name, text)` from an error-typed message. The text is the
    /// leading string of the body when there is one.
    pub fn error_info(&self) -> Option<(String, String)> {
        if self.kind() != MessageKind::Error {
            return None;
        }
        let name = self.error_name()?;
        let mut iter = sys::RawIter::zeroed();
        let text = if unsafe { sys::dbus_message_iter_init(self.raw, &mut iter) } != sys::FALSE
            && unsafe { sys::dbus_message_iter_get_arg_type(&mut iter) }
                == ArgKind::String.code() as ffi::c_int
        {
            let mut raw: *const ffi::c_char = ptr::null();
            unsafe {
                sys::dbus_message_iter_get_basic(
                    &mut iter,
                    &mut raw as *mut *const ffi::c_char as *mut ffi::c_void,
                )
            };
            opt_str(raw).unwrap_or_default()
        } else {
            String::new()
        };
        Some((name, text))
    }

    /// Surface an error-typed message as the matching error kind.
    pub fn to_error(&self) -> Option<Error> {
        self.error_info().map(|(name, text)| Error::from_reply(&name, text))
    }

    /// Open the read cursor over the body.
    pub fn reader(&mut self) -> Reader<'_> {
        let mut iter = sys::RawIter::zeroed();
        // returns false for an empty body, the iterator is still positioned
        // on the invalid kind then, which is exactly what readers expect
        unsafe { sys::dbus_message_iter_init(self.raw, &mut iter) };
        Reader { iter, _msg: PhantomData }
    }

    /// Open the append cursor at the end of the body.
    pub fn appender(&mut self) -> Appender<'_> {
        let mut iter = sys::RawIter::zeroed();
        unsafe { sys::dbus_message_iter_init_append(self.raw, &mut iter) };
        Appender { iter, _msg: PhantomData }
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("kind", &self.kind())
            .field("serial", &self.serial())
            .field("sender", &self.sender())
            .field("destination", &self.destination())
            .field("path", &self.path())
            .field("interface", &self.interface())
            .field("member", &self.member())
            .field("signature", &self.signature().as_str())
            .finish()
    }
}

fn ok_or_oom(raw: sys::RawBool) -> Result<()> {
    if raw == sys::FALSE {
        Err(Error::OutOfMemory)
    } else {
        Ok(())
    }
}

/// Read cursor over a message body (or one container level of it).
pub struct Reader<'m> {
    iter: sys::RawIter,
    _msg: PhantomData<&'m Message>,
}

impl<'m> Reader<'m> {
    /// Kind of the value under the cursor, `Invalid` at the end.
    pub fn arg_kind(&mut self) -> ArgKind {
        ArgKind::from_raw(unsafe { sys::dbus_message_iter_get_arg_type(&mut self.iter) })
    }

    /// Signature of the value under the cursor.
    pub fn arg_signature(&mut self) -> Signature {
        let raw = unsafe { sys::dbus_message_iter_get_signature(&mut self.iter) };
        if raw.is_null() {
            return Signature::empty();
        }
        let all = unsafe { CStr::from_ptr(raw) }.to_string_lossy().into_owned();
        unsafe { sys::dbus_free(raw as *mut ffi::c_void) };
        let remaining = Signature::new(all).expect("transport validates signatures");
        // the transport reports the signature of everything that is left,
        // the current value is its first complete type
        let first = remaining.complete_types().next().map(|s| s.to_owned());
        match first {
            Some(first) => Signature::new(first).expect("complete type of a valid signature"),
            None => Signature::empty(),
        }
    }

    /// Move past the current value. Returns false at the end.
    pub fn advance(&mut self) -> bool {
        unsafe { sys::dbus_message_iter_next(&mut self.iter) != sys::FALSE }
    }

    /// Fail with `TypeMismatch` unless the cursor is on `expected`.
    pub fn expect(&mut self, expected: ArgKind) -> Result<()> {
        let found = self.arg_kind();
        if found == expected {
            Ok(())
        } else {
            Err(Error::TypeMismatch { expected, found })
        }
    }

    /// Child cursor into the container under this one. The caller advances
    /// the parent once it is done with the child.
    pub fn recurse(&mut self) -> Reader<'_> {
        let mut sub = sys::RawIter::zeroed();
        unsafe { sys::dbus_message_iter_recurse(&mut self.iter, &mut sub) };
        Reader { iter: sub, _msg: PhantomData }
    }

    /// Read a fixed-size basic value and advance.
    pub fn take_fixed<T: Copy + Default>(&mut self, kind: ArgKind) -> Result<T> {
        self.expect(kind)?;
        let mut out = T::default();
        unsafe {
            sys::dbus_message_iter_get_basic(&mut self.iter, &mut out as *mut T as *mut ffi::c_void)
        };
        self.advance();
        Ok(out)
    }

    /// Read a string-like basic value and advance.
    pub fn take_str(&mut self, kind: ArgKind) -> Result<String> {
        self.expect(kind)?;
        let mut raw: *const ffi::c_char = ptr::null();
        unsafe {
            sys::dbus_message_iter_get_basic(
                &mut self.iter,
                &mut raw as *mut *const ffi::c_char as *mut ffi::c_void,
            )
        };
        let text = opt_str(raw).unwrap_or_default();
        self.advance();
        Ok(text)
    }

    /// Read a file descriptor and advance. The transport duplicates the
    /// descriptor, the returned handle is owned by the caller.
    pub fn take_fd(&mut self) -> Result<OwnedFd> {
        self.expect(ArgKind::UnixFd)?;
        let mut raw: RawFd = -1;
        unsafe {
            sys::dbus_message_iter_get_basic(
                &mut self.iter,
                &mut raw as *mut RawFd as *mut ffi::c_void,
            )
        };
        self.advance();
        Ok(unsafe { OwnedFd::from_raw_fd(raw) })
    }
}

/// Append cursor over a message body (or one open container of it).
pub struct Appender<'m> {
    iter: sys::RawIter,
    _msg: PhantomData<&'m mut Message>,
}

impl<'m> Appender<'m> {
    /// Append a fixed-size basic value.
    pub fn put_fixed<T: Copy>(&mut self, kind: ArgKind, value: T) -> Result<()> {
        ok_or_oom(unsafe {
            sys::dbus_message_iter_append_basic(
                &mut self.iter,
                kind.code() as ffi::c_int,
                &value as *const T as *const ffi::c_void,
            )
        })
    }

    /// Append a string-like basic value.
    pub fn put_str(&mut self, kind: ArgKind, value: &str) -> Result<()> {
        let text = CString::new(value)
            .map_err(|_| Error::InvalidArgs("string contains a nul byte".into()))?;
        let raw = text.as_ptr();
        ok_or_oom(unsafe {
            sys::dbus_message_iter_append_basic(
                &mut self.iter,
                kind.code() as ffi::c_int,
                &raw as *const *const ffi::c_char as *const ffi::c_void,
            )
        })
    }

    /// Append a file descriptor. The transport duplicates it, ownership
    /// stays with the caller.
    pub fn put_fd(&mut self, fd: RawFd) -> Result<()> {
        self.put_fixed(ArgKind::UnixFd, fd)
    }

    /// Open a container, fill it through `body`, then close it. When `body`
    /// fails the container is abandoned and the parent message is left as if
    /// it was never opened. Array and variant containers carry the signature
    /// of their content, struct and dict-entry pass None.
    pub fn put_container<R>(
        &mut self,
        kind: ArgKind,
        contents: Option<&Signature>,
        body: impl FnOnce(&mut Appender<'_>) -> Result<R>,
    ) -> Result<R> {
        debug_assert!(kind.is_container());
        let contents = contents.map(Signature::to_cstring);
        let contents_ptr = contents.as_ref().map_or(ptr::null(), |c| c.as_ptr());

        let mut sub = sys::RawIter::zeroed();
        ok_or_oom(unsafe {
            sys::dbus_message_iter_open_container(
                &mut self.iter,
                kind.code() as ffi::c_int,
                contents_ptr,
                &mut sub,
            )
        })?;

        let mut child = Appender { iter: sub, _msg: PhantomData };
        match body(&mut child) {
            Ok(out) => {
                ok_or_oom(unsafe {
                    sys::dbus_message_iter_close_container(&mut self.iter, &mut child.iter)
                })?;
                Ok(out)
            }
            Err(err) => {
                unsafe { sys::dbus_message_iter_abandon_container(&mut self.iter, &mut child.iter) };
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn builders_and_headers() {
        let mut msg = Message::method_call("org.freedesktop.DBus", "/", "org.freedesktop.DBus", "ListNames").unwrap();
        assert_eq!(msg.kind(), MessageKind::MethodCall);
        assert_eq!(msg.destination().as_deref(), Some("org.freedesktop.DBus"));
        assert_eq!(msg.path().as_deref(), Some("/"));
        assert_eq!(msg.member().as_deref(), Some("ListNames"));
        assert!(!msg.no_reply());
        msg.set_no_reply(true);
        assert!(msg.no_reply());
        assert!(msg.auto_start());
        assert!(msg.signature().is_empty());
    }

    #[test]
    fn generic_kind() {
        let msg = Message::new(MessageKind::Signal).unwrap();
        assert_eq!(msg.kind(), MessageKind::Signal);
        assert_eq!(msg.path(), None);
    }

    #[test]
    fn copy_keeps_body() {
        let mut msg = Message::signal("/test", "test.Iface", "Ping").unwrap();
        msg.appender().put_fixed(ArgKind::U32, 7u32).unwrap();
        let mut copy = msg.copy().unwrap();
        assert_eq!(copy.signature().as_str(), "u");
        let got: u32 = copy.reader().take_fixed(ArgKind::U32).unwrap();
        assert_eq!(got, 7);
    }

    #[test]
    fn empty_body_reader_is_at_end() {
        let mut msg = Message::signal("/test", "test.Iface", "Empty").unwrap();
        assert_eq!(msg.reader().arg_kind(), ArgKind::Invalid);
    }
}
