//! Error kinds surfaced by the library.
//!
//! The set is closed: transport failures, marshaling failures and the
//! standard property/introspection errors each get their own kind, every
//! other error reply from a peer is carried verbatim as [`Error::Remote`].

use crate::kind::ArgKind;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The transport reported an allocation failure. Retrying is allowed.
    #[error("transport reported allocation failure")]
    OutOfMemory,
    /// The connection is closed or was lost.
    #[error("connection closed or lost")]
    Disconnected,
    /// The method timeout elapsed without a reply.
    #[error("no reply within the method timeout")]
    NoReply,
    /// A reader met a wire type it did not expect.
    #[error("type mismatch: expected {expected:?}, found {found:?}")]
    TypeMismatch { expected: ArgKind, found: ArgKind },
    /// A composed signature is not well-formed.
    #[error("invalid signature: {0}")]
    InvalidSignature(String),
    #[error("property is read-only")]
    PropertyReadOnly,
    #[error("no such property")]
    UnknownProperty,
    #[error("no such method")]
    UnknownMethod,
    #[error("no such interface")]
    UnknownInterface,
    #[error("no such object")]
    UnknownObject,
    /// A handler rejected the argument shape of a call.
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),
    /// An error reply from a peer, name preserved verbatim.
    #[error("{name}: {text}")]
    Remote { name: String, text: String },
}

impl Error {
    /// Build an error from a peer. `name` must be a fully-qualified D-Bus
    /// error name, e.g. `com.example.Error.Tilted`.
    pub fn remote(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self::Remote { name: name.into(), text: text.into() }
    }

    /// The wire name used when this error is sent as an error reply.
    pub fn error_name(&self) -> &str {
        match self {
            Self::OutOfMemory => name::NO_MEMORY,
            Self::Disconnected => name::DISCONNECTED,
            Self::NoReply => name::NO_REPLY,
            Self::TypeMismatch { .. } => name::INVALID_SIGNATURE,
            Self::InvalidSignature(..) => name::INVALID_SIGNATURE,
            Self::PropertyReadOnly => name::PROPERTY_READ_ONLY,
            Self::UnknownProperty => name::UNKNOWN_PROPERTY,
            Self::UnknownMethod => name::UNKNOWN_METHOD,
            Self::UnknownInterface => name::UNKNOWN_INTERFACE,
            Self::UnknownObject => name::UNKNOWN_OBJECT,
            Self::InvalidArgs(..) => name::INVALID_ARGS,
            Self::Remote { name, .. } => name,
        }
    }

    /// Map a wire error name back to the local kind where one exists.
    /// Unknown names are preserved as [`Error::Remote`].
    pub(crate) fn from_reply(name: &str, text: String) -> Self {
        match name {
            name::NO_MEMORY => Self::OutOfMemory,
            name::DISCONNECTED => Self::Disconnected,
            name::NO_REPLY | name::TIMEOUT | name::TIMED_OUT => Self::NoReply,
            name::UNKNOWN_METHOD => Self::UnknownMethod,
            name::UNKNOWN_OBJECT => Self::UnknownObject,
            name::UNKNOWN_INTERFACE => Self::UnknownInterface,
            name::UNKNOWN_PROPERTY => Self::UnknownProperty,
            name::PROPERTY_READ_ONLY => Self::PropertyReadOnly,
            name::INVALID_ARGS => Self::InvalidArgs(text),
            name::INVALID_SIGNATURE => Self::InvalidSignature(text),
            other => Self::Remote { name: other.into(), text },
        }
    }
}

/// A caller-allocated transport error slot.
pub(crate) struct ErrorSlot {
    raw: crate::sys::RawError,
}

impl ErrorSlot {
    pub fn new() -> Self {
        let mut raw = crate::sys::RawError {
            name: std::ptr::null(),
            message: std::ptr::null(),
            dummy: 0,
            padding1: std::ptr::null(),
        };
        unsafe { crate::sys::dbus_error_init(&mut raw) };
        Self { raw }
    }

    pub fn as_mut_ptr(&mut self) -> *mut crate::sys::RawError {
        &mut self.raw
    }

    pub fn is_set(&self) -> bool {
        unsafe { crate::sys::dbus_error_is_set(&self.raw) != crate::sys::FALSE }
    }

    /// Convert the slot's content into the matching error kind. Falls back
    /// to `Disconnected` when the transport failed without filling the slot.
    pub fn take(&self) -> Error {
        if !self.is_set() {
            return Error::Disconnected;
        }
        let text = |raw: *const std::ffi::c_char| {
            if raw.is_null() {
                String::new()
            } else {
                unsafe { std::ffi::CStr::from_ptr(raw) }.to_string_lossy().into_owned()
            }
        };
        let name = text(self.raw.name);
        Error::from_reply(&name, text(self.raw.message))
    }
}

impl Drop for ErrorSlot {
    fn drop(&mut self) {
        unsafe { crate::sys::dbus_error_free(&mut self.raw) };
    }
}

/// The well-known error names of the reference transport.
pub mod name {
    pub const FAILED: &str = "org.freedesktop.DBus.Error.Failed";
    pub const NO_MEMORY: &str = "org.freedesktop.DBus.Error.NoMemory";
    pub const SERVICE_UNKNOWN: &str = "org.freedesktop.DBus.Error.ServiceUnknown";
    pub const NAME_HAS_NO_OWNER: &str = "org.freedesktop.DBus.Error.NameHasNoOwner";
    pub const NO_REPLY: &str = "org.freedesktop.DBus.Error.NoReply";
    pub const IO_ERROR: &str = "org.freedesktop.DBus.Error.IOError";
    pub const BAD_ADDRESS: &str = "org.freedesktop.DBus.Error.BadAddress";
    pub const NOT_SUPPORTED: &str = "org.freedesktop.DBus.Error.NotSupported";
    pub const LIMITS_EXCEEDED: &str = "org.freedesktop.DBus.Error.LimitsExceeded";
    pub const ACCESS_DENIED: &str = "org.freedesktop.DBus.Error.AccessDenied";
    pub const AUTH_FAILED: &str = "org.freedesktop.DBus.Error.AuthFailed";
    pub const NO_SERVER: &str = "org.freedesktop.DBus.Error.NoServer";
    pub const TIMEOUT: &str = "org.freedesktop.DBus.Error.Timeout";
    pub const NO_NETWORK: &str = "org.freedesktop.DBus.Error.NoNetwork";
    pub const ADDRESS_IN_USE: &str = "org.freedesktop.DBus.Error.AddressInUse";
    pub const DISCONNECTED: &str = "org.freedesktop.DBus.Error.Disconnected";
    pub const INVALID_ARGS: &str = "org.freedesktop.DBus.Error.InvalidArgs";
    pub const FILE_NOT_FOUND: &str = "org.freedesktop.DBus.Error.FileNotFound";
    pub const FILE_EXISTS: &str = "org.freedesktop.DBus.Error.FileExists";
    pub const UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";
    pub const UNKNOWN_OBJECT: &str = "org.freedesktop.DBus.Error.UnknownObject";
    pub const UNKNOWN_INTERFACE: &str = "org.freedesktop.DBus.Error.UnknownInterface";
    pub const UNKNOWN_PROPERTY: &str = "org.freedesktop.DBus.Error.UnknownProperty";
    pub const PROPERTY_READ_ONLY: &str = "org.freedesktop.DBus.Error.PropertyReadOnly";
    pub const TIMED_OUT: &str = "org.freedesktop.DBus.Error.TimedOut";
    pub const MATCH_RULE_NOT_FOUND: &str = "org.freedesktop.DBus.Error.MatchRuleNotFound";
    pub const MATCH_RULE_INVALID: &str = "org.freedesktop.DBus.Error.MatchRuleInvalid";
    pub const SPAWN_EXEC_FAILED: &str = "org.freedesktop.DBus.Error.Spawn.ExecFailed";
    pub const SPAWN_FORK_FAILED: &str = "org.freedesktop.DBus.Error.Spawn.ForkFailed";
    pub const SPAWN_CHILD_EXITED: &str = "org.freedesktop.DBus.Error.Spawn.ChildExited";
    pub const SPAWN_CHILD_SIGNALED: &str = "org.freedesktop.DBus.Error.Spawn.ChildSignaled";
    pub const SPAWN_FAILED: &str = "org.freedesktop.DBus.Error.Spawn.Failed";
    pub const SPAWN_SETUP_FAILED: &str = "org.freedesktop.DBus.Error.Spawn.FailedToSetup";
    pub const SPAWN_CONFIG_INVALID: &str = "org.freedesktop.DBus.Error.Spawn.ConfigInvalid";
    pub const SPAWN_SERVICE_INVALID: &str = "org.freedesktop.DBus.Error.Spawn.ServiceNotValid";
    pub const SPAWN_SERVICE_NOT_FOUND: &str = "org.freedesktop.DBus.Error.Spawn.ServiceNotFound";
    pub const SPAWN_PERMISSIONS_INVALID: &str =
        "org.freedesktop.DBus.Error.Spawn.PermissionsInvalid";
    pub const SPAWN_FILE_INVALID: &str = "org.freedesktop.DBus.Error.Spawn.FileInvalid";
    pub const SPAWN_NO_MEMORY: &str = "org.freedesktop.DBus.Error.Spawn.NoMemory";
    pub const UNIX_PROCESS_ID_UNKNOWN: &str = "org.freedesktop.DBus.Error.UnixProcessIdUnknown";
    pub const INVALID_SIGNATURE: &str = "org.freedesktop.DBus.Error.InvalidSignature";
    pub const INVALID_FILE_CONTENT: &str = "org.freedesktop.DBus.Error.InvalidFileContent";
    pub const SELINUX_SECURITY_CONTEXT_UNKNOWN: &str =
        "org.freedesktop.DBus.Error.SELinuxSecurityContextUnknown";
    pub const ADT_AUDIT_DATA_UNKNOWN: &str = "org.freedesktop.DBus.Error.AdtAuditDataUnknown";
    pub const OBJECT_PATH_IN_USE: &str = "org.freedesktop.DBus.Error.ObjectPathInUse";
    pub const INCONSISTENT_MESSAGE: &str = "org.freedesktop.DBus.Error.InconsistentMessage";
    pub const INTERACTIVE_AUTHORIZATION_REQUIRED: &str =
        "org.freedesktop.DBus.Error.InteractiveAuthorizationRequired";
    pub const NOT_CONTAINER: &str = "org.freedesktop.DBus.Error.NotContainer";
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn reply_mapping() {
        assert_eq!(Error::from_reply(name::NO_MEMORY, String::new()), Error::OutOfMemory);
        assert_eq!(Error::from_reply(name::NO_REPLY, String::new()), Error::NoReply);
        assert_eq!(Error::from_reply(name::TIMED_OUT, String::new()), Error::NoReply);
        assert_eq!(
            Error::from_reply("test.Err", "bad".into()),
            Error::Remote { name: "test.Err".into(), text: "bad".into() },
        );
    }

    #[test]
    fn names_round_trip_through_kind() {
        let err = Error::from_reply(name::UNKNOWN_PROPERTY, String::new());
        assert_eq!(err.error_name(), name::UNKNOWN_PROPERTY);
    }
}
