//! Typed facade over the bus daemon's own service,
//! `org.freedesktop.DBus` at `/org/freedesktop/DBus`.

use std::{collections::HashMap, sync::Arc};

use num_enum::TryFromPrimitive;

use crate::{
    arg::{decode_body, Value, Variant},
    connection::{CallTimeout, Connection},
    error::{Error, Result},
    message::Message,
    proxy::Proxy,
    rule::MatchRule,
};

pub const BUS_NAME: &str = "org.freedesktop.DBus";
pub const BUS_PATH: &str = "/org/freedesktop/DBus";
pub const BUS_INTERFACE: &str = "org.freedesktop.DBus";

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct RequestNameFlags: u32 {
        const ALLOW_REPLACEMENT = 1;
        const REPLACE_EXISTING = 2;
        const DO_NOT_QUEUE = 4;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive)]
#[repr(u32)]
pub enum RequestNameReply {
    PrimaryOwner = 1,
    InQueue = 2,
    Exists = 3,
    AlreadyOwner = 4,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive)]
#[repr(u32)]
pub enum ReleaseNameReply {
    Released = 1,
    NonExistent = 2,
    NotOwner = 3,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive)]
#[repr(u32)]
pub enum StartServiceReply {
    Success = 1,
    AlreadyRunning = 2,
}

fn reply_code<T: TryFromPrimitive<Primitive = u32>>(raw: u32) -> Result<T> {
    T::try_from_primitive(raw)
        .map_err(|_| Error::InvalidArgs(format!("unexpected bus reply code {raw}")))
}

/// The daemon's method set with typed argument shapes.
pub struct DBus {
    proxy: Proxy,
}

impl DBus {
    pub fn new(conn: &Arc<Connection>) -> Self {
        Self { proxy: Proxy::new(conn, BUS_NAME, BUS_PATH) }
    }

    pub fn with_timeout(mut self, timeout: CallTimeout) -> Self {
        self.proxy = self.proxy.with_timeout(timeout);
        self
    }

    /// The registration handshake. Shared connections already did this, the
    /// daemon rejects a second hello on the same connection.
    pub fn hello(&self) -> Result<String> {
        self.proxy.call(BUS_INTERFACE, "Hello", ())
    }

    pub fn request_name(&self, name: &str, flags: RequestNameFlags) -> Result<RequestNameReply> {
        let raw: u32 = self.proxy.call(BUS_INTERFACE, "RequestName", (name, flags.bits()))?;
        reply_code(raw)
    }

    pub fn release_name(&self, name: &str) -> Result<ReleaseNameReply> {
        let raw: u32 = self.proxy.call(BUS_INTERFACE, "ReleaseName", (name,))?;
        reply_code(raw)
    }

    pub fn list_names(&self) -> Result<Vec<String>> {
        self.proxy.call(BUS_INTERFACE, "ListNames", ())
    }

    pub fn list_activatable_names(&self) -> Result<Vec<String>> {
        self.proxy.call(BUS_INTERFACE, "ListActivatableNames", ())
    }

    /// Subscribe this connection to messages matching `rule`. Rules shape
    /// what the bus delivers, local routing is unaffected.
    pub fn add_match(&self, rule: &MatchRule) -> Result<()> {
        self.proxy.call(BUS_INTERFACE, "AddMatch", (rule.compile(),))
    }

    pub fn remove_match(&self, rule: &MatchRule) -> Result<()> {
        self.proxy.call(BUS_INTERFACE, "RemoveMatch", (rule.compile(),))
    }

    pub fn name_has_owner(&self, name: &str) -> Result<bool> {
        self.proxy.call(BUS_INTERFACE, "NameHasOwner", (name,))
    }

    pub fn get_name_owner(&self, name: &str) -> Result<String> {
        self.proxy.call(BUS_INTERFACE, "GetNameOwner", (name,))
    }

    pub fn start_service_by_name(&self, name: &str) -> Result<StartServiceReply> {
        // the flags argument is reserved and must be zero
        let raw: u32 = self.proxy.call(BUS_INTERFACE, "StartServiceByName", (name, 0u32))?;
        reply_code(raw)
    }

    pub fn update_activation_environment(
        &self,
        environment: &HashMap<String, String>,
    ) -> Result<()> {
        self.proxy.call(BUS_INTERFACE, "UpdateActivationEnvironment", (environment.clone(),))
    }

    pub fn list_queued_owners(&self, name: &str) -> Result<Vec<String>> {
        self.proxy.call(BUS_INTERFACE, "ListQueuedOwners", (name,))
    }

    pub fn get_connection_unix_user(&self, name: &str) -> Result<u32> {
        self.proxy.call(BUS_INTERFACE, "GetConnectionUnixUser", (name,))
    }

    pub fn get_connection_unix_process_id(&self, name: &str) -> Result<u32> {
        self.proxy.call(BUS_INTERFACE, "GetConnectionUnixProcessID", (name,))
    }

    pub fn get_adt_audit_session_data(&self, name: &str) -> Result<Vec<u8>> {
        self.proxy.call(BUS_INTERFACE, "GetAdtAuditSessionData", (name,))
    }

    pub fn get_connection_selinux_security_context(&self, name: &str) -> Result<Vec<u8>> {
        self.proxy.call(BUS_INTERFACE, "GetConnectionSELinuxSecurityContext", (name,))
    }

    pub fn get_id(&self) -> Result<String> {
        self.proxy.call(BUS_INTERFACE, "GetId", ())
    }

    pub fn get_connection_credentials(
        &self,
        name: &str,
    ) -> Result<HashMap<String, Variant<Value>>> {
        self.proxy.call(BUS_INTERFACE, "GetConnectionCredentials", (name,))
    }
}

// #### daemon signals ####

/// `NameOwnerChanged(name, old_owner, new_owner)`; owners are empty strings
/// when absent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NameOwnerChanged {
    pub name: String,
    pub old_owner: String,
    pub new_owner: String,
}

impl NameOwnerChanged {
    pub const MEMBER: &'static str = "NameOwnerChanged";

    pub fn from_message(msg: &Message) -> Result<Self> {
        let (name, old_owner, new_owner) = decode_body(msg)?;
        Ok(Self { name, old_owner, new_owner })
    }
}

/// `NameLost(name)`, unicast to the previous owner.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NameLost {
    pub name: String,
}

impl NameLost {
    pub const MEMBER: &'static str = "NameLost";

    pub fn from_message(msg: &Message) -> Result<Self> {
        let (name,) = decode_body(msg)?;
        Ok(Self { name })
    }
}

/// `NameAcquired(name)`, unicast to the new owner.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NameAcquired {
    pub name: String,
}

impl NameAcquired {
    pub const MEMBER: &'static str = "NameAcquired";

    pub fn from_message(msg: &Message) -> Result<Self> {
        let (name,) = decode_body(msg)?;
        Ok(Self { name })
    }
}

/// `ActivatableServicesChanged()`, no arguments.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ActivatableServicesChanged;

impl ActivatableServicesChanged {
    pub const MEMBER: &'static str = "ActivatableServicesChanged";
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::tests::session_or_skip;

    #[test]
    fn list_names_includes_the_daemon_and_us() {
        let Some(conn) = session_or_skip() else { return };
        let bus = DBus::new(&conn);
        let names = bus.list_names().unwrap();
        assert!(names.iter().any(|n| n == BUS_NAME));
        let unique = conn.unique_name().unwrap();
        assert!(unique.starts_with(':'));
        assert!(names.iter().any(|n| *n == unique));
    }

    #[test]
    fn request_and_release_a_name() {
        let Some(conn) = session_or_skip() else { return };
        let bus = DBus::new(&conn);
        let name = format!("test.rdbus.pid{}", std::process::id());

        let got = bus.request_name(&name, RequestNameFlags::DO_NOT_QUEUE).unwrap();
        assert!(matches!(got, RequestNameReply::PrimaryOwner | RequestNameReply::AlreadyOwner));
        assert!(bus.name_has_owner(&name).unwrap());
        assert_eq!(bus.get_name_owner(&name).unwrap(), conn.unique_name().unwrap());

        assert_eq!(bus.release_name(&name).unwrap(), ReleaseNameReply::Released);
        assert!(!bus.name_has_owner(&name).unwrap());
    }

    #[test]
    fn match_rules_round_trip_through_the_daemon() {
        let Some(conn) = session_or_skip() else { return };
        let bus = DBus::new(&conn);
        let rule = MatchRule::signal().interface("test.rdbus.Match").member("Nothing");
        bus.add_match(&rule).unwrap();
        bus.remove_match(&rule).unwrap();

        // removing it twice is an error the daemon reports by name
        let err = bus.remove_match(&rule).unwrap_err();
        let Error::Remote { name, .. } = err else { panic!("expected a remote error") };
        assert_eq!(name, crate::error::name::MATCH_RULE_NOT_FOUND);
    }

    #[test]
    fn connection_credentials_of_ourselves() {
        let Some(conn) = session_or_skip() else { return };
        let bus = DBus::new(&conn);
        let unique = conn.unique_name().unwrap();

        let uid = bus.get_connection_unix_user(&unique).unwrap();
        assert_eq!(uid, nix::unistd::Uid::current().as_raw());

        let pid = bus.get_connection_unix_process_id(&unique).unwrap();
        assert_eq!(pid, std::process::id());

        let creds = bus.get_connection_credentials(&unique).unwrap();
        assert!(creds.contains_key("UnixUserID"));
    }
}
