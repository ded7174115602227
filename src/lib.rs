//! Statically typed D-Bus bindings over the reference `dbus-1` transport.
//!
//! D-Bus is the desktop IPC bus: processes on one machine exchange typed
//! messages through a session- or system-wide broker. This crate wraps the
//! reference transport library (which owns socket I/O, authentication and
//! wire framing) with a typed Rust surface:
//!
//! * [`Connection`] opens a bus, sends messages and routes inbound traffic
//!   through filters and per-path handler chains.
//! * [`arg`] maps Rust values onto the wire type system through the
//!   [`arg::Arg`] trait, from plain scalars up to nested containers and the
//!   dynamic [`arg::Value`].
//! * [`Proxy`] is the client view of a remote object: typed method calls
//!   (blocking, callback or async), signal streams and properties.
//! * [`Service`] is the reverse: export methods and properties, with the
//!   standard `Properties`/`Peer`/`Introspectable` interfaces served for
//!   every exported path.
//! * [`LoopDriver`] and [`QueueDriver`] keep a connection moving from a
//!   cooperative event loop or a thread-pool work queue.
//!
//! ```no_run
//! use rdbus::{Connection, Proxy};
//!
//! let conn = Connection::session()?;
//! let bus = Proxy::new(&conn, "org.freedesktop.DBus", "/org/freedesktop/DBus");
//! let names: Vec<String> = bus.call("org.freedesktop.DBus", "ListNames", ())?;
//! # Ok::<(), rdbus::Error>(())
//! ```

pub mod arg;
pub mod bus;
mod connection;
mod driver;
mod error;
pub mod kind;
mod message;
mod proxy;
mod rule;
mod service;
mod sys;

pub use connection::{
    BusType, CallTimeout, Connection, DispatchStatus, Handler, HandlerId, HandlerResult,
    PendingReply,
};
pub use driver::{
    LoopDriver, QueueDriver, ThreadPool, Timeout, TimeoutDelegate, Watch, WatchDelegate,
    WatchFlags, WorkQueue,
};
pub use error::{Error, Result};
pub use kind::{ArgKind, Signature};
pub use message::{Appender, Message, MessageKind, Reader};
pub use proxy::{
    PropertiesChanged, PropertyChange, PropertyStream, Proxy, SignalStream,
};
pub use rule::MatchRule;
pub use service::Service;

#[cfg(test)]
pub(crate) mod tests {

    use std::sync::Arc;

    use crate::connection::{BusType, Connection};

    /// Bus-backed tests only run where a session bus is reachable; they
    /// use private connections so client and server sides stay distinct.
    pub fn session_or_skip() -> Option<Arc<Connection>> {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        if std::env::var_os("DBUS_SESSION_BUS_ADDRESS").is_none() {
            eprintln!("skipping: no session bus in this environment");
            return None;
        }
        Some(Connection::open_private(BusType::Session).expect("connect to the session bus"))
    }
}
