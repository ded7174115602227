//! The client facade: typed method, signal and property views over a
//! remote object.

use std::{collections::HashMap, marker::PhantomData, sync::Arc};

use crate::{
    arg::{decode_body, AppendAll, Arg, ReadAll, Value, Variant},
    connection::{CallTimeout, Connection, HandlerId, HandlerResult},
    error::Result,
    message::{Message, MessageKind},
    rule::MatchRule,
};

const PROPERTIES: &str = "org.freedesktop.DBus.Properties";

/// A typed view of one remote object: `(connection, destination, path)`
/// plus the method timeout.
#[derive(Clone)]
pub struct Proxy {
    conn: Arc<Connection>,
    destination: String,
    path: String,
    timeout: CallTimeout,
}

impl Proxy {
    pub fn new(
        conn: &Arc<Connection>,
        destination: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            conn: conn.clone(),
            destination: destination.into(),
            path: path.into(),
            timeout: CallTimeout::UseDefault,
        }
    }

    pub fn with_timeout(mut self, timeout: CallTimeout) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn build_call(&self, iface: &str, member: &str, args: &impl AppendAll) -> Result<Message> {
        let mut msg = Message::method_call(&self.destination, &self.path, iface, member)?;
        args.append_all(&mut msg.appender())?;
        Ok(msg)
    }

    /// Call a method and block for its typed result. Multi-result methods
    /// decode into a tuple, single results decode directly, `()` for none.
    pub fn call<R: ReadAll>(&self, iface: &str, member: &str, args: impl AppendAll) -> Result<R> {
        let msg = self.build_call(iface, member, &args)?;
        let mut reply = self.conn.send_with_reply_blocking(msg, self.timeout)?;
        R::read_all(&mut reply.reader())
    }

    /// Cooperative form of [`Proxy::call`], suspended until the dispatch
    /// driver completes the pending reply.
    pub async fn call_async<R: ReadAll>(
        &self,
        iface: &str,
        member: &str,
        args: impl AppendAll,
    ) -> Result<R> {
        let msg = self.build_call(iface, member, &args)?;
        let pending = self.conn.send_with_reply(msg, self.timeout)?;
        let mut reply = pending.await?;
        R::read_all(&mut reply.reader())
    }

    /// Callback form of [`Proxy::call`]: `f` runs on the thread that drives
    /// the connection once the reply arrives.
    pub fn call_with<R: ReadAll>(
        &self,
        iface: &str,
        member: &str,
        args: impl AppendAll,
        f: impl FnOnce(Result<R>) + Send + 'static,
    ) -> Result<()> {
        let msg = self.build_call(iface, member, &args)?;
        let pending = self.conn.send_with_reply(msg, self.timeout)?;
        pending.on_complete(move |reply| {
            f(reply.and_then(|mut reply| R::read_all(&mut reply.reader())));
        });
        Ok(())
    }

    /// Emit a signal from this proxy's path, fire-and-forget.
    pub fn emit(&self, iface: &str, member: &str, args: impl AppendAll) -> Result<()> {
        let mut msg = Message::signal(&self.path, iface, member)?;
        args.append_all(&mut msg.appender())?;
        self.conn.send(msg)?;
        Ok(())
    }

    /// Subscribe to a signal: asks the bus to deliver it and installs a
    /// decoding handler at this proxy's path. The stream is clonable, every
    /// clone sees every signal.
    pub fn signal_stream<A>(&self, iface: &str, member: &str) -> Result<SignalStream<A>>
    where
        A: ReadAll + Clone + Send + 'static,
    {
        let rule = MatchRule::signal()
            .sender(&self.destination)
            .path(&self.path)
            .interface(iface)
            .member(member);
        send_bus_match(&self.conn, "AddMatch", &rule)?;

        let (mut tx, rx) = async_broadcast::broadcast(64);
        tx.set_overflow(true);

        let (iface_owned, member_owned) = (iface.to_string(), member.to_string());
        let sender = tx.clone();
        let handler = self.conn.register_handler(&self.path, move |_, msg| {
            if msg.kind() != MessageKind::Signal
                || msg.interface().as_deref() != Some(iface_owned.as_str())
                || msg.member().as_deref() != Some(member_owned.as_str())
            {
                return HandlerResult::NotYet;
            }
            match decode_body::<A>(msg) {
                Ok(args) => {
                    let _ = sender.try_broadcast(args);
                }
                Err(err) => {
                    tracing::warn!(%err, "dropping signal with unexpected payload")
                }
            }
            // other subscribers of the same signal co-exist
            HandlerResult::NotYet
        });

        Ok(SignalStream {
            receiver: rx,
            _guard: Arc::new(StreamGuard { conn: self.conn.clone(), handler, rule }),
        })
    }

    // #### properties ####

    /// Read a property through the standard `Properties` interface.
    pub fn get<T: Arg>(&self, iface: &str, name: &str) -> Result<T> {
        let variant: Variant<T> = self.call(PROPERTIES, "Get", (iface, name))?;
        Ok(variant.0)
    }

    /// Write a property through the standard `Properties` interface.
    pub fn set<T: Arg>(&self, iface: &str, name: &str, value: T) -> Result<()> {
        self.call(PROPERTIES, "Set", (iface, name, Variant(value)))
    }

    pub fn get_all(&self, iface: &str) -> Result<HashMap<String, Variant<Value>>> {
        self.call(PROPERTIES, "GetAll", (iface,))
    }

    /// Observe one property: decodes `PropertiesChanged`, filters for
    /// `iface`, and yields the new value (or the invalidation) of `name`.
    pub fn watch_property<T>(&self, iface: &str, name: &str) -> Result<PropertyStream<T>>
    where
        T: Arg + Send + 'static,
    {
        let stream = self.signal_stream::<PropertiesChanged>(PROPERTIES, "PropertiesChanged")?;
        Ok(PropertyStream {
            stream,
            iface: iface.to_string(),
            name: name.to_string(),
            _value: PhantomData,
        })
    }
}

/// Ask the bus daemon to add or drop a match rule. Fire-and-forget: the
/// daemon applies rules in order, a reply is not needed for correctness.
fn send_bus_match(conn: &Arc<Connection>, member: &str, rule: &MatchRule) -> Result<()> {
    let mut msg = Message::method_call(
        "org.freedesktop.DBus",
        "/org/freedesktop/DBus",
        "org.freedesktop.DBus",
        member,
    )?;
    rule.compile().append_all(&mut msg.appender())?;
    msg.set_no_reply(true);
    conn.send(msg)?;
    Ok(())
}

struct StreamGuard {
    conn: Arc<Connection>,
    handler: HandlerId,
    rule: MatchRule,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.conn.unregister_handler(self.handler);
        let _ = send_bus_match(&self.conn, "RemoveMatch", &self.rule);
    }
}

/// A clonable stream of decoded signal payloads.
pub struct SignalStream<A> {
    receiver: async_broadcast::Receiver<A>,
    _guard: Arc<StreamGuard>,
}

impl<A: Clone> Clone for SignalStream<A> {
    fn clone(&self) -> Self {
        Self { receiver: self.receiver.clone(), _guard: self._guard.clone() }
    }
}

impl<A: Clone + Send> SignalStream<A> {
    /// The next signal. None once the subscription is gone.
    pub async fn next(&mut self) -> Option<A> {
        self.receiver.recv_direct().await.ok()
    }

    /// Non-blocking variant of [`SignalStream::next`].
    pub fn try_next(&mut self) -> Option<A> {
        self.receiver.try_recv().ok()
    }
}

/// The payload of `org.freedesktop.DBus.Properties.PropertiesChanged`.
#[derive(Clone, Debug)]
pub struct PropertiesChanged {
    pub interface: String,
    pub changed: HashMap<String, Variant<Value>>,
    pub invalidated: Vec<String>,
}

impl ReadAll for PropertiesChanged {
    fn read_all(reader: &mut crate::message::Reader<'_>) -> Result<Self> {
        let (interface, changed, invalidated) = ReadAll::read_all(reader)?;
        Ok(Self { interface, changed, invalidated })
    }
}

/// One observed change of a property.
#[derive(Clone, Debug, PartialEq)]
pub enum PropertyChange<T> {
    /// The property changed and the new value decoded to `T`.
    Changed(T),
    /// The property was invalidated without a value; re-read it if needed.
    Invalidated,
}

pub struct PropertyStream<T> {
    stream: SignalStream<PropertiesChanged>,
    iface: String,
    name: String,
    _value: PhantomData<fn() -> T>,
}

impl<T: Arg + Send> PropertyStream<T> {
    /// The next change of the observed property. Decode failures surface as
    /// `TypeMismatch`, changes of other properties are skipped.
    pub async fn next(&mut self) -> Option<Result<PropertyChange<T>>> {
        loop {
            let signal = self.stream.next().await?;
            if signal.interface != self.iface {
                continue;
            }
            if let Some(variant) = signal.changed.get(&self.name) {
                return Some(
                    crate::arg::cast::<Value, T>(&variant.0).map(PropertyChange::Changed),
                );
            }
            if signal.invalidated.iter().any(|n| n == &self.name) {
                return Some(Ok(PropertyChange::Invalidated));
            }
        }
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::error::Error;
    use crate::tests::session_or_skip;

    #[test]
    fn typed_call_with_tuple_reply() {
        let Some(conn) = session_or_skip() else { return };
        let bus = Proxy::new(&conn, "org.freedesktop.DBus", "/org/freedesktop/DBus");

        let names: Vec<String> = bus.call("org.freedesktop.DBus", "ListNames", ()).unwrap();
        assert!(names.iter().any(|n| n == "org.freedesktop.DBus"));

        let has_owner: bool = bus
            .call("org.freedesktop.DBus", "NameHasOwner", ("org.freedesktop.DBus",))
            .unwrap();
        assert!(has_owner);
    }

    #[test]
    fn remote_error_carries_name_and_text() {
        let Some(conn) = session_or_skip() else { return };
        let bus = Proxy::new(&conn, "org.freedesktop.DBus", "/org/freedesktop/DBus")
            .with_timeout(CallTimeout::Millis(2000));
        let err = bus
            .call::<()>("org.freedesktop.DBus", "GetNameOwner", ("com.example.NobodyOwnsThis",))
            .unwrap_err();
        let Error::Remote { name, .. } = err else { panic!("expected a remote error") };
        assert_eq!(name, crate::error::name::NAME_HAS_NO_OWNER);
    }

    #[test]
    fn signal_stream_receives_emitted_signals() {
        use std::time::Duration;

        let Some(emitter) = session_or_skip() else { return };
        let Some(subscriber) = session_or_skip() else { return };

        let source = emitter.unique_name().unwrap();
        let watch = Proxy::new(&subscriber, source, "/test/Stream");
        let mut stream = watch.signal_stream::<(String, u32)>("test.Stream", "Pulse").unwrap();
        subscriber.flush();
        // give the bus a moment to apply the match rule
        std::thread::sleep(Duration::from_millis(100));

        // destination does not matter for emission, signals broadcast
        let emit = Proxy::new(&emitter, "", "/test/Stream");
        emit.emit("test.Stream", "Pulse", ("beat".to_string(), 3u32)).unwrap();
        emitter.flush();

        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let pump = std::thread::spawn({
            let subscriber = subscriber.clone();
            let stop = stop.clone();
            move || {
                while !stop.load(std::sync::atomic::Ordering::Acquire) {
                    subscriber.read_write_dispatch(CallTimeout::Millis(50));
                }
            }
        });
        let (text, count) = futures_lite::future::block_on(stream.next()).unwrap();
        assert_eq!((text.as_str(), count), ("beat", 3));
        stop.store(true, std::sync::atomic::Ordering::Release);
        let _ = pump.join();
    }

    #[test]
    fn callback_call_form() {
        use std::sync::mpsc;

        let Some(conn) = session_or_skip() else { return };
        let bus = Proxy::new(&conn, "org.freedesktop.DBus", "/org/freedesktop/DBus");

        let (tx, rx) = mpsc::channel();
        bus.call_with::<String>("org.freedesktop.DBus", "GetId", (), move |reply| {
            let _ = tx.send(reply);
        })
        .unwrap();
        conn.flush();

        // drive until the callback fired
        let id = loop {
            conn.read_write_dispatch(CallTimeout::Millis(100));
            match rx.try_recv() {
                Ok(reply) => break reply.unwrap(),
                Err(mpsc::TryRecvError::Empty) => continue,
                Err(err) => panic!("callback channel died: {err}"),
            }
        };
        assert!(!id.is_empty());
    }
}
