//! The server facade: exporting typed methods, signals and properties.
//!
//! A [`Service`] hangs handlers off a connection's object-path registry.
//! Exported methods decode their arguments, run the user callback and send
//! the method return or an error reply. Properties register with a shared
//! per-path skeleton that serves the standard `Properties`, `Peer` and
//! `Introspectable` interfaces, installed lazily on the first export for a
//! path.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use crate::{
    arg::{cast, decode_body, AppendAll, Arg, ReadAll, Value, Variant},
    connection::{Connection, HandlerId, HandlerResult},
    error::{name, Error, Result},
    kind::Signature,
    message::{Message, MessageKind},
};

const PROPERTIES: &str = "org.freedesktop.DBus.Properties";
const PEER: &str = "org.freedesktop.DBus.Peer";
const INTROSPECTABLE: &str = "org.freedesktop.DBus.Introspectable";

struct PropertyEntry {
    /// Signature of the value, used for introspection.
    signature: Signature,
    get: Box<dyn Fn() -> Result<Value> + Send + Sync>,
    set: Option<Box<dyn Fn(Value) -> Result<()> + Send + Sync>>,
}

#[derive(Default)]
struct ObjectState {
    /// (interface, member) pairs for introspection.
    methods: Vec<(String, String)>,
    /// (interface, name) -> entry.
    properties: HashMap<(String, String), PropertyEntry>,
    skeleton: Option<HandlerId>,
}

#[derive(Default)]
struct ServiceState {
    objects: HashMap<String, ObjectState>,
}

/// Exports objects on one connection.
pub struct Service {
    conn: Arc<Connection>,
    state: Arc<Mutex<ServiceState>>,
}

impl Service {
    pub fn new(conn: &Arc<Connection>) -> Self {
        Self { conn: conn.clone(), state: Arc::new(Mutex::new(ServiceState::default())) }
    }

    /// Export a method. The handler decodes `A`, runs `f`, and replies with
    /// the encoded result or with the error reply built from `f`'s failure.
    /// Calls for other members or interfaces fall through to the next
    /// handler in the chain.
    pub fn serve_method<A, R>(
        &self,
        path: &str,
        iface: &str,
        member: &str,
        f: impl Fn(A) -> Result<R> + Send + Sync + 'static,
    ) -> HandlerId
    where
        A: ReadAll,
        R: AppendAll,
    {
        self.ensure_skeleton(path);
        {
            let mut state = self.state.lock().unwrap();
            state
                .objects
                .entry(path.to_string())
                .or_default()
                .methods
                .push((iface.to_string(), member.to_string()));
        }

        let (iface, member) = (iface.to_string(), member.to_string());
        self.conn.register_handler(path, move |conn, msg| {
            if msg.kind() != MessageKind::MethodCall
                || msg.interface().as_deref() != Some(iface.as_str())
                || msg.member().as_deref() != Some(member.as_str())
            {
                return HandlerResult::NotYet;
            }

            let reply = match decode_body::<A>(msg) {
                Ok(args) => match f(args) {
                    Ok(results) => build_return(msg, &results),
                    Err(err) => Message::error_reply(msg, err.error_name(), &err.to_string()),
                },
                Err(err) => Message::error_reply(msg, name::INVALID_ARGS, &err.to_string()),
            };
            finish_call(conn, msg, reply)
        })
    }

    /// Subscribe to a signal arriving at `path`. With `consumed` the
    /// handler swallows the message, otherwise other subscribers of the
    /// same signal still see it.
    pub fn on_signal<A: ReadAll>(
        &self,
        path: &str,
        iface: &str,
        member: &str,
        consumed: bool,
        f: impl Fn(A) + Send + Sync + 'static,
    ) -> HandlerId {
        let (iface, member) = (iface.to_string(), member.to_string());
        self.conn.register_handler(path, move |_, msg| {
            if msg.kind() != MessageKind::Signal
                || msg.interface().as_deref() != Some(iface.as_str())
                || msg.member().as_deref() != Some(member.as_str())
            {
                return HandlerResult::NotYet;
            }
            match decode_body::<A>(msg) {
                Ok(args) => f(args),
                Err(err) => tracing::warn!(%err, "dropping signal with unexpected payload"),
            }
            if consumed {
                HandlerResult::Handled
            } else {
                HandlerResult::NotYet
            }
        })
    }

    /// Export a read-only property.
    pub fn serve_property<T: Arg + 'static>(
        &self,
        path: &str,
        iface: &str,
        prop: &str,
        get: impl Fn() -> T + Send + Sync + 'static,
    ) {
        self.install_property(path, iface, prop, get, None::<fn(T) -> Result<()>>);
    }

    /// Export a writable property. `set` may reject a value, typically with
    /// [`Error::InvalidArgs`]. A successful write broadcasts
    /// `PropertiesChanged` with the new value.
    pub fn serve_property_writable<T: Arg + 'static>(
        &self,
        path: &str,
        iface: &str,
        prop: &str,
        get: impl Fn() -> T + Send + Sync + 'static,
        set: impl Fn(T) -> Result<()> + Send + Sync + 'static,
    ) {
        self.install_property(path, iface, prop, get, Some(set));
    }

    fn install_property<T: Arg + 'static>(
        &self,
        path: &str,
        iface: &str,
        prop: &str,
        get: impl Fn() -> T + Send + Sync + 'static,
        set: Option<impl Fn(T) -> Result<()> + Send + Sync + 'static>,
    ) {
        self.ensure_skeleton(path);

        let signature = T::signature();
        let entry = PropertyEntry {
            signature,
            get: Box::new(move || cast::<T, Value>(&get())),
            set: set.map(|set| {
                Box::new(move |value: Value| {
                    let typed: T = cast(&value)
                        .map_err(|_| Error::InvalidArgs("property value has the wrong type".into()))?;
                    set(typed)
                }) as Box<dyn Fn(Value) -> Result<()> + Send + Sync>
            }),
        };

        let mut state = self.state.lock().unwrap();
        state
            .objects
            .entry(path.to_string())
            .or_default()
            .properties
            .insert((iface.to_string(), prop.to_string()), entry);
    }

    /// Install the standard-interface skeleton for `path` once.
    fn ensure_skeleton(&self, path: &str) {
        let mut state = self.state.lock().unwrap();
        let object = state.objects.entry(path.to_string()).or_default();
        if object.skeleton.is_some() {
            return;
        }

        let shared = self.state.clone();
        let path_owned = path.to_string();
        let id = self.conn.register_handler(path, move |conn, msg| {
            skeleton_call(&shared, &path_owned, conn, msg)
        });
        state.objects.get_mut(path).expect("object entry was just created").skeleton = Some(id);
    }
}

fn build_return<R: AppendAll>(request: &Message, results: &R) -> Result<Message> {
    let mut reply = Message::method_return(request)?;
    results.append_all(&mut reply.appender())?;
    Ok(reply)
}

/// Send the reply unless the caller asked for silence. Allocation failures
/// bubble out as NeedMemory so the transport retries the message.
fn finish_call(conn: &Connection, request: &Message, reply: Result<Message>) -> HandlerResult {
    if request.no_reply() {
        return HandlerResult::Handled;
    }
    let outcome = reply.and_then(|reply| conn.send(reply));
    match outcome {
        Ok(..) => HandlerResult::Handled,
        Err(Error::OutOfMemory) => HandlerResult::NeedMemory,
        Err(err) => {
            tracing::warn!(%err, "failed to send a reply");
            HandlerResult::Handled
        }
    }
}

fn skeleton_call(
    state: &Arc<Mutex<ServiceState>>,
    path: &str,
    conn: &Connection,
    msg: &Message,
) -> HandlerResult {
    if msg.kind() != MessageKind::MethodCall {
        return HandlerResult::NotYet;
    }
    match (msg.interface().as_deref(), msg.member().as_deref()) {
        (Some(PROPERTIES), Some("Get")) => {
            let reply = property_get(state, path, msg);
            finish_call(conn, msg, reply)
        }
        (Some(PROPERTIES), Some("Set")) => {
            let reply = property_set(state, path, conn, msg);
            finish_call(conn, msg, reply)
        }
        (Some(PROPERTIES), Some("GetAll")) => {
            let reply = property_get_all(state, path, msg);
            finish_call(conn, msg, reply)
        }
        (Some(PEER), Some("Ping")) => finish_call(conn, msg, Message::method_return(msg)),
        (Some(PEER), Some("GetMachineId")) => {
            let reply = Message::method_return(msg)
                .and_then(|mut reply| {
                    machine_id().append_all(&mut reply.appender())?;
                    Ok(reply)
                });
            finish_call(conn, msg, reply)
        }
        (Some(INTROSPECTABLE), Some("Introspect")) => {
            let xml = introspect(state, path);
            let reply = Message::method_return(msg).and_then(|mut reply| {
                xml.append_all(&mut reply.appender())?;
                Ok(reply)
            });
            finish_call(conn, msg, reply)
        }
        _ => HandlerResult::NotYet,
    }
}

fn error_reply(msg: &Message, err: Error) -> Result<Message> {
    Message::error_reply(msg, err.error_name(), &err.to_string())
}

fn property_get(
    state: &Arc<Mutex<ServiceState>>,
    path: &str,
    msg: &Message,
) -> Result<Message> {
    let (iface, prop): (String, String) = match decode_body(msg) {
        Ok(args) => args,
        Err(err) => return error_reply(msg, Error::InvalidArgs(err.to_string())),
    };

    let value = {
        let state = state.lock().unwrap();
        let Some(object) = state.objects.get(path) else {
            return error_reply(msg, Error::UnknownObject);
        };
        match object.properties.get(&(iface.clone(), prop.clone())) {
            Some(entry) => (entry.get)(),
            None if object.properties.keys().any(|(i, ..)| *i == iface) => {
                return error_reply(msg, Error::UnknownProperty)
            }
            None => return error_reply(msg, Error::UnknownInterface),
        }
    };

    match value {
        Ok(value) => {
            let mut reply = Message::method_return(msg)?;
            Variant(value).append_all(&mut reply.appender())?;
            Ok(reply)
        }
        Err(err) => error_reply(msg, err),
    }
}

fn property_set(
    state: &Arc<Mutex<ServiceState>>,
    path: &str,
    conn: &Connection,
    msg: &Message,
) -> Result<Message> {
    let (iface, prop, value): (String, String, Variant<Value>) = match decode_body(msg) {
        Ok(args) => args,
        Err(err) => return error_reply(msg, Error::InvalidArgs(err.to_string())),
    };

    let outcome = {
        let state = state.lock().unwrap();
        let Some(object) = state.objects.get(path) else {
            return error_reply(msg, Error::UnknownObject);
        };
        match object.properties.get(&(iface.clone(), prop.clone())) {
            Some(entry) => match &entry.set {
                Some(set) => set(value.0).map(|()| (entry.get)()),
                None => Err(Error::PropertyReadOnly),
            },
            None if object.properties.keys().any(|(i, ..)| *i == iface) => {
                Err(Error::UnknownProperty)
            }
            None => Err(Error::UnknownInterface),
        }
    };

    match outcome {
        Ok(current) => {
            // announce the new value to observers
            if let Ok(current) = current {
                let mut changed: HashMap<String, Variant<Value>> = HashMap::new();
                changed.insert(prop, Variant(current));
                let announce = (iface, changed, Vec::<String>::new());
                if let Ok(mut signal) = Message::signal(path, PROPERTIES, "PropertiesChanged") {
                    if announce.append_all(&mut signal.appender()).is_ok() {
                        let _ = conn.send(signal);
                    }
                }
            }
            Message::method_return(msg)
        }
        Err(err) => error_reply(msg, err),
    }
}

fn property_get_all(
    state: &Arc<Mutex<ServiceState>>,
    path: &str,
    msg: &Message,
) -> Result<Message> {
    let (iface,): (String,) = match decode_body(msg) {
        Ok(args) => args,
        Err(err) => return error_reply(msg, Error::InvalidArgs(err.to_string())),
    };

    let mut values: HashMap<String, Variant<Value>> = HashMap::new();
    {
        let state = state.lock().unwrap();
        let Some(object) = state.objects.get(path) else {
            return error_reply(msg, Error::UnknownObject);
        };
        for ((prop_iface, prop), entry) in &object.properties {
            if *prop_iface != iface {
                continue;
            }
            match (entry.get)() {
                Ok(value) => {
                    values.insert(prop.clone(), Variant(value));
                }
                Err(err) => tracing::warn!(%err, property = %prop, "property getter failed"),
            }
        }
    }

    let mut reply = Message::method_return(msg)?;
    values.append_all(&mut reply.appender())?;
    Ok(reply)
}

fn machine_id() -> String {
    for source in ["/etc/machine-id", "/var/lib/dbus/machine-id"] {
        if let Ok(id) = std::fs::read_to_string(source) {
            let id = id.trim();
            if !id.is_empty() {
                return id.to_string();
            }
        }
    }
    "00000000000000000000000000000000".to_string()
}

fn introspect(state: &Arc<Mutex<ServiceState>>, path: &str) -> String {
    let mut xml = String::from(
        "<!DOCTYPE node PUBLIC \"-//freedesktop//DTD D-BUS Object Introspection 1.0//EN\"\n \
         \"http://www.freedesktop.org/standards/dbus/1.0/introspect.dtd\">\n<node>\n",
    );

    xml.push_str(concat!(
        " <interface name=\"org.freedesktop.DBus.Properties\">\n",
        "  <method name=\"Get\"/>\n  <method name=\"Set\"/>\n  <method name=\"GetAll\"/>\n",
        "  <signal name=\"PropertiesChanged\"/>\n </interface>\n",
        " <interface name=\"org.freedesktop.DBus.Peer\">\n",
        "  <method name=\"Ping\"/>\n  <method name=\"GetMachineId\"/>\n </interface>\n",
        " <interface name=\"org.freedesktop.DBus.Introspectable\">\n",
        "  <method name=\"Introspect\"/>\n </interface>\n",
    ));

    let state = state.lock().unwrap();
    if let Some(object) = state.objects.get(path) {
        // group members by interface
        let mut interfaces: HashMap<&str, (Vec<&str>, Vec<(&str, &PropertyEntry)>)> =
            HashMap::new();
        for (iface, member) in &object.methods {
            interfaces.entry(iface.as_str()).or_default().0.push(member.as_str());
        }
        for ((iface, prop), entry) in &object.properties {
            interfaces.entry(iface.as_str()).or_default().1.push((prop.as_str(), entry));
        }
        for (iface, (methods, properties)) in interfaces {
            xml.push_str(&format!(" <interface name=\"{iface}\">\n"));
            for method in methods {
                xml.push_str(&format!("  <method name=\"{method}\"/>\n"));
            }
            for (prop, entry) in properties {
                let access = if entry.set.is_some() { "readwrite" } else { "read" };
                xml.push_str(&format!(
                    "  <property name=\"{prop}\" type=\"{}\" access=\"{access}\"/>\n",
                    entry.signature,
                ));
            }
            xml.push_str(" </interface>\n");
        }
    }

    xml.push_str("</node>\n");
    xml
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::connection::CallTimeout;
    use crate::proxy::{PropertyChange, Proxy};
    use crate::tests::session_or_skip;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    /// Drive `conn` on a thread until the returned guard is dropped.
    struct Pump {
        stop: Arc<AtomicBool>,
        thread: Option<std::thread::JoinHandle<()>>,
    }

    impl Pump {
        fn start(conn: Arc<Connection>) -> Self {
            let stop = Arc::new(AtomicBool::new(false));
            let flag = stop.clone();
            let thread = std::thread::spawn(move || {
                while !flag.load(Ordering::Acquire)
                    && conn.read_write_dispatch(CallTimeout::Millis(50))
                {}
            });
            Self { stop, thread: Some(thread) }
        }
    }

    impl Drop for Pump {
        fn drop(&mut self) {
            self.stop.store(true, Ordering::Release);
            if let Some(thread) = self.thread.take() {
                let _ = thread.join();
            }
        }
    }

    #[test]
    fn echo_method_export() {
        let Some(server) = session_or_skip() else { return };
        let Some(client) = session_or_skip() else { return };

        let service = Service::new(&server);
        service.serve_method("/test/Echo", "test.Echo", "Echo", |(text,): (String,)| Ok(text));

        let unique = server.unique_name().unwrap();
        let _pump = Pump::start(server.clone());

        let proxy = Proxy::new(&client, &unique, "/test/Echo")
            .with_timeout(CallTimeout::Millis(5000));
        let reply: String = proxy.call("test.Echo", "Echo", ("hi",)).unwrap();
        assert_eq!(reply, "hi");
    }

    #[test]
    fn handler_error_reaches_the_caller() {
        let Some(server) = session_or_skip() else { return };
        let Some(client) = session_or_skip() else { return };

        let service = Service::new(&server);
        service.serve_method("/test/Err", "test.Errs", "Fail", |(): ()| -> Result<()> {
            Err(Error::remote("test.Err", "bad"))
        });

        let unique = server.unique_name().unwrap();
        let _pump = Pump::start(server.clone());

        let proxy =
            Proxy::new(&client, &unique, "/test/Err").with_timeout(CallTimeout::Millis(5000));
        let err = proxy.call::<()>("test.Errs", "Fail", ()).unwrap_err();
        assert_eq!(err, Error::Remote { name: "test.Err".into(), text: "bad".into() });
    }

    #[test]
    fn property_round_trip_with_observer() {
        let Some(server) = session_or_skip() else { return };
        let Some(client) = session_or_skip() else { return };
        let Some(observer) = session_or_skip() else { return };

        let cell = Arc::new(Mutex::new("initial".to_string()));
        let service = Service::new(&server);
        let read_cell = cell.clone();
        let write_cell = cell.clone();
        service.serve_property_writable(
            "/test/Props",
            "test.Props",
            "Foo",
            move || read_cell.lock().unwrap().clone(),
            move |value: String| {
                *write_cell.lock().unwrap() = value;
                Ok(())
            },
        );

        let unique = server.unique_name().unwrap();
        let _server_pump = Pump::start(server.clone());

        // subscribe before mutating
        let obs_proxy = Proxy::new(&observer, &unique, "/test/Props");
        let mut stream = obs_proxy.watch_property::<String>("test.Props", "Foo").unwrap();
        observer.flush();
        let _observer_pump = Pump::start(observer.clone());
        // give the bus a moment to apply the match rule
        std::thread::sleep(Duration::from_millis(100));

        let proxy = Proxy::new(&client, &unique, "/test/Props")
            .with_timeout(CallTimeout::Millis(5000));

        let current: String = proxy.get("test.Props", "Foo").unwrap();
        assert_eq!(current, "initial");

        proxy.set("test.Props", "Foo", "updated".to_string()).unwrap();
        let current: String = proxy.get("test.Props", "Foo").unwrap();
        assert_eq!(current, "updated");

        let change = futures_lite::future::block_on(stream.next()).unwrap().unwrap();
        assert_eq!(change, PropertyChange::Changed("updated".to_string()));

        let all = proxy.get_all("test.Props").unwrap();
        assert!(all.contains_key("Foo"));
    }

    #[test]
    fn signal_subscription_decodes_payload() {
        let Some(server) = session_or_skip() else { return };
        let Some(client) = session_or_skip() else { return };

        let heard = Arc::new(Mutex::new(None));
        let service = Service::new(&server);
        let sink = heard.clone();
        service.on_signal("/test/Sig", "test.Sig", "Ping", false, move |(text,): (String,)| {
            *sink.lock().unwrap() = Some(text);
        });

        let unique = server.unique_name().unwrap();
        let _pump = Pump::start(server.clone());

        let mut msg = Message::signal("/test/Sig", "test.Sig", "Ping").unwrap();
        msg.set_destination(&unique).unwrap();
        ("over here",).append_all(&mut msg.appender()).unwrap();
        client.send(msg).unwrap();
        client.flush();

        for _ in 0..100 {
            if heard.lock().unwrap().is_some() {
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(heard.lock().unwrap().as_deref(), Some("over here"));
    }

    #[test]
    fn read_only_property_rejects_set() {
        let Some(server) = session_or_skip() else { return };
        let Some(client) = session_or_skip() else { return };

        let service = Service::new(&server);
        service.serve_property("/test/Ro", "test.Ro", "Fixed", || 7u32);

        let unique = server.unique_name().unwrap();
        let _pump = Pump::start(server.clone());

        let proxy =
            Proxy::new(&client, &unique, "/test/Ro").with_timeout(CallTimeout::Millis(5000));
        let got: u32 = proxy.get("test.Ro", "Fixed").unwrap();
        assert_eq!(got, 7);

        let err = proxy.set("test.Ro", "Fixed", 8u32).unwrap_err();
        assert_eq!(err, Error::PropertyReadOnly);
    }

    #[test]
    fn peer_and_introspection() {
        let Some(server) = session_or_skip() else { return };
        let Some(client) = session_or_skip() else { return };

        let service = Service::new(&server);
        service.serve_method("/test/Intro", "test.Intro", "Nop", |(): ()| Ok(()));

        let unique = server.unique_name().unwrap();
        let _pump = Pump::start(server.clone());

        let proxy =
            Proxy::new(&client, &unique, "/test/Intro").with_timeout(CallTimeout::Millis(5000));
        proxy.call::<()>(PEER, "Ping", ()).unwrap();

        let xml: String = proxy.call(INTROSPECTABLE, "Introspect", ()).unwrap();
        assert!(xml.contains("<node>"));
        assert!(xml.contains("test.Intro"));
        assert!(xml.contains("Nop"));
    }
}
