//! Dispatch drivers: bridging the transport's watch and timeout callbacks
//! to a host event loop.
//!
//! The transport reports its socket readiness interests through
//! [`WatchDelegate`] and its timers through [`TimeoutDelegate`]. Two
//! drivers are provided: [`LoopDriver`] runs as a single cooperative task
//! on the async-io reactor, [`QueueDriver`] runs a poller thread and posts
//! the actual work to a user-chosen [`WorkQueue`]. Both obey the same
//! rules: one-shot readiness is re-armed after every firing, and a dispatch
//! drain is never entered from a transport callback, only from loop turns.
//!
//! The transport may hand out several watches for the same descriptor (a
//! read and a write interest), so both drivers register descriptors once
//! and fan observed readiness out to every matching watch.

use std::{
    ffi,
    os::fd::{AsFd, BorrowedFd, RawFd},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    task::Poll,
    time::{Duration, Instant},
};

use futures_lite::FutureExt;

use crate::{
    connection::{Connection, DispatchStatus},
    sys,
};

bitflags::bitflags! {
    /// Readiness interests of a transport watch.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct WatchFlags: u32 {
        const READABLE = sys::WATCH_READABLE;
        const WRITABLE = sys::WATCH_WRITABLE;
        const ERROR = sys::WATCH_ERROR;
        const HANGUP = sys::WATCH_HANGUP;
    }
}

/// A transport-owned file-descriptor subscription. Valid from the
/// delegate's `add` until its `remove` for the same identity.
pub struct Watch {
    raw: *mut sys::RawWatch,
}

// Watches are advanced under the transport's connection lock.
unsafe impl Send for Watch {}
unsafe impl Sync for Watch {}

impl Watch {
    pub(crate) fn new(raw: *mut sys::RawWatch) -> Self {
        Self { raw }
    }

    /// Stable identity across add/toggle/remove callbacks.
    pub fn id(&self) -> usize {
        self.raw as usize
    }

    pub fn fd(&self) -> RawFd {
        unsafe { sys::dbus_watch_get_unix_fd(self.raw) }
    }

    pub fn flags(&self) -> WatchFlags {
        WatchFlags::from_bits_truncate(unsafe { sys::dbus_watch_get_flags(self.raw) })
    }

    pub fn enabled(&self) -> bool {
        unsafe { sys::dbus_watch_get_enabled(self.raw) != sys::FALSE }
    }

    /// Let the transport act on an observed readiness. False means the
    /// transport ran out of memory and the event should be retried.
    pub fn handle(&self, flags: WatchFlags) -> bool {
        unsafe { sys::dbus_watch_handle(self.raw, flags.bits()) != sys::FALSE }
    }

    fn alias(&self) -> Watch {
        Watch { raw: self.raw }
    }
}

/// A transport-owned timer. The driver fires [`Timeout::handle`] every
/// `interval` while the timeout is enabled.
pub struct Timeout {
    raw: *mut sys::RawTimeout,
}

unsafe impl Send for Timeout {}
unsafe impl Sync for Timeout {}

impl Timeout {
    pub(crate) fn new(raw: *mut sys::RawTimeout) -> Self {
        Self { raw }
    }

    pub fn id(&self) -> usize {
        self.raw as usize
    }

    pub fn interval(&self) -> Duration {
        let ms = unsafe { sys::dbus_timeout_get_interval(self.raw) };
        Duration::from_millis(ms.max(0) as u64)
    }

    pub fn enabled(&self) -> bool {
        unsafe { sys::dbus_timeout_get_enabled(self.raw) != sys::FALSE }
    }

    pub fn handle(&self) -> bool {
        unsafe { sys::dbus_timeout_handle(self.raw) != sys::FALSE }
    }

    fn alias(&self) -> Timeout {
        Timeout { raw: self.raw }
    }
}

/// Receives the transport's watch lifecycle.
pub trait WatchDelegate: Send + Sync {
    /// A new watch appeared. False reports out-of-memory to the transport.
    fn add(&self, watch: Watch) -> bool;
    /// The watch identified by `id` is gone, drop its registration.
    fn remove(&self, id: usize);
    /// The enabled flag of the watch identified by `id` flipped.
    fn on_toggled(&self, id: usize, enabled: bool);
}

/// Receives the transport's timer lifecycle.
pub trait TimeoutDelegate: Send + Sync {
    fn add(&self, timeout: Timeout) -> bool;
    fn remove(&self, id: usize);
    fn on_toggled(&self, id: usize, enabled: bool);
}

unsafe extern "C" fn add_watch_trampoline(
    watch: *mut sys::RawWatch,
    data: *mut ffi::c_void,
) -> sys::RawBool {
    let delegate = &*(data as *const Arc<dyn WatchDelegate>);
    delegate.add(Watch::new(watch)) as sys::RawBool
}

unsafe extern "C" fn remove_watch_trampoline(watch: *mut sys::RawWatch, data: *mut ffi::c_void) {
    let delegate = &*(data as *const Arc<dyn WatchDelegate>);
    delegate.remove(watch as usize);
}

unsafe extern "C" fn toggle_watch_trampoline(watch: *mut sys::RawWatch, data: *mut ffi::c_void) {
    let delegate = &*(data as *const Arc<dyn WatchDelegate>);
    let enabled = sys::dbus_watch_get_enabled(watch) != sys::FALSE;
    delegate.on_toggled(watch as usize, enabled);
}

unsafe extern "C" fn free_watch_delegate(data: *mut ffi::c_void) {
    drop(Box::from_raw(data as *mut Arc<dyn WatchDelegate>));
}

unsafe extern "C" fn add_timeout_trampoline(
    timeout: *mut sys::RawTimeout,
    data: *mut ffi::c_void,
) -> sys::RawBool {
    let delegate = &*(data as *const Arc<dyn TimeoutDelegate>);
    delegate.add(Timeout::new(timeout)) as sys::RawBool
}

unsafe extern "C" fn remove_timeout_trampoline(
    timeout: *mut sys::RawTimeout,
    data: *mut ffi::c_void,
) {
    let delegate = &*(data as *const Arc<dyn TimeoutDelegate>);
    delegate.remove(timeout as usize);
}

unsafe extern "C" fn toggle_timeout_trampoline(
    timeout: *mut sys::RawTimeout,
    data: *mut ffi::c_void,
) {
    let delegate = &*(data as *const Arc<dyn TimeoutDelegate>);
    let enabled = sys::dbus_timeout_get_enabled(timeout) != sys::FALSE;
    delegate.on_toggled(timeout as usize, enabled);
}

unsafe extern "C" fn free_timeout_delegate(data: *mut ffi::c_void) {
    drop(Box::from_raw(data as *mut Arc<dyn TimeoutDelegate>));
}

impl Connection {
    /// Hand the transport's watch lifecycle to `delegate`. The transport
    /// reports already-existing watches during this call.
    pub fn set_watch_delegate(&self, delegate: Arc<dyn WatchDelegate>) {
        let data = Box::into_raw(Box::new(delegate)) as *mut ffi::c_void;
        let ok = unsafe {
            sys::dbus_connection_set_watch_functions(
                self.as_raw(),
                add_watch_trampoline,
                remove_watch_trampoline,
                toggle_watch_trampoline,
                data,
                Some(free_watch_delegate),
            )
        };
        assert!(ok != sys::FALSE, "out of memory installing the watch delegate");
    }

    /// Hand the transport's timer lifecycle to `delegate`.
    pub fn set_timeout_delegate(&self, delegate: Arc<dyn TimeoutDelegate>) {
        let data = Box::into_raw(Box::new(delegate)) as *mut ffi::c_void;
        let ok = unsafe {
            sys::dbus_connection_set_timeout_functions(
                self.as_raw(),
                add_timeout_trampoline,
                remove_timeout_trampoline,
                toggle_timeout_trampoline,
                data,
                Some(free_timeout_delegate),
            )
        };
        assert!(ok != sys::FALSE, "out of memory installing the timeout delegate");
    }
}

// #### shared driver state ####

enum Command {
    AddWatch(Watch),
    RemoveWatch(usize),
    ToggleWatch(usize, bool),
    AddTimeout(Timeout),
    RemoveTimeout(usize),
    ToggleTimeout(usize, bool),
    /// Inbound data is waiting, drain dispatch on the next loop turn.
    Drain,
    /// Outbound data appeared from another thread.
    WakeUp,
}

struct WatchState {
    watch: Watch,
    enabled: bool,
}

/// The watches sharing one descriptor and the union of their interests.
struct WatchGroup<Io> {
    io: Io,
    watches: Vec<WatchState>,
}

impl<Io> WatchGroup<Io> {
    fn wanted(&self) -> WatchFlags {
        self.watches
            .iter()
            .filter(|state| state.enabled)
            .fold(WatchFlags::empty(), |acc, state| acc | state.watch.flags())
    }

    /// Forward observed readiness to every enabled watch that asked for any
    /// part of it. Error and hang-up always qualify.
    fn dispatch_observed(&self, observed: WatchFlags) -> bool {
        let mut out_of_memory = false;
        for state in self.watches.iter().filter(|state| state.enabled) {
            let relevant =
                observed & (state.watch.flags() | WatchFlags::ERROR | WatchFlags::HANGUP);
            if !relevant.is_empty() {
                out_of_memory |= !state.watch.handle(relevant);
            }
        }
        out_of_memory
    }

    fn remove(&mut self, id: usize) -> bool {
        self.watches.retain(|state| state.watch.id() != id);
        self.watches.is_empty()
    }

    fn toggle(&mut self, id: usize, enabled: bool) {
        if let Some(state) = self.watches.iter_mut().find(|state| state.watch.id() == id) {
            state.enabled = enabled;
        }
    }
}

struct TimerEntry {
    timeout: Timeout,
    deadline: Instant,
    enabled: bool,
}

struct Timers {
    entries: Vec<TimerEntry>,
}

impl Timers {
    fn new() -> Self {
        Self { entries: Vec::new() }
    }

    fn add(&mut self, timeout: Timeout) {
        let enabled = timeout.enabled();
        let deadline = Instant::now() + timeout.interval();
        self.entries.push(TimerEntry { timeout, deadline, enabled });
    }

    fn remove(&mut self, id: usize) {
        self.entries.retain(|entry| entry.timeout.id() != id);
    }

    fn toggle(&mut self, id: usize, enabled: bool) {
        if let Some(entry) = self.entries.iter_mut().find(|entry| entry.timeout.id() == id) {
            entry.enabled = enabled;
            entry.deadline = Instant::now() + entry.timeout.interval();
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.entries.iter().filter(|entry| entry.enabled).map(|entry| entry.deadline).min()
    }

    /// Fire and re-arm every elapsed timer through `fire`.
    fn run_elapsed(&mut self, fire: impl Fn(&Timeout)) {
        let now = Instant::now();
        for entry in self.entries.iter_mut().filter(|entry| entry.enabled && entry.deadline <= now)
        {
            fire(&entry.timeout);
            entry.deadline = now + entry.timeout.interval();
        }
    }
}

// #### the cooperative run-loop driver ####

struct ChannelDelegate {
    commands: async_channel::Sender<Command>,
}

impl WatchDelegate for ChannelDelegate {
    fn add(&self, watch: Watch) -> bool {
        self.commands.try_send(Command::AddWatch(watch)).is_ok()
    }
    fn remove(&self, id: usize) {
        let _ = self.commands.try_send(Command::RemoveWatch(id));
    }
    fn on_toggled(&self, id: usize, enabled: bool) {
        let _ = self.commands.try_send(Command::ToggleWatch(id, enabled));
    }
}

impl TimeoutDelegate for ChannelDelegate {
    fn add(&self, timeout: Timeout) -> bool {
        self.commands.try_send(Command::AddTimeout(timeout)).is_ok()
    }
    fn remove(&self, id: usize) {
        let _ = self.commands.try_send(Command::RemoveTimeout(id));
    }
    fn on_toggled(&self, id: usize, enabled: bool) {
        let _ = self.commands.try_send(Command::ToggleTimeout(id, enabled));
    }
}

/// Wraps the transport's descriptor for reactor registration without
/// claiming ownership.
struct WatchFd {
    fd: RawFd,
}

impl AsFd for WatchFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        unsafe { BorrowedFd::borrow_raw(self.fd) }
    }
}

/// The cooperative driver: one task owns every watch and timer of a
/// connection and keeps dispatch drained. Run it on any executor, e.g.
/// `async_executor::Executor::spawn(driver.run())`.
pub struct LoopDriver {
    conn: Arc<Connection>,
    commands: async_channel::Receiver<Command>,
}

impl LoopDriver {
    pub fn new(conn: &Arc<Connection>) -> Self {
        let (tx, rx) = async_channel::unbounded();

        let delegate = Arc::new(ChannelDelegate { commands: tx.clone() });
        conn.set_watch_delegate(delegate.clone() as Arc<dyn WatchDelegate>);
        conn.set_timeout_delegate(delegate as Arc<dyn TimeoutDelegate>);

        let status_tx = tx.clone();
        conn.set_dispatch_status_observer(move |status| {
            if status == DispatchStatus::DataRemains {
                let _ = status_tx.try_send(Command::Drain);
            }
        });
        let wake_tx = tx.clone();
        conn.set_wake_up(move || {
            let _ = wake_tx.try_send(Command::WakeUp);
        });

        // there may be data queued from before the driver existed
        let _ = tx.try_send(Command::Drain);

        Self { conn: conn.clone(), commands: rx }
    }

    /// Drive the connection until it goes away.
    pub async fn run(self) {
        enum Turn {
            Command(Command),
            Closed,
            Ready(usize, WatchFlags),
            TimerFired,
        }

        let mut groups: Vec<WatchGroup<async_io::Async<WatchFd>>> = Vec::new();
        let mut timers = Timers::new();

        loop {
            let turn = {
                let command = async {
                    match self.commands.recv().await {
                        Ok(cmd) => Turn::Command(cmd),
                        Err(_) => Turn::Closed,
                    }
                };

                let readiness = futures_lite::future::poll_fn(|ctx| {
                    for (idx, group) in groups.iter().enumerate() {
                        let wanted = group.wanted();
                        let mut observed = WatchFlags::empty();
                        if wanted.contains(WatchFlags::READABLE)
                            && group.io.poll_readable(ctx).is_ready()
                        {
                            observed |= WatchFlags::READABLE;
                        }
                        if wanted.contains(WatchFlags::WRITABLE)
                            && group.io.poll_writable(ctx).is_ready()
                        {
                            observed |= WatchFlags::WRITABLE;
                        }
                        if !observed.is_empty() {
                            return Poll::Ready(Turn::Ready(idx, observed));
                        }
                    }
                    Poll::Pending
                });

                let next_deadline = timers.next_deadline();
                let timer = async {
                    match next_deadline {
                        Some(deadline) => {
                            async_io::Timer::at(deadline).await;
                            Turn::TimerFired
                        }
                        None => futures_lite::future::pending().await,
                    }
                };

                command.or(readiness).or(timer).await
            };

            match turn {
                Turn::Closed => break,

                Turn::Command(Command::AddWatch(watch)) => {
                    let fd = watch.fd();
                    let state = WatchState { enabled: watch.enabled(), watch };
                    match groups.iter_mut().find(|group| group.io.get_ref().fd == fd) {
                        Some(group) => group.watches.push(state),
                        None => match async_io::Async::new(WatchFd { fd }) {
                            Ok(io) => groups.push(WatchGroup { io, watches: vec![state] }),
                            Err(err) => tracing::warn!(
                                %err, fd, "cannot register transport fd with the reactor",
                            ),
                        },
                    }
                }
                Turn::Command(Command::RemoveWatch(id)) => {
                    groups.retain_mut(|group| !group.remove(id));
                }
                Turn::Command(Command::ToggleWatch(id, enabled)) => {
                    for group in groups.iter_mut() {
                        group.toggle(id, enabled);
                    }
                }

                Turn::Command(Command::AddTimeout(timeout)) => timers.add(timeout),
                Turn::Command(Command::RemoveTimeout(id)) => timers.remove(id),
                Turn::Command(Command::ToggleTimeout(id, enabled)) => timers.toggle(id, enabled),

                Turn::Command(Command::Drain) => self.drain(),
                Turn::Command(Command::WakeUp) => {
                    // nothing to do beyond waking up: the write watch
                    // turning writable moves the data out
                }

                Turn::Ready(idx, observed) => {
                    if groups[idx].dispatch_observed(observed) {
                        tracing::warn!("transport out of memory handling a watch event");
                    }
                    self.drain();
                }

                Turn::TimerFired => {
                    timers.run_elapsed(|timeout| {
                        timeout.handle();
                    });
                    self.drain();
                }
            }
        }
    }

    fn drain(&self) {
        while self.conn.dispatch() == DispatchStatus::DataRemains {}
    }
}

// #### the dispatch-queue driver ####

/// Anything that can run jobs for the [`QueueDriver`]: a thread pool, a
/// serial queue, an executor shim.
pub trait WorkQueue: Send + Sync + 'static {
    fn post(&self, job: Box<dyn FnOnce() + Send>);
}

/// Minimal built-in work queue: a fixed set of worker threads over one
/// channel.
pub struct ThreadPool {
    jobs: async_channel::Sender<Box<dyn FnOnce() + Send>>,
    workers: Vec<std::thread::JoinHandle<()>>,
}

impl ThreadPool {
    pub fn new(workers: usize) -> Self {
        let (tx, rx) = async_channel::unbounded::<Box<dyn FnOnce() + Send>>();
        let workers = (0..workers.max(1))
            .map(|idx| {
                let rx = rx.clone();
                std::thread::Builder::new()
                    .name(format!("rdbus-pool-{idx}"))
                    .spawn(move || {
                        while let Ok(job) = rx.recv_blocking() {
                            job();
                        }
                    })
                    .expect("spawning a pool worker")
            })
            .collect();
        Self { jobs: tx, workers }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.jobs.close();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl WorkQueue for ThreadPool {
    fn post(&self, job: Box<dyn FnOnce() + Send>) {
        let _ = self.jobs.send_blocking(job);
    }
}

struct PollerShared {
    commands: Mutex<Vec<Command>>,
    poller: polling::Poller,
    stop: AtomicBool,
}

impl PollerShared {
    fn push(&self, command: Command) {
        self.commands.lock().unwrap().push(command);
        self.wake();
    }

    fn wake(&self) {
        let _ = self.poller.notify();
    }
}

impl WatchDelegate for PollerShared {
    fn add(&self, watch: Watch) -> bool {
        self.push(Command::AddWatch(watch));
        true
    }
    fn remove(&self, id: usize) {
        self.push(Command::RemoveWatch(id));
    }
    fn on_toggled(&self, id: usize, enabled: bool) {
        self.push(Command::ToggleWatch(id, enabled));
    }
}

impl TimeoutDelegate for PollerShared {
    fn add(&self, timeout: Timeout) -> bool {
        self.push(Command::AddTimeout(timeout));
        true
    }
    fn remove(&self, id: usize) {
        self.push(Command::RemoveTimeout(id));
    }
    fn on_toggled(&self, id: usize, enabled: bool) {
        self.push(Command::ToggleTimeout(id, enabled));
    }
}

struct PolledFd {
    fd: RawFd,
    /// Set while a readiness job sits on the queue; the fd stays disarmed
    /// until the job finished so one event is handled exactly once.
    in_flight: Arc<AtomicBool>,
}

/// The thread-pool driver: a dedicated poller thread watches the
/// transport's descriptors and timers, the actual transport advancement and
/// dispatch drains run as jobs on the caller's queue.
pub struct QueueDriver {
    shared: Arc<PollerShared>,
    poller: Option<std::thread::JoinHandle<()>>,
}

impl QueueDriver {
    pub fn new(conn: &Arc<Connection>, queue: Arc<dyn WorkQueue>) -> std::io::Result<Self> {
        let shared = Arc::new(PollerShared {
            commands: Mutex::new(Vec::new()),
            poller: polling::Poller::new()?,
            stop: AtomicBool::new(false),
        });

        conn.set_watch_delegate(shared.clone() as Arc<dyn WatchDelegate>);
        conn.set_timeout_delegate(shared.clone() as Arc<dyn TimeoutDelegate>);

        let status_shared = shared.clone();
        conn.set_dispatch_status_observer(move |status| {
            if status == DispatchStatus::DataRemains {
                status_shared.push(Command::Drain);
            }
        });
        let wake_shared = shared.clone();
        conn.set_wake_up(move || wake_shared.wake());

        shared.push(Command::Drain);

        let poller = {
            let shared = shared.clone();
            let conn = conn.clone();
            std::thread::Builder::new()
                .name("rdbus-poller".into())
                .spawn(move || poller_main(conn, shared, queue))?
        };

        Ok(Self { shared, poller: Some(poller) })
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.wake();
        if let Some(poller) = self.poller.take() {
            let _ = poller.join();
        }
    }
}

impl Drop for QueueDriver {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn poller_main(conn: Arc<Connection>, shared: Arc<PollerShared>, queue: Arc<dyn WorkQueue>) {
    let mut groups: Vec<WatchGroup<PolledFd>> = Vec::new();
    let mut timers = Timers::new();
    let mut events = polling::Events::new();
    // drains are serialized, overlapping jobs would starve each other
    let drain_lock = Arc::new(Mutex::new(()));
    let drain_scheduled = Arc::new(AtomicBool::new(false));

    loop {
        for command in shared.commands.lock().unwrap().drain(..) {
            match command {
                Command::AddWatch(watch) => {
                    let fd = watch.fd();
                    let state = WatchState { enabled: watch.enabled(), watch };
                    match groups.iter_mut().find(|group| group.io.fd == fd) {
                        Some(group) => group.watches.push(state),
                        None => {
                            // registered disarmed, the arming pass below
                            // sets the real interest; the fd doubles as the
                            // event key
                            if let Err(err) =
                                unsafe { shared.poller.add(fd, polling::Event::none(fd as usize)) }
                            {
                                tracing::warn!(%err, fd, "cannot register transport fd");
                                continue;
                            }
                            groups.push(WatchGroup {
                                io: PolledFd { fd, in_flight: Arc::new(AtomicBool::new(false)) },
                                watches: vec![state],
                            });
                        }
                    }
                }
                Command::RemoveWatch(id) => {
                    groups.retain_mut(|group| {
                        if group.remove(id) {
                            let fd = unsafe { BorrowedFd::borrow_raw(group.io.fd) };
                            let _ = shared.poller.delete(fd);
                            false
                        } else {
                            true
                        }
                    });
                }
                Command::ToggleWatch(id, enabled) => {
                    for group in groups.iter_mut() {
                        group.toggle(id, enabled);
                    }
                }
                Command::AddTimeout(timeout) => timers.add(timeout),
                Command::RemoveTimeout(id) => timers.remove(id),
                Command::ToggleTimeout(id, enabled) => timers.toggle(id, enabled),
                Command::Drain | Command::WakeUp => {
                    schedule_drain(&conn, &queue, &drain_lock, &drain_scheduled);
                }
            }
        }

        if shared.stop.load(Ordering::Acquire) {
            break;
        }

        // arm every idle descriptor; delivery is one-shot, a fired fd stays
        // disarmed until this pass runs again
        for group in groups.iter() {
            if group.io.in_flight.load(Ordering::Acquire) {
                continue;
            }
            let wanted = group.wanted();
            let mut event = polling::Event::none(group.io.fd as usize);
            event.readable = wanted.contains(WatchFlags::READABLE);
            event.writable = wanted.contains(WatchFlags::WRITABLE);
            let fd = unsafe { BorrowedFd::borrow_raw(group.io.fd) };
            let _ = shared.poller.modify(fd, event);
        }

        let timeout =
            timers.next_deadline().map(|at| at.saturating_duration_since(Instant::now()));

        events.clear();
        match shared.poller.wait(&mut events, timeout) {
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => {
                tracing::warn!(%err, "transport poll failed, stopping the poller");
                break;
            }
        }

        for event in events.iter() {
            let Some(group) = groups.iter().find(|group| group.io.fd as usize == event.key)
            else {
                continue;
            };
            let mut observed = WatchFlags::empty();
            if event.readable {
                observed |= WatchFlags::READABLE;
            }
            if event.writable {
                observed |= WatchFlags::WRITABLE;
            }
            if observed.is_empty() || group.io.in_flight.swap(true, Ordering::AcqRel) {
                continue;
            }

            let targets: Vec<Watch> = group
                .watches
                .iter()
                .filter(|state| state.enabled)
                .map(|state| state.watch.alias())
                .collect();
            let in_flight = group.io.in_flight.clone();
            let shared = shared.clone();
            let conn = conn.clone();
            let drain_lock = drain_lock.clone();
            queue.post(Box::new(move || {
                for watch in &targets {
                    let relevant =
                        observed & (watch.flags() | WatchFlags::ERROR | WatchFlags::HANGUP);
                    if !relevant.is_empty() && !watch.handle(relevant) {
                        tracing::warn!("transport out of memory handling a watch event");
                    }
                }
                {
                    let _guard = drain_lock.lock().unwrap();
                    while conn.dispatch() == DispatchStatus::DataRemains {}
                }
                in_flight.store(false, Ordering::Release);
                // bring the poller back for this fd
                shared.wake();
            }));
        }

        timers.run_elapsed(|timeout| {
            let timeout = timeout.alias();
            queue.post(Box::new(move || {
                timeout.handle();
            }));
        });
    }
}

fn schedule_drain(
    conn: &Arc<Connection>,
    queue: &Arc<dyn WorkQueue>,
    drain_lock: &Arc<Mutex<()>>,
    drain_scheduled: &Arc<AtomicBool>,
) {
    if drain_scheduled.swap(true, Ordering::AcqRel) {
        return;
    }
    let conn = conn.clone();
    let drain_lock = drain_lock.clone();
    let drain_scheduled = drain_scheduled.clone();
    queue.post(Box::new(move || {
        drain_scheduled.store(false, Ordering::Release);
        let _guard = drain_lock.lock().unwrap();
        while conn.dispatch() == DispatchStatus::DataRemains {}
    }));
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::connection::{CallTimeout, HandlerResult};
    use crate::message::Message;
    use crate::tests::session_or_skip;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn loop_driver_completes_a_pending_reply() {
        let Some(conn) = session_or_skip() else { return };
        let driver = LoopDriver::new(&conn);

        let ex = async_executor::Executor::new();
        futures_lite::future::block_on(ex.run(async {
            let _loop_task = ex.spawn(driver.run());

            let msg = Message::method_call(
                "org.freedesktop.DBus",
                "/org/freedesktop/DBus",
                "org.freedesktop.DBus",
                "ListNames",
            )
            .unwrap();
            let pending = conn.send_with_reply(msg, CallTimeout::UseDefault).unwrap();
            let mut reply = pending.await.unwrap();
            let names: Vec<String> = crate::arg::Arg::read(&mut reply.reader()).unwrap();
            assert!(names.iter().any(|n| n == "org.freedesktop.DBus"));

            // the cooperative proxy form rides the same driver
            let bus =
                crate::proxy::Proxy::new(&conn, "org.freedesktop.DBus", "/org/freedesktop/DBus");
            let id: String = bus.call_async("org.freedesktop.DBus", "GetId", ()).await.unwrap();
            assert!(!id.is_empty());
        }));
    }

    #[test]
    fn queue_driver_dispatches_signals() {
        let Some(conn) = session_or_skip() else { return };
        let hits = Arc::new(AtomicUsize::new(0));

        let path = "/test/QueueDriver";
        let seen = hits.clone();
        conn.register_handler(path, move |_, _| {
            seen.fetch_add(1, Ordering::SeqCst);
            HandlerResult::Handled
        });

        let pool = Arc::new(ThreadPool::new(2));
        let driver = QueueDriver::new(&conn, pool).unwrap();

        let unique = conn.unique_name().unwrap();
        let mut msg = Message::signal(path, "test.QueueDriver", "Poke").unwrap();
        msg.set_destination(&unique).unwrap();
        conn.send(msg).unwrap();

        for _ in 0..100 {
            if hits.load(Ordering::SeqCst) > 0 {
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        driver.stop();
        assert!(hits.load(Ordering::SeqCst) > 0, "the driver must deliver the signal");
    }
}
