//! Declarations for the `dbus-1` transport library.
//!
//! Only the surface this crate actually drives is declared here: connection
//! lifecycle, send paths, dispatching, the message iterator, pending calls,
//! watch/timeout registration and the error slot. Everything stays faithful
//! to the C header layout, the wrappers in the rest of the crate never reach
//! around these declarations.

use std::ffi;

/// `dbus_bool_t`. Zero is false, everything else is true.
pub type RawBool = ffi::c_uint;

pub const TRUE: RawBool = 1;
pub const FALSE: RawBool = 0;

#[repr(transparent)]
pub struct RawConnection {
    _opaque: ffi::c_void,
}

#[repr(transparent)]
pub struct RawMessage {
    _opaque: ffi::c_void,
}

#[repr(transparent)]
pub struct RawPendingCall {
    _opaque: ffi::c_void,
}

#[repr(transparent)]
pub struct RawWatch {
    _opaque: ffi::c_void,
}

#[repr(transparent)]
pub struct RawTimeout {
    _opaque: ffi::c_void,
}

/// `DBusError`. Caller-allocated, must go through `dbus_error_init` before
/// use and `dbus_error_free` after.
#[repr(C)]
pub struct RawError {
    pub name: *const ffi::c_char,
    pub message: *const ffi::c_char,
    pub dummy: ffi::c_uint,
    pub padding1: *const ffi::c_void,
}

/// `DBusMessageIter`. Caller-allocated scratch space the transport fills in,
/// the field names are meaningless on purpose (they are in the C header too).
#[repr(C)]
#[derive(Clone, Copy)]
pub struct RawIter {
    pub dummy1: *mut ffi::c_void,
    pub dummy2: *mut ffi::c_void,
    pub dummy3: u32,
    pub dummy4: ffi::c_int,
    pub dummy5: ffi::c_int,
    pub dummy6: ffi::c_int,
    pub dummy7: ffi::c_int,
    pub dummy8: ffi::c_int,
    pub dummy9: ffi::c_int,
    pub dummy10: ffi::c_int,
    pub dummy11: ffi::c_int,
    pub pad1: ffi::c_int,
    pub pad2: ffi::c_int,
    pub pad3: *mut ffi::c_void,
}

impl RawIter {
    pub fn zeroed() -> Self {
        unsafe { std::mem::zeroed() }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C)]
pub enum BusKind {
    Session = 0,
    System = 1,
    Starter = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C)]
pub enum RawHandlerResult {
    Handled = 0,
    NotYetHandled = 1,
    NeedMemory = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C)]
pub enum RawDispatchStatus {
    DataRemains = 0,
    Complete = 1,
    NeedMemory = 2,
}

// Message type bytes, shared with the wire format.
pub const MESSAGE_TYPE_INVALID: ffi::c_int = 0;
pub const MESSAGE_TYPE_METHOD_CALL: ffi::c_int = 1;
pub const MESSAGE_TYPE_METHOD_RETURN: ffi::c_int = 2;
pub const MESSAGE_TYPE_ERROR: ffi::c_int = 3;
pub const MESSAGE_TYPE_SIGNAL: ffi::c_int = 4;

// Watch flag bits.
pub const WATCH_READABLE: ffi::c_uint = 1 << 0;
pub const WATCH_WRITABLE: ffi::c_uint = 1 << 1;
pub const WATCH_ERROR: ffi::c_uint = 1 << 2;
pub const WATCH_HANGUP: ffi::c_uint = 1 << 3;

// Method call timeout sentinels.
pub const TIMEOUT_USE_DEFAULT: ffi::c_int = -1;
pub const TIMEOUT_INFINITE: ffi::c_int = 0x7fff_ffff;

pub type FreeFn = Option<unsafe extern "C" fn(data: *mut ffi::c_void)>;

pub type HandleMessageFn = unsafe extern "C" fn(
    conn: *mut RawConnection,
    msg: *mut RawMessage,
    data: *mut ffi::c_void,
) -> RawHandlerResult;

pub type AddWatchFn = unsafe extern "C" fn(watch: *mut RawWatch, data: *mut ffi::c_void) -> RawBool;
pub type RemoveWatchFn = unsafe extern "C" fn(watch: *mut RawWatch, data: *mut ffi::c_void);
pub type WatchToggledFn = unsafe extern "C" fn(watch: *mut RawWatch, data: *mut ffi::c_void);

pub type AddTimeoutFn =
    unsafe extern "C" fn(timeout: *mut RawTimeout, data: *mut ffi::c_void) -> RawBool;
pub type RemoveTimeoutFn = unsafe extern "C" fn(timeout: *mut RawTimeout, data: *mut ffi::c_void);
pub type TimeoutToggledFn = unsafe extern "C" fn(timeout: *mut RawTimeout, data: *mut ffi::c_void);

pub type PendingNotifyFn =
    unsafe extern "C" fn(pending: *mut RawPendingCall, data: *mut ffi::c_void);

pub type WakeupMainFn = unsafe extern "C" fn(data: *mut ffi::c_void);

pub type DispatchStatusFn = unsafe extern "C" fn(
    conn: *mut RawConnection,
    status: RawDispatchStatus,
    data: *mut ffi::c_void,
);

#[link(name = "dbus-1")]
extern "C" {

    // library

    pub fn dbus_threads_init_default() -> RawBool;
    pub fn dbus_free(memory: *mut ffi::c_void);

    // bus connections

    pub fn dbus_bus_get(kind: BusKind, error: *mut RawError) -> *mut RawConnection;
    pub fn dbus_bus_get_private(kind: BusKind, error: *mut RawError) -> *mut RawConnection;
    pub fn dbus_connection_open_private(
        address: *const ffi::c_char,
        error: *mut RawError,
    ) -> *mut RawConnection;

    pub fn dbus_bus_register(conn: *mut RawConnection, error: *mut RawError) -> RawBool;
    pub fn dbus_bus_get_unique_name(conn: *mut RawConnection) -> *const ffi::c_char;

    pub fn dbus_connection_ref(conn: *mut RawConnection) -> *mut RawConnection;
    pub fn dbus_connection_unref(conn: *mut RawConnection);
    pub fn dbus_connection_close(conn: *mut RawConnection);

    pub fn dbus_connection_set_exit_on_disconnect(conn: *mut RawConnection, enable: RawBool);

    pub fn dbus_connection_get_is_connected(conn: *mut RawConnection) -> RawBool;
    pub fn dbus_connection_get_is_authenticated(conn: *mut RawConnection) -> RawBool;
    pub fn dbus_connection_get_is_anonymous(conn: *mut RawConnection) -> RawBool;
    pub fn dbus_connection_get_server_id(conn: *mut RawConnection) -> *mut ffi::c_char;
    pub fn dbus_connection_get_unix_user(
        conn: *mut RawConnection,
        uid: *mut ffi::c_ulong,
    ) -> RawBool;

    // send / receive / dispatch

    pub fn dbus_connection_send(
        conn: *mut RawConnection,
        msg: *mut RawMessage,
        serial: *mut u32,
    ) -> RawBool;
    pub fn dbus_connection_send_with_reply(
        conn: *mut RawConnection,
        msg: *mut RawMessage,
        pending: *mut *mut RawPendingCall,
        timeout_ms: ffi::c_int,
    ) -> RawBool;
    pub fn dbus_connection_send_with_reply_and_block(
        conn: *mut RawConnection,
        msg: *mut RawMessage,
        timeout_ms: ffi::c_int,
        error: *mut RawError,
    ) -> *mut RawMessage;

    pub fn dbus_connection_flush(conn: *mut RawConnection);
    pub fn dbus_connection_read_write_dispatch(
        conn: *mut RawConnection,
        timeout_ms: ffi::c_int,
    ) -> RawBool;
    pub fn dbus_connection_read_write(conn: *mut RawConnection, timeout_ms: ffi::c_int) -> RawBool;

    pub fn dbus_connection_pop_message(conn: *mut RawConnection) -> *mut RawMessage;
    pub fn dbus_connection_borrow_message(conn: *mut RawConnection) -> *mut RawMessage;
    pub fn dbus_connection_return_message(conn: *mut RawConnection, msg: *mut RawMessage);
    pub fn dbus_connection_steal_borrowed_message(conn: *mut RawConnection, msg: *mut RawMessage);

    pub fn dbus_connection_dispatch(conn: *mut RawConnection) -> RawDispatchStatus;
    pub fn dbus_connection_get_dispatch_status(conn: *mut RawConnection) -> RawDispatchStatus;
    pub fn dbus_connection_has_messages_to_send(conn: *mut RawConnection) -> RawBool;

    // filters and main-loop hooks

    pub fn dbus_connection_add_filter(
        conn: *mut RawConnection,
        handler: HandleMessageFn,
        data: *mut ffi::c_void,
        free_data: FreeFn,
    ) -> RawBool;
    pub fn dbus_connection_remove_filter(
        conn: *mut RawConnection,
        handler: HandleMessageFn,
        data: *mut ffi::c_void,
    );

    pub fn dbus_connection_set_watch_functions(
        conn: *mut RawConnection,
        add: AddWatchFn,
        remove: RemoveWatchFn,
        toggled: WatchToggledFn,
        data: *mut ffi::c_void,
        free_data: FreeFn,
    ) -> RawBool;
    pub fn dbus_connection_set_timeout_functions(
        conn: *mut RawConnection,
        add: AddTimeoutFn,
        remove: RemoveTimeoutFn,
        toggled: TimeoutToggledFn,
        data: *mut ffi::c_void,
        free_data: FreeFn,
    ) -> RawBool;
    pub fn dbus_connection_set_wakeup_main_function(
        conn: *mut RawConnection,
        wakeup: WakeupMainFn,
        data: *mut ffi::c_void,
        free_data: FreeFn,
    );
    pub fn dbus_connection_set_dispatch_status_function(
        conn: *mut RawConnection,
        status: DispatchStatusFn,
        data: *mut ffi::c_void,
        free_data: FreeFn,
    );

    // limits

    pub fn dbus_connection_set_max_message_size(conn: *mut RawConnection, size: ffi::c_long);
    pub fn dbus_connection_set_max_received_size(conn: *mut RawConnection, size: ffi::c_long);
    pub fn dbus_connection_set_max_message_unix_fds(conn: *mut RawConnection, n: ffi::c_long);
    pub fn dbus_connection_set_max_received_unix_fds(conn: *mut RawConnection, n: ffi::c_long);

    // watches and timeouts

    pub fn dbus_watch_get_unix_fd(watch: *mut RawWatch) -> ffi::c_int;
    pub fn dbus_watch_get_flags(watch: *mut RawWatch) -> ffi::c_uint;
    pub fn dbus_watch_get_enabled(watch: *mut RawWatch) -> RawBool;
    pub fn dbus_watch_handle(watch: *mut RawWatch, flags: ffi::c_uint) -> RawBool;

    pub fn dbus_timeout_get_interval(timeout: *mut RawTimeout) -> ffi::c_int;
    pub fn dbus_timeout_get_enabled(timeout: *mut RawTimeout) -> RawBool;
    pub fn dbus_timeout_handle(timeout: *mut RawTimeout) -> RawBool;

    // pending calls

    pub fn dbus_pending_call_ref(pending: *mut RawPendingCall) -> *mut RawPendingCall;
    pub fn dbus_pending_call_unref(pending: *mut RawPendingCall);
    pub fn dbus_pending_call_set_notify(
        pending: *mut RawPendingCall,
        notify: PendingNotifyFn,
        data: *mut ffi::c_void,
        free_data: FreeFn,
    ) -> RawBool;
    pub fn dbus_pending_call_get_completed(pending: *mut RawPendingCall) -> RawBool;
    pub fn dbus_pending_call_steal_reply(pending: *mut RawPendingCall) -> *mut RawMessage;
    pub fn dbus_pending_call_block(pending: *mut RawPendingCall);
    pub fn dbus_pending_call_cancel(pending: *mut RawPendingCall);

    // messages

    pub fn dbus_message_new(kind: ffi::c_int) -> *mut RawMessage;
    pub fn dbus_message_new_method_call(
        destination: *const ffi::c_char,
        path: *const ffi::c_char,
        iface: *const ffi::c_char,
        method: *const ffi::c_char,
    ) -> *mut RawMessage;
    pub fn dbus_message_new_method_return(call: *mut RawMessage) -> *mut RawMessage;
    pub fn dbus_message_new_error(
        reply_to: *mut RawMessage,
        name: *const ffi::c_char,
        text: *const ffi::c_char,
    ) -> *mut RawMessage;
    pub fn dbus_message_new_signal(
        path: *const ffi::c_char,
        iface: *const ffi::c_char,
        name: *const ffi::c_char,
    ) -> *mut RawMessage;
    pub fn dbus_message_copy(msg: *const RawMessage) -> *mut RawMessage;

    pub fn dbus_message_ref(msg: *mut RawMessage) -> *mut RawMessage;
    pub fn dbus_message_unref(msg: *mut RawMessage);

    pub fn dbus_message_get_type(msg: *mut RawMessage) -> ffi::c_int;
    pub fn dbus_message_get_serial(msg: *mut RawMessage) -> u32;
    pub fn dbus_message_get_reply_serial(msg: *mut RawMessage) -> u32;
    pub fn dbus_message_set_reply_serial(msg: *mut RawMessage, serial: u32) -> RawBool;

    pub fn dbus_message_get_path(msg: *mut RawMessage) -> *const ffi::c_char;
    pub fn dbus_message_set_path(msg: *mut RawMessage, path: *const ffi::c_char) -> RawBool;
    pub fn dbus_message_get_interface(msg: *mut RawMessage) -> *const ffi::c_char;
    pub fn dbus_message_set_interface(msg: *mut RawMessage, iface: *const ffi::c_char) -> RawBool;
    pub fn dbus_message_get_member(msg: *mut RawMessage) -> *const ffi::c_char;
    pub fn dbus_message_set_member(msg: *mut RawMessage, member: *const ffi::c_char) -> RawBool;
    pub fn dbus_message_get_destination(msg: *mut RawMessage) -> *const ffi::c_char;
    pub fn dbus_message_set_destination(msg: *mut RawMessage, dest: *const ffi::c_char) -> RawBool;
    pub fn dbus_message_get_sender(msg: *mut RawMessage) -> *const ffi::c_char;
    pub fn dbus_message_set_sender(msg: *mut RawMessage, sender: *const ffi::c_char) -> RawBool;
    pub fn dbus_message_get_error_name(msg: *mut RawMessage) -> *const ffi::c_char;
    pub fn dbus_message_set_error_name(msg: *mut RawMessage, name: *const ffi::c_char) -> RawBool;
    pub fn dbus_message_get_signature(msg: *mut RawMessage) -> *const ffi::c_char;

    pub fn dbus_message_get_no_reply(msg: *mut RawMessage) -> RawBool;
    pub fn dbus_message_set_no_reply(msg: *mut RawMessage, no_reply: RawBool);
    pub fn dbus_message_get_auto_start(msg: *mut RawMessage) -> RawBool;
    pub fn dbus_message_set_auto_start(msg: *mut RawMessage, auto_start: RawBool);

    // message iterator

    pub fn dbus_message_iter_init(msg: *mut RawMessage, iter: *mut RawIter) -> RawBool;
    pub fn dbus_message_iter_init_append(msg: *mut RawMessage, iter: *mut RawIter);

    pub fn dbus_message_iter_get_arg_type(iter: *mut RawIter) -> ffi::c_int;
    pub fn dbus_message_iter_get_element_type(iter: *mut RawIter) -> ffi::c_int;
    pub fn dbus_message_iter_has_next(iter: *mut RawIter) -> RawBool;
    pub fn dbus_message_iter_next(iter: *mut RawIter) -> RawBool;
    pub fn dbus_message_iter_recurse(iter: *mut RawIter, sub: *mut RawIter);
    pub fn dbus_message_iter_get_basic(iter: *mut RawIter, value: *mut ffi::c_void);
    pub fn dbus_message_iter_get_signature(iter: *mut RawIter) -> *mut ffi::c_char;

    pub fn dbus_message_iter_append_basic(
        iter: *mut RawIter,
        kind: ffi::c_int,
        value: *const ffi::c_void,
    ) -> RawBool;
    pub fn dbus_message_iter_open_container(
        iter: *mut RawIter,
        kind: ffi::c_int,
        contained_signature: *const ffi::c_char,
        sub: *mut RawIter,
    ) -> RawBool;
    pub fn dbus_message_iter_close_container(iter: *mut RawIter, sub: *mut RawIter) -> RawBool;
    pub fn dbus_message_iter_abandon_container(iter: *mut RawIter, sub: *mut RawIter);

    // errors

    pub fn dbus_error_init(error: *mut RawError);
    pub fn dbus_error_free(error: *mut RawError);
    pub fn dbus_error_is_set(error: *const RawError) -> RawBool;
    pub fn dbus_error_has_name(error: *const RawError, name: *const ffi::c_char) -> RawBool;
    pub fn dbus_set_error_from_message(error: *mut RawError, msg: *mut RawMessage) -> RawBool;

}
