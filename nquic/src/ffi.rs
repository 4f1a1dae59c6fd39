//! Raw C ABI shared with the native engine
//!
//! Everything in this module is laid out with `#[repr(C)]` and mirrors the layout the engine
//! expects. Application code should not need it; it is public so that a host can build the
//! [`ApiTable`] handed to [`crate::api::install`].

use std::{
    ffi::{c_char, c_void},
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6},
    ptr,
};

/// Raw status code returned by every native entry point
pub type RawStatus = u32;

/// Opaque native object handle
#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Handle(pub *mut c_void);

// Handles are opaque identifiers; the engine serializes access to the objects behind them.
unsafe impl Send for Handle {}
unsafe impl Sync for Handle {}

impl Handle {
    /// The handle of an object that was never opened
    pub const NULL: Self = Self(ptr::null_mut());

    /// Whether this handle refers to nothing
    pub fn is_null(self) -> bool {
        self.0.is_null()
    }
}

/// Scatter/gather descriptor for one contiguous buffer
#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct QuicBuffer {
    pub length: u32,
    pub buffer: *mut u8,
}

impl QuicBuffer {
    /// Borrow the bytes this descriptor points at
    ///
    /// # Safety
    ///
    /// `buffer` must be valid for reads of `length` bytes for the lifetime of the returned slice.
    pub unsafe fn as_slice<'a>(&self) -> &'a [u8] {
        if self.buffer.is_null() || self.length == 0 {
            return &[];
        }
        unsafe { std::slice::from_raw_parts(self.buffer, self.length as usize) }
    }
}

pub const ADDRESS_FAMILY_UNSPEC: u16 = 0;
pub const ADDRESS_FAMILY_INET: u16 = 2;
pub const ADDRESS_FAMILY_INET6: u16 = 10;

/// Socket address as exchanged with the engine
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RawAddr {
    pub family: u16,
    /// Host byte order
    pub port: u16,
    pub flow_info: u32,
    /// IPv4 addresses occupy the first four bytes
    pub ip: [u8; 16],
    pub scope_id: u32,
}

impl RawAddr {
    /// An address with an unspecified family, used to let the engine pick
    pub const UNSPECIFIED: Self = Self {
        family: ADDRESS_FAMILY_UNSPEC,
        port: 0,
        flow_info: 0,
        ip: [0; 16],
        scope_id: 0,
    };

    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        match self.family {
            ADDRESS_FAMILY_INET => {
                let ip = Ipv4Addr::new(self.ip[0], self.ip[1], self.ip[2], self.ip[3]);
                Some(SocketAddr::V4(SocketAddrV4::new(ip, self.port)))
            }
            ADDRESS_FAMILY_INET6 => Some(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(self.ip),
                self.port,
                self.flow_info,
                self.scope_id,
            ))),
            _ => None,
        }
    }
}

impl Default for RawAddr {
    fn default() -> Self {
        Self::UNSPECIFIED
    }
}

impl From<SocketAddr> for RawAddr {
    fn from(addr: SocketAddr) -> Self {
        let mut raw = Self::UNSPECIFIED;
        raw.port = addr.port();
        match addr {
            SocketAddr::V4(v4) => {
                raw.family = ADDRESS_FAMILY_INET;
                raw.ip[..4].copy_from_slice(&v4.ip().octets());
            }
            SocketAddr::V6(v6) => {
                raw.family = ADDRESS_FAMILY_INET6;
                raw.ip = v6.ip().octets();
                raw.flow_info = v6.flowinfo();
                raw.scope_id = v6.scope_id();
            }
        }
        raw
    }
}

impl From<IpAddr> for RawAddr {
    fn from(ip: IpAddr) -> Self {
        Self::from(SocketAddr::new(ip, 0))
    }
}

#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct RawRegistrationConfig {
    pub app_name: *const c_char,
    pub execution_profile: u32,
}

pub mod settings_mask {
    pub const IDLE_TIMEOUT: u64 = 1 << 0;
    pub const HANDSHAKE_IDLE_TIMEOUT: u64 = 1 << 1;
    pub const KEEP_ALIVE_INTERVAL: u64 = 1 << 2;
    pub const PEER_BIDI_STREAM_COUNT: u64 = 1 << 3;
    pub const PEER_UNIDI_STREAM_COUNT: u64 = 1 << 4;
    pub const DATAGRAM_RECEIVE_ENABLED: u64 = 1 << 5;
    pub const SEND_BUFFERING_ENABLED: u64 = 1 << 6;
    pub const SERVER_RESUMPTION_LEVEL: u64 = 1 << 7;
}

/// Settings applied to a configuration; only fields flagged in `is_set` are read
#[repr(C)]
#[derive(Debug, Copy, Clone, Default)]
pub struct RawSettings {
    pub is_set: u64,
    pub idle_timeout_ms: u64,
    pub handshake_idle_timeout_ms: u64,
    pub keep_alive_interval_ms: u32,
    pub peer_bidi_stream_count: u16,
    pub peer_unidi_stream_count: u16,
    pub datagram_receive_enabled: u8,
    pub send_buffering_enabled: u8,
    pub server_resumption_level: u8,
}

pub const CREDENTIAL_TYPE_NONE: u32 = 0;
pub const CREDENTIAL_TYPE_CERTIFICATE_FILE: u32 = 1;
pub const CREDENTIAL_TYPE_CERTIFICATE_FILE_PROTECTED: u32 = 2;
pub const CREDENTIAL_TYPE_PKCS12: u32 = 3;

#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct RawCredentialConfig {
    pub kind: u32,
    pub flags: u32,
    pub certificate_file: *const c_char,
    pub private_key_file: *const c_char,
    pub password: *const c_char,
    pub pkcs12: *const u8,
    pub pkcs12_length: u32,
}

pub mod param {
    pub const LISTENER_LOCAL_ADDRESS: u32 = 0x0400_0000;
    pub const CONN_LOCAL_ADDRESS: u32 = 0x0500_0001;
    pub const CONN_REMOTE_ADDRESS: u32 = 0x0500_0002;
    pub const CONN_RESUMPTION_TICKET: u32 = 0x0500_0010;
    pub const CONN_STREAM_SCHEDULING_SCHEME: u32 = 0x0500_0013;
    pub const STREAM_ID: u32 = 0x0800_0000;
    pub const STREAM_IDEAL_SEND_BUFFER_SIZE: u32 = 0x0800_0002;
    pub const STREAM_PRIORITY: u32 = 0x0800_0003;
}

pub mod listener_event {
    pub const NEW_CONNECTION: u32 = 0;
    pub const STOP_COMPLETE: u32 = 1;
}

pub mod connection_event {
    pub const CONNECTED: u32 = 0;
    pub const SHUTDOWN_INITIATED_BY_TRANSPORT: u32 = 1;
    pub const SHUTDOWN_INITIATED_BY_PEER: u32 = 2;
    pub const SHUTDOWN_COMPLETE: u32 = 3;
    pub const LOCAL_ADDRESS_CHANGED: u32 = 4;
    pub const PEER_ADDRESS_CHANGED: u32 = 5;
    pub const PEER_STREAM_STARTED: u32 = 6;
    pub const STREAMS_AVAILABLE: u32 = 7;
    pub const PEER_NEEDS_STREAMS: u32 = 8;
    pub const IDEAL_PROCESSOR_CHANGED: u32 = 9;
    pub const DATAGRAM_STATE_CHANGED: u32 = 10;
    pub const DATAGRAM_RECEIVED: u32 = 11;
    pub const DATAGRAM_SEND_STATE_CHANGED: u32 = 12;
    pub const RESUMED: u32 = 13;
    pub const RESUMPTION_TICKET_RECEIVED: u32 = 14;
    pub const PEER_CERTIFICATE_RECEIVED: u32 = 15;
}

pub mod stream_event {
    pub const START_COMPLETE: u32 = 0;
    pub const RECEIVE: u32 = 1;
    pub const SEND_COMPLETE: u32 = 2;
    pub const PEER_SEND_SHUTDOWN: u32 = 3;
    pub const PEER_SEND_ABORTED: u32 = 4;
    pub const PEER_RECEIVE_ABORTED: u32 = 5;
    pub const SEND_SHUTDOWN_COMPLETE: u32 = 6;
    pub const SHUTDOWN_COMPLETE: u32 = 7;
    pub const IDEAL_SEND_BUFFER_SIZE: u32 = 8;
    pub const PEER_ACCEPTED: u32 = 9;
}

// Listener events

#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct RawNewConnectionInfo {
    pub quic_version: u32,
    pub local_address: *const RawAddr,
    pub remote_address: *const RawAddr,
    pub client_alpn_list_length: u16,
    pub server_name_length: u16,
    pub negotiated_alpn_length: u8,
    /// Sequence of length-prefixed protocol ids
    pub client_alpn_list: *const u8,
    pub negotiated_alpn: *const u8,
    /// Not NUL-terminated
    pub server_name: *const c_char,
}

#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct NewConnectionPayload {
    pub info: *const RawNewConnectionInfo,
    pub connection: Handle,
}

#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct StopCompletePayload {
    pub app_close_in_progress: u8,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub union RawListenerEventPayload {
    pub new_connection: NewConnectionPayload,
    pub stop_complete: StopCompletePayload,
    pub reserved: u64,
}

#[repr(C)]
pub struct RawListenerEvent {
    pub kind: u32,
    pub payload: RawListenerEventPayload,
}

// Connection events

#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct ConnectedPayload {
    pub session_resumed: u8,
    pub negotiated_alpn_length: u8,
    pub negotiated_alpn: *const u8,
}

#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct ShutdownByTransportPayload {
    pub status: RawStatus,
    pub error_code: u64,
}

#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct ErrorCodePayload {
    pub error_code: u64,
}

#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct ConnectionShutdownCompletePayload {
    pub handshake_completed: u8,
    pub peer_acknowledged_shutdown: u8,
    pub app_close_in_progress: u8,
}

#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct AddressChangedPayload {
    pub address: *const RawAddr,
}

#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct PeerStreamStartedPayload {
    pub stream: Handle,
    pub flags: u32,
}

#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct StreamsAvailablePayload {
    pub bidirectional_count: u16,
    pub unidirectional_count: u16,
}

#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct PeerNeedsStreamsPayload {
    pub bidirectional: u8,
}

#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct IdealProcessorChangedPayload {
    pub ideal_processor: u16,
}

#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct DatagramStateChangedPayload {
    pub send_enabled: u8,
    pub max_send_length: u16,
}

#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct DatagramReceivedPayload {
    pub buffer: *const QuicBuffer,
    pub flags: u32,
}

#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct DatagramSendStateChangedPayload {
    pub client_context: *mut c_void,
    pub state: u32,
}

#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct ResumedPayload {
    pub resumption_state_length: u16,
    pub resumption_state: *const u8,
}

#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct ResumptionTicketReceivedPayload {
    pub resumption_ticket_length: u32,
    pub resumption_ticket: *const u8,
}

#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct PeerCertificateReceivedPayload {
    /// DER encoded
    pub certificate: *const u8,
    pub certificate_length: u32,
    pub deferred_error_flags: u32,
    pub deferred_status: RawStatus,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub union RawConnectionEventPayload {
    pub connected: ConnectedPayload,
    pub shutdown_initiated_by_transport: ShutdownByTransportPayload,
    pub shutdown_initiated_by_peer: ErrorCodePayload,
    pub shutdown_complete: ConnectionShutdownCompletePayload,
    pub address_changed: AddressChangedPayload,
    pub peer_stream_started: PeerStreamStartedPayload,
    pub streams_available: StreamsAvailablePayload,
    pub peer_needs_streams: PeerNeedsStreamsPayload,
    pub ideal_processor_changed: IdealProcessorChangedPayload,
    pub datagram_state_changed: DatagramStateChangedPayload,
    pub datagram_received: DatagramReceivedPayload,
    pub datagram_send_state_changed: DatagramSendStateChangedPayload,
    pub resumed: ResumedPayload,
    pub resumption_ticket_received: ResumptionTicketReceivedPayload,
    pub peer_certificate_received: PeerCertificateReceivedPayload,
    pub reserved: u64,
}

#[repr(C)]
pub struct RawConnectionEvent {
    pub kind: u32,
    pub payload: RawConnectionEventPayload,
}

// Stream events

#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct StartCompletePayload {
    pub status: RawStatus,
    pub id: u64,
    pub peer_accepted: u8,
}

#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct ReceivePayload {
    pub absolute_offset: u64,
    pub total_buffer_length: u64,
    pub buffers: *const QuicBuffer,
    pub buffer_count: u32,
    pub flags: u32,
}

#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct SendCompletePayload {
    pub canceled: u8,
    pub client_context: *mut c_void,
}

#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct SendShutdownCompletePayload {
    pub graceful: u8,
}

#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct StreamShutdownCompletePayload {
    pub connection_shutdown: u8,
    pub app_close_in_progress: u8,
    pub connection_shutdown_by_app: u8,
    pub connection_closed_remotely: u8,
    pub connection_error_code: u64,
    pub connection_close_status: RawStatus,
}

#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct IdealSendBufferSizePayload {
    pub byte_count: u64,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub union RawStreamEventPayload {
    pub start_complete: StartCompletePayload,
    pub receive: ReceivePayload,
    pub send_complete: SendCompletePayload,
    pub peer_send_aborted: ErrorCodePayload,
    pub peer_receive_aborted: ErrorCodePayload,
    pub send_shutdown_complete: SendShutdownCompletePayload,
    pub shutdown_complete: StreamShutdownCompletePayload,
    pub ideal_send_buffer_size: IdealSendBufferSizePayload,
    pub reserved: u64,
}

#[repr(C)]
pub struct RawStreamEvent {
    pub kind: u32,
    pub payload: RawStreamEventPayload,
}

pub type ListenerCallback =
    unsafe extern "C" fn(Handle, *mut c_void, *mut RawListenerEvent) -> RawStatus;
pub type ConnectionCallback =
    unsafe extern "C" fn(Handle, *mut c_void, *mut RawConnectionEvent) -> RawStatus;
pub type StreamCallback =
    unsafe extern "C" fn(Handle, *mut c_void, *mut RawStreamEvent) -> RawStatus;

/// Entry points of the native engine, installed once per process
///
/// Every "start"-like entry point only submits work; its outcome is reported later through the
/// callback registered for the handle.
#[repr(C)]
pub struct ApiTable {
    pub set_context: unsafe extern "C" fn(Handle, *mut c_void),
    pub get_context: unsafe extern "C" fn(Handle) -> *mut c_void,
    /// `handler` is a [`ListenerCallback`], [`ConnectionCallback`] or [`StreamCallback`]
    /// depending on the kind of `handle`
    pub set_callback_handler: unsafe extern "C" fn(Handle, *const c_void, *mut c_void),
    pub set_param: unsafe extern "C" fn(Handle, u32, u32, *const c_void) -> RawStatus,
    pub get_param: unsafe extern "C" fn(Handle, u32, *mut u32, *mut c_void) -> RawStatus,

    pub registration_open:
        unsafe extern "C" fn(*const RawRegistrationConfig, *mut Handle) -> RawStatus,
    pub registration_close: unsafe extern "C" fn(Handle),
    pub registration_shutdown: unsafe extern "C" fn(Handle, u32, u64),

    pub configuration_open: unsafe extern "C" fn(
        Handle,
        *const QuicBuffer,
        u32,
        *const RawSettings,
        u32,
        *mut c_void,
        *mut Handle,
    ) -> RawStatus,
    pub configuration_close: unsafe extern "C" fn(Handle),
    pub configuration_load_credential:
        unsafe extern "C" fn(Handle, *const RawCredentialConfig) -> RawStatus,

    pub listener_open:
        unsafe extern "C" fn(Handle, ListenerCallback, *mut c_void, *mut Handle) -> RawStatus,
    pub listener_close: unsafe extern "C" fn(Handle),
    pub listener_start:
        unsafe extern "C" fn(Handle, *const QuicBuffer, u32, *const RawAddr) -> RawStatus,
    pub listener_stop: unsafe extern "C" fn(Handle),

    pub connection_open:
        unsafe extern "C" fn(Handle, ConnectionCallback, *mut c_void, *mut Handle) -> RawStatus,
    pub connection_close: unsafe extern "C" fn(Handle),
    pub connection_shutdown: unsafe extern "C" fn(Handle, u32, u64),
    pub connection_start:
        unsafe extern "C" fn(Handle, Handle, u16, *const c_char, u16) -> RawStatus,
    pub connection_set_configuration: unsafe extern "C" fn(Handle, Handle) -> RawStatus,
    pub connection_send_resumption_ticket:
        unsafe extern "C" fn(Handle, u32, u16, *const u8) -> RawStatus,

    pub stream_open: unsafe extern "C" fn(
        Handle,
        u32,
        StreamCallback,
        *mut c_void,
        *mut Handle,
    ) -> RawStatus,
    pub stream_close: unsafe extern "C" fn(Handle),
    pub stream_start: unsafe extern "C" fn(Handle, u32) -> RawStatus,
    pub stream_shutdown: unsafe extern "C" fn(Handle, u32, u64) -> RawStatus,
    pub stream_send:
        unsafe extern "C" fn(Handle, *const QuicBuffer, u32, u32, *mut c_void) -> RawStatus,
    pub stream_receive_complete: unsafe extern "C" fn(Handle, u64),
    pub stream_receive_set_enabled: unsafe extern "C" fn(Handle, u8) -> RawStatus,

    pub datagram_send:
        unsafe extern "C" fn(Handle, *const QuicBuffer, u32, u32, *mut c_void) -> RawStatus,
    pub connection_certificate_validation_complete:
        unsafe extern "C" fn(Handle, u8, u16) -> RawStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_addr_v4() {
        let addr: SocketAddr = "192.0.2.7:4433".parse().unwrap();
        let raw = RawAddr::from(addr);
        assert_eq!(raw.family, ADDRESS_FAMILY_INET);
        assert_eq!(&raw.ip[..4], &[192, 0, 2, 7]);
        assert_eq!(raw.to_socket_addr(), Some(addr));
    }

    #[test]
    fn raw_addr_v6_keeps_scope() {
        let addr = SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::LOCALHOST, 443, 0, 3));
        assert_eq!(RawAddr::from(addr).to_socket_addr(), Some(addr));
    }

    #[test]
    fn unspecified_has_no_socket_addr() {
        assert_eq!(RawAddr::UNSPECIFIED.to_socket_addr(), None);
    }

    #[test]
    fn empty_buffer_is_empty_slice() {
        let buf = QuicBuffer {
            length: 0,
            buffer: ptr::null_mut(),
        };
        assert!(unsafe { buf.as_slice() }.is_empty());
    }
}
