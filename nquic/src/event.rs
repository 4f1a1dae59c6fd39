//! Typed views of the events the engine delivers
//!
//! Raw events point into memory the engine reuses as soon as the callback returns, so conversion
//! copies every buffer. Nothing in this module keeps a raw pointer into an event payload.

use std::{ffi::c_void, net::SocketAddr, slice};

use bytes::{Bytes, BytesMut};

use crate::{
    error::Error,
    ffi::{
        connection_event, listener_event, stream_event, Handle, QuicBuffer, RawAddr,
        RawConnectionEvent, RawListenerEvent, RawNewConnectionInfo, RawStreamEvent,
    },
    flags::{ReceiveFlags, StreamOpenFlags},
    status::Status,
};

/// Opaque per-send context the binding attaches to a submission
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ClientContext(pub(crate) *mut c_void);

// Only ever dereferenced by the binding, which owns what it points to.
unsafe impl Send for ClientContext {}
unsafe impl Sync for ClientContext {}

/// Progress of a datagram handed to [`Connection::send_datagram`](crate::Connection::send_datagram)
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DatagramSendState {
    Unknown,
    Sent,
    /// Possibly lost; more states follow
    LostSuspect,
    LostDiscarded,
    Acknowledged,
    AcknowledgedSpurious,
    Canceled,
}

impl DatagramSendState {
    fn from_raw(raw: u32) -> Self {
        match raw {
            1 => Self::Sent,
            2 => Self::LostSuspect,
            3 => Self::LostDiscarded,
            4 => Self::Acknowledged,
            5 => Self::AcknowledgedSpurious,
            6 => Self::Canceled,
            _ => Self::Unknown,
        }
    }

    /// Whether the engine is done with the datagram's buffer
    pub fn is_final(self) -> bool {
        !matches!(self, Self::Sent | Self::LostSuspect)
    }

    /// What a sender waiting on the datagram learns, if anything
    pub(crate) fn outcome(self) -> Option<Result<(), Error>> {
        match self {
            Self::Sent | Self::LostDiscarded | Self::Acknowledged | Self::AcknowledgedSpurious => {
                Some(Ok(()))
            }
            Self::Canceled | Self::Unknown => Some(Err(Error::Aborted)),
            Self::LostSuspect => None,
        }
    }
}

/// Details of a connection attempt offered to a listener's acceptor
#[derive(Debug, Clone)]
pub struct NewConnectionInfo {
    pub quic_version: u32,
    pub local_address: Option<SocketAddr>,
    pub remote_address: Option<SocketAddr>,
    /// The server name the client asked for, empty if none
    pub server_name: String,
    pub negotiated_alpn: Bytes,
    /// Every protocol the client offered, in its order of preference
    pub client_alpns: Vec<Bytes>,
}

impl NewConnectionInfo {
    unsafe fn from_raw(raw: &RawNewConnectionInfo) -> Self {
        unsafe {
            let client_alpns = split_alpn_list(copy(
                raw.client_alpn_list,
                raw.client_alpn_list_length as usize,
            ));
            let server_name = copy(raw.server_name.cast(), raw.server_name_length as usize);
            Self {
                quic_version: raw.quic_version,
                local_address: addr(raw.local_address),
                remote_address: addr(raw.remote_address),
                server_name: String::from_utf8_lossy(&server_name).into_owned(),
                negotiated_alpn: copy(raw.negotiated_alpn, raw.negotiated_alpn_length as usize),
                client_alpns,
            }
        }
    }
}

/// Split a sequence of length-prefixed protocol ids
fn split_alpn_list(mut list: Bytes) -> Vec<Bytes> {
    let mut alpns = Vec::new();
    while let Some((&len, _)) = list.split_first() {
        let len = len as usize;
        if list.len() <= len {
            break;
        }
        let mut entry = list.split_to(1 + len);
        alpns.push(entry.split_off(1));
    }
    alpns
}

pub(crate) enum ListenerEvent {
    NewConnection {
        info: NewConnectionInfo,
        connection: Handle,
    },
    StopComplete {
        app_close_in_progress: bool,
    },
    Unknown(u32),
}

impl ListenerEvent {
    /// # Safety
    ///
    /// Every pointer in `raw` must be valid as documented by the engine for the duration of the
    /// call.
    pub(crate) unsafe fn from_raw(raw: &RawListenerEvent) -> Self {
        unsafe {
            match raw.kind {
                listener_event::NEW_CONNECTION => {
                    let p = raw.payload.new_connection;
                    Self::NewConnection {
                        info: NewConnectionInfo::from_raw(&*p.info),
                        connection: p.connection,
                    }
                }
                listener_event::STOP_COMPLETE => Self::StopComplete {
                    app_close_in_progress: raw.payload.stop_complete.app_close_in_progress != 0,
                },
                other => Self::Unknown(other),
            }
        }
    }
}

/// An event reported by the engine for one connection
///
/// Handed to the handler installed with
/// [`Connection::on_event`](crate::Connection::on_event) before the binding acts on it.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Connected {
        session_resumed: bool,
        negotiated_alpn: Bytes,
    },
    ShutdownInitiatedByTransport {
        status: Status,
        error_code: u64,
    },
    ShutdownInitiatedByPeer {
        error_code: u64,
    },
    ShutdownComplete {
        handshake_completed: bool,
        peer_acknowledged_shutdown: bool,
        app_close_in_progress: bool,
    },
    LocalAddressChanged(Option<SocketAddr>),
    PeerAddressChanged(Option<SocketAddr>),
    /// The peer opened a stream; the binding adopts `stream` unless a handler rejects the event
    PeerStreamStarted {
        stream: Handle,
        flags: StreamOpenFlags,
    },
    StreamsAvailable {
        bidirectional: u16,
        unidirectional: u16,
    },
    PeerNeedsStreams {
        bidirectional: bool,
    },
    IdealProcessorChanged {
        processor: u16,
    },
    DatagramStateChanged {
        send_enabled: bool,
        max_send_length: u16,
    },
    DatagramReceived {
        data: Bytes,
        flags: ReceiveFlags,
    },
    DatagramSendStateChanged {
        context: ClientContext,
        state: DatagramSendState,
    },
    Resumed {
        state: Bytes,
    },
    ResumptionTicketReceived {
        ticket: Bytes,
    },
    /// DER encoded peer certificate, with the verdict of the engine's own validation if it was
    /// deferred
    PeerCertificateReceived {
        certificate: Bytes,
        deferred_error_flags: u32,
        deferred_status: Status,
    },
    Unknown(u32),
}

impl ConnectionEvent {
    /// # Safety
    ///
    /// As for [`ListenerEvent::from_raw`].
    pub(crate) unsafe fn from_raw(raw: &RawConnectionEvent) -> Self {
        use connection_event::*;
        unsafe {
            let p = &raw.payload;
            match raw.kind {
                CONNECTED => Self::Connected {
                    session_resumed: p.connected.session_resumed != 0,
                    negotiated_alpn: copy(
                        p.connected.negotiated_alpn,
                        p.connected.negotiated_alpn_length as usize,
                    ),
                },
                SHUTDOWN_INITIATED_BY_TRANSPORT => Self::ShutdownInitiatedByTransport {
                    status: Status(p.shutdown_initiated_by_transport.status),
                    error_code: p.shutdown_initiated_by_transport.error_code,
                },
                SHUTDOWN_INITIATED_BY_PEER => Self::ShutdownInitiatedByPeer {
                    error_code: p.shutdown_initiated_by_peer.error_code,
                },
                SHUTDOWN_COMPLETE => Self::ShutdownComplete {
                    handshake_completed: p.shutdown_complete.handshake_completed != 0,
                    peer_acknowledged_shutdown: p.shutdown_complete.peer_acknowledged_shutdown
                        != 0,
                    app_close_in_progress: p.shutdown_complete.app_close_in_progress != 0,
                },
                LOCAL_ADDRESS_CHANGED => Self::LocalAddressChanged(addr(p.address_changed.address)),
                PEER_ADDRESS_CHANGED => Self::PeerAddressChanged(addr(p.address_changed.address)),
                PEER_STREAM_STARTED => Self::PeerStreamStarted {
                    stream: p.peer_stream_started.stream,
                    flags: StreamOpenFlags::from_bits(p.peer_stream_started.flags),
                },
                STREAMS_AVAILABLE => Self::StreamsAvailable {
                    bidirectional: p.streams_available.bidirectional_count,
                    unidirectional: p.streams_available.unidirectional_count,
                },
                PEER_NEEDS_STREAMS => Self::PeerNeedsStreams {
                    bidirectional: p.peer_needs_streams.bidirectional != 0,
                },
                IDEAL_PROCESSOR_CHANGED => Self::IdealProcessorChanged {
                    processor: p.ideal_processor_changed.ideal_processor,
                },
                DATAGRAM_STATE_CHANGED => Self::DatagramStateChanged {
                    send_enabled: p.datagram_state_changed.send_enabled != 0,
                    max_send_length: p.datagram_state_changed.max_send_length,
                },
                DATAGRAM_RECEIVED => {
                    let buffer = p.datagram_received.buffer;
                    Self::DatagramReceived {
                        data: match buffer.is_null() {
                            true => Bytes::new(),
                            false => Bytes::copy_from_slice((*buffer).as_slice()),
                        },
                        flags: ReceiveFlags::from_bits(p.datagram_received.flags),
                    }
                }
                DATAGRAM_SEND_STATE_CHANGED => Self::DatagramSendStateChanged {
                    context: ClientContext(p.datagram_send_state_changed.client_context),
                    state: DatagramSendState::from_raw(p.datagram_send_state_changed.state),
                },
                RESUMED => Self::Resumed {
                    state: copy(
                        p.resumed.resumption_state,
                        p.resumed.resumption_state_length as usize,
                    ),
                },
                RESUMPTION_TICKET_RECEIVED => Self::ResumptionTicketReceived {
                    ticket: copy(
                        p.resumption_ticket_received.resumption_ticket,
                        p.resumption_ticket_received.resumption_ticket_length as usize,
                    ),
                },
                PEER_CERTIFICATE_RECEIVED => Self::PeerCertificateReceived {
                    certificate: copy(
                        p.peer_certificate_received.certificate,
                        p.peer_certificate_received.certificate_length as usize,
                    ),
                    deferred_error_flags: p.peer_certificate_received.deferred_error_flags,
                    deferred_status: Status(p.peer_certificate_received.deferred_status),
                },
                other => Self::Unknown(other),
            }
        }
    }
}

pub(crate) enum StreamEvent {
    StartComplete {
        status: Status,
        id: u64,
        peer_accepted: bool,
    },
    /// All buffers of one receive indication, joined
    Receive {
        data: Bytes,
        total: u64,
        flags: ReceiveFlags,
    },
    SendComplete {
        canceled: bool,
        context: ClientContext,
    },
    PeerSendShutdown,
    PeerSendAborted {
        error_code: u64,
    },
    PeerReceiveAborted {
        error_code: u64,
    },
    SendShutdownComplete {
        graceful: bool,
    },
    ShutdownComplete {
        connection_shutdown: bool,
        connection_error_code: u64,
        connection_close_status: Status,
    },
    IdealSendBufferSize {
        byte_count: u64,
    },
    PeerAccepted,
    Unknown(u32),
}

impl StreamEvent {
    /// # Safety
    ///
    /// As for [`ListenerEvent::from_raw`].
    pub(crate) unsafe fn from_raw(raw: &RawStreamEvent) -> Self {
        use stream_event::*;
        unsafe {
            let p = &raw.payload;
            match raw.kind {
                START_COMPLETE => Self::StartComplete {
                    status: Status(p.start_complete.status),
                    id: p.start_complete.id,
                    peer_accepted: p.start_complete.peer_accepted != 0,
                },
                RECEIVE => {
                    let r = p.receive;
                    let buffers: &[QuicBuffer] = match r.buffers.is_null() {
                        true => &[],
                        false => slice::from_raw_parts(r.buffers, r.buffer_count as usize),
                    };
                    Self::Receive {
                        data: gather(buffers),
                        total: r.total_buffer_length,
                        flags: ReceiveFlags::from_bits(r.flags),
                    }
                }
                SEND_COMPLETE => Self::SendComplete {
                    canceled: p.send_complete.canceled != 0,
                    context: ClientContext(p.send_complete.client_context),
                },
                PEER_SEND_SHUTDOWN => Self::PeerSendShutdown,
                PEER_SEND_ABORTED => Self::PeerSendAborted {
                    error_code: p.peer_send_aborted.error_code,
                },
                PEER_RECEIVE_ABORTED => Self::PeerReceiveAborted {
                    error_code: p.peer_receive_aborted.error_code,
                },
                SEND_SHUTDOWN_COMPLETE => Self::SendShutdownComplete {
                    graceful: p.send_shutdown_complete.graceful != 0,
                },
                SHUTDOWN_COMPLETE => Self::ShutdownComplete {
                    connection_shutdown: p.shutdown_complete.connection_shutdown != 0,
                    connection_error_code: p.shutdown_complete.connection_error_code,
                    connection_close_status: Status(p.shutdown_complete.connection_close_status),
                },
                IDEAL_SEND_BUFFER_SIZE => Self::IdealSendBufferSize {
                    byte_count: p.ideal_send_buffer_size.byte_count,
                },
                PEER_ACCEPTED => Self::PeerAccepted,
                other => Self::Unknown(other),
            }
        }
    }
}

fn gather(buffers: &[QuicBuffer]) -> Bytes {
    match buffers {
        [] => Bytes::new(),
        [one] => Bytes::copy_from_slice(unsafe { one.as_slice() }),
        many => {
            let len = many.iter().map(|b| b.length as usize).sum();
            let mut out = BytesMut::with_capacity(len);
            for buf in many {
                out.extend_from_slice(unsafe { buf.as_slice() });
            }
            out.freeze()
        }
    }
}

unsafe fn copy(ptr: *const u8, len: usize) -> Bytes {
    if ptr.is_null() || len == 0 {
        return Bytes::new();
    }
    Bytes::copy_from_slice(unsafe { slice::from_raw_parts(ptr, len) })
}

unsafe fn addr(ptr: *const RawAddr) -> Option<SocketAddr> {
    match ptr.is_null() {
        true => None,
        false => unsafe { (*ptr).to_socket_addr() },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ffi::{
        RawConnectionEventPayload, RawStreamEventPayload, ReceivePayload,
        DatagramSendStateChangedPayload,
    };
    use std::ptr;

    #[test]
    fn receive_joins_buffers_and_copies() {
        let mut first = *b"Hel";
        let mut second = *b"lo";
        let buffers = [
            QuicBuffer {
                length: 3,
                buffer: first.as_mut_ptr(),
            },
            QuicBuffer {
                length: 2,
                buffer: second.as_mut_ptr(),
            },
        ];
        let raw = RawStreamEvent {
            kind: stream_event::RECEIVE,
            payload: RawStreamEventPayload {
                receive: ReceivePayload {
                    absolute_offset: 0,
                    total_buffer_length: 5,
                    buffers: buffers.as_ptr(),
                    buffer_count: 2,
                    flags: ReceiveFlags::FIN.bits(),
                },
            },
        };
        let event = unsafe { StreamEvent::from_raw(&raw) };
        first.fill(0);
        match event {
            StreamEvent::Receive { data, total, flags } => {
                assert_eq!(&data[..], b"Hello");
                assert_eq!(total, 5);
                assert!(flags.contains(ReceiveFlags::FIN));
            }
            _ => panic!("wrong event"),
        }
    }

    #[test]
    fn unknown_kinds_survive() {
        let raw = RawStreamEvent {
            kind: 99,
            payload: RawStreamEventPayload { reserved: 0 },
        };
        assert!(matches!(unsafe { StreamEvent::from_raw(&raw) }, StreamEvent::Unknown(99)));
    }

    #[test]
    fn datagram_states() {
        let raw = RawConnectionEvent {
            kind: connection_event::DATAGRAM_SEND_STATE_CHANGED,
            payload: RawConnectionEventPayload {
                datagram_send_state_changed: DatagramSendStateChangedPayload {
                    client_context: ptr::null_mut(),
                    state: 2,
                },
            },
        };
        match unsafe { ConnectionEvent::from_raw(&raw) } {
            ConnectionEvent::DatagramSendStateChanged { state, .. } => {
                assert_eq!(state, DatagramSendState::LostSuspect);
                assert!(!state.is_final());
                assert_eq!(state.outcome(), None);
            }
            other => panic!("wrong event {other:?}"),
        }
        assert_eq!(DatagramSendState::Acknowledged.outcome(), Some(Ok(())));
        assert_eq!(DatagramSendState::Canceled.outcome(), Some(Err(Error::Aborted)));
        assert!(!DatagramSendState::Sent.is_final());
        assert!(DatagramSendState::LostDiscarded.is_final());
    }

    #[test]
    fn alpn_list() {
        let list = Bytes::from_static(b"\x02h3\x05hq-29\x0atruncated");
        assert_eq!(
            split_alpn_list(list),
            vec![Bytes::from_static(b"h3"), Bytes::from_static(b"hq-29")]
        );
    }
}
