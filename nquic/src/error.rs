use std::io;

use thiserror::Error;

use crate::status::Status;

/// Errors reported by the binding and the engine
///
/// Every native status maps to exactly one variant. Operations that fail synchronously return the
/// error directly; operations that fail later resolve their pending future with it.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// No engine API table has been installed
    #[error("engine not initialized")]
    NotInitialized,
    #[error("invalid parameter")]
    InvalidParameter,
    /// The operation is not valid in the object's current lifecycle state
    #[error("invalid state")]
    InvalidState,
    #[error("out of memory")]
    OutOfMemory,
    #[error("connection refused")]
    ConnectionRefused,
    #[error("connection timed out")]
    ConnectionTimeout,
    #[error("handshake failed")]
    HandshakeFailure,
    /// The operation, stream or connection was aborted or canceled
    #[error("aborted")]
    Aborted,
    #[error("address in use")]
    AddressInUse,
    #[error("destination unreachable")]
    Unreachable,
    #[error("connection idle")]
    ConnectionIdle,
    #[error("internal error")]
    InternalError,
    #[error("server busy")]
    ServerBusy,
    #[error("protocol error")]
    ProtocolError,
    #[error("stream limit reached")]
    StreamLimitReached,
    #[error("not supported")]
    NotSupported,
    /// A TLS alert ended the handshake
    #[error("TLS alert {0}")]
    TlsError(u8),
    #[error("certificate error: {0}")]
    CertificateError(CertificateErrorKind),
    /// A status this binding has no name for
    #[error("unknown status {0:#x}")]
    Unknown(u32),
}

/// Why a certificate was rejected
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CertificateErrorKind {
    #[error("expired")]
    Expired,
    #[error("untrusted root")]
    UntrustedRoot,
    #[error("no certificate")]
    NoCertificate,
}

/// TLS `internal_error` alert, reported when the engine gives no more specific alert
const INTERNAL_ERROR_ALERT: u8 = 80;

impl Error {
    pub(crate) fn from_status(status: Status) -> Self {
        use self::Error::*;
        match status {
            Status::OUT_OF_MEMORY => OutOfMemory,
            Status::INVALID_PARAMETER | Status::BUFFER_TOO_SMALL | Status::INVALID_ADDRESS => {
                InvalidParameter
            }
            Status::INVALID_STATE => InvalidState,
            Status::NOT_SUPPORTED => NotSupported,
            Status::HANDSHAKE_FAILURE | Status::ALPN_NEG_FAILURE | Status::VER_NEG_ERROR => {
                HandshakeFailure
            }
            Status::ABORTED | Status::USER_CANCELED => Aborted,
            Status::ADDRESS_IN_USE | Status::ALPN_IN_USE => AddressInUse,
            Status::CONNECTION_TIMEOUT => ConnectionTimeout,
            Status::CONNECTION_IDLE => ConnectionIdle,
            Status::INTERNAL_ERROR => InternalError,
            Status::CONNECTION_REFUSED => ConnectionRefused,
            Status::PROTOCOL_ERROR => ProtocolError,
            Status::UNREACHABLE | Status::ADDRESS_NOT_AVAILABLE => Unreachable,
            Status::TLS_ERROR => TlsError(INTERNAL_ERROR_ALERT),
            Status::STREAM_LIMIT_REACHED => StreamLimitReached,
            Status::SERVER_BUSY => ServerBusy,
            Status::CERT_EXPIRED => CertificateError(CertificateErrorKind::Expired),
            Status::CERT_UNTRUSTED_ROOT => CertificateError(CertificateErrorKind::UntrustedRoot),
            Status::CERT_NO_CERT => CertificateError(CertificateErrorKind::NoCertificate),
            other => match other.tls_alert_code() {
                Some(alert) => TlsError(alert),
                None => Unknown(other.0),
            },
        }
    }

    /// The status handed back to the engine when this error is returned from a callback
    pub fn to_status(self) -> Status {
        use self::Error::*;
        match self {
            NotInitialized | InvalidState => Status::INVALID_STATE,
            InvalidParameter => Status::INVALID_PARAMETER,
            OutOfMemory => Status::OUT_OF_MEMORY,
            ConnectionRefused => Status::CONNECTION_REFUSED,
            ConnectionTimeout => Status::CONNECTION_TIMEOUT,
            HandshakeFailure => Status::HANDSHAKE_FAILURE,
            Aborted => Status::ABORTED,
            AddressInUse => Status::ADDRESS_IN_USE,
            Unreachable => Status::UNREACHABLE,
            ConnectionIdle => Status::CONNECTION_IDLE,
            InternalError => Status::INTERNAL_ERROR,
            ServerBusy => Status::SERVER_BUSY,
            ProtocolError => Status::PROTOCOL_ERROR,
            StreamLimitReached => Status::STREAM_LIMIT_REACHED,
            NotSupported => Status::NOT_SUPPORTED,
            TlsError(alert) => Status::tls_alert(alert),
            CertificateError(CertificateErrorKind::Expired) => Status::CERT_EXPIRED,
            CertificateError(CertificateErrorKind::UntrustedRoot) => Status::CERT_UNTRUSTED_ROOT,
            CertificateError(CertificateErrorKind::NoCertificate) => Status::CERT_NO_CERT,
            Unknown(raw) => Status(raw),
        }
    }
}

impl From<Error> for io::Error {
    fn from(x: Error) -> Self {
        use self::Error::*;
        let kind = match x {
            NotInitialized | InvalidState => io::ErrorKind::NotConnected,
            InvalidParameter | NotSupported => io::ErrorKind::InvalidInput,
            OutOfMemory => io::ErrorKind::OutOfMemory,
            ConnectionRefused => io::ErrorKind::ConnectionRefused,
            ConnectionTimeout | ConnectionIdle => io::ErrorKind::TimedOut,
            Aborted => io::ErrorKind::ConnectionReset,
            AddressInUse => io::ErrorKind::AddrInUse,
            Unreachable => io::ErrorKind::AddrNotAvailable,
            HandshakeFailure | TlsError(_) | CertificateError(_) => {
                io::ErrorKind::PermissionDenied
            }
            InternalError | ServerBusy | ProtocolError | StreamLimitReached | Unknown(_) => {
                io::ErrorKind::Other
            }
        };
        Self::new(kind, x)
    }
}
