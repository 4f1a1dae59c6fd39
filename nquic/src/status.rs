use std::fmt;

use crate::{error::Error, ffi::RawStatus};

/// A status code as returned by the engine
///
/// Most application code only sees [`Error`]; `Status` appears where a value travels back to the
/// engine, such as the return value of an event handler.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Status(pub RawStatus);

impl Status {
    pub const SUCCESS: Self = Self(0);
    pub const PENDING: Self = Self(0xFFFF_FFFE);
    pub const CONTINUE: Self = Self(0xFFFF_FFFF);

    pub const OUT_OF_MEMORY: Self = Self(12);
    pub const INVALID_PARAMETER: Self = Self(22);
    pub const INVALID_STATE: Self = Self(1);
    pub const NOT_SUPPORTED: Self = Self(95);
    pub const NOT_FOUND: Self = Self(2);
    pub const BUFFER_TOO_SMALL: Self = Self(75);
    pub const HANDSHAKE_FAILURE: Self = Self(103);
    pub const ABORTED: Self = Self(125);
    pub const ADDRESS_IN_USE: Self = Self(98);
    pub const INVALID_ADDRESS: Self = Self(97);
    pub const CONNECTION_TIMEOUT: Self = Self(110);
    pub const CONNECTION_IDLE: Self = Self(62);
    pub const INTERNAL_ERROR: Self = Self(5);
    pub const CONNECTION_REFUSED: Self = Self(111);
    pub const PROTOCOL_ERROR: Self = Self(71);
    pub const VER_NEG_ERROR: Self = Self(93);
    pub const UNREACHABLE: Self = Self(113);
    pub const TLS_ERROR: Self = Self(126);
    pub const USER_CANCELED: Self = Self(130);
    pub const ALPN_NEG_FAILURE: Self = Self(92);
    pub const STREAM_LIMIT_REACHED: Self = Self(86);
    pub const ALPN_IN_USE: Self = Self(91);
    pub const ADDRESS_NOT_AVAILABLE: Self = Self(99);
    pub const SERVER_BUSY: Self = Self(16);

    const ERROR_BASE: RawStatus = 200_000_000;
    const TLS_ALERT_BASE: RawStatus = Self::ERROR_BASE + 256;
    const CERT_BASE: RawStatus = Self::ERROR_BASE + 512;

    pub const CERT_EXPIRED: Self = Self(Self::CERT_BASE + 1);
    pub const CERT_UNTRUSTED_ROOT: Self = Self(Self::CERT_BASE + 2);
    pub const CERT_NO_CERT: Self = Self(Self::CERT_BASE + 3);

    /// The status carrying a TLS alert sent or received during the handshake
    pub const fn tls_alert(alert: u8) -> Self {
        Self(Self::TLS_ALERT_BASE + alert as RawStatus)
    }

    /// Whether the engine considers this a success
    ///
    /// `PENDING` and `CONTINUE` are successes: the operation was accepted and finishes later.
    pub fn is_success(self) -> bool {
        self == Self::SUCCESS || self == Self::PENDING || self == Self::CONTINUE
    }

    /// Translate into exactly one [`Error`], or `Ok` for any success code
    pub fn to_result(self) -> Result<(), Error> {
        match self.is_success() {
            true => Ok(()),
            false => Err(Error::from_status(self)),
        }
    }

    pub(crate) fn tls_alert_code(self) -> Option<u8> {
        let alert = self.0.checked_sub(Self::TLS_ALERT_BASE)?;
        u8::try_from(alert).ok()
    }
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Status({:#x})", self.0)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_result() {
            Ok(()) => f.write_str("success"),
            Err(e) => write!(f, "{e} ({:#x})", self.0),
        }
    }
}

impl From<Error> for Status {
    fn from(error: Error) -> Self {
        error.to_status()
    }
}

impl From<Result<(), Error>> for Status {
    fn from(result: Result<(), Error>) -> Self {
        match result {
            Ok(()) => Self::SUCCESS,
            Err(e) => e.into(),
        }
    }
}
