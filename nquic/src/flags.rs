//! Typed flag words passed to and received from the engine

use std::{fmt, ops};

macro_rules! flags {
    {$(
        $(#[$outer:meta])*
        $ty:ident { $($name:ident($val:expr) $desc:expr;)* }
    )*} => {$(
        $(#[$outer])*
        #[derive(Copy, Clone, Default, PartialEq, Eq, Hash)]
        pub struct $ty(u32);

        impl $ty {
            pub const NONE: Self = Self(0);
            $(#[doc = $desc] pub const $name: Self = Self($val);)*

            /// The raw flag word
            pub const fn bits(self) -> u32 {
                self.0
            }

            /// Reinterpret a raw flag word, keeping unknown bits
            pub const fn from_bits(bits: u32) -> Self {
                Self(bits)
            }

            /// Whether every bit of `other` is set in `self`
            pub const fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }

            pub const fn is_empty(self) -> bool {
                self.0 == 0
            }
        }

        impl ops::BitOr for $ty {
            type Output = Self;

            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }

        impl ops::BitOrAssign for $ty {
            fn bitor_assign(&mut self, rhs: Self) {
                self.0 |= rhs.0;
            }
        }

        impl ops::Sub for $ty {
            type Output = Self;

            fn sub(self, rhs: Self) -> Self {
                Self(self.0 & !rhs.0)
            }
        }

        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let mut set = f.debug_set();
                let mut rest = self.0;
                $(
                    if $val != 0 && self.0 & $val == $val && rest & $val != 0 {
                        set.entry(&format_args!(stringify!($name)));
                        rest &= !$val;
                    }
                )*
                if rest != 0 {
                    set.entry(&format_args!("{:#x}", rest));
                }
                set.finish()
            }
        }
    )*}
}

flags! {
    /// Options for [`Connection::open_stream`](crate::Connection::open_stream)
    StreamOpenFlags {
        UNIDIRECTIONAL(0x1) "open a send-only stream";
        ZERO_RTT(0x2) "the stream may carry 0-RTT data";
    }

    /// Options for [`Stream::start`](crate::Stream::start)
    StreamStartFlags {
        IMMEDIATE(0x1) "tell the peer about the stream right away instead of with its first data";
        FAIL_BLOCKED(0x2) "fail instead of queueing when the peer's stream limit is reached";
        SHUTDOWN_ON_FAIL(0x4) "shut the stream down if starting fails";
        INDICATE_PEER_ACCEPT(0x8) "report when the peer accepts the stream";
    }

    /// Options for [`Stream::shutdown`](crate::Stream::shutdown)
    StreamShutdownFlags {
        GRACEFUL(0x1) "finish the send direction after queued data";
        ABORT_SEND(0x2) "reset the send direction";
        ABORT_RECEIVE(0x4) "stop the receive direction";
        ABORT(0x6) "abort both directions";
        IMMEDIATE(0x8) "complete shutdown without waiting for the peer";
    }

    /// Options attached to stream sends and datagrams
    SendFlags {
        ALLOW_0_RTT(0x1) "the data may be sent as 0-RTT";
        START(0x2) "start the stream if it has not been started";
        FIN(0x4) "no more data follows on this stream";
        DGRAM_PRIORITY(0x8) "prioritize the datagram over stream data";
        DELAY_SEND(0x10) "hold the data until more is queued";
    }

    /// Flags reported with received data
    ReceiveFlags {
        ZERO_RTT(0x1) "the data arrived as 0-RTT";
        FIN(0x2) "this is the last data on the stream";
    }

    /// Options for shutting down a connection or registration
    ConnectionShutdownFlags {
        SILENT(0x1) "discard the connection without notifying the peer";
    }

    /// Options for [`send_resumption_ticket`](crate::Connection::send_resumption_ticket)
    ResumptionTicketFlags {
        FINAL(0x1) "no more tickets follow on this connection";
    }

    /// Options for a credential
    CredentialFlags {
        CLIENT(0x1) "the credential is used by a client";
        NO_CERTIFICATE_VALIDATION(0x4) "skip peer certificate validation";
        INDICATE_CERTIFICATE_RECEIVED(0x10) "report the peer certificate as a connection event";
        DEFER_CERTIFICATE_VALIDATION(0x20) "let the application overrule the engine's verdict";
        REQUIRE_CLIENT_AUTHENTICATION(0x40) "require clients to present a certificate";
    }
}

impl SendFlags {
    /// The flags that end the send direction and may only ride on the last chunk of a batch
    pub(crate) fn is_terminal(self) -> bool {
        self.contains(Self::FIN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composite_abort() {
        let flags = StreamShutdownFlags::ABORT_SEND | StreamShutdownFlags::ABORT_RECEIVE;
        assert_eq!(flags, StreamShutdownFlags::ABORT);
        assert!(flags.contains(StreamShutdownFlags::ABORT_SEND));
        assert!(!flags.contains(StreamShutdownFlags::GRACEFUL));
    }

    #[test]
    fn difference() {
        let flags = SendFlags::FIN | SendFlags::START;
        assert_eq!(flags - SendFlags::FIN, SendFlags::START);
        assert!(flags.is_terminal());
        assert!(!(flags - SendFlags::FIN).is_terminal());
    }

    #[test]
    fn debug_names_bits() {
        let flags = SendFlags::FIN | SendFlags::from_bits(0x100);
        assert_eq!(format!("{flags:?}"), "{FIN, 0x100}");
        assert_eq!(format!("{:?}", StreamShutdownFlags::ABORT), "{ABORT_SEND, ABORT_RECEIVE}");
    }
}
