//! Async bindings over a callback-driven native QUIC engine
//!
//! The engine implements the protocol and runs its own worker threads; it reports progress by
//! calling back into this crate with events for each listener, connection and stream. This crate
//! turns those callbacks into `async` operations: every call that submits work to the engine
//! returns a future that completes when the matching completion event arrives.
//!
//! The engine's entry points are provided by the host as an [`ffi::ApiTable`], installed once
//! per process with [`api::install`]. Every constructor fails with [`Error::NotInitialized`]
//! until then.
//!
//! # Objects
//!
//! A [`Registration`] ties an application to the engine. A [`Configuration`] carries the ALPN
//! list, [`Settings`] and TLS [`Credential`] used by connections. Clients create a
//! [`Connection`] and [`start`](Connection::start) it; servers run a [`Listener`] whose acceptor
//! decides on each [`Incoming`] connection. Streams are opened with
//! [`Connection::open_stream`] or handed to the handler installed with
//! [`Connection::on_peer_stream`].
//!
//! # Lifetimes
//!
//! Each wrapper keeps itself alive while the engine may still call back into it, and closes its
//! native handle only once both the application and the engine are done with it. Pending
//! operations never hang: when an object shuts down, everything still waiting on it resolves,
//! with [`Error::Aborted`] if nothing else applies.
//!
//! # Windowed sends
//!
//! With send buffering disabled in the [`Settings`], the engine only holds what it is currently
//! sending. [`Stream::send_chunks`] and [`Stream::enqueue`]/[`Stream::drain`] then keep the rest
//! in the binding and release it as the engine reports room.
#![warn(unreachable_pub)]
#![warn(clippy::use_self)]

pub mod api;
mod configuration;
mod connection;
mod error;
mod event;
pub mod ffi;
mod flags;
mod listener;
mod mutex;
mod object;
mod recv;
mod registration;
mod runtime;
mod status;
mod stream;
mod window;

pub use crate::configuration::{Configuration, Credential, ServerResumptionLevel, Settings};
pub use crate::connection::{Connection, ConnectionState, Datagrams, StreamSchedulingScheme};
pub use crate::error::{CertificateErrorKind, Error};
pub use crate::event::{ClientContext, ConnectionEvent, DatagramSendState, NewConnectionInfo};
pub use crate::flags::{
    ConnectionShutdownFlags, CredentialFlags, ReceiveFlags, ResumptionTicketFlags, SendFlags,
    StreamOpenFlags, StreamShutdownFlags, StreamStartFlags,
};
pub use crate::listener::{Incoming, Listener};
pub use crate::recv::{ReadToEndError, Receive};
pub use crate::registration::{ExecutionProfile, Registration};
pub use crate::runtime::{default_runtime, Runtime, TokioRuntime};
pub use crate::status::Status;
pub use crate::stream::{Stream, StreamState};
pub use crate::window::{SendWindowOptions, DEFAULT_BOOTSTRAP_WINDOW};

#[cfg(test)]
mod tests;
