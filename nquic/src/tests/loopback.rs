use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::info_span;
use tracing_futures::Instrument as _;

use super::sim::{sim, Call, CERTIFICATE};
use super::{
    client_configuration, configuration, gen_data, registration, rt_threaded, subscribe,
    wait_until, ALPN,
};
use crate::{
    CertificateErrorKind, Configuration, Connection, Credential, ConnectionEvent, ConnectionState,
    CredentialFlags, Error, Listener, ReadToEndError, ResumptionTicketFlags, SendFlags, Settings,
    Stream, StreamOpenFlags, StreamShutdownFlags, StreamStartFlags, StreamState,
};

/// A started listener handing out every connection it accepts
struct Server {
    listener: Listener,
    port: u16,
    accepted: mpsc::UnboundedReceiver<Connection>,
}

impl Server {
    fn new(configure: impl Fn(&Connection) + Send + Sync + 'static) -> Self {
        let registration = registration();
        let config = configuration(&registration, Settings::default(), CredentialFlags::NONE);
        let (tx, accepted) = mpsc::unbounded_channel();
        let listener = Listener::new(&registration, move |info, incoming| {
            assert_eq!(info.server_name, "localhost");
            let conn = incoming.accept(&config)?;
            configure(&conn);
            let _ = tx.send(conn.clone());
            Ok(conn)
        })
        .unwrap();
        listener.start(&[ALPN], None).unwrap();
        let port = listener.local_address().unwrap().port();
        Self {
            listener,
            port,
            accepted,
        }
    }

    /// Echo everything received on each peer stream back on the same stream
    fn echo() -> Self {
        Self::new(|conn| {
            conn.on_peer_stream(|stream| {
                async move {
                    let data = stream.receive().unwrap().read_to_end(usize::MAX).await.unwrap();
                    stream.send(data, SendFlags::FIN).await.unwrap();
                }
                .instrument(info_span!("echo"))
            })
        })
    }
}

async fn connect(port: u16) -> Connection {
    let registration = registration();
    let config = client_configuration(&registration);
    let conn = Connection::new(&registration).unwrap();
    conn.start(&config, "localhost", port).await.unwrap();
    conn
}

async fn echo_on(conn: &Connection, data: Vec<u8>) -> (Stream, Bytes) {
    let stream = conn.open_stream(StreamOpenFlags::NONE).unwrap();
    stream.start(StreamStartFlags::NONE).await.unwrap();
    let recv = stream.receive().unwrap();
    stream.send(data, SendFlags::FIN).await.unwrap();
    let echoed = recv.read_to_end(usize::MAX).await.unwrap();
    (stream, echoed)
}

#[test]
fn echo() {
    let _guard = subscribe();
    let runtime = rt_threaded();
    runtime.block_on(async {
        let mut server = Server::echo();
        let conn = connect(server.port).await;
        assert_eq!(conn.negotiated_alpn(), Some(Bytes::from_static(ALPN)));
        let server_conn = server.accepted.recv().await.unwrap();
        assert_eq!(server_conn.state(), ConnectionState::Connected);
        assert_eq!(server_conn.remote_address(), conn.local_address());
        assert_eq!(server_conn.local_address(), conn.remote_address());

        let (stream, echoed) = echo_on(&conn, b"Hello".to_vec()).await;
        assert_eq!(&echoed[..], b"Hello");
        wait_until(|| stream.state() == StreamState::Closed).await;

        conn.shutdown(0).await.unwrap();
        wait_until(|| server_conn.state() == ConnectionState::Closed).await;
    });
}

#[tokio::test]
async fn echo_many_streams() {
    let _guard = subscribe();
    let server = Server::echo();
    let conn = connect(server.port).await;

    let mut tasks = Vec::new();
    for seed in 0..8 {
        let conn = conn.clone();
        tasks.push(tokio::spawn(async move {
            let data = gen_data(16 * 1024 + seed as usize, seed);
            let (_, echoed) = echo_on(&conn, data.clone()).await;
            assert_eq!(&echoed[..], &data[..]);
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    conn.shutdown(0).await.unwrap();
}

#[tokio::test]
async fn unidirectional_stream() {
    let _guard = subscribe();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let server = Server::new(move |conn| {
        let tx = tx.clone();
        conn.on_peer_stream(move |stream| {
            let tx = tx.clone();
            async move {
                let data = stream.receive().unwrap().read_to_end(1024).await;
                let _ = tx.send((stream.id(), data));
            }
        })
    });
    let conn = connect(server.port).await;

    let stream = conn.open_stream(StreamOpenFlags::UNIDIRECTIONAL).unwrap();
    stream.start(StreamStartFlags::NONE).await.unwrap();
    stream.send("one way", SendFlags::FIN).await.unwrap();
    let (id, data) = rx.recv().await.unwrap();
    assert_eq!(id, stream.id());
    assert_eq!(data, Ok(Bytes::from_static(b"one way")));
    wait_until(|| stream.state() == StreamState::Closed).await;
}

#[tokio::test]
async fn abort_reaches_peer() {
    let _guard = subscribe();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let server = Server::new(move |conn| {
        let tx = tx.clone();
        conn.on_peer_stream(move |stream| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(stream.receive().unwrap().read_to_end(1024).await);
            }
        })
    });
    let conn = connect(server.port).await;

    let stream = conn.open_stream(StreamOpenFlags::NONE).unwrap();
    stream.start(StreamStartFlags::NONE).await.unwrap();
    stream.send("partial", SendFlags::NONE).await.unwrap();
    stream.shutdown(StreamShutdownFlags::ABORT, 7).await.unwrap();
    assert_eq!(stream.state(), StreamState::Closed);
    assert_eq!(
        rx.recv().await.unwrap(),
        Err(ReadToEndError::Read(Error::Aborted))
    );
}

#[tokio::test]
async fn refused() {
    let _guard = subscribe();
    let registration = registration();
    let listener = Listener::new(&registration, |_, _| Err(Error::ConnectionRefused)).unwrap();
    listener.start(&[ALPN], None).unwrap();
    let port = listener.local_address().unwrap().port();

    let config = client_configuration(&registration);
    let conn = Connection::new(&registration).unwrap();
    assert_eq!(
        conn.start(&config, "localhost", port).await,
        Err(Error::ConnectionRefused)
    );
    let sim = sim();
    sim.flush();
    assert_eq!(conn.state(), ConnectionState::Closed);
    // The unaccepted server side was closed by the binding
    let server = sim.peer(conn.handle()).unwrap();
    assert_eq!(sim.closes(server), 1);
}

#[tokio::test]
async fn alpn_mismatch() {
    let _guard = subscribe();
    let server = Server::echo();
    let registration = registration();
    let config = Configuration::new(&registration, &[b"other"], Settings::default()).unwrap();
    config
        .load_credential(&Credential::None, CredentialFlags::CLIENT)
        .unwrap();
    let conn = Connection::new(&registration).unwrap();
    assert_eq!(
        conn.start(&config, "localhost", server.port).await,
        Err(Error::HandshakeFailure)
    );
}

#[tokio::test]
async fn datagrams() {
    let _guard = subscribe();
    let mut server = Server::echo();
    let conn = connect(server.port).await;
    let server_conn = server.accepted.recv().await.unwrap();
    let mut received = server_conn.datagrams().unwrap();

    conn.send_datagram("ping", SendFlags::NONE).await.unwrap();
    conn.send_datagram(Bytes::from_static(b"pong"), SendFlags::DGRAM_PRIORITY)
        .await
        .unwrap();
    assert_eq!(received.next().await, Some(Bytes::from_static(b"ping")));
    assert_eq!(received.next().await, Some(Bytes::from_static(b"pong")));

    conn.shutdown(0).await.unwrap();
    assert_eq!(received.next().await, None);
}

fn certificate_client(registration: &crate::Registration) -> Configuration {
    let flags = CredentialFlags::CLIENT
        | CredentialFlags::INDICATE_CERTIFICATE_RECEIVED
        | CredentialFlags::DEFER_CERTIFICATE_VALIDATION;
    configuration(registration, Settings::default(), flags)
}

#[tokio::test]
async fn certificate_validator() {
    let _guard = subscribe();
    let server = Server::echo();
    let registration = registration();
    let config = certificate_client(&registration);
    let untrusted = Error::CertificateError(CertificateErrorKind::UntrustedRoot);

    // Accepting overrides the engine's verdict
    let seen = Arc::new(Mutex::new(Vec::new()));
    let conn = Connection::new(&registration).unwrap();
    conn.on_peer_certificate({
        let seen = seen.clone();
        move |der, deferred| {
            seen.lock().unwrap().push((der.to_vec(), deferred));
            Ok(())
        }
    });
    conn.start(&config, "localhost", server.port).await.unwrap();
    assert_eq!(*seen.lock().unwrap(), [(CERTIFICATE.to_vec(), Some(untrusted))]);

    // Rejecting fails the handshake with the validator's error
    let conn = Connection::new(&registration).unwrap();
    conn.on_peer_certificate(|_, deferred| match deferred {
        Some(e) => Err(e),
        None => Ok(()),
    });
    assert_eq!(
        conn.start(&config, "localhost", server.port).await,
        Err(untrusted)
    );

    // Without a validator the engine's verdict stands
    let conn = Connection::new(&registration).unwrap();
    assert_eq!(
        conn.start(&config, "localhost", server.port).await,
        Err(untrusted)
    );
}

#[tokio::test]
async fn resumption() {
    let _guard = subscribe();
    let mut server = Server::echo();
    let conn = connect(server.port).await;
    let server_conn = server.accepted.recv().await.unwrap();
    assert_eq!(
        conn.send_resumption_ticket(ResumptionTicketFlags::NONE, b"app"),
        Err(Error::InvalidState)
    );
    server_conn
        .send_resumption_ticket(ResumptionTicketFlags::FINAL, b"app")
        .unwrap();
    assert!(sim().calls(server_conn.handle()).contains(&Call::ResumptionTicket {
        flags: ResumptionTicketFlags::FINAL.bits(),
        data: b"app".to_vec(),
    }));
    wait_until(|| conn.resumption_ticket().is_some()).await;
    let ticket = conn.resumption_ticket().unwrap();
    assert_eq!(&ticket[..], b"ticket:app");

    let registration = registration();
    let config = client_configuration(&registration);
    let resumed = Connection::new(&registration).unwrap();
    resumed.set_resumption_ticket(&ticket).unwrap();
    let session_resumed = Arc::new(Mutex::new(None));
    resumed.on_event({
        let session_resumed = session_resumed.clone();
        move |event| {
            if let ConnectionEvent::Connected {
                session_resumed: resumed,
                ..
            } = event
            {
                *session_resumed.lock().unwrap() = Some(*resumed);
            }
            Ok(())
        }
    });
    resumed.start(&config, "localhost", server.port).await.unwrap();
    assert_eq!(*session_resumed.lock().unwrap(), Some(true));
}

#[tokio::test]
async fn listener_lifecycle() {
    let _guard = subscribe();
    let server = Server::echo();
    let sim = sim();
    assert!(server.listener.is_valid());
    assert_eq!(server.listener.start(&[ALPN], None), Err(Error::InvalidState));
    assert_eq!(
        server.listener.start(&[b""], None),
        Err(Error::InvalidParameter)
    );

    server.listener.stop().await.unwrap();
    let calls = sim.calls(server.listener.handle());
    assert_eq!(calls, [Call::ListenerStop]);
    // Stopping again does nothing
    server.listener.stop().await.unwrap();

    let registration = registration();
    let config = client_configuration(&registration);
    let conn = Connection::new(&registration).unwrap();
    assert_eq!(
        conn.start(&config, "localhost", server.port).await,
        Err(Error::Unreachable)
    );

    // Restart on the same port
    let addr = (std::net::Ipv4Addr::LOCALHOST, server.port).into();
    server.listener.start(&[ALPN], Some(addr)).unwrap();
    let conn = connect(server.port).await;
    let (_, echoed) = echo_on(&conn, b"again".to_vec()).await;
    assert_eq!(&echoed[..], b"again");

    let h = server.listener.handle();
    drop(server);
    sim.flush();
    assert_eq!(sim.closes(h), 1);
}

#[tokio::test]
async fn dropped_client_closes_server() {
    let _guard = subscribe();
    let mut server = Server::echo();
    let conn = connect(server.port).await;
    let server_conn = server.accepted.recv().await.unwrap();
    drop(conn);
    wait_until(|| server_conn.state() == ConnectionState::Closed).await;
}

#[tokio::test]
async fn acceptor_hands_connection_over() {
    let _guard = subscribe();
    let registration = registration();
    let config = configuration(&registration, Settings::default(), CredentialFlags::NONE);
    let listener = Listener::new(&registration, move |_, incoming| {
        let conn = incoming.accept(&config)?;
        conn.on_peer_stream(|stream| async move {
            let data = stream.receive().unwrap().read_to_end(1024).await.unwrap();
            stream.send(data, SendFlags::FIN).await.unwrap();
        });
        Ok(conn)
    })
    .unwrap();
    listener.start(&[ALPN], None).unwrap();
    let conn = connect(listener.local_address().unwrap().port()).await;

    let sim = sim();
    sim.flush();
    assert_eq!(conn.state(), ConnectionState::Connected);
    let server = sim.peer(conn.handle()).unwrap();
    assert_eq!(sim.closes(server), 0);

    let (_, echoed) = echo_on(&conn, b"Hello".to_vec()).await;
    assert_eq!(&echoed[..], b"Hello");

    // Released once the connection closes
    conn.shutdown(0).await.unwrap();
    sim.flush();
    assert_eq!(sim.closes(server), 1);
}
