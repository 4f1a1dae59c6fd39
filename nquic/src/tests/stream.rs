use bytes::Bytes;
use tokio::sync::mpsc;

use super::{manual_connection, manual_stream, subscribe, unbuffered, wait_until};
use crate::{
    Error, SendFlags, SendWindowOptions, Settings, Status, StreamOpenFlags, StreamShutdownFlags,
    StreamStartFlags, StreamState,
};

#[tokio::test]
async fn start_twice() {
    let _guard = subscribe();
    let (conn, sim) = manual_connection(Settings::default()).await;
    let stream = conn.open_stream(StreamOpenFlags::NONE).unwrap();
    assert_eq!(stream.state(), StreamState::Idle);
    assert!(stream.is_valid());
    assert_eq!(
        stream.shutdown(StreamShutdownFlags::GRACEFUL, 0).await,
        Err(Error::InvalidState)
    );

    stream.start(StreamStartFlags::NONE).await.unwrap();
    assert_eq!(stream.state(), StreamState::Open);
    assert_eq!(stream.start(StreamStartFlags::NONE).await, Err(Error::InvalidState));
    assert_eq!(sim.calls(stream.handle()).len(), 1);
    assert_eq!(stream.id(), Ok(0));
}

#[tokio::test]
async fn stream_ids() {
    let _guard = subscribe();
    let (conn, _) = manual_connection(Settings::default()).await;
    let bidi = manual_stream(&conn).await;
    let uni = conn.open_stream(StreamOpenFlags::UNIDIRECTIONAL).unwrap();
    uni.start(StreamStartFlags::IMMEDIATE).await.unwrap();
    let second = manual_stream(&conn).await;
    assert_eq!(bidi.id(), Ok(0));
    assert_eq!(uni.id(), Ok(2));
    assert_eq!(second.id(), Ok(4));
}

#[tokio::test]
async fn start_failure() {
    let _guard = subscribe();
    let (conn, sim) = manual_connection(Settings::default()).await;

    let stream = conn.open_stream(StreamOpenFlags::NONE).unwrap();
    sim.fail_next(stream.handle(), "stream_start", Status::OUT_OF_MEMORY);
    assert_eq!(stream.start(StreamStartFlags::NONE).await, Err(Error::OutOfMemory));
    assert_eq!(stream.state(), StreamState::Closed);

    let stream = conn.open_stream(StreamOpenFlags::NONE).unwrap();
    let mut recv = stream.receive().unwrap();
    sim.fail_next_start(conn.handle(), Status::STREAM_LIMIT_REACHED);
    assert_eq!(
        stream.start(StreamStartFlags::FAIL_BLOCKED).await,
        Err(Error::StreamLimitReached)
    );
    assert_eq!(stream.state(), StreamState::Closed);
    assert_eq!(recv.next().await, Some(Err(Error::StreamLimitReached)));
    assert_eq!(recv.next().await, None);
}

#[tokio::test]
async fn priority() {
    let _guard = subscribe();
    let (conn, _) = manual_connection(Settings::default()).await;
    let stream = manual_stream(&conn).await;
    stream.set_priority(7).unwrap();
    assert_eq!(stream.priority(), Ok(7));
}

#[tokio::test]
async fn concurrent_sends() {
    let _guard = subscribe();
    let (conn, sim) = manual_connection(Settings::default()).await;
    let stream = manual_stream(&conn).await;
    let h = stream.handle();

    let (a, b, c, ()) = tokio::join!(
        stream.send("a", SendFlags::NONE),
        stream.send("b", SendFlags::NONE),
        stream.send("c", SendFlags::NONE),
        async {
            wait_until(|| sim.in_flight(h).0 == 3).await;
            sim.complete_sends(h, 1, true);
            sim.complete_sends(h, 2, false);
        }
    );

    // The engine completes sends in submission order
    let sends = sim.sends(h);
    assert_eq!(sends.len(), 3);
    let canceled = sends[0].0.clone();
    for (name, result) in [(b"a", a), (b"b", b), (b"c", c)] {
        match name[..] == canceled[..] {
            true => assert_eq!(result, Err(Error::Aborted)),
            false => assert_eq!(result, Ok(())),
        }
    }
    assert_eq!(sim.in_flight(h), (0, 0));
}

#[tokio::test]
async fn send_after_fin() {
    let _guard = subscribe();
    let (conn, sim) = manual_connection(Settings::default()).await;
    let stream = manual_stream(&conn).await;
    let h = stream.handle();

    let (first, ()) = tokio::join!(stream.send("last", SendFlags::FIN), async {
        wait_until(|| sim.in_flight(h).0 == 1).await;
        sim.complete_sends(h, 1, false);
    });
    first.unwrap();
    assert_eq!(stream.send("more", SendFlags::NONE).await, Err(Error::InvalidState));
}

#[tokio::test]
async fn send_failure() {
    let _guard = subscribe();
    let (conn, sim) = manual_connection(Settings::default()).await;
    let stream = manual_stream(&conn).await;
    sim.fail_next(stream.handle(), "stream_send", Status::OUT_OF_MEMORY);
    assert_eq!(stream.send("x", SendFlags::FIN).await, Err(Error::OutOfMemory));
    // A failed terminal send leaves the stream sendable
    let (result, ()) = tokio::join!(stream.send("y", SendFlags::FIN), async {
        wait_until(|| sim.in_flight(stream.handle()).0 == 1).await;
        sim.complete_sends(stream.handle(), 1, false);
    });
    result.unwrap();
}

#[tokio::test]
async fn windowed_send_bounds_in_flight() {
    let _guard = subscribe();
    let (conn, sim) = manual_connection(unbuffered(100)).await;
    let stream = manual_stream(&conn).await;
    let h = stream.handle();

    let chunks = (0..4u8).map(|i| Bytes::from(vec![i; 40])).collect::<Vec<_>>();
    let task = tokio::spawn({
        let stream = stream.clone();
        async move {
            stream
                .send_chunks(chunks, SendFlags::FIN, SendWindowOptions::default())
                .await
        }
    });

    wait_until(|| sim.in_flight(h).0 == 2).await;
    assert_eq!(sim.in_flight(h), (2, 80));
    sim.complete_sends(h, 1, false);
    sim.flush();
    assert_eq!(sim.in_flight(h), (2, 80));
    sim.complete_sends(h, 2, false);
    sim.flush();
    assert_eq!(sim.in_flight(h), (1, 40));
    assert!(!task.is_finished());
    sim.complete_sends(h, 1, false);
    task.await.unwrap().unwrap();

    let sends = sim.sends(h);
    assert_eq!(sends.len(), 4);
    for (i, (data, flags)) in sends.iter().enumerate() {
        assert_eq!(data, &vec![i as u8; 40]);
        match i {
            3 => assert_eq!(*flags, SendFlags::FIN),
            _ => assert_eq!(*flags, SendFlags::NONE),
        }
    }
}

#[tokio::test]
async fn oversized_chunk_goes_alone() {
    let _guard = subscribe();
    let (conn, sim) = manual_connection(unbuffered(100)).await;
    let stream = manual_stream(&conn).await;
    let h = stream.handle();

    let chunks = vec![Bytes::from(vec![0; 250]), Bytes::from(vec![1; 10])];
    let task = tokio::spawn({
        let stream = stream.clone();
        async move {
            stream
                .send_chunks(chunks, SendFlags::NONE, SendWindowOptions::default())
                .await
        }
    });
    wait_until(|| sim.in_flight(h).0 == 1).await;
    sim.flush();
    assert_eq!(sim.in_flight(h), (1, 250));
    sim.complete_sends(h, 1, false);
    sim.flush();
    assert_eq!(sim.in_flight(h), (1, 10));
    sim.complete_sends(h, 1, false);
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn ideal_send_buffer_widens_window() {
    let _guard = subscribe();
    let (conn, sim) = manual_connection(unbuffered(10)).await;
    let stream = manual_stream(&conn).await;
    let h = stream.handle();

    let chunks = (0..4).map(|_| Bytes::from_static(&[7; 10])).collect::<Vec<_>>();
    let task = tokio::spawn({
        let stream = stream.clone();
        async move {
            stream
                .send_chunks(chunks, SendFlags::NONE, SendWindowOptions::default())
                .await
        }
    });
    wait_until(|| sim.in_flight(h).0 == 1).await;
    sim.ideal_send_buffer(h, 40);
    sim.flush();
    assert_eq!(stream.ideal_send_buffer_size(), 40);
    assert_eq!(sim.in_flight(h), (4, 40));
    sim.complete_sends(h, 4, false);
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn bootstrap_override() {
    let _guard = subscribe();
    let (conn, sim) = manual_connection(unbuffered(10)).await;
    let stream = manual_stream(&conn).await;
    let h = stream.handle();

    let chunks = (0..3).map(|_| Bytes::from_static(&[1; 10])).collect::<Vec<_>>();
    let options = SendWindowOptions {
        bootstrap_window: Some(30),
    };
    let task = tokio::spawn({
        let stream = stream.clone();
        async move { stream.send_chunks(chunks, SendFlags::NONE, options).await }
    });
    wait_until(|| sim.in_flight(h).0 == 3).await;
    sim.complete_sends(h, 3, false);
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn windowed_send_requires_unbuffered() {
    let _guard = subscribe();
    let (conn, _) = manual_connection(Settings::default()).await;
    let stream = manual_stream(&conn).await;
    let result = stream
        .send_chunks(vec![Bytes::from_static(b"x")], SendFlags::NONE, SendWindowOptions::default())
        .await;
    assert_eq!(result, Err(Error::InvalidState));
    assert_eq!(stream.enqueue("x"), Err(Error::InvalidState));
}

#[tokio::test]
async fn empty_batches() {
    let _guard = subscribe();
    let (conn, sim) = manual_connection(unbuffered(100)).await;
    let stream = manual_stream(&conn).await;
    let h = stream.handle();

    stream
        .send_chunks(Vec::<Bytes>::new(), SendFlags::NONE, SendWindowOptions::default())
        .await
        .unwrap();
    assert!(sim.sends(h).is_empty());

    let (result, ()) = tokio::join!(
        stream.send_chunks(Vec::<Bytes>::new(), SendFlags::FIN, SendWindowOptions::default()),
        async {
            wait_until(|| sim.in_flight(h).0 == 1).await;
            sim.complete_sends(h, 1, false);
        }
    );
    result.unwrap();
    assert_eq!(sim.sends(h), vec![(Vec::new(), SendFlags::FIN)]);
}

#[tokio::test]
async fn canceled_chunk_fails_batch() {
    let _guard = subscribe();
    let (conn, sim) = manual_connection(unbuffered(20)).await;
    let stream = manual_stream(&conn).await;
    let h = stream.handle();

    let chunks = (0..4).map(|_| Bytes::from_static(&[3; 10])).collect::<Vec<_>>();
    let (result, ()) = tokio::join!(
        stream.send_chunks(chunks, SendFlags::FIN, SendWindowOptions::default()),
        async {
            wait_until(|| sim.in_flight(h).0 == 2).await;
            sim.complete_sends(h, 1, true);
            sim.flush();
            sim.complete_sends(h, 1, false);
        }
    );
    assert_eq!(result, Err(Error::Aborted));
    // Nothing is submitted after the failure
    assert_eq!(sim.sends(h).len(), 2);
}

#[tokio::test]
async fn enqueue_then_drain() {
    let _guard = subscribe();
    let (conn, sim) = manual_connection(unbuffered(100)).await;
    let stream = manual_stream(&conn).await;
    let h = stream.handle();

    for i in 0..3u8 {
        stream.enqueue(vec![i; 50]).unwrap();
    }
    sim.flush();
    assert!(sim.sends(h).is_empty());
    // Four windows at most
    assert_eq!(stream.enqueue(vec![0; 251]), Err(Error::InvalidParameter));

    let (result, ()) = tokio::join!(stream.drain(SendFlags::FIN), async {
        wait_until(|| sim.in_flight(h).0 == 2).await;
        assert_eq!(sim.in_flight(h), (2, 100));
        sim.complete_sends(h, 3, false);
    });
    result.unwrap();

    let flags = sim.sends(h).into_iter().map(|(_, flags)| flags).collect::<Vec<_>>();
    assert_eq!(flags, [SendFlags::NONE, SendFlags::NONE, SendFlags::FIN]);
    assert_eq!(stream.enqueue("late"), Err(Error::InvalidState));
    assert_eq!(stream.drain(SendFlags::NONE).await, Err(Error::InvalidState));
}

#[tokio::test]
async fn enqueue_while_draining() {
    let _guard = subscribe();
    let (conn, sim) = manual_connection(unbuffered(100)).await;
    let stream = manual_stream(&conn).await;
    let h = stream.handle();

    stream.enqueue("first").unwrap();
    let (result, ()) = tokio::join!(stream.drain(SendFlags::NONE), async {
        wait_until(|| sim.in_flight(h).0 == 1).await;
        stream.enqueue("second").unwrap();
        sim.flush();
        assert_eq!(sim.in_flight(h).0, 2);
        sim.complete_sends(h, 2, false);
    });
    result.unwrap();
    let data = sim.sends(h).into_iter().map(|(data, _)| data).collect::<Vec<_>>();
    assert_eq!(data, [b"first".to_vec(), b"second".to_vec()]);
}

#[tokio::test]
async fn receive_until_peer_finishes() {
    let _guard = subscribe();
    let (conn, sim) = manual_connection(Settings::default()).await;
    let stream = manual_stream(&conn).await;
    let h = stream.handle();
    let mut recv = stream.receive().unwrap();
    assert_eq!(stream.receive().err(), Some(Error::InvalidState));

    sim.receive(h, &[b"ab", b"cd"], false);
    sim.receive(h, &[b"ef"], false);
    sim.peer_send_shutdown(h);
    assert_eq!(recv.next().await, Some(Ok(Bytes::from_static(b"abcd"))));
    assert_eq!(recv.next().await, Some(Ok(Bytes::from_static(b"ef"))));
    assert_eq!(recv.next().await, None);
    assert_eq!(recv.next().await, None);

    sim.flush();
    let calls = sim.calls(h);
    assert!(calls.contains(&super::sim::Call::ReceiveComplete(4)));
    assert!(calls.contains(&super::sim::Call::ReceiveComplete(2)));
}

#[tokio::test]
async fn receive_fin_with_data() {
    let _guard = subscribe();
    let (conn, sim) = manual_connection(Settings::default()).await;
    let stream = manual_stream(&conn).await;
    let data = super::gen_data(4096, 3);

    sim.receive(stream.handle(), &[&data[..1000], &data[1000..]], true);
    let received = stream.receive().unwrap().read_to_end(usize::MAX).await.unwrap();
    assert_eq!(&received[..], &data[..]);
}

#[tokio::test]
async fn receive_aborted_by_peer() {
    let _guard = subscribe();
    let (conn, sim) = manual_connection(Settings::default()).await;
    let stream = manual_stream(&conn).await;
    let mut recv = stream.receive().unwrap();

    sim.receive(stream.handle(), &[b"partial"], false);
    sim.peer_send_aborted(stream.handle(), 9);
    assert_eq!(recv.next().await, Some(Ok(Bytes::from_static(b"partial"))));
    assert_eq!(recv.next().await, Some(Err(Error::Aborted)));
    assert_eq!(recv.next().await, None);
}

#[tokio::test]
async fn shutdown_failure_restores_state() {
    let _guard = subscribe();
    let (conn, sim) = manual_connection(Settings::default()).await;
    let stream = manual_stream(&conn).await;

    sim.fail_next(stream.handle(), "stream_shutdown", Status::INVALID_PARAMETER);
    assert_eq!(
        stream.shutdown(StreamShutdownFlags::GRACEFUL, 0).await,
        Err(Error::InvalidParameter)
    );
    assert_eq!(stream.state(), StreamState::Open);

    stream.shutdown(StreamShutdownFlags::ABORT, 5).await.unwrap();
    assert_eq!(stream.state(), StreamState::Closed);
    // Already closed
    stream.shutdown(StreamShutdownFlags::GRACEFUL, 0).await.unwrap();
    let shutdowns = sim
        .calls(stream.handle())
        .into_iter()
        .filter(|c| matches!(c, super::sim::Call::StreamShutdown { .. }))
        .count();
    assert_eq!(shutdowns, 1);
}

#[tokio::test]
async fn shutdown_complete_aborts_pending() {
    let _guard = subscribe();
    let (conn, sim) = manual_connection(Settings::default()).await;
    let stream = manual_stream(&conn).await;
    let h = stream.handle();
    let mut recv = stream.receive().unwrap();

    let (result, ()) = tokio::join!(stream.send("pending", SendFlags::NONE), async {
        wait_until(|| sim.in_flight(h).0 == 1).await;
        sim.stream_shutdown_complete(h);
    });
    assert_eq!(result, Err(Error::Aborted));
    assert_eq!(stream.state(), StreamState::Closed);
    assert_eq!(recv.next().await, Some(Err(Error::Aborted)));
    assert_eq!(recv.next().await, None);
    assert_eq!(stream.send("late", SendFlags::NONE).await, Err(Error::InvalidState));
}

#[tokio::test]
async fn dropped_stream_closes_once() {
    let _guard = subscribe();
    let (conn, sim) = manual_connection(Settings::default()).await;
    let stream = manual_stream(&conn).await;
    let h = stream.handle();

    // Still retained for the engine until shutdown completes
    drop(stream.clone());
    drop(stream);
    sim.flush();
    assert_eq!(sim.closes(h), 0);

    sim.stream_shutdown_complete(h);
    sim.flush();
    assert_eq!(sim.closes(h), 1);
}

#[tokio::test]
async fn idle_stream_closes_on_drop() {
    let _guard = subscribe();
    let (conn, sim) = manual_connection(Settings::default()).await;
    let stream = conn.open_stream(StreamOpenFlags::NONE).unwrap();
    let h = stream.handle();
    drop(stream);
    assert_eq!(sim.closes(h), 1);
}

#[tokio::test]
async fn peer_streams() {
    let _guard = subscribe();
    let (conn, sim) = manual_connection(Settings::default()).await;

    // Without a handler the stream is refused
    let refused = sim.peer_stream(conn.handle(), StreamOpenFlags::NONE);
    sim.flush();
    assert_eq!(sim.closes(refused), 1);

    let (tx, mut rx) = mpsc::unbounded_channel();
    conn.on_peer_stream(move |stream| {
        let tx = tx.clone();
        async move {
            let data = stream.receive().unwrap().read_to_end(64).await.unwrap();
            let _ = tx.send((stream.state(), data));
        }
    });
    let h = sim.peer_stream(conn.handle(), StreamOpenFlags::UNIDIRECTIONAL);
    sim.receive(h, &[b"from peer"], true);
    let (state, data) = rx.recv().await.unwrap();
    assert_eq!(state, StreamState::Open);
    assert_eq!(&data[..], b"from peer");
    assert_eq!(sim.closes(h), 0);
}

#[tokio::test]
async fn windowed_and_ordinary_sends_exclude_each_other() {
    let _guard = subscribe();
    let (conn, sim) = manual_connection(unbuffered(100)).await;
    let stream = manual_stream(&conn).await;
    let h = stream.handle();
    let one = || vec![Bytes::from_static(b"x")];

    // An ordinary send in flight keeps every windowed entry point out
    let plain = tokio::spawn({
        let stream = stream.clone();
        async move { stream.send("plain", SendFlags::NONE).await }
    });
    wait_until(|| sim.in_flight(h).0 == 1).await;
    assert_eq!(
        stream
            .send_chunks(one(), SendFlags::NONE, SendWindowOptions::default())
            .await,
        Err(Error::InvalidState)
    );
    assert_eq!(stream.enqueue("x"), Err(Error::InvalidState));
    assert_eq!(stream.drain(SendFlags::FIN).await, Err(Error::InvalidState));
    sim.complete_sends(h, 1, false);
    plain.await.unwrap().unwrap();

    // A windowed batch in flight keeps out ordinary sends and other batches
    let chunks = (0..4u8).map(|i| Bytes::from(vec![i; 40])).collect::<Vec<_>>();
    let batch = tokio::spawn({
        let stream = stream.clone();
        async move {
            stream
                .send_chunks(chunks, SendFlags::FIN, SendWindowOptions::default())
                .await
        }
    });
    wait_until(|| sim.in_flight(h).0 == 2).await;
    assert_eq!(
        stream.send("x", SendFlags::NONE).await,
        Err(Error::InvalidState)
    );
    assert_eq!(
        stream
            .send_chunks(one(), SendFlags::NONE, SendWindowOptions::default())
            .await,
        Err(Error::InvalidState)
    );
    assert_eq!(stream.enqueue("x"), Err(Error::InvalidState));
    assert_eq!(stream.drain(SendFlags::NONE).await, Err(Error::InvalidState));

    // The rejected attempts left the batch untouched
    sim.complete_sends(h, 2, false);
    wait_until(|| sim.in_flight(h).0 == 2).await;
    sim.complete_sends(h, 2, false);
    batch.await.unwrap().unwrap();

    let sends = sim.sends(h);
    assert_eq!(sends.len(), 5);
    assert_eq!(sends[0], (b"plain".to_vec(), SendFlags::NONE));
    for (i, (data, flags)) in sends[1..].iter().enumerate() {
        assert_eq!(data, &vec![i as u8; 40]);
        match i {
            3 => assert_eq!(*flags, SendFlags::FIN),
            _ => assert_eq!(*flags, SendFlags::NONE),
        }
    }
}
