use std::{
    future::poll_fn,
    pin::Pin,
    task::{ready, Context, Poll},
};

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::error::Error;

/// What a stream's receive direction delivers, in order
#[derive(Debug)]
pub(crate) enum ReceiveItem {
    Data(Bytes),
    /// The peer finished sending
    Finished,
    Aborted(Error),
}

pub(crate) fn channel() -> (ReceiveSender, Receive) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        ReceiveSender { tx: Some(tx) },
        Receive {
            rx,
            finished: false,
        },
    )
}

/// Producer half, owned by the stream and fed from engine callbacks
#[derive(Debug)]
pub(crate) struct ReceiveSender {
    tx: Option<mpsc::UnboundedSender<ReceiveItem>>,
}

impl ReceiveSender {
    /// Queue a payload; dropped silently once the sequence has ended or the reader is gone
    pub(crate) fn push(&self, data: Bytes) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(ReceiveItem::Data(data));
        }
    }

    /// End the sequence, with `Err` for an abort; later calls are no-ops
    pub(crate) fn finish(&mut self, result: Result<(), Error>) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(match result {
                Ok(()) => ReceiveItem::Finished,
                Err(e) => ReceiveItem::Aborted(e),
            });
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.tx.is_none()
    }
}

/// The data received on one stream
///
/// Yields each payload in the order the engine delivered it. Ends with `None` after the peer
/// finishes sending, or with one `Err` followed by `None` if the stream is aborted or shut down
/// first. Obtained once per stream from [`Stream::receive`](crate::Stream::receive).
#[derive(Debug)]
pub struct Receive {
    rx: mpsc::UnboundedReceiver<ReceiveItem>,
    finished: bool,
}

impl Receive {
    /// The next payload, or `None` once the sequence has ended
    pub async fn next(&mut self) -> Option<Result<Bytes, Error>> {
        poll_fn(|cx| self.poll_item(cx)).await
    }

    /// Read everything until the peer finishes, failing if more than `size_limit` bytes arrive
    pub async fn read_to_end(mut self, size_limit: usize) -> Result<Bytes, ReadToEndError> {
        let mut buf = BytesMut::new();
        while let Some(data) = self.next().await {
            let data = data?;
            if buf.len() + data.len() > size_limit {
                return Err(ReadToEndError::TooLong);
            }
            buf.extend_from_slice(&data);
        }
        Ok(buf.freeze())
    }

    fn poll_item(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<Bytes, Error>>> {
        if self.finished {
            return Poll::Ready(None);
        }
        let item = match ready!(self.rx.poll_recv(cx)) {
            Some(ReceiveItem::Data(data)) => return Poll::Ready(Some(Ok(data))),
            Some(ReceiveItem::Finished) => None,
            Some(ReceiveItem::Aborted(e)) => Some(Err(e)),
            // The stream went away without saying how
            None => Some(Err(Error::Aborted)),
        };
        self.finished = true;
        Poll::Ready(item)
    }
}

impl futures::Stream for Receive {
    type Item = Result<Bytes, Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().poll_item(cx)
    }
}

/// Errors from [`Receive::read_to_end`]
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReadToEndError {
    /// The stream ended with an error
    #[error("read error: {0}")]
    Read(#[from] Error),
    /// The stream is larger than the user-supplied limit
    #[error("stream too long")]
    TooLong,
}
