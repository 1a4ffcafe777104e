//! Logical streams multiplexed over a relay channel

use crate::channel::Shared;
use crate::{lock, RelayError};
use bytes::{Buf, Bytes};
use meshhub_proto::{Frame, StreamId};
use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::OwnedSemaphorePermit;
use tracing::trace;

struct StreamState {
    recv_buf: VecDeque<Bytes>,
    /// Credit the peer still holds for sending to us
    recv_window: u32,
    /// Bytes read by the application but not yet credited back
    consumed: u32,
    recv_fin: bool,
    /// Credit we hold for sending to the peer
    send_window: u32,
    send_fin: bool,
    error: Option<RelayError>,
    read_waker: Option<Waker>,
    write_waker: Option<Waker>,
}

/// State shared between a stream handle and the channel's reader task
pub(crate) struct StreamShared {
    id: StreamId,
    window: u32,
    state: Mutex<StreamState>,
}

impl StreamShared {
    pub(crate) fn new(id: StreamId, window: u32) -> Self {
        Self {
            id,
            window,
            state: Mutex::new(StreamState {
                recv_buf: VecDeque::new(),
                recv_window: window,
                consumed: 0,
                recv_fin: false,
                send_window: window,
                send_fin: false,
                error: None,
                read_waker: None,
                write_waker: None,
            }),
        }
    }

    pub(crate) fn push_data(&self, data: Bytes) -> Result<(), RelayError> {
        let mut st = lock(&self.state);
        if st.recv_fin {
            return Err(RelayError::ProtocolError(format!(
                "data after FIN on stream {}",
                self.id
            )));
        }
        if data.len() > st.recv_window as usize {
            return Err(RelayError::ProtocolError(format!(
                "stream {} exceeded its receive window",
                self.id
            )));
        }
        st.recv_window -= data.len() as u32;
        st.recv_buf.push_back(data);
        if let Some(waker) = st.read_waker.take() {
            waker.wake();
        }
        Ok(())
    }

    pub(crate) fn recv_fin(&self) {
        let mut st = lock(&self.state);
        st.recv_fin = true;
        if let Some(waker) = st.read_waker.take() {
            waker.wake();
        }
    }

    pub(crate) fn grant(&self, credit: u32) {
        let mut st = lock(&self.state);
        st.send_window = st.send_window.saturating_add(credit);
        if let Some(waker) = st.write_waker.take() {
            waker.wake();
        }
    }

    pub(crate) fn abort(&self, error: RelayError) {
        let mut st = lock(&self.state);
        if st.error.is_none() {
            st.error = Some(error);
        }
        if let Some(waker) = st.read_waker.take() {
            waker.wake();
        }
        if let Some(waker) = st.write_waker.take() {
            waker.wake();
        }
    }
}

/// One logical stream of a relay channel.
///
/// Reads return EOF once the peer half-closed; writes wait for flow-control
/// credit. Dropping a stream that was not cleanly finished in both
/// directions resets it on the peer.
pub struct RelayStream {
    state: Arc<StreamShared>,
    channel: Arc<Shared>,
    _permit: OwnedSemaphorePermit,
}

impl RelayStream {
    pub(crate) fn new(
        state: Arc<StreamShared>,
        channel: Arc<Shared>,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        Self {
            state,
            channel,
            _permit: permit,
        }
    }

    pub fn id(&self) -> StreamId {
        self.state.id
    }
}

impl std::fmt::Debug for RelayStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayStream")
            .field("channel_id", &self.channel.channel_id())
            .field("stream_id", &self.state.id)
            .finish()
    }
}

impl AsyncRead for RelayStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let mut st = lock(&this.state.state);

        if let Some(mut chunk) = st.recv_buf.pop_front() {
            let n = chunk.len().min(buf.remaining());
            buf.put_slice(&chunk[..n]);
            chunk.advance(n);
            if !chunk.is_empty() {
                st.recv_buf.push_front(chunk);
            }

            st.consumed += n as u32;
            if !st.recv_fin && st.error.is_none() && st.consumed >= this.state.window / 2 {
                let credit = st.consumed;
                st.consumed = 0;
                st.recv_window += credit;
                drop(st);
                let _ = this
                    .channel
                    .send_frame(Frame::window_update(this.state.id, credit));
            }
            return Poll::Ready(Ok(()));
        }

        // A clean FIN wins over a later reset or channel teardown
        if st.recv_fin {
            return Poll::Ready(Ok(()));
        }
        if let Some(err) = &st.error {
            return Poll::Ready(Err(err.clone().into()));
        }

        st.read_waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl AsyncWrite for RelayStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let mut st = lock(&this.state.state);

        if let Some(err) = &st.error {
            return Poll::Ready(Err(err.clone().into()));
        }
        if st.send_fin {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "stream already shut down",
            )));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        if st.send_window == 0 {
            st.write_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }

        let n = buf
            .len()
            .min(st.send_window as usize)
            .min(this.channel.config.max_data_frame);
        st.send_window -= n as u32;
        drop(st);

        this.channel
            .send_frame(Frame::data(this.state.id, Bytes::copy_from_slice(&buf[..n])))?;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let st = lock(&self.state.state);
        match &st.error {
            Some(err) if !st.send_fin => Poll::Ready(Err(err.clone().into())),
            _ => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let mut st = lock(&this.state.state);
        if st.send_fin {
            return Poll::Ready(Ok(()));
        }
        if let Some(err) = &st.error {
            return Poll::Ready(Err(err.clone().into()));
        }
        st.send_fin = true;
        drop(st);

        this.channel.send_frame(Frame::fin(this.state.id))?;
        Poll::Ready(Ok(()))
    }
}

impl Drop for RelayStream {
    fn drop(&mut self) {
        let finished = {
            let st = lock(&self.state.state);
            st.error.is_some() || (st.send_fin && st.recv_fin)
        };
        self.channel.forget_stream(self.state.id);
        if !finished {
            trace!(
                channel_id = %self.channel.channel_id(),
                "Resetting unfinished stream {}",
                self.state.id
            );
            let _ = self.channel.send_frame(Frame::reset(self.state.id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_data_respects_window() {
        let stream = StreamShared::new(3, 8);
        stream.push_data(Bytes::from_static(b"12345")).unwrap();
        assert!(stream.push_data(Bytes::from_static(b"6789")).is_err());
        stream.push_data(Bytes::from_static(b"678")).unwrap();
    }

    #[test]
    fn test_data_after_fin_rejected() {
        let stream = StreamShared::new(3, 64);
        stream.recv_fin();
        assert!(stream.push_data(Bytes::from_static(b"late")).is_err());
    }

    #[test]
    fn test_first_abort_error_wins() {
        let stream = StreamShared::new(5, 64);
        stream.abort(RelayError::StreamReset);
        stream.abort(RelayError::PeerGone("gone".into()));
        let st = lock(&stream.state);
        assert_eq!(st.error, Some(RelayError::StreamReset));
    }
}
