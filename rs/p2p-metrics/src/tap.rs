use std::{
	io,
	pin::Pin,
	task::{ready, Context, Poll},
};

use bytes::{Bytes, BytesMut};
use futures::{Sink, Stream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::{Direction, Metrics};

/// Anything passing through a [Tracked] stream with a size in bytes.
pub trait Chunk {
	/// The number of bytes to record, or [None] if this isn't data (ex. an error).
	fn chunk_len(&self) -> Option<usize>;
}

impl Chunk for [u8] {
	fn chunk_len(&self) -> Option<usize> {
		Some(self.len())
	}
}

impl Chunk for Vec<u8> {
	fn chunk_len(&self) -> Option<usize> {
		Some(self.len())
	}
}

impl Chunk for Bytes {
	fn chunk_len(&self) -> Option<usize> {
		Some(self.len())
	}
}

impl Chunk for BytesMut {
	fn chunk_len(&self) -> Option<usize> {
		Some(self.len())
	}
}

impl<T: Chunk + ?Sized> Chunk for &T {
	fn chunk_len(&self) -> Option<usize> {
		(**self).chunk_len()
	}
}

impl<T: Chunk, E> Chunk for Result<T, E> {
	fn chunk_len(&self) -> Option<usize> {
		self.as_ref().ok().and_then(Chunk::chunk_len)
	}
}

/// A stream wrapper that reports the size of every chunk to [Metrics].
///
/// Chunks are forwarded untouched; nothing is buffered, so readiness and backpressure are those of the
/// inner stream. Reading (or [Stream]ing) records inbound data, writing (or [Sink]ing) records outbound data.
///
/// Created with [Metrics::track_stream].
pub struct Tracked<S> {
	inner: S,
	metrics: Metrics,
	peer: String,
	protocol: Option<String>,
}

impl<S> Tracked<S> {
	pub(crate) fn new(inner: S, metrics: Metrics, peer: String, protocol: Option<String>) -> Self {
		Self {
			inner,
			metrics,
			peer,
			protocol,
		}
	}

	/// The identity traffic is recorded under, possibly a placeholder.
	pub fn peer(&self) -> &str {
		&self.peer
	}

	pub fn protocol(&self) -> Option<&str> {
		self.protocol.as_deref()
	}

	pub fn get_ref(&self) -> &S {
		&self.inner
	}

	pub fn get_mut(&mut self) -> &mut S {
		&mut self.inner
	}

	pub fn into_inner(self) -> S {
		self.inner
	}

	fn record(&self, direction: Direction, length: usize) {
		let result = self
			.metrics
			.record(&self.peer, self.protocol.as_deref(), direction, length as u64);

		if let Err(err) = result {
			tracing::warn!(%err, peer = %self.peer, protocol = ?self.protocol, "failed to record chunk");
		}
	}
}

impl<S> Stream for Tracked<S>
where
	S: Stream + Unpin,
	S::Item: Chunk,
{
	type Item = S::Item;

	fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
		let this = self.get_mut();
		let item = ready!(Pin::new(&mut this.inner).poll_next(cx));

		if let Some(length) = item.as_ref().and_then(Chunk::chunk_len) {
			this.record(Direction::In, length);
		}

		Poll::Ready(item)
	}

	fn size_hint(&self) -> (usize, Option<usize>) {
		self.inner.size_hint()
	}
}

impl<S, T> Sink<T> for Tracked<S>
where
	S: Sink<T> + Unpin,
	T: Chunk,
{
	type Error = S::Error;

	fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
		Pin::new(&mut self.get_mut().inner).poll_ready(cx)
	}

	fn start_send(self: Pin<&mut Self>, item: T) -> Result<(), Self::Error> {
		let this = self.get_mut();
		let length = item.chunk_len();

		Pin::new(&mut this.inner).start_send(item)?;

		if let Some(length) = length {
			this.record(Direction::Out, length);
		}

		Ok(())
	}

	fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
		Pin::new(&mut self.get_mut().inner).poll_flush(cx)
	}

	fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
		Pin::new(&mut self.get_mut().inner).poll_close(cx)
	}
}

impl<S: AsyncRead + Unpin> AsyncRead for Tracked<S> {
	fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
		let this = self.get_mut();
		let before = buf.filled().len();

		ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;

		let read = buf.filled().len() - before;
		if read > 0 {
			this.record(Direction::In, read);
		}

		Poll::Ready(Ok(()))
	}
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Tracked<S> {
	fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
		let this = self.get_mut();
		let written = ready!(Pin::new(&mut this.inner).poll_write(cx, buf))?;

		if written > 0 {
			this.record(Direction::Out, written);
		}

		Poll::Ready(Ok(written))
	}

	fn poll_write_vectored(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		bufs: &[io::IoSlice<'_>],
	) -> Poll<io::Result<usize>> {
		let this = self.get_mut();
		let written = ready!(Pin::new(&mut this.inner).poll_write_vectored(cx, bufs))?;

		if written > 0 {
			this.record(Direction::Out, written);
		}

		Poll::Ready(Ok(written))
	}

	fn is_write_vectored(&self) -> bool {
		self.inner.is_write_vectored()
	}

	fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		Pin::new(&mut self.get_mut().inner).poll_flush(cx)
	}

	fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
	}
}
