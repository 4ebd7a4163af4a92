use bytes::BytesMut;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

/// The duplex byte stream a connection runs over: plain TCP or TLS over
/// TCP. The connection itself treats both as opaque.
pub enum SocketPulseStream {
    Plain(TcpStream),
    Secure(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for SocketPulseStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            SocketPulseStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            SocketPulseStream::Secure(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for SocketPulseStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            SocketPulseStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            SocketPulseStream::Secure(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            SocketPulseStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            SocketPulseStream::Secure(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            SocketPulseStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            SocketPulseStream::Secure(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// Read wrapper that first serves bytes the handshake reader pulled past
/// the CRLF CRLF terminator. Servers may pack the first frame into the same
/// segment as the 101 headers, so those bytes logically belong to the
/// post-handshake stream.
pub struct PrefetchStream<S> {
    prefetched: BytesMut,
    inner: S,
}

impl<S> PrefetchStream<S> {
    pub fn new(prefetched: BytesMut, inner: S) -> Self {
        Self { prefetched, inner }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefetchStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.prefetched.is_empty() {
            let n = this.prefetched.len().min(buf.remaining());
            buf.put_slice(&this.prefetched.split_to(n));
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefetchStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
