//! Bidirectional byte relay.
//!
//! A relay runs two pumps, one per direction, each as its own task. When a
//! pump sees EOF it half-closes: the read side of its source and the write
//! side of its destination. The opposite pump keeps delivering whatever the
//! other peer still has to say. Connections that cannot half-close are fully
//! closed at that point instead.
//!
//! Both connections are closed once the relay returns: every half is owned by
//! a pump task and dropped when the task ends.

use std::io;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::buffer_pool::BufferPool;

/// A duplex connection the relay can pump bytes through.
pub trait Connection: Send + 'static {
    /// Read half produced by [`Connection::into_halves`].
    type Reader: AsyncRead + Send + Unpin + 'static;
    /// Write half produced by [`Connection::into_halves`].
    type Writer: AsyncWrite + Send + Unpin + 'static;

    /// Whether shutting down the write half leaves the read half usable.
    const HALF_CLOSE: bool = true;

    /// Split into independently owned read and write halves.
    fn into_halves(self) -> (Self::Reader, Self::Writer);

    /// Stop reading from the connection. Best effort.
    fn close_read(_reader: &Self::Reader) -> io::Result<()> {
        Ok(())
    }
}

impl Connection for TcpStream {
    type Reader = tokio::net::tcp::OwnedReadHalf;
    type Writer = tokio::net::tcp::OwnedWriteHalf;

    fn into_halves(self) -> (Self::Reader, Self::Writer) {
        self.into_split()
    }

    fn close_read(reader: &Self::Reader) -> io::Result<()> {
        socket2::SockRef::from(reader.as_ref()).shutdown(std::net::Shutdown::Read)
    }
}

#[cfg(unix)]
impl Connection for tokio::net::UnixStream {
    type Reader = tokio::net::unix::OwnedReadHalf;
    type Writer = tokio::net::unix::OwnedWriteHalf;

    fn into_halves(self) -> (Self::Reader, Self::Writer) {
        self.into_split()
    }

    fn close_read(reader: &Self::Reader) -> io::Result<()> {
        socket2::SockRef::from(reader.as_ref()).shutdown(std::net::Shutdown::Read)
    }
}

impl Connection for tokio::io::DuplexStream {
    type Reader = tokio::io::ReadHalf<tokio::io::DuplexStream>;
    type Writer = tokio::io::WriteHalf<tokio::io::DuplexStream>;

    fn into_halves(self) -> (Self::Reader, Self::Writer) {
        tokio::io::split(self)
    }
}

/// Bytes moved by a completed relay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Transferred {
    /// Bytes copied from source to destination.
    pub to_destination: u64,
    /// Bytes copied from destination to source.
    pub from_destination: u64,
}

/// Relays bytes between a source and a destination connection.
#[derive(Debug, Clone)]
pub struct Relay {
    pool: Arc<BufferPool>,
    cancel: CancellationToken,
}

impl Relay {
    /// Create a relay drawing copy buffers from `pool`.
    pub fn new(pool: Arc<BufferPool>) -> Self {
        Self {
            pool,
            cancel: CancellationToken::new(),
        }
    }

    /// Tie the relay to a parent scope. Cancelling `parent` closes both
    /// connections.
    pub fn with_cancellation(mut self, parent: &CancellationToken) -> Self {
        self.cancel = parent.child_token();
        self
    }

    /// Pump bytes in both directions until both are done.
    ///
    /// Returns the first error either pump hit. A failing pump cancels its
    /// sibling. Dropping the returned future also cancels both pumps.
    pub async fn run<S, D>(self, source: S, destination: D) -> io::Result<Transferred>
    where
        S: Connection,
        D: Connection,
    {
        let (src_read, src_write) = source.into_halves();
        let (dst_read, dst_write) = destination.into_halves();

        // Per-run scope: clones of one relay never cancel each other.
        let cancel = self.cancel.child_token();
        let _guard = cancel.clone().drop_guard();

        let upstream = tokio::spawn(pump::<S, D>(
            src_read,
            dst_write,
            Arc::clone(&self.pool),
            cancel.clone(),
        ));
        let downstream = tokio::spawn(pump::<D, S>(
            dst_read,
            src_write,
            Arc::clone(&self.pool),
            cancel.clone(),
        ));

        let (upstream, downstream) = tokio::join!(upstream, downstream);
        let upstream = upstream.map_err(io::Error::other).and_then(|r| r);
        let downstream = downstream.map_err(io::Error::other).and_then(|r| r);

        match (upstream, downstream) {
            (Err(e), _) | (_, Err(e)) => Err(e),
            (Ok(to_destination), Ok(from_destination)) => Ok(Transferred {
                to_destination,
                from_destination,
            }),
        }
    }
}

/// Copy `reader` into `writer` until EOF, error or cancellation, then
/// propagate the close.
async fn pump<R, W>(
    mut reader: R::Reader,
    mut writer: W::Writer,
    pool: Arc<BufferPool>,
    cancel: CancellationToken,
) -> io::Result<u64>
where
    R: Connection,
    W: Connection,
{
    let mut copied = 0u64;
    let result = {
        let mut buf = pool.get();
        tokio::select! {
            res = copy_with_buffer(&mut reader, &mut writer, &mut buf, &mut copied) => res,
            _ = cancel.cancelled() => Ok(()),
        }
    };

    if let Err(e) = R::close_read(&reader) {
        debug!(error = %e, "Close read failed");
    }

    if W::HALF_CLOSE {
        if let Err(e) = writer.shutdown().await {
            debug!(error = %e, "Close write failed");
        }
    } else {
        // No independent write shutdown: end the whole relay.
        cancel.cancel();
    }

    match result {
        Ok(()) => Ok(copied),
        Err(e) => {
            cancel.cancel();
            Err(e)
        }
    }
}

async fn copy_with_buffer<R, W>(
    reader: &mut R,
    writer: &mut W,
    buf: &mut [u8],
    copied: &mut u64,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let n = reader.read(buf).await?;
        if n == 0 {
            writer.flush().await?;
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        *copied += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, DuplexStream};

    /// A duplex stream that cannot shut down its write side on its own.
    struct NoHalfClose(DuplexStream);

    impl Connection for NoHalfClose {
        type Reader = tokio::io::ReadHalf<DuplexStream>;
        type Writer = tokio::io::WriteHalf<DuplexStream>;

        const HALF_CLOSE: bool = false;

        fn into_halves(self) -> (Self::Reader, Self::Writer) {
            tokio::io::split(self.0)
        }
    }

    fn pool() -> Arc<BufferPool> {
        Arc::new(BufferPool::with_capacity(1024, 8))
    }

    #[tokio::test]
    async fn test_relay_round_trip() {
        let (mut client, source) = duplex(4096);
        let (destination, mut backend) = duplex(4096);

        let relay = tokio::spawn(Relay::new(pool()).run(source, destination));

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        backend.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        backend.write_all(b"pong").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        client.shutdown().await.unwrap();
        backend.shutdown().await.unwrap();

        let transferred = relay.await.unwrap().unwrap();
        assert_eq!(
            transferred,
            Transferred {
                to_destination: 4,
                from_destination: 4
            }
        );
    }

    #[tokio::test]
    async fn test_half_close_keeps_other_direction_open() {
        let (mut client, source) = duplex(4096);
        let (destination, mut backend) = duplex(4096);

        let relay = tokio::spawn(Relay::new(pool()).run(source, destination));

        client.write_all(b"request").await.unwrap();
        client.shutdown().await.unwrap();

        let mut request = Vec::new();
        backend.read_to_end(&mut request).await.unwrap();
        assert_eq!(request, b"request");

        // Backend answers after seeing EOF.
        backend.write_all(b"late response").await.unwrap();
        backend.shutdown().await.unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, b"late response");

        relay.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_no_half_close_ends_relay_at_first_eof() {
        let (mut client, source) = duplex(4096);
        let (destination, mut backend) = duplex(4096);

        let relay = tokio::spawn(Relay::new(pool()).run(source, NoHalfClose(destination)));

        client.write_all(b"bye").await.unwrap();
        client.shutdown().await.unwrap();

        let transferred = relay.await.unwrap().unwrap();
        assert_eq!(transferred.to_destination, 3);

        let mut seen = Vec::new();
        backend.read_to_end(&mut seen).await.unwrap();
        assert_eq!(seen, b"bye");
    }

    #[tokio::test]
    async fn test_buffers_returned_after_relays() {
        let pool = pool();

        for _ in 0..20 {
            let (mut client, source) = duplex(64);
            let (destination, mut backend) = duplex(64);
            let relay = tokio::spawn(Relay::new(Arc::clone(&pool)).run(source, destination));

            client.write_all(b"x").await.unwrap();
            client.shutdown().await.unwrap();
            let mut sink = Vec::new();
            backend.read_to_end(&mut sink).await.unwrap();
            backend.shutdown().await.unwrap();

            relay.await.unwrap().unwrap();
        }

        assert!(pool.allocated() <= 2);
        assert_eq!(pool.allocated(), pool.idle());
    }

    #[tokio::test]
    async fn test_cloned_relays_are_independent() {
        let base = Relay::new(pool());

        let (mut client1, source1) = duplex(64);
        let (destination1, mut backend1) = duplex(64);
        let (mut client2, source2) = duplex(64);
        let (destination2, mut backend2) = duplex(64);

        let relay1 = tokio::spawn(base.clone().run(source1, destination1));
        let relay2 = tokio::spawn(base.run(source2, destination2));

        // Finish the first relay completely.
        client1.shutdown().await.unwrap();
        backend1.shutdown().await.unwrap();
        relay1.await.unwrap().unwrap();

        // The second one still carries bytes both ways.
        client2.write_all(b"still").await.unwrap();
        let mut buf = [0u8; 5];
        backend2.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"still");

        backend2.write_all(b"alive").await.unwrap();
        client2.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"alive");
        assert!(!relay2.is_finished());

        client2.shutdown().await.unwrap();
        backend2.shutdown().await.unwrap();
        relay2.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_relay_error_closes_both_sides_and_returns_buffers() {
        let pool = pool();
        let (mut client, source) = duplex(64);
        let (destination, backend) = duplex(64);

        // Destination peer is gone before anything is written.
        drop(backend);

        let relay = tokio::spawn(Relay::new(Arc::clone(&pool)).run(source, destination));

        client.write_all(b"lost").await.unwrap();

        let result = relay.await.unwrap();
        assert!(result.is_err());

        let mut rest = Vec::new();
        assert_eq!(client.read_to_end(&mut rest).await.unwrap(), 0);

        assert!(pool.allocated() <= 2);
        assert_eq!(pool.allocated(), pool.idle());
    }

    #[tokio::test]
    async fn test_cancellation_closes_both_sides() {
        let (mut client, source) = duplex(64);
        let (destination, mut backend) = duplex(64);
        let scope = CancellationToken::new();

        let relay = tokio::spawn(
            Relay::new(pool())
                .with_cancellation(&scope)
                .run(source, destination),
        );

        scope.cancel();
        relay.await.unwrap().unwrap();

        let mut buf = Vec::new();
        assert_eq!(client.read_to_end(&mut buf).await.unwrap(), 0);
        assert_eq!(backend.read_to_end(&mut buf).await.unwrap(), 0);
    }
}
