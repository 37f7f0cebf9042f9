//! X11 event readiness for the render loop.
//!
//! The connection's socket is registered with the tokio reactor, so the
//! render loop can await it next to its task queue and signal streams.
//! Events themselves are read through x11rb on the render thread.

use anyhow::{Context, Result};
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use tokio::io::unix::AsyncFd;
use x11rb::connection::Connection;
use x11rb::protocol::Event;
use x11rb::rust_connection::RustConnection;

/// Resolve once `socket` has data and clear the cached readiness.
///
/// The caller must then read until the socket would block, or the next
/// wait may miss data that was already there.
async fn wait_readable(socket: &AsyncFd<RawFd>) -> io::Result<()> {
    let mut guard = socket.readable().await?;
    guard.clear_ready();
    Ok(())
}

pub struct X11EventStream {
    /// Borrowed fd; deregistered before `conn` can close it.
    socket: AsyncFd<RawFd>,
    conn: Arc<RustConnection>,
}

impl X11EventStream {
    /// Must be called inside a tokio runtime.
    pub fn new(conn: Arc<RustConnection>) -> Result<Self> {
        let fd = conn.stream().as_raw_fd();
        let socket = AsyncFd::new(fd).context("Failed to register X11 socket with tokio")?;
        Ok(Self { socket, conn })
    }

    /// Resolves once the socket has become readable. Follow with
    /// [`X11EventStream::drain`].
    pub async fn readable(&self) {
        if let Err(e) = wait_readable(&self.socket).await {
            // The next drain reports the broken connection.
            tracing::warn!("X11 socket readiness failed: {}", e);
        }
    }

    /// Everything already queued on the connection, without blocking.
    /// x11rb reads the socket until it would block.
    pub fn drain(&self) -> Result<Vec<Event>> {
        let mut out = Vec::new();
        while let Some(event) = self.conn.poll_for_event()? {
            out.push(event);
        }
        Ok(out)
    }

    pub fn flush(&self) -> Result<()> {
        self.conn.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wait_readable_wakes_on_incoming_data() {
        let (mut tx, mut rx) = UnixStream::pair().unwrap();
        rx.set_nonblocking(true).unwrap();
        let socket = AsyncFd::new(rx.as_raw_fd()).unwrap();

        let idle = tokio::time::timeout(Duration::from_millis(20), wait_readable(&socket)).await;
        assert!(idle.is_err(), "no data yet, must not resolve");

        tx.write_all(b"x").unwrap();
        tokio::time::timeout(Duration::from_secs(5), wait_readable(&socket))
            .await
            .expect("readable after write")
            .unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(rx.read(&mut buf).unwrap(), 1);
        drop(socket);
    }
}
