//! One tunneled connection: an accepted client socket spliced to a remote.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

use crate::utils::Shutdown;

/// Size of each per-direction splice buffer, in bytes.
pub const BUFFER_SIZE: usize = 8192;

/// Which way bytes are flowing through the tunnel.
#[derive(Clone, Copy, Debug)]
enum Direction {
    ClientToRemote,
    RemoteToClient,
}

impl Direction {
    fn source(self) -> &'static str {
        match self {
            Direction::ClientToRemote => "client",
            Direction::RemoteToClient => "remote",
        }
    }

    fn dest(self) -> &'static str {
        match self {
            Direction::ClientToRemote => "remote",
            Direction::RemoteToClient => "client",
        }
    }
}

/// One proxied connection.
///
/// A session runs as its own task: it connects to the remote endpoint, then
/// copies bytes in both directions until a side fails or both sides have
/// drained, and finally closes both sockets. Failures never propagate past
/// the session.
#[derive(Debug)]
pub struct Session {
    client_addr: SocketAddr,
    remote_addr: SocketAddr,
    started: AtomicBool,
    closed: AtomicBool,
    shutdown: Shutdown,
}

impl Session {
    /// Create a session record for a freshly accepted client.
    pub fn new(client_addr: SocketAddr, remote_addr: SocketAddr) -> Self {
        Self {
            client_addr,
            remote_addr,
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            shutdown: Shutdown::new(),
        }
    }

    /// Peer address of the accepted client socket.
    pub fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    /// Remote endpoint this session forwards to.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Whether [`Session::run`] has been invoked.
    pub fn has_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Whether both sockets have been released.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Ask the session to close both sockets. Idempotent; pending reads and
    /// writes are abandoned and the splice task winds down.
    pub fn close(&self) {
        self.shutdown.shutdown();
    }

    /// Drive the session to completion: connect to the remote endpoint, then
    /// splice the two sockets until either side terminates.
    ///
    /// Idempotent: a second invocation returns immediately.
    pub async fn run(self: Arc<Self>, client: TcpStream, listen_addr: SocketAddr) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        info!(
            client = %self.client_addr,
            listen = %listen_addr,
            remote = %self.remote_addr,
            "accepted client, redirecting connection"
        );

        let remote = tokio::select! {
            _ = self.shutdown.wait() => None,
            result = TcpStream::connect(self.remote_addr) => match result {
                Ok(remote) => Some(remote),
                Err(err) => {
                    error!(
                        client = %self.client_addr,
                        remote = %self.remote_addr,
                        %err,
                        "cannot create tunnel to remote endpoint"
                    );
                    None
                }
            },
        };
        let Some(remote) = remote else {
            self.closed.store(true, Ordering::SeqCst);
            info!(client = %self.client_addr, "releasing client");
            return;
        };

        for stream in [&client, &remote] {
            if let Err(err) = stream.set_nodelay(true) {
                debug!("failed to set TCP_NODELAY on tunneled connection: {err:#}");
            }
        }

        warn!(
            client = %self.client_addr,
            remote = %self.remote_addr,
            "tunnel is now up and running"
        );

        let (client_read, client_write) = client.into_split();
        let (remote_read, remote_write) = remote.into_split();
        let splice = async {
            tokio::try_join!(
                self.pump(client_read, remote_write, Direction::ClientToRemote),
                self.pump(remote_read, client_write, Direction::RemoteToClient),
            )
        };

        tokio::select! {
            _ = self.shutdown.wait() => {
                debug!(client = %self.client_addr, "closing sockets for client");
            }
            _ = splice => {}
        }

        // Sockets are dropped here, releasing both sides.
        self.closed.store(true, Ordering::SeqCst);
        info!(client = %self.client_addr, "releasing client");
    }

    /// Copy one direction of the tunnel through a fixed-size buffer.
    ///
    /// The next read is only issued after the previous write completed, so
    /// the slower side throttles the faster one without explicit queueing.
    /// An orderly close forwards the FIN and lets the sibling direction
    /// drain; an error aborts both directions at once.
    async fn pump(
        &self,
        mut from: OwnedReadHalf,
        mut to: OwnedWriteHalf,
        dir: Direction,
    ) -> std::io::Result<()> {
        let mut buf = [0u8; BUFFER_SIZE];
        loop {
            let n = match from.read(&mut buf).await {
                Ok(0) => {
                    warn!(
                        client = %self.client_addr,
                        remote = %self.remote_addr,
                        "{} endpoint closed its side of the tunnel, forwarding end-of-stream",
                        dir.source(),
                    );
                    to.shutdown().await.ok();
                    return Ok(());
                }
                Ok(n) => n,
                Err(err) => {
                    warn!(
                        client = %self.client_addr,
                        remote = %self.remote_addr,
                        %err,
                        "cannot read data from {} endpoint",
                        dir.source(),
                    );
                    return Err(err);
                }
            };

            debug!(client = %self.client_addr, bytes = n, "read bytes from {} endpoint", dir.source());

            if let Err(err) = to.write_all(&buf[..n]).await {
                warn!(
                    client = %self.client_addr,
                    remote = %self.remote_addr,
                    %err,
                    "cannot write data to {} endpoint",
                    dir.dest(),
                );
                return Err(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::net::TcpListener;

    async fn accepted_pair() -> (TcpStream, TcpStream, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (connected, accepted) = tokio::join!(TcpStream::connect(addr), async {
            listener.accept().await.unwrap().0
        });
        (connected.unwrap(), accepted, addr)
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let session = Session::new(
            "127.0.0.1:40000".parse().unwrap(),
            "127.0.0.1:19090".parse().unwrap(),
        );
        session.close();
        session.close();
        assert!(!session.has_started());
        assert!(!session.is_closed());
    }

    #[tokio::test]
    async fn unreachable_remote_closes_the_session() {
        let (_client, accepted, listen_addr) = accepted_pair().await;
        // Nothing listens on port 1.
        let session = Arc::new(Session::new(
            accepted.peer_addr().unwrap(),
            "127.0.0.1:1".parse().unwrap(),
        ));
        Arc::clone(&session).run(accepted, listen_addr).await;
        assert!(session.has_started());
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn run_is_idempotent() {
        let (_client_a, accepted_a, listen_addr) = accepted_pair().await;
        let (_client_b, accepted_b, _) = accepted_pair().await;
        let session = Arc::new(Session::new(
            accepted_a.peer_addr().unwrap(),
            "127.0.0.1:1".parse().unwrap(),
        ));
        Arc::clone(&session).run(accepted_a, listen_addr).await;
        assert!(session.is_closed());
        // Second invocation is a no-op and leaves the session closed.
        Arc::clone(&session).run(accepted_b, listen_addr).await;
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn closed_before_connect_releases_both_sockets() {
        let (_client, accepted, listen_addr) = accepted_pair().await;
        let session = Arc::new(Session::new(
            accepted.peer_addr().unwrap(),
            "127.0.0.1:1".parse().unwrap(),
        ));
        session.close();
        Arc::clone(&session).run(accepted, listen_addr).await;
        assert!(session.is_closed());
    }
}
