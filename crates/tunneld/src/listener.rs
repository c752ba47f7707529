//! Accept loop for one forwarding rule, tracking the sessions it originates.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::session::Session;
use crate::utils::Shutdown;

/// Owns the passive socket for one forwarding rule and every session it has
/// accepted.
///
/// A listener that fails to accept becomes `dead`: it stops accepting, its
/// passive socket is closed, and the engine's reaper removes it once its
/// remaining sessions have terminated.
#[derive(Debug)]
pub struct Listener {
    listen_addr: SocketAddr,
    remote_addr: SocketAddr,
    acceptor: Mutex<Option<TcpListener>>,
    sessions: Arc<DashMap<u64, Arc<Session>>>,
    next_session_id: AtomicU64,
    dead: AtomicBool,
    shutdown: Shutdown,
}

impl Listener {
    /// Open the passive socket and bind it to `(listen_ip, listen_port)`.
    ///
    /// Binding failure is surfaced to the caller; this does not begin
    /// accepting connections yet.
    pub async fn bind(
        listen_ip: IpAddr,
        listen_port: u16,
        remote_ip: IpAddr,
        remote_port: u16,
        shutdown: Shutdown,
    ) -> Result<Arc<Self>> {
        let listen_addr = SocketAddr::new(listen_ip, listen_port);
        debug!(listen = %listen_addr, "creating listener");
        let acceptor = TcpListener::bind(listen_addr).await?;
        Ok(Arc::new(Self {
            listen_addr,
            remote_addr: SocketAddr::new(remote_ip, remote_port),
            acceptor: Mutex::new(Some(acceptor)),
            sessions: Arc::new(DashMap::new()),
            next_session_id: AtomicU64::new(0),
            dead: AtomicBool::new(false),
            shutdown,
        }))
    }

    /// The local endpoint this listener is bound to.
    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    /// The remote endpoint this listener's sessions forward to.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Whether this listener has stopped accepting connections.
    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    /// Number of sessions currently tracked by this listener.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Arm the accept loop. Accepts are self-perpetuating until the listener
    /// dies or the engine shuts down; a second invocation is a no-op.
    pub fn async_listen(self: Arc<Self>) -> JoinHandle<()> {
        let acceptor = self.acceptor.lock().take();
        tokio::spawn(async move {
            if let Some(acceptor) = acceptor {
                self.accept_loop(acceptor).await;
                self.dead.store(true, Ordering::SeqCst);
                // The acceptor is dropped here, closing the passive socket.
            }
        })
    }

    async fn accept_loop(&self, acceptor: TcpListener) {
        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.wait() => break,
                accepted = acceptor.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => self.start_session(stream, peer),
                Err(err) => {
                    error!(
                        listen = %self.listen_addr,
                        remote = %self.remote_addr,
                        %err,
                        "listener could not accept a connection; \
                         no more connections will be accepted by this listener"
                    );
                    break;
                }
            }
        }
    }

    /// Register a session for an accepted client and spawn its splice task.
    /// The task retires the session record as soon as the splice ends.
    fn start_session(&self, stream: TcpStream, peer: SocketAddr) {
        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let session = Arc::new(Session::new(peer, self.remote_addr));
        self.sessions.insert(id, Arc::clone(&session));

        let sessions = Arc::clone(&self.sessions);
        let listen_addr = self.listen_addr;
        tokio::spawn(async move {
            Arc::clone(&session).run(stream, listen_addr).await;
            sessions.remove(&id);
            info!(
                client = %session.client_addr(),
                listen = %listen_addr,
                "removing session"
            );
        });
    }

    /// Drop finished sessions still present in the set.
    ///
    /// Sessions normally retire themselves when their splice ends; this
    /// sweep is the reaper's safety net.
    pub fn remove_dead_sessions(&self) {
        self.sessions.retain(|_, session| {
            if session.has_started() && session.is_closed() {
                info!(client = %session.client_addr(), "removing dead session");
                false
            } else {
                true
            }
        });
    }

    /// Ask every session owned by this listener to close.
    pub fn close_sessions(&self) {
        for entry in self.sessions.iter() {
            entry.value().close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn bind_fails_when_port_is_taken() {
        let holder = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let taken = holder.local_addr().unwrap();
        let result = Listener::bind(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            taken.port(),
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            19090,
            Shutdown::new(),
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn second_async_listen_is_a_noop() {
        let listener = Listener::bind(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            0,
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            19090,
            Shutdown::new(),
        )
        .await
        .unwrap();
        let first = Arc::clone(&listener).async_listen();
        let second = Arc::clone(&listener).async_listen();
        // The second task finds no acceptor and finishes immediately,
        // leaving the armed listener untouched.
        second.await.unwrap();
        assert!(!listener.is_dead());
        listener.shutdown.shutdown();
        first.await.unwrap();
        assert!(listener.is_dead());
    }
}
