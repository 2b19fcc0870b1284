//! Loopback message server
//!
//! Binds a TCP listener on the loopback interface, wraps every accepted
//! stream in an [`FdSessionOps`] session and hands it to a [`Connection`]
//! driver on its own thread. The server only ever listens on `127.0.0.1`;
//! it exists to serve co-resident processes, not the network.

use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, warn};

use super::connection::{self, Connection};
use super::handler::SecretHandler;
use super::registry::ConnectionRegistry;
use super::session::FdSessionOps;
use super::Result;

/// Accepts loopback connections and drives them until stopped.
pub struct MessageServer {
    local_addr: SocketAddr,
    registry: Arc<ConnectionRegistry>,
    shutdown: Arc<AtomicBool>,
    accept_thread: Option<thread::JoinHandle<()>>,
}

impl MessageServer {
    /// Bind `127.0.0.1:port` (0 picks an ephemeral port) and start
    /// accepting connections.
    pub fn start(port: u16, handler: Arc<dyn SecretHandler>) -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        socket.bind(&addr.into())?;
        socket.listen(16)?;

        let listener: TcpListener = socket.into();
        let local_addr = listener.local_addr()?;

        let registry = Arc::new(ConnectionRegistry::new());
        let shutdown = Arc::new(AtomicBool::new(false));

        let accept_registry = Arc::clone(&registry);
        let accept_shutdown = Arc::clone(&shutdown);
        let accept_thread = thread::Builder::new()
            .name("kv-accept".to_string())
            .spawn(move || {
                accept_loop(listener, handler, accept_registry, accept_shutdown);
            })?;

        debug!(%local_addr, "message server listening");
        Ok(MessageServer {
            local_addr,
            registry,
            shutdown,
            accept_thread: Some(accept_thread),
        })
    }

    /// Address the server is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of currently live connections.
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Stop accepting new connections.
    ///
    /// Connections already being driven are left to finish on their own.
    pub fn stop(&mut self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        // Wake the blocking accept so the loop observes the flag.
        let _ = TcpStream::connect(self.local_addr);
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MessageServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(
    listener: TcpListener,
    handler: Arc<dyn SecretHandler>,
    registry: Arc<ConnectionRegistry>,
    shutdown: Arc<AtomicBool>,
) {
    loop {
        let (stream, peer) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(err) => {
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }
                warn!(%err, "accept failed");
                continue;
            }
        };

        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        debug!(%peer, "accepted connection");
        let id = registry.next_id();
        let connection = Connection::new(
            id,
            FdSessionOps::new(stream),
            Arc::clone(&handler),
            Arc::clone(&registry),
        );
        if let Err(err) = connection::spawn(connection) {
            warn!(%err, "failed to spawn connection thread");
        }
    }
}
