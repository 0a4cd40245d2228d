//! Transport abstraction
//!
//! The node never touches sockets directly: it dials and listens through a
//! [`Transport`]. [`TcpTransport`] is the real network; [`MemoryTransport`]
//! connects nodes inside one process over in-memory pipes, for tests.

use futures::future::BoxFuture;
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// Byte stream carrying one peer connection
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Source of inbound connections
pub trait Listener: Send {
    /// Wait for the next inbound connection and its remote address
    fn accept(&mut self) -> BoxFuture<'_, io::Result<(BoxedStream, SocketAddr)>>;

    fn local_addr(&self) -> SocketAddr;
}

/// Dial and listen operations
pub trait Transport: Send + Sync {
    fn connect(&self, addr: SocketAddr) -> BoxFuture<'static, io::Result<BoxedStream>>;

    fn listen(&self, addr: SocketAddr) -> BoxFuture<'static, io::Result<Box<dyn Listener>>>;
}

// =============================================================================
// TCP
// =============================================================================

#[derive(Debug, Clone, Default)]
pub struct TcpTransport;

struct TcpAcceptor {
    listener: TcpListener,
    local: SocketAddr,
}

impl Listener for TcpAcceptor {
    fn accept(&mut self) -> BoxFuture<'_, io::Result<(BoxedStream, SocketAddr)>> {
        Box::pin(async move {
            let (stream, addr) = self.listener.accept().await?;
            stream.set_nodelay(true)?;
            Ok((Box::new(stream) as BoxedStream, addr))
        })
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }
}

impl Transport for TcpTransport {
    fn connect(&self, addr: SocketAddr) -> BoxFuture<'static, io::Result<BoxedStream>> {
        Box::pin(async move {
            let stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream) as BoxedStream)
        })
    }

    fn listen(&self, addr: SocketAddr) -> BoxFuture<'static, io::Result<Box<dyn Listener>>> {
        Box::pin(async move {
            let listener = TcpListener::bind(addr).await?;
            let local = listener.local_addr()?;
            log::info!("Listening on {}", local);
            Ok(Box::new(TcpAcceptor { listener, local }) as Box<dyn Listener>)
        })
    }
}

// =============================================================================
// In-memory
// =============================================================================

/// Pipe capacity per direction; large enough for a full HEADERS batch
const MEMORY_PIPE_SIZE: usize = 1024 * 1024;

type PendingConnection = (DuplexStream, SocketAddr);

/// Shared registry of in-memory listeners
#[derive(Default)]
pub struct MemoryNetwork {
    listeners: Mutex<HashMap<SocketAddr, mpsc::UnboundedSender<PendingConnection>>>,
    next_port: AtomicU16,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            listeners: Mutex::new(HashMap::new()),
            next_port: AtomicU16::new(40000),
        })
    }

    fn ephemeral_port(&self) -> u16 {
        self.next_port.fetch_add(1, Ordering::Relaxed)
    }

    fn register(&self, addr: SocketAddr, tx: mpsc::UnboundedSender<PendingConnection>) -> io::Result<()> {
        let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        if listeners.contains_key(&addr) {
            return Err(io::Error::new(io::ErrorKind::AddrInUse, addr.to_string()));
        }
        listeners.insert(addr, tx);
        Ok(())
    }

    fn unregister(&self, addr: &SocketAddr) {
        let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        listeners.remove(addr);
    }

    fn dial(&self, from: SocketAddr, to: SocketAddr) -> io::Result<DuplexStream> {
        let listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        let tx = listeners
            .get(&to)
            .ok_or_else(|| io::Error::new(io::ErrorKind::ConnectionRefused, to.to_string()))?;

        let (client, server) = tokio::io::duplex(MEMORY_PIPE_SIZE);
        tx.send((server, from))
            .map_err(|_| io::Error::new(io::ErrorKind::ConnectionRefused, to.to_string()))?;
        Ok(client)
    }
}

/// One node's view of a [`MemoryNetwork`], identified by a local IP
#[derive(Clone)]
pub struct MemoryTransport {
    network: Arc<MemoryNetwork>,
    local_ip: IpAddr,
}

impl MemoryTransport {
    pub fn new(network: Arc<MemoryNetwork>, local_ip: Ipv4Addr) -> Self {
        Self {
            network,
            local_ip: IpAddr::V4(local_ip),
        }
    }
}

struct MemoryListener {
    network: Arc<MemoryNetwork>,
    local: SocketAddr,
    incoming: mpsc::UnboundedReceiver<PendingConnection>,
}

impl Listener for MemoryListener {
    fn accept(&mut self) -> BoxFuture<'_, io::Result<(BoxedStream, SocketAddr)>> {
        Box::pin(async move {
            match self.incoming.recv().await {
                Some((stream, remote)) => Ok((Box::new(stream) as BoxedStream, remote)),
                None => Err(io::Error::new(io::ErrorKind::NotConnected, "listener closed")),
            }
        })
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        self.network.unregister(&self.local);
    }
}

impl Transport for MemoryTransport {
    fn connect(&self, addr: SocketAddr) -> BoxFuture<'static, io::Result<BoxedStream>> {
        let from = SocketAddr::new(self.local_ip, self.network.ephemeral_port());
        let result = self.network.dial(from, addr);
        Box::pin(async move { Ok(Box::new(result?) as BoxedStream) })
    }

    fn listen(&self, addr: SocketAddr) -> BoxFuture<'static, io::Result<Box<dyn Listener>>> {
        let network = self.network.clone();
        let local = SocketAddr::new(self.local_ip, addr.port());
        Box::pin(async move {
            let (tx, incoming) = mpsc::unbounded_channel();
            network.register(local, tx)?;
            Ok(Box::new(MemoryListener {
                network,
                local,
                incoming,
            }) as Box<dyn Listener>)
        })
    }
}
