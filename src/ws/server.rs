//! WebSocket server.
//!
//! Listens on a bare TCP socket (any static file server the user runs is
//! separate) and performs the WebSocket handshake, capturing the connect
//! URL. Inbound events are queued until the orchestrator attaches its
//! dispatcher, and re-queued when it detaches across a restart, so no
//! in-flight event is lost.

use std::collections::VecDeque;
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tungstenite::WebSocket;
use tungstenite::handshake::server::{Request, Response};
use tungstenite::protocol::Message;

use crate::clock;

/// Identifies one client connection for the lifetime of the server.
pub type SocketId = u64;

/// Payload of an inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsData {
    Text(String),
    Binary(Vec<u8>),
}

/// Inbound server events, delivered to the dispatcher in arrival order.
#[derive(Debug)]
pub enum WsEvent {
    Connected { id: SocketId, url: String, date: u64 },
    Message { id: SocketId, data: WsData },
    Closed { id: SocketId },
}

/// How to pick the port to bind.
#[derive(Debug, Clone, Copy)]
pub enum PortChoice {
    /// From the state file. Degrades silently to an ephemeral port when
    /// taken (another instance probably owns it).
    Persisted(u16),
    /// From `elm-watch.json`. Taken port is a fatal error.
    FromConfig(u16),
    /// Let the OS assign one.
    Ephemeral,
}

/// Server startup failure.
#[derive(Debug)]
pub enum PortError {
    ConfigPortInUse { port: u16 },
    Io(std::io::Error),
}

impl std::fmt::Display for PortError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConfigPortInUse { port } => write!(
                f,
                "the port {port} from elm-watch.json is already in use; \
                 pick another or remove the \"port\" field"
            ),
            Self::Io(e) => write!(f, "failed to start the WebSocket server: {e}"),
        }
    }
}

// ============================================================================
// Server
// ============================================================================

enum Dispatch {
    Queued(VecDeque<WsEvent>),
    Attached(Box<dyn Fn(WsEvent) + Send>),
}

struct Inner {
    clients: Mutex<FxHashMap<SocketId, WebSocket<TcpStream>>>,
    dispatch: Mutex<Dispatch>,
    next_id: AtomicU64,
    shutdown: AtomicBool,
}

/// Running WebSocket server. Cheap to clone via the inner `Arc`; may be
/// carried across hot restarts.
pub struct WsServer {
    port: u16,
    inner: Arc<Inner>,
}

impl WsServer {
    /// Bind and start the acceptor and reader threads.
    pub fn start(choice: PortChoice) -> Result<Self, PortError> {
        let listener = bind(choice)?;
        let port = listener.local_addr().map_err(PortError::Io)?.port();
        listener.set_nonblocking(true).map_err(PortError::Io)?;

        let inner = Arc::new(Inner {
            clients: Mutex::new(FxHashMap::default()),
            dispatch: Mutex::new(Dispatch::Queued(VecDeque::new())),
            next_id: AtomicU64::new(1),
            shutdown: AtomicBool::new(false),
        });

        let acceptor = Arc::clone(&inner);
        std::thread::spawn(move || accept_loop(listener, acceptor));
        let reader = Arc::clone(&inner);
        std::thread::spawn(move || reader_loop(reader));

        Ok(Self { port, inner })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Attach the dispatcher, draining queued events in order.
    pub fn set_dispatch(&self, f: impl Fn(WsEvent) + Send + 'static) {
        let mut dispatch = self.inner.dispatch.lock();
        if let Dispatch::Queued(queued) = &mut *dispatch {
            for event in queued.drain(..) {
                f(event);
            }
        }
        *dispatch = Dispatch::Attached(Box::new(f));
    }

    /// Detach the dispatcher; events queue again until the next attach.
    pub fn unset_dispatch(&self) {
        *self.inner.dispatch.lock() = Dispatch::Queued(VecDeque::new());
    }

    /// Send a text frame to one client. Returns false if it is gone.
    pub fn send(&self, id: SocketId, text: &str) -> bool {
        let mut clients = self.inner.clients.lock();
        match clients.get_mut(&id) {
            Some(ws) => ws.send(Message::Text(text.into())).is_ok(),
            None => false,
        }
    }

    /// Close every client and stop the accept/read threads.
    pub fn close(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        let mut clients = self.inner.clients.lock();
        for (_, mut ws) in clients.drain() {
            let _ = ws.close(None);
        }
    }
}

fn bind(choice: PortChoice) -> Result<TcpListener, PortError> {
    let try_port = |port: u16| TcpListener::bind(("127.0.0.1", port));
    match choice {
        PortChoice::Persisted(port) => match try_port(port) {
            Ok(listener) => Ok(listener),
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                try_port(0).map_err(PortError::Io)
            }
            Err(e) => Err(PortError::Io(e)),
        },
        PortChoice::FromConfig(port) => match try_port(port) {
            Ok(listener) => Ok(listener),
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                Err(PortError::ConfigPortInUse { port })
            }
            Err(e) => Err(PortError::Io(e)),
        },
        PortChoice::Ephemeral => try_port(0).map_err(PortError::Io),
    }
}

// ============================================================================
// Threads
// ============================================================================

fn accept_loop(listener: TcpListener, inner: Arc<Inner>) {
    loop {
        if inner.shutdown.load(Ordering::SeqCst) {
            return;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                // Handshake in blocking mode, then poll reads non-blocking
                let _ = stream.set_nonblocking(false);
                let mut url = String::new();
                let callback = |req: &Request, resp: Response| {
                    url = req.uri().to_string();
                    Ok(resp)
                };
                match tungstenite::accept_hdr(stream, callback) {
                    Ok(ws) => {
                        let _ = ws.get_ref().set_nonblocking(true);
                        let id = inner.next_id.fetch_add(1, Ordering::SeqCst);
                        // Connected must be observed before any frame from
                        // this client, so emit before registering it
                        emit(&inner, WsEvent::Connected { id, url, date: clock::now_ms() });
                        inner.clients.lock().insert(id, ws);
                    }
                    Err(e) => crate::debug!("ws"; "handshake failed: {}", e),
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                crate::log!("ws"; "accept error: {}", e);
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }
}

fn reader_loop(inner: Arc<Inner>) {
    loop {
        if inner.shutdown.load(Ordering::SeqCst) {
            return;
        }
        std::thread::sleep(Duration::from_millis(100));

        let mut closed = Vec::new();
        let mut received = Vec::new();
        {
            let mut clients = inner.clients.lock();
            for (&id, ws) in clients.iter_mut() {
                loop {
                    match ws.read() {
                        Ok(Message::Text(text)) => {
                            received.push(WsEvent::Message { id, data: WsData::Text(text.to_string()) });
                        }
                        Ok(Message::Binary(bytes)) => {
                            received
                                .push(WsEvent::Message { id, data: WsData::Binary(bytes.to_vec()) });
                        }
                        Ok(Message::Close(_)) => {
                            closed.push(id);
                            break;
                        }
                        Ok(_) => {}
                        Err(tungstenite::Error::Io(ref e))
                            if e.kind() == std::io::ErrorKind::WouldBlock =>
                        {
                            break;
                        }
                        Err(_) => {
                            closed.push(id);
                            break;
                        }
                    }
                }
            }
            for id in &closed {
                clients.remove(id);
            }
        }

        for event in received {
            emit(&inner, event);
        }
        for id in closed {
            emit(&inner, WsEvent::Closed { id });
        }
    }
}

fn emit(inner: &Inner, event: WsEvent) {
    let mut dispatch = inner.dispatch.lock();
    match &mut *dispatch {
        Dispatch::Queued(queued) => queued.push_back(event),
        Dispatch::Attached(f) => f(event),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ephemeral_port_binds() {
        let server = WsServer::start(PortChoice::Ephemeral).unwrap();
        assert_ne!(server.port(), 0);
        server.close();
    }

    #[test]
    fn test_persisted_port_degrades_when_taken() {
        let first = WsServer::start(PortChoice::Ephemeral).unwrap();
        let second = WsServer::start(PortChoice::Persisted(first.port())).unwrap();
        assert_ne!(second.port(), first.port());
        first.close();
        second.close();
    }

    #[test]
    fn test_config_port_conflict_is_fatal() {
        let first = WsServer::start(PortChoice::Ephemeral).unwrap();
        let result = WsServer::start(PortChoice::FromConfig(first.port()));
        assert!(matches!(result, Err(PortError::ConfigPortInUse { .. })));
        first.close();
    }

    #[test]
    fn test_events_queue_until_dispatch_attached() {
        let server = WsServer::start(PortChoice::Ephemeral).unwrap();
        emit(&server.inner, WsEvent::Closed { id: 7 });
        emit(&server.inner, WsEvent::Closed { id: 8 });

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        server.set_dispatch(move |event| {
            if let WsEvent::Closed { id } = event {
                sink.lock().push(id);
            }
        });
        assert_eq!(*seen.lock(), vec![7, 8], "queued events drain in order");

        emit(&server.inner, WsEvent::Closed { id: 9 });
        assert_eq!(*seen.lock(), vec![7, 8, 9], "later events go straight through");

        server.unset_dispatch();
        emit(&server.inner, WsEvent::Closed { id: 10 });
        assert_eq!(*seen.lock(), vec![7, 8, 9], "detached events queue again");
        server.close();
    }

    #[test]
    fn test_handshake_captures_url() {
        let server = WsServer::start(PortChoice::Ephemeral).unwrap();
        let (tx, rx) = std::sync::mpsc::channel();
        server.set_dispatch(move |event| {
            if let WsEvent::Connected { url, .. } = event {
                let _ = tx.send(url);
            }
        });

        let addr = format!("ws://127.0.0.1:{}/?elmWatchVersion=x&output=y&compiledTimestamp=0", server.port());
        let (mut ws, _) = tungstenite::connect(&addr).unwrap();

        let url = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(url, "/?elmWatchVersion=x&output=y&compiledTimestamp=0");
        let _ = ws.close(None);
        server.close();
    }

    #[test]
    fn test_send_to_unknown_client() {
        let server = WsServer::start(PortChoice::Ephemeral).unwrap();
        assert!(!server.send(42, "hello"));
        server.close();
    }
}
