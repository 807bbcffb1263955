// Per-connection I/O pump shared by the relay server and the client
// transport.
//
// A link is two threads around one TCP socket:
// - **Reader thread**: blocks on the raw socket and forwards whatever bytes
//   arrive (plaintext or TLS records) into the pump's input channel. It
//   never writes.
// - **Pump thread**: owns the socket's write side, the rustls session (if
//   any), and the frame decoder. It blocks on the input channel, which
//   carries both the owner's commands (`send`, `close`, `abort`) and the
//   reader's bytes, so inbound and outbound traffic are serialized without
//   locks or polling.
//
// The owner never touches the socket directly. It learns about progress
// through the `notify` callback it passed to `LinkHandle::spawn`, which the
// pump invokes with `LinkEvent`s: `Ready` once connected (and handshaken),
// `Frame` per complete inbound frame, `WriteCompleted` per flushed send,
// and a final `Closed` or `Failed`. The server and client turn these into
// entries on their drive-loop channels.
//
// Outbound flow control is the owner's job: both the relay and the client
// keep at most one `send` outstanding per link and issue the next one on
// `WriteCompleted`.
//
// Closing: `close(farewell)` writes a final frame, sends TLS close_notify,
// half-closes the socket and waits briefly for the peer to hang up, so the
// farewell is read before the connection drops. `abort()` shuts the socket
// down immediately. Dropping a `LinkHandle` aborts unless a graceful close
// was already requested.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use healing_stats_protocol::framing::{FrameDecoder, frame};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, Connection, ServerConfig, ServerConnection};
use tracing::{debug, trace};

/// Upper bound on a single TCP connect attempt per resolved address.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on the TLS handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Socket write timeout. A peer that stops reading fails the link instead
/// of wedging its pump.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a graceful close waits for the peer to hang up.
const LINGER: Duration = Duration::from_millis(500);

const READ_CHUNK: usize = 16 * 1024;

/// Progress reports from a link's pump thread.
#[derive(Debug)]
pub enum LinkEvent {
    /// Connected, TLS handshake (if any) finished, reads armed.
    Ready,
    /// One complete inbound frame.
    Frame(Vec<u8>),
    /// The oldest outstanding `send` has been written to the socket.
    WriteCompleted,
    /// Orderly end: the peer hung up, or the owner closed or aborted.
    Closed,
    /// Connect, handshake, read, or write failure.
    Failed(io::Error),
}

/// TLS parameters for an outgoing link.
#[derive(Clone, Debug)]
pub struct ClientTls {
    pub config: Arc<ClientConfig>,
    pub server_name: ServerName<'static>,
}

/// What a link is built from.
pub enum LinkTarget {
    /// A socket the relay's listener accepted.
    Accepted {
        stream: TcpStream,
        tls: Option<Arc<ServerConfig>>,
    },
    /// A `host:port` the pump should connect to.
    Dial {
        endpoint: String,
        tls: Option<ClientTls>,
    },
}

enum Input {
    Send(Vec<u8>),
    Close(Option<Vec<u8>>),
    Received(Vec<u8>),
    ReadEnded(Option<io::Error>),
}

#[derive(Default)]
struct Shared {
    socket: Mutex<Option<TcpStream>>,
    aborted: AtomicBool,
    closing: AtomicBool,
}

impl Shared {
    fn shutdown_socket(&self) {
        let socket = self.socket.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(socket) = socket.as_ref() {
            let _ = socket.shutdown(Shutdown::Both);
        }
    }
}

/// Owner's side of a link.
pub struct LinkHandle {
    input: Sender<Input>,
    shared: Arc<Shared>,
}

impl LinkHandle {
    /// Start the pump thread. Connecting (for `Dial`) and the TLS handshake
    /// happen on that thread; the outcome arrives as `Ready` or `Failed`.
    pub fn spawn(
        target: LinkTarget,
        label: String,
        notify: impl FnMut(LinkEvent) + Send + 'static,
    ) -> io::Result<Self> {
        let (input, inbox) = mpsc::channel();
        let shared = Arc::new(Shared::default());
        if let LinkTarget::Accepted { stream, .. } = &target {
            *shared.socket.lock().unwrap_or_else(PoisonError::into_inner) =
                Some(stream.try_clone()?);
        }

        let pump = Pump {
            label: label.clone(),
            input: input.clone(),
            inbox,
            shared: shared.clone(),
            notify: Box::new(notify),
        };
        thread::Builder::new()
            .name(format!("link-{label}"))
            .spawn(move || pump.run(target))?;

        Ok(Self { input, shared })
    }

    /// Queue one message for writing. It is framed by the pump.
    pub fn send(&self, message: Vec<u8>) {
        let _ = self.input.send(Input::Send(message));
    }

    /// Write `farewell` after any queued sends, then close gracefully.
    pub fn close(&self, farewell: Vec<u8>) {
        self.shared.closing.store(true, Ordering::SeqCst);
        let _ = self.input.send(Input::Close(Some(farewell)));
    }

    /// Tear the connection down now, discarding queued sends.
    pub fn abort(&self) {
        self.shared.aborted.store(true, Ordering::SeqCst);
        self.shared.shutdown_socket();
        let _ = self.input.send(Input::Close(None));
    }
}

impl Drop for LinkHandle {
    fn drop(&mut self) {
        if !self.shared.closing.load(Ordering::SeqCst) {
            self.abort();
        }
    }
}

struct Pump {
    label: String,
    input: Sender<Input>,
    inbox: Receiver<Input>,
    shared: Arc<Shared>,
    notify: Box<dyn FnMut(LinkEvent) + Send>,
}

impl Pump {
    fn run(mut self, target: LinkTarget) {
        let (socket, mut tls) = match self.establish(target) {
            Ok(established) => established,
            Err(e) => {
                debug!(link = %self.label, error = %e, "link setup failed");
                let event = if self.shared.aborted.load(Ordering::SeqCst) {
                    LinkEvent::Closed
                } else {
                    LinkEvent::Failed(e)
                };
                (self.notify)(event);
                return;
            }
        };

        if let Err(e) = self.spawn_reader(&socket) {
            let _ = socket.shutdown(Shutdown::Both);
            (self.notify)(LinkEvent::Failed(e));
            return;
        }

        (self.notify)(LinkEvent::Ready);
        let outcome = self.pump(&socket, tls.as_mut());
        let _ = socket.shutdown(Shutdown::Both);
        trace!(link = %self.label, ?outcome, "link finished");
        (self.notify)(outcome);
    }

    fn establish(&self, target: LinkTarget) -> io::Result<(TcpStream, Option<Connection>)> {
        match target {
            LinkTarget::Accepted { stream, tls } => {
                prepare(&stream)?;
                let Some(config) = tls else {
                    return Ok((stream, None));
                };
                let mut conn = ServerConnection::new(config).map_err(io::Error::other)?;
                stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
                let mut io = &stream;
                while conn.is_handshaking() {
                    conn.complete_io(&mut io)?;
                }
                stream.set_read_timeout(None)?;
                Ok((stream, Some(Connection::from(conn))))
            }
            LinkTarget::Dial { endpoint, tls } => {
                let stream = connect(&endpoint)?;
                *self.shared.socket.lock().unwrap_or_else(PoisonError::into_inner) =
                    Some(stream.try_clone()?);
                if self.shared.aborted.load(Ordering::SeqCst) {
                    return Err(io::Error::new(io::ErrorKind::ConnectionAborted, "link aborted"));
                }
                prepare(&stream)?;
                let Some(ClientTls {
                    config,
                    server_name,
                }) = tls
                else {
                    return Ok((stream, None));
                };
                let mut conn =
                    ClientConnection::new(config, server_name).map_err(io::Error::other)?;
                stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
                let mut io = &stream;
                while conn.is_handshaking() {
                    conn.complete_io(&mut io)?;
                }
                stream.set_read_timeout(None)?;
                Ok((stream, Some(Connection::from(conn))))
            }
        }
    }

    fn spawn_reader(&self, socket: &TcpStream) -> io::Result<()> {
        let mut socket = socket.try_clone()?;
        let input = self.input.clone();
        thread::Builder::new()
            .name(format!("link-{}-reader", self.label))
            .spawn(move || {
                let mut buf = vec![0u8; READ_CHUNK];
                loop {
                    match socket.read(&mut buf) {
                        Ok(0) => {
                            let _ = input.send(Input::ReadEnded(None));
                            break;
                        }
                        Ok(n) => {
                            if input.send(Input::Received(buf[..n].to_vec())).is_err() {
                                break;
                            }
                        }
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                        Err(e) => {
                            let _ = input.send(Input::ReadEnded(Some(e)));
                            break;
                        }
                    }
                }
            })?;
        Ok(())
    }

    fn pump(&mut self, socket: &TcpStream, mut tls: Option<&mut Connection>) -> LinkEvent {
        let mut decoder = FrameDecoder::new();
        // The handshake may have pulled in application data along with the
        // peer's last handshake flight.
        if let Some(conn) = tls.as_deref_mut() {
            let open = match receive_tls(conn, socket, &[], &mut decoder) {
                Ok(open) => open,
                Err(e) => return self.failure(e),
            };
            if let Err(e) = self.deliver_frames(&mut decoder) {
                return self.failure(e);
            }
            if !open {
                return LinkEvent::Closed;
            }
        }
        loop {
            let Ok(input) = self.inbox.recv() else {
                return LinkEvent::Closed;
            };
            match input {
                Input::Send(message) => {
                    if let Err(e) = write_message(socket, tls.as_deref_mut(), &message) {
                        return self.failure(e);
                    }
                    (self.notify)(LinkEvent::WriteCompleted);
                }
                Input::Close(farewell) => {
                    if let Some(farewell) = farewell {
                        self.linger(socket, tls.as_deref_mut(), &farewell);
                    }
                    return LinkEvent::Closed;
                }
                Input::Received(bytes) => {
                    let open = match tls.as_deref_mut() {
                        None => {
                            decoder.extend(&bytes);
                            true
                        }
                        Some(conn) => match receive_tls(conn, socket, &bytes, &mut decoder) {
                            Ok(open) => open,
                            Err(e) => return self.failure(e),
                        },
                    };
                    if let Err(e) = self.deliver_frames(&mut decoder) {
                        return self.failure(e);
                    }
                    if !open {
                        return LinkEvent::Closed;
                    }
                }
                Input::ReadEnded(None) => return LinkEvent::Closed,
                Input::ReadEnded(Some(e)) => return self.failure(e),
            }
        }
    }

    fn deliver_frames(&mut self, decoder: &mut FrameDecoder) -> io::Result<()> {
        while let Some(frame) = decoder.next_frame()? {
            (self.notify)(LinkEvent::Frame(frame));
        }
        Ok(())
    }

    fn failure(&self, e: io::Error) -> LinkEvent {
        if self.shared.aborted.load(Ordering::SeqCst) {
            LinkEvent::Closed
        } else {
            LinkEvent::Failed(e)
        }
    }

    fn linger(&self, socket: &TcpStream, mut tls: Option<&mut Connection>, farewell: &[u8]) {
        if let Err(e) = write_message(socket, tls.as_deref_mut(), farewell) {
            debug!(link = %self.label, error = %e, "failed to write farewell");
            return;
        }
        if let Some(conn) = tls {
            conn.send_close_notify();
            let _ = flush_tls(conn, socket);
        }
        let _ = socket.shutdown(Shutdown::Write);

        let deadline = Instant::now() + LINGER;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            match self.inbox.recv_timeout(left) {
                Ok(Input::ReadEnded(_)) | Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => break,
                Ok(_) => {}
            }
        }
    }
}

fn prepare(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)?;
    stream.set_write_timeout(Some(WRITE_TIMEOUT))
}

/// Connect to the first reachable address `endpoint` resolves to.
fn connect(endpoint: &str) -> io::Result<TcpStream> {
    let mut last_error = None;
    for addr in endpoint.to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
            Ok(stream) => return Ok(stream),
            Err(e) => last_error = Some(e),
        }
    }
    Err(last_error.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("{endpoint} resolved to no addresses"),
        )
    }))
}

fn write_message(socket: &TcpStream, tls: Option<&mut Connection>, message: &[u8]) -> io::Result<()> {
    let framed = frame(message)?;
    match tls {
        None => {
            let mut socket = socket;
            socket.write_all(&framed)?;
            socket.flush()
        }
        Some(conn) => {
            conn.writer().write_all(&framed)?;
            flush_tls(conn, socket)
        }
    }
}

fn flush_tls(conn: &mut Connection, socket: &TcpStream) -> io::Result<()> {
    let mut socket = socket;
    while conn.wants_write() {
        conn.write_tls(&mut socket)?;
    }
    Ok(())
}

/// Feed raw TLS bytes through the session. Returns false once the peer has
/// sent close_notify.
fn receive_tls(
    conn: &mut Connection,
    socket: &TcpStream,
    mut bytes: &[u8],
    decoder: &mut FrameDecoder,
) -> io::Result<bool> {
    loop {
        if !bytes.is_empty() {
            conn.read_tls(&mut bytes)?;
        }
        let state = match conn.process_new_packets() {
            Ok(state) => state,
            Err(e) => {
                // Let the peer see the alert before the socket goes away.
                let _ = flush_tls(conn, socket);
                return Err(io::Error::new(io::ErrorKind::InvalidData, e));
            }
        };
        let available = state.plaintext_bytes_to_read();
        if available > 0 {
            let mut plain = vec![0u8; available];
            conn.reader().read_exact(&mut plain)?;
            decoder.extend(&plain);
        }
        if state.peer_has_closed() {
            flush_tls(conn, socket)?;
            return Ok(false);
        }
        if bytes.is_empty() {
            break;
        }
    }
    flush_tls(conn, socket)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use healing_stats_protocol::framing::{read_frame, write_frame};

    use super::*;

    fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    fn spawn_accepted(stream: TcpStream) -> (LinkHandle, Receiver<LinkEvent>) {
        let (tx, rx) = mpsc::channel();
        let link = LinkHandle::spawn(
            LinkTarget::Accepted { stream, tls: None },
            "test".into(),
            move |event| {
                let _ = tx.send(event);
            },
        )
        .unwrap();
        (link, rx)
    }

    fn next_event(rx: &Receiver<LinkEvent>) -> LinkEvent {
        rx.recv_timeout(Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn frames_flow_both_ways() {
        let (mut peer, stream) = tcp_pair();
        let (link, rx) = spawn_accepted(stream);
        assert!(matches!(next_event(&rx), LinkEvent::Ready));

        write_frame(&mut peer, b"ping").unwrap();
        match next_event(&rx) {
            LinkEvent::Frame(bytes) => assert_eq!(bytes, b"ping"),
            other => panic!("expected Frame, got {other:?}"),
        }

        link.send(b"pong".to_vec());
        assert!(matches!(next_event(&rx), LinkEvent::WriteCompleted));
        assert_eq!(read_frame(&mut peer).unwrap(), b"pong");
    }

    #[test]
    fn close_delivers_farewell_then_eof() {
        let (mut peer, stream) = tcp_pair();
        let (link, rx) = spawn_accepted(stream);
        assert!(matches!(next_event(&rx), LinkEvent::Ready));

        link.close(b"bye".to_vec());
        drop(link);
        assert_eq!(read_frame(&mut peer).unwrap(), b"bye");
        let mut rest = Vec::new();
        peer.read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty());
        assert!(matches!(next_event(&rx), LinkEvent::Closed));
    }

    #[test]
    fn peer_hangup_reports_closed() {
        let (peer, stream) = tcp_pair();
        let (_link, rx) = spawn_accepted(stream);
        assert!(matches!(next_event(&rx), LinkEvent::Ready));
        drop(peer);
        assert!(matches!(next_event(&rx), LinkEvent::Closed));
    }

    #[test]
    fn abort_reports_closed_not_failed() {
        let (_peer, stream) = tcp_pair();
        let (link, rx) = spawn_accepted(stream);
        assert!(matches!(next_event(&rx), LinkEvent::Ready));
        link.abort();
        assert!(matches!(next_event(&rx), LinkEvent::Closed));
    }

    #[test]
    fn dial_to_closed_port_fails() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let (tx, rx) = mpsc::channel();
        let _link = LinkHandle::spawn(
            LinkTarget::Dial {
                endpoint: format!("127.0.0.1:{port}"),
                tls: None,
            },
            "dial".into(),
            move |event| {
                let _ = tx.send(event);
            },
        )
        .unwrap();
        assert!(matches!(next_event(&rx), LinkEvent::Failed(_)));
    }
}
