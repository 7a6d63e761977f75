// TCP transport: one bidirectional link per `Connection`.
//
// A link is split into two halves when it is created:
// - `Connection` owns the buffered write half and is the only thing that ever
//   writes to the socket. `send` frames one message and flushes it;
//   `send_frame` writes bytes a caller already encoded.
// - `Incoming` owns the read half and an incremental `FrameDecoder`. Its
//   `recv` blocks the calling worker until a whole message arrives or the
//   link ends. Reads use a short idle timeout purely so the worker can notice
//   the session's `running` flag going false; a timeout never ends the link.
//
// A link is dead once `recv` reports end-of-stream, a read error or a bad
// frame, or once `close` has been called. Dead links are never reused.
//
// `Listener` wraps the host's non-blocking `TcpListener` and hands out
// accepted links with fresh, never-reused ids.

use std::fmt;
use std::io::{self, BufWriter, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use lifesim_protocol::{FrameDecoder, Message, encode};
use tracing::trace;

use crate::error::SessionError;

const READ_CHUNK: usize = 4096;

/// Opaque link identifier: `client_<n>` on the host, `host` on a peer.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionRole {
    /// The host's listening socket.
    Listening,
    /// A link the host accepted from a peer.
    Accepted,
    /// A peer's single link to its host.
    Outbound,
}

/// Per-link socket timeouts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timeouts {
    /// Read timeout; only bounds how long a receive loop waits before
    /// re-checking the running flag.
    pub idle: Duration,
    /// Write timeout; a peer that stops draining its socket fails the send
    /// instead of stalling the sender.
    pub write: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            idle: Duration::from_millis(250),
            write: Duration::from_secs(5),
        }
    }
}

/// Shuts a link down from any thread without touching its write half.
#[derive(Clone, Debug)]
pub struct Closer(Arc<TcpStream>);

impl Closer {
    /// Shut the socket down in both directions. Wakes the link's receive
    /// loop, which then observes end-of-stream. Closing twice is harmless.
    pub fn close(&self) {
        let _ = self.0.shutdown(Shutdown::Both);
    }
}

/// Why a receive loop stopped.
#[derive(Debug)]
pub enum LinkEnd {
    /// The remote side closed the stream.
    Closed,
    /// The local session stopped running.
    Shutdown,
    /// Read error or malformed frame.
    Failed(SessionError),
}

impl fmt::Display for LinkEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkEnd::Closed => f.write_str("closed by remote"),
            LinkEnd::Shutdown => f.write_str("local shutdown"),
            LinkEnd::Failed(err) => write!(f, "{err}"),
        }
    }
}

/// Write half of a link.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    role: ConnectionRole,
    remote: Option<SocketAddr>,
    writer: BufWriter<TcpStream>,
    closer: Closer,
}

impl Connection {
    /// Split a connected stream into its write and read halves.
    pub fn from_stream(
        id: ConnectionId,
        role: ConnectionRole,
        stream: TcpStream,
        timeouts: Timeouts,
    ) -> io::Result<(Connection, Incoming)> {
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(timeouts.idle))?;
        stream.set_write_timeout(Some(timeouts.write))?;
        let remote = stream.peer_addr().ok();
        let read_half = stream.try_clone()?;
        let closer = Closer(Arc::new(stream.try_clone()?));
        let incoming = Incoming {
            id: id.clone(),
            stream: read_half,
            decoder: FrameDecoder::new(),
        };
        let connection = Connection {
            id,
            role,
            remote,
            writer: BufWriter::new(stream),
            closer,
        };
        Ok((connection, incoming))
    }

    /// Open the outbound link to a host, giving up after `connect_timeout`
    /// per resolved address.
    pub fn connect(
        addr: &str,
        connect_timeout: Duration,
        timeouts: Timeouts,
    ) -> Result<(Connection, Incoming), SessionError> {
        let connect_err = |source: io::Error| SessionError::Connect {
            addr: addr.to_owned(),
            source,
        };
        let mut last_err =
            io::Error::new(ErrorKind::AddrNotAvailable, "address resolved to nothing");
        for candidate in addr.to_socket_addrs().map_err(connect_err)? {
            match TcpStream::connect_timeout(&candidate, connect_timeout) {
                Ok(stream) => {
                    return Connection::from_stream(
                        ConnectionId::new("host"),
                        ConnectionRole::Outbound,
                        stream,
                        timeouts,
                    )
                    .map_err(connect_err);
                }
                Err(e) => last_err = e,
            }
        }
        Err(connect_err(last_err))
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn role(&self) -> ConnectionRole {
        self.role
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }

    /// Frame and write one message. Fails if the socket is closed or was
    /// reset; the caller decides what a failure means for the session.
    pub fn send(&mut self, msg: &Message) -> Result<(), SessionError> {
        trace!(connection = %self.id, tag = msg.tag(), "send");
        let frame = encode(msg).map_err(|e| SessionError::from_codec(&self.id, e))?;
        self.send_frame(&frame)
    }

    /// Write a frame that was already encoded, prefix included. Lets a
    /// fan-out encode once and write the same bytes to every target.
    pub fn send_frame(&mut self, frame: &[u8]) -> Result<(), SessionError> {
        self.writer
            .write_all(frame)
            .and_then(|()| self.writer.flush())
            .map_err(|source| SessionError::Transport {
                connection: self.id.clone(),
                source,
            })
    }

    pub fn closer(&self) -> Closer {
        self.closer.clone()
    }

    pub fn close(&self) {
        self.closer.close();
    }
}

/// Read half of a link.
#[derive(Debug)]
pub struct Incoming {
    id: ConnectionId,
    stream: TcpStream,
    decoder: FrameDecoder,
}

impl Incoming {
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Block until the next message, or until the link ends.
    ///
    /// `running` is re-checked every idle timeout; once it is false the loop
    /// reports `LinkEnd::Shutdown` (messages already buffered are still
    /// delivered first).
    pub fn recv(&mut self, running: &AtomicBool) -> Result<Message, LinkEnd> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.decoder.next_message() {
                Ok(Some(msg)) => return Ok(msg),
                Ok(None) => {}
                Err(e) => return Err(LinkEnd::Failed(SessionError::from_codec(&self.id, e))),
            }
            if !running.load(Ordering::SeqCst) {
                return Err(LinkEnd::Shutdown);
            }
            match self.stream.read(&mut chunk) {
                Ok(0) => return Err(LinkEnd::Closed),
                Ok(n) => self.decoder.extend(&chunk[..n]),
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                    ) => {}
                Err(e) => {
                    return Err(LinkEnd::Failed(SessionError::Transport {
                        connection: self.id.clone(),
                        source: e,
                    }));
                }
            }
        }
    }
}

/// The host's listening socket.
#[derive(Debug)]
pub struct Listener {
    listener: TcpListener,
    local_addr: SocketAddr,
    next_id: AtomicU64,
    timeouts: Timeouts,
}

impl Listener {
    /// Bind and listen. The socket is non-blocking so the accept loop can
    /// poll the running flag between attempts.
    pub fn bind(addr: &str, timeouts: Timeouts) -> Result<Listener, SessionError> {
        let bind_err = |source: io::Error| SessionError::Bind {
            addr: addr.to_owned(),
            source,
        };
        let listener = TcpListener::bind(addr).map_err(bind_err)?;
        listener.set_nonblocking(true).map_err(bind_err)?;
        let local_addr = listener.local_addr().map_err(bind_err)?;
        Ok(Listener {
            listener,
            local_addr,
            next_id: AtomicU64::new(0),
            timeouts,
        })
    }

    pub fn role(&self) -> ConnectionRole {
        ConnectionRole::Listening
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept one pending link, if any. `Ok(None)` means nothing is waiting.
    pub fn accept(&self) -> Result<Option<(Connection, Incoming)>, SessionError> {
        let listener_id = || ConnectionId::new("listener");
        match self.listener.accept() {
            Ok((stream, _addr)) => {
                let n = self.next_id.fetch_add(1, Ordering::SeqCst);
                let id = ConnectionId::new(format!("client_{n}"));
                Connection::from_stream(id, ConnectionRole::Accepted, stream, self.timeouts)
                    .map(Some)
                    .map_err(|source| SessionError::Transport {
                        connection: listener_id(),
                        source,
                    })
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) if e.kind() == ErrorKind::Interrupted => Ok(None),
            Err(source) => Err(SessionError::Transport {
                connection: listener_id(),
                source,
            }),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::io::Write;
    use std::thread;
    use std::time::Instant;

    use lifesim_protocol::{AttributeBag, LogicalTime, MAX_FRAME_SIZE, encode};

    use super::*;

    pub(crate) const TIMEOUTS: Timeouts = Timeouts {
        idle: Duration::from_millis(20),
        write: Duration::from_secs(2),
    };

    /// Create a TCP pair on localhost: (client_stream, server_stream).
    pub(crate) fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    /// A linked pair of connections: (left, left_in, right, right_in).
    fn linked() -> (Connection, Incoming, Connection, Incoming) {
        let (a, b) = tcp_pair();
        let (left, left_in) =
            Connection::from_stream(ConnectionId::new("left"), ConnectionRole::Outbound, a, TIMEOUTS)
                .unwrap();
        let (right, right_in) =
            Connection::from_stream(ConnectionId::new("right"), ConnectionRole::Accepted, b, TIMEOUTS)
                .unwrap();
        (left, left_in, right, right_in)
    }

    fn chat(text: &str) -> Message {
        Message::Chat {
            sender: "Aylin".into(),
            text: text.into(),
            at: LogicalTime(0),
        }
    }

    #[test]
    fn send_then_recv_in_order() {
        let running = AtomicBool::new(true);
        let (mut left, _left_in, _right, mut right_in) = linked();
        left.send(&chat("one")).unwrap();
        left.send(&chat("two")).unwrap();
        assert_eq!(right_in.recv(&running).unwrap(), chat("one"));
        assert_eq!(right_in.recv(&running).unwrap(), chat("two"));
    }

    #[test]
    fn one_encoded_frame_can_go_to_many_links() {
        let running = AtomicBool::new(true);
        let (mut a, _a_in, _b, mut b_in) = linked();
        let (mut c, _c_in, _d, mut d_in) = linked();
        let frame = encode(&chat("shared")).unwrap();
        a.send_frame(&frame).unwrap();
        c.send_frame(&frame).unwrap();
        assert_eq!(b_in.recv(&running).unwrap(), chat("shared"));
        assert_eq!(d_in.recv(&running).unwrap(), chat("shared"));
    }

    #[test]
    fn remote_close_ends_the_loop() {
        let running = AtomicBool::new(true);
        let (left, _left_in, _right, mut right_in) = linked();
        left.close();
        assert!(matches!(right_in.recv(&running), Err(LinkEnd::Closed)));
    }

    #[test]
    fn garbage_is_a_protocol_error() {
        let running = AtomicBool::new(true);
        let (mut raw, server) = tcp_pair();
        let (_conn, mut incoming) = Connection::from_stream(
            ConnectionId::new("client_0"),
            ConnectionRole::Accepted,
            server,
            TIMEOUTS,
        )
        .unwrap();
        raw.write_all(&4u32.to_be_bytes()).unwrap();
        raw.write_all(b"nope").unwrap();
        match incoming.recv(&running) {
            Err(LinkEnd::Failed(SessionError::Protocol { connection, .. })) => {
                assert_eq!(connection.as_str(), "client_0");
            }
            other => panic!("expected protocol failure, got {other:?}"),
        }
    }

    #[test]
    fn oversized_frame_is_a_protocol_error() {
        let running = AtomicBool::new(true);
        let (mut raw, server) = tcp_pair();
        let (_conn, mut incoming) = Connection::from_stream(
            ConnectionId::new("client_0"),
            ConnectionRole::Accepted,
            server,
            TIMEOUTS,
        )
        .unwrap();
        raw.write_all(&(MAX_FRAME_SIZE + 1).to_be_bytes()).unwrap();
        assert!(matches!(
            incoming.recv(&running),
            Err(LinkEnd::Failed(SessionError::Protocol { .. }))
        ));
    }

    #[test]
    fn frame_split_across_idle_timeouts_is_reassembled() {
        let running = AtomicBool::new(true);
        let (mut raw, server) = tcp_pair();
        let (_conn, mut incoming) = Connection::from_stream(
            ConnectionId::new("client_0"),
            ConnectionRole::Accepted,
            server,
            TIMEOUTS,
        )
        .unwrap();
        let mut head = encode(&chat("slow")).unwrap();
        let tail = head.split_off(6);
        let writer = thread::spawn(move || {
            raw.write_all(&head).unwrap();
            thread::sleep(TIMEOUTS.idle * 4);
            raw.write_all(&tail).unwrap();
            raw
        });
        assert_eq!(incoming.recv(&running).unwrap(), chat("slow"));
        drop(writer.join().unwrap());
    }

    #[test]
    fn cleared_running_flag_stops_within_idle_timeout() {
        let running = AtomicBool::new(false);
        let (_left, _left_in, _right, mut right_in) = linked();
        let started = Instant::now();
        assert!(matches!(right_in.recv(&running), Err(LinkEnd::Shutdown)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn send_on_shut_down_socket_fails() {
        let (a, b) = tcp_pair();
        let handle = a.try_clone().unwrap();
        let (mut conn, _incoming) =
            Connection::from_stream(ConnectionId::new("client_7"), ConnectionRole::Accepted, a, TIMEOUTS)
                .unwrap();
        handle.shutdown(Shutdown::Write).unwrap();
        let joined = Message::Joined {
            name: "Kerem".into(),
            attributes: AttributeBag::new(),
        };
        assert!(matches!(
            conn.send(&joined),
            Err(SessionError::Transport { .. })
        ));
        drop(b);
    }

    #[test]
    fn listener_assigns_fresh_ids() {
        let listener = Listener::bind("127.0.0.1:0", TIMEOUTS).unwrap();
        assert_eq!(listener.role(), ConnectionRole::Listening);
        let addr = listener.local_addr();
        let _c1 = TcpStream::connect(addr).unwrap();
        let _c2 = TcpStream::connect(addr).unwrap();

        let mut ids = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while ids.len() < 2 && Instant::now() < deadline {
            match listener.accept().unwrap() {
                Some((conn, _incoming)) => {
                    assert_eq!(conn.role(), ConnectionRole::Accepted);
                    ids.push(conn.id().clone());
                }
                None => thread::sleep(Duration::from_millis(5)),
            }
        }
        assert_eq!(
            ids,
            vec![ConnectionId::new("client_0"), ConnectionId::new("client_1")]
        );
    }

    #[test]
    fn connect_to_closed_port_fails_with_connect_error() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let err = Connection::connect(&addr.to_string(), Duration::from_millis(500), TIMEOUTS)
            .unwrap_err();
        assert!(matches!(err, SessionError::Connect { .. }));
    }
}
