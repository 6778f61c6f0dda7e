//! Readiness-driven event loop: accept, admission, echo, join broadcast.
//!
//! A single thread owns the poll, the connection registry, the admission
//! policy, and the broadcaster; all mutation happens synchronously while
//! servicing events, so no locking is needed. Blocking only ever happens
//! at the top of the loop (the readiness wait); reads and writes on ready
//! handles are non-blocking.
//!
//! Error handling follows three tiers: bind/listen failures are fatal at
//! startup, a failed readiness wait is logged and retried, and read/write
//! failures close only the offending connection.

use crate::admission::AllowPolicy;
use crate::broadcast::Broadcaster;
use crate::config::Config;
use crate::connection::{ClientConnection, ConnectionRegistry};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use tracing::{debug, error, info, warn};

/// Reserved token for the listening socket, the distinguished member of
/// the watch set. Slab keys never reach this value.
const LISTENER: Token = Token(usize::MAX);

/// Listen backlog.
const BACKLOG: i32 = 16;

/// Largest chunk read from a client per read call.
const MAX_MSG: usize = 512;

/// Fixed acknowledgment written to a data-ready client.
const ACK: &[u8] = b"message received\n";

/// Fixed refusal line written to a peer that fails admission.
const REFUSAL: &[u8] = b"connection refused by policy\n";

/// Fixed notification datagram sent when a client is admitted.
const JOIN_NOTICE: &[u8] = b"a new client has joined\n";

/// Server instance: listener plus the state the event loop dispatches over.
pub struct Server {
    poll: Poll,
    listener: TcpListener,
    local_addr: SocketAddr,
    registry: ConnectionRegistry,
    policy: AllowPolicy,
    broadcaster: Broadcaster,
}

impl Server {
    /// Bind the listening socket and set up the poll.
    ///
    /// Fails fatally on socket creation, bind, or listen failure; there is
    /// no recovery path for these at startup.
    pub fn bind(config: &Config) -> io::Result<Self> {
        let addr: SocketAddr = format!("{}:{}", config.host, config.port)
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let listener = create_listener(addr)?;
        let local_addr = listener.local_addr()?;
        let mut listener = TcpListener::from_std(listener);

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;

        Ok(Self {
            poll,
            listener,
            local_addr,
            registry: ConnectionRegistry::new(config.max_connections),
            policy: AllowPolicy::new(config.allow),
            broadcaster: Broadcaster::new(SocketAddr::new(
                config.broadcast_host,
                config.broadcast_port,
            )),
        })
    }

    /// Address the listener is actually bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Run the event loop.
    ///
    /// Services every ready handle once per pass, then blocks again. Only
    /// an accept failure terminates the loop.
    pub fn run(&mut self) -> io::Result<()> {
        info!(addr = %self.local_addr, "Server listening");

        let mut events = Events::with_capacity(128);

        loop {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                // One misbehaving descriptor must not take the server down
                error!(error = %e, "Readiness wait failed, retrying");
                continue;
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER => self.accept_ready()?,
                    Token(conn_id) => self.client_ready(conn_id),
                }
            }
        }
    }

    /// Drain the accept queue.
    ///
    /// The listener accepts unconditionally; admission is decided per
    /// accepted stream. Accept errors other than `WouldBlock` are fatal.
    fn accept_ready(&mut self) -> io::Result<()> {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => self.admit_or_refuse(stream, peer),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Evaluate the admission policy for one accepted stream.
    fn admit_or_refuse(&mut self, stream: TcpStream, peer: SocketAddr) {
        if !self.policy.is_allowed(peer.ip()) {
            info!(peer = %peer, "Connection rejected");
            refuse(stream);
            return;
        }

        let conn_id = match self.registry.insert(ClientConnection::new(stream, peer)) {
            Some(id) => id,
            None => {
                // Stream dropped here; the peer sees a plain close
                warn!(peer = %peer, "Connection limit reached, refusing");
                return;
            }
        };

        if let Some(conn) = self.registry.get_mut(conn_id) {
            if let Err(e) = self.poll.registry().register(
                &mut conn.stream,
                Token(conn_id),
                Interest::READABLE,
            ) {
                error!(conn_id, peer = %peer, error = %e, "Failed to watch connection");
                self.registry.remove(conn_id);
                return;
            }
        }

        info!(conn_id, peer = %peer, active = self.registry.len(), "New connection");

        match self.broadcaster.send(JOIN_NOTICE) {
            Ok(len) => info!(target = %self.broadcaster.target(), len, "Broadcast sent"),
            Err(e) => warn!(target = %self.broadcaster.target(), error = %e, "Broadcast failed"),
        }
    }

    /// Service a data-ready client connection.
    ///
    /// The acknowledgment goes out before the payload is looked at: this is
    /// an unconditional echo-on-readiness, not a reply to message content.
    fn client_ready(&mut self, conn_id: usize) {
        // The connection may already have been closed in this poll pass;
        // never touch a handle that left the registry
        if !self.registry.contains(conn_id) {
            return;
        }

        let Some(conn) = self.registry.get_mut(conn_id) else {
            return;
        };

        match conn.stream.write(ACK) {
            Ok(n) if n < ACK.len() => {
                warn!(conn_id, written = n, "Short acknowledgment write");
            }
            Ok(_) => {}
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                warn!(conn_id, "Acknowledgment dropped, peer not writable");
            }
            Err(e) => {
                warn!(conn_id, peer = %conn.peer, error = %e, "Acknowledgment write failed");
                self.close_connection(conn_id);
                return;
            }
        }

        self.read_ready(conn_id);
    }

    /// Drain readable data from a client.
    ///
    /// Readiness is edge-triggered, so the socket is read until it would
    /// block; each chunk is bounded by `MAX_MSG`.
    fn read_ready(&mut self, conn_id: usize) {
        let mut buf = [0u8; MAX_MSG];

        loop {
            let Some(conn) = self.registry.get_mut(conn_id) else {
                return;
            };

            match conn.stream.read(&mut buf) {
                Ok(0) => {
                    // End of stream: the one normal termination path
                    info!(conn_id, peer = %conn.peer, "Client disconnected");
                    self.close_connection(conn_id);
                    return;
                }
                Ok(n) => {
                    info!(
                        conn_id,
                        len = n,
                        payload = %String::from_utf8_lossy(&buf[..n]),
                        "Message received"
                    );
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    warn!(conn_id, peer = %conn.peer, error = %e, "Read failed");
                    self.close_connection(conn_id);
                    return;
                }
            }
        }
    }

    /// Deregister and release one connection.
    fn close_connection(&mut self, conn_id: usize) {
        if let Some(mut conn) = self.registry.remove(conn_id) {
            let _ = self.poll.registry().deregister(&mut conn.stream);
            debug!(conn_id, peer = %conn.peer, active = self.registry.len(), "Connection closed");
        }
    }
}

/// Best-effort refusal of a peer that failed admission.
///
/// The refusal line goes out first so the peer can observe it, then both
/// directions are shut down and any bytes already received are consumed
/// before the stream is released. The connection never enters the registry.
fn refuse(mut stream: TcpStream) {
    if let Err(e) = stream.write(REFUSAL) {
        debug!(error = %e, "Failed to deliver refusal");
    }
    let _ = stream.shutdown(Shutdown::Both);

    let mut drain = [0u8; MAX_MSG];
    loop {
        match stream.read(&mut drain) {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
    }
}

/// Create the non-blocking listening socket.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::{IpAddr, Ipv4Addr, TcpStream as StdTcpStream, UdpSocket};
    use std::thread;
    use std::time::Duration;

    fn test_config(allow: IpAddr, notify_to: SocketAddr) -> Config {
        Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            max_connections: 16,
            allow,
            broadcast_host: notify_to.ip(),
            broadcast_port: notify_to.port(),
            log_level: "info".to_string(),
        }
    }

    /// Run a server on an ephemeral port, with broadcasts redirected to a
    /// local UDP receiver. Returns the listen address and the receiver.
    fn spawn_server(allow: IpAddr) -> (SocketAddr, UdpSocket) {
        let notify = UdpSocket::bind("127.0.0.1:0").unwrap();
        notify
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        let config = test_config(allow, notify.local_addr().unwrap());
        let mut server = Server::bind(&config).unwrap();
        let addr = server.local_addr();

        thread::spawn(move || {
            let _ = server.run();
        });

        (addr, notify)
    }

    fn loopback() -> IpAddr {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    }

    fn read_ack(client: &mut StdTcpStream) -> Vec<u8> {
        let mut ack = vec![0u8; ACK.len()];
        client.read_exact(&mut ack).unwrap();
        ack
    }

    #[test]
    fn test_bind_ephemeral_port() {
        let notify = UdpSocket::bind("127.0.0.1:0").unwrap();
        let config = test_config(loopback(), notify.local_addr().unwrap());

        let server = Server::bind(&config).unwrap();
        assert_ne!(server.local_addr().port(), 0);
    }

    #[test]
    fn test_admitted_client_gets_one_ack_per_message() {
        let (addr, _notify) = spawn_server(loopback());

        let mut client = StdTcpStream::connect(addr).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        // No welcome is sent on admission; the first bytes from the server
        // are the ack for the first message
        client.write_all(b"ping").unwrap();
        assert_eq!(read_ack(&mut client), ACK);

        client.write_all(b"pong").unwrap();
        assert_eq!(read_ack(&mut client), ACK);
    }

    #[test]
    fn test_ack_is_content_independent() {
        let (addr, _notify) = spawn_server(loopback());

        let mut client = StdTcpStream::connect(addr).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        client.write_all(&[0u8, 255, 7, 13]).unwrap();
        assert_eq!(read_ack(&mut client), ACK);

        // Larger than one read chunk still produces acks, not an error
        client.write_all(&vec![b'x'; MAX_MSG * 2]).unwrap();
        assert_eq!(read_ack(&mut client), ACK);
    }

    #[test]
    fn test_admission_emits_one_broadcast() {
        let (addr, notify) = spawn_server(loopback());

        let _client = StdTcpStream::connect(addr).unwrap();

        let mut buf = [0u8; 64];
        let (len, _) = notify.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], JOIN_NOTICE);

        // Exactly one datagram per admission
        notify
            .set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();
        assert!(notify.recv_from(&mut buf).is_err());
    }

    #[test]
    fn test_refused_peer_reads_refusal_then_eof() {
        // Allow an address no test client can come from
        let (addr, notify) = spawn_server(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)));

        let mut client = StdTcpStream::connect(addr).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        let mut received = Vec::new();
        client.read_to_end(&mut received).unwrap();
        assert_eq!(received, REFUSAL);

        // A refused peer is never announced
        notify
            .set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();
        let mut buf = [0u8; 64];
        assert!(notify.recv_from(&mut buf).is_err());
    }

    #[test]
    fn test_rejection_leaves_admitted_client_untouched() {
        let (addr, notify) = spawn_server(loopback());

        let mut admitted = StdTcpStream::connect(addr).unwrap();
        admitted
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        let mut buf = [0u8; 64];
        notify.recv_from(&mut buf).unwrap();

        // Second client arrives from 127.0.0.2 and fails the address check
        let sock = socket2::Socket::new(
            socket2::Domain::IPV4,
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )
        .unwrap();
        sock.bind(&"127.0.0.2:0".parse::<SocketAddr>().unwrap().into())
            .unwrap();
        sock.connect(&addr.into()).unwrap();
        let mut refused: StdTcpStream = sock.into();
        refused
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        let mut received = Vec::new();
        refused.read_to_end(&mut received).unwrap();
        assert_eq!(received, REFUSAL);

        // The admitted connection still works
        admitted.write_all(b"ping").unwrap();
        assert_eq!(read_ack(&mut admitted), ACK);

        // And the rejected peer produced no broadcast
        notify
            .set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();
        assert!(notify.recv_from(&mut buf).is_err());
    }

    #[test]
    fn test_disconnect_frees_the_server_for_new_clients() {
        let (addr, _notify) = spawn_server(loopback());

        {
            let mut client = StdTcpStream::connect(addr).unwrap();
            client.write_all(b"bye").unwrap();
            // Dropping the stream closes it; the server sees end-of-stream
        }

        let mut client = StdTcpStream::connect(addr).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        client.write_all(b"hello again").unwrap();
        assert_eq!(read_ack(&mut client), ACK);
    }
}
