// Copyright 2025-2026 CEMAXECUTER LLC

//! Minimal TCP/UDP transport: one peer connection at a time.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

/// How often a non-blocking listener re-checks for clients and for close().
const ACCEPT_POLL: Duration = Duration::from_millis(10);

/// An open connection to one peer.
pub trait Conn: Send + Sync {
    /// Send one frame. TCP writes it to the byte stream, UDP sends one datagram.
    fn write(&self, buf: &[u8]) -> io::Result<()>;

    fn is_open(&self) -> bool;

    /// Close the connection. Wakes any thread blocked in `wait_for_end`.
    fn close(&self);

    /// Block until the peer disconnects or the connection is closed locally.
    fn wait_for_end(&self);

    fn peer_addr(&self) -> Option<SocketAddr>;
}

/// A listening socket handing out one connection per `accept`.
pub trait Listener: Send + Sync {
    /// Block until a client connects. Fails once the listener is closed.
    fn accept(&self) -> io::Result<Arc<dyn Conn>>;

    fn is_listening(&self) -> bool;

    fn close(&self);

    fn local_addr(&self) -> Option<SocketAddr>;
}

/// Factory for listeners and datagram connections.
pub trait Transport: Send + Sync {
    fn listen(&self, host: &str, port: u16) -> io::Result<Arc<dyn Listener>>;

    /// Open a datagram "connection" to a fixed destination.
    fn open_udp(&self, host: &str, port: u16) -> io::Result<Arc<dyn Conn>>;
}

/// Transport backed by the operating system's sockets.
#[derive(Debug, Default, Clone, Copy)]
pub struct SocketTransport;

impl Transport for SocketTransport {
    fn listen(&self, host: &str, port: u16) -> io::Result<Arc<dyn Listener>> {
        Ok(Arc::new(TcpServer::bind(host, port)?))
    }

    fn open_udp(&self, host: &str, port: u16) -> io::Result<Arc<dyn Conn>> {
        Ok(Arc::new(UdpConn::open(host, port)?))
    }
}

fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
    (host, port).to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("could not resolve {}:{}", host, port),
        )
    })
}

// ---------------------------------------------------------------------------
// TCP
// ---------------------------------------------------------------------------

pub struct TcpConn {
    stream: TcpStream,
    peer: Option<SocketAddr>,
    open: AtomicBool,
}

impl TcpConn {
    pub fn new(stream: TcpStream) -> Self {
        let peer = stream.peer_addr().ok();
        Self {
            stream,
            peer,
            open: AtomicBool::new(true),
        }
    }
}

impl Conn for TcpConn {
    fn write(&self, buf: &[u8]) -> io::Result<()> {
        if !self.is_open() {
            return Err(io::ErrorKind::NotConnected.into());
        }
        let res = (&self.stream).write_all(buf);
        if res.is_err() {
            self.open.store(false, Ordering::SeqCst);
        }
        res
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    fn wait_for_end(&self) {
        // The peer never sends anything meaningful; reading only detects EOF.
        let mut scratch = [0u8; 512];
        while self.is_open() {
            match (&self.stream).read(&mut scratch) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        self.open.store(false, Ordering::SeqCst);
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}

pub struct TcpServer {
    listener: TcpListener,
    listening: AtomicBool,
}

impl TcpServer {
    pub fn bind(host: &str, port: u16) -> io::Result<Self> {
        let listener = TcpListener::bind(resolve(host, port)?)?;
        listener.set_nonblocking(true)?;
        log::info!("TCP listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            listening: AtomicBool::new(true),
        })
    }
}

impl Listener for TcpServer {
    fn accept(&self) -> io::Result<Arc<dyn Conn>> {
        while self.is_listening() {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    stream.set_nonblocking(false)?;
                    if let Err(e) = stream.set_nodelay(true) {
                        log::warn!("TCP_NODELAY on {}: {}", addr, e);
                    }
                    log::info!("client connected: {}", addr);
                    return Ok(Arc::new(TcpConn::new(stream)));
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL);
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Err(io::Error::new(io::ErrorKind::NotConnected, "listener closed"))
    }

    fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.listening.store(false, Ordering::SeqCst);
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }
}

// ---------------------------------------------------------------------------
// UDP
// ---------------------------------------------------------------------------

pub struct UdpConn {
    socket: UdpSocket,
    peer: SocketAddr,
    open: Mutex<bool>,
    closed: Condvar,
}

impl UdpConn {
    /// Bind an ephemeral local port and fix the destination to `host:port`.
    ///
    /// Datagrams therefore do not leave from `port` itself. Binding the
    /// destination port locally would collide with a receiver on the same
    /// host, so peers must not filter on the source port.
    pub fn open(host: &str, port: u16) -> io::Result<Self> {
        let peer = resolve(host, port)?;
        let local: SocketAddr = if peer.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(local)?;
        socket.connect(peer)?;
        log::info!("UDP sending to {}", peer);
        Ok(Self {
            socket,
            peer,
            open: Mutex::new(true),
            closed: Condvar::new(),
        })
    }
}

impl Conn for UdpConn {
    fn write(&self, buf: &[u8]) -> io::Result<()> {
        if !self.is_open() {
            return Err(io::ErrorKind::NotConnected.into());
        }
        self.socket.send(buf).map(|_| ())
    }

    fn is_open(&self) -> bool {
        *self.open.lock().unwrap()
    }

    fn close(&self) {
        *self.open.lock().unwrap() = false;
        self.closed.notify_all();
    }

    fn wait_for_end(&self) {
        let mut open = self.open.lock().unwrap();
        while *open {
            open = self.closed.wait(open).unwrap();
        }
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        Some(self.peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_tcp_write_and_peer_disconnect() {
        let server = TcpServer::bind("127.0.0.1", 0).unwrap();
        let addr = server.local_addr().unwrap();

        let mut client = TcpStream::connect(addr).unwrap();
        let conn = server.accept().unwrap();
        assert!(conn.is_open());

        conn.write(&[1, 2, 3, 4]).unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);

        drop(client);
        conn.wait_for_end();
        assert!(!conn.is_open());
        assert!(conn.write(&[0]).is_err());
    }

    #[test]
    fn test_tcp_close_wakes_wait_for_end() {
        let server = TcpServer::bind("127.0.0.1", 0).unwrap();
        let _client = TcpStream::connect(server.local_addr().unwrap()).unwrap();
        let conn = server.accept().unwrap();

        let waiter = {
            let conn = Arc::clone(&conn);
            thread::spawn(move || conn.wait_for_end())
        };
        thread::sleep(Duration::from_millis(20));
        conn.close();
        waiter.join().unwrap();
    }

    #[test]
    fn test_listener_close_ends_accept() {
        let server = Arc::new(TcpServer::bind("127.0.0.1", 0).unwrap());
        let acceptor = {
            let server = Arc::clone(&server);
            thread::spawn(move || server.accept().is_err())
        };
        let start = Instant::now();
        thread::sleep(Duration::from_millis(30));
        server.close();
        assert!(acceptor.join().unwrap());
        assert!(!server.is_listening());
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_udp_one_datagram_per_write() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let port = receiver.local_addr().unwrap().port();

        let conn = UdpConn::open("127.0.0.1", port).unwrap();
        conn.write(&[9u8; 12]).unwrap();
        conn.write(&[7u8; 5]).unwrap();

        let mut buf = [0u8; 64];
        let (n, from) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(n, 12);
        // Sent from an ephemeral port, not the destination port
        assert_ne!(from.port(), port);
        assert_eq!(receiver.recv(&mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], &[7u8; 5]);

        conn.close();
        conn.wait_for_end();
        assert!(conn.write(&[0]).is_err());
    }
}
