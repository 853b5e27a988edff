//! Reliable-datagram transport boundary
//!
//! The dispatch loop is written against the [`Transport`] trait: a
//! connection-accept event carries the initiator's opaque 32-bit handshake
//! value, receive events carry whole length-delimited payloads, and
//! [`Transport::poll_events`] drains whatever is ready within the caller's
//! time budget. It is the loop's only blocking point.
//!
//! [`QuicTransport`] is the production implementation over QUIC streams
//! (quiche + mio). Each connection uses one client-initiated bidirectional
//! stream carrying 4-byte little-endian length-prefixed frames; the first
//! frame must be exactly 4 bytes and carries the handshake value, so the
//! core never sees a connection until that value has arrived.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token};
use ring::rand::{SecureRandom, SystemRandom};

// ============================================================================
// Constants
// ============================================================================

/// Maximum UDP payload size for QUIC packets (must match the probe client)
const MAX_DATAGRAM_SIZE: usize = 1350;

/// QUIC idle timeout in milliseconds; the session deadlines close
/// well-behaved connections long before this backstop fires
const IDLE_TIMEOUT_MS: u64 = 30_000;

/// ALPN protocol identifier (must match the probe client)
pub const ALPN_PROTOCOL: &[u8] = b"master/1";

/// Length of the frame header (4 bytes for length)
pub const FRAME_HEADER_LEN: usize = 4;

/// Length of the hello frame payload carrying the handshake value
pub const HELLO_LEN: usize = 4;

/// Largest frame accepted; generously bounds the biggest legal message,
/// a full server listing
pub const MAX_FRAME_LEN: usize = 1 << 19;

/// How long a flush-then-close connection lingers after its data was
/// handed to QUIC, giving the peer time to read before the close
const FLUSH_CLOSE_GRACE: Duration = Duration::from_secs(1);

/// mio token for the UDP socket
const SOCKET_TOKEN: Token = Token(0);

// ============================================================================
// Contract
// ============================================================================

/// Handle the dispatch loop uses to name one transport connection
pub type ConnId = u64;

/// Transport events surfaced to the dispatch loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A connection finished its handshake and presented its 32-bit value
    Connect {
        conn: ConnId,
        handshake: u32,
        peer: SocketAddr,
    },
    /// A whole application payload arrived on an accepted connection
    Receive { conn: ConnId, payload: Vec<u8> },
    /// The connection went away (remote close, timeout, or local close)
    Disconnect { conn: ConnId },
}

/// The contract the dispatch loop requires of the underlying transport.
/// The transport owns sockets, retransmission, and congestion control;
/// the core only ever sees the events above.
pub trait Transport {
    /// Drain ready events, blocking at most `budget`.
    fn poll_events(&mut self, budget: Duration, events: &mut Vec<Event>) -> io::Result<()>;

    /// Queue one reliable payload to the peer.
    fn send(&mut self, conn: ConnId, payload: &[u8]);

    /// Close immediately, dropping anything still queued.
    fn close(&mut self, conn: ConnId);

    /// Close once queued sends have flushed.
    fn close_when_flushed(&mut self, conn: ConnId);
}

// ============================================================================
// QUIC implementation
// ============================================================================

/// One accepted QUIC connection and its framing state
struct PeerConn {
    conn: quiche::Connection,
    peer: SocketAddr,
    id: ConnId,
    /// The one bidirectional stream this peer speaks on
    stream_id: Option<u64>,
    /// Set once the hello frame arrived and Connect was emitted
    handshake: Option<u32>,
    announced: bool,
    /// Reassembly buffer for incoming frames
    in_buf: Vec<u8>,
    /// Frames waiting to enter the QUIC stream
    out_buf: Vec<u8>,
    closing: bool,
    fin_sent: bool,
    close_at: Option<Instant>,
}

/// Production transport over QUIC (quiche + mio)
pub struct QuicTransport {
    poll: Poll,
    socket: UdpSocket,
    local_addr: SocketAddr,
    config: quiche::Config,
    conns: HashMap<quiche::ConnectionId<'static>, PeerConn>,
    ids: HashMap<ConnId, quiche::ConnectionId<'static>>,
    next_id: ConnId,
    rng: SystemRandom,
    mio_events: Events,
    recv_buf: Vec<u8>,
    send_buf: Vec<u8>,
}

impl QuicTransport {
    pub fn new(
        port: u16,
        cert_path: &str,
        key_path: &str,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let mut config = quiche::Config::new(quiche::PROTOCOL_VERSION)?;

        config.load_cert_chain_from_pem_file(cert_path)?;
        config.load_priv_key_from_pem_file(key_path)?;
        config.set_application_protos(&[ALPN_PROTOCOL])?;

        config.set_max_idle_timeout(IDLE_TIMEOUT_MS);
        config.set_max_recv_udp_payload_size(MAX_DATAGRAM_SIZE);
        config.set_max_send_udp_payload_size(MAX_DATAGRAM_SIZE);
        config.set_initial_max_data(1_000_000);
        config.set_initial_max_stream_data_bidi_local(1_000_000);
        config.set_initial_max_stream_data_bidi_remote(1_000_000);
        config.set_initial_max_streams_bidi(10);
        config.set_initial_max_streams_uni(10);

        // no authentication; any peer may speak the protocol
        config.verify_peer(false);

        let poll = Poll::new()?;
        let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;
        let mut socket = UdpSocket::bind(addr)?;
        poll.registry()
            .register(&mut socket, SOCKET_TOKEN, Interest::READABLE)?;
        let local_addr = socket.local_addr()?;

        log::info!("transport listening on {}", local_addr);

        Ok(QuicTransport {
            poll,
            socket,
            local_addr,
            config,
            conns: HashMap::new(),
            ids: HashMap::new(),
            next_id: 1,
            rng: SystemRandom::new(),
            mio_events: Events::with_capacity(1024),
            recv_buf: vec![0u8; 65535],
            send_buf: vec![0u8; MAX_DATAGRAM_SIZE],
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn process_socket(&mut self, out: &mut Vec<Event>) -> io::Result<()> {
        let mut pkt_buf = vec![0u8; 65535];

        loop {
            let (len, from) = match self.socket.recv_from(&mut self.recv_buf) {
                Ok(v) => v,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            };

            pkt_buf[..len].copy_from_slice(&self.recv_buf[..len]);
            let pkt = &mut pkt_buf[..len];

            // parse in a scope so the header's borrow of the packet ends
            // before the packet is fed into a connection
            let (dcid, scid, ty, version) =
                match quiche::Header::from_slice(pkt, quiche::MAX_CONN_ID_LEN) {
                    Ok(hdr) => (
                        hdr.dcid.into_owned(),
                        hdr.scid.into_owned(),
                        hdr.ty,
                        hdr.version,
                    ),
                    Err(e) => {
                        log::debug!("failed to parse QUIC header: {:?}", e);
                        continue;
                    }
                };

            if !self.conns.contains_key(&dcid) {
                if ty != quiche::Type::Initial {
                    log::debug!("non-Initial packet for unknown connection from {}", from);
                    continue;
                }
                if let Err(e) = self.accept_connection(&dcid, &scid, version, from, pkt) {
                    log::debug!("failed to accept connection from {}: {}", from, e);
                }
                continue;
            }

            let local = self.local_addr;
            if let Some(pc) = self.conns.get_mut(&dcid) {
                let recv_info = quiche::RecvInfo { from, to: local };
                match pc.conn.recv(pkt, recv_info) {
                    Ok(_) => drain_streams(pc, out),
                    Err(e) => log::debug!("connection recv error: {:?}", e),
                }
            }
        }

        Ok(())
    }

    fn accept_connection(
        &mut self,
        dcid: &quiche::ConnectionId<'static>,
        scid: &quiche::ConnectionId<'static>,
        version: u32,
        from: SocketAddr,
        pkt: &mut [u8],
    ) -> Result<(), Box<dyn std::error::Error>> {
        if !quiche::version_is_supported(version) {
            log::debug!("version negotiation needed for {:?}", version);
            let len = quiche::negotiate_version(scid, dcid, &mut self.send_buf)?;
            self.socket.send_to(&self.send_buf[..len], from)?;
            return Ok(());
        }

        let mut new_scid = [0u8; quiche::MAX_CONN_ID_LEN];
        self.rng
            .fill(&mut new_scid)
            .map_err(|_| "failed to generate connection id")?;
        let new_scid = quiche::ConnectionId::from_ref(&new_scid).into_owned();

        let conn = quiche::accept(&new_scid, None, self.local_addr, from, &mut self.config)?;

        let id = self.next_id;
        self.next_id += 1;
        log::debug!("new connection from {} (conn {})", from, id);

        self.conns.insert(
            new_scid.clone(),
            PeerConn {
                conn,
                peer: from,
                id,
                stream_id: None,
                handshake: None,
                announced: false,
                in_buf: Vec::new(),
                out_buf: Vec::new(),
                closing: false,
                fin_sent: false,
                close_at: None,
            },
        );
        self.ids.insert(id, new_scid.clone());

        if let Some(pc) = self.conns.get_mut(&new_scid) {
            let recv_info = quiche::RecvInfo {
                from,
                to: self.local_addr,
            };
            pc.conn.recv(pkt, recv_info)?;
        }

        Ok(())
    }

    fn process_timeouts(&mut self) {
        for pc in self.conns.values_mut() {
            pc.conn.on_timeout();
        }
    }

    /// Move queued frames into their QUIC streams.
    fn flush_app_streams(&mut self) {
        for pc in self.conns.values_mut() {
            if pc.out_buf.is_empty() || !pc.conn.is_established() {
                continue;
            }
            let Some(stream_id) = pc.stream_id else {
                continue;
            };
            match pc.conn.stream_send(stream_id, &pc.out_buf, false) {
                Ok(written) => {
                    pc.out_buf.drain(..written);
                }
                Err(quiche::Error::Done) => {}
                Err(e) => {
                    log::debug!("stream send error on conn {}: {:?}", pc.id, e);
                    pc.out_buf.clear();
                }
            }
        }
    }

    /// Advance connections marked close-when-flushed: once their frames are
    /// inside QUIC, finish the stream and close after a short grace.
    fn finish_closing(&mut self) {
        let now = Instant::now();
        for pc in self.conns.values_mut() {
            if !pc.closing || !pc.out_buf.is_empty() {
                continue;
            }
            if !pc.fin_sent {
                if let Some(stream_id) = pc.stream_id {
                    match pc.conn.stream_send(stream_id, &[], true) {
                        Ok(_) | Err(quiche::Error::Done) => {}
                        Err(e) => log::debug!("stream fin error on conn {}: {:?}", pc.id, e),
                    }
                }
                pc.fin_sent = true;
                pc.close_at = Some(now + FLUSH_CLOSE_GRACE);
            } else if pc.close_at.is_some_and(|t| now >= t) {
                let _ = pc.conn.close(true, 0x0, b"done");
                pc.closing = false;
            }
        }
    }

    fn send_pending(&mut self) -> io::Result<()> {
        for pc in self.conns.values_mut() {
            loop {
                match pc.conn.send(&mut self.send_buf) {
                    Ok((len, send_info)) => {
                        match self.socket.send_to(&self.send_buf[..len], send_info.to) {
                            Ok(_) => {}
                            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                            Err(e) => return Err(e),
                        }
                    }
                    Err(quiche::Error::Done) => break,
                    Err(e) => {
                        log::debug!("send error on conn {}: {:?}", pc.id, e);
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    fn cleanup_closed(&mut self, out: &mut Vec<Event>) {
        let closed: Vec<_> = self
            .conns
            .iter()
            .filter(|(_, pc)| pc.conn.is_closed())
            .map(|(key, pc)| (key.clone(), pc.id, pc.announced))
            .collect();

        for (key, id, announced) in closed {
            log::debug!("connection {} closed", id);
            self.conns.remove(&key);
            self.ids.remove(&id);
            if announced {
                out.push(Event::Disconnect { conn: id });
            }
        }
    }

    fn with_conn(&mut self, conn: ConnId) -> Option<&mut PeerConn> {
        let key = self.ids.get(&conn)?;
        self.conns.get_mut(key)
    }
}

impl Transport for QuicTransport {
    fn poll_events(&mut self, budget: Duration, events: &mut Vec<Event>) -> io::Result<()> {
        // flush whatever the previous dispatch round queued before blocking
        self.flush_app_streams();
        self.finish_closing();
        self.send_pending()?;

        // bound the wait by the earliest QUIC timer so retransmissions and
        // idle timeouts stay on schedule
        let timeout = self
            .conns
            .values()
            .filter_map(|pc| pc.conn.timeout())
            .min()
            .map_or(budget, |t| t.min(budget));

        match self.poll.poll(&mut self.mio_events, Some(timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }

        if !self.mio_events.is_empty() {
            self.process_socket(events)?;
        }

        self.process_timeouts();
        self.flush_app_streams();
        self.finish_closing();
        self.send_pending()?;
        self.cleanup_closed(events);

        Ok(())
    }

    fn send(&mut self, conn: ConnId, payload: &[u8]) {
        if payload.len() > MAX_FRAME_LEN {
            log::warn!("refusing to send oversized frame of {} bytes", payload.len());
            return;
        }
        let Some(pc) = self.with_conn(conn) else {
            log::debug!("send on unknown conn {}", conn);
            return;
        };
        pc.out_buf
            .extend_from_slice(&(payload.len() as u32).to_le_bytes());
        pc.out_buf.extend_from_slice(payload);
    }

    fn close(&mut self, conn: ConnId) {
        if let Some(pc) = self.with_conn(conn) {
            let _ = pc.conn.close(false, 0x1, b"closed");
        }
    }

    fn close_when_flushed(&mut self, conn: ConnId) {
        if let Some(pc) = self.with_conn(conn) {
            pc.closing = true;
        }
    }
}

/// Pull stream data out of a connection, reassemble frames, and emit
/// Connect/Receive events. The first frame must be the 4-byte hello.
fn drain_streams(pc: &mut PeerConn, out: &mut Vec<Event>) {
    let readable: Vec<u64> = pc.conn.readable().collect();
    for stream_id in readable {
        if pc.stream_id.is_none() {
            pc.stream_id = Some(stream_id);
        }
        if pc.stream_id != Some(stream_id) {
            log::debug!(
                "data on unexpected stream {} from {}, ignoring",
                stream_id,
                pc.peer
            );
            continue;
        }
        let mut buf = [0u8; 4096];
        loop {
            match pc.conn.stream_recv(stream_id, &mut buf) {
                Ok((n, _fin)) => pc.in_buf.extend_from_slice(&buf[..n]),
                Err(quiche::Error::Done) => break,
                Err(e) => {
                    log::debug!("stream recv error on conn {}: {:?}", pc.id, e);
                    break;
                }
            }
        }
    }

    // peel complete frames off the reassembly buffer
    loop {
        if pc.in_buf.len() < FRAME_HEADER_LEN {
            break;
        }
        let frame_len =
            u32::from_le_bytes([pc.in_buf[0], pc.in_buf[1], pc.in_buf[2], pc.in_buf[3]]) as usize;
        if frame_len > MAX_FRAME_LEN {
            log::debug!(
                "oversized frame ({} bytes) from {}, closing",
                frame_len,
                pc.peer
            );
            let _ = pc.conn.close(false, 0x2, b"oversized frame");
            break;
        }
        if pc.in_buf.len() < FRAME_HEADER_LEN + frame_len {
            break;
        }
        let payload: Vec<u8> = pc.in_buf[FRAME_HEADER_LEN..FRAME_HEADER_LEN + frame_len].to_vec();
        pc.in_buf.drain(..FRAME_HEADER_LEN + frame_len);

        if pc.handshake.is_none() {
            if payload.len() == HELLO_LEN {
                let value = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
                pc.handshake = Some(value);
                pc.announced = true;
                out.push(Event::Connect {
                    conn: pc.id,
                    handshake: value,
                    peer: pc.peer,
                });
            } else {
                log::debug!(
                    "malformed hello ({} bytes) from {}, closing",
                    payload.len(),
                    pc.peer
                );
                let _ = pc.conn.close(false, 0x2, b"bad hello");
                break;
            }
        } else {
            out.push(Event::Receive {
                conn: pc.id,
                payload,
            });
        }
    }
}
