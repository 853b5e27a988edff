//! The master server dispatch loop
//!
//! Ties the pieces together, once per tick: capture the clock, reap the
//! registry, close connections whose session deadline has passed, then drain
//! transport events and dispatch them. The handshake value decides a
//! connection's fate at accept, the (role, message kind) pair decides what a
//! packet may do. All state mutation happens here, sequentially.

use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::metrics::Metrics;
use crate::registry::{NatCandidate, Registry};
use crate::session::{RequestKind, Role, Session};
use crate::transport::{ConnId, Event, Transport};
use crate::wire::{self, Endpoint, Message, MAX_SEQUENCE_LEN};

/// Time budget handed to the transport each iteration; doubles as the tick
/// granularity bounding how stale an expiry check can be
pub const SERVICE_BUDGET: Duration = Duration::from_millis(100);

/// How often the running server logs a metrics snapshot
const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(60);

/// The rendezvous server core, generic over the transport so tests can
/// drive it with scripted events and synthetic timestamps.
pub struct MasterServer<T: Transport> {
    transport: T,
    registry: Registry,
    sessions: HashMap<ConnId, Session>,
    metrics: Arc<Metrics>,
    event_buf: Vec<Event>,
}

impl<T: Transport> MasterServer<T> {
    pub fn new(transport: T, metrics: Arc<Metrics>) -> Self {
        MasterServer {
            transport,
            registry: Registry::new(),
            sessions: HashMap::new(),
            metrics,
            event_buf: Vec::new(),
        }
    }

    /// Run until the shutdown flag is raised.
    pub fn run(&mut self, shutdown: &AtomicBool) -> io::Result<()> {
        log::info!("dispatch loop running");
        let mut last_snapshot = Instant::now();
        while !shutdown.load(Ordering::Relaxed) {
            let now = Instant::now();
            self.tick(now)?;
            if now.duration_since(last_snapshot) >= SNAPSHOT_INTERVAL {
                log::debug!("metrics:\n{}", self.metrics.render());
                last_snapshot = now;
            }
        }
        log::info!("dispatch loop stopped");
        Ok(())
    }

    /// One iteration of the loop. `now` is captured once by the caller and
    /// used for every expiry decision in the iteration.
    pub fn tick(&mut self, now: Instant) -> io::Result<()> {
        self.registry.reap(now);
        self.sweep_expired_sessions(now);

        let mut events = std::mem::take(&mut self.event_buf);
        events.clear();
        self.transport.poll_events(SERVICE_BUDGET, &mut events)?;
        for event in events.drain(..) {
            match event {
                Event::Connect {
                    conn,
                    handshake,
                    peer,
                } => self.on_connect(conn, handshake, peer, now),
                Event::Receive { conn, payload } => self.on_receive(conn, &payload, now),
                Event::Disconnect { conn } => self.on_disconnect(conn),
            }
        }
        self.event_buf = events;

        self.metrics
            .active_sessions
            .store(self.sessions.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Close every still-connected peer whose session deadline has passed,
    /// whether or not it ever sent anything.
    fn sweep_expired_sessions(&mut self, now: Instant) {
        let expired: Vec<ConnId> = self
            .sessions
            .iter()
            .filter(|(_, session)| session.is_expired(now))
            .map(|(conn, _)| *conn)
            .collect();

        for conn in expired {
            log::debug!("session deadline passed on conn {}, closing", conn);
            self.metrics
                .expired_sessions_total
                .fetch_add(1, Ordering::Relaxed);
            self.close_conn(conn);
        }
    }

    fn on_connect(&mut self, conn: ConnId, handshake: u32, peer: SocketAddr, now: Instant) {
        let Some(kind) = RequestKind::from_handshake(handshake) else {
            log::debug!(
                "rejecting {} (conn {}): unrecognized handshake value {}",
                peer,
                conn,
                handshake
            );
            self.metrics
                .handshake_rejections_total
                .fetch_add(1, Ordering::Relaxed);
            self.transport.close(conn);
            return;
        };

        let SocketAddr::V4(peer_v4) = peer else {
            log::debug!("rejecting {} (conn {}): not an IPv4 peer", peer, conn);
            self.transport.close(conn);
            return;
        };
        let identity = Endpoint::new(*peer_v4.ip(), peer_v4.port());

        self.sessions.insert(conn, Session::new(kind, identity, now));

        match kind {
            RequestKind::ServerRegister => {
                log::info!("server {} registered", identity);
                self.registry.refresh_or_insert(identity, now);
                self.metrics
                    .registrations_total
                    .fetch_add(1, Ordering::Relaxed);
                // fire-and-forget RPC: one connection per registration
                self.close_conn(conn);
            }
            RequestKind::ServerUpdate => {
                log::info!("server {} refreshing, update packet expected", identity);
                self.registry.refresh_or_insert(identity, now);
                self.metrics
                    .registrations_total
                    .fetch_add(1, Ordering::Relaxed);
            }
            RequestKind::ClientListRequest => {
                log::info!("client {} requesting the server list", identity);
                self.metrics
                    .list_requests_total
                    .fetch_add(1, Ordering::Relaxed);
                let mut servers = self.registry.list_active(now);
                if servers.len() > MAX_SEQUENCE_LEN {
                    log::warn!(
                        "active listing of {} servers exceeds the wire cap, truncating",
                        servers.len()
                    );
                    servers.truncate(MAX_SEQUENCE_LEN);
                }
                self.send_message(conn, &Message::ServerList { servers });
                self.finish_conn(conn);
            }
            RequestKind::ServerNatPoll => {
                log::info!("server {} polling for NAT candidates", identity);
                self.registry.refresh_or_insert(identity, now);
                self.metrics
                    .registrations_total
                    .fetch_add(1, Ordering::Relaxed);
                let drained = self.registry.drain_nat_candidates(identity);
                self.metrics
                    .nat_candidates_drained_total
                    .fetch_add(drained.len() as u64, Ordering::Relaxed);
                let peers = drained.iter().map(|candidate| candidate.public).collect();
                self.send_message(conn, &Message::NatPeerList { peers });
                // stays open; the session deadline bounds its lifetime
            }
            RequestKind::ClientNatConnect => {
                log::info!("client {} opening a NAT punch intent", identity);
                // nothing to do until the punch request packet arrives
            }
        }
    }

    fn on_receive(&mut self, conn: ConnId, payload: &[u8], now: Instant) {
        let Some(session) = self.sessions.get(&conn) else {
            // closed earlier this tick, or never accepted
            return;
        };
        let (role, peer) = (session.role, session.peer);

        let msg = match wire::decode(payload) {
            Ok(msg) => msg,
            Err(e) => {
                log::debug!("malformed packet from {} (conn {}): {}", peer, conn, e);
                self.metrics
                    .malformed_packets_total
                    .fetch_add(1, Ordering::Relaxed);
                self.close_conn(conn);
                return;
            }
        };

        match (role, msg) {
            (Role::Server, Message::ServerUpdate { description }) => {
                log::debug!("server {} description update", peer);
                self.registry.update_description(peer, &description, now);
                self.metrics
                    .server_updates_total
                    .fetch_add(1, Ordering::Relaxed);
            }
            (Role::Client, Message::NatPunchRequest { target }) => {
                self.metrics
                    .nat_punch_requests_total
                    .fetch_add(1, Ordering::Relaxed);
                if !self.registry.contains(target) {
                    // deliberately silent on the wire: confirming which
                    // servers exist would let a prober map the registry
                    log::info!(
                        "NAT punch request from {} names unknown server {}",
                        peer,
                        target
                    );
                    return;
                }
                log::info!("queueing NAT candidate {} for server {}", peer, target);
                let candidate = NatCandidate {
                    public: peer,
                    local: Endpoint::new(Ipv4Addr::UNSPECIFIED, 0),
                };
                if !self.registry.register_nat_candidate(target, candidate, now) {
                    log::debug!("candidate queue for {} is full, dropping {}", target, peer);
                    self.metrics
                        .nat_candidates_dropped_total
                        .fetch_add(1, Ordering::Relaxed);
                }
                // one-shot request
                self.finish_conn(conn);
            }
            (role, _) => {
                log::debug!(
                    "ignoring message not valid for {:?} connection {} from {}",
                    role,
                    conn,
                    peer
                );
            }
        }
    }

    fn on_disconnect(&mut self, conn: ConnId) {
        if self.sessions.remove(&conn).is_some() {
            log::debug!("conn {} disconnected", conn);
        }
    }

    fn send_message(&mut self, conn: ConnId, msg: &Message) {
        match wire::encode(msg) {
            Ok(bytes) => self.transport.send(conn, &bytes),
            Err(e) => log::warn!("failed to encode reply for conn {}: {}", conn, e),
        }
    }

    /// Close immediately and discard the session; no further events for this
    /// connection are processed.
    fn close_conn(&mut self, conn: ConnId) {
        self.sessions.remove(&conn);
        self.transport.close(conn);
    }

    /// Close once the reply has flushed; the session is discarded right away
    /// so no further packets are serviced.
    fn finish_conn(&mut self, conn: ConnId) {
        self.sessions.remove(&conn);
        self.transport.close_when_flushed(conn);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::net::SocketAddrV4;

    /// Transport double: events are scripted per tick, outputs recorded.
    #[derive(Default)]
    struct ScriptedTransport {
        pending: VecDeque<Event>,
        sent: Vec<(ConnId, Vec<u8>)>,
        closed: Vec<ConnId>,
        flushed: Vec<ConnId>,
    }

    impl Transport for ScriptedTransport {
        fn poll_events(&mut self, _budget: Duration, events: &mut Vec<Event>) -> io::Result<()> {
            events.extend(self.pending.drain(..));
            Ok(())
        }

        fn send(&mut self, conn: ConnId, payload: &[u8]) {
            self.sent.push((conn, payload.to_vec()));
        }

        fn close(&mut self, conn: ConnId) {
            self.closed.push(conn);
        }

        fn close_when_flushed(&mut self, conn: ConnId) {
            self.flushed.push(conn);
        }
    }

    fn master() -> MasterServer<ScriptedTransport> {
        MasterServer::new(ScriptedTransport::default(), Arc::new(Metrics::new()))
    }

    fn endpoint(last_octet: u8, port: u16) -> Endpoint {
        Endpoint::new(Ipv4Addr::new(10, 0, 0, last_octet), port)
    }

    fn sock(endpoint: Endpoint) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(endpoint.address, endpoint.port))
    }

    fn connect(m: &mut MasterServer<ScriptedTransport>, conn: ConnId, handshake: u32, e: Endpoint) {
        m.transport.pending.push_back(Event::Connect {
            conn,
            handshake,
            peer: sock(e),
        });
    }

    fn receive(m: &mut MasterServer<ScriptedTransport>, conn: ConnId, msg: &Message) {
        m.transport.pending.push_back(Event::Receive {
            conn,
            payload: wire::encode(msg).unwrap(),
        });
    }

    fn last_sent_to(m: &MasterServer<ScriptedTransport>, conn: ConnId) -> Message {
        let (_, payload) = m
            .transport
            .sent
            .iter()
            .rev()
            .find(|(c, _)| *c == conn)
            .expect("nothing was sent on that conn");
        wire::decode(payload).unwrap()
    }

    #[test]
    fn test_registration_appears_in_next_listing() {
        let t0 = Instant::now();
        let mut m = master();

        connect(&mut m, 1, RequestKind::ServerRegister.handshake(), endpoint(1, 7777));
        m.tick(t0).unwrap();
        // fire-and-forget: the registering connection is closed at once
        assert_eq!(m.transport.closed, vec![1]);

        connect(&mut m, 2, RequestKind::ClientListRequest.handshake(), endpoint(9, 4000));
        m.tick(t0 + Duration::from_secs(1)).unwrap();

        match last_sent_to(&m, 2) {
            Message::ServerList { servers } => {
                assert_eq!(servers.len(), 1);
                assert_eq!(servers[0].endpoint, endpoint(1, 7777));
            }
            other => panic!("expected a server list, got {:?}", other),
        }
        // one-shot: listing connections close after the reply flushes
        assert_eq!(m.transport.flushed, vec![2]);
    }

    #[test]
    fn test_unrefreshed_registration_expires() {
        let t0 = Instant::now();
        let mut m = master();

        connect(&mut m, 1, RequestKind::ServerRegister.handshake(), endpoint(1, 7777));
        m.tick(t0).unwrap();

        connect(&mut m, 2, RequestKind::ClientListRequest.handshake(), endpoint(9, 4000));
        m.tick(t0 + Duration::from_secs(61)).unwrap();

        match last_sent_to(&m, 2) {
            Message::ServerList { servers } => assert!(servers.is_empty()),
            other => panic!("expected a server list, got {:?}", other),
        }
    }

    #[test]
    fn test_punch_request_reaches_polling_server() {
        let t0 = Instant::now();
        let mut m = master();
        let server = endpoint(1, 7777);
        let client = endpoint(50, 4444);

        connect(&mut m, 1, RequestKind::ServerRegister.handshake(), server);
        m.tick(t0).unwrap();

        connect(&mut m, 2, RequestKind::ClientNatConnect.handshake(), client);
        receive(&mut m, 2, &Message::NatPunchRequest { target: server });
        m.tick(t0 + Duration::from_secs(1)).unwrap();
        // the punch request is a one-shot
        assert_eq!(m.transport.flushed, vec![2]);

        connect(&mut m, 3, RequestKind::ServerNatPoll.handshake(), server);
        m.tick(t0 + Duration::from_secs(2)).unwrap();

        match last_sent_to(&m, 3) {
            Message::NatPeerList { peers } => assert_eq!(peers, vec![client]),
            other => panic!("expected a NAT peer list, got {:?}", other),
        }
        // the polling connection stays open for the server to read
        assert!(!m.transport.closed.contains(&3));
        assert!(!m.transport.flushed.contains(&3));
    }

    #[test]
    fn test_punch_request_for_unknown_server_is_silent() {
        let t0 = Instant::now();
        let mut m = master();
        let server = endpoint(1, 7777);

        connect(&mut m, 1, RequestKind::ServerRegister.handshake(), server);
        m.tick(t0).unwrap();

        connect(&mut m, 2, RequestKind::ClientNatConnect.handshake(), endpoint(50, 4444));
        receive(
            &mut m,
            2,
            &Message::NatPunchRequest {
                target: endpoint(99, 9999),
            },
        );
        m.tick(t0 + Duration::from_secs(1)).unwrap();

        // no response went out and nothing was queued anywhere
        assert!(m.transport.sent.is_empty());
        connect(&mut m, 3, RequestKind::ServerNatPoll.handshake(), server);
        m.tick(t0 + Duration::from_secs(2)).unwrap();
        match last_sent_to(&m, 3) {
            Message::NatPeerList { peers } => assert!(peers.is_empty()),
            other => panic!("expected a NAT peer list, got {:?}", other),
        }
    }

    #[test]
    fn test_drained_candidates_are_handed_over_exactly_once() {
        let t0 = Instant::now();
        let mut m = master();
        let server = endpoint(1, 7777);

        connect(&mut m, 1, RequestKind::ServerRegister.handshake(), server);
        connect(&mut m, 2, RequestKind::ClientNatConnect.handshake(), endpoint(50, 4444));
        receive(&mut m, 2, &Message::NatPunchRequest { target: server });
        m.tick(t0).unwrap();

        connect(&mut m, 3, RequestKind::ServerNatPoll.handshake(), server);
        m.tick(t0 + Duration::from_secs(1)).unwrap();
        connect(&mut m, 4, RequestKind::ServerNatPoll.handshake(), server);
        m.tick(t0 + Duration::from_secs(2)).unwrap();

        match last_sent_to(&m, 3) {
            Message::NatPeerList { peers } => assert_eq!(peers.len(), 1),
            other => panic!("expected a NAT peer list, got {:?}", other),
        }
        match last_sent_to(&m, 4) {
            Message::NatPeerList { peers } => assert!(peers.is_empty()),
            other => panic!("expected a NAT peer list, got {:?}", other),
        }
    }

    #[test]
    fn test_eleventh_distinct_candidate_is_dropped() {
        let t0 = Instant::now();
        let mut m = master();
        let server = endpoint(1, 7777);

        connect(&mut m, 1, RequestKind::ServerRegister.handshake(), server);
        m.tick(t0).unwrap();

        for i in 0..11u8 {
            let conn = 10 + ConnId::from(i);
            connect(
                &mut m,
                conn,
                RequestKind::ClientNatConnect.handshake(),
                endpoint(100 + i, 4000 + u16::from(i)),
            );
            receive(&mut m, conn, &Message::NatPunchRequest { target: server });
        }
        m.tick(t0 + Duration::from_secs(1)).unwrap();

        connect(&mut m, 99, RequestKind::ServerNatPoll.handshake(), server);
        m.tick(t0 + Duration::from_secs(2)).unwrap();

        match last_sent_to(&m, 99) {
            Message::NatPeerList { peers } => {
                assert_eq!(peers.len(), 10);
                assert!(!peers.contains(&endpoint(110, 4010)));
            }
            other => panic!("expected a NAT peer list, got {:?}", other),
        }
        assert_eq!(
            m.metrics.nat_candidates_dropped_total.load(Ordering::Relaxed),
            1
        );
    }

    #[test]
    fn test_unrecognized_handshake_is_rejected_before_any_packet() {
        let t0 = Instant::now();
        let mut m = master();

        for (conn, value) in [(1, 0u32), (2, 6), (3, u32::MAX)] {
            connect(&mut m, conn, value, endpoint(5, 5000));
        }
        m.tick(t0).unwrap();

        assert_eq!(m.transport.closed, vec![1, 2, 3]);
        assert!(m.sessions.is_empty());
        assert_eq!(
            m.metrics.handshake_rejections_total.load(Ordering::Relaxed),
            3
        );

        // a stray packet on a rejected connection is not serviced
        receive(&mut m, 1, &Message::ServerUpdate { description: "x".into() });
        m.tick(t0 + Duration::from_millis(100)).unwrap();
        assert!(m.registry.is_empty());
    }

    #[test]
    fn test_session_deadline_closes_silent_connection() {
        let t0 = Instant::now();
        let mut m = master();

        connect(&mut m, 1, RequestKind::ClientNatConnect.handshake(), endpoint(5, 5000));
        m.tick(t0).unwrap();
        assert!(m.transport.closed.is_empty());

        // never sends, never disconnects; the sweep closes it anyway
        m.tick(t0 + Duration::from_secs(6)).unwrap();
        assert_eq!(m.transport.closed, vec![1]);
        assert!(m.sessions.is_empty());
        assert_eq!(m.metrics.expired_sessions_total.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_list_request_is_answered_and_finished_at_once() {
        let t0 = Instant::now();
        let mut m = master();

        connect(&mut m, 1, RequestKind::ClientListRequest.handshake(), endpoint(5, 5000));
        m.tick(t0).unwrap();
        // answered and flush-closed immediately, session already gone
        assert!(m.sessions.is_empty());
        assert_eq!(m.transport.flushed, vec![1]);
    }

    #[test]
    fn test_malformed_packet_closes_connection() {
        let t0 = Instant::now();
        let mut m = master();

        connect(&mut m, 1, RequestKind::ClientNatConnect.handshake(), endpoint(5, 5000));
        m.transport.pending.push_back(Event::Receive {
            conn: 1,
            payload: vec![0xFF, 0x00, 0x01],
        });
        m.tick(t0).unwrap();

        assert_eq!(m.transport.closed, vec![1]);
        assert!(m.sessions.is_empty());
        assert_eq!(m.metrics.malformed_packets_total.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_message_for_wrong_role_is_ignored() {
        let t0 = Instant::now();
        let mut m = master();
        let server = endpoint(1, 7777);

        // a server-role connection sending a client punch request
        connect(&mut m, 1, RequestKind::ServerUpdate.handshake(), server);
        receive(&mut m, 1, &Message::NatPunchRequest { target: server });
        // a client-role connection sending a server update
        connect(&mut m, 2, RequestKind::ClientNatConnect.handshake(), endpoint(5, 5000));
        receive(&mut m, 2, &Message::ServerUpdate { description: "sneaky".into() });
        m.tick(t0).unwrap();

        // neither had any effect, neither connection was closed
        assert!(m.registry.drain_nat_candidates(server).is_empty());
        assert!(m
            .registry
            .list_active(t0)
            .iter()
            .all(|s| s.description != "sneaky"));
        assert!(m.transport.closed.is_empty());
    }

    #[test]
    fn test_server_update_packet_overwrites_description() {
        let t0 = Instant::now();
        let mut m = master();
        let server = endpoint(1, 7777);

        connect(&mut m, 1, RequestKind::ServerUpdate.handshake(), server);
        receive(&mut m, 1, &Message::ServerUpdate { description: "duel arena".into() });
        m.tick(t0).unwrap();

        connect(&mut m, 2, RequestKind::ClientListRequest.handshake(), endpoint(9, 4000));
        m.tick(t0 + Duration::from_secs(1)).unwrap();
        match last_sent_to(&m, 2) {
            Message::ServerList { servers } => {
                assert_eq!(servers.len(), 1);
                assert_eq!(servers[0].description, "duel arena");
            }
            other => panic!("expected a server list, got {:?}", other),
        }
    }

    #[test]
    fn test_disconnect_discards_session() {
        let t0 = Instant::now();
        let mut m = master();

        connect(&mut m, 1, RequestKind::ClientNatConnect.handshake(), endpoint(5, 5000));
        m.tick(t0).unwrap();
        assert_eq!(m.sessions.len(), 1);

        m.transport.pending.push_back(Event::Disconnect { conn: 1 });
        m.tick(t0 + Duration::from_millis(100)).unwrap();
        assert!(m.sessions.is_empty());
    }

    #[test]
    fn test_non_ipv4_peer_is_rejected() {
        let t0 = Instant::now();
        let mut m = master();

        m.transport.pending.push_back(Event::Connect {
            conn: 1,
            handshake: RequestKind::ClientListRequest.handshake(),
            peer: "[::1]:4000".parse().unwrap(),
        });
        m.tick(t0).unwrap();

        assert_eq!(m.transport.closed, vec![1]);
        assert!(m.sessions.is_empty());
    }
}
