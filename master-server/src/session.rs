//! Per-connection session state
//!
//! A connecting peer presents one opaque 32-bit value; it parses into a
//! request kind or the connection is rejected outright, with no
//! "accept whatever is in range" fallback. The kind fixes the session's
//! role and deadline; the dispatch loop closes any connection whose
//! deadline passes, whether or not the peer ever sends again.

use std::time::{Duration, Instant};

use crate::wire::Endpoint;

/// Deadline for server-role sessions and the NAT connect intent
pub const SERVER_SESSION_TTL: Duration = Duration::from_secs(5);

/// Deadline for a plain list request, which is answered immediately
pub const LIST_SESSION_TTL: Duration = Duration::from_secs(1);

/// What the connecting peer asked for, carried in the transport's
/// connection-time handshake value. A closed enumeration: unrecognized
/// values reject the connection before any packet is processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Fire-and-forget registration; the master disconnects right away
    ServerRegister,
    /// Registration refresh with a description update packet to follow
    ServerUpdate,
    /// One-shot request for the active server listing
    ClientListRequest,
    /// A server collecting the clients waiting to punch through to it
    ServerNatPoll,
    /// A client about to name the server it wants introduced to
    ClientNatConnect,
}

impl RequestKind {
    /// Parse the connection-time handshake value, failing closed.
    pub fn from_handshake(value: u32) -> Option<RequestKind> {
        match value {
            1 => Some(RequestKind::ServerRegister),
            2 => Some(RequestKind::ServerUpdate),
            3 => Some(RequestKind::ClientListRequest),
            4 => Some(RequestKind::ServerNatPoll),
            5 => Some(RequestKind::ClientNatConnect),
            _ => None,
        }
    }

    /// The handshake value a client puts on the wire for this kind.
    pub fn handshake(self) -> u32 {
        match self {
            RequestKind::ServerRegister => 1,
            RequestKind::ServerUpdate => 2,
            RequestKind::ClientListRequest => 3,
            RequestKind::ServerNatPoll => 4,
            RequestKind::ClientNatConnect => 5,
        }
    }
}

/// Which side of the protocol a connection speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

/// Role and deadline bound to one live transport connection. Created at
/// accept, discarded at disconnect; never persisted.
#[derive(Debug)]
pub struct Session {
    pub role: Role,
    pub valid_until: Instant,
    /// The peer's observed endpoint, doubling as a server's identity
    pub peer: Endpoint,
}

impl Session {
    pub fn new(kind: RequestKind, peer: Endpoint, now: Instant) -> Self {
        let (role, ttl) = match kind {
            RequestKind::ServerRegister | RequestKind::ServerUpdate | RequestKind::ServerNatPoll => {
                (Role::Server, SERVER_SESSION_TTL)
            }
            RequestKind::ClientListRequest => (Role::Client, LIST_SESSION_TTL),
            RequestKind::ClientNatConnect => (Role::Client, SERVER_SESSION_TTL),
        };
        Session {
            role,
            valid_until: now + ttl,
            peer,
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.valid_until < now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn peer() -> Endpoint {
        Endpoint::new(Ipv4Addr::new(10, 0, 0, 1), 4321)
    }

    #[test]
    fn test_handshake_values_roundtrip() {
        for kind in [
            RequestKind::ServerRegister,
            RequestKind::ServerUpdate,
            RequestKind::ClientListRequest,
            RequestKind::ServerNatPoll,
            RequestKind::ClientNatConnect,
        ] {
            assert_eq!(RequestKind::from_handshake(kind.handshake()), Some(kind));
        }
    }

    #[test]
    fn test_unrecognized_handshake_values_fail_closed() {
        for value in [0u32, 6, 7, 255, u32::MAX] {
            assert_eq!(RequestKind::from_handshake(value), None, "value {}", value);
        }
    }

    #[test]
    fn test_roles_and_deadlines() {
        let now = Instant::now();
        let s = Session::new(RequestKind::ServerNatPoll, peer(), now);
        assert_eq!(s.role, Role::Server);
        assert_eq!(s.valid_until, now + SERVER_SESSION_TTL);

        let s = Session::new(RequestKind::ClientListRequest, peer(), now);
        assert_eq!(s.role, Role::Client);
        assert_eq!(s.valid_until, now + LIST_SESSION_TTL);

        // the connect intent is client-role but gets the longer window
        let s = Session::new(RequestKind::ClientNatConnect, peer(), now);
        assert_eq!(s.role, Role::Client);
        assert_eq!(s.valid_until, now + SERVER_SESSION_TTL);
    }

    #[test]
    fn test_expiry_is_strictly_after_deadline() {
        let now = Instant::now();
        let s = Session::new(RequestKind::ServerRegister, peer(), now);
        assert!(!s.is_expired(s.valid_until));
        assert!(s.is_expired(s.valid_until + Duration::from_millis(1)));
    }
}
