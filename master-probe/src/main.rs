//! Master server probe
//!
//! A diagnostic client that exercises each request kind of the master server
//! protocol, acting as a game server or a game client.
//!
//! Usage:
//!   master-probe --master 127.0.0.1:5902 register
//!   master-probe --master 127.0.0.1:5902 update "my server"
//!   master-probe --master 127.0.0.1:5902 list
//!   master-probe --master 127.0.0.1:5902 nat-poll
//!   master-probe --master 127.0.0.1:5902 punch 203.0.113.5:5910

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::{Duration, Instant};

use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token};
use ring::rand::{SecureRandom, SystemRandom};

// ============================================================================
// Constants (MUST match master-server)
// ============================================================================

/// Maximum UDP payload size for QUIC packets
const MAX_DATAGRAM_SIZE: usize = 1350;

/// ALPN protocol identifier (CRITICAL: must match the master server)
const ALPN_PROTOCOL: &[u8] = b"master/1";

/// Length of the frame header (must match master-server/src/transport.rs)
const FRAME_HEADER_LEN: usize = 4;

/// Handshake values (must match master-server/src/session.rs)
const HS_SERVER_REGISTER: u32 = 1;
const HS_SERVER_UPDATE: u32 = 2;
const HS_CLIENT_LIST: u32 = 3;
const HS_SERVER_NAT_POLL: u32 = 4;
const HS_CLIENT_NAT_CONNECT: u32 = 5;

/// Message kind tags (must match master-server/src/wire.rs)
const KIND_SERVER_UPDATE: u8 = 0;
const KIND_SERVER_LIST: u8 = 1;
const KIND_NAT_PEER_LIST: u8 = 2;
const KIND_NAT_PUNCH_REQUEST: u8 = 3;

/// Overall probe deadline
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// mio token for the QUIC socket
const QUIC_SOCKET: Token = Token(0);

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "-h" || a == "--help") {
        print_usage();
        return Ok(());
    }

    let master_addr = parse_arg(&args, "--master").unwrap_or_else(|| "127.0.0.1:5902".to_string());
    let master_addr: SocketAddr = master_addr.parse().map_err(|_| "invalid master address")?;

    let mut positional: Vec<String> = Vec::new();
    let mut i = 1;
    while i < args.len() {
        if args[i] == "--master" {
            i += 2;
            continue;
        }
        positional.push(args[i].clone());
        i += 1;
    }
    let mode = positional.first().map(|s| s.as_str()).unwrap_or("list");

    // each mode is one connection: handshake value, optional follow-up
    // packet, and whether a reply is expected back
    let (handshake, packet, want_reply) = match mode {
        "register" => (HS_SERVER_REGISTER, None, false),
        "update" => {
            let descr = positional
                .get(1)
                .map(|s| s.to_string())
                .unwrap_or_else(|| "probe server".to_string());
            (HS_SERVER_UPDATE, Some(encode_server_update(&descr)?), false)
        }
        "list" => (HS_CLIENT_LIST, None, true),
        "nat-poll" => (HS_SERVER_NAT_POLL, None, true),
        "punch" => {
            let target: SocketAddrV4 = positional
                .get(1)
                .ok_or("punch needs a target address:port")?
                .parse()
                .map_err(|_| "invalid punch target")?;
            (
                HS_CLIENT_NAT_CONNECT,
                Some(encode_punch_request(*target.ip(), target.port())),
                false,
            )
        }
        other => {
            print_usage();
            return Err(format!("unknown mode '{}'", other).into());
        }
    };

    log::info!("probing {} ({})", master_addr, mode);
    let reply = run_probe(master_addr, handshake, packet, want_reply)?;

    match reply {
        Some(payload) => print_reply(&payload),
        None if want_reply => println!("connection ended without a reply"),
        None => println!("done"),
    }

    Ok(())
}

fn print_usage() {
    println!("master-probe [--master addr:port] <mode>");
    println!("  modes:");
    println!("    register           register this endpoint as a game server");
    println!("    update <descr>     refresh and update the server description");
    println!("    list               fetch the active server listing");
    println!("    nat-poll           collect NAT candidates waiting for this server");
    println!("    punch <addr:port>  request a NAT introduction to a server");
}

fn parse_arg(args: &[String], name: &str) -> Option<String> {
    args.iter()
        .position(|a| a == name)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

// ============================================================================
// Probe connection
// ============================================================================

fn run_probe(
    master_addr: SocketAddr,
    handshake: u32,
    packet: Option<Vec<u8>>,
    want_reply: bool,
) -> Result<Option<Vec<u8>>, Box<dyn std::error::Error>> {
    let mut poll = Poll::new()?;
    let mut events = Events::with_capacity(64);

    let bind_addr: SocketAddr = "0.0.0.0:0".parse()?;
    let mut socket = UdpSocket::bind(bind_addr)?;
    poll.registry()
        .register(&mut socket, QUIC_SOCKET, Interest::READABLE)?;
    let local_addr = socket.local_addr()?;

    let mut config = quiche::Config::new(quiche::PROTOCOL_VERSION)?;
    config.verify_peer(false);
    config.set_application_protos(&[ALPN_PROTOCOL])?;
    config.set_max_idle_timeout(30_000);
    config.set_initial_max_data(1_000_000);
    config.set_initial_max_stream_data_bidi_local(1_000_000);
    config.set_initial_max_stream_data_bidi_remote(1_000_000);
    config.set_initial_max_streams_bidi(10);
    config.set_initial_max_streams_uni(10);
    config.set_max_recv_udp_payload_size(MAX_DATAGRAM_SIZE);
    config.set_max_send_udp_payload_size(MAX_DATAGRAM_SIZE);

    let mut scid = [0u8; quiche::MAX_CONN_ID_LEN];
    SystemRandom::new()
        .fill(&mut scid)
        .map_err(|_| "failed to generate connection id")?;
    let scid = quiche::ConnectionId::from_ref(&scid);
    let mut conn = quiche::connect(Some("localhost"), &scid, local_addr, master_addr, &mut config)?;

    let mut buf = vec![0u8; 65535];
    let mut out = vec![0u8; MAX_DATAGRAM_SIZE];
    let mut hello_sent = false;
    let mut packet_sent = false;
    let mut stream_buf: Vec<u8> = Vec::new();
    let mut reply: Option<Vec<u8>> = None;
    let deadline = Instant::now() + PROBE_TIMEOUT;

    loop {
        // flush pending QUIC packets
        loop {
            match conn.send(&mut out) {
                Ok((len, send_info)) => {
                    socket.send_to(&out[..len], send_info.to)?;
                }
                Err(quiche::Error::Done) => break,
                Err(e) => {
                    log::debug!("QUIC send error: {:?}", e);
                    break;
                }
            }
        }

        if conn.is_closed() || (want_reply && reply.is_some()) || Instant::now() >= deadline {
            break;
        }

        if conn.is_established() {
            if !hello_sent {
                send_frame(&mut conn, &handshake.to_le_bytes())?;
                hello_sent = true;
            }
            if !packet_sent {
                if let Some(payload) = &packet {
                    send_frame(&mut conn, payload)?;
                }
                packet_sent = true;
            }
        }

        let timeout = conn.timeout().map_or(Duration::from_millis(100), |t| {
            t.min(Duration::from_millis(100))
        });
        poll.poll(&mut events, Some(timeout))?;

        if events.is_empty() {
            conn.on_timeout();
        }

        // drain the socket
        loop {
            let (len, from) = match socket.recv_from(&mut buf) {
                Ok(v) => v,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            };
            let recv_info = quiche::RecvInfo {
                from,
                to: local_addr,
            };
            if let Err(e) = conn.recv(&mut buf[..len], recv_info) {
                log::debug!("QUIC recv error: {:?}", e);
            }
        }

        // collect reply frames
        let readable: Vec<u64> = conn.readable().collect();
        for stream_id in readable {
            let mut sbuf = [0u8; 4096];
            while let Ok((n, _fin)) = conn.stream_recv(stream_id, &mut sbuf) {
                stream_buf.extend_from_slice(&sbuf[..n]);
            }
        }
        if reply.is_none() && stream_buf.len() >= FRAME_HEADER_LEN {
            let frame_len =
                u32::from_le_bytes([stream_buf[0], stream_buf[1], stream_buf[2], stream_buf[3]])
                    as usize;
            if stream_buf.len() >= FRAME_HEADER_LEN + frame_len {
                reply = Some(stream_buf[FRAME_HEADER_LEN..FRAME_HEADER_LEN + frame_len].to_vec());
            }
        }
    }

    if !hello_sent {
        return Err(format!("could not reach the master at {}", master_addr).into());
    }

    conn.close(true, 0, b"probe done").ok();
    if let Ok((len, send_info)) = conn.send(&mut out) {
        socket.send_to(&out[..len], send_info.to).ok();
    }

    Ok(reply)
}

fn send_frame(
    conn: &mut quiche::Connection,
    payload: &[u8],
) -> Result<(), Box<dyn std::error::Error>> {
    let mut framed = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    framed.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    framed.extend_from_slice(payload);
    match conn.stream_send(0, &framed, false) {
        Ok(_) | Err(quiche::Error::Done) => Ok(()),
        Err(e) => Err(format!("stream send failed: {:?}", e).into()),
    }
}

// ============================================================================
// Wire helpers (MUST match master-server/src/wire.rs)
// ============================================================================

fn write_size(buf: &mut Vec<u8>, size: u32) {
    if size <= 251 {
        buf.push(size as u8);
        return;
    }
    let width: usize = if size <= 0xFF {
        1
    } else if size <= 0xFFFF {
        2
    } else if size <= 0xFF_FFFF {
        3
    } else {
        4
    };
    buf.push(251 + width as u8);
    buf.extend_from_slice(&size.to_le_bytes()[..width]);
}

fn read_size(buf: &[u8], pos: &mut usize) -> Option<u32> {
    let first = *buf.get(*pos)?;
    *pos += 1;
    if first <= 251 {
        return Some(u32::from(first));
    }
    let width = usize::from(first - 251);
    let raw = buf.get(*pos..*pos + width)?;
    *pos += width;
    let mut bytes = [0u8; 4];
    bytes[..width].copy_from_slice(raw);
    Some(u32::from_le_bytes(bytes))
}

fn encode_server_update(description: &str) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    if description.len() > 255 {
        return Err("description longer than 255 bytes".into());
    }
    let mut buf = vec![KIND_SERVER_UPDATE];
    write_size(&mut buf, description.len() as u32);
    buf.extend_from_slice(description.as_bytes());
    Ok(buf)
}

fn encode_punch_request(address: Ipv4Addr, port: u16) -> Vec<u8> {
    let mut buf = vec![KIND_NAT_PUNCH_REQUEST];
    buf.extend_from_slice(&u32::from(address).to_le_bytes());
    buf.extend_from_slice(&port.to_le_bytes());
    buf
}

fn read_endpoint(buf: &[u8], pos: &mut usize) -> Option<(Ipv4Addr, u16)> {
    let raw = buf.get(*pos..*pos + 4)?;
    let address = Ipv4Addr::from(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]));
    *pos += 4;
    let raw = buf.get(*pos..*pos + 2)?;
    let port = u16::from_le_bytes([raw[0], raw[1]]);
    *pos += 2;
    Some((address, port))
}

fn print_reply(payload: &[u8]) {
    match payload.first() {
        Some(&KIND_SERVER_LIST) => {
            let mut pos = 1usize;
            // skip the redundant explicit count
            pos += 8;
            let Some(len) = read_size(payload, &mut pos) else {
                println!("truncated server list");
                return;
            };
            println!("server list ({} entries):", len);
            for _ in 0..len {
                let Some((address, port)) = read_endpoint(payload, &mut pos) else {
                    println!("  ...truncated");
                    return;
                };
                let Some(str_len) = read_size(payload, &mut pos) else {
                    println!("  ...truncated");
                    return;
                };
                let descr = payload
                    .get(pos..pos + str_len as usize)
                    .map(|raw| String::from_utf8_lossy(raw).into_owned())
                    .unwrap_or_default();
                pos += str_len as usize;
                println!("  {}:{}  {}", address, port, descr);
            }
        }
        Some(&KIND_NAT_PEER_LIST) => {
            let mut pos = 1usize;
            // skip the explicit 16-bit count
            pos += 2;
            let Some(len) = read_size(payload, &mut pos) else {
                println!("truncated NAT peer list");
                return;
            };
            println!("NAT peers waiting ({}):", len);
            for _ in 0..len {
                match read_endpoint(payload, &mut pos) {
                    Some((address, port)) => println!("  {}:{}", address, port),
                    None => {
                        println!("  ...truncated");
                        return;
                    }
                }
            }
        }
        Some(tag) => println!("unexpected reply tag {}", tag),
        None => println!("empty reply"),
    }
}
