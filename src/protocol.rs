//! Packet framing and the handful of packets the connection lifecycle needs.
//!
//! Every packet is `[u24 payload_len][u8 seq][payload]`. A payload of exactly
//! [`MAX_PAYLOAD_LEN`] bytes means the logical packet continues in the next
//! one; the final part is shorter (possibly empty).

use crate::constants::*;

/// Result of attempting to parse one packet header from a byte buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseResult {
    /// A whole packet is buffered. Contains the payload length and the total
    /// bytes the packet occupies including its header.
    Complete {
        payload_len: usize,
        bytes_consumed: usize,
    },
    /// Need more data. Contains minimum bytes still needed.
    Incomplete(usize),
}

/// Try to parse a single (physical) packet from the front of `buf`.
pub fn try_parse_packet(buf: &[u8]) -> ParseResult {
    if buf.len() < HEADER_LEN {
        return ParseResult::Incomplete(HEADER_LEN - buf.len());
    }
    let payload_len = payload_len(buf);
    let total = HEADER_LEN + payload_len;
    if buf.len() < total {
        return ParseResult::Incomplete(total - buf.len());
    }
    ParseResult::Complete {
        payload_len,
        bytes_consumed: total,
    }
}

/// Payload length from a packet header. `buf` must hold at least a header.
pub fn payload_len(buf: &[u8]) -> usize {
    u32::from_le_bytes([buf[0], buf[1], buf[2], 0]) as usize
}

pub fn sequence(buf: &[u8]) -> u8 {
    buf[3]
}

/// First payload byte of the packet at the front of `buf`, if any.
pub fn command(buf: &[u8]) -> Option<u8> {
    if buf.len() > HEADER_LEN && payload_len(buf) > 0 {
        Some(buf[HEADER_LEN])
    } else {
        None
    }
}

/// Bytes occupied by the first complete logical packet of `buf`, following
/// continuation parts. `None` if it is not fully buffered.
pub fn logical_packet_len(buf: &[u8]) -> Option<usize> {
    let mut offset = 0;
    loop {
        match try_parse_packet(&buf[offset..]) {
            ParseResult::Complete {
                payload_len,
                bytes_consumed,
            } => {
                offset += bytes_consumed;
                if payload_len < MAX_PAYLOAD_LEN {
                    return Some(offset);
                }
            }
            ParseResult::Incomplete(_) => return None,
        }
    }
}

/// Length of the longest prefix of `buf` made only of complete logical packets.
pub fn complete_packets_len(buf: &[u8]) -> usize {
    let mut offset = 0;
    while let Some(len) = logical_packet_len(&buf[offset..]) {
        offset += len;
    }
    offset
}

/// A logical packet with the continuation parts joined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Sequence id of the last physical part.
    pub seq: u8,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn first_byte(&self) -> Option<u8> {
        self.payload.first().copied()
    }

    pub fn is_ok(&self) -> bool {
        self.first_byte() == Some(OK_HEADER)
    }

    pub fn is_err(&self) -> bool {
        self.first_byte() == Some(ERR_HEADER)
    }
}

/// Remove the first complete logical packet from `buf`.
pub fn read_packet(buf: &mut Vec<u8>) -> Option<Packet> {
    let total = logical_packet_len(buf)?;
    let mut payload = Vec::with_capacity(total);
    let mut offset = 0;
    let mut seq = 0;
    while offset < total {
        let len = payload_len(&buf[offset..]);
        seq = sequence(&buf[offset..]);
        payload.extend_from_slice(&buf[offset + HEADER_LEN..offset + HEADER_LEN + len]);
        offset += HEADER_LEN + len;
    }
    buf.drain(..total);
    Some(Packet { seq, payload })
}

/// Append `payload` to `out` as one or more packets starting at `seq`.
/// Returns the sequence id following the last part written.
pub fn write_packet(out: &mut Vec<u8>, seq: u8, payload: &[u8]) -> u8 {
    let mut seq = seq;
    let mut rest = payload;
    loop {
        let len = rest.len().min(MAX_PAYLOAD_LEN);
        out.extend_from_slice(&(len as u32).to_le_bytes()[..3]);
        out.push(seq);
        out.extend_from_slice(&rest[..len]);
        seq = seq.wrapping_add(1);
        rest = &rest[len..];
        if len < MAX_PAYLOAD_LEN {
            return seq;
        }
    }
}

pub fn packet(seq: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    write_packet(&mut out, seq, payload);
    out
}

/// Sequential reader over a packet payload. Every getter returns `None` on
/// truncated input instead of panicking.
pub struct PayloadReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn rest(&mut self) -> &'a [u8] {
        let rest = &self.buf[self.pos..];
        self.pos = self.buf.len();
        rest
    }

    pub fn skip(&mut self, n: usize) -> Option<()> {
        self.bytes(n).map(|_| ())
    }

    pub fn bytes(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let out = self.buf.get(self.pos..end)?;
        self.pos = end;
        Some(out)
    }

    pub fn u8(&mut self) -> Option<u8> {
        self.bytes(1).map(|b| b[0])
    }

    pub fn u16(&mut self) -> Option<u16> {
        self.bytes(2).map(|b| u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn u24(&mut self) -> Option<u32> {
        self.bytes(3).map(|b| u32::from_le_bytes([b[0], b[1], b[2], 0]))
    }

    pub fn u32(&mut self) -> Option<u32> {
        self.bytes(4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Null-terminated string. A missing terminator consumes the rest.
    pub fn null_str(&mut self) -> Option<&'a [u8]> {
        let rest = self.buf.get(self.pos..)?;
        match rest.iter().position(|&b| b == 0) {
            Some(end) => {
                self.pos += end + 1;
                Some(&rest[..end])
            }
            None => Some(self.rest()),
        }
    }

    pub fn lenenc_int(&mut self) -> Option<u64> {
        match self.u8()? {
            n @ 0..=0xfa => Some(n as u64),
            0xfc => self.u16().map(u64::from),
            0xfd => self.u24().map(u64::from),
            0xfe => self
                .bytes(8)
                .map(|b| u64::from_le_bytes(b.try_into().unwrap_or([0; 8]))),
            _ => None,
        }
    }

    pub fn lenenc_bytes(&mut self) -> Option<&'a [u8]> {
        let len = usize::try_from(self.lenenc_int()?).ok()?;
        self.bytes(len)
    }
}

pub fn write_lenenc_int(out: &mut Vec<u8>, value: u64) {
    match value {
        0..=0xfa => out.push(value as u8),
        0xfb..=0xffff => {
            out.push(0xfc);
            out.extend_from_slice(&(value as u16).to_le_bytes());
        }
        0x1_0000..=0xff_ffff => {
            out.push(0xfd);
            out.extend_from_slice(&(value as u32).to_le_bytes()[..3]);
        }
        _ => {
            out.push(0xfe);
            out.extend_from_slice(&value.to_le_bytes());
        }
    }
}

pub fn write_null_str(out: &mut Vec<u8>, s: &[u8]) {
    out.extend_from_slice(s);
    out.push(0);
}

/// An EOF packet is `0xfe` with a payload shorter than 9 bytes; longer `0xfe`
/// payloads are length-encoded integers or auth switch requests.
pub fn is_eof(payload: &[u8]) -> bool {
    payload.first() == Some(&EOF_HEADER) && payload.len() < 9
}

/// Decoded ERR packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrPacket {
    pub code: u16,
    pub sql_state: String,
    pub message: String,
}

impl ErrPacket {
    pub fn parse(payload: &[u8]) -> Option<Self> {
        let mut r = PayloadReader::new(payload);
        if r.u8()? != ERR_HEADER {
            return None;
        }
        let code = r.u16()?;
        let mut sql_state = String::new();
        if payload.get(3) == Some(&b'#') {
            r.skip(1)?;
            sql_state = String::from_utf8_lossy(r.bytes(5)?).into_owned();
        }
        let message = String::from_utf8_lossy(r.rest()).into_owned();
        Some(Self {
            code,
            sql_state,
            message,
        })
    }
}

impl std::fmt::Display for ErrPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.sql_state.is_empty() {
            write!(f, "#{}: {}", self.code, self.message)
        } else {
            write!(f, "#{} ({}): {}", self.code, self.sql_state, self.message)
        }
    }
}

/// Server status flags of an OK packet payload.
pub fn ok_status(payload: &[u8]) -> Option<u16> {
    let mut r = PayloadReader::new(payload);
    r.u8()?;
    r.lenenc_int()?;
    r.lenenc_int()?;
    r.u16()
}

/// Server status flags of an EOF packet payload.
pub fn eof_status(payload: &[u8]) -> Option<u16> {
    let mut r = PayloadReader::new(payload);
    r.u8()?;
    r.u16()?;
    r.u16()
}

/// Initial handshake packet sent by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHandshake {
    pub server_version: String,
    pub thread_id: u32,
    pub scramble: [u8; SCRAMBLE_LEN],
    pub capabilities: u32,
    pub charset: u8,
    pub status: u16,
    pub auth_plugin: String,
}

impl ServerHandshake {
    pub fn parse(payload: &[u8]) -> Result<Self, &'static str> {
        let mut r = PayloadReader::new(payload);
        let version = r.u8().ok_or("empty handshake")?;
        if version != PROTOCOL_VERSION {
            return Err("unsupported protocol version");
        }
        let server_version = r.null_str().ok_or("truncated server version")?;
        let thread_id = r.u32().ok_or("truncated thread id")?;
        let mut scramble = [0u8; SCRAMBLE_LEN];
        scramble[..8].copy_from_slice(r.bytes(8).ok_or("truncated scramble")?);
        r.skip(1).ok_or("truncated handshake")?;
        let cap_low = r.u16().ok_or("truncated capabilities")?;
        let charset = r.u8().unwrap_or(DEFAULT_CHARSET);
        let status = r.u16().unwrap_or(0);
        let cap_high = r.u16().unwrap_or(0);
        let capabilities = u32::from(cap_low) | (u32::from(cap_high) << 16);
        let auth_len = r.u8().unwrap_or(0) as usize;
        r.skip(10);
        if capabilities & CLIENT_SECURE_CONNECTION != 0 {
            let part2_len = auth_len.saturating_sub(8).max(13);
            let part2 = r.bytes(part2_len).ok_or("truncated scramble")?;
            if part2.len() < SCRAMBLE_LEN - 8 {
                return Err("truncated scramble");
            }
            scramble[8..].copy_from_slice(&part2[..SCRAMBLE_LEN - 8]);
        }
        let auth_plugin = if capabilities & CLIENT_PLUGIN_AUTH != 0 {
            r.null_str()
                .map(|p| String::from_utf8_lossy(p).into_owned())
                .unwrap_or_default()
        } else {
            String::new()
        };
        Ok(Self {
            server_version: String::from_utf8_lossy(server_version).into_owned(),
            thread_id,
            scramble,
            capabilities,
            charset,
            status,
            auth_plugin,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128);
        out.push(PROTOCOL_VERSION);
        write_null_str(&mut out, self.server_version.as_bytes());
        out.extend_from_slice(&self.thread_id.to_le_bytes());
        out.extend_from_slice(&self.scramble[..8]);
        out.push(0);
        out.extend_from_slice(&(self.capabilities as u16).to_le_bytes());
        out.push(self.charset);
        out.extend_from_slice(&self.status.to_le_bytes());
        out.extend_from_slice(&((self.capabilities >> 16) as u16).to_le_bytes());
        out.push(SCRAMBLE_LEN as u8 + 1);
        out.extend_from_slice(&[0u8; 10]);
        out.extend_from_slice(&self.scramble[8..]);
        out.push(0);
        write_null_str(&mut out, self.auth_plugin.as_bytes());
        out
    }
}

/// Client-side fields needed to build a HandshakeResponse41.
#[derive(Debug, Clone)]
pub struct HandshakeResponse<'a> {
    pub capabilities: u32,
    pub charset: u8,
    pub user: &'a str,
    pub auth_token: &'a [u8],
    pub database: Option<&'a str>,
    pub auth_plugin: &'a str,
    pub connect_attrs: &'a [u8],
}

const MAX_CLIENT_PACKET: u32 = 16 * 1024 * 1024;

fn write_response_prefix(out: &mut Vec<u8>, capabilities: u32, charset: u8) {
    out.extend_from_slice(&capabilities.to_le_bytes());
    out.extend_from_slice(&MAX_CLIENT_PACKET.to_le_bytes());
    out.push(charset);
    out.extend_from_slice(&[0u8; 23]);
}

impl HandshakeResponse<'_> {
    pub fn encode(&self) -> Vec<u8> {
        let mut caps = self.capabilities;
        if self.database.is_some() {
            caps |= CLIENT_CONNECT_WITH_DB;
        } else {
            caps &= !CLIENT_CONNECT_WITH_DB;
        }
        let mut out = Vec::with_capacity(96 + self.user.len());
        write_response_prefix(&mut out, caps, self.charset);
        write_null_str(&mut out, self.user.as_bytes());
        out.push(self.auth_token.len() as u8);
        out.extend_from_slice(self.auth_token);
        if let Some(db) = self.database {
            write_null_str(&mut out, db.as_bytes());
        }
        if caps & CLIENT_PLUGIN_AUTH != 0 {
            write_null_str(&mut out, self.auth_plugin.as_bytes());
        }
        if caps & CLIENT_CONNECT_ATTRS != 0 {
            write_lenenc_int(&mut out, self.connect_attrs.len() as u64);
            out.extend_from_slice(self.connect_attrs);
        }
        out
    }
}

/// Fields of a client's HandshakeResponse41 that the proxy cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHello {
    pub capabilities: u32,
    pub user: String,
    pub database: Option<String>,
}

impl ClientHello {
    pub fn parse(payload: &[u8]) -> Option<Self> {
        let mut r = PayloadReader::new(payload);
        let capabilities = r.u32()?;
        r.skip(4 + 1 + 23)?;
        let user = String::from_utf8_lossy(r.null_str()?).into_owned();
        if capabilities & CLIENT_SECURE_CONNECTION != 0 {
            let len = r.u8()? as usize;
            r.skip(len)?;
        } else {
            r.null_str()?;
        }
        let database = if capabilities & CLIENT_CONNECT_WITH_DB != 0 {
            r.null_str()
                .map(|db| String::from_utf8_lossy(db).into_owned())
                .filter(|db| !db.is_empty())
        } else {
            None
        };
        Some(Self {
            capabilities,
            user,
            database,
        })
    }
}

/// Payload of an SSLRequest: the first 32 bytes of a handshake response.
pub fn ssl_request(capabilities: u32, charset: u8) -> Vec<u8> {
    let mut out = Vec::with_capacity(32);
    write_response_prefix(&mut out, capabilities | CLIENT_SSL, charset);
    out
}

/// COM_CHANGE_USER payload.
pub fn change_user(
    user: &str,
    auth_token: &[u8],
    database: Option<&str>,
    charset: u8,
    auth_plugin: &str,
    connect_attrs: &[u8],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(64 + user.len());
    out.push(COM_CHANGE_USER);
    write_null_str(&mut out, user.as_bytes());
    out.push(auth_token.len() as u8);
    out.extend_from_slice(auth_token);
    write_null_str(&mut out, database.unwrap_or("").as_bytes());
    out.extend_from_slice(&u16::from(charset).to_le_bytes());
    write_null_str(&mut out, auth_plugin.as_bytes());
    if !connect_attrs.is_empty() {
        write_lenenc_int(&mut out, connect_attrs.len() as u64);
        out.extend_from_slice(connect_attrs);
    }
    out
}

/// Request to switch authentication method (`0xfe`, plugin name, plugin data).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSwitchRequest {
    pub plugin: String,
    pub data: Vec<u8>,
}

impl AuthSwitchRequest {
    pub fn parse(payload: &[u8]) -> Option<Self> {
        let mut r = PayloadReader::new(payload);
        if r.u8()? != AUTH_SWITCH_HEADER || payload.len() < 2 {
            return None;
        }
        let plugin = String::from_utf8_lossy(r.null_str()?).into_owned();
        let mut data = r.rest().to_vec();
        if data.last() == Some(&0) {
            data.pop();
        }
        Some(Self { plugin, data })
    }
}

pub fn com_quit() -> Vec<u8> {
    packet(0, &[COM_QUIT])
}

pub fn com_query(sql: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(sql.len() + 1);
    payload.push(COM_QUERY);
    payload.extend_from_slice(sql.as_bytes());
    packet(0, &payload)
}

pub fn ok_packet(seq: u8, status: u16) -> Vec<u8> {
    packet(seq, &[OK_HEADER, 0, 0, status as u8, (status >> 8) as u8, 0, 0])
}

pub fn eof_packet(seq: u8, status: u16) -> Vec<u8> {
    packet(seq, &[EOF_HEADER, 0, 0, status as u8, (status >> 8) as u8])
}

pub fn err_packet(seq: u8, code: u16, sql_state: &str, message: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(9 + message.len());
    payload.push(ERR_HEADER);
    payload.extend_from_slice(&code.to_le_bytes());
    payload.push(b'#');
    let mut state = [b'H', b'Y', b'0', b'0', b'0'];
    for (dst, src) in state.iter_mut().zip(sql_state.bytes()) {
        *dst = src;
    }
    payload.extend_from_slice(&state);
    payload.extend_from_slice(message.as_bytes());
    packet(seq, &payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_incomplete_header_and_body() {
        assert_eq!(try_parse_packet(&[1, 0]), ParseResult::Incomplete(2));
        assert_eq!(try_parse_packet(&[3, 0, 0, 0, 1]), ParseResult::Incomplete(2));
        assert_eq!(
            try_parse_packet(&[1, 0, 0, 7, COM_PING]),
            ParseResult::Complete {
                payload_len: 1,
                bytes_consumed: 5
            }
        );
    }

    #[test]
    fn continuation_packets_join() {
        let payload = vec![7u8; MAX_PAYLOAD_LEN + 10];
        let mut buf = Vec::new();
        let next = write_packet(&mut buf, 3, &payload);
        assert_eq!(next, 5);
        assert_eq!(buf.len(), payload.len() + 2 * HEADER_LEN);

        // Partial second part: the logical packet is not complete yet.
        assert_eq!(logical_packet_len(&buf[..buf.len() - 1]), None);
        assert_eq!(complete_packets_len(&buf[..buf.len() - 1]), 0);

        let packet = read_packet(&mut buf).unwrap();
        assert_eq!(packet.seq, 4);
        assert_eq!(packet.payload.len(), MAX_PAYLOAD_LEN + 10);
        assert!(buf.is_empty());
    }

    #[test]
    fn exact_max_payload_gets_empty_trailer() {
        let payload = vec![1u8; MAX_PAYLOAD_LEN];
        let mut buf = Vec::new();
        write_packet(&mut buf, 0, &payload);
        assert_eq!(buf.len(), MAX_PAYLOAD_LEN + 2 * HEADER_LEN);
        assert_eq!(&buf[buf.len() - 4..], &[0, 0, 0, 1]);
    }

    #[test]
    fn complete_prefix_stops_at_partial_packet() {
        let mut buf = com_query("select 1");
        let first = buf.len();
        buf.extend_from_slice(&[10, 0, 0, 0, COM_QUERY, b's']);
        assert_eq!(complete_packets_len(&buf), first);
    }

    #[test]
    fn lenenc_ints() {
        for v in [0u64, 250, 251, 0xffff, 0x10000, 0xffffff, 0x1000000] {
            let mut out = Vec::new();
            write_lenenc_int(&mut out, v);
            assert_eq!(PayloadReader::new(&out).lenenc_int(), Some(v));
        }
        assert_eq!(PayloadReader::new(&[0xfc, 1]).lenenc_int(), None);
    }

    #[test]
    fn err_packet_parses() {
        let pkt = err_packet(2, ER_HOST_IS_BLOCKED, "HY000", "Host is blocked");
        let err = ErrPacket::parse(&pkt[HEADER_LEN..]).unwrap();
        assert_eq!(err.code, ER_HOST_IS_BLOCKED);
        assert_eq!(err.sql_state, "HY000");
        assert_eq!(err.message, "Host is blocked");
        assert_eq!(sequence(&pkt), 2);
    }

    #[test]
    fn server_handshake_roundtrip() {
        let hs = ServerHandshake {
            server_version: "10.6.12-MariaDB".into(),
            thread_id: 42,
            scramble: *b"abcdefghijklmnopqrst",
            capabilities: DEFAULT_CAPABILITIES,
            charset: DEFAULT_CHARSET,
            status: SERVER_STATUS_AUTOCOMMIT,
            auth_plugin: DEFAULT_AUTH_PLUGIN.into(),
        };
        assert_eq!(ServerHandshake::parse(&hs.encode()), Ok(hs));
    }

    #[test]
    fn handshake_rejects_wrong_protocol() {
        assert!(ServerHandshake::parse(&[9, b'x', 0]).is_err());
        assert!(ServerHandshake::parse(&[]).is_err());
    }

    #[test]
    fn client_hello_reads_user_and_db() {
        let response = HandshakeResponse {
            capabilities: DEFAULT_CAPABILITIES,
            charset: DEFAULT_CHARSET,
            user: "app",
            auth_token: &[1; 20],
            database: Some("shop"),
            auth_plugin: DEFAULT_AUTH_PLUGIN,
            connect_attrs: &[],
        }
        .encode();
        let hello = ClientHello::parse(&response).unwrap();
        assert_eq!(hello.user, "app");
        assert_eq!(hello.database.as_deref(), Some("shop"));
    }

    #[test]
    fn change_user_layout() {
        let payload = change_user("bob", &[9; 20], Some("db"), DEFAULT_CHARSET, "p", &[]);
        assert_eq!(payload[0], COM_CHANGE_USER);
        assert_eq!(&payload[1..5], b"bob\0");
        assert_eq!(payload[5], 20);
        assert_eq!(&payload[26..29], b"db\0");
        assert_eq!(&payload[29..31], &[DEFAULT_CHARSET, 0]);
        assert_eq!(&payload[31..], b"p\0");
    }

    #[test]
    fn auth_switch_strips_trailing_nul() {
        let mut payload = vec![AUTH_SWITCH_HEADER];
        payload.extend_from_slice(b"mysql_native_password\0");
        payload.extend_from_slice(&[5u8; 20]);
        payload.push(0);
        let req = AuthSwitchRequest::parse(&payload).unwrap();
        assert_eq!(req.plugin, DEFAULT_AUTH_PLUGIN);
        assert_eq!(req.data, vec![5u8; 20]);
        assert!(AuthSwitchRequest::parse(&[AUTH_SWITCH_HEADER]).is_none());
    }

    #[test]
    fn eof_detection_uses_length() {
        assert!(is_eof(&[EOF_HEADER, 0, 0, 2, 0]));
        assert!(!is_eof(&[EOF_HEADER, 1, 2, 3, 4, 5, 6, 7, 8]));
        let eof = eof_packet(5, SERVER_MORE_RESULTS_EXIST);
        assert_eq!(eof_status(&eof[HEADER_LEN..]), Some(SERVER_MORE_RESULTS_EXIST));
        let ok = ok_packet(1, SERVER_STATUS_AUTOCOMMIT);
        assert_eq!(ok_status(&ok[HEADER_LEN..]), Some(SERVER_STATUS_AUTOCOMMIT));
    }
}
