//! NTS-KE (RFC 8915) record codec and session state machine (spec §4.5).
//!
//! TLS itself is a non-goal here: the handshake and key export are behind a
//! [`TlsSession`] capability trait with no concrete implementation shipped;
//! tests exercise the state machine against an in-memory fake.

use std::collections::VecDeque;

pub const NKE_MAX_MESSAGE_LENGTH: usize = 16 * 1024;
pub const NKE_MAX_COOKIE_LENGTH: usize = 256;
pub const NKE_MAX_COOKIES: usize = 8;

pub const RECORD_END_OF_MESSAGE: u16 = 0;
pub const RECORD_NEXT_PROTOCOL: u16 = 1;
pub const RECORD_ERROR: u16 = 2;
pub const RECORD_WARNING: u16 = 3;
pub const RECORD_AEAD_ALGORITHM: u16 = 4;
pub const RECORD_COOKIE: u16 = 5;
pub const RECORD_NTPV4_SERVER_NEGOTIATION: u16 = 6;
pub const RECORD_NTPV4_PORT_NEGOTIATION: u16 = 7;

pub const NEXT_PROTOCOL_NTPV4: u16 = 0;
pub const AEAD_AES_SIV_CMAC_256: u16 = 15;
pub const AEAD_AES_128_GCM_SIV: u16 = 30;

pub const NKE_EXPORTER_LABEL: &str = "EXPORTER-network-time-security";
pub const NKE_ALPN: &str = "ntske/1";

const CRITICAL_BIT: u16 = 0x8000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub rec_type: u16,
    pub critical: bool,
    pub body: Vec<u8>,
}

impl Record {
    pub fn new(rec_type: u16, critical: bool, body: Vec<u8>) -> Self {
        Self { rec_type, critical, body }
    }

    pub fn end_of_message() -> Self {
        Self::new(RECORD_END_OF_MESSAGE, true, Vec::new())
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        let type_field = self.rec_type | if self.critical { CRITICAL_BIT } else { 0 };
        out.extend_from_slice(&type_field.to_be_bytes());
        out.extend_from_slice(&(self.body.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.body);
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum NkeError {
    #[error("record truncated")]
    Truncated,
    #[error("message exceeds NKE_MAX_MESSAGE_LENGTH")]
    MessageTooLong,
    #[error("end-of-message record did not appear exactly once, or not last")]
    MalformedEndOfMessage,
    #[error("response missing required record: {0}")]
    MissingRecord(&'static str),
    #[error("response contained more than one {0} record")]
    DuplicateRecord(&'static str),
    #[error("response contained an unsupported AEAD algorithm")]
    UnsupportedAlgorithm,
    #[error("response contained an unknown critical record")]
    UnknownCritical,
    #[error("peer sent an error record")]
    PeerError,
    #[error("peer sent a warning record")]
    PeerWarning,
    #[error("cookie has invalid length")]
    BadCookieLength,
    #[error("server name is not printable/space-free")]
    BadServerName,
}

/// Parse a full NTS-KE message body into its component records, enforcing
/// the framing invariants from spec §4.5 (length in bounds, end-of-message
/// exactly once and last).
pub fn parse_message(buf: &[u8]) -> Result<Vec<Record>, NkeError> {
    if buf.len() > NKE_MAX_MESSAGE_LENGTH {
        return Err(NkeError::MessageTooLong);
    }

    let mut records = Vec::new();
    let mut pos = 0usize;
    let mut seen_eom = false;

    while pos < buf.len() {
        if seen_eom {
            return Err(NkeError::MalformedEndOfMessage);
        }
        if pos + 4 > buf.len() {
            return Err(NkeError::Truncated);
        }
        let type_field = u16::from_be_bytes([buf[pos], buf[pos + 1]]);
        let body_len = u16::from_be_bytes([buf[pos + 2], buf[pos + 3]]) as usize;
        if pos + 4 + body_len > buf.len() {
            return Err(NkeError::Truncated);
        }
        let critical = type_field & CRITICAL_BIT != 0;
        let rec_type = type_field & !CRITICAL_BIT;
        let body = buf[pos + 4..pos + 4 + body_len].to_vec();
        pos += 4 + body_len;

        if rec_type == RECORD_END_OF_MESSAGE {
            if !critical || !body.is_empty() {
                return Err(NkeError::MalformedEndOfMessage);
            }
            seen_eom = true;
        }
        records.push(Record { rec_type, critical, body });
    }

    if !seen_eom {
        return Err(NkeError::MalformedEndOfMessage);
    }
    Ok(records)
}

/// Build the client's initial request (spec "Client request content").
pub fn build_client_request(algorithms: &[u16]) -> Vec<u8> {
    let mut out = Vec::new();
    Record::new(
        RECORD_NEXT_PROTOCOL,
        true,
        NEXT_PROTOCOL_NTPV4.to_be_bytes().to_vec(),
    )
    .encode(&mut out);

    let mut body = Vec::with_capacity(algorithms.len() * 2);
    for alg in algorithms {
        body.extend_from_slice(&alg.to_be_bytes());
    }
    Record::new(RECORD_AEAD_ALGORITHM, true, body).encode(&mut out);

    Record::end_of_message().encode(&mut out);
    out
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerResponse {
    pub aead_algorithm: u16,
    pub cookies: Vec<Vec<u8>>,
    pub negotiated_server: Option<String>,
    pub negotiated_port: Option<u16>,
}

fn is_printable_no_space(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_graphic())
}

/// Parse a server's response message (spec "Server response parsing").
pub fn parse_server_response(buf: &[u8], supported_algorithms: &[u16]) -> Result<ServerResponse, NkeError> {
    let records = parse_message(buf)?;

    let mut next_protocol_seen = false;
    let mut aead_algorithm: Option<u16> = None;
    let mut cookies = Vec::new();
    let mut negotiated_server = None;
    let mut negotiated_port = None;

    for rec in &records {
        match rec.rec_type {
            RECORD_END_OF_MESSAGE => {}
            RECORD_ERROR => return Err(NkeError::PeerError),
            RECORD_WARNING => return Err(NkeError::PeerWarning),
            RECORD_NEXT_PROTOCOL => {
                if next_protocol_seen {
                    return Err(NkeError::DuplicateRecord("NEXT_PROTOCOL"));
                }
                if rec.body.len() != 2 || u16::from_be_bytes([rec.body[0], rec.body[1]]) != NEXT_PROTOCOL_NTPV4 {
                    return Err(NkeError::MissingRecord("NEXT_PROTOCOL=NTPV4"));
                }
                next_protocol_seen = true;
            }
            RECORD_AEAD_ALGORITHM => {
                if aead_algorithm.is_some() {
                    return Err(NkeError::DuplicateRecord("AEAD_ALGORITHM"));
                }
                let mut chosen = None;
                for chunk in rec.body.chunks(2) {
                    if chunk.len() != 2 {
                        continue;
                    }
                    let alg = u16::from_be_bytes([chunk[0], chunk[1]]);
                    if supported_algorithms.contains(&alg) {
                        chosen = Some(alg);
                        break;
                    }
                }
                aead_algorithm = Some(chosen.ok_or(NkeError::UnsupportedAlgorithm)?);
            }
            RECORD_COOKIE => {
                if rec.body.is_empty()
                    || rec.body.len() > NKE_MAX_COOKIE_LENGTH
                    || rec.body.len() % 4 != 0
                {
                    return Err(NkeError::BadCookieLength);
                }
                if cookies.len() < NKE_MAX_COOKIES {
                    cookies.push(rec.body.clone());
                }
            }
            RECORD_NTPV4_SERVER_NEGOTIATION => {
                let name = String::from_utf8(rec.body.clone()).map_err(|_| NkeError::BadServerName)?;
                if !is_printable_no_space(&name) {
                    return Err(NkeError::BadServerName);
                }
                // A bare IP is used as-is; anything else gets a trailing
                // dot so the resolver treats it as fully qualified.
                let name = if name.parse::<std::net::IpAddr>().is_ok() {
                    name
                } else {
                    format!("{name}.")
                };
                negotiated_server = Some(name);
            }
            RECORD_NTPV4_PORT_NEGOTIATION => {
                if rec.body.len() != 2 {
                    return Err(NkeError::Truncated);
                }
                negotiated_port = Some(u16::from_be_bytes([rec.body[0], rec.body[1]]));
            }
            _ => {
                if rec.critical {
                    return Err(NkeError::UnknownCritical);
                }
                // unknown non-critical records are ignored
            }
        }
    }

    if !next_protocol_seen {
        return Err(NkeError::MissingRecord("NEXT_PROTOCOL"));
    }
    let aead_algorithm = aead_algorithm.ok_or(NkeError::MissingRecord("AEAD_ALGORITHM"))?;
    if cookies.is_empty() {
        return Err(NkeError::MissingRecord("COOKIE"));
    }

    Ok(ServerResponse {
        aead_algorithm,
        cookies,
        negotiated_server,
        negotiated_port,
    })
}

/// Capability trait for a TLS session: handshake progress, reading and
/// writing the wrapped byte stream, and exporting keying material. No
/// concrete implementation ships (out of scope); tests use
/// [`FakeTlsSession`].
pub trait TlsSession {
    fn do_handshake(&mut self) -> HandshakeProgress;
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize>;
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize>;
    fn shutdown(&mut self) -> bool;
    fn export_key(&self, label: &str, context: &[u8], len: usize) -> Vec<u8>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeProgress {
    AgainInput,
    AgainOutput,
    Success,
    Closed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    WaitConnect,
    Handshake,
    Send,
    Receive,
    Shutdown,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryFactor {
    Connect,
    Tls,
}

/// Drives one NTS-KE session's record-level state machine over a
/// [`TlsSession`] (spec "States and transitions").
pub struct Session<T: TlsSession> {
    tls: T,
    role: Role,
    state: SessionState,
    pending_out: VecDeque<u8>,
    incoming: Vec<u8>,
    retry_factor: RetryFactor,
}

impl<T: TlsSession> Session<T> {
    pub fn new(tls: T, role: Role) -> Self {
        Self {
            tls,
            role,
            state: SessionState::WaitConnect,
            pending_out: VecDeque::new(),
            incoming: Vec::new(),
            retry_factor: RetryFactor::Connect,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn retry_factor(&self) -> RetryFactor {
        self.retry_factor
    }

    /// Client-only: the socket has reported itself writable. `so_error`
    /// simulates reading `SO_ERROR` off the socket.
    pub fn on_connect_ready(&mut self, so_error: i32) {
        debug_assert_eq!(self.role, Role::Client);
        if self.state != SessionState::WaitConnect {
            return;
        }
        if so_error != 0 {
            self.state = SessionState::Stopped;
        } else {
            self.state = SessionState::Handshake;
        }
    }

    /// Queue a fully-built message (records + end-of-message) to be sent
    /// once the state machine reaches `Send`.
    pub fn begin_message(&mut self, message: &[u8]) {
        self.pending_out.extend(message.iter().copied());
    }

    /// Drive the state machine one step. Returns `Some(message)` once a
    /// complete peer message has been received.
    pub fn drive(&mut self) -> Result<Option<Vec<u8>>, NkeError> {
        match self.state {
            SessionState::WaitConnect => Ok(None),
            SessionState::Handshake => {
                match self.tls.do_handshake() {
                    HandshakeProgress::AgainInput | HandshakeProgress::AgainOutput => Ok(None),
                    HandshakeProgress::Success => {
                        self.state = match self.role {
                            Role::Server => SessionState::Receive,
                            Role::Client => SessionState::Send,
                        };
                        Ok(None)
                    }
                    HandshakeProgress::Closed => {
                        self.state = SessionState::Stopped;
                        Ok(None)
                    }
                    HandshakeProgress::Failed => {
                        self.retry_factor = RetryFactor::Tls;
                        self.state = SessionState::Stopped;
                        Ok(None)
                    }
                }
            }
            SessionState::Send => {
                let chunk: Vec<u8> = self.pending_out.drain(..).collect();
                if !chunk.is_empty() {
                    let _ = self.tls.write(&chunk);
                }
                self.state = match self.role {
                    Role::Server => SessionState::Shutdown,
                    Role::Client => SessionState::Receive,
                };
                Ok(None)
            }
            SessionState::Receive => {
                let mut buf = [0u8; 4096];
                loop {
                    match self.tls.read(&mut buf) {
                        Ok(0) => {
                            if parse_message(&self.incoming).is_err() {
                                self.state = SessionState::Stopped;
                            }
                            return Ok(None);
                        }
                        Ok(n) => {
                            self.incoming.extend_from_slice(&buf[..n]);
                            if let Ok(records) = parse_message(&self.incoming) {
                                if records.last().map(|r| r.rec_type) == Some(RECORD_END_OF_MESSAGE) {
                                    let msg = std::mem::take(&mut self.incoming);
                                    self.state = match self.role {
                                        Role::Server => SessionState::Send,
                                        Role::Client => SessionState::Shutdown,
                                    };
                                    return Ok(Some(msg));
                                }
                            }
                            continue;
                        }
                        Err(_) => return Ok(None),
                    }
                }
            }
            SessionState::Shutdown => {
                self.tls.shutdown();
                self.state = SessionState::Stopped;
                Ok(None)
            }
            SessionState::Stopped => Ok(None),
        }
    }

    /// Idempotent: repeated calls after `Stopped` are no-ops.
    pub fn stop(&mut self) {
        if self.state != SessionState::Stopped {
            self.tls.shutdown();
            self.state = SessionState::Stopped;
        }
    }

    /// Export the c2s/s2c key pair after a successful handshake (spec "Key
    /// export").
    pub fn export_keys(&self, next_protocol: u16, algorithm: u16, key_len: usize) -> (Vec<u8>, Vec<u8>) {
        let context = |is_s2c: u8| -> Vec<u8> {
            let mut ctx = Vec::with_capacity(6);
            ctx.extend_from_slice(&next_protocol.to_be_bytes());
            ctx.extend_from_slice(&algorithm.to_be_bytes());
            ctx.push(is_s2c);
            ctx.push(0);
            ctx
        };
        let c2s = self.tls.export_key(NKE_EXPORTER_LABEL, &context(0), key_len);
        let s2c = self.tls.export_key(NKE_EXPORTER_LABEL, &context(1), key_len);
        (c2s, s2c)
    }
}

#[cfg(test)]
pub mod fake_tls {
    use super::*;
    use std::collections::VecDeque;

    /// In-memory `TlsSession` fake: handshake succeeds immediately, reads
    /// come from a preloaded buffer, writes are captured for inspection.
    pub struct FakeTlsSession {
        pub inbound: VecDeque<u8>,
        pub outbound: Vec<u8>,
        pub handshake_result: HandshakeProgress,
    }

    impl FakeTlsSession {
        pub fn new(inbound: Vec<u8>) -> Self {
            Self {
                inbound: inbound.into_iter().collect(),
                outbound: Vec::new(),
                handshake_result: HandshakeProgress::Success,
            }
        }
    }

    impl TlsSession for FakeTlsSession {
        fn do_handshake(&mut self) -> HandshakeProgress {
            self.handshake_result
        }

        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let mut n = 0;
            while n < buf.len() {
                match self.inbound.pop_front() {
                    Some(b) => {
                        buf[n] = b;
                        n += 1;
                    }
                    None => break,
                }
            }
            Ok(n)
        }

        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.outbound.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn shutdown(&mut self) -> bool {
            true
        }

        fn export_key(&self, label: &str, context: &[u8], len: usize) -> Vec<u8> {
            // deterministic fake derivation, good enough for state-machine tests
            let mut out = vec![0u8; len];
            for (i, b) in out.iter_mut().enumerate() {
                *b = label.as_bytes()[i % label.len()] ^ context.get(i % context.len().max(1)).copied().unwrap_or(0);
            }
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake_tls::FakeTlsSession;
    use super::*;

    #[test]
    fn record_roundtrips_through_encode_and_parse() {
        let mut buf = Vec::new();
        Record::new(RECORD_NEXT_PROTOCOL, true, vec![0, 0]).encode(&mut buf);
        Record::end_of_message().encode(&mut buf);

        let records = parse_message(&buf).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].rec_type, RECORD_NEXT_PROTOCOL);
        assert!(records[0].critical);
        assert_eq!(records[1].rec_type, RECORD_END_OF_MESSAGE);
    }

    #[test]
    fn parse_message_rejects_missing_end_of_message() {
        let mut buf = Vec::new();
        Record::new(RECORD_NEXT_PROTOCOL, true, vec![0, 0]).encode(&mut buf);
        assert_eq!(parse_message(&buf).unwrap_err(), NkeError::MalformedEndOfMessage);
    }

    #[test]
    fn parse_message_rejects_trailing_data_after_eom() {
        let mut buf = Vec::new();
        Record::end_of_message().encode(&mut buf);
        Record::new(RECORD_COOKIE, false, vec![1, 2, 3, 4]).encode(&mut buf);
        assert_eq!(parse_message(&buf).unwrap_err(), NkeError::MalformedEndOfMessage);
    }

    #[test]
    fn client_request_round_trips() {
        let req = build_client_request(&[AEAD_AES_SIV_CMAC_256, AEAD_AES_128_GCM_SIV]);
        let records = parse_message(&req).unwrap();
        assert_eq!(records.len(), 3);
    }

    fn build_valid_server_response() -> Vec<u8> {
        let mut buf = Vec::new();
        Record::new(RECORD_NEXT_PROTOCOL, true, NEXT_PROTOCOL_NTPV4.to_be_bytes().to_vec()).encode(&mut buf);
        Record::new(RECORD_AEAD_ALGORITHM, true, AEAD_AES_SIV_CMAC_256.to_be_bytes().to_vec()).encode(&mut buf);
        Record::new(RECORD_COOKIE, false, vec![1, 2, 3, 4]).encode(&mut buf);
        Record::end_of_message().encode(&mut buf);
        buf
    }

    #[test]
    fn server_response_parses_required_fields() {
        let buf = build_valid_server_response();
        let resp = parse_server_response(&buf, &[AEAD_AES_SIV_CMAC_256]).unwrap();
        assert_eq!(resp.aead_algorithm, AEAD_AES_SIV_CMAC_256);
        assert_eq!(resp.cookies, vec![vec![1, 2, 3, 4]]);
    }

    #[test]
    fn server_response_appends_trailing_dot_to_hostnames_but_not_ips() {
        let mut buf = Vec::new();
        Record::new(RECORD_NEXT_PROTOCOL, true, NEXT_PROTOCOL_NTPV4.to_be_bytes().to_vec()).encode(&mut buf);
        Record::new(RECORD_AEAD_ALGORITHM, true, AEAD_AES_SIV_CMAC_256.to_be_bytes().to_vec()).encode(&mut buf);
        Record::new(RECORD_COOKIE, false, vec![1, 2, 3, 4]).encode(&mut buf);
        Record::new(RECORD_NTPV4_SERVER_NEGOTIATION, false, b"time.example.com".to_vec()).encode(&mut buf);
        Record::end_of_message().encode(&mut buf);
        let resp = parse_server_response(&buf, &[AEAD_AES_SIV_CMAC_256]).unwrap();
        assert_eq!(resp.negotiated_server.as_deref(), Some("time.example.com."));

        let mut buf = Vec::new();
        Record::new(RECORD_NEXT_PROTOCOL, true, NEXT_PROTOCOL_NTPV4.to_be_bytes().to_vec()).encode(&mut buf);
        Record::new(RECORD_AEAD_ALGORITHM, true, AEAD_AES_SIV_CMAC_256.to_be_bytes().to_vec()).encode(&mut buf);
        Record::new(RECORD_COOKIE, false, vec![1, 2, 3, 4]).encode(&mut buf);
        Record::new(RECORD_NTPV4_SERVER_NEGOTIATION, false, b"192.0.2.1".to_vec()).encode(&mut buf);
        Record::end_of_message().encode(&mut buf);
        let resp = parse_server_response(&buf, &[AEAD_AES_SIV_CMAC_256]).unwrap();
        assert_eq!(resp.negotiated_server.as_deref(), Some("192.0.2.1"));
    }

    #[test]
    fn server_response_rejects_unsupported_algorithm() {
        let buf = build_valid_server_response();
        let err = parse_server_response(&buf, &[AEAD_AES_128_GCM_SIV]).unwrap_err();
        assert_eq!(err, NkeError::UnsupportedAlgorithm);
    }

    #[test]
    fn server_response_caps_cookies_at_max_and_rejects_bad_length() {
        let mut buf = Vec::new();
        Record::new(RECORD_NEXT_PROTOCOL, true, NEXT_PROTOCOL_NTPV4.to_be_bytes().to_vec()).encode(&mut buf);
        Record::new(RECORD_AEAD_ALGORITHM, true, AEAD_AES_SIV_CMAC_256.to_be_bytes().to_vec()).encode(&mut buf);
        for _ in 0..(NKE_MAX_COOKIES + 2) {
            Record::new(RECORD_COOKIE, false, vec![9, 9, 9, 9]).encode(&mut buf);
        }
        Record::end_of_message().encode(&mut buf);

        let resp = parse_server_response(&buf, &[AEAD_AES_SIV_CMAC_256]).unwrap();
        assert_eq!(resp.cookies.len(), NKE_MAX_COOKIES);

        let mut bad = Vec::new();
        Record::new(RECORD_NEXT_PROTOCOL, true, NEXT_PROTOCOL_NTPV4.to_be_bytes().to_vec()).encode(&mut bad);
        Record::new(RECORD_AEAD_ALGORITHM, true, AEAD_AES_SIV_CMAC_256.to_be_bytes().to_vec()).encode(&mut bad);
        Record::new(RECORD_COOKIE, false, vec![1, 2, 3]).encode(&mut bad); // not a multiple of 4
        Record::end_of_message().encode(&mut bad);
        assert_eq!(
            parse_server_response(&bad, &[AEAD_AES_SIV_CMAC_256]).unwrap_err(),
            NkeError::BadCookieLength
        );
    }

    #[test]
    fn server_response_aborts_on_error_record() {
        let mut buf = Vec::new();
        Record::new(RECORD_ERROR, true, vec![0, 1]).encode(&mut buf);
        Record::end_of_message().encode(&mut buf);
        assert_eq!(
            parse_server_response(&buf, &[AEAD_AES_SIV_CMAC_256]).unwrap_err(),
            NkeError::PeerError
        );
    }

    #[test]
    fn unknown_critical_record_aborts_but_unknown_noncritical_is_ignored() {
        let mut buf = build_valid_server_response();
        buf.clear();
        Record::new(RECORD_NEXT_PROTOCOL, true, NEXT_PROTOCOL_NTPV4.to_be_bytes().to_vec()).encode(&mut buf);
        Record::new(RECORD_AEAD_ALGORITHM, true, AEAD_AES_SIV_CMAC_256.to_be_bytes().to_vec()).encode(&mut buf);
        Record::new(RECORD_COOKIE, false, vec![1, 2, 3, 4]).encode(&mut buf);
        Record::new(200, false, vec![0xff]).encode(&mut buf); // unknown, non-critical
        Record::end_of_message().encode(&mut buf);
        assert!(parse_server_response(&buf, &[AEAD_AES_SIV_CMAC_256]).is_ok());

        let mut buf2 = Vec::new();
        Record::new(RECORD_NEXT_PROTOCOL, true, NEXT_PROTOCOL_NTPV4.to_be_bytes().to_vec()).encode(&mut buf2);
        Record::new(RECORD_AEAD_ALGORITHM, true, AEAD_AES_SIV_CMAC_256.to_be_bytes().to_vec()).encode(&mut buf2);
        Record::new(RECORD_COOKIE, false, vec![1, 2, 3, 4]).encode(&mut buf2);
        Record::new(200, true, vec![0xff]).encode(&mut buf2); // unknown, critical
        Record::end_of_message().encode(&mut buf2);
        assert_eq!(
            parse_server_response(&buf2, &[AEAD_AES_SIV_CMAC_256]).unwrap_err(),
            NkeError::UnknownCritical
        );
    }

    #[test]
    fn client_session_runs_handshake_send_receive_shutdown() {
        let server_msg = build_valid_server_response();
        let tls = FakeTlsSession::new(server_msg.clone());
        let mut session = Session::new(tls, Role::Client);

        session.on_connect_ready(0);
        assert_eq!(session.state(), SessionState::Handshake);

        assert_eq!(session.drive().unwrap(), None);
        assert_eq!(session.state(), SessionState::Send);

        session.begin_message(&build_client_request(&[AEAD_AES_SIV_CMAC_256]));
        assert_eq!(session.drive().unwrap(), None);
        assert_eq!(session.state(), SessionState::Receive);

        let received = session.drive().unwrap();
        assert_eq!(received, Some(server_msg));
        assert_eq!(session.state(), SessionState::Shutdown);

        assert_eq!(session.drive().unwrap(), None);
        assert_eq!(session.state(), SessionState::Stopped);
    }

    #[test]
    fn connect_failure_stops_session() {
        let tls = FakeTlsSession::new(Vec::new());
        let mut session = Session::new(tls, Role::Client);
        session.on_connect_ready(111);
        assert_eq!(session.state(), SessionState::Stopped);
    }

    #[test]
    fn stop_is_idempotent() {
        let tls = FakeTlsSession::new(Vec::new());
        let mut session = Session::new(tls, Role::Client);
        session.stop();
        session.stop();
        assert_eq!(session.state(), SessionState::Stopped);
    }

    #[test]
    fn export_keys_produces_distinct_c2s_and_s2c() {
        let tls = FakeTlsSession::new(Vec::new());
        let session = Session::new(tls, Role::Client);
        let (c2s, s2c) = session.export_keys(NEXT_PROTOCOL_NTPV4, AEAD_AES_SIV_CMAC_256, 32);
        assert_ne!(c2s, s2c);
        assert_eq!(c2s.len(), 32);
    }
}
