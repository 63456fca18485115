//! WebSocket support (RFC 6455): opening handshake, frame codec and the
//! per-connection session driving it.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::{Bytes, BytesMut};
use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::http::{BoxIo, RequestContext, Response};

const GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Largest assembled message the session will buffer.
const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x0 => Some(OpCode::Continuation),
            0x1 => Some(OpCode::Text),
            0x2 => Some(OpCode::Binary),
            0x8 => Some(OpCode::Close),
            0x9 => Some(OpCode::Ping),
            0xA => Some(OpCode::Pong),
            _ => None,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }

    pub fn is_control(self) -> bool {
        matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

/// One parsed frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: OpCode,
    pub masked: bool,
    pub payload: Vec<u8>,
}

/// Outcome of a frame parse attempt over a partially filled buffer.
#[derive(Debug)]
pub enum FrameParse {
    /// Frame decoded; `consumed` input bytes.
    Complete { frame: Frame, consumed: usize },
    /// Not enough bytes yet.
    Partial,
}

/// Decode one frame. Enforces the control-frame invariants (fin set,
/// payload at most 125) and unmasks masked payloads.
pub fn parse_frame(buf: &[u8], max_payload: usize) -> Result<FrameParse> {
    if buf.len() < 2 {
        return Ok(FrameParse::Partial);
    }
    let b0 = buf[0];
    let b1 = buf[1];
    let fin = b0 & 0x80 != 0;
    if b0 & 0x70 != 0 {
        return Err(Error::WebSocket("reserved bits set".into()));
    }
    let opcode = OpCode::from_u8(b0 & 0x0F)
        .ok_or_else(|| Error::WebSocket(format!("unknown opcode {:#x}", b0 & 0x0F)))?;
    let masked = b1 & 0x80 != 0;

    let mut pos = 2usize;
    let len7 = (b1 & 0x7F) as u64;
    let payload_len = match len7 {
        126 => {
            if buf.len() < pos + 2 {
                return Ok(FrameParse::Partial);
            }
            let len = u16::from_be_bytes([buf[pos], buf[pos + 1]]) as u64;
            pos += 2;
            len
        }
        127 => {
            if buf.len() < pos + 8 {
                return Ok(FrameParse::Partial);
            }
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buf[pos..pos + 8]);
            pos += 8;
            let len = u64::from_be_bytes(raw);
            if len > i64::MAX as u64 {
                return Err(Error::WebSocket("payload length high bit set".into()));
            }
            len
        }
        n => n,
    };

    if opcode.is_control() {
        if !fin {
            return Err(Error::WebSocket("fragmented control frame".into()));
        }
        if payload_len > 125 {
            return Err(Error::WebSocket("control frame payload over 125 bytes".into()));
        }
    }
    if payload_len > max_payload as u64 {
        return Err(Error::WebSocket(format!("frame payload over {max_payload} bytes")));
    }
    let payload_len = payload_len as usize;

    let mask_key = if masked {
        if buf.len() < pos + 4 {
            return Ok(FrameParse::Partial);
        }
        let key = [buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]];
        pos += 4;
        Some(key)
    } else {
        None
    };

    if buf.len() < pos + payload_len {
        return Ok(FrameParse::Partial);
    }
    let mut payload = buf[pos..pos + payload_len].to_vec();
    if let Some(key) = mask_key {
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= key[i % 4];
        }
    }

    Ok(FrameParse::Complete {
        frame: Frame { fin, opcode, masked, payload },
        consumed: pos + payload_len,
    })
}

/// Encode a frame. `mask` is only used by client-side emitters; the server
/// always sends unmasked.
pub fn encode_frame(opcode: OpCode, payload: &[u8], fin: bool, mask: Option<[u8; 4]>) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 14);
    let b0 = if fin { 0x80 } else { 0x00 } | opcode.as_u8();
    out.push(b0);

    let mask_bit = if mask.is_some() { 0x80 } else { 0x00 };
    match payload.len() {
        n if n < 126 => out.push(mask_bit | n as u8),
        n if n <= u16::MAX as usize => {
            out.push(mask_bit | 126);
            out.extend_from_slice(&(n as u16).to_be_bytes());
        }
        n => {
            out.push(mask_bit | 127);
            out.extend_from_slice(&(n as u64).to_be_bytes());
        }
    }

    match mask {
        Some(key) => {
            out.extend_from_slice(&key);
            out.extend(payload.iter().enumerate().map(|(i, b)| b ^ key[i % 4]));
        }
        None => out.extend_from_slice(payload),
    }
    out
}

/// Valid close codes: 1000-1003, 1007-1011, 3000-3999, 4000-4999.
pub fn valid_close_code(code: u16) -> bool {
    matches!(code, 1000..=1003 | 1007..=1011 | 3000..=4999)
}

/// Close payload: big-endian u16 code, then optional UTF-8 reason.
pub fn encode_close(code: u16, reason: &str) -> Result<Vec<u8>> {
    if !valid_close_code(code) {
        return Err(Error::WebSocket(format!("invalid close code {code}")));
    }
    let mut payload = Vec::with_capacity(2 + reason.len());
    payload.extend_from_slice(&code.to_be_bytes());
    payload.extend_from_slice(reason.as_bytes());
    if payload.len() > 125 {
        return Err(Error::WebSocket("close reason too long".into()));
    }
    Ok(encode_frame(OpCode::Close, &payload, true, None))
}

/// Peer-supplied close details; `(code, reason)` resolves the completion
/// handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Close {
    pub code: u16,
    pub reason: String,
}

fn parse_close_payload(payload: &[u8]) -> Close {
    if payload.len() < 2 {
        // Empty close payload carries no code (RFC 6455 §7.1.5).
        return Close { code: 1005, reason: String::new() };
    }
    let code = u16::from_be_bytes([payload[0], payload[1]]);
    let reason = String::from_utf8_lossy(&payload[2..]).into_owned();
    Close { code, reason }
}

/// `Sec-WebSocket-Accept` for a client key.
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// Token-level upgrade detection: `Upgrade: websocket` plus
/// `Connection: upgrade`, both case-insensitive.
pub fn is_upgrade_request(ctx: &RequestContext) -> bool {
    ctx.headers.has_token("upgrade", "websocket") && ctx.headers.has_token("connection", "upgrade")
}

/// Build the `101 Switching Protocols` response head for an upgrade
/// request.
pub fn handshake_response(ctx: &RequestContext) -> Result<Response> {
    if !is_upgrade_request(ctx) {
        return Err(Error::Malformed("not a websocket upgrade request".into()));
    }
    let key = ctx
        .header("sec-websocket-key")
        .ok_or_else(|| Error::Malformed("missing sec-websocket-key".into()))?;
    Ok(Response::new(101)
        .header("upgrade", "websocket")
        .header("connection", "Upgrade")
        .header("sec-websocket-accept", accept_key(key)))
}

/// Accept the upgrade and hand the socket to `f` once the `101` head has
/// been flushed.
pub fn upgrade<F, Fut>(ctx: &RequestContext, f: F) -> Result<Response>
where
    F: FnOnce(WsSession) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let res = handshake_response(ctx)?;
    Ok(res.on_upgrade(move |io, leftover| {
        let session = WsSession::new(io, leftover);
        f(session)
    }))
}

/// A decoded data message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsMessage {
    Text(String),
    Binary(Vec<u8>),
}

/// Server side of one upgraded connection.
///
/// `next()` is the message iterator: it reassembles fragmented messages,
/// answers pings with pongs, echoes the peer's close frame and then
/// half-closes the socket. After it returns `None`, `close_info()` resolves
/// with the peer's code and reason.
pub struct WsSession {
    io: BoxIo,
    buf: BytesMut,
    fragment: Option<(OpCode, Vec<u8>)>,
    close: Option<Close>,
    sent_close: bool,
}

impl WsSession {
    pub fn new(io: BoxIo, leftover: Bytes) -> Self {
        let mut buf = BytesMut::with_capacity(8 * 1024);
        buf.extend_from_slice(&leftover);
        Self { io, buf, fragment: None, close: None, sent_close: false }
    }

    /// Completion handle: set once the close handshake finished (either
    /// side initiating).
    pub fn close_info(&self) -> Option<&Close> {
        self.close.as_ref()
    }

    pub async fn send_text(&mut self, text: &str) -> Result<()> {
        self.send_frame(OpCode::Text, text.as_bytes()).await
    }

    pub async fn send_binary(&mut self, data: &[u8]) -> Result<()> {
        self.send_frame(OpCode::Binary, data).await
    }

    pub async fn ping(&mut self, payload: &[u8]) -> Result<()> {
        self.send_frame(OpCode::Ping, payload).await
    }

    /// Initiate (or complete) the close handshake.
    pub async fn close(&mut self, code: u16, reason: &str) -> Result<()> {
        if self.sent_close {
            return Ok(());
        }
        let frame = encode_close(code, reason)?;
        self.io.write_all(&frame).await?;
        self.io.flush().await?;
        self.sent_close = true;
        Ok(())
    }

    async fn send_frame(&mut self, opcode: OpCode, payload: &[u8]) -> Result<()> {
        if self.sent_close {
            return Err(Error::WebSocket("session already closed".into()));
        }
        let frame = encode_frame(opcode, payload, true, None);
        self.io.write_all(&frame).await?;
        self.io.flush().await?;
        Ok(())
    }

    /// Next data message; `None` once the connection is closed.
    pub async fn next(&mut self) -> Result<Option<WsMessage>> {
        loop {
            let frame = match self.read_frame().await? {
                Some(frame) => frame,
                None => return Ok(None),
            };

            // Client-originated frames must be masked.
            if !frame.masked {
                self.fail_connection(1002, "unmasked client frame").await;
                return Err(Error::WebSocket("unmasked client frame".into()));
            }

            match frame.opcode {
                OpCode::Ping => {
                    // Auto-reply echoing the payload.
                    let pong = encode_frame(OpCode::Pong, &frame.payload, true, None);
                    self.io.write_all(&pong).await?;
                    self.io.flush().await?;
                }
                OpCode::Pong => {}
                OpCode::Close => {
                    let close = parse_close_payload(&frame.payload);
                    // Acknowledge with an echo, then half-close our side.
                    if !self.sent_close {
                        let echo = encode_frame(OpCode::Close, &frame.payload, true, None);
                        let _ = self.io.write_all(&echo).await;
                        let _ = self.io.flush().await;
                        self.sent_close = true;
                    }
                    let _ = self.io.shutdown().await;
                    self.close = Some(close);
                    return Ok(None);
                }
                OpCode::Text | OpCode::Binary => {
                    if self.fragment.is_some() {
                        self.fail_connection(1002, "interleaved data message").await;
                        return Err(Error::WebSocket("new data frame during fragmentation".into()));
                    }
                    if frame.fin {
                        return Ok(Some(self.finish_message(frame.opcode, frame.payload)?));
                    }
                    self.fragment = Some((frame.opcode, frame.payload));
                }
                OpCode::Continuation => {
                    let Some((opcode, mut assembled)) = self.fragment.take() else {
                        self.fail_connection(1002, "unexpected continuation").await;
                        return Err(Error::WebSocket("continuation without a message".into()));
                    };
                    if assembled.len() + frame.payload.len() > MAX_MESSAGE_SIZE {
                        self.fail_connection(1009, "message too big").await;
                        return Err(Error::WebSocket("assembled message too large".into()));
                    }
                    assembled.extend_from_slice(&frame.payload);
                    if frame.fin {
                        return Ok(Some(self.finish_message(opcode, assembled)?));
                    }
                    self.fragment = Some((opcode, assembled));
                }
            }
        }
    }

    fn finish_message(&mut self, opcode: OpCode, payload: Vec<u8>) -> Result<WsMessage> {
        match opcode {
            OpCode::Text => {
                let text = String::from_utf8(payload)
                    .map_err(|_| Error::WebSocket("text message is not UTF-8".into()))?;
                Ok(WsMessage::Text(text))
            }
            _ => Ok(WsMessage::Binary(payload)),
        }
    }

    async fn fail_connection(&mut self, code: u16, reason: &str) {
        if !self.sent_close
            && let Ok(frame) = encode_close(code, reason)
        {
            let _ = self.io.write_all(&frame).await;
            let _ = self.io.flush().await;
            self.sent_close = true;
        }
        let _ = self.io.shutdown().await;
    }

    async fn read_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            match parse_frame(&self.buf, MAX_MESSAGE_SIZE)? {
                FrameParse::Complete { frame, consumed } => {
                    let _ = self.buf.split_to(consumed);
                    return Ok(Some(frame));
                }
                FrameParse::Partial => {
                    let n = self.io.read_buf(&mut self.buf).await?;
                    if n == 0 {
                        // EOF without a close frame: abnormal closure.
                        if self.close.is_none() {
                            self.close = Some(Close { code: 1006, reason: String::new() });
                        }
                        return Ok(None);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn masked(opcode: OpCode, payload: &[u8], fin: bool) -> Vec<u8> {
        encode_frame(opcode, payload, fin, Some([0x1a, 0x2b, 0x3c, 0x4d]))
    }

    #[test]
    fn accept_key_rfc_vector() {
        // The example key from RFC 6455 §1.3.
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn upgrade_detection_is_token_and_case_insensitive() {
        let mut ctx = RequestContext::new(crate::http::Method::Get, "/ws");
        assert!(!is_upgrade_request(&ctx));
        ctx.headers.set("upgrade", "WebSocket");
        ctx.headers.set("connection", "keep-alive, Upgrade");
        assert!(is_upgrade_request(&ctx));
    }

    #[test]
    fn handshake_builds_101() {
        let mut ctx = RequestContext::new(crate::http::Method::Get, "/ws");
        ctx.headers.set("upgrade", "websocket");
        ctx.headers.set("connection", "Upgrade");
        ctx.headers.set("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==");
        let res = handshake_response(&ctx).unwrap();
        assert_eq!(res.status, 101);
        assert_eq!(
            res.headers.get("sec-websocket-accept"),
            Some("s3pPLMBiTxaQ9kYGzzhZRbK+xOo=")
        );

        ctx.headers.remove("sec-websocket-key");
        assert!(handshake_response(&ctx).is_err());
    }

    #[test]
    fn frame_round_trip_all_lengths() {
        // Exercises 7-bit, 16-bit and 64-bit length encodings.
        for len in [0usize, 1, 125, 126, 65_535, 65_536] {
            let payload = vec![0xABu8; len];
            for opcode in [OpCode::Text, OpCode::Binary] {
                let wire = encode_frame(opcode, &payload, true, None);
                let FrameParse::Complete { frame, consumed } =
                    parse_frame(&wire, usize::MAX).unwrap()
                else {
                    panic!("frame should parse completely");
                };
                assert_eq!(consumed, wire.len());
                assert_eq!(frame.opcode, opcode);
                assert!(frame.fin);
                assert!(!frame.masked);
                assert_eq!(frame.payload, payload);
            }
        }
    }

    #[test]
    fn masked_frame_unmasks() {
        let wire = masked(OpCode::Text, b"hello", true);
        let FrameParse::Complete { frame, .. } = parse_frame(&wire, 1024).unwrap() else {
            panic!("complete frame expected");
        };
        assert!(frame.masked);
        assert_eq!(frame.payload, b"hello");
    }

    #[test]
    fn partial_input_waits_for_more() {
        let wire = masked(OpCode::Binary, &[1, 2, 3, 4, 5], true);
        for cut in [0, 1, 3, wire.len() - 1] {
            assert!(matches!(
                parse_frame(&wire[..cut], 1024).unwrap(),
                FrameParse::Partial
            ));
        }
    }

    #[test]
    fn control_frame_invariants() {
        // Fragmented ping.
        let wire = encode_frame(OpCode::Ping, b"x", false, None);
        assert!(parse_frame(&wire, 1024).is_err());
        // Oversized close.
        let wire = encode_frame(OpCode::Close, &[0u8; 126], true, None);
        assert!(parse_frame(&wire, 1024).is_err());
        // Reserved bits.
        let mut wire = encode_frame(OpCode::Text, b"ok", true, None);
        wire[0] |= 0x40;
        assert!(parse_frame(&wire, 1024).is_err());
    }

    #[test]
    fn close_code_ranges() {
        for code in [1000, 1001, 1003, 1007, 1011, 3000, 3999, 4000, 4999] {
            assert!(valid_close_code(code), "{code} should be valid");
        }
        for code in [0, 999, 1004, 1005, 1006, 1012, 2000, 2999, 5000] {
            assert!(!valid_close_code(code), "{code} should be invalid");
        }
        assert!(encode_close(1000, "bye").is_ok());
        assert!(encode_close(1005, "").is_err());
    }

    #[test]
    fn close_payload_parse() {
        let close = parse_close_payload(&{
            let mut p = 1000u16.to_be_bytes().to_vec();
            p.extend_from_slice(b"done");
            p
        });
        assert_eq!(close, Close { code: 1000, reason: "done".into() });
        assert_eq!(parse_close_payload(&[]).code, 1005);
    }

    mod session {
        use super::*;
        use tokio::io::duplex;

        fn spawn_session(
        ) -> (tokio::io::DuplexStream, tokio::task::JoinHandle<Vec<WsMessage>>) {
            let (client, server) = duplex(64 * 1024);
            let handle = tokio::spawn(async move {
                let mut session = WsSession::new(Box::new(server), Bytes::new());
                let mut seen = Vec::new();
                while let Ok(Some(msg)) = session.next().await {
                    if let WsMessage::Text(text) = &msg {
                        let reply = text.clone();
                        session.send_text(&reply).await.unwrap();
                    }
                    seen.push(msg);
                }
                seen
            });
            (client, handle)
        }

        async fn read_one_frame(client: &mut tokio::io::DuplexStream) -> Frame {
            let mut buf = BytesMut::new();
            loop {
                match parse_frame(&buf, usize::MAX).unwrap() {
                    FrameParse::Complete { frame, consumed } => {
                        let _ = buf.split_to(consumed);
                        return frame;
                    }
                    FrameParse::Partial => {
                        client.read_buf(&mut buf).await.unwrap();
                    }
                }
            }
        }

        #[tokio::test]
        async fn echo_and_close_handshake() {
            let (mut client, handle) = spawn_session();

            client.write_all(&masked(OpCode::Text, b"hello", true)).await.unwrap();
            let echo = read_one_frame(&mut client).await;
            assert_eq!(echo.opcode, OpCode::Text);
            assert!(!echo.masked);
            assert_eq!(echo.payload, b"hello");

            // Close (1000, "bye") must be echoed back verbatim.
            let mut payload = 1000u16.to_be_bytes().to_vec();
            payload.extend_from_slice(b"bye");
            client
                .write_all(&encode_frame(OpCode::Close, &payload, true, Some([9, 9, 9, 9])))
                .await
                .unwrap();
            let close_echo = read_one_frame(&mut client).await;
            assert_eq!(close_echo.opcode, OpCode::Close);
            assert_eq!(close_echo.payload, payload);

            let seen = handle.await.unwrap();
            assert_eq!(seen, vec![WsMessage::Text("hello".into())]);
        }

        #[tokio::test]
        async fn ping_gets_pong_with_payload() {
            let (mut client, handle) = spawn_session();
            client.write_all(&masked(OpCode::Ping, b"tick", true)).await.unwrap();
            let pong = read_one_frame(&mut client).await;
            assert_eq!(pong.opcode, OpCode::Pong);
            assert_eq!(pong.payload, b"tick");
            drop(client);
            handle.await.unwrap();
        }

        #[tokio::test]
        async fn fragmented_message_reassembles() {
            let (mut client, handle) = spawn_session();
            client.write_all(&masked(OpCode::Text, b"hel", false)).await.unwrap();
            client
                .write_all(&masked(OpCode::Continuation, b"lo ", false))
                .await
                .unwrap();
            client
                .write_all(&masked(OpCode::Continuation, b"world", true))
                .await
                .unwrap();
            let echo = read_one_frame(&mut client).await;
            assert_eq!(echo.payload, b"hello world");
            drop(client);
            let seen = handle.await.unwrap();
            assert_eq!(seen, vec![WsMessage::Text("hello world".into())]);
        }

        #[tokio::test]
        async fn unmasked_client_frame_is_protocol_error() {
            let (mut client, _handle) = spawn_session();
            client
                .write_all(&encode_frame(OpCode::Text, b"bare", true, None))
                .await
                .unwrap();
            let close = read_one_frame(&mut client).await;
            assert_eq!(close.opcode, OpCode::Close);
            assert_eq!(u16::from_be_bytes([close.payload[0], close.payload[1]]), 1002);
        }

        #[tokio::test]
        async fn eof_resolves_completion_as_abnormal() {
            let (client, server) = duplex(1024);
            drop(client);
            let mut session = WsSession::new(Box::new(server), Bytes::new());
            assert!(session.next().await.unwrap().is_none());
            assert_eq!(session.close_info().map(|c| c.code), Some(1006));
        }
    }
}
