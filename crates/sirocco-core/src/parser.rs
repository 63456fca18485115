//! HTTP/1.1 codec: request head parsing, body framing, chunked transfer
//! decoding and response serialization.

use std::sync::{Arc, OnceLock, RwLock};

use memchr::memmem;

use crate::error::{Error, Result};
use crate::http::{Body, HeaderMap, Method, Response, status_text};

/// Parsed request line + headers. Body framing is resolved separately.
#[derive(Debug)]
pub struct RequestHead {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    /// False for `HTTP/1.0`, which defaults to `Connection: close`.
    pub version_11: bool,
}

impl RequestHead {
    pub fn keep_alive(&self) -> bool {
        if self.headers.has_token("connection", "close") {
            return false;
        }
        if self.version_11 {
            return true;
        }
        self.headers.has_token("connection", "keep-alive")
    }
}

/// Outcome of a head parse attempt over a partially-filled buffer.
#[derive(Debug)]
pub enum HeadParse {
    /// Head fully parsed; `consumed` bytes cover the head including the
    /// terminating blank line.
    Complete { head: RequestHead, consumed: usize },
    /// Terminator not seen yet; read more bytes and retry.
    Partial,
}

/// Parse an HTTP/1.x request head out of `buf`.
///
/// `max_header_size` bounds the distance scanned for the blank-line
/// terminator; exceeding it yields [`Error::HeadersTooLarge`] (431).
pub fn parse_head(buf: &[u8], max_header_size: usize) -> Result<HeadParse> {
    let Some(head_end) = memmem::find(buf, b"\r\n\r\n") else {
        if buf.len() > max_header_size {
            return Err(Error::HeadersTooLarge { limit: max_header_size });
        }
        return Ok(HeadParse::Partial);
    };
    if head_end + 4 > max_header_size {
        return Err(Error::HeadersTooLarge { limit: max_header_size });
    }

    let head = &buf[..head_end];
    let line_end = memmem::find(head, b"\r\n").unwrap_or(head.len());
    let request_line = &head[..line_end];

    let mut parts = request_line.split(|&b| b == b' ').filter(|p| !p.is_empty());
    let method_raw = parts.next().ok_or_else(|| Error::Malformed("empty request line".into()))?;
    let target_raw = parts.next().ok_or_else(|| Error::Malformed("missing request target".into()))?;
    let version_raw = parts.next().ok_or_else(|| Error::Malformed("missing HTTP version".into()))?;
    if parts.next().is_some() {
        return Err(Error::Malformed("extra tokens in request line".into()));
    }

    let method = Method::from_bytes(method_raw);
    if method == Method::Unknown {
        return Err(Error::Malformed(format!(
            "unknown method {:?}",
            String::from_utf8_lossy(method_raw)
        )));
    }

    let version_11 = match version_raw {
        b"HTTP/1.1" => true,
        b"HTTP/1.0" => false,
        other => {
            return Err(Error::Malformed(format!(
                "unsupported version {:?}",
                String::from_utf8_lossy(other)
            )));
        }
    };

    let target =
        std::str::from_utf8(target_raw).map_err(|_| Error::Malformed("non-UTF-8 request target".into()))?;
    if !target.starts_with('/') && target != "*" {
        return Err(Error::Malformed("request target must be origin-form".into()));
    }
    let (path, query) = match target.find('?') {
        Some(idx) => (target[..idx].to_string(), Some(target[idx + 1..].to_string())),
        None => (target.to_string(), None),
    };

    let mut headers = HeaderMap::with_capacity(16);
    let mut rest = &head[(line_end + 2).min(head.len())..];
    while !rest.is_empty() {
        let eol = memmem::find(rest, b"\r\n").unwrap_or(rest.len());
        let line = &rest[..eol];
        rest = &rest[(eol + 2).min(rest.len())..];
        if line.is_empty() {
            continue;
        }
        if line[0] == b' ' || line[0] == b'\t' {
            return Err(Error::Malformed("obsolete header line folding".into()));
        }
        let colon = memchr::memchr(b':', line)
            .ok_or_else(|| Error::Malformed("header line without colon".into()))?;
        let name = std::str::from_utf8(&line[..colon])
            .map_err(|_| Error::Malformed("non-UTF-8 header name".into()))?
            .trim();
        if name.is_empty() {
            return Err(Error::Malformed("empty header name".into()));
        }
        let value = std::str::from_utf8(&line[colon + 1..])
            .map_err(|_| Error::Malformed("non-UTF-8 header value".into()))?
            .trim();
        headers.append(name, value);
    }

    Ok(HeadParse::Complete {
        head: RequestHead { method, path, query, headers, version_11 },
        consumed: head_end + 4,
    })
}

/// Body framing declared by the request head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    None,
    Length(usize),
    Chunked,
}

/// Resolve body framing. Exactly one of `Content-Length` and
/// `Transfer-Encoding: chunked` may be present for bodies.
pub fn body_framing(head: &RequestHead, max_body_size: usize) -> Result<BodyFraming> {
    let has_len = head.headers.contains("content-length");
    let has_te = head.headers.contains("transfer-encoding");

    if has_len && has_te {
        return Err(Error::Malformed(
            "both content-length and transfer-encoding present".into(),
        ));
    }
    if has_te {
        if !head.headers.has_token("transfer-encoding", "chunked") {
            return Err(Error::Malformed("unsupported transfer-encoding".into()));
        }
        return Ok(BodyFraming::Chunked);
    }
    if has_len {
        let raw = head.headers.get("content-length").unwrap_or("");
        let len: usize = raw
            .trim()
            .parse()
            .map_err(|_| Error::Malformed(format!("invalid content-length {raw:?}")))?;
        if len > max_body_size {
            return Err(Error::BodyTooLarge { limit: max_body_size });
        }
        if len == 0 {
            return Ok(BodyFraming::None);
        }
        return Ok(BodyFraming::Length(len));
    }
    Ok(BodyFraming::None)
}

/// Attempt to decode a complete chunked body from `buf`.
///
/// Returns `Ok(None)` while the terminating zero chunk (plus trailer block)
/// has not arrived. On success returns the decoded body and the number of
/// input bytes consumed.
pub fn decode_chunked(buf: &[u8], max_body_size: usize) -> Result<Option<(Vec<u8>, usize)>> {
    let mut body = Vec::new();
    let mut pos = 0usize;

    loop {
        let Some(line_end) = memmem::find(&buf[pos..], b"\r\n") else {
            return incomplete(buf.len(), max_body_size);
        };
        let size_line = &buf[pos..pos + line_end];
        // Chunk extensions after ';' are tolerated and ignored.
        let size_str = std::str::from_utf8(size_line)
            .map_err(|_| Error::Malformed("non-UTF-8 chunk size".into()))?;
        let size_str = size_str.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_str, 16)
            .map_err(|_| Error::Malformed(format!("invalid chunk size {size_str:?}")))?;
        pos += line_end + 2;

        if size == 0 {
            // Trailer block: zero or more header lines, then a blank line.
            loop {
                let Some(eol) = memmem::find(&buf[pos..], b"\r\n") else {
                    return incomplete(buf.len(), max_body_size);
                };
                let line_len = eol;
                pos += eol + 2;
                if line_len == 0 {
                    return Ok(Some((body, pos)));
                }
            }
        }

        if body.len() + size > max_body_size {
            return Err(Error::BodyTooLarge { limit: max_body_size });
        }
        if buf.len() < pos + size + 2 {
            return incomplete(buf.len(), max_body_size);
        }
        body.extend_from_slice(&buf[pos..pos + size]);
        if &buf[pos + size..pos + size + 2] != b"\r\n" {
            return Err(Error::Malformed("chunk data not CRLF-terminated".into()));
        }
        pos += size + 2;
    }
}

fn incomplete(buffered: usize, max_body_size: usize) -> Result<Option<(Vec<u8>, usize)>> {
    // The raw chunked stream carries at most ~12 bytes of framing per chunk
    // line; 2x the body cap is a generous bound before declaring abuse.
    if buffered > max_body_size.saturating_mul(2).saturating_add(1024) {
        return Err(Error::BodyTooLarge { limit: max_body_size });
    }
    Ok(None)
}

/// Serialize the response head (status line + headers + blank line).
///
/// Adds `Date` when absent and the framing headers implied by the body
/// variant: `Content-Length` for fixed bodies, `Transfer-Encoding: chunked`
/// for streams. A `101` head gets neither.
pub fn encode_head(res: &mut Response, keep_alive: bool, out: &mut Vec<u8>) {
    out.extend_from_slice(b"HTTP/1.1 ");
    out.extend_from_slice(res.status.to_string().as_bytes());
    out.push(b' ');
    out.extend_from_slice(status_text(res.status).as_bytes());
    out.extend_from_slice(b"\r\n");

    res.headers.set_if_absent("date", http_date());

    let upgrading = res.status == 101;
    let bodyless = upgrading || res.status == 204 || res.status == 304;
    if !bodyless {
        match res.body.len() {
            Some(n) => {
                res.headers.set("content-length", n.to_string());
                res.headers.remove("transfer-encoding");
            }
            None => {
                res.headers.set("transfer-encoding", "chunked");
                res.headers.remove("content-length");
            }
        }
    }
    if !upgrading && !res.headers.contains("connection") {
        res.headers
            .set("connection", if keep_alive { "keep-alive" } else { "close" });
    }

    for (name, value) in res.headers.iter() {
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
}

/// Frame one chunk: `<hex-len>CRLF<bytes>CRLF`.
pub fn encode_chunk(data: &[u8], out: &mut Vec<u8>) {
    out.extend_from_slice(format!("{:x}\r\n", data.len()).as_bytes());
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
}

/// Terminal chunk: `0CRLF CRLF`.
pub fn encode_chunk_end(out: &mut Vec<u8>) {
    out.extend_from_slice(b"0\r\n\r\n");
}

// Cached Date header, refreshed by a background task. std RwLock on purpose:
// reads are synchronous nanosecond-scale and never contend with the 500ms
// writer in practice.
static CACHED_DATE: OnceLock<Arc<RwLock<String>>> = OnceLock::new();

fn now_date() -> String {
    httpdate::fmt_http_date(std::time::SystemTime::now())
}

/// Start the Date cache refresher. Idempotent; requires a tokio runtime.
pub fn init_date_cache() {
    let _ = CACHED_DATE.get_or_init(|| {
        let val = Arc::new(RwLock::new(now_date()));
        let val_clone = val.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_millis(500));
            loop {
                interval.tick().await;
                *val_clone.write().unwrap_or_else(|e| e.into_inner()) = now_date();
            }
        });
        val
    });
}

/// Current `Date` header value, from the cache when initialized.
pub fn http_date() -> String {
    match CACHED_DATE.get() {
        Some(lock) => lock.read().unwrap_or_else(|e| e.into_inner()).clone(),
        None => now_date(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX_HEAD: usize = 8 * 1024;
    const MAX_BODY: usize = 1024 * 1024;

    fn complete(buf: &[u8]) -> (RequestHead, usize) {
        match parse_head(buf, MAX_HEAD).unwrap() {
            HeadParse::Complete { head, consumed } => (head, consumed),
            HeadParse::Partial => panic!("unexpected partial parse"),
        }
    }

    #[test]
    fn parse_basic_request() {
        let raw = b"GET /some/path?foo=bar HTTP/1.1\r\nHost: localhost\r\nX-Test: 1\r\n\r\nrest";
        let (head, consumed) = complete(raw);
        assert_eq!(head.method, Method::Get);
        assert_eq!(head.path, "/some/path");
        assert_eq!(head.query.as_deref(), Some("foo=bar"));
        assert_eq!(head.headers.get("host"), Some("localhost"));
        assert_eq!(head.headers.get("x-test"), Some("1"));
        assert_eq!(consumed, raw.len() - 4);
        assert!(head.keep_alive());
    }

    #[test]
    fn parse_incomplete_head() {
        let raw = b"GET /some/path HTT";
        assert!(matches!(parse_head(raw, MAX_HEAD).unwrap(), HeadParse::Partial));
    }

    #[test]
    fn parse_rejects_bad_version() {
        let raw = b"GET / HTTP/2.0\r\n\r\n";
        assert!(matches!(parse_head(raw, MAX_HEAD), Err(Error::Malformed(_))));
    }

    #[test]
    fn parse_enforces_header_limit() {
        let mut raw = b"GET / HTTP/1.1\r\nx-big: ".to_vec();
        raw.extend(std::iter::repeat_n(b'a', 9000));
        assert!(matches!(
            parse_head(&raw, MAX_HEAD),
            Err(Error::HeadersTooLarge { .. })
        ));
    }

    #[test]
    fn http10_defaults_to_close() {
        let (head, _) = complete(b"GET / HTTP/1.0\r\nHost: x\r\n\r\n");
        assert!(!head.keep_alive());
        let (head, _) = complete(b"GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n");
        assert!(head.keep_alive());
    }

    #[test]
    fn framing_exactly_one() {
        let (head, _) = complete(
            b"POST / HTTP/1.1\r\nContent-Length: 3\r\nTransfer-Encoding: chunked\r\n\r\n",
        );
        assert!(body_framing(&head, MAX_BODY).is_err());

        let (head, _) = complete(b"POST / HTTP/1.1\r\nContent-Length: 3\r\n\r\n");
        assert_eq!(body_framing(&head, MAX_BODY).unwrap(), BodyFraming::Length(3));

        let (head, _) = complete(b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n");
        assert_eq!(body_framing(&head, MAX_BODY).unwrap(), BodyFraming::Chunked);
    }

    #[test]
    fn framing_body_cap() {
        let (head, _) = complete(b"POST / HTTP/1.1\r\nContent-Length: 2048\r\n\r\n");
        assert!(matches!(
            body_framing(&head, 1024),
            Err(Error::BodyTooLarge { .. })
        ));
    }

    #[test]
    fn chunked_round_trip() {
        let mut wire = Vec::new();
        encode_chunk(b"hello", &mut wire);
        encode_chunk(b", world", &mut wire);
        encode_chunk_end(&mut wire);

        let (body, consumed) = decode_chunked(&wire, MAX_BODY).unwrap().unwrap();
        assert_eq!(body, b"hello, world");
        assert_eq!(consumed, wire.len());
    }

    #[test]
    fn chunked_incomplete_and_invalid() {
        assert!(decode_chunked(b"5\r\nhel", MAX_BODY).unwrap().is_none());
        assert!(decode_chunked(b"zz\r\n", MAX_BODY).is_err());
        // Missing CRLF after the chunk data.
        assert!(decode_chunked(b"3\r\nabcXX0\r\n\r\n", MAX_BODY).is_err());
    }

    #[test]
    fn chunked_respects_cap() {
        let mut wire = Vec::new();
        encode_chunk(&[b'a'; 64], &mut wire);
        encode_chunk_end(&mut wire);
        assert!(matches!(
            decode_chunked(&wire, 32),
            Err(Error::BodyTooLarge { .. })
        ));
    }

    #[test]
    fn head_serialization_fixed_body() {
        let mut res = Response::ok("hi");
        let mut out = Vec::new();
        encode_head(&mut res, true, &mut out);
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("content-length: 2\r\n"));
        assert!(text.contains("date: "));
        assert!(text.contains("connection: keep-alive\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn head_serialization_stream_is_chunked() {
        let mut res = Response::stream(futures_util::stream::empty());
        let mut out = Vec::new();
        encode_head(&mut res, false, &mut out);
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("transfer-encoding: chunked\r\n"));
        assert!(!text.contains("content-length"));
        assert!(text.contains("connection: close\r\n"));
    }
}
