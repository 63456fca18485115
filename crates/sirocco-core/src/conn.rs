//! Per-connection task: framed reads, dispatch through the pipeline,
//! response emission, keep-alive and upgrade handoff.
//!
//! One connection is one task, pinned to the worker that accepted it.
//! HTTP/1.1 pipelining falls out of the buffered read loop: leftover bytes
//! after one request seed the parse of the next, in arrival order.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use futures_util::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::http::{Body, BoxIo, Method, RequestContext, Response, status_text};
use crate::metrics::WorkerMetrics;
use crate::parser::{self, BodyFraming, HeadParse, RequestHead};
use crate::pipeline;
use crate::router::Match;
use crate::server::Engine;
use crate::shutdown::Phase;

/// Entry point for a freshly accepted (and TLS-terminated) connection.
pub(crate) async fn serve_connection(
    io: BoxIo,
    peer: Option<SocketAddr>,
    secure: bool,
    engine: Arc<Engine>,
    metrics: Arc<WorkerMetrics>,
) {
    match drive(io, peer, secure, &engine, &metrics).await {
        Ok(()) => {}
        Err(e) if e.is_disconnect() => {
            tracing::debug!("client disconnected mid-request");
        }
        Err(e) => {
            tracing::debug!("connection error: {e}");
        }
    }
}

async fn drive(
    mut io: BoxIo,
    peer: Option<SocketAddr>,
    secure: bool,
    engine: &Arc<Engine>,
    metrics: &Arc<WorkerMetrics>,
) -> Result<()> {
    let cfg = engine.config.clone();
    let mut buf = BytesMut::with_capacity(8 * 1024);
    let mut phase_rx = engine.shutdown.subscribe();
    let mut served: u64 = 0;

    loop {
        // ---- request head -------------------------------------------------
        // Idle wait is bounded by the keep-alive timeout; once the first
        // byte of a request is buffered, the request deadline applies.
        let mut deadline: Option<Instant> =
            (!buf.is_empty()).then(|| Instant::now() + cfg.request_timeout());

        let (head, head_consumed) = loop {
            match parser::parse_head(&buf, cfg.max_header_size) {
                Ok(HeadParse::Complete { head, consumed }) => break (head, consumed),
                Ok(HeadParse::Partial) => {}
                Err(e) => {
                    respond_error(&mut io, &e, metrics).await;
                    return Err(e);
                }
            }

            if buf.is_empty() && *phase_rx.borrow() != Phase::Running {
                // Idle keep-alive socket during drain: close it now.
                return Ok(());
            }

            let read = async {
                tokio::select! {
                    r = io.read_buf(&mut buf) => Some(r),
                    _ = phase_rx.changed(), if deadline.is_none() => None,
                }
            };
            let n = match deadline {
                Some(at) => match tokio::time::timeout_at(at, read).await {
                    Ok(Some(r)) => r?,
                    Ok(None) => continue,
                    Err(_) => {
                        // Head never completed within the request deadline.
                        let res = Response::gateway_timeout();
                        write_simple(&mut io, res, metrics).await;
                        return Err(Error::Timeout);
                    }
                },
                None => match tokio::time::timeout(cfg.keepalive_timeout(), read).await {
                    Ok(Some(r)) => r?,
                    Ok(None) => continue,
                    Err(_) => return Ok(()), // idle timeout
                },
            };
            if n == 0 {
                return if buf.is_empty() { Ok(()) } else { Err(Error::Disconnected) };
            }
            if deadline.is_none() {
                deadline = Some(Instant::now() + cfg.request_timeout());
            }
        };
        buf.advance(head_consumed);
        let deadline = deadline.unwrap_or_else(|| Instant::now() + cfg.request_timeout());

        // ---- body ---------------------------------------------------------
        let framing = match parser::body_framing(&head, cfg.max_body_size) {
            Ok(framing) => framing,
            Err(e) => {
                respond_error(&mut io, &e, metrics).await;
                return Err(e);
            }
        };
        let body = match read_body(&mut io, &mut buf, framing, cfg.max_body_size, deadline).await {
            Ok(body) => body,
            Err(Error::Timeout) => {
                write_simple(&mut io, Response::gateway_timeout(), metrics).await;
                return Err(Error::Timeout);
            }
            Err(e) => {
                respond_error(&mut io, &e, metrics).await;
                return Err(e);
            }
        };

        metrics.inc_req();
        served += 1;

        // ---- dispatch -----------------------------------------------------
        let is_head = head.method == Method::Head;
        let wants_keep_alive = head.keep_alive();
        let mut res = dispatch(head, body, peer, secure, engine, deadline).await;

        let mut keep_alive = wants_keep_alive
            && res.status != 504
            && *phase_rx.borrow() == Phase::Running
            && !(cfg.max_requests_per_connection > 0
                && served >= cfg.max_requests_per_connection);
        if res
            .headers
            .get("connection")
            .is_some_and(|v| v.eq_ignore_ascii_case("close"))
        {
            keep_alive = false;
        }

        // ---- emit ---------------------------------------------------------
        let upgrade = res.upgrade.take();
        write_response(&mut io, &mut res, keep_alive, is_head, metrics).await?;

        if let Some(upgrade_fn) = upgrade {
            if res.status == 101 {
                // The connection now belongs to the upgrade task; bytes read
                // past the request head travel with it.
                let leftover = buf.split().freeze();
                upgrade_fn(io, leftover).await;
                return Ok(());
            }
            tracing::debug!("upgrade callback ignored on non-101 response");
        }

        if !keep_alive {
            return Ok(());
        }
    }
}

async fn dispatch(
    head: RequestHead,
    body: Bytes,
    peer: Option<SocketAddr>,
    secure: bool,
    engine: &Arc<Engine>,
    deadline: Instant,
) -> Response {
    let mut ctx = RequestContext::new(head.method, head.path);
    ctx.query = head.query;
    ctx.headers = head.headers;
    ctx.body = body;
    ctx.peer_addr = peer;
    ctx.secure = secure;

    let table = engine.table();
    let outcome = table.dispatch(ctx.method, &ctx.path);
    match outcome {
        Match::Found { handler, params } => {
            ctx.params = params;
            let invocation = pipeline::invoke(handler, engine.provider.as_ref(), ctx);
            match tokio::time::timeout_at(deadline, invocation).await {
                Ok(res) => res,
                Err(_) => Response::gateway_timeout(),
            }
        }
        Match::MethodMiss { allow } => Response::method_not_allowed(&allow),
        Match::NotFound => Response::not_found(),
    }
}

async fn read_body(
    io: &mut BoxIo,
    buf: &mut BytesMut,
    framing: BodyFraming,
    max_body_size: usize,
    deadline: Instant,
) -> Result<Bytes> {
    match framing {
        BodyFraming::None => Ok(Bytes::new()),
        BodyFraming::Length(len) => {
            while buf.len() < len {
                read_more(io, buf, deadline).await?;
            }
            Ok(buf.split_to(len).freeze())
        }
        BodyFraming::Chunked => loop {
            if let Some((body, consumed)) = parser::decode_chunked(buf, max_body_size)? {
                buf.advance(consumed);
                return Ok(Bytes::from(body));
            }
            read_more(io, buf, deadline).await?;
        },
    }
}

async fn read_more(io: &mut BoxIo, buf: &mut BytesMut, deadline: Instant) -> Result<()> {
    match tokio::time::timeout_at(deadline, io.read_buf(buf)).await {
        Ok(Ok(0)) => Err(Error::Disconnected),
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(Error::Timeout),
    }
}

/// Minimal response for a codec-level failure, then the caller closes.
async fn respond_error(io: &mut BoxIo, e: &Error, metrics: &Arc<WorkerMetrics>) {
    if e.is_disconnect() {
        return;
    }
    let status = e.status_code();
    let res = Response::text(status, status_text(status));
    write_simple(io, res, metrics).await;
}

async fn write_simple(io: &mut BoxIo, mut res: Response, metrics: &Arc<WorkerMetrics>) {
    let _ = write_response(io, &mut res, false, false, metrics).await;
}

/// Serialize and flush one response. Streams are written chunk-by-chunk;
/// the next chunk is not pulled from the body until the previous one has
/// been accepted by the socket, which is what ties producer pace to a slow
/// client.
async fn write_response(
    io: &mut BoxIo,
    res: &mut Response,
    keep_alive: bool,
    is_head: bool,
    metrics: &Arc<WorkerMetrics>,
) -> Result<()> {
    let mut head_buf = Vec::with_capacity(256);
    parser::encode_head(res, keep_alive, &mut head_buf);
    io.write_all(&head_buf).await?;
    io.flush().await?;
    metrics.add_bytes(head_buf.len());

    if is_head || res.status == 101 || res.status == 204 || res.status == 304 {
        io.flush().await?;
        return Ok(());
    }

    match &mut res.body {
        Body::Empty => {}
        Body::Bytes(bytes) => {
            io.write_all(bytes).await?;
            metrics.add_bytes(bytes.len());
        }
        Body::Stream(stream) => {
            let mut frame = Vec::with_capacity(1024);
            while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        // Mid-stream failure: the framing cannot express an
                        // error, so the connection is torn down.
                        tracing::error!("response stream failed: {e}");
                        return Err(e);
                    }
                };
                if chunk.is_empty() {
                    // A zero-length chunk would terminate the framing early.
                    continue;
                }
                frame.clear();
                parser::encode_chunk(&chunk, &mut frame);
                io.write_all(&frame).await?;
                io.flush().await?;
                metrics.add_bytes(frame.len());
            }
            frame.clear();
            parser::encode_chunk_end(&mut frame);
            io.write_all(&frame).await?;
            metrics.add_bytes(frame.len());
        }
    }
    io.flush().await?;
    Ok(())
}
