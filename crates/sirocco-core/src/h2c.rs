//! HTTP/2 service: drives a TLS connection whose ALPN selected `h2`
//! through the same router and pipeline as HTTP/1.1. Streams multiplex;
//! each request runs as its own task and responses complete out of order
//! with their stream ids.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Error;
use crate::http::{Body, Method, RequestContext, Response};
use crate::metrics::WorkerMetrics;
use crate::pipeline;
use crate::router::Match;
use crate::server::Engine;

pub(crate) async fn serve<IO>(
    io: IO,
    peer: Option<SocketAddr>,
    engine: Arc<Engine>,
    metrics: Arc<WorkerMetrics>,
) where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut conn = match h2::server::handshake(io).await {
        Ok(conn) => conn,
        Err(e) => {
            tracing::debug!("h2 handshake failed: {e}");
            return;
        }
    };

    while let Some(accepted) = conn.accept().await {
        let (request, respond) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                tracing::debug!("h2 stream error: {e}");
                break;
            }
        };
        let engine = engine.clone();
        let metrics = metrics.clone();
        tokio::spawn(async move {
            metrics.inc_req();
            if let Err(e) = handle_stream(request, respond, peer, &engine).await {
                tracing::debug!("h2 request failed: {e}");
            }
        });
    }
}

async fn handle_stream(
    request: http::Request<h2::RecvStream>,
    mut respond: h2::server::SendResponse<Bytes>,
    peer: Option<SocketAddr>,
    engine: &Arc<Engine>,
) -> crate::error::Result<()> {
    let (parts, mut recv_body) = request.into_parts();

    let method = Method::from_bytes(parts.method.as_str().as_bytes());
    let path = parts.uri.path().to_string();
    let query = parts.uri.query().map(str::to_string);

    let mut ctx = RequestContext::new(method, path);
    ctx.query = query;
    ctx.peer_addr = peer;
    ctx.secure = true;
    for (name, value) in parts.headers.iter() {
        if let Ok(value) = value.to_str() {
            ctx.headers.append(name.as_str(), value);
        }
    }

    // Collect the request body, releasing connection-level flow control as
    // data arrives.
    let max_body = engine.config.max_body_size;
    let mut body = BytesMut::new();
    while let Some(data) = recv_body.data().await {
        let data = data.map_err(|e| Error::Malformed(format!("h2 body error: {e}")))?;
        let _ = recv_body.flow_control().release_capacity(data.len());
        if body.len() + data.len() > max_body {
            let res = Response::text(413, "Payload Too Large");
            return send(respond, res).await;
        }
        body.extend_from_slice(&data);
    }
    ctx.body = body.freeze();

    let table = engine.table();
    let outcome = table.dispatch(ctx.method, &ctx.path);
    let res = match outcome {
        Match::Found { handler, params } => {
            ctx.params = params;
            let invocation = pipeline::invoke(handler, engine.provider.as_ref(), ctx);
            match tokio::time::timeout(engine.config.request_timeout(), invocation).await {
                Ok(res) => res,
                Err(_) => Response::gateway_timeout(),
            }
        }
        Match::MethodMiss { allow } => Response::method_not_allowed(&allow),
        Match::NotFound => Response::not_found(),
    };
    send(respond, res).await
}

async fn send(
    mut respond: h2::server::SendResponse<Bytes>,
    mut res: Response,
) -> crate::error::Result<()> {
    let mut builder = http::Response::builder().status(res.status);
    for (name, value) in res.headers.iter() {
        // Connection-level headers do not exist in h2.
        if matches!(name, "connection" | "transfer-encoding" | "keep-alive" | "upgrade") {
            continue;
        }
        builder = builder.header(name, value);
    }
    let head = builder
        .body(())
        .map_err(|e| Error::Other(format!("invalid h2 response head: {e}")))?;

    match res.body {
        Body::Empty => {
            respond
                .send_response(head, true)
                .map_err(|e| Error::Other(format!("h2 send_response: {e}")))?;
        }
        Body::Bytes(bytes) => {
            let mut stream = respond
                .send_response(head, bytes.is_empty())
                .map_err(|e| Error::Other(format!("h2 send_response: {e}")))?;
            if !bytes.is_empty() {
                send_data(&mut stream, bytes, true).await?;
            }
        }
        Body::Stream(ref mut body) => {
            let mut stream = respond
                .send_response(head, false)
                .map_err(|e| Error::Other(format!("h2 send_response: {e}")))?;
            while let Some(chunk) = body.next().await {
                let chunk = chunk?;
                if chunk.is_empty() {
                    continue;
                }
                send_data(&mut stream, chunk, false).await?;
            }
            send_data(&mut stream, Bytes::new(), true).await?;
        }
    }
    Ok(())
}

/// Window-aware write: reserve capacity and emit in permitted slices.
async fn send_data(
    stream: &mut h2::SendStream<Bytes>,
    mut data: Bytes,
    end: bool,
) -> crate::error::Result<()> {
    if data.is_empty() {
        stream
            .send_data(data, end)
            .map_err(|e| Error::Other(format!("h2 send_data: {e}")))?;
        return Ok(());
    }
    while !data.is_empty() {
        stream.reserve_capacity(data.len());
        let allowed = std::future::poll_fn(|cx| stream.poll_capacity(cx))
            .await
            .ok_or_else(|| Error::Disconnected)?
            .map_err(|e| Error::Other(format!("h2 capacity: {e}")))?;
        if allowed == 0 {
            continue;
        }
        let frame = data.split_to(allowed.min(data.len()));
        let ending = end && data.is_empty();
        stream
            .send_data(frame, ending)
            .map_err(|e| Error::Other(format!("h2 send_data: {e}")))?;
    }
    Ok(())
}
