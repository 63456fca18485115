//! Streaming surfaces: Server-Sent Events and a WebSocket echo endpoint.
//!
//! ```bash
//! cargo run --example streaming
//! curl -N http://127.0.0.1:8080/events
//! ```

use std::time::Duration;

use sirocco_core::prelude::*;
use sirocco_core::sse::{self, SseEvent};
use sirocco_core::ws;

fn main() -> sirocco_core::Result<()> {
    init_logging();

    let mut router = Router::new();

    // Pull mode: the stream is polled as the socket drains.
    router.get("/events", |ctx: RequestContext| async move {
        let from: u64 = sse::last_event_id(&ctx).and_then(|id| id.parse().ok()).unwrap_or(0);
        let events = futures_util::stream::unfold(from, |n| async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            let event = SseEvent::new(format!("tick {n}")).id(n.to_string());
            Some((event, n + 1))
        });
        Ok(sse::response(events))
    });

    // Push mode: an emitter handle plus a cleanup that runs exactly once.
    router.get("/push", |_ctx: RequestContext| async {
        Ok(sse::push_response(|emitter| {
            tokio::spawn(async move {
                let mut n = 0u32;
                while emitter.is_open() {
                    emitter.send(SseEvent::new(format!("pushed {n}")));
                    n += 1;
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            });
            Some(Box::new(|| tracing::info!("push stream closed")) as sse::Cleanup)
        }))
    });

    router.get("/ws", |ctx: RequestContext| async move {
        ws::upgrade(&ctx, |mut session| async move {
            while let Ok(Some(msg)) = session.next().await {
                let outcome = match msg {
                    WsMessage::Text(text) => session.send_text(&text).await,
                    WsMessage::Binary(data) => session.send_binary(&data).await,
                };
                if outcome.is_err() {
                    break;
                }
            }
            if let Some(close) = session.close_info() {
                tracing::info!("peer closed: {} {:?}", close.code, close.reason);
            }
        })
    });

    Server::bind("127.0.0.1:8080").serve(router)
}
