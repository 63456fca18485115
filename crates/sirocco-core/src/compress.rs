//! Response compression (gzip / brotli), negotiated from
//! `Accept-Encoding`. Fixed bodies only; streamed bodies pass through
//! unchanged so their backpressure behavior is preserved.

use std::io::Write;
use std::sync::Arc;

use bytes::Bytes;

use crate::config::CompressionConfig;
use crate::http::{Body, RequestContext, Response};
use crate::pipeline::{ArcHandler, Middleware};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Encoding {
    Brotli,
    Gzip,
}

pub struct Compression {
    config: Arc<CompressionConfig>,
}

impl Compression {
    pub fn new(config: CompressionConfig) -> Self {
        Self { config: Arc::new(config) }
    }
}

/// Pick the strongest enabled encoding the client accepts.
fn negotiate(config: &CompressionConfig, accept: &str) -> Option<Encoding> {
    let accepts = |token: &str| {
        accept.split(',').any(|part| {
            let name = part.split(';').next().unwrap_or("").trim();
            name.eq_ignore_ascii_case(token)
        })
    };
    if config.brotli && accepts("br") {
        return Some(Encoding::Brotli);
    }
    if config.gzip && accepts("gzip") {
        return Some(Encoding::Gzip);
    }
    None
}

fn gzip(data: &[u8], level: u32) -> std::io::Result<Vec<u8>> {
    let mut encoder =
        flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::new(level.min(9)));
    encoder.write_all(data)?;
    encoder.finish()
}

fn brotli_compress(data: &[u8], level: u32) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    {
        let mut writer = brotli::CompressorWriter::new(&mut out, 4096, level.min(11), 22);
        writer.write_all(data)?;
    }
    Ok(out)
}

impl Middleware for Compression {
    fn wrap(&self, inner: ArcHandler) -> ArcHandler {
        let config = self.config.clone();
        Arc::new(move |ctx: RequestContext| {
            let config = config.clone();
            let inner = inner.clone();
            async move {
                let accept = ctx.header("accept-encoding").unwrap_or("").to_string();
                let mut res = inner.call(ctx).await?;

                let Some(encoding) = negotiate(&config, &accept) else {
                    return Ok(res);
                };
                if res.headers.contains("content-encoding") {
                    return Ok(res);
                }
                let Body::Bytes(bytes) = &res.body else {
                    return Ok(res);
                };
                if bytes.len() < config.threshold {
                    return Ok(res);
                }

                let compressed = match encoding {
                    Encoding::Gzip => gzip(bytes, config.level),
                    Encoding::Brotli => brotli_compress(bytes, config.level),
                };
                match compressed {
                    Ok(out) if out.len() < bytes.len() => {
                        res.body = Body::Bytes(Bytes::from(out));
                        res.headers.set(
                            "content-encoding",
                            match encoding {
                                Encoding::Gzip => "gzip",
                                Encoding::Brotli => "br",
                            },
                        );
                        res.headers.append("vary", "accept-encoding");
                    }
                    Ok(_) => {} // compression did not help; keep the original
                    Err(e) => {
                        tracing::warn!("compression failed, sending identity: {e}");
                    }
                }
                Ok(res)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Method;
    use crate::pipeline::Handler;

    fn big_body_handler() -> ArcHandler {
        Arc::new(|_ctx: RequestContext| async {
            Ok(Response::ok("abcdefgh".repeat(512))) // 4 KiB, highly compressible
        })
    }

    fn request(accept: Option<&str>) -> RequestContext {
        let mut ctx = RequestContext::new(Method::Get, "/");
        if let Some(a) = accept {
            ctx.headers.set("accept-encoding", a);
        }
        ctx
    }

    fn mw(gzip: bool, brotli: bool) -> Compression {
        Compression::new(CompressionConfig { gzip, brotli, threshold: 1024, level: 6 })
    }

    #[tokio::test]
    async fn gzip_when_accepted() {
        let wrapped = mw(true, false).wrap(big_body_handler());
        let res = wrapped.call(request(Some("gzip, deflate"))).await.unwrap();
        assert_eq!(res.headers.get("content-encoding"), Some("gzip"));
        assert!(res.body.len().unwrap() < 4096);
        // Round-trip through a decoder to prove the payload survived.
        let mut decoder = flate2::read::GzDecoder::new(res.body.as_bytes());
        let mut plain = String::new();
        std::io::Read::read_to_string(&mut decoder, &mut plain).unwrap();
        assert_eq!(plain, "abcdefgh".repeat(512));
    }

    #[tokio::test]
    async fn brotli_preferred_over_gzip() {
        let wrapped = mw(true, true).wrap(big_body_handler());
        let res = wrapped.call(request(Some("gzip, br"))).await.unwrap();
        assert_eq!(res.headers.get("content-encoding"), Some("br"));
    }

    #[tokio::test]
    async fn identity_when_not_accepted_or_small() {
        let wrapped = mw(true, true).wrap(big_body_handler());
        let res = wrapped.call(request(None)).await.unwrap();
        assert!(res.headers.get("content-encoding").is_none());

        let small: ArcHandler = Arc::new(|_ctx: RequestContext| async { Ok(Response::ok("tiny")) });
        let wrapped = mw(true, true).wrap(small);
        let res = wrapped.call(request(Some("gzip"))).await.unwrap();
        assert!(res.headers.get("content-encoding").is_none());
    }

    #[tokio::test]
    async fn streams_pass_through() {
        let streaming: ArcHandler = Arc::new(|_ctx: RequestContext| async {
            Ok(Response::stream(futures_util::stream::iter(vec![Ok(Bytes::from_static(
                b"chunk",
            ))])))
        });
        let wrapped = mw(true, true).wrap(streaming);
        let res = wrapped.call(request(Some("gzip"))).await.unwrap();
        assert!(res.headers.get("content-encoding").is_none());
        assert!(matches!(res.body, Body::Stream(_)));
    }
}
