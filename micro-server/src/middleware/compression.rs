use std::io::Write as _;

use async_trait::async_trait;
use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use micro_core::{Context, MicroError};

use super::{Middleware, Next};

const DEFAULT_MIN_SIZE: usize = 256;

/// Gzip the response body when the client advertises support.
pub struct CompressionMiddleware {
    min_size: usize,
}

impl CompressionMiddleware {
    pub fn new() -> Self {
        CompressionMiddleware {
            min_size: DEFAULT_MIN_SIZE,
        }
    }

    /// Bodies smaller than this are left alone.
    pub fn with_min_size(mut self, min_size: usize) -> Self {
        self.min_size = min_size;
        self
    }
}

impl Default for CompressionMiddleware {
    fn default() -> Self {
        CompressionMiddleware::new()
    }
}

#[async_trait]
impl Middleware for CompressionMiddleware {
    fn name(&self) -> &'static str {
        "compression"
    }

    async fn handle(&self, ctx: &mut Context, next: Next<'_>) -> Result<(), MicroError> {
        let accepts_gzip = ctx
            .request
            .header("accept-encoding")
            .map(|v| v.to_ascii_lowercase().contains("gzip"))
            .unwrap_or(false);
        let result = next.run(ctx).await;

        if accepts_gzip
            && result.is_ok()
            && ctx.response.body.len() >= self.min_size
            && ctx.response.header("content-encoding").is_none()
        {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            let compressed = encoder
                .write_all(&ctx.response.body)
                .and_then(|_| encoder.finish());
            if let Ok(compressed) = compressed {
                if compressed.len() < ctx.response.body.len() {
                    ctx.response.body = Bytes::from(compressed);
                    ctx.response.set_header("content-encoding", "gzip");
                }
            }
        }
        result
    }
}
