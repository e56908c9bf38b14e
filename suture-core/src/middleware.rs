//! Response middleware seam between the proxy and the healing engine.
//!
//! The proxy buffers each successful upstream body and hands it to one
//! [`ResponseMiddleware`]. [`HealingMiddleware`] runs the engine;
//! [`PassThroughMiddleware`] is installed when healing is disabled.

use std::future::Future;
use std::pin::Pin;
use std::time::Instant;

use bytes::Bytes;
use tracing::debug;

use crate::error::Result;
use crate::healer::HealingEngine;
use crate::transform::HealingMetadata;

/// Request-scoped data the middleware may consult.
pub struct MiddlewareContext<'a> {
    /// Request path, used for schema lookup
    pub route: &'a str,

    /// When the proxy accepted the request
    pub request_start: Instant,
}

/// Result of middleware processing.
pub enum MiddlewareResult {
    /// Serve the upstream body unchanged
    PassThrough {
        metadata: HealingMetadata,
    },

    /// Serve a rewritten body
    Transformed {
        body: Bytes,
        metadata: HealingMetadata,
    },
}

impl MiddlewareResult {
    #[inline]
    pub fn was_healed(&self) -> bool {
        matches!(self, MiddlewareResult::Transformed { .. })
    }

    #[inline]
    pub fn metadata(&self) -> &HealingMetadata {
        match self {
            MiddlewareResult::PassThrough { metadata } | MiddlewareResult::Transformed { metadata, .. } => metadata,
        }
    }
}

/// Response middleware for the healing pipeline.
///
/// An `Err` means the body could not be processed at all; the proxy then
/// serves the raw body and flags the error. Steady-state outcomes such as
/// low confidence or a rejected mapping are `PassThrough`, not errors.
pub trait ResponseMiddleware: Send + Sync {
    fn process<'a>(
        &'a self,
        ctx: &'a MiddlewareContext<'a>,
        body: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = Result<MiddlewareResult>> + Send + 'a>>;
}

/// Never touches the body.
pub struct PassThroughMiddleware;

impl ResponseMiddleware for PassThroughMiddleware {
    fn process<'a>(
        &'a self,
        ctx: &'a MiddlewareContext<'a>,
        _body: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = Result<MiddlewareResult>> + Send + 'a>> {
        Box::pin(async move {
            Ok(MiddlewareResult::PassThrough {
                metadata: HealingMetadata::passthrough(ctx.request_start.elapsed().as_micros() as u64),
            })
        })
    }
}

/// Runs every body through the [`HealingEngine`].
pub struct HealingMiddleware {
    engine: HealingEngine,
}

impl HealingMiddleware {
    pub fn new(engine: HealingEngine) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &HealingEngine {
        &self.engine
    }
}

impl ResponseMiddleware for HealingMiddleware {
    fn process<'a>(
        &'a self,
        ctx: &'a MiddlewareContext<'a>,
        body: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = Result<MiddlewareResult>> + Send + 'a>> {
        Box::pin(async move {
            let outcome = self.engine.heal(ctx.route, body).await?;
            Ok(match outcome.body {
                Some(healed) => {
                    debug!(
                        route = ctx.route,
                        from_cache = outcome.metadata.from_cache,
                        version = outcome.metadata.mapping_version,
                        "Response healed"
                    );
                    MiddlewareResult::Transformed {
                        body: healed,
                        metadata: outcome.metadata,
                    }
                }
                None => MiddlewareResult::PassThrough {
                    metadata: outcome.metadata,
                },
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::healer::EngineConfig;
    use crate::inference::HeuristicBackend;
    use crate::schema::SchemaRegistry;

    fn make_context(route: &str) -> MiddlewareContext<'_> {
        MiddlewareContext {
            route,
            request_start: Instant::now(),
        }
    }

    fn healing() -> HealingMiddleware {
        HealingMiddleware::new(HealingEngine::new(
            EngineConfig::default(),
            Arc::new(SchemaRegistry::with_defaults()),
            Arc::new(HeuristicBackend::new()),
        ))
    }

    #[tokio::test]
    async fn test_passthrough_middleware() {
        let ctx = make_context("/api/users/1");
        let result = PassThroughMiddleware.process(&ctx, br#"{"uid": 1}"#).await.unwrap();
        assert!(!result.was_healed());
        assert!(!result.metadata().healed);
    }

    #[tokio::test]
    async fn test_healing_middleware_transforms_drift() {
        let middleware = healing();
        let ctx = make_context("/api/users/3");
        let result = middleware
            .process(&ctx, br#"{"uid": 3, "full_name": "Grace"}"#)
            .await
            .unwrap();
        assert!(result.was_healed());
        match result {
            MiddlewareResult::Transformed { body, metadata } => {
                let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
                assert_eq!(value["user_id"], 3);
                assert_eq!(metadata.mapping_version, 1);
            }
            MiddlewareResult::PassThrough { .. } => panic!("expected transformed body"),
        }
    }

    #[tokio::test]
    async fn test_healing_middleware_leaves_valid_body() {
        let middleware = healing();
        let ctx = make_context("/api/users/3");
        let result = middleware
            .process(&ctx, br#"{"user_id": 3, "name": "Grace"}"#)
            .await
            .unwrap();
        assert!(!result.was_healed());
        assert_eq!(middleware.engine().cache().len(), 0);
    }

    #[tokio::test]
    async fn test_malformed_body_is_error() {
        let middleware = healing();
        let ctx = make_context("/api/users/3");
        assert!(middleware.process(&ctx, b"<html>").await.is_err());
    }
}
