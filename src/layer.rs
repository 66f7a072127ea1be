//! Tower integration.
//!
//! [`GatewayLayer`] wraps any `Service` whose requests implement [`ProviderRequest`], running
//! each call through [`Gateway::execute`]. After a failover the inner service is called with a
//! request re-targeted at the backup provider, and every attempt sees the provider settings
//! recovery chose for it through [`ProviderRequest::with_settings`].

use crate::error::ResilienceError;
use crate::gateway::{CallRequest, Gateway};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::fmt;
use std::task::{Context, Poll};
use tower::ServiceExt;
use tower_layer::Layer;
use tower_service::Service;

/// A request addressed to one provider.
pub trait ProviderRequest: Clone + Send + 'static {
    fn provider(&self) -> &str;

    /// Operation name recorded by the performance monitor.
    fn operation(&self) -> &str;

    /// Cache key; `None` bypasses the result cache.
    fn cache_key(&self) -> Option<String> {
        None
    }

    /// Artifact kind selecting the cache TTL.
    fn cache_kind(&self) -> Option<&str> {
        None
    }

    /// The same request addressed to `provider`.
    fn with_provider(&self, provider: &str) -> Self;

    /// The request adjusted to the provider settings of this attempt, which recovery may have
    /// replaced (fallback region, longer timeout). Ignores them by default.
    fn with_settings(self, _settings: &HashMap<String, String>) -> Self {
        self
    }
}

/// Layer routing calls through a shared [`Gateway`].
pub struct GatewayLayer<T> {
    gateway: Gateway<T>,
}

impl<T> GatewayLayer<T> {
    pub fn new(gateway: Gateway<T>) -> Self {
        Self { gateway }
    }
}

impl<T> Clone for GatewayLayer<T> {
    fn clone(&self) -> Self {
        Self { gateway: self.gateway.clone() }
    }
}

impl<T> fmt::Debug for GatewayLayer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayLayer").field("gateway", &self.gateway).finish()
    }
}

impl<S, T> Layer<S> for GatewayLayer<T> {
    type Service = GatewayService<S, T>;

    fn layer(&self, inner: S) -> Self::Service {
        GatewayService { inner, gateway: self.gateway.clone() }
    }
}

/// Service produced by [`GatewayLayer`].
pub struct GatewayService<S, T> {
    inner: S,
    gateway: Gateway<T>,
}

impl<S: Clone, T> Clone for GatewayService<S, T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), gateway: self.gateway.clone() }
    }
}

impl<S, T> fmt::Debug for GatewayService<S, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayService").field("gateway", &self.gateway).finish_non_exhaustive()
    }
}

impl<S, T, Req> Service<Req> for GatewayService<S, T>
where
    Req: ProviderRequest,
    S: Service<Req, Response = T> + Clone + Send + 'static,
    S::Error: fmt::Display + Send + 'static,
    S::Future: Send + 'static,
    T: Clone + Send + Sync + 'static,
{
    type Response = T;
    type Error = ResilienceError<S::Error>;
    type Future = BoxFuture<'static, Result<T, Self::Error>>;

    // Readiness is checked per attempt inside `call`; capacity is enforced by the gateway.
    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let gateway = self.gateway.clone();
        let inner = self.inner.clone();
        Box::pin(async move {
            let mut call = CallRequest::new(req.provider(), req.operation());
            call.cache_key = req.cache_key();
            call.cache_kind = req.cache_kind().map(str::to_string);
            gateway
                .execute(call, move |ctx| {
                    let req = if ctx.provider == req.provider() {
                        req.clone()
                    } else {
                        req.with_provider(&ctx.provider)
                    };
                    inner.clone().oneshot(req.with_settings(&ctx.settings))
                })
                .await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RtlConfig;
    use crate::sleeper::InstantSleeper;
    use tower::{service_fn, ServiceBuilder};

    #[derive(Debug, Clone)]
    struct Synthesize {
        provider: String,
        text: String,
        region: Option<String>,
    }

    impl ProviderRequest for Synthesize {
        fn provider(&self) -> &str {
            &self.provider
        }

        fn operation(&self) -> &str {
            "synthesize"
        }

        fn cache_key(&self) -> Option<String> {
            Some(format!("{}:audio:{}", self.provider, self.text))
        }

        fn with_provider(&self, provider: &str) -> Self {
            Self { provider: provider.to_string(), ..self.clone() }
        }

        fn with_settings(mut self, settings: &HashMap<String, String>) -> Self {
            self.region = settings.get("region").cloned();
            self
        }
    }

    #[tokio::test]
    async fn layer_runs_calls_through_gateway() {
        let gateway: Gateway<String> =
            Gateway::builder(RtlConfig::default()).provider("polly").sleeper(InstantSleeper).build();
        let svc = ServiceBuilder::new().layer(GatewayLayer::new(gateway.clone())).service(
            service_fn(|req: Synthesize| async move {
                Ok::<_, std::io::Error>(format!("{} says {}", req.provider, req.text))
            }),
        );

        let req = Synthesize { provider: "polly".into(), text: "hi".into(), region: None };
        let out = svc.clone().oneshot(req.clone()).await.unwrap();
        assert_eq!(out, "polly says hi");
        svc.oneshot(req).await.unwrap();
        assert_eq!(gateway.cache().stats().hits, 1);
    }

    #[tokio::test]
    async fn replacement_settings_reach_inner_service() {
        let mut settings = HashMap::new();
        settings.insert("region".to_string(), "eastus".to_string());
        settings.insert("fallback_region".to_string(), "westeurope".to_string());
        let gateway: Gateway<String> = Gateway::builder(RtlConfig::default())
            .provider("azure")
            .provider_settings("azure", settings)
            .sleeper(InstantSleeper)
            .build();
        let svc = GatewayLayer::new(gateway).layer(service_fn(|req: Synthesize| async move {
            match req.region.as_deref() {
                Some("westeurope") => Ok(format!("{} from westeurope", req.text)),
                _ => Err(std::io::Error::other("connection refused")),
            }
        }));

        let req = Synthesize { provider: "azure".into(), text: "hi".into(), region: None };
        assert_eq!(svc.oneshot(req).await.unwrap(), "hi from westeurope");
    }
}
