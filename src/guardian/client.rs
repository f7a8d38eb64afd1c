//! Guardian-controlled HTTP clients
//!
//! Hostnames are resolved through [`GuardedResolver`], which drops every
//! address the policy refuses. Literal IP hosts skip DNS entirely, so callers
//! must run [`Policy::check_url`] before sending. Redirect targets are checked
//! by the client's redirect policy before they are followed.

use super::policy::Policy;
use crate::error::{GatewayError, Result};
use hyper::client::connect::dns::Name;
use reqwest::dns::{Addrs, Resolve, Resolving};
use reqwest::redirect;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Redirects followed before the client gives up
pub const MAX_REDIRECTS: usize = 10;

/// Transport settings for outbound tool calls
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Overall per-request timeout
    pub timeout: Duration,
    /// TCP connect + TLS handshake timeout
    pub connect_timeout: Duration,
    /// How long an idle pooled connection is kept
    pub pool_idle_timeout: Duration,
    /// Idle connections kept per host
    pub pool_max_idle_per_host: usize,
    /// Honour HTTP(S)_PROXY / NO_PROXY from the environment
    pub use_env_proxy: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        Self {
            timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            pool_idle_timeout: Duration::from_secs(90),
            pool_max_idle_per_host: parallelism + 1,
            use_env_proxy: true,
        }
    }
}

impl ClientOptions {
    /// Options for OAuth token exchanges
    pub fn token_exchange() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            ..Self::default()
        }
    }
}

/// DNS resolver that filters resolved addresses through the guardian policy
pub struct GuardedResolver {
    policy: Arc<Policy>,
}

impl GuardedResolver {
    pub fn new(policy: Arc<Policy>) -> Self {
        Self { policy }
    }
}

impl Resolve for GuardedResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let policy = self.policy.clone();
        Box::pin(async move {
            let host = name.as_str().to_string();
            let resolved = tokio::net::lookup_host((host.as_str(), 0)).await?;

            let mut allowed: Vec<SocketAddr> = Vec::new();
            let mut refusal = None;
            for addr in resolved {
                match policy.check_ip(addr.ip()) {
                    Ok(()) => allowed.push(addr),
                    Err(e) => {
                        warn!(host = %host, ip = %addr.ip(), "guardian refused resolved address");
                        refusal = Some(e);
                    }
                }
            }

            if allowed.is_empty() {
                let err = refusal.unwrap_or_else(|| {
                    GatewayError::bad_host(format!("no addresses resolved for {}", host))
                });
                return Err(Box::new(err) as Box<dyn std::error::Error + Send + Sync>);
            }

            let addrs: Addrs = Box::new(allowed.into_iter());
            Ok(addrs)
        })
    }
}

/// Redirect policy that refuses hops to addresses the guardian blocks
pub fn guarded_redirect_policy(policy: Arc<Policy>) -> redirect::Policy {
    redirect::Policy::custom(move |attempt| {
        if let Err(e) = policy.check_url(attempt.url()) {
            warn!(url = %attempt.url(), "guardian refused redirect target");
            return attempt.error(e);
        }
        if attempt.previous().len() >= MAX_REDIRECTS {
            return attempt.stop();
        }
        attempt.follow()
    })
}

/// Build an HTTP client whose every dial is checked by `policy`
pub fn guarded_client(policy: Arc<Policy>, options: &ClientOptions) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .dns_resolver(Arc::new(GuardedResolver::new(policy.clone())))
        .redirect(guarded_redirect_policy(policy))
        .timeout(options.timeout)
        .connect_timeout(options.connect_timeout)
        .pool_idle_timeout(options.pool_idle_timeout)
        .pool_max_idle_per_host(options.pool_max_idle_per_host);

    if !options.use_env_proxy {
        builder = builder.no_proxy();
    }

    builder
        .build()
        .map_err(|e| GatewayError::config(format!("failed to build guarded HTTP client: {}", e)))
}

/// Walk an error chain looking for a guardian refusal
pub fn find_guardian_error<'a>(
    err: &'a (dyn std::error::Error + 'static),
) -> Option<&'a GatewayError> {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(gateway_err) = e.downcast_ref::<GatewayError>() {
            if gateway_err.guardian_kind().is_some() {
                return Some(gateway_err);
            }
        }
        current = e.source();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GuardianErrorKind;

    #[test]
    fn test_default_options_match_transport_contract() {
        let options = ClientOptions::default();
        assert_eq!(options.timeout, Duration::from_secs(60));
        assert_eq!(options.pool_idle_timeout, Duration::from_secs(90));
        assert_eq!(options.connect_timeout, Duration::from_secs(10));
        assert!(options.pool_max_idle_per_host >= 2);
        assert_eq!(ClientOptions::token_exchange().timeout, Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_resolver_refuses_loopback_names() {
        let resolver = GuardedResolver::new(Arc::new(Policy::new()));
        let name: Name = "localhost".parse().unwrap();
        let err = match resolver.resolve(name).await {
            Ok(_) => panic!("localhost must not resolve under the default policy"),
            Err(e) => e,
        };
        let guardian = find_guardian_error(err.as_ref()).expect("guardian error in chain");
        assert_eq!(guardian.guardian_kind(), Some(GuardianErrorKind::BlockedIp));
    }

    #[tokio::test]
    async fn test_resolver_allows_loopback_when_permitted() {
        let resolver = GuardedResolver::new(Arc::new(Policy::new().with_allow_loopback(true)));
        let name: Name = "localhost".parse().unwrap();
        let addrs: Vec<SocketAddr> = resolver.resolve(name).await.unwrap().collect();
        assert!(!addrs.is_empty());
        assert!(addrs.iter().all(|a| a.ip().is_loopback()));
    }

    #[tokio::test]
    async fn test_guarded_client_blocks_private_literal() {
        let policy = Arc::new(Policy::new());
        let url = url::Url::parse("http://192.168.1.1:80/").unwrap();
        let err = policy.check_url(&url).unwrap_err();
        assert_eq!(err.guardian_kind(), Some(GuardianErrorKind::BlockedIp));
        assert!(guarded_client(policy, &ClientOptions::default()).is_ok());
    }
}
