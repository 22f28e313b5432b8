//! Issuer discovery from a user-supplied identity URL.
//!
//! A WebID's server advertises its OIDC issuer through a `Link`
//! response header with the relation `oidc.issuer`. Discovery sends a
//! lightweight `OPTIONS` probe to the identity URL and reads that
//! relation; nothing else about the response body is interpreted.
//!
//! Successful probes are cached in a small process-local LRU keyed by
//! the normalized identity URL; failures are never cached.

use lru::LruCache;
use reqwest::{Client, Method};
use std::num::NonZeroUsize;
use std::sync::Mutex;
use tracing::{debug, instrument};
use url::Url;

use super::AuthError;

/// Link relation a WebID server uses to advertise its issuer.
pub const OIDC_ISSUER_REL: &str = "oidc.issuer";

const DISCOVERY_CACHE_CAPACITY: usize = 128;

/// Resolves an issuer URL from an identity URL via an OPTIONS probe.
pub struct IssuerDiscovery {
    http: Client,
    cache: Mutex<LruCache<String, String>>,
}

impl IssuerDiscovery {
    pub fn new(http: Client) -> Self {
        Self {
            http,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(DISCOVERY_CACHE_CAPACITY).expect("capacity is non-zero"),
            )),
        }
    }

    /// Resolve the OIDC issuer for an identity URL.
    #[instrument(skip(self))]
    pub async fn discover_issuer(&self, identity_url: &str) -> Result<String, AuthError> {
        let url = Url::parse(identity_url.trim()).map_err(|e| {
            AuthError::Discovery(format!("invalid identity URL '{}': {}", identity_url, e))
        })?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(AuthError::Discovery(format!(
                "identity URL must be http(s), got '{}'",
                identity_url
            )));
        }

        let key = url.to_string();
        if let Some(issuer) = self.cache.lock().expect("cache lock poisoned").get(&key) {
            debug!(identity_url = %key, issuer = %issuer, "Issuer resolved from cache");
            return Ok(issuer.clone());
        }

        let res = self
            .http
            .request(Method::OPTIONS, url)
            .send()
            .await
            .map_err(|e| AuthError::Discovery(format!("probe failed: {}", e)))?;

        let mut issuer = None;
        for value in res.headers().get_all(reqwest::header::LINK) {
            let Ok(value) = value.to_str() else { continue };
            if let Some(found) = issuer_from_link_header(value) {
                issuer = Some(found);
                break;
            }
        }

        let issuer = issuer.ok_or_else(|| {
            AuthError::Discovery(format!(
                "no '{}' link relation advertised by {}",
                OIDC_ISSUER_REL, key
            ))
        })?;

        debug!(identity_url = %key, issuer = %issuer, "Issuer discovered");
        self.cache
            .lock()
            .expect("cache lock poisoned")
            .put(key, issuer.clone());
        Ok(issuer)
    }
}

/// Extract the `oidc.issuer` target from a `Link` header value.
///
/// Handles comma-separated link values and space-separated relation
/// lists, quoted or bare, per RFC 8288's common forms.
fn issuer_from_link_header(value: &str) -> Option<String> {
    for link in value.split(',') {
        let mut parts = link.split(';');
        let target = parts.next()?.trim();
        if !(target.starts_with('<') && target.ends_with('>')) {
            continue;
        }
        let target = &target[1..target.len() - 1];

        for param in parts {
            let Some((name, raw)) = param.split_once('=') else {
                continue;
            };
            if name.trim() != "rel" {
                continue;
            }
            let rels = raw.trim().trim_matches('"');
            if rels.split_whitespace().any(|rel| rel == OIDC_ISSUER_REL) {
                return Some(target.to_string());
            }
        }
    }
    None
}
