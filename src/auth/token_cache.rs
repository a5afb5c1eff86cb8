//! Bearer-token acquisition and caching for coordinator calls
//! (spec.md §4.1).
//!
//! `getToken` performs a two-step challenge/response exchange the first
//! time it's needed (or once the cached token is within a skew of expiry)
//! and is single-flight: concurrent callers during a refresh all receive
//! the same in-progress result rather than each kicking off their own
//! exchange. Mirrors the teacher's `enterprise::auth::jwt` token-manager
//! shape (cached claims behind a lock, refresh-ahead-of-expiry) but the
//! exchange itself is HMAC challenge/response rather than JWT issuance,
//! per spec.md's coordinator protocol.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

use crate::identity::ClusterIdentity;

type HmacSha256 = Hmac<Sha256>;

/// Refresh once the cached token is within this long of expiring.
const REFRESH_SKEW: ChronoDuration = ChronoDuration::seconds(120);

#[derive(Error, Debug, Clone)]
pub enum AuthError {
    #[error("coordinator request failed: {0}")]
    Request(String),
    #[error("coordinator rejected credentials: HTTP {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("malformed challenge/token response: {0}")]
    Challenge(String),
}

pub type AuthResult<T> = Result<T, AuthError>;

/// A cached bearer token and its expiry.
#[derive(Debug, Clone)]
pub struct AuthToken {
    pub jwt: String,
    pub expires_at: DateTime<Utc>,
}

impl AuthToken {
    fn needs_refresh(&self) -> bool {
        Utc::now() + REFRESH_SKEW >= self.expires_at
    }
}

#[derive(Deserialize)]
struct ChallengeResponse {
    challenge: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    token: String,
    ttl: i64,
}

/// Caches and refreshes the bearer token used to authenticate this
/// sub-cluster's calls to the coordinator's HTTP origin.
pub struct AuthTokenCache {
    http: reqwest::Client,
    base_url: String,
    cluster_id: String,
    cluster_secret: String,
    cached: RwLock<Option<AuthToken>>,
    refresh_gate: Mutex<()>,
}

impl AuthTokenCache {
    pub fn new(http: reqwest::Client, identity: &ClusterIdentity) -> Self {
        Self {
            http,
            base_url: identity.prefix.trim_end_matches('/').to_string(),
            cluster_id: identity.id.clone(),
            cluster_secret: identity.secret.clone(),
            cached: RwLock::new(None),
            refresh_gate: Mutex::new(()),
        }
    }

    /// Return a valid token, refreshing if missing or near expiry.
    /// Concurrent callers serialize on `refresh_gate`; whichever arrives
    /// second observes the first's freshly cached result and does not
    /// repeat the exchange.
    pub async fn get_token(&self) -> AuthResult<AuthToken> {
        if let Some(token) = self.cached.read().await.as_ref() {
            if !token.needs_refresh() {
                return Ok(token.clone());
            }
        }

        let _permit = self.refresh_gate.lock().await;

        if let Some(token) = self.cached.read().await.as_ref() {
            if !token.needs_refresh() {
                return Ok(token.clone());
            }
        }

        let token = self.exchange().await?;
        *self.cached.write().await = Some(token.clone());
        Ok(token)
    }

    async fn exchange(&self) -> AuthResult<AuthToken> {
        let challenge_url = format!(
            "{}/openbmclapi-agent/challenge?clusterId={}",
            self.base_url, self.cluster_id
        );
        let resp = self
            .http
            .get(&challenge_url)
            .send()
            .await
            .map_err(|e| AuthError::Request(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(AuthError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        let challenge: ChallengeResponse = resp
            .json()
            .await
            .map_err(|e| AuthError::Challenge(e.to_string()))?;

        let mut mac = HmacSha256::new_from_slice(self.cluster_secret.as_bytes())
            .map_err(|e| AuthError::Challenge(e.to_string()))?;
        mac.update(challenge.challenge.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());

        let token_url = format!("{}/openbmclapi-agent/token", self.base_url);
        let resp = self
            .http
            .post(&token_url)
            .json(&serde_json::json!({
                "clusterId": self.cluster_id,
                "challenge": challenge.challenge,
                "signature": signature,
            }))
            .send()
            .await
            .map_err(|e| AuthError::Request(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(AuthError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        let parsed: TokenResponse = resp
            .json()
            .await
            .map_err(|e| AuthError::Challenge(e.to_string()))?;

        Ok(AuthToken {
            jwt: parsed.token,
            expires_at: Utc::now() + ChronoDuration::seconds(parsed.ttl),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_needs_refresh_within_skew() {
        let token = AuthToken {
            jwt: "x".into(),
            expires_at: Utc::now() + ChronoDuration::seconds(30),
        };
        assert!(token.needs_refresh());
    }

    #[test]
    fn token_does_not_need_refresh_far_from_expiry() {
        let token = AuthToken {
            jwt: "x".into(),
            expires_at: Utc::now() + ChronoDuration::seconds(3600),
        };
        assert!(!token.needs_refresh());
    }
}
