//! Cluster identity: the tuple that authenticates this node to the
//! coordinator and tells it what to advertise (spec.md §3).

use serde::{Deserialize, Serialize};

/// Identity and advertisement data for one sub-cluster (tenant).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterIdentity {
    /// Authenticates to the coordinator, together with `secret`.
    pub id: String,
    pub secret: String,
    /// Advertised host; not necessarily the public-facing hostname.
    pub host: String,
    pub public_port: u16,
    /// Accepted virtual hostnames; `*.example` wildcards permitted.
    pub public_hosts: Vec<String>,
    /// "Bring your own certificate": skip the coordinator's `request-cert`.
    pub byoc: bool,
    /// Coordinator base URL.
    pub prefix: String,
}

impl ClusterIdentity {
    /// Whether `host` matches one of `public_hosts`, honoring `*.suffix`
    /// wildcard entries (`handler.go:ServeHTTP` redirect logic).
    pub fn matches_public_host(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        self.public_hosts.iter().any(|h| {
            if let Some(suffix) = h.strip_prefix("*.") {
                host.ends_with(suffix)
            } else {
                host == *h
            }
        })
    }

    /// The first non-wildcard entry in `public_hosts`, used as the redirect
    /// target when a client connects on an unrecognized hostname.
    pub fn first_concrete_host(&self) -> Option<&str> {
        self.public_hosts
            .iter()
            .find(|h| !h.starts_with("*."))
            .map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> ClusterIdentity {
        ClusterIdentity {
            id: "node-1".into(),
            secret: "s3cr3t".into(),
            host: "10.0.0.1".into(),
            public_port: 8080,
            public_hosts: vec!["*.cdn.example".into(), "cdn.example".into()],
            byoc: false,
            prefix: "https://coordinator.example".into(),
        }
    }

    #[test]
    fn wildcard_matches_subdomain() {
        let id = identity();
        assert!(id.matches_public_host("a.cdn.example"));
        assert!(id.matches_public_host("cdn.example"));
        assert!(!id.matches_public_host("other.example"));
    }

    #[test]
    fn first_concrete_host_skips_wildcards() {
        let id = identity();
        assert_eq!(id.first_concrete_host(), Some("cdn.example"));
    }
}
