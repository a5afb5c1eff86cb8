//! Client-facing HTTP surface (spec.md §4.7): `/download/{hash}`,
//! `/measure/{n}`, `/robots.txt`, and the pre-dispatch host redirect.
//! `/api/v0/...` (internal coordinator-facing API) and `/bmclapi/...`
//! (hijack proxy) are out of core scope per spec.md §1 and SPEC_FULL.md
//! §11 and are not mounted here.

pub mod download;
pub mod middleware;
pub mod range;
pub mod signature;

use std::collections::HashMap;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;

use crate::identity::ClusterIdentity;
use crate::manifest_sync::ManifestSync;
use crate::session::EnableStateMachine;
use crate::stats::access_log::AccessLogger;
use crate::stats::StatsAggregator;
use crate::storage::StorageSet;

pub const X_POWERED_BY: &str = concat!("edgecache-node/", env!("CARGO_PKG_VERSION"));
pub const ROBOTS_TXT: &str = "User-agent: *\nDisallow: /\n";

/// Everything one sub-cluster (tenant) contributes to request routing.
pub struct SubClusterRouteState {
    pub identity: Arc<ClusterIdentity>,
    pub manifest: Arc<ManifestSync>,
    pub storage: Arc<StorageSet>,
    pub state_machine: Arc<EnableStateMachine>,
}

/// Shared state for the whole client-facing HTTP surface. A request is
/// routed to a sub-cluster by matching its Host header against each
/// candidate's `public_hosts` (spec.md's multi-tenant `Cluster`/
/// `SubCluster` shape, see DESIGN.md).
pub struct RouterState {
    pub sub_clusters: HashMap<String, Arc<SubClusterRouteState>>,
    pub stats: Arc<StatsAggregator>,
    pub access_log: AccessLogger,
    pub skip_signature_check: bool,
    pub public_port: u16,
    pub redirect_https: bool,
}

impl RouterState {
    /// The sub-cluster whose `public_hosts` accept `host`, if any.
    pub fn find_by_host(&self, host: &str) -> Option<&Arc<SubClusterRouteState>> {
        self.sub_clusters
            .values()
            .find(|sc| sc.identity.matches_public_host(host))
    }

    /// First concrete (non-wildcard) public host across every configured
    /// sub-cluster, used as a host-redirect target.
    pub fn first_concrete_host(&self) -> Option<String> {
        self.sub_clusters
            .values()
            .find_map(|sc| sc.identity.first_concrete_host().map(str::to_string))
    }
}

/// Build the axum [`Router`] for the client-facing surface. Middleware
/// layers apply bottom-up: `host_redirect` runs first so it can short
/// circuit before `access_log` starts timing a request that's about to be
/// redirected anyway.
pub fn build_router(state: Arc<RouterState>) -> Router {
    Router::new()
        .route("/download/:hash", get(download::handle_download))
        .route("/measure/:size_mb", get(download::handle_measure))
        .route("/robots.txt", get(download::handle_robots))
        .layer(axum::middleware::from_fn_with_state(
            Arc::clone(&state),
            middleware::access_log,
        ))
        .layer(axum::middleware::from_fn_with_state(
            Arc::clone(&state),
            middleware::host_redirect,
        ))
        .with_state(state)
}
