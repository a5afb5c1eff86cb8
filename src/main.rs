//! Process entry point: load configuration, wire the sub-cluster agent and
//! the client-facing HTTP surface together, and run both until shutdown.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use edgecache_node::agent::SubClusterAgent;
use edgecache_node::auth::AuthTokenCache;
use edgecache_node::cache;
use edgecache_node::coalescer::DownloadCoalescer;
use edgecache_node::config::{Config, ConfigError, StorageKind};
use edgecache_node::error::AgentError;
use edgecache_node::exitcode;
use edgecache_node::identity::ClusterIdentity;
use edgecache_node::manifest_sync::ManifestSync;
use edgecache_node::router::{self, RouterState, SubClusterRouteState};
use edgecache_node::session::EnableStateMachine;
use edgecache_node::stats::access_log::AccessLogger;
use edgecache_node::stats::StatsAggregator;
use edgecache_node::storage::local::LocalStorage;
use edgecache_node::storage::set::StorageEntry;
use edgecache_node::storage::StorageSet;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run())
}

/// Swap `http(s)://` for `ws(s)://` — the control channel lives on the same
/// host as the coordinator's HTTP origin.
fn control_channel_url(base: &str) -> String {
    if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_string()
    }
}

/// Build every configured storage backend. Only `local` is implemented by
/// this node (spec.md §1 treats concrete backends as external
/// collaborators beyond a single reference implementation); other kinds
/// are logged and skipped rather than failing startup.
async fn build_storage(config: &Config, data_dir: &Path) -> anyhow::Result<Arc<StorageSet>> {
    let mut entries = Vec::new();
    for option in &config.storages {
        match option.kind {
            StorageKind::Local => {
                let path = option.path.clone().unwrap_or_else(|| option.id.clone());
                let root = data_dir.join(path);
                let backend = LocalStorage::new(root).await?;
                entries.push(StorageEntry {
                    id: option.id.clone(),
                    weight: option.weight,
                    backend: Arc::new(backend),
                });
            }
            StorageKind::Mount | StorageKind::Webdav => {
                tracing::warn!(
                    id = %option.id,
                    kind = ?option.kind,
                    "storage backend kind is not implemented by this node, skipping",
                );
            }
        }
    }
    Ok(Arc::new(StorageSet::new(entries)))
}

fn exit_code_for(err: &AgentError) -> i32 {
    match err {
        AgentError::Kicked => exitcode::ENVIRONMENT_ERROR,
        AgentError::Session(_) | AgentError::Auth(_) => exitcode::SERVER_OR_ENVIRONMENT_ERROR,
        AgentError::Config(_) => exitcode::CLIENT_UNEXPECTED_ERROR,
        AgentError::Io(_) => exitcode::CLIENT_OR_ENVIRONMENT_ERROR,
        AgentError::Storage(_) | AgentError::Sync(_) | AgentError::Download(_) | AgentError::Protocol(_) => {
            exitcode::CLIENT_OR_SERVER_ERROR
        }
    }
}

async fn run() -> anyhow::Result<()> {
    let config_path =
        PathBuf::from(std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config.yaml".to_string()));
    let data_dir =
        PathBuf::from(std::env::var("DATA_DIR").unwrap_or_else(|_| "data".to_string()));

    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(ConfigError::FirstRun(path)) => {
            tracing::info!(path = %path.display(), "wrote default configuration, edit it and restart");
            exitcode::exit(exitcode::CLEAN_SHUTDOWN);
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to load configuration");
            exitcode::exit(exitcode::CLIENT_UNEXPECTED_ERROR);
        }
    };

    tokio::fs::create_dir_all(&data_dir).await?;
    let _hmac_key = edgecache_node::config::load_or_create_hmac_key(&data_dir)?;

    let http = reqwest::Client::builder()
        .user_agent(router::X_POWERED_BY)
        .build()?;

    let public_port = if config.public_port != 0 {
        config.public_port
    } else {
        config.port
    };
    let identity = Arc::new(ClusterIdentity {
        id: config.cluster_id.clone(),
        secret: config.cluster_secret.clone(),
        host: config.public_host.clone(),
        public_port,
        public_hosts: if config.public_host.is_empty() {
            Vec::new()
        } else {
            vec![config.public_host.clone()]
        },
        byoc: config.byoc,
        prefix: config.coordinator_base_url.clone(),
    });

    let storage = build_storage(&config, &data_dir).await?;
    if storage.is_empty() {
        tracing::error!("no usable storage backends configured");
        exitcode::exit(exitcode::CLIENT_UNEXPECTED_ERROR);
    }

    let auth = Arc::new(AuthTokenCache::new(http.clone(), &identity));
    let coalescer = Arc::new(DownloadCoalescer::new(
        http.clone(),
        &config.coordinator_base_url,
        Arc::clone(&auth),
        Arc::clone(&storage),
    ));
    let response_cache = cache::build(&config.cache).await;
    let manifest = Arc::new(ManifestSync::new(
        http.clone(),
        &config.coordinator_base_url,
        Arc::clone(&auth),
        Arc::clone(&storage),
        Arc::clone(&coalescer),
        response_cache,
        &identity.id,
        config.download_max_conn,
    ));
    manifest.warm_start().await;
    if !config.advanced.skip_first_sync {
        if let Err(e) = manifest.sync().await {
            tracing::warn!(error = %e, "initial manifest sync failed, continuing with whatever fileset is available");
        }
    }

    let state_machine = Arc::new(EnableStateMachine::new(
        config.max_reconnect_count,
        Arc::clone(&storage),
    ));

    let stats = Arc::new(StatsAggregator::load(&data_dir).await?);
    Arc::clone(&stats).spawn_persistence_loop();
    let access_log = AccessLogger::spawn(Arc::clone(&stats));

    let mut sub_clusters = HashMap::new();
    sub_clusters.insert(
        identity.id.clone(),
        Arc::new(SubClusterRouteState {
            identity: Arc::clone(&identity),
            manifest: Arc::clone(&manifest),
            storage: Arc::clone(&storage),
            state_machine: Arc::clone(&state_machine),
        }),
    );

    let router_state = Arc::new(RouterState {
        sub_clusters,
        stats: Arc::clone(&stats),
        access_log,
        skip_signature_check: config.advanced.skip_signature_check,
        public_port,
        redirect_https: !config.advanced.do_not_redirect_https_to_secure_hostname,
    });

    let app = router::build_router(router_state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await?;
    tracing::info!(port = config.port, "client-facing HTTP surface listening");

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let control_url = control_channel_url(&config.coordinator_base_url);
    let sub_agent = Arc::new(SubClusterAgent::new(
        Arc::clone(&identity),
        control_url,
        Arc::clone(&auth),
        Arc::clone(&storage),
        Arc::clone(&coalescer),
        Arc::clone(&manifest),
        Arc::clone(&state_machine),
        Arc::clone(&stats),
        edgecache_node::VERSION,
        identity.byoc,
        config.advanced.no_fast_enable,
        std::time::Duration::from_secs(config.advanced.keepalive_timeout),
    ));
    let should_enable = Arc::new(AtomicBool::new(true));

    let sync_interval = std::time::Duration::from_secs(config.sync_interval_minutes.max(1) * 60);
    let sync_manifest = Arc::clone(&manifest);
    let mut sync_shutdown = shutdown_rx.clone();
    let sync_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sync_interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = sync_manifest.sync().await {
                        tracing::warn!(error = %e, "periodic manifest sync failed");
                    }
                }
                changed = sync_shutdown.changed() => {
                    if changed.is_err() || *sync_shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    });

    let agent_task = tokio::spawn({
        let sub_agent = Arc::clone(&sub_agent);
        let shutdown_rx = shutdown_rx.clone();
        async move { sub_agent.run(should_enable, shutdown_rx).await }
    });

    let server_shutdown_rx = shutdown_rx.clone();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        let mut rx = server_shutdown_rx;
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    });

    tokio::select! {
        result = server => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server exited with error");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown requested");
        }
    }

    let _ = shutdown_tx.send(true);
    sync_task.abort();

    let mut final_exit_code = exitcode::CLEAN_SHUTDOWN;
    match agent_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::error!(error = %e, "agent exited with error");
            final_exit_code = exit_code_for(&e);
        }
        Err(e) => {
            tracing::error!(error = %e, "agent task panicked");
            final_exit_code = exitcode::CLIENT_OR_SERVER_ERROR;
        }
    }

    if let Err(e) = stats.persist().await {
        tracing::warn!(error = %e, "failed to persist stats on shutdown");
    }

    if final_exit_code != exitcode::CLEAN_SHUTDOWN {
        exitcode::exit(final_exit_code);
    }
    Ok(())
}
