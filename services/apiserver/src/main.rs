// Osprey API server
// -----------------
// A Kubernetes-compatible API server for a gateway control plane. Resources
// are persisted not in etcd but in one of two pluggable backends: a local
// directory of YAML files, or a Nacos-style remote configuration service.
// Clients talk standard list/get/create/update/delete/watch; the storage
// layer turns backend change detection (filesystem events, polling plus
// remote subscriptions) into Kubernetes watch streams.

use anyhow::Context;
use clap::Parser;
use osprey_apiserver::config::{Options, StorageMode};
use osprey_apiserver::nacos::http::{HttpConfigClient, HttpConfigClientOptions};
use osprey_apiserver::registry::{build_registry, StorageBackend};
use osprey_apiserver::{observability, server};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let options = Options::parse();
    let metrics_handle = observability::init_observability("osprey-apiserver");
    options.validate().context("invalid options")?;

    if options.auth_enabled {
        // Authentication is a declared stub: the flag is accepted but every
        // request is allowed.
        tracing::warn!("--auth-enabled is set, but authentication is a stub; all requests are allowed");
    }

    let backend = match options.storage {
        StorageMode::File => {
            tracing::info!(root = %options.file_root_dir.display(), "using file storage");
            StorageBackend::File {
                root: options.file_root_dir.clone(),
            }
        }
        StorageMode::Nacos => {
            let servers = options.nacos_server_urls()?;
            tracing::info!(servers = ?options.nacos_server, namespace = %options.nacos_ns_id, "using nacos storage");
            let client = HttpConfigClient::new(HttpConfigClientOptions {
                servers,
                namespace_id: options.nacos_ns_id.clone(),
                username: options.nacos_username.clone(),
                password: options.nacos_password.clone(),
                timeout: options.nacos_timeout(),
            })
            .context("failed to build config service client")?;
            StorageBackend::Nacos {
                client: Arc::new(client),
                encryption_key: options.load_encryption_key()?,
                settings: options.nacos_settings(),
            }
        }
    };

    let registry = Arc::new(build_registry(&backend).context("failed to build storage registry")?);

    tokio::spawn(observability::serve_metrics(
        metrics_handle,
        options.metrics_bind,
    ));

    let app = server::build_router(Arc::clone(&registry));
    let listener = tokio::net::TcpListener::bind(options.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", options.bind_addr))?;
    tracing::info!(addr = %options.bind_addr, "api server listening");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    registry.destroy_all();
    Ok(())
}
