// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Engine services embedded in the CLI process
//!
//! Builds the registry client, LVM block provider, restic adapter and the
//! loopback object-store proxy restic talks to, all from the configuration
//! manifest.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use boxvol_core::application::{EngineServices, MountLeaseClient, ObjectStoreProxy, VolumeBinding};
use boxvol_core::domain::engine_config::EngineConfigManifest;
use boxvol_core::domain::local_state::ClientIdentity;
use boxvol_core::domain::volume::VolumeId;
use boxvol_core::infrastructure::backup::ResticBackupTool;
use boxvol_core::infrastructure::block::{create_block_provider, BlockBackend};
use boxvol_core::infrastructure::command::{CommandRunner, SystemCommandRunner};
use boxvol_core::infrastructure::event_bus::{EventBus, EventBusError};
use boxvol_core::infrastructure::markers::TmpfsMarker;
use boxvol_core::infrastructure::object_store::HttpObjectStoreGateway;
use boxvol_core::infrastructure::registry::HttpVolumeRegistry;
use boxvol_core::presentation::proxy_api;

pub fn registry(config: &EngineConfigManifest) -> Result<HttpVolumeRegistry> {
    let token = config.resolved_token().context("Failed to resolve registry token")?;
    HttpVolumeRegistry::new(
        config.spec.registry.url.clone(),
        token,
        config.spec.registry.request_timeout,
    )
    .context("Failed to build registry client")
}

/// Default directory of a volume under the configured root
pub fn volume_dir(config: &EngineConfigManifest, volume_id: &VolumeId, dir: Option<PathBuf>) -> PathBuf {
    dir.unwrap_or_else(|| config.spec.storage.volumes_root.join(volume_id.as_str()))
}

// ============================================================================
// Object-store proxy
// ============================================================================

/// Object-store proxy bound to a local socket
pub struct ProxyHandle {
    pub addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<std::io::Result<()>>,
}

impl ProxyHandle {
    pub async fn bind(
        bind: &str,
        registry: &HttpVolumeRegistry,
        volume_id: &VolumeId,
    ) -> Result<Self> {
        let (client, base_url, token) = registry.client_parts();
        let gateway = HttpObjectStoreGateway::new(client, base_url, token, volume_id.clone());
        let proxy = Arc::new(ObjectStoreProxy::new(Arc::new(gateway)));

        let listener = TcpListener::bind(bind)
            .await
            .with_context(|| format!("Failed to bind object-store proxy on {}", bind))?;
        let addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(proxy_api::serve(listener, proxy, shutdown.clone()));

        info!(%addr, volume_id = %volume_id, "Object-store proxy listening");
        Ok(Self { addr, shutdown, task })
    }

    /// Serve until `stop` is cancelled, then drain
    pub async fn wait(self, stop: CancellationToken) -> Result<()> {
        stop.cancelled().await;
        self.stop().await
    }

    pub async fn stop(self) -> Result<()> {
        self.shutdown.cancel();
        self.task
            .await
            .context("Object-store proxy task panicked")?
            .context("Object-store proxy failed")
    }
}

// ============================================================================
// Volume runtime
// ============================================================================

/// A mount-lease client wired to real infrastructure, plus the proxy and
/// event logger it depends on
pub struct VolumeRuntime {
    pub client: MountLeaseClient,
    proxy: ProxyHandle,
    events_task: JoinHandle<()>,
}

impl VolumeRuntime {
    pub async fn start(
        config: &EngineConfigManifest,
        volume_id: VolumeId,
        dir: Option<PathBuf>,
    ) -> Result<Self> {
        let registry = registry(config)?;
        let proxy = ProxyHandle::bind(&config.spec.backup.proxy_bind, &registry, &volume_id).await?;

        let runner: Arc<dyn CommandRunner> = Arc::new(SystemCommandRunner);
        let provider = create_block_provider(
            BlockBackend::Lvm {
                proc_root: config.spec.scanner.proc_root.clone(),
            },
            runner.clone(),
        );
        let backup = ResticBackupTool::new(
            runner.clone(),
            config.spec.backup.restic_binary.clone(),
            &proxy.addr.to_string(),
            config.spec.backup.command_timeout,
        );
        debug!(repository = backup.repository_url(), "Backup repository");

        let (_, api_url, token) = registry.client_parts();
        let events = EventBus::with_default_capacity();
        let events_task = spawn_event_logger(&events);
        let services = EngineServices {
            registry: Arc::new(registry),
            provider,
            backup: Arc::new(backup),
            marker: Arc::new(TmpfsMarker::new(runner)),
            events,
        };

        let binding = VolumeBinding {
            dir: volume_dir(config, &volume_id, dir),
            volume_id,
            identity: ClientIdentity {
                api_url,
                token,
                box_id: config.spec.registry.box_id.clone(),
            },
            size_multiplier: config.spec.storage.size_multiplier,
        };
        let client = MountLeaseClient::new(services, binding)
            .await
            .context("Failed to load volume state")?;

        Ok(Self {
            client,
            proxy,
            events_task,
        })
    }

    pub async fn stop(self) -> Result<()> {
        let result = self.proxy.stop().await;
        // the bus closes once the client and its services are dropped
        drop(self.client);
        if tokio::time::timeout(std::time::Duration::from_secs(1), self.events_task)
            .await
            .is_err()
        {
            debug!("Event logger still draining at exit");
        }
        result
    }
}

/// Log every lifecycle event until the bus closes
pub fn spawn_event_logger(events: &EventBus) -> JoinHandle<()> {
    let mut receiver = events.subscribe();
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => info!(
                    event = event.name(),
                    volume_id = ?event.volume_id().map(|v| v.as_str()),
                    "Volume event"
                ),
                Err(EventBusError::Lagged(n)) => warn!(missed = n, "Event logger lagged"),
                Err(_) => break,
            }
        }
    })
}

// ============================================================================
// Process plumbing
// ============================================================================

/// Resolves on Ctrl-C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

/// Cancel `token` when the process is asked to stop
pub fn cancel_on_signal(token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = shutdown_signal() => token.cancel(),
            _ = token.cancelled() => {}
        }
    })
}

/// Install the Prometheus exporter when enabled in the manifest
pub fn install_metrics_exporter(config: &EngineConfigManifest) -> Result<()> {
    let Some(metrics) = config
        .spec
        .observability
        .as_ref()
        .and_then(|o| o.metrics.as_ref())
        .filter(|m| m.enabled)
    else {
        return Ok(());
    };

    let addr: SocketAddr = metrics
        .bind
        .parse()
        .with_context(|| format!("Invalid metrics bind address '{}'", metrics.bind))?;
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;
    info!(%addr, "Prometheus metrics exporter listening");
    Ok(())
}
