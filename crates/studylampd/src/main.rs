use anyhow::{Context, Result};
use std::sync::Arc;
use studylamp_core::{ModelLoader, OnnxModelSource, SessionContext};
use studylamp_hw::{CameraSessionManager, V4l2Device};
use studylamp_net::{Backend, ChatSession, HealthPoller, HttpBackend};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod monitor;

use config::Config;
use dbus_interface::{StudylampService, BUS_NAME, OBJECT_PATH};
use monitor::{spawn_monitor, start_capture, CameraProbe, PresenceCallback};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("studylampd starting");

    let config = Config::from_env()?;
    tracing::info!(
        backend = %config.backend_url,
        model_dir = %config.model_dir.display(),
        camera = config.camera_device.as_deref().unwrap_or("auto"),
        "configuration loaded"
    );

    let cancel = CancellationToken::new();
    let ctx = Arc::new(SessionContext::new());

    let loader = Arc::new(ModelLoader::new(OnnxModelSource::new(
        &config.model_dir,
        config.model_url.clone(),
    )));
    let camera = Arc::new(CameraSessionManager::new(
        V4l2Device::new(config.warmup_frames),
        Arc::clone(&ctx),
    ));

    let backend: Arc<dyn Backend> = Arc::new(
        HttpBackend::new(config.backend_url.clone())
            .context("failed to build HTTP client")?
            .with_health_timeout(config.health_timeout()),
    );
    let health = Arc::new(
        HealthPoller::new(Arc::clone(&backend))
            .with_timeout(config.health_timeout())
            .with_interval(config.health_interval()),
    );
    let chat = Arc::new(ChatSession::new(backend, config.chat_context.clone()));
    chat.set_credential(config.api_token.clone());

    // Presence transitions are forwarded to D-Bus once the connection exists.
    let (presence_tx, mut presence_rx) = mpsc::unbounded_channel::<bool>();
    let on_change: PresenceCallback = Arc::new(move |present| {
        let _ = presence_tx.send(present);
    });
    let (monitor, monitor_task) = spawn_monitor(
        CameraProbe::new(camera.frame_source(), Arc::clone(&loader)),
        Arc::clone(&ctx),
        config.poll_interval(),
        on_change,
        cancel.child_token(),
    );

    let health_task = tokio::spawn(Arc::clone(&health).run(cancel.child_token()));

    // RestartCamera retries this if the first attempt fails.
    let constraints = config.capture_constraints();
    let startup = tokio::spawn({
        let loader = Arc::clone(&loader);
        let camera = Arc::clone(&camera);
        let constraints = constraints.clone();
        async move {
            let _ = start_capture(&loader, &camera, &constraints).await;
        }
    });

    let service = StudylampService {
        ctx: Arc::clone(&ctx),
        loader,
        camera: Arc::clone(&camera),
        monitor,
        health,
        chat,
        constraints,
    };

    let connection = zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("failed to claim D-Bus name")?;

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "D-Bus interface registered");

    let signal_task = tokio::spawn({
        let connection = connection.clone();
        async move {
            let iface = match connection
                .object_server()
                .interface::<_, StudylampService>(OBJECT_PATH)
                .await
            {
                Ok(iface) => iface,
                Err(e) => {
                    tracing::error!(error = %e, "presence signal forwarding disabled");
                    return;
                }
            };
            while let Some(present) = presence_rx.recv().await {
                if let Err(e) =
                    StudylampService::presence_changed(iface.signal_emitter(), present).await
                {
                    tracing::warn!(error = %e, "failed to emit PresenceChanged");
                }
            }
        }
    });

    tracing::info!("studylampd ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("studylampd shutting down");

    cancel.cancel();
    startup.abort();
    camera.stop();
    let _ = monitor_task.await;
    let _ = health_task.await;
    signal_task.abort();
    drop(connection);

    Ok(())
}
