use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use prom_stream_downsample::config::{ConfigHandle, DEFAULT_CONFIG_PATH};
use prom_stream_downsample::downsample::DownsampleManager;
use prom_stream_downsample::proxy::{Proxy, ReloadRequest};
use prom_stream_downsample::remote::read::RemoteReadClient;
use prom_stream_downsample::remote::write::{
    Batch, BufferPool, RemoteWriteClient, WRITE_CHANNEL_CAPACITY,
};
use prom_stream_downsample::VERSION;

#[derive(Debug, Parser)]
#[command(name = "prom-stream-downsample", disable_version_flag = true)]
struct Args {
    /// config path
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// print version and exit
    #[arg(short = 'v', long = "version")]
    version: bool,
}

fn init_log() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
        )
        .with_target(true)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    init_log();
    let args = Args::parse();
    if args.version {
        println!("prom-stream-downsample {VERSION}");
        return ExitCode::SUCCESS;
    }

    let config = match ConfigHandle::load(&args.config) {
        Ok(handle) => Arc::new(handle),
        Err(err) => {
            tracing::error!(path = %args.config.display(), error = %err, "init config failed");
            return ExitCode::FAILURE;
        }
    };
    let snapshot = config.get();

    let cancel = CancellationToken::new();
    let (reload_tx, mut reload_rx) = mpsc::channel::<ReloadRequest>(16);

    let mut write_tx: Option<async_channel::Sender<Batch>> = None;
    let mut write_task = None;
    let mut manager: Option<DownsampleManager> = None;

    if snapshot.global_config.enabled_downsample {
        let http = reqwest::Client::new();
        let prometheus = &snapshot.global_config.prometheus;

        let reader = match RemoteReadClient::connect(
            http.clone(),
            prometheus.remote_read_group.clone(),
            snapshot.global_config.enabled_stream,
        )
        .await
        {
            Ok(reader) => Arc::new(reader),
            Err(err) => {
                tracing::error!(error = %err, "init prometheus remote read failed");
                return ExitCode::FAILURE;
            }
        };

        let (tx, rx) = async_channel::bounded::<Batch>(WRITE_CHANNEL_CAPACITY);
        let pool = Arc::new(BufferPool::default());
        let writer = Arc::new(RemoteWriteClient::new(
            http,
            prometheus.remote_write_url.clone(),
            rx,
            tx.clone(),
            Arc::clone(&pool),
            cancel.clone(),
        ));
        write_task = Some(tokio::spawn(writer.run()));

        manager = Some(DownsampleManager::spawn(
            &snapshot,
            reader,
            tx.clone(),
            pool,
            cancel.clone(),
        ));
        write_tx = Some(tx);
    }

    let mut proxy: Option<Arc<Proxy>> = None;
    let mut server_task = None;
    if snapshot.global_config.enabled_proxy {
        let pxy = match Proxy::new(Arc::clone(&config), reload_tx.clone()).await {
            Ok(pxy) => Arc::new(pxy),
            Err(err) => {
                tracing::error!(error = %err, "init proxy failed");
                return ExitCode::FAILURE;
            }
        };

        let listen_addr = snapshot.proxy_config.listen_addr.clone();
        let listener = match tokio::net::TcpListener::bind(&listen_addr).await {
            Ok(listener) => listener,
            Err(err) => {
                tracing::error!(addr = %listen_addr, error = %err, "bind proxy listener failed");
                return ExitCode::FAILURE;
            }
        };
        tracing::info!(addr = %listen_addr, "proxy listening");

        let router = pxy.router();
        let shutdown = cancel.clone();
        server_task = Some(tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, router)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
            {
                tracing::error!(error = %err, "proxy server failed");
            }
        }));
        proxy = Some(pxy);
    }

    // Reload dispatcher: re-reads the config file, then swaps the proxy
    // table. A failing reload leaves the running state untouched.
    let dispatcher = {
        let config = Arc::clone(&config);
        let proxy = proxy.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    request = reload_rx.recv() => {
                        let Some(request) = request else { return };
                        tracing::warn!("reloaders reload start");
                        let mut result = config.reload();
                        if result.is_ok() {
                            if let Some(proxy) = &proxy {
                                result = proxy.reload();
                            }
                        }
                        if let Err(err) = &result {
                            tracing::error!(error = %err, "reloader failed");
                        }
                        tracing::warn!("reloaders reload done");
                        let _ = request.send(result);
                    }
                }
            }
        })
    };

    wait_for_shutdown().await;
    cancel.cancel();

    // Close the write channel so the writer pool drains what is queued and
    // exits; then join everything.
    if let Some(tx) = write_tx {
        tx.close();
    }
    if let Some(manager) = manager {
        manager.join().await;
    }
    if let Some(task) = write_task {
        let _ = task.await;
    }
    if let Some(task) = server_task {
        let _ = task.await;
    }
    let _ = tokio::time::timeout(Duration::from_secs(1), dispatcher).await;

    tracing::warn!("quit...");
    ExitCode::SUCCESS
}

async fn wait_for_shutdown() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            Ok(term) => term,
            Err(err) => {
                tracing::error!(error = %err, "installing SIGTERM handler failed");
                let _ = ctrl_c.await;
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
