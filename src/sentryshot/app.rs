// SPDX-License-Identifier: GPL-2.0-or-later

use axum::{
    routing::{any, get},
    Router,
};
use bytesize::ByteSize;
use common::{time::Duration, ArcLogger, EnvConfig, ILogger, LogEntry, LogLevel};
use detection::{fetch_catalog, DetectionClient, DetectionHooks, FetchCatalogError};
use env::{EnvConf, EnvConfigNewError};
use eventdb::EventDb;
use hls::{HlsServer, HlsStreamer};
use log::{
    log_db::{CreateLogDBError, LogDb},
    Logger,
};
use monitor::{InitializeMonitorManagerError, MonitorManager};
use recdb::{CreateRecDbError, RecDb};
use rtsp::{PathManager, RtspServer};
use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    sync::Arc,
};
use storage::{Disk, StoragePruner};
use thiserror::Error;
use tokio::{
    net::TcpListener,
    runtime::Handle,
    signal,
    sync::{mpsc, oneshot},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use url::Url;

#[allow(clippy::wildcard_imports)]
use handler::*;

#[derive(Debug, Error)]
pub enum RunError {
    #[error("create env config: {0}")]
    NewEnvConfig(#[from] EnvConfigNewError),

    #[error("create log db: {0}")]
    NewLogDb(#[from] CreateLogDBError),

    #[error("create recording database: {0}")]
    NewRecDb(#[from] CreateRecDbError),

    #[error("fetch detector catalog: {0}")]
    FetchCatalog(#[from] FetchCatalogError),

    #[error("initialize monitor manager: {0}")]
    InitializeMonitorManager(#[from] InitializeMonitorManagerError),

    #[error("invalid detector url: {0}")]
    DetectorUrlScheme(Url),

    #[error("listen on sigterm: {0}")]
    SigTermListener(std::io::Error),
}

pub async fn run(rt_handle: Handle, config_path: &PathBuf) -> Result<(), RunError> {
    let app = App::new(rt_handle, config_path).await?;
    let mut shutdown_complete_rx = app.run().await?;
    shutdown_complete_rx.recv().await;
    Ok(())
}

pub struct App {
    rt_handle: Handle,
    token: CancellationToken,
    env: EnvConf,
    logger: Arc<Logger>,
    shutdown_complete_tx: mpsc::Sender<()>,
    shutdown_complete_rx: mpsc::Receiver<()>,
    log_db: LogDb,
    recdb: Arc<RecDb>,
    storage_pruner: StoragePruner<'static>,
    hls_server: HlsServer,
    rtsp_server: Arc<RtspServer>,
    monitor_manager: MonitorManager,
    router: Router,
}

impl App {
    pub async fn new(rt_handle: Handle, config_path: &PathBuf) -> Result<App, RunError> {
        let token = CancellationToken::new();
        let env = EnvConf::new(config_path)?;

        let (shutdown_complete_tx, shutdown_complete_rx) = mpsc::channel::<()>(1);

        let logger = Arc::new(Logger::new(vec![
            "detection".parse().expect("valid"),
            "rtsp".parse().expect("valid"),
            "hls".parse().expect("valid"),
        ]));

        let log_dir = env.storage_dir().join("logs");
        let log_db = LogDb::new(
            token.clone(),
            shutdown_complete_tx.clone(),
            log_dir,
            env.max_disk_usage(),
            ByteSize::mb(100),
            1024,
            512,
        )?;

        {
            let log_db2 = log_db.clone();
            let token2 = token.clone();
            let feed = logger.subscribe();
            tokio::spawn(async move {
                log_db2.save_logs(token2, feed).await;
            });

            let log_db2 = log_db.clone();
            let token2 = token.clone();
            let logger2: ArcLogger = logger.clone();
            tokio::spawn(async move {
                log_db2.prune_loop(token2, logger2).await;
            });
        }

        let rec_db = Arc::new(RecDb::new(logger.clone(), env.recordings_dir().to_path_buf()).await?);

        let disk = Arc::new(Disk::new(
            env.recordings_dir().to_path_buf(),
            env.max_disk_usage(),
        ));
        let storage_pruner = StoragePruner::new(
            env.recordings_dir().to_path_buf(),
            disk,
            logger.clone() as ArcLogger,
        );

        let tracker = TaskTracker::new();
        let eventdb_path = env.storage_dir().join("events");
        let eventdb = EventDb::new(
            token.clone(),
            tracker.token(),
            logger.clone(),
            eventdb_path,
        );
        tracker.close();

        let hls_server = HlsServer::new(token.clone(), logger.clone());
        let streamer = Arc::new(HlsStreamer::new(hls_server.clone()));

        let catalog = fetch_catalog(env.detector_url()).await?;
        let mut detector_ws_url = env.detector_url().clone();
        detector_ws_url
            .set_scheme(if detector_ws_url.scheme() == "https" {
                "wss"
            } else {
                "ws"
            })
            .map_err(|()| RunError::DetectorUrlScheme(env.detector_url().clone()))?;
        let detection_client = DetectionClient::new(detector_ws_url, token.clone());
        let hooks = Arc::new(DetectionHooks::new(
            detection_client,
            catalog,
            rt_handle.clone(),
            logger.clone(),
        ));

        let path_manager = PathManager::new(token.clone());

        let rtsp_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)), env.rtsp_port());
        let rtsp_server = Arc::new(RtspServer::new(
            rtsp_addr,
            path_manager.clone(),
            logger.clone(),
        ));

        let monitor_manager = MonitorManager::new();
        let monitors_dir = env.config_dir().join("monitors");
        monitor_manager
            .initialize(
                monitors_dir,
                rec_db.clone(),
                eventdb,
                logger.clone(),
                streamer,
                hooks,
                path_manager,
            )
            .await?;

        let router = Router::new()
            .route("/hls/*path", any(hls_handler).with_state(hls_server.clone()))
            .route("/module.js", get(js_module_handler));

        Ok(App {
            rt_handle,
            token,
            env,
            logger,
            shutdown_complete_tx,
            shutdown_complete_rx,
            log_db,
            recdb: rec_db,
            storage_pruner,
            hls_server,
            rtsp_server,
            monitor_manager,
            router,
        })
    }

    // `App` must be dropped when this returns.
    pub async fn run(self) -> Result<mpsc::Receiver<()>, RunError> {
        let storage_pruner = self.storage_pruner;
        let token2 = self.token.clone();
        tokio::spawn(async move {
            storage_pruner
                .prune_loop(token2, Duration::from_minutes(10).as_std().expect(""))
                .await;
        });

        let rtsp_server = self.rtsp_server.clone();
        let rtsp_token = self.token.child_token();
        tokio::spawn(async move {
            if let Err(e) = rtsp_server.run(rtsp_token).await {
                eprintln!("rtsp server error: {e}");
            }
        });

        self.logger.log(LogEntry::new(
            LogLevel::Info,
            "app",
            None,
            format!("serving app on port {}", self.env.port()),
        ));

        let token = self.token.clone();
        let monitor_manager = self.monitor_manager.clone();
        let shutdown_complete_tx = self.shutdown_complete_tx.clone();
        tokio::spawn(async move {
            token.cancelled().await;
            monitor_manager.cancel().await;
            drop(shutdown_complete_tx);
        });

        let (server_exited_tx, server_exited_rx) = oneshot::channel();
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)), self.env.port());

        tokio::spawn(start_server(
            self.token.child_token(),
            self.shutdown_complete_tx.clone(),
            server_exited_tx,
            addr,
            self.router,
        ));

        // Shutdown conditions.
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .map_err(RunError::SigTermListener)?;
        tokio::spawn(async move {
            tokio::select! {
                result = signal::ctrl_c() => {
                    match result {
                        Ok(()) => eprintln!("\nreceived interrupt, stopping..\n"),
                        Err(e) => eprintln!("\ninterrupt error: {e}"),
                    }
                }
                _ = sigterm.recv() => eprintln!("\nreceived terminate, stopping..\n"),
                res = server_exited_rx => {
                    if let Err(e) = res {
                        eprintln!("server error: {e}");
                    }
                },
            }
            self.token.cancel();
        });

        Ok(self.shutdown_complete_rx)
    }
}

#[derive(Debug, Error)]
enum ServerError {
    #[error("bind: {0}")]
    Bind(std::io::Error),

    #[error("{0}")]
    Server(std::io::Error),
}

async fn start_server(
    token: CancellationToken,
    _shutdown_complete: mpsc::Sender<()>,
    on_exit: oneshot::Sender<Result<(), ServerError>>,
    addr: SocketAddr,
    router: Router,
) {
    let listener = match TcpListener::bind(addr).await {
        Ok(v) => v,
        Err(e) => {
            let _ = on_exit.send(Err(ServerError::Bind(e)));
            return;
        }
    };
    let graceful = axum::serve(listener, router)
        .with_graceful_shutdown(async move { token.cancelled().await });
    let _ = on_exit.send(graceful.await.map_err(ServerError::Server));
}
