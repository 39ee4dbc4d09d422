use crate::batch::BatchAccumulator;
use crate::connection::{ServerConfig, Session};
use crate::dispatcher::CommandDispatcher;
use crate::events::EventBus;
use crate::facade::KronDB;
use crate::protocol::Envelope;
use crate::scheduler::LifecycleScheduler;
use crate::store::RecordStore;
use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{State, WebSocketUpgrade},
    response::Response,
    routing::get,
};
use serde::Serialize;
use std::future::Future;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

#[derive(Clone)]
struct AppState {
    db: KronDB,
    dispatcher: CommandDispatcher,
    bus: EventBus<Envelope>,
    shutdown: CancellationToken,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    records: usize,
    subscribers: usize,
    dropped_events: u64,
}

/// WebSocket front end plus the background scheduler, sharing one database.
pub struct KronServer {
    config: ServerConfig,
    db: KronDB,
    store: RecordStore,
    batches: BatchAccumulator,
    bus: EventBus<Envelope>,
    shutdown: CancellationToken,
}

impl KronServer {
    /// Validates `config` and opens the database it describes.
    pub async fn open(config: ServerConfig) -> Result<Self> {
        config.validate()?;

        let db = match &config.data_dir {
            Some(dir) => {
                let db = KronDB::open(dir, config.durability)
                    .with_context(|| format!("failed to open data directory {}", dir.display()))?;
                db.set_checkpoint_threshold(config.checkpoint_threshold).await;
                info!(dir = %dir.display(), durability = ?config.durability, "Persistence enabled");
                db
            }
            None => {
                info!("Running in memory only");
                KronDB::new()
            }
        };

        Ok(Self::with_db(config, db))
    }

    pub fn with_db(config: ServerConfig, db: KronDB) -> Self {
        let store = RecordStore::new(db.clone());
        let batches = BatchAccumulator::new(db.clone());
        let bus = EventBus::new(config.subscriber_capacity, config.overflow_policy);
        Self {
            config,
            db,
            store,
            batches,
            bus,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn db(&self) -> &KronDB {
        &self.db
    }

    pub fn bus(&self) -> &EventBus<Envelope> {
        &self.bus
    }

    /// Cancelling this token stops the scheduler, every session and the listener.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn scheduler(&self) -> LifecycleScheduler {
        LifecycleScheduler::new(
            self.store.clone(),
            self.batches.clone(),
            self.bus.clone(),
            self.config.tick_interval,
        )
    }

    pub fn router(&self) -> Router {
        let state = AppState {
            db: self.db.clone(),
            dispatcher: CommandDispatcher::new(self.store.clone(), self.batches.clone()),
            bus: self.bus.clone(),
            shutdown: self.shutdown.clone(),
        };

        Router::new()
            .route("/", get(ws_handler))
            .route("/ws", get(ws_handler))
            .route("/health", get(health))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Binds the configured address and serves until Ctrl+C or SIGTERM.
    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr())
            .await
            .with_context(|| format!("failed to bind {}", self.config.bind_addr()))?;
        self.serve_with_listener(listener, shutdown_signal()).await
    }

    /// Serves on an already bound listener until `signal` resolves or the
    /// shutdown token is cancelled, then stops the scheduler and writes a
    /// final checkpoint.
    pub async fn serve_with_listener<F>(self, listener: TcpListener, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr().context("listener has no local address")?;
        info!(%addr, "KronCache listening");

        let scheduler = tokio::spawn(self.scheduler().run(self.shutdown.child_token()));

        let token = self.shutdown.clone();
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                tokio::select! {
                    _ = signal => info!("Shutdown signal received"),
                    _ = token.cancelled() => {}
                }
                token.cancel();
            })
            .await
            .context("axum serve error")?;

        self.shutdown.cancel();
        if let Err(e) = scheduler.await {
            error!(error = %e, "Scheduler task failed");
        }

        self.db.checkpoint().await.context("final checkpoint failed")?;
        info!("KronCache stopped");
        Ok(())
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| async move {
        Session::new(state.dispatcher, state.bus, state.shutdown)
            .run(socket)
            .await;
    })
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let stats = state.bus.stats();
    Json(HealthResponse {
        status: "ok",
        records: state.db.record_count().await,
        subscribers: stats.subscribers,
        dropped_events: stats.dropped,
    })
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "unable to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "unable to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
