use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use chattin_db::Database;
use chattin_types::models::{Channel, find_channel};

/// Tunables for sessions and the hub.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    /// Ping interval; two missed pongs drop the connection.
    pub heartbeat_interval: Duration,
    pub handshake_timeout: Duration,
    pub max_page_size: u32,
    pub max_message_len: usize,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(15),
            handshake_timeout: Duration::from_secs(10),
            max_page_size: 200,
            max_message_len: 4000,
        }
    }
}

type QueuedWrite = Box<dyn FnOnce(&Database) + Send>;

/// Read-mostly state shared by the hub and every session.
pub struct GatewayContext {
    pub db: Arc<Database>,
    /// Loaded once at startup, never mutated.
    pub channels: Vec<Channel>,
    pub settings: GatewaySettings,
    writes: mpsc::UnboundedSender<QueuedWrite>,
}

impl GatewayContext {
    /// Spawns the write queue task, so this needs a tokio runtime.
    pub fn new(db: Arc<Database>, channels: Vec<Channel>, settings: GatewaySettings) -> Self {
        let (writes, rx) = mpsc::unbounded_channel();
        tokio::spawn(drain_writes(db.clone(), rx));
        Self {
            db,
            channels,
            settings,
            writes,
        }
    }

    pub fn channel(&self, id: Uuid) -> Option<&Channel> {
        find_channel(&self.channels, id)
    }

    /// Run a blocking database call off the async runtime and wait for it.
    pub async fn db<F, T>(&self, f: F) -> anyhow::Result<T>
    where
        F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| anyhow!("spawn_blocking join error: {}", e))?
    }

    /// Queue a best-effort write and return immediately. Queued writes run
    /// one at a time in submission order; failures are logged.
    pub fn db_detached<F>(&self, what: &'static str, f: F)
    where
        F: FnOnce(&Database) -> anyhow::Result<()> + Send + 'static,
    {
        let write: QueuedWrite = Box::new(move |db| {
            if let Err(e) = f(db) {
                warn!("{} failed: {}", what, e);
            }
        });
        if self.writes.send(write).is_err() {
            warn!("Write queue is gone, {} dropped", what);
        }
    }

    /// Resolves once every write queued before this call has run.
    pub async fn flush_writes(&self) {
        let (done, finished) = oneshot::channel();
        let marker: QueuedWrite = Box::new(move |_| {
            let _ = done.send(());
        });
        if self.writes.send(marker).is_ok() {
            let _ = finished.await;
        }
    }
}

async fn drain_writes(db: Arc<Database>, mut rx: mpsc::UnboundedReceiver<QueuedWrite>) {
    while let Some(write) = rx.recv().await {
        let db = db.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || write(&db)).await {
            warn!("Queued write did not complete: {}", e);
        }
    }
    debug!("Write queue closed");
}
