use std::{
    path::{Path, PathBuf},
    sync::{mpsc, Arc, Mutex},
    thread::{self, JoinHandle},
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use log::{error, info};
use rusqlite::Connection;
use tokio::sync::oneshot;

use super::migrations::run_migrations;

/// How long a statement waits on a lock held by another process before
/// failing. A producer and a dashboard may share one data directory.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

type Job = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

enum Request {
    Run(Job),
    Close,
}

struct Worker {
    requests: mpsc::Sender<Request>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Worker {
    fn drop(&mut self) {
        let handle = self
            .thread
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(handle) = handle else { return };

        if let Err(err) = self.requests.send(Request::Close) {
            error!("Failed to ask the database thread to close: {err}");
        }
        if let Err(err) = handle.join() {
            error!("Database thread panicked: {err:?}");
        }
    }
}

/// Handle to the single SQLite connection owned by a dedicated thread.
///
/// Jobs run one at a time in submission order. The durable queue leans on
/// this: an enqueue that lands while a drain is between batches simply
/// becomes the next row after the drain's cursor, and the snapshot writer
/// never sees a half-written document.
#[derive(Clone)]
pub struct Database {
    worker: Arc<Worker>,
    db_path: Arc<PathBuf>,
}

impl Database {
    pub fn new(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create database directory {}", parent.display())
            })?;
        }

        let (requests, inbox) = mpsc::channel::<Request>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<()>>();
        let path = db_path.clone();

        let thread = thread::Builder::new()
            .name("fleetbeacon-db".into())
            .spawn(move || match open_connection(&path) {
                Ok(conn) => {
                    if ready_tx.send(Ok(())).is_ok() {
                        serve(conn, inbox);
                    }
                }
                Err(err) => {
                    let _ = ready_tx.send(Err(err));
                }
            })
            .context("failed to spawn database thread")?;

        ready_rx
            .recv()
            .context("database thread exited before it was ready")??;
        info!("Database ready at {}", db_path.display());

        Ok(Self {
            worker: Arc::new(Worker {
                requests,
                thread: Mutex::new(Some(thread)),
            }),
            db_path: Arc::new(db_path),
        })
    }

    pub fn path(&self) -> &Path {
        self.db_path.as_path()
    }

    /// Runs `task` on the database thread and waits for its result.
    pub async fn execute<F, T>(&self, task: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let job: Job = Box::new(move |conn| {
            if reply_tx.send(task(conn)).is_err() {
                error!("Database caller went away before its result arrived");
            }
        });

        self.worker
            .requests
            .send(Request::Run(job))
            .map_err(|err| anyhow!("database thread is gone: {err}"))?;
        reply_rx
            .await
            .map_err(|_| anyhow!("database thread stopped before replying"))?
    }
}

fn open_connection(path: &Path) -> Result<Connection> {
    let mut conn = Connection::open(path)
        .with_context(|| format!("failed to open SQLite database {}", path.display()))?;

    if let Err(err) = conn.pragma_update(None, "journal_mode", "WAL") {
        error!("Failed to enable WAL mode: {err}");
    }
    // Queued readings must survive a crash, not just an app restart.
    if let Err(err) = conn.pragma_update(None, "synchronous", "FULL") {
        error!("Failed to set synchronous mode: {err}");
    }
    conn.busy_timeout(BUSY_TIMEOUT)
        .context("failed to set busy timeout")?;

    run_migrations(&mut conn).context("failed to run database migrations")?;
    Ok(conn)
}

fn serve(mut conn: Connection, inbox: mpsc::Receiver<Request>) {
    while let Ok(request) = inbox.recv() {
        match request {
            Request::Run(job) => job(&mut conn),
            Request::Close => break,
        }
    }
    info!("Database thread closed");
}
