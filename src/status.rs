//! Publishes a snapshot of state to out-of-process readers over two
//! transports: a local socket (preferred) and an atomically-written state
//! file (fallback, survives crashes).

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::Error;
use crate::host_ref::HostReference;
use crate::state::{ActualEntry, HistoryEntry, State, Status as EntryStatus};

const SNAPSHOT_VERSION: &str = "2.0";
const APP_DIR: &str = "portbridge";
const STATE_FILE_REFRESH: Duration = Duration::from_secs(2);
/// A snapshot older than this is considered stale by readers.
pub const STALE_AFTER: Duration = Duration::from_secs(10);

fn app_dir() -> Result<PathBuf, Error> {
    let home = dirs::home_dir()
        .ok_or_else(|| Error::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "no home dir")))?;
    Ok(home.join(".local/share").join(APP_DIR))
}

fn base_name(host: &HostReference) -> String {
    let digest = Sha256::digest(host.to_string().as_bytes());
    let encoded = URL_SAFE_NO_PAD.encode(digest);
    encoded[..12].to_string()
}

/// Path to the status socket for `host`.
pub fn socket_path(host: &HostReference) -> Result<PathBuf, Error> {
    Ok(app_dir()?.join(format!("{}.sock", base_name(host))))
}

/// Path to the state-file fallback for `host`.
pub fn state_file_path(host: &HostReference) -> Result<PathBuf, Error> {
    Ok(app_dir()?.join(format!("{}.state.json", base_name(host))))
}

#[derive(Debug, Clone, Serialize)]
struct WireActual {
    container: String,
    port: u16,
    status: &'static str,
    reason: String,
    created_at: u64,
    updated_at: u64,
}

impl From<&ActualEntry> for WireActual {
    fn from(e: &ActualEntry) -> Self {
        WireActual {
            container: e.container.clone(),
            port: e.port,
            status: match e.status {
                EntryStatus::Active => "active",
                EntryStatus::Conflict => "conflict",
                EntryStatus::Pending => "pending",
            },
            reason: e.reason.clone(),
            created_at: to_unix(e.created_at),
            updated_at: to_unix(e.updated_at),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct WireHistory {
    container: String,
    port: u16,
    created_at: u64,
    ended_at: u64,
    end_reason: String,
    final_status: &'static str,
}

impl From<&HistoryEntry> for WireHistory {
    fn from(e: &HistoryEntry) -> Self {
        WireHistory {
            container: e.container.clone(),
            port: e.port,
            created_at: to_unix(e.created_at),
            ended_at: to_unix(e.ended_at),
            end_reason: e.end_reason.clone(),
            final_status: match e.final_status {
                EntryStatus::Active => "active",
                EntryStatus::Conflict => "conflict",
                EntryStatus::Pending => "pending",
            },
        }
    }
}

fn to_unix(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// The versioned record published over both transports.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    version: &'static str,
    host: String,
    pid: u32,
    started_at: u64,
    updated_at: u64,
    actual: Vec<WireActual>,
    history: Vec<WireHistory>,
}

impl Snapshot {
    pub fn build(host: &HostReference, started_at: SystemTime, state: &State) -> Self {
        Snapshot {
            version: SNAPSHOT_VERSION,
            host: host.to_string(),
            pid: std::process::id(),
            started_at: to_unix(started_at),
            updated_at: to_unix(SystemTime::now()),
            actual: state.get_actual().iter().map(WireActual::from).collect(),
            history: state.get_history().iter().map(WireHistory::from).collect(),
        }
    }

    fn to_json_pretty(&self) -> Result<String, Error> {
        serde_json::to_string_pretty(self)
            .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))
    }
}

/// Write the state file atomically: write to a temp sibling in the same
/// directory, hold an exclusive advisory lock, fsync, then rename.
fn write_state_file(path: &Path, json: &str) -> Result<(), Error> {
    use fs2::FileExt;

    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.as_file().lock_exclusive()?;
    tmp.write_all(json.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.as_file().unlock()?;
    tmp.persist(path)
        .map_err(|e| Error::Io(e.error))?;
    Ok(())
}

/// Owns both the status-socket listener and the state-file refresh ticker.
/// Removed on clean shutdown by `Manager::teardown`.
pub struct StatusInterface {
    host: HostReference,
    started_at: SystemTime,
    socket_path: PathBuf,
    state_file_path: PathBuf,
}

impl StatusInterface {
    pub fn new(host: HostReference, started_at: SystemTime) -> Result<Self, Error> {
        Ok(Self {
            socket_path: socket_path(&host)?,
            state_file_path: state_file_path(&host)?,
            host,
            started_at,
        })
    }

    /// Run the socket acceptor loop until `cancel` fires. Each accepted
    /// connection is served exactly one snapshot then closed.
    pub async fn run_socket(&self, state: &State, cancel: CancellationToken) -> Result<(), Error> {
        if self.socket_path.exists() {
            let _ = std::fs::remove_file(&self.socket_path);
        }
        if let Some(dir) = self.socket_path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let listener = UnixListener::bind(&self.socket_path)?;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => {
                            let snapshot = Snapshot::build(&self.host, self.started_at, state);
                            if let Err(e) = serve_one(stream, &snapshot).await {
                                warn!(error = %e, "status socket connection failed");
                            }
                        }
                        Err(e) => {
                            error!(error = %e, "status socket accept failed");
                        }
                    }
                }
            }
        }
    }

    /// Refresh the state file on every state transition and at least every
    /// 2 seconds, until `cancel` fires.
    pub async fn run_state_file_ticker(
        &self,
        state: &State,
        cancel: CancellationToken,
    ) -> Result<(), Error> {
        let mut interval = tokio::time::interval(STATE_FILE_REFRESH);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = interval.tick() => {
                    if let Err(e) = self.refresh_state_file(state) {
                        warn!(error = %e, "state file refresh failed");
                    }
                }
            }
        }
    }

    pub fn refresh_state_file(&self, state: &State) -> Result<(), Error> {
        let snapshot = Snapshot::build(&self.host, self.started_at, state);
        let json = snapshot.to_json_pretty()?;
        write_state_file(&self.state_file_path, &json)
    }

    /// Remove both transports. Idempotent; tolerant of partial failure.
    pub fn remove(&self) {
        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                debug!(error = %e, "status socket removal failed (already gone?)");
            }
        }
        if self.state_file_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.state_file_path) {
                debug!(error = %e, "state file removal failed (already gone?)");
            }
        }
    }
}

async fn serve_one(mut stream: UnixStream, snapshot: &Snapshot) -> Result<(), Error> {
    use tokio::io::AsyncWriteExt;
    let json = snapshot.to_json_pretty()?;
    stream.write_all(json.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}

/// Whether a snapshot (or state file) this old should be treated as stale.
pub fn is_stale(updated_at: SystemTime) -> bool {
    SystemTime::now()
        .duration_since(updated_at)
        .map(|age| age > STALE_AFTER)
        .unwrap_or(false)
}
