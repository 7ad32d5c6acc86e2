//! The per-peer sync client.
//!
//! Connects to the coordinator, uploads the local clock reading and any
//! start-up metadata, signals readiness, and blocks through the barrier.
//! The states `awaiting-id → awaiting-table → awaiting-go → done` are
//! strictly sequential; any line outside the next state's grammar is
//! fatal to this peer.
//!
//! The shared start instant is the *local receipt time* of `go`, not a
//! transmitted timestamp; sub-second cross-peer alignment is bounded by
//! one-way trip time variance by design.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use conductor_core::metadata::{MetadataTable, PeerId, PeerRecord};
use conductor_core::schedule::ScenarioRunner;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::error::SyncError;
use crate::proto::{unix_now, LineReader, PeerCommand};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Coordinator address, e.g. `10.0.0.1:7999`.
    pub addr: String,
    /// Metadata pairs to upload before readiness.
    pub vars: BTreeMap<String, String>,
    /// How many connection attempts to make before giving up. Peers often
    /// start before the coordinator's listener is up.
    pub connect_attempts: u32,
    /// Delay between connection attempts.
    pub retry_delay: Duration,
}

impl ClientConfig {
    /// Creates a configuration with default retry behavior (30 attempts,
    /// 1 s apart).
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            vars: BTreeMap::new(),
            connect_attempts: 30,
            retry_delay: Duration::from_secs(1),
        }
    }

    /// Adds a metadata pair to upload.
    pub fn with_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    /// Overrides the retry behavior.
    pub fn with_retry(mut self, attempts: u32, delay: Duration) -> Self {
        self.connect_attempts = attempts;
        self.retry_delay = delay;
        self
    }
}

/// The peer-side rendezvous client.
pub struct SyncClient {
    config: ClientConfig,
}

/// Everything a peer knows after the barrier: its identity, the merged
/// metadata, and the shared start instant. Dropping it closes the
/// connection, which the coordinator reads as the final acknowledgment.
pub struct Synchronized {
    /// This peer's ordinal id.
    pub peer_id: PeerId,
    /// The merged metadata table, identical on every peer.
    pub table: MetadataTable,
    /// Coordinator clock minus this peer's clock, seconds.
    pub clock_offset: f64,
    /// Local receipt time of `go`: the shared start instant.
    pub start: Instant,
    _reader: LineReader<OwnedReadHalf>,
    _writer: OwnedWriteHalf,
}

impl SyncClient {
    /// Creates a client.
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    /// Runs the whole rendezvous: connect, register, block at the barrier,
    /// and return once `go` arrives.
    pub async fn rendezvous(self) -> Result<Synchronized, SyncError> {
        let stream = self.connect_with_retry().await?;
        let (read_half, mut writer) = stream.into_split();
        let mut reader = LineReader::new(read_half);

        writer
            .write_all(PeerCommand::Time(unix_now()).encode().as_bytes())
            .await?;
        for (key, value) in &self.config.vars {
            let cmd = PeerCommand::Set {
                key: key.clone(),
                value: value.clone(),
            };
            writer.write_all(cmd.encode().as_bytes()).await?;
        }
        writer.write_all(PeerCommand::Ready.encode().as_bytes()).await?;
        debug!("Registered with coordinator, waiting at the barrier");

        // awaiting-id
        let line = expect_line(&mut reader, "awaiting-id").await?;
        let peer_id: PeerId = line
            .strip_prefix("id:")
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| SyncError::protocol(format!("expected id line, got '{line}'")))?;

        // awaiting-table
        let line = expect_line(&mut reader, "awaiting-table").await?;
        let table = MetadataTable::from_wire_line(&line)?;

        // awaiting-go
        let line = expect_line(&mut reader, "awaiting-go").await?;
        if line != "go" {
            return Err(SyncError::protocol(format!("expected go, got '{line}'")));
        }
        let start = Instant::now();

        let clock_offset = table
            .get(peer_id)
            .map(|r| r.clock_offset)
            .ok_or_else(|| {
                SyncError::protocol(format!("table is missing our own record (peer {peer_id})"))
            })?;

        info!(
            peer_id,
            clock_offset,
            peers = table.len(),
            "Barrier passed, experiment started"
        );

        Ok(Synchronized {
            peer_id,
            table,
            clock_offset,
            start,
            _reader: reader,
            _writer: writer,
        })
    }

    async fn connect_with_retry(&self) -> Result<TcpStream, SyncError> {
        let attempts = self.config.connect_attempts.max(1);
        for attempt in 1..=attempts {
            match TcpStream::connect(&self.config.addr).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    warn!(
                        "Connect to {} failed (attempt {attempt}/{attempts}): {e}",
                        self.config.addr
                    );
                    if attempt < attempts {
                        tokio::time::sleep(self.config.retry_delay).await;
                    }
                }
            }
        }
        Err(SyncError::ConnectFailed {
            addr: self.config.addr.clone(),
            attempts,
        })
    }
}

impl Synchronized {
    /// This peer's own record in the table.
    pub fn record(&self) -> Option<&PeerRecord> {
        self.table.get(self.peer_id)
    }

    /// Executes the runner's schedule for this peer against the shared
    /// start instant.
    ///
    /// Events whose deadline has already passed fire immediately, never
    /// skipped. All callables run inline on this task, so events sharing
    /// an offset keep their file order and nothing here runs concurrently
    /// with anything else in this process's cooperative loop.
    ///
    /// Returns early, before the next deadline, once the runner's stop
    /// flag is raised (e.g. by a `stop` action); the in-flight callable
    /// always runs to completion first.
    pub async fn drive(&self, runner: &ScenarioRunner) {
        let schedule = runner.schedule(self.peer_id);
        info!(
            peer_id = self.peer_id,
            events = schedule.len(),
            "Driving scenario schedule"
        );
        for event in &schedule {
            if runner.stop_requested() {
                info!("Stop requested, not firing the remaining scheduled events");
                break;
            }
            let Some(target) = event_deadline(self.start, event.offset) else {
                warn!(
                    "{}:{}: offset {:+.3e}s is not schedulable, skipping '{}'",
                    event.file, event.line, event.offset, event.action
                );
                continue;
            };
            let now = Instant::now();
            if target > now {
                tokio::time::sleep(target - now).await;
            }
            debug!(
                "{}:{} firing '{}' at +{:.3}s",
                event.file, event.line, event.action, event.offset
            );
            runner.fire(event);
        }
    }
}

/// Maps an event offset onto a wall-clock deadline.
///
/// Past-dated offsets resolve to a deadline at or before `start` so the
/// event fires immediately. Returns `None` for offsets no timer can
/// represent; those events cannot fire at their authored time at all.
fn event_deadline(start: Instant, offset: f64) -> Option<Instant> {
    if offset.is_nan() {
        return None;
    }
    if offset <= 0.0 {
        let behind = Duration::try_from_secs_f64(-offset).unwrap_or(Duration::MAX);
        return Some(start.checked_sub(behind).unwrap_or(start));
    }
    start.checked_add(Duration::try_from_secs_f64(offset).ok()?)
}

async fn expect_line(
    reader: &mut LineReader<OwnedReadHalf>,
    phase: &'static str,
) -> Result<String, SyncError> {
    reader
        .next_line()
        .await?
        .ok_or(SyncError::Disconnected { phase })
}
