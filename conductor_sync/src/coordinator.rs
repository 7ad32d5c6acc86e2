//! The rendezvous coordinator.
//!
//! Accepts exactly `expected_peers` connections, walks each through the
//! three-phase registration grammar, and releases everyone at once when
//! the last peer signals readiness.
//!
//! All barrier state (the peer table, the ready count) is owned by the
//! single actor loop in [`Coordinator::run`]; connection tasks only do
//! socket I/O and talk to the actor over channels, so no locks guard the
//! shared state.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use conductor_core::metadata::{MetadataTable, PeerId, PeerRecord};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::SyncError;
use crate::proto::{unix_now, LineReader, PeerCommand};

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Address to listen on, e.g. `0.0.0.0:7999`.
    pub listen_addr: String,
    /// Number of peer connections to accept and wait for.
    pub expected_peers: usize,
    /// Delay between distributing the table and sending `go`, bounding
    /// worst-case delivery jitter of the table lines.
    pub post_delay: Duration,
    /// How long to keep waiting after a connection is lost before
    /// readiness, once the barrier can no longer be reached.
    pub grace_period: Duration,
}

impl CoordinatorConfig {
    /// Creates a configuration with default delays (5 s post-distribution,
    /// 30 s grace).
    pub fn new(listen_addr: impl Into<String>, expected_peers: usize) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            expected_peers,
            post_delay: Duration::from_secs(5),
            grace_period: Duration::from_secs(30),
        }
    }

    /// Overrides the post-distribution delay.
    pub fn with_post_delay(mut self, delay: Duration) -> Self {
        self.post_delay = delay;
        self
    }

    /// Overrides the grace period.
    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }
}

/// Operator summary returned after a completed barrier.
#[derive(Debug, Clone)]
pub struct BarrierReport {
    /// Number of peers that synchronized.
    pub peers: usize,
    /// Wall time from listen to the last peer disconnecting.
    pub elapsed: Duration,
    /// Smallest measured clock offset across peers, seconds.
    pub min_clock_offset: f64,
    /// Largest measured clock offset across peers, seconds.
    pub max_clock_offset: f64,
}

/// What a connection task hands to the barrier actor at readiness.
struct Registration {
    order: usize,
    address: SocketAddr,
    clock_offset: f64,
    vars: BTreeMap<String, String>,
    release: oneshot::Sender<Release>,
}

/// What the actor hands back once the barrier completes.
struct Release {
    peer_id: PeerId,
    table_line: String,
    go: broadcast::Receiver<()>,
}

enum ConnEvent {
    Ready(Registration),
    Closed { order: usize, reached_ready: bool },
}

/// The experiment rendezvous coordinator.
pub struct Coordinator {
    listener: TcpListener,
    config: CoordinatorConfig,
}

impl Coordinator {
    /// Binds the listener. The barrier itself runs in [`Coordinator::run`].
    pub async fn bind(config: CoordinatorConfig) -> Result<Self, SyncError> {
        let listener = TcpListener::bind(&config.listen_addr).await?;
        info!(
            "Coordinator listening on {} for {} peers",
            listener.local_addr()?,
            config.expected_peers
        );
        Ok(Self { listener, config })
    }

    /// The actual bound address, useful when configured with port 0.
    pub fn local_addr(&self) -> Result<SocketAddr, SyncError> {
        Ok(self.listener.local_addr()?)
    }

    /// Runs the barrier to completion: accept, register, distribute, `go`,
    /// then wait for every peer to disconnect.
    pub async fn run(self) -> Result<BarrierReport, SyncError> {
        let Coordinator { listener, config } = self;
        let expected = config.expected_peers;
        let started = Instant::now();

        let (events_tx, mut events_rx) = mpsc::channel(expected.max(1) * 2);
        let (go_tx, _) = broadcast::channel(1);

        let acceptor_events = events_tx.clone();
        tokio::spawn(async move {
            for order in 0..expected {
                match listener.accept().await {
                    Ok((stream, address)) => {
                        debug!("Accepted peer connection #{} from {address}", order + 1);
                        let events = acceptor_events.clone();
                        tokio::spawn(handle_peer(stream, address, order, events));
                    }
                    Err(e) => {
                        error!("Accept failed: {e}");
                        let _ = acceptor_events
                            .send(ConnEvent::Closed {
                                order,
                                reached_ready: false,
                            })
                            .await;
                        return;
                    }
                }
            }
            // Exactly `expected` connections accepted; stop listening.
        });
        drop(events_tx);

        let mut registrations: Vec<Registration> = Vec::new();
        let mut ready = 0usize;
        let mut closed = 0usize;
        let mut distributed = false;
        let mut grace_deadline: Option<Instant> = None;
        let mut min_offset = f64::INFINITY;
        let mut max_offset = f64::NEG_INFINITY;

        loop {
            let deadline = grace_deadline;
            let grace_sleep = async move {
                match deadline {
                    Some(d) => tokio::time::sleep_until(d).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                event = events_rx.recv() => match event {
                    Some(ConnEvent::Ready(reg)) => {
                        ready += 1;
                        info!("{ready}/{expected} peers ready");
                        registrations.push(reg);
                        if ready == expected {
                            registrations.sort_by_key(|r| r.order);
                            let records: Vec<PeerRecord> = registrations
                                .iter()
                                .enumerate()
                                .map(|(idx, reg)| PeerRecord {
                                    id: idx as PeerId + 1,
                                    address: reg.address.to_string(),
                                    clock_offset: reg.clock_offset,
                                    vars: reg.vars.clone(),
                                })
                                .collect();
                            for record in &records {
                                min_offset = min_offset.min(record.clock_offset);
                                max_offset = max_offset.max(record.clock_offset);
                            }
                            let table = MetadataTable::new(records);
                            let table_line = table.to_wire_line()?;
                            info!(
                                "All peers ready, distributing metadata table ({} bytes)",
                                table_line.len()
                            );
                            for (idx, reg) in registrations.drain(..).enumerate() {
                                let release = Release {
                                    peer_id: idx as PeerId + 1,
                                    table_line: table_line.clone(),
                                    go: go_tx.subscribe(),
                                };
                                if reg.release.send(release).is_err() {
                                    warn!(
                                        "Peer #{} vanished before distribution",
                                        reg.order + 1
                                    );
                                }
                            }
                            tokio::time::sleep(config.post_delay).await;
                            let receivers = go_tx.send(()).unwrap_or(0);
                            info!("Sent go to {receivers} peers");
                            distributed = true;
                        }
                    }
                    Some(ConnEvent::Closed { order, reached_ready }) => {
                        closed += 1;
                        if !reached_ready && !distributed {
                            warn!(
                                "Peer connection #{} lost before readiness; \
                                 the barrier can no longer complete",
                                order + 1
                            );
                            grace_deadline
                                .get_or_insert(Instant::now() + config.grace_period);
                        }
                        if closed == expected {
                            if distributed {
                                break;
                            }
                            return Err(SyncError::BarrierFailed { ready, expected });
                        }
                    }
                    None => {
                        if distributed {
                            break;
                        }
                        return Err(SyncError::BarrierFailed { ready, expected });
                    }
                },
                _ = grace_sleep, if grace_deadline.is_some() && !distributed => {
                    return Err(SyncError::BarrierFailed { ready, expected });
                }
            }
        }

        let report = BarrierReport {
            peers: expected,
            elapsed: started.elapsed(),
            min_clock_offset: min_offset,
            max_clock_offset: max_offset,
        };
        info!(
            "Barrier complete: {} peers in {:.2?}, clock offsets {:.3}s..{:.3}s",
            report.peers, report.elapsed, report.min_clock_offset, report.max_clock_offset
        );
        Ok(report)
    }
}

/// Drives one peer connection and always reports a terminal `Closed`.
async fn handle_peer(
    stream: TcpStream,
    address: SocketAddr,
    order: usize,
    events: mpsc::Sender<ConnEvent>,
) {
    let mut reached_ready = false;
    if let Err(e) = peer_session(stream, address, order, &events, &mut reached_ready).await {
        warn!("Peer #{} ({address}): {e}", order + 1);
    }
    let _ = events
        .send(ConnEvent::Closed {
            order,
            reached_ready,
        })
        .await;
}

async fn peer_session(
    stream: TcpStream,
    address: SocketAddr,
    order: usize,
    events: &mpsc::Sender<ConnEvent>,
    reached_ready: &mut bool,
) -> Result<(), SyncError> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = LineReader::new(read_half);

    // Phase a: exactly one clock reading, first.
    let line = reader
        .next_line()
        .await?
        .ok_or(SyncError::Disconnected { phase: "clock exchange" })?;
    let clock_offset = match PeerCommand::parse(&line)? {
        PeerCommand::Time(peer_clock) => unix_now() - peer_clock,
        other => {
            return Err(SyncError::protocol(format!(
                "expected time command, got {other:?}"
            )))
        }
    };
    debug!(
        "Peer #{} ({address}) clock offset {clock_offset:+.4}s",
        order + 1
    );

    // Phase b/c: metadata pairs, then readiness.
    let mut vars = BTreeMap::new();
    loop {
        let line = reader
            .next_line()
            .await?
            .ok_or(SyncError::Disconnected { phase: "registration" })?;
        match PeerCommand::parse(&line)? {
            PeerCommand::Set { key, value } => {
                vars.insert(key, value);
            }
            PeerCommand::Ready => break,
            PeerCommand::Time(_) => {
                return Err(SyncError::protocol("duplicate time command"));
            }
        }
    }

    let (release_tx, release_rx) = oneshot::channel();
    *reached_ready = true;
    events
        .send(ConnEvent::Ready(Registration {
            order,
            address,
            clock_offset,
            vars,
            release: release_tx,
        }))
        .await
        .map_err(|_| SyncError::Disconnected { phase: "barrier" })?;

    let Release {
        peer_id,
        table_line,
        mut go,
    } = release_rx
        .await
        .map_err(|_| SyncError::Disconnected { phase: "barrier" })?;

    write_half
        .write_all(format!("id:{peer_id}\n").as_bytes())
        .await?;
    write_half.write_all(table_line.as_bytes()).await?;
    write_half.write_all(b"\n").await?;

    go.recv()
        .await
        .map_err(|_| SyncError::Disconnected { phase: "go" })?;
    write_half.write_all(b"go\n").await?;

    // The peer acknowledges by disconnecting; anything else it sends now
    // is out of phase.
    while let Some(line) = reader.next_line().await? {
        warn!("Peer {peer_id} sent data after go: '{line}'");
    }
    Ok(())
}
