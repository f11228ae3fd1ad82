//! Actor implementation for the swarm engine.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use super::commands::SwarmCommand;
use super::core::{Completion, ConnectionEngine};
use super::handle::SwarmHandle;
use crate::config::SwarmConfig;
use crate::network::{EncryptionNegotiator, TransportConnector};
use crate::protocol::PeerId;
use crate::storage::DiskReader;

/// Spawns the swarm engine actor and returns its handle.
///
/// The actor owns every torrent context. Host commands and I/O completions
/// are applied one at a time, so engine state never needs a lock.
///
/// # Examples
/// ```rust,no_run
/// # #[tokio::main]
/// # async fn main() {
/// use std::sync::Arc;
/// use std::time::Duration;
/// use riptide_swarm::config::SwarmConfig;
/// use riptide_swarm::engine::spawn_swarm_engine;
/// use riptide_swarm::network::{PlainTextNegotiator, TcpConnector};
/// use riptide_swarm::protocol::PeerId;
/// use riptide_swarm::storage::FileDiskReader;
///
/// let handle = spawn_swarm_engine(
///     SwarmConfig::default(),
///     PeerId::generate(),
///     Arc::new(TcpConnector::new(Duration::from_secs(10))),
///     Arc::new(PlainTextNegotiator),
///     Arc::new(FileDiskReader::new()),
/// );
/// # }
/// ```
pub fn spawn_swarm_engine(
    config: SwarmConfig,
    local_peer_id: PeerId,
    connector: Arc<dyn TransportConnector>,
    negotiator: Arc<dyn EncryptionNegotiator>,
    disk: Arc<dyn DiskReader>,
) -> SwarmHandle {
    let (sender, receiver) = mpsc::channel(config.connection.command_channel_capacity.max(1));
    let (engine, completions) =
        ConnectionEngine::new(config, local_peer_id, connector, negotiator, disk);

    tokio::spawn(async move {
        run_actor_loop(engine, receiver, completions).await;
    });

    SwarmHandle::new(sender)
}

/// Processes commands, completions and the scheduler tick until shutdown.
async fn run_actor_loop(
    mut engine: ConnectionEngine,
    mut receiver: mpsc::Receiver<SwarmCommand>,
    mut completions: mpsc::UnboundedReceiver<Completion>,
) {
    tracing::debug!("Swarm engine actor started");

    let mut tick = tokio::time::interval(engine.config.connection.connect_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            command = receiver.recv() => {
                let Some(command) = command else {
                    break;
                };
                if !handle_command(&mut engine, command) {
                    break;
                }
            }
            Some(completion) = completions.recv() => {
                engine.handle_completion(completion);
            }
            _ = tick.tick() => {
                engine.fill_connection_slots();
            }
        }
    }

    tracing::debug!("Swarm engine actor stopped");
}

/// Applies a single command. Returns false to stop the actor.
fn handle_command(engine: &mut ConnectionEngine, command: SwarmCommand) -> bool {
    match command {
        SwarmCommand::AddTorrent { torrent, responder } => {
            let _ = responder.send(engine.add_torrent(torrent));
        }

        SwarmCommand::RemoveTorrent {
            info_hash,
            responder,
        } => {
            let _ = responder.send(engine.remove_torrent(info_hash));
        }

        SwarmCommand::AddPeers {
            info_hash,
            peers,
            responder,
        } => {
            let _ = responder.send(engine.add_peers(info_hash, peers));
        }

        SwarmCommand::RequeueBusyPeers {
            info_hash,
            responder,
        } => {
            let _ = responder.send(engine.requeue_busy_peers(info_hash));
        }

        SwarmCommand::AcceptIncoming {
            info_hash,
            transport,
            responder,
        } => {
            let _ = responder.send(engine.accept_incoming(info_hash, transport));
        }

        SwarmCommand::SendMessage {
            info_hash,
            address,
            message,
            responder,
        } => {
            let _ = responder.send(engine.send_message(info_hash, address, message));
        }

        SwarmCommand::DisconnectPeer {
            info_hash,
            address,
            reason,
            responder,
        } => {
            let _ = responder.send(engine.disconnect_peer(info_hash, address, reason));
        }

        SwarmCommand::CancelPending {
            info_hash,
            responder,
        } => {
            let cancelled = engine.cancel_pending(info_hash);
            engine.fill_connection_slots();
            let _ = responder.send(cancelled);
        }

        SwarmCommand::MarkInactive {
            info_hash,
            address,
            responder,
        } => {
            let _ = responder.send(engine.mark_inactive(info_hash, address));
        }

        SwarmCommand::SetMode {
            info_hash,
            mode,
            responder,
        } => {
            let _ = responder.send(engine.set_mode(info_hash, mode));
        }

        SwarmCommand::TryConnectAll { responder } => {
            let _ = responder.send(engine.try_connect_all());
        }

        SwarmCommand::Stats { responder } => {
            let _ = responder.send(engine.stats());
        }

        SwarmCommand::TorrentSnapshot {
            info_hash,
            responder,
        } => {
            let _ = responder.send(engine.torrent_snapshot(info_hash));
        }

        SwarmCommand::Subscribe { responder } => {
            let _ = responder.send(engine.subscribe());
        }

        SwarmCommand::AddBanPolicy { policy, responder } => {
            engine.add_ban_policy(policy);
            let _ = responder.send(());
        }

        SwarmCommand::Shutdown { responder } => {
            tracing::debug!("Swarm engine actor shutting down");
            let _ = responder.send(());
            return false;
        }
    }
    true
}
