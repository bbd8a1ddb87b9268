use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};
use webrtc::track::track_remote::TrackRemote;

use crate::peer::Peer;
use crate::room::Room;

/// Cadence of the room synchronizer.
const SYNC_INTERVAL: Duration = Duration::from_secs(1);

/// Cadence of the key-frame (PLI) broadcast.
const KEYFRAME_INTERVAL: Duration = Duration::from_secs(3);

/// MTU-sized scratch buffer for the ingress pump, reused across reads.
const INGRESS_BUFFER_SIZE: usize = 1500;

/// Registry of active rooms plus the process-wide tickers that keep them
/// converged. Injected into the HTTP handlers; nothing here is global.
pub struct RoomService {
    rooms: RwLock<HashMap<String, Arc<Room>>>,
}

impl RoomService {
    pub fn new() -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
        }
    }

    /// Return the room with this id, creating it on first reference.
    pub async fn create_or_get_room(&self, room_id: &str) -> Arc<Room> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(room_id) {
                return Arc::clone(room);
            }
        }

        let mut rooms = self.rooms.write().await;
        Arc::clone(rooms.entry(room_id.to_string()).or_insert_with(|| {
            info!(room = %room_id, "room created");
            Room::new(room_id.to_string())
        }))
    }

    /// Construct a peer, register it in the room and wire its callbacks:
    /// connection-state teardown, ICE candidate forwarding, and the ingress
    /// pump for every published track.
    pub async fn init_peer_connection(&self, room: &Arc<Room>) -> anyhow::Result<Arc<Peer>> {
        let peer = Arc::new(Peer::new().await?);
        room.add_peer(Arc::clone(&peer)).await;

        {
            let room = Arc::clone(room);
            let weak = Arc::downgrade(&peer);
            // Teardown runs on its own task: closing the connection fires
            // this handler again, so it must never be blocked on the close.
            peer.on_connection_state_change(move |state| {
                if matches!(
                    state,
                    RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
                ) {
                    let room = Arc::clone(&room);
                    let weak = weak.clone();
                    tokio::spawn(async move {
                        let Some(peer) = weak.upgrade() else {
                            return;
                        };
                        room.remove_peer(peer.id()).await;
                        if state == RTCPeerConnectionState::Failed {
                            warn!(peer = %peer.id(), "peer connection failed");
                            if let Err(e) = peer.close().await {
                                warn!(peer = %peer.id(), "close after failure: {e:#}");
                            }
                        } else {
                            info!(peer = %peer.id(), "peer connection closed");
                        }
                    });
                }
                Box::pin(async {})
            });
        }

        {
            let weak = Arc::downgrade(&peer);
            peer.on_ice_candidate(move |candidate| {
                let weak = weak.clone();
                Box::pin(async move {
                    let Some(peer) = weak.upgrade() else {
                        return;
                    };
                    if let Err(e) = peer.coordinator().send_ice_candidate(candidate.as_ref()).await
                    {
                        warn!(peer = %peer.id(), "failed to queue ICE candidate: {e}");
                    }
                })
            });
        }

        {
            let room = Arc::clone(room);
            peer.on_track(move |track, _receiver, _transceiver| {
                let room = Arc::clone(&room);
                Box::pin(async move {
                    tokio::spawn(run_ingress(room, track));
                })
            });
        }

        Ok(peer)
    }

    async fn rooms_snapshot(&self) -> Vec<Arc<Room>> {
        self.rooms.read().await.values().cloned().collect()
    }

    /// Reconcile every room once per second. Each room runs on its own
    /// task so a slow room never delays the tick.
    pub async fn run_sync(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(SYNC_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("sync ticker stopped");
                    return;
                }
                _ = ticker.tick() => {
                    for room in self.rooms_snapshot().await {
                        tokio::spawn(async move {
                            room.signal_all_peers().await;
                        });
                    }
                }
            }
        }
    }

    /// Broadcast PLI to every room every three seconds so late joiners
    /// start decoding promptly.
    pub async fn run_keyframe_dispatch(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(KEYFRAME_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("key-frame ticker stopped");
                    return;
                }
                _ = ticker.tick() => {
                    for room in self.rooms_snapshot().await {
                        room.dispatch_key_frame().await;
                    }
                }
            }
        }
    }

    /// Close every room, which closes every peer connection and thereby
    /// ends every ingress pump.
    pub async fn close_all_connections(&self) {
        for room in self.rooms_snapshot().await {
            room.close().await;
        }
    }
}

impl Default for RoomService {
    fn default() -> Self {
        Self::new()
    }
}

/// Forward one published track into the room until it ends: admit it to
/// the output table, copy RTP until a read or write fails, then withdraw
/// it. The buffer is reused across iterations.
async fn run_ingress(room: Arc<Room>, remote: Arc<TrackRemote>) {
    let output = match room.add_track(&remote).await {
        Ok(track) => track,
        Err(e) => {
            warn!(room = %room.id(), track = %remote.id(), "ingress refused: {e}");
            return;
        }
    };
    info!(room = %room.id(), track = %output.id(), "ingress started");
    room.signal_all_peers().await;

    let mut buffer = vec![0u8; INGRESS_BUFFER_SIZE];
    loop {
        let packet = match remote.read(&mut buffer).await {
            Ok((packet, _)) => packet,
            Err(e) => {
                debug!(track = %output.id(), "ingress read ended: {e}");
                break;
            }
        };
        if let Err(e) = output.write_rtp(&packet).await {
            if e == webrtc::Error::ErrClosedPipe {
                debug!(track = %output.id(), "forwarding track closed");
            } else {
                warn!(track = %output.id(), "ingress write failed: {e}");
            }
            break;
        }
    }

    room.remove_track(output.id()).await;
    info!(room = %room.id(), track = %output.id(), "ingress ended");
    room.signal_all_peers().await;
}
