use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_remote::TrackRemote;

use crate::peer::Peer;

/// Attempts per scheduled sync pass before giving up and rescheduling.
/// Bounds the time the room write lock is held under contention.
const MAX_SYNC_ATTEMPTS: usize = 25;

/// Delay before a non-converged sync pass is retried.
const SYNC_RETRY_DELAY: Duration = Duration::from_secs(3);

/// Prefix of every audio forwarding-track id.
pub const AUDIO_TRACK_PREFIX: &str = "audio";

/// Prefix of video forwarding-track ids on the given simulcast layer.
pub fn video_layer_prefix(layer: &str) -> String {
    format!("video_{layer}_")
}

#[derive(Debug, thiserror::Error)]
pub enum TrackError {
    #[error("video track {0} has a blank RID")]
    BlankRid(String),
    #[error("unsupported track kind: {0:?}")]
    ForbiddenKind(RTPCodecType),
}

/// Compose the room-table id for an ingress stream: `audio_<remote-id>`
/// for audio, `video_<rid>_<remote-id>` for simulcast video. Video without
/// a RID is a client error and is refused.
pub fn compose_track_id(
    kind: RTPCodecType,
    rid: &str,
    remote_id: &str,
) -> Result<String, TrackError> {
    match kind {
        RTPCodecType::Audio => Ok(format!("{AUDIO_TRACK_PREFIX}_{remote_id}")),
        RTPCodecType::Video => {
            if rid.is_empty() {
                return Err(TrackError::BlankRid(remote_id.to_string()));
            }
            Ok(format!("video_{rid}_{remote_id}"))
        }
        RTPCodecType::Unspecified => Err(TrackError::ForbiddenKind(kind)),
    }
}

#[derive(Default)]
struct RoomState {
    peers: HashMap<Uuid, Arc<Peer>>,
    output_tracks: HashMap<String, Arc<TrackLocalStaticRTP>>,
}

/// One conference room: the peer set and the shared output-track table,
/// both under a single readers-writer lock. Lock order is always
/// Room → Peer, never the reverse.
pub struct Room {
    id: String,
    state: RwLock<RoomState>,
    /// Self-handle for rescheduling a non-converged sync pass.
    this: Weak<Room>,
}

impl Room {
    pub fn new(id: String) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            id,
            state: RwLock::new(RoomState::default()),
            this: this.clone(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn add_peer(&self, peer: Arc<Peer>) {
        let mut state = self.state.write().await;
        info!(room = %self.id, peer = %peer.id(), "peer joined");
        state.peers.insert(peer.id(), peer);
    }

    pub async fn remove_peer(&self, peer_id: Uuid) {
        let mut state = self.state.write().await;
        if state.peers.remove(&peer_id).is_some() {
            info!(room = %self.id, peer = %peer_id, "peer left");
        }
    }

    /// Admit an ingress stream: compute its table id, wrap it in a
    /// forwarding track with the remote's codec and stream id, and publish
    /// it in the output table. Fan-out to the other peers happens on the
    /// next sync pass.
    pub async fn add_track(
        &self,
        remote: &TrackRemote,
    ) -> Result<Arc<TrackLocalStaticRTP>, TrackError> {
        let rid = remote.rid().to_string();
        self.insert_output_track(
            remote.kind(),
            &rid,
            &remote.id(),
            &remote.stream_id(),
            remote.codec().capability,
        )
        .await
    }

    pub(crate) async fn insert_output_track(
        &self,
        kind: RTPCodecType,
        rid: &str,
        remote_id: &str,
        stream_id: &str,
        codec: RTCRtpCodecCapability,
    ) -> Result<Arc<TrackLocalStaticRTP>, TrackError> {
        let track_id = compose_track_id(kind, rid, remote_id)?;
        let track = Arc::new(if rid.is_empty() {
            TrackLocalStaticRTP::new(codec, track_id.clone(), stream_id.to_string())
        } else {
            TrackLocalStaticRTP::new_with_rid(
                codec,
                track_id.clone(),
                rid.to_string(),
                stream_id.to_string(),
            )
        });

        let mut state = self.state.write().await;
        info!(room = %self.id, track = %track_id, "forwarding track published");
        state.output_tracks.insert(track_id, Arc::clone(&track));
        Ok(track)
    }

    /// Withdraw a forwarding track. Senders on the other peers are
    /// detached by the next sync pass.
    pub async fn remove_track(&self, track_id: &str) {
        let mut state = self.state.write().await;
        if state.output_tracks.remove(track_id).is_some() {
            info!(room = %self.id, track = %track_id, "forwarding track withdrawn");
        }
    }

    /// Reconcile every peer with the output table, re-offering where the
    /// sender set changed. Up to [`MAX_SYNC_ATTEMPTS`] attempts under one
    /// write-lock acquisition; on non-convergence another pass is
    /// scheduled after [`SYNC_RETRY_DELAY`] without holding the lock.
    pub async fn signal_all_peers(&self) -> bool {
        let converged = {
            let mut state = self.state.write().await;
            let mut converged = false;
            for _ in 0..MAX_SYNC_ATTEMPTS {
                if self.attempt_sync(&mut state).await {
                    converged = true;
                    break;
                }
            }
            converged
        };

        if !converged {
            warn!(room = %self.id, "sync did not converge, retrying in {SYNC_RETRY_DELAY:?}");
            if let Some(room) = self.this.upgrade() {
                schedule_retry(room);
            }
        }

        // A key-frame round right after a topology change shortens the
        // time a fresh subscriber spends on a frozen frame.
        self.dispatch_key_frame().await;
        converged
    }

    async fn attempt_sync(&self, state: &mut RoomState) -> bool {
        // Peers whose connection closed under us are dropped first; the
        // attempt restarts so the remaining peers see the final peer set.
        let closed: Vec<Uuid> = state
            .peers
            .iter()
            .filter(|(_, peer)| peer.connection_state() == RTCPeerConnectionState::Closed)
            .map(|(id, _)| *id)
            .collect();
        if !closed.is_empty() {
            for peer_id in closed {
                debug!(room = %self.id, peer = %peer_id, "dropping closed peer");
                state.peers.remove(&peer_id);
            }
            return false;
        }

        for peer in state.peers.values() {
            if let Err(e) = peer.sync(&state.output_tracks).await {
                debug!(room = %self.id, peer = %peer.id(), "sync attempt failed: {e:#}");
                return false;
            }
        }
        true
    }

    /// Ask every publisher in the room for a fresh key frame.
    pub async fn dispatch_key_frame(&self) {
        let state = self.state.read().await;
        for peer in state.peers.values() {
            peer.dispatch_key_frame().await;
        }
    }

    /// Close every peer and drop all state. Used at service shutdown.
    /// Peers are drained first so no lock is held while closing; closing
    /// fires connection-state callbacks that take the room lock themselves.
    pub async fn close(&self) {
        let peers: Vec<Arc<Peer>> = {
            let mut state = self.state.write().await;
            state.output_tracks.clear();
            state.peers.drain().map(|(_, peer)| peer).collect()
        };
        for peer in peers {
            if let Err(e) = peer.close().await {
                warn!(room = %self.id, peer = %peer.id(), "failed to close peer: {e:#}");
            }
        }
        info!(room = %self.id, "room closed");
    }

    #[cfg(test)]
    pub(crate) async fn contains_peer(&self, peer_id: Uuid) -> bool {
        self.state.read().await.peers.contains_key(&peer_id)
    }

    #[cfg(test)]
    pub(crate) async fn output_track_ids(&self) -> Vec<String> {
        self.state.read().await.output_tracks.keys().cloned().collect()
    }
}

/// Re-run the sync pass later, off the current task. Kept out of
/// `signal_all_peers` so the retry future does not nest inside it.
fn schedule_retry(room: Arc<Room>) {
    tokio::spawn(async move {
        tokio::time::sleep(SYNC_RETRY_DELAY).await;
        room.signal_all_peers().await;
    });
}
