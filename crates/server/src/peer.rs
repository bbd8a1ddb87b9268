use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Context;
use huddle_protocol::SignalEvent;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpHeaderExtensionCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::coordinator::NegotiationCoordinator;
use crate::room::{compose_track_id, video_layer_prefix, AUDIO_TRACK_PREFIX};

/// Simulcast layer selected for every peer until it asks for another one.
pub const DEFAULT_QUALITY: &str = "low";

/// A local track whose id does not match the peer's selected quality layer.
#[derive(Debug, thiserror::Error)]
#[error("track {track_id} does not match selected quality {quality}")]
pub struct QualityMismatch {
    pub track_id: String,
    pub quality: String,
}

/// One participant: an exclusively owned PeerConnection, its negotiation
/// coordinator, and the simulcast layer it currently receives.
///
/// `quality` doubles as the peer's sync lock: the room synchronizer reads
/// it for the duration of a sync step, a quality change writes it, so the
/// two are serialized per peer.
pub struct Peer {
    id: Uuid,
    connection: Arc<RTCPeerConnection>,
    coordinator: NegotiationCoordinator,
    quality: RwLock<String>,
}

impl Peer {
    /// Build a PeerConnection with an empty configuration (trickle ICE,
    /// host candidates) and the default codec/interceptor set.
    pub async fn new() -> anyhow::Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .context("failed to register default codecs")?;

        // Header extensions needed to demux simulcast layers by RID
        for extension in [
            "urn:ietf:params:rtp-hdrext:sdes:mid",
            "urn:ietf:params:rtp-hdrext:sdes:rtp-stream-id",
            "urn:ietf:params:rtp-hdrext:sdes:repaired-rtp-stream-id",
        ] {
            media_engine
                .register_header_extension(
                    RTCRtpHeaderExtensionCapability {
                        uri: extension.to_owned(),
                    },
                    RTPCodecType::Video,
                    None,
                )
                .context("failed to register header extension")?;
        }

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .context("failed to register default interceptors")?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let connection = Arc::new(
            api.new_peer_connection(RTCConfiguration::default())
                .await
                .context("failed to create peer connection")?,
        );
        let coordinator = NegotiationCoordinator::new(Arc::downgrade(&connection));

        Ok(Self {
            id: Uuid::new_v4(),
            connection,
            coordinator,
            quality: RwLock::new(DEFAULT_QUALITY.to_string()),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn coordinator(&self) -> &NegotiationCoordinator {
        &self.coordinator
    }

    pub fn connection_state(&self) -> RTCPeerConnectionState {
        self.connection.connection_state()
    }

    pub fn on_track(
        &self,
        handler: impl FnMut(
            Arc<TrackRemote>,
            Arc<RTCRtpReceiver>,
            Arc<RTCRtpTransceiver>,
        ) -> Pin<Box<dyn Future<Output = ()> + Send>>
        + Send
        + Sync
        + 'static,
    ) {
        self.connection.on_track(Box::new(handler));
    }

    pub fn on_ice_candidate(
        &self,
        handler: impl FnMut(Option<RTCIceCandidate>) -> Pin<Box<dyn Future<Output = ()> + Send>>
        + Send
        + Sync
        + 'static,
    ) {
        self.connection.on_ice_candidate(Box::new(handler));
    }

    pub fn on_connection_state_change(
        &self,
        handler: impl FnMut(RTCPeerConnectionState) -> Pin<Box<dyn Future<Output = ()> + Send>>
        + Send
        + Sync
        + 'static,
    ) {
        self.connection
            .on_peer_connection_state_change(Box::new(handler));
    }

    /// Ids of the tracks this peer is being sent (senders with a live track).
    pub async fn output_track_ids(&self) -> Vec<String> {
        let mut ids = Vec::new();
        for sender in self.connection.get_senders().await {
            if let Some(track) = sender.track().await {
                ids.push(track.id().to_string());
            }
        }
        ids
    }

    /// Ids of the tracks this peer publishes, composed the same way the
    /// room composes its output-table keys so the two are comparable.
    pub async fn input_track_ids(&self) -> Vec<String> {
        let mut ids = Vec::new();
        for receiver in self.connection.get_receivers().await {
            let Some(track) = receiver.tracks().await.into_iter().next() else {
                continue;
            };
            let rid = track.rid().to_string();
            if let Ok(id) = compose_track_id(track.kind(), &rid, &track.id()) {
                ids.push(id);
            }
        }
        ids
    }

    /// Whether a forwarding track may be attached to this peer: audio
    /// always, video only on the currently selected layer.
    pub async fn can_add_track(&self, track_id: &str) -> bool {
        let quality = self.quality.read().await;
        Self::quality_allows(&quality, track_id)
    }

    fn quality_allows(quality: &str, track_id: &str) -> bool {
        track_id.starts_with(AUDIO_TRACK_PREFIX)
            || track_id.starts_with(&video_layer_prefix(quality))
    }

    /// Attach a forwarding track. Refused when the id does not fit the
    /// selected quality layer.
    pub async fn add_track(
        &self,
        track: Arc<TrackLocalStaticRTP>,
    ) -> anyhow::Result<Arc<RTCRtpSender>> {
        let quality = self.quality.read().await;
        let track_id = track.id().to_string();
        if !Self::quality_allows(&quality, &track_id) {
            return Err(QualityMismatch {
                track_id,
                quality: quality.clone(),
            }
            .into());
        }
        let sender = self
            .connection
            .add_track(track as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .with_context(|| format!("failed to attach track {track_id}"))?;
        drain_sender_rtcp(Arc::clone(&sender));
        Ok(sender)
    }

    /// Detach the sender carrying `track_id`. A no-op when absent.
    pub async fn remove_track(&self, track_id: &str) -> anyhow::Result<()> {
        for sender in self.connection.get_senders().await {
            let Some(track) = sender.track().await else {
                continue;
            };
            if track.id() == track_id {
                self.connection
                    .remove_track(&sender)
                    .await
                    .with_context(|| format!("failed to detach track {track_id}"))?;
                return Ok(());
            }
        }
        Ok(())
    }

    /// Select another simulcast layer. Senders are not touched here; the
    /// next sync pass detaches the old layer and attaches the new one.
    pub async fn change_quality(&self, layer: &str) {
        let mut quality = self.quality.write().await;
        if *quality != layer {
            info!(peer = %self.id, from = %*quality, to = layer, "quality layer changed");
            *quality = layer.to_string();
        }
    }

    /// Bring this peer's sender set into agreement with the room's output
    /// table and re-offer when anything changed. Runs under the quality
    /// read lock so a concurrent quality change waits for the step.
    pub async fn sync(
        &self,
        output_tracks: &HashMap<String, Arc<TrackLocalStaticRTP>>,
    ) -> anyhow::Result<()> {
        let quality = self.quality.read().await;
        let mut existing: HashSet<String> = HashSet::new();
        let mut changed = false;

        // Detach senders whose track left the room table or no longer fits
        // the selected layer.
        for sender in self.connection.get_senders().await {
            let Some(track) = sender.track().await else {
                continue;
            };
            let track_id = track.id().to_string();
            let stale = !output_tracks.contains_key(&track_id)
                || !Self::quality_allows(&quality, &track_id);
            existing.insert(track_id.clone());
            if stale {
                self.connection
                    .remove_track(&sender)
                    .await
                    .with_context(|| format!("failed to detach stale track {track_id}"))?;
                changed = true;
            }
        }

        // Loopback guard: a peer never gets its own tracks back.
        for track_id in self.input_track_ids().await {
            existing.insert(track_id);
        }

        for (track_id, track) in output_tracks {
            if !Self::quality_allows(&quality, track_id) || existing.contains(track_id) {
                continue;
            }
            let sender = self
                .connection
                .add_track(Arc::clone(track) as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .with_context(|| format!("failed to attach track {track_id}"))?;
            drain_sender_rtcp(sender);
            changed = true;
        }

        if changed {
            debug!(peer = %self.id, "sender set changed, re-offering");
            self.coordinator.send_offer().await?;
        }
        Ok(())
    }

    /// Ask every publisher this peer receives from for a fresh key frame.
    /// Best effort; write failures are ignored.
    pub async fn dispatch_key_frame(&self) {
        for receiver in self.connection.get_receivers().await {
            let Some(track) = receiver.tracks().await.into_iter().next() else {
                continue;
            };
            let _ = self
                .connection
                .write_rtcp(&[Box::new(PictureLossIndication {
                    sender_ssrc: 0,
                    media_ssrc: track.ssrc(),
                })])
                .await;
        }
    }

    /// Apply a signaling event: quality selection here, everything else in
    /// the negotiation coordinator.
    pub async fn handle_event(&self, event: &str, data: &str) -> anyhow::Result<()> {
        if event == SignalEvent::ChangeQuality.as_str() {
            let layer: String = serde_json::from_str(data)
                .context("change_quality payload must be a JSON string")?;
            self.change_quality(&layer).await;
            return Ok(());
        }
        self.coordinator.handle_event(event, data).await?;
        Ok(())
    }

    pub async fn close(&self) -> anyhow::Result<()> {
        self.connection
            .close()
            .await
            .context("failed to close peer connection")?;
        Ok(())
    }
}

/// Inbound RTCP only reaches the interceptor chain once somebody reads
/// from the sender. The loop ends when the sender is detached or the
/// connection closes.
fn drain_sender_rtcp(sender: Arc<RTCRtpSender>) {
    tokio::spawn(async move {
        let mut rtcp_buf = vec![0u8; 1500];
        while let Ok((_, _)) = sender.read(&mut rtcp_buf).await {}
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
    use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;

    fn audio_track(track_id: &str) -> Arc<TrackLocalStaticRTP> {
        Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            track_id.to_string(),
            "huddle".to_string(),
        ))
    }

    fn video_track(track_id: &str, rid: &str) -> Arc<TrackLocalStaticRTP> {
        Arc::new(TrackLocalStaticRTP::new_with_rid(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                clock_rate: 90000,
                ..Default::default()
            },
            track_id.to_string(),
            rid.to_string(),
            "huddle".to_string(),
        ))
    }

    #[tokio::test]
    async fn default_quality_admits_audio_and_low_video() {
        let peer = Peer::new().await.unwrap();
        assert!(peer.can_add_track("audio_mic1").await);
        assert!(peer.can_add_track("video_low_cam1").await);
        assert!(!peer.can_add_track("video_high_cam1").await);
        peer.close().await.unwrap();
    }

    #[tokio::test]
    async fn change_quality_moves_the_admission_window() {
        let peer = Peer::new().await.unwrap();
        peer.change_quality("high").await;
        assert!(!peer.can_add_track("video_low_cam1").await);
        assert!(peer.can_add_track("video_high_cam1").await);
        // Audio is never gated on quality
        assert!(peer.can_add_track("audio_mic1").await);
        peer.close().await.unwrap();
    }

    #[tokio::test]
    async fn add_track_refuses_mismatched_layer() {
        let peer = Peer::new().await.unwrap();
        let err = peer
            .add_track(video_track("video_high_cam1", "high"))
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<QualityMismatch>().is_some());
        assert!(peer.output_track_ids().await.is_empty());
        peer.close().await.unwrap();
    }

    #[tokio::test]
    async fn add_and_remove_track_round() {
        let peer = Peer::new().await.unwrap();
        peer.add_track(audio_track("audio_mic1")).await.unwrap();
        assert_eq!(peer.output_track_ids().await, ["audio_mic1"]);

        peer.remove_track("audio_mic1").await.unwrap();
        assert!(peer.output_track_ids().await.is_empty());

        // Removing an absent track is a no-op
        peer.remove_track("audio_mic1").await.unwrap();
        peer.close().await.unwrap();
    }

    #[tokio::test]
    async fn dispatch_key_frame_without_receivers_is_harmless() {
        let peer = Peer::new().await.unwrap();
        peer.dispatch_key_frame().await;
        peer.close().await.unwrap();
    }

    #[tokio::test]
    async fn change_quality_event_decodes_json_string() {
        let peer = Peer::new().await.unwrap();
        peer.handle_event("change_quality", r#""mid""#).await.unwrap();
        assert!(peer.can_add_track("video_mid_cam1").await);

        // A bare, unquoted payload is a protocol error
        assert!(peer.handle_event("change_quality", "mid").await.is_err());
        peer.close().await.unwrap();
    }
}
