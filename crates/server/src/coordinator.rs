use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};

use huddle_protocol::{SignalEvent, UndefinedEvent};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

/// Outbox capacity. A full outbox blocks the producer, which is acceptable:
/// it only fills when the WebSocket has stopped draining, and that peer is
/// about to be torn down.
const OUTBOX_CAPACITY: usize = 20;

/// An event queued for delivery to the remote side. `event` is the wire
/// name (`offer`, `answer`, `candidate`); `data` the JSON payload.
#[derive(Debug, Clone)]
pub struct OutboundEvent {
    pub event: &'static str,
    pub data: String,
}

/// Callback invoked by the send-listener for each drained event.
pub type OutboundEventHandler =
    Box<dyn Fn(OutboundEvent) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum SignalingError {
    #[error(transparent)]
    Undefined(#[from] UndefinedEvent),
    #[error("peer connection is gone")]
    ConnectionGone,
    #[error("outbox closed")]
    OutboxClosed,
    #[error("malformed signaling payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error(transparent)]
    WebRtc(#[from] webrtc::Error),
}

/// Per-peer SDP/ICE state machine.
///
/// Translates inbound signaling events into PeerConnection calls and queues
/// the PeerConnection's own output (offers, answers, candidates) for the
/// WebSocket writer. The coordinator never owns the connection; the Peer
/// owns both and the coordinator holds a weak back reference.
pub struct NegotiationCoordinator {
    connection: Weak<RTCPeerConnection>,
    outbox_tx: mpsc::Sender<OutboundEvent>,
    outbox_rx: std::sync::Mutex<Option<mpsc::Receiver<OutboundEvent>>>,
}

impl NegotiationCoordinator {
    pub fn new(connection: Weak<RTCPeerConnection>) -> Self {
        let (outbox_tx, outbox_rx) = mpsc::channel(OUTBOX_CAPACITY);
        Self {
            connection,
            outbox_tx,
            outbox_rx: std::sync::Mutex::new(Some(outbox_rx)),
        }
    }

    fn connection(&self) -> Result<Arc<RTCPeerConnection>, SignalingError> {
        self.connection
            .upgrade()
            .ok_or(SignalingError::ConnectionGone)
    }

    async fn enqueue(&self, event: SignalEvent, data: String) -> Result<(), SignalingError> {
        self.outbox_tx
            .send(OutboundEvent {
                event: event.wire_name(),
                data,
            })
            .await
            .map_err(|_| SignalingError::OutboxClosed)
    }

    /// Set the remote offer and immediately answer it.
    pub async fn accept_offer(&self, data: &str) -> Result<(), SignalingError> {
        let offer: RTCSessionDescription = serde_json::from_str(data)?;
        let connection = self.connection()?;
        connection.set_remote_description(offer).await?;
        self.send_answer(&connection).await
    }

    async fn send_answer(
        &self,
        connection: &Arc<RTCPeerConnection>,
    ) -> Result<(), SignalingError> {
        let answer = connection.create_answer(None).await?;
        let data = serde_json::to_string(&answer)?;
        // Local description must be set directly after create_answer, before
        // any other state change on this connection.
        connection.set_local_description(answer).await?;
        self.enqueue(SignalEvent::SendAnswer, data).await
    }

    pub async fn accept_answer(&self, data: &str) -> Result<(), SignalingError> {
        let answer: RTCSessionDescription = serde_json::from_str(data)?;
        self.connection()?.set_remote_description(answer).await?;
        Ok(())
    }

    pub async fn accept_ice_candidate(&self, data: &str) -> Result<(), SignalingError> {
        let candidate: RTCIceCandidateInit = serde_json::from_str(data)?;
        self.connection()?.add_ice_candidate(candidate).await?;
        Ok(())
    }

    /// Create a fresh offer, set it locally and queue it for the remote side.
    /// Called by the room synchronizer whenever a peer's sender set changed.
    pub async fn send_offer(&self) -> Result<(), SignalingError> {
        let connection = self.connection()?;
        let offer = connection.create_offer(None).await?;
        let data = serde_json::to_string(&offer)?;
        connection.set_local_description(offer).await?;
        self.enqueue(SignalEvent::SendOffer, data).await
    }

    /// Queue a locally gathered candidate for the remote side. A `None`
    /// candidate marks end-of-candidates and is not transmitted.
    pub async fn send_ice_candidate(
        &self,
        candidate: Option<&RTCIceCandidate>,
    ) -> Result<(), SignalingError> {
        let Some(candidate) = candidate else {
            return Ok(());
        };
        let init = candidate.to_json()?;
        let data = serde_json::to_string(&init)?;
        self.enqueue(SignalEvent::SendCandidate, data).await
    }

    /// Single dispatch point for the signaling alphabet: inbound events are
    /// applied to the connection, send-requests are queued under their wire
    /// name, anything else is a hard error.
    pub async fn handle_event(&self, event: &str, data: &str) -> Result<(), SignalingError> {
        match SignalEvent::parse(event)? {
            SignalEvent::Offer => self.accept_offer(data).await,
            SignalEvent::Answer => self.accept_answer(data).await,
            SignalEvent::Candidate => self.accept_ice_candidate(data).await,
            ev @ (SignalEvent::SendOffer
            | SignalEvent::SendAnswer
            | SignalEvent::SendCandidate) => self.enqueue(ev, data.to_string()).await,
            // change_quality is a peer-level event, not part of the
            // negotiation alphabet
            SignalEvent::ChangeQuality => {
                Err(UndefinedEvent(event.to_string()).into())
            }
        }
    }

    /// Drain the outbox on a dedicated task, invoking `callback` for each
    /// event in enqueue order. On cancellation the queue is closed and the
    /// task returns.
    pub fn listen_send_events(&self, cancel: CancellationToken, callback: OutboundEventHandler) {
        let outbox = self
            .outbox_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        tokio::spawn(async move {
            let Some(mut outbox) = outbox else {
                error!("send-event listener started twice, ignoring");
                return;
            };
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        outbox.close();
                        debug!("send-event listener cancelled");
                        return;
                    }
                    event = outbox.recv() => {
                        match event {
                            Some(event) => callback(event).await,
                            None => return,
                        }
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use webrtc::api::APIBuilder;
    use webrtc::api::interceptor_registry::register_default_interceptors;
    use webrtc::api::media_engine::MediaEngine;
    use webrtc::interceptor::registry::Registry;
    use webrtc::peer_connection::configuration::RTCConfiguration;
    use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

    async fn new_connection() -> Arc<RTCPeerConnection> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().unwrap();
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).unwrap();
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Arc::new(
            api.new_peer_connection(RTCConfiguration::default())
                .await
                .unwrap(),
        )
    }

    /// Start a listener that mirrors drained events into an unbounded
    /// channel the test can assert on.
    fn capture_events(
        coordinator: &NegotiationCoordinator,
        cancel: &CancellationToken,
    ) -> mpsc::UnboundedReceiver<OutboundEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        coordinator.listen_send_events(
            cancel.clone(),
            Box::new(move |event| {
                let tx = tx.clone();
                Box::pin(async move {
                    let _ = tx.send(event);
                })
            }),
        );
        rx
    }

    #[tokio::test]
    async fn send_offer_sets_local_description_and_queues_offer() {
        let connection = new_connection().await;
        let coordinator = NegotiationCoordinator::new(Arc::downgrade(&connection));
        let cancel = CancellationToken::new();
        let mut events = capture_events(&coordinator, &cancel);

        coordinator.send_offer().await.unwrap();

        let event = events.recv().await.unwrap();
        assert_eq!(event.event, "offer");
        let payload: serde_json::Value = serde_json::from_str(&event.data).unwrap();
        assert_eq!(payload["type"], "offer");
        assert!(connection.local_description().await.is_some());

        cancel.cancel();
        connection.close().await.unwrap();
    }

    #[tokio::test]
    async fn accept_offer_answers_immediately() {
        let caller = new_connection().await;
        caller
            .add_transceiver_from_kind(RTPCodecType::Audio, None)
            .await
            .unwrap();
        let offer = caller.create_offer(None).await.unwrap();
        let offer_json = serde_json::to_string(&offer).unwrap();

        let callee = new_connection().await;
        let coordinator = NegotiationCoordinator::new(Arc::downgrade(&callee));
        let cancel = CancellationToken::new();
        let mut events = capture_events(&coordinator, &cancel);

        coordinator.handle_event("offer", &offer_json).await.unwrap();

        let event = events.recv().await.unwrap();
        assert_eq!(event.event, "answer");
        let payload: serde_json::Value = serde_json::from_str(&event.data).unwrap();
        assert_eq!(payload["type"], "answer");
        assert!(callee.remote_description().await.is_some());
        assert!(callee.local_description().await.is_some());

        cancel.cancel();
        caller.close().await.unwrap();
        callee.close().await.unwrap();
    }

    #[tokio::test]
    async fn accept_ice_candidate_after_offer() {
        let caller = new_connection().await;
        caller
            .add_transceiver_from_kind(RTPCodecType::Audio, None)
            .await
            .unwrap();
        let offer_json = serde_json::to_string(&caller.create_offer(None).await.unwrap()).unwrap();

        let callee = new_connection().await;
        let coordinator = NegotiationCoordinator::new(Arc::downgrade(&callee));
        let cancel = CancellationToken::new();
        let _events = capture_events(&coordinator, &cancel);

        coordinator.handle_event("offer", &offer_json).await.unwrap();
        coordinator
            .handle_event(
                "candidate",
                r#"{"candidate":"candidate:1 1 udp 2130706431 127.0.0.1 54321 typ host","sdpMid":"0","sdpMLineIndex":0}"#,
            )
            .await
            .unwrap();

        cancel.cancel();
        caller.close().await.unwrap();
        callee.close().await.unwrap();
    }

    #[tokio::test]
    async fn undefined_event_is_rejected() {
        let connection = new_connection().await;
        let coordinator = NegotiationCoordinator::new(Arc::downgrade(&connection));

        match coordinator.handle_event("renegotiate", "{}").await {
            Err(SignalingError::Undefined(UndefinedEvent(tag))) => {
                assert_eq!(tag, "renegotiate");
            }
            other => panic!("expected UndefinedEvent, got {:?}", other.err()),
        }
        connection.close().await.unwrap();
    }

    #[tokio::test]
    async fn outbound_events_preserve_enqueue_order() {
        let connection = new_connection().await;
        let coordinator = NegotiationCoordinator::new(Arc::downgrade(&connection));
        let cancel = CancellationToken::new();
        let mut events = capture_events(&coordinator, &cancel);

        coordinator.handle_event("send_offer", "1").await.unwrap();
        coordinator.handle_event("send_candidate", "2").await.unwrap();
        coordinator.handle_event("send_answer", "3").await.unwrap();

        let drained: Vec<OutboundEvent> = vec![
            events.recv().await.unwrap(),
            events.recv().await.unwrap(),
            events.recv().await.unwrap(),
        ];
        let tags: Vec<&str> = drained.iter().map(|e| e.event).collect();
        let data: Vec<&str> = drained.iter().map(|e| e.data.as_str()).collect();
        assert_eq!(tags, ["offer", "candidate", "answer"]);
        assert_eq!(data, ["1", "2", "3"]);

        cancel.cancel();
        connection.close().await.unwrap();
    }

    #[tokio::test]
    async fn end_of_candidates_is_dropped() {
        let connection = new_connection().await;
        let coordinator = NegotiationCoordinator::new(Arc::downgrade(&connection));
        let cancel = CancellationToken::new();
        let mut events = capture_events(&coordinator, &cancel);

        coordinator.send_ice_candidate(None).await.unwrap();
        tokio::task::yield_now().await;
        assert!(events.try_recv().is_err());

        cancel.cancel();
        connection.close().await.unwrap();
    }

    #[tokio::test]
    async fn dropped_connection_is_an_error() {
        let connection = new_connection().await;
        let coordinator = NegotiationCoordinator::new(Arc::downgrade(&connection));
        connection.close().await.unwrap();
        drop(connection);

        match coordinator.send_offer().await {
            Err(SignalingError::ConnectionGone) => {}
            other => panic!("expected ConnectionGone, got {:?}", other.err()),
        }
    }
}
