//! Peer registry: owns per-peer WebRTC sessions, enforces their
//! lifecycle, and starts/stops the producer based on aggregate
//! connectivity (`spec.md` §4.D).

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::error::{AppError, ErrorKind, Result};
use crate::producer::VideoProducer;

const STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Invoked with (peerId, one-element JSON candidate array) whenever the
/// local side gathers a new ICE candidate (`spec.md` §4.D "local-ICE
/// callback", §4.E).
pub type IcePublisher = Arc<dyn Fn(String, String) + Send + Sync>;

fn build_api() -> Result<API> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

pub fn build_shared_track() -> Arc<TrackLocalStaticSample> {
    Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_H264.to_owned(),
            clock_rate: 90000,
            sdp_fmtp_line: "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42001f".to_owned(),
            ..Default::default()
        },
        "video".to_owned(),
        "rmcs-streamer".to_owned(),
    ))
}

/// Where a locally-gathered ICE candidate goes before the signaling
/// bridge is ready to publish it. `webrtc` starts gathering as soon as
/// `set_local_description` is called, which can surface host candidates
/// within milliseconds — well before `arm_ice_publisher` runs (it only
/// runs once the SDP answer has round-tripped over MQTT), so candidates
/// are buffered rather than dropped (`spec.md` §4.D "local-ICE callback").
enum IceSink {
    Buffering(Vec<RTCIceCandidateInit>),
    Live(IcePublisher),
}

struct PeerSession {
    pc: Arc<RTCPeerConnection>,
    ice_sink: Arc<Mutex<IceSink>>,
}

pub struct PeerRegistry {
    api: API,
    sessions: Arc<Mutex<HashMap<String, PeerSession>>>,
    track: Arc<TrackLocalStaticSample>,
    producer: Arc<VideoProducer>,
}

impl PeerRegistry {
    pub fn new(track: Arc<TrackLocalStaticSample>, producer: Arc<VideoProducer>) -> Result<Self> {
        Ok(Self {
            api: build_api()?,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            track,
            producer,
        })
    }

    /// `spec.md` §4.D `accept_offer`: closes any prior session for this
    /// peer, creates a fresh peer connection with the shared track
    /// attached, applies the offer, and returns the answer SDP. The local
    /// ICE-candidate handler is installed here (before
    /// `set_local_description`, which is what actually starts gathering)
    /// so no candidate is ever dropped; it only buffers until
    /// [`PeerRegistry::arm_ice_publisher`] switches it live once the
    /// answer has actually been published (`spec.md` §9 REDESIGN:
    /// publisher after answer).
    pub async fn accept_offer(&self, peer_id: &str, offer_sdp: String) -> Result<String> {
        self.close_session(peer_id).await;

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: vec![STUN_SERVER.to_owned()],
                ..Default::default()
            }],
            ..Default::default()
        };
        let pc = Arc::new(self.api.new_peer_connection(config).await?);

        let rtp_sender = pc
            .add_track(self.track.clone() as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while rtp_sender.read(&mut rtcp_buf).await.is_ok() {}
        });

        let ice_sink: Arc<Mutex<IceSink>> = Arc::new(Mutex::new(IceSink::Buffering(Vec::new())));
        let ice_sink_for_candidate = ice_sink.clone();
        let peer_id_for_candidate = peer_id.to_string();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let ice_sink = ice_sink_for_candidate.clone();
            let peer_id = peer_id_for_candidate.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                let init = match candidate.to_json() {
                    Ok(init) => init,
                    Err(e) => {
                        warn!(peer = %peer_id, error = %e, "failed to convert ICE candidate to JSON");
                        return;
                    }
                };
                match &mut *ice_sink.lock().await {
                    IceSink::Buffering(pending) => pending.push(init),
                    IceSink::Live(publisher) => publish_candidate(publisher, &peer_id, init),
                }
            })
        }));

        let sessions = self.sessions.clone();
        let producer = self.producer.clone();
        let peer_id_owned = peer_id.to_string();
        let pc_for_closure = pc.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let sessions = sessions.clone();
            let producer = producer.clone();
            let peer_id = peer_id_owned.clone();
            let pc = pc_for_closure.clone();
            Box::pin(async move {
                info!(peer = %peer_id, ?state, "peer connection state changed");
                match state {
                    RTCPeerConnectionState::Connected => {
                        producer.notify_peer_connected().await;
                    }
                    RTCPeerConnectionState::Disconnected
                    | RTCPeerConnectionState::Failed
                    | RTCPeerConnectionState::Closed => {
                        // Only remove the entry if it still points at this
                        // connection — a repeat offer may already have
                        // replaced it with a newer session under the same
                        // peer_id (`spec.md` §3 "replaced ... if a new
                        // offer arrives for the same key").
                        let removed = {
                            let mut map = sessions.lock().await;
                            match map.get(&peer_id) {
                                Some(session) if Arc::ptr_eq(&session.pc, &pc) => map.remove(&peer_id),
                                _ => None,
                            }
                        };
                        if let Some(session) = removed {
                            if let Err(e) = session.pc.close().await {
                                warn!(peer = %peer_id, error = %e, "error closing peer connection after terminal state");
                            }
                        }
                        let any_connected = sessions
                            .lock()
                            .await
                            .values()
                            .any(|s| s.pc.connection_state() == RTCPeerConnectionState::Connected);
                        if !any_connected {
                            producer.stop().await;
                        }
                    }
                    _ => {}
                }
            })
        }));

        let offer = RTCSessionDescription::offer(offer_sdp)?;
        pc.set_remote_description(offer).await?;
        let answer = pc.create_answer(None).await?;
        pc.set_local_description(answer.clone()).await?;

        self.sessions
            .lock()
            .await
            .insert(peer_id.to_string(), PeerSession { pc, ice_sink });

        Ok(answer.sdp)
    }

    /// Installs the local-ICE publisher for `peer_id` and flushes whatever
    /// candidates were gathered and buffered since `accept_offer` in
    /// publish order. Called only after the signaling bridge has
    /// published the answer (`spec.md` §9).
    pub async fn arm_ice_publisher(&self, peer_id: &str, publisher: IcePublisher) {
        let ice_sink = {
            let sessions = self.sessions.lock().await;
            let Some(session) = sessions.get(peer_id) else {
                warn!(peer = %peer_id, "arm_ice_publisher called for unknown peer");
                return;
            };
            session.ice_sink.clone()
        };

        let buffered = {
            let mut sink = ice_sink.lock().await;
            std::mem::replace(&mut *sink, IceSink::Live(publisher.clone()))
        };
        if let IceSink::Buffering(pending) = buffered {
            for init in pending {
                publish_candidate(&publisher, peer_id, init);
            }
        }
    }

    /// `spec.md` §4.D `add_remote_ice`: no-op with a warning if the peer
    /// is unknown (candidates arriving before `accept_offer` are the
    /// peer's own ordering responsibility).
    pub async fn add_remote_ice(&self, peer_id: &str, candidate: RTCIceCandidateInit) {
        let sessions = self.sessions.lock().await;
        match sessions.get(peer_id) {
            Some(session) => {
                if let Err(e) = session.pc.add_ice_candidate(candidate).await {
                    warn!(peer = %peer_id, error = %e, "failed to add remote ICE candidate");
                }
            }
            None => {
                let err = AppError::from(ErrorKind::UnknownPeer(peer_id.to_string()));
                warn!(peer = %peer_id, error = %err, "dropping remote ICE candidate");
            }
        }
    }

    /// `spec.md` §4.D `disconnect`: close and remove, idempotent; if no
    /// session remains Connected afterward, request producer stop.
    pub async fn disconnect(&self, peer_id: &str) {
        self.close_session(peer_id).await;
        let any_connected = self
            .sessions
            .lock()
            .await
            .values()
            .any(|s| s.pc.connection_state() == RTCPeerConnectionState::Connected);
        if !any_connected {
            self.producer.stop().await;
        }
    }

    /// `spec.md` §4.D `shutdown`: close all sessions, clear the map,
    /// request producer stop.
    pub async fn shutdown(&self) {
        let sessions = {
            let mut map = self.sessions.lock().await;
            std::mem::take(&mut *map)
        };
        for (peer_id, session) in sessions {
            if let Err(e) = session.pc.close().await {
                warn!(peer = %peer_id, error = %e, "error closing peer connection on shutdown");
            }
        }
        self.producer.stop().await;
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    async fn close_session(&self, peer_id: &str) {
        let removed = self.sessions.lock().await.remove(peer_id);
        if let Some(session) = removed {
            if let Err(e) = session.pc.close().await {
                warn!(peer = %peer_id, error = %e, "error closing prior peer connection");
            }
        }
    }
}

/// Wraps one candidate in the single-element JSON array the wire format
/// expects (`spec.md` §6) and hands it to the publisher.
fn publish_candidate(publisher: &IcePublisher, peer_id: &str, candidate: RTCIceCandidateInit) {
    match serde_json::to_string(&[candidate]) {
        Ok(json) => publisher(peer_id.to_string(), json),
        Err(e) => warn!(peer = %peer_id, error = %e, "failed to serialize ICE candidate"),
    }
}
