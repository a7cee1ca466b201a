//! MQTT signaling bridge: maps topics to peer-registry operations and
//! forwards ICE both ways (`spec.md` §4.E, §6 "MQTT topic surface").

use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::MqttConfig;
use crate::error::{AppError, ErrorKind, Result};
use crate::registry::PeerRegistry;

#[derive(Debug, Deserialize)]
struct WireIceCandidate {
    candidate: String,
    #[serde(rename = "sdpMid")]
    sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex")]
    sdp_mline_index: Option<u16>,
}

impl From<WireIceCandidate> for webrtc::ice_transport::ice_candidate::RTCIceCandidateInit {
    fn from(c: WireIceCandidate) -> Self {
        Self {
            candidate: c.candidate,
            sdp_mid: c.sdp_mid,
            sdp_mline_index: c.sdp_mline_index,
            username_fragment: None,
        }
    }
}

/// Splits `topic` by `/` and returns the segment immediately following
/// `base`'s segments, provided the remainder matches `suffix` exactly
/// (`spec.md` §4.E "Peer-identifier extraction").
fn extract_peer_id(topic: &str, base: &str, suffix: &str) -> Option<String> {
    let rest = topic.strip_prefix(base)?.strip_prefix('/')?;
    let peer_id = rest.strip_suffix(suffix)?.strip_suffix('/')?;
    if peer_id.is_empty() || peer_id.contains('/') {
        None
    } else {
        Some(peer_id.to_string())
    }
}

pub struct SignalingBridge {
    client: AsyncClient,
    config: MqttConfig,
    poll_task: JoinHandle<()>,
    cancel: CancellationToken,
}

impl SignalingBridge {
    /// Connects to the broker, subscribes the full topic surface, and
    /// spawns the event-loop-polling task that dispatches incoming
    /// publishes to `registry`/the camera-switch callback.
    pub async fn connect(
        config: MqttConfig,
        registry: Arc<PeerRegistry>,
        switch_camera: Arc<dyn Fn(i32) + Send + Sync>,
    ) -> Result<Self> {
        let mut options = MqttOptions::new(config.thing_name.clone(), config.host.clone(), config.port);
        options.set_keep_alive(config.keep_alive);
        options.set_clean_session(true);
        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            options.set_credentials(user.clone(), pass.clone());
        }

        let (client, mut event_loop) = AsyncClient::new(options, 64);

        let base = config.base_topic();
        client.subscribe(format!("{base}/+/offer"), QoS::AtMostOnce).await?;
        client
            .subscribe(format!("{base}/+/candidate/robot"), QoS::AtMostOnce)
            .await?;
        client
            .subscribe(format!("{base}/+/disconnect-client"), QoS::AtMostOnce)
            .await?;
        client.subscribe(config.camera_topic(), QoS::AtMostOnce).await?;

        let cancel = CancellationToken::new();
        let dispatch_base = base.clone();
        let dispatch_camera_topic = config.camera_topic();
        let dispatch_client = client.clone();
        let dispatch_cancel = cancel.clone();
        let poll_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = dispatch_cancel.cancelled() => break,
                    outcome = event_loop.poll() => {
                        match outcome {
                            Ok(Event::Incoming(Packet::Publish(publish))) => {
                                dispatch(
                                    &dispatch_base,
                                    &dispatch_camera_topic,
                                    &publish.topic,
                                    &publish.payload,
                                    &registry,
                                    &dispatch_client,
                                    &switch_camera,
                                )
                                .await;
                            }
                            Ok(_) => {}
                            Err(e) => {
                                warn!(error = %e, "mqtt event loop error, reconnect is automatic");
                            }
                        }
                    }
                }
            }
        });

        Ok(Self { client, config, poll_task, cancel })
    }

    /// `spec.md` §4.F `stop()` / §4.E "on process stop": publishes the
    /// final disconnect-tractor message, gives the broker ~500 ms to
    /// flush, then disconnects and tears down the polling task.
    pub async fn shutdown(self) {
        let topic = format!("{}/disconnect-tractor", self.config.base_topic());
        if let Err(e) = self.client.publish(topic, QoS::AtMostOnce, false, "robot").await {
            warn!(error = %e, "failed to publish disconnect-tractor");
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
        let _ = self.client.disconnect().await;
        self.cancel.cancel();
        let _ = self.poll_task.await;
    }
}

async fn dispatch(
    base: &str,
    camera_topic: &str,
    topic: &str,
    payload: &[u8],
    registry: &Arc<PeerRegistry>,
    client: &AsyncClient,
    switch_camera: &Arc<dyn Fn(i32) + Send + Sync>,
) {
    if let Some(peer_id) = extract_peer_id(topic, base, "offer") {
        handle_offer(base, peer_id, payload, registry, client).await;
        return;
    }
    if let Some(peer_id) = extract_peer_id(topic, base, "candidate/robot") {
        handle_remote_ice(peer_id, payload, registry).await;
        return;
    }
    if let Some(peer_id) = extract_peer_id(topic, base, "disconnect-client") {
        info!(peer = %peer_id, "disconnect-client received");
        registry.disconnect(&peer_id).await;
        return;
    }
    if topic == camera_topic {
        handle_camera_switch(payload, switch_camera);
        return;
    }
    let err = AppError::from(ErrorKind::MalformedTopic(topic.to_string()));
    warn!(%topic, error = %err, "ignoring message on unrecognized topic");
}

async fn handle_offer(base: &str, peer_id: String, payload: &[u8], registry: &Arc<PeerRegistry>, client: &AsyncClient) {
    let sdp = match std::str::from_utf8(payload) {
        Ok(s) => s.to_string(),
        Err(_) => {
            warn!(peer = %peer_id, "offer payload is not valid UTF-8, dropping");
            return;
        }
    };

    let answer = match registry.accept_offer(&peer_id, sdp).await {
        Ok(answer) => answer,
        Err(e) => {
            warn!(peer = %peer_id, error = %e, "accept_offer failed, dropping");
            return;
        }
    };

    let answer_topic = format!("{base}/{peer_id}/answer");
    if let Err(e) = client.publish(answer_topic, QoS::AtMostOnce, false, answer).await {
        warn!(peer = %peer_id, error = %e, "failed to publish answer");
        return;
    }

    // REDESIGN: install the local-ICE publisher only now that the answer
    // has actually been published, not before (`spec.md` §9).
    let candidate_topic = format!("{base}/{peer_id}/candidate/rmcs");
    let client = client.clone();
    registry
        .arm_ice_publisher(
            &peer_id,
            Arc::new(move |_peer_id: String, candidate_json: String| {
                let client = client.clone();
                let topic = candidate_topic.clone();
                tokio::spawn(async move {
                    if let Err(e) = client.publish(topic, QoS::AtMostOnce, false, candidate_json).await {
                        warn!(error = %e, "failed to publish local ICE candidate");
                    }
                });
            }),
        )
        .await;
}

async fn handle_remote_ice(peer_id: String, payload: &[u8], registry: &Arc<PeerRegistry>) {
    let candidates: Vec<WireIceCandidate> = match serde_json::from_slice(payload) {
        Ok(c) => c,
        Err(e) => {
            warn!(peer = %peer_id, error = %e, "malformed remote ICE payload, dropping");
            return;
        }
    };
    for candidate in candidates {
        registry.add_remote_ice(&peer_id, candidate.into()).await;
    }
}

fn handle_camera_switch(payload: &[u8], switch_camera: &Arc<dyn Fn(i32) + Send + Sync>) {
    let Ok(text) = std::str::from_utf8(payload) else {
        warn!("camera switch payload is not valid UTF-8, dropping");
        return;
    };
    match text.trim().parse::<i32>() {
        Ok(n) => switch_camera(n),
        Err(e) => warn!(payload = %text, error = %e, "malformed camera index, dropping"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_peer_id_between_base_and_suffix() {
        let base = "rmcs-robot/robot-control";
        assert_eq!(
            extract_peer_id("rmcs-robot/robot-control/P1/offer", base, "offer"),
            Some("P1".to_string())
        );
        assert_eq!(
            extract_peer_id("rmcs-robot/robot-control/P1/candidate/robot", base, "candidate/robot"),
            Some("P1".to_string())
        );
        assert_eq!(extract_peer_id("rmcs-robot/robot-control/offer", base, "offer"), None);
        assert_eq!(
            extract_peer_id("rmcs-robot/robot-control/a/b/offer", base, "offer"),
            None
        );
    }

    #[test]
    fn camera_topic_is_global_not_per_peer() {
        let cfg = MqttConfig::from_env();
        assert!(cfg.camera_topic().contains('/'));
        assert!(!cfg.camera_topic().contains("robot-control"));
    }
}
