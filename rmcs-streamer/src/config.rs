//! Camera index table and MQTT connection parameters. See `spec.md` §6.

use std::time::Duration;

/// Parameters for one entry of the camera index table (`spec.md` §3
/// "Video source selection", §6 "Camera index mapping"). Index 1 is the
/// default source loaded at `init()`.
#[derive(Debug, Clone)]
pub enum SourceSpec {
    /// Pre-encoded `*.h264` file sequence in this directory.
    FileSequence { dir: String },
    /// Camera encoder subprocess: program + args producing Annex-B H.264
    /// on stdout.
    Subprocess { program: String, args: Vec<String> },
    /// Raw-image subscription topic, re-encoded via a subprocess once the
    /// first frame's dimensions are known.
    Subscription { topic: String, encoder_program: String },
}

/// Up to 8 camera index table entries (`spec.md` §3, §6).
pub fn camera_table() -> Vec<(i32, SourceSpec)> {
    vec![
        (
            1,
            SourceSpec::FileSequence {
                dir: "/var/lib/rmcs/streams/cam1".to_string(),
            },
        ),
        (
            2,
            SourceSpec::FileSequence {
                dir: "/var/lib/rmcs/streams/cam2".to_string(),
            },
        ),
        (
            3,
            SourceSpec::Subprocess {
                program: "rmcs-h264-encoder".to_string(),
                args: vec!["--device".to_string(), "/dev/video0".to_string()],
            },
        ),
        (
            4,
            SourceSpec::Subprocess {
                program: "rmcs-h264-encoder".to_string(),
                args: vec!["--device".to_string(), "/dev/video1".to_string()],
            },
        ),
        (
            5,
            SourceSpec::Subscription {
                topic: "rmcs/raw-image/front".to_string(),
                encoder_program: "rmcs-raw-encoder".to_string(),
            },
        ),
        (
            6,
            SourceSpec::Subscription {
                topic: "rmcs/raw-image/rear".to_string(),
                encoder_program: "rmcs-raw-encoder".to_string(),
            },
        ),
        (
            7,
            SourceSpec::FileSequence {
                dir: "/var/lib/rmcs/streams/cam7".to_string(),
            },
        ),
        (
            8,
            SourceSpec::FileSequence {
                dir: "/var/lib/rmcs/streams/cam8".to_string(),
            },
        ),
    ]
}

pub fn lookup_camera(index: i32) -> Option<SourceSpec> {
    camera_table()
        .into_iter()
        .find(|(i, _)| *i == index)
        .map(|(_, spec)| spec)
}

pub const DEFAULT_CAMERA_INDEX: i32 = 1;

/// MQTT broker connection parameters, read from the process environment.
/// Broker address/credentials are configuration glue (`spec.md` §1
/// "Out of scope"); this struct only has to get them into typed fields.
#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub thing_name: String,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
}

impl MqttConfig {
    pub fn from_env() -> Self {
        Self {
            thing_name: std::env::var("RMCS_THING_NAME").unwrap_or_else(|_| "rmcs-robot".to_string()),
            host: std::env::var("RMCS_MQTT_HOST").unwrap_or_else(|_| "localhost".to_string()),
            port: std::env::var("RMCS_MQTT_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(1883),
            username: std::env::var("RMCS_MQTT_USERNAME").ok(),
            password: std::env::var("RMCS_MQTT_PASSWORD").ok(),
            keep_alive: Duration::from_secs(60),
        }
    }

    pub fn base_topic(&self) -> String {
        format!("{}/robot-control", self.thing_name)
    }

    pub fn camera_topic(&self) -> String {
        format!("{}/camera", self.thing_name)
    }
}

/// Target pacing rate (`spec.md` §3 "Frame pacing clock").
pub const TARGET_FPS: u32 = 30;

pub fn tick_period() -> Duration {
    Duration::from_secs_f64(1.0 / TARGET_FPS as f64)
}
