//! Stable C-linkage control façade (`spec.md` §4.F, §6 "Control ABI").
//! Process-wide singleton guarded by a `std::sync::Mutex`; every function
//! here is synchronous so any host language can call it directly.

use std::ffi::{c_char, c_int, CStr};
use std::sync::{Arc, Mutex};

use tokio::runtime::Runtime;
use tokio::sync::Mutex as AsyncMutex;
use tracing::error;

use crate::config::{self, MqttConfig};
use crate::error::{AppError, ErrorKind, Result};
use crate::logging;
use crate::producer::VideoProducer;
use crate::registry::{self, PeerRegistry};
use crate::signaling::SignalingBridge;

struct Core {
    runtime: Runtime,
    producer: Arc<VideoProducer>,
    registry: Arc<PeerRegistry>,
    signaling: AsyncMutex<Option<SignalingBridge>>,
}

static STATE: Mutex<Option<Core>> = Mutex::new(None);

async fn bring_up() -> Result<(Arc<PeerRegistry>, Arc<VideoProducer>, SignalingBridge)> {
    let track = registry::build_shared_track();
    let default_spec = config::lookup_camera(config::DEFAULT_CAMERA_INDEX)
        .expect("DEFAULT_CAMERA_INDEX must resolve in the camera table");

    let producer = Arc::new(VideoProducer::new(track.clone(), default_spec));
    let peer_registry = Arc::new(PeerRegistry::new(track, producer.clone())?);

    let switch_producer = producer.clone();
    let switch_camera: Arc<dyn Fn(i32) + Send + Sync> = Arc::new(move |n: i32| {
        let producer = switch_producer.clone();
        tokio::spawn(async move {
            match config::lookup_camera(n) {
                Some(spec) => {
                    if let Err(e) = producer.switch_source(spec).await {
                        error!(camera = n, error = %e, "camera switch failed");
                    }
                }
                None => {
                    let err = AppError::from(ErrorKind::UnknownCamera(n));
                    tracing::warn!(camera = n, error = %err, "camera switch requested for unknown index");
                }
            }
        });
    });

    let bridge = SignalingBridge::connect(MqttConfig::from_env(), peer_registry.clone(), switch_camera).await?;
    Ok((peer_registry, producer, bridge))
}

fn init_failure_code(err: &AppError) -> c_int {
    match err.kind() {
        ErrorKind::AlreadyInitialized => 1,
        ErrorKind::WebRTCError(_) => -1,
        ErrorKind::MqttClientError(_) | ErrorKind::MqttConnectionError(_) => -2,
        _ => -1,
    }
}

/// `int Init(void)` — 0 success, 1 already running, -1 WebRTC init
/// failed, -2 MQTT connect failed.
#[no_mangle]
pub extern "C" fn Init() -> c_int {
    let _ = logging::log_sink();
    let mut guard = STATE.lock().expect("ffi state lock poisoned");
    if guard.is_some() {
        return init_failure_code(&AppError::from(ErrorKind::AlreadyInitialized));
    }

    let runtime = match Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to start tokio runtime");
            return -1;
        }
    };

    match runtime.block_on(bring_up()) {
        Ok((registry, producer, signaling)) => {
            *guard = Some(Core {
                runtime,
                producer,
                registry,
                signaling: AsyncMutex::new(Some(signaling)),
            });
            0
        }
        Err(e) => {
            error!(error = %e, "Init failed");
            init_failure_code(&e)
        }
    }
}

fn switch_camera_failure_code(err: &AppError) -> c_int {
    match err.kind() {
        ErrorKind::NotInitialized => -1,
        _ => -2,
    }
}

/// `int SwitchCamera(int n)` — 0 success, -1 not initialized, -2 invalid
/// index or load failure.
#[no_mangle]
pub extern "C" fn SwitchCamera(n: c_int) -> c_int {
    let guard = STATE.lock().expect("ffi state lock poisoned");
    let Some(core) = guard.as_ref() else {
        return switch_camera_failure_code(&AppError::from(ErrorKind::NotInitialized));
    };
    let Some(spec) = config::lookup_camera(n) else {
        return switch_camera_failure_code(&AppError::from(ErrorKind::UnknownCamera(n)));
    };
    match core.runtime.block_on(core.producer.switch_source(spec)) {
        Ok(()) => 0,
        Err(e) => {
            error!(camera = n, error = %e, "SwitchCamera failed");
            switch_camera_failure_code(&e)
        }
    }
}

/// `int Stop(void)` — always 0. Publishes disconnect-tractor, drains,
/// disconnects MQTT, closes all sessions, stops the producer, and
/// releases global state.
#[no_mangle]
pub extern "C" fn Stop() -> c_int {
    let mut guard = STATE.lock().expect("ffi state lock poisoned");
    if let Some(core) = guard.take() {
        core.runtime.block_on(async {
            if let Some(bridge) = core.signaling.lock().await.take() {
                bridge.shutdown().await;
            }
            core.registry.shutdown().await;
        });
    }
    0
}

/// `int GetStatus(void)` — 1 if the façade is initialized and running, 0
/// otherwise (`spec.md` §7 "ongoing status is observable only via
/// GetStatus and the log").
#[no_mangle]
pub extern "C" fn GetStatus() -> c_int {
    STATE.lock().expect("ffi state lock poisoned").is_some() as c_int
}

/// `int SetLogFile(const char* path)` — 0 success, -1 open failed.
///
/// # Safety
/// `path`, if non-null, must point to a valid NUL-terminated C string for
/// the duration of this call.
#[no_mangle]
pub unsafe extern "C" fn SetLogFile(path: *const c_char) -> c_int {
    if path.is_null() {
        return -1;
    }
    let c_str = unsafe { CStr::from_ptr(path) };
    let Ok(path) = c_str.to_str() else { return -1 };
    match logging::log_sink().redirect_to_file(path) {
        Ok(()) => 0,
        Err(e) => {
            error!(path, error = %e, "SetLogFile failed");
            -1
        }
    }
}
