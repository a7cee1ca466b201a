//! Video producer: pacing, parameter-set cache and SEI stamping over a
//! shared track. `spec.md` §3 "Parameter-set cache", §4.C.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::{Mutex, RwLock};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use webrtc::media::Sample;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::config::{self, SourceSpec};
use crate::error::Result;
use crate::h264::{build_sei, to_annex_b, NalType, NalUnit};
use crate::source::{build_adapter, SourceAdapter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerState {
    Idle,
    Arming,
    Running,
}

#[derive(Default)]
struct ParameterSetCache {
    sps: Option<NalUnit>,
    pps: Option<NalUnit>,
    idr: Option<NalUnit>,
}

impl ParameterSetCache {
    fn is_armed(&self) -> bool {
        self.sps.is_some() && self.pps.is_some()
    }
}

/// A running source's pacing loop. Swapping the adapter means starting a
/// fresh one, fully opened, and only then cancelling this one — never
/// mutating a loop that is still ticking (`spec.md` §4.C "Source
/// switching", §5 "adapter-swap lock").
struct RunningSource {
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

/// Owns the parameter-set cache, pacing clock, and SEI stamping for the
/// one shared video track (`spec.md` §4.C). `start`/`stop` are driven by
/// the peer registry's aggregate-connectivity signal; `switch_source` is
/// driven by the control façade / camera MQTT topic.
pub struct VideoProducer {
    track: Arc<TrackLocalStaticSample>,
    state: Arc<RwLock<ProducerState>>,
    current: Mutex<Option<RunningSource>>,
    selected: Mutex<SourceSpec>,
}

impl VideoProducer {
    pub fn new(track: Arc<TrackLocalStaticSample>, default_source: SourceSpec) -> Self {
        Self {
            track,
            state: Arc::new(RwLock::new(ProducerState::Idle)),
            current: Mutex::new(None),
            selected: Mutex::new(default_source),
        }
    }

    pub async fn state(&self) -> ProducerState {
        *self.state.read().await
    }

    /// Idle → Arming (→ Running once SPS/PPS are seen) on the currently
    /// selected source. Idempotent: called on every transition to
    /// Connected, but a second call while already armed/running is a
    /// no-op (`spec.md` §8, §4.D "on first transition to Connected").
    pub async fn notify_peer_connected(&self) {
        if self.current.lock().await.is_some() {
            return;
        }
        let spec = self.selected.lock().await.clone();
        *self.state.write().await = ProducerState::Arming;
        match open_adapter(&spec).await {
            Ok(adapter) => *self.current.lock().await = Some(self.start_running_source(adapter)),
            Err(e) => {
                error!(error = %e, "source adapter failed to open");
                *self.state.write().await = ProducerState::Idle;
            }
        }
    }

    /// Running/Arming → Idle. Idempotent.
    pub async fn stop(&self) {
        self.teardown_current().await;
        *self.state.write().await = ProducerState::Idle;
    }

    /// Atomically swaps the active source (`spec.md` §3 "switching is
    /// atomic: the new source must be ready before the old is closed").
    /// The replacement adapter is built and fully opened (through first
    /// SPS/PPS where the adapter requires it) *before* the prior one is
    /// cancelled, so a camera switch never forces the track through an
    /// Idle gap. If the new adapter fails to open, the prior source keeps
    /// running untouched and the failure is returned to the caller. If
    /// the producer was not running (no peer Connected yet), only the
    /// selection is updated; the next `notify_peer_connected` picks it up.
    pub async fn switch_source(&self, spec: SourceSpec) -> Result<()> {
        *self.selected.lock().await = spec.clone();
        if self.current.lock().await.is_none() {
            return Ok(());
        }

        let adapter = open_adapter(&spec).await?;
        let running = self.start_running_source(adapter);
        let old = self.current.lock().await.replace(running);
        if let Some(old) = old {
            old.cancel.cancel();
            let _ = old.task.await;
        }
        Ok(())
    }

    async fn teardown_current(&self) {
        if let Some(running) = self.current.lock().await.take() {
            running.cancel.cancel();
            let _ = running.task.await;
        }
    }

    fn start_running_source(&self, adapter: Box<dyn SourceAdapter>) -> RunningSource {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_pacing_loop(adapter, self.track.clone(), self.state.clone(), cancel.clone()));
        RunningSource { cancel, task }
    }
}

/// Builds and fully opens the adapter for `spec`, the "new source must be
/// ready" half of an atomic switch.
async fn open_adapter(spec: &SourceSpec) -> Result<Box<dyn SourceAdapter>> {
    let mut adapter = build_adapter(spec);
    adapter.open().await?;
    Ok(adapter)
}

async fn run_pacing_loop(
    mut adapter: Box<dyn SourceAdapter>,
    track: Arc<TrackLocalStaticSample>,
    state: Arc<RwLock<ProducerState>>,
    cancel: CancellationToken,
) {
    let mut cache = ParameterSetCache::default();
    let mut ticker = tokio::time::interval(config::tick_period());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let start = Instant::now();
    let mut ticks: u32 = 0;

    'outer: loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        ticks += 1;
        let expected_elapsed = config::tick_period() * ticks;
        let wall_elapsed = start.elapsed();
        let drift = wall_elapsed.as_secs_f64() - expected_elapsed.as_secs_f64();
        debug!(drift_secs = drift, "pacing tick");

        let batch = match adapter.next_batch(8).await {
            Ok(batch) => batch,
            Err(e) => {
                error!(error = %e, "source adapter read failed, producer going Idle");
                *state.write().await = ProducerState::Idle;
                break 'outer;
            }
        };

        for nal in batch {
            emit_nal(&track, &state, &mut cache, nal).await;
        }
    }

    adapter.close().await;
}

/// One track write the producer decides to make: either a config NAL
/// (SPS/PPS/SEI/AUD/...) passed through untouched, or a slice that must
/// carry a fresh SEI timestamp ahead of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Emission {
    Config(NalUnit),
    Stamped(NalUnit),
}

/// Pure decision logic for `spec.md` §4.C "In Running, for each NAL
/// body": SPS/PPS update the cache and pass through unstamped; an IDR
/// re-emits the cached SPS/PPS ahead of a stamped sample (dropped
/// entirely if the cache is not yet armed); a non-IDR slice is stamped
/// once armed, dropped before that; anything else passes through
/// unstamped. Separated from I/O so `spec.md` §8's invariants — no
/// non-config slice before SPS/PPS, IDR preceded by SPS then PPS — are
/// directly unit-testable.
fn plan_emission(cache: &mut ParameterSetCache, nal: NalUnit) -> Vec<Emission> {
    match NalType::from_body(&nal) {
        Some(NalType::Sps) => {
            cache.sps = Some(nal.clone());
            vec![Emission::Config(nal)]
        }
        Some(NalType::Pps) => {
            cache.pps = Some(nal.clone());
            vec![Emission::Config(nal)]
        }
        Some(NalType::IdrSlice) => {
            if !cache.is_armed() {
                return Vec::new();
            }
            cache.idr = Some(nal.clone());
            let sps = cache.sps.clone().expect("is_armed implies sps is set");
            let pps = cache.pps.clone().expect("is_armed implies pps is set");
            vec![Emission::Config(sps), Emission::Config(pps), Emission::Stamped(nal)]
        }
        Some(NalType::NonIdrSlice) => {
            if !cache.is_armed() {
                return Vec::new();
            }
            vec![Emission::Stamped(nal)]
        }
        _ => vec![Emission::Config(nal)],
    }
}

/// Drives [`plan_emission`] for one NAL and performs the resulting track
/// writes, flipping Arming → Running the first time a PPS completes the
/// parameter-set pair.
async fn emit_nal(
    track: &Arc<TrackLocalStaticSample>,
    state: &Arc<RwLock<ProducerState>>,
    cache: &mut ParameterSetCache,
    nal: NalUnit,
) {
    let duration = config::tick_period();
    let was_armed = cache.is_armed();
    let nal_type = NalType::from_body(&nal);

    for emission in plan_emission(cache, nal) {
        match emission {
            Emission::Config(nal) => write_sample(track, &nal, duration).await,
            Emission::Stamped(nal) => write_stamped_sample(track, &nal, duration).await,
        }
    }

    if !was_armed && cache.is_armed() && matches!(nal_type, Some(NalType::Pps)) {
        *state.write().await = ProducerState::Running;
    }
}

async fn write_sample(track: &Arc<TrackLocalStaticSample>, nal: &NalUnit, duration: Duration) {
    let data = to_annex_b(std::slice::from_ref(nal));
    if let Err(e) = track.write_sample(&Sample { data: data.into(), duration, ..Default::default() }).await {
        warn!(error = %e, "sample write failed");
    }
}

async fn write_stamped_sample(track: &Arc<TrackLocalStaticSample>, slice: &NalUnit, duration: Duration) {
    let micros = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64;
    let sei = build_sei(micros);
    let data = to_annex_b(&[sei, slice.clone()]);
    if let Err(e) = track.write_sample(&Sample { data: data.into(), duration, ..Default::default() }).await {
        warn!(error = %e, "sample write failed");
    }
}
