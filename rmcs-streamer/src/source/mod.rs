//! Source adapters: lazy, restartable producers of H.264 NAL bodies.
//! See `spec.md` §4.B and §9 "Adapter polymorphism" — a narrow
//! `{open, pull, close}` capability set, not a deep trait hierarchy.

mod codec;
mod file_sequence;
mod subprocess;
mod subscription;

use async_trait::async_trait;

use crate::config::SourceSpec;
use crate::error::Result;
use crate::h264::NalUnit;

pub use file_sequence::FileSequenceAdapter;
pub use subprocess::SubprocessAdapter;
pub use subscription::{RawImageFrame, SubscriptionAdapter};

/// One "tick's worth" of NAL units pulled from a source. File-sequence
/// sources return exactly one pre-loaded file per call; subprocess and
/// subscription sources return whatever has accumulated since the last
/// call, bounded by `max_per_tick` so the output timebase stays
/// monotonic (`spec.md` §4.C "Pacing").
#[async_trait]
pub trait SourceAdapter: Send {
    /// Fully acquires the source, including reading far enough to have
    /// seen the first SPS/PPS where applicable (`spec.md` §4.C "Source
    /// switching").
    async fn open(&mut self) -> Result<()>;

    /// Returns the next batch of NAL bodies, capped at `max_per_tick`.
    /// An empty batch is not an error — it means nothing new arrived
    /// this tick.
    async fn next_batch(&mut self, max_per_tick: usize) -> Result<Vec<NalUnit>>;

    /// Closes the adapter (kills and waits for any child process; no
    /// zombies, `spec.md` §5).
    async fn close(&mut self);
}

/// Constructs the adapter for a camera index table entry.
pub fn build_adapter(spec: &SourceSpec) -> Box<dyn SourceAdapter> {
    match spec {
        SourceSpec::FileSequence { dir } => Box::new(FileSequenceAdapter::new(dir.clone())),
        SourceSpec::Subprocess { program, args } => {
            Box::new(SubprocessAdapter::new(program.clone(), args.clone()))
        }
        SourceSpec::Subscription { topic, encoder_program } => {
            Box::new(SubscriptionAdapter::new(topic.clone(), encoder_program.clone()))
        }
    }
}
