//! Runtime-redirectable `tracing` sink backing the `SetLogFile` façade
//! operation (`spec.md` §4.F / §6).

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::sync::{Arc, OnceLock, RwLock};

use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

enum Target {
    Stdout,
    File(File),
}

#[derive(Clone)]
pub struct Sink {
    target: Arc<RwLock<Target>>,
}

impl Sink {
    pub fn new() -> Self {
        Self {
            target: Arc::new(RwLock::new(Target::Stdout)),
        }
    }

    /// Redirects the sink to append to `path`, creating it if absent.
    pub fn redirect_to_file(&self, path: &str) -> io::Result<()> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        *self.target.write().expect("log sink lock poisoned") = Target::File(file);
        Ok(())
    }
}

impl Default for Sink {
    fn default() -> Self {
        Self::new()
    }
}

pub struct SinkWriter(Arc<RwLock<Target>>);

impl Write for SinkWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut *self.0.write().expect("log sink lock poisoned") {
            Target::Stdout => io::stdout().write(buf),
            Target::File(f) => f.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut *self.0.write().expect("log sink lock poisoned") {
            Target::Stdout => io::stdout().flush(),
            Target::File(f) => f.flush(),
        }
    }
}

impl<'a> MakeWriter<'a> for Sink {
    type Writer = SinkWriter;

    fn make_writer(&'a self) -> Self::Writer {
        SinkWriter(self.target.clone())
    }
}

/// Installs the global `tracing` subscriber with file/line/thread info
/// in the output, writing through the redirectable `Sink` instead of
/// stdout only.
pub fn init_tracing(sink: Sink) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(sink)
        .with_file(true)
        .with_line_number(true)
        .with_thread_ids(true)
        .try_init();
}

static LOG_SINK: OnceLock<Sink> = OnceLock::new();

/// The process-wide log sink backing `SetLogFile`. Independent of the
/// `Init`/`Stop` façade lifecycle so redirection and logging both work
/// regardless of whether the core is currently running.
pub fn log_sink() -> &'static Sink {
    LOG_SINK.get_or_init(|| {
        let sink = Sink::new();
        init_tracing(sink.clone());
        sink
    })
}
