use std::collections::VecDeque;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tracing::{error, warn};

use tokio_stream::StreamExt;

use super::codec::AnnexBDecoder;
use super::SourceAdapter;
use crate::error::{AppError, ErrorKind, Result};
use crate::h264::{NalType, NalUnit};

/// Camera encoder subprocess adapter (`spec.md` §4.B). Spawns a program
/// that writes Annex-B H.264 to stdout, annotates stderr to the log
/// sink, and does not restart itself on exit or read error — the
/// producer requesting a new adapter instance is the recovery path.
pub struct SubprocessAdapter {
    program: String,
    args: Vec<String>,
    child: Option<Child>,
    rx: Option<mpsc::Receiver<std::io::Result<NalUnit>>>,
    pending: VecDeque<NalUnit>,
}

impl SubprocessAdapter {
    pub fn new(program: String, args: Vec<String>) -> Self {
        Self {
            program,
            args,
            child: None,
            rx: None,
            pending: VecDeque::new(),
        }
    }

    /// Blocks until at least one SPS and one PPS have been read (or the
    /// stream ends / errors first), buffering everything seen along the
    /// way into `pending` so `next_batch` can still deliver it in order.
    async fn wait_for_parameter_sets(&mut self) -> Result<()> {
        let rx = self.rx.as_mut().expect("open() must set up rx first");
        let mut saw_sps = false;
        let mut saw_pps = false;
        while !(saw_sps && saw_pps) {
            match rx.recv().await {
                Some(Ok(nal)) => {
                    match NalType::from_body(&nal) {
                        Some(NalType::Sps) => saw_sps = true,
                        Some(NalType::Pps) => saw_pps = true,
                        _ => {}
                    }
                    self.pending.push_back(nal);
                }
                Some(Err(e)) => return Err(AppError::from(ErrorKind::IoError(e))),
                None => {
                    return Err(AppError::from(ErrorKind::AdapterOpenFailed(format!(
                        "encoder '{}' exited before producing SPS/PPS",
                        self.program
                    ))));
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SourceAdapter for SubprocessAdapter {
    async fn open(&mut self) -> Result<()> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AppError::from(ErrorKind::AdapterOpenFailed(e.to_string())))?;

        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");

        let program = self.program.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                warn!(encoder = %program, "{line}");
            }
        });

        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            let mut framed = FramedRead::new(stdout, AnnexBDecoder::default());
            while let Some(item) = framed.next().await {
                if tx.send(item).await.is_err() {
                    break;
                }
            }
        });

        self.child = Some(child);
        self.rx = Some(rx);
        self.pending.clear();

        self.wait_for_parameter_sets().await
    }

    async fn next_batch(&mut self, max_per_tick: usize) -> Result<Vec<NalUnit>> {
        let mut out = Vec::new();
        while out.len() < max_per_tick {
            if let Some(nal) = self.pending.pop_front() {
                out.push(nal);
                continue;
            }
            let Some(rx) = self.rx.as_mut() else { break };
            match rx.try_recv() {
                Ok(Ok(nal)) => out.push(nal),
                Ok(Err(e)) => return Err(AppError::from(ErrorKind::IoError(e))),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    error!(program = %self.program, "encoder stream ended");
                    return Err(AppError::from(ErrorKind::AdapterOpenFailed(format!(
                        "encoder '{}' exited",
                        self.program
                    ))));
                }
            }
        }
        Ok(out)
    }

    async fn close(&mut self) {
        self.rx = None;
        if let Some(mut child) = self.child.take() {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter_with_channel() -> (SubprocessAdapter, mpsc::Sender<std::io::Result<NalUnit>>) {
        let mut adapter = SubprocessAdapter::new("unused".to_string(), vec![]);
        let (tx, rx) = mpsc::channel(16);
        adapter.rx = Some(rx);
        (adapter, tx)
    }

    #[tokio::test]
    async fn wait_for_parameter_sets_buffers_everything_seen_along_the_way() {
        let (mut adapter, tx) = adapter_with_channel();
        tx.send(Ok(vec![0x09, 0])).await.unwrap(); // AUD, neither sps nor pps
        tx.send(Ok(vec![0x67, 1, 2])).await.unwrap(); // sps
        tx.send(Ok(vec![0x41, 9])).await.unwrap(); // a slice arriving before pps
        tx.send(Ok(vec![0x68, 3, 4])).await.unwrap(); // pps completes arming
        drop(tx);

        adapter.wait_for_parameter_sets().await.unwrap();

        // Exactly the number of buffered NALs, so next_batch never has to
        // fall through to the now-disconnected channel.
        let batch = adapter.next_batch(4).await.unwrap();
        assert_eq!(
            batch,
            vec![vec![0x09u8, 0], vec![0x67, 1, 2], vec![0x41, 9], vec![0x68, 3, 4]],
            "everything read while waiting for sps/pps must still be delivered, in order"
        );
    }

    #[tokio::test]
    async fn wait_for_parameter_sets_errors_if_stream_ends_first() {
        let (mut adapter, tx) = adapter_with_channel();
        tx.send(Ok(vec![0x67, 1, 2])).await.unwrap(); // sps only, no pps
        drop(tx);

        assert!(adapter.wait_for_parameter_sets().await.is_err());
    }
}
