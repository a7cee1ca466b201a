use std::collections::VecDeque;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_util::codec::FramedRead;
use tracing::{info, warn};

use super::codec::AnnexBDecoder;
use super::SourceAdapter;
use crate::error::{AppError, ErrorKind, Result};
use crate::h264::{NalType, NalUnit};

/// A single raw-image message: dimensions plus BGR24 pixel data. The
/// transport that delivers these (a ROS-style topic, a custom bus — the
/// concrete middleware is "configuration or glue" per `spec.md` §1) is
/// out of scope here; this adapter only needs the typed boundary.
#[derive(Debug, Clone)]
pub struct RawImageFrame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

/// Raw-image subscription source (`spec.md` §4.B). The first valid frame
/// determines dimensions and spawns a matching encoder subprocess;
/// subsequent frames of the same dimensions are piped to its stdin. A
/// dimension change restarts the encoder with the new size.
pub struct SubscriptionAdapter {
    topic: String,
    encoder_program: String,
    frame_tx: mpsc::Sender<RawImageFrame>,
    frame_rx: mpsc::Receiver<RawImageFrame>,
    dims: Option<(u32, u32)>,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    nal_rx: Option<mpsc::Receiver<std::io::Result<NalUnit>>>,
    pending: VecDeque<NalUnit>,
}

impl SubscriptionAdapter {
    pub fn new(topic: String, encoder_program: String) -> Self {
        let (frame_tx, frame_rx) = mpsc::channel(32);
        Self {
            topic,
            encoder_program,
            frame_tx,
            frame_rx,
            dims: None,
            child: None,
            stdin: None,
            nal_rx: None,
            pending: VecDeque::new(),
        }
    }

    /// A sender clone so whatever bridges the real image subscription in
    /// can feed frames into this adapter.
    pub fn frame_sender(&self) -> mpsc::Sender<RawImageFrame> {
        self.frame_tx.clone()
    }

    fn frame_is_valid(frame: &RawImageFrame) -> bool {
        frame.data.len() == frame.width as usize * frame.height as usize * 3
    }

    async fn spawn_encoder(&mut self, width: u32, height: u32) -> Result<()> {
        if let Some(mut child) = self.child.take() {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }

        let mut child = Command::new(&self.encoder_program)
            .args(["--width", &width.to_string(), "--height", &height.to_string()])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AppError::from(ErrorKind::AdapterOpenFailed(e.to_string())))?;

        let stdin = child.stdin.take().expect("stdin was piped");
        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");

        let program = self.encoder_program.clone();
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

        info!(topic = %self.topic, width, height, "spawned raw-image encoder");
        self.child = Some(child);
        self.stdin = Some(stdin);
        self.nal_rx = Some(rx);
        self.dims = Some((width, height));
        self.pending.clear();
        Ok(())
    }

    /// Routes one validated frame to the currently-running encoder,
    /// restarting it first if dimensions changed.
    async fn feed_frame(&mut self, frame: RawImageFrame) -> Result<()> {
        if !Self::frame_is_valid(&frame) {
            warn!(
                topic = %self.topic,
                expected = frame.width as usize * frame.height as usize * 3,
                got = frame.data.len(),
                "dropping raw-image frame: size does not match width*height*3"
            );
            return Ok(());
        }
        if self.dims != Some((frame.width, frame.height)) {
            self.spawn_encoder(frame.width, frame.height).await?;
        }
        let stdin = self.stdin.as_mut().expect("encoder stdin missing after spawn");
        stdin
            .write_all(&frame.data)
            .await
            .map_err(|e| AppError::from(ErrorKind::IoError(e)))
    }

    async fn wait_for_parameter_sets(&mut self) -> Result<()> {
        let rx = self.nal_rx.as_mut().expect("spawn_encoder must set up nal_rx");
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
                    return Err(AppError::from(ErrorKind::AdapterOpenFailed(
                        "raw-image encoder exited before producing SPS/PPS".to_string(),
                    )));
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SourceAdapter for SubscriptionAdapter {
    async fn open(&mut self) -> Result<()> {
        loop {
            let frame = self.frame_rx.recv().await.ok_or_else(|| {
                AppError::from(ErrorKind::AdapterOpenFailed(format!(
                    "subscription '{}' closed before first frame",
                    self.topic
                )))
            })?;
            if !Self::frame_is_valid(&frame) {
                warn!(topic = %self.topic, "dropping first raw-image frame: size mismatch");
                continue;
            }
            self.spawn_encoder(frame.width, frame.height).await?;
            let stdin = self.stdin.as_mut().expect("encoder stdin missing after spawn");
            stdin
                .write_all(&frame.data)
                .await
                .map_err(|e| AppError::from(ErrorKind::IoError(e)))?;
            break;
        }
        self.wait_for_parameter_sets().await
    }

    async fn next_batch(&mut self, max_per_tick: usize) -> Result<Vec<NalUnit>> {
        while let Ok(frame) = self.frame_rx.try_recv() {
            self.feed_frame(frame).await?;
        }

        let mut out = Vec::new();
        while out.len() < max_per_tick {
            if let Some(nal) = self.pending.pop_front() {
                out.push(nal);
                continue;
            }
            let Some(rx) = self.nal_rx.as_mut() else { break };
            match rx.try_recv() {
                Ok(Ok(nal)) => out.push(nal),
                Ok(Err(e)) => return Err(AppError::from(ErrorKind::IoError(e))),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    return Err(AppError::from(ErrorKind::AdapterOpenFailed(format!(
                        "raw-image encoder for '{}' exited",
                        self.topic
                    ))));
                }
            }
        }
        Ok(out)
    }

    async fn close(&mut self) {
        self.nal_rx = None;
        self.stdin = None;
        if let Some(mut child) = self.child.take() {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
        self.pending.clear();
    }
}
