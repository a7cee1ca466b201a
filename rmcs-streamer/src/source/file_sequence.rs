use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{info, warn};

use super::SourceAdapter;
use crate::error::{AppError, ErrorKind, Result};
use crate::h264::{split_length_prefixed, NalUnit};

/// Extracts the trailing integer suffix of a `*.h264` file stem, e.g.
/// `sample-123` -> 123. A stem with no trailing digits sorts as 0.
/// `spec.md` §6 "File naming convention".
fn numeric_suffix(file_stem: &str) -> u64 {
    let digits: String = file_stem
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.chars().rev().collect::<String>().parse().unwrap_or(0)
}

fn list_sorted_h264_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().and_then(|e| e.to_str()) == Some("h264"))
        .collect();

    files.sort_by_key(|path| {
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
        numeric_suffix(stem)
    });
    Ok(files)
}

/// Pre-encoded file-sequence source (`spec.md` §4.B). All files are
/// loaded into memory at `open()`; `next_batch` yields one file's worth
/// of NAL bodies per call and restarts at file 0 after the last one.
pub struct FileSequenceAdapter {
    dir: String,
    files: Vec<Vec<NalUnit>>,
    cursor: usize,
}

impl FileSequenceAdapter {
    pub fn new(dir: String) -> Self {
        Self {
            dir,
            files: Vec::new(),
            cursor: 0,
        }
    }
}

#[async_trait]
impl SourceAdapter for FileSequenceAdapter {
    async fn open(&mut self) -> Result<()> {
        let dir = self.dir.clone();
        let paths = tokio::task::spawn_blocking(move || list_sorted_h264_files(Path::new(&dir)))
            .await
            .map_err(|e| AppError::from(ErrorKind::AdapterOpenFailed(e.to_string())))??;

        if paths.is_empty() {
            return Err(AppError::from(ErrorKind::AdapterOpenFailed(format!(
                "no *.h264 files found in {}",
                self.dir
            ))));
        }

        let mut files = Vec::with_capacity(paths.len());
        for path in &paths {
            let bytes = fs::read(path)?;
            files.push(split_length_prefixed(&bytes));
        }

        info!(dir = %self.dir, count = files.len(), "pre-loaded file-sequence source");
        self.files = files;
        self.cursor = 0;
        Ok(())
    }

    async fn next_batch(&mut self, _max_per_tick: usize) -> Result<Vec<NalUnit>> {
        if self.files.is_empty() {
            warn!(dir = %self.dir, "next_batch called before open");
            return Ok(Vec::new());
        }
        let batch = self.files[self.cursor].clone();
        self.cursor = (self.cursor + 1) % self.files.len();
        Ok(batch)
    }

    async fn close(&mut self) {
        self.files.clear();
        self.cursor = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_length_prefixed_file(path: &Path, nals: &[&[u8]]) {
        let mut file = fs::File::create(path).unwrap();
        for nal in nals {
            file.write_all(&(nal.len() as u32).to_be_bytes()).unwrap();
            file.write_all(nal).unwrap();
        }
    }

    #[test]
    fn numeric_suffix_parses_trailing_digits() {
        assert_eq!(numeric_suffix("sample-123"), 123);
        assert_eq!(numeric_suffix("sample"), 0);
        assert_eq!(numeric_suffix("0007"), 7);
    }

    #[tokio::test]
    async fn emits_files_in_numeric_order_and_restarts() {
        let dir = tempfile::tempdir().unwrap();
        write_length_prefixed_file(&dir.path().join("sample-2.h264"), &[&[0x41, 2]]);
        write_length_prefixed_file(&dir.path().join("sample-10.h264"), &[&[0x41, 10]]);
        write_length_prefixed_file(&dir.path().join("sample-1.h264"), &[&[0x41, 1]]);

        let mut adapter = FileSequenceAdapter::new(dir.path().to_string_lossy().to_string());
        adapter.open().await.unwrap();

        let b1 = adapter.next_batch(1).await.unwrap();
        let b2 = adapter.next_batch(1).await.unwrap();
        let b3 = adapter.next_batch(1).await.unwrap();
        let b4 = adapter.next_batch(1).await.unwrap();

        assert_eq!(b1, vec![vec![0x41u8, 1]]);
        assert_eq!(b2, vec![vec![0x41u8, 2]]);
        assert_eq!(b3, vec![vec![0x41u8, 10]]);
        assert_eq!(b4, vec![vec![0x41u8, 1]], "restarts at file 0");
    }

    #[tokio::test]
    async fn open_fails_when_no_files_present() {
        let dir = tempfile::tempdir().unwrap();
        let mut adapter = FileSequenceAdapter::new(dir.path().to_string_lossy().to_string());
        assert!(adapter.open().await.is_err());
    }
}
