use serde::Serialize;
use std::{
    collections::VecDeque,
    fs,
    io::Write,
    path::{Path, PathBuf},
    time::SystemTime,
};
use tracing::{debug, warn};

use super::list_segments;
use crate::constants::{SEGMENT_PREFIX, SEGMENT_SUFFIX};
use crate::error::HistoryError;

#[derive(Debug)]
struct SegmentMeta {
    path: PathBuf,
    bytes: u64,
}

#[derive(Debug)]
struct OpenSegment {
    file: fs::File,
    path: PathBuf,
}

/// Appends snapshots to size-bounded `metrics-<unix-seconds>.jsonl` segments.
///
/// Rotates once the active segment reaches `segment_bytes` and deletes the
/// oldest closed segments while the directory holds more than `max_bytes`.
#[derive(Debug)]
pub struct SegmentWriter {
    base: PathBuf,
    segment_bytes: u64,
    max_bytes: u64,
    total_bytes: u64,
    segments: VecDeque<SegmentMeta>,
    current: Option<OpenSegment>,
}

impl SegmentWriter {
    /// Opens `directory`, creating it if needed and adopting existing segments.
    pub fn new(
        directory: impl Into<PathBuf>,
        segment_bytes: u64,
        max_bytes: u64,
    ) -> Result<Self, HistoryError> {
        let base = directory.into();
        if !base.exists() {
            fs::create_dir_all(&base).map_err(HistoryError::CreateDir)?;
        }

        let mut segments = VecDeque::new();
        let mut total_bytes: u64 = 0;
        for path in list_segments(&base) {
            if let Ok(metadata) = fs::metadata(&path) {
                total_bytes = total_bytes.saturating_add(metadata.len());
                segments.push_back(SegmentMeta {
                    path,
                    bytes: metadata.len(),
                });
            }
        }
        debug!(
            "history writer adopted {} segment(s) ({total_bytes} bytes) in {}",
            segments.len(),
            base.display()
        );

        Ok(Self {
            base,
            segment_bytes,
            max_bytes,
            total_bytes,
            segments,
            current: None,
        })
    }

    pub fn directory(&self) -> &Path {
        &self.base
    }

    /// Bytes currently accounted to segments in the directory.
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Appends `record` as one JSON line.
    pub fn append<T: Serialize>(&mut self, record: &T) -> Result<(), HistoryError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let written = line.len() as u64;

        let segment_bytes = self.segment_bytes;
        let current = self.ensure_segment()?;
        current
            .file
            .write_all(&line)
            .map_err(HistoryError::SegmentWrite)?;

        let mut rotate = false;
        if let Some(meta) = self.segments.back_mut() {
            meta.bytes = meta.bytes.saturating_add(written);
            rotate = meta.bytes >= segment_bytes;
        }
        self.total_bytes = self.total_bytes.saturating_add(written);

        if rotate {
            self.current = None;
        }
        self.enforce_budget();
        Ok(())
    }

    fn ensure_segment(&mut self) -> Result<&mut OpenSegment, HistoryError> {
        let segment = match self.current.take() {
            Some(segment) => segment,
            None => {
                let seconds = SystemTime::now()
                    .duration_since(SystemTime::UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs();
                let path = self
                    .base
                    .join(format!("{SEGMENT_PREFIX}{seconds}{SEGMENT_SUFFIX}"));
                let file = fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .map_err(HistoryError::SegmentWrite)?;
                // A rotation within the same second keeps appending to the same file.
                if self.segments.back().map(|meta| &meta.path) != Some(&path) {
                    self.segments.push_back(SegmentMeta {
                        path: path.clone(),
                        bytes: 0,
                    });
                }
                OpenSegment { file, path }
            }
        };
        Ok(self.current.insert(segment))
    }

    fn enforce_budget(&mut self) {
        while self.total_bytes > self.max_bytes && self.segments.len() > 1 {
            let Some(meta) = self.segments.pop_front() else {
                break;
            };
            if self.current.as_ref().map(|open| &open.path) == Some(&meta.path) {
                self.segments.push_front(meta);
                break;
            }
            if let Err(err) = fs::remove_file(&meta.path) {
                warn!("failed to remove history segment {}: {err}", meta.path.display());
            }
            self.total_bytes = self.total_bytes.saturating_sub(meta.bytes);
        }
    }
}
