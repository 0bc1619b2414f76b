use std::fs::{create_dir_all, File, OpenOptions};
use std::io::{BufWriter, ErrorKind};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, SecondsFormat};
use hound::{SampleFormat, WavSpec, WavWriter};
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;

use crate::service::recording;
use crate::shared::config::AudioFormat;

#[derive(Debug, Error)]
pub enum SegmentError {
    #[error("segment io: {0}")]
    Io(#[from] std::io::Error),
    #[error("wav: {0}")]
    Wav(#[from] hound::Error),
    #[error("segment writer is closed")]
    Closed,
}

struct OpenSegment {
    writer: WavWriter<BufWriter<File>>,
    path: PathBuf,
    opened_at: DateTime<Local>,
    started: Instant,
    frames: u64,
}

/// Writes one stream's PCM into time-bounded WAV segments.
///
/// Owned by a single playout worker; none of the methods are meant to be
/// called concurrently. Segment files of one writer never share an index.
pub struct SegmentWriter {
    ssrc: u32,
    label: String,
    dir: PathBuf,
    format: AudioFormat,
    index: u32,
    current: Option<OpenSegment>,
}

impl SegmentWriter {
    /// Creates `<base_dir>/<label>/` if needed and opens segment 0.
    pub fn open(
        base_dir: &Path,
        ssrc: u32,
        label: &str,
        format: AudioFormat,
    ) -> Result<Self, SegmentError> {
        let dir = recording::label_dir(base_dir, label, ssrc);
        create_dir_all(&dir)?;
        let mut writer = Self {
            ssrc,
            label: recording::sanitize_label(label, ssrc),
            dir,
            format,
            index: 0,
            current: None,
        };
        writer.open_current(0)?;
        Ok(writer)
    }

    /// Opens the first free segment name at or after `index`. The file is
    /// created exclusively, so a name already taken by another writer of the
    /// same stream (same second, racing session) is skipped, never truncated.
    /// `self.index` only moves once a file is actually open.
    fn open_current(&mut self, index: u32) -> Result<(), SegmentError> {
        let opened_at = Local::now();
        let mut index = index;
        let (file, path) = loop {
            let path = self.segment_path(&opened_at, index);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => break (file, path),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => index += 1,
                Err(e) => return Err(e.into()),
            }
        };
        let spec = WavSpec {
            channels: self.format.channels,
            sample_rate: self.format.sample_rate,
            bits_per_sample: self.format.bits_per_sample(),
            sample_format: SampleFormat::Int,
        };
        let writer = match WavWriter::new(BufWriter::new(file), spec) {
            Ok(writer) => writer,
            Err(e) => {
                let _ = std::fs::remove_file(&path);
                return Err(e.into());
            }
        };
        self.index = index;
        log::info!(
            "[segment {}] opened {} (index={})",
            self.ssrc,
            path.display(),
            self.index
        );
        self.current = Some(OpenSegment {
            writer,
            path,
            opened_at,
            started: Instant::now(),
            frames: 0,
        });
        Ok(())
    }

    fn segment_path(&self, opened_at: &DateTime<Local>, index: u32) -> PathBuf {
        self.dir.join(recording::segment_file_name(
            opened_at,
            self.ssrc,
            &self.label,
            index,
        ))
    }

    /// Appends little-endian PCM bytes to the open segment. A trailing partial
    /// frame is ignored; callers validate alignment before enqueueing.
    pub fn write(&mut self, payload: &[u8]) -> Result<(), SegmentError> {
        let width = self.format.sample_width as usize;
        let frame_size = self.format.frame_size();
        let seg = self.current.as_mut().ok_or(SegmentError::Closed)?;
        let aligned = &payload[..payload.len() - payload.len() % frame_size];
        write_pcm(&mut seg.writer, aligned, width)?;
        seg.frames += (aligned.len() / frame_size) as u64;
        Ok(())
    }

    /// Time since the open segment started, measured on the tokio clock.
    pub fn segment_elapsed(&self, now: Instant) -> Option<std::time::Duration> {
        self.current
            .as_ref()
            .map(|seg| now.saturating_duration_since(seg.started))
    }

    /// Finalizes the open segment and opens the next index.
    pub fn rotate(&mut self) -> Result<PathBuf, SegmentError> {
        self.finalize_current()?;
        self.open_current(self.index + 1)?;
        Ok(self.current_path().unwrap_or_default())
    }

    /// Drops whatever is open (best effort) and starts a fresh segment at the
    /// next index; used after a failed write or rotation.
    pub fn reopen(&mut self) -> Result<(), SegmentError> {
        if let Err(e) = self.finalize_current() {
            log::warn!("[segment {}] finalize before reopen failed: {}", self.ssrc, e);
        }
        self.open_current(self.index + 1)
    }

    /// Finalizes the open segment. Calling it again is a no-op.
    pub fn close(&mut self) -> Result<(), SegmentError> {
        self.finalize_current()
    }

    /// Closes and deletes the open segment; for a writer that never received
    /// audio and is being thrown away.
    pub fn discard(mut self) {
        if let Some(seg) = self.current.take() {
            let path = seg.path.clone();
            drop(seg.writer.finalize());
            if let Err(e) = std::fs::remove_file(&path) {
                log::warn!("[segment {}] failed to remove {}: {}", self.ssrc, path.display(), e);
            }
        }
    }

    pub fn is_open(&self) -> bool {
        self.current.is_some()
    }

    pub fn segment_index(&self) -> u32 {
        self.index
    }

    pub fn current_path(&self) -> Option<PathBuf> {
        self.current.as_ref().map(|seg| seg.path.clone())
    }

    pub fn frames_written(&self) -> u64 {
        self.current.as_ref().map_or(0, |seg| seg.frames)
    }

    fn finalize_current(&mut self) -> Result<(), SegmentError> {
        let Some(seg) = self.current.take() else {
            return Ok(());
        };
        let OpenSegment {
            writer,
            path,
            opened_at,
            frames,
            ..
        } = seg;
        writer.finalize()?;
        File::open(&path)?.sync_all()?;
        log::info!(
            "[segment {}] closed {} frames={}",
            self.ssrc,
            path.display(),
            frames
        );
        if let Err(e) = self.write_meta(&path, opened_at, frames) {
            log::warn!(
                "[segment {}] failed to write metadata for {}: {}",
                self.ssrc,
                path.display(),
                e
            );
        }
        Ok(())
    }

    fn write_meta(
        &self,
        wav_path: &Path,
        opened_at: DateTime<Local>,
        frames: u64,
    ) -> anyhow::Result<()> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Meta<'a> {
            ssrc: u32,
            label: &'a str,
            segment_index: u32,
            started_at: String,
            closed_at: String,
            sample_rate: u32,
            channels: u16,
            sample_width: u16,
            frames: u64,
            duration_sec: f64,
        }
        let meta = Meta {
            ssrc: self.ssrc,
            label: &self.label,
            segment_index: self.index,
            started_at: opened_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            closed_at: Local::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            sample_rate: self.format.sample_rate,
            channels: self.format.channels,
            sample_width: self.format.sample_width,
            frames,
            duration_sec: frames as f64 / self.format.sample_rate as f64,
        };
        let json = serde_json::to_vec_pretty(&meta)?;
        std::fs::write(wav_path.with_extension("json"), json)?;
        Ok(())
    }
}

impl Drop for SegmentWriter {
    fn drop(&mut self) {
        if self.current.is_some() {
            if let Err(e) = self.finalize_current() {
                log::warn!("[segment {}] finalize on drop failed: {}", self.ssrc, e);
            }
        }
    }
}

fn write_pcm<W>(writer: &mut WavWriter<W>, pcm: &[u8], width: usize) -> hound::Result<()>
where
    W: std::io::Write + std::io::Seek,
{
    match width {
        // 8-bit WAV is unsigned on disk; hound expects the signed view.
        1 => {
            for &b in pcm {
                writer.write_sample((b as i16 - 128) as i8)?;
            }
        }
        2 => {
            for c in pcm.chunks_exact(2) {
                writer.write_sample(i16::from_le_bytes([c[0], c[1]]))?;
            }
        }
        3 => {
            for c in pcm.chunks_exact(3) {
                writer.write_sample(i32::from_le_bytes([0, c[0], c[1], c[2]]) >> 8)?;
            }
        }
        _ => {
            for c in pcm.chunks_exact(4) {
                writer.write_sample(i32::from_le_bytes([c[0], c[1], c[2], c[3]]))?;
            }
        }
    }
    Ok(())
}
