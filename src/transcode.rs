//! External ffmpeg/ffprobe wrapper (Transcoder) — the only place this crate
//! shells out. Binary lookup order: `EngineConfig::ffmpeg_dir`, then
//! `VIREX_FFMPEG_DIR`, then walking upward from the current executable's
//! directory looking for a `bin/` sibling, then the system `PATH`.

use crate::config::EngineConfig;
use crate::error::TranscodeError;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

pub struct Transcoder {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

impl Transcoder {
    pub fn locate(cfg: &EngineConfig) -> Result<Self, TranscodeError> {
        let ffmpeg = find_binary("ffmpeg", cfg)?;
        let ffprobe = find_binary("ffprobe", cfg)?;
        Ok(Transcoder { ffmpeg, ffprobe })
    }

    /// Remux a raw H.264/HEVC Annex-B elementary stream into a playable
    /// container, re-encoding only if direct stream copy fails.
    pub fn remux_elementary_stream(&self, raw_path: &Path, out_path: &Path) -> Result<(), TranscodeError> {
        let status = Command::new(&self.ffmpeg)
            .args(["-y", "-f", "h264", "-i"])
            .arg(raw_path)
            .args(["-c", "copy", "-movflags", "+faststart"])
            .arg(out_path)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(TranscodeError::Spawn)?;

        if !status.success() {
            return Err(TranscodeError::NonZeroExit(status.code().unwrap_or(-1)));
        }
        ensure_nonempty(out_path)
    }

    /// Convert a raw PCM/WAV-adjacent audio blob to a playable WAV container.
    pub fn convert_audio_to_wav(&self, raw_path: &Path, out_path: &Path) -> Result<(), TranscodeError> {
        let status = Command::new(&self.ffmpeg)
            .args(["-y", "-i"])
            .arg(raw_path)
            .arg(out_path)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(TranscodeError::Spawn)?;
        if !status.success() {
            return Err(TranscodeError::NonZeroExit(status.code().unwrap_or(-1)));
        }
        ensure_nonempty(out_path)
    }

    /// Convert a headerless mono 16-bit PCM blob to WAV at an explicit sample
    /// rate, since a raw chunk dump carries no format of its own for ffmpeg
    /// to sniff.
    pub fn convert_raw_pcm_to_wav(&self, raw_path: &Path, out_path: &Path, sample_rate: u32) -> Result<(), TranscodeError> {
        let status = Command::new(&self.ffmpeg)
            .args(["-y", "-f", "s16le", "-ar"])
            .arg(sample_rate.to_string())
            .args(["-ac", "1", "-i"])
            .arg(raw_path)
            .arg(out_path)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(TranscodeError::Spawn)?;
        if !status.success() {
            return Err(TranscodeError::NonZeroExit(status.code().unwrap_or(-1)));
        }
        ensure_nonempty(out_path)
    }

    /// Sample rate of the first audio stream, if `ffprobe` can determine one.
    pub fn probe_sample_rate(&self, path: &Path) -> Option<u32> {
        let output = Command::new(&self.ffprobe)
            .args(["-v", "error", "-select_streams", "a:0", "-show_entries", "stream=sample_rate", "-of", "csv=p=0"])
            .arg(path)
            .output()
            .ok()?;
        String::from_utf8_lossy(&output.stdout).trim().parse().ok()
    }

    /// Mux a recovered video stream with its paired audio track.
    pub fn merge_video_audio(&self, video: &Path, audio: &Path, out_path: &Path) -> Result<(), TranscodeError> {
        let status = Command::new(&self.ffmpeg)
            .args(["-y", "-i"])
            .arg(video)
            .arg("-i")
            .arg(audio)
            .args(["-c", "copy", "-movflags", "+faststart"])
            .arg(out_path)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(TranscodeError::Spawn)?;
        if !status.success() {
            return Err(TranscodeError::NonZeroExit(status.code().unwrap_or(-1)));
        }
        ensure_nonempty(out_path)
    }

    /// Grab a single still JPEG frame, used as the duration-too-short fallback.
    pub fn extract_still_frame(&self, video: &Path, out_path: &Path) -> Result<(), TranscodeError> {
        let status = Command::new(&self.ffmpeg)
            .args(["-y", "-i"])
            .arg(video)
            .args(["-frames:v", "1"])
            .arg(out_path)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(TranscodeError::Spawn)?;
        if !status.success() {
            return Err(TranscodeError::NonZeroExit(status.code().unwrap_or(-1)));
        }
        ensure_nonempty(out_path)
    }

    /// `true` if `ffprobe` can open and read at least one stream from `path`.
    pub fn is_playable(&self, path: &Path) -> bool {
        Command::new(&self.ffprobe)
            .args(["-v", "error", "-show_entries", "stream=codec_type"])
            .arg(path)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Duration in seconds, if `ffprobe` can determine one.
    pub fn duration_seconds(&self, path: &Path) -> Option<f64> {
        let output = Command::new(&self.ffprobe)
            .args(["-v", "error", "-show_entries", "format=duration", "-of", "csv=p=0"])
            .arg(path)
            .output()
            .ok()?;
        String::from_utf8_lossy(&output.stdout).trim().parse().ok()
    }
}

fn ensure_nonempty(path: &Path) -> Result<(), TranscodeError> {
    match std::fs::metadata(path) {
        Ok(m) if m.len() > 0 => Ok(()),
        _ => Err(TranscodeError::EmptyOutput),
    }
}

fn find_binary(name: &str, cfg: &EngineConfig) -> Result<PathBuf, TranscodeError> {
    let exe_name = if cfg!(windows) { format!("{name}.exe") } else { name.to_string() };

    if let Some(dir) = &cfg.ffmpeg_dir {
        let candidate = dir.join(&exe_name);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    if let Ok(dir) = std::env::var("VIREX_FFMPEG_DIR") {
        let candidate = PathBuf::from(dir).join(&exe_name);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    if let Ok(exe) = std::env::current_exe() {
        let mut dir = exe.parent().map(Path::to_path_buf);
        for _ in 0..4 {
            let Some(d) = dir else { break };
            let candidate = d.join("bin").join(&exe_name);
            if candidate.is_file() {
                return Ok(candidate);
            }
            dir = d.parent().map(Path::to_path_buf);
        }
    }
    if let Ok(path_var) = std::env::var("PATH") {
        for dir in std::env::split_paths(&path_var) {
            let candidate = dir.join(&exe_name);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
    }
    Err(TranscodeError::BinaryNotFound)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locate_fails_without_any_candidate_binary() {
        let cfg = EngineConfig { ffmpeg_dir: Some(PathBuf::from("/nonexistent-virex-test-dir")), ..EngineConfig::default() };
        std::env::remove_var("VIREX_FFMPEG_DIR");
        // PATH may legitimately contain ffmpeg on a dev machine; only assert
        // the explicit ffmpeg_dir override itself is rejected when it misses.
        let direct = find_binary("ffmpeg-definitely-not-a-real-binary-xyz", &cfg);
        assert!(direct.is_err());
    }
}
