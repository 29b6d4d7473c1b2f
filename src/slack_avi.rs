//! AVI slack extraction: per-channel byte recovery, audio pairing, and
//! cleanup orchestration (SlackExtractor, AVI half).

use crate::avi_channel;
use crate::config::EngineConfig;
use crate::data_model::{ChannelLabel, SlackReport};
use crate::error::AviError;
use crate::integrity;
use crate::transcode::Transcoder;
use byteorder::{LittleEndian, ReadBytesExt};
use std::path::{Path, PathBuf};

const AUDIO_FOURCCS: [&str; 3] = ["00wb", "01wb", "02wb"];
const DEFAULT_SAMPLE_RATE: u32 = 48_000;
const FALLBACK_SAMPLE_RATE: u32 = 24_000;

/// Per-channel AVI slack recovery result before muxing: the raw elementary
/// stream bytes plus how many frames were accepted.
pub struct ChannelRecovery {
    pub label: ChannelLabel,
    pub bytes: Vec<u8>,
    pub frame_count: usize,
}

/// Step 1 of the AVI pipeline: confirm the file is RIFF/AVI and locate the
/// declared body end used to separate "main" data from slack.
pub fn locate_riff_end(data: &[u8], cfg: &EngineConfig) -> Result<u64, AviError> {
    if data.len() < 12 || &data[0..4] != b"RIFF" {
        return Err(AviError::SignatureMissing);
    }
    Ok(avi_channel::guess_main_area_end(data, cfg))
}

/// Steps 3-4: recover every channel's slack (post-`riff_end`) bytes.
pub fn recover_all_channels_slack(data: &[u8], riff_end: u64, cfg: &EngineConfig) -> Vec<ChannelRecovery> {
    ChannelLabel::ALL
        .iter()
        .map(|&label| {
            let (bytes, frame_count, _codec) = avi_channel::split_channel_bytes(data, label, riff_end, cfg);
            ChannelRecovery { label, bytes, frame_count }
        })
        .collect()
}

/// Step 3b (fallback mode): recover every channel's *full* bytes with no
/// NAL filter, used when the file is whole/undamaged and slack-only
/// recovery would be too conservative.
pub fn recover_all_channels_full(data: &[u8], riff_end: u64, cfg: &EngineConfig) -> Vec<ChannelRecovery> {
    ChannelLabel::ALL
        .iter()
        .map(|&label| {
            let bytes = avi_channel::extract_full_channel_bytes(data, label, riff_end, cfg);
            let frame_count = if bytes.is_empty() { 0 } else { 1 };
            ChannelRecovery { label, bytes, frame_count }
        })
        .collect()
}

/// First of `00wb`/`01wb`/`02wb` found in `[start, end)`, earliest offset wins.
fn first_audio_fourcc(data: &[u8], start: u64, end: u64) -> Option<&'static str> {
    AUDIO_FOURCCS
        .iter()
        .filter_map(|&id| crate::scanner::find(data, id.as_bytes(), start).filter(|&pos| pos < end).map(|pos| (pos, id)))
        .min_by_key(|&(pos, _)| pos)
        .map(|(_, id)| id)
}

/// Concatenate every well-sized `fourcc` chunk payload found in `[start, end)`.
fn extract_audio_chunks(data: &[u8], fourcc: &str, start: u64, end: u64, cfg: &EngineConfig) -> Vec<u8> {
    let sig = fourcc.as_bytes();
    let mut out = Vec::new();
    let mut offset = start;
    loop {
        let Some(idx) = crate::scanner::find(data, sig, offset) else { break };
        if idx >= end || idx + 8 > data.len() as u64 {
            break;
        }
        let size = (&data[(idx + 4) as usize..(idx + 8) as usize]).read_u32::<LittleEndian>().unwrap() as u64;
        let chunk_start = idx + 8;
        let chunk_end = chunk_start + size;

        if size > cfg.max_reasonable_chunk_size || size <= cfg.min_reasonable_chunk_size || chunk_end > end || chunk_end > data.len() as u64 {
            offset = idx + 4;
            continue;
        }
        out.extend_from_slice(&data[chunk_start as usize..chunk_end as usize]);
        offset = chunk_end;
    }
    out
}

/// Steps 3-4: original audio (within the declared RIFF area) and slack audio
/// (past it), each as a raw headerless PCM blob using the first audio FourCC found.
fn recover_audio_raws(data: &[u8], riff_end: u64, cfg: &EngineConfig) -> (Vec<u8>, Vec<u8>) {
    let original = match first_audio_fourcc(data, 0, riff_end) {
        Some(fourcc) => extract_audio_chunks(data, fourcc, 0, riff_end, cfg),
        None => Vec::new(),
    };
    let slack = match first_audio_fourcc(data, riff_end, data.len() as u64) {
        Some(fourcc) => extract_audio_chunks(data, fourcc, riff_end, data.len() as u64, cfg),
        None => Vec::new(),
    };
    (original, slack)
}

fn channel_output_dir(out_dir: &Path, name: &str, label: ChannelLabel) -> PathBuf {
    out_dir.join(name).join(label.name())
}

/// Rename `path` in place to carry a `_damaged` suffix before its extension,
/// returning the new path. No-op (returns the original path) on I/O failure.
fn mark_damaged(path: &Path) -> PathBuf {
    let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else { return path.to_path_buf() };
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
    let renamed = path.with_file_name(format!("{stem}_damaged.{ext}"));
    match std::fs::rename(path, &renamed) {
        Ok(()) => renamed,
        Err(e) => {
            log::warn!("failed to rename {} to damaged suffix: {e}", path.display());
            path.to_path_buf()
        }
    }
}

/// Remux a raw elementary stream to MP4 via the transcoder, if one is
/// available; `None` when there is no transcoder or the remux failed.
fn remux(transcoder: Option<&Transcoder>, raw_path: &Path, out_path: &Path) -> Option<PathBuf> {
    let transcoder = transcoder?;
    match transcoder.remux_elementary_stream(raw_path, out_path) {
        Ok(()) => Some(out_path.to_path_buf()),
        Err(e) => {
            log::warn!("remux of {} failed: {e}", raw_path.display());
            None
        }
    }
}

/// Build one channel's slack-mode report: write the raw ES, remux, duration
/// check, and fall back to a still image when the clip is too short.
fn build_slack_report(
    chosen: &ChannelRecovery,
    codec: crate::data_model::VideoCodec,
    data_len: u64,
    cfg: &EngineConfig,
    transcoder: Option<&Transcoder>,
    chan_dir: &Path,
    name: &str,
) -> SlackReport {
    if chosen.bytes.is_empty() {
        return SlackReport::failed();
    }
    let _ = std::fs::create_dir_all(chan_dir);
    let param_sets = extract_param_sets(&chosen.bytes, codec);
    let raw_path = chan_dir.join(format!("{name}_{}_slack.h264", chosen.label.name()));
    let write_result = crate::annexb::write_elementary_stream(&chosen.bytes, &param_sets, &raw_path);

    let Ok((_n, byte_count)) = write_result else {
        let mut r = SlackReport::failed();
        r.slack_size_bytes = chosen.bytes.len() as u64;
        r.is_image_fallback = true;
        return r;
    };
    if byte_count == 0 {
        let mut r = SlackReport::failed();
        r.slack_size_bytes = chosen.bytes.len() as u64;
        r.is_image_fallback = true;
        return r;
    }

    let slack_rate = SlackReport::slack_rate(chosen.bytes.len() as u64, data_len);
    let mp4_path = chan_dir.join(format!("{name}_{}_slack.mp4", chosen.label.name()));
    let remuxed = remux(transcoder, &raw_path, &mp4_path);

    let too_short = transcoder
        .zip(remuxed.as_ref())
        .and_then(|(t, p)| t.duration_seconds(p))
        .map(|secs| secs < cfg.slack_image_threshold_sec)
        .unwrap_or(chosen.frame_count < 3);
    let remuxed_is_none = remuxed.is_none();

    if let (Some(t), Some(mp4)) = (transcoder, remuxed.as_ref().filter(|_| too_short)) {
        let jpg_path = chan_dir.join(format!("{name}_{}_slack.jpg", chosen.label.name()));
        if t.extract_still_frame(mp4, &jpg_path).is_ok() {
            return SlackReport {
                recovered: true,
                slack_size_bytes: chosen.bytes.len() as u64,
                slack_rate_pct: slack_rate,
                video_path: None,
                image_path: Some(jpg_path),
                is_image_fallback: true,
            };
        }
    }

    SlackReport {
        recovered: true,
        slack_size_bytes: chosen.bytes.len() as u64,
        slack_rate_pct: slack_rate,
        video_path: Some(remuxed.unwrap_or(raw_path)),
        image_path: None,
        is_image_fallback: too_short && remuxed_is_none,
    }
}

/// Build one channel's full-mode report: write the raw ES, remux, and rename
/// with a `_damaged` suffix if the source container was flagged damaged.
fn build_full_report(
    chosen: &ChannelRecovery,
    codec: crate::data_model::VideoCodec,
    data_len: u64,
    damaged: bool,
    transcoder: Option<&Transcoder>,
    chan_dir: &Path,
    name: &str,
) -> SlackReport {
    if chosen.bytes.is_empty() {
        return SlackReport::failed();
    }
    let _ = std::fs::create_dir_all(chan_dir);
    let param_sets = extract_param_sets(&chosen.bytes, codec);
    let raw_path = chan_dir.join(format!("{name}_{}_full.h264", chosen.label.name()));
    let write_result = crate::annexb::write_elementary_stream(&chosen.bytes, &param_sets, &raw_path);

    let Ok((_n, byte_count)) = write_result else {
        let mut r = SlackReport::failed();
        r.slack_size_bytes = chosen.bytes.len() as u64;
        return r;
    };
    if byte_count == 0 {
        let mut r = SlackReport::failed();
        r.slack_size_bytes = chosen.bytes.len() as u64;
        return r;
    }

    let mp4_path = chan_dir.join(format!("{name}_{}_full.mp4", chosen.label.name()));
    let remuxed = remux(transcoder, &raw_path, &mp4_path);
    let mut final_path = remuxed.unwrap_or(raw_path);
    if damaged {
        final_path = mark_damaged(&final_path);
    }

    SlackReport {
        recovered: true,
        slack_size_bytes: chosen.bytes.len() as u64,
        slack_rate_pct: SlackReport::slack_rate(chosen.bytes.len() as u64, data_len),
        video_path: Some(final_path),
        image_path: None,
        is_image_fallback: false,
    }
}

/// Full 8-step AVI slack pipeline: integrity, source copy, original/slack
/// audio extraction, per-channel slack+full recovery (remux, duration check,
/// image fallback, damaged-rename), WAV conversion, audio/video merge, and
/// per-channel directory cleanup.
pub fn recover_avi_slack(data: &[u8], cfg: &EngineConfig, out_dir: &Path, name: &str) -> Result<Vec<(ChannelLabel, SlackReport)>, AviError> {
    let riff_end = locate_riff_end(data, cfg)?;
    let integrity = integrity::analyze_avi(data, cfg);
    let codec = avi_channel::detect_codec(data);
    let transcoder = Transcoder::locate(cfg).ok();

    // step 2: copy source into the output tree.
    let source_copy = out_dir.join(format!("{name}.avi"));
    if let Err(e) = std::fs::create_dir_all(out_dir).and_then(|_| std::fs::write(&source_copy, data)) {
        log::warn!("failed to copy source {name} into output tree: {e}");
    }

    // steps 3-4: original and slack audio, as raw headerless PCM.
    let (orig_audio, slack_audio) = recover_audio_raws(data, riff_end, cfg);
    let audio_dir = out_dir.join(name).join("audio");
    let _ = std::fs::create_dir_all(&audio_dir);
    let orig_audio_raw = audio_dir.join(format!("{name}_original_audio.raw"));
    let slack_audio_raw = audio_dir.join(format!("{name}_slack_audio.raw"));
    if !orig_audio.is_empty() {
        let _ = std::fs::write(&orig_audio_raw, &orig_audio);
    }
    if !slack_audio.is_empty() {
        let _ = std::fs::write(&slack_audio_raw, &slack_audio);
    }

    // step 6: convert both audio raws to WAV, sample rate probed from the
    // source copy (falling back to 24 kHz when the probe itself fails).
    let sample_rate = transcoder
        .as_ref()
        .and_then(|t| t.probe_sample_rate(&source_copy))
        .unwrap_or(if transcoder.is_some() { FALLBACK_SAMPLE_RATE } else { DEFAULT_SAMPLE_RATE });
    let orig_audio_wav = audio_dir.join(format!("{name}_original_audio.wav"));
    let mut orig_wav_ready = false;
    if let Some(t) = &transcoder {
        if orig_audio_raw.exists() {
            orig_wav_ready = t.convert_raw_pcm_to_wav(&orig_audio_raw, &orig_audio_wav, sample_rate).is_ok();
        }
        if slack_audio_raw.exists() {
            let slack_audio_wav = audio_dir.join(format!("{name}_slack_audio.wav"));
            let _ = t.convert_raw_pcm_to_wav(&slack_audio_raw, &slack_audio_wav, sample_rate);
        }
    }

    let slack_recoveries = recover_all_channels_slack(data, riff_end, cfg);
    let full_recoveries = recover_all_channels_full(data, riff_end, cfg);

    let mut out = Vec::new();
    let merge_dir = out_dir.join(name).join("merged");
    for (slack, full) in slack_recoveries.into_iter().zip(full_recoveries) {
        let label = slack.label;
        let chan_dir = channel_output_dir(out_dir, name, label);

        let use_full = slack.bytes.is_empty() && !full.bytes.is_empty();
        let report = if use_full {
            build_full_report(&full, codec, data.len() as u64, integrity.damaged, transcoder.as_ref(), &chan_dir, name)
        } else {
            build_slack_report(&slack, codec, data.len() as u64, cfg, transcoder.as_ref(), &chan_dir, name)
        };

        // step 7: merge the original audio with this channel's full-mode video.
        if orig_wav_ready {
            if let (Some(t), true, Some(video)) = (&transcoder, !use_full, full_report_video(&full, codec, data.len() as u64, cfg, transcoder.as_ref(), &chan_dir, name)) {
                let _ = std::fs::create_dir_all(&merge_dir);
                let merged_path = merge_dir.join(format!("{name}_{}_with_audio.mp4", label.name()));
                let _ = t.merge_video_audio(&video, &orig_audio_wav, &merged_path);
            }
        }

        // step 8: an empty per-channel directory (recovery produced nothing) is removed.
        if !report.recovered {
            let _ = std::fs::remove_dir(&chan_dir);
        }
        out.push((label, report));
    }

    Ok(out)
}

/// Full-mode video path for the merge step (step 7), without re-deriving a
/// whole report; returns `None` when full-mode recovery produced nothing.
fn full_report_video(
    full: &ChannelRecovery,
    codec: crate::data_model::VideoCodec,
    data_len: u64,
    _cfg: &EngineConfig,
    transcoder: Option<&Transcoder>,
    chan_dir: &Path,
    name: &str,
) -> Option<PathBuf> {
    let report = build_full_report(full, codec, data_len, false, transcoder, chan_dir, name);
    report.video_path
}

fn extract_param_sets(elementary: &[u8], codec: crate::data_model::VideoCodec) -> Vec<u8> {
    crate::annexb::extract_parameter_sets(elementary, codec).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn chunk(id: &str, payload: &[u8]) -> Vec<u8> {
        let mut v = id.as_bytes().to_vec();
        v.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        v.extend_from_slice(payload);
        v
    }

    fn riff_avi_with_channel_slack() -> Vec<u8> {
        let mut movi_payload = b"movi".to_vec();
        movi_payload.extend(chunk("00dc", &[0x06u8]));

        let mut movi_chunk = b"LIST".to_vec();
        movi_chunk.extend_from_slice(&(movi_payload.len() as u32).to_le_bytes());
        movi_chunk.extend_from_slice(&movi_payload);

        let mut riff_payload = b"AVI ".to_vec();
        riff_payload.extend_from_slice(&movi_chunk);

        let mut buf = b"RIFF".to_vec();
        buf.extend_from_slice(&(riff_payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&riff_payload);

        // append slack: SPS then IDR for channel 00
        let sps = {
            let mut p = vec![0x07u8];
            p.extend(std::iter::repeat_n(0xAAu8, 20));
            p
        };
        let idr = {
            let mut p = vec![0x05u8];
            p.extend(std::iter::repeat_n(0xBBu8, 20));
            p
        };
        buf.extend(chunk("00dc", &sps));
        buf.extend(chunk("00dc", &idr));
        buf
    }

    #[test]
    fn recovers_front_channel_slack_to_file() {
        let data = riff_avi_with_channel_slack();
        let cfg = EngineConfig::default();
        let dir = tempdir().unwrap();
        let results = recover_avi_slack(&data, &cfg, dir.path(), "clip").unwrap();
        let front = results.iter().find(|(l, _)| *l == ChannelLabel::Front).unwrap();
        assert!(front.1.recovered, "{:?}", front.1);
        assert!(front.1.video_path.as_ref().unwrap().exists());
    }

    #[test]
    fn rejects_non_riff_input() {
        let data = vec![0u8; 32];
        let cfg = EngineConfig::default();
        assert!(locate_riff_end(&data, &cfg).is_err());
    }

    #[test]
    fn copies_source_into_output_tree() {
        let data = riff_avi_with_channel_slack();
        let cfg = EngineConfig::default();
        let dir = tempdir().unwrap();
        recover_avi_slack(&data, &cfg, dir.path(), "clip").unwrap();
        assert!(dir.path().join("clip.avi").exists());
    }

    #[test]
    fn extracts_original_and_slack_audio_raws() {
        let mut movi_payload = b"movi".to_vec();
        movi_payload.extend(chunk("00wb", &[0x11u8; 20]));
        let mut movi_chunk = b"LIST".to_vec();
        movi_chunk.extend_from_slice(&(movi_payload.len() as u32).to_le_bytes());
        movi_chunk.extend_from_slice(&movi_payload);
        let mut riff_payload = b"AVI ".to_vec();
        riff_payload.extend_from_slice(&movi_chunk);
        let mut buf = b"RIFF".to_vec();
        buf.extend_from_slice(&(riff_payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&riff_payload);
        buf.extend(chunk("00wb", &[0x22u8; 20]));

        let cfg = EngineConfig::default();
        let (orig, slack) = recover_audio_raws(&buf, avi_channel::guess_main_area_end(&buf, &cfg), &cfg);
        assert_eq!(orig, vec![0x11u8; 20]);
        assert_eq!(slack, vec![0x22u8; 20]);
    }

    #[test]
    fn non_image_fallback_channel_does_not_have_image_path() {
        let data = riff_avi_with_channel_slack();
        let cfg = EngineConfig::default();
        let dir = tempdir().unwrap();
        let results = recover_avi_slack(&data, &cfg, dir.path(), "clip").unwrap();
        let rear = results.iter().find(|(l, _)| *l == ChannelLabel::Rear).unwrap();
        assert!(!rear.1.recovered);
        assert!(rear.1.image_path.is_none());
    }
}
