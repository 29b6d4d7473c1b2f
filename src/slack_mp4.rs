//! MP4/ISO-BMFF slack extraction: bytes appended past the container's
//! declared `moov`/`mdat` end (SlackExtractor, MP4 half).

use crate::config::EngineConfig;
use crate::data_model::{SlackReport, VideoCodec};
use crate::error::AnnexbError;
use crate::moov;
use crate::scanner::PatternByte;
use byteorder::{BigEndian, ReadBytesExt};
use std::io::Write;
use std::path::Path;

const MIN_FRAME_SIZE: u64 = 5;
const MAX_FRAME_SIZE: u64 = 10 * 1024 * 1024;

/// H.264 I-frame: any byte, the classic 3-byte start code, a slice-header
/// byte in `{0x25,0x45,0x65}`, then `0x88 0x80`. H.265 I-frame: `00`, three
/// wildcard bytes, then `0x26 0x01`.
fn i_frame_pattern(codec: VideoCodec) -> Vec<PatternByte> {
    match codec {
        VideoCodec::H264 => vec![
            PatternByte::Any,
            PatternByte::Literal(0x00),
            PatternByte::Literal(0x00),
            PatternByte::Literal(0x01),
            PatternByte::OneOf(&[0x25, 0x45, 0x65]),
            PatternByte::Literal(0x88),
            PatternByte::Literal(0x80),
        ],
        VideoCodec::H265 => vec![
            PatternByte::Literal(0x00),
            PatternByte::Any,
            PatternByte::Any,
            PatternByte::Any,
            PatternByte::Literal(0x26),
            PatternByte::Literal(0x01),
        ],
    }
}

/// H.264 P-frame: `00 00`, two wildcard bytes, a slice-header byte in
/// `{0x21,0x41,0x61}`, then `0x9A`. H.265 P-frame: `00 00`, two wildcard
/// bytes, then `0x02 0x01`.
fn p_frame_pattern(codec: VideoCodec) -> Vec<PatternByte> {
    match codec {
        VideoCodec::H264 => vec![
            PatternByte::Literal(0x00),
            PatternByte::Literal(0x00),
            PatternByte::Any,
            PatternByte::Any,
            PatternByte::OneOf(&[0x21, 0x41, 0x61]),
            PatternByte::Literal(0x9A),
        ],
        VideoCodec::H265 => vec![
            PatternByte::Literal(0x00),
            PatternByte::Literal(0x00),
            PatternByte::Any,
            PatternByte::Any,
            PatternByte::Literal(0x02),
            PatternByte::Literal(0x01),
        ],
    }
}

/// `(i_frame_count, total_frame_count)`, counting raw pattern hits (before
/// the per-frame size-field validation step 4 applies).
fn classify_frames(data: &[u8], codec: VideoCodec) -> (usize, usize) {
    let i_count = crate::scanner::count_pattern(data, &i_frame_pattern(codec));
    let p_count = crate::scanner::count_pattern(data, &p_frame_pattern(codec));
    (i_count, i_count + p_count)
}

/// Every frame whose pattern matched and whose preceding 4-byte big-endian
/// size field is in `[5, 10 MiB]` and doesn't straddle the buffer end,
/// as `(payload_start, payload_end)` pairs in buffer order.
fn extract_frames(data: &[u8], codec: VideoCodec) -> Vec<(usize, usize)> {
    let i_pat = i_frame_pattern(codec);
    let p_pat = p_frame_pattern(codec);
    let mut hits: Vec<usize> = crate::scanner::iter_pattern(data, &i_pat).collect();
    hits.extend(crate::scanner::iter_pattern(data, &p_pat));
    hits.sort_unstable();
    hits.dedup();

    let mut frames = Vec::new();
    for pos in hits {
        if pos < 4 {
            continue;
        }
        let size = (&data[pos - 4..pos]).read_u32::<BigEndian>().unwrap() as u64;
        if !(MIN_FRAME_SIZE..=MAX_FRAME_SIZE).contains(&size) {
            continue;
        }
        let end = pos + size as usize;
        if end > data.len() {
            continue;
        }
        frames.push((pos, end));
    }
    frames
}

fn write_frames_elementary_stream(
    data: &[u8],
    frames: &[(usize, usize)],
    param_sets: &[u8],
    out_path: &Path,
) -> std::io::Result<usize> {
    let mut file = std::fs::File::create(out_path)?;
    file.write_all(param_sets)?;
    let mut byte_count = param_sets.len();
    for &(start, end) in frames {
        file.write_all(b"\x00\x00\x00\x01")?;
        file.write_all(&data[start..end])?;
        byte_count += 4 + (end - start);
    }
    Ok(byte_count)
}

fn parameter_sets(data: &[u8], moov_box: &crate::data_model::BoxRef, codec: VideoCodec) -> Result<Vec<u8>, AnnexbError> {
    let moov_bytes = &data[moov_box.offset as usize..moov_box.end() as usize];
    let parsed = match codec {
        VideoCodec::H264 => moov::extract_avc_parameter_sets(moov_bytes),
        VideoCodec::H265 => moov::extract_hevc_parameter_sets(moov_bytes),
    };
    parsed.map(|p| p.annexb_bytes).map_err(|_| AnnexbError::NoStartCodes)
}

/// Recover slack video from one MP4 file. Requires at least one I-frame AND
/// at least three total frames, jointly (§9 Open Question 4); falls back to
/// scanning the whole file when the slack-only scan doesn't clear that bar,
/// matching the source's own whole-file fallback.
pub fn recover_mp4_slack(data: &[u8], cfg: &EngineConfig, out_video: &Path) -> SlackReport {
    let (moov_box, mdats) = moov::find_moov_and_mdats(data);
    let offsets = moov_box.as_ref().map(|m| moov::collect_chunk_offsets(data, m)).unwrap_or_default();
    let normal_end = moov::compute_normal_end(data.len() as u64, moov_box.as_ref(), &mdats, &offsets);

    if normal_end >= data.len() as u64 {
        return SlackReport::failed();
    }

    let codec = crate::avi_channel::detect_codec(data);
    let slack = &data[normal_end as usize..];
    let slack_len = slack.len() as u64;

    let (i_count, total_count) = classify_frames(slack, codec);
    let source: &[u8] = if i_count >= 1 && total_count >= 3 {
        slack
    } else {
        let (i2, total2) = classify_frames(data, codec);
        if i2 >= 1 && total2 >= 3 {
            data
        } else {
            let mut report = SlackReport::failed();
            report.slack_size_bytes = slack_len;
            report.is_image_fallback = true;
            return report;
        }
    };

    let Some(moov_box) = moov_box else {
        let mut report = SlackReport::failed();
        report.slack_size_bytes = slack_len;
        return report;
    };
    let Ok(param_sets) = parameter_sets(data, &moov_box, codec) else {
        let mut report = SlackReport::failed();
        report.slack_size_bytes = slack_len;
        return report;
    };

    let _ = cfg;
    let frames = extract_frames(source, codec);
    if frames.is_empty() {
        let mut report = SlackReport::failed();
        report.slack_size_bytes = slack_len;
        return report;
    }

    match write_frames_elementary_stream(source, &frames, &param_sets, out_video) {
        Ok(byte_count) if byte_count > param_sets.len() => {
            let slack_rate = SlackReport::slack_rate(slack_len, data.len() as u64);
            SlackReport {
                recovered: true,
                slack_size_bytes: slack_len,
                slack_rate_pct: slack_rate,
                video_path: Some(out_video.to_path_buf()),
                image_path: None,
                is_image_fallback: false,
            }
        }
        _ => {
            let mut report = SlackReport::failed();
            report.slack_size_bytes = slack_len;
            report
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn make_box(kind: &[u8; 4], payload: &[u8]) -> Vec<u8> {
        let size = 8 + payload.len() as u32;
        let mut v = Vec::new();
        v.extend_from_slice(&size.to_be_bytes());
        v.extend_from_slice(kind);
        v.extend_from_slice(payload);
        v
    }

    fn avcc_box() -> Vec<u8> {
        let sps = [0x67u8, 0x42, 0x00];
        let pps = [0x68u8, 0xCE];
        let mut payload = vec![1u8, 0x42, 0x00, 0x1e, 0xff];
        payload.push(0xE1);
        payload.extend_from_slice(&(sps.len() as u16).to_be_bytes());
        payload.extend_from_slice(&sps);
        payload.push(1);
        payload.extend_from_slice(&(pps.len() as u16).to_be_bytes());
        payload.extend_from_slice(&pps);
        make_box(b"avcC", &payload)
    }

    /// Builds one size-prefixed H.264 frame: `size(BE u32) | pattern-start-byte
    /// | 00 00 01 | class | 88 80 | filler...`, where `size` covers everything
    /// from the pattern's start byte through the filler.
    fn sized_i_frame(class: u8, filler_len: usize) -> Vec<u8> {
        let mut payload = vec![0xFFu8, 0x00, 0x00, 0x01, class, 0x88, 0x80];
        payload.extend(std::iter::repeat_n(0xAAu8, filler_len));
        let mut v = (payload.len() as u32).to_be_bytes().to_vec();
        v.extend(payload);
        v
    }

    fn sized_p_frame(class: u8, filler_len: usize) -> Vec<u8> {
        let mut payload = vec![0x00u8, 0x00, 0xBB, 0xBB, class, 0x9A];
        payload.extend(std::iter::repeat_n(0xCCu8, filler_len));
        let mut v = (payload.len() as u32).to_be_bytes().to_vec();
        v.extend(payload);
        v
    }

    #[test]
    fn no_slack_when_normal_end_covers_file() {
        let mut data = make_box(b"ftyp", &[0u8; 4]);
        let moov = make_box(b"moov", &avcc_box());
        data.extend(&moov);
        data.extend(make_box(b"mdat", &[0u8; 16]));
        let cfg = EngineConfig::default();
        let dir = tempdir().unwrap();
        let report = recover_mp4_slack(&data, &cfg, &dir.path().join("out.h264"));
        assert!(!report.recovered);
    }

    #[test]
    fn recovers_slack_with_enough_frames() {
        let mut data = make_box(b"ftyp", &[0u8; 4]);
        data.extend(make_box(b"moov", &avcc_box()));
        data.extend(make_box(b"mdat", &[0u8; 16]));

        let mut slack = Vec::new();
        slack.extend(sized_i_frame(0x65, 20));
        slack.extend(sized_p_frame(0x41, 20));
        slack.extend(sized_p_frame(0x41, 20));
        data.extend(&slack);

        let cfg = EngineConfig::default();
        let dir = tempdir().unwrap();
        let out = dir.path().join("out.h264");
        let report = recover_mp4_slack(&data, &cfg, &out);
        assert!(report.recovered, "{:?}", report);
        assert!(out.exists());
    }

    #[test]
    fn too_few_frames_falls_back_to_image() {
        let mut data = make_box(b"ftyp", &[0u8; 4]);
        data.extend(make_box(b"moov", &avcc_box()));
        data.extend(make_box(b"mdat", &[0u8; 16]));
        data.extend(sized_i_frame(0x65, 10));

        let cfg = EngineConfig::default();
        let dir = tempdir().unwrap();
        let report = recover_mp4_slack(&data, &cfg, &dir.path().join("out.h264"));
        assert!(!report.recovered);
        assert!(report.is_image_fallback);
    }

    #[test]
    fn frame_with_out_of_range_size_is_skipped() {
        let codec = VideoCodec::H264;
        let mut data = sized_i_frame(0x65, 20);
        data.extend(sized_p_frame(0x41, 20));
        data.extend(sized_p_frame(0x41, 20));
        // corrupt the first frame's declared size to be below the 5-byte floor
        data[0..4].copy_from_slice(&0u32.to_be_bytes());

        let frames = extract_frames(&data, codec);
        assert_eq!(frames.len(), 2, "the corrupted-size frame must be skipped");
    }
}
