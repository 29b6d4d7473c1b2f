//! Proprietary JDR multi-channel dash-cam container (JdrExtractor).
//!
//! Layout: a `1VEJ` header whose block table gives, via a pointer chain, the
//! file-absolute start of the slack region. Chunks inside both regions are
//! `FourCC + u32 LE size + 20-byte timestamp header + payload`.

use crate::config::EngineConfig;
use crate::data_model::{ChannelLabel, ChunkGroup, JdrRegionMap, SlackReport, VideoCodec};
use crate::error::JdrError;
use byteorder::{LittleEndian, ReadBytesExt};
use chrono::{TimeZone, Utc};
use std::collections::HashMap;
use std::io::Write;
use std::ops::Range;
use std::path::Path;

const SIG: &[u8; 4] = b"1VEJ";
const BLOCK_ENTRY_LEN: u64 = 0x14;
const SLACK_PTR_OFFSET: u64 = 0xC8;

fn video_sigs(channel: ChannelLabel) -> [[u8; 4]; 2] {
    let id = channel.chunk_id();
    let mut vi = [0u8; 4];
    vi[..2].copy_from_slice(id.as_bytes());
    vi[2..].copy_from_slice(b"VI");
    let mut vp = [0u8; 4];
    vp[..2].copy_from_slice(id.as_bytes());
    vp[2..].copy_from_slice(b"VP");
    [vi, vp]
}

fn audio_sig(channel: ChannelLabel) -> [u8; 4] {
    let id = channel.chunk_id();
    let mut ad = [0u8; 4];
    ad[..2].copy_from_slice(id.as_bytes());
    ad[2..].copy_from_slice(b"AD");
    ad
}

/// Follow the `1VEJ` block-count + last-block-offset + slack-pointer chain
/// to split the file into `{ normal, slack }` (§4.7).
pub fn region_map(data: &[u8]) -> Result<JdrRegionMap, JdrError> {
    let sig_off = crate::scanner::find(data, SIG, 0).ok_or(JdrError::SignatureMissing)?;
    let count_offset = sig_off + 4;
    let total_blocks = read_u32(data, count_offset).ok_or(JdrError::PointerChainOutOfBounds)? as u64;
    if total_blocks == 0 {
        return Err(JdrError::PointerChainOutOfBounds);
    }

    let block_table_offset = count_offset + 4 + BLOCK_ENTRY_LEN * (total_blocks - 1);
    let last_block_offset_raw = read_u32(data, block_table_offset).ok_or(JdrError::PointerChainOutOfBounds)? as u64;
    let last_block_offset = last_block_offset_raw >> 4;

    let slack_ptr = last_block_offset
        .checked_add(SLACK_PTR_OFFSET)
        .ok_or(JdrError::PointerChainOutOfBounds)?;
    let slack_offset = read_u32(data, slack_ptr).ok_or(JdrError::PointerChainOutOfBounds)? as u64;

    let file_len = data.len() as u64;
    if slack_offset > file_len {
        return Err(JdrError::PointerChainOutOfBounds);
    }

    Ok(JdrRegionMap {
        normal: 0..slack_offset,
        slack: slack_offset..file_len,
    })
}

fn read_u32(data: &[u8], offset: u64) -> Option<u32> {
    let o = offset as usize;
    if o + 4 > data.len() {
        return None;
    }
    Some((&data[o..o + 4]).read_u32::<LittleEndian>().unwrap())
}

/// Detect codec: fixed-offset tag first, then a *real* byte-pattern vote
/// between H.264 SPS and HEVC VPS start codes (Open Question 2 — the
/// source's literal-string `data.count(b'\x00{2,3}x01\x67')` never matches
/// real NAL bytes; this performs genuine pattern counting instead).
pub fn detect_codec(data: &[u8]) -> VideoCodec {
    if data.len() >= 116 {
        match &data[112..116] {
            b"h264" | b"H264" => return VideoCodec::H264,
            b"hev1" | b"HEV1" => return VideoCodec::H265,
            _ => {}
        }
    }
    let hevc_hits = crate::scanner::count(data, b"\x00\x00\x01\x40")
        + crate::scanner::count(data, b"\x00\x00\x00\x01\x40");
    let h264_hits = crate::scanner::count(data, b"\x00\x00\x01\x67")
        + crate::scanner::count(data, b"\x00\x00\x00\x01\x67");
    if hevc_hits > h264_hits {
        VideoCodec::H265
    } else {
        VideoCodec::H264
    }
}

fn is_start_nal(payload: &[u8], codec: VideoCodec) -> bool {
    let want: &[u8] = match codec {
        VideoCodec::H264 => b"\x00\x00\x01\x67",
        VideoCodec::H265 => b"\x00\x00\x01\x40",
    };
    let want4: &[u8] = match codec {
        VideoCodec::H264 => b"\x00\x00\x00\x01\x67",
        VideoCodec::H265 => b"\x00\x00\x00\x01\x40",
    };
    payload.starts_with(want) || payload.starts_with(want4)
}

/// Parse the 20-byte timestamp header at `data[offset..offset+20]` per §4.7's
/// byte layout (`[4..6]`=year, `[6..8]`=month, `[10..12]`=day, `[12..14]`=hour,
/// `[14..16]`=minute, `[16..18]`=second, `[18..20]`=millisecond).
fn parse_timestamp(header: &[u8]) -> Option<chrono::DateTime<Utc>> {
    if header.len() < 20 {
        return None;
    }
    let rd = |a: usize, b: usize| u16::from_le_bytes([header[a], header[b]]);
    let year = rd(4, 5) as i32;
    let month = rd(6, 7) as u32;
    let day = rd(10, 11) as u32;
    let hour = rd(12, 13) as u32;
    let minute = rd(14, 15) as u32;
    let second = rd(16, 17) as u32;
    let msec = rd(18, 19) as u32;

    Utc.with_ymd_and_hms(year, month.max(1), day.max(1), hour, minute, second)
        .single()
        .map(|dt| dt + chrono::Duration::milliseconds(msec as i64))
}

struct RawChunk {
    timestamp: chrono::DateTime<Utc>,
    payload_start: usize,
    payload_end: usize,
}

/// Scan `region` for chunks matching any of `sigs`, enforcing size bounds and
/// rewinding the cursor to `idx + 4` on any validation failure — preserving
/// the source's exact cursor-advancement behavior (Open Question 3) so
/// recovered byte counts match regardless of embedded false-positive signatures.
fn scan_chunks(data: &[u8], region: &Range<u64>, sigs: &[[u8; 4]], cfg: &EngineConfig) -> Vec<RawChunk> {
    let mut out = Vec::new();
    let mut offset = region.start;
    let needles: Vec<&[u8]> = sigs.iter().map(|s| s.as_slice()).collect();

    while offset < region.end {
        let Some((_, idx)) = crate::scanner::find_first_of(data, &needles, offset) else { break };
        if idx >= region.end {
            break;
        }
        let header_start = idx as usize;
        if header_start + 8 > data.len() {
            break;
        }
        let size = (&data[header_start + 4..header_start + 8])
            .read_u32::<LittleEndian>()
            .unwrap() as u64;
        let payload_start = header_start as u64 + 8 + 20;
        let payload_end = payload_start + size.saturating_sub(20);
        let chunk_end = header_start as u64 + 8 + size;

        let in_bounds = chunk_end <= region.end && chunk_end as usize <= data.len();
        let size_ok = size > cfg.min_reasonable_chunk_size && size <= cfg.max_reasonable_chunk_size;

        if !size_ok || !in_bounds || size < 20 {
            offset = idx + 4;
            continue;
        }

        if let Some(ts) = parse_timestamp(&data[header_start + 8..header_start + 28]) {
            out.push(RawChunk {
                timestamp: ts,
                payload_start: payload_start as usize,
                payload_end: payload_end as usize,
            });
        }
        offset = chunk_end;
    }

    out
}

/// Split a channel's raw chunks into sessions: a session starts once the
/// codec-appropriate start NAL is seen, and ends (flushing) when a gap of
/// more than one second separates consecutive timestamps.
fn split_sessions(data: &[u8], chunks: &[RawChunk], codec: VideoCodec) -> Vec<ChunkGroup> {
    let mut sessions = Vec::new();
    let mut current: Option<ChunkGroup> = None;
    let mut found_start = false;
    let mut prev_ts: Option<chrono::DateTime<Utc>> = None;

    for c in chunks {
        let payload = &data[c.payload_start..c.payload_end.min(data.len())];

        if !found_start {
            if is_start_nal(payload, codec) {
                found_start = true;
                current = Some(ChunkGroup { first_timestamp: c.timestamp, bytes: Vec::new() });
            } else {
                continue;
            }
        } else if let Some(prev) = prev_ts {
            if (c.timestamp - prev).num_milliseconds() > 1000 {
                if let Some(g) = current.take() {
                    sessions.push(g);
                }
                found_start = is_start_nal(payload, codec);
                if !found_start {
                    prev_ts = Some(c.timestamp);
                    continue;
                }
                current = Some(ChunkGroup { first_timestamp: c.timestamp, bytes: Vec::new() });
            }
        }

        if let Some(group) = current.as_mut() {
            group.bytes.extend_from_slice(payload);
        }
        prev_ts = Some(c.timestamp);
    }

    if let Some(g) = current {
        sessions.push(g);
    }
    sessions
}

/// Infer FPS from the spacing between successive H.264-SPS-starting chunks,
/// defaulting to 30 when no sample is available.
pub fn calculate_fps(video_bytes: &[u8]) -> u32 {
    let starts: Vec<u64> = crate::scanner::iter_all(video_bytes, b"\x00\x00\x00\x01\x67").collect();
    if starts.len() < 2 {
        return 30;
    }
    let mut counts: HashMap<u64, u32> = HashMap::new();
    for w in starts.windows(2) {
        *counts.entry(w[1] - w[0]).or_insert(0) += 1;
    }
    counts.into_iter().max_by_key(|(_, n)| *n).map(|(gap, _)| gap as u32).unwrap_or(30)
}

/// Recover every channel's video sessions and the (single, first-seen) audio
/// sessions from one region (`normal` or `slack`).
pub struct RegionRecovery {
    pub video: HashMap<ChannelLabel, Vec<ChunkGroup>>,
    pub audio: Vec<ChunkGroup>,
    pub codec: VideoCodec,
}

pub fn recover_region(data: &[u8], region: &Range<u64>, cfg: &EngineConfig) -> RegionRecovery {
    let codec = detect_codec(data);
    let mut video = HashMap::new();
    let mut audio = Vec::new();
    let mut audio_saved = false;

    for channel in ChannelLabel::ALL {
        let chunks = scan_chunks(data, region, &video_sigs(channel), cfg);
        let sessions = split_sessions(data, &chunks, codec);
        video.insert(channel, sessions);

        if !audio_saved {
            let audio_chunks = scan_chunks(data, region, &[audio_sig(channel)], cfg);
            if !audio_chunks.is_empty() {
                audio = split_audio_sessions(data, &audio_chunks);
                audio_saved = true;
            }
        }
    }

    RegionRecovery { video, audio, codec }
}

/// Locate the slack region and recover each channel's concatenated session
/// bytes to its own file, used by the orchestrator's `.jdr` dispatch arm.
pub fn recover_slack_to_files(data: &[u8], cfg: &EngineConfig, out_dir: &Path) -> Result<Vec<(ChannelLabel, SlackReport)>, JdrError> {
    let regions = region_map(data)?;
    let recovery = recover_region(data, &regions.slack, cfg);
    let slack_len = regions.slack.end - regions.slack.start;

    std::fs::create_dir_all(out_dir)?;
    let mut out = Vec::new();
    for channel in ChannelLabel::ALL {
        let sessions = recovery.video.get(&channel).cloned().unwrap_or_default();
        let byte_count: usize = sessions.iter().map(|g| g.bytes.len()).sum();
        if byte_count == 0 {
            out.push((channel, SlackReport::failed()));
            continue;
        }

        let out_path = out_dir.join(format!("{}.h264", channel.name()));
        let mut file = std::fs::File::create(&out_path)?;
        for session in &sessions {
            file.write_all(&session.bytes)?;
        }

        out.push((
            channel,
            SlackReport {
                recovered: true,
                slack_size_bytes: byte_count as u64,
                slack_rate_pct: SlackReport::slack_rate(byte_count as u64, slack_len.max(data.len() as u64)),
                video_path: Some(out_path),
                image_path: None,
                is_image_fallback: false,
            },
        ));
    }
    Ok(out)
}

fn split_audio_sessions(data: &[u8], chunks: &[RawChunk]) -> Vec<ChunkGroup> {
    let mut sessions = Vec::new();
    let mut current: Option<ChunkGroup> = None;
    let mut prev_ts: Option<chrono::DateTime<Utc>> = None;

    for c in chunks {
        let payload = &data[c.payload_start..c.payload_end.min(data.len())];
        let gap_exceeded = prev_ts.map(|p| (c.timestamp - p).num_milliseconds() > 1000).unwrap_or(false);
        if current.is_none() || gap_exceeded {
            if let Some(g) = current.take() {
                sessions.push(g);
            }
            current = Some(ChunkGroup { first_timestamp: c.timestamp, bytes: Vec::new() });
        }
        current.as_mut().unwrap().bytes.extend_from_slice(payload);
        prev_ts = Some(c.timestamp);
    }
    if let Some(g) = current {
        sessions.push(g);
    }
    sessions
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block_table(total_blocks: u32, last_block_offset_raw: u32, slack_offset: u32, file_len: usize) -> Vec<u8> {
        let mut v = vec![0u8; file_len];
        v[0..4].copy_from_slice(SIG);
        v[4..8].copy_from_slice(&total_blocks.to_le_bytes());
        let block_table_offset = (8 + BLOCK_ENTRY_LEN * (total_blocks as u64 - 1)) as usize;
        v[block_table_offset..block_table_offset + 4].copy_from_slice(&last_block_offset_raw.to_le_bytes());
        let last_block_offset = (last_block_offset_raw >> 4) as usize;
        let slack_ptr = last_block_offset + SLACK_PTR_OFFSET as usize;
        v[slack_ptr..slack_ptr + 4].copy_from_slice(&slack_offset.to_le_bytes());
        v
    }

    #[test]
    fn region_map_follows_pointer_chain() {
        let data = block_table(2, 0x100, 2000, 4096);
        let map = region_map(&data).unwrap();
        assert_eq!(map.normal, 0..2000);
        assert_eq!(map.slack, 2000..4096);
    }

    #[test]
    fn region_map_rejects_missing_signature() {
        let data = vec![0u8; 128];
        assert!(region_map(&data).is_err());
    }

    #[test]
    fn timestamp_parses_documented_byte_layout() {
        let mut header = [0u8; 20];
        header[4..6].copy_from_slice(&2024u16.to_le_bytes());
        header[6..8].copy_from_slice(&6u16.to_le_bytes());
        header[10..12].copy_from_slice(&15u16.to_le_bytes());
        header[12..14].copy_from_slice(&9u16.to_le_bytes());
        header[14..16].copy_from_slice(&30u16.to_le_bytes());
        header[16..18].copy_from_slice(&0u16.to_le_bytes());
        header[18..20].copy_from_slice(&500u16.to_le_bytes());

        let ts = parse_timestamp(&header).unwrap();
        assert_eq!(ts.format("%Y-%m-%d %H:%M:%S%.3f").to_string(), "2024-06-15 09:30:00.500");
    }

    #[test]
    fn calculate_fps_defaults_to_30_without_samples() {
        assert_eq!(calculate_fps(&[]), 30);
    }

    #[test]
    fn calculate_fps_picks_mode_of_gaps() {
        let mut buf = Vec::new();
        let sps = b"\x00\x00\x00\x01\x67";
        for _ in 0..4 {
            buf.extend_from_slice(sps);
            buf.extend(std::iter::repeat_n(0xAAu8, 30));
        }
        assert_eq!(calculate_fps(&buf), 35);
    }

    #[test]
    fn recover_slack_to_files_writes_front_channel_stream() {
        let sps_payload = {
            let mut p = b"\x00\x00\x00\x01\x67".to_vec();
            p.extend(std::iter::repeat_n(0xAAu8, 15));
            p
        };
        let mut header = [0u8; 20];
        header[4..6].copy_from_slice(&2024u16.to_le_bytes());
        header[6..8].copy_from_slice(&6u16.to_le_bytes());
        header[10..12].copy_from_slice(&15u16.to_le_bytes());

        let mut chunk = b"00VI".to_vec();
        let size = 20 + sps_payload.len() as u32;
        chunk.extend_from_slice(&size.to_le_bytes());
        chunk.extend_from_slice(&header);
        chunk.extend_from_slice(&sps_payload);

        let slack_offset = 4096u32;
        let file_len = slack_offset as usize + chunk.len();
        let mut data = block_table(2, 0x100, slack_offset, file_len);
        let start = slack_offset as usize;
        data[start..start + chunk.len()].copy_from_slice(&chunk);

        let cfg = EngineConfig::default();
        let dir = tempfile::tempdir().unwrap();
        let results = recover_slack_to_files(&data, &cfg, dir.path()).unwrap();

        let front = results.iter().find(|(l, _)| *l == ChannelLabel::Front).unwrap();
        assert!(front.1.recovered, "{:?}", front.1);
        assert!(front.1.video_path.as_ref().unwrap().exists());

        let rear = results.iter().find(|(l, _)| *l == ChannelLabel::Rear).unwrap();
        assert!(!rear.1.recovered);
    }
}
