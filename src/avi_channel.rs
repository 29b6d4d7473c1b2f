//! Per-channel RIFF demultiplexing and codec sniffing (AviChannelSplitter).

use crate::config::EngineConfig;
use crate::data_model::{ChannelLabel, VideoCodec};
use byteorder::{LittleEndian, ReadBytesExt};

const START4: &[u8] = b"\x00\x00\x00\x01";

/// Detect codec from the fixed-offset tag first, falling back to a real
/// byte-pattern vote between H.264 SPS and HEVC VPS start codes (both the
/// 3-byte and 4-byte start-code forms are counted, matching the original's
/// `_guess_codec_by_signature`).
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

/// Boundary of the "main" RIFF-declared area: either the declared RIFF
/// length, or (for headerless slack dumps) the furthest valid channel chunk end.
pub fn guess_main_area_end(data: &[u8], cfg: &EngineConfig) -> u64 {
    if data.len() >= 8 && &data[0..4] == b"RIFF" {
        let total = (&data[4..8]).read_u32::<LittleEndian>().unwrap() as u64;
        return (8 + total).min(data.len() as u64);
    }

    let mut max_end = 0u64;
    for channel in ChannelLabel::ALL {
        let sig = format!("{}dc", channel.chunk_id()).into_bytes();
        let mut offset = 0u64;
        loop {
            let Some(idx) = crate::scanner::find(data, &sig, offset) else { break };
            if idx + 8 > data.len() as u64 {
                break;
            }
            let size = (&data[(idx + 4) as usize..(idx + 8) as usize])
                .read_u32::<LittleEndian>()
                .unwrap() as u64;
            let start = idx + 8;
            let end = start + size;

            if size > cfg.max_reasonable_chunk_size || size <= cfg.min_reasonable_chunk_size || end > data.len() as u64 {
                offset = idx + 4;
                continue;
            }
            max_end = max_end.max(end);
            offset = end;
        }
    }
    max_end
}

fn start_nal_types(codec: VideoCodec) -> &'static [u8] {
    match codec {
        VideoCodec::H264 => &[7],     // SPS
        VideoCodec::H265 => &[32],    // VPS
    }
}

fn valid_nal_types(codec: VideoCodec) -> &'static [u8] {
    match codec {
        VideoCodec::H264 => &[7, 8, 5, 1],          // SPS, PPS, IDR, non-IDR
        VideoCodec::H265 => &[32, 33, 34, 19, 20, 1], // VPS, SPS, PPS, IDR (2 types), TRAIL
    }
}

fn nal_type_of(chunk: &[u8], codec: VideoCodec) -> Option<u8> {
    // chunk payload begins directly with a NAL (no start code prefix in RIFF-embedded chunks).
    let first = *chunk.first()?;
    Some(match codec {
        VideoCodec::H264 => first & 0x1F,
        VideoCodec::H265 => (first & 0x7E) >> 1,
    })
}

/// Scan from `riff_end` onward collecting chunks whose NAL type is valid
/// once a "start" NAL has been seen, matching `split_channel_bytes`.
pub fn split_channel_bytes(
    data: &[u8],
    label: ChannelLabel,
    riff_end: u64,
    cfg: &EngineConfig,
) -> (Vec<u8>, usize, VideoCodec) {
    let codec = detect_codec(data);
    let starts = start_nal_types(codec);
    let valids = valid_nal_types(codec);
    let sig = format!("{}dc", label.chunk_id()).into_bytes();

    let mut out = Vec::new();
    let mut count = 0usize;
    let mut found = false;
    let mut offset = riff_end;

    loop {
        let Some(idx) = crate::scanner::find(data, &sig, offset) else { break };
        if idx + 8 > data.len() as u64 {
            break;
        }
        let size = (&data[(idx + 4) as usize..(idx + 8) as usize])
            .read_u32::<LittleEndian>()
            .unwrap() as u64;
        let start = idx + 8;
        let end = start + size;
        offset = end;

        if size > cfg.max_reasonable_chunk_size || size <= cfg.min_reasonable_chunk_size || end > data.len() as u64 {
            continue;
        }
        let chunk = &data[start as usize..end as usize];
        let Some(ntype) = nal_type_of(chunk, codec) else { continue };

        let accept = if !found {
            starts.contains(&ntype)
        } else {
            valids.contains(&ntype)
        };
        if accept {
            out.extend_from_slice(START4);
            out.extend_from_slice(chunk);
            found = true;
            count += 1;
        }
    }

    (out, count, codec)
}

/// Scan `[0, riff_end)` accepting every well-sized chunk, no NAL filter.
pub fn extract_full_channel_bytes(data: &[u8], label: ChannelLabel, riff_end: u64, cfg: &EngineConfig) -> Vec<u8> {
    let sig = format!("{}dc", label.chunk_id()).into_bytes();
    let mut out = Vec::new();
    let mut offset = 0u64;

    loop {
        let Some(idx) = crate::scanner::find(data, &sig, offset) else { break };
        if idx + 8 > riff_end {
            break;
        }
        let size = (&data[(idx + 4) as usize..(idx + 8) as usize])
            .read_u32::<LittleEndian>()
            .unwrap() as u64;
        let start = idx + 8;
        let end = start + size;

        if size > cfg.max_reasonable_chunk_size || size <= cfg.min_reasonable_chunk_size || end > riff_end {
            offset = idx + 4;
            continue;
        }
        out.extend_from_slice(START4);
        out.extend_from_slice(&data[start as usize..end as usize]);
        offset = end;
    }

    out
}
