//! H.264/HEVC Annex-B start-code scanning and elementary-stream reassembly.

use crate::data_model::VideoCodec;
use crate::error::AnnexbError;
use std::io::Write;
use std::path::Path;

const START4: &[u8] = b"\x00\x00\x00\x01";
const START3: &[u8] = b"\x00\x00\x01";

/// Find the earlier of a 3-byte or 4-byte start code at or after `pos`.
/// Returns the offset of the start code itself and its length.
pub fn find_nal_start(buf: &[u8], pos: u64) -> Option<(u64, u8)> {
    let hit3 = crate::scanner::find(buf, START3, pos)?;
    // A 3-byte hit at `hit3` is actually a 4-byte start code if preceded by 0x00.
    if hit3 > 0 && buf[(hit3 - 1) as usize] == 0x00 {
        Some((hit3 - 1, 4))
    } else {
        Some((hit3, 3))
    }
}

fn nal_type_h264(byte0: u8) -> u8 {
    byte0 & 0x1F
}

fn nal_type_hevc(byte0: u8) -> u8 {
    (byte0 & 0x7E) >> 1
}

/// Walk NAL units in `raw`, collecting the parameter-set types for `codec`,
/// stopping as soon as the required set is complete.
pub fn extract_parameter_sets(raw: &[u8], codec: VideoCodec) -> Result<Vec<u8>, AnnexbError> {
    let wanted: &[u8] = match codec {
        VideoCodec::H264 => &[7, 8],       // SPS, PPS
        VideoCodec::H265 => &[32, 33, 34],  // VPS, SPS, PPS
    };

    let mut out = Vec::new();
    let mut seen = vec![false; wanted.len()];
    let mut pos = 0u64;
    let mut found_any = false;

    while let Some((start, prefix_len)) = find_nal_start(raw, pos) {
        found_any = true;
        let payload_start = (start + prefix_len as u64) as usize;
        if payload_start >= raw.len() {
            break;
        }
        let next = find_nal_start(raw, payload_start as u64)
            .map(|(s, _)| s as usize)
            .unwrap_or(raw.len());

        let ntype = match codec {
            VideoCodec::H264 => nal_type_h264(raw[payload_start]),
            VideoCodec::H265 => nal_type_hevc(raw[payload_start]),
        };

        if let Some(idx) = wanted.iter().position(|&t| t == ntype) {
            if !seen[idx] {
                seen[idx] = true;
                out.extend_from_slice(START4);
                out.extend_from_slice(&raw[payload_start..next]);
            }
        }

        if seen.iter().all(|&b| b) {
            break;
        }
        pos = next as u64;
    }

    if !found_any {
        return Err(AnnexbError::NoStartCodes);
    }
    Ok(out)
}

/// Write `param_sets` followed by every NAL unit in `raw`, each re-prefixed
/// with the start-code width it was originally found with. Fails soft:
/// an empty `param_sets` yields `(0, 0)` and no file is written.
pub fn write_elementary_stream(
    raw: &[u8],
    param_sets: &[u8],
    out_path: &Path,
) -> std::io::Result<(usize, usize)> {
    if param_sets.is_empty() {
        return Ok((0, 0));
    }

    let mut file = std::fs::File::create(out_path)?;
    file.write_all(param_sets)?;
    let mut byte_count = param_sets.len();
    let mut nal_count = 0usize;

    let mut pos = 0u64;
    while let Some((start, prefix_len)) = find_nal_start(raw, pos) {
        let payload_start = start + prefix_len as u64;
        let next = find_nal_start(raw, payload_start)
            .map(|(s, _)| s)
            .unwrap_or(raw.len() as u64);
        let prefix: &[u8] = if prefix_len == 4 { START4 } else { START3 };
        file.write_all(prefix)?;
        file.write_all(&raw[payload_start as usize..next as usize])?;
        byte_count += prefix.len() + (next - payload_start) as usize;
        nal_count += 1;
        pos = next;
    }

    Ok((nal_count, byte_count))
}
