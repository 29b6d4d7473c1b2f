//! `moov`/`mdat` location and boundary analysis, and avcC/hvcC parameter set
//! extraction (MoovParser).

use crate::boxwalk::iter_boxes;
use crate::data_model::{BoxRef, ParameterSets, VideoCodec};
use crate::error::MoovError;
use byteorder::{BigEndian, ReadBytesExt};

/// Find the `moov` box (last one wins when several exist) and every `mdat`.
pub fn find_moov_and_mdats(buf: &[u8]) -> (Option<BoxRef>, Vec<BoxRef>) {
    let top = iter_boxes(buf, 0, buf.len() as u64);
    let moov = top.iter().rfind(|b| b.kind_str() == "moov").copied();
    let mdats: Vec<BoxRef> = top.iter().filter(|b| b.kind_str() == "mdat").copied().collect();
    (moov, mdats)
}

/// Walk every `stco`/`co64` under `trak/mdia/minf/stbl`, returning sorted unique offsets.
pub fn collect_chunk_offsets(buf: &[u8], moov: &BoxRef) -> Vec<u64> {
    let mut offsets = Vec::new();
    collect_recursive(buf, moov.offset + moov.header_len as u64, moov.end(), &mut offsets);
    offsets.sort_unstable();
    offsets.dedup();
    offsets
}

fn collect_recursive(buf: &[u8], start: u64, end: u64, out: &mut Vec<u64>) {
    const DESCEND: &[&str] = &["trak", "mdia", "minf", "stbl", "edts", "udta", "mvex"];
    for b in iter_boxes(buf, start, end) {
        let kind = b.kind_str();
        if kind == "stco" {
            read_table(buf, &b, 4, out, false);
        } else if kind == "co64" {
            read_table(buf, &b, 8, out, true);
        } else if DESCEND.contains(&kind.as_str()) {
            collect_recursive(buf, b.offset + b.header_len as u64, b.end(), out);
        }
    }
}

fn read_table(buf: &[u8], b: &BoxRef, entry_size: u64, out: &mut Vec<u64>, is_64: bool) {
    let payload_start = b.offset + b.header_len as u64;
    // version(1) + flags(3) + entry_count(4)
    if payload_start + 8 > b.end() {
        return;
    }
    let entry_count = (&buf[(payload_start + 4) as usize..(payload_start + 8) as usize])
        .read_u32::<BigEndian>()
        .unwrap() as u64;
    let table_start = payload_start + 8;
    for i in 0..entry_count {
        let entry_off = table_start + i * entry_size;
        if entry_off + entry_size > b.end() {
            break;
        }
        let val = if is_64 {
            (&buf[entry_off as usize..(entry_off + 8) as usize])
                .read_u64::<BigEndian>()
                .unwrap()
        } else {
            (&buf[entry_off as usize..(entry_off + 4) as usize])
                .read_u32::<BigEndian>()
                .unwrap() as u64
        };
        out.push(val);
    }
}

/// `normal_end = max(moov_end, last_ref_mdat_end)`, clamped to `(0, file_len]`.
pub fn compute_normal_end(file_len: u64, moov: Option<&BoxRef>, mdats: &[BoxRef], offsets: &[u64]) -> u64 {
    let moov_end = moov.map(|m| m.end()).unwrap_or(0);

    let mut last_ref_mdat_end = 0u64;
    let mut any_recoverable = false;
    for &off in offsets {
        if let Some(m) = mdats.iter().find(|m| (m.offset..m.end()).contains(&off)) {
            any_recoverable = true;
            last_ref_mdat_end = last_ref_mdat_end.max(m.end());
        }
    }
    if !any_recoverable {
        last_ref_mdat_end = mdats.iter().map(|m| m.end()).max().unwrap_or(0);
    }

    let normal_end = moov_end.max(last_ref_mdat_end);
    normal_end.min(file_len)
}

/// Locate `avcC`, read SPS then PPS, emit Annex-B prefixed parameter sets.
pub fn extract_avc_parameter_sets(moov_bytes: &[u8]) -> Result<ParameterSets, MoovError> {
    let pos = crate::scanner::find(moov_bytes, b"avcC", 0).ok_or(MoovError::ParamSetsTruncated)?;
    let p = pos as usize;
    // avcC payload: [4:configurationVersion..][+6 from fourcc = skip to sps_len]
    let sps_len_off = p + 4 + 6;
    if sps_len_off + 2 > moov_bytes.len() {
        return Err(MoovError::ParamSetsTruncated);
    }
    let sps_len = u16::from_be_bytes([moov_bytes[sps_len_off], moov_bytes[sps_len_off + 1]]) as usize;
    let sps_start = sps_len_off + 2;
    let sps_end = sps_start + sps_len;
    if sps_end + 1 + 2 > moov_bytes.len() {
        return Err(MoovError::ParamSetsTruncated);
    }
    let pps_len_off = sps_end + 1;
    let pps_len = u16::from_be_bytes([moov_bytes[pps_len_off], moov_bytes[pps_len_off + 1]]) as usize;
    let pps_start = pps_len_off + 2;
    let pps_end = pps_start + pps_len;
    if pps_end > moov_bytes.len() {
        return Err(MoovError::ParamSetsTruncated);
    }

    let mut out = Vec::new();
    out.extend_from_slice(b"\x00\x00\x00\x01");
    out.extend_from_slice(&moov_bytes[sps_start..sps_end]);
    out.extend_from_slice(b"\x00\x00\x00\x01");
    out.extend_from_slice(&moov_bytes[pps_start..pps_end]);
    Ok(ParameterSets { codec: VideoCodec::H264, annexb_bytes: out })
}

/// Locate `hvcC`, walk its NALU arrays, emit every NALU Annex-B prefixed.
pub fn extract_hevc_parameter_sets(moov_bytes: &[u8]) -> Result<ParameterSets, MoovError> {
    let pos = crate::scanner::find(moov_bytes, b"hvcC", 0).ok_or(MoovError::ParamSetsTruncated)?;
    let p = pos as usize;
    let arrays_off = p + 4 + 22;
    if arrays_off + 1 > moov_bytes.len() {
        return Err(MoovError::ParamSetsTruncated);
    }
    let num_arrays = moov_bytes[arrays_off];
    let mut cursor = arrays_off + 1;
    let mut out = Vec::new();

    for _ in 0..num_arrays {
        if cursor + 3 > moov_bytes.len() {
            return Err(MoovError::ParamSetsTruncated);
        }
        // array header: 1 byte nal_type flags, 2 bytes num_nalus
        cursor += 1;
        let num_nalus = u16::from_be_bytes([moov_bytes[cursor], moov_bytes[cursor + 1]]);
        cursor += 2;
        for _ in 0..num_nalus {
            if cursor + 2 > moov_bytes.len() {
                return Err(MoovError::ParamSetsTruncated);
            }
            let nalu_len = u16::from_be_bytes([moov_bytes[cursor], moov_bytes[cursor + 1]]) as usize;
            cursor += 2;
            if cursor + nalu_len > moov_bytes.len() {
                return Err(MoovError::ParamSetsTruncated);
            }
            out.extend_from_slice(b"\x00\x00\x00\x01");
            out.extend_from_slice(&moov_bytes[cursor..cursor + nalu_len]);
            cursor += nalu_len;
        }
    }

    Ok(ParameterSets { codec: VideoCodec::H265, annexb_bytes: out })
}
