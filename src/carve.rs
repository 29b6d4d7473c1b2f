//! Signature-scanning file carving over raw gap/unallocated dumps
//! (RecoveryCarver), and the top-level directory classification driver.

use crate::config::EngineConfig;
use crate::error::CarveError;
use std::path::{Path, PathBuf};

/// One carved candidate: container kind and its byte range within the source buffer.
pub struct CarvedRegion {
    pub kind: &'static str,
    pub range: std::ops::Range<u64>,
}

/// Carve AVI candidates: `RIFF`+`AVI ` signature, requiring both `hdrl` and
/// `movi` LIST chunks to appear before accepting a hit.
pub fn carve_avi_from_bin(data: &[u8]) -> Vec<CarvedRegion> {
    let mut out = Vec::new();
    let mut offset = 0u64;
    while let Some(riff_pos) = crate::scanner::find(data, b"RIFF", offset) {
        offset = riff_pos + 4;
        if riff_pos as usize + 12 > data.len() || &data[riff_pos as usize + 8..riff_pos as usize + 12] != b"AVI " {
            continue;
        }
        let search_window_end = (riff_pos + 4096).min(data.len() as u64);
        let window = &data[riff_pos as usize..search_window_end as usize];
        let has_hdrl = crate::scanner::find(window, b"hdrl", 0).is_some();
        let has_movi = crate::scanner::find(window, b"movi", 0).is_some();
        if !has_hdrl || !has_movi {
            continue;
        }
        let end = crate::avi_channel::guess_main_area_end(&data[riff_pos as usize..], &EngineConfig::default());
        out.push(CarvedRegion { kind: "avi", range: riff_pos..riff_pos + end.max(12) });
    }
    out
}

/// Carve MP4 candidates: every `ftyp` hit that is later followed by both
/// `moov` and `mdat` within the same box walk.
pub fn carve_mp4_from_bin(data: &[u8]) -> Vec<CarvedRegion> {
    let mut out = Vec::new();
    let mut offset = 0u64;
    while let Some(ftyp_tag) = crate::scanner::find(data, b"ftyp", offset) {
        offset = ftyp_tag + 4;
        if ftyp_tag < 4 {
            continue;
        }
        let box_start = ftyp_tag - 4;
        let boxes = crate::boxwalk::iter_boxes(data, box_start, data.len() as u64);
        let has_moov = boxes.iter().any(|b| b.kind_str() == "moov");
        let mdats: Vec<_> = boxes.iter().filter(|b| b.kind_str() == "mdat").collect();
        if !has_moov || mdats.is_empty() {
            continue;
        }
        let moov = boxes.iter().find(|b| b.kind_str() == "moov");
        let offsets: Vec<u64> = moov.map(|m| crate::moov::collect_chunk_offsets(data, m)).unwrap_or_default();
        let normal_end = crate::moov::compute_normal_end(
            data.len() as u64,
            moov,
            &mdats.into_iter().copied().collect::<Vec<_>>(),
            &offsets,
        );
        out.push(CarvedRegion { kind: "mp4", range: box_start..normal_end.max(box_start) });
    }
    out
}

/// Carve a raw Annex-B H.264/HEVC bitstream by scanning start codes,
/// requiring an SPS/VPS plus at least one IDR before accepting a region.
pub fn carve_jdr_annexb_from_bin(data: &[u8]) -> Vec<CarvedRegion> {
    let mut out = Vec::new();
    let mut pos = 0u64;
    let mut region_start: Option<u64> = None;
    let mut seen_param_set = false;
    let mut seen_idr = false;

    while let Some((start, prefix_len)) = crate::annexb::find_nal_start(data, pos) {
        let payload_off = (start + prefix_len as u64) as usize;
        if payload_off >= data.len() {
            break;
        }
        let first = data[payload_off];
        let h264_type = first & 0x1F;
        let hevc_type = (first & 0x7E) >> 1;

        if region_start.is_none() {
            region_start = Some(start);
        }
        if h264_type == 7 || hevc_type == 32 {
            seen_param_set = true;
        }
        if h264_type == 5 || hevc_type == 19 || hevc_type == 20 {
            seen_idr = true;
        }

        pos = payload_off as u64 + 1;
    }

    if let (Some(start), true, true) = (region_start, seen_param_set, seen_idr) {
        out.push(CarvedRegion { kind: "jdr-annexb", range: start..data.len() as u64 });
    }
    out
}

/// Write each carved region to `carved_<kind>_NNNN.<ext>` under `out_dir`.
pub fn write_carved_regions(data: &[u8], regions: &[CarvedRegion], out_dir: &Path) -> Result<Vec<PathBuf>, CarveError> {
    std::fs::create_dir_all(out_dir)?;
    let mut written = Vec::new();
    for (i, region) in regions.iter().enumerate() {
        let ext = match region.kind {
            "avi" => "avi",
            "mp4" => "mp4",
            _ => "h264",
        };
        let path = out_dir.join(format!("carved_{}_{:04}.{ext}", region.kind, i));
        let start = region.range.start as usize;
        let end = (region.range.end as usize).min(data.len());
        std::fs::write(&path, &data[start..end])?;
        written.push(path);
    }
    Ok(written)
}

/// Classify `base_dir`'s contents by which manifest files are present and
/// carve the corresponding `.bin` dumps, matching the source's directory-driven dispatch.
pub fn carve_everything(base_dir: &Path, out_dir: &Path) -> Result<Vec<PathBuf>, CarveError> {
    let has_manifest = |name: &str| base_dir.join(name).exists();
    let mut written = Vec::new();

    if has_manifest("partition_slack.json") || has_manifest("volume_slack.json") || has_manifest("unallocated_index.json") {
        let entries = std::fs::read_dir(base_dir)?;
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("bin") {
                continue;
            }
            let data = std::fs::read(&path)?;
            let mut regions = carve_avi_from_bin(&data);
            regions.extend(carve_mp4_from_bin(&data));
            regions.extend(carve_jdr_annexb_from_bin(&data));
            if regions.is_empty() {
                continue;
            }
            written.extend(write_carved_regions(&data, &regions, out_dir)?);
        }
    }

    if written.is_empty() && !base_dir.join("partition_slack.json").exists() {
        return Err(CarveError::NoSignature);
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn healthy_avi_bytes() -> Vec<u8> {
        let mut movi_payload = b"movi".to_vec();
        movi_payload.extend_from_slice(b"00dc");
        movi_payload.extend_from_slice(&4u32.to_le_bytes());
        movi_payload.extend_from_slice(&[1, 2, 3, 4]);

        let mut hdrl_payload = b"hdrl".to_vec();
        hdrl_payload.extend(std::iter::repeat_n(0u8, 8));

        let mut hdrl_chunk = b"LIST".to_vec();
        hdrl_chunk.extend_from_slice(&(hdrl_payload.len() as u32).to_le_bytes());
        hdrl_chunk.extend_from_slice(&hdrl_payload);

        let mut movi_chunk = b"LIST".to_vec();
        movi_chunk.extend_from_slice(&(movi_payload.len() as u32).to_le_bytes());
        movi_chunk.extend_from_slice(&movi_payload);

        let mut riff_payload = b"AVI ".to_vec();
        riff_payload.extend_from_slice(&hdrl_chunk);
        riff_payload.extend_from_slice(&movi_chunk);

        let mut buf = b"RIFF".to_vec();
        buf.extend_from_slice(&(riff_payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&riff_payload);
        buf
    }

    #[test]
    fn carves_embedded_avi_from_raw_dump() {
        let mut blob = vec![0xFFu8; 64];
        blob.extend(healthy_avi_bytes());
        blob.extend(vec![0x00u8; 32]);
        let regions = carve_avi_from_bin(&blob);
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].kind, "avi");
        assert_eq!(regions[0].range.start, 64);
    }

    #[test]
    fn carve_everything_errors_without_any_manifest() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("out");
        let err = carve_everything(dir.path(), &out);
        assert!(err.is_err());
    }
}
