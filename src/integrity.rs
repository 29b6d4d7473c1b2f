//! RIFF/ISO-BMFF conformance checks and damage classification (IntegrityAnalyzer).

use crate::boxwalk::{iter_boxes, iter_riff_chunks, list_type};
use crate::config::EngineConfig;
use crate::data_model::IntegrityReport;
use crate::error::IntegrityError;
use byteorder::{LittleEndian, ReadBytesExt};
use std::path::Path;

const VIDEO_SIGS: &[&[u8; 4]] = &[b"00dc", b"00db", b"01dc", b"01db", b"02dc", b"02db"];

/// Dispatch by lowercased file extension.
pub fn analyze(path: &Path, cfg: &EngineConfig) -> Result<IntegrityReport, IntegrityError> {
    let data = std::fs::read(path)?;
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|s| s.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "avi" => Ok(analyze_avi(&data, cfg)),
        "mp4" | "mov" | "m4v" => Ok(analyze_mp4(&data)),
        "jdr" => Ok(analyze_jdr(&data)),
        other => Err(IntegrityError::UnsupportedExtension(other.to_string())),
    }
}

pub fn analyze_avi(data: &[u8], cfg: &EngineConfig) -> IntegrityReport {
    let mut report = IntegrityReport::default();

    if data.len() < 12 || !(&data[0..4] == b"RIFF" || &data[0..4] == b"RF64") {
        report.push("[header] RIFF/RF64 signature missing");
        return report;
    }

    let declared_len = (&data[4..8]).read_u32::<LittleEndian>().unwrap() as u64 + 8;
    let actual_len = data.len() as u64;
    if declared_len > actual_len {
        report.push(format!(
            "[footer] file truncated (declared={declared_len}, actual={actual_len})"
        ));
    }
    let riff_end = declared_len.min(actual_len);

    let top_chunks = iter_riff_chunks(data, 12, riff_end);
    let movi = top_chunks
        .iter()
        .find(|c| list_type(data, c) == Some(*b"movi"));

    match movi {
        None => report.push("[required-chunk-missing] LIST('movi') not found"),
        Some(c) if c.payload_size <= 4 => report.push("[header] LIST('movi') size=0"),
        Some(_) => {}
    }

    let has_video_sig = VIDEO_SIGS.iter().any(|sig| crate::scanner::find(data, *sig, 0).is_some());
    if !has_video_sig {
        report.push("[no-video-data]");
    }

    if let Some(movi) = movi {
        let scan_start = movi.payload_start() + 4;
        let scan_end = movi.payload_end();
        if middle_scan_damaged(data, scan_start, scan_end, cfg) {
            report.push("[middle-damage]");
        }
    }

    // Anything in the top-level RIFF body besides JUNK/idx1/LIST after movi is footer damage.
    let trailing_unexpected = top_chunks
        .iter()
        .any(|c| !matches!(&c.fourcc, b"JUNK" | b"idx1" | b"LIST"));
    if trailing_unexpected {
        report.push("[footer] unexpected top-level chunk in RIFF body");
    }

    // Overflowing chunks anywhere in the declared body.
    if has_overflowing_chunk(data, 12, riff_end) {
        report.push("[middle-damage] body chunk size overflow");
    }

    // Bytes past the declared RIFF area that themselves overflow.
    if riff_end < actual_len && has_overflowing_chunk(data, riff_end, actual_len) {
        report.push("[footer] slack chunk overflow");
    }

    report
}

/// Any chunk in `[start, end)` whose declared size would straddle `end`.
fn has_overflowing_chunk(data: &[u8], start: u64, end: u64) -> bool {
    let mut offset = start;
    while offset + 8 <= end {
        let size = (&data[(offset + 4) as usize..(offset + 8) as usize])
            .read_u32::<LittleEndian>()
            .unwrap() as u64;
        let payload_end = offset + 8 + size;
        if payload_end > end {
            return true;
        }
        offset = if size % 2 == 1 { payload_end + 1 } else { payload_end };
    }
    false
}

fn middle_scan_damaged(data: &[u8], scan_start: u64, scan_end: u64, cfg: &EngineConfig) -> bool {
    let mut offset = scan_start;
    let mut last_good_end = scan_start;
    let mut damaged = false;

    while offset + 8 <= scan_end {
        let fourcc = &data[offset as usize..(offset + 4) as usize];
        let size = (&data[(offset + 4) as usize..(offset + 8) as usize])
            .read_u32::<LittleEndian>()
            .unwrap() as u64;
        let payload_start = offset + 8;
        let payload_end = payload_start + size;

        if payload_end > scan_end {
            damaged = true;
            break;
        }
        let next = if size % 2 == 1 { payload_end + 1 } else { payload_end };
        if next % 2 != 0 {
            damaged = true;
            break;
        }

        if VIDEO_SIGS.iter().any(|s| s.as_slice() == fourcc)
            && !(cfg.min_reasonable_chunk_size < size && size <= cfg.max_reasonable_chunk_size)
        {
            damaged = true;
            break;
        }

        last_good_end = next;
        offset = next;
    }

    if offset < scan_end {
        // parsing exited early: check whether a video signature is reachable
        // within UNKNOWN_GAP_MIN bytes of where we stopped.
        let probe_end = (last_good_end + cfg.unknown_gap_min).min(scan_end);
        let reachable = VIDEO_SIGS
            .iter()
            .any(|s| crate::scanner::find(data, s.as_slice(), last_good_end).is_some_and(|p| p < probe_end));
        if !reachable {
            damaged = true;
        }
    }

    damaged
}

pub fn analyze_mp4(data: &[u8]) -> IntegrityReport {
    let mut report = IntegrityReport::default();
    let boxes = iter_boxes(data, 0, data.len() as u64);

    match boxes.first() {
        Some(b) if b.kind_str() == "ftyp" && b.size > 0 => {}
        _ => report.push("[header] ftyp missing or not at offset 0"),
    }

    // moov validation is unconditional — never nested inside the ftyp branch
    // (Open Question 1: the two divergent source revisions are resolved here
    // in favor of independence).
    let moov = boxes.iter().find(|b| b.kind_str() == "moov");
    match moov {
        None => {
            if crate::scanner::find(data, b"moov", 0).is_some() {
                report.push("[damage] moov present but unparseable");
            } else {
                report.push("[required-chunk-missing] moov not found");
            }
        }
        Some(b) if b.size == 0 => report.push("[box-size-invalid] moov size=0"),
        Some(_) => {}
    }

    let mdats: Vec<_> = boxes.iter().filter(|b| b.kind_str() == "mdat").collect();
    if mdats.is_empty() {
        report.push("[required-chunk-missing] mdat not found");
    } else if mdats.iter().any(|b| b.size == 0) {
        report.push("[box-size-invalid] mdat size=0");
    }

    report
}

pub fn analyze_jdr(data: &[u8]) -> IntegrityReport {
    let mut report = IntegrityReport::default();
    if data.len() < 64 {
        report.push("[truncation] file shorter than minimum JDR header");
        return report;
    }
    match crate::jdr::region_map(data) {
        Ok(_) => {}
        Err(e) => report.push(format!("[header] {e}")),
    }
    report
}
