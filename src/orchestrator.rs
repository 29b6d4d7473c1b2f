//! Top-level pipeline: discover candidate files, dispatch per-file analysis
//! and slack recovery across a bounded worker pool, emit NDJSON progress,
//! and assemble `analysis.json`.

use crate::config::EngineConfig;
use crate::data_model::{AnalysisDetail, AnalysisRecord, FileMeta, Gap, IntegrityReport, PartitionEntry};
use crate::error::EngineError;
use crate::fs_unalloc::{self, FilesystemWalk, NullFilesystemWalk};
use crate::image_source::{EwfSegmentedImageSource, ImageSource, RawImageSource};
use crate::volume;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// One NDJSON line emitted to stdout as work progresses. Parallel to, and
/// never derived from, the structured `log` crate output (§4.13).
#[derive(Serialize)]
#[serde(tag = "event")]
pub enum ProgressEvent<'a> {
    #[serde(rename = "file_started")]
    FileStarted { name: &'a str },
    #[serde(rename = "file_done")]
    FileDone { name: &'a str, damaged: bool },
    #[serde(rename = "slack_recovered")]
    SlackRecovered { name: &'a str, channel: Option<&'a str>, bytes: u64 },
    #[serde(rename = "cancelled")]
    Cancelled,
}

fn emit(event: &ProgressEvent) {
    if let Ok(line) = serde_json::to_string(event) {
        println!("{line}");
    }
}

/// Shared cancellation flag, checked at every per-file suspension point.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        CancelToken(Arc::new(AtomicBool::new(false)))
    }
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Run `analyze` (step 1 of the 7-step pipeline): integrity + structure for
/// every video file directly under `dir`.
pub fn analyze_directory(dir: &Path, cfg: &EngineConfig, cancel: &CancelToken) -> Result<Vec<AnalysisRecord>, EngineError> {
    let entries: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            matches!(
                p.extension().and_then(|e| e.to_str()).map(|s| s.to_ascii_lowercase()).as_deref(),
                Some("avi") | Some("mp4") | Some("mov") | Some("m4v") | Some("jdr")
            )
        })
        .collect();

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(cfg.resolved_worker_count())
        .build()
        .map_err(|e| EngineError::ImageOpen(e.to_string()))?;

    let cancel = cancel.clone();
    let results: Vec<AnalysisRecord> = pool.install(|| {
        use rayon::prelude::*;
        entries
            .par_iter()
            .filter_map(|path| {
                if cancel.is_cancelled() {
                    return None;
                }
                let name = path.file_name()?.to_string_lossy().into_owned();
                emit(&ProgressEvent::FileStarted { name: &name });

                let meta = std::fs::metadata(path).ok()?;
                let integrity = crate::integrity::analyze(path, cfg).unwrap_or_else(|e| {
                    let mut r = IntegrityReport::default();
                    r.push(e.to_string());
                    r
                });
                let structure = structure_listing(path);

                emit(&ProgressEvent::FileDone { name: &name, damaged: integrity.damaged });

                Some(AnalysisRecord {
                    name: name.clone(),
                    path: path.clone(),
                    size: meta.len(),
                    origin_video: None,
                    slack_info: Vec::new(),
                    channels: None,
                    analysis: AnalysisDetail { basic: FileMeta { size: meta.len(), ..Default::default() }, integrity, structure },
                })
            })
            .collect()
    });

    if cancel.is_cancelled() {
        emit(&ProgressEvent::Cancelled);
        return Err(EngineError::Cancelled);
    }
    Ok(results)
}

fn structure_listing(path: &Path) -> Vec<String> {
    let Ok(data) = std::fs::read(path) else { return Vec::new() };
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or_default().to_ascii_lowercase();
    match ext.as_str() {
        "mp4" | "mov" | "m4v" => crate::boxwalk::build_structure_tree(&data, 0, data.len() as u64)
            .iter()
            .flat_map(|n| n.render_flat())
            .collect(),
        "avi" if data.len() >= 12 && &data[0..4] == b"RIFF" => crate::boxwalk::iter_riff_chunks(&data, 12, data.len() as u64)
            .iter()
            .map(|c| format!("{} @{} size={}", String::from_utf8_lossy(&c.fourcc), c.offset, c.payload_size))
            .collect(),
        _ => Vec::new(),
    }
}

/// Write `value` as pretty JSON to `path`, via a sibling temp file renamed
/// into place so a concurrent reader never observes a partial write.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), EngineError> {
    let tmp_path = path.with_extension("json.tmp");
    let text = serde_json::to_string_pretty(value)?;
    std::fs::write(&tmp_path, text)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Run `extract` (steps 2-7): for every damaged candidate, recover slack
/// video (and, for AVI, per-channel streams) into `download_dir`.
pub fn extract_directory(
    dir: &Path,
    mode: ExtractMode,
    download_dir: &Path,
    cfg: &EngineConfig,
    cancel: &CancelToken,
) -> Result<Vec<AnalysisRecord>, EngineError> {
    std::fs::create_dir_all(download_dir)?;
    let records = analyze_directory(dir, cfg, cancel)?;

    let mut out = Vec::new();
    for record in records {
        if cancel.is_cancelled() {
            emit(&ProgressEvent::Cancelled);
            return Err(EngineError::Cancelled);
        }
        let path = record.path.clone();
        out.push(extract_one_record(record, &path, mode, download_dir, cfg));
    }

    Ok(out)
}

const MIN_FREE_BYTES_PAD: u64 = 1024 * 1024 * 1024;

fn open_image_source(image_path: &Path) -> Result<Box<dyn ImageSource>, EngineError> {
    let ext = image_path.extension().and_then(|e| e.to_str()).unwrap_or_default().to_ascii_lowercase();
    let is_ewf_segment = ext.len() == 3 && ext.starts_with('e') && ext[1..].chars().all(|c| c.is_ascii_digit());

    if is_ewf_segment {
        EwfSegmentedImageSource::open(image_path)
            .map(|s| Box::new(s) as Box<dyn ImageSource>)
            .map_err(|e| EngineError::ImageOpen(e.to_string()))
    } else {
        RawImageSource::open(image_path)
            .map(|s| Box::new(s) as Box<dyn ImageSource>)
            .map_err(|e| EngineError::ImageOpen(e.to_string()))
    }
}

/// Available bytes on the filesystem backing `path`, via `df`; `None` if the
/// call fails or its output can't be parsed (no platform-portable stdlib API exists).
fn available_space(path: &Path) -> Option<u64> {
    let output = std::process::Command::new("df").arg("-Pk").arg(path).output().ok()?;
    let text = String::from_utf8_lossy(&output.stdout);
    let line = text.lines().nth(1)?;
    let kb: u64 = line.split_whitespace().nth(3)?.parse().ok()?;
    Some(kb * 1024)
}

/// Step 2 of the image pipeline: reserve `<tempdir>/Virex_XXXXXX/`, aborting
/// if free space can't cover `image_size * 0.2 + 1 GB`.
fn reserve_work_dir(image_size: u64) -> Result<PathBuf, EngineError> {
    let needed = (image_size as f64 * 0.2) as u64 + MIN_FREE_BYTES_PAD;
    let base = std::env::temp_dir();
    if let Some(free) = available_space(&base) {
        if free < needed {
            emit_disk_full(free, needed);
            return Err(EngineError::DiskFull { free, needed });
        }
    }
    let dir = base.join(format!("Virex_{:06x}", std::process::id()));
    std::fs::create_dir_all(&dir)?;
    if let Ok(line) = serde_json::to_string(&serde_json::json!({ "tempDir": dir })) {
        println!("{line}");
    }
    Ok(dir)
}

fn emit_disk_full(free: u64, needed: u64) {
    if let Ok(line) = serde_json::to_string(&serde_json::json!({ "event": "disk_full", "free": free, "needed": needed })) {
        println!("{line}");
    }
}

#[derive(Serialize)]
struct VolumeSlackManifest {
    media_size: u64,
    sector_size: u64,
    partitions: Vec<PartitionEntry>,
    gaps: Vec<Gap>,
    allocated_total: u64,
    slack_total: u64,
}

#[derive(Serialize)]
struct FsUnallocManifest {
    block_size: u64,
    chunks: Vec<Gap>,
}

#[derive(Serialize, Default)]
struct CarvedIndex {
    carved_total: usize,
    rebuilt_total: usize,
    files: Vec<PathBuf>,
}

/// Steps 1-5 of the image pipeline: open the image, reserve a work directory,
/// detect the partition table, dump volume-level and per-partition slack, and
/// carve embedded containers out of both. Returns the work directory and the
/// list of carved candidate files, ready to feed into [`analyze_directory`]/
/// [`extract_directory`].
fn run_carving_pipeline(image_path: &Path, cfg: &EngineConfig) -> Result<(PathBuf, Vec<PathBuf>), EngineError> {
    let image = open_image_source(image_path)?;
    let image_size = image.size();
    let work_dir = reserve_work_dir(image_size)?;
    let total_sectors = image_size / cfg.sector_size.max(1);

    let partitions = match volume::read_mbr(image.as_ref()).ok().and_then(|mbr| volume::parse_partition_table(&mbr).ok()) {
        Some(parts) if !parts.is_empty() => parts,
        _ => vec![PartitionEntry { start_sector: 0, length_sectors: total_sectors, allocated: true, desc: "whole-image".to_string() }],
    };

    let vol_slack_dir = work_dir.join("vol_slack");
    let gap_sectors = volume::compute_gaps(&partitions, total_sectors, cfg);
    let gaps = volume::dump_gaps(image.as_ref(), &gap_sectors, &vol_slack_dir, cfg)?;
    let allocated_total: u64 = partitions.iter().map(|p| p.length_sectors * cfg.sector_size).sum();
    let slack_total: u64 = gaps.iter().map(|g| g.length).sum();
    write_json_atomic(
        &vol_slack_dir.join("volume_slack.json"),
        &VolumeSlackManifest {
            media_size: image_size,
            sector_size: cfg.sector_size,
            partitions: partitions.clone(),
            gaps,
            allocated_total,
            slack_total,
        },
    )?;
    if let Ok(line) = serde_json::to_string(&serde_json::json!({ "event": "vol_done", "entries": slack_total, "meta": vol_slack_dir.join("volume_slack.json") })) {
        println!("{line}");
    }

    let mut candidates = Vec::new();
    let carved_dir = work_dir.join("carved");
    let mut carved_index = CarvedIndex::default();
    if let Ok(files) = crate::carve::carve_everything(&vol_slack_dir, &carved_dir) {
        carved_index.carved_total += files.len();
        candidates.extend(files);
    }

    let null_walk = NullFilesystemWalk;
    for (idx, partition) in partitions.iter().enumerate().filter(|(_, p)| p.allocated) {
        let volume_offset = partition.start_sector * cfg.sector_size;
        let ranges = fs_unalloc::scan_fat32(image.as_ref(), volume_offset)
            .or_else(|_| null_walk.unallocated_ranges(image.as_ref(), volume_offset))
            .unwrap_or_default();

        let part_dir = work_dir.join("fs_unalloc").join(format!("{idx:03}"));
        let chunks = fs_unalloc::dump_ranges(image.as_ref(), &ranges, &part_dir, cfg)?;
        let chunk_bytes: u64 = chunks.iter().map(|c| c.length).sum();
        write_json_atomic(&part_dir.join("fs_unalloc.json"), &FsUnallocManifest { block_size: cfg.sector_size, chunks })?;
        if let Ok(line) = serde_json::to_string(&serde_json::json!({ "event": "fs_unalloc_done", "chunks": ranges.len(), "bytes": chunk_bytes })) {
            println!("{line}");
        }

        let fixed_dir = work_dir.join("carved_fixed").join(format!("{idx:03}"));
        if let Ok(files) = crate::carve::carve_everything(&part_dir, &fixed_dir) {
            carved_index.carved_total += files.len();
            candidates.extend(files);
        }
    }

    carved_index.rebuilt_total = candidates.len();
    carved_index.files = candidates.clone();
    write_json_atomic(&work_dir.join("carved_index.json"), &carved_index)?;
    if let Ok(line) = serde_json::to_string(&serde_json::json!({ "event": "carve_done", "carved_total": carved_index.carved_total, "rebuilt_total": carved_index.rebuilt_total })) {
        println!("{line}");
    }

    let recognized = candidates
        .into_iter()
        .filter(|p| matches!(p.extension().and_then(|e| e.to_str()).map(|s| s.to_ascii_lowercase()).as_deref(), Some("avi") | Some("mp4") | Some("jdr")))
        .collect();
    Ok((work_dir, recognized))
}

/// Run `analyze` (step 6-7 glued onto steps 1-5) against a raw/EWF image
/// file rather than an already-populated directory: carve candidate
/// containers out of volume slack and filesystem unalloc space, then analyze
/// each. Returns the work directory (whose `analysis.json` holds the result).
pub fn analyze_image(image_path: &Path, cfg: &EngineConfig, cancel: &CancelToken) -> Result<(PathBuf, Vec<AnalysisRecord>), EngineError> {
    let (work_dir, candidates) = run_carving_pipeline(image_path, cfg)?;
    let records = analyze_candidate_files(&candidates, cfg, cancel)?;
    write_json_atomic(&work_dir.join("analysis.json"), &records)?;
    Ok((work_dir, records))
}

/// Run `extract` against a raw/EWF image file: carve candidates, then run
/// the existing per-file slack-recovery dispatch on each into `download_dir`.
pub fn extract_image(
    image_path: &Path,
    mode: ExtractMode,
    download_dir: &Path,
    cfg: &EngineConfig,
    cancel: &CancelToken,
) -> Result<Vec<AnalysisRecord>, EngineError> {
    let (_work_dir, candidates) = run_carving_pipeline(image_path, cfg)?;
    std::fs::create_dir_all(download_dir)?;
    let mut out = Vec::new();
    for path in candidates {
        if cancel.is_cancelled() {
            emit(&ProgressEvent::Cancelled);
            return Err(EngineError::Cancelled);
        }
        let mut record = analyze_one_file(&path, cfg);
        record = extract_one_record(record, &path, mode, download_dir, cfg);
        out.push(record);
    }
    Ok(out)
}

fn analyze_candidate_files(paths: &[PathBuf], cfg: &EngineConfig, cancel: &CancelToken) -> Result<Vec<AnalysisRecord>, EngineError> {
    use rayon::prelude::*;
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(cfg.resolved_worker_count())
        .build()
        .map_err(|e| EngineError::ImageOpen(e.to_string()))?;
    let cancel = cancel.clone();
    let results: Vec<AnalysisRecord> = pool.install(|| {
        paths
            .par_iter()
            .filter_map(|path| {
                if cancel.is_cancelled() {
                    return None;
                }
                Some(analyze_one_file(path, cfg))
            })
            .collect()
    });
    if cancel.is_cancelled() {
        emit(&ProgressEvent::Cancelled);
        return Err(EngineError::Cancelled);
    }
    Ok(results)
}

fn analyze_one_file(path: &Path, cfg: &EngineConfig) -> AnalysisRecord {
    let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    emit(&ProgressEvent::FileStarted { name: &name });

    let meta = std::fs::metadata(path).ok();
    let integrity = crate::integrity::analyze(path, cfg).unwrap_or_else(|e| {
        let mut r = IntegrityReport::default();
        r.push(e.to_string());
        r
    });
    let structure = structure_listing(path);
    emit(&ProgressEvent::FileDone { name: &name, damaged: integrity.damaged });

    AnalysisRecord {
        name: name.clone(),
        path: path.to_path_buf(),
        size: meta.as_ref().map(|m| m.len()).unwrap_or(0),
        origin_video: None,
        slack_info: Vec::new(),
        channels: None,
        analysis: AnalysisDetail { basic: FileMeta { size: meta.map(|m| m.len()).unwrap_or(0), ..Default::default() }, integrity, structure },
    }
}

/// Shared extension-dispatch recovery step, used by both the directory-based
/// and image-based `extract` entry points.
fn extract_one_record(mut record: AnalysisRecord, path: &Path, mode: ExtractMode, download_dir: &Path, cfg: &EngineConfig) -> AnalysisRecord {
    if !record.analysis.integrity.damaged {
        return record;
    }
    let Ok(data) = std::fs::read(path) else { return record };
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or_default().to_ascii_lowercase();

    match ext.as_str() {
        "mp4" | "mov" | "m4v" if matches!(mode, ExtractMode::Video | ExtractMode::Both) => {
            let out_path = download_dir.join(format!("{}.recovered.h264", record.name));
            let report = crate::slack_mp4::recover_mp4_slack(&data, cfg, &out_path);
            if report.recovered {
                emit(&ProgressEvent::SlackRecovered { name: &record.name, channel: None, bytes: report.slack_size_bytes });
            }
            record.slack_info.push(report);
        }
        "avi" if matches!(mode, ExtractMode::Video | ExtractMode::Both) => {
            if let Ok(per_channel) = crate::slack_avi::recover_avi_slack(&data, cfg, download_dir, &record.name) {
                record.channels = Some(per_channel.iter().map(|(c, _)| *c).collect());
                for (channel, report) in per_channel {
                    if report.recovered {
                        emit(&ProgressEvent::SlackRecovered { name: &record.name, channel: Some(channel.name()), bytes: report.slack_size_bytes });
                    }
                    record.slack_info.push(report);
                }
            }
        }
        "jdr" if matches!(mode, ExtractMode::Video | ExtractMode::Both) => {
            let chan_dir = download_dir.join(&record.name);
            if let Ok(per_channel) = crate::jdr::recover_slack_to_files(&data, cfg, &chan_dir) {
                record.channels = Some(per_channel.iter().map(|(c, _)| *c).collect());
                for (channel, report) in per_channel {
                    if report.recovered {
                        emit(&ProgressEvent::SlackRecovered { name: &record.name, channel: Some(channel.name()), bytes: report.slack_size_bytes });
                    }
                    record.slack_info.push(report);
                }
            }
        }
        _ => {}
    }
    record
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum ExtractMode {
    Video,
    Frames,
    Both,
}
