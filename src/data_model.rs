//! Shared value types flowing between components.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::path::PathBuf;

/// A byte range covered (or not covered) by a partition table entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionEntry {
    pub start_sector: u64,
    pub length_sectors: u64,
    pub allocated: bool,
    pub desc: String,
}

impl PartitionEntry {
    pub fn byte_range(&self, sector_size: u64) -> Range<u64> {
        let start = self.start_sector * sector_size;
        let end = (self.start_sector + self.length_sectors) * sector_size;
        start..end
    }
}

/// A dumped unallocated-space region, volume-level or filesystem-level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gap {
    pub index: u32,
    pub kind: GapKind,
    pub offset: u64,
    pub length: u64,
    pub file: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapKind {
    Gap,
    FsUnalloc,
}

/// An ISO-BMFF box reference, ephemeral — borrows from the scanned buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoxRef {
    pub offset: u64,
    pub size: u64,
    pub kind: [u8; 4],
    pub header_len: u8,
}

impl BoxRef {
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }

    pub fn kind_str(&self) -> String {
        String::from_utf8_lossy(&self.kind).into_owned()
    }
}

/// A RIFF chunk reference, ephemeral.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRef {
    pub offset: u64,
    pub payload_size: u32,
    pub fourcc: [u8; 4],
}

impl ChunkRef {
    pub fn payload_start(&self) -> u64 {
        self.offset + 8
    }

    pub fn payload_end(&self) -> u64 {
        self.payload_start() + self.payload_size as u64
    }

    /// RIFF chunks are padded to an even boundary.
    pub fn next_offset(&self) -> u64 {
        let end = self.payload_end();
        if self.payload_size % 2 == 1 {
            end + 1
        } else {
            end
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    H264,
    H265,
}

/// Extracted SPS/PPS (or VPS/SPS/PPS), Annex-B prefixed, ready to prepend to frames.
#[derive(Debug, Clone)]
pub struct ParameterSets {
    pub codec: VideoCodec,
    pub annexb_bytes: Vec<u8>,
}

impl ParameterSets {
    pub fn is_empty(&self) -> bool {
        self.annexb_bytes.is_empty()
    }
}

/// One of the three dash-cam channels; canonical chunk-id numeral per §4.7/§4.5.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelLabel {
    Front,
    Rear,
    Side,
}

impl ChannelLabel {
    pub const ALL: [ChannelLabel; 3] = [ChannelLabel::Front, ChannelLabel::Rear, ChannelLabel::Side];

    /// Two-digit channel id used as the chunk-id prefix (`00dc`, `01dc`, `02dc`, ...).
    pub fn chunk_id(&self) -> &'static str {
        match self {
            ChannelLabel::Front => "00",
            ChannelLabel::Rear => "01",
            ChannelLabel::Side => "02",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ChannelLabel::Front => "front",
            ChannelLabel::Rear => "rear",
            ChannelLabel::Side => "side",
        }
    }
}

/// Per-channel (AVI) or per-file (MP4) slack-recovery outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlackReport {
    pub recovered: bool,
    pub slack_size_bytes: u64,
    pub slack_rate_pct: f32,
    pub video_path: Option<PathBuf>,
    pub image_path: Option<PathBuf>,
    pub is_image_fallback: bool,
}

impl SlackReport {
    /// The canonical "nothing recovered" shape, used by every stage's failure path
    /// (§7 propagation policy: a failed stage returns its documented failure shape,
    /// it never propagates a bare error up through the pipeline).
    pub fn failed() -> Self {
        SlackReport {
            recovered: false,
            slack_size_bytes: 0,
            slack_rate_pct: 0.0,
            video_path: None,
            image_path: None,
            is_image_fallback: false,
        }
    }

    pub fn slack_rate(slack_size_bytes: u64, file_size: u64) -> f32 {
        if file_size == 0 {
            return 0.0;
        }
        let pct = (slack_size_bytes as f64 * 100.0) / file_size as f64;
        (pct * 100.0).round() as f32 / 100.0
    }
}

/// Result of [`crate::integrity::analyze`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub damaged: bool,
    pub reasons: Vec<String>,
}

impl IntegrityReport {
    pub fn push(&mut self, reason: impl Into<String>) {
        self.damaged = true;
        self.reasons.push(reason.into());
    }
}

/// `{ normal, slack }` byte ranges derived from a JDR `1VEJ` block table.
#[derive(Debug, Clone)]
pub struct JdrRegionMap {
    pub normal: Range<u64>,
    pub slack: Range<u64>,
}

/// A contiguous run of chunks belonging to one recording session.
#[derive(Debug, Clone)]
pub struct ChunkGroup {
    pub first_timestamp: DateTime<Utc>,
    pub bytes: Vec<u8>,
}

/// Optional filesystem timestamps, populated from `stat` or a TSK metadata
/// adapter — modeled explicitly rather than as a duck-typed attribute bag
/// (§9 redesign note).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileMeta {
    pub ctime: Option<DateTime<Utc>>,
    pub mtime: Option<DateTime<Utc>>,
    pub atime: Option<DateTime<Utc>>,
    pub size: u64,
}

/// A node in the rendered box/chunk structure tree (§9: tree instead of a
/// flat string list; tests assert on the tree, rendering happens only at
/// the JSON boundary).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructureNode {
    pub kind: String,
    pub offset: u64,
    pub size: u64,
    pub children: Vec<StructureNode>,
}

impl StructureNode {
    /// Render as an indented flat listing, for humans / for `analysis.json`.
    pub fn render_flat(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.render_into(0, &mut out);
        out
    }

    fn render_into(&self, depth: usize, out: &mut Vec<String>) {
        out.push(format!(
            "{}{} @{} size={}",
            "  ".repeat(depth),
            self.kind,
            self.offset,
            self.size
        ));
        for child in &self.children {
            child.render_into(depth + 1, out);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisDetail {
    pub basic: FileMeta,
    pub integrity: IntegrityReport,
    pub structure: Vec<String>,
}

/// One element of the top-level `analysis.json` array.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRecord {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
    pub origin_video: Option<PathBuf>,
    pub slack_info: Vec<SlackReport>,
    pub channels: Option<Vec<ChannelLabel>>,
    pub analysis: AnalysisDetail,
}
