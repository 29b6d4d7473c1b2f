//! Error taxonomy shared across every subsystem boundary.
//!
//! Each leaf error enum below corresponds to one component from the design
//! and carries a stable short tag (see module doc on [`Tagged`]) so the same
//! string that appears in a log line also appears in `analysis.json`.

use thiserror::Error;

/// Implemented by every error type in this crate; returns the stable tag
/// from the error taxonomy (io.*, format.*, parse.*, transcode.*, carve.*,
/// cancel, resource.disk_full).
pub trait Tagged {
    fn tag(&self) -> &'static str;
}

#[derive(Error, Debug)]
pub enum BoxWalkError {
    #[error("box size {size} smaller than header length {header_len}")]
    SizeTooSmall { size: u64, header_len: u64 },
    #[error("box at offset {offset} extends past end of range")]
    OutOfBounds { offset: u64 },
}

impl Tagged for BoxWalkError {
    fn tag(&self) -> &'static str {
        "format.box_invalid"
    }
}

#[derive(Error, Debug)]
pub enum IntegrityError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("unsupported file extension: {0}")]
    UnsupportedExtension(String),
}

impl Tagged for IntegrityError {
    fn tag(&self) -> &'static str {
        match self {
            IntegrityError::Io(_) => "io.read",
            IntegrityError::UnsupportedExtension(_) => "format.signature",
        }
    }
}

#[derive(Error, Debug)]
pub enum MoovError {
    #[error("no moov box found")]
    MoovMissing,
    #[error("avcC/hvcC parameter sets truncated")]
    ParamSetsTruncated,
}

impl Tagged for MoovError {
    fn tag(&self) -> &'static str {
        match self {
            MoovError::MoovMissing => "format.box_invalid",
            MoovError::ParamSetsTruncated => "parse.param_sets",
        }
    }
}

#[derive(Error, Debug)]
pub enum AviError {
    #[error("RIFF/AVI signature missing")]
    SignatureMissing,
    #[error("no chunk data for channel {0:?}")]
    ChannelEmpty(crate::data_model::ChannelLabel),
}

impl Tagged for AviError {
    fn tag(&self) -> &'static str {
        match self {
            AviError::SignatureMissing => "format.signature",
            AviError::ChannelEmpty(_) => "parse.param_sets",
        }
    }
}

#[derive(Error, Debug)]
pub enum AnnexbError {
    #[error("no NAL start codes found")]
    NoStartCodes,
}

impl Tagged for AnnexbError {
    fn tag(&self) -> &'static str {
        "parse.param_sets"
    }
}

#[derive(Error, Debug)]
pub enum JdrError {
    #[error("1VEJ signature not found")]
    SignatureMissing,
    #[error("block table pointer chain out of bounds")]
    PointerChainOutOfBounds,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Tagged for JdrError {
    fn tag(&self) -> &'static str {
        match self {
            JdrError::SignatureMissing => "format.signature",
            JdrError::PointerChainOutOfBounds => "format.box_invalid",
            JdrError::Io(_) => "io.write",
        }
    }
}

#[derive(Error, Debug)]
pub enum VolumeError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("no partition table found")]
    NoPartitionTable,
}

impl Tagged for VolumeError {
    fn tag(&self) -> &'static str {
        match self {
            VolumeError::Io(_) => "io.read",
            VolumeError::NoPartitionTable => "format.signature",
        }
    }
}

#[derive(Error, Debug)]
pub enum FsUnallocError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("not a FAT32 filesystem")]
    NotFat32,
}

impl Tagged for FsUnallocError {
    fn tag(&self) -> &'static str {
        match self {
            FsUnallocError::Io(_) => "io.read",
            FsUnallocError::NotFat32 => "format.signature",
        }
    }
}

#[derive(Error, Debug)]
pub enum CarveError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("no embeddable signature found")]
    NoSignature,
}

impl Tagged for CarveError {
    fn tag(&self) -> &'static str {
        match self {
            CarveError::Io(_) => "io.read",
            CarveError::NoSignature => "carve.no_signature",
        }
    }
}

#[derive(Error, Debug)]
pub enum TranscodeError {
    #[error("failed to spawn transcoder: {0}")]
    Spawn(std::io::Error),
    #[error("transcoder exited with status {0}")]
    NonZeroExit(i32),
    #[error("transcoder produced an empty output file")]
    EmptyOutput,
    #[error("no usable ffmpeg/ffprobe binary found")]
    BinaryNotFound,
}

impl Tagged for TranscodeError {
    fn tag(&self) -> &'static str {
        match self {
            TranscodeError::Spawn(_) | TranscodeError::BinaryNotFound => "transcode.spawn",
            TranscodeError::NonZeroExit(_) => "transcode.nonzero_exit",
            TranscodeError::EmptyOutput => "transcode.empty_output",
        }
    }
}

/// Top-level aggregate error returned by the orchestrator's fatal paths.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Volume(#[from] VolumeError),
    #[error(transparent)]
    FsUnalloc(#[from] FsUnallocError),
    #[error(transparent)]
    Carve(#[from] CarveError),
    #[error("insufficient scratch space: free={free} needed={needed}")]
    DiskFull { free: u64, needed: u64 },
    #[error("operation cancelled")]
    Cancelled,
    #[error("failed to open image: {0}")]
    ImageOpen(String),
}

impl Tagged for EngineError {
    fn tag(&self) -> &'static str {
        match self {
            EngineError::Io(_) => "io.read",
            EngineError::Json(_) => "io.write",
            EngineError::Volume(e) => e.tag(),
            EngineError::FsUnalloc(e) => e.tag(),
            EngineError::Carve(e) => e.tag(),
            EngineError::DiskFull { .. } => "resource.disk_full",
            EngineError::Cancelled => "cancel",
            EngineError::ImageOpen(_) => "io.open",
        }
    }
}
