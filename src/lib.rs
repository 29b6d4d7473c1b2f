//! # virex — forensic recovery engine for dash-cam/CCTV video evidence
//!
//! Recovers video data that survives past where a container format's own
//! framing says the file ends: MP4/AVI slack appended after the declared
//! body, proprietary multi-channel JDR containers, and unallocated space at
//! the volume and filesystem level. Everything here operates on byte ranges
//! computed ahead of time; the only process this crate shells out to is the
//! external transcoder in [`transcode`], used purely to remux and probe,
//! never to decide what counts as recoverable.

pub mod annexb;
pub mod avi_channel;
pub mod boxwalk;
pub mod carve;
pub mod config;
pub mod data_model;
pub mod error;
pub mod fs_unalloc;
pub mod image_source;
pub mod integrity;
pub mod jdr;
pub mod moov;
pub mod orchestrator;
pub mod scanner;
pub mod slack_avi;
pub mod slack_mp4;
pub mod transcode;
pub mod volume;

pub use config::EngineConfig;
pub use data_model::{AnalysisRecord, ChannelLabel, SlackReport, VideoCodec};
pub use error::{EngineError, Tagged};
pub use image_source::{EwfSegmentedImageSource, ImageSource, RawImageSource};
pub use orchestrator::{CancelToken, ExtractMode};
