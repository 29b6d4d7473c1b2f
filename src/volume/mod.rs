//! Partition table parsing and inter-partition gap dumping (VolumeCarver).

use crate::config::EngineConfig;
use crate::data_model::{Gap, GapKind, PartitionEntry};
use crate::error::VolumeError;
use crate::image_source::ImageSource;
use byteorder::{LittleEndian, ReadBytesExt};
use std::path::Path;

const MBR_SIGNATURE_OFFSET: usize = 510;
const MBR_TABLE_OFFSET: usize = 0x1BE;
const MBR_ENTRY_LEN: usize = 16;
const GPT_PROTECTIVE_TYPE: u8 = 0xEE;

/// Parse the 4 primary MBR entries. A GPT-protective MBR (type `0xEE`) is
/// reported as one allocated partition spanning the whole declared region;
/// full GPT header/entry-array parsing is out of scope (§9 Non-goal).
pub fn parse_partition_table(mbr: &[u8]) -> Result<Vec<PartitionEntry>, VolumeError> {
    if mbr.len() < 512 || mbr[MBR_SIGNATURE_OFFSET..MBR_SIGNATURE_OFFSET + 2] != [0x55, 0xAA] {
        return Err(VolumeError::NoPartitionTable);
    }

    let mut entries = Vec::new();
    for i in 0..4 {
        let base = MBR_TABLE_OFFSET + i * MBR_ENTRY_LEN;
        let entry = &mbr[base..base + MBR_ENTRY_LEN];
        let ptype = entry[4];
        let lba_start = (&entry[8..12]).read_u32::<LittleEndian>().unwrap() as u64;
        let num_sectors = (&entry[12..16]).read_u32::<LittleEndian>().unwrap() as u64;

        if ptype == 0 && num_sectors == 0 {
            continue;
        }

        let desc = if ptype == GPT_PROTECTIVE_TYPE {
            "gpt-protective".to_string()
        } else {
            format!("mbr-type-0x{ptype:02x}")
        };
        entries.push(PartitionEntry { start_sector: lba_start, length_sectors: num_sectors, allocated: true, desc });
    }

    if entries.is_empty() {
        return Err(VolumeError::NoPartitionTable);
    }
    entries.sort_by_key(|p| p.start_sector);
    Ok(entries)
}

/// Inter-partition and leading/trailing unallocated sector ranges, with the
/// reserved tail (the smaller of `tail_abs` and `tail_ratio * image_size`)
/// excluded from whichever gap touches end-of-image.
pub fn compute_gaps(partitions: &[PartitionEntry], total_sectors: u64, cfg: &EngineConfig) -> Vec<std::ops::Range<u64>> {
    let image_bytes = total_sectors * cfg.sector_size;
    let ratio_reserved = (image_bytes as f64 * cfg.tail_ratio) as u64;
    let reserved_bytes = cfg.tail_abs.min(ratio_reserved);
    let reserved_sectors = reserved_bytes / cfg.sector_size.max(1);

    let mut gaps = Vec::new();
    let mut cursor = 0u64;
    for p in partitions {
        if p.start_sector > cursor {
            gaps.push(cursor..p.start_sector);
        }
        cursor = cursor.max(p.start_sector + p.length_sectors);
    }
    if cursor < total_sectors {
        let end = total_sectors.saturating_sub(reserved_sectors).max(cursor);
        if end > cursor {
            gaps.push(cursor..end);
        }
    }
    gaps.retain(|g| g.end > g.start);
    gaps
}

const DUMP_CHUNK: usize = 4 * 1024 * 1024;

/// Dump every gap to `NNN.bin` under `outdir`, returning the manifest entries
/// later serialized into `volume_slack.json`.
pub fn dump_gaps(
    image: &dyn ImageSource,
    gaps: &[std::ops::Range<u64>],
    outdir: &Path,
    cfg: &EngineConfig,
) -> Result<Vec<Gap>, VolumeError> {
    std::fs::create_dir_all(outdir)?;
    let mut out = Vec::new();

    for (idx, sector_range) in gaps.iter().enumerate() {
        let offset = sector_range.start * cfg.sector_size;
        let length = (sector_range.end - sector_range.start) * cfg.sector_size;
        let file_path = outdir.join(format!("{idx:03}.bin"));
        let mut file = std::fs::File::create(&file_path)?;

        let mut written = 0u64;
        while written < length {
            let take = DUMP_CHUNK.min((length - written) as usize);
            let buf = image.read_at(offset + written, take)?;
            if buf.is_empty() {
                break;
            }
            std::io::Write::write_all(&mut file, &buf)?;
            written += buf.len() as u64;
        }

        out.push(Gap { index: idx as u32, kind: GapKind::Gap, offset, length: written, file: file_path });
    }

    Ok(out)
}

/// Read the volume's leading 512 bytes to obtain the MBR for [`parse_partition_table`].
pub fn read_mbr(image: &dyn ImageSource) -> Result<Vec<u8>, VolumeError> {
    Ok(image.read_at(0, 512)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image_source::RawImageSource;
    use proptest::prelude::*;
    use tempfile::tempdir;

    fn mbr_with_entries(entries: &[(u8, u32, u32)]) -> Vec<u8> {
        let mut buf = vec![0u8; 512];
        for (i, (ptype, lba, count)) in entries.iter().enumerate() {
            let base = MBR_TABLE_OFFSET + i * MBR_ENTRY_LEN;
            buf[base + 4] = *ptype;
            buf[base + 8..base + 12].copy_from_slice(&lba.to_le_bytes());
            buf[base + 12..base + 16].copy_from_slice(&count.to_le_bytes());
        }
        buf[510] = 0x55;
        buf[511] = 0xAA;
        buf
    }

    #[test]
    fn parses_primary_partitions() {
        let mbr = mbr_with_entries(&[(0x83, 2048, 1000), (0, 0, 0), (0, 0, 0), (0, 0, 0)]);
        let parts = parse_partition_table(&mbr).unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].start_sector, 2048);
        assert_eq!(parts[0].length_sectors, 1000);
    }

    #[test]
    fn rejects_missing_signature() {
        let mbr = vec![0u8; 512];
        assert!(parse_partition_table(&mbr).is_err());
    }

    #[test]
    fn gaps_fill_space_between_and_before_partitions() {
        let parts = vec![PartitionEntry { start_sector: 100, length_sectors: 50, allocated: true, desc: String::new() }];
        let cfg = EngineConfig { tail_abs: 0, tail_ratio: 0.0, ..EngineConfig::default() };
        let gaps = compute_gaps(&parts, 200, &cfg);
        assert!(gaps.contains(&(0..100)));
        assert!(gaps.contains(&(150..200)));
    }

    #[test]
    #[allow(clippy::single_range_in_vec_init)] // one gap range is the realistic case here
    fn dump_gaps_writes_named_files() {
        let dir = tempdir().unwrap();
        let img_path = dir.path().join("img.dd");
        std::fs::write(&img_path, vec![0xABu8; 4096]).unwrap();
        let image = RawImageSource::open(&img_path).unwrap();
        let cfg = EngineConfig { sector_size: 512, ..EngineConfig::default() };
        let gaps = vec![0..2u64];
        let out = dump_gaps(&image, &gaps, dir.path(), &cfg).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].length, 1024);
        assert!(out[0].file.exists());
    }

    proptest! {
        #[test]
        fn gaps_plus_partitions_cover_the_whole_image_when_nothing_is_reserved(
            spans in prop::collection::vec((0u64..50, 1u64..50), 0..10),
            trailing_gap in 0u64..50,
        ) {
            let mut partitions = Vec::new();
            let mut cursor = 0u64;
            for (gap_before, len) in &spans {
                cursor += gap_before;
                partitions.push(PartitionEntry { start_sector: cursor, length_sectors: *len, allocated: true, desc: String::new() });
                cursor += len;
            }
            let total_sectors = cursor + trailing_gap;
            let cfg = EngineConfig { tail_abs: 0, tail_ratio: 0.0, ..EngineConfig::default() };

            let gaps = compute_gaps(&partitions, total_sectors, &cfg);
            let gap_sectors: u64 = gaps.iter().map(|g| g.end - g.start).sum();
            let partition_sectors: u64 = partitions.iter().map(|p| p.length_sectors).sum();
            prop_assert_eq!(gap_sectors + partition_sectors, total_sectors);
        }
    }
}
