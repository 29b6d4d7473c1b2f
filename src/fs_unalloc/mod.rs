//! Filesystem-level unallocated-cluster dumping (FsUnallocDumper).
//!
//! FAT32 gets a dedicated fast path that walks the FAT tables directly;
//! any other filesystem goes through [`FilesystemWalk`], whose only shipped
//! implementation ([`NullFilesystemWalk`]) reports no unallocated space —
//! a full TSK-equivalent walker for NTFS/ext4/APFS is out of scope (§9 Non-goal).

use crate::config::EngineConfig;
use crate::data_model::{Gap, GapKind};
use crate::error::FsUnallocError;
use crate::image_source::ImageSource;
use byteorder::{LittleEndian, ReadBytesExt};
use std::path::Path;

const FAT32_EOC_MIN: u32 = 0x0FFF_FFF8;
const FAT32_FREE: u32 = 0;

struct Bpb {
    bytes_per_sector: u32,
    sectors_per_cluster: u32,
    reserved_sectors: u32,
    num_fats: u32,
    fat_size_sectors: u32,
    total_sectors: u32,
}

fn parse_bpb(boot_sector: &[u8]) -> Result<Bpb, FsUnallocError> {
    if boot_sector.len() < 90 || boot_sector[510..512] != [0x55, 0xAA] {
        return Err(FsUnallocError::NotFat32);
    }
    let bytes_per_sector = u16::from_le_bytes([boot_sector[11], boot_sector[12]]) as u32;
    let sectors_per_cluster = boot_sector[13] as u32;
    let reserved_sectors = u16::from_le_bytes([boot_sector[14], boot_sector[15]]) as u32;
    let num_fats = boot_sector[16] as u32;
    let fat_size_16 = u16::from_le_bytes([boot_sector[22], boot_sector[23]]) as u32;
    let fat_size_32 = (&boot_sector[36..40]).read_u32::<LittleEndian>().unwrap();
    let total_sectors_16 = u16::from_le_bytes([boot_sector[19], boot_sector[20]]) as u32;
    let total_sectors_32 = (&boot_sector[32..36]).read_u32::<LittleEndian>().unwrap();

    if fat_size_16 != 0 || fat_size_32 == 0 || bytes_per_sector == 0 || sectors_per_cluster == 0 {
        return Err(FsUnallocError::NotFat32);
    }

    Ok(Bpb {
        bytes_per_sector,
        sectors_per_cluster,
        reserved_sectors,
        num_fats,
        fat_size_sectors: fat_size_32,
        total_sectors: if total_sectors_32 != 0 { total_sectors_32 } else { total_sectors_16 },
    })
}

/// Walk FAT32's first FAT table, accumulating runs of consecutive free
/// clusters into cluster-range gaps. `volume_offset` is the byte offset of
/// this filesystem's boot sector within the parent image.
pub fn scan_fat32(image: &dyn ImageSource, volume_offset: u64) -> Result<Vec<std::ops::Range<u64>>, FsUnallocError> {
    let boot_sector = image.read_at(volume_offset, 512)?;
    let bpb = parse_bpb(&boot_sector)?;

    let fat_start = volume_offset + bpb.reserved_sectors as u64 * bpb.bytes_per_sector as u64;
    let fat_bytes_len = bpb.fat_size_sectors as u64 * bpb.bytes_per_sector as u64;
    let fat = image.read_at(fat_start, fat_bytes_len as usize)?;

    let data_start_cluster2 = volume_offset
        + (bpb.reserved_sectors as u64 + bpb.num_fats as u64 * bpb.fat_size_sectors as u64) * bpb.bytes_per_sector as u64;
    let cluster_bytes = bpb.sectors_per_cluster as u64 * bpb.bytes_per_sector as u64;

    let total_clusters = (fat.len() / 4).min(
        ((bpb.total_sectors as u64).saturating_sub(bpb.reserved_sectors as u64 + bpb.num_fats as u64 * bpb.fat_size_sectors as u64)
            / bpb.sectors_per_cluster.max(1) as u64) as usize
            + 2,
    );

    let mut gaps = Vec::new();
    let mut run_start: Option<u64> = None;

    for cluster in 2..total_clusters as u32 {
        let entry_off = cluster as usize * 4;
        if entry_off + 4 > fat.len() {
            break;
        }
        let raw = (&fat[entry_off..entry_off + 4]).read_u32::<LittleEndian>().unwrap() & 0x0FFF_FFFF;
        let free = raw == FAT32_FREE && raw < FAT32_EOC_MIN;

        let cluster_offset = data_start_cluster2 + (cluster as u64 - 2) * cluster_bytes;
        match (free, run_start) {
            (true, None) => run_start = Some(cluster_offset),
            (false, Some(start)) => {
                gaps.push(start..cluster_offset);
                run_start = None;
            }
            _ => {}
        }
    }
    if let Some(start) = run_start {
        let end = data_start_cluster2 + (total_clusters as u64 - 2) * cluster_bytes;
        gaps.push(start..end);
    }

    Ok(gaps)
}

/// Degenerate filesystem-walk abstraction for filesystems without a
/// dedicated fast path.
pub trait FilesystemWalk {
    fn unallocated_ranges(&self, image: &dyn ImageSource, volume_offset: u64) -> Result<Vec<std::ops::Range<u64>>, FsUnallocError>;
}

/// Reports no unallocated space — used whenever the filesystem at
/// `volume_offset` isn't FAT32.
pub struct NullFilesystemWalk;

impl FilesystemWalk for NullFilesystemWalk {
    fn unallocated_ranges(&self, _image: &dyn ImageSource, _volume_offset: u64) -> Result<Vec<std::ops::Range<u64>>, FsUnallocError> {
        Ok(Vec::new())
    }
}

const DUMP_CHUNK: usize = 4 * 1024 * 1024;

/// Dump each unallocated cluster range to `NNN.bin`, returning manifest
/// entries for `fs_unalloc.json`.
pub fn dump_ranges(
    image: &dyn ImageSource,
    ranges: &[std::ops::Range<u64>],
    outdir: &Path,
    _cfg: &EngineConfig,
) -> Result<Vec<Gap>, FsUnallocError> {
    std::fs::create_dir_all(outdir)?;
    let mut out = Vec::new();

    for (idx, range) in ranges.iter().enumerate() {
        let length = range.end - range.start;
        let file_path = outdir.join(format!("{idx:03}.bin"));
        let mut file = std::fs::File::create(&file_path)?;

        let mut written = 0u64;
        while written < length {
            let take = DUMP_CHUNK.min((length - written) as usize);
            let buf = image.read_at(range.start + written, take)?;
            if buf.is_empty() {
                break;
            }
            std::io::Write::write_all(&mut file, &buf)?;
            written += buf.len() as u64;
        }

        out.push(Gap { index: idx as u32, kind: GapKind::FsUnalloc, offset: range.start, length: written, file: file_path });
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image_source::RawImageSource;
    use tempfile::tempdir;

    fn fat32_image(total_clusters: u32, free_clusters: &[u32]) -> Vec<u8> {
        let bytes_per_sector = 512u16;
        let sectors_per_cluster = 1u8;
        let reserved_sectors = 1u16;
        let num_fats = 1u8;
        let fat_size_32 = 1u32; // 1 sector = 128 FAT32 entries, enough for tests
        // cluster numbering starts at 2, so the data region only needs
        // `total_clusters - 2` cluster-sized sectors to reproduce exactly
        // `total_clusters` as the scanner's computed highest cluster index.
        let total_sectors_32 = reserved_sectors as u32 + fat_size_32 + (total_clusters - 2);

        let mut boot = vec![0u8; 512];
        boot[11..13].copy_from_slice(&bytes_per_sector.to_le_bytes());
        boot[13] = sectors_per_cluster;
        boot[14..16].copy_from_slice(&reserved_sectors.to_le_bytes());
        boot[16] = num_fats;
        boot[22..24].copy_from_slice(&0u16.to_le_bytes());
        boot[32..36].copy_from_slice(&total_sectors_32.to_le_bytes());
        boot[36..40].copy_from_slice(&fat_size_32.to_le_bytes());
        boot[510] = 0x55;
        boot[511] = 0xAA;

        let mut fat = vec![0u8; fat_size_32 as usize * bytes_per_sector as usize];
        for c in 2..total_clusters {
            let off = c as usize * 4;
            let val: u32 = if free_clusters.contains(&c) { 0 } else { 0x0FFF_FFF8 };
            fat[off..off + 4].copy_from_slice(&val.to_le_bytes());
        }

        let mut image = boot;
        image.extend(fat);
        image.extend(vec![0xCDu8; total_clusters as usize * bytes_per_sector as usize]);
        image
    }

    #[test]
    fn scan_fat32_finds_free_cluster_run() {
        let img_bytes = fat32_image(10, &[4, 5, 6]);
        let dir = tempdir().unwrap();
        let path = dir.path().join("fat.img");
        std::fs::write(&path, &img_bytes).unwrap();
        let image = RawImageSource::open(&path).unwrap();

        let gaps = scan_fat32(&image, 0).unwrap();
        assert_eq!(gaps.len(), 1);
        let cluster_bytes = 512u64;
        let data_start = (1 + 1) * 512u64;
        assert_eq!(gaps[0].start, data_start + (4 - 2) * cluster_bytes);
        assert_eq!(gaps[0].end, data_start + (7 - 2) * cluster_bytes);
    }

    #[test]
    fn null_walk_reports_nothing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("raw.img");
        std::fs::write(&path, vec![0u8; 512]).unwrap();
        let image = RawImageSource::open(&path).unwrap();
        let walker = NullFilesystemWalk;
        assert!(walker.unallocated_ranges(&image, 0).unwrap().is_empty());
    }
}
