use std::collections::HashMap;
use tempfile::tempdir;
use virex::config::EngineConfig;
use virex::data_model::ChannelLabel;
use virex::image_source::RawImageSource;
use virex::{carve, integrity, jdr, moov, slack_avi, slack_mp4, volume};

fn make_box(kind: &[u8; 4], payload: &[u8]) -> Vec<u8> {
    let size = 8 + payload.len() as u32;
    let mut v = Vec::new();
    v.extend_from_slice(&size.to_be_bytes());
    v.extend_from_slice(kind);
    v.extend_from_slice(payload);
    v
}

fn chunk(id: &str, payload: &[u8]) -> Vec<u8> {
    let mut v = id.as_bytes().to_vec();
    v.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    v.extend_from_slice(payload);
    v
}

fn riff_header(movi_payload: &[u8]) -> Vec<u8> {
    let mut movi_chunk = b"LIST".to_vec();
    movi_chunk.extend_from_slice(&(movi_payload.len() as u32).to_le_bytes());
    movi_chunk.extend_from_slice(movi_payload);

    let mut riff_payload = b"AVI ".to_vec();
    riff_payload.extend_from_slice(&movi_chunk);

    let mut buf = b"RIFF".to_vec();
    buf.extend_from_slice(&(riff_payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&riff_payload);
    buf
}

fn stco_box(offset: u32) -> Vec<u8> {
    let mut payload = vec![0u8; 4]; // version + flags
    payload.extend_from_slice(&1u32.to_be_bytes()); // entry_count
    payload.extend_from_slice(&offset.to_be_bytes());
    make_box(b"stco", &payload)
}

fn moov_with_stco(offset: u32) -> Vec<u8> {
    let stco = stco_box(offset);
    let stbl = make_box(b"stbl", &stco);
    let minf = make_box(b"minf", &stbl);
    let mdia = make_box(b"mdia", &minf);
    let trak = make_box(b"trak", &mdia);
    make_box(b"moov", &trak)
}

// scenario 1: healthy MP4, no slack, stco chunk offsets point into the single mdat.
#[test]
fn healthy_mp4_without_slack_has_no_recoverable_tail() {
    let ftyp = make_box(b"ftyp", &[0u8; 4]);
    // offset value doesn't change stco's byte length, so a placeholder pass
    // gives us the exact prefix length before mdat.
    let placeholder_moov = moov_with_stco(0);
    let prefix_len = (ftyp.len() + placeholder_moov.len()) as u32;
    let mdat_payload_offset = prefix_len + 8;

    let moov_bytes = moov_with_stco(mdat_payload_offset);
    assert_eq!(moov_bytes.len(), placeholder_moov.len());

    let mdat = make_box(b"mdat", &vec![0xABu8; 256]);

    let mut data = ftyp;
    data.extend(&moov_bytes);
    data.extend(&mdat);

    let report = integrity::analyze_mp4(&data);
    assert!(!report.damaged, "{:?}", report.reasons);

    let (moov_box, mdats) = moov::find_moov_and_mdats(&data);
    let moov_box = moov_box.unwrap();
    let offsets = moov::collect_chunk_offsets(&data, &moov_box);
    assert_eq!(offsets, vec![mdat_payload_offset as u64]);

    let normal_end = moov::compute_normal_end(data.len() as u64, Some(&moov_box), &mdats, &offsets);
    assert_eq!(normal_end, data.len() as u64);

    let cfg = EngineConfig::default();
    let dir = tempdir().unwrap();
    let report = slack_mp4::recover_mp4_slack(&data, &cfg, &dir.path().join("out.h264"));
    assert!(!report.recovered);
    assert_eq!(report.slack_rate_pct, 0.0);
}

fn avcc_box() -> Vec<u8> {
    let sps = [0x67u8, 0x42, 0x00];
    let pps = [0x68u8, 0xCE];
    let mut payload = vec![1u8, 0x42, 0x00, 0x1e, 0xff];
    payload.push(0xE1); // num_sps low 5 bits = 1
    payload.extend_from_slice(&(sps.len() as u16).to_be_bytes());
    payload.extend_from_slice(&sps);
    payload.push(1); // num_pps
    payload.extend_from_slice(&(pps.len() as u16).to_be_bytes());
    payload.extend_from_slice(&pps);
    make_box(b"avcC", &payload)
}

/// A size-prefixed H.264 I-frame per §4.8's frame-signature pattern: a 4-byte
/// big-endian size, then `<any><00 00 01><class><88 80>` plus filler.
fn sized_i_frame(class: u8, filler_len: usize) -> Vec<u8> {
    let mut payload = vec![0xFFu8, 0x00, 0x00, 0x01, class, 0x88, 0x80];
    payload.extend(std::iter::repeat_n(0xAAu8, filler_len));
    let mut v = (payload.len() as u32).to_be_bytes().to_vec();
    v.extend(payload);
    v
}

/// A size-prefixed H.264 P-frame: `<00 00><any><any><class><9A>` plus filler.
fn sized_p_frame(class: u8, filler_len: usize) -> Vec<u8> {
    let mut payload = vec![0x00u8, 0x00, 0xBB, 0xBB, class, 0x9A];
    payload.extend(std::iter::repeat_n(0xCCu8, filler_len));
    let mut v = (payload.len() as u32).to_be_bytes().to_vec();
    v.extend(payload);
    v
}

// scenario 2: MP4 with appended IDR/P/P slack past mdat's declared end.
#[test]
fn mp4_with_appended_nal_slack_recovers_elementary_stream() {
    let mut data = make_box(b"ftyp", &[0u8; 4]);
    data.extend(make_box(b"moov", &avcc_box()));
    data.extend(make_box(b"mdat", &[0u8; 64]));
    let file_len_before_slack = data.len() as u64;

    let mut slack = Vec::new();
    slack.extend(sized_i_frame(0x65, 20)); // IDR (I-frame)
    slack.extend(sized_p_frame(0x41, 20)); // P-frame
    slack.extend(sized_p_frame(0x41, 20)); // P-frame
    data.extend(&slack);

    let cfg = EngineConfig::default();
    let dir = tempdir().unwrap();
    let out = dir.path().join("out.h264");
    let report = slack_mp4::recover_mp4_slack(&data, &cfg, &out);

    assert!(report.recovered, "{:?}", report);
    assert_eq!(report.slack_size_bytes, data.len() as u64 - file_len_before_slack);
    let expected_rate = virex::data_model::SlackReport::slack_rate(report.slack_size_bytes, data.len() as u64);
    assert_eq!(report.slack_rate_pct, expected_rate);

    let written = std::fs::read(&out).unwrap();
    assert_eq!(&written[0..7], &[0, 0, 0, 1, 0x67, 0x42, 0x00]);
    assert_eq!(&written[7..13], &[0, 0, 0, 1, 0x68, 0xCE]);
}

// scenario 3: AVI with two channels past the declared RIFF end; only the
// channel whose slack begins with a start NAL (SPS) is recovered.
#[test]
fn avi_two_channels_front_recovers_rear_does_not() {
    let mut movi_payload = b"movi".to_vec();
    movi_payload.extend(chunk("00dc", &[0x06u8]));
    let mut data = riff_header(&movi_payload);

    let sps = {
        let mut p = vec![0x07u8];
        p.extend(std::iter::repeat_n(0xAAu8, 20));
        p
    };
    let idr = {
        let mut p = vec![0x05u8];
        p.extend(std::iter::repeat_n(0xBBu8, 20));
        p
    };
    data.extend(chunk("00dc", &sps));
    data.extend(chunk("00dc", &idr));

    // rear channel: only a non-IDR chunk (type 1) past the RIFF end, no start NAL.
    let non_idr = {
        let mut p = vec![0x21u8];
        p.extend(std::iter::repeat_n(0xCCu8, 20));
        p
    };
    data.extend(chunk("01dc", &non_idr));

    let cfg = EngineConfig::default();
    let dir = tempdir().unwrap();
    let results = slack_avi::recover_avi_slack(&data, &cfg, dir.path(), "clip").unwrap();

    let front = results.iter().find(|(l, _)| *l == ChannelLabel::Front).unwrap();
    assert!(front.1.recovered, "{:?}", front.1);

    let rear = results.iter().find(|(l, _)| *l == ChannelLabel::Rear).unwrap();
    assert!(!rear.1.recovered, "{:?}", rear.1);
}

// scenario 4: one FAT32-sized partition with a 2+ MiB trailing gap, carved
// and dumped by VolumeCarver.
#[test]
fn partition_image_trailing_gap_is_carved_and_dumped() {
    let sector_size = 512u64;
    let total_sectors = 20_480u64; // 10 MiB image
    let part_start = 0u64;
    let part_len = 16_384u64; // 8 MiB partition

    let mut mbr = vec![0u8; 512];
    mbr[0x1BE + 4] = 0x0c; // FAT32 LBA
    mbr[0x1BE + 8..0x1BE + 12].copy_from_slice(&(part_start as u32).to_le_bytes());
    mbr[0x1BE + 12..0x1BE + 16].copy_from_slice(&(part_len as u32).to_le_bytes());
    mbr[510] = 0x55;
    mbr[511] = 0xAA;

    let partitions = volume::parse_partition_table(&mbr).unwrap();
    assert_eq!(partitions.len(), 1);

    let cfg = EngineConfig { sector_size, tail_abs: 4 * 1024 * 1024, tail_ratio: 0.005, ..EngineConfig::default() };
    let gaps = volume::compute_gaps(&partitions, total_sectors, &cfg);
    assert_eq!(gaps.len(), 1);
    let gap = gaps[0].clone();
    assert_eq!(gap.start, part_start + part_len);
    assert!(gap.end < total_sectors, "trailing gap must exclude the reserved tail");

    let dir = tempdir().unwrap();
    let img_path = dir.path().join("image.dd");
    std::fs::write(&img_path, vec![0u8; (total_sectors * sector_size) as usize]).unwrap();
    let image = RawImageSource::open(&img_path).unwrap();

    let dumped = volume::dump_gaps(&image, &gaps, dir.path(), &cfg).unwrap();
    assert_eq!(dumped.len(), 1);
    assert_eq!(dumped[0].length, (gap.end - gap.start) * sector_size);
    assert!(dumped[0].file.exists());
}

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

// scenario 5: embedded AVI carved byte-exactly out of a padded raw dump.
#[test]
fn carver_finds_embedded_avi_inside_raw_bin_dump() {
    let avi = healthy_avi_bytes();
    let mut blob = vec![0u8; 1_048_576];
    blob.extend(&avi);
    blob.extend(vec![0u8; 4096]);

    let regions = carve::carve_avi_from_bin(&blob);
    assert_eq!(regions.len(), 1);
    assert_eq!(regions[0].kind, "avi");
    assert_eq!(regions[0].range.start, 1_048_576);
    assert_eq!(regions[0].range.end - regions[0].range.start, avi.len() as u64);

    let dir = tempdir().unwrap();
    let written = carve::write_carved_regions(&blob, &regions, dir.path()).unwrap();
    assert_eq!(written.len(), 1);
    let carved_bytes = std::fs::read(&written[0]).unwrap();
    assert_eq!(carved_bytes, avi);
}

fn ts_header(second: u16, msec: u16) -> [u8; 20] {
    let mut h = [0u8; 20];
    h[4..6].copy_from_slice(&2024u16.to_le_bytes());
    h[6..8].copy_from_slice(&6u16.to_le_bytes());
    h[10..12].copy_from_slice(&15u16.to_le_bytes());
    h[12..14].copy_from_slice(&9u16.to_le_bytes());
    h[14..16].copy_from_slice(&0u16.to_le_bytes());
    h[16..18].copy_from_slice(&second.to_le_bytes());
    h[18..20].copy_from_slice(&msec.to_le_bytes());
    h
}

fn jdr_chunk(second: u16, msec: u16, payload: &[u8]) -> Vec<u8> {
    let mut v = b"00VI".to_vec();
    let size = 20 + payload.len() as u32;
    v.extend_from_slice(&size.to_le_bytes());
    v.extend_from_slice(&ts_header(second, msec));
    v.extend_from_slice(payload);
    v
}

// scenario 6: two JDR recording sessions separated by a gap over one second.
#[test]
fn jdr_two_sessions_split_on_gap_over_one_second() {
    let sps_payload = {
        let mut p = b"\x00\x00\x00\x01\x67".to_vec();
        p.extend(std::iter::repeat_n(0xAAu8, 15));
        p
    };
    let filler_payload = vec![0xBBu8; 20];

    let mut data = Vec::new();
    data.extend(jdr_chunk(0, 0, &sps_payload)); // session 1 start
    data.extend(jdr_chunk(0, 500, &filler_payload)); // session 1 continues, 500ms later
    data.extend(jdr_chunk(3, 0, &sps_payload)); // 2.5s gap -> session 2 start
    data.extend(jdr_chunk(3, 300, &filler_payload)); // session 2 continues

    let cfg = EngineConfig::default();
    let region = 0..data.len() as u64;
    let recovery = jdr::recover_region(&data, &region, &cfg);

    let front_sessions: &Vec<_> = recovery.video.get(&ChannelLabel::Front).unwrap();
    assert_eq!(front_sessions.len(), 2);
    assert!(front_sessions[0].first_timestamp < front_sessions[1].first_timestamp);
    assert_eq!(front_sessions[0].bytes.len(), sps_payload.len() + filler_payload.len());
    assert_eq!(front_sessions[1].bytes.len(), sps_payload.len() + filler_payload.len());

    let _ = HashMap::<ChannelLabel, usize>::new(); // keep import honest if RegionRecovery shape changes
}
