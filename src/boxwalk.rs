//! ISO-BMFF box iteration and RIFF chunk iteration (BoxWalker).

use crate::data_model::{BoxRef, ChunkRef, StructureNode};
use crate::error::BoxWalkError;
use byteorder::{BigEndian, LittleEndian, ReadBytesExt};
use std::io::Cursor;

/// Container box types that are descended into when building a structure tree.
const CONTAINER_TYPES: &[&[u8; 4]] = &[b"moov", b"trak", b"mdia", b"minf", b"stbl", b"edts", b"udta", b"mvex"];

fn is_container(kind: &[u8; 4]) -> bool {
    CONTAINER_TYPES.contains(&kind)
}

/// Read one box header at `offset` within `[start, end)`. Returns `None` once
/// iteration should stop (malformed boundary), matching §4.2's "terminates
/// iteration and signals the caller" contract via `Result`.
fn read_box_header(buf: &[u8], offset: u64, end: u64) -> Result<Option<BoxRef>, BoxWalkError> {
    if offset >= end {
        return Ok(None);
    }
    let remaining = end - offset;
    if remaining < 8 {
        return Ok(None);
    }
    let mut c = Cursor::new(&buf[offset as usize..(offset + 8) as usize]);
    let raw_size = c.read_u32::<BigEndian>().unwrap() as u64;
    let mut kind = [0u8; 4];
    kind.copy_from_slice(&buf[(offset + 4) as usize..(offset + 8) as usize]);

    let (size, header_len) = if raw_size == 1 {
        if remaining < 16 {
            return Ok(None);
        }
        let largesize = (&buf[(offset + 8) as usize..(offset + 16) as usize])
            .read_u64::<BigEndian>()
            .unwrap();
        (largesize, 16u8)
    } else if raw_size == 0 {
        (end - offset, 8u8)
    } else {
        (raw_size, 8u8)
    };

    if size < header_len as u64 {
        return Err(BoxWalkError::SizeTooSmall { size, header_len: header_len as u64 });
    }
    if offset + size > end {
        return Err(BoxWalkError::OutOfBounds { offset });
    }

    Ok(Some(BoxRef { offset, size, kind, header_len }))
}

/// Iterate top-level boxes in `[start, end)`. Stops silently (without error)
/// once a malformed box is hit — callers that need to know whether iteration
/// was cut short should inspect the returned vector's coverage themselves.
pub fn iter_boxes(buf: &[u8], start: u64, end: u64) -> Vec<BoxRef> {
    let mut out = Vec::new();
    let mut offset = start;
    while offset < end {
        match read_box_header(buf, offset, end) {
            Ok(Some(b)) => {
                offset = b.end();
                out.push(b);
            }
            _ => break,
        }
    }
    out
}

/// One level of the explicit-stack walk in [`build_structure_tree`]: the
/// sibling boxes at this nesting depth, how far we've gotten through them,
/// and the nodes built so far at this depth.
struct TreeFrame {
    boxes: Vec<BoxRef>,
    index: usize,
    nodes: Vec<StructureNode>,
}

/// Build a non-recursive (explicit-stack) structure tree, descending into
/// container box types (§9: tree instead of a flat string list).
pub fn build_structure_tree(buf: &[u8], start: u64, end: u64) -> Vec<StructureNode> {
    let mut stack = vec![TreeFrame { boxes: iter_boxes(buf, start, end), index: 0, nodes: Vec::new() }];

    loop {
        if stack.last().unwrap().index >= stack.last().unwrap().boxes.len() {
            let finished = stack.pop().unwrap();
            match stack.last_mut() {
                Some(parent) => parent.nodes.last_mut().unwrap().children = finished.nodes,
                None => return finished.nodes,
            }
            continue;
        }

        let frame = stack.last_mut().unwrap();
        let b = frame.boxes[frame.index];
        frame.index += 1;
        frame.nodes.push(StructureNode { kind: b.kind_str(), offset: b.offset, size: b.size, children: Vec::new() });

        if is_container(&b.kind) {
            stack.push(TreeFrame { boxes: iter_boxes(buf, b.offset + b.header_len as u64, b.end()), index: 0, nodes: Vec::new() });
        }
    }
}

/// Read one RIFF chunk header at `offset`. `None` once data is exhausted or malformed.
pub fn read_riff_chunk(buf: &[u8], offset: u64, end: u64) -> Option<ChunkRef> {
    if offset + 8 > end {
        return None;
    }
    let mut fourcc = [0u8; 4];
    fourcc.copy_from_slice(&buf[offset as usize..(offset + 4) as usize]);
    let payload_size = (&buf[(offset + 4) as usize..(offset + 8) as usize])
        .read_u32::<LittleEndian>()
        .unwrap();
    let c = ChunkRef { offset, payload_size, fourcc };
    if c.payload_end() > end {
        return None;
    }
    Some(c)
}

/// Iterate RIFF chunks within `[start, end)`, stopping at the first malformed chunk.
pub fn iter_riff_chunks(buf: &[u8], start: u64, end: u64) -> Vec<ChunkRef> {
    let mut out = Vec::new();
    let mut offset = start;
    while offset < end {
        match read_riff_chunk(buf, offset, end) {
            Some(c) => {
                offset = c.next_offset();
                out.push(c);
            }
            None => break,
        }
    }
    out
}

/// The 4-byte list type carried in the first 4 payload bytes of a `LIST` chunk.
pub fn list_type(buf: &[u8], chunk: &ChunkRef) -> Option<[u8; 4]> {
    if &chunk.fourcc != b"LIST" || chunk.payload_size < 4 {
        return None;
    }
    let start = chunk.payload_start() as usize;
    let mut t = [0u8; 4];
    t.copy_from_slice(&buf[start..start + 4]);
    Some(t)
}
