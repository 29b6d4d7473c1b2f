//! Pure byte-search utilities (ByteScanner).
//!
//! Backed by a plain in-memory buffer for small inputs and by a memory map
//! for anything exceeding [`MMAP_THRESHOLD`], mirroring the scan-then-decode
//! pass the recovery scanner in the teacher crate performs over an archive —
//! here there is no archive framing, just raw bytes and needles.

use memmap2::Mmap;
use std::fs::File;
use std::io;
use std::ops::Deref;
use std::path::Path;

/// Files at or above this size are memory-mapped rather than read wholesale.
pub const MMAP_THRESHOLD: u64 = 64 * 1024 * 1024;

/// A byte source that is either a owned buffer or a memory map; `Deref`s to `[u8]`.
pub enum ByteSource {
    Owned(Vec<u8>),
    Mapped(Mmap),
}

impl Deref for ByteSource {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            ByteSource::Owned(v) => v,
            ByteSource::Mapped(m) => m,
        }
    }
}

/// Open `path`, mapping it if it is at least [`MMAP_THRESHOLD`] bytes.
pub fn open(path: &Path) -> io::Result<ByteSource> {
    let file = File::open(path)?;
    let len = file.metadata()?.len();
    if len >= MMAP_THRESHOLD {
        // SAFETY: the file is not expected to be concurrently truncated for the
        // duration of a scan; callers own exclusive forensic copies.
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(ByteSource::Mapped(mmap))
    } else {
        Ok(ByteSource::Owned(std::fs::read(path)?))
    }
}

/// First occurrence of `needle` in `haystack` at or after `start`.
pub fn find(haystack: &[u8], needle: &[u8], start: u64) -> Option<u64> {
    let start = start as usize;
    if start >= haystack.len() || needle.is_empty() {
        return None;
    }
    memmem(&haystack[start..], needle).map(|p| (start + p) as u64)
}

/// Among `needles`, return the earliest hit at or after `start` and which
/// needle index matched. Ties (same position) break on needle order.
pub fn find_first_of(haystack: &[u8], needles: &[&[u8]], start: u64) -> Option<(usize, u64)> {
    let mut best: Option<(usize, u64)> = None;
    for (idx, needle) in needles.iter().enumerate() {
        if let Some(pos) = find(haystack, needle, start) {
            best = match best {
                Some((_, best_pos)) if best_pos <= pos => best,
                _ => Some((idx, pos)),
            };
        }
    }
    best
}

/// Non-overlapping successive occurrences of `needle`, advancing by its length.
pub fn iter_all<'a>(haystack: &'a [u8], needle: &'a [u8]) -> impl Iterator<Item = u64> + 'a {
    let mut pos = 0u64;
    std::iter::from_fn(move || {
        let hit = find(haystack, needle, pos)?;
        pos = hit + needle.len() as u64;
        Some(hit)
    })
}

/// Count real occurrences of `needle` as a byte pattern, not as a substring of
/// a formatted representation (§9 Open Question 2: the source's
/// `data.count(b'\x00{2,3}x01\x67')` compares against a literal ASCII string
/// and never matches anything meaningful; every codec-vote in this crate goes
/// through this function instead).
pub fn count(haystack: &[u8], needle: &[u8]) -> usize {
    iter_all(haystack, needle).count()
}

/// One slot of a fixed-width byte-class pattern: an exact byte, a wildcard, or
/// a small allowed set. Used where a literal needle isn't expressive enough
/// (frame-signature patterns with wildcard/class bytes, §4.8).
#[derive(Clone, Copy)]
pub enum PatternByte {
    Literal(u8),
    Any,
    OneOf(&'static [u8]),
}

impl PatternByte {
    fn matches(&self, b: u8) -> bool {
        match self {
            PatternByte::Literal(want) => b == *want,
            PatternByte::Any => true,
            PatternByte::OneOf(set) => set.contains(&b),
        }
    }
}

fn pattern_matches_at(haystack: &[u8], pos: usize, pattern: &[PatternByte]) -> bool {
    pattern.iter().enumerate().all(|(k, slot)| slot.matches(haystack[pos + k]))
}

/// Non-overlapping successive start positions of `pattern` in `haystack`.
pub fn iter_pattern<'a>(haystack: &'a [u8], pattern: &'a [PatternByte]) -> impl Iterator<Item = usize> + 'a {
    let mut pos = 0usize;
    std::iter::from_fn(move || {
        while pos + pattern.len() <= haystack.len() {
            if pattern_matches_at(haystack, pos, pattern) {
                let hit = pos;
                pos += pattern.len();
                return Some(hit);
            }
            pos += 1;
        }
        None
    })
}

/// Count real occurrences of a byte-class `pattern` (see [`PatternByte`]).
pub fn count_pattern(haystack: &[u8], pattern: &[PatternByte]) -> usize {
    iter_pattern(haystack, pattern).count()
}

/// Naive-but-bounded substring search; `memchr`-accelerated on the first byte.
fn memmem(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    let first = needle[0];
    let mut i = 0;
    while i + needle.len() <= haystack.len() {
        match haystack[i..].iter().position(|&b| b == first) {
            Some(rel) => {
                let cand = i + rel;
                if cand + needle.len() > haystack.len() {
                    return None;
                }
                if &haystack[cand..cand + needle.len()] == needle {
                    return Some(cand);
                }
                i = cand + 1;
            }
            None => return None,
        }
    }
    None
}
