//! Shared data pages and the fragments (segments) that reference them.

use fc_error::{FcError, Result};
use parking_lot::Mutex;
use std::sync::Arc;

/// Shared, interior-mutable byte buffer.
///
/// Cloning a `Page` yields another handle to the same bytes, so a bio, its
/// split children and a staging context can all reference one caller buffer.
#[derive(Clone)]
pub struct Page {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl Page {
    #[must_use]
    pub fn zeroed(len: usize) -> Self {
        Self::from_vec(vec![0_u8; len])
    }

    #[must_use]
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(bytes)),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy `out.len()` bytes starting at `offset` into `out`.
    pub fn read_at(&self, offset: usize, out: &mut [u8]) {
        let bytes = self.bytes.lock();
        let end = offset.saturating_add(out.len());
        if let Some(src) = bytes.get(offset..end) {
            out.copy_from_slice(src);
        } else {
            debug_assert!(false, "page read out of bounds: {offset}+{}", out.len());
        }
    }

    /// Copy `data` into the page starting at `offset`.
    pub fn write_at(&self, offset: usize, data: &[u8]) {
        let mut bytes = self.bytes.lock();
        let end = offset.saturating_add(data.len());
        if let Some(dst) = bytes.get_mut(offset..end) {
            dst.copy_from_slice(data);
        } else {
            debug_assert!(false, "page write out of bounds: {offset}+{}", data.len());
        }
    }

    pub fn fill(&self, byte: u8) {
        self.bytes.lock().fill(byte);
    }

    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }

    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.bytes, &other.bytes)
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

/// One fragment of a request's data: `len` bytes of `page` starting at `offset`.
#[derive(Debug, Clone)]
pub struct Segment {
    page: Page,
    offset: usize,
    len: usize,
}

impl Segment {
    pub fn new(page: Page, offset: usize, len: usize) -> Result<Self> {
        let end = offset
            .checked_add(len)
            .ok_or_else(|| FcError::InvalidArgument("segment range overflows".to_owned()))?;
        if len == 0 || end > page.len() {
            return Err(FcError::InvalidArgument(format!(
                "segment out of page bounds: offset={offset} len={len} page_len={}",
                page.len()
            )));
        }
        Ok(Self { page, offset, len })
    }

    /// Segment covering an entire page.
    #[must_use]
    pub fn whole(page: Page) -> Self {
        let len = page.len();
        Self {
            page,
            offset: 0,
            len,
        }
    }

    #[must_use]
    pub fn page(&self) -> &Page {
        &self.page
    }

    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Sub-fragment `[skip, skip + len)` of this segment.
    ///
    /// Callers derive `skip`/`len` from this segment's own length.
    #[must_use]
    pub fn slice(&self, skip: usize, len: usize) -> Self {
        debug_assert!(skip + len <= self.len);
        Self {
            page: self.page.clone(),
            offset: self.offset + skip,
            len,
        }
    }

    pub fn read_into(&self, out: &mut [u8]) {
        debug_assert_eq!(out.len(), self.len);
        self.page.read_at(self.offset, out);
    }

    pub fn write_from(&self, data: &[u8]) {
        debug_assert_eq!(data.len(), self.len);
        self.page.write_at(self.offset, data);
    }
}

/// Total byte length of a fragment list.
#[must_use]
pub fn segments_len(segments: &[Segment]) -> usize {
    segments.iter().map(Segment::len).sum()
}

/// Concatenate the bytes referenced by `segments`.
#[must_use]
pub fn gather(segments: &[Segment]) -> Vec<u8> {
    let mut out = vec![0_u8; segments_len(segments)];
    let mut pos = 0;
    for seg in segments {
        seg.read_into(&mut out[pos..pos + seg.len()]);
        pos += seg.len();
    }
    out
}

/// Distribute `data` over `segments` in order. `data` may be shorter than the
/// fragment list; trailing fragments are left untouched.
pub fn scatter(segments: &[Segment], data: &[u8]) {
    let mut pos = 0;
    for seg in segments {
        if pos >= data.len() {
            break;
        }
        let n = seg.len().min(data.len() - pos);
        seg.slice(0, n).write_from(&data[pos..pos + n]);
        pos += n;
    }
}

/// Byte cursor over a fragment list.
///
/// Tracks a position that may fall inside a fragment, so a consumer can take
/// `n` bytes as a fresh fragment list and the partially-consumed fragment is
/// carried into the next take.
#[derive(Debug, Clone)]
pub struct SegmentCursor<'a> {
    segments: &'a [Segment],
    index: usize,
    consumed: usize,
}

impl<'a> SegmentCursor<'a> {
    #[must_use]
    pub fn new(segments: &'a [Segment]) -> Self {
        Self {
            segments,
            index: 0,
            consumed: 0,
        }
    }

    /// Bytes left after the cursor.
    #[must_use]
    pub fn remaining(&self) -> usize {
        let rest: usize = self
            .segments
            .get(self.index..)
            .map_or(0, segments_len);
        rest.saturating_sub(self.consumed)
    }

    /// Take up to `bytes` bytes, emitting at most `max_pieces` fragments.
    pub fn take(&mut self, bytes: usize, max_pieces: usize) -> Vec<Segment> {
        let mut out = Vec::new();
        let mut want = bytes;
        while want > 0 && out.len() < max_pieces {
            let Some(seg) = self.segments.get(self.index) else {
                break;
            };
            let avail = seg.len() - self.consumed;
            let n = avail.min(want);
            out.push(seg.slice(self.consumed, n));
            want -= n;
            self.consumed += n;
            if self.consumed == seg.len() {
                self.index += 1;
                self.consumed = 0;
            }
        }
        out
    }

    /// Step the cursor back by `bytes`.
    pub fn rewind(&mut self, mut bytes: usize) {
        while bytes > 0 {
            if self.consumed == 0 {
                if self.index == 0 {
                    debug_assert!(false, "rewind past start of fragment list");
                    return;
                }
                self.index -= 1;
                self.consumed = self.segments[self.index].len();
            }
            let n = self.consumed.min(bytes);
            self.consumed -= n;
            bytes -= n;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn segment_rejects_out_of_bounds() {
        let page = Page::zeroed(4096);
        assert!(Segment::new(page.clone(), 4000, 200).is_err());
        assert!(Segment::new(page.clone(), 0, 0).is_err());
        assert!(Segment::new(page, 512, 512).is_ok());
    }

    #[test]
    fn cursor_carries_partial_fragment() {
        let a = Page::from_vec((0..=255).collect());
        let b = Page::from_vec(vec![7_u8; 100]);
        let segs = vec![Segment::whole(a), Segment::whole(b)];
        let mut cursor = SegmentCursor::new(&segs);
        assert_eq!(cursor.remaining(), 356);

        let first = cursor.take(200, 4);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].len(), 200);

        let second = cursor.take(100, 4);
        assert_eq!(second.len(), 2);
        assert_eq!(second[0].offset(), 200);
        assert_eq!(second[0].len(), 56);
        assert_eq!(second[1].len(), 44);
        assert_eq!(cursor.remaining(), 56);

        cursor.rewind(60);
        assert_eq!(cursor.remaining(), 116);
        // Back across the fragment boundary, 16 bytes short of its end.
        let third = cursor.take(10, 1);
        assert_eq!(third[0].offset(), 240);
        assert_eq!(third[0].len(), 10);
        assert_eq!(cursor.remaining(), 106);
    }

    #[test]
    fn gather_and_scatter_follow_fragment_order() {
        let p = Page::zeroed(8);
        let segs = vec![
            Segment::new(p.clone(), 4, 4).expect("seg"),
            Segment::new(p.clone(), 0, 4).expect("seg"),
        ];
        scatter(&segs, &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(p.to_vec(), vec![5, 6, 7, 8, 1, 2, 3, 4]);
        assert_eq!(gather(&segs), vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    proptest! {
        /// However the list is carved up, the takes reassemble it exactly.
        #[test]
        fn cursor_takes_reassemble_fragments(
            lens in prop::collection::vec(1_usize..300, 1..8),
            chunks in prop::collection::vec((1_usize..400, 1_usize..4), 1..32),
        ) {
            let mut next = 0_u8;
            let segs: Vec<Segment> = lens
                .iter()
                .map(|&len| {
                    let bytes = (0..len)
                        .map(|_| {
                            next = next.wrapping_add(1);
                            next
                        })
                        .collect();
                    Segment::whole(Page::from_vec(bytes))
                })
                .collect();
            let expected = gather(&segs);
            let mut cursor = SegmentCursor::new(&segs);
            let mut seen = Vec::new();
            for (bytes, max_pieces) in chunks {
                let piece = cursor.take(bytes, max_pieces);
                prop_assert!(piece.len() <= max_pieces);
                seen.extend(gather(&piece));
            }
            let rest = cursor.take(usize::MAX, usize::MAX);
            seen.extend(gather(&rest));
            prop_assert_eq!(cursor.remaining(), 0);
            prop_assert_eq!(seen, expected);
        }
    }
}
