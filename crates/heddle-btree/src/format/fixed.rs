//! The fixed record format
//!
//! Keys and values have a fixed length per tree, so a node is a header
//! followed by `count_rec` contiguous slots of `ksize + valsize` bytes in
//! key-ascending order. Frame layout (little-endian):
//!
//! ```text
//! offset  size  field
//!      0     4  header magic + version tag
//!      4     4  footer offset (always 32)
//!      8     4  node-type id
//!     12     4  tree-type id
//!     16     8  opaque back-pointer slot (in-memory only, never captured)
//!     24     2  used: keyed-record count
//!     26     1  shift: size class
//!     27     1  level: 0 at leaves
//!     28     2  ksize
//!     30     2  vsize (the tree's leaf value size, in every node)
//!     32     4  footer version
//!     36     8  footer checksum
//!     48     …  record slots
//! ```
//!
//! Internal nodes store segment addresses as values, so their slot unit is
//! `ksize + 8` regardless of the header's `vsize`, and they carry one more
//! slot than keyed records: the sentinel at index `used`, whose key region
//! is unused and whose value is the rightmost child.
//!
//! The footer checksum covers the header fields except the opaque slot,
//! so rebinding a descriptor never dirties the footer.

use super::{MoveEnd, MoveOutcome, MoveQuota, NodeFormat, Span};
use crate::error::FormatError;
use sha2::{Digest, Sha256};

/// Header magic + version tag of a fixed-format node
pub const HDR_MAGIC: u32 = 0x6864_6c31; // "hdl1"

/// Node-type id of the fixed format
pub const FIXED_NTYPE: u32 = 1;

/// Offset of the first record slot
pub const DATA_OFF: usize = 48;

/// Width of a child segment address inside internal-node slots
const ADDR_VSIZE: u16 = 8;

const OFF_MAGIC: usize = 0;
const OFF_FOOTER_OFF: usize = 4;
const OFF_NTYPE: usize = 8;
const OFF_TTYPE: usize = 12;
const OFF_OPAQUE: usize = 16;
const OFF_USED: usize = 24;
const OFF_SHIFT: usize = 26;
const OFF_LEVEL: usize = 27;
const OFF_KSIZE: usize = 28;
const OFF_VSIZE: usize = 30;
const OFF_FOOTER_VER: usize = 32;
const OFF_CSUM: usize = 36;

const FOOTER_OFF: u32 = OFF_FOOTER_VER as u32;
const FOOTER_VER: u32 = 1;
const MAX_LEVEL: u8 = 30;

fn rd_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes(buf[off..off + 2].try_into().unwrap())
}

fn rd_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(buf[off..off + 4].try_into().unwrap())
}

fn rd_u64(buf: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(buf[off..off + 8].try_into().unwrap())
}

fn wr_u16(buf: &mut [u8], off: usize, v: u16) {
    buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

fn wr_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

fn wr_u64(buf: &mut [u8], off: usize, v: u64) {
    buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

/// Checksum of the header fields, skipping the opaque slot and footer
fn header_csum(buf: &[u8]) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(&buf[OFF_MAGIC..OFF_OPAQUE]);
    hasher.update(&buf[OFF_USED..OFF_FOOTER_VER]);
    let digest = hasher.finalize();
    u64::from_le_bytes(digest[..8].try_into().unwrap())
}

/// The fixed-format vtable implementation
#[derive(Debug, Default)]
pub struct FixedFormat;

impl FixedFormat {
    /// Create the format
    pub fn new() -> FixedFormat {
        FixedFormat
    }

    fn unit(&self, buf: &[u8]) -> usize {
        let ksize = rd_u16(buf, OFF_KSIZE) as usize;
        ksize + self.valsize(buf) as usize
    }

    fn nphys(&self, buf: &[u8]) -> usize {
        self.count_rec(buf) as usize
    }

    fn slot_off(&self, buf: &[u8], idx: u16) -> usize {
        DATA_OFF + idx as usize * self.unit(buf)
    }

    fn capacity(&self, buf: &[u8]) -> usize {
        (buf.len() - DATA_OFF) / self.unit(buf)
    }
}

impl NodeFormat for FixedFormat {
    fn ntype(&self) -> u32 {
        FIXED_NTYPE
    }

    fn init(
        &self,
        buf: &mut [u8],
        shift: u8,
        level: u8,
        ksize: u16,
        vsize: u16,
        ttype: u32,
    ) -> Vec<Span> {
        wr_u32(buf, OFF_MAGIC, HDR_MAGIC);
        wr_u32(buf, OFF_FOOTER_OFF, FOOTER_OFF);
        wr_u32(buf, OFF_NTYPE, FIXED_NTYPE);
        wr_u32(buf, OFF_TTYPE, ttype);
        wr_u16(buf, OFF_USED, 0);
        buf[OFF_SHIFT] = shift;
        buf[OFF_LEVEL] = level;
        wr_u16(buf, OFF_KSIZE, ksize);
        wr_u16(buf, OFF_VSIZE, vsize);
        let mut spans = vec![Span::new(OFF_MAGIC, OFF_OPAQUE), Span::new(OFF_USED, 8)];
        spans.extend(self.seal(buf));
        spans
    }

    fn fini(&self, buf: &mut [u8]) -> Vec<Span> {
        wr_u32(buf, OFF_MAGIC, 0);
        vec![Span::new(OFF_MAGIC, 4)]
    }

    fn validate(&self, buf: &[u8]) -> std::result::Result<(), FormatError> {
        if buf.len() < DATA_OFF {
            return Err(FormatError::Unusable {
                ksize: 0,
                vsize: 0,
                size: buf.len(),
            });
        }
        let geometry = || FormatError::Unusable {
            ksize: rd_u16(buf, OFF_KSIZE),
            vsize: rd_u16(buf, OFF_VSIZE),
            size: buf.len(),
        };
        let magic = rd_u32(buf, OFF_MAGIC);
        if magic != HDR_MAGIC {
            return Err(FormatError::BadMagic { found: magic });
        }
        let shift = buf[OFF_SHIFT];
        if rd_u32(buf, OFF_FOOTER_OFF) != FOOTER_OFF
            || !(heddle_seg::MIN_SHIFT..=heddle_seg::MAX_SHIFT).contains(&shift)
            || 1usize << shift != buf.len()
            || buf[OFF_LEVEL] > MAX_LEVEL
            || rd_u16(buf, OFF_KSIZE) == 0
            || rd_u16(buf, OFF_VSIZE) == 0
        {
            return Err(geometry());
        }
        if rd_u32(buf, OFF_FOOTER_VER) != FOOTER_VER || rd_u64(buf, OFF_CSUM) != header_csum(buf)
        {
            return Err(FormatError::BadChecksum);
        }
        if self.nphys(buf) > self.capacity(buf) {
            return Err(geometry());
        }
        Ok(())
    }

    fn count(&self, buf: &[u8]) -> u16 {
        rd_u16(buf, OFF_USED)
    }

    fn count_rec(&self, buf: &[u8]) -> u16 {
        let used = rd_u16(buf, OFF_USED);
        if buf[OFF_LEVEL] > 0 { used + 1 } else { used }
    }

    fn space(&self, buf: &[u8]) -> usize {
        buf.len() - DATA_OFF - self.nphys(buf) * self.unit(buf)
    }

    fn level(&self, buf: &[u8]) -> u8 {
        buf[OFF_LEVEL]
    }

    fn shift(&self, buf: &[u8]) -> u8 {
        buf[OFF_SHIFT]
    }

    fn ksize(&self, buf: &[u8]) -> u16 {
        rd_u16(buf, OFF_KSIZE)
    }

    fn vsize(&self, buf: &[u8]) -> u16 {
        rd_u16(buf, OFF_VSIZE)
    }

    fn valsize(&self, buf: &[u8]) -> u16 {
        if buf[OFF_LEVEL] > 0 {
            ADDR_VSIZE
        } else {
            rd_u16(buf, OFF_VSIZE)
        }
    }

    fn isunderflow(&self, buf: &[u8], predict: bool) -> bool {
        let used = rd_u16(buf, OFF_USED);
        used.saturating_sub(predict as u16) == 0
    }

    fn isoverflow(&self, buf: &[u8]) -> bool {
        self.space(buf) < self.unit(buf)
    }

    fn isfit(&self, buf: &[u8]) -> bool {
        !self.isoverflow(buf)
    }

    fn find(&self, buf: &[u8], key: &[u8]) -> (u16, bool) {
        let used = self.count(buf);
        let mut lo = 0u16;
        let mut hi = used;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.key(buf, mid) < key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        let found = lo < used && self.key(buf, lo) == key;
        (lo, found)
    }

    fn key<'a>(&self, buf: &'a [u8], idx: u16) -> &'a [u8] {
        let off = self.slot_off(buf, idx);
        let ksize = rd_u16(buf, OFF_KSIZE) as usize;
        &buf[off..off + ksize]
    }

    fn val<'a>(&self, buf: &'a [u8], idx: u16) -> &'a [u8] {
        let off = self.slot_off(buf, idx) + rd_u16(buf, OFF_KSIZE) as usize;
        let vlen = self.valsize(buf) as usize;
        &buf[off..off + vlen]
    }

    fn val_mut<'a>(&self, buf: &'a mut [u8], idx: u16) -> &'a mut [u8] {
        let off = self.slot_off(buf, idx) + rd_u16(buf, OFF_KSIZE) as usize;
        let vlen = self.valsize(buf) as usize;
        &mut buf[off..off + vlen]
    }

    fn rec_mut<'a>(&self, buf: &'a mut [u8], idx: u16) -> (&'a [u8], &'a mut [u8]) {
        let off = self.slot_off(buf, idx);
        let ksize = rd_u16(buf, OFF_KSIZE) as usize;
        let vlen = self.valsize(buf) as usize;
        let (key, rest) = buf[off..off + ksize + vlen].split_at_mut(ksize);
        (key, rest)
    }

    fn child(&self, buf: &[u8], idx: u16) -> u64 {
        debug_assert!(buf[OFF_LEVEL] > 0);
        u64::from_le_bytes(self.val(buf, idx).try_into().unwrap())
    }

    fn set_child(&self, buf: &mut [u8], idx: u16, raw: u64) -> Vec<Span> {
        debug_assert!(buf[OFF_LEVEL] > 0);
        let off = self.slot_off(buf, idx) + rd_u16(buf, OFF_KSIZE) as usize;
        wr_u64(buf, off, raw);
        vec![Span::new(off, ADDR_VSIZE as usize)]
    }

    fn make(&self, buf: &mut [u8], idx: u16) -> Vec<Span> {
        let unit = self.unit(buf);
        let nphys = self.nphys(buf);
        debug_assert!(idx as usize <= nphys);
        debug_assert!(self.space(buf) >= unit);
        let start = self.slot_off(buf, idx);
        let end = DATA_OFF + nphys * unit;
        buf.copy_within(start..end, start + unit);
        wr_u16(buf, OFF_USED, self.count(buf) + 1);
        let mut spans = vec![
            Span::new(start, end + unit - start),
            Span::new(OFF_USED, 2),
        ];
        spans.extend(self.seal(buf));
        spans
    }

    fn del(&self, buf: &mut [u8], idx: u16) -> Vec<Span> {
        let unit = self.unit(buf);
        let nphys = self.nphys(buf);
        let used = self.count(buf);
        debug_assert!(idx < used);
        let start = self.slot_off(buf, idx);
        let end = DATA_OFF + nphys * unit;
        buf.copy_within(start + unit..end, start);
        wr_u16(buf, OFF_USED, used - 1);
        let mut spans = vec![
            Span::new(start, end - unit - start),
            Span::new(OFF_USED, 2),
        ];
        spans.extend(self.seal(buf));
        spans
    }

    fn set_rec(&self, buf: &mut [u8], idx: u16, key: &[u8], val: &[u8]) -> Vec<Span> {
        let off = self.slot_off(buf, idx);
        let ksize = rd_u16(buf, OFF_KSIZE) as usize;
        debug_assert_eq!(key.len(), ksize);
        debug_assert_eq!(val.len(), self.valsize(buf) as usize);
        buf[off..off + ksize].copy_from_slice(key);
        buf[off + ksize..off + ksize + val.len()].copy_from_slice(val);
        vec![Span::new(off, ksize + val.len())]
    }

    fn set_level(&self, buf: &mut [u8], level: u8) -> Vec<Span> {
        buf[OFF_LEVEL] = level;
        let mut spans = vec![Span::new(OFF_LEVEL, 1)];
        spans.extend(self.seal(buf));
        spans
    }

    fn seal(&self, buf: &mut [u8]) -> Vec<Span> {
        wr_u32(buf, OFF_FOOTER_VER, FOOTER_VER);
        let csum = header_csum(buf);
        wr_u64(buf, OFF_CSUM, csum);
        vec![Span::new(OFF_FOOTER_VER, 12)]
    }

    fn move_recs(
        &self,
        src: &mut [u8],
        tgt: &mut [u8],
        end: MoveEnd,
        quota: MoveQuota,
    ) -> MoveOutcome {
        debug_assert_eq!(src[OFF_LEVEL], tgt[OFF_LEVEL]);
        debug_assert_eq!(self.unit(src), self.unit(tgt));
        let ksize = rd_u16(src, OFF_KSIZE) as usize;
        let vlen = self.valsize(src) as usize;

        let mut out = MoveOutcome {
            src_spans: Vec::new(),
            tgt_spans: Vec::new(),
            moved: 0,
        };
        let mut rec = vec![0u8; ksize + vlen];

        loop {
            if self.count(src) == 0 {
                break;
            }
            match quota {
                MoveQuota::Count(n) if out.moved >= n => break,
                MoveQuota::Even if self.space(tgt) <= self.space(src) => break,
                _ => {}
            }
            if !self.isfit(tgt) {
                break;
            }

            let src_idx = match end {
                MoveEnd::Front => 0,
                MoveEnd::Back => self.count(src) - 1,
            };
            let tgt_idx = match end {
                MoveEnd::Front => self.count(tgt),
                MoveEnd::Back => 0,
            };

            rec[..ksize].copy_from_slice(self.key(src, src_idx));
            rec[ksize..].copy_from_slice(self.val(src, src_idx));

            out.tgt_spans.extend(self.make(tgt, tgt_idx));
            out.tgt_spans
                .extend(self.set_rec(tgt, tgt_idx, &rec[..ksize], &rec[ksize..]));
            out.src_spans.extend(self.del(src, src_idx));
            out.moved += 1;
        }

        out.src_spans.extend(self.seal(src));
        out.tgt_spans.extend(self.seal(tgt));
        out
    }

    fn verify(&self, buf: &[u8]) -> bool {
        if !self.isvalid(buf) {
            return false;
        }
        let used = self.count(buf);
        for i in 1..used {
            if self.key(buf, i - 1) >= self.key(buf, i) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHIFT: u8 = 9;
    const TTYPE: u32 = 7;

    fn fmt() -> FixedFormat {
        FixedFormat::new()
    }

    fn leaf(ksize: u16, vsize: u16) -> Vec<u8> {
        let mut buf = vec![0u8; 1 << SHIFT];
        fmt().init(&mut buf, SHIFT, 0, ksize, vsize, TTYPE);
        buf
    }

    fn internal(ksize: u16) -> Vec<u8> {
        let mut buf = vec![0u8; 1 << SHIFT];
        fmt().init(&mut buf, SHIFT, 1, ksize, 8, TTYPE);
        buf
    }

    fn put(buf: &mut [u8], key: u64, val: u64) {
        let f = fmt();
        let (idx, found) = f.find(buf, &key.to_be_bytes());
        assert!(!found);
        f.make(buf, idx);
        f.set_rec(buf, idx, &key.to_be_bytes(), &val.to_le_bytes());
    }

    #[test]
    fn init_yields_valid_empty_node() {
        let buf = leaf(8, 8);
        let f = fmt();
        assert!(f.isvalid(&buf));
        assert_eq!(f.count(&buf), 0);
        assert_eq!(f.count_rec(&buf), 0);
        assert_eq!(f.level(&buf), 0);
        assert!(f.isunderflow(&buf, false));
        assert!(!f.isoverflow(&buf));
    }

    #[test]
    fn internal_counts_sentinel() {
        let buf = internal(8);
        let f = fmt();
        assert_eq!(f.count(&buf), 0);
        assert_eq!(f.count_rec(&buf), 1);
        assert_eq!(f.valsize(&buf), 8);
    }

    #[test]
    fn find_is_first_geq() {
        let mut buf = leaf(8, 8);
        let f = fmt();
        for k in [10u64, 20, 30, 40] {
            put(&mut buf, k, k * 2);
        }
        assert_eq!(f.find(&buf, &15u64.to_be_bytes()), (1, false));
        assert_eq!(f.find(&buf, &20u64.to_be_bytes()), (1, true));
        assert_eq!(f.find(&buf, &5u64.to_be_bytes()), (0, false));
        assert_eq!(f.find(&buf, &45u64.to_be_bytes()), (4, false));
    }

    #[test]
    fn records_stay_sorted_through_random_inserts() {
        let mut buf = leaf(8, 8);
        let f = fmt();
        for k in [5u64, 1, 9, 3, 7, 2, 8] {
            put(&mut buf, k, k);
        }
        assert!(f.verify(&buf));
        assert_eq!(f.count(&buf), 7);
        for (i, k) in [1u64, 2, 3, 5, 7, 8, 9].iter().enumerate() {
            assert_eq!(f.key(&buf, i as u16), &k.to_be_bytes());
        }
    }

    #[test]
    fn del_closes_the_hole() {
        let mut buf = leaf(8, 8);
        let f = fmt();
        for k in [1u64, 2, 3] {
            put(&mut buf, k, k);
        }
        f.del(&mut buf, 1);
        assert_eq!(f.count(&buf), 2);
        assert_eq!(f.key(&buf, 0), &1u64.to_be_bytes());
        assert_eq!(f.key(&buf, 1), &3u64.to_be_bytes());
        assert!(f.verify(&buf));
    }

    #[test]
    fn overflow_at_capacity() {
        let mut buf = leaf(8, 8);
        let f = fmt();
        let cap = (buf.len() - DATA_OFF) / 16;
        for k in 0..cap as u64 {
            assert!(f.isfit(&buf));
            put(&mut buf, k, k);
        }
        assert!(f.isoverflow(&buf));
        assert_eq!(f.space(&buf), buf.len() - DATA_OFF - cap * 16);
    }

    #[test]
    fn move_even_balances_free_space() {
        let mut src = leaf(8, 8);
        let mut tgt = leaf(8, 8);
        let f = fmt();
        for k in 0..20u64 {
            put(&mut src, k, k);
        }
        let out = f.move_recs(&mut src, &mut tgt, MoveEnd::Front, MoveQuota::Even);
        assert_eq!(out.moved, 10);
        assert_eq!(f.count(&src), 10);
        assert_eq!(f.count(&tgt), 10);
        // Target took the low half.
        assert_eq!(f.key(&tgt, 0), &0u64.to_be_bytes());
        assert_eq!(f.key(&src, 0), &10u64.to_be_bytes());
        assert!(f.verify(&src) && f.verify(&tgt));
    }

    #[test]
    fn move_max_drains_source() {
        let mut src = leaf(8, 8);
        let mut tgt = leaf(8, 8);
        let f = fmt();
        for k in 0..5u64 {
            put(&mut src, k, k);
        }
        let out = f.move_recs(&mut src, &mut tgt, MoveEnd::Front, MoveQuota::Max);
        assert_eq!(out.moved, 5);
        assert_eq!(f.count(&src), 0);
        assert_eq!(f.count(&tgt), 5);
    }

    #[test]
    fn move_back_prepends() {
        let mut src = leaf(8, 8);
        let mut tgt = leaf(8, 8);
        let f = fmt();
        for k in 0..4u64 {
            put(&mut src, k, k);
        }
        for k in 10..12u64 {
            put(&mut tgt, k, k);
        }
        f.move_recs(&mut src, &mut tgt, MoveEnd::Back, MoveQuota::Count(2));
        assert_eq!(f.count(&tgt), 4);
        assert_eq!(f.key(&tgt, 0), &2u64.to_be_bytes());
        assert!(f.verify(&tgt));
        assert_eq!(f.count(&src), 2);
    }

    #[test]
    fn sentinel_travels_with_internal_moves() {
        let mut src = internal(8);
        let mut tgt = internal(8);
        let f = fmt();
        for k in [10u64, 20, 30] {
            put(&mut src, k, 0);
        }
        for (i, child) in [0x2000u64, 0x2400, 0x2800, 0x2c00].iter().enumerate() {
            f.set_child(&mut src, i as u16, *child);
        }
        f.move_recs(&mut src, &mut tgt, MoveEnd::Front, MoveQuota::Count(1));
        // (10, 0x2000) moved; src sentinel still 0x2c00.
        assert_eq!(f.count(&src), 2);
        assert_eq!(f.child(&src, 2), 0x2c00);
        assert_eq!(f.child(&tgt, 0), 0x2000);
    }

    #[test]
    fn checksum_detects_header_tamper() {
        let mut buf = leaf(8, 8);
        let f = fmt();
        assert!(f.isvalid(&buf));
        buf[OFF_KSIZE] ^= 0xff;
        assert!(!f.isvalid(&buf));
    }

    #[test]
    fn backptr_does_not_disturb_checksum() {
        let mut buf = leaf(8, 8);
        let f = fmt();
        super::super::set_frame_backptr(&mut buf, 0xdead_beef);
        assert!(f.isvalid(&buf));
        assert_eq!(super::super::frame_backptr(&buf), 0xdead_beef);
    }

    #[test]
    fn fini_invalidates() {
        let mut buf = leaf(8, 8);
        let f = fmt();
        f.fini(&mut buf);
        assert!(!f.isvalid(&buf));
    }

    #[test]
    fn mutators_report_spans() {
        let mut buf = leaf(8, 8);
        let f = fmt();
        let spans = f.make(&mut buf, 0);
        assert!(spans.iter().any(|s| s.offset as usize == DATA_OFF));
        assert!(spans.iter().any(|s| s.offset as usize == OFF_USED));
        assert!(spans.iter().any(|s| s.offset as usize == OFF_FOOTER_VER));
    }
}
