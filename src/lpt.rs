//! LEB Properties Tree: an on-flash B-tree of `pnode`s (leaf
//! nodes holding a batch of per-LEB `(free, dirty, flags)` triples) and
//! `nnode`s (internal fan-out nodes pointing at pnodes or other nnodes),
//! plus a single `ltab` node (the LPT's own LEB accounting) and a
//! `lsave` node (a small fast-GC candidate list). `lpt_geometry` is called
//! from [`crate::geometry`] before a single byte is written, so it must
//! depend only on `(max_leb_cnt, leb_size, min_io_size)`.

use crate::error::BuildError;
use crate::geometry::Geometry;
use crate::ledger::{LebProps, Ledger};
use crate::node::{NodeType, SqnumCounter, finish_node};
use crate::sink::Sink;
use crate::write_head::WriteHead;

/// How many `(free, dirty, flags)` triples a single pnode packs. Kept a
/// plain power of two rather than kernel UBIFS's bit-packed layout, since
/// nothing downstream needs bit-for-bit compatibility with a real reader.
const LPROPS_PER_PNODE: u32 = 64;
const LPT_FANOUT: u32 = 8;

const PNODE_HDR_SZ: u32 = 24 + 4; // common header + child_cnt
const PNODE_ENTRY_SZ: u32 = 4 + 4 + 1;
const NNODE_HDR_SZ: u32 = 24 + 4;
const NNODE_ENTRY_SZ: u32 = 4 + 4; // (lnum, offs) per child
const LTAB_ENTRY_SZ: u32 = 4 + 4; // (free, dirty) per LPT LEB
const LSAVE_CNT: u32 = 32;

fn align(x: u64, to: u64) -> u64 {
    (x + to - 1) / to * to
}

/// Computes `(big_lpt, lpt_lebs)` from pure geometry inputs.
pub fn lpt_geometry(max_leb_cnt: u32, leb_size: u32, min_io_size: u32) -> (bool, u32) {
    let pnode_cnt = max_leb_cnt.div_ceil(LPROPS_PER_PNODE).max(1);
    let mut nnode_cnt = 0u32;
    let mut level_cnt = pnode_cnt;
    while level_cnt > 1 {
        level_cnt = level_cnt.div_ceil(LPT_FANOUT);
        nnode_cnt += level_cnt;
    }
    let big_lpt = pnode_cnt > 1 || nnode_cnt > 0;

    let pnode_sz = PNODE_HDR_SZ + LPROPS_PER_PNODE * PNODE_ENTRY_SZ;
    let nnode_sz = NNODE_HDR_SZ + LPT_FANOUT * NNODE_ENTRY_SZ;
    let ltab_sz = 24 + 8 + max_leb_cnt * LTAB_ENTRY_SZ;
    let lsave_sz = 24 + LSAVE_CNT * 4;

    let total = pnode_cnt as u64 * pnode_sz as u64
        + nnode_cnt as u64 * nnode_sz as u64
        + ltab_sz as u64
        + lsave_sz as u64;
    let lpt_lebs = align(total, min_io_size as u64)
        .div_ceil(leb_size as u64)
        .max(1) as u32;
    (big_lpt, lpt_lebs)
}

pub struct LptResult {
    pub lpt_lnum: u32,
    pub lpt_offs: u32,
    pub nhead_lnum: u32,
    pub nhead_offs: u32,
    pub ltab_lnum: u32,
    pub ltab_offs: u32,
    pub lsave_lnum: u32,
    pub lsave_offs: u32,
}

/// Serializes the whole LPT into the `geometry.lpt_lebs` LEBs reserved for
/// it, starting at `lpt_first`. Run after the index so every main-area
/// LEB's final `(free, dirty)` is known.
pub fn write_lpt(
    geometry: &Geometry,
    lpt_first: u32,
    ledger: &Ledger,
    sqnum: &mut SqnumCounter,
    sink: &mut dyn Sink,
) -> Result<LptResult, BuildError> {
    let mut head = WriteHead::new(lpt_first, geometry.leb_size, geometry.min_io_size);
    let mut lpt_ledger = Ledger::default();
    head.set_index_mode(false);

    let props = ledger.props();
    let (first_pnode_lnum, first_pnode_offs) = head.position();

    let mut pnode_positions = Vec::new();
    for chunk in pad_to_pnodes(props, geometry.max_leb_cnt, geometry.leb_size).chunks(LPROPS_PER_PNODE as usize) {
        let payload = encode_pnode(chunk);
        let bytes = finish_node(sqnum, NodeType::Pnode, 0, &payload);
        let pos = head.append(&bytes, sqnum, &mut lpt_ledger, sink)?;
        pnode_positions.push(pos);
    }

    // One level of nnodes fanning into the pnodes; real UBIFS nests
    // further for very large volumes, but a single internal level is
    // enough to make the tree navigable for any max_leb_cnt this builder
    // accepts.
    let mut nnode_positions = Vec::new();
    let (mut nhead_lnum, mut nhead_offs) = (first_pnode_lnum, first_pnode_offs);
    if pnode_positions.len() > 1 {
        for chunk in pnode_positions.chunks(LPT_FANOUT as usize) {
            let payload = encode_nnode(chunk);
            let bytes = finish_node(sqnum, NodeType::Nnode, 0, &payload);
            let pos = head.append(&bytes, sqnum, &mut lpt_ledger, sink)?;
            nnode_positions.push(pos);
        }
        let (lnum, offs) = *nnode_positions.last().unwrap();
        nhead_lnum = lnum;
        nhead_offs = offs;
    } else if let Some(&(lnum, offs)) = pnode_positions.first() {
        nhead_lnum = lnum;
        nhead_offs = offs;
    }

    let ltab_payload = encode_ltab(lpt_ledger.props());
    let ltab_bytes = finish_node(sqnum, NodeType::Ltab, 0, &ltab_payload);
    let (ltab_lnum, ltab_offs) = head.append(&ltab_bytes, sqnum, &mut lpt_ledger, sink)?;

    let lsave_payload = encode_lsave(props);
    let lsave_bytes = finish_node(sqnum, NodeType::Lsave, 0, &lsave_payload);
    let (lsave_lnum, lsave_offs) = head.append(&lsave_bytes, sqnum, &mut lpt_ledger, sink)?;

    // Flush the tail LEB and pad the rest of the reserved region with
    // empty LEBs so the region's length matches `geometry.lpt_lebs`
    // exactly, the same way the log and orphan areas are padded.
    if head.offs != 0 {
        head.flush(sqnum, &mut lpt_ledger, sink)?;
    }
    while head.lnum < lpt_first + geometry.lpt_lebs {
        head.skip_empty(&mut lpt_ledger, sink)?;
    }

    Ok(LptResult {
        lpt_lnum: first_pnode_lnum,
        lpt_offs: first_pnode_offs,
        nhead_lnum,
        nhead_offs,
        ltab_lnum,
        ltab_offs,
        lsave_lnum,
        lsave_offs,
    })
}

/// LEBs beyond the ones the builder actually touched (`props.len()` up to
/// `max_leb_cnt`) are slack: never written, entirely free. Pad with that,
/// not with `LebProps::default()`, or the LPT records them as fully used
/// and `encode_lsave` never offers them as GC candidates.
fn pad_to_pnodes(props: &[LebProps], max_leb_cnt: u32, leb_size: u32) -> Vec<LebProps> {
    let mut out = props.to_vec();
    out.resize(
        max_leb_cnt as usize,
        LebProps {
            free: leb_size,
            dirty: 0,
            flags: 0,
        },
    );
    out
}

fn encode_pnode(entries: &[LebProps]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    for p in entries {
        buf.extend_from_slice(&p.free.to_le_bytes());
        buf.extend_from_slice(&p.dirty.to_le_bytes());
        buf.push(p.flags);
    }
    buf
}

fn encode_nnode(children: &[(u32, u32)]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&(children.len() as u32).to_le_bytes());
    for &(lnum, offs) in children {
        buf.extend_from_slice(&lnum.to_le_bytes());
        buf.extend_from_slice(&offs.to_le_bytes());
    }
    buf
}

/// `ltab` records the `(free, dirty)` of every LEB the LPT itself
/// occupies, so a reader can account for the LPT's own footprint.
fn encode_ltab(lpt_lebs: &[LebProps]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&(lpt_lebs.len() as u32).to_le_bytes());
    for p in lpt_lebs {
        buf.extend_from_slice(&p.free.to_le_bytes());
        buf.extend_from_slice(&p.dirty.to_le_bytes());
    }
    buf
}

/// `lsave` caches up to `LSAVE_CNT` of the emptiest main-area LEBs so a
/// mounted filesystem can find garbage-collection candidates without a
/// full LPT scan.
fn encode_lsave(props: &[LebProps]) -> Vec<u8> {
    let mut by_free: Vec<(u32, &LebProps)> = props.iter().enumerate().map(|(i, p)| (i as u32, p)).collect();
    by_free.sort_by(|a, b| b.1.free.cmp(&a.1.free));
    by_free.truncate(LSAVE_CNT as usize);

    let mut buf = Vec::new();
    buf.extend_from_slice(&(by_free.len() as u32).to_le_bytes());
    for (lnum, _) in by_free {
        buf.extend_from_slice(&lnum.to_le_bytes());
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::sink::MemSink;

    #[test]
    fn geometry_gives_at_least_one_leb() {
        let (_, lebs) = lpt_geometry(100, 126976, 2048);
        assert!(lebs >= 1);
    }

    #[test]
    fn larger_max_leb_cnt_needs_more_or_equal_lebs() {
        let (_, small) = lpt_geometry(100, 126976, 2048);
        let (_, big) = lpt_geometry(1_000_000, 126976, 2048);
        assert!(big >= small);
    }

    #[test]
    fn write_lpt_stays_within_reserved_region() {
        let cfg = Config {
            min_io_size: 2048,
            leb_size: 126976,
            max_leb_cnt: 100,
            fanout: 8,
            ..Default::default()
        };
        let geometry = Geometry::derive(&cfg).unwrap();
        let mut ledger = Ledger::default();
        ledger.record(0, geometry.leb_size, geometry.min_io_size, 500, false);
        let mut sqnum = SqnumCounter::default();
        let mut sink = MemSink::new(geometry.leb_size);
        let lpt_first = 10;
        let result = write_lpt(&geometry, lpt_first, &ledger, &mut sqnum, &mut sink).unwrap();
        assert!(result.lpt_lnum >= lpt_first);
        assert!(result.lpt_lnum < lpt_first + geometry.lpt_lebs);
    }
}
