//! Structural round-trip validator: checks the invariants a real
//! `fsck.ubifs` would, without shelling out to one. Operates on raw image
//! bytes the same way a kernel mounting the volume would — by scanning
//! LEBs for valid nodes and walking the index from `zroot` — rather than
//! on the builder's in-memory state, so it actually exercises the encoded
//! format.

use binrw::BinRead;

use crate::consts::*;
use crate::key::{Key, KEY_TYPE_DATA, KEY_TYPE_DENT, KEY_TYPE_INODE};
use crate::node::{crc_is_valid, read_header, DataPayload, DentPayload, InodePayload};

const S_IFMT: u32 = 0o170000;
const S_IFDIR: u32 = 0o040000;

pub struct Image<'a> {
    bytes: &'a [u8],
    leb_size: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct ScannedNode {
    pub lnum: u32,
    pub offs: u32,
    pub node_type: u8,
    pub len: u32,
}

impl<'a> Image<'a> {
    pub fn new(bytes: &'a [u8], leb_size: u32) -> Self {
        Image { bytes, leb_size }
    }

    pub fn leb_cnt(&self) -> u32 {
        self.bytes.len() as u32 / self.leb_size
    }

    fn leb(&self, lnum: u32) -> &[u8] {
        let start = lnum as usize * self.leb_size as usize;
        &self.bytes[start..start + self.leb_size as usize]
    }

    fn node_at(&self, lnum: u32, offs: u32) -> &[u8] {
        let leb = self.leb(lnum);
        &leb[offs as usize..]
    }

    /// Every valid node in every LEB, found by scanning from offset 0 and
    /// trusting each node's own `len` field once its CRC checks out; a
    /// corrupt or 0xFF-padded tail stops the scan for that LEB.
    pub fn scan_all_nodes(&self) -> Vec<ScannedNode> {
        let mut out = Vec::new();
        for lnum in 0..self.leb_cnt() {
            let leb = self.leb(lnum);
            let mut offs = 0u32;
            while (offs as usize) + COMMON_HDR_SZ as usize <= leb.len() {
                let node = &leb[offs as usize..];
                let header = read_header(node);
                if header.magic != NODE_MAGIC || (header.len as usize) < COMMON_HDR_SZ as usize {
                    break;
                }
                if (offs as u64) + header.len as u64 > leb.len() as u64 {
                    break;
                }
                let exact = &node[..header.len as usize];
                if !crc_is_valid(exact) {
                    break;
                }
                out.push(ScannedNode {
                    lnum,
                    offs,
                    node_type: header.node_type,
                    len: header.len,
                });
                offs += align8(header.len as u64) as u32;
            }
        }
        out
    }

    pub fn payload_of(&self, node: &ScannedNode) -> &[u8] {
        &self.node_at(node.lnum, node.offs)[COMMON_HDR_SZ as usize..node.len as usize]
    }
}

fn align8(x: u64) -> u64 {
    (x + 7) / 8 * 8
}

/// Branch as decoded straight off the wire, mirroring
/// [`crate::node::encode_idx_payload`]'s layout. Authenticated images
/// append a variable-length hash after each branch's fixed 20 bytes; this
/// reader only understands the unauthenticated layout.
#[derive(Debug, Clone, Copy)]
struct WireBranch {
    key: Key,
    lnum: u32,
    offs: u32,
    len: u32,
}

fn decode_branches(payload: &[u8]) -> (u16, Vec<WireBranch>) {
    let child_cnt = u16::from_le_bytes(payload[0..2].try_into().unwrap());
    let level = u16::from_le_bytes(payload[2..4].try_into().unwrap());
    let mut branches = Vec::with_capacity(child_cnt as usize);
    let mut p = 4usize;
    for _ in 0..child_cnt {
        let lnum = u32::from_le_bytes(payload[p..p + 4].try_into().unwrap());
        let offs = u32::from_le_bytes(payload[p + 4..p + 8].try_into().unwrap());
        let len = u32::from_le_bytes(payload[p + 8..p + 12].try_into().unwrap());
        let key = u64::from_le_bytes(payload[p + 12..p + 20].try_into().unwrap());
        branches.push(WireBranch { key: Key(key), lnum, offs, len });
        p += 20;
    }
    (level, branches)
}

/// Walks the index from `zroot` down to the leaves, returning every
/// level-0 branch — i.e. every real (non-index) node the index points at.
pub fn walk_index_leaves(image: &Image, zroot: (u32, u32, u32)) -> Vec<(Key, u32, u32, u32)> {
    let mut leaves = Vec::new();
    let mut stack = vec![zroot];
    while let Some((lnum, offs, len)) = stack.pop() {
        let node = &image.node_at(lnum, offs)[..len as usize];
        let payload = &node[COMMON_HDR_SZ as usize..];
        let (level, branches) = decode_branches(payload);
        for b in branches {
            if level == 0 {
                leaves.push((b.key, b.lnum, b.offs, b.len));
            } else {
                stack.push((b.lnum, b.offs, b.len));
            }
        }
    }
    leaves
}

pub fn master_lebs_identical(image: &Image) -> bool {
    image.leb(UBIFS_MST_LNUM) == image.leb(UBIFS_MST_LNUM + 1)
}

pub fn sqnums_strictly_increasing(image: &Image) -> bool {
    let mut last = 0u64;
    for n in image.scan_all_nodes() {
        let header = read_header(image.node_at(n.lnum, n.offs));
        if header.sqnum <= last {
            return false;
        }
        last = header.sqnum;
    }
    true
}

pub fn fmt_version_matches_flags(fmt_version: u32, double_hash: bool, encryption: bool) -> bool {
    (fmt_version == 5) == (double_hash || encryption)
}

/// Checks, for every non-directory inode reachable from the index, that
/// `nlink` equals the number of dentry branches whose target is that inode.
pub fn nlink_matches_dentry_count(image: &Image, leaves: &[(Key, u32, u32, u32)]) -> Result<(), String> {
    use std::collections::HashMap;

    let mut dentry_counts: HashMap<u64, u32> = HashMap::new();
    for (key, lnum, offs, len) in leaves {
        if key.ty() != KEY_TYPE_DENT {
            continue;
        }
        let node = &image.node_at(*lnum, *offs)[..*len as usize];
        let mut cursor = std::io::Cursor::new(&node[COMMON_HDR_SZ as usize..]);
        let dent = DentPayload::read_le(&mut cursor).map_err(|e| e.to_string())?;
        *dentry_counts.entry(dent.inum).or_default() += 1;
    }

    for (key, lnum, offs, len) in leaves {
        if key.ty() != KEY_TYPE_INODE {
            continue;
        }
        let node = &image.node_at(*lnum, *offs)[..*len as usize];
        let mut cursor = std::io::Cursor::new(&node[COMMON_HDR_SZ as usize..]);
        let ino = InodePayload::read_le(&mut cursor).map_err(|e| e.to_string())?;
        if ino.mode & S_IFMT == S_IFDIR {
            continue;
        }
        let inum = key.inum();
        let observed = dentry_counts.get(&inum).copied().unwrap_or(0);
        if observed != ino.nlink {
            return Err(format!(
                "inode {inum}: nlink {} but {observed} dentries reference it",
                ino.nlink
            ));
        }
    }
    Ok(())
}

/// Checks every data node's declared chunk length fits within
/// `UBIFS_BLOCK_SIZE` and within its owning inode's total size.
pub fn data_blocks_within_bounds(image: &Image, leaves: &[(Key, u32, u32, u32)]) -> Result<(), String> {
    use std::collections::HashMap;

    let mut sizes: HashMap<u64, u64> = HashMap::new();
    for (key, lnum, offs, len) in leaves {
        if key.ty() != KEY_TYPE_INODE {
            continue;
        }
        let node = &image.node_at(*lnum, *offs)[..*len as usize];
        let mut cursor = std::io::Cursor::new(&node[COMMON_HDR_SZ as usize..]);
        let ino = InodePayload::read_le(&mut cursor).map_err(|e| e.to_string())?;
        sizes.insert(key.inum(), ino.size);
    }

    for (key, lnum, offs, len) in leaves {
        if key.ty() != KEY_TYPE_DATA {
            continue;
        }
        let node = &image.node_at(*lnum, *offs)[..*len as usize];
        let mut cursor = std::io::Cursor::new(&node[COMMON_HDR_SZ as usize..]);
        let data = DataPayload::read_le(&mut cursor).map_err(|e| e.to_string())?;
        if data.size as u64 > UBIFS_BLOCK_SIZE {
            return Err(format!("data node for inode {} block {}: size {} exceeds block size", key.inum(), data.block, data.size));
        }
        let end = data.block as u64 * UBIFS_BLOCK_SIZE + data.size as u64;
        if let Some(&total) = sizes.get(&key.inum()) {
            if end > total {
                return Err(format!(
                    "data node for inode {} block {} ends at {end}, beyond inode size {total}",
                    key.inum(),
                    data.block
                ));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compress::DefaultCompressor;
    use crate::config::{Compression, Config};
    use crate::hostfs::StdHostFs;
    use crate::leaf_emitter::LeafEmitter;
    use crate::ledger::Ledger;
    use crate::node::SqnumCounter;
    use crate::sink::MemSink;
    use crate::write_head::WriteHead;
    use std::io::Write as _;

    fn image_leb_size(leaves: usize, leb_size: u32) -> Vec<u8> {
        vec![0xFFu8; leaves * leb_size as usize]
    }

    #[test]
    fn full_pipeline_round_trips_through_the_reader() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::File::create(dir.path().join("hello")).unwrap().write_all(b"hi\n").unwrap();

        let cfg = Config {
            root: Some(dir.path().to_path_buf()),
            min_io_size: 2048,
            leb_size: 126976,
            max_leb_cnt: 100,
            fanout: 8,
            compr: Compression::None,
            ..Default::default()
        };
        let geometry = crate::geometry::Geometry::derive(&cfg).unwrap();

        let hostfs = StdHostFs;
        let compressor = DefaultCompressor { favor_percent: 20 };
        let mut sqnum = SqnumCounter::default();
        let mut head = WriteHead::new(geometry.main_first, geometry.leb_size, geometry.min_io_size);
        let mut ledger = Ledger::default();
        let mut sink = MemSink::new(geometry.leb_size);

        let emitter = LeafEmitter::new(
            &cfg, &geometry, &hostfs, &compressor, None, None, None,
            &mut sqnum, &mut head, &mut ledger, &mut sink,
        );
        let emit_result = emitter.run().unwrap();

        let output = crate::finalize::finalize(
            &cfg, &geometry, emit_result.leaves, emit_result.highest_inum, None,
            &mut sqnum, &mut head, &mut ledger, &mut sink,
        ).unwrap();

        let mut flat = image_leb_size(output.leb_cnt as usize, geometry.leb_size);
        for lnum in 0..output.leb_cnt {
            if let Some(leb) = sink.leb(lnum) {
                let start = lnum as usize * geometry.leb_size as usize;
                flat[start..start + geometry.leb_size as usize].copy_from_slice(leb);
            }
        }
        let image = Image::new(&flat, geometry.leb_size);

        assert!(master_lebs_identical(&image));
        assert!(sqnums_strictly_increasing(&image));
        assert!(fmt_version_matches_flags(geometry.fmt_version, geometry.double_hash, geometry.encryption));

        let leaves = walk_index_leaves(&image, output.zroot);
        assert!(!leaves.is_empty());
        nlink_matches_dentry_count(&image, &leaves).unwrap();
        data_blocks_within_bounds(&image, &leaves).unwrap();
    }
}
