//! Node Codec: on-flash node structures and the common header.
//!
//! Fixed-shape payloads (inode, dentry, data, master, superblock, commit
//! start, orphan, signature) are `binrw`-derived: plain structs with
//! `BinRead`/`BinWrite` deriving, plus a post-processed checksum field.
//! Index and LPT nodes carry a variable-length tail (branches / entries)
//! that doesn't fit a fixed `binrw` struct, so those are assembled by hand
//! into a byte buffer and then run through the same header/CRC finisher as
//! everything else.

use binrw::{BinWrite, binrw};
use crc::{Crc, CRC_32_ISO_HDLC};

use crate::consts::*;

pub use crate::consts::NodeType;

/// UBIFS's CRC-32 is the reflected, poly-0xEDB88320 variant — the same
/// table used by zip/ethernet, exposed by `crc` as `CRC_32_ISO_HDLC`.
pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Assigns strictly increasing sequence numbers, required so replay can
/// order nodes by write time. A field on the builder, not global state.
#[derive(Debug, Default)]
pub struct SqnumCounter(u64);

impl SqnumCounter {
    pub fn next(&mut self) -> u64 {
        self.0 += 1;
        self.0
    }

    pub fn peek_next(&self) -> u64 {
        self.0 + 1
    }

    pub fn max(&self) -> u64 {
        self.0
    }
}

#[binrw]
#[derive(Debug, Clone, Copy, Default)]
pub struct CommonHeader {
    pub magic: u32,
    pub crc: u32,
    pub sqnum: u64,
    pub len: u32,
    pub node_type: u8,
    pub group_type: u8,
    pub padding: u16,
}

pub(crate) fn to_bytes<T>(value: &T) -> Vec<u8>
where
    T: BinWrite,
    for<'a> <T as BinWrite>::Args<'a>: Default,
{
    let mut buf = std::io::Cursor::new(Vec::new());
    value.write_le(&mut buf).expect("in-memory write cannot fail");
    buf.into_inner()
}

/// Wraps a node-type's raw payload bytes with the common header, assigns a
/// fresh sqnum, and patches in the CRC over everything but the CRC field
/// itself.
pub fn finish_node(
    sqnum: &mut SqnumCounter,
    node_type: NodeType,
    group_type: u8,
    payload: &[u8],
) -> Vec<u8> {
    let header = CommonHeader {
        magic: NODE_MAGIC,
        crc: 0,
        sqnum: sqnum.next(),
        len: COMMON_HDR_SZ + payload.len() as u32,
        node_type: node_type as u8,
        group_type,
        padding: 0,
    };
    let mut buf = to_bytes(&header);
    buf.extend_from_slice(payload);

    let crc = CRC32.checksum(&buf[8..]);
    buf[4..8].copy_from_slice(&crc.to_le_bytes());
    buf
}

/// Recomputes and checks a node's CRC (used by the test-only reader).
pub fn crc_is_valid(node: &[u8]) -> bool {
    if node.len() < COMMON_HDR_SZ as usize {
        return false;
    }
    let stored = u32::from_le_bytes(node[4..8].try_into().unwrap());
    let computed = CRC32.checksum(&node[8..]);
    stored == computed
}

pub fn read_header(node: &[u8]) -> CommonHeader {
    use binrw::BinRead;
    let mut cursor = std::io::Cursor::new(node);
    CommonHeader::read_le(&mut cursor).expect("fixed-size header read cannot fail")
}

#[binrw]
#[derive(Debug, Clone, Copy, Default)]
pub struct InodePayload {
    pub creat_sqnum: u64,
    pub size: u64,
    pub atime_sec: u64,
    pub ctime_sec: u64,
    pub mtime_sec: u64,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub flags: u32,
    pub xattr_cnt: u32,
    pub xattr_size: u32,
    pub xattr_names: u32,
    pub compr_type: u16,
    pub data_len: u16,
    // `data` (inline symlink target / device numbers / small xattr value)
    // follows immediately after this fixed part and is appended by the
    // caller; binrw can't express the variable tail without a generic
    // length param threaded through every call site, so `leaf_emitter`
    // appends it directly onto `to_bytes(&payload)`.
}

#[binrw]
#[derive(Debug, Clone, Copy, Default)]
pub struct DataPayload {
    pub block: u32,
    pub compr_type: u16,
    pub unused: u16,
    pub size: u32,
    // compressed/raw content bytes follow, appended by the caller.
}

#[binrw]
#[derive(Debug, Clone, Default)]
pub struct DentPayload {
    pub inum: u64,
    pub hash_payload: u32,
    pub node_type: u8,
    pub file_type: u8,
    pub name_len: u16,
    // name bytes (and for xattr-entries, the value) follow.
}

#[binrw]
#[derive(Debug, Clone, Copy, Default)]
pub struct CsPayload {
    pub cmt_no: u64,
}

#[binrw]
#[derive(Debug, Clone, Copy, Default)]
pub struct MstPayload {
    pub highest_inum: u64,
    pub cmt_no: u64,
    pub flags: u32,
    pub log_lnum: u32,
    pub root_lnum: u32,
    pub root_offs: u32,
    pub root_len: u32,
    pub gc_lnum: u32,
    pub ihead_lnum: u32,
    pub ihead_offs: u32,
    pub index_size: u64,
    pub total_free: u64,
    pub total_dirty: u64,
    pub total_used: u64,
    pub total_dead: u64,
    pub total_dark: u64,
    pub lpt_lnum: u32,
    pub lpt_offs: u32,
    pub nhead_lnum: u32,
    pub nhead_offs: u32,
    pub ltab_lnum: u32,
    pub ltab_offs: u32,
    pub lsave_lnum: u32,
    pub lsave_offs: u32,
    pub lscan_lnum: u32,
    pub empty_lebs: u32,
    pub idx_lebs: u32,
    pub leb_cnt: u32,
    pub root_idx_hash: [u8; 32],
}

#[binrw]
#[derive(Debug, Clone, Copy, Default)]
pub struct SbPayload {
    pub key_hash: u8,
    pub key_fmt: u8,
    pub flags: u32,
    pub min_io_size: u32,
    pub leb_size: u32,
    pub leb_cnt: u32,
    pub max_leb_cnt: u32,
    pub max_bud_bytes: u64,
    pub log_lebs: u32,
    pub lpt_lebs: u32,
    pub orph_lebs: u32,
    pub jhead_cnt: u32,
    pub fanout: u32,
    pub fmt_version: u32,
    pub default_compr: u16,
    pub rp_uid: u32,
    pub rp_gid: u32,
    pub rp_size: u64,
    pub uuid: [u8; 16],
    pub hash_algo: u8,
    pub mst_hash: [u8; 32],
}

#[binrw]
#[derive(Debug, Clone, Copy, Default)]
pub struct PadPayload {
    /// Number of padding bytes following this field, up to the next node
    /// (or the end of the LEB).
    pub pad_len: u32,
}

#[binrw]
#[derive(Debug, Clone, Copy, Default)]
pub struct OrphPayload {
    pub cmt_no: u64,
    // inode numbers to delete follow; always empty at mkfs time.
}

#[binrw]
#[derive(Debug, Clone, Default)]
pub struct AuthPayload {
    pub hash_algo: u8,
    // HMAC bytes follow, length depends on `hash_algo`.
}

/// One branch of an index node: `(key, lnum, offs, len)` plus an optional
/// content hash when authentication is enabled.
#[derive(Debug, Clone)]
pub struct Branch {
    pub key: crate::key::Key,
    pub lnum: u32,
    pub offs: u32,
    pub len: u32,
    pub hash: Option<Vec<u8>>,
}

/// Hand-assembled because the branch count is variable (see the module
/// doc comment above).
pub fn encode_idx_payload(level: u16, branches: &[Branch]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&(branches.len() as u16).to_le_bytes());
    buf.extend_from_slice(&level.to_le_bytes());
    for b in branches {
        buf.extend_from_slice(&b.lnum.to_le_bytes());
        buf.extend_from_slice(&b.offs.to_le_bytes());
        buf.extend_from_slice(&b.len.to_le_bytes());
        buf.extend_from_slice(&b.key.0.to_le_bytes());
        if let Some(hash) = &b.hash {
            buf.extend_from_slice(hash);
        }
    }
    buf
}

pub fn decode_idx_payload(payload: &[u8]) -> (u16, u16) {
    let child_cnt = u16::from_le_bytes(payload[0..2].try_into().unwrap());
    let level = u16::from_le_bytes(payload[2..4].try_into().unwrap());
    (child_cnt, level)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let mut sqnum = SqnumCounter::default();
        let node = finish_node(&mut sqnum, NodeType::Cs, 0, &to_bytes(&CsPayload { cmt_no: 0 }));
        let header = read_header(&node);
        assert_eq!(header.magic, NODE_MAGIC);
        assert_eq!(header.sqnum, 1);
        assert!(crc_is_valid(&node));
    }

    #[test]
    fn corrupting_a_byte_breaks_the_crc() {
        let mut sqnum = SqnumCounter::default();
        let mut node = finish_node(&mut sqnum, NodeType::Cs, 0, &to_bytes(&CsPayload { cmt_no: 0 }));
        let last = node.len() - 1;
        node[last] ^= 0xFF;
        assert!(!crc_is_valid(&node));
    }

    #[test]
    fn sqnum_is_strictly_increasing() {
        let mut sqnum = SqnumCounter::default();
        let first = sqnum.next();
        let second = sqnum.next();
        assert!(second > first);
    }
}
