//! Fixed on-flash constants. Centralized here so every component derives
//! from the same numbers instead of re-deriving them.

/// Common node header magic, little-endian on flash.
pub const NODE_MAGIC: u32 = 0x0610_1831;

/// UBIFS logical block size used for data node chunking.
pub const UBIFS_BLOCK_SIZE: u64 = 4096;

/// First inode number handed out to user content; 1..=10 are reserved below.
pub const UBIFS_FIRST_INO: u64 = 1;

/// Root directory is always inode 1 in this builder's numbering (UBIFS
/// doesn't reserve a low inode range the way ext4 does; its root inum is
/// conventionally 1).
pub const ROOT_INO: u64 = 1;

pub const UBIFS_MIN_LEB_SZ: u32 = 4096;
pub const UBIFS_MAX_LEB_SZ: u32 = 128 * 1024 * 1024;
pub const UBIFS_MIN_LEB_CNT: u32 = 4;

pub const UBIFS_SB_LEBS: u32 = 1;
pub const UBIFS_SB_LNUM: u32 = 0;
pub const UBIFS_MST_LEBS: u32 = 2;
pub const UBIFS_MST_LNUM: u32 = UBIFS_SB_LEBS;
pub const UBIFS_LOG_LNUM: u32 = UBIFS_MST_LNUM + UBIFS_MST_LEBS;

pub const UBIFS_MIN_FANOUT: u32 = 2;
pub const UBIFS_DFLT_FANOUT: u32 = 8;

pub const UBIFS_MAX_KEY_LEN: u32 = 16;
pub const UBIFS_MAX_NLEN: u32 = 255;

/// Node-size constants, all pre-padding (header + fixed payload).
pub const COMMON_HDR_SZ: u32 = 24;
pub const REF_NODE_SZ: u32 = COMMON_HDR_SZ + 16;
pub const PAD_NODE_SZ: u32 = COMMON_HDR_SZ + 4;
pub const CS_NODE_SZ: u32 = COMMON_HDR_SZ + 8;
pub const IDX_NODE_SZ: u32 = COMMON_HDR_SZ + 4;
pub const BRANCH_SZ: u32 = 12 + UBIFS_MAX_KEY_LEN;
pub const INO_NODE_SZ: u32 = COMMON_HDR_SZ + 136;
pub const DENT_NODE_SZ: u32 = COMMON_HDR_SZ + 36;
pub const DATA_NODE_SZ: u32 = COMMON_HDR_SZ + 16;
pub const MAX_DATA_NODE_SZ: u32 = DATA_NODE_SZ + UBIFS_BLOCK_SIZE as u32 + 8;
pub const MAX_INO_DATA: u32 = 4096 - INO_NODE_SZ;
pub const MIN_WRITE_SZ: u32 = 8;
pub const MAX_NODE_SZ: u32 = MAX_DATA_NODE_SZ;
pub const SB_NODE_SZ: u32 = 4096;
pub const MST_NODE_SZ: u32 = 512;
pub const BLOCK_SIZE: u64 = UBIFS_BLOCK_SIZE;

/// Node type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NodeType {
    Idx = 0,
    Ino = 1,
    Dent = 2,
    Data = 3,
    Xent = 4,
    Mst = 5,
    Sb = 6,
    Ref = 7,
    Pad = 8,
    Cs = 9,
    Orph = 10,
    Auth = 11,
    Sig = 12,
    Pnode = 13,
    Nnode = 14,
    Ltab = 15,
    Lsave = 16,
}

/// Superblock feature flags.
pub mod sb_flags {
    pub const BIGLPT: u32 = 1 << 8;
    pub const SPACE_FIXUP: u32 = 1 << 9;
    pub const DOUBLE_HASH: u32 = 1 << 6;
    pub const ENCRYPTION: u32 = 1 << 7;
    pub const AUTHENTICATION: u32 = 1 << 10;
}

/// LEB property flags.
pub const LPROPS_INDEX: u8 = 1;
