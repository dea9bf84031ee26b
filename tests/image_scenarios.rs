//! Integration tests: build a real image to a temp file with the public
//! API, then check it the way a conformant reader would. There's no
//! userspace `fsck.ubifs`-equivalent available here, so structural checks
//! run through [`ubifs_writer::reader`] instead of shelling out.

use std::fs::File;
use std::io::Write as _;
use std::os::unix::fs::PermissionsExt;

use binrw::BinRead;

use ubifs_writer::config::{Compression, Config, EncryptionConfig, Cipher};
use ubifs_writer::consts::COMMON_HDR_SZ;
use ubifs_writer::key::{KEY_TYPE_DATA, KEY_TYPE_DENT, KEY_TYPE_INODE};
use ubifs_writer::node::{InodePayload, SbPayload, NodeType};
use ubifs_writer::reader;
use ubifs_writer::sink::FileSink;
use ubifs_writer::UbifsImageBuilder;

fn base_config() -> Config {
    Config {
        min_io_size: 2048,
        leb_size: 126976,
        max_leb_cnt: 100,
        fanout: 8,
        compr: Compression::None,
        ..Default::default()
    }
}

fn build_image(config: Config) -> (Vec<u8>, ubifs_writer::FinishedImage) {
    let out = tempfile::NamedTempFile::new().unwrap();
    let leb_size = config.leb_size;
    let builder = UbifsImageBuilder::new(config).unwrap();
    let mut sink = FileSink::new(out.reopen().unwrap(), leb_size);
    let finished = builder.build(&mut sink).unwrap();
    let bytes = std::fs::read(out.path()).unwrap();
    assert_eq!(bytes.len() as u32, finished.leb_cnt * leb_size);
    (bytes, finished)
}

fn read_inode(image: &reader::Image, lnum: u32, offs: u32, len: u32) -> InodePayload {
    let node = &image_node(image, lnum, offs, len);
    let mut cursor = std::io::Cursor::new(&node[COMMON_HDR_SZ as usize..]);
    InodePayload::read_le(&mut cursor).unwrap()
}

fn image_node<'a>(image: &'a reader::Image, lnum: u32, offs: u32, len: u32) -> Vec<u8> {
    // `reader::Image` only exposes payloads keyed off a `ScannedNode`; for
    // index leaves we only have (lnum, offs, len), so re-derive a
    // `ScannedNode` by scanning and matching position.
    image
        .scan_all_nodes()
        .into_iter()
        .find(|n| n.lnum == lnum && n.offs == offs && n.len == len)
        .map(|n| {
            let mut full = Vec::new();
            full.extend_from_slice(&[0u8; COMMON_HDR_SZ as usize]);
            full.extend_from_slice(image.payload_of(&n));
            full
        })
        .expect("leaf position must correspond to a scanned node")
}

/// A single file should produce exactly one data/inode/dentry node.
#[test]
fn test_ubifs_image_writer_hello_world() {
    let dir = tempfile::tempdir().unwrap();
    let hello = dir.path().join("hello");
    File::create(&hello).unwrap().write_all(b"hi\n").unwrap();
    std::fs::set_permissions(&hello, std::fs::Permissions::from_mode(0o644)).unwrap();

    let mut cfg = base_config();
    cfg.root = Some(dir.path().to_path_buf());
    let (bytes, finished) = build_image(cfg);

    assert_eq!(finished.root_inum, 1);
    assert_eq!(finished.highest_inum, 2);

    let image = reader::Image::new(&bytes, 126976);
    assert!(reader::master_lebs_identical(&image));
    assert!(reader::sqnums_strictly_increasing(&image));

    let leaves = reader::walk_index_leaves(&image, finished.zroot);
    let data_leaves: Vec<_> = leaves.iter().filter(|(k, ..)| k.ty() == KEY_TYPE_DATA).collect();
    assert_eq!(data_leaves.len(), 1);
    let dent_leaves: Vec<_> = leaves.iter().filter(|(k, ..)| k.ty() == KEY_TYPE_DENT).collect();
    assert_eq!(dent_leaves.len(), 1);
    let inode_leaves: Vec<_> = leaves.iter().filter(|(k, ..)| k.ty() == KEY_TYPE_INODE).collect();
    assert_eq!(inode_leaves.len(), 2); // root + hello

    let (_, lnum, offs, len) = **inode_leaves
        .iter()
        .find(|(k, ..)| k.inum() == 2)
        .unwrap();
    let ino = read_inode(&image, lnum, offs, len);
    assert_eq!(ino.mode & 0o777, 0o644);
    assert_eq!(ino.size, 3);
    assert_eq!(ino.nlink, 1);

    let (_, rlnum, roffs, rlen) = **inode_leaves.iter().find(|(k, ..)| k.inum() == 1).unwrap();
    let root_ino = read_inode(&image, rlnum, roffs, rlen);
    assert_eq!(root_ino.nlink, 2);

    reader::nlink_matches_dentry_count(&image, &leaves).unwrap();
    reader::data_blocks_within_bounds(&image, &leaves).unwrap();
}

/// Scenario 2: a hardlink collapses to one inode with nlink=2 and two
/// dentries; highest_inum lands 2 beyond root.
#[test]
fn test_ubifs_image_writer_hardlink() {
    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("a");
    std::fs::write(&a, b"x").unwrap();
    std::fs::hard_link(&a, dir.path().join("b")).unwrap();

    let mut cfg = base_config();
    cfg.root = Some(dir.path().to_path_buf());
    let (bytes, finished) = build_image(cfg);
    assert_eq!(finished.highest_inum, finished.root_inum + 1);

    let image = reader::Image::new(&bytes, 126976);
    let leaves = reader::walk_index_leaves(&image, finished.zroot);
    let dent_leaves: Vec<_> = leaves.iter().filter(|(k, ..)| k.ty() == KEY_TYPE_DENT).collect();
    assert_eq!(dent_leaves.len(), 2);

    let target_inum = finished.root_inum + 1;
    let (_, lnum, offs, len) = *leaves
        .iter()
        .find(|(k, ..)| k.ty() == KEY_TYPE_INODE && k.inum() == target_inum)
        .unwrap();
    let ino = read_inode(&image, lnum, offs, len);
    assert_eq!(ino.nlink, 2);
}

/// Scenario 3: `favor_lzo` on a highly compressible 4 KiB file picks LZO
/// since zlib doesn't beat it by more than `favor_percent`.
#[test]
fn test_ubifs_image_writer_favor_lzo_selects_lzo() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a"), vec![b'A'; 4096]).unwrap();

    let mut cfg = base_config();
    cfg.root = Some(dir.path().to_path_buf());
    cfg.compr = Compression::FavorLzo;
    cfg.favor_percent = 20;
    let (bytes, finished) = build_image(cfg);

    let image = reader::Image::new(&bytes, 126976);
    let leaves = reader::walk_index_leaves(&image, finished.zroot);
    let (_, lnum, offs, len) = *leaves
        .iter()
        .find(|(k, ..)| k.ty() == KEY_TYPE_DATA)
        .unwrap();
    let node = image_node(&image, lnum, offs, len);
    let compr_type = u16::from_le_bytes(node[COMMON_HDR_SZ as usize + 4..COMMON_HDR_SZ as usize + 6].try_into().unwrap());
    assert_eq!(compr_type, ubifs_writer::compress::ComprType::Lzo as u16);
}

/// Scenario 4: encryption forces `fmt_version == 5` and sets both
/// `ENCRYPTION` and `DOUBLE_HASH` in the superblock flags; the symlink's
/// inline data is padded to the configured granularity.
#[test]
fn test_ubifs_image_writer_encrypted_symlink() {
    let dir = tempfile::tempdir().unwrap();
    std::os::unix::fs::symlink("/target", dir.path().join("link")).unwrap();

    let key_file = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(key_file.path(), [0x5au8; 64]).unwrap();

    let mut cfg = base_config();
    cfg.root = Some(dir.path().to_path_buf());
    cfg.encryption = Some(EncryptionConfig {
        key_file: key_file.path().to_path_buf(),
        key_desc: "test".into(),
        cipher: Cipher::Aes256Xts,
        padding: 16,
    });
    let (bytes, finished) = build_image(cfg);

    let image = reader::Image::new(&bytes, 126976);
    let leaves = reader::walk_index_leaves(&image, finished.zroot);

    let symlink_inum = finished.root_inum + 1;
    let (_, lnum, offs, len) = *leaves
        .iter()
        .find(|(k, ..)| k.ty() == KEY_TYPE_INODE && k.inum() == symlink_inum)
        .unwrap();
    let ino = read_inode(&image, lnum, offs, len);
    // "/target" is 7 bytes; padded to a multiple of 16.
    assert_eq!(ino.data_len, 16);

    let sb_node = image
        .scan_all_nodes()
        .into_iter()
        .find(|n| n.node_type == NodeType::Sb as u8)
        .unwrap();
    let mut cursor = std::io::Cursor::new(image.payload_of(&sb_node));
    let sb = SbPayload::read_le(&mut cursor).unwrap();
    assert_eq!(sb.fmt_version, 5);
    assert_ne!(sb.flags & ubifs_writer::consts::sb_flags::ENCRYPTION, 0);
    assert_ne!(sb.flags & ubifs_writer::consts::sb_flags::DOUBLE_HASH, 0);
}

/// Scenario 5: a device-table char-device entry synthesizes `/dev`, and a
/// device-table attempt to create a regular file is rejected at parse time.
#[test]
fn test_ubifs_image_writer_device_table_char_device() {
    let dir = tempfile::tempdir().unwrap();
    let table = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(table.path(), "/dev/null c 666 0 0 1 3\n").unwrap();

    let mut cfg = base_config();
    cfg.root = Some(dir.path().to_path_buf());
    cfg.device_table = Some(table.path().to_path_buf());
    let (bytes, finished) = build_image(cfg);

    let image = reader::Image::new(&bytes, 126976);
    let leaves = reader::walk_index_leaves(&image, finished.zroot);

    let dev_dentry = leaves
        .iter()
        .find(|(k, lnum, offs, len)| {
            if k.ty() != KEY_TYPE_DENT {
                return false;
            }
            let node = image_node(&image, *lnum, *offs, *len);
            let name = &node[COMMON_HDR_SZ as usize + 16..];
            name.starts_with(b"dev")
        })
        .is_some();
    assert!(dev_dentry, "image must contain a /dev directory entry");

    let null_inode = leaves.iter().find(|(k, lnum, offs, len)| {
        if k.ty() != KEY_TYPE_INODE {
            return false;
        }
        let ino = read_inode(&image, *lnum, *offs, *len);
        ino.mode & 0o170000 == 0o020000 // S_IFCHR
    });
    assert!(null_inode.is_some(), "image must contain a character-device inode");
}

#[test]
fn test_ubifs_image_writer_device_table_rejects_regular_file() {
    let result = ubifs_writer::device_table::DeviceTable::parse("/foo f 644 0 0\n");
    assert!(result.is_err());
}

/// Scenario 6: enough files to force more than one index level; root's
/// `level` field is nonzero and every leaf is reachable from `zroot`.
#[test]
fn test_ubifs_image_writer_many_files_forces_multilevel_index() {
    let dir = tempfile::tempdir().unwrap();
    for i in 0..10_000 {
        std::fs::write(dir.path().join(format!("file-{i}")), b"x").unwrap();
    }

    let mut cfg = base_config();
    cfg.root = Some(dir.path().to_path_buf());
    cfg.max_leb_cnt = 20_000;
    let (bytes, finished) = build_image(cfg);

    let image = reader::Image::new(&bytes, 126976);
    let (zlnum, zoffs, zlen) = finished.zroot;
    let root_node = image_node(&image, zlnum, zoffs, zlen);
    let payload = &root_node[COMMON_HDR_SZ as usize..];
    let level = u16::from_le_bytes(payload[2..4].try_into().unwrap());
    assert!(level > 0);

    let leaves = reader::walk_index_leaves(&image, finished.zroot);
    // root inode(1) + 10000 × (inode + data node + dentry).
    assert_eq!(leaves.len(), 1 + 3 * 10_000);
    reader::nlink_matches_dentry_count(&image, &leaves).unwrap();
    reader::data_blocks_within_bounds(&image, &leaves).unwrap();
}
