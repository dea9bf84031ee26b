//! Leaf Emitter: the combinatorial core. Walks the source tree
//! through [`HostFs`], allocates target inode numbers, collapses hardlinks
//! via the inode-identity table, and emits data/inode/dentry/xattr nodes
//! into the write head, recording every emitted leaf's `(key, position)`
//! for the Index Builder.

use std::collections::BTreeSet;
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::compress::Compressor;
use crate::config::Config;
use crate::consts::*;
use crate::crypto::{Cryptor, Signer};
use crate::device_table::{DeviceOverride, DeviceTable, OverrideKind};
use crate::error::BuildError;
use crate::geometry::Geometry;
use crate::hostfs::{FileKind, HostFs, Stat};
use crate::inode_identity::{IdentityTable, Lookup};
use crate::key::Key;
use crate::ledger::Ledger;
use crate::node::{self, DataPayload, DentPayload, InodePayload, NodeType, SqnumCounter, finish_node};
use crate::sink::Sink;
use crate::write_head::WriteHead;

/// VFS `DT_*` directory-entry type tags, reused verbatim since they're a
/// stable, widely understood numbering rather than something UBIFS invented.
mod dirent_type {
    pub const REG: u8 = 8;
    pub const DIR: u8 = 4;
    pub const LNK: u8 = 10;
    pub const CHR: u8 = 2;
    pub const BLK: u8 = 6;
    pub const FIFO: u8 = 1;
    pub const SOCK: u8 = 12;
}

fn align8(x: u64) -> u64 {
    (x + 7) / 8 * 8
}

/// One leaf recorded for the Index Builder: a node's key plus its on-flash
/// position, with enough extra context (`len`, `hash`, tie-break `name`) to
/// build index branches directly.
#[derive(Debug, Clone)]
pub struct IndexLeaf {
    pub key: Key,
    pub lnum: u32,
    pub offs: u32,
    pub len: u32,
    pub hash: Option<Vec<u8>>,
    /// Raw bytes used to break ties between leaves with an identical key
    /// (colliding name hashes); empty for keys that can't collide (inode,
    /// data).
    pub name: Vec<u8>,
}

pub struct EmitResult {
    pub root_inum: u64,
    pub highest_inum: u64,
    pub leaves: Vec<IndexLeaf>,
}

pub struct LeafEmitter<'a> {
    config: &'a Config,
    geometry: &'a Geometry,
    hostfs: &'a dyn HostFs,
    compressor: &'a dyn Compressor,
    cryptor: Option<&'a dyn Cryptor>,
    signer: Option<&'a dyn Signer>,
    device_table: Option<&'a DeviceTable>,
    sqnum: &'a mut SqnumCounter,
    head: &'a mut WriteHead,
    ledger: &'a mut Ledger,
    sink: &'a mut dyn Sink,
    identity: IdentityTable,
    leaves: Vec<IndexLeaf>,
    next_inum: u64,
}

impl<'a> LeafEmitter<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &'a Config,
        geometry: &'a Geometry,
        hostfs: &'a dyn HostFs,
        compressor: &'a dyn Compressor,
        cryptor: Option<&'a dyn Cryptor>,
        signer: Option<&'a dyn Signer>,
        device_table: Option<&'a DeviceTable>,
        sqnum: &'a mut SqnumCounter,
        head: &'a mut WriteHead,
        ledger: &'a mut Ledger,
        sink: &'a mut dyn Sink,
    ) -> Self {
        LeafEmitter {
            config,
            geometry,
            hostfs,
            compressor,
            cryptor,
            signer,
            device_table,
            sqnum,
            head,
            ledger,
            sink,
            identity: IdentityTable::default(),
            leaves: Vec::new(),
            next_inum: ROOT_INO - 1,
        }
    }

    fn alloc_inum(&mut self) -> u64 {
        self.next_inum += 1;
        self.next_inum
    }

    pub fn run(mut self) -> Result<EmitResult, BuildError> {
        let mut root_stat = match &self.config.root {
            Some(path) => self.hostfs.lstat(path)?,
            None => synthetic_dir_stat(),
        };
        if self.config.squash_owner {
            root_stat.uid = 0;
            root_stat.gid = 0;
        }
        let root_path = self.config.root.clone().unwrap_or_else(|| PathBuf::from(""));
        let root_inum = self.visit_directory(&root_path, "", &root_stat)?;

        // Multi-linked files are emitted once, after the walk, in
        // first-seen table order, with their final observed nlink.
        for (_key, entry) in self.identity.drain_in_order() {
            self.emit_leaf_entry(entry.target_inum, Path::new(&entry.first_path), &entry.stat, entry.observed_nlink)?;
        }

        let highest_inum = self.next_inum;
        Ok(EmitResult {
            root_inum,
            highest_inum,
            leaves: self.leaves,
        })
    }

    /// `rel_path` is the slash-joined path relative to the image root
    /// (empty string for the root directory itself), used both to look up
    /// device-table overrides and to key the inode-identity table's
    /// diagnostic `first_path`.
    fn visit_directory(&mut self, host_path: &Path, rel_path: &str, stat: &Stat) -> Result<u64, BuildError> {
        let my_inum = self.alloc_inum();
        // Captured before any child (or its subtree) consumes a sqnum: a
        // directory's own inode is emitted last but inherits the sqnum it
        // would have gotten had it been emitted first, matching kernel
        // semantics.
        let creat_sqnum = self.sqnum.peek_next();

        // A missing `host_path` means this directory is entirely synthetic
        // (injected by the device table, e.g. `/dev` when the source tree
        // has none) — treat it as empty rather than failing the build.
        let host_names: BTreeSet<String> = if host_path.as_os_str().is_empty() || !host_path.exists() {
            BTreeSet::new()
        } else {
            self.hostfs.read_dir(host_path)?.into_iter().collect()
        };
        let synthetic_names = self
            .device_table
            .map(|dt| synthetic_children(dt, rel_path))
            .unwrap_or_default();

        let mut all_names: Vec<String> = host_names.iter().cloned().collect();
        for name in synthetic_names {
            if !host_names.contains(&name) {
                all_names.push(name);
            }
        }
        all_names.sort();

        let mut size = 0u64;
        let mut subdir_count = 0u32;
        for name in &all_names {
            let child_rel = format!("{rel_path}/{name}");
            let child_host_path = host_path.join(name);
            let is_host_entry = host_names.contains(name);

            let mut child_stat = if is_host_entry {
                self.hostfs.lstat(&child_host_path)?
            } else {
                synthetic_leaf_stat()
            };

            if self.config.squash_owner {
                child_stat.uid = 0;
                child_stat.gid = 0;
            }

            if let Some(dt) = self.device_table {
                if let Some(ov) = dt.lookup(Path::new(&child_rel)) {
                    if is_host_entry && child_stat.kind == FileKind::Regular {
                        return Err(BuildError::DeviceTableInvalid {
                            reason: format!("{child_rel}: device table cannot override a regular file"),
                        });
                    }
                    apply_override(&mut child_stat, ov);
                }
            }

            let is_dir = child_stat.kind == FileKind::Directory;
            let target_inum = if is_dir {
                self.visit_directory(&child_host_path, &child_rel, &child_stat)?
            } else {
                self.visit_leaf(&child_host_path, &child_rel, &child_stat)?
            };

            self.emit_dentry(my_inum, name.as_bytes(), target_inum, dirent_type_for(child_stat.kind))?;
            size += align8((DENT_NODE_SZ as u64) + name.len() as u64 + 1);
            if is_dir {
                subdir_count += 1;
            }
        }

        self.emit_inode(
            my_inum,
            stat,
            2 + subdir_count,
            size,
            &[],
            0,
            creat_sqnum,
        )?;
        Ok(my_inum)
    }

    /// Non-directory entries: hardlinked files are parked in the identity
    /// table for deferred emission; everything else is emitted immediately.
    fn visit_leaf(&mut self, host_path: &Path, rel_path: &str, stat: &Stat) -> Result<u64, BuildError> {
        if stat.nlink > 1 {
            return Ok(match self.identity.lookup(stat.dev, stat.inum) {
                Lookup::Existing(target) => {
                    self.identity.register(stat.dev, stat.inum, target, rel_path, *stat);
                    target
                }
                Lookup::New => {
                    let target = self.alloc_inum();
                    self.identity.register(stat.dev, stat.inum, target, rel_path, *stat);
                    target
                }
            });
        }
        let target = self.alloc_inum();
        self.emit_leaf_entry(target, host_path, stat, 1)?;
        Ok(target)
    }

    fn emit_leaf_entry(&mut self, inum: u64, host_path: &Path, stat: &Stat, nlink: u32) -> Result<(), BuildError> {
        let (xattr_cnt, xattr_size, xattr_names) = if host_path.exists() {
            self.emit_xattrs(inum, host_path)?
        } else {
            (0, 0, 0)
        };
        match stat.kind {
            FileKind::Regular => {
                self.emit_data_blocks(inum, host_path, stat.size)?;
                let creat_sqnum = self.sqnum.peek_next();
                self.emit_inode(inum, stat, nlink, stat.size, &[], xattr_cnt, creat_sqnum)?;
            }
            FileKind::Symlink => {
                let target = self.hostfs.readlink(host_path)?;
                let inline = match self.cryptor {
                    Some(c) => c.encrypt_symlink(&target, inum)?,
                    None => target.clone(),
                };
                if inline.len() as u32 > MAX_INO_DATA {
                    return Err(BuildError::InvalidOption {
                        reason: format!("symlink {host_path:?} target is longer than MAX_INO_DATA"),
                    });
                }
                let creat_sqnum = self.sqnum.peek_next();
                self.emit_inode(inum, stat, nlink, target.len() as u64, &inline, xattr_cnt, creat_sqnum)?;
            }
            FileKind::CharDevice | FileKind::BlockDevice => {
                let rdev = encode_rdev(stat.rdev_major, stat.rdev_minor);
                let creat_sqnum = self.sqnum.peek_next();
                self.emit_inode(inum, stat, nlink, 0, &rdev, xattr_cnt, creat_sqnum)?;
            }
            FileKind::Fifo | FileKind::Socket => {
                let creat_sqnum = self.sqnum.peek_next();
                self.emit_inode(inum, stat, nlink, 0, &[], xattr_cnt, creat_sqnum)?;
            }
            FileKind::Directory => unreachable!("directories never reach emit_leaf_entry"),
        }
        let _ = xattr_size;
        let _ = xattr_names;
        Ok(())
    }

    fn emit_data_blocks(&mut self, inum: u64, host_path: &Path, size: u64) -> Result<(), BuildError> {
        let mut reader = self.hostfs.open_read(host_path)?;
        let block_size = UBIFS_BLOCK_SIZE as usize;
        let mut buf = vec![0u8; block_size];
        let mut block_no: u32 = 0;
        let total_blocks = size.div_ceil(UBIFS_BLOCK_SIZE);
        while (block_no as u64) < total_blocks {
            let n = read_fully(&mut reader, &mut buf, host_path)?;
            if n == 0 {
                break;
            }
            let chunk = &buf[..n];
            if chunk.iter().all(|&b| b == 0) {
                block_no += 1;
                continue;
            }
            let (compressed, compr_type) = self.compressor.compress(chunk, self.geometry.compr)?;
            let stored = match self.cryptor {
                Some(c) => c.encrypt_data(&compressed, inum, block_no as u64)?,
                None => compressed,
            };
            let payload_head = DataPayload {
                block: block_no,
                compr_type: compr_type as u16,
                unused: 0,
                size: chunk.len() as u32,
            };
            let mut payload = node::to_bytes(&payload_head);
            payload.extend_from_slice(&stored);
            let node_bytes = finish_node(self.sqnum, NodeType::Data, 0, &payload);
            let (lnum, offs) = self.head.append(&node_bytes, self.sqnum, self.ledger, self.sink)?;
            self.push_leaf(Key::data(inum, block_no), lnum, offs, node_bytes.len() as u32, &node_bytes, Vec::new());
            block_no += 1;
        }
        Ok(())
    }

    fn emit_xattrs(&mut self, inum: u64, host_path: &Path) -> Result<(u32, u32, u32), BuildError> {
        let names = match self.hostfs.list_xattrs(host_path) {
            Ok(names) => names,
            Err(BuildError::HostAttrUnavailable { .. }) => Vec::new(),
            Err(e) => return Err(e),
        };

        let mut cnt = 0u32;
        let mut size = 0u64;
        let mut names_len = 0u32;
        for name in names {
            if self.config.selinux_label_file.is_some() && name.starts_with("security.selinux") {
                continue;
            }
            let value = match self.hostfs.read_xattr(host_path, &name) {
                Ok(v) => v,
                Err(BuildError::HostAttrUnavailable { .. }) => continue,
                Err(e) => return Err(e),
            };
            self.emit_one_xattr(inum, name.as_bytes(), &value)?;
            cnt += 1;
            size += align8(DENT_NODE_SZ as u64 + name.len() as u64 + 1)
                + align8(INO_NODE_SZ as u64 + value.len() as u64);
            names_len += name.len() as u32 + 1;
        }

        if self.config.set_inum_attr {
            let name = "user.image-inode-number";
            let value = inum.to_le_bytes().to_vec();
            self.emit_one_xattr(inum, name.as_bytes(), &value)?;
            cnt += 1;
            size += align8(DENT_NODE_SZ as u64 + name.len() as u64 + 1) + align8(INO_NODE_SZ as u64 + value.len() as u64);
            names_len += name.len() as u32 + 1;
        }

        Ok((cnt, size as u32, names_len))
    }

    fn emit_one_xattr(&mut self, owner_inum: u64, name: &[u8], value: &[u8]) -> Result<(), BuildError> {
        let xattr_inum = self.alloc_inum();
        let payload_head = InodePayload {
            creat_sqnum: self.sqnum.peek_next(),
            size: value.len() as u64,
            nlink: 1,
            data_len: value.len() as u16,
            ..Default::default()
        };
        let mut buf = node::to_bytes(&payload_head);
        buf.extend_from_slice(value);
        let node_bytes = finish_node(self.sqnum, NodeType::Ino, 0, &buf);
        let (lnum, offs) = self.head.append(&node_bytes, self.sqnum, self.ledger, self.sink)?;
        self.push_leaf(Key::inode(xattr_inum), lnum, offs, node_bytes.len() as u32, &node_bytes, Vec::new());

        let key = Key::xent(owner_inum, name, self.config.keyhash);
        let entry_head = DentPayload {
            inum: xattr_inum,
            hash_payload: key.payload(),
            node_type: NodeType::Xent as u8,
            file_type: 0,
            name_len: name.len() as u16,
        };
        let mut entry_buf = node::to_bytes(&entry_head);
        entry_buf.extend_from_slice(name);
        let entry_bytes = finish_node(self.sqnum, NodeType::Xent, 0, &entry_buf);
        let (lnum, offs) = self.head.append(&entry_bytes, self.sqnum, self.ledger, self.sink)?;
        self.push_leaf(key, lnum, offs, entry_bytes.len() as u32, &entry_bytes, name.to_vec());
        Ok(())
    }

    fn emit_dentry(&mut self, parent_inum: u64, name: &[u8], target_inum: u64, file_type: u8) -> Result<(), BuildError> {
        let key = Key::dent(parent_inum, name, self.config.keyhash);
        let stored_name = match self.cryptor {
            Some(c) => c.encrypt_name(name, parent_inum)?,
            None => name.to_vec(),
        };
        let payload_head = DentPayload {
            inum: target_inum,
            hash_payload: key.payload(),
            node_type: NodeType::Dent as u8,
            file_type,
            name_len: stored_name.len() as u16,
        };
        let mut buf = node::to_bytes(&payload_head);
        buf.extend_from_slice(&stored_name);
        let node_bytes = finish_node(self.sqnum, NodeType::Dent, 0, &buf);
        let (lnum, offs) = self.head.append(&node_bytes, self.sqnum, self.ledger, self.sink)?;
        self.push_leaf(key, lnum, offs, node_bytes.len() as u32, &node_bytes, stored_name);
        Ok(())
    }

    fn emit_inode(
        &mut self,
        inum: u64,
        stat: &Stat,
        nlink: u32,
        size: u64,
        inline_data: &[u8],
        xattr_cnt: u32,
        creat_sqnum: u64,
    ) -> Result<(), BuildError> {
        let payload_head = InodePayload {
            creat_sqnum,
            size,
            atime_sec: stat.atime_sec.max(0) as u64,
            ctime_sec: stat.ctime_sec.max(0) as u64,
            mtime_sec: stat.mtime_sec.max(0) as u64,
            nlink,
            uid: stat.uid,
            gid: stat.gid,
            mode: (stat.mode & !S_IFMT) | s_ifmt(stat.kind),
            flags: 0,
            xattr_cnt,
            xattr_size: 0,
            xattr_names: 0,
            compr_type: 0,
            data_len: inline_data.len() as u16,
        };
        let mut buf = node::to_bytes(&payload_head);
        buf.extend_from_slice(inline_data);
        let node_bytes = finish_node(self.sqnum, NodeType::Ino, 0, &buf);
        let (lnum, offs) = self.head.append(&node_bytes, self.sqnum, self.ledger, self.sink)?;
        self.push_leaf(Key::inode(inum), lnum, offs, node_bytes.len() as u32, &node_bytes, Vec::new());
        Ok(())
    }

    fn push_leaf(&mut self, key: Key, lnum: u32, offs: u32, len: u32, node_bytes: &[u8], name: Vec<u8>) {
        let hash = self.signer.map(|s| s.compute_node_hash(node_bytes));
        self.leaves.push(IndexLeaf {
            key,
            lnum,
            offs,
            len,
            hash,
            name,
        });
    }
}

fn read_fully(reader: &mut dyn Read, buf: &mut [u8], path: &Path) -> Result<usize, BuildError> {
    let mut total = 0;
    while total < buf.len() {
        let n = reader
            .read(&mut buf[total..])
            .map_err(|cause| BuildError::SourceIo {
                path: path.to_path_buf(),
                cause,
            })?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}

const S_IFMT: u32 = 0o170000;

/// Forces the inode's mode to carry the file-type bits matching `kind`,
/// regardless of whether the caller's `Stat` already had them (real host
/// stats do; device-table-synthesized ones only carry permission bits).
fn s_ifmt(kind: FileKind) -> u32 {
    match kind {
        FileKind::Regular => 0o100000,
        FileKind::Directory => 0o040000,
        FileKind::Symlink => 0o120000,
        FileKind::CharDevice => 0o020000,
        FileKind::BlockDevice => 0o060000,
        FileKind::Fifo => 0o010000,
        FileKind::Socket => 0o140000,
    }
}

fn dirent_type_for(kind: FileKind) -> u8 {
    match kind {
        FileKind::Regular => dirent_type::REG,
        FileKind::Directory => dirent_type::DIR,
        FileKind::Symlink => dirent_type::LNK,
        FileKind::CharDevice => dirent_type::CHR,
        FileKind::BlockDevice => dirent_type::BLK,
        FileKind::Fifo => dirent_type::FIFO,
        FileKind::Socket => dirent_type::SOCK,
    }
}

/// Encodes `(major, minor)` into the inode's inline data the way a char/block
/// device's "contents" are represented on flash: an 8-byte little-endian
/// pair, wide enough for any real device number without the historical
/// 8-bit-minor packing limit.
fn encode_rdev(major: u32, minor: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8);
    buf.extend_from_slice(&major.to_le_bytes());
    buf.extend_from_slice(&minor.to_le_bytes());
    buf
}

fn apply_override(stat: &mut Stat, ov: &DeviceOverride) {
    stat.kind = match ov.kind {
        OverrideKind::CharDevice => FileKind::CharDevice,
        OverrideKind::BlockDevice => FileKind::BlockDevice,
        OverrideKind::Fifo => FileKind::Fifo,
    };
    stat.mode = ov.mode;
    stat.uid = ov.uid;
    stat.gid = ov.gid;
    stat.rdev_major = ov.major;
    stat.rdev_minor = ov.minor;
}

fn synthetic_dir_stat() -> Stat {
    Stat {
        kind: FileKind::Directory,
        mode: 0o755,
        uid: 0,
        gid: 0,
        size: 0,
        nlink: 1,
        dev: 0,
        inum: 0,
        rdev_major: 0,
        rdev_minor: 0,
        atime_sec: 0,
        ctime_sec: 0,
        mtime_sec: 0,
    }
}

fn synthetic_leaf_stat() -> Stat {
    Stat {
        kind: FileKind::Directory,
        mode: 0o755,
        uid: 0,
        gid: 0,
        size: 0,
        nlink: 1,
        dev: 0,
        inum: 0,
        rdev_major: 0,
        rdev_minor: 0,
        atime_sec: 0,
        ctime_sec: 0,
        mtime_sec: 0,
    }
}

/// Child path components the device table requires directly beneath `dir`
/// (either a device-table leaf itself, or an intermediate directory on the
/// way to one), so directories absent from the host tree (e.g. `/dev`) are
/// still synthesized.
fn synthetic_children(table: &DeviceTable, dir: &str) -> Vec<String> {
    let mut names = BTreeSet::new();
    for path in table.paths() {
        let Some(rest) = path.strip_prefix(dir) else {
            continue;
        };
        let rest = rest.trim_start_matches('/');
        if rest.is_empty() {
            continue;
        }
        if let Some(first) = rest.split('/').next() {
            names.insert(first.to_string());
        }
    }
    names.into_iter().collect()
}
