//! Enumerated build configuration. Parsing/CLI surfacing is out of scope;
//! callers hand in an already-built `Config`.

use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Lzo,
    Zlib,
    Zstd,
    FavorLzo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyHash {
    R5,
    Test,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cipher {
    Aes256Xts,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgo {
    Sha1,
    Sha256,
    Sha512,
}

#[derive(Debug, Clone)]
pub struct EncryptionConfig {
    pub key_file: PathBuf,
    pub key_desc: String,
    pub cipher: Cipher,
    /// Padding granularity for encrypted names/symlinks: 4, 8, 16, or 32.
    pub padding: u32,
}

#[derive(Debug, Clone)]
pub struct AuthenticationConfig {
    pub hash_algo: HashAlgo,
    pub auth_key_file: PathBuf,
    pub auth_cert_file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Source directory to image; `None` produces an empty image.
    pub root: Option<PathBuf>,

    pub min_io_size: u32,
    pub leb_size: u32,
    pub max_leb_cnt: u32,

    pub fanout: u32,
    pub jrn_size: Option<u64>,
    pub log_lebs: Option<u32>,
    pub orph_lebs: u32,

    pub reserved: u64,

    pub compr: Compression,
    pub favor_percent: u32,

    pub keyhash: KeyHash,

    pub space_fixup: bool,
    pub squash_owner: bool,
    pub set_inum_attr: bool,

    pub encryption: Option<EncryptionConfig>,
    pub authentication: Option<AuthenticationConfig>,

    pub device_table: Option<PathBuf>,
    pub selinux_label_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            root: None,
            min_io_size: 2048,
            leb_size: 126976,
            max_leb_cnt: 2048,
            fanout: crate::consts::UBIFS_DFLT_FANOUT,
            jrn_size: None,
            log_lebs: None,
            orph_lebs: 1,
            reserved: 0,
            compr: Compression::Lzo,
            favor_percent: 20,
            keyhash: KeyHash::R5,
            space_fixup: false,
            squash_owner: false,
            set_inum_attr: false,
            encryption: None,
            authentication: None,
            device_table: None,
            selinux_label_file: None,
        }
    }
}

impl Config {
    pub fn double_hash(&self) -> bool {
        self.encryption.is_some()
    }
}
