//! Offline image builder for the UBIFS flash file system: walks a source
//! directory through [`HostFs`], allocates UBIFS keys and on-flash
//! positions, and writes a complete image to a [`Sink`] — a regular file
//! or a UBI volume — without needing a live flash device or kernel module.
//!
//! The public entry point is [`UbifsImageBuilder::build`]: synchronous,
//! single-threaded, and side-effect-free beyond the writes it makes to the
//! supplied `Sink`.

pub mod compress;
pub mod config;
pub mod consts;
pub mod crypto;
pub mod device_table;
pub mod error;
pub mod finalize;
pub mod geometry;
pub mod hostfs;
pub mod index;
pub mod inode_identity;
pub mod key;
pub mod leaf_emitter;
pub mod ledger;
pub mod lpt;
pub mod node;
pub mod sink;
pub mod size;
pub mod write_head;

/// Structural round-trip validator, used by this crate's own tests and by
/// `tests/`. Not `#[cfg(test)]`-gated since integration tests need it as a
/// regular dependency of the compiled library.
pub mod reader;

use std::fs;

use crate::config::Config;
use crate::crypto::{Cryptor, DigestSigner, FscryptCryptor, Signer};
use crate::device_table::DeviceTable;
use crate::error::BuildError;
use crate::finalize::BuildOutput;
use crate::geometry::Geometry;
use crate::hostfs::{HostFs, StdHostFs};
use crate::leaf_emitter::LeafEmitter;
use crate::ledger::Ledger;
use crate::node::SqnumCounter;
use crate::sink::Sink;
use crate::write_head::WriteHead;

/// Summary handed back once an image has been fully written.
#[derive(Debug)]
pub struct FinishedImage {
    pub leb_cnt: u32,
    pub root_inum: u64,
    pub highest_inum: u64,
    pub zroot: (u32, u32, u32),
}

/// The single owned value the whole pipeline is driven from: validated
/// geometry plus whichever capability implementations the configuration
/// calls for.
pub struct UbifsImageBuilder {
    config: Config,
    geometry: Geometry,
    hostfs: Box<dyn HostFs>,
    compressor: compress::DefaultCompressor,
    cryptor: Option<FscryptCryptor>,
    signer: Option<DigestSigner>,
    device_table: Option<DeviceTable>,
}

impl UbifsImageBuilder {
    /// Validates `config` into a [`Geometry`] and loads whichever of
    /// encryption key, authentication key, and device table the
    /// configuration names, all before any traversal begins — so a bad
    /// geometry or unreadable key file fails before a single byte is written.
    pub fn new(config: Config) -> Result<Self, BuildError> {
        let geometry = Geometry::derive(&config)?;

        let cryptor = match &config.encryption {
            Some(enc) => {
                let raw_key = fs::read(&enc.key_file).map_err(|cause| BuildError::SourceIo {
                    path: enc.key_file.clone(),
                    cause,
                })?;
                Some(FscryptCryptor::new(enc, &raw_key)?)
            }
            None => None,
        };

        let signer = match &config.authentication {
            Some(auth) => {
                let auth_key = fs::read(&auth.auth_key_file).map_err(|cause| BuildError::SourceIo {
                    path: auth.auth_key_file.clone(),
                    cause,
                })?;
                Some(DigestSigner::new(auth, auth_key))
            }
            None => None,
        };

        let device_table = match &config.device_table {
            Some(path) => {
                let text = fs::read_to_string(path).map_err(|cause| BuildError::SourceIo {
                    path: path.clone(),
                    cause,
                })?;
                Some(DeviceTable::parse(&text)?)
            }
            None => None,
        };

        Ok(UbifsImageBuilder {
            config,
            geometry,
            hostfs: Box::new(StdHostFs),
            compressor: compress::DefaultCompressor {
                favor_percent: 20,
            },
            cryptor,
            signer,
            device_table,
        })
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// Runs the whole pipeline — Leaf Emitter then Finalizer — against
    /// `sink`, consuming `self` since a builder is spent in one shot.
    pub fn build(self, sink: &mut dyn Sink) -> Result<FinishedImage, BuildError> {
        let mut sqnum = SqnumCounter::default();
        let mut head = WriteHead::new(self.geometry.main_first, self.geometry.leb_size, self.geometry.min_io_size);
        let mut ledger = Ledger::default();

        let cryptor: Option<&dyn Cryptor> = self.cryptor.as_ref().map(|c| c as &dyn Cryptor);
        let signer: Option<&dyn Signer> = self.signer.as_ref().map(|s| s as &dyn Signer);

        let emitter = LeafEmitter::new(
            &self.config,
            &self.geometry,
            self.hostfs.as_ref(),
            &self.compressor,
            cryptor,
            signer,
            self.device_table.as_ref(),
            &mut sqnum,
            &mut head,
            &mut ledger,
            sink,
        );
        let emit_result = emitter.run()?;

        let BuildOutput {
            leb_cnt,
            zroot,
            highest_inum,
        } = crate::finalize::finalize(
            &self.config,
            &self.geometry,
            emit_result.leaves,
            emit_result.highest_inum,
            signer,
            &mut sqnum,
            &mut head,
            &mut ledger,
            sink,
        )?;

        Ok(FinishedImage {
            leb_cnt,
            root_inum: emit_result.root_inum,
            highest_inum,
            zroot,
        })
    }
}
