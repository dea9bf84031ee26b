//! Finalizer: the fixed eight-step sequence that turns
//! accumulated leaves into a complete image — reserve the GC LEB, build
//! the index, fix `leb_cnt`, write the LPT, the two master LEBs, the
//! superblock, the log, and the empty orphan area.

use crate::config::{Compression, Config, KeyHash};
use crate::consts::*;
use crate::crypto::Signer;
use crate::error::BuildError;
use crate::geometry::Geometry;
use crate::index::{self, IndexResult};
use crate::ledger::Ledger;
use crate::leaf_emitter::IndexLeaf;
use crate::lpt;
use crate::node::{self, CsPayload, MstPayload, NodeType, OrphPayload, SbPayload, SqnumCounter, finish_node};
use crate::sink::Sink;
use crate::write_head::WriteHead;

pub struct BuildOutput {
    pub leb_cnt: u32,
    pub zroot: (u32, u32, u32),
    pub highest_inum: u64,
}

#[allow(clippy::too_many_arguments)]
pub fn finalize(
    config: &Config,
    geometry: &Geometry,
    leaves: Vec<IndexLeaf>,
    highest_inum: u64,
    signer: Option<&dyn Signer>,
    sqnum: &mut SqnumCounter,
    head: &mut WriteHead,
    ledger: &mut Ledger,
    sink: &mut dyn Sink,
) -> Result<BuildOutput, BuildError> {
    // Step 1: reserve one empty GC LEB.
    if head.offs != 0 {
        head.flush(sqnum, ledger, sink)?;
    }
    let gc_lnum = head.lnum;
    head.skip_empty(ledger, sink)?;

    // Step 2: drive the Index Builder.
    let index_result: IndexResult = index::build_index(leaves, geometry, signer, sqnum, head, ledger, sink)?;
    if head.offs != 0 {
        head.flush(sqnum, ledger, sink)?;
    }
    let (ihead_lnum, ihead_offs) = head.position();

    // Step 3: fix leb_cnt.
    let leb_cnt = head.lnum;
    if leb_cnt > geometry.max_leb_cnt {
        return Err(BuildError::TooManyLebs {
            need: leb_cnt,
            max: geometry.max_leb_cnt,
        });
    }

    // Step 4: run the LPT Writer.
    let log_first = UBIFS_LOG_LNUM;
    let lpt_first = log_first + geometry.log_lebs;
    let orph_first = lpt_first + geometry.lpt_lebs;
    let lpt_result = lpt::write_lpt(geometry, lpt_first, ledger, sqnum, sink)?;

    let stats = ledger.aggregate(geometry.dead_wm, geometry.dark_wm, geometry.leb_size);

    // Step 5: write the master node twice, identically, then hash it.
    let mut flags = 0u32;
    if geometry.big_lpt {
        flags |= sb_flags::BIGLPT;
    }
    if config.space_fixup {
        flags |= sb_flags::SPACE_FIXUP;
    }
    if geometry.double_hash {
        flags |= sb_flags::DOUBLE_HASH;
    }
    if geometry.encryption {
        flags |= sb_flags::ENCRYPTION;
    }
    if geometry.authentication {
        flags |= sb_flags::AUTHENTICATION;
    }

    let mut root_idx_hash = [0u8; 32];
    if let Some(hash) = &index_result.root_hash {
        let n = hash.len().min(32);
        root_idx_hash[..n].copy_from_slice(&hash[..n]);
    }

    let mst_payload = MstPayload {
        highest_inum,
        cmt_no: 0,
        flags,
        log_lnum: log_first,
        root_lnum: index_result.zroot_lnum,
        root_offs: index_result.zroot_offs,
        root_len: index_result.zroot_len,
        gc_lnum,
        ihead_lnum,
        ihead_offs,
        index_size: stats.total_used,
        total_free: stats.total_free,
        total_dirty: stats.total_dirty,
        total_used: stats.total_used,
        total_dead: stats.total_dead,
        total_dark: stats.total_dark,
        lpt_lnum: lpt_result.lpt_lnum,
        lpt_offs: lpt_result.lpt_offs,
        nhead_lnum: lpt_result.nhead_lnum,
        nhead_offs: lpt_result.nhead_offs,
        ltab_lnum: lpt_result.ltab_lnum,
        ltab_offs: lpt_result.ltab_offs,
        lsave_lnum: lpt_result.lsave_lnum,
        lsave_offs: lpt_result.lsave_offs,
        lscan_lnum: geometry.main_first,
        empty_lebs: stats.empty_lebs,
        idx_lebs: stats.idx_lebs,
        leb_cnt,
        root_idx_hash,
    };
    let mst_bytes = finish_node(sqnum, NodeType::Mst, 0, &node::to_bytes(&mst_payload));
    let mut mst_buf = vec![0xFFu8; geometry.leb_size as usize];
    mst_buf[..mst_bytes.len()].copy_from_slice(&mst_bytes);
    sink.write_leb(UBIFS_MST_LNUM, &mst_buf)?;
    sink.write_leb(UBIFS_MST_LNUM + 1, &mst_buf)?;
    ledger.record(UBIFS_MST_LNUM, geometry.leb_size, geometry.min_io_size, mst_bytes.len() as u32, false);
    ledger.record(UBIFS_MST_LNUM + 1, geometry.leb_size, geometry.min_io_size, mst_bytes.len() as u32, false);

    let mst_hash = signer
        .map(|s| s.compute_node_hash(&mst_bytes))
        .unwrap_or_default();
    let mut mst_hash_arr = [0u8; 32];
    let n = mst_hash.len().min(32);
    mst_hash_arr[..n].copy_from_slice(&mst_hash[..n]);

    // Step 6: write the superblock (+ signature when authenticated) at LEB 0.
    let uuid: [u8; 16] = rand::random();
    let sb_payload = SbPayload {
        key_hash: key_hash_tag(config.keyhash),
        key_fmt: 0,
        flags,
        min_io_size: geometry.min_io_size,
        leb_size: geometry.leb_size,
        leb_cnt,
        max_leb_cnt: geometry.max_leb_cnt,
        max_bud_bytes: geometry.max_bud_bytes,
        log_lebs: geometry.log_lebs,
        lpt_lebs: geometry.lpt_lebs,
        orph_lebs: geometry.orph_lebs,
        jhead_cnt: geometry.jhead_cnt,
        fanout: geometry.fanout,
        fmt_version: geometry.fmt_version,
        default_compr: compr_tag(geometry.compr),
        rp_uid: 0,
        rp_gid: 0,
        rp_size: geometry.rp_size,
        uuid,
        hash_algo: config
            .authentication
            .as_ref()
            .map(|a| a.hash_algo as u8)
            .unwrap_or(0),
        mst_hash: mst_hash_arr,
    };
    let sb_bytes = finish_node(sqnum, NodeType::Sb, 0, &node::to_bytes(&sb_payload));
    let mut sb_used = sb_bytes.len() as u32;
    let mut sb_buf = vec![0xFFu8; geometry.leb_size as usize];
    sb_buf[..sb_bytes.len()].copy_from_slice(&sb_bytes);

    if let Some(signer) = signer {
        if geometry.authentication {
            let sig = signer.sign_sb_node(&sb_bytes)?;
            let sig_bytes = finish_node(sqnum, NodeType::Sig, 0, &sig);
            let start = SB_NODE_SZ as usize;
            sb_buf[start..start + sig_bytes.len()].copy_from_slice(&sig_bytes);
            sb_used = SB_NODE_SZ + sig_bytes.len() as u32;
        }
    }
    sink.write_leb(UBIFS_SB_LNUM, &sb_buf)?;
    ledger.record(UBIFS_SB_LNUM, geometry.leb_size, geometry.min_io_size, sb_used, false);

    // Step 7: write the log — a commit-start node, then empty LEBs.
    let mut log_head = WriteHead::new(log_first, geometry.leb_size, geometry.min_io_size);
    let mut log_ledger = Ledger::default();
    let cs_bytes = finish_node(sqnum, NodeType::Cs, 0, &node::to_bytes(&CsPayload { cmt_no: 0 }));
    log_head.append(&cs_bytes, sqnum, &mut log_ledger, sink)?;
    log_head.flush(sqnum, &mut log_ledger, sink)?;
    while log_head.lnum < log_first + geometry.log_lebs {
        log_head.skip_empty(&mut log_ledger, sink)?;
    }

    // Step 8: write orph_lebs empty LEBs.
    let _orph_cs = node::to_bytes(&OrphPayload { cmt_no: 0 });
    let mut orph_head = WriteHead::new(orph_first, geometry.leb_size, geometry.min_io_size);
    let mut orph_ledger = Ledger::default();
    while orph_head.lnum < orph_first + geometry.orph_lebs {
        orph_head.skip_empty(&mut orph_ledger, sink)?;
    }

    sink.finish(leb_cnt, geometry.leb_size)?;

    Ok(BuildOutput {
        leb_cnt,
        zroot: (index_result.zroot_lnum, index_result.zroot_offs, index_result.zroot_len),
        highest_inum,
    })
}

fn key_hash_tag(k: KeyHash) -> u8 {
    match k {
        KeyHash::R5 => 0,
        KeyHash::Test => 1,
    }
}

fn compr_tag(c: Compression) -> u16 {
    match c {
        Compression::None => 0,
        Compression::Lzo => 1,
        Compression::Zlib => 2,
        Compression::Zstd => 3,
        Compression::FavorLzo => 4,
    }
}
