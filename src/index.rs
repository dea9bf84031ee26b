//! Index Builder: packs the leaves recorded during leaf
//! emission into a bottom-up B+-tree of index nodes, fanout-limited per
//! level, and reports the root's position for the master node's `zroot`.

use crate::crypto::Signer;
use crate::error::BuildError;
use crate::geometry::Geometry;
use crate::ledger::Ledger;
use crate::leaf_emitter::IndexLeaf;
use crate::node::{Branch, NodeType, SqnumCounter, encode_idx_payload, finish_node};
use crate::sink::Sink;
use crate::write_head::WriteHead;

pub struct IndexResult {
    pub zroot_lnum: u32,
    pub zroot_offs: u32,
    pub zroot_len: u32,
    pub root_level: u16,
    pub root_hash: Option<Vec<u8>>,
}

/// Sorts the recorded leaves by `(key, name)` — the name only ever breaks a
/// tie between two colliding name hashes under the same parent — then
/// packs them bottom-up into index nodes of at most `fanout`
/// children each until a single root remains.
#[allow(clippy::too_many_arguments)]
pub fn build_index(
    mut leaves: Vec<IndexLeaf>,
    geometry: &Geometry,
    signer: Option<&dyn Signer>,
    sqnum: &mut SqnumCounter,
    head: &mut WriteHead,
    ledger: &mut Ledger,
    sink: &mut dyn Sink,
) -> Result<IndexResult, BuildError> {
    leaves.sort_by(|a, b| a.key.cmp(&b.key).then_with(|| a.name.cmp(&b.name)));

    for pair in leaves.windows(2) {
        let (a, b) = (&pair[0], &pair[1]);
        if a.key == b.key && a.name == b.name {
            return Err(BuildError::IndexCorruption {
                detail: format!("key {:?} name {:?}", a.key, String::from_utf8_lossy(&a.name)),
            });
        }
    }

    let mut level: Vec<Branch> = leaves
        .into_iter()
        .map(|l| Branch {
            key: l.key,
            lnum: l.lnum,
            offs: l.offs,
            len: l.len,
            hash: l.hash,
        })
        .collect();

    if level.is_empty() {
        return Err(BuildError::IndexTooBig);
    }

    head.set_index_mode(true);
    let mut node_level: u16 = 0;
    loop {
        let next = pack_level(&level, geometry.fanout as usize, node_level, signer, sqnum, head, ledger, sink)?;
        let done = next.len() == 1;
        level = next;
        if done {
            break;
        }
        node_level += 1;
    }
    head.set_index_mode(false);

    let root = &level[0];
    Ok(IndexResult {
        zroot_lnum: root.lnum,
        zroot_offs: root.offs,
        zroot_len: root.len,
        root_level: node_level,
        root_hash: root.hash.clone(),
    })
}

#[allow(clippy::too_many_arguments)]
fn pack_level(
    branches: &[Branch],
    fanout: usize,
    level: u16,
    signer: Option<&dyn Signer>,
    sqnum: &mut SqnumCounter,
    head: &mut WriteHead,
    ledger: &mut Ledger,
    sink: &mut dyn Sink,
) -> Result<Vec<Branch>, BuildError> {
    let mut out = Vec::with_capacity(branches.len().div_ceil(fanout));
    for chunk in branches.chunks(fanout) {
        let payload = encode_idx_payload(level, chunk);
        let node_bytes = finish_node(sqnum, NodeType::Idx, 0, &payload);
        let (lnum, offs) = head.append(&node_bytes, sqnum, ledger, sink)?;
        out.push(Branch {
            key: chunk[0].key,
            lnum,
            offs,
            len: node_bytes.len() as u32,
            hash: signer.map(|s| s.compute_node_hash(&node_bytes)),
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Compression, Config, KeyHash};
    use crate::key::Key;
    use crate::ledger::Ledger;
    use crate::sink::MemSink;

    fn leaf(inum: u64, block: u32, lnum: u32, offs: u32) -> IndexLeaf {
        IndexLeaf {
            key: Key::data(inum, block),
            lnum,
            offs,
            len: 32,
            hash: None,
            name: Vec::new(),
        }
    }

    fn geo() -> Geometry {
        Geometry::derive(&Config {
            min_io_size: 2048,
            leb_size: 126976,
            max_leb_cnt: 100,
            fanout: 4,
            compr: Compression::None,
            keyhash: KeyHash::R5,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn single_leaf_still_gets_wrapped_in_a_level_zero_index_node() {
        let geometry = geo();
        let mut sqnum = SqnumCounter::default();
        let mut head = WriteHead::new(0, geometry.leb_size, geometry.min_io_size);
        let mut ledger = Ledger::default();
        let mut sink = MemSink::new(geometry.leb_size);
        let result = build_index(vec![leaf(2, 0, 0, 0)], &geometry, None, &mut sqnum, &mut head, &mut ledger, &mut sink).unwrap();
        assert_eq!(result.root_level, 0);
    }

    #[test]
    fn more_leaves_than_fanout_forces_a_second_level() {
        let geometry = geo();
        let mut sqnum = SqnumCounter::default();
        let mut head = WriteHead::new(0, geometry.leb_size, geometry.min_io_size);
        let mut ledger = Ledger::default();
        let mut sink = MemSink::new(geometry.leb_size);
        let leaves: Vec<_> = (0..10).map(|i| leaf(2, i, 0, i * 32)).collect();
        let result = build_index(leaves, &geometry, None, &mut sqnum, &mut head, &mut ledger, &mut sink).unwrap();
        assert!(result.root_level > 0);
    }
}
