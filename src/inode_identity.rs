//! Inode identity table: tracks host `(device, source-inum)` pairs
//! that have `nlink > 1` so repeated hardlinks collapse onto one target
//! inode. A `HashMap` plus a side vector recording first-seen order is
//! enough, since nothing needs sorted iteration.

use std::collections::HashMap;

use crate::hostfs::Stat;

#[derive(Debug, Clone)]
pub struct IdentityEntry {
    pub target_inum: u64,
    pub observed_nlink: u32,
    pub first_path: String,
    pub stat: Stat,
}

#[derive(Debug, Default)]
pub struct IdentityTable {
    entries: HashMap<(u64, u64), IdentityEntry>,
    /// Insertion order, so the multi-link deferred-emission pass runs in a
    /// stable, table order.
    order: Vec<(u64, u64)>,
}

pub enum Lookup {
    /// First time this (dev, inum) pair is seen: caller should allocate a
    /// fresh target inum and register it.
    New,
    /// Already seen: reuse this target inum, the caller should roll back
    /// its own inum counter.
    Existing(u64),
}

impl IdentityTable {
    pub fn lookup(&self, dev: u64, source_inum: u64) -> Lookup {
        match self.entries.get(&(dev, source_inum)) {
            Some(entry) => Lookup::Existing(entry.target_inum),
            None => Lookup::New,
        }
    }

    pub fn register(
        &mut self,
        dev: u64,
        source_inum: u64,
        target_inum: u64,
        path: &str,
        stat: Stat,
    ) {
        let key = (dev, source_inum);
        if !self.entries.contains_key(&key) {
            self.order.push(key);
        }
        let entry = self.entries.entry(key).or_insert_with(|| IdentityEntry {
            target_inum,
            observed_nlink: 0,
            first_path: path.to_string(),
            stat,
        });
        entry.observed_nlink += 1;
    }

    /// Drains in table (first-seen) order for the deferred multi-link
    /// emission pass.
    pub fn drain_in_order(&mut self) -> Vec<((u64, u64), IdentityEntry)> {
        let order = std::mem::take(&mut self.order);
        let mut entries = std::mem::take(&mut self.entries);
        order
            .into_iter()
            .filter_map(|key| entries.remove(&key).map(|e| (key, e)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hostfs::FileKind;

    fn stub_stat() -> Stat {
        Stat {
            kind: FileKind::Regular,
            mode: 0o644,
            uid: 0,
            gid: 0,
            size: 0,
            nlink: 2,
            dev: 1,
            inum: 42,
            rdev_major: 0,
            rdev_minor: 0,
            atime_sec: 0,
            ctime_sec: 0,
            mtime_sec: 0,
        }
    }

    #[test]
    fn first_lookup_is_new() {
        let table = IdentityTable::default();
        assert!(matches!(table.lookup(1, 42), Lookup::New));
    }

    #[test]
    fn second_lookup_reuses_target_inum() {
        let mut table = IdentityTable::default();
        table.register(1, 42, 7, "a", stub_stat());
        table.register(1, 42, 7, "b", stub_stat());
        assert!(matches!(table.lookup(1, 42), Lookup::Existing(7)));
        let drained = table.drain_in_order();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].1.observed_nlink, 2);
    }

    #[test]
    fn drains_in_first_seen_order() {
        let mut table = IdentityTable::default();
        table.register(1, 1, 10, "a", stub_stat());
        table.register(1, 2, 11, "b", stub_stat());
        let drained = table.drain_in_order();
        assert_eq!(drained[0].0, (1, 1));
        assert_eq!(drained[1].0, (1, 2));
    }
}
