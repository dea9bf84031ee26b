//! Write Head: a single append-only cursor over the main area, streaming
//! LEB-sized chunks with explicit flush semantics and LEB-property
//! recording.

use crate::consts::PAD_NODE_SZ;
use crate::error::BuildError;
use crate::ledger::Ledger;
use crate::node::{self, NodeType, PadPayload, SqnumCounter, finish_node};
use crate::sink::Sink;

fn align(x: u32, to: u32) -> u32 {
    (x + to - 1) / to * to
}

pub struct WriteHead {
    pub lnum: u32,
    pub offs: u32,
    leb_size: u32,
    min_io_size: u32,
    buf: Vec<u8>,
    /// Whether a LEB flushed by an automatic (overflow-triggered) or
    /// explicit flush right now should be recorded as an index LEB in the
    /// ledger. The leaf emitter and index builder toggle this as they hand
    /// off the same head to each other, since leaf nodes and index nodes
    /// share the main area, LEB by LEB.
    index_mode: bool,
}

impl WriteHead {
    pub fn new(start_lnum: u32, leb_size: u32, min_io_size: u32) -> Self {
        WriteHead {
            lnum: start_lnum,
            offs: 0,
            leb_size,
            min_io_size,
            buf: vec![0xFFu8; leb_size as usize],
            index_mode: false,
        }
    }

    pub fn position(&self) -> (u32, u32) {
        (self.lnum, self.offs)
    }

    pub fn set_index_mode(&mut self, on: bool) {
        self.index_mode = on;
    }

    /// Reserves `n` bytes, flushing first if they don't fit in the current
    /// LEB. Returns the position the caller should write at,
    /// and advances the head by `align(n, 8)`.
    pub fn reserve(
        &mut self,
        n: u32,
        sqnum: &mut SqnumCounter,
        ledger: &mut Ledger,
        sink: &mut dyn Sink,
    ) -> Result<(u32, u32), BuildError> {
        if n > self.leb_size - self.offs {
            self.flush(sqnum, ledger, sink)?;
        }
        let pos = (self.lnum, self.offs);
        self.offs += align(n, 8);
        Ok(pos)
    }

    pub fn write_at(&mut self, offs: u32, data: &[u8]) {
        let start = offs as usize;
        self.buf[start..start + data.len()].copy_from_slice(data);
    }

    /// Appends `data` at the current offset, reserving space for it first.
    pub fn append(
        &mut self,
        data: &[u8],
        sqnum: &mut SqnumCounter,
        ledger: &mut Ledger,
        sink: &mut dyn Sink,
    ) -> Result<(u32, u32), BuildError> {
        let (lnum, offs) = self.reserve(data.len() as u32, sqnum, ledger, sink)?;
        self.write_at(offs, data);
        Ok((lnum, offs))
    }

    /// Pads the tail, hands the full LEB to the sink, records LEB
    /// properties, and advances to `(lnum + 1, 0)`. The gap from `offs` up
    /// to `align(offs, min_io)` is covered by a pad node when it's large
    /// enough to hold one; everything past that (including the rest of the
    /// LEB) is 0xFF fill.
    pub fn flush(&mut self, sqnum: &mut SqnumCounter, ledger: &mut Ledger, sink: &mut dyn Sink) -> Result<(), BuildError> {
        let used = self.offs;
        let aligned = align(self.offs, self.min_io_size).min(self.leb_size);
        if aligned > self.offs {
            let pad_span = aligned - self.offs;
            let start = self.offs as usize;
            if pad_span >= PAD_NODE_SZ {
                let payload = PadPayload {
                    pad_len: pad_span - PAD_NODE_SZ,
                };
                let pad_bytes = finish_node(sqnum, NodeType::Pad, 0, &node::to_bytes(&payload));
                self.buf[start..start + pad_bytes.len()].copy_from_slice(&pad_bytes);
                for b in &mut self.buf[start + pad_bytes.len()..aligned as usize] {
                    *b = 0xFF;
                }
            } else {
                for b in &mut self.buf[start..aligned as usize] {
                    *b = 0xFF;
                }
            }
        }
        for b in &mut self.buf[aligned as usize..] {
            *b = 0xFF;
        }
        sink.write_leb(self.lnum, &self.buf)?;
        ledger.record(self.lnum, self.leb_size, self.min_io_size, used, self.index_mode);
        self.lnum += 1;
        self.offs = 0;
        self.buf.iter_mut().for_each(|b| *b = 0xFF);
        Ok(())
    }

    /// Advances past an intentionally empty LEB without recording used
    /// space beyond bumping `empty_lebs`.
    pub fn skip_empty(&mut self, ledger: &mut Ledger, sink: &mut dyn Sink) -> Result<(), BuildError> {
        assert_eq!(self.offs, 0, "skip_empty called mid-LEB");
        sink.write_leb(self.lnum, &self.buf)?;
        ledger.record_empty(self.lnum, self.leb_size);
        self.lnum += 1;
        Ok(())
    }

    pub fn min_io_size(&self) -> u32 {
        self.min_io_size
    }

    pub fn leb_size(&self) -> u32 {
        self.leb_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemSink;

    #[test]
    fn reserve_advances_by_aligned_len() {
        let mut head = WriteHead::new(0, 1024, 8);
        let mut sqnum = SqnumCounter::default();
        let mut ledger = Ledger::default();
        let mut sink = MemSink::new(1024);
        let (lnum, offs) = head.reserve(5, &mut sqnum, &mut ledger, &mut sink).unwrap();
        assert_eq!((lnum, offs), (0, 0));
        assert_eq!(head.offs, 8);
    }

    #[test]
    fn reserve_past_leb_boundary_flushes_first() {
        let mut head = WriteHead::new(0, 16, 8);
        let mut sqnum = SqnumCounter::default();
        let mut ledger = Ledger::default();
        let mut sink = MemSink::new(16);
        head.reserve(10, &mut sqnum, &mut ledger, &mut sink).unwrap();
        let (lnum, offs) = head.reserve(10, &mut sqnum, &mut ledger, &mut sink).unwrap();
        assert_eq!((lnum, offs), (1, 0));
    }

    #[test]
    fn flush_pads_tail_with_0xff() {
        let mut head = WriteHead::new(0, 16, 8);
        let mut sqnum = SqnumCounter::default();
        let mut ledger = Ledger::default();
        let mut sink = MemSink::new(16);
        head.append(&[1, 2, 3], &mut sqnum, &mut ledger, &mut sink).unwrap();
        head.flush(&mut sqnum, &mut ledger, &mut sink).unwrap();
        let leb = sink.leb(0).unwrap();
        assert_eq!(&leb[0..3], &[1, 2, 3]);
        assert!(leb[8..].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn flush_writes_a_pad_node_when_the_gap_fits_one() {
        let mut head = WriteHead::new(0, 4096, 2048);
        let mut sqnum = SqnumCounter::default();
        let mut ledger = Ledger::default();
        let mut sink = MemSink::new(4096);
        head.append(&[1, 2, 3], &mut sqnum, &mut ledger, &mut sink).unwrap();
        head.flush(&mut sqnum, &mut ledger, &mut sink).unwrap();
        let leb = sink.leb(0).unwrap();
        // The [3, 2048) gap is wide enough for a pad node: its header's
        // magic should appear right after the aligned append.
        let pad_node = &leb[8..2048];
        assert_eq!(&pad_node[0..4], &crate::consts::NODE_MAGIC.to_le_bytes());
        assert!(leb[2048..].iter().all(|&b| b == 0xFF));
    }
}
