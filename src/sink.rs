//! Target Sink: either a seekable regular file or a UBI volume, addressed
//! by LEB-number + buffer rather than a raw byte offset, with an explicit
//! `finish()` that pads any untouched LEBs with 0xFF so the file sink's
//! length invariant holds.

use std::collections::HashSet;
use std::io::{self, Seek, SeekFrom, Write};

use crate::error::BuildError;

pub trait Sink {
    fn write_leb(&mut self, lnum: u32, buf: &[u8]) -> Result<(), BuildError>;
    fn finish(&mut self, leb_cnt: u32, leb_size: u32) -> Result<(), BuildError>;
}

/// Writes into a regular seekable file. Untouched LEBs read back as 0xFF:
/// `finish` fills every LEB below `leb_cnt` that was never explicitly
/// written with a full 0xFF buffer, not just the file's trailing byte —
/// a sparse file's zero-filled holes would otherwise violate the "every
/// byte outside written node regions is 0xFF" invariant.
pub struct FileSink<W: Write + Seek> {
    writer: W,
    leb_size: u32,
    written: HashSet<u32>,
}

impl<W: Write + Seek> FileSink<W> {
    pub fn new(writer: W, leb_size: u32) -> Self {
        FileSink {
            writer,
            leb_size,
            written: HashSet::new(),
        }
    }
}

impl<W: Write + Seek> Sink for FileSink<W> {
    fn write_leb(&mut self, lnum: u32, buf: &[u8]) -> Result<(), BuildError> {
        assert_eq!(buf.len(), self.leb_size as usize);
        self.writer
            .seek(SeekFrom::Start(lnum as u64 * self.leb_size as u64))
            .and_then(|_| self.writer.write_all(buf))
            .map_err(|cause| BuildError::SinkIo { lnum, cause })?;
        self.written.insert(lnum);
        Ok(())
    }

    fn finish(&mut self, leb_cnt: u32, leb_size: u32) -> Result<(), BuildError> {
        assert_eq!(leb_size, self.leb_size);
        let blank = vec![0xFFu8; leb_size as usize];
        for lnum in 0..leb_cnt {
            if !self.written.contains(&lnum) {
                self.writer
                    .seek(SeekFrom::Start(lnum as u64 * leb_size as u64))
                    .and_then(|_| self.writer.write_all(&blank))
                    .map_err(|cause| BuildError::SinkIo { lnum, cause })?;
            }
        }
        Ok(())
    }
}

/// The capability interface a real UBI character device driver would sit
/// behind; consumed here as a plain (lnum, buffer) sink.
pub trait UbiVolume {
    fn leb_change(&mut self, lnum: u32, buf: &[u8]) -> io::Result<()>;
    fn leb_size(&self) -> u32;
}

pub struct UbiSink<V: UbiVolume> {
    volume: V,
}

impl<V: UbiVolume> UbiSink<V> {
    pub fn new(volume: V) -> Self {
        UbiSink { volume }
    }
}

impl<V: UbiVolume> Sink for UbiSink<V> {
    fn write_leb(&mut self, lnum: u32, buf: &[u8]) -> Result<(), BuildError> {
        self.volume
            .leb_change(lnum, buf)
            .map_err(|cause| BuildError::SinkIo { lnum, cause })
    }

    fn finish(&mut self, _leb_cnt: u32, _leb_size: u32) -> Result<(), BuildError> {
        // UBI volumes have no "pad the rest" concept: unwritten LEBs are
        // simply never leb_change()'d.
        Ok(())
    }
}

/// In-memory sink used by unit tests.
#[cfg(test)]
pub struct MemSink {
    lebs: Vec<Option<Vec<u8>>>,
    leb_size: u32,
}

#[cfg(test)]
impl MemSink {
    pub fn new(leb_size: u32) -> Self {
        MemSink {
            lebs: Vec::new(),
            leb_size,
        }
    }

    pub fn leb(&self, lnum: u32) -> Option<&[u8]> {
        self.lebs.get(lnum as usize)?.as_deref()
    }
}

#[cfg(test)]
impl Sink for MemSink {
    fn write_leb(&mut self, lnum: u32, buf: &[u8]) -> Result<(), BuildError> {
        let idx = lnum as usize;
        if idx >= self.lebs.len() {
            self.lebs.resize(idx + 1, None);
        }
        self.lebs[idx] = Some(buf.to_vec());
        Ok(())
    }

    fn finish(&mut self, leb_cnt: u32, _leb_size: u32) -> Result<(), BuildError> {
        if self.lebs.len() < leb_cnt as usize {
            self.lebs.resize(leb_cnt as usize, None);
        }
        for slot in &mut self.lebs {
            if slot.is_none() {
                *slot = Some(vec![0xFFu8; self.leb_size as usize]);
            }
        }
        Ok(())
    }
}
