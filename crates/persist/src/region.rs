//! One auto-resizing mmap region with a trailing length footer.
//!
//! Layout: `[reserved head][payload][..undefined..][len: u64 LE]`. The
//! footer occupies the final 8 bytes of the file and is the authoritative
//! payload length; bytes between payload end and footer are undefined.
//!
//! Callers (the persister) serialize access: `write`/`write_meta_i64` only
//! run under the persister's exclusive lock, `read`/`payload_len` under
//! its shared lock. Resizing remaps, so no reader may hold a reference
//! into the map across a write — the lock discipline guarantees that.

use std::fs::{File, OpenOptions};
use std::path::Path;

use memmap2::MmapMut;
use snafu::ResultExt;
use tracing::{debug, warn};

use crate::error::{IoSnafu, Result};

/// Byte length of the trailing footer.
const FOOTER_LEN: usize = 8;

/// Reads exactly `buf.len()` bytes at `offset` without moving the cursor.
#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(not(unix))]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::io::{Read, Seek, SeekFrom};
    let mut f = file;
    f.seek(SeekFrom::Start(offset))?;
    f.read_exact(buf)
}

pub(crate) struct Region {
    /// Region name for logs and errors ("raft" or "snapshot").
    name: &'static str,
    file: File,
    map: MmapMut,
    /// Reserved metadata bytes before the payload.
    head: usize,
}

impl Region {
    /// Opens or creates the backing file and maps it.
    ///
    /// A file smaller than `requested_len` (including a fresh one) is
    /// extended to it; extension zero-fills, so a fresh footer reads as an
    /// empty payload. A file already at or above `requested_len` is never
    /// truncated here — its footer may point at a payload the caller still
    /// needs.
    pub(crate) fn open(
        name: &'static str,
        path: &Path,
        requested_len: u64,
        head: usize,
    ) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .context(IoSnafu { name })?;

        let min_len = (head + FOOTER_LEN) as u64;
        let target = requested_len.max(min_len);
        let current = file.metadata().context(IoSnafu { name })?.len();

        // Extending moves the footer position, so carry the old footer
        // value forward; otherwise a re-run with a larger pre-allocation
        // would read the payload length as zero.
        let mut carried_footer = None;
        if current >= target {
            if current > target {
                warn!(
                    region = name,
                    current,
                    requested = target,
                    "file larger than requested, keeping as-is"
                );
            }
        } else {
            if current >= min_len {
                let mut old = [0u8; FOOTER_LEN];
                read_exact_at(&file, &mut old, current - FOOTER_LEN as u64)
                    .context(IoSnafu { name })?;
                carried_footer = Some(old);
            }
            file.set_len(target).context(IoSnafu { name })?;
        }

        // SAFETY: the map stays private to this process; the file is held
        // open for the lifetime of the mapping and only resized by this
        // struct, under the persister's exclusive lock, with a remap
        // before any further access.
        let mut map = unsafe { MmapMut::map_mut(&file) }.context(IoSnafu { name })?;
        if let Some(old) = carried_footer {
            let at = map.len() - FOOTER_LEN;
            map[at..].copy_from_slice(&old);
            map.flush_range(at, FOOTER_LEN).context(IoSnafu { name })?;
        }
        Ok(Self { name, file, map, head })
    }

    /// Usable payload capacity of the current mapping.
    fn capacity(&self) -> usize {
        self.map.len() - self.head - FOOTER_LEN
    }

    /// Payload length according to the footer.
    pub(crate) fn payload_len(&self) -> usize {
        let at = self.map.len() - FOOTER_LEN;
        let raw = u64::from_le_bytes(self.map[at..].try_into().expect("footer is 8 bytes"));
        // A footer beyond capacity can only come from external corruption;
        // clamp so size polls stay total and `read` reports the fault.
        raw.min(self.capacity() as u64) as usize
    }

    /// Copies out the current payload.
    pub(crate) fn read(&self) -> Result<Vec<u8>> {
        let at = self.map.len() - FOOTER_LEN;
        let len = u64::from_le_bytes(self.map[at..].try_into().expect("footer is 8 bytes"));
        let capacity = self.capacity() as u64;
        snafu::ensure!(
            len <= capacity,
            crate::error::CorruptedSnafu { name: self.name, len, capacity }
        );
        let len = len as usize;
        Ok(self.map[self.head..self.head + len].to_vec())
    }

    /// Replaces the payload, resizing the file first when needed.
    ///
    /// Ordering is payload copy, flush, footer, flush: the footer never
    /// points at bytes that have not reached the kernel.
    pub(crate) fn write(&mut self, payload: &[u8]) -> Result<()> {
        let required = self.head + payload.len() + FOOTER_LEN;
        if required > self.map.len() / 2 {
            self.resize(2 * required)?;
        } else if self.map.len() > required * 4 {
            self.resize(2 * required)?;
        }

        let head = self.head;
        self.map[head..head + payload.len()].copy_from_slice(payload);
        self.map.flush_range(head, payload.len().max(1)).context(IoSnafu { name: self.name })?;

        let at = self.map.len() - FOOTER_LEN;
        self.map[at..].copy_from_slice(&(payload.len() as u64).to_le_bytes());
        self.map.flush_range(at, FOOTER_LEN).context(IoSnafu { name: self.name })?;
        Ok(())
    }

    /// Writes one reserved i64 head slot and flushes it.
    pub(crate) fn write_meta_i64(&mut self, slot: usize, value: i64) -> Result<()> {
        let at = slot * 8;
        debug_assert!(at + 8 <= self.head, "slot outside reserved head");
        self.map[at..at + 8].copy_from_slice(&value.to_le_bytes());
        self.map.flush_range(at, 8).context(IoSnafu { name: self.name })
    }

    /// Reads one reserved i64 head slot.
    pub(crate) fn read_meta_i64(&self, slot: usize) -> i64 {
        let at = slot * 8;
        debug_assert!(at + 8 <= self.head, "slot outside reserved head");
        i64::from_le_bytes(self.map[at..at + 8].try_into().expect("slot is 8 bytes"))
    }

    /// Grows or shrinks the file to `new_len` and remaps.
    ///
    /// The reserved head is preserved by the resize (truncation only cuts
    /// the tail); payload and footer are rewritten by the caller.
    fn resize(&mut self, new_len: usize) -> Result<()> {
        debug!(region = self.name, from = self.map.len(), to = new_len, "resizing region");
        self.file.set_len(new_len as u64).context(IoSnafu { name: self.name })?;
        // SAFETY: same invariants as in `open`; the old mapping is dropped
        // on assignment and never touched after `set_len`.
        self.map = unsafe { MmapMut::map_mut(&self.file) }.context(IoSnafu { name: self.name })?;
        Ok(())
    }
}
