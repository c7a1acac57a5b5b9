#![forbid(unsafe_code)]
//! Bitmap primitives and block storage for the realtime allocator.
//!
//! The realtime bitmap carries one bit per allocation unit (set =
//! allocated, clear = free), packed LSB-first into fixed-size metadata
//! blocks. This crate provides:
//!
//! 1. **[`BlockStore`]** — the storage seam: read/write/extend of
//!    fixed-size metadata blocks, with in-memory and file-backed
//!    implementations.
//! 2. **[`Transaction`]** — staged writes across the superblock, bitmap,
//!    and summary files. Reads are staged-aware; `commit` applies every
//!    staged block, so a request's bitmap flip and summary repair land
//!    together or not at all.
//! 3. **Range primitives** — `check_range`, `modify_range`,
//!    `find_run_back`, `find_run_forw`, `for_each_free_run`. These are
//!    the only code that touches raw bitmap bits; the search and commit
//!    layers above work in whole units.

pub mod store;

use std::collections::BTreeMap;

pub use store::{BlockStore, FileBlockStore, MemBlockStore};

use rill_error::{Result, RillError};
use rill_types::{RtGeometry, UnitNumber};
use tracing::trace;

// ── Metadata files and transactions ─────────────────────────────────────────

/// Which metadata file a block belongs to.
///
/// The three files are stored separately so the bitmap and summary can
/// grow independently during resize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MetaFile {
    Super,
    Bitmap,
    Summary,
}

/// The three backing stores of one realtime group.
pub struct RtStores {
    pub sb: Box<dyn BlockStore>,
    pub bitmap: Box<dyn BlockStore>,
    pub summary: Box<dyn BlockStore>,
}

impl std::fmt::Debug for RtStores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtStores")
            .field("sb_blocks", &self.sb.block_count())
            .field("bitmap_blocks", &self.bitmap.block_count())
            .field("summary_blocks", &self.summary.block_count())
            .finish()
    }
}

impl RtStores {
    /// In-memory stores sized for a fresh group: one superblock block,
    /// `bitmap_blocks` bitmap blocks, `sum_blocks` summary blocks.
    #[must_use]
    pub fn in_memory(block_size: u32, bitmap_blocks: u64, sum_blocks: u64) -> Self {
        Self {
            sb: Box::new(MemBlockStore::new(block_size, 1)),
            bitmap: Box::new(MemBlockStore::new(block_size, bitmap_blocks)),
            summary: Box::new(MemBlockStore::new(block_size, sum_blocks)),
        }
    }

    #[must_use]
    pub fn store(&self, file: MetaFile) -> &dyn BlockStore {
        match file {
            MetaFile::Super => self.sb.as_ref(),
            MetaFile::Bitmap => self.bitmap.as_ref(),
            MetaFile::Summary => self.summary.as_ref(),
        }
    }
}

/// A staged set of metadata block writes.
///
/// All mutation in the allocator goes through a transaction: callers read
/// through it (staged blocks shadow the store), stage replacement blocks,
/// and finally `commit`. Dropping a transaction without committing
/// discards every staged write. Durability of the committed writes is the
/// block store's concern; the group-scoped exclusive lock held across
/// search + commit keeps partially staged state invisible to other
/// requests.
pub struct Transaction<'s> {
    stores: &'s RtStores,
    staged: BTreeMap<(MetaFile, u64), Vec<u8>>,
}

impl<'s> Transaction<'s> {
    #[must_use]
    pub fn new(stores: &'s RtStores) -> Self {
        Self {
            stores,
            staged: BTreeMap::new(),
        }
    }

    /// Read a block, preferring a staged copy over the store.
    pub fn read(&self, file: MetaFile, block: u64) -> Result<Vec<u8>> {
        if let Some(staged) = self.staged.get(&(file, block)) {
            return Ok(staged.clone());
        }
        self.stores.store(file).read_block(block)
    }

    /// Stage a replacement block.
    pub fn stage(&mut self, file: MetaFile, block: u64, data: Vec<u8>) {
        self.staged.insert((file, block), data);
    }

    /// Number of staged blocks.
    #[must_use]
    pub fn staged_len(&self) -> usize {
        self.staged.len()
    }

    /// Apply every staged write to the backing stores.
    ///
    /// An I/O failure mid-apply aborts the operation; the caller
    /// propagates the error and the group stays at its last good state
    /// (the storage layer's journal owns crash atomicity of the writes
    /// themselves).
    pub fn commit(self) -> Result<()> {
        trace!(staged = self.staged.len(), "transaction commit");
        let mut touched = [false; 3];
        for ((file, block), data) in &self.staged {
            self.stores.store(*file).write_block(*block, data)?;
            touched[*file as usize] = true;
        }
        for (idx, file) in [MetaFile::Super, MetaFile::Bitmap, MetaFile::Summary]
            .iter()
            .enumerate()
        {
            if touched[idx] {
                self.stores.store(*file).sync()?;
            }
        }
        Ok(())
    }

    /// Discard every staged write.
    pub fn abort(self) {
        trace!(staged = self.staged.len(), "transaction abort");
        drop(self);
    }
}

// ── Bit addressing helpers ──────────────────────────────────────────────────

#[inline]
fn bit_is_set(buf: &[u8], bit: u64) -> bool {
    let byte = (bit / 8) as usize;
    (buf[byte] >> (bit % 8)) & 1 == 1
}

fn range_check(geom: &RtGeometry, start: UnitNumber, len: u64) -> Result<()> {
    let end = start.0.checked_add(len);
    if len == 0 || end.is_none() || end.unwrap_or(u64::MAX) > geom.total_units {
        return Err(RillError::InvalidRequest(format!(
            "bitmap range [{start}, +{len}) outside group of {} units",
            geom.total_units
        )));
    }
    Ok(())
}

// ── Range primitives ────────────────────────────────────────────────────────

/// Check whether `[start, start + len)` is entirely free (or entirely
/// allocated, for `want_free = false`).
///
/// Returns `(true, start + len)` when the whole range matches, otherwise
/// `(false, u)` where `u` is the first unit violating the requested
/// state.
pub fn check_range(
    tx: &Transaction<'_>,
    geom: &RtGeometry,
    start: UnitNumber,
    len: u64,
    want_free: bool,
) -> Result<(bool, UnitNumber)> {
    range_check(geom, start, len)?;

    let end = start.0 + len - 1;
    let upb = geom.units_per_block();
    let desired_byte: u8 = if want_free { 0x00 } else { 0xFF };

    let mut block = start.0 / upb;
    loop {
        let buf = tx.read(MetaFile::Bitmap, block)?;
        let block_base = block * upb;
        let lo = start.0.max(block_base) - block_base;
        let hi = end.min(block_base + upb - 1) - block_base;

        let mut bit = lo;
        while bit <= hi {
            // Whole-byte fast path once aligned.
            if bit % 8 == 0 && bit + 7 <= hi {
                let byte = buf[(bit / 8) as usize];
                if byte == desired_byte {
                    bit += 8;
                    continue;
                }
            }
            if bit_is_set(&buf, bit) == want_free {
                return Ok((false, UnitNumber(block_base + bit)));
            }
            bit += 1;
        }

        if block_base + upb > end {
            return Ok((true, UnitNumber(start.0 + len)));
        }
        block += 1;
    }
}

/// Flip `[start, start + len)` to allocated (`make_free = false`) or free.
///
/// Staged into `tx`; nothing reaches the store until the transaction
/// commits.
pub fn modify_range(
    tx: &mut Transaction<'_>,
    geom: &RtGeometry,
    start: UnitNumber,
    len: u64,
    make_free: bool,
) -> Result<()> {
    range_check(geom, start, len)?;

    let end = start.0 + len - 1;
    let upb = geom.units_per_block();

    let mut block = start.0 / upb;
    loop {
        let mut buf = tx.read(MetaFile::Bitmap, block)?;
        let block_base = block * upb;
        let lo = start.0.max(block_base) - block_base;
        let hi = end.min(block_base + upb - 1) - block_base;

        let mut bit = lo;
        while bit <= hi {
            if bit % 8 == 0 && bit + 7 <= hi {
                buf[(bit / 8) as usize] = if make_free { 0x00 } else { 0xFF };
                bit += 8;
                continue;
            }
            let byte = (bit / 8) as usize;
            let mask = 1u8 << (bit % 8);
            if make_free {
                buf[byte] &= !mask;
            } else {
                buf[byte] |= mask;
            }
            bit += 1;
        }
        tx.stage(MetaFile::Bitmap, block, buf);

        if block_base + upb > end {
            return Ok(());
        }
        block += 1;
    }
}

/// Scanning backward from `from`, find the first unit of the run of
/// same-state units containing `from`.
///
/// Allocation commit calls this with a free `from` to locate the start of
/// the enclosing free extent.
pub fn find_run_back(
    tx: &Transaction<'_>,
    geom: &RtGeometry,
    from: UnitNumber,
) -> Result<UnitNumber> {
    range_check(geom, from, 1)?;

    let upb = geom.units_per_block();
    let mut block = from.0 / upb;
    let mut buf = tx.read(MetaFile::Bitmap, block)?;
    let state = bit_is_set(&buf, from.0 - block * upb);
    let uniform: u8 = if state { 0xFF } else { 0x00 };

    let mut unit = from.0;
    loop {
        let block_base = block * upb;
        let mut bit = unit - block_base;
        loop {
            if bit % 8 == 7 && buf[(bit / 8) as usize] == uniform {
                // Whole byte matches the run state, skip it.
                if bit == 7 {
                    break;
                }
                bit -= 8;
                continue;
            }
            if bit_is_set(&buf, bit) != state {
                return Ok(UnitNumber(block_base + bit + 1));
            }
            if bit == 0 {
                break;
            }
            bit -= 1;
        }

        // Bottom of this block reached without a state change.
        if block == 0 {
            return Ok(UnitNumber(0));
        }
        block -= 1;
        buf = tx.read(MetaFile::Bitmap, block)?;
        unit = block * upb + upb - 1;
    }
}

/// Scanning forward from `from` up to `limit` (inclusive), find the last
/// unit of the run of same-state units containing `from`.
///
/// Allocation commit calls this with a free `from` to locate the end of
/// the enclosing free extent; the per-block search calls it with an
/// allocated `from` to skip past an allocated run.
pub fn find_run_forw(
    tx: &Transaction<'_>,
    geom: &RtGeometry,
    from: UnitNumber,
    limit: UnitNumber,
) -> Result<UnitNumber> {
    range_check(geom, from, 1)?;
    if limit < from || limit.0 >= geom.total_units {
        return Err(RillError::InvalidRequest(format!(
            "find_run_forw limit {limit} outside [{from}, {})",
            geom.total_units
        )));
    }

    let upb = geom.units_per_block();
    let mut block = from.0 / upb;
    let mut buf = tx.read(MetaFile::Bitmap, block)?;
    let state = bit_is_set(&buf, from.0 - block * upb);
    let uniform: u8 = if state { 0xFF } else { 0x00 };

    let mut unit = from.0;
    loop {
        let block_base = block * upb;
        let hi = limit.0.min(block_base + upb - 1) - block_base;
        let mut bit = unit - block_base;
        while bit <= hi {
            if bit % 8 == 0 && bit + 7 <= hi && buf[(bit / 8) as usize] == uniform {
                bit += 8;
                continue;
            }
            if bit_is_set(&buf, bit) != state {
                return Ok(UnitNumber(block_base + bit - 1));
            }
            bit += 1;
        }

        if block_base + hi == limit.0 {
            return Ok(limit);
        }
        block += 1;
        buf = tx.read(MetaFile::Bitmap, block)?;
        unit = block * upb;
    }
}

/// Enumerate every maximal free run in unit order.
///
/// Used by free-count reinitialization and by test verification; the
/// callback receives `(start, length)` per run.
pub fn for_each_free_run(
    tx: &Transaction<'_>,
    geom: &RtGeometry,
    mut f: impl FnMut(UnitNumber, u64),
) -> Result<()> {
    if geom.total_units == 0 {
        return Ok(());
    }

    let upb = geom.units_per_block();
    let mut run_start: Option<u64> = None;

    for block in 0..geom.bitmap_blocks {
        let buf = tx.read(MetaFile::Bitmap, block)?;
        let block_base = block * upb;
        let hi = (geom.total_units - 1).min(block_base + upb - 1) - block_base;

        let mut bit = 0u64;
        while bit <= hi {
            // Byte-at-a-time skip while the state is uniform.
            if bit % 8 == 0 && bit + 7 <= hi {
                let byte = buf[(bit / 8) as usize];
                if byte == 0x00 {
                    run_start.get_or_insert(block_base + bit);
                    bit += 8;
                    continue;
                }
                if byte == 0xFF {
                    if let Some(start) = run_start.take() {
                        f(UnitNumber(start), block_base + bit - start);
                    }
                    bit += 8;
                    continue;
                }
            }
            if bit_is_set(&buf, bit) {
                if let Some(start) = run_start.take() {
                    f(UnitNumber(start), block_base + bit - start);
                }
            } else {
                run_start.get_or_insert(block_base + bit);
            }
            bit += 1;
        }
    }

    if let Some(start) = run_start {
        f(UnitNumber(start), geom.total_units - start);
    }
    Ok(())
}

/// Count free units in the whole group by direct popcount.
pub fn count_free_units(tx: &Transaction<'_>, geom: &RtGeometry) -> Result<u64> {
    let mut free = 0u64;
    for_each_free_run(tx, geom, |_, len| free += len)?;
    Ok(free)
}

// ── Tests ───────────────────────────────────────────────────────────────────
