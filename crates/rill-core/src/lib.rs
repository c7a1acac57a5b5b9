#![forbid(unsafe_code)]
//! Realtime group lifecycle and the public allocation API.
//!
//! [`RtGroup`] owns the three metadata stores (superblock, bitmap,
//! summary), the parsed superblock, and the in-memory summary cache.
//! Mutating operations — allocate, free, each resize step — run under
//! one group-scoped exclusive lock for their whole duration, so a
//! request's search and commit can never be interleaved with another
//! writer. Resize additionally serializes against other resizes with a
//! coarser lock held across all steps.
//!
//! ## Lifecycle
//!
//! - [`RtGroup::format`] writes a fresh, size-zero superblock; real
//!   capacity is added through [`RtGroup::resize`], the same path that
//!   grows a live group.
//! - [`RtGroup::mount`] parses and cross-checks the superblock, then
//!   builds the summary cache at its safe "unknown" default. The cache
//!   is never persisted; a remount rebuilds it from scratch.
//! - [`RtGroup::unmount`] hands the stores back and discards the cache.

pub mod sb;

use parking_lot::{Mutex, RwLock};
use rill_alloc::{
    AllocCtx, SummaryCache, allocate_range, free_range, get_summary, modify_summary, pick_initial,
    search::{search_by_size, search_near},
};
use rill_bitmap::{MetaFile, RtStores, Transaction, check_range, for_each_free_run};
use rill_error::{Result, RillError};
use rill_types::{BitmapBlock, RtExtent, RtGeometry, UnitNumber};
use tracing::{debug, info, warn};

pub use sb::{FEAT_QUOTA, FEAT_REFLINK, RILL_SUPER_MAGIC, RILL_SUPER_VERSION, RtSuperblock};

// ── Requests ────────────────────────────────────────────────────────────────

/// An extent allocation request.
#[derive(Debug, Clone, Copy)]
pub struct AllocRequest {
    /// Place the result as near this unit as possible.
    pub near: Option<UnitNumber>,
    /// Minimum acceptable length in units.
    pub min_len: u64,
    /// Requested length in units.
    pub max_len: u64,
    /// Returned length must be a multiple of this product (1 = no
    /// constraint). Misaligned min/max are rounded inward; if that
    /// inverts them, the product is dropped instead.
    pub prod: u64,
    /// First allocation of a fresh destination with no hint: derive a
    /// spread-out start from the group's placement sequence.
    pub initial_spread: bool,
}

impl AllocRequest {
    /// A fixed-length request with no placement preference.
    #[must_use]
    pub fn exact(len: u64) -> Self {
        Self {
            near: None,
            min_len: len,
            max_len: len,
            prod: 1,
            initial_spread: false,
        }
    }

    /// A variable-length request.
    #[must_use]
    pub fn between(min_len: u64, max_len: u64) -> Self {
        Self {
            min_len,
            max_len,
            ..Self::exact(0)
        }
    }
}

/// Options for formatting a fresh group.
#[derive(Debug, Clone, Copy)]
pub struct FormatOptions {
    /// Metadata block size for superblock, bitmap, and summary blocks.
    pub block_size: u32,
    /// Allocation unit size in bytes.
    pub unit_size_bytes: u32,
    /// Log region capacity in blocks; bounds the summary size a resize
    /// may reach.
    pub log_blocks: u64,
    /// Feature flags ([`FEAT_REFLINK`], [`FEAT_QUOTA`]).
    pub flags: u16,
}

/// Round min up and max down to multiples of `prod`; if that inverts
/// the pair, drop the alignment constraint instead.
fn align_minmax(min_len: &mut u64, max_len: &mut u64, prod: &mut u64) {
    let new_max = *max_len - *max_len % *prod;
    let slack = *min_len % *prod;
    let new_min = if slack > 0 {
        *min_len + (*prod - slack)
    } else {
        *min_len
    };
    if new_max < new_min {
        *prod = 1;
        return;
    }
    *min_len = new_min;
    *max_len = new_max;
}

fn validate_request(req: &AllocRequest) -> Result<(u64, u64, u64)> {
    if req.min_len == 0 {
        return Err(RillError::InvalidRequest(
            "minimum length must be nonzero".to_owned(),
        ));
    }
    if req.min_len > req.max_len {
        return Err(RillError::InvalidRequest(format!(
            "minimum length {} exceeds maximum {}",
            req.min_len, req.max_len
        )));
    }
    let mut min_len = req.min_len;
    let mut max_len = req.max_len;
    let mut prod = req.prod.max(1);
    if prod > 1 {
        align_minmax(&mut min_len, &mut max_len, &mut prod);
    }
    Ok((min_len, max_len, prod))
}

// ── Group object ────────────────────────────────────────────────────────────

struct GroupInner {
    stores: RtStores,
    sb: RtSuperblock,
    geom: RtGeometry,
    cache: SummaryCache,
}

/// One mounted realtime group.
pub struct RtGroup {
    inner: RwLock<GroupInner>,
    /// Serializes resize attempts; growth is rare and must not
    /// interleave with another growth.
    grow_lock: Mutex<()>,
}

impl RtGroup {
    /// Write a fresh, size-zero superblock and mount the group.
    ///
    /// Capacity is added by [`RtGroup::resize`]; formatting and growing
    /// share the same incremental path.
    pub fn format(stores: RtStores, opts: &FormatOptions) -> Result<Self> {
        check_store_block_sizes(&stores, opts.block_size)?;
        let geom = RtGeometry::compute(opts.block_size, opts.unit_size_bytes, 0)
            .map_err(|e| RillError::InvalidGeometry(e.to_string()))?;

        let superblock = RtSuperblock {
            version: RILL_SUPER_VERSION,
            flags: opts.flags,
            block_size: opts.block_size,
            unit_size_bytes: opts.unit_size_bytes,
            total_units: 0,
            bitmap_blocks: 0,
            sum_levels: geom.sum_levels,
            sum_blocks: 0,
            log_blocks: opts.log_blocks,
            free_units: 0,
            alloc_seq: 0,
            seq_init: false,
        };

        let mut tx = Transaction::new(&stores);
        stage_superblock(&mut tx, &superblock);
        tx.commit()?;
        debug!(
            block_size = opts.block_size,
            unit_size = opts.unit_size_bytes,
            "group format"
        );

        Ok(Self {
            inner: RwLock::new(GroupInner {
                cache: SummaryCache::new(geom.bitmap_blocks),
                stores,
                sb: superblock,
                geom,
            }),
            grow_lock: Mutex::new(()),
        })
    }

    /// Load a group from its stores.
    ///
    /// The persisted geometry is re-derived and cross-checked; the
    /// summary cache starts at the "unknown" sentinel for every bitmap
    /// block, a safe, never-underestimating default.
    pub fn mount(stores: RtStores) -> Result<Self> {
        let raw = stores.sb.read_block(0)?;
        let superblock = RtSuperblock::decode(&raw).map_err(|e| RillError::Parse(e.to_string()))?;
        check_store_block_sizes(&stores, superblock.block_size)?;

        let geom = RtGeometry::compute(
            superblock.block_size,
            superblock.unit_size_bytes,
            superblock.total_units,
        )
        .map_err(|e| RillError::InvalidGeometry(e.to_string()))?;

        if geom.bitmap_blocks != superblock.bitmap_blocks
            || geom.sum_levels != superblock.sum_levels
            || geom.sum_blocks != superblock.sum_blocks
            || superblock.free_units > superblock.total_units
        {
            return Err(RillError::Corruption {
                block: 0,
                detail: format!(
                    "superblock geometry disagrees with derived geometry: \
                     persisted {}x{}x{}, derived {}x{}x{}",
                    superblock.bitmap_blocks,
                    superblock.sum_levels,
                    superblock.sum_blocks,
                    geom.bitmap_blocks,
                    geom.sum_levels,
                    geom.sum_blocks,
                ),
            });
        }
        if stores.bitmap.block_count() < geom.bitmap_blocks
            || stores.summary.block_count() < geom.sum_blocks
        {
            return Err(RillError::InvalidGeometry(format!(
                "backing stores ({} bitmap, {} summary blocks) smaller than \
                 geometry ({}, {})",
                stores.bitmap.block_count(),
                stores.summary.block_count(),
                geom.bitmap_blocks,
                geom.sum_blocks,
            )));
        }

        debug!(
            total_units = superblock.total_units,
            bitmap_blocks = geom.bitmap_blocks,
            sum_levels = geom.sum_levels,
            "group mount"
        );
        Ok(Self {
            inner: RwLock::new(GroupInner {
                cache: SummaryCache::new(geom.bitmap_blocks),
                stores,
                sb: superblock,
                geom,
            }),
            grow_lock: Mutex::new(()),
        })
    }

    /// Release the group, returning the stores and discarding the
    /// summary cache and loaded metadata.
    #[must_use]
    pub fn unmount(self) -> RtStores {
        self.inner.into_inner().stores
    }

    /// Current geometry snapshot.
    #[must_use]
    pub fn geometry(&self) -> RtGeometry {
        self.inner.read().geom
    }

    /// Current free-unit counter.
    #[must_use]
    pub fn free_units(&self) -> u64 {
        self.inner.read().sb.free_units
    }

    /// Summary cache bounds, one byte per bitmap block (diagnostics).
    #[must_use]
    pub fn summary_cache_bounds(&self) -> Vec<u8> {
        self.inner.read().cache.as_slice().to_vec()
    }

    /// Allocate an extent of `min_len..=max_len` units.
    ///
    /// With a hint (or an initial-spread start), the near strategy runs
    /// first and falls back to the by-size strategy on exhaustion — the
    /// only place `NoSpace` is swallowed internally. Search, bitmap
    /// flip, summary repair, counter update, and the placement sequence
    /// bump all commit as one transaction under the exclusive lock.
    pub fn allocate(&self, req: &AllocRequest) -> Result<RtExtent> {
        let (min_len, max_len, prod) = validate_request(req)?;
        let mut inner = self.inner.write();
        inner.allocate(req.near, min_len, max_len, prod, req.initial_spread)
    }

    /// Free a previously allocated extent.
    ///
    /// Freeing units that are not currently allocated is a consistency
    /// fault, not a no-op.
    pub fn free(&self, start: UnitNumber, len: u64) -> Result<()> {
        let mut inner = self.inner.write();
        inner.free(start, len)
    }

    /// Grow the group to `new_total_units`, optionally setting the unit
    /// size (only while the group is still empty).
    ///
    /// Growth proceeds in per-bitmap-block steps, each its own
    /// transaction; a failure keeps all fully committed steps, so the
    /// group stays usable at the last good size.
    pub fn resize(&self, new_total_units: u64, new_unit_size: Option<u32>) -> Result<()> {
        let _grow = self.grow_lock.lock();

        let (cur_sb, cur_geom) = {
            let inner = self.inner.read();
            (inner.sb.clone(), inner.geom)
        };

        if cur_sb.flags & (FEAT_REFLINK | FEAT_QUOTA) != 0 {
            return Err(RillError::Unsupported(
                "resize with reflink or quota features enabled".to_owned(),
            ));
        }
        let unit_size = new_unit_size.unwrap_or(cur_sb.unit_size_bytes);
        if unit_size != cur_sb.unit_size_bytes && cur_sb.total_units > 0 {
            return Err(RillError::InvalidRequest(
                "unit size may only change while the group is empty".to_owned(),
            ));
        }
        if new_total_units <= cur_sb.total_units {
            return Err(RillError::InvalidRequest(format!(
                "resize target {new_total_units} does not grow the group \
                 ({} units)",
                cur_sb.total_units
            )));
        }

        let target = RtGeometry::compute(cur_sb.block_size, unit_size, new_total_units)
            .map_err(|e| RillError::InvalidGeometry(e.to_string()))?;

        // The whole summary is rewritten within single steps; cap it at
        // half the log region so one step can always be made durable.
        if target.sum_blocks > cur_sb.log_blocks / 2 {
            return Err(RillError::NoSpace);
        }

        // Extend the backing storage to the final size up front
        // (zero-filled); the index structures grow into it step by
        // step. The cache is keyed by bitmap block count, so it is
        // discarded and rebuilt whenever that count changes.
        {
            // A previously failed resize may have left the stores larger
            // than the committed geometry; never shrink them here.
            let inner = self.inner.write();
            let bitmap_target = target.bitmap_blocks.max(inner.stores.bitmap.block_count());
            let summary_target = target.sum_blocks.max(inner.stores.summary.block_count());
            inner.stores.bitmap.extend(bitmap_target)?;
            inner.stores.summary.extend(summary_target)?;
        }
        if target.bitmap_blocks != cur_geom.bitmap_blocks {
            self.inner.write().cache = SummaryCache::new(target.bitmap_blocks);
        }

        let mut step_block = last_used_bitmap_block(&cur_sb, &cur_geom);
        while step_block < target.bitmap_blocks {
            let mut inner = self.inner.write();
            if let Err(err) = inner.grow_step(step_block, &target) {
                // Committed steps are retained; only the failed step is
                // rolled back. The cache is rebuilt at the committed
                // block count.
                warn!(step_block, %err, "resize step failed");
                let committed_blocks = inner.geom.bitmap_blocks;
                inner.cache = SummaryCache::new(committed_blocks);
                return Err(err);
            }
            step_block += 1;
        }

        info!(
            total_units = new_total_units,
            bitmap_blocks = target.bitmap_blocks,
            sum_levels = target.sum_levels,
            "group resize complete"
        );
        Ok(())
    }

    /// Reinitialize the persisted free-unit counter from the bitmap.
    ///
    /// Scans under the shared lock, then persists under the exclusive
    /// lock. Callers must ensure no other mutation runs in between.
    pub fn reinit_free_units(&self) -> Result<u64> {
        let total = {
            let inner = self.inner.read();
            let tx = Transaction::new(&inner.stores);
            let mut sum = 0u64;
            for_each_free_run(&tx, &inner.geom, |_, len| sum += len)?;
            sum
        };

        let mut inner = self.inner.write();
        let mut superblock = inner.sb.clone();
        if superblock.free_units != total {
            debug!(
                counter = superblock.free_units,
                rescanned = total,
                "free-unit counter reinitialized"
            );
        }
        superblock.free_units = total;
        let mut tx = Transaction::new(&inner.stores);
        stage_superblock(&mut tx, &superblock);
        tx.commit()?;
        inner.sb = superblock;
        Ok(total)
    }
}

// ── Inner (lock-holding) operations ─────────────────────────────────────────

impl GroupInner {
    fn allocate(
        &mut self,
        near: Option<UnitNumber>,
        min_len: u64,
        max_len: u64,
        prod: u64,
        initial_spread: bool,
    ) -> Result<RtExtent> {
        if self.sb.total_units == 0 {
            return Err(RillError::NoSpace);
        }

        let mut superblock = self.sb.clone();
        let total = superblock.total_units;

        // Starting unit: explicit hint wins; otherwise an initial
        // allocation gets a spread-out start from the sequence counter,
        // bumped in the same transaction.
        let start = match near {
            Some(hint) => hint.0.min(total - 1),
            None if initial_spread => {
                let seq = if superblock.seq_init {
                    superblock.alloc_seq
                } else {
                    0
                };
                superblock.alloc_seq = seq + 1;
                superblock.seq_init = true;
                pick_initial(seq, total, max_len).0
            }
            None => 0,
        };

        let mut tx = Transaction::new(&self.stores);
        let mut ctx = AllocCtx {
            tx: &mut tx,
            geom: &self.geom,
            cache: &mut self.cache,
        };

        let extent = if start > 0 {
            match search_near(&mut ctx, UnitNumber(start), min_len, max_len, prod) {
                Err(err) if err.is_no_space() => search_by_size(&mut ctx, min_len, max_len, prod),
                other => other,
            }
        } else {
            search_by_size(&mut ctx, min_len, max_len, prod)
        }?;

        allocate_range(&mut ctx, extent.start, extent.len)?;

        superblock.free_units = superblock
            .free_units
            .checked_sub(extent.len)
            .ok_or_else(|| RillError::Corruption {
                block: 0,
                detail: format!(
                    "free-unit counter {} underflows by allocation of {}",
                    self.sb.free_units, extent.len
                ),
            })?;
        stage_superblock(ctx.tx, &superblock);

        tx.commit()?;
        self.sb = superblock;
        debug!(start = extent.start.0, len = extent.len, "allocated");
        Ok(extent)
    }

    fn free(&mut self, start: UnitNumber, len: u64) -> Result<()> {
        if len == 0 || start.0.checked_add(len).is_none_or(|e| e > self.sb.total_units) {
            return Err(RillError::InvalidRequest(format!(
                "free range [{start}, +{len}) outside group of {} units",
                self.sb.total_units
            )));
        }

        let mut tx = Transaction::new(&self.stores);

        // Double-free detection: the whole range must currently be
        // allocated.
        let (all_allocated, first_free) = check_range(&tx, &self.geom, start, len, false)?;
        if !all_allocated {
            return Err(RillError::Corruption {
                block: self.geom.unit_to_block(first_free).0,
                detail: format!("freeing unit {first_free} which is already free"),
            });
        }

        let mut ctx = AllocCtx {
            tx: &mut tx,
            geom: &self.geom,
            cache: &mut self.cache,
        };
        free_range(&mut ctx, start, len)?;

        let mut superblock = self.sb.clone();
        superblock.free_units = superblock
            .free_units
            .checked_add(len)
            .ok_or_else(|| RillError::Corruption {
                block: 0,
                detail: "free-unit counter overflow".to_owned(),
            })?;
        stage_superblock(ctx.tx, &superblock);

        tx.commit()?;
        self.sb = superblock;
        debug!(start = start.0, len, "freed");
        Ok(())
    }

    /// One resize step: bring the group up to the units covered by
    /// bitmap blocks `0..=step_block` (clamped to the target), as a
    /// single transaction.
    fn grow_step(&mut self, step_block: u64, target: &RtGeometry) -> Result<()> {
        let old_sb = self.sb.clone();
        let old_geom = self.geom;

        let step_units = (step_block + 1)
            .checked_mul(old_geom.units_per_block())
            .map_or(target.total_units, |u| u.min(target.total_units));
        let new_geom = RtGeometry::compute(old_sb.block_size, target.unit_size_bytes, step_units)
            .map_err(|e| RillError::InvalidGeometry(e.to_string()))?;

        debug!(
            step_block,
            from_units = old_sb.total_units,
            to_units = new_geom.total_units,
            "resize step"
        );

        let mut tx = Transaction::new(&self.stores);

        // Re-quantize the summary when the index shape changes: same
        // logical free runs, re-addressed under the new level/block
        // layout.
        if old_geom.bitmap_blocks != new_geom.bitmap_blocks
            || old_geom.sum_levels != new_geom.sum_levels
        {
            copy_summary(&mut tx, &old_geom, &new_geom, &mut self.cache)?;
        }

        // Account the newly addressable units as one free-range
        // insertion under the new geometry.
        let freed = new_geom.total_units - old_sb.total_units;
        let mut ctx = AllocCtx {
            tx: &mut tx,
            geom: &new_geom,
            cache: &mut self.cache,
        };
        free_range(&mut ctx, UnitNumber(old_sb.total_units), freed)?;

        let mut new_sb = old_sb.clone();
        new_sb.unit_size_bytes = new_geom.unit_size_bytes;
        new_sb.total_units = new_geom.total_units;
        new_sb.bitmap_blocks = new_geom.bitmap_blocks;
        new_sb.sum_levels = new_geom.sum_levels;
        new_sb.sum_blocks = new_geom.sum_blocks;
        new_sb.free_units = old_sb.free_units + freed;
        stage_superblock(ctx.tx, &new_sb);

        tx.commit()?;
        self.sb = new_sb;
        self.geom = new_geom;
        Ok(())
    }
}

/// Move every nonzero summary counter from the old layout to the new
/// one. Iterating levels and blocks downward guarantees a re-inserted
/// counter can never land on a cell that has not been drained yet.
fn copy_summary(
    tx: &mut Transaction<'_>,
    old_geom: &RtGeometry,
    new_geom: &RtGeometry,
    cache: &mut SummaryCache,
) -> Result<()> {
    for level in (0..old_geom.sum_levels).rev() {
        for block in (0..old_geom.bitmap_blocks).rev() {
            let count = get_summary(tx, old_geom, level, BitmapBlock(block))?;
            if count == 0 {
                continue;
            }
            let delta = i64::from(count);
            let mut old_ctx = AllocCtx {
                tx: &mut *tx,
                geom: old_geom,
                cache: &mut *cache,
            };
            modify_summary(&mut old_ctx, level, BitmapBlock(block), -delta)?;
            let mut new_ctx = AllocCtx {
                tx: &mut *tx,
                geom: new_geom,
                cache: &mut *cache,
            };
            modify_summary(&mut new_ctx, level, BitmapBlock(block), delta)?;
        }
    }
    Ok(())
}

/// First bitmap block a resize step must (re)process: the last
/// partially-filled block, or the first brand-new one when the current
/// last block is exactly full.
fn last_used_bitmap_block(superblock: &RtSuperblock, geom: &RtGeometry) -> u64 {
    let mut block = superblock.bitmap_blocks;
    if superblock.total_units % geom.units_per_block() != 0 {
        block -= 1;
    }
    block
}

fn stage_superblock(tx: &mut Transaction<'_>, superblock: &RtSuperblock) {
    let encoded = superblock.encode(superblock.block_size as usize);
    tx.stage(MetaFile::Super, 0, encoded);
}

fn check_store_block_sizes(stores: &RtStores, block_size: u32) -> Result<()> {
    for file in [MetaFile::Super, MetaFile::Bitmap, MetaFile::Summary] {
        let actual = stores.store(file).block_size();
        if actual != block_size {
            return Err(RillError::InvalidGeometry(format!(
                "store block size {actual} does not match group block size {block_size}"
            )));
        }
    }
    if stores.sb.block_count() == 0 {
        return Err(RillError::InvalidGeometry(
            "superblock store has no blocks".to_owned(),
        ));
    }
    Ok(())
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const BLOCK_SIZE: u32 = 512;

    fn fresh_group(total_units: u64) -> RtGroup {
        let stores = RtStores::in_memory(BLOCK_SIZE, 0, 0);
        let group = RtGroup::format(
            stores,
            &FormatOptions {
                block_size: BLOCK_SIZE,
                unit_size_bytes: 4096,
                log_blocks: 1 << 20,
                flags: 0,
            },
        )
        .unwrap();
        if total_units > 0 {
            group.resize(total_units, None).unwrap();
        }
        group
    }

    #[test]
    fn align_minmax_rounds_inward() {
        let (mut min, mut max, mut prod) = (5u64, 17u64, 4u64);
        align_minmax(&mut min, &mut max, &mut prod);
        assert_eq!((min, max, prod), (8, 16, 4));

        // Already aligned: untouched.
        let (mut min, mut max, mut prod) = (8u64, 16u64, 4u64);
        align_minmax(&mut min, &mut max, &mut prod);
        assert_eq!((min, max, prod), (8, 16, 4));

        // Rounding would invert the pair: drop the product.
        let (mut min, mut max, mut prod) = (5u64, 7u64, 4u64);
        align_minmax(&mut min, &mut max, &mut prod);
        assert_eq!((min, max, prod), (5, 7, 1));
    }

    #[test]
    fn validate_request_rejects_malformed() {
        assert!(matches!(
            validate_request(&AllocRequest::exact(0)),
            Err(RillError::InvalidRequest(_))
        ));
        assert!(matches!(
            validate_request(&AllocRequest::between(8, 4)),
            Err(RillError::InvalidRequest(_))
        ));
        let mut req = AllocRequest::between(5, 17);
        req.prod = 4;
        assert_eq!(validate_request(&req).unwrap(), (8, 16, 4));
    }

    #[test]
    fn last_used_bitmap_block_cases() {
        let geom = RtGeometry::compute(BLOCK_SIZE, 4096, 0).unwrap();
        let mut superblock = RtSuperblock {
            version: RILL_SUPER_VERSION,
            flags: 0,
            block_size: BLOCK_SIZE,
            unit_size_bytes: 4096,
            total_units: 0,
            bitmap_blocks: 0,
            sum_levels: 1,
            sum_blocks: 0,
            log_blocks: 0,
            free_units: 0,
            alloc_seq: 0,
            seq_init: false,
        };
        assert_eq!(last_used_bitmap_block(&superblock, &geom), 0);

        // Partially filled last block: reprocessed.
        superblock.total_units = 5000;
        superblock.bitmap_blocks = 2;
        assert_eq!(last_used_bitmap_block(&superblock, &geom), 1);

        // Exactly full: start at the next block.
        superblock.total_units = 8192;
        assert_eq!(last_used_bitmap_block(&superblock, &geom), 2);
    }

    #[test]
    fn format_resize_allocate_free_cycle() {
        let group = fresh_group(64);
        assert_eq!(group.free_units(), 64);
        assert_eq!(group.geometry().total_units, 64);

        let ext = group.allocate(&AllocRequest::between(4, 8)).unwrap();
        assert_eq!((ext.start.0, ext.len), (0, 8));
        assert_eq!(group.free_units(), 56);

        group.free(ext.start, ext.len).unwrap();
        assert_eq!(group.free_units(), 64);
    }

    #[test]
    fn allocate_honors_product() {
        let group = fresh_group(1024);
        let mut req = AllocRequest::between(5, 17);
        req.prod = 4;
        let ext = group.allocate(&req).unwrap();
        assert_eq!(ext.len % 4, 0);
        assert!(ext.len >= 8 && ext.len <= 16);
    }

    #[test]
    fn allocate_empty_group_is_no_space() {
        let group = fresh_group(0);
        let err = group.allocate(&AllocRequest::exact(1)).unwrap_err();
        assert!(err.is_no_space());
    }

    #[test]
    fn free_detects_double_free() {
        let group = fresh_group(64);
        let ext = group.allocate(&AllocRequest::exact(8)).unwrap();
        group.free(ext.start, ext.len).unwrap();
        let err = group.free(ext.start, ext.len).unwrap_err();
        assert!(matches!(err, RillError::Corruption { .. }));
        // The failed free left the counter alone.
        assert_eq!(group.free_units(), 64);
    }

    #[test]
    fn free_rejects_out_of_range() {
        let group = fresh_group(64);
        assert!(matches!(
            group.free(UnitNumber(60), 8),
            Err(RillError::InvalidRequest(_))
        ));
        assert!(matches!(
            group.free(UnitNumber(0), 0),
            Err(RillError::InvalidRequest(_))
        ));
    }

    #[test]
    fn initial_spread_follows_sequence() {
        let group = fresh_group(1024);
        let mut req = AllocRequest::exact(16);
        req.initial_spread = true;

        // Sequence 0, 1, 2, 3 maps to fractions 0, 1/2, 1/4, 3/4.
        let starts: Vec<u64> = (0..4)
            .map(|_| group.allocate(&req).unwrap().start.0)
            .collect();
        assert_eq!(starts, vec![0, 512, 256, 768]);
    }

    #[test]
    fn near_hint_allocates_close_by() {
        let group = fresh_group(8192);
        let mut req = AllocRequest::exact(16);
        req.near = Some(UnitNumber(4000));
        let ext = group.allocate(&req).unwrap();
        assert_eq!(ext.start, UnitNumber(4000));
    }

    #[test]
    fn resize_rejects_shrink_and_equal() {
        let group = fresh_group(128);
        assert!(matches!(
            group.resize(64, None),
            Err(RillError::InvalidRequest(_))
        ));
        assert!(matches!(
            group.resize(128, None),
            Err(RillError::InvalidRequest(_))
        ));
        assert_eq!(group.geometry().total_units, 128);
        assert_eq!(group.free_units(), 128);
    }

    #[test]
    fn resize_rejects_unit_size_change_when_nonempty() {
        let group = fresh_group(128);
        assert!(matches!(
            group.resize(256, Some(8192)),
            Err(RillError::InvalidRequest(_))
        ));
        // From empty it is allowed.
        let empty = fresh_group(0);
        empty.resize(64, Some(8192)).unwrap();
        assert_eq!(empty.geometry().unit_size_bytes, 8192);
    }

    #[test]
    fn resize_rejects_incompatible_features() {
        let stores = RtStores::in_memory(BLOCK_SIZE, 0, 0);
        let group = RtGroup::format(
            stores,
            &FormatOptions {
                block_size: BLOCK_SIZE,
                unit_size_bytes: 4096,
                log_blocks: 1 << 20,
                flags: FEAT_REFLINK,
            },
        )
        .unwrap();
        assert!(matches!(
            group.resize(64, None),
            Err(RillError::Unsupported(_))
        ));
    }

    #[test]
    fn resize_rejects_oversized_summary() {
        let stores = RtStores::in_memory(BLOCK_SIZE, 0, 0);
        let group = RtGroup::format(
            stores,
            &FormatOptions {
                block_size: BLOCK_SIZE,
                unit_size_bytes: 4096,
                log_blocks: 2,
                flags: 0,
            },
        )
        .unwrap();
        // A 100M-unit group needs far more than one summary block.
        let err = group.resize(100_000_000, None).unwrap_err();
        assert!(err.is_no_space());
    }

    #[test]
    fn grow_within_last_block_and_beyond() {
        let group = fresh_group(100);
        // Grow within the same bitmap block.
        group.resize(200, None).unwrap();
        assert_eq!(group.free_units(), 200);
        assert_eq!(group.geometry().bitmap_blocks, 1);

        // Grow across block boundaries.
        group.resize(10_000, None).unwrap();
        assert_eq!(group.free_units(), 10_000);
        assert_eq!(group.geometry().bitmap_blocks, 3);

        // Everything stays allocatable.
        let ext = group.allocate(&AllocRequest::exact(9_000)).unwrap();
        assert_eq!(ext.len, 9_000);
        assert_eq!(group.free_units(), 1_000);
    }

    #[test]
    fn reinit_free_units_matches_counter() {
        let group = fresh_group(1024);
        group.allocate(&AllocRequest::exact(100)).unwrap();
        group.allocate(&AllocRequest::exact(37)).unwrap();
        let rescanned = group.reinit_free_units().unwrap();
        assert_eq!(rescanned, 1024 - 137);
        assert_eq!(group.free_units(), rescanned);
    }
}
