#![forbid(unsafe_code)]
//! Extent allocation for the realtime group.
//!
//! The realtime free-space index is two-level: the bitmap (one bit per
//! allocation unit) is ground truth, and the summary table is an exact
//! secondary index counting, per `(level, bitmap block)`, the free runs
//! whose length's log2 is `level` and whose first unit falls in that
//! block. Search prunes by summary level instead of scanning raw bits.
//!
//! ## Design
//!
//! The allocator is layered:
//!
//! 1. **Summary store** — read/modify one free-run counter.
//! 2. **[`SummaryCache`]** — per-block upper bound on the highest useful
//!    level; a pure in-memory hint, sound by construction (it never
//!    underestimates), rebuilt from scratch at mount.
//! 3. **Search strategies** ([`search`]) — exact, near, and by-size.
//! 4. **Commit** — [`allocate_range`] / [`free_range`] flip the bitmap
//!    and repair the summary accounting for the leftover fragments, all
//!    staged into one transaction.
//!
//! Every operation here runs under the group's exclusive lock, held by
//! the caller across search and commit of the same request.

pub mod search;

use rill_bitmap::{MetaFile, Transaction, find_run_back, find_run_forw, modify_range};
use rill_error::{Result, RillError};
use rill_types::{BitmapBlock, RtGeometry, UnitNumber, highbit64, read_le_u32, write_le_u32};
use tracing::{debug, trace};

/// Shared context threaded through summary and search calls: the staged
/// transaction, the group geometry, and the summary cache.
pub struct AllocCtx<'a, 's> {
    pub tx: &'a mut Transaction<'s>,
    pub geom: &'a RtGeometry,
    pub cache: &'a mut SummaryCache,
}

// ── Summary store ───────────────────────────────────────────────────────────

/// Read the free-run count for `(level, block)`.
pub fn get_summary(
    tx: &Transaction<'_>,
    geom: &RtGeometry,
    level: u8,
    block: BitmapBlock,
) -> Result<u32> {
    sum_bounds_check(geom, level, block)?;
    let (sum_block, index) = geom.sum_locate(level, block);
    let buf = tx.read(MetaFile::Summary, sum_block)?;
    read_le_u32(&buf, index * 4).map_err(|e| RillError::Corruption {
        block: sum_block,
        detail: format!("summary entry read: {e}"),
    })
}

/// Apply `delta` to the free-run count for `(level, block)`.
///
/// A result below zero means the index no longer agrees with itself and
/// is reported as a consistency fault, never retried. A positive delta
/// records a newly created free run, so the summary cache's upper bound
/// for the block is raised to cover `level` again.
pub fn modify_summary(ctx: &mut AllocCtx<'_, '_>, level: u8, block: BitmapBlock, delta: i64) -> Result<()> {
    sum_bounds_check(ctx.geom, level, block)?;
    let (sum_block, index) = ctx.geom.sum_locate(level, block);
    let mut buf = ctx.tx.read(MetaFile::Summary, sum_block)?;
    let old = read_le_u32(&buf, index * 4).map_err(|e| RillError::Corruption {
        block: sum_block,
        detail: format!("summary entry read: {e}"),
    })?;

    let new = i64::from(old) + delta;
    let new = u32::try_from(new).map_err(|_| RillError::Corruption {
        block: sum_block,
        detail: format!(
            "summary count for level {level} block {block} would become {new} (was {old}, delta {delta})"
        ),
    })?;

    write_le_u32(&mut buf, index * 4, new);
    ctx.tx.stage(MetaFile::Summary, sum_block, buf);
    trace!(level, block = block.0, old, new, "summary modify");

    if delta > 0 {
        ctx.cache.raise(block, level);
    }
    Ok(())
}

fn sum_bounds_check(geom: &RtGeometry, level: u8, block: BitmapBlock) -> Result<()> {
    if level >= geom.sum_levels || block.0 >= geom.bitmap_blocks {
        return Err(RillError::InvalidRequest(format!(
            "summary index (level {level}, block {block}) outside {}x{}",
            geom.sum_levels, geom.bitmap_blocks
        )));
    }
    Ok(())
}

// ── Summary cache ───────────────────────────────────────────────────────────

/// Sentinel: no information; trivially an upper bound on every level.
pub const CACHE_UNKNOWN: u8 = u8::MAX;

/// Per-bitmap-block upper bound on the summary levels worth searching.
///
/// For every block `b`, the invariant is: no free run whose level is
/// `>= cache[b]` starts in `b`. The bound is tightened downward only
/// after [`any_free`] exhaustively scans the levels above and finds them
/// empty, and raised whenever a free run is recorded in the block, so it
/// can never cause a false negative. Losing the cache (every mount does)
/// only costs rescans.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryCache {
    bounds: Vec<u8>,
}

impl SummaryCache {
    /// A cache with no information for `bitmap_blocks` blocks.
    #[must_use]
    pub fn new(bitmap_blocks: u64) -> Self {
        #[expect(clippy::cast_possible_truncation)]
        let len = bitmap_blocks as usize;
        Self {
            bounds: vec![CACHE_UNKNOWN; len],
        }
    }

    /// Current upper bound for `block`.
    #[must_use]
    pub fn upper_bound(&self, block: BitmapBlock) -> u8 {
        #[expect(clippy::cast_possible_truncation)]
        let idx = block.0 as usize;
        self.bounds[idx]
    }

    /// Lower the bound for `block` to `bound` (ignored if not lower).
    pub fn tighten(&mut self, block: BitmapBlock, bound: u8) {
        #[expect(clippy::cast_possible_truncation)]
        let idx = block.0 as usize;
        if bound < self.bounds[idx] {
            self.bounds[idx] = bound;
        }
    }

    /// A free run at `level` now starts in `block`: ensure the bound
    /// still covers it.
    pub fn raise(&mut self, block: BitmapBlock, level: u8) {
        #[expect(clippy::cast_possible_truncation)]
        let idx = block.0 as usize;
        let needed = level.saturating_add(1);
        if needed > self.bounds[idx] {
            self.bounds[idx] = needed;
        }
    }

    /// Raw bounds, one byte per bitmap block.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bounds
    }
}

/// Highest level in `[low, high]` with any free run starting in `block`,
/// or `None`.
///
/// Clips `high` to the cache bound before scanning (levels at or above
/// the bound are proven empty), scans the summary from high to low
/// short-circuiting on the first hit, and tightens the cache with
/// whatever the scan proved on the way down. Callers must pass the
/// group's top level as `high`; the tightening assumes everything above
/// the scanned range was already covered by the cache bound.
pub fn any_free(
    ctx: &mut AllocCtx<'_, '_>,
    low: u8,
    high: u8,
    block: BitmapBlock,
) -> Result<Option<u8>> {
    let high = high.min(ctx.geom.sum_levels.saturating_sub(1));

    let Some(cache_high) = ctx.cache.upper_bound(block).checked_sub(1) else {
        // Bound of zero: the block is known to hold no free runs at all.
        return Ok(None);
    };
    let high = high.min(cache_high);
    if low > high {
        return Ok(None);
    }

    let mut found = None;
    let mut level = i16::from(high);
    while level >= i16::from(low) {
        #[expect(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let l = level as u8;
        if get_summary(ctx.tx, ctx.geom, l, block)? != 0 {
            found = Some(l);
            break;
        }
        level -= 1;
    }

    // Everything above `found` (or above low-1) was scanned and empty.
    let proven = found.map_or(low, |l| l.saturating_add(1));
    ctx.cache.tighten(block, proven);
    trace!(block = block.0, low, high, ?found, "summary any_free");
    Ok(found)
}

// ── Allocation and free commit ──────────────────────────────────────────────

/// Mark `[start, start + len)` allocated and repair the summary.
///
/// The chosen run sits somewhere inside a maximal free extent; the
/// enclosing extent's accounting is removed and up to two leftover
/// fragments (front and back) are re-added at their own levels, then the
/// bitmap range is flipped. Everything is staged into `ctx.tx`; the
/// caller commits the transaction, so the bitmap flip and the summary
/// deltas are never separable.
pub fn allocate_range(ctx: &mut AllocCtx<'_, '_>, start: UnitNumber, len: u64) -> Result<()> {
    // The run must still be free; the caller holds the group lock from
    // search to here, so anything else is index corruption. This also
    // validates the range bounds.
    let (is_free, first_bad) = rill_bitmap::check_range(ctx.tx, ctx.geom, start, len, true)?;
    if !is_free {
        return Err(RillError::Corruption {
            block: ctx.geom.unit_to_block(first_bad).0,
            detail: format!("allocating unit {first_bad} which is not free"),
        });
    }
    let end = UnitNumber(start.0 + len - 1);

    let pre = find_run_back(ctx.tx, ctx.geom, start)?;
    let post = find_run_forw(ctx.tx, ctx.geom, end, UnitNumber(ctx.geom.total_units - 1))?;
    debug!(
        start = start.0,
        len,
        extent_start = pre.0,
        extent_end = post.0,
        "allocate_range"
    );

    // Remove the old, larger free run from the accounting.
    let old_level = run_level(pre, post)?;
    let pre_block = ctx.geom.unit_to_block(pre);
    modify_summary(ctx, old_level, pre_block, -1)?;

    // Leftover free prefix keeps its own accounting.
    if pre < start {
        let level = run_level(pre, UnitNumber(start.0 - 1))?;
        modify_summary(ctx, level, pre_block, 1)?;
    }

    // Leftover free suffix likewise.
    if post > end {
        let suffix_start = UnitNumber(end.0 + 1);
        let level = run_level(suffix_start, post)?;
        modify_summary(ctx, level, ctx.geom.unit_to_block(suffix_start), 1)?;
    }

    modify_range(ctx.tx, ctx.geom, start, len, false)
}

/// Mark `[start, start + len)` free and repair the summary.
///
/// Mirror image of [`allocate_range`]: the freed range may merge with
/// free neighbors on either side, so the merged extent is accounted once
/// and the previously separate neighbor runs are removed.
pub fn free_range(ctx: &mut AllocCtx<'_, '_>, start: UnitNumber, len: u64) -> Result<()> {
    // Flip first (this validates the range bounds) so the boundary scan
    // sees the merged extent.
    modify_range(ctx.tx, ctx.geom, start, len, true)?;
    let end = UnitNumber(start.0 + len - 1);

    let pre = find_run_back(ctx.tx, ctx.geom, start)?;
    let post = find_run_forw(ctx.tx, ctx.geom, end, UnitNumber(ctx.geom.total_units - 1))?;
    debug!(
        start = start.0,
        len,
        extent_start = pre.0,
        extent_end = post.0,
        "free_range"
    );

    let merged_level = run_level(pre, post)?;
    let pre_block = ctx.geom.unit_to_block(pre);
    modify_summary(ctx, merged_level, pre_block, 1)?;

    if pre < start {
        let level = run_level(pre, UnitNumber(start.0 - 1))?;
        modify_summary(ctx, level, pre_block, -1)?;
    }

    if post > end {
        let suffix_start = UnitNumber(end.0 + 1);
        let level = run_level(suffix_start, post)?;
        modify_summary(ctx, level, ctx.geom.unit_to_block(suffix_start), -1)?;
    }

    Ok(())
}

/// Summary level of the run `[first, last]`.
fn run_level(first: UnitNumber, last: UnitNumber) -> Result<u8> {
    highbit64(last.0 + 1 - first.0).ok_or_else(|| RillError::Corruption {
        block: 0,
        detail: format!("zero-length run [{first}, {last}]"),
    })
}

// ── Placement heuristic ─────────────────────────────────────────────────────

/// Starting-unit hint for the first allocation of a fresh destination.
///
/// Maps the monotonic sequence counter onto the fraction sequence
/// 0, 1/2, 1/4, 3/4, 1/8, 5/8, 3/8, 7/8, ... of the group, spreading
/// successive whole-file placements apart before clustering. The caller
/// persists `seq + 1` in the same transaction as the allocation.
#[must_use]
pub fn pick_initial(seq: u64, total_units: u64, len: u64) -> UnitNumber {
    if total_units == 0 {
        return UnitNumber(0);
    }
    let Some(log2) = highbit64(seq) else {
        return UnitNumber(0);
    };

    let resid = seq - (1u64 << log2);
    let numer = u128::from(total_units) * (u128::from(resid) * 2 + 1);
    #[expect(clippy::cast_possible_truncation)]
    let mut hint = (numer >> (log2 + 1)) as u64;
    if hint >= total_units {
        hint %= total_units;
    }
    if hint.saturating_add(len) > total_units {
        hint = total_units.saturating_sub(len);
    }
    UnitNumber(hint)
}

// ── Tests ───────────────────────────────────────────────────────────────────
