//! Extent search strategies.
//!
//! Three entry points, all returning the chosen `(start, len)` without
//! mutating anything — the caller hands the result to
//! [`crate::allocate_range`] under the same lock and transaction:
//!
//! - [`search_exact`] — try the one candidate window at `start`.
//! - [`search_near`] — exact first, then an outward spiral over bitmap
//!   blocks around the hint, pruned by the summary cache.
//! - [`search_by_size`] — no locality: walk summary levels coarsest
//!   usable first, then progressively accept shorter runs.
//!
//! `NoSpace` from a strategy is an answer, not a fault; I/O and
//! consistency errors propagate immediately.

use crate::{AllocCtx, any_free, get_summary};
use rill_bitmap::{check_range, find_run_forw};
use rill_error::{Result, RillError};
use rill_types::{BitmapBlock, RtExtent, UnitNumber, align_len_down, highbit64};
use tracing::{debug, trace};

/// Clamp a scan length so it neither runs off the group end nor breaks
/// the product alignment.
fn clamp_scan_len(ctx: &AllocCtx<'_, '_>, start: UnitNumber, maxlen: u64, prod: u64) -> u64 {
    let avail = ctx.geom.total_units.min(start.0.saturating_add(maxlen)) - start.0;
    align_len_down(avail, prod)
}

// ── Exact ───────────────────────────────────────────────────────────────────

/// Allocate `minlen..=maxlen` units starting exactly at `start`.
///
/// If the full clamped window is not free, the free prefix in front of
/// the first allocated unit is returned instead, provided it still
/// meets `minlen` after product alignment.
pub fn search_exact(
    ctx: &mut AllocCtx<'_, '_>,
    start: UnitNumber,
    minlen: u64,
    maxlen: u64,
    prod: u64,
) -> Result<RtExtent> {
    let scanlen = clamp_scan_len(ctx, start, maxlen, prod);
    if scanlen < minlen {
        return Err(RillError::NoSpace);
    }

    let (is_free, next) = check_range(ctx.tx, ctx.geom, start, scanlen, true)?;
    if is_free {
        return Ok(RtExtent {
            start,
            len: scanlen,
        });
    }

    // Take what is there, if it's at least minlen.
    let prefix = align_len_down(next.0 - start.0, prod);
    if prefix < minlen {
        return Err(RillError::NoSpace);
    }
    Ok(RtExtent {
        start,
        len: prefix,
    })
}

// ── Per-block search ────────────────────────────────────────────────────────

/// Outcome of scanning one bitmap block's unit range.
pub(crate) enum BlockSearch {
    Found(RtExtent),
    /// Nothing usable starts in this block; `next` is the first
    /// unexamined unit, so level scans can skip ahead instead of
    /// rescanning covered blocks.
    NoSpace { next: UnitNumber },
}

/// Greedy first-fit scan of the candidate start positions in `block`.
///
/// Returns immediately on a full-length free window. When the request
/// allows a shorter result (`minlen < maxlen`), the longest free run
/// seen so far is tracked and returned once the block is exhausted.
pub(crate) fn search_block(
    ctx: &mut AllocCtx<'_, '_>,
    block: BitmapBlock,
    minlen: u64,
    maxlen: u64,
    prod: u64,
) -> Result<BlockSearch> {
    let geom = ctx.geom;
    let end = UnitNumber(
        geom.total_units
            .min(geom.block_first_unit(BitmapBlock(block.0 + 1)).0)
            - 1,
    );

    let mut i = geom.block_first_unit(block);
    let mut next = UnitNumber(end.0 + 1);
    let mut best: Option<(UnitNumber, u64)> = None;

    while i <= end {
        // Never scan off the end of the group.
        let scanlen = clamp_scan_len(ctx, i, maxlen, prod);
        if scanlen < minlen {
            break;
        }

        let (is_free, n) = check_range(ctx.tx, geom, i, scanlen, true)?;
        next = n;
        if is_free {
            trace!(block = block.0, start = i.0, len = scanlen, "block search hit");
            return Ok(BlockSearch::Found(RtExtent {
                start: i,
                len: scanlen,
            }));
        }

        // Variable-sized request: remember the longest free piece that
        // still meets the minimum.
        if minlen < maxlen {
            let this_len = n.0 - i.0;
            if this_len >= minlen && best.is_none_or(|(_, len)| this_len > len) {
                best = Some((i, this_len));
            }
        }

        if n.0 >= end.0 {
            break;
        }
        // Skip past the allocated run that stopped us.
        let last_allocated = find_run_forw(ctx.tx, geom, n, end)?;
        i = UnitNumber(last_allocated.0 + 1);
    }

    if let Some((start, len)) = best {
        let len = align_len_down(len, prod);
        if len >= minlen {
            return Ok(BlockSearch::Found(RtExtent { start, len }));
        }
    }
    Ok(BlockSearch::NoSpace { next })
}

// ── Near ────────────────────────────────────────────────────────────────────

/// Signed bitmap-block offsets spiralling outward from a center block:
/// `0, +1, -1, +2, -2, ...`, each side clipped to the block range, until
/// both directions are exhausted.
pub(crate) struct SpiralOffsets {
    prev: Option<i64>,
    started: bool,
    low: i64,
    high: i64,
}

impl SpiralOffsets {
    pub(crate) fn new(center: i64, block_count: i64) -> Self {
        Self {
            prev: None,
            started: false,
            low: -center,
            high: block_count - 1 - center,
        }
    }
}

impl Iterator for SpiralOffsets {
    type Item = i64;

    fn next(&mut self) -> Option<i64> {
        let next = match self.prev {
            None if !self.started => Some(0),
            None => None,
            Some(i) if i > 0 && -i >= self.low => Some(-i),
            Some(i) if i > 0 && i + 1 <= self.high => Some(i + 1),
            Some(i) if i <= 0 && 1 - i <= self.high => Some(1 - i),
            Some(i) if i <= 0 && i - 1 >= self.low => Some(i - 1),
            Some(_) => None,
        };
        self.started = true;
        self.prev = next;
        next
    }
}

/// Allocate `minlen..=maxlen` units as near `start` as possible.
///
/// Tries the exact window first, then spirals outward over bitmap
/// blocks. Each visited block is probed through the summary cache; on
/// the negative side, a usable run can start in an earlier block and
/// extend toward the hint, so a window of earlier blocks sized by the
/// found level is searched closest-first.
pub fn search_near(
    ctx: &mut AllocCtx<'_, '_>,
    start: UnitNumber,
    minlen: u64,
    maxlen: u64,
    prod: u64,
) -> Result<RtExtent> {
    if ctx.geom.total_units == 0 {
        return Err(RillError::NoSpace);
    }
    // A hint off the end silently becomes the last unit.
    let start = UnitNumber(start.0.min(ctx.geom.total_units - 1));

    match search_exact(ctx, start, minlen, maxlen, prod) {
        Err(RillError::NoSpace) => {}
        other => return other,
    }

    let center = i64::try_from(ctx.geom.unit_to_block(start).0).map_err(|_| {
        RillError::InvalidGeometry("bitmap block index exceeds i64".to_owned())
    })?;
    let block_count = i64::try_from(ctx.geom.bitmap_blocks).map_err(|_| {
        RillError::InvalidGeometry("bitmap block count exceeds i64".to_owned())
    })?;

    let low_level = highbit64(minlen).expect("minlen is validated nonzero");
    let top_level = ctx.geom.sum_levels.saturating_sub(1);
    let block_bit_log = ctx.geom.block_bit_log();
    debug!(start = start.0, minlen, maxlen, center, "near search");

    // Most negative offset already covered by a backward window, as the
    // offset just above it (the exact attempt covered offset 0).
    let mut back_scanned: i64 = -1;

    for i in SpiralOffsets::new(center, block_count) {
        #[expect(clippy::cast_sign_loss)]
        let probe = BitmapBlock((center + i) as u64);
        let Some(max_log) = any_free(ctx, low_level, top_level, probe)? else {
            continue;
        };

        // The summary only bounds the run length: a level-L run is
        // shorter than 2^(L+1).
        let level_cap = 1u64
            .checked_shl(u32::from(max_log) + 1)
            .map_or(u64::MAX, |v| v - 1);
        let max_avail = maxlen.min(level_cap);

        if i >= 0 {
            if let BlockSearch::Found(ext) = search_block(ctx, probe, minlen, max_avail, prod)? {
                return Ok(ext);
            }
        } else {
            // A run starting in block center+i can extend at most this
            // many blocks toward the hint.
            let max_blocks: i64 = if max_log == 0 {
                0
            } else if max_log < block_bit_log {
                1
            } else {
                2i64 << (max_log - block_bit_log)
            };

            // Probe closest-to-hint first, skipping blocks already
            // covered by a previous window.
            let mut j = (i + max_blocks).min(back_scanned);
            while j >= i {
                #[expect(clippy::cast_sign_loss)]
                let back = BitmapBlock((center + j) as u64);
                if let BlockSearch::Found(ext) =
                    search_block(ctx, back, minlen, max_avail, prod)?
                {
                    return Ok(ext);
                }
                j -= 1;
            }
            back_scanned = i - 1;
        }
    }

    Err(RillError::NoSpace)
}

// ── By size ─────────────────────────────────────────────────────────────────

/// Scan every bitmap block whose summary count at `level` is nonzero,
/// attempting a block search with the given window; skip ahead using the
/// block search's hint.
fn search_sum_level(
    ctx: &mut AllocCtx<'_, '_>,
    level: u8,
    minlen: u64,
    maxlen: u64,
    prod: u64,
) -> Result<RtExtent> {
    let mut block = 0u64;
    while block < ctx.geom.bitmap_blocks {
        if get_summary(ctx.tx, ctx.geom, level, BitmapBlock(block))? == 0 {
            block += 1;
            continue;
        }

        match search_block(ctx, BitmapBlock(block), minlen, maxlen, prod)? {
            BlockSearch::Found(ext) => return Ok(ext),
            BlockSearch::NoSpace { next } => {
                // Jump over the blocks the failed scan already covered.
                block = ctx.geom.unit_to_block(next).0.max(block + 1);
            }
        }
    }
    Err(RillError::NoSpace)
}

/// Allocate `minlen..=maxlen` units with no position preference.
///
/// Pass 1 walks levels from `log2(maxlen)` upward: any hit there is a
/// full-length extent at the smallest level known to hold one. Pass 2
/// relaxes `maxlen` by one unit and walks levels downward, clamping the
/// window to each level's representable lengths, progressively accepting
/// shorter runs until `minlen` no longer fits.
pub fn search_by_size(
    ctx: &mut AllocCtx<'_, '_>,
    minlen: u64,
    maxlen: u64,
    prod: u64,
) -> Result<RtExtent> {
    let top = ctx.geom.sum_levels;
    debug!(minlen, maxlen, prod, "by-size search");

    // Pass 1: full-length extents, coarsest usable level first.
    let first_level = highbit64(maxlen).expect("maxlen is validated nonzero");
    for level in first_level..top {
        match search_sum_level(ctx, level, minlen, maxlen, prod) {
            Err(RillError::NoSpace) => {}
            other => return other,
        }
    }

    // Pass 2: shrink the target and accept shorter extents.
    let maxlen = maxlen - 1;
    if minlen > maxlen {
        return Err(RillError::NoSpace);
    }

    let hi = highbit64(maxlen).expect("maxlen still nonzero").min(top - 1);
    let lo = highbit64(minlen).expect("minlen is validated nonzero");
    let mut level = i16::from(hi);
    while level >= i16::from(lo) {
        #[expect(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let l = level as u8;
        let level_floor = 1u64 << l;
        let level_ceil = 1u64
            .checked_shl(u32::from(l) + 1)
            .map_or(u64::MAX, |v| v - 1);

        match search_sum_level(
            ctx,
            l,
            minlen.max(level_floor),
            maxlen.min(level_ceil),
            prod,
        ) {
            Err(RillError::NoSpace) => {}
            other => return other,
        }
        level -= 1;
    }

    Err(RillError::NoSpace)
}

// ── Tests ───────────────────────────────────────────────────────────────────
