//! Fork resolution.
//!
//! Walks backward from the last delivered block, comparing the chain's
//! current hash at each number against the hash retained in the window.
//! The first agreement is the common ancestor. Until the window is full, the
//! block just below its oldest entry is checked against that entry's parent
//! hash.

use chainstream_core::{BlockRef, StreamError};
use chainstream_rpc::BlockSource;

use crate::window::ReorgWindow;

/// Outcome of [`find_common_ancestor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The branches agree at `ancestor`; `depth` delivered blocks are invalidated.
    ///
    /// `seed` is set when the ancestor lies below every retained entry: it is
    /// the canonical ancestor, which must anchor the emptied window.
    Ancestor {
        ancestor: u64,
        depth: u64,
        seed: Option<BlockRef>,
    },
    /// The last delivered block is still canonical, so the candidate that
    /// failed to link was a transient provider inconsistency.
    Consistent,
}

/// Find where the delivered branch and the chain's canonical branch agree.
///
/// `detected_at` is the candidate block whose parent did not link; it is
/// only used for reporting.
pub async fn find_common_ancestor(
    source: &dyn BlockSource,
    window: &ReorgWindow,
    max_depth: u64,
    detected_at: u64,
) -> Result<Resolution, StreamError> {
    let Some(last) = window.last().map(|e| e.number) else {
        return Ok(Resolution::Consistent);
    };

    for depth in 0..=max_depth {
        let Some(number) = last.checked_sub(depth) else {
            break;
        };
        let Some(stored) = window.get(number) else {
            return below_window(source, window, number, depth, detected_at, max_depth).await;
        };
        let canonical = source.fetch_block(number).await?;
        let agrees = canonical.as_ref().is_some_and(|b| b.hash == stored.hash);
        tracing::debug!(
            block = number,
            stored = %stored.hash,
            canonical = canonical.as_ref().map(|b| b.hash.as_str()).unwrap_or("<missing>"),
            agrees,
            "comparing fork candidate"
        );
        if agrees {
            return Ok(if depth == 0 {
                Resolution::Consistent
            } else {
                Resolution::Ancestor { ancestor: number, depth, seed: None }
            });
        }
    }

    Err(StreamError::reorg_depth_exceeded(detected_at, max_depth))
}

/// `number` is not retained. If it is the parent of the oldest entry, the
/// stored parent hash still identifies it.
async fn below_window(
    source: &dyn BlockSource,
    window: &ReorgWindow,
    number: u64,
    depth: u64,
    detected_at: u64,
    max_depth: u64,
) -> Result<Resolution, StreamError> {
    let Some(oldest) = window.oldest().filter(|o| o.number == number + 1) else {
        return Err(StreamError::reorg_depth_exceeded(detected_at, max_depth));
    };
    let canonical = source.fetch_block(number).await?;
    match canonical {
        Some(block) if block.hash == oldest.parent_hash => {
            tracing::debug!(block = number, hash = %block.hash, "ancestor matches oldest parent hash");
            Ok(Resolution::Ancestor { ancestor: number, depth, seed: Some(block.block_ref()) })
        }
        _ => Err(StreamError::reorg_depth_exceeded(detected_at, max_depth)),
    }
}
