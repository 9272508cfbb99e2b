use crate::{
    error::NeedRestart,
    nodes::{any_leaf, Ctx, Header, OpaqueNodePtr, Prefix},
};

/// The outcome of an optimistic prefix check.
///
/// Prefixes longer than the inline buffer are only partially compared. The
/// remaining bytes are assumed to match and the terminal comparison of the full
/// key catches a wrong turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PrefixMatch {
    /// Every prefix byte was compared and matched.
    Match,
    /// The stored bytes matched, some bytes were skipped.
    Skipped,
    /// The key does not continue through this node.
    Mismatch,
}

/// Compare the stored prefix bytes of a node against `key`, which already
/// matched everything before `depth`.
///
/// Prefix bytes are always positioned relative to the level of the node. A
/// prefix left longer than its distance to the parent by a crash still only
/// holds bytes shared by every key below the node, so comparing it is sound.
pub(crate) fn check_prefix(header: &Header, key: &[u8], depth: usize) -> PrefixMatch {
    let level = header.level();
    let prefix = header.prefix();
    if key.len() <= level || level < depth {
        return PrefixMatch::Mismatch;
    }
    let Some(start) = level.checked_sub(prefix.count()) else {
        return PrefixMatch::Skipped;
    };

    let stored = prefix.stored();
    if key[start..start + stored.len()] != *stored {
        return PrefixMatch::Mismatch;
    }

    if prefix.is_complete() && start <= depth {
        PrefixMatch::Match
    } else {
        PrefixMatch::Skipped
    }
}

/// The outcome of an exact prefix check, used by inserts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PessimisticMatch {
    /// The whole prefix matched and the key has a byte at the node level.
    Match,
    /// The key differs from the prefix at `position` bytes past the depth.
    Diverges {
        /// Offset of the first differing byte, relative to the depth.
        position: usize,
        /// The full prefix of the node.
        prefix: Vec<u8>,
    },
    /// The key ends inside the prefix or right at the node level, so it is a
    /// prefix of every key below the node.
    KeyEnds,
    /// No leaf is left below the node to read the prefix from.
    Empty,
}

/// Compare the full prefix of a node against `key`.
///
/// A prefix whose length does not match the distance between `depth` and the
/// node level was left behind by a crash during a split or a collapse. It is
/// rebuilt from a leaf under the node lock and the operation restarts.
pub(crate) fn check_prefix_pessimistic(
    ctx: &Ctx<'_>,
    ptr: OpaqueNodePtr,
    header: &Header,
    version: u64,
    key: &[u8],
    depth: usize,
) -> Result<PessimisticMatch, NeedRestart> {
    let level = header.level();
    let prefix = header.prefix();
    let expected = level.checked_sub(depth).ok_or(NeedRestart)?;
    if prefix.count() != expected {
        recover_prefix(ctx, ptr, header, version, depth)?;
        return Err(NeedRestart);
    }

    let stored = prefix.stored();
    let full = if prefix.is_complete() {
        None
    } else {
        match load_prefix(ctx, ptr, header, depth)? {
            Some(full) => Some(full),
            None => return Ok(PessimisticMatch::Empty),
        }
    };
    let bytes = full.as_deref().unwrap_or(stored);

    for (position, byte) in bytes.iter().enumerate() {
        match key.get(depth + position) {
            None => return Ok(PessimisticMatch::KeyEnds),
            Some(key_byte) if key_byte != byte => {
                return Ok(PessimisticMatch::Diverges {
                    position,
                    prefix: bytes.to_vec(),
                })
            },
            Some(_) => {},
        }
    }

    if key.len() <= level {
        Ok(PessimisticMatch::KeyEnds)
    } else {
        Ok(PessimisticMatch::Match)
    }
}

/// Read the full prefix of a node, `key[depth..level]` of every key below it.
///
/// Returns `None` if there is no leaf below the node.
pub(crate) fn load_prefix(
    ctx: &Ctx<'_>,
    ptr: OpaqueNodePtr,
    header: &Header,
    depth: usize,
) -> Result<Option<Vec<u8>>, NeedRestart> {
    let level = header.level();
    let prefix = header.prefix();
    if prefix.is_complete() && prefix.count() == level.saturating_sub(depth) {
        return Ok(Some(prefix.stored().to_vec()));
    }

    let Some(leaf) = any_leaf(ctx.view(), ptr) else {
        return Ok(None);
    };
    leaf.key(ctx.pool, ctx.guard)
        .get(depth..level)
        .map(|bytes| Some(bytes.to_vec()))
        .ok_or(NeedRestart)
}

/// Rewrite the prefix of a node from any leaf below it, so that it covers
/// exactly `key[depth..level]`.
pub(crate) fn recover_prefix(
    ctx: &Ctx<'_>,
    ptr: OpaqueNodePtr,
    header: &Header,
    version: u64,
    depth: usize,
) -> Result<(), NeedRestart> {
    header.lock_version_or_restart(version)?;

    let level = header.level();
    let healed = any_leaf(ctx.view(), ptr).and_then(|leaf| {
        let key = leaf.key(ctx.pool, ctx.guard);
        let bytes = key.get(depth..level)?;
        Some(Prefix::new(bytes, bytes.len()))
    });

    if let Some(prefix) = healed {
        let stale = header.prefix();
        header.set_prefix(ctx.pool, prefix);
        ctx.stats.prefix_recoveries.increment();
        tracing::warn!(
            node = ?ptr,
            level,
            stale = stale.count(),
            healed = prefix.count(),
            "recovered node prefix"
        );
    }
    header.write_unlock();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        nodes::{InnerNode, InnerNode4},
        pool::PmPool,
        LeafLayout,
    };

    fn header(pool: &PmPool, level: usize, prefix: Prefix) -> &Header {
        let node = InnerNode4::allocate(pool, 1, level, prefix).unwrap();
        &node.read(pool).header
    }

    #[test]
    fn short_prefix_is_exact() {
        let pool = PmPool::anonymous(1 << 20, LeafLayout::Bucketed).unwrap();
        let header = header(&pool, 4, Prefix::new(b"bcd", 3));

        assert_eq!(check_prefix(header, b"abcde", 1), PrefixMatch::Match);
        assert_eq!(check_prefix(header, b"abxde", 1), PrefixMatch::Mismatch);
        // No byte at the node level
        assert_eq!(check_prefix(header, b"abcd", 1), PrefixMatch::Mismatch);
    }

    #[test]
    fn long_prefix_is_skipped() {
        let pool = PmPool::anonymous(1 << 20, LeafLayout::Bucketed).unwrap();
        let header = header(&pool, 7, Prefix::new(b"abcdef", 6));

        assert_eq!(check_prefix(header, b"xabcdefz", 1), PrefixMatch::Skipped);
        // Only the stored bytes are compared
        assert_eq!(check_prefix(header, b"xabcdXXz", 1), PrefixMatch::Skipped);
        assert_eq!(check_prefix(header, b"xabXdefz", 1), PrefixMatch::Mismatch);
    }

    #[test]
    fn stale_longer_prefix_still_matches() {
        let pool = PmPool::anonymous(1 << 20, LeafLayout::Bucketed).unwrap();
        // The parent now consumes bytes 1 and 2, but the prefix still covers
        // bytes 1..4
        let header = header(&pool, 4, Prefix::new(b"bcd", 3));

        assert_eq!(check_prefix(header, b"abcde", 3), PrefixMatch::Match);
        assert_eq!(check_prefix(header, b"abXde", 3), PrefixMatch::Mismatch);
    }
}
