use crate::{
    error::Interrupt,
    key::fingerprint,
    nodes::{locate, Ctx, Staging, Target},
    tree::OperationResult,
};

/// Replace the value stored under `key`.
///
/// Leaves are never written after they are published. The new value goes into
/// a fresh leaf which is swapped into the slot of the old one, so a reader
/// sees either the old or the new value, never a mix of both.
pub(crate) fn update(
    ctx: &Ctx<'_>,
    key: &[u8],
    value: &[u8],
) -> Result<OperationResult, Interrupt> {
    let Some(location) = locate(ctx, key)? else {
        return Ok(OperationResult::NotFound);
    };

    let old = location.target.leaf();
    let mut staging = Staging::new(ctx);
    let leaf = staging.leaf(key, value)?;

    match location.target {
        Target::Bucket {
            bucket,
            version,
            slot,
            ..
        } => {
            bucket.header.lock_version_or_restart(version)?;
            bucket.replace_at(ctx.pool, slot, fingerprint(key), leaf);
            bucket.header.write_unlock();
        },
        Target::Direct(_) => {
            let edge = location.path.last().ok_or(Interrupt::Restart)?;
            edge.lock()?;
            edge.replace(ctx.pool, leaf.to_opaque());
            edge.unlock();
        },
    }
    staging.commit();

    ctx.retire(old.to_opaque());
    Ok(OperationResult::Success)
}
