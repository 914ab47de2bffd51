use std::io::{Read, Seek};

use crate::btree::{parse_fext_key, Btree, SearchKey};
use crate::catalog::{self, RECORD_TYPE_EXTENT};
use crate::device::BlockSpace;
use crate::error::{corrupt, Result};
use crate::object::ObjectRules;
use crate::volume::VolumeState;

pub const APFS_KIND_NEW: u8 = 1;
pub const APFS_KIND_UPDATE: u8 = 2;
pub const PEXT_LEN_MASK: u64 = 0x0FFF_FFFF_FFFF_FFFF;

/// In-memory state for one physical-extent record, keyed by its first
/// block.
#[derive(Default)]
pub struct PhysExtEntry {
    pub present: bool,
    pub blocks: u64,
    pub kind: u8,
    pub owner: u64,
    pub recorded_refcnt: u32,
    pub observed_refs: u32,
    /// Contributed by a snapshot's extent-ref tree; the snapshot itself
    /// holds references the live catalog cannot account for.
    pub snapshot: bool,
}

/// Handle one record of the fext tree of a sealed volume: file extents
/// keyed by (stream id, logical address), attached exactly like catalog
/// file extents.
pub fn handle_fext_record(key: &[u8], val: &[u8], state: &mut VolumeState) -> Result<()> {
    const CTX: &str = "Fext tree";

    let (id, addr) = parse_fext_key(key)?;
    if val.len() != 16 {
        return Err(corrupt(CTX, "record value has the wrong size."));
    }
    let len_and_flags = u64::from_le_bytes(val[..8].try_into().unwrap());
    let phys = u64::from_le_bytes(val[8..16].try_into().unwrap());

    let len = len_and_flags & 0x00FF_FFFF_FFFF_FFFF;
    if len_and_flags & !0x00FF_FFFF_FFFF_FFFF != 0 {
        return Err(corrupt(CTX, "invalid extent flag in use."));
    }
    if len == 0 || len % state.block_size as u64 != 0 {
        return Err(corrupt(CTX, "invalid extent length."));
    }

    catalog::register_dstream_cnid(state, id)?;
    let ds = state.dstreams.get_or_create(id);
    if ds.bytes != addr {
        return Err(corrupt(CTX, "extents are not consecutive."));
    }
    ds.bytes += len;
    if phys == 0 {
        ds.sparse_bytes += len;
    } else {
        ds.ranges.push((phys, len / state.block_size as u64));
    }
    Ok(())
}

/// Resolve one physical position to the extent record containing it. The
/// live extent-ref tree is queried first; blocks shared with a snapshot
/// resolve through the merged record table instead.
fn locate_record<R: Read + Seek>(
    space: &mut BlockSpace<R>,
    extref: &Btree,
    rules: &ObjectRules,
    starts: &[(u64, u64)],
    pos: u64,
) -> Result<(u64, u64)> {
    let key = SearchKey::Extent { bno: pos };
    if let Some((raw_key, raw_val)) = extref.lookup(space, None, rules, &key, false)? {
        let rec_key = catalog::parse_cat_key(&raw_key)?;
        if rec_key.kind == RECORD_TYPE_EXTENT && raw_val.len() == 20 {
            let blocks =
                u64::from_le_bytes(raw_val[..8].try_into().unwrap()) & PEXT_LEN_MASK;
            if rec_key.cnid <= pos && pos < rec_key.cnid + blocks {
                return Ok((rec_key.cnid, blocks));
            }
        }
    }

    // Fall back on records contributed by snapshot extent-ref trees.
    let idx = starts.partition_point(|&(start, _)| start <= pos);
    if idx > 0 {
        let (start, blocks) = starts[idx - 1];
        if pos < start + blocks {
            return Ok((start, blocks));
        }
    }
    Err(corrupt(
        "Extent reference tree",
        "file extent without a physical record.",
    ))
}

/// Cross-check every dstream's attached ranges against the extent records:
/// split each range along record boundaries and count one reference per
/// owning dstream on every record touched.
pub fn reconcile_dstreams<R: Read + Seek>(
    space: &mut BlockSpace<R>,
    state: &mut VolumeState,
    extref: &Btree,
    rules: &ObjectRules,
) -> Result<()> {
    let starts: Vec<(u64, u64)> = {
        let mut v: Vec<(u64, u64)> = state
            .extents
            .iter()
            .filter(|(_, e)| e.present)
            .map(|(start, e)| (start, e.blocks))
            .collect();
        v.sort_unstable();
        v
    };

    let VolumeState {
        dstreams, extents, ..
    } = state;

    for (_id, ds) in dstreams.iter() {
        let mut touched: Vec<u64> = Vec::new();
        for &(paddr, blocks) in &ds.ranges {
            let mut pos = paddr;
            let mut left = blocks;
            while left > 0 {
                let (start, rec_blocks) = locate_record(space, extref, rules, &starts, pos)?;
                let covered = (start + rec_blocks - pos).min(left);
                touched.push(start);
                pos += covered;
                left -= covered;
            }
        }
        touched.sort_unstable();
        touched.dedup();
        for start in touched {
            let entry = extents.get_mut(start).ok_or_else(|| {
                corrupt("Extent reference tree", "file extent without a physical record.")
            })?;
            entry.observed_refs += 1;
        }
    }
    Ok(())
}

/// Final pass over the extent table: reference counts must balance. Returns
/// the summed block count for the volume's allocation counter.
pub fn check_extent_table(state: &VolumeState) -> Result<u64> {
    let mut total_blocks = 0u64;
    for (_start, entry) in state.extents.iter() {
        if !entry.present {
            return Err(corrupt(
                "Extent reference tree",
                "file extent without a physical record.",
            ));
        }
        let balanced = if entry.snapshot {
            entry.observed_refs <= entry.recorded_refcnt
        } else {
            entry.observed_refs == entry.recorded_refcnt
        };
        if !balanced {
            return Err(corrupt(
                "Extent reference tree",
                "wrong reference count on an extent.",
            ));
        }
        total_blocks += entry.blocks;
    }
    Ok(total_blocks)
}
