use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

use crate::catalog::{parse_named_key, CatKey, SNAP_NAME_OBJ_ID};
use crate::error::{corrupt, Result};
use crate::volume::VolumeState;

// Snapshot metadata flags.
pub const SNAP_META_PENDING_DATALESS: u32 = 0x0001;
pub const SNAP_META_MERGE_IN_PROGRESS: u32 = 0x0002;
const SNAP_META_FLAGS_DEFINED: u32 = 0x0003;

/// A snapshot is assembled from two records: the metadata record keyed by
/// its transaction and the name record keyed by its name. Both halves must
/// arrive and agree.
#[derive(Default)]
pub struct SnapEntry {
    pub meta_seen: bool,
    pub name_seen: bool,
    pub name: Option<Vec<u8>>,
    pub extentref_tree_oid: u64,
    pub extentref_tree_type: u32,
    pub sblock_oid: u64,
    pub inum: u64,
    pub flags: u32,
}

/// Metadata half, keyed by the snapshot's transaction id.
pub fn handle_snap_metadata(snap_xid: u64, val: &[u8], state: &mut VolumeState) -> Result<()> {
    const CTX: &str = "Snapshot metadata";

    if snap_xid == 0 || snap_xid > state.max_xid {
        return Err(corrupt(CTX, "snapshot transaction is in the future."));
    }
    if val.len() < 50 {
        return Err(corrupt(CTX, "metadata value is too small."));
    }

    let mut cursor = Cursor::new(val);
    let extentref_tree_oid = cursor.read_u64::<LittleEndian>()?;
    let sblock_oid = cursor.read_u64::<LittleEndian>()?;
    let _create_time = cursor.read_u64::<LittleEndian>()?;
    let _change_time = cursor.read_u64::<LittleEndian>()?;
    let inum = cursor.read_u64::<LittleEndian>()?;
    let extentref_tree_type = cursor.read_u32::<LittleEndian>()?;
    let flags = cursor.read_u32::<LittleEndian>()?;
    let name_len = cursor.read_u16::<LittleEndian>()? as usize;

    let name_at = cursor.position() as usize;
    if name_len == 0 || name_at + name_len != val.len() {
        return Err(corrupt(CTX, "wrong name length."));
    }
    let name = &val[name_at..];
    if name[name_len - 1] != 0 || name[..name_len - 1].contains(&0) {
        return Err(corrupt(CTX, "name is not terminated."));
    }

    if flags & !SNAP_META_FLAGS_DEFINED != 0 {
        return Err(corrupt(CTX, "invalid flag in use."));
    }
    if flags & SNAP_META_PENDING_DATALESS != 0 {
        state.opts.unknown_feature("Dataless snapshots")?;
    }
    if flags & SNAP_META_MERGE_IN_PROGRESS != 0 {
        state.opts.crash(CTX, "a snapshot merge was interrupted.")?;
    }

    if sblock_oid == 0 || extentref_tree_oid == 0 {
        return Err(corrupt(CTX, "snapshot lost its trees."));
    }
    if inum == 0 {
        return Err(corrupt(CTX, "snapshot without an inode number."));
    }

    let entry = state.snapshots.get_or_create(snap_xid);
    if entry.meta_seen {
        return Err(corrupt(CTX, "snapshot described twice."));
    }
    entry.meta_seen = true;
    entry.name = Some(name[..name_len - 1].to_vec());
    entry.extentref_tree_oid = extentref_tree_oid;
    entry.extentref_tree_type = extentref_tree_type;
    entry.sblock_oid = sblock_oid;
    entry.inum = inum;
    entry.flags = flags;
    Ok(())
}

/// Name half, keyed by the reserved all-ones object id.
pub fn handle_snap_name(key: CatKey, val: &[u8], state: &mut VolumeState) -> Result<()> {
    const CTX: &str = "Snapshot metadata";

    if key.cnid != SNAP_NAME_OBJ_ID {
        return Err(corrupt(CTX, "wrong object id on a name record."));
    }
    let name = parse_named_key(key.body)?;

    if val.len() != 8 {
        return Err(corrupt(CTX, "name value has the wrong size."));
    }
    let snap_xid = u64::from_le_bytes(val.try_into().unwrap());

    // Metadata records sort first, so the other half must already exist.
    let entry = state
        .snapshots
        .get_mut(snap_xid)
        .ok_or_else(|| corrupt(CTX, "name record without metadata."))?;
    if !entry.meta_seen {
        return Err(corrupt(CTX, "name record without metadata."));
    }
    if entry.name_seen {
        return Err(corrupt(CTX, "snapshot named twice."));
    }
    if entry.name.as_deref() != Some(name.as_slice()) {
        return Err(corrupt(CTX, "snapshot names do not match."));
    }
    entry.name_seen = true;
    Ok(())
}

/// Every snapshot must have both halves; returns the count for the volume
/// counter comparison.
pub fn check_snapshots(state: &VolumeState) -> Result<u64> {
    let mut count = 0u64;
    for (_xid, entry) in state.snapshots.iter() {
        if !entry.meta_seen || !entry.name_seen {
            return Err(corrupt("Snapshot metadata", "snapshot is missing a record."));
        }
        count += 1;
    }
    Ok(count)
}
