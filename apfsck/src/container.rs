use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read, Seek};

use crate::checkpoint::{self, Checkpoint};
use crate::device::BlockSpace;
use crate::error::{corrupt, ReportOptions, Result};
use crate::object::{
    self, ObjectHeader, ObjectRules, OBJECT_TYPE_BTREE, OBJECT_TYPE_EFI_JUMPSTART,
    OBJECT_TYPE_FUSION_MIDDLE_TREE, OBJECT_TYPE_INVALID, OBJECT_TYPE_NX_FUSION_WBC,
    OBJECT_TYPE_NX_REAPER, OBJECT_TYPE_SPACEMAN,
};
use crate::omap::Omap;
use crate::superblock::{APFS_VOL_ROLE_DATA, APFS_VOL_ROLE_SYSTEM};
use crate::volume;

/// Accumulator for the allocation cross-check. The final comparison against
/// the on-disk bitmaps belongs to the space manager and stays outside the
/// core; the core only keeps the marks current.
pub struct AllocBitmap {
    words: Vec<u64>,
    block_count: u64,
}

impl AllocBitmap {
    pub fn new(block_count: u64) -> Self {
        AllocBitmap {
            words: vec![0u64; (block_count as usize).div_ceil(64)],
            block_count,
        }
    }

    pub fn mark_block(&mut self, bno: u64) {
        if bno < self.block_count {
            self.words[(bno / 64) as usize] |= 1 << (bno % 64);
        }
    }

    pub fn mark_range(&mut self, start: u64, count: u64) {
        for bno in start..start.saturating_add(count) {
            // Tier-2 addresses fall outside the main bitmap and are simply
            // not tracked.
            if bno >= self.block_count {
                break;
            }
            self.mark_block(bno);
        }
    }

    pub fn marked_count(&self) -> u64 {
        self.words.iter().map(|w| w.count_ones() as u64).sum()
    }
}

/// Shallow check of the space manager: resolve it through the checkpoint
/// map and verify the object identity; its bitmaps are out of scope.
fn check_spaceman<R: Read + Seek>(
    space: &mut BlockSpace<R>,
    cp: &Checkpoint,
    rules: &ObjectRules,
) -> Result<()> {
    checkpoint::read_ephemeral_object(
        space,
        cp.sb.spaceman_oid,
        &cp.maps,
        OBJECT_TYPE_SPACEMAN,
        OBJECT_TYPE_INVALID,
        rules,
    )?;
    Ok(())
}

/// The reaper must be idle: an offline checker cannot chase half-finished
/// deletions.
fn check_reaper<R: Read + Seek>(
    space: &mut BlockSpace<R>,
    cp: &Checkpoint,
    rules: &ObjectRules,
) -> Result<()> {
    let (body, _header) = checkpoint::read_ephemeral_object(
        space,
        cp.sb.reaper_oid,
        &cp.maps,
        OBJECT_TYPE_NX_REAPER,
        OBJECT_TYPE_INVALID,
        rules,
    )?;

    let mut cursor = Cursor::new(&body[ObjectHeader::SIZE..]);
    let _next_reap_id = cursor.read_u64::<LittleEndian>()?;
    let _completed_id = cursor.read_u64::<LittleEndian>()?;
    let head = cursor.read_u64::<LittleEndian>()?;
    let tail = cursor.read_u64::<LittleEndian>()?;
    let _flags = cursor.read_u32::<LittleEndian>()?;
    let rlcount = cursor.read_u32::<LittleEndian>()?;

    if head != 0 || tail != 0 || rlcount != 0 {
        rules.opts.unknown_feature("Reaper in use")?;
    }
    Ok(())
}

/// The fusion writeback cache must be empty, and the middle tree must hold
/// nothing; tier-2 caching of dirty data is not survivable offline.
fn check_fusion_state<R: Read + Seek>(
    space: &mut BlockSpace<R>,
    cp: &Checkpoint,
    rules: &ObjectRules,
) -> Result<()> {
    let (body, _header) = checkpoint::read_ephemeral_object(
        space,
        cp.sb.fusion_wbc_oid,
        &cp.maps,
        OBJECT_TYPE_NX_FUSION_WBC,
        OBJECT_TYPE_INVALID,
        rules,
    )?;
    let mut cursor = Cursor::new(&body[ObjectHeader::SIZE..]);
    let _version = cursor.read_u64::<LittleEndian>()?;
    let _list_head_oid = cursor.read_u64::<LittleEndian>()?;
    let _list_tail_oid = cursor.read_u64::<LittleEndian>()?;
    let _stable_head_offset = cursor.read_u64::<LittleEndian>()?;
    let _stable_tail_offset = cursor.read_u64::<LittleEndian>()?;
    let list_blocks_count = cursor.read_u32::<LittleEndian>()?;
    let _reserved = cursor.read_u32::<LittleEndian>()?;
    let used_by_rc = cursor.read_u64::<LittleEndian>()?;
    if list_blocks_count != 0 || used_by_rc != 0 {
        rules.opts.unknown_feature("Fusion writeback cache in use")?;
    }

    let (mt_block, _header) = object::read_object(
        space,
        cp.sb.fusion_mt_oid,
        None,
        OBJECT_TYPE_BTREE,
        OBJECT_TYPE_FUSION_MIDDLE_TREE,
        rules,
    )?;
    // Only the record count matters; the node header sits right after the
    // object header.
    let records = u32::from_le_bytes(mt_block[36..40].try_into().unwrap());
    if records != 0 {
        rules.opts.unknown_feature("Nonempty fusion middle tree")?;
    }
    Ok(())
}

/// Every volume group must contribute both halves: a system volume and a
/// data volume.
fn check_volume_groups(summaries: &[volume::VolumeSummary]) -> Result<()> {
    let mut groups: Vec<([u8; 16], bool, bool)> = Vec::new();
    for summary in summaries {
        if summary.volume_group_id == [0u8; 16] {
            continue;
        }
        let slot = match groups
            .iter_mut()
            .find(|(id, _, _)| *id == summary.volume_group_id)
        {
            Some(slot) => slot,
            None => {
                groups.push((summary.volume_group_id, false, false));
                groups.last_mut().unwrap()
            }
        };
        match summary.role {
            APFS_VOL_ROLE_SYSTEM => slot.1 = true,
            APFS_VOL_ROLE_DATA => slot.2 = true,
            _ => {}
        }
    }
    for (_id, has_system, has_data) in groups {
        if !has_system || !has_data {
            return Err(corrupt("Container superblock", "volume group is incomplete."));
        }
    }
    Ok(())
}

/// Run the whole pipeline: checkpoint, container superblock, object map,
/// ephemeral objects, every volume, then the global cross-checks.
pub fn check_container<R: Read + Seek>(
    space: &mut BlockSpace<R>,
    opts: &ReportOptions,
) -> Result<()> {
    let cp = checkpoint::resolve(space, opts)?;
    let sb = &cp.sb;
    sb.check(space.block_count(), space.has_tier2(), opts)?;
    log::info!(
        "container {} blocks of {} bytes, xid {}",
        sb.block_count,
        sb.block_size,
        sb.header.xid
    );

    let mut bitmap = AllocBitmap::new(sb.block_count);
    bitmap.mark_block(0);
    bitmap.mark_range(sb.xp_desc_base, sb.xp_desc_blocks as u64);
    bitmap.mark_range(sb.xp_data_base, sb.xp_data_blocks as u64);

    let rules = ObjectRules::container(opts, sb.header.xid);

    let mut container_omap = Omap::open(space, sb.omap_oid, &rules)?;
    if container_omap.phys.snap_count != 0 {
        return Err(corrupt("Object map", "container omap has snapshots."));
    }

    check_spaceman(space, &cp, &rules)?;
    check_reaper(space, &cp, &rules)?;

    if sb.efi_jumpstart != 0 {
        object::read_object(
            space,
            sb.efi_jumpstart,
            None,
            OBJECT_TYPE_EFI_JUMPSTART,
            OBJECT_TYPE_INVALID,
            &rules,
        )?;
    }

    if sb.is_fusion() {
        checkpoint::check_tier2_block_zero(space, &cp, opts)?;
        check_fusion_state(space, &cp, &rules)?;
    }

    let mut summaries = Vec::new();
    for slot in 0..sb.max_file_systems {
        let oid = sb.fs_oids[slot as usize];
        if oid == 0 {
            continue;
        }
        if oid >= sb.next_oid {
            return Err(corrupt("Container superblock", "volume oid above the next allocation."));
        }
        summaries.push(volume::check_volume(
            space,
            &mut container_omap,
            slot,
            oid,
            sb.header.xid,
            opts,
            &mut bitmap,
        )?);
    }
    log::info!("checked {} volumes", summaries.len());

    check_volume_groups(&summaries)?;
    container_omap.check_used()?;
    checkpoint::check_block_zero(&cp, opts)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_bitmap() {
        let mut bitmap = AllocBitmap::new(200);
        bitmap.mark_block(0);
        bitmap.mark_range(10, 5);
        bitmap.mark_range(198, 10); // clipped at the end
        assert_eq!(bitmap.marked_count(), 1 + 5 + 2);

        // Re-marking is idempotent.
        bitmap.mark_range(10, 5);
        assert_eq!(bitmap.marked_count(), 8);
    }

    #[test]
    fn test_volume_groups() {
        let group = [7u8; 16];
        let member = |role: u16| volume::VolumeSummary {
            role,
            volume_group_id: group,
        };
        let ungrouped = volume::VolumeSummary {
            role: 0,
            volume_group_id: [0u8; 16],
        };

        assert!(check_volume_groups(&[ungrouped]).is_ok());
        assert!(check_volume_groups(&[member(APFS_VOL_ROLE_SYSTEM)]).is_err());
        assert!(check_volume_groups(&[
            member(APFS_VOL_ROLE_SYSTEM),
            member(APFS_VOL_ROLE_DATA)
        ])
        .is_ok());
    }
}
