use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read, Seek};

use crate::btree::{parse_omap_key, Btree, SearchKey, TreeKind};
use crate::device::BlockSpace;
use crate::error::{corrupt, ReportOptions, Result};
use crate::object::{
    self, ObjectHeader, ObjectRules, OBJ_PHYSICAL, OBJECT_TYPE_BTREE, OBJECT_TYPE_INVALID,
    OBJECT_TYPE_OMAP, OID_RESERVED_COUNT,
};
use crate::tables::IdTable;

// Omap structure flags (om_flags).
pub const OMAP_MANUALLY_MANAGED: u32 = 0x0001;
pub const OMAP_ENCRYPTING: u32 = 0x0002;
pub const OMAP_DECRYPTING: u32 = 0x0004;
pub const OMAP_KEYROLLING: u32 = 0x0008;
pub const OMAP_CRYPTO_GENERATION: u32 = 0x0010;
const OMAP_FLAGS_DEFINED: u32 = 0x001F;

// Omap value flags (ov_flags).
pub const OMAP_VAL_DELETED: u32 = 0x0001;
pub const OMAP_VAL_SAVED: u32 = 0x0002;
pub const OMAP_VAL_NOHEADER: u32 = 0x0004;
pub const OMAP_VAL_CRYPTO_GENERATION: u32 = 0x0008;
const OMAP_VAL_FLAGS_DEFINED: u32 = 0x000F;

/// The omap structure body, after the object header.
#[derive(Debug, Clone)]
pub struct OmapPhys {
    pub flags: u32,
    pub snap_count: u32,
    pub tree_type: u32,
    pub snapshot_tree_type: u32,
    pub tree_oid: u64,
    pub snapshot_tree_oid: u64,
    pub most_recent_snap: u64,
    pub pending_revert_min: u64,
    pub pending_revert_max: u64,
}

impl OmapPhys {
    pub fn parse(block: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(&block[ObjectHeader::SIZE..]);
        Ok(OmapPhys {
            flags: cursor.read_u32::<LittleEndian>()?,
            snap_count: cursor.read_u32::<LittleEndian>()?,
            tree_type: cursor.read_u32::<LittleEndian>()?,
            snapshot_tree_type: cursor.read_u32::<LittleEndian>()?,
            tree_oid: cursor.read_u64::<LittleEndian>()?,
            snapshot_tree_oid: cursor.read_u64::<LittleEndian>()?,
            most_recent_snap: cursor.read_u64::<LittleEndian>()?,
            pending_revert_min: cursor.read_u64::<LittleEndian>()?,
            pending_revert_max: cursor.read_u64::<LittleEndian>()?,
        })
    }
}

/// A decoded omap leaf record.
#[derive(Debug, Clone, Copy)]
pub struct OmapRecord {
    pub oid: u64,
    pub xid: u64,
    pub flags: u32,
    pub size: u32,
    pub paddr: u64,
}

/// Result of a multi-record scan over one oid.
#[derive(Debug, Clone, Copy)]
pub struct OidScan {
    pub newest: OmapRecord,
    pub oldest_xid: u64,
    pub count: u64,
}

#[derive(Default)]
struct OidRecords {
    // (xid, used), ascending by xid; the walk delivers them in order.
    recs: Vec<(u64, bool)>,
}

/// An object map: the parsed structure, its pinned B-tree, and the record
/// side table used to prove that every live mapping was actually consumed.
pub struct Omap {
    pub phys: OmapPhys,
    tree: Btree,
    records: IdTable<OidRecords>,
    opts: ReportOptions,
    max_xid: u64,
}

fn parse_omap_value(raw: &[u8]) -> Result<(u32, u32, u64)> {
    if raw.len() < 16 {
        return Err(corrupt("Object map", "record value is too small."));
    }
    let mut cursor = Cursor::new(raw);
    let flags = cursor.read_u32::<LittleEndian>()?;
    let size = cursor.read_u32::<LittleEndian>()?;
    let paddr = cursor.read_u64::<LittleEndian>()?;
    Ok((flags, size, paddr))
}

impl Omap {
    /// Open the omap at a physical oid and walk its whole tree, building
    /// the record table and checking every record on the way.
    pub fn open<R: Read + Seek>(
        space: &mut BlockSpace<R>,
        oid: u64,
        rules: &ObjectRules,
    ) -> Result<Omap> {
        let (block, _header) = object::read_object(
            space,
            oid,
            None,
            OBJECT_TYPE_OMAP,
            OBJECT_TYPE_INVALID,
            rules,
        )?;
        let phys = OmapPhys::parse(&block)?;

        if phys.flags & !OMAP_FLAGS_DEFINED != 0 {
            return Err(corrupt("Object map", "invalid flag in use."));
        }
        if phys.flags & (OMAP_ENCRYPTING | OMAP_DECRYPTING | OMAP_KEYROLLING) != 0 {
            rules.opts.unknown_feature("Object map encryption rolling")?;
        }
        let tree_type = OBJ_PHYSICAL | OBJECT_TYPE_BTREE as u32;
        if phys.tree_type != tree_type {
            return Err(corrupt("Object map", "wrong tree type."));
        }
        if phys.snapshot_tree_type != tree_type {
            return Err(corrupt("Object map", "wrong snapshot tree type."));
        }
        if phys.most_recent_snap > rules.max_xid {
            return Err(corrupt("Object map", "snapshot transaction is in the future."));
        }
        if phys.pending_revert_min != 0 || phys.pending_revert_max != 0 {
            rules.opts.unknown_feature("Object map revert in progress")?;
        }

        let tree = Btree::open_physical(space, phys.tree_oid, TreeKind::Omap, rules)?;

        let mut omap = Omap {
            phys,
            tree,
            records: IdTable::new(),
            opts: *rules.opts,
            max_xid: rules.max_xid,
        };
        omap.build_record_table(space, rules)?;
        Ok(omap)
    }

    fn build_record_table<R: Read + Seek>(
        &mut self,
        space: &mut BlockSpace<R>,
        rules: &ObjectRules,
    ) -> Result<()> {
        let block_size = space.block_size();
        let block_count = space.block_count();
        let tier2_count = space.tier2_block_count();
        let opts = self.opts;
        let max_xid = self.max_xid;

        let records = &mut self.records;
        self.tree.walk(space, None, rules, &mut |key, val| {
            let rec = check_record(key, val, max_xid, block_size, block_count, tier2_count, &opts)?;
            records.get_or_create(rec.oid).recs.push((rec.xid, false));
            Ok(())
        })?;
        Ok(())
    }

    /// Point query per the omap ordering: the record with the greatest xid
    /// at or below `xid` among those sharing `oid`. Missing records are
    /// fatal here; the callers treat the omap as authoritative.
    pub fn lookup<R: Read + Seek>(
        &mut self,
        space: &mut BlockSpace<R>,
        oid: u64,
        xid: u64,
    ) -> Result<OmapRecord> {
        let opts = self.opts;
        let rules = ObjectRules::container(&opts, self.max_xid);
        let key = SearchKey::Omap { oid, xid };
        let found = self.tree.lookup(space, None, &rules, &key, false)?;

        let (raw_key, raw_val) = match found {
            Some(rec) => rec,
            None => return Err(corrupt("Object map", "record missing for virtual object.")),
        };
        let rec = check_record(
            &raw_key,
            &raw_val,
            self.max_xid,
            space.block_size(),
            space.block_count(),
            space.tier2_block_count(),
            &opts,
        )?;
        if rec.oid != oid {
            return Err(corrupt("Object map", "record missing for virtual object."));
        }
        self.mark_used(rec.oid, rec.xid)?;
        Ok(rec)
    }

    /// Multi-record scan over one oid, ignoring transactions: yields the
    /// newest record, the oldest xid seen, and the number of records.
    pub fn scan_oid<R: Read + Seek>(
        &mut self,
        space: &mut BlockSpace<R>,
        oid: u64,
    ) -> Result<OidScan> {
        let opts = self.opts;
        let rules = ObjectRules::container(&opts, self.max_xid);
        let key = SearchKey::OmapOid { oid };

        let mut scan = self.tree.scan(space, None, &rules, &key)?;
        let mut newest: Option<OmapRecord> = None;
        let mut oldest_xid = 0;
        let mut count = 0;
        while let Some((raw_key, raw_val)) =
            scan.next_record(&self.tree, space, None, &rules, &key)?
        {
            let rec = check_record(
                &raw_key,
                &raw_val,
                self.max_xid,
                space.block_size(),
                space.block_count(),
                space.tier2_block_count(),
                &opts,
            )?;
            if newest.is_none() {
                newest = Some(rec);
            }
            oldest_xid = rec.xid;
            count += 1;
        }

        match newest {
            Some(newest) => Ok(OidScan {
                newest,
                oldest_xid,
                count,
            }),
            None => Err(corrupt("Object map", "record missing for virtual object.")),
        }
    }

    fn mark_used(&mut self, oid: u64, xid: u64) -> Result<()> {
        let entry = self
            .records
            .get_mut(oid)
            .ok_or_else(|| corrupt("Object map", "resolved a record the walk never saw."))?;
        match entry.recs.iter_mut().find(|(rec_xid, _)| *rec_xid == xid) {
            Some(rec) => rec.1 = true,
            None => return Err(corrupt("Object map", "resolved a record the walk never saw.")),
        }
        Ok(())
    }

    /// Number of distinct oids with at least one record.
    pub fn oid_count(&self) -> usize {
        self.records.len()
    }

    /// Final accounting: the newest record of every oid must have served at
    /// least one object read. Older records belong to snapshots and are
    /// left alone.
    pub fn check_used(&self) -> Result<()> {
        for (_oid, entry) in self.records.iter() {
            if let Some((_, used)) = entry.recs.last() {
                if !used {
                    return Err(corrupt("Object map", "record was never used."));
                }
            }
        }
        Ok(())
    }
}

fn check_record(
    raw_key: &[u8],
    raw_val: &[u8],
    max_xid: u64,
    block_size: u32,
    block_count: u64,
    tier2_count: u64,
    opts: &ReportOptions,
) -> Result<OmapRecord> {
    let (oid, xid) = parse_omap_key(raw_key)?;
    let (flags, size, paddr) = parse_omap_value(raw_val)?;

    if oid < OID_RESERVED_COUNT {
        return Err(corrupt("Object map", "record oid is reserved."));
    }
    if xid == 0 || xid > max_xid {
        return Err(corrupt("Object map", "record transaction is in the future."));
    }
    if flags & !OMAP_VAL_FLAGS_DEFINED != 0 {
        return Err(corrupt("Object map", "invalid record flag in use."));
    }
    if flags & OMAP_VAL_NOHEADER != 0 {
        opts.unknown_feature("Headerless omap object")?;
    }
    if flags & (OMAP_VAL_DELETED | OMAP_VAL_SAVED) != 0 {
        return Err(corrupt("Object map", "deleted record in a committed checkpoint."));
    }

    if size != block_size {
        return Err(corrupt("Object map", "wrong object size in a record."));
    }
    if paddr == 0 {
        return Err(corrupt("Object map", "record points at block zero."));
    }
    let in_main = paddr < block_count;
    let in_tier2 = {
        let tier2_first = crate::device::TIER2_BYTE_ADDR / block_size as u64;
        paddr >= tier2_first && paddr - tier2_first < tier2_count
    };
    if !in_main && !in_tier2 {
        return Err(corrupt("Object map", "record points past the end of the device."));
    }

    Ok(OmapRecord {
        oid,
        xid,
        flags,
        size,
        paddr,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_validation() {
        let opts = ReportOptions::default();
        let key = |oid: u64, xid: u64| {
            let mut k = Vec::new();
            k.extend_from_slice(&oid.to_le_bytes());
            k.extend_from_slice(&xid.to_le_bytes());
            k
        };
        let val = |flags: u32, size: u32, paddr: u64| {
            let mut v = Vec::new();
            v.extend_from_slice(&flags.to_le_bytes());
            v.extend_from_slice(&size.to_le_bytes());
            v.extend_from_slice(&paddr.to_le_bytes());
            v
        };

        let rec =
            check_record(&key(0x500, 3), &val(0, 4096, 17), 10, 4096, 100, 0, &opts).unwrap();
        assert_eq!(rec.oid, 0x500);
        assert_eq!(rec.paddr, 17);

        // Reserved oid.
        assert!(check_record(&key(5, 3), &val(0, 4096, 17), 10, 4096, 100, 0, &opts).is_err());
        // Future transaction.
        assert!(
            check_record(&key(0x500, 11), &val(0, 4096, 17), 10, 4096, 100, 0, &opts).is_err()
        );
        // Address past the device.
        assert!(
            check_record(&key(0x500, 3), &val(0, 4096, 100), 10, 4096, 100, 0, &opts).is_err()
        );
        // Deleted record.
        assert!(check_record(
            &key(0x500, 3),
            &val(OMAP_VAL_DELETED, 4096, 17),
            10,
            4096,
            100,
            0,
            &opts
        )
        .is_err());
    }
}
