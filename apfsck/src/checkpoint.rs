use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read, Seek};

use crate::device::{BlockSpace, MIN_BLOCK_SIZE};
use crate::error::{corrupt, ApfsckError, ReportOptions, Result};
use crate::fletcher;
use crate::object::{
    self, ObjectHeader, StorageClass, OBJECT_TYPE_CHECKPOINT_MAP, OBJECT_TYPE_INVALID,
    OBJECT_TYPE_NX_SUPERBLOCK, OID_NX_SUPERBLOCK,
};
use crate::superblock::{NxSuperblock, NX_CNTR_RANGE, NX_FLAGS_RANGE, NX_FUSION_UUID_OFF, NX_MAGIC};
use crate::tables::IdTable;

/// Set on the final mapping block of a checkpoint.
pub const CHECKPOINT_MAP_LAST: u32 = 0x0001;

const CPM_HDR_SIZE: usize = ObjectHeader::SIZE + 8;
const CPM_ENTRY_SIZE: usize = 40;

/// One (ephemeral oid -> physical block) mapping.
#[derive(Debug, Clone, Copy)]
pub struct CheckpointMapping {
    pub etype: u32,
    pub subtype: u32,
    pub size: u32,
    pub fs_oid: u64,
    pub oid: u64,
    pub paddr: u64,
}

/// The ephemeral-object map of one committed checkpoint.
#[derive(Default)]
pub struct CheckpointMapTable {
    table: IdTable<Option<CheckpointMapping>>,
}

impl CheckpointMapTable {
    fn insert(&mut self, mapping: CheckpointMapping) -> Result<()> {
        let slot = self.table.get_or_create(mapping.oid);
        if slot.is_some() {
            return Err(corrupt("Checkpoint", "ephemeral oid mapped twice."));
        }
        *slot = Some(mapping);
        Ok(())
    }

    pub fn resolve(&self, oid: u64) -> Result<CheckpointMapping> {
        self.table
            .get(oid)
            .and_then(|slot| *slot)
            .ok_or_else(|| corrupt("Checkpoint", "no mapping for an ephemeral object."))
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.len() == 0
    }
}

/// The outcome of the resolver: the superblock of the most recent committed
/// transaction, its raw bytes, the raw block zero for later comparison, and
/// the ephemeral-object map of that transaction.
pub struct Checkpoint {
    pub sb: NxSuperblock,
    pub raw_sb: Vec<u8>,
    pub raw_block_zero: Vec<u8>,
    pub maps: CheckpointMapTable,
}

/// Read block zero, discover the real block size, and hand back the raw
/// block once its checksum and identity check out.
fn read_block_zero<R: Read + Seek>(space: &mut BlockSpace<R>) -> Result<Vec<u8>> {
    let mut block = space.read_block(0)?;

    let magic = u32::from_le_bytes(block[32..36].try_into().unwrap());
    if magic != NX_MAGIC {
        return Err(corrupt("Block zero", "wrong magic."));
    }
    let block_size = u32::from_le_bytes(block[36..40].try_into().unwrap());
    if !block_size.is_power_of_two() || block_size < MIN_BLOCK_SIZE {
        return Err(corrupt("Block zero", "invalid block size."));
    }
    if block_size != space.block_size() {
        space.set_block_size(block_size);
        block = space.read_block(0)?;
    }

    if !fletcher::verify_object(&block) {
        return Err(corrupt("Block zero", "bad checksum."));
    }
    let header = ObjectHeader::parse(&block)?;
    if header.oid != OID_NX_SUPERBLOCK {
        return Err(corrupt("Block zero", "wrong object id."));
    }
    if header.object_type() != OBJECT_TYPE_NX_SUPERBLOCK {
        return Err(corrupt("Block zero", "wrong object type."));
    }
    Ok(block)
}

/// Scan the whole descriptor ring for the valid superblock with the highest
/// transaction id. Blocks that are not superblocks, fail their checksum, or
/// are older than the running best are skipped, never fatal.
fn scan_descriptor_ring<R: Read + Seek>(
    space: &mut BlockSpace<R>,
    sb0: &NxSuperblock,
) -> Result<(NxSuperblock, Vec<u8>)> {
    if sb0.xp_desc_blocks & 0x8000_0000 != 0 {
        return Err(ApfsckError::Unsupported(
            "Non-contiguous checkpoint descriptor area",
        ));
    }
    if sb0.xp_data_blocks & 0x8000_0000 != 0 {
        return Err(ApfsckError::Unsupported("Non-contiguous checkpoint data area"));
    }
    if sb0.xp_desc_blocks == 0 || sb0.xp_data_blocks == 0 {
        return Err(corrupt("Block zero", "empty checkpoint area."));
    }

    let mut best: Option<(NxSuperblock, Vec<u8>)> = None;
    for i in 0..sb0.xp_desc_blocks as u64 {
        let block = match space.read_block(sb0.xp_desc_base + i) {
            Ok(block) => block,
            Err(_) => continue,
        };
        if u32::from_le_bytes(block[32..36].try_into().unwrap()) != NX_MAGIC {
            continue;
        }
        if !fletcher::verify_object(&block) {
            continue;
        }
        let header = match ObjectHeader::parse(&block) {
            Ok(header) => header,
            Err(_) => continue,
        };
        if header.object_type() != OBJECT_TYPE_NX_SUPERBLOCK {
            continue;
        }
        let candidate = match NxSuperblock::parse(&block) {
            Ok(sb) => sb,
            Err(_) => continue,
        };

        let best_xid = best.as_ref().map(|(sb, _)| sb.header.xid).unwrap_or(0);
        if candidate.header.xid > best_xid {
            best = Some((candidate, block));
        }
    }

    best.ok_or_else(|| corrupt("Checkpoint", "no valid superblock in the descriptor area."))
}

struct CpmBlock {
    flags: u32,
    mappings: Vec<CheckpointMapping>,
}

fn parse_cpm_block(block: &[u8], block_size: u32) -> Result<CpmBlock> {
    let mut cursor = Cursor::new(&block[ObjectHeader::SIZE..]);
    let flags = cursor.read_u32::<LittleEndian>()?;
    let count = cursor.read_u32::<LittleEndian>()?;

    if flags & !CHECKPOINT_MAP_LAST != 0 {
        return Err(corrupt("Checkpoint", "invalid mapping block flag in use."));
    }
    let capacity = (block_size as usize - CPM_HDR_SIZE) / CPM_ENTRY_SIZE;
    if count as usize > capacity {
        return Err(corrupt("Checkpoint", "too many mappings in a block."));
    }

    let mut cursor = Cursor::new(&block[CPM_HDR_SIZE..]);
    let mut mappings = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let etype = cursor.read_u32::<LittleEndian>()?;
        let subtype = cursor.read_u32::<LittleEndian>()?;
        let size = cursor.read_u32::<LittleEndian>()?;
        let pad = cursor.read_u32::<LittleEndian>()?;
        let fs_oid = cursor.read_u64::<LittleEndian>()?;
        let oid = cursor.read_u64::<LittleEndian>()?;
        let paddr = cursor.read_u64::<LittleEndian>()?;

        if pad != 0 {
            return Err(corrupt("Checkpoint", "padding in use in a mapping."));
        }
        if oid == 0 {
            return Err(corrupt("Checkpoint", "mapping for an invalid oid."));
        }
        if size == 0 || size % block_size != 0 {
            return Err(corrupt("Checkpoint", "invalid object size in a mapping."));
        }
        mappings.push(CheckpointMapping {
            etype,
            subtype,
            size,
            fs_oid,
            oid,
            paddr,
        });
    }
    Ok(CpmBlock { flags, mappings })
}

/// Locate the latest committed superblock and rebuild its ephemeral-object
/// map, validating every committed checkpoint in the window on the way.
pub fn resolve<R: Read + Seek>(
    space: &mut BlockSpace<R>,
    opts: &ReportOptions,
) -> Result<Checkpoint> {
    let raw_block_zero = read_block_zero(space)?;
    let sb0 = NxSuperblock::parse(&raw_block_zero)?;

    let (latest, raw_sb) = scan_descriptor_ring(space, &sb0)?;
    log::debug!(
        "latest checkpoint superblock: xid {}, descriptor window [{}, {})",
        latest.header.xid,
        latest.xp_desc_index,
        latest.xp_desc_next
    );

    let desc_blocks = latest.xp_desc_blocks;
    let data_blocks = latest.xp_data_blocks;
    if latest.xp_desc_index >= desc_blocks || latest.xp_desc_next >= desc_blocks {
        return Err(corrupt("Checkpoint", "descriptor index past the ring."));
    }
    if latest.xp_data_index >= data_blocks || latest.xp_data_next >= data_blocks {
        return Err(corrupt("Checkpoint", "data index past the ring."));
    }

    let mut remaining =
        (latest.xp_desc_next + desc_blocks - latest.xp_desc_index) % desc_blocks;
    if remaining == 0 {
        return Err(corrupt("Checkpoint", "empty descriptor window."));
    }

    let mut desc_i = latest.xp_desc_index;
    let mut data_i = latest.xp_data_index;
    let mut maps = CheckpointMapTable::default();
    let mut map_blocks: u32 = 0;
    let mut cp_data_blocks: u32 = 0;
    let mut got_last = false;
    let mut prev_xid: u64 = 0;
    let mut final_sb_seen = false;

    while remaining > 0 {
        let bno = latest.xp_desc_base + desc_i as u64;
        let block = space.read_block(bno)?;
        if !fletcher::verify_object(&block) {
            return Err(corrupt("Checkpoint", "bad checksum in the descriptor window."));
        }
        let header = ObjectHeader::parse(&block)?;
        if header.xid == 0 || header.xid > latest.header.xid {
            return Err(corrupt("Checkpoint", "transaction is in the future."));
        }

        match header.object_type() {
            OBJECT_TYPE_CHECKPOINT_MAP => {
                if got_last {
                    return Err(corrupt("Checkpoint", "mapping blocks after the last one."));
                }
                if header.oid != bno {
                    return Err(corrupt("Checkpoint", "wrong oid on a mapping block."));
                }
                if header.object_subtype() != OBJECT_TYPE_INVALID {
                    return Err(corrupt("Checkpoint", "wrong subtype on a mapping block."));
                }
                if header.storage(opts)? != StorageClass::Physical {
                    return Err(corrupt("Checkpoint", "wrong storage type on a mapping block."));
                }

                let cpm = parse_cpm_block(&block, space.block_size())?;
                for mapping in cpm.mappings {
                    // Ephemeral bodies are laid out back to back in the data
                    // ring, in mapping order.
                    if mapping.paddr != latest.xp_data_base + data_i as u64 {
                        return Err(corrupt("Checkpoint", "mapping out of place in the data ring."));
                    }
                    let blocks = mapping.size / space.block_size();
                    data_i = (data_i + blocks) % data_blocks;
                    cp_data_blocks += blocks;
                    maps.insert(mapping)?;
                }
                map_blocks += 1;
                got_last = cpm.flags & CHECKPOINT_MAP_LAST != 0;
            }
            OBJECT_TYPE_NX_SUPERBLOCK => {
                if !got_last {
                    return Err(corrupt("Checkpoint", "mapping blocks are not terminated."));
                }
                if header.oid != OID_NX_SUPERBLOCK {
                    return Err(corrupt("Checkpoint", "wrong oid on a superblock."));
                }
                if header.object_subtype() != OBJECT_TYPE_INVALID {
                    return Err(corrupt("Checkpoint", "wrong subtype on a superblock."));
                }
                if header.storage(opts)? != StorageClass::Ephemeral {
                    return Err(corrupt("Checkpoint", "wrong storage type on a superblock."));
                }
                if header.xid <= prev_xid {
                    return Err(corrupt("Checkpoint", "transactions out of order."));
                }
                prev_xid = header.xid;

                let cp_sb = NxSuperblock::parse(&block)?;
                if cp_sb.xp_desc_len != map_blocks + 1 {
                    return Err(corrupt("Checkpoint", "wrong descriptor length."));
                }
                if cp_sb.xp_data_len != cp_data_blocks {
                    return Err(corrupt("Checkpoint", "wrong data length."));
                }

                if remaining == 1 {
                    // The closing superblock of the window must be the
                    // latest one the ring scan already picked.
                    if header.xid != latest.header.xid {
                        return Err(corrupt("Checkpoint", "window does not end at the latest."));
                    }
                    final_sb_seen = true;
                } else {
                    // An older, superseded checkpoint; its mappings are
                    // fully consumed and discarded.
                    maps = CheckpointMapTable::default();
                }
                map_blocks = 0;
                cp_data_blocks = 0;
                got_last = false;
            }
            _ => {
                return Err(corrupt("Checkpoint", "stray object in the descriptor window."));
            }
        }

        desc_i = (desc_i + 1) % desc_blocks;
        remaining -= 1;
    }

    if !final_sb_seen {
        return Err(corrupt("Checkpoint", "window does not end at a superblock."));
    }
    if data_i != latest.xp_data_next {
        return Err(corrupt("Checkpoint", "inconsistent data ring."));
    }

    Ok(Checkpoint {
        sb: latest,
        raw_sb,
        raw_block_zero,
        maps,
    })
}

/// Read an ephemeral object through the checkpoint map, verifying the whole
/// multi-block body and its header.
pub fn read_ephemeral_object<R: Read + Seek>(
    space: &mut BlockSpace<R>,
    oid: u64,
    maps: &CheckpointMapTable,
    expected_type: u16,
    expected_subtype: u16,
    rules: &object::ObjectRules,
) -> Result<(Vec<u8>, ObjectHeader)> {
    let mapping = maps.resolve(oid)?;
    if mapping.etype & object::OBJECT_TYPE_MASK != expected_type as u32 {
        return Err(corrupt("Checkpoint", "wrong object type in a mapping."));
    }
    if mapping.subtype & object::OBJECT_TYPE_MASK != expected_subtype as u32 {
        return Err(corrupt("Checkpoint", "wrong object subtype in a mapping."));
    }

    let blocks = mapping.size / space.block_size();
    let body = space.read_blocks(mapping.paddr, blocks)?;
    if !fletcher::verify_object(&body) {
        return Err(corrupt("Object header", "bad checksum."));
    }
    let header = ObjectHeader::parse(&body)?;
    if header.oid != oid {
        return Err(corrupt("Object header", "wrong object id."));
    }
    if header.xid == 0 || header.xid > rules.max_xid {
        return Err(corrupt("Object header", "transaction is in the future."));
    }
    if header.object_type() != expected_type || header.object_subtype() != expected_subtype {
        return Err(corrupt("Object header", "wrong object type."));
    }
    if header.storage(rules.opts)? != StorageClass::Ephemeral {
        return Err(corrupt("Object header", "wrong storage type."));
    }
    Ok((body, header))
}

/// Compare block zero against the latest checkpoint superblock. Real
/// implementations leave the counter array and the flags word stale, so
/// exactly those ranges and the checksum are excluded; any other mismatch
/// is the signature of an unclean unmount.
pub fn check_block_zero(checkpoint: &Checkpoint, opts: &ReportOptions) -> Result<()> {
    let skip = [NX_CNTR_RANGE, NX_FLAGS_RANGE];
    if blocks_differ(&checkpoint.raw_block_zero, &checkpoint.raw_sb, &skip) {
        opts.crash("Block zero", "the filesystem was not unmounted cleanly.")?;
    }
    Ok(())
}

/// Compare the tier-2 copy of block zero against the main one. The only
/// tolerated differences are the checksum and the top bit of the fusion
/// uuid, which is set on tier 2 and clear on main. When the main copy has
/// gone stale, the tier-2 copy may instead match the resolved checkpoint
/// superblock; only failing both ways is a crash signature.
pub fn check_tier2_block_zero<R: Read + Seek>(
    space: &mut BlockSpace<R>,
    checkpoint: &Checkpoint,
    opts: &ReportOptions,
) -> Result<()> {
    let tier2_bno = crate::device::TIER2_BYTE_ADDR / space.block_size() as u64;
    let tier2_zero = space.read_block(tier2_bno)?;
    if !fletcher::verify_object(&tier2_zero) {
        return Err(corrupt("Block zero", "bad checksum on tier 2."));
    }

    if tier2_zero[NX_FUSION_UUID_OFF] & 0x80 == 0 {
        return Err(corrupt("Block zero", "fusion uuid bit clear on tier 2."));
    }
    if checkpoint.raw_block_zero[NX_FUSION_UUID_OFF] & 0x80 != 0 {
        return Err(corrupt("Block zero", "fusion uuid bit set on the main device."));
    }

    let mut main_copy = checkpoint.raw_block_zero.clone();
    main_copy[NX_FUSION_UUID_OFF] |= 0x80;
    if !blocks_differ(&tier2_zero, &main_copy, &[]) {
        return Ok(());
    }

    let mut latest_copy = checkpoint.raw_sb.clone();
    latest_copy[NX_FUSION_UUID_OFF] |= 0x80;
    if blocks_differ(&tier2_zero, &latest_copy, &[]) {
        opts.crash("Block zero", "tier 2 disagrees with the main device.")?;
    }
    Ok(())
}

/// Byte comparison with the checksum field always skipped, plus any ranges
/// the caller excludes.
fn blocks_differ(a: &[u8], b: &[u8], skip: &[std::ops::Range<usize>]) -> bool {
    if a.len() != b.len() {
        return true;
    }
    'bytes: for i in 8..a.len() {
        for range in skip {
            if range.contains(&i) {
                continue 'bytes;
            }
        }
        if a[i] != b[i] {
            return true;
        }
    }
    false
}
