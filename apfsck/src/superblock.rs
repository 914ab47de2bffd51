use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read};

use crate::error::{corrupt, ReportOptions, Result};
use crate::object::{ObjectHeader, OID_RESERVED_COUNT};

/// NX_MAGIC = "NXSB" as little-endian u32.
pub const NX_MAGIC: u32 = 0x4253584E;

/// APSB_MAGIC = "APSB" as little-endian u32.
pub const APSB_MAGIC: u32 = 0x42535041;

/// Hard ceiling on volumes per container.
pub const NX_MAX_FILE_SYSTEMS: usize = 100;

/// One volume is allowed per 512 MiB of container, up to the ceiling.
pub const NX_BYTES_PER_FILE_SYSTEM: u64 = 512 * 1024 * 1024;

pub const NX_NUM_COUNTERS: usize = 32;
pub const NX_EPH_INFO_COUNT: usize = 4;
pub const NX_EPH_MIN_BLOCK_COUNT: u64 = 8;
pub const NX_MAX_FILE_SYSTEM_EPH_STRUCTS: u64 = 4;
pub const NX_EPH_INFO_VERSION: u64 = 1;

// Container optional features.
pub const NX_FEATURE_DEFRAG: u64 = 0x0001;
pub const NX_FEATURE_LCFD: u64 = 0x0002;
const NX_FEATURES_DEFINED: u64 = 0x0003;

// Container incompatible features.
pub const NX_INCOMPAT_VERSION1: u64 = 0x0001;
pub const NX_INCOMPAT_VERSION2: u64 = 0x0002;
pub const NX_INCOMPAT_FUSION: u64 = 0x0100;
const NX_INCOMPAT_DEFINED: u64 = 0x0103;

// Container flags (nx_flags).
pub const NX_RESERVED_1: u64 = 0x0001;
pub const NX_RESERVED_2: u64 = 0x0002;
pub const NX_CRYPTO_SW: u64 = 0x0004;
const NX_FLAGS_DEFINED: u64 = 0x0007;

/// Byte ranges of the container superblock that real implementations leave
/// out of sync between block zero and the latest checkpoint: the counter
/// array and the flags word. The block-zero comparison skips exactly these.
pub const NX_CNTR_RANGE: std::ops::Range<usize> = 0x3D8..0x4D8;
pub const NX_FLAGS_RANGE: std::ops::Range<usize> = 0x4F0..0x4F8;

/// Offset of the fusion uuid within the superblock; its top bit is set on
/// the tier-2 copy and clear on the main one.
pub const NX_FUSION_UUID_OFF: usize = 0x500;

// Volume optional features.
pub const APFS_FEATURE_DEFRAG_PRERELEASE: u64 = 0x0001;
pub const APFS_FEATURE_HARDLINK_MAP_RECORDS: u64 = 0x0002;
pub const APFS_FEATURE_DEFRAG: u64 = 0x0004;
pub const APFS_FEATURE_STRICTATIME: u64 = 0x0008;
pub const APFS_FEATURE_VOLGRP_SYSTEM_INO_SPACE: u64 = 0x0010;
const APFS_FEATURES_DEFINED: u64 = 0x001F;

// Volume incompatible features.
pub const APFS_INCOMPAT_CASE_INSENSITIVE: u64 = 0x0001;
pub const APFS_INCOMPAT_DATALESS_SNAPS: u64 = 0x0002;
pub const APFS_INCOMPAT_ENC_ROLLED: u64 = 0x0004;
pub const APFS_INCOMPAT_NORMALIZATION_INSENSITIVE: u64 = 0x0008;
pub const APFS_INCOMPAT_INCOMPLETE_RESTORE: u64 = 0x0010;
pub const APFS_INCOMPAT_SEALED_VOLUME: u64 = 0x0020;
pub const APFS_INCOMPAT_PFK: u64 = 0x0040;
pub const APFS_INCOMPAT_SECONDARY_FSROOT: u64 = 0x0080;
const APFS_INCOMPAT_DEFINED: u64 = 0x00FF;

// Volume flags (apfs_fs_flags).
pub const APFS_FS_UNENCRYPTED: u64 = 0x0001;
pub const APFS_FS_RESERVED_2: u64 = 0x0002;
pub const APFS_FS_RESERVED_4: u64 = 0x0004;
pub const APFS_FS_ONEKEY: u64 = 0x0008;
pub const APFS_FS_SPILLEDOVER: u64 = 0x0010;
pub const APFS_FS_RUN_SPILLOVER_CLEANER: u64 = 0x0020;
pub const APFS_FS_ALWAYS_CHECK_EXTENTREF: u64 = 0x0040;
const APFS_FS_FLAGS_DEFINED: u64 = 0x007F;

// Volume roles.
pub const APFS_VOL_ROLE_NONE: u16 = 0x0000;
pub const APFS_VOL_ROLE_SYSTEM: u16 = 0x0001;
pub const APFS_VOL_ROLE_USER: u16 = 0x0002;
pub const APFS_VOL_ROLE_RECOVERY: u16 = 0x0004;
pub const APFS_VOL_ROLE_VM: u16 = 0x0008;
pub const APFS_VOL_ROLE_PREBOOT: u16 = 0x0010;
pub const APFS_VOL_ROLE_INSTALLER: u16 = 0x0020;
pub const APFS_VOL_ROLE_DATA: u16 = 0x0040;
pub const APFS_VOL_ROLE_BASEBAND: u16 = 0x0080;
pub const APFS_VOL_ROLE_UPDATE: u16 = 0x00C0;
pub const APFS_VOL_ROLE_XART: u16 = 0x0100;
pub const APFS_VOL_ROLE_HARDWARE: u16 = 0x0140;
pub const APFS_VOL_ROLE_BACKUP: u16 = 0x0180;
pub const APFS_VOL_ROLE_ENTERPRISE: u16 = 0x0240;
pub const APFS_VOL_ROLE_PRELOGIN: u16 = 0x02C0;

// Wrapped meta-crypto state.
pub const APFS_WMCS_MAJOR_VERSION: u16 = 5;
pub const APFS_WMCS_MINOR_VERSION: u16 = 0;

// Well-known filesystem object ids.
pub const APFS_ROOT_DIR_PARENT: u64 = 1;
pub const APFS_ROOT_DIR_INO_NUM: u64 = 2;
pub const APFS_PRIV_DIR_INO_NUM: u64 = 3;
pub const APFS_MIN_USER_INO_NUM: u64 = 16;
pub const APFS_MIN_DOC_ID: u32 = 3;

/// Volume label buffer, terminator included.
pub const APFS_VOLNAME_LEN: usize = 256;

/// Modifier-history slots in the volume superblock.
pub const APFS_MAX_HIST: usize = 8;

/// A physical block range.
#[derive(Debug, Clone, Copy, Default)]
pub struct Prange {
    pub start: u64,
    pub count: u64,
}

fn read_prange(cursor: &mut Cursor<&[u8]>) -> Result<Prange> {
    Ok(Prange {
        start: cursor.read_u64::<LittleEndian>()?,
        count: cursor.read_u64::<LittleEndian>()?,
    })
}

/// Container superblock (NXSB).
#[derive(Debug, Clone)]
pub struct NxSuperblock {
    pub header: ObjectHeader,
    pub magic: u32,
    pub block_size: u32,
    pub block_count: u64,
    pub features: u64,
    pub readonly_compatible_features: u64,
    pub incompatible_features: u64,
    pub uuid: [u8; 16],
    pub next_oid: u64,
    pub next_xid: u64,
    pub xp_desc_blocks: u32,
    pub xp_data_blocks: u32,
    pub xp_desc_base: u64,
    pub xp_data_base: u64,
    pub xp_desc_next: u32,
    pub xp_data_next: u32,
    pub xp_desc_index: u32,
    pub xp_desc_len: u32,
    pub xp_data_index: u32,
    pub xp_data_len: u32,
    pub spaceman_oid: u64,
    pub omap_oid: u64,
    pub reaper_oid: u64,
    pub test_type: u32,
    pub max_file_systems: u32,
    pub fs_oids: Vec<u64>,
    pub counters: [u64; NX_NUM_COUNTERS],
    pub blocked_out: Prange,
    pub evict_mapping_tree_oid: u64,
    pub flags: u64,
    pub efi_jumpstart: u64,
    pub fusion_uuid: [u8; 16],
    pub keylocker: Prange,
    pub ephemeral_info: [u64; NX_EPH_INFO_COUNT],
    pub test_oid: u64,
    pub fusion_mt_oid: u64,
    pub fusion_wbc_oid: u64,
    pub fusion_wbc: Prange,
    pub newest_mounted_version: u64,
    pub mkb_locker: Prange,
}

impl NxSuperblock {
    /// Parse the container superblock from a raw block. Only the magic is
    /// judged here; everything else is deferred to `check`.
    pub fn parse(block: &[u8]) -> Result<Self> {
        let header = ObjectHeader::parse(block)?;
        let mut cursor = Cursor::new(block);
        cursor.set_position(ObjectHeader::SIZE as u64);

        let magic = cursor.read_u32::<LittleEndian>()?;
        if magic != NX_MAGIC {
            return Err(corrupt("Container superblock", "wrong magic."));
        }

        let block_size = cursor.read_u32::<LittleEndian>()?;
        let block_count = cursor.read_u64::<LittleEndian>()?;
        let features = cursor.read_u64::<LittleEndian>()?;
        let readonly_compatible_features = cursor.read_u64::<LittleEndian>()?;
        let incompatible_features = cursor.read_u64::<LittleEndian>()?;

        let mut uuid = [0u8; 16];
        cursor.read_exact(&mut uuid)?;

        let next_oid = cursor.read_u64::<LittleEndian>()?;
        let next_xid = cursor.read_u64::<LittleEndian>()?;

        let xp_desc_blocks = cursor.read_u32::<LittleEndian>()?;
        let xp_data_blocks = cursor.read_u32::<LittleEndian>()?;
        let xp_desc_base = cursor.read_u64::<LittleEndian>()?;
        let xp_data_base = cursor.read_u64::<LittleEndian>()?;
        let xp_desc_next = cursor.read_u32::<LittleEndian>()?;
        let xp_data_next = cursor.read_u32::<LittleEndian>()?;
        let xp_desc_index = cursor.read_u32::<LittleEndian>()?;
        let xp_desc_len = cursor.read_u32::<LittleEndian>()?;
        let xp_data_index = cursor.read_u32::<LittleEndian>()?;
        let xp_data_len = cursor.read_u32::<LittleEndian>()?;

        let spaceman_oid = cursor.read_u64::<LittleEndian>()?;
        let omap_oid = cursor.read_u64::<LittleEndian>()?;
        let reaper_oid = cursor.read_u64::<LittleEndian>()?;

        let test_type = cursor.read_u32::<LittleEndian>()?;
        let max_file_systems = cursor.read_u32::<LittleEndian>()?;

        let mut fs_oids = Vec::with_capacity(NX_MAX_FILE_SYSTEMS);
        for _ in 0..NX_MAX_FILE_SYSTEMS {
            fs_oids.push(cursor.read_u64::<LittleEndian>()?);
        }

        let mut counters = [0u64; NX_NUM_COUNTERS];
        for slot in counters.iter_mut() {
            *slot = cursor.read_u64::<LittleEndian>()?;
        }

        let blocked_out = read_prange(&mut cursor)?;
        let evict_mapping_tree_oid = cursor.read_u64::<LittleEndian>()?;
        let flags = cursor.read_u64::<LittleEndian>()?;
        let efi_jumpstart = cursor.read_u64::<LittleEndian>()?;

        let mut fusion_uuid = [0u8; 16];
        cursor.read_exact(&mut fusion_uuid)?;

        let keylocker = read_prange(&mut cursor)?;

        let mut ephemeral_info = [0u64; NX_EPH_INFO_COUNT];
        for slot in ephemeral_info.iter_mut() {
            *slot = cursor.read_u64::<LittleEndian>()?;
        }

        let test_oid = cursor.read_u64::<LittleEndian>()?;
        let fusion_mt_oid = cursor.read_u64::<LittleEndian>()?;
        let fusion_wbc_oid = cursor.read_u64::<LittleEndian>()?;
        let fusion_wbc = read_prange(&mut cursor)?;
        let newest_mounted_version = cursor.read_u64::<LittleEndian>()?;
        let mkb_locker = read_prange(&mut cursor)?;

        Ok(NxSuperblock {
            header,
            magic,
            block_size,
            block_count,
            features,
            readonly_compatible_features,
            incompatible_features,
            uuid,
            next_oid,
            next_xid,
            xp_desc_blocks,
            xp_data_blocks,
            xp_desc_base,
            xp_data_base,
            xp_desc_next,
            xp_data_next,
            xp_desc_index,
            xp_desc_len,
            xp_data_index,
            xp_data_len,
            spaceman_oid,
            omap_oid,
            reaper_oid,
            test_type,
            max_file_systems,
            fs_oids,
            counters,
            blocked_out,
            evict_mapping_tree_oid,
            flags,
            efi_jumpstart,
            fusion_uuid,
            keylocker,
            ephemeral_info,
            test_oid,
            fusion_mt_oid,
            fusion_wbc_oid,
            fusion_wbc,
            newest_mounted_version,
            mkb_locker,
        })
    }

    pub fn is_fusion(&self) -> bool {
        self.incompatible_features & NX_INCOMPAT_FUSION != 0
    }

    /// Field checks for the superblock that drives the run. `device_blocks`
    /// and `has_tier2` come from the opened devices.
    pub fn check(
        &self,
        device_blocks: u64,
        has_tier2: bool,
        opts: &ReportOptions,
    ) -> Result<()> {
        const CTX: &str = "Container superblock";

        if !self.block_size.is_power_of_two() || self.block_size < crate::device::MIN_BLOCK_SIZE {
            return Err(corrupt(CTX, "invalid block size."));
        }
        if self.block_size != crate::device::DEFAULT_BLOCK_SIZE {
            opts.unknown_feature("Block size other than 4096")?;
        }
        if self.block_count == 0 {
            return Err(corrupt(CTX, "invalid block count."));
        }
        if self.block_count > device_blocks {
            return Err(corrupt(CTX, "block count is larger than the device."));
        }

        if self.features & !NX_FEATURES_DEFINED != 0 {
            return Err(corrupt(CTX, "invalid optional feature in use."));
        }
        if self.features & NX_FEATURE_DEFRAG != 0 {
            opts.unknown_feature("Defragmentation")?;
        }
        if self.features & NX_FEATURE_LCFD != 0 && !self.is_fusion() {
            return Err(corrupt(CTX, "low-capacity fusion feature without fusion."));
        }
        if self.readonly_compatible_features != 0 {
            opts.unknown_feature("Read-only compatible container feature")?;
        }
        if self.incompatible_features & !NX_INCOMPAT_DEFINED != 0 {
            opts.unknown_feature("Unrecognized incompatible container feature")?;
        }
        if self.incompatible_features & NX_INCOMPAT_VERSION1 != 0 {
            opts.unknown_feature("APFS version 1")?;
        }
        if self.incompatible_features & NX_INCOMPAT_VERSION2 == 0 {
            return Err(corrupt(CTX, "wrong APFS version."));
        }
        if self.is_fusion() != has_tier2 {
            return Err(corrupt(CTX, "fusion flag does not match the devices."));
        }

        if self.flags & !NX_FLAGS_DEFINED != 0 {
            return Err(corrupt(CTX, "invalid flag in use."));
        }
        if self.flags & NX_CRYPTO_SW != 0 {
            opts.unknown_feature("Software encryption")?;
        }

        if self.next_oid < OID_RESERVED_COUNT {
            return Err(corrupt(CTX, "next object id is reserved."));
        }
        if self.next_xid <= self.header.xid {
            return Err(corrupt(CTX, "next transaction is not in the future."));
        }

        if self.test_type != 0 || self.test_oid != 0 {
            return Err(corrupt(CTX, "test field in use."));
        }

        let quota = (self.block_count * self.block_size as u64).div_ceil(NX_BYTES_PER_FILE_SYSTEM);
        let expected_fs = quota.clamp(1, NX_MAX_FILE_SYSTEMS as u64) as u32;
        if self.max_file_systems != expected_fs {
            return Err(corrupt(CTX, "bad maximum filesystem count."));
        }
        for &oid in &self.fs_oids[self.max_file_systems as usize..] {
            if oid != 0 {
                return Err(corrupt(CTX, "volume slot in use past the maximum."));
            }
        }

        let expected_eph = (NX_EPH_MIN_BLOCK_COUNT << 32)
            | (NX_MAX_FILE_SYSTEM_EPH_STRUCTS << 16)
            | NX_EPH_INFO_VERSION;
        if self.ephemeral_info[0] != expected_eph {
            return Err(corrupt(CTX, "bad ephemeral info."));
        }
        for &slot in &self.ephemeral_info[1..] {
            if slot != 0 {
                return Err(corrupt(CTX, "ephemeral info in use."));
            }
        }

        if self.blocked_out.count != 0 || self.evict_mapping_tree_oid != 0 {
            opts.unknown_feature("Defragmentation")?;
        }
        if self.keylocker.count != 0 || self.mkb_locker.count != 0 {
            opts.unknown_feature("Keybag")?;
        }

        if !self.is_fusion() {
            if self.fusion_mt_oid != 0 || self.fusion_wbc_oid != 0 || self.fusion_wbc.count != 0 {
                return Err(corrupt(CTX, "fusion field on a single-device container."));
            }
            if self.fusion_uuid != [0u8; 16] {
                return Err(corrupt(CTX, "fusion uuid on a single-device container."));
            }
        }
        Ok(())
    }
}

/// One entry of the volume's software history.
#[derive(Debug, Clone, Copy)]
pub struct ModifiedBy {
    pub id: [u8; 32],
    pub timestamp: u64,
    pub last_xid: u64,
}

impl ModifiedBy {
    fn parse(cursor: &mut Cursor<&[u8]>) -> Result<Self> {
        let mut id = [0u8; 32];
        cursor.read_exact(&mut id)?;
        Ok(ModifiedBy {
            id,
            timestamp: cursor.read_u64::<LittleEndian>()?,
            last_xid: cursor.read_u64::<LittleEndian>()?,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.id == [0u8; 32] && self.timestamp == 0 && self.last_xid == 0
    }
}

/// Wrapped meta-crypto state. Only version sanity matters to a reader that
/// refuses encrypted features anyway.
#[derive(Debug, Clone, Copy)]
pub struct WrappedMetaCrypto {
    pub major_version: u16,
    pub minor_version: u16,
    pub cpflags: u32,
    pub persistent_class: u32,
    pub key_os_version: u32,
    pub key_revision: u16,
    pub unused: u16,
}

/// Volume superblock (APSB).
#[derive(Debug, Clone)]
pub struct ApfsSuperblock {
    pub header: ObjectHeader,
    pub magic: u32,
    pub fs_index: u32,
    pub features: u64,
    pub readonly_compatible_features: u64,
    pub incompatible_features: u64,
    pub unmount_time: u64,
    pub fs_reserve_block_count: u64,
    pub fs_quota_block_count: u64,
    pub fs_alloc_count: u64,
    pub meta_crypto: WrappedMetaCrypto,
    pub root_tree_type: u32,
    pub extentref_tree_type: u32,
    pub snap_meta_tree_type: u32,
    pub omap_oid: u64,
    pub root_tree_oid: u64,
    pub extentref_tree_oid: u64,
    pub snap_meta_tree_oid: u64,
    pub revert_to_xid: u64,
    pub revert_to_sblock_oid: u64,
    pub next_obj_id: u64,
    pub num_files: u64,
    pub num_directories: u64,
    pub num_symlinks: u64,
    pub num_other_fsobjects: u64,
    pub num_snapshots: u64,
    pub total_blocks_alloced: u64,
    pub total_blocks_freed: u64,
    pub uuid: [u8; 16],
    pub last_mod_time: u64,
    pub fs_flags: u64,
    pub formatted_by: ModifiedBy,
    pub modified_by: Vec<ModifiedBy>,
    pub volname: [u8; APFS_VOLNAME_LEN],
    pub next_doc_id: u32,
    pub role: u16,
    pub reserved: u16,
    pub root_to_xid: u64,
    pub er_state_oid: u64,
    pub cloneinfo_id_epoch: u64,
    pub cloneinfo_xid: u64,
    pub snap_meta_ext_oid: u64,
    pub volume_group_id: [u8; 16],
    pub integrity_meta_oid: u64,
    pub fext_tree_oid: u64,
    pub fext_tree_type: u32,
}

impl ApfsSuperblock {
    pub fn parse(block: &[u8]) -> Result<Self> {
        let header = ObjectHeader::parse(block)?;
        let mut cursor = Cursor::new(block);
        cursor.set_position(ObjectHeader::SIZE as u64);

        let magic = cursor.read_u32::<LittleEndian>()?;
        if magic != APSB_MAGIC {
            return Err(corrupt("Volume superblock", "wrong magic."));
        }

        let fs_index = cursor.read_u32::<LittleEndian>()?;
        let features = cursor.read_u64::<LittleEndian>()?;
        let readonly_compatible_features = cursor.read_u64::<LittleEndian>()?;
        let incompatible_features = cursor.read_u64::<LittleEndian>()?;
        let unmount_time = cursor.read_u64::<LittleEndian>()?;
        let fs_reserve_block_count = cursor.read_u64::<LittleEndian>()?;
        let fs_quota_block_count = cursor.read_u64::<LittleEndian>()?;
        let fs_alloc_count = cursor.read_u64::<LittleEndian>()?;

        let meta_crypto = WrappedMetaCrypto {
            major_version: cursor.read_u16::<LittleEndian>()?,
            minor_version: cursor.read_u16::<LittleEndian>()?,
            cpflags: cursor.read_u32::<LittleEndian>()?,
            persistent_class: cursor.read_u32::<LittleEndian>()?,
            key_os_version: cursor.read_u32::<LittleEndian>()?,
            key_revision: cursor.read_u16::<LittleEndian>()?,
            unused: cursor.read_u16::<LittleEndian>()?,
        };

        let root_tree_type = cursor.read_u32::<LittleEndian>()?;
        let extentref_tree_type = cursor.read_u32::<LittleEndian>()?;
        let snap_meta_tree_type = cursor.read_u32::<LittleEndian>()?;

        let omap_oid = cursor.read_u64::<LittleEndian>()?;
        let root_tree_oid = cursor.read_u64::<LittleEndian>()?;
        let extentref_tree_oid = cursor.read_u64::<LittleEndian>()?;
        let snap_meta_tree_oid = cursor.read_u64::<LittleEndian>()?;

        let revert_to_xid = cursor.read_u64::<LittleEndian>()?;
        let revert_to_sblock_oid = cursor.read_u64::<LittleEndian>()?;
        let next_obj_id = cursor.read_u64::<LittleEndian>()?;
        let num_files = cursor.read_u64::<LittleEndian>()?;
        let num_directories = cursor.read_u64::<LittleEndian>()?;
        let num_symlinks = cursor.read_u64::<LittleEndian>()?;
        let num_other_fsobjects = cursor.read_u64::<LittleEndian>()?;
        let num_snapshots = cursor.read_u64::<LittleEndian>()?;
        let total_blocks_alloced = cursor.read_u64::<LittleEndian>()?;
        let total_blocks_freed = cursor.read_u64::<LittleEndian>()?;

        let mut uuid = [0u8; 16];
        std::io::Read::read_exact(&mut cursor, &mut uuid)?;

        let last_mod_time = cursor.read_u64::<LittleEndian>()?;
        let fs_flags = cursor.read_u64::<LittleEndian>()?;

        let pos = cursor.position() as usize;
        let mut tail = Cursor::new(&block[pos..]);

        let formatted_by = ModifiedBy::parse(&mut tail)?;
        let mut modified_by = Vec::with_capacity(APFS_MAX_HIST);
        for _ in 0..APFS_MAX_HIST {
            modified_by.push(ModifiedBy::parse(&mut tail)?);
        }

        let mut volname = [0u8; APFS_VOLNAME_LEN];
        tail.read_exact(&mut volname)?;

        let next_doc_id = tail.read_u32::<LittleEndian>()?;
        let role = tail.read_u16::<LittleEndian>()?;
        let reserved = tail.read_u16::<LittleEndian>()?;
        let root_to_xid = tail.read_u64::<LittleEndian>()?;
        let er_state_oid = tail.read_u64::<LittleEndian>()?;
        let cloneinfo_id_epoch = tail.read_u64::<LittleEndian>()?;
        let cloneinfo_xid = tail.read_u64::<LittleEndian>()?;
        let snap_meta_ext_oid = tail.read_u64::<LittleEndian>()?;

        let mut volume_group_id = [0u8; 16];
        tail.read_exact(&mut volume_group_id)?;

        let integrity_meta_oid = tail.read_u64::<LittleEndian>()?;
        let fext_tree_oid = tail.read_u64::<LittleEndian>()?;
        let fext_tree_type = tail.read_u32::<LittleEndian>()?;

        Ok(ApfsSuperblock {
            header,
            magic,
            fs_index,
            features,
            readonly_compatible_features,
            incompatible_features,
            unmount_time,
            fs_reserve_block_count,
            fs_quota_block_count,
            fs_alloc_count,
            meta_crypto,
            root_tree_type,
            extentref_tree_type,
            snap_meta_tree_type,
            omap_oid,
            root_tree_oid,
            extentref_tree_oid,
            snap_meta_tree_oid,
            revert_to_xid,
            revert_to_sblock_oid,
            next_obj_id,
            num_files,
            num_directories,
            num_symlinks,
            num_other_fsobjects,
            num_snapshots,
            total_blocks_alloced,
            total_blocks_freed,
            uuid,
            last_mod_time,
            fs_flags,
            formatted_by,
            modified_by,
            volname,
            next_doc_id,
            role,
            reserved,
            root_to_xid,
            er_state_oid,
            cloneinfo_id_epoch,
            cloneinfo_xid,
            snap_meta_ext_oid,
            volume_group_id,
            integrity_meta_oid,
            fext_tree_oid,
            fext_tree_type,
        })
    }

    pub fn is_case_insensitive(&self) -> bool {
        self.incompatible_features & APFS_INCOMPAT_CASE_INSENSITIVE != 0
    }

    pub fn is_normalization_insensitive(&self) -> bool {
        self.incompatible_features & APFS_INCOMPAT_NORMALIZATION_INSENSITIVE != 0
    }

    pub fn is_sealed(&self) -> bool {
        self.incompatible_features & APFS_INCOMPAT_SEALED_VOLUME != 0
    }

    /// Directory entries carry hashed names unless the volume is both
    /// case-sensitive and normalization-sensitive.
    pub fn hashed_dentries(&self) -> bool {
        self.is_case_insensitive() || self.is_normalization_insensitive()
    }

    /// The label as bytes up to the terminator; fatal if unterminated.
    pub fn label(&self) -> Result<&[u8]> {
        match self.volname.iter().position(|&b| b == 0) {
            Some(pos) => Ok(&self.volname[..pos]),
            None => Err(corrupt("Volume superblock", "label is not terminated.")),
        }
    }

    /// Field checks that need no tree walks. `slot` is the index of this
    /// volume in the container's oid array.
    pub fn check(&self, slot: u32, opts: &ReportOptions) -> Result<()> {
        const CTX: &str = "Volume superblock";

        if self.fs_index != slot {
            return Err(corrupt(CTX, "wrong volume index."));
        }

        if self.features & !APFS_FEATURES_DEFINED != 0 {
            opts.unknown_feature("Unrecognized optional volume feature")?;
        }
        if self.features & APFS_FEATURE_DEFRAG_PRERELEASE != 0 {
            return Err(corrupt(CTX, "prerelease defragmentation feature."));
        }
        if self.readonly_compatible_features != 0 {
            opts.unknown_feature("Read-only compatible volume feature")?;
        }
        if self.incompatible_features & !APFS_INCOMPAT_DEFINED != 0 {
            opts.unknown_feature("Unrecognized incompatible volume feature")?;
        }
        if self.incompatible_features & APFS_INCOMPAT_DATALESS_SNAPS != 0 {
            opts.unknown_feature("Dataless snapshots")?;
        }
        if self.incompatible_features & APFS_INCOMPAT_ENC_ROLLED != 0 {
            opts.unknown_feature("Encryption rolling")?;
        }
        if self.incompatible_features & APFS_INCOMPAT_INCOMPLETE_RESTORE != 0 {
            opts.crash(CTX, "a restore was interrupted.")?;
        }
        if self.incompatible_features & APFS_INCOMPAT_PFK != 0 {
            opts.unknown_feature("Per-file keys")?;
        }
        if self.incompatible_features & APFS_INCOMPAT_SECONDARY_FSROOT != 0 {
            opts.unknown_feature("Secondary filesystem root")?;
        }

        if self.fs_flags & !APFS_FS_FLAGS_DEFINED != 0 {
            return Err(corrupt(CTX, "invalid flag in use."));
        }
        if self.fs_flags & APFS_FS_UNENCRYPTED == 0 {
            opts.unknown_feature("Software volume encryption")?;
        }
        if self.fs_flags & (APFS_FS_SPILLEDOVER | APFS_FS_RUN_SPILLOVER_CLEANER) != 0 {
            opts.unknown_feature("Fusion spillover")?;
        }

        if self.meta_crypto.major_version != APFS_WMCS_MAJOR_VERSION
            || self.meta_crypto.minor_version != APFS_WMCS_MINOR_VERSION
        {
            return Err(corrupt(CTX, "wrong meta-crypto version."));
        }
        if self.meta_crypto.cpflags != 0 || self.meta_crypto.unused != 0 {
            return Err(corrupt(CTX, "invalid meta-crypto flag in use."));
        }

        self.label().and_then(|label| {
            if label.is_empty() {
                return Err(corrupt(CTX, "label is empty."));
            }
            Ok(())
        })?;

        match self.role {
            APFS_VOL_ROLE_NONE
            | APFS_VOL_ROLE_SYSTEM
            | APFS_VOL_ROLE_USER
            | APFS_VOL_ROLE_RECOVERY
            | APFS_VOL_ROLE_VM
            | APFS_VOL_ROLE_PREBOOT
            | APFS_VOL_ROLE_INSTALLER
            | APFS_VOL_ROLE_DATA
            | APFS_VOL_ROLE_BASEBAND
            | APFS_VOL_ROLE_UPDATE
            | APFS_VOL_ROLE_XART
            | APFS_VOL_ROLE_HARDWARE
            | APFS_VOL_ROLE_BACKUP
            | APFS_VOL_ROLE_ENTERPRISE
            | APFS_VOL_ROLE_PRELOGIN => {}
            _ => return Err(corrupt(CTX, "invalid volume role.")),
        }
        if self.reserved != 0 {
            return Err(corrupt(CTX, "reserved field in use."));
        }

        if self.next_obj_id < APFS_MIN_USER_INO_NUM {
            return Err(corrupt(CTX, "next object id is reserved."));
        }
        if self.next_doc_id < APFS_MIN_DOC_ID {
            return Err(corrupt(CTX, "next document id is reserved."));
        }

        if self.revert_to_xid != 0 || self.revert_to_sblock_oid != 0 {
            opts.unknown_feature("Volume revert in progress")?;
        }
        if self.er_state_oid != 0 {
            opts.unknown_feature("Encryption rolling")?;
        }

        self.check_history()?;

        if self.is_sealed() {
            if self.fext_tree_oid == 0 || self.integrity_meta_oid == 0 {
                return Err(corrupt(CTX, "sealed volume lacks its trees."));
            }
        } else if self.fext_tree_oid != 0
            || self.fext_tree_type != 0
            || self.integrity_meta_oid != 0
        {
            return Err(corrupt(CTX, "fext tree on an unsealed volume."));
        }

        Ok(())
    }

    /// The software history must be dense, newest first, strictly
    /// descending, with the formatter strictly older than every modifier.
    fn check_history(&self) -> Result<()> {
        const CTX: &str = "Volume superblock";

        if self.formatted_by.is_empty() {
            return Err(corrupt(CTX, "missing formatter history."));
        }
        if self.formatted_by.id.iter().all(|&b| b != 0) {
            return Err(corrupt(CTX, "formatter id is not terminated."));
        }

        let mut prev_xid: Option<u64> = None;
        let mut seen_empty = false;
        let mut oldest: Option<u64> = None;
        for entry in &self.modified_by {
            if entry.is_empty() {
                seen_empty = true;
                continue;
            }
            if seen_empty {
                return Err(corrupt(CTX, "sparse modifier history."));
            }
            if entry.id.iter().all(|&b| b != 0) {
                return Err(corrupt(CTX, "modifier id is not terminated."));
            }
            if let Some(prev) = prev_xid {
                if entry.last_xid >= prev {
                    return Err(corrupt(CTX, "modifier history is out of order."));
                }
            }
            prev_xid = Some(entry.last_xid);
            oldest = Some(entry.last_xid);
        }

        if let Some(oldest) = oldest {
            if self.formatted_by.last_xid >= oldest {
                return Err(corrupt(CTX, "formatter is newer than a modifier."));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nxsb_wrong_magic() {
        let mut block = vec![0u8; 4096];
        block[32..36].copy_from_slice(&0xDEADBEEFu32.to_le_bytes());
        let err = NxSuperblock::parse(&block).unwrap_err();
        assert_eq!(err.to_string(), "Container superblock: wrong magic.");
    }

    #[test]
    fn test_nxsb_layout_offsets() {
        // The comparison quirk ranges pin the layout: the counter array
        // must start at 0x3D8 and the flags at 0x4F0.
        let mut block = vec![0u8; 4096];
        block[32..36].copy_from_slice(&NX_MAGIC.to_le_bytes());
        block[0x3D8..0x3E0].copy_from_slice(&0xAAu64.to_le_bytes());
        block[0x4F0..0x4F8].copy_from_slice(&NX_CRYPTO_SW.to_le_bytes());
        block[NX_FUSION_UUID_OFF] = 0x80;

        let sb = NxSuperblock::parse(&block).unwrap();
        assert_eq!(sb.counters[0], 0xAA);
        assert_eq!(sb.flags, NX_CRYPTO_SW);
        assert_eq!(sb.fusion_uuid[0], 0x80);
    }

    #[test]
    fn test_history_order() {
        let mut block = vec![0u8; 4096];
        block[32..36].copy_from_slice(&APSB_MAGIC.to_le_bytes());
        let mut sb = ApfsSuperblock::parse(&block).unwrap();

        sb.formatted_by.id[0] = b'f';
        sb.formatted_by.last_xid = 1;
        sb.modified_by[0].id[0] = b'm';
        sb.modified_by[0].last_xid = 9;
        sb.modified_by[1].id[0] = b'm';
        sb.modified_by[1].last_xid = 5;
        assert!(sb.check_history().is_ok());

        // Ascending modifiers are rejected.
        sb.modified_by[1].last_xid = 12;
        assert!(sb.check_history().is_err());

        // Formatter newer than the oldest modifier is rejected.
        sb.modified_by[1].last_xid = 5;
        sb.formatted_by.last_xid = 7;
        assert!(sb.check_history().is_err());
    }
}
