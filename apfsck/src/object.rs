use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read, Seek};

use crate::device::BlockSpace;
use crate::error::{corrupt, ReportOptions, Result};
use crate::fletcher;
use crate::omap::Omap;

// Object types (low 16 bits of the type word).
pub const OBJECT_TYPE_INVALID: u16 = 0x00;
pub const OBJECT_TYPE_NX_SUPERBLOCK: u16 = 0x01;
pub const OBJECT_TYPE_BTREE: u16 = 0x02;
pub const OBJECT_TYPE_BTREE_NODE: u16 = 0x03;
pub const OBJECT_TYPE_SPACEMAN: u16 = 0x05;
pub const OBJECT_TYPE_OMAP: u16 = 0x0B;
pub const OBJECT_TYPE_CHECKPOINT_MAP: u16 = 0x0C;
pub const OBJECT_TYPE_FS: u16 = 0x0D;
pub const OBJECT_TYPE_FSTREE: u16 = 0x0E;
pub const OBJECT_TYPE_BLOCKREFTREE: u16 = 0x0F;
pub const OBJECT_TYPE_SNAPMETATREE: u16 = 0x10;
pub const OBJECT_TYPE_NX_REAPER: u16 = 0x11;
pub const OBJECT_TYPE_EFI_JUMPSTART: u16 = 0x14;
pub const OBJECT_TYPE_FUSION_MIDDLE_TREE: u16 = 0x15;
pub const OBJECT_TYPE_NX_FUSION_WBC: u16 = 0x16;
pub const OBJECT_TYPE_SNAP_META_EXT: u16 = 0x1D;
pub const OBJECT_TYPE_INTEGRITY_META: u16 = 0x1E;
pub const OBJECT_TYPE_FEXT_TREE: u16 = 0x1F;

// Storage-class and auxiliary bits (high 16 bits of the type word).
pub const OBJ_VIRTUAL: u32 = 0x0000_0000;
pub const OBJ_EPHEMERAL: u32 = 0x8000_0000;
pub const OBJ_PHYSICAL: u32 = 0x4000_0000;
pub const OBJ_NOHEADER: u32 = 0x2000_0000;
pub const OBJ_ENCRYPTED: u32 = 0x1000_0000;
pub const OBJ_NONPERSISTENT: u32 = 0x0800_0000;

const OBJ_STORAGETYPE_MASK: u32 = 0xC000_0000;
const OBJ_FLAGS_DEFINED_MASK: u32 = 0xF800_0000;
pub const OBJECT_TYPE_MASK: u32 = 0x0000_FFFF;

// Well-known object ids.
pub const OID_INVALID: u64 = 0;
pub const OID_NX_SUPERBLOCK: u64 = 1;
pub const OID_RESERVED_COUNT: u64 = 1024;

/// How an object id resolves to a physical location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageClass {
    /// Resolved through an object map at some transaction.
    Virtual,
    /// Resolved through the checkpoint mapping table.
    Ephemeral,
    /// The oid is the physical block number.
    Physical,
}

/// 32-byte header present on every APFS metadata object. Little-endian.
#[derive(Debug, Clone)]
pub struct ObjectHeader {
    pub checksum: u64,
    pub oid: u64,
    pub xid: u64,
    pub type_and_flags: u32,
    pub subtype: u32,
}

impl ObjectHeader {
    pub const SIZE: usize = 32;

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(corrupt("Object header", "header is truncated."));
        }
        let mut cursor = Cursor::new(data);
        Ok(ObjectHeader {
            checksum: cursor.read_u64::<LittleEndian>()?,
            oid: cursor.read_u64::<LittleEndian>()?,
            xid: cursor.read_u64::<LittleEndian>()?,
            type_and_flags: cursor.read_u32::<LittleEndian>()?,
            subtype: cursor.read_u32::<LittleEndian>()?,
        })
    }

    /// Object type without the flag bits.
    pub fn object_type(&self) -> u16 {
        (self.type_and_flags & OBJECT_TYPE_MASK) as u16
    }

    /// Subtype without the flag bits; subtypes carry none in practice but
    /// the high half is masked off all the same.
    pub fn object_subtype(&self) -> u16 {
        (self.subtype & OBJECT_TYPE_MASK) as u16
    }

    pub fn flags(&self) -> u32 {
        self.type_and_flags & !OBJECT_TYPE_MASK
    }

    /// Decode and validate the flag bits, returning the storage class.
    pub fn storage(&self, opts: &ReportOptions) -> Result<StorageClass> {
        parse_flags(self.flags(), opts)
    }
}

/// Validate object flag bits and classify the storage type. Undefined bits
/// and the never-written-by-apple combinations are corruption; encrypted
/// objects are outside coverage.
pub fn parse_flags(flags: u32, opts: &ReportOptions) -> Result<StorageClass> {
    if flags & !OBJ_FLAGS_DEFINED_MASK != 0 {
        return Err(corrupt("Object header", "invalid flag in use."));
    }
    if flags & OBJ_ENCRYPTED != 0 {
        opts.unknown_feature("Encrypted object")?;
    }
    if flags & OBJ_NONPERSISTENT != 0 {
        return Err(corrupt("Object header", "nonpersistent flag on disk."));
    }
    if flags & OBJ_NOHEADER != 0 {
        return Err(corrupt("Object header", "headerless object has a header."));
    }

    match flags & OBJ_STORAGETYPE_MASK {
        OBJ_VIRTUAL => Ok(StorageClass::Virtual),
        OBJ_EPHEMERAL => Ok(StorageClass::Ephemeral),
        OBJ_PHYSICAL => Ok(StorageClass::Physical),
        _ => Err(corrupt("Object header", "invalid storage type.")),
    }
}

/// Constraints applied to a full object read.
pub struct ObjectRules<'a> {
    pub opts: &'a ReportOptions,
    /// Transaction of the checkpoint being checked; no object may be newer.
    pub max_xid: u64,
    /// Earliest transaction the owning volume can have written, zero when
    /// unknown.
    pub min_xid: u64,
}

impl<'a> ObjectRules<'a> {
    pub fn container(opts: &'a ReportOptions, max_xid: u64) -> Self {
        ObjectRules {
            opts,
            max_xid,
            min_xid: 0,
        }
    }
}

/// Read the block at `bno` and verify its checksum and header, with no
/// resolution or cross-checks applied.
pub fn read_object_nocheck<R: Read + Seek>(
    space: &mut BlockSpace<R>,
    bno: u64,
) -> Result<(Vec<u8>, ObjectHeader)> {
    let block = space.read_block(bno)?;
    if !fletcher::verify_object(&block) {
        return Err(corrupt("Object header", "bad checksum."));
    }
    let header = ObjectHeader::parse(&block)?;
    Ok((block, header))
}

/// Read an object by id, resolving through `omap` when one is supplied, and
/// enforce the header invariants: checksum, oid/xid agreement with the omap
/// record, type, subtype, storage class, and the transaction window.
pub fn read_object<R: Read + Seek>(
    space: &mut BlockSpace<R>,
    oid: u64,
    omap: Option<&mut Omap>,
    expected_type: u16,
    expected_subtype: u16,
    rules: &ObjectRules,
) -> Result<(Vec<u8>, ObjectHeader)> {
    let omap_xid = match omap {
        Some(omap) => {
            if oid < OID_RESERVED_COUNT {
                return Err(corrupt("Object header", "virtual oid is reserved."));
            }
            let rec = omap.lookup(space, oid, rules.max_xid)?;
            Some((rec.paddr, rec.xid))
        }
        None => None,
    };

    let (paddr, rec_xid) = match omap_xid {
        Some((paddr, xid)) => (paddr, Some(xid)),
        None => (oid, None),
    };

    let (block, header) = read_object_nocheck(space, paddr)?;

    if header.oid != oid {
        return Err(corrupt("Object header", "wrong object id."));
    }
    if header.xid == 0 || header.xid > rules.max_xid {
        return Err(corrupt("Object header", "transaction is in the future."));
    }
    if header.xid < rules.min_xid {
        return Err(corrupt("Object header", "transaction is too old."));
    }
    if let Some(rec_xid) = rec_xid {
        if header.xid != rec_xid {
            return Err(corrupt(
                "Object header",
                "transaction does not match the object map record.",
            ));
        }
    }
    if header.object_type() != expected_type {
        return Err(corrupt("Object header", "wrong object type."));
    }
    if header.object_subtype() != expected_subtype {
        return Err(corrupt("Object header", "wrong object subtype."));
    }

    let storage = header.storage(rules.opts)?;
    let expected_storage = if rec_xid.is_some() {
        StorageClass::Virtual
    } else {
        StorageClass::Physical
    };
    if storage != expected_storage {
        return Err(corrupt("Object header", "wrong storage type."));
    }

    Ok((block, header))
}
