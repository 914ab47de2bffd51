use byteorder::{LittleEndian, ReadBytesExt};
use crc::{Crc, CRC_32_ISCSI};
use std::cmp::Ordering;
use std::io::Cursor;

use crate::error::{corrupt, Result};
use crate::extents::{PhysExtEntry, APFS_KIND_NEW, APFS_KIND_UPDATE, PEXT_LEN_MASK};
use crate::inode::{
    self, DstreamRaw, INODE_BEING_TRUNCATED, INODE_HAS_FINDER_INFO, INODE_IS_SPARSE,
    INODE_MAINTAIN_DIR_STATS, S_IFBLK, S_IFCHR, S_IFDIR, S_IFIFO, S_IFLNK, S_IFMT, S_IFREG,
    S_IFSOCK,
};
use crate::snapshot;
use crate::superblock::{APFS_MIN_USER_INO_NUM, APFS_PRIV_DIR_INO_NUM, APFS_ROOT_DIR_INO_NUM};
use crate::volume::VolumeState;

// Catalog record kinds, the top 4 bits of a key's obj_id_and_type.
pub const RECORD_TYPE_SNAP_METADATA: u8 = 1;
pub const RECORD_TYPE_EXTENT: u8 = 2;
pub const RECORD_TYPE_INODE: u8 = 3;
pub const RECORD_TYPE_XATTR: u8 = 4;
pub const RECORD_TYPE_SIBLING_LINK: u8 = 5;
pub const RECORD_TYPE_DSTREAM_ID: u8 = 6;
pub const RECORD_TYPE_CRYPTO_STATE: u8 = 7;
pub const RECORD_TYPE_FILE_EXTENT: u8 = 8;
pub const RECORD_TYPE_DIR_REC: u8 = 9;
pub const RECORD_TYPE_DIR_STATS: u8 = 10;
pub const RECORD_TYPE_SNAP_NAME: u8 = 11;
pub const RECORD_TYPE_SIBLING_MAP: u8 = 12;

pub const OBJ_ID_MASK: u64 = 0x0FFF_FFFF_FFFF_FFFF;
const OBJ_TYPE_SHIFT: u32 = 60;

/// The fixed obj_id carried by every snapshot-name key.
pub const SNAP_NAME_OBJ_ID: u64 = OBJ_ID_MASK;

// Directory-entry file types (low 4 bits of the drec flags).
pub const DT_UNKNOWN: u16 = 0;
pub const DT_FIFO: u16 = 1;
pub const DT_CHR: u16 = 2;
pub const DT_DIR: u16 = 4;
pub const DT_BLK: u16 = 6;
pub const DT_REG: u16 = 8;
pub const DT_LNK: u16 = 10;
pub const DT_SOCK: u16 = 12;
pub const DT_WHT: u16 = 14;
const DREC_TYPE_MASK: u16 = 0x000F;

// Extended-attribute flags.
pub const XATTR_DATA_STREAM: u16 = 0x0001;
pub const XATTR_DATA_EMBEDDED: u16 = 0x0002;
pub const XATTR_FILE_SYSTEM_OWNED: u16 = 0x0004;
const XATTR_FLAGS_DEFINED: u16 = 0x0007;

/// Attribute names the checker has to recognise.
pub const XATTR_NAME_SYMLINK: &[u8] = b"com.apple.fs.symlink";
pub const XATTR_NAME_RSRC_FORK: &[u8] = b"com.apple.ResourceFork";

/// Crypto ids that reference no crypto-state record.
pub const CRYPTO_ID_NONE: u64 = 0;
pub const CRYPTO_ID_UNASSIGNED: u64 = u64::MAX;

const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// A catalog key split into its header and the kind-specific remainder.
#[derive(Debug, Clone, Copy)]
pub struct CatKey<'a> {
    pub cnid: u64,
    pub kind: u8,
    pub body: &'a [u8],
}

pub fn parse_cat_key(raw: &[u8]) -> Result<CatKey<'_>> {
    if raw.len() < 8 {
        return Err(corrupt("Catalog", "key is too small."));
    }
    let id_and_type = u64::from_le_bytes(raw[..8].try_into().unwrap());
    Ok(CatKey {
        cnid: id_and_type & OBJ_ID_MASK,
        kind: (id_and_type >> OBJ_TYPE_SHIFT) as u8,
        body: &raw[8..],
    })
}

/// Case folding for name comparison and hashing. The insensitive variant
/// lowercases per the Unicode simple mappings; byte strings that are not
/// UTF-8 are left alone and caught by the name validation instead.
pub fn fold_name(name: &[u8], case_fold: bool) -> Vec<u8> {
    if !case_fold {
        return name.to_vec();
    }
    match std::str::from_utf8(name) {
        Ok(s) => s.to_lowercase().into_bytes(),
        Err(_) => name.to_vec(),
    }
}

/// The 22-bit hash stored in hashed directory-entry keys: CRC-32C over the
/// UTF-32LE code points of the folded name, without the final complement.
pub fn drec_hash(name: &[u8], case_fold: bool) -> Result<u32> {
    let s = std::str::from_utf8(name)
        .map_err(|_| corrupt("Catalog", "name is not valid UTF-8."))?;

    let mut utf32 = Vec::with_capacity(s.len() * 4);
    for ch in s.chars() {
        if case_fold {
            for folded in ch.to_lowercase() {
                utf32.extend_from_slice(&(folded as u32).to_le_bytes());
            }
        } else {
            utf32.extend_from_slice(&(ch as u32).to_le_bytes());
        }
    }
    Ok(!CASTAGNOLI.checksum(&utf32) & 0x003F_FFFF)
}

/// A decoded directory-entry key.
pub struct DrecKey {
    pub hash: Option<u32>,
    /// Name without its terminator.
    pub name: Vec<u8>,
}

pub fn parse_drec_key(body: &[u8], hashed: bool) -> Result<DrecKey> {
    let (len, hash, name_at) = if hashed {
        if body.len() < 4 {
            return Err(corrupt("Catalog", "directory entry key is too small."));
        }
        let len_and_hash = u32::from_le_bytes(body[..4].try_into().unwrap());
        ((len_and_hash & 0x3FF) as usize, Some(len_and_hash >> 10), 4)
    } else {
        if body.len() < 2 {
            return Err(corrupt("Catalog", "directory entry key is too small."));
        }
        let len = u16::from_le_bytes(body[..2].try_into().unwrap()) as usize;
        (len, None, 2)
    };

    let name = decode_name(&body[name_at..], len)?;
    Ok(DrecKey { hash, name })
}

/// Validate a length-prefixed, NUL-terminated name field: the stored length
/// counts the terminator and must match the string exactly.
fn decode_name(data: &[u8], len: usize) -> Result<Vec<u8>> {
    if len == 0 || len > data.len() {
        return Err(corrupt("Catalog", "name is out of bounds."));
    }
    let name = &data[..len];
    match name.iter().position(|&b| b == 0) {
        Some(pos) if pos + 1 == len => Ok(name[..pos].to_vec()),
        _ => Err(corrupt("Catalog", "name is not terminated.")),
    }
}

/// Decode the name of an xattr or snapshot-name key: a u16 length counting
/// the terminator, then the string.
pub fn parse_named_key(body: &[u8]) -> Result<Vec<u8>> {
    if body.len() < 2 {
        return Err(corrupt("Catalog", "key is too small."));
    }
    let len = u16::from_le_bytes(body[..2].try_into().unwrap()) as usize;
    decode_name(&body[2..], len)
}

fn key_u64(body: &[u8]) -> Result<u64> {
    if body.len() < 8 {
        return Err(corrupt("Catalog", "key is too small."));
    }
    Ok(u64::from_le_bytes(body[..8].try_into().unwrap()))
}

/// Catalog key ordering: cnid, then kind, then the kind-specific secondary
/// key. Shared by the catalog, extent-ref and snapshot-meta trees.
pub fn cat_keycmp(a: &[u8], b: &[u8], case_fold: bool, hashed: bool) -> Result<Ordering> {
    let ka = parse_cat_key(a)?;
    let kb = parse_cat_key(b)?;

    let ord = (ka.cnid, ka.kind).cmp(&(kb.cnid, kb.kind));
    if ord != Ordering::Equal {
        return Ok(ord);
    }

    match ka.kind {
        RECORD_TYPE_FILE_EXTENT => Ok(key_u64(ka.body)?.cmp(&key_u64(kb.body)?)),
        RECORD_TYPE_SIBLING_LINK => Ok(key_u64(ka.body)?.cmp(&key_u64(kb.body)?)),
        RECORD_TYPE_XATTR | RECORD_TYPE_SNAP_NAME => {
            let na = parse_named_key(ka.body)?;
            let nb = parse_named_key(kb.body)?;
            Ok(na.cmp(&nb))
        }
        RECORD_TYPE_DIR_REC => {
            let da = parse_drec_key(ka.body, hashed)?;
            let db = parse_drec_key(kb.body, hashed)?;
            match (da.hash, db.hash) {
                (Some(ha), Some(hb)) if ha != hb => Ok(ha.cmp(&hb)),
                _ => Ok(fold_name(&da.name, case_fold).cmp(&fold_name(&db.name, case_fold))),
            }
        }
        _ => Ok(Ordering::Equal),
    }
}

/// Parsed inode value, the fixed 92 bytes before the xfield blob.
#[derive(Debug, Clone)]
pub struct InodeVal {
    pub parent_id: u64,
    pub private_id: u64,
    pub create_time: i64,
    pub modify_time: i64,
    pub change_time: i64,
    pub access_time: i64,
    pub internal_flags: u64,
    pub nchildren_or_nlink: i32,
    pub default_protection_class: u32,
    pub write_generation_counter: u32,
    pub bsd_flags: u32,
    pub uid: u32,
    pub gid: u32,
    pub mode: u16,
    pub pad1: u16,
    pub uncompressed_size: u64,
}

impl InodeVal {
    pub const FIXED_SIZE: usize = 92;

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::FIXED_SIZE {
            return Err(corrupt("Catalog", "inode value is too small."));
        }
        let mut cursor = Cursor::new(data);
        Ok(InodeVal {
            parent_id: cursor.read_u64::<LittleEndian>()?,
            private_id: cursor.read_u64::<LittleEndian>()?,
            create_time: cursor.read_i64::<LittleEndian>()?,
            modify_time: cursor.read_i64::<LittleEndian>()?,
            change_time: cursor.read_i64::<LittleEndian>()?,
            access_time: cursor.read_i64::<LittleEndian>()?,
            internal_flags: cursor.read_u64::<LittleEndian>()?,
            nchildren_or_nlink: cursor.read_i32::<LittleEndian>()?,
            default_protection_class: cursor.read_u32::<LittleEndian>()?,
            write_generation_counter: cursor.read_u32::<LittleEndian>()?,
            bsd_flags: cursor.read_u32::<LittleEndian>()?,
            uid: cursor.read_u32::<LittleEndian>()?,
            gid: cursor.read_u32::<LittleEndian>()?,
            mode: cursor.read_u16::<LittleEndian>()?,
            pad1: cursor.read_u16::<LittleEndian>()?,
            uncompressed_size: cursor.read_u64::<LittleEndian>()?,
        })
    }
}

/// Directory-entry value before its xfields.
#[derive(Debug, Clone)]
pub struct DrecVal {
    pub file_id: u64,
    pub date_added: i64,
    pub flags: u16,
}

impl DrecVal {
    pub const FIXED_SIZE: usize = 18;

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::FIXED_SIZE {
            return Err(corrupt("Catalog", "directory entry value is too small."));
        }
        let mut cursor = Cursor::new(data);
        Ok(DrecVal {
            file_id: cursor.read_u64::<LittleEndian>()?,
            date_added: cursor.read_i64::<LittleEndian>()?,
            flags: cursor.read_u16::<LittleEndian>()?,
        })
    }

    pub fn file_type(&self) -> u16 {
        self.flags & DREC_TYPE_MASK
    }
}

/// File-extent value.
#[derive(Debug, Clone)]
pub struct FileExtentVal {
    pub len_and_flags: u64,
    pub phys_block_num: u64,
    pub crypto_id: u64,
}

impl FileExtentVal {
    pub const SIZE: usize = 24;
    const LEN_MASK: u64 = 0x00FF_FFFF_FFFF_FFFF;

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() != Self::SIZE {
            return Err(corrupt("Catalog", "file extent value has the wrong size."));
        }
        let mut cursor = Cursor::new(data);
        Ok(FileExtentVal {
            len_and_flags: cursor.read_u64::<LittleEndian>()?,
            phys_block_num: cursor.read_u64::<LittleEndian>()?,
            crypto_id: cursor.read_u64::<LittleEndian>()?,
        })
    }

    pub fn length(&self) -> u64 {
        self.len_and_flags & Self::LEN_MASK
    }

    pub fn flag_bits(&self) -> u64 {
        self.len_and_flags & !Self::LEN_MASK
    }
}

fn dt_to_mode(dt: u16) -> Result<u16> {
    match dt {
        DT_FIFO => Ok(S_IFIFO),
        DT_CHR => Ok(S_IFCHR),
        DT_DIR => Ok(S_IFDIR),
        DT_BLK => Ok(S_IFBLK),
        DT_REG => Ok(S_IFREG),
        DT_LNK => Ok(S_IFLNK),
        DT_SOCK => Ok(S_IFSOCK),
        _ => Err(corrupt("Catalog", "invalid file type on a directory entry.")),
    }
}

/// Which tree a record came from; constrains the kinds allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordSource {
    Catalog,
    ExtentRef,
    SnapMeta,
}

enum CnidUse {
    Inode,
    /// A dstream reference; `owner` is the claiming inode when one is
    /// known (inode dstream xfields and attribute streams), None for
    /// records keyed by the dstream id itself.
    Dstream { owner: Option<u64> },
    Sibling,
}

/// Register a dstream id from outside the catalog walk (the fext tree).
pub(crate) fn register_dstream_cnid(state: &mut VolumeState, cnid: u64) -> Result<()> {
    register_cnid(state, cnid, CnidUse::Dstream { owner: None })
}

/// Refcount bookkeeping for crypto states: each nonzero, assigned crypto id
/// on a file extent or data stream charges one reference.
#[derive(Default)]
pub struct CryptoEntry {
    pub present: bool,
    pub recorded_refcnt: u32,
    pub observed: u32,
}

fn observe_crypto_id(state: &mut VolumeState, crypto_id: u64) {
    if crypto_id == CRYPTO_ID_NONE || crypto_id == CRYPTO_ID_UNASSIGNED {
        return;
    }
    state.cryptos.get_or_create(crypto_id).observed += 1;
}

/// Final pass over the crypto table: every referenced state must exist and
/// its reference count must balance.
pub fn check_crypto_table(state: &VolumeState) -> Result<()> {
    for (_id, entry) in state.cryptos.iter() {
        if !entry.present {
            return Err(corrupt("Catalog", "crypto state is missing."));
        }
        if entry.observed != entry.recorded_refcnt {
            return Err(corrupt("Catalog", "wrong reference count on a crypto state."));
        }
    }
    Ok(())
}

fn register_cnid(state: &mut VolumeState, cnid: u64, used_as: CnidUse) -> Result<()> {
    if cnid == 0 {
        return Err(corrupt("Catalog", "record for an invalid id."));
    }
    if cnid >= APFS_MIN_USER_INO_NUM && cnid >= state.next_obj_id {
        return Err(corrupt("Catalog", "id above the next allocation."));
    }
    let entry = state.cnids.get_or_create(cnid);
    match used_as {
        CnidUse::Inode => entry.inode = true,
        CnidUse::Dstream { owner } => {
            entry.dstream = true;
            if owner == Some(cnid) {
                entry.dstream_self_owned = true;
            }
        }
        CnidUse::Sibling => entry.sibling = true,
    }
    // Sibling ids never alias. A dstream may share an inode's id only
    // when that inode itself owns the stream.
    if entry.sibling && (entry.inode || entry.dstream) {
        return Err(corrupt("Catalog", "catalog id reused."));
    }
    if entry.inode && entry.dstream && !entry.dstream_self_owned {
        return Err(corrupt("Catalog", "catalog id reused."));
    }
    Ok(())
}

/// Dispatch one leaf record of the catalog, extent-ref or snapshot-meta
/// tree to its handler.
pub fn parse_record(
    key: &[u8],
    val: &[u8],
    source: RecordSource,
    state: &mut VolumeState,
) -> Result<()> {
    let cat_key = parse_cat_key(key)?;

    match source {
        RecordSource::ExtentRef => {
            if cat_key.kind != RECORD_TYPE_EXTENT {
                return Err(corrupt("Extent reference tree", "stray record."));
            }
        }
        RecordSource::SnapMeta => {
            if cat_key.kind != RECORD_TYPE_SNAP_METADATA && cat_key.kind != RECORD_TYPE_SNAP_NAME
            {
                return Err(corrupt("Snapshot metadata", "stray record."));
            }
        }
        RecordSource::Catalog => {
            if cat_key.kind == RECORD_TYPE_SNAP_METADATA || cat_key.kind == RECORD_TYPE_SNAP_NAME
            {
                return Err(corrupt("Catalog", "snapshot record in the catalog."));
            }
        }
    }

    match cat_key.kind {
        RECORD_TYPE_INODE => {
            register_cnid(state, cat_key.cnid, CnidUse::Inode)?;
            handle_inode(cat_key, val, state)
        }
        RECORD_TYPE_DIR_REC => {
            register_cnid(state, cat_key.cnid, CnidUse::Inode)?;
            handle_drec(cat_key, val, state)
        }
        RECORD_TYPE_XATTR => {
            register_cnid(state, cat_key.cnid, CnidUse::Inode)?;
            handle_xattr(cat_key, val, state)
        }
        RECORD_TYPE_DIR_STATS => {
            register_cnid(state, cat_key.cnid, CnidUse::Inode)?;
            handle_dir_stats(cat_key, val, state)
        }
        RECORD_TYPE_SIBLING_LINK => {
            register_cnid(state, cat_key.cnid, CnidUse::Inode)?;
            handle_sibling_link(cat_key, val, state)
        }
        RECORD_TYPE_SIBLING_MAP => {
            register_cnid(state, cat_key.cnid, CnidUse::Sibling)?;
            handle_sibling_map(cat_key, val, state)
        }
        RECORD_TYPE_FILE_EXTENT => {
            if state.sealed {
                return Err(corrupt("Catalog", "file extent on a sealed volume."));
            }
            register_cnid(state, cat_key.cnid, CnidUse::Dstream { owner: None })?;
            handle_file_extent(cat_key, val, state)
        }
        RECORD_TYPE_DSTREAM_ID => {
            register_cnid(state, cat_key.cnid, CnidUse::Dstream { owner: None })?;
            handle_dstream_id(cat_key, val, state)
        }
        RECORD_TYPE_CRYPTO_STATE => handle_crypto_state(cat_key, val, state),
        RECORD_TYPE_EXTENT => handle_phys_extent(cat_key, val, state),
        RECORD_TYPE_SNAP_METADATA => snapshot::handle_snap_metadata(cat_key.cnid, val, state),
        RECORD_TYPE_SNAP_NAME => snapshot::handle_snap_name(cat_key, val, state),
        _ => Err(corrupt("Catalog", "invalid record kind.")),
    }
}

fn handle_inode(key: CatKey, val: &[u8], state: &mut VolumeState) -> Result<()> {
    const CTX: &str = "Catalog";

    if !key.body.is_empty() {
        return Err(corrupt(CTX, "inode key has trailing bytes."));
    }
    let v = InodeVal::parse(val)?;

    let filetype = v.mode & S_IFMT;
    match filetype {
        S_IFREG | S_IFDIR | S_IFLNK | S_IFCHR | S_IFBLK | S_IFIFO | S_IFSOCK => {}
        _ => return Err(corrupt(CTX, "invalid file mode.")),
    }
    if v.pad1 != 0 {
        return Err(corrupt(CTX, "padding in use in an inode."));
    }
    if v.nchildren_or_nlink < 0 {
        return Err(corrupt(CTX, "negative link count."));
    }
    if v.parent_id == 0 || v.private_id == 0 {
        return Err(corrupt(CTX, "inode without parent or stream id."));
    }
    if v.internal_flags & !inode::INODE_FLAGS_DEFINED != 0 {
        return Err(corrupt(CTX, "invalid inode flag in use."));
    }
    match v.default_protection_class {
        0 | 1 | 2 | 3 | 4 | 6 => {}
        _ => return Err(corrupt(CTX, "invalid protection class.")),
    }
    if v.internal_flags & INODE_BEING_TRUNCATED != 0 {
        state.opts.crash(CTX, "inode is being truncated.")?;
    }

    if key.cnid == APFS_ROOT_DIR_INO_NUM && filetype != S_IFDIR {
        return Err(corrupt(CTX, "root directory is not a directory."));
    }
    if key.cnid == APFS_PRIV_DIR_INO_NUM && filetype != S_IFDIR {
        return Err(corrupt(CTX, "private directory is not a directory."));
    }

    match filetype {
        S_IFDIR => state.num_directories += 1,
        S_IFREG => state.num_files += 1,
        S_IFLNK => state.num_symlinks += 1,
        _ => state.num_other += 1,
    }

    let xf = inode::parse_inode_xfields(
        &val[InodeVal::FIXED_SIZE..],
        state.next_doc_id,
        &state.opts,
    )?;

    // Presence bitmap against the inode flags.
    if (v.internal_flags & INODE_HAS_FINDER_INFO != 0) != xf.finder_info {
        return Err(corrupt(CTX, "finder info flag does not match the field."));
    }
    if (v.internal_flags & INODE_IS_SPARSE != 0) != xf.sparse_bytes.is_some() {
        return Err(corrupt(CTX, "sparse flag does not match the field."));
    }
    if (v.internal_flags & INODE_MAINTAIN_DIR_STATS != 0) != xf.dir_stats_origin.is_some() {
        return Err(corrupt(CTX, "directory statistics flag does not match the field."));
    }
    if let Some(_rdev) = xf.rdev {
        if filetype != S_IFCHR && filetype != S_IFBLK {
            return Err(corrupt(CTX, "device identifier on a regular object."));
        }
    }

    if let Some(dstream) = xf.dstream.as_ref() {
        if filetype != S_IFREG {
            return Err(corrupt(CTX, "data stream on something that is not a file."));
        }
        if dstream.alloced_size % state.block_size as u64 != 0 {
            return Err(corrupt(CTX, "misaligned allocated size."));
        }
        register_cnid(
            state,
            v.private_id,
            CnidUse::Dstream {
                owner: Some(key.cnid),
            },
        )?;
        observe_crypto_id(state, dstream.default_crypto_id);
        let ds = state.dstreams.get_or_create(v.private_id);
        ds.owners += 1;
        ds.set_geometry(dstream.size, dstream.alloced_size)?;
    }

    let entry = state.inodes.get_or_create(key.cnid);
    if entry.seen {
        return Err(corrupt(CTX, "inode described twice."));
    }
    entry.seen = true;
    entry.parent_id = v.parent_id;
    entry.private_id = v.private_id;
    entry.flags = v.internal_flags;
    entry.recorded_count = v.nchildren_or_nlink as u32;
    entry.name = xf.name;
    entry.sparse_bytes = xf.sparse_bytes;
    entry.has_finder_info = xf.finder_info;
    entry.has_dir_stats_xfield = xf.dir_stats_origin.is_some();
    if xf.dstream.is_some() {
        entry.dstream_id = Some(v.private_id);
    }

    if let Some(dt_mode) = entry.dt_mode {
        if dt_mode != filetype {
            return Err(corrupt(CTX, "file type does not match the directory entry."));
        }
    }
    entry.mode = v.mode;
    Ok(())
}

fn handle_drec(key: CatKey, val: &[u8], state: &mut VolumeState) -> Result<()> {
    const CTX: &str = "Catalog";

    let drec_key = parse_drec_key(key.body, state.hashed)?;
    if std::str::from_utf8(&drec_key.name).is_err() {
        return Err(corrupt(CTX, "name is not valid UTF-8."));
    }
    if let Some(stored) = drec_key.hash {
        let computed = drec_hash(&drec_key.name, state.case_fold)?;
        if stored != computed {
            return Err(corrupt(CTX, "wrong name hash on a directory entry."));
        }
    }

    let v = DrecVal::parse(val)?;
    if v.flags & !DREC_TYPE_MASK != 0 {
        return Err(corrupt(CTX, "invalid directory entry flag in use."));
    }
    let dt_mode = dt_to_mode(v.file_type())?;
    register_cnid(state, v.file_id, CnidUse::Inode)?;

    // The parent inode record sorts before its entries, so it must be here.
    let parent = state.inodes.get_or_create(key.cnid);
    if !parent.seen || !parent.is_dir() {
        return Err(corrupt(CTX, "directory entry without its directory."));
    }
    parent.child_count += 1;

    let mut sibling_id = None;
    if val.len() > DrecVal::FIXED_SIZE {
        for field in inode::parse_xfield_blob(&val[DrecVal::FIXED_SIZE..])? {
            match field.xtype {
                inode::DREC_EXT_TYPE_SIBLING_ID => {
                    if field.data.len() != 8 {
                        return Err(corrupt(CTX, "wrong extended-field size."));
                    }
                    sibling_id = Some(u64::from_le_bytes(field.data.try_into().unwrap()));
                }
                _ => {
                    return Err(corrupt(CTX, "invalid extended field on a directory entry."));
                }
            }
        }
    }

    let target = state.inodes.get_or_create(v.file_id);
    target.link_count += 1;
    if target.seen {
        if target.mode & S_IFMT != dt_mode {
            return Err(corrupt(CTX, "file type does not match the directory entry."));
        }
    } else if let Some(prev) = target.dt_mode {
        if prev != dt_mode {
            return Err(corrupt(CTX, "entries disagree on a file type."));
        }
    }
    target.dt_mode = Some(dt_mode);

    if target.first_link.is_none() {
        target.first_link = Some((key.cnid, drec_key.name.clone()));
    }

    if let Some(id) = sibling_id {
        register_cnid(state, id, CnidUse::Sibling)?;
        let target = state.inodes.get_or_create(v.file_id);
        let sibling = target.sibling(id);
        if sibling.seen_dentry {
            return Err(corrupt(CTX, "sibling id used by two entries."));
        }
        sibling.seen_dentry = true;
        match sibling.name.as_ref() {
            Some(name) => {
                if *name != drec_key.name || sibling.parent_id != key.cnid {
                    return Err(corrupt(CTX, "sibling link does not match its entry."));
                }
            }
            None => {
                sibling.name = Some(drec_key.name.clone());
                sibling.parent_id = key.cnid;
            }
        }
    }
    Ok(())
}

fn handle_xattr(key: CatKey, val: &[u8], state: &mut VolumeState) -> Result<()> {
    const CTX: &str = "Catalog";

    let name = parse_named_key(key.body)?;
    if std::str::from_utf8(&name).is_err() {
        return Err(corrupt(CTX, "name is not valid UTF-8."));
    }

    if val.len() < 4 {
        return Err(corrupt(CTX, "attribute value is too small."));
    }
    let flags = u16::from_le_bytes(val[..2].try_into().unwrap());
    let xdata_len = u16::from_le_bytes(val[2..4].try_into().unwrap()) as usize;
    let xdata = &val[4..];

    if flags & !XATTR_FLAGS_DEFINED != 0 {
        return Err(corrupt(CTX, "invalid attribute flag in use."));
    }
    let streamed = flags & XATTR_DATA_STREAM != 0;
    let embedded = flags & XATTR_DATA_EMBEDDED != 0;
    if streamed == embedded {
        return Err(corrupt(CTX, "attribute must be embedded or streamed."));
    }
    if xdata_len != xdata.len() {
        return Err(corrupt(CTX, "wrong attribute data length."));
    }

    if streamed {
        if xdata.len() != 8 + DstreamRaw::SIZE {
            return Err(corrupt(CTX, "wrong attribute stream size."));
        }
        let xattr_obj_id = u64::from_le_bytes(xdata[..8].try_into().unwrap());
        let dstream = DstreamRaw::parse(&xdata[8..])?;
        if dstream.alloced_size % state.block_size as u64 != 0 {
            return Err(corrupt(CTX, "misaligned allocated size."));
        }
        register_cnid(
            state,
            xattr_obj_id,
            CnidUse::Dstream {
                owner: Some(key.cnid),
            },
        )?;
        observe_crypto_id(state, dstream.default_crypto_id);
        let ds = state.dstreams.get_or_create(xattr_obj_id);
        ds.is_xattr = true;
        ds.owners += 1;
        ds.set_geometry(dstream.size, dstream.alloced_size)?;
    }

    let entry = state.inodes.get_or_create(key.cnid);
    if name == XATTR_NAME_SYMLINK {
        entry.has_symlink_xattr = true;
    }
    if name == XATTR_NAME_RSRC_FORK {
        if !streamed {
            return Err(corrupt(CTX, "resource fork is not streamed."));
        }
        entry.has_rsrc_xattr = true;
    }
    Ok(())
}

fn handle_dir_stats(key: CatKey, val: &[u8], state: &mut VolumeState) -> Result<()> {
    const CTX: &str = "Catalog";

    if !key.body.is_empty() {
        return Err(corrupt(CTX, "directory statistics key has trailing bytes."));
    }
    if val.len() != 32 {
        return Err(corrupt(CTX, "directory statistics have the wrong size."));
    }
    let num_children = u64::from_le_bytes(val[..8].try_into().unwrap());

    let entry = state.inodes.get_or_create(key.cnid);
    if entry.dir_stats_children.is_some() {
        return Err(corrupt(CTX, "directory statistics described twice."));
    }
    entry.dir_stats_children = Some(num_children);
    Ok(())
}

fn handle_sibling_link(key: CatKey, val: &[u8], state: &mut VolumeState) -> Result<()> {
    const CTX: &str = "Catalog";

    let sibling_id = key_u64(key.body)?;
    register_cnid(state, sibling_id, CnidUse::Sibling)?;

    if val.len() < 10 {
        return Err(corrupt(CTX, "sibling link value is too small."));
    }
    let parent_id = u64::from_le_bytes(val[..8].try_into().unwrap());
    let name_len = u16::from_le_bytes(val[8..10].try_into().unwrap()) as usize;
    let name = decode_name(&val[10..], name_len)?;

    let entry = state.inodes.get_or_create(key.cnid);
    let sibling = entry.sibling(sibling_id);
    if sibling.seen_link {
        return Err(corrupt(CTX, "sibling link described twice."));
    }
    sibling.seen_link = true;
    match sibling.name.as_ref() {
        Some(existing) => {
            if *existing != name || sibling.parent_id != parent_id {
                return Err(corrupt(CTX, "sibling link does not match its entry."));
            }
        }
        None => {
            sibling.name = Some(name);
            sibling.parent_id = parent_id;
        }
    }
    Ok(())
}

fn handle_sibling_map(key: CatKey, val: &[u8], state: &mut VolumeState) -> Result<()> {
    const CTX: &str = "Catalog";

    if !key.body.is_empty() {
        return Err(corrupt(CTX, "sibling map key has trailing bytes."));
    }
    if val.len() != 8 {
        return Err(corrupt(CTX, "sibling map value has the wrong size."));
    }
    let file_id = u64::from_le_bytes(val[..8].try_into().unwrap());

    let entry = state.inodes.get_or_create(file_id);
    let sibling = entry.sibling(key.cnid);
    if sibling.mapped {
        return Err(corrupt(CTX, "sibling mapped twice."));
    }
    sibling.mapped = true;
    Ok(())
}

fn handle_file_extent(key: CatKey, val: &[u8], state: &mut VolumeState) -> Result<()> {
    const CTX: &str = "Catalog";

    let addr = key_u64(key.body)?;
    let v = FileExtentVal::parse(val)?;
    let len = v.length();

    if len == 0 || len % state.block_size as u64 != 0 {
        return Err(corrupt(CTX, "invalid extent length."));
    }
    if v.flag_bits() != 0 {
        return Err(corrupt(CTX, "invalid extent flag in use."));
    }

    observe_crypto_id(state, v.crypto_id);

    let ds = state.dstreams.get_or_create(key.cnid);
    if ds.bytes != addr {
        return Err(corrupt(CTX, "extents are not consecutive."));
    }
    ds.bytes += len;
    if v.phys_block_num == 0 {
        // A hole in a sparse file.
        ds.sparse_bytes += len;
    } else {
        ds.ranges.push((v.phys_block_num, len / state.block_size as u64));
    }
    Ok(())
}

fn handle_dstream_id(key: CatKey, val: &[u8], state: &mut VolumeState) -> Result<()> {
    const CTX: &str = "Catalog";

    if !key.body.is_empty() {
        return Err(corrupt(CTX, "dstream id key has trailing bytes."));
    }
    if val.len() != 4 {
        return Err(corrupt(CTX, "dstream id value has the wrong size."));
    }
    let refcnt = u32::from_le_bytes(val.try_into().unwrap());
    if refcnt == 0 {
        return Err(corrupt(CTX, "zero reference count on a data stream."));
    }

    let ds = state.dstreams.get_or_create(key.cnid);
    if ds.seen {
        return Err(corrupt(CTX, "dstream id described twice."));
    }
    ds.seen = true;
    ds.recorded_refcnt = Some(refcnt);
    Ok(())
}

fn handle_crypto_state(key: CatKey, val: &[u8], state: &mut VolumeState) -> Result<()> {
    const CTX: &str = "Catalog";

    if !key.body.is_empty() {
        return Err(corrupt(CTX, "crypto state key has trailing bytes."));
    }
    // Only the refcount bookkeeping is in scope for crypto states.
    if val.len() < 4 {
        return Err(corrupt(CTX, "crypto state value is too small."));
    }
    let refcnt = u32::from_le_bytes(val[..4].try_into().unwrap());
    if refcnt == 0 {
        return Err(corrupt(CTX, "zero reference count on a crypto state."));
    }

    let entry = state.cryptos.get_or_create(key.cnid);
    if entry.present {
        return Err(corrupt(CTX, "crypto state described twice."));
    }
    entry.present = true;
    entry.recorded_refcnt = refcnt;
    Ok(())
}

fn handle_phys_extent(key: CatKey, val: &[u8], state: &mut VolumeState) -> Result<()> {
    const CTX: &str = "Extent reference tree";

    if !key.body.is_empty() {
        return Err(corrupt(CTX, "extent key has trailing bytes."));
    }
    if val.len() != 20 {
        return Err(corrupt(CTX, "extent value has the wrong size."));
    }
    let len_and_kind = u64::from_le_bytes(val[..8].try_into().unwrap());
    let owner = u64::from_le_bytes(val[8..16].try_into().unwrap());
    let refcnt = u32::from_le_bytes(val[16..20].try_into().unwrap());

    let blocks = len_and_kind & PEXT_LEN_MASK;
    let kind = (len_and_kind >> 60) as u8;

    if blocks == 0 {
        return Err(corrupt(CTX, "extent with no blocks."));
    }
    match kind {
        APFS_KIND_NEW => {
            if owner == 0 {
                return Err(corrupt(CTX, "new extent without an owner."));
            }
        }
        APFS_KIND_UPDATE => {
            if owner != 0 {
                return Err(corrupt(CTX, "updated extent with an owner."));
            }
        }
        _ => return Err(corrupt(CTX, "invalid extent kind.")),
    }
    if refcnt == 0 {
        return Err(corrupt(CTX, "zero reference count on an extent."));
    }

    // Records arrive sorted by first block; ranges must not overlap.
    if key.cnid < state.last_extent_end {
        return Err(corrupt(CTX, "extents overlap."));
    }
    state.last_extent_end = key.cnid + blocks;

    let snapshot = state.in_snapshot_walk;
    let entry = state.extents.get_or_create(key.cnid);
    if entry.present {
        return Err(corrupt(CTX, "extent described twice."));
    }
    *entry = PhysExtEntry {
        present: true,
        blocks,
        kind,
        owner,
        recorded_refcnt: refcnt,
        observed_refs: 0,
        snapshot,
    };
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cat_key_split() {
        let raw = ((3u64 << 60) | 42).to_le_bytes();
        let key = parse_cat_key(&raw).unwrap();
        assert_eq!(key.cnid, 42);
        assert_eq!(key.kind, RECORD_TYPE_INODE);
        assert!(key.body.is_empty());
    }

    #[test]
    fn test_keycmp_orders_by_id_then_kind() {
        let key = |cnid: u64, kind: u8| ((kind as u64) << 60 | cnid).to_le_bytes();

        let a = key(5, RECORD_TYPE_INODE);
        let b = key(5, RECORD_TYPE_DIR_REC);
        let c = key(6, RECORD_TYPE_INODE);

        assert_eq!(cat_keycmp(&a, &b, false, true).unwrap(), Ordering::Less);
        assert_eq!(cat_keycmp(&b, &c, false, true).unwrap(), Ordering::Less);
        assert_eq!(cat_keycmp(&a, &a, false, true).unwrap(), Ordering::Equal);
    }

    #[test]
    fn test_keycmp_file_extent_secondary() {
        let key = |addr: u64| {
            let mut raw = ((RECORD_TYPE_FILE_EXTENT as u64) << 60 | 9).to_le_bytes().to_vec();
            raw.extend_from_slice(&addr.to_le_bytes());
            raw
        };
        assert_eq!(
            cat_keycmp(&key(0), &key(4096), false, true).unwrap(),
            Ordering::Less
        );
        assert_eq!(
            cat_keycmp(&key(4096), &key(4096), false, true).unwrap(),
            Ordering::Equal
        );
    }

    #[test]
    fn test_drec_hash_folding() {
        // Folded and unfolded names hash identically only under folding.
        let upper = drec_hash(b"README", true).unwrap();
        let lower = drec_hash(b"readme", true).unwrap();
        assert_eq!(upper, lower);

        let upper = drec_hash(b"README", false).unwrap();
        let lower = drec_hash(b"readme", false).unwrap();
        assert_ne!(upper, lower);

        // 22 bits only.
        assert_eq!(drec_hash(b"anything", true).unwrap() & !0x003F_FFFF, 0);
    }

    #[test]
    fn test_drec_key_parse() {
        let name = b"file.txt\0";
        let hash = drec_hash(b"file.txt", true).unwrap();
        let mut body = Vec::new();
        body.extend_from_slice(&((hash << 10) | name.len() as u32).to_le_bytes());
        body.extend_from_slice(name);

        let parsed = parse_drec_key(&body, true).unwrap();
        assert_eq!(parsed.name, b"file.txt");
        assert_eq!(parsed.hash, Some(hash));

        // Unterminated name.
        let mut bad = Vec::new();
        bad.extend_from_slice(&(8u32 | (hash << 10)).to_le_bytes());
        bad.extend_from_slice(b"file.txt");
        assert!(parse_drec_key(&bad, true).is_err());
    }
}
