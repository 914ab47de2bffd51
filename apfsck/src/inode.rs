use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

use crate::error::{corrupt, ReportOptions, Result};
use crate::superblock::{APFS_MIN_DOC_ID, APFS_PRIV_DIR_INO_NUM, APFS_ROOT_DIR_INO_NUM};

// Inode internal flags.
pub const INODE_IS_APFS_PRIVATE: u64 = 0x0000_0001;
pub const INODE_MAINTAIN_DIR_STATS: u64 = 0x0000_0002;
pub const INODE_DIR_STATS_ORIGIN: u64 = 0x0000_0004;
pub const INODE_PROT_CLASS_EXPLICIT: u64 = 0x0000_0008;
pub const INODE_WAS_CLONED: u64 = 0x0000_0010;
pub const INODE_FLAG_UNUSED: u64 = 0x0000_0020;
pub const INODE_HAS_SECURITY_EA: u64 = 0x0000_0040;
pub const INODE_BEING_TRUNCATED: u64 = 0x0000_0080;
pub const INODE_HAS_FINDER_INFO: u64 = 0x0000_0100;
pub const INODE_IS_SPARSE: u64 = 0x0000_0200;
pub const INODE_WAS_EVER_CLONED: u64 = 0x0000_0400;
pub const INODE_ACTIVE_FILE_TRIMMED: u64 = 0x0000_0800;
pub const INODE_PINNED_TO_MAIN: u64 = 0x0000_1000;
pub const INODE_PINNED_TO_TIER2: u64 = 0x0000_2000;
pub const INODE_HAS_RSRC_FORK: u64 = 0x0000_4000;
pub const INODE_NO_RSRC_FORK: u64 = 0x0000_8000;
pub const INODE_ALLOCATION_SPILLEDOVER: u64 = 0x0001_0000;
pub const INODE_FAST_PROMOTE: u64 = 0x0002_0000;
pub const INODE_HAS_UNCOMPRESSED_SIZE: u64 = 0x0004_0000;
pub const INODE_IS_PURGEABLE: u64 = 0x0008_0000;
pub const INODE_WANTS_TO_BE_PURGEABLE: u64 = 0x0010_0000;
pub const INODE_IS_SYNC_ROOT: u64 = 0x0020_0000;
pub const INODE_SNAPSHOT_COW_EXEMPTION: u64 = 0x0040_0000;
pub const INODE_FLAGS_DEFINED: u64 = 0x007F_FFFF;

// Extended-field types on inodes.
pub const INO_EXT_TYPE_SNAP_XID: u8 = 1;
pub const INO_EXT_TYPE_DELTA_TREE_OID: u8 = 2;
pub const INO_EXT_TYPE_DOCUMENT_ID: u8 = 3;
pub const INO_EXT_TYPE_NAME: u8 = 4;
pub const INO_EXT_TYPE_PREV_FSIZE: u8 = 5;
pub const INO_EXT_TYPE_RESERVED_6: u8 = 6;
pub const INO_EXT_TYPE_FINDER_INFO: u8 = 7;
pub const INO_EXT_TYPE_DSTREAM: u8 = 8;
pub const INO_EXT_TYPE_RESERVED_9: u8 = 9;
pub const INO_EXT_TYPE_DIR_STATS_KEY: u8 = 10;
pub const INO_EXT_TYPE_FS_UUID: u8 = 11;
pub const INO_EXT_TYPE_RESERVED_12: u8 = 12;
pub const INO_EXT_TYPE_SPARSE_BYTES: u8 = 13;
pub const INO_EXT_TYPE_RDEV: u8 = 14;

// Extended-field types on directory entries.
pub const DREC_EXT_TYPE_SIBLING_ID: u8 = 1;

// Extended-field flags.
pub const XF_DATA_DEPENDENT: u8 = 0x01;
pub const XF_DO_NOT_COPY: u8 = 0x02;
pub const XF_RESERVED_4: u8 = 0x04;
pub const XF_CHILDREN_INHERIT: u8 = 0x08;
pub const XF_USER_FIELD: u8 = 0x10;
pub const XF_SYSTEM_FIELD: u8 = 0x20;
const XF_FLAGS_DEFINED: u8 = 0x3F;

// File mode bits.
pub const S_IFMT: u16 = 0o170000;
pub const S_IFIFO: u16 = 0o010000;
pub const S_IFCHR: u16 = 0o020000;
pub const S_IFDIR: u16 = 0o040000;
pub const S_IFBLK: u16 = 0o060000;
pub const S_IFREG: u16 = 0o100000;
pub const S_IFLNK: u16 = 0o120000;
pub const S_IFSOCK: u16 = 0o140000;

/// The embedded data-stream descriptor (j_dstream).
#[derive(Debug, Clone, Copy, Default)]
pub struct DstreamRaw {
    pub size: u64,
    pub alloced_size: u64,
    pub default_crypto_id: u64,
    pub total_bytes_written: u64,
    pub total_bytes_read: u64,
}

impl DstreamRaw {
    pub const SIZE: usize = 40;

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(corrupt("Catalog", "data stream descriptor is too small."));
        }
        let mut cursor = Cursor::new(data);
        Ok(DstreamRaw {
            size: cursor.read_u64::<LittleEndian>()?,
            alloced_size: cursor.read_u64::<LittleEndian>()?,
            default_crypto_id: cursor.read_u64::<LittleEndian>()?,
            total_bytes_written: cursor.read_u64::<LittleEndian>()?,
            total_bytes_read: cursor.read_u64::<LittleEndian>()?,
        })
    }
}

/// A raw extended field, split out of the blob that trails an inode or
/// directory-entry value.
pub struct Xfield<'a> {
    pub xtype: u8,
    pub flags: u8,
    pub data: &'a [u8],
}

/// Split an xfield blob: a 4-byte header, an entry table, then the field
/// payloads each padded to 8 bytes.
pub fn parse_xfield_blob(blob: &[u8]) -> Result<Vec<Xfield<'_>>> {
    if blob.is_empty() {
        return Ok(Vec::new());
    }
    if blob.len() < 4 {
        return Err(corrupt("Catalog", "extended-field blob is too small."));
    }
    let num = u16::from_le_bytes([blob[0], blob[1]]) as usize;
    let used = u16::from_le_bytes([blob[2], blob[3]]) as usize;
    if num == 0 {
        return Err(corrupt("Catalog", "extended-field blob is empty."));
    }

    let table_end = 4 + num * 4;
    if table_end > blob.len() {
        return Err(corrupt("Catalog", "extended-field table is out of bounds."));
    }

    let mut fields = Vec::with_capacity(num);
    let mut data_off = table_end;
    for i in 0..num {
        let entry = 4 + i * 4;
        let xtype = blob[entry];
        let flags = blob[entry + 1];
        let size = u16::from_le_bytes([blob[entry + 2], blob[entry + 3]]) as usize;

        if flags & !XF_FLAGS_DEFINED != 0 {
            return Err(corrupt("Catalog", "invalid extended-field flag in use."));
        }
        let end = data_off
            .checked_add(size)
            .ok_or_else(|| corrupt("Catalog", "extended field overflows its blob."))?;
        if end > blob.len() {
            return Err(corrupt("Catalog", "extended field is out of bounds."));
        }
        fields.push(Xfield {
            xtype,
            flags,
            data: &blob[data_off..end],
        });
        data_off = data_off + ((size + 7) & !7);
    }

    // The used-data figure covers the payload area, padding included.
    if used > blob.len() {
        return Err(corrupt("Catalog", "extended-field blob is overfull."));
    }
    Ok(fields)
}

/// Everything an inode's xfields can contribute, parsed before any side
/// table is touched.
#[derive(Default)]
pub struct InodeXfields {
    pub name: Option<Vec<u8>>,
    pub dstream: Option<DstreamRaw>,
    pub sparse_bytes: Option<u64>,
    pub document_id: Option<u32>,
    pub finder_info: bool,
    pub dir_stats_origin: Option<u64>,
    pub rdev: Option<u32>,
    pub prev_fsize: bool,
}

fn xfield_u64(data: &[u8]) -> Result<u64> {
    if data.len() != 8 {
        return Err(corrupt("Catalog", "wrong extended-field size."));
    }
    Ok(u64::from_le_bytes(data.try_into().unwrap()))
}

fn xfield_u32(data: &[u8]) -> Result<u32> {
    if data.len() != 4 {
        return Err(corrupt("Catalog", "wrong extended-field size."));
    }
    Ok(u32::from_le_bytes(data.try_into().unwrap()))
}

/// Walk the xfields of an inode value and validate each against its rules.
pub fn parse_inode_xfields(
    blob: &[u8],
    next_doc_id: u32,
    opts: &ReportOptions,
) -> Result<InodeXfields> {
    let mut out = InodeXfields::default();
    let mut seen_types: u16 = 0;

    for field in parse_xfield_blob(blob)? {
        if field.xtype < 16 {
            let bit = 1u16 << field.xtype;
            if seen_types & bit != 0 {
                return Err(corrupt("Catalog", "extended field described twice."));
            }
            seen_types |= bit;
        }

        match field.xtype {
            INO_EXT_TYPE_SNAP_XID => {
                xfield_u64(field.data)?;
                opts.unknown_feature("Snapshot transaction on an inode")?;
            }
            INO_EXT_TYPE_DELTA_TREE_OID => {
                xfield_u64(field.data)?;
                opts.unknown_feature("Snapshot delta tree")?;
            }
            INO_EXT_TYPE_DOCUMENT_ID => {
                let id = xfield_u32(field.data)?;
                if id < APFS_MIN_DOC_ID || id >= next_doc_id {
                    return Err(corrupt("Catalog", "invalid document id."));
                }
                out.document_id = Some(id);
            }
            INO_EXT_TYPE_NAME => {
                let name = field.data;
                match name.iter().position(|&b| b == 0) {
                    Some(pos) if pos + 1 == name.len() => {
                        out.name = Some(name[..pos].to_vec());
                    }
                    _ => return Err(corrupt("Catalog", "inode name is not terminated.")),
                }
            }
            INO_EXT_TYPE_PREV_FSIZE => {
                xfield_u64(field.data)?;
                // Only set in the middle of a truncation.
                out.prev_fsize = true;
                opts.crash("Catalog", "inode is mid-truncation.")?;
            }
            INO_EXT_TYPE_FINDER_INFO => {
                xfield_u32(field.data)?;
                out.finder_info = true;
            }
            INO_EXT_TYPE_DSTREAM => {
                out.dstream = Some(DstreamRaw::parse(field.data)?);
            }
            INO_EXT_TYPE_DIR_STATS_KEY => {
                out.dir_stats_origin = Some(xfield_u64(field.data)?);
            }
            INO_EXT_TYPE_FS_UUID => {
                if field.data.len() != 16 {
                    return Err(corrupt("Catalog", "wrong extended-field size."));
                }
                opts.unknown_feature("Filesystem uuid on an inode")?;
            }
            INO_EXT_TYPE_SPARSE_BYTES => {
                out.sparse_bytes = Some(xfield_u64(field.data)?);
            }
            INO_EXT_TYPE_RDEV => {
                out.rdev = Some(xfield_u32(field.data)?);
            }
            INO_EXT_TYPE_RESERVED_6 | INO_EXT_TYPE_RESERVED_9 | INO_EXT_TYPE_RESERVED_12 => {
                return Err(corrupt("Catalog", "reserved extended field in use."));
            }
            _ => {
                opts.unknown_feature("Unrecognized inode extended field")?;
            }
        }
    }
    Ok(out)
}

/// A hard link's identity as pieced together from its sibling-link record,
/// its directory entry, and the sibling map.
#[derive(Debug, Clone)]
pub struct SiblingInfo {
    pub id: u64,
    pub name: Option<Vec<u8>>,
    pub parent_id: u64,
    pub seen_link: bool,
    pub seen_dentry: bool,
    pub mapped: bool,
}

/// In-memory state for one inode, keyed by cnid.
#[derive(Default)]
pub struct InodeEntry {
    pub seen: bool,
    pub parent_id: u64,
    pub private_id: u64,
    pub flags: u64,
    pub mode: u16,
    pub dt_mode: Option<u16>,
    pub recorded_count: u32,
    pub link_count: u32,
    pub child_count: u32,
    pub name: Option<Vec<u8>>,
    pub first_link: Option<(u64, Vec<u8>)>,
    pub siblings: Vec<SiblingInfo>,
    pub sparse_bytes: Option<u64>,
    pub dstream_id: Option<u64>,
    pub has_symlink_xattr: bool,
    pub has_rsrc_xattr: bool,
    pub has_finder_info: bool,
    pub has_dir_stats_xfield: bool,
    pub dir_stats_children: Option<u64>,
}

impl InodeEntry {
    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    /// Find or create the sibling slot for `id`, keeping the list ordered
    /// ascending by id.
    pub fn sibling(&mut self, id: u64) -> &mut SiblingInfo {
        match self.siblings.binary_search_by_key(&id, |s| s.id) {
            Ok(pos) => &mut self.siblings[pos],
            Err(pos) => {
                self.siblings.insert(
                    pos,
                    SiblingInfo {
                        id,
                        name: None,
                        parent_id: 0,
                        seen_link: false,
                        seen_dentry: false,
                        mapped: false,
                    },
                );
                &mut self.siblings[pos]
            }
        }
    }
}

/// In-memory state for one data stream, keyed by dstream id.
#[derive(Default)]
pub struct DstreamEntry {
    pub seen: bool,
    pub is_xattr: bool,
    pub owners: u32,
    pub recorded_refcnt: Option<u32>,
    pub size: Option<u64>,
    pub alloced_size: Option<u64>,
    pub bytes: u64,
    pub sparse_bytes: u64,
    pub ranges: Vec<(u64, u64)>,
}

impl DstreamEntry {
    /// Record the expected geometry from an inode xfield or xattr stream;
    /// two owners must agree on it.
    pub fn set_geometry(&mut self, size: u64, alloced_size: u64) -> Result<()> {
        if let (Some(prev_size), Some(prev_alloced)) = (self.size, self.alloced_size) {
            if prev_size != size || prev_alloced != alloced_size {
                return Err(corrupt("Catalog", "owners disagree on a data stream."));
            }
        }
        self.size = Some(size);
        self.alloced_size = Some(alloced_size);
        Ok(())
    }
}

/// Use classes for the catalog-id reuse check.
#[derive(Default)]
pub struct CnidEntry {
    pub inode: bool,
    pub dstream: bool,
    /// The dstream use was claimed by the inode carrying this very cnid;
    /// only then may the inode and dstream uses coexist.
    pub dstream_self_owned: bool,
    pub sibling: bool,
}

/// Per-inode final checks, run over the whole table after the catalog walk.
/// Reads the dstream table but never writes it; dstreams are settled later.
pub fn check_inode_entry(
    cnid: u64,
    entry: &InodeEntry,
    dstreams: &crate::tables::IdTable<DstreamEntry>,
) -> Result<()> {
    const CTX: &str = "Catalog";

    if !entry.seen {
        return Err(corrupt(CTX, "inode is missing its record."));
    }

    let special = cnid == APFS_ROOT_DIR_INO_NUM || cnid == APFS_PRIV_DIR_INO_NUM;
    if entry.is_dir() {
        if entry.recorded_count as u64 != entry.child_count as u64 {
            return Err(corrupt(CTX, "wrong child count on a directory."));
        }
        if special {
            if entry.link_count != 0 {
                return Err(corrupt(CTX, "a system directory has an entry."));
            }
        } else if entry.link_count != 1 {
            return Err(corrupt(CTX, "wrong number of entries for a directory."));
        }
    } else if entry.recorded_count != entry.link_count {
        return Err(corrupt(CTX, "wrong link count."));
    }

    // The primary name. Hard links carry it in the lowest-id sibling, plain
    // inodes in their sole directory entry.
    let name = entry
        .name
        .as_ref()
        .ok_or_else(|| corrupt(CTX, "inode has no name."))?;
    if cnid == APFS_ROOT_DIR_INO_NUM && name != b"root" {
        return Err(corrupt(CTX, "wrong name for the root directory."));
    }
    if cnid == APFS_PRIV_DIR_INO_NUM && name != b"private-dir" {
        return Err(corrupt(CTX, "wrong name for the private directory."));
    }

    if entry.siblings.is_empty() {
        if let Some((_, link_name)) = entry.first_link.as_ref() {
            if link_name != name {
                return Err(corrupt(CTX, "inode name does not match its entry."));
            }
        }
    } else {
        for sibling in &entry.siblings {
            if !sibling.seen_link || !sibling.seen_dentry || !sibling.mapped {
                return Err(corrupt(CTX, "incomplete sibling link."));
            }
        }
        let first = &entry.siblings[0];
        match first.name.as_ref() {
            Some(sib_name) if sib_name == name => {}
            _ => return Err(corrupt(CTX, "inode name does not match its first link.")),
        }
        if entry.is_dir() {
            return Err(corrupt(CTX, "directory has hard links."));
        }
    }

    if entry.mode & S_IFMT == S_IFLNK && !entry.has_symlink_xattr {
        return Err(corrupt(CTX, "symlink has no target attribute."));
    }
    if (entry.flags & INODE_HAS_RSRC_FORK != 0) != entry.has_rsrc_xattr {
        return Err(corrupt(CTX, "resource fork flag does not match the attribute."));
    }
    if entry.flags & INODE_HAS_RSRC_FORK != 0 && entry.flags & INODE_NO_RSRC_FORK != 0 {
        return Err(corrupt(CTX, "contradictory resource fork flags."));
    }

    if entry.flags & INODE_MAINTAIN_DIR_STATS != 0 {
        if !entry.is_dir() {
            return Err(corrupt(CTX, "directory statistics on a file."));
        }
        match entry.dir_stats_children {
            Some(children) => {
                if children != entry.child_count as u64 {
                    return Err(corrupt(CTX, "wrong child count in directory statistics."));
                }
            }
            None => return Err(corrupt(CTX, "directory statistics are missing.")),
        }
    } else if entry.dir_stats_children.is_some() || entry.has_dir_stats_xfield {
        return Err(corrupt(CTX, "directory statistics without the flag."));
    }

    // Sparse accounting: the xfield must agree with what the extents said.
    if let Some(dstream_id) = entry.dstream_id {
        let dstream = dstreams
            .get(dstream_id)
            .ok_or_else(|| corrupt(CTX, "inode lost its data stream."))?;
        let expected = entry.sparse_bytes.unwrap_or(0);
        if dstream.sparse_bytes != expected {
            return Err(corrupt(CTX, "wrong sparse byte count."));
        }
    } else if entry.sparse_bytes.unwrap_or(0) != 0 {
        return Err(corrupt(CTX, "sparse bytes without a data stream."));
    }

    Ok(())
}

/// Per-dstream final checks, except extent-reference reconciliation, which
/// needs the extent-ref tree and runs in the extents module.
pub fn check_dstream_entry(entry: &DstreamEntry) -> Result<()> {
    const CTX: &str = "Catalog";

    if entry.is_xattr {
        if entry.seen {
            return Err(corrupt(CTX, "dstream-id record for an attribute stream."));
        }
    } else if !entry.seen {
        return Err(corrupt(CTX, "data stream is missing its id record."));
    }

    if let Some(recorded) = entry.recorded_refcnt {
        if recorded != entry.owners {
            return Err(corrupt(CTX, "wrong reference count on a data stream."));
        }
    }

    let size = entry.size.unwrap_or(0);
    let alloced = entry.alloced_size.unwrap_or(0);
    if entry.bytes < size {
        return Err(corrupt(CTX, "data stream is shorter than its size."));
    }
    if entry.bytes != alloced {
        return Err(corrupt(CTX, "wrong allocated size on a data stream."));
    }
    Ok(())
}
