use byteorder::{LittleEndian, ReadBytesExt};
use std::cmp::Ordering;
use std::io::{Cursor, Read, Seek};

use crate::catalog;
use crate::device::BlockSpace;
use crate::error::{corrupt, ReportOptions, Result};
use crate::object::{
    self, ObjectHeader, ObjectRules, OBJECT_TYPE_BLOCKREFTREE, OBJECT_TYPE_BTREE,
    OBJECT_TYPE_BTREE_NODE, OBJECT_TYPE_FEXT_TREE, OBJECT_TYPE_FSTREE, OBJECT_TYPE_OMAP,
    OBJECT_TYPE_SNAPMETATREE,
};
use crate::omap::Omap;

// Node flags (btn_flags).
pub const BTNODE_ROOT: u16 = 0x0001;
pub const BTNODE_LEAF: u16 = 0x0002;
pub const BTNODE_FIXED_KV_SIZE: u16 = 0x0004;
const BTNODE_FLAGS_DEFINED: u16 = 0x0007;

// Info footer flags (bt_flags).
pub const BTREE_UINT64_KEYS: u32 = 0x0001;
pub const BTREE_SEQUENTIAL_INSERT: u32 = 0x0002;
pub const BTREE_ALLOW_GHOSTS: u32 = 0x0004;
pub const BTREE_EPHEMERAL: u32 = 0x0008;
pub const BTREE_PHYSICAL: u32 = 0x0010;
pub const BTREE_NONPERSISTENT: u32 = 0x0020;
pub const BTREE_KV_NONALIGNED: u32 = 0x0040;
pub const BTREE_HASHED: u32 = 0x0080;
pub const BTREE_NOHEADER: u32 = 0x0100;
const BTREE_FLAGS_DEFINED: u32 = 0x01FF;

/// Deepest tree the format commits to; a longer descent chain is corruption.
pub const BTREE_MAX_DEPTH: usize = 12;

const NODE_HDR_SIZE: usize = 24;
const INFO_SIZE: usize = 40;
const HDR_END: usize = ObjectHeader::SIZE + NODE_HDR_SIZE;

/// Record-locator capability: the only difference between the two node
/// shapes is how table-of-contents entries address keys and values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordLocator {
    FixedKv { key_size: u16, leaf_val_size: u16 },
    VariableKv,
}

impl RecordLocator {
    fn toc_entry_size(self) -> usize {
        match self {
            RecordLocator::FixedKv { .. } => 4,
            RecordLocator::VariableKv => 8,
        }
    }
}

/// The purpose a tree serves; selects key ordering, record locator, object
/// subtype and how child nodes resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeKind {
    Omap,
    Catalog { case_fold: bool, hashed: bool },
    ExtentRef,
    SnapMeta,
    Fext,
}

impl TreeKind {
    pub fn locator(self) -> RecordLocator {
        match self {
            TreeKind::Omap | TreeKind::Fext => RecordLocator::FixedKv {
                key_size: 16,
                leaf_val_size: 16,
            },
            _ => RecordLocator::VariableKv,
        }
    }

    pub fn subtype(self) -> u16 {
        match self {
            TreeKind::Omap => OBJECT_TYPE_OMAP,
            TreeKind::Catalog { .. } => OBJECT_TYPE_FSTREE,
            TreeKind::ExtentRef => OBJECT_TYPE_BLOCKREFTREE,
            TreeKind::SnapMeta => OBJECT_TYPE_SNAPMETATREE,
            TreeKind::Fext => OBJECT_TYPE_FEXT_TREE,
        }
    }

    /// Catalog nodes live at virtual oids; every other tree stores child
    /// pointers as physical block numbers.
    fn virtual_children(self) -> bool {
        matches!(self, TreeKind::Catalog { .. })
    }

    /// Ordering of two raw keys under this tree's comparator.
    pub fn keycmp(self, a: &[u8], b: &[u8]) -> Result<Ordering> {
        match self {
            TreeKind::Omap => {
                let (a_oid, a_xid) = parse_omap_key(a)?;
                let (b_oid, b_xid) = parse_omap_key(b)?;
                Ok((a_oid, a_xid).cmp(&(b_oid, b_xid)))
            }
            TreeKind::Fext => {
                let a = parse_fext_key(a)?;
                let b = parse_fext_key(b)?;
                Ok(a.cmp(&b))
            }
            TreeKind::Catalog { case_fold, hashed } => {
                catalog::cat_keycmp(a, b, case_fold, hashed)
            }
            TreeKind::ExtentRef | TreeKind::SnapMeta => catalog::cat_keycmp(a, b, false, false),
        }
    }
}

/// Decode a fixed 16-byte omap key.
pub fn parse_omap_key(raw: &[u8]) -> Result<(u64, u64)> {
    if raw.len() < 16 {
        return Err(corrupt("B-tree", "object map key is too small."));
    }
    let mut cursor = Cursor::new(raw);
    let oid = cursor.read_u64::<LittleEndian>()?;
    let xid = cursor.read_u64::<LittleEndian>()?;
    Ok((oid, xid))
}

/// Decode a fixed 16-byte fext-tree key: (private id, logical address).
pub fn parse_fext_key(raw: &[u8]) -> Result<(u64, u64)> {
    if raw.len() < 16 {
        return Err(corrupt("B-tree", "fext key is too small."));
    }
    let mut cursor = Cursor::new(raw);
    let id = cursor.read_u64::<LittleEndian>()?;
    let addr = cursor.read_u64::<LittleEndian>()?;
    Ok((id, addr))
}

/// Search target for point queries and multi-record scans. Comparisons
/// return the ordering of an on-disk record key relative to the target.
#[derive(Debug, Clone)]
pub enum SearchKey {
    /// Exact omap ordering: (oid, xid).
    Omap { oid: u64, xid: u64 },
    /// Match on oid alone; any xid compares equal.
    OmapOid { oid: u64 },
    /// Physical-extent record containing (or preceding) a block number.
    Extent { bno: u64 },
    /// Fext-tree ordering: (private id, logical address).
    Fext { id: u64, addr: u64 },
}

impl SearchKey {
    fn cmp_full(&self, raw: &[u8]) -> Result<Ordering> {
        match *self {
            SearchKey::Omap { oid, xid } => {
                let (r_oid, r_xid) = parse_omap_key(raw)?;
                Ok((r_oid, r_xid).cmp(&(oid, xid)))
            }
            SearchKey::OmapOid { oid } => {
                let (r_oid, _) = parse_omap_key(raw)?;
                Ok(r_oid.cmp(&oid))
            }
            SearchKey::Extent { bno } => {
                let key = catalog::parse_cat_key(raw)?;
                Ok((key.cnid, key.kind).cmp(&(bno, catalog::RECORD_TYPE_EXTENT)))
            }
            SearchKey::Fext { id, addr } => {
                let rec = parse_fext_key(raw)?;
                Ok(rec.cmp(&(id, addr)))
            }
        }
    }

    /// Compare only the primary portion of the key, for deciding when a
    /// multi-record scan has run off the matching run.
    fn cmp_primary(&self, raw: &[u8]) -> Result<Ordering> {
        match *self {
            SearchKey::Omap { oid, .. } | SearchKey::OmapOid { oid } => {
                let (r_oid, _) = parse_omap_key(raw)?;
                Ok(r_oid.cmp(&oid))
            }
            SearchKey::Extent { bno } => {
                let key = catalog::parse_cat_key(raw)?;
                Ok(key.cnid.cmp(&bno))
            }
            SearchKey::Fext { id, .. } => {
                let (r_id, _) = parse_fext_key(raw)?;
                Ok(r_id.cmp(&id))
            }
        }
    }
}

/// Info footer held in the last bytes of a root node.
#[derive(Debug, Clone)]
pub struct BtreeInfo {
    pub flags: u32,
    pub node_size: u32,
    pub key_size: u32,
    pub val_size: u32,
    pub longest_key: u32,
    pub longest_val: u32,
    pub key_count: u64,
    pub node_count: u64,
}

impl BtreeInfo {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < INFO_SIZE {
            return Err(corrupt("B-tree", "info footer is truncated."));
        }
        let mut cursor = Cursor::new(data);
        Ok(BtreeInfo {
            flags: cursor.read_u32::<LittleEndian>()?,
            node_size: cursor.read_u32::<LittleEndian>()?,
            key_size: cursor.read_u32::<LittleEndian>()?,
            val_size: cursor.read_u32::<LittleEndian>()?,
            longest_key: cursor.read_u32::<LittleEndian>()?,
            longest_val: cursor.read_u32::<LittleEndian>()?,
            key_count: cursor.read_u64::<LittleEndian>()?,
            node_count: cursor.read_u64::<LittleEndian>()?,
        })
    }
}

/// A parsed node. The whole block is retained; keys and values are sliced
/// out of it on demand after bounds checks.
#[derive(Clone)]
pub struct BtreeNode {
    pub object: ObjectHeader,
    raw: Vec<u8>,
    locator: RecordLocator,
    pub flags: u16,
    pub level: u16,
    pub records: u32,
    toc_start: usize,
    key_start: usize,
    data_end: usize,
    pub info: Option<BtreeInfo>,
}

impl BtreeNode {
    pub fn parse(
        raw: Vec<u8>,
        object: ObjectHeader,
        locator: RecordLocator,
    ) -> Result<Self> {
        let block_size = raw.len();
        if block_size < HDR_END + INFO_SIZE {
            return Err(corrupt("B-tree", "block is too small for a node."));
        }

        let mut cursor = Cursor::new(&raw[ObjectHeader::SIZE..]);
        let flags = cursor.read_u16::<LittleEndian>()?;
        let level = cursor.read_u16::<LittleEndian>()?;
        let records = cursor.read_u32::<LittleEndian>()?;
        let table_off = cursor.read_u16::<LittleEndian>()? as usize;
        let table_len = cursor.read_u16::<LittleEndian>()? as usize;
        let free_off = cursor.read_u16::<LittleEndian>()? as usize;
        let free_len = cursor.read_u16::<LittleEndian>()? as usize;

        if flags & !BTNODE_FLAGS_DEFINED != 0 {
            return Err(corrupt("B-tree", "invalid node flag in use."));
        }
        let is_root = flags & BTNODE_ROOT != 0;
        let is_leaf = flags & BTNODE_LEAF != 0;
        if is_leaf != (level == 0) {
            return Err(corrupt("B-tree", "leaf flag does not match the level."));
        }
        let fixed = flags & BTNODE_FIXED_KV_SIZE != 0;
        if fixed != matches!(locator, RecordLocator::FixedKv { .. }) {
            return Err(corrupt("B-tree", "wrong record shape for this tree."));
        }

        let toc_start = HDR_END + table_off;
        let toc_end = toc_start
            .checked_add(table_len)
            .ok_or_else(|| corrupt("B-tree", "table of contents overflows the node."))?;
        let key_start = toc_end;
        if key_start > block_size {
            return Err(corrupt("B-tree", "key area is out of bounds."));
        }

        let data_end = if is_root {
            block_size - INFO_SIZE
        } else {
            block_size
        };

        // An empty node is tolerated only as the root of an empty tree;
        // anywhere else it would stall a scan.
        if records == 0 && !is_root {
            return Err(corrupt("B-tree", "node has no records."));
        }
        if records as usize * locator.toc_entry_size() > table_len {
            return Err(corrupt("B-tree", "too many records for the table of contents."));
        }

        // The free space must sit between the key and value areas.
        let free_end = key_start
            .checked_add(free_off)
            .and_then(|v| v.checked_add(free_len))
            .ok_or_else(|| corrupt("B-tree", "free space overflows the node."))?;
        if free_end > data_end {
            return Err(corrupt("B-tree", "free space is out of bounds."));
        }

        let info = if is_root {
            Some(BtreeInfo::parse(&raw[block_size - INFO_SIZE..])?)
        } else {
            None
        };

        Ok(BtreeNode {
            object,
            raw,
            locator,
            flags,
            level,
            records,
            toc_start,
            key_start,
            data_end,
            info,
        })
    }

    pub fn is_leaf(&self) -> bool {
        self.flags & BTNODE_LEAF != 0
    }

    pub fn is_root(&self) -> bool {
        self.flags & BTNODE_ROOT != 0
    }

    fn toc_u16(&self, offset: usize) -> Result<u16> {
        let end = offset + 2;
        if end > self.raw.len() {
            return Err(corrupt("B-tree", "table of contents entry is out of bounds."));
        }
        Ok(u16::from_le_bytes([self.raw[offset], self.raw[offset + 1]]))
    }

    /// Locate record `index`'s key as (offset, length) within the block.
    pub fn locate_key(&self, index: usize) -> Result<(usize, usize)> {
        if index >= self.records as usize {
            return Err(corrupt("B-tree", "record index is out of bounds."));
        }
        let entry = self.toc_start + index * self.locator.toc_entry_size();
        let (off, len) = match self.locator {
            RecordLocator::FixedKv { key_size, .. } => {
                (self.toc_u16(entry)? as usize, key_size as usize)
            }
            RecordLocator::VariableKv => (
                self.toc_u16(entry)? as usize,
                self.toc_u16(entry + 2)? as usize,
            ),
        };
        let start = self.key_start + off;
        let end = start
            .checked_add(len)
            .ok_or_else(|| corrupt("B-tree", "key offset overflows the node."))?;
        if len == 0 || end > self.raw.len() {
            return Err(corrupt("B-tree", "key is out of bounds."));
        }
        Ok((start, len))
    }

    /// Locate record `index`'s value. Values are measured back from the end
    /// of the block, or from just before the info footer on a root node.
    /// Non-leaf values always hold an 8-byte child oid.
    pub fn locate_value(&self, index: usize) -> Result<(usize, usize)> {
        if index >= self.records as usize {
            return Err(corrupt("B-tree", "record index is out of bounds."));
        }
        let entry = self.toc_start + index * self.locator.toc_entry_size();
        let (off, len) = match self.locator {
            RecordLocator::FixedKv { leaf_val_size, .. } => {
                let len = if self.is_leaf() {
                    leaf_val_size as usize
                } else {
                    8
                };
                (self.toc_u16(entry + 2)? as usize, len)
            }
            RecordLocator::VariableKv => {
                let len = if self.is_leaf() {
                    self.toc_u16(entry + 6)? as usize
                } else {
                    8
                };
                (self.toc_u16(entry + 4)? as usize, len)
            }
        };
        let start = self
            .data_end
            .checked_sub(off)
            .ok_or_else(|| corrupt("B-tree", "value is out of bounds."))?;
        let end = start
            .checked_add(len)
            .ok_or_else(|| corrupt("B-tree", "value offset overflows the node."))?;
        if end > self.data_end {
            return Err(corrupt("B-tree", "value is out of bounds."));
        }
        Ok((start, len))
    }

    pub fn key_bytes(&self, index: usize) -> Result<&[u8]> {
        let (off, len) = self.locate_key(index)?;
        Ok(&self.raw[off..off + len])
    }

    pub fn value_bytes(&self, index: usize) -> Result<&[u8]> {
        let (off, len) = self.locate_value(index)?;
        if len == 0 {
            return Err(corrupt("B-tree", "record value is empty."));
        }
        Ok(&self.raw[off..off + len])
    }

    /// The child oid stored in a non-leaf record's value.
    pub fn child_oid(&self, index: usize) -> Result<u64> {
        let val = self.value_bytes(index)?;
        if val.len() < 8 {
            return Err(corrupt("B-tree", "child pointer is too small."));
        }
        Ok(u64::from_le_bytes([
            val[0], val[1], val[2], val[3], val[4], val[5], val[6], val[7],
        ]))
    }
}

/// Statistics measured over a full walk, reconciled against the footer.
#[derive(Debug, Default, Clone)]
pub struct WalkStats {
    pub key_count: u64,
    pub node_count: u64,
    pub longest_key: u32,
    pub longest_val: u32,
}

/// An open tree: its purpose plus the pinned root node.
pub struct Btree {
    pub kind: TreeKind,
    root: BtreeNode,
}

struct Frame {
    node: BtreeNode,
    index: usize,
}

/// A paused multi-record scan: a chain of ancestor frames from the root to
/// the current leaf, resumed record by record.
pub struct MultiScan {
    frames: Vec<Frame>,
    finished: bool,
}

impl Btree {
    /// Open a tree whose root lives at a physical oid.
    pub fn open_physical<R: Read + Seek>(
        space: &mut BlockSpace<R>,
        oid: u64,
        kind: TreeKind,
        rules: &ObjectRules,
    ) -> Result<Btree> {
        let (block, header) =
            object::read_object(space, oid, None, OBJECT_TYPE_BTREE, kind.subtype(), rules)?;
        Self::with_root(block, header, kind)
    }

    /// Open a tree whose root lives at a virtual oid behind `omap`.
    pub fn open_virtual<R: Read + Seek>(
        space: &mut BlockSpace<R>,
        oid: u64,
        omap: &mut Omap,
        kind: TreeKind,
        rules: &ObjectRules,
    ) -> Result<Btree> {
        let (block, header) = object::read_object(
            space,
            oid,
            Some(omap),
            OBJECT_TYPE_BTREE,
            kind.subtype(),
            rules,
        )?;
        Self::with_root(block, header, kind)
    }

    fn with_root(block: Vec<u8>, header: ObjectHeader, kind: TreeKind) -> Result<Btree> {
        let root = BtreeNode::parse(block, header, kind.locator())?;
        if !root.is_root() {
            return Err(corrupt("B-tree", "wrong flag on the root node."));
        }
        if root.level as usize >= BTREE_MAX_DEPTH {
            return Err(corrupt("B-tree", "tree is too deep."));
        }
        Ok(Btree { kind, root })
    }

    pub fn root(&self) -> &BtreeNode {
        &self.root
    }

    fn load_child<R: Read + Seek>(
        &self,
        space: &mut BlockSpace<R>,
        omap: Option<&mut Omap>,
        child_oid: u64,
        parent_level: u16,
        rules: &ObjectRules,
    ) -> Result<BtreeNode> {
        let omap = if self.kind.virtual_children() {
            match omap {
                Some(omap) => Some(omap),
                None => return Err(corrupt("B-tree", "no object map for a virtual tree.")),
            }
        } else {
            None
        };

        let (block, header) = object::read_object(
            space,
            child_oid,
            omap,
            OBJECT_TYPE_BTREE_NODE,
            self.kind.subtype(),
            rules,
        )?;
        let node = BtreeNode::parse(block, header, self.kind.locator())?;
        if node.is_root() {
            return Err(corrupt("B-tree", "root flag on a child node."));
        }
        if parent_level == 0 || node.level != parent_level - 1 {
            return Err(corrupt("B-tree", "node level does not match its parent."));
        }
        Ok(node)
    }

    /// Greatest record index whose key orders at or before the target, or
    /// None when every key in the node is greater.
    fn node_last_le(&self, node: &BtreeNode, key: &SearchKey) -> Result<Option<usize>> {
        let mut lo = 0usize;
        let mut hi = node.records as usize;
        let mut found = None;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let raw = node.key_bytes(mid)?;
            match key.cmp_full(raw)? {
                Ordering::Greater => hi = mid,
                _ => {
                    found = Some(mid);
                    lo = mid + 1;
                }
            }
        }
        Ok(found)
    }

    /// Point query. With `exact` the leaf key must compare equal; without
    /// it the greatest record at or before the target is returned. `None`
    /// means no record qualifies; callers decide whether that is fatal.
    pub fn lookup<R: Read + Seek>(
        &self,
        space: &mut BlockSpace<R>,
        mut omap: Option<&mut Omap>,
        rules: &ObjectRules,
        key: &SearchKey,
        exact: bool,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let mut node = self.root.clone();
        let mut depth = 0usize;
        loop {
            depth += 1;
            if depth > BTREE_MAX_DEPTH {
                return Err(corrupt("B-tree", "tree is too deep."));
            }

            let index = match self.node_last_le(&node, key)? {
                Some(index) => index,
                None => return Ok(None),
            };

            if node.is_leaf() {
                let raw_key = node.key_bytes(index)?;
                if exact && key.cmp_full(raw_key)? != Ordering::Equal {
                    return Ok(None);
                }
                let key_copy = raw_key.to_vec();
                let val_copy = node.value_bytes(index)?.to_vec();
                return Ok(Some((key_copy, val_copy)));
            }

            let child_oid = node.child_oid(index)?;
            node = self.load_child(space, omap.as_deref_mut(), child_oid, node.level, rules)?;
        }
    }

    /// Start a multi-record scan at the last record matching the target's
    /// primary key. Records come back in descending key order via
    /// `MultiScan::next_record`.
    pub fn scan<R: Read + Seek>(
        &self,
        space: &mut BlockSpace<R>,
        mut omap: Option<&mut Omap>,
        rules: &ObjectRules,
        key: &SearchKey,
    ) -> Result<MultiScan> {
        let mut frames = Vec::new();
        let mut node = self.root.clone();
        loop {
            if frames.len() >= BTREE_MAX_DEPTH {
                return Err(corrupt("B-tree", "tree is too deep."));
            }

            let index = match self.node_last_le(&node, key)? {
                Some(index) => index,
                None => {
                    return Ok(MultiScan {
                        frames: Vec::new(),
                        finished: true,
                    })
                }
            };

            if node.is_leaf() {
                frames.push(Frame { node, index });
                return Ok(MultiScan {
                    frames,
                    finished: false,
                });
            }

            let child_oid = node.child_oid(index)?;
            let child =
                self.load_child(space, omap.as_deref_mut(), child_oid, node.level, rules)?;
            frames.push(Frame { node, index });
            node = child;
        }
    }

    /// Depth-first walk of the whole tree: every key is bounds- and
    /// order-checked, every leaf record is handed to `visit`, and the
    /// measured statistics are reconciled against the root footer.
    pub fn walk<R, F>(
        &self,
        space: &mut BlockSpace<R>,
        mut omap: Option<&mut Omap>,
        rules: &ObjectRules,
        visit: &mut F,
    ) -> Result<WalkStats>
    where
        R: Read + Seek,
        F: FnMut(&[u8], &[u8]) -> Result<()>,
    {
        let mut stats = WalkStats::default();
        let mut last_key: Option<(Vec<u8>, bool)> = None;
        self.walk_node(
            &self.root,
            space,
            &mut omap,
            rules,
            &mut last_key,
            &mut stats,
            visit,
        )?;
        self.check_footer(&stats, space.block_size(), rules.opts)?;
        Ok(stats)
    }

    #[allow(clippy::too_many_arguments)]
    fn walk_node<R, F>(
        &self,
        node: &BtreeNode,
        space: &mut BlockSpace<R>,
        omap: &mut Option<&mut Omap>,
        rules: &ObjectRules,
        last_key: &mut Option<(Vec<u8>, bool)>,
        stats: &mut WalkStats,
        visit: &mut F,
    ) -> Result<()>
    where
        R: Read + Seek,
        F: FnMut(&[u8], &[u8]) -> Result<()>,
    {
        stats.node_count += 1;
        let is_leaf = node.is_leaf();

        for index in 0..node.records as usize {
            let (key_off, key_len) = node.locate_key(index)?;
            let key = &node.raw[key_off..key_off + key_len];

            if let Some((prev, prev_leaf)) = last_key.as_ref() {
                match self.kind.keycmp(prev, key)? {
                    Ordering::Less => {}
                    Ordering::Equal => {
                        if is_leaf && *prev_leaf {
                            return Err(corrupt("B-tree", "leaf keys are repeated."));
                        }
                    }
                    Ordering::Greater => {
                        return Err(corrupt("B-tree", "keys are out of order."));
                    }
                }
            }
            *last_key = Some((key.to_vec(), is_leaf));
            stats.longest_key = stats.longest_key.max(key_len as u32);

            if is_leaf {
                let (val_off, val_len) = node.locate_value(index)?;
                if val_len == 0 {
                    return Err(corrupt("B-tree", "record value is empty."));
                }
                stats.key_count += 1;
                stats.longest_val = stats.longest_val.max(val_len as u32);

                let key = node.raw[key_off..key_off + key_len].to_vec();
                let val = node.raw[val_off..val_off + val_len].to_vec();
                visit(&key, &val)?;
            } else {
                let child_oid = node.child_oid(index)?;
                let child =
                    self.load_child(space, omap.as_deref_mut(), child_oid, node.level, rules)?;
                self.walk_node(&child, space, omap, rules, last_key, stats, visit)?;
            }
        }
        Ok(())
    }

    /// Reconcile the root footer with a measured walk.
    fn check_footer(
        &self,
        stats: &WalkStats,
        block_size: u32,
        opts: &ReportOptions,
    ) -> Result<()> {
        let info = self
            .root
            .info
            .as_ref()
            .ok_or_else(|| corrupt("B-tree", "root node lacks the info footer."))?;

        if info.flags & !BTREE_FLAGS_DEFINED != 0 {
            return Err(corrupt("B-tree", "invalid info flag in use."));
        }
        if info.flags & (BTREE_ALLOW_GHOSTS | BTREE_NOHEADER | BTREE_HASHED) != 0 {
            opts.unknown_feature("B-tree variant")?;
        }
        if info.flags & (BTREE_EPHEMERAL | BTREE_NONPERSISTENT) != 0 {
            return Err(corrupt("B-tree", "invalid storage flag in the info footer."));
        }
        let physical = info.flags & BTREE_PHYSICAL != 0;
        if physical == self.kind.virtual_children() {
            return Err(corrupt("B-tree", "wrong storage flag in the info footer."));
        }

        if info.node_size > block_size {
            opts.unknown_feature("B-tree node size larger than the block size")?;
        } else if info.node_size != block_size {
            return Err(corrupt("B-tree", "wrong node size."));
        }

        if info.key_count != stats.key_count {
            return Err(corrupt("B-tree", "wrong key count in the info footer."));
        }
        if info.node_count != stats.node_count {
            return Err(corrupt("B-tree", "wrong node count in the info footer."));
        }
        // The stored lengths are high-water marks and may exceed the
        // current maxima, never the reverse.
        if info.longest_key < stats.longest_key {
            return Err(corrupt("B-tree", "longest key is too short in the info footer."));
        }
        if info.longest_val < stats.longest_val {
            return Err(corrupt("B-tree", "longest value is too short in the info footer."));
        }

        match self.kind.locator() {
            RecordLocator::FixedKv {
                key_size,
                leaf_val_size,
            } => {
                if info.key_size != key_size as u32 || info.val_size != leaf_val_size as u32 {
                    return Err(corrupt("B-tree", "wrong fixed record size in the info footer."));
                }
            }
            RecordLocator::VariableKv => {
                if info.key_size != 0 || info.val_size != 0 {
                    return Err(corrupt(
                        "B-tree",
                        "fixed record size on a variable-size tree.",
                    ));
                }
            }
        }
        Ok(())
    }
}

impl MultiScan {
    /// Yield the next record whose primary key matches, in descending key
    /// order, or None once the run is exhausted.
    pub fn next_record<R: Read + Seek>(
        &mut self,
        tree: &Btree,
        space: &mut BlockSpace<R>,
        mut omap: Option<&mut Omap>,
        rules: &ObjectRules,
        key: &SearchKey,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if self.finished {
            return Ok(None);
        }

        let leaf = self
            .frames
            .last()
            .ok_or_else(|| corrupt("B-tree", "scan lost its leaf node."))?;
        let raw_key = leaf.node.key_bytes(leaf.index)?;
        if key.cmp_primary(raw_key)? != Ordering::Equal {
            self.finished = true;
            return Ok(None);
        }
        let record = (raw_key.to_vec(), leaf.node.value_bytes(leaf.index)?.to_vec());

        self.retreat(tree, space, omap.as_deref_mut(), rules)?;
        Ok(Some(record))
    }

    /// Step to the previous record, popping to an ancestor and descending
    /// its preceding subtree when the current node is exhausted.
    fn retreat<R: Read + Seek>(
        &mut self,
        tree: &Btree,
        space: &mut BlockSpace<R>,
        mut omap: Option<&mut Omap>,
        rules: &ObjectRules,
    ) -> Result<()> {
        loop {
            match self.frames.last_mut() {
                None => {
                    self.finished = true;
                    return Ok(());
                }
                Some(frame) if frame.index > 0 => {
                    frame.index -= 1;
                    break;
                }
                Some(_) => {
                    self.frames.pop();
                }
            }
        }

        // Descend to the rightmost leaf of the new position.
        loop {
            let frame = self.frames.last().unwrap();
            if frame.node.is_leaf() {
                return Ok(());
            }
            if self.frames.len() >= BTREE_MAX_DEPTH {
                return Err(corrupt("B-tree", "tree is too deep."));
            }
            let child_oid = frame.node.child_oid(frame.index)?;
            let child = tree.load_child(
                space,
                omap.as_deref_mut(),
                child_oid,
                frame.node.level,
                rules,
            )?;
            if child.records == 0 {
                return Err(corrupt("B-tree", "node has no records."));
            }
            let index = child.records as usize - 1;
            self.frames.push(Frame { node: child, index });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ApfsckError;
    use crate::fletcher;
    use crate::object::{OBJ_PHYSICAL, OBJECT_TYPE_OMAP};

    const BS: usize = 4096;

    /// Assemble a root+leaf omap node at a given oid/xid with fixed 16/16
    /// records, stamping a valid checksum.
    fn build_omap_root(oid: u64, xid: u64, records: &[(u64, u64, u64)]) -> Vec<u8> {
        let mut block = vec![0u8; BS];
        block[8..16].copy_from_slice(&oid.to_le_bytes());
        block[16..24].copy_from_slice(&xid.to_le_bytes());
        let type_word = OBJ_PHYSICAL | OBJECT_TYPE_BTREE as u32;
        block[24..28].copy_from_slice(&type_word.to_le_bytes());
        block[28..32].copy_from_slice(&(OBJECT_TYPE_OMAP as u32).to_le_bytes());

        let n = records.len();
        let flags = BTNODE_ROOT | BTNODE_LEAF | BTNODE_FIXED_KV_SIZE;
        let toc_len = (n * 4).max(16) as u16;
        block[32..34].copy_from_slice(&flags.to_le_bytes());
        block[34..36].copy_from_slice(&0u16.to_le_bytes()); // level
        block[36..40].copy_from_slice(&(n as u32).to_le_bytes());
        block[40..42].copy_from_slice(&0u16.to_le_bytes()); // table off
        block[42..44].copy_from_slice(&toc_len.to_le_bytes());
        let key_area = 56 + toc_len as usize;
        let data_end = BS - INFO_SIZE;
        let free_off = (n * 16) as u16;
        let free_len = (data_end - n * 16 - (key_area + n * 16)) as u16;
        block[44..46].copy_from_slice(&free_off.to_le_bytes());
        block[46..48].copy_from_slice(&free_len.to_le_bytes());

        for (i, &(rec_oid, rec_xid, paddr)) in records.iter().enumerate() {
            let toc = 56 + i * 4;
            let koff = (i * 16) as u16;
            let voff = ((i + 1) * 16) as u16;
            block[toc..toc + 2].copy_from_slice(&koff.to_le_bytes());
            block[toc + 2..toc + 4].copy_from_slice(&voff.to_le_bytes());

            let key_at = key_area + i * 16;
            block[key_at..key_at + 8].copy_from_slice(&rec_oid.to_le_bytes());
            block[key_at + 8..key_at + 16].copy_from_slice(&rec_xid.to_le_bytes());

            let val_at = data_end - (i + 1) * 16;
            block[val_at..val_at + 4].copy_from_slice(&0u32.to_le_bytes()); // flags
            block[val_at + 4..val_at + 8].copy_from_slice(&(BS as u32).to_le_bytes());
            block[val_at + 8..val_at + 16].copy_from_slice(&paddr.to_le_bytes());
        }

        // Footer.
        let f = BS - INFO_SIZE;
        block[f..f + 4].copy_from_slice(&BTREE_PHYSICAL.to_le_bytes());
        block[f + 4..f + 8].copy_from_slice(&(BS as u32).to_le_bytes());
        block[f + 8..f + 12].copy_from_slice(&16u32.to_le_bytes());
        block[f + 12..f + 16].copy_from_slice(&16u32.to_le_bytes());
        block[f + 16..f + 20].copy_from_slice(&16u32.to_le_bytes());
        block[f + 20..f + 24].copy_from_slice(&16u32.to_le_bytes());
        block[f + 24..f + 32].copy_from_slice(&(n as u64).to_le_bytes());
        block[f + 32..f + 40].copy_from_slice(&1u64.to_le_bytes());

        let cksum = fletcher::fletcher64(&block[8..]);
        block[0..8].copy_from_slice(&cksum.to_le_bytes());
        block
    }

    fn open_tree(image: Vec<u8>, root_bno: u64) -> (BlockSpace<std::io::Cursor<Vec<u8>>>, Btree) {
        let mut space = BlockSpace::new(std::io::Cursor::new(image)).unwrap();
        let opts = ReportOptions::default();
        let rules = ObjectRules::container(&opts, 100);
        let tree = Btree::open_physical(&mut space, root_bno, TreeKind::Omap, &rules).unwrap();
        (space, tree)
    }

    fn image_with_root(root: Vec<u8>, root_bno: u64) -> Vec<u8> {
        let mut image = vec![0u8; BS * (root_bno as usize + 1)];
        image[root_bno as usize * BS..(root_bno as usize + 1) * BS].copy_from_slice(&root);
        image
    }

    #[test]
    fn test_point_lookup() {
        let root = build_omap_root(3, 5, &[(0x500, 4, 77), (0x500, 9, 88), (0x600, 4, 99)]);
        let image = image_with_root(root, 3);
        let (mut space, tree) = open_tree(image, 3);
        let opts = ReportOptions::default();
        let rules = ObjectRules::container(&opts, 100);

        // Greatest xid at or below the target for the shared oid.
        let key = SearchKey::Omap { oid: 0x500, xid: 6 };
        let (k, v) = tree
            .lookup(&mut space, None, &rules, &key, false)
            .unwrap()
            .unwrap();
        assert_eq!(parse_omap_key(&k).unwrap(), (0x500, 4));
        assert_eq!(u64::from_le_bytes(v[8..16].try_into().unwrap()), 77);

        let key = SearchKey::Omap { oid: 0x500, xid: 20 };
        let (k, _) = tree
            .lookup(&mut space, None, &rules, &key, false)
            .unwrap()
            .unwrap();
        assert_eq!(parse_omap_key(&k).unwrap(), (0x500, 9));

        // A target below every key finds nothing.
        let key = SearchKey::Omap { oid: 0x100, xid: 1 };
        assert!(tree
            .lookup(&mut space, None, &rules, &key, false)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_multi_scan_descending() {
        let root = build_omap_root(
            3,
            5,
            &[(0x400, 2, 11), (0x500, 4, 77), (0x500, 9, 88), (0x600, 4, 99)],
        );
        let image = image_with_root(root, 3);
        let (mut space, tree) = open_tree(image, 3);
        let opts = ReportOptions::default();
        let rules = ObjectRules::container(&opts, 100);

        let key = SearchKey::OmapOid { oid: 0x500 };
        let mut scan = tree.scan(&mut space, None, &rules, &key).unwrap();
        let mut xids = Vec::new();
        while let Some((k, _)) = scan
            .next_record(&tree, &mut space, None, &rules, &key)
            .unwrap()
        {
            xids.push(parse_omap_key(&k).unwrap().1);
        }
        assert_eq!(xids, vec![9, 4]);
    }

    #[test]
    fn test_walk_order_violations() {
        let opts = ReportOptions::default();

        // Repeated leaf keys.
        let root = build_omap_root(3, 5, &[(0x500, 4, 1), (0x500, 4, 2)]);
        let image = image_with_root(root, 3);
        let (mut space, tree) = open_tree(image, 3);
        let rules = ObjectRules::container(&opts, 100);
        let err = tree
            .walk(&mut space, None, &rules, &mut |_, _| Ok(()))
            .unwrap_err();
        assert_eq!(err.to_string(), "B-tree: leaf keys are repeated.");

        // Out of order keys.
        let root = build_omap_root(3, 5, &[(0x600, 4, 1), (0x500, 4, 2)]);
        let image = image_with_root(root, 3);
        let (mut space, tree) = open_tree(image, 3);
        let rules = ObjectRules::container(&opts, 100);
        let err = tree
            .walk(&mut space, None, &rules, &mut |_, _| Ok(()))
            .unwrap_err();
        assert_eq!(err.to_string(), "B-tree: keys are out of order.");
    }

    #[test]
    fn test_walk_stats_and_footer() {
        let root = build_omap_root(3, 5, &[(0x500, 4, 1), (0x600, 4, 2)]);
        let image = image_with_root(root, 3);
        let (mut space, tree) = open_tree(image, 3);
        let opts = ReportOptions::default();
        let rules = ObjectRules::container(&opts, 100);

        let mut seen = 0;
        let stats = tree
            .walk(&mut space, None, &rules, &mut |_, _| {
                seen += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, 2);
        assert_eq!(stats.key_count, 2);
        assert_eq!(stats.node_count, 1);
    }

    #[test]
    fn test_footer_count_mismatch() {
        let mut root = build_omap_root(3, 5, &[(0x500, 4, 1), (0x600, 4, 2)]);
        // Lie about the key count, restamp the checksum.
        let f = BS - INFO_SIZE;
        root[f + 24..f + 32].copy_from_slice(&9u64.to_le_bytes());
        let cksum = fletcher::fletcher64(&root[8..]);
        root[0..8].copy_from_slice(&cksum.to_le_bytes());

        let image = image_with_root(root, 3);
        let (mut space, tree) = open_tree(image, 3);
        let opts = ReportOptions::default();
        let rules = ObjectRules::container(&opts, 100);
        let err = tree
            .walk(&mut space, None, &rules, &mut |_, _| Ok(()))
            .unwrap_err();
        assert_eq!(err.to_string(), "B-tree: wrong key count in the info footer.");
    }

    #[test]
    fn test_record_out_of_bounds() {
        let mut root = build_omap_root(3, 5, &[(0x500, 4, 1)]);
        // Point the first key offset past the end of the block.
        root[56..58].copy_from_slice(&0xFFF0u16.to_le_bytes());
        let cksum = fletcher::fletcher64(&root[8..]);
        root[0..8].copy_from_slice(&cksum.to_le_bytes());

        let image = image_with_root(root, 3);
        let (mut space, tree) = open_tree(image, 3);
        let opts = ReportOptions::default();
        let rules = ObjectRules::container(&opts, 100);
        let err = tree
            .walk(&mut space, None, &rules, &mut |_, _| Ok(()))
            .unwrap_err();
        assert!(matches!(err, ApfsckError::Corruption(_)));
        assert_eq!(err.to_string(), "B-tree: key is out of bounds.");
    }
}
