//! In-memory APFS image builder for the end-to-end scenarios. Produces a
//! container with one committed checkpoint (optionally two), a spaceman
//! and reaper pair, a container omap, and one volume with a small catalog.

use apfsck::btree::{
    BTNODE_FIXED_KV_SIZE, BTNODE_LEAF, BTNODE_ROOT, BTREE_PHYSICAL,
};
use apfsck::catalog::{
    self, cat_keycmp, RECORD_TYPE_CRYPTO_STATE, RECORD_TYPE_DIR_REC, RECORD_TYPE_DSTREAM_ID,
    RECORD_TYPE_EXTENT, RECORD_TYPE_FILE_EXTENT, RECORD_TYPE_INODE, RECORD_TYPE_SIBLING_LINK,
    RECORD_TYPE_SIBLING_MAP, RECORD_TYPE_XATTR,
};
use apfsck::fletcher::fletcher64;
use apfsck::inode::{
    DstreamRaw, INO_EXT_TYPE_DSTREAM, INO_EXT_TYPE_NAME, INO_EXT_TYPE_SPARSE_BYTES,
    INODE_IS_SPARSE, S_IFDIR, S_IFLNK, S_IFREG,
};
use apfsck::object::{
    OBJ_EPHEMERAL, OBJ_PHYSICAL, OBJECT_TYPE_BLOCKREFTREE, OBJECT_TYPE_BTREE,
    OBJECT_TYPE_CHECKPOINT_MAP, OBJECT_TYPE_FS, OBJECT_TYPE_FSTREE, OBJECT_TYPE_NX_REAPER,
    OBJECT_TYPE_NX_SUPERBLOCK, OBJECT_TYPE_OMAP, OBJECT_TYPE_SNAPMETATREE, OBJECT_TYPE_SPACEMAN,
    OID_NX_SUPERBLOCK,
};

pub const BS: usize = 4096;

// Fixed layout of the synthetic container.
pub const DESC_BASE: u64 = 4;
pub const DESC_BLOCKS: u32 = 8;
pub const DATA_BASE: u64 = 12;
pub const DATA_BLOCKS: u32 = 8;
pub const BNO_CONT_OMAP: u64 = 20;
pub const BNO_CONT_OMAP_ROOT: u64 = 21;
pub const BNO_VSB: u64 = 22;
pub const BNO_VOL_OMAP: u64 = 23;
pub const BNO_VOL_OMAP_ROOT: u64 = 24;
pub const BNO_EXTREF_ROOT: u64 = 25;
pub const BNO_SNAP_ROOT: u64 = 26;
pub const BNO_CAT_ROOT: u64 = 27;

pub const OID_SPACEMAN: u64 = 0x400;
pub const OID_REAPER: u64 = 0x401;
pub const OID_VOLUME: u64 = 0x402;
pub const OID_CATALOG: u64 = 0x404;

pub const XID: u64 = 10;

/// Knobs the scenarios turn. Everything defaults to a clean image.
pub struct Config {
    pub block_count: u64,
    /// Add a second, newer checkpoint (xid 11) on top of the first.
    pub two_checkpoints: bool,
    /// Volume incompatible features; the default is a case-insensitive
    /// volume with hashed directory entries.
    pub vol_incompat: u64,
    /// Container incompatible features.
    pub nx_incompat: u64,
    pub extentref_oid: u64,
    pub num_directories: Option<u64>,
    pub extent_refcnt: Option<u32>,
    /// Encrypt the plain file's extent: add a crypto state with this
    /// recorded refcount and reference it from the extent.
    pub crypto_refcnt: Option<u32>,
    /// Replace the generated catalog records wholesale.
    pub catalog_records: Option<Vec<(Vec<u8>, Vec<u8>)>>,
    /// Skip the key sort, for images that are deliberately misordered.
    pub sort_catalog: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            block_count: 4096,
            two_checkpoints: false,
            vol_incompat: 0x0001, // case-insensitive
            nx_incompat: 0x0002,  // version 2
            extentref_oid: BNO_EXTREF_ROOT,
            num_directories: None,
            extent_refcnt: None,
            crypto_refcnt: None,
            catalog_records: None,
            sort_catalog: true,
        }
    }
}

pub struct Image {
    pub blocks: Vec<u8>,
}

impl Image {
    fn new(block_count: u64) -> Self {
        Image {
            blocks: vec![0u8; block_count as usize * BS],
        }
    }

    pub fn block_mut(&mut self, bno: u64) -> &mut [u8] {
        let at = bno as usize * BS;
        &mut self.blocks[at..at + BS]
    }

    pub fn put(&mut self, bno: u64, block: &[u8]) {
        self.block_mut(bno).copy_from_slice(block);
    }
}

/// Stamp a block's Fletcher-64 checksum.
pub fn stamp(block: &mut [u8]) {
    let cksum = fletcher64(&block[8..]);
    block[0..8].copy_from_slice(&cksum.to_le_bytes());
}

fn obj_header(block: &mut [u8], oid: u64, xid: u64, type_word: u32, subtype: u32) {
    block[8..16].copy_from_slice(&oid.to_le_bytes());
    block[16..24].copy_from_slice(&xid.to_le_bytes());
    block[24..28].copy_from_slice(&type_word.to_le_bytes());
    block[28..32].copy_from_slice(&subtype.to_le_bytes());
}

pub struct NodeCfg<'a> {
    pub oid: u64,
    pub xid: u64,
    pub type_word: u32,
    pub subtype: u32,
    pub fixed_kv: bool,
    pub info_flags: u32,
    pub key_size: u32,
    pub val_size: u32,
    pub records: &'a [(Vec<u8>, Vec<u8>)],
}

/// Assemble a single root+leaf node, the only shape the synthetic images
/// need.
pub fn build_node(cfg: &NodeCfg) -> Vec<u8> {
    let mut block = vec![0u8; BS];
    obj_header(&mut block, cfg.oid, cfg.xid, cfg.type_word, cfg.subtype);

    let n = cfg.records.len();
    let entry_size = if cfg.fixed_kv { 4 } else { 8 };
    let flags = BTNODE_ROOT | BTNODE_LEAF | if cfg.fixed_kv { BTNODE_FIXED_KV_SIZE } else { 0 };
    let toc_len = n * entry_size;
    let key_start = 56 + toc_len;
    let data_end = BS - 40;

    let total_keys: usize = cfg.records.iter().map(|(k, _)| k.len()).sum();
    let total_vals: usize = cfg.records.iter().map(|(_, v)| v.len()).sum();

    block[32..34].copy_from_slice(&flags.to_le_bytes());
    block[34..36].copy_from_slice(&0u16.to_le_bytes());
    block[36..40].copy_from_slice(&(n as u32).to_le_bytes());
    block[40..42].copy_from_slice(&0u16.to_le_bytes());
    block[42..44].copy_from_slice(&(toc_len as u16).to_le_bytes());
    block[44..46].copy_from_slice(&(total_keys as u16).to_le_bytes());
    let free_len = data_end - total_vals - (key_start + total_keys);
    block[46..48].copy_from_slice(&(free_len as u16).to_le_bytes());

    let mut key_off = 0usize;
    let mut val_off = 0usize;
    let mut longest_key = 0u32;
    let mut longest_val = 0u32;
    for (i, (key, val)) in cfg.records.iter().enumerate() {
        val_off += val.len();
        let toc = 56 + i * entry_size;
        if cfg.fixed_kv {
            block[toc..toc + 2].copy_from_slice(&(key_off as u16).to_le_bytes());
            block[toc + 2..toc + 4].copy_from_slice(&(val_off as u16).to_le_bytes());
        } else {
            block[toc..toc + 2].copy_from_slice(&(key_off as u16).to_le_bytes());
            block[toc + 2..toc + 4].copy_from_slice(&(key.len() as u16).to_le_bytes());
            block[toc + 4..toc + 6].copy_from_slice(&(val_off as u16).to_le_bytes());
            block[toc + 6..toc + 8].copy_from_slice(&(val.len() as u16).to_le_bytes());
        }

        block[key_start + key_off..key_start + key_off + key.len()].copy_from_slice(key);
        block[data_end - val_off..data_end - val_off + val.len()].copy_from_slice(val);
        key_off += key.len();
        longest_key = longest_key.max(key.len() as u32);
        longest_val = longest_val.max(val.len() as u32);
    }

    let f = BS - 40;
    block[f..f + 4].copy_from_slice(&cfg.info_flags.to_le_bytes());
    block[f + 4..f + 8].copy_from_slice(&(BS as u32).to_le_bytes());
    block[f + 8..f + 12].copy_from_slice(&cfg.key_size.to_le_bytes());
    block[f + 12..f + 16].copy_from_slice(&cfg.val_size.to_le_bytes());
    block[f + 16..f + 20].copy_from_slice(&longest_key.to_le_bytes());
    block[f + 20..f + 24].copy_from_slice(&longest_val.to_le_bytes());
    block[f + 24..f + 32].copy_from_slice(&(n as u64).to_le_bytes());
    block[f + 32..f + 40].copy_from_slice(&1u64.to_le_bytes());

    stamp(&mut block);
    block
}

// ---- record encoders ----

pub fn cat_key(cnid: u64, kind: u8) -> Vec<u8> {
    ((cnid) | ((kind as u64) << 60)).to_le_bytes().to_vec()
}

pub fn drec_key(parent: u64, name: &str) -> Vec<u8> {
    let mut key = cat_key(parent, RECORD_TYPE_DIR_REC);
    let len = name.len() + 1;
    let hash = catalog::drec_hash(name.as_bytes(), true).unwrap();
    key.extend_from_slice(&((hash << 10) | len as u32).to_le_bytes());
    key.extend_from_slice(name.as_bytes());
    key.push(0);
    key
}

pub fn file_extent_key(id: u64, addr: u64) -> Vec<u8> {
    let mut key = cat_key(id, RECORD_TYPE_FILE_EXTENT);
    key.extend_from_slice(&addr.to_le_bytes());
    key
}

pub fn sibling_link_key(ino: u64, sibling_id: u64) -> Vec<u8> {
    let mut key = cat_key(ino, RECORD_TYPE_SIBLING_LINK);
    key.extend_from_slice(&sibling_id.to_le_bytes());
    key
}

pub fn xattr_key(ino: u64, name: &str) -> Vec<u8> {
    let mut key = cat_key(ino, RECORD_TYPE_XATTR);
    key.extend_from_slice(&((name.len() + 1) as u16).to_le_bytes());
    key.extend_from_slice(name.as_bytes());
    key.push(0);
    key
}

pub fn xfield_blob(fields: &[(u8, Vec<u8>)]) -> Vec<u8> {
    let mut blob = Vec::new();
    blob.extend_from_slice(&(fields.len() as u16).to_le_bytes());
    let used: usize = fields.iter().map(|(_, d)| (d.len() + 7) & !7).sum();
    blob.extend_from_slice(&(used as u16).to_le_bytes());
    for (xtype, data) in fields {
        blob.push(*xtype);
        blob.push(0);
        blob.extend_from_slice(&(data.len() as u16).to_le_bytes());
    }
    for (_, data) in fields {
        blob.extend_from_slice(data);
        blob.resize(blob.len() + (((data.len() + 7) & !7) - data.len()), 0);
    }
    blob
}

pub fn name_xfield(name: &str) -> (u8, Vec<u8>) {
    let mut data = name.as_bytes().to_vec();
    data.push(0);
    (INO_EXT_TYPE_NAME, data)
}

pub fn dstream_xfield(size: u64, alloced: u64) -> (u8, Vec<u8>) {
    let mut data = Vec::with_capacity(DstreamRaw::SIZE);
    data.extend_from_slice(&size.to_le_bytes());
    data.extend_from_slice(&alloced.to_le_bytes());
    data.extend_from_slice(&0u64.to_le_bytes());
    data.extend_from_slice(&alloced.to_le_bytes());
    data.extend_from_slice(&0u64.to_le_bytes());
    (INO_EXT_TYPE_DSTREAM, data)
}

pub fn inode_val(
    parent: u64,
    private_id: u64,
    flags: u64,
    count: i32,
    mode: u16,
    xfields: &[(u8, Vec<u8>)],
) -> Vec<u8> {
    let mut val = Vec::with_capacity(92);
    val.extend_from_slice(&parent.to_le_bytes());
    val.extend_from_slice(&private_id.to_le_bytes());
    for _ in 0..4 {
        val.extend_from_slice(&1_000_000i64.to_le_bytes()); // timestamps
    }
    val.extend_from_slice(&flags.to_le_bytes());
    val.extend_from_slice(&count.to_le_bytes());
    val.extend_from_slice(&0u32.to_le_bytes()); // protection class
    val.extend_from_slice(&1u32.to_le_bytes()); // write generation
    val.extend_from_slice(&0u32.to_le_bytes()); // bsd flags
    val.extend_from_slice(&501u32.to_le_bytes()); // uid
    val.extend_from_slice(&20u32.to_le_bytes()); // gid
    val.extend_from_slice(&(mode | 0o644).to_le_bytes());
    val.extend_from_slice(&0u16.to_le_bytes()); // pad
    val.extend_from_slice(&0u64.to_le_bytes()); // uncompressed size
    val.extend_from_slice(&xfield_blob(xfields));
    val
}

pub fn drec_val(file_id: u64, dt: u16, sibling_id: Option<u64>) -> Vec<u8> {
    let mut val = Vec::new();
    val.extend_from_slice(&file_id.to_le_bytes());
    val.extend_from_slice(&2_000_000i64.to_le_bytes());
    val.extend_from_slice(&dt.to_le_bytes());
    if let Some(id) = sibling_id {
        val.extend_from_slice(&xfield_blob(&[(1, id.to_le_bytes().to_vec())]));
    }
    val
}

pub fn file_extent_val(len: u64, phys: u64) -> Vec<u8> {
    file_extent_val_crypto(len, phys, 0)
}

pub fn file_extent_val_crypto(len: u64, phys: u64, crypto_id: u64) -> Vec<u8> {
    let mut val = Vec::new();
    val.extend_from_slice(&len.to_le_bytes());
    val.extend_from_slice(&phys.to_le_bytes());
    val.extend_from_slice(&crypto_id.to_le_bytes());
    val
}

pub fn phys_ext_val(blocks: u64, owner: u64, refcnt: u32) -> Vec<u8> {
    let mut val = Vec::new();
    val.extend_from_slice(&(blocks | (1u64 << 60)).to_le_bytes()); // kind NEW
    val.extend_from_slice(&owner.to_le_bytes());
    val.extend_from_slice(&refcnt.to_le_bytes());
    val
}

pub fn sibling_link_val(parent: u64, name: &str) -> Vec<u8> {
    let mut val = Vec::new();
    val.extend_from_slice(&parent.to_le_bytes());
    val.extend_from_slice(&((name.len() + 1) as u16).to_le_bytes());
    val.extend_from_slice(name.as_bytes());
    val.push(0);
    val
}

pub fn embedded_xattr_val(data: &[u8]) -> Vec<u8> {
    let mut val = Vec::new();
    val.extend_from_slice(&2u16.to_le_bytes()); // embedded
    val.extend_from_slice(&(data.len() as u16).to_le_bytes());
    val.extend_from_slice(data);
    val
}

/// Crypto id handed to the plain file's extent when encryption state is
/// requested.
pub const CRYPTO_ID: u64 = 0x18;

/// The standard catalog: a root and private directory, a plain file with
/// one extent, a hard-linked file, a symlink, and a sparse file. With
/// `crypto_refcnt` the plain file's extent carries a crypto id backed by a
/// crypto-state record.
pub fn standard_catalog(crypto_refcnt: Option<u32>) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut records: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();

    records.push((
        cat_key(2, RECORD_TYPE_INODE),
        inode_val(1, 2, 0, 5, S_IFDIR, &[name_xfield("root")]),
    ));
    records.push((
        cat_key(3, RECORD_TYPE_INODE),
        inode_val(1, 3, 0, 0, S_IFDIR, &[name_xfield("private-dir")]),
    ));

    // A plain file with a single 2-block extent.
    records.push((cat_key(0x10, RECORD_TYPE_INODE), {
        inode_val(
            2,
            0x10,
            0,
            1,
            S_IFREG,
            &[name_xfield("hello.txt"), dstream_xfield(6000, 8192)],
        )
    }));
    records.push((
        cat_key(0x10, RECORD_TYPE_DSTREAM_ID),
        1u32.to_le_bytes().to_vec(),
    ));
    match crypto_refcnt {
        Some(refcnt) => {
            records.push((
                file_extent_key(0x10, 0),
                file_extent_val_crypto(8192, 40, CRYPTO_ID),
            ));
            let mut crypto_val = refcnt.to_le_bytes().to_vec();
            crypto_val.resize(crypto_val.len() + 20, 0); // wrapped state stub
            records.push((cat_key(CRYPTO_ID, RECORD_TYPE_CRYPTO_STATE), crypto_val));
        }
        None => {
            records.push((file_extent_key(0x10, 0), file_extent_val(8192, 40)));
        }
    }
    records.push((drec_key(2, "hello.txt"), drec_val(0x10, 8, None)));

    // A file with two hard links and no contents.
    records.push((
        cat_key(0x12, RECORD_TYPE_INODE),
        inode_val(2, 0x12, 0, 2, S_IFREG, &[name_xfield("link1")]),
    ));
    records.push((sibling_link_key(0x12, 0x13), sibling_link_val(2, "link1")));
    records.push((sibling_link_key(0x12, 0x14), sibling_link_val(2, "link2")));
    records.push((
        cat_key(0x13, RECORD_TYPE_SIBLING_MAP),
        0x12u64.to_le_bytes().to_vec(),
    ));
    records.push((
        cat_key(0x14, RECORD_TYPE_SIBLING_MAP),
        0x12u64.to_le_bytes().to_vec(),
    ));
    records.push((drec_key(2, "link1"), drec_val(0x12, 8, Some(0x13))));
    records.push((drec_key(2, "link2"), drec_val(0x12, 8, Some(0x14))));

    // A symlink; the target lives in an embedded attribute.
    records.push((
        cat_key(0x15, RECORD_TYPE_INODE),
        inode_val(2, 0x15, 0, 1, S_IFLNK, &[name_xfield("sym")]),
    ));
    records.push((
        xattr_key(0x15, "com.apple.fs.symlink"),
        embedded_xattr_val(b"hello.txt\0"),
    ));
    records.push((drec_key(2, "sym"), drec_val(0x15, 10, None)));

    // A sparse file: one real extent, one hole.
    records.push((cat_key(0x16, RECORD_TYPE_INODE), {
        inode_val(
            2,
            0x16,
            INODE_IS_SPARSE,
            1,
            S_IFREG,
            &[
                name_xfield("sparse"),
                dstream_xfield(16384, 16384),
                (INO_EXT_TYPE_SPARSE_BYTES, 8192u64.to_le_bytes().to_vec()),
            ],
        )
    }));
    records.push((
        cat_key(0x16, RECORD_TYPE_DSTREAM_ID),
        1u32.to_le_bytes().to_vec(),
    ));
    records.push((file_extent_key(0x16, 0), file_extent_val(8192, 42)));
    records.push((file_extent_key(0x16, 8192), file_extent_val(8192, 0)));
    records.push((drec_key(2, "sparse"), drec_val(0x16, 8, None)));

    records
}

fn extentref_records(extent_refcnt: Option<u32>) -> Vec<(Vec<u8>, Vec<u8>)> {
    vec![
        (
            cat_key(40, RECORD_TYPE_EXTENT),
            phys_ext_val(2, 0x10, extent_refcnt.unwrap_or(1)),
        ),
        (cat_key(42, RECORD_TYPE_EXTENT), phys_ext_val(2, 0x16, 1)),
    ]
}

/// Measured totals of the standard catalog, for the volume counters.
struct Totals {
    files: u64,
    dirs: u64,
    symlinks: u64,
    alloc: u64,
}

const STANDARD_TOTALS: Totals = Totals {
    files: 3,
    dirs: 2,
    symlinks: 1,
    alloc: 4,
};

fn build_vsb(cfg: &Config) -> Vec<u8> {
    let mut block = vec![0u8; BS];
    obj_header(&mut block, OID_VOLUME, XID, OBJECT_TYPE_FS as u32, 0);

    let w32 = |b: &mut [u8], at: usize, v: u32| b[at..at + 4].copy_from_slice(&v.to_le_bytes());
    let w64 = |b: &mut [u8], at: usize, v: u64| b[at..at + 8].copy_from_slice(&v.to_le_bytes());

    w32(&mut block, 32, 0x42535041); // APSB
    w32(&mut block, 36, 0); // fs index
    w64(&mut block, 40, 0); // features
    w64(&mut block, 48, 0); // ro compat
    w64(&mut block, 56, cfg.vol_incompat);
    w64(&mut block, 64, 3_000_000); // unmount time
    w64(&mut block, 88, STANDARD_TOTALS.alloc); // fs_alloc_count
    block[96..98].copy_from_slice(&5u16.to_le_bytes()); // meta crypto major
    w32(&mut block, 116, OBJECT_TYPE_BTREE as u32); // root tree: virtual
    w32(&mut block, 120, OBJ_PHYSICAL | OBJECT_TYPE_BTREE as u32);
    w32(&mut block, 124, OBJ_PHYSICAL | OBJECT_TYPE_BTREE as u32);
    w64(&mut block, 128, BNO_VOL_OMAP);
    w64(&mut block, 136, OID_CATALOG);
    w64(&mut block, 144, cfg.extentref_oid);
    w64(&mut block, 152, BNO_SNAP_ROOT);
    w64(&mut block, 176, 0x20); // next_obj_id
    w64(
        &mut block,
        184,
        STANDARD_TOTALS.files, // num_files
    );
    w64(
        &mut block,
        192,
        cfg.num_directories.unwrap_or(STANDARD_TOTALS.dirs),
    );
    w64(&mut block, 200, STANDARD_TOTALS.symlinks);
    w64(&mut block, 208, 0); // num_other_fsobjects
    w64(&mut block, 216, 0); // num_snapshots
    w64(&mut block, 224, STANDARD_TOTALS.alloc); // total blocks alloced
    block[240..256].copy_from_slice(&[0x11u8; 16]); // volume uuid
    w64(&mut block, 256, 3_000_000); // last mod time
    w64(&mut block, 264, 0x0001); // fs_flags: unencrypted

    // formatted_by, then one modifier.
    block[272..279].copy_from_slice(b"mkapfs\0");
    w64(&mut block, 304, 500_000); // format timestamp
    w64(&mut block, 312, 1); // format xid
    block[320..327].copy_from_slice(b"tester\0");
    w64(&mut block, 352, 600_000);
    w64(&mut block, 360, 9);

    block[704..712].copy_from_slice(b"TestVol\0");
    w32(&mut block, 960, 3); // next_doc_id
    block[964..966].copy_from_slice(&0u16.to_le_bytes()); // role

    stamp(&mut block);
    block
}

fn build_nxsb(
    cfg: &Config,
    xid: u64,
    desc_index: u32,
    desc_next: u32,
    desc_len: u32,
    data_index: u32,
    data_next: u32,
    data_len: u32,
) -> Vec<u8> {
    let mut block = vec![0u8; BS];
    obj_header(
        &mut block,
        OID_NX_SUPERBLOCK,
        xid,
        OBJ_EPHEMERAL | OBJECT_TYPE_NX_SUPERBLOCK as u32,
        0,
    );

    let w32 = |b: &mut [u8], at: usize, v: u32| b[at..at + 4].copy_from_slice(&v.to_le_bytes());
    let w64 = |b: &mut [u8], at: usize, v: u64| b[at..at + 8].copy_from_slice(&v.to_le_bytes());

    w32(&mut block, 32, 0x4253584E); // NXSB
    w32(&mut block, 36, BS as u32);
    w64(&mut block, 40, cfg.block_count);
    w64(&mut block, 64, cfg.nx_incompat);
    block[72..88].copy_from_slice(&[0x22u8; 16]); // container uuid
    w64(&mut block, 88, 0x500); // next_oid
    w64(&mut block, 96, xid + 1); // next_xid

    w32(&mut block, 104, DESC_BLOCKS);
    w32(&mut block, 108, DATA_BLOCKS);
    w64(&mut block, 112, DESC_BASE);
    w64(&mut block, 120, DATA_BASE);
    w32(&mut block, 128, desc_next);
    w32(&mut block, 132, data_next);
    w32(&mut block, 136, desc_index);
    w32(&mut block, 140, desc_len);
    w32(&mut block, 144, data_index);
    w32(&mut block, 148, data_len);

    w64(&mut block, 152, OID_SPACEMAN);
    w64(&mut block, 160, BNO_CONT_OMAP);
    w64(&mut block, 168, OID_REAPER);
    w32(&mut block, 180, 1); // max_file_systems
    w64(&mut block, 184, OID_VOLUME); // fs_oid[0]

    // ephemeral info: (min blocks << 32) | (max structs << 16) | version
    w64(&mut block, 1312, (8u64 << 32) | (4 << 16) | 1);

    stamp(&mut block);
    block
}

fn build_cpm(bno: u64, xid: u64, entries: &[(u32, u64, u64)]) -> Vec<u8> {
    let mut block = vec![0u8; BS];
    obj_header(
        &mut block,
        bno,
        xid,
        OBJ_PHYSICAL | OBJECT_TYPE_CHECKPOINT_MAP as u32,
        0,
    );
    block[32..36].copy_from_slice(&1u32.to_le_bytes()); // CHECKPOINT_MAP_LAST
    block[36..40].copy_from_slice(&(entries.len() as u32).to_le_bytes());
    for (i, &(etype, oid, paddr)) in entries.iter().enumerate() {
        let at = 40 + i * 40;
        block[at..at + 4].copy_from_slice(&(OBJ_EPHEMERAL | etype).to_le_bytes());
        block[at + 8..at + 12].copy_from_slice(&(BS as u32).to_le_bytes()); // size
        block[at + 24..at + 32].copy_from_slice(&oid.to_le_bytes());
        block[at + 32..at + 40].copy_from_slice(&paddr.to_le_bytes());
    }
    stamp(&mut block);
    block
}

fn build_ephemeral(oid: u64, xid: u64, type_word: u32) -> Vec<u8> {
    let mut block = vec![0u8; BS];
    obj_header(&mut block, oid, xid, OBJ_EPHEMERAL | type_word, 0);
    stamp(&mut block);
    block
}

fn build_omap_object(bno: u64, xid: u64, tree_bno: u64) -> Vec<u8> {
    let mut block = vec![0u8; BS];
    obj_header(&mut block, bno, xid, OBJ_PHYSICAL | OBJECT_TYPE_OMAP as u32, 0);
    let phys_btree = OBJ_PHYSICAL | OBJECT_TYPE_BTREE as u32;
    block[40..44].copy_from_slice(&phys_btree.to_le_bytes()); // tree type
    block[44..48].copy_from_slice(&phys_btree.to_le_bytes()); // snap tree type
    block[48..56].copy_from_slice(&tree_bno.to_le_bytes());
    stamp(&mut block);
    block
}

fn omap_record(oid: u64, xid: u64, paddr: u64) -> (Vec<u8>, Vec<u8>) {
    let mut key = Vec::new();
    key.extend_from_slice(&oid.to_le_bytes());
    key.extend_from_slice(&xid.to_le_bytes());
    let mut val = Vec::new();
    val.extend_from_slice(&0u32.to_le_bytes());
    val.extend_from_slice(&(BS as u32).to_le_bytes());
    val.extend_from_slice(&paddr.to_le_bytes());
    (key, val)
}

/// Assemble a whole image per the configuration.
pub fn build_image(cfg: &Config) -> Vec<u8> {
    let mut image = Image::new(cfg.block_count);

    // Checkpoint one: mapping block and superblock at ring indexes 0-1,
    // ephemeral bodies at data indexes 0-1.
    let cpm1 = build_cpm(
        DESC_BASE,
        XID,
        &[
            (OBJECT_TYPE_SPACEMAN as u32, OID_SPACEMAN, DATA_BASE),
            (OBJECT_TYPE_NX_REAPER as u32, OID_REAPER, DATA_BASE + 1),
        ],
    );
    image.put(DESC_BASE, &cpm1);
    image.put(
        DATA_BASE,
        &build_ephemeral(OID_SPACEMAN, XID, OBJECT_TYPE_SPACEMAN as u32),
    );
    image.put(
        DATA_BASE + 1,
        &build_ephemeral(OID_REAPER, XID, OBJECT_TYPE_NX_REAPER as u32),
    );

    let newest_sb;
    if cfg.two_checkpoints {
        let sb1 = build_nxsb(cfg, XID, 0, 2, 2, 0, 2, 2);
        image.put(DESC_BASE + 1, &sb1);

        let cpm2 = build_cpm(
            DESC_BASE + 2,
            XID + 1,
            &[
                (OBJECT_TYPE_SPACEMAN as u32, OID_SPACEMAN, DATA_BASE + 2),
                (OBJECT_TYPE_NX_REAPER as u32, OID_REAPER, DATA_BASE + 3),
            ],
        );
        image.put(DESC_BASE + 2, &cpm2);
        image.put(
            DATA_BASE + 2,
            &build_ephemeral(OID_SPACEMAN, XID + 1, OBJECT_TYPE_SPACEMAN as u32),
        );
        image.put(
            DATA_BASE + 3,
            &build_ephemeral(OID_REAPER, XID + 1, OBJECT_TYPE_NX_REAPER as u32),
        );

        let sb2 = build_nxsb(cfg, XID + 1, 0, 4, 2, 0, 4, 2);
        image.put(DESC_BASE + 3, &sb2);
        newest_sb = sb2;
    } else {
        let sb1 = build_nxsb(cfg, XID, 0, 2, 2, 0, 2, 2);
        image.put(DESC_BASE + 1, &sb1);
        newest_sb = sb1;
    }

    // Block zero backs up the newest checkpoint superblock verbatim.
    image.put(0, &newest_sb);

    // Container omap with the one volume.
    image.put(BNO_CONT_OMAP, &build_omap_object(BNO_CONT_OMAP, XID, BNO_CONT_OMAP_ROOT));
    let cont_root = build_node(&NodeCfg {
        oid: BNO_CONT_OMAP_ROOT,
        xid: XID,
        type_word: OBJ_PHYSICAL | OBJECT_TYPE_BTREE as u32,
        subtype: OBJECT_TYPE_OMAP as u32,
        fixed_kv: true,
        info_flags: BTREE_PHYSICAL,
        key_size: 16,
        val_size: 16,
        records: &[omap_record(OID_VOLUME, XID, BNO_VSB)],
    });
    image.put(BNO_CONT_OMAP_ROOT, &cont_root);

    image.put(BNO_VSB, &build_vsb(cfg));

    // Volume omap with the catalog root.
    image.put(BNO_VOL_OMAP, &build_omap_object(BNO_VOL_OMAP, XID, BNO_VOL_OMAP_ROOT));
    let vol_root = build_node(&NodeCfg {
        oid: BNO_VOL_OMAP_ROOT,
        xid: XID,
        type_word: OBJ_PHYSICAL | OBJECT_TYPE_BTREE as u32,
        subtype: OBJECT_TYPE_OMAP as u32,
        fixed_kv: true,
        info_flags: BTREE_PHYSICAL,
        key_size: 16,
        val_size: 16,
        records: &[omap_record(OID_CATALOG, XID, BNO_CAT_ROOT)],
    });
    image.put(BNO_VOL_OMAP_ROOT, &vol_root);

    // Extent references, snapshot metadata (empty), and the catalog.
    let extref = build_node(&NodeCfg {
        oid: BNO_EXTREF_ROOT,
        xid: XID,
        type_word: OBJ_PHYSICAL | OBJECT_TYPE_BTREE as u32,
        subtype: OBJECT_TYPE_BLOCKREFTREE as u32,
        fixed_kv: false,
        info_flags: BTREE_PHYSICAL,
        key_size: 0,
        val_size: 0,
        records: &extentref_records(cfg.extent_refcnt),
    });
    image.put(BNO_EXTREF_ROOT, &extref);

    let snap = build_node(&NodeCfg {
        oid: BNO_SNAP_ROOT,
        xid: XID,
        type_word: OBJ_PHYSICAL | OBJECT_TYPE_BTREE as u32,
        subtype: OBJECT_TYPE_SNAPMETATREE as u32,
        fixed_kv: false,
        info_flags: BTREE_PHYSICAL,
        key_size: 0,
        val_size: 0,
        records: &[],
    });
    image.put(BNO_SNAP_ROOT, &snap);

    let mut records = match &cfg.catalog_records {
        Some(records) => records.clone(),
        None => standard_catalog(cfg.crypto_refcnt),
    };
    if cfg.sort_catalog {
        records.sort_by(|(a, _), (b, _)| cat_keycmp(a, b, true, true).unwrap());
    }
    let cat = build_node(&NodeCfg {
        oid: OID_CATALOG,
        xid: XID,
        type_word: OBJECT_TYPE_BTREE as u32, // virtual
        subtype: OBJECT_TYPE_FSTREE as u32,
        fixed_kv: false,
        info_flags: 0,
        key_size: 0,
        val_size: 0,
        records: &records,
    });
    image.put(BNO_CAT_ROOT, &cat);

    image.blocks
}
