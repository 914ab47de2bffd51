pub mod error;
pub mod fletcher;
pub mod device;
pub mod object;
pub mod tables;
pub mod superblock;
pub mod checkpoint;
pub mod btree;
pub mod omap;
pub mod catalog;
pub mod inode;
pub mod extents;
pub mod snapshot;
pub mod volume;
pub mod container;

pub use error::{ApfsckError, Report, ReportOptions, Result};

use std::fs::File;
use std::io::{BufReader, Read, Seek};
use std::path::Path;

use device::BlockSpace;

/// Check an already-opened image or block device. `tier2` is the second
/// half of a fusion pair, when there is one. Returns on the first
/// violation; a clean pass returns `Ok(())`.
///
/// The run is strictly read-only: the devices are only ever read from, and
/// every block is checksummed at first use.
pub fn check_image<R: Read + Seek>(main: R, tier2: Option<R>, opts: ReportOptions) -> Result<()> {
    let mut space = BlockSpace::new(main)?;
    if let Some(tier2) = tier2 {
        space = space.with_tier2(tier2)?;
    }
    container::check_container(&mut space, &opts)
}

/// Open the given paths read-only and check them.
pub fn check_path(
    main: &Path,
    tier2: Option<&Path>,
    opts: ReportOptions,
) -> Result<()> {
    let main = BufReader::new(File::open(main)?);
    let tier2 = match tier2 {
        Some(path) => Some(BufReader::new(File::open(path)?)),
        None => None,
    };
    check_image(main, tier2, opts)
}
