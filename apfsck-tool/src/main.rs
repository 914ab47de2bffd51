//! apfsck — offline integrity checker for APFS container images
//!
//! Reads the most recent committed checkpoint of a container, walks every
//! reachable metadata object, and reports the first violation found.
//!
//! ```text
//! apfsck [-c] [-u] [-w] <device> [tier2-device]
//! ```
//!
//! Exit status 0 means a clean pass; 1 means a usage error, an I/O error,
//! or a report at an enabled threshold. The report line goes to stdout as
//! `<context>: <message>`.

use std::path::PathBuf;
use std::process;

use clap::Parser;

use apfsck::{ApfsckError, ReportOptions};

#[derive(Debug, Parser)]
#[command(name = "apfsck", about = "Offline integrity checker for APFS containers")]
struct Args {
    /// Path to the container image or block device
    device: PathBuf,

    /// Tier-2 device of a fusion pair
    tier2: Option<PathBuf>,

    /// Report crash signatures left by unclean unmounts
    #[arg(short = 'c')]
    crash: bool,

    /// Report unknown or unsupported features
    #[arg(short = 'u')]
    unknown: bool,

    /// Report weird inconsistencies seen on real images
    #[arg(short = 'w')]
    weird: bool,
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let opts = ReportOptions {
        crash: args.crash,
        unknown: args.unknown,
        weird: args.weird,
    };

    match apfsck::check_path(&args.device, args.tier2.as_deref(), opts) {
        Ok(()) => {
            log::info!("{}: clean", args.device.display());
        }
        Err(err) => {
            // The report contract: one line on stdout, then a failure exit.
            println!("{err}");
            if let ApfsckError::Io(inner) = &err {
                log::debug!("I/O failure detail: {inner:?}");
            }
            process::exit(1);
        }
    }
}
