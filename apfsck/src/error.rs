use std::fmt;

use thiserror::Error;

/// A single fatal report line, formatted as `<context>: <message>` or a bare
/// `<message>` when no context applies.
#[derive(Debug, Clone)]
pub struct Report {
    pub context: Option<&'static str>,
    pub message: String,
}

impl Report {
    pub fn new(context: &'static str, message: impl Into<String>) -> Self {
        Report {
            context: Some(context),
            message: message.into(),
        }
    }

    pub fn bare(message: impl Into<String>) -> Self {
        Report {
            context: None,
            message: message.into(),
        }
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.context {
            Some(ctx) => write!(f, "{}: {}", ctx, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

#[derive(Error, Debug)]
pub enum ApfsckError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An on-disk invariant was violated. Always fatal.
    #[error("{0}")]
    Corruption(Report),

    /// Legal on disk, but outside the checker's coverage. Raised only when
    /// the unknown-feature threshold is enabled.
    #[error("{0}: not supported.")]
    Unsupported(&'static str),

    /// Artefact of an unclean shutdown. Raised only when the crash threshold
    /// is enabled.
    #[error("{0}")]
    Crash(Report),

    /// Inconsistency seen on real images that the format documentation does
    /// not explain. Raised only when the weird threshold is enabled.
    #[error("{0}")]
    Weird(Report),
}

pub type Result<T> = std::result::Result<T, ApfsckError>;

/// Corruption report with a context prefix.
pub fn corrupt(context: &'static str, message: impl Into<String>) -> ApfsckError {
    ApfsckError::Corruption(Report::new(context, message))
}

/// Corruption report with no context prefix.
pub fn corrupt_bare(message: impl Into<String>) -> ApfsckError {
    ApfsckError::Corruption(Report::bare(message))
}

/// Reporting thresholds selected on the command line. Corruption and I/O
/// failures are always fatal; the three classes below are suppressed unless
/// their flag is set.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReportOptions {
    pub crash: bool,
    pub unknown: bool,
    pub weird: bool,
}

impl ReportOptions {
    pub fn unknown_feature(&self, feature: &'static str) -> Result<()> {
        if self.unknown {
            return Err(ApfsckError::Unsupported(feature));
        }
        log::debug!("suppressed unknown feature: {}", feature);
        Ok(())
    }

    pub fn crash(&self, context: &'static str, message: impl Into<String>) -> Result<()> {
        if self.crash {
            return Err(ApfsckError::Crash(Report::new(context, message)));
        }
        log::debug!("suppressed crash signature: {}", context);
        Ok(())
    }

    pub fn weird(&self, context: &'static str, message: impl Into<String>) -> Result<()> {
        if self.weird {
            return Err(ApfsckError::Weird(Report::new(context, message)));
        }
        log::debug!("suppressed weird inconsistency: {}", context);
        Ok(())
    }
}
