//! Human-readable progress reporting for registration runs.

use crate::hypervisor::{DescriptorFile, RegisteredVm};
use std::fmt;
use std::io::Write;
use tracing::warn;

/// Progress update emitted by the batch registrar.
#[derive(Debug, Clone)]
pub enum ProgressUpdate<'a> {
    /// The datastore holds no descriptor files.
    NoFiles { datastore: &'a str, extension: &'a str },
    /// A file is about to be processed.
    Processing { file: &'a DescriptorFile },
    /// A file was registered.
    Registered {
        file: &'a DescriptorFile,
        vm: &'a RegisteredVm,
    },
    /// Dry run: a file would be registered under this path.
    Planned {
        file: &'a DescriptorFile,
        datastore_path: &'a str,
    },
    /// A file could not be registered.
    Failed {
        file: &'a DescriptorFile,
        error: &'a str,
    },
    /// All files were processed.
    Finished {
        total: usize,
        succeeded: usize,
        failed: usize,
        dry_run: bool,
    },
}

impl fmt::Display for ProgressUpdate<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgressUpdate::NoFiles {
                datastore,
                extension,
            } => write!(f, "No .{} files found on datastore {}", extension, datastore),
            ProgressUpdate::Processing { file } => write!(f, "Processing {}", file.full_path),
            ProgressUpdate::Registered { file, vm } => write!(
                f,
                "Registered {} as {} ({})",
                file.name, vm.id, vm.datastore_path
            ),
            ProgressUpdate::Planned {
                file,
                datastore_path,
            } => write!(f, "Would register {} from {}", file.name, datastore_path),
            ProgressUpdate::Failed { file, error } => {
                write!(f, "Failed to register {}: {}", file.full_path, error)
            }
            ProgressUpdate::Finished {
                total,
                succeeded,
                failed,
                dry_run,
            } => {
                if *dry_run {
                    write!(f, "Dry run: {} of {} files would be registered", succeeded, total)
                } else {
                    write!(
                        f,
                        "Registered {} of {} VMs ({} failed)",
                        succeeded, total, failed
                    )
                }
            }
        }
    }
}

/// Receives progress updates from a registration run.
pub trait Reporter: Send {
    fn report(&mut self, update: &ProgressUpdate<'_>);
}

/// Writes one line per update.
pub struct LineReporter<W: Write + Send> {
    out: W,
}

impl<W: Write + Send> LineReporter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl LineReporter<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send> Reporter for LineReporter<W> {
    fn report(&mut self, update: &ProgressUpdate<'_>) {
        if let Err(e) = writeln!(self.out, "{}", update).and_then(|_| self.out.flush()) {
            warn!("Failed to write progress line: {}", e);
        }
    }
}

/// Discards every update.
#[derive(Debug, Default)]
pub struct SilentReporter;

impl Reporter for SilentReporter {
    fn report(&mut self, _update: &ProgressUpdate<'_>) {}
}
