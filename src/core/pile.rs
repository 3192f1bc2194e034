//! Purpose: Façade over one mapped file: one appender, any number of readers.
//! Exports: `Pile`, `PileOptions`.
//! Role: Entry point used by codecs and harnesses; owns open-mode policy.
//! Invariants: At most one appender per pile instance, enforced atomically.
//! Invariants: Closing is idempotent and releases the mapped file.
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::core::appender::Appender;
use crate::core::error::{Error, ErrorKind};
use crate::core::file::{MappedFile, Mode, DEFAULT_REGION_SIZE};
use crate::core::sequencer::Sequencer;

#[derive(Clone, Copy, Debug)]
pub struct PileOptions {
    pub region_size: usize,
}

impl PileOptions {
    pub fn new() -> Self {
        Self {
            region_size: DEFAULT_REGION_SIZE,
        }
    }

    pub fn region_size(mut self, region_size: usize) -> Self {
        self.region_size = region_size;
        self
    }
}

impl Default for PileOptions {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Pile {
    file: Arc<MappedFile>,
    appender_claimed: AtomicBool,
    closed: AtomicBool,
}

impl Pile {
    /// Creates a fresh pile, discarding any existing file contents.
    pub fn create_or_replace(path: impl AsRef<Path>, options: PileOptions) -> Result<Self, Error> {
        Self::open(path, Mode::ReadWriteClear, options)
    }

    /// Opens for appending, creating the file when missing; existing frames
    /// are preserved and the appender resumes after them.
    pub fn create_or_append(path: impl AsRef<Path>, options: PileOptions) -> Result<Self, Error> {
        Self::open(path, Mode::ReadWrite, options)
    }

    /// Opens an existing pile for reading only.
    pub fn open_read_only(path: impl AsRef<Path>, options: PileOptions) -> Result<Self, Error> {
        Self::open(path, Mode::ReadOnly, options)
    }

    fn open(path: impl AsRef<Path>, mode: Mode, options: PileOptions) -> Result<Self, Error> {
        let file = MappedFile::open(path, mode, options.region_size)?;
        Ok(Self {
            file: Arc::new(file),
            appender_claimed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// Hands out the single appender; succeeds at most once per pile.
    pub fn appender(&self) -> Result<Appender, Error> {
        self.ensure_open()?;
        if !self.file.mode().is_writable() {
            return Err(Error::new(ErrorKind::Permission)
                .with_message("cannot append to a read-only pile")
                .with_path(self.file.path()));
        }
        if self
            .appender_claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::new(ErrorKind::Protocol)
                .with_message("only one appender is supported per pile")
                .with_path(self.file.path()));
        }
        Appender::new(Arc::clone(&self.file))
    }

    /// Hands out a fresh, independent reader starting at position 0.
    pub fn sequencer(&self) -> Result<Sequencer, Error> {
        self.ensure_open()?;
        Sequencer::new(Arc::clone(&self.file))
    }

    /// Current length of the backing file.
    pub fn file_len(&self) -> Result<u64, Error> {
        self.file.len()
    }

    pub fn region_size(&self) -> usize {
        self.file.region_size()
    }

    /// Idempotent; releases the mapped file. Appenders and sequencers created
    /// earlier keep their current region but cannot reserve new ones.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.file.close();
        }
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::new(ErrorKind::Protocol)
                .with_message("pile is closed")
                .with_path(self.file.path()));
        }
        Ok(())
    }
}

impl Drop for Pile {
    fn drop(&mut self) {
        self.close();
    }
}
