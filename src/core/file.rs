// Backing file open/init, lazy region mapping, and the growable region table.
//
// Hot-path reserve/release stays on atomic ref counts; the write lock covers
// only table growth and region creation, which amortize away per message.
use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use fs2::FileExt;
use libc::{EACCES, EPERM};
use memmap2::MmapOptions;
use tracing::debug;

use crate::core::error::{Error, ErrorKind};
use crate::core::frame::{LENGTH_FIELD_LEN, SENTINEL};
use crate::core::region::MappedRegion;

pub const DEFAULT_REGION_SIZE: usize = 4 << 20;
pub const REGION_SIZE_MULTIPLE: usize = 8;

const INITIAL_TABLE_LEN: usize = 2;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Mode {
    ReadOnly,
    ReadWrite,
    /// Discard any existing file contents on open.
    ReadWriteClear,
}

impl Mode {
    pub fn is_writable(self) -> bool {
        !matches!(self, Mode::ReadOnly)
    }
}

#[derive(Debug)]
pub struct MappedFile {
    file: File,
    path: PathBuf,
    mode: Mode,
    region_size: usize,
    closed: AtomicBool,
    regions: RwLock<Vec<Option<Arc<MappedRegion>>>>,
}

impl MappedFile {
    pub fn open(path: impl AsRef<Path>, mode: Mode, region_size: usize) -> Result<Self, Error> {
        if region_size == 0 || region_size % REGION_SIZE_MULTIPLE != 0 {
            return Err(Error::new(ErrorKind::Usage).with_message(format!(
                "region size must be positive and a multiple of {REGION_SIZE_MULTIPLE}, got {region_size}"
            )));
        }
        let path = path.as_ref().to_path_buf();
        let mut options = OpenOptions::new();
        options.read(true);
        if mode.is_writable() {
            options.write(true).create(true);
        }
        let file = options.open(&path).map_err(|err| {
            Error::new(open_error_kind(&err))
                .with_path(&path)
                .with_source(err)
        })?;

        init_file(&file, mode, &path)?;

        Ok(Self {
            file,
            path,
            mode,
            region_size,
            closed: AtomicBool::new(false),
            regions: RwLock::new(vec![None; INITIAL_TABLE_LEN]),
        })
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn region_size(&self) -> usize {
        self.region_size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> Result<u64, Error> {
        self.file
            .metadata()
            .map(|meta| meta.len())
            .map_err(|err| self.io_error(err))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Returns a usable region for `index` with its reference count bumped.
    ///
    /// The fast path is a shared-lock slot lookup plus a CAS acquire; creating
    /// or replacing a region (and growing the file so the region's byte range
    /// is backed by real storage) happens under the exclusive lock.
    pub fn reserve_region(&self, index: usize) -> Result<Arc<MappedRegion>, Error> {
        self.ensure_open()?;
        {
            let regions = read_lock(&self.regions);
            if let Some(Some(region)) = regions.get(index) {
                if region.try_acquire() {
                    return Ok(Arc::clone(region));
                }
            }
        }

        let mut regions = write_lock(&self.regions);
        self.ensure_open()?;
        if regions.len() <= index {
            let grown = (index + 1).max(regions.len() * 2);
            debug!(from = regions.len(), to = grown, "growing region table");
            regions.resize(grown, None);
        }
        if let Some(region) = &regions[index] {
            // Lost a race against another reservation; ride on its mapping.
            if region.try_acquire() {
                return Ok(Arc::clone(region));
            }
        }
        let region = self.map_region(index)?;
        regions[index] = Some(Arc::clone(&region));
        Ok(region)
    }

    /// Drops one reference; the region that hits zero is closed and its slot
    /// cleared, unless a replacement was installed concurrently.
    pub fn release_region(&self, region: &Arc<MappedRegion>) {
        if !region.release() {
            return;
        }
        let mut regions = write_lock(&self.regions);
        if let Some(slot) = regions.get_mut(region.index()) {
            if slot.as_ref().is_some_and(|held| Arc::ptr_eq(held, region)) {
                *slot = None;
                debug!(index = region.index(), "unmapped region");
            }
        }
    }

    /// Idempotent; later reservations fail and the table drops its mappings.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut regions = write_lock(&self.regions);
        for slot in regions.iter_mut() {
            *slot = None;
        }
        debug!(path = %self.path.display(), "closed mapped file");
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.is_closed() {
            return Err(Error::new(ErrorKind::Protocol)
                .with_message("mapped file is closed")
                .with_path(&self.path));
        }
        Ok(())
    }

    fn map_region(&self, index: usize) -> Result<Arc<MappedRegion>, Error> {
        let position = index as u64 * self.region_size as u64;
        let file_len = self.len()?;
        let writable = self.mode.is_writable();
        let size = if writable {
            let needed = position + self.region_size as u64;
            if needed > file_len {
                self.file.set_len(needed).map_err(|err| {
                    self.io_error(err)
                        .with_message(format!("could not grow file to {needed} bytes"))
                })?;
                debug!(len = needed, "grew backing file");
            }
            self.region_size
        } else {
            if position >= file_len {
                return Err(Error::new(ErrorKind::Io)
                    .with_message("region lies beyond the end of a read-only file")
                    .with_path(&self.path)
                    .with_offset(position));
            }
            (file_len - position).min(self.region_size as u64) as usize
        };

        let mut options = MmapOptions::new();
        options.offset(position).len(size);
        let map = unsafe {
            if writable {
                options.map_raw(&self.file)
            } else {
                options.map_raw_read_only(&self.file)
            }
        }
        .map_err(|err| {
            self.io_error(err)
                .with_message(format!("could not map region {index}"))
        })?;
        debug!(index, position, size, "mapped region");
        Ok(Arc::new(MappedRegion::new(
            map, index, position, size, writable,
        )))
    }

    fn io_error(&self, err: io::Error) -> Error {
        Error::new(ErrorKind::Io)
            .with_path(&self.path)
            .with_source(err)
    }
}

impl Drop for MappedFile {
    fn drop(&mut self) {
        self.close();
    }
}

/// Exclusive advisory lock held while the file header area is initialized, so
/// concurrent openers of the same path cannot interleave truncation with the
/// sentinel write.
struct InitLock<'a> {
    file: &'a File,
}

impl<'a> InitLock<'a> {
    fn acquire(file: &'a File, path: &Path) -> Result<Self, Error> {
        file.lock_exclusive().map_err(|err| {
            Error::new(lock_error_kind(&err))
                .with_path(path)
                .with_source(err)
        })?;
        Ok(Self { file })
    }
}

impl<'a> Drop for InitLock<'a> {
    fn drop(&mut self) {
        let _ = FileExt::unlock(self.file);
    }
}

fn init_file(file: &File, mode: Mode, path: &Path) -> Result<(), Error> {
    let _lock = InitLock::acquire(file, path)?;
    let len = file
        .metadata()
        .map(|meta| meta.len())
        .map_err(|err| Error::new(ErrorKind::Io).with_path(path).with_source(err))?;
    match mode {
        Mode::ReadOnly => {
            if len < LENGTH_FIELD_LEN as u64 {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message("file is too small to be a pile")
                    .with_path(path));
            }
        }
        Mode::ReadWrite => {
            if len < LENGTH_FIELD_LEN as u64 {
                reset_file(file, path)?;
            }
        }
        Mode::ReadWriteClear => reset_file(file, path)?,
    }
    Ok(())
}

/// Truncates and writes the empty-log sentinel as the first length word.
fn reset_file(file: &File, path: &Path) -> Result<(), Error> {
    let io_err = |err| Error::new(ErrorKind::Io).with_path(path).with_source(err);
    file.set_len(0).map_err(io_err)?;
    let mut file = file;
    file.seek(SeekFrom::Start(0)).map_err(io_err)?;
    file.write_all(&SENTINEL.to_ne_bytes()).map_err(io_err)?;
    file.flush().map_err(io_err)?;
    file.sync_data().map_err(io_err)?;
    Ok(())
}

fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

fn open_error_kind(err: &io::Error) -> ErrorKind {
    let errno = err.raw_os_error().unwrap_or_default();
    if errno == EACCES || errno == EPERM {
        return ErrorKind::Permission;
    }
    match err.kind() {
        io::ErrorKind::NotFound => ErrorKind::NotFound,
        io::ErrorKind::PermissionDenied => ErrorKind::Permission,
        _ => ErrorKind::Io,
    }
}

fn lock_error_kind(err: &io::Error) -> ErrorKind {
    let errno = err.raw_os_error().unwrap_or_default();
    if errno == EACCES || errno == EPERM {
        return ErrorKind::Permission;
    }
    match err.kind() {
        io::ErrorKind::WouldBlock => ErrorKind::Busy,
        io::ErrorKind::PermissionDenied => ErrorKind::Permission,
        _ => ErrorKind::Io,
    }
}
