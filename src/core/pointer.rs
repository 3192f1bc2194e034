// Cursor over consecutive regions of one MappedFile.
//
// The pointer owns one region reference at a time and rolls forward when an
// advance crosses the region boundary; it never moves backwards across one.
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::core::error::{Error, ErrorKind};
use crate::core::file::MappedFile;
use crate::core::region::MappedRegion;

#[derive(Debug)]
pub struct RollingRegionPointer {
    file: Arc<MappedFile>,
    region: Option<Arc<MappedRegion>>,
    offset: usize,
}

impl RollingRegionPointer {
    /// Binds to region 0, reserving it immediately.
    pub fn new(file: Arc<MappedFile>) -> Result<Self, Error> {
        let region = file.reserve_region(0)?;
        Ok(Self {
            file,
            region: Some(region),
            offset: 0,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.region.is_none()
    }

    fn region(&self) -> Result<&Arc<MappedRegion>, Error> {
        self.region.as_ref().ok_or_else(|| {
            Error::new(ErrorKind::Protocol).with_message("pointer has already been closed")
        })
    }

    /// Absolute position in the backing file.
    pub fn position(&self) -> Result<u64, Error> {
        Ok(self.region()?.position() + self.offset as u64)
    }

    /// Bytes left in the current region; always at least 1 while open.
    pub fn remaining(&self) -> Result<usize, Error> {
        Ok(self.region()?.size() - self.offset)
    }

    /// Claims the next `n` bytes and returns their (region, offset) slot.
    ///
    /// Crossing the region boundary releases the current region and reserves
    /// the next one. An overshoot with `pad_on_roll` zero-fills the old
    /// region's remainder first, so no write silently wraps mid-value; an
    /// exact landing returns the old region's slot (its Arc keeps the mapping
    /// alive) with the cursor already in the next region.
    pub fn advance(
        &mut self,
        n: usize,
        pad_on_roll: bool,
    ) -> Result<(Arc<MappedRegion>, usize), Error> {
        let region = Arc::clone(self.region()?);
        let offset = self.offset;
        let new_offset = offset + n;
        let size = region.size();
        if new_offset < size {
            self.offset = new_offset;
            return Ok((region, offset));
        }
        // An overshoot lands at offset `n` in the next region, so `n` must
        // leave the cursor strictly inside it. Callers chunk larger spans.
        if new_offset > size && n >= size {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!(
                    "cannot advance {n} bytes across a {size}-byte region"
                ))
                .with_offset(region.position() + offset as u64));
        }
        if pad_on_roll && new_offset > size {
            region.fill_zero(offset, size - offset)?;
        }
        self.roll()?;
        if new_offset == size {
            return Ok((region, offset));
        }
        self.offset = n;
        Ok((Arc::clone(self.region()?), 0))
    }

    /// Rolls forward across as many region boundaries as needed and lands the
    /// offset consistently with the new region's base. Backward moves across
    /// a region boundary are not supported.
    pub fn move_to_position(&mut self, position: u64) -> Result<(), Error> {
        if position < self.region()?.position() {
            return Err(Error::new(ErrorKind::Protocol)
                .with_message("cannot move pointer backwards across regions")
                .with_offset(position));
        }
        loop {
            let region = self.region()?;
            if position - region.position() < region.size() as u64 {
                self.offset = (position - region.position()) as usize;
                return Ok(());
            }
            self.roll()?;
        }
    }

    /// Atomic load of the 8-byte word at the cursor, without advancing.
    pub fn load_i64(&self, ordering: Ordering) -> Result<i64, Error> {
        self.region()?.load_i64(self.offset, ordering)
    }

    /// Atomic store of the 8-byte word at the cursor, without advancing.
    pub fn store_i64(&self, value: i64, ordering: Ordering) -> Result<(), Error> {
        self.region()?.store_i64(self.offset, value, ordering)
    }

    /// Takes an extra table reference on the current region and returns its
    /// slot; the caller releases it through the file when done.
    pub fn retain_current(&self) -> Result<(Arc<MappedRegion>, usize), Error> {
        let region = self.region()?;
        if !region.try_acquire() {
            // The pointer itself holds a reference, so the count cannot be 0.
            return Err(Error::new(ErrorKind::Internal)
                .with_message("current region unexpectedly closed"));
        }
        Ok((Arc::clone(region), self.offset))
    }

    fn roll(&mut self) -> Result<(), Error> {
        let region = self.region.take().ok_or_else(|| {
            Error::new(ErrorKind::Protocol).with_message("pointer has already been closed")
        })?;
        let next = region.index() + 1;
        self.file.release_region(&region);
        self.region = Some(self.file.reserve_region(next)?);
        self.offset = 0;
        Ok(())
    }

    /// Releases the held region exactly once; the pointer is unusable after.
    pub fn close(&mut self) {
        if let Some(region) = self.region.take() {
            self.file.release_region(&region);
        }
    }
}

impl Drop for RollingRegionPointer {
    fn drop(&mut self) {
        self.close();
    }
}
