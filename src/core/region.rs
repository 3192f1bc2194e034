// One mapped window of the backing file, shared via an explicit ref count.
//
// The count gates table residency in MappedFile: a region whose count reaches
// zero is closed for good and its slot is cleared; holders that still own an
// Arc keep the mapping itself alive until they drop it, so a load or store
// through a just-released region is never dangling.
use std::ptr;
use std::sync::atomic::{AtomicI64, Ordering};

use memmap2::MmapRaw;

use crate::core::error::{Error, ErrorKind};

#[derive(Debug)]
pub struct MappedRegion {
    index: usize,
    position: u64,
    size: usize,
    writable: bool,
    map: MmapRaw,
    refs: AtomicI64,
}

impl MappedRegion {
    pub(crate) fn new(
        map: MmapRaw,
        index: usize,
        position: u64,
        size: usize,
        writable: bool,
    ) -> Self {
        Self {
            index,
            position,
            size,
            writable,
            map,
            refs: AtomicI64::new(1),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Absolute byte offset of this region in the backing file.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Usable size: the region size, or the truncated remainder for the tail
    /// region of a read-only file that was never extended.
    pub fn size(&self) -> usize {
        self.size
    }

    /// A region is closed once its reference count has returned to zero; it is
    /// never resurrected, a fresh mapping takes over its table slot instead.
    pub fn is_closed(&self) -> bool {
        self.refs.load(Ordering::Acquire) == 0
    }

    /// Increments the reference count unless the region is already closed.
    pub(crate) fn try_acquire(&self) -> bool {
        let mut refs = self.refs.load(Ordering::Relaxed);
        loop {
            if refs == 0 {
                return false;
            }
            match self.refs.compare_exchange_weak(
                refs,
                refs + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(current) => refs = current,
            }
        }
    }

    /// Decrements the reference count; true on the 1 -> 0 transition, at which
    /// point the caller evicts the region from the table.
    pub(crate) fn release(&self) -> bool {
        self.refs.fetch_sub(1, Ordering::AcqRel) == 1
    }

    fn range_ptr(&self, offset: usize, len: usize) -> Result<*mut u8, Error> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => {
                // SAFETY: the range was checked against the mapped size.
                Ok(unsafe { self.map.as_mut_ptr().add(offset) })
            }
            _ => Err(Error::new(ErrorKind::Internal)
                .with_message(format!(
                    "region access out of bounds: {offset}+{len} exceeds {}",
                    self.size
                ))
                .with_offset(self.position + offset as u64)),
        }
    }

    fn ensure_writable(&self) -> Result<(), Error> {
        if self.writable {
            return Ok(());
        }
        Err(Error::new(ErrorKind::Permission)
            .with_message("cannot write through a read-only mapping")
            .with_offset(self.position))
    }

    pub fn read_bytes(&self, offset: usize, dst: &mut [u8]) -> Result<(), Error> {
        let src = self.range_ptr(offset, dst.len())?;
        // SAFETY: bounds checked; the mapping outlives self.
        unsafe { ptr::copy_nonoverlapping(src, dst.as_mut_ptr(), dst.len()) };
        Ok(())
    }

    pub fn write_bytes(&self, offset: usize, src: &[u8]) -> Result<(), Error> {
        self.ensure_writable()?;
        let dst = self.range_ptr(offset, src.len())?;
        // SAFETY: bounds checked; the mapping outlives self.
        unsafe { ptr::copy_nonoverlapping(src.as_ptr(), dst, src.len()) };
        Ok(())
    }

    pub fn fill_zero(&self, offset: usize, len: usize) -> Result<(), Error> {
        self.ensure_writable()?;
        let dst = self.range_ptr(offset, len)?;
        // SAFETY: bounds checked; the mapping outlives self.
        unsafe { ptr::write_bytes(dst, 0, len) };
        Ok(())
    }

    fn atomic_i64(&self, offset: usize) -> Result<&AtomicI64, Error> {
        if offset % 8 != 0 {
            return Err(Error::new(ErrorKind::Internal)
                .with_message("length word access is not 8-byte aligned")
                .with_offset(self.position + offset as u64));
        }
        let p = self.range_ptr(offset, 8)?;
        // SAFETY: the mapping is page-aligned and the region position is a
        // multiple of 8, so an 8-aligned offset yields an 8-aligned pointer.
        Ok(unsafe { &*(p as *const AtomicI64) })
    }

    /// Atomic load of the 8-byte word at `offset`, shared with other mappings
    /// of the same file range.
    pub fn load_i64(&self, offset: usize, ordering: Ordering) -> Result<i64, Error> {
        Ok(self.atomic_i64(offset)?.load(ordering))
    }

    /// Atomic store of the 8-byte word at `offset`. A release store here is
    /// the only publication point of the framing protocol.
    pub fn store_i64(&self, offset: usize, value: i64, ordering: Ordering) -> Result<(), Error> {
        self.ensure_writable()?;
        self.atomic_i64(offset)?.store(value, ordering);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::MappedRegion;
    use crate::core::error::ErrorKind;
    use memmap2::{MmapOptions, MmapRaw};
    use std::sync::atomic::Ordering;

    fn anon_region(size: usize) -> MappedRegion {
        let map = MmapOptions::new().len(size).map_anon().expect("map anon");
        MappedRegion::new(MmapRaw::from(map), 0, 0, size, true)
    }

    #[test]
    fn ref_count_closes_at_zero() {
        let region = anon_region(64);
        assert!(!region.is_closed());
        assert!(region.try_acquire());
        assert!(!region.release());
        assert!(region.release());
        assert!(region.is_closed());
        assert!(!region.try_acquire());
    }

    #[test]
    fn bytes_round_trip_within_bounds() {
        let region = anon_region(64);
        region.write_bytes(8, b"pile").expect("write");
        let mut buf = [0u8; 4];
        region.read_bytes(8, &mut buf).expect("read");
        assert_eq!(&buf, b"pile");
    }

    #[test]
    fn out_of_bounds_access_is_rejected() {
        let region = anon_region(64);
        let mut buf = [0u8; 16];
        let err = region.read_bytes(56, &mut buf).expect_err("should fail");
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[test]
    fn length_word_requires_alignment() {
        let region = anon_region(64);
        let err = region
            .load_i64(4, Ordering::Acquire)
            .expect_err("should fail");
        assert_eq!(err.kind(), ErrorKind::Internal);
        region.store_i64(16, -1, Ordering::Release).expect("store");
        assert_eq!(region.load_i64(16, Ordering::Acquire).expect("load"), -1);
    }

    #[test]
    fn zero_fill_clears_span() {
        let region = anon_region(64);
        region.write_bytes(0, &[0xFF; 16]).expect("write");
        region.fill_zero(4, 8).expect("fill");
        let mut buf = [0u8; 16];
        region.read_bytes(0, &mut buf).expect("read");
        assert_eq!(&buf[..4], &[0xFF; 4]);
        assert_eq!(&buf[4..12], &[0u8; 8]);
        assert_eq!(&buf[12..], &[0xFF; 4]);
    }
}
