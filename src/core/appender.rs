// The single writer of a pile: record framing and typed field puts.
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::core::error::{Error, ErrorKind};
use crate::core::file::MappedFile;
use crate::core::frame::{self, LENGTH_FIELD_LEN, SENTINEL};
use crate::core::pointer::RollingRegionPointer;
use crate::core::region::MappedRegion;

#[derive(Debug)]
pub struct Appender {
    file: Arc<MappedFile>,
    ptr: RollingRegionPointer,
}

impl Appender {
    /// Positions the writer after the last published frame, so appending to a
    /// reopened file resumes instead of overwriting.
    pub(crate) fn new(file: Arc<MappedFile>) -> Result<Self, Error> {
        let mut ptr = RollingRegionPointer::new(Arc::clone(&file))?;
        skip_existing_messages(&mut ptr)?;
        Ok(Self { file, ptr })
    }

    /// Starts a frame: the length slot is reserved (still holding the
    /// sentinel) and the cursor moves to the payload. The returned writer
    /// borrows the appender, so a second start before finishing is
    /// unrepresentable.
    pub fn append_message(&mut self) -> Result<MessageWriter<'_>, Error> {
        let start = self.ptr.retain_current()?;
        if let Err(err) = self.ptr.advance(LENGTH_FIELD_LEN, false) {
            self.file.release_region(&start.0);
            return Err(err);
        }
        Ok(MessageWriter {
            appender: self,
            start: Some(start),
        })
    }

    /// Absolute write position (next frame's length slot when idle).
    pub fn position(&self) -> Result<u64, Error> {
        self.ptr.position()
    }

    /// Releases the write cursor; the appender is unusable afterwards.
    pub fn close(&mut self) {
        self.ptr.close();
    }
}

fn skip_existing_messages(ptr: &mut RollingRegionPointer) -> Result<(), Error> {
    loop {
        let length = ptr.load_i64(Ordering::Acquire)?;
        if length < 0 {
            return Ok(());
        }
        let end = ptr.position()? + LENGTH_FIELD_LEN as u64 + length as u64;
        ptr.move_to_position(end)?;
        frame::skip_padding(ptr)?;
    }
}

/// Field writer for one in-flight message. Values land directly in the mapped
/// region with no intermediate buffering; the frame becomes visible to
/// readers only when `finish_append_message` publishes the length. Dropping
/// an unfinished writer finishes it best-effort.
pub struct MessageWriter<'a> {
    appender: &'a mut Appender,
    start: Option<(Arc<MappedRegion>, usize)>,
}

impl<'a> MessageWriter<'a> {
    fn put_raw(&mut self, bytes: &[u8]) -> Result<(), Error> {
        let (region, offset) = self.appender.ptr.advance(bytes.len(), true)?;
        region.write_bytes(offset, bytes)
    }

    pub fn put_bool(&mut self, value: bool) -> Result<&mut Self, Error> {
        self.put_raw(&[value as u8])?;
        Ok(self)
    }

    pub fn put_i8(&mut self, value: i8) -> Result<&mut Self, Error> {
        self.put_raw(&value.to_ne_bytes())?;
        Ok(self)
    }

    pub fn put_i16(&mut self, value: i16) -> Result<&mut Self, Error> {
        self.put_raw(&value.to_ne_bytes())?;
        Ok(self)
    }

    pub fn put_i32(&mut self, value: i32) -> Result<&mut Self, Error> {
        self.put_raw(&value.to_ne_bytes())?;
        Ok(self)
    }

    pub fn put_i64(&mut self, value: i64) -> Result<&mut Self, Error> {
        self.put_raw(&value.to_ne_bytes())?;
        Ok(self)
    }

    pub fn put_f32(&mut self, value: f32) -> Result<&mut Self, Error> {
        self.put_raw(&value.to_ne_bytes())?;
        Ok(self)
    }

    pub fn put_f64(&mut self, value: f64) -> Result<&mut Self, Error> {
        self.put_raw(&value.to_ne_bytes())?;
        Ok(self)
    }

    /// Writes the Unicode scalar value as 4 bytes.
    pub fn put_char(&mut self, value: char) -> Result<&mut Self, Error> {
        self.put_raw(&(value as u32).to_ne_bytes())?;
        Ok(self)
    }

    pub fn put_char_ascii(&mut self, value: char) -> Result<&mut Self, Error> {
        if !value.is_ascii() {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!("character {value:?} is not ASCII")));
        }
        self.put_raw(&[value as u8])?;
        Ok(self)
    }

    /// Writes a raw byte span with no length prefix; spans chunk at region
    /// boundaries and never insert padding.
    pub fn put_bytes(&mut self, bytes: &[u8]) -> Result<&mut Self, Error> {
        let mut rest = bytes;
        while !rest.is_empty() {
            let room = self.appender.ptr.remaining()?;
            let n = room.min(rest.len());
            let (region, offset) = self.appender.ptr.advance(n, false)?;
            region.write_bytes(offset, &rest[..n])?;
            rest = &rest[n..];
        }
        Ok(self)
    }

    /// 4-byte length prefix followed by the ASCII bytes.
    pub fn put_string_ascii(&mut self, value: &str) -> Result<&mut Self, Error> {
        if !value.is_ascii() {
            return Err(Error::new(ErrorKind::Usage).with_message("string is not ASCII"));
        }
        self.put_length_prefixed(value.as_bytes())
    }

    /// 2-byte length prefix followed by the UTF-8 bytes.
    pub fn put_string_utf8(&mut self, value: &str) -> Result<&mut Self, Error> {
        let bytes = value.as_bytes();
        if bytes.len() > u16::MAX as usize {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("string exceeds the 2-byte length prefix"));
        }
        self.put_raw(&(bytes.len() as u16).to_ne_bytes())?;
        self.put_bytes(bytes)?;
        Ok(self)
    }

    /// 4-byte length prefix followed by the UTF-8 bytes.
    pub fn put_string(&mut self, value: &str) -> Result<&mut Self, Error> {
        self.put_length_prefixed(value.as_bytes())
    }

    fn put_length_prefixed(&mut self, bytes: &[u8]) -> Result<&mut Self, Error> {
        if bytes.len() > i32::MAX as usize {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("string exceeds the 4-byte length prefix"));
        }
        self.put_i32(bytes.len() as i32)?;
        self.put_bytes(bytes)?;
        Ok(self)
    }

    /// Publishes the frame: pads to alignment, plants the next sentinel, then
    /// release-stores the payload length at the reserved slot. The length
    /// store is the single moment the message becomes visible to readers.
    pub fn finish_append_message(mut self) -> Result<(), Error> {
        self.finish_inner()
    }

    fn finish_inner(&mut self) -> Result<(), Error> {
        let Some((start_region, start_offset)) = self.start.take() else {
            return Err(Error::new(ErrorKind::Protocol).with_message("no message to finish"));
        };
        let ptr = &mut self.appender.ptr;
        let end = ptr.position()?;
        let payload_start =
            start_region.position() + start_offset as u64 + LENGTH_FIELD_LEN as u64;
        let payload_len = end - payload_start;

        let result = frame::write_padding(ptr)
            .and_then(|_| ptr.store_i64(SENTINEL, Ordering::Release))
            .and_then(|_| {
                start_region.store_i64(start_offset, payload_len as i64, Ordering::Release)
            });
        self.appender.file.release_region(&start_region);
        result
    }
}

impl<'a> Drop for MessageWriter<'a> {
    fn drop(&mut self) {
        if self.start.is_some() {
            let _ = self.finish_inner();
        }
    }
}
