// Independent reader cursor over a pile: non-blocking polling and typed gets.
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::core::error::{Error, ErrorKind};
use crate::core::file::MappedFile;
use crate::core::frame::{self, LENGTH_FIELD_LEN};
use crate::core::pointer::RollingRegionPointer;
use crate::core::region::MappedRegion;

#[derive(Debug)]
pub struct Sequencer {
    file: Arc<MappedFile>,
    ptr: RollingRegionPointer,
}

impl Sequencer {
    pub(crate) fn new(file: Arc<MappedFile>) -> Result<Self, Error> {
        let ptr = RollingRegionPointer::new(Arc::clone(&file))?;
        Ok(Self { file, ptr })
    }

    /// Polls the length word at the read position. `false` means not yet
    /// available; callers spin or come back later, the cursor does not move.
    pub fn has_next_message(&mut self) -> Result<bool, Error> {
        Ok(self.ptr.load_i64(Ordering::Acquire)? >= 0)
    }

    /// Consumes the length word and returns a reader bounded by the published
    /// payload length. Fails with a protocol error when no message is ready.
    pub fn read_next_message(&mut self) -> Result<MessageReader<'_>, Error> {
        let length = self.ptr.load_i64(Ordering::Acquire)?;
        if length < 0 {
            return Err(Error::new(ErrorKind::Protocol)
                .with_message("no next message found")
                .with_offset(self.ptr.position()?));
        }
        // A published frame always lies within the file: the writer grows it
        // before the length store. Anything past the end is corruption, and
        // following it would grow the file on a writable pile.
        let position = self.ptr.position()?;
        let end = position + LENGTH_FIELD_LEN as u64 + length as u64;
        if end > self.file.len()? {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message(format!(
                    "published length {length} runs past the end of the file"
                ))
                .with_offset(position));
        }
        self.ptr.advance(LENGTH_FIELD_LEN, false)?;
        Ok(MessageReader {
            sequencer: self,
            end,
            finished: false,
        })
    }

    /// Read plus immediate finish, without field access.
    pub fn skip_next_message(&mut self) -> Result<(), Error> {
        self.read_next_message()?.finish_read_message()
    }

    /// Absolute read position (the next frame's length slot when idle).
    pub fn position(&self) -> Result<u64, Error> {
        self.ptr.position()
    }

    /// Releases the read cursor; the sequencer is unusable afterwards.
    pub fn close(&mut self) {
        self.ptr.close();
    }
}

/// Field reader for one published message. Every get is bounds-checked
/// against the frame end; dropping the reader finishes the message.
#[derive(Debug)]
pub struct MessageReader<'a> {
    sequencer: &'a mut Sequencer,
    end: u64,
    finished: bool,
}

impl<'a> MessageReader<'a> {
    /// Payload bytes left before the frame end.
    pub fn bytes_remaining(&self) -> Result<u64, Error> {
        Ok(self.end - self.sequencer.ptr.position()?)
    }

    fn take_raw(&mut self, n: usize) -> Result<(Arc<MappedRegion>, usize), Error> {
        let position = self.sequencer.ptr.position()?;
        if position + n as u64 > self.end {
            return Err(Error::new(ErrorKind::Protocol)
                .with_message(format!(
                    "attempt to read beyond message end: {} > {}",
                    position + n as u64,
                    self.end
                ))
                .with_offset(position));
        }
        self.sequencer.ptr.advance(n, false)
    }

    fn get_raw<const N: usize>(&mut self) -> Result<[u8; N], Error> {
        let (region, offset) = self.take_raw(N)?;
        let mut buf = [0u8; N];
        region.read_bytes(offset, &mut buf)?;
        Ok(buf)
    }

    pub fn get_bool(&mut self) -> Result<bool, Error> {
        Ok(self.get_raw::<1>()?[0] != 0)
    }

    pub fn get_i8(&mut self) -> Result<i8, Error> {
        Ok(i8::from_ne_bytes(self.get_raw()?))
    }

    pub fn get_i16(&mut self) -> Result<i16, Error> {
        Ok(i16::from_ne_bytes(self.get_raw()?))
    }

    pub fn get_i32(&mut self) -> Result<i32, Error> {
        Ok(i32::from_ne_bytes(self.get_raw()?))
    }

    pub fn get_i64(&mut self) -> Result<i64, Error> {
        Ok(i64::from_ne_bytes(self.get_raw()?))
    }

    pub fn get_f32(&mut self) -> Result<f32, Error> {
        Ok(f32::from_ne_bytes(self.get_raw()?))
    }

    pub fn get_f64(&mut self) -> Result<f64, Error> {
        Ok(f64::from_ne_bytes(self.get_raw()?))
    }

    pub fn get_char(&mut self) -> Result<char, Error> {
        let code = u32::from_ne_bytes(self.get_raw()?);
        char::from_u32(code).ok_or_else(|| {
            Error::new(ErrorKind::Corrupt)
                .with_message(format!("invalid character code point {code:#x}"))
        })
    }

    pub fn get_char_ascii(&mut self) -> Result<char, Error> {
        let byte = self.get_raw::<1>()?[0];
        if !byte.is_ascii() {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message(format!("invalid ASCII character byte {byte:#x}")));
        }
        Ok(byte as char)
    }

    /// Fills `dst` from the payload; spans chunk at region boundaries the same
    /// way the writer's `put_bytes` does.
    pub fn get_bytes(&mut self, dst: &mut [u8]) -> Result<(), Error> {
        let position = self.sequencer.ptr.position()?;
        if position + dst.len() as u64 > self.end {
            return Err(Error::new(ErrorKind::Protocol)
                .with_message(format!(
                    "attempt to read beyond message end: {} > {}",
                    position + dst.len() as u64,
                    self.end
                ))
                .with_offset(position));
        }
        let mut rest = dst;
        while !rest.is_empty() {
            let room = self.sequencer.ptr.remaining()?;
            let n = room.min(rest.len());
            let (region, offset) = self.sequencer.ptr.advance(n, false)?;
            let (chunk, tail) = rest.split_at_mut(n);
            region.read_bytes(offset, chunk)?;
            rest = tail;
        }
        Ok(())
    }

    pub fn get_string_ascii(&mut self) -> Result<String, Error> {
        let bytes = self.get_length_prefixed()?;
        if !bytes.is_ascii() {
            return Err(
                Error::new(ErrorKind::Corrupt).with_message("stored string is not ASCII")
            );
        }
        String::from_utf8(bytes)
            .map_err(|err| Error::new(ErrorKind::Corrupt).with_source(err))
    }

    pub fn get_string_utf8(&mut self) -> Result<String, Error> {
        let length = u16::from_ne_bytes(self.get_raw()?) as usize;
        self.ensure_length_fits(length as u64)?;
        let mut bytes = vec![0u8; length];
        self.get_bytes(&mut bytes)?;
        String::from_utf8(bytes).map_err(|err| {
            Error::new(ErrorKind::Corrupt)
                .with_message("stored string is not valid UTF-8")
                .with_source(err)
        })
    }

    pub fn get_string(&mut self) -> Result<String, Error> {
        let bytes = self.get_length_prefixed()?;
        String::from_utf8(bytes).map_err(|err| {
            Error::new(ErrorKind::Corrupt)
                .with_message("stored string is not valid UTF-8")
                .with_source(err)
        })
    }

    fn get_length_prefixed(&mut self) -> Result<Vec<u8>, Error> {
        let length = self.get_i32()?;
        if length < 0 {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message(format!("negative string length {length}")));
        }
        self.ensure_length_fits(length as u64)?;
        let mut bytes = vec![0u8; length as usize];
        self.get_bytes(&mut bytes)?;
        Ok(bytes)
    }

    /// Stored length prefixes come off the mapped file and must fit inside
    /// the frame before they are trusted as an allocation size.
    fn ensure_length_fits(&self, length: u64) -> Result<(), Error> {
        let remaining = self.bytes_remaining()?;
        if length > remaining {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message(format!(
                    "stored string length {length} exceeds the {remaining} bytes \
                     left in the message"
                )));
        }
        Ok(())
    }

    /// Advances past the frame (payload end plus the trailing pad) and re-arms
    /// the sequencer for the next poll.
    pub fn finish_read_message(mut self) -> Result<(), Error> {
        self.finish_inner()
    }

    fn finish_inner(&mut self) -> Result<(), Error> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        self.sequencer.ptr.move_to_position(self.end)?;
        frame::skip_padding(&mut self.sequencer.ptr)
    }
}

impl<'a> Drop for MessageReader<'a> {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.finish_inner();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Sequencer;
    use crate::core::appender::Appender;
    use crate::core::error::ErrorKind;
    use crate::core::file::{MappedFile, Mode};
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    fn open_file(dir: &tempfile::TempDir, region_size: usize) -> Arc<MappedFile> {
        let path = dir.path().join("log.pile");
        Arc::new(MappedFile::open(path, Mode::ReadWriteClear, region_size).expect("open"))
    }

    #[test]
    fn empty_pile_has_no_next_message() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = open_file(&dir, 64);
        let mut sequencer = Sequencer::new(file).expect("sequencer");
        assert!(!sequencer.has_next_message().expect("poll"));
        assert!(!sequencer.has_next_message().expect("poll again"));
        assert_eq!(sequencer.position().expect("position"), 0);
    }

    #[test]
    fn read_without_message_is_a_protocol_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = open_file(&dir, 64);
        let mut sequencer = Sequencer::new(file).expect("sequencer");
        let err = sequencer.read_next_message().expect_err("should fail");
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[test]
    fn typed_fields_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = open_file(&dir, 64);
        let mut appender = Appender::new(Arc::clone(&file)).expect("appender");
        let mut writer = appender.append_message().expect("start");
        writer
            .put_bool(true)
            .and_then(|w| w.put_i8(-5))
            .and_then(|w| w.put_i16(300))
            .and_then(|w| w.put_i32(-70_000))
            .and_then(|w| w.put_i64(1 << 40))
            .and_then(|w| w.put_f32(1.5))
            .and_then(|w| w.put_f64(-2.25))
            .and_then(|w| w.put_char('\u{1F4E6}'))
            .and_then(|w| w.put_char_ascii('z'))
            .and_then(|w| w.put_string_ascii("rates"))
            .and_then(|w| w.put_string_utf8("höhe"))
            .and_then(|w| w.put_string("payloads"))
            .expect("puts");
        writer.finish_append_message().expect("finish");

        let mut sequencer = Sequencer::new(file).expect("sequencer");
        assert!(sequencer.has_next_message().expect("poll"));
        let mut reader = sequencer.read_next_message().expect("read");
        assert!(reader.get_bool().expect("bool"));
        assert_eq!(reader.get_i8().expect("i8"), -5);
        assert_eq!(reader.get_i16().expect("i16"), 300);
        assert_eq!(reader.get_i32().expect("i32"), -70_000);
        assert_eq!(reader.get_i64().expect("i64"), 1 << 40);
        assert_eq!(reader.get_f32().expect("f32"), 1.5);
        assert_eq!(reader.get_f64().expect("f64"), -2.25);
        assert_eq!(reader.get_char().expect("char"), '\u{1F4E6}');
        assert_eq!(reader.get_char_ascii().expect("ascii"), 'z');
        assert_eq!(reader.get_string_ascii().expect("ascii str"), "rates");
        assert_eq!(reader.get_string_utf8().expect("utf8 str"), "höhe");
        assert_eq!(reader.get_string().expect("string"), "payloads");
        reader.finish_read_message().expect("finish");
        assert!(!sequencer.has_next_message().expect("drained"));
    }

    #[test]
    fn reads_beyond_the_frame_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = open_file(&dir, 64);
        let mut appender = Appender::new(Arc::clone(&file)).expect("appender");
        let mut writer = appender.append_message().expect("start");
        writer.put_i32(9).expect("put");
        writer.finish_append_message().expect("finish");

        let mut sequencer = Sequencer::new(file).expect("sequencer");
        let mut reader = sequencer.read_next_message().expect("read");
        assert_eq!(reader.get_i32().expect("i32"), 9);
        let err = reader.get_i32().expect_err("past end");
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[test]
    fn string_prefix_larger_than_the_frame_is_corrupt() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = open_file(&dir, 64);
        let mut appender = Appender::new(Arc::clone(&file)).expect("appender");
        let mut writer = appender.append_message().expect("start");
        // A bare prefix claiming 2 GiB of payload that is not there.
        writer.put_i32(i32::MAX).expect("forged prefix");
        writer.finish_append_message().expect("finish");

        let mut sequencer = Sequencer::new(file).expect("sequencer");
        let mut reader = sequencer.read_next_message().expect("read");
        let err = reader.get_string().expect_err("oversized prefix");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
    }

    #[test]
    fn utf8_prefix_larger_than_the_frame_is_corrupt() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = open_file(&dir, 64);
        let mut appender = Appender::new(Arc::clone(&file)).expect("appender");
        let mut writer = appender.append_message().expect("start");
        // 0xFFFF reads back as a 65535-byte prefix with an empty payload.
        writer.put_i16(-1).expect("forged prefix");
        writer.finish_append_message().expect("finish");

        let mut sequencer = Sequencer::new(file).expect("sequencer");
        let mut reader = sequencer.read_next_message().expect("read");
        let err = reader.get_string_utf8().expect_err("oversized prefix");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
    }

    #[test]
    fn corrupt_length_word_is_rejected_without_growing_the_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = open_file(&dir, 64);
        {
            let region = file.reserve_region(0).expect("reserve");
            region
                .store_i64(0, 1 << 40, Ordering::Release)
                .expect("forge length");
            file.release_region(&region);
        }

        let mut sequencer = Sequencer::new(Arc::clone(&file)).expect("sequencer");
        assert!(sequencer.has_next_message().expect("poll"));
        let err = sequencer.read_next_message().expect_err("corrupt length");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
        assert_eq!(file.len().expect("len"), 64);
    }

    #[test]
    fn skip_leaves_the_cursor_on_the_next_frame() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = open_file(&dir, 64);
        let mut appender = Appender::new(Arc::clone(&file)).expect("appender");
        for value in [10i64, 20, 30] {
            let mut writer = appender.append_message().expect("start");
            writer.put_i64(value).expect("put");
            writer.finish_append_message().expect("finish");
        }

        let mut sequencer = Sequencer::new(file).expect("sequencer");
        sequencer.skip_next_message().expect("skip");
        let mut reader = sequencer.read_next_message().expect("read");
        assert_eq!(reader.get_i64().expect("i64"), 20);
        reader.finish_read_message().expect("finish");
        sequencer.skip_next_message().expect("skip last");
        assert!(!sequencer.has_next_message().expect("drained"));
    }

    #[test]
    fn dropping_a_reader_finishes_the_message() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = open_file(&dir, 64);
        let mut appender = Appender::new(Arc::clone(&file)).expect("appender");
        for value in [1i32, 2] {
            let mut writer = appender.append_message().expect("start");
            writer.put_i32(value).expect("put");
            writer.finish_append_message().expect("finish");
        }

        let mut sequencer = Sequencer::new(file).expect("sequencer");
        drop(sequencer.read_next_message().expect("read"));
        let mut reader = sequencer.read_next_message().expect("read next");
        assert_eq!(reader.get_i32().expect("i32"), 2);
    }

    #[test]
    fn sequencers_do_not_share_positions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = open_file(&dir, 64);
        let mut appender = Appender::new(Arc::clone(&file)).expect("appender");
        let mut writer = appender.append_message().expect("start");
        writer.put_i64(99).expect("put");
        writer.finish_append_message().expect("finish");

        let mut first = Sequencer::new(Arc::clone(&file)).expect("first");
        let mut second = Sequencer::new(file).expect("second");
        first.skip_next_message().expect("skip");
        assert!(!first.has_next_message().expect("first drained"));
        assert!(second.has_next_message().expect("second still sees it"));
    }
}
