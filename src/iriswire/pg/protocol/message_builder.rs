use bytes::{BufMut, Bytes, BytesMut};

use crate::iriswire::pg::protocol::Tag;

/// Builds one or more backend messages into a single buffer, patching each
/// length frame when the next message starts or the builder finishes.
pub struct MessageBuilder {
    data: BytesMut,
    start: usize, // start position of current message being built
}

impl MessageBuilder {
    pub fn new(tag: Tag) -> Self {
        let mut builder = MessageBuilder {
            data: BytesMut::with_capacity(256), // typically we build short messages
            start: 0,
        };
        builder.begin(tag);
        builder
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Start another message in the same buffer.
    pub fn add_new(&mut self, tag: Tag) {
        self.begin(tag);
    }

    fn begin(&mut self, tag: Tag) {
        let len = self.data.len();
        if len != 0 {
            self.complete_message();
            self.start = len;
        }
        debug_assert_ne!(tag, Tag::UNTAGGED, "backend messages are always tagged");
        self.data.put_u8(tag.as_u8());
        self.data.put_i32(0);
    }

    fn complete_message(&mut self) {
        // length frame excludes the tag byte but includes itself
        let len = (self.data.len() - self.start - 1) as i32;
        let pos = self.start + 1;
        self.data[pos..pos + 4].copy_from_slice(&len.to_be_bytes());
    }

    pub fn finish(mut self) -> Bytes {
        self.complete_message();
        self.data.freeze()
    }

    pub fn write_byte(&mut self, b: u8) {
        self.data.put_u8(b);
    }

    /// Write a NUL-terminated string.
    pub fn write_str(&mut self, s: &str) {
        self.write_bytes(s.as_bytes());
        self.write_byte(0);
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    pub fn write_i16(&mut self, i: i16) {
        self.data.put_i16(i);
    }

    pub fn write_i32(&mut self, i: i32) {
        self.data.put_i32(i);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_message_framing() {
        let mut mb = MessageBuilder::new(Tag::READY_FOR_QUERY);
        mb.write_byte(b'I');
        let buf = mb.finish();
        assert_eq!(&buf[..], &[b'Z', 0, 0, 0, 5, b'I']);
    }

    #[test]
    fn test_chained_messages() {
        let mut mb = MessageBuilder::new(Tag::COMMAND_COMPLETE);
        mb.write_str("BEGIN");
        mb.add_new(Tag::READY_FOR_QUERY);
        mb.write_byte(b'T');
        let buf = mb.finish();
        // CommandComplete: C len=4+6 "BEGIN\0", then ReadyForQuery
        assert_eq!(buf[0], b'C');
        assert_eq!(i32::from_be_bytes(buf[1..5].try_into().unwrap()), 10);
        assert_eq!(&buf[5..11], b"BEGIN\0");
        assert_eq!(buf[11], b'Z');
        assert_eq!(i32::from_be_bytes(buf[12..16].try_into().unwrap()), 5);
        assert_eq!(buf[16], b'T');
    }
}
