use bytes::{Buf, Bytes, BytesMut};

use crate::iriswire::pg::protocol::Tag;
use crate::iriswire::{Error, Result};

pub const MIN_MESSAGE_LEN: u32 = 5;

/// Header of a tagged frontend message: one tag byte and a 4-byte
/// big-endian length that includes itself but not the tag.
pub struct Header {
    pub tag: Tag,
    pub length: u32,
}

impl Header {
    /// Parse a header from the front of bytes. Returns None if fewer than
    /// MIN_MESSAGE_LEN bytes are available yet.
    pub fn parse(bytes: &[u8]) -> Result<Option<Self>> {
        if (bytes.len() as u32) < MIN_MESSAGE_LEN {
            return Ok(None);
        }
        let tag = Tag::new_frontend(bytes[0])?;
        let len = u32::from_be_bytes(bytes[1..5].try_into()?);
        if len < 4 {
            return Err(Error::protocol_error(
                "length of message frame cannot be < 4",
            ));
        }
        Ok(Some(Header { tag, length: len }))
    }

    /// Total message length on the wire including the tag byte.
    pub fn total_len(&self) -> u32 {
        self.length + 1
    }
}

/// A complete framed message as received from the client.
pub struct Message {
    data: Bytes, // tag byte, length, payload
}

impl Message {
    pub fn new(buf: Bytes) -> Self {
        debug_assert!(buf.len() >= MIN_MESSAGE_LEN as usize);
        Message { data: buf }
    }

    pub fn tag(&self) -> Tag {
        Tag::new_unchecked(self.data[0])
    }

    /// len returns the length of the Message including tag byte and length frame
    pub fn len(&self) -> u32 {
        self.data.len() as u32
    }

    pub fn body(&self) -> &[u8] {
        &self.data[MIN_MESSAGE_LEN as usize..]
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Bytes {
        self.data
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("tag", &self.tag())
            .field("len", &self.len())
            .finish()
    }
}

/// Incremental parser accumulating socket reads and splitting off
/// complete framed messages.
pub struct MessageParser {
    data: BytesMut,
}

impl MessageParser {
    pub fn new(recv_buffer_size: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(recv_buffer_size),
        }
    }

    pub fn next(&mut self) -> Result<Option<Message>> {
        match Header::parse(self.data.chunk())? {
            None => Ok(None),
            Some(hdr) => {
                let msg_len = hdr.total_len();
                if msg_len <= self.data.len() as u32 {
                    // We have the full message, split it off and return it
                    let msg = Message::new(self.data.split_to(msg_len as usize).freeze());
                    Ok(Some(msg))
                } else {
                    // We don't have the message, make sure buffer is large enough for it
                    self.data.reserve(msg_len as usize - self.data.len());
                    Ok(None)
                }
            }
        }
    }

    pub fn bytes_mut(&mut self) -> &mut BytesMut {
        &mut self.data
    }
}
