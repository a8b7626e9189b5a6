use crate::iriswire::pg::protocol::Message;
use crate::iriswire::{Error, Result};

/// A reader for reading the content of a Postgres wire protocol message sequentially.
pub struct MessageReader<'a> {
    msg: &'a Message,
    pos: usize,
    read_past_end: bool, // true if we tried to read past the end of the message
}

impl<'a> MessageReader<'a> {
    /// Create a new Reader positioned at the start of the message body.
    pub fn new(msg: &'a Message) -> Self {
        MessageReader {
            msg,
            pos: 5,
            read_past_end: false,
        }
    }

    pub fn len(&self) -> usize {
        self.msg.as_slice().len()
    }

    /// Returns an Error if has_error() is true
    pub fn error(&self) -> Result<()> {
        if self.has_error() {
            Err(Error::protocol_error(format!(
                "attempted to read past end of {:?}",
                self.msg
            )))
        } else {
            Ok(())
        }
    }

    /// Returns true if any of the read_* methods attempted to read beyond the end of the Message
    pub fn has_error(&self) -> bool {
        self.read_past_end
    }

    /// Peek at the next byte without changing the position. None if at end.
    pub fn peek(&self) -> Option<u8> {
        self.msg.as_slice().get(self.pos).cloned()
    }

    /// Reads a single byte and returns it.
    /// Returns 0 if no bytes left, use error() or has_error() to distinguish.
    pub fn read_byte(&mut self) -> u8 {
        match self.msg.as_slice().get(self.pos) {
            Some(&b) => {
                self.pos += 1;
                b
            }
            None => {
                self.read_past_end = true;
                0
            }
        }
    }

    /// Reads an i16 and returns it.
    /// Returns 0 if no bytes left, use error() or has_error() to distinguish.
    pub fn read_i16(&mut self) -> i16 {
        let new_pos = self.pos + 2;
        if new_pos > self.len() {
            self.read_past_end = true;
            return 0;
        }
        let bytes = &self.msg.as_slice()[self.pos..new_pos];
        self.pos = new_pos;
        i16::from_be_bytes(bytes.try_into().unwrap())
    }

    /// Reads an i32 and returns it.
    /// Returns 0 if no bytes left, use error() or has_error() to distinguish.
    pub fn read_i32(&mut self) -> i32 {
        let new_pos = self.pos + 4;
        if new_pos > self.len() {
            self.read_past_end = true;
            return 0;
        }
        let bytes = &self.msg.as_slice()[self.pos..new_pos];
        self.pos = new_pos;
        i32::from_be_bytes(bytes.try_into().unwrap())
    }

    /// Reads and returns a null-terminated utf-8 string
    pub fn read_str(&mut self) -> Result<&'a str> {
        let bytes = self.read_null_terminated_bytes()?;
        std::str::from_utf8(bytes).map_err(Error::from)
    }

    /// Reads and returns a null-terminated slice of bytes
    pub fn read_null_terminated_bytes(&mut self) -> Result<&'a [u8]> {
        let bytes = &self.msg.as_slice()[self.pos..];
        if let Some(i) = memchr::memchr(0, bytes) {
            self.pos += i + 1;
            Ok(&bytes[..i])
        } else {
            self.read_past_end = true;
            Err(self.error().unwrap_err())
        }
    }

    /// Reads and returns a slice of bytes of the specified length
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let new_pos = self.pos + len;
        if new_pos > self.len() {
            self.read_past_end = true;
            return Err(self.error().unwrap_err());
        }
        let bytes = &self.msg.as_slice()[self.pos..new_pos];
        self.pos = new_pos;
        Ok(bytes)
    }

    /// Reads and returns the remainder of the message as a &[u8]
    pub fn read_to_end(&mut self) -> &'a [u8] {
        let bytes = &self.msg.as_slice()[self.pos..];
        self.pos = self.len();
        bytes
    }

    /// Return the current position.
    pub fn tell(&self) -> usize {
        self.pos
    }
}
