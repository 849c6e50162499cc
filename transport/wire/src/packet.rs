//! In-memory packet buffer with typed, byte-order-normalized accessors.
//!
//! A [`Packet`] is an append-only byte buffer plus a forward-only read
//! cursor. Writers convert multi-byte integers to network byte order
//! (big-endian) before appending; readers convert back. Single bytes and
//! IEEE-754 floating values are copied verbatim, so the float encoding is
//! not portable across machines with mismatched floating-point
//! representations.
//!
//! Reads are checked: once an extraction would run past the end of the
//! buffer (or overflow the cursor arithmetic) the packet becomes invalid
//! and stays invalid until [`Packet::clear`]. Every reader returns
//! `Option`, so a chain of extractions folds naturally through `?` and
//! stops producing values after the first failure.

use bytes::{Buf, BufMut, BytesMut};

/// A framed unit of application data with typed read/write accessors.
///
/// ```
/// use wharf_wire::Packet;
///
/// let mut packet = Packet::new();
/// packet.write_u16(7).write_str("ready");
///
/// let code = packet.read_u16();
/// let word = packet.read_string();
/// assert_eq!(code, Some(7));
/// assert_eq!(word.as_deref(), Some("ready"));
/// ```
#[derive(Debug, Clone)]
pub struct Packet {
    /// Bytes stored in the packet
    data: BytesMut,
    /// Current reading position
    read_pos: usize,
    /// Byte offset of an in-progress framed send
    send_pos: usize,
    /// Sticky reading state; false once any extraction has failed
    valid: bool,
}

impl Default for Packet {
    fn default() -> Self {
        Self::new()
    }
}

impl Packet {
    /// Create an empty packet.
    pub fn new() -> Self {
        Self {
            data: BytesMut::new(),
            read_pos: 0,
            send_pos: 0,
            valid: true,
        }
    }

    /// Drop all stored bytes and reset the cursors and validity state.
    pub fn clear(&mut self) {
        self.data.clear();
        self.read_pos = 0;
        self.send_pos = 0;
        self.valid = true;
    }

    /// Append raw bytes to the packet.
    ///
    /// The bytes become part of the payload exactly as given; no length
    /// prefix or conversion is applied.
    pub fn append(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// The packet's payload bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Number of bytes stored in the packet.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the packet holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Current read cursor position.
    pub fn read_pos(&self) -> usize {
        self.read_pos
    }

    /// Whether the read cursor has consumed every stored byte.
    pub fn at_end(&self) -> bool {
        self.read_pos >= self.data.len()
    }

    /// Whether the packet is still valid for reading.
    ///
    /// Turns false when an extraction runs past the end of the buffer and
    /// stays false until [`Packet::clear`].
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Byte offset of the in-progress framed send.
    ///
    /// Maintained by the stream socket across partial sends; not meaningful
    /// to ordinary codec users.
    pub fn send_offset(&self) -> usize {
        self.send_pos
    }

    /// Update the framed-send offset.
    ///
    /// Used by the stream socket to record how much of the staged frame has
    /// been transmitted so a later call resumes at the exact byte.
    pub fn set_send_offset(&mut self, offset: usize) {
        self.send_pos = offset;
    }

    /// Check that `size` more bytes can be read, updating validity.
    fn check_size(&mut self, size: usize) -> bool {
        let fits = self
            .read_pos
            .checked_add(size)
            .is_some_and(|end| end <= self.data.len());
        self.valid = self.valid && fits;
        self.valid
    }

    /// Poison the packet; subsequent reads return `None` until `clear`.
    fn invalidate(&mut self) {
        self.valid = false;
    }

    /// Write a boolean as a single byte.
    pub fn write_bool(&mut self, value: bool) -> &mut Self {
        self.write_u8(u8::from(value))
    }

    /// Write a signed byte.
    pub fn write_i8(&mut self, value: i8) -> &mut Self {
        self.data.put_i8(value);
        self
    }

    /// Write an unsigned byte.
    pub fn write_u8(&mut self, value: u8) -> &mut Self {
        self.data.put_u8(value);
        self
    }

    /// Write a signed 16-bit integer in network byte order.
    pub fn write_i16(&mut self, value: i16) -> &mut Self {
        self.data.put_i16(value);
        self
    }

    /// Write an unsigned 16-bit integer in network byte order.
    pub fn write_u16(&mut self, value: u16) -> &mut Self {
        self.data.put_u16(value);
        self
    }

    /// Write a signed 32-bit integer in network byte order.
    pub fn write_i32(&mut self, value: i32) -> &mut Self {
        self.data.put_i32(value);
        self
    }

    /// Write an unsigned 32-bit integer in network byte order.
    pub fn write_u32(&mut self, value: u32) -> &mut Self {
        self.data.put_u32(value);
        self
    }

    /// Write a signed 64-bit integer in network byte order.
    pub fn write_i64(&mut self, value: i64) -> &mut Self {
        self.data.put_i64(value);
        self
    }

    /// Write an unsigned 64-bit integer in network byte order.
    pub fn write_u64(&mut self, value: u64) -> &mut Self {
        self.data.put_u64(value);
        self
    }

    /// Write a 32-bit float in the machine's native layout.
    pub fn write_f32(&mut self, value: f32) -> &mut Self {
        self.data.put_slice(&value.to_ne_bytes());
        self
    }

    /// Write a 64-bit float in the machine's native layout.
    pub fn write_f64(&mut self, value: f64) -> &mut Self {
        self.data.put_slice(&value.to_ne_bytes());
        self
    }

    /// Write a string as a 4-byte count followed by its raw bytes.
    pub fn write_str(&mut self, value: &str) -> &mut Self {
        self.write_u32(value.len() as u32);
        self.data.put_slice(value.as_bytes());
        self
    }

    /// Write a string as a 4-byte count followed by one 4-byte value per
    /// character, keeping the encoding independent of any particular wide
    /// character representation.
    pub fn write_utf32(&mut self, value: &str) -> &mut Self {
        self.write_u32(value.chars().count() as u32);
        for c in value.chars() {
            self.write_u32(c as u32);
        }
        self
    }

    /// Read a boolean written by [`Packet::write_bool`].
    pub fn read_bool(&mut self) -> Option<bool> {
        self.read_u8().map(|v| v != 0)
    }

    /// Read a signed byte.
    pub fn read_i8(&mut self) -> Option<i8> {
        if !self.check_size(1) {
            return None;
        }
        let mut slice = &self.data[self.read_pos..];
        let value = slice.get_i8();
        self.read_pos += 1;
        Some(value)
    }

    /// Read an unsigned byte.
    pub fn read_u8(&mut self) -> Option<u8> {
        if !self.check_size(1) {
            return None;
        }
        let mut slice = &self.data[self.read_pos..];
        let value = slice.get_u8();
        self.read_pos += 1;
        Some(value)
    }

    /// Read a signed 16-bit integer from network byte order.
    pub fn read_i16(&mut self) -> Option<i16> {
        if !self.check_size(2) {
            return None;
        }
        let mut slice = &self.data[self.read_pos..];
        let value = slice.get_i16();
        self.read_pos += 2;
        Some(value)
    }

    /// Read an unsigned 16-bit integer from network byte order.
    pub fn read_u16(&mut self) -> Option<u16> {
        if !self.check_size(2) {
            return None;
        }
        let mut slice = &self.data[self.read_pos..];
        let value = slice.get_u16();
        self.read_pos += 2;
        Some(value)
    }

    /// Read a signed 32-bit integer from network byte order.
    pub fn read_i32(&mut self) -> Option<i32> {
        if !self.check_size(4) {
            return None;
        }
        let mut slice = &self.data[self.read_pos..];
        let value = slice.get_i32();
        self.read_pos += 4;
        Some(value)
    }

    /// Read an unsigned 32-bit integer from network byte order.
    pub fn read_u32(&mut self) -> Option<u32> {
        if !self.check_size(4) {
            return None;
        }
        let mut slice = &self.data[self.read_pos..];
        let value = slice.get_u32();
        self.read_pos += 4;
        Some(value)
    }

    /// Read a signed 64-bit integer from network byte order.
    pub fn read_i64(&mut self) -> Option<i64> {
        if !self.check_size(8) {
            return None;
        }
        let mut slice = &self.data[self.read_pos..];
        let value = slice.get_i64();
        self.read_pos += 8;
        Some(value)
    }

    /// Read an unsigned 64-bit integer from network byte order.
    pub fn read_u64(&mut self) -> Option<u64> {
        if !self.check_size(8) {
            return None;
        }
        let mut slice = &self.data[self.read_pos..];
        let value = slice.get_u64();
        self.read_pos += 8;
        Some(value)
    }

    /// Read a 32-bit float stored in the machine's native layout.
    pub fn read_f32(&mut self) -> Option<f32> {
        if !self.check_size(4) {
            return None;
        }
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.data[self.read_pos..self.read_pos + 4]);
        self.read_pos += 4;
        Some(f32::from_ne_bytes(bytes))
    }

    /// Read a 64-bit float stored in the machine's native layout.
    pub fn read_f64(&mut self) -> Option<f64> {
        if !self.check_size(8) {
            return None;
        }
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.data[self.read_pos..self.read_pos + 8]);
        self.read_pos += 8;
        Some(f64::from_ne_bytes(bytes))
    }

    /// Read a string written by [`Packet::write_str`].
    ///
    /// The bytes must form valid UTF-8; anything else is a protocol
    /// violation and poisons the packet.
    pub fn read_string(&mut self) -> Option<String> {
        let length = self.read_u32()? as usize;
        if length == 0 {
            return Some(String::new());
        }
        if !self.check_size(length) {
            return None;
        }
        let bytes = &self.data[self.read_pos..self.read_pos + length];
        match std::str::from_utf8(bytes) {
            Ok(s) => {
                let value = s.to_owned();
                self.read_pos += length;
                Some(value)
            }
            Err(_) => {
                self.invalidate();
                None
            }
        }
    }

    /// Read a string written by [`Packet::write_utf32`].
    ///
    /// Each 4-byte unit must be a valid Unicode scalar value; anything
    /// else is a protocol violation and poisons the packet.
    pub fn read_utf32(&mut self) -> Option<String> {
        let length = self.read_u32()? as usize;
        let byte_len = length.checked_mul(4);
        match byte_len {
            Some(len) if self.check_size(len) => {}
            _ => {
                self.invalidate();
                return None;
            }
        }

        let mut value = String::with_capacity(length);
        for _ in 0..length {
            let unit = self.read_u32()?;
            match char::from_u32(unit) {
                Some(c) => value.push(c),
                None => {
                    self.invalidate();
                    return None;
                }
            }
        }
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_round_trip() {
        let mut packet = Packet::new();
        packet
            .write_bool(true)
            .write_i8(-5)
            .write_u8(200)
            .write_i16(-12345)
            .write_u16(54321)
            .write_i32(-7_000_000)
            .write_u32(3_000_000_000)
            .write_i64(-9_000_000_000)
            .write_u64(18_000_000_000_000_000_000)
            .write_f32(1.5)
            .write_f64(-2.25);

        assert_eq!(packet.read_bool(), Some(true));
        assert_eq!(packet.read_i8(), Some(-5));
        assert_eq!(packet.read_u8(), Some(200));
        assert_eq!(packet.read_i16(), Some(-12345));
        assert_eq!(packet.read_u16(), Some(54321));
        assert_eq!(packet.read_i32(), Some(-7_000_000));
        assert_eq!(packet.read_u32(), Some(3_000_000_000));
        assert_eq!(packet.read_i64(), Some(-9_000_000_000));
        assert_eq!(packet.read_u64(), Some(18_000_000_000_000_000_000));
        assert_eq!(packet.read_f32(), Some(1.5));
        assert_eq!(packet.read_f64(), Some(-2.25));
        assert!(packet.is_valid());
        assert!(packet.at_end());
    }

    #[test]
    fn test_integers_are_big_endian_on_the_wire() {
        let mut packet = Packet::new();
        packet.write_u32(0x0102_0304);
        assert_eq!(packet.as_bytes(), &[0x01, 0x02, 0x03, 0x04]);

        let mut packet = Packet::new();
        packet.write_u16(0xBEEF);
        assert_eq!(packet.as_bytes(), &[0xBE, 0xEF]);

        let mut packet = Packet::new();
        packet.write_u64(0x0102_0304_0506_0708);
        assert_eq!(
            packet.as_bytes(),
            &[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]
        );
    }

    #[test]
    fn test_read_from_empty_packet_invalidates() {
        let mut packet = Packet::new();
        assert_eq!(packet.read_i32(), None);
        assert!(!packet.is_valid());
    }

    #[test]
    fn test_validity_is_sticky_until_clear() {
        let mut packet = Packet::new();
        packet.write_u8(1);
        assert_eq!(packet.read_u32(), None);

        // A byte is still stored, but the packet stays poisoned.
        assert_eq!(packet.read_u8(), None);
        assert!(!packet.is_valid());

        packet.clear();
        assert!(packet.is_valid());
        assert!(packet.is_empty());
    }

    #[test]
    fn test_failed_chain_stops_producing_values() {
        fn extract(packet: &mut Packet) -> Option<(u16, u16, u16)> {
            Some((packet.read_u16()?, packet.read_u16()?, packet.read_u16()?))
        }

        let mut packet = Packet::new();
        packet.write_u16(1).write_u16(2);
        assert_eq!(extract(&mut packet), None);
        assert!(!packet.is_valid());
    }

    #[test]
    fn test_string_round_trip() {
        let mut packet = Packet::new();
        packet.write_str("").write_str("hello wire");
        assert_eq!(packet.read_string().as_deref(), Some(""));
        assert_eq!(packet.read_string().as_deref(), Some("hello wire"));
        assert!(packet.is_valid());
    }

    #[test]
    fn test_utf32_round_trip() {
        let mut packet = Packet::new();
        packet.write_utf32("héllo ✓");
        assert_eq!(packet.read_utf32().as_deref(), Some("héllo ✓"));
        assert!(packet.is_valid());
    }

    #[test]
    fn test_utf32_stores_one_u32_per_character() {
        let mut packet = Packet::new();
        packet.write_utf32("✓");
        // 4-byte count plus one 4-byte unit.
        assert_eq!(packet.len(), 8);
        assert_eq!(&packet.as_bytes()[..4], &[0, 0, 0, 1]);
    }

    #[test]
    fn test_truncated_string_invalidates() {
        let mut packet = Packet::new();
        packet.write_u32(10);
        packet.append(b"abc");
        assert_eq!(packet.read_string(), None);
        assert!(!packet.is_valid());
    }

    #[test]
    fn test_invalid_scalar_value_poisons_utf32() {
        let mut packet = Packet::new();
        packet.write_u32(1).write_u32(0xD800); // lone surrogate
        assert_eq!(packet.read_utf32(), None);
        assert!(!packet.is_valid());
    }

    #[test]
    fn test_append_and_raw_access() {
        let mut packet = Packet::new();
        packet.append(&[1, 2, 3]);
        packet.append(&[]);
        assert_eq!(packet.as_bytes(), &[1, 2, 3]);
        assert_eq!(packet.len(), 3);
    }

    #[test]
    fn test_send_offset_survives_reads() {
        let mut packet = Packet::new();
        packet.write_u64(9);
        packet.set_send_offset(5);
        let _ = packet.read_u64();
        assert_eq!(packet.send_offset(), 5);
        packet.clear();
        assert_eq!(packet.send_offset(), 0);
    }
}
