/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

use std::fmt;

use arrayvec::ArrayVec;

/// Attempt to write past the end of a fixed-capacity buffer, or to read past
/// the end of its contents. Surfaced as an error instead of a panic because
/// most reads are parsing attacker-controlled input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferOverflow;

impl fmt::Display for BufferOverflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("buffer overflow")
    }
}
impl std::error::Error for BufferOverflow {}

/// Stack-allocated fixed-capacity byte buffer with an append cursor.
///
/// All multi-byte integers are big-endian on the wire, so the append/get
/// methods here are the only place byte order is handled.
#[derive(Clone)]
pub struct Buffer<const C: usize> {
    b: ArrayVec<u8, C>,
}

impl<const C: usize> Buffer<C> {
    #[inline(always)]
    pub fn new() -> Self {
        Self { b: ArrayVec::new() }
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, BufferOverflow> {
        let mut tmp = Self::new();
        tmp.append_bytes(data)?;
        Ok(tmp)
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.b.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.b.is_empty()
    }

    #[inline(always)]
    pub fn as_bytes(&self) -> &[u8] {
        &self.b
    }

    #[inline(always)]
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.b
    }

    pub fn clear(&mut self) {
        self.b.clear();
    }

    /// Shorten the buffer; no-op if it is already shorter.
    pub fn truncate(&mut self, len: usize) {
        self.b.truncate(len);
    }

    pub fn append_bytes(&mut self, data: &[u8]) -> Result<(), BufferOverflow> {
        self.b.try_extend_from_slice(data).map_err(|_| BufferOverflow)
    }

    /// Append `len` zero bytes and return the start index of the region.
    pub fn append_padding(&mut self, len: usize) -> Result<usize, BufferOverflow> {
        let start = self.b.len();
        if start + len > C {
            return Err(BufferOverflow);
        }
        for _ in 0..len {
            self.b.push(0);
        }
        Ok(start)
    }

    #[inline]
    pub fn append_u8(&mut self, i: u8) -> Result<(), BufferOverflow> {
        self.b.try_push(i).map_err(|_| BufferOverflow)
    }

    #[inline]
    pub fn append_u16(&mut self, i: u16) -> Result<(), BufferOverflow> {
        self.append_bytes(&i.to_be_bytes())
    }

    #[inline]
    pub fn append_u32(&mut self, i: u32) -> Result<(), BufferOverflow> {
        self.append_bytes(&i.to_be_bytes())
    }

    #[inline]
    pub fn append_u64(&mut self, i: u64) -> Result<(), BufferOverflow> {
        self.append_bytes(&i.to_be_bytes())
    }

    pub fn u8_at(&self, i: usize) -> Result<u8, BufferOverflow> {
        self.b.get(i).copied().ok_or(BufferOverflow)
    }

    pub fn u16_at(&self, i: usize) -> Result<u16, BufferOverflow> {
        let s = self.bytes_at(i, 2)?;
        Ok(u16::from_be_bytes([s[0], s[1]]))
    }

    pub fn u32_at(&self, i: usize) -> Result<u32, BufferOverflow> {
        let s = self.bytes_at(i, 4)?;
        Ok(u32::from_be_bytes(s.try_into().unwrap()))
    }

    pub fn u64_at(&self, i: usize) -> Result<u64, BufferOverflow> {
        let s = self.bytes_at(i, 8)?;
        Ok(u64::from_be_bytes(s.try_into().unwrap()))
    }

    pub fn bytes_at(&self, i: usize, len: usize) -> Result<&[u8], BufferOverflow> {
        if i + len <= self.b.len() {
            Ok(&self.b[i..i + len])
        } else {
            Err(BufferOverflow)
        }
    }

    pub fn bytes_at_mut(&mut self, i: usize, len: usize) -> Result<&mut [u8], BufferOverflow> {
        if i + len <= self.b.len() {
            Ok(&mut self.b[i..i + len])
        } else {
            Err(BufferOverflow)
        }
    }

    /// Overwrite a previously appended big-endian field in place.
    pub fn set_u8_at(&mut self, i: usize, v: u8) -> Result<(), BufferOverflow> {
        *self.b.get_mut(i).ok_or(BufferOverflow)? = v;
        Ok(())
    }

    pub fn set_u16_at(&mut self, i: usize, v: u16) -> Result<(), BufferOverflow> {
        self.bytes_at_mut(i, 2)?.copy_from_slice(&v.to_be_bytes());
        Ok(())
    }

    pub fn set_u32_at(&mut self, i: usize, v: u32) -> Result<(), BufferOverflow> {
        self.bytes_at_mut(i, 4)?.copy_from_slice(&v.to_be_bytes());
        Ok(())
    }

    pub fn set_u64_at(&mut self, i: usize, v: u64) -> Result<(), BufferOverflow> {
        self.bytes_at_mut(i, 8)?.copy_from_slice(&v.to_be_bytes());
        Ok(())
    }

    /// Read a big-endian integer at a cursor and advance it.
    pub fn read_u8(&self, cursor: &mut usize) -> Result<u8, BufferOverflow> {
        let v = self.u8_at(*cursor)?;
        *cursor += 1;
        Ok(v)
    }

    pub fn read_u16(&self, cursor: &mut usize) -> Result<u16, BufferOverflow> {
        let v = self.u16_at(*cursor)?;
        *cursor += 2;
        Ok(v)
    }

    pub fn read_u32(&self, cursor: &mut usize) -> Result<u32, BufferOverflow> {
        let v = self.u32_at(*cursor)?;
        *cursor += 4;
        Ok(v)
    }

    pub fn read_u64(&self, cursor: &mut usize) -> Result<u64, BufferOverflow> {
        let v = self.u64_at(*cursor)?;
        *cursor += 8;
        Ok(v)
    }

    pub fn read_bytes(&self, cursor: &mut usize, len: usize) -> Result<&[u8], BufferOverflow> {
        let s = self.bytes_at(*cursor, len)?;
        *cursor += len;
        Ok(s)
    }
}

impl<const C: usize> Default for Buffer<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const C: usize> AsRef<[u8]> for Buffer<C> {
    #[inline(always)]
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl<const C: usize> PartialEq for Buffer<C> {
    fn eq(&self, other: &Self) -> bool {
        self.b == other.b
    }
}
impl<const C: usize> Eq for Buffer<C> {}

impl<const C: usize> fmt::Debug for Buffer<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Buffer<{}>[{}]", C, self.b.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_read_round_trip() {
        let mut b: Buffer<64> = Buffer::new();
        b.append_u8(0xab).unwrap();
        b.append_u16(0x1234).unwrap();
        b.append_u32(0xdeadbeef).unwrap();
        b.append_u64(0x0123456789abcdef).unwrap();
        b.append_bytes(&[1, 2, 3]).unwrap();
        assert_eq!(b.len(), 18);

        let mut c = 0;
        assert_eq!(b.read_u8(&mut c).unwrap(), 0xab);
        assert_eq!(b.read_u16(&mut c).unwrap(), 0x1234);
        assert_eq!(b.read_u32(&mut c).unwrap(), 0xdeadbeef);
        assert_eq!(b.read_u64(&mut c).unwrap(), 0x0123456789abcdef);
        assert_eq!(b.read_bytes(&mut c, 3).unwrap(), &[1, 2, 3]);
        assert_eq!(c, b.len());
        assert_eq!(b.read_u8(&mut c), Err(BufferOverflow));
    }

    #[test]
    fn overflow_is_an_error() {
        let mut b: Buffer<4> = Buffer::new();
        assert!(b.append_u32(1).is_ok());
        assert_eq!(b.append_u8(0), Err(BufferOverflow));
        assert_eq!(b.append_padding(1).unwrap_err(), BufferOverflow);
    }

    #[test]
    fn set_at_patches_in_place() {
        let mut b: Buffer<16> = Buffer::new();
        let at = b.append_padding(4).unwrap();
        b.append_u8(0xff).unwrap();
        b.set_u32_at(at, 0x01020304).unwrap();
        assert_eq!(b.as_bytes(), &[1, 2, 3, 4, 0xff]);
        assert!(b.set_u64_at(2, 0).is_err());
    }
}
