//! Byte-cursor wire codec.
//!
//! A thin big-endian reader/writer used by every packet codec in the
//! stack (ARP, IPv4, UDP, TCP). Bounds errors are recoverable signals, not
//! panics: every read/write past the end of the underlying buffer returns
//! [`CursorError`] instead of aborting.

mod mac;
mod ipv4_addr;

pub use mac::MacAddr;
pub use ipv4_addr::Ipv4Addr;

use byteorder::{BigEndian, ByteOrder};

/// Signals that a cursor read or write ran past the end of its buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("cursor read/write past end of buffer")]
pub struct CursorError;

pub type CursorResult<T> = Result<T, CursorError>;

/// A read-only cursor over a byte slice.
pub struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Cursor { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> CursorResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(CursorError);
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> CursorResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> CursorResult<u16> {
        Ok(BigEndian::read_u16(self.take(2)?))
    }

    pub fn read_u32(&mut self) -> CursorResult<u32> {
        Ok(BigEndian::read_u32(self.take(4)?))
    }

    pub fn read_mac(&mut self) -> CursorResult<MacAddr> {
        let bytes = self.take(6)?;
        Ok(MacAddr::from_slice(bytes))
    }

    pub fn read_ipv4(&mut self) -> CursorResult<Ipv4Addr> {
        let bytes = self.take(4)?;
        Ok(Ipv4Addr::from_slice(bytes))
    }

    pub fn read_bytes(&mut self, n: usize) -> CursorResult<&'a [u8]> {
        self.take(n)
    }

    /// Returns everything from the current position to the end of the buffer.
    pub fn rest(&mut self) -> &'a [u8] {
        let slice = &self.buf[self.pos..];
        self.pos = self.buf.len();
        slice
    }
}

/// A mutable cursor over a byte slice, used to serialize packets.
pub struct CursorMut<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> CursorMut<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        CursorMut { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take_mut(&mut self, n: usize) -> CursorResult<&mut [u8]> {
        if self.buf.len() - self.pos < n {
            return Err(CursorError);
        }
        let start = self.pos;
        self.pos += n;
        Ok(&mut self.buf[start..start + n])
    }

    pub fn write_u8(&mut self, v: u8) -> CursorResult<()> {
        self.take_mut(1)?[0] = v;
        Ok(())
    }

    pub fn write_u16(&mut self, v: u16) -> CursorResult<()> {
        BigEndian::write_u16(self.take_mut(2)?, v);
        Ok(())
    }

    pub fn write_u32(&mut self, v: u32) -> CursorResult<()> {
        BigEndian::write_u32(self.take_mut(4)?, v);
        Ok(())
    }

    pub fn write_mac(&mut self, mac: &MacAddr) -> CursorResult<()> {
        self.take_mut(6)?.copy_from_slice(&mac.0);
        Ok(())
    }

    pub fn write_ipv4(&mut self, ip: &Ipv4Addr) -> CursorResult<()> {
        self.take_mut(4)?.copy_from_slice(&ip.0);
        Ok(())
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> CursorResult<()> {
        self.take_mut(bytes.len())?.copy_from_slice(bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_write_roundtrip() {
        let mut buf = [0u8; 16];
        {
            let mut w = CursorMut::new(&mut buf);
            w.write_u16(0x1234).unwrap();
            w.write_u32(0xdeadbeef).unwrap();
            w.write_mac(&MacAddr::new([1, 2, 3, 4, 5, 6])).unwrap();
            w.write_ipv4(&Ipv4Addr::new([192, 168, 1, 1])).unwrap();
        }
        let mut r = Cursor::new(&buf);
        assert_eq!(r.read_u16().unwrap(), 0x1234);
        assert_eq!(r.read_u32().unwrap(), 0xdeadbeef);
        assert_eq!(r.read_mac().unwrap(), MacAddr::new([1, 2, 3, 4, 5, 6]));
        assert_eq!(r.read_ipv4().unwrap(), Ipv4Addr::new([192, 168, 1, 1]));
    }

    #[test]
    fn read_past_end_is_recoverable() {
        let buf = [0u8; 1];
        let mut r = Cursor::new(&buf);
        assert_eq!(r.read_u16(), Err(CursorError));
    }
}
