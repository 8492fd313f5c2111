#![forbid(unsafe_code)]
//! Encoding, varint, and buffer utilities shared by the lock and log codecs.

pub mod ord {
    //! Order-preserving helpers for column bytes.

    use bytes::{BufMut, Bytes, BytesMut};

    /// Appends a big-endian u64 so byte order matches numeric order.
    pub fn put_u64_be(dst: &mut BytesMut, v: u64) {
        dst.put_u64(v);
    }

    /// Appends a length-prefixed (u32 big-endian) byte string.
    pub fn put_len_prefixed(dst: &mut BytesMut, src: &[u8]) {
        assert!(
            src.len() <= u32::MAX as usize,
            "byte string too long (>{} bytes)",
            u32::MAX
        );
        dst.put_u32(src.len() as u32);
        dst.put_slice(src);
    }

    /// Smallest byte string strictly greater than every string prefixed by `src`.
    ///
    /// Returns `None` when `src` is empty or all `0xff`, meaning the range is unbounded.
    pub fn next_bigger(src: &[u8]) -> Option<Bytes> {
        let mut out = src.to_vec();
        while let Some(last) = out.pop() {
            if last != 0xff {
                out.push(last + 1);
                return Some(Bytes::from(out));
            }
        }
        None
    }
}

pub mod var {
    //! Unsigned varints.

    use bytes::BufMut;

    use crate::types::{Result, UmbralError};

    /// Encodes a u64 as an unsigned varint.
    pub fn encode_u64(mut v: u64, out: &mut impl BufMut) {
        loop {
            let byte = (v & 0x7f) as u8;
            v >>= 7;
            if v == 0 {
                out.put_u8(byte);
                break;
            }
            out.put_u8(byte | 0x80);
        }
    }

    /// Decodes a u64 varint from a slice, updating the offset.
    pub fn decode_u64(src: &[u8], off: &mut usize) -> Result<u64> {
        let mut result = 0u64;
        let mut shift = 0u32;
        for i in 0..10 {
            let byte = *src
                .get(*off)
                .ok_or_else(|| UmbralError::Corruption(format!("varint truncated at byte {i}")))?;
            *off += 1;
            let payload = u64::from(byte & 0x7f);
            if i == 9 && payload > 1 {
                return Err(UmbralError::Corruption("varint overflows 64 bits".into()));
            }
            result |= payload << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }
        Err(UmbralError::Corruption("varint longer than 10 bytes".into()))
    }
}

pub mod buf {
    //! A checked reader over a shared buffer.

    use core::fmt;

    use bytes::Bytes;

    use super::var;
    use crate::types::{Result, UmbralError};

    /// Sequential reader whose every accessor fails with `Corruption` on overread.
    pub struct Reader {
        buf: Bytes,
        off: usize,
    }

    impl Reader {
        /// Creates a reader positioned at the start of `buf`.
        pub fn new(buf: Bytes) -> Self {
            Self { buf, off: 0 }
        }

        /// Number of unread bytes.
        pub fn remaining(&self) -> usize {
            self.buf.len().saturating_sub(self.off)
        }

        /// Takes the next `n` bytes without copying.
        pub fn take(&mut self, n: usize) -> Result<Bytes> {
            let end = self
                .off
                .checked_add(n)
                .filter(|end| *end <= self.buf.len())
                .ok_or_else(|| {
                    UmbralError::Corruption(format!(
                        "read beyond buffer: need {n}, remaining {}",
                        self.remaining()
                    ))
                })?;
            let out = self.buf.slice(self.off..end);
            self.off = end;
            Ok(out)
        }

        /// Returns every unread byte and moves to the end.
        pub fn take_rest(&mut self) -> Bytes {
            let out = self.buf.slice(self.off..);
            self.off = self.buf.len();
            out
        }

        /// Reads one byte.
        pub fn u8(&mut self) -> Result<u8> {
            Ok(self.take(1)?[0])
        }

        /// Reads a big-endian u32.
        pub fn u32(&mut self) -> Result<u32> {
            let raw = self.take(4)?;
            Ok(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
        }

        /// Reads a big-endian u64.
        pub fn u64(&mut self) -> Result<u64> {
            let raw = self.take(8)?;
            let mut arr = [0u8; 8];
            arr.copy_from_slice(&raw);
            Ok(u64::from_be_bytes(arr))
        }

        /// Reads an unsigned varint.
        pub fn varint(&mut self) -> Result<u64> {
            let mut off = self.off;
            let v = var::decode_u64(&self.buf, &mut off)?;
            self.off = off;
            Ok(v)
        }

        /// Reads a byte string written by [`super::ord::put_len_prefixed`].
        pub fn len_prefixed(&mut self) -> Result<Bytes> {
            let len = self.u32()? as usize;
            self.take(len)
        }

        /// Reads a length-prefixed UTF-8 string.
        pub fn string(&mut self) -> Result<String> {
            let raw = self.len_prefixed()?;
            String::from_utf8(raw.to_vec())
                .map_err(|_| UmbralError::Corruption("string not valid UTF-8".into()))
        }
    }

    impl fmt::Debug for Reader {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("Reader")
                .field("off", &self.off)
                .field("remaining", &self.remaining())
                .finish()
        }
    }
}
