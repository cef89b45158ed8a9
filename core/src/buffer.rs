//! Byte-order tagged value buffers.
use snafu::{ensure, Backtrace, Snafu};

/// An error swapping the bytes of a value buffer.
#[derive(Debug, Snafu)]
pub enum Error {
    /// The buffer length is not a multiple of the swap unit
    #[snafu(display("illegal length {} for {}-byte swap", length, unit))]
    IllegalLength {
        length: usize,
        unit: usize,
        backtrace: Backtrace,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The byte order of the multi-byte units in a value buffer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ByteOrder {
    LittleEndian,
    BigEndian,
}

impl ByteOrder {
    /// The opposite byte order.
    pub fn swapped(self) -> Self {
        match self {
            ByteOrder::LittleEndian => ByteOrder::BigEndian,
            ByteOrder::BigEndian => ByteOrder::LittleEndian,
        }
    }
}

/// A raw value buffer along with the byte order it is encoded in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueBuffer {
    bytes: Vec<u8>,
    order: ByteOrder,
}

impl ValueBuffer {
    pub fn new(bytes: impl Into<Vec<u8>>, order: ByteOrder) -> Self {
        ValueBuffer {
            bytes: bytes.into(),
            order,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn order(&self) -> ByteOrder {
        self.order
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Reverse the byte order of every 16-bit unit.
    pub fn swap_words(&mut self) -> Result<()> {
        self.swap(2)
    }

    /// Reverse the byte order of every 32-bit unit.
    pub fn swap_ints(&mut self) -> Result<()> {
        self.swap(4)
    }

    /// Reverse the byte order of every 64-bit unit.
    pub fn swap_longs(&mut self) -> Result<()> {
        self.swap(8)
    }

    /// Swap units of the given size in place
    /// and flip the recorded byte order.
    ///
    /// The buffer is left untouched
    /// if its length is not a multiple of `unit`.
    pub fn swap(&mut self, unit: usize) -> Result<()> {
        ensure!(
            unit > 0 && self.bytes.len() % unit == 0,
            IllegalLengthSnafu {
                length: self.bytes.len(),
                unit,
            }
        );
        for chunk in self.bytes.chunks_exact_mut(unit) {
            chunk.reverse();
        }
        self.order = self.order.swapped();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn swap_words_reverses_pairs() {
        let mut buf = ValueBuffer::new(vec![1, 2, 3, 4], ByteOrder::LittleEndian);
        buf.swap_words().unwrap();
        assert_eq!(buf.as_bytes(), &[2, 1, 4, 3]);
        assert_eq!(buf.order(), ByteOrder::BigEndian);
    }

    #[test]
    fn swap_longs_reverses_octets() {
        let mut buf = ValueBuffer::new((0..8).collect::<Vec<u8>>(), ByteOrder::BigEndian);
        buf.swap_longs().unwrap();
        assert_eq!(buf.as_bytes(), &[7, 6, 5, 4, 3, 2, 1, 0]);
        assert_eq!(buf.order(), ByteOrder::LittleEndian);
    }

    #[rstest]
    #[case(2)]
    #[case(4)]
    #[case(8)]
    fn swap_is_an_involution(#[case] unit: usize) {
        let bytes: Vec<u8> = (0..24).collect();
        let mut buf = ValueBuffer::new(bytes.clone(), ByteOrder::LittleEndian);
        buf.swap(unit).unwrap();
        assert_ne!(buf.as_bytes(), &bytes[..]);
        buf.swap(unit).unwrap();
        assert_eq!(buf.as_bytes(), &bytes[..]);
        assert_eq!(buf.order(), ByteOrder::LittleEndian);
    }

    #[rstest]
    #[case(2, 3)]
    #[case(4, 6)]
    #[case(8, 12)]
    fn swap_rejects_partial_units(#[case] unit: usize, #[case] len: usize) {
        let mut buf = ValueBuffer::new(vec![0xAB; len], ByteOrder::LittleEndian);
        let err = buf.swap(unit).unwrap_err();
        assert!(matches!(err, Error::IllegalLength { length, unit: u, .. } if length == len && u == unit));
        // nothing was changed
        assert_eq!(buf.order(), ByteOrder::LittleEndian);
        assert_eq!(buf.len(), len);
    }

    #[test]
    fn swap_empty_buffer() {
        let mut buf = ValueBuffer::new(Vec::new(), ByteOrder::BigEndian);
        buf.swap_ints().unwrap();
        assert!(buf.is_empty());
        assert_eq!(buf.order(), ByteOrder::LittleEndian);
    }
}
