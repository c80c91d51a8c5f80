//! Opinionated BLE codec
//!
//! Assumes little endian for all types

use crate::link::address::BdAddr;

pub trait FixedSize: Sized {
    const SIZE: usize;
}

pub trait Type: Sized {
    fn size(&self) -> usize;
}

pub trait Encode: Type {
    fn encode(&self, dest: &mut [u8]) -> Result<(), Error>;
}

pub trait Decode<'d>: Type {
    fn decode(src: &'d [u8]) -> Result<Self, Error>;
}

impl<T: FixedSize> Type for T {
    fn size(&self) -> usize {
        Self::SIZE
    }
}

/// Fail with [`Error::InsufficientSpace`] unless `buf` holds at least `len` bytes.
pub(crate) fn check_len(buf: &[u8], len: usize) -> Result<(), Error> {
    if buf.len() < len {
        Err(Error::InsufficientSpace)
    } else {
        Ok(())
    }
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    InsufficientSpace,
    InvalidValue,
}

macro_rules! le_int {
    ($($ty:ty),*) => {$(
        impl FixedSize for $ty {
            const SIZE: usize = core::mem::size_of::<$ty>();
        }

        impl Decode<'_> for $ty {
            fn decode(src: &[u8]) -> Result<Self, Error> {
                let bytes = src.get(..Self::SIZE).ok_or(Error::InsufficientSpace)?;
                let mut raw = [0; core::mem::size_of::<$ty>()];
                raw.copy_from_slice(bytes);
                Ok(<$ty>::from_le_bytes(raw))
            }
        }

        impl Encode for $ty {
            fn encode(&self, dest: &mut [u8]) -> Result<(), Error> {
                check_len(dest, Self::SIZE)?;
                dest[..Self::SIZE].copy_from_slice(&self.to_le_bytes());
                Ok(())
            }
        }
    )*};
}

le_int!(u8, u16, u32);

impl FixedSize for BdAddr {
    const SIZE: usize = 6;
}

impl Decode<'_> for BdAddr {
    fn decode(src: &[u8]) -> Result<Self, Error> {
        let raw = src.get(..Self::SIZE).ok_or(Error::InsufficientSpace)?;
        let mut addr = [0; 6];
        addr.copy_from_slice(raw);
        Ok(BdAddr::new(addr))
    }
}

impl Encode for BdAddr {
    fn encode(&self, dest: &mut [u8]) -> Result<(), Error> {
        check_len(dest, Self::SIZE)?;
        dest[..Self::SIZE].copy_from_slice(self.raw());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn little_endian_integers() {
        let mut buf = [0u8; 4];
        0x1234_5678u32.encode(&mut buf).unwrap();
        assert_eq!(buf, [0x78, 0x56, 0x34, 0x12]);
        assert_eq!(u16::decode(&buf), Ok(0x5678));
        assert_eq!(u16::decode(&buf[3..]), Err(Error::InsufficientSpace));
        assert_eq!(0xABCDu16.encode(&mut buf[..1]), Err(Error::InsufficientSpace));
    }

    #[test]
    fn address_bytes_are_sent_as_stored() {
        let addr = BdAddr::new([1, 2, 3, 4, 5, 6]);
        let mut buf = [0u8; 7];
        addr.encode(&mut buf).unwrap();
        assert_eq!(&buf[..6], &[1, 2, 3, 4, 5, 6]);
        assert_eq!(BdAddr::decode(&buf), Ok(addr));
        assert_eq!(BdAddr::decode(&buf[1..]), Ok(BdAddr::new([2, 3, 4, 5, 6, 0])));
        assert_eq!(BdAddr::decode(&buf[2..]), Err(Error::InsufficientSpace));
    }
}
