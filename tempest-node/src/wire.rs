//! Binary codec for messages and persisted records.
//!
//! All integers are network (big) endian. Variable-length counts use the
//! compact-size encoding. This codec is canonical within the node: message
//! digests and store blobs are computed over it.
use std::{io, mem};

use byteorder::{NetworkEndian, ReadBytesExt, WriteBytesExt};

use bitcoin::hashes::Hash;
use bitcoin::{BlockHash, OutPoint, ScriptBuf, Txid};

use crate::crypto::{PublicKey, Signature};
use crate::ShortChannelId;

/// Length prefix for variable-size fields.
///
/// Nothing this codec frames directly comes anywhere near 64KB, so two
/// bytes suffice; open-ended counts (HTLC lists) use the compact-size
/// encoding instead.
pub type Size = u16;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("i/o: {0}")]
    Io(#[from] io::Error),
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("unknown address type `{0}`")]
    UnknownAddressType(u8),
    #[error("unknown message type `{0}`")]
    UnknownMessageType(u16),
    #[error("unknown witness type `{0}`")]
    UnknownWitnessType(u16),
    #[error("non-canonical compact size")]
    NonCanonicalSize,
    #[error("unexpected bytes")]
    UnexpectedBytes,
}

/// A type with a canonical binary form.
pub trait Encode {
    /// Write the binary form, returning how many bytes were written.
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error>;
}

/// A type that can be rebuilt from its canonical binary form.
pub trait Decode: Sized {
    /// Read back a value written by [`Encode::encode`].
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error>;
}

/// Encode a value into a fresh byte vector.
pub fn serialize<T: Encode + ?Sized>(value: &T) -> Vec<u8> {
    let mut buf = Vec::new();

    value
        .encode(&mut buf)
        .expect("serialize: writing to a vector cannot fail");
    buf
}

/// Decode a value from a byte slice. Records and messages are framed
/// exactly, so trailing input is an error.
pub fn deserialize<T: Decode>(mut data: &[u8]) -> Result<T, Error> {
    let value = T::decode(&mut data)?;

    if !data.is_empty() {
        return Err(Error::UnexpectedBytes);
    }
    Ok(value)
}

/// Write a compact-size count.
pub fn write_varint<W: io::Write + ?Sized>(value: u64, writer: &mut W) -> Result<usize, io::Error> {
    match value {
        0..=0xfc => {
            writer.write_u8(value as u8)?;
            Ok(1)
        }
        0xfd..=0xffff => {
            writer.write_u8(0xfd)?;
            writer.write_u16::<NetworkEndian>(value as u16)?;
            Ok(3)
        }
        0x10000..=0xffff_ffff => {
            writer.write_u8(0xfe)?;
            writer.write_u32::<NetworkEndian>(value as u32)?;
            Ok(5)
        }
        _ => {
            writer.write_u8(0xff)?;
            writer.write_u64::<NetworkEndian>(value)?;
            Ok(9)
        }
    }
}

/// Read a compact-size count.
pub fn read_varint<R: io::Read + ?Sized>(reader: &mut R) -> Result<u64, Error> {
    let value = match reader.read_u8()? {
        0xfd => {
            let n = u64::from(reader.read_u16::<NetworkEndian>()?);
            if n < 0xfd {
                return Err(Error::NonCanonicalSize);
            }
            n
        }
        0xfe => {
            let n = u64::from(reader.read_u32::<NetworkEndian>()?);
            if n <= 0xffff {
                return Err(Error::NonCanonicalSize);
            }
            n
        }
        0xff => {
            let n = reader.read_u64::<NetworkEndian>()?;
            if n <= 0xffff_ffff {
                return Err(Error::NonCanonicalSize);
            }
            n
        }
        n => u64::from(n),
    };
    Ok(value)
}

/// Fixed-width integers, network endian.
macro_rules! integer_codec {
    ($($int:ty => $write:ident / $read:ident),* $(,)?) => {
        $(
            impl Encode for $int {
                fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
                    writer.$write::<NetworkEndian>(*self)?;

                    Ok(mem::size_of::<$int>())
                }
            }

            impl Decode for $int {
                fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
                    Ok(reader.$read::<NetworkEndian>()?)
                }
            }
        )*
    };
}

integer_codec! {
    u16 => write_u16 / read_u16,
    u32 => write_u32 / read_u32,
    u64 => write_u64 / read_u64,
}

// Single bytes have no endianness; byteorder special-cases them.
impl Encode for u8 {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        writer.write_u8(*self)?;

        Ok(1)
    }
}

impl Decode for u8 {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        Ok(reader.read_u8()?)
    }
}

// Fixed-width byte arrays are written raw, with no length prefix.
impl<const N: usize> Encode for [u8; N] {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        writer.write_all(self)?;

        Ok(N)
    }
}

impl<const N: usize> Decode for [u8; N] {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        let mut buf = [0; N];
        reader.read_exact(&mut buf)?;

        Ok(buf)
    }
}

impl Encode for PublicKey {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        self.serialize().encode(writer)
    }
}

impl Decode for PublicKey {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        let buf: [u8; 33] = Decode::decode(reader)?;

        PublicKey::from_slice(&buf).map_err(|_| Error::InvalidPublicKey)
    }
}

impl Encode for Signature {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        self.serialize_compact().encode(writer)
    }
}

impl Decode for Signature {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        let buf: [u8; 64] = Decode::decode(reader)?;

        Signature::from_compact(&buf).map_err(|_| Error::InvalidSignature)
    }
}

impl Encode for Txid {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        self.to_byte_array().encode(writer)
    }
}

impl Decode for Txid {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        let buf: [u8; 32] = Decode::decode(reader)?;

        Ok(Txid::from_byte_array(buf))
    }
}

impl Encode for BlockHash {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        self.to_byte_array().encode(writer)
    }
}

impl Decode for BlockHash {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        let buf: [u8; 32] = Decode::decode(reader)?;

        Ok(BlockHash::from_byte_array(buf))
    }
}

impl Encode for OutPoint {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let mut n = self.txid.encode(writer)?;
        n += self.vout.encode(writer)?;

        Ok(n)
    }
}

impl Decode for OutPoint {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        let txid = Txid::decode(reader)?;
        let vout = u32::decode(reader)?;

        Ok(OutPoint { txid, vout })
    }
}

impl Encode for ShortChannelId {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        u64::from(*self).encode(writer)
    }
}

impl Decode for ShortChannelId {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        Ok(Self::from(u64::decode(reader)?))
    }
}

impl Encode for ScriptBuf {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let bytes = self.as_bytes();
        let n = (bytes.len() as Size).encode(writer)?;

        writer.write_all(bytes)?;

        Ok(n + bytes.len())
    }
}

impl Decode for ScriptBuf {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        let len = Size::decode(reader)?;
        let mut buf = vec![0; len as usize];
        reader.read_exact(&mut buf)?;

        Ok(ScriptBuf::from_bytes(buf))
    }
}

// Short sequences (eg. announced addresses) carry a two-byte count;
// open-ended lists use the compact-size helpers instead.
impl<T: Encode> Encode for &[T] {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let prefix = (self.len() as Size).encode(writer)?;

        self.iter()
            .try_fold(prefix, |n, item| Ok(n + item.encode(&mut *writer)?))
    }
}

impl<T: Decode> Decode for Vec<T> {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        let len = Size::decode(reader)?;

        (0..len).map(|_| T::decode(&mut *reader)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qcheck_macros::quickcheck;

    #[test]
    fn test_varint_boundaries() {
        for value in [0u64, 0xfc, 0xfd, 0xffff, 0x10000, 0xffff_ffff, u64::MAX] {
            let mut buf = Vec::new();
            write_varint(value, &mut buf).unwrap();
            assert_eq!(read_varint(&mut buf.as_slice()).unwrap(), value);
        }
    }

    #[quickcheck]
    fn prop_varint_round_trip(value: u64) -> bool {
        let mut buf = Vec::new();
        write_varint(value, &mut buf).unwrap();

        read_varint(&mut buf.as_slice()).unwrap() == value
    }

    #[test]
    fn test_varint_non_canonical() {
        // 0xfd prefix carrying a value that fits in one byte.
        let buf = [0xfd, 0x00, 0x01];
        assert!(matches!(
            read_varint(&mut buf.as_slice()),
            Err(Error::NonCanonicalSize)
        ));
    }

    #[test]
    fn test_deserialize_rejects_trailing_bytes() {
        let mut buf = serialize(&42u32);
        buf.push(0);

        assert!(matches!(
            deserialize::<u32>(&buf),
            Err(Error::UnexpectedBytes)
        ));
    }
}
