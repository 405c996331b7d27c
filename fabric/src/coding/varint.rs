use bytes::{Buf, BufMut};

use super::{decode_remaining, CodecError, Decode, Encode};

/// Variable-length unsigned integer.
///
/// The top two bits of the first byte select the total width (1, 2, 4 or 8
/// bytes); the remaining bits carry the value big-endian. The largest
/// representable value is 2^62 - 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct UintVar(u64);

impl UintVar {
	pub const MAX: u64 = (1 << 62) - 1;

	/// Clamps to [Self::MAX]; the wire cannot carry more.
	pub fn new(value: u64) -> Self {
		Self(value.min(Self::MAX))
	}

	/// Encoded width in bytes for the wrapped value.
	pub fn size(&self) -> usize {
		match self.0 {
			0..=0x3f => 1,
			0x40..=0x3fff => 2,
			0x4000..=0x3fff_ffff => 4,
			_ => 8,
		}
	}

	/// Width of an encoded varint, given its first byte.
	pub fn size_of(first: u8) -> usize {
		match first >> 6 {
			0b00 => 1,
			0b01 => 2,
			0b10 => 4,
			_ => 8,
		}
	}
}

impl From<UintVar> for u64 {
	fn from(v: UintVar) -> Self {
		v.0
	}
}

impl From<u64> for UintVar {
	fn from(v: u64) -> Self {
		Self::new(v)
	}
}

impl Encode for UintVar {
	fn encode<W: BufMut>(&self, w: &mut W) {
		match self.size() {
			1 => w.put_u8(self.0 as u8),
			2 => w.put_u16(self.0 as u16 | 0x4000),
			4 => w.put_u32(self.0 as u32 | 0x8000_0000),
			_ => w.put_u64(self.0 | 0xc000_0000_0000_0000),
		}
	}
}

impl Decode for UintVar {
	fn decode<B: Buf>(r: &mut B) -> Result<Self, CodecError> {
		decode_remaining(r, 1)?;

		let first = r.chunk()[0];
		let value = match Self::size_of(first) {
			1 => r.get_u8() as u64,
			2 => {
				decode_remaining(r, 2)?;
				(r.get_u16() & 0x3fff) as u64
			}
			4 => {
				decode_remaining(r, 4)?;
				(r.get_u32() & 0x3fff_ffff) as u64
			}
			_ => {
				decode_remaining(r, 8)?;
				r.get_u64() & 0x3fff_ffff_ffff_ffff
			}
		};

		Ok(Self(value))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use bytes::BytesMut;

	fn round_trip(value: u64, expected_size: usize) {
		let v = UintVar::new(value);
		assert_eq!(v.size(), expected_size);

		let mut buf = BytesMut::new();
		v.encode(&mut buf);
		assert_eq!(buf.len(), expected_size);

		let mut buf = buf.freeze();
		let decoded = UintVar::decode(&mut buf).unwrap();
		assert_eq!(u64::from(decoded), value);
		assert!(buf.is_empty());
	}

	#[test]
	fn widths() {
		round_trip(0, 1);
		round_trip(63, 1);
		round_trip(64, 2);
		round_trip(16383, 2);
		round_trip(16384, 4);
		round_trip(1_073_741_823, 4);
		round_trip(1_073_741_824, 8);
		round_trip(UintVar::MAX, 8);
	}

	#[test]
	fn short_buffer() {
		let mut buf = bytes::Bytes::from_static(&[0x40]);
		assert_eq!(UintVar::decode(&mut buf), Err(CodecError::ShortBuffer));
	}
}
