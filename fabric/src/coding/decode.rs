use bytes::Buf;

/// A decode failure for a peering frame.
///
/// Any of these closes the peer session that produced the bytes; they are
/// never fatal to the process.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
	#[error("declared length exceeds buffer")]
	ShortBuffer,

	#[error("unknown message type: {0}")]
	UnknownType(u16),

	#[error("unknown peering mode: {0}")]
	UnknownMode(u8),

	#[error("invalid inline header length: {0}")]
	HeaderLenInvalid(u8),

	#[error("invalid field value")]
	InvalidValue,
}

pub trait Decode: Sized {
	fn decode<B: Buf>(r: &mut B) -> Result<Self, CodecError>;
}

/// Error unless the buffer has at least `size` bytes left.
pub fn decode_remaining<B: Buf>(r: &B, size: usize) -> Result<(), CodecError> {
	match r.remaining() >= size {
		true => Ok(()),
		false => Err(CodecError::ShortBuffer),
	}
}

impl Decode for u8 {
	fn decode<B: Buf>(r: &mut B) -> Result<Self, CodecError> {
		decode_remaining(r, 1)?;
		Ok(r.get_u8())
	}
}

impl Decode for u16 {
	fn decode<B: Buf>(r: &mut B) -> Result<Self, CodecError> {
		decode_remaining(r, 2)?;
		Ok(r.get_u16())
	}
}

impl Decode for u32 {
	fn decode<B: Buf>(r: &mut B) -> Result<Self, CodecError> {
		decode_remaining(r, 4)?;
		Ok(r.get_u32())
	}
}

impl Decode for u64 {
	fn decode<B: Buf>(r: &mut B) -> Result<Self, CodecError> {
		decode_remaining(r, 8)?;
		Ok(r.get_u64())
	}
}

impl Decode for f64 {
	fn decode<B: Buf>(r: &mut B) -> Result<Self, CodecError> {
		decode_remaining(r, 8)?;
		Ok(r.get_f64())
	}
}
