use bytes::BufMut;

pub trait Encode {
	fn encode<W: BufMut>(&self, w: &mut W);
}

impl Encode for u8 {
	fn encode<W: BufMut>(&self, w: &mut W) {
		w.put_u8(*self);
	}
}

impl Encode for u16 {
	fn encode<W: BufMut>(&self, w: &mut W) {
		w.put_u16(*self);
	}
}

impl Encode for u32 {
	fn encode<W: BufMut>(&self, w: &mut W) {
		w.put_u32(*self);
	}
}

impl Encode for u64 {
	fn encode<W: BufMut>(&self, w: &mut W) {
		w.put_u64(*self);
	}
}

impl Encode for f64 {
	fn encode<W: BufMut>(&self, w: &mut W) {
		w.put_f64(*self);
	}
}
