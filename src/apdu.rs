//! ISO-7816-4 application protocol data units.
//!
//! [`ApduCmd`] keeps the raw command bytes and derives the command case
//! once at construction; the protocol engines dispatch on it. [`ApduRsp`]
//! is the response body followed by SW1/SW2. `SW1 = 0x61` and
//! `SW1 = 0x6C` are ordinary responses here, not errors: the T=0 engine
//! treats them as Get-Response signals.

/// Largest response the stack can assemble: 65536 data bytes plus SW.
pub const MAX_RSP_SIZE: usize = 65538;

/// ISO-7816-4 command cases. Case 2 expects response data, case 3
/// carries command data, case 4 does both; `E` variants use extended
/// length fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApduCase {
	One,
	TwoShort,
	ThreeShort,
	FourShort,
	TwoExtended,
	ThreeExtended,
	FourExtended,
	Malformed,
}

impl ApduCase {
	pub fn is_extended(self) -> bool {
		matches!(
			self,
			ApduCase::TwoExtended | ApduCase::ThreeExtended | ApduCase::FourExtended
		)
	}
}

/// A command APDU: `CLA INS P1 P2` plus the optional `Lc | data | Le`
/// body in one of the four short or four extended shapes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApduCmd {
	raw: Vec<u8>,
	case: ApduCase,
}

impl ApduCmd {
	pub fn new(bytes: &[u8]) -> Self {
		let raw = bytes.to_vec();
		let case = derive_case(&raw);
		ApduCmd { raw, case }
	}

	pub fn case(&self) -> ApduCase {
		self.case
	}

	pub fn cla(&self) -> u8 {
		self.raw[0]
	}

	pub fn ins(&self) -> u8 {
		self.raw[1]
	}

	pub fn p1(&self) -> u8 {
		self.raw[2]
	}

	pub fn p2(&self) -> u8 {
		self.raw[3]
	}

	/// Number of command data bytes.
	pub fn lc(&self) -> usize {
		match self.case {
			ApduCase::ThreeShort | ApduCase::FourShort => self.raw[4] as usize,
			ApduCase::ThreeExtended | ApduCase::FourExtended => {
				((self.raw[5] as usize) << 8) | self.raw[6] as usize
			}
			_ => 0,
		}
	}

	/// Number of expected response data bytes. An encoded zero means the
	/// maximum (256 short, 65536 extended).
	pub fn le(&self) -> usize {
		match self.case {
			ApduCase::TwoShort => match self.raw[4] {
				0 => 256,
				le => le as usize,
			},
			ApduCase::FourShort => match self.raw[self.raw.len() - 1] {
				0 => 256,
				le => le as usize,
			},
			ApduCase::TwoExtended => match ((self.raw[5] as usize) << 8) | self.raw[6] as usize {
				0 => 65536,
				le => le,
			},
			ApduCase::FourExtended => {
				let hi = self.raw[self.raw.len() - 2] as usize;
				let lo = self.raw[self.raw.len() - 1] as usize;
				match (hi << 8) | lo {
					0 => 65536,
					le => le,
				}
			}
			_ => 0,
		}
	}

	/// True when the command carries no Le field, or carries an Le field
	/// encoded as zero ("everything available").
	pub fn le_all(&self) -> bool {
		match self.case {
			ApduCase::TwoShort => self.raw[4] == 0,
			ApduCase::FourShort => self.raw[self.raw.len() - 1] == 0,
			ApduCase::TwoExtended => self.raw[5] == 0 && self.raw[6] == 0,
			ApduCase::FourExtended => {
				self.raw[self.raw.len() - 2] == 0 && self.raw[self.raw.len() - 1] == 0
			}
			_ => true,
		}
	}

	/// Command data field (empty for cases 1 and 2).
	pub fn data(&self) -> &[u8] {
		match self.case {
			ApduCase::ThreeShort | ApduCase::FourShort => &self.raw[5..5 + self.lc()],
			ApduCase::ThreeExtended | ApduCase::FourExtended => &self.raw[7..7 + self.lc()],
			_ => &[],
		}
	}

	/// The five header bytes `CLA INS P1 P2 P3` of a TPDU-shaped command.
	pub fn header(&self) -> &[u8] {
		&self.raw[..5.min(self.raw.len())]
	}

	pub fn raw(&self) -> &[u8] {
		&self.raw
	}
}

fn derive_case(raw: &[u8]) -> ApduCase {
	if raw.len() < 4 {
		return ApduCase::Malformed;
	}

	// Length of the body following the four header bytes.
	let body = raw.len() - 4;

	if body == 0 {
		return ApduCase::One;
	}

	let b1 = raw[4] as usize;

	if body == 1 {
		return ApduCase::TwoShort;
	}

	if b1 != 0 {
		if body == 1 + b1 {
			return ApduCase::ThreeShort;
		}
		if body == 2 + b1 {
			return ApduCase::FourShort;
		}
		return ApduCase::Malformed;
	}

	// Extended shapes: B1 == 0, B2/B3 carry the length.
	if body < 3 {
		return ApduCase::Malformed;
	}

	let b2b3 = ((raw[5] as usize) << 8) | raw[6] as usize;

	if body == 3 {
		return ApduCase::TwoExtended;
	}
	if b2b3 != 0 && body == 3 + b2b3 {
		return ApduCase::ThreeExtended;
	}
	if b2b3 != 0 && body == 5 + b2b3 {
		return ApduCase::FourExtended;
	}

	ApduCase::Malformed
}

/// A response APDU: data followed by SW1 SW2.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApduRsp {
	raw: Vec<u8>,
}

impl ApduRsp {
	pub fn new(bytes: &[u8]) -> Self {
		ApduRsp { raw: bytes.to_vec() }
	}

	pub fn sw1(&self) -> u8 {
		if self.raw.len() < 2 {
			return 0;
		}
		self.raw[self.raw.len() - 2]
	}

	pub fn sw2(&self) -> u8 {
		if self.raw.is_empty() {
			return 0;
		}
		self.raw[self.raw.len() - 1]
	}

	pub fn sw(&self) -> u16 {
		((self.sw1() as u16) << 8) | self.sw2() as u16
	}

	/// Response data without the trailing status bytes.
	pub fn data(&self) -> &[u8] {
		&self.raw[..self.raw.len().saturating_sub(2)]
	}

	pub fn data_len(&self) -> usize {
		self.raw.len().saturating_sub(2)
	}

	pub fn raw(&self) -> &[u8] {
		&self.raw
	}

	/// Fold a chained response into this one: the superseded SW1/SW2 of
	/// `self` are dropped and the full body of `tail` (data plus its SW)
	/// takes their place.
	pub fn append(&mut self, tail: &ApduRsp) {
		self.raw.truncate(self.raw.len().saturating_sub(2));
		self.raw.extend_from_slice(&tail.raw);
	}

	/// Clip the data field to `len` bytes, keeping SW1/SW2.
	pub fn truncate_data(&mut self, len: usize) {
		if self.data_len() <= len {
			return;
		}
		let sw1 = self.sw1();
		let sw2 = self.sw2();
		self.raw.truncate(len);
		self.raw.push(sw1);
		self.raw.push(sw2);
	}
}
