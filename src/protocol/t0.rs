//! ISO-7816-3 T=0: APDU to TPDU mapping and the procedure byte machine.
//!
//! Every APDU case is mapped onto one or more 5-byte-headed TPDUs.
//! Inside an exchange the card answers one procedure byte at a time:
//! NULL (keep waiting), ACK (move the whole data field), the inverted
//! ACK (move a single byte), or SW1 followed by SW2. Short-APDU
//! transports carry extended commands by envelope chaining and collect
//! long responses through iterated Get-Response.

use crate::apdu::{ApduCase, ApduCmd, ApduRsp};
use crate::icc::asynch::AsyncIcc;
use crate::ifd::Ifd;
use crate::protocol::{ProtocolError, ProtocolParameters};
use crate::serial::SerialPort;

/// NULL bytes tolerated within one exchange.
const MAX_NULLS: usize = 200;
/// Longest TPDU: header plus 255 data bytes.
const MAX_SHORT_COMMAND: usize = 260;
/// Longest TPDU answer: 256 data bytes plus SW.
const MAX_SHORT_RESPONSE: usize = 258;

/// The T=0 engine. Holds the work waiting time derived from the ATR and
/// the negotiated Fi; everything else lives in the ICC.
#[derive(Debug)]
pub struct T0 {
	wwt: u32,
	iso_strict: bool,
}

impl T0 {
	/// Set up the engine and push the work waiting time into the ICC
	/// timings: `WWT = 960 * WI * Fi / f`, in milliseconds.
	pub fn new<S: SerialPort>(
		ifd: &Ifd<S>,
		icc: &mut AsyncIcc,
		params: &ProtocolParameters,
		iso_strict: bool,
	) -> T0 {
		let wi = icc.atr().wi();
		let wwt = (960u64 * wi as u64 * params.f as u64 * 1000 / ifd.clock_rate() as u64) as u32;

		let mut timings = icc.timings();
		timings.block_timeout = wwt;
		timings.char_timeout = wwt;
		icc.set_timings(timings);

		debug!("T=0: WWT = {wwt} ms");

		T0 { wwt, iso_strict }
	}

	pub fn wwt(&self) -> u32 {
		self.wwt
	}

	/// Carry one APDU, dispatching on its case.
	pub fn command<S: SerialPort>(
		&mut self,
		ifd: &mut Ifd<S>,
		icc: &mut AsyncIcc,
		cmd: &ApduCmd,
	) -> Result<ApduRsp, ProtocolError> {
		debug!("T=0: case {:?}", cmd.case());

		match cmd.case() {
			ApduCase::One => self.case_1(ifd, icc, cmd),
			ApduCase::TwoShort => self.case_2s(ifd, icc, cmd),
			ApduCase::ThreeShort => self.case_3s(ifd, icc, cmd),
			ApduCase::FourShort => self.case_4s(ifd, icc, cmd),
			ApduCase::TwoExtended => self.case_2e(ifd, icc, cmd),
			ApduCase::ThreeExtended => self.case_3e(ifd, icc, cmd),
			ApduCase::FourExtended => self.case_4e(ifd, icc, cmd),
			ApduCase::Malformed => Err(ProtocolError::Protocol),
		}
	}

	/// Header only: synthesize the P3 = 0x00 TPDU.
	fn case_1<S: SerialPort>(
		&mut self,
		ifd: &mut Ifd<S>,
		icc: &mut AsyncIcc,
		cmd: &ApduCmd,
	) -> Result<ApduRsp, ProtocolError> {
		let mut tpdu = [0u8; 5];
		tpdu[..4].copy_from_slice(&cmd.raw()[..4]);
		self.exchange_tpdu(ifd, icc, &ApduCmd::new(&tpdu))
	}

	/// Response expected: the TPDU is the command itself; afterwards the
	/// SW decides whether to re-issue with La or chain Get-Response.
	fn case_2s<S: SerialPort>(
		&mut self,
		ifd: &mut Ifd<S>,
		icc: &mut AsyncIcc,
		cmd: &ApduCmd,
	) -> Result<ApduRsp, ProtocolError> {
		let mut rsp = self.exchange_tpdu(ifd, icc, cmd)?;

		if !self.iso_strict {
			return Ok(rsp);
		}

		match rsp.sw1() {
			// Le definitely not accepted.
			0x67 => Ok(rsp),

			// Le not accepted, La indicated: re-issue with La.
			0x6C => {
				let mut tpdu = [0u8; 5];
				tpdu[..4].copy_from_slice(&cmd.raw()[..4]);
				tpdu[4] = rsp.sw2();

				let mut rsp = self.exchange_tpdu(ifd, icc, &ApduCmd::new(&tpdu))?;
				if rsp.data_len() > cmd.le() {
					rsp.truncate_data(cmd.le());
				}
				Ok(rsp)
			}

			// Command processed, Lx indicated: collect via Get-Response.
			0x61 => {
				loop {
					let tpdu = [cmd.cla(), 0xC0, 0x00, 0x00, rsp.sw2()];
					let chunk = self.exchange_tpdu(ifd, icc, &ApduCmd::new(&tpdu))?;
					rsp.append(&chunk);

					if rsp.sw1() != 0x61 {
						break;
					}
				}

				if rsp.data_len() > cmd.le() {
					rsp.truncate_data(cmd.le());
				}
				Ok(rsp)
			}

			// Le accepted.
			_ => Ok(rsp),
		}
	}

	/// Command data, no response expected: a single exchange.
	fn case_3s<S: SerialPort>(
		&mut self,
		ifd: &mut Ifd<S>,
		icc: &mut AsyncIcc,
		cmd: &ApduCmd,
	) -> Result<ApduRsp, ProtocolError> {
		self.exchange_tpdu(ifd, icc, cmd)
	}

	/// Data and response: send header plus data, then fetch the response
	/// the card announced.
	fn case_4s<S: SerialPort>(
		&mut self,
		ifd: &mut Ifd<S>,
		icc: &mut AsyncIcc,
		cmd: &ApduCmd,
	) -> Result<ApduRsp, ProtocolError> {
		// Strip the Le byte; what remains is a legal TPDU.
		let tpdu = ApduCmd::new(&cmd.raw()[..cmd.raw().len() - 1]);
		let rsp = self.exchange_tpdu(ifd, icc, &tpdu)?;

		if !self.iso_strict {
			return Ok(rsp);
		}

		if rsp.sw1() == 0x61 {
			// Command accepted with information added.
			let le = if rsp.sw2() == 0x00 {
				cmd.le() as u8
			} else {
				cmd.le().min(rsp.sw2() as usize) as u8
			};
			let tpdu = [cmd.cla(), 0xC0, 0x00, 0x00, le];
			self.exchange_tpdu(ifd, icc, &ApduCmd::new(&tpdu))
		} else if rsp.sw1() & 0xF0 == 0x60 {
			// Not accepted; pass the SW through.
			Ok(rsp)
		} else {
			// Accepted silently: fetch Le bytes with a fresh exchange.
			let tpdu = [cmd.cla(), 0xC0, 0x00, 0x00, cmd.le() as u8];
			self.case_2s(ifd, icc, &ApduCmd::new(&tpdu))
		}
	}

	/// Extended Le only. Up to 256 bytes this is a short case; beyond,
	/// the response is assembled through iterated Get-Response until Le
	/// is satisfied or the card runs dry.
	fn case_2e<S: SerialPort>(
		&mut self,
		ifd: &mut Ifd<S>,
		icc: &mut AsyncIcc,
		cmd: &ApduCmd,
	) -> Result<ApduRsp, ProtocolError> {
		let le = cmd.le();

		if le <= 256 {
			let tpdu = [cmd.cla(), cmd.ins(), cmd.p1(), cmd.p2(), le as u8];
			return self.case_2s(ifd, icc, &ApduCmd::new(&tpdu));
		}

		let tpdu = [cmd.cla(), cmd.ins(), cmd.p1(), cmd.p2(), 0x00];
		let mut rsp = self.exchange_tpdu(ifd, icc, &ApduCmd::new(&tpdu))?;

		match rsp.sw1() {
			// Le definitely not accepted.
			0x67 => Ok(rsp),

			// Le not accepted, La indicated.
			0x6C => {
				let mut tpdu = [0u8; 5];
				tpdu[..4].copy_from_slice(&cmd.raw()[..4]);
				tpdu[4] = rsp.sw2();
				self.exchange_tpdu(ifd, icc, &ApduCmd::new(&tpdu))
			}

			// Lx indicated: iterate until Le bytes are collected.
			0x61 => {
				let lx = match rsp.sw2() {
					0 => 256,
					lx => lx as usize,
				};

				while le > rsp.data_len() {
					let lm = le - rsp.data_len();
					let tpdu = [cmd.cla(), 0xC0, 0x00, 0x00, lm.min(lx) as u8];
					let chunk = self.exchange_tpdu(ifd, icc, &ApduCmd::new(&tpdu))?;
					rsp.append(&chunk);
				}
				Ok(rsp)
			}

			// Le accepted, or the card has no Get-Response.
			_ => Ok(rsp),
		}
	}

	/// Extended Lc only. Short data fits a plain TPDU; longer commands
	/// are envelope-fragmented, 255 raw bytes per envelope.
	fn case_3e<S: SerialPort>(
		&mut self,
		ifd: &mut Ifd<S>,
		icc: &mut AsyncIcc,
		cmd: &ApduCmd,
	) -> Result<ApduRsp, ProtocolError> {
		let lc = cmd.lc();

		if lc < 256 {
			let mut tpdu = Vec::with_capacity(5 + lc);
			tpdu.extend_from_slice(&[cmd.cla(), cmd.ins(), cmd.p1(), cmd.p2(), lc as u8]);
			tpdu.extend_from_slice(cmd.data());
			return self.exchange_tpdu(ifd, icc, &ApduCmd::new(&tpdu));
		}

		let raw = cmd.raw();
		let mut sent = 0;

		loop {
			let chunk = (raw.len() - sent).min(MAX_SHORT_COMMAND - 5);
			let mut tpdu = Vec::with_capacity(5 + chunk);
			tpdu.extend_from_slice(&[cmd.cla(), 0xC2, 0x00, 0x00, chunk as u8]);
			tpdu.extend_from_slice(&raw[sent..sent + chunk]);

			let rsp = self.exchange_tpdu(ifd, icc, &ApduCmd::new(&tpdu))?;
			sent += chunk;

			// Any SW other than 0x90 means the card rejected the
			// envelope (or the command); pass it through.
			if rsp.sw1() != 0x90 || sent >= raw.len() {
				return Ok(rsp);
			}
		}
	}

	/// Extended Lc and Le: deliver the data (envelope-chained when
	/// needed), then collect via the extended Get-Response path.
	fn case_4e<S: SerialPort>(
		&mut self,
		ifd: &mut Ifd<S>,
		icc: &mut AsyncIcc,
		cmd: &ApduCmd,
	) -> Result<ApduRsp, ProtocolError> {
		let rsp = if cmd.lc() < 256 {
			let mut tpdu = Vec::with_capacity(5 + cmd.lc());
			tpdu.extend_from_slice(&[cmd.cla(), cmd.ins(), cmd.p1(), cmd.p2(), cmd.lc() as u8]);
			tpdu.extend_from_slice(cmd.data());
			self.exchange_tpdu(ifd, icc, &ApduCmd::new(&tpdu))?
		} else {
			self.case_3e(ifd, icc, cmd)?
		};

		if rsp.sw1() == 0x61 {
			let le = if rsp.sw2() != 0x00 {
				cmd.le().min(rsp.sw2() as usize)
			} else {
				cmd.le()
			};
			let gr = [
				cmd.cla(),
				0xC0,
				0x00,
				0x00,
				0x00,
				(le >> 8) as u8,
				(le & 0xFF) as u8,
			];
			self.case_2e(ifd, icc, &ApduCmd::new(&gr))
		} else if rsp.sw1() & 0xF0 == 0x60 {
			Ok(rsp)
		} else {
			let le = cmd.le();
			let gr = [
				cmd.cla(),
				0xC0,
				0x00,
				0x00,
				0x00,
				(le >> 8) as u8,
				(le & 0xFF) as u8,
			];
			self.case_2e(ifd, icc, &ApduCmd::new(&gr))
		}
	}

	/// One TPDU on the wire: send the header, then follow the card's
	/// procedure bytes until SW1 SW2 arrive. The line is turned around
	/// before any transmit that follows a receive, and once more at the
	/// end of the exchange.
	fn exchange_tpdu<S: SerialPort>(
		&mut self,
		ifd: &mut Ifd<S>,
		icc: &mut AsyncIcc,
		tpdu: &ApduCmd,
	) -> Result<ApduRsp, ProtocolError> {
		// Only header-plus-data or header-plus-Le shapes are legal here.
		let sending = match tpdu.case() {
			ApduCase::ThreeShort => true,
			ApduCase::TwoShort => false,
			_ => return Err(ProtocolError::Protocol),
		};

		let lc = tpdu.lc();
		let le = if sending { 0 } else { tpdu.le() };
		let data = tpdu.data();
		let ins = tpdu.ins();

		icc.begin_transmission(ifd)?;

		if let Err(err) = icc.transmit(ifd, tpdu.header()) {
			let _ = icc.end_transmission(ifd);
			return Err(err.into());
		}

		let mut buf = [0u8; MAX_SHORT_RESPONSE];
		let mut recv: usize = 0;
		let mut sent: usize = 0;
		let mut nulls = 0;
		let mut outcome: Result<(), ProtocolError> = Ok(());

		while recv < MAX_SHORT_RESPONSE {
			if let Err(err) = icc.receive(ifd, &mut buf[recv..recv + 1]) {
				outcome = Err(err.into());
				break;
			}

			let byte = buf[recv];

			// NULL: the card is stalling.
			if byte == 0x60 {
				nulls += 1;
				if nulls >= MAX_NULLS {
					outcome = Err(ProtocolError::NullLimit);
					break;
				}
				continue;
			}

			// SW1: read SW2 and the exchange is complete.
			if byte & 0xF0 == 0x60 || byte & 0xF0 == 0x90 {
				recv += 1;
				if recv >= MAX_SHORT_RESPONSE {
					outcome = Err(ProtocolError::Protocol);
					break;
				}
				if let Err(err) = icc.receive(ifd, &mut buf[recv..recv + 1]) {
					outcome = Err(err.into());
					break;
				}
				recv += 1;
				break;
			}

			// ACK: move the remaining data field at once.
			if byte & 0x0E == ins & 0x0E {
				nulls = 0;

				if sending {
					if sent >= lc {
						outcome = Err(ProtocolError::Protocol);
						break;
					}
					if let Err(err) = icc.switch(ifd) {
						outcome = Err(err.into());
						break;
					}
					if let Err(err) = icc.transmit(ifd, &data[sent..]) {
						outcome = Err(err.into());
						break;
					}
					sent = lc;
				} else {
					if recv >= MAX_SHORT_RESPONSE {
						outcome = Err(ProtocolError::Protocol);
						break;
					}
					let want = le.saturating_sub(recv);
					if let Err(err) = icc.receive(ifd, &mut buf[recv..recv + want]) {
						outcome = Err(err.into());
						break;
					}
					recv = le;
				}
				continue;
			}

			// Inverted ACK: move a single byte.
			if byte & 0x0E == !ins & 0x0E {
				nulls = 0;

				if sending {
					if sent >= lc {
						outcome = Err(ProtocolError::Protocol);
						break;
					}
					if let Err(err) = icc.switch(ifd) {
						outcome = Err(err.into());
						break;
					}
					if let Err(err) = icc.transmit(ifd, &data[sent..sent + 1]) {
						outcome = Err(err.into());
						break;
					}
					sent += 1;
				} else {
					if recv >= MAX_SHORT_RESPONSE {
						outcome = Err(ProtocolError::Protocol);
						break;
					}
					if let Err(err) = icc.receive(ifd, &mut buf[recv..recv + 1]) {
						outcome = Err(err.into());
						break;
					}
					recv += 1;
				}
				continue;
			}

			// Anything else is a protocol violation.
			outcome = Err(ProtocolError::Protocol);
			break;
		}

		if let Err(err) = icc.switch(ifd) {
			outcome = Err(err.into());
		}

		let result = outcome.map(|()| ApduRsp::new(&buf[..recv]));

		icc.end_transmission(ifd)?;

		result
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::atr::Atr;
	use crate::ifd::SLOT_A;
	use crate::testutil::{MockSerial, Reply, ifd_for_test};

	const ATR: [u8; 9] = [0x3B, 0x65, 0x00, 0x00, 0x9C, 0x11, 0x01, 0x01, 0x03];

	fn engine() -> (AsyncIcc, T0) {
		let mut icc = AsyncIcc::for_test(Atr::from_bytes(&ATR).unwrap());
		let params = ProtocolParameters { t: 0, f: 372, d: 1, n: 0 };
		let ifd = ifd_for_test(MockSerial::new(), SLOT_A);
		let t0 = T0::new(&ifd, &mut icc, &params, true);
		(icc, t0)
	}

	#[test]
	fn wwt_follows_the_atr_defaults() {
		let (icc, t0) = engine();
		// WI 10, Fi 372, 3.5712 MHz clock: exactly one second.
		assert_eq!(t0.wwt(), 1000);
		assert_eq!(icc.timings().block_timeout, 1000);
		assert_eq!(icc.timings().char_timeout, 1000);
	}

	#[test]
	fn case_1_synthesizes_p3_zero() {
		let (mut icc, mut t0) = engine();
		let mut io = MockSerial::new();
		io.push(Reply::Data(vec![0x90, 0x00]));
		let mut ifd = ifd_for_test(io, SLOT_A);

		let rsp = t0
			.command(&mut ifd, &mut icc, &ApduCmd::new(&[0x00, 0xF2, 0x01, 0x02]))
			.unwrap();
		assert_eq!(rsp.sw(), 0x9000);

		let writes = ifd.into_io().writes;
		// Block header, then the 5-byte TPDU.
		assert_eq!(writes[1], vec![0x00, 0xF2, 0x01, 0x02, 0x00]);
	}

	#[test]
	fn select_chains_get_response() {
		// SELECT 3F00 as case 4S: header+data first, then 61 0F answers
		// and a Get-Response TPDU collects 15 bytes plus 90 00.
		let (mut icc, mut t0) = engine();
		let mut io = MockSerial::new();
		// ACK for the SELECT header, then SW 61 0F.
		io.push(Reply::Data(vec![0xA4]));
		io.push(Reply::Data(vec![0x61, 0x0F]));
		// Get-Response: ACK, 15 data bytes, SW 90 00.
		io.push(Reply::Data(vec![0xC0]));
		let fci: Vec<u8> = (1..=15).collect();
		io.push(Reply::Data(fci.clone()));
		io.push(Reply::Data(vec![0x90, 0x00]));
		let mut ifd = ifd_for_test(io, SLOT_A);

		let cmd = ApduCmd::new(&[0x00, 0xA4, 0x00, 0x00, 0x02, 0x3F, 0x00, 0x00]);
		let rsp = t0.command(&mut ifd, &mut icc, &cmd).unwrap();

		assert_eq!(rsp.data(), &fci[..]);
		assert_eq!(rsp.sw(), 0x9000);

		let writes = ifd.into_io().writes;
		// SELECT header, its data after the ACK, then the Get-Response
		// TPDU the 61 0F triggered (each preceded by a block header).
		assert_eq!(writes[1], vec![0x00, 0xA4, 0x00, 0x00, 0x02]);
		assert_eq!(writes[3], vec![0x3F, 0x00]);
		assert_eq!(writes[5], vec![0x00, 0xC0, 0x00, 0x00, 0x0F]);
	}

	#[test]
	fn la_indication_reissues_the_command() {
		let (mut icc, mut t0) = engine();
		let mut io = MockSerial::new();
		// 6C 02: wrong Le, La = 2.
		io.push(Reply::Data(vec![0x6C, 0x02]));
		// Re-issue: ACK, 2 bytes, SW.
		io.push(Reply::Data(vec![0xB0]));
		io.push(Reply::Data(vec![0xAB, 0xCD, 0x90, 0x00]));
		let mut ifd = ifd_for_test(io, SLOT_A);

		let cmd = ApduCmd::new(&[0x00, 0xB0, 0x00, 0x00, 0x10]);
		let rsp = t0.command(&mut ifd, &mut icc, &cmd).unwrap();
		assert_eq!(rsp.data(), &[0xAB, 0xCD]);
		assert_eq!(rsp.sw(), 0x9000);

		let writes = ifd.into_io().writes;
		assert_eq!(writes[3], vec![0x00, 0xB0, 0x00, 0x00, 0x02]);
	}

	#[test]
	fn null_storm_fails_and_leaves_the_engine_usable() {
		let (mut icc, mut t0) = engine();
		let mut io = MockSerial::new();
		io.push(Reply::Data(vec![0x60; MAX_NULLS]));
		let mut ifd = ifd_for_test(io, SLOT_A);

		let cmd = ApduCmd::new(&[0x00, 0xF2, 0x01, 0x02]);
		assert!(matches!(
			t0.command(&mut ifd, &mut icc, &cmd),
			Err(ProtocolError::NullLimit)
		));

		// The next APDU proceeds normally.
		let mut io = MockSerial::new();
		io.push(Reply::Data(vec![0x90, 0x00]));
		let mut ifd = ifd_for_test(io, SLOT_A);
		let rsp = t0.command(&mut ifd, &mut icc, &cmd).unwrap();
		assert_eq!(rsp.sw(), 0x9000);
	}

	#[test]
	fn inverted_ack_moves_single_bytes() {
		let (mut icc, mut t0) = engine();
		let mut io = MockSerial::new();
		// INS = 0xD6; ~INS & 0x0E = 0x28 & 0x0E.
		let nack = !0xD6u8;
		io.push(Reply::Data(vec![nack]));
		io.push(Reply::Data(vec![nack]));
		io.push(Reply::Data(vec![0x90, 0x00]));
		let mut ifd = ifd_for_test(io, SLOT_A);

		let cmd = ApduCmd::new(&[0x00, 0xD6, 0x00, 0x00, 0x02, 0x11, 0x22]);
		let rsp = t0.command(&mut ifd, &mut icc, &cmd).unwrap();
		assert_eq!(rsp.sw(), 0x9000);

		let writes = ifd.into_io().writes;
		// Header, then two single-byte transmits.
		assert_eq!(writes[1], vec![0x00, 0xD6, 0x00, 0x00, 0x02]);
		assert_eq!(writes[3], vec![0x11]);
		assert_eq!(writes[5], vec![0x22]);
	}

	#[test]
	fn unexpected_procedure_byte_is_a_protocol_error() {
		let (mut icc, mut t0) = engine();
		let mut io = MockSerial::new();
		io.push(Reply::Data(vec![0x33]));
		let mut ifd = ifd_for_test(io, SLOT_A);

		let cmd = ApduCmd::new(&[0x00, 0xF2, 0x01, 0x02]);
		assert!(matches!(
			t0.command(&mut ifd, &mut icc, &cmd),
			Err(ProtocolError::Protocol)
		));
	}

	#[test]
	fn malformed_apdu_is_rejected() {
		let (mut icc, mut t0) = engine();
		let mut ifd = ifd_for_test(MockSerial::new(), SLOT_A);
		assert!(matches!(
			t0.command(&mut ifd, &mut icc, &ApduCmd::new(&[0x00, 0xA4])),
			Err(ProtocolError::Protocol)
		));
	}

	#[test]
	fn extended_le_iterates_get_response() {
		// Le = 512: the card answers 61 00 and serves two 256-byte
		// chunks through Get-Response.
		let (mut icc, mut t0) = engine();
		let mut io = MockSerial::new();
		io.push(Reply::Data(vec![0x61, 0x00]));
		for _ in 0..2 {
			io.push(Reply::Data(vec![0xB0])); // ACK
			io.push(Reply::Data(vec![0x55; 256]));
			io.push(Reply::Data(vec![0x61, 0x00]));
		}
		let mut ifd = ifd_for_test(io, SLOT_A);

		let cmd = ApduCmd::new(&[0x00, 0xB0, 0x00, 0x00, 0x00, 0x02, 0x00]);
		let rsp = t0.command(&mut ifd, &mut icc, &cmd).unwrap();
		assert_eq!(rsp.data_len(), 512);

		let writes = ifd.into_io().writes;
		// Both Get-Response TPDUs request a full 256-byte chunk.
		assert_eq!(writes[3], vec![0x00, 0xC0, 0x00, 0x00, 0x00]);
		assert_eq!(writes[5], vec![0x00, 0xC0, 0x00, 0x00, 0x00]);
	}

	#[test]
	fn extended_le_65536_collects_fully() {
		// Le = 0 extended means 65536: 256 Get-Response rounds of 256
		// bytes each, the last one closing with 90 00.
		let (mut icc, mut t0) = engine();
		let mut io = MockSerial::new();
		io.push(Reply::Data(vec![0x61, 0x00]));
		for round in 0..256 {
			io.push(Reply::Data(vec![0xB0])); // ACK
			io.push(Reply::Data(vec![round as u8; 256]));
			if round == 255 {
				io.push(Reply::Data(vec![0x90, 0x00]));
			} else {
				io.push(Reply::Data(vec![0x61, 0x00]));
			}
		}
		let mut ifd = ifd_for_test(io, SLOT_A);

		let cmd = ApduCmd::new(&[0x00, 0xB0, 0x00, 0x00, 0x00, 0x00, 0x00]);
		assert_eq!(cmd.le(), 65536);

		let rsp = t0.command(&mut ifd, &mut icc, &cmd).unwrap();
		assert_eq!(rsp.data_len(), 65536);
		assert_eq!(rsp.sw(), 0x9000);
		assert_eq!(rsp.data()[0], 0x00);
		assert_eq!(rsp.data()[65535], 0xFF);
	}

	#[test]
	fn case_4e_delivers_data_then_collects_extended() {
		// Lc = 2, Le = 288: data in one TPDU, then the 61 00 answer
		// routes through the extended Get-Response path.
		let (mut icc, mut t0) = engine();
		let mut io = MockSerial::new();
		io.push(Reply::Data(vec![0xCB])); // ACK for the data TPDU
		io.push(Reply::Data(vec![0x61, 0x00]));
		io.push(Reply::Data(vec![0x61, 0x00])); // probe TPDU answer
		io.push(Reply::Data(vec![0xC0])); // first chunk
		io.push(Reply::Data(vec![0x55; 256]));
		io.push(Reply::Data(vec![0x61, 0x20]));
		io.push(Reply::Data(vec![0xC0])); // final chunk
		io.push(Reply::Data(vec![0x66; 32]));
		io.push(Reply::Data(vec![0x90, 0x00]));
		let mut ifd = ifd_for_test(io, SLOT_A);

		let mut apdu = vec![0x00, 0xCB, 0x00, 0x00, 0x00, 0x00, 0x02, 0xAA, 0xBB];
		apdu.extend_from_slice(&[0x01, 0x20]);
		let cmd = ApduCmd::new(&apdu);
		assert_eq!(cmd.case(), ApduCase::FourExtended);
		assert_eq!(cmd.le(), 288);

		let rsp = t0.command(&mut ifd, &mut icc, &cmd).unwrap();
		assert_eq!(rsp.data_len(), 288);
		assert_eq!(rsp.sw(), 0x9000);
	}

	#[test]
	fn extended_lc_envelopes_the_raw_apdu() {
		// Lc = 300: the whole raw APDU (307 bytes) travels in two
		// envelopes of 255 and 52 bytes.
		let (mut icc, mut t0) = engine();
		let mut io = MockSerial::new();
		for _ in 0..2 {
			io.push(Reply::Data(vec![0xC2])); // ACK
			io.push(Reply::Data(vec![0x90, 0x00]));
		}
		let mut ifd = ifd_for_test(io, SLOT_A);

		let mut apdu = vec![0x00, 0xD6, 0x00, 0x00, 0x00, 0x01, 0x2C];
		apdu.extend_from_slice(&[0x77; 300]);
		let cmd = ApduCmd::new(&apdu);
		assert_eq!(cmd.case(), ApduCase::ThreeExtended);

		let rsp = t0.command(&mut ifd, &mut icc, &cmd).unwrap();
		assert_eq!(rsp.sw(), 0x9000);

		let writes = ifd.into_io().writes;
		assert_eq!(writes[1], vec![0x00, 0xC2, 0x00, 0x00, 0xFF]);
		assert_eq!(writes[3].len(), 255);
		assert_eq!(writes[5], vec![0x00, 0xC2, 0x00, 0x00, 52]);
		assert_eq!(writes[7].len(), 52);
	}
}
