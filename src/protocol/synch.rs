//! Interindustry command set on synchronous memory cards.
//!
//! Emulates the MCT v0.9 part 7 subset (SELECT FILE, READ BINARY,
//! UPDATE BINARY, VERIFY, CHANGE REFERENCE DATA) on top of the raw
//! memory a synchronous card offers. File selection resolves the well
//! known FIDs (master file, ATR file, DIR file) and application AIDs by
//! walking the BER-TLV directory the card's header points at; the
//! currently selected data section is a plain `(path, length)` window
//! into memory.

use crate::apdu::{self, ApduCmd, ApduRsp};
use crate::icc::synch::{PIN_SIZE, SyncIcc, SyncIccError};
use crate::ifd::Ifd;
use crate::protocol::ProtocolError;
use crate::serial::SerialPort;
use crate::tlv::{self, Tlv, TlvSource};

/// Selectable data-section FIDs.
const FID_MF: u16 = 0x3F00;
const FID_DIR: u16 = 0x2F00;
const FID_ATR: u16 = 0x2F01;

/// Longest application identifier accepted in a SELECT.
const AID_SIZE: usize = 16;

/// Memory card behind the TLV walker: every fetch is a card read.
struct MemorySource<'a, S: SerialPort> {
	ifd: &'a mut Ifd<S>,
	icc: &'a mut SyncIcc,
}

impl<S: SerialPort> TlvSource for MemorySource<'_, S> {
	fn read(&mut self, address: u16, buf: &mut [u8]) -> bool {
		self.icc.read(self.ifd, address, buf).is_ok()
	}
}

/// The protocol handler: the selected data section within card memory.
#[derive(Debug)]
pub struct SyncProtocol {
	path: u16,
	length: u16,
}

impl SyncProtocol {
	/// A fresh handler has the master file (all of memory) selected.
	pub fn new(icc: &SyncIcc) -> SyncProtocol {
		SyncProtocol {
			path: 0,
			length: icc.length() as u16,
		}
	}

	/// Execute one interindustry command. Unknown instructions answer
	/// `6E 00` (class not supported).
	pub fn command<S: SerialPort>(
		&mut self,
		ifd: &mut Ifd<S>,
		icc: &mut SyncIcc,
		cmd: &ApduCmd,
	) -> Result<ApduRsp, ProtocolError> {
		icc.begin_transmission(ifd).map_err(SyncIccError::from)?;

		match cmd.ins() {
			0xA4 => self.select_file(ifd, icc, cmd),
			0xB0 => self.read_binary(ifd, icc, cmd),
			0xD6 => self.update_binary(ifd, icc, cmd),
			0x20 => self.verify(ifd, icc, cmd),
			0x24 => self.change_reference_data(ifd, icc, cmd),
			other => {
				debug!("sync: unsupported instruction {other:#04x}");
				Ok(sw(0x6E, 0x00))
			}
		}
	}

	fn select_file<S: SerialPort>(
		&mut self,
		ifd: &mut Ifd<S>,
		icc: &mut SyncIcc,
		cmd: &ApduCmd,
	) -> Result<ApduRsp, ProtocolError> {
		match cmd.p1() {
			0x00 => Ok(self.select_by_fid(ifd, icc, cmd)),
			0x04 => Ok(self.select_by_aid(ifd, icc, cmd)),
			// Bad selection control.
			_ => Ok(sw(0x6A, 0x82)),
		}
	}

	fn select_by_fid<S: SerialPort>(
		&mut self,
		ifd: &mut Ifd<S>,
		icc: &mut SyncIcc,
		cmd: &ApduCmd,
	) -> ApduRsp {
		let data = cmd.data();
		if data.len() < 2 {
			return sw(0x6A, 0x82);
		}
		let fid = ((data[0] as u16) << 8) | data[1] as u16;
		let memory = icc.length() as u16;

		match fid {
			FID_MF => {
				self.path = 0;
				self.length = memory;
				sw(0x90, 0x00)
			}

			FID_ATR => {
				// The ATR file spans byte 4 up to the DIR reference.
				let atr = *icc.atr();
				if atr.has_dir_reference() && atr.dir_reference() > 4 && memory > 4 {
					self.path = 4;
					self.length = atr.dir_reference().min(memory) - 4;
					sw(0x90, 0x00)
				} else {
					sw(0x6A, 0x82)
				}
			}

			FID_DIR => {
				let atr = *icc.atr();
				if !atr.has_dir_reference() {
					return sw(0x6A, 0x82);
				}
				let mut src = MemorySource { ifd, icc };
				match Tlv::parse(&mut src, memory, atr.dir_reference()) {
					Some(dir) => {
						self.path = dir.address();
						self.length = dir.raw_length();
						sw(0x90, 0x00)
					}
					None => sw(0x6A, 0x82),
				}
			}

			_ => sw(0x6A, 0x82),
		}
	}

	fn select_by_aid<S: SerialPort>(
		&mut self,
		ifd: &mut Ifd<S>,
		icc: &mut SyncIcc,
		cmd: &ApduCmd,
	) -> ApduRsp {
		let aid_len = cmd.lc().min(AID_SIZE);
		let aid = &cmd.data()[..aid_len];
		let memory = icc.length() as u16;

		let atr = *icc.atr();
		if !atr.has_dir_reference() {
			return sw(0x6A, 0x82);
		}

		let mut src = MemorySource { ifd, icc };
		match locate_application(&mut src, memory, atr.dir_reference(), aid) {
			Some((path, length)) => {
				self.path = path;
				self.length = length;
				sw(0x90, 0x00)
			}
			None => sw(0x6A, 0x82),
		}
	}

	fn read_binary<S: SerialPort>(
		&mut self,
		ifd: &mut Ifd<S>,
		icc: &mut SyncIcc,
		cmd: &ApduCmd,
	) -> Result<ApduRsp, ProtocolError> {
		let offset = ((cmd.p1() as usize) << 8) | cmd.p2() as usize;
		let available = (self.length as usize).saturating_sub(offset);

		// A missing or zero Le asks for everything in the section.
		let expected = if cmd.le_all() { available } else { cmd.le() };
		let expected = expected.min(apdu::MAX_RSP_SIZE - 2);

		let short = expected > available;
		let count = expected.min(available);

		let mut buffer = vec![0u8; count + 2];
		if count > 0
			&& icc
				.read(ifd, self.path + offset as u16, &mut buffer[..count])
				.is_err()
		{
			error!("sync: memory read failed at offset {offset}");
			return Ok(sw(0x65, 0x01));
		}

		let (sw1, sw2) = if short { (0x62, 0x82) } else { (0x90, 0x00) };
		buffer[count] = sw1;
		buffer[count + 1] = sw2;

		Ok(ApduRsp::new(&buffer))
	}

	fn update_binary<S: SerialPort>(
		&mut self,
		ifd: &mut Ifd<S>,
		icc: &mut SyncIcc,
		cmd: &ApduCmd,
	) -> Result<ApduRsp, ProtocolError> {
		let offset = ((cmd.p1() as usize) << 8) | cmd.p2() as usize;
		let available = (self.length as usize).saturating_sub(offset);
		let provided = cmd.lc();
		let count = available.min(provided);

		if count > 0 {
			match icc.write(ifd, self.path + offset as u16, &cmd.data()[..count]) {
				Ok(()) => {}
				Err(SyncIccError::ReadOnly) => return Ok(sw(0x62, 0x00)),
				Err(err) => {
					error!("sync: memory write failed: {err}");
					return Ok(sw(0x62, 0x00));
				}
			}
		}

		if available < provided {
			// Trailing bytes fell off the end of the section.
			return Ok(sw(0x62, 0x00));
		}

		Ok(sw(0x90, 0x00))
	}

	fn verify<S: SerialPort>(
		&mut self,
		ifd: &mut Ifd<S>,
		icc: &mut SyncIcc,
		cmd: &ApduCmd,
	) -> Result<ApduRsp, ProtocolError> {
		let mut pin = [0u8; PIN_SIZE];
		let n = cmd.lc().min(PIN_SIZE);
		pin[..n].copy_from_slice(&cmd.data()[..n]);

		match icc.enter_pin(ifd, &pin) {
			Ok(_) => Ok(sw(0x90, 0x00)),
			Err(SyncIccError::Pin { trials }) => Ok(sw(0x63, 0xC0 | (trials as u8 & 0x0F))),
			Err(SyncIccError::Blocked) => Ok(sw(0x69, 0x83)),
			Err(err) => Err(err.into()),
		}
	}

	fn change_reference_data<S: SerialPort>(
		&mut self,
		ifd: &mut Ifd<S>,
		icc: &mut SyncIcc,
		cmd: &ApduCmd,
	) -> Result<ApduRsp, ProtocolError> {
		if cmd.lc() < 2 * PIN_SIZE {
			return Err(ProtocolError::Protocol);
		}

		let data = cmd.data();
		let mut pin = [0u8; PIN_SIZE];
		let mut newpin = [0u8; PIN_SIZE];
		pin.copy_from_slice(&data[..PIN_SIZE]);
		newpin.copy_from_slice(&data[PIN_SIZE..2 * PIN_SIZE]);

		match icc.enter_pin(ifd, &pin) {
			Ok(_) => {}
			Err(SyncIccError::Pin { trials }) => {
				return Ok(sw(0x63, 0xC0 | (trials as u8 & 0x0F)));
			}
			Err(SyncIccError::Blocked) => return Ok(sw(0x69, 0x83)),
			Err(err) => return Err(err.into()),
		}

		icc.change_pin(ifd, &newpin).map_err(ProtocolError::from)?;

		Ok(sw(0x90, 0x00))
	}
}

/// Resolve an AID to its application data section by walking the DIR
/// structure at `dir_ref`: a lone application-id object (the section
/// follows it), a template wrapping one, or a sequence of templates
/// whose path objects point at the sections.
fn locate_application<Src: TlvSource>(
	src: &mut Src,
	memory: u16,
	dir_ref: u16,
	aid: &[u8],
) -> Option<(u16, u16)> {
	let dir = Tlv::parse(src, memory, dir_ref)?;

	match dir.tag() {
		// Mono-application card: the data section follows the AID.
		tlv::TAG_APPLICATION_ID => {
			if !dir.value_eq(src, aid) {
				return None;
			}
			let section = dir.shift(src)?;
			Some((section.address(), section.raw_length()))
		}

		// Mono-application card wrapped in a template.
		tlv::TAG_TEMPLATE => {
			let id = dir.find_by_tag(src, tlv::TAG_APPLICATION_ID)?;
			if !id.value_eq(src, aid) {
				return None;
			}
			let section = dir.shift(src)?;
			Some((section.address(), section.raw_length()))
		}

		// Multi-application card: a sequence of templates with paths.
		tlv::TAG_SEQUENCE => {
			let mut template = None;
			loop {
				template = Some(dir.iterate(src, template)?);
				let entry = template.unwrap();

				let Some(id) = entry.find_by_tag(src, tlv::TAG_APPLICATION_ID) else {
					continue;
				};
				if !id.value_eq(src, aid) {
					continue;
				}

				let path_obj = entry.find_by_tag(src, tlv::TAG_PATH)?;
				let mut path = [0u8; 2];
				let n = path_obj.read_value(src, &mut path)?;

				let address = if n < 2 {
					path[0] as u16
				} else {
					((path[n - 2] as u16) << 8) | path[n - 1] as u16
				};

				let section = Tlv::parse(src, memory, address)?;
				return Some((section.address(), section.raw_length()));
			}
		}

		_ => None,
	}
}

fn sw(sw1: u8, sw2: u8) -> ApduRsp {
	ApduRsp::new(&[sw1, sw2])
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::atr::synch::{self as atr_synch, SyncAtr};
	use crate::ifd::{MemoryCardKind, SLOT_A};
	use crate::testutil::{MockSerial, Reply, ifd_for_test};

	#[test]
	fn verify_reports_remaining_trials() {
		// 2-wire card with three trials left; the wrong PIN burns one.
		let mut io = MockSerial::new();
		io.push(Reply::Data(vec![0x01])); // activate
		io.push(Reply::Data(vec![0x01])); // counter command ack
		io.push(Reply::Data(vec![0x07, 0x00, 0x00, 0x00, 0x00]));
		for _ in 0..6 {
			io.push(Reply::Data(vec![0x01])); // PIN ceremony
		}
		io.push(Reply::Data(vec![0x01])); // counter command ack
		io.push(Reply::Data(vec![0x03, 0x00, 0x00, 0x00, 0x00]));

		let mut ifd = ifd_for_test(io, SLOT_A);
		let mut icc = SyncIcc::for_test(
			SyncAtr::synthetic(atr_synch::PROTOCOL_2W, 256),
			MemoryCardKind::TwoWire,
			256,
			0x00,
		);
		let mut proto = SyncProtocol::new(&icc);

		let cmd = ApduCmd::new(&[0x00, 0x20, 0x00, 0x00, 0x03, 0x11, 0x22, 0x33]);
		let rsp = proto.command(&mut ifd, &mut icc, &cmd).unwrap();
		assert_eq!(rsp.sw(), 0x63C2);
	}

	#[test]
	fn blocked_card_answers_6983() {
		let mut io = MockSerial::new();
		io.push(Reply::Data(vec![0x01])); // activate
		io.push(Reply::Data(vec![0x01])); // counter command ack
		io.push(Reply::Data(vec![0x00, 0x00, 0x00, 0x00, 0x00]));

		let mut ifd = ifd_for_test(io, SLOT_A);
		let mut icc = SyncIcc::for_test(
			SyncAtr::synthetic(atr_synch::PROTOCOL_2W, 256),
			MemoryCardKind::TwoWire,
			256,
			0x00,
		);
		let mut proto = SyncProtocol::new(&icc);

		let cmd = ApduCmd::new(&[0x00, 0x20, 0x00, 0x00, 0x03, 0x11, 0x22, 0x33]);
		let rsp = proto.command(&mut ifd, &mut icc, &cmd).unwrap();
		assert_eq!(rsp.sw(), 0x6983);
	}

	#[test]
	fn locates_bare_application_id() {
		// AID object followed directly by the data section.
		let mut mem: &[u8] = &[
			0x4F, 0x02, 0xD2, 0x76, // application id
			0x53, 0x03, 0xAA, 0xBB, 0xCC, // data section
		];
		let hit = locate_application(&mut mem, 9, 0, &[0xD2, 0x76]).unwrap();
		assert_eq!(hit, (4, 5));

		assert!(locate_application(&mut mem, 9, 0, &[0xD2, 0x77]).is_none());
	}

	#[test]
	fn locates_application_inside_template() {
		let mut mem: &[u8] = &[
			0x61, 0x04, // template
			0x4F, 0x02, 0xD2, 0x76, // application id
			0x53, 0x02, 0xAA, 0xBB, // data section after the template
		];
		let hit = locate_application(&mut mem, 10, 0, &[0xD2, 0x76]).unwrap();
		assert_eq!(hit, (6, 4));
	}

	#[test]
	fn locates_application_in_sequence_via_path() {
		let mut mem_vec = vec![
			0x30, 0x12, // sequence of two templates
			0x61, 0x04, // template 1
			0x4F, 0x02, 0xD2, 0x76, // aid 1
			0x61, 0x0A, // template 2
			0x4F, 0x02, 0xD2, 0x77, // aid 2
			0x50, 0x01, 0x41, // label
			0x51, 0x01, 0x18, // path -> 0x18
		];
		// Data section at 0x18.
		while mem_vec.len() < 0x18 {
			mem_vec.push(0x00);
		}
		mem_vec.extend_from_slice(&[0x53, 0x02, 0xCA, 0xFE]);

		let mut mem: &[u8] = &mem_vec;
		let hit = locate_application(&mut mem, mem_vec.len() as u16, 0, &[0xD2, 0x77]).unwrap();
		assert_eq!(hit, (0x18, 4));

		// Template 1 has no path object; its AID misses anyway.
		assert!(locate_application(&mut mem, mem_vec.len() as u16, 0, &[0xBE, 0xEF]).is_none());
	}

	#[test]
	fn truncated_aid_comparison_follows_tlv_length() {
		// Stored AID is a prefix of the asked one: comparison runs over
		// the shorter length and still matches.
		let mut mem: &[u8] = &[0x4F, 0x01, 0xD2, 0x53, 0x01, 0xAA];
		assert!(locate_application(&mut mem, 6, 0, &[0xD2, 0x76]).is_some());
	}
}
