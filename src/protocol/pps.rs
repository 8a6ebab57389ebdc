//! ISO-7816-3 Protocol and Parameters Selection.
//!
//! Runs immediately after a successful asynchronous reset. Cards in
//! specific mode (TA2 present) dictate their parameters and see no
//! exchange at all; negotiable cards that announce TA1 get a PPS
//! request proposing it. A response must echo the request to count; on
//! mismatch one conservative retry (protocol only, no PPS1) is made
//! before the negotiation is reported as failed.

use crate::atr::{DEFAULT_DI, DEFAULT_FI, InterfaceByte};
use crate::icc::asynch::AsyncIcc;
use crate::ifd::{CLOCK_RATE, Ifd};
use crate::protocol::{ProtocolError, ProtocolParameters};
use crate::serial::SerialPort;

/// Longest PPS frame: PPSS, PPS0, PPS1..PPS3, PCK.
pub const MAX_LENGTH: usize = 6;

const PPSS: u8 = 0xFF;

/// Same Fi/Di tables TA1 uses; a PPS1 byte is coded identically.
fn fi_of(pps1: u8) -> u32 {
	const FI: [u32; 16] = [
		372, 372, 558, 744, 1116, 1488, 1860, 0, 0, 512, 768, 1024, 1536, 2048, 0, 0,
	];
	match FI[(pps1 >> 4) as usize] {
		0 => DEFAULT_FI,
		fi => fi,
	}
}

fn di_of(pps1: u8) -> u32 {
	const DI: [u32; 16] = [0, 1, 2, 4, 8, 16, 32, 64, 12, 20, 0, 0, 0, 0, 0, 0];
	match DI[(pps1 & 0x0F) as usize] {
		0 => DEFAULT_DI,
		di => di,
	}
}

/// Negotiate protocol and parameters for a freshly reset card.
///
/// `request` optionally carries a caller-built PPS0..PPS3 (1 to 4
/// bytes); PPSS and PCK are added here. Without one, the ATR decides
/// whether and what to negotiate. On success the card's line rate is
/// derived from the agreed Fi/Di and recorded in the ICC.
pub fn negotiate<S: SerialPort>(
	ifd: &mut Ifd<S>,
	icc: &mut AsyncIcc,
	request: Option<&[u8]>,
) -> Result<ProtocolParameters, ProtocolError> {
	let atr = icc.atr().clone();

	let mut params = ProtocolParameters {
		t: atr.first_protocol(),
		f: atr.fi(),
		d: atr.di(),
		n: atr.guard_time(),
	};

	match request {
		Some(req) if well_formed(req) => {
			exchange(ifd, icc, req)?;

			params.t = req[0] & 0x0F;
			if req[0] & 0x10 != 0 {
				params.f = fi_of(req[1]);
				params.d = di_of(req[1]);
			}
		}
		Some(_) => return Err(ProtocolError::Protocol),
		None => {
			if atr.interface_byte(2, InterfaceByte::Ta).is_some() {
				// Specific mode: the card already runs these parameters.
				debug!("PPS: specific mode, keeping ATR parameters");
			} else if let Some(ta1) = atr.interface_byte(1, InterfaceByte::Ta) {
				let req = [0x10 | params.t, ta1];
				match exchange(ifd, icc, &req) {
					Ok(()) => {
						params.f = fi_of(ta1);
						params.d = di_of(ta1);
					}
					Err(ProtocolError::PpsFailure) => {
						// One conservative retry: protocol alone.
						warn!("PPS: request not confirmed, retrying without PPS1");
						exchange(ifd, icc, &[params.t])?;
						params.f = DEFAULT_FI;
						params.d = DEFAULT_DI;
					}
					Err(err) => return Err(err),
				}
			}
		}
	}

	// The agreed etu fixes the line rate for this card.
	let baudrate = (CLOCK_RATE as u64 * params.d as u64 / params.f as u64) as u32;
	icc.set_baudrate(baudrate);

	info!(
		"PPS: T={} F={} D={} N={} -> {baudrate} bps",
		params.t, params.f, params.d, params.n
	);

	Ok(params)
}

/// Send one PPS request and demand a confirming response.
fn exchange<S: SerialPort>(
	ifd: &mut Ifd<S>,
	icc: &mut AsyncIcc,
	request: &[u8],
) -> Result<(), ProtocolError> {
	let mut frame = [0u8; MAX_LENGTH];
	frame[0] = PPSS;
	frame[1..1 + request.len()].copy_from_slice(request);
	let len = 1 + request.len();
	let pck = frame[..len].iter().fold(0u8, |acc, b| acc ^ b);
	frame[len] = pck;

	debug!("PPS: request {:02X?}", &frame[..len + 1]);

	icc.transmit(ifd, &frame[..len + 1])?;

	// Response: PPSS, PPS0, the PPS1..PPS3 bytes PPS0 announces, PCK.
	let mut response = [0u8; MAX_LENGTH];
	icc.receive(ifd, &mut response[..2])?;

	if response[0] != PPSS {
		return Err(ProtocolError::PpsFailure);
	}

	let mut rlen = 2;
	for bit in [0x10, 0x20, 0x40] {
		if response[1] & bit != 0 {
			icc.receive(ifd, &mut response[rlen..rlen + 1])?;
			rlen += 1;
		}
	}
	icc.receive(ifd, &mut response[rlen..rlen + 1])?;
	rlen += 1;

	debug!("PPS: response {:02X?}", &response[..rlen]);

	if response[..rlen].iter().fold(0u8, |acc, b| acc ^ b) != 0 {
		return Err(ProtocolError::PpsFailure);
	}

	// The response confirms the request only if every byte it carries
	// echoes what was proposed.
	if response[1] & 0x0F != request[0] & 0x0F {
		return Err(ProtocolError::PpsFailure);
	}

	let mut rsp_at = 2;
	let mut req_at = 1;
	for bit in [0x10u8, 0x20, 0x40] {
		let requested = request[0] & bit != 0;
		let answered = response[1] & bit != 0;
		match (requested, answered) {
			(true, true) => {
				if response[rsp_at] != request[req_at] {
					return Err(ProtocolError::PpsFailure);
				}
				rsp_at += 1;
				req_at += 1;
			}
			(false, true) => return Err(ProtocolError::PpsFailure),
			// A dropped option byte means the card insists on defaults.
			(true, false) => return Err(ProtocolError::PpsFailure),
			(false, false) => {}
		}
	}

	Ok(())
}

/// PPS0 plus exactly the option bytes its bits announce, within bounds.
fn well_formed(request: &[u8]) -> bool {
	if request.is_empty() || request.len() > MAX_LENGTH - 2 {
		return false;
	}
	let options = [0x10u8, 0x20, 0x40]
		.iter()
		.filter(|&&bit| request[0] & bit != 0)
		.count();
	request.len() == 1 + options
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::atr::Atr;
	use crate::ifd::SLOT_A;
	use crate::testutil::{MockSerial, Reply, ifd_for_test};

	fn icc_with_atr(atr_bytes: &[u8]) -> AsyncIcc {
		AsyncIcc::for_test(Atr::from_bytes(atr_bytes).unwrap())
	}

	#[test]
	fn negotiates_ta1_parameters() {
		// TA1 = 0x95: Fi 512, Di 16.
		let mut icc = icc_with_atr(&[0x3B, 0x11, 0x95, 0x00]);
		let mut io = MockSerial::new();
		io.push(Reply::Data(vec![0xFF, 0x10, 0x95, 0xFF ^ 0x10 ^ 0x95]));
		let mut ifd = ifd_for_test(io, SLOT_A);

		let params = negotiate(&mut ifd, &mut icc, None).unwrap();
		assert_eq!(params.t, 0);
		assert_eq!(params.f, 512);
		assert_eq!(params.d, 16);
		assert_eq!(icc.baudrate(), CLOCK_RATE * 16 / 512);

		let writes = ifd.into_io().writes;
		// Header block plus the PPS frame itself.
		assert_eq!(*writes.last().unwrap(), vec![0xFF, 0x10, 0x95, 0xFF ^ 0x10 ^ 0x95]);
	}

	#[test]
	fn specific_mode_sends_nothing() {
		// TA2 present (TD1 announces TA2 in group 2).
		let mut icc = icc_with_atr(&[0x3B, 0x80, 0x11, 0x01, 0x90]);
		let mut ifd = ifd_for_test(MockSerial::new(), SLOT_A);

		let params = negotiate(&mut ifd, &mut icc, None).unwrap();
		assert_eq!(params.t, 1);
		assert!(ifd.into_io().writes.is_empty());
	}

	#[test]
	fn defaults_without_ta1_send_nothing() {
		let mut icc = icc_with_atr(&[0x3B, 0x00]);
		let mut ifd = ifd_for_test(MockSerial::new(), SLOT_A);

		let params = negotiate(&mut ifd, &mut icc, None).unwrap();
		assert_eq!((params.t, params.f, params.d), (0, 372, 1));
		assert_eq!(icc.baudrate(), 9600);
		assert!(ifd.into_io().writes.is_empty());
	}

	#[test]
	fn mismatch_retries_once_conservatively() {
		let mut icc = icc_with_atr(&[0x3B, 0x11, 0x95, 0x00]);
		let mut io = MockSerial::new();
		// First response drops PPS1: not a confirmation.
		io.push(Reply::Data(vec![0xFF, 0x00, 0xFF]));
		// Conservative retry confirmed.
		io.push(Reply::Data(vec![0xFF, 0x00, 0xFF]));
		let mut ifd = ifd_for_test(io, SLOT_A);

		let params = negotiate(&mut ifd, &mut icc, None).unwrap();
		assert_eq!((params.f, params.d), (372, 1));

		let writes = ifd.into_io().writes;
		assert_eq!(*writes.last().unwrap(), vec![0xFF, 0x00, 0xFF]);
	}

	#[test]
	fn repeated_mismatch_is_a_pps_failure() {
		let mut icc = icc_with_atr(&[0x3B, 0x11, 0x95, 0x00]);
		let mut io = MockSerial::new();
		io.push(Reply::Data(vec![0xFF, 0x00, 0xFF]));
		// Retry answered with a broken check byte.
		io.push(Reply::Data(vec![0xFF, 0x00, 0x55]));
		let mut ifd = ifd_for_test(io, SLOT_A);

		assert!(matches!(
			negotiate(&mut ifd, &mut icc, None),
			Err(ProtocolError::PpsFailure)
		));
	}

	#[test]
	fn caller_request_is_framed_and_checked() {
		let mut icc = icc_with_atr(&[0x3B, 0x00]);
		let mut io = MockSerial::new();
		io.push(Reply::Data(vec![0xFF, 0x11, 0x95, 0xFF ^ 0x11 ^ 0x95]));
		let mut ifd = ifd_for_test(io, SLOT_A);

		let params = negotiate(&mut ifd, &mut icc, Some(&[0x11, 0x95])).unwrap();
		assert_eq!(params.t, 1);
		assert_eq!(params.f, 512);
		assert_eq!(params.d, 16);

		let writes = ifd.into_io().writes;
		assert_eq!(*writes.last().unwrap(), vec![0xFF, 0x11, 0x95, 0xFF ^ 0x11 ^ 0x95]);
	}

	#[test]
	fn oversized_request_is_rejected() {
		let mut icc = icc_with_atr(&[0x3B, 0x00]);
		let mut ifd = ifd_for_test(MockSerial::new(), SLOT_A);
		assert!(negotiate(&mut ifd, &mut icc, Some(&[0u8; 5])).is_err());
	}
}
