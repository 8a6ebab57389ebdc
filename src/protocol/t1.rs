//! ISO-7816-3 T=1: block-chained APDU transport.
//!
//! Commands travel in I-blocks of at most IFSC information bytes,
//! chained with the M-bit and acknowledged by R-blocks; responses chain
//! back the same way. S-blocks adjust the information field size, ask
//! for waiting time extensions and resynchronize after repeated errors.
//! The epilogue is an LRC or CRC as the ATR selects.

use crate::apdu::{ApduCmd, ApduRsp};
use crate::icc::asynch::AsyncIcc;
use crate::ifd::Ifd;
use crate::protocol::{ProtocolError, ProtocolParameters};
use crate::serial::SerialPort;

/// Node address byte; single-card readers always use zero.
const NAD: u8 = 0x00;
/// Transmission attempts per block before resynchronizing.
const MAX_RETRIES: usize = 3;
/// Default information field size towards the card.
const DEFAULT_IFSC: usize = 32;

const PCB_R_MASK: u8 = 0xC0;
const PCB_R: u8 = 0x80;
const PCB_S_MASK: u8 = 0xC0;
const PCB_S: u8 = 0xC0;

const S_RESYNCH: u8 = 0x00;
const S_IFS: u8 = 0x01;
const S_ABORT: u8 = 0x02;
const S_WTX: u8 = 0x03;
const S_RESPONSE: u8 = 0x20;

/// Error detection code negotiated from the ATR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Edc {
	Lrc,
	Crc,
}

#[derive(Debug, Clone)]
struct Block {
	pcb: u8,
	inf: Vec<u8>,
}

impl Block {
	fn information(ns: u8, more: bool, inf: &[u8]) -> Block {
		Block {
			pcb: (ns << 6) | if more { 0x20 } else { 0x00 },
			inf: inf.to_vec(),
		}
	}

	fn receive_ready(nr: u8, err: u8) -> Block {
		Block {
			pcb: PCB_R | (nr << 4) | err,
			inf: Vec::new(),
		}
	}

	fn supervisory(kind: u8, response: bool, inf: &[u8]) -> Block {
		Block {
			pcb: PCB_S | if response { S_RESPONSE } else { 0 } | kind,
			inf: inf.to_vec(),
		}
	}

	fn is_information(&self) -> bool {
		self.pcb & 0x80 == 0
	}

	fn is_receive_ready(&self) -> bool {
		self.pcb & PCB_R_MASK == PCB_R
	}

	fn is_supervisory(&self) -> bool {
		self.pcb & PCB_S_MASK == PCB_S && !self.is_receive_ready()
	}

	fn ns(&self) -> u8 {
		(self.pcb >> 6) & 0x01
	}

	fn nr(&self) -> u8 {
		(self.pcb >> 4) & 0x01
	}

	fn more(&self) -> bool {
		self.pcb & 0x20 != 0
	}

	fn s_kind(&self) -> u8 {
		self.pcb & 0x1F
	}
}

/// The T=1 engine: send sequence numbers per direction, the negotiated
/// information field size and the epilogue flavor.
#[derive(Debug)]
pub struct T1 {
	ns: u8,
	nr: u8,
	ifsc: usize,
	edc: Edc,
}

impl T1 {
	/// Derive IFSC, the waiting times and the EDC from the ATR, and push
	/// BWT/CWT into the ICC timings.
	pub fn new<S: SerialPort>(
		ifd: &Ifd<S>,
		icc: &mut AsyncIcc,
		params: &ProtocolParameters,
	) -> T1 {
		let atr = icc.atr();
		let ifsc = match atr.ifsc() {
			0 => DEFAULT_IFSC,
			ifsc => ifsc as usize,
		};
		let (bwi, cwi) = atr.bwi_cwi();
		let edc = if atr.t1_crc() { Edc::Crc } else { Edc::Lrc };

		let clock = ifd.clock_rate() as u64;
		let etu_us = params.f as u64 * 1_000_000 / (params.d as u64 * clock);

		// BWT = 11 etu + 2^BWI * 960 * 372 / f; CWT = (11 + 2^CWI) etu.
		let bwt = (11 * etu_us / 1000) as u32
			+ ((1u64 << bwi) * 960 * 372 * 1000 / clock) as u32
			+ 1;
		let cwt = ((11 + (1u64 << cwi)) * etu_us / 1000) as u32 + 1;

		let mut timings = icc.timings();
		timings.block_timeout = bwt;
		timings.char_timeout = cwt;
		icc.set_timings(timings);

		debug!("T=1: IFSC={ifsc} BWT={bwt}ms CWT={cwt}ms EDC={edc:?}");

		T1 { ns: 0, nr: 0, ifsc, edc }
	}

	/// Carry one APDU: chain the command out, collect the chained
	/// response, and answer supervisory requests along the way.
	pub fn command<S: SerialPort>(
		&mut self,
		ifd: &mut Ifd<S>,
		icc: &mut AsyncIcc,
		cmd: &ApduCmd,
	) -> Result<ApduRsp, ProtocolError> {
		icc.begin_transmission(ifd)?;
		let result = self.run(ifd, icc, cmd);
		icc.end_transmission(ifd)?;
		result
	}

	fn run<S: SerialPort>(
		&mut self,
		ifd: &mut Ifd<S>,
		icc: &mut AsyncIcc,
		cmd: &ApduCmd,
	) -> Result<ApduRsp, ProtocolError> {
		let raw = cmd.raw();
		let mut response: Vec<u8> = Vec::new();

		let chunks: Vec<&[u8]> = raw.chunks(self.ifsc).collect();
		let mut reply = None;

		for (i, chunk) in chunks.iter().enumerate() {
			let more = i + 1 < chunks.len();
			let block = Block::information(self.ns, more, chunk);
			let answer = self.transceive(ifd, icc, &block)?;
			self.ns ^= 1;

			if more {
				// Chaining: the card must acknowledge with R(next NS).
				if !answer.is_receive_ready() || answer.nr() != self.ns {
					return Err(ProtocolError::Protocol);
				}
			} else {
				reply = Some(answer);
			}
		}

		// Collect the response chain.
		let mut answer = reply.ok_or(ProtocolError::Protocol)?;
		loop {
			if !answer.is_information() || answer.ns() != self.nr {
				return Err(ProtocolError::Protocol);
			}
			self.nr ^= 1;
			response.extend_from_slice(&answer.inf);

			if !answer.more() {
				break;
			}
			let ack = Block::receive_ready(self.nr, 0);
			answer = self.transceive(ifd, icc, &ack)?;
		}

		Ok(ApduRsp::new(&response))
	}

	/// Send one block and read the card's answer, retransmitting on
	/// EDC or timeout trouble and serving S-requests transparently.
	fn transceive<S: SerialPort>(
		&mut self,
		ifd: &mut Ifd<S>,
		icc: &mut AsyncIcc,
		block: &Block,
	) -> Result<Block, ProtocolError> {
		let mut attempts = 0;

		loop {
			self.send_block(ifd, icc, block)?;

			match self.read_block(ifd, icc) {
				Ok(answer) if answer.is_supervisory() && answer.pcb & S_RESPONSE == 0 => {
					// Serve the card's S-request and wait for the real
					// answer by retransmitting afterwards if needed.
					match answer.s_kind() {
						S_IFS => {
							let size = answer.inf.first().copied().unwrap_or(32);
							self.ifsc = size.max(1) as usize;
							let rsp = Block::supervisory(S_IFS, true, &answer.inf);
							self.send_block(ifd, icc, &rsp)?;
							match self.read_block(ifd, icc) {
								Ok(answer) => return Ok(answer),
								Err(_) => {}
							}
						}
						S_WTX => {
							let rsp = Block::supervisory(S_WTX, true, &answer.inf);
							self.send_block(ifd, icc, &rsp)?;
							match self.read_block(ifd, icc) {
								Ok(answer) => return Ok(answer),
								Err(_) => {}
							}
						}
						S_ABORT => return Err(ProtocolError::Protocol),
						_ => return Err(ProtocolError::Protocol),
					}
				}
				Ok(answer) if answer.is_receive_ready() && answer.pcb & 0x03 != 0 => {
					// The card saw an error in our block; resend it.
					debug!("T=1: card requests retransmission");
				}
				Ok(answer) => return Ok(answer),
				Err(ProtocolError::Icc(_)) | Err(ProtocolError::Protocol) => {
					debug!("T=1: block garbled, retrying");
				}
				Err(err) => return Err(err),
			}

			attempts += 1;
			if attempts >= MAX_RETRIES {
				// Last resort before giving up on the exchange.
				return self.resynchronize(ifd, icc);
			}
		}
	}

	fn resynchronize<S: SerialPort>(
		&mut self,
		ifd: &mut Ifd<S>,
		icc: &mut AsyncIcc,
	) -> Result<Block, ProtocolError> {
		warn!("T=1: resynchronizing");

		let req = Block::supervisory(S_RESYNCH, false, &[]);
		self.send_block(ifd, icc, &req)?;

		let answer = self.read_block(ifd, icc)?;
		if answer.is_supervisory()
			&& answer.pcb & S_RESPONSE != 0
			&& answer.s_kind() == S_RESYNCH
		{
			self.ns = 0;
			self.nr = 0;
		}

		Err(ProtocolError::Protocol)
	}

	fn send_block<S: SerialPort>(
		&mut self,
		ifd: &mut Ifd<S>,
		icc: &mut AsyncIcc,
		block: &Block,
	) -> Result<(), ProtocolError> {
		let mut bytes = Vec::with_capacity(3 + block.inf.len() + 2);
		bytes.push(NAD);
		bytes.push(block.pcb);
		bytes.push(block.inf.len() as u8);
		bytes.extend_from_slice(&block.inf);

		match self.edc {
			Edc::Lrc => bytes.push(lrc(&bytes)),
			Edc::Crc => {
				let crc = crc16(&bytes);
				bytes.extend_from_slice(&crc.to_be_bytes());
			}
		}

		icc.switch(ifd)?;
		icc.transmit(ifd, &bytes)?;
		Ok(())
	}

	fn read_block<S: SerialPort>(
		&mut self,
		ifd: &mut Ifd<S>,
		icc: &mut AsyncIcc,
	) -> Result<Block, ProtocolError> {
		let mut prologue = [0u8; 3];
		icc.receive(ifd, &mut prologue)?;

		let len = prologue[2] as usize;
		let edc_len = match self.edc {
			Edc::Lrc => 1,
			Edc::Crc => 2,
		};

		let mut rest = vec![0u8; len + edc_len];
		icc.receive(ifd, &mut rest)?;

		let mut whole = prologue.to_vec();
		whole.extend_from_slice(&rest);

		let valid = match self.edc {
			Edc::Lrc => lrc(&whole[..whole.len() - 1]) == whole[whole.len() - 1],
			Edc::Crc => {
				let expected = u16::from_be_bytes([
					whole[whole.len() - 2],
					whole[whole.len() - 1],
				]);
				crc16(&whole[..whole.len() - 2]) == expected
			}
		};

		if !valid {
			return Err(ProtocolError::Protocol);
		}

		Ok(Block {
			pcb: prologue[1],
			inf: rest[..len].to_vec(),
		})
	}
}

fn lrc(bytes: &[u8]) -> u8 {
	bytes.iter().fold(0, |acc, b| acc ^ b)
}

/// CRC-16/CCITT as ISO 7816-3 annexes it for the T=1 epilogue.
fn crc16(bytes: &[u8]) -> u16 {
	let mut crc: u16 = 0xFFFF;
	for &b in bytes {
		crc ^= (b as u16) << 8;
		for _ in 0..8 {
			if crc & 0x8000 != 0 {
				crc = (crc << 1) ^ 0x1021;
			} else {
				crc <<= 1;
			}
		}
	}
	crc
}
