//! Driver core for the Towitoko Chipdrive family of serial smartcard
//! readers.
//!
//! The crate speaks the readers' proprietary framed command protocol
//! and, above it, the ISO-7816 transmission protocols needed to carry
//! APDUs to an inserted card: T=0 and T=1 for processor cards and an
//! interindustry command emulation for synchronous memory cards (I²C,
//! 2-wire and 3-wire bus types).
//!
//! The stack is layered the way the wire is: a [`serial::SerialPort`]
//! implementation (supplied by the host application) carries bytes, the
//! [`ifd`] framer turns them into checksummed reader commands, the
//! [`icc`] layer owns card state and timings, and the [`protocol`]
//! engines map APDUs onto exchanges. [`slot::Slot`] ties one reader
//! slot together: probe a card, route commands, release.
//!
//! ```no_run
//! use chipdrive::apdu::ApduCmd;
//! use chipdrive::slot::{Slot, SlotConfig};
//! # use chipdrive::serial::{PortProperties, SerialError, SerialPort};
//! # struct Port;
//! # impl SerialPort for Port {
//! #	fn set_properties(&mut self, _: &PortProperties) -> Result<(), SerialError> { Ok(()) }
//! #	fn properties(&self) -> PortProperties { panic!() }
//! #	fn read(&mut self, _: std::time::Duration, _: &mut [u8]) -> Result<(), SerialError> { Ok(()) }
//! #	fn write(&mut self, _: std::time::Duration, _: &[u8]) -> Result<(), SerialError> { Ok(()) }
//! # }
//! # fn open_port() -> Port { Port }
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let port = open_port();
//! let mut slot = Slot::new(port, chipdrive::ifd::SLOT_A, SlotConfig::default())?;
//!
//! slot.probe(None)?;
//! let rsp = slot.command(&ApduCmd::new(&[0x00, 0xA4, 0x00, 0x00, 0x02, 0x3F, 0x00, 0x00]))?;
//! println!("SW = {:04X}", rsp.sw());
//!
//! slot.close()?;
//! # Ok(())
//! # }
//! ```

#[macro_use]
extern crate log;

pub mod apdu;
pub mod atr;
pub mod icc;
pub mod ifd;
pub mod protocol;
pub mod serial;
pub mod slot;
pub mod tlv;

pub use crate::apdu::{ApduCase, ApduCmd, ApduRsp};
pub use crate::ifd::{Ifd, IfdError, ReaderKind};
pub use crate::serial::{Parity, PortProperties, SerialError, SerialPort};
pub use crate::slot::{Slot, SlotConfig, SlotError};

#[cfg(test)]
pub(crate) mod testutil;
