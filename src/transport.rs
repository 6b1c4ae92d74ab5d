//! USB transport for the marking board.
//!
//! Mirrors `GalvoUsb.py`: one vendor/product pair, two bulk endpoints for the
//! control plane (12-byte commands, 8-byte replies) and the same OUT
//! endpoint for 3072-byte list blocks. A [`MockTransport`] backs the test
//! suite so none of it needs real hardware.

use std::time::Duration;

use crate::error::{Error, Result};

/// BJJCZ LMCV4-FIBER-M vendor ID.
pub const VENDOR_ID: u16 = 0x9588;
/// BJJCZ LMCV4-FIBER-M product ID.
pub const PRODUCT_ID: u16 = 0x9899;

/// Bulk OUT endpoint for control commands and list blocks.
const EP_HOST_OUT: u8 = 0x02;
/// Bulk IN endpoint for 8-byte status replies.
const EP_HOST_IN: u8 = 0x88;

/// Transfer timeout used for every command/reply/block exchange.
const TRANSFER_TIMEOUT: Duration = Duration::from_millis(100);

/// Exact size of a list block, in bytes (256 ops of 12 bytes each).
pub const PACKET_SIZE: usize = 3072;

/// Opcode used by [`Transport::write_correction_entry`]'s raw frame. Not a
/// [`crate::protocol::opcode`] entry: unlike every other control-plane
/// opcode this one gets no reply, so it is issued below the `Protocol`
/// command/reply pairing rather than through it.
const CORRECTION_ENTRY_OPCODE: u16 = 0x10;

fn correction_entry_frame(entry: &[u8; 5]) -> [u8; 12] {
    let mut frame = [0u8; 12];
    frame[0..2].copy_from_slice(&CORRECTION_ENTRY_OPCODE.to_le_bytes());
    frame[2..7].copy_from_slice(entry);
    frame
}

/// Low-level byte transport the protocol layer drives.
///
/// Every method enforces exact-length transfers: the board does not tolerate
/// partial frames, so a short read or write is reported as
/// [`Error::Communication`] rather than silently retried.
pub trait Transport: Send {
    /// Write a 12-byte command frame to the control-plane OUT endpoint.
    fn write_command(&mut self, frame: &[u8; 12]) -> Result<()>;

    /// Read an 8-byte reply from the control-plane IN endpoint.
    fn read_reply(&mut self) -> Result<[u8; 8]>;

    /// Write a [`PACKET_SIZE`]-byte list block to the OUT endpoint.
    fn write_block(&mut self, block: &[u8; PACKET_SIZE]) -> Result<()>;

    /// Upload one 5-byte correction-table entry (`sender.py`'s
    /// `send_correction_entry`). This is fire-and-forget: the board emits no
    /// reply for this opcode, so unlike every other control-plane exchange
    /// there is no matching read.
    fn write_correction_entry(&mut self, entry: &[u8; 5]) -> Result<()>;

    /// Release the underlying device handle. Called once, from `Drop`.
    fn close(&mut self);
}

/// Real transport backed by a `rusb` device handle.
pub struct UsbTransport {
    handle: rusb::DeviceHandle<rusb::GlobalContext>,
}

impl UsbTransport {
    /// Open the `index`-th device matching [`VENDOR_ID`]/[`PRODUCT_ID`],
    /// claim its configuration, and reset it.
    ///
    /// # Errors
    ///
    /// [`Error::NoDevice`] if fewer than `index + 1` matching devices are
    /// present; [`Error::AccessDenied`] if the OS refuses to open or claim
    /// the device.
    pub fn open(index: usize) -> Result<Self> {
        let devices = rusb::devices().map_err(|e| Error::AccessDenied { reason: e.to_string() })?;

        let device = devices
            .iter()
            .filter(|d| {
                d.device_descriptor()
                    .map(|desc| desc.vendor_id() == VENDOR_ID && desc.product_id() == PRODUCT_ID)
                    .unwrap_or(false)
            })
            .nth(index)
            .ok_or(Error::NoDevice { index })?;

        let handle =
            device.open().map_err(|e| Error::AccessDenied { reason: e.to_string() })?;

        handle.set_active_configuration(1).map_err(|e| Error::AccessDenied {
            reason: format!("failed to set configuration: {e}"),
        })?;
        handle.claim_interface(0).map_err(|e| Error::AccessDenied {
            reason: format!("failed to claim interface: {e}"),
        })?;
        let _ = handle.reset();

        Ok(UsbTransport { handle })
    }
}

impl Transport for UsbTransport {
    fn write_command(&mut self, frame: &[u8; 12]) -> Result<()> {
        let n = self
            .handle
            .write_bulk(EP_HOST_OUT, frame, TRANSFER_TIMEOUT)
            .map_err(|e| Error::Communication { reason: format!("write_command: {e}") })?;
        if n != frame.len() {
            return Err(Error::Communication {
                reason: format!("short write_command: wrote {n} of {} bytes", frame.len()),
            });
        }
        Ok(())
    }

    fn read_reply(&mut self) -> Result<[u8; 8]> {
        let mut buf = [0u8; 8];
        let n = self
            .handle
            .read_bulk(EP_HOST_IN, &mut buf, TRANSFER_TIMEOUT)
            .map_err(|e| Error::Communication { reason: format!("read_reply: {e}") })?;
        if n != buf.len() {
            return Err(Error::Communication {
                reason: format!("short read_reply: read {n} of {} bytes", buf.len()),
            });
        }
        Ok(buf)
    }

    fn write_block(&mut self, block: &[u8; PACKET_SIZE]) -> Result<()> {
        let n = self
            .handle
            .write_bulk(EP_HOST_OUT, block, TRANSFER_TIMEOUT)
            .map_err(|e| Error::Communication { reason: format!("write_block: {e}") })?;
        if n != block.len() {
            return Err(Error::Communication {
                reason: format!("short write_block: wrote {n} of {} bytes", block.len()),
            });
        }
        Ok(())
    }

    fn write_correction_entry(&mut self, entry: &[u8; 5]) -> Result<()> {
        let frame = correction_entry_frame(entry);
        let n = self
            .handle
            .write_bulk(EP_HOST_OUT, &frame, TRANSFER_TIMEOUT)
            .map_err(|e| Error::Communication { reason: format!("write_correction_entry: {e}") })?;
        if n != frame.len() {
            return Err(Error::Communication {
                reason: format!("short write_correction_entry: wrote {n} of {} bytes", frame.len()),
            });
        }
        Ok(())
    }

    fn close(&mut self) {
        let _ = self.handle.release_interface(0);
    }
}

impl Drop for UsbTransport {
    fn drop(&mut self) {
        self.close();
    }
}

/// Test double that returns scripted 8-byte replies in sequence, and
/// otherwise records everything written to it.
///
/// When the scripted queue is empty, replies default to status word `0x24`
/// (ready | busy-cleared is the common idle state: ready bit 0x20 set,
/// footswitch bit 0x8000 clear) so tests that don't care about status don't
/// need to script every exchange.
pub struct MockTransport {
    /// Commands written, in order, for test assertions.
    pub commands: Vec<[u8; 12]>,
    /// Blocks written, in order, for test assertions.
    pub blocks: Vec<Vec<u8>>,
    reply_queue: std::collections::VecDeque<[u8; 8]>,
    default_status: u16,
}

impl MockTransport {
    /// A mock with no scripted replies; every `read_reply` returns
    /// `default_status` in the status word (bytes 6-7).
    pub fn new(default_status: u16) -> Self {
        MockTransport {
            commands: Vec::new(),
            blocks: Vec::new(),
            reply_queue: std::collections::VecDeque::new(),
            default_status,
        }
    }

    /// Queue a reply to be returned by the next `read_reply` call.
    pub fn push_reply(&mut self, reply: [u8; 8]) {
        self.reply_queue.push_back(reply);
    }

    /// Build an 8-byte reply carrying the given status word, r0 = r1 = 0.
    pub fn status_reply(status: u16) -> [u8; 8] {
        let mut buf = [0u8; 8];
        buf[6..8].copy_from_slice(&status.to_le_bytes());
        buf
    }
}

impl Transport for MockTransport {
    fn write_command(&mut self, frame: &[u8; 12]) -> Result<()> {
        self.commands.push(*frame);
        Ok(())
    }

    fn read_reply(&mut self) -> Result<[u8; 8]> {
        Ok(self.reply_queue.pop_front().unwrap_or_else(|| Self::status_reply(self.default_status)))
    }

    fn write_block(&mut self, block: &[u8; PACKET_SIZE]) -> Result<()> {
        self.blocks.push(block.to_vec());
        Ok(())
    }

    fn write_correction_entry(&mut self, entry: &[u8; 5]) -> Result<()> {
        self.commands.push(correction_entry_frame(entry));
        Ok(())
    }

    fn close(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_records_writes_and_replies_default_status() {
        let mut t = MockTransport::new(0x0020);
        t.write_command(&[0u8; 12]).unwrap();
        assert_eq!(t.commands.len(), 1);
        let reply = t.read_reply().unwrap();
        assert_eq!(u16::from_le_bytes([reply[6], reply[7]]), 0x0020);
    }

    #[test]
    fn mock_drains_scripted_replies_in_order() {
        let mut t = MockTransport::new(0);
        t.push_reply(MockTransport::status_reply(0x0004));
        t.push_reply(MockTransport::status_reply(0x0020));

        let status = |r: [u8; 8]| u16::from_le_bytes([r[6], r[7]]);
        assert_eq!(status(t.read_reply().unwrap()), 0x0004);
        assert_eq!(status(t.read_reply().unwrap()), 0x0020);
        assert_eq!(status(t.read_reply().unwrap()), 0);
    }
}
