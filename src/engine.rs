//! Execution engine: uploads a [`CommandList`] and drives the board through
//! one or more loop iterations, honoring ready/busy and supporting
//! cancellation from another thread.
//!
//! Protocol steps are ported 1:1 from `balor.sender.Sender.execute`/`abort`;
//! the session-lock shape mirrors `ehci.rs`'s controller structs, which also
//! serialize all device access through one owner.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::calibration::CorrectionTable;
use crate::commandlist::{CommandList, TickCallback};
use crate::config::InitConfig;
use crate::error::{ExecResult, Result};
use crate::protocol::{status_bit, Protocol, PORT_FOOTSWITCH};
use crate::transport::{MockTransport, Transport, UsbTransport};

/// Builds the abort packet: one `ReadyMark` followed by 255 `NoOp`s.
/// Rebuilt on every abort rather than cached, since it's a single small
/// `CommandList` and the abort path already blocks on device I/O.
fn abort_chunk() -> [u8; crate::transport::PACKET_SIZE] {
    let mut cmd = CommandList::new();
    cmd.ready();
    cmd.serialize().try_into().expect("ready-only list is exactly one packet")
}

/// Callback invoked (at most once per press, until re-armed) when the
/// footswitch pedal is detected during a ready/busy poll.
pub type FootswitchCallback = Box<dyn FnMut() + Send>;

/// Owns one USB session and serializes every device interaction through an
/// internal lock, mirroring `balor.sender.Sender`'s `threading.Lock`.
pub struct Session<T: Transport> {
    protocol: Mutex<Protocol<T>>,
    abort_flag: AtomicBool,
    footswitch: Mutex<Option<FootswitchCallback>>,
}

impl Session<UsbTransport> {
    /// Open the `index`-th matching USB device and run the strict init
    /// sequence with `config` and `table`.
    pub fn open(index: usize, config: &InitConfig, table: &CorrectionTable) -> Result<Self> {
        let transport = UsbTransport::open(index)?;
        Self::from_transport(transport, config, table)
    }
}

impl Session<MockTransport> {
    /// Build a session over a [`MockTransport`], for tests.
    pub fn open_mock(
        transport: MockTransport,
        config: &InitConfig,
        table: &CorrectionTable,
    ) -> Result<Self> {
        Self::from_transport(transport, config, table)
    }
}

impl<T: Transport> Session<T> {
    fn from_transport(transport: T, config: &InitConfig, table: &CorrectionTable) -> Result<Self> {
        let mut protocol = Protocol::new(transport);
        protocol.init_machine(config, table)?;
        Ok(Session {
            protocol: Mutex::new(protocol),
            abort_flag: AtomicBool::new(false),
            footswitch: Mutex::new(None),
        })
    }

    /// Register a callback to fire the next time the footswitch is detected
    /// pressed. Cleared automatically after it fires once; register again
    /// to re-arm.
    pub fn set_footswitch_callback(&self, callback: FootswitchCallback) {
        *self.footswitch.lock().unwrap() = Some(callback);
    }

    /// Run `command_list` once. Alias of `execute(command_list, 1, None)`.
    pub fn run_once(&self, command_list: &CommandList) -> Result<ExecResult> {
        self.execute(command_list, 1, None)
    }

    /// Run `command_list` until `abort()` is called, polling `should_stop`
    /// between iterations so long-running light loops can also be cancelled
    /// without a separate thread.
    pub fn run_loop(&self, command_list: &CommandList, should_stop: impl Fn() -> bool) -> Result<ExecResult> {
        loop {
            if should_stop() {
                return Ok(ExecResult::Completed);
            }
            match self.execute(command_list, 1, None)? {
                ExecResult::Aborted => return Ok(ExecResult::Aborted),
                ExecResult::Completed => continue,
            }
        }
    }

    /// Upload and execute `command_list`, `loop_count` times, invoking
    /// `tick` (if given) between iterations.
    pub fn execute(
        &self,
        command_list: &CommandList,
        loop_count: usize,
        mut tick: Option<TickCallback>,
    ) -> Result<ExecResult> {
        let mut protocol = self.protocol.lock().unwrap();

        if !self.wait_while_busy(&mut protocol)? {
            return Ok(ExecResult::Aborted);
        }
        if !protocol.wait_ready(&self.abort_flag)? {
            return Ok(ExecResult::Aborted);
        }
        protocol.write_port(0x0001)?;

        for iteration in 0..loop_count {
            if self.abort_flag.load(Ordering::Acquire) {
                drop(protocol);
                self.run_abort_sequence()?;
                return Ok(ExecResult::Aborted);
            }
            if let Some(tick) = tick.as_mut() {
                tick(command_list, iteration);
            }

            protocol.reset_list()?;
            for packet in command_list.packet_generator() {
                if !protocol.wait_ready(&self.abort_flag)? {
                    drop(protocol);
                    self.run_abort_sequence()?;
                    return Ok(ExecResult::Aborted);
                }
                protocol.write_block(&packet)?;
                protocol.set_end_of_list(0x8001, 0x8001)?;
                protocol.execute_list()?;
            }
            protocol.set_end_of_list(0, 0)?;
            protocol.set_control_mode(1, 0)?;
            if !self.wait_while_busy(&mut protocol)? {
                return Ok(ExecResult::Aborted);
            }
        }

        Ok(ExecResult::Completed)
    }

    /// Signal the in-flight `execute` to cancel at its next checkpoint and
    /// block until the device-side abort sequence has completed. Idempotent
    /// and safe to call mid-upload, from any thread.
    pub fn abort(&self) -> Result<()> {
        self.abort_flag.store(true, Ordering::Release);
        self.run_abort_sequence()?;
        self.abort_flag.store(false, Ordering::Release);
        Ok(())
    }

    fn run_abort_sequence(&self) -> Result<()> {
        let mut protocol = self.protocol.lock().unwrap();
        protocol.reset_list()?;
        protocol.write_block(&abort_chunk())?;
        protocol.set_end_of_list(0, 0)?;
        protocol.execute_list()?;
        let never_abort = AtomicBool::new(false);
        protocol.wait_idle(&never_abort)?;
        protocol.set_xy_position(0x8000, 0x8000)?;
        Ok(())
    }

    /// Wait for the busy bit to clear. Also polls the footswitch via
    /// `read_port` and fires the registered callback (once) when the pedal
    /// is detected pressed.
    fn wait_while_busy(&self, protocol: &mut Protocol<T>) -> Result<bool> {
        loop {
            if self.abort_flag.load(Ordering::Acquire) {
                return Ok(false);
            }
            let port = protocol.read_port()?;
            if port & PORT_FOOTSWITCH != 0 {
                if let Some(callback) = self.footswitch.lock().unwrap().take() {
                    let mut callback = callback;
                    callback();
                }
            }
            if protocol.last_status() & status_bit::BUSY == 0 {
                return Ok(true);
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::status_bit;

    fn idle_session() -> Session<MockTransport> {
        let transport = MockTransport::new(status_bit::READY);
        Session::open_mock(transport, &InitConfig::default(), &CorrectionTable::identity()).unwrap()
    }

    #[test]
    fn run_once_completes_on_idle_device() {
        let session = idle_session();
        let mut cmd = CommandList::new();
        cmd.ready();
        assert_eq!(session.run_once(&cmd).unwrap(), ExecResult::Completed);
    }

    #[test]
    fn abort_sets_result_to_aborted_and_is_idempotent() {
        let session = idle_session();
        session.abort_flag.store(true, Ordering::Release);
        let mut cmd = CommandList::new();
        cmd.ready();
        assert_eq!(session.run_once(&cmd).unwrap(), ExecResult::Aborted);
        assert_eq!(session.run_once(&cmd).unwrap(), ExecResult::Aborted);
    }

    #[test]
    fn footswitch_callback_fires_once_then_clears() {
        let session = idle_session();
        let fired = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let fired_writer = fired.clone();
        session.set_footswitch_callback(Box::new(move || {
            fired_writer.fetch_add(1, Ordering::AcqRel);
        }));

        // First poll: footswitch bit set, still busy. Second poll: no
        // footswitch, idle. wait_while_busy should fire the callback
        // exactly once and then return once busy clears.
        {
            let mut protocol = session.protocol.lock().unwrap();
            let mut footswitch_reply = MockTransport::status_reply(status_bit::BUSY);
            footswitch_reply[2..4].copy_from_slice(&PORT_FOOTSWITCH.to_le_bytes());
            protocol.transport_mut().push_reply(footswitch_reply);
            protocol.transport_mut().push_reply(MockTransport::status_reply(0));
        }

        let mut protocol = session.protocol.lock().unwrap();
        assert!(session.wait_while_busy(&mut protocol).unwrap());
        assert_eq!(fired.load(Ordering::Acquire), 1);
    }
}
