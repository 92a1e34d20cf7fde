//! Typed operations against the 3478A
//!
//! Thin protocol layer over the session: each operation addresses lazily,
//! sends or reads device-dependent bytes, and leaves the bus where the flags
//! say. Any failure tears the session down to the untalked state with ATN and
//! REN released so the extension machine can reinitialize from scratch.
//!
//! Commands always terminate with LF unless suppressed: the instrument can
//! latch a command byte without processing the rest when interrupted, so the
//! trailing LF makes the handshake wait until it has really finished.

use bitflags::bitflags;

use crate::bus::{ self, GpibBus };
use crate::reading::{ self, Reading };
use crate::session::{ Link, LinkError, Phase };
use crate::status::{ mode_command, unpack_mode_word, InstrumentStatus, MeterSetup };
use crate::transport::{ self, EndMode, Termination };

bitflags! {
    /// Behavior selectors for the protocol operations
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CmdFlags: u8
    {
        /// Stay addressed as listener after a read
        const LISTEN = 1;
        /// Stay addressed as talker after a command
        const TALK = 2;
        /// Leave REN asserted
        const REMOTE = 4;
        /// Use `D3` (annunciators blanked) instead of `D2`
        const HIDE_ANNUNCIATORS = 8;
        /// Suppress the trailing LF
        const NO_LF = 16;
    }
}

impl CmdFlags
{
    /// Keep the whole session alive across the operation
    pub fn cont() -> CmdFlags
    {
        CmdFlags::LISTEN | CmdFlags::TALK | CmdFlags::REMOTE
    }
}

impl<B> Link<B>
    where B: GpibBus
{
    /// Send an ASCII command to the instrument
    pub async fn cmd(&mut self, text: &[u8], flags: CmdFlags) -> Result<(), LinkError>
    {
        let result = self.cmd_inner(text, flags).await;
        if result.is_err() {
            self.teardown();
        }
        result
    }

    async fn cmd_inner(&mut self, text: &[u8], flags: CmdFlags) -> Result<(), LinkError>
    {
        self.bus.set_ren(true);

        if self.phase != Phase::Talker {
            self.address_device_listener().await?;
        }

        let end = if flags.contains(CmdFlags::NO_LF) {
            EndMode::empty()
        }
        else {
            EndMode::LF
        };
        let sent = transport::transmit(&mut self.bus, text, end).await;
        if sent != transport::wire_len(text.len(), end) {
            return Err(LinkError::Data { sent: sent });
        }

        if !flags.contains(CmdFlags::REMOTE) {
            self.bus.set_ren(false);
        }
        if flags.contains(CmdFlags::TALK) {
            self.phase = Phase::Talker;
        }
        else {
            self.command_bytes(&[bus::UNL]).await?;
            self.phase = Phase::Idle;
        }
        Ok(())
    }

    /// Read one EOI-terminated message from the instrument
    pub async fn read_msg(&mut self, buf: &mut [u8], flags: CmdFlags) -> Result<usize, LinkError>
    {
        let result = self.read_msg_inner(buf, flags).await;
        if result.is_err() {
            self.teardown();
        }
        result
    }

    async fn read_msg_inner(&mut self, buf: &mut [u8], flags: CmdFlags)
        -> Result<usize, LinkError>
    {
        if self.phase != Phase::Listener {
            self.address_device_talker().await?;
        }

        let (n, term) = transport::receive(&mut self.bus, buf, EndMode::EOI).await;
        if term != Termination::EOI {
            return Err(LinkError::Receive(term));
        }

        if flags.contains(CmdFlags::LISTEN) {
            self.phase = Phase::Listener;
        }
        else {
            self.bus.talk_config();
            self.command_bytes(&[bus::UNT]).await?;
            self.phase = Phase::Idle;
        }
        Ok(n)
    }

    /// Issue `B` and decode the five status bytes
    pub async fn get_status(&mut self) -> Result<InstrumentStatus, LinkError>
    {
        self.cmd(b"B", CmdFlags::TALK).await?;
        let mut raw = [0u8; 5];
        let n = self.read_msg(&mut raw, CmdFlags::empty()).await?;
        if n != 5 {
            return Err(LinkError::ShortStatus { got: n });
        }
        Ok(InstrumentStatus::from_bytes(&raw))
    }

    /// Read and parse one measurement
    pub async fn get_reading(&mut self, flags: CmdFlags) -> Result<Reading, LinkError>
    {
        let mut raw = [0u8; 13];
        let n = self.read_msg(&mut raw, flags).await?;
        Reading::parse(&raw[..n]).ok_or(LinkError::BadReading)
    }

    /// Write text into the 12-cell display field
    ///
    /// Shorter text is padded with blanks; text wider than the field is
    /// rejected before anything is sent. Dot and comma bytes ride on the
    /// preceding digit's cell and do not count.
    pub async fn display(&mut self, text: &[u8], flags: CmdFlags) -> Result<(), LinkError>
    {
        let cells = reading::display_cells(text);
        if cells > 12 {
            return Err(LinkError::DisplayLength { cells: cells });
        }

        let prefix = [
            b'D',
            if flags.contains(CmdFlags::HIDE_ANNUNCIATORS) { b'3' } else { b'2' },
        ];
        self.cmd(&prefix, CmdFlags::cont() | CmdFlags::NO_LF).await?;

        let mut padded = text.to_vec();
        padded.resize(text.len() + (12 - cells), b' ');
        self.cmd(&padded, CmdFlags::cont()).await?;

        // one more LF so the instrument closes the display string; this is
        // also where the caller's flags decide what stays asserted
        self.cmd(&[], flags).await
    }

    /// Render a reading the way the front panel would and display it
    pub async fn display_reading(
        &mut self,
        r: &Reading,
        setup: MeterSetup,
        mark: u8,
        flags: CmdFlags,
    )
        -> Result<(), LinkError>
    {
        let field = reading::render(r, setup, mark);
        self.display(field.bytes(), flags).await
    }

    /// Apply a packed mode word as an `R/N/F/Z/T` command
    pub async fn set_mode(&mut self, word: u16) -> Result<(), LinkError>
    {
        let (setup, flags) = unpack_mode_word(word);
        let text = mode_command(setup, flags);
        self.cmd(text.as_bytes(), CmdFlags::empty()).await
    }
}
