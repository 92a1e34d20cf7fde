//! Front-panel menu, driven entirely from the instrument's own two keys
//!
//! The SRQ key advances the cursor. The LOCAL key selects, but the instrument
//! has no way to report it; it is inferred. After showing an entry we send a
//! deliberately invalid command so SYNERR is latched, then alternate the SRQ
//! mask between exposing and hiding that bit every 100 ms. While the
//! instrument obeys us the SRQ line follows the mask; when LOCAL has been
//! pressed the instrument is back in local state and silently drops the mask
//! writes, so the line stops following and the mismatch (with no FRPSRQ in
//! the poll) names the key.

use std::time::Duration;
use tokio::io::{ AsyncReadExt, AsyncWriteExt };
use tokio::time::Instant;

use crate::bus::GpibBus;
use crate::device::CmdFlags;
use crate::hal::{ Nonvolatile, Tone };
use crate::reading::Reading;
use crate::session::LinkError;
use crate::status::{ Function, MeterSetup, StatusBits };

use super::{ Event, ExtIo, StepError };

/// How long an untouched menu stays up
const MENU_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MenuPos
{
    /// Continuity offered from an overloaded 2-wire range; advances into the
    /// extended-ohms entry instead of skipping it
    ContExt,
    Cont,
    Xohm,
    Diode,
    Autohold,
    Minmax,
    Temp,
    Preset,
    PresetSave,
    PresetLoad,
    PresetBack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MenuOutcome
{
    /// Nothing to do this round
    Nop,
    /// Come back in 100 ms
    Wait,
    /// Menu closed without a selection
    Done,
    /// LOCAL selected this entry
    Select(MenuPos),
}

/// Entry point by measurement function; 2-wire ohms starts at continuity
/// (extended flavor when the range is overloaded), extended ohms at itself,
/// everything else at auto-hold
fn entry(setup: MeterSetup, reading: Option<&Reading>) -> MenuPos
{
    match setup.function() {
        Function::Ohm2W => {
            if reading.map(|r| r.is_overload()).unwrap_or(false) {
                MenuPos::ContExt
            }
            else {
                MenuPos::Cont
            }
        }
        Function::OhmExt => MenuPos::Xohm,
        _ => MenuPos::Autohold,
    }
}

fn next(pos: MenuPos) -> MenuPos
{
    match pos {
        MenuPos::ContExt => MenuPos::Xohm,
        MenuPos::Cont => MenuPos::Xohm,
        MenuPos::Xohm => MenuPos::Diode,
        MenuPos::Diode => MenuPos::Autohold,
        MenuPos::Autohold => MenuPos::Minmax,
        MenuPos::Minmax => MenuPos::Temp,
        MenuPos::Temp => MenuPos::Preset,
        MenuPos::Preset => MenuPos::Cont,
        MenuPos::PresetSave => MenuPos::PresetLoad,
        MenuPos::PresetLoad => MenuPos::PresetBack,
        MenuPos::PresetBack => MenuPos::PresetSave,
    }
}

fn label(pos: MenuPos) -> &'static [u8]
{
    match pos {
        MenuPos::ContExt | MenuPos::Cont => b"M: CONT",
        MenuPos::Xohm => b"M: XOHM",
        MenuPos::Diode => b"M: DIODE",
        MenuPos::Autohold => b"M: AUTOHOLD",
        MenuPos::Minmax => b"M: MINMAX",
        MenuPos::Temp => b"M: TEMP",
        MenuPos::Preset => b"M: PRESET",
        MenuPos::PresetSave => b"M: P SAVE",
        MenuPos::PresetLoad => b"M: P LOAD",
        MenuPos::PresetBack => b"M: BACK",
    }
}

pub(crate) struct Menu
{
    pos: MenuPos,
    /// 0: SYNERR unmasked, expecting SRQ low; 1: masked, expecting high
    stage: u8,
    opened: Option<Instant>,
}

impl Menu
{
    pub fn new() -> Self
    {
        Self {
            pos: MenuPos::Autohold,
            stage: 0,
            opened: None,
        }
    }

    pub async fn open<B, U, N, T>(
        &mut self,
        setup: MeterSetup,
        reading: Option<&Reading>,
        io: &mut ExtIo<'_, B, U, N, T>,
    )
        -> Result<(), StepError>

        where B: GpibBus,
              U: AsyncReadExt + AsyncWriteExt + Unpin + Send,
              N: Nonvolatile,
              T: Tone,
    {
        self.pos = entry(setup, reading);
        self.opened = Some(Instant::now());
        self.show(io).await?;
        self.arm_detect(io).await?;
        Ok(())
    }

    async fn show<B, U, N, T>(&self, io: &mut ExtIo<'_, B, U, N, T>) -> Result<(), LinkError>
        where B: GpibBus,
              U: AsyncReadExt + AsyncWriteExt + Unpin + Send,
              N: Nonvolatile,
              T: Tone,
    {
        io.link
            .display(
                label(self.pos),
                CmdFlags::cont() | CmdFlags::HIDE_ANNUNCIATORS,
            )
            .await
    }

    /// Latch SYNERR with an invalid command and restart the toggle
    async fn arm_detect<B, U, N, T>(&mut self, io: &mut ExtIo<'_, B, U, N, T>)
        -> Result<(), StepError>

        where B: GpibBus,
              U: AsyncReadExt + AsyncWriteExt + Unpin + Send,
              N: Nonvolatile,
              T: Tone,
    {
        io.link
            .cmd(b"A", CmdFlags::REMOTE | CmdFlags::TALK)
            .await?;
        self.stage = 0;
        Ok(())
    }

    pub async fn process<B, U, N, T>(
        &mut self,
        ev: Event,
        io: &mut ExtIo<'_, B, U, N, T>,
    )
        -> Result<MenuOutcome, StepError>

        where B: GpibBus,
              U: AsyncReadExt + AsyncWriteExt + Unpin + Send,
              N: Nonvolatile,
              T: Tone,
    {
        if self
            .opened
            .map(|t| t.elapsed() >= MENU_TIMEOUT)
            .unwrap_or(false)
        {
            return Ok(MenuOutcome::Done);
        }

        let srq = io.link.srq();
        if self.stage == 0 {
            // SYNERR unmasked; the line should be quiet
            if !(ev.intersects(Event::TIMEOUT | Event::SRQ) && srq) {
                if ev.contains(Event::TIMEOUT) {
                    self.stage = 1;
                    io.link
                        .cmd(b"M24", CmdFlags::REMOTE | CmdFlags::TALK)
                        .await?;
                    return Ok(MenuOutcome::Wait);
                }
                return Ok(MenuOutcome::Nop);
            }
        }
        else {
            // SYNERR masked; the line should be asserted
            if !(ev.intersects(Event::TIMEOUT | Event::SRQ) && !srq) {
                if ev.contains(Event::TIMEOUT) {
                    self.stage = 0;
                    io.link
                        .cmd(b"M20", CmdFlags::REMOTE | CmdFlags::TALK)
                        .await?;
                    return Ok(MenuOutcome::Wait);
                }
                return Ok(MenuOutcome::Nop);
            }
        }

        // the line stopped following the toggle; find out which key
        let sb = io.link.serial_poll().await?;
        io.link.cmd(b"KM20", CmdFlags::empty()).await?;

        if sb.contains(StatusBits::FRPSRQ) {
            self.pos = next(self.pos);
            self.show(io).await?;
        }
        else {
            // no SRQ key in the poll: LOCAL selected the highlighted entry
            if self.pos == MenuPos::Preset {
                self.pos = MenuPos::PresetSave;
                self.show(io).await?;
                self.arm_detect(io).await?;
                return Ok(MenuOutcome::Wait);
            }
            return Ok(MenuOutcome::Select(self.pos));
        }

        self.arm_detect(io).await?;
        Ok(MenuOutcome::Wait)
    }
}
