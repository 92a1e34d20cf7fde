//! The extended-measurement sub-machines
//!
//! Each mode is a pair of entry and data-handler methods on the machine.
//! Entry captures whatever the mode will later restore, forces the
//! instrument's setup, and arms the data-ready SRQ; the handler runs once per
//! reading delivered by the outer event machine.

use std::fmt::Write as _;
use std::time::Duration;
use tokio::io::{ AsyncReadExt, AsyncWriteExt };
use tokio::time::sleep;

use crate::bus::GpibBus;
use crate::device::CmdFlags;
use crate::hal::{ Nonvolatile, Tone };
use crate::reading::Reading;
use crate::status::{ restore_command, Digits, Function, MeterSetup, ModeFlags, StatusBits };

use super::{ ExtIo, Extension, ExtState, MmDisp, StepError, Wakeup };

/// Counts a reading may move per sample and still count as stable
const STABLE_WINDOW: i32 = 3;

/// Consecutive stable readings before auto-hold locks
const STABLE_COUNT: u8 = 5;

/// Verdict of one auto-hold reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AhldAction
{
    Nop,
    Lock,
    Unlock,
}

/// Inverse Callendar-Van Dusen for a PT1000 probe
///
/// `None` when the resistance is beyond the curve (open or absurd input).
pub(crate) fn pt1000_celsius(ohms: f64) -> Option<f64>
{
    const A: f64 = 3.908e-3;
    const B: f64 = -5.8019e-7;
    const R0: f64 = 1000.0;

    let discriminant = R0 * R0 * A * A - 4.0 * R0 * B * (R0 - ohms);
    if discriminant < 0.0 {
        return None;
    }
    Some((-(R0 * A) + discriminant.sqrt()) / (2.0 * R0 * B))
}

/// Resistance under test from the extended-ohms divider equation
///
/// `reference` is the first reading after entry (the meter looking at its own
/// 10 MOhm divider), `value` the current one. `None` means the result would
/// be beyond measure.
pub(crate) fn xohm_resistance(reference: i64, value: i32) -> Option<u64>
{
    if reference <= value as i64 + 100 {
        return None;
    }
    let v = value.max(0) as u64;
    let r = reference as u64;
    Some(r * v / (r - v))
}

/// Scale an extended-ohms result into a displayable reading, walking the
/// decimal point through the megohm and gigaohm decades
pub(crate) fn xohm_reading(mut resistance: u64) -> Reading
{
    let mut exp: i8 = 6;
    let mut dot: u8 = 2;
    while resistance > 1_000_000 {
        dot += 1;
        if dot == 4 {
            exp += 3;
            dot = 1;
        }
        resistance /= 10;
    }
    Reading::new(resistance as i32, dot, exp)
}

/// Stability floor: hold only locks on readings at or above this magnitude
///
/// Low-voltage DC ranges and resistance always qualify; higher ranges need
/// more counts the fewer digits are displayed, so noise in the blanked
/// digits cannot fake stability.
pub(crate) fn autohold_floor(setup: MeterSetup) -> i32
{
    if setup.function() == Function::Dcv && setup.range() <= 3 {
        return 0;
    }
    match setup.function() {
        Function::Dcv | Function::Acv | Function::Dca | Function::Aca => {
            match setup.digits() {
                Digits::FiveAndHalf => 10,
                Digits::FourAndHalf => 100,
                Digits::ThreeAndHalf => 1000,
            }
        }
        _ => 0,
    }
}

/// Expected `(dot, exp)` of readings on a fixed resistance range; a mismatch
/// means the user grabbed the range or function switch
pub(crate) fn cont_expected_scale(range: u8) -> (u8, i8)
{
    match range {
        1 => (2, 0),
        2 => (3, 0),
        3 => (1, 3),
        4 => (2, 3),
        5 => (3, 3),
        6 => (1, 6),
        _ => (2, 6),
    }
}

/// Threshold in whole ohms for the configured range, for display
pub(crate) fn cont_threshold_ohms(threshold: u16, range: u8) -> u32
{
    let t = threshold as u32;
    if range >= 3 {
        t * 10u32.pow(range as u32 - 3)
    }
    else {
        t / 10u32.pow(3 - range as u32)
    }
}

/// Tone parameters for a continuity reading, interpolated between the two
/// configured break-points and clamped outside them
pub(crate) fn cont_tone(
    value: i32,
    low: (u16, u16, u8),
    high: (u16, u16, u8),
)
    -> (u16, u8)
{
    let (t1, p1, d1) = low;
    let (t2, p2, d2) = high;
    let lo = t1 as i64 * 100;
    let hi = t2 as i64 * 100;
    let v = value.max(0) as i64;

    if hi <= lo || v <= lo {
        return (p1, d1);
    }
    if v >= hi {
        return (p2, d2);
    }

    let period = p1 as i64 + (p2 as i64 - p1 as i64) * (v - lo) / (hi - lo);
    let duty = d1 as i64 + (d2 as i64 - d1 as i64) * (v - lo) / (hi - lo);
    (period as u16, duty as u8)
}

impl Extension
{
    /// Undo a forced range/digits/autozero, tone off (continuity, diode)
    pub(crate) async fn restore_setup<B, U, N, T>(&mut self, io: &mut ExtIo<'_, B, U, N, T>)
        where B: GpibBus,
              U: AsyncReadExt + AsyncWriteExt + Unpin + Send,
              N: Nonvolatile,
              T: Tone,
    {
        io.tone.stop();
        let cmd = restore_command(self.saved_setup, self.saved_flags);
        let _ = io.link.cmd(&cmd, CmdFlags::empty()).await;
    }

    async fn save_status<B, U, N, T>(&mut self, io: &mut ExtIo<'_, B, U, N, T>)
        -> Result<(), StepError>

        where B: GpibBus,
              U: AsyncReadExt + AsyncWriteExt + Unpin + Send,
              N: Nonvolatile,
              T: Tone,
    {
        let st = io.link.get_status().await?;
        self.saved_setup = st.setup;
        self.saved_flags = st.flags;
        Ok(())
    }

    // ---- continuity -----------------------------------------------------

    async fn show_cont_threshold<B, U, N, T>(&self, io: &mut ExtIo<'_, B, U, N, T>)
        -> Result<(), StepError>

        where B: GpibBus,
              U: AsyncReadExt + AsyncWriteExt + Unpin + Send,
              N: Nonvolatile,
              T: Tone,
    {
        let ohms = cont_threshold_ohms(io.cfg.cont_threshold(), io.cfg.cont_range());
        let mut text = String::new();
        let _ = write!(text, " >{} OHM", ohms);
        io.link
            .display(text.as_bytes(), CmdFlags::HIDE_ANNUNCIATORS)
            .await?;
        Ok(())
    }

    pub(crate) async fn cont_init<B, U, N, T>(&mut self, io: &mut ExtIo<'_, B, U, N, T>)
        -> Result<(), StepError>

        where B: GpibBus,
              U: AsyncReadExt + AsyncWriteExt + Unpin + Send,
              N: Nonvolatile,
              T: Tone,
    {
        self.save_status(io).await?;
        // the menu is reachable from any function, so pin 2-wire ohms along
        // with the range, resolution and autozero
        let mut cmd = String::new();
        let _ = write!(cmd, "F3R{}N3M21Z0", io.cfg.cont_range());
        io.link.cmd(cmd.as_bytes(), CmdFlags::empty()).await?;
        self.show_cont_threshold(io).await?;
        self.buzzing = false;
        self.cont_latch = 0;
        Ok(())
    }

    pub(crate) async fn cont_handle<B, U, N, T>(
        &mut self,
        r: Reading,
        io: &mut ExtIo<'_, B, U, N, T>,
    )
        -> Result<Wakeup, StepError>

        where B: GpibBus,
              U: AsyncReadExt + AsyncWriteExt + Unpin + Send,
              N: Nonvolatile,
              T: Tone,
    {
        let range = io.cfg.cont_range();

        if !r.is_overload() && (r.dot, r.exp) != cont_expected_scale(range) {
            // readings changed scale under a fixed range: the user is
            // turning knobs, stop forcing the instrument
            let st = io.link.get_status().await?;
            if st.setup.function() != Function::Ohm2W || st.setup.range() != range {
                io.tone.stop();
                io.link.cmd(b"KM20D1", CmdFlags::empty()).await?;
                self.state = ExtState::Idle;
                return Ok(Wakeup::Never);
            }
            return Ok(Wakeup::After(2));
        }

        let threshold = io.cfg.cont_threshold() as i32 * 100;
        if !r.is_overload() && r.value <= threshold {
            let (low, high) = io.cfg.cont_breakpoints();
            let (period, duty) = cont_tone(r.value, low, high);
            io.tone.start(period, duty);
            if !self.buzzing {
                io.link.cmd(b"D1", CmdFlags::empty()).await?;
                self.buzzing = true;
            }
            self.cont_latch = io.cfg.cont_latch();
        }
        else if self.buzzing {
            if self.cont_latch > 0 {
                self.cont_latch -= 1;
            }
            else {
                io.tone.stop();
                self.show_cont_threshold(io).await?;
                self.buzzing = false;
            }
        }

        // revisit quickly; the reading rate is the limiting factor and the
        // next sample is due in well under a power-line cycle
        Ok(Wakeup::After(2))
    }

    // ---- extended ohms --------------------------------------------------

    pub(crate) async fn xohm_init<B, U, N, T>(&mut self, io: &mut ExtIo<'_, B, U, N, T>)
        -> Result<(), StepError>

        where B: GpibBus,
              U: AsyncReadExt + AsyncWriteExt + Unpin + Send,
              N: Nonvolatile,
              T: Tone,
    {
        self.xohm_ref = 0;
        io.link.cmd(b"F7M21", CmdFlags::empty()).await?;
        Ok(())
    }

    pub(crate) async fn xohm_handle<B, U, N, T>(
        &mut self,
        r: Reading,
        io: &mut ExtIo<'_, B, U, N, T>,
    )
        -> Result<(), StepError>

        where B: GpibBus,
              U: AsyncReadExt + AsyncWriteExt + Unpin + Send,
              N: Nonvolatile,
              T: Tone,
    {
        if self.xohm_ref == 0 {
            // first sample calibrates: probes open, the meter sees its own
            // 10 MOhm divider
            self.xohm_ref = r.value as i64;
        }

        match xohm_resistance(self.xohm_ref, r.value) {
            None => {
                io.link
                    .display(b"  OVLD  GOHM", CmdFlags::empty())
                    .await?;
            }
            Some(resistance) => {
                let out = xohm_reading(resistance);
                let setup = MeterSetup::new(Function::Ohm2W, 0, Digits::FiveAndHalf);
                io.link
                    .display_reading(&out, setup, 0, CmdFlags::empty())
                    .await?;
            }
        }
        Ok(())
    }

    // ---- diode ----------------------------------------------------------

    pub(crate) async fn diode_init<B, U, N, T>(&mut self, io: &mut ExtIo<'_, B, U, N, T>)
        -> Result<(), StepError>

        where B: GpibBus,
              U: AsyncReadExt + AsyncWriteExt + Unpin + Send,
              N: Nonvolatile,
              T: Tone,
    {
        self.save_status(io).await?;
        io.link.cmd(b"F3R3M21", CmdFlags::empty()).await?;
        self.disp_live = true;
        Ok(())
    }

    pub(crate) async fn diode_handle<B, U, N, T>(
        &mut self,
        mut r: Reading,
        io: &mut ExtIo<'_, B, U, N, T>,
    )
        -> Result<(), StepError>

        where B: GpibBus,
              U: AsyncReadExt + AsyncWriteExt + Unpin + Send,
              N: Nonvolatile,
              T: Tone,
    {
        if r.is_overload() {
            if self.disp_live {
                self.disp_live = false;
                io.link
                    .display(b"     >3 V", CmdFlags::HIDE_ANNUNCIATORS)
                    .await?;
            }
            return Ok(());
        }
        self.disp_live = true;
        r.exp = 0;
        io.link
            .display_reading(&r, self.saved_setup, b'd', CmdFlags::empty())
            .await?;
        Ok(())
    }

    // ---- PT1000 temperature ---------------------------------------------

    pub(crate) async fn temp_init<B, U, N, T>(&mut self, io: &mut ExtIo<'_, B, U, N, T>)
        -> Result<(), StepError>

        where B: GpibBus,
              U: AsyncReadExt + AsyncWriteExt + Unpin + Send,
              N: Nonvolatile,
              T: Tone,
    {
        self.save_status(io).await?;
        io.link.cmd(b"M21", CmdFlags::empty()).await?;
        self.disp_live = true;
        Ok(())
    }

    pub(crate) async fn temp_handle<B, U, N, T>(
        &mut self,
        r: Reading,
        io: &mut ExtIo<'_, B, U, N, T>,
    )
        -> Result<(), StepError>

        where B: GpibBus,
              U: AsyncReadExt + AsyncWriteExt + Unpin + Send,
              N: Nonvolatile,
              T: Tone,
    {
        let celsius = if r.is_overload() {
            None
        }
        else {
            let ohms = r.value as f64 * 10f64.powi(r.dot as i32 + r.exp as i32 - 6);
            pt1000_celsius(ohms)
        };

        match celsius {
            None => {
                if self.disp_live {
                    self.disp_live = false;
                    io.link
                        .display(b"  OPEN", CmdFlags::HIDE_ANNUNCIATORS)
                        .await?;
                }
            }
            Some(t) => {
                self.disp_live = true;
                let out = Reading::new((t * 1000.0) as i32, 3, 0);
                io.link
                    .display_reading(&out, self.saved_setup, b'c', CmdFlags::empty())
                    .await?;
            }
        }
        Ok(())
    }

    // ---- relative -------------------------------------------------------

    pub(crate) async fn rel_start<B, U, N, T>(
        &mut self,
        setup: MeterSetup,
        reference: Reading,
        io: &mut ExtIo<'_, B, U, N, T>,
    )
        -> Result<(), StepError>

        where B: GpibBus,
              U: AsyncReadExt + AsyncWriteExt + Unpin + Send,
              N: Nonvolatile,
              T: Tone,
    {
        io.link.cmd(b"M21T1", CmdFlags::empty()).await?;
        self.rel_setup = setup;
        self.rel_ref = reference;
        Ok(())
    }

    // ---- auto-hold ------------------------------------------------------

    pub(crate) async fn autohold_init<B, U, N, T>(&mut self, io: &mut ExtIo<'_, B, U, N, T>)
        -> Result<(), StepError>

        where B: GpibBus,
              U: AsyncReadExt + AsyncWriteExt + Unpin + Send,
              N: Nonvolatile,
              T: Tone,
    {
        self.n_stable = 0;
        self.hold_last = Reading::overload();
        self.save_status(io).await?;
        io.link.cmd(b"M21T1", CmdFlags::empty()).await?;
        Ok(())
    }

    pub(crate) async fn autohold_process<B, U, N, T>(
        &mut self,
        locked: bool,
        sb: StatusBits,
        io: &mut ExtIo<'_, B, U, N, T>,
    )
        -> Result<AhldAction, StepError>

        where B: GpibBus,
              U: AsyncReadExt + AsyncWriteExt + Unpin + Send,
              N: Nonvolatile,
              T: Tone,
    {
        if !sb.contains(StatusBits::DREADY) {
            return Ok(AhldAction::Nop);
        }
        let r = io.link.get_reading(CmdFlags::cont()).await?;

        if r.dot != self.hold_last.dot || r.exp != self.hold_last.exp || r.is_overload() {
            // scale moved; check whether the instrument setup itself changed
            let st = io.link.get_status().await?;
            let mask = MeterSetup::diff_mask(!self.saved_flags.contains(ModeFlags::AUTORANGE));
            let setup_changed = (st.setup.byte() ^ self.saved_setup.byte()) & mask != 0
                || (st.flags ^ self.saved_flags).contains(ModeFlags::AUTORANGE);

            let mut action = AhldAction::Nop;
            if setup_changed {
                if locked {
                    action = AhldAction::Unlock;
                }
                self.saved_flags = st.flags;
            }
            self.saved_setup = st.setup;
            self.hold_last = r;
            self.n_stable = 1;

            if locked {
                return Ok(action);
            }
            io.link
                .display_reading(&r, self.saved_setup, b'?', CmdFlags::empty())
                .await?;
            return Ok(action);
        }

        if locked {
            if (r.value - self.hold_locked.value).abs() < STABLE_WINDOW {
                return Ok(AhldAction::Nop);
            }
            // a single excursion releases the hold and resumes tracking
            self.hold_last = r;
            self.n_stable = 1;
            io.link
                .display_reading(&r, self.saved_setup, b'?', CmdFlags::empty())
                .await?;
            return Ok(AhldAction::Unlock);
        }

        if self.n_stable != 0
            && (r.value - self.hold_last.value).abs() < STABLE_WINDOW
            && r.value.abs() >= autohold_floor(self.saved_setup)
        {
            self.n_stable += 1;
            if self.n_stable == STABLE_COUNT {
                self.hold_locked = self.hold_last;
                self.n_stable = 0;
                io.link
                    .display_reading(&self.hold_last, self.saved_setup, b'=', CmdFlags::empty())
                    .await?;
                return Ok(AhldAction::Lock);
            }
            return Ok(AhldAction::Nop);
        }

        self.hold_last = r;
        self.n_stable = 1;
        io.link
            .display_reading(&r, self.saved_setup, b'?', CmdFlags::empty())
            .await?;
        Ok(AhldAction::Nop)
    }

    // ---- min/max --------------------------------------------------------

    pub(crate) async fn minmax_init<B, U, N, T>(&mut self, io: &mut ExtIo<'_, B, U, N, T>)
        -> Result<(), StepError>

        where B: GpibBus,
              U: AsyncReadExt + AsyncWriteExt + Unpin + Send,
              N: Nonvolatile,
              T: Tone,
    {
        self.save_status(io).await?;
        io.link.cmd(b"M21", CmdFlags::empty()).await?;
        self.mm_have_min = false;
        self.mm_have_max = false;
        self.mm_disp = MmDisp::Live;
        Ok(())
    }

    /// Distinguish "some key was pressed" from data-ready SRQs by unmasking
    /// DREADY and watching whether the line drops
    async fn minmax_detect_key<B, U, N, T>(&mut self, io: &mut ExtIo<'_, B, U, N, T>)
        -> Result<bool, StepError>

        where B: GpibBus,
              U: AsyncReadExt + AsyncWriteExt + Unpin + Send,
              N: Nonvolatile,
              T: Tone,
    {
        if !io.link.srq() {
            return Ok(false);
        }
        if io.link.cmd(b"M20", CmdFlags::cont()).await.is_err() {
            io.uart.write_all(b"M20 failed\r\n").await?;
            return Ok(true);
        }
        // the mask write needs ~250 us to reach the SRQ line
        sleep(Duration::from_micros(400)).await;
        Ok(io.link.srq())
    }

    fn minmax_update(&mut self, r: &Reading) -> (bool, bool)
    {
        let mut changed = (false, false);
        if r.is_overload() {
            return changed;
        }
        if !self.mm_have_min || r.cmp_value(&self.mm_min) == std::cmp::Ordering::Less {
            self.mm_min = *r;
            self.mm_have_min = true;
            changed.0 = true;
        }
        if !self.mm_have_max || r.cmp_value(&self.mm_max) == std::cmp::Ordering::Greater {
            self.mm_max = *r;
            self.mm_have_max = true;
            changed.1 = true;
        }
        changed
    }

    async fn minmax_show<B, U, N, T>(
        &mut self,
        changed: (bool, bool),
        key_press: bool,
        io: &mut ExtIo<'_, B, U, N, T>,
    )
        -> Result<(), StepError>

        where B: GpibBus,
              U: AsyncReadExt + AsyncWriteExt + Unpin + Send,
              N: Nonvolatile,
              T: Tone,
    {
        let flags = CmdFlags::cont() | CmdFlags::HIDE_ANNUNCIATORS;

        match self.mm_disp {
            MmDisp::Live => {
                if key_press {
                    self.mm_disp = MmDisp::Min;
                    if self.mm_have_min {
                        let d = self.mm_min;
                        io.link
                            .display_reading(&d, self.saved_setup, b'-', flags)
                            .await?;
                    }
                    else {
                        io.link.display(b"NO MIN", flags).await?;
                    }
                }
            }
            MmDisp::Min => {
                if key_press {
                    self.mm_disp = MmDisp::Max;
                    if self.mm_have_max {
                        let d = self.mm_max;
                        io.link
                            .display_reading(&d, self.saved_setup, b'+', flags)
                            .await?;
                    }
                    else {
                        io.link.display(b"NO MAX", flags).await?;
                    }
                }
                else if changed.0 {
                    let d = self.mm_min;
                    io.link
                        .display_reading(&d, self.saved_setup, b'-', flags)
                        .await?;
                }
            }
            MmDisp::Max => {
                if key_press {
                    self.mm_disp = MmDisp::Live;
                    io.link.cmd(b"D1", CmdFlags::cont()).await?;
                }
                else if changed.1 {
                    let d = self.mm_max;
                    io.link
                        .display_reading(&d, self.saved_setup, b'+', flags)
                        .await?;
                }
            }
        }
        Ok(())
    }

    pub(crate) async fn minmax_step<B, U, N, T>(&mut self, io: &mut ExtIo<'_, B, U, N, T>)
        -> Result<Wakeup, StepError>

        where B: GpibBus,
              U: AsyncReadExt + AsyncWriteExt + Unpin + Send,
              N: Nonvolatile,
              T: Tone,
    {
        let key = self.minmax_detect_key(io).await?;

        let sb = io.link.serial_poll().await?;
        if key && !sb.contains(StatusBits::FRPSRQ) {
            // a key press with no SRQ bit: LOCAL, leave the mode
            io.link.cmd(b"KM20D1", CmdFlags::empty()).await?;
            self.state = ExtState::Idle;
            return Ok(Wakeup::Never);
        }

        let mut changed = (false, false);
        if sb.contains(StatusBits::DREADY) {
            let r = io.link.get_reading(CmdFlags::cont()).await?;
            changed = self.minmax_update(&r);
        }
        self.minmax_show(changed, sb.contains(StatusBits::FRPSRQ), io)
            .await?;

        // put the data-ready mask back after the key probe
        io.link.cmd(b"M21", CmdFlags::cont()).await?;
        Ok(Wakeup::Never)
    }
}
