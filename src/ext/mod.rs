//! The extension-mode event machine
//!
//! A single enumerated state driven by three event sources: the SRQ line,
//! deadline expiry, and the synthetic enable/disable pair the shell generates
//! when the user flips the extension option. Each invocation handles one
//! event batch atomically and answers with the next deadline.
//!
//! Unless a state polls for itself (the menu and min/max need finer control
//! over SRQ timing), every invocation starts with a serial poll: a power-on
//! status restarts everything, the front-panel SRQ key routes by state, and
//! data-ready bits fall through to the active mode's handler.

use std::{ fmt::Write as _, io };
use tokio::io::{ AsyncReadExt, AsyncWriteExt };

use crate::bus::GpibBus;
use crate::config::{ Config, Opt };
use crate::device::CmdFlags;
use crate::hal::{ Nonvolatile, Tone };
use crate::reading::Reading;
use crate::session::{ Link, LinkError };
use crate::status::{ mode_word, MeterSetup, ModeFlags, StatusBits };

use bitflags::bitflags;

mod menu;
mod modes;

use menu::{ Menu, MenuOutcome, MenuPos };

bitflags! {
    /// One batch of main-loop events
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Event: u8
    {
        const TIMEOUT = 1;
        const SRQ = 2;
        const UART = 4;
        const EXT_DISABLE = 8;
        const EXT_ENABLE = 16;
    }
}

/// What the machine wants from the event loop next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wakeup
{
    /// No deadline; wait for SRQ or the user
    Never,
    /// Keep the previous deadline
    Unchanged,
    /// Wake after this many milliseconds
    After(u16),
}

/// Retry distance after a transient protocol failure
const REINIT_DELAY_MS: u16 = 250;

/// Consecutive initialization failures before the machine goes quiescent
const STICKY_FAILURES: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtState
{
    Disabled,
    Init,
    Idle,
    /// Waiting up to 1.8 s for a single-trigger reading before deciding
    /// between relative and auto-hold
    RelSettle,
    RelActive,
    Menu,
    Xohm,
    Cont,
    MinMax,
    HoldTrack,
    HoldLock,
    Diode,
    Temp,
    /// Quiescent after repeated init failures; revived by disable/enable
    Failed,
}

fn state_code(state: ExtState) -> u8
{
    match state {
        ExtState::Disabled => 0x40,
        ExtState::Init => 0x41,
        ExtState::Idle => 0x42,
        ExtState::RelSettle => 0x43,
        ExtState::RelActive => 0x44,
        ExtState::Menu => 0x45,
        ExtState::Xohm => 0x46,
        ExtState::Cont => 0x47,
        ExtState::MinMax => 0x48,
        ExtState::HoldTrack => 0x49,
        ExtState::HoldLock => 0x4a,
        ExtState::Diode => 0x4b,
        ExtState::Temp => 0x4c,
        ExtState::Failed => 0x4d,
    }
}

/// Either a protocol failure (handled by reinitializing) or a serial-side
/// failure (fatal to the bridge loop)
pub(crate) enum StepError
{
    Link(LinkError),
    Io(io::Error),
}

impl From<LinkError> for StepError
{
    fn from(this: LinkError) -> Self
    {
        StepError::Link(this)
    }
}

impl From<io::Error> for StepError
{
    fn from(this: io::Error) -> Self
    {
        StepError::Io(this)
    }
}

/// Everything a handler invocation may touch besides the machine itself
pub struct ExtIo<'a, B, U, N, T>
{
    pub link: &'a mut Link<B>,
    pub uart: &'a mut U,
    pub cfg: &'a mut Config,
    pub nv: &'a mut N,
    pub tone: &'a mut T,
}

/// Min/max display selector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MmDisp
{
    Live,
    Min,
    Max,
}

pub struct Extension
{
    state: ExtState,
    menu: Menu,

    /// Setup and flags captured on mode entry, for restore and change
    /// detection
    saved_setup: MeterSetup,
    saved_flags: ModeFlags,

    rel_ref: Reading,
    rel_setup: MeterSetup,

    pub(crate) mm_min: Reading,
    pub(crate) mm_max: Reading,
    pub(crate) mm_have_min: bool,
    pub(crate) mm_have_max: bool,
    pub(crate) mm_disp: MmDisp,

    hold_last: Reading,
    hold_locked: Reading,
    n_stable: u8,

    xohm_ref: i64,

    /// Whether diode/temperature mode currently shows a value (so the
    /// open-circuit text is written once, not per reading)
    disp_live: bool,

    buzzing: bool,
    cont_latch: u8,

    init_fails: u8,
    /// Most recent error code per nesting level, transport first
    trail: [u8; 4],
}

impl Extension
{
    pub fn new() -> Self
    {
        Self {
            state: ExtState::Disabled,
            menu: Menu::new(),
            saved_setup: MeterSetup::from_byte(0),
            saved_flags: ModeFlags::empty(),
            rel_ref: Reading::overload(),
            rel_setup: MeterSetup::from_byte(0),
            mm_min: Reading::overload(),
            mm_max: Reading::overload(),
            mm_have_min: false,
            mm_have_max: false,
            mm_disp: MmDisp::Live,
            hold_last: Reading::overload(),
            hold_locked: Reading::overload(),
            n_stable: 0,
            xohm_ref: 0,
            disp_live: false,
            buzzing: false,
            cont_latch: 0,
            init_fails: 0,
            trail: [0; 4],
        }
    }

    pub fn state(&self) -> ExtState
    {
        self.state
    }

    /// Record a failure and fall back to initialization
    fn reinit_on(&mut self, err: &LinkError) -> Wakeup
    {
        self.trail[err.level()] = err.code();
        self.trail[3] = state_code(self.state);
        self.state = ExtState::Init;
        Wakeup::After(REINIT_DELAY_MS)
    }

    fn reinit_quiet(&mut self) -> Wakeup
    {
        self.state = ExtState::Init;
        Wakeup::After(REINIT_DELAY_MS)
    }

    /// Handle one event batch
    pub async fn handle<B, U, N, T>(
        &mut self,
        ev: Event,
        io: &mut ExtIo<'_, B, U, N, T>,
    )
        -> io::Result<Wakeup>

        where B: GpibBus,
              U: AsyncReadExt + AsyncWriteExt + Unpin + Send,
              N: Nonvolatile,
              T: Tone,
    {
        match self.step(ev, io).await {
            Ok(wakeup) => Ok(wakeup),
            Err(StepError::Io(err)) => Err(err),
            Err(StepError::Link(err)) => Ok(self.reinit_on(&err)),
        }
    }

    async fn step<B, U, N, T>(
        &mut self,
        ev: Event,
        io: &mut ExtIo<'_, B, U, N, T>,
    )
        -> Result<Wakeup, StepError>

        where B: GpibBus,
              U: AsyncReadExt + AsyncWriteExt + Unpin + Send,
              N: Nonvolatile,
              T: Tone,
    {
        if self.state == ExtState::Disabled {
            if !ev.contains(Event::EXT_ENABLE) {
                return Ok(Wakeup::Never);
            }
            self.state = ExtState::Init;
            self.init_fails = 0;
        }

        if ev.contains(Event::EXT_DISABLE) {
            self.teardown(io).await;
            self.state = ExtState::Disabled;
            return Ok(Wakeup::Never);
        }

        let mut sb = StatusBits::empty();
        let polls_itself = matches!(
            self.state,
            ExtState::Init | ExtState::Menu | ExtState::MinMax | ExtState::Failed
        );
        if !polls_itself {
            sb = io.link.serial_poll().await?;

            if sb.contains(StatusBits::PWRSRQ) {
                // the instrument was power cycled under us; push the stored
                // initial mode at it before starting over
                let word = io.cfg.init_mode();
                if word != 0 {
                    let _ = io.link.set_mode(word).await;
                }
                return Ok(self.reinit_quiet());
            }

            if sb.contains(StatusBits::FRPSRQ) {
                return self.front_key(sb, io).await;
            }
        }

        match self.state {
            ExtState::Disabled => Ok(Wakeup::Never), // handled above

            ExtState::Init => match io.link.cmd(b"KM20", CmdFlags::empty()).await {
                Ok(()) => {
                    io.uart.write_all(b"init: ok\r\n").await?;
                    self.init_fails = 0;
                    self.state = ExtState::Idle;
                    Ok(Wakeup::Never)
                }
                Err(err) => {
                    self.trail[err.level()] = err.code();
                    self.trail[3] = state_code(ExtState::Init);
                    self.init_fails += 1;
                    if self.init_fails >= STICKY_FAILURES {
                        self.show_trail(io).await;
                        self.state = ExtState::Failed;
                        Ok(Wakeup::Never)
                    }
                    else {
                        Ok(Wakeup::After(REINIT_DELAY_MS))
                    }
                }
            },

            ExtState::Failed => Ok(Wakeup::Never),

            ExtState::Idle => {
                io.link.cmd(b"K", CmdFlags::empty()).await?;
                let mut diag = String::new();
                let _ = write!(diag, "idle: unexpected ev {:x} {:x}\r\n", ev.bits(), sb.bits());
                io.uart.write_all(diag.as_bytes()).await?;
                Ok(Wakeup::Never)
            }

            ExtState::Menu => {
                let outcome = self.menu.process(ev, io).await?;
                self.menu_outcome(outcome, io).await
            }

            ExtState::RelSettle => {
                if ev.contains(Event::TIMEOUT) {
                    // no reading appeared; fall back to auto-hold
                    self.autohold_init(io).await?;
                    self.state = ExtState::HoldTrack;
                    return Ok(Wakeup::Never);
                }
                if !sb.contains(StatusBits::DREADY) {
                    return Ok(Wakeup::Unchanged);
                }
                let r = io.link.get_reading(CmdFlags::LISTEN).await?;
                if r.is_overload() {
                    self.autohold_init(io).await?;
                    self.state = ExtState::HoldTrack;
                    return Ok(Wakeup::Never);
                }
                let st = io.link.get_status().await?;
                self.rel_start(st.setup, r, io).await?;
                self.state = ExtState::RelActive;
                Ok(Wakeup::Never)
            }

            ExtState::RelActive => {
                if sb.contains(StatusBits::DREADY) {
                    let r = io.link.get_reading(CmdFlags::LISTEN).await?;
                    let out = r.sub_aligned(&self.rel_ref);
                    let shown = io
                        .link
                        .display_reading(&out, self.rel_setup, b'*', CmdFlags::empty())
                        .await;
                    if shown.is_err() {
                        io.link.cmd(b"M20D1", CmdFlags::empty()).await?;
                        self.state = ExtState::Idle;
                    }
                }
                Ok(Wakeup::Never)
            }

            ExtState::HoldTrack | ExtState::HoldLock => {
                let locked = self.state == ExtState::HoldLock;
                let action = match self.autohold_process(locked, sb, io).await {
                    Ok(action) => action,
                    Err(err) => {
                        io.tone.stop();
                        return Err(err);
                    }
                };
                match action {
                    modes::AhldAction::Lock => {
                        let (period, duty) = io.cfg.beep();
                        io.tone.start(period, duty);
                        self.state = ExtState::HoldLock;
                        Ok(Wakeup::After(300))
                    }
                    modes::AhldAction::Unlock => {
                        io.tone.stop();
                        self.state = ExtState::HoldTrack;
                        Ok(Wakeup::Never)
                    }
                    modes::AhldAction::Nop => {
                        if locked {
                            if ev.contains(Event::TIMEOUT) {
                                // end of the lock beep
                                io.tone.stop();
                                Ok(Wakeup::Never)
                            }
                            else {
                                Ok(Wakeup::Unchanged)
                            }
                        }
                        else {
                            Ok(Wakeup::Never)
                        }
                    }
                }
            }

            ExtState::Xohm => {
                if sb.contains(StatusBits::DREADY) {
                    let r = io.link.get_reading(CmdFlags::LISTEN).await?;
                    io.link.cmd(b"K", CmdFlags::cont()).await?;
                    self.xohm_handle(r, io).await?;
                }
                Ok(Wakeup::Never)
            }

            ExtState::Temp => {
                if sb.contains(StatusBits::DREADY) {
                    let r = io.link.get_reading(CmdFlags::LISTEN).await?;
                    io.link.cmd(b"K", CmdFlags::cont()).await?;
                    self.temp_handle(r, io).await?;
                }
                Ok(Wakeup::Never)
            }

            ExtState::Cont => {
                if sb.contains(StatusBits::DREADY) {
                    let r = io.link.get_reading(CmdFlags::LISTEN).await?;
                    return self.cont_handle(r, io).await;
                }
                Ok(Wakeup::Never)
            }

            ExtState::Diode => {
                if sb.contains(StatusBits::DREADY) {
                    let r = io.link.get_reading(CmdFlags::LISTEN).await?;
                    self.diode_handle(r, io).await?;
                }
                Ok(Wakeup::Never)
            }

            ExtState::MinMax => self.minmax_step(io).await,
        }
    }

    /// Route a front-panel SRQ key press by state
    async fn front_key<B, U, N, T>(
        &mut self,
        sb: StatusBits,
        io: &mut ExtIo<'_, B, U, N, T>,
    )
        -> Result<Wakeup, StepError>

        where B: GpibBus,
              U: AsyncReadExt + AsyncWriteExt + Unpin + Send,
              N: Nonvolatile,
              T: Tone,
    {
        match self.state {
            ExtState::HoldTrack | ExtState::HoldLock => {
                io.tone.stop();
                let _ = io.link.cmd(b"KM20D1T1", CmdFlags::empty()).await;
            }

            ExtState::Idle => return self.idle_key(sb, io).await,

            ExtState::Cont | ExtState::Diode => {
                self.restore_setup(io).await;
                let _ = io.link.cmd(b"KM20D1", CmdFlags::empty()).await;
            }

            _ => {
                let _ = io.link.cmd(b"KM20D1", CmdFlags::empty()).await;
            }
        }

        self.state = ExtState::Idle;
        Ok(Wakeup::Never)
    }

    /// The key press that starts everything: relative, auto-hold or the menu
    /// depending on trigger mode and the pending reading
    async fn idle_key<B, U, N, T>(
        &mut self,
        sb: StatusBits,
        io: &mut ExtIo<'_, B, U, N, T>,
    )
        -> Result<Wakeup, StepError>

        where B: GpibBus,
              U: AsyncReadExt + AsyncWriteExt + Unpin + Send,
              N: Nonvolatile,
              T: Tone,
    {
        let mut reading = None;
        if sb.contains(StatusBits::DREADY) {
            match io.link.get_reading(CmdFlags::LISTEN).await {
                Ok(r) => reading = Some(r),
                Err(err) => {
                    io.uart.write_all(b"idle: get reading failed\r\n").await?;
                    return Err(err.into());
                }
            }
        }

        // the serial poll dropped SRQ but the status bits linger; K clears
        // them so the next key press is not mistaken for this one
        io.link.cmd(b"K", CmdFlags::cont()).await?;
        let st = io.link.get_status().await?;

        if !st.flags.contains(ModeFlags::INT_TRIGGER) {
            match reading {
                None => {
                    io.link.cmd(b"M21", CmdFlags::empty()).await?;
                    self.state = ExtState::RelSettle;
                    return Ok(Wakeup::After(1800));
                }
                Some(r) if r.is_overload() => {
                    self.autohold_init(io).await?;
                    self.state = ExtState::HoldTrack;
                    return Ok(Wakeup::Never);
                }
                Some(r) => {
                    self.rel_start(st.setup, r, io).await?;
                    self.state = ExtState::RelActive;
                    return Ok(Wakeup::Never);
                }
            }
        }

        if let Err(err) = self.menu.open(st.setup, reading.as_ref(), io).await {
            io.uart.write_all(b"idle: menu init failed\r\n").await?;
            return Err(err);
        }
        self.state = ExtState::Menu;
        Ok(Wakeup::After(100))
    }

    /// Apply a menu verdict
    async fn menu_outcome<B, U, N, T>(
        &mut self,
        outcome: MenuOutcome,
        io: &mut ExtIo<'_, B, U, N, T>,
    )
        -> Result<Wakeup, StepError>

        where B: GpibBus,
              U: AsyncReadExt + AsyncWriteExt + Unpin + Send,
              N: Nonvolatile,
              T: Tone,
    {
        let pos = match outcome {
            MenuOutcome::Nop => return Ok(Wakeup::Unchanged),
            MenuOutcome::Wait => return Ok(Wakeup::After(100)),
            MenuOutcome::Done => {
                let _ = io.link.cmd(b"KM20D1", CmdFlags::empty()).await;
                io.uart.write_all(b"menu: idle\r\n").await?;
                self.state = ExtState::Idle;
                return Ok(Wakeup::Never);
            }
            MenuOutcome::Select(pos) => pos,
        };

        match pos {
            MenuPos::Cont | MenuPos::ContExt => {
                io.uart.write_all(b"menu: cont\r\n").await?;
                self.cont_init(io).await?;
                self.state = ExtState::Cont;
            }
            MenuPos::Xohm => {
                io.uart.write_all(b"menu: xohm\r\n").await?;
                self.xohm_init(io).await?;
                self.state = ExtState::Xohm;
            }
            MenuPos::Diode => {
                io.uart.write_all(b"menu: diode\r\n").await?;
                self.diode_init(io).await?;
                self.state = ExtState::Diode;
            }
            MenuPos::Autohold => {
                io.uart.write_all(b"menu: autohold\r\n").await?;
                self.autohold_init(io).await?;
                self.state = ExtState::HoldTrack;
            }
            MenuPos::Minmax => {
                io.uart.write_all(b"menu: minmax\r\n").await?;
                self.minmax_init(io).await?;
                self.state = ExtState::MinMax;
            }
            MenuPos::Temp => {
                io.uart.write_all(b"menu: temp\r\n").await?;
                self.temp_init(io).await?;
                self.state = ExtState::Temp;
            }
            MenuPos::PresetSave => {
                let st = io.link.get_status().await?;
                let word = mode_word(st.setup, st.flags);
                if io.cfg.set(Opt::InitMode, word) {
                    io.cfg.persist(Opt::InitMode, io.nv);
                }
                io.link.cmd(b"KM20D1", CmdFlags::empty()).await?;
                self.state = ExtState::Idle;
            }
            MenuPos::PresetLoad => {
                let word = io.cfg.init_mode();
                if word != 0 {
                    io.link.set_mode(word).await?;
                }
                io.link.cmd(b"KM20D1", CmdFlags::empty()).await?;
                self.state = ExtState::Idle;
            }
            MenuPos::Preset | MenuPos::PresetBack => {
                io.link.cmd(b"KM20D1", CmdFlags::empty()).await?;
                self.state = ExtState::Idle;
            }
        }
        Ok(Wakeup::Never)
    }

    /// Leave the instrument alone: masks off, display back, trigger restored
    /// where a mode changed it. Best effort; the user asked us to go away.
    async fn teardown<B, U, N, T>(&mut self, io: &mut ExtIo<'_, B, U, N, T>)
        where B: GpibBus,
              U: AsyncReadExt + AsyncWriteExt + Unpin + Send,
              N: Nonvolatile,
              T: Tone,
    {
        match self.state {
            ExtState::HoldTrack | ExtState::HoldLock => {
                io.tone.stop();
                let _ = io.link.cmd(b"M00D1T1", CmdFlags::empty()).await;
            }
            ExtState::Cont | ExtState::Diode => {
                self.restore_setup(io).await;
                let _ = io.link.cmd(b"M00D1", CmdFlags::empty()).await;
            }
            _ => {
                let _ = io.link.cmd(b"M00D1", CmdFlags::empty()).await;
            }
        }
    }

    /// Show the per-level error trail after giving up on initialization
    async fn show_trail<B, U, N, T>(&mut self, io: &mut ExtIo<'_, B, U, N, T>)
        where B: GpibBus,
              U: AsyncReadExt + AsyncWriteExt + Unpin + Send,
              N: Nonvolatile,
              T: Tone,
    {
        let mut text = String::new();
        let _ = write!(
            text,
            "E:{:02X}{:02X}{:02X}{:02X}",
            self.trail[3], self.trail[2], self.trail[1], self.trail[0]
        );
        let _ = io
            .link
            .display(text.as_bytes(), CmdFlags::HIDE_ANNUNCIATORS)
            .await;
    }
}
