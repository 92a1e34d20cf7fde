//! The instrument's five status bytes and the commands that change them
//!
//! A `B` query returns five bytes: measurement setup (function, range,
//! digits), mode flags, the SRQ mask, the latched status byte, and a reserved
//! byte. The first two together describe everything the extension machine has
//! to save and restore around a mode, so they also pack into the 16-bit "mode
//! word" the preset feature persists.

use bitflags::bitflags;
use std::fmt::Write;

/// Measurement function, as encoded in bits 5..7 of the setup byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function
{
    Dcv,
    Acv,
    Ohm2W,
    Ohm4W,
    Dca,
    Aca,
    /// Extended ohms (30 MOhm source through the 10 MOhm input divider)
    OhmExt,
}

impl Function
{
    pub fn code(&self) -> u8
    {
        match self {
            Function::Dcv => 1,
            Function::Acv => 2,
            Function::Ohm2W => 3,
            Function::Ohm4W => 4,
            Function::Dca => 5,
            Function::Aca => 6,
            Function::OhmExt => 7,
        }
    }

    fn from_code(code: u8) -> Function
    {
        match code {
            1 => Function::Dcv,
            2 => Function::Acv,
            3 => Function::Ohm2W,
            4 => Function::Ohm4W,
            5 => Function::Dca,
            6 => Function::Aca,
            _ => Function::OhmExt,
        }
    }
}

/// Display resolution, bits 0..1 of the setup byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Digits
{
    FiveAndHalf,
    FourAndHalf,
    ThreeAndHalf,
}

impl Digits
{
    fn code(&self) -> u8
    {
        match self {
            Digits::FiveAndHalf => 1,
            Digits::FourAndHalf => 2,
            Digits::ThreeAndHalf => 3,
        }
    }

    /// The digit sent with an `N` command
    pub fn command_digit(&self) -> u8
    {
        match self {
            Digits::FiveAndHalf => b'5',
            Digits::FourAndHalf => b'4',
            Digits::ThreeAndHalf => b'3',
        }
    }
}

/// The packed function/range/digits setup byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeterSetup(u8);

const DIGITS_MASK: u8 = 3 << 0;
const RANGE_MASK: u8 = 7 << 2;
const FUNCTION_MASK: u8 = 7 << 5;

impl MeterSetup
{
    pub fn new(function: Function, range: u8, digits: Digits) -> Self
    {
        Self(function.code() << 5 | (range & 7) << 2 | digits.code())
    }

    pub fn from_byte(b: u8) -> Self
    {
        Self(b)
    }

    pub fn byte(&self) -> u8
    {
        self.0
    }

    pub fn function(&self) -> Function
    {
        Function::from_code(self.0 >> 5)
    }

    /// Range code 1..=7; meaning depends on the function
    pub fn range(&self) -> u8
    {
        (self.0 & RANGE_MASK) >> 2
    }

    pub fn digits(&self) -> Digits
    {
        match self.0 & DIGITS_MASK {
            1 => Digits::FiveAndHalf,
            2 => Digits::FourAndHalf,
            _ => Digits::ThreeAndHalf,
        }
    }

    /// Field mask for change detection: function and digits always, range
    /// only when the caller says it is pinned
    pub fn diff_mask(include_range: bool) -> u8
    {
        if include_range {
            FUNCTION_MASK | DIGITS_MASK | RANGE_MASK
        }
        else {
            FUNCTION_MASK | DIGITS_MASK
        }
    }
}

bitflags! {
    /// Mode flags, the second status byte
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ModeFlags: u8
    {
        const INT_TRIGGER = 1 << 0;
        const AUTORANGE   = 1 << 1;
        const AUTOZERO    = 1 << 2;
        const FIFTY_HZ    = 1 << 3;
        const FRONT_INPUT = 1 << 4;
        const CAL_ENABLED = 1 << 5;
        const EXT_TRIGGER = 1 << 6;
    }
}

bitflags! {
    /// Status byte / SRQ mask bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StatusBits: u8
    {
        /// A reading is ready to be fetched
        const DREADY = 1 << 0;
        /// Syntax error in the last command
        const SYNERR = 1 << 2;
        /// Internal hardware error
        const INTERR = 1 << 3;
        /// The front-panel SRQ key was pressed
        const FRPSRQ = 1 << 4;
        /// Calibration failed
        const INVCAL = 1 << 5;
        /// Service requested (RQS, set while SRQ is pending)
        const SRQMSG = 1 << 6;
        /// Power-on SRQ: the instrument was reset since we last looked
        const PWRSRQ = 1 << 7;
    }
}

/// The five bytes returned by `B`
#[derive(Debug, Clone, Copy)]
pub struct InstrumentStatus
{
    pub setup: MeterSetup,
    pub flags: ModeFlags,
    pub srq_mask: u8,
    pub status: StatusBits,
    pub error: u8,
}

impl InstrumentStatus
{
    pub fn from_bytes(b: &[u8; 5]) -> Self
    {
        Self {
            setup: MeterSetup::from_byte(b[0]),
            flags: ModeFlags::from_bits_retain(b[1]),
            srq_mask: b[2],
            status: StatusBits::from_bits_retain(b[3]),
            error: b[4],
        }
    }
}

/// Pack setup and flags into the persisted mode word
pub fn mode_word(setup: MeterSetup, flags: ModeFlags) -> u16
{
    setup.byte() as u16 | (flags.bits() as u16) << 8
}

/// Inverse of [`mode_word`]
pub fn unpack_mode_word(word: u16) -> (MeterSetup, ModeFlags)
{
    (
        MeterSetup::from_byte(word as u8),
        ModeFlags::from_bits_retain((word >> 8) as u8),
    )
}

/// The `R` command digit for a range code under the given function
///
/// The instrument numbers its range commands by decade, so the same range
/// field means a different command digit per function: current offers only
/// -1 and 0, AC volts spans -1..3, DC volts -2..2 and resistance 1..7.
fn range_command(function: Function, range: u8) -> i8
{
    match function {
        Function::Dcv => range as i8 - 3,
        Function::Acv | Function::Dca | Function::Aca => range as i8 - 2,
        Function::Ohm2W | Function::Ohm4W | Function::OhmExt => range as i8,
    }
}

/// Build the `R.. N. F. Z. T.` text that reproduces a saved setup
pub fn mode_command(setup: MeterSetup, flags: ModeFlags) -> String
{
    let mut cmd = String::with_capacity(12);

    if flags.contains(ModeFlags::AUTORANGE) {
        cmd.push_str("RA");
    }
    else {
        let _ = write!(cmd, "R{}", range_command(setup.function(), setup.range()));
    }
    cmd.push('N');
    cmd.push(setup.digits().command_digit() as char);
    let _ = write!(cmd, "F{}", setup.function().code());
    cmd.push_str(if flags.contains(ModeFlags::AUTOZERO) { "Z1" } else { "Z0" });
    cmd.push_str(if flags.contains(ModeFlags::INT_TRIGGER) {
        "T1"
    }
    else if flags.contains(ModeFlags::EXT_TRIGGER) {
        "T2"
    }
    else {
        "T4"
    });

    cmd
}

/// Build the short `R. N. Z.` restore used when leaving a forced-range mode
///
/// The function was never changed, so only range, digits and autozero go
/// back; autorange restores as `RA`.
pub fn restore_command(setup: MeterSetup, flags: ModeFlags) -> [u8; 6]
{
    let range = if flags.contains(ModeFlags::AUTORANGE) {
        b'A'
    }
    else {
        b'0' + setup.range()
    };

    [
        b'R',
        range,
        b'N',
        setup.digits().command_digit(),
        b'Z',
        if flags.contains(ModeFlags::AUTOZERO) { b'1' } else { b'0' },
    ]
}
