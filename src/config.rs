//! Runtime options and their nonvolatile layout
//!
//! Every option has a single-letter key for the shell's `O` command, a width,
//! a hard maximum, a factory default and a fixed address in the nonvolatile
//! region. Values load once at boot; a stored value that reads back as
//! all-ones or above the maximum is treated as never written and the factory
//! default stands. Writes are in-memory unless the user asks for persistence.

use crate::hal::Nonvolatile;
use crate::transport::EndMode;

/// Identifier of a configuration option
///
/// The discriminants index [`DESCRIPTORS`]; keep the two in the same order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opt
{
    Extension,
    Echo,
    MyAddress,
    DeviceAddress,
    RxEol,
    TxEol,
    Baud,
    InitMode,
    BeepPeriod,
    BeepDuty,
    ContRange,
    ContThreshold,
    ContLatch,
    ContBeepT1,
    ContBeepT2,
    ContBeepP1,
    ContBeepP2,
    ContBeepD1,
    ContBeepD2,
}

pub const OPTION_COUNT: usize = 19;

/// Static description of one option
pub struct Descriptor
{
    pub key: u8,
    /// Two nonvolatile bytes instead of one
    pub wide: bool,
    pub max: u16,
    pub default: u16,
    pub nv_addr: u16,
}

pub const DESCRIPTORS: [Descriptor; OPTION_COUNT] = [
    Descriptor { key: b'X', wide: false, max: 1, default: 0, nv_addr: 10 },
    Descriptor { key: b'I', wide: false, max: 1, default: 1, nv_addr: 9 },
    Descriptor { key: b'C', wide: false, max: 30, default: 21, nv_addr: 8 },
    Descriptor { key: b'D', wide: false, max: 31, default: 23, nv_addr: 7 },
    Descriptor { key: b'R', wide: false, max: 7, default: 4, nv_addr: 5 },
    Descriptor { key: b'T', wide: false, max: 7, default: 4, nv_addr: 4 },
    Descriptor { key: b'B', wide: false, max: 4, default: 0, nv_addr: 3 },
    Descriptor { key: b'M', wide: true, max: 0xfffe, default: 0, nv_addr: 12 },
    Descriptor { key: b'P', wide: true, max: 0xfffe, default: 10000, nv_addr: 1 },
    Descriptor { key: b'Q', wide: false, max: 254, default: 15, nv_addr: 0 },
    Descriptor { key: b'G', wide: false, max: 7, default: 2, nv_addr: 20 },
    Descriptor { key: b'S', wide: true, max: 30000, default: 1000, nv_addr: 24 },
    Descriptor { key: b'A', wide: false, max: 200, default: 0, nv_addr: 28 },
    Descriptor { key: b'J', wide: true, max: 0xfffe, default: 1000, nv_addr: 32 },
    Descriptor { key: b'K', wide: true, max: 0xfffe, default: 1000, nv_addr: 36 },
    Descriptor { key: b'U', wide: true, max: 0xfffe, default: 10000, nv_addr: 48 },
    Descriptor { key: b'V', wide: true, max: 0xfffe, default: 10000, nv_addr: 52 },
    Descriptor { key: b'E', wide: false, max: 254, default: 15, nv_addr: 40 },
    Descriptor { key: b'F', wide: false, max: 254, default: 15, nv_addr: 44 },
];

/// Live option values
pub struct Config
{
    values: [u16; OPTION_COUNT],
}

impl Config
{
    /// Factory defaults; `interactive` selects whether the serial side echoes
    pub fn defaults(interactive: bool) -> Self
    {
        let mut values = [0u16; OPTION_COUNT];
        for (i, d) in DESCRIPTORS.iter().enumerate() {
            values[i] = d.default;
        }
        values[Opt::Echo as usize] = interactive as u16;
        Self { values: values }
    }

    /// Load from nonvolatile storage, falling back per option
    pub fn load<N>(nv: &N) -> Self
        where N: Nonvolatile
    {
        let mut cfg = Self::defaults(true);
        for (i, d) in DESCRIPTORS.iter().enumerate() {
            if d.nv_addr + d.wide as u16 >= nv.size() {
                continue;
            }
            let stored = if d.wide {
                nv.read(d.nv_addr) as u16 | (nv.read(d.nv_addr + 1) as u16) << 8
            }
            else {
                nv.read(d.nv_addr) as u16
            };
            let absent = if d.wide { stored == 0xffff } else { stored == 0xff };
            if !absent && stored <= d.max {
                cfg.values[i] = stored;
            }
        }
        cfg
    }

    /// Reapply factory defaults in place (`O0` / `O1`)
    pub fn apply_defaults(&mut self, interactive: bool)
    {
        *self = Self::defaults(interactive);
    }

    pub fn get(&self, opt: Opt) -> u16
    {
        self.values[opt as usize]
    }

    /// Set if the value passes the option's maximum; the live value is left
    /// untouched otherwise
    pub fn set(&mut self, opt: Opt, value: u16) -> bool
    {
        if value > DESCRIPTORS[opt as usize].max {
            return false;
        }
        self.values[opt as usize] = value;
        true
    }

    /// Write the live value to its nonvolatile slot
    pub fn persist<N>(&self, opt: Opt, nv: &mut N)
        where N: Nonvolatile
    {
        let d = &DESCRIPTORS[opt as usize];
        if d.nv_addr + d.wide as u16 >= nv.size() {
            return;
        }
        let v = self.values[opt as usize];
        nv.write(d.nv_addr, v as u8);
        if d.wide {
            nv.write(d.nv_addr + 1, (v >> 8) as u8);
        }
    }

    pub fn by_key(key: u8) -> Option<Opt>
    {
        const ORDER: [Opt; OPTION_COUNT] = [
            Opt::Extension,
            Opt::Echo,
            Opt::MyAddress,
            Opt::DeviceAddress,
            Opt::RxEol,
            Opt::TxEol,
            Opt::Baud,
            Opt::InitMode,
            Opt::BeepPeriod,
            Opt::BeepDuty,
            Opt::ContRange,
            Opt::ContThreshold,
            Opt::ContLatch,
            Opt::ContBeepT1,
            Opt::ContBeepT2,
            Opt::ContBeepP1,
            Opt::ContBeepP2,
            Opt::ContBeepD1,
            Opt::ContBeepD2,
        ];
        DESCRIPTORS
            .iter()
            .position(|d| d.key == key)
            .map(|i| ORDER[i])
    }

    pub fn ext_enabled(&self) -> bool
    {
        self.get(Opt::Extension) != 0
    }

    pub fn echo(&self) -> bool
    {
        self.get(Opt::Echo) != 0
    }

    pub fn my_addr(&self) -> u8
    {
        self.get(Opt::MyAddress) as u8
    }

    pub fn device_addr(&self) -> u8
    {
        self.get(Opt::DeviceAddress) as u8
    }

    pub fn rx_eol(&self) -> EndMode
    {
        EndMode::from_bits_retain(self.get(Opt::RxEol) as u8)
    }

    pub fn tx_eol(&self) -> EndMode
    {
        EndMode::from_bits_retain(self.get(Opt::TxEol) as u8)
    }

    pub fn init_mode(&self) -> u16
    {
        self.get(Opt::InitMode)
    }

    pub fn beep(&self) -> (u16, u8)
    {
        (self.get(Opt::BeepPeriod), self.get(Opt::BeepDuty) as u8)
    }

    pub fn cont_range(&self) -> u8
    {
        self.get(Opt::ContRange) as u8
    }

    pub fn cont_threshold(&self) -> u16
    {
        self.get(Opt::ContThreshold)
    }

    pub fn cont_latch(&self) -> u8
    {
        self.get(Opt::ContLatch) as u8
    }

    /// The two continuity tone break-points: (reading, period, duty) each
    pub fn cont_breakpoints(&self) -> ((u16, u16, u8), (u16, u16, u8))
    {
        (
            (
                self.get(Opt::ContBeepT1),
                self.get(Opt::ContBeepP1),
                self.get(Opt::ContBeepD1) as u8,
            ),
            (
                self.get(Opt::ContBeepT2),
                self.get(Opt::ContBeepP2),
                self.get(Opt::ContBeepD2) as u8,
            ),
        )
    }
}

/// Serial bit rate for a stored baud code
pub fn baud_rate(code: u8) -> u32
{
    match code {
        0 => 115_200,
        1 => 230_400,
        2 => 500_000,
        3 => 1_000_000,
        _ => 2_000_000,
    }
}
