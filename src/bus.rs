//! Signal-level view of the IEEE-488 bus
//!
//! Every line is open-collector: "asserted" means driven low, "released" means
//! high impedance with the bus pull-up winning. The trait speaks in those
//! logical terms so implementations can map them onto direction registers
//! (drive low by switching the pin to output-low, release by switching it back
//! to input) without the upper layers caring.

/// Offset added to a primary address to form a listen address (MLA)
pub const LISTEN_ADDR_OFFSET: u8 = 32;
/// Offset added to a primary address to form a talk address (MTA)
pub const TALK_ADDR_OFFSET: u8 = 64;

/// Unlisten, `'?'`
pub const UNL: u8 = LISTEN_ADDR_OFFSET + 31;
/// Untalk, `'_'`
pub const UNT: u8 = TALK_ADDR_OFFSET + 31;
/// Serial poll enable
pub const SPE: u8 = 0x18;
/// Serial poll disable
pub const SPD: u8 = 0x19;

/// Pin-level access to the GPIB lines
///
/// Implementations only move pins; all sequencing, settle times and handshake
/// budgets live in [`transport`](crate::transport) and above. Reads report the
/// logical state of the wire (`true` = asserted/low), including our own drive.
pub trait GpibBus
{
    fn set_atn(&mut self, asserted: bool);

    fn set_ren(&mut self, asserted: bool);

    fn set_ifc(&mut self, asserted: bool);

    fn set_eoi(&mut self, asserted: bool);

    fn set_dav(&mut self, asserted: bool);

    fn set_nrfd(&mut self, asserted: bool);

    fn set_ndac(&mut self, asserted: bool);

    fn dav(&self) -> bool;

    fn nrfd(&self) -> bool;

    fn ndac(&self) -> bool;

    fn srq(&self) -> bool;

    fn eoi(&self) -> bool;

    /// Whether we are currently driving REN
    fn ren(&self) -> bool;

    /// Configure for sourcing bytes: data lines and DAV/EOI are ours,
    /// NRFD/NDAC are released and read back from the listeners
    fn talk_config(&mut self);

    /// Configure for accepting bytes: data lines and DAV are inputs,
    /// NRFD/NDAC are ours and start out asserted
    fn listen_config(&mut self);

    /// Drive a byte onto DIO1..8 (valid only in talk configuration)
    fn data_put(&mut self, byte: u8);

    /// Sample DIO1..8 (valid only in listen configuration)
    fn data_get(&self) -> u8;
}
