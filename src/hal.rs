//! Interfaces to the peripherals surrounding the bridge core
//!
//! The core never touches hardware directly. The embedding supplies a GPIB pin
//! interface (see [`bus`](crate::bus)), an async byte stream for the serial
//! side, and the three small peripherals defined here. Firmware builds
//! implement these against timers and memory-mapped registers; the test suite
//! implements them in memory.

/// Flat byte-addressed nonvolatile region
///
/// Unwritten bytes must read back as `0xFF`. Reads and writes beyond
/// [`Nonvolatile::size`] are clipped by the caller, never performed blind, so
/// implementations may index directly.
pub trait Nonvolatile
{
    /// Total number of bytes in the region
    fn size(&self) -> u16;

    fn read(&self, addr: u16) -> u8;

    fn write(&mut self, addr: u16, value: u8);
}

/// PWM tone generator for the continuity buzzer and the auto-hold beep
///
/// `period` and `duty` are raw timer reload values, stored verbatim in the
/// configuration; a `period` of zero selects a DC drive (piezo with its own
/// oscillator). Implementations must be non-blocking.
pub trait Tone
{
    fn start(&mut self, period: u16, duty: u8);

    fn stop(&mut self);
}

/// Blink rate of the status LED
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedMode
{
    Off,
    /// 1 Hz, used while plotter mode holds the bus
    Slow,
    /// 5 Hz, used while the controller is parked as a listener
    Fast,
}

/// Status LED driver; pacing happens in the embedding's timer context
pub trait StatusLed
{
    fn set(&mut self, mode: LedMode);
}
