//! Bridge and extension controller core for the HP 3478A bench multimeter
//!
//! Two jobs in one firmware: a line-oriented GPIB <-> serial converter for
//! arbitrary bus traffic, and an "extension" layer that watches the 3478A's
//! service requests to bolt new measurement modes onto a meter that predates
//! most of its users. The instrument's own SRQ key opens a menu on its
//! display; continuity with a buzzer, extended resistance, diode test, PT1000
//! temperature, relative, auto-hold and min/max run from there, all driven
//! through the same bit-banged IEEE-488 port the converter half uses.
//!
//! This crate is the hardware-independent core. The GPIB port enters through
//! the [`bus::GpibBus`] pin trait, the serial side through any async byte
//! stream, and the remaining peripherals (nonvolatile option storage, tone
//! generator, status LED) through the traits in [`hal`]. An embedding
//! provides those five things and calls [`Bridge::run`]; the test suite
//! provides them in memory, with a behavioral meter model on the other end
//! of the bus.

pub mod bridge;
pub mod bus;
pub mod config;
pub mod device;
pub mod edit;
pub mod ext;
pub mod hal;
pub mod reading;
pub mod session;
pub mod shell;
pub mod status;
pub mod transport;

pub use bridge::Bridge;
pub use bus::GpibBus;
pub use config::{ baud_rate, Config, Opt };
pub use hal::{ LedMode, Nonvolatile, StatusLed, Tone };
pub use reading::Reading;
pub use session::{ Link, LinkError, Phase };
pub use status::{ Digits, Function, InstrumentStatus, MeterSetup, ModeFlags, StatusBits };
pub use transport::{ EndMode, Termination };
