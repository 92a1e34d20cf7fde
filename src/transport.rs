//! Byte-level GPIB transport
//!
//! One talker, any number of acceptors, three handshake wires. Transmission
//! and reception are fully synchronous from the caller's point of view: each
//! handshake edge is awaited with a polled wait under a wall-clock budget, and
//! expiry surfaces as a partial byte count rather than an error so callers can
//! decide what a short transfer means to them.

use bitflags::bitflags;
use std::time::Duration;
use tokio::time::{ sleep, Instant };

use crate::bus::GpibBus;

bitflags! {
    /// End-of-message set for a transfer
    ///
    /// On transmit, `CR`/`LF` are appended to the payload (in that order when
    /// both are present) and `EOI` is asserted alongside the final byte. On
    /// receive, each selected condition stops the transfer when observed.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EndMode: u8
    {
        const CR  = 1;
        const LF  = 2;
        const EOI = 4;
    }
}

bitflags! {
    /// Why a receive stopped
    ///
    /// The end-of-message bits mirror [`EndMode`]; `FULL` and `TIMEOUT` are
    /// synthetic. More than one end-of-message bit can be set at once (a CR
    /// that also carried EOI, for instance).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Termination: u8
    {
        const CR      = 1;
        const LF      = 2;
        const EOI     = 4;
        /// Destination filled up without any requested stop condition
        const FULL    = 8;
        /// A handshake wait ran out; the byte count is partial
        const TIMEOUT = 16;
    }
}

impl Termination
{
    pub fn timed_out(&self) -> bool
    {
        self.contains(Termination::TIMEOUT)
    }
}

/// Budget for each byte's pair of handshake waits
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(200);

/// T1 data settle delay before asserting DAV
const T1_SETTLE: Duration = Duration::from_micros(2);

/// Granularity of the polled handshake waits
const POLL: Duration = Duration::from_micros(20);

/// Number of wire bytes for a payload of `len` under the given end mode
pub fn wire_len(len: usize, end: EndMode) -> usize
{
    len + (end.contains(EndMode::CR) as usize) + (end.contains(EndMode::LF) as usize)
}

/// The byte that goes on the wire at position `i` of `total`, with CR/LF
/// injection at the tail per the end mode
fn wire_byte(buf: &[u8], end: EndMode, i: usize, total: usize) -> u8
{
    let crlf = end & (EndMode::CR | EndMode::LF);

    if crlf == EndMode::CR | EndMode::LF && i == total - 2 {
        13
    }
    else if crlf == EndMode::CR && i == total - 1 {
        13
    }
    else if end.contains(EndMode::LF) && i == total - 1 {
        10
    }
    else {
        buf[i]
    }
}

/// Send `buf` to whoever is listening
///
/// The bus must already be in talk configuration. Returns the number of wire
/// bytes acknowledged; compare against [`wire_len`] to distinguish a complete
/// transfer from one a listener abandoned. A quiescent bus (no acceptor
/// holding NRFD or NDAC) fails immediately with a count of zero.
pub async fn transmit<B>(bus: &mut B, buf: &[u8], end: EndMode) -> usize
    where B: GpibBus
{
    if !bus.nrfd() && !bus.ndac() {
        return 0;
    }

    let total = wire_len(buf.len(), end);

    for i in 0..total {
        bus.data_put(wire_byte(buf, end, i, total));
        if i == total - 1 && end.contains(EndMode::EOI) {
            bus.set_eoi(true);
        }

        sleep(T1_SETTLE).await;

        // one budget covers both waits of this byte
        let deadline = Instant::now() + HANDSHAKE_TIMEOUT;

        while bus.nrfd() {
            if Instant::now() >= deadline {
                bus.set_eoi(false);
                return i;
            }
            sleep(POLL).await;
        }

        bus.set_dav(true);

        while bus.ndac() {
            if Instant::now() >= deadline {
                bus.set_eoi(false);
                bus.set_dav(false);
                return i;
            }
            sleep(POLL).await;
        }

        bus.set_dav(false);
    }

    bus.set_eoi(false);
    total
}

/// [`transmit`], reduced to "did every byte make it"
pub async fn transmit_all<B>(bus: &mut B, buf: &[u8], end: EndMode) -> bool
    where B: GpibBus
{
    transmit(bus, buf, end).await == wire_len(buf.len(), end)
}

/// Receive into `buf` until a requested stop condition, a full buffer, or a
/// handshake timeout
///
/// The bus must already be in listen configuration. EOI is sampled while the
/// talker still holds DAV, so it is attributed to the byte it arrived with.
pub async fn receive<B>(bus: &mut B, buf: &mut [u8], stop: EndMode) -> (usize, Termination)
    where B: GpibBus
{
    let mut index = 0;
    let mut seen = Termination::empty();

    loop {
        bus.set_nrfd(false); // ready for the next byte

        let deadline = Instant::now() + HANDSHAKE_TIMEOUT;

        while !bus.dav() {
            if Instant::now() >= deadline {
                bus.set_nrfd(true);
                return (index, Termination::TIMEOUT);
            }
            sleep(POLL).await;
        }

        bus.set_nrfd(true);
        if bus.eoi() && stop.contains(EndMode::EOI) {
            seen |= Termination::EOI;
        }

        let c = bus.data_get();
        bus.set_ndac(false); // byte accepted

        buf[index] = c;
        index += 1;
        if c == 10 && stop.contains(EndMode::LF) {
            seen |= Termination::LF;
        }
        if c == 13 && stop.contains(EndMode::CR) {
            seen |= Termination::CR;
        }

        while bus.dav() {
            if Instant::now() >= deadline {
                bus.set_ndac(true);
                return (index, Termination::TIMEOUT);
            }
            sleep(POLL).await;
        }

        bus.set_ndac(true);

        if index == buf.len() || !seen.is_empty() {
            break;
        }
    }

    if seen.is_empty() {
        seen = Termination::FULL;
    }
    (index, seen)
}
