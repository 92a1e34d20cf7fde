//! Controller session on top of the byte transport
//!
//! The controller is always controller-in-charge; the session tracks which
//! way the last addressing left the bus so repeated operations against the
//! same device skip the ATN sequence. Every fallible operation tears the bus
//! down to a known state (ATN and REN released, no talker) before reporting,
//! so a caller can always retry from scratch.

use std::{ error::Error, fmt, time::Duration };
use tokio::time::sleep;

use crate::bus::{ self, GpibBus };
use crate::transport::{ self, EndMode, Termination };

/// Settle delay after asserting ATN (IEEE-488 T7, 500 ns minimum; the wide
/// margin covers acceptors that watch the line from firmware rather than
/// hardware)
const ATN_SETTLE: Duration = Duration::from_millis(1);

/// Where the last operation left the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase
{
    /// Nobody addressed
    Idle,
    /// We are addressed to listen, the device talks
    Listener,
    /// We are addressed to talk, the device listens
    Talker,
}

impl Phase
{
    /// The digit reported by the shell's `S` command
    pub fn digit(&self) -> u8
    {
        match self {
            Phase::Idle => b'0',
            Phase::Listener => b'1',
            Phase::Talker => b'2',
        }
    }
}

/// Failure of a session or protocol operation, with the code that feeds the
/// error trail display
#[derive(Debug)]
pub enum LinkError
{
    /// A bus command sequence under ATN was not accepted
    Command { sent: usize },
    /// Device-dependent bytes were not accepted
    Data { sent: usize },
    /// A receive ended some way other than the expected terminator
    Receive(Termination),
    /// The serial poll produced no status byte
    Poll,
    /// A `B` query returned fewer than five bytes
    ShortStatus { got: usize },
    /// A reading arrived but did not parse
    BadReading,
    /// Display text wider than the 12-cell field
    DisplayLength { cells: usize },
}

impl LinkError
{
    /// One-byte code for the error trail
    pub fn code(&self) -> u8
    {
        match self {
            LinkError::Command { .. } => 0x21,
            LinkError::Data { .. } => 0x11,
            LinkError::Receive(t) if t.timed_out() => 0x12,
            LinkError::Receive(_) => 0x13,
            LinkError::Poll => 0x22,
            LinkError::ShortStatus { .. } => 0x31,
            LinkError::BadReading => 0x32,
            LinkError::DisplayLength { .. } => 0x33,
        }
    }

    /// Nesting level for the error trail: 0 = transport, 1 = session,
    /// 2 = protocol
    pub fn level(&self) -> usize
    {
        match self {
            LinkError::Data { .. } | LinkError::Receive(_) => 0,
            LinkError::Command { .. } | LinkError::Poll => 1,
            LinkError::ShortStatus { .. }
            | LinkError::BadReading
            | LinkError::DisplayLength { .. } => 2,
        }
    }
}

impl fmt::Display for LinkError
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            LinkError::Command { sent } => write!(f, "bus command stalled after {} bytes", sent),
            LinkError::Data { sent } => write!(f, "data transfer stalled after {} bytes", sent),
            LinkError::Receive(t) => write!(f, "receive ended with {:?}", t),
            LinkError::Poll => f.write_str("serial poll returned no status byte"),
            LinkError::ShortStatus { got } => write!(f, "status reply of {} bytes", got),
            LinkError::BadReading => f.write_str("unparseable reading"),
            LinkError::DisplayLength { cells } => {
                write!(f, "display text of {} cells does not fit", cells)
            }
        }
    }
}

impl Error for LinkError {}

/// The controller's half of the bus, plus the addressing bookkeeping
pub struct Link<B>
{
    pub(crate) bus: B,
    /// Current session phase; public so the shell can track raw commands
    pub phase: Phase,
    /// Our primary address
    pub my_addr: u8,
    /// The instrument's primary address
    pub device_addr: u8,
}

impl<B> Link<B>
    where B: GpibBus
{
    pub fn new(mut bus: B, my_addr: u8, device_addr: u8) -> Self
    {
        bus.talk_config();
        Self {
            bus: bus,
            phase: Phase::Idle,
            my_addr: my_addr,
            device_addr: device_addr,
        }
    }

    pub fn srq(&self) -> bool
    {
        self.bus.srq()
    }

    pub fn ren(&self) -> bool
    {
        self.bus.ren()
    }

    pub fn set_ren(&mut self, asserted: bool)
    {
        self.bus.set_ren(asserted);
    }

    /// Pulse IFC for a millisecond, clearing every device's bus state
    pub async fn pulse_ifc(&mut self)
    {
        self.bus.set_ifc(true);
        sleep(Duration::from_millis(1)).await;
        self.bus.set_ifc(false);
    }

    /// Whether some acceptor is holding the handshake lines; a quiescent bus
    /// means nobody is listening at all
    pub fn acceptor_present(&self) -> bool
    {
        self.bus.nrfd() || self.bus.ndac()
    }

    /// Raw switch to talk configuration (plotter mode, listener aborts)
    pub fn force_talk(&mut self)
    {
        self.bus.talk_config();
    }

    /// Raw switch to listen configuration without addressing anyone
    pub fn force_listen(&mut self)
    {
        self.bus.listen_config();
    }

    /// Send bytes as bus commands, ATN asserted around them
    ///
    /// ATN is released afterwards in both outcomes; a failed command sequence
    /// still reports through the normal teardown path.
    pub(crate) async fn command_bytes(&mut self, cmd: &[u8]) -> Result<(), LinkError>
    {
        self.bus.set_atn(true);
        sleep(ATN_SETTLE).await;
        let sent = transport::transmit(&mut self.bus, cmd, EndMode::empty()).await;
        self.bus.set_atn(false);

        if sent == cmd.len() {
            Ok(())
        }
        else {
            Err(LinkError::Command { sent: sent })
        }
    }

    /// Release everything a failed operation may have left asserted
    pub(crate) fn teardown(&mut self)
    {
        self.bus.talk_config();
        self.bus.set_atn(false);
        self.bus.set_ren(false);
        self.phase = Phase::Idle;
    }

    /// Raw command transmission for the shell's `C`/`THC`
    ///
    /// The caller has already scanned the bytes and updated [`Link::phase`];
    /// this sends them under ATN and re-enters listen configuration when the
    /// scan said we stay a listener. Returns the accepted byte count.
    pub async fn send_command(&mut self, cmd: &[u8]) -> usize
    {
        self.bus.talk_config();
        self.bus.set_atn(true);
        sleep(ATN_SETTLE).await;
        let sent = transport::transmit(&mut self.bus, cmd, EndMode::empty()).await;
        self.bus.set_atn(false);

        if self.phase == Phase::Listener {
            self.bus.listen_config();
        }
        sent
    }

    /// Raw data transmission for the shell's `D`/`THD`/`TBD`
    pub async fn send_data(&mut self, data: &[u8], end: EndMode) -> usize
    {
        transport::transmit(&mut self.bus, data, end).await
    }

    /// Raw reception for the shell; the bus must be in listen phase
    pub async fn receive_data(&mut self, buf: &mut [u8], stop: EndMode) -> (usize, Termination)
    {
        transport::receive(&mut self.bus, buf, stop).await
    }

    /// Update the scanned phase from raw command bytes the host asked us to
    /// send: our own talk address or UNL drops the listener role, our listen
    /// address makes us a listener
    pub fn scan_command(&mut self, cmd: &[u8]) -> Phase
    {
        for &b in cmd {
            if b == bus::UNL || b == bus::TALK_ADDR_OFFSET + self.my_addr {
                self.phase = Phase::Idle;
            }
            else if b == bus::LISTEN_ADDR_OFFSET + self.my_addr {
                self.phase = Phase::Listener;
            }
        }
        self.phase
    }

    /// Address the instrument to listen and us to talk
    pub(crate) async fn address_device_listener(&mut self) -> Result<(), LinkError>
    {
        if self.phase == Phase::Listener {
            self.bus.talk_config();
        }
        let cmd = [
            bus::LISTEN_ADDR_OFFSET + self.device_addr,
            bus::TALK_ADDR_OFFSET + self.my_addr,
        ];
        self.command_bytes(&cmd).await
    }

    /// Address the instrument to talk and us to listen
    pub(crate) async fn address_device_talker(&mut self) -> Result<(), LinkError>
    {
        let cmd = [
            bus::LISTEN_ADDR_OFFSET + self.my_addr,
            bus::TALK_ADDR_OFFSET + self.device_addr,
        ];
        self.command_bytes(&cmd).await?;
        self.bus.listen_config();
        Ok(())
    }

    /// Serial poll the instrument: one status byte, SRQ drops as a side
    /// effect on the instrument's end
    pub async fn serial_poll(&mut self) -> Result<crate::status::StatusBits, LinkError>
    {
        if self.phase == Phase::Listener {
            self.bus.talk_config();
        }
        self.phase = Phase::Idle;

        let result = self.serial_poll_inner().await;
        if result.is_err() {
            self.bus.talk_config();
            self.bus.set_atn(false);
        }
        result
    }

    async fn serial_poll_inner(&mut self) -> Result<crate::status::StatusBits, LinkError>
    {
        let enable = [
            bus::SPE,
            bus::TALK_ADDR_OFFSET + self.device_addr,
            bus::LISTEN_ADDR_OFFSET + self.my_addr,
        ];
        self.command_bytes(&enable).await?;

        self.bus.listen_config();
        let mut sb = [0u8; 1];
        let (n, _) = transport::receive(&mut self.bus, &mut sb, EndMode::empty()).await;
        if n != 1 {
            return Err(LinkError::Poll);
        }

        self.bus.talk_config();
        let disable = [bus::SPD, bus::UNT];
        self.command_bytes(&disable).await?;

        Ok(crate::status::StatusBits::from_bits_retain(sb[0]))
    }
}
