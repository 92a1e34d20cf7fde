//! In-memory test rig: a wired-OR GPIB bus, a behavioral HP 3478A, and RAM
//! implementations of the peripheral traits
//!
//! The bus carries two drivers per line (controller and meter); a line reads
//! asserted when either end drives it, matching the open-collector wire. The
//! meter runs as its own task and speaks real acceptor/source handshakes, so
//! the code under test exercises the same byte-level protocol it would
//! against hardware. Tests run under paused time; every polling loop below
//! sleeps, which keeps the virtual clock moving deterministically.

#![allow(dead_code)]

use std::sync::{ Arc, Mutex };
use std::time::Duration;
use tokio::io::{ AsyncReadExt, DuplexStream };
use tokio::time::{ sleep, timeout, Instant };

use hp3478_bridge::{ Bridge, GpibBus, LedMode, Nonvolatile, StatusLed, Tone };

// ---------------------------------------------------------------------------
// bus wiring

#[derive(Default, Clone, Copy)]
struct Drive
{
    atn: bool,
    ren: bool,
    ifc: bool,
    eoi: bool,
    dav: bool,
    nrfd: bool,
    ndac: bool,
    srq: bool,
    data: u8,
    data_driven: bool,
}

#[derive(Default)]
struct Wires
{
    controller: Drive,
    meter: Drive,
}

impl Wires
{
    fn atn(&self) -> bool
    {
        self.controller.atn || self.meter.atn
    }

    fn ren(&self) -> bool
    {
        self.controller.ren || self.meter.ren
    }

    fn ifc(&self) -> bool
    {
        self.controller.ifc || self.meter.ifc
    }

    fn eoi(&self) -> bool
    {
        self.controller.eoi || self.meter.eoi
    }

    fn dav(&self) -> bool
    {
        self.controller.dav || self.meter.dav
    }

    fn nrfd(&self) -> bool
    {
        self.controller.nrfd || self.meter.nrfd
    }

    fn ndac(&self) -> bool
    {
        self.controller.ndac || self.meter.ndac
    }

    fn srq(&self) -> bool
    {
        self.controller.srq || self.meter.srq
    }

    fn data(&self) -> u8
    {
        let mut d = 0;
        if self.controller.data_driven {
            d |= self.controller.data;
        }
        if self.meter.data_driven {
            d |= self.meter.data;
        }
        d
    }
}

#[derive(Clone)]
pub struct SharedBus(Arc<Mutex<Wires>>);

impl SharedBus
{
    pub fn new() -> Self
    {
        SharedBus(Arc::new(Mutex::new(Wires::default())))
    }
}

/// The controller's end of the shared bus
pub struct SimBus
{
    shared: SharedBus,
}

impl SimBus
{
    pub fn new(shared: &SharedBus) -> Self
    {
        Self { shared: shared.clone() }
    }

    fn wires(&self) -> std::sync::MutexGuard<'_, Wires>
    {
        self.shared.0.lock().unwrap()
    }
}

impl GpibBus for SimBus
{
    fn set_atn(&mut self, asserted: bool)
    {
        self.wires().controller.atn = asserted;
    }

    fn set_ren(&mut self, asserted: bool)
    {
        self.wires().controller.ren = asserted;
    }

    fn set_ifc(&mut self, asserted: bool)
    {
        self.wires().controller.ifc = asserted;
    }

    fn set_eoi(&mut self, asserted: bool)
    {
        self.wires().controller.eoi = asserted;
    }

    fn set_dav(&mut self, asserted: bool)
    {
        self.wires().controller.dav = asserted;
    }

    fn set_nrfd(&mut self, asserted: bool)
    {
        self.wires().controller.nrfd = asserted;
    }

    fn set_ndac(&mut self, asserted: bool)
    {
        self.wires().controller.ndac = asserted;
    }

    fn dav(&self) -> bool
    {
        self.wires().dav()
    }

    fn nrfd(&self) -> bool
    {
        self.wires().nrfd()
    }

    fn ndac(&self) -> bool
    {
        self.wires().ndac()
    }

    fn srq(&self) -> bool
    {
        self.wires().srq()
    }

    fn eoi(&self) -> bool
    {
        self.wires().eoi()
    }

    fn ren(&self) -> bool
    {
        self.wires().controller.ren
    }

    fn talk_config(&mut self)
    {
        let mut w = self.wires();
        w.controller.nrfd = false;
        w.controller.ndac = false;
        w.controller.data_driven = false;
    }

    fn listen_config(&mut self)
    {
        let mut w = self.wires();
        w.controller.data_driven = false;
        w.controller.dav = false;
        w.controller.nrfd = true;
        w.controller.ndac = true;
    }

    fn data_put(&mut self, byte: u8)
    {
        let mut w = self.wires();
        w.controller.data = byte;
        w.controller.data_driven = true;
    }

    fn data_get(&self) -> u8
    {
        self.wires().data()
    }
}

// ---------------------------------------------------------------------------
// peripherals

#[derive(Clone)]
pub struct RamNv(Arc<Mutex<Vec<u8>>>);

impl RamNv
{
    pub fn blank() -> Self
    {
        RamNv(Arc::new(Mutex::new(vec![0xff; 64])))
    }

    /// Blank storage with selected bytes preset
    pub fn with(bytes: &[(u16, u8)]) -> Self
    {
        let nv = Self::blank();
        for &(addr, value) in bytes {
            nv.0.lock().unwrap()[addr as usize] = value;
        }
        nv
    }

    /// Echo disabled; most tests want clean response lines
    pub fn quiet() -> Self
    {
        Self::with(&[(9, 0)])
    }
}

impl Nonvolatile for RamNv
{
    fn size(&self) -> u16
    {
        self.0.lock().unwrap().len() as u16
    }

    fn read(&self, addr: u16) -> u8
    {
        self.0.lock().unwrap()[addr as usize]
    }

    fn write(&mut self, addr: u16, value: u8)
    {
        self.0.lock().unwrap()[addr as usize] = value;
    }
}

#[derive(Default)]
pub struct ToneState
{
    pub on: bool,
    pub period: u16,
    pub duty: u8,
    pub starts: u32,
}

#[derive(Clone)]
pub struct RecTone(pub Arc<Mutex<ToneState>>);

impl RecTone
{
    pub fn new() -> Self
    {
        RecTone(Arc::new(Mutex::new(ToneState::default())))
    }

    pub fn is_on(&self) -> bool
    {
        self.0.lock().unwrap().on
    }

    pub fn starts(&self) -> u32
    {
        self.0.lock().unwrap().starts
    }
}

impl Tone for RecTone
{
    fn start(&mut self, period: u16, duty: u8)
    {
        let mut s = self.0.lock().unwrap();
        s.on = true;
        s.period = period;
        s.duty = duty;
        s.starts += 1;
    }

    fn stop(&mut self)
    {
        self.0.lock().unwrap().on = false;
    }
}

#[derive(Clone)]
pub struct RecLed(pub Arc<Mutex<LedMode>>);

impl RecLed
{
    pub fn new() -> Self
    {
        RecLed(Arc::new(Mutex::new(LedMode::Off)))
    }

    pub fn mode(&self) -> LedMode
    {
        *self.0.lock().unwrap()
    }
}

impl StatusLed for RecLed
{
    fn set(&mut self, mode: LedMode)
    {
        *self.0.lock().unwrap() = mode;
    }
}

// ---------------------------------------------------------------------------
// the meter model

const MLA_BASE: u8 = 0x20;
const MTA_BASE: u8 = 0x40;
const UNL: u8 = 0x3f;
const UNT: u8 = 0x5f;
const SPE: u8 = 0x18;
const SPD: u8 = 0x19;

const SB_DREADY: u8 = 0x01;
const SB_SYNERR: u8 = 0x04;
const SB_FRPSRQ: u8 = 0x10;
const SB_RQS: u8 = 0x40;
const SB_PWRSRQ: u8 = 0x80;

pub struct MeterState
{
    pub address: u8,

    // bus roles
    listener: bool,
    talker: bool,
    spoll: bool,
    remote: bool,

    // measurement setup
    pub function: u8, // 1..7, instrument encoding
    pub range: u8,    // 1..7, status encoding
    pub digits: u8,   // 1 = 5.5, 2 = 4.5, 3 = 3.5
    pub int_trigger: bool,
    pub ext_trigger: bool,
    pub autorange: bool,
    pub autozero: bool,

    srq_mask: u8,
    status: u8,
    srq_line: bool,
    /// Bits reported by a serial poll decay shortly afterwards, like the
    /// real instrument's
    poll_clear: Option<(Instant, u8)>,

    // the stimulus applied by the test and the last triggered sample
    input: (i32, u8, i8),
    latest: Option<(i32, u8, i8)>,

    display_text: String,
    display_live: bool,

    cmd_buf: Vec<u8>,
    out_b: bool, // a B reply is queued

    /// Bus command bytes observed under ATN
    pub commands_seen: Vec<u8>,
    /// Device-dependent command strings executed (remote only)
    pub device_log: Vec<String>,
}

impl MeterState
{
    fn new(address: u8) -> Self
    {
        Self {
            address: address,
            listener: false,
            talker: false,
            spoll: false,
            remote: false,
            function: 1, // DCV
            range: 4,    // 30 V
            digits: 1,   // 5.5
            int_trigger: true,
            ext_trigger: false,
            autorange: true,
            autozero: true,
            srq_mask: 0,
            status: 0,
            srq_line: false,
            poll_clear: None,
            input: (0, 2, 0),
            latest: None,
            display_text: String::new(),
            display_live: true,
            cmd_buf: Vec::new(),
            out_b: false,
            commands_seen: Vec::new(),
            device_log: Vec::new(),
        }
    }

    fn setup_byte(&self) -> u8
    {
        self.function << 5 | (self.range & 7) << 2 | self.digits
    }

    fn flags_byte(&self) -> u8
    {
        (self.int_trigger as u8)
            | (self.autorange as u8) << 1
            | (self.autozero as u8) << 2
            | (self.ext_trigger as u8) << 6
    }

    fn raise_if_masked(&mut self)
    {
        if self.status & (self.srq_mask | SB_PWRSRQ) != 0 {
            self.srq_line = true;
        }
    }

    fn recompute_srq(&mut self)
    {
        self.srq_line = self.status & (self.srq_mask | SB_PWRSRQ) != 0;
    }

    fn sample(&mut self)
    {
        self.latest = Some(self.input);
        self.status |= SB_DREADY;
        self.raise_if_masked();
    }

    fn execute(&mut self, cmd: Vec<u8>)
    {
        if cmd.is_empty() {
            return;
        }
        self.device_log.push(String::from_utf8_lossy(&cmd).into_owned());

        let mut i = 0;
        while i < cmd.len() {
            let c = cmd[i];
            i += 1;
            match c {
                b' ' => {}
                b'K' => {
                    self.status = 0;
                    self.recompute_srq();
                }
                b'M' => {
                    let hi = cmd.get(i).copied().unwrap_or(b'0');
                    let lo = cmd.get(i + 1).copied().unwrap_or(b'0');
                    i += 2;
                    self.srq_mask = (hi - b'0') << 3 | (lo - b'0');
                    self.recompute_srq();
                }
                b'D' => {
                    let d = cmd.get(i).copied().unwrap_or(b'1');
                    i += 1;
                    if d == b'1' {
                        self.display_live = true;
                    }
                    else {
                        // the rest of the line is display text
                        self.display_text = String::from_utf8_lossy(&cmd[i..]).into_owned();
                        self.display_live = false;
                        i = cmd.len();
                    }
                }
                b'R' => {
                    if cmd.get(i).copied() == Some(b'A') {
                        self.autorange = true;
                        i += 1;
                    }
                    else {
                        let mut negative = false;
                        if cmd.get(i).copied() == Some(b'-') {
                            negative = true;
                            i += 1;
                        }
                        let d = (cmd.get(i).copied().unwrap_or(b'0') - b'0') as i8;
                        i += 1;
                        let r = if negative { -d } else { d };
                        self.autorange = false;
                        self.range = match self.function {
                            1 => (r + 3) as u8,
                            2 | 5 | 6 => (r + 2) as u8,
                            _ => r as u8,
                        };
                    }
                }
                b'N' => {
                    let d = cmd.get(i).copied().unwrap_or(b'5');
                    i += 1;
                    self.digits = match d {
                        b'5' => 1,
                        b'4' => 2,
                        _ => 3,
                    };
                }
                b'F' => {
                    let d = cmd.get(i).copied().unwrap_or(b'1');
                    i += 1;
                    self.function = (d - b'0').clamp(1, 7);
                }
                b'Z' => {
                    let d = cmd.get(i).copied().unwrap_or(b'1');
                    i += 1;
                    self.autozero = d == b'1';
                }
                b'T' => {
                    let d = cmd.get(i).copied().unwrap_or(b'1');
                    i += 1;
                    self.int_trigger = d == b'1';
                    self.ext_trigger = d == b'2';
                }
                b'B' => {
                    self.out_b = true;
                }
                _ => {
                    self.status |= SB_SYNERR;
                    self.raise_if_masked();
                }
            }
        }
    }
}

/// Shared handle the tests use to poke the meter
#[derive(Clone)]
pub struct MeterHandle
{
    state: Arc<Mutex<MeterState>>,
    bus: SharedBus,
}

impl MeterHandle
{
    fn lock(&self) -> std::sync::MutexGuard<'_, MeterState>
    {
        self.state.lock().unwrap()
    }

    pub fn set_input(&self, value: i32, dot: u8, exp: i8)
    {
        self.lock().input = (value, dot, exp);
    }

    pub fn set_trigger(&self, internal: bool, external: bool)
    {
        let mut m = self.lock();
        m.int_trigger = internal;
        m.ext_trigger = external;
    }

    pub fn set_function(&self, function: u8, range: u8)
    {
        let mut m = self.lock();
        m.function = function;
        m.range = range;
    }

    /// Take one sample now (external/single trigger flows)
    pub fn trigger_once(&self)
    {
        self.lock().sample();
    }

    pub fn press_srq_key(&self)
    {
        let mut m = self.lock();
        m.status |= SB_FRPSRQ;
        m.raise_if_masked();
    }

    pub fn press_local_key(&self)
    {
        self.lock().remote = false;
    }

    pub fn power_cycle(&self)
    {
        let mut m = self.lock();
        m.status = SB_PWRSRQ;
        m.srq_mask = 0;
        m.remote = false;
        m.latest = None;
        m.raise_if_masked();
    }

    pub fn display_text(&self) -> String
    {
        self.lock().display_text.clone()
    }

    pub fn display_live(&self) -> bool
    {
        self.lock().display_live
    }

    pub fn commands_seen(&self) -> Vec<u8>
    {
        self.lock().commands_seen.clone()
    }

    pub fn device_log(&self) -> Vec<String>
    {
        self.lock().device_log.clone()
    }

    pub fn srq_line(&self) -> bool
    {
        self.bus.0.lock().unwrap().srq()
    }

    /// Wait until the captured display text contains `needle`
    pub async fn wait_display(&self, needle: &str, budget: Duration) -> String
    {
        let deadline = Instant::now() + budget;
        loop {
            let text = self.display_text();
            if !self.display_live() && text.contains(needle) {
                return text;
            }
            if Instant::now() >= deadline {
                panic!("display never showed {:?}, last {:?}", needle, text);
            }
            sleep(Duration::from_millis(2)).await;
        }
    }

    /// Wait until the instrument display is back to live readings
    pub async fn wait_display_live(&self, budget: Duration)
    {
        let deadline = Instant::now() + budget;
        while !self.display_live() {
            if Instant::now() >= deadline {
                panic!("display stayed at {:?}", self.display_text());
            }
            sleep(Duration::from_millis(2)).await;
        }
    }

    pub async fn wait_device_log(&self, needle: &str, budget: Duration)
    {
        let deadline = Instant::now() + budget;
        loop {
            if self.device_log().iter().any(|c| c.contains(needle)) {
                return;
            }
            if Instant::now() >= deadline {
                panic!("command {:?} never arrived, log {:?}", needle, self.device_log());
            }
            sleep(Duration::from_millis(2)).await;
        }
    }
}

struct Meter
{
    state: Arc<Mutex<MeterState>>,
    bus: SharedBus,
    sample_period: Duration,
}

impl Meter
{
    /// Spawn a meter task on the shared bus; returns the test handle
    pub fn spawn(bus: &SharedBus, address: u8) -> MeterHandle
    {
        let state = Arc::new(Mutex::new(MeterState::new(address)));
        let handle = MeterHandle {
            state: state.clone(),
            bus: bus.clone(),
        };
        let meter = Meter {
            state: state,
            bus: bus.clone(),
            sample_period: Duration::from_millis(10),
        };
        tokio::spawn(meter.run());
        handle
    }

    fn wires(&self) -> std::sync::MutexGuard<'_, Wires>
    {
        self.bus.0.lock().unwrap()
    }

    fn idle_release(&self)
    {
        let mut w = self.wires();
        w.meter.nrfd = false;
        w.meter.ndac = false;
        w.meter.dav = false;
        w.meter.data_driven = false;
        w.meter.eoi = false;
    }

    async fn run(self)
    {
        let mut next_sample = Instant::now() + self.sample_period;

        loop {
            // housekeeping: IFC, REN drop, trigger timer
            {
                let ifc = self.wires().ifc();
                let ren = self.wires().ren();
                let mut m = self.state.lock().unwrap();
                if ifc {
                    m.listener = false;
                    m.talker = false;
                    m.spoll = false;
                }
                if !ren {
                    m.remote = false;
                }
                if m.int_trigger && Instant::now() >= next_sample {
                    m.sample();
                    next_sample = Instant::now() + self.sample_period;
                }
                if let Some((due, bits)) = m.poll_clear {
                    if Instant::now() >= due {
                        m.status &= !bits;
                        m.poll_clear = None;
                        m.recompute_srq();
                    }
                }
                let srq = m.srq_line;
                drop(m);
                self.wires().meter.srq = srq;
            }

            let atn = self.wires().atn();
            if atn {
                if let Some((byte, _)) = self.accept_byte(true).await {
                    self.bus_command(byte);
                }
                continue;
            }

            let (listener, talker) = {
                let m = self.state.lock().unwrap();
                (m.listener, m.talker)
            };

            if listener {
                if let Some((byte, _)) = self.accept_byte(false).await {
                    let done = {
                        let mut m = self.state.lock().unwrap();
                        if byte == b'\n' {
                            Some(std::mem::take(&mut m.cmd_buf))
                        }
                        else {
                            if byte != b'\r' && m.cmd_buf.len() < 80 {
                                m.cmd_buf.push(byte);
                            }
                            None
                        }
                    };
                    if let Some(cmd) = done {
                        let mut m = self.state.lock().unwrap();
                        if m.remote {
                            m.execute(cmd);
                        }
                    }
                }
                continue;
            }

            if talker {
                if let Some(kind) = self.pending_output() {
                    self.source(kind).await;
                    continue;
                }
            }

            self.idle_release();
            sleep(Duration::from_micros(200)).await;
        }
    }

    fn bus_command(&self, byte: u8)
    {
        let mut m = self.state.lock().unwrap();
        m.commands_seen.push(byte);
        match byte {
            SPE => m.spoll = true,
            SPD => m.spoll = false,
            UNL => m.listener = false,
            UNT => m.talker = false,
            MLA_BASE..=0x3e => {
                if byte - MLA_BASE == m.address {
                    m.listener = true;
                    drop(m);
                    if self.wires().ren() {
                        self.state.lock().unwrap().remote = true;
                    }
                }
            }
            MTA_BASE..=0x5e => {
                m.talker = byte - MTA_BASE == m.address;
                if m.talker {
                    // our own talk address also unaddresses the listener
                    m.listener = false;
                }
            }
            _ => {}
        }
    }

    fn pending_output(&self) -> Option<OutKind>
    {
        let m = self.state.lock().unwrap();
        if m.spoll {
            return Some(OutKind::PollByte);
        }
        if m.out_b {
            return Some(OutKind::Status);
        }
        if m.latest.is_some() {
            return Some(OutKind::Reading);
        }
        None
    }

    async fn source(&self, kind: OutKind)
    {
        let (bytes, eoi) = {
            let m = self.state.lock().unwrap();
            match kind {
                OutKind::PollByte => {
                    let b = m.status | if m.srq_line { SB_RQS } else { 0 };
                    (vec![b], false)
                }
                OutKind::Status => (
                    vec![m.setup_byte(), m.flags_byte(), m.srq_mask, m.status, 0],
                    true,
                ),
                OutKind::Reading => {
                    let (v, dot, exp) = m.latest.unwrap();
                    (format_reading(v, dot, exp), true)
                }
            }
        };

        if self.send_message(&bytes, eoi).await {
            let mut m = self.state.lock().unwrap();
            match kind {
                OutKind::PollByte => {
                    m.srq_line = false;
                    m.poll_clear =
                        Some((Instant::now() + Duration::from_micros(300), m.status));
                }
                OutKind::Status => m.out_b = false,
                OutKind::Reading => {
                    // a completed read retires the data-ready condition
                    m.status &= !SB_DREADY;
                    m.recompute_srq();
                }
            }
        }
    }

    /// Acceptor handshake for one byte; `None` when the context lapses
    async fn accept_byte(&self, under_atn: bool) -> Option<(u8, bool)>
    {
        {
            let mut w = self.wires();
            w.meter.ndac = true;
            w.meter.nrfd = false;
        }

        let deadline = Instant::now() + Duration::from_millis(2);
        loop {
            {
                let w = self.wires();
                if w.atn() != under_atn {
                    return None;
                }
                if !under_atn && !self.state.lock().unwrap().listener {
                    return None;
                }
                if w.dav() {
                    break;
                }
            }
            if Instant::now() >= deadline {
                return None;
            }
            sleep(Duration::from_micros(100)).await;
        }

        let (byte, eoi) = {
            let mut w = self.wires();
            w.meter.nrfd = true;
            let byte = w.data();
            let eoi = w.eoi();
            w.meter.ndac = false;
            (byte, eoi)
        };

        let guard = Instant::now() + Duration::from_millis(500);
        while self.wires().dav() {
            if Instant::now() >= guard {
                break;
            }
            sleep(Duration::from_micros(20)).await;
        }
        self.wires().meter.ndac = true;

        Some((byte, eoi))
    }

    fn abort_send(&self)
    {
        let mut w = self.wires();
        w.meter.dav = false;
        w.meter.data_driven = false;
        w.meter.eoi = false;
    }

    /// Source handshake; aborts (false) if ATN interrupts or nobody listens
    async fn send_message(&self, bytes: &[u8], eoi_last: bool) -> bool
    {
        for (i, &byte) in bytes.iter().enumerate() {
            {
                let mut w = self.wires();
                if w.atn() || w.ifc() {
                    drop(w);
                    self.abort_send();
                    return false;
                }
                w.meter.data = byte;
                w.meter.data_driven = true;
                if i == bytes.len() - 1 && eoi_last {
                    w.meter.eoi = true;
                }
            }
            sleep(Duration::from_micros(2)).await;

            let guard = Instant::now() + Duration::from_millis(500);
            loop {
                enum Step { Abort, Done, Continue }
                let step = {
                    let w = self.wires();
                    if w.atn() || w.ifc() {
                        Step::Abort
                    } else if !w.nrfd() {
                        Step::Done
                    } else {
                        Step::Continue
                    }
                };
                match step {
                    Step::Abort => {
                        self.abort_send();
                        return false;
                    }
                    Step::Done => break,
                    Step::Continue => {
                        if Instant::now() >= guard {
                            self.abort_send();
                            return false;
                        }
                        sleep(Duration::from_micros(100)).await;
                    }
                }
            }

            self.wires().meter.dav = true;

            loop {
                enum Step { Abort, Done, Continue }
                let step = {
                    let w = self.wires();
                    if w.atn() || w.ifc() {
                        Step::Abort
                    } else if !w.ndac() {
                        Step::Done
                    } else {
                        Step::Continue
                    }
                };
                match step {
                    Step::Abort => {
                        self.abort_send();
                        return false;
                    }
                    Step::Done => break,
                    Step::Continue => {
                        if Instant::now() >= guard {
                            self.abort_send();
                            return false;
                        }
                        sleep(Duration::from_micros(50)).await;
                    }
                }
            }

            self.wires().meter.dav = false;
        }

        let mut w = self.wires();
        w.meter.eoi = false;
        w.meter.data_driven = false;
        true
    }
}

enum OutKind
{
    PollByte,
    Status,
    Reading,
}

/// The instrument's wire format: six mantissa digits with the display's dot
/// position, then a one-digit exponent
fn format_reading(value: i32, dot: u8, exp: i8) -> Vec<u8>
{
    let mut out = Vec::with_capacity(13);
    out.push(if value < 0 { b'-' } else { b'+' });

    let digits = format!("{:06}", value.unsigned_abs().min(999_999));
    let dot = dot.clamp(1, 5) as usize;
    out.extend_from_slice(&digits.as_bytes()[..dot]);
    out.push(b'.');
    out.extend_from_slice(&digits.as_bytes()[dot..]);

    out.push(b'E');
    out.push(if exp < 0 { b'-' } else { b'+' });
    out.push(b'0' + exp.unsigned_abs());
    out.extend_from_slice(b"\r\n");
    out
}

// ---------------------------------------------------------------------------
// the whole rig

pub struct Rig
{
    pub uart: DuplexStream,
    pub meter: MeterHandle,
    pub tone: RecTone,
    pub led: RecLed,
    pub nv: RamNv,
}

impl Rig
{
    /// Bridge plus meter on a shared bus, talking over an in-memory duplex
    pub fn start(nv: RamNv) -> Rig
    {
        let bus = SharedBus::new();
        let meter = Meter::spawn(&bus, 23);
        let (host, device) = tokio::io::duplex(1 << 16);
        let tone = RecTone::new();
        let led = RecLed::new();

        let bridge = Bridge::new(
            SimBus::new(&bus),
            device,
            nv.clone(),
            tone.clone(),
            led.clone(),
        );
        tokio::spawn(bridge.run());

        Rig {
            uart: host,
            meter: meter,
            tone: tone,
            led: led,
            nv: nv,
        }
    }

    /// Bridge alone on an empty bus
    pub fn start_without_meter(nv: RamNv) -> Rig
    {
        let rig = Self::start(nv);
        // park the meter where nothing addresses it
        rig.meter.lock().address = 29;
        rig
    }

    pub async fn send_line(&mut self, line: &str)
    {
        use tokio::io::AsyncWriteExt;
        self.uart.write_all(line.as_bytes()).await.unwrap();
        self.uart.write_all(b"\r").await.unwrap();
    }

    /// Read one CR LF terminated response line
    pub async fn expect_line(&mut self) -> String
    {
        let mut line = Vec::new();
        let budget = Duration::from_secs(10);
        let deadline = Instant::now() + budget;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let byte = timeout(remaining, self.uart.read_u8())
                .await
                .expect("no response line")
                .expect("uart closed");
            if byte == b'\n' {
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                return String::from_utf8_lossy(&line).into_owned();
            }
            line.push(byte);
        }
    }

    /// Read lines until one matches; tolerates diagnostic chatter
    pub async fn expect_line_eventually(&mut self, wanted: &str) -> String
    {
        for _ in 0..32 {
            let line = self.expect_line().await;
            if line == wanted {
                return line;
            }
        }
        panic!("never saw {:?}", wanted);
    }
}
