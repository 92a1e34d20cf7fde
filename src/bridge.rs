//! The outer event loop
//!
//! Single-threaded and cooperative: one iteration runs at most one completed
//! shell command, then blocks until something happens. Three things can:
//! a byte arrives from the host, the SRQ line moves (sampled at the
//! millisecond tick and edge-filtered, because long ribbon cables induce
//! spurious blips), or the extension machine's deadline expires. Events are
//! batched; the extension handler sees one batch per invocation and SRQ
//! edges that pile up during a handler collapse into a single delivery (the
//! serial poll recovers the state regardless).

use std::io;
use std::time::Duration;
use tokio::io::{ AsyncReadExt, AsyncWriteExt };
use tokio::time::{ sleep, Instant };

use crate::bus::GpibBus;
use crate::config::Config;
use crate::edit::LineEditor;
use crate::ext::{ Event, ExtIo, Extension, Wakeup };
use crate::hal::{ Nonvolatile, StatusLed, Tone };
use crate::session::Link;
use crate::shell;

/// Event sampling period
const TICK: Duration = Duration::from_millis(1);

/// The bridge: shell, session and extension machine over one GPIB port and
/// one serial byte stream
pub struct Bridge<B, U, N, T, L>
{
    link: Link<B>,
    uart: U,
    nv: N,
    tone: T,
    led: L,
    cfg: Config,
    editor: LineEditor,
    ext: Extension,
}

impl<B, U, N, T, L> Bridge<B, U, N, T, L>
    where B: GpibBus,
          U: AsyncReadExt + AsyncWriteExt + Unpin + Send,
          N: Nonvolatile,
          T: Tone,
          L: StatusLed,
{
    /// Load the configuration and park the bus in talk configuration
    pub fn new(bus: B, uart: U, nv: N, tone: T, led: L) -> Self
    {
        let cfg = Config::load(&nv);
        let link = Link::new(bus, cfg.my_addr(), cfg.device_addr());
        Self {
            link: link,
            uart: uart,
            nv: nv,
            tone: tone,
            led: led,
            cfg: cfg,
            editor: LineEditor::new(),
            ext: Extension::new(),
        }
    }

    /// Run until the serial stream closes
    pub async fn run(mut self) -> io::Result<()>
    {
        // an instrument address of 31 means "printer on the bus": come up
        // capturing plotter output instead of prompting
        let mut pending: u8 = if self.cfg.device_addr() == 31 { b'P' } else { 0 };

        if pending == 0 {
            let mut out = Vec::new();
            self.editor.reset(self.cfg.echo(), &mut out);
            self.uart.write_all(&out).await?;
        }

        // force an enable/disable event on the first pass so the extension
        // machine starts in the configured state
        let mut ext_on = !self.cfg.ext_enabled();

        let mut deadline: Option<Instant> = None;
        let mut srq_prev = false;
        let mut srq_edge = false;

        loop {
            if pending != 0 {
                shell::dispatch(
                    pending,
                    &self.editor,
                    &mut self.link,
                    &mut self.uart,
                    &mut self.cfg,
                    &mut self.nv,
                    &mut self.led,
                )
                .await?;
                pending = 0;

                // O may have changed the addressing
                self.link.my_addr = self.cfg.my_addr();
                self.link.device_addr = self.cfg.device_addr();

                let mut out = Vec::new();
                self.editor.reset(self.cfg.echo(), &mut out);
                self.uart.write_all(&out).await?;
            }

            let mut ev = Event::empty();
            if ext_on != self.cfg.ext_enabled() {
                ext_on = self.cfg.ext_enabled();
                ev |= if ext_on { Event::EXT_ENABLE } else { Event::EXT_DISABLE };
            }

            let mut received = None;
            while ev.is_empty() {
                tokio::select! {
                    result = self.uart.read_u8() => {
                        match result {
                            Ok(b) => {
                                received = Some(b);
                                ev |= Event::UART;
                            }
                            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                                return Ok(());
                            }
                            Err(err) => return Err(err),
                        }
                    }
                    _ = sleep(TICK) => {
                        let srq = self.link.srq();
                        if srq != srq_prev {
                            srq_edge = true;
                            srq_prev = srq;
                        }
                        if srq_edge {
                            srq_edge = false;
                            if srq {
                                ev |= Event::SRQ;
                            }
                        }
                        if deadline.map(|d| Instant::now() >= d).unwrap_or(false) {
                            ev |= Event::TIMEOUT;
                        }
                    }
                }
            }

            if ev.intersects(
                Event::SRQ | Event::TIMEOUT | Event::EXT_ENABLE | Event::EXT_DISABLE,
            ) {
                let wakeup = {
                    let mut ext_io = ExtIo {
                        link: &mut self.link,
                        uart: &mut self.uart,
                        cfg: &mut self.cfg,
                        nv: &mut self.nv,
                        tone: &mut self.tone,
                    };
                    self.ext.handle(ev, &mut ext_io).await?
                };
                match wakeup {
                    Wakeup::Never => deadline = None,
                    Wakeup::Unchanged => {}
                    Wakeup::After(ms) => {
                        deadline = Some(Instant::now() + Duration::from_millis(ms as u64));
                    }
                }
            }

            if let Some(b) = received {
                let mut out = Vec::new();
                pending = self.editor.feed(b, &mut out);
                self.uart.write_all(&out).await?;
            }
        }
    }
}
