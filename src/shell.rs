//! The host-facing command interpreter
//!
//! Single-letter commands with optional arguments, CR-terminated, responses
//! closed with CR LF. Transfer commands report `OK` or `TIMEOUT n` where `n`
//! is the number of bytes the bus actually accepted; user errors are local
//! and change no state.

use std::time::Duration;
use std::{ fmt::Write as _, io };
use tokio::io::{ AsyncReadExt, AsyncWriteExt };
use tokio::time::{ sleep, timeout };

use crate::bus::GpibBus;
use crate::config::{ Config, Opt };
use crate::edit::LineEditor;
use crate::hal::{ LedMode, Nonvolatile, StatusLed };
use crate::session::{ Link, Phase };
use crate::transport::{ self, EndMode, Termination };

/// Largest single GPIB transfer the shell stages
pub const GPIB_BUF_SIZE: usize = 127;

const HELP: &[u8] = b"\r\n\
HP 3478A bridge, GPIB <-> UART\r\n\
Transmission commands\r\n\
  C  Send ASCII command\r\n\
  D  Send/receive ASCII data\r\n\
  THC Send HEX command\r\n\
  THD Send*/receive** HEX data\r\n\
  TBD Send/receive* binary data\r\n\
  P  Continuous read (plotter mode), <ESC> to exit\r\n\
GPIB control\r\n\
  R  Set REMOTE mode (REN true)\r\n\
  L  Set LOCAL mode (REN false)\r\n\
  I  Generate IFC pulse\r\n\
Other commands\r\n\
  S  Get REN/SRQ/LISTEN state (1 if true)\r\n\
  O  Get/set an option (O? for list)\r\n\
  H  Command history\r\n\r\n\
*  Add ; at the end to disable EOI\r\n\
** Length in hex may follow the command (up to 7f)\r\n\r\n";

const OPT_HELP: &[u8] = b"\r\n\
O<opt>        Show current value\r\n\
O<opt><val>   Set option value\r\n\
O<opt><val>w  Set option value and persist it\r\n\
<opt>:\r\n\
  I Interactive mode (0 off, 1 on)\r\n\
  C Converter GPIB address\r\n\
  D Instrument GPIB address\r\n\
  T Transmit end of line*\r\n\
  R Receive end of line*\r\n\
  X Instrument extension mode (0 off, 1 on)\r\n\
  B Baud rate (0=115200, 2=500K, 3=1M, 4=2M)\r\n\
  M Initial instrument mode word (0 = none)\r\n\
  P Buzzer period      Q Buzzer duty\r\n\
  G Continuity range   S Continuity threshold\r\n\
  A Continuity latch count\r\n\
  J/K Continuity beep reading break-points\r\n\
  U/V Continuity beep periods\r\n\
  E/F Continuity beep duties\r\n\
  0 Set defaults for interactive operation\r\n\
  1 Set defaults for non-interactive\r\n\r\n\
* ORed bits: 4=EOI, 2=<LF>, 1=<CR>\r\n\r\n";

fn is_hex_digit(c: u8) -> bool
{
    c.is_ascii_digit() || (b'A'..=b'F').contains(&c) || (b'a'..=b'f').contains(&c)
}

fn hex_value(c: u8) -> u8
{
    match c {
        b'0'..=b'9' => c - b'0',
        b'A'..=b'F' => c - b'A' + 10,
        _ => c - b'a' + 10,
    }
}

/// Decode `CC` pairs, honoring a trailing `;` that suppresses EOI
fn parse_hex_message(text: &[u8]) -> Option<(Vec<u8>, EndMode)>
{
    let mut end = EndMode::EOI;
    let mut text = text;

    if text.len() < 2 {
        return None;
    }
    if text[text.len() - 1] == b';' {
        text = &text[..text.len() - 1];
        end = EndMode::empty();
    }
    if text.len() % 2 != 0 || !text.iter().all(|&c| is_hex_digit(c)) {
        return None;
    }

    let bytes = text
        .chunks(2)
        .map(|pair| hex_value(pair[0]) << 4 | hex_value(pair[1]))
        .collect();
    Some((bytes, end))
}

/// Optional hex length prefix of a `THD`/`TBD` receive, up to two digits
fn read_length(text: &[u8]) -> u32
{
    let mut len = 0u32;
    if !text.is_empty() && is_hex_digit(text[0]) {
        len = hex_value(text[0]) as u32;
        if text.len() > 1 && is_hex_digit(text[1]) {
            len = len << 4 | hex_value(text[1]) as u32;
        }
    }
    len
}

/// Drain everything the host queued, reporting whether an ESC was among it
async fn escape_pending<U>(uart: &mut U) -> io::Result<bool>
    where U: AsyncReadExt + AsyncWriteExt + Unpin + Send
{
    let mut seen = false;
    loop {
        match timeout(Duration::ZERO, uart.read_u8()).await {
            Ok(Ok(b)) => {
                if b == 27 {
                    seen = true;
                }
            }
            Ok(Err(err)) => return Err(err),
            Err(_) => break,
        }
    }
    Ok(seen)
}

async fn respond_transfer<U>(uart: &mut U, sent: usize, expected: usize) -> io::Result<()>
    where U: AsyncReadExt + AsyncWriteExt + Unpin + Send
{
    if sent == expected {
        uart.write_all(b"OK\r\n").await
    }
    else {
        let mut line = String::new();
        let _ = write!(line, "TIMEOUT {}\r\n", sent);
        uart.write_all(line.as_bytes()).await
    }
}

fn phase_led(phase: Phase) -> LedMode
{
    if phase == Phase::Listener {
        LedMode::Fast
    }
    else {
        LedMode::Off
    }
}

/// Execute one completed command line
pub async fn dispatch<B, U, N, L>(
    cmd: u8,
    editor: &LineEditor,
    link: &mut Link<B>,
    uart: &mut U,
    cfg: &mut Config,
    nv: &mut N,
    led: &mut L,
)
    -> io::Result<()>

    where B: GpibBus,
          U: AsyncReadExt + AsyncWriteExt + Unpin + Send,
          N: Nonvolatile,
          L: StatusLed,
{
    let line = editor.line();

    match cmd {
        b'D' => {
            if link.phase == Phase::Listener {
                escape_pending(uart).await?; // clear a stale escape
                let mut buf = [0u8; GPIB_BUF_SIZE];
                let last;
                loop {
                    let (n, term) = link.receive_data(&mut buf, cfg.rx_eol()).await;
                    uart.write_all(&buf[..n]).await?;
                    if term != Termination::FULL || escape_pending(uart).await? {
                        last = term;
                        break;
                    }
                }
                if last.timed_out() {
                    // no EOI or EOL arrived; give the user at least a line
                    uart.write_all(b"\r\n").await?;
                }
            }
            else {
                let end = cfg.tx_eol();
                let sent = link.send_data(&line[1..], end).await;
                let expected = transport::wire_len(line.len() - 1, end);
                if expected == 0 && !link.acceptor_present() {
                    // nothing to send and nobody listening: that is not an OK
                    uart.write_all(b"TIMEOUT 0\r\n").await?;
                }
                else {
                    respond_transfer(uart, sent, expected).await?;
                }
            }
        }

        b'C' => {
            link.scan_command(&line[1..]);
            led.set(phase_led(link.phase));
            let sent = link.send_command(&line[1..]).await;
            respond_transfer(uart, sent, line.len() - 1).await?;
        }

        b'R' => {
            link.set_ren(true);
            uart.write_all(b"OK\r\n").await?;
        }

        b'L' => {
            link.set_ren(false);
            uart.write_all(b"OK\r\n").await?;
        }

        b'I' => {
            link.pulse_ifc().await;
            if link.phase == Phase::Listener {
                link.phase = Phase::Idle;
                led.set(LedMode::Off);
                link.force_talk();
            }
            uart.write_all(b"OK\r\n").await?;
        }

        b'S' => {
            let state = [
                if link.ren() { b'1' } else { b'0' },
                if link.srq() { b'1' } else { b'0' },
                link.phase.digit(),
                13,
                10,
            ];
            uart.write_all(&state).await?;
        }

        b'P' => {
            led.set(LedMode::Slow);
            link.force_listen();
            escape_pending(uart).await?;
            loop {
                if escape_pending(uart).await? {
                    break;
                }
                let mut byte = [0u8; 1];
                let (n, _) = link.receive_data(&mut byte, EndMode::empty()).await;
                if n == 0 {
                    sleep(Duration::from_millis(10)).await;
                }
                else {
                    uart.write_all(&byte).await?;
                }
            }
            link.phase = Phase::Idle;
            link.force_talk();
            led.set(LedMode::Off);
        }

        b'T' => {
            transfer_command(line, link, uart, cfg, led).await?;
        }

        b'O' => {
            option_command(&line[1..], uart, cfg, nv).await?;
        }

        b'H' => {
            let mut listing = String::new();
            for (i, entry) in editor.history().iter().enumerate() {
                let _ = write!(listing, "{}: {}\r\n", i, String::from_utf8_lossy(entry));
            }
            uart.write_all(listing.as_bytes()).await?;
        }

        b'?' => {
            uart.write_all(HELP).await?;
        }

        0 | 13 => {}

        _ => {
            uart.write_all(b"WRONG COMMAND\r\n").await?;
        }
    }

    Ok(())
}

/// `THC`, `THD` and `TBD`
async fn transfer_command<B, U, L>(
    line: &[u8],
    link: &mut Link<B>,
    uart: &mut U,
    cfg: &Config,
    led: &mut L,
)
    -> io::Result<()>

    where B: GpibBus,
          U: AsyncReadExt + AsyncWriteExt + Unpin + Send,
          L: StatusLed,
{
    if line.len() < 3 {
        return uart.write_all(b"ERROR\r\n").await;
    }

    if line[1] == b'H' && (link.phase != Phase::Listener || line[2] == b'C') {
        // hex command or hex transmit
        let parsed = parse_hex_message(&line[3..]);
        let (data, end) = match parsed {
            Some(p) => p,
            None => return uart.write_all(b"ERROR\r\n").await,
        };

        match line[2] {
            b'C' => {
                link.scan_command(&data);
                led.set(phase_led(link.phase));
                let sent = link.send_command(&data).await;
                respond_transfer(uart, sent, data.len()).await?;
            }
            b'D' => {
                let sent = link.send_data(&data, end).await;
                respond_transfer(uart, sent, transport::wire_len(data.len(), end)).await?;
            }
            _ => uart.write_all(b"ERROR\r\n").await?,
        }
    }
    else if line[1] == b'B' && line[2] == b'D' && link.phase != Phase::Listener {
        // binary transmit: length-prefixed frames from the host, high bit
        // of the length requests EOI, zero length ends the stream
        let mut failed = false;
        let mut sent = 0usize;
        loop {
            let header = uart.read_u8().await?;
            let end = if header & 0x80 != 0 { EndMode::EOI } else { EndMode::empty() };
            let count = (header & 0x7f) as usize;
            if count == 0 {
                break;
            }
            let mut data = vec![0u8; count];
            uart.read_exact(&mut data).await?;
            if !failed {
                sent = link.send_data(&data, end).await;
                failed = sent != transport::wire_len(count, end);
            }
            uart.write_all(&[sent as u8]).await?;
        }
    }
    else if (line[1] == b'B' || line[1] == b'H') && line[2] == b'D' {
        // receive, hex or binary framed
        let hex = line[1] == b'H';
        let mut remaining = match read_length(&line[3..]) {
            0 => u32::MAX,
            n => n,
        };
        escape_pending(uart).await?;

        let mut buf = [0u8; GPIB_BUF_SIZE];
        let last;
        loop {
            let chunk = remaining.min(GPIB_BUF_SIZE as u32) as usize;
            let (n, term) = link.receive_data(&mut buf[..chunk], cfg.rx_eol()).await;
            if hex {
                let mut text = String::new();
                for b in &buf[..n] {
                    let _ = write!(text, "{:02X}", b);
                }
                uart.write_all(text.as_bytes()).await?;
            }
            else if n > 0 {
                let eoi_bit = if term.contains(Termination::EOI) { 0x80 } else { 0 };
                uart.write_all(&[n as u8 | eoi_bit]).await?;
                uart.write_all(&buf[..n]).await?;
            }
            remaining -= n as u32;
            if term != Termination::FULL || remaining == 0 || escape_pending(uart).await? {
                last = term;
                break;
            }
        }

        if hex {
            if !last.contains(Termination::EOI) {
                uart.write_all(b";").await?;
            }
            uart.write_all(b"\r\n").await?;
        }
        else {
            uart.write_all(&[0]).await?;
        }
    }
    else {
        uart.write_all(b"ERROR\r\n").await?;
    }

    Ok(())
}

/// `O` and its sub-options
async fn option_command<U, N>(args: &[u8], uart: &mut U, cfg: &mut Config, nv: &mut N)
    -> io::Result<()>

    where U: AsyncReadExt + AsyncWriteExt + Unpin + Send,
          N: Nonvolatile,
{
    if args.is_empty() {
        return uart.write_all(b"ERROR\r\n").await;
    }

    match args[0] {
        b'0' | b'1' => {
            cfg.apply_defaults(args[0] == b'0');
            return uart.write_all(b"OK\r\n").await;
        }
        b'?' => {
            return uart.write_all(OPT_HELP).await;
        }
        _ => {}
    }

    let opt = match Config::by_key(args[0]) {
        Some(opt) => opt,
        None => return uart.write_all(b"WRONG OPTION\r\n").await,
    };

    let value_text = &args[1..];
    if value_text.is_empty() {
        let mut line = String::new();
        let _ = write!(line, "{}\r\n", cfg.get(opt));
        return uart.write_all(line.as_bytes()).await;
    }

    let mut value: u32 = 0;
    let mut persist = false;
    for (i, &c) in value_text.iter().enumerate() {
        if c.is_ascii_digit() {
            value = value * 10 + (c - b'0') as u32;
            if value > u16::MAX as u32 {
                return uart.write_all(b"ERROR\r\n").await;
            }
        }
        else if (c == b'w' || c == b'W') && i == value_text.len() - 1 {
            persist = true;
        }
        else {
            return uart.write_all(b"ERROR\r\n").await;
        }
    }

    if !cfg.set(opt, value as u16) {
        return uart.write_all(b"ERROR\r\n").await;
    }
    if persist {
        cfg.persist(opt, nv);
    }
    uart.write_all(b"OK\r\n").await?;

    if opt == Opt::Baud {
        // let the OK drain at the old rate; the embedding reprograms the
        // UART afterwards and the host must hold off for 2 ms
        uart.flush().await?;
        sleep(Duration::from_millis(2)).await;
    }
    Ok(())
}
