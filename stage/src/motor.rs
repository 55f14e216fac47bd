//! Byte transport to the motion controller.
//!
//! The real link is a UART (`motor` feature); [`MockGrbl`] simulates enough
//! of the firmware to run a whole scan without hardware.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info};

use crate::config::SerialConfig;
use crate::grbl::StageError;

pub trait SerialLink {
    /// Sends `line` followed by a newline.
    fn write_line(&mut self, line: &str) -> Result<(), StageError>;
    /// Returns whatever the controller answered before the read timeout,
    /// empty if it said nothing.
    fn read_reply(&mut self) -> Result<String, StageError>;
    fn name(&self) -> String;
    fn close(&mut self) {}
}

impl SerialLink for Box<dyn SerialLink> {
    fn write_line(&mut self, line: &str) -> Result<(), StageError> {
        (**self).write_line(line)
    }

    fn read_reply(&mut self) -> Result<String, StageError> {
        (**self).read_reply()
    }

    fn name(&self) -> String {
        (**self).name()
    }

    fn close(&mut self) {
        (**self).close()
    }
}

pub enum LinkType {
    Simulated,
    #[cfg(feature = "motor")]
    Uart,
}

/// Opens the link; for a UART every configured port is tried in order.
pub fn make_serial_link(link_type: LinkType, config: &SerialConfig) -> Result<Box<dyn SerialLink>, StageError> {
    match link_type {
        LinkType::Simulated => {
            let _ = config;
            Ok(Box::new(MockGrbl::new()))
        }
        #[cfg(feature = "motor")]
        LinkType::Uart => {
            for port in &config.ports {
                match real_motor::UartLink::open(port, config) {
                    Ok(link) => {
                        info!("opened grbl port {}", port.display());
                        return Ok(Box::new(link));
                    }
                    Err(e) => debug!("opening port {} failed: {e}", port.display()),
                }
            }
            Err(StageError::NoController {
                ports: config.ports.clone(),
            })
        }
    }
}

// pause before offering bytes again to a full output buffer
const WRITE_RETRY: Duration = Duration::from_millis(1);

fn timed_out(what: String) -> StageError {
    StageError::Transport(std::io::Error::new(std::io::ErrorKind::TimedOut, what))
}

/// Feeds `bytes` to `write`, which may take only part of them or nothing
/// at all, until everything is accepted or `deadline` passes.
pub fn write_until<W>(bytes: &[u8], deadline: Instant, mut write: W) -> Result<(), StageError>
where
    W: FnMut(&[u8]) -> Result<usize, StageError>,
{
    let mut written = 0;
    while written < bytes.len() {
        let n = write(&bytes[written..])?;
        written += n;
        if written == bytes.len() {
            break;
        }
        if Instant::now() >= deadline {
            return Err(timed_out(format!(
                "wrote {written} of {} bytes before the write timeout",
                bytes.len()
            )));
        }
        if n == 0 {
            thread::sleep(WRITE_RETRY);
        }
    }
    Ok(())
}

#[cfg(feature = "motor")]
pub mod real_motor {
    use super::*;
    use rppal::uart::{Parity, Uart};
    use std::path::Path;

    // a status line plus "ok" fits comfortably
    const READ_CHUNK: usize = 100;

    pub struct UartLink {
        uart: Option<Uart>,
        port: PathBuf,
        read_timeout: Duration,
        write_timeout: Duration,
    }

    fn transport(e: rppal::uart::Error) -> StageError {
        StageError::Transport(std::io::Error::new(std::io::ErrorKind::Other, e))
    }

    impl UartLink {
        pub fn open(port: &Path, config: &SerialConfig) -> Result<UartLink, StageError> {
            let mut uart =
                Uart::with_path(port, config.baud_rate, Parity::None, 8, 1).map_err(transport)?;
            // return as soon as bytes arrive, or after the timeout with nothing
            uart.set_read_mode(0, config.read_timeout())
                .map_err(transport)?;
            // non-blocking, so a stalled line cannot outlast the write timeout
            uart.set_write_mode(false).map_err(transport)?;
            Ok(UartLink {
                uart: Some(uart),
                port: port.to_path_buf(),
                read_timeout: config.read_timeout(),
                write_timeout: config.write_timeout(),
            })
        }

        fn uart(&mut self) -> Result<&mut Uart, StageError> {
            self.uart.as_mut().ok_or_else(|| {
                StageError::Transport(std::io::Error::new(
                    std::io::ErrorKind::NotConnected,
                    "serial port already closed",
                ))
            })
        }
    }

    impl SerialLink for UartLink {
        fn write_line(&mut self, line: &str) -> Result<(), StageError> {
            let deadline = Instant::now() + self.write_timeout;
            let uart = self.uart()?;
            let mut bytes = line.as_bytes().to_vec();
            bytes.push(b'\n');
            write_until(&bytes, deadline, |chunk| uart.write(chunk).map_err(transport))?;

            // wait for the output buffer to empty, bounded by the same deadline
            while uart.output_len().map_err(transport)? > 0 {
                if Instant::now() >= deadline {
                    return Err(timed_out(format!("{line:?} not transmitted before the write timeout")));
                }
                thread::sleep(WRITE_RETRY);
            }
            Ok(())
        }

        fn read_reply(&mut self) -> Result<String, StageError> {
            let deadline = Instant::now() + self.read_timeout;
            let uart = self.uart()?;
            let mut reply = Vec::new();
            let mut chunk = [0u8; READ_CHUNK];
            while Instant::now() < deadline {
                let n = uart.read(&mut chunk).map_err(transport)?;
                if n == 0 {
                    break;
                }
                reply.extend_from_slice(&chunk[..n]);
                if is_complete_reply(&reply) {
                    break;
                }
            }
            Ok(String::from_utf8_lossy(&reply).into_owned())
        }

        fn name(&self) -> String {
            format!("grbl on {}", self.port.display())
        }

        fn close(&mut self) {
            if self.uart.take().is_some() {
                info!("closed serial port {}", self.port.display());
            }
        }
    }

    /// grbl finishes every answer with an `ok` or `error:` line; alarms and
    /// the startup banner stand alone.
    fn is_complete_reply(bytes: &[u8]) -> bool {
        let text = String::from_utf8_lossy(bytes);
        if !text.ends_with('\n') {
            return false;
        }
        text.lines().any(|line| {
            let line = line.trim();
            line == "ok"
                || line.starts_with("error")
                || line.starts_with("ALARM")
                || line.starts_with("Grbl")
        })
    }

    #[cfg(test)]
    mod tests {
        use super::is_complete_reply;

        #[test]
        fn reply_is_complete_after_terminal_line() {
            assert!(is_complete_reply(b"ok\r\n"));
            assert!(is_complete_reply(b"<Idle|MPos:0.000,0.000,0.000>\r\nok\r\n"));
            assert!(is_complete_reply(b"error:9\r\n"));
            assert!(!is_complete_reply(b"<Idle|MPos:0.000,0.0"));
            assert!(!is_complete_reply(b"<Idle|MPos:0.000,0.000,0.000>\r\n"));
        }
    }
}

/// Firmware stand-in: acknowledges every command, tracks the commanded X/Y
/// position and reports `Run` for a few polls after each move.
pub struct MockGrbl {
    x: f64,
    y: f64,
    busy_polls: u32,
    polls_per_move: u32,
    pending: Option<String>,
    script: VecDeque<String>,
    sent: Vec<String>,
    closed: Arc<AtomicBool>,
}

impl Default for MockGrbl {
    fn default() -> Self {
        Self::new()
    }
}

impl MockGrbl {
    pub fn new() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            busy_polls: 0,
            polls_per_move: 2,
            pending: Some("Grbl 1.1h ['$' for help]\r\n".to_string()),
            script: VecDeque::new(),
            sent: Vec::new(),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Replies with `replies`, one per command, before falling back to the
    /// simulation.
    pub fn scripted<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            pending: None,
            script: replies.into_iter().map(Into::into).collect(),
            ..Self::new()
        }
    }

    pub fn with_polls_per_move(mut self, polls: u32) -> Self {
        self.polls_per_move = polls;
        self
    }

    pub fn sent(&self) -> &[String] {
        &self.sent
    }

    pub fn position(&self) -> (f64, f64) {
        (self.x, self.y)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Reports the close even after the link itself has been dropped.
    pub fn closed_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.closed)
    }

    fn simulate(&mut self, line: &str) -> String {
        if line == "?" {
            let state = if self.busy_polls > 0 {
                self.busy_polls -= 1;
                "Run"
            } else {
                "Idle"
            };
            return format!(
                "<{state}|MPos:{:.3},{:.3},0.000|FS:0,0>\r\nok\r\n",
                self.x, self.y
            );
        }

        let mut words = line.split_whitespace();
        match words.next() {
            Some("G1") | Some("G0") => {
                let mut moved = false;
                for word in words {
                    let (axis, value) = word.split_at(1);
                    let Ok(value) = value.parse::<f64>() else {
                        continue;
                    };
                    match axis {
                        "X" => {
                            self.x = value;
                            moved = true;
                        }
                        "Y" => {
                            self.y = value;
                            moved = true;
                        }
                        _ => {}
                    }
                }
                if moved {
                    self.busy_polls = self.polls_per_move;
                }
            }
            Some("G92") => {
                for word in words {
                    if let Some(value) = word.strip_prefix('X').and_then(|v| v.parse().ok()) {
                        self.x = value;
                    }
                }
            }
            Some("$H") => {
                self.busy_polls = self.polls_per_move;
            }
            _ => {}
        }
        "ok\r\n".to_string()
    }
}

impl SerialLink for MockGrbl {
    fn write_line(&mut self, line: &str) -> Result<(), StageError> {
        self.sent.push(line.to_string());
        let reply = match self.script.pop_front() {
            Some(reply) => reply,
            None => self.simulate(line),
        };
        self.pending = Some(reply);
        Ok(())
    }

    fn read_reply(&mut self) -> Result<String, StageError> {
        Ok(self.pending.take().unwrap_or_default())
    }

    fn name(&self) -> String {
        "simulated grbl".to_string()
    }

    fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn greets_then_acknowledges() {
        let mut grbl = MockGrbl::new();
        assert!(grbl.read_reply().unwrap().starts_with("Grbl"));
        grbl.write_line("G90").unwrap();
        assert_eq!(grbl.read_reply().unwrap(), "ok\r\n");
        assert_eq!(grbl.read_reply().unwrap(), "");
    }

    #[test]
    fn reports_run_until_move_completes() {
        let mut grbl = MockGrbl::new().with_polls_per_move(1);
        grbl.write_line("G1 X12.500 F150").unwrap();
        grbl.read_reply().unwrap();

        grbl.write_line("?").unwrap();
        assert!(grbl.read_reply().unwrap().starts_with("<Run|MPos:12.500,0.000"));
        grbl.write_line("?").unwrap();
        assert!(grbl.read_reply().unwrap().starts_with("<Idle|"));
        assert_eq!(grbl.position(), (12.5, 0.0));
    }

    #[test]
    fn script_takes_precedence() {
        let mut grbl = MockGrbl::scripted(["error:20\r\n"]);
        grbl.write_line("G1 X1").unwrap();
        assert_eq!(grbl.read_reply().unwrap(), "error:20\r\n");
        grbl.write_line("G1 X1").unwrap();
        assert_eq!(grbl.read_reply().unwrap(), "ok\r\n");
    }

    #[test]
    fn partial_writes_are_resumed() {
        let mut received = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(1);
        let mut offers = 0;
        write_until(b"G1 X1\n", deadline, |chunk| {
            offers += 1;
            // a full buffer every other call, then a single byte
            if offers % 2 == 0 {
                return Ok(0);
            }
            received.push(chunk[0]);
            Ok(1)
        })
        .unwrap();
        assert_eq!(received, b"G1 X1\n");
    }

    #[test]
    fn stalled_write_times_out() {
        let deadline = Instant::now() + Duration::from_millis(20);
        let err = write_until(b"G90\n", deadline, |_| Ok(0)).unwrap_err();
        match err {
            StageError::Transport(e) => assert_eq!(e.kind(), std::io::ErrorKind::TimedOut),
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn simulated_link_needs_no_port() {
        let mut link = make_serial_link(LinkType::Simulated, &SerialConfig::default()).unwrap();
        assert_eq!(link.name(), "simulated grbl");
        link.close();
    }
}
