use std::io::{self, ErrorKind, Read, Write};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serialport::{ClearBuffer, SerialPort};

use crate::config::{MAX_AMP_NUM, READ_BUF_SIZE};
use crate::drivers::source::{Amplifier, AmplifierReading, Command};
use crate::drivers::error::LinkError;

const POLL_COMMAND: &str = "M0\r\n";
const FIELD_STRIDE: usize = 8;
const FIELD_OFFSET: usize = 3;
const FIELD_WIDTH: usize = 7;
const MAX_LINE: usize = 64;

pub fn encode_write_all(command: Command, value: &str) -> String {
    format!("AW,{},{}\r\n", command.code(), value)
}

pub fn encode_write_channel(channel: usize, command: Command, value: &str) -> String {
    format!("SW,{:02},{},{}\r\n", channel, command.code(), value)
}

pub fn encode_read_channel(channel: usize, command: Command) -> String {
    format!("SR,{:02},{}\r\n", channel, command.code())
}

/// Shift values go over the wire as `+dd.ddd`.
pub fn format_shift(value: f32) -> String {
    format!("{value:+07.3}")
}

/// Parses an `M0` response frame.
///
/// Head `i` occupies bytes `[8i + 3, 8i + 10)`. A field that does not parse
/// as a finite number fails the whole frame; it is never read as zero.
pub fn parse_frame(frame: &[u8]) -> Result<AmplifierReading, LinkError> {
    let mut values = [0.0f32; MAX_AMP_NUM];
    for (amp, value) in values.iter_mut().enumerate() {
        let start = amp * FIELD_STRIDE + FIELD_OFFSET;
        let parsed = frame
            .get(start..start + FIELD_WIDTH)
            .and_then(|bytes| std::str::from_utf8(bytes).ok())
            .and_then(|text| text.trim().parse::<f32>().ok())
            .filter(|v| v.is_finite());
        match parsed {
            Some(v) => *value = v,
            None => {
                return Err(LinkError::Protocol {
                    field: amp,
                    response: String::from_utf8_lossy(frame).into_owned(),
                })
            }
        }
    }
    Ok(AmplifierReading(values))
}

/// Byte stream the link runs over.
///
/// `discard_input` drops whatever the device has sent but nobody has read yet.
pub trait LinkPort: Read + Write + Send {
    fn discard_input(&mut self) -> io::Result<()>;
}

impl LinkPort for Box<dyn SerialPort> {
    fn discard_input(&mut self) -> io::Result<()> {
        self.clear(ClearBuffer::Input).map_err(io::Error::from)
    }
}

/// Line protocol driver over any byte stream (normally a serial port).
///
/// Pending input is discarded before every command and after every failed
/// read, so a late response never shifts the next frame.
pub struct AmplifierLink<P> {
    port: P,
    timeout: Duration,
    frame: [u8; READ_BUF_SIZE],
}

pub type SerialLink = AmplifierLink<Box<dyn SerialPort>>;

/// Opens the amplifier stack on a serial device.
pub fn open_serial(
    port_name: &str,
    baud_rate: u32,
    timeout: Duration,
) -> Result<SerialLink, LinkError> {
    // Short per-read timeout; the link enforces the overall deadline itself.
    let port = serialport::new(port_name, baud_rate)
        .timeout(timeout.min(Duration::from_millis(20)))
        .open()?;
    info!("Opened amplifier link on {port_name} @ {baud_rate} baud");
    Ok(AmplifierLink::new(port, timeout))
}

pub fn list_ports() -> Vec<String> {
    serialport::available_ports()
        .map(|ports| ports.into_iter().map(|p| p.port_name).collect())
        .unwrap_or_default()
}

impl<P: LinkPort> AmplifierLink<P> {
    pub fn new(port: P, timeout: Duration) -> Self {
        Self {
            port,
            timeout,
            frame: [0; READ_BUF_SIZE],
        }
    }

    #[cfg(test)]
    pub fn into_inner(self) -> P {
        self.port
    }

    fn send(&mut self, line: &str) -> Result<(), LinkError> {
        self.port.discard_input()?;
        debug!("-> {}", line.trim_end());
        self.port.write_all(line.as_bytes())?;
        self.port.flush()?;
        Ok(())
    }

    /// Reads into `frame[..len]` until it is full or the deadline passes.
    /// Returns the number of bytes filled.
    fn fill(&mut self, len: usize, deadline: Instant) -> Result<usize, LinkError> {
        let mut filled = 0;
        while filled < len {
            match self.port.read(&mut self.frame[filled..len]) {
                Ok(n) => filled += n,
                Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
            if filled < len && Instant::now() >= deadline {
                break;
            }
        }
        Ok(filled)
    }

    fn read_frame(&mut self) -> Result<AmplifierReading, LinkError> {
        let deadline = Instant::now() + self.timeout;
        let filled = self.fill(READ_BUF_SIZE, deadline)?;
        let result = if filled < READ_BUF_SIZE {
            Err(LinkError::Timeout(self.timeout))
        } else {
            debug!("<- {}", String::from_utf8_lossy(&self.frame).trim_end());
            parse_frame(&self.frame)
        };
        if result.is_err() {
            let mid_line = filled > 0 && self.frame[filled - 1] != b'\n';
            self.resync(mid_line);
        }
        result
    }

    /// Drops the rest of a broken response. When the failed read stopped
    /// mid-line, the remainder of that line is waited for first.
    fn resync(&mut self, mid_line: bool) {
        if mid_line {
            let deadline = Instant::now() + self.timeout;
            if let Err(e) = self.read_until_newline(deadline) {
                debug!("resync: {e}");
            }
        }
        if let Err(e) = self.port.discard_input() {
            warn!("Could not discard amplifier input: {e}");
        }
    }

    /// Consumes bytes up to and including the next `\n`. Only the first
    /// `MAX_LINE` bytes are kept; the rest of an overlong line is dropped.
    fn read_until_newline(&mut self, deadline: Instant) -> Result<Vec<u8>, LinkError> {
        let mut line = Vec::with_capacity(16);
        let mut byte = [0u8; 1];
        loop {
            match self.port.read(&mut byte) {
                Ok(1) => {
                    if byte[0] == b'\n' {
                        return Ok(line);
                    }
                    if line.len() < MAX_LINE {
                        line.push(byte[0]);
                    }
                    continue;
                }
                Ok(_) => {}
                Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
            if Instant::now() >= deadline {
                return Err(LinkError::Timeout(self.timeout));
            }
        }
    }

    fn read_line(&mut self) -> Result<String, LinkError> {
        let deadline = Instant::now() + self.timeout;
        match self.read_until_newline(deadline) {
            Ok(line) => {
                let text = String::from_utf8_lossy(&line).trim_end().to_owned();
                debug!("<- {text}");
                Ok(text)
            }
            Err(e) => {
                self.resync(false);
                Err(e)
            }
        }
    }
}

impl<P: LinkPort> Amplifier for AmplifierLink<P> {
    fn poll_all(&mut self) -> Result<AmplifierReading, LinkError> {
        self.send(POLL_COMMAND)?;
        self.read_frame()
    }

    fn write_channel(
        &mut self,
        channel: usize,
        command: Command,
        value: &str,
    ) -> Result<(), LinkError> {
        self.send(&encode_write_channel(channel, command, value))?;
        self.read_line().map(drop)
    }

    fn write_all(&mut self, command: Command, value: &str) -> Result<(), LinkError> {
        self.send(&encode_write_all(command, value))?;
        self.read_line().map(drop)
    }

    fn read_channel(&mut self, channel: usize, command: Command) -> Result<String, LinkError> {
        self.send(&encode_read_channel(channel, command))?;
        self.read_line()
    }
}
