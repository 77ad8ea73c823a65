//! Serial transport for a Meshtastic device in text console mode.
//!
//! Outbound payloads are written as `TO:<peer> MSG:<payload>` lines and inbound
//! traffic is read back as `FROM:<peer> MSG:<payload>` lines. Payload newlines
//! and backslashes are escaped so one payload is always one line.

use log::{debug, error, trace, warn};
use serialport::SerialPort;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};

use super::{InboundPacket, Transport, TransportError};

const READ_TIMEOUT: Duration = Duration::from_millis(500);
/// Longest line kept while waiting for a newline; longer garbage is dropped.
const MAX_LINE_BYTES: usize = 4096;

pub struct SerialTransport {
    local_id: String,
    port: Arc<Mutex<Box<dyn SerialPort>>>,
}

impl SerialTransport {
    /// Open `port_name` and start the reader thread. The returned receiver
    /// yields every `FROM:` line the device prints; the thread exits once the
    /// receiver is dropped.
    pub async fn open(
        port_name: &str,
        baud_rate: u32,
        local_id: &str,
    ) -> Result<(Self, mpsc::UnboundedReceiver<InboundPacket>), TransportError> {
        debug!("Opening serial port {} at {} baud", port_name, baud_rate);
        let mut builder = serialport::new(port_name, baud_rate).timeout(READ_TIMEOUT);
        #[cfg(unix)]
        {
            builder = builder
                .data_bits(serialport::DataBits::Eight)
                .stop_bits(serialport::StopBits::One)
                .parity(serialport::Parity::None);
        }
        let mut port = builder.open().map_err(|e| {
            TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("failed to open serial port {}: {}", port_name, e),
            ))
        })?;

        // Toggle DTR/RTS to wake ESP32 based boards
        let _ = port.write_data_terminal_ready(true);
        let _ = port.write_request_to_send(true);
        sleep(Duration::from_millis(150)).await;

        // Drop any buffered boot chatter
        let mut purge_buf = [0u8; 512];
        if let Ok(available) = port.bytes_to_read() {
            if available > 0 {
                let _ = port.read(&mut purge_buf);
            }
        }

        let reader = port.try_clone().map_err(|e| {
            TransportError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
        })?;
        let (tx, rx) = mpsc::unbounded_channel();
        std::thread::Builder::new()
            .name("serial-reader".into())
            .spawn(move || read_loop(reader, tx))?;

        debug!("Serial transport ready on {}", port_name);
        Ok((
            Self {
                local_id: local_id.to_string(),
                port: Arc::new(Mutex::new(port)),
            },
            rx,
        ))
    }
}

impl Transport for SerialTransport {
    fn local_id(&self) -> &str {
        &self.local_id
    }

    fn send(&self, peer_id: &str, payload: &[u8]) -> Result<(), TransportError> {
        let line = format!(
            "TO:{} MSG:{}\n",
            peer_id,
            escape_payload(&String::from_utf8_lossy(payload))
        );
        let mut port = self
            .port
            .lock()
            .map_err(|_| TransportError::Busy("serial port lock poisoned".into()))?;
        port.write_all(line.as_bytes())?;
        port.flush()?;
        trace!("serial -> {}: {} bytes", peer_id, payload.len());
        Ok(())
    }
}

fn read_loop(mut port: Box<dyn SerialPort>, tx: mpsc::UnboundedSender<InboundPacket>) {
    let mut buffer = [0u8; 1024];
    let mut line: Vec<u8> = Vec::new();
    loop {
        if tx.is_closed() {
            debug!("Serial reader stopping: inbound channel closed");
            return;
        }
        match port.read(&mut buffer) {
            Ok(0) => continue,
            Ok(n) => {
                for &byte in &buffer[..n] {
                    if byte != b'\n' {
                        if line.len() < MAX_LINE_BYTES {
                            line.push(byte);
                        }
                        continue;
                    }
                    let text = String::from_utf8_lossy(&line).into_owned();
                    line.clear();
                    if let Some(packet) = parse_line(&text) {
                        if tx.send(packet).is_err() {
                            return;
                        }
                    } else if !text.trim().is_empty() {
                        trace!("serial console: {}", text.trim());
                    }
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!("Serial read error: {}", e);
                return;
            }
        }
    }
}

/// Parse `FROM:<peer> MSG:<payload>`; anything else is console noise.
fn parse_line(raw: &str) -> Option<InboundPacket> {
    let line = raw.trim_end_matches('\r');
    let rest = line.trim_start().strip_prefix("FROM:")?;
    let (from, payload) = rest.split_once(" MSG:")?;
    let from = from.trim();
    if from.is_empty() {
        warn!("Ignoring serial line without sender");
        return None;
    }
    Some(InboundPacket {
        from: from.to_string(),
        payload: unescape_payload(payload).into_bytes(),
    })
}

fn escape_payload(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out
}

fn unescape_payload(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}
