//! Serial link abstraction.
//!
//! Reading and writing are split: the acquisition thread owns the
//! [`ByteSource`] exclusively, while commands may come from any thread and go
//! through a [`CommandChannel`] that serializes writers.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use log::debug;
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};

use crate::errors::{DriverError, Result};
use crate::protocol::Command;

/// Timeout applied to the port before acquisition sets its own.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(100);

/// Read half of a transport.
pub trait ByteSource: Send {
    /// Bytes already received and waiting to be read.
    fn bytes_available(&mut self) -> io::Result<usize>;

    /// Read up to `buf.len()` bytes, waiting at most `timeout`.
    ///
    /// A timeout with nothing received returns `Ok(0)`; only hard I/O
    /// failures are errors.
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;

    /// Throw away everything received so far.
    fn discard_input(&mut self) -> io::Result<()> {
        let mut scratch = [0u8; 256];
        while self.bytes_available()? > 0 {
            if self.read(&mut scratch, Duration::ZERO)? == 0 {
                break;
            }
        }
        Ok(())
    }
}

/// Write half of a transport.
pub trait CommandSink: Send {
    fn send_bytes(&mut self, bytes: &[u8]) -> io::Result<()>;
}

impl<W: Write + Send> CommandSink for W {
    fn send_bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.write_all(bytes)?;
        self.flush()
    }
}

/// Single-writer command path to the sensor.
///
/// A failed write latches [`CommandChannel::has_failed`] so the acquisition
/// thread can treat it like a read failure.
pub struct CommandChannel {
    sink: Mutex<Box<dyn CommandSink>>,
    failed: AtomicBool,
}

impl CommandChannel {
    pub fn new(sink: Box<dyn CommandSink>) -> Self {
        Self {
            sink: Mutex::new(sink),
            failed: AtomicBool::new(false),
        }
    }

    pub fn send_raw(&self, bytes: &[u8]) -> Result<()> {
        let mut sink = self
            .sink
            .lock()
            .map_err(|_| DriverError::Command("command channel lock poisoned".into()))?;
        if let Err(e) = sink.send_bytes(bytes) {
            self.failed.store(true, Ordering::Release);
            return Err(e.into());
        }
        Ok(())
    }

    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    pub fn clear_failure(&self) {
        self.failed.store(false, Ordering::Release);
    }

    pub fn send(&self, command: &Command) -> Result<()> {
        debug!("sending command {:?}", command.to_string().trim_end());
        self.send_raw(&command.encode())
    }
}

/// Read half of an opened serial port.
pub struct SerialSource {
    port: Box<dyn SerialPort>,
    timeout: Duration,
}

impl SerialSource {
    pub fn new(port: Box<dyn SerialPort>) -> Self {
        let timeout = port.timeout();
        Self { port, timeout }
    }
}

impl ByteSource for SerialSource {
    fn bytes_available(&mut self) -> io::Result<usize> {
        Ok(self.port.bytes_to_read()? as usize)
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        if timeout != self.timeout {
            self.port.set_timeout(timeout)?;
            self.timeout = timeout;
        }
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn discard_input(&mut self) -> io::Result<()> {
        self.port.clear(ClearBuffer::Input)?;
        Ok(())
    }
}

/// Open a serial port with the eDVS line settings (8N1, RTS/CTS).
///
/// Returns the read half and a cloned handle to use as the command sink.
pub fn open_serial(path: &str, baud_rate: u32) -> Result<(SerialSource, Box<dyn SerialPort>)> {
    let port = serialport::new(path, baud_rate)
        .data_bits(DataBits::Eight)
        .stop_bits(StopBits::One)
        .parity(Parity::None)
        .flow_control(FlowControl::Hardware)
        .timeout(DEFAULT_TIMEOUT)
        .open()?;
    let writer = port.try_clone()?;
    debug!("opened serial port {} at {} baud", path, baud_rate);
    Ok((SerialSource::new(port), writer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct Shared(Arc<Mutex<Vec<u8>>>);

    impl Write for Shared {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct Broken;

    impl Write for Broken {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "unplugged"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn commands_are_written_whole() {
        let out = Shared::default();
        let channel = CommandChannel::new(Box::new(out.clone()));
        channel.send(&Command::StartStreaming).unwrap();
        channel.send(&Command::TimestampReset).unwrap();
        assert_eq!(&*out.0.lock().unwrap(), b"E+\n!ET0\n");
    }

    #[test]
    fn concurrent_writers_do_not_interleave() {
        let out = Shared::default();
        let channel = Arc::new(CommandChannel::new(Box::new(out.clone())));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let channel = Arc::clone(&channel);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        channel.send(&Command::DisableEcho).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let written = out.0.lock().unwrap().clone();
        assert_eq!(written, b"!U0\n".repeat(200));
    }

    #[test]
    fn write_failure_is_reported() {
        let channel = CommandChannel::new(Box::new(Broken));
        assert!(!channel.has_failed());
        let err = channel.send(&Command::StopStreaming).unwrap_err();
        assert!(matches!(err, DriverError::Io(_)));
        assert!(channel.has_failed());

        channel.clear_failure();
        assert!(!channel.has_failed());
    }
}
