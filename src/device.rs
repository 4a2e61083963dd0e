//! Public device handle.
//!
//! [`Edvs`] ties the transport, the decoder and the acquisition thread
//! together behind the start / stop / next-batch contract.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use edvs_rs::{AcquisitionConfig, Edvs, NoopObserver};
//!
//! let mut config = AcquisitionConfig::default();
//! config.serial.port = "/dev/ttyUSB0".into();
//! config.blocking_pop = true;
//!
//! let mut edvs = Edvs::open(config)?;
//! edvs.start(Arc::new(NoopObserver))?;
//! if let Some(batch) = edvs.next_batch() {
//!     println!("{} pixel events", batch.pixel_count());
//! }
//! edvs.stop()?;
//! # Ok::<(), edvs_rs::DriverError>(())
//! ```

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn, LevelFilter};

use crate::acquisition::{AcquisitionContext, AcquisitionThread};
use crate::batch::EventBatch;
use crate::config::{AcquisitionConfig, EDVS_EVENT_SIZE, SUPPORTED_BAUD_RATES};
use crate::decoder::EventDecoder;
use crate::errors::{DriverError, Result};
use crate::exchange::{AcquisitionObserver, DataExchange, StateFlag, ThreadState};
use crate::logging::SessionLog;
use crate::protocol::{Bias, BiasSet, Command, BANNER_MARKER, DEVICE_NAME};
use crate::transport::{self, ByteSource, CommandChannel, CommandSink};

/// Time given to the firmware to flush out a half-received command.
const DRAIN_TIME: Duration = Duration::from_millis(50);

/// Firmware reboot time after the reset command.
const RESET_DELAY: Duration = Duration::from_millis(400);

/// How long the startup banner is collected for.
const BANNER_TIMEOUT: Duration = Duration::from_millis(100);

/// Delay for the last setup commands to be echoed before input is flushed.
const COMMAND_DELAY: Duration = Duration::from_millis(50);

/// Static description of an opened sensor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub device_id: u16,
    /// `"eDVS4337 ID-<device_id>"`.
    pub device_string: String,
    pub size_x: u16,
    pub size_y: u16,
    pub serial_port: String,
    pub baud_rate: u32,
}

impl DeviceInfo {
    fn from_config(config: &AcquisitionConfig) -> Self {
        Self {
            device_id: config.device_id,
            device_string: format!("{} ID-{}", DEVICE_NAME, config.device_id),
            size_x: config.size_x,
            size_y: config.size_y,
            serial_port: config.serial.port.clone(),
            baud_rate: config.serial.baud_rate,
        }
    }
}

/// Consumer-side handle to the batch queue of one acquisition session.
///
/// Can be moved to another thread; it outlives [`Edvs::stop`] but yields
/// nothing new afterwards.
#[derive(Clone)]
pub struct BatchReceiver {
    exchange: Arc<DataExchange>,
    blocking: bool,
}

impl BatchReceiver {
    /// Next batch, waiting if the session was configured with `blocking_pop`.
    pub fn recv(&self) -> Option<EventBatch> {
        if self.blocking {
            self.exchange.pop_blocking()
        } else {
            self.exchange.pop()
        }
    }

    pub fn try_recv(&self) -> Option<EventBatch> {
        self.exchange.pop()
    }

    /// Batches currently queued.
    pub fn len(&self) -> usize {
        self.exchange.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exchange.is_empty()
    }
}

/// An eDVS4337 sensor.
pub struct Edvs {
    info: DeviceInfo,
    config: AcquisitionConfig,
    commands: Arc<CommandChannel>,
    /// Owned here while idle, by the acquisition thread while running.
    source: Option<Box<dyn ByteSource>>,
    log: Arc<SessionLog>,
    streaming: AtomicBool,
    reset_request: Arc<AtomicBool>,
    read_size: Arc<AtomicUsize>,
    biases: BiasSet,
    state: StateFlag,
    exchange: Option<Arc<DataExchange>>,
    thread: Option<AcquisitionThread>,
}

impl Edvs {
    /// Open the serial port named in `config.serial` and bring the firmware
    /// into event streaming mode (streaming itself stays off).
    pub fn open(config: AcquisitionConfig) -> Result<Self> {
        config.validate()?;
        let port = config.serial.port.clone();
        let baud_rate = config.serial.baud_rate;
        if port.is_empty() {
            return Err(DriverError::Config("no serial port configured".into()));
        }
        if !SUPPORTED_BAUD_RATES.contains(&baud_rate) {
            warn!(
                "baud rate {} is not one of {:?}, the sensor may not answer",
                baud_rate, SUPPORTED_BAUD_RATES
            );
        }

        let (mut source, writer) = transport::open_serial(&port, baud_rate)?;
        let commands = CommandChannel::new(Box::new(writer));
        let log = SessionLog::new(
            DeviceInfo::from_config(&config).device_string,
            config.log_filter(),
        );

        let banner = handshake(&mut source, &commands, &log)?;
        debug!("{} on {} answered with '{}'", log.device(), port, banner);

        Ok(Self::assemble(Box::new(source), commands, config, log))
    }

    /// Wrap an already opened transport. No handshake is performed.
    pub fn from_transport(
        source: Box<dyn ByteSource>,
        sink: Box<dyn CommandSink>,
        config: AcquisitionConfig,
    ) -> Result<Self> {
        config.validate()?;
        let log = SessionLog::new(
            DeviceInfo::from_config(&config).device_string,
            config.log_filter(),
        );
        Ok(Self::assemble(source, CommandChannel::new(sink), config, log))
    }

    fn assemble(
        source: Box<dyn ByteSource>,
        commands: CommandChannel,
        config: AcquisitionConfig,
        log: SessionLog,
    ) -> Self {
        Self {
            info: DeviceInfo::from_config(&config),
            read_size: Arc::new(AtomicUsize::new(config.read_size)),
            config,
            commands: Arc::new(commands),
            source: Some(source),
            log: Arc::new(log),
            streaming: AtomicBool::new(false),
            reset_request: Arc::new(AtomicBool::new(false)),
            biases: BiasSet::default(),
            state: StateFlag::new(),
            exchange: None,
            thread: None,
        }
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn config(&self) -> &AcquisitionConfig {
        &self.config
    }

    /// State of the current (or last) acquisition thread.
    pub fn state(&self) -> ThreadState {
        self.state.get()
    }

    pub fn is_running(&self) -> bool {
        self.state.is_running()
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::Acquire)
    }

    pub fn log_level(&self) -> LevelFilter {
        self.log.level()
    }

    pub fn set_log_level(&self, level: LevelFilter) {
        self.log.set_level(level);
    }

    /// Send a command to the firmware. Safe to call while acquisition runs.
    pub fn send(&self, command: &Command) -> Result<()> {
        self.commands.send(command)
    }

    /// Send a raw, already terminated firmware command.
    pub fn send_raw(&self, bytes: &[u8]) -> Result<()> {
        self.commands.send_raw(bytes)
    }

    /// Switch event streaming on or off. Nothing is sent if the sensor is
    /// already in the requested state.
    pub fn set_streaming(&self, enabled: bool) -> Result<()> {
        if self.streaming.swap(enabled, Ordering::AcqRel) == enabled {
            return Ok(());
        }
        let command = if enabled {
            Command::StartStreaming
        } else {
            Command::StopStreaming
        };
        if let Err(e) = self.commands.send(&command) {
            self.streaming.store(!enabled, Ordering::Release);
            return Err(e);
        }
        Ok(())
    }

    /// Request a timestamp reset. It is applied, and sent to the sensor, when
    /// the next frame is decoded.
    pub fn reset_timestamps(&self) {
        self.log.debug(format_args!("timestamp reset requested"));
        self.reset_request.store(true, Ordering::Release);
    }

    pub fn bias(&self, bias: Bias) -> u32 {
        self.biases.get(bias)
    }

    pub fn biases(&self) -> &BiasSet {
        &self.biases
    }

    /// Store and program a single bias. Values are truncated to 24 bits.
    pub fn set_bias(&mut self, bias: Bias, value: u32) -> Result<()> {
        self.biases.set(bias, value);
        for command in self.biases.commands(Some(bias)) {
            self.commands.send(&command)?;
        }
        Ok(())
    }

    /// Program every bias with the stored values (the DVS128 "fast" set
    /// unless changed through [`Edvs::set_bias`]).
    pub fn send_default_config(&self) -> Result<()> {
        for command in self.biases.commands(None) {
            self.commands.send(&command)?;
        }
        Ok(())
    }

    /// Change the maximum number of bytes fetched per read. Takes effect on
    /// the next read of a running session.
    pub fn set_read_size(&mut self, read_size: usize) -> Result<()> {
        if read_size < EDVS_EVENT_SIZE {
            return Err(DriverError::Config(format!(
                "read_size must hold at least one {EDVS_EVENT_SIZE}-byte frame, got {read_size}"
            )));
        }
        self.config.read_size = read_size;
        self.read_size.store(read_size, Ordering::Relaxed);
        Ok(())
    }

    /// Allocate the queue and the first batch, launch the acquisition thread
    /// and, with `auto_run`, switch streaming on.
    pub fn start(&mut self, observer: Arc<dyn AcquisitionObserver>) -> Result<()> {
        if self.thread.is_some() {
            return Err(DriverError::AlreadyRunning);
        }
        let source = self.source.take().ok_or_else(|| {
            DriverError::NotReady("transport was lost when a previous session failed".into())
        })?;
        self.commands.clear_failure();

        let state = StateFlag::new();
        let exchange = Arc::new(DataExchange::new(
            self.config.queue_capacity,
            self.config.backpressure,
            state.clone(),
            Arc::clone(&observer),
        ));

        let mut decoder = EventDecoder::new(&self.config, Arc::clone(&self.log))
            .with_commands(Arc::clone(&self.commands))
            .with_reset_flag(Arc::clone(&self.reset_request));
        if let Err(e) = decoder.allocate() {
            self.source = Some(source);
            return Err(e);
        }

        let thread = AcquisitionThread::spawn(AcquisitionContext {
            source,
            decoder,
            exchange: Arc::clone(&exchange),
            commands: Arc::clone(&self.commands),
            state: state.clone(),
            read_size: Arc::clone(&self.read_size),
            observer,
            log: Arc::clone(&self.log),
        })?;

        self.state = state;
        self.exchange = Some(exchange);
        self.thread = Some(thread);
        self.log.info(format_args!(
            "acquisition started (queue {}, {:?})",
            self.config.queue_capacity, self.config.backpressure
        ));

        if self.config.auto_run {
            if let Err(e) = self.set_streaming(true) {
                self.log.error(format_args!("failed to start streaming: {e}"));
                if let Err(stop_err) = self.stop() {
                    self.log.warn(format_args!("cleanup after failed start: {stop_err}"));
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Stop streaming (with `auto_stop`), end the acquisition thread and drop
    /// every queued batch. Does nothing if acquisition is not running.
    pub fn stop(&mut self) -> Result<()> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };

        if self.config.auto_stop {
            if let Err(e) = self.set_streaming(false) {
                self.log.warn(format_args!("failed to stop streaming: {e}"));
            }
        }

        self.source = thread.stop();

        if let Some(exchange) = self.exchange.take() {
            let dropped = exchange.clear();
            if dropped > 0 {
                self.log.debug(format_args!("dropped {dropped} unread batches"));
            }
        }
        self.log.info(format_args!("acquisition stopped"));

        if self.source.is_none() {
            return Err(DriverError::NotReady("acquisition thread panicked".into()));
        }
        Ok(())
    }

    /// Next sealed batch, or `None` if nothing is queued (after waiting, with
    /// `blocking_pop`) or acquisition is stopped.
    pub fn next_batch(&self) -> Option<EventBatch> {
        let exchange = self.exchange.as_ref()?;
        if self.config.blocking_pop {
            exchange.pop_blocking()
        } else {
            exchange.pop()
        }
    }

    /// Queue handle for a consumer on another thread.
    pub fn batch_receiver(&self) -> Option<BatchReceiver> {
        self.exchange.as_ref().map(|exchange| BatchReceiver {
            exchange: Arc::clone(exchange),
            blocking: self.config.blocking_pop,
        })
    }
}

impl Drop for Edvs {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            self.log.warn(format_args!("error while closing: {e}"));
        }
    }
}

/// Collect whatever arrives within `window`.
fn read_for(source: &mut dyn ByteSource, window: Duration) -> io::Result<Vec<u8>> {
    let mut received = Vec::new();
    let mut buf = [0u8; 256];
    let deadline = Instant::now() + window;

    loop {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        let n = source.read(&mut buf, deadline - now)?;
        received.extend_from_slice(&buf[..n]);
    }
    Ok(received)
}

/// Reboot the firmware, check its banner and select the event format.
///
/// Returns the banner with non-printable characters blanked out.
pub(crate) fn handshake(
    source: &mut dyn ByteSource,
    commands: &CommandChannel,
    log: &SessionLog,
) -> Result<String> {
    source.discard_input()?;
    commands.send(&Command::Newline)?;
    read_for(source, DRAIN_TIME)?;
    source.discard_input()?;

    commands.send(&Command::Reset)?;
    thread::sleep(RESET_DELAY);
    let raw = read_for(source, BANNER_TIMEOUT)?;

    let banner: String = String::from_utf8_lossy(&raw)
        .chars()
        .map(|c| if c.is_ascii_graphic() { c } else { ' ' })
        .collect();
    let banner = banner.trim().to_string();
    log.info(format_args!("startup message: {banner}"));

    if !banner.contains(BANNER_MARKER) {
        return Err(DriverError::Protocol(format!("no eDVS startup message, got '{banner}'")));
    }

    commands.send(&Command::DisableEcho)?;
    commands.send(&Command::EventFormat)?;
    thread::sleep(COMMAND_DELAY);
    source.discard_input()?;
    Ok(banner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io::Write;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct Written(Arc<Mutex<Vec<u8>>>);

    impl Write for Written {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Answers the reset command with `banner`, nothing otherwise.
    struct Firmware {
        written: Written,
        banner: &'static [u8],
        pending: VecDeque<u8>,
        answered: bool,
    }

    impl Firmware {
        fn poll(&mut self) {
            let written = self.written.0.lock().unwrap();
            if !self.answered && written.ends_with(b"R\n") {
                self.pending.extend(self.banner.iter().copied());
                self.answered = true;
            }
        }
    }

    impl ByteSource for Firmware {
        fn bytes_available(&mut self) -> io::Result<usize> {
            self.poll();
            Ok(self.pending.len())
        }

        fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
            self.poll();
            if self.pending.is_empty() {
                thread::sleep(timeout.min(Duration::from_millis(1)));
                return Ok(0);
            }
            let n = buf.len().min(self.pending.len());
            for (slot, byte) in buf.iter_mut().zip(self.pending.drain(..n)) {
                *slot = byte;
            }
            Ok(n)
        }
    }

    fn run_handshake(banner: &'static [u8]) -> (Result<String>, Vec<u8>) {
        let written = Written::default();
        let mut firmware = Firmware {
            written: written.clone(),
            banner,
            pending: VecDeque::new(),
            answered: false,
        };
        let commands = CommandChannel::new(Box::new(written.clone()));
        let log = SessionLog::new("eDVS4337 ID-0", LevelFilter::Off);
        let result = handshake(&mut firmware, &commands, &log);
        let sent = written.0.lock().unwrap().clone();
        (result, sent)
    }

    #[test]
    fn handshake_accepts_banner() {
        let (result, sent) = run_handshake(b"\r\nEDVS-4337, V2.1\r\n\x00");
        assert_eq!(result.unwrap(), "EDVS-4337, V2.1");
        assert_eq!(sent, b"\nR\n!U0\n!E2\n");
    }

    #[test]
    fn handshake_rejects_silence() {
        let (result, sent) = run_handshake(b"");
        assert!(matches!(result, Err(DriverError::Protocol(_))));
        assert_eq!(sent, b"\nR\n");
    }

    fn device(config: AcquisitionConfig) -> (Edvs, Written) {
        let written = Written::default();
        let firmware = Firmware {
            written: written.clone(),
            banner: b"",
            pending: VecDeque::new(),
            answered: true,
        };
        let edvs = Edvs::from_transport(Box::new(firmware), Box::new(written.clone()), config)
            .unwrap();
        (edvs, written)
    }

    #[test]
    fn device_string_carries_id() {
        let config = AcquisitionConfig {
            device_id: 3,
            ..Default::default()
        };
        let (edvs, _) = device(config);
        assert_eq!(edvs.info().device_string, "eDVS4337 ID-3");
        assert_eq!(edvs.info().size_x, 128);
        assert_eq!(edvs.state(), ThreadState::Idle);
        assert!(edvs.next_batch().is_none());
        assert!(edvs.batch_receiver().is_none());
    }

    #[test]
    fn streaming_commands_only_on_change() {
        let (edvs, written) = device(AcquisitionConfig::default());
        edvs.set_streaming(true).unwrap();
        edvs.set_streaming(true).unwrap();
        edvs.set_streaming(false).unwrap();
        edvs.set_streaming(false).unwrap();
        assert_eq!(&*written.0.lock().unwrap(), b"E+\nE-\n");
    }

    #[test]
    fn set_bias_programs_and_flushes() {
        let (mut edvs, written) = device(AcquisitionConfig::default());
        edvs.set_bias(Bias::Refr, 1000).unwrap();
        assert_eq!(edvs.bias(Bias::Refr), 1000);
        assert_eq!(&*written.0.lock().unwrap(), b"!B6=1000\n!BF\n");
    }

    #[test]
    fn default_config_programs_every_bias() {
        let (edvs, written) = device(AcquisitionConfig::default());
        edvs.send_default_config().unwrap();
        let text = String::from_utf8(written.0.lock().unwrap().clone()).unwrap();
        assert_eq!(text.lines().count(), 13);
        assert!(text.starts_with("!B0=1992\n"));
        assert!(text.ends_with("!B11=217\n!BF\n"));
    }

    #[test]
    fn read_size_must_fit_a_frame() {
        let (mut edvs, _) = device(AcquisitionConfig::default());
        assert!(matches!(edvs.set_read_size(3), Err(DriverError::Config(_))));
        edvs.set_read_size(256).unwrap();
        assert_eq!(edvs.config().read_size, 256);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let written = Written::default();
        let firmware = Firmware {
            written: written.clone(),
            banner: b"",
            pending: VecDeque::new(),
            answered: true,
        };
        let config = AcquisitionConfig {
            queue_capacity: 0,
            ..Default::default()
        };
        let result = Edvs::from_transport(Box::new(firmware), Box::new(written), config);
        assert!(matches!(result, Err(DriverError::Config(_))));
    }

    #[test]
    fn open_without_port_fails() {
        let result = Edvs::open(AcquisitionConfig::default());
        assert!(matches!(result, Err(DriverError::Config(_))));
    }

    #[test]
    fn double_start_is_refused() {
        let (mut edvs, written) = device(AcquisitionConfig::default());
        edvs.start(Arc::new(crate::exchange::NoopObserver)).unwrap();
        assert!(edvs.is_running());
        assert!(matches!(
            edvs.start(Arc::new(crate::exchange::NoopObserver)),
            Err(DriverError::AlreadyRunning)
        ));
        edvs.stop().unwrap();
        assert_eq!(edvs.state(), ThreadState::Exited);
        assert!(!edvs.is_streaming());
        assert_eq!(&*written.0.lock().unwrap(), b"E+\nE-\n");

        // The transport is handed back, so a second session works.
        edvs.start(Arc::new(crate::exchange::NoopObserver)).unwrap();
        edvs.stop().unwrap();
    }
}
