use crate::config::{DataBits, FlowControl, Parity, SerialSettings, READ_TIMEOUT};
use crate::dispatch::Dispatcher;
use crate::telegram::{self, DecodeError, Telegram, TelegramFramer};
use chrono::{DateTime, Utc};
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::time::sleep;
use tokio_serial::SerialPortBuilderExt;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("no data from meter for {0:?}")]
    ReadTimeout(Duration),
    #[error("meter device closed the stream")]
    Closed,
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Streaming,
}

/// Exponential reconnect delay, doubling from `initial` up to `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let max = max.max(initial);
        Self {
            initial,
            max,
            current: initial,
        }
    }

    pub fn next(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

pub trait DeviceOpener {
    type Device: AsyncRead + Unpin;

    fn describe(&self) -> String;

    fn open(&self) -> io::Result<Self::Device>;
}

pub struct SerialOpener {
    settings: SerialSettings,
}

impl SerialOpener {
    pub fn new(settings: SerialSettings) -> Self {
        Self { settings }
    }
}

impl DeviceOpener for SerialOpener {
    type Device = tokio_serial::SerialStream;

    fn describe(&self) -> String {
        format!(
            "{} at {}bps ({:?} parity, {:?} bits, {:?} flow control)",
            self.settings.port,
            self.settings.baud_rate,
            self.settings.parity,
            self.settings.data_bits,
            self.settings.flow_control
        )
    }

    fn open(&self) -> io::Result<Self::Device> {
        let data_bits = match self.settings.data_bits {
            DataBits::Seven => tokio_serial::DataBits::Seven,
            DataBits::Eight => tokio_serial::DataBits::Eight,
        };
        let parity = match self.settings.parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::Even => tokio_serial::Parity::Even,
        };
        let flow_control = match self.settings.flow_control {
            FlowControl::None => tokio_serial::FlowControl::None,
            FlowControl::Hardware => tokio_serial::FlowControl::Hardware,
            FlowControl::Software => tokio_serial::FlowControl::Software,
        };
        let stream = tokio_serial::new(self.settings.port.as_str(), self.settings.baud_rate)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(flow_control)
            .timeout(READ_TIMEOUT)
            .open_native_async()?;
        Ok(stream)
    }
}

/// Continuous telegram reader over a reopenable device. Any read failure
/// drops the device and reopens it after the backoff delay; the loop itself
/// never returns.
pub struct SerialSource<O> {
    opener: O,
    backoff: Backoff,
    read_timeout: Duration,
    state: LinkState,
}

impl<O: DeviceOpener> SerialSource<O> {
    pub fn new(opener: O, backoff: Backoff) -> Self {
        Self {
            opener,
            backoff,
            read_timeout: READ_TIMEOUT,
            state: LinkState::Disconnected,
        }
    }

    #[cfg(test)]
    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    #[cfg(test)]
    pub fn state(&self) -> LinkState {
        self.state
    }

    fn transition(&mut self, next: LinkState) {
        if self.state != next {
            tracing::debug!(from = ?self.state, to = ?next, "meter link state changed");
            self.state = next;
        }
    }

    pub async fn run(&mut self, dispatcher: &mut Dispatcher) {
        tracing::info!(device = %self.opener.describe(), "reading telegrams from serial device");
        loop {
            self.transition(LinkState::Connecting);
            let err = match self.opener.open() {
                Ok(device) => {
                    self.transition(LinkState::Streaming);
                    self.stream(device, dispatcher).await
                }
                Err(err) => SourceError::Io(err),
            };
            self.transition(LinkState::Disconnected);

            let delay = self.backoff.next();
            tracing::warn!(
                device = %self.opener.describe(),
                error = %err,
                retry_in_ms = delay.as_millis() as u64,
                "meter link failed; reconnecting"
            );
            sleep(delay).await;
        }
    }

    async fn stream(&mut self, device: O::Device, dispatcher: &mut Dispatcher) -> SourceError {
        let mut reader = BufReader::new(device);
        let mut framer = TelegramFramer::new();
        let mut line = Vec::with_capacity(128);
        loop {
            line.clear();
            let read =
                tokio::time::timeout(self.read_timeout, reader.read_until(b'\n', &mut line)).await;
            match read {
                Err(_) => return SourceError::ReadTimeout(self.read_timeout),
                Ok(Err(err)) => return SourceError::Io(err),
                Ok(Ok(0)) => return SourceError::Closed,
                Ok(Ok(_)) => {}
            }

            let Some(text) = framer.push_line(&String::from_utf8_lossy(&line)) else {
                continue;
            };
            match telegram::decode(&text, true) {
                Ok(telegram) => {
                    dispatcher.dispatch(&telegram);
                    self.backoff.reset();
                }
                Err(err) => tracing::warn!(error = %err, "discarding telegram"),
            }
        }
    }
}

/// Re-reads a captured telegram from disk once per wall-clock second.
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub async fn read_once(&self) -> Result<Telegram, SourceError> {
        let contents = tokio::fs::read_to_string(&self.path).await?;
        Ok(telegram::decode(&normalize_lines(&contents), false)?)
    }

    pub async fn run(&mut self, dispatcher: &mut Dispatcher) {
        tracing::info!(path = %self.path.display(), "reading telegrams from file");
        loop {
            match self.read_once().await {
                Ok(telegram) => {
                    dispatcher.dispatch(&telegram);
                }
                Err(err) => {
                    tracing::warn!(path = %self.path.display(), error = %err, "failed to read telegram file");
                }
            }
            sleep(until_next_second(Utc::now())).await;
        }
    }
}

/// Strips trailing whitespace from every line and terminates each with CRLF.
pub fn normalize_lines(contents: &str) -> String {
    let mut out = String::with_capacity(contents.len() + 64);
    for line in contents.lines() {
        out.push_str(line.trim_end());
        out.push_str("\r\n");
    }
    out
}

pub fn until_next_second(now: DateTime<Utc>) -> Duration {
    let nanos = now.timestamp_subsec_nanos().min(999_999_999);
    Duration::from_nanos(u64::from(1_000_000_000 - nanos))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Clock;
    use crate::sinks::{Sink, SinkError};
    use crate::telegram::tests::SAMPLE_TELEGRAM;
    use chrono::TimeZone;
    use std::cell::Cell;
    use std::io::{Cursor, Write};
    use std::pin::Pin;
    use std::rc::Rc;
    use std::task::{Context, Poll};
    use tempfile::NamedTempFile;
    use tokio::io::ReadBuf;

    struct FixedClock;

    impl Clock for FixedClock {
        fn now_unix(&self) -> i64 {
            0
        }
    }

    struct CountingSink(Rc<Cell<usize>>);

    impl Sink for CountingSink {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn is_active(&self) -> bool {
            true
        }

        fn process(&mut self, _timestamp: i64, _telegram: &Telegram) -> Result<(), SinkError> {
            self.0.set(self.0.get() + 1);
            Ok(())
        }
    }

    fn counting_dispatcher() -> (Dispatcher, Rc<Cell<usize>>) {
        let count = Rc::new(Cell::new(0));
        let mut dispatcher = Dispatcher::new(Box::new(FixedClock));
        dispatcher.register(Box::new(CountingSink(count.clone())));
        (dispatcher, count)
    }

    /// Fails on the first open, then replays the sample telegram.
    struct FlakyOpener {
        opens: Cell<usize>,
    }

    impl DeviceOpener for FlakyOpener {
        type Device = Cursor<Vec<u8>>;

        fn describe(&self) -> String {
            "flaky".to_string()
        }

        fn open(&self) -> io::Result<Self::Device> {
            let attempt = self.opens.get();
            self.opens.set(attempt + 1);
            if attempt == 0 {
                return Err(io::Error::new(io::ErrorKind::NotFound, "no such device"));
            }
            let mut bytes = b"1-0:1.7.0(00.100*kW)\r\n!FFFF\r\n".to_vec();
            bytes.extend_from_slice(SAMPLE_TELEGRAM.as_bytes());
            Ok(Cursor::new(bytes))
        }
    }

    #[test]
    fn backoff_doubles_up_to_max_and_resets() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(5));
        let delays: Vec<u64> = (0..5).map(|_| backoff.next().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 5, 5]);
        backoff.reset();
        assert_eq!(backoff.next(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn reconnects_after_open_failure_and_eof() {
        let (mut dispatcher, count) = counting_dispatcher();
        let opener = FlakyOpener {
            opens: Cell::new(0),
        };
        let mut source = SerialSource::new(
            opener,
            Backoff::new(Duration::from_millis(1), Duration::from_millis(5)),
        );
        assert_eq!(source.state(), LinkState::Disconnected);

        let outcome =
            tokio::time::timeout(Duration::from_millis(200), source.run(&mut dispatcher)).await;
        assert!(outcome.is_err(), "serial loop never returns");
        assert!(source.opener.opens.get() >= 3);
        assert!(count.get() >= 1);
    }

    /// Replays its bytes, then either fails the read or reports EOF.
    struct ScriptedDevice {
        data: Cursor<Vec<u8>>,
        fail_when_drained: bool,
    }

    impl AsyncRead for ScriptedDevice {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            let drained = self.data.position() >= self.data.get_ref().len() as u64;
            if drained && self.fail_when_drained {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "serial line dropped",
                )));
            }
            Pin::new(&mut self.data).poll_read(cx, buf)
        }
    }

    /// First device breaks halfway through a telegram; later ones deliver a
    /// complete telegram.
    struct MidReadFailureOpener {
        opens: Cell<usize>,
        dispatched_at_reopen: Rc<Cell<usize>>,
        dispatched: Rc<Cell<usize>>,
    }

    impl DeviceOpener for MidReadFailureOpener {
        type Device = ScriptedDevice;

        fn describe(&self) -> String {
            "mid-read failure".to_string()
        }

        fn open(&self) -> io::Result<Self::Device> {
            let attempt = self.opens.get();
            self.opens.set(attempt + 1);
            if attempt == 0 {
                return Ok(ScriptedDevice {
                    data: Cursor::new(SAMPLE_TELEGRAM.as_bytes()[..200].to_vec()),
                    fail_when_drained: true,
                });
            }
            if attempt == 1 {
                self.dispatched_at_reopen.set(self.dispatched.get());
            }
            Ok(ScriptedDevice {
                data: Cursor::new(SAMPLE_TELEGRAM.as_bytes().to_vec()),
                fail_when_drained: false,
            })
        }
    }

    #[tokio::test]
    async fn read_error_mid_telegram_reopens_device() {
        let (mut dispatcher, count) = counting_dispatcher();
        let dispatched_at_reopen = Rc::new(Cell::new(usize::MAX));
        let opener = MidReadFailureOpener {
            opens: Cell::new(0),
            dispatched_at_reopen: dispatched_at_reopen.clone(),
            dispatched: count.clone(),
        };
        let mut source = SerialSource::new(
            opener,
            Backoff::new(Duration::from_millis(1), Duration::from_millis(5)),
        );

        let outcome =
            tokio::time::timeout(Duration::from_millis(200), source.run(&mut dispatcher)).await;
        assert!(outcome.is_err());
        assert!(source.opener.opens.get() >= 2);
        // the broken half telegram was never dispatched
        assert_eq!(dispatched_at_reopen.get(), 0);
        assert!(count.get() >= 1);
    }

    struct DuplexOpener;

    impl DeviceOpener for DuplexOpener {
        type Device = tokio::io::DuplexStream;

        fn describe(&self) -> String {
            "duplex".to_string()
        }

        fn open(&self) -> io::Result<Self::Device> {
            Err(io::Error::new(io::ErrorKind::Other, "opened by the test"))
        }
    }

    #[tokio::test]
    async fn silent_link_times_out() {
        let (mut dispatcher, count) = counting_dispatcher();
        let mut source = SerialSource::new(
            DuplexOpener,
            Backoff::new(Duration::from_millis(1), Duration::from_millis(5)),
        )
        .with_read_timeout(Duration::from_millis(20));

        let (device, _peer) = tokio::io::duplex(64);
        let err = source.stream(device, &mut dispatcher).await;
        assert!(matches!(err, SourceError::ReadTimeout(_)));
        assert_eq!(count.get(), 0);
    }

    #[tokio::test]
    async fn bad_checksum_is_skipped_without_dropping_the_link() {
        let (mut dispatcher, count) = counting_dispatcher();
        let mut source = SerialSource::new(
            DuplexOpener,
            Backoff::new(Duration::from_millis(1), Duration::from_millis(5)),
        );

        let (device, mut peer) = tokio::io::duplex(4096);
        let corrupted = SAMPLE_TELEGRAM.replace("!0281", "!0000");
        let payload = format!("{corrupted}{SAMPLE_TELEGRAM}");
        tokio::io::AsyncWriteExt::write_all(&mut peer, payload.as_bytes())
            .await
            .unwrap();
        drop(peer);

        let err = source.stream(device, &mut dispatcher).await;
        assert!(matches!(err, SourceError::Closed));
        assert_eq!(count.get(), 1);
    }

    #[tokio::test]
    async fn file_source_normalizes_and_decodes() {
        let mut file = NamedTempFile::new().unwrap();
        let unix_text = SAMPLE_TELEGRAM.replace("\r\n", "  \n");
        file.write_all(unix_text.as_bytes()).unwrap();

        let source = FileSource::new(file.path().to_path_buf());
        let telegram = source.read_once().await.unwrap();
        assert_eq!(telegram.len(), 17);

        let missing = FileSource::new(file.path().with_extension("missing"));
        assert!(matches!(
            missing.read_once().await,
            Err(SourceError::Io(_))
        ));
    }

    #[test]
    fn normalize_lines_rewrites_line_endings() {
        assert_eq!(normalize_lines("/A \n1-0:1.7.0(1*kW)\t\r\n!"), "/A\r\n1-0:1.7.0(1*kW)\r\n!\r\n");
    }

    #[test]
    fn sleeps_until_next_whole_second() {
        let now = Utc.timestamp_opt(1_686_823_500, 250_000_000).unwrap();
        assert_eq!(until_next_second(now), Duration::from_millis(750));
        let aligned = Utc.timestamp_opt(1_686_823_500, 0).unwrap();
        assert_eq!(until_next_second(aligned), Duration::from_secs(1));
    }
}
