//! Serial shutter-release controller
//!
//! The external shutter-release accessory speaks a tiny half-duplex protocol:
//! the host writes one command byte and the accessory echoes a fixed word.
//!
//! | Command | Byte  | Echo      |
//! |---------|-------|-----------|
//! | open    | `'O'` | `"open"`  |
//! | close   | `'C'` | `"close"` |
//!
//! The link is noisy, so every command is retried under a [`RetryPolicy`]
//! (10 attempts, 250 ms apart by default). A short read, a short write, an
//! I/O error or a wrong echo all count as a failed attempt.
//!
//! Blocking port I/O runs on tokio's blocking pool; the transport sits behind
//! an `Arc<tokio::sync::Mutex<..>>` so each attempt can move a handle into
//! `spawn_blocking`.

use std::io;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[cfg(feature = "instrument_serial")]
use crate::config::SerialSettings;
use crate::error::{AppResult, CaptureError};
use crate::error_recovery::{retry_with_policy, RetryPolicy};

/// Command byte that opens the shutter.
pub const OPEN_COMMAND: u8 = b'O';
/// Echo expected after [`OPEN_COMMAND`].
pub const OPEN_RESPONSE: &[u8] = b"open";
/// Command byte that closes the shutter.
pub const CLOSE_COMMAND: u8 = b'C';
/// Echo expected after [`CLOSE_COMMAND`].
pub const CLOSE_RESPONSE: &[u8] = b"close";

/// Byte-level link to the shutter-release accessory.
///
/// All methods block; [`ShutterController`] only calls them from the
/// blocking pool.
pub trait ShutterTransport: Send {
    /// Open and configure the link.
    fn open(&mut self) -> io::Result<()>;

    /// Write exactly one byte.
    fn write_byte(&mut self, byte: u8) -> io::Result<()>;

    /// Read up to `len` bytes within the link's read deadline. Returns fewer
    /// bytes when the deadline passes first.
    fn read_response(&mut self, len: usize) -> io::Result<Vec<u8>>;

    /// Close the link.
    fn close(&mut self) -> io::Result<()>;
}

type SharedTransport = Arc<Mutex<Box<dyn ShutterTransport>>>;

#[derive(Debug, Error)]
enum AttemptError {
    #[error("{0}")]
    Io(#[from] io::Error),
    #[error("expected {expected:?}, got {got:?}")]
    Mismatch { expected: String, got: String },
}

/// Sends shutter commands over a [`ShutterTransport`] with bounded retry.
pub struct ShutterController {
    transport: SharedTransport,
    policy: RetryPolicy,
    session_open: bool,
}

impl ShutterController {
    /// Controller over `transport`; the session starts closed.
    pub fn new(transport: Box<dyn ShutterTransport>, policy: RetryPolicy) -> Self {
        Self {
            transport: Arc::new(Mutex::new(transport)),
            policy,
            session_open: false,
        }
    }

    /// Controller over a real serial port described by `settings`.
    #[cfg(feature = "instrument_serial")]
    pub fn serial(settings: &SerialSettings) -> Self {
        Self::new(
            Box::new(SerialPortTransport::new(settings.clone())),
            settings.retry_policy(),
        )
    }

    /// Retry policy applied to every command.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Whether [`ShutterController::open_session`] has run without a close since.
    pub fn is_session_open(&self) -> bool {
        self.session_open
    }

    /// Open the serial session. Opening an open session is a no-op.
    pub async fn open_session(&mut self) -> AppResult<()> {
        if self.session_open {
            return Ok(());
        }
        let transport = self.transport.clone();
        tokio::task::spawn_blocking(move || transport.blocking_lock().open())
            .await
            .map_err(|e| io::Error::other(format!("serial open task failed: {e}")))??;
        self.session_open = true;
        info!("Shutter release session opened");
        Ok(())
    }

    /// Close the serial session. The port is closed at most once.
    pub async fn close_session(&mut self) -> AppResult<()> {
        if !self.session_open {
            return Ok(());
        }
        self.session_open = false;
        let transport = self.transport.clone();
        tokio::task::spawn_blocking(move || transport.blocking_lock().close())
            .await
            .map_err(|e| io::Error::other(format!("serial close task failed: {e}")))??;
        info!("Shutter release session closed");
        Ok(())
    }

    /// Write `code` and wait for `expected`, retrying under the policy.
    ///
    /// Returns the number of attempts made.
    pub async fn send_command(&self, code: u8, expected: &'static [u8]) -> AppResult<u32> {
        if !self.session_open {
            return Err(CaptureError::SerialPortNotOpen);
        }
        let command = char::from(code);
        let label = format!("shutter command '{command}'");

        let outcome = retry_with_policy(&self.policy, &label, |attempt| {
            let transport = self.transport.clone();
            async move {
                let got = tokio::task::spawn_blocking(move || -> io::Result<Vec<u8>> {
                    let mut port = transport.blocking_lock();
                    port.write_byte(code)?;
                    port.read_response(expected.len())
                })
                .await
                .map_err(|e| io::Error::other(format!("serial task failed: {e}")))??;

                if got == expected {
                    Ok(())
                } else {
                    debug!("'{}' attempt {}: unexpected echo {:?}", command, attempt, got);
                    Err(AttemptError::Mismatch {
                        expected: String::from_utf8_lossy(expected).into_owned(),
                        got: String::from_utf8_lossy(&got).into_owned(),
                    })
                }
            }
        })
        .await;

        match outcome {
            Ok(done) => Ok(done.attempts),
            Err(exhausted) => Err(CaptureError::DeviceNotResponding {
                command,
                attempts: exhausted.attempts,
            }),
        }
    }

    /// Open the shutter. Returns the number of attempts made.
    pub async fn open_shutter(&self) -> AppResult<u32> {
        self.send_command(OPEN_COMMAND, OPEN_RESPONSE).await
    }

    /// Close the shutter. Returns the number of attempts made.
    pub async fn close_shutter(&self) -> AppResult<u32> {
        self.send_command(CLOSE_COMMAND, CLOSE_RESPONSE).await
    }
}

impl Drop for ShutterController {
    fn drop(&mut self) {
        if !self.session_open {
            return;
        }
        self.session_open = false;
        match self.transport.try_lock() {
            Ok(mut port) => {
                if let Err(err) = port.close() {
                    warn!("Failed to close shutter release port: {}", err);
                }
            }
            Err(_) => warn!("Shutter release port busy during drop; not closed"),
        }
    }
}

impl std::fmt::Debug for ShutterController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutterController")
            .field("policy", &self.policy)
            .field("session_open", &self.session_open)
            .finish()
    }
}

/// [`ShutterTransport`] over a real serial port.
#[cfg(feature = "instrument_serial")]
pub struct SerialPortTransport {
    settings: SerialSettings,
    port: Option<Box<dyn serialport::SerialPort>>,
}

#[cfg(feature = "instrument_serial")]
impl SerialPortTransport {
    /// Transport for `settings`; the port opens with the session.
    pub fn new(settings: SerialSettings) -> Self {
        Self {
            settings,
            port: None,
        }
    }

    fn port(&mut self) -> io::Result<&mut Box<dyn serialport::SerialPort>> {
        self.port
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "serial port not open"))
    }
}

#[cfg(feature = "instrument_serial")]
impl ShutterTransport for SerialPortTransport {
    fn open(&mut self) -> io::Result<()> {
        let port = serialport::new(&self.settings.port, self.settings.baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .timeout(self.settings.read_interval_timeout)
            .open()
            .map_err(io::Error::from)?;
        debug!(
            "Serial port '{}' opened at {} baud",
            self.settings.port, self.settings.baud_rate
        );
        self.port = Some(port);
        Ok(())
    }

    fn write_byte(&mut self, byte: u8) -> io::Result<()> {
        use std::io::Write;

        let write_timeout = self.settings.write_timeout;
        let port = self.port()?;
        port.set_timeout(write_timeout)?;
        let written = port.write(&[byte])?;
        if written != 1 {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "short write"));
        }
        port.flush()
    }

    fn read_response(&mut self, len: usize) -> io::Result<Vec<u8>> {
        use std::io::Read;

        let deadline = std::time::Instant::now() + self.settings.read_deadline(len);
        let interval = self.settings.read_interval_timeout;
        let port = self.port()?;
        port.set_timeout(interval)?;

        let mut response = Vec::with_capacity(len);
        let mut buffer = [0u8; 16];
        while response.len() < len && std::time::Instant::now() < deadline {
            let want = (len - response.len()).min(buffer.len());
            match port.read(&mut buffer[..want]) {
                Ok(0) => break,
                Ok(n) => response.extend_from_slice(&buffer[..n]),
                Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(response)
    }

    fn close(&mut self) -> io::Result<()> {
        if self.port.take().is_some() {
            debug!("Serial port '{}' closed", self.settings.port);
        }
        Ok(())
    }
}

pub mod mock {
    //! Scripted shutter-release accessory for tests.

    use std::collections::VecDeque;
    use std::io;
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::{ShutterTransport, CLOSE_COMMAND, CLOSE_RESPONSE, OPEN_COMMAND, OPEN_RESPONSE};

    /// Scripted reaction to one command attempt.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Reply {
        /// Echo these bytes.
        Echo(Vec<u8>),
        /// Echo the correct word for the command.
        Correct,
        /// Nothing arrives before the read deadline.
        Silent,
        /// The write fails.
        WriteError,
    }

    #[derive(Debug, Default)]
    struct ScriptState {
        script: VecDeque<Reply>,
        writes: Vec<u8>,
        pending: Option<Vec<u8>>,
        opened: u32,
        closed: u32,
    }

    /// Transport that answers attempts from a script, then echoes correctly.
    ///
    /// Clones share state, so a test can keep one to inspect the exchange
    /// after handing the other to a [`super::ShutterController`].
    #[derive(Debug, Clone, Default)]
    pub struct ScriptedTransport {
        state: Arc<Mutex<ScriptState>>,
    }

    impl ScriptedTransport {
        /// Transport answering the first attempts from `script`.
        pub fn new(script: impl IntoIterator<Item = Reply>) -> Self {
            Self {
                state: Arc::new(Mutex::new(ScriptState {
                    script: script.into_iter().collect(),
                    ..ScriptState::default()
                })),
            }
        }

        /// Transport that always echoes correctly.
        pub fn echoing() -> Self {
            Self::default()
        }

        /// Command attempts seen so far (one per written byte).
        pub fn attempts(&self) -> u32 {
            self.state.lock().writes.len() as u32
        }

        /// Every byte written.
        pub fn writes(&self) -> Vec<u8> {
            self.state.lock().writes.clone()
        }

        /// Times the port was opened.
        pub fn open_count(&self) -> u32 {
            self.state.lock().opened
        }

        /// Times the port was closed.
        pub fn close_count(&self) -> u32 {
            self.state.lock().closed
        }
    }

    fn correct_echo(byte: u8) -> Vec<u8> {
        match byte {
            OPEN_COMMAND => OPEN_RESPONSE.to_vec(),
            CLOSE_COMMAND => CLOSE_RESPONSE.to_vec(),
            _ => Vec::new(),
        }
    }

    impl ShutterTransport for ScriptedTransport {
        fn open(&mut self) -> io::Result<()> {
            self.state.lock().opened += 1;
            Ok(())
        }

        fn write_byte(&mut self, byte: u8) -> io::Result<()> {
            let mut state = self.state.lock();
            state.writes.push(byte);
            let reply = state.script.pop_front().unwrap_or(Reply::Correct);
            state.pending = match reply {
                Reply::Echo(bytes) => Some(bytes),
                Reply::Correct => Some(correct_echo(byte)),
                Reply::Silent => None,
                Reply::WriteError => {
                    return Err(io::Error::new(io::ErrorKind::BrokenPipe, "write failed"))
                }
            };
            Ok(())
        }

        fn read_response(&mut self, len: usize) -> io::Result<Vec<u8>> {
            let mut bytes = self.state.lock().pending.take().unwrap_or_default();
            bytes.truncate(len);
            Ok(bytes)
        }

        fn close(&mut self) -> io::Result<()> {
            self.state.lock().closed += 1;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::{Reply, ScriptedTransport};
    use super::*;
    use std::time::Duration;
    use tracing_test::traced_test;

    fn controller(transport: &ScriptedTransport) -> ShutterController {
        ShutterController::new(Box::new(transport.clone()), RetryPolicy::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_on_last_attempt() {
        let transport = ScriptedTransport::new(vec![Reply::Silent; 9]);
        let mut shutter = controller(&transport);
        shutter.open_session().await.unwrap();

        let attempts = shutter.open_shutter().await.unwrap();
        assert_eq!(attempts, 10);
        assert_eq!(transport.attempts(), 10);
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_exhausted_budget_reports_device_not_responding() {
        let transport = ScriptedTransport::new(vec![Reply::WriteError; 10]);
        let mut shutter = controller(&transport);
        shutter.open_session().await.unwrap();

        let start = tokio::time::Instant::now();
        let err = shutter.close_shutter().await.unwrap_err();
        assert!(matches!(
            err,
            CaptureError::DeviceNotResponding {
                command: 'C',
                attempts: 10
            }
        ));
        assert_eq!(transport.writes(), vec![CLOSE_COMMAND; 10]);
        assert_eq!(start.elapsed(), Duration::from_millis(250 * 9));
        assert!(logs_contain("failed after 10 attempts"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_mismatched_echo_is_retried() {
        let transport = ScriptedTransport::new(vec![
            Reply::Echo(b"clos".to_vec()),
            Reply::Echo(b"op".to_vec()),
            Reply::Echo(b"OPEN".to_vec()),
        ]);
        let mut shutter = controller(&transport);
        shutter.open_session().await.unwrap();

        assert_eq!(shutter.open_shutter().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_command_requires_session() {
        let transport = ScriptedTransport::echoing();
        let shutter = controller(&transport);
        assert!(matches!(
            shutter.open_shutter().await,
            Err(CaptureError::SerialPortNotOpen)
        ));
        assert_eq!(transport.attempts(), 0);
    }

    #[tokio::test]
    async fn test_session_closed_exactly_once() {
        let transport = ScriptedTransport::echoing();
        let mut shutter = controller(&transport);
        shutter.open_session().await.unwrap();
        shutter.close_session().await.unwrap();
        shutter.close_session().await.unwrap();
        drop(shutter);
        assert_eq!(transport.open_count(), 1);
        assert_eq!(transport.close_count(), 1);
    }

    #[tokio::test]
    async fn test_drop_closes_open_session() {
        let transport = ScriptedTransport::echoing();
        let mut shutter = controller(&transport);
        shutter.open_session().await.unwrap();
        drop(shutter);
        assert_eq!(transport.close_count(), 1);
    }
}
