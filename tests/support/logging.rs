use std::io::{self, Write};
use std::sync::{Arc, OnceLock};
use std::time::Duration as StdDuration;

use anyhow::{Result, anyhow};
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::{self, MakeWriter};

#[derive(Clone)]
struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl<'a> MakeWriter<'a> for SharedBuffer {
    type Writer = SharedBuffer;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

static LOG_BUFFER: OnceLock<Arc<Mutex<Vec<u8>>>> = OnceLock::new();
static LOG_SEMAPHORE: OnceLock<Arc<Semaphore>> = OnceLock::new();

/// Routes tracing output of the whole test binary into one buffer.
///
/// Holding a capture serializes tests that inspect logs; the buffer is cleared on creation.
pub struct LogCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
    _permit: OwnedSemaphorePermit,
}

impl LogCapture {
    pub async fn new() -> Result<Self> {
        let semaphore = LOG_SEMAPHORE
            .get_or_init(|| Arc::new(Semaphore::new(1)))
            .clone();
        let permit = semaphore.acquire_owned().await?;
        let buffer = LOG_BUFFER
            .get_or_init(|| {
                let buffer = Arc::new(Mutex::new(Vec::new()));
                let subscriber = fmt::fmt()
                    .with_env_filter(EnvFilter::new("info"))
                    .with_ansi(false)
                    .json()
                    .with_writer(SharedBuffer(buffer.clone()))
                    .finish();
                let _ = tracing::subscriber::set_global_default(subscriber);
                buffer
            })
            .clone();
        buffer.lock().clear();
        Ok(Self {
            buffer,
            _permit: permit,
        })
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.buffer.lock()).to_string()
    }

    /// Access log lines emitted so far.
    pub fn access_lines(&self) -> Vec<String> {
        self.text()
            .lines()
            .filter(|line| line.contains("\"target\":\"access_log\""))
            .map(str::to_string)
            .collect()
    }

    /// Wait for an access log line containing every needle. Session logs are written after
    /// the client connection closes, so tests must not assume they are already present.
    pub async fn wait_for_access(&self, needles: &[&str]) -> Result<String> {
        for _ in 0..100 {
            if let Some(line) = self
                .access_lines()
                .into_iter()
                .find(|line| needles.iter().all(|needle| line.contains(needle)))
            {
                return Ok(line);
            }
            tokio::time::sleep(StdDuration::from_millis(20)).await;
        }
        Err(anyhow!(
            "no access log line matching {needles:?}; captured:\n{}",
            self.text()
        ))
    }
}
