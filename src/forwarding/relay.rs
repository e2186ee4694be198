//! Bidirectional relay
//!
//! Splices two duplex streams together. Each direction is copied by its own
//! task. As soon as either direction ends (EOF or error) both streams are shut
//! down and dropped, and the `on_close` callback runs exactly once.
//!
//! ```ignore
//! let (bytes_tx, mut bytes_rx) = mpsc::unbounded_channel();
//! relay(tcp_stream, channel.into_stream(), RelayOptions::new().meter(bytes_tx));
//! while let Some(n) = bytes_rx.recv().await { /* ... */ }
//! ```

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const COPY_BUF_SIZE: usize = 32 * 1024;

type OnClose = Box<dyn FnOnce() + Send + 'static>;

/// Optional relay behaviour
#[derive(Default)]
pub struct RelayOptions {
    on_close: Option<OnClose>,
    meter: Option<mpsc::UnboundedSender<u64>>,
    cancel: Option<CancellationToken>,
}

impl RelayOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Callback invoked once, when the relay closes
    pub fn on_close(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_close = Some(Box::new(f));
        self
    }

    /// Receive the size of every successful write. The channel is closed only
    /// after both copy tasks have finished.
    pub fn meter(mut self, tx: mpsc::UnboundedSender<u64>) -> Self {
        self.meter = Some(tx);
        self
    }

    /// Token that closes the relay from outside when cancelled. The relay also
    /// cancels it when it closes on its own.
    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Bytes moved in each direction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub a_to_b: u64,
    pub b_to_a: u64,
}

struct CloseOnce {
    token: CancellationToken,
    on_close: Mutex<Option<OnClose>>,
}

impl CloseOnce {
    fn close(&self) {
        self.token.cancel();
        // take() makes the callback run at most once across both tasks
        let callback = self.on_close.lock().take();
        if let Some(callback) = callback {
            callback();
        }
    }
}

/// Relay `a` and `b` until either side closes.
///
/// Returns a handle resolving to the byte counts once both copy tasks have
/// finished. Dropping the handle does not stop the relay.
pub fn relay<A, B>(a: A, b: B, options: RelayOptions) -> JoinHandle<RelayStats>
where
    A: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let RelayOptions {
        on_close,
        meter,
        cancel,
    } = options;

    let closer = Arc::new(CloseOnce {
        token: cancel.unwrap_or_default(),
        on_close: Mutex::new(on_close),
    });

    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);

    let a_to_b = tokio::spawn(copy_half(a_read, b_write, closer.clone(), meter.clone()));
    let b_to_a = tokio::spawn(copy_half(b_read, a_write, closer, meter));

    tokio::spawn(async move {
        let (a_to_b, b_to_a) = tokio::join!(a_to_b, b_to_a);
        RelayStats {
            a_to_b: a_to_b.unwrap_or(0),
            b_to_a: b_to_a.unwrap_or(0),
        }
    })
}

async fn copy_half<R, W>(
    mut reader: R,
    mut writer: W,
    closer: Arc<CloseOnce>,
    meter: Option<mpsc::UnboundedSender<u64>>,
) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut total = 0u64;

    loop {
        let n = tokio::select! {
            _ = closer.token.cancelled() => break,
            result = reader.read(&mut buf) => match result {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!("Relay read error: {}", e);
                    break;
                }
            },
        };

        let written = tokio::select! {
            _ = closer.token.cancelled() => break,
            result = async {
                writer.write_all(&buf[..n]).await?;
                writer.flush().await
            } => result,
        };
        if let Err(e) = written {
            debug!("Relay write error: {}", e);
            break;
        }

        total += n as u64;
        if let Some(meter) = &meter {
            let _ = meter.send(n as u64);
        }
    }

    let _ = writer.shutdown().await;
    closer.close();
    total
}
