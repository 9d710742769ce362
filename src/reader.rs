//! Line pumps that drain the child's output streams into the hand-off channel.

use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

/// Which child stream a line arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamSource {
    Stdout,
    Stderr,
}

/// One line of child output, exactly as received (trailing delimiter included).
#[derive(Debug)]
pub struct OutputLine {
    pub text: String,
    pub source: StreamSource,
    /// When the pump read the line. The supervisor resets its deadline to this.
    pub at: Instant,
}

/// Reader pumps for one child generation: one task per captured stream, both
/// feeding the same channel.
///
/// Joining is the barrier between generations; the next child must not be
/// spawned until both pumps have exited.
pub struct Reader {
    pumps: Vec<JoinHandle<()>>,
}

impl Reader {
    /// Spawn pumps for the child's stdout and stderr.
    ///
    /// Consumes the sender, so the channel closes as soon as both pumps
    /// finish and the receiver sees end-of-stream.
    pub fn spawn<O, E>(stdout: O, stderr: E, tx: UnboundedSender<OutputLine>) -> Reader
    where
        O: AsyncRead + Unpin + Send + 'static,
        E: AsyncRead + Unpin + Send + 'static,
    {
        let stderr_tx = tx.clone();
        Reader {
            pumps: vec![
                tokio::spawn(pump(stdout, StreamSource::Stdout, tx)),
                tokio::spawn(pump(stderr, StreamSource::Stderr, stderr_tx)),
            ],
        }
    }

    /// Wait for every pump to exit.
    pub async fn join(self) {
        for pump in self.pumps {
            if let Err(e) = pump.await {
                tracing::warn!(error = %e, "reader pump did not shut down cleanly");
            }
        }
    }
}

/// Read lines until the stream ends, forwarding each into the channel.
///
/// A stream error (broken pipe, invalid UTF-8 under text decoding) ends the
/// pump the same way end-of-stream does; recovery is the supervisor's
/// restart, not ours. A send failure means the receiver was dropped because
/// a restart was already decided, so the pump stops as well.
async fn pump<R>(stream: R, source: StreamSource, tx: UnboundedSender<OutputLine>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut buf = String::new();
    loop {
        buf.clear();
        match reader.read_line(&mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = OutputLine {
                    text: buf.clone(),
                    source,
                    at: Instant::now(),
                };
                if tx.send(line).is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!(?source, error = %e, "child stream error, ending pump");
                break;
            }
        }
    }
    tracing::trace!(?source, "reader pump finished");
}
