/// Drains one child output stream on its own task.
///
/// A pump reads until end-of-stream or the first read error, either
/// discarding bytes or forwarding them to a sink. I/O failures end the
/// pump quietly; they never affect the child's lifecycle.
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;

const BUFFER_SIZE: usize = 8 * 1024;

/// Boxed sink used by managed processes to forward child output.
pub type BoxSink = Box<dyn AsyncWrite + Send + Unpin>;

/// What a pump hands back once it has finished.
#[derive(Debug)]
pub struct PumpOutcome<R, W> {
    /// Bytes read from the source (forwarded or discarded).
    pub bytes: u64,
    /// The source, unless the pump was asked to close it.
    pub source: Option<R>,
    /// The sink, unless the pump was asked to close it or it failed.
    pub sink: Option<W>,
}

/// Handle to a running pump task.
#[derive(Debug)]
pub struct StreamPump<R, W> {
    name: &'static str,
    handle: JoinHandle<PumpOutcome<R, W>>,
}

impl<R, W> StreamPump<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    /// Start pumping `source` into `sink` (`None` discards).
    ///
    /// `close_sink` shuts the sink down at the end; `close_source` drops the
    /// source instead of returning it in the outcome.
    pub fn spawn(
        name: &'static str,
        source: R,
        sink: Option<W>,
        close_sink: bool,
        close_source: bool,
    ) -> Self {
        let handle = tokio::spawn(pump(name, source, sink, close_sink, close_source));
        Self { name, handle }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the pump to reach end-of-stream.
    ///
    /// A pump task that panicked or was aborted reports zero bytes.
    pub async fn finish(self) -> PumpOutcome<R, W> {
        match self.handle.await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(pump = self.name, error = %e, "stream pump task failed");
                PumpOutcome {
                    bytes: 0,
                    source: None,
                    sink: None,
                }
            }
        }
    }
}

async fn pump<R, W>(
    name: &'static str,
    mut source: R,
    mut sink: Option<W>,
    close_sink: bool,
    close_source: bool,
) -> PumpOutcome<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    let mut bytes = 0u64;

    loop {
        let n = match source.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::debug!(pump = name, error = %e, "stream read failed, stopping pump");
                break;
            }
        };
        bytes += n as u64;

        if let Some(writer) = sink.as_mut() {
            let written = match writer.write_all(&buf[..n]).await {
                Ok(()) => writer.flush().await,
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                // Keep draining so the child never blocks on a full pipe.
                tracing::debug!(pump = name, error = %e, "sink write failed, discarding remaining output");
                sink = None;
            }
        }
    }

    if close_sink {
        if let Some(mut writer) = sink.take() {
            if let Err(e) = writer.shutdown().await {
                tracing::debug!(pump = name, error = %e, "failed to close sink");
            }
        }
    }

    tracing::trace!(pump = name, bytes, "stream pump finished");

    PumpOutcome {
        bytes,
        source: if close_source { None } else { Some(source) },
        sink,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    struct FailingWriter;

    impl AsyncWrite for FailingWriter {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "sink closed",
            )))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    struct FailingReader;

    impl AsyncRead for FailingReader {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut tokio::io::ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            Poll::Ready(Err(std::io::Error::other("stream reset")))
        }
    }

    #[tokio::test]
    async fn test_forwards_all_bytes_to_sink() {
        let source: &[u8] = b"hello pump\nsecond line\n";
        let pump = StreamPump::spawn("test", source, Some(Vec::<u8>::new()), false, false);
        let outcome = pump.finish().await;

        assert_eq!(outcome.bytes, source.len() as u64);
        assert_eq!(outcome.sink.unwrap(), source.to_vec());
        assert!(outcome.source.is_some());
    }

    #[tokio::test]
    async fn test_discards_without_sink() {
        let source: &[u8] = &[7u8; 20_000];
        let pump = StreamPump::<_, Vec<u8>>::spawn("discard", source, None, false, true);
        let outcome = pump.finish().await;

        assert_eq!(outcome.bytes, 20_000);
        assert!(outcome.sink.is_none());
        assert!(outcome.source.is_none());
    }

    #[tokio::test]
    async fn test_close_sink_consumes_it() {
        let source: &[u8] = b"abc";
        let pump = StreamPump::spawn("close", source, Some(Vec::<u8>::new()), true, false);
        let outcome = pump.finish().await;
        assert_eq!(outcome.bytes, 3);
        assert!(outcome.sink.is_none());
    }

    #[tokio::test]
    async fn test_sink_failure_keeps_draining() {
        let source: &[u8] = &[1u8; 30_000];
        let pump = StreamPump::spawn("broken-sink", source, Some(FailingWriter), false, false);
        let outcome = pump.finish().await;
        assert_eq!(outcome.bytes, 30_000);
        assert!(outcome.sink.is_none());
    }

    #[tokio::test]
    async fn test_read_failure_ends_quietly() {
        let pump = StreamPump::spawn("broken-source", FailingReader, Some(Vec::<u8>::new()), false, false);
        let outcome = pump.finish().await;
        assert_eq!(outcome.bytes, 0);
        assert_eq!(outcome.sink.unwrap(), Vec::<u8>::new());
    }

    #[tokio::test]
    async fn test_pump_drains_child_stdout() {
        let mut child = tokio::process::Command::new("sh")
            .args(["-c", "printf 'from child'"])
            .stdout(std::process::Stdio::piped())
            .spawn()
            .unwrap();
        let stdout = child.stdout.take().unwrap();
        let pump = StreamPump::spawn("stdout", stdout, Some(Vec::<u8>::new()), false, true);
        child.wait().await.unwrap();
        let outcome = pump.finish().await;
        assert_eq!(outcome.sink.unwrap(), b"from child".to_vec());
    }
}
