use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::{ChildEvent, PublicEndpoint, UrlExtractor};

/// Shared async writer a relay mirrors chunks into. Defaults to the
/// supervisor's own stdout/stderr; tests inject in-memory buffers.
#[derive(Clone)]
pub struct StreamSink(Arc<Mutex<Box<dyn AsyncWrite + Unpin + Sync + Send>>>);

impl StreamSink {
    pub fn new(writer: Box<dyn AsyncWrite + Unpin + Sync + Send>) -> Self {
        Self(Arc::new(Mutex::new(writer)))
    }

    pub fn stdout() -> Self {
        Self::new(Box::new(tokio::io::stdout()))
    }

    pub fn stderr() -> Self {
        Self::new(Box::new(tokio::io::stderr()))
    }

    pub async fn write(&self, chunk: &[u8]) {
        let mut lock = self.0.lock().await;
        let _ = lock.write_all(chunk).await;
        let _ = lock.flush().await;
    }
}

/// Forwards a child's captured output verbatim to the supervisor's own
/// streams, and optionally feeds the stdout text to a [`UrlExtractor`].
///
/// Per chunk, in order: re-emit to the matching sink, then scan. Chunks are
/// never dropped or reordered; the extractor accumulates across chunk
/// boundaries so a marker split over two deliveries still matches.
pub struct OutputRelay {
    out: StreamSink,
    err: StreamSink,
    extractor: Option<UrlExtractor>,
}

impl OutputRelay {
    /// Mirror-only relay (used for the service child).
    pub fn new(out: StreamSink, err: StreamSink) -> Self {
        Self {
            out,
            err,
            extractor: None,
        }
    }

    /// Relay that also scans stdout for the public-endpoint marker (used for
    /// the tunnel child).
    pub fn with_extractor(out: StreamSink, err: StreamSink) -> Self {
        Self {
            out,
            err,
            extractor: Some(UrlExtractor::new()),
        }
    }

    /// Forward one event. Returns the endpoint on the chunk that completes
    /// the first marker match.
    pub async fn forward(&mut self, event: &ChildEvent) -> Option<PublicEndpoint> {
        match event {
            ChildEvent::Stdout(chunk) => {
                self.out.write(chunk).await;
                if let Some(extractor) = &mut self.extractor {
                    return extractor.feed(&String::from_utf8_lossy(chunk));
                }
                None
            }
            ChildEvent::Stderr(chunk) => {
                self.err.write(chunk).await;
                None
            }
            ChildEvent::Exited(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SharedBuf(Arc<std::sync::Mutex<Vec<u8>>>);

    impl AsyncWrite for SharedBuf {
        fn poll_write(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            buf: &[u8],
        ) -> std::task::Poll<Result<usize, std::io::Error>> {
            self.0.lock().unwrap().extend_from_slice(buf);
            std::task::Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Result<(), std::io::Error>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Result<(), std::io::Error>> {
            std::task::Poll::Ready(Ok(()))
        }
    }

    fn capture_sink() -> (StreamSink, Arc<std::sync::Mutex<Vec<u8>>>) {
        let buf = Arc::new(std::sync::Mutex::new(Vec::new()));
        (StreamSink::new(Box::new(SharedBuf(buf.clone()))), buf)
    }

    #[tokio::test]
    async fn mirrors_both_streams_verbatim() {
        let (out, out_buf) = capture_sink();
        let (err, err_buf) = capture_sink();
        let mut relay = OutputRelay::new(out, err);

        relay.forward(&ChildEvent::Stdout(b"hello ".to_vec())).await;
        relay.forward(&ChildEvent::Stderr(b"oops\n".to_vec())).await;
        relay.forward(&ChildEvent::Stdout(b"world\n".to_vec())).await;
        relay.forward(&ChildEvent::Exited(Some(0))).await;

        assert_eq!(out_buf.lock().unwrap().as_slice(), b"hello world\n");
        assert_eq!(err_buf.lock().unwrap().as_slice(), b"oops\n");
    }

    #[tokio::test]
    async fn extracts_endpoint_split_across_chunks() {
        let (out, _) = capture_sink();
        let (err, _) = capture_sink();
        let mut relay = OutputRelay::with_extractor(out, err);

        assert!(
            relay
                .forward(&ChildEvent::Stdout(b"url=https://abc".to_vec()))
                .await
                .is_none()
        );
        let endpoint = relay
            .forward(&ChildEvent::Stdout(b"d.ngrok.io\n".to_vec()))
            .await
            .unwrap();
        assert_eq!(endpoint.host(), "abcd.ngrok.io");

        // Latched: the same completed text yields nothing further.
        assert!(
            relay
                .forward(&ChildEvent::Stdout(b"url=https://abcd.ngrok.io\n".to_vec()))
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn stderr_is_not_scanned() {
        let (out, _) = capture_sink();
        let (err, _) = capture_sink();
        let mut relay = OutputRelay::with_extractor(out, err);

        let result = relay
            .forward(&ChildEvent::Stderr(b"url=https://abcd.ngrok.io\n".to_vec()))
            .await;
        assert!(result.is_none());
    }
}
