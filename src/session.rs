//! Per-connection session.
//!
//! A session owns one accepted stream and runs two activities on it:
//!
//! - **Emitter**: the session's own task. Every interval it draws a message
//!   from the [`Catalog`] and writes it as one `\n`-terminated line.
//! - **Reader**: a spawned task that consumes client lines and watches for
//!   the `finished` sentinel.
//!
//! The reader reports every exit (sentinel, EOF, read error) through a
//! oneshot channel, the termination signal. The emitter waits on the
//! interval timer and that signal at a single `select!` point, so whichever
//! resolves first ends the session. A write blocked on a client that stopped
//! reading also races the signal. Teardown then aborts the reader, shuts
//! down the write half and drops the stream.
//!
//! ```text
//! Active --(tick write fails | signal fires)--> Closing --(stream released)--> Closed
//! ```

use crate::catalog::Catalog;
use bytes::BytesMut;
use std::io;
use std::time::Duration;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, WriteHalf,
};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, trace};

/// Line a client sends to end its session.
pub const SENTINEL: &[u8] = b"finished";

/// Longest client line examined for the sentinel. Longer lines are
/// discarded in chunks of this size.
const MAX_LINE_LENGTH: usize = 1024;

/// Why a session ended.
#[derive(Debug)]
pub enum SessionEnd {
    /// Client sent the sentinel line.
    Finished,
    /// Peer closed its side of the stream.
    PeerClosed,
    /// Reading from the stream failed.
    ReadFailed(io::Error),
    /// Writing a message to the stream failed.
    WriteFailed(io::Error),
}

impl std::fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionEnd::Finished => write!(f, "client finished"),
            SessionEnd::PeerClosed => write!(f, "peer closed"),
            SessionEnd::ReadFailed(e) => write!(f, "read failed: {}", e),
            SessionEnd::WriteFailed(e) => write!(f, "write failed: {}", e),
        }
    }
}

/// Outcome of a completed session.
#[derive(Debug)]
pub struct SessionSummary {
    pub end: SessionEnd,
    pub messages_sent: u64,
}

/// A running session over one bidirectional stream.
pub struct Session<S> {
    writer: WriteHalf<S>,
    reader: JoinHandle<()>,
    terminated: oneshot::Receiver<SessionEnd>,
    catalog: Catalog,
    interval: Duration,
    messages_sent: u64,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Split the stream and spawn the reader task. Must be called from
    /// within a tokio runtime.
    pub fn start(stream: S, catalog: Catalog, interval: Duration) -> Self {
        let (read_half, writer) = tokio::io::split(stream);
        let (signal, terminated) = oneshot::channel();
        let reader = tokio::spawn(async move {
            let end = read_until_sentinel(read_half).await;
            // The receiver is gone once the emitter has already ended.
            let _ = signal.send(end);
        });

        Session {
            writer,
            reader,
            terminated,
            catalog,
            interval,
            messages_sent: 0,
        }
    }

    /// Drive the session to completion and release the stream.
    pub async fn run(mut self) -> SessionSummary {
        let end = self.emit_until_terminated().await;
        trace!(reason = %end, "Session closing");
        self.close().await;
        trace!("Session closed");

        SessionSummary {
            end,
            messages_sent: self.messages_sent,
        }
    }

    async fn emit_until_terminated(&mut self) -> SessionEnd {
        let mut ticker = time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut line = BytesMut::with_capacity(128);

        loop {
            tokio::select! {
                biased;

                end = &mut self.terminated => {
                    // A dropped sender means the reader task died without reporting.
                    return end.unwrap_or(SessionEnd::PeerClosed);
                }
                _ = ticker.tick() => {
                    let message = self.catalog.next();
                    line.clear();
                    line.extend_from_slice(message.as_bytes());
                    line.extend_from_slice(b"\n");

                    // A client that stopped reading must not hold off termination.
                    tokio::select! {
                        biased;

                        end = &mut self.terminated => {
                            return end.unwrap_or(SessionEnd::PeerClosed);
                        }
                        result = write_line(&mut self.writer, &line) => {
                            if let Err(e) = result {
                                return SessionEnd::WriteFailed(e);
                            }
                        }
                    }
                    self.messages_sent += 1;
                    trace!(text = message, sent = self.messages_sent, "Message sent");
                }
            }
        }
    }

    async fn close(&mut self) {
        self.reader.abort();
        if let Err(e) = (&mut self.reader).await {
            if e.is_panic() {
                debug!(error = %e, "Reader task panicked");
            }
        }

        match time::timeout(self.interval, self.writer.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => trace!(error = %e, "Shutdown failed"),
            Err(_) => trace!("Shutdown timed out"),
        }
    }
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &[u8]) -> io::Result<()> {
    writer.write_all(line).await?;
    writer.flush().await
}

/// Consume client lines until the sentinel arrives or the stream ends.
async fn read_until_sentinel<R: AsyncRead + Unpin>(stream: R) -> SessionEnd {
    let mut reader = BufReader::new(stream);
    let mut line = Vec::with_capacity(MAX_LINE_LENGTH);
    let mut overlong = false;

    loop {
        line.clear();

        let n = match (&mut reader)
            .take(MAX_LINE_LENGTH as u64)
            .read_until(b'\n', &mut line)
            .await
        {
            Ok(n) => n,
            Err(e) => return SessionEnd::ReadFailed(e),
        };

        if n == 0 {
            return SessionEnd::PeerClosed;
        }

        if line.last() != Some(&b'\n') {
            if n < MAX_LINE_LENGTH {
                // EOF in the middle of a line
                return SessionEnd::PeerClosed;
            }
            overlong = true;
            continue;
        }

        // Tail of a line that already exceeded the limit
        if std::mem::take(&mut overlong) {
            continue;
        }

        if is_sentinel(&line) {
            return SessionEnd::Finished;
        }

        trace!(len = n, "Ignoring client line");
    }
}

/// Match a raw line against the sentinel, tolerating a CRLF terminator.
fn is_sentinel(line: &[u8]) -> bool {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    line == SENTINEL
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::ReadBuf;

    const INTERVAL: Duration = Duration::from_secs(3);

    fn catalog() -> Catalog {
        Catalog::default()
    }

    /// Stream whose reads never complete and whose writes always fail.
    struct BrokenPipe;

    impl AsyncRead for BrokenPipe {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Pending
        }
    }

    impl AsyncWrite for BrokenPipe {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[test]
    fn test_is_sentinel() {
        assert!(is_sentinel(b"finished\n"));
        assert!(is_sentinel(b"finished\r\n"));
        assert!(is_sentinel(b"finished"));

        assert!(!is_sentinel(b"Finished\n"));
        assert!(!is_sentinel(b" finished\n"));
        assert!(!is_sentinel(b"finished \n"));
        assert!(!is_sentinel(b"finished\n\n"));
        assert!(!is_sentinel(b"finishedfinished\n"));
        assert!(!is_sentinel(b"\n"));
    }

    #[tokio::test]
    async fn test_reader_stops_at_sentinel() {
        let input: &[u8] = b"hello\nFINISHED\nfinished\nnever read\n";
        assert!(matches!(
            read_until_sentinel(input).await,
            SessionEnd::Finished
        ));
    }

    #[tokio::test]
    async fn test_reader_eof_without_sentinel() {
        let input: &[u8] = b"hello\nworld\n";
        assert!(matches!(
            read_until_sentinel(input).await,
            SessionEnd::PeerClosed
        ));

        // No terminator, so the sentinel never completes
        let input: &[u8] = b"finished";
        assert!(matches!(
            read_until_sentinel(input).await,
            SessionEnd::PeerClosed
        ));
    }

    #[tokio::test]
    async fn test_reader_discards_overlong_lines() {
        let mut input = vec![b'x'; MAX_LINE_LENGTH * 3 + 7];
        input.extend_from_slice(b"finished\n");
        input.extend_from_slice(b"finished\n");

        // The first "finished" is the tail of the overlong line
        assert!(matches!(
            read_until_sentinel(&input[..]).await,
            SessionEnd::Finished
        ));
    }

    #[tokio::test]
    async fn test_reader_overlong_tail_is_not_sentinel() {
        let mut input = vec![b'x'; MAX_LINE_LENGTH];
        input.extend_from_slice(b"finished\n");

        assert!(matches!(
            read_until_sentinel(&input[..]).await,
            SessionEnd::PeerClosed
        ));
    }

    #[tokio::test]
    async fn test_reader_reports_read_error() {
        let stream = tokio_test::io::Builder::new()
            .read(b"hello\n")
            .read_error(io::ErrorKind::ConnectionReset.into())
            .build();

        match read_until_sentinel(stream).await {
            SessionEnd::ReadFailed(e) => assert_eq!(e.kind(), io::ErrorKind::ConnectionReset),
            other => panic!("unexpected end: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sentinel_before_first_tick_sends_nothing() {
        let stream = tokio_test::io::Builder::new().read(b"finished\n").build();

        let start = Instant::now();
        let summary = Session::start(stream, catalog(), INTERVAL).run().await;

        assert!(matches!(summary.end, SessionEnd::Finished));
        assert_eq!(summary.messages_sent, 0);
        assert!(start.elapsed() < INTERVAL);
    }

    #[tokio::test(start_paused = true)]
    async fn test_emits_one_message_per_interval() {
        let (client, server) = tokio::io::duplex(4096);
        let catalog = catalog();
        let session = tokio::spawn(Session::start(server, catalog.clone(), INTERVAL).run());

        let (client_read, mut client_write) = tokio::io::split(client);
        let mut lines = BufReader::new(client_read).lines();
        let start = Instant::now();

        for i in 1..=10u32 {
            let line = lines.next_line().await.unwrap().unwrap();
            assert!(catalog.contains(&line), "unexpected line {line:?}");

            let elapsed = start.elapsed();
            assert!(elapsed >= INTERVAL * i, "message {i} early: {elapsed:?}");
            assert!(elapsed < INTERVAL * i + INTERVAL / 2, "message {i} late: {elapsed:?}");
        }

        client_write.write_all(b"finished\n").await.unwrap();
        let summary = session.await.unwrap();
        assert!(matches!(summary.end, SessionEnd::Finished));
        assert_eq!(summary.messages_sent, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sentinel_closes_stream_before_next_tick() {
        let (client, server) = tokio::io::duplex(4096);
        let session = tokio::spawn(Session::start(server, catalog(), INTERVAL).run());

        let (client_read, mut client_write) = tokio::io::split(client);
        let mut lines = BufReader::new(client_read).lines();

        assert!(lines.next_line().await.unwrap().is_some());
        let sent_at = Instant::now();
        client_write.write_all(b"finished\n").await.unwrap();

        // Stream closes without a further message
        assert!(lines.next_line().await.unwrap().is_none());
        assert!(sent_at.elapsed() < INTERVAL);

        let summary = session.await.unwrap();
        assert!(matches!(summary.end, SessionEnd::Finished));
        assert_eq!(summary.messages_sent, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_lines_are_ignored() {
        let (client, server) = tokio::io::duplex(4096);
        let session = tokio::spawn(Session::start(server, catalog(), INTERVAL).run());

        let (client_read, mut client_write) = tokio::io::split(client);
        let mut lines = BufReader::new(client_read).lines();

        client_write
            .write_all(b"hello\nFinished\n finished\nfinished!\n")
            .await
            .unwrap();

        // No echo or acknowledgement, just the regular cadence
        assert!(lines.next_line().await.unwrap().is_some());
        assert!(lines.next_line().await.unwrap().is_some());
        assert!(!session.is_finished());

        client_write.write_all(b"finished\r\n").await.unwrap();
        let summary = session.await.unwrap();
        assert!(matches!(summary.end, SessionEnd::Finished));
        assert_eq!(summary.messages_sent, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_disconnect_ends_session() {
        let (client, server) = tokio::io::duplex(4096);
        let session = tokio::spawn(Session::start(server, catalog(), INTERVAL).run());

        drop(client);

        let summary = time::timeout(INTERVAL * 2, session)
            .await
            .expect("session did not end")
            .unwrap();
        match summary.end {
            SessionEnd::PeerClosed | SessionEnd::WriteFailed(_) => {}
            other => panic!("unexpected end: {:?}", other),
        }
        assert_eq!(summary.messages_sent, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_while_write_blocked() {
        // Smaller than any catalog line, so the first write stalls
        let (client, server) = tokio::io::duplex(8);
        let session = tokio::spawn(Session::start(server, catalog(), INTERVAL).run());

        let (_unread, mut client_write) = tokio::io::split(client);

        time::sleep(INTERVAL + Duration::from_millis(100)).await;
        assert!(!session.is_finished());

        client_write.write_all(b"finished\n").await.unwrap();

        let summary = time::timeout(INTERVAL, session)
            .await
            .expect("session still running after finished")
            .unwrap();
        assert!(matches!(summary.end, SessionEnd::Finished));
        assert_eq!(summary.messages_sent, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_while_write_blocked() {
        let (client, server) = tokio::io::duplex(8);
        let session = tokio::spawn(Session::start(server, catalog(), INTERVAL).run());

        time::sleep(INTERVAL * 2).await;
        assert!(!session.is_finished());

        drop(client);

        let summary = time::timeout(INTERVAL, session)
            .await
            .expect("session still running after disconnect")
            .unwrap();
        match summary.end {
            SessionEnd::PeerClosed | SessionEnd::WriteFailed(_) => {}
            other => panic!("unexpected end: {:?}", other),
        }
        assert_eq!(summary.messages_sent, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_failure_ends_session_and_reader() {
        let start = Instant::now();
        let summary = Session::start(BrokenPipe, catalog(), INTERVAL).run().await;

        match summary.end {
            SessionEnd::WriteFailed(e) => assert_eq!(e.kind(), io::ErrorKind::BrokenPipe),
            other => panic!("unexpected end: {:?}", other),
        }
        assert_eq!(summary.messages_sent, 0);
        assert!(start.elapsed() >= INTERVAL);
    }
}
