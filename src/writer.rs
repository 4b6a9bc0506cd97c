//! Dedicated writer task for the transport channel.
//!
//! Callers never touch the write half directly. Every `send` goes through an
//! mpsc channel to one task that owns the writer, so concurrent calls can
//! never interleave bytes of two frames.
//!
//! ```text
//! call 1 ─┐
//! call 2 ─┼─► mpsc::Sender<OutboundFrame> ─► Writer Task ─► socket / pipe
//! call N ─┘
//! ```
//!
//! Ready frames are batched into one vectored write.

use std::io::IoSlice;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{FlowError, Result};
use crate::protocol::{Header, HEADER_SIZE};

/// Default maximum pending frames before backpressure kicks in.
pub const DEFAULT_MAX_PENDING_FRAMES: usize = 256;

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Default backpressure timeout.
pub const DEFAULT_BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum frames to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// A frame ready to be written to the channel.
#[derive(Debug)]
pub struct OutboundFrame {
    /// Pre-encoded header.
    pub header: [u8; HEADER_SIZE],
    pub payload: Bytes,
}

impl OutboundFrame {
    /// Create a new outbound frame.
    #[inline]
    pub fn new(header: &Header, payload: Bytes) -> Self {
        Self {
            header: header.encode(),
            payload,
        }
    }

    /// Total size of this frame (header + payload).
    #[inline]
    pub fn size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

/// Configuration for the writer task.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Maximum pending frames before backpressure kicks in.
    pub max_pending_frames: usize,
    /// Channel capacity for frame queue.
    pub channel_capacity: usize,
    /// Timeout when waiting for backpressure to clear.
    pub backpressure_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            backpressure_timeout: DEFAULT_BACKPRESSURE_TIMEOUT,
        }
    }
}

/// Handle for sending frames to the writer task.
///
/// Cheap to clone. The task exits once every handle is dropped, which is how
/// a session closes its write half.
#[derive(Clone)]
pub struct WriterHandle {
    /// Channel sender for frames.
    tx: mpsc::Sender<OutboundFrame>,
    /// Pending frame count (for backpressure).
    pending: Arc<AtomicUsize>,
    /// Maximum pending frames.
    max_pending: usize,
    /// Backpressure timeout.
    timeout: Duration,
}

impl WriterHandle {
    /// Create a new writer handle.
    fn new(
        tx: mpsc::Sender<OutboundFrame>,
        pending: Arc<AtomicUsize>,
        max_pending: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            tx,
            pending,
            max_pending,
            timeout,
        }
    }

    /// Send a frame to the writer task.
    ///
    /// This method will wait if backpressure is active, timing out after
    /// the configured duration.
    pub async fn send(&self, frame: OutboundFrame) -> Result<()> {
        let current = self.pending.load(Ordering::Acquire);
        if current >= self.max_pending {
            self.wait_for_backpressure().await?;
        }

        self.pending.fetch_add(1, Ordering::AcqRel);

        self.tx.send(frame).await.map_err(|_| {
            self.pending.fetch_sub(1, Ordering::Release);
            channel_closed()
        })
    }

    /// Wait for backpressure to clear with timeout.
    async fn wait_for_backpressure(&self) -> Result<()> {
        let start = Instant::now();
        let check_interval = Duration::from_micros(100);

        loop {
            if self.pending.load(Ordering::Acquire) < self.max_pending {
                return Ok(());
            }

            if start.elapsed() > self.timeout {
                return Err(FlowError::BackpressureTimeout);
            }

            tokio::time::sleep(check_interval).await;
        }
    }

    /// Get current pending frame count.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }
}

fn channel_closed() -> FlowError {
    FlowError::Channel(std::io::Error::new(
        std::io::ErrorKind::BrokenPipe,
        "channel writer is closed",
    ))
}

/// Spawn the writer task and return a handle for sending frames.
///
/// The join handle resolves with the first write error, or `Ok` once all
/// handles are dropped and the queue is drained.
pub fn spawn_writer_task<W>(
    writer: W,
    config: WriterConfig,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity);
    let pending = Arc::new(AtomicUsize::new(0));

    let handle = WriterHandle::new(
        tx,
        pending.clone(),
        config.max_pending_frames,
        config.backpressure_timeout,
    );

    let task = tokio::spawn(writer_loop_logged(rx, writer, pending));

    (handle, task)
}

/// Spawn the writer task with default configuration.
pub fn spawn_writer_task_default<W>(writer: W) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    spawn_writer_task(writer, WriterConfig::default())
}

async fn writer_loop_logged<W>(
    rx: mpsc::Receiver<OutboundFrame>,
    writer: W,
    pending: Arc<AtomicUsize>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let result = writer_loop(rx, writer, pending).await;
    match &result {
        Ok(()) => debug!("writer task finished"),
        Err(e) => warn!(error = %e, "writer task failed"),
    }
    result
}

async fn writer_loop<W>(
    mut rx: mpsc::Receiver<OutboundFrame>,
    mut writer: W,
    pending: Arc<AtomicUsize>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let Some(first) = rx.recv().await else {
            // Engine and every caller let go of the channel: tell the backend.
            let _ = writer.shutdown().await;
            return Ok(());
        };

        // Requests queued by concurrent callers share one syscall.
        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);
        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        write_batch(&mut writer, &batch).await?;
        // Only now may backpressured senders enqueue more.
        pending.fetch_sub(batch.len(), Ordering::Release);
    }
}

/// Write every frame of `batch` in order, resuming after short writes.
///
/// A frame is never interleaved with another one: the batch is written as a
/// single contiguous byte run.
async fn write_batch<W>(writer: &mut W, batch: &[OutboundFrame]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let total: usize = batch.iter().map(OutboundFrame::size).sum();
    let mut written = 0;

    while written < total {
        let slices = build_remaining_slices(batch, written);
        let n = writer.write_vectored(&slices).await?;
        if n == 0 {
            return Err(FlowError::Channel(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "backend channel accepted no bytes",
            )));
        }
        written += n;
    }

    writer.flush().await?;
    Ok(())
}

/// Header and payload slices of `batch` past its first `skip_bytes` bytes.
fn build_remaining_slices(batch: &[OutboundFrame], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len() * 2);
    let mut skipped = 0;

    for frame in batch {
        let header_start = skipped;
        let header_end = skipped + HEADER_SIZE;

        if skip_bytes < header_end {
            let start_in_header = skip_bytes.saturating_sub(header_start);
            slices.push(IoSlice::new(&frame.header[start_in_header..]));
        }
        skipped = header_end;

        if !frame.payload.is_empty() {
            let payload_start = skipped;
            let payload_end = skipped + frame.payload.len();

            if skip_bytes < payload_end {
                let start_in_payload = skip_bytes.saturating_sub(payload_start);
                slices.push(IoSlice::new(&frame.payload[start_in_payload..]));
            }
            skipped = payload_end;
        }
    }

    slices
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::{duplex, AsyncReadExt};

    use crate::protocol::FrameBuffer;

    #[test]
    fn test_outbound_frame_size() {
        let header = Header::request(42, 5);
        let frame = OutboundFrame::new(&header, Bytes::from_static(b"hello"));

        assert_eq!(frame.header, header.encode());
        assert_eq!(frame.size(), HEADER_SIZE + 5);
    }

    #[tokio::test]
    async fn test_writer_handle_send() {
        let (client, mut server) = duplex(4096);
        let (handle, _task) = spawn_writer_task_default(client);

        let header = Header::request(1, 5);
        handle
            .send(OutboundFrame::new(&header, Bytes::from_static(b"hello")))
            .await
            .unwrap();

        let mut buf = vec![0u8; HEADER_SIZE + 5];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf[..HEADER_SIZE], &header.encode());
        assert_eq!(&buf[HEADER_SIZE..], b"hello");
    }

    #[tokio::test]
    async fn test_concurrent_senders_never_interleave() {
        let (client, mut server) = duplex(64 * 1024);
        let (handle, _task) = spawn_writer_task_default(client);

        let mut tasks = Vec::new();
        for i in 1..=20u32 {
            let handle = handle.clone();
            tasks.push(tokio::spawn(async move {
                let payload = Bytes::from(vec![i as u8; 100 + i as usize]);
                let header = Header::request(i, payload.len() as u32);
                handle.send(OutboundFrame::new(&header, payload)).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        drop(handle);

        let mut bytes = Vec::new();
        server.read_to_end(&mut bytes).await.unwrap();

        let frames = FrameBuffer::new().push(&bytes).unwrap();
        assert_eq!(frames.len(), 20);
        for frame in frames {
            let id = frame.call_id();
            assert_eq!(frame.payload_len(), 100 + id as usize);
            assert!(frame.payload().iter().all(|&b| b == id as u8));
        }
    }

    #[tokio::test]
    async fn test_send_after_writer_failed_is_channel_error() {
        let (client, server) = duplex(64);
        let (handle, task) = spawn_writer_task_default(client);
        drop(server);

        let header = Header::request(1, 3);
        // First send may be accepted into the queue; the task then fails.
        let _ = handle
            .send(OutboundFrame::new(&header, Bytes::from_static(b"abc")))
            .await;
        assert!(task.await.unwrap().is_err());

        let result = handle
            .send(OutboundFrame::new(&header, Bytes::from_static(b"abc")))
            .await;
        assert!(matches!(result, Err(FlowError::Channel(_))));
        assert_eq!(handle.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_backpressure_timeout() {
        let (tx, _rx) = mpsc::channel::<OutboundFrame>(10);
        let pending = Arc::new(AtomicUsize::new(4));
        let handle = WriterHandle::new(tx, pending, 4, Duration::from_millis(20));

        let header = Header::request(1, 0);
        let result = handle.send(OutboundFrame::new(&header, Bytes::new())).await;
        assert!(matches!(result, Err(FlowError::BackpressureTimeout)));
    }

    #[test]
    fn test_build_remaining_slices_partial_header() {
        let header = Header::request(42, 5);
        let batch = vec![OutboundFrame::new(&header, Bytes::from_static(b"hello"))];

        let slices = build_remaining_slices(&batch, 5);
        assert_eq!(slices.len(), 2);
        assert_eq!(slices[0].len(), HEADER_SIZE - 5);
        assert_eq!(slices[1].len(), 5);

        let slices = build_remaining_slices(&batch, HEADER_SIZE + 2);
        assert_eq!(slices.len(), 1);
        assert_eq!(slices[0].len(), 3);
    }

    #[tokio::test]
    async fn test_write_batch_multiple() {
        let mut buf = Cursor::new(Vec::new());

        let batch: Vec<_> = (1..=5)
            .map(|i| OutboundFrame::new(&Header::request(i, 3), Bytes::from_static(b"abc")))
            .collect();

        write_batch(&mut buf, &batch).await.unwrap();
        assert_eq!(buf.into_inner().len(), 5 * (HEADER_SIZE + 3));
    }

    /// Accepts at most three bytes per write.
    struct Trickle(Vec<u8>);

    impl AsyncWrite for Trickle {
        fn poll_write(
            mut self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            buf: &[u8],
        ) -> std::task::Poll<std::io::Result<usize>> {
            let n = buf.len().min(3);
            self.0.extend_from_slice(&buf[..n]);
            std::task::Poll::Ready(Ok(n))
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_write_batch_resumes_short_writes() {
        let batch = vec![
            OutboundFrame::new(&Header::request(1, 5), Bytes::from_static(b"hello")),
            OutboundFrame::new(&Header::request(2, 0), Bytes::new()),
            OutboundFrame::new(&Header::request(3, 2), Bytes::from_static(b"ok")),
        ];
        let mut out = Trickle(Vec::new());
        write_batch(&mut out, &batch).await.unwrap();

        let mut buffer = FrameBuffer::new();
        let frames = buffer.push(&out.0).unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].payload(), b"hello");
        assert_eq!(frames[1].payload_len(), 0);
        assert_eq!(frames[2].call_id(), 3);
        assert!(!buffer.has_partial());
    }

    #[tokio::test]
    async fn test_writer_shutdown_on_handle_drop() {
        let (client, mut server) = duplex(4096);
        let (handle, task) = spawn_writer_task_default(client);

        drop(handle);

        assert!(task.await.unwrap().is_ok());
        let mut rest = Vec::new();
        server.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }
}
