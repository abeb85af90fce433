//! COMPRESS=DEFLATE splice (RFC 4978).
//!
//! Once negotiated, every outbound chunk is deflated before it reaches the
//! socket and every inbound chunk is inflated before it reaches the framing
//! reader; no cleartext crosses the socket while the splice is active. The
//! DEFLATE streams are raw (no zlib header) and the deflater sync-flushes
//! after each chunk so the peer can act on it immediately.
//!
//! The codec runs behind a small message protocol, either dispatched
//! synchronously in-process or offloaded to a worker task; the splice is
//! identical either way.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::{Error, Result};

/// Output buffer granularity for the DEFLATE streams.
const BUF_CHUNK: usize = 4096;

/// Request half of the codec message protocol.
#[derive(Debug)]
pub(crate) enum CompressRequest {
    /// Initializes (or resets) both stream states.
    Start,
    /// Compress a chunk for the socket.
    Deflate(Vec<u8>),
    /// Decompress a chunk for the framing reader.
    Inflate(Vec<u8>),
}

/// Reply half of the codec message protocol.
#[derive(Debug)]
pub(crate) enum CompressReply {
    /// Compressed bytes, ready for the socket.
    Deflated(Vec<u8>),
    /// Decompressed bytes, ready for the framing reader.
    Inflated(Vec<u8>),
    /// The stream state is broken; fatal for the connection.
    Failed(String),
}

/// Streaming raw-deflate compressor.
pub(crate) struct Deflater {
    inner: Compress,
}

impl Deflater {
    fn new() -> Self {
        Self {
            inner: Compress::new(Compression::default(), false),
        }
    }

    /// Compresses one chunk, sync-flushing so the output is complete.
    #[allow(clippy::cast_possible_truncation)]
    fn process(&mut self, input: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut consumed = 0;
        loop {
            let before_in = self.inner.total_in() as usize;
            let before_out = self.inner.total_out() as usize;
            let start = out.len();
            out.resize(start + BUF_CHUNK, 0);

            let status = self
                .inner
                .compress(&input[consumed..], &mut out[start..], FlushCompress::Sync)
                .map_err(|e| Error::Compress(e.to_string()))?;

            let used = self.inner.total_in() as usize - before_in;
            let produced = self.inner.total_out() as usize - before_out;
            consumed += used;
            out.truncate(start + produced);

            if matches!(status, Status::StreamEnd) {
                break;
            }
            if used == 0 && produced == 0 {
                break;
            }
            // The flush fit: all input taken and room to spare.
            if consumed == input.len() && produced < BUF_CHUNK {
                break;
            }
        }
        Ok(out)
    }
}

/// Streaming raw-inflate decompressor.
pub(crate) struct Inflater {
    inner: Decompress,
}

impl Inflater {
    fn new() -> Self {
        Self {
            inner: Decompress::new(false),
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn process(&mut self, input: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut consumed = 0;
        loop {
            let before_in = self.inner.total_in() as usize;
            let before_out = self.inner.total_out() as usize;
            let start = out.len();
            out.resize(start + BUF_CHUNK, 0);

            let status = self
                .inner
                .decompress(&input[consumed..], &mut out[start..], FlushDecompress::None)
                .map_err(|e| Error::Compress(e.to_string()))?;

            let used = self.inner.total_in() as usize - before_in;
            let produced = self.inner.total_out() as usize - before_out;
            consumed += used;
            out.truncate(start + produced);

            if matches!(status, Status::StreamEnd) {
                break;
            }
            if used == 0 && produced == 0 {
                break;
            }
            if consumed == input.len() && produced < BUF_CHUNK {
                break;
            }
        }
        Ok(out)
    }
}

/// Runs a codec request against a stream pair.
fn dispatch(
    deflater: &mut Deflater,
    inflater: &mut Inflater,
    request: CompressRequest,
) -> Option<CompressReply> {
    match request {
        CompressRequest::Start => {
            *deflater = Deflater::new();
            *inflater = Inflater::new();
            None
        }
        CompressRequest::Deflate(bytes) => Some(match deflater.process(&bytes) {
            Ok(out) => CompressReply::Deflated(out),
            Err(e) => CompressReply::Failed(e.to_string()),
        }),
        CompressRequest::Inflate(bytes) => Some(match inflater.process(&bytes) {
            Ok(out) => CompressReply::Inflated(out),
            Err(e) => CompressReply::Failed(e.to_string()),
        }),
    }
}

/// The installed splice: both directions of the DEFLATE codec.
pub(crate) enum Splice {
    /// Degenerate channel: requests dispatch synchronously in-process.
    Inline {
        deflater: Deflater,
        inflater: Inflater,
    },
    /// Codec offloaded to a worker task.
    Worker {
        tx: mpsc::UnboundedSender<CompressRequest>,
        rx: mpsc::UnboundedReceiver<CompressReply>,
        handle: JoinHandle<()>,
    },
}

impl Splice {
    /// Creates an in-process splice.
    pub(crate) fn inline() -> Self {
        let mut deflater = Deflater::new();
        let mut inflater = Inflater::new();
        dispatch(&mut deflater, &mut inflater, CompressRequest::Start);
        Self::Inline { deflater, inflater }
    }

    /// Creates a splice backed by a worker task.
    pub(crate) fn worker() -> Self {
        let (req_tx, mut req_rx) = mpsc::unbounded_channel();
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();

        let handle = tokio::spawn(async move {
            let mut deflater = Deflater::new();
            let mut inflater = Inflater::new();
            while let Some(request) = req_rx.recv().await {
                if let Some(reply) = dispatch(&mut deflater, &mut inflater, request)
                    && reply_tx.send(reply).is_err()
                {
                    break;
                }
            }
        });

        let _ = req_tx.send(CompressRequest::Start);
        Self::Worker {
            tx: req_tx,
            rx: reply_rx,
            handle,
        }
    }

    /// Compresses an outbound chunk.
    pub(crate) async fn deflate(&mut self, bytes: Vec<u8>) -> Result<Vec<u8>> {
        match self.round_trip(CompressRequest::Deflate(bytes)).await? {
            CompressReply::Deflated(out) => Ok(out),
            CompressReply::Inflated(_) => {
                Err(Error::Compress("codec reply out of order".to_string()))
            }
            CompressReply::Failed(message) => Err(Error::Compress(message)),
        }
    }

    /// Decompresses an inbound chunk.
    pub(crate) async fn inflate(&mut self, bytes: Vec<u8>) -> Result<Vec<u8>> {
        match self.round_trip(CompressRequest::Inflate(bytes)).await? {
            CompressReply::Inflated(out) => Ok(out),
            CompressReply::Deflated(_) => {
                Err(Error::Compress("codec reply out of order".to_string()))
            }
            CompressReply::Failed(message) => Err(Error::Compress(message)),
        }
    }

    async fn round_trip(&mut self, request: CompressRequest) -> Result<CompressReply> {
        match self {
            Self::Inline { deflater, inflater } => dispatch(deflater, inflater, request)
                .ok_or_else(|| Error::Compress("codec produced no reply".to_string())),
            Self::Worker { tx, rx, .. } => {
                tx.send(request)
                    .map_err(|_| Error::Compress("worker terminated".to_string()))?;
                rx.recv()
                    .await
                    .ok_or_else(|| Error::Compress("worker terminated".to_string()))
            }
        }
    }

    /// Tears the splice down, terminating any worker.
    pub(crate) fn shutdown(self) {
        if let Self::Worker { handle, tx, rx } = self {
            drop(tx);
            drop(rx);
            handle.abort();
        }
    }
}
