//! Read side: pull frames from a byte source, decode them and hand records to the caller.
//!
//! [`Records`] is the pull interface; [`read`] and [`read_filtered`] drive a callback over it.
//! Cancellation is polled before each frame is extracted and before each payload is decoded.

use crate::codec::{Codec, CodecError, DEFAULT_MAX_DEPTH};
use crate::filter::{self, FilterError, FilterProgram};
use crate::frame::{self, FrameError, Split, DEFAULT_MAX_FRAME_LEN, HEADER_LEN};
use crate::record::Record;
use std::io::{ErrorKind, Read};
use std::ops::ControlFlow;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// What to do with a record whose filter evaluation fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvalErrorPolicy {
    /// Stop reading and return the error.
    #[default]
    Abort,
    /// Log at `warn` and drop the record.
    Skip,
}

#[derive(Debug, Clone)]
pub struct ReaderConfig {
    /// Largest accepted declared payload length.
    pub max_frame_len: usize,
    /// Bytes requested from the source per read.
    pub read_chunk: usize,
    pub max_depth: usize,
    pub eval_error_policy: EvalErrorPolicy,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        ReaderConfig {
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            read_chunk: 8 * 1024,
            max_depth: DEFAULT_MAX_DEPTH,
            eval_error_policy: EvalErrorPolicy::Abort,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    #[error("Frame: {0}")]
    Frame(#[from] FrameError),
    #[error("Record {index}: {source}")]
    Decode {
        index: u64,
        #[source]
        source: CodecError,
    },
    #[error("Filter: {0}")]
    Filter(#[from] FilterError),
    #[error("Read cancelled")]
    Cancelled,
}

impl ReadError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ReadError::Cancelled)
    }

    pub fn is_truncated(&self) -> bool {
        matches!(self, ReadError::Frame(FrameError::Truncated { .. }))
    }
}

/// Counters for one completed read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadSummary {
    /// Records decoded.
    pub records: u64,
    /// Records passed to the callback.
    pub accepted: u64,
    /// Records rejected by the filter.
    pub skipped: u64,
    /// The callback asked to stop.
    pub stopped: bool,
}

/// Iterator over the records of a framed stream. Fused after the first error.
pub struct Records<R> {
    source: R,
    cancel: CancellationToken,
    codec: Codec,
    max_frame_len: usize,
    read_chunk: usize,
    buf: Vec<u8>,
    start: usize,
    index: u64,
    eof: bool,
    done: bool,
}

impl<R: Read> Records<R> {
    pub fn new(source: R, cancel: CancellationToken, config: &ReaderConfig) -> Self {
        Records {
            source,
            cancel,
            codec: Codec::new(config.max_depth),
            max_frame_len: config.max_frame_len,
            read_chunk: config.read_chunk.max(1),
            buf: Vec::new(),
            start: 0,
            index: 0,
            eof: false,
            done: false,
        }
    }

    fn next_record(&mut self) -> Result<Option<Record>, ReadError> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(ReadError::Cancelled);
            }
            match frame::split_frame(&self.buf[self.start..], self.max_frame_len)? {
                Split::Frame { payload, consumed } => {
                    if self.cancel.is_cancelled() {
                        return Err(ReadError::Cancelled);
                    }
                    let index = self.index;
                    let record = self
                        .codec
                        .decode_record(payload)
                        .map_err(|source| ReadError::Decode { index, source })?;
                    trace!(index, len = consumed - HEADER_LEN, "decoded frame");
                    self.start += consumed;
                    self.index += 1;
                    return Ok(Some(record));
                }
                Split::Incomplete { needed } => {
                    if self.eof {
                        frame::finish(self.buf.len() - self.start)?;
                        return Ok(None);
                    }
                    self.fill(needed)?;
                }
            }
        }
    }

    /// Compact consumed bytes away and append one read's worth from the source.
    fn fill(&mut self, needed: usize) -> Result<(), ReadError> {
        if self.start > 0 {
            self.buf.drain(..self.start);
            self.start = 0;
        }
        self.buf.reserve(needed);
        let old = self.buf.len();
        self.buf.resize(old + self.read_chunk, 0);
        loop {
            match self.source.read(&mut self.buf[old..]) {
                Ok(n) => {
                    self.buf.truncate(old + n);
                    self.eof = n == 0;
                    return Ok(());
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.buf.truncate(old);
                    return Err(e.into());
                }
            }
        }
    }
}

impl<R: Read> Iterator for Records<R> {
    type Item = Result<Record, ReadError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let result = match self.next_record() {
            Err(e) if !e.is_cancelled() && self.cancel.is_cancelled() => Err(ReadError::Cancelled),
            other => other,
        };
        if !matches!(result, Ok(Some(_))) {
            self.done = true;
        }
        result.transpose()
    }
}

/// Read every record from `source` into `f` until end of input, an error, cancellation, or
/// `f` returning [`ControlFlow::Break`].
pub fn read<R, F>(cancel: &CancellationToken, source: R, f: F) -> Result<ReadSummary, ReadError>
where
    R: Read,
    F: FnMut(Record) -> ControlFlow<()>,
{
    read_filtered(cancel, source, None, &ReaderConfig::default(), f)
}

/// Like [`read`], passing only records selected by `program` to `f`.
pub fn read_filtered<R, F>(
    cancel: &CancellationToken,
    source: R,
    program: Option<&FilterProgram>,
    config: &ReaderConfig,
    mut f: F,
) -> Result<ReadSummary, ReadError>
where
    R: Read,
    F: FnMut(Record) -> ControlFlow<()>,
{
    debug!(filter = ?program.map(FilterProgram::source), "reading record stream");
    let mut summary = ReadSummary::default();
    for item in Records::new(source, cancel.clone(), config) {
        let record = item?;
        summary.records += 1;
        let keep = match filter::evaluate(program, &record) {
            Ok(keep) => keep,
            Err(e) if config.eval_error_policy == EvalErrorPolicy::Skip => {
                warn!(index = summary.records - 1, error = %e, "filter evaluation failed; skipping record");
                false
            }
            Err(e) => return Err(e.into()),
        };
        if !keep {
            summary.skipped += 1;
            continue;
        }
        summary.accepted += 1;
        if f(record).is_break() {
            summary.stopped = true;
            break;
        }
    }
    debug!(
        records = summary.records,
        accepted = summary.accepted,
        skipped = summary.skipped,
        stopped = summary.stopped,
        "record stream finished"
    );
    Ok(summary)
}
