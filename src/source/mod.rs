//! Newline-delimited payload files, plain or gzipped.
//!
//! Payloads are raw bytes: lines are split on `\n` without any text
//! decoding, so binary or non-UTF-8 lines pass through untouched.

mod gzip;

pub use gzip::{is_gzip, LineWriter};

use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream, StreamExt};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

use crate::types::{Error, Result};
use gzip::ChunkReader;

struct LineState {
    path: PathBuf,
    looped: bool,
    cancel: CancellationToken,
    reader: Option<ChunkReader>,
    buf: BytesMut,
    /// Lines produced during the current pass.
    produced: u64,
}

/// Lazily read non-blank lines from `path`, without their line terminator.
///
/// `.gz` files are inflated on the fly. With `looped` the file is reopened
/// at end of file until `cancel` fires. A looped file without any payload
/// line ends the stream instead of spinning. Read errors are yielded once
/// and end the stream.
pub fn read_lines(
    path: impl Into<PathBuf>,
    looped: bool,
    cancel: CancellationToken,
) -> BoxStream<'static, Result<Bytes>> {
    let state = LineState {
        path: path.into(),
        looped,
        cancel,
        reader: None,
        buf: BytesMut::new(),
        produced: 0,
    };

    stream::unfold(Some(state), |state| async move {
        let mut state = state?;
        loop {
            if state.cancel.is_cancelled() {
                return None;
            }

            if state.reader.is_none() {
                match ChunkReader::open(&state.path).await {
                    Ok(reader) => state.reader = Some(reader),
                    Err(e) => {
                        let err = Error::config(format!(
                            "failed opening source {}: {}",
                            state.path.display(),
                            e
                        ));
                        return Some((Err(err), None));
                    }
                }
            }

            if let Some(pos) = state.buf.iter().position(|&b| b == b'\n') {
                let mut line = state.buf.split_to(pos + 1);
                line.truncate(pos);
                if let Some(item) = payload(line) {
                    state.produced += 1;
                    return Some((Ok(item), Some(state)));
                }
                continue;
            }

            let reader = state.reader.as_mut()?;
            match reader.fill(&mut state.buf).await {
                Ok(true) => {}
                Ok(false) => {
                    if !state.buf.is_empty() {
                        if let Some(item) = payload(state.buf.split()) {
                            state.produced += 1;
                            return Some((Ok(item), Some(state)));
                        }
                    }
                    if !state.looped || state.produced == 0 {
                        return None;
                    }
                    tracing::debug!(path = %state.path.display(), lines = state.produced, "restarting source");
                    state.reader = None;
                    state.produced = 0;
                }
                Err(e) => return Some((Err(Error::Io(e)), None)),
            }
        }
    })
    .boxed()
}

/// Strip a trailing `\r`; blank lines carry no payload.
fn payload(mut line: BytesMut) -> Option<Bytes> {
    if line.last() == Some(&b'\r') {
        line.truncate(line.len() - 1);
    }
    if line.iter().all(u8::is_ascii_whitespace) {
        return None;
    }
    Some(line.freeze())
}
