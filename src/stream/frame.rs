//! Newline-delimited JSON frame parser.
//!
//! A [`FrameReader`] turns the live response body into a lazy sequence of
//! frames. Each line is one JSON object; blank lines are heartbeats sent by
//! the server and surface as [`Frame::KeepAlive`]. The sequence ends when the
//! body ends, and any error terminates it for good.

use std::time::Duration;

use bytes::BytesMut;
use futures_util::{Stream, StreamExt};
use serde_json::Value;
use thiserror::Error;

use crate::transport::{ByteStream, TransportError};

const FRAME_SNIPPET_LEN: usize = 120;

/// One item read off the wire.
#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    /// A complete JSON object frame.
    Message(RawFrame),
    /// Blank heartbeat line.
    KeepAlive,
}

/// A JSON object frame with its original text.
#[derive(Clone, Debug, PartialEq)]
pub struct RawFrame {
    pub text: String,
    pub value: Value,
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("no data received for {0:?}")]
    ReadTimeout(Duration),

    #[error("frame is not valid utf-8: `{snippet}`")]
    InvalidUtf8 { snippet: String },

    #[error("malformed frame `{snippet}`: {source}")]
    Malformed {
        snippet: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("frame is not a json object: `{snippet}`")]
    NotAnObject { snippet: String },

    #[error("unexpected frame shape `{snippet}`: {source}")]
    Decode {
        snippet: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Reads frames from a live body.
pub struct FrameReader {
    body: Option<ByteStream>,
    buffer: BytesMut,
    read_timeout: Duration,
    body_finished: bool,
}

impl FrameReader {
    /// `read_timeout` bounds the wait for each chunk, heartbeats included.
    pub fn new(body: ByteStream, read_timeout: Duration) -> Self {
        Self {
            body: Some(body),
            buffer: BytesMut::new(),
            read_timeout,
            body_finished: false,
        }
    }

    /// Returns the next frame, `Ok(None)` once the body ended or was closed.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        loop {
            if let Some(line) = self.take_line() {
                return self.finish(parse_line(&line)).map(Some);
            }

            if self.body_finished {
                // A final line without its newline is still a frame.
                if self.buffer.iter().any(|byte| !byte.is_ascii_whitespace()) {
                    let line = self.buffer.split().freeze();
                    return self.finish(parse_line(&line)).map(Some);
                }
                self.close();
                return Ok(None);
            }

            let Some(body) = self.body.as_mut() else {
                return Ok(None);
            };

            match tokio::time::timeout(self.read_timeout, body.next()).await {
                Ok(Some(Ok(chunk))) => self.buffer.extend_from_slice(&chunk),
                Ok(Some(Err(err))) => {
                    return self.finish(Err(FrameError::Transport(err))).map(Some)
                }
                Ok(None) => self.body_finished = true,
                Err(_) => {
                    let timeout = FrameError::ReadTimeout(self.read_timeout);
                    return self.finish(Err(timeout)).map(Some);
                }
            }
        }
    }

    /// Drops the underlying body, closing the connection.
    pub fn close(&mut self) {
        self.body = None;
        self.body_finished = false;
        self.buffer.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.body.is_none()
    }

    /// Converts the reader into a `Stream` of frames.
    pub fn into_stream(self) -> impl Stream<Item = Result<Frame, FrameError>> {
        futures_util::stream::unfold(self, |mut reader| async move {
            match reader.next_frame().await {
                Ok(Some(frame)) => Some((Ok(frame), reader)),
                Ok(None) => None,
                Err(err) => Some((Err(err), reader)),
            }
        })
    }

    fn take_line(&mut self) -> Option<BytesMut> {
        let newline = self.buffer.iter().position(|byte| *byte == b'\n')?;
        let mut line = self.buffer.split_to(newline + 1);
        line.truncate(newline);
        if line.last() == Some(&b'\r') {
            line.truncate(newline - 1);
        }
        Some(line)
    }

    fn finish(&mut self, result: Result<Frame, FrameError>) -> Result<Frame, FrameError> {
        if result.is_err() {
            self.close();
        }
        result
    }
}

fn parse_line(line: &[u8]) -> Result<Frame, FrameError> {
    let text = std::str::from_utf8(line).map_err(|_| FrameError::InvalidUtf8 {
        snippet: snippet(&String::from_utf8_lossy(line)),
    })?;
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(Frame::KeepAlive);
    }

    let value: Value = serde_json::from_str(trimmed).map_err(|source| FrameError::Malformed {
        snippet: snippet(trimmed),
        source,
    })?;
    if !value.is_object() {
        return Err(FrameError::NotAnObject {
            snippet: snippet(trimmed),
        });
    }

    Ok(Frame::Message(RawFrame {
        text: trimmed.to_string(),
        value,
    }))
}

pub(crate) fn snippet(text: &str) -> String {
    text.chars().take(FRAME_SNIPPET_LEN).collect()
}
