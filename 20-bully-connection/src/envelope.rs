//! Wire envelope exchanged between peers.
//!
//! Every message travelling over a peer link is wrapped in an [`Envelope`]
//! that names its logical [`Layer`], carries an arbitrary JSON payload and
//! identifies the sender. Envelopes are framed as newline-delimited JSON, so
//! a link can be poked at with `nc` while debugging.

use std::io;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Numeric identity of a node. Doubles as its election priority.
pub type HostId = u64;

/// Payload carried by liveness acknowledgements.
pub const ACK_MESSAGE: &str = "ACK";

/// Payload carried by liveness probes on the connection layer.
pub const PING_MESSAGE: &str = "PING";

/// Longest accepted frame, newline excluded. Envelopes are a few dozen bytes.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Logical channel multiplexed over a single peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Layer {
    /// Liveness traffic, answered directly by the listener.
    Connection,
    /// Election traffic, forwarded to the coordinator.
    Bully,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub layer: Layer,
    pub message: Value,
    pub host_id: HostId,
}

impl Envelope {
    /// The acknowledgement a node sends on the connection layer.
    pub fn ack(host_id: HostId) -> Self {
        Self {
            layer: Layer::Connection,
            message: Value::from(ACK_MESSAGE),
            host_id,
        }
    }

    pub fn probe(host_id: HostId) -> Self {
        Self {
            layer: Layer::Connection,
            message: Value::from(PING_MESSAGE),
            host_id,
        }
    }

    pub fn bully(message: Value, host_id: HostId) -> Self {
        Self {
            layer: Layer::Bully,
            message,
            host_id,
        }
    }

    /// Returns true when this is a connection-layer ACK sent by `from`.
    pub fn is_ack_from(&self, from: HostId) -> bool {
        self.layer == Layer::Connection
            && self.host_id == from
            && self.message.as_str() == Some(ACK_MESSAGE)
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    /// The underlying stream failed; the connection is no longer usable.
    #[error("envelope i/o failed: {0}")]
    Io(#[from] io::Error),
    /// A frame arrived but was not a valid envelope. The stream is still in sync.
    #[error("malformed envelope: {0}")]
    Decode(#[source] serde_json::Error),
    /// A frame ran past [`MAX_FRAME_LEN`]. It was discarded up to its newline.
    #[error("envelope frame exceeds {limit} bytes")]
    FrameTooLong { limit: usize },
    #[error("failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),
}

impl CodecError {
    /// True when only the offending frame was lost and the reader can keep
    /// going.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Decode(_) | Self::FrameTooLong { .. })
    }
}

/// Reads the next envelope from `reader`.
///
/// Returns `Ok(None)` once the peer closes the stream. Blank lines are
/// skipped. A line that does not parse, including one that is not valid
/// UTF-8, is consumed and reported as [`CodecError::Decode`]; a line longer
/// than [`MAX_FRAME_LEN`] is skipped and reported as
/// [`CodecError::FrameTooLong`]. Either way the reader is left at the next
/// frame.
pub async fn read_envelope<R>(reader: &mut R) -> Result<Option<Envelope>, CodecError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    loop {
        line.clear();
        let limit = MAX_FRAME_LEN as u64 + 1;
        let bytes = (&mut *reader).take(limit).read_until(b'\n', &mut line).await?;
        if bytes == 0 {
            return Ok(None);
        }

        if line.len() > MAX_FRAME_LEN && line.last() != Some(&b'\n') {
            skip_line(reader).await?;
            return Err(CodecError::FrameTooLong {
                limit: MAX_FRAME_LEN,
            });
        }

        let trimmed = trim_line_ending(&line);
        if trimmed.is_empty() {
            continue;
        }

        return serde_json::from_slice(trimmed)
            .map(Some)
            .map_err(CodecError::Decode);
    }
}

pub async fn write_envelope<W>(writer: &mut W, envelope: &Envelope) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    let mut encoded = serde_json::to_vec(envelope).map_err(CodecError::Encode)?;
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

fn trim_line_ending(mut line: &[u8]) -> &[u8] {
    while let [rest @ .., b'\n' | b'\r'] = line {
        line = rest;
    }
    line
}

/// Discards input up to and including the next newline without buffering it.
async fn skip_line<R>(reader: &mut R) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(());
        }
        let (consumed, done) = match available.iter().position(|byte| *byte == b'\n') {
            Some(newline) => (newline + 1, true),
            None => (available.len(), false),
        };
        reader.consume(consumed);
        if done {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::BufReader;

    #[test]
    fn ack_has_the_documented_shape() {
        let encoded = serde_json::to_value(Envelope::ack(1)).expect("encode ack");
        assert_eq!(
            encoded,
            json!({"layer": "CONNECTION", "message": "ACK", "host_id": 1})
        );
    }

    #[test]
    fn bully_envelope_accepts_string_and_object_payloads() {
        let text: Envelope =
            serde_json::from_str(r#"{"layer":"BULLY","message":"ELECTION","host_id":2}"#)
                .expect("string payload");
        assert_eq!(text, Envelope::bully(json!("ELECTION"), 2));

        let object: Envelope =
            serde_json::from_str(r#"{"layer":"BULLY","message":{"term":4},"host_id":7}"#)
                .expect("object payload");
        assert_eq!(object.message["term"], 4);
    }

    #[test]
    fn unknown_layer_is_rejected() {
        let result =
            serde_json::from_str::<Envelope>(r#"{"layer":"GOSSIP","message":"hi","host_id":2}"#);
        assert!(result.is_err());
    }

    #[test]
    fn is_ack_from_checks_sender_and_layer() {
        assert!(Envelope::ack(3).is_ack_from(3));
        assert!(!Envelope::ack(3).is_ack_from(2));
        assert!(!Envelope::bully(json!("ACK"), 3).is_ack_from(3));
        assert!(!Envelope::probe(3).is_ack_from(3));
    }

    #[tokio::test]
    async fn malformed_line_does_not_desync_the_stream() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let mut reader = BufReader::new(reader);

        writer
            .write_all(b"{not json}\n\n")
            .await
            .expect("write garbage");
        write_envelope(&mut writer, &Envelope::probe(5))
            .await
            .expect("write probe");
        drop(writer);

        let first = read_envelope(&mut reader).await;
        assert!(matches!(first, Err(CodecError::Decode(_))));

        let second = read_envelope(&mut reader)
            .await
            .expect("read probe")
            .expect("probe should follow the bad line");
        assert_eq!(second, Envelope::probe(5));

        assert!(read_envelope(&mut reader).await.expect("eof").is_none());
    }

    #[tokio::test]
    async fn invalid_utf8_line_is_a_decode_error() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let mut reader = BufReader::new(reader);

        writer.write_all(b"\xff\xfe garbage\n").await.expect("write bytes");
        write_envelope(&mut writer, &Envelope::probe(5))
            .await
            .expect("write probe");
        drop(writer);

        let first = read_envelope(&mut reader).await;
        assert!(matches!(first, Err(CodecError::Decode(_))));
        assert!(first.unwrap_err().is_recoverable());

        let second = read_envelope(&mut reader).await.expect("read probe");
        assert_eq!(second, Some(Envelope::probe(5)));
    }

    #[tokio::test]
    async fn oversize_frame_is_skipped_up_to_its_newline() {
        let (mut writer, reader) = tokio::io::duplex(8 * 1024);
        let mut reader = BufReader::new(reader);

        let feeder = tokio::spawn(async move {
            let flood = vec![b'x'; MAX_FRAME_LEN * 2];
            writer.write_all(&flood).await.expect("write flood");
            writer.write_all(b"\n").await.expect("write newline");
            write_envelope(&mut writer, &Envelope::ack(2))
                .await
                .expect("write ack");
        });

        let first = read_envelope(&mut reader).await;
        assert!(matches!(
            first,
            Err(CodecError::FrameTooLong {
                limit: MAX_FRAME_LEN
            })
        ));

        let second = read_envelope(&mut reader).await.expect("read ack");
        assert_eq!(second, Some(Envelope::ack(2)));
        feeder.await.expect("feeder task");
    }

    #[tokio::test]
    async fn frame_at_the_limit_is_accepted() {
        let (mut writer, reader) = tokio::io::duplex(8 * 1024);
        let mut reader = BufReader::new(reader);

        // Pad the payload so the whole line is exactly MAX_FRAME_LEN bytes.
        let bare = serde_json::to_vec(&Envelope::bully(json!(""), 1)).expect("encode");
        let padding = "p".repeat(MAX_FRAME_LEN - bare.len());
        let envelope = Envelope::bully(json!(padding), 1);
        let expected = envelope.clone();

        let feeder = tokio::spawn(async move {
            write_envelope(&mut writer, &envelope)
                .await
                .expect("write envelope");
        });

        let read = read_envelope(&mut reader).await.expect("read envelope");
        assert_eq!(read, Some(expected));
        feeder.await.expect("feeder task");
    }

    #[test]
    fn encode_failures_are_not_reported_as_malformed_input() {
        let source = serde_json::from_str::<Value>("{").unwrap_err();
        let err = CodecError::Encode(source);
        assert!(err.to_string().starts_with("failed to encode envelope"));
        assert!(!err.is_recoverable());

        let io = CodecError::from(io::Error::from(io::ErrorKind::ConnectionReset));
        assert!(!io.is_recoverable());
    }
}
