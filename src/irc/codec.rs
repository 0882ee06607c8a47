//! IRC line codec: frames a TCP byte stream into raw lines.
//!
//! Splits on `\r\n` and hands each frame up unparsed, so a line the
//! grammar rejects costs one log entry instead of the connection. Outgoing
//! lines are sanitized (CR/LF stripped, truncated to 510 bytes) before
//! the terminator is appended.
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Longest line body we send; 512 on the wire with `\r\n`.
pub const MAX_LINE_BODY: usize = 510;

/// Most bytes we hold while waiting for a terminator.
pub const MAX_BUFFERED: usize = 8191;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("no line terminator within {MAX_BUFFERED} buffered bytes")]
    LineTooLong,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Strip CR/LF and cut to [`MAX_LINE_BODY`] bytes.
pub fn sanitize(line: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(line.len().min(MAX_LINE_BODY));
    out.extend(
        line.iter()
            .copied()
            .filter(|b| *b != b'\r' && *b != b'\n')
            .take(MAX_LINE_BODY),
    );
    out.freeze()
}

#[derive(Debug, Default)]
pub struct LineCodec;

impl Decoder for LineCodec {
    type Item = Bytes;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match src.windows(2).position(|w| w == b"\r\n") {
            Some(pos) => {
                let frame = src.split_to(pos).freeze();
                src.advance(2); // skip \r\n
                Ok(Some(frame))
            }
            // A trailing `\r` is half a terminator, not body.
            None if src.len() - usize::from(src.ends_with(b"\r")) > MAX_BUFFERED => {
                Err(CodecError::LineTooLong)
            }
            None => Ok(None),
        }
    }
}

impl Encoder<Bytes> for LineCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let line = sanitize(&item);
        dst.reserve(line.len() + 2);
        dst.put_slice(&line);
        dst.put_slice(b"\r\n");
        Ok(())
    }
}
