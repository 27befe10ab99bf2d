//! Splits a byte stream into complete application frames under one of four
//! pluggable framing modes.
//!
//! Grounded on `original_source/network/packet.go` (`NoHandling`, `FixedLength`,
//! `HeaderBodySeparate`, `Delimiter`) — the Go source only names the modes; the
//! exact byte semantics (terminator inclusion, 4-byte authoritative length) come
//! from spec.md §4.1.

use crate::config::{PacketConfig, PacketMode};
use crate::error::GatewayError;
use tokio::io::{AsyncRead, AsyncReadExt};

/// A single complete application frame read off a southbound connection.
pub type Frame = Vec<u8>;

/// Reads one frame at a time from an async byte stream under a configured mode.
pub struct Framer {
    mode: PacketMode,
    fixed_length: usize,
    header_length: usize,
    delimiter: Vec<u8>,
}

impl Framer {
    pub fn new(config: &PacketConfig) -> Result<Self, GatewayError> {
        if config.mode == PacketMode::FixedLength && config.fixed_length == 0 {
            return Err(GatewayError::Config(
                "fixedLength framing requires a non-zero fixed_length".into(),
            ));
        }
        if config.mode == PacketMode::HeaderBodySeparate && config.header_length < 4 {
            return Err(GatewayError::Config(
                "headerBodySeparate framing requires header_length >= 4".into(),
            ));
        }
        Ok(Self {
            mode: config.mode,
            fixed_length: config.fixed_length,
            header_length: config.header_length,
            delimiter: config.delimiter.clone().into_bytes(),
        })
    }

    /// Read exactly one frame from `reader`. Returns `Ok(None)` on clean EOF
    /// with no partial data; any other truncation is a framing error.
    pub async fn read_frame<R>(&self, reader: &mut R) -> Result<Option<Frame>, GatewayError>
    where
        R: AsyncRead + Unpin,
    {
        match self.mode {
            PacketMode::None => self.read_delimited(reader, b"\r\n").await,
            PacketMode::Delimiter => self.read_delimited(reader, &self.delimiter).await,
            PacketMode::FixedLength => self.read_fixed_length(reader).await,
            PacketMode::HeaderBodySeparate => self.read_header_body(reader).await,
        }
    }

    async fn read_delimited<R>(
        &self,
        reader: &mut R,
        delim: &[u8],
    ) -> Result<Option<Frame>, GatewayError>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            let n = reader.read(&mut byte).await?;
            if n == 0 {
                if buf.is_empty() {
                    return Ok(None);
                }
                return Err(GatewayError::Framing(
                    "stream closed mid-frame before delimiter".into(),
                ));
            }
            buf.push(byte[0]);
            if buf.len() >= delim.len() && buf[buf.len() - delim.len()..] == *delim {
                return Ok(Some(buf));
            }
        }
    }

    async fn read_fixed_length<R>(&self, reader: &mut R) -> Result<Option<Frame>, GatewayError>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = vec![0u8; self.fixed_length];
        match read_exact_or_eof(reader, &mut buf).await? {
            ReadOutcome::Eof => Ok(None),
            ReadOutcome::Short(n) => Err(GatewayError::Framing(format!(
                "expected {} fixed-length bytes, got {} before EOF",
                self.fixed_length, n
            ))),
            ReadOutcome::Full => Ok(Some(buf)),
        }
    }

    async fn read_header_body<R>(&self, reader: &mut R) -> Result<Option<Frame>, GatewayError>
    where
        R: AsyncRead + Unpin,
    {
        let mut header = vec![0u8; self.header_length];
        match read_exact_or_eof(reader, &mut header).await? {
            ReadOutcome::Eof => return Ok(None),
            ReadOutcome::Short(n) => {
                return Err(GatewayError::Framing(format!(
                    "expected {}-byte header, got {} before EOF",
                    self.header_length, n
                )))
            }
            ReadOutcome::Full => {}
        }

        // The first 4 bytes are always the authoritative big-endian body length;
        // any remaining configured header bytes are opaque and discarded. Open
        // question resolved in DESIGN.md.
        let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;

        let mut body = vec![0u8; len];
        match read_exact_or_eof(reader, &mut body).await? {
            ReadOutcome::Eof => Err(GatewayError::Framing(
                "stream closed before header-declared body".into(),
            )),
            ReadOutcome::Short(n) => Err(GatewayError::Framing(format!(
                "expected {} body bytes, got {} before EOF",
                len, n
            ))),
            ReadOutcome::Full => Ok(Some(body)),
        }
    }
}

enum ReadOutcome {
    Full,
    Short(usize),
    Eof,
}

/// Like `AsyncReadExt::read_exact`, but distinguishes "zero bytes read, clean
/// EOF" from "some bytes read, then EOF" (a framing error) instead of just
/// erroring on both.
async fn read_exact_or_eof<R>(reader: &mut R, buf: &mut [u8]) -> Result<ReadOutcome, GatewayError>
where
    R: AsyncRead + Unpin,
{
    if buf.is_empty() {
        return Ok(ReadOutcome::Full);
    }
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Ok(if filled == 0 {
                ReadOutcome::Eof
            } else {
                ReadOutcome::Short(filled)
            });
        }
        filled += n;
    }
    Ok(ReadOutcome::Full)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn config(mode: PacketMode) -> PacketConfig {
        PacketConfig {
            mode,
            fixed_length: 5,
            header_length: 4,
            delimiter: "\r\n".to_string(),
        }
    }

    #[tokio::test]
    async fn delimiter_mode_includes_terminator() {
        let framer = Framer::new(&config(PacketMode::Delimiter)).unwrap();
        let mut cursor = Cursor::new(b"hello\r\nworld\r\n".to_vec());

        let first = framer.read_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(first, b"hello\r\n");
        let second = framer.read_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(second, b"world\r\n");
        assert!(framer.read_frame(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fixed_length_mode_reads_exact_bytes() {
        let framer = Framer::new(&config(PacketMode::FixedLength)).unwrap();
        let mut cursor = Cursor::new(b"ABCDEFGHIJ".to_vec());

        let first = framer.read_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(first, b"ABCDE");
        let second = framer.read_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(second, b"FGHIJ");
        assert!(framer.read_frame(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fixed_length_mode_errors_on_short_tail() {
        let framer = Framer::new(&config(PacketMode::FixedLength)).unwrap();
        let mut cursor = Cursor::new(b"ABCDEFG".to_vec());

        framer.read_frame(&mut cursor).await.unwrap().unwrap();
        let err = framer.read_frame(&mut cursor).await.unwrap_err();
        assert!(matches!(err, GatewayError::Framing(_)));
    }

    #[tokio::test]
    async fn header_body_mode_strips_header() {
        let framer = Framer::new(&config(PacketMode::HeaderBodySeparate)).unwrap();
        let mut stream = Vec::new();
        stream.extend_from_slice(&5u32.to_be_bytes());
        stream.extend_from_slice(b"ABCDE");
        stream.extend_from_slice(&2u32.to_be_bytes());
        stream.extend_from_slice(b"FG");
        let mut cursor = Cursor::new(stream);

        let first = framer.read_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(first, b"ABCDE");
        let second = framer.read_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(second, b"FG");
        assert!(framer.read_frame(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn header_body_mode_treats_first_4_bytes_as_authoritative() {
        // header_length = 6 but only the first 4 bytes are the length; the rest
        // is opaque (here: 2 filler bytes carrying no meaning to the framer).
        let mut cfg = config(PacketMode::HeaderBodySeparate);
        cfg.header_length = 6;
        let framer = Framer::new(&cfg).unwrap();

        let mut stream = Vec::new();
        stream.extend_from_slice(&3u32.to_be_bytes());
        stream.extend_from_slice(b"XY"); // opaque header tail
        stream.extend_from_slice(b"ABC");
        let mut cursor = Cursor::new(stream);

        let frame = framer.read_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(frame, b"ABC");
    }

    #[tokio::test]
    async fn none_mode_reads_until_crlf_including_terminator() {
        let framer = Framer::new(&config(PacketMode::None)).unwrap();
        let mut cursor = Cursor::new(b"hello\r\n".to_vec());

        let frame = framer.read_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(frame, b"hello\r\n");
    }
}
