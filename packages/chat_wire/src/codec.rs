//! Primitive shapes of the relay wire format.
//!
//! Wire format:
//!
//! - `Int32`: 4-byte signed little-endian integer
//! - `Bool`: 1 byte, `0x00` or `0x01`
//! - `String`: `[Int32 length][length bytes of UTF-8]`
//! - `StringList`: `[Int32 count][count Strings]`
//!
//! Every shape has a slice decoder ([`SliceReader`]) for complete buffers and
//! an async reader for live streams.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Malformed, WireError};

/// Largest single string accepted unless the caller picks another limit.
pub const DEFAULT_MAX_STRING_BYTES: usize = 64 * 1024;

const INT_WIDTH: usize = 4;

pub fn put_i32(buf: &mut Vec<u8>, value: i32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

pub fn put_bool(buf: &mut Vec<u8>, value: bool) {
    buf.push(u8::from(value));
}

/// Write a length or count prefix.
pub fn put_len(buf: &mut Vec<u8>, len: usize) -> Result<(), WireError> {
    let len = i32::try_from(len).map_err(|_| WireError::Oversized(len))?;
    put_i32(buf, len);
    Ok(())
}

pub fn put_str(buf: &mut Vec<u8>, value: &str) -> Result<(), WireError> {
    put_len(buf, value.len())?;
    buf.extend_from_slice(value.as_bytes());
    Ok(())
}

pub fn put_str_list<S: AsRef<str>>(buf: &mut Vec<u8>, values: &[S]) -> Result<(), WireError> {
    put_len(buf, values.len())?;
    for value in values {
        put_str(buf, value.as_ref())?;
    }
    Ok(())
}

fn non_negative(value: i32) -> Result<usize, Malformed> {
    usize::try_from(value).map_err(|_| Malformed::NegativeLength(value))
}

fn utf8(bytes: Vec<u8>) -> Result<String, Malformed> {
    String::from_utf8(bytes).map_err(|_| Malformed::InvalidUtf8)
}

/// Cursor over a complete buffer.
///
/// A length that runs past the end of the buffer is reported as
/// [`Malformed::Truncated`]; nothing is ever read out of bounds.
pub struct SliceReader<'a> {
    buf: &'a [u8],
    max_string: usize,
}

impl<'a> SliceReader<'a> {
    pub fn new(buf: &'a [u8], max_string: usize) -> Self {
        Self { buf, max_string }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], Malformed> {
        if len > self.buf.len() {
            return Err(Malformed::Truncated {
                declared: len,
                remaining: self.buf.len(),
            });
        }
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    pub fn read_i32(&mut self) -> Result<i32, Malformed> {
        let bytes = self.take(INT_WIDTH)?;
        let mut raw = [0u8; INT_WIDTH];
        raw.copy_from_slice(bytes);
        Ok(i32::from_le_bytes(raw))
    }

    pub fn read_bool(&mut self) -> Result<bool, Malformed> {
        match self.take(1)?[0] {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(Malformed::InvalidBool(other)),
        }
    }

    pub fn read_string(&mut self) -> Result<String, Malformed> {
        let len = non_negative(self.read_i32()?)?;
        if len > self.max_string {
            return Err(Malformed::TooLong {
                len,
                max: self.max_string,
            });
        }
        utf8(self.take(len)?.to_vec())
    }

    pub fn read_string_list(&mut self) -> Result<Vec<String>, Malformed> {
        let count = non_negative(self.read_i32()?)?;
        // Every entry needs at least its length prefix.
        if count.saturating_mul(INT_WIDTH) > self.buf.len() {
            return Err(Malformed::Truncated {
                declared: count.saturating_mul(INT_WIDTH),
                remaining: self.buf.len(),
            });
        }
        (0..count).map(|_| self.read_string()).collect()
    }

    /// Read a string list that must hold exactly `expected` entries.
    ///
    /// The count is checked before any entry is read.
    pub fn read_string_list_exact(&mut self, expected: usize) -> Result<Vec<String>, Malformed> {
        let count = non_negative(self.read_i32()?)?;
        if count != expected {
            return Err(Malformed::BadArity {
                expected,
                found: count,
            });
        }
        (0..count).map(|_| self.read_string()).collect()
    }

    /// Fails unless every byte has been consumed.
    pub fn finish(self) -> Result<(), Malformed> {
        match self.buf.len() {
            0 => Ok(()),
            n => Err(Malformed::TrailingBytes(n)),
        }
    }
}

fn eof_inside_frame(err: std::io::Error) -> WireError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        Malformed::UnexpectedEof.into()
    } else {
        err.into()
    }
}

/// Read a string list that must hold exactly `expected` entries.
///
/// The count is checked before any entry is read.
pub async fn read_string_list_exact<R: AsyncRead + Unpin>(
    reader: &mut R,
    expected: usize,
    max_string: usize,
) -> Result<Vec<String>, WireError> {
    let count = non_negative(read_i32(reader).await?)?;
    if count != expected {
        return Err(Malformed::BadArity {
            expected,
            found: count,
        }
        .into());
    }
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        out.push(read_string(reader, max_string).await?);
    }
    Ok(out)
}

/// Read the tag that opens a frame.
///
/// Returns `None` if the stream is cleanly closed before the first byte.
pub async fn read_tag<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<i32>, WireError> {
    let mut raw = [0u8; INT_WIDTH];
    if reader.read(&mut raw[..1]).await? == 0 {
        return Ok(None);
    }
    reader
        .read_exact(&mut raw[1..])
        .await
        .map_err(eof_inside_frame)?;
    Ok(Some(i32::from_le_bytes(raw)))
}

pub async fn read_i32<R: AsyncRead + Unpin>(reader: &mut R) -> Result<i32, WireError> {
    reader.read_i32_le().await.map_err(eof_inside_frame)
}

pub async fn read_bool<R: AsyncRead + Unpin>(reader: &mut R) -> Result<bool, WireError> {
    match reader.read_u8().await.map_err(eof_inside_frame)? {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(Malformed::InvalidBool(other).into()),
    }
}

pub async fn read_string<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_string: usize,
) -> Result<String, WireError> {
    let len = non_negative(read_i32(reader).await?)?;
    if len > max_string {
        return Err(Malformed::TooLong {
            len,
            max: max_string,
        }
        .into());
    }
    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(eof_inside_frame)?;
    Ok(utf8(buf)?)
}

pub async fn read_string_list<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_string: usize,
) -> Result<Vec<String>, WireError> {
    let count = non_negative(read_i32(reader).await?)?;
    // Grow as entries arrive; the count alone is untrusted.
    let mut out = Vec::with_capacity(count.min(16));
    for _ in 0..count {
        out.push(read_string(reader, max_string).await?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_layout_is_little_endian() {
        let mut buf = Vec::new();
        put_str(&mut buf, "hi").unwrap();
        assert_eq!(buf, [2, 0, 0, 0, b'h', b'i']);
    }

    #[test]
    fn declared_length_past_end_is_truncated() {
        let buf = [10, 0, 0, 0, b'a', b'b'];
        let mut reader = SliceReader::new(&buf, DEFAULT_MAX_STRING_BYTES);
        assert_eq!(
            reader.read_string(),
            Err(Malformed::Truncated {
                declared: 10,
                remaining: 2
            })
        );
    }

    #[test]
    fn negative_length_rejected() {
        let mut buf = Vec::new();
        put_i32(&mut buf, -1);
        let mut reader = SliceReader::new(&buf, DEFAULT_MAX_STRING_BYTES);
        assert_eq!(reader.read_string(), Err(Malformed::NegativeLength(-1)));
    }

    #[test]
    fn invalid_utf8_rejected() {
        let buf = [2, 0, 0, 0, 0xff, 0xfe];
        let mut reader = SliceReader::new(&buf, DEFAULT_MAX_STRING_BYTES);
        assert_eq!(reader.read_string(), Err(Malformed::InvalidUtf8));
    }

    #[test]
    fn string_limit_enforced() {
        let mut buf = Vec::new();
        put_str(&mut buf, "abcdef").unwrap();
        let mut reader = SliceReader::new(&buf, 4);
        assert_eq!(reader.read_string(), Err(Malformed::TooLong { len: 6, max: 4 }));
    }

    #[test]
    fn huge_list_count_does_not_allocate() {
        let mut buf = Vec::new();
        put_i32(&mut buf, i32::MAX);
        let mut reader = SliceReader::new(&buf, DEFAULT_MAX_STRING_BYTES);
        assert!(matches!(
            reader.read_string_list(),
            Err(Malformed::Truncated { .. })
        ));
    }

    #[test]
    fn bool_bytes() {
        let mut reader = SliceReader::new(&[1, 0, 7], DEFAULT_MAX_STRING_BYTES);
        assert_eq!(reader.read_bool(), Ok(true));
        assert_eq!(reader.read_bool(), Ok(false));
        assert_eq!(reader.read_bool(), Err(Malformed::InvalidBool(7)));
    }

    #[test]
    fn trailing_bytes_reported() {
        let reader = SliceReader::new(&[1, 2], DEFAULT_MAX_STRING_BYTES);
        assert_eq!(reader.finish(), Err(Malformed::TrailingBytes(2)));
    }

    #[test]
    fn length_prefix_rejects_values_past_i32() {
        let mut buf = Vec::new();
        let too_big = i32::MAX as usize + 1;
        assert!(matches!(
            put_len(&mut buf, too_big),
            Err(WireError::Oversized(n)) if n == too_big
        ));
        assert!(buf.is_empty());
        put_len(&mut buf, i32::MAX as usize).unwrap();
        assert_eq!(buf, i32::MAX.to_le_bytes());
    }

    #[test]
    fn exact_list_checks_count_first() {
        let mut buf = Vec::new();
        put_i32(&mut buf, 2);
        put_str(&mut buf, "a").unwrap();
        put_str(&mut buf, "b").unwrap();
        let mut reader = SliceReader::new(&buf, DEFAULT_MAX_STRING_BYTES);
        assert_eq!(
            reader.read_string_list_exact(3),
            Err(Malformed::BadArity {
                expected: 3,
                found: 2
            })
        );
    }

    #[tokio::test]
    async fn exact_list_rejects_huge_count_without_reading_entries() {
        // Only the count is present; a reader that trusted it would wait for
        // strings and hit EOF instead of reporting the arity.
        let bytes = i32::MAX.to_le_bytes();
        let mut stream: &[u8] = &bytes;
        let err = read_string_list_exact(&mut stream, 3, DEFAULT_MAX_STRING_BYTES)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            WireError::Malformed(Malformed::BadArity { expected: 3, found }) if found == i32::MAX as usize
        ));
    }

    #[tokio::test]
    async fn read_tag_clean_close_is_none() {
        let mut empty: &[u8] = &[];
        assert!(read_tag(&mut empty).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn read_tag_partial_is_malformed() {
        let mut partial: &[u8] = &[0xd7, 0x01];
        let err = read_tag(&mut partial).await.unwrap_err();
        assert!(matches!(err, WireError::Malformed(Malformed::UnexpectedEof)));
    }

    #[tokio::test]
    async fn async_string_list() {
        let mut buf = Vec::new();
        put_str_list(&mut buf, &["a", "bc"]).unwrap();
        let mut stream: &[u8] = &buf;
        let list = read_string_list(&mut stream, DEFAULT_MAX_STRING_BYTES)
            .await
            .unwrap();
        assert_eq!(list, vec!["a".to_string(), "bc".to_string()]);
    }
}
