use std::io::{ErrorKind, Read, Write};

use crate::{
    buffer::BoundedBuffer,
    error::{HttpError, LineKind},
};

pub const STATUS_OK: &str = "HTTP/1.1 200 OK";

const STATUS_LINE_LIMIT: usize = 64;
const HEADER_LINE_LIMIT: usize = 128;
const CHUNK_LINE_LIMIT: usize = 32;
const MAX_HEADER_LINES: usize = 64;
const READ_SCRATCH: usize = 64;

pub fn write_form_post<W: Write + ?Sized>(
    out: &mut W,
    host: &str,
    path: &str,
    body: &[u8],
) -> Result<(), HttpError> {
    let head = format!(
        "POST {path} HTTP/1.1\r\n\
         Host: {host}\r\n\
         Content-Length: {}\r\n\
         Content-Type: application/x-www-form-urlencoded\r\n\
         \r\n",
        body.len()
    );
    out.write_all(head.as_bytes())?;
    out.write_all(body)?;
    out.write_all(b"\r\n")?;
    out.flush()?;
    Ok(())
}

pub fn write_get<W: Write + ?Sized>(
    out: &mut W,
    host: &str,
    path_and_query: &str,
) -> Result<(), HttpError> {
    let head = format!("GET {path_and_query} HTTP/1.1\r\nHost: {host}\r\n\r\n");
    out.write_all(head.as_bytes())?;
    out.flush()?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    Chunked,
    Length(usize),
}

/// Pulls a response off the wire one stage at a time, never reading past
/// what the current stage needs.
pub struct ResponseReader<'a, R: Read + ?Sized> {
    inner: &'a mut R,
}

impl<'a, R: Read + ?Sized> ResponseReader<'a, R> {
    pub fn new(inner: &'a mut R) -> Self {
        Self { inner }
    }

    pub fn expect_status_ok(&mut self) -> Result<(), HttpError> {
        let mut line = BoundedBuffer::<STATUS_LINE_LIMIT>::new();
        self.read_line(&mut line, LineKind::Status)?;

        let text = String::from_utf8_lossy(line.as_bytes());
        if text != STATUS_OK {
            return Err(HttpError::UnexpectedStatus(text.into_owned()));
        }
        Ok(())
    }

    /// Consumes headers through the blank separator line.
    pub fn read_headers(&mut self) -> Result<BodyFraming, HttpError> {
        let mut chunked = false;
        let mut content_length = None;

        for _ in 0..MAX_HEADER_LINES {
            let mut line = BoundedBuffer::<HEADER_LINE_LIMIT>::new();
            match self.read_line(&mut line, LineKind::Header) {
                Ok(()) => {}
                Err(HttpError::Closed) => return Err(HttpError::MissingHeaderTerminator),
                Err(err) => return Err(err),
            }

            if line.is_empty() {
                return Ok(match content_length {
                    Some(length) if !chunked => BodyFraming::Length(length),
                    _ => BodyFraming::Chunked,
                });
            }

            let text = String::from_utf8_lossy(line.as_bytes());
            let Some((name, value)) = text.split_once(':') else {
                continue;
            };
            let value = value.trim();
            if name.trim().eq_ignore_ascii_case("transfer-encoding") {
                chunked |= value.to_ascii_lowercase().contains("chunked");
            } else if name.trim().eq_ignore_ascii_case("content-length") {
                content_length = value.parse::<usize>().ok();
            }
        }

        Err(HttpError::MissingHeaderTerminator)
    }

    /// Reads the body into `body`. Bytes beyond its capacity are still drained
    /// from the connection, then reported as an overflow.
    pub fn read_body<const N: usize>(
        &mut self,
        framing: BodyFraming,
        body: &mut BoundedBuffer<N>,
    ) -> Result<(), HttpError> {
        let mut overflowed = false;

        match framing {
            BodyFraming::Length(length) => self.read_exact_into(length, body, &mut overflowed)?,
            BodyFraming::Chunked => self.read_chunks(body, &mut overflowed)?,
        }

        if overflowed {
            return Err(HttpError::BodyOverflow { capacity: N });
        }
        Ok(())
    }

    fn read_chunks<const N: usize>(
        &mut self,
        body: &mut BoundedBuffer<N>,
        overflowed: &mut bool,
    ) -> Result<(), HttpError> {
        loop {
            let size = self.read_chunk_size()?;
            if size == 0 {
                return self.skip_trailers();
            }

            self.read_exact_into(size, body, overflowed)?;

            let mut crlf = [0_u8; 2];
            self.fill(&mut crlf)?;
            if &crlf != b"\r\n" {
                return Err(HttpError::MissingChunkTerminator);
            }
        }
    }

    fn read_chunk_size(&mut self) -> Result<usize, HttpError> {
        let mut line = BoundedBuffer::<CHUNK_LINE_LIMIT>::new();
        self.read_line(&mut line, LineKind::ChunkSize)?;

        let text = String::from_utf8_lossy(line.as_bytes());
        let digits = text.split(';').next().unwrap_or_default().trim_end();
        if !digits.bytes().all(|byte| byte.is_ascii_hexdigit()) {
            return Err(HttpError::InvalidChunkSize(text.into_owned()));
        }
        usize::from_str_radix(digits, 16)
            .map_err(|_| HttpError::InvalidChunkSize(text.into_owned()))
    }

    fn skip_trailers(&mut self) -> Result<(), HttpError> {
        for _ in 0..MAX_HEADER_LINES {
            let mut line = BoundedBuffer::<HEADER_LINE_LIMIT>::new();
            self.read_line(&mut line, LineKind::Header)?;
            if line.is_empty() {
                return Ok(());
            }
        }
        Err(HttpError::MissingHeaderTerminator)
    }

    fn read_exact_into<const N: usize>(
        &mut self,
        mut remaining: usize,
        body: &mut BoundedBuffer<N>,
        overflowed: &mut bool,
    ) -> Result<(), HttpError> {
        let mut scratch = [0_u8; READ_SCRATCH];

        while remaining > 0 {
            let want = remaining.min(READ_SCRATCH);
            let read = self.read_some(&mut scratch[..want])?;
            remaining -= read;

            if !*overflowed && body.extend_from_slice(&scratch[..read]).is_err() {
                *overflowed = true;
            }
        }
        Ok(())
    }

    /// Reads up to LF, storing the line without its CRLF. Stops at the first
    /// byte that does not fit; the rest of the line stays on the wire.
    fn read_line<const N: usize>(
        &mut self,
        line: &mut BoundedBuffer<N>,
        kind: LineKind,
    ) -> Result<(), HttpError> {
        loop {
            let mut byte = [0_u8; 1];
            self.fill(&mut byte)?;
            match byte[0] {
                b'\n' => return Ok(()),
                b'\r' => {}
                other => line
                    .push(other)
                    .map_err(|_| HttpError::LineTooLong { kind, limit: N })?,
            }
        }
    }

    fn fill(&mut self, buf: &mut [u8]) -> Result<(), HttpError> {
        let mut filled = 0;
        while filled < buf.len() {
            filled += self.read_some(&mut buf[filled..])?;
        }
        Ok(())
    }

    fn read_some(&mut self, buf: &mut [u8]) -> Result<usize, HttpError> {
        loop {
            match self.inner.read(buf) {
                Ok(0) => return Err(HttpError::Closed),
                Ok(read) => return Ok(read),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }
}
