// src/response.rs

/// What the read side decided about a complete (or rejected) request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    BadRequest,
    Forbidden,
    NoResource,
    InternalError,
    FileRequest,
}

const BAD_REQUEST_BODY: &[u8] =
    b"Your request has bad syntax or is inherently impossible to satisfy.\n";
const FORBIDDEN_BODY: &[u8] = b"You do not have permission to get file from this server.\n";
const NOT_FOUND_BODY: &[u8] = b"The requested file was not found on this server.\n";
const INTERNAL_ERROR_BODY: &[u8] = b"There was an unusual problem serving the requested file.\n";

impl Outcome {
    pub fn status(self) -> u16 {
        match self {
            Outcome::FileRequest => 200,
            Outcome::BadRequest => 400,
            Outcome::Forbidden => 403,
            Outcome::NoResource => 404,
            Outcome::InternalError => 500,
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            Outcome::FileRequest => "OK",
            Outcome::BadRequest => "Bad Request",
            Outcome::Forbidden => "Forbidden",
            Outcome::NoResource => "Not Found",
            Outcome::InternalError => "Internal Error",
        }
    }

    fn status_line(self) -> &'static [u8] {
        match self {
            Outcome::FileRequest => b"HTTP/1.1 200 OK\r\n",
            Outcome::BadRequest => b"HTTP/1.1 400 Bad Request\r\n",
            Outcome::Forbidden => b"HTTP/1.1 403 Forbidden\r\n",
            Outcome::NoResource => b"HTTP/1.1 404 Not Found\r\n",
            Outcome::InternalError => b"HTTP/1.1 500 Internal Error\r\n",
        }
    }

    /// Fixed body sent for every outcome except a file response.
    pub fn canned_body(self) -> &'static [u8] {
        match self {
            Outcome::FileRequest => b"",
            Outcome::BadRequest => BAD_REQUEST_BODY,
            Outcome::Forbidden => FORBIDDEN_BODY,
            Outcome::NoResource => NOT_FOUND_BODY,
            Outcome::InternalError => INTERNAL_ERROR_BODY,
        }
    }
}

/// The outbound buffer cannot hold the response head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("response does not fit the outbound buffer")]
pub struct Overflow;

/// Appends response bytes into a fixed-capacity buffer.
pub struct ResponseWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> ResponseWriter<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn put(&mut self, bytes: &[u8]) -> Result<(), Overflow> {
        let end = self.pos.checked_add(bytes.len()).ok_or(Overflow)?;
        let dst = self.buf.get_mut(self.pos..end).ok_or(Overflow)?;
        dst.copy_from_slice(bytes);
        self.pos = end;
        Ok(())
    }

    pub fn status_line(&mut self, outcome: Outcome) -> Result<(), Overflow> {
        self.put(outcome.status_line())
    }

    /// Content-Length, Content-Type, Connection and the closing blank line.
    pub fn headers(&mut self, content_length: u64, keep_alive: bool) -> Result<(), Overflow> {
        let mut digits = itoa::Buffer::new();
        self.put(b"Content-Length: ")?;
        self.put(digits.format(content_length).as_bytes())?;
        self.put(b"\r\n")?;
        self.put(b"Content-Type: text/html\r\n")?;
        if keep_alive {
            self.put(b"Connection: keep-alive\r\n")?;
        } else {
            self.put(b"Connection: close\r\n")?;
        }
        self.put(b"\r\n")
    }

    pub fn body(&mut self, bytes: &[u8]) -> Result<(), Overflow> {
        self.put(bytes)
    }

    pub fn len(&self) -> usize {
        self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.pos == 0
    }
}

/// Status line, headers and canned body for a non-file outcome.
pub fn write_canned(buf: &mut [u8], outcome: Outcome, keep_alive: bool) -> Result<usize, Overflow> {
    let body = outcome.canned_body();
    let mut writer = ResponseWriter::new(buf);
    writer.status_line(outcome)?;
    writer.headers(body.len() as u64, keep_alive)?;
    writer.body(body)?;
    Ok(writer.len())
}

/// Status line and headers for a file response; the body travels separately.
pub fn write_file_head(buf: &mut [u8], file_len: u64, keep_alive: bool) -> Result<usize, Overflow> {
    let mut writer = ResponseWriter::new(buf);
    writer.status_line(Outcome::FileRequest)?;
    writer.headers(file_len, keep_alive)?;
    Ok(writer.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canned_not_found() {
        let mut buf = [0u8; 512];
        let n = write_canned(&mut buf, Outcome::NoResource, false).unwrap();
        let text = std::str::from_utf8(&buf[..n]).unwrap();
        let expected = format!(
            "HTTP/1.1 404 Not Found\r\nContent-Length: {}\r\nContent-Type: text/html\r\nConnection: close\r\n\r\n{}",
            NOT_FOUND_BODY.len(),
            std::str::from_utf8(NOT_FOUND_BODY).unwrap()
        );
        assert_eq!(text, expected);
    }

    #[test]
    fn file_head_reports_keep_alive() {
        let mut buf = [0u8; 256];
        let n = write_file_head(&mut buf, 1234, true).unwrap();
        assert_eq!(
            &buf[..n],
            b"HTTP/1.1 200 OK\r\nContent-Length: 1234\r\nContent-Type: text/html\r\nConnection: keep-alive\r\n\r\n"
        );
    }

    #[test]
    fn every_outcome_has_matching_title() {
        for outcome in [
            Outcome::BadRequest,
            Outcome::Forbidden,
            Outcome::NoResource,
            Outcome::InternalError,
            Outcome::FileRequest,
        ] {
            let line = format!("HTTP/1.1 {} {}\r\n", outcome.status(), outcome.title());
            assert_eq!(outcome.status_line(), line.as_bytes());
        }
    }

    #[test]
    fn overflow_is_reported_not_truncated() {
        let mut tiny = [0u8; 32];
        assert_eq!(
            write_canned(&mut tiny, Outcome::BadRequest, false),
            Err(Overflow)
        );
        let mut head_only = [0u8; 40];
        assert_eq!(write_file_head(&mut head_only, 10, false), Err(Overflow));
    }
}
