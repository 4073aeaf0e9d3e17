// src/parser.rs
use memchr::{memchr, memchr2};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("malformed line terminator")]
    MalformedLine,
    #[error("request line must be METHOD SP TARGET SP VERSION")]
    MalformedRequestLine,
    #[error("method {0:?} is not implemented")]
    UnsupportedMethod(String),
    #[error("request target is not an absolute path")]
    BadTarget,
    #[error("only HTTP/1.1 is supported")]
    UnsupportedVersion,
    #[error("invalid Content-Length value")]
    BadContentLength,
    #[error("request does not fit the inbound buffer")]
    TooLarge,
}

/// Result of scanning the inbound buffer for the next CRLF.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineStatus {
    /// A full line ends two bytes before the updated `checked` cursor.
    Complete,
    /// No terminator yet; more data is needed.
    Incomplete,
    /// A CR not followed by LF, or a bare LF.
    Malformed,
}

/// Scan `buf[*checked..read_end]` for a line terminator.
///
/// On `Complete` the CRLF pair has been overwritten with NUL terminators and
/// `*checked` points at the first byte of the next line. On `Incomplete`
/// `*checked` rests on the trailing CR (if any) so the next scan re-examines it.
pub fn scan_line(buf: &mut [u8], checked: &mut usize, read_end: usize) -> LineStatus {
    debug_assert!(*checked <= read_end && read_end <= buf.len());

    let Some(offset) = memchr2(b'\r', b'\n', &buf[*checked..read_end]) else {
        *checked = read_end;
        return LineStatus::Incomplete;
    };
    let pos = *checked + offset;
    *checked = pos;

    if buf[pos] == b'\r' {
        if pos + 1 == read_end {
            return LineStatus::Incomplete;
        }
        if buf[pos + 1] == b'\n' {
            buf[pos] = 0;
            buf[pos + 1] = 0;
            *checked = pos + 2;
            return LineStatus::Complete;
        }
        return LineStatus::Malformed;
    }

    // Bare LF: only valid when the CR before it was left behind by an earlier scan.
    if pos > 0 && buf[pos - 1] == b'\r' {
        buf[pos - 1] = 0;
        buf[pos] = 0;
        *checked = pos + 1;
        return LineStatus::Complete;
    }
    LineStatus::Malformed
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http11,
}

/// Fields collected while parsing one request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Request {
    pub method: Option<Method>,
    /// Absolute path, scheme/authority and query stripped.
    pub url: String,
    pub version: Option<Version>,
    pub host: Option<String>,
    pub content_length: usize,
    pub keep_alive: bool,
}

/// Parse `METHOD SP TARGET SP VERSION` into `req`.
pub fn parse_request_line(line: &[u8], req: &mut Request) -> Result<(), ParseError> {
    let text = std::str::from_utf8(line).map_err(|_| ParseError::MalformedRequestLine)?;
    let mut parts = text.split([' ', '\t']).filter(|s| !s.is_empty());

    let (Some(method), Some(target), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(ParseError::MalformedRequestLine);
    };

    if !method.eq_ignore_ascii_case("GET") {
        return Err(ParseError::UnsupportedMethod(method.to_string()));
    }
    if !version.eq_ignore_ascii_case("HTTP/1.1") {
        return Err(ParseError::UnsupportedVersion);
    }

    req.method = Some(Method::Get);
    req.version = Some(Version::Http11);
    req.url = normalize_target(target)?.to_string();
    Ok(())
}

/// Reduce an origin-form or absolute-form target to its path.
fn normalize_target(target: &str) -> Result<&str, ParseError> {
    let mut path = target;
    if path
        .get(..7)
        .is_some_and(|scheme| scheme.eq_ignore_ascii_case("http://"))
    {
        let authority_and_path = &path[7..];
        let slash = authority_and_path.find('/').ok_or(ParseError::BadTarget)?;
        path = &authority_and_path[slash..];
    }
    if !path.starts_with('/') {
        return Err(ParseError::BadTarget);
    }

    let path = match path.find(['?', '#']) {
        Some(idx) => &path[..idx],
        None => path,
    };
    if path.split('/').any(|segment| segment == "..") {
        return Err(ParseError::BadTarget);
    }
    Ok(path)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderLine {
    /// The blank line closing the header block.
    End,
    /// A header was consumed (or ignored); keep reading.
    Continue,
}

/// Parse one header line into `req`. Unknown headers are ignored.
pub fn parse_header(line: &[u8], req: &mut Request) -> Result<HeaderLine, ParseError> {
    if line.is_empty() {
        return Ok(HeaderLine::End);
    }
    let Some(colon) = memchr(b':', line) else {
        tracing::trace!(line = %String::from_utf8_lossy(line), "ignoring header without colon");
        return Ok(HeaderLine::Continue);
    };

    let name = &line[..colon];
    // Only leading whitespace is insignificant; the rest of the value is kept as sent.
    let value = line[colon + 1..].trim_ascii_start();

    if name.eq_ignore_ascii_case(b"Connection") {
        if value.eq_ignore_ascii_case(b"keep-alive") {
            req.keep_alive = true;
        }
    } else if name.eq_ignore_ascii_case(b"Content-Length") {
        req.content_length = std::str::from_utf8(value.trim_ascii_end())
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .ok_or(ParseError::BadContentLength)?;
    } else if name.eq_ignore_ascii_case(b"Host") {
        req.host = Some(String::from_utf8_lossy(value).into_owned());
    } else {
        tracing::trace!(name = %String::from_utf8_lossy(name), "ignoring unknown header");
    }
    Ok(HeaderLine::Continue)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan(input: &[u8]) -> (LineStatus, usize, Vec<u8>) {
        let mut buf = input.to_vec();
        let mut checked = 0;
        let status = scan_line(&mut buf, &mut checked, input.len());
        (status, checked, buf)
    }

    #[test]
    fn test_scan_complete_line() {
        let (status, checked, buf) = scan(b"GET / HTTP/1.1\r\nHost: a\r\n");
        assert_eq!(status, LineStatus::Complete);
        assert_eq!(checked, 16);
        assert_eq!(&buf[14..16], &[0, 0]);
    }

    #[test]
    fn test_scan_incomplete_line() {
        let (status, checked, _) = scan(b"GET / HTT");
        assert_eq!(status, LineStatus::Incomplete);
        assert_eq!(checked, 9);

        // A trailing CR is left for the next scan.
        let (status, checked, _) = scan(b"GET / HTTP/1.1\r");
        assert_eq!(status, LineStatus::Incomplete);
        assert_eq!(checked, 14);
    }

    #[test]
    fn test_scan_resumes_on_split_crlf() {
        let mut buf = b"GET / HTTP/1.1\r\n".to_vec();
        let mut checked = 0;
        assert_eq!(scan_line(&mut buf, &mut checked, 15), LineStatus::Incomplete);
        assert_eq!(scan_line(&mut buf, &mut checked, 16), LineStatus::Complete);
        assert_eq!(checked, 16);
    }

    #[test]
    fn test_scan_malformed_lines() {
        assert_eq!(scan(b"GET /\rX").0, LineStatus::Malformed);
        assert_eq!(scan(b"GET /\n").0, LineStatus::Malformed);
    }

    #[test]
    fn test_scan_lf_after_consumed_cr() {
        let mut buf = b"ab\r\n".to_vec();
        let mut checked = 3;
        assert_eq!(scan_line(&mut buf, &mut checked, 4), LineStatus::Complete);
        assert_eq!(checked, 4);
        assert_eq!(&buf[2..], &[0, 0]);
    }

    #[test]
    fn test_parse_request_line() {
        let mut req = Request::default();
        parse_request_line(b"GET /index.html HTTP/1.1", &mut req).unwrap();
        assert_eq!(req.method, Some(Method::Get));
        assert_eq!(req.url, "/index.html");
        assert_eq!(req.version, Some(Version::Http11));

        let mut lower = Request::default();
        parse_request_line(b"get\t/a.html\thttp/1.1", &mut lower).unwrap();
        assert_eq!(lower.url, "/a.html");
    }

    #[test]
    fn test_absolute_uri_is_normalized() {
        let mut absolute = Request::default();
        parse_request_line(b"GET http://host:80/a.html HTTP/1.1", &mut absolute).unwrap();
        let mut origin = Request::default();
        parse_request_line(b"GET /a.html HTTP/1.1", &mut origin).unwrap();
        assert_eq!(absolute, origin);

        let mut no_path = Request::default();
        assert_eq!(
            parse_request_line(b"GET http://host:80 HTTP/1.1", &mut no_path),
            Err(ParseError::BadTarget)
        );
    }

    #[test]
    fn test_rejected_request_lines() {
        let mut req = Request::default();
        assert_eq!(
            parse_request_line(b"POST / HTTP/1.1", &mut req),
            Err(ParseError::UnsupportedMethod("POST".to_string()))
        );
        assert_eq!(
            parse_request_line(b"GET / HTTP/1.0", &mut req),
            Err(ParseError::UnsupportedVersion)
        );
        assert_eq!(
            parse_request_line(b"GET index.html HTTP/1.1", &mut req),
            Err(ParseError::BadTarget)
        );
        assert_eq!(
            parse_request_line(b"GET /../etc/passwd HTTP/1.1", &mut req),
            Err(ParseError::BadTarget)
        );
        assert_eq!(
            parse_request_line(b"GET / HTTP/1.1 extra", &mut req),
            Err(ParseError::MalformedRequestLine)
        );
        assert_eq!(
            parse_request_line(b"GET /", &mut req),
            Err(ParseError::MalformedRequestLine)
        );
    }

    #[test]
    fn test_query_string_is_dropped() {
        let mut req = Request::default();
        parse_request_line(b"GET /page.html?x=1 HTTP/1.1", &mut req).unwrap();
        assert_eq!(req.url, "/page.html");
    }

    #[test]
    fn test_parse_headers() {
        let mut req = Request::default();
        assert_eq!(
            parse_header(b"Host: example.com", &mut req),
            Ok(HeaderLine::Continue)
        );
        assert_eq!(req.host.as_deref(), Some("example.com"));

        parse_header(b"connection:\tKeep-Alive", &mut req).unwrap();
        assert!(req.keep_alive);

        parse_header(b"Content-Length: 42", &mut req).unwrap();
        assert_eq!(req.content_length, 42);

        parse_header(b"X-Unknown: whatever", &mut req).unwrap();
        parse_header(b"no colon here", &mut req).unwrap();

        assert_eq!(parse_header(b"", &mut req), Ok(HeaderLine::End));
    }

    #[test]
    fn test_host_value_kept_verbatim_after_leading_space() {
        let mut req = Request::default();
        parse_header(b"Host: \t example.com:8080  ", &mut req).unwrap();
        assert_eq!(req.host.as_deref(), Some("example.com:8080  "));

        parse_header(b"Connection: keep-alive ", &mut req).unwrap();
        assert!(!req.keep_alive);

        parse_header(b"Content-Length:  17 ", &mut req).unwrap();
        assert_eq!(req.content_length, 17);
    }

    #[test]
    fn test_connection_close_leaves_keep_alive_off() {
        let mut req = Request::default();
        parse_header(b"Connection: close", &mut req).unwrap();
        assert!(!req.keep_alive);
    }

    #[test]
    fn test_bad_content_length() {
        let mut req = Request::default();
        assert_eq!(
            parse_header(b"Content-Length: -5", &mut req),
            Err(ParseError::BadContentLength)
        );
        assert_eq!(
            parse_header(b"Content-Length: lots", &mut req),
            Err(ParseError::BadContentLength)
        );
    }
}
