//! Minimal HTTP/1.1 head codec for the legacy h1q profiles.
//!
//! All parsers work on `&[u8]` and return offsets; the caller owns
//! buffering. Bodies on h1q streams are delimited by Content-Length when
//! present and by stream FIN otherwise.

use crate::error::CodecError;
use crate::qpack::HeaderField;

/// A parsed request or response head.
#[derive(Debug, Clone)]
pub struct H1Head {
    /// Pseudo-header form: `:method`/`:path` for requests, `:status` for
    /// responses, followed by the literal header fields.
    pub fields: Vec<HeaderField>,
    /// Body length from Content-Length, when present.
    pub content_length: Option<u64>,
    /// A `Connection: close` header was present.
    pub connection_close: bool,
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// Find the end of the header section (`\r\n\r\n`).
/// Returns the offset *past* the terminator, or `None` if not found.
pub fn find_end_of_headers(buf: &[u8]) -> Option<usize> {
    if buf.len() < 4 {
        return None;
    }
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

fn eq_ignore_case(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len()
        && a.iter()
            .zip(b)
            .all(|(x, y)| x.to_ascii_lowercase() == y.to_ascii_lowercase())
}

/// Parse a complete request head (`METHOD SP PATH SP HTTP/1.x` + headers).
///
/// `buf` must span exactly the head, including the blank line.
pub fn parse_request_head(buf: &[u8]) -> Result<H1Head, CodecError> {
    let line_end = find_crlf(buf).ok_or(CodecError::BadH1Message)?;
    let line = &buf[..line_end];

    let sp1 = line
        .iter()
        .position(|&b| b == b' ')
        .ok_or(CodecError::BadH1Message)?;
    let method = &line[..sp1];
    let rest = &line[sp1 + 1..];
    let sp2 = rest
        .iter()
        .position(|&b| b == b' ')
        .ok_or(CodecError::BadH1Message)?;
    let path = &rest[..sp2];
    if method.is_empty() || path.is_empty() || !rest[sp2 + 1..].starts_with(b"HTTP/1.") {
        return Err(CodecError::BadH1Message);
    }

    let mut head = H1Head {
        fields: vec![
            HeaderField::new(b":method".as_slice(), method),
            HeaderField::new(b":path".as_slice(), path),
        ],
        content_length: None,
        connection_close: false,
    };
    parse_header_lines(&buf[line_end + 2..], &mut head)?;
    Ok(head)
}

/// Parse a complete response head (`HTTP/1.x SP STATUS ...` + headers).
pub fn parse_response_head(buf: &[u8]) -> Result<H1Head, CodecError> {
    let line_end = find_crlf(buf).ok_or(CodecError::BadH1Message)?;
    let line = &buf[..line_end];

    if !line.starts_with(b"HTTP/1.") {
        return Err(CodecError::BadH1Message);
    }
    let sp1 = line
        .iter()
        .position(|&b| b == b' ')
        .ok_or(CodecError::BadH1Message)?;
    let status = &line[sp1 + 1..];
    let status = &status[..status.iter().position(|&b| b == b' ').unwrap_or(status.len())];
    if status.len() != 3 || !status.iter().all(u8::is_ascii_digit) {
        return Err(CodecError::BadH1Message);
    }

    let mut head = H1Head {
        fields: vec![HeaderField::new(b":status".as_slice(), status)],
        content_length: None,
        connection_close: false,
    };
    parse_header_lines(&buf[line_end + 2..], &mut head)?;
    Ok(head)
}

fn parse_header_lines(mut buf: &[u8], head: &mut H1Head) -> Result<(), CodecError> {
    loop {
        let line_end = find_crlf(buf).ok_or(CodecError::BadH1Message)?;
        if line_end == 0 {
            return Ok(());
        }
        let line = &buf[..line_end];
        let colon = line
            .iter()
            .position(|&b| b == b':')
            .ok_or(CodecError::BadH1Message)?;
        let name = &line[..colon];
        let mut value = &line[colon + 1..];
        while value.first() == Some(&b' ') {
            value = &value[1..];
        }

        if eq_ignore_case(name, b"content-length") {
            let s = std::str::from_utf8(value).map_err(|_| CodecError::BadH1Message)?;
            head.content_length = Some(s.parse().map_err(|_| CodecError::BadH1Message)?);
        }
        if eq_ignore_case(name, b"connection") && eq_ignore_case(value, b"close") {
            head.connection_close = true;
        }
        head.fields.push(HeaderField::new(name, value));
        buf = &buf[line_end + 2..];
    }
}

/// Serialize a request or response head from pseudo-header fields.
///
/// `close` appends `Connection: close` (the unframed profile's drain
/// signal).
pub fn serialize_head(fields: &[HeaderField], close: bool, buf: &mut Vec<u8>) {
    let get = |name: &[u8]| {
        fields
            .iter()
            .find(|f| f.name == name)
            .map(|f| f.value.as_slice())
    };

    if let Some(status) = get(b":status") {
        buf.extend_from_slice(b"HTTP/1.1 ");
        buf.extend_from_slice(status);
        buf.extend_from_slice(b" ");
        buf.extend_from_slice(status_reason(status));
        buf.extend_from_slice(b"\r\n");
    } else {
        buf.extend_from_slice(get(b":method").unwrap_or(b"GET"));
        buf.push(b' ');
        buf.extend_from_slice(get(b":path").unwrap_or(b"/"));
        buf.extend_from_slice(b" HTTP/1.1\r\n");
    }

    for field in fields {
        if field.name.starts_with(b":") {
            continue;
        }
        buf.extend_from_slice(&field.name);
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(&field.value);
        buf.extend_from_slice(b"\r\n");
    }
    if close {
        buf.extend_from_slice(b"Connection: close\r\n");
    }
    buf.extend_from_slice(b"\r\n");
}

/// Serialize a chunked-encoding chunk header.
pub fn serialize_chunk_header(len: u64, buf: &mut Vec<u8>) {
    buf.extend_from_slice(format!("{len:x}\r\n").as_bytes());
}

/// Serialize a chunked-encoding chunk terminator.
pub fn serialize_chunk_terminator(buf: &mut Vec<u8>) {
    buf.extend_from_slice(b"\r\n");
}

fn status_reason(status: &[u8]) -> &'static [u8] {
    match status {
        b"200" => b"OK",
        b"204" => b"No Content",
        b"304" => b"Not Modified",
        b"400" => b"Bad Request",
        b"404" => b"Not Found",
        b"500" => b"Internal Server Error",
        b"503" => b"Service Unavailable",
        _ => b"",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_head_round_trip() {
        let fields = vec![
            HeaderField::new(b":method".as_slice(), b"POST".as_slice()),
            HeaderField::new(b":path".as_slice(), b"/upload".as_slice()),
            HeaderField::new(b"content-length".as_slice(), b"5".as_slice()),
        ];
        let mut buf = Vec::new();
        serialize_head(&fields, false, &mut buf);
        let end = find_end_of_headers(&buf).unwrap();
        assert_eq!(end, buf.len());
        let head = parse_request_head(&buf).unwrap();
        assert_eq!(head.fields[0].value, b"POST");
        assert_eq!(head.fields[1].value, b"/upload");
        assert_eq!(head.content_length, Some(5));
        assert!(!head.connection_close);
    }

    #[test]
    fn response_head_with_close() {
        let fields = vec![HeaderField::new(b":status".as_slice(), b"200".as_slice())];
        let mut buf = Vec::new();
        serialize_head(&fields, true, &mut buf);
        let head = parse_response_head(&buf).unwrap();
        assert_eq!(head.fields[0].value, b"200");
        assert!(head.connection_close);
    }

    #[test]
    fn incomplete_head_not_found() {
        assert!(find_end_of_headers(b"GET / HTTP/1.1\r\n").is_none());
    }

    #[test]
    fn bad_request_line_rejected() {
        assert!(parse_request_head(b"GET\r\n\r\n").is_err());
        assert!(parse_request_head(b"GET /x FTP/1.1\r\n\r\n").is_err());
    }

    #[test]
    fn chunk_framing() {
        let mut buf = Vec::new();
        serialize_chunk_header(0x1a, &mut buf);
        assert_eq!(buf, b"1a\r\n");
        serialize_chunk_terminator(&mut buf);
        assert_eq!(buf, b"1a\r\n\r\n");
    }
}
