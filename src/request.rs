use std::fmt::Write;

use bytes::{Bytes, BytesMut};

const DEFAULT_METHOD: &str = "GET";
const DEFAULT_URL: &str = "/";
const DEFAULT_VERSION: &str = "HTTP/1.1";

/// The request sent on every connection, edited once before the run.
///
/// `method`, `url` and `version` address the request line; any other name
/// addresses a header field, matched without regard to case.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestTemplate {
    method: String,
    url: String,
    version: String,
    /// Header lines without their line endings.
    headers: Vec<String>,
}

fn field_name(line: &str) -> &str {
    let end = line
        .find(|c: char| c == ':' || c.is_ascii_whitespace())
        .unwrap_or_else(|| line.len());
    &line[..end]
}

impl RequestTemplate {
    pub fn new(host: &str, path: &str) -> RequestTemplate {
        let mut template = RequestTemplate::parse(b"");
        template.edit("url", path);
        template.edit("Host", host);
        template.edit("User-Agent", concat!("swarm/", env!("CARGO_PKG_VERSION")));
        template.edit("Accept", "*/*");
        template
    }

    /// Reads a textual request, filling in any missing request-line token.
    pub fn parse(text: &[u8]) -> RequestTemplate {
        let text = String::from_utf8_lossy(text);
        let mut lines = text.lines().map(|line| line.trim_end_matches('\r'));

        let request_line = lines.next().unwrap_or("");
        let mut tokens = request_line.split_ascii_whitespace();
        let method = tokens.next().unwrap_or(DEFAULT_METHOD).to_string();
        let url = tokens.next().unwrap_or(DEFAULT_URL).to_string();
        let version = tokens.next().unwrap_or(DEFAULT_VERSION).to_string();

        let headers = lines
            .take_while(|line| !line.is_empty())
            .map(|line| line.to_string())
            .collect();

        Self {
            method,
            url,
            version,
            headers,
        }
    }

    /// Replaces one part of the request. A header that is not yet present is
    /// appended after the existing ones; an empty name changes nothing.
    pub fn edit(&mut self, name: &str, value: &str) {
        if name.is_empty() {
            return;
        }
        if name.eq_ignore_ascii_case("method") {
            self.method = value.to_string();
        } else if name.eq_ignore_ascii_case("url") {
            self.url = value.to_string();
        } else if name.eq_ignore_ascii_case("version") {
            self.version = value.to_string();
        } else {
            let line = format!("{}: {}", name, value);
            match self
                .headers
                .iter_mut()
                .find(|existing| field_name(existing).eq_ignore_ascii_case(name))
            {
                Some(existing) => *existing = line,
                None => self.headers.push(line),
            }
        }
    }

    /// Applies a `Name: value` header given on the command line.
    pub fn edit_header_line(&mut self, line: &str) -> Option<()> {
        let colon = line.find(':')?;
        let name = line[..colon].trim();
        if name.is_empty() {
            return None;
        }
        self.edit(name, line[colon + 1..].trim());
        Some(())
    }

    #[cfg(test)]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|line| field_name(line).eq_ignore_ascii_case(name))
            .map(|line| line[field_name(line).len()..].trim_start_matches(':').trim())
    }

    /// The immutable buffer shared by every connection.
    pub fn freeze(&self) -> Bytes {
        let mut data = BytesMut::with_capacity(256);
        // Writing to a BytesMut grows it as needed and cannot fail.
        let _ = write!(&mut data, "{} {} {}\r\n", self.method, self.url, self.version);
        for line in &self.headers {
            let _ = write!(&mut data, "{}\r\n", line);
        }
        let _ = write!(&mut data, "\r\n");
        data.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edited(start: &str, name: &str, value: &str) -> Bytes {
        let mut template = RequestTemplate::parse(start.as_bytes());
        template.edit(name, value);
        template.freeze()
    }

    #[test]
    fn replaces_header_in_place() {
        assert_eq!(
            edited(
                "GET /index.html HTTP/1.0\r\nConnection: close\r\n\r\n",
                "Connection",
                "keep-alive"
            ),
            &b"GET /index.html HTTP/1.0\r\nConnection: keep-alive\r\n\r\n"[..]
        );
        assert_eq!(
            edited(
                "GET /index.html HTTP/1.0\r\nconnection: keep-alive\r\nAccept: */*\r\n\r\n",
                "Connection",
                "closed"
            ),
            &b"GET /index.html HTTP/1.0\r\nConnection: closed\r\nAccept: */*\r\n\r\n"[..]
        );
    }

    #[test]
    fn empty_template_gets_defaults() {
        assert_eq!(
            edited("", "Connection", "closed"),
            &b"GET / HTTP/1.1\r\nConnection: closed\r\n\r\n"[..]
        );
        assert_eq!(edited("", "version", "HTTP/1.1"), &b"GET / HTTP/1.1\r\n\r\n"[..]);
        assert_eq!(edited("", "", ""), &b"GET / HTTP/1.1\r\n\r\n"[..]);
        assert_eq!(
            edited("", "url", "/index.html"),
            &b"GET /index.html HTTP/1.1\r\n\r\n"[..]
        );
    }

    #[test]
    fn request_line_edits() {
        assert_eq!(
            edited("GET / HTTP/1.1\r\n\r\n", "METHOD", "HEAD"),
            &b"HEAD / HTTP/1.1\r\n\r\n"[..]
        );
        assert_eq!(
            edited("GET /\n", "Version", "HTTP/1.0"),
            &b"GET / HTTP/1.0\r\n\r\n"[..]
        );
    }

    #[test]
    fn header_lines_from_the_command_line() {
        let mut template = RequestTemplate::new("example.com", "/");
        assert!(template.edit_header_line("X-Trace:  abc ").is_some());
        assert!(template.edit_header_line("accept: text/html").is_some());
        assert!(template.edit_header_line("no colon").is_none());
        assert!(template.edit_header_line(": value").is_none());
        assert_eq!(template.header("x-trace"), Some("abc"));
        assert_eq!(template.header("Accept"), Some("text/html"));
        assert_eq!(template.header("Cookie"), None);
    }

    #[test]
    fn default_request_is_well_formed() {
        let data = RequestTemplate::new("example.com:8080", "/a/b?c=d").freeze();

        let mut headers = [httparse::EMPTY_HEADER; 16];
        let mut req = httparse::Request::new(&mut headers);
        let status = req.parse(&data).unwrap();
        assert!(status.is_complete());
        assert_eq!(status.unwrap(), data.len());
        assert_eq!(req.method, Some("GET"));
        assert_eq!(req.path, Some("/a/b?c=d"));
        assert_eq!(req.version, Some(1));

        let host = req.headers.iter().find(|h| h.name == "Host").unwrap();
        assert_eq!(host.value, b"example.com:8080");
        assert!(req.headers.iter().any(|h| h.name == "User-Agent"));
        assert!(req.headers.iter().any(|h| h.name == "Accept"));
    }
}
