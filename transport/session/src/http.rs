//! Line-oriented HTTP/1.x client.
//!
//! A deliberately small client for plain-HTTP request/response exchanges:
//! one connection per request, `Connection: close`, body read until the
//! server closes the stream. HTTPS and HTTP/2+ are out of scope.

use std::collections::HashMap;
use std::time::Duration;

use tracing::warn;

use wharf_sock::{IpAddress, Status, TcpSocket};

/// Default port for plain HTTP.
const DEFAULT_HTTP_PORT: u16 = 80;

/// Read buffer used while draining the response.
const READ_CHUNK: usize = 1024;

/// HTTP request methods supported by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Method {
    /// Request a resource
    #[default]
    Get,
    /// Submit data to a resource
    Post,
    /// Request a resource's headers only
    Head,
    /// Store a resource
    Put,
    /// Remove a resource
    Delete,
}

impl Method {
    fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Head => "HEAD",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }
}

/// Status of a finished request.
///
/// Wire statuses mirror the server's numeric code; the 1000-range values
/// are generated locally when no valid response was obtained at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    /// 200 — request served
    Ok,
    /// 201 — resource created
    Created,
    /// 202 — request accepted for later processing
    Accepted,
    /// 204 — served, nothing to return
    NoContent,
    /// 301 — resource moved permanently
    MovedPermanently,
    /// 302 — resource moved temporarily
    MovedTemporarily,
    /// 304 — cached version still valid
    NotModified,
    /// 400 — request malformed
    BadRequest,
    /// 401 — authentication required
    Unauthorized,
    /// 403 — access denied
    Forbidden,
    /// 404 — no such resource
    NotFound,
    /// 500 — server-side error
    InternalServerError,
    /// 501 — feature not implemented by the server
    NotImplemented,
    /// 502 — bad gateway
    BadGateway,
    /// 503 — service temporarily unavailable
    ServiceNotAvailable,
    /// 504 — gateway timed out
    GatewayTimeout,
    /// 505 — HTTP version not supported
    VersionNotSupported,
    /// Any other code the server produced
    Other(u16),
    /// Response did not parse as HTTP
    InvalidResponse,
    /// Connection with the server failed
    ConnectionFailed,
}

impl ResponseStatus {
    /// Map a numeric wire code onto the status taxonomy.
    pub fn from_code(code: u16) -> Self {
        match code {
            200 => Self::Ok,
            201 => Self::Created,
            202 => Self::Accepted,
            204 => Self::NoContent,
            301 => Self::MovedPermanently,
            302 => Self::MovedTemporarily,
            304 => Self::NotModified,
            400 => Self::BadRequest,
            401 => Self::Unauthorized,
            403 => Self::Forbidden,
            404 => Self::NotFound,
            500 => Self::InternalServerError,
            501 => Self::NotImplemented,
            502 => Self::BadGateway,
            503 => Self::ServiceNotAvailable,
            504 => Self::GatewayTimeout,
            505 => Self::VersionNotSupported,
            other => Self::Other(other),
        }
    }

    /// The numeric code, with local statuses in the 1000 range.
    pub fn code(self) -> u16 {
        match self {
            Self::Ok => 200,
            Self::Created => 201,
            Self::Accepted => 202,
            Self::NoContent => 204,
            Self::MovedPermanently => 301,
            Self::MovedTemporarily => 302,
            Self::NotModified => 304,
            Self::BadRequest => 400,
            Self::Unauthorized => 401,
            Self::Forbidden => 403,
            Self::NotFound => 404,
            Self::InternalServerError => 500,
            Self::NotImplemented => 501,
            Self::BadGateway => 502,
            Self::ServiceNotAvailable => 503,
            Self::GatewayTimeout => 504,
            Self::VersionNotSupported => 505,
            Self::Other(code) => code,
            Self::InvalidResponse => 1000,
            Self::ConnectionFailed => 1001,
        }
    }
}

/// An HTTP request under construction.
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    uri: String,
    major: u32,
    minor: u32,
    fields: HashMap<String, String>,
    body: String,
}

impl Request {
    /// Create a request; the URI is normalized to start with '/'.
    pub fn new(uri: &str, method: Method, body: &str) -> Self {
        let mut request = Self {
            method,
            uri: String::new(),
            major: 1,
            minor: 0,
            fields: HashMap::new(),
            body: body.to_owned(),
        };
        request.set_uri(uri);
        request
    }

    /// Set a header field; names are case-insensitive.
    pub fn set_field(&mut self, field: &str, value: &str) {
        self.fields
            .insert(field.to_ascii_lowercase(), value.to_owned());
    }

    /// Change the request method.
    pub fn set_method(&mut self, method: Method) {
        self.method = method;
    }

    /// Change the target URI, normalized to start with '/'.
    pub fn set_uri(&mut self, uri: &str) {
        self.uri = if uri.starts_with('/') {
            uri.to_owned()
        } else {
            format!("/{uri}")
        };
    }

    /// Change the announced HTTP version.
    pub fn set_http_version(&mut self, major: u32, minor: u32) {
        self.major = major;
        self.minor = minor;
    }

    /// Change the request body.
    pub fn set_body(&mut self, body: &str) {
        self.body = body.to_owned();
    }

    /// Whether the field was set (case-insensitive).
    pub fn has_field(&self, field: &str) -> bool {
        self.fields.contains_key(&field.to_ascii_lowercase())
    }

    /// Render the request into its wire form.
    fn prepare(&self) -> String {
        let mut out = format!(
            "{} {} HTTP/{}.{}\r\n",
            self.method.as_str(),
            self.uri,
            self.major,
            self.minor
        );
        for (field, value) in &self.fields {
            out.push_str(field);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        out.push_str(&self.body);
        out
    }
}

/// A parsed HTTP response.
#[derive(Debug, Clone)]
pub struct Response {
    status: ResponseStatus,
    major: u32,
    minor: u32,
    fields: HashMap<String, String>,
    body: String,
}

impl Default for Response {
    fn default() -> Self {
        Self {
            status: ResponseStatus::ConnectionFailed,
            major: 0,
            minor: 0,
            fields: HashMap::new(),
            body: String::new(),
        }
    }
}

impl Response {
    /// The response status.
    pub fn status(&self) -> ResponseStatus {
        self.status
    }

    /// Major HTTP version announced by the server.
    pub fn major_http_version(&self) -> u32 {
        self.major
    }

    /// Minor HTTP version announced by the server.
    pub fn minor_http_version(&self) -> u32 {
        self.minor
    }

    /// A header field's value, or "" when absent (case-insensitive).
    pub fn field(&self, field: &str) -> &str {
        self.fields
            .get(&field.to_ascii_lowercase())
            .map(String::as_str)
            .unwrap_or("")
    }

    /// The response body.
    pub fn body(&self) -> &str {
        &self.body
    }

    /// Parse the raw bytes the server sent before closing the stream.
    fn parse(data: &[u8]) -> Self {
        let mut response = Response {
            status: ResponseStatus::InvalidResponse,
            ..Default::default()
        };
        let mut cursor = data;

        // Status line: version token, then the numeric code.
        let status_line = take_line(&mut cursor);
        let status_line = String::from_utf8_lossy(status_line);
        let mut tokens = status_line.split_whitespace();

        let Some(version) = tokens.next() else {
            return response;
        };
        let bytes = version.as_bytes();
        let well_formed = bytes.len() >= 8
            && version[..5].eq_ignore_ascii_case("http/")
            && bytes[5].is_ascii_digit()
            && bytes[6] == b'.'
            && bytes[7].is_ascii_digit();
        if !well_formed {
            return response;
        }
        response.major = u32::from(bytes[5] - b'0');
        response.minor = u32::from(bytes[7] - b'0');

        let Some(code) = tokens.next().and_then(|t| t.parse::<u16>().ok()) else {
            return response;
        };
        response.status = ResponseStatus::from_code(code);

        parse_fields(&mut cursor, &mut response.fields);

        if !response.field("transfer-encoding").eq_ignore_ascii_case("chunked") {
            response.body = String::from_utf8_lossy(cursor).into_owned();
            return response;
        }

        // Chunked transfer: hex-sized pieces until the zero chunk, then
        // optional trailer fields.
        let mut body = Vec::new();
        loop {
            if cursor.is_empty() {
                break;
            }
            let line = take_line(&mut cursor);
            let token = String::from_utf8_lossy(line);
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            let size_token = token.split(';').next().unwrap_or("").trim();
            let Ok(size) = usize::from_str_radix(size_token, 16) else {
                break;
            };
            if size == 0 {
                break;
            }
            let take = size.min(cursor.len());
            body.extend_from_slice(&cursor[..take]);
            cursor = &cursor[take..];
        }
        parse_fields(&mut cursor, &mut response.fields);
        response.body = String::from_utf8_lossy(&body).into_owned();

        response
    }
}

/// Take one line from the cursor, stripping the terminator.
fn take_line<'a>(cursor: &mut &'a [u8]) -> &'a [u8] {
    let line = match cursor.iter().position(|&b| b == b'\n') {
        Some(pos) => {
            let line = &cursor[..pos];
            *cursor = &cursor[pos + 1..];
            line
        }
        None => {
            let line = *cursor;
            *cursor = &[];
            line
        }
    };
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Consume "name: value" lines up to the next blank line.
fn parse_fields(cursor: &mut &[u8], fields: &mut HashMap<String, String>) {
    while !cursor.is_empty() {
        let line = take_line(cursor);
        if line.is_empty() {
            break;
        }
        let line = String::from_utf8_lossy(line);
        if let Some((name, value)) = line.split_once(": ") {
            fields.insert(name.to_ascii_lowercase(), value.to_owned());
        }
    }
}

/// An HTTP/1.x client bound to one host.
pub struct HttpClient {
    host: Option<IpAddress>,
    host_name: String,
    port: u16,
    connection: TcpSocket,
}

impl HttpClient {
    /// Create a client for `host`, which may carry an `http://` scheme.
    ///
    /// A zero `port` selects the scheme default.
    pub fn new(host: &str, port: u16) -> Self {
        let mut client = Self {
            host: None,
            host_name: String::new(),
            port: 0,
            connection: TcpSocket::new(),
        };
        client.set_host(host, port);
        client
    }

    /// Re-target the client at another host.
    pub fn set_host(&mut self, host: &str, port: u16) {
        let lowered = host.to_ascii_lowercase();
        if let Some(rest) = lowered.strip_prefix("http://") {
            self.host_name = host[host.len() - rest.len()..].to_owned();
            self.port = if port != 0 { port } else { DEFAULT_HTTP_PORT };
        } else if lowered.starts_with("https://") {
            warn!("https is not supported by the http client");
            self.host_name.clear();
            self.port = 0;
        } else {
            self.host_name = host.to_owned();
            self.port = if port != 0 { port } else { DEFAULT_HTTP_PORT };
        }

        if self.host_name.ends_with('/') {
            self.host_name.pop();
        }

        self.host = IpAddress::resolve(&self.host_name);
    }

    /// Send a request and wait for the complete response.
    ///
    /// Mandatory fields missing from the request are filled in. The
    /// timeout bounds the connect step; zero means the blocking mode
    /// decides.
    pub fn send_request(&mut self, request: &Request, timeout: Duration) -> Response {
        let mut to_send = request.clone();
        if !to_send.has_field("From") {
            to_send.set_field("From", "user@wharf.dev");
        }
        if !to_send.has_field("User-Agent") {
            to_send.set_field("User-Agent", "wharf/0.1");
        }
        if !to_send.has_field("Host") {
            to_send.set_field("Host", &self.host_name);
        }
        if !to_send.has_field("Content-Length") {
            to_send.set_field("Content-Length", &to_send.body.len().to_string());
        }
        if to_send.method == Method::Post && !to_send.has_field("Content-Type") {
            to_send.set_field("Content-Type", "application/x-www-form-urlencoded");
        }
        if to_send.major * 10 + to_send.minor >= 11 && !to_send.has_field("Connection") {
            to_send.set_field("Connection", "close");
        }

        let mut received = Response::default();
        let Some(host) = self.host else {
            return received;
        };

        if self.connection.connect(host, self.port, timeout) == Status::Done {
            let request_str = to_send.prepare();

            if self.connection.send(request_str.as_bytes()) == Status::Done {
                // Read until the server closes the connection.
                let mut raw = Vec::new();
                let mut buffer = [0u8; READ_CHUNK];
                loop {
                    let (status, count) = self.connection.receive(&mut buffer);
                    if status != Status::Done {
                        break;
                    }
                    raw.extend_from_slice(&buffer[..count]);
                }

                received = Response::parse(&raw);
            }

            self.connection.disconnect();
        }

        received
    }
}

/// The machine's address as seen from the internet.
///
/// Queries a public echo service over HTTP; the timeout bounds the
/// connect step.
pub fn public_address(timeout: Duration) -> Option<IpAddress> {
    let mut server = HttpClient::new("api.ipify.org", 0);
    let request = Request::new("/", Method::Get, "");
    let response = server.send_request(&request, timeout);
    if response.status() == ResponseStatus::Ok {
        IpAddress::resolve(response.body().trim())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_prepare_shape() {
        let mut request = Request::new("index.html", Method::Get, "");
        request.set_http_version(1, 1);
        request.set_field("Host", "example.test");

        let wire = request.prepare();
        assert!(wire.starts_with("GET /index.html HTTP/1.1\r\n"));
        assert!(wire.contains("host: example.test\r\n"));
        assert!(wire.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_post_body_is_appended_after_blank_line() {
        let request = Request::new("/submit", Method::Post, "a=1&b=2");
        let wire = request.prepare();
        assert!(wire.starts_with("POST /submit HTTP/1.0\r\n"));
        assert!(wire.ends_with("\r\n\r\na=1&b=2"));
    }

    #[test]
    fn test_parse_plain_response() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nX-Thing: 7\r\n\r\nhello body";
        let response = Response::parse(raw);
        assert_eq!(response.status(), ResponseStatus::Ok);
        assert_eq!(response.major_http_version(), 1);
        assert_eq!(response.minor_http_version(), 1);
        assert_eq!(response.field("content-type"), "text/plain");
        assert_eq!(response.field("X-THING"), "7");
        assert_eq!(response.field("missing"), "");
        assert_eq!(response.body(), "hello body");
    }

    #[test]
    fn test_parse_chunked_response() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
                    5\r\nhello\r\n7\r\n, world\r\n0\r\n\r\n";
        let response = Response::parse(raw);
        assert_eq!(response.status(), ResponseStatus::Ok);
        assert_eq!(response.body(), "hello, world");
    }

    #[test]
    fn test_parse_rejects_non_http() {
        let response = Response::parse(b"SMTP/1.0 200 nope\r\n\r\n");
        assert_eq!(response.status(), ResponseStatus::InvalidResponse);

        let response = Response::parse(b"");
        assert_eq!(response.status(), ResponseStatus::InvalidResponse);
    }

    #[test]
    fn test_parse_unlisted_code() {
        let response = Response::parse(b"HTTP/1.0 418 teapot\r\n\r\n");
        assert_eq!(response.status(), ResponseStatus::Other(418));
        assert_eq!(response.status().code(), 418);
    }

    #[test]
    fn test_set_host_handles_schemes() {
        let client = HttpClient::new("http://localhost/", 0);
        assert_eq!(client.host_name, "localhost");
        assert_eq!(client.port, 80);
        assert_eq!(client.host, Some(IpAddress::LOCALHOST));

        let client = HttpClient::new("localhost", 8080);
        assert_eq!(client.port, 8080);

        let client = HttpClient::new("https://secure.test", 0);
        assert_eq!(client.host_name, "");
        assert_eq!(client.port, 0);
    }

    #[test]
    fn test_status_codes_round_trip() {
        for code in [200, 204, 301, 404, 500, 505] {
            assert_eq!(ResponseStatus::from_code(code).code(), code);
        }
        assert_eq!(ResponseStatus::InvalidResponse.code(), 1000);
        assert_eq!(ResponseStatus::ConnectionFailed.code(), 1001);
    }
}
