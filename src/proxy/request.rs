use http::Method;
use thiserror::Error;

const HTTP_PREFIX: &str = "http://";

/// Reasons a client request is refused before any network I/O happens.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("malformed request: {0}")]
    MalformedRequest(&'static str),
    #[error("unsupported method '{0}'; only GET is proxied")]
    UnsupportedMethod(String),
    #[error("unsupported scheme in '{0}'; only plain http is proxied")]
    UnsupportedScheme(String),
    #[error("relative URL '{0}' cannot be proxied without an absolute target")]
    RelativeUrlUnsupported(String),
}

impl ParseError {
    /// Short machine-friendly label for logs and metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            ParseError::MalformedRequest(_) => "malformed_request",
            ParseError::UnsupportedMethod(_) => "unsupported_method",
            ParseError::UnsupportedScheme(_) => "unsupported_scheme",
            ParseError::RelativeUrlUnsupported(_) => "relative_url",
        }
    }
}

/// A client request reduced to what the proxy needs to serve it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRequest {
    pub method: Method,
    /// The URL token exactly as it appeared on the request line.
    pub target_url: String,
    /// Lowercased hostname, without port.
    pub host: String,
    /// Port given explicitly in the URL, if any.
    pub port: Option<u16>,
    /// Absolute path (including any query) to request from the origin.
    pub path: String,
    pub version: Option<String>,
    /// Set when the client asked for a fresh copy (`Cache-Control: no-cache` or
    /// `Pragma: no-cache`).
    pub bypass_cache: bool,
}

impl ProxyRequest {
    /// Scheme-less `host[:port]/path` form of the target, the basis of the cache key.
    pub fn resource(&self) -> String {
        match self.port {
            Some(port) => format!("{}:{}{}", self.host, port, self.path),
            None => format!("{}{}", self.host, self.path),
        }
    }

    pub fn port_or(&self, default_port: u16) -> u16 {
        self.port.unwrap_or(default_port)
    }
}

/// Parse the raw bytes read from a client into a [`ProxyRequest`].
///
/// Only the request line is interpreted strictly. Header lines are scanned for cache-bypass
/// directives and otherwise ignored; a request truncated by the read buffer still parses as long
/// as its request line is complete.
pub fn parse_request(raw: &[u8]) -> Result<ProxyRequest, ParseError> {
    let text = String::from_utf8_lossy(raw);
    let mut lines = text.split('\n').map(|line| line.trim_end_matches('\r'));

    let request_line = lines
        .next()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .ok_or(ParseError::MalformedRequest("no request line found"))?;

    let mut tokens = request_line.split_whitespace();
    let (method, target) = match (tokens.next(), tokens.next()) {
        (Some(method), Some(target)) => (method, target),
        _ => {
            return Err(ParseError::MalformedRequest(
                "request line needs a method and a target",
            ));
        }
    };
    let version = tokens.next().map(str::to_string);

    let method = method.to_ascii_uppercase();
    if method != "GET" {
        return Err(ParseError::UnsupportedMethod(method));
    }

    let remainder = strip_scheme(target)?;
    let (authority, path) = match remainder.split_once('/') {
        Some((authority, rest)) => (authority, format!("/{rest}")),
        None => (remainder, "/".to_string()),
    };
    let (host, port) = parse_authority(authority)?;

    let bypass_cache = lines
        .take_while(|line| !line.is_empty())
        .any(is_no_cache_header);

    Ok(ProxyRequest {
        method: Method::GET,
        target_url: target.to_string(),
        host,
        port,
        path,
        version,
        bypass_cache,
    })
}

fn strip_scheme(target: &str) -> Result<&str, ParseError> {
    if target.starts_with('/') {
        return Err(ParseError::RelativeUrlUnsupported(target.to_string()));
    }
    if let Some((scheme, _)) = target.split_once("://") {
        let is_scheme = !scheme.is_empty()
            && scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
        if is_scheme && !scheme.eq_ignore_ascii_case("http") {
            return Err(ParseError::UnsupportedScheme(target.to_string()));
        }
    }
    match target.get(..HTTP_PREFIX.len()) {
        Some(prefix) if prefix.eq_ignore_ascii_case(HTTP_PREFIX) => {
            Ok(&target[HTTP_PREFIX.len()..])
        }
        _ => Ok(target),
    }
}

fn parse_authority(authority: &str) -> Result<(String, Option<u16>), ParseError> {
    if authority.is_empty() {
        return Err(ParseError::MalformedRequest("request target has no host"));
    }
    if authority.contains('@') {
        return Err(ParseError::MalformedRequest(
            "authority must not contain userinfo",
        ));
    }

    let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
        let (host, after) = rest
            .split_once(']')
            .ok_or(ParseError::MalformedRequest("unterminated IPv6 literal"))?;
        match after {
            "" => (host, None),
            _ => {
                let port = after
                    .strip_prefix(':')
                    .ok_or(ParseError::MalformedRequest("invalid authority"))?;
                (host, Some(parse_port(port)?))
            }
        }
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) => (host, Some(parse_port(port)?)),
            None => (authority, None),
        }
    };

    if host.is_empty() {
        return Err(ParseError::MalformedRequest("request target has no host"));
    }
    Ok((host.to_ascii_lowercase(), port))
}

fn parse_port(value: &str) -> Result<u16, ParseError> {
    match value.parse::<u16>() {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(ParseError::MalformedRequest("invalid port in request target")),
    }
}

fn is_no_cache_header(line: &str) -> bool {
    let Some((name, value)) = line.split_once(':') else {
        return false;
    };
    let name = name.trim();
    if !name.eq_ignore_ascii_case("cache-control") && !name.eq_ignore_ascii_case("pragma") {
        return false;
    }
    value
        .split(',')
        .any(|directive| directive.trim().eq_ignore_ascii_case("no-cache"))
}
