//! Endpoint URL parsing and validation
//!
//! Accepts `scheme://host[:port]` where scheme is `http` or `grpc`. A missing
//! scheme defaults to `http`; a missing port defaults to the protocol's
//! standard port. Everything else is rejected before any network I/O.

use crate::error::{ClientError, ClientResult};
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_HTTP_PORT: u16 = 8000;
pub const DEFAULT_GRPC_PORT: u16 = 8001;

/// Wire protocol selected from the endpoint scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Grpc,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Grpc => "grpc",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Self::Http => DEFAULT_HTTP_PORT,
            Self::Grpc => DEFAULT_GRPC_PORT,
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validated server endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn parse(url: &str) -> ClientResult<Self> {
        let trimmed = url.trim();
        if trimmed.is_empty() {
            return Err(ClientError::invalid_url(url, "url is empty"));
        }
        if trimmed.chars().any(char::is_whitespace) {
            return Err(ClientError::invalid_url(url, "url contains whitespace"));
        }

        let (scheme, rest) = match trimmed.split_once("://") {
            Some((scheme, rest)) => {
                let scheme = match scheme.to_ascii_lowercase().as_str() {
                    "http" => Scheme::Http,
                    "grpc" => Scheme::Grpc,
                    other => {
                        return Err(ClientError::invalid_url(
                            url,
                            format!("unsupported scheme '{}', expected http or grpc", other),
                        ));
                    }
                };
                (scheme, rest)
            }
            None => (Scheme::Http, trimmed),
        };

        let authority = rest.strip_suffix('/').unwrap_or(rest);
        if authority.is_empty() {
            return Err(ClientError::invalid_url(url, "missing host"));
        }
        if authority.contains(['/', '?', '#', '@']) {
            return Err(ClientError::invalid_url(
                url,
                "only scheme://host:port is accepted (no path, query or credentials)",
            ));
        }

        let (host, port) = split_host_port(url, authority)?;
        let port = match port {
            Some(port) => parse_port(url, port)?,
            None => scheme.default_port(),
        };

        Ok(Self {
            scheme,
            host: host.to_string(),
            port,
        })
    }

    /// `host:port` with IPv6 hosts bracketed
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Base URL for the underlying HTTP/2 or HTTP/1.1 connection.
    /// gRPC runs over cleartext HTTP/2 so both transports use `http://`.
    pub fn base_url(&self) -> String {
        format!("http://{}", self.authority())
    }
}

impl FromStr for Endpoint {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.authority())
    }
}

fn split_host_port<'a>(url: &str, authority: &'a str) -> ClientResult<(&'a str, Option<&'a str>)> {
    if let Some(rest) = authority.strip_prefix('[') {
        let (host, after) = rest
            .split_once(']')
            .ok_or_else(|| ClientError::invalid_url(url, "unterminated IPv6 host"))?;
        if host.is_empty() || !host.chars().all(|c| c.is_ascii_hexdigit() || c == ':' || c == '.') {
            return Err(ClientError::invalid_url(url, "invalid IPv6 host"));
        }
        return match after {
            "" => Ok((host, None)),
            _ => match after.strip_prefix(':') {
                Some(port) => Ok((host, Some(port))),
                None => Err(ClientError::invalid_url(url, "unexpected characters after host")),
            },
        };
    }

    let (host, port) = match authority.split_once(':') {
        Some((host, port)) => (host, Some(port)),
        None => (authority, None),
    };

    if host.is_empty() {
        return Err(ClientError::invalid_url(url, "missing host"));
    }
    if !host
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_')
    {
        return Err(ClientError::invalid_url(
            url,
            format!("invalid host '{}'", host),
        ));
    }

    Ok((host, port))
}

fn parse_port(url: &str, port: &str) -> ClientResult<u16> {
    if port.is_empty() || !port.chars().all(|c| c.is_ascii_digit()) {
        return Err(ClientError::invalid_url(
            url,
            format!("invalid port '{}'", port),
        ));
    }
    match port.parse::<u16>() {
        Ok(0) | Err(_) => Err(ClientError::invalid_url(
            url,
            format!("port '{}' out of range", port),
        )),
        Ok(port) => Ok(port),
    }
}
