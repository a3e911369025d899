//! Minimal `scheme://host[:port][/path]` parser for the `<server-url>`
//! command-line argument and for any HTTP proxy URL found in the environment.
//!
//! Grounded on `examples/original_source/cdkUrl.c`'s `CdkUrl_Parse`: implicit
//! protocol defaults to http/https depending on a caller-supplied hint,
//! implicit port is 80/443 by scheme, implicit path is `/`. IDN-to-punycode
//! conversion is dropped — Rust's DNS resolver already accepts UTF-8 hostnames
//! on every platform this targets, so carrying the ICU round-trip forward
//! would be translating work the resolver already does, not learning an
//! idiom.

use crate::error::TunnelError;

/// A parsed `scheme://host:port/path` endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerUrl {
    pub secure: bool,
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl ServerUrl {
    /// Parse `url`. `default_secure` picks the implicit scheme (and thus
    /// implicit port) when `url` has no `scheme://` prefix.
    pub fn parse(url: &str, default_secure: bool) -> Result<Self, TunnelError> {
        let (scheme, rest) = match url.split_once("://") {
            Some((scheme, rest)) => (Some(scheme), rest),
            None => (None, url),
        };

        let secure = match scheme {
            Some(s) if s.eq_ignore_ascii_case("https") => true,
            Some(s) if s.eq_ignore_ascii_case("http") => false,
            Some(other) => {
                return Err(TunnelError::ProtocolViolation(format!(
                    "unsupported URL scheme {other}"
                )))
            }
            None => default_secure,
        };

        let split_at = rest.find([':', '/']).unwrap_or(rest.len());
        let host = &rest[..split_at];
        if host.is_empty() {
            return Err(TunnelError::ProtocolViolation(format!("empty host in URL {url}")));
        }
        let mut remainder = &rest[split_at..];

        let port = if let Some(stripped) = remainder.strip_prefix(':') {
            let port_end = stripped.find('/').unwrap_or(stripped.len());
            let port_str = &stripped[..port_end];
            remainder = &stripped[port_end..];
            port_str
                .parse::<u16>()
                .map_err(|_| TunnelError::ProtocolViolation(format!("bad port in URL {url}")))?
        } else if secure {
            443
        } else {
            80
        };

        let path = if remainder.is_empty() {
            "/".to_string()
        } else {
            remainder.to_string()
        };

        Ok(Self {
            secure,
            host: host.to_string(),
            port,
            path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_explicit_scheme_host_port_path() {
        let u = ServerUrl::parse("https://broker.example.com:8443/tunnel", false).unwrap();
        assert_eq!(u.host, "broker.example.com");
        assert_eq!(u.port, 8443);
        assert_eq!(u.path, "/tunnel");
        assert!(u.secure);
    }

    #[test]
    fn defaults_port_from_scheme() {
        let u = ServerUrl::parse("http://broker.example.com", true).unwrap();
        assert_eq!(u.port, 80);
        assert!(!u.secure);
    }

    #[test]
    fn implicit_scheme_uses_caller_hint() {
        let u = ServerUrl::parse("broker.example.com", true).unwrap();
        assert!(u.secure);
        assert_eq!(u.port, 443);
    }

    #[test]
    fn implicit_path_is_root() {
        let u = ServerUrl::parse("http://broker.example.com:9", false).unwrap();
        assert_eq!(u.path, "/");
    }

    #[test]
    fn rejects_unknown_scheme() {
        assert!(ServerUrl::parse("ftp://broker.example.com", false).is_err());
    }

    #[test]
    fn rejects_bad_port() {
        assert!(ServerUrl::parse("http://broker.example.com:notaport/", false).is_err());
    }
}
