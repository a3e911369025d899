//! HTTP CONNECT proxy resolution from environment variables.
//!
//! Grounded on `examples/original_source/cdkProxy.c`'s
//! `CdkProxy_GetProxyForUrl`: scheme-scoped lookup (`http_proxy` for an
//! `http://` server URL, `https_proxy` then `HTTPS_PROXY` for `https://`),
//! PAC/SOCKS unsupported, non-ASCII values rejected with a one-time warning.
//! Per `tunnelMain.c`'s caller (`TunnelMain`), a proxy URL that fails to parse
//! doesn't abort the connection — it logs and falls back to a direct
//! connection, which this module mirrors by returning `None` rather than an
//! error.

use crate::url::ServerUrl;

/// A resolved HTTP CONNECT proxy endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyUrl {
    pub host: String,
    pub port: u16,
}

/// Resolve the proxy (if any) that should be used to reach `server`, using
/// the same environment variables and precedence as the original client.
#[must_use]
pub fn resolve_for(server: &ServerUrl) -> Option<ProxyUrl> {
    let var_name = if server.secure { "https_proxy" } else { "http_proxy" };
    let mut raw = std::env::var(var_name).ok().filter(|v| !v.is_empty());
    if raw.is_none() && server.secure {
        raw = std::env::var("HTTPS_PROXY").ok().filter(|v| !v.is_empty());
    }
    let raw = raw?;

    if !raw.is_ascii() {
        log::warn!("non-ASCII character found in proxy environment variable");
        return None;
    }

    match ServerUrl::parse(&raw, false) {
        Ok(url) => Some(ProxyUrl {
            host: url.host,
            port: url.port,
        }),
        Err(e) => {
            log::warn!("invalid proxy URL '{raw}': {e}; attempting direct connection");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment variables are process-global; serialize these tests so
    // they don't race each other under a parallel test runner.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_proxy_vars() {
        for var in ["http_proxy", "https_proxy", "HTTPS_PROXY"] {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn resolves_http_proxy_for_plain_http_server() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_proxy_vars();
        std::env::set_var("http_proxy", "http://proxy.local:3128");
        let server = ServerUrl::parse("http://broker.example.com", false).unwrap();
        let proxy = resolve_for(&server).unwrap();
        assert_eq!(proxy.host, "proxy.local");
        assert_eq!(proxy.port, 3128);
        clear_proxy_vars();
    }

    #[test]
    fn falls_back_from_lowercase_to_uppercase_https_proxy() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_proxy_vars();
        std::env::set_var("HTTPS_PROXY", "http://proxy.local:8080");
        let server = ServerUrl::parse("https://broker.example.com", false).unwrap();
        let proxy = resolve_for(&server).unwrap();
        assert_eq!(proxy.port, 8080);
        clear_proxy_vars();
    }

    #[test]
    fn no_proxy_configured_returns_none() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_proxy_vars();
        let server = ServerUrl::parse("http://broker.example.com", false).unwrap();
        assert!(resolve_for(&server).is_none());
    }

    #[test]
    fn invalid_proxy_url_falls_back_to_direct() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_proxy_vars();
        std::env::set_var("http_proxy", "http://proxy.local:notaport");
        let server = ServerUrl::parse("http://broker.example.com", false).unwrap();
        assert!(resolve_for(&server).is_none());
        clear_proxy_vars();
    }
}
