//! Backend endpoint URLs: `http(s)://<host>(:<port>)?/<service>/<method>`.

use reqwest::Url;
use std::fmt;
use std::str::FromStr;

use crate::types::{Error, Result};

/// Parsed backend target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub secure: bool,
    pub host: String,
    pub port: u16,
    pub service: String,
    pub method: String,
}

impl Endpoint {
    pub fn parse(url: &str) -> Result<Self> {
        let invalid = || {
            Error::config(format!(
                "invalid url '{}', expecting http(s)://<host>(:<port>)?/serviceName/method",
                url
            ))
        };

        let parsed = Url::parse(url).map_err(|_| invalid())?;
        let secure = match parsed.scheme() {
            "http" => false,
            "https" => true,
            _ => return Err(invalid()),
        };
        if parsed.query().is_some() || parsed.fragment().is_some() {
            return Err(invalid());
        }

        let host = parsed.host_str().ok_or_else(invalid)?.to_string();
        let port = parsed.port_or_known_default().ok_or_else(invalid)?;

        let segments: Vec<&str> = parsed.path_segments().ok_or_else(invalid)?.collect();
        let [service, method] = segments.as_slice() else {
            return Err(invalid());
        };
        if service.is_empty() || method.is_empty() {
            return Err(invalid());
        }

        Ok(Self {
            secure,
            host,
            port,
            service: service.to_string(),
            method: method.to_string(),
        })
    }

    pub fn host_port(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Scheme and authority, without the method path.
    pub fn base_url(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{}://{}", scheme, self.host_port())
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.base_url(), self.service, self.method)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_explicit_port() {
        let endpoint = Endpoint::parse("http://localhost:2002/main.PricingService/Price").unwrap();
        assert_eq!(
            endpoint,
            Endpoint {
                secure: false,
                host: "localhost".to_string(),
                port: 2002,
                service: "main.PricingService".to_string(),
                method: "Price".to_string(),
            }
        );
        assert_eq!(endpoint.base_url(), "http://localhost:2002");
    }

    #[test]
    fn test_default_ports() {
        assert_eq!(Endpoint::parse("http://svc/a.B/C").unwrap().port, 80);
        let secure = Endpoint::parse("https://svc.run.app/a.B/C").unwrap();
        assert!(secure.secure);
        assert_eq!(secure.port, 443);
        assert_eq!(secure.to_string(), "https://svc.run.app:443/a.B/C");
    }

    #[test]
    fn test_rejects_bad_shapes() {
        for url in [
            "grpc://host/a.B/C",
            "http://host/a.B",
            "http://host/a.B/C/D",
            "http://host/a.B/",
            "http://host/a.B/C?x=1",
            "not a url",
        ] {
            assert!(
                matches!(Endpoint::parse(url), Err(Error::Config(_))),
                "accepted {}",
                url
            );
        }
    }
}
