//! Network endpoints.

use std::fmt;
use std::str::FromStr;

use crate::Error;

/// Where a connection can be established: transport name, host, port, and an
/// ordered transport-specific parameter list. Immutable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    transport: String,
    host: String,
    port: u16,
    params: Vec<(String, String)>,
}

impl Endpoint {
    pub fn new(transport: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            transport: transport.into(),
            host: host.into(),
            port,
            params: Vec::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    pub fn transport(&self) -> &str {
        &self.transport
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.transport, self.host, self.port)?;
        for (i, (key, value)) in self.params.iter().enumerate() {
            let sep = if i == 0 { '?' } else { '&' };
            write!(f, "{sep}{key}={value}")?;
        }
        Ok(())
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    /// Parse `transport://host:port[?key=value[&key=value]...]`.
    fn from_str(s: &str) -> Result<Self, Error> {
        let invalid = || Error::InvalidArgument(format!("invalid endpoint: {s}"));

        let (transport, rest) = s.split_once("://").ok_or_else(invalid)?;
        let (authority, query) = match rest.split_once('?') {
            Some((a, q)) => (a, Some(q)),
            None => (rest, None),
        };
        let (host, port) = authority.rsplit_once(':').ok_or_else(invalid)?;
        if transport.is_empty() || host.is_empty() {
            return Err(invalid());
        }
        let port: u16 = port.parse().map_err(|_| invalid())?;

        let mut endpoint = Endpoint::new(transport, host, port);
        if let Some(query) = query {
            for pair in query.split('&') {
                let (key, value) = pair.split_once('=').ok_or_else(invalid)?;
                endpoint.params.push((key.to_owned(), value.to_owned()));
            }
        }
        Ok(endpoint)
    }
}
