//! Target descriptors.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::{Encoding, Endpoint, Error, Invoker};

/// Wire protocol spoken to reach a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// Legacy framed protocol: single stream, sequential frames correlated
    /// by request id.
    Ice,
    /// Multiplexed protocol: one stream per request.
    IceRpc,
}

impl Protocol {
    pub fn name(&self) -> &'static str {
        match self {
            Protocol::Ice => "ice",
            Protocol::IceRpc => "icerpc",
        }
    }

    /// Default payload encoding for the protocol.
    pub fn default_encoding(&self) -> Encoding {
        match self {
            Protocol::Ice => Encoding::V1_1,
            Protocol::IceRpc => Encoding::V2_0,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "ice" => Ok(Protocol::Ice),
            "icerpc" => Ok(Protocol::IceRpc),
            other => Err(Error::InvalidArgument(format!("unknown protocol: {other}"))),
        }
    }
}

/// Validate an absolute service path: non-empty and `/`-prefixed.
pub fn check_path(path: &str) -> Result<(), Error> {
    if path.is_empty() || !path.starts_with('/') {
        return Err(Error::InvalidArgument(format!(
            "path must be absolute: {path:?}"
        )));
    }
    Ok(())
}

/// Describes a target service: protocol, absolute path, where to reach it,
/// and how its payloads are encoded. Immutable after construction.
#[derive(Clone)]
pub struct Proxy {
    protocol: Protocol,
    path: String,
    endpoint: Option<Endpoint>,
    alt_endpoints: Vec<Endpoint>,
    encoding: Encoding,
    invoker: Option<Arc<dyn Invoker>>,
}

impl Proxy {
    pub fn new(protocol: Protocol, path: impl Into<String>) -> Result<Self, Error> {
        let path = path.into();
        check_path(&path)?;
        Ok(Self {
            protocol,
            encoding: protocol.default_encoding(),
            path,
            endpoint: None,
            alt_endpoints: Vec::new(),
            invoker: None,
        })
    }

    pub fn with_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    pub fn with_alt_endpoints(mut self, endpoints: Vec<Endpoint>) -> Self {
        self.alt_endpoints = endpoints;
        self
    }

    pub fn with_encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// Bind the proxy to a specific invoker, overriding whatever connection
    /// the caller's pipeline would otherwise pick.
    pub fn with_invoker(mut self, invoker: Arc<dyn Invoker>) -> Self {
        self.invoker = Some(invoker);
        self
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn endpoint(&self) -> Option<&Endpoint> {
        self.endpoint.as_ref()
    }

    pub fn alt_endpoints(&self) -> &[Endpoint] {
        &self.alt_endpoints
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    pub fn invoker(&self) -> Option<&Arc<dyn Invoker>> {
        self.invoker.as_ref()
    }
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proxy")
            .field("protocol", &self.protocol)
            .field("path", &self.path)
            .field("endpoint", &self.endpoint)
            .field("alt_endpoints", &self.alt_endpoints.len())
            .field("encoding", &self.encoding)
            .field("bound", &self.invoker.is_some())
            .finish()
    }
}
