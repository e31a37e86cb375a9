// Request envelope parsing
// A request is an HTTP/1.1 envelope addressed at the server root carrying a
// JSON body. The body names a dotted entity path that the entity tree
// consumes fragment by fragment through a cursor owned by this value.

use serde_json::Value;

use crate::errors::{BrokerError, BrokerResult};
use crate::types::EntityPath;

/// Supported HTTP methods. GET queries resources, POST allocates a
/// resource, PUT creates an organization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
}

impl Method {
    fn from_token(token: &str) -> BrokerResult<Self> {
        match token {
            "GET" => Ok(Method::Get),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            other => Err(BrokerError::Validation(format!(
                "unsupported method {other:?}: use GET to query resources, \
                 POST to register a resource, and PUT to create an organization"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
        }
    }
}

/// A parsed request: method, JSON body, and a consumable path cursor.
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    raw: Value,
    fragments: Vec<String>,
    cursor: usize,
}

impl Request {
    /// Parse a raw HTTP envelope.
    ///
    /// The request line must be exactly `METHOD / HTTP/1.1`; the body (after
    /// the blank line) must decode as JSON. Framing and decode failures are
    /// `Validation`.
    pub fn parse(bytes: &[u8]) -> BrokerResult<Self> {
        let text = std::str::from_utf8(bytes)
            .map_err(|_| BrokerError::Validation("request is not valid UTF-8".into()))?;
        let (head, body) = text.split_once("\r\n\r\n").ok_or_else(|| {
            BrokerError::Validation("request is missing the header terminator".into())
        })?;

        let request_line = head.split("\r\n").next().unwrap_or_default();
        let mut tokens = request_line.split_whitespace();
        let (method, target, version) = match (tokens.next(), tokens.next(), tokens.next()) {
            (Some(m), Some(t), Some(v)) => (m, t, v),
            _ => {
                return Err(BrokerError::Validation(
                    "malformed request line".into(),
                ))
            }
        };
        if target != "/" {
            return Err(BrokerError::Validation(
                "server only supports the root HTTP target".into(),
            ));
        }
        if version != "HTTP/1.1" {
            return Err(BrokerError::Validation(
                "only HTTP/1.1 is supported".into(),
            ));
        }
        let method = Method::from_token(method)?;

        let raw: Value = serde_json::from_str(body).map_err(|_| {
            BrokerError::Validation(
                "poorly formatted request: could not parse the request data".into(),
            )
        })?;
        Self::from_value(method, raw)
    }

    /// Build a request from an already-decoded body. The path cursor starts
    /// before the first fragment; PUT bodies carry no `entity` and get an
    /// empty fragment list.
    pub fn from_value(method: Method, raw: Value) -> BrokerResult<Self> {
        if !raw.is_object() {
            return Err(BrokerError::Validation(
                "request data must be a JSON object".into(),
            ));
        }
        let fragments = raw
            .get("entity")
            .and_then(Value::as_str)
            .map(|path| path.split('.').map(str::to_string).collect())
            .unwrap_or_default();
        Ok(Self {
            method,
            raw,
            fragments,
            cursor: 0,
        })
    }

    /// Method-specific validation of the envelope.
    ///
    /// POST requires `authorization`, a well-formed `entity` path, and
    /// `data`. GET requires `authorization`, a well-formed `entity`, and a
    /// boolean `recursive`. PUT passes through: its schema belongs to the
    /// tree builder.
    pub fn validate(&self) -> BrokerResult<()> {
        match self.method {
            Method::Put => Ok(()),
            Method::Post => {
                self.require_authorization()?;
                self.require_entity_path()?;
                if self.raw.get("data").is_none() {
                    return Err(BrokerError::Validation(
                        "request missing data arguments".into(),
                    ));
                }
                Ok(())
            }
            Method::Get => {
                self.require_authorization()?;
                self.require_entity_path()?;
                match self.raw.get("recursive") {
                    Some(Value::Bool(_)) => Ok(()),
                    _ => Err(BrokerError::Validation(
                        "query requests must carry a boolean 'recursive' flag".into(),
                    )),
                }
            }
        }
    }

    fn require_authorization(&self) -> BrokerResult<()> {
        if self.raw.get("authorization").is_none() {
            return Err(BrokerError::Validation(
                "request does not have an authorization key".into(),
            ));
        }
        Ok(())
    }

    fn require_entity_path(&self) -> BrokerResult<()> {
        let path = self
            .raw
            .get("entity")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                BrokerError::Validation("entity path not specified in request".into())
            })?;
        EntityPath::new(path)
            .map_err(|_| BrokerError::Validation("requested path is not legal".into()))?;
        Ok(())
    }

    /// Return the current fragment and advance the cursor.
    pub fn next_route(&mut self) -> BrokerResult<String> {
        if self.cursor == self.fragments.len() {
            return Err(BrokerError::BottomOfRequest);
        }
        let next = self.fragments[self.cursor].clone();
        self.cursor += 1;
        Ok(next)
    }

    pub fn method(&self) -> Method {
        self.method
    }

    /// The whole decoded body.
    pub fn raw_request(&self) -> &Value {
        &self.raw
    }

    /// The `data` sub-object of an allocation request.
    pub fn data(&self) -> BrokerResult<&Value> {
        self.raw
            .get("data")
            .ok_or_else(|| BrokerError::Validation("request missing data arguments".into()))
    }

    /// First path fragment (the organization root), if the body named one.
    pub fn root_name(&self) -> Option<&str> {
        self.fragments.first().map(String::as_str)
    }

    /// The fragment most recently returned by [`next_route`].
    ///
    /// [`next_route`]: Request::next_route
    pub fn current_name(&self) -> Option<&str> {
        self.cursor
            .checked_sub(1)
            .and_then(|i| self.fragments.get(i))
            .map(String::as_str)
    }

    /// Top-level keys of the body.
    pub fn headers(&self) -> Vec<String> {
        self.raw
            .as_object()
            .map(|map| map.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// The full dotted entity path.
    pub fn entity_path(&self) -> BrokerResult<&str> {
        self.raw
            .get("entity")
            .and_then(Value::as_str)
            .ok_or_else(|| BrokerError::Validation("entity path not specified in request".into()))
    }
}
