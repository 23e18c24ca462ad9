use reqwest::Method;
use serde::{Deserialize, Serialize};
use url::Url;

/// What the requester intends to do with the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    Document,
    Image,
    Script,
    Style,
    Font,
    Manifest,
    /// fetch()/XHR style requests
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMode {
    Navigate,
    SameOrigin,
    Cors,
    NoCors,
}

/// An intercepted request.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub url: Url,
    pub destination: Destination,
    pub mode: RequestMode,
    pub headers: Vec<(String, String)>,
}

impl Request {
    pub fn new(method: Method, url: &str) -> Result<Self, url::ParseError> {
        Ok(Self {
            method,
            url: Url::parse(url)?,
            destination: Destination::Empty,
            mode: RequestMode::Cors,
            headers: Vec::new(),
        })
    }

    pub fn get(url: &str) -> Result<Self, url::ParseError> {
        Self::new(Method::GET, url)
    }

    /// Top-level page navigation.
    pub fn navigate(url: &str) -> Result<Self, url::ParseError> {
        Ok(Self::get(url)?
            .with_destination(Destination::Document)
            .with_mode(RequestMode::Navigate))
    }

    pub fn with_destination(mut self, destination: Destination) -> Self {
        self.destination = destination;
        self
    }

    pub fn with_mode(mut self, mode: RequestMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate || self.destination == Destination::Document
    }

    /// Normalized identity: method plus URL without fragment.
    pub fn cache_key(&self) -> String {
        let mut url = self.url.clone();
        url.set_fragment(None);
        format!("{} {}", self.method, url)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseType {
    /// Same-origin response with readable headers and body
    Basic,
    Cors,
    Opaque,
    Error,
}

/// A response as stored in and served from cache partitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: u16,
    pub response_type: ResponseType,
    pub url: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status: u16, response_type: ResponseType, url: &str, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            response_type,
            url: url.to_string(),
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Only plain 200 same-origin responses may enter a partition.
    pub fn is_cacheable(&self) -> bool {
        self.status == 200 && self.response_type == ResponseType::Basic
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}
