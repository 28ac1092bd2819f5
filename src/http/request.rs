use super::types::{Headers, Method, Version};
use bytes::Bytes;

/// A parsed HTTP request.
///
/// Header names are stored case-folded by the parser; lookups are
/// case-insensitive either way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// The HTTP method (GET, POST, etc.)
    pub method: Method,
    /// The request target exactly as sent, e.g. `/search?q=x#top`
    pub uri: String,
    /// HTTP version of the request line
    pub version: Version,
    /// Request headers
    pub headers: Headers,
    /// Exactly `Content-Length` bytes, or empty
    pub body: Bytes,
}

impl Request {
    pub fn new(method: Method, uri: impl Into<String>, version: Version) -> Self {
        Self {
            method,
            uri: uri.into(),
            version,
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    /// Retrieves a header value by name (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// The path component of the URI, `/` when absent.
    ///
    /// Absolute-form targets (`http://host/path`) are reduced to their path.
    pub fn path(&self) -> &str {
        let target = strip_authority(&self.uri);
        let end = target.find(['?', '#']).unwrap_or(target.len());
        match &target[..end] {
            "" => "/",
            path => path,
        }
    }

    /// The query string without the leading `?`, empty when absent.
    pub fn query(&self) -> &str {
        let target = strip_authority(&self.uri);
        let Some(start) = target.find('?') else {
            return "";
        };
        let rest = &target[start + 1..];
        &rest[..rest.find('#').unwrap_or(rest.len())]
    }

    /// The fragment without the leading `#`, empty when absent.
    pub fn fragment(&self) -> &str {
        self.uri.find('#').map(|i| &self.uri[i + 1..]).unwrap_or("")
    }

    /// Determines whether the connection should stay open after the response.
    ///
    /// HTTP/1.1 is persistent unless `Connection: close`; older versions
    /// close unless `Connection: keep-alive`.
    pub fn keep_alive(&self) -> bool {
        if self.version == Version::Http11 {
            !self.headers.has_token("connection", "close")
        } else {
            self.headers.has_token("connection", "keep-alive")
        }
    }
}

fn strip_authority(uri: &str) -> &str {
    match uri.find("://") {
        Some(i) => {
            let after = &uri[i + 3..];
            after.find('/').map(|j| &after[j..]).unwrap_or("")
        }
        None => uri,
    }
}
