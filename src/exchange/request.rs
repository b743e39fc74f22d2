//! Outbound request: method, target path and headers.

use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{Extensions, Method};

use super::body::{BodyStream, BodyTransform, Part, RequestBody, percent_encode};
use crate::error::{Error, Result};

/// Builder for the request target: a normalized absolute path plus an
/// optional query string.
#[derive(Debug, Clone)]
pub struct PathBuilder {
    path: String,
    query: Option<String>,
}

impl PathBuilder {
    /// Parse an absolute request target. Fails unless it starts with `/`.
    pub(crate) fn parse(target: &str) -> Result<Self> {
        if !target.starts_with('/') {
            return Err(Error::new_http()
                .with_message(format!("request target must be absolute: {target:?}")));
        }
        match target.split_once('?') {
            Some((path, query)) => Ok(Self {
                path: path.to_owned(),
                query: Some(query.to_owned()),
            }),
            None => Ok(Self {
                path: target.to_owned(),
                query: None,
            }),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// Append a query parameter, percent-encoding key and value.
    pub fn query_param(&mut self, key: &str, value: &str) -> &mut Self {
        let pair = format!("{}={}", percent_encode(key), percent_encode(value));
        match self.query {
            Some(ref mut query) if !query.is_empty() => {
                query.push('&');
                query.push_str(&pair);
            }
            _ => self.query = Some(pair),
        }
        self
    }

    /// The serialized origin-form target.
    pub fn request_target(&self) -> String {
        match self.query {
            Some(ref query) => format!("{}?{}", self.path, query),
            None => self.path.clone(),
        }
    }
}

/// An outbound request bound to an endpoint.
///
/// All mutators fail once the connection has started serializing the
/// request head; the payload is immutable after its first frame is written.
pub struct Request {
    method: Method,
    path: PathBuilder,
    headers: HeaderMap,
    body: RequestBody,
    context: Extensions,
    sent: bool,
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("target", &self.path.request_target())
            .field("headers", &self.headers)
            .field("sent", &self.sent)
            .finish()
    }
}

impl Request {
    pub(crate) fn new(method: Method, target: &str) -> Result<Self> {
        Ok(Self {
            method,
            path: PathBuilder::parse(target)?,
            headers: HeaderMap::new(),
            body: RequestBody::empty(),
            context: Extensions::new(),
            sent: false,
        })
    }

    fn ensure_mutable(&self) -> Result<()> {
        if self.sent {
            Err(Error::new_http().with_message("request already sent"))
        } else {
            Ok(())
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn set_method(&mut self, method: Method) -> Result<&mut Self> {
        self.ensure_mutable()?;
        self.method = method;
        Ok(self)
    }

    pub fn path(&self) -> &PathBuilder {
        &self.path
    }

    pub fn path_mut(&mut self) -> &mut PathBuilder {
        &mut self.path
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Append a header. Invalid names or values are reported as errors
    /// rather than panicking.
    pub fn header<N, V>(&mut self, name: N, value: V) -> Result<&mut Self>
    where
        N: TryInto<HeaderName, Error: Into<crate::error::BoxError>>,
        V: TryInto<HeaderValue, Error: Into<crate::error::BoxError>>,
    {
        self.ensure_mutable()?;
        let name = name
            .try_into()
            .map_err(|err| Error::new_http().with(err))?;
        let value = value
            .try_into()
            .map_err(|err| Error::new_http().with(err))?;
        self.headers.append(name, value);
        Ok(self)
    }

    /// Caller-supplied context carried through the exchange.
    pub fn context(&self) -> &Extensions {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut Extensions {
        &mut self.context
    }

    fn ensure_body_allowed(&self) -> Result<()> {
        match self.method {
            Method::GET | Method::HEAD | Method::TRACE => Err(Error::new_http()
                .with_message(format!("method {} does not allow a body", self.method))),
            _ => Ok(()),
        }
    }

    /// Set a fixed byte payload. Supersedes any previously set body.
    pub fn body_bytes(&mut self, data: impl Into<Bytes>) -> Result<&mut Self> {
        self.ensure_mutable()?;
        self.ensure_body_allowed()?;
        self.body = RequestBody::bytes(data.into());
        Ok(self)
    }

    /// Set a string payload. Supersedes any previously set body.
    pub fn body_string(&mut self, data: impl Into<String>) -> Result<&mut Self> {
        self.ensure_mutable()?;
        self.ensure_body_allowed()?;
        self.body = RequestBody::bytes(Bytes::from(data.into()));
        Ok(self)
    }

    /// Set a streaming payload of unknown length.
    /// Supersedes any previously set body.
    pub fn body_raw(&mut self, stream: BodyStream) -> Result<&mut Self> {
        self.ensure_mutable()?;
        self.ensure_body_allowed()?;
        self.body = RequestBody::raw(stream);
        Ok(self)
    }

    /// Set a file-backed payload; `Content-Length` and `Content-Type` are
    /// discovered from the resource unless set explicitly.
    /// Supersedes any previously set body.
    pub fn body_resource(&mut self, path: impl Into<std::path::PathBuf>) -> Result<&mut Self> {
        self.ensure_mutable()?;
        self.ensure_body_allowed()?;
        self.body = RequestBody::resource(path.into());
        Ok(self)
    }

    /// Set an `application/x-www-form-urlencoded` payload.
    /// Supersedes any previously set body.
    pub fn body_url_encoded(&mut self, params: Vec<(String, String)>) -> Result<&mut Self> {
        self.ensure_mutable()?;
        self.ensure_body_allowed()?;
        self.body = RequestBody::url_encoded(params);
        Ok(self)
    }

    /// Set a `multipart/form-data` payload.
    /// Supersedes any previously set body.
    pub fn body_multipart(&mut self, parts: Vec<Part>) -> Result<&mut Self> {
        self.ensure_mutable()?;
        self.ensure_body_allowed()?;
        self.body = RequestBody::multipart(parts);
        Ok(self)
    }

    /// Layer a payload transformer; transformers run in declaration order.
    pub fn transform_body(&mut self, transform: BodyTransform) -> Result<&mut Self> {
        self.ensure_mutable()?;
        self.body.push_transformer(transform);
        Ok(self)
    }

    pub(crate) fn has_body(&self) -> bool {
        !self.body.is_empty_kind()
    }

    /// Flip the request into its immutable, on-the-wire state.
    pub(crate) fn mark_sent(&mut self) {
        self.sent = true;
    }

    pub(crate) fn take_body(&mut self) -> RequestBody {
        std::mem::take(&mut self.body)
    }

    pub(crate) fn headers_mut_unchecked(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_target_rejected() {
        let err = Request::new(Method::GET, "hello").unwrap_err();
        assert!(err.is_http());
    }

    #[test]
    fn query_params_appended_encoded() {
        let mut request = Request::new(Method::GET, "/search?seed=1").unwrap();
        request.path_mut().query_param("q", "a b&c");
        assert_eq!(request.path().request_target(), "/search?seed=1&q=a+b%26c");
    }

    #[test]
    fn mutation_after_sent_fails() {
        let mut request = Request::new(Method::POST, "/submit").unwrap();
        request.mark_sent();
        assert!(request.set_method(Method::PUT).is_err());
        assert!(request.header("x-test", "1").is_err());
        assert!(request.body_string("late").is_err());
    }

    #[test]
    fn body_rejected_for_bodiless_method() {
        let mut request = Request::new(Method::GET, "/").unwrap();
        assert!(request.body_string("nope").is_err());
        let mut request = Request::new(Method::POST, "/").unwrap();
        assert!(request.body_string("yep").is_ok());
    }

    #[test]
    fn body_setter_is_exclusive() {
        let mut request = Request::new(Method::POST, "/").unwrap();
        request.body_string("first").unwrap();
        request
            .body_url_encoded(vec![("a".into(), "b".into())])
            .unwrap();
        // the last setter wins; exercised further in integration tests
        assert!(request.has_body());
    }
}
