//! Exchange interceptors.
//!
//! An interceptor sees the exchange before it reaches the pool. It may
//! mutate the request, observe or transform the response payload, or
//! short-circuit the send entirely by returning `None`: the response it
//! synthesized is then delivered to the caller and no connection is ever
//! acquired.

use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::StatusCode;

use crate::error::{Error, Result};
use crate::exchange::body::BodyTransform;
use crate::exchange::{Request, Response};

/// Future returned by an interceptor.
pub type InterceptorFuture = Pin<Box<dyn Future<Output = Result<Option<InterceptedExchange>>> + Send>>;

/// A single interceptor; chains compose left to right.
pub type Interceptor = Arc<dyn Fn(InterceptedExchange) -> InterceptorFuture + Send + Sync>;

/// The response an interceptor synthesizes when it short-circuits.
#[derive(Debug)]
pub struct SyntheticResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl SyntheticResponse {
    fn new() -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) -> &mut Self {
        self.status = status;
        self
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn header<N, V>(&mut self, name: N, value: V) -> Result<&mut Self>
    where
        N: TryInto<HeaderName, Error: Into<crate::error::BoxError>>,
        V: TryInto<HeaderValue, Error: Into<crate::error::BoxError>>,
    {
        let name = name.try_into().map_err(|err| Error::new_http().with(err))?;
        let value = value.try_into().map_err(|err| Error::new_http().with(err))?;
        self.headers.append(name, value);
        Ok(self)
    }

    pub fn set_body(&mut self, body: impl Into<Bytes>) -> &mut Self {
        self.body = body.into();
        self
    }
}

/// The exchange as seen by interceptors: a mutable view of the request,
/// the synthesized response, and response payload transformers. Once the
/// chain completes and the request is dispatched, the request becomes
/// immutable through its own sent state.
pub struct InterceptedExchange {
    request: Request,
    response: SyntheticResponse,
    response_transformers: Vec<BodyTransform>,
}

impl InterceptedExchange {
    pub(crate) fn new(request: Request) -> Self {
        Self {
            request,
            response: SyntheticResponse::new(),
            response_transformers: Vec::new(),
        }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn request_mut(&mut self) -> &mut Request {
        &mut self.request
    }

    /// The response to deliver when the chain short-circuits.
    pub fn response(&self) -> &SyntheticResponse {
        &self.response
    }

    pub fn response_mut(&mut self) -> &mut SyntheticResponse {
        &mut self.response
    }

    /// Transform the response payload: applied to the real payload when
    /// the exchange proceeds, or to the synthesized payload when the
    /// chain short-circuits.
    pub fn transform_response_body(&mut self, transform: BodyTransform) -> &mut Self {
        self.response_transformers.push(transform);
        self
    }

    pub(crate) fn into_parts(self) -> (Request, SyntheticResponse, Vec<BodyTransform>) {
        (self.request, self.response, self.response_transformers)
    }
}

impl std::fmt::Debug for InterceptedExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptedExchange")
            .field("request", &self.request)
            .field("response", &self.response)
            .field("response_transformers", &self.response_transformers.len())
            .finish()
    }
}

/// What running the chain decided.
pub(crate) enum Outcome {
    /// Dispatch the (possibly mutated) request.
    Proceed(Request, Vec<BodyTransform>),
    /// Deliver the synthesized response; the wire is never touched.
    ShortCircuit(Response),
}

pub(crate) async fn run_chain(chain: &[Interceptor], request: Request) -> Result<Outcome> {
    let mut exchange = InterceptedExchange::new(request);
    for interceptor in chain {
        match interceptor(exchange).await? {
            Some(next) => exchange = next,
            None => {
                return Ok(Outcome::ShortCircuit(Response::from_synthetic(
                    exchange.response,
                    exchange.response_transformers,
                )?));
            }
        }
    }
    Ok(Outcome::Proceed(
        exchange.request,
        exchange.response_transformers,
    ))
}

impl Response {
    pub(crate) fn from_synthetic(
        synthetic: SyntheticResponse,
        transformers: Vec<BodyTransform>,
    ) -> Result<Self> {
        let mut response =
            Response::synthetic(synthetic.status, synthetic.headers, synthetic.body);
        for transform in transformers {
            response.body_mut().transform(transform)?;
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use http::Method;

    fn request() -> Request {
        Request::new(Method::GET, "/probe").unwrap()
    }

    #[tokio::test]
    async fn chain_mutates_request_left_to_right() {
        let first: Interceptor = Arc::new(|mut ie| {
            Box::pin(async move {
                ie.request_mut().header("x-order", "1")?;
                Ok(Some(ie))
            })
        });
        let second: Interceptor = Arc::new(|mut ie| {
            Box::pin(async move {
                ie.request_mut().header("x-order", "2")?;
                Ok(Some(ie))
            })
        });

        match run_chain(&[first, second], request()).await.unwrap() {
            Outcome::Proceed(request, _) => {
                let values: Vec<_> = request.headers().get_all("x-order").iter().collect();
                assert_eq!(values, ["1", "2"]);
            }
            Outcome::ShortCircuit(_) => panic!("chain should proceed"),
        }
    }

    #[tokio::test]
    async fn short_circuit_delivers_synthesized_response() {
        let teapot: Interceptor = Arc::new(|mut ie| {
            Box::pin(async move {
                ie.response_mut()
                    .set_status(StatusCode::IM_A_TEAPOT)
                    .set_body("teapot");
                Ok(None)
            })
        });

        match run_chain(&[teapot], request()).await.unwrap() {
            Outcome::ShortCircuit(response) => {
                assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
                let body = response.into_bytes().await.unwrap();
                assert_eq!(&body[..], b"teapot");
            }
            Outcome::Proceed(..) => panic!("chain should short-circuit"),
        }
    }

    #[tokio::test]
    async fn transformer_applies_to_synthesized_payload() {
        let shout: Interceptor = Arc::new(|mut ie| {
            Box::pin(async move {
                ie.response_mut().set_body("quiet");
                ie.transform_response_body(Box::new(|stream| {
                    Box::pin(stream.map(|chunk| {
                        chunk.map(|bytes| {
                            Bytes::from(
                                bytes.iter().map(u8::to_ascii_uppercase).collect::<Vec<_>>(),
                            )
                        })
                    }))
                }));
                Ok(None)
            })
        });

        match run_chain(&[shout], request()).await.unwrap() {
            Outcome::ShortCircuit(response) => {
                let body = response.into_bytes().await.unwrap();
                assert_eq!(&body[..], b"QUIET");
            }
            Outcome::Proceed(..) => panic!("chain should short-circuit"),
        }
    }
}
