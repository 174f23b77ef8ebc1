//! Relaying backend responses to the original caller

use crate::forward::ProxyResponse;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::HeaderValue;
use hyper::Response;
use std::error::Error as StdError;
use std::io;
use thiserror::Error;

/// Body type of every response the proxy writes
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

#[derive(Debug, Error)]
pub enum RelayError {
    /// The caller disconnected before the response was delivered
    #[error("client went away before the response was delivered: {0}")]
    ClientGone(String),
}

/// Turn a backend response into the response written to the caller.
///
/// Status, headers and body are copied unchanged, except header entries with
/// a blank value and headers that only describe the backend connection's
/// framing, since the body is re-framed for the caller's connection.
pub fn relay(response: ProxyResponse) -> Response<ProxyBody> {
    let ProxyResponse { status, headers, body } = response;

    let mut relayed = Response::new(Full::new(body).map_err(|never| match never {}).boxed());
    *relayed.status_mut() = status;

    let out = relayed.headers_mut();
    for (name, value) in headers.iter() {
        if is_connection_scoped(name.as_str()) || is_blank(value) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }

    relayed
}

fn is_connection_scoped(name: &str) -> bool {
    matches!(name, "transfer-encoding" | "connection" | "keep-alive")
}

fn is_blank(value: &HeaderValue) -> bool {
    value.as_bytes().iter().all(|b| b.is_ascii_whitespace())
}

/// Classify a connection-level serve error as the caller having gone away
pub fn client_gone(err: &(dyn StdError + 'static)) -> Option<RelayError> {
    let mut current = Some(err);

    while let Some(e) = current {
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            if matches!(
                io_err.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::UnexpectedEof
            ) {
                return Some(RelayError::ClientGone(err.to_string()));
            }
        }
        if let Some(hyper_err) = e.downcast_ref::<hyper::Error>() {
            if hyper_err.is_incomplete_message() || hyper_err.is_canceled() || hyper_err.is_closed() {
                return Some(RelayError::ClientGone(err.to_string()));
            }
        }
        current = e.source();
    }

    None
}
