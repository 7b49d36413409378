use http::header::{CACHE_CONTROL, CONNECTION, CONTENT_TYPE, HeaderName};
use http::{HeaderMap, HeaderValue, StatusCode};

use crate::errors::AgentError;

pub const UI_MESSAGE_STREAM_HEADER: &str = "x-vercel-ai-ui-message-stream";
pub const UI_MESSAGE_STREAM_VERSION: &str = "v1";

/// Status and headers for a streamed response.
#[derive(Clone, Debug)]
pub struct ResponseInit {
    pub status: StatusCode,
    pub status_text: Option<String>,
    pub headers: HeaderMap,
}

impl Default for ResponseInit {
    fn default() -> Self {
        Self {
            status: StatusCode::OK,
            status_text: None,
            headers: HeaderMap::new(),
        }
    }
}

impl ResponseInit {
    pub fn status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    pub fn status_text(mut self, text: impl Into<String>) -> Self {
        self.status_text = Some(text.into());
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Result<Self, AgentError> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|err| AgentError::Config(format!("invalid header name `{name}`: {err}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|err| AgentError::Config(format!("invalid header value for `{name}`: {err}")))?;
        self.headers.insert(name, value);
        Ok(self)
    }
}

/// A response ready to hand to an HTTP framework.
#[derive(Debug)]
pub struct StreamResponse<B> {
    pub status: StatusCode,
    pub status_text: Option<String>,
    pub headers: HeaderMap,
    pub body: B,
}

impl<B> StreamResponse<B> {
    /// Converts into an `http::Response`. The status text has no counterpart there and is dropped.
    pub fn into_http(self) -> http::Response<B> {
        let mut response = http::Response::new(self.body);
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

fn set_default(headers: &mut HeaderMap, name: HeaderName, value: &'static str) {
    headers
        .entry(name)
        .or_insert_with(|| HeaderValue::from_static(value));
}

/// Caller-supplied headers win over the defaults.
pub(crate) fn sse_response<B>(init: ResponseInit, body: B) -> StreamResponse<B> {
    let mut headers = init.headers;
    set_default(&mut headers, CONTENT_TYPE, "text/event-stream");
    set_default(&mut headers, CACHE_CONTROL, "no-cache");
    set_default(&mut headers, CONNECTION, "keep-alive");
    set_default(
        &mut headers,
        HeaderName::from_static(UI_MESSAGE_STREAM_HEADER),
        UI_MESSAGE_STREAM_VERSION,
    );
    set_default(
        &mut headers,
        HeaderName::from_static("x-accel-buffering"),
        "no",
    );
    StreamResponse {
        status: init.status,
        status_text: init.status_text,
        headers,
        body,
    }
}

pub(crate) fn text_response<B>(init: ResponseInit, body: B) -> StreamResponse<B> {
    let mut headers = init.headers;
    set_default(&mut headers, CONTENT_TYPE, "text/plain; charset=utf-8");
    StreamResponse {
        status: init.status,
        status_text: init.status_text,
        headers,
        body,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_response_sets_default_headers() {
        let response = sse_response(ResponseInit::default(), ());
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.headers[CONTENT_TYPE], "text/event-stream");
        assert_eq!(response.headers[CACHE_CONTROL], "no-cache");
        assert_eq!(response.headers[UI_MESSAGE_STREAM_HEADER], "v1");
        assert_eq!(response.headers["x-accel-buffering"], "no");
    }

    #[test]
    fn caller_headers_and_status_are_kept() {
        let init = ResponseInit::default()
            .status(StatusCode::CREATED)
            .status_text("Created")
            .header("cache-control", "no-store")
            .expect("header")
            .header("x-request-id", "abc")
            .expect("header");
        let response = sse_response(init, ()).into_http();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()[CACHE_CONTROL], "no-store");
        assert_eq!(response.headers()["x-request-id"], "abc");
    }

    #[test]
    fn text_response_is_plain_utf8() {
        let response = text_response(ResponseInit::default(), ());
        assert_eq!(
            response.headers[CONTENT_TYPE],
            "text/plain; charset=utf-8"
        );
        assert!(response.headers.get(UI_MESSAGE_STREAM_HEADER).is_none());
    }

    #[test]
    fn invalid_header_name_is_config_error() {
        let err = ResponseInit::default()
            .header("bad header", "x")
            .expect_err("invalid");
        assert!(matches!(err, AgentError::Config(_)));
    }
}
