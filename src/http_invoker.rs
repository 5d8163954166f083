//! Proxies a single `http_request` frame to the local server and produces
//! the matching `http_response` frame.
//!
//! Grounded on the header-filtering request-forwarding shape of the internal
//! API proxy (`proxy_handler` in the sandbox package): copy inbound headers
//! minus a deny-list, forward the body, copy the response back minus
//! hop-by-hop headers. The direction here is reversed (we are the one
//! dialing out) and the deny-list/response-header rules are specific to
//! this protocol.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;

use crate::frame::{Frame, Headers};

/// Header names stripped from the request before it reaches the local
/// server. Compared case-insensitively.
const REQUEST_HEADER_DENYLIST: &[&str] = &[
    "host",
    "connection",
    "upgrade",
    "transfer-encoding",
    "content-length",
    "x-forwarded-for",
    "x-forwarded-proto",
    "x-forwarded-host",
    "x-real-ip",
    "x-forwarded-server",
    "accept-encoding",
];

/// Header names stripped from the local server's response before it is
/// relayed back through the tunnel. The shared client already decompressed
/// the body, so none of these may survive to the far side.
const RESPONSE_HEADER_DENYLIST: &[&str] = &[
    "transfer-encoding",
    "connection",
    "keep-alive",
    "content-length",
    "content-encoding",
];

#[derive(Clone)]
pub struct HttpInvoker {
    client: reqwest::Client,
    local_base: String,
}

impl HttpInvoker {
    pub fn new(client: reqwest::Client, local_base: String) -> Self {
        Self {
            client,
            local_base: local_base.trim_end_matches('/').to_string(),
        }
    }

    /// Invoke the local server for one `http_request` frame and return the
    /// `http_response` frame to send back. Never fails: every error path is
    /// mapped to a synthetic response per the spec.
    pub async fn invoke(
        &self,
        request_id: &str,
        method: &str,
        path: &str,
        query_string: &str,
        headers: &Headers,
        body: Vec<u8>,
    ) -> Frame {
        match self.invoke_inner(method, path, query_string, headers, body).await {
            Ok((status, headers, body)) => Frame::HttpResponse {
                request_id: request_id.to_string(),
                status,
                headers,
                body,
            },
            Err(InvokeOutcome::LocalUnreachable) => Frame::HttpResponse {
                request_id: request_id.to_string(),
                status: 502,
                headers: vec![("Content-Type".into(), "text/plain".into())],
                body: b"Home Assistant is not responding".to_vec(),
            },
            Err(InvokeOutcome::Internal(msg)) => {
                tracing::error!(request_id, error = %msg, "unexpected error proxying http request");
                Frame::HttpResponse {
                    request_id: request_id.to_string(),
                    status: 500,
                    headers: vec![("Content-Type".into(), "text/plain".into())],
                    body: b"Internal tunnel error".to_vec(),
                }
            }
        }
    }

    async fn invoke_inner(
        &self,
        method: &str,
        path: &str,
        query_string: &str,
        headers: &Headers,
        body: Vec<u8>,
    ) -> Result<(u16, Headers, Vec<u8>), InvokeOutcome> {
        let url = assemble_url(&self.local_base, path, query_string);
        let method = Method::from_bytes(method.as_bytes())
            .map_err(|err| InvokeOutcome::Internal(format!("invalid method: {err}")))?;
        let header_map = sanitize_request_headers(headers)
            .map_err(|err| InvokeOutcome::Internal(format!("invalid header: {err}")))?;

        tracing::debug!(%method, %url, "proxying request to local server");

        let response = self
            .client
            .request(method.clone(), &url)
            .headers(header_map)
            .body(body)
            .send()
            .await
            .map_err(|err| {
                tracing::warn!(%method, %url, error = %err, "local server request failed");
                InvokeOutcome::LocalUnreachable
            })?;

        let status = response.status();
        if status.as_u16() == 400 {
            tracing::warn!(
                %path,
                "local server returned 400 Bad Request; check its trusted-proxy configuration"
            );
        }

        let response_headers = filter_response_headers(response.headers());
        let body = response
            .bytes()
            .await
            .map_err(|err| InvokeOutcome::Internal(format!("failed to read response body: {err}")))?;

        Ok((status.as_u16(), response_headers, body.to_vec()))
    }
}

enum InvokeOutcome {
    LocalUnreachable,
    Internal(String),
}

fn assemble_url(local_base: &str, path: &str, query_string: &str) -> String {
    if query_string.is_empty() {
        format!("{local_base}{path}")
    } else {
        format!("{local_base}{path}?{query_string}")
    }
}

fn sanitize_request_headers(headers: &Headers) -> Result<HeaderMap, reqwest::header::InvalidHeaderName> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let lower = name.to_ascii_lowercase();
        if REQUEST_HEADER_DENYLIST.contains(&lower.as_str()) {
            continue;
        }
        let header_name = HeaderName::from_bytes(name.as_bytes())?;
        if let Ok(header_value) = HeaderValue::from_str(value) {
            map.append(header_name, header_value);
        }
    }
    Ok(map)
}

fn filter_response_headers(headers: &reqwest::header::HeaderMap) -> Headers {
    headers
        .iter()
        .filter_map(|(name, value)| {
            let lower = name.as_str().to_ascii_lowercase();
            if RESPONSE_HEADER_DENYLIST.contains(&lower.as_str()) {
                return None;
            }
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assembles_url_with_query_string() {
        assert_eq!(
            assemble_url("http://localhost:8123", "/api/states", "foo=bar"),
            "http://localhost:8123/api/states?foo=bar"
        );
        assert_eq!(
            assemble_url("http://localhost:8123", "/api/states", ""),
            "http://localhost:8123/api/states"
        );
    }

    #[test]
    fn strips_denylisted_request_headers_case_insensitively() {
        let headers: Headers = vec![
            ("Host".into(), "public.example".into()),
            ("HOST".into(), "duplicate".into()),
            ("Accept-Encoding".into(), "gzip".into()),
            ("Authorization".into(), "Bearer x".into()),
            ("X-Custom".into(), "keep-me".into()),
        ];
        let map = sanitize_request_headers(&headers).unwrap();
        assert!(!map.contains_key("host"));
        assert!(!map.contains_key("accept-encoding"));
        assert_eq!(map.get("authorization").unwrap(), "Bearer x");
        assert_eq!(map.get("x-custom").unwrap(), "keep-me");
    }

    #[test]
    fn strips_hop_by_hop_and_encoding_headers_from_response() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert("Content-Type", "application/json".parse().unwrap());
        headers.insert("Content-Encoding", "gzip".parse().unwrap());
        headers.insert("Content-Length", "1234".parse().unwrap());
        headers.insert("Connection", "keep-alive".parse().unwrap());
        headers.insert("Transfer-Encoding", "chunked".parse().unwrap());
        headers.insert("Keep-Alive", "timeout=5".parse().unwrap());

        let forwarded = filter_response_headers(&headers);
        let names: Vec<String> = forwarded.iter().map(|(k, _)| k.to_lowercase()).collect();
        assert_eq!(names, vec!["content-type".to_string()]);
    }
}
