//! Wire codec for the tunnel transport.
//!
//! Frames are self-describing MessagePack maps with a string `type`
//! discriminator. `rmpv::Value` is used as the intermediate representation
//! because it keeps `Str` and `Bin` distinct, which is the property the
//! framing depends on: `body`/`data` must never be coerced into text.
//!
//! The one-time `welcome` handshake message is not one of these frames: the
//! server sends it as a plain JSON *text* websocket message before any
//! MessagePack framing begins, so it gets its own parser below instead of a
//! `Frame` variant.

use rmpv::Value;

use crate::error::FrameError;

/// An ordered header list. A `Vec` (rather than a map) preserves duplicate
/// header names and arrival order, matching what an HTTP library actually
/// hands back.
pub type Headers = Vec<(String, String)>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    HttpRequest {
        request_id: String,
        method: String,
        path: String,
        query_string: String,
        headers: Headers,
        body: Vec<u8>,
    },
    HttpResponse {
        request_id: String,
        status: u16,
        headers: Headers,
        body: Vec<u8>,
    },
    WsOpen {
        ws_id: String,
        path: String,
        query_string: String,
    },
    WsData {
        ws_id: String,
        data: Vec<u8>,
        is_text: bool,
    },
    WsClose {
        ws_id: String,
    },
}

/// The server's one-shot JSON handshake message. A non-empty `error` means
/// the server rejected the connection and it must not be retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Welcome {
    pub url: Option<String>,
    pub error: Option<String>,
}

impl Welcome {
    pub fn parse(text: &str) -> Result<Welcome, FrameError> {
        let value: serde_json::Value = serde_json::from_str(text)
            .map_err(|err| FrameError::Malformed(format!("welcome is not valid json: {err}")))?;

        let url = value
            .get("url")
            .and_then(serde_json::Value::as_str)
            .map(str::to_owned);
        let error = value
            .get("error")
            .and_then(serde_json::Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_owned);

        Ok(Welcome { url, error })
    }
}

impl Frame {
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let value = self.to_value();
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &value)
            .map_err(|err| FrameError::Encode(std::io::Error::other(err.to_string())))?;
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Frame, FrameError> {
        let mut cursor = bytes;
        let value = rmpv::decode::read_value(&mut cursor)?;
        Frame::from_value(&value)
    }

    fn to_value(&self) -> Value {
        match self {
            Frame::HttpRequest {
                request_id,
                method,
                path,
                query_string,
                headers,
                body,
            } => map(vec![
                ("type", str_val("http_request")),
                ("request_id", str_val(request_id)),
                ("method", str_val(method)),
                ("path", str_val(path)),
                ("query_string", str_val(query_string)),
                ("headers", headers_val(headers)),
                ("body", Value::Binary(body.clone())),
            ]),
            Frame::HttpResponse {
                request_id,
                status,
                headers,
                body,
            } => map(vec![
                ("type", str_val("http_response")),
                ("request_id", str_val(request_id)),
                ("status", Value::from(*status as i64)),
                ("headers", headers_val(headers)),
                ("body", Value::Binary(body.clone())),
            ]),
            Frame::WsOpen {
                ws_id,
                path,
                query_string,
            } => map(vec![
                ("type", str_val("ws_open")),
                ("ws_id", str_val(ws_id)),
                ("path", str_val(path)),
                ("query_string", str_val(query_string)),
            ]),
            Frame::WsData {
                ws_id,
                data,
                is_text,
            } => map(vec![
                ("type", str_val("ws_data")),
                ("ws_id", str_val(ws_id)),
                ("data", Value::Binary(data.clone())),
                ("is_text", Value::Boolean(*is_text)),
            ]),
            Frame::WsClose { ws_id } => map(vec![
                ("type", str_val("ws_close")),
                ("ws_id", str_val(ws_id)),
            ]),
        }
    }

    fn from_value(value: &Value) -> Result<Frame, FrameError> {
        let fields = value
            .as_map()
            .ok_or_else(|| FrameError::Malformed("frame is not a map".into()))?;

        let type_name = lookup(fields, "type")
            .and_then(Value::as_str)
            .ok_or_else(|| FrameError::Malformed("frame has no string `type`".into()))?;

        let frame = match type_name {
            "http_request" => Frame::HttpRequest {
                request_id: field_str(fields, "request_id", ""),
                method: field_str(fields, "method", "GET"),
                path: field_str(fields, "path", "/"),
                query_string: field_str(fields, "query_string", ""),
                headers: field_headers(fields, "headers"),
                body: field_bytes(fields, "body"),
            },
            "http_response" => Frame::HttpResponse {
                request_id: field_str(fields, "request_id", ""),
                status: field_int(fields, "status", 200) as u16,
                headers: field_headers(fields, "headers"),
                body: field_bytes(fields, "body"),
            },
            "ws_open" => Frame::WsOpen {
                ws_id: field_str(fields, "ws_id", ""),
                path: field_str(fields, "path", "/"),
                query_string: field_str(fields, "query_string", ""),
            },
            "ws_data" => Frame::WsData {
                ws_id: field_str(fields, "ws_id", ""),
                data: field_bytes(fields, "data"),
                is_text: field_bool(fields, "is_text", false),
            },
            "ws_close" => Frame::WsClose {
                ws_id: field_str(fields, "ws_id", ""),
            },
            other => {
                return Err(FrameError::Malformed(format!("unknown frame type `{other}`")))
            }
        };

        Ok(frame)
    }
}

fn map(fields: Vec<(&str, Value)>) -> Value {
    Value::Map(
        fields
            .into_iter()
            .map(|(k, v)| (Value::from(k), v))
            .collect(),
    )
}

fn str_val(s: &str) -> Value {
    Value::from(s)
}

fn headers_val(headers: &Headers) -> Value {
    Value::Map(
        headers
            .iter()
            .map(|(k, v)| (Value::from(k.as_str()), Value::from(v.as_str())))
            .collect(),
    )
}

fn lookup<'a>(fields: &'a [(Value, Value)], key: &str) -> Option<&'a Value> {
    fields
        .iter()
        .find(|(k, _)| k.as_str() == Some(key))
        .map(|(_, v)| v)
}

fn field_str(fields: &[(Value, Value)], key: &str, default: &str) -> String {
    lookup(fields, key)
        .and_then(Value::as_str)
        .unwrap_or(default)
        .to_owned()
}

fn field_int(fields: &[(Value, Value)], key: &str, default: i64) -> i64 {
    lookup(fields, key)
        .and_then(Value::as_i64)
        .unwrap_or(default)
}

fn field_bool(fields: &[(Value, Value)], key: &str, default: bool) -> bool {
    lookup(fields, key).and_then(Value::as_bool).unwrap_or(default)
}

fn field_bytes(fields: &[(Value, Value)], key: &str) -> Vec<u8> {
    match lookup(fields, key) {
        Some(v) => v
            .as_slice()
            .map(|b| b.to_vec())
            .or_else(|| v.as_str().map(|s| s.as_bytes().to_vec()))
            .unwrap_or_default(),
        None => Vec::new(),
    }
}

fn field_headers(fields: &[(Value, Value)], key: &str) -> Headers {
    match lookup(fields, key).and_then(Value::as_map) {
        Some(pairs) => pairs
            .iter()
            .filter_map(|(k, v)| Some((k.as_str()?.to_owned(), v.as_str()?.to_owned())))
            .collect(),
        None => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_http_request() {
        let frame = Frame::HttpRequest {
            request_id: "r1".into(),
            method: "GET".into(),
            path: "/api/states".into(),
            query_string: "".into(),
            headers: vec![("Authorization".into(), "Bearer x".into())],
            body: b"hello".to_vec(),
        };
        let bytes = frame.encode().unwrap();
        assert_eq!(Frame::decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn round_trips_http_response_with_binary_body() {
        let frame = Frame::HttpResponse {
            request_id: "r2".into(),
            status: 200,
            headers: vec![("Content-Type".into(), "application/json".into())],
            body: vec![0x00, 0x01, 0xff, 0x80],
        };
        let bytes = frame.encode().unwrap();
        let decoded = Frame::decode(&bytes).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn round_trips_ws_variants() {
        for frame in [
            Frame::WsOpen {
                ws_id: "w1".into(),
                path: "/api/websocket".into(),
                query_string: "".into(),
            },
            Frame::WsData {
                ws_id: "w1".into(),
                data: b"hello".to_vec(),
                is_text: true,
            },
            Frame::WsData {
                ws_id: "w1".into(),
                data: vec![0x01, 0x02],
                is_text: false,
            },
            Frame::WsClose {
                ws_id: "w1".into(),
            },
        ] {
            let bytes = frame.encode().unwrap();
            assert_eq!(Frame::decode(&bytes).unwrap(), frame);
        }
    }

    #[test]
    fn parses_welcome_json_with_url_and_no_error() {
        let welcome = Welcome::parse(r#"{"url":"https://example.cloud/abc"}"#).unwrap();
        assert_eq!(welcome.url.as_deref(), Some("https://example.cloud/abc"));
        assert_eq!(welcome.error, None);
    }

    #[test]
    fn parses_welcome_json_with_rejection_error() {
        let welcome = Welcome::parse(r#"{"error":"invalid token"}"#).unwrap();
        assert_eq!(welcome.error.as_deref(), Some("invalid token"));
    }

    #[test]
    fn welcome_with_empty_error_string_is_not_a_rejection() {
        let welcome = Welcome::parse(r#"{"url":"https://example.cloud/abc","error":""}"#).unwrap();
        assert_eq!(welcome.error, None);
    }

    #[test]
    fn malformed_welcome_json_is_an_error() {
        assert!(Welcome::parse("not json").is_err());
    }

    #[test]
    fn missing_fields_use_documented_defaults() {
        let value = Value::Map(vec![
            (Value::from("type"), Value::from("http_request")),
            (Value::from("request_id"), Value::from("r1")),
        ]);
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &value).unwrap();

        let frame = Frame::decode(&buf).unwrap();
        assert_eq!(
            frame,
            Frame::HttpRequest {
                request_id: "r1".into(),
                method: "GET".into(),
                path: "/".into(),
                query_string: "".into(),
                headers: Vec::new(),
                body: Vec::new(),
            }
        );
    }

    #[test]
    fn unknown_top_level_keys_are_ignored() {
        let value = Value::Map(vec![
            (Value::from("type"), Value::from("ws_close")),
            (Value::from("ws_id"), Value::from("w9")),
            (Value::from("extra_future_field"), Value::from(42)),
        ]);
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &value).unwrap();

        let frame = Frame::decode(&buf).unwrap();
        assert_eq!(
            frame,
            Frame::WsClose {
                ws_id: "w9".into()
            }
        );
    }

    #[test]
    fn non_map_payload_is_malformed() {
        let value = Value::Array(vec![Value::from(1), Value::from(2)]);
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &value).unwrap();

        assert!(matches!(
            Frame::decode(&buf),
            Err(FrameError::Malformed(_))
        ));
    }

    #[test]
    fn missing_type_is_malformed() {
        let value = Value::Map(vec![(Value::from("ws_id"), Value::from("w1"))]);
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &value).unwrap();

        assert!(matches!(
            Frame::decode(&buf),
            Err(FrameError::Malformed(_))
        ));
    }
}
