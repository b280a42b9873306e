// Copyright 2024 Cirrus Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The GOCACHEPROG frame format. One JSON request per line; when a request
//! carries a body (`put` with `BodySize > 0`), the next line is a JSON string
//! whose contents are the base64-encoded body bytes. Field names follow the
//! Go struct tags, so byte slices are base64 strings and the empty fields are
//! omitted.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
pub struct Request {
    #[serde(rename = "ID", default)]
    pub id: u64,

    #[serde(rename = "Command", default)]
    pub command: String,

    /// Base64 of the action id bytes.
    #[serde(rename = "ActionID", default)]
    pub action_id: Option<String>,

    /// Base64 of the output id bytes.
    #[serde(rename = "OutputID", default)]
    pub output_id: Option<String>,

    #[serde(rename = "BodySize", default)]
    pub body_size: i64,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct Response {
    #[serde(rename = "ID")]
    pub id: u64,

    #[serde(rename = "Err", skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,

    #[serde(rename = "KnownCommands", skip_serializing_if = "Option::is_none")]
    pub known_commands: Option<Vec<String>>,

    #[serde(rename = "Miss", skip_serializing_if = "Option::is_none")]
    pub miss: Option<bool>,

    #[serde(rename = "OutputID", skip_serializing_if = "Option::is_none")]
    pub output_id: Option<String>,

    #[serde(rename = "Size", skip_serializing_if = "Option::is_none")]
    pub size: Option<i64>,

    #[serde(rename = "Time", skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,

    #[serde(rename = "DiskPath", skip_serializing_if = "Option::is_none")]
    pub disk_path: Option<String>,
}

impl Response {
    pub fn capabilities() -> Self {
        Response {
            id: 0,
            known_commands: Some(vec![
                "get".to_owned(),
                "put".to_owned(),
                "close".to_owned(),
            ]),
            ..Response::default()
        }
    }

    pub fn error(id: u64, message: impl Into<String>) -> Self {
        Response {
            id,
            err: Some(message.into()),
            ..Response::default()
        }
    }
}

/// Read the next request line. `Ok(None)` means stdin closed.
pub async fn read_request<R>(reader: &mut BufReader<R>) -> Result<Option<Request>, String>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        let read = reader
            .read_line(&mut line)
            .await
            .map_err(|err| format!("read request: {err}"))?;
        if read == 0 {
            return Ok(None);
        }
        if line.trim().is_empty() {
            continue;
        }
        let request: Request = serde_json::from_str(line.trim())
            .map_err(|err| format!("malformed request {line:?}: {err}"))?;
        return Ok(Some(request));
    }
}

/// Read a body frame: a line holding a JSON string of base64 bytes,
/// terminated by the newline after the closing quote.
pub async fn read_body<R>(reader: &mut BufReader<R>, body_size: i64) -> Result<Bytes, String>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = String::new();
    let read = reader
        .read_line(&mut line)
        .await
        .map_err(|err| format!("read body: {err}"))?;
    if read == 0 {
        return Err("stdin closed mid-body".to_owned());
    }

    let encoded: String = serde_json::from_str(line.trim())
        .map_err(|err| format!("malformed body frame: {err}"))?;
    let body = base64::decode(&encoded).map_err(|err| format!("body is not base64: {err}"))?;
    if body.len() as i64 != body_size {
        return Err(format!(
            "body size mismatch: declared {body_size}, got {}",
            body.len()
        ));
    }
    Ok(Bytes::from(body))
}

pub async fn write_response<W>(writer: &mut W, response: &Response) -> Result<(), String>
where
    W: AsyncWrite + Unpin,
{
    let mut line =
        serde_json::to_vec(response).map_err(|err| format!("encode response: {err}"))?;
    line.push(b'\n');
    writer
        .write_all(&line)
        .await
        .map_err(|err| format!("write response: {err}"))?;
    writer
        .flush()
        .await
        .map_err(|err| format!("flush response: {err}"))
}

pub fn decode_id(field: &str, value: Option<&String>) -> Result<Vec<u8>, String> {
    let value = value.ok_or_else(|| format!("missing {field}"))?;
    base64::decode(value).map_err(|err| format!("{field} is not base64: {err}"))
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tokio::io::BufReader;

    use super::{read_body, read_request, write_response, Response};

    #[tokio::test]
    async fn parses_requests_and_body_frames() {
        let input = format!(
            "{}\n{}\n{}\n",
            r#"{"ID":1,"Command":"put","ActionID":"YWN0aW9u","OutputID":"b3V0","BodySize":5}"#,
            serde_json::to_string(&base64::encode(b"hello")).unwrap(),
            r#"{"ID":2,"Command":"close"}"#,
        );
        let mut reader = BufReader::new(input.as_bytes());

        let request = read_request(&mut reader).await.unwrap().unwrap();
        assert_eq!(request.id, 1);
        assert_eq!(request.command, "put");
        assert_eq!(request.body_size, 5);
        assert_eq!(
            base64::decode(request.action_id.as_ref().unwrap()).unwrap(),
            b"action"
        );

        let body = read_body(&mut reader, request.body_size).await.unwrap();
        assert_eq!(body, Bytes::from_static(b"hello"));

        let request = read_request(&mut reader).await.unwrap().unwrap();
        assert_eq!(request.command, "close");

        assert!(read_request(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn body_size_mismatch_is_an_error() {
        let input = format!("{}\n", serde_json::to_string(&base64::encode(b"hello")).unwrap());
        let mut reader = BufReader::new(input.as_bytes());
        read_body(&mut reader, 99).await.unwrap_err();
    }

    #[tokio::test]
    async fn responses_use_go_field_names_and_omit_empty() {
        let mut out = Vec::new();
        write_response(&mut out, &Response::capabilities()).await.unwrap();
        let line = String::from_utf8(out).unwrap();
        assert_eq!(
            line,
            "{\"ID\":0,\"KnownCommands\":[\"get\",\"put\",\"close\"]}\n"
        );

        let mut out = Vec::new();
        write_response(
            &mut out,
            &Response {
                id: 7,
                miss: Some(true),
                ..Response::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "{\"ID\":7,\"Miss\":true}\n");
    }
}
