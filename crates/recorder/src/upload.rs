//! Chunk payload transport.
//!
//! A registered chunk is uploaded according to its descriptor:
//!
//! - resumable hint present: initiate an upload session, then one ranged PUT
//!   covering the whole payload (no partial resumption);
//! - otherwise, or if initiation yields no session URL: a direct PUT, or a
//!   multipart POST with a single `file` part.
//!
//! Credentials only travel to the backend's own host and port. Signed
//! storage URLs never see the bearer token.

use crate::backend::Connection;
use crate::error::{RecorderError, Result};
use async_trait::async_trait;
use qaproto::{CompletedChunk, UploadDescriptor};
use reqwest::header::{CONTENT_RANGE, CONTENT_TYPE, LOCATION};
use reqwest::{Method, Url};
use std::collections::BTreeMap;
use std::time::Duration;

#[async_trait]
pub trait ChunkTransport: Send + Sync {
    async fn upload(&self, descriptor: &UploadDescriptor, chunk: &CompletedChunk) -> Result<()>;
}

/// Whether an upload URL is the backend's own origin (host and port).
/// `localhost` and `127.0.0.1` are treated as the same host.
pub fn should_attach_auth(upload_url: &str, api_base: &str) -> bool {
    match (Url::parse(upload_url), Url::parse(api_base)) {
        (Ok(upload), Ok(api)) => {
            let is_local = |host: Option<&str>| matches!(host, Some("localhost" | "127.0.0.1"));
            let host_match = upload.host_str() == api.host_str()
                || (is_local(upload.host_str()) && is_local(api.host_str()));
            host_match && upload.port() == api.port()
        }
        _ => {
            let base = api_base.trim_end_matches('/');
            let origin = base.strip_suffix("/api").unwrap_or(base);
            upload_url.starts_with(origin)
        }
    }
}

fn parse_method(method: &str) -> Result<Method> {
    Method::from_bytes(method.to_ascii_uppercase().as_bytes())
        .map_err(|_| RecorderError::Protocol(format!("invalid upload method {:?}", method)))
}

/// reqwest implementation of [`ChunkTransport`].
pub struct HttpTransport {
    client: reqwest::Client,
    connection: Connection,
}

impl HttpTransport {
    pub fn new(connection: Connection, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, connection })
    }

    fn failed(chunk: &CompletedChunk, message: impl Into<String>) -> RecorderError {
        RecorderError::ChunkUploadFailed {
            index: chunk.index,
            message: message.into(),
        }
    }

    async fn check(
        chunk: &CompletedChunk,
        step: &str,
        response: std::result::Result<reqwest::Response, reqwest::Error>,
    ) -> Result<reqwest::Response> {
        let response = response.map_err(|e| Self::failed(chunk, format!("{}: {}", step, e)))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::failed(
                chunk,
                format!("{} returned {}: {}", step, status.as_u16(), body),
            ));
        }
        Ok(response)
    }

    fn with_headers(
        mut builder: reqwest::RequestBuilder,
        headers: &BTreeMap<String, String>,
    ) -> reqwest::RequestBuilder {
        for (name, value) in headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder
    }

    /// Initiate a resumable session. Returns the session URL if the storage
    /// service issued one.
    async fn start_resumable(
        &self,
        descriptor: &UploadDescriptor,
        chunk: &CompletedChunk,
    ) -> Result<Option<String>> {
        let Some(hint) = descriptor.resumable_start() else {
            return Ok(None);
        };
        let Some(start_url) = hint.start_url.as_deref() else {
            return Ok(None);
        };
        let method = parse_method(hint.start_method.as_deref().unwrap_or("POST"))?;

        let builder = Self::with_headers(self.client.request(method, start_url), &hint.start_headers);
        let response = Self::check(chunk, "resumable start", builder.send().await).await?;

        Ok(response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string))
    }

    async fn put_full_range(&self, session_url: &str, chunk: &CompletedChunk) -> Result<()> {
        let len = chunk.data.len();
        let range = if len == 0 {
            "bytes */0".to_string()
        } else {
            format!("bytes 0-{}/{}", len - 1, len)
        };
        let builder = self
            .client
            .put(session_url)
            .header(CONTENT_TYPE, chunk.mime_type.as_str())
            .header(CONTENT_RANGE, range)
            .body(chunk.data.clone());
        Self::check(chunk, "resumable put", builder.send().await).await?;
        Ok(())
    }

    async fn direct_upload(&self, descriptor: &UploadDescriptor, chunk: &CompletedChunk) -> Result<()> {
        let attach_auth = should_attach_auth(&descriptor.upload_url, &self.connection.api_base());
        let auth_headers = if attach_auth {
            self.connection.auth_headers()
        } else {
            Vec::new()
        };

        let method = parse_method(&descriptor.upload_method)?;
        let builder = if method == Method::PUT {
            let mut builder = Self::with_headers(
                self.client.put(&descriptor.upload_url),
                &descriptor.upload_headers,
            );
            for (name, value) in auth_headers {
                builder = builder.header(name, value);
            }
            builder.body(chunk.data.clone())
        } else {
            let part = reqwest::multipart::Part::bytes(chunk.data.to_vec())
                .file_name(format!("chunk-{}.webm", chrono::Utc::now().timestamp_millis()))
                .mime_str(&chunk.mime_type)
                .map_err(|e| Self::failed(chunk, format!("invalid mime type: {}", e)))?;
            let form = reqwest::multipart::Form::new().part("file", part);
            let mut builder = self.client.request(method, &descriptor.upload_url);
            for (name, value) in auth_headers {
                builder = builder.header(name, value);
            }
            builder.multipart(form)
        };

        Self::check(chunk, "upload", builder.send().await).await?;
        Ok(())
    }
}

#[async_trait]
impl ChunkTransport for HttpTransport {
    #[tracing::instrument(skip_all, fields(chunk.index = chunk.index, bytes = chunk.data.len()))]
    async fn upload(&self, descriptor: &UploadDescriptor, chunk: &CompletedChunk) -> Result<()> {
        if let Some(session_url) = self.start_resumable(descriptor, chunk).await? {
            return self.put_full_range(&session_url, chunk).await;
        }
        self.direct_upload(descriptor, chunk).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use chrono::Utc;
    use qaproto::api::ResumableUpload;
    use qaproto::{DeviceId, SessionId};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn chunk() -> CompletedChunk {
        CompletedChunk {
            session_id: Some(SessionId::from("s1")),
            index: 0,
            start_ts: Utc::now(),
            end_ts: Utc::now(),
            mime_type: "video/webm".into(),
            data: Bytes::from_static(b"QAASSIST"),
            synthetic: false,
        }
    }

    fn descriptor(upload_url: String, upload_method: &str) -> UploadDescriptor {
        UploadDescriptor {
            upload_url,
            upload_method: upload_method.into(),
            upload_headers: BTreeMap::new(),
            resumable: None,
            storage: None,
            gcs_uri: None,
            chunk: None,
        }
    }

    fn transport(api_base: String) -> HttpTransport {
        let connection = Connection::new(api_base, Some("tok".into()));
        connection.set_device_id(Some(DeviceId::from("dev")));
        HttpTransport::new(connection, Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn same_origin_heuristic() {
        let api = "http://localhost:4000/api";
        assert!(should_attach_auth("http://localhost:4000/api/upload/1", api));
        assert!(should_attach_auth("http://127.0.0.1:4000/upload", api));
        assert!(!should_attach_auth("http://localhost:4001/upload", api));
        assert!(!should_attach_auth("https://storage.googleapis.com/b/o?sig=1", api));
        assert!(should_attach_auth(
            "https://qa.example.com/upload",
            "https://qa.example.com/api"
        ));
        // Unparseable base falls back to a prefix check on the origin.
        assert!(should_attach_auth("qa/upload", "qa/api/"));
        assert!(!should_attach_auth("other/upload", "qa/api"));
    }

    #[tokio::test]
    async fn direct_put_to_backend_carries_auth() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/api/upload/1"))
            .and(header("Authorization", "Bearer tok"))
            .and(header("x-device-id", "dev"))
            .and(header("x-extra", "1"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let t = transport(format!("{}/api", server.uri()));
        let mut d = descriptor(format!("{}/api/upload/1", server.uri()), "put");
        d.upload_headers.insert("x-extra".into(), "1".into());
        t.upload(&d, &chunk()).await.unwrap();
    }

    #[tokio::test]
    async fn external_storage_never_sees_token() {
        let api = MockServer::start().await;
        let storage = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/bucket/obj"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&storage)
            .await;

        let t = transport(format!("{}/api", api.uri()));
        t.upload(&descriptor(format!("{}/bucket/obj", storage.uri()), "PUT"), &chunk())
            .await
            .unwrap();

        let requests = storage.received_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        assert!(!requests[0].headers.contains_key("authorization"));
        assert!(!requests[0].headers.contains_key("x-device-id"));
        assert_eq!(&requests[0].body[..], b"QAASSIST");
    }

    #[tokio::test]
    async fn multipart_post_has_file_part() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/sessions/s1/chunks/0/upload"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let t = transport(format!("{}/api", server.uri()));
        t.upload(
            &descriptor(format!("{}/api/sessions/s1/chunks/0/upload", server.uri()), "POST"),
            &chunk(),
        )
        .await
        .unwrap();

        let requests = server.received_requests().await.unwrap();
        let body = String::from_utf8_lossy(&requests[0].body);
        assert!(body.contains("name=\"file\""));
        assert!(body.contains("filename=\"chunk-"));
        assert!(body.contains("QAASSIST"));
        assert!(requests[0].headers.contains_key("authorization"));
    }

    #[tokio::test]
    async fn resumable_upload_puts_whole_range() {
        let storage = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/start"))
            .and(header("x-goog-resumable", "start"))
            .respond_with(
                ResponseTemplate::new(201)
                    .insert_header("Location", format!("{}/session/abc", storage.uri()).as_str()),
            )
            .expect(1)
            .mount(&storage)
            .await;
        Mock::given(method("PUT"))
            .and(path("/session/abc"))
            .and(header("Content-Range", "bytes 0-7/8"))
            .and(header("Content-Type", "video/webm"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&storage)
            .await;

        let t = transport("http://localhost:1/api".into());
        let mut d = descriptor(format!("{}/unused", storage.uri()), "PUT");
        let mut start_headers = BTreeMap::new();
        start_headers.insert("x-goog-resumable".to_string(), "start".to_string());
        d.resumable = Some(ResumableUpload {
            start_url: Some(format!("{}/start", storage.uri())),
            start_method: None,
            start_headers,
        });
        t.upload(&d, &chunk()).await.unwrap();
    }

    #[tokio::test]
    async fn resumable_without_location_falls_back_to_direct() {
        let storage = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/start"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&storage)
            .await;
        Mock::given(method("PUT"))
            .and(path("/direct"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&storage)
            .await;

        let t = transport("http://localhost:1/api".into());
        let mut d = descriptor(format!("{}/direct", storage.uri()), "PUT");
        d.resumable = Some(ResumableUpload {
            start_url: Some(format!("{}/start", storage.uri())),
            ..Default::default()
        });
        t.upload(&d, &chunk()).await.unwrap();
    }

    #[tokio::test]
    async fn failed_upload_is_chunk_upload_failed() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let t = transport("http://localhost:1/api".into());
        let err = t
            .upload(&descriptor(format!("{}/x", server.uri()), "PUT"), &chunk())
            .await
            .unwrap_err();
        assert!(matches!(err, RecorderError::ChunkUploadFailed { index: 0, .. }));
    }
}
