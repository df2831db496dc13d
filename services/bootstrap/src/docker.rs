//! Nested daemon Engine API client over its Unix socket.
//!
//! Only what the image loader needs: `GET /_ping` for readiness and
//! `POST /images/load` to import a tarball.
//!
//! Reference: https://docs.docker.com/reference/api/engine/

use std::path::Path;

use async_trait::async_trait;
use hyper::{Body, Client, Method, Request};
use hyperlocal::{UnixClientExt, UnixConnector, Uri};
use serde::Deserialize;
use thiserror::Error;
use tokio_util::io::ReaderStream;
use tracing::debug;

/// Errors from the Engine API.
#[derive(Debug, Error)]
pub enum DockerError {
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("request error: {0}")]
    Request(#[from] hyper::http::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("daemon not ready: {0}")]
    NotReady(String),

    #[error("load failed: {0}")]
    Load(String),
}

/// Operations the loader needs from the daemon.
#[async_trait]
pub trait DaemonApi: Send + Sync {
    /// Succeeds once the daemon answers API requests.
    async fn ping(&self) -> Result<(), DockerError>;

    /// Import an image tarball. Returns the image names the daemon reported.
    async fn load_image(&self, tarball: &Path) -> Result<Vec<String>, DockerError>;
}

/// Engine API client for the nested daemon socket.
pub struct DockerClient {
    socket_path: String,
    client: Client<UnixConnector>,
}

impl DockerClient {
    pub fn new<P: AsRef<Path>>(socket_path: P) -> Self {
        let socket_path = socket_path.as_ref().to_string_lossy().to_string();
        let client = Client::unix();
        Self {
            socket_path,
            client,
        }
    }

    async fn body_text(response: hyper::Response<Body>) -> Result<String, DockerError> {
        let body = hyper::body::to_bytes(response.into_body()).await?;
        Ok(String::from_utf8_lossy(&body).into_owned())
    }
}

#[async_trait]
impl DaemonApi for DockerClient {
    async fn ping(&self) -> Result<(), DockerError> {
        let request = Request::builder()
            .method(Method::GET)
            .uri(Uri::new(&self.socket_path, "/_ping"))
            .body(Body::empty())?;

        let response = self.client.request(request).await?;
        let status = response.status();
        let text = Self::body_text(response).await?;

        if status.is_success() && text.trim() == "OK" {
            Ok(())
        } else {
            Err(DockerError::NotReady(format!("/_ping returned {status}: {}", text.trim())))
        }
    }

    async fn load_image(&self, tarball: &Path) -> Result<Vec<String>, DockerError> {
        let file = tokio::fs::File::open(tarball).await?;
        let length = file.metadata().await?.len();
        let body = Body::wrap_stream(ReaderStream::new(file));

        debug!(path = %tarball.display(), bytes = length, "POST /images/load");

        let request = Request::builder()
            .method(Method::POST)
            .uri(Uri::new(&self.socket_path, "/images/load?quiet=1"))
            .header("Content-Type", "application/x-tar")
            .header("Content-Length", length)
            .body(body)?;

        let response = self.client.request(request).await?;
        let status = response.status();
        let text = Self::body_text(response).await?;

        if !status.is_success() {
            return Err(DockerError::Api {
                status: status.as_u16(),
                message: api_message(&text),
            });
        }

        parse_load_response(&text).map_err(DockerError::Load)
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: String,
}

fn api_message(body: &str) -> String {
    serde_json::from_str::<ApiErrorBody>(body)
        .map(|e| e.message)
        .unwrap_or_else(|_| body.trim().to_string())
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    message: String,
}

/// One line of the load progress stream.
#[derive(Debug, Deserialize)]
struct LoadMessage {
    #[serde(default)]
    stream: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default, rename = "errorDetail")]
    error_detail: Option<ErrorDetail>,
}

/// Parse the JSON-lines body of `POST /images/load`.
///
/// The daemon answers 200 even when the import fails part-way; the failure
/// is reported as an `errorDetail` line. Returns the loaded image names.
pub fn parse_load_response(body: &str) -> Result<Vec<String>, String> {
    let mut loaded = Vec::new();

    for line in body.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let Ok(message) = serde_json::from_str::<LoadMessage>(line) else {
            continue;
        };

        if let Some(detail) = message.error_detail.filter(|d| !d.message.is_empty()) {
            return Err(detail.message);
        }
        if let Some(error) = message.error {
            return Err(error);
        }

        if let Some(stream) = message.stream {
            let stream = stream.trim();
            if let Some(name) = stream
                .strip_prefix("Loaded image: ")
                .or_else(|| stream.strip_prefix("Loaded image ID: "))
            {
                loaded.push(name.to_string());
            }
        }
    }

    Ok(loaded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_loaded_images() {
        let body = concat!(
            "{\"stream\":\"Loaded image: kong:2.8.1\\n\"}\r\n",
            "{\"stream\":\"Loaded image ID: sha256:abc\\n\"}\r\n",
        );
        assert_eq!(
            parse_load_response(body).unwrap(),
            vec!["kong:2.8.1".to_string(), "sha256:abc".to_string()]
        );
    }

    #[test]
    fn test_parse_error_detail() {
        let body = concat!(
            "{\"errorDetail\":{\"message\":\"unexpected EOF\"},\"error\":\"unexpected EOF\"}\n"
        );
        assert_eq!(parse_load_response(body).unwrap_err(), "unexpected EOF");
    }

    #[test]
    fn test_parse_ignores_noise() {
        assert_eq!(parse_load_response("").unwrap(), Vec::<String>::new());
        assert_eq!(parse_load_response("not json\n").unwrap(), Vec::<String>::new());
    }

    #[test]
    fn test_api_message() {
        assert_eq!(
            api_message(r#"{"message":"invalid tar header"}"#),
            "invalid tar header"
        );
        assert_eq!(api_message("plain text\n"), "plain text");
    }
}
