//! Minimal HTTP/1.1 service bound to a local pipe.
//!
//! Answers every `GET` with a fixed HTML page; anything else gets
//! `501 Not Implemented`.

use std::convert::Infallible;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::UnixListener;
use tracing::{debug, info};

use crate::error::Result;

pub const HELLO_BODY: &str = "<html><body>Hello</body></html>";

pub fn hello_response() -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(HELLO_BODY.as_bytes())));
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/html"));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(HELLO_BODY.len()));
    response
}

async fn handle(req: Request<Incoming>) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
    debug!("{} {}", req.method(), req.uri());

    if req.method() == Method::GET {
        return Ok(hello_response());
    }

    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = StatusCode::NOT_IMPLEMENTED;
    response
        .headers_mut()
        .insert(CONTENT_LENGTH, HeaderValue::from(0usize));
    Ok(response)
}

/// HTTP server on a Unix socket. The socket file is removed on drop.
pub struct HelloServer {
    listener: UnixListener,
    path: PathBuf,
}

impl HelloServer {
    /// Bind before anything is forwarded to `path`, so no connection can
    /// arrive ahead of the listener.
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let listener = UnixListener::bind(&path)?;
        info!("HTTP server listening on {}", path.display());
        Ok(Self { listener, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serve until the listener fails
    pub async fn run(self) -> Result<()> {
        loop {
            let (stream, _) = self.listener.accept().await?;
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                if let Err(e) = http1::Builder::new()
                    .serve_connection(io, service_fn(handle))
                    .await
                {
                    debug!("HTTP connection error: {}", e);
                }
            });
        }
    }
}

impl Drop for HelloServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::UnixStream;

    async fn raw_request(path: &Path, request: &str) -> String {
        let mut stream = UnixStream::connect(path).await.unwrap();
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        String::from_utf8(response).unwrap()
    }

    #[test]
    fn test_hello_response_headers() {
        let response = hello_response();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], "text/html");
        assert_eq!(response.headers()[CONTENT_LENGTH], "31");
        assert_eq!(HELLO_BODY.len(), 31);
    }

    #[tokio::test]
    async fn test_get_over_pipe() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.sock");
        let server = HelloServer::bind(&path).unwrap();
        let task = tokio::spawn(server.run());

        let response = raw_request(
            &path,
            "GET /any/path?x=1 HTTP/1.1\r\nHost: local\r\nConnection: close\r\n\r\n",
        )
        .await;

        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.contains("content-type: text/html\r\n"));
        assert!(response.contains("content-length: 31\r\n"));
        assert!(response.ends_with("\r\n\r\n<html><body>Hello</body></html>"));

        task.abort();
    }

    #[tokio::test]
    async fn test_post_not_implemented() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.sock");
        let server = HelloServer::bind(&path).unwrap();
        let task = tokio::spawn(server.run());

        let response = raw_request(
            &path,
            "POST / HTTP/1.1\r\nHost: local\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await;

        assert!(response.starts_with("HTTP/1.1 501 Not Implemented\r\n"));
        task.abort();
    }

    #[tokio::test]
    async fn test_socket_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.sock");

        let server = HelloServer::bind(&path).unwrap();
        assert!(path.exists());
        drop(server);
        assert!(!path.exists());
    }
}
