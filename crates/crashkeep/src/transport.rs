//! HTTP upload transport: `POST`s the record body to a collector URL.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use crashkeep_core::error::TransportError;
use crashkeep_core::upload::{UploadFailure, UploadSuccess, UploadTransport};
use reqwest::header::CONTENT_TYPE;

/// Header carrying the record file name.
pub const RECORD_NAME_HEADER: &str = "x-crash-record";

pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
    runtime: tokio::runtime::Runtime,
}

impl HttpTransport {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("failed to start HTTP runtime")?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("crashkeep/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            runtime,
        })
    }

    async fn post(&self, record: &Path) -> Result<(), TransportError> {
        let body = tokio::fs::read(record)
            .await
            .map_err(|source| TransportError::Read {
                path: record.to_path_buf(),
                source,
            })?;
        let name = record
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let response = self
            .client
            .post(&self.endpoint)
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .header(RECORD_NAME_HEADER, name)
            .body(body)
            .send()
            .await
            .map_err(|e| TransportError::Other(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(TransportError::Rejected {
                path: record.to_path_buf(),
                reason: format!("HTTP {status}"),
            })
        }
    }
}

impl UploadTransport for HttpTransport {
    fn upload(&self, record: &Path, on_success: UploadSuccess, on_failure: UploadFailure) {
        tracing::debug!(path = %record.display(), endpoint = %self.endpoint, "Posting crash record");
        match self.runtime.block_on(self.post(record)) {
            Ok(()) => on_success(),
            Err(err) => on_failure(err),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_server {
    //! Minimal one-shot-per-connection HTTP responder.

    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone)]
    pub struct Received {
        pub record_name: Option<String>,
        pub body: Vec<u8>,
    }

    /// Serve `statuses` in order, one per connection. Returns the URL and the
    /// requests seen so far.
    pub fn spawn(statuses: Vec<u16>) -> (String, Arc<Mutex<Vec<Received>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/crashes", listener.local_addr().unwrap());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        std::thread::spawn(move || {
            for status in statuses {
                let Ok((stream, _)) = listener.accept() else {
                    return;
                };
                let mut reader = BufReader::new(stream);
                let mut content_length = 0usize;
                let mut record_name = None;
                loop {
                    let mut line = String::new();
                    if reader.read_line(&mut line).unwrap_or(0) == 0 || line == "\r\n" {
                        break;
                    }
                    let lower = line.to_ascii_lowercase();
                    if let Some(v) = lower.strip_prefix("content-length:") {
                        content_length = v.trim().parse().unwrap_or(0);
                    }
                    if lower.starts_with("x-crash-record:") {
                        record_name = line.split_once(':').map(|(_, v)| v.trim().to_string());
                    }
                }
                let mut body = vec![0; content_length];
                reader.read_exact(&mut body).unwrap();
                log.lock().unwrap().push(Received { record_name, body });

                let mut stream = reader.into_inner();
                let _ = write!(
                    stream,
                    "HTTP/1.1 {status} X\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
                );
            }
        });
        (url, seen)
    }
}
