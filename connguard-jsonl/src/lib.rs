//! JSONL audit sink for `connguard`. Writes one throttle event per line.
//! Always writes; bring your own path.

use connguard::telemetry::{TelemetrySink, ThrottleEvent};
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};

#[derive(Clone, Debug)]
pub struct JsonlSink {
    path: PathBuf,
}

impl JsonlSink {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl tower_service::Service<ThrottleEvent> for JsonlSink {
    type Response = ();
    type Error = io::Error;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: ThrottleEvent) -> Self::Future {
        let path = self.path.clone();
        let line = serde_json::to_string(&event).map(|mut line| {
            line.push('\n');
            line
        });
        Box::pin(async move {
            use tokio::io::AsyncWriteExt;
            let line = line.map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            let mut file =
                tokio::fs::OpenOptions::new().create(true).append(true).open(&path).await?;
            file.write_all(line.as_bytes()).await?;
            file.flush().await.map_err(|e| {
                tracing::warn!(path = %path.display(), error = %e, "audit line not flushed");
                e
            })
        })
    }
}

impl TelemetrySink for JsonlSink {
    type SinkError = io::Error;
}
