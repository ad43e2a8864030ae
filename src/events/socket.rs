use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

use super::{Event, Transport};
use crate::error::{AppError, Result};

/// Upper bound on one datagram write.
const SEND_TIMEOUT: Duration = Duration::from_millis(500);

/// Delivers each event as one JSON line to a local datagram socket.
///
/// At-most-once: when nothing is bound to the socket path the event is
/// dropped without error.
pub struct SocketTransport {
    path: PathBuf,
}

impl SocketTransport {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    #[cfg(unix)]
    async fn send_line(&self, line: &str) -> Result<bool> {
        use std::io::ErrorKind;

        use tokio::net::UnixDatagram;

        let socket = UnixDatagram::unbound()
            .map_err(|e| AppError::transport(format!("Failed to open datagram socket: {}", e)))?;

        match tokio::time::timeout(SEND_TIMEOUT, socket.send_to(line.as_bytes(), &self.path)).await
        {
            Ok(Ok(_)) => Ok(true),
            Ok(Err(e))
                if matches!(
                    e.kind(),
                    ErrorKind::NotFound | ErrorKind::ConnectionRefused
                ) =>
            {
                Ok(false)
            }
            Ok(Err(e)) => Err(AppError::transport(format!(
                "Failed to write to {:?}: {}",
                self.path, e
            ))),
            Err(_) => Err(AppError::transport(format!(
                "Timed out writing to {:?}",
                self.path
            ))),
        }
    }

    #[cfg(not(unix))]
    #[allow(clippy::unused_async, clippy::unnecessary_wraps)]
    async fn send_line(&self, _line: &str) -> Result<bool> {
        Ok(false)
    }
}

#[async_trait]
impl Transport for SocketTransport {
    fn name(&self) -> &'static str {
        "socket"
    }

    async fn send(&self, event: &Event) -> Result<()> {
        let mut line = event.to_json()?;
        line.push('\n');
        if !self.send_line(&line).await? {
            log::debug!("No listener on {:?}, event dropped", self.path);
        }
        Ok(())
    }

    /// Unlike `send`, a missing listener is a reported failure here.
    async fn test(&self) -> Result<()> {
        let mut line = Event::test().to_json()?;
        line.push('\n');
        if self.send_line(&line).await? {
            Ok(())
        } else {
            Err(AppError::transport(format!(
                "No listener attached to {}",
                self.path.display()
            )))
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use tokio::net::UnixDatagram;

    use super::*;
    use crate::events::EventKind;

    #[tokio::test]
    async fn delivers_json_line_to_listener() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("events.sock");
        let listener = UnixDatagram::bind(&path).unwrap();

        let transport = SocketTransport::new(&path);
        let event = Event::new(
            EventKind::InstanceBackupCreated,
            "srv",
            crate::events::payload([("backup", "srv-1.0-20240101_000000.backup")]),
        );
        transport.send(&event).await.unwrap();

        let mut buf = vec![0u8; 4096];
        let n = listener.recv(&mut buf).await.unwrap();
        let line = std::str::from_utf8(&buf[..n]).unwrap();
        assert!(line.ends_with('\n'));
        let value: serde_json::Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(value["event"], "instance_backup_created");
        assert_eq!(value["instance"], "srv");
    }

    #[tokio::test]
    async fn missing_listener_is_silently_dropped() {
        let tmp = tempfile::tempdir().unwrap();
        let transport = SocketTransport::new(tmp.path().join("nobody.sock"));
        let event = Event::new(EventKind::InstanceStarted, "srv", Default::default());

        assert!(transport.send(&event).await.is_ok());
        assert_eq!(
            transport.test().await.unwrap_err().kind(),
            crate::error::ErrorKind::Transport
        );
    }
}
