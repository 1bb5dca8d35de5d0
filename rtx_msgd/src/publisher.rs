//! Topic publisher for live subscribers.
//!
//! A subscriber connects to the unix socket and sends one line holding a
//! topic prefix (an empty line subscribes to everything). It then receives
//! every record whose `"<origin>.<tag>"` topic starts with that prefix, one
//! JSON object per line. Slow subscribers lose records instead of stalling
//! the daemon.

use crate::error::DaemonResult;
use parking_lot::Mutex;
use rtx_shared_memory::LogRecord;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const SUBSCRIBER_QUEUE: usize = 256;

struct Subscriber {
    prefix: String,
    tx: mpsc::Sender<Arc<str>>,
}

#[derive(Serialize)]
struct Published<'a> {
    topic: &'a str,
    #[serde(flatten)]
    record: &'a LogRecord,
}

/// Publishes records to socket subscribers.
pub struct Publisher {
    path: PathBuf,
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
    acceptor: JoinHandle<()>,
    dropped: u64,
}

impl Publisher {
    /// Listen on `path`, replacing a stale socket file. Needs a tokio runtime.
    pub fn bind(path: &Path) -> DaemonResult<Self> {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        let listener = UnixListener::bind(path)?;
        let subscribers = Arc::new(Mutex::new(Vec::new()));
        let acceptor = tokio::spawn(accept_loop(listener, Arc::clone(&subscribers)));
        info!("Publishing messages on {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            subscribers,
            acceptor,
            dropped: 0,
        })
    }

    /// Connected subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Records lost to full subscriber queues.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Queue `record` for every matching subscriber. Returns how many got it.
    pub fn publish(&mut self, record: &LogRecord) -> DaemonResult<usize> {
        let topic = record.topic();
        let mut line: Option<Arc<str>> = None;
        let mut delivered = 0;

        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|s| !s.tx.is_closed());
        for sub in subscribers.iter().filter(|s| topic.starts_with(&s.prefix)) {
            let text = match &line {
                Some(text) => Arc::clone(text),
                None => {
                    let mut json = serde_json::to_string(&Published {
                        topic: &topic,
                        record,
                    })?;
                    json.push('\n');
                    let text: Arc<str> = json.into();
                    line = Some(Arc::clone(&text));
                    text
                }
            };
            match sub.tx.try_send(text) {
                Ok(()) => delivered += 1,
                Err(_) => self.dropped += 1,
            }
        }
        Ok(delivered)
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        self.acceptor.abort();
        let _ = std::fs::remove_file(&self.path);
    }
}

async fn accept_loop(listener: UnixListener, subscribers: Arc<Mutex<Vec<Subscriber>>>) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                tokio::spawn(serve_subscriber(stream, Arc::clone(&subscribers)));
            }
            Err(e) => {
                warn!("Publisher accept failed: {}", e);
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    }
}

async fn serve_subscriber(stream: UnixStream, subscribers: Arc<Mutex<Vec<Subscriber>>>) {
    let (read, mut write) = stream.into_split();
    let prefix = match BufReader::new(read).lines().next_line().await {
        Ok(Some(prefix)) => prefix.trim().to_string(),
        _ => return,
    };
    let (tx, mut rx) = mpsc::channel::<Arc<str>>(SUBSCRIBER_QUEUE);
    debug!("Subscriber for '{}' connected", prefix);
    subscribers.lock().push(Subscriber { prefix, tx });

    while let Some(line) = rx.recv().await {
        if write.write_all(line.as_bytes()).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtx_common::config::LogLevel;
    use rtx_shared_memory::MsgOrigin;
    use std::time::Duration;

    async fn wait_for_subscribers(publisher: &Publisher, n: usize) {
        for _ in 0..200 {
            if publisher.subscriber_count() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("subscribers never connected");
    }

    #[tokio::test]
    async fn subscribers_get_matching_topics() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("msgd.sock");
        let mut publisher = Publisher::bind(&path).unwrap();

        let mut rt_sub = UnixStream::connect(&path).await.unwrap();
        rt_sub.write_all(b"rt.\n").await.unwrap();
        wait_for_subscribers(&publisher, 1).await;

        let user = LogRecord::new(MsgOrigin::User, LogLevel::Info, "halcmd", "hello");
        let rt = LogRecord::new(MsgOrigin::Rt, LogLevel::Error, "scale", "overrun");
        assert_eq!(publisher.publish(&user).unwrap(), 0);
        assert_eq!(publisher.publish(&rt).unwrap(), 1);

        let mut lines = BufReader::new(rt_sub).lines();
        let line = tokio::time::timeout(Duration::from_secs(2), lines.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["topic"], "rt.scale");
        assert_eq!(value["text"], "overrun");
        assert_eq!(value["level"], "error");
    }

    #[tokio::test]
    async fn socket_file_is_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("msgd.sock");
        let publisher = Publisher::bind(&path).unwrap();
        assert!(path.exists());
        drop(publisher);
        assert!(!path.exists());
    }
}
