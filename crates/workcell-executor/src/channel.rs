//! Worker → executor event channel.
//!
//! The executor binds a loopback TCP listener per session. Every worker
//! connects once and writes a single newline-delimited JSON
//! [`ExecutionEvent`]. Decoded events are forwarded into an unbounded mpsc
//! queue, so a burst of simultaneous completions never leaves a worker
//! waiting on the listener loop.

use std::io;
use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{debug, warn};

use crate::{error::WorkerError, event::ExecutionEvent};

/// Upper bound on one encoded event (4 MiB).
pub const MAX_EVENT_BYTES: usize = 4 * 1024 * 1024;

/// Parent-side end of the channel. Dropping or closing it stops accepting
/// connections and aborts in-flight reads.
pub struct EventChannel {
    addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

impl EventChannel {
    /// Bind on `bind` with an ephemeral port and start accepting workers.
    pub async fn bind(bind: &str, tx: mpsc::UnboundedSender<ExecutionEvent>) -> io::Result<Self> {
        let listener = TcpListener::bind((bind, 0)).await?;
        let addr = listener.local_addr()?;
        debug!(%addr, "event channel listening");
        let accept_task = tokio::spawn(accept_loop(listener, tx));
        Ok(Self { addr, accept_task })
    }

    /// Address workers report to.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn close(self) {
        drop(self);
    }
}

impl Drop for EventChannel {
    fn drop(&mut self) {
        self.accept_task.abort();
        debug!(addr = %self.addr, "event channel closed");
    }
}

async fn accept_loop(listener: TcpListener, tx: mpsc::UnboundedSender<ExecutionEvent>) {
    // Readers live in the JoinSet so aborting this task aborts them too.
    let mut readers = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "worker connected");
                    readers.spawn(read_event(stream, tx.clone()));
                }
                Err(e) => warn!("event channel accept failed: {e}"),
            },
            Some(_) = readers.join_next(), if !readers.is_empty() => {}
        }
    }
}

async fn read_event(stream: TcpStream, tx: mpsc::UnboundedSender<ExecutionEvent>) {
    let mut lines = FramedRead::new(stream, LinesCodec::new_with_max_length(MAX_EVENT_BYTES));
    match lines.next().await {
        Some(Ok(line)) => match serde_json::from_str::<ExecutionEvent>(&line) {
            Ok(event) => {
                if tx.send(event).is_err() {
                    debug!("listener gone, event discarded");
                }
            }
            Err(e) => warn!("malformed event on channel: {e}"),
        },
        Some(Err(e)) => warn!("event channel read failed: {e}"),
        None => debug!("worker disconnected without reporting"),
    }
}

/// Worker-side: connect to `addr` and send exactly one event.
pub async fn send_event(addr: SocketAddr, event: &ExecutionEvent) -> Result<(), WorkerError> {
    let stream = TcpStream::connect(addr).await?;
    let line = serde_json::to_string(event)?;
    let mut sink = FramedWrite::new(stream, LinesCodec::new_with_max_length(MAX_EVENT_BYTES));
    sink.send(line)
        .await
        .map_err(|e| WorkerError::Channel(e.to_string()))?;
    SinkExt::<String>::close(&mut sink)
        .await
        .map_err(|e| WorkerError::Channel(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{JobError, Outcome};
    use crate::types::InstanceId;
    use chrono::Utc;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    fn event(instance_id: u64) -> ExecutionEvent {
        ExecutionEvent {
            session: "session-a".into(),
            job_id: "ingest".into(),
            instance_id: InstanceId(instance_id),
            run_time: Utc::now(),
            finished_at: Utc::now(),
            outcome: Outcome::Failure {
                error: JobError {
                    kind: "ValueError".into(),
                    message: "boom".into(),
                    trace: "ValueError: boom".into(),
                },
            },
        }
    }

    #[tokio::test]
    async fn events_from_many_senders_reach_the_queue() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let channel = EventChannel::bind("127.0.0.1", tx).await.unwrap();
        let addr = channel.local_addr();

        let senders: Vec<_> = (1..=5u64)
            .map(|id| tokio::spawn(async move { send_event(addr, &event(id)).await }))
            .collect();
        for s in senders {
            s.await.unwrap().unwrap();
        }

        let mut ids = Vec::new();
        for _ in 0..5 {
            let ev = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(ev.error().unwrap().message, "boom");
            ids.push(ev.instance_id.get());
        }
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let channel = EventChannel::bind("127.0.0.1", tx).await.unwrap();

        let mut raw = TcpStream::connect(channel.local_addr()).await.unwrap();
        raw.write_all(b"not json\n").await.unwrap();
        raw.shutdown().await.unwrap();

        send_event(channel.local_addr(), &event(9)).await.unwrap();

        let ev = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ev.instance_id, InstanceId(9));
    }

    #[tokio::test]
    async fn closed_channel_refuses_workers() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let channel = EventChannel::bind("127.0.0.1", tx).await.unwrap();
        let addr = channel.local_addr();
        channel.close();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(send_event(addr, &event(1)).await.is_err());
    }
}
