//! Per-job log channel: append-only history plus a set of bounded
//! subscriber buffers.

use chrono::Utc;
use depot_core::build::{LogLine, LogStream};
use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_stream::wrappers::ReceiverStream;

#[derive(Debug)]
pub(crate) struct LogChannel {
    lines: Vec<LogLine>,
    subscribers: Vec<mpsc::Sender<LogLine>>,
    closed: bool,
    buffer: usize,
}

impl LogChannel {
    pub(crate) fn new(buffer: usize) -> Self {
        Self {
            lines: Vec::new(),
            subscribers: Vec::new(),
            closed: false,
            buffer: buffer.max(1),
        }
    }

    pub(crate) fn next_offset(&self) -> u64 {
        self.lines.len() as u64 + 1
    }

    /// Record a line and fan it out. Subscribers whose buffer is full are
    /// disconnected; the producer never waits.
    pub(crate) fn append(&mut self, stream: LogStream, content: String) -> LogLine {
        let line = LogLine {
            offset: self.next_offset(),
            timestamp: Utc::now(),
            stream,
            content,
        };
        self.lines.push(line.clone());

        self.subscribers.retain(|tx| match tx.try_send(line.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::debug!(offset = line.offset, "Disconnecting slow log subscriber");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        });

        line
    }

    /// Backlog after `from_offset` chained with live lines. The backlog is
    /// taken and the subscriber registered under the same borrow, so no line
    /// falls between them.
    pub(crate) fn subscribe(&mut self, from_offset: u64) -> BoxStream<'static, LogLine> {
        let backlog: Vec<LogLine> = self
            .lines
            .iter()
            .filter(|line| line.offset > from_offset)
            .cloned()
            .collect();

        let backlog = futures::stream::iter(backlog);
        if self.closed {
            return backlog.boxed();
        }

        let (tx, rx) = mpsc::channel(self.buffer);
        self.subscribers.push(tx);
        backlog.chain(ReceiverStream::new(rx)).boxed()
    }

    /// End every live subscription once the job is terminal.
    pub(crate) fn close(&mut self) {
        self.closed = true;
        self.subscribers.clear();
    }

    #[cfg(test)]
    pub(crate) fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offsets(lines: &[LogLine]) -> Vec<u64> {
        lines.iter().map(|l| l.offset).collect()
    }

    #[tokio::test]
    async fn test_offsets_start_at_one() {
        let mut channel = LogChannel::new(8);
        let first = channel.append(LogStream::Stdout, "a".into());
        let second = channel.append(LogStream::Stderr, "b".into());
        assert_eq!(first.offset, 1);
        assert_eq!(second.offset, 2);
    }

    #[tokio::test]
    async fn test_resume_skips_seen_lines() {
        let mut channel = LogChannel::new(8);
        for i in 0..5 {
            channel.append(LogStream::Stdout, format!("line {}", i));
        }
        channel.close();

        let lines: Vec<LogLine> = channel.subscribe(3).collect().await;
        assert_eq!(offsets(&lines), vec![4, 5]);
    }

    #[tokio::test]
    async fn test_live_lines_follow_backlog() {
        let mut channel = LogChannel::new(8);
        channel.append(LogStream::Stdout, "one".into());
        let stream = channel.subscribe(0);

        channel.append(LogStream::Stdout, "two".into());
        channel.append(LogStream::Stdout, "three".into());
        channel.close();

        let lines: Vec<LogLine> = stream.collect().await;
        assert_eq!(offsets(&lines), vec![1, 2, 3]);
        assert_eq!(lines[2].content, "three");
    }

    #[tokio::test]
    async fn test_slow_subscriber_is_disconnected() {
        let mut channel = LogChannel::new(2);
        let slow = channel.subscribe(0);
        assert_eq!(channel.subscriber_count(), 1);

        for i in 0..5 {
            channel.append(LogStream::Stdout, format!("line {}", i));
        }
        assert_eq!(channel.subscriber_count(), 0);

        // Whatever was buffered is delivered in order, then the stream ends.
        let lines: Vec<LogLine> = slow.collect().await;
        assert_eq!(offsets(&lines), vec![1, 2]);

        // Reconnecting from the last seen offset yields the rest.
        channel.close();
        let rest: Vec<LogLine> = channel.subscribe(2).collect().await;
        assert_eq!(offsets(&rest), vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn test_dropped_subscriber_is_pruned() {
        let mut channel = LogChannel::new(4);
        drop(channel.subscribe(0));
        channel.append(LogStream::System, "x".into());
        assert_eq!(channel.subscriber_count(), 0);
    }
}
