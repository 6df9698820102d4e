//! Token delivery from the model server to the answer streamer.
//!
//! Generation here is cancellable mid-answer: the public stop endpoint
//! publishes on the cancellation bus and the stream must quit between
//! tokens, not after the model finishes. `TokenStream` owns that contract:
//! an attached stop check is polled before every token is handed out, and a
//! tripped check ends the stream permanently so no token leaks out after a
//! stop. It also counts what it emitted, for usage accounting on the
//! persisted assistant message.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;

type StopCheck = Box<dyn Fn() -> bool + Send + Sync>;

pub struct TokenStream {
    receiver: mpsc::Receiver<String>,
    stop_check: Option<StopCheck>,
    emitted: usize,
    stopped: bool,
}

impl TokenStream {
    pub fn new(receiver: mpsc::Receiver<String>) -> Self {
        Self {
            receiver,
            stop_check: None,
            emitted: 0,
            stopped: false,
        }
    }

    /// Attach a stop check, polled before each token. The answer streamer
    /// wires this to the cancellation bus under the session key.
    pub fn with_stop_check(mut self, check: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        self.stop_check = Some(Box::new(check));
        self
    }

    /// True once the stop check ended the stream early.
    pub fn was_stopped(&self) -> bool {
        self.stopped
    }

    /// Tokens handed out so far.
    pub fn tokens_emitted(&self) -> usize {
        self.emitted
    }

    fn stop_requested(&self) -> bool {
        self.stop_check.as_ref().is_some_and(|check| check())
    }

    /// Next token, or None when the model finished or a stop landed. A
    /// stopped stream stays closed; tokens still in flight are dropped.
    pub async fn next(&mut self) -> Option<String> {
        if self.stopped {
            return None;
        }
        if self.stop_requested() {
            self.stopped = true;
            self.receiver.close();
            return None;
        }
        match self.receiver.recv().await {
            Some(token) => {
                self.emitted += 1;
                Some(token)
            }
            None => None,
        }
    }

    /// Drain the whole stream into a string. Honors the stop check, so the
    /// result may be a prefix of the full answer.
    pub async fn collect(mut self) -> String {
        let mut result = String::new();
        while let Some(token) = self.next().await {
            result.push_str(&token);
        }
        result
    }
}

impl Stream for TokenStream {
    type Item = String;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.stopped {
            return Poll::Ready(None);
        }
        if self.stop_requested() {
            self.stopped = true;
            self.receiver.close();
            return Poll::Ready(None);
        }
        match self.receiver.poll_recv(cx) {
            Poll::Ready(Some(token)) => {
                self.emitted += 1;
                Poll::Ready(Some(token))
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn test_collect_concatenates_tokens() {
        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(async move {
            for token in ["Hello", ", ", "world"] {
                tx.send(token.to_string()).await.unwrap();
            }
        });
        assert_eq!(TokenStream::new(rx).collect().await, "Hello, world");
    }

    #[tokio::test]
    async fn test_next_ends_on_sender_drop() {
        let (tx, rx) = mpsc::channel(1);
        drop(tx);
        let mut stream = TokenStream::new(rx);
        assert_eq!(stream.next().await, None);
        assert!(!stream.was_stopped());
    }

    #[tokio::test]
    async fn test_stop_check_ends_stream_between_tokens() {
        let (tx, rx) = mpsc::channel(8);
        tx.send("first".to_string()).await.unwrap();
        tx.send("second".to_string()).await.unwrap();

        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let mut stream =
            TokenStream::new(rx).with_stop_check(move || stop_flag.load(Ordering::SeqCst));

        assert_eq!(stream.next().await.as_deref(), Some("first"));
        stop.store(true, Ordering::SeqCst);
        // "second" is already buffered but must not leak past the stop.
        assert_eq!(stream.next().await, None);
        assert!(stream.was_stopped());
        assert_eq!(stream.tokens_emitted(), 1);
    }

    #[tokio::test]
    async fn test_stopped_stream_stays_closed() {
        let (tx, rx) = mpsc::channel(8);
        tx.send("token".to_string()).await.unwrap();

        let mut stream = TokenStream::new(rx).with_stop_check(|| true);
        assert_eq!(stream.next().await, None);
        assert_eq!(stream.next().await, None);
        assert!(stream.was_stopped());
        assert_eq!(stream.tokens_emitted(), 0);
    }

    #[tokio::test]
    async fn test_emitted_count_tracks_delivery() {
        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(async move {
            for token in ["a", "b", "c"] {
                tx.send(token.to_string()).await.unwrap();
            }
        });
        let mut stream = TokenStream::new(rx);
        while stream.next().await.is_some() {}
        assert_eq!(stream.tokens_emitted(), 3);
    }
}
