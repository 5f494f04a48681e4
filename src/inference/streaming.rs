//! Token streaming
//!
//! A bounded, cancellable conduit carrying generated chunks from an engine to
//! one consumer.
//!
//! - The producer suspends while the channel is full; chunks are never dropped.
//! - The consumer cancels by calling [`TokenStream::cancel`], by dropping the
//!   stream, or through a [`CancelHandle`]. A producer waiting for capacity wakes
//!   up and every later send fails with [`StreamClosed::Cancelled`].
//! - A chunk with a terminal [`FinishReason`] ends the stream; nothing can be
//!   sent after it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Notify;

use crate::types::RequestId;

/// Why a stream ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Not finished; more chunks follow
    #[default]
    None,
    /// End of generation or a stop sequence
    Stop,
    /// Token budget or context window exhausted
    Length,
    /// Engine failure mid-stream
    Error,
}

impl FinishReason {
    pub fn is_terminal(self) -> bool {
        self != FinishReason::None
    }
}

/// One incremental unit of generated output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenChunk {
    pub request_id: RequestId,
    /// Position within the request, starting at 0
    pub index: u64,
    pub text: String,
    pub finish_reason: FinishReason,
    /// Name of the engine variant that produced the chunk
    pub engine: String,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum StreamClosed {
    #[error("stream cancelled by consumer")]
    Cancelled,
    #[error("stream already finished")]
    Finished,
}

/// State shared by both ends of one stream
#[derive(Debug, Default)]
struct Control {
    cancelled: AtomicBool,
    finished: AtomicBool,
    reason: Mutex<FinishReason>,
    changed: Notify,
}

impl Control {
    fn cancel(&self) -> bool {
        let newly = !self.cancelled.swap(true, Ordering::SeqCst);
        if newly {
            self.changed.notify_waiters();
        }
        newly
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    async fn wait_until(&self, done: impl Fn(&Control) -> bool) {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if done(self) {
                return;
            }
            notified.await;
        }
    }

    async fn cancelled(&self) {
        self.wait_until(Control::is_cancelled).await
    }
}

/// Creates a stream for one request
///
/// Must be called inside a tokio runtime for [`TokenSender::blocking_send`] to
/// suspend without polling.
pub fn token_channel(
    request_id: RequestId,
    engine: impl Into<String>,
    capacity: usize,
) -> (TokenSender, TokenStream) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let control = Arc::new(Control::default());

    let sender = TokenSender {
        tx,
        control: control.clone(),
        request_id: request_id.clone(),
        engine: engine.into(),
        next_index: Arc::new(AtomicU64::new(0)),
        text_chunks: Arc::new(AtomicU64::new(0)),
        runtime: Handle::try_current().ok(),
    };
    let stream = TokenStream {
        rx,
        control,
        request_id,
        done: false,
    };
    (sender, stream)
}

/// Producer end, held by the engine
#[derive(Debug, Clone)]
pub struct TokenSender {
    tx: mpsc::Sender<TokenChunk>,
    control: Arc<Control>,
    request_id: RequestId,
    engine: String,
    next_index: Arc<AtomicU64>,
    text_chunks: Arc<AtomicU64>,
    runtime: Option<Handle>,
}

impl TokenSender {
    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    /// Engines poll this at every generation step
    pub fn is_cancelled(&self) -> bool {
        self.control.is_cancelled() || self.tx.is_closed()
    }

    /// A terminal chunk has been sent
    pub fn is_finished(&self) -> bool {
        self.control.is_finished()
    }

    /// The terminal reason delivered, `None` while unfinished
    pub fn finish_reason(&self) -> FinishReason {
        *self
            .control
            .reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of non-empty text chunks delivered so far
    pub fn text_chunks(&self) -> u64 {
        self.text_chunks.load(Ordering::SeqCst)
    }

    /// Sends one chunk, suspending while the channel is full
    pub async fn send(
        &self,
        text: impl Into<String>,
        finish_reason: FinishReason,
    ) -> Result<(), StreamClosed> {
        let chunk = self.prepare(text.into(), finish_reason)?;
        let has_text = !chunk.text.is_empty();

        tokio::select! {
            biased;
            _ = self.control.cancelled() => return Err(StreamClosed::Cancelled),
            sent = self.tx.send(chunk) => sent.map_err(|_| StreamClosed::Cancelled)?,
        }

        self.delivered(has_text, finish_reason);
        Ok(())
    }

    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), StreamClosed> {
        self.send(text, FinishReason::None).await
    }

    pub async fn finish(&self, finish_reason: FinishReason) -> Result<(), StreamClosed> {
        self.send(String::new(), finish_reason).await
    }

    /// [`TokenSender::send`] for engine threads outside the async runtime
    ///
    /// Must not be called from an async context.
    pub fn blocking_send(
        &self,
        text: impl Into<String>,
        finish_reason: FinishReason,
    ) -> Result<(), StreamClosed> {
        let text = text.into();
        match &self.runtime {
            Some(handle) => handle.block_on(self.send(text, finish_reason)),
            None => self.polling_send(text, finish_reason),
        }
    }

    fn polling_send(&self, text: String, finish_reason: FinishReason) -> Result<(), StreamClosed> {
        let mut chunk = self.prepare(text, finish_reason)?;
        let has_text = !chunk.text.is_empty();

        loop {
            if self.control.is_cancelled() {
                return Err(StreamClosed::Cancelled);
            }
            match self.tx.try_send(chunk) {
                Ok(()) => break,
                Err(TrySendError::Full(returned)) => {
                    chunk = returned;
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(TrySendError::Closed(_)) => return Err(StreamClosed::Cancelled),
            }
        }

        self.delivered(has_text, finish_reason);
        Ok(())
    }

    fn prepare(&self, text: String, finish_reason: FinishReason) -> Result<TokenChunk, StreamClosed> {
        if self.control.is_cancelled() {
            return Err(StreamClosed::Cancelled);
        }

        // Claim the terminal slot before sending so only one terminal chunk exists
        let already_finished = if finish_reason.is_terminal() {
            self.control.finished.swap(true, Ordering::SeqCst)
        } else {
            self.control.is_finished()
        };
        if already_finished {
            return Err(StreamClosed::Finished);
        }

        Ok(TokenChunk {
            request_id: self.request_id.clone(),
            index: self.next_index.fetch_add(1, Ordering::SeqCst),
            text,
            finish_reason,
            engine: self.engine.clone(),
        })
    }

    fn delivered(&self, has_text: bool, finish_reason: FinishReason) {
        if has_text {
            self.text_chunks.fetch_add(1, Ordering::SeqCst);
        }
        if finish_reason.is_terminal() {
            *self
                .control
                .reason
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = finish_reason;
            self.control.changed.notify_waiters();
        }
    }
}

/// Cancels a stream without owning its consumer end
#[derive(Debug, Clone)]
pub struct CancelHandle {
    control: Arc<Control>,
}

impl CancelHandle {
    /// Returns `true` if this call did the cancelling
    pub fn cancel(&self) -> bool {
        self.control.cancel()
    }

    pub fn is_cancelled(&self) -> bool {
        self.control.is_cancelled()
    }

    /// Resolves once the stream is cancelled or has sent its terminal chunk
    pub async fn closed(&self) {
        self.control
            .wait_until(|c| c.is_cancelled() || c.is_finished())
            .await
    }
}

/// Consumer end, returned to the caller of `generate`
#[derive(Debug)]
pub struct TokenStream {
    rx: mpsc::Receiver<TokenChunk>,
    control: Arc<Control>,
    request_id: RequestId,
    done: bool,
}

impl TokenStream {
    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            control: self.control.clone(),
        }
    }

    /// Next chunk, or `None` once the stream ended or was cancelled
    ///
    /// After cancellation nothing more is returned, even chunks already buffered.
    pub async fn recv(&mut self) -> Option<TokenChunk> {
        if self.done || self.control.is_cancelled() {
            self.close();
            return None;
        }

        let chunk = tokio::select! {
            biased;
            _ = self.control.cancelled() => None,
            chunk = self.rx.recv() => chunk,
        };

        match chunk {
            Some(chunk) if !self.control.is_cancelled() => {
                if chunk.finish_reason.is_terminal() {
                    self.done = true;
                }
                Some(chunk)
            }
            _ => {
                self.close();
                None
            }
        }
    }

    /// Cancels from the consumer side
    pub fn cancel(&mut self) {
        self.control.cancel();
        self.close();
    }

    fn close(&mut self) {
        self.done = true;
        self.rx.close();
    }

    /// Drains the stream, returning every chunk received
    pub async fn collect(mut self) -> Vec<TokenChunk> {
        let mut chunks = Vec::new();
        while let Some(chunk) = self.recv().await {
            chunks.push(chunk);
        }
        chunks
    }

    /// Drains the stream into its text and final finish reason
    pub async fn collect_text(self) -> (String, FinishReason) {
        let mut text = String::new();
        let mut finish_reason = FinishReason::None;
        for chunk in self.collect().await {
            text.push_str(&chunk.text);
            finish_reason = chunk.finish_reason;
        }
        (text, finish_reason)
    }
}

impl Drop for TokenStream {
    fn drop(&mut self) {
        // Consumer disconnect: the producer must stop
        if !self.done {
            self.control.cancel();
        }
    }
}

/// Reassembles UTF-8 text from token bytes
///
/// Tokens can split a multi-byte character; incomplete trailing bytes are held
/// back until the rest arrives.
#[derive(Debug, Default)]
pub struct Utf8Assembler {
    pending: Vec<u8>,
}

impl Utf8Assembler {
    /// Returns the text that became complete with `bytes`, if any
    pub fn push(&mut self, bytes: &[u8]) -> Option<String> {
        self.pending.extend_from_slice(bytes);

        let complete = match std::str::from_utf8(&self.pending) {
            Ok(_) => self.pending.len(),
            // Bytes that can never become valid: emit them replaced
            Err(e) if e.error_len().is_some() => return self.flush(),
            Err(e) => e.valid_up_to(),
        };
        if complete == 0 {
            return None;
        }

        let rest = self.pending.split_off(complete);
        let text = std::mem::replace(&mut self.pending, rest);
        Some(String::from_utf8_lossy(&text).into_owned())
    }

    /// Whatever is still buffered, replacing incomplete sequences
    pub fn flush(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::{sleep, timeout};

    fn channel(capacity: usize) -> (TokenSender, TokenStream) {
        token_channel(RequestId::from("req"), "test-engine", capacity)
    }

    #[tokio::test]
    async fn test_chunks_are_stamped_in_order() {
        let (tx, stream) = channel(8);
        tx.send_text("Hello").await.unwrap();
        tx.send_text(" world").await.unwrap();
        tx.finish(FinishReason::Stop).await.unwrap();

        let chunks = stream.collect().await;
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks.iter().map(|c| c.index).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert!(chunks.iter().all(|c| c.engine == "test-engine"));
        assert_eq!(chunks[2].finish_reason, FinishReason::Stop);
        assert_eq!(tx.text_chunks(), 2);
    }

    #[tokio::test]
    async fn test_nothing_after_terminal_chunk() {
        let (tx, stream) = channel(8);
        tx.send("done", FinishReason::Length).await.unwrap();

        assert_eq!(tx.send_text("late").await, Err(StreamClosed::Finished));
        assert_eq!(tx.finish(FinishReason::Error).await, Err(StreamClosed::Finished));
        assert!(tx.is_finished());
        assert_eq!(tx.finish_reason(), FinishReason::Length);

        let (text, reason) = stream.collect_text().await;
        assert_eq!(text, "done");
        assert_eq!(reason, FinishReason::Length);
    }

    #[tokio::test]
    async fn test_backpressure_suspends_producer_without_dropping() {
        let (tx, mut stream) = channel(1);
        let produced = Arc::new(AtomicUsize::new(0));

        let producer = {
            let produced = produced.clone();
            tokio::spawn(async move {
                for i in 0..100 {
                    let reason = if i == 99 { FinishReason::Stop } else { FinishReason::None };
                    tx.send(i.to_string(), reason).await.unwrap();
                    produced.fetch_add(1, Ordering::SeqCst);
                }
            })
        };

        let mut received = Vec::new();
        for _ in 0..10 {
            received.push(stream.recv().await.unwrap());
        }

        // Consumer pauses: the producer can only fill the single free slot
        sleep(Duration::from_millis(50)).await;
        let produced_while_paused = produced.load(Ordering::SeqCst);
        assert!(produced_while_paused <= 11, "produced {}", produced_while_paused);
        assert!(!producer.is_finished());

        while let Some(chunk) = stream.recv().await {
            received.push(chunk);
        }
        producer.await.unwrap();

        assert_eq!(received.len(), 100);
        for (i, chunk) in received.iter().enumerate() {
            assert_eq!(chunk.text, i.to_string());
            assert_eq!(chunk.index, i as u64);
        }
        assert_eq!(received[99].finish_reason, FinishReason::Stop);
    }

    #[tokio::test]
    async fn test_cancel_wakes_blocked_producer() {
        let (tx, stream) = channel(1);
        tx.send_text("fills the buffer").await.unwrap();

        let handle = stream.cancel_handle();
        let producer = tokio::spawn(async move { tx.send_text("blocked").await });

        sleep(Duration::from_millis(20)).await;
        assert!(handle.cancel());
        assert!(!handle.cancel());

        let result = timeout(Duration::from_secs(1), producer).await.unwrap().unwrap();
        assert_eq!(result, Err(StreamClosed::Cancelled));
        drop(stream);
    }

    #[tokio::test]
    async fn test_no_chunks_observable_after_cancel() {
        let (tx, mut stream) = channel(4);
        tx.send_text("a").await.unwrap();
        tx.send_text("b").await.unwrap();

        assert_eq!(stream.recv().await.unwrap().text, "a");
        stream.cancel();
        assert!(stream.recv().await.is_none());
        assert!(tx.is_cancelled());
        assert_eq!(tx.send_text("c").await, Err(StreamClosed::Cancelled));
    }

    #[tokio::test]
    async fn test_drop_is_disconnect() {
        let (tx, stream) = channel(4);
        drop(stream);
        assert!(tx.is_cancelled());
        assert_eq!(tx.send_text("x").await, Err(StreamClosed::Cancelled));
    }

    #[tokio::test]
    async fn test_drop_after_completion_is_not_cancel() {
        let (tx, stream) = channel(4);
        let handle = stream.cancel_handle();
        tx.finish(FinishReason::Stop).await.unwrap();
        let _ = stream.collect().await;
        assert!(!handle.is_cancelled());
        timeout(Duration::from_secs(1), handle.closed()).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_blocking_send_from_native_thread() {
        let (tx, stream) = channel(2);

        let producer = std::thread::spawn(move || {
            for i in 0..20 {
                tx.blocking_send(i.to_string(), FinishReason::None).unwrap();
            }
            tx.blocking_send("", FinishReason::Stop).unwrap();
        });

        let chunks = stream.collect().await;
        producer.join().unwrap();
        assert_eq!(chunks.len(), 21);
        assert_eq!(chunks[19].text, "19");
    }

    #[test]
    fn test_polling_send_without_runtime() {
        let (tx, mut stream) = channel(1);
        tx.blocking_send("x", FinishReason::None).unwrap();
        stream.cancel();
        assert_eq!(tx.blocking_send("y", FinishReason::None), Err(StreamClosed::Cancelled));
    }

    #[test]
    fn test_utf8_assembler_joins_split_characters() {
        let mut utf8 = Utf8Assembler::default();
        let bytes = "é".as_bytes();

        assert_eq!(utf8.push(b"ab"), Some("ab".to_string()));
        assert_eq!(utf8.push(&bytes[..1]), None);
        assert_eq!(utf8.push(&bytes[1..]), Some("é".to_string()));
        assert_eq!(utf8.flush(), None);
    }

    #[test]
    fn test_utf8_assembler_keeps_incomplete_suffix() {
        let mut utf8 = Utf8Assembler::default();
        let euro = "€".as_bytes();
        let mut bytes = b"x".to_vec();
        bytes.extend_from_slice(&euro[..2]);

        assert_eq!(utf8.push(&bytes), Some("x".to_string()));
        assert_eq!(utf8.flush(), Some("\u{FFFD}".to_string()));
    }

    #[test]
    fn test_utf8_assembler_replaces_invalid_bytes() {
        let mut utf8 = Utf8Assembler::default();
        assert_eq!(utf8.push(&[0xff, b'a']), Some("\u{FFFD}a".to_string()));
    }
}
