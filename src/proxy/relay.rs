//! Stream relay - upstream event stream → paced chat completion chunks
//!
//! # Architecture
//!
//! ```text
//! upstream bytes ──→ LineBuffer ──→ sse::parse_line ──→ StreamEvent
//!                                                          │
//!           ┌──────────────────────────────────────────────┤
//!           │ first content: SessionMapper::commit         │
//!           ↓                                              ↓
//!   per-character queue ──(PacingPolicy delay)──→ mpsc::Sender<Bytes> ──→ client
//! ```
//!
//! Every run ends with exactly one `[DONE]` frame unless the client has gone
//! away. On client disconnect the upstream stream is dropped immediately,
//! which returns its connection to the pool.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;

use super::error::UpstreamError;
use super::sse::{self, LineBuffer, StreamEvent};
use super::state::{SessionBinding, SessionMapper};
use super::translation::response::{done_frame, error_frame, ChunkWriter};
use crate::config::PacingConfig;
use crate::util::truncate_utf8_safe;

// ─────────────────────────────────────────────────────────────────────────────
// Pacing
// ─────────────────────────────────────────────────────────────────────────────

/// Inverse step function from queued characters to per-character delay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacingPolicy {
    /// (backlog threshold, delay), largest threshold first
    tiers: Vec<(usize, Duration)>,
    ceiling: Duration,
    floor: Duration,
}

impl PacingPolicy {
    pub fn from_config(config: &PacingConfig) -> Self {
        let mut tiers: Vec<(usize, Duration)> = config
            .tiers
            .iter()
            .map(|t| (t.above, Duration::from_millis(t.delay_ms)))
            .collect();
        tiers.sort_by(|a, b| b.0.cmp(&a.0));

        Self {
            tiers,
            ceiling: Duration::from_millis(config.ceiling_ms),
            floor: Duration::from_millis(config.floor_ms),
        }
    }

    /// No delays at all
    #[cfg(test)]
    pub fn immediate() -> Self {
        Self {
            tiers: Vec::new(),
            ceiling: Duration::ZERO,
            floor: Duration::ZERO,
        }
    }

    /// Delay after emitting a character with `backlog` characters still queued
    pub fn delay_for(&self, backlog: usize) -> Duration {
        self.tiers
            .iter()
            .find(|(above, _)| backlog > *above)
            .map(|(_, delay)| *delay)
            .unwrap_or(self.ceiling)
    }

    /// Delay used when flushing the queue at stream end
    pub fn flush_delay(&self) -> Duration {
        self.floor
    }
}

impl Default for PacingPolicy {
    fn default() -> Self {
        Self::from_config(&PacingConfig::default())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Relay
// ─────────────────────────────────────────────────────────────────────────────

/// How a relay run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Upstream sent its terminal event; stop frame and `[DONE]` were sent
    Completed,
    /// Transport failure or truncated stream; error frame and `[DONE]` were sent
    UpstreamFailed,
    /// The client stopped reading; the upstream stream was abandoned
    ClientDisconnected,
}

/// Per-request stream transcoder
pub struct StreamRelay {
    sink: mpsc::Sender<Bytes>,
    pacing: Arc<PacingPolicy>,
    mappings: SessionMapper,
    binding: SessionBinding,
    model: String,
    created: i64,
    /// Set on the first content event
    writer: Option<ChunkWriter>,
    /// Characters of the current fragment not yet emitted
    queue: VecDeque<char>,
}

/// Early exit from the relay loop
type Stop = RelayOutcome;

impl StreamRelay {
    pub fn new(
        sink: mpsc::Sender<Bytes>,
        pacing: Arc<PacingPolicy>,
        mappings: SessionMapper,
        binding: SessionBinding,
        model: impl Into<String>,
        created: i64,
    ) -> Self {
        Self {
            sink,
            pacing,
            mappings,
            binding,
            model: model.into(),
            created,
            writer: None,
            queue: VecDeque::new(),
        }
    }

    /// Consume the upstream byte stream until it terminates, fails, or the
    /// client disconnects
    pub async fn run<S, E>(mut self, upstream: S) -> RelayOutcome
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: Into<UpstreamError>,
    {
        futures::pin_mut!(upstream);
        let mut lines = LineBuffer::new();

        loop {
            let next = tokio::select! {
                biased;
                _ = self.sink.closed() => return self.client_gone(),
                next = upstream.next() => next,
            };

            match next {
                Some(Ok(chunk)) => {
                    lines.push(&chunk);
                    while let Some(line) = lines.next_line() {
                        if let Err(stop) = self.handle_line(&line).await {
                            return stop;
                        }
                    }
                }
                Some(Err(e)) => {
                    let error: UpstreamError = e.into();
                    tracing::error!("Upstream stream failed: {}", error);
                    return self.fail(&error).await;
                }
                None => break,
            }
        }

        // Upstream closed without a trailing newline
        if let Some(line) = lines.finish() {
            if let Err(stop) = self.handle_line(&line).await {
                return stop;
            }
        }

        tracing::warn!("Upstream stream ended without a terminal event");
        self.fail(&UpstreamError::Request(
            "upstream stream ended before completion".to_string(),
        ))
        .await
    }

    async fn handle_line(&mut self, line: &str) -> Result<(), Stop> {
        let event = match sse::parse_line(line) {
            Ok(Some(event)) => event,
            Ok(None) => return Ok(()),
            Err(e) => {
                tracing::warn!(
                    "Skipping malformed upstream event: {} (line: {})",
                    e,
                    truncate_utf8_safe(line, 100)
                );
                return Ok(());
            }
        };

        match event {
            StreamEvent::Message { answer, .. } if answer.is_empty() => Ok(()),
            StreamEvent::Message {
                answer,
                message_id,
                conversation_id,
            } => {
                if self.writer.is_none() {
                    self.on_first_content(message_id, conversation_id.as_deref())
                        .await;
                }
                self.queue.extend(answer.chars());
                self.drain_paced().await
            }
            StreamEvent::MessageEnd { message_id } => {
                self.finish(message_id).await?;
                Err(RelayOutcome::Completed)
            }
            StreamEvent::Error { message, code } => {
                tracing::warn!(
                    "Upstream aborted the stream ({}): {}",
                    code.as_deref().unwrap_or("no code"),
                    message
                );
                Err(self.fail(&UpstreamError::Event { message, code }).await)
            }
            StreamEvent::Other { kind } => {
                tracing::trace!("Ignoring upstream event '{}'", kind);
                Ok(())
            }
        }
    }

    /// The single point where a new mapping may be established
    async fn on_first_content(&mut self, message_id: Option<String>, conversation_id: Option<&str>) {
        self.writer = Some(ChunkWriter::new(
            message_id.unwrap_or_else(fallback_id),
            self.model.clone(),
            self.created,
        ));
        self.mappings.commit(&self.binding, conversation_id).await;
    }

    /// Emit queued characters, pacing by remaining backlog
    async fn drain_paced(&mut self) -> Result<(), Stop> {
        while let Some(c) = self.queue.pop_front() {
            self.emit_char(c).await?;
            let delay = self.pacing.delay_for(self.queue.len());
            self.pause(delay).await?;
        }
        Ok(())
    }

    /// Flush leftovers at the floor delay, then stop frame and `[DONE]`
    async fn finish(&mut self, message_id: Option<String>) -> Result<(), Stop> {
        let flush = self.pacing.flush_delay();
        while let Some(c) = self.queue.pop_front() {
            self.emit_char(c).await?;
            self.pause(flush).await?;
        }

        let writer = match &self.writer {
            Some(writer) => writer.clone(),
            None => ChunkWriter::new(
                message_id.unwrap_or_else(fallback_id),
                self.model.clone(),
                self.created,
            ),
        };
        self.send(writer.stop()).await?;
        self.send(done_frame()).await?;
        tracing::debug!("Stream relay completed");
        Ok(())
    }

    async fn emit_char(&mut self, c: char) -> Result<(), Stop> {
        let mut buf = [0u8; 4];
        let frame = match &self.writer {
            Some(writer) => writer.content(c.encode_utf8(&mut buf)),
            None => return Ok(()),
        };
        self.send(frame).await
    }

    async fn pause(&self, delay: Duration) -> Result<(), Stop> {
        if delay.is_zero() {
            return Ok(());
        }
        tokio::select! {
            biased;
            _ = self.sink.closed() => Err(self.client_gone()),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    async fn send(&self, frame: Bytes) -> Result<(), Stop> {
        self.sink
            .send(frame)
            .await
            .map_err(|_| self.client_gone())
    }

    fn client_gone(&self) -> RelayOutcome {
        tracing::info!("Client disconnected mid-stream, abandoning upstream stream");
        RelayOutcome::ClientDisconnected
    }

    /// Error frame then `[DONE]`; send failures no longer matter here
    async fn fail(&self, error: &UpstreamError) -> RelayOutcome {
        let (_, kind, code) = error.classify();
        let _ = self.sink.send(error_frame(&error.to_string(), kind, code)).await;
        let _ = self.sink.send(done_frame()).await;
        RelayOutcome::UpstreamFailed
    }
}

/// Emit an upstream failure that happened before any byte was streamed
pub async fn send_failure(sink: &mpsc::Sender<Bytes>, error: &UpstreamError) {
    let (_, kind, code) = error.classify();
    let _ = sink.send(error_frame(&error.to_string(), kind, code)).await;
    let _ = sink.send(done_frame()).await;
}

fn fallback_id() -> String {
    format!("chatcmpl-{}", chrono::Utc::now().timestamp_millis())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MappingPolicy, MappingStore, StoreOptions};
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn mapper(dir: &TempDir) -> SessionMapper {
        let store = MappingStore::open(StoreOptions {
            db_path: dir.path().join("relay.db"),
            ..StoreOptions::default()
        })
        .unwrap();
        SessionMapper::new(Arc::new(store), MappingPolicy::FirstWriterWins)
    }

    fn message(answer: &str) -> String {
        format!(
            "data: {{\"event\": \"message\", \"answer\": {}, \"message_id\": \"msg-1\", \"conversation_id\": \"conv-1\"}}\n",
            serde_json::to_string(answer).unwrap()
        )
    }

    const END: &str = "data: {\"event\": \"message_end\", \"message_id\": \"msg-1\"}\n";

    fn chunks(parts: &[&str]) -> Vec<Result<Bytes, UpstreamError>> {
        parts
            .iter()
            .map(|p| Ok(Bytes::copy_from_slice(p.as_bytes())))
            .collect()
    }

    async fn run_relay(
        mapper: SessionMapper,
        binding: SessionBinding,
        upstream: Vec<Result<Bytes, UpstreamError>>,
    ) -> (RelayOutcome, Vec<String>) {
        let (tx, mut rx) = mpsc::channel(1024);
        let relay = StreamRelay::new(
            tx,
            Arc::new(PacingPolicy::immediate()),
            mapper,
            binding,
            "client-model",
            1_700_000_000,
        );
        let outcome = relay.run(futures::stream::iter(upstream)).await;

        let mut frames = Vec::new();
        while let Some(frame) = rx.recv().await {
            frames.push(String::from_utf8(frame.to_vec()).unwrap());
        }
        (outcome, frames)
    }

    fn payload(frame: &str) -> Value {
        let json = frame
            .strip_prefix("data: ")
            .and_then(|s| s.strip_suffix("\n\n"))
            .unwrap();
        serde_json::from_str(json).unwrap()
    }

    fn contents(frames: &[String]) -> Vec<String> {
        frames
            .iter()
            .filter(|f| !f.contains("[DONE]"))
            .map(|f| payload(f))
            .filter_map(|v| {
                v["choices"][0]["delta"]["content"]
                    .as_str()
                    .map(str::to_string)
            })
            .collect()
    }

    #[test]
    fn test_pacing_steps() {
        let policy = PacingPolicy::default();
        assert_eq!(policy.delay_for(31), Duration::from_millis(1));
        assert_eq!(policy.delay_for(30), Duration::from_millis(2));
        assert_eq!(policy.delay_for(21), Duration::from_millis(2));
        assert_eq!(policy.delay_for(15), Duration::from_millis(10));
        assert_eq!(policy.delay_for(10), Duration::from_millis(20));
        assert_eq!(policy.delay_for(0), Duration::from_millis(20));
        assert_eq!(policy.flush_delay(), Duration::from_millis(1));
    }

    #[tokio::test]
    async fn test_characters_then_stop_then_done() {
        let dir = TempDir::new().unwrap();
        let upstream = chunks(&[message("ab").as_str(), message("c").as_str(), END]);

        let (outcome, frames) = run_relay(mapper(&dir), SessionBinding::Stateless, upstream).await;

        assert_eq!(outcome, RelayOutcome::Completed);
        assert_eq!(contents(&frames), vec!["a", "b", "c"]);
        assert_eq!(frames.len(), 5);

        let stop = payload(&frames[3]);
        assert_eq!(stop["choices"][0]["finish_reason"], "stop");
        assert_eq!(stop["choices"][0]["delta"], serde_json::json!({}));
        assert_eq!(stop["model"], "client-model");
        assert_eq!(stop["id"], "msg-1");
        assert_eq!(frames[4], "data: [DONE]\n\n");
    }

    #[tokio::test]
    async fn test_malformed_line_does_not_drop_later_events() {
        let dir = TempDir::new().unwrap();
        let upstream = chunks(&[message("x").as_str(), "data: {broken json\n", message("y").as_str(), END]);

        let (outcome, frames) = run_relay(mapper(&dir), SessionBinding::Stateless, upstream).await;

        assert_eq!(outcome, RelayOutcome::Completed);
        assert_eq!(contents(&frames), vec!["x", "y"]);
    }

    #[tokio::test]
    async fn test_events_split_at_arbitrary_byte_boundaries() {
        let dir = TempDir::new().unwrap();
        let whole = format!("{}{}{}", message("héllo"), "event: ping\n\n", END);
        let bytes = whole.as_bytes();

        // Three-byte chunks split lines and the two-byte 'é' alike
        let upstream: Vec<Result<Bytes, UpstreamError>> = bytes
            .chunks(3)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();

        let (outcome, frames) = run_relay(mapper(&dir), SessionBinding::Stateless, upstream).await;

        assert_eq!(outcome, RelayOutcome::Completed);
        assert_eq!(contents(&frames).concat(), "héllo");
    }

    #[tokio::test]
    async fn test_transport_error_emits_error_frame_then_done() {
        let dir = TempDir::new().unwrap();
        let mut upstream = chunks(&[message("a").as_str()]);
        upstream.push(Err(UpstreamError::Timeout("read timed out".into())));
        upstream.extend(chunks(&[message("never").as_str()]));

        let (outcome, frames) = run_relay(mapper(&dir), SessionBinding::Stateless, upstream).await;

        assert_eq!(outcome, RelayOutcome::UpstreamFailed);
        assert_eq!(contents(&frames), vec!["a"]);
        assert_eq!(frames.len(), 3);
        let error = payload(&frames[1]);
        assert!(error["error"]["message"]
            .as_str()
            .unwrap()
            .contains("read timed out"));
        assert_eq!(frames[2], "data: [DONE]\n\n");
    }

    #[tokio::test]
    async fn test_truncated_stream_still_terminates() {
        let dir = TempDir::new().unwrap();
        // No message_end, and the last line has no newline
        let partial = message("a");
        let upstream = chunks(&[partial.trim_end()]);

        let (outcome, frames) = run_relay(mapper(&dir), SessionBinding::Stateless, upstream).await;

        assert_eq!(outcome, RelayOutcome::UpstreamFailed);
        assert_eq!(contents(&frames), vec!["a"]);
        assert!(payload(&frames[1]).get("error").is_some());
        assert_eq!(frames.last().unwrap(), "data: [DONE]\n\n");
    }

    #[tokio::test]
    async fn test_upstream_error_event_is_forwarded() {
        let dir = TempDir::new().unwrap();
        let upstream = chunks(&[
            message("a").as_str(),
            "data: {\"event\": \"error\", \"status\": 400, \"code\": \"quota\", \"message\": \"quota exceeded\"}\n",
            message("never").as_str(),
        ]);

        let (outcome, frames) = run_relay(mapper(&dir), SessionBinding::Stateless, upstream).await;

        assert_eq!(outcome, RelayOutcome::UpstreamFailed);
        assert_eq!(contents(&frames), vec!["a"]);
        assert_eq!(frames.len(), 3);
        let error = payload(&frames[1]);
        assert!(error["error"]["message"]
            .as_str()
            .unwrap()
            .contains("quota exceeded"));
        assert_eq!(error["error"]["code"], "upstream_error");
        assert_eq!(frames[2], "data: [DONE]\n\n");
    }

    #[tokio::test]
    async fn test_trailing_terminal_event_without_newline_completes() {
        let dir = TempDir::new().unwrap();
        let upstream = chunks(&[message("a").as_str(), END.trim_end()]);

        let (outcome, _) = run_relay(mapper(&dir), SessionBinding::Stateless, upstream).await;
        assert_eq!(outcome, RelayOutcome::Completed);
    }

    #[tokio::test]
    async fn test_first_content_creates_mapping() {
        let dir = TempDir::new().unwrap();
        let mapper = mapper(&dir);
        let binding = SessionBinding::Unmapped {
            session_key: "chat-1".into(),
        };

        let upstream = chunks(&[message("hi").as_str(), END]);
        let (outcome, _) = run_relay(mapper.clone(), binding, upstream).await;

        assert_eq!(outcome, RelayOutcome::Completed);
        assert_eq!(
            mapper.store().lookup("chat-1").unwrap().as_deref(),
            Some("conv-1")
        );
    }

    #[tokio::test]
    async fn test_no_content_creates_no_mapping() {
        let dir = TempDir::new().unwrap();
        let mapper = mapper(&dir);
        let binding = SessionBinding::Unmapped {
            session_key: "chat-1".into(),
        };

        let upstream = chunks(&[message("").as_str(), END]);
        let (outcome, frames) = run_relay(mapper.clone(), binding, upstream).await;

        assert_eq!(outcome, RelayOutcome::Completed);
        assert_eq!(frames.len(), 2);
        assert_eq!(mapper.store().count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_client_disconnect_stops_reading_upstream() {
        let dir = TempDir::new().unwrap();
        let (tx, rx) = mpsc::channel(8);
        drop(rx);

        let pulled = Arc::new(AtomicUsize::new(0));
        let counter = pulled.clone();
        let upstream = futures::stream::iter(chunks(&[message("abc").as_str(), END]))
            .inspect(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });

        let relay = StreamRelay::new(
            tx,
            Arc::new(PacingPolicy::immediate()),
            mapper(&dir),
            SessionBinding::Stateless,
            "m",
            0,
        );

        assert_eq!(relay.run(upstream).await, RelayOutcome::ClientDisconnected);
        assert_eq!(pulled.load(Ordering::SeqCst), 0);
    }
}
