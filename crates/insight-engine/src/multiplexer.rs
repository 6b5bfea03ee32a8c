//! Runs one chat path on its own task and interleaves its progress trace
//! with its final output as a single ordered frame stream.
//!
//! The producer pushes thoughts onto the request's [`ThoughtQueue`] and
//! output onto a bounded result channel, ending with a `Complete` or `Error`
//! sentinel. The consumer side drains thoughts, then waits a bounded poll
//! interval for the next result. Thoughts queued before an output are always
//! drained ahead of it. Dropping the stream cancels the request token.

use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::DropGuard;
use tracing::{debug, warn};

use insight_core::events::{OutputEvent, ProducerMessage, StreamFrame};
use insight_core::thoughts::{ThoughtQueue, ThoughtSink, DEFAULT_THOUGHT_CAPACITY};
use insight_core::tools::CallContext;

pub const DEFAULT_RESULT_CAPACITY: usize = 64;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Clone, Debug)]
pub struct MultiplexerConfig {
    pub thought_capacity: usize,
    pub result_capacity: usize,
    pub poll_interval: Duration,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            thought_capacity: DEFAULT_THOUGHT_CAPACITY,
            result_capacity: DEFAULT_RESULT_CAPACITY,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Producer handle onto the result channel. Sending waits when the channel
/// is full.
#[derive(Clone)]
pub struct OutputSender {
    tx: mpsc::Sender<ProducerMessage>,
}

impl OutputSender {
    /// Returns false once the consumer is gone.
    pub async fn emit(&self, text: impl Into<String>) -> bool {
        self.tx
            .send(ProducerMessage::Output(OutputEvent::now(text)))
            .await
            .is_ok()
    }
}

#[derive(Clone, Debug, Default)]
pub struct StreamMultiplexer {
    config: MultiplexerConfig,
}

impl StreamMultiplexer {
    pub fn new(config: MultiplexerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MultiplexerConfig {
        &self.config
    }

    /// Spawn `producer` for one request and return the frame stream. The
    /// producer's `Err` text becomes the final error frame.
    pub fn start<F, Fut>(&self, ctx: CallContext, producer: F) -> BoxStream<'static, StreamFrame>
    where
        F: FnOnce(CallContext, OutputSender) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        let queue = ThoughtQueue::new(self.config.thought_capacity);
        let ctx = ctx.with_thoughts(ThoughtSink::new(Arc::clone(&queue)));
        let (tx, rx) = mpsc::channel(self.config.result_capacity.max(1));
        let cancel_on_drop = ctx.cancel.clone().drop_guard();
        let request_id = ctx.request_id.clone();

        let handle = tokio::spawn(async move {
            let out = OutputSender { tx: tx.clone() };
            let run = AssertUnwindSafe(async move { producer(ctx, out).await }).catch_unwind();
            let terminal = match run.await {
                Ok(Ok(())) => ProducerMessage::Complete,
                Ok(Err(message)) => ProducerMessage::Error(message),
                Err(panic) => {
                    let msg = panic_message(&panic);
                    tracing::error!(panic = %msg, "chat producer panicked");
                    ProducerMessage::Error(format!("internal error: {msg}"))
                }
            };
            if tx.send(terminal).await.is_err() {
                debug!("consumer gone before producer finished");
            }
        });

        let pump = Pump {
            rx,
            queue,
            handle,
            pending: VecDeque::new(),
            finished: false,
            poll_interval: self.config.poll_interval,
            request_id: request_id.to_string(),
            _cancel_on_drop: cancel_on_drop,
        };

        futures::stream::unfold(pump, |mut pump| async move {
            loop {
                if let Some(frame) = pump.pending.pop_front() {
                    return Some((frame, pump));
                }
                if pump.finished {
                    return None;
                }
                pump.step().await;
            }
        })
        .boxed()
    }
}

struct Pump {
    rx: mpsc::Receiver<ProducerMessage>,
    queue: Arc<ThoughtQueue>,
    handle: JoinHandle<()>,
    pending: VecDeque<StreamFrame>,
    finished: bool,
    poll_interval: Duration,
    request_id: String,
    _cancel_on_drop: DropGuard,
}

impl Pump {
    async fn step(&mut self) {
        self.drain_thoughts();
        if !self.pending.is_empty() {
            return;
        }

        match tokio::time::timeout(self.poll_interval, self.rx.recv()).await {
            Ok(Some(message)) => {
                // Thoughts pushed before this message go out first.
                self.drain_thoughts();
                match message {
                    ProducerMessage::Output(event) => self.pending.push_back(StreamFrame::Data(event)),
                    ProducerMessage::Complete => self.finish(None),
                    ProducerMessage::Error(text) => self.finish(Some(text)),
                }
            }
            Ok(None) => {
                self.drain_thoughts();
                self.finish(Some("producer exited without a result".into()));
            }
            Err(_) => {
                if self.handle.is_finished() && self.rx.is_empty() && self.queue.is_empty() {
                    self.finish(None);
                }
            }
        }
    }

    fn drain_thoughts(&mut self) {
        self.pending
            .extend(self.queue.drain().into_iter().map(StreamFrame::Thought));
    }

    /// The error frame, when there is one, is always the last frame.
    fn finish(&mut self, error: Option<String>) {
        let dropped = self.queue.dropped();
        if dropped > 0 {
            warn!(request_id = %self.request_id, dropped, "progress messages dropped");
            self.queue.push(format!("({dropped} progress messages dropped)"));
            self.drain_thoughts();
        }
        if let Some(text) = error {
            self.pending.push_back(StreamFrame::Error(text));
        }
        self.finished = true;
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    panic
        .downcast_ref::<String>()
        .map(|s| s.as_str())
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use insight_core::events::Channel;
    use insight_core::ids::{SessionId, UserId};
    use tokio::sync::oneshot;

    fn ctx() -> CallContext {
        CallContext::new(SessionId::from_raw("s"), UserId::from_raw("u"))
    }

    fn summary(frames: &[StreamFrame]) -> Vec<(Channel, String)> {
        frames.iter().map(|f| (f.channel(), f.text().to_string())).collect()
    }

    #[tokio::test]
    async fn thoughts_precede_the_output_they_caused() {
        let mux = StreamMultiplexer::default();
        let frames: Vec<_> = mux
            .start(ctx(), |ctx, out| async move {
                ctx.thought("Analyzing question: q");
                out.emit("first").await;
                ctx.thought("Processing results...");
                out.emit("second").await;
                Ok(())
            })
            .collect()
            .await;

        let frames = summary(&frames);
        let position = |text: &str| frames.iter().position(|(_, t)| t == text).unwrap();
        assert_eq!(frames.len(), 4);
        assert!(position("Analyzing question: q") < position("first"));
        assert!(position("Processing results...") < position("second"));
        assert!(position("first") < position("second"));
        assert_eq!(frames[position("first")].0, Channel::Data);
    }

    #[tokio::test]
    async fn producer_error_is_the_last_frame() {
        let mux = StreamMultiplexer::default();
        let frames: Vec<_> = mux
            .start(ctx(), |ctx, _out| async move {
                ctx.thought("Querying Looker data...");
                Err("analysis failed: boom".to_string())
            })
            .collect()
            .await;

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1], StreamFrame::Error("analysis failed: boom".into()));
    }

    #[tokio::test]
    async fn panicking_producer_surfaces_error() {
        let mux = StreamMultiplexer::default();
        let frames: Vec<_> = mux
            .start(ctx(), |_ctx, _out| async move {
                if true {
                    panic!("renderer exploded");
                }
                Ok(())
            })
            .collect()
            .await;

        assert_eq!(
            frames.last(),
            Some(&StreamFrame::Error("internal error: renderer exploded".into()))
        );
    }

    #[tokio::test]
    async fn overflow_reports_dropped_thoughts() {
        let mux = StreamMultiplexer::new(MultiplexerConfig {
            thought_capacity: 2,
            ..Default::default()
        });
        let frames: Vec<_> = mux
            .start(ctx(), |ctx, _out| async move {
                for i in 0..5 {
                    ctx.thought(format!("step {i}"));
                }
                Ok(())
            })
            .collect()
            .await;

        let texts: Vec<_> = frames.iter().map(StreamFrame::text).collect();
        assert_eq!(texts, vec!["step 3", "step 4", "(3 progress messages dropped)"]);
    }

    #[tokio::test]
    async fn error_stays_last_after_overflow() {
        let mux = StreamMultiplexer::new(MultiplexerConfig {
            thought_capacity: 2,
            ..Default::default()
        });
        let frames: Vec<_> = mux
            .start(ctx(), |ctx, _out| async move {
                for i in 0..4 {
                    ctx.thought(format!("step {i}"));
                }
                Err("analysis failed: boom".to_string())
            })
            .collect()
            .await;

        let frames = summary(&frames);
        assert_eq!(
            frames,
            vec![
                (Channel::Thought, "step 2".to_string()),
                (Channel::Thought, "step 3".to_string()),
                (Channel::Thought, "(2 progress messages dropped)".to_string()),
                (Channel::Error, "analysis failed: boom".to_string()),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn slow_producer_keeps_stream_open() {
        let mux = StreamMultiplexer::default();
        let frames: Vec<_> = mux
            .start(ctx(), |ctx, out| async move {
                ctx.thought("waiting on backend");
                tokio::time::sleep(Duration::from_secs(5)).await;
                out.emit("late result").await;
                Ok(())
            })
            .collect()
            .await;

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].text(), "late result");
    }

    #[tokio::test]
    async fn dropping_stream_cancels_producer() {
        let mux = StreamMultiplexer::default();
        let (seen_tx, seen_rx) = oneshot::channel();
        let mut stream = mux.start(ctx(), |ctx, _out| async move {
            ctx.thought("started");
            ctx.cancel.cancelled().await;
            let _ = seen_tx.send(());
            Ok(())
        });

        let first = stream.next().await.unwrap();
        assert_eq!(first.text(), "started");
        drop(stream);

        tokio::time::timeout(Duration::from_secs(1), seen_rx)
            .await
            .expect("producer should observe cancellation")
            .unwrap();
    }

    #[tokio::test]
    async fn result_channel_applies_backpressure() {
        let mux = StreamMultiplexer::new(MultiplexerConfig {
            result_capacity: 1,
            ..Default::default()
        });
        let frames: Vec<_> = mux
            .start(ctx(), |_ctx, out| async move {
                for i in 0..10 {
                    assert!(out.emit(format!("row {i}")).await);
                }
                Ok(())
            })
            .collect()
            .await;

        let texts: Vec<_> = frames.iter().map(StreamFrame::text).collect();
        assert_eq!(texts.len(), 10);
        assert_eq!(texts[9], "row 9");
    }
}
