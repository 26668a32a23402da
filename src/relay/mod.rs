mod decode;
mod sink;

pub use decode::{decoder_for, FrameDecoder, FrameEvent};
pub use sink::{ChannelSink, Notification, NotifySink};

use std::time::Duration;

use futures_util::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{Config, DecodeMode};
use crate::constants::FALLBACK_REPLIES;
use crate::errors::{RelayError, UpstreamError};
use crate::upstream::UpstreamClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnStatus {
    Pending,
    Streaming,
    Complete,
    Failed,
    Cancelled,
}

/// One user message and its in-progress answer. Lives for the duration of a
/// single relay invocation and is dropped after the terminal notification.
#[derive(Debug)]
pub struct Turn {
    pub request_id: Uuid,
    pub input_text: String,
    pub accumulated_text: String,
    pub status: TurnStatus,
}

impl Turn {
    fn new(input_text: String) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            input_text,
            accumulated_text: String::new(),
            status: TurnStatus::Pending,
        }
    }
}

#[derive(Clone, Debug)]
pub struct RelayOptions {
    pub mode: DecodeMode,
    pub timeout: Duration,
    pub max_message_len: usize,
}

impl RelayOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            mode: config.decode_mode,
            timeout: Duration::from_secs(config.relay_timeout_secs),
            max_message_len: config.max_message_len,
        }
    }
}

/// Pre-flight validation shared with the connection handler, so oversize and
/// empty messages are rejected before any upstream call.
pub fn validate_message(input_text: &str, max_message_len: usize) -> Result<(), RelayError> {
    let trimmed = input_text.trim();
    if trimmed.is_empty() {
        return Err(RelayError::EmptyMessage);
    }
    if trimmed.chars().count() > max_message_len {
        return Err(RelayError::MessageTooLong {
            limit: max_message_len,
        });
    }
    Ok(())
}

pub fn fallback_reply(input_text: &str) -> &'static str {
    FALLBACK_REPLIES[input_text.len() % FALLBACK_REPLIES.len()]
}

fn deliver_fallback<S: NotifySink + ?Sized>(input_text: &str, sink: &S) -> String {
    let reply = fallback_reply(input_text).to_string();
    sink.notify(Notification::complete(reply.clone()));
    reply
}

/// Drives exactly one upstream generation call per accepted message and
/// translates it into an ordered sequence of notifications terminating in
/// exactly one `complete`, regardless of how the upstream call ends.
#[derive(Clone, Debug)]
pub struct StreamRelay {
    upstream: UpstreamClient,
    opts: RelayOptions,
}

impl StreamRelay {
    pub fn new(upstream: UpstreamClient, opts: RelayOptions) -> Self {
        Self { upstream, opts }
    }

    /// Resolves with the final answer text. Upstream failures of any kind
    /// (connect error, non-2xx, read error, timeout) are absorbed: the
    /// fallback reply is both delivered through `sink` and returned. Only
    /// pre-flight validation and cancellation surface as errors.
    pub async fn relay<S: NotifySink + ?Sized>(
        &self,
        input_text: &str,
        sink: &S,
        cancel: &CancellationToken,
    ) -> Result<String, RelayError> {
        validate_message(input_text, self.opts.max_message_len)?;
        let mut turn = Turn::new(input_text.trim().to_string());

        debug!(
            phase = "relay_start",
            request_id = %turn.request_id,
            mode = ?self.opts.mode,
            input_chars = turn.input_text.chars().count(),
            "Opening upstream generation call"
        );

        let outcome = tokio::select! {
            _ = cancel.cancelled() => None,
            result = tokio::time::timeout(self.opts.timeout, self.run_turn(&mut turn, sink)) => {
                Some(result)
            }
        };

        let Some(outcome) = outcome else {
            turn.status = TurnStatus::Cancelled;
            info!(
                phase = "relay_cancelled",
                request_id = %turn.request_id,
                partial_chars = turn.accumulated_text.chars().count(),
                "Turn cancelled by the client, upstream call aborted"
            );
            return Err(RelayError::Cancelled);
        };

        match outcome {
            Ok(Ok(())) => {
                turn.status = TurnStatus::Complete;
                debug!(
                    phase = "relay_complete",
                    request_id = %turn.request_id,
                    answer_chars = turn.accumulated_text.chars().count(),
                    "Turn complete"
                );
                sink.notify(Notification::complete(turn.accumulated_text.clone()));
                Ok(turn.accumulated_text)
            }
            Ok(Err(error)) => {
                turn.status = TurnStatus::Failed;
                warn!(
                    phase = "relay_fallback",
                    request_id = %turn.request_id,
                    "Upstream failure, serving fallback reply: {error}"
                );
                Ok(deliver_fallback(&turn.input_text, sink))
            }
            Err(_elapsed) => {
                turn.status = TurnStatus::Failed;
                warn!(
                    phase = "relay_timeout",
                    request_id = %turn.request_id,
                    timeout_secs = self.opts.timeout.as_secs(),
                    "Upstream call exceeded the relay timeout, serving fallback reply"
                );
                Ok(deliver_fallback(&turn.input_text, sink))
            }
        }
    }

    async fn run_turn<S: NotifySink + ?Sized>(
        &self,
        turn: &mut Turn,
        sink: &S,
    ) -> Result<(), UpstreamError> {
        let response = match self.opts.mode {
            DecodeMode::Ndjson => self.upstream.generate_stream(&turn.input_text).await?,
            DecodeMode::Sse => self.upstream.chat_stream(&turn.input_text).await?,
        };
        turn.status = TurnStatus::Streaming;

        let mut decoder = decoder_for(self.opts.mode);
        drive_stream(response.bytes_stream(), decoder.as_mut(), turn, sink).await
    }
}

/// The decoding loop: reassemble framing units from arbitrary chunk
/// boundaries, grow the cumulative answer, and emit one partial snapshot per
/// content fragment. A stream that ends without an explicit done signal
/// counts as success with whatever text accumulated.
async fn drive_stream<St, B, E, S>(
    mut stream: St,
    decoder: &mut dyn FrameDecoder,
    turn: &mut Turn,
    sink: &S,
) -> Result<(), UpstreamError>
where
    St: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
    S: NotifySink + ?Sized,
{
    while let Some(chunk_result) = stream.next().await {
        let chunk = chunk_result
            .map_err(|error| UpstreamError::new(format!("error reading upstream stream: {error}")))?;

        for event in decoder.feed(chunk.as_ref()) {
            match event {
                FrameEvent::Delta(fragment) => {
                    turn.accumulated_text.push_str(&fragment);
                    sink.notify(Notification::partial(turn.accumulated_text.clone()));
                }
                FrameEvent::Done => return Ok(()),
            }
        }
    }

    Ok(())
}
