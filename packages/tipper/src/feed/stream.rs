//! Streaming mention source.
//!
//! A background reader task holds the filtered stream open and pushes every
//! post into a bounded channel. When the connection drops it reconnects with
//! exponential backoff capped at the policy's maximum delay, for as long as
//! it takes. The attempt counter resets after each successful connect. The
//! reader only stops on shutdown or when the source is dropped, so an API
//! outage never ends the feed. `next_batch` returns whatever has queued up,
//! waiting for at least one mention.

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::x_api::{drain_lines, parse_stream_line, XClient};
use super::{FeedError, Mention, MentionSource};
use crate::backoff::BackoffPolicy;

/// Default channel capacity between the reader task and the coordinator
pub const DEFAULT_STREAM_BUFFER: usize = 64;

/// Default upper bound on mentions handed out per batch
pub const DEFAULT_MAX_BATCH: usize = 32;

#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Filter rule selecting mentions of the account
    pub rule_value: String,
    pub rule_tag: String,
    pub buffer: usize,
    pub max_batch: usize,
    /// Reconnect delays. `max_attempts` is not a limit here: the reader
    /// keeps retrying at `max_backoff_ms` until shutdown.
    pub backoff: BackoffPolicy,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            rule_value: String::new(),
            rule_tag: "tx_mentions".to_string(),
            buffer: DEFAULT_STREAM_BUFFER,
            max_batch: DEFAULT_MAX_BATCH,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Why one stream session ended
enum SessionEnd {
    Shutdown,
    ReceiverGone,
    Disconnected(FeedError),
    Closed,
}

/// Mention source fed by the filtered stream
pub struct StreamingSource {
    receiver: mpsc::Receiver<Mention>,
    max_batch: usize,
    reader: Option<JoinHandle<()>>,
}

impl StreamingSource {
    /// Install the filter rule and spawn the reader task
    ///
    /// # Arguments
    /// * `client` - API client used for rules and the stream connection
    /// * `config` - Rule, buffering and reconnect settings
    /// * `shutdown` - Cancelling this token stops the reader task
    pub async fn start(
        client: XClient,
        config: StreamConfig,
        shutdown: CancellationToken,
    ) -> Result<Self, FeedError> {
        client
            .replace_stream_rules(&config.rule_value, &config.rule_tag)
            .await?;

        let (sender, receiver) = mpsc::channel(config.buffer.max(1));
        let backoff = config.backoff;
        let reader = tokio::spawn(async move {
            run_reader(client, backoff, sender, shutdown).await;
        });

        Ok(Self {
            receiver,
            max_batch: config.max_batch.max(1),
            reader: Some(reader),
        })
    }

    /// Build a source over an existing channel, with no reader task attached
    pub fn from_receiver(receiver: mpsc::Receiver<Mention>, max_batch: usize) -> Self {
        Self {
            receiver,
            max_batch: max_batch.max(1),
            reader: None,
        }
    }
}

impl Drop for StreamingSource {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

#[async_trait]
impl MentionSource for StreamingSource {
    async fn next_batch(&mut self) -> Option<Vec<Mention>> {
        let first = self.receiver.recv().await?;
        let mut batch = vec![first];
        while batch.len() < self.max_batch {
            match self.receiver.try_recv() {
                Ok(mention) => batch.push(mention),
                Err(_) => break,
            }
        }
        debug!(count = batch.len(), "Stream batch ready");
        Some(batch)
    }

    fn name(&self) -> &'static str {
        "stream"
    }
}

async fn run_reader(
    client: XClient,
    backoff: BackoffPolicy,
    sender: mpsc::Sender<Mention>,
    shutdown: CancellationToken,
) {
    let mut attempts: u32 = 0;

    loop {
        let session = tokio::select! {
            _ = shutdown.cancelled() => SessionEnd::Shutdown,
            end = read_session(&client, &sender, &mut attempts) => end,
        };

        match session {
            SessionEnd::Shutdown => {
                info!("Stream reader stopping");
                return;
            }
            SessionEnd::ReceiverGone => {
                debug!("Stream receiver dropped, reader exiting");
                return;
            }
            SessionEnd::Disconnected(e) => {
                attempts = attempts.saturating_add(1);
                error!(attempt = attempts, error = %e, "Stream connection failed");
            }
            SessionEnd::Closed => {
                attempts = attempts.saturating_add(1);
                warn!(attempt = attempts, "Stream closed by server");
            }
        }

        let delay = backoff.delay(attempts - 1);
        warn!("Reconnecting stream (attempt {}), waiting {:?}", attempts.saturating_add(1), delay);
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Stream reader stopping");
                return;
            }
            _ = sender.closed() => {
                debug!("Stream receiver dropped, reader exiting");
                return;
            }
            _ = sleep(delay) => {}
        }
    }
}

async fn read_session(client: &XClient, sender: &mpsc::Sender<Mention>, attempts: &mut u32) -> SessionEnd {
    let response = match client.open_stream().await {
        Ok(response) => response,
        Err(e) => return SessionEnd::Disconnected(e),
    };

    *attempts = 0;
    info!("Stream connected");

    let mut body = response.bytes_stream();
    let mut buffer: Vec<u8> = Vec::new();

    while let Some(chunk) = body.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => return SessionEnd::Disconnected(FeedError::Http(e)),
        };
        buffer.extend_from_slice(&chunk);

        for line in drain_lines(&mut buffer) {
            match parse_stream_line(&line) {
                Ok(Some(mention)) => {
                    debug!(mention_id = %mention.id, "Stream mention received");
                    if sender.send(mention).await.is_err() {
                        return SessionEnd::ReceiverGone;
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Skipping malformed stream line"),
            }
        }
    }

    SessionEnd::Closed
}
