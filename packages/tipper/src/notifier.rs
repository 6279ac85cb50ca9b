//! Reply Notifier
//!
//! Posts the tip acknowledgement back to the originating mention. Delivery is
//! tried through the primary reply call first and, if that fails, exactly
//! once through the fallback call. A failed notification never affects the
//! tip that was already sent.

use alloy::primitives::utils::format_ether;
use alloy::primitives::{TxHash, U256};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::feed::{FeedError, XClient};

/// Path segment the explorer uses for transaction pages
const EXPLORER_TX_PATH: &str = "tx";

/// Outbound reply calls
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ReplyChannel: Send + Sync {
    /// Primary path: reply to `mention_id`
    ///
    /// # Returns
    /// Id of the created post
    async fn reply(&self, text: &str, mention_id: &str) -> Result<String, FeedError>;

    /// Fallback path: post a status marked as a reply to `in_reply_to`
    async fn post(&self, text: &str, in_reply_to: &str) -> Result<String, FeedError>;
}

#[async_trait]
impl ReplyChannel for XClient {
    async fn reply(&self, text: &str, mention_id: &str) -> Result<String, FeedError> {
        XClient::reply(self, text, mention_id).await
    }

    async fn post(&self, text: &str, in_reply_to: &str) -> Result<String, FeedError> {
        XClient::post(self, text, in_reply_to).await
    }
}

/// Which delivery path carried the reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMethod {
    Primary,
    Fallback,
    None,
}

impl DeliveryMethod {
    pub fn name(&self) -> &'static str {
        match self {
            DeliveryMethod::Primary => "primary",
            DeliveryMethod::Fallback => "fallback",
            DeliveryMethod::None => "none",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationOutcome {
    pub mention_id: String,
    pub delivered: bool,
    pub method: DeliveryMethod,
    /// Id of the reply post, when one was created
    pub reply_id: Option<String>,
}

/// Render a wei amount in native units without trailing zeros
pub fn display_amount(amount: U256) -> String {
    let formatted = format_ether(amount);
    match formatted.split_once('.') {
        Some((whole, fraction)) => {
            let fraction = fraction.trim_end_matches('0');
            if fraction.is_empty() {
                whole.to_string()
            } else {
                format!("{}.{}", whole, fraction)
            }
        }
        None => formatted,
    }
}

/// Build the acknowledgement text for a confirmed tip
///
/// # Arguments
/// * `amount` - Tip amount as shown to the user, in native units
/// * `explorer_url` - Explorer base URL, with or without a trailing slash
/// * `tx_hash` - Confirmation hash of the tip transfer
pub fn format_reply(amount: &str, explorer_url: &str, tx_hash: TxHash) -> String {
    format!(
        "Thanks for registering your IP! I've sent you a tip of {} tokens. Transaction: {}/{}/{:#x}",
        amount,
        explorer_url.trim_end_matches('/'),
        EXPLORER_TX_PATH,
        tx_hash
    )
}

#[derive(Clone)]
pub struct ReplyNotifier {
    channel: Arc<dyn ReplyChannel>,
}

impl ReplyNotifier {
    pub fn new(channel: Arc<dyn ReplyChannel>) -> Self {
        Self { channel }
    }

    /// Deliver `message` as a reply to `mention_id`
    pub async fn notify(&self, mention_id: &str, message: &str) -> NotificationOutcome {
        match self.channel.reply(message, mention_id).await {
            Ok(reply_id) => {
                info!(mention_id = mention_id, reply_id = %reply_id, "Reply posted");
                return NotificationOutcome {
                    mention_id: mention_id.to_string(),
                    delivered: true,
                    method: DeliveryMethod::Primary,
                    reply_id: Some(reply_id),
                };
            }
            Err(e) => {
                warn!(mention_id = mention_id, error = %e, "Reply failed, trying fallback");
            }
        }

        match self.channel.post(message, mention_id).await {
            Ok(reply_id) => {
                info!(mention_id = mention_id, reply_id = %reply_id, "Reply posted via fallback");
                NotificationOutcome {
                    mention_id: mention_id.to_string(),
                    delivered: true,
                    method: DeliveryMethod::Fallback,
                    reply_id: Some(reply_id),
                }
            }
            Err(e) => {
                error!(mention_id = mention_id, error = %e, "Fallback reply failed, tip stands without notification");
                NotificationOutcome {
                    mention_id: mention_id.to_string(),
                    delivered: false,
                    method: DeliveryMethod::None,
                    reply_id: None,
                }
            }
        }
    }
}
