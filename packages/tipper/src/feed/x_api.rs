//! X (Twitter) API Client
//!
//! Thin reqwest wrapper over the handful of endpoints the tipper needs:
//! recent search, filtered-stream rules, the filtered stream itself, and the
//! two ways of posting a reply.

use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info};

use super::{FeedError, Mention};
use crate::config::Secret;

/// Default API host
pub const DEFAULT_API_URL: &str = "https://api.twitter.com";

/// Tweet fields requested on every read
pub const TWEET_FIELDS: &str = "author_id,created_at,text";

/// Request timeout for non-streaming calls
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A post as returned by the v2 API
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Tweet {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub author_id: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
}

impl From<Tweet> for Mention {
    fn from(tweet: Tweet) -> Self {
        Mention::new(tweet.id, tweet.author_id.unwrap_or_default(), tweet.text)
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    data: Vec<Tweet>,
    #[serde(default)]
    meta: Option<SearchMeta>,
}

#[derive(Debug, Default, Deserialize)]
struct SearchMeta {
    #[serde(default)]
    newest_id: Option<String>,
}

/// One page of recent-search results
#[derive(Debug, Clone, Default)]
pub struct SearchPage {
    pub mentions: Vec<Mention>,
    /// Id of the newest result, to be passed as `since_id` next time
    pub newest_id: Option<String>,
}

/// A server-side filter rule for the filtered stream
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct StreamRule {
    pub id: String,
    pub value: String,
    #[serde(default)]
    pub tag: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RulesResponse {
    #[serde(default)]
    data: Vec<StreamRule>,
}

#[derive(Debug, Deserialize)]
struct CreatedPost {
    data: CreatedPostData,
}

#[derive(Debug, Deserialize)]
struct CreatedPostData {
    id: String,
}

#[derive(Debug, Deserialize)]
struct StreamEnvelope {
    #[serde(default)]
    data: Option<Tweet>,
}

/// Parse one line of the filtered stream
///
/// # Returns
/// * `Ok(None)` for keep-alive blank lines and non-post payloads
/// * `Ok(Some(Mention))` for a post
/// * `Err(_)` for malformed JSON
pub fn parse_stream_line(line: &str) -> Result<Option<Mention>, FeedError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let envelope: StreamEnvelope = serde_json::from_str(line)?;
    Ok(envelope.data.map(Mention::from))
}

/// Split complete `\n`-terminated lines off the front of a byte buffer
pub fn drain_lines(buffer: &mut Vec<u8>) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
        let line: Vec<u8> = buffer.drain(..=pos).collect();
        lines.push(String::from_utf8_lossy(&line).trim_end_matches(['\r', '\n']).to_string());
    }
    lines
}

/// Client for the X API
#[derive(Clone)]
pub struct XClient {
    http: Client,
    base_url: String,
    bearer_token: Secret,
    user_token: Option<Secret>,
}

impl XClient {
    pub fn new(base_url: impl Into<String>, bearer_token: Secret, user_token: Option<Secret>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            bearer_token,
            user_token,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn app_request(&self, request: RequestBuilder) -> RequestBuilder {
        request.bearer_auth(self.bearer_token.expose())
    }

    fn user_request(&self, request: RequestBuilder) -> Result<RequestBuilder, FeedError> {
        let token = self
            .user_token
            .as_ref()
            .ok_or(FeedError::MissingCredential("user token"))?;
        Ok(request.bearer_auth(token.expose()))
    }

    async fn check(response: Response) -> Result<Response, FeedError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(FeedError::Status {
            status: status.as_u16(),
            body,
        })
    }

    /// Recent search for mentions
    ///
    /// # Arguments
    /// * `query` - Search query, e.g. `@account url:storyscan`
    /// * `max_results` - Page size, 10..=100
    /// * `since_id` - Only return posts newer than this id
    pub async fn search_recent(
        &self,
        query: &str,
        max_results: u32,
        since_id: Option<&str>,
    ) -> Result<SearchPage, FeedError> {
        let mut params = vec![
            ("query", query.to_string()),
            ("max_results", max_results.to_string()),
            ("tweet.fields", TWEET_FIELDS.to_string()),
        ];
        if let Some(since_id) = since_id {
            params.push(("since_id", since_id.to_string()));
        }

        let request = self
            .http
            .get(self.url("/2/tweets/search/recent"))
            .query(&params)
            .timeout(REQUEST_TIMEOUT);
        let response = Self::check(self.app_request(request).send().await?).await?;
        let body: SearchResponse = serde_json::from_str(&response.text().await?)?;

        Ok(SearchPage {
            mentions: body.data.into_iter().map(Mention::from).collect(),
            newest_id: body.meta.unwrap_or_default().newest_id,
        })
    }

    /// Current filtered-stream rules
    pub async fn stream_rules(&self) -> Result<Vec<StreamRule>, FeedError> {
        let request = self
            .http
            .get(self.url("/2/tweets/search/stream/rules"))
            .timeout(REQUEST_TIMEOUT);
        let response = Self::check(self.app_request(request).send().await?).await?;
        let body: RulesResponse = serde_json::from_str(&response.text().await?)?;
        Ok(body.data)
    }

    async fn update_stream_rules(&self, payload: serde_json::Value) -> Result<(), FeedError> {
        let request = self
            .http
            .post(self.url("/2/tweets/search/stream/rules"))
            .json(&payload)
            .timeout(REQUEST_TIMEOUT);
        Self::check(self.app_request(request).send().await?).await?;
        Ok(())
    }

    /// Drop every existing rule and install a single one
    pub async fn replace_stream_rules(&self, value: &str, tag: &str) -> Result<(), FeedError> {
        let existing = self.stream_rules().await?;
        if !existing.is_empty() {
            let ids: Vec<&str> = existing.iter().map(|r| r.id.as_str()).collect();
            debug!(count = ids.len(), "Deleting existing stream rules");
            self.update_stream_rules(json!({ "delete": { "ids": ids } }))
                .await?;
        }

        self.update_stream_rules(json!({ "add": [{ "value": value, "tag": tag }] }))
            .await?;
        info!(rule = value, tag = tag, "Stream rule installed");
        Ok(())
    }

    /// Open the filtered stream. The body is newline-delimited JSON.
    pub async fn open_stream(&self) -> Result<Response, FeedError> {
        let request = self
            .http
            .get(self.url("/2/tweets/search/stream"))
            .query(&[("tweet.fields", TWEET_FIELDS)]);
        Self::check(self.app_request(request).send().await?).await
    }

    /// Reply through the v2 create-post endpoint
    pub async fn reply(&self, text: &str, in_reply_to: &str) -> Result<String, FeedError> {
        let payload = json!({
            "text": text,
            "reply": { "in_reply_to_tweet_id": in_reply_to },
        });
        let request = self
            .http
            .post(self.url("/2/tweets"))
            .json(&payload)
            .timeout(REQUEST_TIMEOUT);
        let response = Self::check(self.user_request(request)?.send().await?).await?;
        let created: CreatedPost = serde_json::from_str(&response.text().await?)?;
        Ok(created.data.id)
    }

    /// Post a reply as a standalone create-post request
    ///
    /// Same endpoint and credential as [`XClient::reply`], with the reply
    /// options spelled out in full.
    pub async fn post(&self, text: &str, in_reply_to: &str) -> Result<String, FeedError> {
        let payload = CreatePost {
            text,
            reply: ReplyOptions {
                in_reply_to_tweet_id: in_reply_to,
                exclude_reply_user_ids: Vec::new(),
            },
        };
        let request = self
            .http
            .post(self.url("/2/tweets"))
            .json(&payload)
            .timeout(REQUEST_TIMEOUT);
        let response = Self::check(self.user_request(request)?.send().await?).await?;
        let created: CreatedPost = serde_json::from_str(&response.text().await?)?;
        Ok(created.data.id)
    }
}

/// Body of a v2 create-post request
#[derive(Debug, Serialize)]
struct CreatePost<'a> {
    text: &'a str,
    reply: ReplyOptions<'a>,
}

#[derive(Debug, Serialize)]
struct ReplyOptions<'a> {
    in_reply_to_tweet_id: &'a str,
    exclude_reply_user_ids: Vec<&'a str>,
}
