//! Transaction Reference Extraction
//!
//! Pulls an on-chain transaction hash out of free-form mention text.
//! Explorer links (`https://<host>/tx/0x...`) take precedence over bare hashes.
//! Nothing in here touches the network: a reference only exists once it has
//! matched the lexical pattern.

use alloy::primitives::TxHash;
use regex::Regex;
use std::fmt;
use std::sync::LazyLock;

/// Explorer transaction link, capturing the hash. The hex run ends at the
/// first non-hex character, whatever script it belongs to.
static EXPLORER_TX_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"https://[A-Za-z0-9.-]+(?::[0-9]+)?/tx/(0x[0-9a-fA-F]{64})(?:[^0-9a-fA-F]|$)")
        .expect("explorer pattern is valid")
});

/// Bare 32-byte hash anywhere in the text, capturing the hash
static BARE_TX_HASH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|[^0-9A-Za-z])(0x[0-9a-fA-F]{64})(?:[^0-9a-fA-F]|$)")
        .expect("hash pattern is valid")
});

/// Length of a `0x`-prefixed transaction hash
pub const TX_HASH_HEX_LEN: usize = 66;

/// Where in the text a reference was found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceSource {
    /// Inside an explorer `/tx/` link
    ExplorerUrl,
    /// A bare `0x` hash with no surrounding link
    BareHash,
}

impl ReferenceSource {
    pub fn name(&self) -> &'static str {
        match self {
            ReferenceSource::ExplorerUrl => "explorer_url",
            ReferenceSource::BareHash => "bare_hash",
        }
    }
}

/// A validated transaction hash extracted from mention text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TxReference(TxHash);

impl TxReference {
    /// Parse a candidate string, accepting only the exact `0x` + 64 hex form
    pub fn parse(candidate: &str) -> Option<Self> {
        if !is_tx_hash(candidate) {
            return None;
        }
        candidate.parse::<TxHash>().ok().map(TxReference)
    }

    /// The referenced transaction hash
    pub fn hash(&self) -> TxHash {
        self.0
    }
}

impl From<TxHash> for TxReference {
    fn from(hash: TxHash) -> Self {
        TxReference(hash)
    }
}

impl fmt::Display for TxReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Check that a string is exactly a `0x`-prefixed 64 hex digit hash
pub fn is_tx_hash(candidate: &str) -> bool {
    candidate.len() == TX_HASH_HEX_LEN
        && candidate.starts_with("0x")
        && candidate[2..].bytes().all(|b| b.is_ascii_hexdigit())
}

/// Extract a transaction reference from mention text
///
/// # Arguments
/// * `text` - The raw mention text
///
/// # Returns
/// `Some(TxReference)` for the first explorer link, falling back to the first
/// bare hash; `None` when the text carries neither
pub fn extract_reference(text: &str) -> Option<TxReference> {
    extract_reference_with_source(text).map(|(reference, _)| reference)
}

/// Same as [`extract_reference`], also reporting which pattern matched
pub fn extract_reference_with_source(text: &str) -> Option<(TxReference, ReferenceSource)> {
    if let Some(captures) = EXPLORER_TX_URL.captures(text) {
        if let Some(reference) = captures.get(1).and_then(|m| TxReference::parse(m.as_str())) {
            return Some((reference, ReferenceSource::ExplorerUrl));
        }
    }

    BARE_TX_HASH
        .captures(text)
        .and_then(|captures| captures.get(1))
        .and_then(|m| TxReference::parse(m.as_str()))
        .map(|reference| (reference, ReferenceSource::BareHash))
}
