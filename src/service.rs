//! Message boundary in front of the record merger.
//!
//! Sessions and front-ends talk to the record owner with tagged messages.
//! Every message is validated here before the merger sees it.

use crate::merger::{DomainRecordMerger, MergeStats};
use crate::parser::{host_of, normalize};
use crate::store::RecordStore;
use crate::types::{DiscoveryBatch, DomainRecord, Result, ScriptsiftError};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

/// Requests accepted by the record owner.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Merge a discovery batch into its domain's record.
    Discovery(DiscoveryBatch),
    /// Read the record for a domain.
    Query { domain: String },
    /// Remove the record for a domain.
    Clear { domain: String },
}

/// Responses from the record owner.
#[derive(Debug, Clone)]
pub enum Reply {
    Merged { record: DomainRecord, stats: MergeStats },
    Record(Option<DomainRecord>),
    Cleared { domain: String },
}

impl Message {
    /// Decode and validate a JSON message.
    pub fn from_json(raw: &str) -> Result<Self> {
        let message: Message = serde_json::from_str(raw)
            .map_err(|e| ScriptsiftError::InvalidMessage(e.to_string()))?;
        message.validate()?;
        Ok(message)
    }

    pub fn domain(&self) -> &str {
        match self {
            Message::Discovery(batch) => &batch.domain,
            Message::Query { domain } | Message::Clear { domain } => domain,
        }
    }

    /// Check the shape invariants the merger relies on.
    pub fn validate(&self) -> Result<()> {
        validate_domain(self.domain())?;

        if let Message::Discovery(batch) = self {
            for candidate in &batch.urls {
                let canonical = normalize(&candidate.url, "")
                    .map(|u| u.to_string())
                    .ok_or_else(|| invalid(format!("url is not absolute http(s): {}", candidate.url)))?;
                if canonical != candidate.url {
                    return Err(invalid(format!("url is not normalized: {}", candidate.url)));
                }
            }
            if let Some(entry) = batch.inlines.iter().find(|i| i.length == 0) {
                return Err(invalid(format!("empty inline entry with hash {}", entry.hash)));
            }
            if let Some(sri) = batch.sri.iter().find(|s| s.integrity.is_empty()) {
                return Err(invalid(format!("empty integrity for {}", sri.url)));
            }
        }
        Ok(())
    }
}

fn invalid(reason: String) -> ScriptsiftError {
    ScriptsiftError::InvalidMessage(reason)
}

fn validate_domain(domain: &str) -> Result<()> {
    let parsed = host_of(&format!("http://{}/", domain));
    if domain.is_empty() || parsed.as_deref() != Some(domain) {
        return Err(invalid(format!("not a hostname: {:?}", domain)));
    }
    Ok(())
}

/// The persistence-owning side of the pipeline.
pub struct RecordService<S> {
    merger: DomainRecordMerger<S>,
}

impl<S: RecordStore> RecordService<S> {
    pub fn new(merger: DomainRecordMerger<S>) -> Self {
        Self { merger }
    }

    pub fn merger(&self) -> &DomainRecordMerger<S> {
        &self.merger
    }

    /// Validate and dispatch a message.
    pub async fn handle(&self, message: Message) -> Result<Reply> {
        message.validate()?;
        trace!("Handling {} message for {}", message_kind(&message), message.domain());

        match message {
            Message::Discovery(batch) => {
                let outcome = self.merger.merge(&batch.domain, &batch).await?;
                Ok(Reply::Merged {
                    record: outcome.record,
                    stats: outcome.stats,
                })
            }
            Message::Query { domain } => Ok(Reply::Record(self.merger.load(&domain).await?)),
            Message::Clear { domain } => {
                self.merger.clear(&domain).await?;
                debug!("Record cleared: {}", domain);
                Ok(Reply::Cleared { domain })
            }
        }
    }

    /// Convenience wrapper around a query message.
    pub async fn record(&self, domain: &str) -> Result<Option<DomainRecord>> {
        match self.handle(Message::Query { domain: domain.to_string() }).await? {
            Reply::Record(record) => Ok(record),
            _ => Ok(None),
        }
    }
}

fn message_kind(message: &Message) -> &'static str {
    match message {
        Message::Discovery(_) => "discovery",
        Message::Query { .. } => "query",
        Message::Clear { .. } => "clear",
    }
}
