//! Narrow mail-provider boundary. The actual protocol client (IMAP, vendor
//! graph APIs) lives behind a relay; this service only asks for "the next
//! batch after these cursors" and never sees protocol details.

use async_trait::async_trait;
use models::{MailMessage, Mailbox, SyncState};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Serialize)]
struct FetchBatchRequest<'a> {
    mailbox: &'a str,
    after_uid: i64,
    after_sequence: i64,
    limit: i32,
}

/// One bounded slice of a mailbox, plus how much is left beyond it.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct MailBatch {
    pub messages: Vec<MailMessage>,
    /// Messages still waiting beyond this batch. Zero means the job that
    /// consumed this batch is done.
    pub remaining: i64,
}

#[async_trait]
pub trait MailProvider: Send + Sync {
    async fn fetch_batch(
        &self,
        mailbox: &Mailbox,
        state: &SyncState,
        limit: i32,
    ) -> anyhow::Result<MailBatch>;
}

/// Fetches batches from the mail relay over HTTP.
pub struct RelayMailProvider {
    client: reqwest::Client,
    base_url: String,
}

impl RelayMailProvider {
    pub fn new(base_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to create HTTP client");

        Self { client, base_url }
    }
}

#[async_trait]
impl MailProvider for RelayMailProvider {
    async fn fetch_batch(
        &self,
        mailbox: &Mailbox,
        state: &SyncState,
        limit: i32,
    ) -> anyhow::Result<MailBatch> {
        let url = format!("{}/api/v1/messages/fetch", self.base_url);
        let request = FetchBatchRequest {
            mailbox: &mailbox.address,
            after_uid: state.last_uid,
            after_sequence: state.last_sequence_number,
            limit,
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(anyhow::anyhow!(
                "Mail relay request failed with status {}: {}",
                status,
                error_text
            ));
        }

        let batch: MailBatch = response.json().await?;
        Ok(batch)
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Hands out pre-scripted batches in order; errors once the script is
    /// exhausted.
    pub struct ScriptedProvider {
        batches: Mutex<Vec<MailBatch>>,
    }

    impl ScriptedProvider {
        pub fn new(mut batches: Vec<MailBatch>) -> Self {
            batches.reverse();
            Self {
                batches: Mutex::new(batches),
            }
        }
    }

    #[async_trait]
    impl MailProvider for ScriptedProvider {
        async fn fetch_batch(
            &self,
            _mailbox: &Mailbox,
            _state: &SyncState,
            _limit: i32,
        ) -> anyhow::Result<MailBatch> {
            self.batches
                .lock()
                .unwrap()
                .pop()
                .ok_or_else(|| anyhow::anyhow!("scripted provider exhausted"))
        }
    }
}
