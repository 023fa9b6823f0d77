use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, info};
use uuid::Uuid;

use mailwright_core::types::{
    Campaign, CampaignStatus, DeliveryRecord, DeliveryStatus, SendRef, StatusChange,
};
use mailwright_core::{MailwrightError, MailwrightResult};

/// Ledger of delivery records, keyed by dedup key. Records only ever move
/// forward along the status ladder; regressions are silently ignored so
/// out-of-order provider callbacks are safe.
#[derive(Clone, Default)]
pub struct DeliveryStore {
    records: Arc<DashMap<String, DeliveryRecord>>,
    /// Provider message id -> dedup key, for callback correlation.
    by_provider: Arc<DashMap<String, String>>,
}

impl DeliveryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a fresh queued record unless the key is already taken.
    /// Returns `false` when a record already existed.
    pub fn insert_new(&self, key: &str, record: DeliveryRecord) -> bool {
        match self.records.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(record);
                true
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<DeliveryRecord> {
        self.records.get(key).map(|r| r.clone())
    }

    pub fn key_for_provider(&self, provider_id: &str) -> Option<String> {
        self.by_provider.get(provider_id).map(|k| k.clone())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Applies a forward-only status transition. Returns `true` if the
    /// record moved; a same-or-backward transition is a no-op, not an error.
    pub fn transition(
        &self,
        key: &str,
        to: DeliveryStatus,
        at: DateTime<Utc>,
    ) -> MailwrightResult<bool> {
        let mut entry = self
            .records
            .get_mut(key)
            .ok_or_else(|| MailwrightError::NotFound(format!("delivery record {}", key)))?;

        if to.rank() <= entry.status.rank() {
            debug!(key, from = ?entry.status, to = ?to, "Ignoring non-forward transition");
            return Ok(false);
        }

        entry.status = to;
        entry.history.push(StatusChange { status: to, at });
        Ok(true)
    }

    /// Records provider acceptance: queued -> sent, with the provider id
    /// indexed for later callbacks.
    pub fn mark_sent(
        &self,
        key: &str,
        provider_id: &str,
        at: DateTime<Utc>,
    ) -> MailwrightResult<()> {
        {
            let mut entry = self
                .records
                .get_mut(key)
                .ok_or_else(|| MailwrightError::NotFound(format!("delivery record {}", key)))?;
            entry.attempts += 1;
            entry.provider_id = Some(provider_id.to_string());
            entry.failure_reason = None;
        }
        self.transition(key, DeliveryStatus::Sent, at)?;
        self.by_provider
            .insert(provider_id.to_string(), key.to_string());
        Ok(())
    }

    /// Notes a failed attempt while keeping the record queued for retry.
    pub fn note_attempt_failure(&self, key: &str, reason: &str) -> MailwrightResult<u32> {
        let mut entry = self
            .records
            .get_mut(key)
            .ok_or_else(|| MailwrightError::NotFound(format!("delivery record {}", key)))?;
        entry.attempts += 1;
        entry.failure_reason = Some(reason.to_string());
        Ok(entry.attempts)
    }

    /// Finalizes a record as failed (permanent error or retry exhaustion).
    pub fn fail_permanently(&self, key: &str, reason: &str) -> MailwrightResult<()> {
        {
            let mut entry = self
                .records
                .get_mut(key)
                .ok_or_else(|| MailwrightError::NotFound(format!("delivery record {}", key)))?;
            entry.failure_reason = Some(reason.to_string());
        }
        self.transition(key, DeliveryStatus::Failed, Utc::now())?;
        Ok(())
    }

    pub fn records(&self) -> Vec<DeliveryRecord> {
        self.records.iter().map(|r| r.clone()).collect()
    }

    pub fn for_ref(&self, send_ref: &SendRef) -> Vec<DeliveryRecord> {
        self.records
            .iter()
            .filter(|r| &r.send_ref == send_ref)
            .map(|r| r.clone())
            .collect()
    }

    pub fn find(&self, send_ref: &SendRef, contact_id: &Uuid) -> Option<DeliveryRecord> {
        self.records
            .iter()
            .find(|r| &r.send_ref == send_ref && &r.contact_id == contact_id)
            .map(|r| r.clone())
    }
}

/// CRUD store for campaign content plus the bulk-send status machine
/// (draft -> sending -> sent).
#[derive(Clone, Default)]
pub struct CampaignStore {
    campaigns: Arc<DashMap<Uuid, Campaign>>,
}

impl CampaignStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, mut campaign: Campaign) -> MailwrightResult<Uuid> {
        if campaign.name.trim().is_empty() {
            return Err(MailwrightError::Validation(
                "campaign name must not be empty".to_string(),
            ));
        }
        if campaign.subject.trim().is_empty() {
            return Err(MailwrightError::Validation(
                "campaign subject must not be empty".to_string(),
            ));
        }
        if campaign.html_content.trim().is_empty() {
            return Err(MailwrightError::Validation(
                "campaign html content must not be empty".to_string(),
            ));
        }
        campaign.status = CampaignStatus::Draft;
        campaign.sent_at = None;
        let id = campaign.id;
        info!(campaign_id = %id, name = %campaign.name, "Campaign created");
        self.campaigns.insert(id, campaign);
        Ok(id)
    }

    pub fn get(&self, id: &Uuid) -> Option<Campaign> {
        self.campaigns.get(id).map(|c| c.clone())
    }

    pub fn list(&self) -> Vec<Campaign> {
        self.campaigns.iter().map(|c| c.clone()).collect()
    }

    /// draft -> sending. Guards the sent-exactly-once bulk contract.
    pub fn begin_send(&self, id: &Uuid) -> MailwrightResult<Campaign> {
        let mut entry = self
            .campaigns
            .get_mut(id)
            .ok_or_else(|| MailwrightError::NotFound(format!("campaign {}", id)))?;
        if entry.status != CampaignStatus::Draft {
            return Err(MailwrightError::InvalidTransition(format!(
                "campaign {} is {:?}, only draft campaigns can be sent",
                id, entry.status
            )));
        }
        entry.status = CampaignStatus::Sending;
        entry.updated_at = Utc::now();
        Ok(entry.clone())
    }

    /// sending -> sent.
    pub fn finish_send(&self, id: &Uuid) -> MailwrightResult<()> {
        let mut entry = self
            .campaigns
            .get_mut(id)
            .ok_or_else(|| MailwrightError::NotFound(format!("campaign {}", id)))?;
        if entry.status != CampaignStatus::Sending {
            return Err(MailwrightError::InvalidTransition(format!(
                "campaign {} is {:?}, expected sending",
                id, entry.status
            )));
        }
        let now = Utc::now();
        entry.status = CampaignStatus::Sent;
        entry.sent_at = Some(now);
        entry.updated_at = now;
        Ok(())
    }
}
