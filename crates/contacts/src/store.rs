use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tracing::{debug, info};
use uuid::Uuid;

use mailwright_core::types::{Contact, ContactSource, SubscriptionStatus};
use mailwright_core::{MailwrightError, MailwrightResult};

/// In-memory contact store. Mutations go through `update_with`, which holds
/// the entry lock for the whole read-modify-write and bumps the version
/// counter, so tag changes racing with scheduler ticks can't lose writes.
#[derive(Clone, Default)]
pub struct ContactStore {
    contacts: Arc<DashMap<Uuid, Contact>>,
    /// Lowercased email -> contact id. Uniqueness is enforced here.
    email_index: Arc<DashMap<String, Uuid>>,
}

impl ContactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(
        &self,
        email: &str,
        first_name: Option<String>,
        last_name: Option<String>,
        source: ContactSource,
    ) -> MailwrightResult<Contact> {
        let email = email.trim();
        if email.is_empty() || !email.contains('@') {
            return Err(MailwrightError::Validation(format!(
                "invalid contact email {:?}",
                email
            )));
        }

        let key = email.to_lowercase();
        let id = Uuid::new_v4();

        // The index entry is the uniqueness gate; occupied means conflict.
        match self.email_index.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(MailwrightError::Conflict(format!(
                    "contact with email {} already exists",
                    key
                )));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(id);
            }
        }

        let now = Utc::now();
        let contact = Contact {
            id,
            email: email.to_string(),
            first_name,
            last_name,
            status: SubscriptionStatus::Subscribed,
            tags: BTreeSet::new(),
            source,
            created_at: now,
            updated_at: now,
            version: 1,
        };

        info!(contact_id = %id, email = %key, "Contact created");
        self.contacts.insert(id, contact.clone());
        Ok(contact)
    }

    pub fn get(&self, id: &Uuid) -> Option<Contact> {
        self.contacts.get(id).map(|c| c.clone())
    }

    pub fn get_by_email(&self, email: &str) -> Option<Contact> {
        let key = email.trim().to_lowercase();
        let id = *self.email_index.get(&key)?;
        self.get(&id)
    }

    pub fn list(&self) -> Vec<Contact> {
        self.contacts.iter().map(|c| c.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    /// Read-modify-write under the entry lock. The closure sees the current
    /// state; on success the version counter and `updated_at` are bumped.
    pub fn update_with<F>(&self, id: &Uuid, mutate: F) -> MailwrightResult<Contact>
    where
        F: FnOnce(&mut Contact) -> MailwrightResult<()>,
    {
        let mut entry = self
            .contacts
            .get_mut(id)
            .ok_or_else(|| MailwrightError::NotFound(format!("contact {}", id)))?;

        mutate(entry.value_mut())?;
        entry.version += 1;
        entry.updated_at = Utc::now();
        Ok(entry.clone())
    }

    /// Adds a tag. Returns `true` if the tag was not already present.
    pub fn add_tag(&self, id: &Uuid, tag: &str) -> MailwrightResult<bool> {
        let tag = tag.trim();
        if tag.is_empty() {
            return Err(MailwrightError::Validation("empty tag".to_string()));
        }
        let mut added = false;
        self.update_with(id, |contact| {
            added = contact.tags.insert(tag.to_string());
            Ok(())
        })?;
        debug!(contact_id = %id, tag = %tag, added, "Tag applied");
        Ok(added)
    }

    pub fn remove_tag(&self, id: &Uuid, tag: &str) -> MailwrightResult<bool> {
        let mut removed = false;
        self.update_with(id, |contact| {
            removed = contact.tags.remove(tag);
            Ok(())
        })?;
        Ok(removed)
    }

    /// One-way transition to `Unsubscribed`. Returns `true` if the status
    /// actually changed; terminal states are never overwritten.
    pub fn mark_unsubscribed(&self, id: &Uuid) -> MailwrightResult<bool> {
        self.terminal_transition(id, SubscriptionStatus::Unsubscribed)
    }

    /// One-way transition to `Bounced`.
    pub fn mark_bounced(&self, id: &Uuid) -> MailwrightResult<bool> {
        self.terminal_transition(id, SubscriptionStatus::Bounced)
    }

    fn terminal_transition(&self, id: &Uuid, to: SubscriptionStatus) -> MailwrightResult<bool> {
        let mut changed = false;
        self.update_with(id, |contact| {
            if contact.status == SubscriptionStatus::Subscribed {
                contact.status = to;
                changed = true;
            }
            Ok(())
        })?;
        if changed {
            info!(contact_id = %id, status = ?to, "Contact subscription ended");
        }
        Ok(changed)
    }

    /// Resolves the recipient segment for a bulk send: subscribed contacts
    /// carrying at least one of `tags`, or all subscribed contacts when
    /// `tags` is empty. Evaluated at send time, never at authoring time.
    pub fn subscribed_matching_tags(&self, tags: &BTreeSet<String>) -> Vec<Contact> {
        self.contacts
            .iter()
            .filter(|c| c.is_subscribed())
            .filter(|c| tags.is_empty() || c.tags.iter().any(|t| tags.contains(t)))
            .map(|c| c.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_contact() -> (ContactStore, Contact) {
        let store = ContactStore::new();
        let contact = store
            .create("Ada@Example.com", Some("Ada".into()), None, ContactSource::Form)
            .unwrap();
        (store, contact)
    }

    #[test]
    fn email_uniqueness_is_case_insensitive() {
        let (store, _) = store_with_contact();
        let err = store
            .create("ada@example.COM", None, None, ContactSource::Api)
            .unwrap_err();
        assert!(matches!(err, MailwrightError::Conflict(_)));

        assert!(store.get_by_email("ADA@EXAMPLE.COM").is_some());
    }

    #[test]
    fn update_bumps_version() {
        let (store, contact) = store_with_contact();
        assert_eq!(contact.version, 1);

        store.add_tag(&contact.id, "vip").unwrap();
        let updated = store.get(&contact.id).unwrap();
        assert_eq!(updated.version, 2);
        assert!(updated.tags.contains("vip"));

        // Re-adding the same tag is not an error, just not "added".
        assert!(!store.add_tag(&contact.id, "vip").unwrap());
    }

    #[test]
    fn unsubscribe_is_terminal() {
        let (store, contact) = store_with_contact();

        assert!(store.mark_unsubscribed(&contact.id).unwrap());
        assert!(!store.mark_unsubscribed(&contact.id).unwrap());

        // A bounce never resurrects or replaces a terminal status.
        assert!(!store.mark_bounced(&contact.id).unwrap());
        assert_eq!(
            store.get(&contact.id).unwrap().status,
            SubscriptionStatus::Unsubscribed
        );
    }

    #[test]
    fn segment_resolution_filters_by_tag_and_status() {
        let store = ContactStore::new();
        let a = store.create("a@example.com", None, None, ContactSource::Form).unwrap();
        let b = store.create("b@example.com", None, None, ContactSource::Form).unwrap();
        let c = store.create("c@example.com", None, None, ContactSource::Form).unwrap();

        store.add_tag(&a.id, "newsletter").unwrap();
        store.add_tag(&b.id, "newsletter").unwrap();
        store.mark_unsubscribed(&b.id).unwrap();
        store.add_tag(&c.id, "clients").unwrap();

        let tags: BTreeSet<String> = ["newsletter".to_string()].into();
        let segment = store.subscribed_matching_tags(&tags);
        assert_eq!(segment.len(), 1);
        assert_eq!(segment[0].id, a.id);

        // Empty tag set means every subscribed contact.
        let all = store.subscribed_matching_tags(&BTreeSet::new());
        assert_eq!(all.len(), 2);
    }
}
