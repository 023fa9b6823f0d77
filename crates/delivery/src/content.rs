//! Merge-field rendering. Substitutes `{{first_name}}`, `{{email}}` and
//! `{{unsubscribe_url}}` into campaign content and enforces the compliance
//! rule that every rendered HTML body carries the unsubscribe link.

use mailwright_core::mailer::OutboundEmail;
use mailwright_core::types::{Campaign, Contact};
use mailwright_core::{MailwrightError, MailwrightResult};

const FIRST_NAME_FALLBACK: &str = "there";

/// Renders campaign content for one recipient. Fails with a validation
/// error when the rendered HTML does not contain the unsubscribe URL —
/// that send must never reach the mailer.
pub fn render(
    campaign: &Campaign,
    contact: &Contact,
    unsubscribe_url: &str,
) -> MailwrightResult<OutboundEmail> {
    let first_name = contact
        .first_name
        .as_deref()
        .filter(|n| !n.trim().is_empty())
        .unwrap_or(FIRST_NAME_FALLBACK);

    let subject = substitute(&campaign.subject, first_name, &contact.email, unsubscribe_url);
    let html = substitute(
        &campaign.html_content,
        first_name,
        &contact.email,
        unsubscribe_url,
    );
    let text = substitute(
        &campaign.text_content,
        first_name,
        &contact.email,
        unsubscribe_url,
    );

    if !html.contains(unsubscribe_url) {
        return Err(MailwrightError::Validation(format!(
            "campaign {} rendered without an unsubscribe link",
            campaign.id
        )));
    }

    Ok(OutboundEmail {
        contact_id: contact.id,
        to: contact.email.clone(),
        subject,
        html,
        text,
    })
}

/// Expands the per-contact unsubscribe URL from the configured template.
pub fn unsubscribe_url(base_url: &str, contact: &Contact) -> String {
    base_url.replace("{contact_id}", &contact.id.to_string())
}

fn substitute(template: &str, first_name: &str, email: &str, unsubscribe_url: &str) -> String {
    template
        .replace("{{first_name}}", first_name)
        .replace("{{email}}", email)
        .replace("{{unsubscribe_url}}", unsubscribe_url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use mailwright_core::types::{ContactSource, SubscriptionStatus};
    use std::collections::BTreeSet;
    use uuid::Uuid;

    fn contact(first_name: Option<&str>) -> Contact {
        let now = Utc::now();
        Contact {
            id: Uuid::new_v4(),
            email: "ada@example.com".to_string(),
            first_name: first_name.map(String::from),
            last_name: None,
            status: SubscriptionStatus::Subscribed,
            tags: BTreeSet::new(),
            source: ContactSource::Form,
            created_at: now,
            updated_at: now,
            version: 1,
        }
    }

    fn campaign(html: &str) -> Campaign {
        let now = Utc::now();
        Campaign {
            id: Uuid::new_v4(),
            name: "Welcome".to_string(),
            subject: "Hi {{first_name}}".to_string(),
            html_content: html.to_string(),
            text_content: "Hi {{first_name}}, unsubscribe: {{unsubscribe_url}}".to_string(),
            status: mailwright_core::types::CampaignStatus::Draft,
            tags: BTreeSet::new(),
            created_at: now,
            updated_at: now,
            sent_at: None,
        }
    }

    #[test]
    fn merge_fields_are_substituted() {
        let contact = contact(Some("Ada"));
        let url = unsubscribe_url("https://x.test/u/{contact_id}", &contact);
        assert!(url.contains(&contact.id.to_string()));

        let rendered = render(
            &campaign("<p>Hello {{first_name}}</p><a href=\"{{unsubscribe_url}}\">bye</a>"),
            &contact,
            &url,
        )
        .unwrap();
        assert_eq!(rendered.subject, "Hi Ada");
        assert!(rendered.html.contains("Hello Ada"));
        assert!(rendered.html.contains(&url));
    }

    #[test]
    fn missing_first_name_falls_back() {
        let contact = contact(None);
        let url = unsubscribe_url("https://x.test/u/{contact_id}", &contact);
        let rendered = render(
            &campaign("<p>Hello {{first_name}}</p>{{unsubscribe_url}}"),
            &contact,
            &url,
        )
        .unwrap();
        assert_eq!(rendered.subject, "Hi there");
    }

    #[test]
    fn missing_unsubscribe_link_blocks_the_send() {
        let contact = contact(Some("Ada"));
        let url = unsubscribe_url("https://x.test/u/{contact_id}", &contact);
        let err = render(&campaign("<p>No way out</p>"), &contact, &url).unwrap_err();
        assert!(matches!(err, MailwrightError::Validation(_)));
    }
}
