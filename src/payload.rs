use std::collections::BTreeMap;

use crate::error::ValidationError;
use crate::models::{ActorProfile, EventKind, NotificationEvent, Payload};

pub const DEFAULT_ICON: &str = "/icons/notification-192.png";

const NEW_POST_BODY_LIMIT: usize = 100;
const SHORT_BODY_LIMIT: usize = 50;
const ELLIPSIS: &str = "...";

/// Cuts `text` to at most `limit` characters, ending in "..." when cut.
pub fn truncate(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let keep = limit.saturating_sub(ELLIPSIS.len());
    let mut out: String = text.chars().take(keep).collect();
    out.push_str(ELLIPSIS);
    out
}

/// Display data used when the actor's profile can't be loaded.
pub fn anonymous_actor(actor_id: &str) -> ActorProfile {
    ActorProfile {
        id: actor_id.to_string(),
        display_name: "Someone".to_string(),
        avatar_url: None,
    }
}

/// Turns an event plus actor display data into a flat payload. Built once
/// per event and shared by every device send.
#[derive(Debug, Clone)]
pub struct PayloadBuilder {
    default_icon: String,
}

impl Default for PayloadBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_ICON)
    }
}

impl PayloadBuilder {
    pub fn new(default_icon: impl Into<String>) -> Self {
        Self {
            default_icon: default_icon.into(),
        }
    }

    pub fn build(
        &self,
        event: &NotificationEvent,
        actor: &ActorProfile,
    ) -> Result<Payload, ValidationError> {
        let subject = event.validate()?;
        let name = actor.display_name.trim();
        let name = if name.is_empty() { "Someone" } else { name };

        let post_id = match event.kind {
            EventKind::NewPost | EventKind::Comment | EventKind::Like => Some(subject.id.clone()),
            EventKind::Reply => Some(subject.post_id.clone().unwrap_or_else(|| subject.id.clone())),
            EventKind::Follow => None,
        };

        let (title, body, url) = match event.kind {
            EventKind::NewPost => (
                format!("New post from {name}"),
                truncate(&subject.text, NEW_POST_BODY_LIMIT),
                "/feed".to_string(),
            ),
            EventKind::Comment => (
                format!("{name} commented on your post"),
                truncate(&subject.text, SHORT_BODY_LIMIT),
                post_url(post_id.as_deref()),
            ),
            EventKind::Reply => (
                format!("{name} replied to your comment"),
                truncate(&subject.text, SHORT_BODY_LIMIT),
                post_url(post_id.as_deref()),
            ),
            EventKind::Like => (
                format!("{name} liked your post"),
                truncate(&subject.text, SHORT_BODY_LIMIT),
                post_url(post_id.as_deref()),
            ),
            EventKind::Follow => (
                "New follower".to_string(),
                format!("{name} started following you"),
                format!("/profile/{}", event.actor_id),
            ),
        };

        let icon = actor
            .avatar_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .unwrap_or(self.default_icon.as_str())
            .to_string();

        let mut data = BTreeMap::new();
        data.insert("type".to_string(), event.kind.as_str().to_string());
        if let Some(post_id) = post_id {
            data.insert("postId".to_string(), post_id);
        }
        data.insert("authorId".to_string(), event.actor_id.clone());
        data.insert("url".to_string(), url);

        Ok(Payload {
            title,
            body,
            icon,
            data,
        })
    }
}

fn post_url(post_id: Option<&str>) -> String {
    format!("/posts/{}", post_id.unwrap_or_default())
}
