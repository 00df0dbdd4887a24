use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;

use crate::error::ValidationError;

pub type UserId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Web,
    Android,
    Ios,
    Mac,
    Windows,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Web => "web",
            Platform::Android => "android",
            Platform::Ios => "ios",
            Platform::Mac => "mac",
            Platform::Windows => "windows",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "web" => Ok(Platform::Web),
            "android" => Ok(Platform::Android),
            "ios" => Ok(Platform::Ios),
            "mac" | "macos" => Ok(Platform::Mac),
            "windows" => Ok(Platform::Windows),
            other => Err(ValidationError::UnknownPlatform(other.to_string())),
        }
    }
}

/// Delivery channel for a device, fixed when the device registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Fcm,
    WebPush,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Fcm => "fcm",
            TransportKind::WebPush => "web_push",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fcm" => Ok(TransportKind::Fcm),
            "web_push" | "webpush" => Ok(TransportKind::WebPush),
            other => Err(ValidationError::UnknownTransportKind(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub device_id: String,
    pub platform: Platform,
    pub transport_kind: TransportKind,
    // Never echoed back over the API.
    #[serde(skip_serializing, default)]
    pub transport_credential: String,
    pub enabled: bool,
    pub last_active_at: OffsetDateTime,
    pub created_at: OffsetDateTime,
}

impl Device {
    /// Enabled and holding a usable credential.
    pub fn is_eligible(&self) -> bool {
        self.enabled && !self.transport_credential.trim().is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationCategory {
    Follows,
    PostsFromFollowed,
    CommentsOnMyPosts,
    LikesOnMyPosts,
    RepliesToMyComments,
}

/// Per-user opt-ins. An unset category counts as opted in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPreferences {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub follows: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub posts_from_followed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comments_on_my_posts: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub likes_on_my_posts: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replies_to_my_comments: Option<bool>,
}

impl NotificationPreferences {
    pub fn allows(&self, category: NotificationCategory) -> bool {
        let flag = match category {
            NotificationCategory::Follows => self.follows,
            NotificationCategory::PostsFromFollowed => self.posts_from_followed,
            NotificationCategory::CommentsOnMyPosts => self.comments_on_my_posts,
            NotificationCategory::LikesOnMyPosts => self.likes_on_my_posts,
            NotificationCategory::RepliesToMyComments => self.replies_to_my_comments,
        };
        flag.unwrap_or(true)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    NewPost,
    Comment,
    Reply,
    Like,
    Follow,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::NewPost => "new_post",
            EventKind::Comment => "comment",
            EventKind::Reply => "reply",
            EventKind::Like => "like",
            EventKind::Follow => "follow",
        }
    }

    /// The recipient-side opt-in checked for this event.
    pub fn category(&self) -> NotificationCategory {
        match self {
            EventKind::NewPost => NotificationCategory::PostsFromFollowed,
            EventKind::Comment => NotificationCategory::CommentsOnMyPosts,
            EventKind::Reply => NotificationCategory::RepliesToMyComments,
            EventKind::Like => NotificationCategory::LikesOnMyPosts,
            EventKind::Follow => NotificationCategory::Follows,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The post, comment or user an event is about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subject {
    pub id: String,
    /// Author of the post/comment, or the followed user.
    #[serde(default)]
    pub owner_id: Option<UserId>,
    /// Post containing the subject when the subject is a comment.
    #[serde(default)]
    pub post_id: Option<String>,
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(default)]
    pub actor_id: UserId,
    #[serde(default)]
    pub subject: Option<Subject>,
}

impl NotificationEvent {
    pub fn new(kind: EventKind, actor_id: impl Into<UserId>, subject: Subject) -> Self {
        Self {
            kind,
            actor_id: actor_id.into(),
            subject: Some(subject),
        }
    }

    /// Checks the event shape and hands back the subject.
    pub fn validate(&self) -> Result<&Subject, ValidationError> {
        if self.actor_id.trim().is_empty() {
            return Err(ValidationError::MissingActor);
        }
        let subject = self.subject.as_ref().ok_or(ValidationError::MissingSubject)?;
        if subject.id.trim().is_empty() {
            return Err(ValidationError::EmptyField("subject.id"));
        }
        if self.kind != EventKind::NewPost
            && subject.owner_id.as_deref().map_or(true, |o| o.trim().is_empty())
        {
            return Err(ValidationError::MissingSubjectOwner { kind: self.kind });
        }
        Ok(subject)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorProfile {
    pub id: UserId,
    pub display_name: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

/// Transport-agnostic notification. `data` stays flat and string-valued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    pub title: String,
    pub body: String,
    pub icon: String,
    pub data: BTreeMap<String, String>,
}

impl Payload {
    pub fn url(&self) -> &str {
        self.data.get("url").map(String::as_str).unwrap_or("/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subject(owner: Option<&str>) -> Subject {
        Subject {
            id: "post-1".to_string(),
            owner_id: owner.map(str::to_string),
            post_id: None,
            text: "hello".to_string(),
        }
    }

    #[test]
    fn unset_preferences_are_opted_in() {
        let prefs = NotificationPreferences::default();
        assert!(prefs.allows(NotificationCategory::Follows));
        assert!(prefs.allows(NotificationCategory::RepliesToMyComments));

        let prefs: NotificationPreferences =
            serde_json::from_str(r#"{"postsFromFollowed": false}"#).unwrap();
        assert!(!prefs.allows(NotificationCategory::PostsFromFollowed));
        assert!(prefs.allows(NotificationCategory::LikesOnMyPosts));
    }

    #[test]
    fn event_validation() {
        let event = NotificationEvent::new(EventKind::NewPost, "alice", subject(None));
        assert!(event.validate().is_ok());

        let event = NotificationEvent::new(EventKind::Comment, "alice", subject(None));
        assert_eq!(
            event.validate().unwrap_err(),
            ValidationError::MissingSubjectOwner {
                kind: EventKind::Comment
            }
        );

        let event = NotificationEvent::new(EventKind::Like, "  ", subject(Some("bob")));
        assert_eq!(event.validate().unwrap_err(), ValidationError::MissingActor);

        let event = NotificationEvent {
            kind: EventKind::Follow,
            actor_id: "alice".to_string(),
            subject: None,
        };
        assert_eq!(event.validate().unwrap_err(), ValidationError::MissingSubject);
    }

    #[test]
    fn event_deserializes_from_wire_shape() {
        let event: NotificationEvent = serde_json::from_str(
            r#"{"type":"reply","actorId":"carol","subject":{"id":"c-9","ownerId":"bob","postId":"p-3","text":"agreed"}}"#,
        )
        .unwrap();
        assert_eq!(event.kind, EventKind::Reply);
        let subject = event.validate().unwrap();
        assert_eq!(subject.post_id.as_deref(), Some("p-3"));
    }

    #[test]
    fn platform_parsing() {
        assert_eq!("Android".parse::<Platform>().unwrap(), Platform::Android);
        assert_eq!("macos".parse::<Platform>().unwrap(), Platform::Mac);
        assert!("blackberry".parse::<Platform>().is_err());
        assert_eq!("web_push".parse::<TransportKind>().unwrap(), TransportKind::WebPush);
    }
}
