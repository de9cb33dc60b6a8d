use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(raw: impl Into<String>) -> Self {
                Self(raw.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(RoomId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Offline,
}

impl PresenceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceStatus::Online => "online",
            PresenceStatus::Offline => "offline",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserIdentity {
    pub id: UserId,
    pub name: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

/// Sidebar projection of a two-party room: the other participant plus a
/// preview of the most recent message, if any.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomSummary {
    pub room_id: RoomId,
    pub other_participant: UserIdentity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_preview: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    Text,
    Image,
}

const IMAGE_SUFFIXES: &[&str] = &[".gif", ".png", ".jpg", ".jpeg", ".webp"];
const IMAGE_HOSTS: &[&str] = &["giphy.com", "tenor.com"];

/// Classifies a message body as plain text or an image/GIF URL. Purely a
/// function of the string; nothing about the classification is stored.
pub fn classify_body(body: &str) -> BodyKind {
    let lowered = body.trim().to_ascii_lowercase();
    if !(lowered.starts_with("http://") || lowered.starts_with("https://")) {
        return BodyKind::Text;
    }
    let without_query = lowered.split(['?', '#']).next().unwrap_or(&lowered);
    if IMAGE_SUFFIXES
        .iter()
        .any(|suffix| without_query.ends_with(suffix))
    {
        return BodyKind::Image;
    }
    if IMAGE_HOSTS.iter().any(|host| lowered.contains(host)) {
        return BodyKind::Image;
    }
    BodyKind::Text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn giphy_url_is_image() {
        assert_eq!(
            classify_body("https://media.giphy.com/x.gif"),
            BodyKind::Image
        );
    }

    #[test]
    fn known_host_without_suffix_is_image() {
        assert_eq!(
            classify_body("https://media.tenor.com/abc123/view"),
            BodyKind::Image
        );
    }

    #[test]
    fn suffix_match_ignores_query_string() {
        assert_eq!(
            classify_body("https://example.com/cat.png?w=320"),
            BodyKind::Image
        );
    }

    #[test]
    fn plain_text_is_text() {
        assert_eq!(classify_body("see you at giphy HQ"), BodyKind::Text);
        assert_eq!(classify_body("hello"), BodyKind::Text);
    }

    #[test]
    fn non_image_url_is_text() {
        assert_eq!(classify_body("https://example.com/post/42"), BodyKind::Text);
    }
}
