//! Domain model structs exchanged with the remote data gateway.
//!
//! The structs in this module come in two flavours: *records* are the raw
//! rows the gateway stores and echoes back over change subscriptions, and
//! *view models* ([`Message`], [`Post`]) are what the sync engines hand to
//! the UI after attaching denormalised data (sender profiles, upvote
//! aggregates).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::UserId;

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// The authenticated identity behind a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
    pub email: String,
}

/// An established authentication session.
///
/// Created on sign-in/sign-up or rehydrated at startup, destroyed on
/// sign-out or expiry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    /// Opaque bearer token minted by the identity provider.
    pub token: String,
    /// When the token stops being accepted.
    pub expires_at: DateTime<Utc>,
    pub identity: Identity,
}

impl Session {
    pub fn user_id(&self) -> UserId {
        self.identity.user_id
    }
}

// ---------------------------------------------------------------------------
// Profile
// ---------------------------------------------------------------------------

/// One profile row per authenticated identity.
///
/// Fetched lazily after session creation; only mutated through an explicit
/// round-trip update (`updateProfile`), never optimistically.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Profile {
    /// Same UUID as the owning identity.
    pub id: UserId,
    pub email: String,
    pub name: String,
    pub username: String,
    pub avatar_url: Option<String>,
    pub bio: Option<String>,
    /// Whether this account was enrolled in the beta programme at sign-up.
    pub is_beta_tester: bool,
    pub created_at: DateTime<Utc>,
}

/// Fields the user supplies at registration, beyond the credentials.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewProfile {
    pub name: String,
    pub username: String,
}

/// Partial profile update. Only the populated fields are written.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProfilePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bio: Option<String>,
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A direct message between two users.
///
/// A conversation is identified by the unordered pair
/// `{sender_id, receiver_id}`; within it, display order is `created_at`
/// ascending and message ids are unique (assigned by the gateway, never
/// reused).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: Uuid,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub text: String,
    pub read: bool,
    pub created_at: DateTime<Utc>,
    /// Sender profile, attached by the thread engine for display.
    /// Not stored in the gateway row.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<Profile>,
}

/// Write-side shape for `send`. The gateway assigns id and timestamp.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewMessage {
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub text: String,
    pub read: bool,
}

// ---------------------------------------------------------------------------
// Post
// ---------------------------------------------------------------------------

/// The raw post row as stored by the gateway.
///
/// Insert events carry this shape; author and upvote information must be
/// assembled separately before the post is surfaced in the feed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PostRecord {
    pub id: Uuid,
    pub author_id: UserId,
    pub content: String,
    pub image_url: Option<String>,
    pub video_url: Option<String>,
    pub comment_count: u32,
    pub share_count: u32,
    pub created_at: DateTime<Utc>,
}

/// A feed entry: post row plus the denormalised data the UI renders.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Post {
    pub id: Uuid,
    pub author_id: UserId,
    pub content: String,
    pub image_url: Option<String>,
    pub video_url: Option<String>,
    pub comment_count: u32,
    pub share_count: u32,
    pub created_at: DateTime<Utc>,
    pub upvote_count: u32,
    pub viewer_has_upvoted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<Profile>,
}

impl Post {
    /// Combine a raw record with its assembled aggregates.
    pub fn from_record(
        record: PostRecord,
        author: Option<Profile>,
        upvote_count: u32,
        viewer_has_upvoted: bool,
    ) -> Self {
        Self {
            id: record.id,
            author_id: record.author_id,
            content: record.content,
            image_url: record.image_url,
            video_url: record.video_url,
            comment_count: record.comment_count,
            share_count: record.share_count,
            created_at: record.created_at,
            upvote_count,
            viewer_has_upvoted,
            author,
        }
    }
}

/// Write-side shape for `createPost`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewPost {
    pub author_id: UserId,
    pub content: String,
    pub image_url: Option<String>,
    pub video_url: Option<String>,
    pub comment_count: u32,
    pub share_count: u32,
}

impl NewPost {
    pub fn text(author_id: UserId, content: impl Into<String>) -> Self {
        Self {
            author_id,
            content: content.into(),
            image_url: None,
            video_url: None,
            comment_count: 0,
            share_count: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Upvote
// ---------------------------------------------------------------------------

/// A single upvote. At most one row may exist per `(user_id, post_id)`
/// pair; the feed engine's toggle operation enforces this.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Upvote {
    pub id: Uuid,
    pub user_id: UserId,
    pub post_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// Write-side shape for the toggle's insert branch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewUpvote {
    pub user_id: UserId,
    pub post_id: Uuid,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_patch_serializes_only_set_fields() {
        let patch = ProfilePatch {
            bio: Some("hi".to_string()),
            ..Default::default()
        };
        let value = serde_json::to_value(&patch).unwrap();
        let map = value.as_object().unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map["bio"], "hi");
    }

    #[test]
    fn message_row_round_trip_without_sender() {
        let msg = Message {
            id: Uuid::new_v4(),
            sender_id: UserId::new(),
            receiver_id: UserId::new(),
            text: "oi".to_string(),
            read: false,
            created_at: Utc::now(),
            sender: None,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert!(value.get("sender").is_none());
        let back: Message = serde_json::from_value(value).unwrap();
        assert_eq!(back, msg);
    }
}
