//! Persistence accessors for the backend tables.  Each method is a single round trip; nothing spans more than one
//! table transactionally, so uniqueness is the only invariant the storage layer enforces for us.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
    error::ApiError,
    models::{
        Artist, Event, NewArtist, NewEvent, NewIssueReport, Platform, Profile, PushToken,
    },
};

pub mod memory;
pub mod supabase_store;

pub use memory::MemoryStore;
pub use supabase_store::SupabaseStore;

/// Result of upserting a batch of events, split by whether the row existed beforehand
#[derive(Debug, Default, Clone)]
pub struct UpsertOutcome {
    pub inserted: Vec<Event>,
    pub updated: Vec<Event>,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn find_artist_by_spotify_id(&self, spotify_id: &str) -> Result<Option<Artist>, ApiError>;

    async fn find_artist(&self, artist_id: Uuid) -> Result<Option<Artist>, ApiError>;

    /// Fails with `ApiError::Duplicate` if an artist with the same Spotify id exists
    async fn insert_artist(&self, artist: &NewArtist) -> Result<Artist, ApiError>;

    /// Overwrites the provided (non-`None`) columns of an existing artist
    async fn update_artist(&self, artist_id: Uuid, artist: &NewArtist) -> Result<Artist, ApiError>;

    async fn set_ticketmaster_id(&self, artist_id: Uuid, ticketmaster_id: &str) -> Result<(), ApiError>;

    /// Every artist that at least one user follows
    async fn artists_with_followers(&self) -> Result<Vec<Artist>, ApiError>;

    /// Fails with `ApiError::Duplicate` if the user already follows the artist
    async fn insert_follow(&self, user_id: Uuid, artist_id: Uuid) -> Result<(), ApiError>;

    /// Returns the number of removed rows
    async fn delete_follow(&self, user_id: Uuid, artist_id: Uuid) -> Result<usize, ApiError>;

    async fn is_following(&self, user_id: Uuid, artist_id: Uuid) -> Result<bool, ApiError>;

    async fn followed_artists(&self, user_id: Uuid) -> Result<Vec<Artist>, ApiError>;

    async fn follower_ids(&self, artist_id: Uuid) -> Result<Vec<Uuid>, ApiError>;

    /// Upserts keyed on `external_id`
    async fn upsert_events(&self, events: &[NewEvent]) -> Result<UpsertOutcome, ApiError>;

    /// Events for any of the artists on or after `from`, ascending by date
    async fn events_for_artists(
        &self,
        artist_ids: &[Uuid],
        from: DateTime<Utc>,
    ) -> Result<Vec<Event>, ApiError>;

    /// Returns the number of removed rows
    async fn delete_events_before(&self, cutoff: DateTime<Utc>) -> Result<usize, ApiError>;

    /// Upserts keyed on `(user_id, platform)`
    async fn upsert_push_token(&self, user_id: Uuid, token: &str, platform: Platform) -> Result<(), ApiError>;

    /// Deletes the user's tokens for one platform, or all of them when `platform` is `None`
    async fn delete_push_tokens(&self, user_id: Uuid, platform: Option<Platform>) -> Result<usize, ApiError>;

    /// Deletes a token wherever it is registered; used once the push service reports it as dead
    async fn delete_push_token_value(&self, token: &str) -> Result<usize, ApiError>;

    async fn push_tokens_for_users(&self, user_ids: &[Uuid]) -> Result<Vec<PushToken>, ApiError>;

    async fn get_profile(&self, user_id: Uuid) -> Result<Option<Profile>, ApiError>;

    async fn upsert_profile(&self, profile: &Profile) -> Result<Profile, ApiError>;

    async fn insert_issue_report(&self, report: &NewIssueReport) -> Result<(), ApiError>;
}
