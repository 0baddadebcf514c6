use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fnv::FnvHashSet as HashSet;
use uuid::Uuid;

use super::{Store, UpsertOutcome};
use crate::{
    error::ApiError,
    models::{
        Artist, Event, NewArtist, NewEvent, NewIssueReport, Platform, Profile, PushToken,
    },
    supabase::{eq, gte, in_list, lt, SupabaseClient},
};

const ARTISTS: &str = "artists";
const EVENTS: &str = "events";
const FOLLOWED_ARTISTS: &str = "followed_artists";
const PUSH_TOKENS: &str = "push_tokens";
const PROFILES: &str = "profiles";
const ISSUE_REPORTS: &str = "issue_reports";

#[derive(Deserialize)]
struct FollowRow {
    #[serde(default)]
    artists: Option<Artist>,
}

#[derive(Deserialize)]
struct UserIdRow {
    user_id: Uuid,
}

#[derive(Deserialize)]
struct ExternalIdRow {
    external_id: String,
}

#[derive(Serialize)]
struct NewFollowRow {
    user_id: Uuid,
    artist_id: Uuid,
}

#[derive(Serialize)]
struct NewPushTokenRow<'a> {
    user_id: Uuid,
    token: &'a str,
    platform: Platform,
    updated_at: DateTime<Utc>,
}

pub struct SupabaseStore {
    client: Arc<SupabaseClient>,
}

impl SupabaseStore {
    pub fn new(client: Arc<SupabaseClient>) -> Self { SupabaseStore { client } }
}

fn first_row<T>(rows: Vec<T>, what: impl FnOnce() -> String) -> Result<T, ApiError> {
    rows.into_iter().next().ok_or_else(|| ApiError::NotFound(what()))
}

#[async_trait]
impl Store for SupabaseStore {
    async fn find_artist_by_spotify_id(&self, spotify_id: &str) -> Result<Option<Artist>, ApiError> {
        let rows: Vec<Artist> = self
            .client
            .select(ARTISTS, "*", &[eq("spotify_id", spotify_id)], None)
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn find_artist(&self, artist_id: Uuid) -> Result<Option<Artist>, ApiError> {
        let rows: Vec<Artist> = self
            .client
            .select(ARTISTS, "*", &[eq("id", artist_id)], None)
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn insert_artist(&self, artist: &NewArtist) -> Result<Artist, ApiError> {
        let rows: Vec<Artist> = self.client.insert(ARTISTS, artist).await?;
        first_row(rows, || format!("inserted artist {}", artist.spotify_id))
    }

    async fn update_artist(&self, artist_id: Uuid, artist: &NewArtist) -> Result<Artist, ApiError> {
        let rows: Vec<Artist> = self
            .client
            .update(ARTISTS, &[eq("id", artist_id)], artist)
            .await?;
        first_row(rows, || format!("artist {}", artist_id))
    }

    async fn set_ticketmaster_id(&self, artist_id: Uuid, ticketmaster_id: &str) -> Result<(), ApiError> {
        let patch = serde_json::json!({
            "ticketmaster_id": ticketmaster_id,
            "updated_at": Utc::now(),
        });
        let rows: Vec<Artist> = self
            .client
            .update(ARTISTS, &[eq("id", artist_id)], &patch)
            .await?;
        first_row(rows, || format!("artist {}", artist_id)).map(|_| ())
    }

    async fn artists_with_followers(&self) -> Result<Vec<Artist>, ApiError> {
        // The inner join drops artists without any `followed_artists` rows
        self.client
            .select(ARTISTS, "*,followed_artists!inner(user_id)", &[], None)
            .await
    }

    async fn insert_follow(&self, user_id: Uuid, artist_id: Uuid) -> Result<(), ApiError> {
        let _: Vec<serde_json::Value> = self
            .client
            .insert(FOLLOWED_ARTISTS, &NewFollowRow { user_id, artist_id })
            .await?;
        Ok(())
    }

    async fn delete_follow(&self, user_id: Uuid, artist_id: Uuid) -> Result<usize, ApiError> {
        let deleted: Vec<serde_json::Value> = self
            .client
            .delete(
                FOLLOWED_ARTISTS,
                &[eq("user_id", user_id), eq("artist_id", artist_id)],
            )
            .await?;
        Ok(deleted.len())
    }

    async fn is_following(&self, user_id: Uuid, artist_id: Uuid) -> Result<bool, ApiError> {
        let rows: Vec<UserIdRow> = self
            .client
            .select(
                FOLLOWED_ARTISTS,
                "user_id",
                &[eq("user_id", user_id), eq("artist_id", artist_id)],
                None,
            )
            .await?;
        Ok(!rows.is_empty())
    }

    async fn followed_artists(&self, user_id: Uuid) -> Result<Vec<Artist>, ApiError> {
        let rows: Vec<FollowRow> = self
            .client
            .select(
                FOLLOWED_ARTISTS,
                "artist_id,artists(*)",
                &[eq("user_id", user_id)],
                None,
            )
            .await?;

        let mut artists: Vec<Artist> = rows.into_iter().filter_map(|row| row.artists).collect();
        artists.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(artists)
    }

    async fn follower_ids(&self, artist_id: Uuid) -> Result<Vec<Uuid>, ApiError> {
        let rows: Vec<UserIdRow> = self
            .client
            .select(FOLLOWED_ARTISTS, "user_id", &[eq("artist_id", artist_id)], None)
            .await?;
        Ok(rows.into_iter().map(|row| row.user_id).collect())
    }

    async fn upsert_events(&self, events: &[NewEvent]) -> Result<UpsertOutcome, ApiError> {
        if events.is_empty() {
            return Ok(UpsertOutcome::default());
        }

        // Look up which of these events we already have so that newly announced ones can be told apart
        let external_ids: Vec<&str> = events.iter().map(|event| event.external_id.as_str()).collect();
        let existing: Vec<ExternalIdRow> = self
            .client
            .select(EVENTS, "external_id", &[in_list("external_id", &external_ids)], None)
            .await?;
        let existing: HashSet<String> = existing.into_iter().map(|row| row.external_id).collect();

        let rows: Vec<Event> = self.client.upsert(EVENTS, events, "external_id").await?;
        let (updated, inserted): (Vec<Event>, Vec<Event>) = rows
            .into_iter()
            .partition(|event| existing.contains(&event.external_id));
        Ok(UpsertOutcome { inserted, updated })
    }

    async fn events_for_artists(
        &self,
        artist_ids: &[Uuid],
        from: DateTime<Utc>,
    ) -> Result<Vec<Event>, ApiError> {
        if artist_ids.is_empty() {
            return Ok(Vec::new());
        }

        self.client
            .select(
                EVENTS,
                "*",
                &[
                    in_list("artist_id", artist_ids),
                    gte("event_date", from.to_rfc3339()),
                ],
                Some("event_date.asc"),
            )
            .await
    }

    async fn delete_events_before(&self, cutoff: DateTime<Utc>) -> Result<usize, ApiError> {
        let deleted: Vec<ExternalIdRow> = self
            .client
            .delete(EVENTS, &[lt("event_date", cutoff.to_rfc3339())])
            .await?;
        Ok(deleted.len())
    }

    async fn upsert_push_token(&self, user_id: Uuid, token: &str, platform: Platform) -> Result<(), ApiError> {
        let row = NewPushTokenRow {
            user_id,
            token,
            platform,
            updated_at: Utc::now(),
        };
        let _: Vec<serde_json::Value> = self
            .client
            .upsert(PUSH_TOKENS, &[row], "user_id,platform")
            .await?;
        Ok(())
    }

    async fn delete_push_tokens(&self, user_id: Uuid, platform: Option<Platform>) -> Result<usize, ApiError> {
        let mut filters = vec![eq("user_id", user_id)];
        if let Some(platform) = platform {
            filters.push(eq("platform", platform.as_str()));
        }

        let deleted: Vec<serde_json::Value> = self.client.delete(PUSH_TOKENS, &filters).await?;
        Ok(deleted.len())
    }

    async fn delete_push_token_value(&self, token: &str) -> Result<usize, ApiError> {
        let deleted: Vec<serde_json::Value> =
            self.client.delete(PUSH_TOKENS, &[eq("token", token)]).await?;
        Ok(deleted.len())
    }

    async fn push_tokens_for_users(&self, user_ids: &[Uuid]) -> Result<Vec<PushToken>, ApiError> {
        if user_ids.is_empty() {
            return Ok(Vec::new());
        }

        self.client
            .select(PUSH_TOKENS, "*", &[in_list("user_id", user_ids)], None)
            .await
    }

    async fn get_profile(&self, user_id: Uuid) -> Result<Option<Profile>, ApiError> {
        let rows: Vec<Profile> = self
            .client
            .select(PROFILES, "*", &[eq("id", user_id)], None)
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn upsert_profile(&self, profile: &Profile) -> Result<Profile, ApiError> {
        let mut row = profile.clone();
        row.updated_at = Some(Utc::now());
        let rows: Vec<Profile> = self.client.upsert(PROFILES, &[row], "id").await?;
        first_row(rows, || format!("profile {}", profile.id))
    }

    async fn insert_issue_report(&self, report: &NewIssueReport) -> Result<(), ApiError> {
        let _: Vec<serde_json::Value> = self.client.insert(ISSUE_REPORTS, report).await?;
        Ok(())
    }
}
