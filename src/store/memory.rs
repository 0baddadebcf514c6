//! In-process `Store` used when no Supabase project is configured, and by the tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use uuid::Uuid;

use super::{Store, UpsertOutcome};
use crate::{
    error::ApiError,
    models::{
        Artist, Event, FollowedArtist, NewArtist, NewEvent, NewIssueReport, Platform, Profile,
        PushToken,
    },
};

#[derive(Default)]
pub struct MemoryStore {
    artists: DashMap<Uuid, Artist>,
    /// Spotify id -> artist id, doubling as the unique index on `artists.spotify_id`
    artist_ids_by_spotify_id: DashMap<String, Uuid>,
    follows: DashMap<(Uuid, Uuid), FollowedArtist>,
    /// Keyed by `external_id`
    events: DashMap<String, Event>,
    push_tokens: DashMap<(Uuid, Platform), PushToken>,
    profiles: DashMap<Uuid, Profile>,
    issue_reports: DashMap<Uuid, NewIssueReport>,
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }

    pub fn follow_count(&self) -> usize { self.follows.len() }

    pub fn event_count(&self) -> usize { self.events.len() }

    pub fn issue_reports(&self) -> Vec<NewIssueReport> {
        self.issue_reports.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn all_events(&self) -> Vec<Event> {
        self.events.iter().map(|entry| entry.value().clone()).collect()
    }
}

fn apply_artist_patch(artist: &mut Artist, patch: &NewArtist) {
    artist.name = patch.name.clone();
    if patch.ticketmaster_id.is_some() {
        artist.ticketmaster_id = patch.ticketmaster_id.clone();
    }
    if patch.genre.is_some() {
        artist.genre = patch.genre.clone();
    }
    if patch.image_url.is_some() {
        artist.image_url = patch.image_url.clone();
    }
    if patch.followers_count.is_some() {
        artist.followers_count = patch.followers_count;
    }
    if patch.popularity.is_some() {
        artist.popularity = patch.popularity;
    }
    if patch.bio.is_some() {
        artist.bio = patch.bio.clone();
    }
    artist.updated_at = Some(patch.updated_at);
}

fn event_from_new(id: Uuid, event: &NewEvent, created_at: Option<DateTime<Utc>>) -> Event {
    Event {
        id,
        external_id: event.external_id.clone(),
        name: event.name.clone(),
        artist_id: event.artist_id,
        artist_name: event.artist_name.clone(),
        event_date: event.event_date,
        venue_name: event.venue_name.clone(),
        venue_address: event.venue_address.clone(),
        city: event.city.clone(),
        state: event.state.clone(),
        country: event.country.clone(),
        latitude: event.latitude,
        longitude: event.longitude,
        ticket_url: event.ticket_url.clone(),
        image_url: event.image_url.clone(),
        price_min: event.price_min,
        price_max: event.price_max,
        currency: event.currency.clone(),
        status: event.status,
        created_at: created_at.or(Some(event.updated_at)),
        updated_at: Some(event.updated_at),
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn find_artist_by_spotify_id(&self, spotify_id: &str) -> Result<Option<Artist>, ApiError> {
        let artist_id = match self.artist_ids_by_spotify_id.get(spotify_id) {
            Some(id) => *id,
            None => return Ok(None),
        };
        self.find_artist(artist_id).await
    }

    async fn find_artist(&self, artist_id: Uuid) -> Result<Option<Artist>, ApiError> {
        Ok(self.artists.get(&artist_id).map(|artist| artist.clone()))
    }

    async fn insert_artist(&self, artist: &NewArtist) -> Result<Artist, ApiError> {
        let id = Uuid::new_v4();
        match self.artist_ids_by_spotify_id.entry(artist.spotify_id.clone()) {
            Entry::Occupied(_) => return Err(ApiError::Duplicate),
            Entry::Vacant(entry) => {
                entry.insert(id);
            },
        }

        let row = Artist {
            id,
            spotify_id: artist.spotify_id.clone(),
            ticketmaster_id: artist.ticketmaster_id.clone(),
            name: artist.name.clone(),
            genre: artist.genre.clone(),
            image_url: artist.image_url.clone(),
            followers_count: artist.followers_count,
            popularity: artist.popularity,
            bio: artist.bio.clone(),
            created_at: Some(artist.updated_at),
            updated_at: Some(artist.updated_at),
        };
        self.artists.insert(id, row.clone());
        Ok(row)
    }

    async fn update_artist(&self, artist_id: Uuid, artist: &NewArtist) -> Result<Artist, ApiError> {
        let mut row = self
            .artists
            .get_mut(&artist_id)
            .ok_or_else(|| ApiError::NotFound(format!("artist {}", artist_id)))?;
        apply_artist_patch(&mut row, artist);
        Ok(row.clone())
    }

    async fn set_ticketmaster_id(&self, artist_id: Uuid, ticketmaster_id: &str) -> Result<(), ApiError> {
        let mut row = self
            .artists
            .get_mut(&artist_id)
            .ok_or_else(|| ApiError::NotFound(format!("artist {}", artist_id)))?;
        row.ticketmaster_id = Some(ticketmaster_id.to_owned());
        Ok(())
    }

    async fn artists_with_followers(&self) -> Result<Vec<Artist>, ApiError> {
        let mut artist_ids: Vec<Uuid> = self.follows.iter().map(|entry| entry.key().1).collect();
        artist_ids.sort_unstable();
        artist_ids.dedup();

        Ok(artist_ids
            .into_iter()
            .filter_map(|id| self.artists.get(&id).map(|artist| artist.clone()))
            .collect())
    }

    async fn insert_follow(&self, user_id: Uuid, artist_id: Uuid) -> Result<(), ApiError> {
        match self.follows.entry((user_id, artist_id)) {
            Entry::Occupied(_) => Err(ApiError::Duplicate),
            Entry::Vacant(entry) => {
                entry.insert(FollowedArtist {
                    user_id,
                    artist_id,
                    created_at: Some(Utc::now()),
                });
                Ok(())
            },
        }
    }

    async fn delete_follow(&self, user_id: Uuid, artist_id: Uuid) -> Result<usize, ApiError> {
        Ok(self.follows.remove(&(user_id, artist_id)).map_or(0, |_| 1))
    }

    async fn is_following(&self, user_id: Uuid, artist_id: Uuid) -> Result<bool, ApiError> {
        Ok(self.follows.contains_key(&(user_id, artist_id)))
    }

    async fn followed_artists(&self, user_id: Uuid) -> Result<Vec<Artist>, ApiError> {
        let artist_ids: Vec<Uuid> = self
            .follows
            .iter()
            .filter(|entry| entry.key().0 == user_id)
            .map(|entry| entry.key().1)
            .collect();

        let mut artists: Vec<Artist> = artist_ids
            .into_iter()
            .filter_map(|id| self.artists.get(&id).map(|artist| artist.clone()))
            .collect();
        artists.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(artists)
    }

    async fn follower_ids(&self, artist_id: Uuid) -> Result<Vec<Uuid>, ApiError> {
        Ok(self
            .follows
            .iter()
            .filter(|entry| entry.key().1 == artist_id)
            .map(|entry| entry.key().0)
            .collect())
    }

    async fn upsert_events(&self, events: &[NewEvent]) -> Result<UpsertOutcome, ApiError> {
        // Postgres refuses an upsert batch that touches the same row twice
        let mut external_ids = fnv::FnvHashSet::default();
        if let Some(event) = events.iter().find(|event| !external_ids.insert(event.external_id.as_str())) {
            return Err(ApiError::Invalid(format!(
                "event {} appears more than once in one upsert",
                event.external_id
            )));
        }

        let mut outcome = UpsertOutcome::default();

        for event in events {
            match self.events.entry(event.external_id.clone()) {
                Entry::Occupied(mut entry) => {
                    let existing = entry.get();
                    let row = event_from_new(existing.id, event, existing.created_at);
                    entry.insert(row.clone());
                    outcome.updated.push(row);
                },
                Entry::Vacant(entry) => {
                    let row = event_from_new(Uuid::new_v4(), event, None);
                    entry.insert(row.clone());
                    outcome.inserted.push(row);
                },
            }
        }

        Ok(outcome)
    }

    async fn events_for_artists(
        &self,
        artist_ids: &[Uuid],
        from: DateTime<Utc>,
    ) -> Result<Vec<Event>, ApiError> {
        let mut events: Vec<Event> = self
            .events
            .iter()
            .filter(|entry| artist_ids.contains(&entry.artist_id) && entry.event_date >= from)
            .map(|entry| entry.value().clone())
            .collect();
        events.sort_by_key(|event| event.event_date);
        Ok(events)
    }

    async fn delete_events_before(&self, cutoff: DateTime<Utc>) -> Result<usize, ApiError> {
        let before = self.events.len();
        self.events.retain(|_, event| event.event_date >= cutoff);
        Ok(before - self.events.len())
    }

    async fn upsert_push_token(&self, user_id: Uuid, token: &str, platform: Platform) -> Result<(), ApiError> {
        self.push_tokens.insert(
            (user_id, platform),
            PushToken {
                user_id,
                token: token.to_owned(),
                platform,
                updated_at: Some(Utc::now()),
            },
        );
        Ok(())
    }

    async fn delete_push_tokens(&self, user_id: Uuid, platform: Option<Platform>) -> Result<usize, ApiError> {
        let before = self.push_tokens.len();
        self.push_tokens.retain(|(token_user_id, token_platform), _| {
            !(*token_user_id == user_id && platform.map_or(true, |platform| platform == *token_platform))
        });
        Ok(before - self.push_tokens.len())
    }

    async fn delete_push_token_value(&self, token: &str) -> Result<usize, ApiError> {
        let before = self.push_tokens.len();
        self.push_tokens.retain(|_, push_token| push_token.token != token);
        Ok(before - self.push_tokens.len())
    }

    async fn push_tokens_for_users(&self, user_ids: &[Uuid]) -> Result<Vec<PushToken>, ApiError> {
        Ok(self
            .push_tokens
            .iter()
            .filter(|entry| user_ids.contains(&entry.key().0))
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn get_profile(&self, user_id: Uuid) -> Result<Option<Profile>, ApiError> {
        Ok(self.profiles.get(&user_id).map(|profile| profile.clone()))
    }

    async fn upsert_profile(&self, profile: &Profile) -> Result<Profile, ApiError> {
        let mut row = profile.clone();
        row.updated_at = Some(Utc::now());
        self.profiles.insert(profile.id, row.clone());
        Ok(row)
    }

    async fn insert_issue_report(&self, report: &NewIssueReport) -> Result<(), ApiError> {
        self.issue_reports.insert(Uuid::new_v4(), report.clone());
        Ok(())
    }
}
