//! Synchronizes upcoming concerts from Ticketmaster into the `events` table and keeps the table trimmed.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use fnv::FnvHashSet;
use futures::{stream, StreamExt};
use uuid::Uuid;

use crate::{
    error::ApiError,
    metrics,
    models::{Artist, Event, NewEvent},
    push::PushService,
    store::Store,
    ticketmaster_api::{map_event, TicketmasterClient},
};

/// Number of artists synchronized concurrently by the refresh job
const REFRESH_CONCURRENCY: usize = 4;
pub const DEFAULT_RETENTION_DAYS: i64 = 7;

#[derive(Clone, Debug, Default, Serialize)]
pub struct SyncReport {
    pub artist_id: Option<Uuid>,
    pub inserted: usize,
    pub updated: usize,
    #[serde(skip)]
    pub new_events: Vec<Event>,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct RefreshReport {
    pub success_count: usize,
    pub failed_count: usize,
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    pub notifications_sent: usize,
}

pub struct EventsService {
    store: Arc<dyn Store>,
    ticketmaster: Arc<TicketmasterClient>,
    retention_days: i64,
}

impl EventsService {
    pub fn new(store: Arc<dyn Store>, ticketmaster: Arc<TicketmasterClient>, retention_days: i64) -> Self {
        EventsService {
            store,
            ticketmaster,
            retention_days,
        }
    }

    /// Returns the artist's Ticketmaster attraction id, looking it up by name (with the genre as a hint) and
    /// saving it on the artist the first time.
    async fn resolve_attraction_id(&self, artist: &Artist) -> Result<Option<String>, ApiError> {
        if let Some(id) = artist.ticketmaster_id.as_ref().filter(|id| !id.is_empty()) {
            return Ok(Some(id.clone()));
        }

        let attraction = match self
            .ticketmaster
            .find_attraction(&artist.name, artist.genre.as_deref())
            .await?
        {
            Some(attraction) => attraction,
            None => {
                info!("No Ticketmaster attraction found for artist {:?}", artist.name);
                return Ok(None);
            },
        };
        info!(
            "Matched artist {:?} to Ticketmaster attraction {} ({:?})",
            artist.name, attraction.id, attraction.name
        );

        self.store.set_ticketmaster_id(artist.id, &attraction.id).await?;
        Ok(Some(attraction.id))
    }

    /// Called when a saved attraction id yields no events.  If Ticketmaster no longer knows the attraction, the
    /// artist is matched again by name and the new id saved; returns that id when it differs.
    async fn replace_stale_attraction(&self, artist: &Artist, attraction_id: &str) -> Result<Option<String>, ApiError> {
        if self.ticketmaster.get_attraction(attraction_id).await?.is_some() {
            return Ok(None);
        }
        warn!(
            "Ticketmaster attraction {} for artist {:?} no longer exists; searching again",
            attraction_id, artist.name
        );

        match self
            .ticketmaster
            .find_attraction(&artist.name, artist.genre.as_deref())
            .await?
        {
            Some(attraction) if attraction.id != attraction_id => {
                self.store.set_ticketmaster_id(artist.id, &attraction.id).await?;
                Ok(Some(attraction.id))
            },
            _ => Ok(None),
        }
    }

    /// Fetches the artist's upcoming Ticketmaster events and upserts them by `external_id`.
    pub async fn fetch_and_save_artist_events(&self, artist: &Artist) -> Result<SyncReport, ApiError> {
        let mut report = SyncReport {
            artist_id: Some(artist.id),
            ..SyncReport::default()
        };

        let attraction_id = match self.resolve_attraction_id(artist).await? {
            Some(id) => id,
            None => return Ok(report),
        };

        let had_saved_id = artist.ticketmaster_id.as_deref().map_or(false, |id| !id.is_empty());
        let now = Utc::now();
        let mut tm_events = self.ticketmaster.upcoming_events(&attraction_id, now).await?;
        if tm_events.is_empty() && had_saved_id {
            if let Some(new_id) = self.replace_stale_attraction(artist, &attraction_id).await? {
                tm_events = self.ticketmaster.upcoming_events(&new_id, now).await?;
            }
        }

        let mut events: Vec<NewEvent> = tm_events
            .into_iter()
            .filter_map(|event| map_event(event, artist, now))
            .collect();
        // Ticketmaster occasionally lists the same event twice in one page, and a batch upsert may touch each
        // row only once
        let mut seen = FnvHashSet::default();
        events.retain(|event| seen.insert(event.external_id.clone()));
        events.sort_by_key(|event| event.event_date);
        if events.is_empty() {
            debug!("No upcoming events for artist {:?}", artist.name);
            return Ok(report);
        }

        let outcome = self.store.upsert_events(&events).await?;
        report.inserted = outcome.inserted.len();
        report.updated = outcome.updated.len();
        report.new_events = outcome.inserted;
        metrics::events_inserted_total().inc_by(report.inserted as u64);
        metrics::events_updated_total().inc_by(report.updated as u64);
        info!(
            "Saved events for artist {:?}: {} new, {} updated",
            artist.name, report.inserted, report.updated
        );

        Ok(report)
    }

    /// Deletes events more than `retention_days` past their date.
    pub async fn cleanup_past_events(&self, now: DateTime<Utc>) -> Result<usize, ApiError> {
        let cutoff = now - Duration::days(self.retention_days);
        let deleted = self.store.delete_events_before(cutoff).await?;
        metrics::events_deleted_total().inc_by(deleted as u64);
        info!("Deleted {} events dated before {}", deleted, cutoff);
        Ok(deleted)
    }

    /// Refreshes events for every followed artist, notifies followers about newly announced events, then removes
    /// stale events.  Individual failures are logged and counted; they never stop the run.
    pub async fn refresh_all_events(&self, push: &PushService) -> RefreshReport {
        let mut report = RefreshReport::default();

        let artists = match self.store.artists_with_followers().await {
            Ok(artists) => artists,
            Err(err) => {
                error!("Error loading followed artists for event refresh: {:?}", err);
                return report;
            },
        };
        info!("Refreshing events for {} followed artists...", artists.len());

        let results: Vec<(Artist, Result<SyncReport, ApiError>)> = stream::iter(artists)
            .map(|artist| async move {
                let res = self.fetch_and_save_artist_events(&artist).await;
                (artist, res)
            })
            .buffer_unordered(REFRESH_CONCURRENCY)
            .collect()
            .await;

        for (artist, res) in results {
            match res {
                Ok(sync) => {
                    report.success_count += 1;
                    report.inserted += sync.inserted;
                    report.updated += sync.updated;
                    if !sync.new_events.is_empty() {
                        let push_report = push
                            .notify_followers_of_new_events(&artist, &sync.new_events, None)
                            .await;
                        report.notifications_sent += push_report.sent;
                    }
                },
                Err(err) => {
                    report.failed_count += 1;
                    error!("Error refreshing events for artist {:?}: {}", artist.name, err);
                },
            }
        }

        match self.cleanup_past_events(Utc::now()).await {
            Ok(deleted) => report.deleted = deleted,
            Err(err) => error!("Error cleaning up past events: {:?}", err),
        }

        info!(
            "Event refresh finished: success_count={}, failed_count={}, inserted={}, updated={}, deleted={}",
            report.success_count, report.failed_count, report.inserted, report.updated, report.deleted
        );
        report
    }

    /// Upcoming events for all artists the user follows, soonest first.  Empty on error.
    pub async fn upcoming_events_for_user(&self, user_id: Uuid) -> Vec<Event> {
        let artist_ids: Vec<Uuid> = match self.store.followed_artists(user_id).await {
            Ok(artists) => artists.into_iter().map(|artist| artist.id).collect(),
            Err(err) => {
                error!("Error loading followed artists for user {}: {:?}", user_id, err);
                return Vec::new();
            },
        };

        self.store
            .events_for_artists(&artist_ids, Utc::now())
            .await
            .unwrap_or_else(|err| {
                error!("Error loading events for user {}: {:?}", user_id, err);
                Vec::new()
            })
    }

    pub async fn artist_events(&self, artist_id: Uuid) -> Vec<Event> {
        self.store
            .events_for_artists(&[artist_id], Utc::now())
            .await
            .unwrap_or_else(|err| {
                error!("Error loading events for artist {}: {:?}", artist_id, err);
                Vec::new()
            })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::{
        models::{EventStatus, NewArtist},
        push::ExpoPushClient,
        store::MemoryStore,
    };

    pub(crate) fn tm_event_json(id: &str, date: &str, status: &str) -> serde_json::Value {
        serde_json::json!({
            "id": id,
            "name": format!("Concert {}", id),
            "url": format!("https://tm/{}", id),
            "dates": { "start": { "dateTime": date }, "status": { "code": status } },
            "_embedded": { "venues": [{ "name": "The Fillmore", "city": { "name": "San Francisco" } }] }
        })
    }

    pub(crate) async fn mount_ticketmaster(server: &MockServer, events: Vec<serde_json::Value>) {
        Mock::given(method("GET"))
            .and(path("/discovery/v2/attractions.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "_embedded": { "attractions": [{ "id": "K8v1", "name": "Japanese Breakfast" }] }
            })))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/discovery/v2/events.json"))
            .and(query_param("attractionId", "K8v1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "_embedded": { "events": events }
            })))
            .mount(server)
            .await;
    }

    pub(crate) async fn insert_artist(store: &MemoryStore, spotify_id: &str) -> Artist {
        store
            .insert_artist(&NewArtist {
                spotify_id: spotify_id.into(),
                name: "Japanese Breakfast".into(),
                ticketmaster_id: None,
                genre: None,
                image_url: None,
                followers_count: None,
                popularity: None,
                bio: None,
                updated_at: Utc::now(),
            })
            .await
            .unwrap()
    }

    fn service(store: Arc<MemoryStore>, server: &MockServer) -> EventsService {
        EventsService::new(
            store,
            Arc::new(TicketmasterClient::new("key").with_base_url(&server.uri())),
            DEFAULT_RETENTION_DAYS,
        )
    }

    fn future_date(days: i64) -> String {
        (Utc::now() + Duration::days(days))
            .format("%Y-%m-%dT%H:%M:%SZ")
            .to_string()
    }

    #[tokio::test]
    async fn sync_saves_sorted_events_and_attraction_id() {
        let server = MockServer::start().await;
        mount_ticketmaster(
            &server,
            vec![
                tm_event_json("late", &future_date(30), "onsale"),
                tm_event_json("early", &future_date(3), "offsale"),
            ],
        )
        .await;
        let store = Arc::new(MemoryStore::new());
        let artist = insert_artist(&store, "jb").await;

        let events = service(store.clone(), &server);
        let report = events.fetch_and_save_artist_events(&artist).await.unwrap();
        assert_eq!(report.inserted, 2);
        assert_eq!(report.updated, 0);

        let saved_artist = store.find_artist(artist.id).await.unwrap().unwrap();
        assert_eq!(saved_artist.ticketmaster_id.as_deref(), Some("K8v1"));

        let saved = events.artist_events(artist.id).await;
        let ids: Vec<&str> = saved.iter().map(|event| event.external_id.as_str()).collect();
        assert_eq!(ids, vec!["early", "late"]);
        assert_eq!(saved[0].status, EventStatus::SoldOut);
        assert_eq!(saved[1].status, EventStatus::OnSale);

        // A second sync finds the same events again and only updates them
        let report = events.fetch_and_save_artist_events(&artist).await.unwrap();
        assert_eq!(report.inserted, 0);
        assert_eq!(report.updated, 2);
        assert_eq!(store.event_count(), 2);
    }

    #[tokio::test]
    async fn repeated_listings_are_saved_once() {
        let server = MockServer::start().await;
        let date = future_date(12);
        mount_ticketmaster(
            &server,
            vec![
                tm_event_json("a", &date, "onsale"),
                tm_event_json("b", &date, "onsale"),
                tm_event_json("a", &date, "onsale"),
            ],
        )
        .await;
        let store = Arc::new(MemoryStore::new());
        let artist = insert_artist(&store, "jb").await;

        let report = service(store.clone(), &server)
            .fetch_and_save_artist_events(&artist)
            .await
            .unwrap();
        assert_eq!(report.inserted, 2);
        assert_eq!(report.updated, 0);
        assert_eq!(report.new_events.len(), 2);
        assert_eq!(store.event_count(), 2);
    }

    #[tokio::test]
    async fn stale_attraction_id_is_replaced() {
        let server = MockServer::start().await;
        mount_ticketmaster(&server, vec![tm_event_json("e1", &future_date(4), "onsale")]).await;
        Mock::given(method("GET"))
            .and(path("/discovery/v2/events.json"))
            .and(query_param("attractionId", "OLD"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/discovery/v2/attractions/OLD.json"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let store = Arc::new(MemoryStore::new());
        let artist = insert_artist(&store, "jb").await;
        store.set_ticketmaster_id(artist.id, "OLD").await.unwrap();
        let artist = store.find_artist(artist.id).await.unwrap().unwrap();

        let report = service(store.clone(), &server)
            .fetch_and_save_artist_events(&artist)
            .await
            .unwrap();
        assert_eq!(report.inserted, 1);
        let saved_artist = store.find_artist(artist.id).await.unwrap().unwrap();
        assert_eq!(saved_artist.ticketmaster_id.as_deref(), Some("K8v1"));
    }

    #[tokio::test]
    async fn live_attraction_without_events_is_kept() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/discovery/v2/events.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/discovery/v2/attractions/K8v1.json"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({ "id": "K8v1", "name": "Japanese Breakfast" })),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/discovery/v2/attractions.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .expect(0)
            .mount(&server)
            .await;

        let store = Arc::new(MemoryStore::new());
        let artist = insert_artist(&store, "jb").await;
        store.set_ticketmaster_id(artist.id, "K8v1").await.unwrap();
        let artist = store.find_artist(artist.id).await.unwrap().unwrap();

        let report = service(store.clone(), &server)
            .fetch_and_save_artist_events(&artist)
            .await
            .unwrap();
        assert_eq!(report.inserted, 0);
        let saved_artist = store.find_artist(artist.id).await.unwrap().unwrap();
        assert_eq!(saved_artist.ticketmaster_id.as_deref(), Some("K8v1"));
    }

    #[tokio::test]
    async fn no_attraction_means_no_events() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/discovery/v2/attractions.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;
        let store = Arc::new(MemoryStore::new());
        let artist = insert_artist(&store, "jb").await;

        let report = service(store.clone(), &server)
            .fetch_and_save_artist_events(&artist)
            .await
            .unwrap();
        assert_eq!(report.inserted, 0);
        assert_eq!(store.event_count(), 0);
    }

    #[tokio::test]
    async fn cleanup_removes_events_older_than_retention() {
        let server = MockServer::start().await;
        let store = Arc::new(MemoryStore::new());
        let artist = insert_artist(&store, "jb").await;
        let now = Utc::now();

        let mut old = crate::ticketmaster_api::map_event(
            serde_json::from_value(tm_event_json("old", "2020-01-01T00:00:00Z", "onsale")).unwrap(),
            &artist,
            now,
        )
        .unwrap();
        old.event_date = now - Duration::days(8);
        let mut recent = old.clone();
        recent.external_id = "recent".into();
        recent.event_date = now - Duration::days(6);
        let mut upcoming = old.clone();
        upcoming.external_id = "upcoming".into();
        upcoming.event_date = now + Duration::days(1);
        store.upsert_events(&[old, recent, upcoming]).await.unwrap();

        let deleted = service(store.clone(), &server).cleanup_past_events(now).await.unwrap();
        assert_eq!(deleted, 1);
        let mut remaining: Vec<String> = store
            .all_events()
            .into_iter()
            .map(|event| event.external_id)
            .collect();
        remaining.sort();
        assert_eq!(remaining, vec!["recent".to_string(), "upcoming".to_string()]);
    }

    #[tokio::test]
    async fn refresh_notifies_followers_of_new_events_only() {
        let server = MockServer::start().await;
        mount_ticketmaster(&server, vec![tm_event_json("e1", &future_date(5), "onsale")]).await;
        Mock::given(method("POST"))
            .and(path("/push/send"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{ "status": "ok", "id": "ticket-1" }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let store = Arc::new(MemoryStore::new());
        let artist = insert_artist(&store, "jb").await;
        let user = Uuid::new_v4();
        store.insert_follow(user, artist.id).await.unwrap();
        store
            .upsert_push_token(user, "ExponentPushToken[abc]", crate::models::Platform::Ios)
            .await
            .unwrap();

        let events = service(store.clone(), &server);
        let push = PushService::new(
            store.clone(),
            ExpoPushClient::new(None).with_url(&format!("{}/push/send", server.uri())),
        );

        let first = events.refresh_all_events(&push).await;
        assert_eq!(first.success_count, 1);
        assert_eq!(first.failed_count, 0);
        assert_eq!(first.inserted, 1);
        assert_eq!(first.notifications_sent, 1);

        // Nothing new the second time around, so no second push (the mock expects exactly one call)
        let second = events.refresh_all_events(&push).await;
        assert_eq!(second.inserted, 0);
        assert_eq!(second.updated, 1);
        assert_eq!(second.notifications_sent, 0);
    }

    #[tokio::test]
    async fn refresh_counts_failures() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/discovery/v2/attractions.json"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let store = Arc::new(MemoryStore::new());
        let artist = insert_artist(&store, "jb").await;
        store.insert_follow(Uuid::new_v4(), artist.id).await.unwrap();

        let push = PushService::new(store.clone(), ExpoPushClient::new(None).with_url(&server.uri()));
        let report = service(store.clone(), &server).refresh_all_events(&push).await;
        assert_eq!(report.success_count, 0);
        assert_eq!(report.failed_count, 1);
    }

    #[tokio::test]
    async fn user_feed_contains_only_followed_artists() {
        let server = MockServer::start().await;
        let store = Arc::new(MemoryStore::new());
        let followed = insert_artist(&store, "followed").await;
        let other = insert_artist(&store, "other").await;
        let user = Uuid::new_v4();
        store.insert_follow(user, followed.id).await.unwrap();

        let now = Utc::now();
        let template = crate::ticketmaster_api::map_event(
            serde_json::from_value(tm_event_json("a", &future_date(2), "onsale")).unwrap(),
            &followed,
            now,
        )
        .unwrap();
        let mut other_event = template.clone();
        other_event.external_id = "b".into();
        other_event.artist_id = other.id;
        store.upsert_events(&[template, other_event]).await.unwrap();

        let feed = service(store.clone(), &server).upcoming_events_for_user(user).await;
        assert_eq!(feed.len(), 1);
        assert_eq!(feed[0].external_id, "a");
    }
}
