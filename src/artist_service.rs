//! Follow / unfollow orchestration.  Every operation here logs failures and returns a sentinel (`false`, empty
//! list, `None`) rather than an error; callers only care whether the action went through.

use std::sync::Arc;

use uuid::Uuid;

use crate::{
    backfill::{BackfillJob, BackfillQueue},
    error::ApiError,
    metrics,
    models::{Artist, ArtistData, NewArtist},
    spotify_api::{artist_data_from_spotify, SpotifyClient, DEFAULT_SEARCH_LIMIT},
    store::Store,
};

/// Spotify exposes follower counts but not listener counts; monthly listeners are estimated from followers.
const MONTHLY_LISTENERS_MULTIPLIER: f64 = 15.;

pub struct ArtistService {
    store: Arc<dyn Store>,
    spotify: Arc<SpotifyClient>,
    backfill: BackfillQueue,
}

impl ArtistService {
    pub fn new(store: Arc<dyn Store>, spotify: Arc<SpotifyClient>, backfill: BackfillQueue) -> Self {
        ArtistService {
            store,
            spotify,
            backfill,
        }
    }

    /// Inserts the artist or refreshes its metadata if a row with the same Spotify id already exists.
    async fn save_artist(&self, artist: NewArtist) -> Result<Artist, ApiError> {
        if let Some(existing) = self.store.find_artist_by_spotify_id(&artist.spotify_id).await? {
            return self.store.update_artist(existing.id, &artist).await;
        }

        match self.store.insert_artist(&artist).await {
            Ok(inserted) => Ok(inserted),
            // Another follow of the same artist inserted it between our lookup and insert
            Err(err) if err.is_duplicate() => self
                .store
                .find_artist_by_spotify_id(&artist.spotify_id)
                .await?
                .ok_or_else(|| ApiError::NotFound(artist.spotify_id.clone())),
            Err(err) => Err(err),
        }
    }

    async fn follow_artist_inner(&self, user_id: Uuid, artist_data: ArtistData) -> Result<Artist, ApiError> {
        let artist = self.save_artist(artist_data.into()).await?;

        match self.store.insert_follow(user_id, artist.id).await {
            Ok(()) => info!("User {} followed artist {:?}", user_id, artist.name),
            Err(err) if err.is_duplicate() => debug!("User {} already follows artist {:?}", user_id, artist.name),
            Err(err) => return Err(err),
        }

        Ok(artist)
    }

    /// Saves the artist, records the follow and queues an event backfill for the artist.  Following an artist
    /// twice is a success both times.
    pub async fn follow_artist(&self, user_id: Uuid, artist_data: ArtistData) -> bool {
        let spotify_id = artist_data.spotify_id.clone();
        let artist = match self.follow_artist_inner(user_id, artist_data).await {
            Ok(artist) => artist,
            Err(err) => {
                error!("Error following artist {} for user {}: {:?}", spotify_id, user_id, err);
                metrics::follows_failure_total().inc();
                return false;
            },
        };
        metrics::follows_success_total().inc();

        self.backfill.enqueue(BackfillJob {
            artist_id: artist.id,
            artist_name: artist.name,
            follower_id: user_id,
        });
        true
    }

    /// Returns `false` if the artist is unknown, the user wasn't following it, or the delete failed.
    pub async fn unfollow_artist(&self, user_id: Uuid, spotify_id: &str) -> bool {
        let artist = match self.store.find_artist_by_spotify_id(spotify_id).await {
            Ok(Some(artist)) => artist,
            Ok(None) => {
                warn!("User {} tried to unfollow unknown artist {}", user_id, spotify_id);
                metrics::unfollows_failure_total().inc();
                return false;
            },
            Err(err) => {
                error!("Error looking up artist {} to unfollow: {:?}", spotify_id, err);
                metrics::unfollows_failure_total().inc();
                return false;
            },
        };

        match self.store.delete_follow(user_id, artist.id).await {
            Ok(0) => {
                warn!("User {} was not following artist {:?}", user_id, artist.name);
                metrics::unfollows_failure_total().inc();
                false
            },
            Ok(_) => {
                info!("User {} unfollowed artist {:?}", user_id, artist.name);
                metrics::unfollows_success_total().inc();
                true
            },
            Err(err) => {
                error!("Error unfollowing artist {} for user {}: {:?}", spotify_id, user_id, err);
                metrics::unfollows_failure_total().inc();
                false
            },
        }
    }

    pub async fn is_following(&self, user_id: Uuid, spotify_id: &str) -> bool {
        let artist = match self.store.find_artist_by_spotify_id(spotify_id).await {
            Ok(Some(artist)) => artist,
            Ok(None) => return false,
            Err(err) => {
                error!("Error looking up artist {}: {:?}", spotify_id, err);
                return false;
            },
        };

        self.store
            .is_following(user_id, artist.id)
            .await
            .unwrap_or_else(|err| {
                error!("Error checking follow of {} by user {}: {:?}", spotify_id, user_id, err);
                false
            })
    }

    pub async fn followed_artists(&self, user_id: Uuid) -> Vec<Artist> {
        self.store.followed_artists(user_id).await.unwrap_or_else(|err| {
            error!("Error loading followed artists for user {}: {:?}", user_id, err);
            Vec::new()
        })
    }

    pub async fn search_artists(&self, query: &str) -> Vec<ArtistData> {
        match self.spotify.search_artists(query, DEFAULT_SEARCH_LIMIT).await {
            Ok(artists) => artists.into_iter().map(artist_data_from_spotify).collect(),
            Err(err) => {
                error!("Error searching Spotify for {:?}: {:?}", query, err);
                Vec::new()
            },
        }
    }

    /// Looks up an artist's details on Spotify, falling back to the saved row if Spotify can't be reached.
    pub async fn artist_details(&self, spotify_id: &str) -> Option<ArtistData> {
        match self.spotify.get_artist(spotify_id).await {
            Ok(artist) => return artist.map(artist_data_from_spotify),
            Err(err) => warn!("Error fetching artist {} from Spotify: {:?}", spotify_id, err),
        }

        match self.store.find_artist_by_spotify_id(spotify_id).await {
            Ok(artist) => artist.map(|artist| ArtistData {
                spotify_id: artist.spotify_id,
                name: artist.name,
                genre: artist.genre,
                image_url: artist.image_url,
                followers_count: artist.followers_count,
                popularity: artist.popularity,
                bio: artist.bio,
            }),
            Err(err) => {
                error!("Error looking up saved artist {}: {:?}", spotify_id, err);
                None
            },
        }
    }

    /// Saved artist row for a Spotify id, if anybody has followed it
    pub async fn saved_artist(&self, spotify_id: &str) -> Option<Artist> {
        self.store
            .find_artist_by_spotify_id(spotify_id)
            .await
            .unwrap_or_else(|err| {
                error!("Error looking up saved artist {}: {:?}", spotify_id, err);
                None
            })
    }
}

/// Formats a follower count the way it is shown next to an artist: `2_000_000` becomes `"2.0M"`.
pub fn format_follower_count(count: i64) -> String {
    let count = count.max(0) as f64;
    if count >= 1e9 {
        format!("{:.1}B", count / 1e9)
    } else if count >= 1e6 {
        format!("{:.1}M", count / 1e6)
    } else if count >= 1e3 {
        format!("{:.1}K", count / 1e3)
    } else {
        format!("{}", count)
    }
}

/// Estimates monthly listeners from a follower count formatted like `"2.0M"`, `"850K"` or `"1,234"`.  The result
/// keeps the input's magnitude suffix and one decimal: `"2.0M"` becomes `"30.0M"`.  Unparseable input gives `"0.0"`.
pub fn get_monthly_listeners(followers: &str) -> String {
    let followers = followers.trim();
    let (number, suffix) = match followers.chars().last() {
        Some(last) if matches!(last.to_ascii_uppercase(), 'K' | 'M' | 'B') => (
            &followers[..followers.len() - last.len_utf8()],
            Some(last.to_ascii_uppercase()),
        ),
        _ => (followers, None),
    };

    let number: f64 = match number.trim().replace(',', "").parse() {
        Ok(number) if f64::is_finite(number) => number,
        _ => return "0.0".into(),
    };

    let listeners = number * MONTHLY_LISTENERS_MULTIPLIER;
    match suffix {
        Some(suffix) => format!("{:.1}{}", listeners, suffix),
        None => format!("{:.1}", listeners),
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::store::MemoryStore;

    fn artist_data(spotify_id: &str) -> ArtistData {
        ArtistData {
            spotify_id: spotify_id.into(),
            name: "Japanese Breakfast".into(),
            genre: Some("indie pop".into()),
            image_url: None,
            followers_count: Some(1_000),
            popularity: Some(60),
            bio: None,
        }
    }

    fn service(
        store: Arc<MemoryStore>,
        spotify_url: &str,
    ) -> (ArtistService, tokio::sync::mpsc::Receiver<BackfillJob>) {
        let (queue, rx) = BackfillQueue::new(16);
        let spotify =
            Arc::new(SpotifyClient::new("id", "secret").with_base_urls(spotify_url, spotify_url));
        (ArtistService::new(store, spotify, queue), rx)
    }

    #[tokio::test]
    async fn double_follow_keeps_a_single_row() {
        let store = Arc::new(MemoryStore::new());
        let (artists, mut rx) = service(store.clone(), "http://127.0.0.1:9");
        let user = Uuid::new_v4();

        assert!(artists.follow_artist(user, artist_data("jb")).await);
        assert!(artists.follow_artist(user, artist_data("jb")).await);
        assert_eq!(store.follow_count(), 1);
        assert!(artists.is_following(user, "jb").await);

        let followed = artists.followed_artists(user).await;
        assert_eq!(followed.len(), 1);
        assert_eq!(followed[0].spotify_id, "jb");

        let job = rx.try_recv().unwrap();
        assert_eq!(job.artist_id, followed[0].id);
        assert_eq!(job.follower_id, user);
    }

    #[tokio::test]
    async fn refollow_updates_artist_metadata() {
        let store = Arc::new(MemoryStore::new());
        let (artists, _rx) = service(store.clone(), "http://127.0.0.1:9");
        let user = Uuid::new_v4();

        assert!(artists.follow_artist(user, artist_data("jb")).await);
        let mut updated = artist_data("jb");
        updated.followers_count = Some(2_000);
        assert!(artists.follow_artist(Uuid::new_v4(), updated).await);

        let saved = artists.saved_artist("jb").await.unwrap();
        assert_eq!(saved.followers_count, Some(2_000));
        assert_eq!(saved.genre.as_deref(), Some("indie pop"));
    }

    #[tokio::test]
    async fn unfollow_when_not_following_returns_false() {
        let store = Arc::new(MemoryStore::new());
        let (artists, _rx) = service(store.clone(), "http://127.0.0.1:9");
        let user = Uuid::new_v4();

        assert!(!artists.unfollow_artist(user, "unknown").await);

        assert!(artists.follow_artist(Uuid::new_v4(), artist_data("jb")).await);
        assert!(!artists.unfollow_artist(user, "jb").await);
    }

    #[tokio::test]
    async fn unfollow_removes_the_follow() {
        let store = Arc::new(MemoryStore::new());
        let (artists, _rx) = service(store.clone(), "http://127.0.0.1:9");
        let user = Uuid::new_v4();

        assert!(artists.follow_artist(user, artist_data("jb")).await);
        assert!(artists.unfollow_artist(user, "jb").await);
        assert!(!artists.is_following(user, "jb").await);
        assert_eq!(store.follow_count(), 0);
        assert!(!artists.unfollow_artist(user, "jb").await);
    }

    #[tokio::test]
    async fn follow_succeeds_when_backfill_queue_is_gone() {
        let store = Arc::new(MemoryStore::new());
        let (artists, rx) = service(store.clone(), "http://127.0.0.1:9");
        drop(rx);

        assert!(artists.follow_artist(Uuid::new_v4(), artist_data("jb")).await);
        assert_eq!(store.follow_count(), 1);
    }

    #[tokio::test]
    async fn search_failure_returns_empty_list() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "tok",
                "token_type": "Bearer",
                "expires_in": 3600
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/search"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let (artists, _rx) = service(Arc::new(MemoryStore::new()), &server.uri());
        assert!(artists.search_artists("japanese breakfast").await.is_empty());
    }

    #[test]
    fn follower_count_formatting() {
        assert_eq!(format_follower_count(2_000_000), "2.0M");
        assert_eq!(format_follower_count(1_240), "1.2K");
        assert_eq!(format_follower_count(3_400_000_000), "3.4B");
        assert_eq!(format_follower_count(999), "999");
        assert_eq!(get_monthly_listeners(&format_follower_count(2_000_000)), "30.0M");
    }

    #[test]
    fn monthly_listeners_estimate() {
        assert_eq!(get_monthly_listeners("2.0M"), "30.0M");
        assert_eq!(get_monthly_listeners("850K"), "12750.0K");
        assert_eq!(get_monthly_listeners("1,000"), "15000.0");
        assert_eq!(get_monthly_listeners("1.2b"), "18.0B");
        assert_eq!(get_monthly_listeners("lots"), "0.0");
        assert_eq!(get_monthly_listeners(""), "0.0");
    }
}
