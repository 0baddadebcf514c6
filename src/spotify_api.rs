use base64::Engine;
use fnv::FnvHashMap as HashMap;
use tokio::sync::Mutex;

use crate::{
    api_util::{decode_json, get_reqwest_client, send_json_request},
    error::ApiError,
    metrics,
    models::{
        AccessTokenResponse, ArtistData, SpotifyArtist, SpotifyBatchArtistsResponse,
        SpotifySearchResponse,
    },
    spotify_token::SpotifyTokenData,
};

const SPOTIFY_API_BASE_URL: &str = "https://api.spotify.com";
const SPOTIFY_ACCOUNTS_BASE_URL: &str = "https://accounts.spotify.com";
const SERVICE: &str = "spotify";
pub const MAX_BATCH_ENTITY_COUNT: usize = 50;
pub const DEFAULT_SEARCH_LIMIT: usize = 20;

pub struct SpotifyClient {
    client_id: String,
    client_secret: String,
    api_base_url: String,
    accounts_base_url: String,
    token_data: Mutex<SpotifyTokenData>,
}

impl SpotifyClient {
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        SpotifyClient {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            api_base_url: SPOTIFY_API_BASE_URL.into(),
            accounts_base_url: SPOTIFY_ACCOUNTS_BASE_URL.into(),
            token_data: Mutex::new(SpotifyTokenData::new()),
        }
    }

    /// Points the client at different hosts for the Web API and the accounts service.
    pub fn with_base_urls(mut self, api_base_url: &str, accounts_base_url: &str) -> Self {
        self.api_base_url = api_base_url.trim_end_matches('/').into();
        self.accounts_base_url = accounts_base_url.trim_end_matches('/').into();
        self
    }

    fn get_authorization_header_content(&self) -> String {
        let credentials = format!("{}:{}", self.client_id, self.client_secret);
        format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode(credentials)
        )
    }

    pub(crate) async fn fetch_auth_token(&self) -> Result<AccessTokenResponse, ApiError> {
        let url = format!("{}/api/token", self.accounts_base_url);
        let mut params = HashMap::default();
        params.insert("grant_type", "client_credentials");

        info!("Fetching Spotify app token from {}", url);
        metrics::external_api_requests_total(SERVICE, "token").inc();
        let res = get_reqwest_client()
            .await
            .post(&url)
            .header("Authorization", self.get_authorization_header_content())
            .form(&params)
            .send()
            .await
            .map_err(|err| {
                error!("Error fetching Spotify app token: {:?}", err);
                metrics::external_api_requests_failure_total(SERVICE, "token").inc();
                ApiError::Transport {
                    service: SERVICE,
                    source: err,
                }
            })?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            error!("Got bad status code of {} when fetching Spotify token: {:?}", status, body);
            metrics::external_api_requests_failure_total(SERVICE, "token").inc();
            return Err(ApiError::BadStatus {
                service: SERVICE,
                status: status.as_u16(),
                body,
            });
        }

        decode_json(SERVICE, &url, res).await
    }

    /// Returns a valid app access token, fetching a new one if the cached one has expired.
    pub async fn access_token(&self) -> Result<String, ApiError> {
        let mut token_data = self.token_data.lock().await;
        let now = chrono::Utc::now();
        if let Some(token) = token_data.get(now) {
            return Ok(token.to_owned());
        }

        let res = self.fetch_auth_token().await?;
        token_data.set(res, now);
        Ok(token_data.token.clone())
    }

    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        endpoint_name: &'static str,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<Option<T>, ApiError> {
        let token = self.access_token().await?;
        let client = get_reqwest_client().await;

        let res = send_json_request(SERVICE, endpoint_name, url, || {
            client.get(url).bearer_auth(&token).query(query)
        })
        .await;

        if let Err(ApiError::BadStatus { status: 401, .. }) = &res {
            warn!("Spotify rejected our app token; dropping it so the next request fetches a new one");
            self.token_data.lock().await.invalidate();
        }
        res
    }

    pub async fn search_artists(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<SpotifyArtist>, ApiError> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }

        let url = format!("{}/v1/search", self.api_base_url);
        let params = [
            ("q", query.to_owned()),
            ("type", "artist".to_owned()),
            ("limit", limit.clamp(1, 50).to_string()),
        ];
        let res: Option<SpotifySearchResponse> = self.get("search", &url, &params).await?;
        Ok(res.map(|res| res.artists.items).unwrap_or_default())
    }

    pub async fn get_artist(&self, spotify_id: &str) -> Result<Option<SpotifyArtist>, ApiError> {
        let url = format!("{}/v1/artists/{}", self.api_base_url, spotify_id);
        self.get("artist", &url, &[]).await
    }

    /// Fetches metadata for many artists at once, `MAX_BATCH_ENTITY_COUNT` per request.  Results are returned in the
    /// same order as the provided ids; ids Spotify doesn't know about are skipped.
    pub async fn get_artists(&self, spotify_ids: &[&str]) -> Result<Vec<SpotifyArtist>, ApiError> {
        let url = format!("{}/v1/artists", self.api_base_url);
        let mut fetched = Vec::with_capacity(spotify_ids.len());

        for (chunk_ix, chunk) in spotify_ids.chunks(MAX_BATCH_ENTITY_COUNT).enumerate() {
            debug!("Fetching artist chunk {}...", chunk_ix);
            let params = [("ids", chunk.join(","))];
            let res: Option<SpotifyBatchArtistsResponse> =
                self.get("batch_artists", &url, &params).await?;
            if let Some(res) = res {
                fetched.extend(res.artists.into_iter().flatten());
            }
        }

        Ok(fetched)
    }
}

/// Converts a Spotify artist into the shape clients submit when following.  Only the first genre is kept and the
/// largest image is preferred.
pub fn artist_data_from_spotify(artist: SpotifyArtist) -> ArtistData {
    let image_url = artist
        .images
        .iter()
        .max_by_key(|image| image.width.unwrap_or(0))
        .map(|image| image.url.clone());

    ArtistData {
        spotify_id: artist.id,
        name: artist.name,
        genre: artist.genres.into_iter().next(),
        image_url,
        followers_count: artist.followers.map(|followers| followers.total),
        popularity: artist.popularity,
        bio: None,
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::models::{SpotifyFollowers, SpotifyImage};

    async fn mock_token(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/api/token"))
            // base64("id:secret")
            .and(header("Authorization", "Basic aWQ6c2VjcmV0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "app-token",
                "token_type": "Bearer",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(server)
            .await;
    }

    fn client(server: &MockServer) -> SpotifyClient {
        SpotifyClient::new("id", "secret").with_base_urls(&server.uri(), &server.uri())
    }

    fn artist_json(id: &str, name: &str) -> serde_json::Value {
        serde_json::json!({
            "id": id,
            "name": name,
            "genres": ["indie rock", "art pop"],
            "images": [
                { "url": "https://img/small", "width": 160, "height": 160 },
                { "url": "https://img/large", "width": 640, "height": 640 }
            ],
            "followers": { "total": 123456 },
            "popularity": 71
        })
    }

    #[tokio::test]
    async fn search_artists_uses_cached_app_token() {
        let server = MockServer::start().await;
        mock_token(&server).await;

        Mock::given(method("GET"))
            .and(path("/v1/search"))
            .and(query_param("q", "radiohead"))
            .and(query_param("type", "artist"))
            .and(header("Authorization", "Bearer app-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "artists": { "items": [artist_json("4Z8W4fKeB5YxbusRsdQVPb", "Radiohead")], "total": 1 }
            })))
            .expect(2)
            .mount(&server)
            .await;

        let spotify = client(&server);
        let first = spotify.search_artists("radiohead", 10).await.unwrap();
        let second = spotify.search_artists("radiohead", 10).await.unwrap();

        assert_eq!(first.len(), 1);
        assert_eq!(first[0].name, "Radiohead");
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn blank_search_makes_no_requests() {
        let server = MockServer::start().await;
        let spotify = client(&server);
        assert!(spotify.search_artists("   ", 10).await.unwrap().is_empty());
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_artist_is_none() {
        let server = MockServer::start().await;
        mock_token(&server).await;
        Mock::given(method("GET"))
            .and(path("/v1/artists/nope"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        assert_eq!(client(&server).get_artist("nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn batch_artists_skip_unknown_ids() {
        let server = MockServer::start().await;
        mock_token(&server).await;
        Mock::given(method("GET"))
            .and(path("/v1/artists"))
            .and(query_param("ids", "a,b,c"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "artists": [artist_json("a", "A"), null, artist_json("c", "C")]
            })))
            .mount(&server)
            .await;

        let artists = client(&server).get_artists(&["a", "b", "c"]).await.unwrap();
        let ids: Vec<&str> = artists.iter().map(|artist| artist.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn rate_limited_request_is_retried() {
        let server = MockServer::start().await;
        mock_token(&server).await;
        Mock::given(method("GET"))
            .and(path("/v1/artists/a"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/artists/a"))
            .respond_with(ResponseTemplate::new(200).set_body_json(artist_json("a", "A")))
            .mount(&server)
            .await;

        let artist = client(&server).get_artist("a").await.unwrap().unwrap();
        assert_eq!(artist.name, "A");
    }

    #[tokio::test]
    async fn persistent_rate_limiting_gives_up() {
        let server = MockServer::start().await;
        mock_token(&server).await;
        Mock::given(method("GET"))
            .and(path("/v1/artists/a"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
            .mount(&server)
            .await;

        let err = client(&server).get_artist("a").await.unwrap_err();
        assert!(matches!(err, ApiError::RateLimited("spotify")));
    }

    #[test]
    fn maps_spotify_artist_to_artist_data() {
        let artist = SpotifyArtist {
            id: "xyz".into(),
            name: "Phoebe Bridgers".into(),
            genres: vec!["indie folk".into(), "indie pop".into()],
            images: vec![
                SpotifyImage {
                    url: "small".into(),
                    width: Some(64),
                    height: Some(64),
                },
                SpotifyImage {
                    url: "big".into(),
                    width: Some(640),
                    height: Some(640),
                },
            ],
            followers: Some(SpotifyFollowers { total: 2_000_000 }),
            popularity: Some(80),
        };

        let data = artist_data_from_spotify(artist);
        assert_eq!(data.spotify_id, "xyz");
        assert_eq!(data.genre.as_deref(), Some("indie folk"));
        assert_eq!(data.image_url.as_deref(), Some("big"));
        assert_eq!(data.followers_count, Some(2_000_000));
        assert_eq!(data.popularity, Some(80));
    }
}
