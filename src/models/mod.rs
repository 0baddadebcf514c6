use chrono::{DateTime, Utc};
use uuid::Uuid;

// Rows as stored in the backend tables

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Artist {
    pub id: Uuid,
    pub spotify_id: String,
    #[serde(default)]
    pub ticketmaster_id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub genre: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub followers_count: Option<i64>,
    #[serde(default)]
    pub popularity: Option<i32>,
    #[serde(default)]
    pub bio: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Insert/patch shape for the `artists` table.  `None` fields are left out of the request body so that
/// updating an existing row never clobbers columns we don't know about (the Ticketmaster id, the bio).
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct NewArtist {
    pub spotify_id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ticketmaster_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub genre: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub followers_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub popularity: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bio: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Artist metadata as submitted by a client when following an artist.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ArtistData {
    pub spotify_id: String,
    pub name: String,
    #[serde(default)]
    pub genre: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub followers_count: Option<i64>,
    #[serde(default)]
    pub popularity: Option<i32>,
    #[serde(default)]
    pub bio: Option<String>,
}

impl From<ArtistData> for NewArtist {
    fn from(data: ArtistData) -> Self {
        NewArtist {
            spotify_id: data.spotify_id,
            name: data.name,
            ticketmaster_id: None,
            genre: data.genre,
            image_url: data.image_url,
            followers_count: data.followers_count,
            popularity: data.popularity,
            bio: data.bio,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    OnSale,
    SoldOut,
    Cancelled,
    Postponed,
    Announced,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub external_id: String,
    pub name: String,
    pub artist_id: Uuid,
    pub artist_name: String,
    pub event_date: DateTime<Utc>,
    #[serde(default)]
    pub venue_name: Option<String>,
    #[serde(default)]
    pub venue_address: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub ticket_url: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub price_min: Option<f64>,
    #[serde(default)]
    pub price_max: Option<f64>,
    #[serde(default)]
    pub currency: Option<String>,
    pub status: EventStatus,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct NewEvent {
    pub external_id: String,
    pub name: String,
    pub artist_id: Uuid,
    pub artist_name: String,
    pub event_date: DateTime<Utc>,
    pub venue_name: Option<String>,
    pub venue_address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub country: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub ticket_url: Option<String>,
    pub image_url: Option<String>,
    pub price_min: Option<f64>,
    pub price_max: Option<f64>,
    pub currency: Option<String>,
    pub status: EventStatus,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FollowedArtist {
    pub user_id: Uuid,
    pub artist_id: Uuid,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Ios,
    Android,
    Web,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Ios => "ios",
            Platform::Android => "android",
            Platform::Web => "web",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ios" => Some(Platform::Ios),
            "android" => Some(Platform::Android),
            "web" => Some(Platform::Web),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PushToken {
    pub user_id: Uuid,
    pub token: String,
    pub platform: Platform,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: Uuid,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub notifications_enabled: bool,
    #[serde(default)]
    pub location_enabled: bool,
    #[serde(default)]
    pub biometrics_enabled: bool,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Profile {
    pub fn empty(id: Uuid) -> Self {
        Profile {
            id,
            username: None,
            full_name: None,
            avatar_url: None,
            notifications_enabled: false,
            location_enabled: false,
            biometrics_enabled: false,
            updated_at: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewIssueReport {
    pub user_id: Uuid,
    pub description: String,
    pub screenshot_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

// Spotify Web API

#[derive(Clone, Debug, Deserialize)]
pub struct AccessTokenResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpotifyImage {
    pub url: String,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub width: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpotifyFollowers {
    #[serde(default)]
    pub total: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpotifyArtist {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub genres: Vec<String>,
    #[serde(default)]
    pub images: Vec<SpotifyImage>,
    #[serde(default)]
    pub followers: Option<SpotifyFollowers>,
    #[serde(default)]
    pub popularity: Option<i32>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct SpotifyArtistPage {
    pub items: Vec<SpotifyArtist>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct SpotifySearchResponse {
    pub artists: SpotifyArtistPage,
}

#[derive(Clone, Debug, Deserialize)]
pub struct SpotifyBatchArtistsResponse {
    pub artists: Vec<Option<SpotifyArtist>>,
}

// Ticketmaster Discovery API

#[derive(Clone, Debug, Default, Deserialize)]
pub struct TmNamed {
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct TmAttraction {
    pub id: String,
    pub name: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct TmAttractionsEmbedded {
    #[serde(default)]
    pub attractions: Vec<TmAttraction>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct TmAttractionSearchResponse {
    #[serde(rename = "_embedded", default)]
    pub embedded: Option<TmAttractionsEmbedded>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct TmStart {
    #[serde(rename = "localDate", default)]
    pub local_date: Option<String>,
    #[serde(rename = "localTime", default)]
    pub local_time: Option<String>,
    #[serde(rename = "dateTime", default)]
    pub date_time: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct TmStatus {
    #[serde(default)]
    pub code: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct TmDates {
    #[serde(default)]
    pub start: Option<TmStart>,
    #[serde(default)]
    pub status: Option<TmStatus>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct TmImage {
    pub url: String,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct TmPriceRange {
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    #[serde(default)]
    pub currency: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct TmAddress {
    #[serde(default)]
    pub line1: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct TmState {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "stateCode", default)]
    pub state_code: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct TmCountry {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "countryCode", default)]
    pub country_code: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct TmLocation {
    pub latitude: String,
    pub longitude: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct TmVenue {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub address: Option<TmAddress>,
    #[serde(default)]
    pub city: Option<TmNamed>,
    #[serde(default)]
    pub state: Option<TmState>,
    #[serde(default)]
    pub country: Option<TmCountry>,
    #[serde(default)]
    pub location: Option<TmLocation>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct TmEventEmbedded {
    #[serde(default)]
    pub venues: Vec<TmVenue>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct TmEvent {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub dates: TmDates,
    #[serde(default)]
    pub images: Vec<TmImage>,
    #[serde(rename = "priceRanges", default)]
    pub price_ranges: Vec<TmPriceRange>,
    #[serde(rename = "_embedded", default)]
    pub embedded: Option<TmEventEmbedded>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct TmEventsEmbedded {
    #[serde(default)]
    pub events: Vec<TmEvent>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct TmEventSearchResponse {
    #[serde(rename = "_embedded", default)]
    pub embedded: Option<TmEventsEmbedded>,
}

// Expo push service

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExpoPushMessage {
    pub to: String,
    pub title: String,
    pub body: String,
    pub data: serde_json::Value,
    pub sound: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ExpoTicketDetails {
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ExpoPushTicket {
    pub status: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub details: Option<ExpoTicketDetails>,
}

impl ExpoPushTicket {
    pub fn is_ok(&self) -> bool { self.status == "ok" }

    /// The Expo push token is no longer valid and should be removed
    pub fn device_not_registered(&self) -> bool {
        self.details
            .as_ref()
            .and_then(|details| details.error.as_deref())
            == Some("DeviceNotRegistered")
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct ExpoSendResponse {
    #[serde(default)]
    pub data: Vec<ExpoPushTicket>,
}
