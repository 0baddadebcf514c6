//! Client for the Ticketmaster Discovery API plus the mapping from Ticketmaster events into our event rows.

use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};

use crate::{
    api_util::{get_reqwest_client, send_json_request},
    error::ApiError,
    models::{
        Artist, EventStatus, NewEvent, TmAttraction, TmAttractionSearchResponse, TmEvent,
        TmEventSearchResponse,
    },
};

const TICKETMASTER_BASE_URL: &str = "https://app.ticketmaster.com";
const SERVICE: &str = "ticketmaster";
const ATTRACTION_SEARCH_SIZE: usize = 20;
/// Maximum number of upcoming events fetched per attraction
pub const EVENT_FETCH_LIMIT: usize = 50;

pub struct TicketmasterClient {
    api_key: String,
    base_url: String,
}

impl TicketmasterClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        TicketmasterClient {
            api_key: api_key.into(),
            base_url: TICKETMASTER_BASE_URL.into(),
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').into();
        self
    }

    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        endpoint_name: &'static str,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<Option<T>, ApiError> {
        let url = format!("{}/discovery/v2/{}", self.base_url, path);
        let client = get_reqwest_client().await;

        send_json_request(SERVICE, endpoint_name, &url, || {
            client
                .get(&url)
                .query(&[("apikey", self.api_key.as_str())])
                .query(params)
        })
        .await
    }

    pub async fn search_attractions(
        &self,
        keyword: &str,
        genre_hint: Option<&str>,
    ) -> Result<Vec<TmAttraction>, ApiError> {
        let mut params = vec![
            ("keyword", keyword.to_owned()),
            ("size", ATTRACTION_SEARCH_SIZE.to_string()),
        ];
        if let Some(genre) = genre_hint.filter(|genre| !genre.trim().is_empty()) {
            params.push(("classificationName", genre.to_owned()));
        }

        let res: Option<TmAttractionSearchResponse> =
            self.get("attractions", "attractions.json", &params).await?;
        Ok(res
            .and_then(|res| res.embedded)
            .map(|embedded| embedded.attractions)
            .unwrap_or_default())
    }

    /// Finds the attraction for an artist name.  The best match is simply the first search result.  If the genre
    /// hint filters everything out, the search is repeated once without it.
    pub async fn find_attraction(
        &self,
        artist_name: &str,
        genre_hint: Option<&str>,
    ) -> Result<Option<TmAttraction>, ApiError> {
        let mut attractions = self.search_attractions(artist_name, genre_hint).await?;
        if attractions.is_empty() && genre_hint.is_some() {
            debug!(
                "No attractions for {:?} with genre {:?}; retrying without genre",
                artist_name, genre_hint
            );
            attractions = self.search_attractions(artist_name, None).await?;
        }

        Ok(attractions.into_iter().next())
    }

    /// `None` if Ticketmaster no longer knows the attraction
    pub async fn get_attraction(&self, attraction_id: &str) -> Result<Option<TmAttraction>, ApiError> {
        self.get(
            "attraction",
            &format!("attractions/{}.json", attraction_id),
            &[],
        )
        .await
    }

    /// Returns up to `EVENT_FETCH_LIMIT` events for the attraction starting after `now`, sorted by date ascending.
    pub async fn upcoming_events(
        &self,
        attraction_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<TmEvent>, ApiError> {
        let params = [
            ("attractionId", attraction_id.to_owned()),
            ("size", EVENT_FETCH_LIMIT.to_string()),
            ("sort", "date,asc".to_owned()),
            ("startDateTime", now.format("%Y-%m-%dT%H:%M:%SZ").to_string()),
        ];

        let res: Option<TmEventSearchResponse> = self.get("events", "events.json", &params).await?;
        Ok(res
            .and_then(|res| res.embedded)
            .map(|embedded| embedded.events)
            .unwrap_or_default())
    }
}

pub fn map_status(code: &str) -> EventStatus {
    match code.to_ascii_lowercase().as_str() {
        "onsale" => EventStatus::OnSale,
        "offsale" => EventStatus::SoldOut,
        "cancelled" | "canceled" => EventStatus::Cancelled,
        "postponed" | "rescheduled" => EventStatus::Postponed,
        _ => EventStatus::Announced,
    }
}

fn event_date(event: &TmEvent) -> Option<DateTime<Utc>> {
    let start = event.dates.start.as_ref()?;
    if let Some(date_time) = start.date_time {
        return Some(date_time);
    }

    let date = NaiveDate::parse_from_str(start.local_date.as_deref()?, "%Y-%m-%d").ok()?;
    let naive = match start
        .local_time
        .as_deref()
        .and_then(|time| NaiveTime::parse_from_str(time, "%H:%M:%S").ok())
    {
        Some(time) => date.and_time(time),
        None => date.and_hms_opt(0, 0, 0)?,
    };
    Some(Utc.from_utc_datetime(&naive))
}

/// Maps a Ticketmaster event into an event row for `artist`.  Events without any start date can't be placed on
/// a calendar and are skipped.
pub fn map_event(event: TmEvent, artist: &Artist, now: DateTime<Utc>) -> Option<NewEvent> {
    let Some(event_date) = event_date(&event) else {
        warn!(
            "Skipping Ticketmaster event {} ({:?}) without a start date",
            event.id, event.name
        );
        return None;
    };

    let status = event
        .dates
        .status
        .as_ref()
        .and_then(|status| status.code.as_deref())
        .map(map_status)
        .unwrap_or(EventStatus::Announced);
    let image_url = event
        .images
        .iter()
        .max_by_key(|image| image.width.unwrap_or(0))
        .map(|image| image.url.clone());
    let price = event.price_ranges.first();
    let venue = event
        .embedded
        .as_ref()
        .and_then(|embedded| embedded.venues.first());
    let location = venue.and_then(|venue| venue.location.as_ref());

    Some(NewEvent {
        external_id: event.id,
        name: event.name,
        artist_id: artist.id,
        artist_name: artist.name.clone(),
        event_date,
        venue_name: venue.and_then(|venue| venue.name.clone()),
        venue_address: venue
            .and_then(|venue| venue.address.as_ref())
            .and_then(|address| address.line1.clone()),
        city: venue
            .and_then(|venue| venue.city.as_ref())
            .and_then(|city| city.name.clone()),
        state: venue
            .and_then(|venue| venue.state.as_ref())
            .and_then(|state| state.state_code.clone().or_else(|| state.name.clone())),
        country: venue
            .and_then(|venue| venue.country.as_ref())
            .and_then(|country| country.country_code.clone().or_else(|| country.name.clone())),
        latitude: location.and_then(|location| location.latitude.parse().ok()),
        longitude: location.and_then(|location| location.longitude.parse().ok()),
        ticket_url: event.url,
        image_url,
        price_min: price.and_then(|price| price.min),
        price_max: price.and_then(|price| price.max),
        currency: price.and_then(|price| price.currency.clone()),
        status,
        updated_at: now,
    })
}
