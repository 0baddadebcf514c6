use std::sync::Arc;

use crate::{
    artist_service::ArtistService,
    backfill::BackfillQueue,
    events_service::EventsService,
    local_cache::LocalCache,
    profile::ProfileSync,
    push::{ExpoPushClient, PushService},
    spotify_api::SpotifyClient,
    store::Store,
    supabase::SupabaseClient,
    ticketmaster_api::TicketmasterClient,
};

/// Everything the route handlers need, managed by Rocket
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub artists: ArtistService,
    pub events: Arc<EventsService>,
    pub push: Arc<PushService>,
    pub profiles: ProfileSync<LocalCache>,
    pub admin_api_token: Option<String>,
}

pub struct AppStateBuilder {
    pub store: Arc<dyn Store>,
    pub spotify: SpotifyClient,
    pub ticketmaster: TicketmasterClient,
    pub expo: ExpoPushClient,
    pub storage: Option<Arc<SupabaseClient>>,
    pub profile_cache: LocalCache,
    pub backfill: BackfillQueue,
    pub event_retention_days: i64,
    pub admin_api_token: Option<String>,
}

impl AppStateBuilder {
    pub fn build(self) -> AppState {
        let events = Arc::new(EventsService::new(
            Arc::clone(&self.store),
            Arc::new(self.ticketmaster),
            self.event_retention_days,
        ));
        let push = Arc::new(PushService::new(Arc::clone(&self.store), self.expo));
        let artists = ArtistService::new(Arc::clone(&self.store), Arc::new(self.spotify), self.backfill);
        let profiles = ProfileSync::new(Arc::clone(&self.store), self.profile_cache, self.storage);

        AppState {
            store: self.store,
            artists,
            events,
            push,
            profiles,
            admin_api_token: self.admin_api_token,
        }
    }
}
