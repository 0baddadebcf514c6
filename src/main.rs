#[macro_use]
extern crate log;

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use showfollow_backend::{
    backfill::{run_backfill_worker, BackfillQueue},
    conf::Conf,
    local_cache::LocalCache,
    push::ExpoPushClient,
    routes::build_rocket,
    spotify_api::SpotifyClient,
    state::AppStateBuilder,
    store::{MemoryStore, Store, SupabaseStore},
    supabase::SupabaseClient,
    ticketmaster_api::TicketmasterClient,
};
use tokio::time::{interval_at, Instant, MissedTickBehavior};

#[rocket::main]
pub async fn main() {
    let conf = match Conf::build_from_env() {
        Ok(conf) => conf,
        Err(err) => {
            // Rocket hasn't installed its logger yet
            eprintln!("Invalid configuration: {}", err);
            std::process::exit(1);
        },
    };

    let storage = conf
        .supabase
        .as_ref()
        .map(|supabase| Arc::new(SupabaseClient::new(&supabase.url, supabase.service_key.clone())));
    let store: Arc<dyn Store> = match &storage {
        Some(client) => Arc::new(SupabaseStore::new(Arc::clone(client))),
        None => {
            eprintln!("Supabase is not configured; all data will be kept in memory and lost on exit");
            Arc::new(MemoryStore::new())
        },
    };

    let profile_cache = match LocalCache::open(&conf.profile_cache_path).await {
        Ok(cache) => cache,
        Err(err) => {
            eprintln!("Error opening profile cache at {}: {}", conf.profile_cache_path, err);
            std::process::exit(1);
        },
    };

    let (backfill, backfill_rx) = BackfillQueue::new(conf.backfill_queue_capacity);
    let state = AppStateBuilder {
        store: Arc::clone(&store),
        spotify: SpotifyClient::new(conf.spotify_client_id.clone(), conf.spotify_client_secret.clone()),
        ticketmaster: TicketmasterClient::new(conf.ticketmaster_api_key.clone()),
        expo: ExpoPushClient::new(conf.expo_access_token.clone()),
        storage,
        profile_cache,
        backfill,
        event_retention_days: conf.event_retention_days,
        admin_api_token: conf.admin_api_token.clone(),
    }
    .build();

    tokio::spawn(run_backfill_worker(
        backfill_rx,
        Arc::clone(&store),
        Arc::clone(&state.events),
        Arc::clone(&state.push),
    ));

    // Periodically refresh events for all followed artists, which also cleans up past events
    let events = Arc::clone(&state.events);
    let push = Arc::clone(&state.push);
    let refresh_period = Duration::from_secs(conf.event_refresh_interval_secs.max(60));
    tokio::spawn(async move {
        let mut interval = interval_at(Instant::now() + refresh_period, refresh_period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            info!("Starting scheduled event refresh at {}", Utc::now());
            events.refresh_all_events(&push).await;
        }
    });

    if let Err(err) = build_rocket(state).launch().await {
        error!("Error launching Rocket: {:?}", err);
        std::process::exit(1);
    }
    info!("Rocket exited cleanly");
}
