use std::{env, str::FromStr};

pub struct SupabaseConf {
    pub url: String,
    pub service_key: String,
}

pub struct Conf {
    pub spotify_client_id: String,
    pub spotify_client_secret: String,
    pub ticketmaster_api_key: String,
    /// When unset the service keeps everything in process memory, which is only useful for local development
    pub supabase: Option<SupabaseConf>,
    pub expo_access_token: Option<String>,
    pub event_refresh_interval_secs: u64,
    pub event_retention_days: i64,
    pub profile_cache_path: String,
    pub backfill_queue_capacity: usize,
    /// Bearer token required by the `/functions/*` routes.  They are open when unset.
    pub admin_api_token: Option<String>,
}

fn required_var(name: &str) -> Result<String, String> {
    env::var(name).map_err(|_| format!("The `{}` environment variable must be set.", name))
}

fn optional_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|val| !val.trim().is_empty())
}

fn parsed_var<T: FromStr>(name: &str, default: T) -> Result<T, String> {
    match optional_var(name) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| format!("The `{}` environment variable is invalid: {:?}", name, raw)),
        None => Ok(default),
    }
}

impl Conf {
    pub fn build_from_env() -> Result<Self, String> {
        if let Err(err) = dotenv::dotenv() {
            // Not having a `.env` file is fine; everything can come from the real environment
            debug!("No dotenv file loaded: {:?}", err);
        }

        let supabase = match (optional_var("SUPABASE_URL"), optional_var("SUPABASE_SERVICE_KEY")) {
            (Some(url), Some(service_key)) => Some(SupabaseConf { url, service_key }),
            (None, None) => None,
            (Some(_), None) => {
                return Err("`SUPABASE_SERVICE_KEY` must be set when `SUPABASE_URL` is set.".into())
            },
            (None, Some(_)) => {
                return Err("`SUPABASE_URL` must be set when `SUPABASE_SERVICE_KEY` is set.".into())
            },
        };

        Ok(Conf {
            spotify_client_id: required_var("SPOTIFY_CLIENT_ID")?,
            spotify_client_secret: required_var("SPOTIFY_CLIENT_SECRET")?,
            ticketmaster_api_key: required_var("TICKETMASTER_API_KEY")?,
            supabase,
            expo_access_token: optional_var("EXPO_ACCESS_TOKEN"),
            event_refresh_interval_secs: parsed_var("EVENT_REFRESH_INTERVAL_SECS", 6 * 60 * 60)?,
            event_retention_days: parsed_var("EVENT_RETENTION_DAYS", 7)?,
            profile_cache_path: optional_var("PROFILE_CACHE_PATH")
                .unwrap_or_else(|| "./profile_cache.kv".into()),
            backfill_queue_capacity: parsed_var("BACKFILL_QUEUE_CAPACITY", 256)?,
            admin_api_token: optional_var("ADMIN_API_TOKEN"),
        })
    }
}
