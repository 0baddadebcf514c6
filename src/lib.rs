#![allow(clippy::new_without_default)]

#[macro_use]
extern crate log;
#[macro_use]
extern crate serde_derive;

pub mod api_util;
pub mod artist_service;
pub mod backfill;
pub mod conf;
pub mod cors;
pub mod error;
pub mod events_service;
pub mod local_cache;
pub mod metrics;
pub mod models;
pub mod notifications;
pub mod profile;
pub mod push;
pub mod routes;
pub mod settings;
pub mod spotify_api;
pub mod spotify_token;
pub mod state;
pub mod store;
pub mod supabase;
pub mod ticketmaster_api;
