//! Expo push notification delivery: single-user sends and the new-event fan-out to an artist's followers.

use std::sync::Arc;

use reqwest::header::AUTHORIZATION;
use uuid::Uuid;

use crate::{
    api_util::{get_reqwest_client, send_json_request},
    error::ApiError,
    metrics,
    models::{Artist, Event, ExpoPushMessage, ExpoPushTicket, ExpoSendResponse},
    store::Store,
};

const EXPO_PUSH_URL: &str = "https://exp.host/--/api/v2/push/send";
const SERVICE: &str = "expo";
/// Expo rejects requests carrying more than 100 messages
pub const MAX_MESSAGES_PER_REQUEST: usize = 100;

pub struct ExpoPushClient {
    url: String,
    access_token: Option<String>,
}

impl ExpoPushClient {
    pub fn new(access_token: Option<String>) -> Self {
        ExpoPushClient {
            url: EXPO_PUSH_URL.into(),
            access_token,
        }
    }

    pub fn with_url(mut self, url: &str) -> Self {
        self.url = url.to_owned();
        self
    }

    /// Sends `messages` in batches of at most 100.  The returned tickets line up with the input messages.
    pub async fn send(&self, messages: &[ExpoPushMessage]) -> Result<Vec<ExpoPushTicket>, ApiError> {
        let mut tickets = Vec::with_capacity(messages.len());

        for chunk in messages.chunks(MAX_MESSAGES_PER_REQUEST) {
            let client = get_reqwest_client().await;
            let res: Option<ExpoSendResponse> = send_json_request(SERVICE, "push_send", &self.url, || {
                let req = client.post(&self.url).json(chunk);
                match &self.access_token {
                    Some(token) => req.header(AUTHORIZATION, format!("Bearer {}", token)),
                    None => req,
                }
            })
            .await?;
            let res = res.ok_or_else(|| ApiError::NotFound(self.url.clone()))?;

            if res.data.len() != chunk.len() {
                warn!(
                    "Expo returned {} tickets for {} messages",
                    res.data.len(),
                    chunk.len()
                );
            }
            tickets.extend(res.data);
        }

        Ok(tickets)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PushReport {
    pub sent: usize,
    pub failed: usize,
}

pub struct PushService {
    store: Arc<dyn Store>,
    expo: ExpoPushClient,
}

fn format_event_body(event: &Event) -> String {
    let date = event.event_date.format("%b %-d, %Y");
    match event.venue_name.as_deref() {
        Some(venue) => format!("{} - {} at {}", event.name, date, venue),
        None => format!("{} - {}", event.name, date),
    }
}

impl PushService {
    pub fn new(store: Arc<dyn Store>, expo: ExpoPushClient) -> Self { PushService { store, expo } }

    /// Sends the messages and tallies the tickets.  Tokens Expo reports as no longer registered are removed from
    /// the store so they aren't retried on the next fan-out.
    async fn deliver(&self, messages: Vec<ExpoPushMessage>) -> PushReport {
        let mut report = PushReport::default();
        if messages.is_empty() {
            return report;
        }

        let tickets = match self.expo.send(&messages).await {
            Ok(tickets) => tickets,
            Err(err) => {
                error!("Error sending {} push messages: {:?}", messages.len(), err);
                report.failed = messages.len();
                metrics::push_messages_failed_total().inc_by(report.failed as u64);
                return report;
            },
        };

        for (message, ticket) in messages.iter().zip(tickets.iter()) {
            if ticket.is_ok() {
                report.sent += 1;
                continue;
            }

            report.failed += 1;
            warn!(
                "Push to {} was rejected: {:?}",
                message.to,
                ticket.message.as_deref().unwrap_or("unknown error")
            );
            if ticket.device_not_registered() {
                match self.store.delete_push_token_value(&message.to).await {
                    Ok(count) => info!("Removed {} unregistered push token rows for {}", count, message.to),
                    Err(err) => error!("Error removing unregistered push token {}: {:?}", message.to, err),
                }
            }
        }
        // Messages Expo didn't return a ticket for
        report.failed += messages.len().saturating_sub(tickets.len());

        metrics::push_messages_sent_total().inc_by(report.sent as u64);
        metrics::push_messages_failed_total().inc_by(report.failed as u64);
        report
    }

    /// Sends one notification to every device registered for each of the users.
    pub async fn notify_users(
        &self,
        user_ids: &[Uuid],
        title: &str,
        body: &str,
        data: serde_json::Value,
    ) -> Result<PushReport, ApiError> {
        let tokens = self.store.push_tokens_for_users(user_ids).await?;
        if tokens.is_empty() {
            debug!("No push tokens registered for {} users", user_ids.len());
        }

        let messages = tokens
            .into_iter()
            .map(|token| ExpoPushMessage {
                to: token.token,
                title: title.to_owned(),
                body: body.to_owned(),
                data: data.clone(),
                sound: Some("default".into()),
            })
            .collect();
        Ok(self.deliver(messages).await)
    }

    pub async fn notify_user(
        &self,
        user_id: Uuid,
        title: &str,
        body: &str,
        data: serde_json::Value,
    ) -> Result<PushReport, ApiError> {
        self.notify_users(&[user_id], title, body, data).await
    }

    /// Tells every follower of `artist` about each newly announced event, one message per device and event.
    /// `skip_user` is left out of the fan-out; a user who just followed the artist is not told about its calendar.
    pub async fn notify_followers_of_new_events(
        &self,
        artist: &Artist,
        events: &[Event],
        skip_user: Option<Uuid>,
    ) -> PushReport {
        if events.is_empty() {
            return PushReport::default();
        }

        let follower_ids: Vec<Uuid> = match self.store.follower_ids(artist.id).await {
            Ok(ids) => ids.into_iter().filter(|id| Some(*id) != skip_user).collect(),
            Err(err) => {
                error!("Error loading followers of artist {}: {:?}", artist.id, err);
                return PushReport::default();
            },
        };
        if follower_ids.is_empty() {
            return PushReport::default();
        }

        let tokens = match self.store.push_tokens_for_users(&follower_ids).await {
            Ok(tokens) => tokens,
            Err(err) => {
                error!("Error loading push tokens for followers of artist {}: {:?}", artist.id, err);
                return PushReport::default();
            },
        };

        let title = format!("New concert: {}", artist.name);
        let mut messages = Vec::with_capacity(tokens.len() * events.len());
        for token in &tokens {
            for event in events {
                messages.push(ExpoPushMessage {
                    to: token.token.clone(),
                    title: title.clone(),
                    body: format_event_body(event),
                    data: serde_json::json!({
                        "type": "new_event",
                        "eventId": event.id,
                        "artistId": artist.id,
                    }),
                    sound: Some("default".into()),
                });
            }
        }

        let report = self.deliver(messages).await;
        info!(
            "Notified {} devices of {} new events for artist {:?}: {} sent, {} failed",
            tokens.len(),
            events.len(),
            artist.name,
            report.sent,
            report.failed
        );
        report
    }
}
