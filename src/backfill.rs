//! Background event backfill for newly followed artists.
//!
//! Following an artist must not wait on Ticketmaster, so the follow path only enqueues a job here and a single
//! worker task drains the queue.  Events the backfill inserts count as newly announced for the artist's other
//! followers, who are notified exactly as the scheduled refresh would have; the new follower is not.

use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

use crate::{events_service::EventsService, metrics, push::PushService, store::Store};

#[derive(Clone, Debug, PartialEq)]
pub struct BackfillJob {
    pub artist_id: Uuid,
    pub artist_name: String,
    /// The user whose follow triggered the job
    pub follower_id: Uuid,
}

#[derive(Clone)]
pub struct BackfillQueue {
    tx: mpsc::Sender<BackfillJob>,
}

impl BackfillQueue {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<BackfillJob>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (BackfillQueue { tx }, rx)
    }

    /// Queues a job without waiting.  Returns `false` if the queue is full or the worker is gone; the job is then
    /// dropped and the artist's events arrive with the next scheduled refresh instead.
    pub fn enqueue(&self, job: BackfillJob) -> bool {
        match self.tx.try_send(job) {
            Ok(()) => true,
            Err(TrySendError::Full(job)) => {
                warn!(
                    "Backfill queue is full; dropping job for artist {} ({:?})",
                    job.artist_id, job.artist_name
                );
                metrics::backfill_jobs_failure_total().inc();
                false
            },
            Err(TrySendError::Closed(job)) => {
                error!(
                    "Backfill worker has stopped; dropping job for artist {} ({:?})",
                    job.artist_id, job.artist_name
                );
                metrics::backfill_jobs_failure_total().inc();
                false
            },
        }
    }
}

async fn run_job(store: &dyn Store, events: &EventsService, push: &PushService, job: BackfillJob) -> bool {
    let artist = match store.find_artist(job.artist_id).await {
        Ok(Some(artist)) => artist,
        Ok(None) => {
            warn!("Artist {} was removed before its events could be backfilled", job.artist_id);
            return false;
        },
        Err(err) => {
            error!("Error loading artist {} for backfill: {:?}", job.artist_id, err);
            return false;
        },
    };

    match events.fetch_and_save_artist_events(&artist).await {
        Ok(report) => {
            info!(
                "Backfilled events for artist {:?}: {} new, {} updated",
                artist.name, report.inserted, report.updated
            );
            if !report.new_events.is_empty() {
                push.notify_followers_of_new_events(&artist, &report.new_events, Some(job.follower_id))
                    .await;
            }
            true
        },
        Err(err) => {
            error!("Error backfilling events for artist {:?}: {}", artist.name, err);
            false
        },
    }
}

/// Drains the backfill queue until every `BackfillQueue` handle has been dropped.
pub async fn run_backfill_worker(
    mut rx: mpsc::Receiver<BackfillJob>,
    store: Arc<dyn Store>,
    events: Arc<EventsService>,
    push: Arc<PushService>,
) {
    info!("Backfill worker started");
    while let Some(job) = rx.recv().await {
        if run_job(store.as_ref(), &events, &push, job).await {
            metrics::backfill_jobs_success_total().inc();
        } else {
            metrics::backfill_jobs_failure_total().inc();
        }
    }
    info!("Backfill queue closed; worker exiting");
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::{
        events_service::tests::{insert_artist, mount_ticketmaster, tm_event_json},
        events_service::DEFAULT_RETENTION_DAYS,
        models::{ExpoPushMessage, Platform},
        push::ExpoPushClient,
        store::MemoryStore,
        ticketmaster_api::TicketmasterClient,
    };

    #[test]
    fn full_queue_rejects_without_blocking() {
        let (queue, _rx) = BackfillQueue::new(1);
        let job = BackfillJob {
            artist_id: Uuid::new_v4(),
            artist_name: "a".into(),
            follower_id: Uuid::new_v4(),
        };
        assert!(queue.enqueue(job.clone()));
        assert!(!queue.enqueue(job));
    }

    #[test]
    fn closed_queue_rejects() {
        let (queue, rx) = BackfillQueue::new(4);
        drop(rx);
        assert!(!queue.enqueue(BackfillJob {
            artist_id: Uuid::new_v4(),
            artist_name: "a".into(),
            follower_id: Uuid::new_v4(),
        }));
    }

    fn future_date(days: i64) -> String {
        (Utc::now() + Duration::days(days))
            .format("%Y-%m-%dT%H:%M:%SZ")
            .to_string()
    }

    fn services(store: Arc<MemoryStore>, server: &MockServer) -> (Arc<EventsService>, Arc<PushService>) {
        let events = Arc::new(EventsService::new(
            store.clone(),
            Arc::new(TicketmasterClient::new("key").with_base_url(&server.uri())),
            DEFAULT_RETENTION_DAYS,
        ));
        let push = Arc::new(PushService::new(
            store,
            ExpoPushClient::new(None).with_url(&format!("{}/push/send", server.uri())),
        ));
        (events, push)
    }

    #[tokio::test]
    async fn worker_saves_events_and_exits_when_queue_is_dropped() {
        let server = MockServer::start().await;
        mount_ticketmaster(&server, vec![tm_event_json("e1", &future_date(10), "onsale")]).await;
        // The only follower is the one who triggered the job, so nobody is notified
        Mock::given(method("POST"))
            .and(path("/push/send"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let store = Arc::new(MemoryStore::new());
        let artist = insert_artist(&store, "jb").await;
        let follower = Uuid::new_v4();
        store.insert_follow(follower, artist.id).await.unwrap();
        store
            .upsert_push_token(follower, "ExponentPushToken[follower]", Platform::Ios)
            .await
            .unwrap();
        let (events, push) = services(store.clone(), &server);

        let (queue, rx) = BackfillQueue::new(8);
        let worker = tokio::spawn(run_backfill_worker(rx, store.clone(), events, push));
        assert!(queue.enqueue(BackfillJob {
            artist_id: artist.id,
            artist_name: artist.name.clone(),
            follower_id: follower,
        }));
        // Unknown artists are logged and skipped without stopping the worker
        assert!(queue.enqueue(BackfillJob {
            artist_id: Uuid::new_v4(),
            artist_name: "gone".into(),
            follower_id: follower,
        }));
        drop(queue);

        worker.await.unwrap();
        assert_eq!(store.event_count(), 1);
    }

    #[tokio::test]
    async fn backfilled_events_reach_existing_followers_once() {
        let server = MockServer::start().await;
        mount_ticketmaster(&server, vec![tm_event_json("e1", &future_date(10), "onsale")]).await;
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
        let existing = Uuid::new_v4();
        let newcomer = Uuid::new_v4();
        for (user, token) in [(existing, "ExponentPushToken[existing]"), (newcomer, "ExponentPushToken[newcomer]")] {
            store.insert_follow(user, artist.id).await.unwrap();
            store.upsert_push_token(user, token, Platform::Android).await.unwrap();
        }
        let (events, push) = services(store.clone(), &server);

        let (queue, rx) = BackfillQueue::new(8);
        let worker = tokio::spawn(run_backfill_worker(rx, store.clone(), events.clone(), push.clone()));
        assert!(queue.enqueue(BackfillJob {
            artist_id: artist.id,
            artist_name: artist.name.clone(),
            follower_id: newcomer,
        }));
        drop(queue);
        worker.await.unwrap();

        let requests = server.received_requests().await.unwrap();
        let pushes: Vec<_> = requests.iter().filter(|req| req.url.path() == "/push/send").collect();
        assert_eq!(pushes.len(), 1);
        let sent: Vec<ExpoPushMessage> = serde_json::from_slice(&pushes[0].body).unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "ExponentPushToken[existing]");

        // The refresh that follows sees nothing new and sends nothing more (the mock expects a single push)
        let report = events.refresh_all_events(&push).await;
        assert_eq!(report.inserted, 0);
        assert_eq!(report.notifications_sent, 0);
    }
}
