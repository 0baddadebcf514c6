//! Thin client for the Supabase REST surface: PostgREST tables, Storage buckets and Edge Functions.  Every call is
//! a single request/response round trip.

use std::time::Instant;

use reqwest::{RequestBuilder, Response, StatusCode};
use serde::{de::DeserializeOwned, Serialize};

use crate::{
    api_util::{decode_json, get_reqwest_client},
    error::ApiError,
    metrics,
};

const SERVICE: &str = "supabase";
/// Postgres error code for unique constraint violations
const UNIQUE_VIOLATION: &str = "23505";

pub const AVATARS_BUCKET: &str = "avatars";
pub const ISSUE_SCREENSHOTS_BUCKET: &str = "issue-screenshots";

/// A single PostgREST filter, rendered as a `column=op.value` query parameter.
pub type Filter = (String, String);

pub fn eq(column: &str, value: impl ToString) -> Filter {
    (column.to_owned(), format!("eq.{}", value.to_string()))
}

pub fn lt(column: &str, value: impl ToString) -> Filter {
    (column.to_owned(), format!("lt.{}", value.to_string()))
}

pub fn gte(column: &str, value: impl ToString) -> Filter {
    (column.to_owned(), format!("gte.{}", value.to_string()))
}

pub fn in_list<T: ToString>(column: &str, values: &[T]) -> Filter {
    let values = values
        .iter()
        .map(|val| val.to_string())
        .collect::<Vec<_>>()
        .join(",");
    (column.to_owned(), format!("in.({})", values))
}

#[derive(Deserialize)]
struct PostgrestError {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

pub struct SupabaseClient {
    base_url: String,
    service_key: String,
}

impl SupabaseClient {
    pub fn new(base_url: &str, service_key: impl Into<String>) -> Self {
        SupabaseClient {
            base_url: base_url.trim_end_matches('/').into(),
            service_key: service_key.into(),
        }
    }

    fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("apikey", &self.service_key)
            .bearer_auth(&self.service_key)
    }

    fn table_url(&self, table: &str) -> String { format!("{}/rest/v1/{}", self.base_url, table) }

    pub fn public_url(&self, bucket: &str, path: &str) -> String {
        format!("{}/storage/v1/object/public/{}/{}", self.base_url, bucket, path)
    }

    async fn send(
        &self,
        endpoint_name: &'static str,
        builder: RequestBuilder,
    ) -> Result<Response, ApiError> {
        metrics::external_api_requests_total(SERVICE, endpoint_name).inc();
        let start = Instant::now();
        let res = self.authed(builder).send().await;
        metrics::external_api_response_time(SERVICE).observe(start.elapsed().as_secs_f64());

        res.map_err(|err| {
            error!("Error communicating with Supabase: {:?}", err);
            metrics::external_api_requests_failure_total(SERVICE, endpoint_name).inc();
            ApiError::Transport {
                service: SERVICE,
                source: err,
            }
        })
    }

    /// Checks the status of a PostgREST response, turning unique constraint violations into `ApiError::Duplicate`
    async fn process_response<T: DeserializeOwned>(
        &self,
        endpoint_name: &'static str,
        url: &str,
        res: Response,
    ) -> Result<T, ApiError> {
        let status = res.status();
        if status.is_success() {
            return decode_json(SERVICE, url, res).await;
        }

        let body = res.text().await.unwrap_or_default();
        let pg_err: Option<PostgrestError> = serde_json::from_str(&body).ok();
        let is_unique_violation = status == StatusCode::CONFLICT
            || pg_err
                .as_ref()
                .and_then(|err| err.code.as_deref())
                .map(|code| code == UNIQUE_VIOLATION)
                .unwrap_or(false);
        if is_unique_violation {
            debug!("Unique constraint violation from {}: {}", url, body);
            return Err(ApiError::Duplicate);
        }

        error!(
            "Got bad status code of {} from Supabase url={}: {:?}",
            status,
            url,
            pg_err.and_then(|err| err.message).unwrap_or_else(|| body.clone())
        );
        metrics::external_api_requests_failure_total(SERVICE, endpoint_name).inc();
        Err(ApiError::BadStatus {
            service: SERVICE,
            status: status.as_u16(),
            body,
        })
    }

    pub async fn select<T: DeserializeOwned>(
        &self,
        table: &str,
        columns: &str,
        filters: &[Filter],
        order: Option<&str>,
    ) -> Result<Vec<T>, ApiError> {
        let url = self.table_url(table);
        let mut builder = get_reqwest_client()
            .await
            .get(&url)
            .query(&[("select", columns)])
            .query(filters);
        if let Some(order) = order {
            builder = builder.query(&[("order", order)]);
        }

        let res = self.send("select", builder).await?;
        self.process_response("select", &url, res).await
    }

    pub async fn insert<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        table: &str,
        rows: &B,
    ) -> Result<Vec<T>, ApiError> {
        let url = self.table_url(table);
        let builder = get_reqwest_client()
            .await
            .post(&url)
            .header("Prefer", "return=representation")
            .json(rows);

        let res = self.send("insert", builder).await?;
        self.process_response("insert", &url, res).await
    }

    /// Insert-or-update keyed on the unique column(s) in `on_conflict`
    pub async fn upsert<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        table: &str,
        rows: &B,
        on_conflict: &str,
    ) -> Result<Vec<T>, ApiError> {
        let url = self.table_url(table);
        let builder = get_reqwest_client()
            .await
            .post(&url)
            .query(&[("on_conflict", on_conflict)])
            .header("Prefer", "return=representation,resolution=merge-duplicates")
            .json(rows);

        let res = self.send("upsert", builder).await?;
        self.process_response("upsert", &url, res).await
    }

    pub async fn update<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        table: &str,
        filters: &[Filter],
        patch: &B,
    ) -> Result<Vec<T>, ApiError> {
        if filters.is_empty() {
            return Err(ApiError::Invalid(format!("refusing unfiltered update of {}", table)));
        }

        let url = self.table_url(table);
        let builder = get_reqwest_client()
            .await
            .patch(&url)
            .query(filters)
            .header("Prefer", "return=representation")
            .json(patch);

        let res = self.send("update", builder).await?;
        self.process_response("update", &url, res).await
    }

    /// Deletes matching rows and returns them
    pub async fn delete<T: DeserializeOwned>(
        &self,
        table: &str,
        filters: &[Filter],
    ) -> Result<Vec<T>, ApiError> {
        if filters.is_empty() {
            return Err(ApiError::Invalid(format!("refusing unfiltered delete of {}", table)));
        }

        let url = self.table_url(table);
        let builder = get_reqwest_client()
            .await
            .delete(&url)
            .query(filters)
            .header("Prefer", "return=representation");

        let res = self.send("delete", builder).await?;
        self.process_response("delete", &url, res).await
    }

    /// Uploads (or overwrites) an object in a storage bucket and returns its public URL.
    pub async fn upload(
        &self,
        bucket: &str,
        path: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<String, ApiError> {
        let url = format!("{}/storage/v1/object/{}/{}", self.base_url, bucket, path);
        info!("Uploading {} bytes to storage bucket {}: {}", bytes.len(), bucket, path);
        let builder = get_reqwest_client()
            .await
            .post(&url)
            .header("Content-Type", content_type)
            .header("x-upsert", "true")
            .body(bytes);

        let res = self.send("storage_upload", builder).await?;
        let _: serde_json::Value = self.process_response("storage_upload", &url, res).await?;
        Ok(self.public_url(bucket, path))
    }

    /// Invokes an edge function hosted by the project
    pub async fn invoke_function<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        name: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let url = format!("{}/functions/v1/{}", self.base_url, name);
        let builder = get_reqwest_client().await.post(&url).json(body);

        let res = self.send("function", builder).await?;
        self.process_response("function", &url, res).await
    }
}
