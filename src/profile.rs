//! Profile mirror: the remote `profiles` row plus a locally cached copy, avatar uploads and issue reports.
//!
//! The signed-in device is the only writer, so there is no conflict handling; the last write wins.

use std::sync::Arc;

use base64::Engine;
use chrono::Utc;
use thiserror::Error;
use uuid::Uuid;

use crate::{
    local_cache::{get_json, set_json, KeyValueStore},
    models::{NewIssueReport, Profile},
    store::Store,
    supabase::{SupabaseClient, AVATARS_BUCKET, ISSUE_SCREENSHOTS_BUCKET},
};

pub const MAX_ISSUE_DESCRIPTION_LEN: usize = 5000;

#[derive(Error, Debug, PartialEq)]
pub enum ProfileError {
    /// The caller sent something we won't accept
    #[error("{0}")]
    Invalid(String),
    #[error("{0}")]
    Failed(String),
}

/// Fields a client may change on its profile.  Absent fields are left as they are.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileUpdate {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub notifications_enabled: Option<bool>,
    #[serde(default)]
    pub location_enabled: Option<bool>,
    #[serde(default)]
    pub biometrics_enabled: Option<bool>,
}

impl ProfileUpdate {
    fn apply(self, profile: &mut Profile) {
        if let Some(username) = self.username {
            profile.username = Some(username);
        }
        if let Some(full_name) = self.full_name {
            profile.full_name = Some(full_name);
        }
        if let Some(enabled) = self.notifications_enabled {
            profile.notifications_enabled = enabled;
        }
        if let Some(enabled) = self.location_enabled {
            profile.location_enabled = enabled;
        }
        if let Some(enabled) = self.biometrics_enabled {
            profile.biometrics_enabled = enabled;
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IssueReport {
    pub user_id: Uuid,
    pub description: String,
    /// Base64-encoded PNG or JPEG
    #[serde(default)]
    pub screenshot: Option<String>,
}

fn image_extension(content_type: &str) -> Option<&'static str> {
    match content_type {
        "image/png" => Some("png"),
        "image/jpeg" | "image/jpg" => Some("jpg"),
        "image/webp" => Some("webp"),
        _ => None,
    }
}

/// Sniffs the image type of a decoded screenshot from its magic bytes
fn sniff_image_type(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(&[0x89, b'P', b'N', b'G']) {
        Some("image/png")
    } else if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some("image/jpeg")
    } else {
        None
    }
}

fn cache_key(user_id: Uuid) -> String { format!("profile:{}", user_id) }

pub struct ProfileSync<K: KeyValueStore> {
    store: Arc<dyn Store>,
    kv: K,
    storage: Option<Arc<SupabaseClient>>,
}

impl<K: KeyValueStore> ProfileSync<K> {
    pub fn new(store: Arc<dyn Store>, kv: K, storage: Option<Arc<SupabaseClient>>) -> Self {
        ProfileSync { store, kv, storage }
    }

    fn storage(&self) -> Result<&SupabaseClient, ProfileError> {
        self.storage
            .as_deref()
            .ok_or_else(|| ProfileError::Failed("File storage is not configured".into()))
    }

    async fn cache(&self, profile: &Profile) {
        if let Err(err) = set_json(&self.kv, &cache_key(profile.id), profile).await {
            warn!("Error caching profile {}: {}", profile.id, err);
        }
    }

    async fn cached(&self, user_id: Uuid) -> Option<Profile> {
        get_json(&self.kv, &cache_key(user_id))
            .await
            .unwrap_or_else(|err| {
                warn!("Ignoring unreadable cached profile for {}: {}", user_id, err);
                None
            })
    }

    /// Fetches the remote profile and refreshes the cached copy.
    pub async fn sync(&self, user_id: Uuid) -> Result<Option<Profile>, ProfileError> {
        let profile = self.store.get_profile(user_id).await.map_err(|err| {
            error!("Error fetching profile {}: {:?}", user_id, err);
            ProfileError::Failed("Error fetching profile".into())
        })?;

        match &profile {
            Some(profile) => self.cache(profile).await,
            None => debug!("No remote profile for user {}", user_id),
        }
        Ok(profile)
    }

    /// Returns the cached profile, going to the backend only on a cache miss.
    pub async fn load(&self, user_id: Uuid) -> Result<Option<Profile>, ProfileError> {
        if let Some(profile) = self.cached(user_id).await {
            return Ok(Some(profile));
        }
        self.sync(user_id).await
    }

    async fn save(&self, profile: &Profile) -> Result<Profile, ProfileError> {
        let saved = self.store.upsert_profile(profile).await.map_err(|err| {
            error!("Error saving profile {}: {:?}", profile.id, err);
            ProfileError::Failed("Error saving profile".into())
        })?;
        self.cache(&saved).await;
        Ok(saved)
    }

    /// Applies the update to the current remote profile (creating it if needed), then mirrors the result locally.
    pub async fn update(&self, user_id: Uuid, update: ProfileUpdate) -> Result<Profile, ProfileError> {
        let mut profile = self
            .sync(user_id)
            .await?
            .unwrap_or_else(|| Profile::empty(user_id));
        update.apply(&mut profile);
        self.save(&profile).await
    }

    /// Uploads a new avatar image to the `avatars` bucket and points the profile at it.
    pub async fn upload_avatar(
        &self,
        user_id: Uuid,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<Profile, ProfileError> {
        let extension = image_extension(content_type)
            .ok_or_else(|| ProfileError::Invalid(format!("Unsupported image type: {}", content_type)))?;
        if bytes.is_empty() {
            return Err(ProfileError::Invalid("Empty image".into()));
        }

        let path = format!("{}/avatar.{}", user_id, extension);
        let url = self
            .storage()?
            .upload(AVATARS_BUCKET, &path, content_type, bytes)
            .await
            .map_err(|err| {
                error!("Error uploading avatar for user {}: {:?}", user_id, err);
                ProfileError::Failed("Error uploading avatar".into())
            })?;

        let mut profile = self
            .sync(user_id)
            .await?
            .unwrap_or_else(|| Profile::empty(user_id));
        profile.avatar_url = Some(url);
        self.save(&profile).await
    }

    /// Stores an issue report, uploading the optional screenshot to the `issue-screenshots` bucket first.
    pub async fn report_issue(&self, report: IssueReport) -> Result<(), ProfileError> {
        let description = report.description.trim();
        if description.is_empty() {
            return Err(ProfileError::Invalid("Issue description is required".into()));
        }
        if description.chars().count() > MAX_ISSUE_DESCRIPTION_LEN {
            return Err(ProfileError::Invalid(format!(
                "Issue description is longer than {} characters",
                MAX_ISSUE_DESCRIPTION_LEN
            )));
        }

        let screenshot_url = match report.screenshot.as_deref().filter(|s| !s.is_empty()) {
            Some(encoded) => {
                // Clients may send a data URL
                let encoded = encoded.rsplit_once(',').map(|(_, data)| data).unwrap_or(encoded);
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(encoded.trim())
                    .map_err(|err| {
                        warn!("Invalid screenshot encoding from user {}: {:?}", report.user_id, err);
                        ProfileError::Invalid("Screenshot is not valid base64".into())
                    })?;
                let content_type = sniff_image_type(&bytes)
                    .ok_or_else(|| ProfileError::Invalid("Screenshot must be a PNG or JPEG image".into()))?;
                let extension = image_extension(content_type).unwrap_or("png");

                let path = format!("{}/{}.{}", report.user_id, Uuid::new_v4(), extension);
                let url = self
                    .storage()?
                    .upload(ISSUE_SCREENSHOTS_BUCKET, &path, content_type, bytes)
                    .await
                    .map_err(|err| {
                        error!("Error uploading issue screenshot for user {}: {:?}", report.user_id, err);
                        ProfileError::Failed("Error uploading screenshot".into())
                    })?;
                Some(url)
            },
            None => None,
        };

        let new_report = NewIssueReport {
            user_id: report.user_id,
            description: description.to_owned(),
            screenshot_url,
            created_at: Utc::now(),
        };
        self.store
            .insert_issue_report(&new_report)
            .await
            .map_err(|err| {
                error!("Error saving issue report from user {}: {:?}", report.user_id, err);
                ProfileError::Failed("Error saving issue report".into())
            })?;
        info!("Saved issue report from user {}", report.user_id);
        Ok(())
    }
}
