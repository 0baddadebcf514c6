//! Per-device settings toggles.  Each toggle is persisted as a boolean in the local key-value store, and only
//! turns on once the device capability behind it is actually available.

use async_trait::async_trait;
use uuid::Uuid;

use crate::{
    local_cache::{get_json, set_json, KeyValueStore},
    notifications::{DeviceNotifications, PushRegistrar, RegistrationState},
};

pub const BIOMETRICS_ENABLED_KEY: &str = "biometrics_enabled";
pub const LOCATION_ENABLED_KEY: &str = "location_enabled";
pub const NOTIFICATIONS_ENABLED_KEY: &str = "notifications_enabled";

const BIOMETRICS_PROMPT: &str = "Authenticate to enable biometric login";

#[async_trait]
pub trait BiometricAuthenticator: Send + Sync {
    async fn has_hardware(&self) -> bool;

    async fn is_enrolled(&self) -> bool;

    async fn authenticate(&self, prompt: &str) -> bool;
}

#[async_trait]
pub trait LocationPermissions: Send + Sync {
    /// Returns whether foreground location access was granted
    async fn request_permission(&self) -> bool;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingsSnapshot {
    pub biometrics_enabled: bool,
    pub location_enabled: bool,
    pub notifications_enabled: bool,
}

pub struct Settings<K: KeyValueStore, D: DeviceNotifications> {
    kv: K,
    biometrics: Box<dyn BiometricAuthenticator>,
    location: Box<dyn LocationPermissions>,
    push: PushRegistrar<D>,
}

impl<K: KeyValueStore, D: DeviceNotifications> Settings<K, D> {
    pub fn new(
        kv: K,
        biometrics: Box<dyn BiometricAuthenticator>,
        location: Box<dyn LocationPermissions>,
        push: PushRegistrar<D>,
    ) -> Self {
        Settings {
            kv,
            biometrics,
            location,
            push,
        }
    }

    async fn get_flag(&self, key: &str) -> bool {
        match get_json::<bool>(&self.kv, key).await {
            Ok(value) => value.unwrap_or(false),
            Err(err) => {
                warn!("Treating unreadable setting {} as disabled: {}", key, err);
                false
            },
        }
    }

    pub async fn snapshot(&self) -> SettingsSnapshot {
        SettingsSnapshot {
            biometrics_enabled: self.get_flag(BIOMETRICS_ENABLED_KEY).await,
            location_enabled: self.get_flag(LOCATION_ENABLED_KEY).await,
            notifications_enabled: self.get_flag(NOTIFICATIONS_ENABLED_KEY).await,
        }
    }

    /// Enabling requires biometric hardware, an enrolled biometric and a successful authentication.  Returns the
    /// value that was persisted.
    pub async fn set_biometrics(&self, enabled: bool) -> Result<bool, String> {
        let enabled = if !enabled {
            false
        } else if !self.biometrics.has_hardware().await {
            info!("Not enabling biometrics: device has no biometric hardware");
            false
        } else if !self.biometrics.is_enrolled().await {
            info!("Not enabling biometrics: no biometrics enrolled");
            false
        } else if !self.biometrics.authenticate(BIOMETRICS_PROMPT).await {
            info!("Not enabling biometrics: authentication failed");
            false
        } else {
            true
        };

        set_json(&self.kv, BIOMETRICS_ENABLED_KEY, &enabled).await?;
        Ok(enabled)
    }

    /// Enabling requires the location permission to be granted.  Returns the value that was persisted.
    pub async fn set_location(&self, enabled: bool) -> Result<bool, String> {
        let enabled = enabled && self.location.request_permission().await;
        set_json(&self.kv, LOCATION_ENABLED_KEY, &enabled).await?;
        Ok(enabled)
    }

    /// Registers or removes this device's push token.  Notifications count as enabled only once a token has been
    /// registered.
    pub async fn set_notifications(&self, user_id: Uuid, enabled: bool) -> Result<bool, String> {
        let enabled = if enabled {
            matches!(
                self.push.register(user_id).await,
                RegistrationState::TokenRegistered { .. }
            )
        } else {
            self.push.unregister(user_id).await;
            false
        };

        set_json(&self.kv, NOTIFICATIONS_ENABLED_KEY, &enabled).await?;
        Ok(enabled)
    }

    /// Sign-out: the device stops receiving pushes but the user's preference is kept for the next sign-in.
    pub async fn sign_out(&self, user_id: Uuid) { self.push.unregister(user_id).await; }

    /// Sign-in: re-registers for pushes if the user had notifications enabled.
    pub async fn sign_in(&self, user_id: Uuid) -> RegistrationState {
        if self.get_flag(NOTIFICATIONS_ENABLED_KEY).await {
            self.push.register(user_id).await
        } else {
            self.push.state().await
        }
    }
}
