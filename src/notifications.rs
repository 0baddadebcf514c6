//! Push registration lifecycle for one device.
//!
//! `Unregistered -> PermissionRequested -> (granted: TokenRegistered | denied: Disabled)`.  Signing in or enabling
//! notifications registers; signing out or disabling them unregisters.  A failed registration is not retried.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{models::Platform, store::Store};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionStatus {
    Granted,
    Denied,
    Undetermined,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RegistrationState {
    Unregistered,
    PermissionRequested,
    TokenRegistered { token: String },
    Disabled,
}

/// The device's notification facilities
#[async_trait]
pub trait DeviceNotifications: Send + Sync {
    async fn request_permission(&self) -> PermissionStatus;

    /// The device's Expo push token, if one can be obtained
    async fn push_token(&self) -> Result<String, String>;

    async fn cancel_scheduled(&self);

    fn platform(&self) -> Platform;
}

pub struct PushRegistrar<D: DeviceNotifications> {
    store: Arc<dyn Store>,
    device: D,
    state: Mutex<RegistrationState>,
}

impl<D: DeviceNotifications> PushRegistrar<D> {
    pub fn new(store: Arc<dyn Store>, device: D) -> Self {
        PushRegistrar {
            store,
            device,
            state: Mutex::new(RegistrationState::Unregistered),
        }
    }

    pub async fn state(&self) -> RegistrationState { self.state.lock().await.clone() }

    pub fn device(&self) -> &D { &self.device }

    /// Asks for permission, obtains the push token and saves it for `(user_id, platform)`.
    pub async fn register(&self, user_id: Uuid) -> RegistrationState {
        let mut state = self.state.lock().await;
        *state = RegistrationState::PermissionRequested;

        match self.device.request_permission().await {
            PermissionStatus::Granted => (),
            status => {
                info!("Notification permission not granted for user {}: {:?}", user_id, status);
                *state = RegistrationState::Disabled;
                return state.clone();
            },
        }

        let token = match self.device.push_token().await {
            Ok(token) => token,
            Err(err) => {
                error!("Error obtaining push token for user {}: {}", user_id, err);
                return state.clone();
            },
        };

        let platform = self.device.platform();
        if let Err(err) = self.store.upsert_push_token(user_id, &token, platform).await {
            error!(
                "Error saving {} push token for user {}: {:?}",
                platform.as_str(),
                user_id,
                err
            );
            return state.clone();
        }

        info!("Registered {} push token for user {}", platform.as_str(), user_id);
        *state = RegistrationState::TokenRegistered { token };
        state.clone()
    }

    /// Removes this device's token row and cancels any scheduled local notifications.
    pub async fn unregister(&self, user_id: Uuid) -> RegistrationState {
        let mut state = self.state.lock().await;
        let platform = self.device.platform();

        match self.store.delete_push_tokens(user_id, Some(platform)).await {
            Ok(count) => info!(
                "Removed {} {} push tokens for user {}",
                count,
                platform.as_str(),
                user_id
            ),
            Err(err) => error!("Error removing push tokens for user {}: {:?}", user_id, err),
        }
        self.device.cancel_scheduled().await;

        *state = RegistrationState::Unregistered;
        state.clone()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::store::MemoryStore;

    pub(crate) struct FakeDevice {
        pub permission: PermissionStatus,
        pub token: Option<String>,
        pub cancelled: AtomicUsize,
    }

    impl FakeDevice {
        pub(crate) fn granted(token: &str) -> Self {
            FakeDevice {
                permission: PermissionStatus::Granted,
                token: Some(token.into()),
                cancelled: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl DeviceNotifications for FakeDevice {
        async fn request_permission(&self) -> PermissionStatus { self.permission }

        async fn push_token(&self) -> Result<String, String> {
            self.token.clone().ok_or_else(|| "no token".to_owned())
        }

        async fn cancel_scheduled(&self) { self.cancelled.fetch_add(1, Ordering::SeqCst); }

        fn platform(&self) -> Platform { Platform::Ios }
    }

    #[tokio::test]
    async fn granted_permission_registers_token() {
        let store = Arc::new(MemoryStore::new());
        let registrar = PushRegistrar::new(store.clone(), FakeDevice::granted("ExponentPushToken[x]"));
        let user = Uuid::new_v4();

        assert_eq!(registrar.state().await, RegistrationState::Unregistered);
        let state = registrar.register(user).await;
        assert_eq!(
            state,
            RegistrationState::TokenRegistered {
                token: "ExponentPushToken[x]".into()
            }
        );

        let tokens = store.push_tokens_for_users(&[user]).await.unwrap();
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].platform, Platform::Ios);
    }

    #[tokio::test]
    async fn denied_permission_disables() {
        let store = Arc::new(MemoryStore::new());
        let mut device = FakeDevice::granted("ExponentPushToken[x]");
        device.permission = PermissionStatus::Denied;
        let registrar = PushRegistrar::new(store.clone(), device);
        let user = Uuid::new_v4();

        assert_eq!(registrar.register(user).await, RegistrationState::Disabled);
        assert!(store.push_tokens_for_users(&[user]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_token_stays_in_permission_requested() {
        let store = Arc::new(MemoryStore::new());
        let mut device = FakeDevice::granted("unused");
        device.token = None;
        let registrar = PushRegistrar::new(store.clone(), device);

        assert_eq!(
            registrar.register(Uuid::new_v4()).await,
            RegistrationState::PermissionRequested
        );
    }

    #[tokio::test]
    async fn disabling_removes_token_and_cancels_scheduled() {
        let store = Arc::new(MemoryStore::new());
        let registrar = PushRegistrar::new(store.clone(), FakeDevice::granted("ExponentPushToken[x]"));
        let user = Uuid::new_v4();
        // A token registered from another platform is left alone
        store
            .upsert_push_token(user, "ExponentPushToken[web]", Platform::Web)
            .await
            .unwrap();

        registrar.register(user).await;
        assert_eq!(registrar.unregister(user).await, RegistrationState::Unregistered);

        let tokens = store.push_tokens_for_users(&[user]).await.unwrap();
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].platform, Platform::Web);
        assert_eq!(registrar.device().cancelled.load(Ordering::SeqCst), 1);
    }
}
