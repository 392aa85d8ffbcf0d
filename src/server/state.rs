use std::sync::Arc;

use axum::extract::FromRef;
use axum_extra::extract::cookie::Key;

use super::config::ServerSettings;
use crate::broker::Broker;
use crate::session::SessionStore;

/// Shared state for route handlers.
pub(super) struct AppState<S> {
    pub(super) broker: Arc<Broker<S>>,
    pub(super) settings: ServerSettings,
}

// Manual Clone: avoid derive adding an `S: Clone` bound.
impl<S> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            broker: Arc::clone(&self.broker),
            settings: self.settings.clone(),
        }
    }
}

// PrivateCookieJar requires Key to be extractable from state
impl<S: SessionStore> FromRef<AppState<S>> for Key {
    fn from_ref(state: &AppState<S>) -> Self {
        state.settings.cookie_key.clone()
    }
}
