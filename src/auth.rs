//! Login session against the pharmacy backend
//!
//! The bearer token and the cached user live in local storage, so every
//! process sharing the storage file shares the session. Logging out in one
//! window logs out all of them: the watcher turns a token removal, whether
//! made here, by a 401, or by another process, into `SessionEvent::LoggedOut`.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::api::{ApiClient, TOKEN_KEY};
use crate::db::StorageEvent;
use crate::error::{AppError, AppResult, FieldErrors};
use crate::models::{AuthState, LoginRequest, RegisterRequest, TokenResponse, User};

/// Local storage key of the cached user profile
pub const USER_KEY: &str = "current_user";

const EVENT_CAPACITY: usize = 16;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    LoggedIn { user: Option<User> },
    LoggedOut { external: bool },
}

pub struct SessionManager {
    api: ApiClient,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionManager {
    pub fn new(api: ApiClient) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self { api, events }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: SessionEvent) {
        log::debug!("[auth] {:?}", event);
        let _ = self.events.send(event);
    }

    pub fn is_authenticated(&self) -> bool {
        self.api.token().is_some()
    }

    pub fn require_token(&self) -> AppResult<String> {
        self.api.token().ok_or(AppError::NotAuthenticated)
    }

    pub fn cached_user(&self) -> Option<User> {
        match self.api.store().get_json::<User>(USER_KEY) {
            Ok(user) => user,
            Err(e) => {
                log::warn!("[auth] unreadable cached user: {}", e);
                None
            }
        }
    }

    pub fn auth_state(&self) -> AuthState {
        if self.is_authenticated() {
            AuthState {
                is_authenticated: true,
                user: self.cached_user(),
            }
        } else {
            AuthState::default()
        }
    }

    /// Email and password login
    pub async fn login(&self, email: &str, password: &str) -> AppResult<AuthState> {
        let mut errors = FieldErrors::new();
        if email.trim().is_empty() {
            errors.insert("email".into(), "Email is required".into());
        }
        if password.is_empty() {
            errors.insert("password".into(), "Password is required".into());
        }
        if !errors.is_empty() {
            return Err(AppError::Validation(errors));
        }

        let request = LoginRequest {
            email: email.trim().to_string(),
            password: password.to_string(),
        };
        let token: TokenResponse = self.api.post_json("/auth/login", &request).await?;
        let state = self.start_session(token).await?;
        log::info!("[auth] logged in as {}", request.email);
        Ok(state)
    }

    /// Creates an account. Logs straight in when the backend hands back a token.
    pub async fn register(&self, name: &str, email: &str, password: &str) -> AppResult<AuthState> {
        let mut errors = FieldErrors::new();
        if name.trim().is_empty() {
            errors.insert("name".into(), "Name is required".into());
        }
        if !email.contains('@') {
            errors.insert("email".into(), "Enter a valid email".into());
        }
        if password.len() < 6 {
            errors.insert("password".into(), "Password must be at least 6 characters".into());
        }
        if !errors.is_empty() {
            return Err(AppError::Validation(errors));
        }

        let request = RegisterRequest {
            name: name.trim().to_string(),
            email: email.trim().to_string(),
            password: password.to_string(),
        };
        let body: serde_json::Value = self.api.post_json("/auth/register", &request).await?;
        log::info!("[auth] registered {}", request.email);

        match serde_json::from_value::<TokenResponse>(body) {
            Ok(token) => self.start_session(token).await,
            Err(_) => Ok(AuthState::default()),
        }
    }

    async fn start_session(&self, token: TokenResponse) -> AppResult<AuthState> {
        let store = self.api.store();
        store.set(TOKEN_KEY, &token.access_token)?;

        let user = match token.user {
            Some(user) => Some(user),
            None => match self.fetch_me().await {
                Ok(user) => Some(user),
                Err(e) => {
                    log::warn!("[auth] could not load profile: {}", e);
                    None
                }
            },
        };
        if let Some(user) = &user {
            store.set_json(USER_KEY, user)?;
        }

        self.emit(SessionEvent::LoggedIn { user: user.clone() });
        Ok(AuthState {
            is_authenticated: true,
            user,
        })
    }

    async fn fetch_me(&self) -> AppResult<User> {
        self.api.get_json("/auth/me", &[]).await
    }

    /// Current profile from the backend; refreshes the cached copy.
    pub async fn me(&self) -> AppResult<User> {
        self.require_token()?;
        let user = self.fetch_me().await?;
        self.api.store().set_json(USER_KEY, &user)?;
        Ok(user)
    }

    /// Tells the backend (best effort) and always clears local storage.
    pub async fn logout(&self) -> AppResult<()> {
        if self.is_authenticated() {
            if let Err(e) = self.api.post_empty("/auth/logout").await {
                log::warn!("[auth] server logout failed, clearing locally: {}", e);
            }
        }
        let store = self.api.store();
        store.remove(TOKEN_KEY)?;
        store.remove(USER_KEY)?;
        log::info!("[auth] logged out");
        Ok(())
    }

    fn on_storage_event(&self, event: &StorageEvent) {
        if event.key != TOKEN_KEY {
            return;
        }
        match (&event.old_value, &event.new_value) {
            (Some(_), None) => self.emit(SessionEvent::LoggedOut {
                external: event.external,
            }),
            // another window logged in
            (_, Some(_)) if event.external => self.emit(SessionEvent::LoggedIn {
                user: self.cached_user(),
            }),
            _ => {}
        }
    }

    /// Forwards token changes to session subscribers and polls the storage
    /// file every `interval` for changes made by other processes.
    pub fn spawn_watcher(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let session = Arc::clone(self);
        let mut storage = session.api.store().subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    received = storage.recv() => match received {
                        Ok(event) => session.on_storage_event(&event),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            log::warn!("[auth] storage watcher skipped {} events", skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = ticker.tick() => {
                        if let Err(e) = session.api.store().poll_external(&[TOKEN_KEY, USER_KEY]) {
                            log::warn!("[auth] storage poll failed: {}", e);
                        }
                    }
                }
            }
        })
    }
}
