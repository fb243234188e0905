//! Authentication/session seam

use std::sync::RwLock;

/// Who is signed in and whether their data may leave the device
pub trait SessionProvider: Send + Sync {
    fn current_user_id(&self) -> Option<String>;

    /// Durable accounts sync; ephemeral (guest) accounts keep everything local
    fn is_durable_account(&self) -> bool;

    /// Sync runs only for a signed-in durable account
    fn sync_enabled(&self) -> bool {
        self.is_durable_account() && self.current_user_id().is_some()
    }
}

#[derive(Debug)]
struct SessionState {
    user_id: Option<String>,
    durable: bool,
}

/// Session fixed at construction, switchable for sign-in/sign-out flows
#[derive(Debug)]
pub struct StaticSession {
    state: RwLock<SessionState>,
}

impl StaticSession {
    pub fn durable(user_id: impl Into<String>) -> Self {
        Self::with(Some(user_id.into()), true)
    }

    pub fn ephemeral(user_id: impl Into<String>) -> Self {
        Self::with(Some(user_id.into()), false)
    }

    pub fn signed_out() -> Self {
        Self::with(None, false)
    }

    fn with(user_id: Option<String>, durable: bool) -> Self {
        Self {
            state: RwLock::new(SessionState { user_id, durable }),
        }
    }

    pub fn sign_in(&self, user_id: impl Into<String>, durable: bool) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.user_id = Some(user_id.into());
        state.durable = durable;
    }

    pub fn sign_out(&self) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.user_id = None;
        state.durable = false;
    }
}

impl SessionProvider for StaticSession {
    fn current_user_id(&self) -> Option<String> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .user_id
            .clone()
    }

    fn is_durable_account(&self) -> bool {
        self.state.read().unwrap_or_else(|e| e.into_inner()).durable
    }
}
