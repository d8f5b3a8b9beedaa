//! Reactive session store mirrored to durable storage.
//!
//! Every mutation is written through to the [`DurableStorage`] first and
//! then published to subscribers. Logout removes every session key in one
//! storage batch so a partially cleared session is never observable.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::session::{Session, UserProfile};
use crate::storage::{
    DurableStorage, PROGRAM_TYPE_KEY, REFRESH_TOKEN_KEY, SESSION_KEYS, TOKEN_KEY, USER_KEY,
};
use crate::CoreResult;

/// In-memory session state kept in sync with durable storage
pub struct SessionStore {
    storage: Arc<dyn DurableStorage>,
    state: watch::Sender<Session>,
    /// Serializes storage writes with the matching in-memory update
    write_lock: Mutex<()>,
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let session = self.state.borrow();
        f.debug_struct("SessionStore")
            .field("authenticated", &session.is_authenticated())
            .field("has_refresh_token", &session.refresh_token.is_some())
            .finish()
    }
}

impl SessionStore {
    /// Create a store, rehydrating its initial state from `storage`
    pub fn new(storage: Arc<dyn DurableStorage>) -> CoreResult<Self> {
        let session = load_session(storage.as_ref())?;
        debug!(
            authenticated = session.is_authenticated(),
            "Rehydrated session from durable storage"
        );

        let (state, _) = watch::channel(session);
        Ok(Self {
            storage,
            state,
            write_lock: Mutex::new(()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current session
    pub fn snapshot(&self) -> Session {
        self.state.borrow().clone()
    }

    pub fn access_token(&self) -> Option<String> {
        self.state.borrow().access_token.clone()
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.state.borrow().refresh_token.clone()
    }

    pub fn user(&self) -> Option<UserProfile> {
        self.state.borrow().user.clone()
    }

    pub fn program_type(&self) -> Option<String> {
        self.state.borrow().program_type.clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.borrow().is_authenticated()
    }

    /// Receive a fresh snapshot after every mutation
    pub fn subscribe(&self) -> watch::Receiver<Session> {
        self.state.subscribe()
    }

    pub fn set_token(&self, token: Option<String>) -> CoreResult<()> {
        let _guard = self.lock();
        self.storage.apply(&[(TOKEN_KEY, token.as_deref())])?;
        self.state.send_modify(|session| session.access_token = token);
        Ok(())
    }

    pub fn set_refresh_token(&self, refresh_token: Option<String>) -> CoreResult<()> {
        let _guard = self.lock();
        self.storage
            .apply(&[(REFRESH_TOKEN_KEY, refresh_token.as_deref())])?;
        self.state
            .send_modify(|session| session.refresh_token = refresh_token);
        Ok(())
    }

    pub fn set_user(&self, user: Option<UserProfile>) -> CoreResult<()> {
        let _guard = self.lock();
        let serialized = user.as_ref().map(serde_json::to_string).transpose()?;
        self.storage.apply(&[(USER_KEY, serialized.as_deref())])?;
        self.state.send_modify(|session| session.user = user);
        Ok(())
    }

    pub fn set_program_type(&self, program_type: Option<String>) -> CoreResult<()> {
        let _guard = self.lock();
        self.storage
            .apply(&[(PROGRAM_TYPE_KEY, program_type.as_deref())])?;
        self.state
            .send_modify(|session| session.program_type = program_type);
        Ok(())
    }

    /// Replace the whole session, as after a login or signup
    pub fn set_session(&self, session: Session) -> CoreResult<()> {
        let _guard = self.lock();
        let user = session.user.as_ref().map(serde_json::to_string).transpose()?;
        self.storage.apply(&[
            (TOKEN_KEY, session.access_token.as_deref()),
            (REFRESH_TOKEN_KEY, session.refresh_token.as_deref()),
            (USER_KEY, user.as_deref()),
            (PROGRAM_TYPE_KEY, session.program_type.as_deref()),
        ])?;
        self.state.send_replace(session);
        Ok(())
    }

    /// Apply the result of a token refresh. Fields the server did not send
    /// back are left untouched.
    pub fn update_tokens(
        &self,
        access_token: String,
        refresh_token: Option<String>,
        user: Option<UserProfile>,
    ) -> CoreResult<()> {
        let _guard = self.lock();
        let serialized_user = user.as_ref().map(serde_json::to_string).transpose()?;

        {
            let mut changes = vec![(TOKEN_KEY, Some(access_token.as_str()))];
            if let Some(refresh_token) = refresh_token.as_deref() {
                changes.push((REFRESH_TOKEN_KEY, Some(refresh_token)));
            }
            if let Some(user) = serialized_user.as_deref() {
                changes.push((USER_KEY, Some(user)));
            }
            self.storage.apply(&changes)?;
        }

        self.state.send_modify(|session| {
            session.access_token = Some(access_token);
            if refresh_token.is_some() {
                session.refresh_token = refresh_token;
            }
            if user.is_some() {
                session.user = user;
            }
        });
        Ok(())
    }

    /// Drop the access token together with the profile it vouched for.
    /// The refresh token and program type are kept.
    pub fn clear_access_token(&self) -> CoreResult<()> {
        let _guard = self.lock();
        self.storage.apply(&[(TOKEN_KEY, None), (USER_KEY, None)])?;
        self.state.send_modify(|session| {
            session.access_token = None;
            session.user = None;
        });
        Ok(())
    }

    /// Clear every session field and every durable session key.
    ///
    /// The in-memory session is cleared even when storage fails so the
    /// client never stays signed in after asking to sign out.
    pub fn logout(&self) -> CoreResult<()> {
        let _guard = self.lock();
        let result = self.storage.remove_many(&SESSION_KEYS);
        let was_signed_in = !self.state.send_replace(Session::default()).is_empty();
        if was_signed_in {
            info!("Session cleared");
        }
        if let Err(e) = &result {
            warn!("Failed to clear durable session: {e}");
        }
        result
    }

    /// Pick up a token written to durable storage by someone else.
    ///
    /// Returns `true` when the in-memory session changed.
    pub fn reconcile_from_storage(&self) -> CoreResult<bool> {
        let _guard = self.lock();
        let durable_token = self.storage.get(TOKEN_KEY)?;
        if durable_token == self.state.borrow().access_token {
            return Ok(false);
        }

        match durable_token {
            Some(_) => {
                let session = load_session(self.storage.as_ref())?;
                debug!("Adopted session token changed in durable storage");
                self.state.send_replace(session);
            }
            None => {
                debug!("Session token removed from durable storage");
                self.storage.remove_many(&SESSION_KEYS)?;
                self.state.send_replace(Session::default());
            }
        }
        Ok(true)
    }
}

fn load_session(storage: &dyn DurableStorage) -> CoreResult<Session> {
    let access_token = storage.get(TOKEN_KEY)?;
    let refresh_token = storage.get(REFRESH_TOKEN_KEY)?;
    let program_type = storage.get(PROGRAM_TYPE_KEY)?;

    // A profile without a token is stale
    let user = match (&access_token, storage.get(USER_KEY)?) {
        (Some(_), Some(raw)) => match serde_json::from_str::<UserProfile>(&raw) {
            Ok(user) => Some(user),
            Err(e) => {
                warn!("Ignoring unreadable stored user profile: {e}");
                None
            }
        },
        _ => None,
    };

    Ok(Session {
        access_token,
        refresh_token,
        user,
        program_type,
    })
}
