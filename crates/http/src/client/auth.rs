//! Authentication API client methods

use lectern_core::{Session, UserProfile};
use tracing::{info, warn};

use super::{ClientError, SessionClient, request::ApiRequest};
use crate::types::{Credentials, CurrentUserResponse, LogoutRequest, Registration, TokenGrant};

impl SessionClient {
    /// Sign in and store the resulting session
    pub async fn login(&self, credentials: &Credentials) -> Result<Session, ClientError> {
        let request = ApiRequest::post(self.endpoints.login.clone())
            .json(credentials)?
            .skip_auth();
        let grant: TokenGrant = self.execute(request).await?;
        self.establish(grant, None)
    }

    /// Create an account and store the resulting session
    pub async fn signup(&self, registration: &Registration) -> Result<Session, ClientError> {
        let request = ApiRequest::post(self.endpoints.signup.clone())
            .json(registration)?
            .skip_auth();
        let grant: TokenGrant = self.execute(request).await?;
        self.establish(grant, registration.program_type.clone())
    }

    fn establish(
        &self,
        grant: TokenGrant,
        program_type: Option<String>,
    ) -> Result<Session, ClientError> {
        let inspector = self.coordinator.inspector();
        if inspector.expires_at(&grant.access_token).is_none() {
            warn!("Access token has no readable expiry; it will be refreshed on first use");
        }

        let session = Session {
            access_token: Some(grant.access_token),
            refresh_token: grant.refresh_token,
            user: grant.user,
            program_type: program_type.or_else(|| self.store.program_type()),
        };
        self.store.set_session(session.clone())?;

        info!(
            user_id = session.user.as_ref().map(|u| u.id.as_str()),
            "Signed in"
        );
        Ok(session)
    }

    /// Sign out. The server is told on a best-effort basis; the local
    /// session is cleared regardless of its answer.
    pub async fn logout(&self) -> Result<(), ClientError> {
        if self.store.is_authenticated() {
            let body = LogoutRequest {
                refresh_token: self.store.refresh_token(),
            };
            let request = ApiRequest::post(self.endpoints.logout.clone())
                .json(&body)?
                .without_refresh();

            match self.send(request).await {
                Ok(response) if !response.status().is_success() => {
                    warn!(status = %response.status(), "Logout endpoint refused, clearing locally");
                }
                Ok(_) => {}
                Err(e) => warn!("Logout request failed, clearing locally: {e}"),
            }
        }

        self.store.logout()?;
        Ok(())
    }

    /// Fetch the signed-in user's profile and refresh the stored copy
    pub async fn current_user(&self) -> Result<UserProfile, ClientError> {
        let request = ApiRequest::get(self.endpoints.current_user.clone());
        let response: CurrentUserResponse = self.execute(request).await?;
        let user = response.into_profile();
        self.store.set_user(Some(user.clone()))?;
        Ok(user)
    }
}
