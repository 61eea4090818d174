//! The REST contracts this layer consumes. Everything goes through
//! [`SessionGateway::send`], so each call benefits from refresh-and-replay.

use shared::{
    domain::{ChatId, ChatKind},
    protocol::{AuthCheckResponse, ChatDetail, CurrentUser, LoginRequest, RealtimeTokenResponse},
};
use tracing::info;

use crate::{
    error::SessionError,
    session::{ApiRequest, SessionGateway, SessionStatus},
};

impl SessionGateway {
    pub async fn login(&self, email: &str, password: &str) -> Result<(), SessionError> {
        let path = "/auth/token";
        let request = ApiRequest::post(path).json(&LoginRequest {
            email: email.to_string(),
            password: password.to_string(),
        })?;
        self.send(request).await?.error_for_status(path)?;
        info!("session: logged in");
        self.set_status(SessionStatus::Authenticated);
        Ok(())
    }

    pub async fn logout(&self) -> Result<(), SessionError> {
        let path = "/auth/logout";
        let outcome = self
            .send(ApiRequest::delete(path))
            .await
            .and_then(|response| response.error_for_status(path));
        self.set_status(SessionStatus::Unauthenticated);
        outcome.map(|_| ())
    }

    pub async fn check(&self) -> Result<AuthCheckResponse, SessionError> {
        let outcome = self.get_json::<AuthCheckResponse>("/auth/check").await;
        match &outcome {
            Ok(_) => self.set_status(SessionStatus::Authenticated),
            Err(err) if err.is_terminal_auth_failure() => {
                self.set_status(SessionStatus::Unauthenticated)
            }
            Err(_) => {}
        }
        outcome
    }

    pub async fn current_user(&self) -> Result<CurrentUser, SessionError> {
        self.get_json("/users/me").await
    }

    /// Short-lived credential authorizing one WebSocket upgrade.
    pub async fn realtime_token(&self) -> Result<String, SessionError> {
        let path = self.realtime_token_path().to_string();
        let response: RealtimeTokenResponse = self.get_json(&path).await?;
        Ok(response.access_token)
    }

    pub async fn chat_detail(
        &self,
        kind: ChatKind,
        chat_id: ChatId,
    ) -> Result<ChatDetail, SessionError> {
        self.get_json(&format!("/{}/{}", kind.path_segment(), chat_id))
            .await
    }
}
