// Protected API client
// Routes booking API calls through the bounded dispatcher with the session's token

use serde_json::Value;

use crate::auth::SessionManager;
use crate::dispatcher::RequestDispatcher;
use crate::error::Result;
use crate::transport::TransportRequest;

/// Client for calls that need an authenticated session
///
/// Each call occupies one dispatcher slot for its whole lifetime, including
/// the single refresh-and-retry cycle on a 401.
#[derive(Clone)]
pub struct ApiClient {
    session: SessionManager,
    dispatcher: RequestDispatcher,
}

impl ApiClient {
    pub fn new(session: SessionManager, dispatcher: RequestDispatcher) -> Self {
        Self {
            session,
            dispatcher,
        }
    }

    /// Queue a protected call and wait for its result
    pub async fn send(&self, request: TransportRequest) -> Result<Value> {
        let session = self.session.clone();
        self.dispatcher
            .submit(move || async move { session.execute_authorized(request).await })
            .await?
    }

    pub async fn get(&self, path: &str) -> Result<Value> {
        self.send(TransportRequest::get(path)).await
    }

    pub async fn post_json(&self, path: &str, body: Value) -> Result<Value> {
        self.send(TransportRequest::post(path).with_json(body)).await
    }

    /// Reject every call still waiting for a dispatcher slot
    pub fn cancel_pending(&self) -> usize {
        self.dispatcher.cancel_all()
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }
}
