//! Server-side sessions and the `CurrentUser` extractor.
//!
use std::{collections::HashMap, sync::Mutex};

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::request::Parts,
    response::{IntoResponse, Redirect, Response},
};
use axum_extra::extract::cookie::{Cookie, Key, SameSite, SignedCookieJar};
use uuid::Uuid;

use crate::{db::User, state::AppState};

/// Name of the cookie holding the session token.
pub const SESSION_COOKIE: &str = "session";

/// Lifetime of a "remember me" cookie.
pub const REMEMBER_DAYS: i64 = 365;

/// Maps session tokens to user ids. Sessions live until logout or restart.
#[derive(Default)]
pub struct SessionStore {
    sessions: Mutex<HashMap<String, i64>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a session and return its token.
    pub fn create(&self, user_id: i64) -> String {
        let token = Uuid::new_v4().to_string();
        self.lock().insert(token.clone(), user_id);
        token
    }

    pub fn get(&self, token: &str) -> Option<i64> {
        self.lock().get(token).copied()
    }

    /// End a session. Returns whether it existed.
    pub fn destroy(&self, token: &str) -> bool {
        self.lock().remove(token).is_some()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, i64>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Cookie carrying a session token.
pub fn session_cookie(token: String, remember: bool) -> Cookie<'static> {
    let builder = Cookie::build(SESSION_COOKIE, token)
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax);
    if remember {
        builder
            .max_age(time::Duration::days(REMEMBER_DAYS))
            .finish()
    } else {
        builder.finish()
    }
}

/// Cookie removing the session token from the browser.
pub fn removal_cookie() -> Cookie<'static> {
    Cookie::build(SESSION_COOKIE, "").path("/").finish()
}

/// The logged in user of a request.
///
/// Requests without a valid session are redirected to the login page.
#[derive(Debug, Clone)]
pub struct CurrentUser {
    pub user: User,
    pub token: String,
}

#[async_trait]
impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = Response;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let jar = SignedCookieJar::<Key>::from_headers(&parts.headers, state.key.clone());
        let to_login = || Redirect::to("/login").into_response();

        let token = match jar.get(SESSION_COOKIE) {
            Some(cookie) => cookie.value().to_owned(),
            None => return Err(to_login()),
        };
        let user_id = state.sessions.get(&token).ok_or_else(to_login)?;

        match state.users.get(user_id).await {
            Ok(Some(user)) => Ok(CurrentUser { user, token }),
            Ok(None) => {
                state.sessions.destroy(&token);
                Err(to_login())
            }
            Err(e) => Err(e.into_response()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sessions_are_distinct_and_destroyable() {
        let sessions = SessionStore::new();
        let first = sessions.create(1);
        let second = sessions.create(1);
        assert_ne!(first, second);
        assert_eq!(sessions.get(&first), Some(1));
        assert_eq!(sessions.len(), 2);

        assert!(sessions.destroy(&first));
        assert!(!sessions.destroy(&first));
        assert_eq!(sessions.get(&first), None);
        assert_eq!(sessions.get(&second), Some(1));
    }

    #[test]
    fn remember_me_makes_cookie_persistent() {
        let persistent = session_cookie("t".into(), true);
        assert_eq!(
            persistent.max_age(),
            Some(time::Duration::days(REMEMBER_DAYS))
        );
        assert_eq!(persistent.http_only(), Some(true));

        let transient = session_cookie("t".into(), false);
        assert_eq!(transient.max_age(), None);
        assert_eq!(transient.path(), Some("/"));
    }
}
