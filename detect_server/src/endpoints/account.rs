//! Login, signup and the static pages.
//!
use axum::{
    extract::State,
    response::{Html, IntoResponse, Redirect, Response},
    Form,
};
use axum_extra::extract::cookie::SignedCookieJar;

use crate::{
    error::AppError,
    forms::{LoginForm, RegisterForm},
    pages,
    session::{removal_cookie, session_cookie, CurrentUser},
    state::AppState,
};

pub async fn home(CurrentUser { user, .. }: CurrentUser) -> Html<String> {
    pages::home_page(&user)
}

pub async fn dashboard(CurrentUser { user, .. }: CurrentUser) -> Html<String> {
    pages::dashboard_page(&user)
}

pub async fn login_form() -> Html<String> {
    pages::login_page(&[], "")
}

pub async fn login(
    State(state): State<AppState>,
    jar: SignedCookieJar,
    Form(form): Form<LoginForm>,
) -> Result<Response, AppError> {
    let errors = form.validate();
    if !errors.is_empty() {
        return Ok(pages::login_page(&errors, &form.username).into_response());
    }

    match state.users.authenticate(&form.username, &form.password).await {
        Ok(user) => {
            let token = state.sessions.create(user.id);
            log::info!("User {} logged in", user.username);
            let jar = jar.add(session_cookie(token, form.remember()));
            Ok((jar, Redirect::to("/home")).into_response())
        }
        Err(AppError::InvalidCredentials) => {
            log::info!("Failed login for {}", form.username);
            Ok(pages::invalid_credentials().into_response())
        }
        Err(e) => Err(e),
    }
}

pub async fn signup_form() -> Html<String> {
    pages::signup_page(&[], "", "")
}

pub async fn signup(
    State(state): State<AppState>,
    Form(form): Form<RegisterForm>,
) -> Result<Response, AppError> {
    let errors = form.validate();
    if !errors.is_empty() {
        return Ok(pages::signup_page(&errors, &form.email, &form.username).into_response());
    }

    match state
        .users
        .register(&form.username, &form.email, &form.password)
        .await
    {
        Ok(_) => Ok(Redirect::to("/login").into_response()),
        Err(e @ (AppError::EmailTaken | AppError::UsernameTaken)) => {
            Ok(pages::signup_page(&[e.to_string()], &form.email, &form.username).into_response())
        }
        Err(e) => Err(e),
    }
}

pub async fn logout(
    State(state): State<AppState>,
    CurrentUser { user, token }: CurrentUser,
    jar: SignedCookieJar,
) -> impl IntoResponse {
    state.sessions.destroy(&token);
    log::info!("User {} logged out", user.username);
    (jar.remove(removal_cookie()), Redirect::to("/home"))
}
