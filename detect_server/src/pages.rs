//! HTML pages.
//!
use axum::response::Html;

use crate::db::User;

/// Supported upload extensions, as listed to the user.
pub const SUPPORTED_TYPES: &str = "jpg, png, mp4";

/// Escape text for HTML element and attribute content.
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            c => out.push(c),
        }
    }
    out
}

fn layout(title: &str, body: &str) -> Html<String> {
    Html(format!(
        r#"<!doctype html>
<html>
<head><meta charset="utf-8"><title>{title}</title></head>
<body>
{body}
</body>
</html>
"#
    ))
}

fn nav(user: &User) -> String {
    format!(
        r#"<nav>Logged in as <b>{}</b> | <a href="/home">Home</a> | <a href="/dashboard">Dashboard</a> | <a href="/index">Detect</a> | <a href="/logout">Logout</a></nav>"#,
        escape(&user.username)
    )
}

fn error_list(errors: &[String]) -> String {
    if errors.is_empty() {
        return String::new();
    }
    let items: String = errors
        .iter()
        .map(|e| format!("<li>{}</li>", escape(e)))
        .collect();
    format!(r#"<ul class="errors">{items}</ul>"#)
}

pub fn home_page(user: &User) -> Html<String> {
    layout(
        "Object detection",
        &format!(
            r#"{}
<h1>Object detection</h1>
<p>Upload an image or a video to find objects in it, or watch the live camera feed.</p>
<p><a href="/index">Upload a file</a> | <a href="/webcam_feed">Live camera</a></p>"#,
            nav(user)
        ),
    )
}

pub fn dashboard_page(user: &User) -> Html<String> {
    layout(
        "Dashboard",
        &format!(
            r#"{}
<h1>Dashboard</h1>
<p>Welcome, {}.</p>
<p><a href="/index">New detection</a> | <a href="/video_feed">Latest video</a> | <a href="/webcam_feed">Live camera</a></p>"#,
            nav(user),
            escape(&user.username)
        ),
    )
}

pub fn upload_page(user: &User, notice: Option<&str>) -> Html<String> {
    let notice = notice
        .map(|n| format!(r#"<p class="notice">{}</p>"#, escape(n)))
        .unwrap_or_default();
    layout(
        "Detect objects",
        &format!(
            r#"{}
<h1>Detect objects</h1>
{notice}
<form method="post" action="/index" enctype="multipart/form-data">
  <input type="file" name="file" accept=".jpg,.png,.mp4">
  <input type="submit" value="Upload">
</form>
<p>Supported types: {SUPPORTED_TYPES}</p>"#,
            nav(user)
        ),
    )
}

pub fn login_page(errors: &[String], username: &str) -> Html<String> {
    layout(
        "Login",
        &format!(
            r#"<h1>Login</h1>
{}
<form method="post" action="/login">
  <label>Username <input type="text" name="username" value="{}"></label>
  <label>Password <input type="password" name="password"></label>
  <label><input type="checkbox" name="remember"> Remember me</label>
  <input type="submit" value="Login">
</form>
<p>No account yet? <a href="/signup">Sign up</a></p>"#,
            error_list(errors),
            escape(username)
        ),
    )
}

pub fn signup_page(errors: &[String], email: &str, username: &str) -> Html<String> {
    layout(
        "Sign up",
        &format!(
            r#"<h1>Sign up</h1>
{}
<form method="post" action="/signup">
  <label>Email <input type="email" name="email" value="{}"></label>
  <label>Username <input type="text" name="username" value="{}"></label>
  <label>Password <input type="password" name="password"></label>
  <input type="submit" value="Sign up">
</form>
<p>Already registered? <a href="/login">Login</a></p>"#,
            error_list(errors),
            escape(email),
            escape(username)
        ),
    )
}

/// Bare answer to a failed login.
pub fn invalid_credentials() -> Html<&'static str> {
    Html("<h1>Invalid Username or password</h1>")
}
