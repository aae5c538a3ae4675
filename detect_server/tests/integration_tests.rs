use std::{
    path::PathBuf,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use axum::{
    body::Body,
    http::{header, Request, Response, StatusCode},
    Router,
};
use axum_extra::extract::cookie::Key;
use clap::Parser;
use detect_server::{
    config::Config,
    db,
    endpoints::JOB_ID_HEADER,
    jobs::JobKind,
    media::encode_jpeg,
    nn::{Detection, InferModel},
    router::app_router,
    state::AppState,
};
use image::{Rgb, RgbImage};
use tower::ServiceExt;

const BOUNDARY: &str = "detect-test-boundary";

/// Finds one person in the top left quarter of every frame.
struct FakeModel;

impl InferModel for FakeModel {
    fn run(&self, _image: &RgbImage) -> anyhow::Result<Vec<Detection>> {
        Ok(vec![Detection {
            class_id: 0,
            label: "person".into(),
            confidence: 0.9,
            bbox: [0.1, 0.1, 0.5, 0.5],
        }])
    }
}

struct TestApp {
    app: Router,
    state: AppState,
    root: PathBuf,
}

impl TestApp {
    async fn new() -> TestApp {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before UNIX_EPOCH")
            .as_nanos();
        let root = std::env::temp_dir().join(format!(
            "detect-server-test-{}-{}",
            std::process::id(),
            nanos
        ));
        let uploads = root.join("uploads");
        let runs = root.join("runs");

        let config = Config::parse_from([
            "detect_server",
            "--video-backend",
            "mjpeg",
            "--replay-delay-ms",
            "0",
            "--camera",
            "/nonexistent/video9",
            "--uploads-dir",
            uploads.to_str().unwrap(),
            "--runs-dir",
            runs.to_str().unwrap(),
        ]);
        let pool = db::connect("sqlite::memory:").await.unwrap();
        let state = AppState::new(config, pool, Arc::new(FakeModel), Key::generate());
        let app = app_router(state.clone());

        TestApp { app, state, root }
    }

    async fn send(&self, request: Request<Body>) -> Response<axum::body::BoxBody> {
        self.app.clone().oneshot(request).await.expect("request failed")
    }

    async fn get(&self, uri: &str, cookie: Option<&str>) -> Response<axum::body::BoxBody> {
        let mut builder = Request::get(uri);
        if let Some(cookie) = cookie {
            builder = builder.header(header::COOKIE, cookie);
        }
        self.send(builder.body(Body::empty()).unwrap()).await
    }

    async fn post_form(
        &self,
        uri: &str,
        body: &str,
        cookie: Option<&str>,
    ) -> Response<axum::body::BoxBody> {
        let mut builder = Request::post(uri)
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded");
        if let Some(cookie) = cookie {
            builder = builder.header(header::COOKIE, cookie);
        }
        self.send(builder.body(Body::from(body.to_string())).unwrap())
            .await
    }

    async fn upload(
        &self,
        file_name: &str,
        data: &[u8],
        cookie: &str,
    ) -> Response<axum::body::BoxBody> {
        let request = Request::post("/index")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .header(header::COOKIE, cookie)
            .body(Body::from(multipart_body(file_name, data)))
            .unwrap();
        self.send(request).await
    }

    async fn signup(&self, username: &str, email: &str) -> Response<axum::body::BoxBody> {
        self.post_form(
            "/signup",
            &format!("email={email}&username={username}&password=password123"),
            None,
        )
        .await
    }

    /// Register a user, log in and return the cookie header to send along.
    async fn login_as(&self, username: &str) -> String {
        let resp = self
            .signup(username, &format!("{username}%40example.com"))
            .await;
        assert_eq!(resp.status(), StatusCode::SEE_OTHER);

        let resp = self
            .post_form(
                "/login",
                &format!("username={username}&password=password123"),
                None,
            )
            .await;
        assert_eq!(resp.status(), StatusCode::SEE_OTHER);
        assert_eq!(location(&resp), "/home");
        session_cookie(&resp).expect("no session cookie set")
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        std::fs::remove_dir_all(&self.root).ok();
    }
}

fn multipart_body(file_name: &str, data: &[u8]) -> Vec<u8> {
    let mut body = format!(
        "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{file_name}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
    )
    .into_bytes();
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
    body
}

fn session_cookie<B>(resp: &Response<B>) -> Option<String> {
    resp.headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .find(|value| value.starts_with("session="))
        .and_then(|value| value.split(';').next())
        .map(String::from)
}

fn location<B>(resp: &Response<B>) -> &str {
    resp.headers()
        .get(header::LOCATION)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
}

fn job_id<B>(resp: &Response<B>) -> String {
    resp.headers()
        .get(JOB_ID_HEADER)
        .expect("no job id")
        .to_str()
        .unwrap()
        .to_string()
}

async fn body_bytes(resp: Response<axum::body::BoxBody>) -> Vec<u8> {
    hyper::body::to_bytes(resp.into_body())
        .await
        .expect("failed to read response body")
        .to_vec()
}

async fn body_text(resp: Response<axum::body::BoxBody>) -> String {
    String::from_utf8(body_bytes(resp).await).expect("response body was not utf-8")
}

fn count_frames(body: &[u8]) -> usize {
    let marker = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n";
    body.windows(marker.len()).filter(|w| w == marker).count()
}

fn test_jpeg(shade: u8) -> Vec<u8> {
    encode_jpeg(&RgbImage::from_pixel(32, 24, Rgb([shade, 100, 200]))).unwrap()
}

/// Raw MJPEG content, served under an mp4 name to the MJPEG backend.
fn test_clip(frames: usize) -> Vec<u8> {
    (0..frames).flat_map(|i| test_jpeg(i as u8 * 40)).collect()
}

#[tokio::test]
async fn healthcheck_answers() {
    let app = TestApp::new().await;
    let resp = app.get("/healthcheck", None).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_text(resp).await, "healthy");
}

#[tokio::test]
async fn signup_with_registered_email_fails_without_new_row() {
    let app = TestApp::new().await;

    let resp = app.signup("alice", "alice%40example.com").await;
    assert_eq!(resp.status(), StatusCode::SEE_OTHER);
    assert_eq!(location(&resp), "/login");

    let resp = app.signup("bobby", "alice%40example.com").await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(body_text(resp)
        .await
        .contains("Email address already registered"));

    let resp = app.signup("alice", "other%40example.com").await;
    assert!(body_text(resp).await.contains("Username already taken"));

    assert_eq!(app.state.users.count().await.unwrap(), 1);
}

#[tokio::test]
async fn invalid_signup_form_is_shown_again() {
    let app = TestApp::new().await;
    let resp = app
        .post_form("/signup", "email=nope&username=ab&password=short", None)
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let page = body_text(resp).await;
    assert!(page.contains("Invalid email"));
    assert!(page.contains("Username must be between 4 and 15 characters long"));
    assert_eq!(app.state.users.count().await.unwrap(), 0);
}

#[tokio::test]
async fn wrong_password_sets_no_session() {
    let app = TestApp::new().await;
    app.signup("carol", "carol%40example.com").await;

    let resp = app
        .post_form("/login", "username=carol&password=password124", None)
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(session_cookie(&resp).is_none());
    assert_eq!(
        body_text(resp).await,
        "<h1>Invalid Username or password</h1>"
    );
    assert!(app.state.sessions.is_empty());
}

#[tokio::test]
async fn protected_routes_redirect_to_login() {
    let app = TestApp::new().await;
    for uri in ["/", "/home", "/dashboard", "/index", "/logout", "/photo.jpg"] {
        let resp = app.get(uri, None).await;
        assert_eq!(resp.status(), StatusCode::SEE_OTHER, "{uri}");
        assert_eq!(location(&resp), "/login", "{uri}");
    }

    // A cookie that was never signed by the server is ignored
    let resp = app.get("/dashboard", Some("session=forged")).await;
    assert_eq!(location(&resp), "/login");
}

#[tokio::test]
async fn login_grants_access_until_logout() {
    let app = TestApp::new().await;
    let cookie = app.login_as("dave").await;

    let resp = app.get("/dashboard", Some(&cookie)).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(body_text(resp).await.contains("dave"));

    let resp = app.get("/logout", Some(&cookie)).await;
    assert_eq!(resp.status(), StatusCode::SEE_OTHER);
    assert_eq!(location(&resp), "/home");

    // The old cookie is no longer accepted
    let resp = app.get("/dashboard", Some(&cookie)).await;
    assert_eq!(resp.status(), StatusCode::SEE_OTHER);
    assert_eq!(location(&resp), "/login");
}

#[tokio::test]
async fn remember_me_sets_persistent_cookie() {
    let app = TestApp::new().await;
    app.signup("erin", "erin%40example.com").await;

    let resp = app
        .post_form(
            "/login",
            "username=erin&password=password123&remember=on",
            None,
        )
        .await;
    let set_cookie = resp
        .headers()
        .get(header::SET_COOKIE)
        .unwrap()
        .to_str()
        .unwrap();
    assert!(set_cookie.contains("Max-Age=31536000"), "{set_cookie}");
}

#[tokio::test]
async fn image_upload_returns_annotated_image() {
    let app = TestApp::new().await;
    let cookie = app.login_as("frank").await;

    let resp = app.upload("photo.jpg", &test_jpeg(0), &cookie).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()[header::CONTENT_TYPE], "image/jpeg");
    let job = job_id(&resp);
    let annotated = body_bytes(resp).await;

    let image = image::load_from_memory(&annotated).unwrap().to_rgb8();
    assert_eq!(image.dimensions(), (32, 24));
    let output = app.root.join("runs/detect").join(&job).join("photo.jpg");
    assert!(output.exists());
    assert!(app.root.join("uploads").join(&job).join("photo.jpg").exists());

    // The same file is available by job id and as the latest image
    let resp = app.get(&format!("/results/{job}"), Some(&cookie)).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_bytes(resp).await, annotated);

    let resp = app.get("/whatever.jpg", Some(&cookie)).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_bytes(resp).await, annotated);

    // Nobody else gets to see it
    let other = app.login_as("grace").await;
    let resp = app.get(&format!("/results/{job}"), Some(&other)).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let resp = app.get("/whatever.jpg", Some(&other)).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn png_upload_keeps_format() {
    let app = TestApp::new().await;
    let cookie = app.login_as("heidi").await;

    let mut png = Vec::new();
    RgbImage::from_pixel(20, 10, Rgb([1, 2, 3]))
        .write_to(
            &mut std::io::Cursor::new(&mut png),
            image::ImageOutputFormat::Png,
        )
        .unwrap();

    let resp = app.upload("Shot.PNG", &png, &cookie).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()[header::CONTENT_TYPE], "image/png");
    let data = body_bytes(resp).await;
    assert_eq!(
        image::guess_format(&data).unwrap(),
        image::ImageFormat::Png
    );
}

#[tokio::test]
async fn video_upload_streams_every_processed_frame() {
    let app = TestApp::new().await;
    let cookie = app.login_as("ivan").await;

    let resp = app.upload("clip.mp4", &test_clip(3), &cookie).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers()[header::CONTENT_TYPE],
        "multipart/x-mixed-replace; boundary=frame"
    );
    let job = job_id(&resp);
    let body = body_bytes(resp).await;
    assert_eq!(count_frames(&body), 3);

    let output = app.root.join("runs/detect").join(&job).join("output.mjpeg");
    assert!(output.exists());
}

#[tokio::test]
async fn unsupported_upload_renders_form_again() {
    let app = TestApp::new().await;
    let cookie = app.login_as("judy").await;

    let resp = app.upload("doc.txt", b"hello", &cookie).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.headers().get(JOB_ID_HEADER).is_none());
    let page = body_text(resp).await;
    assert!(page.contains("enctype=\"multipart/form-data\""));
    assert!(page.contains("Supported types"));

    // Nothing was stored
    let stored = std::fs::read_dir(app.root.join("uploads"))
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(stored, 0);
}

#[tokio::test]
async fn video_without_frames_renders_form_again() {
    let app = TestApp::new().await;
    let cookie = app.login_as("kevin").await;

    let resp = app.upload("empty.mp4", b"not a video", &cookie).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(body_text(resp).await.contains("contains no frames"));

    let resp = app.get("/video_feed", None).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn video_feed_ends_with_the_video() {
    let app = TestApp::new().await;
    let resp = app.get("/video_feed", None).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let cookie = app.login_as("laura").await;
    let resp = app.upload("clip.mp4", &test_clip(2), &cookie).await;
    let job = job_id(&resp);
    body_bytes(resp).await;

    let resp = app.get("/video_feed", None).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(job_id(&resp), job);
    // Reading the body to the end only returns once the stream is closed
    assert_eq!(count_frames(&body_bytes(resp).await), 2);
}

/// Two users processing videos each get their own output; the unqualified feed replays
/// whichever finished last.
#[tokio::test]
async fn last_finished_video_wins_the_shared_feed() {
    let app = TestApp::new().await;
    let alice = app.login_as("alice").await;
    let bob = app.login_as("bobby").await;

    let resp = app.upload("clip.mp4", &test_clip(2), &alice).await;
    let alice_job = job_id(&resp);
    body_bytes(resp).await;

    let resp = app.upload("clip.mp4", &test_clip(4), &bob).await;
    let bob_job = job_id(&resp);
    body_bytes(resp).await;
    assert_ne!(alice_job, bob_job);

    let resp = app.get("/video_feed", None).await;
    assert_eq!(job_id(&resp), bob_job);
    assert_eq!(count_frames(&body_bytes(resp).await), 4);

    let resp = app
        .get(&format!("/video_feed?job={alice_job}"), None)
        .await;
    assert_eq!(job_id(&resp), alice_job);
    assert_eq!(count_frames(&body_bytes(resp).await), 2);
}

#[tokio::test]
async fn webcam_feed_without_camera_is_unavailable() {
    let app = TestApp::new().await;
    let resp = app.get("/webcam_feed", None).await;
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(app.state.jobs.live_count(), 0);
}

#[tokio::test]
async fn stopping_unknown_feed_is_not_found() {
    let app = TestApp::new().await;
    let uri = format!("/webcam_feed/{}/stop", uuid::Uuid::new_v4());

    let resp = app.get(&uri, None).await;
    assert_eq!(resp.status(), StatusCode::SEE_OTHER);
    assert_eq!(location(&resp), "/login");

    let cookie = app.login_as("mallory").await;
    let resp = app.get(&uri, Some(&cookie)).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn only_the_owner_stops_a_live_feed() {
    let app = TestApp::new().await;
    let owner = app.login_as("nadia").await;
    let other = app.login_as("oscar").await;
    let owner_id = app
        .state
        .users
        .find_by_username("nadia")
        .await
        .unwrap()
        .unwrap()
        .id;

    let job = uuid::Uuid::new_v4();
    app.state.jobs.create(
        job,
        Some(owner_id),
        JobKind::Webcam,
        app.root.join("webcam_output.mjpeg"),
    );
    let token = app.state.jobs.register_live(job);
    let uri = format!("/webcam_feed/{job}/stop");

    let resp = app.get(&uri, Some(&other)).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    assert!(!token.is_cancelled());

    let resp = app.get(&uri, Some(&owner)).await;
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    assert!(token.is_cancelled());
    assert_eq!(app.state.jobs.live_count(), 0);
}

#[tokio::test]
async fn large_upload_is_stored_unchanged() {
    let app = TestApp::new().await;
    let cookie = app.login_as("peggy").await;

    // Noise compresses badly
    let frame = RgbImage::from_fn(640, 480, |x, y| {
        let mut v = x.wrapping_mul(0x9E37_79B1) ^ y.wrapping_mul(0x85EB_CA6B);
        v ^= v >> 15;
        v = v.wrapping_mul(0x2C1B_3C6D);
        v ^= v >> 12;
        Rgb([v as u8, (v >> 8) as u8, (v >> 16) as u8])
    });
    let jpeg = encode_jpeg(&frame).unwrap();
    let clip: Vec<u8> = std::iter::repeat(jpeg).take(4).flatten().collect();
    assert!(clip.len() > 256 * 1024);

    let resp = app.upload("big.mp4", &clip, &cookie).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let job = job_id(&resp);
    assert_eq!(count_frames(&body_bytes(resp).await), 4);

    let stored = std::fs::read(app.root.join("uploads").join(&job).join("big.mp4")).unwrap();
    assert_eq!(stored, clip);
}
