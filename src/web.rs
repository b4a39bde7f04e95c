//! The chat page and the form endpoints behind it.
//!
//! Every interaction is a plain form post that updates the session and
//! redirects back to `/`, so the whole conversation is re-rendered each time.

use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Form, Router};
use dashmap::DashMap;
use minijinja::{context, Environment};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tower_http::trace::TraceLayer;
use tower_sessions::{Expiry, Session, SessionManagerLayer};
use tracing::{debug, error, info};

use crate::chat;
use crate::error::{ChatError, Result};
use crate::generation::DecodingPolicy;
use crate::model::ModelProvider;
use crate::session::{Conversation, MAX_MAX_LENGTH, MIN_MAX_LENGTH};
use crate::store::ChatSessionStore;

const PAGE_TEMPLATE: &str = "chat.html";
pub const SESSION_COOKIE: &str = "dialo_chat_session";
pub const DEFAULT_SESSION_IDLE: Duration = Duration::from_secs(60 * 60);

/// Conversation starters: (topic, message).
pub const STARTERS: &[(&str, &str)] = &[
    ("General Chat", "Hello! How are you doing today?"),
    ("Technology", "What do you think about the future of artificial intelligence?"),
    ("Science", "Can you explain quantum computing in simple terms?"),
    ("Philosophy", "What do you think is the meaning of life?"),
    ("Creative Writing", "Can you help me write a short story about space exploration?"),
    (
        "Problem Solving",
        "I'm facing a difficult decision at work. Can you help me think through it?",
    ),
];

pub fn starter_text(topic: &str) -> Option<&'static str> {
    STARTERS.iter().find(|(t, _)| *t == topic).map(|(_, text)| *text)
}

/// One lock per session cookie, held while a request may change that session.
#[derive(Clone, Default)]
struct SessionLocks(Arc<DashMap<String, Arc<Mutex<()>>>>);

impl SessionLocks {
    fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        Arc::clone(self.0.entry(key.to_string()).or_default().value())
    }

    /// Drops the entry once no request holds or waits on it.
    fn release(&self, key: &str) {
        self.0.remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
    }

    fn len(&self) -> usize {
        self.0.len()
    }
}

#[derive(Clone)]
pub struct AppState {
    provider: Arc<ModelProvider>,
    templates: Arc<Environment<'static>>,
    store: ChatSessionStore,
    session_idle: Duration,
    locks: SessionLocks,
}

impl AppState {
    pub fn new(provider: Arc<ModelProvider>) -> Result<Self> {
        let mut templates = Environment::new();
        templates.add_template(PAGE_TEMPLATE, include_str!("../templates/chat.html"))?;
        Ok(Self {
            provider,
            templates: Arc::new(templates),
            store: ChatSessionStore::default(),
            session_idle: DEFAULT_SESSION_IDLE,
            locks: SessionLocks::default(),
        })
    }

    /// Sessions untouched for `idle` expire and are dropped from the store.
    pub fn with_session_idle(mut self, idle: Duration) -> Self {
        self.session_idle = idle;
        self
    }

    pub fn store(&self) -> &ChatSessionStore {
        &self.store
    }

    fn render(&self, conversation: &Conversation, model_error: Option<&str>) -> Result<String> {
        let template = self.templates.get_template(PAGE_TEMPLATE)?;
        let starters: Vec<&str> = STARTERS.iter().map(|(topic, _)| *topic).collect();
        Ok(template.render(context! {
            turns => conversation.turns(),
            message_count => conversation.message_count(),
            max_length => conversation.max_length(),
            min_length => MIN_MAX_LENGTH,
            max_allowed => MAX_MAX_LENGTH,
            starters => starters,
            model_error => model_error,
            model_id => self.provider.id(),
        })?)
    }
}

pub fn router(state: AppState) -> Router {
    let idle = time::Duration::try_from(state.session_idle).unwrap_or(time::Duration::HOUR);
    let session_layer = SessionManagerLayer::new(state.store.clone())
        .with_name(SESSION_COOKIE)
        .with_secure(false)
        .with_expiry(Expiry::OnInactivity(idle));

    Router::new()
        .route("/", get(page))
        .route("/send", post(send))
        .route("/clear", post(clear))
        .route("/health", get(health))
        .layer(session_layer)
        .layer(middleware::from_fn_with_state(state.clone(), serialize_session))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn session_key(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value.to_string())
}

/// Runs state-changing requests of one session one at a time.
///
/// Sits outside the session layer so the lock also covers the store write
/// that happens after the handler returns.
async fn serialize_session(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if request.method() == Method::GET {
        return next.run(request).await;
    }
    let Some(key) = session_key(request.headers()) else {
        return next.run(request).await;
    };

    let lock = state.locks.lock_for(&key);
    let response = {
        let _guard = lock.lock().await;
        next.run(request).await
    };
    drop(lock);
    state.locks.release(&key);
    debug!("{} session locks outstanding", state.locks.len());
    response
}

/// Turns internal failures into a 500 and logs them.
pub struct AppError(ChatError);

impl<E: Into<ChatError>> From<E> for AppError {
    fn from(err: E) -> Self {
        AppError(err.into())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        error!("Request failed: {}", self.0);
        (StatusCode::INTERNAL_SERVER_ERROR, format!("Something went wrong: {}", self.0)).into_response()
    }
}

async fn page(
    State(state): State<AppState>,
    session: Session,
) -> std::result::Result<Html<String>, AppError> {
    let conversation = Conversation::load(&session).await?;
    Ok(Html(state.render(&conversation, state.provider.failure())?))
}

#[derive(Debug, Deserialize)]
pub struct SendForm {
    #[serde(default)]
    message: String,
    max_length: Option<usize>,
    starter: Option<String>,
}

async fn send(
    State(state): State<AppState>,
    session: Session,
    Form(form): Form<SendForm>,
) -> std::result::Result<Response, AppError> {
    let mut conversation = Conversation::load(&session).await?;
    if let Some(max_length) = form.max_length {
        conversation.set_max_length(max_length);
    }

    let message = match form.starter.as_deref().and_then(starter_text) {
        Some(text) => text.to_string(),
        None => form.message.trim().to_string(),
    };
    if message.is_empty() {
        conversation.save(&session).await?;
        return Ok(Redirect::to("/").into_response());
    }

    let loaded = match state.provider.get().await {
        Ok(loaded) => loaded,
        Err(e) => {
            let detail = match &e {
                ChatError::ModelUnavailable(msg) => msg.clone(),
                other => other.to_string(),
            };
            let html = state.render(&conversation, Some(&detail))?;
            return Ok((StatusCode::SERVICE_UNAVAILABLE, Html(html)).into_response());
        }
    };

    conversation.push_user(message.clone());
    let history = conversation.token_history().map(<[u32]>::to_vec);
    let max_length = conversation.max_length();

    let reply = tokio::task::spawn_blocking(move || {
        let mut rng = rand::thread_rng();
        chat::generate_response(
            loaded.tokenizer.as_ref(),
            loaded.model.as_ref(),
            history.as_deref(),
            &message,
            max_length,
            &DecodingPolicy::CHAT,
            &mut rng,
        )
    })
    .await?;

    conversation.push_ai(reply.text, reply.history);
    conversation.save(&session).await?;
    info!("Exchange {} complete, {} messages in session", conversation.exchanges(), conversation.message_count());

    Ok(Redirect::to("/").into_response())
}

async fn clear(session: Session) -> std::result::Result<Redirect, AppError> {
    let mut conversation = Conversation::load(&session).await?;
    conversation.clear();
    conversation.save(&session).await?;
    Ok(Redirect::to("/"))
}

async fn health(State(state): State<AppState>) -> (StatusCode, String) {
    match state.provider.failure() {
        Some(e) => (StatusCode::SERVICE_UNAVAILABLE, format!("model unavailable: {}", e)),
        None if state.provider.is_ready() => (StatusCode::OK, "ok".to_string()),
        None => (StatusCode::OK, "ok (model not loaded yet)".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LoadedModel;
    use crate::testing::{scripted_model, WordCodec};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    fn working_app() -> Router {
        let provider = ModelProvider::with_loader("fake-dialogpt", || {
            Ok(LoadedModel {
                tokenizer: Arc::new(WordCodec),
                model: Arc::new(scripted_model()),
            })
        });
        router(AppState::new(Arc::new(provider)).unwrap())
    }

    fn slow_state(delay: Duration) -> AppState {
        let provider = ModelProvider::with_loader("slow-dialogpt", move || {
            let mut model = scripted_model();
            model.delay = delay;
            Ok(LoadedModel { tokenizer: Arc::new(WordCodec), model: Arc::new(model) })
        });
        AppState::new(Arc::new(provider)).unwrap()
    }

    fn broken_app() -> Router {
        let provider =
            ModelProvider::with_loader("missing", || Err(anyhow::anyhow!("model.onnx not found")));
        router(AppState::new(Arc::new(provider)).unwrap())
    }

    fn form_post(uri: &str, body: &str, cookie: Option<&str>) -> Request<Body> {
        let mut builder = Request::post(uri)
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded");
        if let Some(cookie) = cookie {
            builder = builder.header(header::COOKIE, cookie);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    fn page_get(cookie: Option<&str>) -> Request<Body> {
        let mut builder = Request::get("/");
        if let Some(cookie) = cookie {
            builder = builder.header(header::COOKIE, cookie);
        }
        builder.body(Body::empty()).unwrap()
    }

    fn session_cookie(response: &Response) -> String {
        let set_cookie = response.headers().get(header::SET_COOKIE).unwrap().to_str().unwrap();
        set_cookie.split(';').next().unwrap().to_string()
    }

    async fn body_text(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn message_count(html: &str) -> String {
        let start = html.find("id=\"message-count\">").unwrap() + "id=\"message-count\">".len();
        let end = start + html[start..].find('<').unwrap();
        html[start..end].to_string()
    }

    #[test]
    fn starters_resolve_by_topic() {
        assert_eq!(starter_text("General Chat"), Some("Hello! How are you doing today?"));
        assert_eq!(starter_text("Cooking"), None);
        assert_eq!(STARTERS.len(), 6);
    }

    #[tokio::test]
    async fn empty_session_shows_welcome() {
        let app = working_app();
        let response = app.oneshot(page_get(None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let html = body_text(response).await;
        assert!(html.contains("Welcome! Start a conversation"));
        assert_eq!(message_count(&html), "0");
        assert!(!html.contains("model-error"));
    }

    #[tokio::test]
    async fn page_lists_features_and_links_the_source() {
        let html = body_text(working_app().oneshot(page_get(None)).await.unwrap()).await;
        for feature in [
            "🎨 Natural conversation flow",
            "🧠 Context-aware responses",
            "💬 Multi-turn conversations",
            "⚡ Fast response generation",
        ] {
            assert!(html.contains(feature), "missing {}", feature);
        }
        assert!(html.contains("View Source Code</a>"));
        assert!(html.contains("b.disabled = true"));
    }

    #[tokio::test]
    async fn sending_a_message_adds_user_and_ai_turns() {
        let app = working_app();
        let response = app
            .clone()
            .oneshot(form_post(
                "/send",
                "message=Hello%21+How+are+you+doing+today%3F&max_length=1000",
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        let cookie = session_cookie(&response);

        let html = body_text(app.oneshot(page_get(Some(&cookie))).await.unwrap()).await;
        assert!(html.contains("Hello! How are you doing today?"));
        assert!(html.contains("i am fine thanks"));
        assert!(!html.contains("&lt;|endoftext|&gt;"));
        assert_eq!(message_count(&html), "2");
    }

    #[tokio::test]
    async fn clearing_after_three_exchanges_empties_the_chat() {
        let app = working_app();
        let first = app
            .clone()
            .oneshot(form_post("/send", "message=hello", None))
            .await
            .unwrap();
        let cookie = session_cookie(&first);
        for text in ["how+are+you", "what+about+ai"] {
            let body = format!("message={}", text);
            app.clone().oneshot(form_post("/send", &body, Some(&cookie))).await.unwrap();
        }

        let html = body_text(app.clone().oneshot(page_get(Some(&cookie))).await.unwrap()).await;
        assert_eq!(message_count(&html), "6");

        let response = app.clone().oneshot(form_post("/clear", "", Some(&cookie))).await.unwrap();
        assert_eq!(response.status(), StatusCode::SEE_OTHER);

        let html = body_text(app.oneshot(page_get(Some(&cookie))).await.unwrap()).await;
        assert_eq!(message_count(&html), "0");
        assert!(html.contains("Welcome! Start a conversation"));
    }

    #[tokio::test]
    async fn starter_buttons_send_their_message() {
        let app = working_app();
        let response = app
            .clone()
            .oneshot(form_post("/send", "message=&starter=Science", None))
            .await
            .unwrap();
        let cookie = session_cookie(&response);

        let html = body_text(app.oneshot(page_get(Some(&cookie))).await.unwrap()).await;
        assert!(html.contains("Can you explain quantum computing in simple terms?"));
        assert_eq!(message_count(&html), "2");
    }

    #[tokio::test]
    async fn blank_messages_are_ignored_but_max_length_sticks() {
        let app = working_app();
        let response = app
            .clone()
            .oneshot(form_post("/send", "message=+++&max_length=5000", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        let cookie = session_cookie(&response);

        let html = body_text(app.oneshot(page_get(Some(&cookie))).await.unwrap()).await;
        assert_eq!(message_count(&html), "0");
        assert!(html.contains("value=\"2000\""));
    }

    #[tokio::test]
    async fn load_failure_shows_an_error_and_appends_nothing() {
        let app = broken_app();
        let response = app
            .clone()
            .oneshot(form_post("/send", "message=hello", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(response.headers().get(header::SET_COOKIE).is_none());
        let html = body_text(response).await;
        assert!(html.contains("Failed to load the chatbot model"));
        assert!(html.contains("model.onnx not found"));
        assert_eq!(message_count(&html), "0");

        let html = body_text(app.oneshot(page_get(None)).await.unwrap()).await;
        assert_eq!(message_count(&html), "0");
        assert!(html.contains("model-error"));
    }

    #[tokio::test]
    async fn load_failure_keeps_an_existing_conversation() {
        let app = broken_app();
        let response = app
            .clone()
            .oneshot(form_post("/send", "message=&max_length=300", None))
            .await
            .unwrap();
        let cookie = session_cookie(&response);

        let response = app
            .clone()
            .oneshot(form_post("/send", "message=hello&max_length=900", Some(&cookie)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let html = body_text(app.oneshot(page_get(Some(&cookie))).await.unwrap()).await;
        assert_eq!(message_count(&html), "0");
        assert!(html.contains("value=\"300\""));
    }

    #[tokio::test]
    async fn overlapping_sends_from_one_session_keep_both_exchanges() {
        let state = slow_state(Duration::from_millis(20));
        let locks = state.locks.clone();
        let app = router(state);
        let response = app
            .clone()
            .oneshot(form_post("/send", "message=&max_length=100", None))
            .await
            .unwrap();
        let cookie = session_cookie(&response);

        let (first, second) = tokio::join!(
            app.clone().oneshot(form_post("/send", "message=hello", Some(&cookie))),
            app.clone().oneshot(form_post("/send", "message=how+are+you", Some(&cookie))),
        );
        assert_eq!(first.unwrap().status(), StatusCode::SEE_OTHER);
        assert_eq!(second.unwrap().status(), StatusCode::SEE_OTHER);

        let html = body_text(app.oneshot(page_get(Some(&cookie))).await.unwrap()).await;
        assert_eq!(message_count(&html), "4");
        assert!(html.contains("hello"));
        assert!(html.contains("how are you"));
        assert_eq!(locks.len(), 0);
    }

    #[tokio::test]
    async fn sessions_expire_after_the_idle_period() {
        let provider = ModelProvider::with_loader("fake-dialogpt", || {
            Ok(LoadedModel { tokenizer: Arc::new(WordCodec), model: Arc::new(scripted_model()) })
        });
        let state = AppState::new(Arc::new(provider))
            .unwrap()
            .with_session_idle(Duration::from_secs(120));
        let store = state.store().clone();
        let app = router(state);

        let response = app
            .clone()
            .oneshot(form_post("/send", "message=hello", None))
            .await
            .unwrap();
        let set_cookie = response.headers().get(header::SET_COOKIE).unwrap().to_str().unwrap();
        assert!(set_cookie.starts_with(SESSION_COOKIE));
        assert!(set_cookie.contains("Max-Age=120"));
        assert_eq!(store.len(), 1);
        assert_eq!(store.prune_expired(), 0);
    }

    #[test]
    fn session_key_reads_only_the_session_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            format!("theme=dark; {}=abc123; other=1", SESSION_COOKIE).parse().unwrap(),
        );
        assert_eq!(session_key(&headers), Some("abc123".to_string()));
        assert_eq!(session_key(&HeaderMap::new()), None);
    }

    #[tokio::test]
    async fn health_reports_model_state() {
        let app = working_app();
        let response = app
            .clone()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "ok (model not loaded yet)");

        let broken = broken_app();
        broken.clone().oneshot(form_post("/send", "message=hi", None)).await.unwrap();
        let response = broken
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
