use std::{path::Path, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    extract::{rejection::JsonRejection, FromRef, Multipart, Path as UrlPath, State},
    http::{header::SET_COOKIE, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Redirect, Response},
    routing::{delete, get, post, put},
    Form, Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::services::ServeDir;

use crate::{
    auth::{self, AdminPrincipal, SessionGate},
    chat::ChatService,
    config::{ConfigStore, Configuration, Settings},
    db, extract,
    llm::UpstreamClient,
    models::{Message, Principal, ReplyEnvelope, UserRole},
    prompt::{self, SystemPrompt},
    telemetry,
};

/**
 * \brief 路由共享状态。
 */
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub chat: Arc<ChatService>,
    pub gate: SessionGate,
}

impl FromRef<AppState> for SessionGate {
    fn from_ref(state: &AppState) -> Self {
        state.gate.clone()
    }
}

impl AppState {
    fn config(&self) -> &Arc<ConfigStore> {
        self.chat.config()
    }
}

/**
 * \brief 按设置装配状态：迁移用户库、加载配置文件、构建上游客户端。
 */
pub fn build_state(settings: Settings) -> Result<AppState> {
    let conn = db::open(&settings.db_path).context("open database failed")?;
    db::migrate(&conn).context("apply migrations failed")?;
    let store = Arc::new(ConfigStore::load(&settings.config_path)?);
    let client = UpstreamClient::new(
        settings.upstream_timeout,
        &settings.referer,
        &settings.title,
    )
    .context("build upstream client failed")?;
    let chat = ChatService::new(store, SystemPrompt::from_file(&settings.prompt_path), client);
    Ok(AppState {
        gate: SessionGate::new(&settings.db_path),
        settings: Arc::new(settings),
        chat: Arc::new(chat),
    })
}

pub fn router(state: AppState) -> Router {
    let static_service = ServeDir::new(&state.settings.ui_dir);

    Router::new()
        .route("/", get(index))
        .route("/login", get(login_page).post(login))
        .route("/logout", get(logout))
        .route("/chat", get(chat_page))
        .route("/api/message", post(api_message))
        .route("/api/chat", post(api_message))
        .route("/api/upload", post(upload))
        .route("/api/config", get(get_config).post(set_config))
        .route("/api/admin/users", get(list_users).post(create_user))
        .route("/api/admin/users/{username}", delete(remove_user))
        .route("/api/admin/users/{username}/password", put(reset_password))
        .route("/api/admin/keys", get(list_keys).post(add_key))
        .route("/api/admin/keys/{index}", delete(remove_key))
        .route("/api/admin/keys/{index}/select", post(select_key))
        .fallback_service(static_service)
        .with_state(state)
}

/**
 * \brief 启动 HTTP 服务，提供静态页面与 API。
 * \param addr 监听地址，如 "0.0.0.0:5000"
 */
pub async fn run(addr: &str, settings: Settings) -> Result<()> {
    let state = build_state(settings)?;
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    telemetry::log_event("server", &format!("listening on http://{}", addr));
    axum::serve(listener, app).await?;
    Ok(())
}

type ApiError = (StatusCode, Json<Value>);

fn api_err<E: std::fmt::Display>(status: StatusCode, e: E) -> ApiError {
    (status, Json(json!({ "error": e.to_string() })))
}

fn internal_err<E: std::fmt::Display>(e: E) -> ApiError {
    api_err(StatusCode::INTERNAL_SERVER_ERROR, e)
}

fn bad_request<E: std::fmt::Display>(e: E) -> ApiError {
    api_err(StatusCode::BAD_REQUEST, e)
}

async fn serve_page(ui_dir: &Path, page: &str) -> Result<Html<String>, ApiError> {
    let path = ui_dir.join(page);
    tokio::fs::read_to_string(&path)
        .await
        .map(Html)
        .map_err(|e| internal_err(format!("{}: {}", path.display(), e)))
}

async fn index(State(state): State<AppState>, headers: HeaderMap) -> Redirect {
    if state.gate.authorize(&headers).is_ok() {
        Redirect::to("/chat")
    } else {
        Redirect::to("/login")
    }
}

async fn login_page(State(state): State<AppState>) -> Result<Html<String>, ApiError> {
    serve_page(&state.settings.ui_dir, "login.html").await
}

#[derive(Deserialize, Debug)]
struct LoginForm {
    username: String,
    password: String,
}

async fn login(State(state): State<AppState>, Form(form): Form<LoginForm>) -> Response {
    match state.gate.authenticate(&form.username, &form.password) {
        Ok((token, principal)) => {
            telemetry::log_event(
                "server.auth",
                &format!("login user={} role={}", principal.username, principal.role.as_str()),
            );
            (
                [(SET_COOKIE, auth::session_cookie(&token))],
                Redirect::to("/chat"),
            )
                .into_response()
        }
        Err(auth::AuthError::Denied) => {
            telemetry::log_event("server.auth", &format!("denied user={}", form.username));
            Redirect::to("/login?error=1").into_response()
        }
        Err(e) => internal_err(e).into_response(),
    }
}

async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Response {
    state.gate.logout(&headers);
    ([(SET_COOKIE, auth::cleared_cookie())], Redirect::to("/")).into_response()
}

async fn chat_page(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if state.gate.authorize(&headers).is_err() {
        return Redirect::to("/").into_response();
    }
    serve_page(&state.settings.ui_dir, "chat.html")
        .await
        .into_response()
}

#[derive(Deserialize, Debug)]
struct Attachment {
    name: String,
    text: String,
}

#[derive(Deserialize, Debug)]
struct ChatRequest {
    #[serde(default)]
    message: String,
    #[serde(default)]
    history: Vec<Message>,
    #[serde(default)]
    attachment: Option<Attachment>,
}

/**
 * \brief 聊天接口：POST /api/message。上游失败时仍以 200 返回描述文本。
 */
async fn api_message(
    principal: Principal,
    State(state): State<AppState>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Json<ReplyEnvelope>, ApiError> {
    let Json(req) = payload.map_err(|e| bad_request(e.body_text()))?;
    if req.message.trim().is_empty() && req.attachment.is_none() {
        return Err(bad_request("message must not be empty"));
    }
    prompt::validate_history(&req.history).map_err(bad_request)?;

    let text = match &req.attachment {
        Some(doc) => prompt::with_attachment(&req.message, &doc.name, &doc.text),
        None => req.message,
    };
    telemetry::log_event(
        "server.chat",
        &format!(
            "user={} history={} prompt_len={}",
            principal.username,
            req.history.len(),
            text.len()
        ),
    );
    let result = state.chat.respond(req.history, &text).await;
    Ok(Json(ChatService::envelope(result)))
}

/**
 * \brief 上传文档并抽取文本：POST /api/upload（multipart）。抽取失败返回 `{error}`。
 */
async fn upload(
    principal: Principal,
    mut multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    while let Some(field) = multipart.next_field().await.map_err(bad_request)? {
        let Some(name) = field.file_name().map(|n| n.to_string()) else {
            continue;
        };
        let bytes = field.bytes().await.map_err(bad_request)?;
        return Ok(Json(match extract::extract_bytes(&name, bytes.to_vec()) {
            Ok(text) => {
                telemetry::log_event(
                    "server.upload",
                    &format!("user={} file={} chars={}", principal.username, name, text.len()),
                );
                json!({ "name": name, "text": text })
            }
            Err(e) => {
                telemetry::log_error("server.upload", &e.to_string());
                json!({ "error": e.to_string() })
            }
        }));
    }
    Err(bad_request("no file field in upload"))
}

async fn get_config(
    _admin: AdminPrincipal,
    State(state): State<AppState>,
) -> Json<Configuration> {
    Json(Configuration::clone(&state.config().get()))
}

/**
 * \brief 更新配置：请求体为完整配置文档，校验通过后整体替换并落盘。
 */
async fn set_config(
    AdminPrincipal(admin): AdminPrincipal,
    State(state): State<AppState>,
    payload: Result<Json<Configuration>, JsonRejection>,
) -> Result<Json<Configuration>, ApiError> {
    let Json(config) = payload.map_err(|e| bad_request(e.body_text()))?;
    state.config().update(config).map_err(bad_request)?;
    telemetry::log_event("server.config", &format!("updated by {}", admin.username));
    Ok(Json(Configuration::clone(&state.config().get())))
}

#[derive(Serialize, Debug)]
struct UserDto {
    username: String,
    role: UserRole,
}

#[derive(Deserialize, Debug)]
struct CreateUserRequest {
    username: String,
    password: String,
    #[serde(default)]
    role: Option<UserRole>,
}

#[derive(Deserialize, Debug)]
struct PasswordRequest {
    password: String,
}

async fn list_users(
    _admin: AdminPrincipal,
    State(state): State<AppState>,
) -> Result<Json<Vec<UserDto>>, ApiError> {
    let conn = db::open(&state.settings.db_path).map_err(internal_err)?;
    let users = db::list_users(&conn).map_err(internal_err)?;
    Ok(Json(
        users
            .into_iter()
            .map(|u| UserDto {
                username: u.username,
                role: u.role,
            })
            .collect(),
    ))
}

async fn create_user(
    AdminPrincipal(admin): AdminPrincipal,
    State(state): State<AppState>,
    Json(payload): Json<CreateUserRequest>,
) -> Result<(StatusCode, Json<UserDto>), ApiError> {
    let username = payload.username.trim();
    if username.is_empty() || payload.password.is_empty() {
        return Err(bad_request("username and password are required"));
    }
    let role = payload.role.unwrap_or(UserRole::User);
    let hash = auth::hash_password(&payload.password).map_err(internal_err)?;
    let conn = db::open(&state.settings.db_path).map_err(internal_err)?;
    if db::get_user(&conn, username).map_err(internal_err)?.is_some() {
        return Err(api_err(
            StatusCode::CONFLICT,
            format!("user {} already exists", username),
        ));
    }
    db::insert_user(&conn, username, &hash, role).map_err(internal_err)?;
    telemetry::log_event(
        "server.admin",
        &format!("{} created user={} role={}", admin.username, username, role.as_str()),
    );
    Ok((
        StatusCode::CREATED,
        Json(UserDto {
            username: username.to_string(),
            role,
        }),
    ))
}

async fn remove_user(
    AdminPrincipal(admin): AdminPrincipal,
    State(state): State<AppState>,
    UrlPath(username): UrlPath<String>,
) -> Result<StatusCode, ApiError> {
    let conn = db::open(&state.settings.db_path).map_err(internal_err)?;
    let user = db::get_user(&conn, &username)
        .map_err(internal_err)?
        .ok_or_else(|| api_err(StatusCode::NOT_FOUND, format!("user {} not found", username)))?;
    if user.role == UserRole::Admin && db::count_admins(&conn).map_err(internal_err)? <= 1 {
        return Err(bad_request("cannot delete the last admin"));
    }
    db::delete_user(&conn, &username).map_err(internal_err)?;
    state.gate.revoke_user(&username);
    telemetry::log_event(
        "server.admin",
        &format!("{} deleted user={}", admin.username, username),
    );
    Ok(StatusCode::NO_CONTENT)
}

async fn reset_password(
    AdminPrincipal(admin): AdminPrincipal,
    State(state): State<AppState>,
    UrlPath(username): UrlPath<String>,
    Json(payload): Json<PasswordRequest>,
) -> Result<StatusCode, ApiError> {
    if payload.password.is_empty() {
        return Err(bad_request("password is required"));
    }
    let conn = db::open(&state.settings.db_path).map_err(internal_err)?;
    if db::get_user(&conn, &username).map_err(internal_err)?.is_none() {
        return Err(api_err(
            StatusCode::NOT_FOUND,
            format!("user {} not found", username),
        ));
    }
    let hash = auth::hash_password(&payload.password).map_err(internal_err)?;
    db::set_password(&conn, &username, &hash).map_err(internal_err)?;
    state.gate.revoke_user(&username);
    telemetry::log_event(
        "server.admin",
        &format!("{} reset password for user={}", admin.username, username),
    );
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Serialize, Debug)]
struct KeyItem {
    index: usize,
    key: String,
    active: bool,
}

#[derive(Serialize, Debug)]
struct KeysState {
    keys: Vec<KeyItem>,
    active_key_index: Option<usize>,
}

#[derive(Deserialize, Debug)]
struct AddKeyRequest {
    key: String,
    #[serde(default)]
    set_active: Option<bool>,
}

/** \brief 列表中只展示密钥首尾各 4 个字符。 */
fn mask_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}...{}", head, tail)
}

fn keys_state(config: &Configuration) -> KeysState {
    let active = if config.api_keys.is_empty() {
        None
    } else {
        Some(
            config
                .active_key_index
                .filter(|i| *i < config.api_keys.len())
                .unwrap_or(0),
        )
    };
    KeysState {
        keys: config
            .api_keys
            .iter()
            .enumerate()
            .map(|(index, key)| KeyItem {
                index,
                key: mask_key(key),
                active: Some(index) == active,
            })
            .collect(),
        active_key_index: config.active_key_index,
    }
}

async fn list_keys(_admin: AdminPrincipal, State(state): State<AppState>) -> Json<KeysState> {
    Json(keys_state(&state.config().get()))
}

async fn add_key(
    AdminPrincipal(admin): AdminPrincipal,
    State(state): State<AppState>,
    Json(payload): Json<AddKeyRequest>,
) -> Result<Json<KeysState>, ApiError> {
    let key = payload.key.trim().to_string();
    if key.is_empty() {
        return Err(bad_request("key is required"));
    }
    let set_active = payload.set_active.unwrap_or(false);
    let index = state
        .config()
        .modify(|config| {
            if config.api_keys.contains(&key) {
                anyhow::bail!("key already present");
            }
            config.api_keys.push(key);
            let index = config.api_keys.len() - 1;
            if set_active {
                config.active_key_index = Some(index);
            }
            Ok(index)
        })
        .map_err(bad_request)?;
    telemetry::log_event(
        "server.admin",
        &format!("{} added key index={}", admin.username, index),
    );
    Ok(Json(keys_state(&state.config().get())))
}

async fn remove_key(
    AdminPrincipal(admin): AdminPrincipal,
    State(state): State<AppState>,
    UrlPath(index): UrlPath<usize>,
) -> Result<Json<KeysState>, ApiError> {
    if index >= state.config().get().api_keys.len() {
        return Err(api_err(
            StatusCode::NOT_FOUND,
            format!("key index {} out of range", index),
        ));
    }
    state
        .config()
        .modify(|config| {
            if index >= config.api_keys.len() {
                anyhow::bail!("key index {} out of range", index);
            }
            config.api_keys.remove(index);
            config.active_key_index = match config.active_key_index {
                Some(active) if active == index => None,
                Some(active) if active > index => Some(active - 1),
                other => other,
            };
            Ok(())
        })
        .map_err(bad_request)?;
    telemetry::log_event(
        "server.admin",
        &format!("{} removed key index={}", admin.username, index),
    );
    Ok(Json(keys_state(&state.config().get())))
}

fn select_active_key(config: &mut Configuration, index: usize) -> Result<()> {
    if index >= config.api_keys.len() {
        anyhow::bail!("key index {} out of range", index);
    }
    config.active_key_index = Some(index);
    Ok(())
}

async fn select_key(
    AdminPrincipal(admin): AdminPrincipal,
    State(state): State<AppState>,
    UrlPath(index): UrlPath<usize>,
) -> Result<Json<KeysState>, ApiError> {
    if index >= state.config().get().api_keys.len() {
        return Err(api_err(
            StatusCode::NOT_FOUND,
            format!("key index {} out of range", index),
        ));
    }
    state
        .config()
        .modify(|config| select_active_key(config, index))
        .map_err(bad_request)?;
    telemetry::log_event(
        "server.admin",
        &format!("{} selected key index={}", admin.username, index),
    );
    Ok(Json(keys_state(&state.config().get())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::{to_bytes, Body},
        http::{header, Request},
    };
    use std::time::Duration;
    use tower::ServiceExt;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const BODY_LIMIT: usize = 1_048_576;

    struct Harness {
        _dir: tempfile::TempDir,
        app: Router,
        state: AppState,
    }

    fn harness(base_url: &str, keys: &[&str]) -> Harness {
        let dir = tempfile::tempdir().expect("tempdir");
        let ui_dir = dir.path().join("web");
        std::fs::create_dir_all(&ui_dir).unwrap();
        std::fs::write(ui_dir.join("login.html"), "<form>login</form>").unwrap();
        std::fs::write(ui_dir.join("chat.html"), "<main>chat</main>").unwrap();

        let settings = Settings {
            config_path: dir.path().join("config.json"),
            db_path: dir.path().join("test.db"),
            prompt_path: dir.path().join("system-prompt.txt"),
            ui_dir,
            upstream_timeout: Duration::from_secs(5),
            ..Settings::default()
        };
        let state = build_state(settings).expect("build state");
        state
            .config()
            .update(Configuration {
                api_keys: keys.iter().map(|k| k.to_string()).collect(),
                base_url: base_url.to_string(),
                ..Configuration::default()
            })
            .expect("seed config");

        let conn = db::open(&state.settings.db_path).unwrap();
        db::insert_user(
            &conn,
            "root",
            &auth::hash_password("rootpw").unwrap(),
            UserRole::Admin,
        )
        .unwrap();
        db::insert_user(
            &conn,
            "bob",
            &auth::hash_password("bobpw").unwrap(),
            UserRole::User,
        )
        .unwrap();

        Harness {
            _dir: dir,
            app: router(state.clone()),
            state,
        }
    }

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), BODY_LIMIT)
            .await
            .expect("read body");
        serde_json::from_slice(&bytes).expect("parse json")
    }

    async fn login_cookie(app: &Router, username: &str, password: &str) -> String {
        let request = Request::builder()
            .method("POST")
            .uri("/login")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(format!("username={}&password={}", username, password)))
            .expect("build request");
        let response = app.clone().oneshot(request).await.expect("router call");
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        let cookie = response
            .headers()
            .get(SET_COOKIE)
            .expect("session cookie")
            .to_str()
            .unwrap();
        cookie.split(';').next().unwrap().to_string()
    }

    fn json_request(method: &str, uri: &str, cookie: Option<&str>, body: Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(cookie) = cookie {
            builder = builder.header(header::COOKIE, cookie);
        }
        builder
            .body(Body::from(body.to_string()))
            .expect("build request")
    }

    fn get_request(uri: &str, cookie: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method("GET").uri(uri);
        if let Some(cookie) = cookie {
            builder = builder.header(header::COOKIE, cookie);
        }
        builder.body(Body::empty()).expect("build request")
    }

    #[tokio::test]
    async fn test_unauthenticated_chat_is_rejected_without_upstream_call() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;
        let h = harness(&server.uri(), &["sk-test"]);

        let request = json_request(
            "POST",
            "/api/message",
            None,
            json!({"message": "hi", "history": []}),
        );
        let response = h.app.clone().oneshot(request).await.expect("router call");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = json_body(response).await;
        assert!(body["error"].is_string());
        server.verify().await;
    }

    #[tokio::test]
    async fn test_chat_returns_model_reply() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(r#"{"choices":[{"message":{"content":"hello"}}]}"#),
            )
            .expect(1)
            .mount(&server)
            .await;
        let h = harness(&server.uri(), &["sk-test"]);
        let cookie = login_cookie(&h.app, "bob", "bobpw").await;

        let request = json_request(
            "POST",
            "/api/chat",
            Some(&cookie),
            json!({
                "message": "hi",
                "history": [{"role": "user", "content": "a"}, {"role": "assistant", "content": "b"}]
            }),
        );
        let response = h.app.clone().oneshot(request).await.expect("router call");
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body, json!({"reply": "hello"}));
    }

    #[tokio::test]
    async fn test_upstream_failure_is_embedded_in_reply() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("rate limited"))
            .mount(&server)
            .await;
        let h = harness(&server.uri(), &["sk-test"]);
        let cookie = login_cookie(&h.app, "bob", "bobpw").await;

        let request = json_request("POST", "/api/message", Some(&cookie), json!({"message": "hi"}));
        let response = h.app.clone().oneshot(request).await.expect("router call");
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        let reply = body["reply"].as_str().expect("reply text");
        assert!(reply.contains("500"));
        assert!(reply.contains("rate limited"));
        assert_eq!(body["error"], "upstream");
    }

    #[tokio::test]
    async fn test_missing_key_is_reported_as_config_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;
        let h = harness(&server.uri(), &[]);
        let cookie = login_cookie(&h.app, "bob", "bobpw").await;

        let request = json_request("POST", "/api/message", Some(&cookie), json!({"message": "hi"}));
        let response = h.app.clone().oneshot(request).await.expect("router call");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["error"], "config");
        server.verify().await;
    }

    #[tokio::test]
    async fn test_system_turn_in_history_is_rejected() {
        let h = harness("http://127.0.0.1:9", &["sk-test"]);
        let cookie = login_cookie(&h.app, "bob", "bobpw").await;

        let request = json_request(
            "POST",
            "/api/message",
            Some(&cookie),
            json!({"message": "hi", "history": [{"role": "system", "content": "x"}]}),
        );
        let response = h.app.clone().oneshot(request).await.expect("router call");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let request = json_request(
            "POST",
            "/api/message",
            Some(&cookie),
            json!({"message": "hi", "history": [{"role": "robot", "content": "x"}]}),
        );
        let response = h.app.clone().oneshot(request).await.expect("router call");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(json_body(response).await["error"].is_string());
    }

    #[tokio::test]
    async fn test_config_round_trip_for_admin() {
        let h = harness("http://127.0.0.1:9", &["sk-test"]);
        let cookie = login_cookie(&h.app, "root", "rootpw").await;

        let posted = json!({
            "api_keys": ["sk-one", "sk-two"],
            "models": ["model-a", "model-b"],
            "base_url": "https://llm.example.com/v1",
            "active_key_index": 1,
            "active_model_index": 0
        });
        let response = h
            .app
            .clone()
            .oneshot(json_request("POST", "/api/config", Some(&cookie), posted.clone()))
            .await
            .expect("router call");
        assert_eq!(response.status(), StatusCode::OK);

        let response = h
            .app
            .clone()
            .oneshot(get_request("/api/config", Some(&cookie)))
            .await
            .expect("router call");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await, posted);

        let on_disk: Configuration = serde_json::from_str(
            &std::fs::read_to_string(&h.state.settings.config_path).unwrap(),
        )
        .unwrap();
        assert_eq!(on_disk.api_keys.len(), 2);
    }

    #[tokio::test]
    async fn test_config_post_replaces_previous_indices() {
        let h = harness("http://127.0.0.1:9", &["sk-test"]);
        let cookie = login_cookie(&h.app, "root", "rootpw").await;

        let first = json!({
            "api_keys": ["sk-one", "sk-two"],
            "models": ["a", "b"],
            "base_url": "https://llm.example.com/v1",
            "active_key_index": 1,
            "active_model_index": 1,
            "max_tokens": 64
        });
        let response = h
            .app
            .clone()
            .oneshot(json_request("POST", "/api/config", Some(&cookie), first))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let second = json!({
            "api_keys": ["sk-one"],
            "models": ["a"],
            "base_url": "https://llm.example.com/v1"
        });
        let response = h
            .app
            .clone()
            .oneshot(json_request("POST", "/api/config", Some(&cookie), second.clone()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await, second);

        let response = h
            .app
            .clone()
            .oneshot(get_request("/api/config", Some(&cookie)))
            .await
            .unwrap();
        assert_eq!(json_body(response).await, second);
        let stored = h.state.config().get();
        assert_eq!(stored.active_key_index, None);
        assert_eq!(stored.max_tokens, None);
    }

    #[tokio::test]
    async fn test_config_rejects_bad_shape() {
        let h = harness("http://127.0.0.1:9", &["sk-test"]);
        let cookie = login_cookie(&h.app, "root", "rootpw").await;

        for body in [
            json!({"base_url": "not a url"}),
            json!({"models": "gpt"}),
            json!({"unknown_field": 1}),
        ] {
            let response = h
                .app
                .clone()
                .oneshot(json_request("POST", "/api/config", Some(&cookie), body))
                .await
                .expect("router call");
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        }
        assert_eq!(h.state.config().get().base_url, "http://127.0.0.1:9");
    }

    #[tokio::test]
    async fn test_config_requires_admin() {
        let h = harness("http://127.0.0.1:9", &["sk-test"]);
        let cookie = login_cookie(&h.app, "bob", "bobpw").await;
        let response = h
            .app
            .clone()
            .oneshot(get_request("/api/config", Some(&cookie)))
            .await
            .expect("router call");
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = h
            .app
            .clone()
            .oneshot(get_request("/api/config", None))
            .await
            .expect("router call");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_failed_login_redirects_back() {
        let h = harness("http://127.0.0.1:9", &[]);
        let request = Request::builder()
            .method("POST")
            .uri("/login")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from("username=bob&password=wrong"))
            .unwrap();
        let response = h.app.clone().oneshot(request).await.expect("router call");
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(response.headers()[header::LOCATION], "/login?error=1");
        assert!(response.headers().get(SET_COOKIE).is_none());
    }

    #[tokio::test]
    async fn test_pages_redirect_by_session() {
        let h = harness("http://127.0.0.1:9", &[]);
        let response = h.app.clone().oneshot(get_request("/", None)).await.unwrap();
        assert_eq!(response.headers()[header::LOCATION], "/login");
        let response = h.app.clone().oneshot(get_request("/chat", None)).await.unwrap();
        assert_eq!(response.headers()[header::LOCATION], "/");

        let cookie = login_cookie(&h.app, "bob", "bobpw").await;
        let response = h
            .app
            .clone()
            .oneshot(get_request("/", Some(&cookie)))
            .await
            .unwrap();
        assert_eq!(response.headers()[header::LOCATION], "/chat");
        let response = h
            .app
            .clone()
            .oneshot(get_request("/chat", Some(&cookie)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = h
            .app
            .clone()
            .oneshot(get_request("/logout", Some(&cookie)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        let response = h
            .app
            .clone()
            .oneshot(get_request("/chat", Some(&cookie)))
            .await
            .unwrap();
        assert_eq!(response.headers()[header::LOCATION], "/");
    }

    #[tokio::test]
    async fn test_admin_manages_key_pool() {
        let h = harness("http://127.0.0.1:9", &["sk-first-key-0001"]);
        let cookie = login_cookie(&h.app, "root", "rootpw").await;

        let response = h
            .app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/admin/keys",
                Some(&cookie),
                json!({"key": "sk-second-key-0002", "set_active": true}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["keys"][1]["key"], "sk-s...0002");
        assert_eq!(body["keys"][1]["active"], true);
        assert_eq!(body["active_key_index"], 1);

        let response = h
            .app
            .clone()
            .oneshot(json_request("POST", "/api/admin/keys/0/select", Some(&cookie), json!({})))
            .await
            .unwrap();
        assert_eq!(json_body(response).await["active_key_index"], 0);

        let response = h
            .app
            .clone()
            .oneshot(json_request("DELETE", "/api/admin/keys/0", Some(&cookie), json!({})))
            .await
            .unwrap();
        let body = json_body(response).await;
        assert_eq!(body["keys"].as_array().unwrap().len(), 1);
        assert!(body["active_key_index"].is_null());
        assert_eq!(h.state.config().get().api_keys, vec!["sk-second-key-0002".to_string()]);

        let response = h
            .app
            .clone()
            .oneshot(json_request("DELETE", "/api/admin/keys/7", Some(&cookie), json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_admin_manages_users() {
        let h = harness("http://127.0.0.1:9", &[]);
        let cookie = login_cookie(&h.app, "root", "rootpw").await;

        let response = h
            .app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/admin/users",
                Some(&cookie),
                json!({"username": "carol", "password": "carolpw"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let carol = login_cookie(&h.app, "carol", "carolpw").await;

        let response = h
            .app
            .clone()
            .oneshot(json_request(
                "PUT",
                "/api/admin/users/carol/password",
                Some(&cookie),
                json!({"password": "newpw"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        let response = h
            .app
            .clone()
            .oneshot(json_request("POST", "/api/message", Some(&carol), json!({"message": "x"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        login_cookie(&h.app, "carol", "newpw").await;

        let response = h
            .app
            .clone()
            .oneshot(get_request("/api/admin/users", Some(&cookie)))
            .await
            .unwrap();
        let users = json_body(response).await;
        assert_eq!(users.as_array().unwrap().len(), 3);

        let response = h
            .app
            .clone()
            .oneshot(json_request("DELETE", "/api/admin/users/root", Some(&cookie), json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = h
            .app
            .clone()
            .oneshot(json_request("DELETE", "/api/admin/users/carol", Some(&cookie), json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_upload_extracts_text_or_reports_error() {
        let h = harness("http://127.0.0.1:9", &[]);
        let cookie = login_cookie(&h.app, "bob", "bobpw").await;

        let multipart = |name: &str, content: &str| {
            let boundary = "XBOUNDARYX";
            let body = format!(
                "--{b}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{n}\"\r\nContent-Type: application/octet-stream\r\n\r\n{c}\r\n--{b}--\r\n",
                b = boundary,
                n = name,
                c = content
            );
            Request::builder()
                .method("POST")
                .uri("/api/upload")
                .header(
                    header::CONTENT_TYPE,
                    format!("multipart/form-data; boundary={}", boundary),
                )
                .header(header::COOKIE, cookie.clone())
                .body(Body::from(body))
                .unwrap()
        };

        let response = h
            .app
            .clone()
            .oneshot(multipart("notes.txt", "quarterly numbers"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            json_body(response).await,
            json!({"name": "notes.txt", "text": "quarterly numbers"})
        );

        let response = h
            .app
            .clone()
            .oneshot(multipart("image.png", "binary"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(json_body(response).await["error"]
            .as_str()
            .unwrap()
            .contains(".png"));
    }

    #[test]
    fn test_select_active_key_rechecks_bounds() {
        let mut config = Configuration {
            api_keys: vec!["sk-a".into(), "sk-b".into()],
            ..Configuration::default()
        };
        select_active_key(&mut config, 1).expect("in range");
        assert_eq!(config.active_key_index, Some(1));

        config.api_keys.truncate(1);
        assert!(select_active_key(&mut config, 1).is_err());
        assert_eq!(config.active_key_index, Some(1));
    }

    #[test]
    fn test_mask_key_hides_middle() {
        assert_eq!(mask_key("short"), "*****");
        assert_eq!(mask_key("sk-abcdefghijkl"), "sk-a...ijkl");
    }
}
