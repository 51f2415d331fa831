//! HTTP surface: the RFC 8628 protocol endpoints, the browser verification
//! flow, account token management, and health.
use crate::device_flow::{DeviceFlow, DeviceFlowError, VerifyError};
use crate::ratelimit::{self, RateLimiter};
use crate::session::{SessionCookie, SessionGuard, SessionRejection};
use crate::settings::Settings;
use crate::storage;
use crate::tokens::{TokenService, TokenServiceError};
use crate::users::{LoginError, UserService};
use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, FromRequest, Path, Query, Request, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use miette::IntoDiagnostic;
use sea_orm::DatabaseConnection;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;

pub const DEVICE_CODE_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:device_code";

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub db: DatabaseConnection,
    pub users: UserService,
    pub device: DeviceFlow,
    pub tokens: TokenService,
    pub sessions: SessionGuard,
    pub limiter: Option<RateLimiter>,
}

// Security headers middleware
async fn security_headers(request: Request, next: Next) -> impl IntoResponse {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();

    headers.insert(
        HeaderName::from_static("x-frame-options"),
        HeaderValue::from_static("DENY"),
    );
    headers.insert(
        HeaderName::from_static("x-content-type-options"),
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(
        HeaderName::from_static("content-security-policy"),
        HeaderValue::from_static(
            "default-src 'self'; style-src 'self' 'unsafe-inline'; form-action 'self'",
        ),
    );
    headers.insert(
        HeaderName::from_static("referrer-policy"),
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );

    response
}

pub async fn serve(state: AppState) -> miette::Result<()> {
    let limiter = state.limiter.clone();
    let rl = &state.settings.rate_limit;

    let router = Router::new()
        .route(
            "/oauth/device/code",
            post(device_code_endpoint).layer(middleware::from_fn(ratelimit::middleware(
                limiter.clone(),
                "device_code",
                rl.device_code_per_minute,
            ))),
        )
        .route(
            "/oauth/token",
            post(token_endpoint).layer(middleware::from_fn(ratelimit::middleware(
                limiter.clone(),
                "token",
                rl.token_per_minute,
            ))),
        )
        .route("/oauth/tokeninfo", get(tokeninfo))
        .route("/device", get(device_page))
        .route("/device/verify", post(device_verify))
        .route("/device/consent", post(device_consent))
        .route("/login", get(login_page).post(login_submit))
        .route("/logout", get(logout))
        .route("/account/tokens", get(account_tokens_page))
        .route("/account/tokens/{id}/revoke", post(account_token_revoke))
        .route("/account/tokens/{id}/disable", post(account_token_disable))
        .route("/account/tokens/{id}/enable", post(account_token_enable))
        .route("/health", get(health))
        .layer(middleware::from_fn(security_headers))
        .with_state(state.clone());

    let addr: SocketAddr = state
        .settings
        .server
        .addr
        .parse()
        .map_err(|e| miette::miette!("bad listen addr: {e}"))?;

    tracing::info!(%addr, "Authorization server listening");
    let listener = tokio::net::TcpListener::bind(addr).await.into_diagnostic()?;
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .into_diagnostic()?;
    Ok(())
}

/// Accepts either a form or a JSON body, keyed off Content-Type.
pub struct FormOrJson<T>(pub T);

impl<S, T> FromRequest<S> for FormOrJson<T>
where
    S: Send + Sync,
    T: DeserializeOwned,
{
    type Rejection = Response;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let is_json = req
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.starts_with("application/json"))
            .unwrap_or(false);

        let bytes = Bytes::from_request(req, state)
            .await
            .map_err(|_| invalid_request("unreadable request body"))?;

        let value = if is_json {
            serde_json::from_slice(&bytes)
                .map_err(|_| invalid_request("malformed JSON body"))?
        } else {
            serde_urlencoded::from_bytes(&bytes)
                .map_err(|_| invalid_request("malformed form body"))?
        };
        Ok(FormOrJson(value))
    }
}

fn invalid_request(description: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({
            "error": "invalid_request",
            "error_description": description,
        })),
    )
        .into_response()
}

fn json_with_headers(status: StatusCode, value: Value, headers: &[(&str, String)]) -> Response {
    let mut resp = (status, Json(value)).into_response();
    let h = resp.headers_mut();
    for (name, val) in headers {
        if let (Ok(n), Ok(v)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(val),
        ) {
            h.insert(n, v);
        }
    }
    resp
}

// ============================================================================
// Protocol endpoints
// ============================================================================

#[derive(Debug, Deserialize)]
struct DeviceCodeRequest {
    client_id: Option<String>,
    scope: Option<String>,
}

/// POST /oauth/device/code - device authorization request (RFC 8628 3.1)
async fn device_code_endpoint(
    State(state): State<AppState>,
    FormOrJson(req): FormOrJson<DeviceCodeRequest>,
) -> Response {
    let client_id = match req.client_id.as_deref() {
        Some(cid) if !cid.is_empty() => cid,
        _ => return invalid_request("client_id required"),
    };
    let scope = req.scope.unwrap_or_default();

    match state.device.issue(client_id, &scope).await {
        Ok(authorization) => json_with_headers(
            StatusCode::OK,
            serde_json::to_value(authorization).unwrap_or_default(),
            &[("cache-control", "no-store".to_string())],
        ),
        Err(e) => device_flow_error_response(e),
    }
}

#[derive(Debug, Deserialize)]
struct TokenRequest {
    grant_type: Option<String>,
    device_code: Option<String>,
    client_id: Option<String>,
}

/// POST /oauth/token - device code grant (RFC 8628 3.4)
async fn token_endpoint(
    State(state): State<AppState>,
    FormOrJson(req): FormOrJson<TokenRequest>,
) -> Response {
    match req.grant_type.as_deref() {
        Some(DEVICE_CODE_GRANT_TYPE) => {}
        Some(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "unsupported_grant_type"})),
            )
                .into_response()
        }
        None => return invalid_request("grant_type required"),
    }

    let device_code = match req.device_code.as_deref() {
        Some(dc) if !dc.is_empty() => dc,
        _ => return invalid_request("device_code required"),
    };
    // Device flow clients are public; no secret is required.
    let client_id = match req.client_id.as_deref() {
        Some(cid) if !cid.is_empty() => cid,
        _ => return invalid_request("client_id required"),
    };

    match state.device.exchange(client_id, device_code).await {
        Ok(grant) => json_with_headers(
            StatusCode::OK,
            serde_json::to_value(grant).unwrap_or_default(),
            &[
                ("cache-control", "no-store".to_string()),
                ("pragma", "no-cache".to_string()),
            ],
        ),
        Err(e) => device_flow_error_response(e),
    }
}

fn device_flow_error_response(e: DeviceFlowError) -> Response {
    let (error, description) = e.oauth_error();
    let status = match &e {
        DeviceFlowError::InvalidClient => StatusCode::UNAUTHORIZED,
        DeviceFlowError::TokenUnavailable | DeviceFlowError::ServerError(_) => {
            tracing::error!(error = %e, "device flow internal error");
            StatusCode::INTERNAL_SERVER_ERROR
        }
        _ => StatusCode::BAD_REQUEST,
    };
    (
        status,
        Json(json!({"error": error, "error_description": description})),
    )
        .into_response()
}

/// GET /oauth/tokeninfo - bearer introspection
async fn tokeninfo(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let token = match bearer_token(&headers) {
        Some(t) => t,
        None => {
            return json_with_headers(
                StatusCode::UNAUTHORIZED,
                json!({"error": "invalid_request", "error_description": "Bearer token required"}),
                &[(
                    "www-authenticate",
                    "Bearer realm=\"tokeninfo\"".to_string(),
                )],
            )
        }
    };

    match state.tokens.introspect(&token).await {
        Ok(info) => (StatusCode::OK, Json(info)).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "token introspection failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "server_error"})),
            )
                .into_response()
        }
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(|s| s.to_string())
}

/// GET /health - pings the persistence port
async fn health(State(state): State<AppState>) -> Response {
    match storage::ping(&state.db).await {
        Ok(()) => (StatusCode::OK, Json(json!({"status": "ok"}))).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"status": "degraded"})),
            )
                .into_response()
        }
    }
}

// ============================================================================
// Browser flow
// ============================================================================

#[derive(Debug, Deserialize)]
struct LoginQuery {
    return_to: Option<String>,
    error: Option<String>,
}

async fn login_page(Query(q): Query<LoginQuery>) -> impl IntoResponse {
    let error_html = match q.error.as_deref() {
        Some("session_timeout") => {
            "<p class='error'>Your session timed out, please sign in again.</p>".to_string()
        }
        Some("session_invalid") => {
            "<p class='error'>Your session is no longer valid, please sign in again.</p>"
                .to_string()
        }
        Some(err) => format!("<p class='error'>{}</p>", html_escape(err)),
        None => String::new(),
    };

    let return_to = html_escape(&q.return_to.unwrap_or_default());

    Html(format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <title>Sign in</title>
    <meta name="viewport" content="width=device-width, initial-scale=1">
    <style>
        body {{ font-family: system-ui, sans-serif; max-width: 400px; margin: 100px auto; padding: 20px; }}
        h1 {{ color: #333; }}
        label {{ display: block; margin-top: 10px; }}
        input[type="text"], input[type="password"] {{ width: 100%; padding: 8px; margin-top: 5px; box-sizing: border-box; }}
        button {{ margin-top: 20px; padding: 10px 20px; background-color: #007bff; color: white; border: none; cursor: pointer; }}
        button:hover {{ background-color: #0056b3; }}
        .error {{ color: red; }}
    </style>
</head>
<body>
    <h1>Sign in</h1>
    {error_html}
    <form method="POST" action="/login">
        <input type="hidden" name="return_to" value="{return_to}">
        <label>Username</label>
        <input type="text" name="username" required autofocus>
        <label>Password</label>
        <input type="password" name="password" required>
        <button type="submit">Sign in</button>
    </form>
</body>
</html>"#
    ))
}

#[derive(Debug, Deserialize)]
struct LoginForm {
    username: String,
    password: String,
    return_to: Option<String>,
}

async fn login_submit(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    axum::Form(form): axum::Form<LoginForm>,
) -> Response {
    if let Some(limiter) = &state.limiter {
        if let Err(resp) = limiter
            .check(
                "login",
                &headers,
                Some(peer),
                state.settings.rate_limit.login_per_minute,
            )
            .await
        {
            return resp;
        }
    }

    let return_to = form.return_to.clone().unwrap_or_default();
    let user = match state.users.login(&form.username, &form.password).await {
        Ok(user) => user,
        Err(e) => {
            let message = match e {
                LoginError::BadCredentials => "Invalid username or password",
                LoginError::UsernameConflict => "This username cannot be used",
                LoginError::AuthUnavailable => "Authentication service unavailable, try again later",
                LoginError::Storage(ref msg) => {
                    tracing::error!(error = %msg, "login failed");
                    "Sign-in failed, try again later"
                }
            };
            return Redirect::to(&format!(
                "/login?error={}&return_to={}",
                urlencoded(message),
                urlencoded(&return_to)
            ))
            .into_response();
        }
    };

    let session = match state.sessions.start(&user.id, &headers, Some(peer)).await {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "failed to create session");
            return Redirect::to(&format!(
                "/login?error={}&return_to={}",
                urlencoded("Failed to create session"),
                urlencoded(&return_to)
            ))
            .into_response();
        }
    };

    let cookie = SessionCookie::new(session.session_id);
    let destination = if return_to.is_empty() {
        "/account/tokens".to_string()
    } else {
        return_to
    };

    Response::builder()
        .status(StatusCode::SEE_OTHER)
        .header(header::SET_COOKIE, cookie.to_cookie_header(&state.settings))
        .header(header::LOCATION, destination)
        .body(Body::empty())
        .unwrap_or_else(|_| Redirect::to("/login").into_response())
}

async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Response {
    state.sessions.end(&headers).await;

    Response::builder()
        .status(StatusCode::SEE_OTHER)
        .header(header::SET_COOKIE, SessionCookie::delete_cookie_header())
        .header(header::LOCATION, "/login")
        .body(Body::empty())
        .unwrap_or_else(|_| Redirect::to("/login").into_response())
}

fn login_redirect(rejection: SessionRejection, return_to: &str) -> Response {
    let mut target = format!("/login?return_to={}", urlencoded(return_to));
    if rejection != SessionRejection::NotLoggedIn {
        target.push_str(&format!("&error={}", rejection.login_error()));
    }
    Redirect::to(&target).into_response()
}

#[derive(Debug, Deserialize)]
struct DevicePageQuery {
    user_code: Option<String>,
}

/// GET /device - user code entry form
async fn device_page(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<DevicePageQuery>,
) -> Response {
    let return_to = match &query.user_code {
        Some(code) => format!("/device?user_code={}", urlencoded(code)),
        None => "/device".to_string(),
    };
    if let Err(rejection) = state.sessions.check(&headers, Some(peer)).await {
        return login_redirect(rejection, &return_to);
    }

    let prefilled = html_escape(query.user_code.as_deref().unwrap_or(""));
    Html(format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>Device Verification</title>
    <style>
        body {{ font-family: sans-serif; max-width: 600px; margin: 50px auto; padding: 20px; }}
        .container {{ background: #f5f5f5; padding: 30px; border-radius: 8px; }}
        h1 {{ margin-top: 0; }}
        input {{ font-size: 18px; padding: 10px; width: 100%; box-sizing: border-box; margin: 10px 0; text-transform: uppercase; }}
        button {{ background: #007bff; color: white; border: none; padding: 12px 24px; font-size: 16px; border-radius: 4px; cursor: pointer; }}
        button:hover {{ background: #0056b3; }}
        .instructions {{ background: white; padding: 15px; border-left: 4px solid #007bff; margin-bottom: 20px; }}
    </style>
</head>
<body>
    <div class="container">
        <h1>Device Verification</h1>
        <div class="instructions">
            <p>Enter the code shown on your device to continue.</p>
            <p>Format: <strong>XXXX-XXXX</strong> (8 characters)</p>
        </div>
        <form method="POST" action="/device/verify">
            <input type="text" name="user_code" placeholder="Enter code (e.g., WDJB-MJHT)" value="{prefilled}" maxlength="10" required autofocus>
            <button type="submit">Continue</button>
        </form>
    </div>
</body>
</html>"#
    ))
    .into_response()
}

#[derive(Debug, Deserialize)]
struct DeviceVerifyForm {
    user_code: String,
}

/// POST /device/verify - resolve the user code and show the consent page
async fn device_verify(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    axum::Form(form): axum::Form<DeviceVerifyForm>,
) -> Response {
    if let Some(limiter) = &state.limiter {
        if let Err(resp) = limiter
            .check(
                "device_verify",
                &headers,
                Some(peer),
                state.settings.rate_limit.device_verify_per_minute,
            )
            .await
        {
            return resp;
        }
    }

    if let Err(rejection) = state.sessions.check(&headers, Some(peer)).await {
        return login_redirect(rejection, "/device");
    }

    let row = match state.device.find_by_user_code(&form.user_code).await {
        Ok(row) => row,
        Err(e) => return verify_error_page(e),
    };

    let client_name = storage::get_client(&state.db, &row.client_id)
        .await
        .ok()
        .flatten()
        .map(|c| c.name)
        .unwrap_or_else(|| "Unknown application".to_string());

    let display_code = crate::device_flow::format_user_code(&row.user_code);
    let scope_display = if row.scope.is_empty() {
        "(none requested)".to_string()
    } else {
        html_escape(&row.scope)
    };

    Html(format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>Authorize Device</title>
    <style>
        body {{ font-family: sans-serif; max-width: 600px; margin: 50px auto; padding: 20px; }}
        .container {{ background: #f5f5f5; padding: 30px; border-radius: 8px; }}
        h1 {{ margin-top: 0; }}
        .device-info {{ background: white; padding: 15px; border-radius: 4px; margin: 20px 0; }}
        .device-info dt {{ font-weight: bold; margin-top: 10px; }}
        .device-info dd {{ margin-left: 0; color: #555; }}
        .code-display {{ background: #007bff; color: white; padding: 15px; text-align: center; font-size: 24px; font-family: monospace; border-radius: 4px; margin: 20px 0; letter-spacing: 2px; }}
        .buttons {{ display: flex; gap: 10px; margin-top: 20px; }}
        button {{ flex: 1; padding: 12px; font-size: 16px; border: none; border-radius: 4px; cursor: pointer; }}
        .approve {{ background: #28a745; color: white; }}
        .approve:hover {{ background: #218838; }}
        .deny {{ background: #dc3545; color: white; }}
        .deny:hover {{ background: #c82333; }}
        .warning {{ background: #fff3cd; border-left: 4px solid #ffc107; padding: 15px; margin-bottom: 20px; }}
    </style>
</head>
<body>
    <div class="container">
        <h1>Authorize Device</h1>
        <div class="warning">
            <strong>Only continue if you started this sign-in yourself.</strong>
        </div>
        <div class="code-display">{display_code}</div>
        <div class="device-info">
            <dl>
                <dt>Application:</dt>
                <dd>{client_name}</dd>
                <dt>Requested scopes:</dt>
                <dd>{scope_display}</dd>
            </dl>
        </div>
        <div class="buttons">
            <form method="POST" action="/device/consent" style="flex: 1;">
                <input type="hidden" name="user_code" value="{user_code}">
                <input type="hidden" name="approved" value="true">
                <button type="submit" class="approve">Approve</button>
            </form>
            <form method="POST" action="/device/consent" style="flex: 1;">
                <input type="hidden" name="user_code" value="{user_code}">
                <input type="hidden" name="approved" value="false">
                <button type="submit" class="deny">Deny</button>
            </form>
        </div>
    </div>
</body>
</html>"#,
        display_code = display_code,
        client_name = html_escape(&client_name),
        scope_display = scope_display,
        user_code = html_escape(&row.user_code),
    ))
    .into_response()
}

#[derive(Debug, Deserialize)]
struct DeviceConsentForm {
    user_code: String,
    #[serde(default)]
    approved: bool,
}

/// POST /device/consent - record the approval or denial
async fn device_consent(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    axum::Form(form): axum::Form<DeviceConsentForm>,
) -> Response {
    let session = match state.sessions.check(&headers, Some(peer)).await {
        Ok(session) => session,
        Err(rejection) => return login_redirect(rejection, "/device"),
    };

    let outcome = if form.approved {
        state
            .device
            .authorize(&form.user_code, &session.user_id)
            .await
    } else {
        state.device.deny(&form.user_code).await
    };

    if let Err(e) = outcome {
        return verify_error_page(e);
    }

    if form.approved {
        Html(
            r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="UTF-8">
    <title>Device Approved</title>
    <style>
        body { font-family: sans-serif; max-width: 600px; margin: 50px auto; padding: 20px; }
        .container { background: #d4edda; border: 1px solid #c3e6cb; padding: 30px; border-radius: 8px; text-align: center; }
        h1 { color: #155724; margin-top: 0; }
        p { color: #155724; font-size: 18px; }
        .mark { font-size: 48px; color: #28a745; }
    </style>
</head>
<body>
    <div class="container">
        <div class="mark">&#10003;</div>
        <h1>Device Approved</h1>
        <p>You can now return to your device and continue.</p>
    </div>
</body>
</html>"#,
        )
        .into_response()
    } else {
        Html(
            r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="UTF-8">
    <title>Device Denied</title>
    <style>
        body { font-family: sans-serif; max-width: 600px; margin: 50px auto; padding: 20px; }
        .container { background: #f8d7da; border: 1px solid #f5c6cb; padding: 30px; border-radius: 8px; text-align: center; }
        h1 { color: #721c24; margin-top: 0; }
        p { color: #721c24; font-size: 18px; }
        .mark { font-size: 48px; color: #dc3545; }
    </style>
</head>
<body>
    <div class="container">
        <div class="mark">&#10007;</div>
        <h1>Device Access Denied</h1>
        <p>The authorization request has been rejected.</p>
    </div>
</body>
</html>"#,
        )
        .into_response()
    }
}

fn verify_error_page(e: VerifyError) -> Response {
    let (status, message) = match e {
        VerifyError::InvalidCode => (StatusCode::NOT_FOUND, "That code was not recognized."),
        VerifyError::Expired => (
            StatusCode::GONE,
            "That code has expired. Start over on your device.",
        ),
        VerifyError::AlreadyUsed => (
            StatusCode::CONFLICT,
            "That code has already been used.",
        ),
        VerifyError::Storage(ref msg) => {
            tracing::error!(error = %msg, "device verification failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Something went wrong, try again later.",
            )
        }
    };
    error_page(status, message)
}

fn error_page(status: StatusCode, message: &str) -> Response {
    (
        status,
        Html(format!(
            r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="UTF-8">
    <title>Error</title>
    <style>
        body {{ font-family: sans-serif; max-width: 600px; margin: 50px auto; padding: 20px; }}
        .container {{ background: #f8d7da; border: 1px solid #f5c6cb; padding: 30px; border-radius: 8px; }}
        h1 {{ color: #721c24; margin-top: 0; }}
        p {{ color: #721c24; }}
        a {{ color: #007bff; }}
    </style>
</head>
<body>
    <div class="container">
        <h1>Something went wrong</h1>
        <p>{}</p>
        <p><a href="/device">Back to device verification</a></p>
    </div>
</body>
</html>"#,
            html_escape(message)
        )),
    )
        .into_response()
}

// ============================================================================
// Account token management
// ============================================================================

/// GET /account/tokens - list the caller's tokens
async fn account_tokens_page(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let session = match state.sessions.check(&headers, Some(peer)).await {
        Ok(session) => session,
        Err(rejection) => return login_redirect(rejection, "/account/tokens"),
    };

    let username = state
        .users
        .get_by_id(&session.user_id)
        .await
        .ok()
        .flatten()
        .map(|u| html_escape(&u.username))
        .unwrap_or_default();

    let tokens = match state.tokens.list_for_user(&session.user_id).await {
        Ok(tokens) => tokens,
        Err(e) => {
            tracing::error!(error = %e, "failed to list tokens");
            return error_page(StatusCode::INTERNAL_SERVER_ERROR, "Failed to load tokens.");
        }
    };

    let now = chrono::Utc::now().timestamp();
    let rows: String = tokens
        .iter()
        .map(|entry| {
            let token = &entry.token;
            let status = if token.revoked_at.is_some() {
                "revoked"
            } else if token.disabled != 0 {
                "disabled"
            } else if token.expires_at <= now {
                "expired"
            } else {
                "active"
            };
            let actions = match status {
                "active" => format!(
                    r#"<form method="POST" action="/account/tokens/{id}/disable" style="display:inline"><button>Disable</button></form>
                       <form method="POST" action="/account/tokens/{id}/revoke" style="display:inline"><button class="danger">Revoke</button></form>"#,
                    id = html_escape(&token.id)
                ),
                "disabled" => format!(
                    r#"<form method="POST" action="/account/tokens/{id}/enable" style="display:inline"><button>Enable</button></form>
                       <form method="POST" action="/account/tokens/{id}/revoke" style="display:inline"><button class="danger">Revoke</button></form>"#,
                    id = html_escape(&token.id)
                ),
                _ => String::new(),
            };
            format!(
                "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>",
                html_escape(entry.client_name.as_deref().unwrap_or("(deleted client)")),
                html_escape(&token.scope),
                status,
                actions
            )
        })
        .collect();

    Html(format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="UTF-8">
    <title>Your tokens</title>
    <style>
        body {{ font-family: sans-serif; max-width: 800px; margin: 50px auto; padding: 20px; }}
        table {{ border-collapse: collapse; width: 100%; }}
        th, td {{ text-align: left; padding: 8px; border-bottom: 1px solid #ddd; }}
        button {{ padding: 4px 12px; border: none; border-radius: 4px; cursor: pointer; background: #007bff; color: white; }}
        button.danger {{ background: #dc3545; }}
        .top {{ display: flex; justify-content: space-between; align-items: center; }}
        a {{ color: #007bff; }}
    </style>
</head>
<body>
    <div class="top">
        <h1>Your tokens</h1>
        <span>{username} &middot; <a href="/logout">Sign out</a></span>
    </div>
    <table>
        <tr><th>Application</th><th>Scope</th><th>Status</th><th></th></tr>
        {rows}
    </table>
</body>
</html>"#
    ))
    .into_response()
}

async fn account_token_revoke(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    token_mutation(state, peer, headers, id, TokenAction::Revoke).await
}

async fn account_token_disable(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    token_mutation(state, peer, headers, id, TokenAction::Disable).await
}

async fn account_token_enable(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    token_mutation(state, peer, headers, id, TokenAction::Enable).await
}

enum TokenAction {
    Revoke,
    Disable,
    Enable,
}

async fn token_mutation(
    state: AppState,
    peer: SocketAddr,
    headers: HeaderMap,
    id: String,
    action: TokenAction,
) -> Response {
    let session = match state.sessions.check(&headers, Some(peer)).await {
        Ok(session) => session,
        Err(rejection) => return login_redirect(rejection, "/account/tokens"),
    };

    let result = match action {
        TokenAction::Revoke => state.tokens.revoke(&session.user_id, &id).await,
        TokenAction::Disable => state.tokens.disable(&session.user_id, &id).await,
        TokenAction::Enable => state.tokens.enable(&session.user_id, &id).await,
    };

    match result {
        Ok(()) => Redirect::to("/account/tokens").into_response(),
        Err(TokenServiceError::NotFound) => {
            error_page(StatusCode::NOT_FOUND, "That token does not exist.")
        }
        Err(TokenServiceError::Forbidden) => error_page(
            StatusCode::FORBIDDEN,
            "You do not have permission to manage this token.",
        ),
        Err(TokenServiceError::Storage(msg)) => {
            tracing::error!(error = %msg, "token mutation failed");
            error_page(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Something went wrong, try again later.",
            )
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#x27;")
}

fn urlencoded(s: &str) -> String {
    urlencoding::encode(s).into_owned()
}
