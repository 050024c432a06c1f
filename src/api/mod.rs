//! HTTP surface: router, layers and server start-up.

use anyhow::{Context, Result, anyhow};
use axum::{
    Extension, Router,
    body::Body,
    extract::MatchedPath,
    http::{
        HeaderName, HeaderValue, Method, Request,
        header::{AUTHORIZATION, CONTENT_TYPE},
    },
    middleware::from_fn_with_state,
    routing::{get, post},
};
use sqlx::{PgPool, postgres::PgPoolOptions};
use std::{sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    request_id::PropagateRequestIdLayer,
    set_header::SetRequestHeaderLayer,
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{Span, info, info_span, warn};
use ulid::Ulid;
use url::Url;
use utoipa_swagger_ui::SwaggerUi;

use crate::cli::telemetry;

pub mod error;
pub mod handlers;
mod openapi;

use handlers::{admin, auth, health, internal};

pub use handlers::auth::{AuthConfig, AuthState, SmtpConfig, Stores};
pub use openapi::openapi;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Connect to Postgres, wire the auth state and serve until SIGINT/SIGTERM.
///
/// # Errors
/// Returns error if the database is unreachable, the configuration is
/// unusable or the listener cannot bind.
pub async fn new(port: u16, dsn: String, config: AuthConfig) -> Result<()> {
    let pool = PgPoolOptions::new()
        .min_connections(5)
        .max_connections(25)
        .acquire_timeout(Duration::from_secs(5))
        .test_before_acquire(true)
        .connect(&dsn)
        .await
        .context("Failed to connect to database")?;

    let stores = Stores::postgres(&pool, &config);
    let state = Arc::new(AuthState::new(config, stores)?);
    let app = router(state, pool)?;

    let listener = TcpListener::bind(format!("::0:{port}")).await?;

    info!("Listening on [::]:{}", port);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    telemetry::shutdown_tracer();

    Ok(())
}

/// The full application: routes, auth middleware, request-id, tracing, CORS
/// and the OpenAPI/Swagger endpoints.
///
/// # Errors
/// Returns error if a configured CORS origin is not a valid URL.
pub fn router(state: Arc<AuthState>, pool: PgPool) -> Result<Router> {
    let public = Router::new()
        .route("/auth/check-user", post(auth::login::check_user))
        .route("/auth/register", post(auth::register::register))
        .route("/auth/login", post(auth::login::login))
        .route("/auth/refresh", post(auth::login::refresh))
        .route("/auth/otp/send", post(auth::otp::send))
        .route("/auth/otp/verify", post(auth::otp::verify))
        .route("/auth/oauth/google", get(auth::oauth::start))
        .route("/auth/oauth/google/callback", get(auth::oauth::callback))
        .route("/auth/passkey/login/begin", post(auth::passkeys::login_begin))
        .route("/auth/passkey/login/finish", post(auth::passkeys::login_finish))
        .route("/admin/auth/login", post(admin::login))
        .route("/admin/auth/signup", post(admin::signup))
        .route("/admin/auth/refresh", post(admin::refresh));

    let customer = Router::new()
        .route("/auth/logout", post(auth::login::logout))
        .route("/auth/me", get(auth::login::me))
        .route(
            "/auth/passkey/register/begin",
            post(auth::passkeys::register_begin),
        )
        .route(
            "/auth/passkey/register/finish",
            post(auth::passkeys::register_finish),
        )
        .route_layer(from_fn_with_state(state.clone(), auth::require_customer));

    let admins = Router::new()
        .route("/admin/auth/logout", post(admin::logout))
        .route("/admin/auth/invite", post(admin::invite))
        .route("/admin/users", get(admin::list))
        .route_layer(from_fn_with_state(state.clone(), auth::require_admin));

    let service = Router::new()
        .route("/validate-token", post(internal::validate_token))
        .route("/users/:id", get(internal::user_by_id))
        .route_layer(from_fn_with_state(
            state.clone(),
            internal::require_service_key,
        ));

    let cors = cors_layer(state.config().cors_origins())?;

    Ok(Router::new()
        .route("/health", get(health::health))
        .route("/ready", get(health::ready))
        .nest("/api/v1", public.merge(customer).merge(admins))
        .nest("/internal", service)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", openapi()))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestHeaderLayer::if_not_present(
                    HeaderName::from_static("x-request-id"),
                    |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
                ))
                .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                    "x-request-id",
                )))
                .layer(TraceLayer::new_for_http().make_span_with(make_span))
                .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
                .layer(cors)
                .layer(Extension(state))
                .layer(Extension(pool)),
        ))
}

fn make_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");
    let matched_path = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str);

    info_span!(
        "http.request",
        http.method = %request.method(),
        http.route = matched_path,
        request_id
    )
}

fn cors_layer(origins: &[String]) -> Result<CorsLayer> {
    let origins = origins
        .iter()
        .map(|origin| origin_header(origin))
        .collect::<Result<Vec<_>>>()?;
    Ok(CorsLayer::new()
        .allow_headers([CONTENT_TYPE, AUTHORIZATION])
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_origin(AllowOrigin::list(origins))
        .allow_credentials(true))
}

fn origin_header(origin: &str) -> Result<HeaderValue> {
    let parsed = Url::parse(origin.trim()).with_context(|| format!("Invalid CORS origin: {origin}"))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| anyhow!("CORS origin must include a valid host: {origin}"))?;
    let port = parsed
        .port()
        .map_or_else(String::new, |port| format!(":{port}"));
    let origin = format!("{}://{}{}", parsed.scheme(), host, port);
    HeaderValue::from_str(&origin).context("Failed to build CORS origin header")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for ctrl-c: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!("Failed to listen for SIGTERM: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Gracefully shutdown");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_header_strips_path() -> Result<()> {
        let header = origin_header("https://app.berhot.com:8443/en/signin")?;
        assert_eq!(header, "https://app.berhot.com:8443");
        Ok(())
    }

    #[test]
    fn origin_header_rejects_garbage() {
        assert!(origin_header("not a url").is_err());
    }
}
