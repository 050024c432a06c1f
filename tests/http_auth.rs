//! End-to-end tests of the HTTP surface.
//!
//! The router is built exactly as in production but over the in-process
//! stores, so every flow runs without Postgres:
//! 1. Customer registration, login, refresh, logout and `me`.
//! 2. One-time codes, including send and attempt bounds.
//! 3. Admin bootstrap, realm isolation and the internal introspection routes.
//! 4. Optional providers (Google, passkeys) reporting 501 when unconfigured.

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
};
use identity_access::{
    api::{self, AuthConfig, AuthState, Stores},
    identity::{MemoryIdentityStore, admin::MemoryAdminStore},
    otp::{MemoryOtpStore, OtpSender},
    realm::MemoryDirectory,
    session::MemorySessionStore,
    webauthn::{AuthenticatorDetails, MemoryPasskeyStore, NewPasskey, PasskeyStore},
};
use base64ct::{Base64UrlUnpadded, Encoding};
use secrecy::SecretString;
use serde_json::{Value, json};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tokio::sync::Mutex;
use tower::ServiceExt;
use uuid::Uuid;

#[derive(Default)]
struct CapturingSender {
    sent: Mutex<Vec<(String, String)>>,
}

impl CapturingSender {
    async fn last_code(&self, destination: &str) -> Option<String> {
        self.sent
            .lock()
            .await
            .iter()
            .rev()
            .find(|(to, _)| to == destination)
            .map(|(_, code)| code.clone())
    }
}

#[async_trait]
impl OtpSender for CapturingSender {
    async fn send(&self, destination: &str, code: &str) -> Result<()> {
        self.sent
            .lock()
            .await
            .push((destination.to_string(), code.to_string()));
        Ok(())
    }
}

struct TestApp {
    router: Router,
    customer_sessions: Arc<MemorySessionStore>,
    identities: Arc<MemoryIdentityStore>,
    passkeys: Arc<MemoryPasskeyStore>,
    sender: Arc<CapturingSender>,
}

impl TestApp {
    fn new() -> Result<Self> {
        Self::build(|config| config, false)
    }

    fn with_config(configure: impl FnOnce(AuthConfig) -> AuthConfig) -> Result<Self> {
        Self::build(configure, false)
    }

    fn with_passkeys() -> Result<Self> {
        Self::build(|config| config, true)
    }

    fn build(
        configure: impl FnOnce(AuthConfig) -> AuthConfig,
        enable_passkeys: bool,
    ) -> Result<Self> {
        let config = configure(
            AuthConfig::new(SecretString::from("integration-signing-secret".to_string()))
                .with_bcrypt_cost(4),
        );

        let customer_sessions = Arc::new(MemorySessionStore::new());
        let customers = Arc::new(MemoryDirectory::new());
        let admins = Arc::new(MemoryDirectory::new());
        let sender = Arc::new(CapturingSender::default());
        let identities = Arc::new(MemoryIdentityStore::new(customers.clone()));
        let passkeys = Arc::new(MemoryPasskeyStore::new());

        let stores = Stores {
            customer_sessions: customer_sessions.clone(),
            admin_sessions: Arc::new(MemorySessionStore::new()),
            customers: customers.clone(),
            admins: admins.clone(),
            identities: identities.clone(),
            admin_accounts: Arc::new(MemoryAdminStore::new(admins)),
            otp: Arc::new(MemoryOtpStore::new()),
            otp_sender: sender.clone(),
            passkeys: enable_passkeys.then(|| passkeys.clone() as Arc<dyn PasskeyStore>),
        };

        let state = Arc::new(AuthState::new(config, stores)?);
        let pool = PgPoolOptions::new().connect_lazy("postgres://berhot@localhost:5432/berhot")?;
        let router = api::router(state, pool)?;

        Ok(Self {
            router,
            customer_sessions,
            identities,
            passkeys,
            sender,
        })
    }

    async fn call(
        &self,
        method: &str,
        uri: &str,
        bearer: Option<&str>,
        body: Option<Value>,
    ) -> Result<(StatusCode, Value)> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = bearer {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(serde_json::to_vec(&body)?))?,
            None => builder.body(Body::empty())?,
        };

        let response = self.router.clone().oneshot(request).await?;
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await?;
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        Ok((status, value))
    }

    async fn register(&self, email: &str, password: &str) -> Result<Value> {
        let (status, body) = self
            .call(
                "POST",
                "/api/v1/auth/register",
                None,
                Some(json!({
                    "email": email,
                    "password": password,
                    "firstName": "Amal",
                    "lastName": "Haddad",
                    "businessName": "Haddad Bakery",
                })),
            )
            .await?;
        assert_eq!(status, StatusCode::CREATED, "register failed: {body}");
        Ok(body)
    }

    async fn bootstrap_admin(&self) -> Result<Value> {
        let (status, body) = self
            .call(
                "POST",
                "/api/v1/admin/auth/signup",
                None,
                Some(json!({
                    "email": "root@berhot.com",
                    "password": "correct-horse-battery",
                    "firstName": "Root",
                    "lastName": "Admin",
                })),
            )
            .await?;
        assert_eq!(status, StatusCode::CREATED, "admin signup failed: {body}");
        Ok(body)
    }
}

/// A discoverable assertion naming `user_id` in its user handle. Its
/// signature is junk, so it can only ever fail verification.
fn assertion_for(user_id: Uuid) -> Value {
    json!({
        "id": "Y3JlZC0x",
        "rawId": "Y3JlZC0x",
        "type": "public-key",
        "response": {
            "authenticatorData": "AA",
            "clientDataJSON": "AA",
            "signature": "AA",
            "userHandle": Base64UrlUnpadded::encode_string(user_id.as_bytes()),
        },
        "extensions": {},
    })
}

async fn begin_passkey_login(app: &TestApp) -> Result<String> {
    let (status, begun) = app
        .call("POST", "/api/v1/auth/passkey/login/begin", None, None)
        .await?;
    assert_eq!(status, StatusCode::OK, "passkey begin failed: {begun}");
    assert!(begun["publicKey"]["challenge"].is_string());
    Ok(token(&begun, "sessionKey")?.to_string())
}

fn token<'a>(body: &'a Value, field: &str) -> Result<&'a str> {
    body[field]
        .as_str()
        .with_context(|| format!("missing {field} in {body}"))
}

#[tokio::test]
async fn register_provisions_tenant_owner_and_signs_in() -> Result<()> {
    let app = TestApp::new()?;
    let body = app.register("amal@example.com", "s3cure-pass").await?;

    assert_eq!(body["user"]["email"], "amal@example.com");
    assert_eq!(body["user"]["role"], "tenant_owner");
    assert!(body["user"]["tenantId"].is_string());
    assert_eq!(body["expiresIn"], 900);

    let access = token(&body, "accessToken")?;
    let (status, me) = app.call("GET", "/api/v1/auth/me", Some(access), None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(me["userId"], body["user"]["id"]);
    assert_eq!(me["tenantId"], body["user"]["tenantId"]);
    Ok(())
}

#[tokio::test]
async fn duplicate_registration_conflicts() -> Result<()> {
    let app = TestApp::new()?;
    app.register("amal@example.com", "s3cure-pass").await?;

    let (status, _) = app
        .call(
            "POST",
            "/api/v1/auth/register",
            None,
            Some(json!({ "email": "AMAL@example.com", "password": "s3cure-pass" })),
        )
        .await?;
    assert_eq!(status, StatusCode::CONFLICT);
    Ok(())
}

#[tokio::test]
async fn login_failures_share_one_message() -> Result<()> {
    let app = TestApp::new()?;
    app.register("amal@example.com", "s3cure-pass").await?;

    let (wrong_status, wrong) = app
        .call(
            "POST",
            "/api/v1/auth/login",
            None,
            Some(json!({ "email": "amal@example.com", "password": "not-it-at-all" })),
        )
        .await?;
    let (unknown_status, unknown) = app
        .call(
            "POST",
            "/api/v1/auth/login",
            None,
            Some(json!({ "email": "nobody@example.com", "password": "not-it-at-all" })),
        )
        .await?;

    assert_eq!(wrong_status, StatusCode::UNAUTHORIZED);
    assert_eq!(unknown_status, StatusCode::UNAUTHORIZED);
    assert_eq!(wrong, unknown);

    let (status, body) = app
        .call(
            "POST",
            "/api/v1/auth/login",
            None,
            Some(json!({ "identifier": "amal@example.com", "password": "s3cure-pass" })),
        )
        .await?;
    assert_eq!(status, StatusCode::OK);
    assert!(body["accessToken"].is_string());
    Ok(())
}

#[tokio::test]
async fn refresh_is_refused_after_logout() -> Result<()> {
    let app = TestApp::new()?;
    let body = app.register("amal@example.com", "s3cure-pass").await?;
    let access = token(&body, "accessToken")?;
    let refresh = token(&body, "refreshToken")?;

    let (status, rotated) = app
        .call(
            "POST",
            "/api/v1/auth/refresh",
            None,
            Some(json!({ "refreshToken": refresh })),
        )
        .await?;
    assert_eq!(status, StatusCode::OK);
    assert!(rotated["accessToken"].is_string());

    let (status, _) = app.call("POST", "/api/v1/auth/logout", Some(access), None).await?;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = app
        .call(
            "POST",
            "/api/v1/auth/refresh",
            None,
            Some(json!({ "refreshToken": refresh })),
        )
        .await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = app.call("GET", "/api/v1/auth/me", Some(access), None).await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    Ok(())
}

#[tokio::test]
async fn rotated_refresh_token_cannot_be_replayed() -> Result<()> {
    let app = TestApp::new()?;
    let body = app.register("amal@example.com", "s3cure-pass").await?;
    let original = token(&body, "refreshToken")?;

    let (status, rotated) = app
        .call(
            "POST",
            "/api/v1/auth/refresh",
            None,
            Some(json!({ "refreshToken": original })),
        )
        .await?;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = app
        .call(
            "POST",
            "/api/v1/auth/refresh",
            None,
            Some(json!({ "refreshToken": original })),
        )
        .await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = app
        .call(
            "POST",
            "/api/v1/auth/refresh",
            None,
            Some(json!({ "refreshToken": token(&rotated, "refreshToken")? })),
        )
        .await?;
    assert_eq!(status, StatusCode::OK);
    Ok(())
}

#[tokio::test]
async fn repeated_logout_leaves_revocation_unchanged() -> Result<()> {
    let app = TestApp::new()?;
    let body = app.register("amal@example.com", "s3cure-pass").await?;
    let access = token(&body, "accessToken")?;

    let (_, me) = app.call("GET", "/api/v1/auth/me", Some(access), None).await?;
    let session_id: Uuid = serde_json::from_value(me["sessionId"].clone())?;

    app.call("POST", "/api/v1/auth/logout", Some(access), None).await?;
    let first = app
        .customer_sessions
        .revoked_at(session_id)
        .await
        .context("session should be revoked")?;

    let (status, _) = app.call("POST", "/api/v1/auth/logout", Some(access), None).await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(app.customer_sessions.revoked_at(session_id).await, Some(first));
    Ok(())
}

#[tokio::test]
async fn suspended_tenants_cannot_sign_in_or_refresh() -> Result<()> {
    let app = TestApp::new()?;
    let registered = app.register("amal@example.com", "s3cure-pass").await?;
    let tenant_id: Uuid = registered["user"]["tenantId"]
        .as_str()
        .context("missing tenantId")?
        .parse()?;

    app.identities.set_tenant_status(tenant_id, "suspended").await;

    let (status, body) = app
        .call(
            "POST",
            "/api/v1/auth/login",
            None,
            Some(json!({ "email": "amal@example.com", "password": "s3cure-pass" })),
        )
        .await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "Invalid email or password");

    let (status, _) = app
        .call(
            "POST",
            "/api/v1/auth/refresh",
            None,
            Some(json!({ "refreshToken": token(&registered, "refreshToken")? })),
        )
        .await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = app
        .call(
            "GET",
            "/api/v1/auth/me",
            Some(token(&registered, "accessToken")?),
            None,
        )
        .await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    Ok(())
}

#[tokio::test]
async fn protected_routes_need_a_bearer_token() -> Result<()> {
    let app = TestApp::new()?;

    for (method, uri) in [
        ("GET", "/api/v1/auth/me"),
        ("POST", "/api/v1/auth/logout"),
        ("GET", "/api/v1/admin/users"),
        ("POST", "/api/v1/admin/auth/invite"),
    ] {
        let (status, body) = app.call(method, uri, None, None).await?;
        assert_eq!(status, StatusCode::UNAUTHORIZED, "{method} {uri}");
        assert_eq!(body["error"], "Unauthorized");
    }

    let (status, _) = app
        .call("GET", "/api/v1/auth/me", Some("not-a-jwt"), None)
        .await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    Ok(())
}

#[tokio::test]
async fn realms_do_not_accept_each_others_tokens() -> Result<()> {
    let app = TestApp::new()?;
    let customer = app.register("amal@example.com", "s3cure-pass").await?;
    let admin = app.bootstrap_admin().await?;

    let customer_token = token(&customer, "accessToken")?;
    let admin_token = token(&admin, "accessToken")?;

    let (status, _) = app
        .call("GET", "/api/v1/admin/users", Some(customer_token), None)
        .await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = app
        .call("GET", "/api/v1/auth/me", Some(admin_token), None)
        .await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = app
        .call(
            "POST",
            "/api/v1/auth/refresh",
            None,
            Some(json!({ "refreshToken": token(&admin, "refreshToken")? })),
        )
        .await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, list) = app
        .call("GET", "/api/v1/admin/users", Some(admin_token), None)
        .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list["total"], 1);
    Ok(())
}

#[tokio::test]
async fn admin_signup_closes_after_bootstrap() -> Result<()> {
    let app = TestApp::new()?;
    let admin = app.bootstrap_admin().await?;
    assert_eq!(admin["admin"]["role"], "super_admin");

    let (status, body) = app
        .call(
            "POST",
            "/api/v1/admin/auth/signup",
            None,
            Some(json!({
                "email": "second@berhot.com",
                "password": "correct-horse-battery",
                "firstName": "Second",
                "lastName": "Admin",
            })),
        )
        .await?;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "Admin signup is disabled. Use invite flow.");

    let (status, invited) = app
        .call(
            "POST",
            "/api/v1/admin/auth/invite",
            Some(token(&admin, "accessToken")?),
            Some(json!({
                "email": "support@berhot.com",
                "firstName": "Sam",
                "lastName": "Support",
            })),
        )
        .await?;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(invited["admin"]["role"], "support_agent");

    let temp_password = token(&invited, "tempPassword")?;
    let (status, login) = app
        .call(
            "POST",
            "/api/v1/admin/auth/login",
            None,
            Some(json!({ "email": "support@berhot.com", "password": temp_password })),
        )
        .await?;
    assert_eq!(status, StatusCode::OK);

    // Support agents cannot invite.
    let (status, _) = app
        .call(
            "POST",
            "/api/v1/admin/auth/invite",
            Some(token(&login, "accessToken")?),
            Some(json!({
                "email": "another@berhot.com",
                "firstName": "Another",
                "lastName": "Admin",
            })),
        )
        .await?;
    assert_eq!(status, StatusCode::FORBIDDEN);
    Ok(())
}

#[tokio::test]
async fn super_admins_can_invite_super_admins() -> Result<()> {
    let app = TestApp::new()?;
    let root = app.bootstrap_admin().await?;
    let root_token = token(&root, "accessToken")?;

    let (status, deputy) = app
        .call(
            "POST",
            "/api/v1/admin/auth/invite",
            Some(root_token),
            Some(json!({
                "email": "deputy@berhot.com",
                "firstName": "Dana",
                "lastName": "Deputy",
                "role": "super_admin",
            })),
        )
        .await?;
    assert_eq!(status, StatusCode::CREATED, "invite failed: {deputy}");
    assert_eq!(deputy["admin"]["role"], "super_admin");

    let (status, ops) = app
        .call(
            "POST",
            "/api/v1/admin/auth/invite",
            Some(root_token),
            Some(json!({
                "email": "ops@berhot.com",
                "firstName": "Omar",
                "lastName": "Ops",
                "role": "system_admin",
            })),
        )
        .await?;
    assert_eq!(status, StatusCode::CREATED);

    let (status, login) = app
        .call(
            "POST",
            "/api/v1/admin/auth/login",
            None,
            Some(json!({
                "email": "ops@berhot.com",
                "password": token(&ops, "tempPassword")?,
            })),
        )
        .await?;
    assert_eq!(status, StatusCode::OK);

    // A system admin may invite, but not a super admin.
    let (status, _) = app
        .call(
            "POST",
            "/api/v1/admin/auth/invite",
            Some(token(&login, "accessToken")?),
            Some(json!({
                "email": "third@berhot.com",
                "firstName": "Third",
                "lastName": "Admin",
                "role": "super_admin",
            })),
        )
        .await?;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = app
        .call(
            "POST",
            "/api/v1/admin/auth/signup",
            None,
            Some(json!({
                "email": "late@berhot.com",
                "password": "correct-horse-battery",
                "firstName": "Late",
                "lastName": "Admin",
            })),
        )
        .await?;
    assert_eq!(status, StatusCode::FORBIDDEN);
    Ok(())
}

#[tokio::test]
async fn otp_sign_in_for_known_and_unknown_identifiers() -> Result<()> {
    let app = TestApp::new()?;
    let registered = app.register("amal@example.com", "s3cure-pass").await?;

    let (status, sent) = app
        .call(
            "POST",
            "/api/v1/auth/otp/send",
            None,
            Some(json!({ "identifier": "Amal@Example.com" })),
        )
        .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(sent["destination"], "am***@example.com");
    assert_eq!(sent["expiresIn"], 300);

    let code = app
        .sender
        .last_code("amal@example.com")
        .await
        .context("no code captured")?;
    let (status, verified) = app
        .call(
            "POST",
            "/api/v1/auth/otp/verify",
            None,
            Some(json!({ "identifier": "amal@example.com", "code": code })),
        )
        .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(verified["userExists"], true);
    assert_eq!(verified["user"]["id"], registered["user"]["id"]);
    assert!(verified["accessToken"].is_string());

    app.call(
        "POST",
        "/api/v1/auth/otp/send",
        None,
        Some(json!({ "identifier": "new@example.com" })),
    )
    .await?;
    let code = app
        .sender
        .last_code("new@example.com")
        .await
        .context("no code captured")?;
    let (status, fresh) = app
        .call(
            "POST",
            "/api/v1/auth/otp/verify",
            None,
            Some(json!({ "identifier": "new@example.com", "code": code })),
        )
        .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fresh["userExists"], false);
    assert_eq!(fresh["needsRegistration"], true);
    assert!(fresh.get("accessToken").is_none());
    Ok(())
}

#[tokio::test]
async fn otp_attempts_and_sends_are_bounded() -> Result<()> {
    let app = TestApp::new()?;
    let identifier = "bounded@example.com";

    app.call(
        "POST",
        "/api/v1/auth/otp/send",
        None,
        Some(json!({ "identifier": identifier })),
    )
    .await?;
    let code = app
        .sender
        .last_code(identifier)
        .await
        .context("no code captured")?;
    let wrong = if code == "000000" { "111111" } else { "000000" };

    let (status, body) = app
        .call(
            "POST",
            "/api/v1/auth/otp/verify",
            None,
            Some(json!({ "identifier": identifier, "code": wrong })),
        )
        .await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["remainingAttempts"], 4);

    for _ in 0..4 {
        app.call(
            "POST",
            "/api/v1/auth/otp/verify",
            None,
            Some(json!({ "identifier": identifier, "code": wrong })),
        )
        .await?;
    }

    // The right code no longer helps once the attempts are spent.
    let (status, _) = app
        .call(
            "POST",
            "/api/v1/auth/otp/verify",
            None,
            Some(json!({ "identifier": identifier, "code": code })),
        )
        .await?;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);

    for _ in 0..2 {
        let (status, _) = app
            .call(
                "POST",
                "/api/v1/auth/otp/send",
                None,
                Some(json!({ "identifier": identifier })),
            )
            .await?;
        assert_eq!(status, StatusCode::OK);
    }
    let (status, _) = app
        .call(
            "POST",
            "/api/v1/auth/otp/send",
            None,
            Some(json!({ "identifier": identifier })),
        )
        .await?;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    Ok(())
}

#[tokio::test]
async fn otp_rejects_unclassifiable_identifiers() -> Result<()> {
    let app = TestApp::new()?;
    let (status, _) = app
        .call(
            "POST",
            "/api/v1/auth/otp/send",
            None,
            Some(json!({ "identifier": "not an address" })),
        )
        .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn validate_token_reports_live_sessions_only() -> Result<()> {
    let app = TestApp::new()?;
    let body = app.register("amal@example.com", "s3cure-pass").await?;
    let access = token(&body, "accessToken")?;

    let (status, valid) = app
        .call(
            "POST",
            "/internal/validate-token",
            None,
            Some(json!({ "token": access })),
        )
        .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(valid["valid"], true);
    assert_eq!(valid["userId"], body["user"]["id"]);

    app.call("POST", "/api/v1/auth/logout", Some(access), None).await?;

    let (status, invalid) = app
        .call(
            "POST",
            "/internal/validate-token",
            None,
            Some(json!({ "token": access })),
        )
        .await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(invalid, json!({ "valid": false }));
    Ok(())
}

#[tokio::test]
async fn internal_routes_require_the_service_key_when_set() -> Result<()> {
    let app = TestApp::with_config(|config| {
        config.with_internal_api_key(Some(SecretString::from("svc-key".to_string())))
    })?;
    let body = app.register("amal@example.com", "s3cure-pass").await?;
    let user_uri = format!(
        "/internal/users/{}",
        body["user"]["id"].as_str().context("missing user id")?
    );

    let (status, _) = app.call("GET", &user_uri, None, None).await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let request = Request::builder()
        .uri(&user_uri)
        .header("x-internal-api-key", "svc-key")
        .body(Body::empty())?;
    let response = app.router.clone().oneshot(request).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await?;
    let user: Value = serde_json::from_slice(&bytes)?;
    assert_eq!(user["email"], "amal@example.com");
    assert_eq!(user["hasPassword"], true);

    let request = Request::builder()
        .uri(format!("/internal/users/{}", Uuid::new_v4()))
        .header("x-internal-api-key", "svc-key")
        .body(Body::empty())?;
    let response = app.router.clone().oneshot(request).await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn unconfigured_providers_answer_not_implemented() -> Result<()> {
    let app = TestApp::new()?;

    let (status, _) = app
        .call("GET", "/api/v1/auth/oauth/google", None, None)
        .await?;
    assert_eq!(status, StatusCode::NOT_IMPLEMENTED);

    let (status, body) = app
        .call("POST", "/api/v1/auth/passkey/login/begin", None, None)
        .await?;
    assert_eq!(status, StatusCode::NOT_IMPLEMENTED);
    assert_eq!(body["error"], "Passkey authentication is not available");
    Ok(())
}

#[tokio::test]
async fn passkey_login_ceremonies_are_single_use() -> Result<()> {
    let app = TestApp::with_passkeys()?;
    let stranger = assertion_for(Uuid::new_v4());

    let unknown = format!("/api/v1/auth/passkey/login/finish?sessionKey={}", Uuid::new_v4());
    let (status, body) = app.call("POST", &unknown, None, Some(stranger.clone())).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Passkey session expired. Please try again.");

    let session_key = begin_passkey_login(&app).await?;
    let finish = format!("/api/v1/auth/passkey/login/finish?sessionKey={session_key}");
    let (status, body) = app.call("POST", &finish, None, Some(stranger.clone())).await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "Passkey authentication failed");

    let (status, body) = app.call("POST", &finish, None, Some(stranger)).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Passkey session expired. Please try again.");
    Ok(())
}

#[tokio::test]
async fn passkey_login_refuses_unknown_credentials() -> Result<()> {
    let app = TestApp::with_passkeys()?;
    let registered = app.register("amal@example.com", "s3cure-pass").await?;
    let user_id: Uuid = token(&registered["user"], "id")?.parse()?;

    // A row whose stored passkey no longer decodes never matches.
    app.passkeys
        .insert(NewPasskey {
            user_id,
            credential_id: b"cred-1".to_vec(),
            public_key: vec![0; 4],
            passkey: json!({ "cred": "unreadable" }),
            transports: json!([]),
            details: AuthenticatorDetails::default(),
        })
        .await?;

    let session_key = begin_passkey_login(&app).await?;
    let finish = format!("/api/v1/auth/passkey/login/finish?sessionKey={session_key}");
    let (status, body) = app
        .call("POST", &finish, None, Some(assertion_for(user_id)))
        .await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "Passkey authentication failed");
    assert!(body.get("accessToken").is_none());

    let records = app.passkeys.list_for_user(user_id).await?;
    assert_eq!(records[0].sign_count, 0);
    Ok(())
}

#[tokio::test]
async fn passkey_registration_consumes_its_ceremony() -> Result<()> {
    let app = TestApp::with_passkeys()?;
    let registered = app.register("amal@example.com", "s3cure-pass").await?;
    let access = token(&registered, "accessToken")?;
    let attestation = json!({
        "id": "Y3JlZC0x",
        "rawId": "Y3JlZC0x",
        "type": "public-key",
        "response": { "attestationObject": "AA", "clientDataJSON": "AA" },
        "extensions": {},
    });

    let (status, body) = app
        .call("POST", "/api/v1/auth/passkey/register/finish", Some(access), Some(attestation.clone()))
        .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Passkey session expired. Please try again.");

    let (status, challenge) = app
        .call("POST", "/api/v1/auth/passkey/register/begin", Some(access), None)
        .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(challenge["publicKey"]["user"]["name"], "amal@example.com");

    let (status, body) = app
        .call("POST", "/api/v1/auth/passkey/register/finish", Some(access), Some(attestation.clone()))
        .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Passkey registration failed");

    let (status, body) = app
        .call("POST", "/api/v1/auth/passkey/register/finish", Some(access), Some(attestation))
        .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Passkey session expired. Please try again.");
    assert!(app.passkeys.rows().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn responses_carry_a_request_id() -> Result<()> {
    let app = TestApp::new()?;
    let request = Request::builder().uri("/health").body(Body::empty())?;
    let response = app.router.clone().oneshot(request).await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));
    assert!(response.headers().contains_key("x-app"));
    Ok(())
}
