use utoipa::{
    Modify, OpenApi,
    openapi::{
        Contact, InfoBuilder, License,
        security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
    },
};

use super::handlers::{admin, auth, health, internal};

#[derive(OpenApi)]
#[openapi(
    paths(
        health::health,
        health::ready,
        auth::login::check_user,
        auth::register::register,
        auth::login::login,
        auth::login::refresh,
        auth::login::logout,
        auth::login::me,
        auth::otp::send,
        auth::otp::verify,
        auth::oauth::start,
        auth::oauth::callback,
        auth::passkeys::login_begin,
        auth::passkeys::login_finish,
        auth::passkeys::register_begin,
        auth::passkeys::register_finish,
        admin::login,
        admin::signup,
        admin::refresh,
        admin::logout,
        admin::invite,
        admin::list,
        internal::validate_token,
        internal::user_by_id,
    ),
    modifiers(&BearerAuth),
    tags(
        (name = "auth", description = "Customer registration, password login and sessions"),
        (name = "otp", description = "One-time code sign-in"),
        (name = "oauth", description = "Google sign-in redirects"),
        (name = "passkeys", description = "WebAuthn registration and discoverable login"),
        (name = "admin", description = "Platform admin realm"),
        (name = "internal", description = "Service-to-service introspection"),
        (name = "health", description = "Liveness and readiness")
    )
)]
struct ApiDoc;

struct BearerAuth;

impl Modify for BearerAuth {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "bearer",
            SecurityScheme::Http(
                HttpBuilder::new()
                    .scheme(HttpAuthScheme::Bearer)
                    .bearer_format("JWT")
                    .build(),
            ),
        );
    }
}

#[must_use]
pub fn openapi() -> utoipa::openapi::OpenApi {
    let mut doc = ApiDoc::openapi();

    // Use Cargo.toml metadata instead of the utoipa crate info defaults.
    let mut info = InfoBuilder::new()
        .title(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .description(optional_str(env!("CARGO_PKG_DESCRIPTION")))
        .build();
    info.contact = cargo_contact();
    info.license = cargo_license();
    doc.info = info;

    doc
}

fn cargo_contact() -> Option<Contact> {
    // Cargo authors are `:` separated and may include "Name <email>".
    let authors = env!("CARGO_PKG_AUTHORS");
    let primary = authors.split(':').next().map(str::trim)?;
    if primary.is_empty() {
        return None;
    }

    let (name, email) = parse_author(primary);
    if name.is_none() && email.is_none() {
        return None;
    }

    let mut contact = Contact::new();
    contact.name = name.map(str::to_string);
    contact.email = email.map(str::to_string);
    Some(contact)
}

fn cargo_license() -> Option<License> {
    let identifier = optional_str(env!("CARGO_PKG_LICENSE"))?;
    let mut license = License::new(identifier);
    license.identifier = Some(identifier.to_string());
    Some(license)
}

fn optional_str(value: &'static str) -> Option<&'static str> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}

fn parse_author(author: &str) -> (Option<&str>, Option<&str>) {
    fn non_empty(value: &str) -> Option<&str> {
        let value = value.trim();
        (!value.is_empty()).then_some(value)
    }
    match author.find('<') {
        Some(start) => (
            non_empty(&author[..start]),
            non_empty(author[start + 1..].trim_end_matches('>')),
        ),
        None => (non_empty(author), None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openapi_info_from_cargo() {
        let doc = openapi();
        assert_eq!(doc.info.title, env!("CARGO_PKG_NAME"));
        assert_eq!(doc.info.version, env!("CARGO_PKG_VERSION"));
        assert_eq!(
            doc.info.contact.and_then(|contact| contact.name).as_deref(),
            Some("Berhot Platform Team")
        );
        assert_eq!(
            doc.info.license.map(|license| license.name).as_deref(),
            Some("BSD-3-Clause")
        );
    }

    #[test]
    fn openapi_documents_both_realms() {
        let doc = openapi();
        for path in [
            "/api/v1/auth/register",
            "/api/v1/auth/passkey/login/finish",
            "/api/v1/admin/auth/signup",
            "/internal/users/{id}",
            "/ready",
        ] {
            assert!(doc.paths.paths.contains_key(path), "missing {path}");
        }
        let schemes = doc
            .components
            .map(|components| components.security_schemes)
            .unwrap_or_default();
        assert!(schemes.contains_key("bearer"));
    }

    #[test]
    fn parse_author_splits_email() {
        assert_eq!(
            parse_author("Team <team@example.com>"),
            (Some("Team"), Some("team@example.com"))
        );
        assert_eq!(parse_author("Team"), (Some("Team"), None));
    }
}
