use anyhow::{Context, Result, anyhow};
use tracing::debug;
use url::Url;
use uuid::Uuid;
use webauthn_rs::prelude::*;

use super::{CEREMONY_TTL, CeremonyError, CeremonyStore, StoredPasskey};

#[derive(Clone, Debug)]
pub struct PasskeyConfig {
    rp_id: String,
    rp_name: String,
    origins: Vec<Url>,
}

impl PasskeyConfig {
    /// # Errors
    /// Returns error if the RP ID is empty or any origin is not a URL with a host.
    pub fn new(rp_id: String, rp_name: String, origins: &[String]) -> Result<Self> {
        if rp_id.trim().is_empty() {
            return Err(anyhow!("Passkey RP ID must not be empty"));
        }

        let mut normalized: Vec<Url> = Vec::new();
        for origin in origins.iter().map(|o| o.trim()).filter(|o| !o.is_empty()) {
            let url = normalize_origin(origin)?;
            if !normalized.contains(&url) {
                normalized.push(url);
            }
        }
        if normalized.is_empty() {
            return Err(anyhow!("Passkey allowed origins must not be empty"));
        }

        Ok(Self {
            rp_id,
            rp_name,
            origins: normalized,
        })
    }

    #[must_use]
    pub fn rp_id(&self) -> &str {
        &self.rp_id
    }

    #[must_use]
    pub fn rp_name(&self) -> &str {
        &self.rp_name
    }

    #[must_use]
    pub fn origins(&self) -> &[Url] {
        &self.origins
    }
}

fn normalize_origin(origin: &str) -> Result<Url> {
    let parsed = Url::parse(origin).with_context(|| format!("Invalid origin URL: {origin}"))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| anyhow!("Origin must include a host: {origin}"))?;
    let port = parsed
        .port()
        .map_or_else(String::new, |port| format!(":{port}"));
    Url::parse(&format!("{}://{}{}", parsed.scheme(), host, port))
        .with_context(|| format!("Invalid origin URL: {origin}"))
}

/// Challenge handed to the browser for a discoverable login.
pub struct PasskeyLogin {
    pub session_key: Uuid,
    pub challenge: RequestChallengeResponse,
}

/// A login ceremony taken out of the store, ready to be finished.
pub struct PendingLogin(DiscoverableAuthentication);

/// Credential that passed verification, with the counter it was checked against.
#[derive(Clone, Debug)]
pub struct VerifiedPasskey {
    pub passkey: StoredPasskey,
    pub previous_count: i64,
}

pub struct PasskeyService {
    config: PasskeyConfig,
    webauthn: Webauthn,
    registrations: CeremonyStore<PasskeyRegistration>,
    logins: CeremonyStore<DiscoverableAuthentication>,
}

impl PasskeyService {
    /// # Errors
    /// Returns error if `webauthn-rs` rejects the RP ID / origin combination.
    pub fn new(config: PasskeyConfig) -> Result<Self> {
        let (first, rest) = config
            .origins
            .split_first()
            .ok_or_else(|| anyhow!("Passkey allowed origins must not be empty"))?;

        let mut builder = WebauthnBuilder::new(config.rp_id(), first)
            .context("Invalid WebAuthn relying party")?
            .rp_name(config.rp_name());
        for origin in rest {
            builder = builder.append_allowed_origin(origin);
        }
        let webauthn = builder.build().context("Failed to build WebAuthn")?;

        Ok(Self {
            config,
            webauthn,
            registrations: CeremonyStore::new("passkey.registration", CEREMONY_TTL),
            logins: CeremonyStore::new("passkey.login", CEREMONY_TTL),
        })
    }

    #[must_use]
    pub fn config(&self) -> &PasskeyConfig {
        &self.config
    }

    /// Start registering a passkey for `user_id`, excluding `existing` credentials.
    ///
    /// # Errors
    /// [`CeremonyError::Setup`] if `webauthn-rs` cannot build the challenge.
    pub async fn register_begin(
        &self,
        user_id: Uuid,
        user_name: &str,
        display_name: &str,
        existing: &[StoredPasskey],
    ) -> Result<CreationChallengeResponse, CeremonyError> {
        let exclude: Vec<CredentialID> = existing
            .iter()
            .map(|stored| stored.passkey.cred_id().clone())
            .collect();
        let exclude = (!exclude.is_empty()).then_some(exclude);

        let (challenge, registration) = self
            .webauthn
            .start_passkey_registration(user_id, user_name, display_name, exclude)
            .map_err(CeremonyError::Setup)?;

        self.registrations.put(user_id, registration).await;
        Ok(challenge)
    }

    /// Finish the pending registration for `user_id`. The ceremony is consumed
    /// whether or not verification succeeds.
    ///
    /// # Errors
    /// [`CeremonyError::NoSessionFound`] or [`CeremonyError::RegistrationFailed`].
    pub async fn register_finish(
        &self,
        user_id: Uuid,
        response: &RegisterPublicKeyCredential,
    ) -> Result<Passkey, CeremonyError> {
        let registration = self
            .registrations
            .take(user_id)
            .await
            .ok_or(CeremonyError::NoSessionFound)?;

        self.webauthn
            .finish_passkey_registration(response, &registration)
            .map_err(|err| {
                debug!(%user_id, "passkey registration rejected: {err}");
                CeremonyError::RegistrationFailed
            })
    }

    /// Start a discoverable login; the user is not known yet.
    ///
    /// # Errors
    /// [`CeremonyError::Setup`] if `webauthn-rs` cannot build the challenge.
    pub async fn login_begin(&self) -> Result<PasskeyLogin, CeremonyError> {
        let (challenge, authentication) = self
            .webauthn
            .start_discoverable_authentication()
            .map_err(CeremonyError::Setup)?;

        let session_key = Uuid::new_v4();
        self.logins.put(session_key, authentication).await;
        Ok(PasskeyLogin {
            session_key,
            challenge,
        })
    }

    /// # Errors
    /// [`CeremonyError::NoSessionFound`] when the key is unknown, used or expired.
    pub async fn take_login(&self, session_key: Uuid) -> Result<PendingLogin, CeremonyError> {
        self.logins
            .take(session_key)
            .await
            .map(PendingLogin)
            .ok_or(CeremonyError::NoSessionFound)
    }

    /// User id carried in the assertion's user handle.
    ///
    /// # Errors
    /// [`CeremonyError::AuthenticationFailed`] if the assertion has no usable handle.
    pub fn identify(&self, response: &PublicKeyCredential) -> Result<Uuid, CeremonyError> {
        self.webauthn
            .identify_discoverable_authentication(response)
            .map(|(user_id, _cred_id)| user_id)
            .map_err(|_| CeremonyError::AuthenticationFailed)
    }

    /// Verify the assertion against the user's stored passkeys. Returns the
    /// matching credential with its counter and state advanced.
    ///
    /// # Errors
    /// [`CeremonyError::AuthenticationFailed`] for any verification failure,
    /// including a signature counter that did not advance.
    pub fn login_finish(
        &self,
        pending: PendingLogin,
        response: &PublicKeyCredential,
        stored: &[StoredPasskey],
    ) -> Result<VerifiedPasskey, CeremonyError> {
        let keys: Vec<DiscoverableKey> = stored
            .iter()
            .map(|stored| DiscoverableKey::from(&stored.passkey))
            .collect();

        let result = self
            .webauthn
            .finish_discoverable_authentication(response, pending.0, &keys)
            .map_err(|err| {
                debug!("passkey assertion rejected: {err}");
                CeremonyError::AuthenticationFailed
            })?;

        let mut matched = stored
            .iter()
            .find(|stored| stored.credential_id.as_slice() == result.cred_id().as_slice())
            .cloned()
            .ok_or(CeremonyError::AuthenticationFailed)?;

        if !counter_advanced(matched.sign_count, result.counter()) {
            debug!(
                stored = matched.sign_count,
                reported = result.counter(),
                "passkey counter did not advance"
            );
            return Err(CeremonyError::AuthenticationFailed);
        }

        let previous_count = matched.sign_count;
        matched.passkey.update_credential(&result);
        matched.sign_count = i64::from(result.counter());
        Ok(VerifiedPasskey {
            passkey: matched,
            previous_count,
        })
    }
}

/// Authenticators without a counter always report zero; otherwise the
/// reported value must be strictly greater than the stored one.
#[must_use]
pub fn counter_advanced(stored: i64, reported: u32) -> bool {
    let reported = i64::from(reported);
    (stored == 0 && reported == 0) || reported > stored
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Result<PasskeyConfig> {
        PasskeyConfig::new(
            "example.com".to_string(),
            "Example".to_string(),
            &["https://example.com".to_string()],
        )
    }

    fn dummy_register_credential() -> Result<RegisterPublicKeyCredential> {
        let credential = serde_json::from_value(serde_json::json!({
            "id": "dummy",
            "rawId": "AA",
            "type": "public-key",
            "response": {
                "attestationObject": "AA",
                "clientDataJSON": "AA"
            }
        }))?;
        Ok(credential)
    }

    #[test]
    fn origins_are_normalized_and_deduplicated() -> Result<()> {
        let config = PasskeyConfig::new(
            "example.com".to_string(),
            "Example".to_string(),
            &[
                "https://example.com/".to_string(),
                "https://example.com".to_string(),
                " https://app.example.com:8443/login ".to_string(),
            ],
        )?;
        let origins: Vec<&str> = config.origins().iter().map(Url::as_str).collect();
        assert_eq!(
            origins,
            vec!["https://example.com/", "https://app.example.com:8443/"]
        );
        Ok(())
    }

    #[test]
    fn empty_rp_id_or_origins_are_rejected() {
        assert!(PasskeyConfig::new(" ".to_string(), "x".to_string(), &["https://a.dev".to_string()]).is_err());
        assert!(PasskeyConfig::new("a.dev".to_string(), "x".to_string(), &[]).is_err());
        assert!(PasskeyConfig::new("a.dev".to_string(), "x".to_string(), &["not a url".to_string()]).is_err());
    }

    #[tokio::test]
    async fn registration_finish_consumes_the_ceremony() -> Result<()> {
        let service = PasskeyService::new(config()?)?;
        let user_id = Uuid::new_v4();
        service
            .register_begin(user_id, "amy@example.com", "Amy Pond", &[])
            .await?;

        let credential = dummy_register_credential()?;
        let first = service.register_finish(user_id, &credential).await;
        assert!(matches!(first, Err(CeremonyError::RegistrationFailed)));

        let second = service.register_finish(user_id, &credential).await;
        assert!(matches!(second, Err(CeremonyError::NoSessionFound)));
        Ok(())
    }

    #[tokio::test]
    async fn registration_is_keyed_by_user() -> Result<()> {
        let service = PasskeyService::new(config()?)?;
        service
            .register_begin(Uuid::new_v4(), "amy@example.com", "Amy Pond", &[])
            .await?;

        let other = service
            .register_finish(Uuid::new_v4(), &dummy_register_credential()?)
            .await;
        assert!(matches!(other, Err(CeremonyError::NoSessionFound)));
        Ok(())
    }

    #[tokio::test]
    async fn login_session_key_is_single_use() -> Result<()> {
        let service = PasskeyService::new(config()?)?;
        let login = service.login_begin().await?;

        assert!(service.take_login(login.session_key).await.is_ok());
        assert!(matches!(
            service.take_login(login.session_key).await,
            Err(CeremonyError::NoSessionFound)
        ));
        assert!(matches!(
            service.take_login(Uuid::new_v4()).await,
            Err(CeremonyError::NoSessionFound)
        ));
        Ok(())
    }

    #[test]
    fn counter_must_advance_unless_unsupported() {
        assert!(counter_advanced(0, 0));
        assert!(counter_advanced(0, 1));
        assert!(counter_advanced(41, 42));
        assert!(!counter_advanced(42, 42));
        assert!(!counter_advanced(42, 7));
        assert!(!counter_advanced(5, 0));
    }
}
