//! Identifier classification and tenant naming.

use rand::{Rng, distributions::Alphanumeric, rngs::OsRng};
use regex::Regex;
use std::sync::LazyLock;

static PHONE_RE: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"^\+?\d{8,15}$").ok());
static EMAIL_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").ok());

const SLUG_SUFFIX_LEN: usize = 8;
const FALLBACK_BUSINESS_NAME: &str = "My Business";

/// A login identifier after classification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Identifier {
    Email(String),
    Phone(String),
}

impl Identifier {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Email(value) | Self::Phone(value) => value,
        }
    }

    #[must_use]
    pub fn is_phone(&self) -> bool {
        matches!(self, Self::Phone(_))
    }
}

/// Strip the separators people type into phone numbers.
#[must_use]
pub fn clean_phone(raw: &str) -> String {
    raw.chars().filter(|c| *c != ' ' && *c != '-').collect()
}

#[must_use]
pub fn is_phone(raw: &str) -> bool {
    let cleaned = clean_phone(raw.trim());
    PHONE_RE.as_ref().is_some_and(|re| re.is_match(&cleaned))
}

#[must_use]
pub fn is_email(raw: &str) -> bool {
    EMAIL_RE.as_ref().is_some_and(|re| re.is_match(raw.trim()))
}

/// Phone if the digits fit `+?\d{8,15}`, otherwise email by shape.
/// Returns `None` for an empty or unrecognised identifier.
#[must_use]
pub fn classify(raw: &str) -> Option<Identifier> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if is_phone(trimmed) {
        return Some(Identifier::Phone(clean_phone(trimmed)));
    }
    is_email(trimmed).then(|| Identifier::Email(normalize_email(trimmed)))
}

#[must_use]
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// `"<first>'s Business"` when no business name was given, `"My Business"` without a first name.
#[must_use]
pub fn business_name(explicit: Option<&str>, first_name: &str) -> String {
    match explicit.map(str::trim).filter(|name| !name.is_empty()) {
        Some(name) => name.to_string(),
        None if !first_name.trim().is_empty() => format!("{}'s Business", first_name.trim()),
        None => FALLBACK_BUSINESS_NAME.to_string(),
    }
}

/// Lowercase, hyphen separated, ASCII alphanumerics only.
#[must_use]
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if (c.is_whitespace() || c == '-' || c == '_') && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let slug = slug.trim_matches('-');
    if slug.is_empty() {
        "business".to_string()
    } else {
        slug.to_string()
    }
}

/// Slug with a random suffix so two tenants with the same name never collide.
#[must_use]
pub fn unique_slug(name: &str) -> String {
    let suffix: String = OsRng
        .sample_iter(&Alphanumeric)
        .take(SLUG_SUFFIX_LEN)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect();
    format!("{}-{suffix}", slugify(name))
}
