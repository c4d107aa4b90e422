use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use tracing::debug;

use crate::{Contact, Registration, Source};

/// Parses a WHOIS body into a [`Registration`].
///
/// WHOIS output is newline-delimited `Key: value` records; keys match
/// case-insensitively and the first colon splits key from value. Each field
/// is resolved through its synonym set in order, so `Registry Domain ID`
/// beats `Domain ID` beats `roid` when several are present.
pub fn parse_registration(body: &str, domain: &str) -> Registration {
    let mut registration = Registration {
        domain: domain.to_string(),
        source: Source::Whois,
        ..Default::default()
    };

    registration.registry_domain_id =
        first_value(body, &["registry domain id", "domain id", "roid"]).unwrap_or_default();

    registration.registrar.name =
        first_value(body, &["registrar", "sponsoring registrar"]).unwrap_or_default();
    registration.registrar.iana_id =
        first_value(body, &["registrar iana id"]).unwrap_or_default();
    registration.registrar.url = first_value(body, &["registrar url"]).unwrap_or_default();

    registration.created_at = first_value(body, &["creation date", "created on", "registered"])
        .and_then(|v| parse_time(&v));
    registration.updated_at =
        first_value(body, &["updated date", "last updated on"]).and_then(|v| parse_time(&v));
    registration.expires_at = first_value(
        body,
        &[
            "registry expiry date",
            "expiration date",
            "expiry date",
            "expires",
            "registrar registration expiration date",
        ],
    )
    .and_then(|v| parse_time(&v));

    registration.abuse.email = contact_value(body, &["registrar abuse contact email"]);
    registration.abuse.phone = contact_value(body, &["registrar abuse contact phone"]);

    registration.contacts.registrant = role_contact(body, "registrant");
    registration.contacts.admin = role_contact(body, "admin");
    registration.contacts.tech = role_contact(body, "tech");

    registration.dnssec.enabled = first_value(body, &["dnssec"]).map(|v| {
        let v = v.to_lowercase();
        !(v.contains("unsigned") || v == "no")
    });

    registration.statuses = statuses(body);

    registration
}

/// The `Registrar WHOIS Server` pointer, when the registry body carries one.
pub fn registrar_whois_server(body: &str) -> Option<String> {
    first_value(body, &["registrar whois server", "whois server"])
        .and_then(|v| v.split_whitespace().next().map(str::to_string))
}

fn role_contact(body: &str, role: &str) -> Option<Contact> {
    let contact = Contact {
        name: contact_value(body, &[&format!("{} organization", role)]),
        email: contact_value(body, &[&format!("{} email", role)]),
        phone: contact_value(body, &[&format!("{} phone", role)]),
    };
    (!contact.is_empty()).then_some(contact)
}

// Redacted values are elided entirely; registries spell the marker many ways
// ("REDACTED FOR PRIVACY", "Redacted | EU Registrar", ...).
fn contact_value(body: &str, keys: &[&str]) -> String {
    match first_value(body, keys) {
        Some(value) if !value.to_lowercase().contains("redacted") => value,
        _ => String::new(),
    }
}

/// First non-empty value for the first matching key in `keys`, in key order.
pub fn first_value(body: &str, keys: &[&str]) -> Option<String> {
    for key in keys {
        for line in body.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('%') || line.starts_with('#') {
                continue;
            }
            if let Some((k, v)) = line.split_once(':') {
                let v = v.trim();
                if k.trim().eq_ignore_ascii_case(key) && !v.is_empty() {
                    return Some(v.to_string());
                }
            }
        }
    }
    None
}

// Every `Domain Status:` / `Status:` line contributes its first token, in
// order, duplicates included.
fn statuses(body: &str) -> Vec<String> {
    let mut out = Vec::new();
    for line in body.lines() {
        if let Some((k, v)) = line.trim().split_once(':') {
            let key = k.trim();
            if key.eq_ignore_ascii_case("domain status") || key.eq_ignore_ascii_case("status") {
                if let Some(token) = v.trim().split_whitespace().next() {
                    out.push(token.to_string());
                }
            }
        }
    }
    out
}

/// Parses the time formats commonly seen in WHOIS output. Unparseable values
/// yield `None` and the field stays absent.
pub fn parse_time(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%z") {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S") {
        return Some(DateTime::from_naive_utc_and_offset(naive, Utc));
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        if let Some(naive) = date.and_hms_opt(0, 0, 0) {
            return Some(DateTime::from_naive_utc_and_offset(naive, Utc));
        }
    }

    debug!(value, "unparseable WHOIS time");
    None
}
