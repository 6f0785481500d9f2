//! OpenMRS REST API connector.
//!
//! Pages `/ws/rest/v1/obs?v=full` by `startIndex` with basic auth. Each
//! result is parsed on its own, so one odd object becomes a malformed item
//! instead of failing the page.

use super::{parse_source_timestamp, FeedItem, ObservationSource, PageCursor, SourcePage};
use crate::config::SourceSettings;
use crate::error::{Error, Result};
use crate::model::{NameParts, ObservationValue, SourceObservation};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct SessionResponse {
    #[serde(default)]
    authenticated: bool,
}

#[derive(Debug, Deserialize)]
struct ObsPage {
    #[serde(default)]
    results: Vec<Value>,
    #[serde(default)]
    links: Vec<Link>,
}

#[derive(Debug, Deserialize)]
struct Link {
    rel: String,
}

#[derive(Debug, Default, Deserialize)]
struct Ref {
    uuid: Option<String>,
    display: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RestEncounter {
    uuid: Option<String>,
    location: Option<Ref>,
    #[serde(default)]
    encounter_providers: Vec<RestEncounterProvider>,
}

#[derive(Debug, Deserialize)]
struct RestEncounterProvider {
    provider: Option<Ref>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuditInfo {
    creator: Option<Ref>,
    date_created: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RestObs {
    uuid: String,
    person: Option<Ref>,
    concept: Option<Ref>,
    value: Option<Value>,
    comment: Option<String>,
    obs_datetime: Option<String>,
    encounter: Option<RestEncounter>,
    location: Option<Ref>,
    audit_info: Option<AuditInfo>,
    #[serde(default)]
    voided: bool,
}

/// Connector for the OpenMRS REST API.
pub struct RestSource {
    name: String,
    base_url: String,
    username: String,
    password: String,
    client: reqwest::Client,
    session_ok: bool,
}

impl RestSource {
    /// Create a connector.
    ///
    /// # Errors
    ///
    /// Returns `FatalConfig` if the HTTP client cannot be built.
    pub fn new(
        name: &str,
        base_url: &str,
        username: &str,
        password: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::FatalConfig(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            name: name.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            username: username.to_string(),
            password: password.to_string(),
            client,
            session_ok: false,
        })
    }

    /// Create a connector from source settings.
    ///
    /// # Errors
    ///
    /// Returns `FatalConfig` when username or password is missing.
    pub fn from_settings(settings: &SourceSettings, timeout: Duration) -> Result<Self> {
        let (Some(username), Some(password)) = (&settings.username, &settings.password) else {
            return Err(Error::FatalConfig(
                "OPENMRS_USERNAME and OPENMRS_PASSWORD are required for the REST source".into(),
            ));
        };
        Self::new(&settings.name, &settings.base_url, username, password, timeout)
    }

    fn url(&self, path: &str) -> String {
        format!("{}/ws/rest/v1/{path}", self.base_url)
    }

    async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<reqwest::Response> {
        let response = self
            .client
            .get(self.url(path))
            .basic_auth(&self.username, Some(&self.password))
            .header("Accept", "application/json")
            .query(query)
            .send()
            .await
            .map_err(|e| Error::source_unavailable(&self.name, format!("request failed: {e}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(Error::FatalConfig(format!(
                "OpenMRS rejected the credentials for '{}' ({status})",
                self.name
            )));
        }
        if !status.is_success() {
            return Err(Error::source_unavailable(
                &self.name,
                format!("{path} returned {status}"),
            ));
        }
        Ok(response)
    }
}

impl ObservationSource for RestSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn acquire(&mut self) -> Result<()> {
        let session: SessionResponse = self
            .get("session", &[])
            .await?
            .json()
            .await
            .map_err(|e| Error::source_unavailable(&self.name, format!("bad session response: {e}")))?;

        if !session.authenticated {
            return Err(Error::FatalConfig(format!(
                "OpenMRS session for '{}' is not authenticated",
                self.name
            )));
        }
        self.session_ok = true;
        Ok(())
    }

    async fn fetch_page(
        &mut self,
        since: DateTime<Utc>,
        after: Option<&PageCursor>,
        limit: u32,
    ) -> Result<SourcePage> {
        if !self.session_ok {
            return Err(Error::source_unavailable(&self.name, "fetch before acquire"));
        }

        let start = match after {
            Some(PageCursor::Offset(n)) => *n,
            Some(PageCursor::Keyset { .. }) | None => 0,
        };
        let query = [
            ("v", "full".to_string()),
            ("fromdate", since.format("%Y-%m-%dT%H:%M:%S%.3f%z").to_string()),
            ("limit", limit.to_string()),
            ("startIndex", start.to_string()),
        ];

        let page: ObsPage = self
            .get("obs", &query)
            .await?
            .json()
            .await
            .map_err(|e| Error::source_unavailable(&self.name, format!("bad obs page: {e}")))?;

        debug!(source = %self.name, start, results = page.results.len(), "Fetched REST page");
        Ok(build_page(page, start))
    }

    fn release(&mut self) {}

    fn close(&mut self) {
        self.session_ok = false;
    }
}

fn build_page(page: ObsPage, start: u32) -> SourcePage {
    let returned = page.results.len() as u32;
    let has_next = page.links.iter().any(|l| l.rel == "next");

    let mut keyed: Vec<(DateTime<Utc>, FeedItem)> = page
        .results
        .into_iter()
        .filter_map(parse_result)
        .map(|item| {
            let key = match &item {
                FeedItem::Observation(obs) => obs.captured_at,
                FeedItem::Malformed { .. } => DateTime::<Utc>::MIN_UTC,
            };
            (key, item)
        })
        .collect();
    keyed.sort_by(|(a_at, a), (b_at, b)| a_at.cmp(b_at).then_with(|| a.obs_id().cmp(b.obs_id())));

    SourcePage {
        items: keyed.into_iter().map(|(_, item)| item).collect(),
        next: (has_next && returned > 0).then(|| PageCursor::Offset(start + returned)),
    }
}

/// Map one REST result. Voided observations yield `None`.
fn parse_result(raw: Value) -> Option<FeedItem> {
    let fallback_id = raw
        .get("uuid")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();

    let obs: RestObs = match serde_json::from_value(raw) {
        Ok(obs) => obs,
        Err(e) => {
            return Some(FeedItem::Malformed {
                obs_id: fallback_id,
                reason: format!("unexpected shape: {e}"),
            });
        }
    };
    if obs.voided {
        return None;
    }
    Some(into_item(obs))
}

fn into_item(obs: RestObs) -> FeedItem {
    let malformed = |reason: &str| FeedItem::Malformed {
        obs_id: obs.uuid.clone(),
        reason: reason.to_string(),
    };

    let Some(concept_label) = obs
        .concept
        .as_ref()
        .and_then(|c| c.display.as_deref())
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
    else {
        return malformed("missing concept label");
    };

    let Some(person) = obs.person.as_ref().filter(|p| p.uuid.is_some()) else {
        return malformed("missing person");
    };

    let audit = obs.audit_info.as_ref();
    let Some(captured_at) = audit
        .and_then(|a| a.date_created.as_deref())
        .and_then(parse_source_timestamp)
    else {
        return malformed("unparsable dateCreated");
    };
    let recorded_at = match obs.obs_datetime.as_deref() {
        None => captured_at,
        Some(raw) => match parse_source_timestamp(raw) {
            Some(at) => at,
            None => return malformed("unparsable obsDatetime"),
        },
    };

    let encounter = obs.encounter.as_ref();
    let provider_name = encounter
        .and_then(|e| e.encounter_providers.iter().find_map(|ep| ep.provider.as_ref()))
        .and_then(|p| p.display.as_deref())
        .map(strip_identifier_prefix)
        .or_else(|| {
            audit
                .and_then(|a| a.creator.as_ref())
                .and_then(|c| c.display.as_deref())
                .map(str::to_string)
        });
    let location_name = encounter
        .and_then(|e| e.location.as_ref())
        .or(obs.location.as_ref())
        .and_then(|l| l.display.clone());

    FeedItem::Observation(SourceObservation {
        source_observation_id: obs.uuid.clone(),
        subject_external_id: person.uuid.clone().unwrap_or_default(),
        subject_name: person
            .display
            .as_deref()
            .map(|d| NameParts::from_display(&strip_identifier_prefix(d)))
            .unwrap_or_default(),
        subject_national_id: None,
        concept_label,
        value: obs.value.as_ref().and_then(parse_value),
        comments: obs.comment.clone(),
        recorded_at,
        captured_at,
        provider_name,
        location_name,
        encounter_ref: encounter.and_then(|e| e.uuid.clone()),
    })
}

/// Interpret the polymorphic `value` field.
fn parse_value(value: &Value) -> Option<ObservationValue> {
    match value {
        Value::String(s) => ObservationValue::from_columns(Some(s.clone()), None, None),
        Value::Number(n) => ObservationValue::from_columns(None, n.as_f64(), None),
        Value::Object(map) => {
            let display = map.get("display").and_then(Value::as_str).map(String::from);
            ObservationValue::from_columns(None, None, display)
        }
        _ => None,
    }
}

/// Drop an "ID - " prefix as OpenMRS prepends to patient and provider displays.
fn strip_identifier_prefix(display: &str) -> String {
    match display.split_once(" - ") {
        Some((_, rest)) => rest.trim().to_string(),
        None => display.trim().to_string(),
    }
}
