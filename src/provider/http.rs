//! reqwest-backed provider client
//!
//! Talks to a Square-style bookings API:
//!
//! - `GET /v2/bookings?start_at_min=..&start_at_max=..&cursor=..`
//! - `GET /v2/bookings/team-member-booking-profiles?cursor=..`
//!
//! HTTP failures are folded into [`ProviderError`] so the sweep can decide
//! what to retry: 401/403 are `Unauthorized`, 404 is `NotFound`, 429 is
//! `RateLimited`, a 2xx body of the wrong shape is `Decode`, and everything
//! else that went wrong (5xx, timeouts, connection resets) is `Transient`.
//! Booking listings are decoded entry by entry so one malformed booking is
//! reported on the page instead of failing it.

use std::time::Duration;

use async_trait::async_trait;
use chrono::SecondsFormat;
use reqwest::{header, Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::config::ProviderConfig;
use crate::error::{ConfigError, ProviderError};
use crate::provider::types::{BookingPage, BookingQuery, RejectedBooking, ResourceProfile};
use crate::provider::ProviderClient;

const BOOKINGS_PATH: &str = "v2/bookings";
const PROFILES_PATH: &str = "v2/bookings/team-member-booking-profiles";

/// Upper bound on profile pages, guards against a cursor that never ends
const MAX_PROFILE_PAGES: usize = 100;

#[derive(Debug, Deserialize)]
struct ListBookingsResponse {
    #[serde(default)]
    bookings: Vec<serde_json::Value>,
    #[serde(default)]
    cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListProfilesResponse {
    #[serde(default)]
    team_member_booking_profiles: Vec<ResourceProfile>,
    #[serde(default)]
    cursor: Option<String>,
}

/// Provider client over HTTPS
#[derive(Debug, Clone)]
pub struct HttpProviderClient {
    client: Client,
    base_url: Url,
    location_id: Option<String>,
    page_size: u32,
}

impl HttpProviderClient {
    /// Build a client; fails if no access token is configured
    pub fn new(config: &ProviderConfig) -> Result<Self, ConfigError> {
        let token = config
            .access_token
            .as_deref()
            .ok_or(ConfigError::MissingVar("SHOP_SYNC_PROVIDER_TOKEN"))?;

        let mut headers = header::HeaderMap::new();
        let mut auth = header::HeaderValue::from_str(&format!("Bearer {token}")).map_err(|e| {
            ConfigError::Invalid {
                name: "SHOP_SYNC_PROVIDER_TOKEN",
                message: e.to_string(),
            }
        })?;
        auth.set_sensitive(true);
        headers.insert(header::AUTHORIZATION, auth);
        headers.insert(
            header::ACCEPT,
            header::HeaderValue::from_static("application/json"),
        );

        let client = Client::builder()
            .default_headers(headers)
            .timeout(config.request_timeout)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ConfigError::Invalid {
                name: "provider client",
                message: e.to_string(),
            })?;

        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            location_id: config.location_id.clone(),
            page_size: config.page_size,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, ProviderError> {
        self.base_url
            .join(path)
            .map_err(|e| ProviderError::Transient(format!("invalid endpoint {path}: {e}")))
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, ProviderError> {
        let response = self.client.get(url.clone()).send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Transient(format!("request to {} timed out", url.path()))
            } else {
                ProviderError::Transient(e.to_string())
            }
        })?;

        let response = check_status(response).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ProviderError::Transient(format!("reading {}: {e}", url.path())))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| ProviderError::Decode(format!("{}: {e}", url.path())))
    }
}

async fn check_status(response: Response) -> Result<Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = response
        .headers()
        .get(header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    let path = response.url().path().to_string();
    let body = response.text().await.unwrap_or_default();

    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ProviderError::Unauthorized(format!("{status} from {path}"))
        }
        StatusCode::NOT_FOUND => ProviderError::NotFound(path),
        StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited { retry_after },
        _ => ProviderError::Transient(format!("{status} from {path}: {}", truncate(&body, 200))),
    })
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[async_trait]
impl ProviderClient for HttpProviderClient {
    #[instrument(skip(self), fields(team_member = ?query.team_member_id))]
    async fn list_bookings_in_window(
        &self,
        query: &BookingQuery,
        page_token: Option<&str>,
    ) -> Result<BookingPage, ProviderError> {
        let mut url = self.endpoint(BOOKINGS_PATH)?;
        {
            let mut params = url.query_pairs_mut();
            params.append_pair(
                "start_at_min",
                &query
                    .window
                    .start
                    .to_rfc3339_opts(SecondsFormat::Secs, true),
            );
            params.append_pair(
                "start_at_max",
                &query.window.end.to_rfc3339_opts(SecondsFormat::Secs, true),
            );
            params.append_pair("limit", &self.page_size.to_string());
            if let Some(location) = &self.location_id {
                params.append_pair("location_id", location);
            }
            if let Some(member) = &query.team_member_id {
                params.append_pair("team_member_id", member);
            }
            if let Some(cursor) = page_token {
                params.append_pair("cursor", cursor);
            }
        }

        let body: ListBookingsResponse = self.get_json(url).await?;
        let mut page = BookingPage {
            next_page_token: body.cursor.filter(|c| !c.is_empty()),
            ..BookingPage::default()
        };
        for raw in body.bookings {
            match RejectedBooking::decode(raw) {
                Ok(booking) => page.items.push(booking),
                Err(rejected) => {
                    warn!(id = ?rejected.id, error = %rejected.message, "Undecodable booking");
                    page.rejected.push(rejected);
                }
            }
        }
        debug!(
            items = page.items.len(),
            rejected = page.rejected.len(),
            has_more = page.next_page_token.is_some(),
            "Fetched bookings page"
        );

        Ok(page)
    }

    #[instrument(skip(self))]
    async fn list_resource_profiles(&self) -> Result<Vec<ResourceProfile>, ProviderError> {
        let mut profiles = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_PROFILE_PAGES {
            let mut url = self.endpoint(PROFILES_PATH)?;
            if let Some(c) = &cursor {
                url.query_pairs_mut().append_pair("cursor", c);
            }

            let body: ListProfilesResponse = self.get_json(url).await?;
            profiles.extend(body.team_member_booking_profiles);

            match body.cursor.filter(|c| !c.is_empty()) {
                Some(next) => cursor = Some(next),
                None => {
                    debug!(count = profiles.len(), "Fetched resource profiles");
                    return Ok(profiles);
                }
            }
        }

        Err(ProviderError::Transient(format!(
            "resource profile pagination exceeded {MAX_PROFILE_PAGES} pages"
        )))
    }
}
