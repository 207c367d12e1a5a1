//! Resy platform adapter
//!
//! Talks to the Resy widget API: venue search, slot discovery, slot details,
//! booking and Notify subscriptions. Credentials live inside the adapter
//! behind a lock; a 401 on slot discovery triggers one in-adapter refresh via
//! the password login endpoint, and the attempt is still reported as
//! `AuthExpired` so the caller's cadence is not disturbed.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{BookResult, Platform, PlatformKind};
use crate::AgentResult;

const BASE_URL: &str = "https://api.resy.com";

// Slot search is geo-anchored; the widget API wants a location even for
// venue-scoped queries.
const GEO_LAT: f64 = 40.7128;
const GEO_LONG: f64 = -74.0060;

/// Resy account credentials
#[derive(Debug, Clone, Default)]
pub struct ResyCredentials {
    /// Widget API key
    pub api_key: String,
    /// Session auth token
    pub auth_token: String,
    /// Payment method id required by some venues
    pub payment_method_id: String,
    /// Account email, used for token refresh
    pub email: String,
    /// Account password, used for token refresh
    pub password: String,
}

/// A venue returned by name search
#[derive(Debug, Clone, serde::Serialize)]
pub struct VenueHit {
    /// Platform venue id
    pub venue_id: String,
    /// Display name
    pub name: String,
    /// Neighborhood, when the platform provides one
    pub neighborhood: String,
    /// Metro region
    pub region: String,
    /// URL slug
    pub url_slug: String,
}

/// An open reservation slot
#[derive(Debug, Clone)]
struct Slot {
    config_id: String,
    time: String,
}

/// The Resy adapter
pub struct ResyPlatform {
    client: reqwest::Client,
    credentials: RwLock<ResyCredentials>,
    base_url: String,
}

impl ResyPlatform {
    /// Create a new adapter holding the given credentials.
    pub fn new(credentials: ResyCredentials) -> AgentResult<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| crate::AgentError::Platform(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            credentials: RwLock::new(credentials),
            base_url: BASE_URL.to_string(),
        })
    }

    async fn auth_headers(&self) -> Vec<(&'static str, String)> {
        let creds = self.credentials.read().await;
        vec![
            (
                "authorization",
                format!("ResyAPI api_key=\"{}\"", creds.api_key),
            ),
            ("x-resy-auth-token", creds.auth_token.clone()),
            ("x-resy-universal-auth", creds.auth_token.clone()),
            ("origin", "https://widgets.resy.com".to_string()),
            ("referer", "https://widgets.resy.com/".to_string()),
            ("accept", "application/json".to_string()),
        ]
    }

    fn apply_headers(
        mut req: reqwest::RequestBuilder,
        headers: &[(&'static str, String)],
    ) -> reqwest::RequestBuilder {
        for (name, value) in headers {
            req = req.header(*name, value);
        }
        req
    }

    /// Search venues by name. Used for autocomplete and venue resolution.
    pub async fn search_venues(&self, query: &str) -> AgentResult<Vec<VenueHit>> {
        let payload = json!({
            "query": query,
            "geo": { "latitude": GEO_LAT, "longitude": GEO_LONG },
            "types": ["venue"],
            "per_page": 5,
        });

        let headers = self.auth_headers().await;
        let resp = Self::apply_headers(
            self.client
                .post(format!("{}/3/venuesearch/search", self.base_url))
                .timeout(Duration::from_secs(10)),
            &headers,
        )
        .json(&payload)
        .send()
        .await;

        let resp = match resp {
            Ok(resp) => resp,
            Err(e) => {
                warn!("Resy venue search transport error: {}", e);
                return Ok(Vec::new());
            }
        };

        if !resp.status().is_success() {
            warn!("Resy venue search failed: {}", resp.status());
            return Ok(Vec::new());
        }

        let data: Value = match resp.json().await {
            Ok(data) => data,
            Err(e) => {
                warn!("Resy venue search returned malformed JSON: {}", e);
                return Ok(Vec::new());
            }
        };

        let hits = data["search"]["hits"].as_array().cloned().unwrap_or_default();
        let results = hits
            .iter()
            .map(|hit| {
                // The id field is either a plain number or {"resy": <id>}.
                let venue_id = match &hit["id"] {
                    Value::Object(map) => map
                        .get("resy")
                        .map(|v| strip_quotes(&v.to_string()))
                        .unwrap_or_default(),
                    other => strip_quotes(&other.to_string()),
                };
                VenueHit {
                    venue_id,
                    name: hit["name"].as_str().unwrap_or_default().to_string(),
                    neighborhood: hit["neighborhood"].as_str().unwrap_or_default().to_string(),
                    region: hit["location"]["name"].as_str().unwrap_or_default().to_string(),
                    url_slug: hit["url_slug"].as_str().unwrap_or_default().to_string(),
                }
            })
            .collect();
        Ok(results)
    }

    /// Find open slots for a venue/date/party. The error side carries the
    /// terminal `BookResult` (auth expiry, transport failure) so callers can
    /// short-circuit the attempt.
    async fn find_available_slots(
        &self,
        venue_id: &str,
        date: &str,
        party_size: u32,
    ) -> Result<Vec<Slot>, BookResult> {
        let headers = self.auth_headers().await;
        let resp = Self::apply_headers(
            self.client
                .get(format!("{}/4/find", self.base_url))
                .timeout(Duration::from_secs(15)),
            &headers,
        )
        .query(&[
            ("lat", GEO_LAT.to_string()),
            ("long", GEO_LONG.to_string()),
            ("day", date.to_string()),
            ("party_size", party_size.to_string()),
            ("venue_id", venue_id.to_string()),
        ])
        .send()
        .await
        .map_err(|e| BookResult::TransportError(format!("find: {e}")))?;

        if resp.status() == reqwest::StatusCode::UNAUTHORIZED {
            warn!("Resy auth token expired during slot search");
            return Err(BookResult::AuthExpired);
        }
        if !resp.status().is_success() {
            warn!("Resy find returned {}", resp.status());
            return Ok(Vec::new());
        }

        let data: Value = resp
            .json()
            .await
            .map_err(|e| BookResult::TransportError(format!("find body: {e}")))?;

        let venues = data["results"]["venues"].as_array().cloned().unwrap_or_default();
        let mut slots = Vec::new();
        for venue in &venues {
            for slot_group in venue["slots"].as_array().cloned().unwrap_or_default() {
                let config_id = match slot_group["config"]["id"].as_str() {
                    Some(id) => id.to_string(),
                    None => match slot_group["config"]["id"].as_i64() {
                        Some(id) => id.to_string(),
                        None => continue,
                    },
                };
                slots.push(Slot {
                    config_id,
                    time: slot_group["date"]["start"].as_str().unwrap_or_default().to_string(),
                });
            }
        }
        Ok(slots)
    }

    /// Fetch the book token for a slot; required before booking.
    async fn get_slot_details(
        &self,
        config_id: &str,
        date: &str,
        party_size: u32,
    ) -> Result<Option<String>, BookResult> {
        let headers = self.auth_headers().await;
        let resp = Self::apply_headers(
            self.client
                .get(format!("{}/3/details", self.base_url))
                .timeout(Duration::from_secs(15)),
            &headers,
        )
        .query(&[
            ("config_id", config_id.to_string()),
            ("day", date.to_string()),
            ("party_size", party_size.to_string()),
        ])
        .send()
        .await
        .map_err(|e| BookResult::TransportError(format!("details: {e}")))?;

        if !resp.status().is_success() {
            warn!("Resy details returned {}", resp.status());
            return Ok(None);
        }

        let data: Value = resp
            .json()
            .await
            .map_err(|e| BookResult::TransportError(format!("details body: {e}")))?;
        Ok(data["book_token"]["value"].as_str().map(str::to_string))
    }

    /// Book a slot with its book token. The POST either lands or it does
    /// not; a transport failure after send is ambiguous and is surfaced as
    /// such.
    async fn book_slot(&self, book_token: &str) -> Result<BookResult, BookResult> {
        let payment = {
            let creds = self.credentials.read().await;
            if creds.payment_method_id.is_empty() {
                String::new()
            } else {
                json!({ "id": creds.payment_method_id.parse::<i64>().unwrap_or_default() })
                    .to_string()
            }
        };

        let headers = self.auth_headers().await;
        let form = [
            ("book_token", book_token.to_string()),
            ("struct_payment_method", payment),
            ("source_id", "resy.com-venue-details".to_string()),
        ];
        let resp = Self::apply_headers(
            self.client
                .post(format!("{}/3/book", self.base_url))
                .timeout(Duration::from_secs(20)),
            &headers,
        )
        .form(&form)
        .send()
        .await
        .map_err(|e| BookResult::TransportError(format!("book: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            warn!("Resy booking failed: {} {}", status, truncate(&body, 200));
            return Ok(BookResult::NoAvailability);
        }

        let data: Value = resp
            .json()
            .await
            .map_err(|e| BookResult::TransportError(format!("book body: {e}")))?;
        let confirmation_id = data["resy_token"]
            .as_str()
            .or_else(|| data["reservation_id"].as_str())
            .map(str::to_string)
            .or_else(|| data["reservation_id"].as_i64().map(|v| v.to_string()));

        Ok(BookResult::Booked {
            confirmation_id,
            booked_time: None,
            raw: Some(data.to_string()),
        })
    }

    /// Refresh the auth token with email/password login. Updates the
    /// adapter-held credentials on success.
    pub async fn refresh_auth(&self) -> AgentResult<bool> {
        let (email, password, api_key) = {
            let creds = self.credentials.read().await;
            (
                creds.email.clone(),
                creds.password.clone(),
                creds.api_key.clone(),
            )
        };
        if email.is_empty() || password.is_empty() {
            debug!("Resy auth refresh skipped: no login credentials configured");
            return Ok(false);
        }

        let resp = self
            .client
            .post(format!("{}/3/auth/password", self.base_url))
            .timeout(Duration::from_secs(15))
            .header("authorization", format!("ResyAPI api_key=\"{api_key}\""))
            .header("accept", "application/json")
            .form(&[("email", email), ("password", password)])
            .send()
            .await;

        let resp = match resp {
            Ok(resp) if resp.status().is_success() => resp,
            Ok(resp) => {
                warn!("Resy auth refresh failed: {}", resp.status());
                return Ok(false);
            }
            Err(e) => {
                warn!("Resy auth refresh transport error: {}", e);
                return Ok(false);
            }
        };

        let data: Value = match resp.json().await {
            Ok(data) => data,
            Err(e) => {
                warn!("Resy auth refresh returned malformed JSON: {}", e);
                return Ok(false);
            }
        };

        if let Some(token) = data["token"].as_str() {
            let mut creds = self.credentials.write().await;
            creds.auth_token = token.to_string();
            if let Some(pm) = data["payment_method_id"].as_i64() {
                creds.payment_method_id = pm.to_string();
            }
            info!("Resy auth token refreshed");
            return Ok(true);
        }
        Ok(false)
    }
}

#[async_trait]
impl Platform for ResyPlatform {
    fn kind(&self) -> PlatformKind {
        PlatformKind::Resy
    }

    async fn resolve_venue(&self, restaurant_name: &str) -> AgentResult<Option<String>> {
        let hits = self.search_venues(restaurant_name).await?;
        Ok(hits
            .into_iter()
            .map(|hit| hit.venue_id)
            .find(|id| !id.is_empty()))
    }

    async fn try_book(
        &self,
        venue_id: &str,
        date: &str,
        time_preferred: &str,
        party_size: u32,
    ) -> AgentResult<BookResult> {
        let slots = match self.find_available_slots(venue_id, date, party_size).await {
            Ok(slots) => slots,
            Err(BookResult::AuthExpired) => {
                // Refresh for the next attempt; this one still counts as stale.
                let _ = self.refresh_auth().await;
                return Ok(BookResult::AuthExpired);
            }
            Err(other) => return Ok(other),
        };

        if slots.is_empty() {
            return Ok(BookResult::NoAvailability);
        }

        let best = match pick_best_slot(&slots, time_preferred) {
            Some(best) => best,
            None => return Ok(BookResult::NoAvailability),
        };
        let booked_time = normalize_slot_time(&best.time);

        let book_token = match self.get_slot_details(&best.config_id, date, party_size).await {
            Ok(Some(token)) => token,
            Ok(None) => return Ok(BookResult::NoAvailability),
            Err(other) => return Ok(other),
        };

        match self.book_slot(&book_token).await {
            Ok(BookResult::Booked {
                confirmation_id,
                raw,
                ..
            }) => Ok(BookResult::Booked {
                confirmation_id,
                booked_time,
                raw,
            }),
            Ok(other) => Ok(other),
            Err(other) => Ok(other),
        }
    }

    async fn subscribe_notify(
        &self,
        venue_id: &str,
        date: &str,
        time_preferred: &str,
        party_size: u32,
    ) -> AgentResult<bool> {
        let headers = self.auth_headers().await;
        let form = [
            ("venue_id", venue_id.to_string()),
            ("day", date.to_string()),
            ("time_preferred", time_preferred.to_string()),
            ("party_size", party_size.to_string()),
            // dinner service
            ("service_type_id", "2".to_string()),
        ];
        let resp = Self::apply_headers(
            self.client
                .post(format!("{}/3/notify", self.base_url))
                .timeout(Duration::from_secs(15)),
            &headers,
        )
        .form(&form)
        .send()
        .await;

        match resp {
            Ok(resp) if resp.status().is_success() => {
                info!("Resy Notify subscribed: venue={} date={}", venue_id, date);
                Ok(true)
            }
            Ok(resp) => {
                warn!("Resy Notify subscription failed: {}", resp.status());
                Ok(false)
            }
            Err(e) => {
                warn!("Resy Notify subscription transport error: {}", e);
                Ok(false)
            }
        }
    }
}

/// Pick the slot closest to the preferred time by absolute minute
/// difference; ties go to the earlier slot.
fn pick_best_slot<'a>(slots: &'a [Slot], time_preferred: &str) -> Option<&'a Slot> {
    let preferred = parse_minutes(time_preferred)?;
    slots.iter().min_by_key(|slot| {
        match normalize_slot_time(&slot.time).and_then(|t| parse_minutes(&t)) {
            Some(minutes) => (minutes.abs_diff(preferred), minutes),
            // unparseable slot times sort last
            None => (u32::MAX, u32::MAX),
        }
    })
}

/// Slot times arrive as either "2025-06-01 19:30:00" or "19:30"; reduce to
/// HH:MM.
fn normalize_slot_time(raw: &str) -> Option<String> {
    if raw.is_empty() {
        return None;
    }
    let time_part = match raw.rsplit_once(' ') {
        Some((_, time)) => time,
        None => raw,
    };
    if time_part.len() < 5 {
        return None;
    }
    Some(time_part[..5].to_string())
}

fn parse_minutes(hhmm: &str) -> Option<u32> {
    let (h, m) = hhmm.split_once(':')?;
    let h: u32 = h.parse().ok()?;
    let m: u32 = m.get(..2)?.parse().ok()?;
    if h > 23 || m > 59 {
        return None;
    }
    Some(h * 60 + m)
}

fn strip_quotes(s: &str) -> String {
    s.trim_matches('"').to_string()
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(config_id: &str, time: &str) -> Slot {
        Slot {
            config_id: config_id.to_string(),
            time: time.to_string(),
        }
    }

    #[test]
    fn picks_closest_slot_by_minutes() {
        let slots = vec![
            slot("a", "17:30"),
            slot("b", "19:15"),
            slot("c", "21:00"),
        ];
        let best = pick_best_slot(&slots, "19:00").unwrap();
        assert_eq!(best.config_id, "b");
    }

    #[test]
    fn tie_breaks_toward_earlier_slot() {
        // 18:30 and 19:30 are both 30 minutes from 19:00
        let slots = vec![slot("later", "19:30"), slot("earlier", "18:30")];
        let best = pick_best_slot(&slots, "19:00").unwrap();
        assert_eq!(best.config_id, "earlier");
    }

    #[test]
    fn handles_datetime_slot_format() {
        let slots = vec![
            slot("a", "2025-06-01 17:00:00"),
            slot("b", "2025-06-01 19:30:00"),
        ];
        let best = pick_best_slot(&slots, "19:00").unwrap();
        assert_eq!(best.config_id, "b");
        assert_eq!(normalize_slot_time(&best.time).as_deref(), Some("19:30"));
    }

    #[test]
    fn unparseable_times_sort_last() {
        let slots = vec![slot("junk", "soon"), slot("ok", "20:00")];
        let best = pick_best_slot(&slots, "19:00").unwrap();
        assert_eq!(best.config_id, "ok");
    }

    #[test]
    fn parse_minutes_bounds() {
        assert_eq!(parse_minutes("19:00"), Some(19 * 60));
        assert_eq!(parse_minutes("00:05"), Some(5));
        assert_eq!(parse_minutes("24:00"), None);
        assert_eq!(parse_minutes("19"), None);
        assert_eq!(parse_minutes(""), None);
    }
}
