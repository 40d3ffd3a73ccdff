use anyhow::{bail, Context, Result};
use reqwest::blocking::{Client as HttpClient, Response};
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::{Method, StatusCode};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::{CertPolicy, MispAuth};
use crate::misp::models::{
    merged_enable_payload, parse_feed_listing, EnableSummary, Feed, ProvisionReport,
};
use crate::misp::{csrf, CsrfTokens};

/// Per-request timeout so a wedged instance cannot hang the run
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// MISP rejects obvious non-browser clients on the form endpoints
const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/140.0.0.0 Safari/537.36";

const FEED_INDEX_ENDPOINTS: [&str; 4] = ["feeds/index", "feeds/index.json", "feeds", "feeds.json"];
const CACHE_ENDPOINTS: [&str; 2] = ["feeds/cacheFeeds/all", "feeds/cacheFeeds/all.json"];
const FETCH_ENDPOINTS: [&str; 2] = ["feeds/fetchFromAllFeeds", "feeds/fetchFromAllFeeds.json"];

/// A provisioning session against one MISP instance.
///
/// Wraps a cookie-persisting blocking HTTP client: form-based operations
/// (login, load_default_feeds) share the session cookies, REST operations
/// authenticate per request with an API key header.
pub struct MispClient {
    base_url: String,
    http: HttpClient,
}

impl MispClient {
    pub fn new(base_url: &str, policy: &CertPolicy) -> Result<Self> {
        let base_url = base_url.trim().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            bail!("MISP base URL is required");
        }

        let mut builder = HttpClient::builder()
            .cookie_store(true)
            .timeout(REQUEST_TIMEOUT)
            .default_headers(browser_headers());

        match policy {
            CertPolicy::Default => {}
            CertPolicy::Disabled => {
                warn!("TLS certificate verification is disabled");
                builder = builder.danger_accept_invalid_certs(true);
            }
            CertPolicy::Bundle(path) => {
                let pem = std::fs::read(path)
                    .with_context(|| format!("Failed to read CA bundle {:?}", path))?;
                let certs = reqwest::Certificate::from_pem_bundle(&pem)
                    .with_context(|| format!("Invalid CA bundle {:?}", path))?;
                for cert in certs {
                    builder = builder.add_root_certificate(cert);
                }
            }
        }

        let http = builder.build().context("Failed to create HTTP client")?;
        Ok(MispClient { base_url, http })
    }

    /// Authenticate through the web UI login form.
    ///
    /// Fetches the login page for CSRF tokens and cookies, posts the
    /// credentials, and verifies a logout link shows up afterwards (MISP
    /// redirects to the dashboard on success, so the home page is checked
    /// when the POST response is inconclusive).
    pub fn login(&self, auth: &MispAuth) -> Result<()> {
        let page = self.get("users/login")?;
        let status = page.status();
        if status.is_client_error() || status.is_server_error() {
            bail!("Failed to load login page: {}", status);
        }
        let body = page.text().context("Failed to read login page body")?;
        let tokens =
            csrf::extract_tokens(&body).context("Login page is missing CSRF token fields")?;

        let mut form = token_form(&tokens);
        form.push(("data[User][email]".to_string(), auth.username.clone()));
        form.push(("data[User][password]".to_string(), auth.password.clone()));

        let response = self.post_form("users/login", &form, "users/login")?;
        let status = response.status();
        let body = response.text().unwrap_or_default();
        if status.is_client_error() || status.is_server_error() {
            bail!(
                "Login failed with status {}: {}",
                status,
                snippet(&body)
            );
        }

        if !has_logout_link(&body) {
            // Inconclusive response body; confirm via the home page
            let home = self.get("")?;
            let home_status = home.status();
            let home_body = home.text().unwrap_or_default();
            if home_status.is_client_error()
                || home_status.is_server_error()
                || !has_logout_link(&home_body)
            {
                bail!("Authentication failed: no logged-in session after login POST");
            }
        }

        debug!("login succeeded");
        Ok(())
    }

    /// Populate the instance with the built-in default feed definitions.
    ///
    /// Requires a logged-in session. Tokens are page-scoped, so the Feeds
    /// index is fetched first to obtain a fresh set.
    pub fn load_default_feeds(&self) -> Result<()> {
        let page = self.get("Feeds")?;
        let status = page.status();
        if status.is_client_error() || status.is_server_error() {
            bail!("Failed to load Feeds page: {}", status);
        }
        let body = page.text().context("Failed to read Feeds page body")?;
        let tokens =
            csrf::extract_tokens(&body).context("Feeds page is missing CSRF token fields")?;

        let response = self.post_form("feeds/loadDefaultFeeds", &token_form(&tokens), "Feeds")?;
        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            bail!("loadDefaultFeeds failed: {}", status);
        }
        Ok(())
    }

    /// Fetch the feed listing via the REST API.
    ///
    /// MISP installations differ in which index route they expose, so a
    /// few variants are tried until one returns a parseable listing.
    pub fn list_feeds(&self, api_key: &str) -> Result<Vec<Feed>> {
        let mut last: Option<(StatusCode, String)> = None;
        for endpoint in FEED_INDEX_ENDPOINTS {
            let response = self.api_request(Method::GET, endpoint, api_key).send()?;
            let status = response.status();
            let body = response.text().unwrap_or_default();
            debug!(endpoint, %status, "feed index request");
            if status == StatusCode::OK {
                if let Some(feeds) = parse_feed_listing(&body) {
                    return Ok(feeds);
                }
            }
            last = Some((status, body));
        }
        let (status, body) = last.unwrap_or((StatusCode::default(), String::new()));
        bail!(
            "Failed to fetch feeds as JSON; last status {}, body: {}",
            status,
            snippet(&body)
        );
    }

    /// Enable a single feed and mark it for caching.
    ///
    /// MISP versions disagree on what the edit endpoint accepts, so a
    /// ladder of payload shapes is tried: minimal JSON, JSON with an
    /// explicit id, the full definition merged from `feeds/view`, then
    /// form-encoded with and without a `_method` override.
    pub fn enable_feed(&self, feed_id: &str, api_key: &str) -> Result<()> {
        let edit_json = format!("feeds/edit/{feed_id}.json");

        let minimal = json!({"enabled": true, "caching_enabled": true});
        if self.post_feed_json(&edit_json, api_key, &minimal)? {
            return Ok(());
        }

        let with_id = json!({"id": feed_id, "enabled": true, "caching_enabled": true});
        if self.post_feed_json(&edit_json, api_key, &with_id)? {
            return Ok(());
        }

        if let Some(detail) = self.feed_detail(feed_id, api_key) {
            if let Some(merged) = merged_enable_payload(detail, feed_id) {
                if self.post_feed_json(&edit_json, api_key, &merged)? {
                    return Ok(());
                }
            }
        }

        let edit_form = format!("feeds/edit/{feed_id}");
        let form = [("enabled", "1"), ("caching_enabled", "1")];
        let response = self
            .api_request(Method::POST, &edit_form, api_key)
            .form(&form)
            .send()?;
        debug!(feed_id, status = %response.status(), "feed edit form request");
        if response.status().is_success() {
            return Ok(());
        }

        let form_override = [("_method", "POST"), ("enabled", "1"), ("caching_enabled", "1")];
        let response = self
            .api_request(Method::POST, &edit_form, api_key)
            .form(&form_override)
            .send()?;
        let status = response.status();
        debug!(feed_id, %status, "feed edit form override request");
        if status.is_success() {
            return Ok(());
        }
        bail!("Enabling feed {} failed; last status {}", feed_id, status);
    }

    /// Enable every feed that is not yet operational.
    ///
    /// Per-feed failures are counted, never fatal; entries without an id
    /// are skipped. Requires the listing to be fetchable.
    pub fn enable_all_feeds(&self, api_key: &str) -> Result<EnableSummary> {
        let feeds = self.list_feeds(api_key)?;
        let mut summary = EnableSummary {
            total: feeds.len(),
            ..EnableSummary::default()
        };

        for feed in &feeds {
            let Some(feed_id) = feed.id.as_deref() else {
                continue;
            };
            if feed.is_operational() {
                summary.already_enabled += 1;
                continue;
            }
            summary.attempted += 1;
            match self.enable_feed(feed_id, api_key) {
                Ok(()) => summary.succeeded += 1,
                Err(error) => {
                    warn!(feed_id, error = %error, "failed to enable feed");
                    summary.failed += 1;
                }
            }
        }
        Ok(summary)
    }

    /// Trigger caching of all feeds.
    pub fn cache_all_feeds(&self, api_key: &str) -> Result<()> {
        self.bulk_action("cacheFeeds", &CACHE_ENDPOINTS, api_key)
    }

    /// Trigger fetching from all feeds.
    pub fn fetch_all_feeds(&self, api_key: &str) -> Result<()> {
        self.bulk_action("fetchFromAllFeeds", &FETCH_ENDPOINTS, api_key)
    }

    /// Run the full provisioning sequence in order: login, load default
    /// feeds, enable feeds, fetch, cache.
    ///
    /// A login failure aborts the run before any feed request is made.
    /// Later steps are independent of each other: a failure is recorded
    /// and the remaining steps still run.
    pub fn provision_all(&self, auth: &MispAuth, api_key: &str) -> ProvisionReport {
        let mut report = ProvisionReport::default();

        if let Err(error) = self.login(auth) {
            report.record("login", Err(error));
            return report;
        }
        report.record("login", Ok("authenticated".to_string()));

        report.record(
            "load-default-feeds",
            self.load_default_feeds().map(|()| "defaults loaded".to_string()),
        );

        match self.enable_all_feeds(api_key) {
            Ok(summary) if summary.failed == 0 => {
                report.record("configure-feeds", Ok(summary.to_string()));
            }
            Ok(summary) => {
                report.record("configure-feeds", Err(anyhow::anyhow!("{summary}")));
            }
            Err(error) => report.record("configure-feeds", Err(error)),
        }

        report.record(
            "fetch-all-feeds",
            self.fetch_all_feeds(api_key).map(|()| "triggered".to_string()),
        );
        report.record(
            "cache-feeds",
            self.cache_all_feeds(api_key).map(|()| "triggered".to_string()),
        );

        report
    }

    /// POST a bulk feed action, trying the endpoint variants plus the
    /// CakePHP `_method` override until one returns 2xx.
    fn bulk_action(&self, action: &str, endpoints: &[&str], api_key: &str) -> Result<()> {
        let mut last = StatusCode::default();
        for endpoint in endpoints {
            let response = self.api_request(Method::POST, endpoint, api_key).send()?;
            last = response.status();
            debug!(action, endpoint, status = %last, "bulk action request");
            if last.is_success() {
                return Ok(());
            }

            let response = self
                .api_request(Method::POST, endpoint, api_key)
                .form(&[("_method", "POST")])
                .send()?;
            last = response.status();
            debug!(action, endpoint, status = %last, "bulk action override request");
            if last.is_success() {
                return Ok(());
            }
        }
        bail!("{} failed; last status {}", action, last);
    }

    /// Fetch a single feed definition, if the instance exposes one of the
    /// view routes. Best effort: any failure yields `None`.
    fn feed_detail(&self, feed_id: &str, api_key: &str) -> Option<serde_json::Value> {
        for endpoint in [
            format!("feeds/view/{feed_id}.json"),
            format!("feeds/{feed_id}.json"),
        ] {
            let Ok(response) = self.api_request(Method::GET, &endpoint, api_key).send() else {
                continue;
            };
            if response.status() == StatusCode::OK {
                if let Ok(value) = response.json() {
                    return Some(value);
                }
            }
        }
        None
    }

    fn post_feed_json(
        &self,
        endpoint: &str,
        api_key: &str,
        payload: &serde_json::Value,
    ) -> Result<bool> {
        let response = self
            .api_request(Method::POST, endpoint, api_key)
            .json(payload)
            .send()?;
        debug!(endpoint, status = %response.status(), "feed edit request");
        Ok(response.status().is_success())
    }

    fn api_request(
        &self,
        method: Method,
        path: &str,
        api_key: &str,
    ) -> reqwest::blocking::RequestBuilder {
        self.http
            .request(method, self.url(path))
            .header(header::AUTHORIZATION, api_key)
            .header(header::ACCEPT, "application/json")
    }

    fn get(&self, path: &str) -> Result<Response> {
        let url = self.url(path);
        debug!(%url, "GET");
        self.http
            .get(&url)
            .send()
            .with_context(|| format!("GET {} failed", url))
    }

    fn post_form(
        &self,
        path: &str,
        form: &[(String, String)],
        referer: &str,
    ) -> Result<Response> {
        let url = self.url(path);
        debug!(%url, "POST");
        self.http
            .post(&url)
            .form(form)
            .header(header::ORIGIN, &self.base_url)
            .header(header::REFERER, format!("{}/{}", self.base_url, referer))
            .send()
            .with_context(|| format!("POST {} failed", url))
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

/// SecurityComponent form fields shared by every MISP form POST
fn token_form(tokens: &CsrfTokens) -> Vec<(String, String)> {
    vec![
        ("_method".to_string(), "POST".to_string()),
        ("data[_Token][key]".to_string(), tokens.key.clone()),
        ("data[_Token][fields]".to_string(), tokens.fields.clone()),
        ("data[_Token][unlocked]".to_string(), tokens.unlocked.clone()),
    ]
}

fn has_logout_link(body: &str) -> bool {
    let lower = body.to_lowercase();
    lower.contains("/users/logout") || lower.contains("logout")
}

/// Truncate a response body for error messages
fn snippet(body: &str) -> String {
    body.chars().take(300).collect()
}

fn browser_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(header::USER_AGENT, HeaderValue::from_static(BROWSER_USER_AGENT));
    headers.insert(
        header::ACCEPT,
        HeaderValue::from_static(
            "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,\
             image/apng,*/*;q=0.8,application/signed-exchange;v=b3;q=0.7",
        ),
    );
    headers.insert(
        header::ACCEPT_LANGUAGE,
        HeaderValue::from_static("en-US,en;q=0.9"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(
        "upgrade-insecure-requests",
        HeaderValue::from_static("1"),
    );
    headers
}
