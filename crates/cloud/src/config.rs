//! Cloud service endpoints.

use serde::Deserialize;

/// Default API endpoint of the hosted generation service.
pub const DEFAULT_API_URL: &str = "https://api.interstice.cloud";
/// Default web frontend, used to build sign-in and account URLs.
pub const DEFAULT_WEB_URL: &str = "https://www.interstice.cloud";

/// Where the cloud engine connects.
#[derive(Debug, Clone, Deserialize)]
pub struct CloudConfig {
    /// REST API base URL (no trailing slash).
    pub api_url: String,
    /// Web frontend base URL, for user-facing links.
    pub web_url: String,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            web_url: DEFAULT_WEB_URL.to_string(),
        }
    }
}

impl CloudConfig {
    /// Read endpoints from `INTERSTICE_URL` / `INTERSTICE_WEB_URL`,
    /// falling back to the production defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            api_url: std::env::var("INTERSTICE_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(defaults.api_url),
            web_url: std::env::var("INTERSTICE_WEB_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(defaults.web_url),
        }
    }
}
