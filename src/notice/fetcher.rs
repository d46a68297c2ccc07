use std::time::Duration;

use reqwest::Client;

use crate::config::SiteConfig;
use crate::error::Result;
use crate::models::NewNotice;

use super::extract;

const USER_AGENT_STRING: &str =
    "Mozilla/5.0 (X11; Linux x86_64; rv:128.0) Gecko/20100101 Firefox/128.0";

/// Fetches listing pages and runs the extractor over them.
pub struct SiteFetcher {
    client: Client,
}

impl SiteFetcher {
    pub fn new(timeout_secs: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .connect_timeout(Duration::from_secs(10))
            .user_agent(USER_AGENT_STRING)
            .build()?;
        Ok(Self { client })
    }

    /// One site's candidates for this cycle. A non-success status is an
    /// error for this site only; callers degrade it to "no new facts".
    pub async fn fetch_site(&self, site: &SiteConfig) -> Result<Vec<NewNotice>> {
        let response = self.client.get(&site.url).send().await?;

        if !response.status().is_success() {
            return Err(anyhow::anyhow!(
                "listing page {} returned HTTP {}",
                site.url,
                response.status()
            )
            .into());
        }

        let html = response.text().await?;
        Ok(extract::extract(&html, site))
    }
}
