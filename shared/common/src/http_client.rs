use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Clone)]
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    pub fn new() -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to create HTTP client");

        Self { client }
    }

    pub async fn get<T>(&self, url: &str) -> Result<T, reqwest::Error>
    where
        T: for<'de> Deserialize<'de>,
    {
        self.client
            .get(url)
            .send()
            .await?
            .json::<T>()
            .await
    }

    pub async fn post<T, U>(&self, url: &str, body: &T) -> Result<U, reqwest::Error>
    where
        T: Serialize,
        U: for<'de> Deserialize<'de>,
    {
        self.client
            .post(url)
            .json(body)
            .send()
            .await?
            .json::<U>()
            .await
    }

    /// POST with a per-request deadline tighter than the client default.
    /// Delegated calls inside a budgeted loop must never outlive the budget.
    pub async fn post_with_timeout<T, U>(
        &self,
        url: &str,
        body: &T,
        timeout: Duration,
    ) -> Result<U, reqwest::Error>
    where
        T: Serialize,
        U: for<'de> Deserialize<'de>,
    {
        self.client
            .post(url)
            .timeout(timeout)
            .json(body)
            .send()
            .await?
            .error_for_status()?
            .json::<U>()
            .await
    }
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}
