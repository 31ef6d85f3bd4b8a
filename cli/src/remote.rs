use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use haunts_core::models::EntityKind;
use haunts_core::sync::{Connectivity, RemoteApi, SessionProvider};

const HEALTH_TIMEOUT: Duration = Duration::from_secs(3);

/// The haunts web API, reached over HTTP with a bearer token.
pub struct HttpRemote {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

#[derive(Deserialize)]
struct Created {
    id: Value,
}

impl HttpRemote {
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(format!(
                "haunts-cli/{} (place tracker)",
                env!("CARGO_PKG_VERSION")
            ))
            .timeout(Duration::from_secs(15))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn url(&self, kind: EntityKind) -> Result<String> {
        Ok(format!("{}/api/{}", self.base_url, resource(kind)?))
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }
}

/// Path segment the remote serves each kind under.
fn resource(kind: EntityKind) -> Result<&'static str> {
    Ok(match kind {
        EntityKind::Author => "authors",
        EntityKind::Place => "places",
        EntityKind::List => "lists",
        EntityKind::Visit => "visits",
        EntityKind::Dish => "dishes",
        EntityKind::Category => "categories",
        EntityKind::Tag => "tags",
        EntityKind::ListItem | EntityKind::PlaceTag => {
            bail!("{kind} records have no remote resource")
        }
    })
}

#[async_trait]
impl RemoteApi for HttpRemote {
    async fn create(&self, kind: EntityKind, payload: &Value) -> Result<String> {
        let url = self.url(kind)?;
        let resp = self
            .authorize(self.client.post(&url))
            .json(payload)
            .send()
            .await
            .with_context(|| format!("Failed to reach {url}"))?
            .error_for_status()
            .with_context(|| format!("Remote rejected new {kind}"))?;

        let created: Created = resp
            .json()
            .await
            .with_context(|| format!("Failed to parse create response for {kind}"))?;

        match created.id {
            Value::String(id) if !id.is_empty() => Ok(id),
            Value::Number(n) => Ok(n.to_string()),
            other => bail!("Remote returned an unusable id for {kind}: {other}"),
        }
    }

    async fn update(&self, kind: EntityKind, external_id: &str, payload: &Value) -> Result<()> {
        let url = format!("{}/{external_id}", self.url(kind)?);
        self.authorize(self.client.put(&url))
            .json(payload)
            .send()
            .await
            .with_context(|| format!("Failed to reach {url}"))?
            .error_for_status()
            .with_context(|| format!("Remote rejected update of {kind} {external_id}"))?;
        Ok(())
    }
}

impl SessionProvider for HttpRemote {
    fn is_authenticated(&self) -> bool {
        self.token.as_deref().is_some_and(|t| !t.is_empty())
    }
}

#[async_trait]
impl Connectivity for HttpRemote {
    async fn is_online(&self) -> bool {
        let url = format!("{}/api/health", self.base_url);
        match self.client.get(&url).timeout(HEALTH_TIMEOUT).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                tracing::debug!(%url, error = %e, "health probe failed");
                false
            }
        }
    }
}
