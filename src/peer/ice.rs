use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::EngineConfig;
use crate::error::CallError;
use crate::peer::types::{IceCandidateInit, IceServerSet};
use crate::signaling::{SignalMessage, SignalingAdapter};

/// Supplier of time-limited relay credentials.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn fetch(&self) -> Result<IceServerSet, CallError>;
}

/// `GET <endpoint>?apiKey=<key>` returning a JSON array of ICE servers.
pub struct HttpCredentialSource {
    client: reqwest::Client,
    endpoint: Url,
    api_key: Option<String>,
}

impl HttpCredentialSource {
    pub fn new(endpoint: Url, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
            api_key,
        }
    }

    fn request_url(&self) -> Url {
        let mut url = self.endpoint.clone();
        if let Some(key) = &self.api_key {
            url.query_pairs_mut().append_pair("apiKey", key);
        }
        url
    }
}

#[async_trait]
impl CredentialSource for HttpCredentialSource {
    async fn fetch(&self) -> Result<IceServerSet, CallError> {
        let response = self
            .client
            .get(self.request_url())
            .send()
            .await
            .map_err(|err| CallError::IceConfig(format!("request failed: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(CallError::IceConfig(format!("endpoint returned {status}")));
        }

        let servers: IceServerSet = response
            .json()
            .await
            .map_err(|err| CallError::IceConfig(format!("malformed body: {err}")))?;
        if servers.is_empty() {
            return Err(CallError::IceConfig("endpoint returned no servers".into()));
        }
        Ok(servers)
    }
}

/// Asks the relay via `requestTurnCredentials` and waits for `turnCredentials`.
pub struct SignalingCredentialSource {
    signaling: SignalingAdapter,
}

impl SignalingCredentialSource {
    pub fn new(signaling: SignalingAdapter) -> Self {
        Self { signaling }
    }
}

#[async_trait]
impl CredentialSource for SignalingCredentialSource {
    async fn fetch(&self) -> Result<IceServerSet, CallError> {
        // subscribe first so the reply cannot slip past
        let mut subscription = self.signaling.subscribe();
        self.signaling.request_turn_credentials().await?;
        while let Some(message) = subscription.recv().await {
            if let SignalMessage::TurnCredentials { servers } = message {
                return Ok(servers);
            }
        }
        Err(CallError::SignalingUnavailable(
            "signaling closed before credentials arrived".into(),
        ))
    }
}

/// Produces the server set for each connection attempt. Never fails: any
/// problem with the credential source degrades to a single STUN entry.
#[derive(Clone)]
pub struct IceResolver {
    source: Option<Arc<dyn CredentialSource>>,
    timeout: Duration,
    fallback: String,
}

impl IceResolver {
    pub fn new(
        source: Option<Arc<dyn CredentialSource>>,
        timeout: Duration,
        fallback: impl Into<String>,
    ) -> Self {
        Self {
            source,
            timeout,
            fallback: fallback.into(),
        }
    }

    /// `source` wins over the HTTP endpoint from `config`.
    pub fn from_config(config: &EngineConfig, source: Option<Arc<dyn CredentialSource>>) -> Self {
        let source = source.or_else(|| {
            config.turn_endpoint.clone().map(|endpoint| {
                Arc::new(HttpCredentialSource::new(endpoint, config.turn_api_key.clone()))
                    as Arc<dyn CredentialSource>
            })
        });
        Self::new(source, config.ice_fetch_timeout, config.stun_fallback.clone())
    }

    pub fn fallback(&self) -> IceServerSet {
        IceServerSet::stun_only(self.fallback.clone())
    }

    /// Fresh every call; credentials are time-boxed and never cached.
    pub async fn resolve(&self) -> IceServerSet {
        let Some(source) = &self.source else {
            debug!("no credential source configured, using STUN only");
            return self.fallback();
        };

        match tokio::time::timeout(self.timeout, source.fetch()).await {
            Ok(Ok(servers)) => {
                info!(
                    servers = servers.servers().len(),
                    relay = servers.has_relay(),
                    "ice servers resolved"
                );
                servers
            }
            Ok(Err(err)) => {
                warn!(error = %err, fallback = %self.fallback, "turn credentials unavailable, falling back to STUN");
                self.fallback()
            }
            Err(_) => {
                warn!(timeout = ?self.timeout, fallback = %self.fallback, "turn credential fetch timed out, falling back to STUN");
                self.fallback()
            }
        }
    }
}

/// Remote candidates that cannot be applied yet, in arrival order.
#[derive(Debug, Default)]
pub struct PendingCandidates {
    queue: VecDeque<IceCandidateInit>,
}

impl PendingCandidates {
    pub fn push(&mut self, candidate: IceCandidateInit) {
        self.queue.push_back(candidate);
    }

    pub fn drain(&mut self) -> Vec<IceCandidateInit> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}
