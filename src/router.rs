//! Model routing.
//!
//! [`ModelRouter::route`] maps a [`ModelSpec`] to a [`ProviderBinding`]. It
//! never fails: whenever the secondary gateway cannot serve a request the
//! binding falls back to the primary gateway, which has no credential
//! precondition, and the [`BindingReason`] records why.
//!
//! Routing order:
//!
//! 1. A model name containing one of the primary markers (case-insensitive)
//!    binds to the primary gateway directly.
//! 2. Otherwise the secondary gateway is tried: unavailable at startup,
//!    missing credential, and client construction failure each fall back
//!    to the primary gateway with their own reason.
//!
//! Bindings are computed fresh for every call. Credentials are read through
//! a [`CredentialSource`] on each call, so a key that appears mid-session
//! takes effect on the next turn.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::ProviderError;
use crate::provider::{GatewayClient, Provider, ProviderId};

/// Which call path a request needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Intent {
    Text,
    File,
}

/// A logical model request. The name is fixed at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    name: String,
    intent: Intent,
}

impl ModelSpec {
    pub fn new(name: impl Into<String>, intent: Intent) -> Self {
        Self {
            name: name.into(),
            intent,
        }
    }

    pub fn text(name: impl Into<String>) -> Self {
        Self::new(name, Intent::Text)
    }

    pub fn file(name: impl Into<String>) -> Self {
        Self::new(name, Intent::File)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn intent(&self) -> Intent {
        self.intent
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BindingReason {
    DirectMatch,
    MissingCredentials,
    ProviderUnavailable,
    ConstructionError,
}

impl BindingReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BindingReason::DirectMatch => "DIRECT_MATCH",
            BindingReason::MissingCredentials => "MISSING_CREDENTIALS",
            BindingReason::ProviderUnavailable => "PROVIDER_UNAVAILABLE",
            BindingReason::ConstructionError => "CONSTRUCTION_ERROR",
        }
    }
}

/// Output of one routing decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderBinding {
    pub provider_id: ProviderId,
    pub resolved_model: String,
    pub reason: BindingReason,
}

/// Where API keys come from.
pub trait CredentialSource: Send + Sync {
    /// The secret stored under `name`, if any. Blank values count as absent.
    fn secret(&self, name: &str) -> Option<String>;
}

/// Reads credentials from process environment variables.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvCredentials;

impl CredentialSource for EnvCredentials {
    fn secret(&self, name: &str) -> Option<String> {
        std::env::var(name).ok().filter(|v| !v.trim().is_empty())
    }
}

/// Fixed credential map, for tests and embedding callers.
#[derive(Debug, Default, Clone)]
pub struct StaticCredentials {
    values: HashMap<String, String>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: &str) -> Self {
        self.values.insert(name.to_string(), value.to_string());
        self
    }
}

impl CredentialSource for StaticCredentials {
    fn secret(&self, name: &str) -> Option<String> {
        self.values
            .get(name)
            .filter(|v| !v.trim().is_empty())
            .cloned()
    }
}

/// Selects a gateway for each call.
pub struct ModelRouter {
    config: Config,
    credentials: Arc<dyn CredentialSource>,
    secondary_loaded: bool,
    primary: GatewayClient,
}

impl ModelRouter {
    /// Build the router and its primary gateway client.
    ///
    /// `secondary_loaded` is the startup capability flag for the secondary
    /// gateway (see [`crate::health::check_capabilities`]).
    ///
    /// # Errors
    ///
    /// Fails when the primary gateway client cannot be built. Callers treat
    /// this as an unrecoverable initialization failure.
    pub fn new(
        config: &Config,
        credentials: Arc<dyn CredentialSource>,
        secondary_loaded: bool,
    ) -> Result<Self, ProviderError> {
        let primary_cfg = &config.providers.primary;
        let primary_key = primary_cfg
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| credentials.secret(&primary_cfg.api_key_env));
        if primary_key.is_none() {
            debug!(
                env = %primary_cfg.api_key_env,
                "primary gateway has no API key configured; calling without one"
            );
        }
        let primary = GatewayClient::primary(config, primary_key)?;

        Ok(Self {
            config: config.clone(),
            credentials,
            secondary_loaded,
            primary,
        })
    }

    /// Routing decision only. Equal to `self.bind(spec).0`.
    pub fn route(&self, spec: &ModelSpec) -> ProviderBinding {
        self.bind(spec).0
    }

    /// Routing decision plus a provider ready to execute it.
    pub fn bind(&self, spec: &ModelSpec) -> (ProviderBinding, Provider) {
        let lower = spec.name().to_lowercase();
        let marked = self
            .config
            .providers
            .primary
            .markers
            .iter()
            .any(|m| !m.is_empty() && lower.contains(&m.to_lowercase()));

        if marked {
            return self.primary(spec, BindingReason::DirectMatch);
        }

        if !self.secondary_loaded {
            return self.primary(spec, BindingReason::ProviderUnavailable);
        }

        let secondary = &self.config.providers.secondary;
        let Some(key) = self.credentials.secret(&secondary.api_key_env) else {
            return self.primary(spec, BindingReason::MissingCredentials);
        };

        match GatewayClient::secondary(&self.config, key, spec.name()) {
            Ok(client) => {
                let binding = ProviderBinding {
                    provider_id: ProviderId::SecondaryGateway,
                    resolved_model: spec.name().to_string(),
                    reason: BindingReason::DirectMatch,
                };
                debug!(model = %spec.name(), intent = ?spec.intent(), "bound to secondary gateway");
                (binding, Provider::Secondary(client))
            }
            Err(e) => {
                warn!(model = %spec.name(), error = %e, "secondary client construction failed");
                self.primary(spec, BindingReason::ConstructionError)
            }
        }
    }

    fn primary(&self, spec: &ModelSpec, reason: BindingReason) -> (ProviderBinding, Provider) {
        if reason != BindingReason::DirectMatch {
            debug!(
                model = %spec.name(),
                reason = reason.as_str(),
                "falling back to primary gateway"
            );
        }
        let binding = ProviderBinding {
            provider_id: ProviderId::PrimaryGateway,
            resolved_model: spec.name().to_string(),
            reason,
        };
        (binding, Provider::Primary(self.primary.clone()))
    }
}
