//! Startup capability check.
//!
//! Optional capabilities are reported as flags; a missing one puts the
//! process in a degraded mode for that feature and never stops startup.

use serde::Serialize;

use crate::config::Config;
use crate::embedding::create_embedder;
use crate::router::CredentialSource;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Capabilities {
    /// An embedder could be constructed.
    pub embedding: bool,
    /// The secondary gateway is enabled and its endpoint is usable.
    pub secondary_provider: bool,
    /// A key for the secondary gateway is present.
    pub secondary_credentials: bool,
    /// A remote store is configured and keyed.
    pub remote_store: bool,
    /// A saved local index exists under `retrieval.index_dir`.
    pub local_index: bool,
    pub notes: Vec<String>,
}

impl Capabilities {
    pub fn is_degraded(&self) -> bool {
        !(self.embedding && self.secondary_provider && self.secondary_credentials)
    }
}

pub fn check_capabilities(config: &Config, credentials: &dyn CredentialSource) -> Capabilities {
    let mut notes = Vec::new();

    let embedding = if !config.embedding.is_enabled() {
        notes.push("embedding disabled; retrieval context is off".to_string());
        false
    } else {
        match create_embedder(&config.embedding) {
            Ok(_) => true,
            Err(e) => {
                notes.push(format!("embedding unavailable: {:#}", e));
                false
            }
        }
    };

    let secondary = &config.providers.secondary;
    let secondary_provider = if !secondary.enabled {
        notes.push("secondary gateway disabled".to_string());
        false
    } else {
        match reqwest::Url::parse(&secondary.base_url) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => true,
            _ => {
                notes.push(format!(
                    "secondary gateway endpoint is not usable: {}",
                    secondary.base_url
                ));
                false
            }
        }
    };

    let secondary_credentials = credentials.secret(&secondary.api_key_env).is_some();
    if secondary_provider && !secondary_credentials {
        notes.push(format!(
            "{} not set; non-primary models use the primary gateway",
            secondary.api_key_env
        ));
    }

    let remote_store = match &config.remote_store {
        None => false,
        Some(remote) => {
            let keyed = credentials.secret(&remote.api_key_env).is_some();
            if !keyed {
                notes.push(format!(
                    "{} not set; remote store disabled",
                    remote.api_key_env
                ));
            }
            keyed
        }
    };

    let local_index = config
        .retrieval
        .index_dir
        .as_ref()
        .is_some_and(|dir| dir.join("index.json").exists());

    Capabilities {
        embedding,
        secondary_provider,
        secondary_credentials,
        remote_store,
        local_index,
        notes,
    }
}

/// `relay health`: print the capability flags and notes.
pub fn run_health(config: &Config, credentials: &dyn CredentialSource) {
    let caps = check_capabilities(config, credentials);
    let flag = |ok: bool| if ok { "ok" } else { "missing" };

    println!("llm-relay health");
    println!("  embedding:              {}", flag(caps.embedding));
    println!("  secondary provider:     {}", flag(caps.secondary_provider));
    println!("  secondary credentials:  {}", flag(caps.secondary_credentials));
    println!("  remote store:           {}", flag(caps.remote_store));
    println!("  local index:            {}", flag(caps.local_index));
    for note in &caps.notes {
        println!("  note: {}", note);
    }
    println!("{}", if caps.is_degraded() { "degraded" } else { "ok" });
}
