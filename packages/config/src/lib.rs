// ABOUTME: Shared configuration for the siteaudit workspace
// ABOUTME: Environment variable names, default values and env parsing helpers

pub mod constants;

use std::env;
use tracing::warn;

/// Default E2B control-plane endpoint
pub const DEFAULT_E2B_API_URL: &str = "https://api.e2b.dev";

/// Default domain serving in-sandbox daemons
pub const DEFAULT_E2B_DOMAIN: &str = "e2b.app";

/// Custom template with Node 22, Chromium and the audit tools preinstalled
pub const DEFAULT_TEMPLATE: &str = "o9qbmv9te4ms59ge7b0o";

/// Image used by the local Docker provider
pub const DEFAULT_DOCKER_IMAGE: &str = "node:22-bookworm";

/// Name of the optional JSON config file searched from the working directory upward
pub const CONFIG_FILE_NAME: &str = "siteaudit.config.json";

/// Read a non-empty environment variable
pub fn env_string(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parse a numeric environment variable, falling back (with a warning) on garbage
pub fn env_parse_u64(name: &str, default: u64) -> u64 {
    match env_string(name) {
        Some(raw) => raw.parse::<u64>().unwrap_or_else(|_| {
            warn!("Ignoring invalid value for {}: {:?}", name, raw);
            default
        }),
        None => default,
    }
}
