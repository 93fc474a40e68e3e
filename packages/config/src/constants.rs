// ABOUTME: Environment variable name constants
// ABOUTME: Centralized definitions of all environment variable names used across siteaudit

// Provider Credentials
pub const E2B_API_KEY: &str = "E2B_API_KEY";
pub const E2B_DOMAIN: &str = "E2B_DOMAIN";
pub const E2B_API_URL: &str = "E2B_API_URL";

// Provider Selection
pub const SITEAUDIT_PROVIDER: &str = "SITEAUDIT_PROVIDER";
pub const SITEAUDIT_TEMPLATE: &str = "SITEAUDIT_TEMPLATE";
pub const SITEAUDIT_DOCKER_IMAGE: &str = "SITEAUDIT_DOCKER_IMAGE";

// Run Limits
pub const SITEAUDIT_TIMEOUT: &str = "SITEAUDIT_TIMEOUT"; // seconds
