//! Utility functions

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Version information for the controller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: String,
    pub git_hash: String,
    pub build_time: String,
}

/// Get version information
pub fn version_info() -> VersionInfo {
    VersionInfo {
        version: env!("CARGO_PKG_VERSION").to_string(),
        git_hash: option_env!("GIT_HASH").unwrap_or("unknown").to_string(),
        build_time: option_env!("BUILD_TIME").unwrap_or("unknown").to_string(),
    }
}

/// Reduce arbitrary text to a Compose-safe slug (`[a-z0-9-]`, no leading/trailing dash)
pub fn slugify(input: &str) -> String {
    let mut slug = String::with_capacity(input.len());
    let mut last_dash = true;
    for c in input.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

/// Generate a Compose project name for a deployment of `stack_label`
pub fn generate_project_name(stack_label: &str) -> String {
    let mut slug = slugify(stack_label);
    slug.truncate(40);
    let slug = slug.trim_end_matches('-');
    let suffix = Uuid::new_v4().simple().to_string();
    if slug.is_empty() {
        format!("stack-{}", &suffix[..8])
    } else {
        format!("{}-{}", slug, &suffix[..8])
    }
}
