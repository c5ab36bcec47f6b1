//! Locale path normalization
//!
//! Every page path starts with a supported locale code (`/en/...`). A path
//! without one is redirected to the same path under the default locale.
//! Asset, API and health paths are left alone.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocaleConfig {
    pub enabled: bool,
    /// Supported locale codes, matched against the first path segment
    pub supported: Vec<String>,
    pub default_locale: String,
    /// Path prefixes that never get a locale
    pub exempt_prefixes: Vec<String>,
}

impl Default for LocaleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            supported: vec!["en".to_string(), "ar".to_string()],
            default_locale: "en".to_string(),
            exempt_prefixes: vec![
                "/api".to_string(),
                "/_next".to_string(),
                "/static".to_string(),
                "/health".to_string(),
            ],
        }
    }
}

impl LocaleConfig {
    /// Locale named by the first path segment, if it is supported
    pub fn locale_of<'a>(&self, path: &'a str) -> Option<&'a str> {
        let first = path.trim_start_matches('/').split('/').next()?;
        self.supported
            .iter()
            .any(|code| code == first)
            .then_some(first)
    }

    pub fn is_exempt(&self, path: &str) -> bool {
        let prefixed = self.exempt_prefixes.iter().any(|prefix| {
            let prefix = prefix.trim_end_matches('/');
            path == prefix
                || path
                    .strip_prefix(prefix)
                    .is_some_and(|rest| rest.starts_with('/'))
        });
        prefixed || has_file_extension(path)
    }

    /// Path to redirect to, or `None` when `path` is already normalized
    pub fn normalize_path(&self, path: &str) -> Option<String> {
        if !self.enabled || self.supported.is_empty() || self.is_exempt(path) {
            return None;
        }
        if self.locale_of(path).is_some() {
            return None;
        }

        let rest = if path.is_empty() || path == "/" {
            ""
        } else {
            path
        };
        let rest = if rest.is_empty() || rest.starts_with('/') {
            rest.to_string()
        } else {
            format!("/{}", rest)
        };
        Some(format!("/{}{}", self.default_locale, rest))
    }
}

fn has_file_extension(path: &str) -> bool {
    let last = path.rsplit('/').next().unwrap_or(path);
    last.rsplit_once('.')
        .is_some_and(|(stem, ext)| !stem.is_empty() && !ext.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unprefixed_path_gets_default_locale() {
        let config = LocaleConfig::default();
        assert_eq!(config.normalize_path("/"), Some("/en".to_string()));
        assert_eq!(config.normalize_path(""), Some("/en".to_string()));
        assert_eq!(
            config.normalize_path("/doctors/42"),
            Some("/en/doctors/42".to_string())
        );
    }

    #[test]
    fn test_supported_locale_is_left_alone() {
        let config = LocaleConfig::default();
        assert_eq!(config.normalize_path("/en"), None);
        assert_eq!(config.normalize_path("/ar/doctors"), None);
        assert_eq!(config.locale_of("/ar/doctors"), Some("ar"));
    }

    #[test]
    fn test_unsupported_locale_is_prefixed() {
        let config = LocaleConfig::default();
        // Looks like a locale but is not supported
        assert_eq!(config.normalize_path("/fr/doctors"), Some("/en/fr/doctors".to_string()));
        // Prefix match must cover the whole segment
        assert_eq!(config.normalize_path("/english"), Some("/en/english".to_string()));
    }

    #[test]
    fn test_exempt_paths() {
        let config = LocaleConfig::default();
        assert_eq!(config.normalize_path("/api/patients"), None);
        assert_eq!(config.normalize_path("/api"), None);
        assert_eq!(config.normalize_path("/health"), None);
        assert_eq!(config.normalize_path("/_next/static/chunk.js"), None);
        assert_eq!(config.normalize_path("/favicon.ico"), None);
        assert_eq!(config.normalize_path("/images/logo.png"), None);

        // Shares a prefix's text only
        assert_eq!(config.normalize_path("/apis"), Some("/en/apis".to_string()));
        // Dotfile is not an extension
        assert_eq!(config.normalize_path("/.well"), Some("/en/.well".to_string()));
    }

    #[test]
    fn test_disabled() {
        let config = LocaleConfig {
            enabled: false,
            ..Default::default()
        };
        assert_eq!(config.normalize_path("/doctors"), None);
    }
}
