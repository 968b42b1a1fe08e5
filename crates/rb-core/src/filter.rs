//! Read-time redaction of credentials and project secrets.
//!
//! Stored steps are never rewritten; every read goes through a
//! [`SensitiveFilter`] built from the current user and project, so clearing a
//! credential from config makes the original text visible again.

use crate::types::{Project, User};

#[derive(Clone)]
pub struct SensitiveFilter {
    /// Sorted longest first so overlapping values never leak a suffix.
    values: Vec<String>,
    marker: String,
}

impl SensitiveFilter {
    pub fn new(values: impl IntoIterator<Item = String>, marker: impl Into<String>) -> Self {
        let mut values: Vec<String> = values.into_iter().filter(|v| !v.is_empty()).collect();
        values.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        values.dedup();
        Self {
            values,
            marker: marker.into(),
        }
    }

    /// A filter that redacts nothing.
    pub fn none() -> Self {
        Self::new(Vec::new(), "")
    }

    /// Collect the GitHub token, each non-blank SSH key line and every
    /// non-empty project secret value.
    pub fn for_context(user: Option<&User>, project: Option<&Project>, marker: &str) -> Self {
        let mut values = Vec::new();
        if let Some(user) = user {
            if let Some(token) = user.github_token() {
                values.push(token.trim().to_string());
            }
            if let Some(key) = user.ssh_key() {
                values.extend(
                    key.lines()
                        .map(str::trim)
                        .filter(|l| !l.is_empty())
                        .map(str::to_string),
                );
            }
        }
        if let Some(project) = project {
            values.extend(
                project
                    .secrets
                    .values()
                    .map(|v| v.trim())
                    .filter(|v| !v.is_empty())
                    .map(str::to_string),
            );
        }
        Self::new(values, marker)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Replace every sensitive value in one left-to-right pass over the
    /// original text, so an inserted marker is never matched again.
    pub fn apply(&self, text: &str) -> String {
        if self.values.is_empty() {
            return text.to_string();
        }
        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        while let Some(ch) = rest.chars().next() {
            match self.values.iter().find(|v| rest.starts_with(v.as_str())) {
                Some(value) => {
                    out.push_str(&self.marker);
                    rest = &rest[value.len()..];
                }
                None => {
                    out.push(ch);
                    rest = &rest[ch.len_utf8()..];
                }
            }
        }
        out
    }
}

impl std::fmt::Debug for SensitiveFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SensitiveFilter")
            .field("values", &self.values.len())
            .field("marker", &self.marker)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replaces_every_occurrence() {
        let filter = SensitiveFilter::new(vec!["ghp_abc".to_string()], "[FILTERED]");
        assert_eq!(
            filter.apply("token ghp_abc and again ghp_abc"),
            "token [FILTERED] and again [FILTERED]"
        );
    }

    #[test]
    fn longer_values_win_over_prefixes() {
        let filter = SensitiveFilter::new(
            vec!["secret".to_string(), "secret-long".to_string()],
            "***",
        );
        assert_eq!(filter.apply("x=secret-long"), "x=***");
    }

    #[test]
    fn marker_text_is_not_filtered_again() {
        let filter = SensitiveFilter::new(
            vec!["ghp_token123".to_string(), "ILTER".to_string()],
            "[FILTERED]",
        );
        assert_eq!(filter.apply("tok ghp_token123"), "tok [FILTERED]");
        assert_eq!(filter.apply("FILTERS"), "F[FILTERED]S");
    }

    #[test]
    fn multibyte_text_around_values_is_kept() {
        let filter = SensitiveFilter::new(vec!["sécret".to_string()], "*");
        assert_eq!(filter.apply("ä sécret ö"), "ä * ö");
    }

    #[test]
    fn empty_filter_is_identity() {
        let filter = SensitiveFilter::none();
        assert!(filter.is_empty());
        assert_eq!(filter.apply("plain"), "plain");
    }

    #[test]
    fn ssh_key_lines_are_collected() {
        let mut user = User::new("dev");
        user.ssh_key = Some("-----BEGIN KEY-----\nAAAAB3Nza\n\n-----END KEY-----\n".into());
        let filter = SensitiveFilter::for_context(Some(&user), None, "[F]");
        assert_eq!(filter.apply("leaked AAAAB3Nza here"), "leaked [F] here");
        assert_eq!(filter.apply("-----END KEY-----"), "[F]");
    }

    #[test]
    fn debug_hides_values() {
        let filter = SensitiveFilter::new(vec!["hunter2".to_string()], "[F]");
        assert!(!format!("{filter:?}").contains("hunter2"));
    }
}
