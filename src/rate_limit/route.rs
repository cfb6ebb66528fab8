//! Route Templates
//!
//! Buckets are keyed by route template rather than full URL: many endpoints
//! share one remote rate-limit scope. Numeric id segments collapse to `{id}`
//! unless they follow a major parameter, whose id keeps its own bucket.

use reqwest::Url;

use crate::error::{RelayError, Result};

/// Path segments whose following id is part of the bucket key
pub const DEFAULT_MAJOR_PARAMETERS: &[&str] = &["channels", "guilds", "webhooks"];

/// Maps request targets to bucket ids
#[derive(Debug, Clone)]
pub struct RouteTemplate {
    major_parameters: Vec<String>,
}

impl Default for RouteTemplate {
    fn default() -> Self {
        Self::new(DEFAULT_MAJOR_PARAMETERS.iter().map(|s| s.to_string()).collect())
    }
}

impl RouteTemplate {
    /// Create a template mapper with the given major parameters
    pub fn new(major_parameters: Vec<String>) -> Self {
        Self { major_parameters }
    }

    /// Bucket id for `method` against `target_url`
    ///
    /// ```
    /// use quota_relay::rate_limit::RouteTemplate;
    ///
    /// let routes = RouteTemplate::default();
    /// let id = routes
    ///     .bucket_id_for("get", "https://api.example.com/channels/42/messages/9001?limit=5")
    ///     .unwrap();
    /// assert_eq!(id, "GET /channels/42/messages/{id}");
    /// ```
    pub fn bucket_id_for(&self, method: &str, target_url: &str) -> Result<String> {
        let url = Url::parse(target_url)
            .map_err(|e| RelayError::InvalidConfig(format!("invalid target url {}: {}", target_url, e)))?;
        Ok(format!("{} {}", method.to_ascii_uppercase(), self.template_path(url.path())))
    }

    /// Collapse id segments of a path
    pub fn template_path(&self, path: &str) -> String {
        let mut previous: Option<&str> = None;
        let mut out = String::with_capacity(path.len());

        for segment in path.split('/').filter(|s| !s.is_empty()) {
            out.push('/');
            let keep = previous.is_some_and(|p| self.is_major(p));
            if is_id(segment) && !keep {
                out.push_str("{id}");
            } else {
                out.push_str(segment);
            }
            previous = Some(segment);
        }

        if out.is_empty() {
            out.push('/');
        }
        out
    }

    fn is_major(&self, segment: &str) -> bool {
        self.major_parameters.iter().any(|m| m == segment)
    }
}

fn is_id(segment: &str) -> bool {
    !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_major_parameter_keeps_id() {
        let routes = RouteTemplate::default();
        assert_eq!(
            routes.template_path("/api/v10/guilds/123/members/456"),
            "/api/v10/guilds/123/members/{id}"
        );
    }

    #[test]
    fn test_minor_ids_share_bucket() {
        let routes = RouteTemplate::default();
        let a = routes.bucket_id_for("GET", "https://x.test/users/1").unwrap();
        let b = routes.bucket_id_for("GET", "https://x.test/users/2").unwrap();
        assert_eq!(a, b);
        assert_eq!(a, "GET /users/{id}");
    }

    #[test]
    fn test_method_is_part_of_key() {
        let routes = RouteTemplate::default();
        let get = routes.bucket_id_for("GET", "https://x.test/users/1").unwrap();
        let post = routes.bucket_id_for("post", "https://x.test/users/1").unwrap();
        assert_ne!(get, post);
        assert!(post.starts_with("POST "));
    }

    #[test]
    fn test_root_path() {
        let routes = RouteTemplate::default();
        assert_eq!(routes.bucket_id_for("GET", "https://x.test").unwrap(), "GET /");
    }

    #[test]
    fn test_invalid_url() {
        let routes = RouteTemplate::default();
        assert!(routes.bucket_id_for("GET", "not a url").is_err());
    }

    #[test]
    fn test_custom_major_parameters() {
        let routes = RouteTemplate::new(vec!["repos".to_string()]);
        assert_eq!(routes.template_path("/repos/7/issues/8"), "/repos/7/issues/{id}");
        assert_eq!(routes.template_path("/channels/7"), "/channels/{id}");
    }
}
