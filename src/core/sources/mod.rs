pub mod app_server;
pub mod normalize;
pub mod oauth;

use tokio::time::Instant;

use crate::core::error::UsageError;
use crate::core::models::summary::Summary;

pub use app_server::AppServerSource;
pub use oauth::OAuthSource;

/// A usage source bound to one account home. Primary and fallback share this
/// capability set; tests plug in the fake variant.
pub enum AccountSource {
    AppServer(AppServerSource),
    OAuth(OAuthSource),
    #[cfg(test)]
    Fake(fake::FakeSource),
}

impl AccountSource {
    pub fn app_server_for_home(codex_home: &str) -> Self {
        Self::AppServer(AppServerSource::for_home(codex_home))
    }

    pub fn oauth_for_home(codex_home: &str) -> Self {
        Self::OAuth(OAuthSource::for_home(codex_home))
    }

    pub fn name(&self) -> &str {
        match self {
            Self::AppServer(source) => source.name(),
            Self::OAuth(source) => source.name(),
            #[cfg(test)]
            Self::Fake(source) => source.name(),
        }
    }

    pub async fn fetch(&self, deadline: Instant) -> Result<Summary, UsageError> {
        match self {
            Self::AppServer(source) => source.fetch(deadline).await,
            Self::OAuth(source) => source.fetch().await,
            #[cfg(test)]
            Self::Fake(source) => source.fetch(),
        }
    }

    pub async fn close(&self) -> Result<(), UsageError> {
        match self {
            Self::AppServer(source) => source.close().await,
            Self::OAuth(source) => source.close().await,
            #[cfg(test)]
            Self::Fake(source) => source.close(),
        }
    }
}

/// Try the primary source; on failure fall back, recording a warning that
/// names the primary and its error. Both failing yields an error that names
/// both sources.
pub async fn fetch_with_fallback(
    primary: &AccountSource,
    fallback: &AccountSource,
    deadline: Instant,
) -> Result<Summary, UsageError> {
    let primary_err = match primary.fetch(deadline).await {
        Ok(summary) => return Ok(summary),
        Err(err) => err,
    };

    match fallback.fetch(deadline).await {
        Ok(mut summary) => {
            summary.warnings.push(format!(
                "primary source {:?} failed: {primary_err}",
                primary.name()
            ));
            Ok(summary)
        }
        Err(fallback_err) => Err(UsageError::SourcesFailed(format!(
            "primary source {:?} failed: {primary_err}; fallback source {:?} failed: {fallback_err}",
            primary.name(),
            fallback.name(),
        ))),
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    #[tokio::test]
    async fn fallback_uses_primary_on_success() {
        let primary = AccountSource::Fake(fake::FakeSource::ok(
            "primary",
            Summary {
                source: "primary".to_string(),
                ..Default::default()
            },
        ));
        let fallback = AccountSource::Fake(fake::FakeSource::ok(
            "fallback",
            Summary {
                source: "fallback".to_string(),
                ..Default::default()
            },
        ));

        let out = fetch_with_fallback(&primary, &fallback, deadline())
            .await
            .unwrap();
        assert_eq!(out.source, "primary");
        assert!(out.warnings.is_empty());
    }

    #[tokio::test]
    async fn fallback_adds_warning_mentioning_primary() {
        let primary = AccountSource::Fake(fake::FakeSource::failing("primary", "boom"));
        let fallback = AccountSource::Fake(fake::FakeSource::ok(
            "fallback",
            Summary {
                source: "fallback".to_string(),
                ..Default::default()
            },
        ));

        let out = fetch_with_fallback(&primary, &fallback, deadline())
            .await
            .unwrap();
        assert_eq!(out.source, "fallback");
        assert_eq!(out.warnings.len(), 1);
        assert!(out.warnings[0].contains("primary"));
        assert!(out.warnings[0].contains("boom"));
    }

    #[tokio::test]
    async fn both_failing_mentions_both_sources() {
        let primary = AccountSource::Fake(fake::FakeSource::failing("primary", "p"));
        let fallback = AccountSource::Fake(fake::FakeSource::failing("fallback", "f"));

        let err = fetch_with_fallback(&primary, &fallback, deadline())
            .await
            .unwrap_err();
        let text = err.to_string();
        assert!(text.contains("primary"));
        assert!(text.contains("fallback"));
    }
}
