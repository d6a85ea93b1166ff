//! comick.io adapter: HTTP client, metadata source, and page image fetcher.

mod client;
mod error;

pub mod comick;
pub mod images;

pub use client::{PoliteClient, PoliteClientBuilder};
pub use comick::ComickSource;
pub use error::SourceError;
pub use images::ImageFetcher;

use reqwest::Url;

const ACCEPTED_HOSTS: [&str; 4] = ["comick.io", "www.comick.io", "comick.cc", "www.comick.cc"];

/// Comic slug from a comic URL such as `https://comick.io/comic/solo-leveling?lang=en`.
///
/// The slug keys the workspace directory, so it is derived without any network access.
pub fn slug_from_url(input: &str) -> Result<String, SourceError> {
    let url = Url::parse(input.trim()).map_err(|e| SourceError::InvalidUrl {
        input: input.to_string(),
        reason: e.to_string(),
    })?;
    let host = url.host_str().ok_or_else(|| SourceError::InvalidUrl {
        input: input.to_string(),
        reason: "URL has no host".to_string(),
    })?;
    if !ACCEPTED_HOSTS.contains(&host.to_ascii_lowercase().as_str()) {
        return Err(SourceError::UnsupportedHost {
            host: host.to_string(),
        });
    }
    let mut segments = url.path_segments().into_iter().flatten().filter(|s| !s.is_empty());
    match (segments.next(), segments.next()) {
        (Some("comic"), Some(slug)) => Ok(slug.to_string()),
        _ => Err(SourceError::InvalidUrl {
            input: input.to_string(),
            reason: "expected a comic page URL like https://comick.io/comic/<slug>".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_from_comic_url() -> Result<(), SourceError> {
        assert_eq!(slug_from_url("https://comick.io/comic/solo-leveling")?, "solo-leveling");
        assert_eq!(
            slug_from_url("https://comick.io/comic/00-tower/ch-1?lang=en")?,
            "00-tower"
        );
        assert_eq!(slug_from_url(" https://WWW.comick.io/comic/x/ ")?, "x");
        Ok(())
    }

    #[test]
    fn slug_rejects_other_urls() {
        assert!(matches!(
            slug_from_url("https://example.com/comic/x"),
            Err(SourceError::UnsupportedHost { .. })
        ));
        assert!(matches!(
            slug_from_url("https://comick.io/search"),
            Err(SourceError::InvalidUrl { .. })
        ));
        assert!(matches!(
            slug_from_url("not a url"),
            Err(SourceError::InvalidUrl { .. })
        ));
    }
}
