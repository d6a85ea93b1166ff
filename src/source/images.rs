//! Page image fetcher for the comick.io image host.
//!
//! The host serves the same page under several names, so a locator is expanded into URL variants
//! (alternate extensions, then the `-m` variants) that are tried in order.

use crate::download::{ByteFetcher, FetchError};
use reqwest::StatusCode;
use tracing::debug;

pub const IMAGE_HOST: &str = "https://meo.comick.pictures";

const VARIANT_EXTENSIONS: [&str; 5] = [".webp", ".png", ".jpg", ".jpeg", ".avif"];

/// Single-attempt fetcher over URL variants. Retrying is left to the download coordinator.
///
/// Any transport failure, 429, or 5xx on some variant makes the whole attempt transient. Only
/// rejections (404 and other 4xx) or empty bodies on every variant are permanent.
#[derive(Debug, Clone)]
pub struct ImageFetcher {
    client: reqwest::blocking::Client,
}

impl ImageFetcher {
    pub fn new(client: reqwest::blocking::Client) -> Self {
        Self { client }
    }
}

/// Original URL, its extension variants, then the same with a `-m` suffix on the stem. Deduplicated,
/// order preserved.
pub fn url_variants(url: &str) -> Vec<String> {
    let name_start = url.rfind('/').map(|i| i + 1).unwrap_or(0);
    let (stem, ext) = match url[name_start..].rfind('.') {
        Some(dot) => url.split_at(name_start + dot),
        None => (url, ""),
    };
    let modified = format!("{}-m", stem);
    let mut out: Vec<String> = Vec::new();
    let mut push = |candidate: String| {
        if !out.contains(&candidate) {
            out.push(candidate);
        }
    };
    push(url.to_string());
    for e in VARIANT_EXTENSIONS {
        push(format!("{}{}", stem, e));
    }
    push(format!("{}{}", modified, ext));
    for e in VARIANT_EXTENSIONS {
        push(format!("{}{}", modified, e));
    }
    out
}

fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

impl ByteFetcher for ImageFetcher {
    fn fetch(&self, locator: &str) -> Result<Vec<u8>, FetchError> {
        let variants = url_variants(locator);
        let mut transient: Option<String> = None;
        for url in &variants {
            let response = match self.client.get(url).send() {
                Ok(r) => r,
                Err(e) => {
                    debug!(url = %url, error = %e, "variant failed transiently");
                    transient.get_or_insert_with(|| format!("{}: {}", url, e));
                    continue;
                }
            };
            let status = response.status();
            if !status.is_success() {
                debug!(url = %url, status = status.as_u16(), "variant rejected");
                if is_transient_status(status) {
                    transient.get_or_insert_with(|| format!("HTTP {} for {}", status, url));
                }
                continue;
            }
            match response.bytes() {
                Ok(body) if !body.is_empty() => return Ok(body.to_vec()),
                Ok(_) => debug!(url = %url, "empty body"),
                Err(e) => {
                    debug!(url = %url, error = %e, "body read failed");
                    transient.get_or_insert_with(|| format!("{}: {}", url, e));
                }
            }
        }
        match transient {
            Some(reason) => Err(FetchError::Transient(reason)),
            None => Err(FetchError::Permanent(format!(
                "no URL variant of {} could be fetched ({} tried)",
                locator,
                variants.len()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::time::Duration;

    #[test]
    fn url_variants_cover_extensions_and_m_suffix() {
        let v = url_variants("https://meo.comick.pictures/abc.jpg");
        assert_eq!(v[0], "https://meo.comick.pictures/abc.jpg");
        assert_eq!(v[1], "https://meo.comick.pictures/abc.webp");
        assert!(v.contains(&"https://meo.comick.pictures/abc-m.jpg".to_string()));
        assert!(v.contains(&"https://meo.comick.pictures/abc-m.avif".to_string()));
        // abc.jpg only once
        assert_eq!(v.iter().filter(|u| u.ends_with("/abc.jpg")).count(), 1);
        assert_eq!(v.len(), 10);
    }

    #[test]
    fn url_variants_without_extension() {
        let v = url_variants("https://host.example/dir.v2/page");
        assert_eq!(v[0], "https://host.example/dir.v2/page");
        assert_eq!(v[1], "https://host.example/dir.v2/page.webp");
        assert!(v.contains(&"https://host.example/dir.v2/page-m".to_string()));
    }

    /// Local listener that handles every connection with `respond`, on a detached thread.
    fn local_server<F>(respond: F) -> std::io::Result<String>
    where
        F: Fn(TcpStream) + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        std::thread::spawn(move || {
            for stream in listener.incoming().flatten() {
                respond(stream);
            }
        });
        Ok(format!("http://{}/page.jpg", addr))
    }

    fn test_client() -> reqwest::blocking::Client {
        reqwest::blocking::Client::builder()
            .no_proxy()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap()
    }

    #[test]
    fn dropped_connections_are_transient() -> std::io::Result<()> {
        let url = local_server(|stream| drop(stream))?;
        let result = ImageFetcher::new(test_client()).fetch(&url);
        assert!(
            matches!(result, Err(FetchError::Transient(_))),
            "got {:?}",
            result
        );
        Ok(())
    }

    #[test]
    fn not_found_on_every_variant_is_permanent() -> std::io::Result<()> {
        let url = local_server(|mut stream| {
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                match stream.read(&mut buf) {
                    Ok(0) | Err(_) => return,
                    Ok(n) => request.extend_from_slice(&buf[..n]),
                }
            }
            let _ = stream.write_all(
                b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            );
        })?;
        let result = ImageFetcher::new(test_client()).fetch(&url);
        match result {
            Err(FetchError::Permanent(reason)) => assert!(reason.contains("10 tried")),
            other => panic!("expected permanent failure, got {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn transient_statuses() {
        assert!(is_transient_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_transient_status(StatusCode::BAD_GATEWAY));
        assert!(!is_transient_status(StatusCode::NOT_FOUND));
    }
}
