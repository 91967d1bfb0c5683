use std::{net::IpAddr, time::Duration};

use dashmap::DashMap;
use log::{debug, warn};
use serde::Deserialize;
use telemetry_core::snapshot::Location;

use crate::error::FetchError;

#[derive(Debug, Deserialize)]
struct IpApiResponse {
    status: String,
    #[serde(default)]
    lat: Option<f64>,
    #[serde(default)]
    lon: Option<f64>,
    #[serde(default)]
    city: Option<String>,
    #[serde(default)]
    country: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Resolves IPs to locations through an ip-api compatible service.
///
/// Successful lookups are memoized for the life of the process. Failed lookups are
/// not, so they are retried on the next run.
pub struct GeolocationResolver {
    base_url: String,
    http: reqwest::Client,
    cache: DashMap<IpAddr, Location>,
}

impl GeolocationResolver {
    pub const DEFAULT_BASE_URL: &'static str = "http://ip-api.com";
    pub const TIMEOUT: Duration = Duration::from_secs(5);

    pub fn new(base_url: impl Into<String>) -> Result<Self, FetchError> {
        let http = reqwest::Client::builder().timeout(Self::TIMEOUT).build()?;
        Ok(GeolocationResolver {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
            cache: DashMap::new(),
        })
    }

    pub async fn resolve(&self, ip: IpAddr) -> Option<Location> {
        if let Some(location) = self.cache.get(&ip) {
            return Some(location.clone());
        }

        match self.lookup(ip).await {
            Ok(Some(location)) => {
                self.cache.insert(ip, location.clone());
                Some(location)
            }
            Ok(None) => None,
            Err(e) => {
                warn!("geolocation lookup for {ip} failed ({}): {e}", e.kind());
                None
            }
        }
    }

    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    async fn lookup(&self, ip: IpAddr) -> Result<Option<Location>, FetchError> {
        let response = self
            .http
            .get(format!("{}/json/{ip}", self.base_url))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(FetchError::Status(response.status().as_u16()));
        }

        let body: IpApiResponse = response.json().await?;
        if body.status != "success" {
            debug!(
                "no location for {ip}: {}",
                body.message.as_deref().unwrap_or(&body.status)
            );
            return Ok(None);
        }

        let (latitude, longitude) = match (body.lat, body.lon) {
            (Some(lat), Some(lon)) => (lat, lon),
            (None, _) => return Err(FetchError::MissingField("lat")),
            (_, None) => return Err(FetchError::MissingField("lon")),
        };
        Ok(Some(Location {
            latitude,
            longitude,
            city: body.city.unwrap_or_default(),
            country: body.country.unwrap_or_default(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use httpmock::prelude::*;
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn test_resolve_memoizes_success() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET).path("/json/8.8.8.8");
            then.status(200).json_body(json!({
                "status": "success",
                "lat": 37.751,
                "lon": -97.822,
                "city": "Wichita",
                "country": "United States"
            }));
        });

        let resolver = GeolocationResolver::new(server.base_url()).unwrap();
        let ip: IpAddr = "8.8.8.8".parse().unwrap();
        let first = resolver.resolve(ip).await.unwrap();
        let second = resolver.resolve(ip).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.city, "Wichita");
        assert_eq!(first.latitude, 37.751);
        assert_eq!(resolver.cached(), 1);
        mock.assert_hits(1);
    }

    #[tokio::test]
    async fn test_resolve_does_not_cache_failures() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET).path("/json/10.0.0.1");
            then.status(200)
                .json_body(json!({ "status": "fail", "message": "private range" }));
        });

        let resolver = GeolocationResolver::new(server.base_url()).unwrap();
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        assert_eq!(resolver.resolve(ip).await, None);
        assert_eq!(resolver.resolve(ip).await, None);
        assert_eq!(resolver.cached(), 0);
        mock.assert_hits(2);
    }

    #[tokio::test]
    async fn test_resolve_server_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET);
            then.status(429);
        });

        let resolver = GeolocationResolver::new(server.base_url()).unwrap();
        assert_eq!(resolver.resolve("1.1.1.1".parse().unwrap()).await, None);
    }
}
