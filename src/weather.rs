//! Daily forecast client.
//!
//! Speaks the open-meteo daily shape:
//!
//! ```json
//! {"daily": {"time": ["2026-01-15"], "temperature_2m_max": [24.4], "temperature_2m_min": [8.6]}}
//! ```
//!
//! Temperatures are rounded to whole degrees.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{info, instrument};

use crate::api::ApiError;
use crate::models::WeatherEntry;
use crate::utils::truncate_for_log;

pub const DEFAULT_WEATHER_URL: &str = "https://api.open-meteo.com/v1/forecast?latitude=29.07&longitude=-110.95&daily=temperature_2m_max,temperature_2m_min&timezone=America%2FHermosillo";

#[async_trait]
pub trait ForecastProvider: Send + Sync {
    async fn forecast(&self) -> Result<Vec<WeatherEntry>, ApiError>;
}

#[derive(Debug, Deserialize)]
struct ForecastResponse {
    #[serde(default)]
    daily: Option<Daily>,
}

#[derive(Debug, Deserialize)]
struct Daily {
    #[serde(default)]
    time: Vec<String>,
    #[serde(default)]
    temperature_2m_max: Vec<Option<f64>>,
    #[serde(default)]
    temperature_2m_min: Vec<Option<f64>>,
}

/// Parse a forecast body. Days missing either temperature are skipped.
pub fn parse_forecast(raw: &str) -> Result<Vec<WeatherEntry>, ApiError> {
    let response: ForecastResponse = serde_json::from_str(raw)?;
    let Some(daily) = response.daily else {
        return Ok(Vec::new());
    };
    let entries = daily
        .time
        .into_iter()
        .zip(daily.temperature_2m_max)
        .zip(daily.temperature_2m_min)
        .filter_map(|((date, max), min)| {
            Some(WeatherEntry {
                date,
                min: min?.round() as i32,
                max: max?.round() as i32,
            })
        })
        .collect();
    Ok(entries)
}

#[derive(Debug, Clone)]
pub struct OpenMeteoClient {
    client: Client,
    url: String,
}

impl OpenMeteoClient {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, ApiError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl ForecastProvider for OpenMeteoClient {
    #[instrument(level = "info", skip_all)]
    async fn forecast(&self) -> Result<Vec<WeatherEntry>, ApiError> {
        let response = self.client.get(&self.url).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(ApiError::Status {
                status: status.as_u16(),
                body: truncate_for_log(&body, 200),
            });
        }
        let entries = parse_forecast(&body)?;
        info!(days = entries.len(), "Fetched weather forecast");
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::tests::serve_once;

    #[test]
    fn test_parse_forecast_rounds_temperatures() {
        let raw = r#"{
            "latitude": 29.07,
            "daily": {
                "time": ["2026-01-15", "2026-01-16", "2026-01-17"],
                "temperature_2m_max": [24.4, 25.5, null],
                "temperature_2m_min": [8.6, 9.2, 10.0]
            }
        }"#;
        let entries = parse_forecast(raw).unwrap();
        assert_eq!(
            entries,
            vec![
                WeatherEntry {
                    date: "2026-01-15".to_string(),
                    min: 9,
                    max: 24,
                },
                WeatherEntry {
                    date: "2026-01-16".to_string(),
                    min: 9,
                    max: 26,
                },
            ]
        );
    }

    #[test]
    fn test_parse_forecast_without_daily_block() {
        assert!(parse_forecast(r#"{"error": true, "reason": "bad"}"#).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_error_body_is_truncated() {
        let reason = format!(r#"{{"error":true,"reason":"{}"}}"#, "x".repeat(1_000));
        let base = serve_once("400 Bad Request", reason, Duration::ZERO).await;
        let client = OpenMeteoClient::new(format!("{base}/v1/forecast"), Duration::from_secs(2)).unwrap();

        match client.forecast().await {
            Err(ApiError::Status { status, body }) => {
                assert_eq!(status, 400);
                assert!(body.chars().count() < 300, "{} chars", body.chars().count());
                assert!(body.starts_with(r#"{"error":true"#));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_forecast_rejects_garbage() {
        assert!(matches!(parse_forecast("<html>"), Err(ApiError::Decode(_))));
    }
}
