use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::future::BoxFuture;
use serde::Serialize;

use super::uplink::RemoteSink;
use crate::{error::SinkError, models::Reading};

/// Body accepted by the tracking insert endpoint.
#[derive(Debug, Serialize)]
struct TrackingPayload<'a> {
    #[serde(rename = "DeviceID")]
    device_id: &'a str,
    #[serde(rename = "Title")]
    title: Option<&'a str>,
    #[serde(rename = "UserName")]
    user_name: Option<&'a str>,
    #[serde(rename = "Latitude")]
    latitude: f64,
    #[serde(rename = "Longitude")]
    longitude: f64,
    #[serde(rename = "RecordDate")]
    record_date: String,
}

impl<'a> From<&'a Reading> for TrackingPayload<'a> {
    fn from(reading: &'a Reading) -> Self {
        Self {
            device_id: &reading.device_id,
            title: reading.title.as_deref(),
            user_name: reading.display_name.as_deref(),
            latitude: reading.position.lat,
            longitude: reading.position.lon,
            record_date: reading.captured_at.to_rfc3339(),
        }
    }
}

/// POSTs readings as JSON to an HTTP endpoint.
pub struct HttpSink {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpSink {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

impl RemoteSink for HttpSink {
    fn deliver<'a>(&'a self, reading: &'a Reading) -> BoxFuture<'a, Result<(), SinkError>> {
        Box::pin(async move {
            let payload = TrackingPayload::from(reading);
            let response = self
                .client
                .post(&self.endpoint)
                .json(&payload)
                .send()
                .await
                .map_err(|err| {
                    if err.is_builder() {
                        SinkError::Malformed(err.to_string())
                    } else {
                        SinkError::Transport(err.to_string())
                    }
                })?;

            let status = response.status();
            if status.is_success() {
                Ok(())
            } else {
                Err(SinkError::Rejected {
                    status: status.as_u16(),
                })
            }
        })
    }
}
