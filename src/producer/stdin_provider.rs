use std::time::Duration;

use chrono::Utc;
use futures_util::future::BoxFuture;
use log::warn;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::watch,
};

use super::sampler::{Fix, PositionProvider};
use crate::{
    error::{CapabilityError, FixError},
    models::GeoPoint,
};

/// Reads `lat,lon` lines from stdin and serves the latest one as the current fix.
pub struct StdinPositionProvider {
    latest: watch::Receiver<Option<Fix>>,
}

impl StdinPositionProvider {
    pub fn spawn() -> Self {
        let (tx, rx) = watch::channel(None);
        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => match parse_fix_line(&line) {
                        Some(position) => {
                            let _ = tx.send(Some(Fix {
                                position,
                                captured_at: Utc::now(),
                            }));
                        }
                        None => warn!("Ignoring position line {line:?}; expected `lat,lon`"),
                    },
                    Ok(None) => break,
                    Err(err) => {
                        warn!("stdin position feed failed: {err}");
                        break;
                    }
                }
            }
            let _ = tx.send(None);
        });
        Self { latest: rx }
    }
}

impl PositionProvider for StdinPositionProvider {
    fn register(&self, _interval: Duration) -> Result<(), CapabilityError> {
        if self.latest.has_changed().is_err() {
            return Err(CapabilityError::PositioningDisabled("stdin feed closed".into()));
        }
        Ok(())
    }

    fn unregister(&self) {}

    fn next_fix(&self) -> BoxFuture<'_, Result<Fix, FixError>> {
        Box::pin(async move {
            match *self.latest.borrow() {
                Some(fix) => Ok(Fix {
                    captured_at: Utc::now(),
                    ..fix
                }),
                None => Err(FixError::Unavailable("no fix received yet".into())),
            }
        })
    }
}

fn parse_fix_line(line: &str) -> Option<GeoPoint> {
    let (lat, lon) = line.trim().split_once(',')?;
    let point = GeoPoint::new(lat.trim().parse().ok()?, lon.trim().parse().ok()?);
    point.is_valid().then_some(point)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_lat_lon_lines() {
        assert_eq!(parse_fix_line(" 10.75, 106.66 "), Some(GeoPoint::new(10.75, 106.66)));
        assert_eq!(parse_fix_line("91,0"), None);
        assert_eq!(parse_fix_line("hello"), None);
    }
}
