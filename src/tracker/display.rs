//! Commands the tracker and viewport emit for whatever renders the map.

use serde::Serialize;
use tokio::sync::mpsc;

use crate::models::{Freshness, GeoPoint, TrailPoint};

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ListEntry {
    pub device_id: String,
    pub name: String,
    pub freshness: Freshness,
    pub visible: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "command", rename_all = "camelCase")]
pub enum DisplayCommand {
    #[serde(rename_all = "camelCase")]
    UpsertMarker {
        device_id: String,
        position: GeoPoint,
        label: String,
        freshness: Freshness,
        visible: bool,
    },
    #[serde(rename_all = "camelCase")]
    AppendTrail { device_id: String, point: TrailPoint },
    /// Replaces the whole trail, used after a restore.
    #[serde(rename_all = "camelCase")]
    SetTrail {
        device_id: String,
        points: Vec<TrailPoint>,
    },
    #[serde(rename_all = "camelCase")]
    SetFreshness {
        device_id: String,
        freshness: Freshness,
        label: String,
    },
    #[serde(rename_all = "camelCase")]
    SetVisibility { device_id: String, visible: bool },
    #[serde(rename_all = "camelCase")]
    RemoveEntity { device_id: String },
    RefreshList { entries: Vec<ListEntry> },
    CenterOn { position: GeoPoint, zoom: u8 },
    #[serde(rename_all = "camelCase")]
    FitBounds {
        south_west: GeoPoint,
        north_east: GeoPoint,
        padding: [u32; 2],
    },
}

/// Fire-and-forget render target. Implementations must not block.
pub trait DisplaySink: Send + Sync {
    fn apply(&self, command: DisplayCommand);
}

/// Writes each command as one JSON line on stdout.
#[derive(Debug, Default)]
pub struct LogDisplaySink;

impl DisplaySink for LogDisplaySink {
    fn apply(&self, command: DisplayCommand) {
        match serde_json::to_string(&command) {
            Ok(line) => println!("{line}"),
            Err(err) => log::warn!("Failed to serialize display command {command:?}: {err}"),
        }
    }
}

/// Forwards commands to a channel, for embedding in another UI loop.
pub struct ChannelDisplaySink {
    tx: mpsc::UnboundedSender<DisplayCommand>,
}

impl ChannelDisplaySink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DisplayCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl DisplaySink for ChannelDisplaySink {
    fn apply(&self, command: DisplayCommand) {
        // Receiver gone means nobody is rendering any more.
        let _ = self.tx.send(command);
    }
}
