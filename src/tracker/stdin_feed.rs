use log::warn;
use serde_json::Value;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::mpsc,
    task::JoinHandle,
};

/// Reads one JSON record per stdin line into `tx`, standing in for the
/// broadcast channel. Lines that are not JSON are skipped.
pub fn spawn_stdin_feed(tx: mpsc::Sender<Value>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => match serde_json::from_str::<Value>(&line) {
                    Ok(record) => {
                        if tx.send(record).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => warn!("Skipping inbound line that is not JSON: {err}"),
                },
                Ok(None) => break,
                Err(err) => {
                    warn!("stdin inbound feed failed: {err}");
                    break;
                }
            }
        }
    })
}
