// ===============================
// src/recorder.rs
// ===============================
//
// JSONL journal of a run:
// - one Event per line, appended
// - BufWriter, flushed every second and on close
// - parent directory created on demand
// - on write failure, reopen once and carry on
//
// ENV: set `RECORD_FILE=/path/to/journal.jsonl` to enable.
//
use std::path::Path;
use tokio::{
    fs::{self, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::mpsc,
    task::JoinHandle,
    time::{interval, Duration, MissedTickBehavior},
};
use tracing::{error, info, warn};

use crate::domain::Event;

/// Cheap handle the rest of the crate records through. A disabled journal drops everything.
#[derive(Clone, Default)]
pub struct Journal {
    tx: Option<mpsc::Sender<Event>>,
}

impl Journal {
    pub fn disabled() -> Self { Self { tx: None } }

    pub fn record(&self, ev: Event) {
        if let Some(tx) = &self.tx {
            if let Err(e) = tx.try_send(ev) {
                warn!(?e, "journal full or closed, event dropped");
            }
        }
    }
}

async fn open_writer(path: &str) -> std::io::Result<BufWriter<fs::File>> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }
    let file = OpenOptions::new().create(true).append(true).open(path).await?;
    Ok(BufWriter::new(file))
}

/// Start the writer task. Dropping every `Journal` clone closes the channel and
/// lets the task flush and finish; await the handle to be sure it did.
pub async fn spawn(path: String) -> std::io::Result<(Journal, JoinHandle<()>)> {
    let writer = open_writer(&path).await?;
    let (tx, rx) = mpsc::channel::<Event>(8192);
    let handle = tokio::spawn(run(rx, writer, path));
    Ok((Journal { tx: Some(tx) }, handle))
}

async fn run(mut rx: mpsc::Receiver<Event>, mut writer: BufWriter<fs::File>, path: String) {
    info!(%path, "recorder: started");

    let mut tick = interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            maybe_ev = rx.recv() => {
                let Some(ev) = maybe_ev else {
                    let _ = writer.flush().await;
                    info!("recorder: channel closed, stopped");
                    break;
                };
                let mut line = match serde_json::to_string(&ev) {
                    Ok(s) => s,
                    Err(e) => {
                        error!(?e, "recorder: serialize error, skip event");
                        continue;
                    }
                };
                line.push('\n');

                if let Err(e) = writer.write_all(line.as_bytes()).await {
                    error!(?e, "recorder: write failed, attempting reopen");
                    let _ = writer.flush().await;
                    writer = match open_writer(&path).await {
                        Ok(w) => w,
                        Err(e2) => {
                            error!(?e2, "recorder: reopen failed, journal stopped");
                            break;
                        }
                    };
                    if let Err(e2) = writer.write_all(line.as_bytes()).await {
                        error!(?e2, "recorder: write failed again after reopen, drop event");
                    }
                }
            }

            _ = tick.tick() => {
                let _ = writer.flush().await;
            }
        }
    }
}
