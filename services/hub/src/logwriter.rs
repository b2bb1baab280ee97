//! Daily RF message log files.
//!
//! Every received message becomes one line in `<dir>/YYYY-MM-DD.wd`:
//!
//! ```text
//! YYYY-MM-DD HH:MM:SS GG NN KK LL: DD DD ...
//! ```
//!
//! with the group and module kind in hex, the node ID and payload length
//! (including the kind byte) in decimal, and the payload bytes in hex.
//! The file is rotated by comparing today's name against the open one.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use chrono::Local;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::error;

use wd_protocol::RFMessage;
use wd_protocol::message::hex_dump;

/// Format one log line; `stamp` is the local `YYYY-MM-DD HH:MM:SS` time.
pub fn format_line(stamp: &str, m: &RFMessage) -> String {
    format!(
        "{} {:02x} {:02} {:02x} {:02}: {}\n",
        stamp,
        m.group,
        m.node,
        m.kind,
        m.data.len() + 1,
        hex_dump(&m.data)
    )
}

struct LogWriter {
    dir: PathBuf,
    file: Option<File>,
    open_name: String,
}

impl LogWriter {
    fn append(&mut self, m: &RFMessage) {
        let now = Local::now();
        let line = format_line(&now.format("%Y-%m-%d %H:%M:%S").to_string(), m);
        let name = format!("{}.wd", now.format("%Y-%m-%d"));

        if name != self.open_name {
            if let Err(e) = std::fs::create_dir_all(&self.dir) {
                error!(dir = %self.dir.display(), error = %e, "cannot create log directory");
                return;
            }
            let path = self.dir.join(&name);
            match OpenOptions::new().create(true).append(true).open(&path) {
                Ok(f) => {
                    self.file = Some(f);
                    self.open_name = name;
                }
                Err(e) => {
                    error!(path = %path.display(), error = %e, "cannot open log file");
                    self.open_name.clear();
                    return;
                }
            }
        }

        if let Some(f) = self.file.as_mut()
            && let Err(e) = f.write_all(line.as_bytes())
        {
            error!(name = %self.open_name, error = %e, "error writing log");
            // force a reopen on the next message
            self.open_name.clear();
        }
    }
}

/// Start the log writer processor on a fan-out channel.
pub fn spawn(mut rx: mpsc::Receiver<RFMessage>, dir: PathBuf) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut writer = LogWriter { dir, file: None, open_name: String::new() };
        while let Some(m) = rx.recv().await {
            writer.append(&m);
        }
    })
}
