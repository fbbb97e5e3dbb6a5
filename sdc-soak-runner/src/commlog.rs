// Copyright (c) The sdc-soak Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Capture of protocol traffic.
//!
//! The device library reports every message it sends or receives to a [`CommLogSink`].
//! [`DirectoryLogger`] is the sink used by the harness: it appends one line per message to a
//! timestamped file in a log directory.

use crate::{
    config::{app_data_dir, home_dir},
    errors::CommLogError,
    helpers::lock,
};
use camino::{Utf8Path, Utf8PathBuf};
use chrono::Local;
use std::{
    fmt,
    fs::File,
    io::{BufWriter, Write},
    sync::Mutex,
};
use tracing::{debug, warn};

/// The direction of a captured message.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Direction {
    /// Received from a peer.
    Inbound,
    /// Sent to a peer.
    Outbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inbound => f.write_str("<-"),
            Self::Outbound => f.write_str("->"),
        }
    }
}

/// Receives protocol messages from the device library.
pub trait CommLogSink: Send + Sync {
    /// Records one message exchanged with `peer`.
    fn record(&self, direction: Direction, peer: &str, message: &str);
}

/// Returns the default comm-log directory: `%APPDATA%\SDC11073\commlog` on Windows,
/// `~/.sdc11073/commlog` elsewhere.
pub fn default_commlog_dir() -> Result<Utf8PathBuf, CommLogError> {
    commlog_dir_in(app_data_dir().as_deref(), home_dir().as_deref())
}

fn commlog_dir_in(
    app_data: Option<&Utf8Path>,
    home: Option<&Utf8Path>,
) -> Result<Utf8PathBuf, CommLogError> {
    if let Some(app_data) = app_data {
        return Ok(app_data.join("commlog"));
    }
    let home = home.ok_or(CommLogError::NoHomeDir)?;
    Ok(home.join(".sdc11073").join("commlog"))
}

/// Writes captured traffic to `<dir>/commlog-<timestamp>.log`.
#[derive(Debug)]
pub struct DirectoryLogger {
    path: Utf8PathBuf,
    // None once stopped.
    writer: Mutex<Option<BufWriter<File>>>,
}

impl DirectoryLogger {
    /// Creates `dir` if necessary and opens a new log file in it.
    pub fn start(dir: &Utf8Path) -> Result<Self, CommLogError> {
        std::fs::create_dir_all(dir).map_err(|err| CommLogError::CreateDir {
            dir: dir.to_owned(),
            err,
        })?;

        let file_name = format!("commlog-{}.log", Local::now().format("%Y%m%d-%H%M%S%.3f"));
        let path = dir.join(file_name);
        let file = File::create(&path).map_err(|err| CommLogError::CreateFile {
            path: path.clone(),
            err,
        })?;
        debug!("capturing protocol traffic in `{path}`");

        Ok(Self {
            path,
            writer: Mutex::new(Some(BufWriter::new(file))),
        })
    }

    /// The file messages are written to.
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Flushes and closes the log file. Messages recorded afterwards are dropped.
    pub fn stop(&self) -> Result<(), CommLogError> {
        let mut guard = lock(&self.writer);
        match guard.take() {
            Some(mut writer) => writer.flush().map_err(|err| CommLogError::Write {
                path: self.path.clone(),
                err,
            }),
            None => Ok(()),
        }
    }
}

impl CommLogSink for DirectoryLogger {
    fn record(&self, direction: Direction, peer: &str, message: &str) {
        let mut guard = lock(&self.writer);
        let Some(writer) = guard.as_mut() else {
            return;
        };
        let timestamp = Local::now().format("%H:%M:%S%.6f");
        if let Err(err) = writeln!(writer, "{timestamp} {direction} {peer}: {message}") {
            // Stop capturing rather than logging the same failure for every message.
            warn!("failed to write comm-log file `{}`: {err}", self.path);
            *guard = None;
        }
    }
}
