//! Activity model: the presence-relevant slice of IDE state.
//!
//! `build_snapshot` is a pure function of the current `IdeState` and the
//! display settings. It never fails and never touches I/O; a missing file or
//! project simply yields an absent label.

use crate::config::DisplayConfig;
use chrono::{DateTime, Utc};
use presence_protocol::{Activity, Assets, Timestamps};
use std::path::Path;

/// Live IDE state as reported by the host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdeState {
    /// Full path of the focused document.
    pub active_file: Option<String>,
    pub active_project: Option<String>,
    pub host_version: String,
}

impl IdeState {
    pub fn new(host_version: impl Into<String>) -> Self {
        Self {
            active_file: None,
            active_project: None,
            host_version: host_version.into(),
        }
    }
}

/// Immutable capture of what the presence service should display.
///
/// Equality compares the labels and the asset key only. `session_start` is
/// stamped by the supervisor on delivery and is constant for a session.
#[derive(Debug, Clone)]
pub struct ActivitySnapshot {
    pub active_file_label: Option<String>,
    pub active_project_label: Option<String>,
    pub host_version_label: String,
    pub host_version_asset_key: String,
    pub session_start: Option<DateTime<Utc>>,
}

impl PartialEq for ActivitySnapshot {
    fn eq(&self, other: &Self) -> bool {
        self.active_file_label == other.active_file_label
            && self.active_project_label == other.active_project_label
            && self.host_version_label == other.host_version_label
            && self.host_version_asset_key == other.host_version_asset_key
    }
}

impl Eq for ActivitySnapshot {}

impl ActivitySnapshot {
    pub fn with_session_start(mut self, start: DateTime<Utc>) -> Self {
        self.session_start = Some(start);
        self
    }

    /// Maps the snapshot onto the wire activity, applying field limits.
    pub fn to_activity(&self, show_timestamp: bool) -> Activity {
        let timestamps = if show_timestamp {
            self.session_start.map(|start| Timestamps {
                start: Some(start.timestamp()),
            })
        } else {
            None
        };

        Activity {
            details: self.active_file_label.clone(),
            state: self.active_project_label.clone(),
            timestamps,
            assets: Some(Assets {
                large_image: Some(self.host_version_asset_key.clone()),
                large_text: Some(self.host_version_label.clone()),
                small_image: None,
                small_text: None,
            }),
        }
        .clamped()
    }
}

pub fn build_snapshot(state: &IdeState, display: &DisplayConfig) -> ActivitySnapshot {
    let active_file_label = if display.show_file_name {
        state
            .active_file
            .as_deref()
            .and_then(file_name)
            .map(|name| format!("{} {}", display.file_word, name))
    } else {
        None
    };

    let active_project_label = if display.show_project_name {
        state
            .active_project
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(|name| format!("{} {}", display.project_word, name))
    } else {
        None
    };

    let version = state.host_version.trim();
    ActivitySnapshot {
        active_file_label,
        active_project_label,
        host_version_label: format!("Visual Studio {}", version),
        host_version_asset_key: format!("vs_{}", version),
        session_start: None,
    }
}

// Hosts report either a full path or a bare document name.
fn file_name(path: &str) -> Option<&str> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return None;
    }
    let name = trimmed.rsplit(['/', '\\']).next().unwrap_or(trimmed);
    if name.is_empty() {
        Path::new(trimmed).file_name().and_then(|n| n.to_str())
    } else {
        Some(name)
    }
}
