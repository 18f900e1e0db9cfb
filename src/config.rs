//! Session configuration.
//!
//! All fields have defaults, so a host can deserialize a partial JSON document
//! and override only what it needs.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SessionError};

/// How the view is oriented while live tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrientationMode {
    /// North stays up
    #[default]
    NorthUp,
    /// View rotates to the last known heading
    HeadingUp,
}

/// Configuration for a routing session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Path of the SQLite database shared by every instance.
    /// Default: "route_session.db"
    pub db_path: String,

    /// Application name written to the session metadata.
    /// Default: "route-session"
    pub app_name: String,

    /// Reuse the session id found in the store instead of minting a new one.
    /// Instances sharing a session still see each other's writes.
    /// Default: false
    pub reuse_session: bool,

    /// Poll interval of the cross-instance change watcher, in milliseconds.
    /// Default: 500
    pub watch_interval_ms: u64,

    /// Offset in pixels between a marker anchor and its tooltip.
    /// Default: 12.0
    pub tooltip_offset: f64,

    /// Default anchor direction for new tooltips ("top", "right", "bottom", "left").
    /// Default: "top"
    pub tooltip_direction: String,

    /// Color of the lowest known elevation on elevation-colored pins.
    /// Default: "#2b83ba"
    pub elevation_low_color: String,

    /// Color of the highest known elevation on elevation-colored pins.
    /// Default: "#d7191c"
    pub elevation_high_color: String,

    /// Pin color used when no elevation is known.
    /// Default: "#7f7f7f"
    pub unknown_elevation_color: String,

    /// Color elevation-colored pins by elevation (otherwise use `path_color`).
    /// Default: true
    pub color_by_elevation: bool,

    /// Color of the route polyline and midpoint discs.
    /// Default: "#3388ff"
    pub path_color: String,

    /// Color of avoid-zone polygons.
    /// Default: "#e31a1c"
    pub avoid_zone_color: String,

    /// Optional file-backed icon for the origin marker, replacing the home pin.
    /// Default: None
    pub origin_icon_file: Option<String>,

    /// Padding in pixels applied when fitting the view to a route.
    /// Default: 40.0
    pub fit_padding: f64,

    /// View orientation during live tracking.
    /// Default: NorthUp
    pub orientation: OrientationMode,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            db_path: "route_session.db".to_string(),
            app_name: "route-session".to_string(),
            reuse_session: false,
            watch_interval_ms: 500,
            tooltip_offset: 12.0,
            tooltip_direction: "top".to_string(),
            elevation_low_color: "#2b83ba".to_string(),
            elevation_high_color: "#d7191c".to_string(),
            unknown_elevation_color: "#7f7f7f".to_string(),
            color_by_elevation: true,
            path_color: "#3388ff".to_string(),
            avoid_zone_color: "#e31a1c".to_string(),
            origin_icon_file: None,
            fit_padding: 40.0,
            orientation: OrientationMode::NorthUp,
        }
    }
}

impl SessionConfig {
    /// Parse a configuration document; missing keys take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| SessionError::Config {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| SessionError::Config {
            message: format!("{}: {}", path.display(), e),
        })?;
        Self::from_json_str(&text)
    }

    /// Reject values the session cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.watch_interval_ms == 0 {
            return Err(SessionError::Config {
                message: "watch_interval_ms must be positive".to_string(),
            });
        }
        if !(self.tooltip_offset.is_finite() && self.tooltip_offset >= 0.0) {
            return Err(SessionError::Config {
                message: "tooltip_offset must be a non-negative number".to_string(),
            });
        }
        if crate::tooltip::Direction::parse(&self.tooltip_direction).is_none() {
            return Err(SessionError::Config {
                message: format!("unknown tooltip_direction '{}'", self.tooltip_direction),
            });
        }
        for color in [
            &self.elevation_low_color,
            &self.elevation_high_color,
            &self.unknown_elevation_color,
            &self.path_color,
            &self.avoid_zone_color,
        ] {
            if crate::render::parse_hex_color(color).is_none() {
                return Err(SessionError::Config {
                    message: format!("invalid color '{}'", color),
                });
            }
        }
        Ok(())
    }

    pub fn watch_interval(&self) -> Duration {
        Duration::from_millis(self.watch_interval_ms)
    }
}
