//! Configuration – reads/writes `~/.cncsort/config.toml`.
//!
//! Every section is optional; missing keys take their defaults.  After
//! loading, `CNCSORT_*` environment variables override individual fields and
//! [`Config::validate`] rejects geometry the safety layer could not enforce.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use cncsort_hal::{ControllerConfig, ControllerKind, ScriptedBlob};
use cncsort_runtime::{Arrival, CameraMount, PlannerConfig, ScanArea, SortingConfig};
use cncsort_types::{FeedRateLimits, KeepOutZone, WorkspaceLimits};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Database path that selects the in-memory store.
pub const IN_MEMORY_DATABASE: &str = ":memory:";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config at {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },

    #[error("Failed to write config at {path}: {source}")]
    Write { path: PathBuf, source: std::io::Error },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

// ─────────────────────────────────────────────────────────────────────────────
// Sections
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionConfig {
    /// Z height (mm) for every lateral move.
    pub safe_z: f64,
    /// Feed rate (mm/min) of the final descent onto an object.
    pub pick_feed_rate: f64,
    /// Feed rates the machine accepts.
    pub feed: FeedRateLimits,
}

impl Default for MotionConfig {
    fn default() -> Self {
        let planner = PlannerConfig::default();
        Self {
            safe_z: planner.safe_z,
            pick_feed_rate: planner.pick_feed_rate,
            feed: FeedRateLimits::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MappingConfig {
    pub min_captures: usize,
    /// Columns of the `/scan` capture grid.
    pub grid_x: usize,
    /// Rows of the `/scan` capture grid.
    pub grid_y: usize,
    /// How close (mm) the head must be to a grid point before capturing.
    pub arrival_tolerance_mm: f64,
    pub arrival_timeout_ms: u64,
    /// Pause after arrival before the capture.
    pub settle_dwell_ms: u64,
}

impl Default for MappingConfig {
    fn default() -> Self {
        Self {
            min_captures: 2,
            grid_x: 3,
            grid_y: 2,
            arrival_tolerance_mm: 1.0,
            arrival_timeout_ms: 30_000,
            settle_dwell_ms: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub frame_width: u32,
    pub frame_height: u32,
    /// Pixel centres the simulated camera reports in every frame.
    pub simulated_detections: Vec<[f64; 2]>,
    pub mount: CameraMount,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            frame_width: 640,
            frame_height: 480,
            simulated_detections: Vec::new(),
            mount: CameraMount::default(),
        }
    }
}

impl CameraConfig {
    pub fn scripted_blobs(&self) -> Vec<ScriptedBlob> {
        self.simulated_detections
            .iter()
            .map(|[x, y]| ScriptedBlob::at(*x, *y))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite file, relative to the config directory, or `:memory:`.
    pub database: String,
    /// Root of the bed-map archive, relative to the config directory.
    pub archive_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: "detections.db".to_string(),
            archive_dir: "maps".to_string(),
        }
    }
}

impl StorageConfig {
    /// `None` for the in-memory store.
    pub fn database_path(&self, base: &Path) -> Option<PathBuf> {
        if self.database == IN_MEMORY_DATABASE {
            None
        } else {
            Some(resolve(base, &self.database))
        }
    }

    pub fn archive_path(&self, base: &Path) -> PathBuf {
        resolve(base, &self.archive_dir)
    }
}

fn resolve(base: &Path, p: &str) -> PathBuf {
    let p = Path::new(p);
    if p.is_absolute() { p.to_path_buf() } else { base.join(p) }
}

// ─────────────────────────────────────────────────────────────────────────────
// Config
// ─────────────────────────────────────────────────────────────────────────────

/// Persisted machine configuration stored in `~/.cncsort/config.toml`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub controller: ControllerConfig,
    pub workspace: WorkspaceLimits,
    pub motion: MotionConfig,
    pub mapping: MappingConfig,
    pub camera: CameraConfig,
    pub storage: StorageConfig,
    pub sorting: SortingConfig,
    pub keep_out: Vec<KeepOutZone>,
}

impl Config {
    pub fn planner(&self) -> PlannerConfig {
        PlannerConfig {
            safe_z: self.motion.safe_z,
            pick_feed_rate: self.motion.pick_feed_rate,
        }
    }

    pub fn scan_area(&self) -> ScanArea {
        ScanArea::from_limits(&self.workspace)
    }

    pub fn arrival(&self) -> Arrival {
        Arrival {
            tolerance_mm: self.mapping.arrival_tolerance_mm,
            timeout: Duration::from_millis(self.mapping.arrival_timeout_ms),
            dwell: Duration::from_millis(self.mapping.settle_dwell_ms),
            ..Arrival::default()
        }
    }

    /// Reject configurations the validator and planner cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let w = &self.workspace;
        for (axis, min, max) in [("x", w.min_x, w.max_x), ("y", w.min_y, w.max_y), ("z", w.min_z, w.max_z)] {
            if !(min.is_finite() && max.is_finite()) || min >= max {
                return invalid(format!("workspace {axis} limits must satisfy min < max, got {min}..{max}"));
            }
        }

        if self.mapping.min_captures < 2 {
            return invalid(format!(
                "mapping.min_captures must be at least 2, got {}",
                self.mapping.min_captures
            ));
        }
        if self.mapping.grid_x == 0 || self.mapping.grid_y == 0 {
            return invalid(format!(
                "mapping grid must be at least 1x1, got {}x{}",
                self.mapping.grid_x, self.mapping.grid_y
            ));
        }

        if !(self.mapping.arrival_tolerance_mm > 0.0) {
            return invalid(format!(
                "mapping.arrival_tolerance_mm must be positive, got {}",
                self.mapping.arrival_tolerance_mm
            ));
        }
        if !(self.controller.settle_tolerance_mm > 0.0) || self.controller.move_timeout_ms == 0 {
            return invalid(format!(
                "controller settle needs a positive tolerance and timeout, got {} mm / {} ms",
                self.controller.settle_tolerance_mm, self.controller.move_timeout_ms
            ));
        }

        let m = &self.motion;
        if !(m.safe_z >= w.min_z && m.safe_z <= w.max_z) {
            return invalid(format!(
                "motion.safe_z {} is outside z limits {}..{}",
                m.safe_z, w.min_z, w.max_z
            ));
        }
        if !(m.feed.min > 0.0 && m.feed.min <= m.feed.max) {
            return invalid(format!(
                "motion.feed must satisfy 0 < min <= max, got {}..{}",
                m.feed.min, m.feed.max
            ));
        }
        if m.feed.check(m.pick_feed_rate).is_err() {
            return invalid(format!(
                "motion.pick_feed_rate {} is outside feed bounds {}..{}",
                m.pick_feed_rate, m.feed.min, m.feed.max
            ));
        }

        for zone in &self.keep_out {
            if zone.footprint.len() < 3 {
                return invalid(format!(
                    "keep-out zone '{}' needs at least 3 vertices, got {}",
                    zone.name,
                    zone.footprint.len()
                ));
            }
            if zone.z_min > zone.z_max {
                return invalid(format!(
                    "keep-out zone '{}' has z_min {} above z_max {}",
                    zone.name, zone.z_min, zone.z_max
                ));
            }
        }

        if self.camera.frame_width == 0 || self.camera.frame_height == 0 {
            return invalid("camera frame size must be non-zero".to_string());
        }
        if let Err(msg) = self.sorting.check_references() {
            return invalid(format!("sorting: {msg}"));
        }
        Ok(())
    }
}

fn invalid(msg: String) -> Result<(), ConfigError> {
    Err(ConfigError::Invalid(msg))
}

// ─────────────────────────────────────────────────────────────────────────────
// Paths, load & save
// ─────────────────────────────────────────────────────────────────────────────

/// Return the path to `~/.cncsort/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

/// Build the config path relative to the given home directory.
pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".cncsort").join("config.toml")
}

/// Load the config from `path`, applying environment overrides.  Returns
/// `None` if the file does not exist.
pub fn load_from(path: &Path) -> Result<Option<Config>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let mut cfg: Config = toml::from_str(&raw)?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Apply `CNCSORT_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `CNCSORT_CONTROLLER` | `controller.kind` |
/// | `CNCSORT_SERIAL_PORT` | `controller.serial_port` |
/// | `CNCSORT_HTTP_HOST` | `controller.http_host` |
/// | `CNCSORT_HTTP_PORT` | `controller.http_port` |
/// | `CNCSORT_DATABASE` | `storage.database` |
///
/// Unparseable values are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("CNCSORT_CONTROLLER")
        && let Some(kind) = ControllerKind::parse(&v) {
            cfg.controller.kind = kind;
        }
    if let Ok(v) = std::env::var("CNCSORT_SERIAL_PORT") {
        cfg.controller.serial_port = v;
    }
    if let Ok(v) = std::env::var("CNCSORT_HTTP_HOST") {
        cfg.controller.http_host = v;
    }
    if let Ok(v) = std::env::var("CNCSORT_HTTP_PORT")
        && let Ok(port) = v.parse::<u16>() {
            cfg.controller.http_port = port;
        }
    if let Ok(v) = std::env::var("CNCSORT_DATABASE") {
        cfg.storage.database = v;
    }
}

/// Save the config to `path`, creating its directory if necessary.
pub fn save_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    let write_err = |source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(write_err)?;
        // Owner only (rwx------) on Unix.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700)).map_err(write_err)?;
        }
    }
    let raw = toml::to_string_pretty(cfg)?;
    // Owner-only read/write (rw-------) on Unix.
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| f.write_all(raw.as_bytes()))
            .map_err(write_err)?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw).map_err(write_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        Config::default().validate().expect("defaults must validate");
    }

    #[test]
    fn config_path_points_to_cncsort_dir() {
        let p = config_path_for_home("/home/operator");
        assert!(p.to_string_lossy().contains(".cncsort"));
        assert!(p.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert!(load_from(&path).expect("no error").is_none());
    }

    #[test]
    fn roundtrip_with_zones() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        let mut cfg = Config::default();
        cfg.keep_out.push(KeepOutZone::rect("clamp", (100.0, 100.0), (150.0, 150.0), 0.0, 40.0));
        cfg.camera.simulated_detections = vec![[320.0, 240.0]];
        save_to(&cfg, &path).expect("save");

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded.keep_out, cfg.keep_out);
        assert_eq!(loaded.mapping, MappingConfig::default());
        assert_eq!(loaded.camera.scripted_blobs().len(), 1);
    }

    #[test]
    fn partial_file_takes_defaults() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[workspace]\nmax_x = 600.0\nmax_y = 300.0\nmax_z = 120.0\n\n[mapping]\ngrid_x = 4\n",
        )
        .expect("write");

        let cfg = load_from(&path).expect("load ok").expect("some");
        assert_eq!(cfg.workspace, WorkspaceLimits::new(600.0, 300.0, 120.0));
        assert_eq!(cfg.mapping.grid_x, 4);
        assert_eq!(cfg.mapping.grid_y, 2);
        assert_eq!(cfg.motion.safe_z, 50.0);
        cfg.validate().expect("valid");
    }

    #[test]
    fn sorting_section_is_parsed_and_checked() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[sorting]
default_bin = "rejects"

[[sorting.tools]]
id = "magnet"
handles = ["nut", "bolt"]
change_location = { x = 10.0, y = 10.0, z = 50.0 }

[[sorting.bins]]
id = "nuts"
location = { x = 750.0, y = 50.0, z = 10.0 }
accepts = ["nut"]
size_range = ["small"]

[[sorting.bins]]
id = "rejects"
location = { x = 750.0, y = 390.0, z = 10.0 }
accepts = ["all"]
"#,
        )
        .expect("write");

        let mut cfg = load_from(&path).expect("load ok").expect("some");
        assert!(cfg.sorting.is_enabled());
        assert_eq!(cfg.sorting.tools[0].handles, vec!["nut", "bolt"]);
        assert_eq!(cfg.sorting.bin("rejects").unwrap().size_range, vec!["all"]);
        cfg.validate().expect("valid");

        cfg.sorting.default_bin = Some("bin_9".into());
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("bin_9"));
    }

    #[test]
    fn arrival_comes_from_mapping() {
        let mut cfg = Config::default();
        cfg.mapping.arrival_tolerance_mm = 2.5;
        cfg.mapping.settle_dwell_ms = 0;
        let arrival = cfg.arrival();
        assert_eq!(arrival.tolerance_mm, 2.5);
        assert_eq!(arrival.timeout, Duration::from_secs(30));
        assert_eq!(arrival.dwell, Duration::ZERO);

        cfg.mapping.arrival_tolerance_mm = 0.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn parse_error_is_reported() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[workspace\nmax_x = ").expect("write");
        assert!(matches!(load_from(&path), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn validate_rejects_bad_geometry() {
        let mut cfg = Config::default();
        cfg.workspace.min_x = cfg.workspace.max_x;
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));

        let mut cfg = Config::default();
        cfg.mapping.min_captures = 1;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.mapping.grid_y = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.motion.safe_z = cfg.workspace.max_z + 1.0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.motion.feed.min = 0.0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.motion.pick_feed_rate = cfg.motion.feed.max * 2.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_zones() {
        let mut cfg = Config::default();
        cfg.keep_out.push(KeepOutZone {
            name: "sliver".to_string(),
            footprint: vec![[0.0, 0.0], [10.0, 0.0]],
            z_min: 0.0,
            z_max: 10.0,
        });
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("sliver"));

        let mut cfg = Config::default();
        cfg.keep_out.push(KeepOutZone::rect("upside-down", (0.0, 0.0), (10.0, 10.0), 20.0, 5.0));
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn storage_paths_resolve_against_base() {
        let base = Path::new("/home/operator/.cncsort");
        let storage = StorageConfig::default();
        assert_eq!(storage.database_path(base), Some(base.join("detections.db")));
        assert_eq!(storage.archive_path(base), base.join("maps"));

        let mem = StorageConfig {
            database: IN_MEMORY_DATABASE.to_string(),
            archive_dir: "/srv/maps".to_string(),
        };
        assert_eq!(mem.database_path(base), None);
        assert_eq!(mem.archive_path(base), PathBuf::from("/srv/maps"));
    }

    #[test]
    fn apply_env_overrides_changes_controller() {
        // SAFETY: single-threaded test; no data races on env vars.
        unsafe { std::env::set_var("CNCSORT_CONTROLLER", "serial") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.controller.kind, ControllerKind::Serial);
        unsafe { std::env::remove_var("CNCSORT_CONTROLLER") };
    }

    #[test]
    fn apply_env_overrides_changes_serial_port_and_database() {
        // SAFETY: single-threaded test; no data races on env vars.
        unsafe {
            std::env::set_var("CNCSORT_SERIAL_PORT", "/dev/ttyACM1");
            std::env::set_var("CNCSORT_DATABASE", IN_MEMORY_DATABASE);
        }
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.controller.serial_port, "/dev/ttyACM1");
        assert_eq!(cfg.storage.database, IN_MEMORY_DATABASE);
        unsafe {
            std::env::remove_var("CNCSORT_SERIAL_PORT");
            std::env::remove_var("CNCSORT_DATABASE");
        }
    }

    #[test]
    fn apply_env_overrides_changes_http_endpoint() {
        // SAFETY: single-threaded test; no data races on env vars.
        unsafe {
            std::env::set_var("CNCSORT_HTTP_HOST", "10.0.0.7");
            std::env::set_var("CNCSORT_HTTP_PORT", "8080");
        }
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.controller.http_host, "10.0.0.7");
        assert_eq!(cfg.controller.http_port, 8080);
        unsafe {
            std::env::remove_var("CNCSORT_HTTP_HOST");
            std::env::remove_var("CNCSORT_HTTP_PORT");
        }
    }

    #[cfg(unix)]
    #[test]
    fn config_file_has_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        save_to(&Config::default(), &path).expect("save");

        let file_mode = std::fs::metadata(&path).expect("file metadata").permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600, "config file must have 0o600 permissions");

        let dir_mode = std::fs::metadata(path.parent().unwrap())
            .expect("dir metadata")
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(dir_mode, 0o700, "config directory must have 0o700 permissions");
    }
}
