//! Request parameters and component configuration loaded from YAML.
//!
//! Field names follow the request vocabulary of the ICESat-2 services, and the
//! short aliases (`cnf`, `maxi`, `len`, ...) are accepted as well:
//!
//! ```rust
//! use trackline::config::Icesat2Params;
//!
//! let params = Icesat2Params::from_yaml_str(
//!     "cnf: medium\nlen: 40.0\nres: 20.0\nyapc:\n  score: 100\n",
//! )
//! .unwrap();
//! assert!(params.yapc_enabled());
//! assert!(!params.atl03_cnf.allows(2).unwrap());
//! assert!(params.atl03_cnf.allows(3).unwrap());
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::dispatch::{HandlerPolicy, KeyMode, RecordFormat};
use crate::icesat2::{NUM_ATL08_CLASSES, NUM_PHOTON_QUALITY, NUM_SIGNAL_CONF, SurfaceType};
use crate::{Result, TracklineError};

fn parse_yaml<T: DeserializeOwned>(text: &str, context: &str) -> Result<T> {
    serde_yaml_ng::from_str(text)
        .map_err(|source| TracklineError::Yaml { context: context.to_string(), source })
}

fn read_yaml_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| TracklineError::file_error(path.to_path_buf(), e))
}

/// Settings for a [`RecordDispatcher`](crate::dispatch::RecordDispatcher).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub input_queue: String,
    pub num_threads: usize,
    pub key_mode: KeyMode,
    pub policy: HandlerPolicy,
    /// Receive timeout driving `process_timeout`; negative uses the system timeout
    pub receive_timeout_ms: i64,
    pub record_format: RecordFormat,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            input_queue: String::new(),
            num_threads: 1,
            key_mode: KeyMode::ReceiptOrder,
            policy: HandlerPolicy::Continue,
            receive_timeout_ms: 1000,
            record_format: RecordFormat::Generic,
        }
    }
}

impl DispatcherConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        parse_yaml(text, "dispatcher config")
    }
}

/// A level given either as its number or by name.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Level {
    Index(i64),
    Name(String),
}

/// One level or an explicit list of levels.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum LevelSelection {
    One(Level),
    Many(Vec<Level>),
}

struct MaskKind {
    what: &'static str,
    prefix: &'static str,
    names: &'static [&'static str],
    /// Level of `names[0]`
    first: i64,
    /// A single level selects it and everything above
    cumulative: bool,
}

const CNF_KIND: MaskKind = MaskKind {
    what: "signal confidence",
    prefix: "atl03_",
    names: &["tep", "not_considered", "background", "within_10m", "low", "medium", "high"],
    first: -2,
    cumulative: true,
};

const QUALITY_KIND: MaskKind = MaskKind {
    what: "photon quality",
    prefix: "atl03_quality_",
    names: &["nominal", "afterpulse", "impulse_response", "tep"],
    first: 0,
    cumulative: true,
};

const CLASS_KIND: MaskKind = MaskKind {
    what: "ATL08 class",
    prefix: "atl08_",
    names: &["noise", "ground", "canopy", "top_of_canopy", "unclassified"],
    first: 0,
    cumulative: false,
};

impl MaskKind {
    fn level(&self, level: &Level) -> std::result::Result<i64, String> {
        let value = match level {
            Level::Index(i) => *i,
            Level::Name(name) => {
                let lower = name.trim().to_ascii_lowercase();
                let bare = lower.strip_prefix(self.prefix).unwrap_or(&lower);
                let pos = self
                    .names
                    .iter()
                    .position(|n| *n == bare)
                    .ok_or_else(|| format!("unknown {} '{name}'", self.what))?;
                pos as i64 + self.first
            }
        };
        let last = self.first + self.names.len() as i64 - 1;
        if value < self.first || value > last {
            return Err(format!("{} {value} outside {}..={last}", self.what, self.first));
        }
        Ok(value)
    }

    fn build<const N: usize>(&self, selection: LevelSelection) -> std::result::Result<[bool; N], String> {
        let mut mask = [false; N];
        match selection {
            LevelSelection::One(level) => {
                let index = (self.level(&level)? - self.first) as usize;
                if self.cumulative {
                    mask[index..].fill(true);
                } else {
                    mask[index] = true;
                }
            }
            LevelSelection::Many(levels) => {
                for level in &levels {
                    mask[(self.level(level)? - self.first) as usize] = true;
                }
            }
        }
        Ok(mask)
    }

    fn selected(&self, mask: &[bool]) -> Vec<i64> {
        mask.iter()
            .enumerate()
            .filter(|(_, on)| **on)
            .map(|(i, _)| i as i64 + self.first)
            .collect()
    }

    fn allows(&self, mask: &[bool], value: i64) -> Option<bool> {
        let index = value - self.first;
        if index < 0 {
            return None;
        }
        mask.get(index as usize).copied()
    }
}

/// Selected ATL03 signal confidence levels (-2..=4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "LevelSelection", into = "Vec<i64>")]
pub struct ConfidenceMask(pub [bool; NUM_SIGNAL_CONF]);

impl ConfidenceMask {
    /// Whether `cnf` passes; `None` when it is not a valid level.
    pub fn allows(&self, cnf: i8) -> Option<bool> {
        CNF_KIND.allows(&self.0, i64::from(cnf))
    }
}

impl Default for ConfidenceMask {
    fn default() -> Self {
        ConfidenceMask([false, false, true, true, true, true, true])
    }
}

impl TryFrom<LevelSelection> for ConfidenceMask {
    type Error = String;

    fn try_from(selection: LevelSelection) -> std::result::Result<Self, String> {
        CNF_KIND.build(selection).map(ConfidenceMask)
    }
}

impl From<ConfidenceMask> for Vec<i64> {
    fn from(mask: ConfidenceMask) -> Self {
        CNF_KIND.selected(&mask.0)
    }
}

/// Selected ATL03 photon quality levels (0..=3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "LevelSelection", into = "Vec<i64>")]
pub struct QualityMask(pub [bool; NUM_PHOTON_QUALITY]);

impl QualityMask {
    pub fn allows(&self, quality: i8) -> Option<bool> {
        QUALITY_KIND.allows(&self.0, i64::from(quality))
    }
}

impl Default for QualityMask {
    fn default() -> Self {
        QualityMask([true, false, false, false])
    }
}

impl TryFrom<LevelSelection> for QualityMask {
    type Error = String;

    fn try_from(selection: LevelSelection) -> std::result::Result<Self, String> {
        QUALITY_KIND.build(selection).map(QualityMask)
    }
}

impl From<QualityMask> for Vec<i64> {
    fn from(mask: QualityMask) -> Self {
        QUALITY_KIND.selected(&mask.0)
    }
}

/// Selected ATL08 photon classes (0..=4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "LevelSelection", into = "Vec<i64>")]
pub struct ClassMask(pub [bool; NUM_ATL08_CLASSES]);

impl ClassMask {
    /// Ground and canopy classes, used when PhoREAL runs without an explicit selection.
    pub const VEGETATION: ClassMask = ClassMask([false, true, true, true, false]);

    pub fn allows(&self, class: u8) -> Option<bool> {
        CLASS_KIND.allows(&self.0, i64::from(class))
    }
}

impl TryFrom<LevelSelection> for ClassMask {
    type Error = String;

    fn try_from(selection: LevelSelection) -> std::result::Result<Self, String> {
        CLASS_KIND.build(selection).map(ClassMask)
    }
}

impl From<ClassMask> for Vec<i64> {
    fn from(mask: ClassMask) -> Self {
        CLASS_KIND.selected(&mask.0)
    }
}

/// YAPC photon density scoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct YapcParams {
    /// Minimum score a photon needs to be kept
    pub score: u8,
    pub version: u8,
    /// Nearest neighbours; 0 selects from the photon density (version 2)
    pub knn: u32,
    pub min_knn: u32,
    /// Window height in meters; 0 derives it from the height spread (version 2)
    pub win_h: f64,
    /// Window width in meters
    pub win_x: f64,
}

impl Default for YapcParams {
    fn default() -> Self {
        Self { score: 0, version: 3, knn: 0, min_knn: 5, win_h: 6.0, win_x: 15.0 }
    }
}

/// How an ATL08 result is geolocated from its photons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeoLocation {
    Mean,
    #[default]
    Median,
    Center,
}

/// PhoREAL canopy metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhorealParams {
    pub binsize: f64,
    pub geoloc: GeoLocation,
    /// Use absolute heights instead of ATL08 relief
    pub use_abs_h: bool,
    pub send_waveform: bool,
}

impl Default for PhorealParams {
    fn default() -> Self {
        Self { binsize: 1.0, geoloc: GeoLocation::Median, use_abs_h: false, send_waveform: false }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coord {
    pub lat: f64,
    pub lon: f64,
}

/// Parameters of an ATL03 subsetting request and the fits run on its extents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Icesat2Params {
    #[serde(alias = "srt")]
    pub surface_type: SurfaceType,
    #[serde(alias = "cnf")]
    pub atl03_cnf: ConfidenceMask,
    pub quality_ph: QualityMask,
    /// Providing a selection enables ATL08 classification
    pub atl08_class: Option<ClassMask>,
    /// Providing a block enables YAPC scoring
    pub yapc: Option<YapcParams>,
    /// Providing a block enables PhoREAL (and ATL08 classification)
    pub phoreal: Option<PhorealParams>,
    /// Reference pair track 1..=3, or 0 for all
    pub track: u8,
    #[serde(alias = "poly")]
    pub polygon: Vec<Coord>,
    #[serde(alias = "maxi")]
    pub max_iterations: u32,
    #[serde(alias = "ats")]
    pub along_track_spread: f64,
    #[serde(alias = "cnt")]
    pub minimum_photon_count: u32,
    #[serde(alias = "H_min_win")]
    pub minimum_window: f64,
    #[serde(alias = "sigma_r_max")]
    pub maximum_robust_dispersion: f64,
    #[serde(alias = "len")]
    pub extent_length: f64,
    #[serde(alias = "res")]
    pub extent_step: f64,
    /// Post extents even when neither pair is valid
    pub pass_invalid: bool,
    /// Extent length and step count segments instead of meters
    pub dist_in_seg: bool,
    /// Post "atl06rec-compact" instead of full elevations
    pub compact: bool,
    #[serde(alias = "read_timeout")]
    pub read_timeout_ms: u64,
}

impl Default for Icesat2Params {
    fn default() -> Self {
        Self {
            surface_type: SurfaceType::Land,
            atl03_cnf: ConfidenceMask::default(),
            quality_ph: QualityMask::default(),
            atl08_class: None,
            yapc: None,
            phoreal: None,
            track: 0,
            polygon: Vec::new(),
            max_iterations: 5,
            along_track_spread: 20.0,
            minimum_photon_count: 10,
            minimum_window: 3.0,
            maximum_robust_dispersion: 5.0,
            extent_length: 40.0,
            extent_step: 20.0,
            pass_invalid: false,
            dist_in_seg: false,
            compact: false,
            read_timeout_ms: 600_000,
        }
    }
}

impl Icesat2Params {
    /// Parses and validates a YAML parameter block.
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let params: Self = parse_yaml(text, "icesat2 parameters")?;
        params.validate()?;
        Ok(params)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = read_yaml_file(path)?;
        let params: Self = parse_yaml(&text, &path.display().to_string())?;
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<()> {
        if self.track > crate::icesat2::NUM_TRACKS {
            return Err(TracklineError::config(format!("invalid track {}", self.track)));
        }
        if !(self.extent_length > 0.0) || !(self.extent_step > 0.0) {
            return Err(TracklineError::config(format!(
                "extent length {} and step {} must be positive",
                self.extent_length, self.extent_step
            )));
        }
        if !self.polygon.is_empty() && self.polygon.len() < 3 {
            return Err(TracklineError::config("polygon needs at least three points"));
        }
        if let Some(yapc) = &self.yapc {
            if !(1..=3).contains(&yapc.version) {
                return Err(TracklineError::config(format!(
                    "invalid YAPC version {}",
                    yapc.version
                )));
            }
        }
        if let Some(phoreal) = &self.phoreal {
            if !(phoreal.binsize > 0.0) {
                return Err(TracklineError::config(format!(
                    "invalid PhoREAL bin size {}",
                    phoreal.binsize
                )));
            }
        }
        Ok(())
    }

    pub fn atl08_enabled(&self) -> bool {
        self.atl08_class.is_some() || self.phoreal.is_some()
    }

    /// Class filter applied to photons; `None` when ATL08 is not in use.
    pub fn atl08_mask(&self) -> Option<ClassMask> {
        match (self.atl08_class, &self.phoreal) {
            (Some(mask), _) => Some(mask),
            (None, Some(_)) => Some(ClassMask::VEGETATION),
            (None, None) => None,
        }
    }

    pub fn yapc_enabled(&self) -> bool {
        self.yapc.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_pipeline_constants() {
        let params = Icesat2Params::from_yaml_str("{}").unwrap();
        assert_eq!(params, Icesat2Params::default());
        assert_eq!(params.max_iterations, 5);
        assert_eq!(params.minimum_photon_count, 10);
        assert!(!params.atl08_enabled());
        assert!(params.atl03_cnf.allows(0).unwrap());
        assert!(!params.atl03_cnf.allows(-1).unwrap());
        assert!(params.quality_ph.allows(0).unwrap());
        assert!(!params.quality_ph.allows(1).unwrap());
    }

    #[test]
    fn aliases_and_level_names() {
        let params = Icesat2Params::from_yaml_str(
            "srt: land_ice\ncnf: atl03_high\nquality_ph: [0, atl03_quality_afterpulse]\n\
             maxi: 7\nats: 10.0\ncnt: 5\nlen: 100.0\nres: 50.0\ntrack: 2\n",
        )
        .unwrap();
        assert_eq!(params.surface_type, SurfaceType::LandIce);
        assert_eq!(params.atl03_cnf.0, [false, false, false, false, false, false, true]);
        assert_eq!(params.quality_ph.0, [true, true, false, false]);
        assert_eq!(params.max_iterations, 7);
        assert_eq!(params.extent_length, 100.0);
        assert_eq!(params.track, 2);
    }

    #[test]
    fn single_class_selects_only_that_class() {
        let params = Icesat2Params::from_yaml_str("atl08_class: atl08_ground\n").unwrap();
        assert_eq!(params.atl08_mask(), Some(ClassMask([false, true, false, false, false])));
        assert!(params.atl08_enabled());
    }

    #[test]
    fn phoreal_enables_atl08_with_vegetation_classes() {
        let params =
            Icesat2Params::from_yaml_str("phoreal:\n  binsize: 0.5\n  geoloc: center\n").unwrap();
        assert!(params.atl08_enabled());
        assert_eq!(params.atl08_mask(), Some(ClassMask::VEGETATION));
        let phoreal = params.phoreal.unwrap();
        assert_eq!(phoreal.geoloc, GeoLocation::Center);
        assert_eq!(phoreal.binsize, 0.5);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(matches!(
            Icesat2Params::from_yaml_str("cnf: 9\n"),
            Err(TracklineError::Yaml { .. })
        ));
        assert!(Icesat2Params::from_yaml_str("atl08_class: shrubs\n").is_err());
        assert!(matches!(
            Icesat2Params::from_yaml_str("yapc:\n  version: 4\n"),
            Err(TracklineError::Config { .. })
        ));
        assert!(Icesat2Params::from_yaml_str("len: 0.0\n").is_err());
        assert!(Icesat2Params::from_yaml_str("track: 4\n").is_err());
    }

    #[test]
    fn masks_serialize_as_level_lists() {
        let yaml = serde_yaml_ng::to_string(&Icesat2Params::default()).unwrap();
        let back = Icesat2Params::from_yaml_str(&yaml).unwrap();
        assert_eq!(back.atl03_cnf, ConfidenceMask::default());
        assert_eq!(Vec::<i64>::from(ConfidenceMask::default()), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn dispatcher_config_from_yaml() {
        let config = DispatcherConfig::from_yaml_str(
            "input_queue: recq\nnum_threads: 4\nkey_mode: FIELD_KEY:extent_id\n",
        )
        .unwrap();
        assert_eq!(config.num_threads, 4);
        assert_eq!(config.key_mode, KeyMode::FieldValue("extent_id".into()));
        assert_eq!(config.receive_timeout_ms, 1000);
    }

    #[test]
    fn yaml_file_errors_carry_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.yaml");
        assert!(matches!(
            Icesat2Params::from_yaml_file(&missing),
            Err(TracklineError::File { .. })
        ));
        let path = dir.path().join("params.yaml");
        std::fs::write(&path, "cnt: 3\n").unwrap();
        assert_eq!(Icesat2Params::from_yaml_file(&path).unwrap().minimum_photon_count, 3);
    }
}
