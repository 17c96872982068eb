//! Particle filter configuration
//!
//! [`ParticleFilterConfig`] gathers the tunables accepted by filter initialization. Every field
//! has a serde default so partial configuration files are accepted, and the struct can be
//! written to or read from JSON, YAML or TOML with the format chosen by file extension.
//! [`ParticleFilterConfig::validate`] must succeed before any particle is created.
use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

use anyhow::{Result, bail};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

fn default_radius() -> f64 {
    500.0
}
fn default_epsilon() -> f64 {
    0.1
}
fn default_particle_count() -> usize {
    200
}
fn default_quantile() -> f64 {
    0.99
}
fn default_kld_error() -> f64 {
    0.5
}
fn default_bin_size() -> i32 {
    5
}
fn default_use_gaussian() -> bool {
    true
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParticleFilterConfig {
    /// Radius (map pixels) of the initial particle cloud around the start location.
    #[serde(default = "default_radius")]
    pub radius: f64,
    /// Matching precision; the per-frame sample count is `round(10 / epsilon²)`.
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,
    #[serde(default = "default_particle_count")]
    pub particle_count: usize,
    /// Upper quantile of the standard normal used by the KLD particle bound.
    #[serde(default = "default_quantile")]
    pub quantile: f64,
    #[serde(default = "default_kld_error")]
    pub kld_error: f64,
    /// Spatial bin size (map pixels) for KLD bookkeeping.
    #[serde(default = "default_bin_size")]
    pub bin_size: i32,
    /// Draw the initial radii from a folded Gaussian instead of a folded uniform.
    #[serde(default = "default_use_gaussian")]
    pub use_gaussian_sampling: bool,
    /// Seed for the particle set's random number generator; entropy seeded when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl Default for ParticleFilterConfig {
    fn default() -> Self {
        ParticleFilterConfig {
            radius: default_radius(),
            epsilon: default_epsilon(),
            particle_count: default_particle_count(),
            quantile: default_quantile(),
            kld_error: default_kld_error(),
            bin_size: default_bin_size(),
            use_gaussian_sampling: default_use_gaussian(),
            seed: None,
        }
    }
}

impl ParticleFilterConfig {
    /// Checks every field against its admissible range.
    ///
    /// # Returns
    /// An error naming the first offending field and its value; values are never clamped.
    pub fn validate(&self) -> Result<()> {
        if !(self.radius > 0.0) {
            bail!("radius must be positive, got {}", self.radius);
        }
        if !(self.epsilon > 0.0 && self.epsilon < 1.0) {
            bail!("epsilon must be in (0, 1), got {}", self.epsilon);
        }
        if self.particle_count == 0 {
            bail!("particle_count must be positive, got {}", self.particle_count);
        }
        if !(self.quantile > 0.0 && self.quantile <= 1.0) {
            bail!("quantile must be in (0, 1], got {}", self.quantile);
        }
        if !(self.kld_error > 0.0) {
            bail!("kld_error must be positive, got {}", self.kld_error);
        }
        if self.bin_size <= 0 {
            bail!("bin_size must be positive, got {}", self.bin_size);
        }
        Ok(())
    }

    /// Number of template sample points drawn per frame.
    pub fn sample_count(&self) -> usize {
        (10.0 / (self.epsilon * self.epsilon)).round() as usize
    }

    /// Write the configuration, choosing the format by file extension (.json/.yaml/.yml/.toml).
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        write_file(self, path)
    }
    /// Read the configuration, choosing the format by file extension (.json/.yaml/.yml/.toml).
    pub fn from_file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        read_file(path)
    }
}

/// Serialization formats of the settings files.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Format {
    Json,
    Yaml,
    Toml,
}

impl Format {
    fn of(path: &Path) -> io::Result<Self> {
        let extension = path
            .extension()
            .and_then(|s| s.to_str())
            .map(|s| s.to_lowercase());
        match extension.as_deref() {
            Some("json") => Ok(Format::Json),
            Some("yaml") | Some("yml") => Ok(Format::Yaml),
            Some("toml") => Ok(Format::Toml),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unsupported file extension: {}", path.display()),
            )),
        }
    }
}

/// Writes `value` as JSON (pretty-printed), YAML or TOML depending on the extension of `path`.
pub(crate) fn write_file<T: Serialize, P: AsRef<Path>>(value: &T, path: P) -> io::Result<()> {
    let path = path.as_ref();
    let text = match Format::of(path)? {
        Format::Json => serde_json::to_string_pretty(value).map_err(io::Error::other)?,
        Format::Yaml => serde_yaml::to_string(value).map_err(io::Error::other)?,
        Format::Toml => toml::to_string(value).map_err(io::Error::other)?,
    };
    File::create(path)?.write_all(text.as_bytes())
}

/// Reads a value from JSON, YAML or TOML depending on the extension of `path`.
pub(crate) fn read_file<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> io::Result<T> {
    let path = path.as_ref();
    let format = Format::of(path)?;
    let text = std::fs::read_to_string(path)?;
    match format {
        Format::Json => serde_json::from_str(&text).map_err(io::Error::other),
        Format::Yaml => serde_yaml::from_str(&text).map_err(io::Error::other),
        Format::Toml => toml::from_str(&text).map_err(io::Error::other),
    }
}
