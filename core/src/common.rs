//! Helpers for the `mapmatch` binary: logger setup and input resolution.

use std::path::{Path, PathBuf};

use anyhow::{Result, bail};

use mapmatch::config::ParticleFilterConfig;

/// Initialize the logger with the specified configuration.
///
/// # Arguments
/// * `log_level` - Log level string (off, error, warn, info, debug, trace)
/// * `log_file` - Optional path to log file (logs to stderr if None)
///
/// # Errors
/// Returns an error if the log file cannot be opened or logger initialization fails.
pub fn init_logger(log_level: &str, log_file: Option<&PathBuf>) -> Result<()> {
    use std::io::Write;

    let level = log_level.parse::<log::LevelFilter>().unwrap_or_else(|_| {
        eprintln!("Invalid log level '{}', defaulting to 'info'", log_level);
        log::LevelFilter::Info
    });

    let mut builder = env_logger::Builder::new();
    builder.filter_level(level);
    builder.format(|buf, record| {
        writeln!(
            buf,
            "{} [{}] - {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            record.level(),
            record.args()
        )
    });

    if let Some(log_path) = log_file {
        if let Some(parent) = log_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let target = Box::new(
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_path)?,
        );
        builder.target(env_logger::Target::Pipe(target));
    }

    builder.try_init()?;
    Ok(())
}

/// Loads the filter configuration from `path`, or the defaults when no file is given.
pub fn load_config(path: Option<&Path>) -> Result<ParticleFilterConfig> {
    match path {
        Some(path) => {
            if !path.is_file() {
                bail!("Config file '{}' does not exist.", path.display());
            }
            Ok(ParticleFilterConfig::from_file(path)?)
        }
        None => Ok(ParticleFilterConfig::default()),
    }
}

/// Finds the georeferencing file next to a map image: `<stem>.json`, `.yaml`, `.yml` or `.toml`.
pub fn find_map_description(map_image: &Path) -> Option<PathBuf> {
    ["json", "yaml", "yml", "toml"]
        .iter()
        .map(|ext| map_image.with_extension(ext))
        .find(|candidate| candidate.is_file())
}

/// Map name used in the output directory: the image file stem.
pub fn map_name(map_image: &Path) -> Option<String> {
    map_image
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
}
