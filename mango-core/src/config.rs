//! Config discovery and parsing.
//!
//! Files are INI-like without sections: one `key=value` per line, `#`
//! comments, a bare `key` meaning `key=1`. The first existing candidate
//! wins; `MANGOHUD_CONFIGFILE` short-circuits the search and the inline
//! `MANGOHUD_CONFIG` variable is applied on top of whatever file was read.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::proc_info;
use crate::ConfigError;

/// Ordered `(key, value)` pairs; duplicates are preserved, later wins.
pub type Options = Vec<(String, String)>;

/// Parse one config line into the option list.
pub fn parse_line(line: &str, options: &mut Options) {
    let line = match line.find('#') {
        Some(pos) => &line[..pos],
        None => line,
    };
    let (key, value) = match line.find('=') {
        Some(pos) => (&line[..pos], line[pos + 1..].trim()),
        None => (line, "1"),
    };
    let key = key.trim();
    if !key.is_empty() {
        options.push((key.to_string(), value.to_string()));
    }
}

pub fn parse_str(contents: &str) -> Options {
    let mut options = Options::new();
    for line in contents.lines() {
        parse_line(line, &mut options);
    }
    options
}

/// Parse the inline `MANGOHUD_CONFIG` form: comma-separated options.
pub fn parse_env_config(value: &str) -> Options {
    let mut options = Options::new();
    for item in value.split(',') {
        parse_line(item, &mut options);
    }
    options
}

fn config_dir() -> Option<PathBuf> {
    if let Some(xdg) = env::var_os("XDG_CONFIG_HOME") {
        if !xdg.is_empty() {
            return Some(PathBuf::from(xdg));
        }
    }
    env::var_os("HOME").map(|home| PathBuf::from(home).join(".config"))
}

/// Candidate config files, most specific source first.
pub fn enumerate_candidates() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    if let Some(file) = env::var_os("MANGOHUD_CONFIGFILE") {
        paths.push(PathBuf::from(file));
        return paths;
    }

    let config_dir = config_dir();
    let program_name = proc_info::program_name();

    if let Some(dir) = &config_dir {
        let mangohud_dir = dir.join("MangoHud");
        paths.push(mangohud_dir.join("MangoHud.conf"));
        if program_name != "unknown" {
            paths.push(mangohud_dir.join(format!("{program_name}.conf")));
        }
    }
    if let Some(exe_dir) = proc_info::exe_dir() {
        paths.push(exe_dir.join("MangoHud.conf"));
    }
    if let (Some(dir), Some(wine_exe)) = (&config_dir, proc_info::wine_exe_name(false)) {
        paths.push(dir.join("MangoHud").join(format!("wine-{wine_exe}.conf")));
    }

    paths
}

/// The resolved option list plus where it came from.
pub struct LoadedConfig {
    pub options: Options,
    pub path: Option<PathBuf>,
}

/// Read the first existing candidate, then layer `MANGOHUD_CONFIG` on top.
pub fn load() -> LoadedConfig {
    load_from(&enumerate_candidates(), env::var("MANGOHUD_CONFIG").ok())
}

pub fn load_from(candidates: &[PathBuf], inline: Option<String>) -> LoadedConfig {
    let mut loaded = LoadedConfig {
        options: Options::new(),
        path: None,
    };

    for candidate in candidates {
        match read_file(candidate) {
            Ok(options) => {
                log::info!("parsing config: '{}'", candidate.display());
                loaded.options = options;
                loaded.path = Some(candidate.clone());
                break;
            }
            Err(ConfigError::Io { .. }) => {
                log::info!("skipping config: '{}' [ not found ]", candidate.display());
            }
            Err(_) => {}
        }
    }

    if let Some(inline) = inline {
        loaded.options.extend(parse_env_config(&inline));
    }
    loaded
}

pub fn read_file(path: &Path) -> Result<Options, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    Ok(parse_str(&contents))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_grammar() {
        let options = parse_str(
            "\
# a comment
fps_limit = 60
vram
gpu_temp=1 # trailing comment
   \n\
=nokey
",
        );
        assert_eq!(
            options,
            vec![
                ("fps_limit".to_string(), "60".to_string()),
                ("vram".to_string(), "1".to_string()),
                ("gpu_temp".to_string(), "1".to_string()),
            ]
        );
    }

    #[test]
    fn inline_env_config() {
        let options = parse_env_config("fps_limit=30,vram,position=top-right");
        assert_eq!(options.len(), 3);
        assert_eq!(options[1], ("vram".to_string(), "1".to_string()));
    }

    #[test]
    fn first_existing_candidate_wins() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.conf");
        let b = dir.path().join("b.conf");
        fs::write(&a, "fps_limit=30\n").unwrap();
        fs::write(&b, "fps_limit=60\n").unwrap();

        let missing = dir.path().join("missing.conf");
        let loaded = load_from(&[missing, a.clone(), b], None);
        assert_eq!(loaded.path.as_deref(), Some(a.as_path()));
        assert_eq!(
            loaded.options,
            vec![("fps_limit".to_string(), "30".to_string())]
        );
    }

    #[test]
    fn inline_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("MangoHud.conf");
        fs::write(&file, "fps_limit=60\n").unwrap();

        let loaded = load_from(&[file], Some("fps_limit=30".to_string()));
        let params = crate::Params::from_options(
            loaded.options.iter().map(|(k, v)| (k.as_str(), v.as_str())),
        );
        assert_eq!(params.fps_limit, vec![30]);
    }
}
