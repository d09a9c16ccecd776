//! Identity of the process we are injected into.
//!
//! Wine games report the preloader as their executable; the real target
//! binary has to be dug out of the command line instead, and it is the name
//! users expect in config file names and log files.

use std::fs;
use std::path::PathBuf;

use once_cell::sync::Lazy;

/// Resolved `/proc/self/exe`.
pub fn exe_path() -> Option<PathBuf> {
    fs::read_link("/proc/self/exe").ok()
}

pub fn exe_dir() -> Option<PathBuf> {
    exe_path().and_then(|p| p.parent().map(|d| d.to_path_buf()))
}

fn basename(path: &str) -> String {
    path.rsplit(['/', '\\'])
        .next()
        .unwrap_or(path)
        .to_string()
}

/// Pick the wine target executable out of a null-separated cmdline.
pub fn wine_exe_from_cmdline(cmdline: &[u8], keep_ext: bool) -> Option<String> {
    let args: Vec<&str> = cmdline
        .split(|&b| b == 0)
        .filter(|arg| !arg.is_empty())
        .map(|arg| std::str::from_utf8(arg).unwrap_or(""))
        .collect();

    let arg0 = basename(args.first()?);
    let is_wine = matches!(
        arg0.as_str(),
        "wine" | "wine64" | "wine-preloader" | "wine64-preloader"
    );

    // Under the preloader the target is some argument ending in .exe; plain
    // wine passes it as the first non-flag argument.
    let candidate = if is_wine {
        args.iter()
            .skip(1)
            .find(|arg| arg.to_ascii_lowercase().ends_with(".exe"))
            .map(|arg| basename(arg))
    } else if arg0.to_ascii_lowercase().ends_with(".exe") {
        Some(arg0)
    } else {
        None
    }?;

    if keep_ext {
        Some(candidate)
    } else {
        Some(
            candidate
                .strip_suffix(".exe")
                .or_else(|| candidate.strip_suffix(".EXE"))
                .unwrap_or(&candidate)
                .to_string(),
        )
    }
}

/// Wine target name for this process, if any.
pub fn wine_exe_name(keep_ext: bool) -> Option<String> {
    let cmdline = fs::read("/proc/self/cmdline").ok()?;
    wine_exe_from_cmdline(&cmdline, keep_ext)
}

/// The name the overlay reports for this process: the wine target if we are
/// inside wine, otherwise the executable basename.
pub fn program_name() -> String {
    static NAME: Lazy<String> = Lazy::new(|| {
        if let Some(wine) = wine_exe_name(true) {
            return wine;
        }
        exe_path()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .unwrap_or_else(|| "unknown".to_string())
    });
    NAME.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmdline(args: &[&str]) -> Vec<u8> {
        let mut out = Vec::new();
        for arg in args {
            out.extend_from_slice(arg.as_bytes());
            out.push(0);
        }
        out
    }

    #[test]
    fn wine_target_is_preferred_over_preloader() {
        let c = cmdline(&[
            "/usr/bin/wine64-preloader",
            "Z:\\games\\Some Game\\game.exe",
            "-windowed",
        ]);
        assert_eq!(
            wine_exe_from_cmdline(&c, true),
            Some("game.exe".to_string())
        );
        assert_eq!(wine_exe_from_cmdline(&c, false), Some("game".to_string()));
    }

    #[test]
    fn native_binaries_are_not_wine() {
        let c = cmdline(&["/usr/bin/vkcube", "--present_mode", "fifo"]);
        assert_eq!(wine_exe_from_cmdline(&c, true), None);
    }

    #[test]
    fn bare_exe_argv0() {
        let c = cmdline(&["C:\\game\\launcher.EXE"]);
        assert_eq!(
            wine_exe_from_cmdline(&c, false),
            Some("launcher".to_string())
        );
    }
}
