//! Process blacklist.
//!
//! Launchers, driver query helpers and compositors load Vulkan too; the
//! overlay must stay inert inside them. The verdict is computed once per
//! process and cached; a preset/config reload may force a recheck after
//! user-supplied entries were added.

use std::fs;
use std::path::Path;

use parking_lot::Mutex;

use crate::proc_info;

static DEFAULT_BLACKLIST: &[&str] = &[
    "Amazon Games UI.exe",
    "Battle.net.exe",
    "BethesdaNetLauncher.exe",
    "EADesktop.exe",
    "EALauncher.exe",
    "EpicGamesLauncher.exe",
    "EpicWebHelper.exe",
    "explorer.exe",
    "ffxivlauncher.exe",
    "ffxivlauncher64.exe",
    "GalaxyClient.exe",
    "gamescope",
    "gldriverquery",
    "IGOProxy.exe",
    "IGOProxy64.exe",
    "iexplore.exe",
    "InsurgencyEAC.exe",
    "Launcher",
    "LeagueClient.exe",
    "LeagueClientUxRender.exe",
    "MarneLauncher.exe",
    "monado-service",
    "Origin.exe",
    "OriginThinSetupInternal.exe",
    "REDlauncher.exe",
    "REDprelauncher.exe",
    "RSI Launcher.exe",
    "rundll32.exe",
    "SocialClubHelper.exe",
    "StarCitizen_Launcher.exe",
    "steam",
    "Steam.exe",
    "steamwebhelper",
    "steamwebhelper.exe",
    "tabtip.exe",
    "UplayWebCore.exe",
    "vrcompositor",
    "vulkandriverquery",
    "wine-preloader",
];

struct State {
    entries: Vec<String>,
    verdict: Option<bool>,
    proc_name: String,
}

static STATE: Mutex<Option<State>> = Mutex::new(None);

fn state_mut(guard: &mut Option<State>) -> &mut State {
    guard.get_or_insert_with(|| State {
        entries: DEFAULT_BLACKLIST.iter().map(|s| s.to_string()).collect(),
        verdict: None,
        proc_name: String::new(),
    })
}

/// A GTK library mapped into the process is a strong launcher signal.
fn maps_gtk(map_files_dir: &Path) -> bool {
    let Ok(entries) = fs::read_dir(map_files_dir) else {
        return false;
    };
    entries
        .flatten()
        .filter_map(|entry| fs::read_link(entry.path()).ok())
        .any(|target| target.to_string_lossy().contains("gtk"))
}

fn compute(entries: &[String], proc_name: &str) -> bool {
    let listed = entries.iter().any(|entry| entry == proc_name);
    if listed {
        return true;
    }
    cfg!(target_os = "linux") && maps_gtk(Path::new("/proc/self/map_files"))
}

/// Cached verdict for this process.
pub fn is_blacklisted() -> bool {
    check(false)
}

/// Recompute when `force_recheck` (used after user entries were added).
pub fn check(force_recheck: bool) -> bool {
    let mut guard = STATE.lock();
    let state = state_mut(&mut guard);
    if state.verdict.is_none() || force_recheck {
        if state.proc_name.is_empty() {
            state.proc_name = proc_info::program_name();
        }
        let verdict = compute(&state.entries, &state.proc_name);
        if verdict && state.verdict != Some(true) {
            log::info!("process '{}' is blacklisted", state.proc_name);
        }
        state.verdict = Some(verdict);
    }
    state.verdict.unwrap_or(false)
}

/// Add a user entry; duplicates are ignored. Triggers a recheck.
pub fn add(new_item: &str) {
    {
        let mut guard = STATE.lock();
        let state = state_mut(&mut guard);
        if state.entries.iter().any(|entry| entry == new_item) {
            return;
        }
        state.entries.push(new_item.to_string());
    }
    check(true);
}

#[cfg(test)]
pub(crate) fn reset_for_test(proc_name: &str) {
    let mut guard = STATE.lock();
    *guard = Some(State {
        entries: DEFAULT_BLACKLIST.iter().map(|s| s.to_string()).collect(),
        verdict: None,
        proc_name: proc_name.to_string(),
    });
}

#[cfg(test)]
fn entry_count(item: &str) -> usize {
    let guard = STATE.lock();
    guard
        .as_ref()
        .map(|s| s.entries.iter().filter(|e| e.as_str() == item).count())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    // The verdict cache is process-global; serialize the tests that poke it.
    static TEST_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn default_set_and_idempotent_add() {
        let _lock = TEST_LOCK.lock();
        reset_for_test("definitely-not-blacklisted");
        assert!(!is_blacklisted());

        add("my-launcher");
        add("my-launcher");
        assert_eq!(entry_count("my-launcher"), 1);

        reset_for_test("my-launcher");
        add("my-launcher");
        assert!(check(true));
    }

    #[test]
    fn steam_is_blacklisted() {
        let _lock = TEST_LOCK.lock();
        reset_for_test("steam");
        assert!(check(true));
    }

    #[test]
    fn verdict_is_cached_until_forced() {
        let _lock = TEST_LOCK.lock();
        reset_for_test("some-game");
        assert!(!is_blacklisted());
        // Adding the running process to the list only shows after a recheck,
        // which `add` performs itself.
        add("some-game");
        assert!(is_blacklisted());
    }
}
