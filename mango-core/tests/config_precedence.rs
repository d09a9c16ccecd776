//! End-to-end config precedence: `MANGOHUD_CONFIGFILE` beats the XDG
//! config directory, and the inline `MANGOHUD_CONFIG` beats both.

use mango_core::{config, Params};

fn params_from(loaded: config::LoadedConfig) -> Params {
    Params::from_options(loaded.options.iter().map(|(k, v)| (k.as_str(), v.as_str())))
}

#[test]
fn configfile_env_wins_over_xdg_config() {
    let dir = tempfile::tempdir().unwrap();

    // The XDG-style config says 60...
    let xdg = dir.path().join("config");
    let mangohud_dir = xdg.join("MangoHud");
    std::fs::create_dir_all(&mangohud_dir).unwrap();
    let xdg_conf = mangohud_dir.join("MangoHud.conf");
    std::fs::write(&xdg_conf, "fps_limit=60\n").unwrap();

    // ...the explicit override says 30.
    let override_conf = dir.path().join("a.conf");
    std::fs::write(&override_conf, "fps_limit=30\n").unwrap();

    std::env::set_var("XDG_CONFIG_HOME", &xdg);
    std::env::set_var("MANGOHUD_CONFIGFILE", &override_conf);

    let candidates = config::enumerate_candidates();
    assert_eq!(candidates, vec![override_conf.clone()]);

    let loaded = config::load_from(&candidates, None);
    let params = params_from(loaded);
    assert_eq!(params.fps_limit, vec![30]);

    // Without the override, the XDG config is found.
    std::env::remove_var("MANGOHUD_CONFIGFILE");
    let candidates = config::enumerate_candidates();
    assert!(candidates.contains(&xdg_conf));
    let loaded = config::load_from(&candidates, None);
    let params = params_from(loaded);
    assert_eq!(params.fps_limit, vec![60]);

    // The inline env var layers on top of whichever file won.
    let loaded = config::load_from(
        &config::enumerate_candidates(),
        Some("fps_limit=144".to_string()),
    );
    let params = params_from(loaded);
    assert_eq!(params.fps_limit, vec![144]);

    std::env::remove_var("XDG_CONFIG_HOME");
}
