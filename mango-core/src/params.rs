//! The typed params record.
//!
//! Built from the option list the config loader produces, at first frame
//! and again on every reload keypress or control command. A `Params` value
//! is immutable once built; the overlay context swaps the whole `Arc`.

use std::path::PathBuf;

use smallvec::SmallVec;
use types::{FpsLimitMethod, Position};

/// One key combination, e.g. `Shift_R+F12`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Keybind(pub SmallVec<[String; 2]>);

impl Keybind {
    pub fn parse(value: &str) -> Self {
        Self(
            value
                .split('+')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn keys(&self) -> &[String] {
        &self.0
    }
}

/// How the GL hook learns the drawable size before positioning the HUD.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum GlSizeQuery {
    /// Ask the windowing system (GLX/EGL drawable query).
    #[default]
    Drawable,
    Viewport,
    ScissorBox,
}

/// Per-metric display toggles.
#[derive(Clone, Debug)]
pub struct EnabledMetrics {
    pub fps: bool,
    pub frametime: bool,
    pub frame_timing: bool,
    pub cpu_stats: bool,
    pub gpu_stats: bool,
    pub cpu_temp: bool,
    pub gpu_temp: bool,
    pub gpu_junction_temp: bool,
    pub gpu_mem_temp: bool,
    pub cpu_power: bool,
    pub gpu_power: bool,
    pub cpu_mhz: bool,
    pub core_load: bool,
    pub gpu_core_clock: bool,
    pub gpu_mem_clock: bool,
    pub gpu_fan: bool,
    pub gpu_voltage: bool,
    pub ram: bool,
    pub swap: bool,
    pub vram: bool,
    pub gtt: bool,
    pub io_read: bool,
    pub io_write: bool,
    pub throttling_status: bool,
    pub engine_version: bool,
    pub gpu_name: bool,
    pub time: bool,
}

impl Default for EnabledMetrics {
    fn default() -> Self {
        Self {
            fps: true,
            frametime: true,
            frame_timing: true,
            cpu_stats: true,
            gpu_stats: true,
            cpu_temp: false,
            gpu_temp: false,
            gpu_junction_temp: false,
            gpu_mem_temp: false,
            cpu_power: false,
            gpu_power: false,
            cpu_mhz: false,
            core_load: false,
            gpu_core_clock: false,
            gpu_mem_clock: false,
            gpu_fan: false,
            gpu_voltage: false,
            ram: false,
            swap: false,
            vram: false,
            gtt: false,
            io_read: false,
            io_write: false,
            throttling_status: false,
            engine_version: false,
            gpu_name: false,
            time: false,
        }
    }
}

/// RGB color override, `0xRRGGBB`.
pub type Rgb = u32;

#[derive(Clone, Debug)]
pub struct Params {
    pub enabled: EnabledMetrics,

    pub fps_limit: Vec<u32>,
    pub fps_limit_method: FpsLimitMethod,
    pub fps_sampling_period_ms: u64,

    pub position: Position,
    pub no_display: bool,
    pub width: u32,
    pub height: u32,
    pub offset_x: i32,
    pub offset_y: i32,
    pub background_alpha: f32,
    pub alpha: f32,
    pub font_size: f32,
    pub font_scale: f32,
    pub font_file: Option<PathBuf>,
    pub table_columns: u32,

    pub cpu_color: Rgb,
    pub gpu_color: Rgb,
    pub vram_color: Rgb,
    pub ram_color: Rgb,
    pub io_color: Rgb,
    pub engine_color: Rgb,
    pub frametime_color: Rgb,
    pub background_color: Rgb,
    pub text_color: Rgb,

    pub toggle_hud: Keybind,
    pub toggle_hud_position: Keybind,
    pub toggle_logging: Keybind,
    pub toggle_fps_limit: Keybind,
    pub toggle_preset: Keybind,
    pub reload_cfg: Keybind,
    pub upload_log: Keybind,
    pub upload_logs: Keybind,
    pub reset_fps_metrics: Keybind,

    pub output_folder: Option<PathBuf>,
    pub log_duration_s: u64,
    pub log_interval_ms: u64,
    pub autostart_log_s: u64,
    pub permit_upload: bool,
    pub benchmark_percentiles: Vec<String>,

    pub preset: Vec<i32>,
    pub blacklist: Vec<String>,
    pub control: Option<String>,

    pub otel: bool,
    pub otel_listen: String,
    pub otel_interval_ms: u64,
    pub otel_startup_delay_s: u64,

    pub gl_size_query: GlSizeQuery,

    /// The file the options came from, for reload diagnostics.
    pub config_file_path: Option<PathBuf>,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            enabled: EnabledMetrics::default(),
            fps_limit: vec![0],
            fps_limit_method: FpsLimitMethod::default(),
            fps_sampling_period_ms: 500,
            position: Position::default(),
            no_display: false,
            width: 0,
            height: 140,
            offset_x: 0,
            offset_y: 0,
            background_alpha: 0.5,
            alpha: 1.0,
            font_size: 24.0,
            font_scale: 1.0,
            font_file: None,
            table_columns: 3,
            cpu_color: 0x2e97cb,
            gpu_color: 0x2e9762,
            vram_color: 0xad64c1,
            ram_color: 0xc26693,
            io_color: 0xa491d3,
            engine_color: 0xeb5b5b,
            frametime_color: 0x00ff00,
            background_color: 0x020202,
            text_color: 0xffffff,
            toggle_hud: Keybind::parse("Shift_R+F12"),
            toggle_hud_position: Keybind::parse("Shift_R+F11"),
            toggle_logging: Keybind::parse("Shift_L+F2"),
            toggle_fps_limit: Keybind::parse("Shift_L+F1"),
            toggle_preset: Keybind::parse("Shift_R+F10"),
            reload_cfg: Keybind::parse("Shift_L+F4"),
            upload_log: Keybind::parse("Shift_L+F3"),
            upload_logs: Keybind::parse("Control_L+F3"),
            reset_fps_metrics: Keybind::parse("Shift_L+F9"),
            output_folder: None,
            log_duration_s: 0,
            log_interval_ms: 100,
            autostart_log_s: 0,
            permit_upload: false,
            benchmark_percentiles: vec!["97".into(), "AVG".into(), "1".into(), "0.1".into()],
            preset: Vec::new(),
            blacklist: Vec::new(),
            control: None,
            otel: false,
            otel_listen: "0.0.0.0:9869".into(),
            otel_interval_ms: 1000,
            otel_startup_delay_s: 0,
            gl_size_query: GlSizeQuery::default(),
            config_file_path: None,
        }
    }
}

fn parse_bool(value: &str) -> bool {
    !matches!(value.trim(), "" | "0" | "false" | "no" | "off")
}

fn parse_list_u32(value: &str) -> Vec<u32> {
    value
        .split([',', '+'])
        .filter_map(|v| v.trim().parse().ok())
        .collect()
}

fn parse_list_i32(value: &str) -> Vec<i32> {
    value
        .split([',', '+'])
        .filter_map(|v| v.trim().parse().ok())
        .collect()
}

fn parse_color(value: &str) -> Option<Rgb> {
    let v = value.trim().trim_start_matches('#');
    u32::from_str_radix(v, 16).ok().filter(|c| *c <= 0xFF_FF_FF)
}

fn parse_position(value: &str) -> Option<Position> {
    match value.trim() {
        "top-left" => Some(Position::TopLeft),
        "top-right" => Some(Position::TopRight),
        "bottom-left" => Some(Position::BottomLeft),
        "bottom-right" => Some(Position::BottomRight),
        _ => None,
    }
}

macro_rules! set_or_warn {
    ($field:expr, $parsed:expr, $key:expr, $value:expr) => {
        match $parsed {
            Some(v) => $field = v,
            None => log::warn!("invalid value '{}' for option '{}', keeping previous", $value, $key),
        }
    };
}

impl Params {
    /// Apply one `key=value` option in place.
    pub fn apply_option(&mut self, key: &str, value: &str) {
        match key {
            "fps" => self.enabled.fps = parse_bool(value),
            "frametime" => self.enabled.frametime = parse_bool(value),
            "frame_timing" => self.enabled.frame_timing = parse_bool(value),
            "cpu_stats" => self.enabled.cpu_stats = parse_bool(value),
            "gpu_stats" => self.enabled.gpu_stats = parse_bool(value),
            "cpu_temp" => self.enabled.cpu_temp = parse_bool(value),
            "gpu_temp" => self.enabled.gpu_temp = parse_bool(value),
            "gpu_junction_temp" => self.enabled.gpu_junction_temp = parse_bool(value),
            "gpu_mem_temp" => self.enabled.gpu_mem_temp = parse_bool(value),
            "cpu_power" => self.enabled.cpu_power = parse_bool(value),
            "gpu_power" => self.enabled.gpu_power = parse_bool(value),
            "cpu_mhz" => self.enabled.cpu_mhz = parse_bool(value),
            "core_load" => self.enabled.core_load = parse_bool(value),
            "gpu_core_clock" => self.enabled.gpu_core_clock = parse_bool(value),
            "gpu_mem_clock" => self.enabled.gpu_mem_clock = parse_bool(value),
            "gpu_fan" => self.enabled.gpu_fan = parse_bool(value),
            "gpu_voltage" => self.enabled.gpu_voltage = parse_bool(value),
            "ram" => self.enabled.ram = parse_bool(value),
            "swap" => self.enabled.swap = parse_bool(value),
            "vram" => self.enabled.vram = parse_bool(value),
            "gtt" => self.enabled.gtt = parse_bool(value),
            "io_read" => self.enabled.io_read = parse_bool(value),
            "io_write" => self.enabled.io_write = parse_bool(value),
            "throttling_status" => self.enabled.throttling_status = parse_bool(value),
            "engine_version" => self.enabled.engine_version = parse_bool(value),
            "gpu_name" => self.enabled.gpu_name = parse_bool(value),
            "time" => self.enabled.time = parse_bool(value),
            "full" => {
                // Everything on, in one switch.
                let on = parse_bool(value);
                if on {
                    self.enabled = EnabledMetrics {
                        fps: true,
                        frametime: true,
                        frame_timing: true,
                        cpu_stats: true,
                        gpu_stats: true,
                        cpu_temp: true,
                        gpu_temp: true,
                        gpu_junction_temp: true,
                        gpu_mem_temp: true,
                        cpu_power: true,
                        gpu_power: true,
                        cpu_mhz: true,
                        core_load: true,
                        gpu_core_clock: true,
                        gpu_mem_clock: true,
                        gpu_fan: true,
                        gpu_voltage: true,
                        ram: true,
                        swap: true,
                        vram: true,
                        gtt: true,
                        io_read: true,
                        io_write: true,
                        throttling_status: true,
                        engine_version: true,
                        gpu_name: true,
                        time: true,
                    };
                }
            }

            "fps_limit" => {
                let list = parse_list_u32(value);
                set_or_warn!(
                    self.fps_limit,
                    (!list.is_empty()).then_some(list),
                    key,
                    value
                );
            }
            "fps_limit_method" => {
                let method = match value.trim() {
                    "early" => Some(FpsLimitMethod::Early),
                    "late" => Some(FpsLimitMethod::Late),
                    _ => None,
                };
                set_or_warn!(self.fps_limit_method, method, key, value);
            }
            "fps_sampling_period" => {
                set_or_warn!(
                    self.fps_sampling_period_ms,
                    value.trim().parse().ok(),
                    key,
                    value
                );
            }

            "position" => set_or_warn!(self.position, parse_position(value), key, value),
            "no_display" => self.no_display = parse_bool(value),
            "width" => set_or_warn!(self.width, value.trim().parse().ok(), key, value),
            "height" => set_or_warn!(self.height, value.trim().parse().ok(), key, value),
            "offset_x" => set_or_warn!(self.offset_x, value.trim().parse().ok(), key, value),
            "offset_y" => set_or_warn!(self.offset_y, value.trim().parse().ok(), key, value),
            "background_alpha" => {
                set_or_warn!(self.background_alpha, value.trim().parse().ok(), key, value)
            }
            "alpha" => set_or_warn!(self.alpha, value.trim().parse().ok(), key, value),
            "font_size" => set_or_warn!(self.font_size, value.trim().parse().ok(), key, value),
            "font_scale" => set_or_warn!(self.font_scale, value.trim().parse().ok(), key, value),
            "font_file" => self.font_file = Some(PathBuf::from(value.trim())),
            "table_columns" => {
                set_or_warn!(self.table_columns, value.trim().parse().ok(), key, value)
            }

            "cpu_color" => set_or_warn!(self.cpu_color, parse_color(value), key, value),
            "gpu_color" => set_or_warn!(self.gpu_color, parse_color(value), key, value),
            "vram_color" => set_or_warn!(self.vram_color, parse_color(value), key, value),
            "ram_color" => set_or_warn!(self.ram_color, parse_color(value), key, value),
            "io_color" => set_or_warn!(self.io_color, parse_color(value), key, value),
            "engine_color" => set_or_warn!(self.engine_color, parse_color(value), key, value),
            "frametime_color" => {
                set_or_warn!(self.frametime_color, parse_color(value), key, value)
            }
            "background_color" => {
                set_or_warn!(self.background_color, parse_color(value), key, value)
            }
            "text_color" => set_or_warn!(self.text_color, parse_color(value), key, value),

            "toggle_hud" => self.toggle_hud = Keybind::parse(value),
            "toggle_hud_position" => self.toggle_hud_position = Keybind::parse(value),
            "toggle_logging" => self.toggle_logging = Keybind::parse(value),
            "toggle_fps_limit" => self.toggle_fps_limit = Keybind::parse(value),
            "toggle_preset" => self.toggle_preset = Keybind::parse(value),
            "reload_cfg" => self.reload_cfg = Keybind::parse(value),
            "upload_log" => self.upload_log = Keybind::parse(value),
            "upload_logs" => self.upload_logs = Keybind::parse(value),
            "reset_fps_metrics" => self.reset_fps_metrics = Keybind::parse(value),

            "output_folder" | "output_file" => {
                self.output_folder = Some(PathBuf::from(value.trim()))
            }
            "log_duration" => {
                set_or_warn!(self.log_duration_s, value.trim().parse().ok(), key, value)
            }
            "log_interval" => {
                set_or_warn!(self.log_interval_ms, value.trim().parse().ok(), key, value)
            }
            "autostart_log" => {
                set_or_warn!(self.autostart_log_s, value.trim().parse().ok(), key, value)
            }
            "permit_upload" => self.permit_upload = parse_bool(value),
            "benchmark_percentiles" => {
                self.benchmark_percentiles = value
                    .split([',', '+'])
                    .map(|p| p.trim().to_string())
                    .filter(|p| !p.is_empty())
                    .collect();
            }

            "preset" => self.preset = parse_list_i32(value),
            "blacklist" => {
                self.blacklist = value
                    .split(',')
                    .map(|item| item.trim().to_string())
                    .filter(|item| !item.is_empty())
                    .collect();
            }
            "control" => {
                let name = value.trim();
                self.control = (!name.is_empty()).then(|| name.to_string());
            }

            "otel" => self.otel = parse_bool(value),
            "otel_listen" => self.otel_listen = value.trim().to_string(),
            "otel_interval_ms" => {
                set_or_warn!(self.otel_interval_ms, value.trim().parse().ok(), key, value)
            }
            "otel_startup_delay_s" => set_or_warn!(
                self.otel_startup_delay_s,
                value.trim().parse().ok(),
                key,
                value
            ),

            "gl_size_query" => {
                let query = match value.trim() {
                    "viewport" => Some(GlSizeQuery::Viewport),
                    "scissorbox" => Some(GlSizeQuery::ScissorBox),
                    "drawable" => Some(GlSizeQuery::Drawable),
                    _ => None,
                };
                set_or_warn!(self.gl_size_query, query, key, value);
            }

            "read_cfg" | "legacy_layout" | "version" => {}

            _ => log::debug!("unknown option '{key}'"),
        }
    }

    /// Build a record from an ordered option list; later entries win.
    pub fn from_options<'a, I>(options: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut params = Self::default();
        for (key, value) in options {
            params.apply_option(key, value);
        }
        params
    }
}

/// Built-in preset option sets, cycled by the preset keybind.
pub fn preset_options(preset: i32) -> Vec<(String, String)> {
    let kv = |pairs: &[(&str, &str)]| {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    };
    match preset {
        0 => kv(&[("no_display", "1")]),
        1 => kv(&[
            ("cpu_stats", "0"),
            ("gpu_stats", "0"),
            ("frametime", "0"),
            ("frame_timing", "0"),
            ("fps", "1"),
        ]),
        2 => kv(&[
            ("table_columns", "20"),
            ("frame_timing", "1"),
            ("fps", "1"),
        ]),
        3 => kv(&[
            ("cpu_temp", "1"),
            ("gpu_temp", "1"),
            ("ram", "1"),
            ("vram", "1"),
            ("cpu_power", "1"),
            ("gpu_power", "1"),
            ("gpu_core_clock", "1"),
            ("gpu_mem_clock", "1"),
        ]),
        4 => kv(&[("full", "1")]),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let p = Params::default();
        assert_eq!(p.fps_limit, vec![0]);
        assert_eq!(p.fps_sampling_period_ms, 500);
        assert_eq!(p.fps_limit_method, FpsLimitMethod::Late);
        assert!(p.enabled.fps);
        assert!(!p.enabled.gpu_power);
    }

    #[test]
    fn option_application() {
        let p = Params::from_options([
            ("fps_limit", "30,60,0"),
            ("fps_limit_method", "early"),
            ("position", "bottom-right"),
            ("gpu_temp", "1"),
            ("cpu_color", "ff00aa"),
            ("toggle_hud", "Shift_L+F11"),
            ("control", "mangohud"),
        ]);
        assert_eq!(p.fps_limit, vec![30, 60, 0]);
        assert_eq!(p.fps_limit_method, FpsLimitMethod::Early);
        assert_eq!(p.position, Position::BottomRight);
        assert!(p.enabled.gpu_temp);
        assert_eq!(p.cpu_color, 0xff00aa);
        assert_eq!(
            p.toggle_hud.keys(),
            ["Shift_L".to_string(), "F11".to_string()]
        );
        assert_eq!(p.control.as_deref(), Some("mangohud"));
    }

    #[test]
    fn invalid_values_keep_previous() {
        let mut p = Params::default();
        p.apply_option("fps_limit", "banana");
        assert_eq!(p.fps_limit, vec![0]);
        p.apply_option("position", "under-the-desk");
        assert_eq!(p.position, Position::TopLeft);
        p.apply_option("cpu_color", "not-a-color");
        assert_eq!(p.cpu_color, Params::default().cpu_color);
    }

    #[test]
    fn later_options_win() {
        let p = Params::from_options([("fps_limit", "60"), ("fps_limit", "30")]);
        assert_eq!(p.fps_limit, vec![30]);
    }

    #[test]
    fn preset_fps_only() {
        let options = preset_options(1);
        let mut p = Params::default();
        for (k, v) in &options {
            p.apply_option(k, v);
        }
        assert!(p.enabled.fps);
        assert!(!p.enabled.cpu_stats);
        assert!(!p.enabled.gpu_stats);
    }
}
