/*! Overlay runtime.
 *
 * This crate owns everything between the present-path hooks and the outside
 * world: the params record and its reload machinery, the frame statistics
 * ring, the FPS percentile engine, the benchmark logger, keybinds, the
 * control socket, the Prometheus exporter and the process blacklist.
 *
 * The `Overlay` context in [`overlay`] glues these together; the Vulkan
 * layer and the GL interposer only ever talk to that context.
 */

pub mod blacklist;
pub mod config;
pub mod control;
pub mod exporter;
pub mod fps_metrics;
pub mod frame_stats;
pub mod keybinds;
pub mod logger;
pub mod overlay;
pub mod params;
pub mod proc_info;

pub use overlay::Overlay;
pub use params::Params;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("i/o error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("no config file found")]
    NotFound,
}
