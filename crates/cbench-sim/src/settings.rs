//! Simulation settings (`sim.toml`).
//!
//! Every field has a default, so an empty or missing file yields the
//! reference 2x2 run with one object host.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use cbench_core::ClusterConfig;

use crate::error::{SimError, SimResult};

/// Default settings file name.
pub const DEFAULT_SETTINGS_FILE: &str = "sim.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    // Space layout
    pub space_server_pool: usize,
    pub layout_x: u32,
    pub layout_y: u32,
    pub blocksize: f64,
    pub center: [f64; 3],

    // Run
    pub duration: String,
    pub wait_additional: String,
    pub tx_bandwidth: u64,
    pub rx_bandwidth: u64,
    pub gaussian: bool,
    pub flatness: u32,
    pub capexcessbandwidth: bool,
    pub server_queue: String,
    pub server_queue_length: u32,
    pub loc: String,

    // Object hosts
    pub num_oh: usize,
    pub object_connect_phase: String,
    pub num_random_objects: u64,
    pub object_static: String,
    pub object_drift_x: String,
    pub object_drift_y: String,
    pub object_drift_z: String,
    pub object_simple: bool,
    pub object_2d: bool,
    pub num_pack_objects: u64,
    pub object_pack: String,
    /// Run the single-node pack generation pass before the main run.
    pub generate_pack: bool,
    pub scenario: String,
    pub scenario_options: String,

    // Coordination segment
    pub cseg: String,
    /// Overrides the derived count (1 for `cseg = "client"`, else 0).
    pub num_cseg_servers: Option<usize>,
    /// Resolved from the first cseg node when unset.
    pub cseg_service_host: Option<String>,
    pub cseg_service_tcp_port: u16,
    pub cseg_ip_file: String,

    // Index (pinto)
    pub num_index_servers: usize,
    pub index_handler: String,

    // Object segmentation
    pub oseg: String,
    pub oseg_lookup_queue_size: u32,
    pub oseg_unique_craq_prefix: String,
    pub oseg_analyze_after: String,
    pub oseg_cache_size: u32,
    pub oseg_cache_clean_group: u32,
    pub oseg_cache_entry_lifetime: String,

    // Visualisation
    pub vis_mode: String,
    pub vis_seed: u32,

    // Diagnostics
    pub debug: bool,
    pub valgrind: bool,
    pub profile: bool,
    pub loglevels: BTreeMap<String, String>,
    /// Where the message latency analysis transcript is written.
    pub trace_file: Option<String>,

    // Supervision of local analysis runs
    pub analysis_grace: Option<String>,
    pub analysis_kill: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            space_server_pool: 4,
            layout_x: 2,
            layout_y: 2,
            blocksize: 200.0,
            center: [0.0, 0.0, 0.0],

            duration: "75s".to_string(),
            wait_additional: "10s".to_string(),
            tx_bandwidth: 1_000_000,
            rx_bandwidth: 1_000_000,
            gaussian: false,
            flatness: 500,
            capexcessbandwidth: false,
            server_queue: "fair".to_string(),
            server_queue_length: 8192,
            loc: "standard".to_string(),

            num_oh: 1,
            object_connect_phase: "10s".to_string(),
            num_random_objects: 1000,
            object_static: "static".to_string(),
            object_drift_x: "-10".to_string(),
            object_drift_y: "0".to_string(),
            object_drift_z: "0".to_string(),
            object_simple: true,
            object_2d: true,
            num_pack_objects: 0,
            object_pack: "/home/meru/data/objects.pack".to_string(),
            generate_pack: false,
            scenario: "ping".to_string(),
            scenario_options: "--num-pings-per-second=1000".to_string(),

            cseg: "uniform".to_string(),
            num_cseg_servers: None,
            cseg_service_host: None,
            cseg_service_tcp_port: 6234,
            cseg_ip_file: "cseg_serverip.txt".to_string(),

            num_index_servers: 0,
            index_handler: "rtreecut".to_string(),

            oseg: "oseg_craq".to_string(),
            oseg_lookup_queue_size: 2000,
            oseg_unique_craq_prefix: "M".to_string(),
            oseg_analyze_after: "60".to_string(),
            oseg_cache_size: 200,
            oseg_cache_clean_group: 25,
            oseg_cache_entry_lifetime: "8s".to_string(),

            vis_mode: "object".to_string(),
            vis_seed: 1,

            debug: true,
            valgrind: false,
            profile: true,
            loglevels: BTreeMap::from([("prox".to_string(), "warn".to_string())]),
            trace_file: None,

            analysis_grace: None,
            analysis_kill: None,
        }
    }
}

impl Settings {
    /// Load from `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> SimResult<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "no settings file, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|source| SimError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let settings: Settings = toml::from_str(&content).map_err(|source| SimError::SettingsParse {
            path: path.display().to_string(),
            source,
        })?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> SimResult<()> {
        let needed = self.layout_x as usize * self.layout_y as usize;
        if self.space_server_pool < needed {
            return Err(SimError::Settings(format!(
                "space server pool ({}) not large enough for {}x{} layout",
                self.space_server_pool, self.layout_x, self.layout_y
            )));
        }
        if self.layout_x == 0 || self.layout_y == 0 {
            return Err(SimError::Settings("layout dimensions must be positive".into()));
        }
        Ok(())
    }

    /// `<X,Y,1>`
    pub fn layout(&self) -> String {
        format!("<{},{},1>", self.layout_x, self.layout_y)
    }

    /// Axis-aligned region covering the layout, centred on `center`.
    pub fn region(&self) -> String {
        let half = [
            self.blocksize * self.layout_x as f64 / 2.0,
            self.blocksize * self.layout_y as f64 / 2.0,
            self.blocksize / 2.0,
        ];
        let c = self.center;
        format!(
            "<<{:.6},{:.6},{:.6}>,<{:.6},{:.6},{:.6}>>",
            -half[0] + c[0],
            -half[1] + c[1],
            -half[2] + c[2],
            half[0] + c[0],
            half[1] + c[1],
            half[2] + c[2],
        )
    }

    /// CRAQ prefix: the cluster's `unique` tag, or the settings default.
    pub fn unique(&self, cluster: &ClusterConfig) -> String {
        match &cluster.unique {
            Some(tag) => tag.clone(),
            None => {
                warn!(
                    prefix = %self.oseg_unique_craq_prefix,
                    "using the default CRAQ prefix; set unique in your .cluster file"
                );
                self.oseg_unique_craq_prefix.clone()
            }
        }
    }

    pub fn num_cseg_servers(&self) -> usize {
        self.num_cseg_servers
            .unwrap_or(if self.cseg == "client" { 1 } else { 0 })
    }

    /// Space servers + coordination servers + index servers + object hosts.
    pub fn num_servers(&self) -> usize {
        self.space_server_pool + self.num_cseg_servers() + self.num_index_servers + self.num_oh
    }

    pub fn oh_objects_per_server(&self) -> u64 {
        self.num_random_objects + self.num_pack_objects
    }

    /// `mod=level,...` sorted by module, or `None` when no levels are set.
    pub fn moduleloglevel(&self) -> Option<String> {
        if self.loglevels.is_empty() {
            return None;
        }
        Some(
            self.loglevels
                .iter()
                .map(|(m, l)| format!("{m}={l}"))
                .collect::<Vec<_>>()
                .join(","),
        )
    }

    pub fn runs_pack_generation(&self) -> bool {
        self.generate_pack && self.num_pack_objects > 0
    }
}
