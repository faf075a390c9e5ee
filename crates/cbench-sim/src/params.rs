//! Engine command-line composition.
//!
//! A [`ParameterSet`] is an ordered list of named parameters. Each one is
//! either a constant flag or a function of the node's zero-based index
//! within its role, resolved per node into a flat argument vector. Empty
//! values are dropped, and the shared start-time flags always come last
//! since some consumers pass everything after them through untouched.

use std::fmt;
use std::sync::Arc;

use chrono::Local;

use cbench_core::Role;

use crate::settings::Settings;

/// Format of the shared `--wait-until` timestamp.
pub const WAIT_UNTIL_FORMAT: &str = "%Y-%m-%d %H:%M:%S%z";

/// Node-address file read by every engine role.
pub const SERVER_IP_FILE: &str = "serverip.txt";

pub type IndexFn = Arc<dyn Fn(usize) -> Vec<String> + Send + Sync>;

/// One named parameter value.
#[derive(Clone)]
pub enum Param {
    Constant(String),
    PerIndex(IndexFn),
}

impl Param {
    pub fn per_index(f: impl Fn(usize) -> Vec<String> + Send + Sync + 'static) -> Self {
        Param::PerIndex(Arc::new(f))
    }

    pub fn resolve(&self, index: usize) -> Vec<String> {
        match self {
            Param::Constant(value) => vec![value.clone()],
            Param::PerIndex(f) => f(index),
        }
    }
}

impl fmt::Debug for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Param::Constant(value) => f.debug_tuple("Constant").field(value).finish(),
            Param::PerIndex(_) => f.write_str("PerIndex(..)"),
        }
    }
}

/// Ordered named parameters for one role.
#[derive(Debug, Clone, Default)]
pub struct ParameterSet {
    entries: Vec<(String, Param)>,
    trailing: Vec<String>,
}

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: &str, param: Param) -> &mut Self {
        self.entries.push((name.to_string(), param));
        self
    }

    /// Add `--<flag>=<value>`, unless `value` is empty.
    pub fn flag(&mut self, flag: &str, value: impl fmt::Display) -> &mut Self {
        let value = value.to_string();
        if !value.trim().is_empty() {
            self.push(flag, Param::Constant(format!("--{flag}={value}")));
        }
        self
    }

    /// Add a bare switch such as `--debug` when `enabled`.
    pub fn switch(&mut self, flag: &str, enabled: bool) -> &mut Self {
        if enabled {
            self.push(flag, Param::Constant(format!("--{flag}")));
        }
        self
    }

    /// Append the shared start-time flags, replacing any previous ones.
    pub fn with_wait(mut self, wait_until: &str, wait_additional: &str) -> Self {
        self.trailing.clear();
        self.trailing.push(format!("--wait-until={wait_until}"));
        if !wait_additional.is_empty() {
            self.trailing.push(format!("--wait-additional={wait_additional}"));
        }
        self
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names().any(|n| n == name)
    }

    /// Flat argument vector for the node at `index` within its role.
    pub fn resolve(&self, index: usize) -> Vec<String> {
        self.entries
            .iter()
            .flat_map(|(_, param)| param.resolve(index))
            .chain(self.trailing.iter().cloned())
            .filter(|arg| !arg.trim().is_empty())
            .collect()
    }
}

/// Values that depend on where the run was placed, resolved by the caller
/// instead of being written back into [`Settings`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunContext {
    /// CRAQ prefix for object segmentation.
    pub unique: String,
    /// Host space servers contact for coordination; empty when none.
    pub cseg_service_host: String,
    /// `host:port` of every index server, in role order.
    pub index_endpoints: Vec<(String, u16)>,
    /// 1-based deployment position of every object host, in role order.
    /// The engine names per-host output after this id, so it must match
    /// the slot's `--id`.
    pub object_host_ids: Vec<usize>,
}

/// Builds per-role parameter sets from one [`Settings`] value.
#[derive(Debug, Clone)]
pub struct ParameterComposer {
    settings: Settings,
    ctx: RunContext,
}

impl ParameterComposer {
    pub fn new(settings: &Settings, ctx: RunContext) -> Self {
        Self {
            settings: settings.clone(),
            ctx,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Full parameter set for `role`: shared flags, then role flags.
    pub fn compose(&self, role: Role) -> ParameterSet {
        let mut set = ParameterSet::new();
        self.debug_params(&mut set);
        self.common_params(&mut set);
        match role {
            Role::Space => self.space_params(&mut set),
            Role::ObjectHost => self.oh_params(&mut set),
            Role::Cseg => self.cseg_params(&mut set),
            Role::Index => self.index_params(&mut set),
            Role::Analysis => self.vis_params(&mut set),
        }
        if let Some(levels) = self.settings.moduleloglevel() {
            set.flag("moduleloglevel", levels);
        }
        set
    }

    /// Single object-host pass that generates the shared object pack.
    ///
    /// Composed from a private copy of the settings, so the main-run
    /// composition is unaffected.
    pub fn pack_generation(&self) -> ParameterSet {
        let generation = Settings {
            num_random_objects: self.settings.num_pack_objects,
            num_pack_objects: 0,
            ..self.settings.clone()
        };
        // runs alone on the first deployment slot
        let ctx = RunContext {
            object_host_ids: vec![1],
            ..self.ctx.clone()
        };
        let composer = ParameterComposer::new(&generation, ctx);
        let mut set = composer.compose(Role::ObjectHost);
        set.flag("object.pack-dump", &self.settings.object_pack);
        set
    }

    fn debug_params(&self, set: &mut ParameterSet) {
        set.switch("debug", self.settings.debug)
            .switch("valgrind", self.settings.valgrind);
        if self.settings.profile {
            set.flag("profile", true);
        }
    }

    fn common_params(&self, set: &mut ParameterSet) {
        let s = &self.settings;
        set.flag("net", "tcp")
            .flag("layout", s.layout())
            .flag("num-oh", s.num_oh)
            .flag("region", s.region())
            .flag("serverips", SERVER_IP_FILE)
            .flag("duration", &s.duration)
            .flag("send-bandwidth", s.tx_bandwidth)
            .flag("receive-bandwidth", s.rx_bandwidth)
            .flag("gaussian", s.gaussian)
            .flag("flatness", s.flatness)
            .flag("capexcessbandwidth", s.capexcessbandwidth)
            .flag("server.queue", &s.server_queue)
            .flag("server.queue.length", s.server_queue_length)
            .flag("loc", &s.loc)
            .flag("cseg", &s.cseg)
            .flag("cseg-service-host", &self.ctx.cseg_service_host)
            .flag("cseg-service-tcp-port", s.cseg_service_tcp_port)
            .flag("max-servers", s.space_server_pool)
            .flag("num-cseg-servers", s.num_cseg_servers())
            .flag("cseg-serverips", &s.cseg_ip_file)
            .flag("oseg", &s.oseg)
            .flag("oseg_unique_craq_prefix", &self.ctx.unique)
            .flag("object_drift_x", &s.object_drift_x)
            .flag("object_drift_y", &s.object_drift_y)
            .flag("object_drift_z", &s.object_drift_z)
            .flag("oseg_analyze_after", &s.oseg_analyze_after)
            .flag("oseg_lookup_queue_size", s.oseg_lookup_queue_size)
            .flag("oseg-cache-size", s.oseg_cache_size)
            .flag("oseg-cache-clean-group-size", s.oseg_cache_clean_group)
            .flag("oseg-cache-entry-lifetime", &s.oseg_cache_entry_lifetime);
    }

    fn space_params(&self, set: &mut ParameterSet) {
        if let Some((host, port)) = self.ctx.index_endpoints.first() {
            set.flag("pinto", "master")
                .flag("pinto-options", format!("--host={host} --port={port}"));
        }
    }

    fn oh_params(&self, set: &mut ParameterSet) {
        let s = &self.settings;
        let ids = self.ctx.object_host_ids.clone();
        set.push(
            "ohid",
            Param::per_index(move |index| {
                let id = ids.get(index).copied().unwrap_or(index + 1);
                vec![format!("--ohid={id}")]
            }),
        );
        set.flag("object.connect", &s.object_connect_phase)
            .flag("object.num.random", s.num_random_objects)
            .flag("object.static", &s.object_static)
            .flag("object.simple", s.object_simple)
            .flag("object.2d", s.object_2d)
            .flag("object.num.pack", s.num_pack_objects)
            .flag("object.pack", &s.object_pack)
            .flag("scenario", &s.scenario)
            .flag("scenario-options", &s.scenario_options);
        if s.num_pack_objects > 0 {
            let per_server = s.oh_objects_per_server();
            set.push(
                "packoffset",
                Param::per_index(move |index| {
                    vec![format!("--object.pack-offset={}", index as u64 * per_server)]
                }),
            );
        }
    }

    fn cseg_params(&self, set: &mut ParameterSet) {
        set.push(
            "csegid",
            Param::per_index(|index| vec![format!("--cseg-id={}", index + 1)]),
        );
    }

    fn index_params(&self, set: &mut ParameterSet) {
        let ports: Vec<u16> = self.ctx.index_endpoints.iter().map(|(_, p)| *p).collect();
        set.push(
            "port",
            Param::per_index(move |index| {
                ports
                    .get(index)
                    .map(|port| vec![format!("--port={port}")])
                    .unwrap_or_default()
            }),
        );
        set.flag("handler", &self.settings.index_handler);
    }

    fn vis_params(&self, set: &mut ParameterSet) {
        let mode = self.settings.vis_mode.clone();
        let seed = self.settings.vis_seed;
        set.push(
            "vis",
            Param::per_index(move |_| {
                vec![
                    format!("--analysis.locvis={mode}"),
                    format!("--analysis.locvis.seed={seed}"),
                ]
            }),
        );
    }
}

/// Current local time in the `--wait-until` format.
pub fn wait_until_now() -> String {
    Local::now().format(WAIT_UNTIL_FORMAT).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn composer(settings: Settings) -> ParameterComposer {
        ParameterComposer::new(
            &settings,
            RunContext {
                unique: "exp1".into(),
                cseg_service_host: String::new(),
                index_endpoints: vec![],
                object_host_ids: vec![],
            },
        )
    }

    #[test]
    fn composition_is_idempotent() {
        let c = composer(Settings {
            num_pack_objects: 50,
            ..Settings::default()
        });
        for role in [Role::Space, Role::ObjectHost, Role::Cseg, Role::Index, Role::Analysis] {
            for index in 0..3 {
                assert_eq!(
                    c.compose(role).with_wait("t", "10s").resolve(index),
                    c.compose(role).with_wait("t", "10s").resolve(index)
                );
            }
        }
    }

    #[test]
    fn pack_offset_scales_with_index() {
        let c = composer(Settings {
            num_random_objects: 100,
            num_pack_objects: 50,
            ..Settings::default()
        });
        let args = c.compose(Role::ObjectHost).resolve(2);
        assert!(args.contains(&"--object.pack-offset=300".to_string()));
        assert!(args.contains(&"--ohid=3".to_string()));
    }

    #[test]
    fn ohid_follows_deployment_position() {
        let c = ParameterComposer::new(
            &Settings::default(),
            RunContext {
                object_host_ids: vec![5, 6],
                ..RunContext::default()
            },
        );
        let set = c.compose(Role::ObjectHost);
        assert!(set.resolve(0).contains(&"--ohid=5".to_string()));
        assert!(set.resolve(1).contains(&"--ohid=6".to_string()));
        assert!(c.pack_generation().resolve(0).contains(&"--ohid=1".to_string()));
    }

    #[test]
    fn no_pack_offset_without_pack_objects() {
        let args = composer(Settings::default()).compose(Role::ObjectHost).resolve(0);
        assert!(!args.iter().any(|a| a.starts_with("--object.pack-offset")));
    }

    #[test]
    fn role_specific_flags_stay_in_their_role() {
        let c = composer(Settings::default());
        let space = c.compose(Role::Space).resolve(0);
        assert!(!space.iter().any(|a| a.starts_with("--ohid")));
        assert!(!space.iter().any(|a| a.starts_with("--cseg-id")));

        let cseg = c.compose(Role::Cseg).resolve(1);
        assert!(cseg.contains(&"--cseg-id=2".to_string()));
    }

    #[test]
    fn empty_values_are_never_emitted() {
        let c = composer(Settings {
            scenario_options: String::new(),
            ..Settings::default()
        });
        let args = c.compose(Role::ObjectHost).resolve(0);
        assert!(!args.iter().any(|a| a.ends_with('=')));
        assert!(!args.iter().any(|a| a.starts_with("--cseg-service-host")));
        assert!(!args.iter().any(|a| a.starts_with("--scenario-options")));
    }

    #[test]
    fn wait_flags_come_last() {
        let args = composer(Settings::default())
            .compose(Role::Space)
            .with_wait("2026-01-01 00:00:00+0000", "10s")
            .resolve(0);
        let n = args.len();
        assert_eq!(args[n - 2], "--wait-until=2026-01-01 00:00:00+0000");
        assert_eq!(args[n - 1], "--wait-additional=10s");
    }

    #[test]
    fn debug_flags_follow_settings() {
        let args = composer(Settings::default()).compose(Role::Space).resolve(0);
        assert_eq!(args[0], "--debug");
        assert_eq!(args[1], "--profile=true");
        assert!(!args.contains(&"--valgrind".to_string()));

        let args = composer(Settings {
            debug: false,
            profile: false,
            valgrind: true,
            ..Settings::default()
        })
        .compose(Role::Space)
        .resolve(0);
        assert_eq!(args[0], "--valgrind");
        assert!(!args.contains(&"--debug".to_string()));
    }

    #[test]
    fn pack_generation_leaves_main_run_untouched() {
        let settings = Settings {
            num_random_objects: 100,
            num_pack_objects: 500,
            ..Settings::default()
        };
        let c = composer(settings.clone());
        let before = c.compose(Role::ObjectHost).resolve(0);
        let generation = c.pack_generation().resolve(0);
        let after = c.compose(Role::ObjectHost).resolve(0);

        assert_eq!(before, after);
        assert_eq!(c.settings(), &settings);
        assert!(generation.contains(&"--object.num.random=500".to_string()));
        assert!(generation.contains(&"--object.num.pack=0".to_string()));
        assert!(generation.contains(&format!("--object.pack-dump={}", settings.object_pack)));
        assert!(!generation.iter().any(|a| a.starts_with("--object.pack-offset")));
    }

    #[test]
    fn index_and_space_see_index_endpoints() {
        let c = ParameterComposer::new(
            &Settings::default(),
            RunContext {
                unique: "u".into(),
                cseg_service_host: "n03".into(),
                index_endpoints: vec![("n05".into(), 6680)],
                ..RunContext::default()
            },
        );
        let index = c.compose(Role::Index).resolve(0);
        assert!(index.contains(&"--port=6680".to_string()));
        assert!(index.contains(&"--handler=rtreecut".to_string()));

        let space = c.compose(Role::Space).resolve(0);
        assert!(space.contains(&"--pinto=master".to_string()));
        assert!(space.contains(&"--pinto-options=--host=n05 --port=6680".to_string()));
        assert!(space.contains(&"--cseg-service-host=n03".to_string()));
    }

    #[test]
    fn vis_emits_two_flags() {
        let args = composer(Settings::default()).compose(Role::Analysis).resolve(0);
        assert!(args.contains(&"--analysis.locvis=object".to_string()));
        assert!(args.contains(&"--analysis.locvis.seed=1".to_string()));
    }
}
