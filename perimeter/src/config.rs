use std::env;
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use camino::{Utf8Path, Utf8PathBuf};
use cfg_if::cfg_if;
use smol_str::SmolStr;
use tap::prelude::*;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::normalize::clean_fqdn;
use crate::scope::Scope;

const DEFAULT_EVENT_WORKERS: usize = 8;
const DEFAULT_QUEUE_HIGH_WATER: usize = 4096;
const DEFAULT_QUEUE_LOW_WATER: usize = 1024;
const DEFAULT_QUIESCENCE_SECS: u64 = 5;
const DEFAULT_MAX_CONCURRENT_HTTP: usize = 64;
const DEFAULT_MAX_CONCURRENT_DNS: usize = 128;
const DEFAULT_MAX_DEPTH: u32 = 4;

cfg_if! {
    if #[cfg(target_os = "windows")] {
        const APPLICATION_DIR: &str = "Perimeter";
    } else if #[cfg(target_os = "macos")] {
        const APPLICATION_DIR: &str = "Perimeter";
    } else {
        const APPLICATION_DIR: &str = "perimeter";
    }
}

/// Validated runtime configuration.
#[derive(Debug, Clone)]
pub struct Conf {
    pub id: Uuid,
    pub hostname: String,
    pub log_file: Utf8PathBuf,
    pub verbosity_profile: dto::VerbosityProfile,
    pub log_directive: Option<String>,
    pub engine: EngineConf,
    pub scope: Scope,
    pub datasources: Vec<DataSourceConf>,
}

#[derive(Debug, Clone)]
pub struct EngineConf {
    pub event_workers: usize,
    pub queue_high_water: usize,
    pub queue_low_water: usize,
    pub quiescence_window: Duration,
    pub max_concurrent_http: usize,
    pub max_concurrent_dns: usize,
    pub max_depth: u32,
    pub seed: u64,
}

#[derive(Debug, Clone)]
pub struct DataSourceConf {
    pub name: SmolStr,
    pub ttl: Option<Duration>,
    pub rate: Option<u32>,
    pub creds: Vec<dto::Credential>,
}

impl DataSourceConf {
    pub fn first_credential(&self) -> Option<&dto::Credential> {
        self.creds.first()
    }
}

impl Conf {
    pub fn from_conf_file(conf_file: &dto::ConfFile) -> anyhow::Result<Self> {
        let hostname = conf_file
            .hostname
            .clone()
            .unwrap_or_else(|| default_hostname().unwrap_or_else(|| "localhost".to_owned()));

        let data_dir = get_data_dir();

        let log_file = conf_file
            .log_file
            .clone()
            .unwrap_or_else(|| Utf8PathBuf::from("perimeter"))
            .pipe_ref(|path| normalize_data_path(path, &data_dir));

        let engine = conf_file.engine.clone().unwrap_or_default();

        let queue_high_water = engine.queue_high_water.unwrap_or(DEFAULT_QUEUE_HIGH_WATER);
        let queue_low_water = engine.queue_low_water.unwrap_or(DEFAULT_QUEUE_LOW_WATER);

        anyhow::ensure!(
            queue_low_water < queue_high_water,
            "queue_low_water must be below queue_high_water",
        );

        let event_workers = engine.event_workers.unwrap_or(DEFAULT_EVENT_WORKERS);
        anyhow::ensure!(event_workers > 0, "event_workers must be at least 1");

        let engine = EngineConf {
            event_workers,
            queue_high_water,
            queue_low_water,
            quiescence_window: Duration::from_secs(engine.quiescence_secs.unwrap_or(DEFAULT_QUIESCENCE_SECS)),
            max_concurrent_http: engine.max_concurrent_http.unwrap_or(DEFAULT_MAX_CONCURRENT_HTTP),
            max_concurrent_dns: engine.max_concurrent_dns.unwrap_or(DEFAULT_MAX_CONCURRENT_DNS),
            max_depth: engine.max_depth.unwrap_or(DEFAULT_MAX_DEPTH),
            seed: engine.seed.unwrap_or_else(rand::random),
        };

        let scope_conf = conf_file.scope.clone().unwrap_or_default();

        anyhow::ensure!(
            !scope_conf.domains.is_empty() || !scope_conf.cidrs.is_empty() || !scope_conf.asns.is_empty(),
            "scope requires at least one seed (domain, CIDR or ASN)",
        );

        let domains = scope_conf
            .domains
            .iter()
            .map(|raw| clean_fqdn(raw).with_context(|| format!("invalid seed domain: {raw}")))
            .collect::<anyhow::Result<Vec<_>>>()?;

        let scope = Scope::builder()
            .domains(domains)
            .cidrs(scope_conf.cidrs)
            .asns(scope_conf.asns)
            .allow(scope_conf.allow)
            .deny(scope_conf.deny)
            .max_depth(engine.max_depth)
            .build();

        let datasources = conf_file
            .datasources
            .iter()
            .map(|source| DataSourceConf {
                name: source.name.clone(),
                ttl: source.ttl_secs.map(Duration::from_secs),
                rate: source.rate,
                creds: source.creds.clone(),
            })
            .collect();

        Ok(Conf {
            id: conf_file.id.unwrap_or_else(Uuid::new_v4),
            hostname,
            log_file,
            verbosity_profile: conf_file.verbosity_profile.unwrap_or_default(),
            log_directive: conf_file.log_directive.clone(),
            engine,
            scope,
            datasources,
        })
    }

    pub fn datasource(&self, name: &str) -> Option<&DataSourceConf> {
        self.datasources.iter().find(|source| source.name == name)
    }
}

/// Configuration Handle, source of truth for current configuration state
#[derive(Clone, Debug)]
pub struct ConfHandle {
    inner: Arc<ConfHandleInner>,
}

#[derive(Debug)]
struct ConfHandleInner {
    conf: parking_lot::RwLock<Arc<Conf>>,
    conf_file: parking_lot::RwLock<Arc<dto::ConfFile>>,
    changed: Notify,
}

impl ConfHandle {
    /// Initializes configuration for this instance.
    ///
    /// It's best to call this only once to avoid inconsistencies.
    pub fn init() -> anyhow::Result<Self> {
        let conf_file = load_conf_file_or_generate_new()?;
        let conf = Conf::from_conf_file(&conf_file).context("invalid configuration file")?;
        Ok(Self::wrap(conf, conf_file))
    }

    #[doc(hidden)]
    pub fn mock(yaml_config: &str) -> anyhow::Result<Self> {
        let conf_file = serde_yaml::from_str::<dto::ConfFile>(yaml_config).context("invalid YAML config")?;
        let conf = Conf::from_conf_file(&conf_file).context("invalid configuration file")?;
        Ok(Self::wrap(conf, conf_file))
    }

    fn wrap(conf: Conf, conf_file: dto::ConfFile) -> Self {
        Self {
            inner: Arc::new(ConfHandleInner {
                conf: parking_lot::RwLock::new(Arc::new(conf)),
                conf_file: parking_lot::RwLock::new(Arc::new(conf_file)),
                changed: Notify::new(),
            }),
        }
    }

    /// Returns current configuration state (do not hold it forever as it may become outdated)
    pub fn get_conf(&self) -> Arc<Conf> {
        self.inner.conf.read().clone()
    }

    /// Returns current configuration file state (do not hold it forever as it may become outdated)
    pub fn get_conf_file(&self) -> Arc<dto::ConfFile> {
        self.inner.conf_file.read().clone()
    }

    /// Waits for configuration to be changed
    pub async fn change_notified(&self) {
        self.inner.changed.notified().await;
    }

    /// Atomically saves and replaces current configuration with a new one
    #[instrument(skip(self))]
    pub fn save_new_conf_file(&self, conf_file: dto::ConfFile) -> anyhow::Result<()> {
        let conf = Conf::from_conf_file(&conf_file).context("invalid configuration file")?;
        save_config(&conf_file).context("failed to save configuration")?;
        *self.inner.conf.write() = Arc::new(conf);
        *self.inner.conf_file.write() = Arc::new(conf_file);
        self.inner.changed.notify_waiters();
        trace!("success");
        Ok(())
    }
}

fn save_config(conf: &dto::ConfFile) -> anyhow::Result<()> {
    let conf_file_path = get_conf_file_path();
    let yaml = serde_yaml::to_string(conf).context("failed YAML serialization of configuration")?;
    std::fs::write(&conf_file_path, yaml).with_context(|| format!("failed to write file at {conf_file_path}"))?;
    Ok(())
}

pub fn get_data_dir() -> Utf8PathBuf {
    if let Ok(config_path_env) = env::var("PERIMETER_CONFIG_PATH") {
        Utf8PathBuf::from(config_path_env)
    } else {
        let mut config_path = Utf8PathBuf::new();

        if cfg!(target_os = "windows") {
            let program_data_env = env::var("ProgramData").expect("ProgramData env variable");
            config_path.push(program_data_env);
            config_path.push(APPLICATION_DIR);
        } else if cfg!(target_os = "macos") {
            config_path.push("/Library/Application Support");
            config_path.push(APPLICATION_DIR);
        } else {
            config_path.push("/etc");
            config_path.push(APPLICATION_DIR);
        }

        config_path
    }
}

fn get_conf_file_path() -> Utf8PathBuf {
    get_data_dir().join("perimeter.yaml")
}

fn normalize_data_path(path: &Utf8Path, data_dir: &Utf8Path) -> Utf8PathBuf {
    if path.is_absolute() {
        path.to_owned()
    } else {
        data_dir.join(path)
    }
}

fn load_conf_file(conf_path: &Utf8Path) -> anyhow::Result<Option<dto::ConfFile>> {
    match File::open(conf_path) {
        Ok(file) => BufReader::new(file)
            .pipe(serde_yaml::from_reader)
            .map(Some)
            .with_context(|| format!("invalid config file at {conf_path}")),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(anyhow::anyhow!(e).context(format!("couldn't open config file at {conf_path}"))),
    }
}

pub fn load_conf_file_or_generate_new() -> anyhow::Result<dto::ConfFile> {
    let conf_file_path = get_conf_file_path();

    let conf_file = match load_conf_file(&conf_file_path).context("failed to load configuration")? {
        Some(conf_file) => conf_file,
        None => {
            let defaults = dto::ConfFile::generate_new();
            save_config(&defaults).context("failed to save configuration")?;
            defaults
        }
    };

    Ok(conf_file)
}

fn default_hostname() -> Option<String> {
    hostname::get().ok()?.into_string().ok()
}

pub mod dto {
    use ipnetwork::IpNetwork;
    use serde::{Deserialize, Serialize};
    use smol_str::SmolStr;

    use super::*;

    /// Source of truth for engine configuration
    ///
    /// This struct represents the YAML file used for configuration as close
    /// as possible and is not trying to be too smart.
    #[derive(PartialEq, Debug, Clone, Default, Serialize, Deserialize)]
    pub struct ConfFile {
        /// This engine instance's unique ID
        pub id: Option<Uuid>,
        /// Hostname reported in source attribution records
        #[serde(skip_serializing_if = "Option::is_none")]
        pub hostname: Option<String>,

        /// Folder and prefix for log files
        #[serde(skip_serializing_if = "Option::is_none")]
        pub log_file: Option<Utf8PathBuf>,

        /// Verbosity profile
        #[serde(skip_serializing_if = "Option::is_none")]
        pub verbosity_profile: Option<VerbosityProfile>,

        /// Extra `tracing` filtering directives appended to the profile
        #[serde(skip_serializing_if = "Option::is_none")]
        pub log_directive: Option<String>,

        /// Scheduler and resource knobs
        #[serde(skip_serializing_if = "Option::is_none")]
        pub engine: Option<EngineSection>,

        /// Seeds and keyword filters delimiting the session scope
        #[serde(skip_serializing_if = "Option::is_none")]
        pub scope: Option<ScopeSection>,

        /// Per data-source overrides (TTL, credentials, rate)
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        pub datasources: Vec<DataSourceSection>,

        // Other unofficial options.
        // This field is useful so that we can deserialize
        // and then losslessly serialize back all root keys of the config file.
        #[serde(flatten)]
        pub rest: serde_yaml::Mapping,
    }

    impl ConfFile {
        pub fn generate_new() -> Self {
            Self {
                id: Some(Uuid::new_v4()),
                hostname: None,
                log_file: None,
                verbosity_profile: None,
                log_directive: None,
                engine: None,
                scope: Some(ScopeSection {
                    domains: vec!["example.com".to_owned()],
                    ..ScopeSection::default()
                }),
                datasources: Vec::new(),
                rest: serde_yaml::Mapping::new(),
            }
        }
    }

    #[derive(PartialEq, Debug, Clone, Default, Serialize, Deserialize)]
    pub struct EngineSection {
        #[serde(skip_serializing_if = "Option::is_none")]
        pub event_workers: Option<usize>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub queue_high_water: Option<usize>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub queue_low_water: Option<usize>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub quiescence_secs: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub max_concurrent_http: Option<usize>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub max_concurrent_dns: Option<usize>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub max_depth: Option<u32>,
        /// Seed for jittered sampling; set it to make runs reproducible
        #[serde(skip_serializing_if = "Option::is_none")]
        pub seed: Option<u64>,
    }

    #[derive(PartialEq, Debug, Clone, Default, Serialize, Deserialize)]
    pub struct ScopeSection {
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        pub domains: Vec<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        pub cidrs: Vec<IpNetwork>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        pub asns: Vec<u32>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        pub allow: Vec<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        pub deny: Vec<String>,
    }

    #[derive(PartialEq, Debug, Clone, Serialize, Deserialize)]
    pub struct DataSourceSection {
        pub name: SmolStr,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub ttl_secs: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub rate: Option<u32>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        pub creds: Vec<Credential>,
    }

    #[derive(PartialEq, Eq, Debug, Clone, Default, Serialize, Deserialize)]
    pub struct Credential {
        #[serde(skip_serializing_if = "Option::is_none")]
        pub apikey: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub username: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub password: Option<String>,
    }

    /// Verbosity profile (pre-defined tracing directives)
    #[derive(PartialEq, Eq, Debug, Clone, Copy, Default, Serialize, Deserialize)]
    pub enum VerbosityProfile {
        /// The default profile, mostly info records
        #[default]
        Default,
        /// Recommended profile for debugging
        Debug,
        /// Show all traces
        All,
        /// Only show warnings and errors
        Quiet,
    }

    impl VerbosityProfile {
        pub fn to_log_filter(self) -> &'static str {
            match self {
                VerbosityProfile::Default => "info",
                VerbosityProfile::Debug => "info,perimeter=debug",
                VerbosityProfile::All => "trace",
                VerbosityProfile::Quiet => "warn",
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
id: 123e4567-e89b-12d3-a456-426614174000
verbosity_profile: Debug
engine:
  event_workers: 4
  queue_high_water: 64
  queue_low_water: 16
  quiescence_secs: 1
scope:
  domains: ["Example.COM"]
  cidrs: ["192.0.2.0/24"]
  asns: [64500]
datasources:
  - name: certspot
    ttl_secs: 3600
    rate: 5
    creds:
      - apikey: not-a-real-key
"#;

    #[test]
    fn sample_config_round_trips_into_conf() {
        let handle = ConfHandle::mock(SAMPLE).unwrap();
        let conf = handle.get_conf();

        assert_eq!(conf.engine.event_workers, 4);
        assert_eq!(conf.engine.quiescence_window, Duration::from_secs(1));
        // Seed domains are normalized at load time.
        assert_eq!(conf.scope.seed_domains(), ["example.com"]);

        let source = conf.datasource("certspot").unwrap();
        assert_eq!(source.ttl, Some(Duration::from_secs(3600)));
        assert_eq!(source.rate, Some(5));
        assert_eq!(source.first_credential().unwrap().apikey.as_deref(), Some("not-a-real-key"));
    }

    #[test]
    fn missing_seeds_are_fatal() {
        let err = ConfHandle::mock("engine:\n  event_workers: 2\n").unwrap_err();
        assert!(format!("{err:#}").contains("at least one seed"));
    }

    #[test]
    fn inverted_watermarks_are_fatal() {
        let yaml = r#"
engine:
  queue_high_water: 10
  queue_low_water: 20
scope:
  domains: ["example.com"]
"#;
        let err = ConfHandle::mock(yaml).unwrap_err();
        assert!(format!("{err:#}").contains("queue_low_water"));
    }

    #[test]
    fn unknown_root_keys_are_preserved() {
        let yaml = r#"
scope:
  domains: ["example.com"]
future_option: 42
"#;
        let handle = ConfHandle::mock(yaml).unwrap();
        let conf_file = handle.get_conf_file();
        assert!(conf_file.rest.contains_key("future_option"));
    }
}
