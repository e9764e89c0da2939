use std::path::PathBuf;
use std::time::Duration;

/// Engine-wide configuration. One value per embedding shell; there is no
/// global state, every subsystem borrows what it needs from here.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Root data directory (instances/ and meta/ live underneath)
    pub data_dir: PathBuf,

    /// Number of concurrent download connections
    pub download_concurrency: usize,

    /// Base URL of the authenticated mod registry proxy
    pub registry_base_url: String,

    /// HTTP connect timeout
    pub connect_timeout: Duration,

    /// HTTP read-idle timeout
    pub read_timeout: Duration,

    /// Default -Xmx in MB when an instance uses the global allocation
    pub global_ram_mb: u32,
}

impl EngineConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            download_concurrency: 8,
            registry_base_url: "https://api.kilnlauncher.dev/v1/curseforge".to_string(),
            connect_timeout: Duration::from_secs(15),
            read_timeout: Duration::from_secs(60),
            global_ram_mb: 4096,
        }
    }

    pub fn with_download_concurrency(mut self, n: usize) -> Self {
        self.download_concurrency = n.max(1);
        self
    }

    pub fn with_registry_base_url(mut self, url: impl Into<String>) -> Self {
        self.registry_base_url = url.into();
        self
    }

    pub fn with_global_ram_mb(mut self, mb: u32) -> Self {
        self.global_ram_mb = mb;
        self
    }

    pub fn instances_dir(&self) -> PathBuf {
        self.data_dir.join("instances")
    }

    pub fn instance_dir(&self, id: &str) -> PathBuf {
        self.instances_dir().join(id)
    }

    pub fn staging_dir(&self, id: &str) -> PathBuf {
        self.instances_dir().join(format!("{}.staging", id))
    }

    pub fn meta_dir(&self) -> PathBuf {
        self.data_dir.join("meta")
    }

    pub fn versions_dir(&self) -> PathBuf {
        self.meta_dir().join("versions")
    }

    pub fn libraries_dir(&self) -> PathBuf {
        self.meta_dir().join("libraries")
    }

    pub fn assets_dir(&self) -> PathBuf {
        self.meta_dir().join("assets")
    }

    pub fn natives_dir(&self, version_id: &str) -> PathBuf {
        self.meta_dir().join("natives").join(version_id)
    }

    pub fn java_dir(&self) -> PathBuf {
        self.meta_dir().join("java")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.meta_dir().join("cache")
    }

    pub fn modpacks_dir(&self) -> PathBuf {
        self.meta_dir().join("modpacks")
    }

    /// Build the shared HTTP client used by every subsystem.
    pub fn http_client(&self) -> reqwest::Result<reqwest::Client> {
        reqwest::Client::builder()
            .user_agent(concat!("KilnLauncher/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(self.connect_timeout)
            .timeout(self.read_timeout)
            .pool_max_idle_per_host(self.download_concurrency)
            .build()
    }
}

/// Platform key used by the shared java tree (`meta/java/<major>/<platform>`).
pub fn java_platform() -> &'static str {
    match (std::env::consts::OS, std::env::consts::ARCH) {
        ("macos", "aarch64") => "mac-os-arm64",
        ("macos", _) => "mac-os",
        ("linux", "x86") => "linux-i386",
        ("linux", _) => "linux",
        ("windows", "aarch64") => "windows-arm64",
        ("windows", "x86") => "windows-x86",
        _ => "windows-x64",
    }
}
