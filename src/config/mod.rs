use std::{
    collections::HashMap,
    env,
    fs,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
    time::Duration,
};

use directories::BaseDirs;

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8000";
pub const DEFAULT_BOKEH_URL_TEMPLATE: &str =
    "https://cdn.bokeh.org/bokeh/release/bokeh-{version}.min.js";
pub const DEFAULT_BOKEH_VERSION: &str = "3.3.3";

#[derive(Debug, Clone)]
pub struct Config {
    inner: HashMap<String, String>,
    overrides: HashMap<String, String>,
}

impl Config {
    pub fn load() -> Self {
        Self::load_from(&default_config_path())
    }

    pub fn load_from(config_path: &Path) -> Self {
        let mut map = default_map();

        // Read .hibikirc if exists
        if config_path.exists() {
            if let Ok(file) = fs::File::open(config_path) {
                let reader = BufReader::new(file);
                for line in reader.lines().map_while(Result::ok) {
                    let line = line.trim();
                    if line.is_empty() || line.starts_with('#') {
                        continue;
                    }
                    if let Some((k, v)) = line.split_once('=') {
                        map.insert(k.trim().to_string(), v.trim().to_string());
                    }
                }
            }
        }

        // Overlay environment variables (take precedence)
        for (k, v) in env::vars() {
            if is_config_key(&k) {
                map.insert(k, v);
            }
        }

        Self { inner: map, overrides: HashMap::new() }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        if let Some(v) = self.overrides.get(key) {
            return Some(v.clone());
        }
        // ENV next
        if let Ok(v) = env::var(key) {
            return Some(v);
        }
        self.inner.get(key).cloned()
    }

    /// Overrides a key for the lifetime of this value, above env and rc file.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.overrides.insert(key.to_string(), value.into());
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(|v| v.trim().parse::<u64>().ok())
    }

    pub fn get_usize(&self, key: &str) -> Option<usize> {
        self.get(key).and_then(|v| v.trim().parse::<usize>().ok())
    }

    pub fn get_path(&self, key: &str) -> Option<PathBuf> {
        self.get(key).map(PathBuf::from)
    }

    pub fn base_url(&self) -> String {
        let raw = self
            .get("HIBIKI_API_BASE_URL")
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        raw.trim_end_matches('/').to_string()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.get_u64("REQUEST_TIMEOUT").unwrap_or(60))
    }

    pub fn cooldown_window(&self) -> Duration {
        Duration::from_secs(self.get_u64("COOLDOWN_SECONDS").unwrap_or(5))
    }

    pub fn display_tick(&self) -> Duration {
        Duration::from_millis(self.get_u64("DISPLAY_TICK_MS").unwrap_or(200).max(10))
    }

    pub fn bokeh_url_template(&self) -> String {
        self.get("BOKEH_URL_TEMPLATE")
            .unwrap_or_else(|| DEFAULT_BOKEH_URL_TEMPLATE.to_string())
    }

    pub fn bokeh_fallback_version(&self) -> String {
        self.get("BOKEH_FALLBACK_VERSION")
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BOKEH_VERSION.to_string())
    }

    pub fn bokeh_entry_point(&self) -> String {
        self.get("BOKEH_ENTRY_POINT").unwrap_or_else(|| "Bokeh".to_string())
    }

    pub fn plot_output(&self) -> PathBuf {
        self.get_path("PLOT_OUTPUT")
            .unwrap_or_else(|| PathBuf::from("hibiki-plot.html"))
    }

    pub fn plot_target_id(&self) -> String {
        self.get("PLOT_TARGET_ID").unwrap_or_else(|| "bokeh-plot".to_string())
    }

    pub fn cache_path(&self) -> PathBuf {
        self.get_path("CACHE_PATH")
            .unwrap_or_else(|| env::temp_dir().join("hibiki").join("scripts"))
    }

    pub fn cache_length(&self) -> usize {
        self.get_usize("CACHE_LENGTH").unwrap_or(100)
    }

    pub fn token_path(&self) -> PathBuf {
        self.get_path("TOKEN_PATH")
            .unwrap_or_else(|| hibiki_dir().join("token"))
    }
}

fn is_config_key(k: &str) -> bool {
    // Accept known keys or HIBIKI_* for forward-compat
    const KEYS: &[&str] = &[
        "REQUEST_TIMEOUT",
        "COOLDOWN_SECONDS",
        "DISPLAY_TICK_MS",
        "BOKEH_URL_TEMPLATE",
        "BOKEH_FALLBACK_VERSION",
        "BOKEH_ENTRY_POINT",
        "PLOT_OUTPUT",
        "PLOT_TARGET_ID",
        "CACHE_PATH",
        "CACHE_LENGTH",
        "TOKEN_PATH",
    ];

    KEYS.contains(&k) || k.starts_with("HIBIKI_")
}

fn hibiki_dir() -> PathBuf {
    let base = BaseDirs::new()
        .map(|b| b.config_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("~/.config"));
    base.join("hibiki")
}

fn default_config_path() -> PathBuf {
    hibiki_dir().join(".hibikirc")
}

fn default_map() -> HashMap<String, String> {
    let mut m = HashMap::new();
    let temp = env::temp_dir().join("hibiki");

    // Paths
    m.insert(
        "CACHE_PATH".into(),
        temp.join("scripts").to_string_lossy().into_owned(),
    );
    m.insert("TOKEN_PATH".into(), hibiki_dir().join("token").to_string_lossy().into_owned());
    m.insert("PLOT_OUTPUT".into(), "hibiki-plot.html".into());

    // Numbers
    m.insert("CACHE_LENGTH".into(), "100".into());
    m.insert("REQUEST_TIMEOUT".into(), "60".into());
    m.insert("COOLDOWN_SECONDS".into(), "5".into());
    m.insert("DISPLAY_TICK_MS".into(), "200".into());

    // Strings
    m.insert("HIBIKI_API_BASE_URL".into(), DEFAULT_BASE_URL.into());
    m.insert("BOKEH_URL_TEMPLATE".into(), DEFAULT_BOKEH_URL_TEMPLATE.into());
    m.insert("BOKEH_FALLBACK_VERSION".into(), DEFAULT_BOKEH_VERSION.into());
    m.insert("BOKEH_ENTRY_POINT".into(), "Bokeh".into());
    m.insert("PLOT_TARGET_ID".into(), "bokeh-plot".into());

    m
}
