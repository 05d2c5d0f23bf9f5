//! 配置：通用键值存储（TOML）+ 强类型设置视图
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::merge::OutputOption;
use crate::options::{EngineKind, RetryPolicy};

pub const KEY_ENGINE: &str = "engine";
pub const KEY_CONCURRENCY_CLOUD: &str = "concurrency.cloud";
pub const KEY_CONCURRENCY_OFFLINE: &str = "concurrency.offline";
pub const KEY_RETRY_MAX_ATTEMPTS: &str = "retry.max_attempts";
pub const KEY_RETRY_BASE_DELAY_MS: &str = "retry.base_delay_ms";
pub const KEY_RETRY_MAX_DELAY_MS: &str = "retry.max_delay_ms";
pub const KEY_MERGE_SUFFIX: &str = "merge.suffix";
pub const KEY_OUTPUT_OPTION: &str = "output.option";
pub const KEY_OUTPUT_FOLDER: &str = "output.folder";
pub const KEY_CLOUD_BACKEND_URL: &str = "cloud.backend_url";
pub const KEY_CLOUD_API_KEY_ENV: &str = "cloud.api_key_env";
pub const KEY_OFFLINE_COMMAND: &str = "offline.command";
pub const KEY_OFFLINE_ARGS: &str = "offline.args";

/// 通用键值持久化（getConfig / setConfig）
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
    values: BTreeMap<String, String>,
}

impl ConfigStore {
    /// 打开配置文件；不存在时为空配置
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let values = match std::fs::read_to_string(&path) {
            Ok(txt) => toml::from_str(&txt)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => return Err(ConfigError::Io { path, source }),
        };
        Ok(Self { path, values })
    }

    /// 仅内存中的配置（不落盘）
    pub fn in_memory() -> Self {
        Self { path: PathBuf::new(), values: BTreeMap::new() }
    }

    pub fn get(&self, key: &str) -> Option<&str> { self.values.get(key).map(String::as_str) }

    pub fn entries(&self) -> &BTreeMap<String, String> { &self.values }

    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        self.values.insert(key.to_string(), value.to_string());
        self.persist()
    }

    pub fn remove(&mut self, key: &str) -> Result<bool, ConfigError> {
        let removed = self.values.remove(key).is_some();
        if removed { self.persist()?; }
        Ok(removed)
    }

    fn persist(&self) -> Result<(), ConfigError> {
        if self.path.as_os_str().is_empty() { return Ok(()); }
        let txt = toml::to_string(&self.values)?;
        let io_err = |source: std::io::Error| ConfigError::Io { path: self.path.clone(), source };
        let dir = match self.path.parent() {
            Some(d) if !d.as_os_str().is_empty() => d,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir).map_err(io_err)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
        tmp.write_all(txt.as_bytes()).map_err(io_err)?;
        tmp.persist(&self.path).map_err(|e| io_err(e.error))?;
        Ok(())
    }
}

/// 强类型设置（带默认值）
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub engine: EngineKind,
    pub cloud_concurrency: usize,
    pub offline_concurrency: usize,
    pub retry: RetryPolicy,
    pub merge_suffix: String,
    pub output_option: OutputOption,
    pub output_folder: Option<PathBuf>,
    pub cloud_backend_url: Option<String>,
    pub cloud_api_key_env: String,
    pub offline_command: String,
    pub offline_args: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            engine: EngineKind::Offline,
            cloud_concurrency: EngineKind::Cloud.default_concurrency(),
            offline_concurrency: EngineKind::Offline.default_concurrency(),
            retry: RetryPolicy::default(),
            merge_suffix: String::new(),
            output_option: OutputOption::CoLocated,
            output_folder: None,
            cloud_backend_url: None,
            cloud_api_key_env: "DOCSORT_API_KEY".to_string(),
            offline_command: "tesseract".to_string(),
            offline_args: split_args("{page} stdout -l vie"),
        }
    }
}

impl Settings {
    /// 从键值存储解析；缺失的键取默认值，非法值报错
    pub fn from_store(store: &ConfigStore) -> Result<Self, ConfigError> {
        let mut s = Settings::default();
        if let Some(v) = store.get(KEY_ENGINE) { s.engine = parse(KEY_ENGINE, v)?; }
        if let Some(v) = store.get(KEY_CONCURRENCY_CLOUD) { s.cloud_concurrency = parse_positive::<usize>(KEY_CONCURRENCY_CLOUD, v)?; }
        if let Some(v) = store.get(KEY_CONCURRENCY_OFFLINE) { s.offline_concurrency = parse_positive::<usize>(KEY_CONCURRENCY_OFFLINE, v)?; }
        if let Some(v) = store.get(KEY_RETRY_MAX_ATTEMPTS) {
            s.retry.max_attempts = parse_positive(KEY_RETRY_MAX_ATTEMPTS, v)?;
        }
        if let Some(v) = store.get(KEY_RETRY_BASE_DELAY_MS) {
            s.retry.base_delay = Duration::from_millis(parse(KEY_RETRY_BASE_DELAY_MS, v)?);
        }
        if let Some(v) = store.get(KEY_RETRY_MAX_DELAY_MS) {
            s.retry.max_delay = Duration::from_millis(parse(KEY_RETRY_MAX_DELAY_MS, v)?);
        }
        if let Some(v) = store.get(KEY_MERGE_SUFFIX) { s.merge_suffix = v.to_string(); }
        if let Some(v) = store.get(KEY_OUTPUT_OPTION) { s.output_option = parse(KEY_OUTPUT_OPTION, v)?; }
        if let Some(v) = non_empty(store.get(KEY_OUTPUT_FOLDER)) { s.output_folder = Some(PathBuf::from(v)); }
        if let Some(v) = non_empty(store.get(KEY_CLOUD_BACKEND_URL)) { s.cloud_backend_url = Some(v.to_string()); }
        if let Some(v) = non_empty(store.get(KEY_CLOUD_API_KEY_ENV)) { s.cloud_api_key_env = v.to_string(); }
        if let Some(v) = non_empty(store.get(KEY_OFFLINE_COMMAND)) { s.offline_command = v.to_string(); }
        if let Some(v) = store.get(KEY_OFFLINE_ARGS) { s.offline_args = split_args(v); }
        Ok(s)
    }

    /// 指定引擎的并发数
    pub fn concurrency_for(&self, engine: EngineKind) -> usize {
        match engine {
            EngineKind::Cloud => self.cloud_concurrency,
            EngineKind::Offline => self.offline_concurrency,
        }
    }
}

fn non_empty(v: Option<&str>) -> Option<&str> {
    v.map(str::trim).filter(|v| !v.is_empty())
}

fn split_args(v: &str) -> Vec<String> {
    v.split_whitespace().map(str::to_string).collect()
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid { key: key.to_string(), value: value.to_string() })
}

/// 解析为正整数；超出目标类型范围同样视为非法
fn parse_positive<T: std::str::FromStr + PartialEq + Default>(key: &str, value: &str) -> Result<T, ConfigError> {
    let n: T = parse(key, value)?;
    if n == T::default() {
        return Err(ConfigError::Invalid { key: key.to_string(), value: value.to_string() });
    }
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_persists_and_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut store = ConfigStore::open(&path).unwrap();
        assert_eq!(store.get(KEY_ENGINE), None);
        store.set(KEY_ENGINE, "cloud").unwrap();
        store.set(KEY_CONCURRENCY_CLOUD, "2").unwrap();

        let reopened = ConfigStore::open(&path).unwrap();
        assert_eq!(reopened.get(KEY_ENGINE), Some("cloud"));
        let settings = Settings::from_store(&reopened).unwrap();
        assert_eq!(settings.engine, EngineKind::Cloud);
        assert_eq!(settings.concurrency_for(EngineKind::Cloud), 2);
    }

    #[test]
    fn defaults_apply_for_missing_keys() {
        let s = Settings::from_store(&ConfigStore::in_memory()).unwrap();
        assert_eq!(s, Settings::default());
        assert_eq!(s.cloud_concurrency, 1);
        assert_eq!(s.retry.max_attempts, 4);
        assert_eq!(s.offline_args, vec!["{page}", "stdout", "-l", "vie"]);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut store = ConfigStore::in_memory();
        store.set(KEY_CONCURRENCY_OFFLINE, "0").unwrap();
        assert!(matches!(Settings::from_store(&store), Err(ConfigError::Invalid { .. })));
        store.set(KEY_CONCURRENCY_OFFLINE, "3").unwrap();
        store.set(KEY_OUTPUT_OPTION, "sideways").unwrap();
        assert!(matches!(Settings::from_store(&store), Err(ConfigError::Invalid { key, .. }) if key == KEY_OUTPUT_OPTION));
    }

    #[test]
    fn max_attempts_out_of_range_is_rejected() {
        let mut store = ConfigStore::in_memory();
        store.set(KEY_RETRY_MAX_ATTEMPTS, "4294967296").unwrap();
        assert!(matches!(Settings::from_store(&store), Err(ConfigError::Invalid { key, .. }) if key == KEY_RETRY_MAX_ATTEMPTS));
        store.set(KEY_RETRY_MAX_ATTEMPTS, "7").unwrap();
        assert_eq!(Settings::from_store(&store).unwrap().retry.max_attempts, 7);
    }

    #[test]
    fn remove_deletes_key() {
        let mut store = ConfigStore::in_memory();
        store.set(KEY_MERGE_SUFFIX, "_gop").unwrap();
        assert!(store.remove(KEY_MERGE_SUFFIX).unwrap());
        assert!(!store.remove(KEY_MERGE_SUFFIX).unwrap());
    }
}
