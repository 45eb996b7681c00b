use anyhow::{Context, Result, anyhow, bail};
use bytesize::ByteSize;
use dotenvy::dotenv;
use serde::Deserialize;
use std::{fs, path::PathBuf, time::Duration};
use url::Url;

use crate::{
    chunk::DEFAULT_CHUNK_SIZE,
    provision::{DEFAULT_IMAGE, DEFAULT_SERVICE_PORT},
};

pub const ENV_PREFIX: &str = "S3BUG_";
const DEFAULT_PAYLOAD_SIZE: u64 = 25 * 1024 * 1024;

#[derive(Debug, Deserialize, Default)]
pub struct ConfigFile {
    pub image: Option<String>,
    pub service_port: Option<u16>,
    pub endpoint: Option<Url>,
    pub region: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub bucket: Option<String>,
    pub key: Option<String>,
    pub content_type: Option<String>,
    pub chunk_size: Option<String>,
    pub payload_size: Option<String>,
    pub startup_timeout: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct ConfigEnv {
    image: Option<String>,
    service_port: Option<u16>,
    endpoint: Option<Url>,
    region: Option<String>,
    access_key_id: Option<String>,
    secret_access_key: Option<String>,
    bucket: Option<String>,
    key: Option<String>,
    content_type: Option<String>,
    chunk_size: Option<String>,
    payload_size: Option<String>,
    startup_timeout: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub image: String,
    pub service_port: u16,
    /// Use this store instead of starting an emulator.
    pub endpoint: Option<Url>,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub bucket: String,
    pub key: String,
    /// `None` when configured blank.
    pub content_type: Option<String>,
    pub chunk_size: ByteSize,
    pub payload_size: ByteSize,
    pub startup_timeout: Duration,
}

fn parse_size(name: &str, value: &str) -> Result<ByteSize> {
    let size: ByteSize = value
        .trim()
        .parse()
        .map_err(|e| anyhow!("Invalid {name} {value:?}: {e}"))?;
    Ok(size)
}

fn parse_duration(name: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value.trim()).with_context(|| format!("Invalid {name} {value:?}"))
}

pub fn merge_config(base: ConfigFile, override_config: ConfigEnv) -> Result<Config> {
    let chunk_size = match override_config.chunk_size.or(base.chunk_size) {
        Some(value) => parse_size("chunk_size", &value)?,
        None => ByteSize::b(DEFAULT_CHUNK_SIZE as u64),
    };
    if chunk_size.as_u64() == 0 {
        bail!("chunk_size must be greater than zero");
    }

    let payload_size = match override_config.payload_size.or(base.payload_size) {
        Some(value) => parse_size("payload_size", &value)?,
        None => ByteSize::b(DEFAULT_PAYLOAD_SIZE),
    };

    let startup_timeout = match override_config.startup_timeout.or(base.startup_timeout) {
        Some(value) => parse_duration("startup_timeout", &value)?,
        None => Duration::from_secs(90),
    };

    let content_type = override_config
        .content_type
        .or(base.content_type)
        .unwrap_or_else(|| "application/json".to_string());
    let content_type = Some(content_type).filter(|c| !c.trim().is_empty());

    Ok(Config {
        image: override_config
            .image
            .or(base.image)
            .unwrap_or_else(|| DEFAULT_IMAGE.to_string()),
        service_port: override_config
            .service_port
            .or(base.service_port)
            .unwrap_or(DEFAULT_SERVICE_PORT),
        endpoint: override_config.endpoint.or(base.endpoint),
        region: override_config
            .region
            .or(base.region)
            .unwrap_or_else(|| "us-east-1".to_string()),
        access_key_id: override_config
            .access_key_id
            .or(base.access_key_id)
            .unwrap_or_else(|| "xxx".to_string()),
        secret_access_key: override_config
            .secret_access_key
            .or(base.secret_access_key)
            .unwrap_or_else(|| "xxx".to_string()),
        bucket: override_config
            .bucket
            .or(base.bucket)
            .unwrap_or_else(|| "bucket-name".to_string()),
        key: override_config
            .key
            .or(base.key)
            .unwrap_or_else(|| "random.json".to_string()),
        content_type,
        chunk_size,
        payload_size,
        startup_timeout,
    })
}

pub fn config_path() -> Result<PathBuf> {
    let project_dirs = directories::ProjectDirs::from("dev", "s3bug", "s3bug")
        .ok_or(anyhow!("Unable to determine home directory"))?;
    Ok(project_dirs.config_dir().join("config.toml"))
}

pub fn read_config_file(path: &std::path::Path) -> Result<ConfigFile> {
    match fs::read_to_string(path) {
        Ok(contents) => toml::from_str(&contents)
            .with_context(|| format!("Failed to parse {}", path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
    }
}

pub fn read_config() -> Result<Config> {
    let _ = dotenv();
    let env_config = envy::prefixed(ENV_PREFIX)
        .from_env::<ConfigEnv>()
        .context("Invalid S3BUG_* environment variable")?;

    let file_config = read_config_file(&config_path()?)?;

    merge_config(file_config, env_config)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_defaults() {
        let config = merge_config(ConfigFile::default(), ConfigEnv::default()).unwrap();

        assert_eq!(config.image, "localstack/localstack:latest");
        assert_eq!(config.service_port, 4566);
        assert_eq!(config.endpoint, None);
        assert_eq!(config.bucket, "bucket-name");
        assert_eq!(config.key, "random.json");
        assert_eq!(config.content_type.as_deref(), Some("application/json"));
        assert_eq!(config.chunk_size, ByteSize::mib(10));
        assert_eq!(config.payload_size, ByteSize::mib(25));
        assert_eq!(config.startup_timeout, Duration::from_secs(90));
        assert_eq!(config.access_key_id, "xxx");
    }

    #[test]
    fn test_env_overrides_file() {
        let file = ConfigFile {
            image: Some("localstack/localstack:2.2.0".to_string()),
            bucket: Some("from-file".to_string()),
            chunk_size: Some("5 MiB".to_string()),
            ..Default::default()
        };
        let env = ConfigEnv {
            bucket: Some("from-env".to_string()),
            startup_timeout: Some("2m 30s".to_string()),
            ..Default::default()
        };

        let config = merge_config(file, env).unwrap();
        assert_eq!(config.image, "localstack/localstack:2.2.0");
        assert_eq!(config.bucket, "from-env");
        assert_eq!(config.chunk_size, ByteSize::mib(5));
        assert_eq!(config.startup_timeout, Duration::from_secs(150));
    }

    #[test]
    fn test_blank_content_type_disables_it() {
        let env = ConfigEnv {
            content_type: Some("  ".to_string()),
            ..Default::default()
        };
        let config = merge_config(ConfigFile::default(), env).unwrap();
        assert_eq!(config.content_type, None);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let env = ConfigEnv {
            chunk_size: Some("lots".to_string()),
            ..Default::default()
        };
        assert!(merge_config(ConfigFile::default(), env).is_err());

        let env = ConfigEnv {
            chunk_size: Some("0".to_string()),
            ..Default::default()
        };
        assert!(merge_config(ConfigFile::default(), env).is_err());

        let env = ConfigEnv {
            startup_timeout: Some("soon".to_string()),
            ..Default::default()
        };
        assert!(merge_config(ConfigFile::default(), env).is_err());
    }

    #[test]
    fn test_read_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
endpoint = "http://localhost:4566"
key = "data/random.json"
chunk_size = "8 MiB"
"#
        )
        .unwrap();

        let parsed = read_config_file(file.path()).unwrap();
        let config = merge_config(parsed, ConfigEnv::default()).unwrap();
        assert_eq!(
            config.endpoint.as_ref().map(Url::as_str),
            Some("http://localhost:4566/")
        );
        assert_eq!(config.key, "data/random.json");
        assert_eq!(config.chunk_size, ByteSize::mib(8));
    }

    #[test]
    fn test_missing_config_file_means_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let parsed = read_config_file(&dir.path().join("config.toml")).unwrap();
        assert!(parsed.bucket.is_none());
    }
}
