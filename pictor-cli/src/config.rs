//! Server configuration from an INI file.
//!
//! CLI arguments override config file values when specified. Sections:
//!
//! ```ini
//! [server]
//! bind = 0.0.0.0:8000
//! unsafe = false
//!
//! [signature]
//! secret = my-secret
//! algorithm = sha1
//! truncate = 0
//!
//! [limits]
//! concurrency = 64
//! queue_size = 128
//! request_timeout_ms = 30000
//!
//! [storage]
//! dir = /var/lib/pictor/source
//! result_dir = /var/lib/pictor/result
//! ```

use crate::error::CliError;
use ini::Ini;
use pictor::urlpath::SignerAlg;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub unsafe_mode: bool,
    pub secret: Option<String>,
    pub signer_alg: SignerAlg,
    pub signer_truncate: usize,
    pub concurrency: usize,
    pub queue_size: usize,
    pub request_timeout: Duration,
    pub load_timeout: Duration,
    pub save_timeout: Duration,
    pub process_timeout: Duration,
    pub cache_header_ttl: Duration,
    pub cache_header_swr: Duration,
    pub cache_header_no_cache: bool,
    pub disable_error_body: bool,
    pub disable_params_endpoint: bool,
    pub base_params: Option<String>,
    pub base_path_redirect: Option<String>,
    pub auto_webp: bool,
    pub auto_avif: bool,
    pub modified_time_check: bool,
    pub storage_dir: Option<String>,
    pub storage_path_prefix: Option<String>,
    pub storage_expiration: Option<Duration>,
    pub result_storage_dir: Option<String>,
    pub http_loader: bool,
    pub http_allowed_sources: Vec<String>,
    pub log_dir: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8000".to_string(),
            unsafe_mode: false,
            secret: None,
            signer_alg: SignerAlg::Sha1,
            signer_truncate: 0,
            concurrency: 0,
            queue_size: 0,
            request_timeout: Duration::from_secs(30),
            load_timeout: Duration::from_secs(20),
            save_timeout: Duration::from_secs(20),
            process_timeout: Duration::from_secs(20),
            cache_header_ttl: Duration::from_secs(7 * 24 * 3600),
            cache_header_swr: Duration::from_secs(24 * 3600),
            cache_header_no_cache: false,
            disable_error_body: false,
            disable_params_endpoint: false,
            base_params: None,
            base_path_redirect: None,
            auto_webp: false,
            auto_avif: false,
            modified_time_check: false,
            storage_dir: None,
            storage_path_prefix: None,
            storage_expiration: None,
            result_storage_dir: None,
            http_loader: true,
            http_allowed_sources: Vec::new(),
            log_dir: None,
        }
    }
}

impl ServerConfig {
    /// Loads configuration from an INI file; missing keys keep their
    /// defaults.
    pub fn load_from(path: &Path) -> Result<Self, CliError> {
        let mut config = Self::default();
        if !path.exists() {
            return Ok(config);
        }
        let ini = Ini::load_from_file(path)?;

        if let Some(section) = ini.section(Some("server")) {
            if let Some(bind) = section.get("bind") {
                config.bind = bind.to_string();
            }
            read_bool(section, "unsafe", &mut config.unsafe_mode)?;
            read_bool(section, "auto_webp", &mut config.auto_webp)?;
            read_bool(section, "auto_avif", &mut config.auto_avif)?;
            read_bool(
                section,
                "disable_error_body",
                &mut config.disable_error_body,
            )?;
            read_bool(
                section,
                "disable_params_endpoint",
                &mut config.disable_params_endpoint,
            )?;
            if let Some(value) = section.get("base_params") {
                config.base_params = Some(value.to_string());
            }
            if let Some(value) = section.get("base_path_redirect") {
                config.base_path_redirect = Some(value.to_string());
            }
            if let Some(value) = section.get("log_dir") {
                config.log_dir = Some(value.to_string());
            }
        }

        if let Some(section) = ini.section(Some("signature")) {
            if let Some(secret) = section.get("secret") {
                config.secret = Some(secret.to_string());
            }
            if let Some(algorithm) = section.get("algorithm") {
                config.signer_alg = parse_signer_alg(algorithm)?;
            }
            read_usize(section, "truncate", &mut config.signer_truncate)?;
            validate_signer_truncate(config.signer_truncate)?;
        }

        if let Some(section) = ini.section(Some("limits")) {
            read_usize(section, "concurrency", &mut config.concurrency)?;
            read_usize(section, "queue_size", &mut config.queue_size)?;
            read_millis(section, "request_timeout_ms", &mut config.request_timeout)?;
            read_millis(section, "load_timeout_ms", &mut config.load_timeout)?;
            read_millis(section, "save_timeout_ms", &mut config.save_timeout)?;
            read_millis(section, "process_timeout_ms", &mut config.process_timeout)?;
        }

        if let Some(section) = ini.section(Some("cache")) {
            read_secs(section, "ttl_secs", &mut config.cache_header_ttl)?;
            read_secs(section, "swr_secs", &mut config.cache_header_swr)?;
            read_bool(section, "no_cache", &mut config.cache_header_no_cache)?;
            read_bool(
                section,
                "modified_time_check",
                &mut config.modified_time_check,
            )?;
        }

        if let Some(section) = ini.section(Some("storage")) {
            if let Some(dir) = section.get("dir") {
                config.storage_dir = Some(dir.to_string());
            }
            if let Some(prefix) = section.get("path_prefix") {
                config.storage_path_prefix = Some(prefix.to_string());
            }
            if let Some(value) = section.get("expiration_secs") {
                let secs = parse_number(value, "storage.expiration_secs")?;
                config.storage_expiration = Some(Duration::from_secs(secs));
            }
            if let Some(dir) = section.get("result_dir") {
                config.result_storage_dir = Some(dir.to_string());
            }
        }

        if let Some(section) = ini.section(Some("http_loader")) {
            read_bool(section, "enabled", &mut config.http_loader)?;
            if let Some(sources) = section.get("allowed_sources") {
                config.http_allowed_sources = sources
                    .split(',')
                    .map(|source| source.trim().to_string())
                    .filter(|source| !source.is_empty())
                    .collect();
            }
        }

        Ok(config)
    }
}

/// Rejects truncation lengths the path parser can never match: a
/// non-zero value below the signature-candidate floor would make every
/// legitimately signed request fail verification.
pub fn validate_signer_truncate(truncate: usize) -> Result<(), CliError> {
    if truncate != 0 && truncate < pictor::urlpath::MIN_SIGNATURE_LEN {
        return Err(CliError::Config(format!(
            "signature truncate must be 0 (full length) or at least {}, got {truncate}; \
             shorter signatures are never recognized in request paths",
            pictor::urlpath::MIN_SIGNATURE_LEN
        )));
    }
    Ok(())
}

pub fn parse_signer_alg(value: &str) -> Result<SignerAlg, CliError> {
    match value.to_ascii_lowercase().as_str() {
        "sha1" => Ok(SignerAlg::Sha1),
        "sha256" => Ok(SignerAlg::Sha256),
        "sha512" => Ok(SignerAlg::Sha512),
        other => Err(CliError::Config(format!(
            "unknown signature algorithm '{other}' (expected sha1, sha256 or sha512)"
        ))),
    }
}

fn parse_number(value: &str, key: &str) -> Result<u64, CliError> {
    value
        .parse()
        .map_err(|_| CliError::Config(format!("{key} = '{value}' is not a number")))
}

fn read_bool(
    section: &ini::Properties,
    key: &str,
    target: &mut bool,
) -> Result<(), CliError> {
    if let Some(value) = section.get(key) {
        *target = match value.to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" => true,
            "false" | "no" | "0" => false,
            other => {
                return Err(CliError::Config(format!(
                    "{key} = '{other}' is not a boolean"
                )))
            }
        };
    }
    Ok(())
}

fn read_usize(
    section: &ini::Properties,
    key: &str,
    target: &mut usize,
) -> Result<(), CliError> {
    if let Some(value) = section.get(key) {
        *target = parse_number(value, key)? as usize;
    }
    Ok(())
}

fn read_millis(
    section: &ini::Properties,
    key: &str,
    target: &mut Duration,
) -> Result<(), CliError> {
    if let Some(value) = section.get(key) {
        *target = Duration::from_millis(parse_number(value, key)?);
    }
    Ok(())
}

fn read_secs(
    section: &ini::Properties,
    key: &str,
    target: &mut Duration,
) -> Result<(), CliError> {
    if let Some(value) = section.get(key) {
        *target = Duration::from_secs(parse_number(value, key)?);
    }
    Ok(())
}
