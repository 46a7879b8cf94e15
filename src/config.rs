use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "ftpbridge", version, about = "Intercepting FTP reverse proxy")]
pub struct Cli {
    #[arg(long, default_value = "config/proxy.yaml")]
    pub config: PathBuf,

    #[arg(long, default_value = "info")]
    pub log_level: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub listen_addr: String,

    #[serde(default)]
    pub idle_timeout_secs: u64,

    #[serde(default = "default_proxy_timeout_secs")]
    pub proxy_timeout_secs: u64,

    #[serde(default)]
    pub proxy_protocol: bool,

    pub remote_addr: String,

    pub tls: TlsConfig,
}

fn default_proxy_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct TlsConfig {
    pub ca_file: String,
    pub server_cert: String,
    pub server_key: String,
    #[serde(default)]
    pub client_cert: Option<String>,
    #[serde(default)]
    pub client_key: Option<String>,
}

pub fn load_config() -> Result<(Cli, Config)> {
    let cli = Cli::parse();

    let yaml = fs::read_to_string(&cli.config)
        .with_context(|| format!("failed to read {}", cli.config.display()))?;

    let cfg: Config = serde_yaml::from_str(&yaml)
        .with_context(|| format!("failed to parse YAML in {}", cli.config.display()))?;
    Ok((cli, cfg))
}
