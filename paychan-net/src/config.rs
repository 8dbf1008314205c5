use core::time::Duration;
use std::ffi::OsStr;
use std::fs;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::str::FromStr as _;

use clap::Parser;
use payment_channel::bitcoin::{Address, Amount, Network, ScriptBuf};
use payment_channel::config::ServerConfig;
use toml::value::{Table, Value};

use crate::listener::ListenerConfig;

pub const DEFAULT_PORT: u16 = 4242;
pub const DEFAULT_DIR: &str = ".paychand";

// only used for usage display
#[derive(Parser, Debug)]
#[clap(about, long_about = None)]
pub struct InitialArgs {
    #[clap(
        short = 'f',
        long,
        value_parser,
        help = "configuration file - MUST be the first argument",
        value_name = "FILE"
    )]
    config: Option<String>,
}

// note that value_parser gives us clap 4 forward compatibility
#[derive(Parser, Debug)]
#[clap(about, long_about = None, args_override_self = true)]
pub struct PaychandArgs {
    #[clap(flatten)]
    initial_args: InitialArgs,

    #[clap(
        long,
        help = "set the logging level",
        value_name = "LEVEL",
        default_value = "info",
        value_parser = ["off", "error", "warn", "info", "debug", "trace"],
    )]
    pub log_level: String,

    #[clap(short, long, value_parser, help = "data directory", value_name = "DIR", default_value = DEFAULT_DIR)]
    pub datadir: PathBuf,

    #[clap(
        long,
        help = "address to accept channel connections on",
        default_value_t = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, DEFAULT_PORT)),
        value_parser
    )]
    pub bind: SocketAddr,

    #[clap(short, long, value_name = "NETWORK", default_value = "regtest", value_parser = Network::from_str)]
    pub network: Network,

    #[clap(long, help = "address settlements pay out to", value_name = "ADDRESS")]
    pub payout_address: String,

    #[clap(long, help = "smallest channel accepted (satoshi)", default_value_t = 100_000)]
    pub min_channel_size: u64,

    #[clap(long, help = "smallest payment, also charged at open (satoshi)", default_value_t = 0)]
    pub min_payment: u64,

    #[clap(long, help = "how far ahead the client's refund unlocks", default_value_t = 24 * 60 * 60)]
    pub time_window_secs: u64,

    #[clap(long, help = "fee deducted from our settlement output (satoshi)", default_value_t = 0)]
    pub settlement_fee: u64,

    #[clap(long, help = "settle this long before the client's refund unlocks", default_value_t = 2 * 60 * 60)]
    pub expire_offset_secs: u64,

    #[clap(long, help = "idle read timeout before a channel is open", default_value_t = 30)]
    pub read_timeout_secs: u64,
}

impl PaychandArgs {
    pub fn listener_config(&self) -> ListenerConfig {
        ListenerConfig {
            read_timeout: Duration::from_secs(self.read_timeout_secs),
            server: ServerConfig {
                min_accepted_channel_size: Amount::from_sat(self.min_channel_size),
                min_payment: Amount::from_sat(self.min_payment),
                time_window: Duration::from_secs(self.time_window_secs),
                settlement_fee: Amount::from_sat(self.settlement_fee),
                expire_offset: Duration::from_secs(self.expire_offset_secs),
            },
        }
    }

    pub fn payout_script(&self) -> anyhow::Result<ScriptBuf> {
        let address = Address::from_str(&self.payout_address)?.require_network(self.network)?;
        Ok(address.script_pubkey())
    }

    /// Where broadcast transactions are queued
    pub fn outbox_path(&self) -> PathBuf {
        self.datadir.join("outbox.txt")
    }
}

/// Parse the command line, expanding `-f FILE`, `--config FILE` and
/// `--config=FILE` into the `--key=value` arguments the TOML file holds
pub fn parse_args_and_config_from(env_args: &[String]) -> Result<PaychandArgs, clap::Error> {
    let args = expand_config_args(env_args)
        .map_err(|e| clap::Error::raw(clap::error::ErrorKind::Io, format!("{}\n", e)))?;
    PaychandArgs::try_parse_from(args)
}

fn expand_config_args(env_args: &[String]) -> Result<Vec<String>, String> {
    let mut expanded = Vec::with_capacity(env_args.len());
    let mut args = env_args.iter();
    while let Some(arg) = args.next() {
        if let Some(path) = arg.strip_prefix("--config=") {
            expanded.extend(toml_to_configs(path.as_ref())?);
        } else if arg == "--config" || arg == "-f" {
            match args.next() {
                Some(path) => expanded.extend(toml_to_configs(path.as_ref())?),
                // let clap report the missing value
                None => expanded.push(arg.clone()),
            }
        } else {
            expanded.push(arg.clone());
        }
    }
    Ok(expanded)
}

fn toml_to_configs(path: &OsStr) -> Result<Vec<String>, String> {
    let contents = fs::read_to_string(path)
        .map_err(|e| format!("cannot read {}: {}", path.to_string_lossy(), e))?;
    let config: Table = toml::from_str(contents.as_str())
        .map_err(|e| format!("cannot parse {}: {}", path.to_string_lossy(), e))?;
    Ok(config
        .into_iter()
        .flat_map(|(k, value)| convert_toml_value(k, value))
        .map(|(k, v)| format!("--{}={}", k, v))
        .collect())
}

fn convert_toml_value(key: String, value: Value) -> Vec<(String, String)> {
    match value {
        Value::String(s) => vec![(key, s)],
        Value::Integer(v) => vec![(key, v.to_string())],
        Value::Float(v) => vec![(key, v.to_string())],
        Value::Boolean(v) => vec![(key, v.to_string())],
        Value::Datetime(v) => vec![(key, v.to_string())],
        Value::Array(a) =>
            a.into_iter().flat_map(|v| convert_toml_value(key.clone(), v)).collect::<Vec<_>>(),
        Value::Table(_) => vec![],
    }
}
