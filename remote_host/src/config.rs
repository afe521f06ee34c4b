use std::{path::PathBuf, str::FromStr};

use clap::Parser;
use invocation_interface::{
    cache::CachePolicy,
    config::InvocationConfig,
    message::{control_message_size, process_message_size},
};
use log::{warn, LevelFilter};
use remote_commons::{RemoteError, RemoteResult};

use crate::algorithms::COPY_CLASS;

#[derive(Debug, serde::Deserialize)]
pub struct HostConfig {
    #[serde(default = "pool_size_default")]
    pub pool_size: usize,
    #[serde(default = "max_message_size_default")]
    pub max_message_size: usize,
    /// core the remote domain is pinned to, none to leave it to the scheduler
    #[serde(default = "remote_core_default")]
    pub remote_core: Option<usize>,
    #[serde(default = "iterations_default")]
    pub iterations: usize,
    #[serde(default = "buffer_size_default")]
    pub buffer_size: usize,
    /// bind the algorithm in the calling domain instead of the remote one
    #[serde(default)]
    pub local: bool,
    #[serde(default = "loglevel_default")]
    pub log_level: LevelFilter,
    #[serde(default)]
    pub invocation: InvocationConfig,
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(value) => value.parse::<T>().unwrap_or_else(|_| {
            warn!("Could not parse {}={}, using default", name, value);
            default
        }),
        Err(_) => default,
    }
}

fn pool_size_default() -> usize {
    return env_or("REMOTE_POOL_SIZE", 4);
}

fn max_message_size_default() -> usize {
    return env_or("REMOTE_MESSAGE_SIZE", 4096);
}

fn remote_core_default() -> Option<usize> {
    if let Ok(core) = std::env::var("REMOTE_CORE") {
        return core.parse::<usize>().ok();
    }
    // keep core 0 for the caller when there is a choice
    let cores = num_cpus::get_physical();
    return if cores > 1 { Some(cores - 1) } else { None };
}

fn iterations_default() -> usize {
    return env_or("REMOTE_ITERATIONS", 16);
}

fn buffer_size_default() -> usize {
    return env_or("REMOTE_BUFFER_SIZE", 4096);
}

fn loglevel_default() -> LevelFilter {
    return std::env::var("RUST_LOG").map_or(LevelFilter::Debug, |env_string| {
        LevelFilter::from_str(&env_string).unwrap_or(LevelFilter::Debug)
    });
}

/// Command line overrides, every flag wins over the configuration file
#[derive(Parser, Debug, Default)]
#[command(about = "Drive calls against an algorithm bound in a remote execution domain")]
pub struct HostArgs {
    /// configuration file, defaults to ./remote_host.json
    #[arg(long, env = "REMOTE_HOST_CONFIG")]
    pub config: Option<PathBuf>,
    /// number of process calls to issue
    #[arg(long)]
    pub iterations: Option<usize>,
    /// bytes per input and output buffer
    #[arg(long)]
    pub buffer_size: Option<usize>,
    #[arg(long)]
    pub pool_size: Option<usize>,
    #[arg(long)]
    pub max_message_size: Option<usize>,
    /// pin the remote domain to this core
    #[arg(long)]
    pub core: Option<usize>,
    /// run the contract checks around every call
    #[arg(long)]
    pub checked: bool,
    #[arg(long)]
    pub record_timings: bool,
    /// bind the algorithm in the calling domain
    #[arg(long)]
    pub local: bool,
    /// one of none, full, per-buffer
    #[arg(long)]
    pub cache_policy: Option<String>,
}

pub fn parse_cache_policy(name: &str) -> RemoteResult<CachePolicy> {
    return match name {
        "none" => Ok(CachePolicy::None),
        "full" => Ok(CachePolicy::FullInvalidateFullWriteback),
        "per-buffer" => Ok(CachePolicy::PerBufferInvalidateWriteback),
        other => Err(RemoteError::ConfigError(format!(
            "unknown cache policy {}",
            other
        ))),
    };
}

fn read_config_file(config_path: PathBuf) -> Option<Vec<u8>> {
    return std::fs::read(&config_path).map_or_else(
        |err| {
            match err.kind() {
                std::io::ErrorKind::NotFound => (),
                err => {
                    warn!(
                        "Encountered error while searching for config file at {:?}: {:?}",
                        config_path, err
                    );
                    return None;
                }
            };
            if let Ok(mut exec_path) = std::env::current_exe() {
                exec_path.pop();
                exec_path.push("remote_host.json");
                match std::fs::read(&exec_path) {
                    Ok(buffer) => return Some(buffer),
                    Err(err) => warn!(
                        "Encountered error while searching config file in exec path at {:?}: {:?}",
                        exec_path, err
                    ),
                };
            }
            return None;
        },
        |ok| Some(ok),
    );
}

impl HostConfig {
    pub fn from_json(config_buff: &[u8]) -> RemoteResult<HostConfig> {
        return serde_json::from_slice(config_buff)
            .map_err(|err| RemoteError::ConfigError(format!("invalid configuration: {}", err)));
    }

    /// Read the configuration file if there is one, missing fields come from the environment
    pub fn get_config(config_path: Option<PathBuf>) -> RemoteResult<HostConfig> {
        let config_path = config_path.unwrap_or(PathBuf::from("./remote_host.json"));
        let config_buff = read_config_file(config_path).unwrap_or(String::from("{}").into_bytes());
        return Self::from_json(&config_buff);
    }

    pub fn apply_args(&mut self, args: &HostArgs) -> RemoteResult<()> {
        if let Some(iterations) = args.iterations {
            self.iterations = iterations;
        }
        if let Some(buffer_size) = args.buffer_size {
            self.buffer_size = buffer_size;
        }
        if let Some(pool_size) = args.pool_size {
            self.pool_size = pool_size;
        }
        if let Some(max_message_size) = args.max_message_size {
            self.max_message_size = max_message_size;
        }
        if args.core.is_some() {
            self.remote_core = args.core;
        }
        if let Some(policy) = &args.cache_policy {
            self.invocation.cache_policy = parse_cache_policy(policy)?;
        }
        self.invocation.checked |= args.checked;
        self.invocation.record_timings |= args.record_timings;
        self.local |= args.local;
        return Ok(());
    }

    /// Check that the sample workload can run with these settings
    pub fn validate(&self) -> RemoteResult<()> {
        if self.pool_size == 0 {
            return Err(RemoteError::ConfigError(String::from(
                "message pool needs at least one message",
            )));
        }
        if self.buffer_size == 0 {
            return Err(RemoteError::ConfigError(String::from(
                "buffer size needs to be positive",
            )));
        }
        let required = process_message_size(COPY_CLASS.in_args_base, COPY_CLASS.out_args_base).max(
            control_message_size(COPY_CLASS.dyn_params_base, COPY_CLASS.status_base),
        );
        if self.max_message_size < required {
            return Err(RemoteError::ConfigError(format!(
                "messages of {} bytes can not carry a call, need at least {}",
                self.max_message_size, required
            )));
        }
        if let Some(core) = self.remote_core {
            if core >= num_cpus::get() {
                return Err(RemoteError::ConfigError(format!(
                    "core {} does not exist",
                    core
                )));
            }
        }
        return Ok(());
    }
}
