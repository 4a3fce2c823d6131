//! CLI command definitions and handlers.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use color_eyre::eyre::Result;
use skiff_common::{SkiffError, SkiffResult, resource};

use crate::cgroup::CgroupManager;
use crate::namespace::NamespaceKind;
use crate::runtime::{
    ContainerRegistry, ContainerSpec, HostServices, MountRequest, ResourceLimits, RuntimeConfig,
};

/// Skiff - Minimal Container Engine
#[derive(Parser)]
#[command(name = "skiff")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Runtime configuration file (TOML)
    #[arg(long, global = true, env = "SKIFF_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Log line format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines.
    Text,
    /// One JSON object per line.
    Json,
}

/// Helper commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Run a command in a new container and wait for it
    Run(RunArgs),

    /// Report host support for namespaces and cgroup controllers
    Check,
}

/// Arguments of `skiff run`.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Container name
    #[arg(long)]
    pub name: Option<String>,

    /// Hostname inside the container
    #[arg(long)]
    pub hostname: Option<String>,

    /// Working directory inside the container
    #[arg(short, long)]
    pub workdir: Option<PathBuf>,

    /// Memory limit (e.g. 512Mi, 1G)
    #[arg(short, long)]
    pub memory: Option<String>,

    /// CPU quota (e.g. 0.5, 2, 1500m)
    #[arg(long)]
    pub cpus: Option<String>,

    /// Relative CPU weight (1-10000)
    #[arg(long)]
    pub cpu_weight: Option<u64>,

    /// Maximum number of processes
    #[arg(long)]
    pub pids: Option<u64>,

    /// Attach to the bridge, optionally with a fixed address
    #[arg(long, num_args = 0..=1, require_equals = true, value_name = "ADDR")]
    pub net: Option<Option<Ipv4Addr>>,

    /// Environment variables (KEY=VALUE)
    #[arg(short, long)]
    pub env: Vec<String>,

    /// Bind mounts (SRC:DST[:ro])
    #[arg(short, long)]
    pub volume: Vec<String>,

    /// Seconds between SIGTERM and SIGKILL on interrupt
    #[arg(long)]
    pub stop_timeout: Option<u64>,

    /// Extracted root filesystem
    pub rootfs: PathBuf,

    /// Command and arguments
    #[arg(last = true, required = true)]
    pub command: Vec<String>,
}

impl RunArgs {
    /// Build the container spec these arguments describe.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed quantities, environment entries or
    /// volume flags.
    pub fn to_spec(&self) -> SkiffResult<ContainerSpec> {
        let limits = ResourceLimits {
            memory_bytes: self.memory.as_deref().map(resource::parse_memory).transpose()?,
            cpu_weight: self.cpu_weight,
            cpu_quota: self.cpus.as_deref().map(resource::parse_cpus).transpose()?,
            pids_max: self.pids,
        };

        let mut spec = ContainerSpec::new(&self.rootfs, self.command.iter().cloned()).with_limits(limits);
        if let Some(name) = &self.name {
            spec = spec.with_name(name);
        }
        if let Some(hostname) = &self.hostname {
            spec = spec.with_hostname(hostname);
        }
        if let Some(dir) = &self.workdir {
            spec = spec.with_working_dir(dir);
        }
        match self.net {
            Some(Some(address)) => spec = spec.with_address(address),
            Some(None) => spec = spec.with_network(),
            None => {}
        }
        for entry in &self.env {
            let (key, value) = entry.split_once('=').ok_or_else(|| {
                SkiffError::invalid_spec(format!("environment entry '{entry}' is not KEY=VALUE"))
            })?;
            spec = spec.with_env(key, value);
        }
        for volume in &self.volume {
            spec = spec.with_mount(volume.parse::<MountRequest>()?);
        }
        Ok(spec)
    }
}

/// Print a core error with its kind and leaf cause.
fn report(err: &SkiffError) {
    eprintln!("error[{}]: {err}", err.kind());
    let cause = err.root_cause();
    if !std::ptr::eq(cause, err) {
        eprintln!("  caused by: {cause}");
    }
}

impl Cli {
    /// Execute the CLI command and return the process exit code.
    ///
    /// # Errors
    ///
    /// Only for failures outside the engine; engine errors are reported and
    /// mapped to their exit code.
    pub async fn execute(self) -> Result<i32> {
        let config = match RuntimeConfig::discover(self.config.as_deref()) {
            Ok(config) => config,
            Err(err) => {
                report(&err);
                return Ok(err.exit_code());
            }
        };

        match self.command {
            Commands::Run(args) => match run(&args, config).await {
                Ok(code) => Ok(code),
                Err(err) => {
                    report(&err);
                    Ok(err.exit_code())
                }
            },
            Commands::Check => {
                check(&config);
                Ok(0)
            }
        }
    }
}

/// Submit, start, wait, destroy, remove. Returns the container's exit code.
async fn run(args: &RunArgs, config: RuntimeConfig) -> SkiffResult<i32> {
    let spec = args.to_spec()?;
    let timeout = args.stop_timeout.map(Duration::from_secs);
    let registry = ContainerRegistry::new(HostServices::linux(&config), config);

    let id = registry.submit(spec)?;
    if let Err(err) = registry.start(&id).await {
        // release whatever rollback could not
        match registry.destroy(&id).await {
            Ok(()) => registry.remove(&id)?,
            Err(e) => tracing::warn!(container_id = %id, error = %e, "Cleanup after failed start incomplete"),
        }
        return Err(err);
    }

    let exit = tokio::select! {
        status = registry.wait(&id) => status?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!(container_id = %id, "Interrupted, stopping container");
            match registry.stop(&id, timeout).await {
                Ok(status) | Err(SkiffError::AlreadyStopped { exit: Some(status), .. }) => status,
                Err(e) => return Err(e),
            }
        }
    };
    tracing::debug!(container_id = %id, %exit, "Container finished");

    registry.destroy(&id).await?;
    registry.remove(&id)?;
    Ok(exit.code())
}

fn check(config: &RuntimeConfig) {
    println!("Namespaces:");
    for kind in NamespaceKind::ALL {
        let state = if kind.is_supported() { "supported" } else { "missing" };
        println!("  {kind:<6} {state}");
    }

    let manager = CgroupManager::new(config.paths());
    let available = manager.available_controllers();
    println!("Cgroup controllers ({}):", config.cgroup_root.display());
    for controller in ["memory", "cpu", "pids"] {
        let state = if available.iter().any(|c| c == controller) {
            "available"
        } else {
            "missing"
        };
        println!("  {controller:<6} {state}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    fn parse_run(args: &[&str]) -> RunArgs {
        let cli = Cli::try_parse_from(["skiff", "run"].iter().chain(args)).unwrap();
        match cli.command {
            Commands::Run(args) => args,
            Commands::Check => panic!("expected run"),
        }
    }

    #[test]
    fn parses_run_flags() {
        let args = parse_run(&[
            "--memory", "64Mi", "--cpus", "0.5", "--pids", "20", "--net=10.88.0.7", "-e", "A=1",
            "-v", "/data:/data:ro", "/srv/root", "--", "/bin/sh", "-c", "exit 3",
        ]);
        assert_eq!(args.rootfs, PathBuf::from("/srv/root"));
        assert_eq!(args.command, ["/bin/sh", "-c", "exit 3"]);
        assert_eq!(args.net, Some(Some(Ipv4Addr::new(10, 88, 0, 7))));

        let spec = args.to_spec().unwrap();
        assert_eq!(spec.limits.memory_bytes, Some(64 * 1024 * 1024));
        assert_eq!(spec.limits.cpu_quota, Some(500));
        assert_eq!(spec.limits.pids_max, Some(20));
        assert_eq!(spec.env.get("A").map(String::as_str), Some("1"));
        assert!(spec.mounts[0].readonly);
    }

    #[test]
    fn bare_net_flag_requests_any_address() {
        let args = parse_run(&["--net", "/srv/root", "--", "true"]);
        assert_eq!(args.net, Some(None));
        assert!(args.to_spec().unwrap().network.is_enabled());
    }

    #[test]
    fn malformed_env_is_rejected() {
        let args = parse_run(&["-e", "NOVALUE", "/srv/root", "--", "true"]);
        assert!(args.to_spec().is_err());
    }
}
