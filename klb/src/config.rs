use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::loader::CacheBound;

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Subcommand, Debug)]
pub enum Commands {
    Daemon(DaemonArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct DaemonArgs {
    /// Path to the bpf fs for bpf maps
    #[arg(long, env = "KLB_BPF_FS", default_value = "/sys/fs/bpf")]
    pub bpf_fs: PathBuf,

    /// Path to the compiled datapath object
    #[arg(
        long,
        env = "KLB_DATAPATH_OBJECT",
        default_value = "/usr/lib/klb/klb-datapath.o"
    )]
    pub datapath_object: PathBuf,

    /// Consistent-hash ring slots per service (must be prime)
    #[arg(long, default_value_t = crate::maps::spec::DEFAULT_RING_SIZE)]
    pub ring_size: u32,

    /// Seconds between periodic full reconcile passes
    #[arg(long, default_value_t = 30)]
    pub reconcile_interval_s: u64,

    /// Seconds between conntrack sweeps
    #[arg(long, default_value_t = 300)]
    pub conntrack_sweep_interval_s: u64,

    /// Idle timeout for tcp conntrack entries, in seconds
    #[arg(long, default_value_t = 60 * 60 * 12)]
    pub conntrack_tcp_timeout_s: u64,

    /// Idle timeout for udp conntrack entries, in seconds
    #[arg(long, default_value_t = 60)]
    pub conntrack_udp_timeout_s: u64,

    /// Idle timeout for sctp conntrack entries, in seconds
    #[arg(long, default_value_t = 60)]
    pub conntrack_sctp_timeout_s: u64,

    /// Seconds between affinity sweeps
    #[arg(long, default_value_t = 60)]
    pub affinity_sweep_interval_s: u64,

    /// Maximum cached datapath templates; unbounded when unset
    #[arg(long, env = "KLB_TEMPLATE_CACHE_SIZE")]
    pub template_cache_size: Option<usize>,
}

impl DaemonArgs {
    pub fn cache_bound(&self) -> CacheBound {
        match self.template_cache_size {
            Some(n) => CacheBound::Lru(n),
            None => CacheBound::Unbounded,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_parse() {
        let cli = Cli::parse_from(["klb", "daemon"]);
        let Commands::Daemon(args) = cli.command;
        assert_eq!(args.bpf_fs, PathBuf::from("/sys/fs/bpf"));
        assert_eq!(args.ring_size, crate::maps::spec::DEFAULT_RING_SIZE);
        assert!(matches!(args.cache_bound(), CacheBound::Unbounded));
    }

    #[test]
    fn template_cache_bound_is_configurable() {
        let cli = Cli::parse_from(["klb", "daemon", "--template-cache-size", "4"]);
        let Commands::Daemon(args) = cli.command;
        assert!(matches!(args.cache_bound(), CacheBound::Lru(4)));
    }
}
