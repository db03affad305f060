//! Proxy configuration: CLI flags and the derived runtime config.

use clap::Parser;

/// Stratum proxy bridging RandomX CPU miners to the chain node.
#[derive(Parser, Debug, Clone)]
#[command(name = "rxeth-proxy", version, about)]
pub struct Opts {
    /// Stratum server listen address
    #[arg(long = "stratum", default_value = "0.0.0.0:3333")]
    pub stratum: String,

    /// Initial difficulty for miners
    #[arg(long = "diff", default_value_t = 10_000.0)]
    pub diff: f64,

    /// Chain node JSON-RPC endpoint
    #[arg(long = "geth", default_value = "http://localhost:8545")]
    pub geth: String,

    /// Pool payout address (miner etherbase)
    #[arg(long = "pool-addr")]
    pub pool_addr: Option<String>,

    /// Pool fee percentage (1.0 = 1%)
    #[arg(long = "pool-fee", default_value_t = 1.0)]
    pub pool_fee: f64,

    /// Target time between shares in seconds
    #[arg(long = "vardiff-target", default_value_t = 30.0)]
    pub vardiff_target: f64,

    /// Number of shares per vardiff calculation
    #[arg(long = "vardiff-window", default_value_t = 10)]
    pub vardiff_window: u64,

    /// Max consecutive invalid shares before ban (0 = disabled)
    #[arg(long = "max-invalid-streak", default_value_t = 10)]
    pub max_invalid_streak: u64,

    /// Max concurrent connections (0 = unlimited)
    #[arg(long = "max-connections", default_value_t = 1000)]
    pub max_connections: usize,

    /// Max shares per second per miner (0 = unlimited)
    #[arg(long = "share-rate-limit", default_value_t = 100.0)]
    pub share_rate_limit: f64,

    /// RandomX algorithm variant advertised to miners
    #[arg(long = "algo", default_value = "rx/0")]
    pub algo: String,

    /// HTTP stats API listen address
    #[arg(long = "api", default_value = "127.0.0.1:8080")]
    pub api: String,

    /// Verbose logging
    #[arg(short = 'v', long = "verbose", alias = "v")]
    pub verbose: bool,
}

/// Runtime configuration derived from [`Opts`].
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub listen: String,
    pub geth_rpc: String,
    pub initial_diff: u64,
    pub pool_addr: Option<String>,
    pub pool_fee: f64,
    pub vardiff_target_secs: f64,
    pub vardiff_window: u64,
    pub max_invalid_streak: u64,
    pub max_connections: usize,
    pub share_rate_limit: f64,
    pub algo: String,
    pub api_listen: String,
    pub verbose: bool,
}

impl From<&Opts> for ProxyConfig {
    fn from(opts: &Opts) -> Self {
        Self {
            listen: opts.stratum.clone(),
            geth_rpc: opts.geth.clone(),
            initial_diff: (opts.diff as u64).max(1),
            pool_addr: opts.pool_addr.clone(),
            pool_fee: opts.pool_fee,
            vardiff_target_secs: opts.vardiff_target,
            vardiff_window: opts.vardiff_window,
            max_invalid_streak: opts.max_invalid_streak,
            max_connections: opts.max_connections,
            share_rate_limit: opts.share_rate_limit,
            algo: opts.algo.clone(),
            api_listen: opts.api.clone(),
            verbose: opts.verbose,
        }
    }
}

impl ProxyConfig {
    /// Target share rate in shares per minute, for the vardiff controller.
    pub fn vardiff_target_spm(&self) -> f64 {
        if self.vardiff_target_secs <= 0.0 {
            2.0
        } else {
            60.0 / self.vardiff_target_secs
        }
    }
}
