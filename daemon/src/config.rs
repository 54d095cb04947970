use clap::{Args, Parser, ValueEnum};
use guardian_common::config::{DEFAULT_HTTP_BIND_ADDRESS, DEFAULT_HTTP_PORT};

// Pipeline depths
// Number of blocks behind head the pipeline runs at, so the processed block
// is unlikely to be reorged between probe and publish
pub const CONFIRMATION_DEPTH: u64 = 6;
// Blocks older than head - FINALIZATION_DEPTH are treated as immutable.
// A reorg deeper than this is an operator problem, not a daemon problem.
pub const FINALIZATION_DEPTH: u64 = 64;

// Event cache fetch rules
// Size of a single eth_getLogs window in blocks
pub const FETCH_WINDOW: u64 = 10_000;
// Window halving floor when the provider rejects a range
pub const MIN_FETCH_WINDOW: u64 = 1;

// Keys API freshness
// Maximum distance in blocks between the snapshot block and the processed
// block before the snapshot is considered stale
pub const MAX_SNAPSHOT_LAG: u64 = 50;
pub const DEFAULT_REGISTRY_KEYS_QUERY_BATCH_SIZE: usize = 1100;
pub const DEFAULT_REGISTRY_KEYS_QUERY_CONCURRENCY: usize = 5;

// External call deadlines
pub const RPC_CALL_TIMEOUT_SECS: u64 = 30;
pub const KEYS_API_TIMEOUT_SECS: u64 = 60;
pub const BUS_PUBLISH_TIMEOUT_SECS: u64 = 10;

// Transient retry policy, applied within a single block's processing window
pub const RETRY_MAX_ATTEMPTS: u32 = 3;
pub const RETRY_BASE_DELAY_MILLIS: u64 = 500;
pub const RETRY_MAX_DELAY_SECS: u64 = 8;

// How often the head is polled for a new block
pub const BLOCK_POLL_INTERVAL_MILLIS: u64 = 6_000;

// A ping message goes out every N processed blocks
pub const PING_INTERVAL_BLOCKS: u64 = 10;

// Confirmations awaited for the on-chain pause transaction
pub const PAUSE_CONFIRMATIONS: u64 = 1;

// Process exit codes. FATAL is distinct so supervisors can tell
// "restart me" from "call the operator"
pub const EXIT_CODE_FATAL: i32 = 70;

// Prometheus metric names
pub const METRIC_BLOCKS_PROCESSED: &str = "guardian_blocks_processed_total";
pub const METRIC_DECISIONS: &str = "guardian_decisions_total";
pub const METRIC_CACHE_EVENTS: &str = "guardian_cache_events_total";
pub const METRIC_CACHE_WATERMARK: &str = "guardian_cache_watermark_block";
pub const METRIC_STALE_SNAPSHOTS: &str = "guardian_stale_snapshots_total";
pub const METRIC_PAUSE_ATTEMPTS: &str = "guardian_pause_attempts_total";
pub const METRIC_PAUSE_FAILURES: &str = "guardian_pause_failures_total";
pub const METRIC_BUS_RETRIES: &str = "guardian_bus_publish_retries_total";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PubsubService {
    Rabbitmq,
    Kafka,
}

impl std::fmt::Display for PubsubService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PubsubService::Rabbitmq => write!(f, "rabbitmq"),
            PubsubService::Kafka => write!(f, "kafka"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Plain,
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Plain => write!(f, "plain"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

/// Execution-layer provider and contract addresses
#[derive(Debug, Clone, Args)]
pub struct ProviderConfig {
    /// EL JSON-RPC endpoint
    #[clap(long, env = "RPC_URL")]
    pub rpc_url: String,
    /// Chain id the daemon is allowed to operate on
    #[clap(long, env = "CHAIN_ID")]
    pub chain_id: u64,
    /// Guardian wallet private key, 32 bytes hex
    #[clap(long, env = "WALLET_PRIVATE_KEY", hide_env_values = true)]
    pub wallet_private_key: String,
    /// Deposit contract address
    #[clap(long, env = "DEPOSIT_CONTRACT_ADDRESS")]
    pub deposit_contract_address: String,
    /// Deposit security module address
    #[clap(long, env = "DEPOSIT_SECURITY_MODULE_ADDRESS")]
    pub deposit_security_module_address: String,
    /// Staking router address
    #[clap(long, env = "STAKING_ROUTER_ADDRESS")]
    pub staking_router_address: String,
    /// First block the deposit contract could have emitted events at.
    /// Saves a useless scan of the pre-deployment history
    #[clap(long, env = "DEPOSIT_CONTRACT_DEPLOY_BLOCK", default_value_t = 0)]
    pub deposit_contract_deploy_block: u64,
}

/// Keys API endpoint and query shape
#[derive(Debug, Clone, Args)]
pub struct KeysApiConfig {
    #[clap(long, env = "KEYS_API_HOST", default_value = "http://127.0.0.1")]
    pub keys_api_host: String,
    #[clap(long, env = "KEYS_API_PORT", default_value_t = 3000)]
    pub keys_api_port: u16,
    /// Page size for the paginated key endpoints
    #[clap(long, env = "REGISTRY_KEYS_QUERY_BATCH_SIZE", default_value_t = DEFAULT_REGISTRY_KEYS_QUERY_BATCH_SIZE)]
    pub registry_keys_query_batch_size: usize,
    /// Maximum key pages requested concurrently
    #[clap(long, env = "REGISTRY_KEYS_QUERY_CONCURRENCY", default_value_t = DEFAULT_REGISTRY_KEYS_QUERY_CONCURRENCY)]
    pub registry_keys_query_concurrency: usize,
}

/// Message bus selection and credentials
#[derive(Debug, Clone, Args)]
pub struct BrokerConfig {
    #[clap(long, env = "PUBSUB_SERVICE", value_enum, default_value_t = PubsubService::Rabbitmq)]
    pub pubsub_service: PubsubService,
    #[clap(long, env = "BROKER_TOPIC", default_value = "defender")]
    pub broker_topic: String,
    /// RabbitMQ Web-STOMP endpoint
    #[clap(long, env = "RABBITMQ_URL")]
    pub rabbitmq_url: Option<String>,
    #[clap(long, env = "RABBITMQ_LOGIN")]
    pub rabbitmq_login: Option<String>,
    #[clap(long, env = "RABBITMQ_PASSCODE", hide_env_values = true)]
    pub rabbitmq_passcode: Option<String>,
    #[clap(long, env = "KAFKA_BROKER_ADDRESS_1")]
    pub kafka_broker_address_1: Option<String>,
    #[clap(long, env = "KAFKA_BROKER_ADDRESS_2")]
    pub kafka_broker_address_2: Option<String>,
    #[clap(long, env = "KAFKA_CLIENT_ID")]
    pub kafka_client_id: Option<String>,
    #[clap(long, env = "KAFKA_SSL")]
    pub kafka_ssl: bool,
    #[clap(long, env = "KAFKA_SASL_MECHANISM")]
    pub kafka_sasl_mechanism: Option<String>,
    #[clap(long, env = "KAFKA_USERNAME")]
    pub kafka_username: Option<String>,
    #[clap(long, env = "KAFKA_PASSWORD", hide_env_values = true)]
    pub kafka_password: Option<String>,
}

/// On-disk event cache location
#[derive(Debug, Clone, Args)]
pub struct CacheConfig {
    #[clap(long, env = "CACHE_DIR", default_value = "./cache")]
    pub cache_dir: String,
}

/// Health probe and metrics HTTP server
#[derive(Debug, Clone, Args)]
pub struct HttpConfig {
    #[clap(long, env = "HTTP_BIND_ADDRESS", default_value = DEFAULT_HTTP_BIND_ADDRESS)]
    pub http_bind_address: String,
    #[clap(long, env = "PORT", default_value_t = DEFAULT_HTTP_PORT)]
    pub port: u16,
}

/// Log configuration
#[derive(Debug, Clone, Args)]
pub struct LogConfig {
    #[clap(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
    #[clap(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Plain)]
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Parser)]
#[clap(version, about = "Deposit guardian daemon")]
pub struct Config {
    #[command(flatten)]
    pub provider: ProviderConfig,
    #[command(flatten)]
    pub keys_api: KeysApiConfig,
    #[command(flatten)]
    pub broker: BrokerConfig,
    #[command(flatten)]
    pub cache: CacheConfig,
    #[command(flatten)]
    pub http: HttpConfig,
    #[command(flatten)]
    pub log: LogConfig,
}

impl KeysApiConfig {
    pub fn base_url(&self) -> String {
        format!("{}:{}", self.keys_api_host, self.keys_api_port)
    }
}
