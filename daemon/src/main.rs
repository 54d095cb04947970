use std::{io::Write, str::FromStr, sync::Arc};

use alloy::signers::local::PrivateKeySigner;
use alloy_primitives::Address;
use clap::Parser;
use log::{error, info, LevelFilter};

use guardian_common::config::VERSION;
use guardian_daemon::{
    config::{Config, LogConfig, LogFormat, PubsubService},
    core::{
        broker::MessageBroker,
        cache::{disk::CacheStore, DepositEventCache},
        chain::RpcChainClient,
        error::{ErrorKind, GuardianError},
        keys::KeysApiClient,
        orchestrator::GuardianService,
        pauser::PauseSubmitter,
        signer::GuardianSigner,
        status::StatusTracker,
    },
    rpc::ApiServer,
};

use guardian_daemon::config::EXIT_CODE_FATAL;

#[cfg(feature = "kafka")]
use guardian_daemon::core::broker::kafka::KafkaBroker;
use guardian_daemon::core::broker::rabbitmq::RabbitMqBroker;

fn init_logger(config: &LogConfig) {
    let level = LevelFilter::from_str(&config.log_level).unwrap_or(LevelFilter::Info);
    let mut builder = env_logger::Builder::new();
    builder.filter_level(level);
    if config.log_format == LogFormat::Json {
        builder.format(|buf, record| {
            let line = serde_json::json!({
                "ts": guardian_common::time::get_current_time_in_seconds(),
                "level": record.level().as_str(),
                "target": record.target(),
                "message": record.args().to_string(),
            });
            writeln!(buf, "{}", line)
        });
    }
    builder.init();
}

fn parse_address(value: &str, name: &str) -> Result<Address, GuardianError> {
    Address::from_str(value)
        .map_err(|e| GuardianError::Config(format!("invalid {}: {}", name, e)))
}

fn build_broker(config: &Config) -> Result<Arc<dyn MessageBroker>, GuardianError> {
    match config.broker.pubsub_service {
        PubsubService::Rabbitmq => {
            let broker = RabbitMqBroker::new(&config.broker)
                .map_err(|e| GuardianError::Config(e.to_string()))?;
            Ok(Arc::new(broker))
        }
        #[cfg(feature = "kafka")]
        PubsubService::Kafka => {
            let broker = KafkaBroker::new(&config.broker)
                .map_err(|e| GuardianError::Config(e.to_string()))?;
            Ok(Arc::new(broker))
        }
        #[cfg(not(feature = "kafka"))]
        PubsubService::Kafka => Err(GuardianError::Config(
            "this build has no kafka support; rebuild with --features kafka".into(),
        )),
    }
}

async fn run(config: Config) -> Result<(), GuardianError> {
    info!("deposit guardian daemon v{}", VERSION);

    let signer = Arc::new(GuardianSigner::new(&config.provider.wallet_private_key)?);
    info!("guardian wallet: {}", signer.address());

    let deposit_contract = parse_address(
        &config.provider.deposit_contract_address,
        "DEPOSIT_CONTRACT_ADDRESS",
    )?;
    let security_module = parse_address(
        &config.provider.deposit_security_module_address,
        "DEPOSIT_SECURITY_MODULE_ADDRESS",
    )?;
    let staking_router = parse_address(
        &config.provider.staking_router_address,
        "STAKING_ROUTER_ADDRESS",
    )?;

    let key = config.provider.wallet_private_key.trim();
    let tx_signer: PrivateKeySigner = key
        .strip_prefix("0x")
        .unwrap_or(key)
        .parse()
        .map_err(|_| GuardianError::Config("invalid WALLET_PRIVATE_KEY".into()))?;

    let chain = Arc::new(
        RpcChainClient::connect(
            &config.provider.rpc_url,
            tx_signer,
            deposit_contract,
            security_module,
            staking_router,
        )
        .await?,
    );
    chain.ensure_chain(config.provider.chain_id).await?;
    info!(
        "connected to {} (chain {})",
        config.provider.rpc_url, config.provider.chain_id
    );

    let store = CacheStore::new(&config.cache.cache_dir, config.provider.chain_id);
    let cache = Arc::new(DepositEventCache::load(
        chain.clone(),
        store,
        config.provider.deposit_contract_deploy_block,
    )?);

    let keys = Arc::new(KeysApiClient::new(&config.keys_api)?);
    let broker = build_broker(&config)?;
    info!(
        "publishing to topic {} via {}",
        config.broker.broker_topic,
        broker.name()
    );

    let status = Arc::new(StatusTracker::new());
    let api = ApiServer::start(
        &format!("{}:{}", config.http.http_bind_address, config.http.port),
        status.clone(),
    )
    .await
    .map_err(|e| GuardianError::Config(format!("{e:#}")))?;

    let pauser = Arc::new(PauseSubmitter::new(chain.clone()));
    let service = Arc::new(GuardianService::new(
        chain,
        cache,
        keys,
        broker,
        signer,
        pauser,
        status,
    ));
    service.start().await?;

    wait_for_shutdown(&service).await;

    let result = service.stop().await;
    api.stop().await;
    result
}

async fn wait_for_shutdown<C, K, M>(service: &GuardianService<C, K, M>)
where
    C: guardian_daemon::core::chain::ChainClient,
    K: guardian_daemon::core::keys::KeysRegistry,
    M: MessageBroker + ?Sized,
{
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                error!("failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = service.join() => error!("guardian service exited unexpectedly"),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
            _ = service.join() => error!("guardian service exited unexpectedly"),
        }
    }
}

#[tokio::main]
async fn main() {
    let config = Config::parse();
    init_logger(&config.log);

    if let Err(e) = run(config).await {
        error!("{}", e);
        let code = if e.kind() == ErrorKind::Fatal {
            EXIT_CODE_FATAL
        } else {
            1
        };
        std::process::exit(code);
    }
}
