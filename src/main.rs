use anyhow::Context;
use clap::Parser;
use kafka_mock::{logging, MockCluster, MockClusterConfig};

/// A mock Kafka cluster: a controllable, fault-injectable broker fleet for
/// exercising Kafka clients end-to-end without a real cluster.
#[derive(Debug, Parser)]
#[command(about, version)]
pub struct Cli {
    /// Number of brokers to bring up.
    #[arg(long, default_value = "3", env = "BROKER_CNT")]
    brokers: i32,
    /// First listen port; broker `i` listens on `port-base + i`.
    /// 0 picks ephemeral ports.
    #[arg(long, default_value = "0", env = "PORT_BASE")]
    port_base: u16,
    /// Topics to create at startup, as `name[:partitions[:replication]]`.
    /// May be given multiple times.
    #[arg(long = "topic", value_name = "SPEC")]
    topics: Vec<String>,
    /// Partition count for topics auto-created on metadata requests.
    #[arg(long, default_value = "4", env = "AUTO_CREATE_PARTITIONS")]
    auto_create_partitions: i32,
    /// Replication factor for auto-created topics. Defaults to
    /// min(3, brokers).
    #[arg(long, env = "AUTO_CREATE_REPLICATION")]
    auto_create_replication: Option<i32>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::install();

    let cli = Cli::parse();

    let cluster = MockCluster::spawn(MockClusterConfig {
        broker_cnt: cli.brokers,
        port_base: (cli.port_base != 0).then_some(cli.port_base),
        auto_create_partition_cnt: cli.auto_create_partitions,
        auto_create_replication_factor: cli.auto_create_replication,
    })?;

    for spec in &cli.topics {
        let (name, partition_cnt, replication_factor) = parse_topic_spec(spec)?;
        cluster
            .create_topic(name, partition_cnt, replication_factor)
            .await
            .with_context(|| format!("failed to create topic {name:?}"))?;
    }

    // The bootstrap string is the one piece of output scripts consume.
    println!("{}", cluster.bootstrap_servers());

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for CTRL-C")?;
    tracing::info!("received Ctrl+C, shutting down");
    cluster.shutdown();

    Ok(())
}

fn parse_topic_spec(spec: &str) -> anyhow::Result<(&str, i32, i32)> {
    let mut parts = spec.splitn(3, ':');
    let name = parts
        .next()
        .filter(|name| !name.is_empty())
        .with_context(|| format!("topic spec {spec:?} is missing a name"))?;
    let partition_cnt = parts
        .next()
        .map(str::parse)
        .transpose()
        .with_context(|| format!("topic spec {spec:?} has an invalid partition count"))?
        .unwrap_or(1);
    let replication_factor = parts
        .next()
        .map(str::parse)
        .transpose()
        .with_context(|| format!("topic spec {spec:?} has an invalid replication factor"))?
        .unwrap_or(1);
    Ok((name, partition_cnt, replication_factor))
}
