//! Metadata semantics: broker enumeration, controller election, topic
//! auto-creation, sticky topic errors, and injected error stacks.

use crate::harness::{topic_name, TestClient};
use kafka_mock::{MockCluster, MockClusterConfig};
use kafka_protocol::{
    error::ResponseError,
    messages::{self, ApiKey},
};
use std::time::{Duration, Instant};

const METADATA: i16 = 9;

fn metadata_for(topic: &str) -> messages::MetadataRequest {
    messages::MetadataRequest::default().with_topics(Some(vec![
        messages::metadata_request::MetadataRequestTopic::default()
            .with_name(Some(topic_name(topic))),
    ]))
}

/// A fresh three-broker cluster reports every broker exactly once, no
/// topics, and the lowest broker id as controller.
#[tokio::test]
async fn metadata_lists_brokers_and_controller() -> anyhow::Result<()> {
    super::init_tracing();
    let cluster = MockCluster::spawn(MockClusterConfig::default())?;
    let mut client = TestClient::connect_bootstrap(cluster.bootstrap_servers()).await?;

    let resp = client
        .send_request(messages::MetadataRequest::default(), METADATA)
        .await?;

    let mut broker_ids: Vec<i32> = resp.brokers.iter().map(|b| b.node_id.0).collect();
    broker_ids.sort();
    assert_eq!(broker_ids, vec![1, 2, 3]);
    assert_eq!(resp.controller_id.0, 1);
    assert!(resp.topics.is_empty());
    assert_eq!(
        resp.cluster_id.as_ref().map(|id| id.as_str()),
        Some(cluster.id())
    );
    Ok(())
}

/// An unknown topic without auto-creation allowed reports
/// UnknownTopicOrPartition and is not materialized.
#[tokio::test]
async fn metadata_unknown_topic_without_auto_create() -> anyhow::Result<()> {
    super::init_tracing();
    let cluster = MockCluster::spawn(MockClusterConfig::default())?;
    let mut client = TestClient::connect_bootstrap(cluster.bootstrap_servers()).await?;

    let req = metadata_for("absent").with_allow_auto_topic_creation(false);
    let resp = client.send_request(req, METADATA).await?;

    assert_eq!(
        resp.topics[0].error_code,
        ResponseError::UnknownTopicOrPartition.code()
    );

    let resp = client
        .send_request(messages::MetadataRequest::default(), METADATA)
        .await?;
    assert!(resp.topics.is_empty(), "topic was not materialized");
    Ok(())
}

/// Auto-creation materializes the cluster defaults with a deterministic
/// round-robin assignment; a second metadata request observes the identical
/// assignment.
#[tokio::test]
async fn metadata_auto_creates_with_deterministic_assignment() -> anyhow::Result<()> {
    super::init_tracing();
    let cluster = MockCluster::spawn(MockClusterConfig {
        auto_create_partition_cnt: 4,
        auto_create_replication_factor: Some(2),
        ..Default::default()
    })?;
    let mut client = TestClient::connect_bootstrap(cluster.bootstrap_servers()).await?;

    let assignment = |resp: &messages::MetadataResponse| -> Vec<(i32, Vec<i32>)> {
        let mut partitions: Vec<_> = resp.topics[0].partitions.clone();
        partitions.sort_by_key(|p| p.partition_index);
        partitions
            .iter()
            .map(|p| {
                (
                    p.leader_id.0,
                    p.replica_nodes.iter().map(|r| r.0).collect::<Vec<_>>(),
                )
            })
            .collect()
    };

    let req = metadata_for("auto").with_allow_auto_topic_creation(true);
    let first = client.send_request(req.clone(), METADATA).await?;
    assert_eq!(first.topics[0].error_code, 0);
    assert_eq!(first.topics[0].partitions.len(), 4);

    let first_assignment = assignment(&first);
    let distinct: std::collections::HashSet<_> = first_assignment.iter().cloned().collect();
    assert_eq!(distinct.len(), 4, "each partition has a distinct assignment");
    for (leader, replicas) in &first_assignment {
        assert_eq!(replicas.len(), 2);
        assert!(replicas.contains(leader), "leader is always a replica");
    }

    let second = client.send_request(req, METADATA).await?;
    assert_eq!(first_assignment, assignment(&second));
    Ok(())
}

/// Auto-creation fails with InvalidReplicationFactor when the defaults ask
/// for more replicas than there are brokers.
#[tokio::test]
async fn metadata_auto_create_rejects_bad_replication() -> anyhow::Result<()> {
    super::init_tracing();
    let cluster = MockCluster::spawn(MockClusterConfig {
        broker_cnt: 2,
        auto_create_replication_factor: Some(3),
        ..Default::default()
    })?;
    let mut client = TestClient::connect_bootstrap(cluster.bootstrap_servers()).await?;

    let req = metadata_for("auto").with_allow_auto_topic_creation(true);
    let resp = client.send_request(req, METADATA).await?;
    assert_eq!(
        resp.topics[0].error_code,
        ResponseError::InvalidReplicationFactor.code()
    );
    Ok(())
}

/// Pushing an error stack for Metadata poisons exactly the next request;
/// the one after reports success again.
#[tokio::test]
async fn injected_error_marks_one_response() -> anyhow::Result<()> {
    super::init_tracing();
    let cluster = MockCluster::spawn(MockClusterConfig::default())?;
    cluster.create_topic("t", 2, 1).await?;
    cluster.push_request_errors(
        Some(ApiKey::MetadataKey),
        &[ResponseError::LeaderNotAvailable],
    );

    let mut client = TestClient::connect_bootstrap(cluster.bootstrap_servers()).await?;

    let poisoned = client.send_request(metadata_for("t"), METADATA).await?;
    let topic = &poisoned.topics[0];
    assert_eq!(topic.error_code, ResponseError::LeaderNotAvailable.code());
    assert_eq!(topic.partitions.len(), 2);
    for partition in &topic.partitions {
        assert_eq!(
            partition.error_code,
            ResponseError::LeaderNotAvailable.code()
        );
    }

    let clean = client.send_request(metadata_for("t"), METADATA).await?;
    assert_eq!(clean.topics[0].error_code, 0);
    for partition in &clean.topics[0].partitions {
        assert_eq!(partition.error_code, 0);
        assert!(partition.leader_id.0 > 0);
    }
    Ok(())
}

/// A queue of two errors is served in FIFO order before success resumes.
#[tokio::test]
async fn injected_errors_are_fifo() -> anyhow::Result<()> {
    super::init_tracing();
    let cluster = MockCluster::spawn(MockClusterConfig::default())?;
    cluster.create_topic("t", 1, 1).await?;
    cluster.push_request_errors(
        Some(ApiKey::MetadataKey),
        &[
            ResponseError::LeaderNotAvailable,
            ResponseError::RequestTimedOut,
        ],
    );

    let mut client = TestClient::connect_bootstrap(cluster.bootstrap_servers()).await?;

    for expected in [
        ResponseError::LeaderNotAvailable.code(),
        ResponseError::RequestTimedOut.code(),
        0,
    ] {
        let resp = client.send_request(metadata_for("t"), METADATA).await?;
        assert_eq!(resp.topics[0].error_code, expected);
    }
    Ok(())
}

/// A sticky topic error applies to every request touching the topic until
/// cleared.
#[tokio::test]
async fn sticky_topic_error_applies_until_cleared() -> anyhow::Result<()> {
    super::init_tracing();
    let cluster = MockCluster::spawn(MockClusterConfig::default())?;
    cluster.create_topic("t", 1, 1).await?;
    cluster
        .set_topic_error("t", Some(ResponseError::LeaderNotAvailable))
        .await?;

    let mut client = TestClient::connect_bootstrap(cluster.bootstrap_servers()).await?;

    for _ in 0..2 {
        let resp = client.send_request(metadata_for("t"), METADATA).await?;
        assert_eq!(
            resp.topics[0].error_code,
            ResponseError::LeaderNotAvailable.code()
        );
    }

    cluster.set_topic_error("t", None).await?;
    let resp = client.send_request(metadata_for("t"), METADATA).await?;
    assert_eq!(resp.topics[0].error_code, 0);
    Ok(())
}

/// A configured broker write delay holds back responses.
#[tokio::test]
async fn write_delay_slows_responses() -> anyhow::Result<()> {
    super::init_tracing();
    let cluster = MockCluster::spawn(MockClusterConfig::default())?;
    cluster
        .set_broker_write_delay(1, Some(Duration::from_millis(150)))
        .await?;

    let mut client = TestClient::connect_bootstrap(cluster.bootstrap_servers()).await?;

    let started = Instant::now();
    client
        .send_request(messages::MetadataRequest::default(), METADATA)
        .await?;
    assert!(started.elapsed() >= Duration::from_millis(150));
    Ok(())
}

/// Broker racks set through the control surface show up in metadata.
#[tokio::test]
async fn broker_rack_is_advertised() -> anyhow::Result<()> {
    super::init_tracing();
    let cluster = MockCluster::spawn(MockClusterConfig::default())?;
    cluster.set_broker_rack(2, Some("rack-b")).await?;

    let mut client = TestClient::connect_bootstrap(cluster.bootstrap_servers()).await?;
    let resp = client
        .send_request(messages::MetadataRequest::default(), METADATA)
        .await?;

    let broker = resp.brokers.iter().find(|b| b.node_id.0 == 2).unwrap();
    assert_eq!(broker.rack.as_ref().map(|r| r.as_str()), Some("rack-b"));
    Ok(())
}
