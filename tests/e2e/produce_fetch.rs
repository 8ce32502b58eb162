//! Produce/fetch semantics: base-offset assignment, byte-for-byte log
//! round-trips, leader enforcement, and preferred-follower reads.

use crate::harness::{
    broker_addr, fetch_partition, fetch_request, produce_request, record_batch, TestClient,
};
use kafka_mock::{MockCluster, MockClusterConfig};
use kafka_protocol::{error::ResponseError, messages};

const PRODUCE: i16 = 9;
const FETCH: i16 = 12;

async fn single_partition_cluster() -> anyhow::Result<MockCluster> {
    let cluster = MockCluster::spawn(MockClusterConfig::default())?;
    // A one-partition topic always leads on broker 1, the first bootstrap
    // entry.
    cluster.create_topic("t", 1, 1).await?;
    Ok(cluster)
}

/// Five produced batches are assigned base offsets 0..=4, and a fetch from
/// offset 0 returns exactly their concatenated bytes.
#[tokio::test]
async fn produce_then_fetch_round_trips_bytes() -> anyhow::Result<()> {
    super::init_tracing();
    let cluster = single_partition_cluster().await?;
    let mut client = TestClient::connect_bootstrap(cluster.bootstrap_servers()).await?;

    let mut produced = Vec::new();
    for i in 0..5 {
        let batch = record_batch(&[&format!("record-{i}")]);
        produced.extend_from_slice(&batch);

        let resp = client
            .send_request(produce_request("t", 0, batch), PRODUCE)
            .await?;
        let partition = &resp.responses[0].partition_responses[0];
        assert_eq!(partition.error_code, 0);
        assert_eq!(partition.base_offset, i);
    }

    let resp = client
        .send_request(fetch_request("t", 0, 0), FETCH)
        .await?;
    let partition = fetch_partition(&resp);
    assert_eq!(partition.error_code, 0);
    assert_eq!(partition.high_watermark, 5);
    assert_eq!(partition.log_start_offset, 0);
    assert_eq!(
        partition.records.as_deref(),
        Some(&produced[..]),
        "fetch returns the produced batches byte-for-byte, in order"
    );
    Ok(())
}

/// Producing to a broker that is not the partition leader is rejected.
#[tokio::test]
async fn produce_to_non_leader_is_rejected() -> anyhow::Result<()> {
    super::init_tracing();
    let cluster = single_partition_cluster().await?;
    let mut client =
        TestClient::connect(broker_addr(cluster.bootstrap_servers(), 1)).await?;

    let resp = client
        .send_request(produce_request("t", 0, record_batch(&["x"])), PRODUCE)
        .await?;
    assert_eq!(
        resp.responses[0].partition_responses[0].error_code,
        ResponseError::NotLeaderOrFollower.code()
    );
    Ok(())
}

/// A batch whose header is not a parseable v2 record batch fails with
/// InvalidRecord and leaves the log untouched.
#[tokio::test]
async fn produce_rejects_garbage_batches() -> anyhow::Result<()> {
    super::init_tracing();
    let cluster = single_partition_cluster().await?;
    let mut client = TestClient::connect_bootstrap(cluster.bootstrap_servers()).await?;

    let garbage = bytes::Bytes::from_static(b"not a record batch");
    let resp = client
        .send_request(produce_request("t", 0, garbage), PRODUCE)
        .await?;
    assert_eq!(
        resp.responses[0].partition_responses[0].error_code,
        ResponseError::InvalidRecord.code()
    );

    let resp = client
        .send_request(fetch_request("t", 0, 0), FETCH)
        .await?;
    assert_eq!(fetch_partition(&resp).high_watermark, 0);
    Ok(())
}

/// Produce with acks=0 sends no response; the connection stays usable for
/// the next request.
#[tokio::test]
async fn produce_acks_zero_has_no_response() -> anyhow::Result<()> {
    super::init_tracing();
    let cluster = single_partition_cluster().await?;
    let mut client = TestClient::connect_bootstrap(cluster.bootstrap_servers()).await?;

    let req = produce_request("t", 0, record_batch(&["fire-and-forget"])).with_acks(0);
    client.send(&req, PRODUCE).await?;

    // The next response on the wire belongs to this fetch, not the produce.
    let resp = client
        .send_request(fetch_request("t", 0, 0), FETCH)
        .await?;
    let partition = fetch_partition(&resp);
    assert_eq!(partition.error_code, 0);
    assert_eq!(partition.high_watermark, 1, "acks=0 produce still appended");
    Ok(())
}

/// Fetching at the log end is an empty success; fetching beyond it is
/// OffsetOutOfRange.
#[tokio::test]
async fn fetch_bounds() -> anyhow::Result<()> {
    super::init_tracing();
    let cluster = single_partition_cluster().await?;
    let mut client = TestClient::connect_bootstrap(cluster.bootstrap_servers()).await?;

    client
        .send_request(produce_request("t", 0, record_batch(&["a", "b"])), PRODUCE)
        .await?;

    let resp = client
        .send_request(fetch_request("t", 0, 2), FETCH)
        .await?;
    let partition = fetch_partition(&resp);
    assert_eq!(partition.error_code, 0);
    assert!(partition.records.as_ref().map_or(true, |r| r.is_empty()));

    let resp = client
        .send_request(fetch_request("t", 0, 99), FETCH)
        .await?;
    assert_eq!(
        fetch_partition(&resp).error_code,
        ResponseError::OffsetOutOfRange.code()
    );

    let resp = client
        .send_request(fetch_request("absent", 0, 0), FETCH)
        .await?;
    assert_eq!(
        fetch_partition(&resp).error_code,
        ResponseError::UnknownTopicOrPartition.code()
    );
    Ok(())
}

/// With a preferred follower configured, the leader steers the client at it
/// and the follower serves only up to its own end offset.
#[tokio::test]
async fn preferred_follower_serves_capped_log() -> anyhow::Result<()> {
    super::init_tracing();
    let cluster = single_partition_cluster().await?;
    let mut leader = TestClient::connect_bootstrap(cluster.bootstrap_servers()).await?;

    let mut produced = Vec::new();
    for i in 0..5 {
        let batch = record_batch(&[&format!("record-{i}")]);
        produced.push(batch.clone());
        leader
            .send_request(produce_request("t", 0, batch), PRODUCE)
            .await?;
    }

    cluster.set_partition_follower("t", 0, Some(2)).await?;
    cluster
        .set_partition_follower_offsets("t", 0, Some(0), Some(2))
        .await?;

    // The leader no longer serves data; it points at the follower.
    let resp = leader
        .send_request(fetch_request("t", 0, 0), FETCH)
        .await?;
    let partition = fetch_partition(&resp);
    assert_eq!(partition.error_code, 0);
    assert_eq!(partition.preferred_read_replica.0, 2);
    assert!(partition.records.as_ref().map_or(true, |r| r.is_empty()));

    // The follower serves, but only msgsets below its end offset.
    let mut follower =
        TestClient::connect(broker_addr(cluster.bootstrap_servers(), 1)).await?;
    let resp = follower
        .send_request(fetch_request("t", 0, 0), FETCH)
        .await?;
    let partition = fetch_partition(&resp);
    assert_eq!(partition.error_code, 0);
    assert_eq!(partition.high_watermark, 2);
    let expected: Vec<u8> = produced[..2].concat();
    assert_eq!(partition.records.as_deref(), Some(&expected[..]));

    // A broker that is neither leader nor preferred follower refuses.
    let mut bystander =
        TestClient::connect(broker_addr(cluster.bootstrap_servers(), 2)).await?;
    let resp = bystander
        .send_request(fetch_request("t", 0, 0), FETCH)
        .await?;
    assert_eq!(
        fetch_partition(&resp).error_code,
        ResponseError::NotLeaderOrFollower.code()
    );
    Ok(())
}

/// An injected produce error wins over the real outcome and does not
/// advance the log.
#[tokio::test]
async fn injected_produce_error_suppresses_append() -> anyhow::Result<()> {
    super::init_tracing();
    let cluster = single_partition_cluster().await?;
    cluster.push_request_errors(
        Some(messages::ApiKey::ProduceKey),
        &[ResponseError::NotEnoughReplicas],
    );

    let mut client = TestClient::connect_bootstrap(cluster.bootstrap_servers()).await?;
    let resp = client
        .send_request(produce_request("t", 0, record_batch(&["x"])), PRODUCE)
        .await?;
    assert_eq!(
        resp.responses[0].partition_responses[0].error_code,
        ResponseError::NotEnoughReplicas.code()
    );

    let resp = client
        .send_request(fetch_request("t", 0, 0), FETCH)
        .await?;
    assert_eq!(fetch_partition(&resp).high_watermark, 0);
    Ok(())
}
