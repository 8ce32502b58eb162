use crate::{error_stack::ErrorStacks, session::Session, topology::Topic};
use anyhow::Context;
use bytes::BytesMut;
use futures::TryStreamExt;
use kafka_protocol::{
    error::ResponseError,
    messages::{ApiKey, TopicName},
    protocol::StrBytes,
};
use rand::{distributions::Alphanumeric, Rng};
use std::{cell::RefCell, net::SocketAddr, rc::Rc, sync::Arc, time::Duration};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Error returned by control-plane operations.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("unknown topic {0:?}")]
    UnknownTopic(String),
    #[error("unknown partition {topic:?}/{partition}")]
    UnknownPartition { topic: String, partition: i32 },
    #[error("unknown broker {0}")]
    UnknownBroker(i32),
    #[error("topic {0:?} already exists")]
    TopicExists(String),
    #[error("replication factor {replication_factor} exceeds {broker_cnt} brokers")]
    InvalidReplicationFactor {
        replication_factor: i32,
        broker_cnt: i32,
    },
    #[error("cluster has shut down")]
    ClusterDown,
}

/// A mock broker: its advertised address plus the knobs a test can turn.
/// The listen socket itself lives with the broker's accept task.
pub(crate) struct Broker {
    pub id: i32,
    pub host: String,
    pub port: u16,
    pub rack: Option<String>,
    /// When set, every response written by this broker's connections is
    /// delayed by this duration, simulating a slow broker.
    pub write_delay: Option<Duration>,
}

pub(crate) struct AutoCreateDefaults {
    pub partition_cnt: i32,
    pub replication_factor: i32,
}

/// All cluster state other than the error-stack store. Owned by the cluster
/// thread; protocol handlers and control-op application mutate it through a
/// shared `Rc<RefCell<_>>`, serialized by the single-threaded runtime.
pub(crate) struct ClusterState {
    pub id: String,
    pub controller_id: i32,
    pub brokers: Vec<Broker>,
    pub topics: Vec<Topic>,
    pub defaults: AutoCreateDefaults,
}

impl ClusterState {
    pub fn broker(&self, id: i32) -> Option<&Broker> {
        self.brokers.iter().find(|b| b.id == id)
    }

    pub fn broker_mut(&mut self, id: i32) -> Option<&mut Broker> {
        self.brokers.iter_mut().find(|b| b.id == id)
    }

    pub fn topic_find(&self, name: &str) -> Option<&Topic> {
        self.topics.iter().find(|t| t.name.as_str() == name)
    }

    pub fn topic_find_mut(&mut self, name: &str) -> Option<&mut Topic> {
        self.topics.iter_mut().find(|t| t.name.as_str() == name)
    }

    /// Create a topic with round-robin replica assignment: replica `i` of
    /// partition `p` is the `(p + i) % broker_cnt`'th broker, and the leader
    /// is replica `p % replication_factor`. Deterministic for a fixed broker
    /// set, so repeated metadata requests observe identical assignments.
    pub fn create_topic(
        &mut self,
        name: TopicName,
        partition_cnt: i32,
        replication_factor: i32,
    ) -> Result<(), ControlError> {
        let broker_cnt = self.brokers.len() as i32;
        if replication_factor < 1 || replication_factor > broker_cnt {
            return Err(ControlError::InvalidReplicationFactor {
                replication_factor,
                broker_cnt,
            });
        }
        if self.topic_find(name.as_str()).is_some() {
            return Err(ControlError::TopicExists(name.to_string()));
        }

        let mut topic = Topic::new(name, partition_cnt);
        for part in topic.partitions.iter_mut() {
            let p = part.id as usize;
            part.replicas = (0..replication_factor as usize)
                .map(|i| self.brokers[(p + i) % self.brokers.len()].id)
                .collect();
            part.leader = part.replicas[p % replication_factor as usize];
        }
        self.topics.push(topic);
        Ok(())
    }

    /// Materialize an unknown topic using the cluster's auto-create defaults.
    pub fn topic_auto_create(&mut self, name: TopicName) -> Result<&Topic, ResponseError> {
        let partition_cnt = self.defaults.partition_cnt;
        let replication_factor = self.defaults.replication_factor;
        self.create_topic(name.clone(), partition_cnt, replication_factor)
            .map_err(|_| ResponseError::InvalidReplicationFactor)?;
        Ok(self
            .topic_find(name.as_str())
            .expect("topic was just created"))
    }

    /// Deterministically map a coordinator key (group or transactional id)
    /// onto a broker: CRC32 of the key bytes modulo the broker count.
    pub fn get_coord(&self, key: &[u8]) -> &Broker {
        let idx = crc32fast::hash(key) as usize % self.brokers.len();
        &self.brokers[idx]
    }
}

/// Configuration for [`MockCluster::spawn`].
pub struct MockClusterConfig {
    /// Number of brokers to bring up. Broker ids are `1..=broker_cnt`.
    pub broker_cnt: i32,
    /// When set, broker `i` listens on `port_base + i`; otherwise ports are
    /// ephemeral.
    pub port_base: Option<u16>,
    /// Partition count for topics auto-created on metadata requests.
    pub auto_create_partition_cnt: i32,
    /// Replication factor for auto-created topics. Defaults to
    /// `min(3, broker_cnt)`.
    pub auto_create_replication_factor: Option<i32>,
}

impl Default for MockClusterConfig {
    fn default() -> Self {
        Self {
            broker_cnt: 3,
            port_base: None,
            auto_create_partition_cnt: 4,
            auto_create_replication_factor: None,
        }
    }
}

enum ControlOp {
    CreateTopic {
        name: TopicName,
        partition_cnt: i32,
        replication_factor: i32,
        done: oneshot::Sender<Result<(), ControlError>>,
    },
    SetPartitionLeader {
        topic: String,
        partition: i32,
        broker_id: i32,
        done: oneshot::Sender<Result<(), ControlError>>,
    },
    SetPartitionReplicas {
        topic: String,
        partition: i32,
        replicas: Vec<i32>,
        done: oneshot::Sender<Result<(), ControlError>>,
    },
    SetPartitionFollower {
        topic: String,
        partition: i32,
        broker_id: Option<i32>,
        done: oneshot::Sender<Result<(), ControlError>>,
    },
    SetPartitionFollowerOffsets {
        topic: String,
        partition: i32,
        start_offset: Option<i64>,
        end_offset: Option<i64>,
        done: oneshot::Sender<Result<(), ControlError>>,
    },
    SetTopicError {
        topic: String,
        err: Option<ResponseError>,
        done: oneshot::Sender<Result<(), ControlError>>,
    },
    SetBrokerRack {
        broker_id: i32,
        rack: Option<String>,
        done: oneshot::Sender<Result<(), ControlError>>,
    },
    SetBrokerWriteDelay {
        broker_id: i32,
        delay: Option<Duration>,
        done: oneshot::Sender<Result<(), ControlError>>,
    },
    SetAutoCreateDefaults {
        partition_cnt: i32,
        replication_factor: i32,
        done: oneshot::Sender<Result<(), ControlError>>,
    },
    Shutdown,
}

/// Handle to a running mock cluster.
///
/// The cluster itself runs on a dedicated OS thread; this handle is the
/// thread-safe control façade. Immutable accessors answer directly, error
/// injection goes straight to the mutex-guarded error-stack store, and every
/// other mutation is marshalled onto the cluster thread through the control
/// queue. Dropping the handle shuts the cluster down and joins its thread.
pub struct MockCluster {
    id: String,
    bootstrap: String,
    ops: mpsc::UnboundedSender<ControlOp>,
    errors: Arc<ErrorStacks>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl MockCluster {
    /// Bind listen sockets for every broker and start the cluster thread.
    /// Fails if any listener cannot be bound.
    pub fn spawn(config: MockClusterConfig) -> anyhow::Result<Self> {
        anyhow::ensure!(config.broker_cnt >= 1, "cluster needs at least one broker");

        let id: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(22)
            .map(char::from)
            .collect();

        let mut brokers = Vec::new();
        let mut listeners = Vec::new();
        for i in 0..config.broker_cnt {
            let port = config.port_base.map_or(0, |base| base + i as u16);
            let listener = std::net::TcpListener::bind(("127.0.0.1", port))
                .with_context(|| format!("failed to bind listener for broker {}", i + 1))?;
            listener
                .set_nonblocking(true)
                .context("failed to set listener non-blocking")?;
            let addr = listener.local_addr()?;
            brokers.push(Broker {
                id: i + 1,
                host: "127.0.0.1".to_string(),
                port: addr.port(),
                rack: None,
                write_delay: None,
            });
            listeners.push((i + 1, listener));
        }

        let bootstrap = brokers
            .iter()
            .map(|b| format!("{}:{}", b.host, b.port))
            .collect::<Vec<_>>()
            .join(",");

        let state = ClusterState {
            id: id.clone(),
            // The controller is the lowest-id broker.
            controller_id: brokers.iter().map(|b| b.id).min().unwrap_or(-1),
            brokers,
            topics: Vec::new(),
            defaults: AutoCreateDefaults {
                partition_cnt: config.auto_create_partition_cnt,
                replication_factor: config
                    .auto_create_replication_factor
                    .unwrap_or_else(|| config.broker_cnt.min(3)),
            },
        };

        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        let errors = Arc::new(ErrorStacks::new());

        let thread_errors = errors.clone();
        let thread = std::thread::Builder::new()
            .name(format!("kafka-mock/{id}"))
            .spawn(move || run_cluster(state, listeners, ops_rx, thread_errors))
            .context("failed to spawn cluster thread")?;

        tracing::info!(cluster_id = %id, %bootstrap, "mock cluster is up");

        Ok(Self {
            id,
            bootstrap,
            ops: ops_tx,
            errors,
            thread: Some(thread),
        })
    }

    /// The generated cluster id advertised in metadata responses.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// `host:port,...` list clients bootstrap from.
    pub fn bootstrap_servers(&self) -> &str {
        &self.bootstrap
    }

    /// Push a stack of errors returned, one per request, for the next
    /// `errors.len()` requests of `api_key` (`None` matches any ApiKey).
    /// Injected errors win over real outcomes. Callable from any thread.
    pub fn push_request_errors(&self, api_key: Option<ApiKey>, errors: &[ResponseError]) {
        self.errors.push(api_key, errors);
    }

    pub async fn create_topic(
        &self,
        name: &str,
        partition_cnt: i32,
        replication_factor: i32,
    ) -> Result<(), ControlError> {
        self.op(|done| ControlOp::CreateTopic {
            name: TopicName(StrBytes::from_string(name.to_string())),
            partition_cnt,
            replication_factor,
            done,
        })
        .await
    }

    pub async fn set_partition_leader(
        &self,
        topic: &str,
        partition: i32,
        broker_id: i32,
    ) -> Result<(), ControlError> {
        self.op(|done| ControlOp::SetPartitionLeader {
            topic: topic.to_string(),
            partition,
            broker_id,
            done,
        })
        .await
    }

    pub async fn set_partition_replicas(
        &self,
        topic: &str,
        partition: i32,
        replicas: &[i32],
    ) -> Result<(), ControlError> {
        self.op(|done| ControlOp::SetPartitionReplicas {
            topic: topic.to_string(),
            partition,
            replicas: replicas.to_vec(),
            done,
        })
        .await
    }

    /// Set or clear the preferred read replica for a partition. Leader
    /// fetches are redirected to this broker, which then serves reads
    /// against the partition's follower offsets.
    pub async fn set_partition_follower(
        &self,
        topic: &str,
        partition: i32,
        broker_id: Option<i32>,
    ) -> Result<(), ControlError> {
        self.op(|done| ControlOp::SetPartitionFollower {
            topic: topic.to_string(),
            partition,
            broker_id,
            done,
        })
        .await
    }

    /// Pin the follower's visible offset range. `None` resumes tracking the
    /// corresponding leader offset.
    pub async fn set_partition_follower_offsets(
        &self,
        topic: &str,
        partition: i32,
        start_offset: Option<i64>,
        end_offset: Option<i64>,
    ) -> Result<(), ControlError> {
        self.op(|done| ControlOp::SetPartitionFollowerOffsets {
            topic: topic.to_string(),
            partition,
            start_offset,
            end_offset,
            done,
        })
        .await
    }

    /// Set or clear the sticky error returned for all protocol requests
    /// touching `topic`.
    pub async fn set_topic_error(
        &self,
        topic: &str,
        err: Option<ResponseError>,
    ) -> Result<(), ControlError> {
        self.op(|done| ControlOp::SetTopicError {
            topic: topic.to_string(),
            err,
            done,
        })
        .await
    }

    pub async fn set_broker_rack(
        &self,
        broker_id: i32,
        rack: Option<&str>,
    ) -> Result<(), ControlError> {
        self.op(|done| ControlOp::SetBrokerRack {
            broker_id,
            rack: rack.map(str::to_string),
            done,
        })
        .await
    }

    /// Delay every response written by `broker_id` by `delay`, simulating a
    /// slow broker. `None` removes the delay.
    pub async fn set_broker_write_delay(
        &self,
        broker_id: i32,
        delay: Option<Duration>,
    ) -> Result<(), ControlError> {
        self.op(|done| ControlOp::SetBrokerWriteDelay {
            broker_id,
            delay,
            done,
        })
        .await
    }

    pub async fn set_auto_create_defaults(
        &self,
        partition_cnt: i32,
        replication_factor: i32,
    ) -> Result<(), ControlError> {
        self.op(|done| ControlOp::SetAutoCreateDefaults {
            partition_cnt,
            replication_factor,
            done,
        })
        .await
    }

    /// Shut the cluster down and join its thread. Equivalent to dropping
    /// the handle, but explicit.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    async fn op(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<(), ControlError>>) -> ControlOp,
    ) -> Result<(), ControlError> {
        let (done, result) = oneshot::channel();
        self.ops
            .send(build(done))
            .map_err(|_| ControlError::ClusterDown)?;
        result.await.map_err(|_| ControlError::ClusterDown)?
    }

    fn stop_and_join(&mut self) {
        let _ = self.ops.send(ControlOp::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for MockCluster {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

/// Entry point of the cluster thread: a current-thread runtime plus a
/// `LocalSet`, so accept loops, connection handlers, and control-op
/// application all execute serialized on this one thread.
fn run_cluster(
    state: ClusterState,
    listeners: Vec<(i32, std::net::TcpListener)>,
    ops: mpsc::UnboundedReceiver<ControlOp>,
    errors: Arc<ErrorStacks>,
) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build cluster runtime");
    let local = tokio::task::LocalSet::new();
    local.block_on(&runtime, cluster_main(state, listeners, ops, errors));
}

async fn cluster_main(
    state: ClusterState,
    listeners: Vec<(i32, std::net::TcpListener)>,
    mut ops: mpsc::UnboundedReceiver<ControlOp>,
    errors: Arc<ErrorStacks>,
) {
    let state = Rc::new(RefCell::new(state));
    let shutdown = CancellationToken::new();

    for (broker_id, listener) in listeners {
        let listener = tokio::net::TcpListener::from_std(listener)
            .expect("std listener converts within the runtime");
        tokio::task::spawn_local(accept_loop(
            broker_id,
            listener,
            state.clone(),
            errors.clone(),
            shutdown.clone(),
        ));
    }

    // The control queue. Senders wake this task through the channel, which
    // stands in for the classic self-pipe; each op is applied here, on the
    // cluster thread.
    while let Some(op) = ops.recv().await {
        match op {
            ControlOp::Shutdown => break,
            op => apply_op(&mut state.borrow_mut(), op),
        }
    }

    shutdown.cancel();
    // Returning drops the LocalSet and with it all connection tasks; any
    // queued responses are discarded and peers observe connection close.
}

async fn accept_loop(
    broker_id: i32,
    listener: tokio::net::TcpListener,
    state: Rc<RefCell<ClusterState>>,
    errors: Arc<ErrorStacks>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            accept = listener.accept() => {
                let Ok((socket, addr)) = accept else {
                    continue;
                };
                let session = Session::new(state.clone(), errors.clone(), broker_id);
                let stop = shutdown.clone();
                tokio::task::spawn_local(async move {
                    if let Err(err) = serve(session, socket, addr, stop).await {
                        tracing::debug!(%addr, broker_id, "connection closed: {err:#}");
                    }
                });
            }
            _ = shutdown.cancelled() => return,
        }
    }
}

/// Serve one client connection: read length-prefixed request frames, hand
/// them to the session's protocol handlers, and write back the framed
/// responses in completion order.
async fn serve(
    mut session: Session,
    socket: tokio::net::TcpStream,
    addr: SocketAddr,
    stop: CancellationToken,
) -> anyhow::Result<()> {
    socket.set_nodelay(true)?;
    tracing::debug!(%addr, broker_id = session.broker_id(), "accepted client connection");
    metrics::gauge!("kafka_mock_connections").increment(1);

    let (r, mut w) = tokio::io::split(socket);
    let mut r = tokio_util::codec::FramedRead::new(
        r,
        tokio_util::codec::LengthDelimitedCodec::builder()
            .big_endian()
            .length_field_length(4)
            .max_frame_length(1 << 27) // 128 MiB
            .new_codec(),
    );
    let mut out = BytesMut::new();

    let result = async {
        loop {
            tokio::select! {
                frame = r.try_next() => {
                    let Some(frame) = frame.context("failed to read next request frame")? else {
                        return Ok(());
                    };

                    crate::dispatch_request_frame(&mut session, frame, &mut out).await?;

                    if let Some(delay) = session.write_delay() {
                        tokio::time::sleep(delay).await;
                    }
                    w.write_all(&out).await?;
                    out.clear();
                }
                _ = stop.cancelled() => return Ok(()),
            }
        }
    }
    .await;

    metrics::gauge!("kafka_mock_connections").decrement(1);
    let _ = w.shutdown().await;
    result
}

fn apply_op(state: &mut ClusterState, op: ControlOp) {
    use ControlOp::*;

    fn partition_mut<'s>(
        state: &'s mut ClusterState,
        topic: &str,
        partition: i32,
    ) -> Result<&'s mut crate::topology::Partition, ControlError> {
        state
            .topic_find_mut(topic)
            .ok_or_else(|| ControlError::UnknownTopic(topic.to_string()))?
            .partition_mut(partition)
            .ok_or_else(|| ControlError::UnknownPartition {
                topic: topic.to_string(),
                partition,
            })
    }

    match op {
        CreateTopic {
            name,
            partition_cnt,
            replication_factor,
            done,
        } => {
            let _ = done.send(state.create_topic(name, partition_cnt, replication_factor));
        }
        SetPartitionLeader {
            topic,
            partition,
            broker_id,
            done,
        } => {
            let result = if state.broker(broker_id).is_none() {
                Err(ControlError::UnknownBroker(broker_id))
            } else {
                partition_mut(state, &topic, partition).map(|part| {
                    part.leader = broker_id;
                    if !part.replicas.contains(&broker_id) {
                        part.replicas.push(broker_id);
                    }
                })
            };
            let _ = done.send(result);
        }
        SetPartitionReplicas {
            topic,
            partition,
            replicas,
            done,
        } => {
            let unknown = replicas
                .iter()
                .copied()
                .find(|&id| state.broker(id).is_none());
            let result = match unknown {
                Some(id) => Err(ControlError::UnknownBroker(id)),
                None => partition_mut(state, &topic, partition).map(|part| {
                    // The leader must remain a member of the replica set.
                    if !replicas.contains(&part.leader) {
                        part.leader = replicas.first().copied().unwrap_or(-1);
                    }
                    part.replicas = replicas;
                }),
            };
            let _ = done.send(result);
        }
        SetPartitionFollower {
            topic,
            partition,
            broker_id,
            done,
        } => {
            let result = match broker_id {
                Some(id) if state.broker(id).is_none() => Err(ControlError::UnknownBroker(id)),
                _ => partition_mut(state, &topic, partition).map(|part| {
                    part.follower_id = broker_id.unwrap_or(-1);
                }),
            };
            let _ = done.send(result);
        }
        SetPartitionFollowerOffsets {
            topic,
            partition,
            start_offset,
            end_offset,
            done,
        } => {
            let result = partition_mut(state, &topic, partition).map(|part| {
                match start_offset {
                    Some(offset) => {
                        part.follower_start_offset = offset;
                        part.update_follower_start_offset = false;
                    }
                    None => {
                        part.follower_start_offset = part.start_offset;
                        part.update_follower_start_offset = true;
                    }
                }
                match end_offset {
                    Some(offset) => {
                        part.follower_end_offset = offset;
                        part.update_follower_end_offset = false;
                    }
                    None => {
                        part.follower_end_offset = part.end_offset;
                        part.update_follower_end_offset = true;
                    }
                }
            });
            let _ = done.send(result);
        }
        SetTopicError { topic, err, done } => {
            let result = state
                .topic_find_mut(&topic)
                .ok_or_else(|| ControlError::UnknownTopic(topic.clone()))
                .map(|t| t.err = err.map(|e| e.code()));
            let _ = done.send(result);
        }
        SetBrokerRack {
            broker_id,
            rack,
            done,
        } => {
            let result = state
                .broker_mut(broker_id)
                .ok_or(ControlError::UnknownBroker(broker_id))
                .map(|b| b.rack = rack);
            let _ = done.send(result);
        }
        SetBrokerWriteDelay {
            broker_id,
            delay,
            done,
        } => {
            let result = state
                .broker_mut(broker_id)
                .ok_or(ControlError::UnknownBroker(broker_id))
                .map(|b| b.write_delay = delay);
            let _ = done.send(result);
        }
        SetAutoCreateDefaults {
            partition_cnt,
            replication_factor,
            done,
        } => {
            state.defaults.partition_cnt = partition_cnt;
            state.defaults.replication_factor = replication_factor;
            let _ = done.send(Ok(()));
        }
        Shutdown => unreachable!("handled by cluster_main"),
    }
}
