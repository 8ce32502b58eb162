use crate::{cluster::ClusterState, error_stack::ErrorStacks};
use bytes::BytesMut;
use kafka_protocol::{
    error::ResponseError,
    messages::{self, BrokerId, TopicName},
    protocol::StrBytes,
};
use std::{cell::RefCell, rc::Rc, sync::Arc, time::Duration};
use tracing::instrument;

/// Per-connection protocol state.
///
/// A session belongs to the broker that accepted the connection and runs on
/// the cluster thread, so handlers may freely borrow and mutate the shared
/// cluster state. Each handler receives the decoded request plus an optional
/// `fault` code computed by the dispatcher (an injected error, or
/// `unsupported_version`); a fault marks every logical unit of the response
/// and suppresses the real outcome.
pub struct Session {
    cluster: Rc<RefCell<ClusterState>>,
    errors: Arc<ErrorStacks>,
    broker_id: i32,
}

impl Session {
    pub(crate) fn new(
        cluster: Rc<RefCell<ClusterState>>,
        errors: Arc<ErrorStacks>,
        broker_id: i32,
    ) -> Self {
        Self {
            cluster,
            errors,
            broker_id,
        }
    }

    /// Id of the broker this connection was accepted by.
    pub fn broker_id(&self) -> i32 {
        self.broker_id
    }

    /// Pop the next injected error for `api_key`, if any.
    pub(crate) fn next_request_error(&self, api_key: i16) -> Option<i16> {
        self.errors.next(api_key)
    }

    /// Response write delay configured for this connection's broker.
    pub(crate) fn write_delay(&self) -> Option<Duration> {
        self.cluster
            .borrow()
            .broker(self.broker_id)
            .and_then(|b| b.write_delay)
    }

    /// Advertise the dispatch table's supported version ranges.
    pub async fn api_versions(
        &mut self,
        _request: messages::ApiVersionsRequest,
        fault: Option<i16>,
    ) -> anyhow::Result<messages::ApiVersionsResponse> {
        use messages::api_versions_response::ApiVersion;

        if let Some(code) = fault {
            return Ok(messages::ApiVersionsResponse::default().with_error_code(code));
        }

        Ok(messages::ApiVersionsResponse::default().with_api_keys(
            crate::SUPPORTED_APIS
                .iter()
                .map(|&(api_key, min_version, max_version)| {
                    ApiVersion::default()
                        .with_api_key(api_key as i16)
                        .with_min_version(min_version)
                        .with_max_version(max_version)
                })
                .collect(),
        ))
    }

    /// Serve cluster metadata: all brokers, plus the requested topics (or
    /// every topic when the request names none). Unknown topics are
    /// materialized via auto-create when the request allows it.
    #[instrument(skip_all, fields(broker_id = self.broker_id))]
    pub async fn metadata(
        &mut self,
        mut request: messages::MetadataRequest,
        fault: Option<i16>,
    ) -> anyhow::Result<messages::MetadataResponse> {
        use messages::metadata_response::{MetadataResponseBroker, MetadataResponseTopic};

        let mut cluster = self.cluster.borrow_mut();

        let brokers = cluster
            .brokers
            .iter()
            .map(|b| {
                MetadataResponseBroker::default()
                    .with_node_id(BrokerId(b.id))
                    .with_host(StrBytes::from_string(b.host.clone()))
                    .with_port(b.port as i32)
                    .with_rack(b.rack.as_ref().map(|r| StrBytes::from_string(r.clone())))
            })
            .collect();

        let topics = match request.topics.take() {
            Some(requested) if !requested.is_empty() => {
                let mut topics = Vec::with_capacity(requested.len());
                for topic_request in requested {
                    let name = topic_request.name.unwrap_or_default();

                    if cluster.topic_find(name.as_str()).is_none()
                        && request.allow_auto_topic_creation
                        && fault.is_none()
                    {
                        match cluster.topic_auto_create(name.clone()) {
                            Ok(_) => {
                                tracing::debug!(topic = name.as_str(), "auto-created topic")
                            }
                            Err(err) => {
                                topics.push(
                                    MetadataResponseTopic::default()
                                        .with_name(Some(name))
                                        .with_error_code(err.code()),
                                );
                                continue;
                            }
                        }
                    }

                    topics.push(match cluster.topic_find(name.as_str()) {
                        Some(topic) => build_topic_metadata(topic, fault),
                        None => MetadataResponseTopic::default()
                            .with_name(Some(name))
                            .with_error_code(
                                fault.unwrap_or(ResponseError::UnknownTopicOrPartition.code()),
                            ),
                    });
                }
                topics
            }
            _ => cluster
                .topics
                .iter()
                .map(|topic| build_topic_metadata(topic, fault))
                .collect(),
        };

        Ok(messages::MetadataResponse::default()
            .with_brokers(brokers)
            .with_cluster_id(Some(StrBytes::from_string(cluster.id.clone())))
            .with_controller_id(BrokerId(cluster.controller_id))
            .with_topics(topics))
    }

    /// Append produced batches to their partition logs and report the
    /// assigned base offsets.
    #[instrument(skip_all, fields(broker_id = self.broker_id))]
    pub async fn produce(
        &mut self,
        request: messages::ProduceRequest,
        fault: Option<i16>,
    ) -> anyhow::Result<messages::ProduceResponse> {
        use messages::produce_response::{PartitionProduceResponse, TopicProduceResponse};

        let mut cluster = self.cluster.borrow_mut();
        let broker_id = self.broker_id;

        let mut responses = Vec::with_capacity(request.topic_data.len());
        for topic_data in request.topic_data {
            let name = topic_data.name;
            let sticky = cluster.topic_find(name.as_str()).and_then(|t| t.err);

            let mut partition_responses = Vec::with_capacity(topic_data.partition_data.len());
            for partition_data in topic_data.partition_data {
                let index = partition_data.index;

                let outcome = if let Some(code) = fault.or(sticky) {
                    Err(code)
                } else {
                    match cluster
                        .topic_find_mut(name.as_str())
                        .and_then(|t| t.partition_mut(index))
                    {
                        None => Err(ResponseError::UnknownTopicOrPartition.code()),
                        Some(part) if part.leader != broker_id => {
                            Err(ResponseError::NotLeaderOrFollower.code())
                        }
                        Some(part) => match partition_data.records {
                            Some(records) => part
                                .log_append(records)
                                .map(|base_offset| (base_offset, part.start_offset))
                                .map_err(|err| err.code()),
                            None => Err(ResponseError::InvalidRecord.code()),
                        },
                    }
                };

                partition_responses.push(match outcome {
                    Ok((base_offset, log_start_offset)) => PartitionProduceResponse::default()
                        .with_index(index)
                        .with_base_offset(base_offset)
                        .with_log_append_time_ms(-1)
                        .with_log_start_offset(log_start_offset),
                    Err(code) => PartitionProduceResponse::default()
                        .with_index(index)
                        .with_error_code(code)
                        .with_base_offset(-1)
                        .with_log_append_time_ms(-1)
                        .with_log_start_offset(-1),
                });
            }

            responses.push(
                TopicProduceResponse::default()
                    .with_name(name)
                    .with_partition_responses(partition_responses),
            );
        }

        Ok(messages::ProduceResponse::default().with_responses(responses))
    }

    /// Serve stored msgsets at or beyond the requested offsets, resolving
    /// whether this broker acts as leader or preferred follower for each
    /// partition.
    #[instrument(skip_all, fields(broker_id = self.broker_id))]
    pub async fn fetch(
        &mut self,
        request: messages::FetchRequest,
        version: i16,
        fault: Option<i16>,
    ) -> anyhow::Result<messages::FetchResponse> {
        use messages::fetch_response::FetchableTopicResponse;

        let cluster = self.cluster.borrow();
        // Remaining byte budget across the whole response.
        let mut budget = if request.max_bytes > 0 {
            request.max_bytes as usize
        } else {
            usize::MAX
        };

        let mut responses = Vec::with_capacity(request.topics.len());
        for topic_request in &request.topics {
            let sticky = cluster
                .topic_find(topic_request.topic.as_str())
                .and_then(|t| t.err);

            let partitions = topic_request
                .partitions
                .iter()
                .map(|partition_request| {
                    fetch_partition(
                        &cluster,
                        self.broker_id,
                        version,
                        &topic_request.topic,
                        partition_request,
                        fault.or(sticky),
                        &mut budget,
                    )
                })
                .collect();

            responses.push(
                FetchableTopicResponse::default()
                    .with_topic(topic_request.topic.clone())
                    .with_partitions(partitions),
            );
        }

        Ok(messages::FetchResponse::default()
            .with_session_id(request.session_id)
            .with_responses(responses))
    }

    /// Translate earliest/latest/timestamp probes into log offsets.
    #[instrument(skip_all, fields(broker_id = self.broker_id))]
    pub async fn list_offsets(
        &mut self,
        request: messages::ListOffsetsRequest,
        fault: Option<i16>,
    ) -> anyhow::Result<messages::ListOffsetsResponse> {
        use messages::list_offsets_response::{
            ListOffsetsPartitionResponse, ListOffsetsTopicResponse,
        };

        let cluster = self.cluster.borrow();

        let topics = request
            .topics
            .iter()
            .map(|topic_request| {
                let sticky = cluster
                    .topic_find(topic_request.name.as_str())
                    .and_then(|t| t.err);

                let partitions = topic_request
                    .partitions
                    .iter()
                    .map(|partition_request| {
                        let response = ListOffsetsPartitionResponse::default()
                            .with_partition_index(partition_request.partition_index);

                        if let Some(code) = fault.or(sticky) {
                            return response.with_error_code(code);
                        }
                        let Some(part) = cluster
                            .topic_find(topic_request.name.as_str())
                            .and_then(|t| t.partition(partition_request.partition_index))
                        else {
                            return response
                                .with_error_code(ResponseError::UnknownTopicOrPartition.code());
                        };
                        if part.leader != self.broker_id {
                            return response
                                .with_error_code(ResponseError::NotLeaderOrFollower.code());
                        }

                        // Message timestamps are not indexed: a real
                        // timestamp probe resolves to the log end, like
                        // "latest".
                        let offset = match partition_request.timestamp {
                            -2 => part.start_offset,
                            _ => part.end_offset,
                        };
                        response.with_offset(offset).with_timestamp(-1)
                    })
                    .collect();

                ListOffsetsTopicResponse::default()
                    .with_name(topic_request.name.clone())
                    .with_partitions(partitions)
            })
            .collect();

        Ok(messages::ListOffsetsResponse::default().with_topics(topics))
    }

    /// Record committed offsets for the request's group, provided this
    /// broker is the group's coordinator.
    #[instrument(skip_all, fields(broker_id = self.broker_id, group = request.group_id.as_str()))]
    pub async fn offset_commit(
        &mut self,
        request: messages::OffsetCommitRequest,
        fault: Option<i16>,
    ) -> anyhow::Result<messages::OffsetCommitResponse> {
        use messages::offset_commit_response::{
            OffsetCommitResponsePartition, OffsetCommitResponseTopic,
        };

        let mut cluster = self.cluster.borrow_mut();
        let group = request.group_id.as_str().to_string();
        let is_coordinator = cluster.get_coord(group.as_bytes()).id == self.broker_id;

        let mut topics = Vec::with_capacity(request.topics.len());
        for topic_request in request.topics {
            let sticky = cluster
                .topic_find(topic_request.name.as_str())
                .and_then(|t| t.err);

            let mut partitions = Vec::with_capacity(topic_request.partitions.len());
            for partition_request in topic_request.partitions {
                let code = if let Some(code) = fault.or(sticky) {
                    code
                } else if !is_coordinator {
                    ResponseError::NotCoordinator.code()
                } else {
                    match cluster
                        .topic_find_mut(topic_request.name.as_str())
                        .and_then(|t| t.partition_mut(partition_request.partition_index))
                    {
                        None => ResponseError::UnknownTopicOrPartition.code(),
                        Some(part) => {
                            part.commit_offset(
                                &group,
                                partition_request.committed_offset,
                                partition_request.committed_metadata.clone(),
                            );
                            0
                        }
                    }
                };

                partitions.push(
                    OffsetCommitResponsePartition::default()
                        .with_partition_index(partition_request.partition_index)
                        .with_error_code(code),
                );
            }

            topics.push(
                OffsetCommitResponseTopic::default()
                    .with_name(topic_request.name)
                    .with_partitions(partitions),
            );
        }

        Ok(messages::OffsetCommitResponse::default().with_topics(topics))
    }

    /// Read back committed offsets for a group; `-1` when the group has
    /// no commit for a partition.
    #[instrument(skip_all, fields(broker_id = self.broker_id, group = request.group_id.as_str()))]
    pub async fn offset_fetch(
        &mut self,
        request: messages::OffsetFetchRequest,
        fault: Option<i16>,
    ) -> anyhow::Result<messages::OffsetFetchResponse> {
        use messages::offset_fetch_response::{
            OffsetFetchResponsePartition, OffsetFetchResponseTopic,
        };

        let cluster = self.cluster.borrow();
        let group = request.group_id.as_str().to_string();
        let is_coordinator = cluster.get_coord(group.as_bytes()).id == self.broker_id;

        let error_for = |sticky: Option<i16>| -> Option<i16> {
            fault.or(sticky).or_else(|| {
                (!is_coordinator).then(|| ResponseError::NotCoordinator.code())
            })
        };

        let topics: Vec<OffsetFetchResponseTopic> = match request.topics {
            Some(requested) => requested
                .into_iter()
                .map(|topic_request| {
                    let sticky = cluster
                        .topic_find(topic_request.name.as_str())
                        .and_then(|t| t.err);

                    let partitions = topic_request
                        .partition_indexes
                        .iter()
                        .map(|&partition_index| {
                            let response = OffsetFetchResponsePartition::default()
                                .with_partition_index(partition_index)
                                .with_committed_offset(-1);

                            if let Some(code) = error_for(sticky) {
                                return response.with_error_code(code);
                            }
                            match cluster
                                .topic_find(topic_request.name.as_str())
                                .and_then(|t| t.partition(partition_index))
                            {
                                None => response.with_error_code(
                                    ResponseError::UnknownTopicOrPartition.code(),
                                ),
                                Some(part) => match part.committed_offset_find(&group) {
                                    Some(committed) => response
                                        .with_committed_offset(committed.offset)
                                        .with_metadata(committed.metadata.clone()),
                                    None => response,
                                },
                            }
                        })
                        .collect();

                    OffsetFetchResponseTopic::default()
                        .with_name(topic_request.name)
                        .with_partitions(partitions)
                })
                .collect(),
            // A null topic array asks for every partition this group has
            // committed offsets for. Errors still surface per partition, the
            // same as for an explicit topic list.
            None => cluster
                .topics
                .iter()
                .filter_map(|topic| {
                    let err = error_for(topic.err);
                    let partitions: Vec<_> = topic
                        .partitions
                        .iter()
                        .filter_map(|part| {
                            let response = OffsetFetchResponsePartition::default()
                                .with_partition_index(part.id)
                                .with_committed_offset(-1);

                            if let Some(code) = err {
                                return Some(response.with_error_code(code));
                            }
                            part.committed_offset_find(&group).map(|committed| {
                                response
                                    .with_committed_offset(committed.offset)
                                    .with_metadata(committed.metadata.clone())
                            })
                        })
                        .collect();

                    (!partitions.is_empty()).then(|| {
                        OffsetFetchResponseTopic::default()
                            .with_name(topic.name.clone())
                            .with_partitions(partitions)
                    })
                })
                .collect(),
        };

        let mut response = messages::OffsetFetchResponse::default().with_topics(topics);
        if let Some(code) = error_for(None) {
            response.error_code = code;
        }
        Ok(response)
    }

    /// Resolve the coordinator broker for group or transaction keys.
    #[instrument(skip_all, fields(broker_id = self.broker_id))]
    pub async fn find_coordinator(
        &mut self,
        request: messages::FindCoordinatorRequest,
        version: i16,
        fault: Option<i16>,
    ) -> anyhow::Result<messages::FindCoordinatorResponse> {
        use messages::find_coordinator_response::Coordinator;

        let cluster = self.cluster.borrow();

        if version >= 4 {
            let coordinators = request
                .coordinator_keys
                .iter()
                .map(|key| {
                    let coordinator = Coordinator::default().with_key(key.clone());
                    match fault {
                        Some(code) => coordinator
                            .with_node_id(BrokerId(-1))
                            .with_error_code(code),
                        None => {
                            let broker = cluster.get_coord(key.as_str().as_bytes());
                            coordinator
                                .with_node_id(BrokerId(broker.id))
                                .with_host(StrBytes::from_string(broker.host.clone()))
                                .with_port(broker.port as i32)
                        }
                    }
                })
                .collect();
            return Ok(messages::FindCoordinatorResponse::default().with_coordinators(coordinators));
        }

        Ok(match fault {
            Some(code) => messages::FindCoordinatorResponse::default()
                .with_node_id(BrokerId(-1))
                .with_error_code(code),
            None => {
                let broker = cluster.get_coord(request.key.as_str().as_bytes());
                messages::FindCoordinatorResponse::default()
                    .with_node_id(BrokerId(broker.id))
                    .with_host(StrBytes::from_string(broker.host.clone()))
                    .with_port(broker.port as i32)
            }
        })
    }
}

fn build_topic_metadata(
    topic: &crate::topology::Topic,
    fault: Option<i16>,
) -> messages::metadata_response::MetadataResponseTopic {
    use messages::metadata_response::{MetadataResponsePartition, MetadataResponseTopic};

    let err = fault.or(topic.err);
    let partitions = topic
        .partitions
        .iter()
        .map(|part| match err {
            Some(code) => MetadataResponsePartition::default()
                .with_partition_index(part.id)
                .with_error_code(code),
            None => MetadataResponsePartition::default()
                .with_partition_index(part.id)
                .with_leader_id(BrokerId(part.leader))
                .with_replica_nodes(part.replicas.iter().map(|&id| BrokerId(id)).collect())
                .with_isr_nodes(part.replicas.iter().map(|&id| BrokerId(id)).collect()),
        })
        .collect();

    MetadataResponseTopic::default()
        .with_name(Some(topic.name.clone()))
        .with_error_code(err.unwrap_or(0))
        .with_is_internal(false)
        .with_partitions(partitions)
}

/// Serve one partition of a Fetch request, concatenating stored msgsets
/// from the requested offset while the byte budgets allow.
fn fetch_partition(
    cluster: &ClusterState,
    broker_id: i32,
    version: i16,
    topic: &TopicName,
    request: &messages::fetch_request::FetchPartition,
    fault: Option<i16>,
    budget: &mut usize,
) -> messages::fetch_response::PartitionData {
    use messages::fetch_response::PartitionData;

    let response = PartitionData::default().with_partition_index(request.partition);

    if let Some(code) = fault {
        return response.with_error_code(code);
    }
    let Some(part) = cluster
        .topic_find(topic.as_str())
        .and_then(|t| t.partition(request.partition))
    else {
        return response.with_error_code(ResponseError::UnknownTopicOrPartition.code());
    };

    let on_follower = broker_id == part.follower_id && broker_id != part.leader;
    if broker_id != part.leader && !on_follower {
        return response.with_error_code(ResponseError::NotLeaderOrFollower.code());
    }

    // A leader with a preferred follower configured elsewhere steers the
    // client at it instead of serving data (the field exists from v11 on).
    if !on_follower && part.follower_id >= 0 && part.follower_id != part.leader && version >= 11 {
        let (start, end) = part.visible_offsets(false);
        return response
            .with_high_watermark(end)
            .with_last_stable_offset(end)
            .with_log_start_offset(start)
            .with_preferred_read_replica(BrokerId(part.follower_id));
    }

    let (start, end) = part.visible_offsets(on_follower);
    let response = response
        .with_high_watermark(end)
        .with_last_stable_offset(end)
        .with_log_start_offset(start);

    if request.fetch_offset == end {
        // Caught up; an empty response, not an error.
        return response;
    }
    if part.msgset_find(request.fetch_offset, on_follower).is_none() {
        return response.with_error_code(ResponseError::OffsetOutOfRange.code());
    }

    let partition_budget = request.partition_max_bytes.max(0) as usize;
    let mut records = BytesMut::new();
    for msgset in part.msgsets_from(request.fetch_offset, on_follower) {
        // Always serve at least one msgset so a client with a small budget
        // still makes progress.
        if !records.is_empty()
            && (records.len() + msgset.bytes.len() > partition_budget
                || msgset.bytes.len() > *budget)
        {
            break;
        }
        records.extend_from_slice(&msgset.bytes);
    }
    *budget = budget.saturating_sub(records.len());

    response.with_records(Some(records.freeze()))
}
