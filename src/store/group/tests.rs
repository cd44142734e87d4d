//! Group store behavior on in-process clusters

use std::sync::Arc;
use tokio::sync::mpsc;

use super::*;
use crate::error::Error;
use crate::testing::TestCluster;

const DEVICE: &str = "of:1";

pub(super) fn bucket(port: u32) -> GroupBucket {
    GroupBucket::new(GroupType::Select, vec![format!("output:{}", port)])
}

pub(super) fn description(app_cookie: &str, buckets: Vec<GroupBucket>) -> GroupDescription {
    GroupDescription::new(DEVICE, GroupType::Select, buckets, app_cookie, "fwd")
}

/// The device's view of a group
pub(super) fn reported(mut group: Group) -> Group {
    group.state = GroupState::Added;
    group
}

fn device() -> DeviceId {
    DeviceId::from(DEVICE)
}

fn cookie(key: &str) -> GroupKey {
    GroupKey::from(key)
}

struct Replica {
    store: Arc<DistributedGroupStore>,
    events: mpsc::UnboundedReceiver<GroupEvent>,
}

impl Replica {
    fn events(&mut self) -> Vec<GroupEventType> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event.event_type);
        }
        events
    }
}

async fn replicas(size: usize, policy: GroupPolicy) -> (TestCluster, Vec<Replica>) {
    let cluster = TestCluster::new(size).await;
    cluster.set_master(DEVICE, 0);
    let maps = SharedGroupMaps::in_memory();

    let replicas = cluster
        .nodes
        .iter()
        .map(|node| {
            let store = DistributedGroupStore::new(node.router(), maps.clone(), policy);
            store.register(&node.dispatcher);
            let (tx, events) = mpsc::unbounded_channel();
            store.set_delegate(Arc::new(tx));
            Replica { store, events }
        })
        .collect();
    (cluster, replicas)
}

/// A single node mastering the test device
pub(super) struct GroupHarness {
    pub store: Arc<DistributedGroupStore>,
    events: mpsc::UnboundedReceiver<GroupEvent>,
    _cluster: TestCluster,
}

impl GroupHarness {
    /// The device has not been audited yet
    pub async fn new(policy: GroupPolicy) -> Self {
        let (cluster, mut replicas) = replicas(1, policy).await;
        let Replica { store, events } = replicas.remove(0);
        Self {
            store,
            events,
            _cluster: cluster,
        }
    }

    pub async fn audited(policy: GroupPolicy) -> Self {
        let harness = Self::new(policy).await;
        harness.store.device_initial_audit_completed(&device(), true);
        harness
    }

    pub fn events(&mut self) -> Vec<GroupEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    fn event_types(&mut self) -> Vec<GroupEventType> {
        self.events().into_iter().map(|event| event.event_type).collect()
    }
}

#[test]
fn test_bucket_identity_ignores_weight_and_stats() {
    let a = bucket(1);
    let mut b = bucket(1).with_weight(5);
    b.packets = 10;
    assert_eq!(a, b);
    assert!(!a.has_same_parameters(&b));
    assert_ne!(a, bucket(2));
    assert_ne!(a, bucket(1).with_watch(Some(3), None));

    assert!(same_buckets(&[a.clone()], &[a.clone()]));
    assert!(!same_buckets(&[a.clone()], &[b]));
    assert!(!same_buckets(&[a.clone()], &[a.clone(), a]));
}

#[test]
fn test_reference_count_drives_age() {
    let mut group = Group::new(GroupId(1), description("app-1", vec![bucket(1)]));
    group.set_reference_count(0);
    group.set_reference_count(0);
    assert_eq!(group.age, 2);
    group.set_reference_count(3);
    assert_eq!(group.age, 0);
}

#[test]
fn test_device_match_ignores_state_and_cookie() {
    let stored = Group::new(GroupId(7), description("app-1", vec![bucket(1)]));
    let mut on_device = reported(Group::new(GroupId(7), description("", vec![bucket(1)])));
    on_device.packets = 42;
    assert!(stored.matches(&on_device));

    on_device.id = GroupId(8);
    assert!(!stored.matches(&on_device));
}

#[tokio::test]
async fn test_create_allocates_ids_and_ignores_duplicates() {
    let mut harness = GroupHarness::audited(GroupPolicy::default()).await;

    harness
        .store
        .store_group_description(description("app-1", vec![bucket(1)]))
        .await
        .unwrap();
    harness
        .store
        .store_group_description(description("app-1", vec![bucket(2)]))
        .await
        .unwrap();
    harness
        .store
        .store_group_description(description("app-2", vec![bucket(2)]))
        .await
        .unwrap();

    let events = harness.events();
    assert_eq!(events.len(), 2);
    assert!(events
        .iter()
        .all(|event| event.event_type == GroupEventType::GroupAddRequested));
    assert_eq!(events[0].group.id, GroupId(1));
    assert_eq!(events[1].group.id, GroupId(2));

    let first = harness.store.group_by_key(&device(), &cookie("app-1")).unwrap();
    assert_eq!(first.state, GroupState::PendingAdd);
    assert_eq!(first.buckets(), &[bucket(1)]);
    assert_eq!(
        harness.store.group_by_id(&device(), GroupId(2)).unwrap().app_cookie(),
        &cookie("app-2")
    );
}

#[tokio::test]
async fn test_given_id_in_use_is_rejected() {
    let mut harness = GroupHarness::audited(GroupPolicy::default()).await;
    harness
        .store
        .store_group_description(description("app-1", vec![bucket(1)]).with_group_id(GroupId(10)))
        .await
        .unwrap();
    harness
        .store
        .store_group_description(description("app-2", vec![bucket(2)]).with_group_id(GroupId(10)))
        .await
        .unwrap();

    assert_eq!(harness.event_types(), vec![GroupEventType::GroupAddRequested]);
    assert_eq!(harness.store.group_count(&device()), 1);
    assert!(harness.store.group_by_key(&device(), &cookie("app-2")).is_none());
}

#[tokio::test]
async fn test_lifecycle_events() {
    let mut harness = GroupHarness::audited(GroupPolicy::default()).await;
    let store = Arc::clone(&harness.store);

    store
        .store_group_description(description("app-1", vec![bucket(1)]))
        .await
        .unwrap();
    let group = store.group_by_key(&device(), &cookie("app-1")).unwrap();
    store.add_or_update_group_entry(&reported(group.clone()));
    store.add_or_update_group_entry(&reported(group.clone()));
    assert_eq!(
        harness.event_types(),
        vec![GroupEventType::GroupAddRequested, GroupEventType::GroupAdded]
    );

    // No effective change
    store
        .update_group_description(&device(), &cookie("app-1"), UpdateType::Add, vec![bucket(1)], None)
        .await
        .unwrap();
    assert!(harness.event_types().is_empty());

    store
        .update_group_description(&device(), &cookie("app-1"), UpdateType::Add, vec![bucket(2)], None)
        .await
        .unwrap();
    let updated = store.group_by_key(&device(), &cookie("app-1")).unwrap();
    assert_eq!(updated.state, GroupState::PendingUpdate);
    assert_eq!(updated.id, group.id);
    assert_eq!(updated.buckets(), &[bucket(1), bucket(2)]);

    store.add_or_update_group_entry(&reported(updated));
    assert_eq!(
        harness.event_types(),
        vec![GroupEventType::GroupUpdateRequested, GroupEventType::GroupUpdated]
    );

    store
        .delete_group_description(&device(), &cookie("app-1"))
        .await
        .unwrap();
    // Statistics keep flowing until the device confirms the deletion
    store.add_or_update_group_entry(&reported(group.clone()));
    assert_eq!(
        store.group_by_key(&device(), &cookie("app-1")).unwrap().state,
        GroupState::PendingDelete
    );
    store.remove_group_entry(&group);
    assert_eq!(
        harness.event_types(),
        vec![GroupEventType::GroupRemoveRequested, GroupEventType::GroupRemoved]
    );
    assert!(store.group_by_id(&device(), group.id).is_none());
}

#[tokio::test]
async fn test_update_moves_group_to_new_cookie() {
    let mut harness = GroupHarness::audited(GroupPolicy::default()).await;
    let store = Arc::clone(&harness.store);

    store
        .store_group_description(description("app-1", vec![bucket(1)]))
        .await
        .unwrap();
    let group = store.group_by_key(&device(), &cookie("app-1")).unwrap();
    harness.events();

    store
        .update_group_description(
            &device(),
            &cookie("app-1"),
            UpdateType::Set,
            vec![bucket(3)],
            Some(cookie("app-1b")),
        )
        .await
        .unwrap();

    assert_eq!(harness.event_types(), vec![GroupEventType::GroupUpdateRequested]);
    assert!(store.group_by_key(&device(), &cookie("app-1")).is_none());
    let moved = store.group_by_id(&device(), group.id).unwrap();
    assert_eq!(moved.app_cookie(), &cookie("app-1b"));
    assert_eq!(moved.buckets(), &[bucket(3)]);
}

#[tokio::test]
async fn test_operation_failures() {
    let mut harness = GroupHarness::audited(GroupPolicy::default()).await;
    let store = Arc::clone(&harness.store);

    for key in ["app-1", "app-2", "app-3"] {
        store
            .store_group_description(description(key, vec![bucket(1)]))
            .await
            .unwrap();
    }
    harness.events();
    let operation = |op_type, id, failure_code| GroupOperation {
        op_type,
        group_id: id,
        group_type: GroupType::Select,
        buckets: vec![bucket(1)],
        failure_code,
    };

    // The device already has the group as requested
    store.group_operation_failed(
        &device(),
        &operation(
            GroupOperationType::Add,
            GroupId(1),
            Some(GroupMsgErrorCode::GroupExists),
        ),
    );
    assert_eq!(harness.event_types(), vec![GroupEventType::GroupAdded]);

    store.group_operation_failed(
        &device(),
        &operation(
            GroupOperationType::Add,
            GroupId(2),
            Some(GroupMsgErrorCode::OutOfGroups),
        ),
    );
    assert_eq!(
        harness.event_types(),
        vec![GroupEventType::GroupAddFailed, GroupEventType::GroupRemoved]
    );
    assert!(store.group_by_id(&device(), GroupId(2)).is_none());

    store.group_operation_failed(
        &device(),
        &operation(GroupOperationType::Modify, GroupId(3), None),
    );
    store.group_operation_failed(
        &device(),
        &operation(GroupOperationType::Delete, GroupId(3), None),
    );
    store.group_operation_failed(
        &device(),
        &operation(GroupOperationType::Delete, GroupId(99), None),
    );
    assert_eq!(
        harness.event_types(),
        vec![GroupEventType::GroupUpdateFailed, GroupEventType::GroupRemoveFailed]
    );
}

#[tokio::test]
async fn test_create_adopts_extraneous_groups() {
    let mut harness = GroupHarness::audited(GroupPolicy::default()).await;
    let store = Arc::clone(&harness.store);
    for (id, port) in [(5, 1), (6, 2), (7, 3)] {
        store.add_or_update_extraneous_group_entry(reported(Group::new(
            GroupId(id),
            description("", vec![bucket(port)]),
        )));
    }

    // Same id, same buckets: the device already has it
    store
        .store_group_description(description("app-1", vec![bucket(1)]).with_group_id(GroupId(5)))
        .await
        .unwrap();
    assert_eq!(harness.event_types(), vec![GroupEventType::GroupAdded]);
    assert_eq!(
        store.group_by_key(&device(), &cookie("app-1")).unwrap().state,
        GroupState::Added
    );

    // Same id, other buckets: the device needs an update
    store
        .store_group_description(description("app-2", vec![bucket(9)]).with_group_id(GroupId(6)))
        .await
        .unwrap();
    assert_eq!(harness.event_types(), vec![GroupEventType::GroupUpdateRequested]);
    let second = store.group_by_key(&device(), &cookie("app-2")).unwrap();
    assert_eq!((second.id, second.state), (GroupId(6), GroupState::PendingUpdate));

    // No id given: matched by buckets
    store
        .store_group_description(description("app-3", vec![bucket(3)]))
        .await
        .unwrap();
    assert_eq!(harness.event_types(), vec![GroupEventType::GroupAdded]);
    assert_eq!(store.group_by_key(&device(), &cookie("app-3")).unwrap().id, GroupId(7));
    assert!(store.extraneous_groups(&device()).is_empty());
}

#[tokio::test]
async fn test_audit_status_reset() {
    let harness = GroupHarness::audited(GroupPolicy::default()).await;
    assert!(harness.store.device_initial_audit_status(&device()));
    harness.store.device_initial_audit_completed(&device(), false);
    assert!(!harness.store.device_initial_audit_status(&device()));

    harness
        .store
        .store_group_description(description("app-1", vec![bucket(1)]))
        .await
        .unwrap();
    assert_eq!(harness.store.pending_groups(&device()).len(), 1);
}

#[tokio::test]
async fn test_non_master_forwards_and_all_nodes_see_lifecycle() {
    let (cluster, mut replicas) = replicas(2, GroupPolicy::default()).await;
    replicas[0].store.device_initial_audit_completed(&device(), true);

    replicas[1]
        .store
        .store_group_description(description("app-1", vec![bucket(1)]))
        .await
        .unwrap();
    assert_eq!(replicas[1].store.group_count(&device()), 0);
    assert_eq!(cluster.deliver().await, 1);

    assert_eq!(replicas[0].events(), vec![GroupEventType::GroupAddRequested]);
    assert!(replicas[1].events().is_empty());

    let group = replicas[1].store.group_by_key(&device(), &cookie("app-1")).unwrap();
    replicas[0].store.add_or_update_group_entry(&reported(group));
    assert_eq!(replicas[0].events(), vec![GroupEventType::GroupAdded]);
    assert_eq!(replicas[1].events(), vec![GroupEventType::GroupAdded]);

    replicas[1]
        .store
        .delete_group_description(&device(), &cookie("app-1"))
        .await
        .unwrap();
    cluster.deliver().await;
    assert_eq!(replicas[0].events(), vec![GroupEventType::GroupRemoveRequested]);
    assert_eq!(
        replicas[1].store.group_by_key(&device(), &cookie("app-1")).unwrap().state,
        GroupState::PendingDelete
    );
}

#[tokio::test]
async fn test_forwarded_request_dropped_after_mastership_change() {
    let (cluster, mut replicas) = replicas(2, GroupPolicy::default()).await;
    replicas[0].store.device_initial_audit_completed(&device(), true);

    replicas[1]
        .store
        .store_group_description(description("app-1", vec![bucket(1)]))
        .await
        .unwrap();
    cluster.set_master(DEVICE, 1);
    cluster.deliver().await;

    assert!(replicas[0].events().is_empty());
    assert_eq!(replicas[0].store.group_count(&device()), 0);
}

#[tokio::test]
async fn test_no_master() {
    let (cluster, replicas) = replicas(2, GroupPolicy::default()).await;
    cluster.clear_master(DEVICE);

    let result = replicas[1]
        .store
        .store_group_description(description("app-1", vec![bucket(1)]))
        .await;
    assert!(matches!(result, Err(Error::NoMaster(_))));
    assert!(replicas[1].store.groups(&device()).is_empty());
    assert_eq!(cluster.hub.pending(), 0);
}

#[tokio::test]
async fn test_failover_reaches_every_node() {
    let (cluster, mut replicas) = replicas(2, GroupPolicy::default()).await;
    replicas[0].store.device_initial_audit_completed(&device(), true);

    let failover = GroupDescription::new(
        DEVICE,
        GroupType::Failover,
        vec![GroupBucket::new(GroupType::Failover, vec!["output:1".into()]).with_watch(Some(1), None)],
        "protected",
        "fwd",
    );
    replicas[0].store.store_group_description(failover).await.unwrap();
    replicas[0]
        .store
        .store_group_description(description("plain", vec![bucket(1)]))
        .await
        .unwrap();
    replicas[0].events();

    let groups = replicas[0].store.groups(&device());
    assert_eq!(groups.len(), 2);
    replicas[0].store.notify_of_failovers(groups).await;
    assert_eq!(cluster.deliver().await, 1);

    assert_eq!(replicas[0].events(), vec![GroupEventType::GroupBucketFailover]);
    assert_eq!(replicas[1].events(), vec![GroupEventType::GroupBucketFailover]);
}

#[tokio::test]
async fn test_purge() {
    let mut harness = GroupHarness::audited(GroupPolicy::default()).await;
    for key in ["app-1", "app-2"] {
        harness
            .store
            .store_group_description(description(key, vec![bucket(1)]))
            .await
            .unwrap();
    }
    harness.events();

    harness.store.purge_group_entry(&device());
    assert_eq!(harness.store.group_count(&device()), 0);
    assert_eq!(
        harness.event_types(),
        vec![GroupEventType::GroupRemoved, GroupEventType::GroupRemoved]
    );

    harness
        .store
        .store_group_description(description("app-3", vec![bucket(1)]))
        .await
        .unwrap();
    harness.store.unset_delegate();
    harness.store.purge_group_entries();
    assert_eq!(harness.store.group_count(&device()), 0);
    assert!(harness.events().iter().all(|e| e.event_type != GroupEventType::GroupRemoved));
}
