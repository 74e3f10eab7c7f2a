//! Multi-node cluster behavior over the in-memory fabrics.
//!
//! Time is paused in every test; tokio auto-advances the clock through
//! refresh intervals, watch ticks and TTL expiries, so the long scenarios
//! (leader crash, store outage) run instantly and deterministically.

use std::{sync::Arc, time::Duration};

use futures::StreamExt;
use soloist_core::{store::LeaseStore, Channel, Config, ConfigBuilder, NodeId};
use soloist_mem::{FaultInjector, FaultyStore, MemBus, MemEventSource, MemLeaseStore, MemSurveyFabric};
use soloist_runtime::{
    CloseReason, Node, StreamPhase, SubscribeError, Subscription, SubscriptionEvent,
};

struct Cluster {
    config: Config,
    store: Arc<MemLeaseStore>,
    survey: Arc<MemSurveyFabric>,
    bus: Arc<MemBus>,
    source: Arc<MemEventSource>,
}

impl Cluster {
    fn new() -> Self {
        Self {
            config: ConfigBuilder::default().finish().unwrap(),
            store: Arc::new(MemLeaseStore::new()),
            survey: Arc::new(MemSurveyFabric::new()),
            bus: Arc::new(MemBus::new()),
            source: Arc::new(MemEventSource::new()),
        }
    }

    fn node(&self, name: &str) -> Node {
        Node::spawn(
            NodeId::new(name),
            self.config.clone(),
            self.store.clone(),
            self.survey.clone(),
            self.bus.clone(),
            self.source.clone(),
        )
    }

    /// A node whose private path to the shared store can be cut.
    fn flaky_node(&self, name: &str) -> (Node, FaultInjector) {
        let (store, faults) = FaultyStore::wrap(self.store.clone());
        let node = Node::spawn(
            NodeId::new(name),
            self.config.clone(),
            store,
            self.survey.clone(),
            self.bus.clone(),
            self.source.clone(),
        );
        (node, faults)
    }
}

fn channel(name: &str) -> Channel {
    Channel::new(name).unwrap()
}

fn setup_tracing() -> tracing::dispatcher::DefaultGuard {
    use tracing_subscriber::util::SubscriberInitExt;
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .finish()
        .set_default()
}

async fn next_event(sub: &mut Subscription) -> SubscriptionEvent {
    sub.next()
        .await
        .expect("subscription stream ended without a terminal event")
}

/// Clients retry `LeadershipChanged`; so do the tests.
async fn subscribe_with_retry(node: &Node, channel: &Channel) -> Subscription {
    for _ in 0..20 {
        match node.subscribe(channel).await {
            Ok(sub) => return sub,
            Err(SubscribeError::LeadershipChanged) => {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Err(err) => panic!("subscribe failed: {err}"),
        }
    }
    panic!("leadership never settled");
}

async fn assert_lease_gone(store: &MemLeaseStore, channel: &Channel) {
    for _ in 0..200 {
        if store.get(channel).await.unwrap().is_none() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("lease for {channel} was never released");
}

#[tokio::test(start_paused = true)]
async fn scenario_a_first_subscriber_elects_and_reuses_leadership() {
    let cluster = Cluster::new();
    let n1 = cluster.node("n1");
    let channel = channel("ch");

    let mut first = n1.subscribe(&channel).await.unwrap();
    assert!(n1.is_leader(&channel));

    cluster.source.push(&channel, "hello");
    assert_eq!(
        next_event(&mut first).await,
        SubscriptionEvent::Message("hello".into())
    );

    let second = n1.subscribe(&channel).await.unwrap();
    assert_eq!(second.leadership(), first.leadership());
    assert_eq!(n1.subscriber_count(&channel), 2);
    assert_eq!(cluster.source.open_count(&channel), 1);
    assert_eq!(n1.stream_phase(&channel), Some(StreamPhase::Running));
}

#[tokio::test(start_paused = true)]
async fn scenario_b_second_node_follows_via_survey() {
    let cluster = Cluster::new();
    let n1 = cluster.node("n1");
    let n2 = cluster.node("n2");
    let channel = channel("ch");

    let mut a = n1.subscribe(&channel).await.unwrap();
    let mut b = n2.subscribe(&channel).await.unwrap();

    assert_eq!(b.leadership(), a.leadership());
    assert!(n1.is_leader(&channel));
    assert!(!n2.is_leader(&channel));
    assert_eq!(cluster.source.open_count(&channel), 1);

    cluster.source.push(&channel, "fanout");
    assert_eq!(
        next_event(&mut a).await,
        SubscriptionEvent::Message("fanout".into())
    );
    assert_eq!(
        next_event(&mut b).await,
        SubscriptionEvent::Message("fanout".into())
    );
}

#[tokio::test(start_paused = true)]
async fn scenario_c_leader_crash_disconnects_followers_within_ttl() {
    let _tracing = setup_tracing();
    let cluster = Cluster::new();
    let n1 = cluster.node("n1");
    let n2 = cluster.node("n2");
    let channel = channel("ch");

    let a = n1.subscribe(&channel).await.unwrap();
    let old = a.leadership().clone();
    let mut b = n2.subscribe(&channel).await.unwrap();

    n1.halt();
    assert_eq!(
        next_event(&mut b).await,
        SubscriptionEvent::Closed(CloseReason::LeadershipLost)
    );
    drop(b);

    let b2 = subscribe_with_retry(&n2, &channel).await;
    assert!(n2.is_leader(&channel));
    assert_ne!(b2.leadership(), &old);
    assert_eq!(cluster.source.open_count(&channel), 2);
}

#[tokio::test(start_paused = true)]
async fn scenario_d_stale_tagged_publications_are_dropped() {
    use soloist_core::{LeadershipId, TaggedPublication};
    use soloist_core::bus::PublicationBus;

    let cluster = Cluster::new();
    let n1 = cluster.node("n1");
    let channel = channel("ch");

    let mut sub = n1.subscribe(&channel).await.unwrap();

    // A stale in-flight message from a previous leadership term.
    cluster
        .bus
        .publish(TaggedPublication::event(
            channel.clone(),
            LeadershipId::new("previous-term"),
            "stale",
        ))
        .await
        .unwrap();
    cluster.source.push(&channel, "fresh");

    // The stale message is silently dropped; the client sees no disruption.
    assert_eq!(
        next_event(&mut sub).await,
        SubscriptionEvent::Message("fresh".into())
    );
}

#[tokio::test(start_paused = true)]
async fn scenario_e_store_outage_on_leader_stands_down_without_split_brain() {
    let _tracing = setup_tracing();
    let cluster = Cluster::new();
    let (n1, faults) = cluster.flaky_node("n1");
    let n2 = cluster.node("n2");
    let channel = channel("ch");

    let mut a = n1.subscribe(&channel).await.unwrap();
    let mut b = n2.subscribe(&channel).await.unwrap();

    faults.set_unavailable(true);

    // The leader-side subscription and the follower both disconnect: the
    // leader once its budgets run out, the follower once the lease lapses.
    assert_eq!(
        next_event(&mut a).await,
        SubscriptionEvent::Closed(CloseReason::LeadershipLost)
    );
    assert_eq!(
        next_event(&mut b).await,
        SubscriptionEvent::Closed(CloseReason::LeadershipLost)
    );
    drop(a);
    drop(b);

    // Re-election lands on the healthy node; the producer was opened exactly
    // once per term.
    let b2 = subscribe_with_retry(&n2, &channel).await;
    assert!(n2.is_leader(&channel));
    assert_eq!(cluster.source.open_count(&channel), 2);
    drop(b2);
}

#[tokio::test(start_paused = true)]
async fn scenario_f_clean_upstream_end_is_distinguishable_and_releases() {
    let cluster = Cluster::new();
    let n1 = cluster.node("n1");
    let n2 = cluster.node("n2");
    let channel = channel("ch");

    let mut a = n1.subscribe(&channel).await.unwrap();
    let old = a.leadership().clone();
    let mut b = n2.subscribe(&channel).await.unwrap();

    cluster.source.end(&channel);

    assert_eq!(
        next_event(&mut a).await,
        SubscriptionEvent::Closed(CloseReason::UpstreamEnded)
    );
    assert_eq!(
        next_event(&mut b).await,
        SubscriptionEvent::Closed(CloseReason::UpstreamEnded)
    );
    assert_lease_gone(&cluster.store, &channel).await;
    drop(a);
    drop(b);

    // Resubscribing starts a fresh term and a fresh upstream stream.
    let b2 = subscribe_with_retry(&n2, &channel).await;
    assert_ne!(b2.leadership(), &old);
    assert_eq!(cluster.source.open_count(&channel), 2);
}

#[tokio::test(start_paused = true)]
async fn upstream_error_closes_with_failed() {
    let cluster = Cluster::new();
    let n1 = cluster.node("n1");
    let channel = channel("ch");

    let mut sub = n1.subscribe(&channel).await.unwrap();
    cluster.source.fail(&channel, "producer exploded");
    assert_eq!(
        next_event(&mut sub).await,
        SubscriptionEvent::Closed(CloseReason::UpstreamFailed)
    );
    assert_lease_gone(&cluster.store, &channel).await;
}

#[tokio::test(start_paused = true)]
async fn concurrent_first_subscribes_elect_exactly_one_leader() {
    let cluster = Cluster::new();
    let n1 = cluster.node("n1");
    let n2 = cluster.node("n2");
    let channel = channel("ch");

    let (a, b) = tokio::join!(
        subscribe_with_retry(&n1, &channel),
        subscribe_with_retry(&n2, &channel),
    );
    assert_eq!(a.leadership(), b.leadership());
    assert!(n1.is_leader(&channel) ^ n2.is_leader(&channel));
    assert_eq!(cluster.source.open_count(&channel), 1);
}

#[tokio::test(start_paused = true)]
async fn last_local_unsubscribe_on_the_leader_releases_the_lease() {
    let cluster = Cluster::new();
    let n1 = cluster.node("n1");
    let channel = channel("ch");

    let sub = n1.subscribe(&channel).await.unwrap();
    assert!(cluster.store.get(&channel).await.unwrap().is_some());

    drop(sub);
    assert_lease_gone(&cluster.store, &channel).await;
    assert!(!n1.is_leader(&channel));
    assert_eq!(n1.subscriber_count(&channel), 0);
}

#[tokio::test(start_paused = true)]
async fn followers_disconnect_after_the_leader_releases() {
    let cluster = Cluster::new();
    let n1 = cluster.node("n1");
    let n2 = cluster.node("n2");
    let channel = channel("ch");

    let a = n1.subscribe(&channel).await.unwrap();
    let mut b = n2.subscribe(&channel).await.unwrap();

    // Leadership follows the leader's local subscribers, not the followers'.
    a.unsubscribe();
    assert_eq!(
        next_event(&mut b).await,
        SubscriptionEvent::Closed(CloseReason::LeadershipLost)
    );
    drop(b);

    // The disconnected client's retry re-elects, now on the follower's node.
    let b2 = subscribe_with_retry(&n2, &channel).await;
    assert!(n2.is_leader(&channel));
    drop(b2);
}

#[tokio::test(start_paused = true)]
async fn leases_stay_refreshed_while_subscribed() {
    let cluster = Cluster::new();
    let n1 = cluster.node("n1");
    let n2 = cluster.node("n2");
    let channel = channel("ch");

    let mut a = n1.subscribe(&channel).await.unwrap();
    let mut b = n2.subscribe(&channel).await.unwrap();

    // Several TTLs pass; the refresh task keeps the lease alive the whole
    // time and nobody is disconnected.
    tokio::time::sleep(Duration::from_secs(45)).await;
    assert!(cluster.store.get(&channel).await.unwrap().is_some());

    cluster.source.push(&channel, "still-here");
    assert_eq!(
        next_event(&mut a).await,
        SubscriptionEvent::Message("still-here".into())
    );
    assert_eq!(
        next_event(&mut b).await,
        SubscriptionEvent::Message("still-here".into())
    );
}

#[tokio::test(start_paused = true)]
async fn watch_loop_tolerates_transient_store_failures_within_budget() {
    let cluster = Cluster::new();
    let n1 = cluster.node("n1");
    let (n2, faults) = cluster.flaky_node("n2");
    let channel = channel("ch");

    let _a = n1.subscribe(&channel).await.unwrap();
    let mut b = n2.subscribe(&channel).await.unwrap();

    // Two consecutive failures stay under the budget of three.
    faults.fail_next(2);
    tokio::time::sleep(Duration::from_secs(5)).await;

    cluster.source.push(&channel, "survived");
    assert_eq!(
        next_event(&mut b).await,
        SubscriptionEvent::Message("survived".into())
    );
}

#[tokio::test(start_paused = true)]
async fn survey_to_an_unreachable_leader_fails_the_subscribe() {
    let cluster = Cluster::new();
    let n1 = cluster.node("n1");
    let n2 = cluster.node("n2");
    let channel = channel("ch");

    let _a = n1.subscribe(&channel).await.unwrap();
    cluster.survey.partition(n1.id());

    let err = n2.subscribe(&channel).await.unwrap_err();
    assert!(matches!(err, SubscribeError::Survey(_)));
}

#[tokio::test(start_paused = true)]
async fn stale_lease_without_a_live_leader_is_rejected() {
    let cluster = Cluster::new();
    let n1 = cluster.node("n1");
    let n2 = cluster.node("n2");
    let channel = channel("ch");

    // A lease names n1 although n1 runs no stream for the channel (e.g. a
    // previous incarnation of the node crashed right after acquiring).
    cluster
        .store
        .acquire(&channel, n1.id(), Duration::from_secs(10))
        .await
        .unwrap();

    // The survey-routed subscribe is refused, per the turnover rule.
    let err = n2.subscribe(&channel).await.unwrap_err();
    assert!(matches!(err, SubscribeError::LeadershipChanged));

    // So is a local subscribe on the named node itself.
    let err = n1.subscribe(&channel).await.unwrap_err();
    assert!(matches!(err, SubscribeError::LeadershipChanged));
}

#[tokio::test(start_paused = true)]
async fn channel_failures_do_not_cross_channel_boundaries() {
    let cluster = Cluster::new();
    let n1 = cluster.node("n1");
    let healthy = channel("healthy");
    let doomed = channel("doomed");

    let mut a = n1.subscribe(&healthy).await.unwrap();
    let mut d = n1.subscribe(&doomed).await.unwrap();

    cluster.source.fail(&doomed, "boom");
    assert_eq!(
        next_event(&mut d).await,
        SubscriptionEvent::Closed(CloseReason::UpstreamFailed)
    );

    cluster.source.push(&healthy, "unaffected");
    assert_eq!(
        next_event(&mut a).await,
        SubscriptionEvent::Message("unaffected".into())
    );
    assert!(n1.is_leader(&healthy));
}

#[tokio::test(start_paused = true)]
async fn shutdown_closes_subscriptions_and_releases_leases() {
    let cluster = Cluster::new();
    let n1 = cluster.node("n1");
    let n2 = cluster.node("n2");
    let channel = channel("ch");

    let mut a = n1.subscribe(&channel).await.unwrap();
    let mut b = n2.subscribe(&channel).await.unwrap();

    n1.shutdown().await;
    assert_eq!(
        next_event(&mut a).await,
        SubscriptionEvent::Closed(CloseReason::LeadershipLost)
    );
    assert_lease_gone(&cluster.store, &channel).await;
    assert_eq!(
        next_event(&mut b).await,
        SubscriptionEvent::Closed(CloseReason::LeadershipLost)
    );
    assert!(matches!(
        n1.subscribe(&channel).await,
        Err(SubscribeError::ShuttingDown)
    ));
}
