use std::sync::Arc;

use bytes::Bytes;
use zdix::{
    cluster::{coordinator::ClusterCoordinator, substrate::memory::InMemorySubstrate},
    config::{ClientConfig, IndexConfig},
    dispatcher::local::LocalDispatcher,
    index::in_memory::InMemoryIndex,
    node::NodeContext,
    proxy::IndexProxy,
};

const HOST: &str = "127.0.0.1:4001";

async fn start_standalone(dim: usize, depth: u32) -> IndexProxy {
    zdix::telemetry::init_subscriber();
    let substrate = Arc::new(InMemorySubstrate::default());
    let dispatcher = Arc::new(LocalDispatcher::default());

    let node = Arc::new(NodeContext::new(
        HOST.to_string(),
        Arc::new(InMemoryIndex::default()),
    ));
    dispatcher.register(node);

    let mut coordinator = ClusterCoordinator::new(substrate);
    coordinator.connect().await.unwrap();
    coordinator.register_host(HOST).await.unwrap();
    coordinator
        .create_index(&IndexConfig { dim, depth })
        .await
        .unwrap();

    let proxy = IndexProxy::new(
        Arc::new(coordinator),
        dispatcher,
        ClientConfig { batch_size: 2 },
    );
    proxy.create(dim, depth).await.unwrap();
    proxy
}

#[tokio::test]
async fn test_standalone_put_get() {
    let proxy = start_standalone(2, 8).await;

    proxy.put(vec![1, 2], Bytes::from("a")).await.unwrap();
    proxy.put(vec![3, 4], Bytes::from("b")).await.unwrap();

    assert_eq!(
        proxy.get(vec![1, 2]).await.unwrap().unwrap(),
        Bytes::from("a")
    );
    assert_eq!(
        proxy.get(vec![3, 4]).await.unwrap().unwrap(),
        Bytes::from("b")
    );

    // an absent key is an empty result, not an error
    assert!(proxy.get(vec![9, 9]).await.unwrap().is_none());
}

#[tokio::test]
async fn test_standalone_put_returns_previous_value() {
    let proxy = start_standalone(2, 8).await;

    assert!(proxy
        .put(vec![1, 2], Bytes::from("a"))
        .await
        .unwrap()
        .is_none());
    assert_eq!(
        proxy
            .put(vec![1, 2], Bytes::from("a2"))
            .await
            .unwrap()
            .unwrap(),
        Bytes::from("a")
    );
}

#[tokio::test]
async fn test_standalone_delete_and_contains() {
    let proxy = start_standalone(2, 8).await;

    proxy.put(vec![1, 2], Bytes::from("a")).await.unwrap();
    assert!(proxy.contains(vec![1, 2]).await.unwrap());

    assert_eq!(
        proxy.delete(vec![1, 2]).await.unwrap().unwrap(),
        Bytes::from("a")
    );
    assert!(!proxy.contains(vec![1, 2]).await.unwrap());
    assert!(proxy.delete(vec![1, 2]).await.unwrap().is_none());
}

/// With a single host the distributed k-NN degenerates to the local index's
/// own answer, which validates the merge/sort step independent of routing
#[tokio::test]
async fn test_standalone_knn_is_exact() {
    let proxy = start_standalone(2, 8).await;

    let points: Vec<Vec<u64>> = vec![
        vec![0, 0],
        vec![1, 1],
        vec![2, 2],
        vec![5, 5],
        vec![10, 10],
        vec![100, 100],
    ];
    for point in points.iter() {
        proxy.put(point.clone(), Bytes::from("v")).await.unwrap();
    }

    let neighbors = proxy.get_nearest_neighbors(vec![1, 1], 3).await.unwrap();
    assert_eq!(neighbors, vec![vec![1, 1], vec![0, 0], vec![2, 2]]);

    let neighbors = proxy.get_nearest_neighbors(vec![4, 4], 2).await.unwrap();
    assert_eq!(neighbors, vec![vec![5, 5], vec![2, 2]]);
}

#[tokio::test]
async fn test_standalone_knn_with_fewer_points_than_k() {
    let proxy = start_standalone(2, 8).await;

    proxy.put(vec![1, 1], Bytes::from("v")).await.unwrap();
    proxy.put(vec![7, 7], Bytes::from("v")).await.unwrap();

    // the expansion loop must terminate and hand back whatever exists
    let neighbors = proxy.get_nearest_neighbors(vec![0, 0], 10).await.unwrap();
    assert_eq!(neighbors, vec![vec![1, 1], vec![7, 7]]);
}

#[tokio::test]
async fn test_standalone_range_with_distance_filter() {
    let proxy = start_standalone(2, 8).await;

    proxy.put(vec![10, 10], Bytes::from("center")).await.unwrap();
    proxy.put(vec![12, 10], Bytes::from("near")).await.unwrap();
    proxy.put(vec![19, 19], Bytes::from("corner")).await.unwrap();

    let all = proxy.get_range(vec![0, 0], vec![20, 20]).await.unwrap();
    assert_eq!(all.len(), 3);

    // the box center is (10,10); the corner point is outside the radius
    let filtered = proxy
        .get_range_within(vec![0, 0], vec![20, 20], 3.0)
        .await
        .unwrap();
    let mut keys: Vec<_> = filtered.iter().map(|e| e.key.clone()).collect();
    keys.sort();
    assert_eq!(keys, vec![vec![10, 10], vec![12, 10]]);
}

#[tokio::test]
async fn test_standalone_range_iterator() {
    let proxy = start_standalone(2, 8).await;

    for i in 0..10u64 {
        proxy
            .put(vec![i * 20, i * 20], Bytes::from(format!("v{}", i)))
            .await
            .unwrap();
    }

    let mut iterator = proxy.iter_range(vec![0, 0], vec![100, 100]).unwrap();
    let mut count = 0;
    while iterator.has_next().await.unwrap() {
        let entry = iterator.next().await.unwrap();
        assert!(entry.key[0] <= 100 && entry.key[1] <= 100);
        count += 1;
    }
    assert_eq!(count, 6);
}

#[tokio::test]
async fn test_standalone_iterator_round_trip() {
    let proxy = start_standalone(2, 8).await;

    for i in 0..7u64 {
        proxy
            .put(vec![i, i], Bytes::from(format!("v{}", i)))
            .await
            .unwrap();
    }

    let mut iterator = proxy.iter().unwrap();
    let mut seen = Vec::new();
    while iterator.has_next().await.unwrap() {
        seen.push(iterator.next().await.unwrap());
    }

    assert_eq!(seen.len(), 7);
    let mut keys: Vec<_> = seen.iter().map(|e| e.key.clone()).collect();
    keys.sort();
    keys.dedup();
    assert_eq!(keys.len(), 7);

    // driving past the end fails loudly
    assert!(iterator.next().await.err().unwrap().is_exhausted());
}
