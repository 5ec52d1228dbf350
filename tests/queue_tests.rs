mod test_harness;

use std::collections::HashSet;
use std::sync::Arc;

use convoy::queue::SharedQueue;
use convoy::store::{KvStore, MemoryStore};
use test_harness::fast_backoff;

fn queue(store: &Arc<MemoryStore>) -> SharedQueue<u32> {
    SharedQueue::with_backoff(store.clone(), "test/queue", fast_backoff())
}

#[tokio::test]
async fn test_fifo_order() {
    let store = Arc::new(MemoryStore::new());
    let q = queue(&store);

    assert!(q.is_empty().await.unwrap());
    assert_eq!(q.dequeue().await.unwrap(), None);

    for i in 0..3 {
        q.enqueue(i).await.unwrap();
    }
    assert_eq!(q.items().await.unwrap(), vec![0, 1, 2]);
    assert_eq!(q.peek_head().await.unwrap(), Some(0));
    assert_eq!(q.len().await.unwrap(), 3);

    assert_eq!(q.dequeue().await.unwrap(), Some(0));
    assert_eq!(q.dequeue().await.unwrap(), Some(1));
    assert_eq!(q.peek_head().await.unwrap(), Some(2));
}

#[tokio::test]
async fn test_enqueue_all_is_one_write() {
    let store = Arc::new(MemoryStore::new());
    let q = queue(&store);
    q.enqueue(0).await.unwrap();
    let before = store.get("test/queue").await.unwrap().unwrap().version;

    q.enqueue_all(vec![1, 2, 3]).await.unwrap();
    let after = store.get("test/queue").await.unwrap().unwrap().version;
    assert_eq!(q.items().await.unwrap(), vec![0, 1, 2, 3]);
    assert_eq!(after, before + 1);

    q.enqueue_all(Vec::new()).await.unwrap();
    assert_eq!(store.get("test/queue").await.unwrap().unwrap().version, after);
}

#[tokio::test]
async fn test_dequeue_if_only_matching_head() {
    let store = Arc::new(MemoryStore::new());
    let q = queue(&store);
    q.enqueue_all(vec![4, 5]).await.unwrap();

    assert_eq!(q.dequeue_if(|head| *head == 5).await.unwrap(), None);
    assert_eq!(q.dequeue_if(|head| *head == 4).await.unwrap(), Some(4));
    assert_eq!(q.items().await.unwrap(), vec![5]);
}

#[tokio::test]
async fn test_clear_removes_everything() {
    let store = Arc::new(MemoryStore::new());
    let q = queue(&store);
    for i in 0..5 {
        q.enqueue(i).await.unwrap();
    }

    assert_eq!(q.clear().await.unwrap(), 5);
    assert!(q.is_empty().await.unwrap());
    assert_eq!(q.clear().await.unwrap(), 0);
}

#[tokio::test]
async fn test_empty_value_reads_as_empty_queue() {
    let store = Arc::new(MemoryStore::new());
    store.put("test/queue", Vec::new()).await.unwrap();

    let q = queue(&store);
    assert!(q.items().await.unwrap().is_empty());
    q.enqueue(7).await.unwrap();
    assert_eq!(q.items().await.unwrap(), vec![7]);
}

#[tokio::test]
async fn test_corrupt_value_is_an_error() {
    let store = Arc::new(MemoryStore::new());
    store.put("test/queue", b"not json".to_vec()).await.unwrap();

    let q = queue(&store);
    assert!(q.items().await.is_err());
    assert!(q.enqueue(1).await.is_err());
}

#[tokio::test]
async fn test_enqueue_unless_skips_duplicates() {
    let store = Arc::new(MemoryStore::new());
    let q = queue(&store);

    assert!(q.enqueue_unless(1, |i| *i == 1).await.unwrap());
    assert!(!q.enqueue_unless(1, |i| *i == 1).await.unwrap());
    assert_eq!(q.items().await.unwrap(), vec![1]);
}

#[tokio::test]
async fn test_conflicts_are_retried_not_surfaced() {
    let store = Arc::new(MemoryStore::new());
    let q = queue(&store);

    store.inject_conflicts(3);
    q.enqueue(42).await.unwrap();

    assert_eq!(store.pending_conflicts(), 0);
    assert_eq!(q.items().await.unwrap(), vec![42]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_enqueue_loses_nothing() {
    let store = Arc::new(MemoryStore::new());
    store.inject_conflicts(20);

    let mut handles = Vec::new();
    for writer in 0..8u32 {
        let q = queue(&store);
        handles.push(tokio::spawn(async move {
            for i in 0..10u32 {
                q.enqueue(writer * 100 + i).await.unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let items = queue(&store).items().await.unwrap();
    assert_eq!(items.len(), 80);
    let unique: HashSet<u32> = items.iter().copied().collect();
    assert_eq!(unique.len(), 80);

    // Each writer's own items keep their relative order
    for writer in 0..8u32 {
        let mine: Vec<u32> = items
            .iter()
            .copied()
            .filter(|i| i / 100 == writer)
            .collect();
        let expected: Vec<u32> = (0..10).map(|i| writer * 100 + i).collect();
        assert_eq!(mine, expected);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_dequeue_never_duplicates() {
    let store = Arc::new(MemoryStore::new());
    let q = queue(&store);
    for i in 0..60 {
        q.enqueue(i).await.unwrap();
    }
    store.inject_conflicts(10);

    let mut handles = Vec::new();
    for _ in 0..4 {
        let q = queue(&store);
        handles.push(tokio::spawn(async move {
            let mut taken = Vec::new();
            while let Some(item) = q.dequeue().await.unwrap() {
                taken.push(item);
            }
            taken
        }));
    }

    let mut all = Vec::new();
    for handle in handles {
        let taken = handle.await.unwrap();
        // Every consumer sees items in queue order
        assert!(taken.windows(2).all(|w| w[0] < w[1]));
        all.extend(taken);
    }

    all.sort_unstable();
    assert_eq!(all, (0..60).collect::<Vec<u32>>());
    assert!(q.is_empty().await.unwrap());
}
