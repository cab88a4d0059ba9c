// Concurrency tests for the sharded map and the full server path.
// Writers on disjoint key spaces must never lose an insert, and the global
// item counter must equal the per-shard sums at quiescence.

use std::sync::Arc;
use std::thread;

use bytes::Bytes;
use kivi::{Config, KvClient, Server, ShardedMap};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

const NUM_THREADS: usize = 8;
const KEYS_PER_THREAD: usize = 250;

#[test]
fn test_disjoint_writers() {
    let map = Arc::new(ShardedMap::new(16, 16));
    let mut handles = Vec::new();

    for thread_id in 0..NUM_THREADS {
        let map = map.clone();
        handles.push(thread::spawn(move || {
            for i in 0..KEYS_PER_THREAD {
                let key = Bytes::from(format!("t{}:k{}", thread_id, i));
                let value = Bytes::from(format!("v{}", i));
                map.insert(key, value);
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(map.len(), NUM_THREADS * KEYS_PER_THREAD);

    // Every key is retrievable with its own value.
    for thread_id in 0..NUM_THREADS {
        for i in 0..KEYS_PER_THREAD {
            let key = format!("t{}:k{}", thread_id, i);
            assert_eq!(
                map.find(key.as_bytes()),
                Some(Bytes::from(format!("v{}", i))),
                "missing {}",
                key
            );
        }
    }

    // Counter matches the per-shard sums at quiescence.
    let stats = map.statistics();
    assert_eq!(stats.shard_sizes.iter().sum::<usize>(), map.len());
}

#[test]
fn test_contended_overwrites_single_key() {
    let map = Arc::new(ShardedMap::new(16, 16));
    let mut handles = Vec::new();

    for thread_id in 0..NUM_THREADS {
        let map = map.clone();
        handles.push(thread::spawn(move || {
            for i in 0..KEYS_PER_THREAD {
                map.insert(
                    Bytes::from("hot"),
                    Bytes::from(format!("{}:{}", thread_id, i)),
                );
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    // All writers hit the same key: one entry, some writer's value.
    assert_eq!(map.len(), 1);
    assert!(map.find(b"hot").is_some());
}

#[test]
fn test_readers_alongside_writers() {
    let map = Arc::new(ShardedMap::new(16, 16));
    for i in 0..100 {
        map.insert(Bytes::from(format!("base{}", i)), Bytes::from("seed"));
    }

    let mut handles = Vec::new();
    for thread_id in 0..4 {
        let map = map.clone();
        handles.push(thread::spawn(move || {
            for i in 0..KEYS_PER_THREAD {
                map.insert(Bytes::from(format!("w{}:{}", thread_id, i)), Bytes::from("x"));
            }
        }));
    }
    for _ in 0..4 {
        let map = map.clone();
        handles.push(thread::spawn(move || {
            for i in 0..KEYS_PER_THREAD {
                // Seed keys are never removed, so reads always hit.
                let key = format!("base{}", i % 100);
                assert!(map.exists(key.as_bytes()));
                let _ = map.find(key.as_bytes());
                let _ = map.len();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(map.len(), 100 + 4 * KEYS_PER_THREAD);
}

#[test]
fn test_erase_vs_insert_disjoint() {
    let map = Arc::new(ShardedMap::new(16, 16));
    for i in 0..KEYS_PER_THREAD {
        map.insert(Bytes::from(format!("old{}", i)), Bytes::from("x"));
    }

    let eraser = {
        let map = map.clone();
        thread::spawn(move || {
            for i in 0..KEYS_PER_THREAD {
                assert!(map.erase(format!("old{}", i).as_bytes()));
            }
        })
    };
    let inserter = {
        let map = map.clone();
        thread::spawn(move || {
            for i in 0..KEYS_PER_THREAD {
                map.insert(Bytes::from(format!("new{}", i)), Bytes::from("y"));
            }
        })
    };
    eraser.join().unwrap();
    inserter.join().unwrap();

    assert_eq!(map.len(), KEYS_PER_THREAD);
    let stats = map.statistics();
    assert_eq!(stats.shard_sizes.iter().sum::<usize>(), KEYS_PER_THREAD);
}

// ==================== Full-Server Concurrency ====================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_clients_over_tcp() {
    const CLIENTS: usize = 4;
    const KEYS_PER_CLIENT: usize = 50;

    let dir = TempDir::new().unwrap();
    let config = Config {
        num_segments: 16,
        wal_file: dir.path().join("conc.wal"),
        ..Config::default()
    };

    let server = Server::new(config).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let serve = {
        let server = server.clone();
        tokio::spawn(async move {
            server
                .serve(listener, async {
                    let _ = stop_rx.await;
                })
                .await;
        })
    };

    let mut tasks = Vec::new();
    for client_id in 0..CLIENTS {
        tasks.push(tokio::spawn(async move {
            let mut client = KvClient::connect(addr).await.unwrap();
            for i in 0..KEYS_PER_CLIENT {
                let key = format!("c{}:k{}", client_id, i);
                assert!(client.put(&key, "value").await.unwrap());
            }
            for i in 0..KEYS_PER_CLIENT {
                let key = format!("c{}:k{}", client_id, i);
                assert!(client.exists(&key).await.unwrap());
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let mut client = KvClient::connect(addr).await.unwrap();
    assert_eq!(client.size().await.unwrap(), CLIENTS * KEYS_PER_CLIENT);
    drop(client);

    let _ = stop_tx.send(());
    serve.await.unwrap();
}
