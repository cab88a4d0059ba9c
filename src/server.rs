// Server module - command execution, connection handling, lifecycle
// One task per connection, requests served strictly in order within it.
// Durable verbs append to the WAL first and touch the map only on append
// success, so replay can never miss a mutation a client saw acknowledged.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::protocol::{self, Command};
use crate::store::ShardedMap;
use crate::wal::{WalOp, WalOptions, WriteAheadLog};
use crate::{KvError, Result};

const DRAIN_DEADLINE: Duration = Duration::from_secs(1);
const DRAIN_POLL: Duration = Duration::from_millis(25);

// ==================== Server ====================

/// The store: sharded map plus write-ahead log behind one shared handle.
/// Cloning is cheap and shares state.
#[derive(Clone)]
pub struct Server {
    shared: Arc<Shared>,
}

struct Shared {
    config: Config,
    map: ShardedMap,
    wal: WriteAheadLog,
    connections: AtomicUsize,
}

impl Server {
    /// Open the WAL and rebuild the map from it. Fails on WAL open errors
    /// and on mid-file log corruption; both are fatal at startup.
    pub fn new(config: Config) -> Result<Server> {
        let map = ShardedMap::new(config.num_segments, config.initial_bucket_size);
        let wal = WriteAheadLog::open(
            &config.wal_file,
            WalOptions {
                sync_writes: config.sync_wal,
                buffer_size: config.wal_buffer_size,
                max_key_size: config.max_key_size,
                max_value_size: config.max_value_size,
            },
        )?;

        let shared = Arc::new(Shared {
            config,
            map,
            wal,
            connections: AtomicUsize::new(0),
        });
        shared.recover()?;

        Ok(Server { shared })
    }

    /// Accept connections until `shutdown` resolves, then stop accepting,
    /// let in-flight handlers drain, and flush the log.
    pub async fn serve(&self, listener: TcpListener, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                result = listener.accept() => match result {
                    Ok((stream, _)) => {
                        let shared = self.shared.clone();
                        tokio::spawn(async move {
                            handle_connection(shared, stream).await;
                        });
                    }
                    Err(e) => warn!("accept error: {}", e),
                },
                _ = &mut shutdown => break,
            }
        }

        drop(listener);
        self.drain().await;
        if let Err(e) = self.shared.wal.sync() {
            warn!("final WAL sync failed: {}", e);
        }
        info!(items = self.shared.map.len(), "server stopped");
    }

    async fn drain(&self) {
        let started = Instant::now();
        while self.connection_count() > 0 && started.elapsed() < DRAIN_DEADLINE {
            tokio::time::sleep(DRAIN_POLL).await;
        }
        let remaining = self.connection_count();
        if remaining > 0 {
            warn!(remaining, "drain deadline reached with connections open");
        }
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn item_count(&self) -> usize {
        self.shared.map.len()
    }

    pub fn connection_count(&self) -> usize {
        self.shared.connections.load(Ordering::Relaxed)
    }

    /// Execute one already-parsed command and return the reply body. The
    /// network path parses each line and feeds it through here.
    pub fn execute(&self, command: Command) -> Vec<u8> {
        self.shared.execute(command)
    }
}

// ==================== Recovery ====================

impl Shared {
    // Replay the log straight into the map. The callbacks bypass the WAL:
    // recovery must not re-append.
    fn recover(&self) -> Result<u64> {
        let applied = self.wal.replay(
            |key, value| {
                self.map.insert(key, value);
            },
            |key| {
                self.map.erase(&key);
            },
        )?;
        info!(
            records = applied,
            items = self.map.len(),
            next_seq = self.wal.next_seq(),
            "recovery complete"
        );
        Ok(applied)
    }

    // ==================== Command Execution ====================

    fn execute_line(&self, line: &[u8]) -> Vec<u8> {
        match protocol::parse_command(line) {
            Ok(command) => self.execute(command),
            Err(e) => error_reply(&e),
        }
    }

    fn execute(&self, command: Command) -> Vec<u8> {
        match command {
            Command::Put { key, value } => {
                if let Err(e) = self.check_key(&key).and_then(|()| self.check_value(&value)) {
                    return error_reply(&e);
                }
                match self.wal.append(WalOp::Put, &key, &value) {
                    Ok(()) => {
                        self.map.insert(key, value);
                        b"OK".to_vec()
                    }
                    Err(e) => {
                        error!("WAL append failed: {}", e);
                        b"ERROR WAL write failed".to_vec()
                    }
                }
            }
            Command::Get { key } => {
                if let Err(e) = self.check_key(&key) {
                    return error_reply(&e);
                }
                match self.map.find(&key) {
                    Some(value) => value.to_vec(),
                    None => b"NOT_FOUND".to_vec(),
                }
            }
            Command::Delete { key } => {
                if let Err(e) = self.check_key(&key) {
                    return error_reply(&e);
                }
                // The record is written even when the key is absent; a
                // replayed Delete of a missing key is a no-op.
                match self.wal.append(WalOp::Delete, &key, &[]) {
                    Ok(()) => {
                        if self.map.erase(&key) {
                            b"OK".to_vec()
                        } else {
                            b"NOT_FOUND".to_vec()
                        }
                    }
                    Err(e) => {
                        error!("WAL append failed: {}", e);
                        b"ERROR WAL write failed".to_vec()
                    }
                }
            }
            Command::Exists { key } => {
                if let Err(e) = self.check_key(&key) {
                    return error_reply(&e);
                }
                if self.map.exists(&key) {
                    b"true".to_vec()
                } else {
                    b"false".to_vec()
                }
            }
            Command::Size => self.map.len().to_string().into_bytes(),
            Command::Ping => b"PONG".to_vec(),
            Command::Flush => {
                self.map.clear();
                match self.wal.clear() {
                    Ok(()) => b"OK".to_vec(),
                    Err(e) => {
                        error!("WAL clear failed: {}", e);
                        b"ERROR WAL clear failed".to_vec()
                    }
                }
            }
            Command::Stats => {
                let stats = self.map.statistics();
                format!(
                    "items: {}\nbuckets: {}\nload_factor: {:.4}\nutilization: {:.4}",
                    stats.item_count, stats.shard_count, stats.load_factor, stats.utilization
                )
                .into_bytes()
            }
        }
    }

    fn check_key(&self, key: &[u8]) -> Result<()> {
        if key.len() > self.config.max_key_size {
            return Err(KvError::Validation("Key too large"));
        }
        Ok(())
    }

    fn check_value(&self, value: &[u8]) -> Result<()> {
        if value.len() > self.config.max_value_size {
            return Err(KvError::Validation("Value too large"));
        }
        Ok(())
    }

    // ==================== Connection Accounting ====================

    fn try_acquire_connection(&self) -> bool {
        let limit = self.config.max_connections;
        self.connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                if n >= limit {
                    None
                } else {
                    Some(n + 1)
                }
            })
            .is_ok()
    }

    fn release_connection(&self) {
        self.connections.fetch_sub(1, Ordering::Relaxed);
    }
}

fn error_reply(error: &KvError) -> Vec<u8> {
    format!("ERROR {}", error).into_bytes()
}

// ==================== Connection Handling ====================

async fn handle_connection(shared: Arc<Shared>, stream: TcpStream) {
    if !shared.try_acquire_connection() {
        // At the limit the socket is closed with no reply.
        debug!("connection limit reached, dropping connection");
        return;
    }

    let _ = stream.set_nodelay(true);
    let max_line = shared.config.max_key_size + shared.config.max_value_size + 64;

    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line: Vec<u8> = Vec::with_capacity(256);

    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break, // EOF
            Ok(_) => {}
            Err(e) => {
                debug!("connection read error: {}", e);
                break;
            }
        }
        // A stream that ends mid-line never delivered a full request.
        if line.last() != Some(&b'\n') {
            break;
        }
        line.pop();
        if line.len() > max_line {
            debug!(len = line.len(), "request line too long, closing connection");
            break;
        }

        let mut reply = shared.execute_line(&line);
        reply.push(b'\n');
        if let Err(e) = write_half.write_all(&reply).await {
            debug!("connection write error: {}", e);
            break;
        }
    }

    shared.release_connection();
}
