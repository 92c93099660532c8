//! Common utilities for the cluster tests: recording critical sections,
//! loopback clusters, and scripted fake peers.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ricart::{Config, Node, Section, Timestamp};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

/// Cluster-wide record of who was inside the critical section.
#[derive(Default)]
pub struct Monitor {
    inside: AtomicUsize,
    overlap: AtomicBool,
    entries: Mutex<Vec<usize>>,
}

impl Monitor {
    pub fn overlapped(&self) -> bool {
        self.overlap.load(Ordering::SeqCst)
    }

    pub fn entries(&self) -> Vec<usize> {
        self.entries.lock().unwrap().clone()
    }
}

/// Section that holds for a fixed time and reports to a `Monitor`.
pub struct Recorder {
    pub monitor: Arc<Monitor>,
    pub hold: Duration,
    pub entered: usize,
    pub exited: usize,
}

impl Section for Recorder {
    fn enter(&mut self, id: usize, _: Timestamp) -> Duration {
        if self.monitor.inside.fetch_add(1, Ordering::SeqCst) > 0 {
            self.monitor.overlap.store(true, Ordering::SeqCst);
        }
        self.monitor.entries.lock().unwrap().push(id);
        self.entered += 1;
        self.hold
    }

    fn exit(&mut self, _: usize) {
        self.monitor.inside.fetch_sub(1, Ordering::SeqCst);
        self.exited += 1;
    }
}

pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .and_then(|listener| listener.local_addr())
        .map(|addr| addr.port())
        .expect("no free port")
}

pub fn store_path(dir: &Path, id: usize) -> PathBuf {
    dir.join(format!("config{}.txt", id))
}

/// Writes `rows` as node `id`'s membership store.
pub fn write_store(dir: &Path, id: usize, rows: &[(usize, u16)]) -> PathBuf {
    let path = store_path(dir, id);
    let contents = rows.iter()
        .map(|(id, port)| format!("{} 127.0.0.1 {}\n", id, port))
        .collect::<String>();
    std::fs::write(&path, contents).unwrap();
    path
}

pub fn config(dir: &Path, id: usize) -> Config {
    Config::new(id)
        .with_path(store_path(dir, id))
        .with_timeout(Duration::from_millis(300))
        .with_heartbeat(Duration::from_secs(60))
}

/// Starts one node per entry of `rows`, each with a store listing all of
/// `rows`. `tune` adjusts every node's config.
pub async fn cluster<F>(
    dir: &Path,
    rows: &[(usize, u16)],
    hold: Duration,
    tune: F,
) -> (Arc<Monitor>, Vec<Node<Recorder>>)
where F: Fn(Config) -> Config
{
    let monitor = Arc::new(Monitor::default());
    let mut nodes = Vec::new();
    for (id, _) in rows {
        write_store(dir, *id, rows);
        let recorder = Recorder { monitor: monitor.clone(), hold, entered: 0, exited: 0 };
        let node = tune(config(dir, *id)).run(recorder).await.expect("node failed to start");
        nodes.push(node);
    }
    (monitor, nodes)
}

/// Polls `condition` until it holds or `within` elapses.
pub async fn eventually<F: FnMut() -> bool>(within: Duration, mut condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Raw connection speaking the line protocol.
pub struct Raw {
    reader: tokio::io::Lines<BufReader<tokio::net::tcp::OwnedReadHalf>>,
    writer: tokio::net::tcp::OwnedWriteHalf,
}

impl Raw {
    pub async fn connect(port: u16) -> Raw {
        let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let (reader, writer) = stream.into_split();
        Raw { reader: BufReader::new(reader).lines(), writer }
    }

    pub async fn call(&mut self, line: &str) -> String {
        self.writer.write_all(format!("{}\n", line).as_bytes()).await.unwrap();
        self.reader.next_line().await.unwrap().expect("connection closed")
    }
}

/// Script for a peer that grants every request straight away.
pub fn voter(id: usize) -> impl Fn(&str) -> Option<String> + Send + Sync + 'static {
    move |line: &str| match line.split('~').next() {
    | Some("CSENTRY") => Some(format!("CSREPLY~{}~1", id)),
    | Some("HEARTBEAT") => Some(format!("HEARTBEAT_REPLY~{}", id)),
    | _ => Some("GOTIT~1".to_string()),
    }
}

/// Scripted peer: records every line it receives and answers with
/// whatever `respond` returns.
pub struct Fake {
    pub port: u16,
    received: Arc<Mutex<Vec<String>>>,
}

impl Fake {
    pub async fn start<F>(respond: F) -> Fake
    where F: Fn(&str) -> Option<String> + Send + Sync + 'static
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let received = Arc::new(Mutex::new(Vec::new()));
        let respond = Arc::new(respond);
        let log = received.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let respond = respond.clone();
                let log = log.clone();
                tokio::spawn(async move {
                    let (reader, mut writer) = stream.into_split();
                    let mut lines = BufReader::new(reader).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        log.lock().unwrap().push(line.clone());
                        if let Some(reply) = respond(&line) {
                            if writer.write_all(format!("{}\n", reply).as_bytes()).await.is_err() {
                                break
                            }
                        }
                    }
                });
            }
        });
        Fake { port, received }
    }

    pub fn received(&self) -> Vec<String> {
        self.received.lock().unwrap().clone()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.received()
            .iter()
            .filter(|line| line.split('~').next() == Some(kind))
            .count()
    }
}
