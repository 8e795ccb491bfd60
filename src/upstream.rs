use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use dashmap::DashMap;
use hickory_proto::op::{Message, MessageType};
use hickory_proto::serialize::binary::BinDecodable;
use rustc_hash::FxBuildHasher;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::cache::ResponseCache;
use crate::filter::{apply_filters, RecordFilter};
use crate::policy::{Backend, Transport};

/// Send deadline, TCP connect deadline and the dispatcher's per-backend
/// wait on the result channel.
pub const ATTEMPT_TIMEOUT: Duration = Duration::from_millis(500);
/// One-shot TCP reader deadline.
const TCP_READ_TIMEOUT: Duration = Duration::from_secs(1);
/// Transactions older than this are swept by `cleanup`.
const TX_MAX_AGE: Duration = Duration::from_secs(3);
/// Pause before the first reconnect attempt, then per-retry backoff.
const RECONNECT_PAUSE: Duration = Duration::from_secs(1);
const RECONNECT_BACKOFF: Duration = Duration::from_secs(2);

/// What the duplicate-response path needs: the cache it overrides and the
/// global filter chain it vets late arrivals with.
pub struct Defense {
    pub cache: Arc<ResponseCache>,
    pub global_filters: Arc<Vec<RecordFilter>>,
}

/// One outstanding upstream exchange. Registered in the client's table
/// under backend-url + message-id until the cleanup sweep drops it; keeping
/// it registered after the first answer is what lets a late duplicate be
/// seen at all.
pub struct Transaction {
    req: Message,
    filters: Arc<Vec<RecordFilter>>,
    result: mpsc::Sender<Option<Message>>,
    created: Instant,
    reply_cnt: AtomicU32,
    last_msg: Mutex<Option<Message>>,
}

impl Transaction {
    pub fn new(
        req: Message,
        filters: Arc<Vec<RecordFilter>>,
        result: mpsc::Sender<Option<Message>>,
    ) -> Self {
        Self {
            req,
            filters,
            result,
            created: Instant::now(),
            reply_cnt: AtomicU32::new(0),
            last_msg: Mutex::new(None),
        }
    }

    pub fn id(&self) -> u16 {
        self.req.id()
    }

    /// Response arrival, serialized by the reply counter. The first
    /// response wins the result channel; a later one carrying answers is
    /// taken as the trustworthy correction and overwrites the cache with a
    /// doubled TTL instead of being delivered.
    pub fn reply(
        &self,
        msg: Option<Message>,
        err: Option<&anyhow::Error>,
        be: &Backend,
        defense: &Defense,
    ) {
        let mut cnt = 0;
        if let Some(m) = &msg {
            if m.message_type() == MessageType::Response {
                cnt = self.reply_cnt.fetch_add(1, Ordering::SeqCst) + 1;
            }
        }

        if cnt == 1 {
            let msg = match msg {
                Some(m) => m,
                None => return,
            };
            if let Ok(mut last) = self.last_msg.lock() {
                *last = Some(msg.clone());
            }
            let rtt_ms = self.created.elapsed().as_millis() as u64;
            if let Some(q) = self.req.queries().first() {
                match err {
                    None => info!(
                        event = "upstream_reply",
                        qname = %q.name(),
                        qtype = ?q.query_type(),
                        backend = %be.url,
                        rtt_ms,
                        answers = msg.answers().len(),
                        "query answered"
                    ),
                    Some(e) => warn!(
                        event = "upstream_reply",
                        qname = %q.name(),
                        qtype = ?q.query_type(),
                        backend = %be.url,
                        rtt_ms,
                        error = %e,
                        "query answered with error"
                    ),
                }
            }
            let out = if msg.answers().is_empty() {
                Some(msg)
            } else {
                apply_filters(msg, &self.filters)
            };
            // capacity-1 channel; a racing sibling's answer is dropped
            let _ = self.result.try_send(out);
        } else if cnt > 1 {
            let msg = match msg {
                Some(m) => m,
                None => return,
            };
            if msg.answers().is_empty() {
                return;
            }
            if let Ok(last) = self.last_msg.lock() {
                if let Some(prev) = last.as_ref() {
                    warn!(
                        event = "dirty_record",
                        nth = cnt,
                        backend = %be.url,
                        answers = ?msg.answers(),
                        previous = ?prev.answers(),
                        "previous record may be dirty"
                    );
                }
            }
            // the late arrival is vetted by the global chain, not the
            // per-entry one, and planted with a doubled TTL so it outlives
            // whatever the first arrival left in downstream caches
            if let Some(clean) = apply_filters(msg, &defense.global_filters) {
                defense.cache.set(&clean, 1);
            }
        } else if let Some(e) = err {
            // dial/send failure: nothing reaches the channel and the
            // dispatcher's attempt timeout advances to the next backend
            debug!(event = "upstream_error", backend = %be.url, error = %e, "query failed");
        }
    }
}

type TxTable = DashMap<String, Arc<Transaction>, FxBuildHasher>;

/// Multiplexing upstream client: one persistent connected UDP socket per
/// backend with a dedicated reader task, a fresh connection per TCP query,
/// and a shared transaction table dispatching responses by
/// backend-url + message-id.
pub struct UpstreamClient {
    conns: DashMap<String, Arc<UdpSocket>>,
    transactions: TxTable,
    // age-ordered by construction; the sweep stops at the first young entry
    tx_queue: Mutex<VecDeque<(String, Instant)>>,
    defense: Defense,
    shutdown: watch::Sender<bool>,
}

impl UpstreamClient {
    pub fn new(defense: Defense) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            conns: DashMap::new(),
            transactions: DashMap::with_hasher(FxBuildHasher::default()),
            tx_queue: Mutex::new(VecDeque::new()),
            defense,
            shutdown,
        })
    }

    /// Stop reader tasks and drop every upstream socket.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        self.conns.clear();
    }

    pub async fn query(self: &Arc<Self>, be: &Backend, tx: Arc<Transaction>) {
        match be.transport {
            Transport::Udp => self.query_udp(be, tx).await,
            Transport::Tcp => self.query_tcp(be, tx).await,
        }
    }

    async fn query_udp(self: &Arc<Self>, be: &Backend, tx: Arc<Transaction>) {
        let conn = match self.get_connection(be).await {
            Ok(conn) => conn,
            Err(err) => {
                tx.reply(None, Some(&err), be, &self.defense);
                return;
            }
        };
        let buf = match tx.req.to_vec() {
            Ok(buf) => buf,
            Err(err) => {
                tx.reply(None, Some(&anyhow::Error::new(err)), be, &self.defense);
                return;
            }
        };
        self.register(format!("{}{}", be.url, tx.id()), tx.clone());
        match timeout(ATTEMPT_TIMEOUT, conn.send(&buf)).await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => tx.reply(None, Some(&anyhow::Error::new(err)), be, &self.defense),
            Err(_) => tx.reply(None, Some(&anyhow!("send timed out")), be, &self.defense),
        }
    }

    async fn query_tcp(self: &Arc<Self>, be: &Backend, tx: Arc<Transaction>) {
        let mut stream = match timeout(ATTEMPT_TIMEOUT, TcpStream::connect(&be.addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                tx.reply(None, Some(&anyhow::Error::new(err)), be, &self.defense);
                return;
            }
            Err(_) => {
                tx.reply(None, Some(&anyhow!("connect timed out")), be, &self.defense);
                return;
            }
        };
        let buf = match tx.req.to_vec() {
            Ok(buf) => buf,
            Err(err) => {
                tx.reply(None, Some(&anyhow::Error::new(err)), be, &self.defense);
                return;
            }
        };
        self.register(format!("{}{}", be.url, tx.id()), tx.clone());

        let mut framed = Vec::with_capacity(2 + buf.len());
        framed.extend_from_slice(&(buf.len() as u16).to_be_bytes());
        framed.extend_from_slice(&buf);
        match timeout(ATTEMPT_TIMEOUT, stream.write_all(&framed)).await {
            Ok(Ok(())) => self.spawn_tcp_oneshot(stream, be.clone()),
            Ok(Err(err)) => tx.reply(None, Some(&anyhow::Error::new(err)), be, &self.defense),
            Err(_) => tx.reply(None, Some(&anyhow!("write timed out")), be, &self.defense),
        }
    }

    /// Reads exactly one response, dispatches it through the transaction
    /// table like the UDP path, and lets the connection drop.
    fn spawn_tcp_oneshot(self: &Arc<Self>, mut stream: TcpStream, be: Backend) {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            let msg = match timeout(TCP_READ_TIMEOUT, read_tcp_message(&mut stream)).await {
                Ok(Ok(msg)) => msg,
                Ok(Err(err)) => {
                    debug!(event = "tcp_read", backend = %be.url, error = %err, "tcp response read failed");
                    return;
                }
                Err(_) => {
                    debug!(event = "tcp_read", backend = %be.url, "tcp read deadline exceeded");
                    return;
                }
            };
            client.dispatch(msg, &be);
        });
    }

    fn dispatch(&self, msg: Message, be: &Backend) {
        let key = format!("{}{}", be.url, msg.id());
        let tx = self.transactions.get(&key).map(|t| Arc::clone(t.value()));
        match tx {
            Some(tx) => tx.reply(Some(msg), None, be, &self.defense),
            None => debug!(event = "orphan_reply", backend = %be.url, id = msg.id(), "response without transaction"),
        }
    }

    async fn get_connection(self: &Arc<Self>, be: &Backend) -> Result<Arc<UdpSocket>> {
        if let Some(conn) = self.conns.get(&be.url) {
            return Ok(Arc::clone(&conn));
        }
        self.create_connection(be, false).await
    }

    /// Dial a fresh connected socket and publish it. `force` replaces (and
    /// thereby closes) an existing socket; otherwise a socket raced in by
    /// another task wins and the fresh one is dropped.
    async fn create_connection(self: &Arc<Self>, be: &Backend, force: bool) -> Result<Arc<UdpSocket>> {
        let sock = UdpSocket::bind("0.0.0.0:0").await.context("bind local udp")?;
        sock.connect(&be.addr)
            .await
            .with_context(|| format!("connect {}", be.url))?;
        let sock = Arc::new(sock);

        use dashmap::mapref::entry::Entry;
        let (conn, fresh) = match self.conns.entry(be.url.clone()) {
            Entry::Occupied(mut entry) => {
                if force {
                    entry.insert(sock.clone());
                    (sock, true)
                } else {
                    (entry.get().clone(), false)
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(sock.clone());
                (sock, true)
            }
        };
        if fresh {
            self.spawn_reader(conn.clone(), be.clone());
        }
        Ok(conn)
    }

    /// Dedicated reader for one persistent UDP socket. Read errors close
    /// the socket and enter a reconnect loop that installs a replacement
    /// (with its own reader) before this task exits.
    fn spawn_reader(self: &Arc<Self>, conn: Arc<UdpSocket>, be: Backend) {
        let client = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            loop {
                let res = tokio::select! {
                    _ = shutdown.changed() => return,
                    res = conn.recv(&mut buf) => res,
                };
                match res {
                    Ok(len) => {
                        let Ok(msg) = Message::from_bytes(&buf[..len]) else {
                            continue;
                        };
                        client.dispatch(msg, &be);
                    }
                    Err(err) => {
                        if *shutdown.borrow() {
                            return;
                        }
                        warn!(event = "upstream_read", backend = %be.url, error = %err, "socket read failed, reconnecting");
                        break;
                    }
                }
            }
            drop(conn);
            tokio::time::sleep(RECONNECT_PAUSE).await;
            loop {
                if *shutdown.borrow() {
                    return;
                }
                match client.create_connection(&be, true).await {
                    // the replacement spawned its own reader
                    Ok(_) => return,
                    Err(err) => {
                        warn!(event = "upstream_reconnect", backend = %be.url, error = %err, "reconnect failed");
                        tokio::time::sleep(RECONNECT_BACKOFF).await;
                    }
                }
            }
        });
    }

    fn register(&self, key: String, tx: Arc<Transaction>) {
        // table insert and queue push stay under the queue lock so the
        // sweep sees them in age order
        let mut queue = match self.tx_queue.lock() {
            Ok(queue) => queue,
            Err(poisoned) => poisoned.into_inner(),
        };
        let created = tx.created;
        self.transactions.insert(key.clone(), tx);
        queue.push_back((key, created));
    }

    /// Drop transactions past the age ceiling. Cheap by design: it walks
    /// the FIFO from the front and stops at the first young entry.
    pub fn cleanup(&self) {
        self.cleanup_at(Instant::now());
    }

    fn cleanup_at(&self, now: Instant) {
        let mut queue = match self.tx_queue.lock() {
            Ok(queue) => queue,
            Err(poisoned) => poisoned.into_inner(),
        };
        loop {
            let expired = match queue.front() {
                Some((_, created)) => now.duration_since(*created) > TX_MAX_AGE,
                None => false,
            };
            if !expired {
                break;
            }
            if let Some((key, _)) = queue.pop_front() {
                self.transactions.remove(&key);
            }
        }
    }
}

async fn read_tcp_message(stream: &mut TcpStream) -> Result<Message> {
    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await?;
    let len = u16::from_be_bytes(len_buf) as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Message::from_bytes(&buf).map_err(Into::into)
}
