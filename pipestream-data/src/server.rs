//! Peer data server
//!
//! Serves cached task results to sibling nodes over length-delimited TCP
//! frames. Each request frame gets exactly one reply frame.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use pipestream_core::config::DataServerConfig;
use pipestream_core::encoding::encoding_for;
use pipestream_core::path::Lookup;
use pipestream_core::{Encoding, Path};

use crate::cache::DataCache;
use crate::error::Result;
use crate::protocol::{DataQuery, DataReply, ErrorCode, ItemReply};

/// Largest request or reply accepted (64 MiB)
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

pub(crate) fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_SIZE)
        .new_codec()
}

struct Shared {
    cache: Mutex<DataCache>,
    encoding: Arc<dyn Encoding>,
    serving: AtomicUsize,
}

impl Shared {
    fn reply_to(&self, query: &DataQuery) -> DataReply {
        let path = match query.data_path.as_deref().map(str::parse::<Path>).transpose() {
            Ok(path) => path,
            Err(e) => return DataReply::Item(ItemReply::error(ErrorCode::Unknown, e.to_string())),
        };
        let cache = self.cache.lock();
        let item = |task_id: &str| -> ItemReply {
            let Some(value) = cache.get(task_id) else {
                return ItemReply::error(ErrorCode::NotAvailable, "taskId notAvailable");
            };
            match &path {
                None => ItemReply::Data(value.clone()),
                Some(path) => match path.lookup(value) {
                    Lookup::Found(found) => ItemReply::Data(found.clone()),
                    Lookup::NotFound => ItemReply::error(
                        ErrorCode::NoSuchDataPath,
                        format!("{path} does not exist in data"),
                    ),
                },
            }
        };

        match (&query.task_id, &query.tasks) {
            (Some(task_id), _) => DataReply::Item(item(task_id)),
            (None, tasks) => DataReply::batch(
                tasks
                    .iter()
                    .flatten()
                    .map(|task_id| item(task_id))
                    .collect(),
            ),
        }
    }

    fn handle_request(&self, request: &[u8]) -> Result<Bytes> {
        let reply = match self
            .encoding
            .decode(request)
            .and_then(|value| serde_json::from_value::<DataQuery>(value).map_err(Into::into))
        {
            Ok(query) => self.reply_to(&query),
            Err(e) => DataReply::Item(ItemReply::error(ErrorCode::Unknown, e.to_string())),
        };
        Ok(self.encoding.encode(&serde_json::to_value(&reply)?)?)
    }
}

/// Decrements the in-progress counter when a reply is done
struct ServingGuard<'a>(&'a AtomicUsize);

impl<'a> ServingGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ServingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct DataServer {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    cancel: CancellationToken,
    tracker: TaskTracker,
    closed: AtomicBool,
}

impl DataServer {
    /// Bind the configured address and start answering requests
    pub async fn listen(config: &DataServerConfig) -> Result<Self> {
        let encoding = encoding_for(&config.encoding)?;
        let listener = TcpListener::bind(config.bind_address()).await?;
        let local_addr = listener.local_addr()?;

        let shared = Arc::new(Shared {
            cache: Mutex::new(DataCache::new(config.max_cache_size)),
            encoding,
            serving: AtomicUsize::new(0),
        });
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        tracker.spawn(accept_loop(
            listener,
            Arc::clone(&shared),
            cancel.clone(),
            tracker.clone(),
        ));

        info!(
            address = %local_addr,
            encoding = %config.encoding,
            max_cache_size = config.max_cache_size,
            "Data server listening"
        );
        Ok(Self {
            shared,
            local_addr,
            cancel,
            tracker,
            closed: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Publish the result of `task_id` to peers
    pub fn set_sending_state(&self, task_id: impl Into<String>, value: Value) {
        self.shared.cache.lock().update(task_id, value);
    }

    /// Build the reply for `query` from the current cache
    #[must_use]
    pub fn create_reply(&self, query: &DataQuery) -> DataReply {
        self.shared.reply_to(query)
    }

    /// Whether a reply is being built or written right now
    #[must_use]
    pub fn is_serving(&self) -> bool {
        self.shared.serving.load(Ordering::SeqCst) > 0
    }

    pub async fn wait_till_serving_is_done(&self) {
        while self.is_serving() {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!(address = %self.local_addr, "Data server closed");
    }
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    tracker: TaskTracker,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    tracker.spawn(serve_connection(stream, remote, Arc::clone(&shared), cancel.clone()));
                }
                Err(e) => warn!(error = %e, "Failed to accept data connection"),
            },
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    remote: SocketAddr,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) {
    let mut conn = Framed::new(stream, codec());
    loop {
        let next = tokio::select! {
            () = cancel.cancelled() => break,
            next = conn.next() => next,
        };
        let request = match next {
            Some(Ok(request)) => request,
            Some(Err(e)) => {
                debug!(remote = %remote, error = %e, "Data connection read failed");
                break;
            }
            None => break,
        };

        let _serving = ServingGuard::new(&shared.serving);
        let reply = match shared.handle_request(&request) {
            Ok(reply) => reply,
            Err(e) => {
                warn!(remote = %remote, error = %e, "Failed to encode data reply");
                break;
            }
        };
        if let Err(e) = conn.send(reply).await {
            debug!(remote = %remote, error = %e, "Data connection write failed");
            break;
        }
    }
}
