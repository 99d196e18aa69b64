use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, warn};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::client::{message_frame_bytes, next_request_id, ConnectOptions, FrameReader, RpcClient};
use crate::error::Error;
use crate::rpcmessage::RpcMessage;
use crate::value::{DateTime, RpcValue};

pub type SignalHandler = Box<dyn Fn(&str, &RpcValue) + Send>;

struct Shared {
    /// request id -> completion handle of the blocked caller
    pending: Mutex<HashMap<i64, oneshot::Sender<RpcMessage>>>,
    /// shv path prefix -> value change handler
    handlers: Mutex<HashMap<String, SignalHandler>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/** SHV RPC connection with call correlation and signal dispatch.

Owns the write half of the transport and a spawned receiver task owning the
read half. Dropping the connection aborts the receiver. */
pub struct ClientConnection {
    shared: Arc<Shared>,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    receiver: JoinHandle<()>,
}

impl ClientConnection {
    pub async fn connect(
        host: &str,
        port: u16,
        opts: &ConnectOptions,
    ) -> Result<ClientConnection, Error> {
        let client = RpcClient::connect(host, port, opts).await?;
        let (frames, writer) = client.into_parts();
        let shared = Arc::new(Shared {
            pending: Mutex::new(HashMap::new()),
            handlers: Mutex::new(HashMap::new()),
        });
        let receiver = tokio::spawn(receiver_task(frames, Arc::clone(&shared)));
        Ok(ClientConnection {
            shared,
            writer: tokio::sync::Mutex::new(writer),
            receiver,
        })
    }

    /** Cancels the receiver and wakes every pending caller with
    TransportClosed. */
    pub async fn disconnect(self) {
        self.receiver.abort();
        lock(&self.shared.pending).clear();
    }

    /** Sends a request and blocks the calling task until the matching
    response arrives. An Error payload in the response surfaces as
    Error::MethodCall to this caller only. */
    pub async fn call_shv_method_blocking(
        &self,
        shv_path: Option<&str>,
        method: &str,
        params: Option<RpcValue>,
    ) -> Result<RpcMessage, Error> {
        let request_id = next_request_id();
        let (tx, rx) = oneshot::channel();
        lock(&self.shared.pending).insert(request_id, tx);
        // the guard drops the table entry on every exit, cancellation included
        let _guard = PendingCall {
            shared: &self.shared,
            request_id,
        };

        let msg = RpcMessage::new_request(shv_path, method, params, request_id);
        {
            let data = message_frame_bytes(&msg)?;
            debug!("<== SND: {}", msg);
            let mut writer = self.writer.lock().await;
            writer.write_all(&data).await?;
            writer.flush().await?;
        }

        let resp = rx.await.map_err(|_| Error::TransportClosed)?;
        if let Some(err) = resp.error() {
            return Err(Error::MethodCall(err.clone()));
        }
        Ok(resp)
    }

    /** Registers a handler for `chng` signals under the given path prefix. */
    pub fn set_value_change_handler(
        &self,
        shv_path: impl Into<String>,
        handler: impl Fn(&str, &RpcValue) + Send + 'static,
    ) {
        lock(&self.shared.handlers).insert(shv_path.into(), Box::new(handler));
    }

    /** Asks the broker to deliver signals under shv_path. A falsy result
    drops the registered handler again and surfaces the rejection. */
    pub async fn subscribe_path(&self, shv_path: &str) -> Result<(), Error> {
        let resp = self
            .call_shv_method_blocking(
                Some(".broker/app"),
                "subscribe",
                Some(RpcValue::from(shv_path)),
            )
            .await?;
        let accepted = resp.result().map(RpcValue::is_truthy).unwrap_or(false);
        if !accepted {
            lock(&self.shared.handlers).remove(shv_path);
            warn!("subscription for {} rejected", shv_path);
            return Err(Error::MethodCall(
                resp.result().cloned().unwrap_or_default(),
            ));
        }
        Ok(())
    }

    /** Fetches the getLog snapshot under shv_home and replays every row to
    the registered handlers. */
    pub async fn get_snapshot_and_update(&self, shv_home: &str) -> Result<(), Error> {
        let mut params = BTreeMap::new();
        params.insert("recordCountLimit".to_owned(), RpcValue::from(10000i64));
        params.insert("withPathsDict".to_owned(), RpcValue::from(true));
        params.insert("withSnapshot".to_owned(), RpcValue::from(true));
        params.insert("withTypeInfo".to_owned(), RpcValue::from(false));
        params.insert("since".to_owned(), RpcValue::from(DateTime::now()));

        let resp = self
            .call_shv_method_blocking(Some(shv_home), "getLog", Some(RpcValue::from(params)))
            .await?;
        let result = match resp.result() {
            Some(result) => result,
            None => return Ok(()),
        };
        let paths_dict = result
            .meta
            .as_ref()
            .and_then(|m| m.get_str("pathsDict"))
            .and_then(|v| v.as_imap());
        let rows = result.as_list();
        let (paths_dict, rows) = match (paths_dict, rows) {
            (Some(paths_dict), Some(rows)) => (paths_dict, rows),
            _ => return Ok(()),
        };
        for row in rows {
            // row layout: [timestamp, pathIdx, value, ...]
            let cols = match row.as_list() {
                Some(cols) => cols,
                None => continue,
            };
            let idx = cols.get(1).and_then(RpcValue::as_int);
            let value = cols.get(2);
            if let (Some(idx), Some(value)) = (idx, value) {
                if let Some(path) = paths_dict.get(&idx).and_then(|p| p.as_str()) {
                    self.update_value_for_path(path, value);
                }
            }
        }
        Ok(())
    }

    /** Synchronous longest-prefix dispatch of one value update. */
    pub fn update_value_for_path(&self, path: &str, value: &RpcValue) {
        let handlers = lock(&self.shared.handlers);
        if let Some((_, handler)) = find_longest_prefix(&handlers, path) {
            invoke_handler(handler, path, value);
        }
    }
}

impl Drop for ClientConnection {
    fn drop(&mut self) {
        self.receiver.abort();
    }
}

/** Removes the pending table entry on every exit path of a blocking call. */
struct PendingCall<'a> {
    shared: &'a Shared,
    request_id: i64,
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        lock(&self.shared.pending).remove(&self.request_id);
    }
}

async fn receiver_task(mut frames: FrameReader, shared: Arc<Shared>) {
    loop {
        let msg = match frames.next_message().await {
            Ok(msg) => msg,
            Err(Error::MalformedInput(e)) => {
                warn!("skipping malformed frame: {}", e);
                continue;
            }
            Err(e) => {
                debug!("receiver stopped: {}", e);
                // dropping the senders wakes the blocked callers
                lock(&shared.pending).clear();
                return;
            }
        };
        debug!("==> REC: {}", msg);
        if msg.is_response() {
            let request_id = match msg.request_id() {
                Some(request_id) => request_id,
                None => continue,
            };
            if let Some(tx) = lock(&shared.pending).remove(&request_id) {
                let _ = tx.send(msg);
            }
        } else if msg.is_signal() {
            if msg.method() != Some("chng") {
                debug!(
                    "unhandled signal, path: {:?}, method: {:?}",
                    msg.shv_path(),
                    msg.method()
                );
                continue;
            }
            let path = msg.shv_path().unwrap_or("");
            let params = msg.params().cloned().unwrap_or_default();
            let handlers = lock(&shared.handlers);
            if let Some((prefix, handler)) = find_longest_prefix(&handlers, path) {
                debug!("chng dispatch for path {} via prefix {}", path, prefix);
                invoke_handler(handler, path, &params);
            }
        }
    }
}

/** A panicking handler must not take the receiver down with it. */
fn invoke_handler(handler: &SignalHandler, path: &str, value: &RpcValue) {
    if std::panic::catch_unwind(AssertUnwindSafe(|| handler(path, value))).is_err() {
        warn!("signal handler for {} panicked", path);
    }
}

/** Longest registered prefix of path at '/' segment boundaries, the full
path included. The empty key matches any path. */
fn find_longest_prefix<'a, V>(map: &'a HashMap<String, V>, path: &str) -> Option<(&'a str, &'a V)> {
    let mut key = path;
    loop {
        if let Some((k, v)) = map.get_key_value(key) {
            return Some((k.as_str(), v));
        }
        match key.rfind('/') {
            Some(ix) => key = &key[..ix],
            None if key.is_empty() => return None,
            None => key = "",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::net::TcpListener;

    use crate::value::Value;

    #[test]
    fn longest_prefix_picks_deepest_registered_path() {
        let mut map = HashMap::new();
        map.insert("a".to_owned(), 1);
        map.insert("a/b".to_owned(), 2);
        map.insert("a/b/c".to_owned(), 3);

        let hit = |path| find_longest_prefix(&map, path).map(|(k, v)| (k, *v));
        assert_eq!(hit("a/b/c/d"), Some(("a/b/c", 3)));
        assert_eq!(hit("a/b/c"), Some(("a/b/c", 3)));
        assert_eq!(hit("a/b/x"), Some(("a/b", 2)));
        assert_eq!(hit("a/bx"), Some(("a", 1)));
        assert_eq!(hit("a"), Some(("a", 1)));
        assert_eq!(hit("x/y"), None);

        map.insert(String::new(), 0);
        let hit = |path| find_longest_prefix(&map, path).map(|(k, v)| (k, *v));
        assert_eq!(hit("x/y"), Some(("", 0)));
    }

    async fn send(wr: &mut OwnedWriteHalf, msg: &RpcMessage) {
        wr.write_all(&message_frame_bytes(msg).unwrap())
            .await
            .unwrap();
        wr.flush().await.unwrap();
    }

    /// Accepts one client and answers the hello/login handshake.
    async fn accept_and_login(listener: TcpListener) -> (FrameReader, OwnedWriteHalf) {
        let (stream, _) = listener.accept().await.unwrap();
        let (rd, mut wr) = stream.into_split();
        let mut frames = FrameReader::new(rd);

        let hello = frames.next_message().await.unwrap();
        assert_eq!(hello.method(), Some("hello"));
        assert_eq!(hello.shv_path(), None);
        send(&mut wr, &hello.make_response().unwrap()).await;

        let login = frames.next_message().await.unwrap();
        assert_eq!(login.method(), Some("login"));
        let login_map = login
            .params()
            .and_then(RpcValue::as_map)
            .and_then(|p| p.get("login"))
            .and_then(RpcValue::as_map)
            .cloned()
            .unwrap();
        assert_eq!(login_map.get("user").and_then(|v| v.as_str()), Some("test"));
        assert_eq!(
            login_map.get("type").and_then(|v| v.as_str()),
            Some("PLAIN")
        );
        send(&mut wr, &login.make_response().unwrap()).await;

        (frames, wr)
    }

    fn test_options() -> ConnectOptions {
        let mut opts = ConnectOptions::new("test", "secret");
        opts.login_type = crate::client::LoginType::Plain;
        opts
    }

    #[tokio::test]
    async fn call_response_and_signal_dispatch() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let broker = tokio::spawn(async move {
            let (mut frames, mut wr) = accept_and_login(listener).await;

            let req = frames.next_message().await.unwrap();
            assert_eq!(req.method(), Some("stat"));
            assert_eq!(req.shv_path(), Some("test"));
            let mut resp = req.make_response().unwrap();
            resp.set_result(Some(RpcValue::from(42i64)));
            send(&mut wr, &resp).await;

            let mut sig = RpcMessage::new();
            sig.set_method(Some("chng"));
            sig.set_shv_path(Some("test/temp/a"));
            sig.set_params(Some(RpcValue::from(7i64)));
            send(&mut wr, &sig).await;

            // keep the socket open until the client saw the signal
            let _ = frames.next_message().await;
        });

        let conn = ClientConnection::connect("127.0.0.1", port, &test_options())
            .await
            .unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        conn.set_value_change_handler("test/temp", move |path, value| {
            let _ = tx.send((path.to_owned(), value.clone()));
        });

        let resp = tokio::time::timeout(
            Duration::from_secs(5),
            conn.call_shv_method_blocking(Some("test"), "stat", None),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(resp.result().and_then(|r| r.as_int()), Some(42));

        let (path, value) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(path, "test/temp/a");
        assert_eq!(value.as_int(), Some(7));

        conn.disconnect().await;
        broker.abort();
    }

    #[tokio::test]
    async fn method_call_error_surfaces_to_caller() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let broker = tokio::spawn(async move {
            let (mut frames, mut wr) = accept_and_login(listener).await;
            let req = frames.next_message().await.unwrap();
            let mut resp = req.make_response().unwrap();
            resp.set_error(Some(RpcValue::from("no such method")));
            send(&mut wr, &resp).await;
            let _ = frames.next_message().await;
        });

        let conn = ClientConnection::connect("127.0.0.1", port, &test_options())
            .await
            .unwrap();
        let res = tokio::time::timeout(
            Duration::from_secs(5),
            conn.call_shv_method_blocking(Some("x"), "nope", None),
        )
        .await
        .unwrap();
        match res {
            Err(Error::MethodCall(err)) => assert_eq!(err.as_str(), Some("no such method")),
            other => panic!("unexpected result: {:?}", other.map(|m| m.to_cpon_string())),
        }
        assert!(lock(&conn.shared.pending).is_empty());

        conn.disconnect().await;
        broker.abort();
    }

    #[tokio::test]
    async fn pending_caller_woken_when_transport_closes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let broker = tokio::spawn(async move {
            let (mut frames, wr) = accept_and_login(listener).await;
            // swallow the request, then hang up
            let _ = frames.next_message().await;
            drop(wr);
            drop(frames);
        });

        let conn = ClientConnection::connect("127.0.0.1", port, &test_options())
            .await
            .unwrap();
        let res = tokio::time::timeout(
            Duration::from_secs(5),
            conn.call_shv_method_blocking(Some("x"), "never-answered", None),
        )
        .await
        .unwrap();
        assert!(matches!(res, Err(Error::TransportClosed)));
        assert!(lock(&conn.shared.pending).is_empty());

        conn.disconnect().await;
        broker.abort();
    }

    #[tokio::test]
    async fn snapshot_rows_replay_to_handlers() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let broker = tokio::spawn(async move {
            let (mut frames, mut wr) = accept_and_login(listener).await;

            let req = frames.next_message().await.unwrap();
            assert_eq!(req.method(), Some("getLog"));
            let params = req.params().and_then(RpcValue::as_map).cloned().unwrap();
            assert_eq!(
                params.get("recordCountLimit").and_then(|v| v.as_int()),
                Some(10000)
            );
            assert_eq!(
                params.get("withSnapshot").and_then(|v| v.as_bool()),
                Some(true)
            );

            // result: <pathsDict: i{1: "test/temp/a"}>[[ts, 1, 20]]
            let result = RpcValue::from_cpon(
                "<\"pathsDict\":i{1:\"test/temp/a\"}>[[d\"2018-02-02T00:00:00Z\",1,20]]",
            )
            .unwrap();
            let mut resp = req.make_response().unwrap();
            resp.set_result(Some(result));
            send(&mut wr, &resp).await;
            let _ = frames.next_message().await;
        });

        let conn = ClientConnection::connect("127.0.0.1", port, &test_options())
            .await
            .unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        conn.set_value_change_handler("test/temp", move |path, value| {
            let _ = tx.send((path.to_owned(), value.clone()));
        });

        tokio::time::timeout(
            Duration::from_secs(5),
            conn.get_snapshot_and_update("test"),
        )
        .await
        .unwrap()
        .unwrap();

        let (path, value) = rx.try_recv().unwrap();
        assert_eq!(path, "test/temp/a");
        assert_eq!(value.value, Value::Int(20));

        conn.disconnect().await;
        broker.abort();
    }
}
