//! High-level client API.

use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::error::{DispatchError, FatalError};
use crate::reconnect;
use crate::transport::TcpTransport;
use crate::wait::{CallResult, Delivery, WaitRegistry};
use bytes::Bytes;
use linkrpc_protocol::{Control, Frame, Request};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Request/response client over a [`Dispatcher`].
///
/// Installs itself as the dispatcher's frame handler: inbound Response frames
/// resolve pending calls by request ID. Calls in flight on a connection that
/// terminates fail with [`DispatchError::ConnectionClosed`].
pub struct Client {
    dispatcher: Dispatcher,
    waits: WaitRegistry,
    call_timeout: Option<Duration>,
}

impl Client {
    /// Creates a client on top of `dispatcher`. Calls wait without a deadline
    /// until one is set with [`with_call_timeout`](Self::with_call_timeout).
    pub fn new(dispatcher: Dispatcher) -> Self {
        let waits = WaitRegistry::new();

        let registry = waits.clone();
        let weak = dispatcher.downgrade();
        dispatcher.handle_frame(move |connection_id, frame| {
            let violation = match frame {
                Frame::Response(resp) => {
                    let result = CallResult {
                        result: resp.result,
                        err: resp.err,
                    };
                    match registry.callback(&resp.request_id, result) {
                        Ok(Delivery::Delivered) => return,
                        Ok(Delivery::Abandoned) => {
                            tracing::warn!(
                                "[{}] dropping late response for abandoned request {}",
                                connection_id,
                                resp.request_id
                            );
                            return;
                        }
                        Err(e) => e,
                    }
                }
                other => DispatchError::UnexpectedFrame {
                    expected: "RESPONSE",
                    got: frame_name(&other),
                },
            };

            tracing::error!("[{}] {}", connection_id, violation);
            if let Some(dp) = weak.upgrade() {
                dp.report_fatal(FatalError::ProtocolViolation(violation.to_string()));
            }
        });

        let registry = waits.clone();
        dispatcher.on_close(move |connection_id, _| {
            registry.fail_connection(connection_id);
        });

        Self {
            dispatcher,
            waits,
            call_timeout: None,
        }
    }

    pub fn with_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Dials the configured peer over TCP with the configured reconnect policy.
    pub async fn connect(config: &Config) -> Result<Self, DispatchError> {
        let transport = TcpTransport::new(config.link.connect_timeout());
        let dispatcher = Dispatcher::new(Arc::new(transport));
        reconnect::install(&dispatcher, config.dispatch.reconnect_policy());

        let client = Self::new(dispatcher).with_call_timeout(config.dispatch.call_timeout());
        client.dispatcher.link(&config.link.addr).await?;
        Ok(client)
    }

    /// Calls `target` with raw `args` and returns the raw result.
    ///
    /// A remote error is returned as [`DispatchError::Remote`].
    pub async fn call(&self, target: &str, args: impl Into<Bytes>) -> Result<Bytes, DispatchError> {
        let pending = self.waits.register()?;
        let connection_id = self
            .dispatcher
            .connection_id()
            .ok_or(DispatchError::NotLinked)?;
        pending.bind(&connection_id);

        let request = Request::new(pending.id(), target).with_args(args);
        tracing::debug!(
            "calling {} as request {} on [{}]",
            target,
            pending.id(),
            connection_id
        );

        match self
            .dispatcher
            .send_to(&connection_id, &Frame::Request(request))
            .await
        {
            Ok(()) => {}
            // The link was replaced after the ID was read.
            Err(DispatchError::Addressing { .. }) => return Err(DispatchError::ConnectionClosed),
            Err(e) => return Err(e),
        }
        pending.wait(self.call_timeout).await?.into_result()
    }

    /// Calls `target` with JSON-encoded `args` and decodes the JSON result.
    pub async fn call_json<A, R>(&self, target: &str, args: &A) -> Result<R, DispatchError>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let args = serde_json::to_vec(args)?;
        let result = self.call(target, args).await?;
        Ok(serde_json::from_slice(&result)?)
    }

    /// Sends a control frame; no reply is expected.
    pub async fn send_ctrl(&self, code: i32, data: impl Into<Bytes>) -> Result<(), DispatchError> {
        self.dispatcher
            .send(&Frame::Control(Control::new(code, data)))
            .await
    }

    /// Closes the link and fails every outstanding call with
    /// [`DispatchError::ConnectionClosed`].
    pub async fn close(&self) {
        self.dispatcher.close().await;
        self.waits.close();
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn pending_count(&self) -> usize {
        self.waits.pending_count()
    }
}

fn frame_name(frame: &Frame) -> &'static str {
    match frame {
        Frame::Request(_) => "REQUEST",
        Frame::Response(_) => "RESPONSE",
        Frame::Control(_) => "CONTROL",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{eventually, next_peer, MockPeer, MockTransport};
    use linkrpc_protocol::{Decoder, Encoder, Response};
    use parking_lot::Mutex;
    use serde_json::{json, Value};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    struct Harness {
        client: Arc<Client>,
        peer: MockPeer,
        fatals: Arc<Mutex<Vec<FatalError>>>,
    }

    async fn harness() -> Harness {
        let (transport, mut peers) = MockTransport::new();
        let dispatcher = Dispatcher::new(transport);
        let fatals: Arc<Mutex<Vec<FatalError>>> = Arc::default();
        let sink = fatals.clone();
        dispatcher.on_fatal(move |err| sink.lock().push(err));

        let client = Arc::new(Client::new(dispatcher));
        client.dispatcher().link("peer:1").await.unwrap();
        let peer = next_peer(&mut peers).await;
        Harness {
            client,
            peer,
            fatals,
        }
    }

    async fn next_request(peer: &mut MockPeer) -> Request {
        match peer.next_frame().await {
            Frame::Request(req) => req,
            other => panic!("expected request, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_call_returns_result() {
        let mut h = harness().await;
        let client = h.client.clone();
        let call = tokio::spawn(async move { client.call("svc.echo", &b"hello"[..]).await });

        let req = next_request(&mut h.peer).await;
        assert_eq!(req.target, "svc.echo");
        assert_eq!(req.args, Bytes::from_static(b"hello"));
        h.peer.send(Response::ok(req.request_id, req.args));

        assert_eq!(call.await.unwrap().unwrap(), Bytes::from_static(b"hello"));
        assert_eq!(h.client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_remote_error_is_returned_to_caller() {
        let mut h = harness().await;
        let client = h.client.clone();
        let call = tokio::spawn(async move { client.call("svc.fail", Bytes::new()).await });

        let req = next_request(&mut h.peer).await;
        h.peer.send(Response::error(req.request_id, "bad args"));

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, DispatchError::Remote(ref m) if m == "bad args"));
        assert!(h.fatals.lock().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_calls_answered_out_of_order() {
        let mut h = harness().await;
        let mut calls = Vec::new();
        for i in 0..3 {
            let client = h.client.clone();
            calls.push(tokio::spawn(async move {
                client.call("svc.id", format!("arg-{}", i)).await
            }));
        }

        let mut requests = Vec::new();
        for _ in 0..3 {
            requests.push(next_request(&mut h.peer).await);
        }
        for req in requests.into_iter().rev() {
            h.peer.send(Response::ok(req.request_id, req.args));
        }

        for (i, call) in calls.into_iter().enumerate() {
            assert_eq!(
                call.await.unwrap().unwrap(),
                Bytes::from(format!("arg-{}", i))
            );
        }
    }

    #[tokio::test]
    async fn test_call_json() {
        let mut h = harness().await;
        let client = h.client.clone();
        let call = tokio::spawn(async move {
            client
                .call_json::<_, Value>("svc.sum", &json!({"a": 1, "b": 2}))
                .await
        });

        let req = next_request(&mut h.peer).await;
        let args: Value = serde_json::from_slice(&req.args).unwrap();
        let sum = args["a"].as_i64().unwrap() + args["b"].as_i64().unwrap();
        h.peer.send(Response::ok(
            req.request_id,
            serde_json::to_vec(&json!({ "sum": sum })).unwrap(),
        ));

        assert_eq!(call.await.unwrap().unwrap(), json!({"sum": 3}));
    }

    #[tokio::test]
    async fn test_late_response_after_timeout_is_dropped() {
        let mut h = harness().await;
        let client = Client {
            dispatcher: h.client.dispatcher().clone(),
            waits: h.client.waits.clone(),
            call_timeout: Some(Duration::from_millis(20)),
        };

        let result = client.call("svc.slow", Bytes::new()).await;
        assert!(matches!(result, Err(DispatchError::Timeout)));
        assert_eq!(client.pending_count(), 0);

        let req = next_request(&mut h.peer).await;
        h.peer.send(Response::ok(req.request_id, Bytes::new()));

        // The link keeps working and nothing is escalated.
        let caller = h.client.clone();
        let next = tokio::spawn(async move { caller.call("svc.fast", &b"ok"[..]).await });
        let req = next_request(&mut h.peer).await;
        h.peer.send(Response::ok(req.request_id, req.args));
        assert_eq!(next.await.unwrap().unwrap(), Bytes::from_static(b"ok"));
        assert!(h.fatals.lock().is_empty());
    }

    #[tokio::test]
    async fn test_response_for_unknown_request_is_protocol_violation() {
        let h = harness().await;
        h.peer.send(Response::ok("never-issued", Bytes::new()));

        eventually(|| !h.fatals.lock().is_empty()).await;
        assert!(matches!(
            h.fatals.lock()[0],
            FatalError::ProtocolViolation(_)
        ));
    }

    #[tokio::test]
    async fn test_connection_loss_fails_in_flight_calls() {
        let (transport, mut peers) = MockTransport::new();
        let dispatcher = Dispatcher::new(transport);
        let fatals: Arc<Mutex<Vec<FatalError>>> = Arc::default();
        let sink = fatals.clone();
        dispatcher.on_fatal(move |err| sink.lock().push(err));
        reconnect::install(
            &dispatcher,
            crate::ReconnectPolicy::Unbounded {
                interval: Duration::from_millis(10),
            },
        );

        let client = Arc::new(Client::new(dispatcher));
        client.dispatcher().link("peer:1").await.unwrap();
        let mut peer = next_peer(&mut peers).await;

        let caller = client.clone();
        let call = tokio::spawn(async move { caller.call("svc.never", Bytes::new()).await });
        let _req = next_request(&mut peer).await;
        drop(peer);

        let result = tokio::time::timeout(Duration::from_secs(2), call)
            .await
            .expect("call was not released")
            .unwrap();
        assert!(matches!(result, Err(DispatchError::ConnectionClosed)));
        assert_eq!(client.pending_count(), 0);

        // New calls go out on the relinked connection.
        let mut peer = next_peer(&mut peers).await;
        eventually(|| client.dispatcher().is_linked()).await;
        let caller = client.clone();
        let call = tokio::spawn(async move { caller.call("svc.echo", &b"again"[..]).await });
        let req = next_request(&mut peer).await;
        peer.send(Response::ok(req.request_id, req.args));
        assert_eq!(call.await.unwrap().unwrap(), Bytes::from_static(b"again"));
        assert!(fatals.lock().is_empty());
    }

    #[tokio::test]
    async fn test_call_without_link_fails_and_forgets() {
        let (transport, _peers) = MockTransport::new();
        let client = Client::new(Dispatcher::new(transport));

        let result = client.call("svc.m", Bytes::new()).await;
        assert!(matches!(result, Err(DispatchError::NotLinked)));
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_close_releases_pending_calls() {
        let mut h = harness().await;
        let client = h.client.clone();
        let call = tokio::spawn(async move { client.call("svc.never", Bytes::new()).await });
        let _req = next_request(&mut h.peer).await;

        h.client.close().await;
        assert!(matches!(
            call.await.unwrap(),
            Err(DispatchError::ConnectionClosed)
        ));
        assert!(matches!(
            h.client.call("svc.m", Bytes::new()).await,
            Err(DispatchError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_inbound_request_is_protocol_violation() {
        let h = harness().await;
        h.peer.send(Request::new("r-9", "svc.reverse"));

        eventually(|| !h.fatals.lock().is_empty()).await;
        let fatal = h.fatals.lock()[0].clone();
        assert!(matches!(fatal, FatalError::ProtocolViolation(_)));
        assert!(fatal.to_string().contains("REQUEST"));
    }

    #[tokio::test]
    async fn test_send_ctrl() {
        let mut h = harness().await;
        h.client.send_ctrl(12, &b"ping"[..]).await.unwrap();
        assert_eq!(
            h.peer.next_frame().await,
            Frame::Control(Control::new(12, &b"ping"[..]))
        );
    }

    #[tokio::test]
    async fn test_tcp_end_to_end() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        // Echo peer: answers every request with its own args.
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut decoder = Decoder::new();
            let mut buf = vec![0u8; 4096];
            loop {
                while let Some(frame) = decoder.decode_frame().unwrap() {
                    if let Frame::Request(req) = frame {
                        let reply = Frame::from(Response::ok(req.request_id, req.args));
                        let bytes = Encoder::encode_frame(&reply).unwrap();
                        stream.write_all(&bytes).await.unwrap();
                    }
                }
                let n = stream.read(&mut buf).await.unwrap();
                if n == 0 {
                    return;
                }
                decoder.extend(&buf[..n]);
            }
        });

        let mut config = Config::default();
        config.link.addr = addr;
        config.dispatch.auto_reconnect = false;
        config.dispatch.call_timeout_secs = 5;

        let client = Client::connect(&config).await.unwrap();
        let fatals: Arc<Mutex<Vec<FatalError>>> = Arc::default();
        let sink = fatals.clone();
        client.dispatcher().on_fatal(move |err| sink.lock().push(err));

        let result = client.call("svc.echo", &b"over tcp"[..]).await.unwrap();
        assert_eq!(result, Bytes::from_static(b"over tcp"));

        client.close().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(fatals.lock().is_empty());
        assert!(!client.dispatcher().is_linked());
    }
}
