//! Named host callbacks invokable from script.
//!
//! Script calls `sendMessage(name, arg)` (or the proxy `hostChannels[name]`)
//! which JSON-encodes `arg` and hands `(instance id, name, json)` to the
//! native trampoline. The trampoline resolves the instance through the live
//! registry, runs the callback and answers with a JSON envelope:
//!
//! - `{"status":"ready","result":"<json>"|null}`: the callback finished on its
//!   first poll; script receives the decoded value synchronously.
//! - `{"status":"pending","callId":n}`: the callback is still running; the
//!   future is parked on the instance and script receives a Promise that is
//!   settled by a later `ChannelComplete` macrotask.
//! - `{"status":"error","message":"..."}`: routing or the callback failed;
//!   script throws.

use crate::error::{Error, Result};
use crate::instances::{self, InstanceId, InstanceState};
use crate::scheduler::ChannelOutcome;
use futures::future::BoxFuture;
use futures::task::noop_waker_ref;
use futures::{FutureExt, future};
use serde_json::json;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::task::{Context, Poll};

/// Result of a channel callback: a JSON-encoded value, or `None` when the
/// callback has nothing to return.
pub type ChannelReply = Result<Option<String>>;

/// Host-side callback behind a channel. Receives the JSON-encoded argument,
/// or `None` when script passed nothing.
pub type ChannelCallback = Arc<dyn Fn(Option<String>) -> BoxFuture<'static, ChannelReply> + Send + Sync>;

/// Wrap an async closure as a [`ChannelCallback`].
pub fn channel_fn<F, Fut>(callback: F) -> ChannelCallback
where
    F: Fn(Option<String>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ChannelReply> + Send + 'static,
{
    Arc::new(move |argument| callback(argument).boxed())
}

/// Wrap a synchronous closure as a [`ChannelCallback`].
pub fn sync_channel_fn<F>(callback: F) -> ChannelCallback
where
    F: Fn(Option<String>) -> ChannelReply + Send + Sync + 'static,
{
    Arc::new(move |argument| future::ready(callback(argument)).boxed())
}

/// Per-instance channel table. Append-only: names are never replaced.
#[derive(Default)]
pub struct ChannelRegistry {
    channels: BTreeMap<String, ChannelCallback>,
}

impl ChannelRegistry {
    /// Install `callback` under `name`. Returns false, leaving the existing
    /// callback in place, when the name is taken.
    pub fn register(&mut self, name: &str, callback: ChannelCallback) -> bool {
        if self.channels.contains_key(name) {
            return false;
        }
        self.channels.insert(name.to_string(), callback);
        true
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<ChannelCallback> {
        self.channels.get(name).cloned()
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.channels.contains_key(name)
    }

    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.channels.keys().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn clear(&mut self) {
        self.channels.clear();
    }
}

impl fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelRegistry")
            .field("channels", &self.channels.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Install `callback` on the instance. Returns false when `name` is taken.
pub fn register(state: &InstanceState, name: &str, callback: ChannelCallback) -> bool {
    let installed = state.channels().register(name, callback);
    tracing::debug!(
        event = "channel.register",
        instance = %state.id(),
        channel = name,
        installed,
        "Channel registration"
    );
    installed
}

/// A channel callback that did not finish on its first poll.
pub struct ParkedCall {
    pub call_id: u64,
    pub channel: String,
    future: BoxFuture<'static, ChannelReply>,
}

impl ParkedCall {
    fn poll_reply(&mut self, cx: &mut Context<'_>) -> Poll<ChannelOutcome> {
        self.future
            .poll_unpin(cx)
            .map(|reply| outcome_from_reply(&self.channel, reply))
    }
}

impl fmt::Debug for ParkedCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParkedCall")
            .field("call_id", &self.call_id)
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

/// Check that a callback reply is well-formed JSON before it reaches script.
fn validate_reply(channel: &str, reply: ChannelReply) -> ChannelReply {
    match reply? {
        Some(json) => {
            serde_json::from_str::<serde_json::Value>(&json).map_err(|err| {
                Error::channel_dispatch(format!(
                    "channel `{channel}` returned invalid JSON: {err}"
                ))
            })?;
            Ok(Some(json))
        }
        None => Ok(None),
    }
}

fn outcome_from_reply(channel: &str, reply: ChannelReply) -> ChannelOutcome {
    match validate_reply(channel, reply) {
        Ok(result) => ChannelOutcome::Success(result),
        Err(err) => ChannelOutcome::Error {
            message: err.to_string(),
        },
    }
}

fn resolve_channel(id: InstanceId, channel: &str) -> Result<(Arc<InstanceState>, ChannelCallback)> {
    let state = instances::lookup(id)
        .ok_or_else(|| Error::channel_dispatch(format!("no live engine instance {id}")))?;
    let callback = state.channel(channel).ok_or_else(|| {
        Error::channel_dispatch(format!("no channel registered under `{channel}` on {id}"))
    })?;
    Ok((state, callback))
}

/// Host-side dispatch of a channel message to the instance `id`.
///
/// Routing failures are reported before any callback runs, so a caller
/// waiting on an instance that no longer exists never hangs.
pub async fn dispatch(id: InstanceId, channel: &str, argument: Option<String>) -> ChannelReply {
    let (_, callback) = resolve_channel(id, channel)?;
    tracing::debug!(
        event = "channel.dispatch",
        instance = %id,
        channel,
        origin = "host",
        "Dispatching channel message"
    );
    validate_reply(channel, callback(argument).await)
}

/// Entry point for the native trampolines. Never fails; failures are encoded
/// in the returned envelope so the script side can throw.
#[must_use]
pub fn dispatch_from_script(id: InstanceId, channel: &str, argument: Option<String>) -> String {
    let (state, callback) = match resolve_channel(id, channel) {
        Ok(found) => found,
        Err(err) => {
            tracing::warn!(
                event = "channel.dispatch.unroutable",
                instance = %id,
                channel,
                error = %err,
                "Channel message could not be routed"
            );
            return error_envelope(&err.to_string());
        }
    };

    let mut future = callback(argument);
    let mut cx = Context::from_waker(noop_waker_ref());
    match future.poll_unpin(&mut cx) {
        Poll::Ready(reply) => match validate_reply(channel, reply) {
            Ok(result) => {
                tracing::debug!(
                    event = "channel.dispatch",
                    instance = %id,
                    channel,
                    origin = "script",
                    settled = true,
                    "Channel call completed synchronously"
                );
                json!({ "status": "ready", "result": result }).to_string()
            }
            Err(err) => error_envelope(&err.to_string()),
        },
        Poll::Pending => {
            let call_id = state.next_call_id();
            state.parked().push(ParkedCall {
                call_id,
                channel: channel.to_string(),
                future,
            });
            tracing::debug!(
                event = "channel.dispatch",
                instance = %id,
                channel,
                origin = "script",
                settled = false,
                call_id,
                "Channel call parked"
            );
            json!({ "status": "pending", "callId": call_id }).to_string()
        }
    }
}

fn error_envelope(message: &str) -> String {
    json!({ "status": "error", "message": message }).to_string()
}

/// Poll every parked call once with `cx` and move finished ones into the
/// scheduler as `ChannelComplete` macrotasks. Returns how many finished.
pub fn poll_parked(state: &InstanceState, cx: &mut Context<'_>) -> usize {
    let finished: Vec<(u64, ChannelOutcome)> = {
        let mut parked = state.parked();
        let mut finished = Vec::new();
        parked.retain_mut(|call| match call.poll_reply(cx) {
            Poll::Ready(outcome) => {
                finished.push((call.call_id, outcome));
                false
            }
            Poll::Pending => true,
        });
        finished
    };

    let count = finished.len();
    if count > 0 {
        let mut scheduler = state.scheduler();
        for (call_id, outcome) in finished {
            scheduler.enqueue_channel_complete(call_id, outcome);
        }
    }
    count
}

/// Poll parked calls without registering interest in wake-ups.
pub fn poll_parked_now(state: &InstanceState) -> usize {
    poll_parked(state, &mut Context::from_waker(noop_waker_ref()))
}

/// Wait until at least one parked call finishes. Resolves immediately with 0
/// when nothing is parked.
pub async fn next_parked_completion(state: &InstanceState) -> usize {
    future::poll_fn(|cx| {
        if state.parked().is_empty() {
            return Poll::Ready(0);
        }
        match poll_parked(state, cx) {
            0 => Poll::Pending,
            finished => Poll::Ready(finished),
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::EngineKind;
    use crate::scheduler::{DeterministicClock, MacrotaskKind};
    use futures::channel::oneshot;
    use futures::executor::block_on;
    use serde_json::Value;
    use std::sync::Mutex;

    fn live_state() -> Arc<InstanceState> {
        let state = InstanceState::new(EngineKind::QuickJs, Arc::new(DeterministicClock::new(0)));
        instances::register(&state);
        state
    }

    fn envelope(raw: &str) -> Value {
        serde_json::from_str(raw).expect("envelope is JSON")
    }

    #[test]
    fn registry_rejects_duplicate_names() {
        let mut registry = ChannelRegistry::default();
        let first = sync_channel_fn(|_| Ok(Some("1".to_string())));
        let second = sync_channel_fn(|_| Ok(Some("2".to_string())));

        assert!(registry.register("c", first));
        assert!(!registry.register("c", second));
        assert_eq!(registry.len(), 1);

        let kept = registry.get("c").unwrap();
        assert_eq!(block_on(kept(None)).unwrap(), Some("1".to_string()));
    }

    #[test]
    fn ready_callback_answers_synchronously() {
        let state = live_state();
        state.channels().register(
            "echo",
            sync_channel_fn(|arg| Ok(arg.or_else(|| Some("null".to_string())))),
        );

        let reply = envelope(&dispatch_from_script(state.id(), "echo", Some("{\"a\":1}".to_string())));
        assert_eq!(reply["status"], "ready");
        assert_eq!(reply["result"], "{\"a\":1}");

        instances::deregister(state.id());
    }

    #[test]
    fn pending_callback_is_parked_then_completed() {
        let state = live_state();
        let (tx, rx) = oneshot::channel::<String>();
        let rx = Mutex::new(Some(rx));
        state.channels().register(
            "slow",
            channel_fn(move |_| {
                let rx = rx.lock().unwrap().take();
                async move {
                    let value = rx
                        .expect("called once")
                        .await
                        .map_err(|_| Error::channel_dispatch("dropped"))?;
                    Ok::<_, Error>(Some(value))
                }
            }),
        );

        let reply = envelope(&dispatch_from_script(state.id(), "slow", None));
        assert_eq!(reply["status"], "pending");
        let call_id = reply["callId"].as_u64().unwrap();
        assert_eq!(state.parked().len(), 1);

        assert_eq!(poll_parked_now(&state), 0);
        tx.send("42".to_string()).unwrap();
        assert_eq!(block_on(next_parked_completion(&state)), 1);
        assert!(state.parked().is_empty());

        let task = state.scheduler().tick().expect("completion queued");
        match task.kind {
            MacrotaskKind::ChannelComplete { call_id: id, outcome } => {
                assert_eq!(id, call_id);
                assert_eq!(outcome, ChannelOutcome::Success(Some("42".to_string())));
            }
            other => unreachable!("unexpected task {other:?}"),
        }

        instances::deregister(state.id());
    }

    #[test]
    fn unknown_instance_fails_fast() {
        let missing = InstanceId::from_raw(u64::MAX);
        let reply = envelope(&dispatch_from_script(missing, "c", None));
        assert_eq!(reply["status"], "error");

        let err = block_on(dispatch(missing, "c", None)).unwrap_err();
        assert!(matches!(err, Error::ChannelDispatch(_)));
    }

    #[test]
    fn unknown_channel_fails_fast() {
        let state = live_state();
        let err = block_on(dispatch(state.id(), "absent", None)).unwrap_err();
        assert!(err.to_string().contains("no channel registered under `absent`"));
        instances::deregister(state.id());
    }

    #[test]
    fn invalid_json_reply_is_a_dispatch_failure() {
        let state = live_state();
        state
            .channels()
            .register("bad", sync_channel_fn(|_| Ok(Some("{not json".to_string()))));

        let reply = envelope(&dispatch_from_script(state.id(), "bad", None));
        assert_eq!(reply["status"], "error");
        assert!(reply["message"].as_str().unwrap().contains("invalid JSON"));

        instances::deregister(state.id());
    }

    #[test]
    fn host_dispatch_runs_callback() {
        let state = live_state();
        state.channels().register(
            "double",
            channel_fn(|arg| async move {
                let n: i64 = serde_json::from_str(arg.as_deref().unwrap_or("0"))?;
                Ok::<_, Error>(Some((n * 2).to_string()))
            }),
        );

        let reply = block_on(dispatch(state.id(), "double", Some("21".to_string()))).unwrap();
        assert_eq!(reply, Some("42".to_string()));

        instances::deregister(state.id());
    }

    #[test]
    fn next_parked_completion_is_immediate_when_idle() {
        let state = live_state();
        assert_eq!(block_on(next_parked_completion(&state)), 0);
        instances::deregister(state.id());
    }
}
