//! Host callbacks reached from script through `sendMessage` and
//! `hostChannels`.

mod common;

use common::{engine_kinds, eval, on_each_engine, runtime_on};
use futures::executor::block_on;
use jsbridge::channels;
use jsbridge::{Error, ScriptValue, channel_fn, sync_channel_fn};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

fn parse(argument: Option<&String>) -> Value {
    argument.map_or(Value::Null, |raw| serde_json::from_str(raw).unwrap())
}

#[test]
fn sync_callback_answers_inline() {
    on_each_engine(|runtime| {
        let registered = runtime.register_channel(
            "add",
            sync_channel_fn(|argument| {
                let value = parse(argument.as_ref());
                let sum = value["a"].as_i64().unwrap_or(0) + value["b"].as_i64().unwrap_or(0);
                Ok(Some(sum.to_string()))
            }),
        );
        assert!(registered);
        assert_eq!(eval(runtime, "sendMessage('add', { a: 2, b: 40 })"), ScriptValue::Int(42));
        assert_eq!(eval(runtime, "hostChannels.add({ a: 1, b: 1 })"), ScriptValue::Int(2));
    });
}

#[test]
fn async_callback_resolves_through_a_promise() {
    on_each_engine(|runtime| {
        runtime.register_channel(
            "greet",
            channel_fn(|argument| async move {
                futures::future::lazy(|_| ()).await;
                let (tx, rx) = futures::channel::oneshot::channel();
                std::thread::spawn(move || {
                    let _ = tx.send(());
                });
                rx.await.map_err(|err| Error::channel_dispatch(err.to_string()))?;
                let name = parse(argument.as_ref());
                Ok(Some(json!({ "greeting": format!("Hello {}", name.as_str().unwrap_or("?")) }).to_string()))
            }),
        );
        let value = eval(
            runtime,
            "(async () => { const reply = await hostChannels.greet('World'); return reply.greeting; })()",
        );
        assert_eq!(value, ScriptValue::from("Hello World"));
    });
}

#[test]
fn names_are_registered_once() {
    on_each_engine(|runtime| {
        let first_calls = Arc::new(AtomicUsize::new(0));
        let second_calls = Arc::new(AtomicUsize::new(0));
        let first = Arc::clone(&first_calls);
        let second = Arc::clone(&second_calls);

        assert!(runtime.register_channel(
            "counter",
            sync_channel_fn(move |_| {
                first.fetch_add(1, Ordering::SeqCst);
                Ok(Some("\"first\"".to_string()))
            }),
        ));
        assert!(!runtime.register_channel(
            "counter",
            sync_channel_fn(move |_| {
                second.fetch_add(1, Ordering::SeqCst);
                Ok(Some("\"second\"".to_string()))
            }),
        ));

        assert_eq!(eval(runtime, "sendMessage('counter')"), ScriptValue::from("first"));
        assert_eq!(first_calls.load(Ordering::SeqCst), 1);
        assert_eq!(second_calls.load(Ordering::SeqCst), 0);
    });
}

#[test]
fn missing_arguments_and_results_are_absent() {
    on_each_engine(|runtime| {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        runtime.register_channel(
            "ping",
            sync_channel_fn(move |argument| {
                assert!(argument.is_none());
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            }),
        );
        assert_eq!(eval(runtime, "sendMessage('ping') === undefined"), ScriptValue::Bool(true));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    });
}

#[test]
fn unknown_channel_throws_in_script() {
    on_each_engine(|runtime| {
        let err = block_on(runtime.evaluate("sendMessage('missing', 1)")).unwrap_err();
        assert!(err.is_script_error(), "expected a script error, got {err:?}");

        let caught = eval(
            runtime,
            "(() => { try { sendMessage('missing'); return 'no'; } catch (e) { return 'caught'; } })()",
        );
        assert_eq!(caught, ScriptValue::from("caught"));
    });
}

#[test]
fn failing_callback_throws_in_script() {
    on_each_engine(|runtime| {
        runtime.register_channel(
            "fail",
            sync_channel_fn(|_| Err(Error::channel_dispatch("backend offline"))),
        );
        match block_on(runtime.evaluate("sendMessage('fail')")) {
            Err(Error::Evaluation { message, .. }) => {
                assert!(message.contains("backend offline"), "unexpected message: {message}");
            }
            other => panic!("expected evaluation error, got {other:?}"),
        }
    });
}

#[test]
fn host_dispatch_reaches_registered_channels() {
    on_each_engine(|runtime| {
        runtime.register_channel(
            "echo",
            sync_channel_fn(|argument| Ok(argument)),
        );
        let reply = block_on(channels::dispatch(
            runtime.instance_id(),
            "echo",
            Some("[1,2]".to_string()),
        ))
        .unwrap();
        assert_eq!(reply.as_deref(), Some("[1,2]"));
    });
}

#[test]
fn host_dispatch_fails_fast_for_unknown_routes() {
    for kind in engine_kinds() {
        let mut runtime = runtime_on(kind);
        let id = runtime.instance_id();
        runtime.register_channel("echo", sync_channel_fn(Ok));

        let unknown = block_on(channels::dispatch(id, "nope", None));
        assert!(matches!(unknown, Err(Error::ChannelDispatch(_))), "[{kind}] {unknown:?}");

        runtime.dispose();
        let disposed = block_on(channels::dispatch(id, "echo", None));
        assert!(matches!(disposed, Err(Error::ChannelDispatch(_))), "[{kind}] {disposed:?}");
    }
}

#[test]
fn console_logging_does_not_disturb_results() {
    on_each_engine(|runtime| {
        let value = eval(
            runtime,
            "console.log('hello', { a: 1 }); console.warn('careful'); console.error(new Error('x')); 5",
        );
        assert_eq!(value, ScriptValue::Int(5));
    });
}
