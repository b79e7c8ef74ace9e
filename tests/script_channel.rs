use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use viewhost::js::{EngineFactory, QuickJsEngine, ScriptChannel, ScriptEngine};
use viewhost::{HostConfig, ViewError};

fn quickjs() -> EngineFactory {
    Arc::new(|| Ok(Box::new(QuickJsEngine::new()?) as Box<dyn ScriptEngine>))
}

fn channel_with(config: HostConfig) -> (Arc<ScriptChannel>, Arc<Mutex<Vec<ViewError>>>) {
    let faults = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&faults);
    let channel = Arc::new(ScriptChannel::new(
        "",
        config,
        Arc::new(move |err: ViewError| sink.lock().unwrap().push(err)),
    ));
    (channel, faults)
}

fn started() -> Arc<ScriptChannel> {
    let (channel, _) = channel_with(HostConfig::default());
    channel.start(quickjs(), None).unwrap();
    channel
}

#[test]
fn ten_thousand_executes_keep_submission_order() {
    let channel = started();
    channel.execute("var tokens = [];");
    for i in 0..10_000 {
        channel.execute(format!("tokens.push({i});"));
    }

    let tokens: Vec<u32> = channel.evaluate("tokens", None).unwrap();
    assert_eq!(tokens.len(), 10_000);
    assert!(tokens.iter().enumerate().all(|(i, token)| *token == i as u32));
    channel.dispose();
}

#[test]
fn evaluations_interleave_with_batches_in_order() {
    let channel = started();
    channel.execute("var seen = [];");
    channel.execute("seen.push('a');");
    let first: Vec<String> = channel.evaluate("seen.push('b'), seen", None).unwrap();
    channel.execute("seen.push('c');");
    let second: Vec<String> = channel.evaluate("seen", None).unwrap();

    assert_eq!(first, vec!["a", "b"]);
    assert_eq!(second, vec!["a", "b", "c"]);
    channel.dispose();
}

#[test]
fn slow_evaluation_times_out_within_bounds() {
    let channel = started();
    let timeout = Duration::from_millis(50);
    let started_at = Instant::now();
    let result = channel.evaluate::<i32>(
        "var s = Date.now(); while (Date.now() - s < 150) {} 1",
        Some(timeout),
    );
    let elapsed = started_at.elapsed();

    let err = result.unwrap_err();
    assert!(err.is_timeout(), "unexpected error: {err}");
    assert!(elapsed < timeout * 2, "took {elapsed:?}");

    // the late result is discarded and the channel keeps working
    assert_eq!(channel.evaluate::<i32>("2", None).unwrap(), 2);
    channel.dispose();
}

#[test]
fn unstarted_channel_reports_not_initialized() {
    let (channel, _) = channel_with(
        HostConfig::default().with_engine_start_timeout(Duration::from_millis(30)),
    );
    let err = channel.evaluate::<i32>("1", None).unwrap_err();
    assert!(err.is_timeout());
    assert!(err.to_string().contains("not initialized"));
}

#[test]
fn evaluation_waits_for_a_late_start() {
    let (channel, _) = channel_with(HostConfig::default());
    let starter = Arc::clone(&channel);
    let handle = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(30));
        starter.start(quickjs(), None).unwrap();
    });

    assert_eq!(channel.evaluate::<i32>("40 + 2", None).unwrap(), 42);
    handle.join().unwrap();
    channel.dispose();
}

#[test]
fn disposed_channel_returns_defaults() {
    let channel = started();
    channel.execute("function anyFunction() { return 7; }");
    assert_eq!(
        channel.evaluate_function::<i32>("anyFunction", true, &[], None).unwrap(),
        7
    );

    channel.dispose();
    assert!(channel.is_disposed());
    assert_eq!(
        channel.evaluate_function::<i32>("anyFunction", true, &[], None).unwrap(),
        0
    );
    assert_eq!(channel.evaluate::<String>("'text'", None).unwrap(), "");
    channel.execute("ignored()");
}

#[test]
fn script_faults_carry_name_message_and_frames() {
    let channel = started();
    channel.execute("function explode() { throw new TypeError('bad input'); }");
    let err = channel
        .evaluate_function::<i32>("explode", true, &[], None)
        .unwrap_err();

    let ViewError::ScriptFault(exception) = err else {
        panic!("expected a script fault, got {err:?}");
    };
    assert_eq!(exception.name, "TypeError");
    assert_eq!(exception.message, "bad input");
    assert_eq!(exception.frames[0].function_name, "explode");
    channel.dispose();
}

#[test]
fn fault_frames_stop_at_the_submitted_script() {
    let channel = started();
    channel.execute(
        "function inner() { throw new Error('deep'); }\nfunction outer() { inner(); }",
    );
    let err = channel.evaluate::<i32>("outer()", None).unwrap_err();

    let ViewError::ScriptFault(exception) = err else {
        panic!("expected a script fault, got {err:?}");
    };
    assert_eq!(exception.frames[0].function_name, "inner");
    assert_eq!(exception.frames[1].function_name, "outer");
    assert!(
        exception.frames.iter().all(|frame| frame.source_name != "eval_script"),
        "{:?}",
        exception.frames
    );
    channel.dispose();
}

#[test]
fn failed_batches_are_reported_out_of_band() {
    let (channel, faults) = channel_with(HostConfig::default());
    channel.start(quickjs(), None).unwrap();
    channel.execute("throw new RangeError('nobody is waiting');");
    assert_eq!(channel.evaluate::<i32>("1", None).unwrap(), 1);

    let faults = faults.lock().unwrap();
    assert_eq!(faults.len(), 1);
    assert!(matches!(
        &faults[0],
        ViewError::UncaughtAsyncFault(exception) if exception.message == "nobody is waiting"
    ));
    drop(faults);
    channel.dispose();
}

#[test]
fn functions_serialize_arguments_unless_told_otherwise() {
    let channel = started();
    channel.execute("function echo(a, b) { return [a, b]; }");
    let args = [serde_json::json!("it's \"quoted\""), serde_json::json!([1, 2])];
    let echoed: serde_json::Value = channel.evaluate_function("echo", true, &args, None).unwrap();
    assert_eq!(echoed, serde_json::json!(["it's \"quoted\"", [1, 2]]));

    let raw = [serde_json::json!("1 + 1"), serde_json::json!("'x'")];
    let echoed: serde_json::Value = channel.evaluate_function("echo", false, &raw, None).unwrap();
    assert_eq!(echoed, serde_json::json!([2, "x"]));
    channel.dispose();
}

#[tokio::test(flavor = "multi_thread")]
async fn async_evaluation() {
    let channel = started();
    let value: i32 = channel.evaluate_async("6 * 7".to_string(), None).await.unwrap();
    assert_eq!(value, 42);
    channel.dispose();
}
