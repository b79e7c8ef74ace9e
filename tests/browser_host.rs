use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use viewhost::{
    BrowserHost, HostConfig, MemoryResolver, MemoryStore, NativeMethods, UnhandledFault, ViewError,
};

fn browser() -> BrowserHost {
    BrowserHost::new(
        HostConfig::default(),
        Arc::new(MemoryResolver::new()),
        Arc::new(MemoryStore::new()),
    )
}

fn wait_for(condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    true
}

#[test]
fn evaluation_after_dispose_returns_default() {
    let host = browser();
    host.load(None).unwrap();
    host.execute("function anyFunction() { return 5; }");
    assert_eq!(host.evaluate_function::<i32>("anyFunction", &[]).unwrap(), 5);

    host.dispose();
    assert!(host.is_disposed());
    assert_eq!(host.evaluate_function::<i32>("anyFunction", &[]).unwrap(), 0);
    assert_eq!(host.evaluate::<Vec<String>>("['a']", None).unwrap(), Vec::<String>::new());
}

#[test]
fn dispose_from_inside_a_native_call_completes_after_the_call() {
    let host = browser();
    let log = Arc::new(Mutex::new(Vec::<String>::new()));

    let call_log = Arc::clone(&log);
    let target = host.clone();
    host.register_object(
        "$closer",
        NativeMethods::new()
            .method("close", move |_| {
                call_log.lock().unwrap().push("call-start".to_string());
                target.dispose();
                call_log.lock().unwrap().push("call-end".to_string());
                Ok(Some(json!("closed")))
            })
            .into_object(),
    );
    let disposed_log = Arc::clone(&log);
    host.on_disposed(move || disposed_log.lock().unwrap().push("disposed".to_string()));

    host.load(None).unwrap();
    host.execute("var answer = __viewhost_call('$closer', 'close', '[]');");

    assert!(wait_for(|| host.is_disposed()), "dispose never completed");
    assert_eq!(*log.lock().unwrap(), vec!["call-start", "call-end", "disposed"]);
}

#[test]
fn calls_are_refused_once_disposing() {
    let host = browser();
    let calls = Arc::new(Mutex::new(0));
    let counter = Arc::clone(&calls);
    host.register_object(
        "$counter",
        NativeMethods::new()
            .action("hit", move |_| *counter.lock().unwrap() += 1)
            .into_object(),
    );
    host.load(None).unwrap();
    host.execute("__viewhost_call('$counter', 'hit', '[]');");
    assert_eq!(host.evaluate::<i32>("1", None).unwrap(), 1);
    assert_eq!(*calls.lock().unwrap(), 1);

    host.dispose();
    assert!(!host.register_object("$late", NativeMethods::new().into_object()));
    assert!(!host.is_object_registered("$counter"));
}

#[test]
fn notifications_reach_inline_and_ui_listeners() {
    let host = browser();
    let inline = Arc::new(Mutex::new(Vec::<Value>::new()));
    let ui = Arc::new(Mutex::new(Vec::<Value>::new()));

    let seen = Arc::clone(&inline);
    host.attach_listener(
        "Clicked",
        Arc::new(move |args: &[Value]| -> anyhow::Result<()> {
            seen.lock().unwrap().extend(args.iter().cloned());
            Ok(())
        }),
    );
    let seen = Arc::clone(&ui);
    host.attach_ui_listener(
        "Clicked",
        Arc::new(move |args: &[Value]| -> anyhow::Result<()> {
            seen.lock().unwrap().extend(args.iter().cloned());
            Ok(())
        }),
    );

    host.load(None).unwrap();
    host.execute("__viewhost_notify('Clicked', JSON.stringify([1, 'two']));");
    assert_eq!(host.evaluate::<i32>("1", None).unwrap(), 1);

    assert_eq!(*inline.lock().unwrap(), vec![json!(1), json!("two")]);
    assert!(ui.lock().unwrap().is_empty());
    assert_eq!(host.ui_queue().run_pending().unwrap(), 1);
    assert_eq!(*ui.lock().unwrap(), vec![json!(1), json!("two")]);
    host.dispose();
}

#[test]
fn native_errors_are_thrown_into_script() {
    let host = browser();
    host.register_object(
        "$failing",
        NativeMethods::new()
            .method("explode", |_| Err(anyhow::anyhow!("native failure")))
            .into_object(),
    );
    host.load(None).unwrap();
    let caught: String = host
        .evaluate(
            "(function () { try { __viewhost_call('$failing', 'explode', '[]'); return 'no'; } catch (e) { return String(e); } })()",
            None,
        )
        .unwrap();
    assert!(caught.contains("native failure"), "{caught}");
    host.dispose();
}

#[test]
fn reload_releases_the_main_context() {
    let host = browser();
    let released = Arc::new(Mutex::new(Vec::<Value>::new()));
    let seen = Arc::clone(&released);
    host.attach_listener(
        "JavascriptContextReleased",
        Arc::new(move |args: &[Value]| -> anyhow::Result<()> {
            seen.lock().unwrap().extend(args.iter().cloned());
            Ok(())
        }),
    );

    host.load(Some("var generation = 'first';".to_string())).unwrap();
    host.execute("generation = 'changed';");
    assert_eq!(host.evaluate::<String>("generation", None).unwrap(), "changed");

    host.reload().unwrap();
    assert_eq!(host.evaluate::<String>("generation", None).unwrap(), "first");
    assert_eq!(*released.lock().unwrap(), vec![json!("")]);
    host.dispose();
}

#[test]
fn unhandled_fault_hooks_run_in_order() {
    let host = browser();
    let order = Arc::new(Mutex::new(Vec::<String>::new()));

    let first = Arc::clone(&order);
    host.on_unhandled_async_fault(Arc::new(move |fault: &mut UnhandledFault| {
        first.lock().unwrap().push(format!("first:{}", fault.error));
    }));
    let second = Arc::clone(&order);
    host.on_unhandled_async_fault(Arc::new(move |fault: &mut UnhandledFault| {
        second.lock().unwrap().push("second".to_string());
        fault.handled = true;
    }));

    host.load(None).unwrap();
    host.execute("null.property;");
    assert_eq!(host.evaluate::<i32>("1", None).unwrap(), 1);

    let order = order.lock().unwrap().clone();
    assert_eq!(order.len(), 2);
    assert!(order[0].starts_with("first:"));
    assert_eq!(order[1], "second");
    assert_eq!(host.ui_queue().run_pending().unwrap(), 0);
    host.dispose();
}

#[test]
fn resources_resolve_through_the_resolver() {
    let resolver = MemoryResolver::new().with("lib/greeting.js", "var greeting = 'hello';");
    let host = BrowserHost::new(
        HostConfig::default(),
        Arc::new(resolver),
        Arc::new(MemoryStore::new()),
    );
    host.load(None).unwrap();
    host.execute("(0, eval)(__viewhost_resolve('lib/greeting'));");
    assert_eq!(host.evaluate::<String>("greeting", None).unwrap(), "hello");
    assert_eq!(
        host.evaluate::<Option<String>>("__viewhost_resolve('lib/missing')", None)
            .unwrap(),
        None
    );
    host.dispose();
}

#[test]
fn evaluate_from_the_worker_is_rejected() {
    let host = browser();
    let result = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&result);
    let target = host.clone();
    host.register_object(
        "$reentrant",
        NativeMethods::new()
            .action("probe", move |_| {
                let outcome = target.evaluate::<i32>("1", None);
                *slot.lock().unwrap() = Some(matches!(outcome, Err(ViewError::InvalidOperation(_))));
            })
            .into_object(),
    );
    host.load(None).unwrap();
    host.execute("__viewhost_call('$reentrant', 'probe', '[]');");
    assert_eq!(host.evaluate::<i32>("1", None).unwrap(), 1);
    assert_eq!(*result.lock().unwrap(), Some(true));
    host.unregister_object("$reentrant");
    host.dispose();
}
