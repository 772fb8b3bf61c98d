//! Machine lifecycle: legal phase transitions, stop/restart behavior,
//! settle idempotence, and the behavior-failure step-abort policy

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use stateforward::{
    handlers, Event, Lifecycle, ModelBuilder, ModelGraph, SfError, StateMachine, VertexId,
};
use tokio::sync::{mpsc, Mutex};

fn two_states() -> (Arc<ModelGraph>, VertexId, VertexId) {
    let mut b = ModelBuilder::new("m");
    let region = b.region(b.root(), "main").unwrap();
    let a = b.state(region, "a").unwrap();
    let c = b.state(region, "b").unwrap();
    b.initial(region, a).unwrap();
    b.transition(a, c).on_signal("Go").add().unwrap();
    b.transition(c, a).on_signal("Back").add().unwrap();
    (b.freeze().unwrap(), a, c)
}

#[tokio::test]
async fn illegal_phase_operations_fail() {
    let (graph, ..) = two_states();
    let machine = StateMachine::new(graph);

    assert!(matches!(
        machine.send(Event::signal("Go")).await,
        Err(SfError::IllegalState {
            operation: "send",
            ..
        })
    ));
    assert!(matches!(
        machine.stop().await,
        Err(SfError::IllegalState {
            operation: "stop",
            ..
        })
    ));

    machine.start().await.unwrap();
    assert_eq!(machine.lifecycle(), Lifecycle::Running);
    assert!(matches!(
        machine.start().await,
        Err(SfError::IllegalState {
            operation: "start",
            ..
        })
    ));

    machine.stop().await.unwrap();
    assert_eq!(machine.lifecycle(), Lifecycle::Stopped);
    assert!(matches!(
        machine.send(Event::signal("Go")).await,
        Err(SfError::IllegalState { .. })
    ));
    assert!(matches!(
        machine.start().await,
        Err(SfError::IllegalState { .. })
    ));
}

#[tokio::test]
async fn restart_reproduces_the_initial_configuration() {
    let (graph, a, _) = two_states();

    let first = StateMachine::new(graph.clone());
    first.start().await.unwrap();
    let initial = first.state();
    first.send(Event::signal("Go")).await.unwrap();
    first.stop().await.unwrap();

    // A fresh machine over the same model starts from the same
    // configuration, regardless of the first machine's history.
    let second = StateMachine::new(graph);
    second.start().await.unwrap();
    assert_eq!(second.state(), initial);
    assert_eq!(second.state(), vec![a]);
    second.stop().await.unwrap();
}

#[tokio::test]
async fn settle_is_idempotent() {
    let (graph, ..) = two_states();
    let machine = StateMachine::new(graph);

    let steps = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&steps);
    machine.observe(move |_trace| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    machine.start().await.unwrap();
    machine.send(Event::signal("Go")).await.unwrap();
    machine.await_settled().await;
    let after_first = steps.load(Ordering::SeqCst);

    machine.await_settled().await;
    machine.await_settled().await;
    assert_eq!(steps.load(Ordering::SeqCst), after_first);

    machine.stop().await.unwrap();
}

#[tokio::test]
async fn entry_failure_aborts_and_restores() {
    let mut b = ModelBuilder::new("m");
    let region = b.region(b.root(), "main").unwrap();
    let a = b.state(region, "a").unwrap();
    let broken = b.state(region, "broken").unwrap();
    let fine = b.state(region, "fine").unwrap();
    b.initial(region, a).unwrap();
    b.transition(a, broken).on_signal("Break").add().unwrap();
    b.transition(a, fine).on_signal("Go").add().unwrap();
    b.entry(
        broken,
        handlers::behavior(|_event, _machine| async move {
            Err(SfError::behavior("broken.entry", "boom"))
        }),
    )
    .unwrap();
    let graph = b.freeze().unwrap();

    let machine = StateMachine::new(graph);
    machine.start().await.unwrap();

    let result = machine.send(Event::signal("Break")).await;
    assert!(matches!(result, Err(SfError::BehaviorFailed { .. })));

    // The pre-step configuration was restored and the machine keeps
    // dispatching.
    assert_eq!(machine.state(), vec![a]);
    machine.send(Event::signal("Go")).await.unwrap();
    assert_eq!(machine.state(), vec![fine]);

    machine.stop().await.unwrap();
}

#[tokio::test]
async fn exit_failure_aborts_the_step() {
    let mut b = ModelBuilder::new("m");
    let region = b.region(b.root(), "main").unwrap();
    let a = b.state(region, "a").unwrap();
    let c = b.state(region, "b").unwrap();
    b.initial(region, a).unwrap();
    b.transition(a, c).on_signal("Go").add().unwrap();
    b.exit(
        a,
        handlers::behavior(|_event, _machine| async move {
            Err(SfError::behavior("a.exit", "cannot leave"))
        }),
    )
    .unwrap();
    let graph = b.freeze().unwrap();

    let machine = StateMachine::new(graph);
    machine.start().await.unwrap();

    let result = machine.send(Event::signal("Go")).await;
    assert!(matches!(result, Err(SfError::StepAborted { .. })));
    assert_eq!(machine.state(), vec![a]);

    machine.stop().await.unwrap();
}

#[tokio::test]
async fn stop_runs_exit_behaviors_outer_to_inner() {
    let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let record = |order: &Arc<Mutex<Vec<&'static str>>>, label: &'static str| {
        let order = Arc::clone(order);
        handlers::behavior(move |_event, _machine| {
            let order = Arc::clone(&order);
            async move {
                order.lock().await.push(label);
                Ok(())
            }
        })
    };

    let mut b = ModelBuilder::new("m");
    let region = b.region(b.root(), "main").unwrap();
    let outer = b.state(region, "outer").unwrap();
    let ir = b.region(outer, "ir").unwrap();
    let inner = b.state(ir, "inner").unwrap();
    b.initial(region, outer).unwrap();
    b.initial(ir, inner).unwrap();
    b.exit(outer, record(&order, "outer")).unwrap();
    b.exit(inner, record(&order, "inner")).unwrap();
    let graph = b.freeze().unwrap();

    let machine = StateMachine::new(graph);
    machine.start().await.unwrap();
    machine.stop().await.unwrap();

    // Stop unwinds outer-to-inner, the reverse of a normal exit.
    assert_eq!(*order.lock().await, vec!["outer", "inner"]);
}

#[tokio::test]
async fn observers_see_every_step() {
    let (graph, ..) = two_states();
    let machine = StateMachine::new(graph);

    let (kind_tx, mut kind_rx) = mpsc::unbounded_channel::<String>();
    machine.observe(move |trace| {
        let _ = kind_tx.send(trace.kind.clone());
    });

    machine.start().await.unwrap();
    machine.send(Event::signal("Go")).await.unwrap();
    machine.send(Event::signal("Unknown")).await.unwrap();

    let mut kinds = Vec::new();
    while let Ok(kind) = kind_rx.try_recv() {
        kinds.push(kind);
    }
    assert!(kinds.contains(&"start".to_string()));
    assert!(kinds.contains(&"signal:Go".to_string()));
    assert!(kinds.contains(&"signal:Unknown".to_string()));

    machine.stop().await.unwrap();
}
