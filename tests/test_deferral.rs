//! Event deferral: deferred events wait in the side pool and rejoin
//! the queue, in original order, when the deferring state exits

use stateforward::{Event, ModelBuilder, StateMachine, StepOutcome, StepTrace};
use tokio::sync::mpsc;

#[tokio::test]
async fn deferred_event_is_dispatched_after_exit() {
    let mut b = ModelBuilder::new("deferral");
    let region = b.region(b.root(), "main").unwrap();
    let a = b.state(region, "a").unwrap();
    let c = b.state(region, "b").unwrap();
    let done = b.state(region, "done").unwrap();
    b.initial(region, a).unwrap();
    b.defer(a, ["E"]).unwrap();
    b.transition(a, c).on_signal("F").add().unwrap();
    b.transition(c, done).on_signal("E").add().unwrap();
    let graph = b.freeze().unwrap();

    let machine = StateMachine::new(graph);
    let (trace_tx, mut trace_rx) = mpsc::unbounded_channel::<StepTrace>();
    machine.observe(move |trace| {
        let _ = trace_tx.send(trace.clone());
    });

    machine.start().await.unwrap();

    // `a` declares a deferral for E: the event parks in the side pool.
    let outcome = machine.send(Event::signal("E")).await.unwrap();
    assert_eq!(outcome, StepOutcome::Deferred);
    assert_eq!(machine.state(), vec![a]);
    let mut last = None;
    while let Ok(trace) = trace_rx.try_recv() {
        last = Some(trace);
    }
    assert!(last.unwrap().deferred);

    // Leaving `a` releases E; it is dispatched in the very next step.
    machine.send(Event::signal("F")).await.unwrap();
    machine.await_settled().await;
    assert_eq!(machine.state(), vec![done]);

    machine.stop().await.unwrap();
}

#[tokio::test]
async fn released_events_keep_their_original_order() {
    let mut b = ModelBuilder::new("deferral");
    let region = b.region(b.root(), "main").unwrap();
    let a = b.state(region, "a").unwrap();
    let hub = b.state(region, "hub").unwrap();
    let after_first = b.state(region, "after_first").unwrap();
    let after_second = b.state(region, "after_second").unwrap();
    b.initial(region, a).unwrap();
    b.defer(a, ["E1", "E2"]).unwrap();
    b.transition(a, hub).on_signal("F").add().unwrap();
    // The path hub -> after_first -> after_second only works when the
    // released events arrive as E1 then E2.
    b.transition(hub, after_first).on_signal("E1").add().unwrap();
    b.transition(after_first, after_second)
        .on_signal("E2")
        .add()
        .unwrap();
    let graph = b.freeze().unwrap();

    let machine = StateMachine::new(graph);
    machine.start().await.unwrap();

    assert_eq!(
        machine.send(Event::signal("E1")).await.unwrap(),
        StepOutcome::Deferred
    );
    assert_eq!(
        machine.send(Event::signal("E2")).await.unwrap(),
        StepOutcome::Deferred
    );

    machine.send(Event::signal("F")).await.unwrap();
    machine.await_settled().await;
    assert_eq!(machine.state(), vec![after_second]);

    machine.stop().await.unwrap();
}

#[tokio::test]
async fn inner_deferral_owns_the_event() {
    // Both the composite and its inner state defer E; the event belongs
    // to the innermost deferring state and is released only when that
    // state exits.
    let mut b = ModelBuilder::new("deferral");
    let region = b.region(b.root(), "main").unwrap();
    let outer = b.state(region, "outer").unwrap();
    let target = b.state(region, "target").unwrap();
    let ir = b.region(outer, "ir").unwrap();
    let inner = b.state(ir, "inner").unwrap();
    let inner2 = b.state(ir, "inner2").unwrap();
    b.initial(region, outer).unwrap();
    b.initial(ir, inner).unwrap();
    b.defer(outer, ["E"]).unwrap();
    b.defer(inner, ["E"]).unwrap();
    b.transition(inner, inner2).on_signal("Step").add().unwrap();
    b.transition(outer, target).on_signal("E").add().unwrap();
    let graph = b.freeze().unwrap();

    let machine = StateMachine::new(graph);
    machine.start().await.unwrap();

    assert_eq!(
        machine.send(Event::signal("E")).await.unwrap(),
        StepOutcome::Deferred
    );

    // Exiting `inner` releases E; on re-dispatch it now matches the
    // transition declared on `outer`.
    machine.send(Event::signal("Step")).await.unwrap();
    machine.await_settled().await;
    assert_eq!(machine.state(), vec![target]);

    machine.stop().await.unwrap();
}
