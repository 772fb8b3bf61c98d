//! Time-triggered transitions: `after` self-loops reset their timer on
//! re-entry, the smallest delay wins, and exits cancel pending wakes

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use stateforward::{
    handlers, Clock, ClockFault, Event, Lifecycle, ModelBuilder, StateMachine,
};
use tokio::time::Instant;

#[tokio::test]
async fn self_loop_resets_its_timer() {
    let entries = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&entries);

    let mut b = ModelBuilder::new("blinker");
    let region = b.region(b.root(), "main").unwrap();
    let ticking = b.state(region, "ticking").unwrap();
    b.initial(region, ticking).unwrap();
    b.after(ticking, Duration::from_millis(30), ticking).unwrap();
    b.entry(
        ticking,
        handlers::behavior(move |_event, _machine| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }),
    )
    .unwrap();
    let graph = b.freeze().unwrap();

    let machine = StateMachine::new(graph);
    machine.start().await.unwrap();
    assert_eq!(entries.load(Ordering::SeqCst), 1);

    // Each firing exits and re-enters the state, rescheduling the wake.
    tokio::time::sleep(Duration::from_millis(110)).await;
    machine.await_settled().await;
    let fired = entries.load(Ordering::SeqCst);
    assert!(fired >= 3, "expected repeated self-loops, saw {fired}");

    machine.stop().await.unwrap();
}

#[tokio::test]
async fn smallest_delay_wins() {
    let mut b = ModelBuilder::new("race");
    let region = b.region(b.root(), "main").unwrap();
    let waiting = b.state(region, "waiting").unwrap();
    let fast = b.state(region, "fast").unwrap();
    let slow = b.state(region, "slow").unwrap();
    b.initial(region, waiting).unwrap();
    b.after(waiting, Duration::from_millis(20), fast).unwrap();
    b.after(waiting, Duration::from_millis(500), slow).unwrap();
    let graph = b.freeze().unwrap();

    let machine = StateMachine::new(graph);
    machine.start().await.unwrap();

    tokio::time::sleep(Duration::from_millis(60)).await;
    machine.await_settled().await;
    assert_eq!(machine.state(), vec![fast]);

    // The slow timer was cancelled on exit; nothing else fires.
    tokio::time::sleep(Duration::from_millis(600)).await;
    machine.await_settled().await;
    assert_eq!(machine.state(), vec![fast]);

    machine.stop().await.unwrap();
}

#[tokio::test]
async fn equal_delays_resolve_by_declaration_order() {
    // Two after(30ms) transitions share one logical instant: a single
    // wake is pushed for the deadline, and the tie goes to the first
    // declared transition whose guard passes — deterministically, on
    // every run.
    for take_first in [true, false] {
        for _ in 0..3 {
            let mut b = ModelBuilder::new("tie");
            let region = b.region(b.root(), "main").unwrap();
            let waiting = b.state(region, "waiting").unwrap();
            let first = b.state(region, "first").unwrap();
            let second = b.state(region, "second").unwrap();
            b.initial(region, waiting).unwrap();
            b.transition(waiting, first)
                .after(Duration::from_millis(30))
                .guard_fn(move |_| take_first)
                .add()
                .unwrap();
            b.transition(waiting, second)
                .after(Duration::from_millis(30))
                .add()
                .unwrap();
            let graph = b.freeze().unwrap();

            let machine = StateMachine::new(graph);
            machine.start().await.unwrap();

            tokio::time::sleep(Duration::from_millis(70)).await;
            machine.await_settled().await;
            let expected = if take_first { first } else { second };
            assert_eq!(machine.state(), vec![expected]);

            machine.stop().await.unwrap();
        }
    }
}

#[tokio::test]
async fn stale_time_events_are_dropped() {
    let mut b = ModelBuilder::new("stale");
    let region = b.region(b.root(), "main").unwrap();
    let a = b.state(region, "a").unwrap();
    let c = b.state(region, "c").unwrap();
    b.initial(region, a).unwrap();
    b.after(a, Duration::from_millis(30), c).unwrap();
    b.transition(a, c).on_signal("Skip").add().unwrap();
    b.transition(c, a).on_signal("Back").add().unwrap();
    let graph = b.freeze().unwrap();

    let machine = StateMachine::new(graph);
    machine.start().await.unwrap();

    // Leave `a` before its timer fires.
    machine.send(Event::signal("Skip")).await.unwrap();
    assert_eq!(machine.state(), vec![c]);

    tokio::time::sleep(Duration::from_millis(80)).await;
    machine.await_settled().await;
    assert_eq!(machine.state(), vec![c]);

    machine.stop().await.unwrap();
}

/// Clock whose sleep immediately reports a fault.
#[derive(Debug)]
struct BrokenClock;

#[async_trait]
impl Clock for BrokenClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep_until(&self, _deadline: Instant) -> Result<(), ClockFault> {
        Err(ClockFault {
            message: "clock source failed".to_string(),
        })
    }
}

#[tokio::test]
async fn clock_fault_stops_the_machine() {
    let mut b = ModelBuilder::new("faulty");
    let region = b.region(b.root(), "main").unwrap();
    let a = b.state(region, "a").unwrap();
    let c = b.state(region, "c").unwrap();
    b.initial(region, a).unwrap();
    b.after(a, Duration::from_millis(10), c).unwrap();
    let graph = b.freeze().unwrap();

    let machine = StateMachine::with_clock(graph, Arc::new(BrokenClock));
    // The fault may arrive before or after the machine settles.
    let _ = machine.start().await;

    for _ in 0..50 {
        if machine.lifecycle() == Lifecycle::Stopped {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(machine.lifecycle(), Lifecycle::Stopped);
}
