//! Completion-event cascades: pipeline states chained by triggerless
//! transitions, do-activity completion, and the top-level completion
//! emitted when the root's region reaches its final state

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use stateforward::{handlers, Event, ModelBuilder, StateMachine, StepTrace};
use tokio::sync::{mpsc, Mutex};

#[tokio::test]
async fn pipeline_advances_through_completions() {
    let order: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let log = |order: &Arc<Mutex<Vec<String>>>, label: &str| {
        let order = Arc::clone(order);
        let label = label.to_string();
        handlers::behavior(move |_event, _machine| {
            let order = Arc::clone(&order);
            let label = label.clone();
            async move {
                order.lock().await.push(label);
                Ok(())
            }
        })
    };

    let mut b = ModelBuilder::new("pipeline");
    let region = b.region(b.root(), "stages").unwrap();
    let create = b.state(region, "create_db_entry").unwrap();
    let extract = b.state(region, "extracting_video_id").unwrap();
    let transcribe = b.state(region, "transcribing").unwrap();
    let predict = b.state(region, "update_db_entry_predictions").unwrap();
    let done = b.final_state(region, "done").unwrap();
    b.initial(region, create).unwrap();
    for (state, label) in [
        (create, "create"),
        (extract, "extract"),
        (transcribe, "transcribe"),
        (predict, "predict"),
    ] {
        b.entry(state, log(&order, label)).unwrap();
    }
    // Triggerless transitions: armed by each state's completion event.
    b.transition(create, extract).add().unwrap();
    b.transition(extract, transcribe).add().unwrap();
    b.transition(transcribe, predict).add().unwrap();
    b.transition(predict, done).add().unwrap();
    let graph = b.freeze().unwrap();

    let machine = StateMachine::new(graph.clone());
    let (trace_tx, mut trace_rx) = mpsc::unbounded_channel::<StepTrace>();
    machine.observe(move |trace| {
        let _ = trace_tx.send(trace.clone());
    });

    // `start` settles through the whole cascade.
    machine.start().await.unwrap();

    assert_eq!(machine.state(), vec![done]);
    assert_eq!(
        *order.lock().await,
        vec!["create", "extract", "transcribe", "predict"]
    );

    // Entering the final state completed the root: exactly one
    // top-level completion event was emitted (and dropped).
    let mut root_completions = 0;
    while let Ok(trace) = trace_rx.try_recv() {
        root_completions += trace
            .completions
            .iter()
            .filter(|&&v| v == graph.root())
            .count();
    }
    assert_eq!(root_completions, 1);
}

#[tokio::test]
async fn do_activity_completion_advances_the_chain() {
    let mut b = ModelBuilder::new("worker");
    let region = b.region(b.root(), "main").unwrap();
    let working = b.state(region, "working").unwrap();
    let finished = b.state(region, "finished").unwrap();
    b.initial(region, working).unwrap();
    b.transition(working, finished).add().unwrap();
    b.activity(
        working,
        handlers::activity(|_event, _machine| async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(())
        }),
    )
    .unwrap();
    let graph = b.freeze().unwrap();

    let machine = StateMachine::new(graph);
    machine.start().await.unwrap();

    // The do-activity is still running: no completion yet.
    assert_eq!(machine.state(), vec![working]);

    tokio::time::sleep(Duration::from_millis(60)).await;
    machine.await_settled().await;
    assert_eq!(machine.state(), vec![finished]);

    machine.stop().await.unwrap();
}

#[tokio::test]
async fn cancelled_activity_emits_no_completion() {
    let cancelled_cleanups = Arc::new(AtomicUsize::new(0));
    let cleanups = Arc::clone(&cancelled_cleanups);

    struct CleanupOnDrop(Arc<AtomicUsize>);
    impl Drop for CleanupOnDrop {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    let mut b = ModelBuilder::new("worker");
    let region = b.region(b.root(), "main").unwrap();
    let working = b.state(region, "working").unwrap();
    let finished = b.state(region, "finished").unwrap();
    let idle = b.state(region, "idle").unwrap();
    b.initial(region, working).unwrap();
    b.transition(working, finished).add().unwrap();
    b.transition(working, idle).on_signal("Abort").add().unwrap();
    b.activity(
        working,
        handlers::activity(move |_event, _machine| {
            let cleanups = Arc::clone(&cleanups);
            async move {
                let _scoped = CleanupOnDrop(cleanups);
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            }
        }),
    )
    .unwrap();
    let graph = b.freeze().unwrap();

    let machine = StateMachine::new(graph);
    machine.start().await.unwrap();
    assert_eq!(machine.state(), vec![working]);

    // Exiting `working` cancels the activity; its scoped resources are
    // released before the step proceeds.
    machine.send(Event::signal("Abort")).await.unwrap();
    assert_eq!(machine.state(), vec![idle]);
    assert_eq!(cancelled_cleanups.load(Ordering::SeqCst), 1);

    // The cancelled activity never produced a completion event.
    machine.await_settled().await;
    assert_eq!(machine.state(), vec![idle]);

    machine.stop().await.unwrap();
}
