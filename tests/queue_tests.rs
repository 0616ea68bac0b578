
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use conveyor::queue::actions::{Action, CauseAction, QueueAction};
use conveyor::queue::hooks::QueueDecisionHandler;
use conveyor::queue::item::{CompletionState, Stage};
use conveyor::task::Task;

use test_harness::{context, task};

#[test]
fn schedule_creates_a_waiting_item() {
    let ctx = context();
    let t = task("alpha").build();

    let snap = ctx.queue.schedule(t.clone(), 5, vec![]).unwrap();
    assert_eq!(snap.stage, Stage::Waiting);
    assert_eq!(snap.future.current(), CompletionState::Pending);

    let quiet = (snap.due_at.unwrap() - snap.in_queue_since).num_seconds();
    assert!((4..=5).contains(&quiet), "quiet period was {quiet}s");

    assert!(ctx.queue.contains(t.as_ref()));
    assert!(!ctx.queue.is_empty());
}

#[test]
fn negative_quiet_period_clamps_to_zero() {
    let ctx = context();
    let t = task("alpha").build();

    let snap = ctx.queue.schedule(t.clone(), -30, vec![]).unwrap();
    let due = snap.due_at.unwrap();
    assert!(due >= snap.in_queue_since);
    assert!((due - snap.in_queue_since).num_seconds() < 1);
}

struct Veto;

impl QueueDecisionHandler for Veto {
    fn should_schedule(&self, _task: &Arc<dyn Task>, _actions: &[Arc<dyn Action>]) -> bool {
        false
    }
}

#[test]
fn vetoed_submission_leaves_no_state() {
    let ctx = context();
    ctx.queue.register_decision_handler(Arc::new(Veto));

    let t = task("alpha").build();
    assert!(ctx.queue.schedule(t.clone(), 0, vec![]).is_none());
    assert!(ctx.queue.is_empty());
}

#[test]
fn duplicate_submission_coalesces() {
    let ctx = context();
    let t = task("alpha").build();

    assert!(ctx.queue.schedule(t.clone(), 10, vec![]).is_some());
    assert!(ctx.queue.schedule(t.clone(), 10, vec![]).is_none());
    assert_eq!(ctx.queue.items_for(t.as_ref()).len(), 1);
}

#[test]
fn resubmission_extends_the_quiet_period() {
    let ctx = context();
    let t = task("alpha").build();

    let first = ctx.queue.schedule(t.clone(), 10, vec![]).unwrap();
    std::thread::sleep(Duration::from_millis(30));
    assert!(ctx.queue.schedule(t.clone(), 10, vec![]).is_none());

    let current = ctx.queue.item_for(t.as_ref()).unwrap();
    assert_eq!(current.id, first.id);
    assert!(current.due_at.unwrap() > first.due_at.unwrap());
}

#[test]
fn zero_quiet_period_pulls_the_timestamp_in() {
    let ctx = context();
    let t = task("alpha").build();

    let first = ctx.queue.schedule(t.clone(), 30, vec![]).unwrap();
    assert!(ctx.queue.schedule(t.clone(), 0, vec![]).is_none());

    let current = ctx.queue.item_for(t.as_ref()).unwrap();
    assert!(current.due_at.unwrap() < first.due_at.unwrap());
    assert!((current.due_at.unwrap() - current.in_queue_since).num_seconds() < 1);
}

#[test]
fn shorter_quiet_period_never_pulls_the_timestamp_back() {
    let ctx = context();
    let t = task("alpha").build();

    let first = ctx.queue.schedule(t.clone(), 30, vec![]).unwrap();
    assert!(ctx.queue.schedule(t.clone(), 5, vec![]).is_none());

    let current = ctx.queue.item_for(t.as_ref()).unwrap();
    assert_eq!(current.due_at.unwrap(), first.due_at.unwrap());
}

#[test]
fn zero_quiet_period_never_pushes_the_timestamp_out() {
    let ctx = context();
    let t = task("alpha").build();

    let first = ctx.queue.schedule(t.clone(), 0, vec![]).unwrap();
    std::thread::sleep(Duration::from_millis(30));
    assert!(ctx.queue.schedule(t.clone(), 0, vec![]).is_none());

    let current = ctx.queue.item_for(t.as_ref()).unwrap();
    assert_eq!(current.due_at.unwrap(), first.due_at.unwrap());
}

/// Queue action insisting the submission always deserves its own item.
struct AlwaysSeparate;

impl Action for AlwaysSeparate {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_queue_action(&self) -> Option<&dyn QueueAction> {
        Some(self)
    }
}

impl QueueAction for AlwaysSeparate {
    fn should_schedule(&self, _other_actions: &[Arc<dyn Action>]) -> bool {
        true
    }
}

#[test]
fn queue_action_can_veto_coalescing() {
    let ctx = context();
    let t = task("alpha").build();

    let first = ctx
        .queue
        .schedule(t.clone(), 0, vec![Arc::new(AlwaysSeparate)])
        .unwrap();
    let second = ctx
        .queue
        .schedule(t.clone(), 0, vec![Arc::new(AlwaysSeparate)])
        .unwrap();

    assert_ne!(first.id, second.id);
    assert_eq!(ctx.queue.items_for(t.as_ref()).len(), 2);
}

#[test]
fn foldable_actions_merge_into_the_existing_item() {
    let ctx = context();
    let t = task("alpha").build();

    ctx.queue
        .schedule(t.clone(), 10, vec![Arc::new(CauseAction::new("timer"))])
        .unwrap();
    assert!(ctx
        .queue
        .schedule(t.clone(), 10, vec![Arc::new(CauseAction::new("scm change"))])
        .is_none());

    let snap = ctx.queue.item_for(t.as_ref()).unwrap();
    let cause = snap
        .actions
        .iter()
        .find_map(|a| a.as_any().downcast_ref::<CauseAction>())
        .unwrap();
    assert_eq!(cause.notes(), vec!["timer".to_string(), "scm change".to_string()]);
}

#[test]
fn cancel_task_resolves_the_future() {
    let ctx = context();
    let t = task("alpha").build();

    let snap = ctx.queue.schedule(t.clone(), 60, vec![]).unwrap();
    assert!(ctx.queue.cancel_task(t.as_ref()));
    assert_eq!(snap.future.current(), CompletionState::Cancelled);
    assert!(ctx.queue.is_empty());
    assert!(!ctx.queue.cancel_task(t.as_ref()));
}

#[test]
fn cancel_item_by_id() {
    let ctx = context();
    let t = task("alpha").build();

    let snap = ctx.queue.schedule(t.clone(), 60, vec![]).unwrap();
    assert!(!ctx.queue.cancel_item(snap.id + 100));
    assert!(ctx.queue.cancel_item(snap.id));
    assert_eq!(snap.future.current(), CompletionState::Cancelled);
    assert!(ctx.queue.item_by_id(snap.id).is_none());
}

#[test]
fn clear_cancels_everything() {
    let ctx = context();
    let snaps: Vec<_> = ["a", "b", "c"]
        .iter()
        .map(|name| {
            ctx.queue
                .schedule(task(name).build(), 60, vec![])
                .unwrap()
        })
        .collect();

    ctx.queue.clear();
    assert!(ctx.queue.is_empty());
    for snap in snaps {
        assert_eq!(snap.future.current(), CompletionState::Cancelled);
    }
}

#[test]
fn ids_and_admission_times_are_monotone() {
    let ctx = context();
    let snaps: Vec<_> = (0..5)
        .map(|i| {
            ctx.queue
                .schedule(task(&format!("job-{i}")).build(), 60, vec![])
                .unwrap()
        })
        .collect();

    for pair in snaps.windows(2) {
        assert!(pair[1].id > pair[0].id);
        assert!(pair[1].in_queue_since >= pair[0].in_queue_since);
    }
}

#[test]
fn items_lists_waiting_entries_in_eligibility_order() {
    let ctx = context();
    ctx.queue.schedule(task("late").build(), 30, vec![]).unwrap();
    ctx.queue.schedule(task("soon").build(), 10, vec![]).unwrap();
    ctx.queue.schedule(task("mid").build(), 20, vec![]).unwrap();

    let names: Vec<String> = ctx
        .queue
        .items()
        .iter()
        .map(|s| s.task.full_display_name())
        .collect();
    assert_eq!(names, vec!["soon", "mid", "late"]);
}

#[test]
fn approximate_items_is_at_most_a_second_stale() {
    let ctx = context();
    let t = task("alpha").build();
    ctx.queue.schedule(t.clone(), 60, vec![]).unwrap();

    let fresh = ctx.queue.approximate_items();
    assert_eq!(fresh.len(), 1);

    ctx.queue.cancel_task(t.as_ref());
    let stale = ctx.queue.approximate_items();
    assert_eq!(stale.len(), 1, "cache is served within its TTL");

    std::thread::sleep(Duration::from_millis(1100));
    let refreshed = ctx.queue.approximate_items();
    assert!(refreshed.is_empty());
}

#[tokio::test]
async fn wait_for_observes_cancellation() {
    let ctx = context();
    let t = task("alpha").build();
    let snap = ctx.queue.schedule(t.clone(), 60, vec![]).unwrap();

    let queue = ctx.queue.clone();
    let id = snap.id;
    let waiter = tokio::spawn(async move { queue.wait_for(id).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(ctx.queue.cancel_item(id));

    let outcome = tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome, Some(CompletionState::Cancelled));
}
