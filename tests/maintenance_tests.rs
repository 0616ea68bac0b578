
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use conveyor::fleet::{Executor, Label, Node, CONTROLLER_NODE};
use conveyor::queue::actions::{Action, QueueAction};
use conveyor::queue::hooks::{QueueSorter, QueueTaskDispatcher};
use conveyor::queue::item::{BuildableItem, ItemView, Stage};
use conveyor::queue::BuildQueue;
use conveyor::resource::{Resource, ResourceList};
use conveyor::task::CauseOfBlockage;

use test_harness::{context, task};

fn stage_of(queue: &BuildQueue, id: u64) -> Option<Stage> {
    queue.item_by_id(id).map(|s| s.stage)
}

#[tokio::test]
async fn due_items_become_buildable() {
    let ctx = context();
    let snap = ctx.queue.schedule(task("alpha").build(), 0, vec![]).unwrap();

    ctx.queue.maintain().await;
    assert_eq!(stage_of(&ctx.queue, snap.id), Some(Stage::Buildable));
    assert_eq!(ctx.queue.count_buildable_items(), 1);
}

#[tokio::test]
async fn items_inside_the_quiet_period_stay_waiting() {
    let ctx = context();
    let snap = ctx.queue.schedule(task("alpha").build(), 60, vec![]).unwrap();

    ctx.queue.maintain().await;
    assert_eq!(stage_of(&ctx.queue, snap.id), Some(Stage::Waiting));
}

#[tokio::test]
async fn blocked_task_parks_until_the_block_clears() {
    let ctx = context();
    let t = task("alpha").build();
    t.set_blocked(true);

    let snap = ctx.queue.schedule(t.clone(), 0, vec![]).unwrap();
    ctx.queue.maintain().await;
    assert_eq!(stage_of(&ctx.queue, snap.id), Some(Stage::Blocked));
    assert_eq!(
        ctx.queue.cause_of_blockage(snap.id),
        Some(CauseOfBlockage::Message("held by test".into()))
    );

    t.set_blocked(false);
    ctx.queue.maintain().await;
    assert_eq!(stage_of(&ctx.queue, snap.id), Some(Stage::Buildable));
}

struct Gate {
    held: AtomicBool,
}

impl QueueTaskDispatcher for Gate {
    fn can_run(&self, _item: &ItemView<'_>) -> Option<CauseOfBlockage> {
        self.held
            .load(Ordering::SeqCst)
            .then(|| CauseOfBlockage::Message("gated".into()))
    }
}

#[tokio::test]
async fn dispatcher_can_run_keeps_an_item_blocked() {
    let ctx = context();
    let gate = Arc::new(Gate {
        held: AtomicBool::new(true),
    });
    ctx.queue.register_dispatcher(gate.clone());

    let snap = ctx.queue.schedule(task("alpha").build(), 0, vec![]).unwrap();
    ctx.queue.maintain().await;
    assert_eq!(stage_of(&ctx.queue, snap.id), Some(Stage::Blocked));

    gate.held.store(false, Ordering::SeqCst);
    ctx.queue.maintain().await;
    assert_eq!(stage_of(&ctx.queue, snap.id), Some(Stage::Buildable));
}

#[tokio::test]
async fn resource_conflicts_block_items() {
    let ctx = context();
    let list = ResourceList::single(Resource::new("database"));
    let t = task("alpha").resources(list.clone()).build();

    ctx.resources.reserve(&list);
    let snap = ctx.queue.schedule(t.clone(), 0, vec![]).unwrap();
    ctx.queue.maintain().await;
    assert_eq!(stage_of(&ctx.queue, snap.id), Some(Stage::Blocked));
    assert_eq!(
        ctx.queue.cause_of_blockage(snap.id),
        Some(CauseOfBlockage::ResourceInUse {
            resource: "database".into()
        })
    );

    ctx.resources.release(&list);
    ctx.queue.maintain().await;
    assert_eq!(stage_of(&ctx.queue, snap.id), Some(Stage::Buildable));
}

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

#[tokio::test]
async fn one_buildable_entry_per_non_concurrent_task() {
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

    ctx.queue.maintain().await;
    assert_eq!(stage_of(&ctx.queue, first.id), Some(Stage::Buildable));
    assert_eq!(stage_of(&ctx.queue, second.id), Some(Stage::Blocked));
    assert_eq!(
        ctx.queue.cause_of_blockage(second.id),
        Some(CauseOfBlockage::AnotherBuildInProgress)
    );

    // the guard lifts once the first entry leaves the queue
    assert!(ctx.queue.cancel_item(first.id));
    ctx.queue.maintain().await;
    assert_eq!(stage_of(&ctx.queue, second.id), Some(Stage::Buildable));
}

#[tokio::test]
async fn concurrent_tasks_may_hold_several_buildable_entries() {
    let ctx = context();
    let t = task("alpha").concurrent().build();

    ctx.queue
        .schedule(t.clone(), 0, vec![Arc::new(AlwaysSeparate)])
        .unwrap();
    ctx.queue
        .schedule(t.clone(), 0, vec![Arc::new(AlwaysSeparate)])
        .unwrap();

    ctx.queue.maintain().await;
    assert_eq!(ctx.queue.count_buildable_items(), 2);
}

struct NewestFirst;

impl QueueSorter for NewestFirst {
    fn sort(&self, buildables: &mut Vec<BuildableItem>) {
        buildables.sort_by_key(|i| std::cmp::Reverse(i.id()));
    }
}

#[tokio::test]
async fn sorter_reorders_the_buildable_list() {
    let ctx = context();
    ctx.queue.set_sorter(Some(Arc::new(NewestFirst)));

    ctx.queue.schedule(task("older").build(), 0, vec![]).unwrap();
    ctx.queue.schedule(task("newer").build(), 0, vec![]).unwrap();
    ctx.queue.maintain().await;

    let ids: Vec<u64> = ctx.queue.buildable_items().iter().map(|s| s.id).collect();
    assert_eq!(ids.len(), 2);
    assert!(ids[0] > ids[1], "sorter order survives into the list");
}

#[tokio::test]
async fn flyweight_tasks_are_placed_directly_and_stick_to_a_node() {
    let ctx = context();
    let agent_computer = ctx.fleet.add_node(Node::new("agent-1", 3));
    let controller_computer = ctx.fleet.computer(CONTROLLER_NODE).unwrap();

    let f = task("flyweight-job").flyweight().build();
    let snap = ctx.queue.schedule(f.clone(), 0, vec![]).unwrap();
    ctx.queue.maintain().await;

    assert_eq!(stage_of(&ctx.queue, snap.id), Some(Stage::Pending));
    assert!(ctx.queue.is_pending(f.as_ref()));

    let mut units = controller_computer.take_flyweights();
    let mut chosen = CONTROLLER_NODE;
    if units.is_empty() {
        units = agent_computer.take_flyweights();
        chosen = "agent-1";
    }
    assert_eq!(units.len(), 1, "exactly one placement");
    let unit = units.pop().unwrap();
    assert_eq!(unit.context().item_id(), snap.id);

    // a one-off executor picks the unit up and retires the pending item
    let computer = ctx.fleet.computer(chosen).unwrap();
    let one_off = Arc::new(Executor::one_off(99, computer.clone(), unit.clone()));
    let popped = ctx.queue.pop(&one_off).await.unwrap();
    assert_eq!(popped.context().item_id(), snap.id);
    assert!(ctx.queue.is_empty());

    // placement is sticky: the same task name lands on the same node
    let again = ctx.queue.schedule(f.clone(), 0, vec![]).unwrap();
    ctx.queue.maintain().await;
    assert_eq!(stage_of(&ctx.queue, again.id), Some(Stage::Pending));
    assert_eq!(ctx.fleet.computer(chosen).unwrap().take_flyweights().len(), 1);
}

#[tokio::test]
async fn flyweight_falls_back_to_buildable_when_no_node_accepts() {
    let ctx = context();
    ctx.fleet
        .computer(CONTROLLER_NODE)
        .unwrap()
        .set_online(false);

    let f = task("flyweight-job").flyweight().build();
    let snap = ctx.queue.schedule(f.clone(), 0, vec![]).unwrap();
    ctx.queue.maintain().await;

    assert_eq!(stage_of(&ctx.queue, snap.id), Some(Stage::Buildable));
}

#[tokio::test]
async fn quiescing_holds_flyweights_unless_non_blocking() {
    let ctx = context();
    ctx.fleet.set_quiescing(true);

    let held = ctx
        .queue
        .schedule(task("held").flyweight().build(), 0, vec![])
        .unwrap();
    let through = ctx
        .queue
        .schedule(task("keeps-going").flyweight().non_blocking().build(), 0, vec![])
        .unwrap();
    ctx.queue.maintain().await;

    assert_eq!(stage_of(&ctx.queue, held.id), Some(Stage::Buildable));
    assert_eq!(stage_of(&ctx.queue, through.id), Some(Stage::Pending));
}

#[tokio::test]
async fn cause_of_blockage_for_each_stage() {
    let ctx = context();

    let waiting = ctx.queue.schedule(task("waiting").build(), 60, vec![]).unwrap();
    assert!(matches!(
        ctx.queue.cause_of_blockage(waiting.id),
        Some(CauseOfBlockage::InQuietPeriod { remaining_ms }) if remaining_ms > 0
    ));

    let starving = ctx.queue.schedule(task("starving").build(), 0, vec![]).unwrap();
    ctx.queue.maintain().await;
    assert_eq!(
        ctx.queue.cause_of_blockage(starving.id),
        Some(CauseOfBlockage::WaitingForExecutor)
    );
}

#[tokio::test]
async fn labeled_item_with_no_online_node_is_stuck() {
    let ctx = context();
    let t = task("needs-windows").label("windows").build();

    let snap = ctx.queue.schedule(t.clone(), 0, vec![]).unwrap();
    ctx.queue.maintain().await;

    assert_eq!(stage_of(&ctx.queue, snap.id), Some(Stage::Buildable));
    assert!(ctx.queue.is_stuck(snap.id));
    assert_eq!(
        ctx.queue.cause_of_blockage(snap.id),
        Some(CauseOfBlockage::LabelOffline {
            label: Label::new("windows")
        })
    );
}

#[tokio::test]
async fn buildable_queries_respect_labels() {
    let ctx = context();
    let linux_computer = ctx.fleet.add_node(Node::new("linux-box", 1).with_label("linux"));

    ctx.queue
        .schedule(task("anywhere").build(), 0, vec![])
        .unwrap();
    ctx.queue
        .schedule(task("linux-only").label("linux").build(), 0, vec![])
        .unwrap();
    ctx.queue.maintain().await;

    assert_eq!(ctx.queue.count_buildable_items(), 2);
    assert_eq!(
        ctx.queue.count_buildable_items_for(&Label::new("linux")),
        1
    );

    let controller = ctx.fleet.computer(CONTROLLER_NODE).unwrap();
    let on_controller = ctx.queue.buildable_items_for_computer(&controller);
    assert_eq!(on_controller.len(), 1, "labeled item cannot run on the controller");

    let on_linux = ctx.queue.buildable_items_for_computer(&linux_computer);
    assert_eq!(on_linux.len(), 2);

    assert_eq!(ctx.queue.unblocked_items().len(), 2);
    assert_eq!(ctx.queue.unblocked_tasks().len(), 2);
}
