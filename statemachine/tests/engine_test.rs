// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use async_std::task;
use db::MemoryDB;
use futures::future::BoxFuture;
use futures::FutureExt;
use futures::StreamExt;
use fvm_ipld_encoding::Cbor;
use serde::{Deserialize, Serialize};
use statemachine::{Ctx, Machine, StateGroup, Transition};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
enum JobState {
    Open,
    Running,
    Done,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct Job {
    id: u64,
    state: JobState,
    received: u64,
    message: String,
}

impl Cbor for Job {}

impl Job {
    fn new(id: u64) -> Self {
        Job {
            id,
            state: JobState::Open,
            received: 0,
            message: String::new(),
        }
    }
}

#[derive(Clone, Debug)]
enum JobEvent {
    Start,
    Progress(u64),
    Complete,
    Fail(String),
}

struct TestEnv {
    running_handler_runs: AtomicUsize,
    complete_on_entry: bool,
}

struct JobMachine;

impl Machine for JobMachine {
    type Key = u64;
    type State = JobState;
    type Event = JobEvent;
    type Record = Job;
    type Environment = TestEnv;

    fn key(record: &Job) -> u64 {
        record.id
    }

    fn state(record: &Job) -> JobState {
        record.state
    }

    fn set_state(record: &mut Job, state: JobState) {
        record.state = state;
    }

    fn is_final(state: JobState) -> bool {
        matches!(state, JobState::Done | JobState::Failed)
    }

    fn plan(state: JobState, event: &JobEvent) -> Option<Transition<JobState>> {
        match event {
            JobEvent::Start => match state {
                JobState::Open => Some(Transition::To(JobState::Running)),
                _ => None,
            },
            JobEvent::Progress(_) => match state {
                JobState::Running => Some(Transition::JustRecord),
                _ => None,
            },
            JobEvent::Complete => match state {
                JobState::Running => Some(Transition::To(JobState::Done)),
                _ => None,
            },
            JobEvent::Fail(_) => Some(Transition::To(JobState::Failed)),
        }
    }

    fn apply(record: &mut Job, event: &JobEvent) {
        match event {
            JobEvent::Progress(bytes) => record.received += bytes,
            JobEvent::Fail(msg) => record.message = msg.clone(),
            _ => {}
        }
    }

    fn handle(
        env: Arc<TestEnv>,
        ctx: Ctx<Self>,
        record: Job,
    ) -> BoxFuture<'static, Result<(), String>> {
        async move {
            if record.state == JobState::Running {
                env.running_handler_runs.fetch_add(1, Ordering::SeqCst);
                if env.complete_on_entry {
                    ctx.trigger(JobEvent::Complete);
                }
            }
            Ok(())
        }
        .boxed()
    }
}

fn test_env(complete_on_entry: bool) -> Arc<TestEnv> {
    Arc::new(TestEnv {
        running_handler_runs: AtomicUsize::new(0),
        complete_on_entry,
    })
}

async fn wait_for_state(group: &StateGroup<JobMachine, MemoryDB>, id: u64, want: JobState) -> Job {
    for _ in 0..100 {
        let job = group.get(&id).await.unwrap();
        if job.state == want {
            return job;
        }
        task::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {} never reached {:?}", id, want);
}

#[test]
fn transitions_and_duplicate_begin() {
    task::block_on(async {
        let db = MemoryDB::default();
        let group: StateGroup<JobMachine, _> =
            StateGroup::resume(db, "/jobs", test_env(false)).await.unwrap();

        group.begin(Job::new(1)).await.unwrap();
        let err = group.begin(Job::new(1)).await.unwrap_err();
        assert!(err.to_string().contains("already tracked"));

        group.send(&1, JobEvent::Start).await.unwrap();
        assert_eq!(group.get(&1).await.unwrap().state, JobState::Running);
    })
}

#[test]
fn just_record_accrues_without_transition() {
    task::block_on(async {
        let db = MemoryDB::default();
        let group: StateGroup<JobMachine, _> =
            StateGroup::resume(db, "/jobs", test_env(false)).await.unwrap();

        group.begin(Job::new(7)).await.unwrap();
        group.send(&7, JobEvent::Start).await.unwrap();
        for _ in 0..10 {
            group.send(&7, JobEvent::Progress(100)).await.unwrap();
        }
        let job = group.get(&7).await.unwrap();
        assert_eq!(job.state, JobState::Running);
        assert_eq!(job.received, 1000);
    })
}

#[test]
fn unplanned_events_are_dropped() {
    task::block_on(async {
        let db = MemoryDB::default();
        let group: StateGroup<JobMachine, _> =
            StateGroup::resume(db, "/jobs", test_env(false)).await.unwrap();

        group.begin(Job::new(3)).await.unwrap();
        // progress before start has no planned transition
        group.send(&3, JobEvent::Progress(5)).await.unwrap();
        let job = group.get(&3).await.unwrap();
        assert_eq!(job.state, JobState::Open);
        assert_eq!(job.received, 0);
    })
}

#[test]
fn finality_states_absorb() {
    task::block_on(async {
        let db = MemoryDB::default();
        let group: StateGroup<JobMachine, _> =
            StateGroup::resume(db, "/jobs", test_env(false)).await.unwrap();

        group.begin(Job::new(4)).await.unwrap();
        group.send(&4, JobEvent::Start).await.unwrap();
        group.send(&4, JobEvent::Complete).await.unwrap();
        group
            .send(&4, JobEvent::Fail("too late".to_string()))
            .await
            .unwrap();

        let job = group.get(&4).await.unwrap();
        assert_eq!(job.state, JobState::Done);
        assert_eq!(job.message, "");
    })
}

#[test]
fn subscribers_observe_post_states_in_order() {
    task::block_on(async {
        let db = MemoryDB::default();
        let group: StateGroup<JobMachine, _> =
            StateGroup::resume(db, "/jobs", test_env(false)).await.unwrap();
        let mut sub = group.subscribe().await;

        group.begin(Job::new(9)).await.unwrap();
        group.send(&9, JobEvent::Start).await.unwrap();
        group.send(&9, JobEvent::Progress(11)).await.unwrap();
        group.send(&9, JobEvent::Complete).await.unwrap();

        let (_, post) = sub.next().await.unwrap();
        assert_eq!(post.state, JobState::Running);
        let (_, post) = sub.next().await.unwrap();
        assert_eq!(post.received, 11);
        let (_, post) = sub.next().await.unwrap();
        assert_eq!(post.state, JobState::Done);
    })
}

#[test]
fn handlers_can_trigger_follow_up_events() {
    task::block_on(async {
        let db = MemoryDB::default();
        let group: StateGroup<JobMachine, _> =
            StateGroup::resume(db, "/jobs", test_env(true)).await.unwrap();

        group.begin(Job::new(5)).await.unwrap();
        group.send(&5, JobEvent::Start).await.unwrap();
        wait_for_state(&group, 5, JobState::Done).await;
    })
}

#[test]
fn resume_restores_states_and_reruns_handlers() {
    task::block_on(async {
        let db = MemoryDB::default();
        {
            let group: StateGroup<JobMachine, _> =
                StateGroup::resume(db.clone(), "/jobs", test_env(false))
                    .await
                    .unwrap();
            group.begin(Job::new(1)).await.unwrap();
            group.send(&1, JobEvent::Start).await.unwrap();
            group.begin(Job::new(2)).await.unwrap();
            group.send(&2, JobEvent::Start).await.unwrap();
            group.send(&2, JobEvent::Complete).await.unwrap();
        }

        let env = test_env(false);
        let group: StateGroup<JobMachine, _> = StateGroup::resume(db, "/jobs", env.clone())
            .await
            .unwrap();

        let mut jobs = group.list().await.unwrap();
        jobs.sort_by_key(|j| j.id);
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].state, JobState::Running);
        assert_eq!(jobs[1].state, JobState::Done);

        // the live job's entry handler is re-run exactly once, the finished
        // one is left alone
        task::sleep(Duration::from_millis(50)).await;
        assert_eq!(env.running_handler_runs.load(Ordering::SeqCst), 1);

        // resumed machines still accept events
        group.send(&1, JobEvent::Progress(4)).await.unwrap();
        assert_eq!(group.get(&1).await.unwrap().received, 4);
    })
}
