//
// Copyright 2017-2026 Hans W. Uhlig. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! Scheduler tests over an in-memory channel pool

mod common;

use chrono::NaiveDate;
use common::{Outcome, SCRIPTED, Script, TestPool, TestSinks, registry};
use fieldpoll_channel::{CommParams, FinalState};
use fieldpoll_service::{
    FailureKind, Priority, RunState, RunSummary, Scheduler, SchedulerConfig, Season, ServiceError,
    SessionState, Target, TargetId,
};
use std::time::Duration;
use tokio::time::timeout;

fn target(id: &str, priority: u8) -> Target {
    Target::new(id, format!("Station {}", id), SCRIPTED, CommParams::new(id))
        .with_priority(Priority::new(priority))
}

fn fast_config() -> SchedulerConfig {
    SchedulerConfig::default()
        .with_pause_interval(Duration::from_millis(5))
        .with_wedge_check_interval(Duration::from_millis(10))
        .with_drain_timeout(Duration::from_secs(2))
}

async fn run(scheduler: &Scheduler) -> RunSummary {
    scheduler.start().unwrap();
    timeout(Duration::from_secs(10), scheduler.wait())
        .await
        .expect("run did not finish")
        .unwrap()
}

#[tokio::test]
async fn test_priority_order_with_one_channel() {
    let script = Script::new(Outcome::Succeed);
    let pool = TestPool::new(1);
    let sinks = TestSinks::new();
    let scheduler = Scheduler::new(
        fast_config(),
        vec![target("LOW1", 3), target("HIGH", 1), target("LOW2", 3)],
        pool.clone(),
        registry(script.clone()),
        sinks.sinks(),
    )
    .unwrap();

    let summary = run(&scheduler).await;
    assert_eq!(summary.succeeded, 3);
    // Round-robin resumes just after the last pick.
    assert_eq!(script.order(), vec!["HIGH", "LOW2", "LOW1"]);
    assert_eq!(pool.peak(), 1);
    assert_eq!(sinks.data.payloads().len(), 3);
}

#[tokio::test]
async fn test_capacity_is_never_exceeded() {
    let script = Script::new(Outcome::Slow);
    let pool = TestPool::new(2);
    let sinks = TestSinks::new();
    let targets = (0..8).map(|i| target(&format!("S{}", i), 3)).collect();
    let scheduler = Scheduler::new(
        fast_config(),
        targets,
        pool.clone(),
        registry(script),
        sinks.sinks(),
    )
    .unwrap();

    let summary = run(&scheduler).await;
    assert_eq!(summary.succeeded, 8);
    assert!(pool.peak() <= 2);
    assert_eq!(pool.in_use(), 0);
    assert!(pool.is_closed());
    assert!(scheduler.metrics().snapshot().allocation_misses > 0);
}

#[tokio::test]
async fn test_failed_attempt_is_retried() {
    let script = Script::new(Outcome::Succeed);
    script.push("KBOI", &[Outcome::FailLogin]);
    let pool = TestPool::new(1);
    let sinks = TestSinks::new();
    let scheduler = Scheduler::new(
        fast_config(),
        vec![target("KBOI", 2)],
        pool.clone(),
        registry(script.clone()),
        sinks.sinks(),
    )
    .unwrap();

    let summary = run(&scheduler).await;
    assert_eq!(summary.succeeded, 1);
    assert_eq!(script.order().len(), 2);
    assert!(sinks.escalation.reasons().is_empty());

    let sessions = scheduler.sessions().await;
    assert_eq!(sessions[0].attempts, 2);
    assert_eq!(sessions[0].state, SessionState::Success);

    let releases = pool.releases();
    assert_eq!(releases.len(), 2);
    assert_eq!(releases[0].state, FinalState::Failed);
    assert_eq!(releases[1].state, FinalState::Success);
    assert_eq!(scheduler.metrics().snapshot().sessions_retried, 1);

    // The successful retry clears the failure left by the first attempt.
    let status = sinks.status.get(&TargetId::new("KBOI")).unwrap();
    assert!(status.last_failure.is_none());
    assert!(status.annotation.is_none());
    assert!(status.last_error.is_some());
    assert!(status.last_contact.is_some());
}

#[tokio::test]
async fn test_panicking_handler_fails_the_attempt() {
    let script = Script::new(Outcome::Succeed);
    script.push("KPAN", &[Outcome::Panic]);
    let pool = TestPool::new(1);
    let sinks = TestSinks::new();
    let scheduler = Scheduler::new(
        fast_config().with_max_attempts(1),
        vec![target("KPAN", 1), target("KBOI", 3)],
        pool.clone(),
        registry(script.clone()),
        sinks.sinks(),
    )
    .unwrap();

    let summary = run(&scheduler).await;
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.succeeded, 1);
    assert_eq!(pool.in_use(), 0);
    assert_eq!(pool.releases().len(), 2);
    assert_eq!(sinks.escalation.reasons().len(), 1);

    let status = sinks.status.get(&TargetId::new("KPAN")).unwrap();
    assert_eq!(status.last_failure, Some(FailureKind::Protocol));
    assert!(status.annotation.unwrap().contains("panicked"));
}

#[tokio::test]
async fn test_exhaustion_escalates_once() {
    let script = Script::new(Outcome::FailRetrieve);
    let pool = TestPool::new(2);
    let sinks = TestSinks::new();
    let scheduler = Scheduler::new(
        fast_config().with_max_attempts(3),
        vec![target("KBOI", 1)],
        pool.clone(),
        registry(script.clone()),
        sinks.sinks(),
    )
    .unwrap();

    let summary = run(&scheduler).await;
    assert_eq!(summary.failed, 1);
    assert_eq!(script.order().len(), 3);

    let reasons = sinks.escalation.reasons();
    assert_eq!(reasons.len(), 1);
    assert!(reasons[0].contains("KBOI"));

    let sessions = scheduler.sessions().await;
    assert_eq!(sessions[0].attempts, 3);
    assert!(sessions[0].attempts <= sessions[0].max_attempts);

    let status = sinks.status.get(&TargetId::new("KBOI")).unwrap();
    assert_eq!(status.last_failure, Some(FailureKind::Protocol));
    assert!(status.last_error.is_some());
    // Retrieval never completed.
    assert!(status.last_contact.is_none());
}

#[tokio::test]
async fn test_dial_failure_is_a_connect_error() {
    let script = Script::new(Outcome::Succeed);
    let pool = TestPool::new(1);
    pool.unreachable("KDOWN");
    let sinks = TestSinks::new();
    let scheduler = Scheduler::new(
        fast_config().with_max_attempts(2),
        vec![target("KDOWN", 3)],
        pool.clone(),
        registry(script),
        sinks.sinks(),
    )
    .unwrap();

    let summary = run(&scheduler).await;
    assert_eq!(summary.failed, 1);
    let releases = pool.releases();
    assert_eq!(releases.len(), 2);
    assert!(releases.iter().all(|r| r.was_connect_error));

    let status = sinks.status.get(&TargetId::new("KDOWN")).unwrap();
    assert_eq!(status.last_failure, Some(FailureKind::Dial));
}

#[tokio::test]
async fn test_unknown_logger_is_a_configuration_failure() {
    let script = Script::new(Outcome::Succeed);
    let pool = TestPool::new(1);
    let sinks = TestSinks::new();
    let odd = Target::new("KODD", "Odd", "unheard-of", CommParams::new("KODD"));
    let scheduler = Scheduler::new(
        fast_config().with_max_attempts(1),
        vec![odd],
        pool.clone(),
        registry(script),
        sinks.sinks(),
    )
    .unwrap();

    let summary = run(&scheduler).await;
    assert_eq!(summary.failed, 1);
    let status = sinks.status.get(&TargetId::new("KODD")).unwrap();
    assert_eq!(status.last_failure, Some(FailureKind::Configuration));
    assert!(!pool.releases()[0].was_connect_error);
}

#[tokio::test]
async fn test_successful_poll_updates_status() {
    let script = Script::new(Outcome::Succeed);
    let pool = TestPool::new(1);
    let sinks = TestSinks::new();
    let scheduler = Scheduler::new(
        fast_config(),
        vec![target("KBOI", 1)],
        pool,
        registry(script),
        sinks.sinks(),
    )
    .unwrap();

    run(&scheduler).await;
    let payloads = sinks.data.take();
    assert_eq!(payloads.len(), 1);
    assert_eq!(payloads[0].target, TargetId::new("KBOI"));
    assert_eq!(payloads[0].logger, SCRIPTED);
    assert_eq!(&payloads[0].data[..], b"DATA");
    assert!(!payloads[0].partial);

    let status = sinks.status.get(&TargetId::new("KBOI")).unwrap();
    assert!(status.last_contact.is_some());
    assert_eq!(status.last_contact, status.last_message);
    assert!(status.last_error.is_none());
}

#[tokio::test]
async fn test_partial_payload_only_on_final_attempt() {
    let script = Script::new(Outcome::Abnormal);
    let pool = TestPool::new(1);
    let sinks = TestSinks::new();
    let scheduler = Scheduler::new(
        fast_config().with_max_attempts(2),
        vec![target("KBOI", 1)],
        pool,
        registry(script),
        sinks.sinks(),
    )
    .unwrap();

    let summary = run(&scheduler).await;
    assert_eq!(summary.failed, 1);

    let payloads = sinks.data.take();
    let partial: Vec<_> = payloads.iter().filter(|p| p.partial).collect();
    let complete: Vec<_> = payloads.iter().filter(|p| !p.partial).collect();
    // Both attempts delivered their data before failing; only the last
    // one also handed over its partial payload.
    assert_eq!(complete.len(), 2);
    assert_eq!(partial.len(), 1);
    assert_eq!(&partial[0].data[..], b"PART");

    let status = sinks.status.get(&TargetId::new("KBOI")).unwrap();
    assert_eq!(status.last_failure, Some(FailureKind::Protocol));
    assert!(status.last_contact.is_some());
}

#[tokio::test]
async fn test_wedged_session_is_killed() {
    let script = Script::new(Outcome::Hang);
    let pool = TestPool::new(1);
    let sinks = TestSinks::new();
    let scheduler = Scheduler::new(
        fast_config()
            .with_max_attempts(1)
            .with_wedge_timeout(Duration::from_millis(50)),
        vec![target("KSTK", 1)],
        pool.clone(),
        registry(script),
        sinks.sinks(),
    )
    .unwrap();

    let summary = run(&scheduler).await;
    assert_eq!(summary.failed, 1);
    assert_eq!(scheduler.metrics().snapshot().sessions_wedged, 1);
    assert_eq!(pool.in_use(), 0);
    assert_eq!(sinks.escalation.reasons().len(), 1);

    let status = sinks.status.get(&TargetId::new("KSTK")).unwrap();
    assert_eq!(status.last_failure, Some(FailureKind::Protocol));
    assert!(status.annotation.unwrap().contains("wedged"));
}

#[tokio::test]
async fn test_shutdown_aborts_running_sessions() {
    let script = Script::new(Outcome::Hang);
    let pool = TestPool::new(2);
    let sinks = TestSinks::new();
    let scheduler = Scheduler::new(
        fast_config(),
        vec![target("A", 1), target("B", 2), target("C", 3)],
        pool.clone(),
        registry(script),
        sinks.sinks(),
    )
    .unwrap();

    scheduler.start().unwrap();
    let mut states = scheduler.subscribe();
    assert!(common::eventually(Duration::from_secs(2), || pool.in_use() == 2).await);

    scheduler.shutdown();
    let summary = timeout(Duration::from_secs(5), scheduler.wait())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(summary.unfinished, 3);
    assert_eq!(summary.total(), 3);
    assert_eq!(scheduler.run_state(), RunState::Stopped);
    assert_eq!(*states.borrow_and_update(), RunState::Stopped);
    assert_eq!(pool.in_use(), 0);
    assert!(pool.is_closed());
    // Aborted attempts with retries left are not escalated.
    assert!(sinks.escalation.reasons().is_empty());
}

#[tokio::test]
async fn test_out_of_season_targets_are_skipped() {
    let script = Script::new(Outcome::Succeed);
    let pool = TestPool::new(1);
    let sinks = TestSinks::new();
    let summer_only = target("KSUM", 1).with_season(Season::new((6, 1), (8, 31)));
    let scheduler = Scheduler::for_date(
        fast_config(),
        vec![summer_only, target("KALL", 3)],
        pool,
        registry(script.clone()),
        sinks.sinks(),
        NaiveDate::from_ymd_opt(2026, 1, 15).unwrap(),
    )
    .unwrap();
    assert_eq!(scheduler.out_of_season(), 1);

    let summary = run(&scheduler).await;
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.out_of_season, 1);
    assert_eq!(script.order(), vec!["KALL"]);
}

#[tokio::test]
async fn test_transcripts_are_written() {
    let dir = tempfile::tempdir().unwrap();
    let script = Script::new(Outcome::Succeed);
    let pool = TestPool::new(1);
    let sinks = TestSinks::new();
    let scheduler = Scheduler::new(
        fast_config().with_transcript_dir(dir.path()),
        vec![target("KBOI", 1)],
        pool,
        registry(script),
        sinks.sinks(),
    )
    .unwrap();

    run(&scheduler).await;
    let files: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();
    assert_eq!(files.len(), 1);
    let name = files[0].file_name().unwrap().to_string_lossy().to_string();
    assert!(name.starts_with("KBOI-") && name.ends_with(".log"));

    let text = std::fs::read_to_string(&files[0]).unwrap();
    assert!(text.starts_with("Session transcript for KBOI"));
    assert!(text.contains("SENT:\nLOGIN\r\n"));
    assert!(text.contains("DUMP\r\n"));
}

#[tokio::test]
async fn test_lifecycle_errors() {
    let scheduler = Scheduler::new(
        fast_config(),
        Vec::new(),
        TestPool::new(1),
        registry(Script::new(Outcome::Succeed)),
        TestSinks::new().sinks(),
    )
    .unwrap();
    assert_eq!(scheduler.run_state(), RunState::Idle);
    assert!(matches!(scheduler.wait().await, Err(ServiceError::NotRunning)));

    let summary = run(&scheduler).await;
    assert_eq!(summary.total(), 0);
    assert!(matches!(scheduler.start(), Err(ServiceError::AlreadyRunning)));

    let invalid = Scheduler::new(
        fast_config().with_max_attempts(0),
        Vec::new(),
        TestPool::new(1),
        registry(Script::new(Outcome::Succeed)),
        TestSinks::new().sinks(),
    );
    assert!(matches!(invalid, Err(ServiceError::InvalidConfig(_))));
}

#[tokio::test]
async fn test_session_records_start_waiting() {
    let scheduler = Scheduler::new(
        fast_config(),
        vec![target("A", 2), target("B", 9)],
        TestPool::new(1),
        registry(Script::new(Outcome::Succeed)),
        TestSinks::new().sinks(),
    )
    .unwrap();
    let sessions = scheduler.sessions().await;
    assert_eq!(sessions.len(), 2);
    assert!(sessions.iter().all(|s| s.state == SessionState::Waiting));
    assert_eq!(sessions[1].priority, Priority::LOWEST);
}
