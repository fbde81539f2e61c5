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

//! Listening scheduler tests over loopback TCP

mod common;

use common::{Outcome, SCRIPTED, Script, TestSinks, call_in, eventually, registry};
use fieldpoll_channel::{CommParams, ListeningConfig, ListeningPool};
use fieldpoll_service::{
    FailureKind, ListenerAuth, ListeningScheduler, SchedulerConfig, Target, TargetId,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn stations() -> Vec<Target> {
    ["KBOI", "KSUN", "KPIH"]
        .into_iter()
        .map(|id| Target::new(id, format!("Station {}", id), SCRIPTED, CommParams::default()))
        .collect()
}

fn fast_config() -> SchedulerConfig {
    SchedulerConfig::default()
        .with_pause_interval(Duration::from_millis(10))
        .with_drain_timeout(Duration::from_secs(2))
}

async fn start(
    max_concurrent: usize,
    script: Arc<Script>,
    sinks: &TestSinks,
) -> (ListeningScheduler, SocketAddr) {
    start_with(fast_config(), max_concurrent, script, sinks).await
}

async fn start_with(
    config: SchedulerConfig,
    max_concurrent: usize,
    script: Arc<Script>,
    sinks: &TestSinks,
) -> (ListeningScheduler, SocketAddr) {
    let pool_config =
        ListeningConfig::new(([127, 0, 0, 1], 0).into()).with_max_concurrent(max_concurrent);
    let pool = Arc::new(ListeningPool::bind(pool_config).await.unwrap());
    let scheduler = ListeningScheduler::new(
        config,
        ListenerAuth::default()
            .with_password("secret")
            .with_response_timeout(Duration::from_secs(2)),
        pool,
        stations(),
        registry(script),
        sinks.sinks(),
    )
    .unwrap();
    scheduler.start().unwrap();
    let addr = scheduler.local_addr();
    (scheduler, addr)
}

/// Read until the server closes the connection
async fn read_to_close(stream: &mut TcpStream) -> String {
    let mut received = Vec::new();
    timeout(WAIT, stream.read_to_end(&mut received))
        .await
        .expect("server never closed the connection")
        .unwrap();
    String::from_utf8_lossy(&received).to_string()
}

#[tokio::test]
async fn test_identified_station_is_polled() {
    let script = Script::new(Outcome::Succeed);
    let sinks = TestSinks::new();
    let (scheduler, addr) = start(2, script.clone(), &sinks).await;

    let mut station = call_in(addr, Some("secret"), "kboi").await;
    assert!(eventually(WAIT, || sinks.data.payloads().len() == 1).await);

    let received = read_to_close(&mut station).await;
    assert!(received.starts_with("Password: "));
    assert!(received.contains("LOGIN\r\n"));
    assert!(received.contains("DUMP\r\n"));

    let payload = &sinks.data.payloads()[0];
    assert_eq!(payload.target, TargetId::new("KBOI"));
    assert!(sinks.status.get(&TargetId::new("KBOI")).unwrap().last_contact.is_some());
    assert_eq!(script.order(), vec!["KBOI"]);

    scheduler.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_wrong_password_is_refused() {
    let script = Script::new(Outcome::Succeed);
    let sinks = TestSinks::new();
    let (scheduler, addr) = start(2, script.clone(), &sinks).await;

    let mut station = call_in(addr, Some("guess"), "KBOI").await;
    let received = read_to_close(&mut station).await;
    assert_eq!(received, "Password: ");
    assert!(script.order().is_empty());
    assert!(eventually(WAIT, || scheduler.metrics().snapshot().channels_refused == 1).await);

    scheduler.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unknown_station_is_refused() {
    let script = Script::new(Outcome::Succeed);
    let sinks = TestSinks::new();
    let (scheduler, addr) = start(2, script.clone(), &sinks).await;

    let mut station = call_in(addr, Some("secret"), "KXXX").await;
    read_to_close(&mut station).await;
    assert!(script.order().is_empty());
    assert!(sinks.data.payloads().is_empty());
    assert!(eventually(WAIT, || scheduler.active_count() == 0).await);

    scheduler.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_full_pool_refuses_new_stations() {
    let script = Script::new(Outcome::Succeed);
    script.push("KBOI", &[Outcome::Hang]);
    let sinks = TestSinks::new();
    let (scheduler, addr) = start(1, script.clone(), &sinks).await;

    let _busy = call_in(addr, Some("secret"), "KBOI").await;
    assert!(eventually(WAIT, || scheduler.active_targets().len() == 1).await);
    assert_eq!(scheduler.active_count(), 1);

    let mut late = TcpStream::connect(addr).await.unwrap();
    let received = read_to_close(&mut late).await;
    // Refused before the handshake, so not even a password prompt.
    assert!(received.is_empty());
    assert!(eventually(WAIT, || scheduler.metrics().snapshot().channels_refused == 1).await);
    assert_eq!(scheduler.active_count(), 1);

    scheduler.shutdown().await.unwrap();
    assert_eq!(scheduler.active_count(), 0);
    // The aborted session was its target's only attempt.
    assert_eq!(sinks.escalation.reasons().len(), 1);
}

#[tokio::test]
async fn test_station_already_running_is_refused() {
    let script = Script::new(Outcome::Succeed);
    script.push("KBOI", &[Outcome::Hang]);
    let sinks = TestSinks::new();
    let (scheduler, addr) = start(3, script.clone(), &sinks).await;

    let _first = call_in(addr, Some("secret"), "KBOI").await;
    assert!(eventually(WAIT, || scheduler.active_targets() == vec![TargetId::new("KBOI")]).await);

    let mut second = call_in(addr, Some("secret"), "KBOI").await;
    let received = read_to_close(&mut second).await;
    assert_eq!(received, "Password: ");
    assert_eq!(script.order(), vec!["KBOI"]);
    assert!(eventually(WAIT, || scheduler.active_count() == 1).await);

    scheduler.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_wedged_station_is_killed() {
    let script = Script::new(Outcome::Hang);
    let sinks = TestSinks::new();
    let config = fast_config()
        .with_wedge_timeout(Duration::from_millis(50))
        .with_wedge_check_interval(Duration::from_millis(10));
    let (scheduler, addr) = start_with(config, 2, script.clone(), &sinks).await;

    let _station = call_in(addr, Some("secret"), "KPIH").await;
    assert!(eventually(WAIT, || scheduler.metrics().snapshot().sessions_wedged == 1).await);
    assert!(eventually(WAIT, || scheduler.active_count() == 0).await);
    assert!(eventually(WAIT, || sinks.escalation.reasons().len() == 1).await);

    let status = sinks.status.get(&TargetId::new("KPIH")).unwrap();
    assert_eq!(status.last_failure, Some(FailureKind::Protocol));

    scheduler.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_panicking_session_frees_its_slot() {
    let script = Script::new(Outcome::Succeed);
    script.push("KBOI", &[Outcome::Panic]);
    let sinks = TestSinks::new();
    let (scheduler, addr) = start(1, script.clone(), &sinks).await;

    let mut first = call_in(addr, Some("secret"), "KBOI").await;
    read_to_close(&mut first).await;
    assert!(eventually(WAIT, || scheduler.active_count() == 0).await);
    assert!(eventually(WAIT, || sinks.escalation.reasons().len() == 1).await);
    let status = sinks.status.get(&TargetId::new("KBOI")).unwrap();
    assert_eq!(status.last_failure, Some(FailureKind::Protocol));

    // The only slot is free again for the next station.
    let _second = call_in(addr, Some("secret"), "KSUN").await;
    assert!(eventually(WAIT, || sinks.data.payloads().len() == 1).await);
    assert_eq!(sinks.data.payloads()[0].target, TargetId::new("KSUN"));
    assert_eq!(script.order(), vec!["KBOI", "KSUN"]);

    scheduler.shutdown().await.unwrap();
}
