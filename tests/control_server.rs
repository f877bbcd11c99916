// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Drives the control server over loopback TCP the way the parent
//! supervisor would.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::time;

use migrate_sender::migrate::VmPayload;
use migrate_sender::server::{ControlServer, Worker};

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

fn test_log() -> slog::Logger {
    slog::Logger::root(slog::Discard, slog::o!())
}

fn test_worker() -> Arc<Worker> {
    Worker::new(
        test_log(),
        VmPayload {
            uuid: "8029851a-ac02-4b23-ac45-8fa0b3c040cb".to_string(),
            zfs_filesystem: "zones/8029851a".to_string(),
            brand: "bhyve".to_string(),
            disks: vec![],
        },
        None,
    )
}

struct Client {
    lines: tokio::io::Lines<BufReader<OwnedReadHalf>>,
    writer: tokio::net::tcp::OwnedWriteHalf,
}

impl Client {
    async fn connect(server: &ControlServer) -> Client {
        let sock = TcpStream::connect(server.local_addr()).await.unwrap();
        let (rd, writer) = sock.into_split();
        Client { lines: BufReader::new(rd).lines(), writer }
    }

    async fn send_raw(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
    }

    async fn send(&mut self, event: Value) {
        self.send_raw(&event.to_string()).await;
    }

    async fn recv(&mut self) -> Value {
        let line = time::timeout(
            Duration::from_secs(10),
            self.lines.next_line(),
        )
        .await
        .expect("timed out waiting for a control event")
        .unwrap()
        .expect("control connection closed unexpectedly");
        serde_json::from_str(&line).unwrap()
    }
}

#[tokio::test]
async fn ping_reports_pid_and_version() {
    let worker = test_worker();
    let server = ControlServer::bind(LOCALHOST).await.unwrap();
    let mut client = Client::connect(&server).await;
    let serve = tokio::spawn(
        server.serve(Arc::clone(&worker), Duration::from_secs(10)),
    );

    client
        .send(json!({"type": "request", "command": "ping", "eventId": 1}))
        .await;
    let resp = client.recv().await;
    assert_eq!(resp["type"], "response");
    assert_eq!(resp["command"], "ping");
    assert_eq!(resp["eventId"], 1);
    assert_eq!(resp["pid"].as_u64(), Some(std::process::id() as u64));
    assert!(resp["version"].as_str().is_some());

    worker.shutdown();
    serve.await.unwrap();
}

#[tokio::test]
async fn set_record_replaces_worker_state() {
    let worker = test_worker();
    let server = ControlServer::bind(LOCALHOST).await.unwrap();
    let mut client = Client::connect(&server).await;
    let serve = tokio::spawn(
        server.serve(Arc::clone(&worker), Duration::from_secs(10)),
    );

    let record = json!({
        "vm_uuid": "AAA",
        "target_vm_uuid": "BBB",
        "num_sync_phases": 2,
        "progress_history": [
            {"phase": "sync", "state": "success"},
            {"phase": "sync", "state": "running"}
        ]
    });
    client
        .send(json!({
            "type": "request",
            "command": "set-record",
            "eventId": 4,
            "record": record,
        }))
        .await;
    let resp = client.recv().await;
    assert_eq!(resp["type"], "response");
    assert_eq!(resp["command"], "set-record");
    assert_eq!(resp["eventId"], 4);

    {
        let held = worker.record.lock().unwrap();
        let held = held.as_ref().expect("record should be set");
        assert_eq!(held.vm_uuid, "AAA");
        assert_eq!(held.target_vm_uuid, "BBB");
        assert_eq!(held.num_sync_phases, 2);
    }

    worker.shutdown();
    serve.await.unwrap();
}

#[tokio::test]
async fn malformed_lines_do_not_break_the_connection() {
    let worker = test_worker();
    let server = ControlServer::bind(LOCALHOST).await.unwrap();
    let mut client = Client::connect(&server).await;
    let serve = tokio::spawn(
        server.serve(Arc::clone(&worker), Duration::from_secs(10)),
    );

    client.send_raw("this is not json").await;
    client
        .send(json!({"type": "request", "command": "ping", "eventId": 9}))
        .await;
    let resp = client.recv().await;
    assert_eq!(resp["command"], "ping");
    assert_eq!(resp["eventId"], 9);

    worker.shutdown();
    serve.await.unwrap();
}

#[tokio::test]
async fn unknown_commands_are_not_implemented() {
    let worker = test_worker();
    let server = ControlServer::bind(LOCALHOST).await.unwrap();
    let mut client = Client::connect(&server).await;
    let serve = tokio::spawn(
        server.serve(Arc::clone(&worker), Duration::from_secs(10)),
    );

    client
        .send(json!({
            "type": "request",
            "command": "frobnicate",
            "eventId": 2,
        }))
        .await;
    let resp = client.recv().await;
    assert_eq!(resp["type"], "error");
    assert_eq!(resp["command"], "frobnicate");
    assert_eq!(resp["eventId"], 2);
    assert_eq!(resp["message"], "Not Implemented");

    worker.shutdown();
    serve.await.unwrap();
}

#[tokio::test]
async fn watch_subscribes_to_progress_broadcasts() {
    let worker = test_worker();
    let server = ControlServer::bind(LOCALHOST).await.unwrap();
    let mut client = Client::connect(&server).await;
    let serve = tokio::spawn(
        server.serve(Arc::clone(&worker), Duration::from_secs(10)),
    );

    client
        .send(json!({"type": "request", "command": "watch", "eventId": 1}))
        .await;
    let ack = client.recv().await;
    assert_eq!(ack["type"], "response");
    assert_eq!(ack["command"], "watch");

    // Move the counters; the watcher broadcasts on its next tick.
    worker.progress.add_total(1000);
    worker.progress.set_current(250);

    let progress = client.recv().await;
    assert_eq!(progress["type"], "progress");
    assert_eq!(progress["phase"], "sync");
    assert_eq!(progress["state"], "running");
    assert_eq!(progress["current_progress"], 250);
    assert_eq!(progress["total_progress"], 1000);
    assert_eq!(progress["store"], false);

    worker.shutdown();
    serve.await.unwrap();
}

#[tokio::test]
async fn stop_acknowledges_and_closes_everything() {
    let worker = test_worker();
    let server = ControlServer::bind(LOCALHOST).await.unwrap();
    let mut client = Client::connect(&server).await;
    let serve = tokio::spawn(
        server.serve(Arc::clone(&worker), Duration::from_secs(10)),
    );

    client
        .send(json!({"type": "request", "command": "stop", "eventId": 3}))
        .await;
    let resp = client.recv().await;
    assert_eq!(resp["type"], "response");
    assert_eq!(resp["command"], "stop");
    assert_eq!(resp["eventId"], 3);

    // The listener closes and the worker winds down.
    time::timeout(Duration::from_secs(10), serve)
        .await
        .expect("server should close after stop")
        .unwrap();
    assert!(worker.check_stop().is_err());

    let eof = time::timeout(Duration::from_secs(10), client.lines.next_line())
        .await
        .expect("connection should close after stop")
        .unwrap();
    assert!(eof.is_none());
}

#[tokio::test]
async fn startup_timeout_without_supervisor_ends_the_worker() {
    let worker = test_worker();
    let server = ControlServer::bind(LOCALHOST).await.unwrap();
    let serve = tokio::spawn(
        server.serve(Arc::clone(&worker), Duration::from_millis(100)),
    );
    time::timeout(Duration::from_secs(10), serve)
        .await
        .expect("server should give up waiting")
        .unwrap();
    assert!(worker.check_stop().is_err());
}
