//! End-to-end tests over a real socket.

use std::path::PathBuf;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use super::*;
use crate::client::{Client, ClientEvent};
use crate::coord::InstanceKey;

const WAIT: Duration = Duration::from_secs(5);

struct Harness {
    _dir: TempDir,
    path: PathBuf,
    shutdown: CancellationToken,
    server: JoinHandle<()>,
}

impl Harness {
    fn start() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("instanced.sock");
        let server = Server::bind(&path).unwrap();
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(server.run(shutdown.clone()));
        Self {
            _dir: dir,
            path,
            shutdown,
            server,
        }
    }

    /// Connect and subscribe a client whose offers are answered with
    /// `accept_main`. Returns what the client observes.
    async fn client(&self, session: &str, accept_main: bool) -> (Client, UnboundedReceiver<Seen>) {
        let (client, events) = Client::connect(&self.path).await.unwrap();
        client.subscribe(session).await.unwrap();
        (client, observe(events, accept_main))
    }

    async fn stop(self) {
        self.shutdown.cancel();
        timeout(WAIT, self.server).await.unwrap().unwrap();
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Seen {
    Offer(InstanceKey),
    Executed(Vec<u8>),
}

fn observe(mut events: UnboundedReceiver<ClientEvent>, accept_main: bool) -> UnboundedReceiver<Seen> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let seen = match event {
                ClientEvent::SetMain { instance, reply } => {
                    if accept_main {
                        reply.accept();
                    } else {
                        reply.decline();
                    }
                    Seen::Offer(instance)
                }
                ClientEvent::Execute { payload } => Seen::Executed(payload),
            };
            let _ = tx.send(seen);
        }
    });
    rx
}

async fn next(seen: &mut UnboundedReceiver<Seen>) -> Seen {
    timeout(WAIT, seen.recv()).await.unwrap().unwrap()
}

async fn quiet(seen: &mut UnboundedReceiver<Seen>) {
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(seen.try_recv().is_err(), "unexpected event");
}

#[tokio::test]
async fn scenario_over_socket() {
    let harness = Harness::start();
    let (a, mut a_seen) = harness.client("u1", true).await;
    let (b, mut b_seen) = harness.client("u1", false).await;
    let (c, mut c_seen) = harness.client("u1", true).await;

    a.push_instance(InstanceKey(1)).await.unwrap();
    b.push_instance(InstanceKey(2)).await.unwrap();
    c.push_instance(InstanceKey(3)).await.unwrap();

    assert!(!a.is_main_process().await.unwrap());
    assert!(!b.is_main_process().await.unwrap());
    assert!(c.is_main_process().await.unwrap());
    assert_eq!(c.total_instance_count().await.unwrap(), 3);

    c.delete_instance(InstanceKey(3)).await.unwrap();

    assert_eq!(next(&mut b_seen).await, Seen::Offer(InstanceKey(2)));
    assert_eq!(next(&mut a_seen).await, Seen::Offer(InstanceKey(1)));
    assert!(a.is_main_process().await.unwrap());
    assert!(!b.is_main_process().await.unwrap());
    assert!(!c.is_main_process().await.unwrap());
    assert_eq!(a.total_instance_count().await.unwrap(), 1);
    quiet(&mut c_seen).await;

    harness.stop().await;
}

#[tokio::test]
async fn broadcast_over_socket_skips_sender() {
    let harness = Harness::start();
    let (a, mut a_seen) = harness.client("u1", true).await;
    let (_b, mut b_seen) = harness.client("u1", true).await;
    let (_c, mut c_seen) = harness.client("u1", true).await;
    let (_other, mut other_seen) = harness.client("u2", true).await;

    a.broadcast(b"reload-theme").await.unwrap();

    assert_eq!(next(&mut b_seen).await, Seen::Executed(b"reload-theme".to_vec()));
    assert_eq!(next(&mut c_seen).await, Seen::Executed(b"reload-theme".to_vec()));
    quiet(&mut a_seen).await;
    quiet(&mut b_seen).await;
    quiet(&mut other_seen).await;

    harness.stop().await;
}

#[tokio::test]
async fn execute_is_forwarded_to_main() {
    let harness = Harness::start();
    let (main, mut main_seen) = harness.client("u1", true).await;
    let (other, mut other_seen) = harness.client("u1", true).await;
    main.push_instance(InstanceKey(7)).await.unwrap();

    assert!(main.execute_on_main_process(b"open-folder").await.unwrap());
    assert!(!other.execute_on_main_process(b"open-folder").await.unwrap());

    assert_eq!(next(&mut main_seen).await, Seen::Executed(b"open-folder".to_vec()));
    quiet(&mut main_seen).await;
    quiet(&mut other_seen).await;

    harness.stop().await;
}

#[tokio::test]
async fn closed_main_is_replaced() {
    let harness = Harness::start();
    let (a, mut a_seen) = harness.client("u1", true).await;
    let (b, _b_seen) = harness.client("u1", true).await;
    a.push_instance(InstanceKey(1)).await.unwrap();
    b.push_instance(InstanceKey(2)).await.unwrap();

    drop(b);

    // The server notices the closed connection on the next touch.
    let mut elected = false;
    for _ in 0..100 {
        if a.is_main_process().await.unwrap() {
            elected = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(elected);
    assert_eq!(next(&mut a_seen).await, Seen::Offer(InstanceKey(1)));
    assert_eq!(a.total_instance_count().await.unwrap(), 1);

    harness.stop().await;
}

#[tokio::test]
async fn offer_handler_may_call_back() {
    let harness = Harness::start();
    let (a, mut events) = Client::connect(&harness.path).await.unwrap();
    a.subscribe("u1").await.unwrap();
    let (b, _b_seen) = harness.client("u1", true).await;

    a.push_instance(InstanceKey(1)).await.unwrap();
    b.push_instance(InstanceKey(2)).await.unwrap();

    let a = std::sync::Arc::new(a);
    let handler = {
        let a = a.clone();
        tokio::spawn(async move {
            let Some(ClientEvent::SetMain { reply, .. }) = events.recv().await else {
                panic!("expected an offer");
            };
            // Still B's instance count while the election is in flight.
            let count = a.total_instance_count().await.unwrap();
            reply.accept();
            count
        })
    };

    b.delete_instance(InstanceKey(2)).await.unwrap();

    assert_eq!(timeout(WAIT, handler).await.unwrap().unwrap(), 1);
    assert!(a.is_main_process().await.unwrap());

    harness.stop().await;
}

#[tokio::test]
async fn socket_is_private_to_owner() {
    use std::os::unix::fs::PermissionsExt;

    let harness = Harness::start();
    let mode = std::fs::metadata(&harness.path).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o600);
    harness.stop().await;
}

#[tokio::test]
async fn execute_from_fresh_client_is_not_main() {
    let harness = Harness::start();
    let (main, mut main_seen) = harness.client("u1", true).await;
    main.push_instance(InstanceKey(3)).await.unwrap();

    // A one-shot client with no instances of its own.
    let (cli, _events) = Client::connect(&harness.path).await.unwrap();
    cli.subscribe("u1").await.unwrap();
    assert!(!cli.execute_on_main_process(b"focus").await.unwrap());
    assert_eq!(next(&mut main_seen).await, Seen::Executed(b"focus".to_vec()));

    // With nobody holding the main role the call still reports false.
    main.delete_instance(InstanceKey(3)).await.unwrap();
    assert!(!cli.execute_on_main_process(b"focus").await.unwrap());
    quiet(&mut main_seen).await;

    harness.stop().await;
}

#[tokio::test]
async fn bind_refuses_live_socket_and_replaces_stale_one() {
    let harness = Harness::start();
    assert!(matches!(
        Server::bind(&harness.path),
        Err(ServerError::AlreadyRunning(_))
    ));

    let path = harness.path.clone();
    let dir = tempfile::tempdir().unwrap();
    let stale = dir.path().join("stale.sock");
    // A socket file with nobody accepting on it.
    drop(std::os::unix::net::UnixListener::bind(&stale).unwrap());
    assert!(stale.exists());

    let server = Server::bind(&stale).unwrap();
    assert_eq!(server.path(), stale.as_path());
    drop(server);

    harness.stop().await;
    assert!(!path.exists(), "socket file removed on shutdown");
}

#[tokio::test]
async fn shutdown_disconnects_clients() {
    let harness = Harness::start();
    let (a, _a_seen) = harness.client("u1", true).await;

    harness.stop().await;

    let mut closed = false;
    for _ in 0..100 {
        if a.total_instance_count().await.is_err() {
            closed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(closed);
}
