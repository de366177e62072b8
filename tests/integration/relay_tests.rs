//! Relay endpoints over a real local socket.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use interprocess::local_socket::tokio::{prelude::*, Stream};
use interprocess::local_socket::{GenericNamespaced, ToNsName};
use serial_test::serial;
use slack_kernel_relay::models::envelope::Envelope;
use slack_kernel_relay::models::identity::Identity;
use slack_kernel_relay::relay::{RelayEndpoint, RelayHandler, Role};
use slack_kernel_relay::AppError;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Forwards every received envelope to a channel.
struct Recorder(mpsc::UnboundedSender<(Identity, Envelope)>);

impl RelayHandler for Recorder {
    fn on_receive(
        &self,
        from: Identity,
        envelope: Envelope,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        let _ = self.0.send((from, envelope));
        Box::pin(async {})
    }
}

fn relay_name() -> String {
    format!("skr-test-{}", uuid::Uuid::new_v4())
}

fn spawn_endpoint(
    endpoint: RelayEndpoint,
    ct: CancellationToken,
) -> (
    mpsc::UnboundedReceiver<(Identity, Envelope)>,
    tokio::task::JoinHandle<slack_kernel_relay::Result<()>>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(async move { endpoint.run(&Recorder(tx), ct).await });
    (rx, handle)
}

async fn next(rx: &mut mpsc::UnboundedReceiver<(Identity, Envelope)>) -> (Identity, Envelope) {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("envelope delivered in time")
        .expect("handler channel open")
}

#[tokio::test]
#[serial]
async fn envelopes_flow_both_ways() {
    let name = relay_name();
    let ct = CancellationToken::new();
    let front = RelayEndpoint::connect(Identity::FrontEnd, Role::Listener, name.clone()).unwrap();
    let manager = RelayEndpoint::connect(Identity::KernelManager, Role::Connector, name).unwrap();
    let front_tx = front.sender();
    let manager_tx = manager.sender();
    let (mut front_rx, front_task) = spawn_endpoint(front, ct.clone());
    let (mut manager_rx, manager_task) = spawn_endpoint(manager, ct.clone());

    manager_tx.send(Envelope::status(Some("ready".into())), Identity::FrontEnd);
    assert_eq!(
        next(&mut front_rx).await,
        (Identity::KernelManager, Envelope::status(Some("ready".into())))
    );

    front_tx.send(Envelope::execute("1 + 1"), Identity::KernelManager);
    assert_eq!(
        next(&mut manager_rx).await,
        (Identity::FrontEnd, Envelope::execute("1 + 1"))
    );

    ct.cancel();
    front_task.await.unwrap().unwrap();
    manager_task.await.unwrap().unwrap();
}

#[tokio::test]
#[serial]
async fn messages_sent_before_connect_are_buffered() {
    let name = relay_name();
    let ct = CancellationToken::new();
    let front = RelayEndpoint::connect(Identity::FrontEnd, Role::Listener, name.clone()).unwrap();
    let front_tx = front.sender();
    let (_front_rx, front_task) = spawn_endpoint(front, ct.clone());

    front_tx.send(Envelope::execute("early"), Identity::KernelManager);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let manager = RelayEndpoint::connect(Identity::KernelManager, Role::Connector, name).unwrap();
    let (mut manager_rx, manager_task) = spawn_endpoint(manager, ct.clone());

    assert_eq!(
        next(&mut manager_rx).await,
        (Identity::FrontEnd, Envelope::execute("early"))
    );

    ct.cancel();
    front_task.await.unwrap().unwrap();
    manager_task.await.unwrap().unwrap();
}

#[tokio::test]
#[serial]
async fn expired_messages_are_dropped() {
    let name = relay_name();
    let ct = CancellationToken::new();
    let front = RelayEndpoint::connect(Identity::FrontEnd, Role::Listener, name.clone()).unwrap();
    let front_tx = front.sender();
    let (_front_rx, front_task) = spawn_endpoint(front, ct.clone());

    front_tx.send(
        Envelope::execute("stale").with_ttl(Duration::ZERO),
        Identity::KernelManager,
    );
    front_tx.send(Envelope::execute("fresh"), Identity::KernelManager);

    let manager = RelayEndpoint::connect(Identity::KernelManager, Role::Connector, name).unwrap();
    let (mut manager_rx, manager_task) = spawn_endpoint(manager, ct.clone());

    assert_eq!(
        next(&mut manager_rx).await,
        (Identity::FrontEnd, Envelope::execute("fresh"))
    );

    ct.cancel();
    front_task.await.unwrap().unwrap();
    manager_task.await.unwrap().unwrap();
    assert!(manager_rx.try_recv().is_err());
}

/// Raw client on `name` that writes `lines` as-is.
async fn raw_client(name: &str, lines: &[&str]) -> Stream {
    let mut stream = Stream::connect(name.to_ns_name::<GenericNamespaced>().unwrap())
        .await
        .unwrap();
    for line in lines {
        stream.write_all(line.as_bytes()).await.unwrap();
        stream.write_all(b"\n").await.unwrap();
    }
    stream.flush().await.unwrap();
    stream
}

#[tokio::test]
#[serial]
async fn misaddressed_and_unknown_sender_frames_are_dropped() {
    let name = relay_name();
    let ct = CancellationToken::new();
    let front = RelayEndpoint::connect(Identity::FrontEnd, Role::Listener, name.clone()).unwrap();
    let (mut front_rx, front_task) = spawn_endpoint(front, ct.clone());

    let _client = raw_client(
        &name,
        &[
            r#"{"frame":"hello","from":"kernel_manager"}"#,
            r#"{"frame":"message","from":"kernel_manager","to":"nobody","ttl":600,"payload":{"type":"message","value":"misaddressed"}}"#,
            r#"{"frame":"message","from":"intruder","to":"main","ttl":600,"payload":{"type":"message","value":"spoofed"}}"#,
            r#"{"frame":"message","from":"kernel_manager","to":"main","ttl":600,"payload":{"type":"message","value":"ok"}}"#,
        ],
    )
    .await;

    assert_eq!(
        next(&mut front_rx).await,
        (Identity::KernelManager, Envelope::message("ok"))
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(front_rx.try_recv().is_err());

    ct.cancel();
    front_task.await.unwrap().unwrap();
}

#[tokio::test]
#[serial]
async fn frames_before_hello_are_dropped() {
    let name = relay_name();
    let ct = CancellationToken::new();
    let front = RelayEndpoint::connect(Identity::FrontEnd, Role::Listener, name.clone()).unwrap();
    let (mut front_rx, front_task) = spawn_endpoint(front, ct.clone());

    let _client = raw_client(
        &name,
        &[
            r#"{"frame":"message","from":"kernel_manager","to":"main","ttl":600,"payload":{"type":"message","value":"early"}}"#,
            r#"{"frame":"hello","from":"kernel_manager"}"#,
            r#"{"frame":"message","from":"kernel_manager","to":"main","ttl":600,"payload":{"type":"message","value":"late"}}"#,
        ],
    )
    .await;

    assert_eq!(
        next(&mut front_rx).await,
        (Identity::KernelManager, Envelope::message("late"))
    );

    ct.cancel();
    front_task.await.unwrap().unwrap();
}

#[tokio::test]
#[serial]
async fn stray_connections_do_not_displace_the_peer() {
    let name = relay_name();
    let ct = CancellationToken::new();
    let front = RelayEndpoint::connect(Identity::FrontEnd, Role::Listener, name.clone()).unwrap();
    let manager = RelayEndpoint::connect(Identity::KernelManager, Role::Connector, name.clone()).unwrap();
    let front_tx = front.sender();
    let manager_tx = manager.sender();
    let (mut front_rx, front_task) = spawn_endpoint(front, ct.clone());
    let (mut manager_rx, manager_task) = spawn_endpoint(manager, ct.clone());

    manager_tx.send(Envelope::status(Some("ready".into())), Identity::FrontEnd);
    next(&mut front_rx).await;

    let _silent = raw_client(&name, &[]).await;
    let _impostor = raw_client(&name, &[r#"{"frame":"hello","from":"main"}"#]).await;
    let _unknown = raw_client(&name, &[r#"{"frame":"hello","from":"intruder"}"#]).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    front_tx.send(Envelope::execute("still here"), Identity::KernelManager);
    assert_eq!(
        next(&mut manager_rx).await,
        (Identity::FrontEnd, Envelope::execute("still here"))
    );

    ct.cancel();
    front_task.await.unwrap().unwrap();
    manager_task.await.unwrap().unwrap();
}

#[tokio::test]
#[serial]
async fn second_listener_on_same_name_fails() {
    let name = relay_name();
    let _first = RelayEndpoint::connect(Identity::FrontEnd, Role::Listener, name.clone()).unwrap();
    let err = RelayEndpoint::connect(Identity::FrontEnd, Role::Listener, name)
        .err()
        .expect("name already bound");
    assert!(matches!(err, AppError::Relay(_)));
}

#[test]
fn sender_outlives_its_loop_without_panicking() {
    let (sender, rx) = slack_kernel_relay::relay::RelaySender::unbound(Identity::FrontEnd);
    drop(rx);
    sender.send(Envelope::flush(), Identity::KernelManager);
    assert_eq!(sender.identity(), Identity::FrontEnd);
}
