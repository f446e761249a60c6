#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use huddle_domain::UserId;
use huddle_protocol::ServerEvent;
use huddle_store::SystemClock;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::server::sessions::{
	ConnId, ConnectionRegistry, ConnectionRegistryConfig, RegisterOutcome, SessionCommand, SessionHandle,
};

fn registry(preempt_ms: u64) -> ConnectionRegistry {
	ConnectionRegistry::new(
		ConnectionRegistryConfig {
			capacity: 8,
			preempt_window: Duration::from_millis(preempt_ms),
		},
		Arc::new(SystemClock),
	)
}

fn handle(conn_id: ConnId, user: &str) -> (SessionHandle, mpsc::Receiver<SessionCommand>) {
	let (tx, rx) = mpsc::channel(16);
	(SessionHandle::new(conn_id, UserId::new(user).unwrap(), tx), rx)
}

async fn next_event(rx: &mut mpsc::Receiver<SessionCommand>, wait_ms: u64) -> Option<ServerEvent> {
	match timeout(Duration::from_millis(wait_ms), rx.recv()).await {
		Ok(Some(SessionCommand::Deliver(ev))) => Some(*ev),
		_ => None,
	}
}

#[tokio::test]
async fn second_register_preempts_first() {
	let reg = registry(50);
	let (c1, mut rx1) = handle(1, "u1");
	let (c2, _rx2) = handle(2, "u1");

	assert_eq!(reg.register(c1.clone(), "dev-a", "10.0.0.1"), RegisterOutcome::Fresh);
	assert_eq!(reg.register(c2.clone(), "dev-b", "10.0.0.2"), RegisterOutcome::Replaced);

	// Registry already points at the new session.
	assert_eq!(reg.lookup(&UserId::new("u1").unwrap()).unwrap().conn_id(), 2);

	match next_event(&mut rx1, 200).await {
		Some(ServerEvent::DuplicateLogin { device_info, ip_address, .. }) => {
			assert_eq!(device_info, "dev-b");
			assert_eq!(ip_address, "10.0.0.2");
		}
		other => panic!("expected duplicate_login, got {other:?}"),
	}

	match next_event(&mut rx1, 500).await {
		Some(ServerEvent::SessionEnded { reason }) => assert_eq!(reason, "duplicate_login"),
		other => panic!("expected session_ended, got {other:?}"),
	}

	// Forced close follows the final event.
	match timeout(Duration::from_millis(200), rx1.recv()).await {
		Ok(Some(SessionCommand::Close)) => {}
		other => panic!("expected Close, got {other:?}"),
	}
	assert!(c1.is_preempted());
}

#[tokio::test]
async fn stale_unregister_leaves_replacement_in_place() {
	let reg = registry(50);
	let (c1, _rx1) = handle(1, "u1");
	let (c2, _rx2) = handle(2, "u1");
	let user = UserId::new("u1").unwrap();

	reg.register(c1, "d", "ip");
	reg.register(c2, "d", "ip");

	// The pre-empted session's disconnect must not remove the new entry.
	assert!(!reg.unregister(&user, 1));
	assert_eq!(reg.lookup(&user).unwrap().conn_id(), 2);

	assert!(reg.unregister(&user, 2));
	assert!(reg.lookup(&user).is_none());
}

#[tokio::test]
async fn incumbent_disconnect_cancels_preemption_timer() {
	let reg = registry(80);
	let (c1, mut rx1) = handle(1, "u1");
	let (c2, _rx2) = handle(2, "u1");
	let user = UserId::new("u1").unwrap();

	reg.register(c1, "d", "ip");
	reg.register(c2, "d", "ip");

	assert!(matches!(next_event(&mut rx1, 200).await, Some(ServerEvent::DuplicateLogin { .. })));

	// Incumbent goes away during the warning window.
	reg.unregister(&user, 1);

	// No session_ended may arrive after the cancelled timer would fire.
	tokio::time::sleep(Duration::from_millis(160)).await;
	assert!(next_event(&mut rx1, 50).await.is_none());
}

#[tokio::test]
async fn force_end_pending_fires_immediately_with_reason() {
	let reg = registry(5_000);
	let (c1, mut rx1) = handle(1, "u1");
	let (c2, _rx2) = handle(2, "u1");
	let user = UserId::new("u1").unwrap();

	reg.register(c1, "d", "ip");
	reg.register(c2, "d", "ip");
	assert!(matches!(next_event(&mut rx1, 200).await, Some(ServerEvent::DuplicateLogin { .. })));

	assert!(reg.force_end_pending(&user, "force_logout"));
	match next_event(&mut rx1, 200).await {
		Some(ServerEvent::SessionEnded { reason }) => assert_eq!(reason, "force_logout"),
		other => panic!("expected session_ended, got {other:?}"),
	}

	// The long timer was aborted; nothing further arrives.
	assert!(!reg.force_end_pending(&user, "force_logout"));
}

#[tokio::test]
async fn sweep_dead_drops_closed_handles() {
	let reg = registry(50);
	let (c1, rx1) = handle(1, "u1");
	let (c2, _rx2) = handle(2, "u2");

	reg.register(c1, "d", "ip");
	reg.register(c2, "d", "ip");
	assert_eq!(reg.len(), 2);

	drop(rx1);
	assert_eq!(reg.sweep_dead(), 1);
	assert_eq!(reg.len(), 1);
	assert!(reg.lookup(&UserId::new("u2").unwrap()).is_some());
}

#[tokio::test]
async fn touch_and_room_tracking() {
	let reg = registry(50);
	let (c1, _rx1) = handle(1, "u1");
	let user = UserId::new("u1").unwrap();

	reg.register(c1, "d", "ip");
	reg.set_room(&user, Some(huddle_domain::RoomId::new("r1").unwrap()));
	assert_eq!(
		reg.entry(&user).unwrap().room.as_ref().map(|r| r.as_str().to_string()),
		Some("r1".to_string())
	);

	reg.set_room(&user, None);
	assert!(reg.entry(&user).unwrap().room.is_none());
}
