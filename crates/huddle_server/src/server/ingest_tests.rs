#![forbid(unsafe_code)]

use huddle_domain::{FileId, FileRef, MessageKind};
use huddle_protocol::ServerEvent;

use crate::server::core::CoreConfig;
use crate::server::ingest::{Mention, SendError, detect_mentions};
use crate::server::rate_limit::RateLimitConfig;
use crate::server::testutil::{TestCore, wait_for_event};

fn models() -> Vec<String> {
	vec!["wayneAI".to_string(), "consultingAI".to_string()]
}

#[test]
fn detects_single_mention_and_strips_it() {
	let found = detect_mentions("@wayneAI summarize this thread", &models());
	assert_eq!(
		found,
		vec![Mention {
			model: "wayneAI".to_string(),
			query: "summarize this thread".to_string(),
		}]
	);
}

#[test]
fn mention_requires_token_boundary() {
	assert!(detect_mentions("@wayneAI2 hello", &models()).is_empty());
	assert!(detect_mentions("mail@wayneAIx", &models()).is_empty());

	let found = detect_mentions("ping @wayneAI, please", &models());
	assert_eq!(found.len(), 1);
	assert_eq!(found[0].query, "ping , please");
}

#[test]
fn each_model_fires_once() {
	let found = detect_mentions("@wayneAI @consultingAI @wayneAI go", &models());
	assert_eq!(found.len(), 2);
	assert_eq!(found[0].model, "wayneAI");
	assert_eq!(found[1].model, "consultingAI");
}

#[test]
fn no_mentions_in_plain_text() {
	assert!(detect_mentions("hello world", &models()).is_empty());
	assert!(detect_mentions("", &models()).is_empty());
}

#[tokio::test]
async fn send_fans_out_to_all_room_sessions() {
	let t = TestCore::new().await;
	let alice = t.seed_user("alice").await;
	let bob = t.seed_user("bob").await;
	let room = t.seed_room("r1", "alice").await;

	let (ha, mut rx_a) = t.attach(1, &alice);
	let (hb, mut rx_b) = t.attach(2, &bob);
	t.join(&ha, &alice, &room).await;
	t.join(&hb, &bob, &room).await;

	let id = t
		.core
		.ingest
		.send(&alice, &t.session_id("s1"), &room, "hi".to_string(), None, None)
		.await
		.expect("send ok");

	for rx in [&mut rx_a, &mut rx_b] {
		let ev = wait_for_event(rx, 500, |ev| {
			matches!(ev, ServerEvent::Message { message } if message.content == "hi")
		})
		.await
		.expect("message delivered");

		match ev {
			ServerEvent::Message { message } => {
				assert_eq!(message.id, id);
				assert_eq!(message.kind, MessageKind::Text);
				assert_eq!(message.sender.as_ref().map(|u| u.id.as_str()), Some("alice"));
			}
			_ => unreachable!(),
		}
	}
}

#[tokio::test]
async fn send_outside_current_room_is_unauthorized() {
	let t = TestCore::new().await;
	let alice = t.seed_user("alice").await;
	let room = t.seed_room("r1", "alice").await;
	let (_ha, _rx) = t.attach(1, &alice);

	let err = t
		.core
		.ingest
		.send(&alice, &t.session_id("s1"), &room, "hi".to_string(), None, None)
		.await
		.unwrap_err();
	assert!(matches!(err, SendError::Unauthorized));
	assert_eq!(err.code(), "ACCESS_DENIED");
}

#[tokio::test]
async fn empty_message_without_file_is_invalid() {
	let t = TestCore::new().await;
	let alice = t.seed_user("alice").await;
	let room = t.seed_room("r1", "alice").await;
	let (ha, _rx) = t.attach(1, &alice);
	t.join(&ha, &alice, &room).await;

	let err = t
		.core
		.ingest
		.send(&alice, &t.session_id("s1"), &room, "   ".to_string(), None, None)
		.await
		.unwrap_err();
	assert!(matches!(err, SendError::InvalidInput(_)));
	assert_eq!(err.code(), "MESSAGE_ERROR");
}

#[tokio::test]
async fn file_reference_escalates_kind() {
	let t = TestCore::new().await;
	let alice = t.seed_user("alice").await;
	let room = t.seed_room("r1", "alice").await;
	t.store
		.insert_file(FileRef {
			id: FileId::new("f1").unwrap(),
			filename: "f1.png".to_string(),
			originalname: "cat.png".to_string(),
			mimetype: "image/png".to_string(),
			size: 1024,
		})
		.await;

	let (ha, mut rx_a) = t.attach(1, &alice);
	t.join(&ha, &alice, &room).await;

	t.core
		.ingest
		.send(
			&alice,
			&t.session_id("s1"),
			&room,
			"look at this".to_string(),
			Some(MessageKind::Text),
			Some(FileId::new("f1").unwrap()),
		)
		.await
		.expect("send ok");

	let ev = wait_for_event(&mut rx_a, 500, |ev| {
		matches!(ev, ServerEvent::Message { message } if message.kind == MessageKind::File)
	})
	.await
	.expect("file message delivered");

	match ev {
		ServerEvent::Message { message } => {
			let file = message.file.expect("file resolved");
			assert_eq!(file.originalname, "cat.png");
		}
		_ => unreachable!(),
	}
}

#[tokio::test]
async fn over_budget_sends_are_rate_limited() {
	let t = TestCore::with_config(CoreConfig {
		instance_id: "instance-test".to_string(),
		rate: RateLimitConfig {
			max_per_window: 3,
			fallback_capacity: 16,
		},
		..CoreConfig::default()
	})
	.await;

	let alice = t.seed_user("alice").await;
	let room = t.seed_room("r1", "alice").await;
	let (ha, _rx) = t.attach(1, &alice);
	t.join(&ha, &alice, &room).await;

	for i in 0..3 {
		t.core
			.ingest
			.send(&alice, &t.session_id("s1"), &room, format!("m{i}"), None, None)
			.await
			.expect("within budget");
	}

	let err = t
		.core
		.ingest
		.send(&alice, &t.session_id("s1"), &room, "m3".to_string(), None, None)
		.await
		.unwrap_err();
	assert!(matches!(err, SendError::RateLimited));
	assert_eq!(err.code(), "RATE_LIMITED");

	// Next window opens the budget again.
	t.clock.advance(60_001);
	t.core
		.ingest
		.send(&alice, &t.session_id("s1"), &room, "m4".to_string(), None, None)
		.await
		.expect("new window");
}

#[tokio::test]
async fn mention_starts_ai_stream_for_room() {
	let t = TestCore::new().await;
	t.generator.script("wayneAI", vec!["sum".to_string(), "mary".to_string()]).await;

	let alice = t.seed_user("alice").await;
	let room = t.seed_room("r1", "alice").await;
	let (ha, mut rx_a) = t.attach(1, &alice);
	t.join(&ha, &alice, &room).await;

	t.core
		.ingest
		.send(
			&alice,
			&t.session_id("s1"),
			&room,
			"@wayneAI summarize".to_string(),
			None,
			None,
		)
		.await
		.expect("send ok");

	let ev = wait_for_event(&mut rx_a, 1_000, |ev| matches!(ev, ServerEvent::AiMessageStart { .. }))
		.await
		.expect("ai stream started");
	match ev {
		ServerEvent::AiMessageStart { model, .. } => assert_eq!(model, "wayneAI"),
		_ => unreachable!(),
	}
}
