#![forbid(unsafe_code)]

//! End-to-end session scenarios over a real TCP listener with in-memory
//! collaborators. One server instance, several framed clients.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use huddle_domain::{Message, MessageKind, Room, RoomId, SessionId, User, UserId};
use huddle_protocol::{ClientEvent, DEFAULT_MAX_FRAME_SIZE, ServerEvent, encode_frame, try_decode_frame_from_buffer};
use huddle_server::server::auth::issue_hmac_token;
use huddle_server::server::connection::{ConnectionSettings, handle_connection};
use huddle_server::server::core::{Collaborators, Core, CoreConfig};
use huddle_server::server::sessions::ConnectionRegistryConfig;
use huddle_server::util::secret::SecretString;
use huddle_store::{
	Clock, LocalBus, ManualClock, MemoryCache, MemorySessions, MemoryStore, MessageRepo, ScriptedAiGenerator,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

const SECRET: &str = "smoke-secret";
const PREEMPT_MS: u64 = 300;

struct TestServer {
	addr: SocketAddr,
	store: Arc<MemoryStore>,
	generator: Arc<ScriptedAiGenerator>,
	/// Frozen clock: window and TTL arithmetic stays deterministic while
	/// tokio timers (pre-emption, backoff) run on real time.
	clock: Arc<ManualClock>,
	#[allow(dead_code)]
	core: Arc<Core>,
}

impl TestServer {
	async fn start() -> Self {
		let clock = Arc::new(ManualClock::new(1_000_000_000));
		let store = Arc::new(MemoryStore::new());
		let cache = Arc::new(MemoryCache::new(clock.clone()));
		let bus = Arc::new(LocalBus::new());
		let generator = Arc::new(ScriptedAiGenerator::new().with_chunk_delay(Duration::from_millis(2)));
		let sessions = Arc::new(MemorySessions::allow_all());

		let core = Core::new(
			CoreConfig {
				instance_id: "smoke-instance".to_string(),
				auth_secret: SecretString::new(SECRET),
				connections: ConnectionRegistryConfig {
					capacity: 64,
					preempt_window: Duration::from_millis(PREEMPT_MS),
				},
				..CoreConfig::default()
			},
			Collaborators {
				clock: clock.clone(),
				cache,
				bus,
				messages: store.clone(),
				rooms: store.clone(),
				users: store.clone(),
				files: store.clone(),
				verifier: sessions,
				generator: generator.clone(),
			},
		);

		let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind ephemeral port");
		let addr = listener.local_addr().expect("local addr");

		let accept_core = Arc::clone(&core);
		tokio::spawn(async move {
			let mut next_conn_id: u64 = 1;
			loop {
				let Ok((stream, peer)) = listener.accept().await else {
					break;
				};
				let conn_id = next_conn_id;
				next_conn_id += 1;

				let core = Arc::clone(&accept_core);
				tokio::spawn(async move {
					let _ = handle_connection(conn_id, stream, peer, core, ConnectionSettings::default()).await;
				});
			}
		});

		Self {
			addr,
			store,
			generator,
			clock,
			core,
		}
	}

	async fn seed_user(&self, id: &str) -> User {
		let user = User {
			id: UserId::new(id).unwrap(),
			name: id.to_string(),
			email: format!("{id}@example.com"),
			profile_image: None,
		};
		self.store.insert_user(user.clone()).await;
		user
	}

	async fn seed_room(&self, id: &str, creator: &str) -> RoomId {
		let room_id = RoomId::new(id).unwrap();
		self.store
			.insert_room(Room {
				id: room_id.clone(),
				name: format!("room {id}"),
				password_hash: None,
				creator: UserId::new(creator).unwrap(),
				participants: Vec::new(),
				created_at: 0,
			})
			.await;
		room_id
	}

	fn token_for(&self, user: &str) -> String {
		let exp = (self.clock.now_ms() / 1000) as u64 + 3_600;
		issue_hmac_token(&UserId::new(user).unwrap(), exp, SECRET)
	}
}

struct TestClient {
	stream: TcpStream,
	buf: BytesMut,
}

impl TestClient {
	async fn connect(addr: SocketAddr) -> Self {
		let stream = TcpStream::connect(addr).await.expect("connect");
		Self {
			stream,
			buf: BytesMut::with_capacity(16 * 1024),
		}
	}

	async fn send(&mut self, event: &ClientEvent) {
		let frame = encode_frame(event, DEFAULT_MAX_FRAME_SIZE).expect("encode");
		self.stream.write_all(&frame).await.expect("write frame");
	}

	/// Next event within `wait_ms`; `None` on timeout or closed stream.
	async fn recv(&mut self, wait_ms: u64) -> Option<ServerEvent> {
		let deadline = tokio::time::Instant::now() + Duration::from_millis(wait_ms);
		let mut tmp = [0u8; 8192];

		loop {
			if let Some(event) = try_decode_frame_from_buffer(&mut self.buf, DEFAULT_MAX_FRAME_SIZE).expect("decode") {
				return Some(event);
			}

			let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
			if remaining.is_zero() {
				return None;
			}

			match timeout(remaining, self.stream.read(&mut tmp)).await {
				Ok(Ok(0)) | Err(_) => return None,
				Ok(Ok(n)) => self.buf.extend_from_slice(&tmp[..n]),
				Ok(Err(_)) => return None,
			}
		}
	}

	/// Drain events until one matches or the window lapses.
	async fn recv_until<F>(&mut self, wait_ms: u64, mut pred: F) -> Option<ServerEvent>
	where
		F: FnMut(&ServerEvent) -> bool,
	{
		let deadline = tokio::time::Instant::now() + Duration::from_millis(wait_ms);
		loop {
			let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
			if remaining.is_zero() {
				return None;
			}
			match self.recv(remaining.as_millis() as u64).await {
				Some(ev) if pred(&ev) => return Some(ev),
				Some(_) => {}
				None => return None,
			}
		}
	}

	async fn authenticate(&mut self, token: &str, session: &str) -> ServerEvent {
		self.send(&ClientEvent::Auth {
			token: token.to_string(),
			session_id: SessionId::new(session).unwrap(),
			device_info: Some("smoke-test".to_string()),
		})
		.await;
		self.recv(2_000).await.expect("handshake response")
	}

	async fn join(&mut self, room: &RoomId) -> ServerEvent {
		self.send(&ClientEvent::JoinRoom { room_id: room.clone() }).await;
		self.recv_until(2_000, |ev| {
			matches!(ev, ServerEvent::JoinRoomSuccess { .. } | ServerEvent::JoinRoomError { .. })
		})
		.await
		.expect("join response")
	}

	async fn chat(&mut self, room: &RoomId, content: &str) {
		self.send(&ClientEvent::ChatMessage {
			room: room.clone(),
			content: content.to_string(),
			kind: None,
			file_data: None,
		})
		.await;
	}
}

#[tokio::test]
async fn invalid_token_fails_the_handshake() {
	let server = TestServer::start().await;
	let mut client = TestClient::connect(server.addr).await;

	match client.authenticate("v1.bogus.token", "s1").await {
		ServerEvent::Error { code, .. } => assert_eq!(code, "INVALID_TOKEN"),
		other => panic!("expected error, got {other:?}"),
	}
	assert!(client.recv(300).await.is_none(), "connection must close after auth failure");
}

#[tokio::test]
async fn unknown_user_fails_with_user_not_found() {
	let server = TestServer::start().await;
	let mut client = TestClient::connect(server.addr).await;

	let token = server.token_for("nobody");
	match client.authenticate(&token, "s1").await {
		ServerEvent::Error { code, .. } => assert_eq!(code, "USER_NOT_FOUND"),
		other => panic!("expected error, got {other:?}"),
	}
}

#[tokio::test]
async fn single_active_session_preempts_the_older_one() {
	let server = TestServer::start().await;
	server.seed_user("u1").await;
	let room = server.seed_room("r1", "u1").await;
	let token = server.token_for("u1");

	let mut session_a = TestClient::connect(server.addr).await;
	assert!(matches!(
		session_a.authenticate(&token, "sess-a").await,
		ServerEvent::AuthSuccess { .. }
	));
	assert!(matches!(session_a.join(&room).await, ServerEvent::JoinRoomSuccess { .. }));

	let mut session_b = TestClient::connect(server.addr).await;
	assert!(matches!(
		session_b.authenticate(&token, "sess-b").await,
		ServerEvent::AuthSuccess { .. }
	));

	// A is warned promptly, then ended within the pre-emption window.
	let warned = session_a
		.recv_until(500, |ev| matches!(ev, ServerEvent::DuplicateLogin { .. }))
		.await
		.expect("duplicate_login within 500ms");
	match warned {
		ServerEvent::DuplicateLogin { device_info, .. } => assert_eq!(device_info, "smoke-test"),
		_ => unreachable!(),
	}

	let ended = session_a
		.recv_until(PREEMPT_MS + 500, |ev| matches!(ev, ServerEvent::SessionEnded { .. }))
		.await
		.expect("session_ended within the window");
	match ended {
		ServerEvent::SessionEnded { reason } => assert_eq!(reason, "duplicate_login"),
		_ => unreachable!(),
	}
	assert!(session_a.recv(300).await.is_none(), "no events after session_ended");

	// The replacement session is fully functional.
	assert!(matches!(session_b.join(&room).await, ServerEvent::JoinRoomSuccess { .. }));
}

#[tokio::test]
async fn three_user_chat_preserves_local_order() {
	let server = TestServer::start().await;
	let room = server.seed_room("lobby", "a").await;

	let mut clients = Vec::new();
	for name in ["a", "b", "c"] {
		server.seed_user(name).await;
		let mut client = TestClient::connect(server.addr).await;
		let token = server.token_for(name);
		assert!(matches!(
			client.authenticate(&token, &format!("sess-{name}")).await,
			ServerEvent::AuthSuccess { .. }
		));
		assert!(matches!(client.join(&room).await, ServerEvent::JoinRoomSuccess { .. }));
		clients.push(client);
	}

	// Serialise sends: each sender waits for its own echo before the next
	// client speaks, which fixes the publish order. Everything a session
	// observes goes into its transcript so nothing is lost to draining.
	let contents = ["hi", "hello", "hey"];
	let mut transcripts: Vec<Vec<String>> = vec![Vec::new(); 3];

	for (i, content) in contents.iter().enumerate() {
		clients[i].chat(&room, content).await;
		loop {
			match clients[i]
				.recv_until(2_000, |ev| {
					matches!(ev, ServerEvent::Message { message } if contents.contains(&message.content.as_str()))
				})
				.await
			{
				Some(ServerEvent::Message { message }) => {
					let echoed = message.content == *content;
					transcripts[i].push(message.content);
					if echoed {
						break;
					}
				}
				_ => panic!("client {i} did not see its own message"),
			}
		}
	}

	// Every session observed exactly those three chat messages, in order.
	for (i, client) in clients.iter_mut().enumerate() {
		while transcripts[i].len() < 3 {
			match client
				.recv_until(2_000, |ev| {
					matches!(ev, ServerEvent::Message { message } if contents.contains(&message.content.as_str()))
				})
				.await
			{
				Some(ServerEvent::Message { message }) => transcripts[i].push(message.content),
				_ => panic!("client {i} missed a chat message, saw {:?}", transcripts[i]),
			}
		}
		assert_eq!(transcripts[i], contents, "client {i} saw messages out of order");
	}
}

#[tokio::test]
async fn history_pagination_over_the_wire() {
	let server = TestServer::start().await;
	server.seed_user("u1").await;
	let room = server.seed_room("archive", "u1").await;

	for ts in 1..=60i64 {
		let mut msg = Message::new(
			room.clone(),
			Some(UserId::new("u1").unwrap()),
			format!("m{ts}"),
			MessageKind::Text,
			ts,
		);
		msg.id = huddle_domain::MessageId::new(format!("m{ts:04}")).unwrap();
		server.store.create(&msg).await.unwrap();
	}

	let mut client = TestClient::connect(server.addr).await;
	let token = server.token_for("u1");
	assert!(matches!(
		client.authenticate(&token, "sess-1").await,
		ServerEvent::AuthSuccess { .. }
	));
	assert!(matches!(client.join(&room).await, ServerEvent::JoinRoomSuccess { .. }));

	client
		.send(&ClientEvent::FetchPreviousMessages {
			room_id: room.clone(),
			before: Some(36),
		})
		.await;

	assert!(
		client
			.recv_until(2_000, |ev| matches!(ev, ServerEvent::MessageLoadStart { .. }))
			.await
			.is_some(),
		"load start precedes the page"
	);

	match client
		.recv_until(2_000, |ev| matches!(ev, ServerEvent::PreviousMessagesLoaded { .. }))
		.await
		.expect("page loaded")
	{
		ServerEvent::PreviousMessagesLoaded {
			messages,
			has_more,
			oldest_timestamp,
			..
		} => {
			assert_eq!(messages.len(), 25);
			assert!(has_more);
			assert_eq!(oldest_timestamp, Some(11));
			assert_eq!(messages.first().unwrap().timestamp, 11);
			assert_eq!(messages.last().unwrap().timestamp, 35);
		}
		_ => unreachable!(),
	}
}

#[tokio::test]
async fn forty_first_send_is_rate_limited() {
	let server = TestServer::start().await;
	server.seed_user("u1").await;
	let room = server.seed_room("busy", "u1").await;

	let mut client = TestClient::connect(server.addr).await;
	let token = server.token_for("u1");
	assert!(matches!(
		client.authenticate(&token, "sess-1").await,
		ServerEvent::AuthSuccess { .. }
	));
	assert!(matches!(client.join(&room).await, ServerEvent::JoinRoomSuccess { .. }));

	for i in 0..40 {
		client.chat(&room, &format!("burst {i}")).await;
		client
			.recv_until(2_000, |ev| {
				matches!(ev, ServerEvent::Message { message } if message.content == format!("burst {i}"))
			})
			.await
			.unwrap_or_else(|| panic!("send {i} should be within budget"));
	}

	client.chat(&room, "one too many").await;
	match client
		.recv_until(2_000, |ev| matches!(ev, ServerEvent::Error { .. }))
		.await
		.expect("rate limit error")
	{
		ServerEvent::Error { code, .. } => assert_eq!(code, "RATE_LIMITED"),
		_ => unreachable!(),
	}
}

#[tokio::test]
async fn ai_mention_streams_and_persists() {
	let server = TestServer::start().await;
	server
		.generator
		.script("wayneAI", vec!["Summary: ".to_string(), "done".to_string()])
		.await;
	server.seed_user("u1").await;
	server.seed_user("u2").await;
	let room = server.seed_room("ai-room", "u1").await;

	let mut asker = TestClient::connect(server.addr).await;
	let token = server.token_for("u1");
	assert!(matches!(
		asker.authenticate(&token, "sess-1").await,
		ServerEvent::AuthSuccess { .. }
	));
	assert!(matches!(asker.join(&room).await, ServerEvent::JoinRoomSuccess { .. }));

	let mut peer = TestClient::connect(server.addr).await;
	let token = server.token_for("u2");
	assert!(matches!(
		peer.authenticate(&token, "sess-2").await,
		ServerEvent::AuthSuccess { .. }
	));
	assert!(matches!(peer.join(&room).await, ServerEvent::JoinRoomSuccess { .. }));

	asker.chat(&room, "@wayneAI summarize the thread").await;

	// Both participants observe the stream lifecycle.
	for client in [&mut asker, &mut peer] {
		let start = client
			.recv_until(2_000, |ev| matches!(ev, ServerEvent::AiMessageStart { .. }))
			.await
			.expect("aiMessageStart");
		let sid = match start {
			ServerEvent::AiMessageStart { sid, model, .. } => {
				assert_eq!(model, "wayneAI");
				sid
			}
			_ => unreachable!(),
		};

		assert!(
			client
				.recv_until(2_000, |ev| matches!(ev, ServerEvent::AiMessageChunk { sid: s, .. } if *s == sid))
				.await
				.is_some(),
			"at least one chunk"
		);

		match client
			.recv_until(2_000, |ev| matches!(ev, ServerEvent::AiMessageComplete { .. }))
			.await
			.expect("aiMessageComplete")
		{
			ServerEvent::AiMessageComplete { message, .. } => {
				assert_eq!(message.kind, MessageKind::Ai);
				assert_eq!(message.content, "Summary: done");
				assert_eq!(message.ai_model.as_deref(), Some("wayneAI"));
			}
			_ => unreachable!(),
		}
	}

	let stored = server
		.store
		.find_before(&room, None, 50)
		.await
		.unwrap()
		.into_iter()
		.find(|m| m.kind == MessageKind::Ai)
		.expect("ai message persisted");
	assert_eq!(stored.content, "Summary: done");
}

#[tokio::test]
async fn read_receipts_reach_the_sender_but_not_the_reader() {
	let server = TestServer::start().await;
	server.seed_user("u1").await;
	server.seed_user("u2").await;
	let room = server.seed_room("receipts", "u1").await;

	let mut sender = TestClient::connect(server.addr).await;
	let token = server.token_for("u1");
	assert!(matches!(
		sender.authenticate(&token, "sess-1").await,
		ServerEvent::AuthSuccess { .. }
	));
	assert!(matches!(sender.join(&room).await, ServerEvent::JoinRoomSuccess { .. }));

	let mut reader = TestClient::connect(server.addr).await;
	let token = server.token_for("u2");
	assert!(matches!(
		reader.authenticate(&token, "sess-2").await,
		ServerEvent::AuthSuccess { .. }
	));
	assert!(matches!(reader.join(&room).await, ServerEvent::JoinRoomSuccess { .. }));

	sender.chat(&room, "read me").await;
	let message_id = match reader
		.recv_until(2_000, |ev| {
			matches!(ev, ServerEvent::Message { message } if message.content == "read me")
		})
		.await
		.expect("message delivered")
	{
		ServerEvent::Message { message } => message.id,
		_ => unreachable!(),
	};

	reader
		.send(&ClientEvent::MarkMessagesAsRead {
			room_id: room.clone(),
			message_ids: vec![message_id.clone()],
		})
		.await;

	match sender
		.recv_until(2_000, |ev| matches!(ev, ServerEvent::MessagesRead { .. }))
		.await
		.expect("sender receives the receipt")
	{
		ServerEvent::MessagesRead { user_id, message_ids } => {
			assert_eq!(user_id.as_str(), "u2");
			assert_eq!(message_ids, vec![message_id]);
		}
		_ => unreachable!(),
	}

	assert!(
		reader
			.recv_until(300, |ev| matches!(ev, ServerEvent::MessagesRead { .. }))
			.await
			.is_none(),
		"the reader does not receive its own receipt"
	);
}
