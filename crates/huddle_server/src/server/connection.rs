#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use bytes::BytesMut;
use huddle_domain::{RoomId, SessionId, User};
use huddle_protocol::{ClientEvent, ServerEvent, encode_frame, try_decode_frame_from_buffer};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::server::core::Core;
use crate::server::history::FetchOutcome;
use crate::server::rooms::LeaveReason;
use crate::server::sessions::{ConnId, SessionCommand, SessionHandle};

/// Per-connection server settings.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
	pub max_frame_bytes: usize,

	pub outbound_queue_capacity: usize,

	/// The opening `auth` frame must arrive within this window.
	pub handshake_timeout: Duration,
}

impl Default for ConnectionSettings {
	fn default() -> Self {
		Self {
			max_frame_bytes: huddle_protocol::DEFAULT_MAX_FRAME_SIZE,
			outbound_queue_capacity: 256,
			handshake_timeout: Duration::from_secs(10),
		}
	}
}

pub async fn handle_connection(
	conn_id: ConnId,
	stream: TcpStream,
	peer: SocketAddr,
	core: Arc<Core>,
	settings: ConnectionSettings,
) -> anyhow::Result<()> {
	struct ConnectionGaugeGuard;
	impl Drop for ConnectionGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("huddle_server_active_connections").decrement(1.0);
		}
	}

	metrics::gauge!("huddle_server_active_connections").increment(1.0);
	let _conn_guard = ConnectionGaugeGuard;

	let (mut read_half, mut write_half) = stream.into_split();
	let max_frame = settings.max_frame_bytes;

	let (ctrl_tx, mut ctrl_rx) = mpsc::unbounded_channel::<ClientEvent>();
	let reader_task = tokio::spawn(async move {
		let mut buf = BytesMut::with_capacity(16 * 1024);
		let mut tmp = [0u8; 8192];

		loop {
			let n = match read_half.read(&mut tmp).await {
				Ok(0) => return Ok::<(), anyhow::Error>(()),
				Ok(n) => n,
				Err(e) => return Err(anyhow!(e).context("control stream read failed")),
			};

			metrics::counter!("huddle_server_bytes_in_total").increment(n as u64);
			buf.extend_from_slice(&tmp[..n]);

			loop {
				match try_decode_frame_from_buffer::<ClientEvent>(&mut buf, max_frame) {
					Ok(Some(event)) => {
						metrics::counter!("huddle_server_events_in_total").increment(1);
						if ctrl_tx.send(event).is_err() {
							return Ok(());
						}
					}
					Ok(None) => break,
					Err(e) => {
						metrics::counter!("huddle_server_decode_errors_total").increment(1);
						return Err(anyhow!(e).context("failed to decode control frame"));
					}
				}
			}
		}
	});

	let (out_tx, mut out_rx) = mpsc::channel::<SessionCommand>(settings.outbound_queue_capacity);
	let writer_task = tokio::spawn(async move {
		while let Some(cmd) = out_rx.recv().await {
			match cmd {
				SessionCommand::Deliver(event) => {
					let frame = match encode_frame(&*event, max_frame) {
						Ok(frame) => frame,
						Err(e) => {
							error!(conn_id, kind = event.kind(), error = %e, "failed to encode outbound frame");
							continue;
						}
					};
					metrics::counter!("huddle_server_events_out_total").increment(1);
					metrics::counter!("huddle_server_bytes_out_total").increment(frame.len() as u64);

					if write_half.write_all(&frame).await.is_err() {
						break;
					}
				}
				SessionCommand::Close => {
					let _ = write_half.shutdown().await;
					break;
				}
			}
		}
		out_rx.close();
	});

	// Handshake: the first frame must authenticate the session.
	let auth = match timeout(settings.handshake_timeout, wait_for_auth(&mut ctrl_rx)).await {
		Ok(Some(auth)) => auth,
		Ok(None) => {
			debug!(conn_id, "connection closed before auth");
			reader_task.abort();
			let _ = out_tx.send(SessionCommand::Close).await;
			let _ = writer_task.await;
			return Ok(());
		}
		Err(_) => {
			warn!(conn_id, "handshake timed out");
			send_direct(
				&out_tx,
				ServerEvent::Error {
					code: "INVALID_TOKEN".to_string(),
					message: "authentication required".to_string(),
				},
			)
			.await;
			reader_task.abort();
			let _ = out_tx.send(SessionCommand::Close).await;
			let _ = writer_task.await;
			return Ok(());
		}
	};

	let user = match core.auth.authenticate(&auth.token, &auth.session_id).await {
		Ok(user) => user,
		Err(e) => {
			warn!(conn_id, code = e.code(), "authentication failed");
			metrics::counter!("huddle_server_auth_failures_total", "code" => e.code()).increment(1);
			send_direct(
				&out_tx,
				ServerEvent::Error {
					code: e.code().to_string(),
					message: e.to_string(),
				},
			)
			.await;
			reader_task.abort();
			let _ = out_tx.send(SessionCommand::Close).await;
			let _ = writer_task.await;
			return Ok(());
		}
	};

	info!(conn_id, user = %user.id, remote = %peer, "session authenticated");
	metrics::counter!("huddle_server_sessions_total").increment(1);

	let handle = SessionHandle::new(conn_id, user.id.clone(), out_tx.clone());
	let device_info = auth.device_info.unwrap_or_else(|| "unknown".to_string());
	core.connections.register(handle.clone(), &device_info, &peer.ip().to_string());

	handle.deliver(ServerEvent::AuthSuccess { user: user.clone() });

	let mut session = SessionState {
		conn_id,
		user,
		session_id: auth.session_id,
		room: None,
	};

	let loop_result = async {
		loop {
			tokio::select! {
				event = ctrl_rx.recv() => {
					let Some(event) = event else { break };
					dispatch(&core, &handle, &mut session, event).await;
				}

				// Pre-emption (or a writer failure) closes the outbound
				// channel; stop consuming input immediately.
				_ = out_tx.closed() => {
					debug!(conn_id, "outbound channel closed; ending session loop");
					break;
				}
			}
		}
		Ok::<(), anyhow::Error>(())
	}
	.await;

	// Disconnect cleanup. A pre-empted session keeps its room membership
	// for the replacement session; a graceful one announces departure.
	if let Some(room) = session.room.take() {
		if handle.is_preempted() {
			core.rooms.detach_preempted(conn_id, &room).await;
		} else {
			core.rooms.leave(conn_id, &session.user, &room, LeaveReason::Disconnect).await;
		}
	}
	core.connections.unregister(&session.user.id, conn_id);

	let _ = out_tx.send(SessionCommand::Close).await;
	reader_task.abort();
	let _ = reader_task.await;
	let _ = writer_task.await;

	info!(conn_id, user = %session.user.id, "connection closed");
	loop_result
}

struct AuthRequest {
	token: String,
	session_id: SessionId,
	device_info: Option<String>,
}

struct SessionState {
	conn_id: ConnId,
	user: User,
	session_id: SessionId,
	/// Room this connection joined; authoritative for its own cleanup.
	room: Option<RoomId>,
}

async fn wait_for_auth(ctrl_rx: &mut mpsc::UnboundedReceiver<ClientEvent>) -> Option<AuthRequest> {
	while let Some(event) = ctrl_rx.recv().await {
		if let ClientEvent::Auth {
			token,
			session_id,
			device_info,
		} = event
		{
			return Some(AuthRequest {
				token,
				session_id,
				device_info,
			});
		}
		debug!("ignoring pre-auth event");
	}
	None
}

async fn send_direct(out_tx: &mpsc::Sender<SessionCommand>, event: ServerEvent) {
	let _ = out_tx.send(SessionCommand::Deliver(Box::new(event))).await;
}

async fn dispatch(core: &Arc<Core>, handle: &SessionHandle, session: &mut SessionState, event: ClientEvent) {
	match event {
		ClientEvent::Auth { .. } => {
			debug!(conn_id = session.conn_id, "ignoring duplicate auth");
		}

		ClientEvent::JoinRoom { room_id } => {
			match core.rooms.join(handle, &session.user, &room_id).await {
				Ok(outcome) => {
					session.room = Some(room_id.clone());

					// Initial history; a load failure degrades the
					// join to an empty page rather than failing it.
					let (messages, has_more, oldest_timestamp) =
						match core.history.fetch(&session.user.id, &room_id, None).await {
							Ok(FetchOutcome::Page(page)) => (page.messages, page.has_more, page.oldest_timestamp),
							Ok(FetchOutcome::Duplicate) => (Vec::new(), false, None),
							Err(e) => {
								warn!(conn_id = session.conn_id, room = %room_id, error = %e, "initial history load failed");
								(Vec::new(), false, None)
							}
						};

					handle.deliver(ServerEvent::JoinRoomSuccess {
						room_id,
						room_name: outcome.room.name,
						participants: outcome.participants,
						messages,
						has_more,
						oldest_timestamp,
					});
				}
				Err(e) => {
					// A failed switch may already have left the old room.
					session.room = core.rooms.current_room(&session.user.id);
					handle.deliver(ServerEvent::JoinRoomError {
						room_id,
						message: e.to_string(),
					});
				}
			}
		}

		ClientEvent::ChatMessage {
			room,
			content,
			kind,
			file_data,
		} => {
			if let Err(e) = core
				.ingest
				.send(&session.user, &session.session_id, &room, content, kind, file_data)
				.await
			{
				handle.deliver(ServerEvent::Error {
					code: e.code().to_string(),
					message: e.to_string(),
				});
			}
		}

		ClientEvent::FetchPreviousMessages { room_id, before } => {
			handle.deliver(ServerEvent::MessageLoadStart {
				room_id: room_id.clone(),
			});

			match core.history.fetch(&session.user.id, &room_id, before).await {
				Ok(FetchOutcome::Page(page)) => {
					handle.deliver(ServerEvent::PreviousMessagesLoaded {
						room_id,
						messages: page.messages,
						has_more: page.has_more,
						oldest_timestamp: page.oldest_timestamp,
					});
				}
				Ok(FetchOutcome::Duplicate) => {}
				Err(e) => {
					handle.deliver(ServerEvent::Error {
						code: e.code().to_string(),
						message: e.to_string(),
					});
				}
			}
		}

		ClientEvent::MarkMessagesAsRead { room_id, message_ids } => {
			// Silent towards the caller, success or not.
			core.receipts
				.mark_read(session.conn_id, &session.user.id, &room_id, message_ids)
				.await;
		}

		ClientEvent::MessageReaction {
			message_id,
			reaction,
			op,
		} => {
			let add = op == huddle_protocol::ReactionOp::Add;
			if let Err(e) = core.receipts.react(&session.user.id, &message_id, &reaction, add).await {
				handle.deliver(ServerEvent::Error {
					code: e.code().to_string(),
					message: e.to_string(),
				});
			}
		}

		ClientEvent::Typing { room_id, is_typing } => {
			if session.room.as_ref() == Some(&room_id) {
				core.broadcaster
					.broadcast(
						&room_id,
						&ServerEvent::UserTyping {
							room_id: room_id.clone(),
							user_id: session.user.id.clone(),
							is_typing,
						},
						Some(session.conn_id),
					)
					.await;
			}
		}

		ClientEvent::UpdateUserStatus { status } => {
			if let Some(room_id) = &session.room {
				core.broadcaster
					.broadcast(
						room_id,
						&ServerEvent::UserStatusUpdate {
							user_id: session.user.id.clone(),
							status,
						},
						Some(session.conn_id),
					)
					.await;
			}
		}

		ClientEvent::ForceLogin { token } => {
			// The requester must prove it is the same user before the
			// pending pre-emption is accelerated.
			match core.auth.verify_token(&token) {
				Ok(uid) if uid == session.user.id => {
					let ended = core.connections.force_end_pending(&session.user.id, "force_logout");
					debug!(conn_id = session.conn_id, ended, "force_login processed");
				}
				_ => {
					handle.deliver(ServerEvent::Error {
						code: "INVALID_TOKEN".to_string(),
						message: "force_login token mismatch".to_string(),
					});
				}
			}
		}

		ClientEvent::Ping { .. } => {
			handle.deliver(ServerEvent::Pong {
				server_time: core.clock.now_ms(),
			});
			core.connections.touch(&session.user.id);
			core.auth.touch_session(&session.user.id, &session.session_id);
		}
	}
}
