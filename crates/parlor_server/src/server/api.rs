#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use http_body_util::{BodyExt as _, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parlor_domain::{RoomId, UserId};
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{error, warn};

use crate::server::identity::AuthService;
use crate::server::launch::AuthError;
use crate::server::rooms::{RoomError, RoomService};

/// Header carrying the opaque signed launch payload.
pub const LAUNCH_DATA_HEADER: &str = "x-launch-data";

/// Readiness flag flipped once startup completes.
#[derive(Clone, Default)]
pub struct HealthState {
	ready: Arc<AtomicBool>,
}

impl HealthState {
	pub fn new() -> Self {
		Self {
			ready: Arc::new(AtomicBool::new(false)),
		}
	}

	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}
}

/// Shared handles for request handling.
#[derive(Clone)]
pub struct ApiState {
	pub auth: Arc<AuthService>,
	pub rooms: Arc<RoomService>,
	pub health: HealthState,
}

/// Accept loop for the HTTP API.
pub async fn run_api_server(bind: SocketAddr, state: ApiState) -> anyhow::Result<()> {
	let listener = TcpListener::bind(bind).await?;
	loop {
		let (stream, _addr) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let state = state.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| handle_request(req, state.clone()));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				warn!(error = %err, "api connection error");
			}
		});
	}
}

/// Routes the API serves; everything else is 404.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
	Healthz,
	Readyz,
	Authenticate,
	CreateRoom,
	ListRooms,
	JoinRoom(String),
	ExitRoom(String),
	DeleteRoom(String),
}

/// Map a method and path to a route.
pub fn route(method: &Method, path: &str) -> Option<Route> {
	let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
	match segments.as_slice() {
		["healthz"] if *method == Method::GET => Some(Route::Healthz),
		["readyz"] if *method == Method::GET => Some(Route::Readyz),
		["auth"] if *method == Method::POST => Some(Route::Authenticate),
		["rooms"] if *method == Method::POST => Some(Route::CreateRoom),
		["rooms"] if *method == Method::GET => Some(Route::ListRooms),
		["rooms", id, "join"] if *method == Method::POST => Some(Route::JoinRoom((*id).to_string())),
		["rooms", id, "exit"] if *method == Method::POST => Some(Route::ExitRoom((*id).to_string())),
		["rooms", id] if *method == Method::DELETE => Some(Route::DeleteRoom((*id).to_string())),
		_ => None,
	}
}

#[derive(Debug, Deserialize)]
struct CreateRoomRequest {
	room_name: String,
	user_id: i64,
}

#[derive(Debug, Deserialize)]
struct MemberRequest {
	user_id: i64,
}

async fn handle_request(req: Request<Incoming>, state: ApiState) -> Result<Response<Full<Bytes>>, hyper::Error> {
	let Some(route) = route(req.method(), req.uri().path()) else {
		return Ok(error_response(StatusCode::NOT_FOUND, "no such route"));
	};

	match route {
		Route::Healthz => Ok(text_response(StatusCode::OK, "ok")),
		Route::Readyz => {
			if state.health.is_ready() {
				Ok(text_response(StatusCode::OK, "ready"))
			} else {
				Ok(text_response(StatusCode::SERVICE_UNAVAILABLE, "not-ready"))
			}
		}
		other => Ok(dispatch(other, req, state).await),
	}
}

async fn dispatch(route: Route, req: Request<Incoming>, state: ApiState) -> Response<Full<Bytes>> {
	metrics::counter!("parlor_api_requests_total").increment(1);

	let Some(token) = req
		.headers()
		.get(LAUNCH_DATA_HEADER)
		.and_then(|v| v.to_str().ok())
		.map(str::to_string)
	else {
		return error_response(StatusCode::UNAUTHORIZED, "missing launch data header");
	};

	if let Route::Authenticate = route {
		return match state.auth.authenticate(&token).await {
			Ok(identity) => json_response(StatusCode::OK, &identity),
			Err(err) => auth_error_response(err),
		};
	}

	// every room route is gated on a verified signature
	if let Err(err) = state.auth.verify_only(&token) {
		return auth_error_response(err);
	}

	match route {
		Route::CreateRoom => {
			let body: CreateRoomRequest = match read_json(req).await {
				Ok(body) => body,
				Err(resp) => return resp,
			};
			match state.rooms.create(&body.room_name, UserId(body.user_id)).await {
				Ok(room) => json_response(StatusCode::OK, &room),
				Err(err) => room_error_response(err),
			}
		}
		Route::ListRooms => {
			let Some(user) = query_user_id(req.uri().query()) else {
				return error_response(StatusCode::BAD_REQUEST, "missing or invalid user_id query parameter");
			};
			match state.rooms.list_for_member(user).await {
				Ok(rooms) => json_response(StatusCode::OK, &rooms),
				Err(err) => room_error_response(err),
			}
		}
		Route::JoinRoom(id) => {
			let Ok(room_id) = RoomId::new(id) else {
				return error_response(StatusCode::NOT_FOUND, "room not found");
			};
			let body: MemberRequest = match read_json(req).await {
				Ok(body) => body,
				Err(resp) => return resp,
			};
			match state.rooms.join(&room_id, UserId(body.user_id)).await {
				Ok(room) => json_response(StatusCode::OK, &room),
				Err(err) => room_error_response(err),
			}
		}
		Route::ExitRoom(id) => {
			let Ok(room_id) = RoomId::new(id) else {
				return error_response(StatusCode::NOT_FOUND, "room not found");
			};
			let body: MemberRequest = match read_json(req).await {
				Ok(body) => body,
				Err(resp) => return resp,
			};
			match state.rooms.exit(&room_id, UserId(body.user_id)).await {
				Ok(room) => json_response(StatusCode::OK, &room),
				Err(err) => room_error_response(err),
			}
		}
		Route::DeleteRoom(id) => {
			let Ok(room_id) = RoomId::new(id) else {
				return error_response(StatusCode::NOT_FOUND, "room not found");
			};
			let body: MemberRequest = match read_json(req).await {
				Ok(body) => body,
				Err(resp) => return resp,
			};
			match state.rooms.delete(&room_id, UserId(body.user_id)).await {
				Ok(()) => json_response(StatusCode::OK, &serde_json::json!({ "status": "deleted" })),
				Err(err) => room_error_response(err),
			}
		}
		Route::Healthz | Route::Readyz | Route::Authenticate => {
			// handled before dispatch
			error_response(StatusCode::NOT_FOUND, "no such route")
		}
	}
}

fn query_user_id(query: Option<&str>) -> Option<UserId> {
	let query = query?;
	url::form_urlencoded::parse(query.as_bytes())
		.find(|(key, _)| key == "user_id")
		.and_then(|(_, value)| value.trim().parse::<i64>().ok())
		.map(UserId)
}

async fn read_json<T: serde::de::DeserializeOwned>(req: Request<Incoming>) -> Result<T, Response<Full<Bytes>>> {
	let body = match req.into_body().collect().await {
		Ok(collected) => collected.to_bytes(),
		Err(err) => {
			return Err(error_response(StatusCode::BAD_REQUEST, &format!("read body: {err}")));
		}
	};

	serde_json::from_slice(&body)
		.map_err(|err| error_response(StatusCode::BAD_REQUEST, &format!("invalid request body: {err}")))
}

fn auth_error_response(err: AuthError) -> Response<Full<Bytes>> {
	match err {
		AuthError::MalformedInput(_) | AuthError::MissingIdentity(_) => {
			error_response(StatusCode::BAD_REQUEST, &err.to_string())
		}
		AuthError::InvalidSignature => {
			metrics::counter!("parlor_auth_rejected_total").increment(1);
			warn!("rejected launch data with bad signature");
			error_response(StatusCode::UNAUTHORIZED, "invalid signature")
		}
		AuthError::Storage(err) => {
			error!(error = %err, "identity persistence failed");
			error_response(StatusCode::INTERNAL_SERVER_ERROR, "storage failure")
		}
	}
}

fn room_error_response(err: RoomError) -> Response<Full<Bytes>> {
	match err {
		RoomError::InvalidName | RoomError::UnknownOwner(_) => error_response(StatusCode::BAD_REQUEST, &err.to_string()),
		RoomError::NotFound => error_response(StatusCode::NOT_FOUND, &err.to_string()),
		RoomError::PermissionDenied => error_response(StatusCode::FORBIDDEN, &err.to_string()),
		RoomError::Storage(err) => {
			error!(error = %err, "room store failure");
			error_response(StatusCode::INTERNAL_SERVER_ERROR, "storage failure")
		}
	}
}

fn json_response<T: serde::Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
	match serde_json::to_vec(value) {
		Ok(body) => Response::builder()
			.status(status)
			.header(hyper::header::CONTENT_TYPE, "application/json")
			.body(Full::new(Bytes::from(body)))
			.unwrap(),
		Err(err) => {
			error!(error = %err, "response serialization failed");
			error_response(StatusCode::INTERNAL_SERVER_ERROR, "response serialization failed")
		}
	}
}

fn error_response(status: StatusCode, detail: &str) -> Response<Full<Bytes>> {
	let body = serde_json::json!({ "error": detail });
	Response::builder()
		.status(status)
		.header(hyper::header::CONTENT_TYPE, "application/json")
		.body(Full::new(Bytes::from(body.to_string())))
		.unwrap()
}

fn text_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
	Response::builder()
		.status(status)
		.body(Full::new(Bytes::from_static(body.as_bytes())))
		.unwrap()
}
