//! RPC surface (§4.6): one Rocket route module per method family, mounted
//! under `/rpc/<method>` with dots replaced by slashes (e.g.
//! `POST /rpc/message/send`). Shared request guards live here.

pub mod agent;
pub mod group;
pub mod identity;
pub mod message;
pub mod session;
pub mod subscription;
pub mod system;
pub mod thread;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rocket::outcome::Outcome;
use rocket::request::{self, FromRequest, Request};

use crate::error::Error;
use crate::store::Store;

/// Resolves the calling session from an `X-Session-Id` header and confirms
/// it is still active. Most methods require a session; a few (`user.*`,
/// `health`) opt out by not using this guard.
pub struct SessionContext {
    pub session_id: String,
    pub agent_id: String,
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for SessionContext {
    type Error = Error;

    async fn from_request(req: &'r Request<'_>) -> request::Outcome<Self, Self::Error> {
        let Some(session_id) = req.headers().get_one("X-Session-Id") else {
            return Outcome::Error((
                rocket::http::Status::BadRequest,
                Error::InvalidArgument("missing X-Session-Id header".to_string()),
            ));
        };

        let store = match req.rocket().state::<Arc<Store>>() {
            Some(s) => s,
            None => {
                return Outcome::Error((
                    rocket::http::Status::InternalServerError,
                    Error::Internal("store not managed".to_string()),
                ))
            }
        };

        match store.get_session(session_id) {
            Ok(Some(session)) if session.active => Outcome::Success(SessionContext {
                session_id: session.session_id,
                agent_id: session.agent_id,
            }),
            Ok(Some(_)) => Outcome::Error((
                rocket::http::Status::Unauthorized,
                Error::InvalidArgument("session has ended".to_string()),
            )),
            Ok(None) => Outcome::Error((
                rocket::http::Status::Unauthorized,
                Error::NotFound("unknown session".to_string()),
            )),
            Err(e) => Outcome::Error((rocket::http::Status::InternalServerError, e)),
        }
    }
}

/// RAII cancellation token, handed to long-running handlers (`wait`). Its
/// `cancelled` flag is checked on every wake-up; dropping the guard (the
/// request future being dropped on client disconnect) does not itself flip
/// the flag since Rocket gives no synchronous disconnect signal, but
/// shutdown flips it directly via `cancel()`.
pub struct CancellationGuard {
    pub cancelled: Arc<AtomicBool>,
}

impl CancellationGuard {
    pub fn new() -> Self {
        CancellationGuard {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

impl Default for CancellationGuard {
    fn default() -> Self {
        Self::new()
    }
}
