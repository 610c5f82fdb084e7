use futures::FutureExt;
use std::any::Any;
use std::fmt::{self, Debug, Display, Formatter};
use std::panic::AssertUnwindSafe;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ActorError {
    #[error("Pre-start initialization failed: {0}")]
    PreStartFailed(String),
    #[error("Actor logic encountered an error: {0}")]
    LogicError(String),
    #[error("Post-stop cleanup failed: {0}")]
    PostStopFailed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorStatus {
    Starting,
    PreStartFailed,
    Running,
    ExitedGracefully,
    ExitedWithError,
    Panicked,
    PostStopFailed,
    ShutDown,
}

impl Display for ActorStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ActorStatus::Starting => "starting",
            ActorStatus::PreStartFailed => "pre_start_failed",
            ActorStatus::Running => "running",
            ActorStatus::ExitedGracefully => "exited_gracefully",
            ActorStatus::ExitedWithError => "exited_with_error",
            ActorStatus::Panicked => "panicked",
            ActorStatus::PostStopFailed => "post_stop_failed",
            ActorStatus::ShutDown => "shut_down",
        })
    }
}

pub trait Actor: Send + Sized {
    type ID: Display + Debug + Clone + Send + Sync + 'static;

    fn kind(&self) -> &'static str;

    fn id(&self) -> Self::ID;

    /// Called once before the main `run` loop starts.
    fn pre_start(&mut self) -> impl Future<Output = Result<(), ActorError>> + Send {
        async { Ok(()) }
    }

    /// The main logic of the actor.
    fn run(&mut self) -> impl Future<Output = Result<(), ActorError>> + Send;

    /// Called once after `run` completes (Ok, Err or panic), or if
    /// `pre_start` fails. Must not assume `run` left the actor consistent.
    fn post_stop(&mut self) -> impl Future<Output = Result<(), ActorError>> + Send {
        async { Ok(()) }
    }
}

/// Drives an actor through pre_start, run and post_stop, catching panics so a
/// misbehaving actor only takes itself down. Returns the final status.
pub async fn run<A>(actor: A) -> ActorStatus
where
    A: Actor,
{
    let kind = actor.kind();
    let id = actor.id();

    run_instrumented(actor, kind, id).await
}

#[tracing::instrument(
    name = "actor_run",
    skip_all,
    fields(
        actor.kind = %kind,
        actor.id = %id,
        status = tracing::field::Empty,
    )
)]
async fn run_instrumented<A>(mut actor: A, kind: &'static str, id: A::ID) -> ActorStatus
where
    A: Actor,
{
    let span = tracing::Span::current();
    tracing::debug!("starting actor");
    metrics::gauge!("actors_active", "kind" => kind).increment(1.0);

    let mut status = match actor.pre_start().await {
        Ok(()) => ActorStatus::Running,
        Err(err) => {
            tracing::error!(error = %err, "pre_start failed");
            ActorStatus::PreStartFailed
        }
    };
    span.record("status", tracing::field::display(status));

    if status == ActorStatus::Running {
        status = match AssertUnwindSafe(actor.run()).catch_unwind().await {
            Ok(Ok(())) => ActorStatus::ExitedGracefully,
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "exited with an error");
                ActorStatus::ExitedWithError
            }
            Err(payload) => {
                tracing::error!(panic.message = %extract_panic_message(&payload), "PANICKED!");
                ActorStatus::Panicked
            }
        };
        span.record("status", tracing::field::display(status));
    }

    match actor.post_stop().await {
        Ok(()) if status == ActorStatus::ExitedGracefully => status = ActorStatus::ShutDown,
        Ok(()) => {}
        Err(err) => {
            tracing::warn!(error = %err, "post_stop failed");
            if status != ActorStatus::Panicked && status != ActorStatus::PreStartFailed {
                status = ActorStatus::PostStopFailed;
            }
        }
    }

    metrics::gauge!("actors_active", "kind" => kind).decrement(1.0);
    span.record("status", tracing::field::display(status));
    tracing::debug!("fully shut down with final status: {status}");
    status
}

fn extract_panic_message(payload: &Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        format!("{:?}", payload)
    }
}
