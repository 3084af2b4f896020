//! turnwatch daemon entrypoint.
//!
//! A socket listener with strict request validation in front of the capture
//! coordinator, plus the periodic background workers. Several daemons may
//! share one database; the per-entity advisory lock keeps them consistent.

use clap::Parser;
use fs_err as fs;
use serde::Serialize;
use std::env;
use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use chrono::Utc;
use serde_json::Value;
use turnwatch_daemon::admission::ForegroundLimit;
use turnwatch_daemon::broadcast::{Broadcaster, OutboxBroadcaster};
use turnwatch_daemon::capture::{CaptureTimeouts, TransitionOutcome, TurnCaptureCoordinator};
use turnwatch_daemon::config::{self, DaemonConfig};
use turnwatch_daemon::db::{Db, PoolOptions};
use turnwatch_daemon::error::{AdmissionError, CaptureError, LockError};
use turnwatch_daemon::lock::{AdvisoryLockManager, SqliteLockBackend, ENTITY_NAMESPACE};
use turnwatch_daemon::reconciler::TranscriptReconciler;
use turnwatch_daemon::sampler::{OutputSampler, TmuxPaneSampler};
use turnwatch_daemon::store::TurnStore;
use turnwatch_daemon::transcript::JsonlTranscriptSource;
use turnwatch_daemon::watchdog::GapWatchdog;
use turnwatch_daemon::workers::{
    ContextPoller, HealthReaper, ReconcilerDriver, WatchdogDriver, WorkerLoop,
};
use turnwatch_protocol::{
    parse_params, BroadcastQuery, EndEntityParams, EntityRegistration, ErrorInfo, Method, Request,
    Response, TurnQuery, TurnSignal, MAX_REQUEST_BYTES, PROTOCOL_VERSION,
};

const SOCKET_NAME: &str = "daemon.sock";
const DB_NAME: &str = "state.db";
const READ_TIMEOUT_SECS: u64 = 2;
const READ_CHUNK_SIZE: usize = 4096;
const MAX_QUERY_LIMIT: usize = 1000;

#[derive(Debug, Parser)]
#[command(name = "turnwatch-daemon", version, about)]
struct Cli {
    /// Config file (default: ~/.turnwatch/daemon.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory that holds `.turnwatch/` (default: the user's home)
    #[arg(long)]
    home: Option<PathBuf>,
}

struct Daemon {
    config: DaemonConfig,
    db: Arc<Db>,
    lock_backend: Arc<SqliteLockBackend>,
    locks: Arc<AdvisoryLockManager>,
    foreground: Arc<ForegroundLimit>,
    capture: TurnCaptureCoordinator,
    workers: Vec<Arc<WorkerLoop>>,
}

fn main() {
    init_logging();
    let cli = Cli::parse();

    let turnwatch_home = match config::turnwatch_home(cli.home.as_deref()) {
        Ok(path) => path,
        Err(err) => {
            error!(error = %err, "Failed to resolve turnwatch home");
            std::process::exit(1);
        }
    };

    let config_path = cli
        .config
        .unwrap_or_else(|| turnwatch_home.join(config::CONFIG_FILE));
    let daemon_config = match config::load_config(&config_path) {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, path = %config_path.display(), "Invalid daemon config");
            std::process::exit(1);
        }
    };

    let socket_path = turnwatch_home.join(SOCKET_NAME);
    if let Err(err) = prepare_socket_dir(&socket_path) {
        error!(error = %err, "Failed to prepare daemon socket directory");
        std::process::exit(1);
    }
    if let Err(err) = remove_existing_socket(&socket_path) {
        error!(error = %err, path = %socket_path.display(), "Failed to remove existing socket");
        std::process::exit(1);
    }

    let daemon = match build_daemon(&turnwatch_home, daemon_config) {
        Ok(daemon) => Arc::new(daemon),
        Err(err) => {
            error!(error = %err, "Failed to initialize daemon");
            std::process::exit(1);
        }
    };

    let listener = match UnixListener::bind(&socket_path) {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, path = %socket_path.display(), "Failed to bind daemon socket");
            std::process::exit(1);
        }
    };

    spawn_workers(&daemon);
    info!(
        path = %socket_path.display(),
        pool_size = daemon.config.pool_size,
        lock_wait_timeout_secs = daemon.config.lock_wait_timeout_secs,
        "turnwatch daemon started"
    );

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let daemon = Arc::clone(&daemon);
                thread::spawn(move || handle_connection(stream, daemon));
            }
            Err(err) => {
                warn!(error = %err, "Failed to accept daemon connection");
            }
        }
    }
}

fn build_daemon(turnwatch_home: &Path, config: DaemonConfig) -> Result<Daemon, String> {
    let db = Arc::new(Db::with_pool(
        turnwatch_home.join(DB_NAME),
        PoolOptions {
            capacity: config.pool_size,
            checkout_timeout: config.pool_checkout_timeout(),
        },
    )?);
    let lock_backend = Arc::new(SqliteLockBackend::new(Arc::clone(&db)));
    let locks = Arc::new(AdvisoryLockManager::new(lock_backend.clone()));
    let broadcaster: Arc<dyn Broadcaster> = Arc::new(OutboxBroadcaster::new(Arc::clone(&db)));
    let store: Arc<dyn TurnStore> = db.clone();
    let foreground = Arc::new(ForegroundLimit::new(config.peak_foreground_handlers));

    let capture = TurnCaptureCoordinator::new(
        Arc::clone(&locks),
        Arc::clone(&store),
        Arc::clone(&broadcaster),
        CaptureTimeouts {
            foreground: config.lock_wait_timeout(),
            deferred: config.deferred_lock_wait_timeout(),
        },
    )
    .with_foreground_limit(Arc::clone(&foreground));

    let reconciler = Arc::new(TranscriptReconciler::new(
        Arc::clone(&store),
        Arc::clone(&broadcaster),
        config.reconcile_window(),
    ));
    let reconciler_driver = Arc::new(ReconcilerDriver::new(
        Arc::clone(&db),
        Arc::new(JsonlTranscriptSource),
        reconciler,
    ));
    let sampler: Arc<dyn OutputSampler> = Arc::new(TmuxPaneSampler);
    let watchdog = Arc::new(GapWatchdog::new(config.gap_threshold()));

    let workers = vec![
        Arc::new(WorkerLoop::new(
            Arc::new(HealthReaper::new(
                Arc::clone(&db),
                lock_backend.clone(),
                config.inactivity_timeout(),
            )),
            Arc::clone(&locks),
        )),
        Arc::new(WorkerLoop::new(reconciler_driver.clone(), Arc::clone(&locks))),
        Arc::new(WorkerLoop::new(
            Arc::new(WatchdogDriver::new(
                Arc::clone(&db),
                Arc::clone(&sampler),
                watchdog,
                reconciler_driver,
            )),
            Arc::clone(&locks),
        )),
        Arc::new(WorkerLoop::new(
            Arc::new(ContextPoller::new(Arc::clone(&db), sampler)),
            Arc::clone(&locks),
        )),
    ];

    Ok(Daemon {
        config,
        db,
        lock_backend,
        locks,
        foreground,
        capture,
        workers,
    })
}

fn spawn_workers(daemon: &Daemon) {
    let config = &daemon.config;
    let intervals = [
        config.reaper_interval_secs,
        config.reconcile_interval_secs,
        config.watchdog_interval_secs,
        config.context_poll_interval_secs,
    ];
    for (worker, secs) in daemon.workers.iter().zip(intervals) {
        let name = worker.stats().name;
        match Arc::clone(worker).spawn(Duration::from_secs(secs)) {
            Ok(_) => info!(worker = name, interval_secs = secs, "Background worker started"),
            Err(err) => warn!(worker = name, error = %err, "Failed to start background worker"),
        }
    }
}

fn init_logging() {
    let debug_enabled = env::var("TURNWATCH_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn prepare_socket_dir(socket_path: &Path) -> Result<(), String> {
    let parent = socket_path
        .parent()
        .ok_or_else(|| "Socket path has no parent".to_string())?;
    fs::create_dir_all(parent).map_err(|err| format!("Failed to create socket directory: {}", err))
}

fn remove_existing_socket(socket_path: &Path) -> Result<(), String> {
    if socket_path.exists() {
        fs::remove_file(socket_path)
            .map_err(|err| format!("Failed to remove existing socket: {}", err))?;
    }
    Ok(())
}

fn handle_connection(mut stream: UnixStream, daemon: Arc<Daemon>) {
    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            warn!(code = %err.code, message = %err.message, "Failed to read request");
            let response = Response::error_with_info(None, err);
            let _ = write_response(&mut stream, response);
            return;
        }
    };

    tracing::debug!(method = ?request.method, id = ?request.id, "Daemon request received");
    let response = handle_request(request, &daemon);
    let _ = write_response(&mut stream, response);
}

fn read_request(stream: &mut UnixStream) -> Result<Request, ErrorInfo> {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(READ_TIMEOUT_SECS)));

    let mut buffer = Vec::new();
    let mut chunk = [0u8; READ_CHUNK_SIZE];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err(ErrorInfo::new(
                        "request_too_large",
                        "request exceeded maximum size",
                    ));
                }
                if chunk[..n].contains(&b'\n') {
                    break;
                }
            }
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                return Err(ErrorInfo::new("read_timeout", "request timed out"));
            }
            Err(err) => {
                return Err(ErrorInfo::new(
                    "read_error",
                    format!("failed to read request: {}", err),
                ));
            }
        }
    }

    let request_bytes = match buffer.iter().position(|b| *b == b'\n') {
        Some(index) => &buffer[..index],
        None => buffer.as_slice(),
    };
    if request_bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ErrorInfo::new("empty_request", "request body was empty"));
    }

    serde_json::from_slice(request_bytes).map_err(|err| {
        ErrorInfo::new(
            "invalid_json",
            format!("request was not valid JSON: {}", err),
        )
    })
}

fn handle_request(request: Request, daemon: &Daemon) -> Response {
    if request.protocol_version != PROTOCOL_VERSION {
        return Response::error(
            request.id,
            "protocol_mismatch",
            "unsupported protocol version",
        );
    }

    let id = request.id;
    let params = request.params.unwrap_or(Value::Null);
    match request.method {
        Method::GetHealth => {
            let workers: Vec<_> = daemon.workers.iter().map(|worker| worker.stats()).collect();
            json_response(
                id,
                &serde_json::json!({
                    "status": "ok",
                    "pid": std::process::id(),
                    "version": env!("CARGO_PKG_VERSION"),
                    "protocol_version": PROTOCOL_VERSION,
                    "pool": daemon.db.pool().stats(),
                    "lock_sessions": daemon.lock_backend.session_stats(),
                    "foreground": {
                        "limit": daemon.foreground.limit(),
                        "in_flight": daemon.foreground.in_flight(),
                        "peak": daemon.foreground.peak(),
                    },
                    "workers": workers,
                }),
            )
        }
        Method::RegisterEntity => {
            let registration: EntityRegistration =
                match parse_params(params, EntityRegistration::validate) {
                    Ok(parsed) => parsed,
                    Err(err) => return Response::error_with_info(id, err),
                };
            match daemon.db.register_entity(&registration, Utc::now()) {
                Ok(entity) => {
                    info!(
                        entity_id = entity.id,
                        external_id = %entity.external_id,
                        "Entity registered"
                    );
                    json_response(id, &entity)
                }
                Err(err) => Response::error(id, "store_error", err),
            }
        }
        Method::EndEntity => {
            let parsed: EndEntityParams = match parse_params(params, EndEntityParams::validate) {
                Ok(parsed) => parsed,
                Err(err) => return Response::error_with_info(id, err),
            };
            end_entity(id, daemon, parsed)
        }
        Method::Signal => {
            let signal: TurnSignal = match parse_params(params, TurnSignal::validate) {
                Ok(parsed) => parsed,
                Err(err) => return Response::error_with_info(id, err),
            };
            handle_signal(id, daemon, &signal)
        }
        Method::GetTurns => {
            let query: TurnQuery = match parse_params(params, TurnQuery::validate) {
                Ok(parsed) => parsed,
                Err(err) => return Response::error_with_info(id, err),
            };
            match daemon
                .db
                .list_turns(query.entity_id, query.limit.min(MAX_QUERY_LIMIT))
            {
                Ok(turns) => {
                    let views: Vec<_> = turns.iter().map(|turn| turn.to_view()).collect();
                    json_response(id, &views)
                }
                Err(err) => Response::error(id, "store_error", err),
            }
        }
        Method::GetLocks => match daemon.locks.held_locks() {
            Ok(locks) => json_response(id, &locks),
            Err(err) => Response::error(id, "lock_error", err),
        },
        Method::GetBroadcasts => {
            let params = if params.is_null() {
                serde_json::json!({})
            } else {
                params
            };
            let query: BroadcastQuery = match parse_params(params, BroadcastQuery::validate) {
                Ok(parsed) => parsed,
                Err(err) => return Response::error_with_info(id, err),
            };
            match daemon
                .db
                .list_broadcasts(query.after_id, query.limit.min(MAX_QUERY_LIMIT))
            {
                Ok(rows) => json_response(id, &rows),
                Err(err) => Response::error(id, "store_error", err),
            }
        }
    }
}

fn handle_signal(id: Option<String>, daemon: &Daemon, signal: &TurnSignal) -> Response {
    match daemon.capture.capture(signal) {
        Ok(outcome) => {
            let turn_id = outcome.turn.id;
            match outcome.transition {
                TransitionOutcome::Applied { from, to } => json_response(
                    id,
                    &serde_json::json!({
                        "turn": outcome.turn.to_view(),
                        "task_id": outcome.task_id,
                        "from": from,
                        "to": to,
                    }),
                ),
                TransitionOutcome::Rejected(err) => Response::error(
                    id,
                    "invalid_transition",
                    format!("{}; turn {} was recorded", err, turn_id),
                ),
                TransitionOutcome::Conflict { expected } => Response::error(
                    id,
                    "transition_conflict",
                    format!(
                        "task left state {} before the transition committed; turn {} was recorded",
                        expected.as_str(),
                        turn_id
                    ),
                ),
            }
        }
        Err(err) => {
            let code = capture_error_code(&err);
            warn!(entity_id = signal.entity_id, code, error = %err, "Signal capture failed");
            Response::error(id, code, err.to_string())
        }
    }
}

fn end_entity(id: Option<String>, daemon: &Daemon, params: EndEntityParams) -> Response {
    let wait = daemon.config.lock_wait_timeout();
    let started = Instant::now();
    let permit = match daemon.foreground.acquire(wait) {
        Ok(permit) => permit,
        Err(err) => return Response::error(id, admission_error_code(&err), err.to_string()),
    };
    let guard = match daemon.locks.acquire_blocking(
        ENTITY_NAMESPACE,
        params.entity_id,
        wait.saturating_sub(started.elapsed()),
    ) {
        Ok(guard) => guard,
        Err(err) => return Response::error(id, lock_error_code(&err), err.to_string()),
    };
    let reason = params.reason.as_deref().unwrap_or("ended");
    let result = daemon.db.end_entity(params.entity_id, reason, Utc::now());
    guard.release();
    drop(permit);

    match result {
        Ok(ended) => {
            if ended {
                info!(entity_id = params.entity_id, reason, "Entity ended");
            }
            json_response(id, &serde_json::json!({ "ended": ended }))
        }
        Err(err) => Response::error(id, "store_error", err),
    }
}

fn capture_error_code(err: &CaptureError) -> &'static str {
    match err {
        CaptureError::Admission(admission) => admission_error_code(admission),
        CaptureError::Lock(lock) => lock_error_code(lock),
        CaptureError::UnknownEntity(_) => "unknown_entity",
        CaptureError::EntityEnded(_) => "entity_ended",
        CaptureError::Store(_) => "store_error",
    }
}

fn admission_error_code(err: &AdmissionError) -> &'static str {
    match err {
        AdmissionError::Timeout { .. } => "handler_limit",
        AdmissionError::Closed => "shutting_down",
    }
}

fn lock_error_code(err: &LockError) -> &'static str {
    match err {
        LockError::Timeout { .. } => "lock_timeout",
        LockError::Reentrancy { .. } => "lock_reentrancy",
        LockError::PoolExhausted { .. } => "pool_exhausted",
        LockError::Backend(_) => "lock_error",
    }
}

fn json_response<T: Serialize>(id: Option<String>, value: &T) -> Response {
    match serde_json::to_value(value) {
        Ok(value) => Response::ok(id, value),
        Err(err) => Response::error(
            id,
            "serialization_error",
            format!("Failed to serialize response: {}", err),
        ),
    }
}

fn write_response(stream: &mut UnixStream, response: Response) -> Result<(), String> {
    let mut payload = serde_json::to_vec(&response)
        .map_err(|err| format!("Failed to serialize response: {}", err))?;
    payload.push(b'\n');
    stream
        .write_all(&payload)
        .map_err(|err| format!("Failed to write response: {}", err))
}
