/// Process-level entry point.
///
/// A `Wdt` owns an options registry and the send-side concurrency guard.
/// Sessions snapshot the options when they are created, so editing them
/// through `options_mut()` only affects sessions started afterwards.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;

use parking_lot::{Mutex, RwLock, RwLockWriteGuard};

use crate::error::ErrorCode;
use crate::guard::{send_key, ConcurrencyGuard};
use crate::options::WdtOptions;
use crate::progress::ProgressReporter;
use crate::request::TransferRequest;
use crate::sender::Sender;

pub struct Wdt {
    app_name: String,
    options: RwLock<WdtOptions>,
    send_guard: ConcurrencyGuard,
    pending: Mutex<Vec<JoinHandle<ErrorCode>>>,
}

/// Instances created through `Wdt::initialize`, keyed by app name.
static INSTANCES: OnceLock<Mutex<HashMap<String, Arc<Wdt>>>> = OnceLock::new();

impl Wdt {
    pub fn new(app_name: impl Into<String>, options: WdtOptions) -> Self {
        Wdt {
            app_name: app_name.into(),
            options: RwLock::new(options),
            send_guard: ConcurrencyGuard::new(),
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Shared instance for `app_name`, created on first use with options
    /// from the `WDT_*` environment. Invalid environment settings fall back
    /// to defaults.
    pub fn initialize(app_name: &str) -> Arc<Wdt> {
        let instances = INSTANCES.get_or_init(|| Mutex::new(HashMap::new()));
        instances
            .lock()
            .entry(app_name.to_string())
            .or_insert_with(|| {
                let options = WdtOptions::from_env().unwrap_or_else(|e| {
                    tracing::warn!("ignoring WDT_* environment: {}", e);
                    WdtOptions::default()
                });
                tracing::info!(app = app_name, "wdt initialized");
                Arc::new(Wdt::new(app_name, options))
            })
            .clone()
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    /// Snapshot of the current options.
    pub fn options(&self) -> Arc<WdtOptions> {
        Arc::new(self.options.read().clone())
    }

    pub fn options_mut(&self) -> RwLockWriteGuard<'_, WdtOptions> {
        self.options.write()
    }

    pub fn guard(&self) -> &ConcurrencyGuard {
        &self.send_guard
    }

    /// Send `request.directory` to the receiver described by `request`.
    ///
    /// A transfer with the same identity to the same host already in flight
    /// makes this return `AlreadyExists` without touching the network. With
    /// `blocking` false the transfer runs in the background, `Ok` means it
    /// started, and `wait_for_sends` collects the outcome.
    pub fn wdt_send(
        &self,
        identity: &str,
        request: TransferRequest,
        reporter: Option<Arc<dyn ProgressReporter>>,
        blocking: bool,
    ) -> ErrorCode {
        let key = send_key(identity, &request.host);
        let Some(ticket) = self.send_guard.try_acquire(key) else {
            tracing::warn!(identity, host = %request.host, "transfer already in progress");
            return ErrorCode::AlreadyExists;
        };

        let request = request.with_identity(identity);
        let mut sender = Sender::new(request, self.options());
        if let Some(reporter) = reporter {
            sender = sender.with_progress_reporter(reporter);
        }

        if blocking {
            let code = sender.transfer().error_code();
            drop(ticket);
            return code;
        }

        let spawned = std::thread::Builder::new()
            .name("wdt-send-job".into())
            .spawn(move || {
                let _ticket = ticket;
                sender.transfer().error_code()
            });
        match spawned {
            Ok(handle) => {
                self.pending.lock().push(handle);
                ErrorCode::Ok
            }
            // The closure, and the ticket with it, is dropped here.
            Err(e) => {
                tracing::error!(identity, "cannot spawn send thread: {}", e);
                ErrorCode::Error
            }
        }
    }

    /// Wait for every background send started so far. Returns the worst
    /// outcome among them, `Ok` when there were none.
    pub fn wait_for_sends(&self) -> ErrorCode {
        let handles: Vec<_> = self.pending.lock().drain(..).collect();
        ErrorCode::fold(
            handles
                .into_iter()
                .map(|h| h.join().unwrap_or(ErrorCode::Error)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initialize_is_idempotent_per_name() {
        let a = Wdt::initialize("wdt-facade-test");
        let b = Wdt::initialize("wdt-facade-test");
        let c = Wdt::initialize("wdt-facade-test-other");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(a.app_name(), "wdt-facade-test");
    }

    #[test]
    fn options_snapshot_is_frozen() {
        let wdt = Wdt::new("snap", WdtOptions::default());
        let before = wdt.options();
        wdt.options_mut().num_ports = 3;
        assert_eq!(before.num_ports, 8);
        assert_eq!(wdt.options().num_ports, 3);
    }

    #[test]
    fn held_identity_short_circuits() {
        let wdt = Wdt::new("guarded", WdtOptions::default());
        let src = tempfile::tempdir().unwrap();
        let _held = wdt.guard().try_acquire(send_key("job", "localhost")).unwrap();
        let code = wdt.wdt_send("job", TransferRequest::new(0, 1, src.path()), None, true);
        assert_eq!(code, ErrorCode::AlreadyExists);
        assert_eq!(wdt.guard().len(), 1);
    }

    #[test]
    fn no_pending_sends_is_ok() {
        let wdt = Wdt::new("idle", WdtOptions::default());
        assert_eq!(wdt.wait_for_sends(), ErrorCode::Ok);
    }
}
