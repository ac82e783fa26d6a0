//! Response dispatcher: the only reader of the worker's stdout.
//!
//! One background thread decodes each line and routes it by correlation id
//! to the channel registered for that request. Id-less messages (`loading`,
//! `ready`, `shutdown`, and every message from a worker that does not echo
//! ids) go to a single unsolicited channel. Responses for ids nobody is
//! waiting on any more are dropped.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, trace, warn};
use model_host_types::{decode_response, RequestId, ResponseEnvelope, ResponseMessage};

type Routes = Arc<Mutex<HashMap<RequestId, Sender<ResponseMessage>>>>;

pub struct Dispatcher {
    routes: Routes,
    unsolicited: Receiver<ResponseMessage>,
    handle: Option<JoinHandle<()>>,
}

/// Registration for one request's responses. Dropping it deregisters the id.
pub struct Route {
    id: RequestId,
    rx: Receiver<ResponseMessage>,
    routes: Routes,
}

impl Route {
    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn receiver(&self) -> &Receiver<ResponseMessage> {
        &self.rx
    }
}

impl Drop for Route {
    fn drop(&mut self) {
        lock(&self.routes).remove(&self.id);
    }
}

impl Dispatcher {
    /// Start the reader thread over the worker's stdout.
    pub fn spawn<R: Read + Send + 'static>(stdout: R) -> std::io::Result<Self> {
        let routes: Routes = Arc::new(Mutex::new(HashMap::new()));
        let (unsolicited_tx, unsolicited) = unbounded();
        let thread_routes = routes.clone();
        let handle = thread::Builder::new()
            .name("model-host-dispatch".into())
            .spawn(move || dispatch_loop(stdout, &thread_routes, &unsolicited_tx))?;
        Ok(Self {
            routes,
            unsolicited,
            handle: Some(handle),
        })
    }

    /// Register `id` before its request is written, so no response can race
    /// ahead of the registration.
    pub fn register(&self, id: RequestId) -> Route {
        let (tx, rx) = unbounded();
        lock(&self.routes).insert(id, tx);
        Route {
            id,
            rx,
            routes: self.routes.clone(),
        }
    }

    pub fn unsolicited(&self) -> &Receiver<ResponseMessage> {
        &self.unsolicited
    }

}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        // Join only a finished thread; a wedged pipe must not block teardown.
        if let Some(handle) = self.handle.take() {
            if handle.is_finished() {
                let _ = handle.join();
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn dispatch_loop<R: Read>(stdout: R, routes: &Routes, unsolicited: &Sender<ResponseMessage>) {
    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                warn!("[DISPATCH] Read from worker stdout failed: {e}");
                break;
            }
        }
        // Native libraries in the worker may print raw bytes to fd 1.
        let line = String::from_utf8_lossy(&buf);
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match decode_response(line) {
            Ok(envelope) => route(envelope, routes, unsolicited),
            Err(e) => warn!("[DISPATCH] Ignoring undecodable line ({e}): {line}"),
        }
    }
    // Dropping the senders wakes every waiter with a disconnect.
    lock(routes).clear();
    debug!("[DISPATCH] Worker stdout closed");
}

fn route(envelope: ResponseEnvelope, routes: &Routes, unsolicited: &Sender<ResponseMessage>) {
    let ResponseEnvelope { id, message } = envelope;
    match id {
        Some(id) => {
            let routes = lock(routes);
            match routes.get(&id) {
                Some(tx) => {
                    trace!("[DISPATCH] {} -> request {id}", message.kind());
                    let _ = tx.send(message);
                }
                None => debug!(
                    "[DISPATCH] Discarding `{}` for abandoned request {id}",
                    message.kind()
                ),
            }
        }
        None => {
            trace!("[DISPATCH] {} -> unsolicited", message.kind());
            let _ = unsolicited.send(message);
        }
    }
}
