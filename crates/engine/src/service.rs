//! Background save service.
//!
//! Requests run one at a time on a dedicated worker thread that owns the
//! [`ContactSaver`]. Each request resolves to exactly one completion, which
//! the owning thread delivers to the registered callback when it calls
//! [`SaveServiceHandle::dispatch_completions`]. Callbacks whose caller has
//! detached are dropped unseen.

use std::collections::HashMap;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use tracing::{debug, info, info_span, warn};

use contactsave_core::{Account, CardId, ContactId, ContactRef, DataId, DataValues, GroupId, RawContactId, RequestId};
use contactsave_storage::ContactStore;

use crate::error::EngineError;
use crate::{ContactSaver, SaveRequest, SaveResult};

#[derive(Debug, Clone)]
pub enum Request {
    Save(SaveRequest),
    CreateRawContact {
        account: Account,
        rows: Vec<DataValues>,
    },
    CreateGroup {
        account: Account,
        label: String,
        members: Vec<RawContactId>,
    },
    RenameGroup {
        group: GroupId,
        label: String,
    },
    UpdateGroup {
        group: GroupId,
        label: Option<String>,
        add: Vec<RawContactId>,
        remove: Vec<RawContactId>,
    },
    DeleteGroup(GroupId),
    DeleteContact(ContactId),
    DeleteAllForAccount(Account),
    ImportCard(CardId),
    Join {
        contact_id1: ContactId,
        contact_id2: ContactId,
        writable: bool,
    },
    SetStarred {
        contact: ContactId,
        starred: bool,
    },
    SetSendToVoicemail {
        contact: ContactId,
        enabled: bool,
    },
    SetRingtone {
        contact: ContactId,
        ringtone: Option<String>,
    },
    SetSuperPrimary(DataId),
    ClearPrimary(DataId),
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Save(_) => "save",
            Self::CreateRawContact { .. } => "create_raw_contact",
            Self::CreateGroup { .. } => "create_group",
            Self::RenameGroup { .. } => "rename_group",
            Self::UpdateGroup { .. } => "update_group",
            Self::DeleteGroup(_) => "delete_group",
            Self::DeleteContact(_) => "delete_contact",
            Self::DeleteAllForAccount(_) => "delete_all_for_account",
            Self::ImportCard(_) => "import_card",
            Self::Join { .. } => "join",
            Self::SetStarred { .. } => "set_starred",
            Self::SetSendToVoicemail { .. } => "set_send_to_voicemail",
            Self::SetRingtone { .. } => "set_ringtone",
            Self::SetSuperPrimary(_) => "set_super_primary",
            Self::ClearPrimary(_) => "clear_primary",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Saved(SaveResult),
    RawContactCreated(Option<ContactRef>),
    GroupCreated(GroupId),
    Joined(ContactRef),
    Deleted(usize),
    Imported(usize),
    Done,
}

#[derive(Debug)]
pub struct Completion {
    pub request_id: RequestId,
    pub outcome: Result<Response, EngineError>,
}

struct Envelope {
    id: RequestId,
    request: Request,
}

pub type Callback = Box<dyn FnOnce(Result<Response, EngineError>)>;

pub struct SaveService;

impl SaveService {
    pub fn spawn<S>(saver: ContactSaver<S>) -> Result<SaveServiceHandle, EngineError>
    where
        S: ContactStore + Send + 'static,
    {
        let (request_tx, request_rx) = channel::unbounded::<Envelope>();
        let (completion_tx, completion_rx) = channel::unbounded::<Completion>();
        let worker = thread::Builder::new()
            .name("contact-save".into())
            .spawn(move || run_worker(saver, request_rx, completion_tx))
            .map_err(|e| EngineError::Transport(format!("cannot start save worker: {e}")))?;
        Ok(SaveServiceHandle {
            requests: Some(request_tx),
            completions: completion_rx,
            callbacks: HashMap::new(),
            worker: Some(worker),
        })
    }
}

fn run_worker<S: ContactStore>(mut saver: ContactSaver<S>, requests: Receiver<Envelope>, completions: Sender<Completion>) {
    info!("save worker started");
    for Envelope { id, request } in requests.iter() {
        let span = info_span!("request", id = %id, kind = request.name());
        let _guard = span.enter();
        let outcome = saver.handle(request);
        if let Err(e) = &outcome {
            warn!(error = %e, "request failed");
        }
        if completions.send(Completion { request_id: id, outcome }).is_err() {
            debug!("completion receiver gone");
            break;
        }
    }
    info!("save worker stopped");
}

pub struct SaveServiceHandle {
    requests: Option<Sender<Envelope>>,
    completions: Receiver<Completion>,
    callbacks: HashMap<RequestId, Callback>,
    worker: Option<JoinHandle<()>>,
}

impl SaveServiceHandle {
    pub fn submit<F>(&mut self, request: Request, callback: F) -> Result<RequestId, EngineError>
    where
        F: FnOnce(Result<Response, EngineError>) + 'static,
    {
        let id = self.send(request)?;
        self.callbacks.insert(id, Box::new(callback));
        Ok(id)
    }

    /// Queues a request whose completion nobody listens to.
    pub fn submit_detached(&mut self, request: Request) -> Result<RequestId, EngineError> {
        self.send(request)
    }

    fn send(&mut self, request: Request) -> Result<RequestId, EngineError> {
        let id = RequestId::new();
        let sender = self.requests.as_ref().ok_or(EngineError::ServiceStopped)?;
        sender
            .send(Envelope { id, request })
            .map_err(|_| EngineError::ServiceStopped)?;
        Ok(id)
    }

    /// Forgets the callback of a pending request. The request still runs.
    pub fn detach(&mut self, id: RequestId) -> bool {
        self.callbacks.remove(&id).is_some()
    }

    pub fn pending_callbacks(&self) -> usize {
        self.callbacks.len()
    }

    fn deliver(&mut self, completion: Completion) -> bool {
        match self.callbacks.remove(&completion.request_id) {
            Some(callback) => {
                callback(completion.outcome);
                true
            }
            None => {
                debug!(id = %completion.request_id, "completion without listener");
                false
            }
        }
    }

    /// Delivers every completion that has arrived. Returns how many
    /// callbacks ran.
    pub fn dispatch_completions(&mut self) -> usize {
        let mut delivered = 0;
        loop {
            match self.completions.try_recv() {
                Ok(completion) => {
                    if self.deliver(completion) {
                        delivered += 1;
                    }
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return delivered,
            }
        }
    }

    /// Blocks until the completion of `id` arrived, delivering every
    /// completion seen on the way. Returns false on timeout.
    pub fn wait_for(&mut self, id: RequestId, timeout: Duration) -> Result<bool, EngineError> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.completions.recv_timeout(remaining) {
                Ok(completion) => {
                    let done = completion.request_id == id;
                    self.deliver(completion);
                    if done {
                        return Ok(true);
                    }
                }
                Err(RecvTimeoutError::Timeout) => return Ok(false),
                Err(RecvTimeoutError::Disconnected) => return Err(EngineError::ServiceStopped),
            }
        }
    }

    /// Stops accepting requests, lets the worker drain the queue and
    /// delivers the remaining completions.
    pub fn shutdown(mut self) -> usize {
        self.stop();
        self.dispatch_completions()
    }

    fn stop(&mut self) {
        self.requests.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("save worker panicked");
            }
        }
    }
}

impl Drop for SaveServiceHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for SaveServiceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SaveServiceHandle")
            .field("pending_callbacks", &self.callbacks.len())
            .field("running", &self.worker.is_some())
            .finish()
    }
}
