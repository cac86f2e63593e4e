//! Transfer executor
//!
//! Runs the URBs of one device on worker threads so the reactor never waits
//! on hardware. Each endpoint address gets its own lane: a worker thread with
//! a FIFO queue, started on first use. Transfers on one endpoint run in
//! submission order; a blocked IN endpoint does not stall the others.
//! Endpoint 0 is a single lane for both directions.
//!
//! Each job is tracked in a table while it is queued or running:
//!
//! ```text
//! submit ──> Queued ──(lane picks it up)──> Running ──> removed ──> completion sent
//!               │                              │
//!               └──(unlink)──> removed,        └──(unlink)──> cancellation requested,
//!                              Cancelled,                     AlreadyCompleted,
//!                              no completion                  completion follows
//! ```
//!
//! A handler that can give up on a running transfer watches its
//! [`Cancellation`] and completes early, typically with `-ECONNRESET`.

use super::DeviceError;
use async_channel::{Receiver, Sender, unbounded};
use common::{CompletionSender, SessionId, UnlinkOutcome, UrbCompletion, UrbRequest, UrbToken};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use tracing::{debug, error, trace};

/// Lane of endpoint 0
const CONTROL_LANE: u8 = 0;

/// Executes one URB synchronously on a lane thread
///
/// The handler is shared by every lane of the device.
pub trait UrbHandler: Send + Sync + 'static {
    fn handle(&self, urb: &UrbRequest, cancel: &Cancellation) -> UrbCompletion;
}

impl<F> UrbHandler for F
where
    F: Fn(&UrbRequest) -> UrbCompletion + Send + Sync + 'static,
{
    fn handle(&self, urb: &UrbRequest, _cancel: &Cancellation) -> UrbCompletion {
        self(urb)
    }
}

/// Set when a running URB is unlinked or the executor stops
#[derive(Debug, Clone, Default)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobState {
    Queued,
    Running,
}

type JobKey = (SessionId, u32);

struct Job {
    id: u64,
    urb: UrbRequest,
    completions: CompletionSender,
}

struct JobEntry {
    id: u64,
    state: JobState,
    cancel: Cancellation,
}

#[derive(Default)]
struct JobTable {
    jobs: Mutex<HashMap<JobKey, JobEntry>>,
    next_id: AtomicU64,
}

struct Lane {
    tx: Sender<Job>,
    worker: JoinHandle<()>,
}

/// Per-device transfer workers, one FIFO lane per endpoint address
pub struct TransferExecutor {
    name: String,
    handler: Arc<dyn UrbHandler>,
    table: Arc<JobTable>,
    lanes: Mutex<HashMap<u8, Lane>>,
}

impl TransferExecutor {
    /// Create the executor and start the endpoint 0 lane
    ///
    /// Lane threads are named `usbip-xfer-<name>-ep<address>`.
    pub fn spawn<H: UrbHandler>(name: &str, handler: H) -> Result<Self, DeviceError> {
        let executor = Self {
            name: name.to_string(),
            handler: Arc::new(handler),
            table: Arc::new(JobTable::default()),
            lanes: Mutex::new(HashMap::new()),
        };
        {
            let mut lanes = executor.lanes.lock();
            executor.lane(&mut lanes, CONTROL_LANE)?;
        }

        debug!("Started transfer executor for {}", name);
        Ok(executor)
    }

    /// Queue a URB on its endpoint's lane; its completion is sent through `completions`
    pub fn submit(
        &self,
        urb: UrbRequest,
        completions: CompletionSender,
    ) -> Result<UrbToken, DeviceError> {
        let seq_num = urb.seq_num;
        let key = (completions.session(), seq_num);
        let id = self.table.next_id.fetch_add(1, Ordering::Relaxed);

        {
            let mut jobs = self.table.jobs.lock();
            if jobs.contains_key(&key) {
                return Err(DeviceError::DuplicateUrb(seq_num));
            }
            jobs.insert(
                key,
                JobEntry {
                    id,
                    state: JobState::Queued,
                    cancel: Cancellation::default(),
                },
            );
        }

        let address = lane_of(&urb);
        let job = Job {
            id,
            urb,
            completions,
        };
        let sent = {
            let mut lanes = self.lanes.lock();
            self.lane(&mut lanes, address)
                .and_then(|tx| tx.try_send(job).map_err(|_| DeviceError::Stopped))
        };
        if let Err(e) = sent {
            self.table.jobs.lock().remove(&key);
            return Err(e);
        }

        trace!("{}: queued URB {} on ep {:#04x}", self.name, seq_num, address);
        Ok(UrbToken(seq_num))
    }

    /// Sender of the lane for `address`, starting its worker on first use
    fn lane<'a>(
        &self,
        lanes: &'a mut HashMap<u8, Lane>,
        address: u8,
    ) -> Result<&'a Sender<Job>, DeviceError> {
        if !lanes.contains_key(&address) {
            let (tx, rx) = unbounded();
            let table = Arc::clone(&self.table);
            let handler = Arc::clone(&self.handler);
            let worker = std::thread::Builder::new()
                .name(format!("usbip-xfer-{}-ep{:02x}", self.name, address))
                .spawn(move || run_lane(rx, table, handler))?;
            trace!("{}: started lane for ep {:#04x}", self.name, address);
            lanes.insert(address, Lane { tx, worker });
        }
        lanes
            .get(&address)
            .map(|lane| &lane.tx)
            .ok_or(DeviceError::Stopped)
    }

    /// Cancel a queued URB, or ask a running one to stop
    pub fn unlink(&self, session: SessionId, seq_num: u32) -> UnlinkOutcome {
        let mut jobs = self.table.jobs.lock();
        match jobs.get(&(session, seq_num)) {
            Some(entry) if entry.state == JobState::Queued => {
                jobs.remove(&(session, seq_num));
                debug!("{}: cancelled queued URB {}", self.name, seq_num);
                UnlinkOutcome::Cancelled
            }
            Some(entry) => {
                entry.cancel.cancel();
                debug!("{}: cancellation requested for running URB {}", self.name, seq_num);
                UnlinkOutcome::AlreadyCompleted
            }
            None => UnlinkOutcome::NotFound,
        }
    }

    /// Number of queued or running URBs
    pub fn in_flight(&self) -> usize {
        self.table.jobs.lock().len()
    }
}

impl Drop for TransferExecutor {
    fn drop(&mut self) {
        // queued jobs are skipped by their lane once they leave the table
        for (_, entry) in self.table.jobs.lock().drain() {
            entry.cancel.cancel();
        }

        let lanes: Vec<Lane> = self.lanes.lock().drain().map(|(_, lane)| lane).collect();
        for lane in &lanes {
            lane.tx.close();
        }
        for lane in lanes {
            if lane.worker.join().is_err() {
                error!("Transfer worker for {} panicked", self.name);
            }
        }
        debug!("Stopped transfer executor for {}", self.name);
    }
}

/// Lane key of a URB: endpoint 0 shares one lane for both directions
fn lane_of(urb: &UrbRequest) -> u8 {
    if urb.is_control() {
        CONTROL_LANE
    } else {
        urb.endpoint_address()
    }
}

fn run_lane(rx: Receiver<Job>, table: Arc<JobTable>, handler: Arc<dyn UrbHandler>) {
    while let Ok(job) = rx.recv_blocking() {
        let key = (job.completions.session(), job.urb.seq_num);

        let cancel = {
            let mut jobs = table.jobs.lock();
            match jobs.get_mut(&key) {
                Some(entry) if entry.id == job.id => {
                    entry.state = JobState::Running;
                    entry.cancel.clone()
                }
                // unlinked while queued
                _ => continue,
            }
        };

        let completion = handler.handle(&job.urb, &cancel);

        table.jobs.lock().remove(&key);
        if let Err(e) = job.completions.send(completion) {
            debug!("Dropping completion for URB {}: {}", key.1, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::{DEFAULT_TEST_TIMEOUT, in_submit, out_submit, wait_until};
    use common::{CompletionReceiver, Wake, completion_queue};
    use parking_lot::Condvar;
    use std::time::Duration;

    fn queue() -> (common::CompletionQueue, CompletionReceiver) {
        let waker: Arc<dyn Wake> = Arc::new(|| Ok::<(), std::io::Error>(()));
        completion_queue(waker)
    }

    fn recv(rx: &CompletionReceiver) -> UrbCompletion {
        let mut event = None;
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || {
            event = rx.try_recv();
            event.is_some()
        }));
        event.map(|e| e.completion).unwrap()
    }

    /// Handler that blocks until the gate opens
    #[derive(Clone, Default)]
    struct Gate {
        inner: Arc<(Mutex<bool>, Condvar)>,
    }

    impl Gate {
        fn open(&self) {
            *self.inner.0.lock() = true;
            self.inner.1.notify_all();
        }

        fn wait(&self) {
            let mut open = self.inner.0.lock();
            while !*open {
                self.inner.1.wait(&mut open);
            }
        }
    }

    #[test]
    fn test_completes_in_fifo_order() {
        let executor =
            TransferExecutor::spawn("fifo", |urb: &UrbRequest| UrbCompletion::written(urb.seq_num, 0))
                .unwrap();
        let (queue, rx) = queue();
        let sender = queue.sender(SessionId::next());

        for seq in 1..=20 {
            executor
                .submit(out_submit(seq, 1, 1, vec![0; 4]).into(), sender.clone())
                .unwrap();
        }

        let order: Vec<u32> = (0..20).map(|_| recv(&rx).seq_num).collect();
        assert_eq!(order, (1..=20).collect::<Vec<_>>());
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || executor.in_flight() == 0));
    }

    #[test]
    fn test_unlink_queued_and_running() {
        let gate = Gate::default();
        let started = Arc::new(AtomicU64::new(0));

        let handler_gate = gate.clone();
        let handler_started = Arc::clone(&started);
        let executor = TransferExecutor::spawn("gate", move |urb: &UrbRequest| {
            handler_started.fetch_add(1, Ordering::SeqCst);
            handler_gate.wait();
            UrbCompletion::with_data(urb.seq_num, vec![1, 2])
        })
        .unwrap();

        let (queue, rx) = queue();
        let session = SessionId::next();
        let sender = queue.sender(session);

        executor
            .submit(in_submit(1, 1, 1, 2).into(), sender.clone())
            .unwrap();
        executor
            .submit(in_submit(2, 1, 1, 2).into(), sender.clone())
            .unwrap();
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || {
            started.load(Ordering::SeqCst) == 1
        }));

        assert_eq!(executor.unlink(session, 1), UnlinkOutcome::AlreadyCompleted);
        assert_eq!(executor.unlink(session, 2), UnlinkOutcome::Cancelled);
        assert_eq!(executor.unlink(session, 2), UnlinkOutcome::NotFound);
        assert_eq!(executor.unlink(SessionId::next(), 1), UnlinkOutcome::NotFound);

        gate.open();
        assert_eq!(recv(&rx).seq_num, 1);

        // the cancelled job never runs
        std::thread::sleep(Duration::from_millis(50));
        assert!(rx.try_recv().is_none());
        assert_eq!(started.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_duplicate_in_flight_rejected() {
        let gate = Gate::default();
        let handler_gate = gate.clone();
        let executor = TransferExecutor::spawn("dup", move |urb: &UrbRequest| {
            handler_gate.wait();
            UrbCompletion::written(urb.seq_num, 0)
        })
        .unwrap();
        let (queue, _rx) = queue();
        let sender = queue.sender(SessionId::next());

        executor
            .submit(in_submit(5, 1, 1, 8).into(), sender.clone())
            .unwrap();
        assert!(matches!(
            executor.submit(in_submit(5, 1, 1, 8).into(), sender.clone()),
            Err(DeviceError::DuplicateUrb(5))
        ));

        // same seq_num from another session is a different job
        let other = queue.sender(SessionId::next());
        assert!(executor.submit(in_submit(5, 1, 1, 8).into(), other).is_ok());
        gate.open();
    }

    #[test]
    fn test_resubmit_after_cancel_runs_new_job() {
        let gate = Gate::default();
        let handler_gate = gate.clone();
        let executor = TransferExecutor::spawn("resubmit", move |urb: &UrbRequest| {
            handler_gate.wait();
            UrbCompletion::with_data(urb.seq_num, urb.data.clone())
        })
        .unwrap();
        let (queue, rx) = queue();
        let session = SessionId::next();
        let sender = queue.sender(session);

        executor
            .submit(out_submit(1, 1, 1, vec![0xAA]).into(), sender.clone())
            .unwrap();
        executor
            .submit(out_submit(2, 1, 1, vec![0xBB]).into(), sender.clone())
            .unwrap();
        assert_eq!(executor.unlink(session, 2), UnlinkOutcome::Cancelled);
        executor
            .submit(out_submit(2, 1, 1, vec![0xCC]).into(), sender.clone())
            .unwrap();

        gate.open();
        assert_eq!(recv(&rx).data, vec![0xAA]);
        assert_eq!(recv(&rx).data, vec![0xCC]);
    }

    #[test]
    fn test_blocked_endpoint_does_not_stall_others() {
        let gate = Gate::default();
        let handler_gate = gate.clone();
        let executor = TransferExecutor::spawn("lanes", move |urb: &UrbRequest| {
            if urb.endpoint_address() == 0x81 {
                handler_gate.wait();
            }
            UrbCompletion::written(urb.seq_num, 0)
        })
        .unwrap();
        let (queue, rx) = queue();
        let sender = queue.sender(SessionId::next());

        executor
            .submit(in_submit(1, 1, 1, 8).into(), sender.clone())
            .unwrap();
        executor
            .submit(out_submit(2, 1, 1, vec![0; 4]).into(), sender.clone())
            .unwrap();
        executor
            .submit(out_submit(3, 1, 2, vec![0; 4]).into(), sender.clone())
            .unwrap();

        let mut done = vec![recv(&rx).seq_num, recv(&rx).seq_num];
        done.sort_unstable();
        assert_eq!(done, vec![2, 3]);
        assert_eq!(executor.in_flight(), 1);

        gate.open();
        assert_eq!(recv(&rx).seq_num, 1);
    }

    /// IN handler that waits for data until its URB is unlinked
    struct IdleIn;

    impl UrbHandler for IdleIn {
        fn handle(&self, urb: &UrbRequest, cancel: &Cancellation) -> UrbCompletion {
            while !cancel.is_cancelled() {
                std::thread::sleep(Duration::from_millis(2));
            }
            UrbCompletion::failed(urb.seq_num, -104)
        }
    }

    #[test]
    fn test_unlink_running_requests_cancellation() {
        let executor = TransferExecutor::spawn("idle", IdleIn).unwrap();
        let (queue, rx) = queue();
        let session = SessionId::next();

        executor
            .submit(in_submit(7, 1, 1, 64).into(), queue.sender(session))
            .unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert!(rx.try_recv().is_none());

        assert_eq!(executor.unlink(session, 7), UnlinkOutcome::AlreadyCompleted);
        let completion = recv(&rx);
        assert_eq!(completion.seq_num, 7);
        assert_eq!(completion.status, -104);
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || executor.in_flight() == 0));
    }

    #[test]
    fn test_drop_cancels_running_transfers() {
        let executor = TransferExecutor::spawn("idle-drop", IdleIn).unwrap();
        let (queue, _rx) = queue();

        executor
            .submit(in_submit(1, 1, 3, 64).into(), queue.sender(SessionId::next()))
            .unwrap();
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || {
            executor.table.jobs.lock().values().any(|e| e.state == JobState::Running)
        }));
        // returns only once the lane has given up on its transfer
        drop(executor);
    }

    #[test]
    fn test_drop_joins_worker() {
        let executor =
            TransferExecutor::spawn("drop", |urb: &UrbRequest| UrbCompletion::written(urb.seq_num, 0))
                .unwrap();
        drop(executor);
    }
}
