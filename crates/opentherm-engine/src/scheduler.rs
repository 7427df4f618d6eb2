/*!
 * Poll scheduling.
 *
 * The scheduler decides which exchanges happen in a poll cycle: urgent
 * requests first, then queued writes, then the reads whose minimum interval
 * has elapsed. Exchanges run strictly one after the other on the master.
 */
use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use opentherm_core::config::{PollEntryConfig, PollPriority, PollingConfig};
use opentherm_wire::codec::{self, Frame};
use opentherm_wire::{DataId, MasterStatus, MsgType, OpenThermMaster, ProtocolError, Transceiver};

use crate::error::{Error, Result};

/// A periodically read data-ID
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollEntry {
    /// Data-ID to read
    pub data_id: DataId,
    /// Priority class
    pub priority: PollPriority,
    /// Minimum time between two reads
    pub min_interval: Duration,
    /// When the entry was last polled, `None` if never
    pub last_polled: Option<Instant>,
}

impl PollEntry {
    /// Create an entry that has never been polled
    pub fn new(data_id: DataId, priority: PollPriority, min_interval: Duration) -> Self {
        Self {
            data_id,
            priority,
            min_interval,
            last_polled: None,
        }
    }

    /// Whether the entry should be read at `now`
    pub fn is_due(&self, now: Instant) -> bool {
        match self.last_polled {
            None => true,
            Some(last) => last + self.min_interval <= now,
        }
    }
}

impl From<&PollEntryConfig> for PollEntry {
    fn from(config: &PollEntryConfig) -> Self {
        Self::new(
            DataId(config.data_id),
            config.priority,
            Duration::from_millis(config.interval_ms),
        )
    }
}

/// A request waiting for the next cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    /// Message type
    pub msg_type: MsgType,
    /// Data-ID
    pub data_id: DataId,
    /// Data-value
    pub value: u16,
}

impl Request {
    /// A Write-Data request
    pub fn write(data_id: DataId, value: u16) -> Self {
        Self {
            msg_type: MsgType::WriteData,
            data_id,
            value,
        }
    }

    /// A Read-Data request
    pub fn read(data_id: DataId) -> Self {
        Self {
            msg_type: MsgType::ReadData,
            data_id,
            value: 0,
        }
    }

    /// The status exchange, carrying the master flags
    pub fn status(status: MasterStatus) -> Self {
        Self {
            msg_type: MsgType::ReadData,
            data_id: DataId::STATUS,
            value: status.to_request_value(),
        }
    }

    /// Encode as a frame
    pub fn frame(&self) -> Frame {
        codec::encode(self.msg_type, self.data_id, self.value)
    }
}

/// Where an exchange in a cycle came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Urgent queue
    Urgent,
    /// Pending write queue
    Queued,
    /// Poll table
    Poll,
}

/// Result of one exchange in a cycle
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeOutcome {
    /// Where the request came from
    pub kind: ExchangeKind,
    /// Requested data-ID
    pub data_id: DataId,
    /// Response frame or the failure
    pub result: std::result::Result<Frame, ProtocolError>,
}

/// Everything that happened in a poll cycle
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    /// Exchanges in the order they ran
    pub outcomes: Vec<ExchangeOutcome>,
}

impl CycleReport {
    /// Number of exchanges
    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    /// Whether nothing was exchanged
    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    /// Number of successful exchanges
    pub fn successes(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_ok()).count()
    }

    /// Failed exchanges
    pub fn failures(&self) -> impl Iterator<Item = &ExchangeOutcome> {
        self.outcomes.iter().filter(|o| o.result.is_err())
    }

    /// Data-IDs read from the poll table, in order
    pub fn polled(&self) -> Vec<DataId> {
        self.outcomes
            .iter()
            .filter(|o| o.kind == ExchangeKind::Poll)
            .map(|o| o.data_id)
            .collect()
    }
}

/// Poll table plus the pending and urgent request queues
#[derive(Debug, Clone, Default)]
pub struct PollScheduler {
    entries: Vec<PollEntry>,
    pending: VecDeque<Request>,
    urgent: VecDeque<Request>,
}

impl PollScheduler {
    /// Create a scheduler over `entries`
    pub fn new(entries: Vec<PollEntry>) -> Self {
        Self {
            entries,
            pending: VecDeque::new(),
            urgent: VecDeque::new(),
        }
    }

    /// Build the poll table from configuration, accepting only readable
    /// standard data-IDs, each at most once
    pub fn from_config(config: &PollingConfig) -> Result<Self> {
        let mut entries: Vec<PollEntry> = Vec::with_capacity(config.entries.len());
        for entry in &config.entries {
            let entry = PollEntry::from(entry);
            if !entry.data_id.is_readable() {
                return Err(Error::validation(format!(
                    "data-ID {} cannot be polled",
                    entry.data_id
                )));
            }
            if entries.iter().any(|e| e.data_id == entry.data_id) {
                return Err(Error::validation(format!(
                    "data-ID {} appears twice in the poll table",
                    entry.data_id
                )));
            }
            entries.push(entry);
        }
        Ok(Self::new(entries))
    }

    /// The poll table
    pub fn entries(&self) -> &[PollEntry] {
        &self.entries
    }

    /// Number of queued requests
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Number of urgent requests
    pub fn urgent_len(&self) -> usize {
        self.urgent.len()
    }

    /// Data-IDs due at `now`, highest priority first, table order within a class
    pub fn due(&self, now: Instant) -> Vec<DataId> {
        self.due_indices(now)
            .into_iter()
            .map(|index| self.entries[index].data_id)
            .collect()
    }

    /// Queue a write for the next cycle, replacing any queued value for the
    /// same data-ID
    pub fn enqueue_write(&mut self, data_id: DataId, value: u16) {
        self.enqueue(Request::write(data_id, value));
    }

    /// Queue any request for the next cycle
    pub fn enqueue(&mut self, request: Request) {
        upsert(&mut self.pending, request);
    }

    /// Queue a request ahead of everything else
    pub fn enqueue_urgent(&mut self, request: Request) {
        self.pending
            .retain(|r| !(r.data_id == request.data_id && r.msg_type == request.msg_type));
        upsert(&mut self.urgent, request);
    }

    /// Run the urgent queue only
    pub async fn flush_urgent<T: Transceiver>(
        &mut self,
        master: &mut OpenThermMaster<T>,
    ) -> CycleReport {
        let mut report = CycleReport::default();
        Self::drain(&mut self.urgent, ExchangeKind::Urgent, master, &mut report).await;
        report
    }

    /// Run one poll cycle
    pub async fn run_cycle<T: Transceiver>(
        &mut self,
        master: &mut OpenThermMaster<T>,
        now: Instant,
    ) -> CycleReport {
        let mut report = CycleReport::default();
        Self::drain(&mut self.urgent, ExchangeKind::Urgent, master, &mut report).await;
        Self::drain(&mut self.pending, ExchangeKind::Queued, master, &mut report).await;

        for index in self.due_indices(now) {
            let data_id = self.entries[index].data_id;
            let result = master.read(data_id).await;
            if let Err(e) = &result {
                debug!(data_id = %data_id, error = %e, "Poll failed");
            }
            self.entries[index].last_polled = Some(now);
            report.outcomes.push(ExchangeOutcome {
                kind: ExchangeKind::Poll,
                data_id,
                result,
            });
        }

        let failed = report.failures().count();
        if failed > 0 {
            warn!(failed, total = report.len(), "Poll cycle had failed exchanges");
        } else {
            debug!(total = report.len(), "Poll cycle complete");
        }
        report
    }

    fn due_indices(&self, now: Instant) -> Vec<usize> {
        let mut due: Vec<usize> = (0..self.entries.len())
            .filter(|&index| self.entries[index].is_due(now))
            .collect();
        due.sort_by_key(|&index| self.entries[index].priority);
        due
    }

    async fn drain<T: Transceiver>(
        queue: &mut VecDeque<Request>,
        kind: ExchangeKind,
        master: &mut OpenThermMaster<T>,
        report: &mut CycleReport,
    ) {
        while let Some(request) = queue.pop_front() {
            let result = master.exchange(request.frame()).await;
            if let Err(e) = &result {
                debug!(data_id = %request.data_id, error = %e, ?kind, "Request failed");
            }
            report.outcomes.push(ExchangeOutcome {
                kind,
                data_id: request.data_id,
                result,
            });
        }
    }
}

fn upsert(queue: &mut VecDeque<Request>, request: Request) {
    match queue
        .iter_mut()
        .find(|r| r.data_id == request.data_id && r.msg_type == request.msg_type)
    {
        Some(queued) => queued.value = request.value,
        None => queue.push_back(request),
    }
}
