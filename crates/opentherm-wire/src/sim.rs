/*!
 * Simulated OpenTherm boiler.
 *
 * `SimulatedBoiler` implements [`Transceiver`] by answering requests from an
 * in-memory register file instead of driving pins. Response latency and
 * transmission faults can be injected, which makes it the test double for the
 * master, the scheduler and the controller, and a stand-in boiler for
 * development on hosts without OpenTherm hardware.
 */
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::trace;

use crate::codec::{self, Frame, WireBits, WIRE_BITS};
use crate::data::{f64_to_f88, join_bytes, split_bytes, DataId, MasterStatus, MsgType, SlaveStatus};
use crate::error::{Result, WireError};
use crate::transceiver::{Transceiver, BIT_US};

/// Requests the boiler remembers for inspection
pub const REQUEST_LOG_LIMIT: usize = 1024;

/// Time a request occupies the line
pub const FRAME_TIME: Duration = Duration::from_micros(WIRE_BITS as u64 * BIT_US as u64);

/// Transmission fault applied to a response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// The boiler does not answer
    Drop,
    /// The parity bit of the response is flipped
    CorruptParity,
    /// The response carries the next data-ID
    WrongDataId,
    /// The response has no mid-bit transition in its first cell
    Signal,
}

#[derive(Debug, Default)]
struct BoilerState {
    registers: HashMap<DataId, u16>,
    invalid: HashSet<DataId>,
    latency: Duration,
    faults: VecDeque<Fault>,
    persistent_fault: Option<Fault>,
    pending: Option<Pending>,
    in_flight: bool,
    overlaps: u64,
    requests: VecDeque<Frame>,
    request_count: usize,
    master_status: MasterStatus,
    slave_status: SlaveStatus,
}

#[derive(Debug)]
struct Pending {
    ready_at: Instant,
    response: std::result::Result<WireBits, WireError>,
}

/// In-memory boiler answering OpenTherm requests
#[derive(Clone, Default)]
pub struct SimulatedBoiler {
    state: Arc<Mutex<BoilerState>>,
}

impl fmt::Debug for SimulatedBoiler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("SimulatedBoiler")
            .field("registers", &state.registers.len())
            .field("latency", &state.latency)
            .field("requests", &state.requests.len())
            .finish()
    }
}

impl SimulatedBoiler {
    /// Create a boiler with plausible readings for every readable ID
    pub fn new() -> Self {
        let boiler = Self::default();
        {
            let mut state = boiler.state();
            let temperatures = [
                (DataId::BOILER_TEMP, 45.0),
                (DataId::RETURN_TEMP, 38.5),
                (DataId::REL_MODULATION, 30.0),
                (DataId::CH_PRESSURE, 1.5),
                (DataId::DHW_FLOW_RATE, 0.0),
                (DataId::DHW_TEMP, 48.0),
                (DataId::OUTSIDE_TEMP, 5.0),
                (DataId::DHW_SETPOINT, 50.0),
                (DataId::MAX_CH_SETPOINT, 70.0),
            ];
            for (data_id, value) in temperatures {
                state.registers.insert(data_id, f64_to_f88(value));
            }
            state.registers.insert(DataId::FAULT_FLAGS, 0);
        }
        boiler
    }

    /// Delay between the end of a request and the response start bit
    pub fn with_latency(self, latency: Duration) -> Self {
        self.set_latency(latency);
        self
    }

    /// Change the response latency
    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = latency;
    }

    /// Set a raw register value
    pub fn set_register(&self, data_id: DataId, value: u16) {
        let mut state = self.state();
        state.registers.insert(data_id, value);
        state.invalid.remove(&data_id);
    }

    /// Set an f8.8 register value
    pub fn set_temperature(&self, data_id: DataId, value: f64) {
        self.set_register(data_id, f64_to_f88(value));
    }

    /// Raw register value
    pub fn register(&self, data_id: DataId) -> Option<u16> {
        self.state().registers.get(&data_id).copied()
    }

    /// Answer reads and writes of `data_id` with Data-Invalid
    pub fn mark_invalid(&self, data_id: DataId) {
        self.state().invalid.insert(data_id);
    }

    /// Apply `fault` to the next response only
    pub fn inject(&self, fault: Fault) {
        self.state().faults.push_back(fault);
    }

    /// Apply `fault` to every response until cleared
    pub fn set_persistent_fault(&self, fault: Option<Fault>) {
        self.state().persistent_fault = fault;
    }

    /// Set the slave flags reported in the status response
    pub fn set_slave_status(&self, status: SlaveStatus) {
        self.state().slave_status = status;
    }

    /// Master flags from the last status request
    pub fn master_status(&self) -> MasterStatus {
        self.state().master_status
    }

    /// Up to [`REQUEST_LOG_LIMIT`] recent requests, oldest first
    pub fn requests(&self) -> Vec<Frame> {
        self.state().requests.iter().copied().collect()
    }

    /// Number of requests seen so far
    pub fn request_count(&self) -> usize {
        self.state().request_count
    }

    /// Forget the recorded requests
    pub fn clear_requests(&self) {
        let mut state = self.state();
        state.requests.clear();
        state.request_count = 0;
    }

    /// Requests that arrived while another exchange was still open
    pub fn overlaps(&self) -> u64 {
        self.state().overlaps
    }

    fn state(&self) -> MutexGuard<'_, BoilerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl BoilerState {
    fn respond(&mut self, request: Frame) -> Frame {
        let (msg_type, data_id, value) = request.parts();

        if self.invalid.contains(&data_id) {
            return codec::encode(MsgType::DataInvalid, data_id, value);
        }

        match msg_type {
            MsgType::ReadData if data_id == DataId::STATUS => {
                let (master, _) = split_bytes(value);
                self.master_status = MasterStatus::from_byte(master);
                let status = join_bytes(master, self.slave_status.to_byte());
                codec::encode(MsgType::ReadAck, data_id, status)
            }
            MsgType::ReadData => match self.registers.get(&data_id) {
                Some(&stored) => codec::encode(MsgType::ReadAck, data_id, stored),
                None => codec::encode(MsgType::UnknownDataId, data_id, value),
            },
            MsgType::WriteData if data_id.is_known() => {
                self.registers.insert(data_id, value);
                codec::encode(MsgType::WriteAck, data_id, value)
            }
            MsgType::InvalidData => codec::encode(MsgType::DataInvalid, data_id, value),
            _ => codec::encode(MsgType::UnknownDataId, data_id, value),
        }
    }

    fn next_fault(&mut self) -> Option<Fault> {
        self.faults.pop_front().or(self.persistent_fault)
    }
}

fn apply_fault(
    fault: Option<Fault>,
    response: Frame,
) -> Option<std::result::Result<WireBits, WireError>> {
    match fault {
        None => Some(Ok(codec::to_wire(response))),
        Some(Fault::Drop) => None,
        Some(Fault::CorruptParity) => Some(Ok(WireBits(codec::to_wire(response).0 ^ 1 << 32))),
        Some(Fault::WrongDataId) => {
            let (msg_type, data_id, value) = response.parts();
            let shifted = DataId(data_id.value().wrapping_add(1));
            Some(Ok(codec::to_wire(codec::encode(msg_type, shifted, value))))
        }
        Some(Fault::Signal) => Some(Err(WireError::Signal { bit: 0 })),
    }
}

#[async_trait]
impl Transceiver for SimulatedBoiler {
    async fn send(&mut self, frame: Frame) -> Result<()> {
        {
            let mut state = self.state();
            if state.in_flight {
                state.overlaps += 1;
            }
            state.in_flight = true;
            if state.requests.len() == REQUEST_LOG_LIMIT {
                state.requests.pop_front();
            }
            state.requests.push_back(frame);
            state.request_count += 1;
        }

        tokio::time::sleep(FRAME_TIME).await;

        let mut state = self.state();
        let response = state.respond(frame);
        let fault = state.next_fault();
        trace!(request = %frame, response = %response, ?fault, "Simulated boiler answered");
        let ready_at = Instant::now() + state.latency;
        state.pending = apply_fault(fault, response).map(|response| Pending { ready_at, response });
        Ok(())
    }

    async fn receive(&mut self, deadline: Instant) -> Result<WireBits> {
        let pending = self.state().pending.take();

        let result = match pending {
            Some(pending) if pending.ready_at <= deadline => {
                tokio::time::sleep_until(pending.ready_at).await;
                pending.response
            }
            // A response that starts after the deadline is never seen
            _ => {
                tokio::time::sleep_until(deadline).await;
                Err(WireError::FrameTimeout)
            }
        };

        self.state().in_flight = false;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn exchange(boiler: &mut SimulatedBoiler, request: Frame) -> Result<Frame> {
        boiler.send(request).await?;
        let bits = boiler
            .receive(Instant::now() + Duration::from_millis(40))
            .await?;
        Ok(codec::decode(bits).unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_echoes_master_flags() -> Result<()> {
        let mut boiler = SimulatedBoiler::new();
        boiler.set_slave_status(SlaveStatus {
            flame: true,
            ch_active: true,
            ..SlaveStatus::default()
        });

        let master = MasterStatus {
            ch_enable: true,
            dhw_enable: true,
            ..MasterStatus::default()
        };
        let request = codec::encode(MsgType::ReadData, DataId::STATUS, master.to_request_value());
        let response = exchange(&mut boiler, request).await?;

        let (high, low) = split_bytes(response.value());
        assert_eq!(response.msg_type(), MsgType::ReadAck);
        assert_eq!(MasterStatus::from_byte(high), master);
        assert!(SlaveStatus::from_byte(low).flame);
        assert_eq!(boiler.master_status(), master);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_stores_register() -> Result<()> {
        let mut boiler = SimulatedBoiler::new();
        let request = codec::encode(MsgType::WriteData, DataId::CONTROL_SETPOINT, 0x3200);
        let response = exchange(&mut boiler, request).await?;
        assert_eq!(response.msg_type(), MsgType::WriteAck);
        assert_eq!(boiler.register(DataId::CONTROL_SETPOINT), Some(0x3200));
        assert_eq!(boiler.requests(), vec![request]);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_log_is_bounded() -> Result<()> {
        let mut boiler = SimulatedBoiler::new();
        for value in 0..(REQUEST_LOG_LIMIT as u16 + 10) {
            let request = codec::encode(MsgType::WriteData, DataId::CONTROL_SETPOINT, value);
            exchange(&mut boiler, request).await?;
        }

        let requests = boiler.requests();
        assert_eq!(requests.len(), REQUEST_LOG_LIMIT);
        assert_eq!(requests[0].value(), 10);
        assert_eq!(boiler.request_count(), REQUEST_LOG_LIMIT + 10);

        boiler.clear_requests();
        assert_eq!(boiler.request_count(), 0);
        assert!(boiler.requests().is_empty());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_response_is_discarded() {
        let mut boiler = SimulatedBoiler::new().with_latency(Duration::from_millis(80));
        let request = codec::encode(MsgType::ReadData, DataId::BOILER_TEMP, 0);

        boiler.send(request).await.unwrap();
        let started = Instant::now();
        let result = boiler.receive(started + Duration::from_millis(40)).await;
        assert_eq!(result, Err(WireError::FrameTimeout));
        assert_eq!(started.elapsed(), Duration::from_millis(40));

        // Nothing left over for the next receive
        let result = boiler.receive(Instant::now() + Duration::from_millis(100)).await;
        assert_eq!(result, Err(WireError::FrameTimeout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_injected_fault_is_one_shot() -> Result<()> {
        let mut boiler = SimulatedBoiler::new();
        let request = codec::encode(MsgType::ReadData, DataId::RETURN_TEMP, 0);

        boiler.inject(Fault::CorruptParity);
        boiler.send(request).await?;
        let bits = boiler.receive(Instant::now() + Duration::from_millis(40)).await?;
        assert!(codec::decode(bits).is_err());

        let response = exchange(&mut boiler, request).await?;
        assert_eq!(response.msg_type(), MsgType::ReadAck);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlap_is_counted() -> Result<()> {
        let mut first = SimulatedBoiler::new();
        let mut second = first.clone();
        let request = codec::encode(MsgType::ReadData, DataId::BOILER_TEMP, 0);

        first.send(request).await?;
        second.send(request).await?;
        assert_eq!(first.overlaps(), 1);
        Ok(())
    }
}
