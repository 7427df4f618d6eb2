/*!
 * OpenTherm master protocol state machine.
 *
 * The master owns the transceiver and runs one request/response exchange at a
 * time. It keeps the last value seen for every data-ID and counts consecutive
 * failed exchanges; retrying is left to the caller.
 */
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use opentherm_core::config::Config;
use opentherm_core::logging::FRAME_TARGET;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::codec::{self, Frame};
use crate::data::{f88_to_f64, DataId, DataKind, MsgType};
use crate::error::{InvalidResponse, ProtocolError, WireError};
use crate::transceiver::Transceiver;

/// Exchange state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterState {
    /// No exchange in progress
    Idle,
    /// Request being transmitted
    Sending,
    /// Waiting for the slave's response
    AwaitingResponse,
    /// Validating the response
    Processing,
}

impl fmt::Display for MasterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MasterState::Idle => write!(f, "Idle"),
            MasterState::Sending => write!(f, "Sending"),
            MasterState::AwaitingResponse => write!(f, "AwaitingResponse"),
            MasterState::Processing => write!(f, "Processing"),
        }
    }
}

/// Last known value of a data-ID
#[derive(Debug, Clone, PartialEq)]
pub struct DataPoint {
    /// The data-ID
    pub data_id: DataId,
    /// Last raw data-value received or acknowledged
    pub value: Option<u16>,
    /// When the point last changed
    pub updated_at: Option<DateTime<Utc>>,
    /// Whether `value` can be trusted
    pub valid: bool,
}

impl DataPoint {
    /// An empty point that has never been seen
    pub fn new(data_id: DataId) -> Self {
        Self {
            data_id,
            value: None,
            updated_at: None,
            valid: false,
        }
    }

    /// The raw value, only while valid
    pub fn raw(&self) -> Option<u16> {
        self.value.filter(|_| self.valid)
    }

    /// The value decoded as f8.8, only while valid and for f8.8 IDs
    pub fn as_f64(&self) -> Option<f64> {
        match self.data_id.kind() {
            Some(DataKind::F88) => self.raw().map(f88_to_f64),
            _ => None,
        }
    }
}

/// Cache of data points keyed by data-ID
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataPointCache {
    points: BTreeMap<DataId, DataPoint>,
}

impl DataPointCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a point
    pub fn get(&self, data_id: DataId) -> Option<&DataPoint> {
        self.points.get(&data_id)
    }

    /// Raw value of a point, only while valid
    pub fn raw(&self, data_id: DataId) -> Option<u16> {
        self.get(data_id).and_then(DataPoint::raw)
    }

    /// Decoded f8.8 value of a point, only while valid
    pub fn value(&self, data_id: DataId) -> Option<f64> {
        self.get(data_id).and_then(DataPoint::as_f64)
    }

    /// Iterate over all points in data-ID order
    pub fn iter(&self) -> impl Iterator<Item = &DataPoint> {
        self.points.values()
    }

    /// Number of points seen so far
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Whether no point was seen yet
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Invalidate every point, keeping the last values
    pub fn mark_stale(&mut self) {
        for point in self.points.values_mut() {
            point.valid = false;
        }
    }

    fn store(&mut self, data_id: DataId, value: u16) {
        let point = self
            .points
            .entry(data_id)
            .or_insert_with(|| DataPoint::new(data_id));
        point.value = Some(value);
        point.valid = true;
        point.updated_at = Some(Utc::now());
    }

    fn invalidate(&mut self, data_id: DataId) {
        let point = self
            .points
            .entry(data_id)
            .or_insert_with(|| DataPoint::new(data_id));
        point.valid = false;
        point.updated_at = Some(Utc::now());
    }
}

/// Master tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MasterOptions {
    /// How long to wait for a response start bit
    pub rx_timeout: Duration,
    /// Log every raw frame
    pub debug: bool,
    /// Consecutive failures after which the master reports degraded
    pub failure_threshold: u32,
}

impl Default for MasterOptions {
    fn default() -> Self {
        Self {
            rx_timeout: Duration::from_millis(40),
            debug: false,
            failure_threshold: 5,
        }
    }
}

impl From<&Config> for MasterOptions {
    fn from(config: &Config) -> Self {
        Self {
            rx_timeout: config.rx_timeout(),
            debug: config.wire.debug,
            failure_threshold: config.polling.failure_threshold,
        }
    }
}

/// OpenTherm master driving a [`Transceiver`]
#[derive(Debug)]
pub struct OpenThermMaster<T> {
    transceiver: T,
    options: MasterOptions,
    state: MasterState,
    failures: u32,
    exchanges: u64,
    cache: DataPointCache,
}

impl<T: Transceiver> OpenThermMaster<T> {
    /// Create a master
    pub fn new(transceiver: T, options: MasterOptions) -> Self {
        Self {
            transceiver,
            options,
            state: MasterState::Idle,
            failures: 0,
            exchanges: 0,
            cache: DataPointCache::new(),
        }
    }

    /// Current exchange state
    pub fn state(&self) -> MasterState {
        self.state
    }

    /// Options in use
    pub fn options(&self) -> &MasterOptions {
        &self.options
    }

    /// Failed exchanges since the last success
    pub fn consecutive_failures(&self) -> u32 {
        self.failures
    }

    /// Total number of exchanges attempted
    pub fn exchanges(&self) -> u64 {
        self.exchanges
    }

    /// Whether the failure threshold has been reached
    pub fn is_degraded(&self) -> bool {
        self.failures >= self.options.failure_threshold
    }

    /// Cached data points
    pub fn cache(&self) -> &DataPointCache {
        &self.cache
    }

    /// Invalidate every cached point
    pub fn mark_stale(&mut self) {
        self.cache.mark_stale();
    }

    /// Access the transceiver
    pub fn transceiver(&self) -> &T {
        &self.transceiver
    }

    /// Give back the transceiver
    pub fn into_inner(self) -> T {
        self.transceiver
    }

    /// Send a Read-Data request
    pub async fn read(&mut self, data_id: DataId) -> Result<Frame, ProtocolError> {
        self.exchange(codec::encode(MsgType::ReadData, data_id, 0))
            .await
    }

    /// Send a Write-Data request
    pub async fn write(&mut self, data_id: DataId, value: u16) -> Result<Frame, ProtocolError> {
        self.exchange(codec::encode(MsgType::WriteData, data_id, value))
            .await
    }

    /// Run one request/response exchange
    ///
    /// On success the response frame is returned and the cache updated. On
    /// failure the cache is left untouched and the failure counted.
    pub async fn exchange(&mut self, request: Frame) -> Result<Frame, ProtocolError> {
        let data_id = request.data_id();
        self.exchanges += 1;

        if self.options.debug {
            debug!(target: FRAME_TARGET, direction = "tx", frame = %request, "{:?}", request);
        }

        self.state = MasterState::Sending;
        if let Err(source) = self.transceiver.send(request).await {
            return Err(self.fail(ProtocolError::Transmit { data_id, source }));
        }

        self.state = MasterState::AwaitingResponse;
        let deadline = Instant::now() + self.options.rx_timeout;
        let received = self.transceiver.receive(deadline).await;

        self.state = MasterState::Processing;
        let response = match received {
            Ok(bits) => codec::decode(bits).map_err(|e| ProtocolError::InvalidResponse {
                data_id,
                reason: e.into(),
            }),
            Err(WireError::FrameTimeout) => Err(ProtocolError::TimeoutExceeded(data_id)),
            Err(WireError::Signal { bit }) => Err(ProtocolError::InvalidResponse {
                data_id,
                reason: InvalidResponse::Signal(bit),
            }),
            Err(source) => Err(ProtocolError::Transmit { data_id, source }),
        };

        let response = match response {
            Ok(frame) => {
                if self.options.debug {
                    debug!(target: FRAME_TARGET, direction = "rx", frame = %frame, "{:?}", frame);
                }
                frame
            }
            Err(e) => {
                if self.options.debug {
                    debug!(target: FRAME_TARGET, direction = "rx", error = %e, "No valid frame");
                }
                return Err(self.fail(e));
            }
        };

        if let Err(reason) = Self::validate(data_id, response) {
            return Err(self.fail(ProtocolError::InvalidResponse { data_id, reason }));
        }

        match response.msg_type() {
            MsgType::ReadAck | MsgType::WriteAck => self.cache.store(data_id, response.value()),
            _ => {
                debug!(data_id = %data_id, msg_type = ?response.msg_type(), "Slave rejected request");
                self.cache.invalidate(data_id);
            }
        }

        if self.is_degraded() {
            info!(failures = self.failures, "Communication with boiler restored");
        }
        self.failures = 0;
        self.state = MasterState::Idle;
        Ok(response)
    }

    fn validate(expected: DataId, response: Frame) -> Result<(), InvalidResponse> {
        if !response.msg_type().is_slave_to_master() {
            return Err(InvalidResponse::MessageType(response.msg_type()));
        }
        if response.data_id() != expected {
            return Err(InvalidResponse::DataIdMismatch {
                expected,
                got: response.data_id(),
            });
        }
        Ok(())
    }

    fn fail(&mut self, error: ProtocolError) -> ProtocolError {
        self.state = MasterState::Idle;
        self.failures = self.failures.saturating_add(1);
        debug!(error = %error, failures = self.failures, "Exchange failed");
        if self.failures == self.options.failure_threshold {
            warn!(
                failures = self.failures,
                "Boiler not responding, marking communication degraded"
            );
        }
        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::f64_to_f88;
    use crate::sim::{Fault, SimulatedBoiler};

    fn master(boiler: &SimulatedBoiler) -> OpenThermMaster<SimulatedBoiler> {
        OpenThermMaster::new(boiler.clone(), MasterOptions::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_updates_cache() -> Result<(), ProtocolError> {
        let boiler = SimulatedBoiler::new();
        boiler.set_temperature(DataId::BOILER_TEMP, 52.5);
        let mut master = master(&boiler);

        let response = master.read(DataId::BOILER_TEMP).await?;
        assert_eq!(response.msg_type(), MsgType::ReadAck);
        assert_eq!(master.cache().value(DataId::BOILER_TEMP), Some(52.5));
        assert_eq!(master.state(), MasterState::Idle);
        assert_eq!(master.consecutive_failures(), 0);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_is_acknowledged() -> Result<(), ProtocolError> {
        let boiler = SimulatedBoiler::new();
        let mut master = master(&boiler);

        let value = f64_to_f88(47.25);
        let response = master.write(DataId::CONTROL_SETPOINT, value).await?;
        assert_eq!(response.msg_type(), MsgType::WriteAck);
        assert_eq!(boiler.register(DataId::CONTROL_SETPOINT), Some(value));
        assert_eq!(master.cache().raw(DataId::CONTROL_SETPOINT), Some(value));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_response_leaves_cache_unchanged() -> Result<(), ProtocolError> {
        let boiler = SimulatedBoiler::new();
        boiler.set_temperature(DataId::BOILER_TEMP, 45.0);
        let mut master = master(&boiler);
        master.read(DataId::BOILER_TEMP).await?;
        let before = master.cache().get(DataId::BOILER_TEMP).cloned();

        boiler.set_temperature(DataId::BOILER_TEMP, 60.0);
        boiler.set_latency(Duration::from_millis(60));

        let result = master.read(DataId::BOILER_TEMP).await;
        assert_eq!(result, Err(ProtocolError::TimeoutExceeded(DataId::BOILER_TEMP)));
        assert_eq!(master.cache().get(DataId::BOILER_TEMP).cloned(), before);
        assert_eq!(master.cache().value(DataId::BOILER_TEMP), Some(45.0));
        assert_eq!(master.consecutive_failures(), 1);
        assert_eq!(master.state(), MasterState::Idle);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_corrupted_response_is_rejected() {
        let boiler = SimulatedBoiler::new();
        let mut master = master(&boiler);

        boiler.inject(Fault::CorruptParity);
        let result = master.read(DataId::RETURN_TEMP).await;
        assert!(matches!(
            result,
            Err(ProtocolError::InvalidResponse {
                reason: InvalidResponse::Decode(_),
                ..
            })
        ));
        assert!(master.cache().get(DataId::RETURN_TEMP).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_mismatched_data_id_is_rejected() {
        let boiler = SimulatedBoiler::new();
        let mut master = master(&boiler);

        boiler.inject(Fault::WrongDataId);
        let result = master.read(DataId::DHW_TEMP).await;
        assert_eq!(
            result,
            Err(ProtocolError::InvalidResponse {
                data_id: DataId::DHW_TEMP,
                reason: InvalidResponse::DataIdMismatch {
                    expected: DataId::DHW_TEMP,
                    got: DataId(DataId::DHW_TEMP.value() + 1),
                },
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_signal_error_is_invalid_response() {
        let boiler = SimulatedBoiler::new();
        let mut master = master(&boiler);

        boiler.inject(Fault::Signal);
        let result = master.read(DataId::CH_PRESSURE).await;
        assert!(matches!(
            result,
            Err(ProtocolError::InvalidResponse {
                reason: InvalidResponse::Signal(_),
                ..
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_data_invalid_marks_point_invalid() -> Result<(), ProtocolError> {
        let boiler = SimulatedBoiler::new();
        let mut master = master(&boiler);
        master.read(DataId::OUTSIDE_TEMP).await?;
        assert!(master.cache().value(DataId::OUTSIDE_TEMP).is_some());

        boiler.mark_invalid(DataId::OUTSIDE_TEMP);
        let response = master.read(DataId::OUTSIDE_TEMP).await?;
        assert_eq!(response.msg_type(), MsgType::DataInvalid);

        let point = master.cache().get(DataId::OUTSIDE_TEMP).unwrap();
        assert!(!point.valid);
        assert!(point.value.is_some());
        assert_eq!(master.cache().value(DataId::OUTSIDE_TEMP), None);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_data_id() -> Result<(), ProtocolError> {
        let boiler = SimulatedBoiler::new();
        let mut master = master(&boiler);

        let response = master.read(DataId(99)).await?;
        assert_eq!(response.msg_type(), MsgType::UnknownDataId);
        assert!(!master.cache().get(DataId(99)).unwrap().valid);
        Ok(())
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_degraded_after_threshold() -> Result<(), ProtocolError> {
        let boiler = SimulatedBoiler::new();
        let options = MasterOptions {
            failure_threshold: 3,
            debug: true,
            ..MasterOptions::default()
        };
        let mut master = OpenThermMaster::new(boiler.clone(), options);
        master.read(DataId::BOILER_TEMP).await?;

        boiler.set_persistent_fault(Some(Fault::Drop));
        for attempt in 1..=3 {
            assert!(!master.is_degraded());
            let result = master.read(DataId::BOILER_TEMP).await;
            assert!(result.unwrap_err().is_timeout());
            assert_eq!(master.consecutive_failures(), attempt);
        }
        assert!(master.is_degraded());

        master.mark_stale();
        assert_eq!(master.cache().value(DataId::BOILER_TEMP), None);

        boiler.set_persistent_fault(None);
        master.read(DataId::BOILER_TEMP).await?;
        assert!(!master.is_degraded());
        assert!(master.cache().value(DataId::BOILER_TEMP).is_some());
        assert_eq!(master.exchanges(), 5);
        Ok(())
    }

    #[test]
    fn test_options_from_config() {
        let mut config = Config::default();
        config.wire.rx_timeout_ms = 55;
        config.wire.debug = true;
        config.polling.failure_threshold = 7;

        let options = MasterOptions::from(&config);
        assert_eq!(options.rx_timeout, Duration::from_millis(55));
        assert!(options.debug);
        assert_eq!(options.failure_threshold, 7);
    }
}
