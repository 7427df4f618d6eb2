/*!
 * Bit-level OpenTherm transceiver.
 *
 * OpenTherm uses Manchester coding with a 1 ms bit time: a logical `1` is a
 * high half-bit followed by a low half-bit, a `0` the opposite. The idle line
 * is low, so every frame opens with the rising edge of its start bit.
 */
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{Error as _, InputPin, OutputPin};
use tokio::time::Instant;
use tracing::trace;

use crate::codec::{self, Frame, WireBits, WIRE_BITS};
use crate::error::{Result, WireError};

/// Duration of one bit cell in microseconds
pub const BIT_US: u32 = 1000;

/// Duration of half a bit cell in microseconds
pub const HALF_BIT_US: u32 = BIT_US / 2;

/// Default idle-line sampling period while waiting for a start bit
pub const SAMPLE_US: u32 = BIT_US / 3;

/// Idle bit times held before and after a transmitted frame
pub const IDLE_GUARD_BITS: u32 = 3;

/// Frame-level access to the OpenTherm line
///
/// Implementations block or suspend for the full frame duration. Only one
/// caller may drive a transceiver at a time, which `&mut self` enforces.
#[async_trait]
pub trait Transceiver: Send {
    /// Put a framed message on the line
    async fn send(&mut self, frame: Frame) -> Result<()>;

    /// Collect the bit cells of the next frame, giving up at `deadline`
    /// when no start bit has arrived by then
    async fn receive(&mut self, deadline: Instant) -> Result<WireBits>;
}

/// Delay source with a monotonic microsecond counter
pub trait BitClock: DelayNs + Send {
    /// Microseconds since an arbitrary fixed origin
    fn now_us(&mut self) -> u64;
}

/// [`BitClock`] for hosted targets, busy-waiting on the system clock
#[derive(Debug, Clone, Copy)]
pub struct SpinClock {
    origin: std::time::Instant,
}

impl SpinClock {
    /// Create a clock whose origin is now
    pub fn new() -> Self {
        Self {
            origin: std::time::Instant::now(),
        }
    }
}

impl Default for SpinClock {
    fn default() -> Self {
        Self::new()
    }
}

impl DelayNs for SpinClock {
    fn delay_ns(&mut self, ns: u32) {
        let until = std::time::Instant::now() + Duration::from_nanos(u64::from(ns));
        while std::time::Instant::now() < until {
            std::hint::spin_loop();
        }
    }
}

impl BitClock for SpinClock {
    fn now_us(&mut self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }
}

/// Bit-banged Manchester transceiver over two GPIO lines
pub struct ManchesterTransceiver<I, O, C> {
    input: I,
    output: O,
    clock: C,
    sample_us: u32,
}

impl<I, O, C> fmt::Debug for ManchesterTransceiver<I, O, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManchesterTransceiver")
            .field("sample_us", &self.sample_us)
            .finish_non_exhaustive()
    }
}

impl<I, O, C> ManchesterTransceiver<I, O, C>
where
    I: InputPin + Send,
    O: OutputPin + Send,
    C: BitClock,
{
    /// Create a transceiver reading `input` and driving `output`
    ///
    /// The output line is driven to idle before the transceiver is returned.
    pub fn new(input: I, output: O, clock: C) -> Result<Self> {
        let mut transceiver = Self {
            input,
            output,
            clock,
            sample_us: SAMPLE_US,
        };
        transceiver.idle()?;
        Ok(transceiver)
    }

    /// Change the idle-line sampling period
    ///
    /// The period must stay below half a bit, larger values are capped.
    pub fn with_sample_interval(mut self, sample_us: u32) -> Self {
        self.sample_us = sample_us.clamp(1, HALF_BIT_US - 1);
        self
    }

    /// Drive the output line to idle
    pub fn idle(&mut self) -> Result<()> {
        self.set_line(false)
    }

    fn set_line(&mut self, high: bool) -> Result<()> {
        let result = if high {
            self.output.set_high()
        } else {
            self.output.set_low()
        };
        result.map_err(|e| WireError::Pin(format!("output: {:?}", e.kind())))
    }

    fn line(&mut self) -> Result<bool> {
        self.input
            .is_high()
            .map_err(|e| WireError::Pin(format!("input: {:?}", e.kind())))
    }

    fn transmit_bits(&mut self, bits: WireBits) -> Result<()> {
        self.set_line(false)?;
        self.clock.delay_us(IDLE_GUARD_BITS * BIT_US);

        for index in 0..WIRE_BITS {
            let one = bits.bit(index);
            self.set_line(one)?;
            self.clock.delay_us(HALF_BIT_US);
            self.set_line(!one)?;
            self.clock.delay_us(HALF_BIT_US);
        }

        self.set_line(false)?;
        self.clock.delay_us(IDLE_GUARD_BITS * BIT_US);
        Ok(())
    }

    fn sample_bits(&mut self, budget_us: u64) -> Result<WireBits> {
        let end = self.clock.now_us().saturating_add(budget_us);

        loop {
            if self.line()? {
                break;
            }
            if self.clock.now_us() >= end {
                return Err(WireError::FrameTimeout);
            }
            self.clock.delay_us(self.sample_us);
        }

        // The rising edge happened up to one sampling period ago. Shift the
        // sample points so both halves of every cell are hit for any latency.
        self.clock.delay_us((HALF_BIT_US - self.sample_us) / 2);

        let mut bits = 0u64;
        for index in 0..WIRE_BITS {
            let first = self.line()?;
            self.clock.delay_us(HALF_BIT_US);
            let second = self.line()?;
            if index + 1 < WIRE_BITS {
                self.clock.delay_us(HALF_BIT_US);
            }

            let bit = match (first, second) {
                (true, false) => 1,
                (false, true) => 0,
                _ => {
                    trace!(bit = index, first, second, "No mid-bit transition");
                    return Err(WireError::Signal { bit: index as u8 });
                }
            };
            bits = bits << 1 | bit;
        }

        Ok(WireBits(bits))
    }
}

#[async_trait]
impl<I, O, C> Transceiver for ManchesterTransceiver<I, O, C>
where
    I: InputPin + Send,
    O: OutputPin + Send,
    C: BitClock,
{
    async fn send(&mut self, frame: Frame) -> Result<()> {
        self.transmit_bits(codec::to_wire(frame))
    }

    async fn receive(&mut self, deadline: Instant) -> Result<WireBits> {
        let budget = deadline.saturating_duration_since(Instant::now());
        self.sample_bits(budget.as_micros() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Mutex};

    use embedded_hal::digital::ErrorType;

    use crate::codec::encode;
    use crate::data::{DataId, MsgType};

    #[derive(Clone, Default)]
    struct VirtualClock(Arc<AtomicU64>);

    impl VirtualClock {
        fn now_ns(&self) -> u64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    impl DelayNs for VirtualClock {
        fn delay_ns(&mut self, ns: u32) {
            self.0.fetch_add(u64::from(ns), Ordering::SeqCst);
        }
    }

    impl BitClock for VirtualClock {
        fn now_us(&mut self) -> u64 {
            self.now_ns() / 1000
        }
    }

    struct RecordingPin {
        clock: VirtualClock,
        edges: Arc<Mutex<Vec<(u64, bool)>>>,
    }

    impl ErrorType for RecordingPin {
        type Error = Infallible;
    }

    impl OutputPin for RecordingPin {
        fn set_low(&mut self) -> std::result::Result<(), Infallible> {
            self.edges.lock().unwrap().push((self.clock.now_ns(), false));
            Ok(())
        }

        fn set_high(&mut self) -> std::result::Result<(), Infallible> {
            self.edges.lock().unwrap().push((self.clock.now_ns(), true));
            Ok(())
        }
    }

    /// Plays back a list of (time in ns, level) edges; low before the first
    struct WaveformPin {
        clock: VirtualClock,
        edges: Vec<(u64, bool)>,
    }

    impl ErrorType for WaveformPin {
        type Error = Infallible;
    }

    impl InputPin for WaveformPin {
        fn is_high(&mut self) -> std::result::Result<bool, Infallible> {
            let now = self.clock.now_ns();
            Ok(self
                .edges
                .iter()
                .take_while(|(at, _)| *at <= now)
                .last()
                .map(|(_, level)| *level)
                .unwrap_or(false))
        }

        fn is_low(&mut self) -> std::result::Result<bool, Infallible> {
            self.is_high().map(|high| !high)
        }
    }

    fn waveform(bits: WireBits, start_ns: u64) -> Vec<(u64, bool)> {
        let mut edges = Vec::new();
        for index in 0..WIRE_BITS {
            let at = start_ns + u64::from(index) * 1_000_000;
            let one = bits.bit(index);
            edges.push((at, one));
            edges.push((at + 500_000, !one));
        }
        edges.push((start_ns + u64::from(WIRE_BITS) * 1_000_000, false));
        edges
    }

    fn receiver(
        edges: Vec<(u64, bool)>,
    ) -> (ManchesterTransceiver<WaveformPin, RecordingPin, VirtualClock>, VirtualClock) {
        let clock = VirtualClock::default();
        let input = WaveformPin {
            clock: clock.clone(),
            edges,
        };
        let output = RecordingPin {
            clock: clock.clone(),
            edges: Arc::default(),
        };
        let transceiver = ManchesterTransceiver::new(input, output, clock.clone()).unwrap();
        (transceiver, clock)
    }

    #[tokio::test]
    async fn test_receive_decodes_frame() {
        let frame = encode(MsgType::ReadAck, DataId::BOILER_TEMP, 0x3A80);
        for start_ns in [5_000_000, 5_100_000, 5_320_000] {
            let (mut transceiver, _) = receiver(waveform(codec::to_wire(frame), start_ns));
            let bits = transceiver
                .receive(Instant::now() + Duration::from_millis(40))
                .await
                .unwrap();
            assert_eq!(codec::decode(bits), Ok(frame));
        }
    }

    #[tokio::test]
    async fn test_receive_times_out_on_idle_line() {
        let (mut transceiver, clock) = receiver(Vec::new());
        let result = transceiver
            .receive(Instant::now() + Duration::from_millis(40))
            .await;
        assert_eq!(result, Err(WireError::FrameTimeout));
        assert!(clock.now_ns() >= 40_000_000);
    }

    #[tokio::test]
    async fn test_receive_rejects_missing_transition() {
        let (mut transceiver, _) = receiver(vec![(1_000_000, true)]);
        let result = transceiver
            .receive(Instant::now() + Duration::from_millis(40))
            .await;
        assert_eq!(result, Err(WireError::Signal { bit: 0 }));
    }

    #[tokio::test]
    async fn test_receive_reports_bad_cell_index() {
        let frame = encode(MsgType::ReadAck, DataId::RETURN_TEMP, 0x2800);
        let mut edges = waveform(codec::to_wire(frame), 2_000_000);
        // Hold the second half of cell 10 at the first half's level
        let cell = 10usize;
        edges[cell * 2 + 1].1 = edges[cell * 2].1;
        let (mut transceiver, _) = receiver(edges);
        let result = transceiver
            .receive(Instant::now() + Duration::from_millis(40))
            .await;
        assert_eq!(result, Err(WireError::Signal { bit: 10 }));
    }

    #[tokio::test]
    async fn test_send_loopback() {
        let frame = encode(MsgType::WriteData, DataId::CONTROL_SETPOINT, 0x2D80);

        let clock = VirtualClock::default();
        let recorded = Arc::new(Mutex::new(Vec::new()));
        let output = RecordingPin {
            clock: clock.clone(),
            edges: recorded.clone(),
        };
        let input = WaveformPin {
            clock: clock.clone(),
            edges: Vec::new(),
        };
        let mut transmitter = ManchesterTransceiver::new(input, output, clock.clone()).unwrap();
        assert_eq!(recorded.lock().unwrap().as_slice(), &[(0, false)]);
        transmitter.send(frame).await.unwrap();

        let frame_time = u64::from(2 * IDLE_GUARD_BITS + WIRE_BITS) * 1_000_000;
        assert_eq!(clock.now_ns(), frame_time);

        let edges = recorded.lock().unwrap().clone();
        let (mut receiver, _) = receiver(edges);
        let bits = receiver
            .receive(Instant::now() + Duration::from_millis(40))
            .await
            .unwrap();
        assert_eq!(codec::decode(bits), Ok(frame));
    }

    #[test]
    fn test_sample_interval_is_capped() {
        let (transceiver, _) = receiver(Vec::new());
        let transceiver = transceiver.with_sample_interval(2_000);
        assert_eq!(transceiver.sample_us, HALF_BIT_US - 1);
    }

    #[test]
    fn test_spin_clock_advances() {
        let mut clock = SpinClock::new();
        let before = clock.now_us();
        clock.delay_us(200);
        assert!(clock.now_us() >= before + 200);
    }
}
