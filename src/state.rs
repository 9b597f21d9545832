//! The shared rocket state snapshot and its wire and storage encodings.
//!
//! Every section is encoded little-endian and tightly packed. A section on
//! its own is the payload of one telemetry message; the whole snapshot is
//! padded with zeros to a fixed-size flash record.

use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;
use scroll::ctx::{SizeWith, TryIntoCtx};
use scroll::{Endian, LE, Pread, Pwrite, SizeWith};

use crate::constants::{STATE_RECORD_LEN, message_ids};
use crate::protocol::Message;

/// Flight state value while the rocket sits on the pad.
pub const FLIGHT_STATE_PAD: u8 = 1;

#[derive(Clone, Copy, Debug, Default, PartialEq, Pread, Pwrite, SizeWith)]
pub struct StateVector {
    pub timestamp: u32,
    pub velocity_x: f32,
    pub velocity_y: f32,
    pub velocity_z: f32,
    pub attitude_w: f32,
    pub attitude_x: f32,
    pub attitude_y: f32,
    pub attitude_z: f32,
    pub position_x: f32,
    pub position_y: f32,
    pub position_z: f32,
    pub world_x: f32,
    pub world_y: f32,
    pub world_z: f32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Pread, Pwrite, SizeWith)]
pub struct ServoDeflection {
    pub timestamp: u32,
    pub servo_deflection_1: f32,
    pub servo_deflection_2: f32,
    pub servo_deflection_3: f32,
    pub servo_deflection_4: f32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pread, Pwrite, SizeWith)]
pub struct FlightState {
    pub timestamp: u32,
    pub state: u8,
    pub firing_channel_1: u8,
    pub firing_channel_2: u8,
    pub firing_channel_3: u8,
}

/// Diagonal of the process noise matrix of the on-pad filter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Pread, Pwrite, SizeWith)]
pub struct GroundEkf {
    pub timestamp: u32,
    pub pn_matrix_d1: f32,
    pub pn_matrix_d2: f32,
    pub pn_matrix_d3: f32,
    pub pn_matrix_d4: f32,
    pub pn_matrix_d5: f32,
    pub pn_matrix_d6: f32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Pread, Pwrite, SizeWith)]
pub struct SensorData {
    pub timestamp: u32,
    pub accelerometer_x: f32,
    pub accelerometer_y: f32,
    pub accelerometer_z: f32,
    pub gyro_x: f32,
    pub gyro_y: f32,
    pub gyro_z: f32,
    pub gps_x: f32,
    pub gps_y: f32,
    pub gps_z: f32,
}

/// Raw ADC readings.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pread, Pwrite, SizeWith)]
pub struct AnalogFeedback {
    pub timestamp: u32,
    pub current_fb_33: u16,
    pub pyro_0_cont: u16,
    pub pyro_1_cont: u16,
    pub pyro_2_cont: u16,
    pub pyro_channel_deploy: u8,
}

/// A snapshot section that travels as one telemetry message.
pub trait Section: Copy + SizeWith<Endian> + TryIntoCtx<Endian, Error = scroll::Error> {
    const MESSAGE_ID: u8;

    fn timestamp_mut(&mut self) -> &mut u32;

    fn to_message(self) -> Result<Message, scroll::Error> {
        let mut payload = vec![0u8; Self::size_with(&LE)];
        payload.pwrite_with(self, 0, LE)?;
        Ok(Message::new(Self::MESSAGE_ID, payload))
    }
}

macro_rules! impl_section {
    ($($ty:ty => $id:expr),* $(,)?) => {
        $(
            impl Section for $ty {
                const MESSAGE_ID: u8 = $id;

                fn timestamp_mut(&mut self) -> &mut u32 {
                    &mut self.timestamp
                }
            }
        )*
    };
}

impl_section! {
    StateVector => message_ids::STATE_VECTOR,
    ServoDeflection => message_ids::SERVO_DEFLECTION,
    FlightState => message_ids::FLIGHT_STATE,
    GroundEkf => message_ids::GROUND_EKF,
    SensorData => message_ids::SENSOR_DATA,
    AnalogFeedback => message_ids::ANALOG_FEEDBACK,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RocketState {
    pub state_vector: StateVector,
    pub servo_deflection: ServoDeflection,
    pub flight_state: FlightState,
    pub ground_ekf: GroundEkf,
    pub sensor_data: SensorData,
    pub analog_feedback: AnalogFeedback,
    pub launch_timestamp: u64,
}

impl RocketState {
    /// Serializes the snapshot into one flash record.
    pub fn to_record(&self) -> Result<[u8; STATE_RECORD_LEN], scroll::Error> {
        let mut record = [0u8; STATE_RECORD_LEN];
        let buf = &mut record[..];
        let offset = &mut 0;
        buf.gwrite_with(self.state_vector, offset, LE)?;
        buf.gwrite_with(self.servo_deflection, offset, LE)?;
        buf.gwrite_with(self.flight_state, offset, LE)?;
        buf.gwrite_with(self.ground_ekf, offset, LE)?;
        buf.gwrite_with(self.sensor_data, offset, LE)?;
        buf.gwrite_with(self.analog_feedback, offset, LE)?;
        buf.gwrite_with(self.launch_timestamp, offset, LE)?;
        Ok(record)
    }

    pub fn from_record(record: &[u8]) -> Result<Self, scroll::Error> {
        let offset = &mut 0;
        Ok(RocketState {
            state_vector: record.gread_with(offset, LE)?,
            servo_deflection: record.gread_with(offset, LE)?,
            flight_state: record.gread_with(offset, LE)?,
            ground_ekf: record.gread_with(offset, LE)?,
            sensor_data: record.gread_with(offset, LE)?,
            analog_feedback: record.gread_with(offset, LE)?,
            launch_timestamp: record.gread_with(offset, LE)?,
        })
    }

    pub fn is_on_pad(&self) -> bool {
        self.flight_state.state == FLIGHT_STATE_PAD
    }
}

/// The process-wide state, guarded by a mutex. Readers only ever get copies.
#[derive(Clone, Default)]
pub struct SharedState {
    inner: Arc<Mutex<RocketState>>,
}

impl SharedState {
    pub fn new(initial: RocketState) -> Self {
        Self {
            inner: Arc::new(Mutex::new(initial)),
        }
    }

    pub fn snapshot(&self) -> RocketState {
        *self.inner.lock()
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut RocketState) -> R) -> R {
        f(&mut self.inner.lock())
    }
}

/// Random-walk state source standing in for the estimator and sensors.
pub struct Simulator<R> {
    rng: R,
}

impl Simulator<rand::rngs::ThreadRng> {
    pub fn new() -> Self {
        Self { rng: rand::rng() }
    }
}

impl<R: Rng> Simulator<R> {
    pub fn with_rng(rng: R) -> Self {
        Self { rng }
    }

    fn walk(&mut self, value: &mut f32, step: f32) {
        *value += self.rng.random_range(-step..=step);
    }

    /// Advances `state` by one tick.
    pub fn step(&mut self, state: &mut RocketState) {
        let sv = &mut state.state_vector;
        for v in [&mut sv.velocity_x, &mut sv.velocity_y, &mut sv.velocity_z] {
            self.walk(v, 0.05);
        }
        for p in [&mut sv.position_x, &mut sv.position_y, &mut sv.position_z] {
            self.walk(p, 0.01);
        }
        sv.world_x = sv.position_x;
        sv.world_y = sv.position_y;
        sv.world_z = sv.position_z;

        // Small rotation noise on a unit quaternion
        let mut q = [sv.attitude_w, sv.attitude_x, sv.attitude_y, sv.attitude_z];
        if q.iter().all(|c| *c == 0.0) {
            q[0] = 1.0;
        }
        for c in q.iter_mut().skip(1) {
            self.walk(c, 0.002);
        }
        let norm = q.iter().map(|c| c * c).sum::<f32>().sqrt();
        [sv.attitude_w, sv.attitude_x, sv.attitude_y, sv.attitude_z] = q.map(|c| c / norm);

        let sd = &mut state.sensor_data;
        sd.accelerometer_x = self.rng.random_range(-0.2..=0.2);
        sd.accelerometer_y = self.rng.random_range(-0.2..=0.2);
        sd.accelerometer_z = 9.81 + self.rng.random_range(-0.2f32..=0.2);
        sd.gyro_x = self.rng.random_range(-0.01..=0.01);
        sd.gyro_y = self.rng.random_range(-0.01..=0.01);
        sd.gyro_z = self.rng.random_range(-0.01..=0.01);
        sd.gps_x = state.state_vector.position_x;
        sd.gps_y = state.state_vector.position_y;
        sd.gps_z = state.state_vector.position_z;

        let af = &mut state.analog_feedback;
        af.current_fb_33 = self.rng.random_range(1200..1300);
        af.pyro_0_cont = self.rng.random_range(3000..3100);
        af.pyro_1_cont = self.rng.random_range(3000..3100);
        af.pyro_2_cont = self.rng.random_range(3000..3100);

        if state.flight_state.state == 0 {
            state.flight_state.state = FLIGHT_STATE_PAD;
        }
    }
}

impl Default for Simulator<rand::rngs::ThreadRng> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn sample() -> RocketState {
        let mut state = RocketState::default();
        state.state_vector.velocity_z = 12.5;
        state.state_vector.attitude_w = 1.0;
        state.servo_deflection.servo_deflection_3 = -0.25;
        state.flight_state = FlightState {
            timestamp: 1200,
            state: 2,
            firing_channel_1: 1,
            firing_channel_2: 0,
            firing_channel_3: 0,
        };
        state.ground_ekf.pn_matrix_d6 = 1e-4;
        state.sensor_data.gps_y = -71.25;
        state.analog_feedback.pyro_2_cont = 0xabcd;
        state.analog_feedback.pyro_channel_deploy = 3;
        state.launch_timestamp = 0x0102_0304_0506_0708;
        state
    }

    #[test]
    fn test_section_sizes() {
        assert_eq!(StateVector::size_with(&LE), 56);
        assert_eq!(ServoDeflection::size_with(&LE), 20);
        assert_eq!(FlightState::size_with(&LE), 8);
        assert_eq!(GroundEkf::size_with(&LE), 28);
        assert_eq!(SensorData::size_with(&LE), 40);
        assert_eq!(AnalogFeedback::size_with(&LE), 13);
    }

    #[test]
    fn test_record_layout() {
        let record = sample().to_record().unwrap();
        // flight state section starts after the state vector and servos
        assert_eq!(&record[76..84], &[0xb0, 0x04, 0x00, 0x00, 2, 1, 0, 0]);
        // launch timestamp follows the last section, then zero padding
        assert_eq!(&record[165..173], &0x0102_0304_0506_0708u64.to_le_bytes());
        assert!(record[173..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_record_round_trip() {
        let state = sample();
        let record = state.to_record().unwrap();
        assert_eq!(RocketState::from_record(&record).unwrap(), state);
    }

    #[test]
    fn test_short_record_rejected() {
        assert!(RocketState::from_record(&[0u8; 100]).is_err());
    }

    #[test]
    fn test_section_message() {
        let state = sample();
        let message = state.flight_state.to_message().unwrap();
        assert_eq!(message.id, message_ids::FLIGHT_STATE);
        assert_eq!(message.payload, [0xb0, 0x04, 0x00, 0x00, 2, 1, 0, 0]);

        let message = state.analog_feedback.to_message().unwrap();
        assert_eq!(message.id, message_ids::ANALOG_FEEDBACK);
        assert_eq!(message.payload.len(), 13);
        assert_eq!(&message.payload[10..13], &[0xcd, 0xab, 3]);
    }

    #[test]
    fn test_shared_state_hands_out_copies() {
        let shared = SharedState::default();
        let mut copy = shared.snapshot();
        copy.launch_timestamp = 99;
        assert_eq!(shared.snapshot().launch_timestamp, 0);

        shared.update(|s| s.launch_timestamp = 42);
        assert_eq!(shared.snapshot().launch_timestamp, 42);
    }

    #[test]
    fn test_simulator_keeps_attitude_normalised() {
        let mut sim = Simulator::with_rng(StdRng::seed_from_u64(7));
        let mut state = RocketState::default();
        for _ in 0..100 {
            sim.step(&mut state);
        }
        let sv = state.state_vector;
        let norm = (sv.attitude_w.powi(2)
            + sv.attitude_x.powi(2)
            + sv.attitude_y.powi(2)
            + sv.attitude_z.powi(2))
        .sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
        assert!(state.is_on_pad());
    }
}
