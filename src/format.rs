//! Text formats: CSV export of recorded states, hex input.
use std::fmt::Write;
use std::path::Path;

use anyhow::Result;

use crate::state::RocketState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InputFormat {
    PlainHex,
    Binary,
}

/// Reads bytes from `arg`: a file (hex text or raw binary), or a hex string.
pub fn read_input(arg: &str) -> Result<Vec<u8>> {
    let path = Path::new(arg);
    if !path.is_file() {
        return read_hex(arg);
    }

    let raw = std::fs::read(path)?;
    let format = guess_format(&raw);
    log::info!("Read {} as {:?} format", path.display(), format);
    match format {
        InputFormat::PlainHex => read_hex(std::str::from_utf8(&raw)?),
        InputFormat::Binary => Ok(raw),
    }
}

pub fn guess_format(raw: &[u8]) -> InputFormat {
    if !raw.is_empty()
        && raw
            .iter()
            .all(|&c| c.is_ascii_hexdigit() || c.is_ascii_whitespace())
    {
        InputFormat::PlainHex
    } else {
        InputFormat::Binary
    }
}

/// Decodes hex, ignoring whitespace and `:` or `,` separators.
pub fn read_hex(data: &str) -> Result<Vec<u8>> {
    let digits: String = data
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':' && *c != ',')
        .collect();
    Ok(hex::decode(digits)?)
}

/// Renders one recorded state as a CSV line, newline included.
///
/// Column order: launch timestamp, then every section in record order, each
/// starting with its own timestamp.
pub fn to_csv_line(state: &RocketState) -> String {
    fn push_int(line: &mut String, v: u64) {
        let _ = write!(line, "{},", v);
    }
    fn push_float(line: &mut String, v: f32) {
        let _ = write!(line, "{:.6},", v);
    }

    let mut line = String::with_capacity(512);
    // Exported as 32 bits, like every section timestamp
    push_int(&mut line, state.launch_timestamp as u32 as u64);

    let sv = &state.state_vector;
    push_int(&mut line, sv.timestamp as u64);
    for v in [
        sv.velocity_x,
        sv.velocity_y,
        sv.velocity_z,
        sv.attitude_w,
        sv.attitude_x,
        sv.attitude_y,
        sv.attitude_z,
        sv.position_x,
        sv.position_y,
        sv.position_z,
        sv.world_x,
        sv.world_y,
        sv.world_z,
    ] {
        push_float(&mut line, v);
    }

    let servo = &state.servo_deflection;
    push_int(&mut line, servo.timestamp as u64);
    for v in [
        servo.servo_deflection_1,
        servo.servo_deflection_2,
        servo.servo_deflection_3,
        servo.servo_deflection_4,
    ] {
        push_float(&mut line, v);
    }

    let fs = &state.flight_state;
    for v in [
        fs.timestamp as u64,
        fs.state as u64,
        fs.firing_channel_1 as u64,
        fs.firing_channel_2 as u64,
        fs.firing_channel_3 as u64,
    ] {
        push_int(&mut line, v);
    }

    let ekf = &state.ground_ekf;
    push_int(&mut line, ekf.timestamp as u64);
    for v in [
        ekf.pn_matrix_d1,
        ekf.pn_matrix_d2,
        ekf.pn_matrix_d3,
        ekf.pn_matrix_d4,
        ekf.pn_matrix_d5,
        ekf.pn_matrix_d6,
    ] {
        push_float(&mut line, v);
    }

    let sd = &state.sensor_data;
    push_int(&mut line, sd.timestamp as u64);
    for v in [
        sd.accelerometer_x,
        sd.accelerometer_y,
        sd.accelerometer_z,
        sd.gyro_x,
        sd.gyro_y,
        sd.gyro_z,
        sd.gps_x,
        sd.gps_y,
        sd.gps_z,
    ] {
        push_float(&mut line, v);
    }

    let af = &state.analog_feedback;
    for v in [
        af.timestamp as u64,
        af.current_fb_33 as u64,
        af.pyro_0_cont as u64,
        af.pyro_1_cont as u64,
        af.pyro_2_cont as u64,
        af.pyro_channel_deploy as u64,
    ] {
        push_int(&mut line, v);
    }

    // No separator after the last column
    line.pop();
    line.push('\n');
    line
}
