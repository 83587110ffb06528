//! Simulated device state, one entry per serial number
//!
//! State is created on first reference and lives for the server process
//! lifetime (or until an explicit reset). Temperatures are kept inside
//! [-40.0, 125.0] °C; a rejected SET_TEMP never touches state.

use std::collections::HashMap;

use serde::Serialize;
use serde_json::{json, Map, Value};

use mtap_core::{ProtocolError, TEMP_MAX_C, TEMP_MIN_C};

use crate::DriftStep;

/// Battery voltage bounds for a healthy unit
pub const VBAT_MIN_V: f64 = 9.0;
pub const VBAT_MAX_V: f64 = 16.0;

/// Operating mode reported by PING
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceMode {
    Normal,
    /// A stalled reply is pending
    Busy,
    /// Last self-test failed
    Fault,
}

impl DeviceMode {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceMode::Normal => "NORMAL",
            DeviceMode::Busy => "BUSY",
            DeviceMode::Fault => "FAULT",
        }
    }
}

/// Values a freshly referenced device starts with
#[derive(Clone, Debug, PartialEq)]
pub struct DeviceDefaults {
    pub fw: String,
    pub temp_c: f64,
    pub vbat_v: f64,
}

impl Default for DeviceDefaults {
    fn default() -> Self {
        DeviceDefaults {
            fw: "1.0.0".into(),
            temp_c: 25.0,
            vbat_v: 12.0,
        }
    }
}

/// State of one simulated unit
#[derive(Clone, Debug, PartialEq)]
pub struct DeviceState {
    pub sn: String,
    pub fw: String,
    pub mode: DeviceMode,
    pub baseline_temp_c: f64,
    pub temp_c: f64,
    /// Accumulated drift on top of the baseline
    pub temp_drift_c: f64,
    pub nominal_vbat_v: f64,
    pub vbat_v: f64,
    pub vbat_drift_v: f64,
    pub cycles: u64,
    pub last_self_test_ok: bool,
    /// Replies currently held by a stall
    pending_stalls: u32,
    /// Mode to restore once the last stall ends
    mode_before_stall: DeviceMode,
}

impl DeviceState {
    fn new(sn: &str, defaults: &DeviceDefaults) -> Self {
        DeviceState {
            sn: sn.to_string(),
            fw: defaults.fw.clone(),
            mode: DeviceMode::Normal,
            baseline_temp_c: defaults.temp_c,
            temp_c: defaults.temp_c,
            temp_drift_c: 0.0,
            nominal_vbat_v: defaults.vbat_v,
            vbat_v: defaults.vbat_v,
            vbat_drift_v: 0.0,
            cycles: 0,
            last_self_test_ok: true,
            pending_stalls: 0,
            mode_before_stall: DeviceMode::Normal,
        }
    }

    /// Whether a stalled reply is pending
    pub fn is_busy(&self) -> bool {
        self.pending_stalls > 0
    }

    /// Count one processed command, accumulating drift if active
    fn advance_cycle(&mut self, drift: Option<DriftStep>) {
        self.cycles += 1;
        if let Some(step) = drift {
            self.temp_drift_c += step.temp_c;
            self.vbat_drift_v += step.vbat_v;
        }
        self.temp_c = (self.baseline_temp_c + self.temp_drift_c).clamp(TEMP_MIN_C, TEMP_MAX_C);
        self.vbat_v = (self.nominal_vbat_v + self.vbat_drift_v).clamp(VBAT_MIN_V, VBAT_MAX_V);
    }
}

/// Parse and range-check a SET_TEMP value without touching any state
pub fn validate_temp(raw: &str) -> Result<f64, ProtocolError> {
    let value: f64 = raw
        .parse()
        .map_err(|_| ProtocolError::BadArgs(format!("temp_c must be a number, got {:?}", raw)))?;

    if value.is_nan() {
        return Err(ProtocolError::BadArgs("temp_c must be a number, got NaN".into()));
    }
    if !(TEMP_MIN_C..=TEMP_MAX_C).contains(&value) {
        return Err(ProtocolError::OutOfRange(format!(
            "temp_c {} out of range [{:.1}, {:.1}]",
            raw, TEMP_MIN_C, TEMP_MAX_C
        )));
    }
    Ok(value)
}

/// All simulated units known to the server
pub struct DeviceModel {
    defaults: DeviceDefaults,
    devices: HashMap<String, DeviceState>,
}

impl DeviceModel {
    pub fn new(defaults: DeviceDefaults) -> Self {
        DeviceModel {
            defaults,
            devices: HashMap::new(),
        }
    }

    /// Get or lazily create the state for `sn`
    pub fn get_or_create(&mut self, sn: &str) -> &mut DeviceState {
        let defaults = &self.defaults;
        self.devices
            .entry(sn.to_string())
            .or_insert_with(|| DeviceState::new(sn, defaults))
    }

    pub fn get(&self, sn: &str) -> Option<&DeviceState> {
        self.devices.get(sn)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Drop every unit
    pub fn reset(&mut self) {
        self.devices.clear();
    }

    /// Whether `sn` has a stalled reply pending
    pub fn is_busy(&self, sn: &str) -> bool {
        self.devices.get(sn).map(DeviceState::is_busy).unwrap_or(false)
    }

    /// PING: `{sn, fw, mode, vbat_v}`
    pub fn ping(&mut self, sn: &str, drift: Option<DriftStep>) -> Map<String, Value> {
        let d = self.get_or_create(sn);
        d.advance_cycle(drift);
        object(json!({
            "sn": d.sn,
            "fw": d.fw,
            "mode": d.mode.as_str(),
            "vbat_v": d.vbat_v,
        }))
    }

    /// READ_TEMP: `{sn, temp_c, vbat_v, cycles}`
    pub fn read_temp(&mut self, sn: &str, drift: Option<DriftStep>) -> Map<String, Value> {
        let d = self.get_or_create(sn);
        d.advance_cycle(drift);
        object(json!({
            "sn": d.sn,
            "temp_c": d.temp_c,
            "vbat_v": d.vbat_v,
            "cycles": d.cycles,
        }))
    }

    /// SELF_TEST: `{sn, self_test_ok, cycles}`. A failure latches mode FAULT.
    pub fn self_test(
        &mut self,
        sn: &str,
        drift: Option<DriftStep>,
        forced_failure: bool,
    ) -> Map<String, Value> {
        let d = self.get_or_create(sn);
        d.advance_cycle(drift);
        d.last_self_test_ok = !forced_failure;
        d.mode = if forced_failure {
            DeviceMode::Fault
        } else {
            DeviceMode::Normal
        };
        object(json!({
            "sn": d.sn,
            "self_test_ok": d.last_self_test_ok,
            "cycles": d.cycles,
        }))
    }

    /// SET_TEMP with a value already accepted by [`validate_temp`].
    /// Resets the drift accumulator.
    pub fn set_temp(&mut self, sn: &str, temp_c: f64, drift: Option<DriftStep>) -> Map<String, Value> {
        let d = self.get_or_create(sn);
        d.advance_cycle(drift);
        d.baseline_temp_c = temp_c;
        d.temp_drift_c = 0.0;
        d.temp_c = temp_c;
        Map::new()
    }

    /// Mark a reply for `sn` as held by a stall
    pub fn begin_stall(&mut self, sn: &str) {
        let d = self.get_or_create(sn);
        if d.pending_stalls == 0 {
            d.mode_before_stall = d.mode;
            d.mode = DeviceMode::Busy;
        }
        d.pending_stalls += 1;
    }

    /// Release one stall; the pre-stall mode returns with the last one
    pub fn end_stall(&mut self, sn: &str) {
        if let Some(d) = self.devices.get_mut(sn) {
            d.pending_stalls = d.pending_stalls.saturating_sub(1);
            if d.pending_stalls == 0 && d.mode == DeviceMode::Busy {
                d.mode = d.mode_before_stall;
            }
        }
    }
}

impl Default for DeviceModel {
    fn default() -> Self {
        Self::new(DeviceDefaults::default())
    }
}

pub(crate) fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}
