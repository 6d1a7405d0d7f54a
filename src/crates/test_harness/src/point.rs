use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use crate::error::{HarnessError, HarnessResult};

/// Declared scalar type of a point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PointType {
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    String,
}

/// Value read from or written to a point.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum PointValue {
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    String(String),
}

impl PointValue {
    pub fn point_type(&self) -> PointType {
        match self {
            PointValue::Int16(_) => PointType::Int16,
            PointValue::Int32(_) => PointType::Int32,
            PointValue::Int64(_) => PointType::Int64,
            PointValue::Float32(_) => PointType::Float32,
            PointValue::Float64(_) => PointType::Float64,
            PointValue::String(_) => PointType::String,
        }
    }

    /// Parse transport text into a value of the declared type.
    ///
    /// Numbers tolerate surrounding whitespace; strings are taken verbatim.
    pub fn parse(kind: PointType, raw: &str) -> HarnessResult<Self> {
        let text = raw.trim();
        let invalid = |err: &dyn fmt::Display| {
            HarnessError::transport(format!("cannot parse '{text}' as {kind:?}: {err}"))
        };
        let value = match kind {
            PointType::Int16 => PointValue::Int16(parse_integer(text).map_err(|e| invalid(&e))?),
            PointType::Int32 => PointValue::Int32(parse_integer(text).map_err(|e| invalid(&e))?),
            PointType::Int64 => PointValue::Int64(parse_integer(text).map_err(|e| invalid(&e))?),
            // Parsed straight to f32: going through f64 would round twice.
            PointType::Float32 => PointValue::Float32(text.parse().map_err(|e| invalid(&e))?),
            PointType::Float64 => PointValue::Float64(text.parse().map_err(|e| invalid(&e))?),
            PointType::String => PointValue::String(raw.to_string()),
        };
        Ok(value)
    }

    /// Equality at the declared width; floats compare bit for bit.
    pub fn same_as(&self, other: &PointValue) -> bool {
        match (self, other) {
            (PointValue::Float32(a), PointValue::Float32(b)) => a.to_bits() == b.to_bits(),
            (PointValue::Float64(a), PointValue::Float64(b)) => a.to_bits() == b.to_bits(),
            (a, b) => a == b,
        }
    }
}

/// Integer text as printed by Channel Access.
///
/// `caget -g` renders integers through a double, so `5.0` and
/// `1.0000000000000000e+17` are accepted when they denote an integer that fits `T`.
fn parse_integer<T>(text: &str) -> Result<T, String>
where
    T: std::str::FromStr + TryFrom<i64>,
{
    if let Ok(value) = text.parse::<T>() {
        return Ok(value);
    }
    let wide: f64 = text.parse().map_err(|err| format!("{err}"))?;
    // 2^63 itself is out of range for i64.
    let in_range = (-9.223_372_036_854_776e18..9.223_372_036_854_776e18).contains(&wide);
    if wide.fract() != 0.0 || !in_range {
        return Err("not an integer in range".to_string());
    }
    T::try_from(wide as i64).map_err(|_| "out of range".to_string())
}

impl fmt::Display for PointValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PointValue::Int16(v) => write!(f, "{v}"),
            PointValue::Int32(v) => write!(f, "{v}"),
            PointValue::Int64(v) => write!(f, "{v}"),
            // Display for floats is the shortest text that parses back to the same bits.
            PointValue::Float32(v) => write!(f, "{v}"),
            PointValue::Float64(v) => write!(f, "{v}"),
            PointValue::String(v) => f.write_str(v),
        }
    }
}

impl From<i16> for PointValue {
    fn from(value: i16) -> Self {
        PointValue::Int16(value)
    }
}

impl From<i32> for PointValue {
    fn from(value: i32) -> Self {
        PointValue::Int32(value)
    }
}

impl From<i64> for PointValue {
    fn from(value: i64) -> Self {
        PointValue::Int64(value)
    }
}

impl From<f32> for PointValue {
    fn from(value: f32) -> Self {
        PointValue::Float32(value)
    }
}

impl From<f64> for PointValue {
    fn from(value: f64) -> Self {
        PointValue::Float64(value)
    }
}

impl From<&str> for PointValue {
    fn from(value: &str) -> Self {
        PointValue::String(value.to_string())
    }
}

/// A named variable exposed by the controller.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Point {
    pub name: String,
    pub kind: PointType,
}

impl Point {
    pub fn new(name: impl Into<String>, kind: PointType) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?})", self.name, self.kind)
    }
}

/// Per-point connection state as seen by the point session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Point-access protocol client.
///
/// Implementations open a connection per call, bound every call by `timeout`
/// and report a connection timeout as [`HarnessError::PointUnavailable`].
pub trait PointTransport {
    /// Fetch the current value of `name` as text.
    fn get(&self, name: &str, timeout: Duration) -> HarnessResult<String>;

    /// Write `value` to `name` and wait until the controller has applied it.
    fn put(&self, name: &str, value: &str, timeout: Duration) -> HarnessResult<()>;
}

/// Typed reads and writes over a [`PointTransport`].
#[derive(Debug)]
pub struct PointSession<T> {
    transport: T,
    states: HashMap<String, ConnectionState>,
}

impl<T: PointTransport> PointSession<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            states: HashMap::new(),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Connection state of a point after the last operation on it.
    pub fn connection_state(&self, name: &str) -> ConnectionState {
        self.states.get(name).copied().unwrap_or_default()
    }

    /// Read the current value of a point.
    pub fn read(&mut self, point: &Point, timeout: Duration) -> HarnessResult<PointValue> {
        self.set_state(&point.name, ConnectionState::Connecting);
        let text = self.release_on_error(&point.name, |transport| {
            transport.get(&point.name, timeout)
        })?;
        self.set_state(&point.name, ConnectionState::Connected);
        let value = PointValue::parse(point.kind, &text);
        self.set_state(&point.name, ConnectionState::Disconnected);

        let value = value?;
        debug!(point = %point.name, %value, "read");
        Ok(value)
    }

    /// Write a value and block until the controller acknowledges it.
    pub fn write(
        &mut self,
        point: &Point,
        value: &PointValue,
        timeout: Duration,
    ) -> HarnessResult<()> {
        if value.point_type() != point.kind {
            return Err(HarnessError::precondition(format!(
                "cannot write {:?} value to {point}",
                value.point_type()
            )));
        }

        self.set_state(&point.name, ConnectionState::Connecting);
        let text = value.to_string();
        self.release_on_error(&point.name, |transport| {
            transport.put(&point.name, &text, timeout)
        })?;
        self.set_state(&point.name, ConnectionState::Disconnected);
        debug!(point = %point.name, %value, "wrote");
        Ok(())
    }

    /// Lightweight connection attempt used to detect controller readiness.
    pub fn probe(&mut self, name: &str, timeout: Duration) -> HarnessResult<()> {
        self.set_state(name, ConnectionState::Connecting);
        self.release_on_error(name, |transport| transport.get(name, timeout))?;
        self.set_state(name, ConnectionState::Disconnected);
        Ok(())
    }

    fn release_on_error<R>(
        &mut self,
        name: &str,
        op: impl FnOnce(&T) -> HarnessResult<R>,
    ) -> HarnessResult<R> {
        let result = op(&self.transport);
        if result.is_err() {
            self.set_state(name, ConnectionState::Disconnected);
        }
        result
    }

    fn set_state(&mut self, name: &str, state: ConnectionState) {
        self.states.insert(name.to_string(), state);
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;

    #[derive(Default)]
    struct MemoryTransport {
        values: RefCell<HashMap<String, String>>,
    }

    impl PointTransport for MemoryTransport {
        fn get(&self, name: &str, timeout: Duration) -> HarnessResult<String> {
            self.values
                .borrow()
                .get(name)
                .cloned()
                .ok_or_else(|| HarnessError::PointUnavailable {
                    name: name.to_string(),
                    timeout,
                })
        }

        fn put(&self, name: &str, value: &str, _timeout: Duration) -> HarnessResult<()> {
            self.values
                .borrow_mut()
                .insert(name.to_string(), value.to_string());
            Ok(())
        }
    }

    const TIMEOUT: Duration = Duration::from_millis(100);

    #[test]
    fn float32_text_round_trips_bit_for_bit() {
        let written = PointValue::Float32(-12.580238505);
        let read = PointValue::parse(PointType::Float32, &written.to_string()).unwrap();
        assert!(written.same_as(&read));

        // caget -g 17 prints the widened double.
        let widened = format!("{:.17}", -12.580238505_f32 as f64);
        let read = PointValue::parse(PointType::Float32, &widened).unwrap();
        assert!(written.same_as(&read));
    }

    #[test]
    fn integers_parse_exactly_and_reject_overflow() {
        assert_eq!(
            PointValue::parse(PointType::Int16, "-22").unwrap(),
            PointValue::Int16(-22)
        );
        assert_eq!(
            PointValue::parse(PointType::Int32, "5.0").unwrap(),
            PointValue::Int32(5)
        );
        assert!(PointValue::parse(PointType::Int16, "40000").is_err());
        assert!(PointValue::parse(PointType::Int64, "").is_err());
    }

    #[test]
    fn integers_in_exponent_form_are_accepted_when_integral() {
        assert_eq!(
            PointValue::parse(PointType::Int64, "1.0000000000000000e+17").unwrap(),
            PointValue::Int64(100_000_000_000_000_000)
        );
        assert_eq!(
            PointValue::parse(PointType::Int32, "-2.0000000000000000e+09").unwrap(),
            PointValue::Int32(-2_000_000_000)
        );
        assert!(PointValue::parse(PointType::Int32, "5.5").is_err());
        assert!(PointValue::parse(PointType::Int16, "1e5").is_err());
        assert!(PointValue::parse(PointType::Int64, "1e19").is_err());
        assert!(PointValue::parse(PointType::Int64, "NaN").is_err());
    }

    #[test]
    fn strings_keep_surrounding_whitespace() {
        assert_eq!(
            PointValue::parse(PointType::String, "  padded ").unwrap(),
            PointValue::String("  padded ".to_string())
        );
        assert_eq!(
            PointValue::parse(PointType::Float64, " 1.5 ").unwrap(),
            PointValue::Float64(1.5)
        );
    }

    #[test]
    fn missing_point_is_an_error_not_zero() {
        let mut session = PointSession::new(MemoryTransport::default());
        let point = Point::new("Missing", PointType::Int32);

        let err = session.read(&point, TIMEOUT).unwrap_err();
        assert!(matches!(err, HarnessError::PointUnavailable { .. }));
        assert_eq!(
            session.connection_state("Missing"),
            ConnectionState::Disconnected
        );
    }

    #[test]
    fn write_rejects_mismatched_width() {
        let mut session = PointSession::new(MemoryTransport::default());
        let point = Point::new("TestREAL", PointType::Float32);

        let err = session
            .write(&point, &PointValue::Float64(1.5), TIMEOUT)
            .unwrap_err();
        assert!(matches!(err, HarnessError::Precondition(_)));
    }

    #[test]
    fn write_then_read_returns_value() {
        let mut session = PointSession::new(MemoryTransport::default());
        let point = Point::new("TestDINT", PointType::Int32);

        session.write(&point, &PointValue::Int32(-7), TIMEOUT).unwrap();
        assert_eq!(session.read(&point, TIMEOUT).unwrap(), PointValue::Int32(-7));
        session.probe("TestDINT", TIMEOUT).unwrap();
    }
}
