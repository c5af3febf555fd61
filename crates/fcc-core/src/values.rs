use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValueError {
    #[error("expected {expected} values, got {actual}")]
    Arity { expected: usize, actual: usize },
    #[error("value {index}: expected {expected}, got {found}")]
    Kind {
        index: usize,
        expected: &'static str,
        found: Value,
    },
    #[error("value {index}: {found} exceeds the limit of {max}")]
    Range { index: usize, max: u64, found: u64 },
}

/// Read-only view over a fixed-arity positional value list.
#[derive(Debug, Clone, Copy)]
pub struct Positional<'a> {
    values: &'a [Value],
}

impl<'a> Positional<'a> {
    pub fn exact(values: &'a [Value], expected: usize) -> Result<Self, ValueError> {
        if values.len() != expected {
            return Err(ValueError::Arity {
                expected,
                actual: values.len(),
            });
        }
        Ok(Self { values })
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn value(&self, index: usize) -> &'a Value {
        &self.values[index]
    }

    fn kind_error(&self, index: usize, expected: &'static str) -> ValueError {
        ValueError::Kind {
            index,
            expected,
            found: self.values[index].clone(),
        }
    }

    pub fn f64(&self, index: usize) -> Result<f64, ValueError> {
        self.values[index]
            .as_f64()
            .ok_or_else(|| self.kind_error(index, "number"))
    }

    /// `null` stands for a float the device reports as not-a-number.
    pub fn opt_f64(&self, index: usize) -> Result<Option<f64>, ValueError> {
        match &self.values[index] {
            Value::Null => Ok(None),
            value => value
                .as_f64()
                .map(Some)
                .ok_or_else(|| self.kind_error(index, "number or null")),
        }
    }

    pub fn u64(&self, index: usize) -> Result<u64, ValueError> {
        self.values[index]
            .as_u64()
            .ok_or_else(|| self.kind_error(index, "unsigned integer"))
    }

    pub fn usize(&self, index: usize) -> Result<usize, ValueError> {
        self.u64(index)
            .and_then(|value| usize::try_from(value).map_err(|_| self.kind_error(index, "index")))
    }

    /// An unsigned count no larger than `max`.
    pub fn count(&self, index: usize, max: u64) -> Result<usize, ValueError> {
        let found = self.u64(index)?;
        if found > max {
            return Err(ValueError::Range { index, max, found });
        }
        usize::try_from(found).map_err(|_| self.kind_error(index, "count"))
    }

    pub fn opt_u64(&self, index: usize) -> Result<Option<u64>, ValueError> {
        match &self.values[index] {
            Value::Null => Ok(None),
            value => value
                .as_u64()
                .map(Some)
                .ok_or_else(|| self.kind_error(index, "unsigned integer or null")),
        }
    }

    /// Booleans arrive either as JSON booleans or as 0/1 from older firmware.
    pub fn bool(&self, index: usize) -> Result<bool, ValueError> {
        match &self.values[index] {
            Value::Bool(flag) => Ok(*flag),
            Value::Number(number) => match number.as_u64() {
                Some(0) => Ok(false),
                Some(1) => Ok(true),
                _ => Err(self.kind_error(index, "boolean")),
            },
            _ => Err(self.kind_error(index, "boolean")),
        }
    }

    pub fn str(&self, index: usize) -> Result<&'a str, ValueError> {
        self.values[index]
            .as_str()
            .ok_or_else(|| self.kind_error(index, "string"))
    }

    pub fn array(&self, index: usize) -> Result<&'a [Value], ValueError> {
        self.values[index]
            .as_array()
            .map(Vec::as_slice)
            .ok_or_else(|| self.kind_error(index, "array"))
    }
}

/// Encodes an optional float the way the device expects it on the wire.
pub fn nullable_f64(value: Option<f64>) -> Value {
    value.map_or(Value::Null, Value::from)
}
