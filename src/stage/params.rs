// In: src/stage/params.rs

//! Typed parameter schemas, value coercion and parameter tuning.
//!
//! A stage declares its parameters as a list of [`ParamSpec`]s. The user's raw
//! configuration map is bound against that schema once, before any stage runs, so
//! a misspelled key or an unparsable value aborts the pipeline up front.
//!
//! A string value containing `;` declares a *tuning set*: the stage is executed once
//! per value (or once per combination when several parameters are tuned) and every
//! output gains one leading axis per tuned parameter.

use std::collections::BTreeMap;
use std::fmt;

use num_traits::ToPrimitive;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{PipelineError, Result};

/// The separator that turns a string value into a tuning set.
pub const TUNING_SEPARATOR: char = ';';
/// The separator of a `start:stop:step` range entry inside a tuning set.
pub const RANGE_SEPARATOR: char = ':';
/// The most values a single tuning set may hold.
pub const MAX_TUNING_VALUES: usize = 10_000;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    Int,
    Float,
    Bool,
    Str,
    IntList,
    FloatList,
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ParamType::Int => "an integer",
            ParamType::Float => "a float",
            ParamType::Bool => "a boolean",
            ParamType::Str => "a string",
            ParamType::IntList => "a list of integers",
            ParamType::FloatList => "a list of floats",
        };
        f.write_str(s)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    IntList(Vec<i64>),
    FloatList(Vec<f64>),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(v) => write!(f, "{}", v),
            ParamValue::Int(v) => write!(f, "{}", v),
            ParamValue::Float(v) => write!(f, "{}", v),
            ParamValue::Str(v) => f.write_str(v),
            ParamValue::IntList(v) => write!(f, "{:?}", v),
            ParamValue::FloatList(v) => write!(f, "{:?}", v),
        }
    }
}

/// One declared parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamSpec {
    pub name: String,
    pub ty: ParamType,
    /// `None` marks a required parameter.
    pub default: Option<ParamValue>,
    pub description: String,
    /// Whether a `;` value set may tune this parameter. Parameters that change
    /// output shapes must stay fixed across runs.
    pub tunable: bool,
}

impl ParamSpec {
    pub fn new(name: &str, ty: ParamType, default: ParamValue, description: &str) -> Self {
        Self {
            name: name.to_string(),
            ty,
            default: Some(default),
            description: description.to_string(),
            tunable: true,
        }
    }

    pub fn required(name: &str, ty: ParamType, description: &str) -> Self {
        Self {
            name: name.to_string(),
            ty,
            default: None,
            description: description.to_string(),
            tunable: true,
        }
    }

    /// Marks the parameter as fixed: a tuning set for it is rejected at bind time.
    pub fn fixed(mut self) -> Self {
        self.tunable = false;
        self
    }
}

//==================================================================================
// Bound Parameters
//==================================================================================

/// A stage's bound parameters. Tuned parameters hold their whole value set in
/// `tuned` and their first value in `values`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Parameters {
    stage: String,
    values: BTreeMap<String, ParamValue>,
    tuned: Vec<(String, Vec<ParamValue>)>,
}

/// Binds `raw` against `schema`. Unknown keys, uncoercible values and missing
/// required parameters are configuration errors.
pub fn bind(stage: &str, schema: &[ParamSpec], raw: &Map<String, Value>) -> Result<Parameters> {
    if let Some(unknown) = raw.keys().find(|key| !schema.iter().any(|spec| &spec.name == *key)) {
        return Err(PipelineError::UnknownParameter {
            stage: stage.to_string(),
            name: unknown.clone(),
        });
    }

    let mut params = Parameters {
        stage: stage.to_string(),
        ..Parameters::default()
    };
    // Schema order fixes the nesting order of tuned parameters.
    for spec in schema {
        match raw.get(&spec.name) {
            Some(Value::String(s)) if s.contains(TUNING_SEPARATOR) => {
                if !spec.tunable {
                    return Err(PipelineError::InvalidTuning {
                        name: spec.name.clone(),
                        reason: format!("'{}' cannot be tuned", spec.name),
                    });
                }
                let set = parse_tuning_set(&spec.name, spec.ty, s)?;
                params.values.insert(spec.name.clone(), set[0].clone());
                params.tuned.push((spec.name.clone(), set));
            }
            Some(value) => {
                params
                    .values
                    .insert(spec.name.clone(), coerce(&spec.name, spec.ty, value)?);
            }
            None => match &spec.default {
                Some(default) => {
                    params.values.insert(spec.name.clone(), default.clone());
                }
                None => return Err(PipelineError::MissingParameter(spec.name.clone())),
            },
        }
    }
    Ok(params)
}

impl Parameters {
    /// An empty parameter set, for stages that declare no parameters.
    pub fn empty(stage: &str) -> Self {
        Self {
            stage: stage.to_string(),
            ..Self::default()
        }
    }

    pub fn stage(&self) -> &str {
        &self.stage
    }

    pub fn is_tuned(&self) -> bool {
        !self.tuned.is_empty()
    }

    pub fn tuned_names(&self) -> impl Iterator<Item = &str> {
        self.tuned.iter().map(|(name, _)| name.as_str())
    }

    /// The number of virtual runs: the product of all tuning set sizes.
    pub fn run_count(&self) -> usize {
        self.tuned.iter().map(|(_, set)| set.len()).product()
    }

    /// The extra leading output dimensions, one per tuned parameter.
    pub fn tuning_shape(&self) -> Vec<usize> {
        self.tuned.iter().map(|(_, set)| set.len()).collect()
    }

    /// The multi-index of `run` within [`tuning_shape`](Self::tuning_shape), first
    /// tuned parameter slowest.
    pub fn tuning_index(&self, run: usize) -> Vec<usize> {
        let mut index = vec![0; self.tuned.len()];
        let mut rest = run;
        for (slot, (_, set)) in index.iter_mut().zip(&self.tuned).rev() {
            *slot = rest % set.len();
            rest /= set.len();
        }
        index
    }

    /// The concrete parameters of virtual run `run`: every tuned parameter takes its
    /// value for that run, every other parameter is unchanged.
    pub fn for_run(&self, run: usize) -> Result<Parameters> {
        if run >= self.run_count() {
            return Err(PipelineError::InvalidTuning {
                name: self.stage.clone(),
                reason: format!("run {} is out of range for {} runs", run, self.run_count()),
            });
        }
        let mut values = self.values.clone();
        for ((name, set), i) in self.tuned.iter().zip(self.tuning_index(run)) {
            values.insert(name.clone(), set[i].clone());
        }
        Ok(Parameters {
            stage: self.stage.clone(),
            values,
            tuned: Vec::new(),
        })
    }

    pub fn get(&self, name: &str) -> Result<&ParamValue> {
        self.values
            .get(name)
            .ok_or_else(|| PipelineError::MissingParameter(name.to_string()))
    }

    pub fn get_i64(&self, name: &str) -> Result<i64> {
        match self.get(name)? {
            ParamValue::Int(v) => Ok(*v),
            other => Err(mismatch(name, ParamType::Int, other)),
        }
    }

    pub fn get_usize(&self, name: &str) -> Result<usize> {
        let value = self.get_i64(name)?;
        value
            .to_usize()
            .ok_or_else(|| mismatch(name, ParamType::Int, &ParamValue::Int(value)))
    }

    /// Floats, with integers widened.
    pub fn get_f64(&self, name: &str) -> Result<f64> {
        match self.get(name)? {
            ParamValue::Float(v) => Ok(*v),
            ParamValue::Int(v) => Ok(*v as f64),
            other => Err(mismatch(name, ParamType::Float, other)),
        }
    }

    pub fn get_bool(&self, name: &str) -> Result<bool> {
        match self.get(name)? {
            ParamValue::Bool(v) => Ok(*v),
            other => Err(mismatch(name, ParamType::Bool, other)),
        }
    }

    pub fn get_str(&self, name: &str) -> Result<&str> {
        match self.get(name)? {
            ParamValue::Str(v) => Ok(v),
            other => Err(mismatch(name, ParamType::Str, other)),
        }
    }

    pub fn get_i64_list(&self, name: &str) -> Result<&[i64]> {
        match self.get(name)? {
            ParamValue::IntList(v) => Ok(v),
            other => Err(mismatch(name, ParamType::IntList, other)),
        }
    }

    pub fn get_f64_list(&self, name: &str) -> Result<Vec<f64>> {
        match self.get(name)? {
            ParamValue::FloatList(v) => Ok(v.clone()),
            ParamValue::IntList(v) => Ok(v.iter().map(|&x| x as f64).collect()),
            other => Err(mismatch(name, ParamType::FloatList, other)),
        }
    }
}

fn mismatch(name: &str, expected: ParamType, value: &dyn fmt::Display) -> PipelineError {
    PipelineError::TypeMismatch {
        name: name.to_string(),
        expected: expected.to_string(),
        value: value.to_string(),
    }
}

//==================================================================================
// Coercion
//==================================================================================

/// Coerces one raw JSON value into `ty`.
pub fn coerce(name: &str, ty: ParamType, value: &Value) -> Result<ParamValue> {
    let coerced = match ty {
        ParamType::Int => coerce_int(value).map(ParamValue::Int),
        ParamType::Float => coerce_float(value).map(ParamValue::Float),
        ParamType::Bool => match value {
            Value::Bool(b) => Some(*b),
            Value::String(s) if s.trim().eq_ignore_ascii_case("true") => Some(true),
            Value::String(s) if s.trim().eq_ignore_ascii_case("false") => Some(false),
            _ => None,
        }
        .map(ParamValue::Bool),
        ParamType::Str => match value {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
        .map(ParamValue::Str),
        ParamType::IntList => list_items(value)
            .and_then(|items| items.iter().map(coerce_int).collect::<Option<Vec<_>>>())
            .map(ParamValue::IntList),
        ParamType::FloatList => list_items(value)
            .and_then(|items| items.iter().map(coerce_float).collect::<Option<Vec<_>>>())
            .map(ParamValue::FloatList),
    };
    coerced.ok_or_else(|| mismatch(name, ty, &display_raw(value)))
}

fn display_raw(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Integral numbers, and strings that parse as one.
fn coerce_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().and_then(integral)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().and_then(integral))
        }
        _ => None,
    }
}

fn integral(f: f64) -> Option<i64> {
    if f.fract() == 0.0 {
        f.to_i64()
    } else {
        None
    }
}

fn coerce_float(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// The items of a JSON array, or of a comma-delimited string with optional
/// surrounding brackets.
fn list_items(value: &Value) -> Option<Vec<Value>> {
    match value {
        Value::Array(items) => Some(items.clone()),
        Value::String(s) => {
            let s = s.trim();
            let inner = s
                .strip_prefix('[')
                .and_then(|rest| rest.strip_suffix(']'))
                .unwrap_or(s);
            Some(
                inner
                    .split(',')
                    .map(str::trim)
                    .filter(|item| !item.is_empty())
                    .map(|item| Value::String(item.to_string()))
                    .collect(),
            )
        }
        _ => None,
    }
}

//==================================================================================
// Tuning Sets
//==================================================================================

fn parse_tuning_set(name: &str, ty: ParamType, raw: &str) -> Result<Vec<ParamValue>> {
    let invalid = |reason: String| PipelineError::InvalidTuning {
        name: name.to_string(),
        reason,
    };

    let mut set = Vec::new();
    for entry in raw.split(TUNING_SEPARATOR).map(str::trim).filter(|e| !e.is_empty()) {
        let is_numeric = matches!(ty, ParamType::Int | ParamType::Float);
        if is_numeric && entry.contains(RANGE_SEPARATOR) {
            set.extend(expand_range(name, ty, entry)?);
        } else {
            set.push(coerce(name, ty, &Value::String(entry.to_string()))?);
        }
    }

    if set.is_empty() {
        return Err(invalid(format!("'{}' yields no values", raw)));
    }
    if set.len() > MAX_TUNING_VALUES {
        return Err(invalid(format!("'{}' yields more than {} values", raw, MAX_TUNING_VALUES)));
    }
    Ok(set)
}

/// Expands `start:stop:step` into the progression `[start, stop)`.
fn expand_range(name: &str, ty: ParamType, entry: &str) -> Result<Vec<ParamValue>> {
    let invalid = |reason: String| PipelineError::InvalidTuning {
        name: name.to_string(),
        reason,
    };

    let parts: Vec<&str> = entry.split(RANGE_SEPARATOR).map(str::trim).collect();
    let [start, stop, step] = parts.as_slice() else {
        return Err(invalid(format!("range '{}' must be start:stop:step", entry)));
    };
    let parse = |s: &str| {
        s.parse::<f64>()
            .map_err(|_| invalid(format!("'{}' in range '{}' is not a number", s, entry)))
    };
    let (start, stop, step) = (parse(*start)?, parse(*stop)?, parse(*step)?);
    if step == 0.0 {
        return Err(invalid(format!("range '{}' has a zero step", entry)));
    }

    let span = ((stop - start) / step).ceil();
    if !span.is_finite() || span > MAX_TUNING_VALUES as f64 {
        return Err(invalid(format!(
            "range '{}' expands to more than {} values",
            entry, MAX_TUNING_VALUES
        )));
    }
    let count = span.to_usize().unwrap_or(0);
    if count == 0 {
        return Err(invalid(format!("range '{}' is empty", entry)));
    }

    (0..count)
        .map(|k| {
            let value = start + k as f64 * step;
            match ty {
                ParamType::Int => integral(value)
                    .map(ParamValue::Int)
                    .ok_or_else(|| mismatch(name, ty, &value)),
                _ => Ok(ParamValue::Float(value)),
            }
        })
        .collect()
}
